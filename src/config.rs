use std::path::PathBuf;
use std::time::Duration;

use crate::bloom::{DEFAULT_BITS, DEFAULT_HASHES};
use crate::error::{LsmError, Result};

/// Tunables for an [`crate::Engine`] instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub dir_path: PathBuf,
    /// MemTable insertion count that triggers a synchronous flush.
    pub flush_threshold: usize,
    /// Resident entry count per level that triggers compaction into the
    /// next level. Counts entries, not columns — see DESIGN.md for why
    /// this departs from the source's column-count trigger.
    pub compaction_threshold: usize,
    pub bloom_bits: usize,
    pub bloom_hashes: usize,
    pub background_flush_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dir_path: PathBuf::from("./.lsmkv"),
            flush_threshold: 200,
            compaction_threshold: 200,
            bloom_bits: DEFAULT_BITS,
            bloom_hashes: DEFAULT_HASHES,
            background_flush_interval: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_threshold == 0 {
            return Err(LsmError::InvalidConfig(
                "flush_threshold must be greater than 0".into(),
            ));
        }
        if self.compaction_threshold == 0 {
            return Err(LsmError::InvalidConfig(
                "compaction_threshold must be greater than 0".into(),
            ));
        }
        if self.bloom_bits == 0 {
            return Err(LsmError::InvalidConfig(
                "bloom_bits must be greater than 0".into(),
            ));
        }
        if self.bloom_hashes == 0 {
            return Err(LsmError::InvalidConfig(
                "bloom_hashes must be greater than 0".into(),
            ));
        }
        if self.background_flush_interval.is_zero() {
            return Err(LsmError::InvalidConfig(
                "background_flush_interval must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct EngineConfigBuilder {
    dir_path: Option<PathBuf>,
    flush_threshold: Option<usize>,
    compaction_threshold: Option<usize>,
    bloom_bits: Option<usize>,
    bloom_hashes: Option<usize>,
    background_flush_interval: Option<Duration>,
}

impl EngineConfigBuilder {
    pub fn dir_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.dir_path = Some(path.into());
        self
    }

    pub fn flush_threshold(mut self, n: usize) -> Self {
        self.flush_threshold = Some(n);
        self
    }

    pub fn compaction_threshold(mut self, n: usize) -> Self {
        self.compaction_threshold = Some(n);
        self
    }

    pub fn bloom_bits(mut self, m: usize) -> Self {
        self.bloom_bits = Some(m);
        self
    }

    pub fn bloom_hashes(mut self, k: usize) -> Self {
        self.bloom_hashes = Some(k);
        self
    }

    pub fn background_flush_interval(mut self, interval: Duration) -> Self {
        self.background_flush_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        let defaults = EngineConfig::default();
        let config = EngineConfig {
            dir_path: self.dir_path.unwrap_or(defaults.dir_path),
            flush_threshold: self.flush_threshold.unwrap_or(defaults.flush_threshold),
            compaction_threshold: self
                .compaction_threshold
                .unwrap_or(defaults.compaction_threshold),
            bloom_bits: self.bloom_bits.unwrap_or(defaults.bloom_bits),
            bloom_hashes: self.bloom_hashes.unwrap_or(defaults.bloom_hashes),
            background_flush_interval: self
                .background_flush_interval
                .unwrap_or(defaults.background_flush_interval),
        };
        config.validate()?;
        Ok(config)
    }
}
