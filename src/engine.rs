//! Orchestrates MemTable/WAL/SSTables: `put`/`get`/`delete`/`query`, flush,
//! compaction, and WAL-replay recovery on open. See spec §4.5 and §5.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{info, warn};

use crate::bloom::BloomFilter;
use crate::codec::{Compressor, DeflateCompressor, Document, JsonCodec, ValueCodec};
use crate::config::EngineConfig;
use crate::error::{LsmError, Result};
use crate::memtable::MemTable;
use crate::sstable::{SsTable, StoredEntry};
use crate::wal::{Wal, WalRecord};

pub const NUM_LEVELS: usize = 3;

fn bloom_key(column: &str, key: &str) -> String {
    format!("{column}:{key}")
}

struct BackgroundHandle {
    stop: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

/// The column-family LSM engine. Construct with [`Engine::open`] (default
/// codec/compressor) or [`Engine::open_with`] to inject your own.
///
/// `op_lock` is the engine-wide mutex spec §5 requires: every public
/// operation (`put`/`get`/`delete`/`query`/`flush`) acquires it for its
/// entire duration, so the per-field mutexes below (`memtable`,
/// `tombstones`, `bloom`, each level's `SsTable`) are never actually
/// contended — they exist only because `&self` needs interior mutability
/// to reach them, not as independent critical sections.
pub struct Engine {
    op_lock: Mutex<()>,
    memtable: Mutex<MemTable>,
    tombstones: Mutex<HashMap<String, BTreeSet<String>>>,
    wal: Wal,
    levels: Vec<Mutex<SsTable>>,
    bloom: Mutex<BloomFilter>,
    codec: Arc<dyn ValueCodec>,
    compressor: Arc<dyn Compressor>,
    config: EngineConfig,
    sstable_reads: AtomicU64,
    background: Mutex<Option<BackgroundHandle>>,
}

impl Engine {
    /// Opens (creating if necessary) the database directory named by
    /// `config.dir_path`, using JSON values and DEFLATE-compressed
    /// blocks.
    pub fn open(config: EngineConfig) -> Result<Arc<Self>> {
        Self::open_with(config, Arc::new(JsonCodec), Arc::new(DeflateCompressor::default()))
    }

    /// Opens the database directory with an injected value codec and
    /// block compressor.
    pub fn open_with(
        config: EngineConfig,
        codec: Arc<dyn ValueCodec>,
        compressor: Arc<dyn Compressor>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir_path).map_err(LsmError::DirectoryInit)?;

        let mut levels = Vec::with_capacity(NUM_LEVELS);
        for i in 0..NUM_LEVELS {
            let path = config.dir_path.join(format!("sstable_{i}.db"));
            levels.push(Mutex::new(SsTable::open(&path)?));
        }

        let mut bloom = BloomFilter::new(config.bloom_bits, config.bloom_hashes);
        for level in &levels {
            let table = level.lock().map_err(|_| LsmError::LockPoisoned("sstable"))?;
            for column in table.columns() {
                let raw = table.read_raw(column, codec.as_ref(), compressor.as_ref())?;
                for key in raw.keys() {
                    bloom.add(&bloom_key(column, key));
                }
            }
        }

        let wal = Wal::open(&config.dir_path)?;
        let records = wal.replay(codec.as_ref(), compressor.as_ref())?;

        let mut memtable = MemTable::new();
        let mut tombstones: HashMap<String, BTreeSet<String>> = HashMap::new();
        for record in records {
            match record {
                WalRecord::Put { column, key, value } => {
                    bloom.add(&bloom_key(&column, &key));
                    memtable.put(&column, &key, value);
                    if let Some(set) = tombstones.get_mut(&column) {
                        set.remove(&key);
                    }
                }
                WalRecord::Delete { column, key } => {
                    bloom.add(&bloom_key(&column, &key));
                    memtable.delete(&column, &key);
                    tombstones.entry(column).or_default().insert(key);
                }
            }
        }
        wal.clear()?;

        info!(
            "engine opened: {} levels, memtable={} records",
            NUM_LEVELS,
            memtable.size()
        );

        let engine = Arc::new(Self {
            op_lock: Mutex::new(()),
            memtable: Mutex::new(memtable),
            tombstones: Mutex::new(tombstones),
            wal,
            levels,
            bloom: Mutex::new(bloom),
            codec,
            compressor,
            config,
            sstable_reads: AtomicU64::new(0),
            background: Mutex::new(None),
        });

        let handle = Self::spawn_background_flush(Arc::clone(&engine));
        *engine
            .background
            .lock()
            .map_err(|_| LsmError::LockPoisoned("background"))? = Some(handle);

        Ok(engine)
    }

    fn spawn_background_flush(engine: Arc<Engine>) -> BackgroundHandle {
        let (stop, rx) = mpsc::channel();
        let interval = engine.config.background_flush_interval;
        let join = thread::spawn(move || loop {
            match rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = engine.flush() {
                        warn!("background flush failed: {}", e);
                    }
                }
            }
        });
        BackgroundHandle { stop, join }
    }

    /// Stops the background flush worker and joins its thread. Idempotent.
    pub fn close(&self) -> Result<()> {
        let handle = self
            .background
            .lock()
            .map_err(|_| LsmError::LockPoisoned("background"))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.stop.send(());
            let _ = handle.join.join();
        }
        Ok(())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of SSTable column reads performed so far, for tests that
    /// want to observe the bloom filter short-circuiting a miss.
    pub fn sstable_read_count(&self) -> u64 {
        self.sstable_reads.load(Ordering::Relaxed)
    }

    /// Appends a `put` WAL record, updates the MemTable and bloom filter,
    /// and — if the MemTable is now over threshold — flushes before
    /// returning. Holds `op_lock` for the whole call (spec §5): no other
    /// public operation can interleave.
    pub fn put(&self, column: &str, key: &str, value: Document) -> Result<()> {
        let _op = self.lock_op()?;

        self.wal
            .append_put(column, key, &value, self.codec.as_ref(), self.compressor.as_ref())?;

        {
            let mut memtable = self.lock_memtable()?;
            memtable.put(column, key, value);
        }
        {
            let mut tombstones = self.lock_tombstones()?;
            if let Some(set) = tombstones.get_mut(column) {
                set.remove(key);
            }
        }
        self.lock_bloom()?.add(&bloom_key(column, key));

        let over_threshold = self.lock_memtable()?.size() > self.config.flush_threshold;
        if over_threshold {
            self.flush_locked()?;
        }
        Ok(())
    }

    /// Holds `op_lock` for the whole call (spec §5).
    pub fn delete(&self, column: &str, key: &str) -> Result<()> {
        let _op = self.lock_op()?;

        self.wal.append_delete(column, key)?;
        self.lock_memtable()?.delete(column, key);
        self.lock_tombstones()?
            .entry(column.to_string())
            .or_default()
            .insert(key.to_string());
        Ok(())
    }

    /// Holds `op_lock` for the whole call (spec §5).
    pub fn get(&self, column: &str, key: &str) -> Result<Option<Document>> {
        let _op = self.lock_op()?;

        if !self.lock_bloom()?.check(&bloom_key(column, key)) {
            return Ok(None);
        }

        if let Some(value) = self.lock_memtable()?.get(column, key) {
            return Ok(Some(value.clone()));
        }

        if self
            .lock_tombstones()?
            .get(column)
            .is_some_and(|set| set.contains(key))
        {
            return Ok(None);
        }

        for level in &self.levels {
            self.sstable_reads.fetch_add(1, Ordering::Relaxed);
            let table = level.lock().map_err(|_| LsmError::LockPoisoned("sstable"))?;
            let raw = table.read_raw(column, self.codec.as_ref(), self.compressor.as_ref())?;
            if let Some(entry) = raw.get(key) {
                return Ok(match entry {
                    StoredEntry::Value(doc) => Some(doc.clone()),
                    StoredEntry::Tombstone => None,
                });
            }
        }
        Ok(None)
    }

    /// Inclusive range scan over one column. MemTable/L0-first precedence
    /// for duplicate keys; the bloom filter is not consulted. Holds
    /// `op_lock` for the whole call (spec §5).
    pub fn query(&self, column: &str, start_key: &str, end_key: &str) -> Result<Vec<(String, Document)>> {
        let _op = self.lock_op()?;

        let mut result: BTreeMap<String, Option<Document>> = BTreeMap::new();
        let range = start_key.to_string()..=end_key.to_string();

        if let Some(map) = self.lock_memtable()?.column(column) {
            for (k, v) in map.range(range.clone()) {
                result.entry(k.clone()).or_insert_with(|| Some(v.clone()));
            }
        }

        if let Some(deleted) = self.lock_tombstones()?.get(column) {
            for k in deleted.range(range.clone()) {
                result.entry(k.clone()).or_insert(None);
            }
        }

        for level in &self.levels {
            let table = level.lock().map_err(|_| LsmError::LockPoisoned("sstable"))?;
            let raw = table.read_raw(column, self.codec.as_ref(), self.compressor.as_ref())?;
            for (k, entry) in raw.range(range.clone()) {
                result.entry(k.clone()).or_insert_with(|| match entry {
                    StoredEntry::Value(doc) => Some(doc.clone()),
                    StoredEntry::Tombstone => None,
                });
            }
        }

        Ok(result.into_iter().filter_map(|(k, v)| v.map(|doc| (k, doc))).collect())
    }

    /// Snapshots the MemTable, merges it (plus any pending tombstones)
    /// into L0, clears the MemTable, and truncates the WAL. A no-op on
    /// disk with an empty MemTable and no pending tombstones still
    /// truncates the WAL. Holds `op_lock` for the whole call (spec §5);
    /// `put`'s internal threshold-triggered flush calls `flush_locked`
    /// directly since it already holds the lock.
    pub fn flush(&self) -> Result<()> {
        let _op = self.lock_op()?;
        self.flush_locked()
    }

    fn flush_locked(&self) -> Result<()> {
        let snapshot = {
            let mut memtable = self.lock_memtable()?;
            let snapshot = memtable.snapshot();
            memtable.clear();
            snapshot
        };
        let tombstone_snapshot = self.lock_tombstones()?.clone();

        let mut combined: Vec<(String, BTreeMap<String, StoredEntry>)> = Vec::new();
        let mut touched: HashSet<String> = HashSet::new();

        for (column, values) in snapshot {
            touched.insert(column.clone());
            let mut entries: BTreeMap<String, StoredEntry> =
                values.into_iter().map(|(k, v)| (k, StoredEntry::Value(v))).collect();
            if let Some(keys) = tombstone_snapshot.get(&column) {
                for key in keys {
                    entries.entry(key.clone()).or_insert(StoredEntry::Tombstone);
                }
            }
            combined.push((column, entries));
        }
        for (column, keys) in &tombstone_snapshot {
            if touched.contains(column) || keys.is_empty() {
                continue;
            }
            let entries = keys.iter().map(|k| (k.clone(), StoredEntry::Tombstone)).collect();
            combined.push((column.clone(), entries));
        }

        if combined.is_empty() {
            info!("flush: memtable empty, truncating WAL only");
            self.wal.clear()?;
            return Ok(());
        }

        self.merge_into_level(0, &combined)?;
        let l0_entries = self.level_entry_count(0)?;
        info!("flush: merged {} columns into L0 ({} entries)", combined.len(), l0_entries);
        if l0_entries > self.config.compaction_threshold {
            self.compact(0)?;
        }

        self.wal.clear()?;
        Ok(())
    }

    fn read_all_raw(&self, level_idx: usize) -> Result<Vec<(String, BTreeMap<String, StoredEntry>)>> {
        let table = self.levels[level_idx]
            .lock()
            .map_err(|_| LsmError::LockPoisoned("sstable"))?;
        table
            .columns()
            .iter()
            .map(|c| Ok((c.clone(), table.read_raw(c, self.codec.as_ref(), self.compressor.as_ref())?)))
            .collect()
    }

    fn merge_into_level(
        &self,
        level_idx: usize,
        incoming: &[(String, BTreeMap<String, StoredEntry>)],
    ) -> Result<()> {
        let mut existing = self.read_all_raw(level_idx)?;
        for (column, new_map) in incoming {
            if let Some((_, existing_map)) = existing.iter_mut().find(|(c, _)| c == column) {
                for (k, v) in new_map {
                    existing_map.insert(k.clone(), v.clone());
                }
            } else {
                existing.push((column.clone(), new_map.clone()));
            }
        }

        let mut table = self.levels[level_idx]
            .lock()
            .map_err(|_| LsmError::LockPoisoned("sstable"))?;
        table.write(&existing, self.codec.as_ref(), self.compressor.as_ref())
    }

    fn level_entry_count(&self, level_idx: usize) -> Result<usize> {
        let table = self.levels[level_idx]
            .lock()
            .map_err(|_| LsmError::LockPoisoned("sstable"))?;
        Ok(table.total_entries())
    }

    /// Merges `level` into `level + 1` with per-key overwrite (level wins
    /// on conflicts, it holds the newer data), then rewrites `level`
    /// empty. Once a tombstone reaches the last level it is physically
    /// dropped instead of written through, and its bookkeeping entry in
    /// `tombstones` is removed. If the receiving level now exceeds the
    /// compaction threshold, cascades into the next level in turn.
    fn compact(&self, level: usize) -> Result<()> {
        if level == NUM_LEVELS - 1 {
            return Ok(());
        }
        let next = level + 1;
        let is_last_target = next == NUM_LEVELS - 1;

        let current_entries = self.read_all_raw(level)?;
        let mut merged = self.read_all_raw(next)?;

        for (column, current_map) in current_entries {
            if let Some((_, next_map)) = merged.iter_mut().find(|(c, _)| *c == column) {
                for (k, v) in current_map {
                    next_map.insert(k, v);
                }
            } else {
                merged.push((column, current_map));
            }
        }

        if is_last_target {
            let mut tombstones = self.lock_tombstones()?;
            for (column, map) in merged.iter_mut() {
                let dropped: Vec<String> = map
                    .iter()
                    .filter(|(_, v)| matches!(v, StoredEntry::Tombstone))
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in dropped {
                    map.remove(&key);
                    if let Some(set) = tombstones.get_mut(column) {
                        set.remove(&key);
                    }
                }
            }
        }

        {
            let mut table = self.levels[next].lock().map_err(|_| LsmError::LockPoisoned("sstable"))?;
            table.write(&merged, self.codec.as_ref(), self.compressor.as_ref())?;
        }
        {
            let mut table = self.levels[level]
                .lock()
                .map_err(|_| LsmError::LockPoisoned("sstable"))?;
            table.write(&[], self.codec.as_ref(), self.compressor.as_ref())?;
        }

        info!("compacted level {} into level {}", level, next);

        if !is_last_target && self.level_entry_count(next)? > self.config.compaction_threshold {
            self.compact(next)?;
        }
        Ok(())
    }

    fn lock_op(&self) -> Result<MutexGuard<'_, ()>> {
        self.op_lock.lock().map_err(|_| LsmError::LockPoisoned("op"))
    }

    fn lock_memtable(&self) -> Result<MutexGuard<'_, MemTable>> {
        self.memtable.lock().map_err(|_| LsmError::LockPoisoned("memtable"))
    }

    fn lock_tombstones(&self) -> Result<MutexGuard<'_, HashMap<String, BTreeSet<String>>>> {
        self.tombstones.lock().map_err(|_| LsmError::LockPoisoned("tombstones"))
    }

    fn lock_bloom(&self) -> Result<MutexGuard<'_, BloomFilter>> {
        self.bloom.lock().map_err(|_| LsmError::LockPoisoned("bloom"))
    }
}
