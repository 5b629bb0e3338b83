//! # lsmkv — column-family LSM-tree key-value store
//!
//! An embeddable, crash-recoverable storage engine: a mutable MemTable
//! protected by a write-ahead log, flushed into leveled, bloom-filtered
//! SSTables. See `DESIGN.md` for the grounding of each piece and the
//! resolutions to the open questions the design carries.
//!
//! ```no_run
//! use lsmkv::{Engine, EngineConfig};
//! use serde_json::json;
//!
//! # fn main() -> lsmkv::Result<()> {
//! let config = EngineConfig::builder().dir_path("./data").build()?;
//! let engine = Engine::open(config)?;
//! engine.put("users", "alice", json!({"age": 30}))?;
//! assert_eq!(engine.get("users", "alice")?, Some(json!({"age": 30})));
//! engine.close()?;
//! # Ok(())
//! # }
//! ```

mod bloom;
mod codec;
mod config;
mod engine;
mod error;
mod memtable;
mod sstable;
mod wal;

pub use codec::{Compressor, DeflateCompressor, Document, JsonCodec, ValueCodec};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use engine::{Engine, NUM_LEVELS};
pub use error::{LsmError, Result};
