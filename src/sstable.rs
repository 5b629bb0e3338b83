//! Immutable on-disk segment: per-column compressed blocks plus a
//! persisted footer index. See spec §4.3 and §6.
//!
//! On-disk layout:
//! ```text
//! repeat: [compressed_block_bytes]
//! footer: repeat N times [column_len:u32 | column_bytes | start:u64 | end:u64 | count:u32 | checksum:u32]
//!                       [N:u32 | footer_offset:u64 | magic:u32]
//! ```
//! `count` and `checksum` extend the format spec §6 suggests, so
//! compaction thresholds can be read without decompressing every block
//! and a flipped bit in a block is caught before it reaches the codec.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::{Compressor, Document, ValueCodec};
use crate::error::{LsmError, Result};

const MAGIC: u32 = 0x4C53_4D31; // b"LSM1" as u32

#[derive(Clone, Debug)]
pub enum StoredEntry {
    Value(Document),
    Tombstone,
}

#[derive(Serialize, Deserialize)]
enum WireEntry {
    Value(Vec<u8>),
    Tombstone,
}

#[derive(Clone)]
struct FooterEntry {
    start: u64,
    end: u64,
    count: u32,
    checksum: u32,
}

/// A (file path, column index) pair. One file is one level.
pub struct SsTable {
    path: PathBuf,
    order: Vec<String>,
    index: std::collections::HashMap<String, FooterEntry>,
}

impl SsTable {
    /// Opens an existing segment file, creating an empty one if absent.
    /// Any failure to parse the footer is non-fatal: the table is treated
    /// as empty (spec §4.3: "an SSTable file that fails to parse at
    /// startup must be treated as empty").
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            File::create(path)?;
            return Ok(Self {
                path: path.to_path_buf(),
                order: Vec::new(),
                index: std::collections::HashMap::new(),
            });
        }

        match Self::load_footer(path) {
            Ok((order, index)) => Ok(Self {
                path: path.to_path_buf(),
                order,
                index,
            }),
            Err(e) => {
                warn!("SSTable {} failed to parse, treating as empty: {}", path.display(), e);
                Ok(Self {
                    path: path.to_path_buf(),
                    order: Vec::new(),
                    index: std::collections::HashMap::new(),
                })
            }
        }
    }

    fn load_footer(
        path: &Path,
    ) -> Result<(Vec<String>, std::collections::HashMap<String, FooterEntry>)> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok((Vec::new(), std::collections::HashMap::new()));
        }
        if len < 16 {
            return Err(LsmError::SstableCorruption("file shorter than trailer".into()));
        }

        file.seek(SeekFrom::End(-16))?;
        let mut trailer = [0u8; 16];
        file.read_exact(&mut trailer)?;
        let n = u32::from_be_bytes(trailer[0..4].try_into().unwrap());
        let footer_offset = u64::from_be_bytes(trailer[4..12].try_into().unwrap());
        let magic = u32::from_be_bytes(trailer[12..16].try_into().unwrap());
        if magic != MAGIC {
            return Err(LsmError::SstableCorruption("bad magic".into()));
        }

        file.seek(SeekFrom::Start(footer_offset))?;
        let mut reader = BufReader::new(file);
        let mut order = Vec::with_capacity(n as usize);
        let mut index = std::collections::HashMap::with_capacity(n as usize);

        for _ in 0..n {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let column_len = u32::from_be_bytes(len_buf) as usize;
            let mut column_bytes = vec![0u8; column_len];
            reader.read_exact(&mut column_bytes)?;
            let column = String::from_utf8(column_bytes)
                .map_err(|e| LsmError::SstableCorruption(e.to_string()))?;

            let mut u64_buf = [0u8; 8];
            reader.read_exact(&mut u64_buf)?;
            let start = u64::from_be_bytes(u64_buf);
            reader.read_exact(&mut u64_buf)?;
            let end = u64::from_be_bytes(u64_buf);

            let mut u32_buf = [0u8; 4];
            reader.read_exact(&mut u32_buf)?;
            let count = u32::from_be_bytes(u32_buf);
            reader.read_exact(&mut u32_buf)?;
            let checksum = u32::from_be_bytes(u32_buf);

            order.push(column.clone());
            index.insert(
                column,
                FooterEntry {
                    start,
                    end,
                    count,
                    checksum,
                },
            );
        }

        Ok((order, index))
    }

    /// Indexed columns, in index order.
    pub fn columns(&self) -> &[String] {
        &self.order
    }

    /// Total resident entries (values and tombstones) across every
    /// indexed column, without touching the file — used for the
    /// compaction trigger.
    pub fn total_entries(&self) -> usize {
        self.index.values().map(|e| e.count as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Reads one column's raw entries (values and tombstones).
    /// Returns an empty map if the column is not indexed, or if the
    /// stored block fails its checksum or fails to decompress/decode —
    /// those are non-fatal SSTableCorruption conditions (spec §7).
    pub fn read_raw(
        &self,
        column: &str,
        codec: &dyn ValueCodec,
        compressor: &dyn Compressor,
    ) -> Result<BTreeMap<String, StoredEntry>> {
        let Some(footer) = self.index.get(column) else {
            return Ok(BTreeMap::new());
        };

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(footer.start))?;
        let mut compressed = vec![0u8; (footer.end - footer.start) as usize];
        file.read_exact(&mut compressed)?;

        if crc32fast::hash(&compressed) != footer.checksum {
            warn!("SSTable {} column {} failed checksum, treating as empty", self.path.display(), column);
            return Ok(BTreeMap::new());
        }

        let plain = match compressor.decompress(&compressed) {
            Ok(p) => p,
            Err(e) => {
                warn!("SSTable {} column {} failed to decompress: {}", self.path.display(), column, e);
                return Ok(BTreeMap::new());
            }
        };

        let wire: Vec<(String, WireEntry)> = match bincode::deserialize(&plain) {
            Ok(w) => w,
            Err(e) => {
                warn!("SSTable {} column {} failed to decode block: {}", self.path.display(), column, e);
                return Ok(BTreeMap::new());
            }
        };

        let mut out = BTreeMap::new();
        for (key, entry) in wire {
            match entry {
                WireEntry::Tombstone => {
                    out.insert(key, StoredEntry::Tombstone);
                }
                WireEntry::Value(bytes) => match codec.decode(&bytes) {
                    Ok(doc) => {
                        out.insert(key, StoredEntry::Value(doc));
                    }
                    Err(e) => warn!("SSTable {} key {} failed to decode value: {}", self.path.display(), key, e),
                },
            }
        }
        Ok(out)
    }

    /// Reads one column, dropping tombstones. `{}` if not indexed.
    pub fn read(
        &self,
        column: &str,
        codec: &dyn ValueCodec,
        compressor: &dyn Compressor,
    ) -> Result<BTreeMap<String, Document>> {
        Ok(self
            .read_raw(column, codec, compressor)?
            .into_iter()
            .filter_map(|(k, v)| match v {
                StoredEntry::Value(doc) => Some((k, doc)),
                StoredEntry::Tombstone => None,
            })
            .collect())
    }

    /// Atomically replaces the file's contents with `entries`, iterated
    /// in the given (caller-controlled, stable) order, via write-to-temp-
    /// and-rename. An empty slice goes through the same tmp-file-and-rename
    /// sequence, fsynced before the rename, truncating the file to zero
    /// bytes with the same crash-atomicity as a non-empty write.
    pub fn write(
        &mut self,
        entries: &[(String, BTreeMap<String, StoredEntry>)],
        codec: &dyn ValueCodec,
        compressor: &dyn Compressor,
    ) -> Result<()> {
        let tmp_path = self.path.with_extension("sst.tmp");

        if entries.is_empty() {
            let tmp_file = File::create(&tmp_path)?;
            tmp_file.sync_all()?;
            drop(tmp_file);
            fs::rename(&tmp_path, &self.path)?;
            self.order.clear();
            self.index.clear();
            return Ok(());
        }

        let mut writer = BufWriter::new(File::create(&tmp_path)?);

        let mut order = Vec::with_capacity(entries.len());
        let mut index = std::collections::HashMap::with_capacity(entries.len());
        let mut offset: u64 = 0;

        for (column, map) in entries {
            let wire: Vec<(String, WireEntry)> = map
                .iter()
                .map(|(k, v)| {
                    let entry = match v {
                        StoredEntry::Value(doc) => WireEntry::Value(codec.encode(doc)?),
                        StoredEntry::Tombstone => WireEntry::Tombstone,
                    };
                    Ok((k.clone(), entry))
                })
                .collect::<Result<Vec<_>>>()?;

            let plain = bincode::serialize(&wire)
                .map_err(|e| LsmError::Serialization(e.to_string()))?;
            let compressed = compressor.compress(&plain)?;
            let checksum = crc32fast::hash(&compressed);

            writer.write_all(&compressed)?;
            let start = offset;
            let end = offset + compressed.len() as u64;
            offset = end;

            order.push(column.clone());
            index.insert(
                column.clone(),
                FooterEntry {
                    start,
                    end,
                    count: map.len() as u32,
                    checksum,
                },
            );
        }

        let footer_offset = offset;
        for column in &order {
            let footer = &index[column];
            let column_bytes = column.as_bytes();
            writer.write_all(&(column_bytes.len() as u32).to_be_bytes())?;
            writer.write_all(column_bytes)?;
            writer.write_all(&footer.start.to_be_bytes())?;
            writer.write_all(&footer.end.to_be_bytes())?;
            writer.write_all(&footer.count.to_be_bytes())?;
            writer.write_all(&footer.checksum.to_be_bytes())?;
        }
        writer.write_all(&(order.len() as u32).to_be_bytes())?;
        writer.write_all(&footer_offset.to_be_bytes())?;
        writer.write_all(&MAGIC.to_be_bytes())?;

        writer.flush()?;
        writer.get_ref().sync_all()?;
        drop(writer);

        fs::rename(&tmp_path, &self.path)?;

        self.order = order;
        self.index = index;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DeflateCompressor, JsonCodec};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sstable_0.db");
        let mut sst = SsTable::open(&path).unwrap();
        let codec = JsonCodec;
        let compressor = DeflateCompressor::default();

        let mut col = BTreeMap::new();
        col.insert("k1".to_string(), StoredEntry::Value(json!(1)));
        col.insert("k2".to_string(), StoredEntry::Tombstone);
        sst.write(&[("users".to_string(), col)], &codec, &compressor).unwrap();

        assert_eq!(sst.columns(), &["users".to_string()]);
        let read = sst.read("users", &codec, &compressor).unwrap();
        assert_eq!(read.get("k1"), Some(&json!(1)));
        assert!(!read.contains_key("k2"));

        // Reopen from disk and confirm the footer survives.
        let reopened = SsTable::open(&path).unwrap();
        assert_eq!(reopened.total_entries(), 2);
    }

    #[test]
    fn writing_empty_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sstable_0.db");
        let mut sst = SsTable::open(&path).unwrap();
        let codec = JsonCodec;
        let compressor = DeflateCompressor::default();

        let mut col = BTreeMap::new();
        col.insert("k1".to_string(), StoredEntry::Value(json!(1)));
        sst.write(&[("c".to_string(), col)], &codec, &compressor).unwrap();
        sst.write(&[], &codec, &compressor).unwrap();

        assert!(sst.is_empty());
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn missing_column_reads_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sstable_0.db");
        let sst = SsTable::open(&path).unwrap();
        let codec = JsonCodec;
        let compressor = DeflateCompressor::default();
        assert!(sst.read("nope", &codec, &compressor).unwrap().is_empty());
    }
}
