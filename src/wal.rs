//! Append-only write-ahead log. Bit-exact record layout per spec §6.
//!
//! `put` record: `3-byte op "put"` `32-byte column` `32-byte key`
//! `4-byte value_len` `value_len bytes of compress(encode(value))`.
//! `delete` record: `3-byte op "del"` `32-byte column` `32-byte key`.
//! All integers big-endian. Column/key are zero-padded right to 32 bytes.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::codec::{Compressor, Document, ValueCodec};
use crate::error::{LsmError, Result};

const IDENT_WIDTH: usize = 32;
const PUT_HEADER_LEN: usize = 3 + IDENT_WIDTH + IDENT_WIDTH + 4; // 71

pub enum WalRecord {
    Put {
        column: String,
        key: String,
        value: Document,
    },
    Delete {
        column: String,
        key: String,
    },
}

pub struct Wal {
    file: Mutex<BufWriter<File>>,
    path: PathBuf,
}

/// Validates and zero-pads `s` into a fixed 32-byte field.
fn pad_identifier(kind: &'static str, s: &str) -> Result<[u8; IDENT_WIDTH]> {
    let bytes = s.as_bytes();
    if bytes.len() > IDENT_WIDTH {
        return Err(LsmError::IdentifierTooLong {
            kind,
            value: s.to_string(),
        });
    }
    let mut field = [0u8; IDENT_WIDTH];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

fn unpad_identifier(field: &[u8; IDENT_WIDTH]) -> Result<String> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(IDENT_WIDTH);
    String::from_utf8(field[..end].to_vec()).map_err(|e| LsmError::WalCorruption(e.to_string()))
}

impl Wal {
    pub fn open(dir_path: &Path) -> Result<Self> {
        let path = dir_path.join("wal.log");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(LsmError::WalIo)?;
        Ok(Self {
            file: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn append_put(
        &self,
        column: &str,
        key: &str,
        value: &Document,
        codec: &dyn ValueCodec,
        compressor: &dyn Compressor,
    ) -> Result<()> {
        let column_field = pad_identifier("column", column)?;
        let key_field = pad_identifier("key", key)?;
        let encoded = codec.encode(value)?;
        let compressed = compressor.compress(&encoded)?;

        let mut writer = self.file.lock().map_err(|_| LsmError::LockPoisoned("wal"))?;
        writer.write_all(b"put").map_err(LsmError::WalIo)?;
        writer.write_all(&column_field).map_err(LsmError::WalIo)?;
        writer.write_all(&key_field).map_err(LsmError::WalIo)?;
        writer
            .write_all(&(compressed.len() as u32).to_be_bytes())
            .map_err(LsmError::WalIo)?;
        writer.write_all(&compressed).map_err(LsmError::WalIo)?;
        writer.flush().map_err(LsmError::WalIo)?;
        writer.get_ref().sync_all().map_err(LsmError::WalIo)?;

        debug!("WAL put persisted: column={} key={}", column, key);
        Ok(())
    }

    pub fn append_delete(&self, column: &str, key: &str) -> Result<()> {
        let column_field = pad_identifier("column", column)?;
        let key_field = pad_identifier("key", key)?;

        let mut writer = self.file.lock().map_err(|_| LsmError::LockPoisoned("wal"))?;
        writer.write_all(b"del").map_err(LsmError::WalIo)?;
        writer.write_all(&column_field).map_err(LsmError::WalIo)?;
        writer.write_all(&key_field).map_err(LsmError::WalIo)?;
        writer.flush().map_err(LsmError::WalIo)?;
        writer.get_ref().sync_all().map_err(LsmError::WalIo)?;

        debug!("WAL delete persisted: column={} key={}", column, key);
        Ok(())
    }

    /// Reads the file from the start. A short read on a header (the 3-byte
    /// op, or the fixed remainder of a `put`/`del` header) or on a `put`
    /// body is silent end-of-log, not an error. A full record whose body
    /// fails to decompress/decode is dropped with a warning and replay
    /// continues.
    pub fn replay(&self, codec: &dyn ValueCodec, compressor: &dyn Compressor) -> Result<Vec<WalRecord>> {
        let file = File::open(&self.path).map_err(LsmError::WalIo)?;
        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            let mut op = [0u8; 3];
            if !read_exact_or_eof(&mut reader, &mut op)? {
                break;
            }

            let mut column_field = [0u8; IDENT_WIDTH];
            let mut key_field = [0u8; IDENT_WIDTH];
            if !read_exact_or_eof(&mut reader, &mut column_field)? {
                break;
            }
            if !read_exact_or_eof(&mut reader, &mut key_field)? {
                break;
            }

            match &op {
                b"put" => {
                    let mut len_buf = [0u8; 4];
                    if !read_exact_or_eof(&mut reader, &mut len_buf)? {
                        break;
                    }
                    let value_len = u32::from_be_bytes(len_buf) as usize;
                    let mut body = vec![0u8; value_len];
                    if !read_exact_or_eof(&mut reader, &mut body)? {
                        break;
                    }

                    let (column, key) = match (unpad_identifier(&column_field), unpad_identifier(&key_field)) {
                        (Ok(c), Ok(k)) => (c, k),
                        _ => {
                            warn!("WAL record with non-UTF8 identifier skipped");
                            continue;
                        }
                    };

                    match decode_value(&body, codec, compressor) {
                        Ok(value) => records.push(WalRecord::Put { column, key, value }),
                        Err(e) => warn!("WAL put record for {}:{} dropped: {}", column, key, e),
                    }
                }
                b"del" => {
                    match (unpad_identifier(&column_field), unpad_identifier(&key_field)) {
                        (Ok(column), Ok(key)) => records.push(WalRecord::Delete { column, key }),
                        _ => warn!("WAL record with non-UTF8 identifier skipped"),
                    }
                }
                _ => {
                    // Unknown op: can't know the record's true length, so
                    // treat the remainder as an unreadable tail.
                    warn!("WAL encountered unknown op, stopping replay");
                    break;
                }
            }
        }

        debug!("WAL replay produced {} records", records.len());
        Ok(records)
    }

    /// Truncates the file to zero bytes; subsequent appends start at
    /// offset 0.
    pub fn clear(&self) -> Result<()> {
        let mut guard = self.file.lock().map_err(|_| LsmError::LockPoisoned("wal"))?;
        guard.flush().map_err(LsmError::WalIo)?;

        let truncated = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(LsmError::WalIo)?;
        truncated.sync_all().map_err(LsmError::WalIo)?;

        let appended = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(LsmError::WalIo)?;
        *guard = BufWriter::new(appended);
        Ok(())
    }
}

fn decode_value(body: &[u8], codec: &dyn ValueCodec, compressor: &dyn Compressor) -> Result<Document> {
    let plain = compressor.decompress(body)?;
    codec.decode(&plain)
}

/// Reads exactly `buf.len()` bytes, returning `Ok(false)` on a clean or
/// partial EOF (treated as truncated tail) instead of erroring.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(LsmError::WalIo(e)),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{DeflateCompressor, JsonCodec};
    use serde_json::json;
    use std::io::Write as _;
    use tempfile::tempdir;

    #[test]
    fn put_then_delete_round_trip() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();
        let codec = JsonCodec;
        let compressor = DeflateCompressor::default();

        wal.append_put("c", "k1", &json!({"n": 1}), &codec, &compressor).unwrap();
        wal.append_delete("c", "k1").unwrap();

        let records = wal.replay(&codec, &compressor).unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[0], WalRecord::Put { key, .. } if key == "k1"));
        assert!(matches!(&records[1], WalRecord::Delete { key, .. } if key == "k1"));
    }

    #[test]
    fn oversized_identifier_rejected() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();
        let codec = JsonCodec;
        let compressor = DeflateCompressor::default();
        let long_key = "x".repeat(33);
        let result = wal.append_put("c", &long_key, &json!(1), &codec, &compressor);
        assert!(matches!(result, Err(LsmError::IdentifierTooLong { .. })));
    }

    #[test]
    fn truncated_tail_is_silently_dropped() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path()).unwrap();
        let codec = JsonCodec;
        let compressor = DeflateCompressor::default();
        wal.append_put("c", "k1", &json!(1), &codec, &compressor).unwrap();

        // Append 20 arbitrary bytes: a partial header for a second record.
        {
            let mut f = OpenOptions::new().append(true).open(wal.path.clone()).unwrap();
            f.write_all(&[0xAB; 20]).unwrap();
        }

        let records = wal.replay(&codec, &compressor).unwrap();
        assert_eq!(records.len(), 1);
    }
}
