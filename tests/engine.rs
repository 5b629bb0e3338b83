use std::fs::OpenOptions;
use std::io::Write;

use lsmkv::{Engine, EngineConfig};
use serde_json::json;
use tempfile::tempdir;

fn open(dir: &std::path::Path) -> std::sync::Arc<Engine> {
    let config = EngineConfig::builder().dir_path(dir).build().unwrap();
    Engine::open(config).unwrap()
}

/// S1 — basic round trip.
#[test]
fn s1_basic_round_trip() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());

    engine.put("col", "k1", json!({"n": 1})).unwrap();
    assert_eq!(engine.get("col", "k1").unwrap(), Some(json!({"n": 1})));

    engine.delete("col", "k1").unwrap();
    assert_eq!(engine.get("col", "k1").unwrap(), None);

    engine.close().unwrap();
}

/// S2 — flush at threshold: inserting past the 200-entry default
/// threshold must flush synchronously on the triggering `put`.
#[test]
fn s2_flush_at_threshold() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());

    for i in 0..201 {
        engine.put("col", &format!("key{i}"), json!(i)).unwrap();
    }

    let wal_path = dir.path().join("wal.log");
    assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), 0);

    let sstable0 = dir.path().join("sstable_0.db");
    assert!(std::fs::metadata(&sstable0).unwrap().len() > 0);

    engine.close().unwrap();
}

/// S3 — crash recovery: drop the engine without calling close, reopen,
/// and confirm every entry written before the "crash" survives.
#[test]
fn s3_crash_recovery() {
    let dir = tempdir().unwrap();
    {
        let engine = open(dir.path());
        for i in 0..50 {
            engine.put("col", &format!("k{i}"), json!(i)).unwrap();
        }
        // No close(): simulates a crash before the background flush runs.
    }

    let engine = open(dir.path());
    for i in 0..50 {
        assert_eq!(engine.get("col", &format!("k{i}")).unwrap(), Some(json!(i)));
    }
    let wal_path = dir.path().join("wal.log");
    assert_eq!(std::fs::metadata(&wal_path).unwrap().len(), 0);
    engine.close().unwrap();
}

/// S4 — range query ordering across MemTable and an SSTable.
#[test]
fn s4_range_query_ordering() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());

    engine.put("c", "key3", json!(3)).unwrap();
    engine.put("c", "key1", json!(1)).unwrap();
    engine.flush().unwrap();
    engine.put("c", "key2", json!(2)).unwrap();

    let results = engine.query("c", "key1", "key3").unwrap();
    let keys: Vec<_> = results.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["key1", "key2", "key3"]);

    engine.close().unwrap();
}

/// S5 — bloom short-circuit: a miss on a never-inserted key must not
/// touch any SSTable.
#[test]
fn s5_bloom_short_circuit() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());

    engine.put("c", "k", json!("v")).unwrap();
    engine.flush().unwrap();

    let reads_before = engine.sstable_read_count();
    assert_eq!(engine.get("c", "missing").unwrap(), None);
    assert_eq!(engine.sstable_read_count(), reads_before);

    engine.close().unwrap();
}

/// S6 — WAL tail truncation: a partial trailing record must not abort
/// replay, and the one complete record must still be recovered.
#[test]
fn s6_wal_tail_truncation() {
    let dir = tempdir().unwrap();
    {
        let engine = open(dir.path());
        engine.put("c", "k1", json!(1)).unwrap();
        engine.close().unwrap();
    }

    let wal_path = dir.path().join("wal.log");
    {
        let mut f = OpenOptions::new().append(true).open(&wal_path).unwrap();
        f.write_all(&[0xAB; 20]).unwrap();
    }

    let engine = open(dir.path());
    assert_eq!(engine.get("c", "k1").unwrap(), Some(json!(1)));
    engine.close().unwrap();
}

#[test]
fn query_precedence_prefers_memtable_over_sstable() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());

    engine.put("c", "k1", json!("old")).unwrap();
    engine.flush().unwrap();
    engine.put("c", "k1", json!("new")).unwrap();

    let results = engine.query("c", "k1", "k1").unwrap();
    assert_eq!(results, vec![("k1".to_string(), json!("new"))]);

    engine.close().unwrap();
}

#[test]
fn columns_are_independent_namespaces() {
    let dir = tempdir().unwrap();
    let engine = open(dir.path());

    engine.put("a", "k", json!(1)).unwrap();
    engine.put("b", "k", json!(2)).unwrap();

    assert_eq!(engine.get("a", "k").unwrap(), Some(json!(1)));
    assert_eq!(engine.get("b", "k").unwrap(), Some(json!(2)));

    engine.close().unwrap();
}
