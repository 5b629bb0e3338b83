//! Mutable in-memory write buffer fronting the WAL. See spec §4.2.

use std::collections::{BTreeMap, HashMap};

use crate::codec::Document;

/// `column -> (key -> value)` plus a running insertion count.
#[derive(Default)]
pub struct MemTable {
    order: Vec<String>,
    data: HashMap<String, BTreeMap<String, Document>>,
    size: usize,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites. Increments `size` unconditionally, whether
    /// or not the key already existed — this is an insertion counter, not
    /// a distinct-key counter.
    pub fn put(&mut self, column: &str, key: &str, value: Document) {
        if !self.data.contains_key(column) {
            self.order.push(column.to_string());
        }
        let entry = self.data.entry(column.to_string()).or_default();
        entry.insert(key.to_string(), value);
        self.size += 1;
    }

    pub fn get(&self, column: &str, key: &str) -> Option<&Document> {
        self.data.get(column)?.get(key)
    }

    /// Removes if present, decrementing `size` only when a removal
    /// occurred. Returns whether the key was present.
    pub fn delete(&mut self, column: &str, key: &str) -> bool {
        let Some(map) = self.data.get_mut(column) else {
            return false;
        };
        if map.remove(key).is_some() {
            self.size = self.size.saturating_sub(1);
            true
        } else {
            false
        }
    }

    /// Current contents in column insertion order; the caller owns the
    /// returned snapshot.
    pub fn snapshot(&self) -> Vec<(String, BTreeMap<String, Document>)> {
        self.order
            .iter()
            .filter_map(|col| self.data.get(col).map(|m| (col.clone(), m.clone())))
            .collect()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.data.clear();
        self.size = 0;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn column(&self, column: &str) -> Option<&BTreeMap<String, Document>> {
        self.data.get(column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_preserves_insertion_order() {
        let mut mt = MemTable::new();
        mt.put("c3", "k", json!(3));
        mt.put("c1", "k", json!(1));
        mt.put("c2", "k", json!(2));

        let cols: Vec<_> = mt.snapshot().into_iter().map(|(c, _)| c).collect();
        assert_eq!(cols, vec!["c3", "c1", "c2"]);
    }

    #[test]
    fn size_counts_every_insertion() {
        let mut mt = MemTable::new();
        mt.put("c", "k", json!(1));
        mt.put("c", "k", json!(2)); // overwrite, still increments
        assert_eq!(mt.size(), 2);
    }

    #[test]
    fn delete_decrements_only_on_removal() {
        let mut mt = MemTable::new();
        mt.put("c", "k", json!(1));
        assert!(mt.delete("c", "k"));
        assert_eq!(mt.size(), 0);
        assert!(!mt.delete("c", "k"));
        assert_eq!(mt.size(), 0);
    }

    #[test]
    fn get_after_delete_is_none() {
        let mut mt = MemTable::new();
        mt.put("c", "k", json!(1));
        mt.delete("c", "k");
        assert!(mt.get("c", "k").is_none());
    }
}
