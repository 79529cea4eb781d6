use std::{collections::BTreeMap, ops::Bound};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: String,
    pub offset: u64,
}

/// Maps keys of a level to the byte offset their record starts at. May hold
/// every key or only a sample of them; seeks land on or before the record
/// being looked for and read forward from there.
#[derive(Debug, Default)]
pub struct SparseIndex {
    tree: BTreeMap<String, u64>,
}

impl SparseIndex {
    pub fn new() -> Self {
        SparseIndex {
            tree: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, key: String, offset: u64) {
        self.tree.insert(key, offset);
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn search(&self, key: &str) -> Option<IndexEntry> {
        self.tree.get_key_value(key).map(to_entry)
    }

    /// The entry with the smallest key `>= key`.
    pub fn search_nearest(&self, key: &str) -> Option<IndexEntry> {
        self.tree
            .range::<str, _>((Bound::Included(key), Bound::Unbounded))
            .next()
            .map(to_entry)
    }

    /// The entry with the largest key `<= key`.
    pub fn search_floor(&self, key: &str) -> Option<IndexEntry> {
        self.tree
            .range::<str, _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(to_entry)
    }
}

fn to_entry((key, offset): (&String, &u64)) -> IndexEntry {
    IndexEntry {
        key: key.clone(),
        offset: *offset,
    }
}
