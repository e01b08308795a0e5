//! Compact file-path dictionary.
//!
//! Every raster path an engine touches is interned into a
//! [`FileDictionary`], and samples refer to their source file through
//! the resulting id. Ids embed a caller-chosen *key space* in their
//! high 32 bits so that ids minted by different engines never collide
//! when results are merged downstream. Files that ended up
//! contributing a returned sample are marked, letting provenance
//! writers list only the paths that matter.

use std::collections::HashMap;

const INDEX_BITS: u32 = 32;
const INDEX_MASK: u64 = (1 << INDEX_BITS) - 1;

fn make_id(key_space: u64, index: usize) -> u64 {
    (key_space << INDEX_BITS) | index as u64
}

fn split_id(id: u64) -> (u64, usize) {
    (id >> INDEX_BITS, (id & INDEX_MASK) as usize)
}

#[derive(Debug, Clone)]
struct Entry {
    path: String,
    contributed: bool,
}

/// An id-interning table of raster file paths.
#[derive(Debug, Clone, Default)]
pub struct FileDictionary {
    key_space: u64,
    entries: Vec<Entry>,
    ids: HashMap<String, u64>,
}

impl FileDictionary {
    pub fn new(key_space: u64) -> Self {
        FileDictionary {
            key_space,
            entries: Vec::new(),
            ids: HashMap::new(),
        }
    }

    #[inline]
    pub fn key_space(&self) -> u64 {
        self.key_space
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Intern a path, returning its id. Inserting a path twice
    /// returns the same id.
    pub fn insert(&mut self, path: &str) -> u64 {
        if let Some(&id) = self.ids.get(path) {
            return id;
        }
        let id = make_id(self.key_space, self.entries.len());
        self.entries.push(Entry {
            path: path.to_string(),
            contributed: false,
        });
        self.ids.insert(path.to_string(), id);
        id
    }

    /// The path behind an id, if the id was minted by this dictionary.
    pub fn path(&self, id: u64) -> Option<&str> {
        let (key_space, index) = split_id(id);
        if key_space != self.key_space {
            return None;
        }
        self.entries.get(index).map(|e| e.path.as_str())
    }

    /// Record that the file behind `id` contributed a returned sample.
    pub fn mark_contributed(&mut self, id: u64) {
        let (key_space, index) = split_id(id);
        if key_space == self.key_space {
            if let Some(entry) = self.entries.get_mut(index) {
                entry.contributed = true;
            }
        }
    }

    /// All interned paths, in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (make_id(self.key_space, i), e.path.as_str()))
    }

    /// Paths that contributed a returned sample, in insertion order.
    pub fn contributed(&self) -> impl Iterator<Item = (u64, &str)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.contributed)
            .map(|(i, e)| (make_id(self.key_space, i), e.path.as_str()))
    }

    /// Absorb another dictionary, returning a translation from its
    /// ids to ids in this one. Shared paths dedupe to one entry; the
    /// contributed mark survives the merge.
    pub fn merge(&mut self, other: &FileDictionary) -> IdRemap {
        let mut new_ids = Vec::with_capacity(other.entries.len());
        for entry in &other.entries {
            let id = self.insert(&entry.path);
            if entry.contributed {
                self.mark_contributed(id);
            }
            new_ids.push(id);
        }
        IdRemap {
            key_space: other.key_space,
            new_ids,
        }
    }

    /// Drop every entry. The key space is retained.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.ids.clear();
    }
}

/// Translation from the ids of a merged-away dictionary to ids in the
/// dictionary it was merged into. Returned by
/// [`FileDictionary::merge`].
#[derive(Debug, Default)]
pub struct IdRemap {
    key_space: u64,
    new_ids: Vec<u64>,
}

impl IdRemap {
    pub fn translate(&self, old: u64) -> Option<u64> {
        let (key_space, index) = split_id(old);
        if key_space != self.key_space {
            return None;
        }
        self.new_ids.get(index).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_is_idempotent() {
        let mut dict = FileDictionary::new(7);
        let a = dict.insert("/data/a.tif");
        let b = dict.insert("/data/b.tif");
        assert_ne!(a, b);
        assert_eq!(dict.insert("/data/a.tif"), a);
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn ids_embed_key_space() {
        let mut dict = FileDictionary::new(7);
        let id = dict.insert("/data/a.tif");
        assert_eq!(id >> 32, 7);
        assert_eq!(dict.path(id), Some("/data/a.tif"));
        // an id minted under a different key space resolves to nothing
        assert_eq!(dict.path(9 << 32), None);
    }

    #[test]
    fn contributed_marking() {
        let mut dict = FileDictionary::new(0);
        let a = dict.insert("/data/a.tif");
        let _b = dict.insert("/data/b.tif");
        dict.mark_contributed(a);
        let marked: Vec<_> = dict.contributed().map(|(id, _)| id).collect();
        assert_eq!(marked, vec![a]);
    }

    #[test]
    fn merge_unions_and_remaps() {
        let mut main = FileDictionary::new(3);
        let shared = main.insert("/data/shared.tif");

        let mut local = FileDictionary::new(3);
        let local_shared = local.insert("/data/shared.tif");
        let local_only = local.insert("/data/local.tif");
        local.mark_contributed(local_only);

        let remap = main.merge(&local);
        assert_eq!(remap.translate(local_shared), Some(shared));

        let new_id = remap.translate(local_only).unwrap();
        assert_eq!(main.path(new_id), Some("/data/local.tif"));
        assert_eq!(main.len(), 2);

        let marked: Vec<_> = main.contributed().map(|(id, _)| id).collect();
        assert_eq!(marked, vec![new_id]);

        // ids from an unrelated key space don't translate
        assert_eq!(remap.translate(9 << 32), None);
    }

    #[test]
    fn clear_keeps_key_space() {
        let mut dict = FileDictionary::new(5);
        dict.insert("/data/a.tif");
        dict.clear();
        assert!(dict.is_empty());
        assert_eq!(dict.insert("/data/z.tif") >> 32, 5);
    }
}
