//! The local event store as seen from the networking layer.
//!
//! Storage internals live elsewhere; the networking core only needs to
//! insert what relays send, look notes up by id, and walk a filtered,
//! time-bounded slice of the store (subscription backfill and negentropy
//! storage population).

use std::collections::BTreeMap;
use std::sync::RwLock;

use hashbrown::HashMap;

use crate::{Filter, Note, NoteId, Result};

pub trait LocalIndex: Send + Sync {
    /// Returns false when the note was already present
    fn insert(&self, note: &Note) -> Result<bool>;

    fn lookup(&self, id: &NoteId) -> Option<Note>;

    /// Visit notes matching any of `filters`, newest first. The visitor
    /// returns false to stop early. Each call starts a fresh walk.
    fn scan(&self, filters: &[Filter], visit: &mut dyn FnMut(&Note) -> bool) -> Result<()>;
}

#[derive(Default)]
struct MemoryIndexInner {
    by_time: BTreeMap<(u64, NoteId), Note>,
    by_id: HashMap<NoteId, u64>,
}

/// A `LocalIndex` kept entirely in memory
#[derive(Default)]
pub struct MemoryIndex {
    inner: RwLock<MemoryIndexInner>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.by_id.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LocalIndex for MemoryIndex {
    fn insert(&self, note: &Note) -> Result<bool> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| crate::Error::Generic("memory index lock poisoned".to_owned()))?;

        if inner.by_id.contains_key(&note.id) {
            return Ok(false);
        }

        inner.by_id.insert(note.id, note.created_at);
        inner
            .by_time
            .insert((note.created_at, note.id), note.clone());
        Ok(true)
    }

    fn lookup(&self, id: &NoteId) -> Option<Note> {
        let inner = self.inner.read().ok()?;
        let created_at = *inner.by_id.get(id)?;
        inner.by_time.get(&(created_at, *id)).cloned()
    }

    fn scan(&self, filters: &[Filter], visit: &mut dyn FnMut(&Note) -> bool) -> Result<()> {
        let inner = self
            .inner
            .read()
            .map_err(|_| crate::Error::Generic("memory index lock poisoned".to_owned()))?;

        let limit = filters
            .iter()
            .map(|f| f.limit)
            .try_fold(0u64, |acc, l| l.map(|l| acc.saturating_add(l)));

        let mut visited = 0u64;
        for note in inner.by_time.values().rev() {
            if let Some(limit) = limit {
                if visited >= limit {
                    break;
                }
            }

            if !filters.is_empty() && !filters.iter().any(|f| f.matches(note)) {
                continue;
            }

            visited += 1;
            if !visit(note) {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Pubkey;

    fn note(id: u8, created_at: u64, kind: u64) -> Note {
        Note {
            id: NoteId::new([id; 32]),
            pubkey: Pubkey::new([0; 32]),
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn insert_is_idempotent_and_lookup_works() {
        let index = MemoryIndex::new();
        assert!(index.insert(&note(1, 10, 1)).unwrap());
        assert!(!index.insert(&note(1, 10, 1)).unwrap());
        assert_eq!(index.len(), 1);
        assert_eq!(index.lookup(&NoteId::new([1; 32])).unwrap().created_at, 10);
        assert!(index.lookup(&NoteId::new([2; 32])).is_none());
    }

    #[test]
    fn scan_is_newest_first_filtered_and_restartable() {
        let index = MemoryIndex::new();
        index.insert(&note(1, 10, 1)).unwrap();
        index.insert(&note(2, 30, 1)).unwrap();
        index.insert(&note(3, 20, 7)).unwrap();

        let filters = [Filter::new().kinds([1])];
        for _ in 0..2 {
            let mut seen = vec![];
            index
                .scan(&filters, &mut |n| {
                    seen.push(n.created_at);
                    true
                })
                .unwrap();
            assert_eq!(seen, vec![30, 10]);
        }

        let mut first = None;
        index
            .scan(&[], &mut |n| {
                first = Some(n.created_at);
                false
            })
            .unwrap();
        assert_eq!(first, Some(30));
    }

    #[test]
    fn scan_honors_limit() {
        let index = MemoryIndex::new();
        for i in 0..10 {
            index.insert(&note(i, i as u64, 1)).unwrap();
        }
        let mut count = 0;
        index
            .scan(&[Filter::new().limit(3)], &mut |_| {
                count += 1;
                true
            })
            .unwrap();
        assert_eq!(count, 3);
    }
}
