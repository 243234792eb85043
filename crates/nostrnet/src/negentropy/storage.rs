use super::encoding::{Accumulator, Bound, ID_SIZE};
use super::NegentropyError;
use crate::{Filter, LocalIndex, NoteId, Result};

/// One element of the reconciled set
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Item {
    pub timestamp: u64,
    pub id: [u8; ID_SIZE],
}

impl Item {
    pub fn new(timestamp: u64, id: [u8; ID_SIZE]) -> Self {
        Self { timestamp, id }
    }

    fn is_below(&self, bound: &Bound) -> bool {
        if bound.is_infinity() {
            return true;
        }
        if self.timestamp != bound.timestamp {
            return self.timestamp < bound.timestamp;
        }
        let prefix = bound.prefix();
        self.id[..prefix.len()] < *prefix
    }
}

/// Sorted (timestamp, id) set. Filled with [`add`](Self::add), then
/// [`seal`](Self::seal)ed before any range query.
#[derive(Debug, Default, Clone)]
pub struct NegentropyStorage {
    items: Vec<Item>,
    sealed: bool,
}

impl NegentropyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a sealed storage from everything in `index` matching `filters`
    pub fn from_index(index: &dyn LocalIndex, filters: &[Filter]) -> Result<Self> {
        let mut storage = Self::new();
        index.scan(filters, &mut |note| {
            storage.items.push(Item::new(note.created_at, *note.id.bytes()));
            true
        })?;
        storage.seal()?;
        Ok(storage)
    }

    pub fn add(&mut self, timestamp: u64, id: &NoteId) -> std::result::Result<(), NegentropyError> {
        if self.sealed {
            return Err(NegentropyError::StorageAlreadySealed);
        }
        self.items.push(Item::new(timestamp, *id.bytes()));
        Ok(())
    }

    pub fn seal(&mut self) -> std::result::Result<(), NegentropyError> {
        if self.sealed {
            return Err(NegentropyError::StorageAlreadySealed);
        }
        self.items.sort_unstable();
        self.items.dedup();
        self.sealed = true;
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn get(&self, i: usize) -> Option<&Item> {
        self.items.get(i)
    }

    /// Index of the first item at or above `bound`
    pub fn lower_bound(&self, bound: &Bound) -> usize {
        self.items.partition_point(|item| item.is_below(bound))
    }

    /// Fingerprint of items[lower..upper]
    pub fn fingerprint(&self, lower: usize, upper: usize) -> [u8; 16] {
        let upper = upper.min(self.items.len());
        let lower = lower.min(upper);
        let mut acc = Accumulator::default();
        for item in &self.items[lower..upper] {
            acc.add(&item.id);
        }
        acc.fingerprint(upper - lower)
    }
}
