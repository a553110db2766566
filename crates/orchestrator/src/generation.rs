//! Read/write generation bookkeeping for double-buffered quantities.

use std::collections::BTreeMap;

use fields::BufferKey;

use crate::command::CommandFlags;

/// Read and write array indices of one double-buffered quantity.
///
/// The pair can only be built as `(0, 1)` and changed by [`swap`](Self::swap),
/// so `read != write` holds for every value of this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    read: usize,
    write: usize,
}

impl Generation {
    /// Index of the generation currently authoritative for reading.
    pub fn read(self) -> usize {
        self.read
    }

    /// Index of the generation currently being written.
    pub fn write(self) -> usize {
        self.write
    }

    /// Exchange read and write.
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.read, &mut self.write);
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self { read: 0, write: 1 }
    }
}

/// Generation pairs for every double-buffered quantity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationTable {
    pairs: BTreeMap<BufferKey, Generation>,
}

impl GenerationTable {
    /// Table with every [`BufferKey::ALL_DOUBLE`] quantity at `(0, 1)`.
    pub fn new() -> Self {
        let pairs = BufferKey::ALL_DOUBLE
            .single_keys()
            .map(|key| (key, Generation::default()))
            .collect();
        Self { pairs }
    }

    /// Swap read and write for exactly the double-buffered keys in `keys`.
    ///
    /// Keys that are not double-buffered are ignored. Returns the set of keys
    /// actually swapped.
    pub fn swap(&mut self, keys: BufferKey) -> BufferKey {
        let mut swapped = BufferKey::empty();
        for key in (keys & BufferKey::ALL_DOUBLE).single_keys() {
            if let Some(pair) = self.pairs.get_mut(&key) {
                pair.swap();
                swapped |= key;
            }
        }
        swapped
    }

    /// Generation pair of a single key.
    pub fn get(&self, key: BufferKey) -> Option<Generation> {
        self.pairs.get(&key).copied()
    }

    /// Read index of `key`; single-buffered quantities always read array 0.
    pub fn read_index(&self, key: BufferKey) -> usize {
        self.get(key).map_or(0, Generation::read)
    }

    /// Write index of `key`; single-buffered quantities always write array 0.
    pub fn write_index(&self, key: BufferKey) -> usize {
        self.get(key).map_or(0, Generation::write)
    }

    /// Array index of `key` selected by the generation bits of `flags`.
    ///
    /// `DBLBUFFER_WRITE` selects the write generation, anything else the read
    /// one.
    pub fn select(&self, key: BufferKey, flags: CommandFlags) -> usize {
        if flags.contains(CommandFlags::DBLBUFFER_WRITE) {
            self.write_index(key)
        } else {
            self.read_index(key)
        }
    }

    /// Whether every pair satisfies `read != write`.
    pub fn is_consistent(&self) -> bool {
        self.pairs.values().all(|g| g.read != g.write)
    }

    /// Iterate over `(key, generation)` pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (BufferKey, Generation)> + '_ {
        self.pairs.iter().map(|(k, g)| (*k, *g))
    }
}

impl Default for GenerationTable {
    fn default() -> Self {
        Self::new()
    }
}
