//! Keyed collection of buffers owned by one device.

use std::collections::BTreeMap;
use std::fmt;

use crate::buffer::{Buffer, ErasedBuffer};
use crate::error::BufferError;
use crate::quantity::{BufferKey, Quantity, Reorderable};

/// Map from quantity key to the buffer holding that quantity.
///
/// The list owns its buffers exclusively: dropping or clearing it frees every
/// array. At most one buffer exists per key, and the typed accessors resolve
/// a key through its [`Quantity`] so the element type always matches.
#[derive(Default)]
pub struct BufferList {
    buffers: BTreeMap<BufferKey, Box<dyn ErasedBuffer>>,
}

impl BufferList {
    /// Create an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffers in the list.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Returns `true` if the list holds no buffer.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Whether a buffer for `key` is present.
    pub fn contains(&self, key: BufferKey) -> bool {
        self.buffers.contains_key(&key)
    }

    /// Union of the keys of every buffer in the list.
    pub fn keys(&self) -> BufferKey {
        self.buffers
            .keys()
            .fold(BufferKey::empty(), |acc, key| acc | *key)
    }

    /// Take ownership of `buffer`.
    ///
    /// Fails if a buffer for the same key is already present; the existing
    /// buffer is left untouched.
    pub fn insert<Q: Quantity>(&mut self, buffer: Buffer<Q>) -> Result<&mut Self, BufferError> {
        if self.buffers.contains_key(&Q::KEY) {
            return Err(BufferError::DuplicateKey { name: Q::NAME });
        }
        self.buffers.insert(Q::KEY, Box::new(buffer));
        Ok(self)
    }

    /// Insert a fresh zero-filled buffer for `Q`.
    pub fn add<Q: Quantity>(&mut self) -> Result<&mut Self, BufferError> {
        self.insert(Buffer::<Q>::new())
    }

    /// Insert a fresh buffer for `Q` filled with `fill` on every byte.
    pub fn add_with_fill<Q: Quantity>(&mut self, fill: u8) -> Result<&mut Self, BufferError> {
        self.insert(Buffer::<Q>::with_fill(fill))
    }

    /// Drop every buffer and empty the list.
    pub fn clear(&mut self) {
        self.buffers.clear();
    }

    /// Typed buffer for `Q`.
    pub fn get<Q: Quantity>(&self) -> Option<&Buffer<Q>> {
        self.buffers.get(&Q::KEY)?.as_any().downcast_ref()
    }

    /// Mutable typed buffer for `Q`.
    pub fn get_mut<Q: Quantity>(&mut self) -> Option<&mut Buffer<Q>> {
        self.buffers.get_mut(&Q::KEY)?.as_any_mut().downcast_mut()
    }

    /// Array of generation `index` of `Q`, or `None` if the buffer is absent,
    /// unallocated, or has no such generation.
    pub fn data<Q: Quantity>(&self, index: usize) -> Option<&[Q::Element]> {
        self.get::<Q>()?.get(index)
    }

    /// Mutable array of generation `index` of `Q`.
    pub fn data_mut<Q: Quantity>(&mut self, index: usize) -> Option<&mut [Q::Element]> {
        self.get_mut::<Q>()?.get_mut(index)
    }

    /// Array of generation `index` of `Q` starting at element `offset`.
    pub fn data_from<Q: Quantity>(&self, index: usize, offset: usize) -> Option<&[Q::Element]> {
        self.get::<Q>()?.get_with_offset(index, offset)
    }

    /// Exchange elements `i` and `j` of generation `index` of `Q`.
    ///
    /// Only available for reorderable families; returns `false` when the
    /// buffer is absent or an index is out of range.
    pub fn swap<Q: Quantity>(&mut self, i: usize, j: usize, index: usize) -> bool
    where
        Q::Family: Reorderable,
    {
        self.get_mut::<Q>()
            .is_some_and(|buf| buf.swap_elements(i, j, index))
    }

    /// Type-erased buffer for `key`.
    pub fn erased(&self, key: BufferKey) -> Option<&dyn ErasedBuffer> {
        self.buffers.get(&key).map(|buf| &**buf)
    }

    /// Mutable type-erased buffer for `key`.
    pub fn erased_mut(&mut self, key: BufferKey) -> Option<&mut (dyn ErasedBuffer + 'static)> {
        self.buffers.get_mut(&key).map(|buf| &mut **buf)
    }

    /// Iterate over every buffer in key order.
    pub fn iter(&self) -> impl Iterator<Item = &(dyn ErasedBuffer + 'static)> {
        self.buffers.values().map(|buf| &**buf)
    }

    /// Allocate the buffer for `key` and return the bytes allocated.
    pub fn allocate(&mut self, key: BufferKey, elements: usize) -> Result<usize, BufferError> {
        self.erased_mut(key)
            .ok_or(BufferError::NotPresent { key })?
            .allocate(elements)
    }

    /// Allocate every buffer not yet allocated with `elements` entries and
    /// return the total bytes allocated by this call.
    pub fn allocate_all(&mut self, elements: usize) -> Result<usize, BufferError> {
        let mut total = 0;
        for buf in self.buffers.values_mut() {
            if !buf.is_allocated() {
                total += buf.allocate(elements)?;
            }
        }
        tracing::debug!(
            "Allocated {} bytes for {} elements over {} buffers",
            total,
            elements,
            self.buffers.len()
        );
        Ok(total)
    }

    /// Element size of the buffer for `key`.
    pub fn element_size(&self, key: BufferKey) -> Option<usize> {
        self.erased(key).map(|buf| buf.element_size())
    }

    /// Array count of the buffer for `key`.
    pub fn array_count(&self, key: BufferKey) -> Option<usize> {
        self.erased(key).map(|buf| buf.array_count())
    }

    /// Total bytes held by every buffer.
    pub fn size_in_bytes(&self) -> usize {
        self.buffers.values().map(|buf| buf.size_in_bytes()).sum()
    }

    /// Bytes of generation `index` of `key` starting at element `offset`.
    pub fn get_with_offset(&self, key: BufferKey, index: usize, offset: usize) -> Option<&[u8]> {
        self.erased(key)?.bytes_from(index, offset)
    }

    /// Bytes of `count` elements of generation `index` of `key`, starting at
    /// element `first`.
    pub fn byte_range(
        &self,
        key: BufferKey,
        index: usize,
        first: usize,
        count: usize,
    ) -> Option<&[u8]> {
        let buf = self.erased(key)?;
        let (start, end) = byte_bounds(buf.element_size(), first, count)?;
        buf.bytes(index)?.get(start..end)
    }

    /// Mutable bytes of `count` elements of generation `index` of `key`.
    pub fn byte_range_mut(
        &mut self,
        key: BufferKey,
        index: usize,
        first: usize,
        count: usize,
    ) -> Option<&mut [u8]> {
        let buf = self.erased_mut(key)?;
        let (start, end) = byte_bounds(buf.element_size(), first, count)?;
        buf.bytes_mut(index)?.get_mut(start..end)
    }

    /// Exchange two elements of the buffer for `key` without static type
    /// knowledge.
    pub fn swap_elements(
        &mut self,
        key: BufferKey,
        i: usize,
        j: usize,
        index: usize,
    ) -> Result<bool, BufferError> {
        self.erased_mut(key)
            .ok_or(BufferError::NotPresent { key })?
            .swap_elements(i, j, index)
    }
}

fn byte_bounds(element_size: usize, first: usize, count: usize) -> Option<(usize, usize)> {
    let start = first.checked_mul(element_size)?;
    let end = start.checked_add(count.checked_mul(element_size)?)?;
    Some((start, end))
}

impl fmt::Debug for BufferList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.buffers.values().map(|buf| buf.name()))
            .finish()
    }
}
