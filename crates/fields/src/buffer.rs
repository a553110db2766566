//! Single-quantity buffers.
//!
//! A [`Buffer`] owns the arrays of one quantity: one array for plain and
//! reduction-only quantities, two for double-buffered ones. All arrays share
//! the element type and the element count fixed at allocation.

use std::any::Any;
use std::fmt;
use std::mem::size_of;

use bytemuck::Zeroable;

use crate::error::BufferError;
use crate::quantity::{BufferKey, Family, FamilyKind, Quantity, Reorderable};

/// Typed storage for one quantity.
pub struct Buffer<Q: Quantity> {
    arrays: Vec<Vec<Q::Element>>,
    elements: usize,
    /// Byte pattern every element is initialized with.
    fill: u8,
    allocated: bool,
}

impl<Q: Quantity> Buffer<Q> {
    /// Create an unallocated buffer whose arrays will be zero-filled.
    pub fn new() -> Self {
        Self::with_fill(0)
    }

    /// Create an unallocated buffer whose arrays will be filled with `fill`
    /// on every byte (memset semantics).
    pub fn with_fill(fill: u8) -> Self {
        Self {
            arrays: Vec::new(),
            elements: 0,
            fill,
            allocated: false,
        }
    }

    /// Key of the quantity.
    pub fn key(&self) -> BufferKey {
        Q::KEY
    }

    /// Name of the quantity.
    pub fn name(&self) -> &'static str {
        Q::NAME
    }

    /// Byte pattern used at allocation.
    pub fn fill(&self) -> u8 {
        self.fill
    }

    /// Size in bytes of one element.
    pub fn element_size(&self) -> usize {
        size_of::<Q::Element>()
    }

    /// Number of arrays (generations) this buffer owns.
    pub fn array_count(&self) -> usize {
        <Q::Family as Family>::ARRAYS
    }

    /// Element count set at allocation, 0 before.
    pub fn len(&self) -> usize {
        self.elements
    }

    /// Returns `true` if no elements are allocated.
    pub fn is_empty(&self) -> bool {
        self.elements == 0
    }

    /// Whether [`allocate`](Self::allocate) has succeeded on this instance.
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }

    /// Allocate every array with `elements` entries and return the total
    /// number of bytes allocated.
    ///
    /// Can only be called once per instance.
    pub fn allocate(&mut self, elements: usize) -> Result<usize, BufferError> {
        let name = Q::NAME;
        if self.allocated {
            return Err(BufferError::AlreadyAllocated { name });
        }
        let count = self.array_count();
        let bytes = elements
            .checked_mul(self.element_size())
            .and_then(|b| b.checked_mul(count))
            .ok_or(BufferError::SizeOverflow { name, elements })?;

        let mut arrays = Vec::with_capacity(count);
        for _ in 0..count {
            let mut array: Vec<Q::Element> = Vec::new();
            array
                .try_reserve_exact(elements)
                .map_err(|_| BufferError::Allocation { name, bytes })?;
            array.resize(elements, <Q::Element as Zeroable>::zeroed());
            if self.fill != 0 {
                bytemuck::cast_slice_mut::<Q::Element, u8>(&mut array).fill(self.fill);
            }
            arrays.push(array);
        }

        self.arrays = arrays;
        self.elements = elements;
        self.allocated = true;
        Ok(bytes)
    }

    /// Array of generation `index`, or `None` if the index is out of range
    /// or the buffer is unallocated.
    pub fn get(&self, index: usize) -> Option<&[Q::Element]> {
        self.arrays.get(index).map(Vec::as_slice)
    }

    /// Mutable array of generation `index`.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut [Q::Element]> {
        self.arrays.get_mut(index).map(Vec::as_mut_slice)
    }

    /// Array of generation `index` starting at element `offset`.
    pub fn get_with_offset(&self, index: usize, offset: usize) -> Option<&[Q::Element]> {
        self.get(index)?.get(offset..)
    }

    /// Mutable array of generation `index` starting at element `offset`.
    pub fn get_with_offset_mut(
        &mut self,
        index: usize,
        offset: usize,
    ) -> Option<&mut [Q::Element]> {
        self.get_mut(index)?.get_mut(offset..)
    }

    /// Borrow generation `read` immutably and generation `write` mutably at
    /// the same time. `None` if either is out of range or they coincide.
    pub fn split_generations(
        &mut self,
        read: usize,
        write: usize,
    ) -> Option<(&[Q::Element], &mut [Q::Element])> {
        if read == write || read >= self.arrays.len() || write >= self.arrays.len() {
            return None;
        }
        if read < write {
            let (head, tail) = self.arrays.split_at_mut(write);
            Some((head[read].as_slice(), tail[0].as_mut_slice()))
        } else {
            let (head, tail) = self.arrays.split_at_mut(read);
            Some((tail[0].as_slice(), head[write].as_mut_slice()))
        }
    }

    fn swap_in_place(&mut self, i: usize, j: usize, index: usize) -> bool {
        match self.arrays.get_mut(index) {
            Some(array) if i < array.len() && j < array.len() => {
                array.swap(i, j);
                true
            }
            _ => false,
        }
    }
}

impl<Q: Quantity> Buffer<Q>
where
    Q::Family: Reorderable,
{
    /// Exchange elements `i` and `j` of generation `index`.
    ///
    /// Returns `false` (and does nothing) if the generation or either element
    /// is out of range.
    pub fn swap_elements(&mut self, i: usize, j: usize, index: usize) -> bool {
        self.swap_in_place(i, j, index)
    }
}

impl<Q: Quantity> Default for Buffer<Q> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Q: Quantity> fmt::Debug for Buffer<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &Q::NAME)
            .field("elements", &self.elements)
            .field("arrays", &self.array_count())
            .field("allocated", &self.allocated)
            .finish()
    }
}

/// Type-erased view of a buffer.
///
/// Transfer, reduction and dump code work through this trait without knowing
/// the concrete quantity: sizes are queried, data is moved as bytes.
pub trait ErasedBuffer: Any + Send + Sync {
    /// Single-bit key of the quantity.
    fn key(&self) -> BufferKey;

    /// Name of the quantity.
    fn name(&self) -> &'static str;

    /// Family of the quantity.
    fn family(&self) -> FamilyKind;

    /// Size in bytes of one element.
    fn element_size(&self) -> usize;

    /// Number of arrays.
    fn array_count(&self) -> usize;

    /// Element count of each array.
    fn len(&self) -> usize;

    /// Returns `true` if the arrays hold no element.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the arrays have been allocated.
    fn is_allocated(&self) -> bool;

    /// Allocate the arrays, see [`Buffer::allocate`].
    fn allocate(&mut self, elements: usize) -> Result<usize, BufferError>;

    /// Bytes of generation `index`.
    fn bytes(&self, index: usize) -> Option<&[u8]>;

    /// Mutable bytes of generation `index`.
    fn bytes_mut(&mut self, index: usize) -> Option<&mut [u8]>;

    /// Exchange two elements of generation `index`.
    ///
    /// Fails with [`BufferError::Unsupported`] for reduction-only buffers;
    /// otherwise returns whether the swap took place.
    fn swap_elements(&mut self, i: usize, j: usize, index: usize) -> Result<bool, BufferError>;

    /// Upcast for typed downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Mutable upcast for typed downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Total bytes held by all arrays.
    fn size_in_bytes(&self) -> usize {
        self.element_size() * self.array_count() * self.len()
    }

    /// Bytes of generation `index` starting at element `offset`.
    fn bytes_from(&self, index: usize, offset: usize) -> Option<&[u8]> {
        let start = offset.checked_mul(self.element_size())?;
        self.bytes(index)?.get(start..)
    }

    /// Mutable bytes of generation `index` starting at element `offset`.
    fn bytes_from_mut(&mut self, index: usize, offset: usize) -> Option<&mut [u8]> {
        let start = offset.checked_mul(self.element_size())?;
        self.bytes_mut(index)?.get_mut(start..)
    }
}

impl<Q: Quantity> ErasedBuffer for Buffer<Q> {
    fn key(&self) -> BufferKey {
        Q::KEY
    }

    fn name(&self) -> &'static str {
        Q::NAME
    }

    fn family(&self) -> FamilyKind {
        <Q::Family as Family>::KIND
    }

    fn element_size(&self) -> usize {
        Buffer::element_size(self)
    }

    fn array_count(&self) -> usize {
        Buffer::array_count(self)
    }

    fn len(&self) -> usize {
        self.elements
    }

    fn is_allocated(&self) -> bool {
        self.allocated
    }

    fn allocate(&mut self, elements: usize) -> Result<usize, BufferError> {
        Buffer::allocate(self, elements)
    }

    fn bytes(&self, index: usize) -> Option<&[u8]> {
        self.get(index).map(bytemuck::cast_slice)
    }

    fn bytes_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        self.get_mut(index).map(bytemuck::cast_slice_mut)
    }

    fn swap_elements(&mut self, i: usize, j: usize, index: usize) -> Result<bool, BufferError> {
        if !ErasedBuffer::family(self).is_reorderable() {
            return Err(BufferError::Unsupported {
                op: "swap elements",
                name: Q::NAME,
            });
        }
        Ok(self.swap_in_place(i, j, index))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::{Cfl, Hash, Info, Pos, Vel};
    use crate::types::ParticleInfo;

    #[test]
    fn unallocated_buffer_has_no_arrays() {
        let buf = Buffer::<Vel>::new();
        assert!(!buf.is_allocated());
        assert!(buf.get(0).is_none());
        assert!(buf.get_with_offset(0, 0).is_none());
        assert_eq!(buf.array_count(), 2);
    }

    #[test]
    fn allocate_reports_total_bytes() {
        let mut buf = Buffer::<Pos>::new();
        let bytes = buf.allocate(100).unwrap();
        assert_eq!(bytes, 100 * 16 * 2);
        assert_eq!(bytes, buf.element_size() * buf.array_count() * buf.len());
        assert_eq!(buf.get(0).unwrap().len(), 100);
        assert_eq!(buf.get(1).unwrap().len(), 100);
        assert!(buf.get(2).is_none());
    }

    #[test]
    fn allocate_twice_fails() {
        let mut buf = Buffer::<Hash>::new();
        buf.allocate(4).unwrap();
        assert_eq!(
            buf.allocate(4),
            Err(BufferError::AlreadyAllocated { name: "Hash" })
        );
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn fill_pattern_is_bytewise() {
        let mut buf = Buffer::<Hash>::with_fill(0xFF);
        buf.allocate(3).unwrap();
        assert_eq!(buf.get(0).unwrap(), &[u32::MAX; 3]);
    }

    #[test]
    fn offset_access() {
        let mut buf = Buffer::<Hash>::new();
        buf.allocate(5).unwrap();
        buf.get_mut(0).unwrap().copy_from_slice(&[0, 1, 2, 3, 4]);
        assert_eq!(buf.get_with_offset(0, 3).unwrap(), &[3, 4]);
        assert_eq!(buf.get_with_offset(0, 5).unwrap(), &[] as &[u32]);
        assert!(buf.get_with_offset(0, 6).is_none());
        assert!(buf.get_with_offset(1, 0).is_none());
    }

    #[test]
    fn swap_elements_typed() {
        let mut buf = Buffer::<Info>::new();
        buf.allocate(2).unwrap();
        buf.get_mut(1).unwrap()[0] = ParticleInfo::fluid(7);
        assert!(buf.swap_elements(0, 1, 1));
        assert_eq!(buf.get(1).unwrap()[1].id, 7);
        assert!(!buf.swap_elements(0, 2, 1));
        assert!(!buf.swap_elements(0, 1, 2));
    }

    #[test]
    fn erased_emptiness_follows_allocation() {
        let mut buf = Buffer::<Cfl>::new();
        assert!(ErasedBuffer::is_empty(&buf));
        buf.allocate(3).unwrap();
        let erased: &dyn ErasedBuffer = &buf;
        assert!(!erased.is_empty());
        assert_eq!(erased.len(), 3);
    }

    #[test]
    fn reduction_buffers_refuse_erased_swap() {
        let mut buf = Buffer::<Cfl>::new();
        buf.allocate(2).unwrap();
        let erased: &mut dyn ErasedBuffer = &mut buf;
        assert_eq!(
            erased.swap_elements(0, 1, 0),
            Err(BufferError::Unsupported {
                op: "swap elements",
                name: "CFL"
            })
        );
    }

    #[test]
    fn split_generations_borrows_both() {
        let mut buf = Buffer::<Vel>::new();
        buf.allocate(2).unwrap();
        buf.get_mut(1).unwrap()[0] = [1.0, 2.0, 3.0, 4.0];
        let (read, write) = buf.split_generations(1, 0).unwrap();
        write[0] = read[0];
        assert_eq!(buf.get(0).unwrap()[0], [1.0, 2.0, 3.0, 4.0]);
        assert!(buf.split_generations(0, 0).is_none());
        assert!(buf.split_generations(0, 2).is_none());
    }

    #[test]
    fn erased_bytes_follow_element_size() {
        let mut buf = Buffer::<Vel>::new();
        buf.allocate(10).unwrap();
        let erased: &dyn ErasedBuffer = &buf;
        assert_eq!(erased.bytes(0).unwrap().len(), 160);
        assert_eq!(erased.bytes_from(1, 4).unwrap().len(), 96);
        assert_eq!(erased.size_in_bytes(), 320);
    }
}
