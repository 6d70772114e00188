//! Concrete buffers for the interpreter.
//!
//! A [`RawBuffer`] is a view: element size, per-dimension descriptors and
//! a byte bias into shared storage. Crops copy the view and narrow the
//! metadata; they never move the storage, so addressing is stable across
//! crops. A folded dimension stores index `i` at `(i mod fold) * stride`,
//! which keeps any window of up to `fold` consecutive indices live.

use std::cell::RefCell;
use std::rc::Rc;

use crate::ir::Index;

/// Runtime descriptor of one buffer dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDim {
    pub min: Index,
    pub extent: Index,
    /// Byte stride between consecutive indices.
    pub stride: Index,
    /// `None` is unfolded storage.
    pub fold_factor: Option<Index>,
}

impl BufferDim {
    pub fn new(min: Index, extent: Index) -> BufferDim {
        BufferDim {
            min,
            extent,
            stride: 0,
            fold_factor: None,
        }
    }

    pub fn max(&self) -> Index {
        self.min + self.extent - 1
    }

    fn offset_bytes(&self, at: Index) -> Index {
        match self.fold_factor {
            Some(f) => at.rem_euclid(f) * self.stride,
            None => at * self.stride,
        }
    }

    // Smallest and largest byte offsets any in-bounds index can produce.
    fn offset_range(&self) -> (Index, Index) {
        match self.fold_factor {
            Some(f) => {
                let edge = (f - 1) * self.stride;
                (edge.min(0), edge.max(0))
            }
            None => {
                let a = self.min * self.stride;
                let b = self.max() * self.stride;
                (a.min(b), a.max(b))
            }
        }
    }
}

/// A concrete buffer view over shared storage.
#[derive(Debug, Clone)]
pub struct RawBuffer {
    pub elem_size: usize,
    pub dims: Vec<BufferDim>,
    base: Index,
    data: Rc<RefCell<Vec<u8>>>,
}

impl RawBuffer {
    /// Allocate fresh storage sized for `dims`, with the byte bias set so
    /// every in-bounds index lands inside it.
    pub fn allocate(elem_size: usize, dims: Vec<BufferDim>) -> RawBuffer {
        if dims.iter().any(|d| d.extent <= 0) {
            return RawBuffer {
                elem_size,
                dims,
                base: 0,
                data: Rc::new(RefCell::new(Vec::new())),
            };
        }
        let mut lo = 0;
        let mut hi = 0;
        for d in &dims {
            let (a, b) = d.offset_range();
            lo += a;
            hi += b;
        }
        let size = (hi - lo) as usize + elem_size;
        RawBuffer {
            elem_size,
            dims,
            base: -lo,
            data: Rc::new(RefCell::new(vec![0u8; size])),
        }
    }

    /// Allocate a buffer with zero minimums and natural dense strides.
    pub fn from_extents(elem_size: usize, extents: &[Index]) -> RawBuffer {
        let bounds: Vec<(Index, Index)> = extents.iter().map(|&e| (0, e)).collect();
        RawBuffer::from_bounds(elem_size, &bounds)
    }

    /// Allocate a buffer from `(min, extent)` pairs with natural dense
    /// strides.
    pub fn from_bounds(elem_size: usize, bounds: &[(Index, Index)]) -> RawBuffer {
        let mut dims = Vec::with_capacity(bounds.len());
        let mut stride = elem_size as Index;
        for &(min, extent) in bounds {
            dims.push(BufferDim {
                min,
                extent,
                stride,
                fold_factor: None,
            });
            stride *= extent.max(1);
        }
        RawBuffer::allocate(elem_size, dims)
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn min(&self, d: usize) -> Index {
        self.dims[d].min
    }

    pub fn max(&self, d: usize) -> Index {
        self.dims[d].max()
    }

    pub fn extent(&self, d: usize) -> Index {
        self.dims[d].extent
    }

    pub fn stride(&self, d: usize) -> Index {
        self.dims[d].stride
    }

    pub fn fold_factor(&self, d: usize) -> Option<Index> {
        self.dims[d].fold_factor
    }

    pub fn size_bytes(&self) -> usize {
        self.data.borrow().len()
    }

    /// Narrow the view along `d` to the intersection with `[min, max]`.
    /// The result may be empty. Storage and addressing are unchanged.
    pub fn crop_dim(&self, d: usize, min: Index, max: Index) -> RawBuffer {
        let mut result = self.clone();
        let dim = &mut result.dims[d];
        let new_min = dim.min.max(min);
        let new_max = dim.max().min(max);
        dim.min = new_min;
        dim.extent = new_max - new_min + 1;
        result
    }

    /// Byte address of a logical index point, if it lies inside storage.
    /// The point is not required to be inside the cropped bounds: folded
    /// producers retain earlier iterations' values at addresses outside
    /// the current crop, and consumers read them back.
    pub fn address(&self, at: &[Index]) -> Option<usize> {
        if at.len() != self.dims.len() {
            return None;
        }
        let mut offset = self.base;
        for (d, &x) in self.dims.iter().zip(at.iter()) {
            offset += d.offset_bytes(x);
        }
        if offset < 0 {
            return None;
        }
        let offset = offset as usize;
        if offset + self.elem_size <= self.data.borrow().len() {
            Some(offset)
        } else {
            None
        }
    }

    pub fn contains(&self, at: &[Index]) -> bool {
        at.len() == self.dims.len()
            && self.dims.iter().zip(at.iter()).all(|(d, &x)| x >= d.min && x <= d.max())
    }

    pub fn read_bytes(&self, at: &[Index]) -> Option<Vec<u8>> {
        let offset = self.address(at)?;
        let data = self.data.borrow();
        Some(data[offset..offset + self.elem_size].to_vec())
    }

    pub fn write_bytes(&self, at: &[Index], bytes: &[u8]) -> bool {
        debug_assert_eq!(bytes.len(), self.elem_size);
        match self.address(at) {
            Some(offset) => {
                let mut data = self.data.borrow_mut();
                data[offset..offset + self.elem_size].copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Visit every index point inside the current bounds, innermost
    /// dimension fastest.
    pub fn for_each_index(&self, mut f: impl FnMut(&[Index])) {
        let rank = self.rank();
        if rank == 0 {
            f(&[]);
            return;
        }
        if self.dims.iter().any(|d| d.extent <= 0) {
            return;
        }
        let mut at: Vec<Index> = self.dims.iter().map(|d| d.min).collect();
        loop {
            f(&at);
            let mut d = 0;
            loop {
                at[d] += 1;
                if at[d] <= self.dims[d].max() {
                    break;
                }
                at[d] = self.dims[d].min;
                d += 1;
                if d == rank {
                    return;
                }
            }
        }
    }
}

/// Element types a typed [`Buffer`] can view.
pub trait Element: Copy {
    const SIZE: usize;
    fn from_bytes(bytes: &[u8]) -> Self;
    fn to_bytes(self) -> Vec<u8>;
}

impl Element for i32 {
    const SIZE: usize = 4;
    fn from_bytes(bytes: &[u8]) -> Self {
        i32::from_le_bytes(bytes.try_into().unwrap())
    }
    fn to_bytes(self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
}

impl Element for i64 {
    const SIZE: usize = 8;
    fn from_bytes(bytes: &[u8]) -> Self {
        i64::from_le_bytes(bytes.try_into().unwrap())
    }
    fn to_bytes(self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
}

/// Typed view over a [`RawBuffer`], for writing stage bodies and tests.
/// Views share storage, so writes go through a shared reference.
#[derive(Debug, Clone)]
pub struct Buffer<T: Element> {
    pub raw: RawBuffer,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Element> Buffer<T> {
    /// Allocate from `(min, extent)` pairs.
    pub fn new(bounds: &[(Index, Index)]) -> Buffer<T> {
        Buffer {
            raw: RawBuffer::from_bounds(T::SIZE, bounds),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn from_extents(extents: &[Index]) -> Buffer<T> {
        Buffer {
            raw: RawBuffer::from_extents(T::SIZE, extents),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn view(raw: RawBuffer) -> Buffer<T> {
        debug_assert_eq!(raw.elem_size, T::SIZE);
        Buffer {
            raw,
            _marker: std::marker::PhantomData,
        }
    }

    pub fn min(&self, d: usize) -> Index {
        self.raw.min(d)
    }

    pub fn max(&self, d: usize) -> Index {
        self.raw.max(d)
    }

    pub fn at(&self, at: &[Index]) -> T {
        let bytes = self.raw.read_bytes(at).expect("access outside buffer storage");
        T::from_bytes(&bytes)
    }

    pub fn set(&self, at: &[Index], value: T) {
        let ok = self.raw.write_bytes(at, &value.to_bytes());
        assert!(ok, "write outside buffer storage");
    }

    pub fn fill_with(&self, mut f: impl FnMut(&[Index]) -> T) {
        let raw = self.raw.clone();
        raw.for_each_index(|at| self.set(at, f(at)));
    }
}
