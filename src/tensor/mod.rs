//! Tensor
//!
//! Typed n-dimensional views over contiguous bytes. A tensor either owns its
//! storage (64-byte aligned, see [`crate::mem::AlignedBuf`]) or borrows a
//! window of the model file map. All layouts are dense row-major with the
//! last dimension contiguous; there are no strides.

use std::fmt;
use std::sync::Arc;

use memmap2::Mmap;

use crate::mem::AlignedBuf;

pub mod ops;

/// Scalar types a tensor can hold.
///
/// `Ig8` marks weights prepared for the integer GEMM provider. The bytes are
/// in the provider's column-major tiling and must not be interpreted as a
/// row-major int8 matrix outside `qgemm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    I8,
    Ig8,
    I32,
    U32,
    F32,
}

impl ElementType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            ElementType::I8 | ElementType::Ig8 => 1,
            ElementType::I32 | ElementType::U32 | ElementType::F32 => 4,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElementType::I8 => "i8",
            ElementType::Ig8 => "ig8",
            ElementType::I32 => "i32",
            ElementType::U32 => "u32",
            ElementType::F32 => "f32",
        };
        write!(f, "{name}")
    }
}

/// Ordered dimensions with a cached element count.
///
/// Index arguments are signed so `-1` addresses the last axis, the same
/// convention the forward path uses throughout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    dims: Vec<usize>,
    elements: usize,
}

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        let elements = dims.iter().product();
        Self { dims, elements }
    }

    pub fn elements(&self) -> usize {
        self.elements
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    fn resolve(&self, idx: isize) -> usize {
        let rank = self.dims.len() as isize;
        let resolved = if idx < 0 { idx + rank } else { idx };
        assert!(
            (0..rank).contains(&resolved),
            "axis {idx} out of range for rank {rank}"
        );
        resolved as usize
    }

    pub fn dim(&self, idx: isize) -> usize {
        self.dims[self.resolve(idx)]
    }

    /// Shape with axes `x` and `y` swapped.
    pub fn transpose(&self, x: isize, y: isize) -> Self {
        let (x, y) = (self.resolve(x), self.resolve(y));
        let mut dims = self.dims.clone();
        dims.swap(x, y);
        Self::new(dims)
    }

    /// Replace one dimension, recomputing the element count.
    pub fn set_dim(&mut self, idx: isize, value: usize) {
        let idx = self.resolve(idx);
        self.dims[idx] = value;
        self.elements = self.dims.iter().product();
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape(")?;
        for (i, dim) in self.dims.iter().enumerate() {
            if i != 0 {
                write!(f, "x")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, ")")
    }
}

enum Storage {
    Owned(AlignedBuf),
    Mapped {
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
    },
}

/// A tagged view over contiguous bytes.
pub struct Tensor {
    ty: ElementType,
    shape: Shape,
    storage: Storage,
    name: String,
}

impl Tensor {
    /// Allocate an owned, zeroed tensor.
    pub fn new(ty: ElementType, shape: Shape, name: impl Into<String>) -> Self {
        let bytes = shape.elements() * ty.size_in_bytes();
        Self {
            ty,
            shape,
            storage: Storage::Owned(AlignedBuf::new(bytes)),
            name: name.into(),
        }
    }

    /// Adopt an already-filled aligned buffer. The buffer may be longer than
    /// the shape requires; prepared weights keep a trailing f32 multiplier
    /// behind the elements.
    pub fn from_buffer(
        buf: AlignedBuf,
        ty: ElementType,
        shape: Shape,
        name: impl Into<String>,
    ) -> Self {
        assert!(shape.elements() * ty.size_in_bytes() <= buf.len());
        Self {
            ty,
            shape,
            storage: Storage::Owned(buf),
            name: name.into(),
        }
    }

    /// Borrow a window of the model file map.
    pub fn from_view(
        map: Arc<Mmap>,
        offset: usize,
        len: usize,
        ty: ElementType,
        shape: Shape,
        name: impl Into<String>,
    ) -> Self {
        assert!(offset + len <= map.len());
        assert!(shape.elements() * ty.size_in_bytes() <= len);
        Self {
            ty,
            shape,
            storage: Storage::Mapped { map, offset, len },
            name: name.into(),
        }
    }

    pub fn ty(&self) -> ElementType {
        self.ty
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dim(&self, idx: isize) -> usize {
        self.shape.dim(idx)
    }

    pub fn size(&self) -> usize {
        self.shape.elements()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the tensor owns its storage rather than borrowing the map.
    pub fn standalone(&self) -> bool {
        matches!(self.storage, Storage::Owned(_))
    }

    /// Raw bytes backing the view, including any trailing multiplier.
    pub fn bytes(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(buf) => buf,
            Storage::Mapped { map, offset, len } => &map[*offset..*offset + *len],
        }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Owned(buf) => buf,
            Storage::Mapped { .. } => panic!("mapped tensor {} is read-only", self.name),
        }
    }

    fn typed<T>(&self, ty_ok: bool) -> &[T] {
        assert!(ty_ok, "type mismatch reading tensor {}", self.name);
        let bytes = self.bytes();
        let count = self.shape.elements();
        assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<T>(), 0);
        unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const T, count) }
    }

    fn typed_mut<T>(&mut self, ty_ok: bool) -> &mut [T] {
        assert!(ty_ok, "type mismatch writing tensor {}", self.name);
        let count = self.shape.elements();
        let bytes = self.bytes_mut();
        assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<T>(), 0);
        unsafe { std::slice::from_raw_parts_mut(bytes.as_mut_ptr() as *mut T, count) }
    }

    pub fn as_f32(&self) -> &[f32] {
        self.typed(self.ty == ElementType::F32)
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        self.typed_mut(self.ty == ElementType::F32)
    }

    pub fn as_i8(&self) -> &[i8] {
        self.typed(matches!(self.ty, ElementType::I8 | ElementType::Ig8))
    }

    pub fn as_i8_mut(&mut self) -> &mut [i8] {
        self.typed_mut(matches!(self.ty, ElementType::I8 | ElementType::Ig8))
    }

    pub fn as_i32(&self) -> &[i32] {
        self.typed(self.ty == ElementType::I32)
    }

    pub fn as_i32_mut(&mut self) -> &mut [i32] {
        self.typed_mut(self.ty == ElementType::I32)
    }

    pub fn as_u32(&self) -> &[u32] {
        self.typed(self.ty == ElementType::U32)
    }

    pub fn as_u32_mut(&mut self) -> &mut [u32] {
        self.typed_mut(self.ty == ElementType::U32)
    }

    /// First element of a scalar f32 tensor.
    pub fn item_f32(&self) -> f32 {
        self.as_f32()[0]
    }

    /// The f32 stored directly behind the elements. Prepared int8 weights
    /// carry their quantization multiplier there.
    pub fn trailing_f32(&self) -> f32 {
        let bytes = self.bytes();
        let offset = self.shape.elements() * self.ty.size_in_bytes();
        assert!(offset + 4 <= bytes.len(), "no trailing f32 in {}", self.name);
        f32::from_le_bytes(bytes[offset..offset + 4].try_into().expect("4 bytes"))
    }

    pub fn fill_f32(&mut self, value: f32) {
        self.as_f32_mut().fill(value);
    }

    /// Owned tensor of the same type and shape, zeroed.
    pub fn like(&self, name: impl Into<String>) -> Self {
        Self::new(self.ty, self.shape.clone(), name)
    }

    /// Deep copy. Always allocates, regardless of whether the source owned
    /// its storage.
    pub fn clone_named(&self, name: impl Into<String>) -> Self {
        let bytes = self.bytes();
        let mut buf = AlignedBuf::new(bytes.len());
        buf.copy_from_slice(bytes);
        Self::from_buffer(buf, self.ty, self.shape.clone(), name)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor({}, {}, {}, {})",
            self.name,
            if self.standalone() { "standalone" } else { "view" },
            self.ty,
            self.shape
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_elements_and_negative_indexing() {
        let shape = Shape::new(vec![2, 3, 4]);
        assert_eq!(shape.elements(), 24);
        assert_eq!(shape.dim(-1), 4);
        assert_eq!(shape.dim(0), 2);
    }

    #[test]
    fn test_shape_transpose_and_set_dim() {
        let shape = Shape::new(vec![2, 3, 4]);
        let t = shape.transpose(-3, -2);
        assert_eq!(t.dims(), &[3, 2, 4]);

        let mut s = shape.clone();
        s.set_dim(-1, 8);
        assert_eq!(s.dims(), &[2, 3, 8]);
        assert_eq!(s.elements(), 48);
    }

    #[test]
    fn test_owned_tensor_zeroed() {
        let t = Tensor::new(ElementType::F32, Shape::new(vec![4, 4]), "z");
        assert!(t.standalone());
        assert!(t.as_f32().iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_clone_always_allocates() {
        let mut t = Tensor::new(ElementType::F32, Shape::new(vec![2, 2]), "a");
        t.as_f32_mut()[0] = 1.5;
        let c = t.clone_named("b");
        assert!(c.standalone());
        assert_eq!(c.as_f32()[0], 1.5);
    }

    #[test]
    fn test_trailing_multiplier() {
        let mut buf = crate::mem::AlignedBuf::new(8 + 4);
        buf[8..12].copy_from_slice(&2.5f32.to_le_bytes());
        let t = Tensor::from_buffer(buf, ElementType::I8, Shape::new(vec![2, 4]), "w");
        assert_eq!(t.trailing_f32(), 2.5);
    }
}
