//! Aligned Memory
//!
//! Owned 64-byte-aligned byte buffers for tensor storage and a read-only
//! memory map over model files. Weight views borrow from the map; everything
//! the kernels allocate goes through [`AlignedBuf`].

use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::Error;

/// Alignment used for every owned tensor buffer.
pub const ALIGNMENT: usize = 64;

/// Owned, zero-initialized byte buffer aligned to [`ALIGNMENT`] bytes.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
}

impl AlignedBuf {
    /// Allocate `len` zeroed bytes. A zero-length buffer holds no allocation.
    pub fn new(len: usize) -> Self {
        if len == 0 {
            return Self {
                ptr: NonNull::dangling(),
                len: 0,
            };
        }
        let layout = Layout::from_size_align(len, ALIGNMENT).expect("valid layout");
        // Zeroed so that fresh tensors start out as all-zeros, which the
        // decoder start states rely on.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self { ptr, len }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = Self::new(bytes.len());
        buf.copy_from_slice(bytes);
        buf
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        if self.len != 0 {
            let layout = Layout::from_size_align(self.len, ALIGNMENT).expect("valid layout");
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl Clone for AlignedBuf {
    fn clone(&self) -> Self {
        Self::from_bytes(self)
    }
}

// The buffer is uniquely owned plain bytes.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

/// Read-only file view shared by every thread holding weight tensors.
#[derive(Clone)]
pub struct MemoryMap {
    map: Arc<Mmap>,
}

impl MemoryMap {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let map = unsafe { Mmap::map(&file) }.map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { map: Arc::new(map) })
    }

    /// Wrap bytes already in memory. Used when the caller hands the model
    /// over as a blob instead of a path (browser-style embedding).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        // Mmap of an anonymous region keeps the one storage representation.
        let mut map = memmap2::MmapMut::map_anon(bytes.len().max(1)).expect("anonymous map");
        map[..bytes.len()].copy_from_slice(&bytes);
        let map = map.make_read_only().expect("freeze anonymous map");
        Self { map: Arc::new(map) }
    }

    pub fn data(&self) -> &[u8] {
        &self.map
    }

    pub fn share(&self) -> Arc<Mmap> {
        Arc::clone(&self.map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_allocation() {
        let buf = AlignedBuf::new(100);
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.as_ptr() as usize % ALIGNMENT, 0);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_clone_copies() {
        let mut a = AlignedBuf::new(16);
        a[0] = 7;
        let b = a.clone();
        assert_eq!(b[0], 7);
        assert_ne!(a.as_ptr(), b.as_ptr());
    }

    #[test]
    fn test_map_from_bytes() {
        let map = MemoryMap::from_bytes(vec![1, 2, 3]);
        assert_eq!(&map.data()[..3], &[1, 2, 3]);
    }
}
