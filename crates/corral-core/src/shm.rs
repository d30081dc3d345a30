//! Anonymous shared memory that survives `fork`.

use std::num::NonZeroUsize;
use std::ops::Deref;
use std::ptr::NonNull;

use nix::sys::mman::{MapFlags, ProtFlags, mmap_anonymous, munmap};

use crate::error::{Error, Result};

/// A fixed-length slice mapped `MAP_SHARED | MAP_ANONYMOUS`.
///
/// Memory mapped before `fork` is visible to the parent and every child, so
/// writes through atomics in one process are seen by the others. `T` must not
/// hold pointers into process-private memory.
pub(crate) struct SharedSlice<T> {
    ptr: NonNull<T>,
    len: usize,
}

// SAFETY: the mapping is plain memory; `T: Sync` governs concurrent access.
unsafe impl<T: Sync> Send for SharedSlice<T> {}
unsafe impl<T: Sync> Sync for SharedSlice<T> {}

impl<T> SharedSlice<T> {
    /// Map room for `len` elements and initialise them with `init(index)`.
    pub(crate) fn new(len: usize, mut init: impl FnMut(usize) -> T) -> Result<Self> {
        let bytes = std::mem::size_of::<T>()
            .checked_mul(len.max(1))
            .ok_or_else(|| Error::Config("shared table size overflows".to_string()))?;
        let length = NonZeroUsize::new(bytes)
            .ok_or_else(|| Error::Config("shared table has zero size".to_string()))?;
        // SAFETY: a fresh anonymous mapping aliases no existing memory.
        let raw = unsafe {
            mmap_anonymous(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
            )
        }
        .map_err(|errno| Error::Io(errno.into()))?;
        let ptr = raw.cast::<T>();
        for i in 0..len {
            // SAFETY: `i < len` is inside the fresh mapping, which mmap page-aligns.
            unsafe { ptr.as_ptr().add(i).write(init(i)) };
        }
        Ok(Self { ptr, len })
    }
}

impl<T> Deref for SharedSlice<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: `len` elements were initialised in `new` and live until drop.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl<T> Drop for SharedSlice<T> {
    fn drop(&mut self) {
        let bytes = std::mem::size_of::<T>() * self.len.max(1);
        // SAFETY: drops the initialised elements, then unmaps what `new` mapped.
        unsafe {
            std::ptr::drop_in_place(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            ));
            if let Err(errno) = munmap(self.ptr.cast(), bytes) {
                tracing::warn!("failed to unmap shared table: {}", errno);
            }
        }
    }
}
