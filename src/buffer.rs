//! Cache-line aligned row buffers and the raw views threads use to write
//! into them concurrently.
use std::marker::PhantomData;

use crate::error::{Error, Result};
use crate::row::Row;

pub const CACHE_LINE_SIZE: usize = 64;
pub const ROWS_PER_CACHE_LINE: usize = CACHE_LINE_SIZE / size_of::<Row>();

#[derive(Copy, Clone, Debug)]
#[repr(C, align(64))]
pub struct CacheLine(pub [Row; ROWS_PER_CACHE_LINE]);

impl CacheLine {
    pub const fn splat(row: Row) -> Self {
        Self([row; ROWS_PER_CACHE_LINE])
    }
}

/// Wrapper to send raw pointers across thread boundaries.
///
/// Safety: callers must ensure threads write to disjoint memory regions.
#[derive(Copy, Clone)]
pub(crate) struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

impl<T> SendPtr<T> {
    #[inline(always)]
    pub(crate) fn get(self) -> *mut T {
        self.0
    }
}

/// Heap buffer of rows whose first row sits on a cache-line boundary.
///
/// Used as the destination of partitioning passes. Slots that no pass writes
/// keep the fill row they were allocated with.
pub struct PartitionBuffer {
    lines: Vec<CacheLine>,
    len: usize,
}

impl PartitionBuffer {
    /// Allocates `len` rows, every one initialized to `fill`.
    ///
    /// Allocation failure is reported instead of aborting so the caller can
    /// name the failing site.
    pub fn allocate(len: usize, fill: Row, site: &'static str) -> Result<Self> {
        let num_lines = len.div_ceil(ROWS_PER_CACHE_LINE);
        let mut lines = Vec::new();
        lines
            .try_reserve_exact(num_lines)
            .map_err(|_| Error::Allocation {
                site,
                bytes: num_lines * CACHE_LINE_SIZE,
            })?;
        lines.resize(num_lines, CacheLine::splat(fill));
        Ok(Self { lines, len })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[Row] {
        unsafe { std::slice::from_raw_parts(self.lines.as_ptr() as *const Row, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [Row] {
        unsafe { std::slice::from_raw_parts_mut(self.lines.as_mut_ptr() as *mut Row, self.len) }
    }

    /// Hands out a shared view for concurrent disjoint writes. The view
    /// borrows the buffer mutably, so no safe access can overlap with it.
    pub(crate) fn shared(&mut self) -> SharedRows<'_> {
        SharedRows {
            ptr: SendPtr(self.lines.as_mut_ptr() as *mut Row),
            len: self.len,
            _marker: PhantomData,
        }
    }
}

/// A whole buffer that several threads write through at once.
#[derive(Copy, Clone)]
pub(crate) struct SharedRows<'a> {
    ptr: SendPtr<Row>,
    len: usize,
    _marker: PhantomData<&'a mut [Row]>,
}

impl<'a> SharedRows<'a> {
    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// A sub-range of the buffer.
    pub(crate) fn span(&self, offset: usize, len: usize) -> RowSpan<'a> {
        assert!(offset + len <= self.len, "span {offset}+{len} out of {}", self.len);
        RowSpan {
            ptr: SendPtr(unsafe { self.ptr.get().add(offset) }),
            len,
            _marker: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn whole(&self) -> RowSpan<'a> {
        self.span(0, self.len)
    }

    #[inline(always)]
    pub(crate) fn as_ptr(&self) -> *mut Row {
        self.ptr.get()
    }
}

/// A sub-range of a [`PartitionBuffer`] owned by exactly one task at a time.
#[derive(Copy, Clone)]
pub struct RowSpan<'a> {
    ptr: SendPtr<Row>,
    len: usize,
    _marker: PhantomData<&'a mut [Row]>,
}

impl<'a> RowSpan<'a> {
    pub(crate) fn empty() -> Self {
        Self {
            ptr: SendPtr(std::ptr::NonNull::dangling().as_ptr()),
            len: 0,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A sub-range of this span.
    pub(crate) fn sub(&self, offset: usize, len: usize) -> RowSpan<'a> {
        assert!(offset + len <= self.len, "span {offset}+{len} out of {}", self.len);
        RowSpan {
            ptr: SendPtr(unsafe { self.ptr.get().add(offset) }),
            len,
            _marker: PhantomData,
        }
    }

    /// Same start, different length. The caller guarantees the widened
    /// range stays inside the backing buffer.
    pub(crate) unsafe fn with_len(&self, len: usize) -> RowSpan<'a> {
        RowSpan {
            ptr: self.ptr,
            len,
            _marker: PhantomData,
        }
    }

    /// # Safety
    /// No thread may write this range while the slice is alive.
    pub unsafe fn as_slice(&self) -> &'a [Row] {
        unsafe { std::slice::from_raw_parts(self.ptr.get(), self.len) }
    }

    /// # Safety
    /// The caller must be the only thread touching this range.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &'a mut [Row] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.get(), self.len) }
    }
}
