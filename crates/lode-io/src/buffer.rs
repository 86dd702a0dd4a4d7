//! Output buffers for read requests.
//!
//! A [`ReadBuffer`] over-allocates its backing `Vec` and starts at the first
//! aligned byte, which gives stages a stable, checkable start address. The
//! backing storage is never resized after construction.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;

/// Buffer shared between the caller and the stages writing into it.
///
/// Only one side touches the bytes at a time: stages write while the request
/// is in flight, the caller reads once it has completed.
pub type SharedBuffer = Arc<Mutex<ReadBuffer>>;

/// Wrap a buffer for sharing with the streaming stack.
pub fn shared_buffer(buffer: ReadBuffer) -> SharedBuffer {
    Arc::new(Mutex::new(buffer))
}

/// Owned byte buffer with an optionally aligned start.
#[derive(Clone, Default)]
pub struct ReadBuffer {
    storage: Vec<u8>,
    start: usize,
    len: usize,
}

impl ReadBuffer {
    /// Take ownership of caller memory. No alignment is guaranteed.
    pub fn from_vec(storage: Vec<u8>) -> Self {
        let len = storage.len();
        Self {
            storage,
            start: 0,
            len,
        }
    }

    /// Zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    /// Zero-filled buffer of `len` bytes whose first byte sits on an
    /// `alignment` boundary.
    pub fn aligned(len: usize, alignment: usize) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidAlignment(alignment));
        }
        let storage = vec![0u8; len + alignment - 1];
        let address = storage.as_ptr() as usize;
        let start = (alignment - (address % alignment)) % alignment;
        Ok(Self {
            storage,
            start,
            len,
        })
    }

    /// Usable length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no usable bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first usable byte.
    #[inline]
    pub fn address(&self) -> usize {
        self.storage.as_ptr() as usize + self.start
    }

    /// Whether the byte at `offset` sits on an `alignment` boundary.
    pub fn is_aligned_at(&self, offset: usize, alignment: usize) -> bool {
        alignment <= 1 || (self.address() + offset) % alignment == 0
    }

    /// The usable bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.start..self.start + self.len]
    }

    /// The usable bytes, mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.start..self.start + self.len]
    }

    /// Copy `data` into the buffer at `offset`.
    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset + data.len();
        if end > self.len {
            return Err(Error::OutOfBounds {
                offset,
                end,
                len: self.len,
            });
        }
        self.as_mut_slice()[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Consume the buffer, returning exactly the usable bytes.
    pub fn into_vec(mut self) -> Vec<u8> {
        if self.start == 0 {
            self.storage.truncate(self.len);
            self.storage
        } else {
            self.as_slice().to_vec()
        }
    }
}

impl std::fmt::Debug for ReadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBuffer")
            .field("len", &self.len)
            .field("address", &format_args!("{:#x}", self.address()))
            .finish()
    }
}
