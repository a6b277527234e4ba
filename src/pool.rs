//! Socket-level receive buffer pool.
//!
//! Each socket registers one contiguous region that is carved into
//! fixed-size bpages. Incoming message data is copied directly into bpages
//! owned by the message, the receiving user consumes it in place, and the
//! bpages return to the free list only when the user releases them.

use std::ptr::{self, NonNull};
use std::slice;
use std::sync::Mutex;

use crate::error::{HomaError, Result};
use crate::type_alias::*;
use crate::util::unlikely;

/// Number of bytes in a bpage. Must be a power of two.
pub const HOMA_BPAGE_SIZE: usize = 1 << 16;

/// Maximum bytes of payload in a Homa request or response message.
pub const HOMA_MAX_MESSAGE_LENGTH: usize = 1_000_000;

/// The largest number of bpages an incoming message can require.
pub const HOMA_MAX_BPAGES: usize =
    (HOMA_MAX_MESSAGE_LENGTH + HOMA_BPAGE_SIZE - 1) / HOMA_BPAGE_SIZE;

/// Backing memory of one pool. The kernel transport works on a region the
/// user mmaps and registers; this models the same thing with one anonymous
/// private mapping. Bpages are page-sized multiples, so the mapping is
/// already bpage-aligned, and the address must stay stable for the pool's
/// lifetime: the dispatcher writes into it and the user reads from it
/// through raw pointers.
struct PoolRegion {
    base: NonNull<u8>,
    len: usize,
}

// Raw pointers into the mapping are handed across threads; access is
// serialized by bpage ownership, not by the pointer type.
unsafe impl Send for PoolRegion {}
unsafe impl Sync for PoolRegion {}

impl PoolRegion {
    fn map(len: usize) -> Result<Self> {
        // SAFETY: FFI.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if unlikely(ptr == libc::MAP_FAILED) {
            log::warn!("failed to map a {}KB buffer region", len >> 10);
            return Err(HomaError::NoBufferSpace);
        }

        // SAFETY: mmap never returns null on success.
        let base = unsafe { NonNull::new_unchecked(ptr as *mut u8) };
        Ok(Self { base, len })
    }
}

impl Drop for PoolRegion {
    fn drop(&mut self) {
        // SAFETY: FFI; the mapping was created with exactly this length.
        unsafe {
            assert!(
                libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) == 0,
                "munmap failed"
            );
        }
    }
}

/// The buffer pool of one socket.
pub(crate) struct Pool {
    /// Backing region; bpage `i` occupies
    /// `[i * HOMA_BPAGE_SIZE, (i + 1) * HOMA_BPAGE_SIZE)`.
    region: PoolRegion,

    /// Total bpages in the region.
    num_bpages: usize,

    /// Free bpage indices, most recently freed on top.
    free: Mutex<Vec<BpageIdx>>,
}

impl Pool {
    /// Register a pool region of the given length. The length must be a
    /// positive multiple of [`HOMA_BPAGE_SIZE`]; anything else is rejected,
    /// matching the strict validation of the setsockopt contract. A mapping
    /// failure surfaces as `NoBufferSpace`.
    pub fn new(region_len: usize) -> Result<Self> {
        if region_len == 0 || region_len % HOMA_BPAGE_SIZE != 0 {
            return Err(HomaError::InvalidArgument);
        }

        let num_bpages = region_len / HOMA_BPAGE_SIZE;
        Ok(Self {
            region: PoolRegion::map(region_len)?,
            num_bpages,
            // LIFO keeps recently-touched pages hot.
            free: Mutex::new((0..num_bpages as BpageIdx).rev().collect()),
        })
    }

    /// Number of bpages currently on the free list.
    pub fn free_bpages(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Total bpages in the region.
    #[inline(always)]
    pub fn num_bpages(&self) -> usize {
        self.num_bpages
    }

    /// Take one bpage off the free list.
    pub fn alloc_bpage(&self) -> Option<BpageIdx> {
        self.free.lock().unwrap().pop()
    }

    /// Return bpages to the free list.
    pub fn free_bpages_list(&self, indices: &[BpageIdx]) {
        let mut free = self.free.lock().unwrap();
        for &idx in indices {
            debug_assert!((idx as usize) < self.num_bpages, "bad bpage index {}", idx);
            debug_assert!(!free.contains(&idx), "double free of bpage {}", idx);
            free.push(idx);
        }
    }

    /// Copy `data` into the page at `bpage`, starting `offset` bytes in.
    ///
    /// The caller must own the bpage (it is on no free list and belongs to
    /// exactly one incomplete message), which makes the write race-free.
    pub fn write(&self, bpage: BpageIdx, offset: usize, data: &[u8]) {
        debug_assert!((bpage as usize) < self.num_bpages);
        debug_assert!(offset + data.len() <= HOMA_BPAGE_SIZE);

        // SAFETY: in-bounds by the asserts above; exclusive by ownership.
        unsafe {
            let dst = self
                .region
                .base
                .as_ptr()
                .add(bpage as usize * HOMA_BPAGE_SIZE + offset);
            ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
    }

    /// View `len` bytes of the page at `bpage`, starting `offset` bytes in.
    ///
    /// Sound only for bpages of a completed message: the dispatcher stops
    /// writing a bpage once the owning message is complete, and the user
    /// holds it until release.
    pub fn read(&self, bpage: BpageIdx, offset: usize, len: usize) -> &[u8] {
        assert!((bpage as usize) < self.num_bpages);
        assert!(offset + len <= HOMA_BPAGE_SIZE);

        // SAFETY: in-bounds by the asserts above.
        unsafe {
            let src = self
                .region
                .base
                .as_ptr()
                .add(bpage as usize * HOMA_BPAGE_SIZE + offset);
            slice::from_raw_parts(src, len)
        }
    }

    /// Start address of the region (for diagnostics).
    #[allow(dead_code)]
    pub fn base(&self) -> NonNull<u8> {
        self.region.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_unaligned_region() {
        assert!(Pool::new(0).is_err());
        assert!(Pool::new(HOMA_BPAGE_SIZE - 1).is_err());
        assert!(Pool::new(HOMA_BPAGE_SIZE + 1).is_err());
        assert!(Pool::new(3 * HOMA_BPAGE_SIZE).is_ok());
    }

    #[test]
    fn test_alloc_free_cycle() {
        let pool = Pool::new(4 * HOMA_BPAGE_SIZE).unwrap();
        assert_eq!(pool.free_bpages(), 4);

        let a = pool.alloc_bpage().unwrap();
        let b = pool.alloc_bpage().unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.free_bpages(), 2);

        pool.free_bpages_list(&[a, b]);
        assert_eq!(pool.free_bpages(), 4);
    }

    #[test]
    fn test_exhaustion() {
        let pool = Pool::new(2 * HOMA_BPAGE_SIZE).unwrap();
        let _a = pool.alloc_bpage().unwrap();
        let _b = pool.alloc_bpage().unwrap();
        assert!(pool.alloc_bpage().is_none());
    }

    #[test]
    fn test_write_then_read() {
        let pool = Pool::new(2 * HOMA_BPAGE_SIZE).unwrap();
        let page = pool.alloc_bpage().unwrap();

        pool.write(page, 100, b"hello");
        assert_eq!(pool.read(page, 100, 5), b"hello");
    }
}
