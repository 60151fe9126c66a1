// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The provided-buffer pool.
//!
//! One anonymous memory mapping holds, in order, the ring of buffer
//! descriptors shared with the kernel and the buffers themselves. The ring
//! is registered under buffer group 0; every receive submission that sets
//! BUFFER_SELECT with that group id lets the kernel pick a buffer, whose
//! index comes back in the high bits of the completion flags.
//!
//! Only the lower half of the buffers is ever published to the kernel. The
//! upper half's indices live on a free stack and serve as scratch space for
//! outgoing payloads, so receive and send buffer indices can never collide.

use log::*;

use std::io;
use std::mem;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use io_uring::types::BufRingEntry;
use io_uring::Submitter;

use crate::Error;

/// The buffer group id used on registration; every receive submission must
/// carry the same id.
pub(crate) const BUFFER_GROUP: u16 = 0;

struct Inner {
    /// Base of the mapping: `entries` descriptors first, buffers after.
    base: *mut u8,
    map_len: usize,
    entries: u16,
    buf_shift: u32,
    /// Mirror of the published tail, including the initial half-batch.
    local_tail: AtomicU16,
    /// Indices of the upper half, reserved for send-side scratch.
    free_send: Mutex<Vec<u16>>,
}

// SAFETY: the mapping is only written by the driver thread (descriptor
// pushes) and the kernel; the send stack is mutex-guarded and the tail is
// atomic.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Drop for Inner {
    fn drop(&mut self) {
        // SAFETY: base/map_len describe the mapping created in new().
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.map_len);
        }
    }
}

/// Cheaply clonable handle to the shared buffer pool.
#[derive(Clone)]
pub(crate) struct BufferPool {
    inner: Arc<Inner>,
}

impl BufferPool {
    /// Maps and initializes the pool. `entries` must be a power of two no
    /// larger than 2^15; each buffer is `1 << buf_shift` bytes.
    pub fn new(entries: u16, buf_shift: u32) -> Result<BufferPool, Error> {
        assert!(entries.is_power_of_two());
        assert!(buf_shift > 0);

        let buf_size = 1usize << buf_shift;
        let map_len = (mem::size_of::<BufRingEntry>() + buf_size) * usize::from(entries);

        // SAFETY: plain anonymous mapping, checked against MAP_FAILED below.
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            let e = io::Error::last_os_error();
            error!("buffer ring mmap failed: {e}");
            return Err(Error::MmapFailed(e));
        }
        let base = base as *mut u8;

        // The ring must not be shared with children; a forked child touching
        // the descriptors would corrupt the kernel's view.
        // SAFETY: base/map_len describe the mapping created above.
        unsafe {
            libc::madvise(base as *mut libc::c_void, map_len, libc::MADV_DONTFORK);
        }

        let inner = Inner {
            base,
            map_len,
            entries,
            buf_shift,
            local_tail: AtomicU16::new(0),
            free_send: Mutex::new((entries / 2..entries).rev().collect()),
        };
        let pool = BufferPool {
            inner: Arc::new(inner),
        };

        // Insert every buffer, then publish only the lower half; the upper
        // half stays on the send stack.
        for i in 0..entries {
            pool.write_descriptor(i, i);
        }
        pool.inner
            .local_tail
            .store(entries / 2, Ordering::Relaxed);
        pool.publish();

        Ok(pool)
    }

    /// Registers the descriptor ring with the kernel under group id 0.
    pub fn register(&self, submitter: &Submitter<'_>) -> Result<(), Error> {
        // SAFETY: the ring memory stays valid until Inner is dropped, and
        // the ring fd is closed before that (field order in Ring).
        let res = unsafe {
            submitter.register_buf_ring(
                self.inner.base as u64,
                self.inner.entries,
                BUFFER_GROUP,
            )
        };
        if let Err(e) = res {
            error!(
                "buffer ring registration failed: {e}\n\
                 NB: this requires a kernel version >= 6.0"
            );
            return Err(Error::KernelUnsupported(e));
        }
        Ok(())
    }

    /// Re-adds buffer `index` to the descriptor ring and publishes it.
    pub fn recycle(&self, index: u16) {
        debug_assert!(index < self.inner.entries / 2, "recycled a send buffer");
        self.push_descriptor(index);
        self.publish();
    }

    /// Number of buffers in the pool.
    pub fn entry_count(&self) -> u16 {
        self.inner.entries
    }

    /// Size of each buffer in bytes.
    pub fn buffer_size(&self) -> usize {
        1usize << self.inner.buf_shift
    }

    /// Raw address of buffer `index`.
    pub fn buffer_ptr(&self, index: u16) -> *mut u8 {
        debug_assert!(index < self.inner.entries);
        let buffers_base = mem::size_of::<BufRingEntry>() * usize::from(self.inner.entries);
        // SAFETY: index is in range, so the offset stays inside the mapping.
        unsafe {
            self.inner
                .base
                .add(buffers_base + (usize::from(index) << self.inner.buf_shift))
        }
    }

    /// Pops a scratch buffer from the send-reserved upper half. Returns
    /// `None` when all scratch buffers are in flight.
    pub fn take_send_scratch(&self) -> Option<SendScratch> {
        let index = self.inner.free_send.lock().unwrap().pop()?;
        Some(SendScratch {
            pool: self.clone(),
            index,
            len: 0,
        })
    }

    /// The number of send scratch buffers currently available.
    pub fn free_send_count(&self) -> usize {
        self.inner.free_send.lock().unwrap().len()
    }

    /// Writes the descriptor for buffer `index` at the ring slot under the
    /// private tail, without publishing it.
    fn push_descriptor(&self, index: u16) {
        let tail = self.inner.local_tail.load(Ordering::Relaxed);
        let mask = self.inner.entries - 1;
        self.write_descriptor(tail & mask, index);
        self.inner
            .local_tail
            .store(tail.wrapping_add(1), Ordering::Relaxed);
    }

    fn write_descriptor(&self, slot: u16, index: u16) {
        debug_assert!(slot < self.inner.entries);
        let entries = self.inner.base as *mut BufRingEntry;
        // SAFETY: slot is in range, so the write stays inside the mapping.
        // Only addr/len/bid are written; the shared tail overlays the resv
        // field of entry 0 and must not be touched here.
        let entry = unsafe { &mut *entries.add(usize::from(slot)) };
        entry.set_addr(self.buffer_ptr(index) as u64);
        entry.set_len(self.buffer_size() as u32);
        entry.set_bid(index);
    }

    /// Makes all pushed descriptors visible to the kernel.
    fn publish(&self) {
        let entries = self.inner.base as *const BufRingEntry;
        // SAFETY: entry 0 exists; tail() yields the shared tail location.
        let shared_tail = unsafe { BufRingEntry::tail(entries) } as *const AtomicU16;
        let tail = self.inner.local_tail.load(Ordering::Relaxed);
        // SAFETY: the kernel reads this location concurrently; the atomic
        // release store pairs with its acquire load.
        unsafe {
            (*shared_tail).store(tail, Ordering::Release);
        }
    }
}

/// A send-reserved buffer checked out of the pool's upper half. Returns
/// itself to the free stack on drop.
pub(crate) struct SendScratch {
    pool: BufferPool,
    index: u16,
    len: usize,
}

impl SendScratch {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.pool.buffer_ptr(self.index)
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the buffer is reserved for this scratch while it exists;
        // the kernel never selects indices from the upper half.
        unsafe { std::slice::from_raw_parts(self.pool.buffer_ptr(self.index), self.len) }
    }

    /// Appends `bytes`; returns false when the buffer cannot hold them.
    pub fn extend(&mut self, bytes: &[u8]) -> bool {
        if self.len + bytes.len() > self.pool.buffer_size() {
            return false;
        }
        // SAFETY: bounds checked above; the buffer is exclusive to us.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.pool.buffer_ptr(self.index).add(self.len),
                bytes.len(),
            );
        }
        self.len += bytes.len();
        true
    }
}

impl Drop for SendScratch {
    fn drop(&mut self) {
        self.pool
            .inner
            .free_send
            .lock()
            .unwrap()
            .push(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_do_not_overlap() {
        let pool = BufferPool::new(16, 12).unwrap();
        for i in 0..16u16 {
            let p = pool.buffer_ptr(i) as usize;
            for j in 0..16u16 {
                if i != j {
                    let q = pool.buffer_ptr(j) as usize;
                    assert!(p.abs_diff(q) >= pool.buffer_size());
                }
            }
        }
    }

    #[test]
    fn send_scratch_comes_from_the_upper_half() {
        let pool = BufferPool::new(16, 12).unwrap();
        let mut taken = Vec::new();
        while let Some(scratch) = pool.take_send_scratch() {
            assert!(scratch.index() >= 8);
            taken.push(scratch);
        }
        assert_eq!(taken.len(), 8);
        assert_eq!(pool.free_send_count(), 0);

        drop(taken);
        assert_eq!(pool.free_send_count(), 8);
    }

    #[test]
    fn scratch_extend_respects_capacity() {
        let pool = BufferPool::new(16, 12).unwrap();
        let mut scratch = pool.take_send_scratch().unwrap();
        assert!(scratch.extend(b"hello "));
        assert!(scratch.extend(b"world"));
        assert_eq!(scratch.as_slice(), b"hello world");
        assert!(!scratch.extend(&vec![0u8; 4096]));
        assert_eq!(scratch.len(), 11);
    }
}
