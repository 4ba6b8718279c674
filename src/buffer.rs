//! The two-tier buffer strategy (§3, §4.1): a bounded pool of uniformly
//! sized "large" buffers for outsized messages, with heap fallback when the
//! pool is exhausted. Every [`Buffer`] this provider hands out carries its
//! own provenance so [`BufferProvider::free`] always routes it back to the
//! right place — mis-routing a pooled buffer to the heap deallocator (or
//! vice versa) would corrupt the pool (§3 invariant).
//!
//! Grounded in the teacher's `bytes`-based payload storage (`frame.rs` uses
//! `BytesMut` throughout); the pool's free-list-behind-a-mutex shape follows
//! the same discipline pooled-resource code in the wider example pack uses
//! (acquire pops a slot under the lock, release pushes it back).

use std::sync::Mutex;

use bytes::BytesMut;

use crate::errors::WsError;

/// A byte buffer tagged with where it came from, so it can be released
/// correctly. `Heap` buffers are dropped normally; `Pooled` buffers are
/// returned to the shared pool.
pub enum Buffer {
    Pooled(BytesMut),
    Heap(BytesMut),
}

impl Buffer {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Buffer::Pooled(b) | Buffer::Heap(b) => b,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Buffer::Pooled(b) | Buffer::Heap(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn into_inner(self) -> (bool, BytesMut) {
        match self {
            Buffer::Pooled(b) => (true, b),
            Buffer::Heap(b) => (false, b),
        }
    }
}

/// Shared pool of `large_buffer_size`-byte buffers, bounded at
/// `large_buffer_pool_count` slots, plus heap fallback (§3, §4.1).
///
/// Lives for the whole server lifetime and is the only object concurrently
/// touched by multiple connection threads (§5); acquire/release hold the
/// mutex only long enough to pop/push a `Vec` entry.
pub struct BufferProvider {
    large_buffer_size: usize,
    free_list: Mutex<Vec<BytesMut>>,
}

impl BufferProvider {
    pub fn new(large_buffer_size: usize, large_buffer_pool_count: usize) -> Self {
        let mut slots = Vec::with_capacity(large_buffer_pool_count);
        for _ in 0..large_buffer_pool_count {
            slots.push(BytesMut::zeroed(large_buffer_size));
        }
        BufferProvider {
            large_buffer_size,
            free_list: Mutex::new(slots),
        }
    }

    /// Acquire a buffer of at least `size` bytes. Returns a pooled slot when
    /// `size` fits within `large_buffer_size` and a slot is free; otherwise
    /// heap-allocates exactly `size` bytes.
    pub fn alloc_pooled_or(&self, size: usize) -> Result<Buffer, WsError> {
        if size <= self.large_buffer_size {
            let mut free_list = self.free_list.lock().unwrap();
            if let Some(mut slot) = free_list.pop() {
                slot.resize(size, 0);
                return Ok(Buffer::Pooled(slot));
            }
        }
        let mut heap = BytesMut::new();
        heap.resize(size, 0);
        Ok(Buffer::Heap(heap))
    }

    /// Return a buffer of at least `new_capacity` bytes with the first
    /// `preserve_bytes` of `buffer` copied into it, releasing `buffer`.
    pub fn grow(
        &self,
        buffer: Buffer,
        preserve_bytes: usize,
        new_capacity: usize,
    ) -> Result<Buffer, WsError> {
        let mut next = self.alloc_pooled_or(new_capacity)?;
        next.as_mut_slice()[..preserve_bytes]
            .copy_from_slice(&buffer.as_slice()[..preserve_bytes]);
        self.free(buffer);
        Ok(next)
    }

    /// Release `buffer`, routing by provenance: pooled slots return to the
    /// free list (up to its original capacity), heap buffers are simply
    /// dropped.
    pub fn free(&self, buffer: Buffer) {
        let (pooled, mut inner) = buffer.into_inner();
        if pooled {
            inner.resize(self.large_buffer_size, 0);
            self.free_list.lock().unwrap().push(inner);
        }
    }

    /// number of pooled slots currently checked out; used by tests to
    /// assert the buffer-accounting invariant (§8 invariant 8)
    #[cfg(test)]
    pub fn leased_count(&self, pool_capacity: usize) -> usize {
        pool_capacity - self.free_list.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pooled_then_heap_fallback() {
        let provider = BufferProvider::new(16, 2);
        let a = provider.alloc_pooled_or(16).unwrap();
        let b = provider.alloc_pooled_or(16).unwrap();
        assert!(matches!(a, Buffer::Pooled(_)));
        assert!(matches!(b, Buffer::Pooled(_)));
        assert_eq!(provider.leased_count(2), 2);

        // pool exhausted: falls back to heap
        let c = provider.alloc_pooled_or(16).unwrap();
        assert!(matches!(c, Buffer::Heap(_)));

        provider.free(a);
        assert_eq!(provider.leased_count(2), 1);
        provider.free(b);
        provider.free(c);
        assert_eq!(provider.leased_count(2), 0);
    }

    #[test]
    fn oversized_request_heap_allocates_directly() {
        let provider = BufferProvider::new(16, 2);
        let big = provider.alloc_pooled_or(1024).unwrap();
        assert!(matches!(big, Buffer::Heap(_)));
        assert_eq!(big.len(), 1024);
    }

    #[test]
    fn grow_preserves_prefix_and_releases_old() {
        let provider = BufferProvider::new(512, 1);
        let mut first = provider.alloc_pooled_or(512).unwrap();
        first.as_mut_slice()[..5].copy_from_slice(b"hello");
        let grown = provider.grow(first, 5, 1024).unwrap();
        assert_eq!(&grown.as_slice()[..5], b"hello");
        assert_eq!(grown.len(), 1024);
        // the original pooled slot should have been returned to the pool
        assert_eq!(provider.leased_count(1), 0);
    }
}
