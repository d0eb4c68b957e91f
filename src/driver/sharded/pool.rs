//! Reusable chunk-sized write buffers.

use std::sync::Mutex;

const MAX_POOLED: usize = 8;

/// Free list of chunk-sized buffers checked out by writers and returned on
/// close. Purely an allocation optimization: a buffer that never comes back
/// is simply reallocated on the next checkout.
pub(crate) struct BufferPool {
    buf_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub(crate) fn new(buf_size: usize) -> Self {
        Self {
            buf_size,
            free: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn get(&self) -> Vec<u8> {
        let mut free = self.free.lock().unwrap();
        free.pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buf_size))
    }

    pub(crate) fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        if buf.capacity() < self.buf_size {
            return;
        }
        let mut free = self.free.lock().unwrap();
        if free.len() < MAX_POOLED {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_are_reused() {
        let pool = BufferPool::new(16);
        let mut buf = pool.get();
        assert!(buf.capacity() >= 16);
        buf.extend_from_slice(b"0123456789abcdef");
        let ptr = buf.as_ptr();
        pool.put(buf);

        let buf = pool.get();
        assert!(buf.is_empty());
        assert_eq!(buf.as_ptr(), ptr);
    }

    #[test]
    fn test_undersized_buffers_are_dropped() {
        let pool = BufferPool::new(16);
        pool.put(Vec::with_capacity(4));
        let buf = pool.get();
        assert!(buf.capacity() >= 16);
    }
}
