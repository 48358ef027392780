use crossbeam_queue::ArrayQueue;

/// Lock-free pool of fixed-size receive buffers.
///
/// Posted receives take a buffer from the pool; buffers that come back to the
/// transport without being handed to a caller (stale completions, headers,
/// truncations) are returned. When the pool is empty a fresh buffer is
/// allocated. Buffers that have grown beyond 4x the receive size are dropped
/// instead of returned.
pub(crate) struct RecvPool {
    free: ArrayQueue<Vec<u8>>,
    buf_size: usize,
}

impl RecvPool {
    pub(crate) fn new(count: usize, buf_size: usize) -> Self {
        let free = ArrayQueue::new(count.max(1));
        for _ in 0..count {
            let _ = free.push(Vec::with_capacity(buf_size));
        }
        Self { free, buf_size }
    }

    #[cfg(test)]
    pub(crate) fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Check out a zeroed buffer of exactly `buf_size` bytes.
    pub(crate) fn checkout(&self) -> Vec<u8> {
        let mut buf = self
            .free
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.buf_size));
        buf.resize(self.buf_size, 0);
        buf
    }

    pub(crate) fn checkin(&self, mut buf: Vec<u8>) {
        if buf.capacity() >= self.buf_size && buf.capacity() <= self.buf_size * 4 {
            buf.clear();
            let _ = self.free.push(buf);
        }
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }
}
