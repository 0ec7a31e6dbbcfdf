//! Fixed-capacity accumulation buffer for frame parsing
//!
//! Bridges partial socket/serial reads into whole frames. O(1) consume
//! instead of `Vec::drain()`.

/// Fixed-capacity ring buffer with O(1) advance
///
/// Capacity `N` is the largest frame the parser has to hold at once.
pub struct RingBuffer<const N: usize> {
    data: [u8; N],
    head: usize,      // Write position (next empty slot)
    tail: usize,      // Read position (first valid byte)
    len: usize,       // Number of bytes available
    staging: [u8; N], // For non-contiguous slice access
}

impl<const N: usize> RingBuffer<N> {
    /// Create a new empty ring buffer
    pub const fn new() -> Self {
        Self {
            data: [0u8; N],
            head: 0,
            tail: 0,
            len: 0,
            staging: [0u8; N],
        }
    }

    /// Append bytes to the buffer
    ///
    /// On overflow the oldest bytes are dropped to make room.
    pub fn extend(&mut self, bytes: &[u8]) {
        let mut dropped = 0;
        for &b in bytes {
            if self.len == N {
                self.tail = (self.tail + 1) % N;
                self.len -= 1;
                dropped += 1;
            }
            self.data[self.head] = b;
            self.head = (self.head + 1) % N;
            self.len += 1;
        }
        if dropped > 0 {
            log::trace!("Accumulation buffer full, dropped {} oldest bytes", dropped);
        }
    }

    /// Consume n bytes from the front
    #[inline]
    pub fn advance(&mut self, n: usize) {
        let n = n.min(self.len);
        self.tail = (self.tail + n) % N;
        self.len -= n;
    }

    /// Number of bytes available to read
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Free space before the next `extend` starts dropping bytes
    #[inline]
    pub fn remaining(&self) -> usize {
        N - self.len
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.len = 0;
    }

    /// Read byte at logical index (handles wraparound)
    #[inline]
    pub fn get(&self, index: usize) -> Option<u8> {
        if index < self.len {
            Some(self.data[(self.tail + index) % N])
        } else {
            None
        }
    }

    /// All buffered bytes as one slice
    ///
    /// Copies into the staging buffer only when the data wraps around.
    pub fn as_slice(&mut self) -> &[u8] {
        let len = self.len;
        if self.tail + len <= N {
            &self.data[self.tail..self.tail + len]
        } else {
            let first = N - self.tail;
            self.staging[..first].copy_from_slice(&self.data[self.tail..]);
            self.staging[first..len].copy_from_slice(&self.data[..len - first]);
            &self.staging[..len]
        }
    }
}

impl<const N: usize> Default for RingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
