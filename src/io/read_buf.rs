/// Growable read buffer for a connection.
///
/// The reader appends raw socket bytes at the tail, the parser consumes
/// framed input from the head. Consumed space is reclaimed by
/// compacting before a refill rather than on every consume.
pub struct ReadBuf {
    buf: Vec<u8>,
    /// Start of unconsumed input.
    head: usize,
    /// End of committed input; `buf[tail..]` is writable spare space.
    tail: usize,
}

impl ReadBuf {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(16)],
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Unconsumed input bytes.
    pub fn input(&self) -> &[u8] {
        &self.buf[self.head..self.tail]
    }

    pub fn input_len(&self) -> usize {
        self.tail - self.head
    }

    /// Writable spare space at the tail, compacting first if the spare
    /// space has run out but consumed space can be reclaimed.
    pub fn append_slot(&mut self) -> &mut [u8] {
        if self.tail == self.buf.len() && self.head > 0 {
            self.compact();
        }
        &mut self.buf[self.tail..]
    }

    /// Commit `n` bytes written into the slice returned by
    /// [`append_slot`](Self::append_slot).
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.tail + n <= self.buf.len());
        self.tail += n;
    }

    /// Mark `n` input bytes as consumed by the parser.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(self.head + n <= self.tail);
        self.head += n;
        if self.head == self.tail {
            self.head = 0;
            self.tail = 0;
        }
    }

    /// Grow the buffer so that total capacity is at least `capacity`.
    /// Never shrinks.
    pub fn reserve(&mut self, capacity: usize) {
        if capacity > self.buf.len() {
            self.buf.resize(capacity, 0);
        }
    }

    /// True when the last refill used the entire spare space, i.e. the
    /// buffer is the likely bottleneck rather than the socket.
    pub fn is_full(&self) -> bool {
        self.tail == self.buf.len()
    }

    fn compact(&mut self) {
        self.buf.copy_within(self.head..self.tail, 0);
        self.tail -= self.head;
        self.head = 0;
    }
}
