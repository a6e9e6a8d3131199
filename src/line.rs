//! Fixed-capacity line accumulator

/// Collects bytes of one line.
///
/// Bytes past the capacity are dropped but still count as consumed, and the
/// terminator still completes the line. [`LineBuffer::is_truncated`] reports
/// whether anything was dropped.
pub struct LineBuffer<const N: usize> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> LineBuffer<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    /// Add one byte. Returns `true` when `byte` terminated the line.
    pub fn push(&mut self, byte: u8) -> bool {
        if byte == b'\n' || byte == b'\r' {
            return true;
        }

        if self.len < N {
            self.buf[self.len] = byte;
            self.len += 1;
        } else {
            self.truncated = true;
        }
        false
    }

    /// The buffered line, without terminator.
    pub fn line(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
    }
}

impl<const N: usize> Default for LineBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}
