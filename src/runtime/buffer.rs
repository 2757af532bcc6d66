//! Per-channel buffers.
//!
//! Each channel owns one bounded read buffer and one outgoing buffer.
//! Nothing here is shared between channels or loops.

use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};

/// Bounded receive buffer.
///
/// Reads never grow the buffer past `limit`; framing decides what a full
/// buffer without a complete message means.
#[derive(Debug)]
pub struct ReadBuffer {
    data: BytesMut,
    limit: usize,
}

impl ReadBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(limit),
            limit,
        }
    }

    /// Read once from `src` into the free tail of the buffer.
    ///
    /// Returns `Ok(0)` on EOF. A full buffer is reported as `InvalidData`
    /// since reading zero bytes into it would be mistaken for EOF.
    pub fn fill_from<R: Read>(&mut self, src: &mut R) -> io::Result<usize> {
        let filled = self.data.len();
        if filled >= self.limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "read buffer full without a complete frame",
            ));
        }

        self.data.resize(self.limit, 0);
        match src.read(&mut self.data[filled..]) {
            Ok(n) => {
                self.data.truncate(filled + n);
                Ok(n)
            }
            Err(e) => {
                self.data.truncate(filled);
                Err(e)
            }
        }
    }

    /// Drop `n` consumed bytes from the front.
    pub fn consume(&mut self, n: usize) {
        self.data.advance(n.min(self.data.len()));
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// Outgoing bytes not yet accepted by the socket.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    data: BytesMut,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutable access for encoders appending a frame.
    pub fn as_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    /// Write as much as the sink accepts in one call.
    ///
    /// Returns bytes written. `Ok(0)` from the sink with data pending is
    /// turned into `WriteZero`.
    pub fn drain_to<W: Write>(&mut self, dst: &mut W) -> io::Result<usize> {
        if self.data.is_empty() {
            return Ok(0);
        }
        match dst.write(&self.data)? {
            0 => Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            n => {
                self.data.advance(n);
                Ok(n)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}
