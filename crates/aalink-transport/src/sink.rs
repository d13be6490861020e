//! Growable byte sink between the physical endpoint and the receive
//! queue.

use aalink_io::Data;
use bytes::BytesMut;

const INITIAL_CAPACITY: usize = 16 * 1024;

/// How much to ask the endpoint for per refill, beyond any shortfall.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Accumulates bytes read from the underlying endpoint and serves them
/// out in exactly-sized pieces. Consumed bytes leave the buffer; the
/// sink never hands out stale data.
pub struct ReceiveSink {
    buffer: BytesMut,
}

impl ReceiveSink {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Append bytes delivered by the endpoint.
    pub fn commit(&mut self, data: Data) {
        self.buffer.extend_from_slice(&data);
    }

    /// Take exactly `count` buffered bytes. Callers check
    /// [`len`](Self::len) first.
    pub fn consume(&mut self, count: usize) -> Data {
        debug_assert!(count <= self.buffer.len());
        self.buffer.split_to(count).to_vec()
    }

    /// Size of the next endpoint read so a request for `wanted` bytes
    /// can make progress: at least the shortfall, padded up to one read
    /// chunk.
    pub fn refill_size(&self, wanted: usize) -> usize {
        wanted.saturating_sub(self.buffer.len()).max(READ_CHUNK_SIZE)
    }

    /// Drop everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for ReceiveSink {
    fn default() -> Self {
        Self::new()
    }
}
