use bytes::{Buf, Bytes};

use crate::{buffer, conn::ChunkCallback};

/// One unit of queued work: a payload to transform, a shutdown marker, or an
/// inbound-error marker.
///
/// The completion callback is single-shot; [`Chunk::take_callback`] moves it
/// out so no later path can fire it twice.
pub(crate) struct Chunk {
    buf: Option<Bytes>,
    shutdown: bool,
    inbound_err: i32,
    callback: Option<ChunkCallback>,
}

impl Chunk {
    pub(crate) fn data(buf: Option<Bytes>, callback: Option<ChunkCallback>) -> Self {
        Self {
            buf,
            shutdown: false,
            inbound_err: 0,
            callback,
        }
    }

    pub(crate) fn shutdown_marker(callback: Option<ChunkCallback>) -> Self {
        Self {
            buf: None,
            shutdown: true,
            inbound_err: 0,
            callback,
        }
    }

    pub(crate) fn error_marker(err: i32) -> Self {
        Self {
            buf: None,
            shutdown: false,
            inbound_err: err,
            callback: None,
        }
    }

    pub(crate) fn buf(&self) -> Option<&Bytes> {
        self.buf.as_ref()
    }

    /// Drops `n` consumed bytes from the front of the payload.
    pub(crate) fn advance(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        if let Some(buf) = self.buf.as_mut() {
            buf.advance(n);
        }
    }

    /// Puts `front` back in front of this chunk's payload.
    pub(crate) fn prepend(&mut self, front: Option<Bytes>) {
        self.buf = buffer::concat(front, self.buf.take());
    }

    pub(crate) fn into_buf(self) -> Option<Bytes> {
        self.buf
    }

    /// Unconsumed payload bytes.
    pub(crate) fn remaining(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    pub(crate) fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub(crate) fn inbound_err(&self) -> i32 {
        self.inbound_err
    }

    /// Moves the completion callback out, leaving the slot empty.
    pub(crate) fn take_callback(&mut self) -> Option<ChunkCallback> {
        self.callback.take()
    }
}
