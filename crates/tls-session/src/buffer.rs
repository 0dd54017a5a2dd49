use bytes::{Bytes, BytesMut};

/// Scratch buffer the engine writes records or plaintext into.
///
/// Keeps an explicit fill mark instead of a cursor: the engine sees only the
/// spare capacity, and [`SessionBuf::take`] hands the filled region upstream
/// as a freshly sized buffer.
pub(crate) struct SessionBuf {
    data: Vec<u8>,
    filled: usize,
}

impl SessionBuf {
    pub(crate) fn with_capacity(len: usize) -> Self {
        Self {
            data: vec![0; len],
            filled: 0,
        }
    }

    /// The spare region an engine call may write into.
    pub(crate) fn unfilled(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }

    /// Records `n` bytes written into the spare region.
    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(self.filled + n <= self.data.len());
        self.filled += n;
    }

    /// Doubles the capacity, preserving any filled bytes.
    pub(crate) fn grow(&mut self) {
        let new_len = self.data.len().max(1) * 2;
        self.data.resize(new_len, 0);
    }

    /// Copies the filled region into a fresh buffer and clears the mark.
    /// Returns `None` when nothing was filled.
    pub(crate) fn take(&mut self) -> Option<Bytes> {
        if self.filled == 0 {
            return None;
        }
        let out = Bytes::copy_from_slice(&self.data[..self.filled]);
        self.filled = 0;
        Some(out)
    }

    pub(crate) fn clear(&mut self) {
        self.filled = 0;
    }
}

/// Joins two optional payloads, front first. Used to fold a starved chunk's
/// remainder into the next queued chunk after an underflow.
pub(crate) fn concat(front: Option<Bytes>, back: Option<Bytes>) -> Option<Bytes> {
    match (front, back) {
        (Some(front), Some(back)) => {
            if front.is_empty() {
                return Some(back);
            }
            if back.is_empty() {
                return Some(front);
            }
            let mut joined = BytesMut::with_capacity(front.len() + back.len());
            joined.extend_from_slice(&front);
            joined.extend_from_slice(&back);
            Some(joined.freeze())
        }
        (Some(only), None) | (None, Some(only)) => Some(only),
        (None, None) => None,
    }
}
