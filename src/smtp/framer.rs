//! Finding the end of a message body in a chunked byte stream
//!
//! A body ends with a line holding a single period: CRLF `.` CRLF. The stream arrives in
//! arbitrary pieces, so the terminator may be split across any number of reads. The framer keeps
//! a single growing buffer and only looks at its tail after each chunk, which keeps the cost of a
//! chunk proportional to the chunk instead of to the whole body.

use tracing::trace;

use crate::smtp::error::SmtpError;

/// CRLF "." CRLF
pub const TERMINATOR: &[u8] = b"\r\n.\r\n";

/// The part of [`TERMINATOR`] that is not the last body line's own line ending
const DOT_LINE: &[u8] = b".\r\n";

/// The terminator minus its closing CRLF
const DOT_PREFIX: &[u8] = b"\r\n.";

/// Where the tail of the accumulated stream stands relative to the terminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Still collecting; the tail is not the start of a terminator
    Collecting,
    /// The tail is CRLF "." and only the closing CRLF is missing
    AwaitingCrlf,
    /// The terminator has been seen and the body is final
    Complete,
}

/// Accumulates body bytes until the terminator shows up.
#[derive(Debug)]
pub struct MessageFramer {
    buffer: Vec<u8>,
    max_size: usize,
    state: FrameState,
}

impl MessageFramer {
    /// Create a framer that rejects bodies larger than `max_size` bytes
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_size,
            state: FrameState::Collecting,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Bytes accumulated so far, terminator included once seen
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Append a chunk and check whether the body is now complete.
    ///
    /// Returns the finished body, without the closing `.` line, when the accumulated stream
    /// ends in the terminator. The CRLF in front of the dot is the last body line's own line
    /// ending and is kept.
    ///
    /// # Errors
    ///
    /// [`SmtpError::TooMuchData`] as soon as the body can no longer fit in the size limit, and
    /// [`SmtpError::InvalidState`] when pushing after the body is complete.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, SmtpError> {
        if self.state == FrameState::Complete {
            return Err(SmtpError::InvalidState(
                "message body already complete".to_string(),
            ));
        }

        self.buffer.extend_from_slice(chunk);
        self.state = self.scan_tail();
        trace!(
            chunk = chunk.len(),
            buffered = self.buffer.len(),
            state = ?self.state,
            "body chunk"
        );

        if self.state == FrameState::Complete {
            let body_len = self.buffer.len() - DOT_LINE.len();
            if body_len > self.max_size {
                return Err(SmtpError::TooMuchData { max: self.max_size });
            }

            let mut body = std::mem::take(&mut self.buffer);
            body.truncate(body_len);
            return Ok(Some(body));
        }

        // Whatever arrives next only makes the body longer.
        if self.buffer.len().saturating_sub(DOT_LINE.len()) > self.max_size {
            return Err(SmtpError::TooMuchData { max: self.max_size });
        }

        Ok(None)
    }

    /// Look at the last few bytes only.
    ///
    /// The body is read as though it followed the CRLF that ended the `DATA` line, so a
    /// buffer holding nothing but `.` CRLF is an empty message.
    fn scan_tail(&self) -> FrameState {
        let buffer = self.buffer.as_slice();

        if buffer.ends_with(TERMINATOR) || buffer == DOT_LINE {
            FrameState::Complete
        } else if buffer.ends_with(DOT_PREFIX) || buffer == b"." {
            FrameState::AwaitingCrlf
        } else {
            FrameState::Collecting
        }
    }
}

/// Encode `body` for transmission after `DATA`.
///
/// The inverse of [`MessageFramer`]: a CRLF is added first when the body does not already end
/// in one, then the `.` line closes the message.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(body.len() + TERMINATOR.len());
    framed.extend_from_slice(body);
    if !body.is_empty() && !body.ends_with(b"\r\n") {
        framed.extend_from_slice(b"\r\n");
    }
    framed.extend_from_slice(DOT_LINE);
    framed
}
