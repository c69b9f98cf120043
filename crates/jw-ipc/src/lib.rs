//! JingWei IPC Protocol
//!
//! Shared wire types for communication between `jw-core` (the compositor
//! server) and its clients, plus the shared-memory canvas used to hand pixel
//! data across the process boundary.

pub mod proto;
pub mod shm;

pub use proto::{DecodeError, Opcode, Request, Response, Status};
pub use shm::{buffer_name, SharedBuffer, ShmError, BYTES_PER_PIXEL};

use thiserror::Error;

/// Default socket file name inside the runtime directory
pub const SOCKET_NAME: &str = "jw_mt_core.sock";

/// Size of the length prefix in front of every frame
pub const LEN_PREFIX: usize = 4;

/// Default upper bound on a single frame payload
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Socket path for IPC communication
pub fn socket_path() -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".into());
    std::path::PathBuf::from(runtime_dir).join(SOCKET_NAME)
}

// ============================================================================
// Message Framing
// ============================================================================

/// Framing failures. Both are fatal for the stream they occur on: once a
/// length prefix is untrusted there is no way to find the next boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },
}

/// A framed message with length prefix for reliable socket reads
#[derive(Debug)]
pub struct FramedMessage {
    pub data: Vec<u8>,
}

impl FramedMessage {
    /// Frame an encoded request
    pub fn request(req: &Request) -> Self {
        Self { data: req.encode() }
    }

    /// Frame an encoded response
    pub fn response(resp: &Response) -> Self {
        Self { data: resp.encode() }
    }

    /// Encode message with length prefix (4 bytes, big-endian)
    pub fn encode(&self) -> Vec<u8> {
        let len = self.data.len() as u32;
        let mut buf = Vec::with_capacity(LEN_PREFIX + self.data.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }
}

/// Accumulates bytes from a stream and splits them into frames.
///
/// Bytes may arrive in arbitrary pieces: a single read can carry half a frame
/// or several frames back to back. [`FrameDecoder::next_frame`] only yields a
/// payload once all of its bytes are buffered and leaves the remainder in place.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame: usize,
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame,
        }
    }

    /// Append freshly received bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of bytes waiting to be decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Check whether a full frame is ready without consuming it
    pub fn has_frame(&self) -> Result<bool, FrameError> {
        Ok(self.peek_len()?.is_some_and(|len| self.buf.len() >= LEN_PREFIX + len))
    }

    /// Pop the next complete frame payload, if any
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(len) = self.peek_len()? else {
            return Ok(None);
        };
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let payload = self.buf[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buf.drain(..LEN_PREFIX + len);
        Ok(Some(payload))
    }

    fn peek_len(&self) -> Result<Option<usize>, FrameError> {
        let Some(prefix) = self.buf.get(..LEN_PREFIX) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if len > self.max_frame {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame,
            });
        }
        Ok(Some(len))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frame_waits_for_remainder() {
        let encoded = FramedMessage::request(&Request::Commit { display_id: 7 }).encode();
        let mut decoder = FrameDecoder::default();

        decoder.push(&encoded[..3]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(&encoded[3..encoded.len() - 1]);
        assert!(!decoder.has_frame().unwrap());
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.push(&encoded[encoded.len() - 1..]);
        let payload = decoder.next_frame().unwrap().expect("complete frame");
        assert_eq!(Request::decode(&payload).unwrap(), Request::Commit { display_id: 7 });
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_coalesced_frames_split_one_at_a_time() {
        let mut bytes = FramedMessage::request(&Request::Commit { display_id: 1 }).encode();
        bytes.extend(FramedMessage::request(&Request::Commit { display_id: 2 }).encode());
        bytes.extend_from_slice(&[0, 0]);

        let mut decoder = FrameDecoder::default();
        decoder.push(&bytes);

        let first = decoder.next_frame().unwrap().unwrap();
        assert_eq!(Request::decode(&first).unwrap(), Request::Commit { display_id: 1 });
        let second = decoder.next_frame().unwrap().unwrap();
        assert_eq!(Request::decode(&second).unwrap(), Request::Commit { display_id: 2 });

        // Half of the next length prefix stays buffered
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered(), 2);
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut decoder = FrameDecoder::default();
        decoder.push(&0u32.to_be_bytes());
        assert_eq!(decoder.next_frame().unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_oversized_prefix_rejected() {
        let mut decoder = FrameDecoder::new(16);
        decoder.push(&17u32.to_be_bytes());
        assert_eq!(
            decoder.next_frame(),
            Err(FrameError::TooLarge { len: 17, max: 16 })
        );
    }
}
