//! One accepted client connection

use jw_ipc::{FrameDecoder, FrameError, FramedMessage, Response};
use mio::net::UnixStream;
use std::io::{self, ErrorKind, Read, Write};
use thiserror::Error;

/// Bytes pulled from the socket per read
const READ_CHUNK: usize = 4096;

/// Why a connection was torn down
#[derive(Debug, Error)]
pub enum CloseReason {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),
}

/// Where a connection is in its request/response cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for (the rest of) a request frame
    Reading,
    /// A response is queued but the socket would not take all of it yet
    Writing,
}

pub struct Connection {
    /// Bookkeeping only; never used to decide what a client may do
    pub id: usize,
    stream: UnixStream,
    decoder: FrameDecoder,
    outbound: Vec<u8>,
    readable: bool,
    writable: bool,
}

impl Connection {
    pub fn new(id: usize, stream: UnixStream, max_frame: usize) -> Self {
        Self {
            id,
            stream,
            decoder: FrameDecoder::new(max_frame),
            outbound: Vec::new(),
            readable: false,
            writable: true,
        }
    }

    pub fn stream_mut(&mut self) -> &mut UnixStream {
        &mut self.stream
    }

    pub fn phase(&self) -> Phase {
        if self.outbound.is_empty() {
            Phase::Reading
        } else {
            Phase::Writing
        }
    }

    pub fn mark_readable(&mut self) {
        self.readable = true;
    }

    pub fn mark_writable(&mut self) {
        self.writable = true;
    }

    /// Whether servicing this connection now would make progress without
    /// waiting for another readiness event.
    pub fn has_work(&self) -> bool {
        match self.phase() {
            Phase::Writing => self.writable,
            Phase::Reading => self.readable || !matches!(self.decoder.has_frame(), Ok(false)),
        }
    }

    /// Run one step: flush pending output, otherwise read at most once and
    /// dispatch at most one complete frame through `handler`.
    pub fn service<F>(&mut self, handler: &mut F) -> Result<(), CloseReason>
    where
        F: FnMut(&[u8]) -> Response,
    {
        if self.phase() == Phase::Writing {
            self.flush()?;
            if self.phase() == Phase::Writing {
                return Ok(());
            }
        }

        if !self.decoder.has_frame()? && self.readable {
            self.read_once()?;
        }

        if let Some(payload) = self.decoder.next_frame()? {
            let response = handler(&payload);
            self.outbound
                .extend_from_slice(&FramedMessage::response(&response).encode());
            self.flush()?;
        }
        Ok(())
    }

    fn read_once(&mut self) -> Result<(), CloseReason> {
        let mut buf = [0u8; READ_CHUNK];
        match self.stream.read(&mut buf) {
            Ok(0) => Err(CloseReason::PeerClosed),
            Ok(n) => {
                self.decoder.push(&buf[..n]);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                self.readable = false;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn flush(&mut self) -> Result<(), CloseReason> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.outbound.drain(..n);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.writable = false;
                    break;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
