//! Binary command set carried inside frames.
//!
//! # Layout
//!
//! ```text
//! request:  [u8 opcode][fields...]
//! response: [u8 status][u8 opcode][fields...]
//! ```
//!
//! Integers are `u32` big-endian, strings are a `u32` byte length followed by
//! UTF-8. A non-`Ok` response carries a single diagnostic string. New commands
//! get new opcodes; existing layouts are frozen.

use thiserror::Error;

/// Reasons a payload could not be turned into a request or response
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("unknown status {0}")]
    UnknownStatus(u8),
    #[error("payload truncated: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
    #[error("zero-sized dimensions {width}x{height}")]
    ZeroDimension { width: u32, height: u32 },
}

/// Command identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    CreateDisplay = 1,
    CreateCanvas = 2,
    Commit = 3,
}

impl TryFrom<u8> for Opcode {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::CreateDisplay),
            2 => Ok(Self::CreateCanvas),
            3 => Ok(Self::Commit),
            other => Err(DecodeError::UnknownOpcode(other)),
        }
    }
}

/// Response status codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    NotFound = 1,
    NoBuffer = 2,
    ResourceError = 3,
    BadRequest = 4,
}

impl TryFrom<u8> for Status {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::NotFound),
            2 => Ok(Self::NoBuffer),
            3 => Ok(Self::ResourceError),
            4 => Ok(Self::BadRequest),
            other => Err(DecodeError::UnknownStatus(other)),
        }
    }
}

// ============================================================================
// Client → Server Requests
// ============================================================================

/// Requests sent from a client to the compositor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Open a new presentation surface
    CreateDisplay {
        name: String,
        width: u32,
        height: u32,
    },

    /// Allocate (or reallocate) the shared canvas of a surface
    CreateCanvas {
        display_id: u32,
        width: u32,
        height: u32,
    },

    /// Present the current canvas contents
    Commit { display_id: u32 },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::CreateDisplay { .. } => Opcode::CreateDisplay,
            Request::CreateCanvas { .. } => Opcode::CreateCanvas,
            Request::Commit { .. } => Opcode::Commit,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.opcode() as u8];
        match self {
            Request::CreateDisplay {
                name,
                width,
                height,
            } => {
                put_str(&mut out, name);
                put_u32(&mut out, *width);
                put_u32(&mut out, *height);
            }
            Request::CreateCanvas {
                display_id,
                width,
                height,
            } => {
                put_u32(&mut out, *display_id);
                put_u32(&mut out, *width);
                put_u32(&mut out, *height);
            }
            Request::Commit { display_id } => put_u32(&mut out, *display_id),
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let opcode = Opcode::try_from(r.u8()?)?;
        let req = match opcode {
            Opcode::CreateDisplay => {
                let name = r.string()?;
                let (width, height) = r.dimensions()?;
                Request::CreateDisplay {
                    name,
                    width,
                    height,
                }
            }
            Opcode::CreateCanvas => {
                let display_id = r.u32()?;
                let (width, height) = r.dimensions()?;
                Request::CreateCanvas {
                    display_id,
                    width,
                    height,
                }
            }
            Opcode::Commit => Request::Commit {
                display_id: r.u32()?,
            },
        };
        r.finish()?;
        Ok(req)
    }
}

// ============================================================================
// Server → Client Responses
// ============================================================================

/// Responses sent from the compositor, one per request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    DisplayCreated { id: u32 },
    CanvasCreated { name: String },
    Committed,
    /// Any non-`Ok` outcome. `opcode` echoes the request's first byte, which
    /// may not be a known opcode when the request itself was malformed.
    Error {
        opcode: u8,
        status: Status,
        message: String,
    },
}

impl Response {
    pub fn status(&self) -> Status {
        match self {
            Response::Error { status, .. } => *status,
            _ => Status::Ok,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Response::DisplayCreated { id } => {
                out.extend_from_slice(&[Status::Ok as u8, Opcode::CreateDisplay as u8]);
                put_u32(&mut out, *id);
            }
            Response::CanvasCreated { name } => {
                out.extend_from_slice(&[Status::Ok as u8, Opcode::CreateCanvas as u8]);
                put_str(&mut out, name);
            }
            Response::Committed => {
                out.extend_from_slice(&[Status::Ok as u8, Opcode::Commit as u8]);
            }
            Response::Error {
                opcode,
                status,
                message,
            } => {
                out.extend_from_slice(&[*status as u8, *opcode]);
                put_str(&mut out, message);
            }
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let status = Status::try_from(r.u8()?)?;
        let raw_opcode = r.u8()?;
        let resp = if status == Status::Ok {
            match Opcode::try_from(raw_opcode)? {
                Opcode::CreateDisplay => Response::DisplayCreated { id: r.u32()? },
                Opcode::CreateCanvas => Response::CanvasCreated { name: r.string()? },
                Opcode::Commit => Response::Committed,
            }
        } else {
            Response::Error {
                opcode: raw_opcode,
                status,
                message: r.string()?,
            }
        };
        r.finish()?;
        Ok(resp)
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    put_u32(out, value.len() as u32);
    out.extend_from_slice(value.as_bytes());
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(if self.buf.is_empty() {
                DecodeError::Empty
            } else {
                DecodeError::Truncated {
                    needed: n - remaining,
                }
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn dimensions(&mut self) -> Result<(u32, u32), DecodeError> {
        let width = self.u32()?;
        let height = self.u32()?;
        if width == 0 || height == 0 {
            return Err(DecodeError::ZeroDimension { width, height });
        }
        Ok((width, height))
    }

    fn finish(&self) -> Result<(), DecodeError> {
        match self.buf.len() - self.pos {
            0 => Ok(()),
            extra => Err(DecodeError::TrailingBytes(extra)),
        }
    }
}
