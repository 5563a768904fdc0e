//! Length-prefixed echo protocol.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes of payload and
//! is returned to the peer unchanged. A zero-length frame asks the server to close the
//! connection once everything echoed so far has been sent.

use crate::{Protocol, Verdict};
use std::io::{self, Read, Write};
use thiserror::Error;

/// Default upper bound on the payload of a single frame.
pub const MAX_FRAME: usize = 1024 * 1024; // 1 MB

/// Size of the chunks payloads are copied in.
const CHUNK: usize = 4 * 1024;

/// Errors that can occur when echoing a frame.
#[derive(Error, Debug)]
pub enum Error {
    #[error("frame too large: {0}")]
    FrameTooLarge(usize),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Echoes length-prefixed frames.
#[derive(Clone, Copy, Debug)]
pub struct Echo {
    max_frame: usize,
}

impl Echo {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Default for Echo {
    fn default() -> Self {
        Self::new(MAX_FRAME)
    }
}

/// Fill `dst` entirely, returning false if the peer closed first.
fn read_full<S: Read>(stream: &mut S, dst: &mut [u8]) -> Result<bool, Error> {
    match stream.read_exact(dst) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err.into()),
    }
}

impl Protocol for Echo {
    type Error = Error;

    fn process<S: Read + Write>(&mut self, stream: &mut S) -> Result<Verdict, Error> {
        let mut header = [0u8; 4];
        if !read_full(stream, &mut header)? {
            return Ok(Verdict::Close);
        }
        let len = u32::from_be_bytes(header) as usize;
        if len == 0 {
            return Ok(Verdict::Close);
        }
        if len > self.max_frame {
            return Err(Error::FrameTooLarge(len));
        }

        stream.write_all(&header)?;
        let mut chunk = [0u8; CHUNK];
        let mut remaining = len;
        while remaining > 0 {
            let size = remaining.min(CHUNK);
            if !read_full(stream, &mut chunk[..size])? {
                return Ok(Verdict::Close);
            }
            stream.write_all(&chunk[..size])?;
            remaining -= size;
        }
        Ok(Verdict::Continue)
    }
}

/// Encode `payload` as a single frame.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
