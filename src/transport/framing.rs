//! Demultiplexer for the container exec-attach stream.
//!
//! With no TTY allocated, the runtime multiplexes stdout/stderr over one
//! socket as framed records: an 8-byte header (1 byte stream-type tag,
//! 3 reserved bytes, 4-byte big-endian payload length) followed by the
//! payload. A frame larger than the configured buffer cap is a fatal
//! protocol error.

use bytes::Bytes;

use crate::sandbox::error::SandboxError;

pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
}

impl StreamKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(StreamKind::Stdin),
            1 => Some(StreamKind::Stdout),
            2 => Some(StreamKind::Stderr),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: StreamKind,
    pub payload: Bytes,
}

pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_frame_size: usize,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        FrameDecoder {
            buffer: Vec::new(),
            max_frame_size,
            poisoned: false,
        }
    }

    /// Feed raw socket bytes; returns every frame that completed.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Frame>, SandboxError> {
        if self.poisoned {
            return Err(SandboxError::MalformedOutput(
                "frame decoder poisoned by earlier error".into(),
            ));
        }
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        loop {
            if self.buffer.len() < HEADER_LEN {
                break;
            }
            let tag = self.buffer[0];
            let len = u32::from_be_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;

            if len > self.max_frame_size {
                self.poisoned = true;
                self.buffer.clear();
                return Err(SandboxError::BufferExceeded {
                    size: len,
                    max: self.max_frame_size,
                });
            }
            if self.buffer.len() < HEADER_LEN + len {
                break;
            }

            let payload = Bytes::copy_from_slice(&self.buffer[HEADER_LEN..HEADER_LEN + len]);
            self.buffer.drain(..HEADER_LEN + len);

            match StreamKind::from_tag(tag) {
                Some(kind) => frames.push(Frame { kind, payload }),
                None => {
                    self.poisoned = true;
                    self.buffer.clear();
                    return Err(SandboxError::MalformedOutput(format!(
                        "unknown stream tag {tag:#04x}"
                    )));
                }
            }
        }
        Ok(frames)
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
