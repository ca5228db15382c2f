//! Incremental parser for the CLI's streamed JSON output.
//!
//! Chunks arrive with terminal noise: ANSI escapes, carriage returns,
//! shell preamble before the first JSON value. The parser strips all of
//! that, buffers until at least one complete JSON value decodes, and
//! supports both concatenated values in one chunk and values split
//! across chunks. An object with `type == "result"` ends the stream for
//! good; everything buffered after it is discarded.

use serde_json::Value;

use crate::sandbox::error::SandboxError;

pub struct JsonStreamParser {
    buffer: String,
    started: bool,
    finished: bool,
    max_buffer_size: usize,
}

impl JsonStreamParser {
    pub fn new(max_buffer_size: usize) -> Self {
        JsonStreamParser {
            buffer: String::new(),
            started: false,
            finished: false,
            max_buffer_size,
        }
    }

    /// True once the terminal `result` object has been yielded.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Feed one raw chunk; returns every value that completed.
    pub fn feed(&mut self, chunk: &str) -> Result<Vec<Value>, SandboxError> {
        if self.finished {
            return Ok(Vec::new());
        }

        let cleaned = strip_ansi_escapes(chunk).replace('\r', "");
        self.buffer.push_str(&cleaned);

        // Drop shell preamble before the first JSON value.
        if !self.started {
            match self.buffer.find(['{', '[']) {
                Some(pos) => {
                    self.buffer.drain(..pos);
                    self.started = true;
                }
                None => {
                    self.buffer.clear();
                    return Ok(Vec::new());
                }
            }
        }

        let mut values = Vec::new();
        let mut consumed = 0;
        {
            let mut stream = serde_json::Deserializer::from_str(&self.buffer).into_iter::<Value>();
            loop {
                match stream.next() {
                    Some(Ok(value)) => {
                        consumed = stream.byte_offset();
                        let is_result = value.get("type").and_then(Value::as_str) == Some("result");
                        values.push(value);
                        if is_result {
                            self.finished = true;
                            break;
                        }
                    }
                    Some(Err(err)) if err.is_eof() => break,
                    Some(Err(err)) => {
                        self.buffer.clear();
                        return Err(SandboxError::MalformedOutput(format!(
                            "invalid JSON in CLI output: {err}"
                        )));
                    }
                    None => break,
                }
            }
        }
        if self.finished {
            self.buffer.clear();
        } else {
            self.buffer.drain(..consumed);
            // Whitespace between values keeps the decoder in an EOF loop.
            let trimmed = self.buffer.trim_start().len();
            let skip = self.buffer.len() - trimmed;
            self.buffer.drain(..skip);
            // The cap bounds what stays buffered undecoded, so a chunk
            // of any size is fine as long as it decodes.
            if self.buffer.len() > self.max_buffer_size {
                let size = self.buffer.len();
                self.buffer.clear();
                return Err(SandboxError::BufferExceeded {
                    size,
                    max: self.max_buffer_size,
                });
            }
        }
        Ok(values)
    }

    /// Called at end-of-stream; leftover non-whitespace means the CLI
    /// died mid-value.
    pub fn finish(&mut self) -> Result<(), SandboxError> {
        if !self.finished && !self.buffer.trim().is_empty() {
            let leftover: String = self.buffer.chars().take(120).collect();
            self.buffer.clear();
            return Err(SandboxError::MalformedOutput(format!(
                "stream ended mid-value: {leftover:?}"
            )));
        }
        Ok(())
    }
}

/// Strip ANSI escape sequences (no regex dependency).
pub fn strip_ansi_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            // CSI: ESC [
            if chars.peek() == Some(&'[') {
                chars.next();
                // Parameter bytes (0x30-0x3F) and intermediate bytes (0x20-0x2F)
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == ';' || c == '?' || (' '..='/').contains(&c) {
                        chars.next();
                    } else {
                        break;
                    }
                }
                // Final byte (0x40-0x7E)
                if let Some(&c) = chars.peek() {
                    if ('@'..='~').contains(&c) {
                        chars.next();
                    }
                }
            }
            // OSC: ESC ] ... BEL or ST
            else if chars.peek() == Some(&']') {
                chars.next();
                while let Some(c) = chars.next() {
                    if c == '\x07' {
                        break;
                    }
                    if c == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            // Other two-byte escapes
            else {
                chars.next();
            }
        } else {
            out.push(ch);
        }
    }
    out
}
