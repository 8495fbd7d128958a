//! Command line framing.
//!
//! [`LineAssembler`] turns filtered bytes into command lines with a hard
//! length limit. [`ConsoleCodec`] chains it behind the [`TelnetFilter`] as a
//! `tokio_util` decoder, so the session can read in batches while the
//! framing still runs one byte at a time.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::TelconError;
use crate::telnet::TelnetFilter;

/// Default maximum command length in bytes.
pub const DEFAULT_MAX_LINE_LEN: usize = 128;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = 0;
const SPACE: u8 = b' ';

/// A unit of console input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleFrame {
    /// A terminated command line, without its terminator. May be empty.
    Line(String),

    /// The line grew past the limit and was thrown away.
    Overflow {
        /// Bytes discarded, including the one that hit the limit.
        discarded: usize,
    },
}

// ── LineAssembler ────────────────────────────────────────────────

/// Bounded command buffer with CR / LF / CRLF termination.
#[derive(Debug)]
pub struct LineAssembler {
    buf: BytesMut,
    max_len: usize,
    after_cr: bool,
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE_LEN)
    }
}

impl LineAssembler {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_len),
            max_len,
            after_cr: false,
        }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Bytes collected for the line in progress.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Feed one filtered byte.
    pub fn push(&mut self, byte: u8) -> Option<ConsoleFrame> {
        // Second half of CR LF, or Telnet's CR NUL.
        if std::mem::take(&mut self.after_cr) && (byte == LF || byte == NUL) {
            return None;
        }

        if self.buf.is_empty() && byte == SPACE {
            return None;
        }

        // A full buffer rejects whatever comes next, terminators included.
        if self.buf.len() >= self.max_len {
            let discarded = self.buf.len() + 1;
            self.buf.clear();
            return Some(ConsoleFrame::Overflow { discarded });
        }

        match byte {
            CR => {
                self.after_cr = true;
                Some(self.finish())
            }
            LF => Some(self.finish()),
            _ => {
                self.buf.extend_from_slice(&[byte]);
                None
            }
        }
    }

    /// Drop any partial line, for a fresh connection.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.after_cr = false;
    }

    fn finish(&mut self) -> ConsoleFrame {
        let line = self.buf.split();
        ConsoleFrame::Line(String::from_utf8_lossy(&line).into_owned())
    }
}

// ── ConsoleCodec ─────────────────────────────────────────────────

/// Telnet filter plus line assembler, as a `Decoder`.
///
/// Every byte handed to `decode` is consumed, whether or not it completes a
/// frame, so partial lines and half-read control sequences live in the codec
/// rather than in the read buffer.
#[derive(Debug, Default)]
pub struct ConsoleCodec {
    filter: TelnetFilter,
    lines: LineAssembler,
}

impl ConsoleCodec {
    pub fn new(max_line_len: usize) -> Self {
        Self {
            filter: TelnetFilter::new(),
            lines: LineAssembler::new(max_line_len),
        }
    }

    pub fn filter(&self) -> &TelnetFilter {
        &self.filter
    }

    pub fn assembler(&self) -> &LineAssembler {
        &self.lines
    }

    pub fn reset(&mut self) {
        self.filter.reset();
        self.lines.reset();
    }
}

impl Decoder for ConsoleCodec {
    type Item = ConsoleFrame;
    type Error = TelconError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while src.has_remaining() {
            let byte = src.get_u8();
            let Some(data) = self.filter.push(byte) else {
                continue;
            };
            if let Some(frame) = self.lines.push(data) {
                return Ok(Some(frame));
            }
        }
        Ok(None)
    }
}

// ── Tests ────────────────────────────────────────────────────────
