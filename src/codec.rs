//! Line codec for the inter-node protocol.
//!
//! Every record is one JSON object followed by a single `\n`.  There is no
//! length prefix, so a reader has to hold on to unterminated bytes until
//! the rest of the line arrives; [`LineBuffer`] does that.

use crate::error::{RelayError, Result};
use crate::types::Update;

pub const DELIMITER: u8 = b'\n';

/// Serialises `update` as one newline-terminated JSON line.
pub fn encode(update: &Update) -> Result<Vec<u8>> {
    let mut line = serde_json::to_vec(update).map_err(RelayError::Encode)?;
    line.push(DELIMITER);
    Ok(line)
}

/// Decodes a single line (without its delimiter) into a fresh [`Update`].
pub fn decode_line(line: &[u8]) -> Result<Update> {
    serde_json::from_slice(strip_cr(line)).map_err(RelayError::Decode)
}

/// Decodes every non-empty line of `buf`.
///
/// Each segment is decoded on its own, so a bad line yields an `Err` in
/// its slot without touching its neighbours.
pub fn decode(buf: &[u8]) -> Vec<Result<Update>> {
    buf.split(|&b| b == DELIMITER)
        .map(strip_cr)
        .filter(|line| !line.is_empty())
        .map(decode_line)
        .collect()
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// A line grew past the configured limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTooLong;

/// Streaming splitter that keeps a partial line between reads.
///
/// The length limit applies to every line, finished or not, so the outcome
/// does not depend on how the bytes were split into reads.
#[derive(Debug)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line: usize,
}

impl LineBuffer {
    pub fn new(max_line: usize) -> Self {
        Self {
            pending: Vec::new(),
            max_line,
        }
    }

    /// Appends `bytes` and returns every non-empty line they complete.
    /// Bytes after the last delimiter stay buffered for the next call.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, LineTooLong> {
        // Only the new bytes can hold a delimiter we have not seen yet.
        let scan_from = self.pending.len();
        self.pending.extend_from_slice(bytes);

        let Some(last) = self.pending[scan_from..]
            .iter()
            .rposition(|&b| b == DELIMITER)
        else {
            return self.check_tail().map(|()| Vec::new());
        };

        let rest = self.pending.split_off(scan_from + last + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        self.check_tail()?;

        let mut lines = Vec::new();
        for line in complete.split(|&b| b == DELIMITER) {
            if line.len() > self.max_line {
                return Err(LineTooLong);
            }
            let line = strip_cr(line);
            if !line.is_empty() {
                lines.push(line.to_vec());
            }
        }
        Ok(lines)
    }

    fn check_tail(&self) -> Result<(), LineTooLong> {
        if self.pending.len() > self.max_line {
            Err(LineTooLong)
        } else {
            Ok(())
        }
    }

    /// Takes whatever unterminated bytes are left, e.g. at end of stream.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.pending);
        let rest = strip_cr(&rest);
        (!rest.is_empty()).then(|| rest.to_vec())
    }

    /// Number of bytes waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
