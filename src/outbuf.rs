//! Line framing for child stdout.
//!
//! The poll loop reads whatever bytes the pipe currently holds and pushes
//! them here; complete `\n`-terminated lines come back out one at a time.
//! A trailing partial line stays buffered until more bytes arrive (or is
//! simply retained if the child never finishes it).

/// Accumulates raw child output and yields whole lines.
#[derive(Debug, Default)]
pub struct OutputBuffer {
    pending: Vec<u8>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        OutputBuffer {
            pending: Vec::new(),
        }
    }

    /// Append a chunk of bytes read from the child.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Pop the next complete line, without its trailing `\n`.
    ///
    /// Empty lines are consumed but never returned: a buffer holding only
    /// `\n` yields nothing. Bytes are decoded lossily at this boundary so a
    /// child emitting broken UTF-8 cannot wedge the stream.
    pub fn next_line(&mut self) -> Option<String> {
        loop {
            let pos = self.pending.iter().position(|&b| b == b'\n')?;
            if pos == 0 {
                self.pending.drain(..=0);
                continue;
            }
            let line = String::from_utf8_lossy(&self.pending[..pos]).into_owned();
            self.pending.drain(..=pos);
            return Some(line);
        }
    }

    /// Bytes received but not yet part of a complete line.
    pub fn residue(&self) -> &[u8] {
        &self.pending
    }

    /// Discard everything buffered. Called when a new child is launched so
    /// one process's tail can never leak into the next one's stream.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
