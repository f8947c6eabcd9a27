//! Newline-delimited UTF-8 framing. One logical message per line; a bare
//! newline inside a message splits it, since the wire format has no escaping
//! or length prefix (documented limitation).

/// Read-chunk size for receive loops feeding the assembler. Kept small so
/// bytes reach the assembler as soon as the kernel has them.
pub const READ_CHUNK_SIZE: usize = 1024;

/// Encode one message for the wire: the text followed by a single `\n`.
pub fn encode_line(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 1);
    out.extend_from_slice(text.as_bytes());
    out.push(b'\n');
    out
}

/// Accumulates raw byte chunks and yields complete lines. The protocol is
/// stateless per line; this only buffers the trailing partial line.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and extract every line it completes, in order. Lines
    /// are decoded lossily as UTF-8, trimmed, and dropped if empty after
    /// trimming. Bytes after the last newline stay buffered for the next
    /// chunk.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Bytes buffered waiting for a terminating newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
