use std::string::FromUtf8Error;

use serde::Serialize;
use strum_macros::Display;
use tracing::trace;

/// Line terminator appended to every outgoing command.
pub const COMMAND_TERMINATOR: &[u8] = b"\r";

/// Prompt byte the adapter sends once a response is complete.
pub const RESPONSE_TERMINATOR: u8 = b'>';

/// Projection requested for a command's response.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    /// Decoded text with surrounding whitespace trimmed.
    #[strum(to_string = "text")]
    Text,
    /// Raw bytes before the terminator.
    #[strum(to_string = "bytes")]
    Bytes,
    /// Raw bytes plus the notification fragments they arrived in.
    #[strum(to_string = "chunked_bytes")]
    ChunkedBytes,
}

/// Response bytes together with the notification fragments that carried them.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ChunkedResponse {
    data: Vec<u8>,
    chunks: Vec<Vec<u8>>,
}

impl ChunkedResponse {
    /// Returns the concatenated response bytes, terminator excluded.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Returns the fragments as delivered, the last one cut at the terminator.
    #[must_use]
    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    /// Splits the response into its bytes and fragments.
    #[must_use]
    pub fn into_parts(self) -> (Vec<u8>, Vec<Vec<u8>>) {
        (self.data, self.chunks)
    }
}

/// Encodes one command line for the adapter.
///
/// ```
/// assert_eq!(b"010C\r".to_vec(), elmble::encode_command("010C"));
/// ```
#[must_use]
pub fn encode_command(text: &str) -> Vec<u8> {
    let line = text.trim_end_matches(['\r', '\n']);
    let mut encoded = Vec::with_capacity(line.len() + COMMAND_TERMINATOR.len());
    encoded.extend_from_slice(line.as_bytes());
    encoded.extend_from_slice(COMMAND_TERMINATOR);
    encoded
}

/// Decodes response bytes as text, trimming surrounding whitespace.
///
/// # Errors
///
/// Returns an error when the bytes are not valid UTF-8.
pub fn decode_text(bytes: Vec<u8>) -> Result<String, FromUtf8Error> {
    let text = String::from_utf8(bytes)?;
    Ok(text.trim().to_string())
}

/// Accumulates notification fragments until the response terminator arrives.
#[derive(Debug, Default)]
pub(crate) struct ResponseAccumulator {
    buffer: Vec<u8>,
    chunk_log: Vec<Vec<u8>>,
}

impl ResponseAccumulator {
    /// Appends one fragment and returns the completed response once the
    /// terminator has been seen.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Option<ChunkedResponse> {
        if chunk.is_empty() {
            trace!("ignoring empty notification fragment");
            return None;
        }

        let scan_from = self.buffer.len();
        self.buffer.extend_from_slice(chunk);
        self.chunk_log.push(chunk.to_vec());

        let offset = self.buffer[scan_from..]
            .iter()
            .position(|byte| *byte == RESPONSE_TERMINATOR)?;
        Some(self.take_until(scan_from + offset))
    }

    /// Returns the number of buffered bytes.
    pub(crate) fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn take_until(&mut self, terminator_index: usize) -> ChunkedResponse {
        let mut data = std::mem::take(&mut self.buffer);
        let discarded = data.len() - terminator_index - 1;
        if discarded > 0 {
            trace!(discarded, "dropping bytes received after the terminator");
        }
        data.truncate(terminator_index);

        let mut chunks = Vec::with_capacity(self.chunk_log.len());
        let mut consumed = 0usize;
        for mut chunk in std::mem::take(&mut self.chunk_log) {
            if consumed >= terminator_index {
                break;
            }
            let remaining = terminator_index - consumed;
            consumed += chunk.len();
            chunk.truncate(remaining);
            chunks.push(chunk);
        }

        ChunkedResponse { data, chunks }
    }
}
