//! Bounded output accumulation for running commands.

use crate::relay::error::RelayError;

/// Output buffer for collecting command output under a byte ceiling.
///
/// The ceiling covers stdout and stderr together. A chunk that would push the
/// total past the ceiling is rejected whole and never appended, so nothing
/// beyond the limit is ever relayed.
#[derive(Debug)]
pub struct OutputBuffer {
    stdout: String,
    stderr: Vec<u8>,
    decoder: Utf8Decoder,
    total_bytes: usize,
    max_bytes: usize,
}

impl OutputBuffer {
    /// Create a new output buffer with pre-allocated capacity.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            stdout: String::with_capacity(4096),
            stderr: Vec::with_capacity(1024),
            decoder: Utf8Decoder::default(),
            total_bytes: 0,
            max_bytes,
        }
    }

    fn reserve(&mut self, len: usize) -> Result<(), RelayError> {
        let total = self.total_bytes.saturating_add(len);
        if total > self.max_bytes {
            return Err(RelayError::OutputTooLarge(self.max_bytes));
        }
        self.total_bytes = total;
        Ok(())
    }

    /// Append stdout bytes and return the text that is ready to relay.
    ///
    /// The returned text may be empty when the data ends inside a multi-byte
    /// character; the held bytes are emitted with the next chunk.
    pub fn push_stdout(&mut self, data: &[u8]) -> Result<String, RelayError> {
        self.reserve(data.len())?;
        let text = self.decoder.decode(data);
        self.stdout.push_str(&text);
        Ok(text)
    }

    pub fn push_stderr(&mut self, data: &[u8]) -> Result<(), RelayError> {
        self.reserve(data.len())?;
        self.stderr.extend_from_slice(data);
        Ok(())
    }

    /// Flush any incomplete trailing character as a final stdout chunk.
    pub fn finish_stdout(&mut self) -> String {
        let text = self.decoder.flush();
        self.stdout.push_str(&text);
        text
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    /// Consume the buffer into `(stdout, stderr)`.
    pub fn into_parts(mut self) -> (String, String) {
        self.finish_stdout();
        let stderr = String::from_utf8_lossy(&self.stderr).into_owned();
        (self.stdout, stderr)
    }
}

/// Incremental UTF-8 decoder.
///
/// SSH data packets split output at arbitrary byte boundaries. Bytes of a
/// character cut at the end of a packet are held until the next packet, so
/// relayed chunks concatenate to the same text as decoding the whole stream.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, data: &[u8]) -> String {
        self.pending.extend_from_slice(data);

        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // Incomplete sequence at the end; keep it for later
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let remaining = rest.to_vec();
        self.pending = remaining;
        out
    }

    /// Emit whatever is held, replacing an incomplete sequence.
    pub fn flush(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}
