//! Incremental decoding of process output.

/// Decodes a byte stream as UTF-8 across arbitrary chunk boundaries.
///
/// Incomplete multi-byte sequences at the end of a chunk are held back until
/// the next chunk arrives. Invalid sequences become U+FFFD.
#[derive(Clone, Debug, Default)]
pub struct Utf8StreamDecoder {
    pending: Vec<u8>,
}

impl Utf8StreamDecoder {
    /// Creates an empty decoder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Appends `bytes` and returns all text that can be decoded so far.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid: Vec<u8> = self.pending.drain(..err.valid_up_to()).collect();
                    out.push_str(&String::from_utf8_lossy(&valid));
                    let Some(invalid_len) = err.error_len() else {
                        return out;
                    };
                    let skip = invalid_len.min(self.pending.len());
                    self.pending.drain(..skip);
                    out.push(char::REPLACEMENT_CHARACTER);
                }
            }
        }
    }

    /// Flushes any held-back bytes, replacing an unfinished sequence.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}

/// Splits decoded text into complete lines.
#[derive(Clone, Debug, Default)]
pub struct LineAssembler {
    partial: String,
}

impl LineAssembler {
    /// Creates an empty assembler.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            partial: String::new(),
        }
    }

    /// Appends `text`, returning each line completed by it without its
    /// terminator.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.partial.push_str(text);
        let mut lines = Vec::new();
        while let Some(newline) = self.partial.find('\n') {
            let rest = self.partial.split_off(newline + 1);
            let mut line = std::mem::replace(&mut self.partial, rest);
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Returns the unterminated remainder, if any.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.partial);
        (!rest.is_empty()).then_some(rest)
    }
}
