//! Streaming UTF-8 decoding for terminal output.
//!
//! PTY reads are cut at arbitrary byte offsets, so a multi-byte character can
//! straddle two chunks. [`Utf8Decoder`] carries an incomplete trailing
//! sequence over to the next chunk instead of replacing it with U+FFFD.

/// Longest possible incomplete UTF-8 tail.
const MAX_CARRY: usize = 3;

/// Incremental UTF-8 decoder with a carry buffer.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    carry: Vec<u8>,
}

impl Utf8Decoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> usize {
        self.carry.len()
    }

    /// Decode the next chunk.
    ///
    /// Invalid sequences become U+FFFD. An incomplete sequence at the end of
    /// the chunk is kept for the next call.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.carry);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            if after.len() <= MAX_CARRY {
                                self.carry.extend_from_slice(after);
                            } else {
                                out.push(char::REPLACEMENT_CHARACTER);
                            }
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush any held-back bytes, lossily.
    pub fn finish(&mut self) -> String {
        let carry = std::mem::take(&mut self.carry);
        String::from_utf8_lossy(&carry).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passthrough() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"echo hi\r\n"), "echo hi\r\n");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_split_multibyte_character() {
        let bytes = "héllo €".as_bytes();
        // Cut inside the three-byte euro sign.
        let cut = bytes.len() - 1;
        let mut decoder = Utf8Decoder::new();

        let first = decoder.decode(&bytes[..cut]);
        assert_eq!(first, "héllo ");
        assert_eq!(decoder.pending(), 2);

        let second = decoder.decode(&bytes[cut..]);
        assert_eq!(second, "€");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_invalid_byte_is_replaced() {
        let mut decoder = Utf8Decoder::new();
        let out = decoder.decode(b"a\xffb");
        assert_eq!(out, "a\u{FFFD}b");
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn test_finish_flushes_carry() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&[0xe2, 0x82]), "");
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert_eq!(decoder.pending(), 0);
    }
}
