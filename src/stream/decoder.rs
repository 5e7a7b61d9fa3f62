/// Incremental UTF-8 decoder for network chunks.
///
/// Bytes of a code point split across chunk boundaries are held back until the
/// sequence completes, so concatenating every `decode` output plus the final
/// `flush` equals decoding the whole byte sequence at once.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes` and return all text that is complete so far.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        let mut out = String::new();
        self.decode_into(bytes, &mut out);
        out
    }

    /// Decode `bytes`, appending complete text to `out`.
    pub fn decode_into(&mut self, bytes: &[u8], out: &mut String) {
        if bytes.is_empty() {
            return;
        }

        if self.pending.is_empty() {
            let consumed = decode_prefix(bytes, out);
            self.pending.extend_from_slice(&bytes[consumed..]);
            return;
        }

        self.pending.extend_from_slice(bytes);
        let consumed = decode_prefix(&self.pending, out);
        self.pending.drain(..consumed);
    }

    /// Drain whatever is left, replacing malformed trailing bytes with U+FFFD.
    pub fn flush(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }

    /// Number of bytes waiting for the rest of their code point.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

/// Push the longest decodable prefix of `bytes` into `out` and return how many
/// bytes were consumed.
///
/// An incomplete sequence at the very end stops decoding; a sequence that can
/// never become valid is replaced with U+FFFD so the buffer cannot stall.
fn decode_prefix(bytes: &[u8], out: &mut String) -> usize {
    let mut offset = 0;
    loop {
        let rest = &bytes[offset..];
        match std::str::from_utf8(rest) {
            Ok(text) => {
                out.push_str(text);
                return bytes.len();
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                // Safety: `valid_up_to` marks the end of a valid UTF-8 prefix.
                out.push_str(unsafe { std::str::from_utf8_unchecked(&rest[..valid_up_to]) });
                match err.error_len() {
                    None => return offset + valid_up_to,
                    Some(invalid_len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        offset += valid_up_to + invalid_len;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_ascii_passthrough() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"data: hi\n"), "data: hi\n");
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_decode_empty_chunk() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b""), "");
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_decode_split_two_byte_char() {
        let mut decoder = Utf8Decoder::new();
        let bytes = "é".as_bytes();
        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.pending_len(), 1);
        assert_eq!(decoder.decode(&bytes[1..]), "é");
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn test_decode_four_byte_char_over_four_chunks() {
        let mut decoder = Utf8Decoder::new();
        let bytes = "a😀b".as_bytes();
        let mut out = String::new();
        for byte in bytes {
            out.push_str(&decoder.decode(std::slice::from_ref(byte)));
        }
        out.push_str(&decoder.flush());
        assert_eq!(out, "a😀b");
    }

    #[test]
    fn test_decode_holds_only_the_incomplete_tail() {
        let mut decoder = Utf8Decoder::new();
        let bytes = "日本".as_bytes();
        assert_eq!(decoder.decode(&bytes[..4]), "日");
        assert_eq!(decoder.pending_len(), 1);
        assert_eq!(decoder.decode(&bytes[4..]), "本");
    }

    #[test]
    fn test_flush_replaces_truncated_tail() {
        let mut decoder = Utf8Decoder::new();
        let bytes = "€".as_bytes();
        assert_eq!(decoder.decode(&bytes[..2]), "");
        assert_eq!(decoder.flush(), "\u{FFFD}");
        assert_eq!(decoder.pending_len(), 0);
        assert_eq!(decoder.flush(), "");
    }

    #[test]
    fn test_decode_replaces_invalid_middle_bytes() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xFFb"), "a\u{FFFD}b");
        assert_eq!(decoder.pending_len(), 0);
    }
}
