/// Where the top-level value of a streamed JSON document stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum TopLevel {
    #[default]
    Empty,
    /// Inside an object, array or string that is not closed yet.
    Open,
    /// A bare number or literal; its end is only known from what follows.
    Scalar,
    /// Whitespace followed a bare scalar.
    ScalarEnded,
    Closed,
    /// Structure that can never become a single valid value.
    Invalid,
}

/// Incremental structural tracker for a JSON document that arrives in pieces.
///
/// Each piece is scanned once, so checking completeness after every fragment
/// costs only the new bytes. The tracker follows nesting and string escapes;
/// it does not validate tokens, so a value reported complete still needs a
/// real parse.
#[derive(Debug, Clone, Default)]
pub(crate) struct JsonProgress {
    depth: u32,
    in_string: bool,
    escaped: bool,
    top: TopLevel,
}

impl JsonProgress {
    pub(crate) fn feed(&mut self, piece: &str) {
        for &byte in piece.as_bytes() {
            if self.top == TopLevel::Invalid {
                return;
            }
            if self.in_string {
                self.feed_string_byte(byte);
                continue;
            }
            match byte {
                b' ' | b'\n' | b'\r' | b'\t' => {
                    if self.top == TopLevel::Scalar {
                        self.top = TopLevel::ScalarEnded;
                    }
                }
                b'"' => {
                    self.open_top_level();
                    self.in_string = true;
                }
                b'{' | b'[' => {
                    self.open_top_level();
                    self.depth += 1;
                }
                b'}' | b']' => {
                    if self.depth == 0 {
                        self.top = TopLevel::Invalid;
                    } else {
                        self.depth -= 1;
                        if self.depth == 0 {
                            self.top = TopLevel::Closed;
                        }
                    }
                }
                _ if self.depth > 0 => {}
                _ => match self.top {
                    TopLevel::Empty | TopLevel::Scalar => self.top = TopLevel::Scalar,
                    _ => self.top = TopLevel::Invalid,
                },
            }
        }
    }

    /// Whether the bytes so far may form exactly one complete value.
    pub(crate) fn may_be_complete(&self) -> bool {
        matches!(
            self.top,
            TopLevel::Closed | TopLevel::Scalar | TopLevel::ScalarEnded
        )
    }

    fn feed_string_byte(&mut self, byte: u8) {
        if self.escaped {
            self.escaped = false;
        } else if byte == b'\\' {
            self.escaped = true;
        } else if byte == b'"' {
            self.in_string = false;
            if self.depth == 0 {
                self.top = TopLevel::Closed;
            }
        }
    }

    /// A string or container starts; at the top level only one may.
    fn open_top_level(&mut self) {
        if self.depth > 0 {
            return;
        }
        self.top = match self.top {
            TopLevel::Empty => TopLevel::Open,
            _ => TopLevel::Invalid,
        };
    }
}
