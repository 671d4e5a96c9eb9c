use std::fmt;

use serde::Serialize;

pub const MAX_BULK_SIZE_BYTES: usize = 8 * 1024 * 1024;
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// One decoded server reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Bulk(Option<String>),
}

#[derive(Debug, PartialEq, Eq)]
pub enum CodecError {
    UnknownReplyType { marker: u8 },
    InvalidBulkLength { raw: String },
    BulkTooLarge { size: usize, limit: usize },
    MissingBulkTerminator,
    InvalidUtf8,
    CommandContainsNewline { token: String },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownReplyType { marker } => {
                write!(f, "unknown reply type marker 0x{marker:02x}")
            }
            Self::InvalidBulkLength { raw } => write!(f, "invalid bulk length '{raw}'"),
            Self::BulkTooLarge { size, limit } => {
                write!(f, "bulk reply size {size} exceeds limit {limit}")
            }
            Self::MissingBulkTerminator => write!(f, "bulk reply is not terminated by CRLF"),
            Self::InvalidUtf8 => write!(f, "reply is not valid UTF-8"),
            Self::CommandContainsNewline { token } => {
                write!(f, "command token '{token}' contains a line break")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// A single argument of an outbound command.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Word(String),
    Json(serde_json::Value),
}

impl Token {
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Self::Json)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self::Word(value.to_owned())
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self::Word(value)
    }
}

impl From<serde_json::Value> for Token {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// An ordered list of tokens sent as one line, `VERB token...`.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    tokens: Vec<Token>,
}

impl Command {
    pub fn new(verb: &str) -> Self {
        Self {
            tokens: vec![Token::from(verb)],
        }
    }

    pub fn arg(mut self, token: impl Into<Token>) -> Self {
        self.tokens.push(token.into());
        self
    }

    pub fn args<I, T>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Token>,
    {
        self.tokens.extend(tokens.into_iter().map(Into::into));
        self
    }

    pub fn verb(&self) -> &str {
        match self.tokens.first() {
            Some(Token::Word(verb)) => verb,
            _ => "",
        }
    }

    pub fn render(&self) -> String {
        self.tokens
            .iter()
            .map(|token| match token {
                Token::Word(word) => word.clone(),
                Token::Json(value) => value.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let line = self.render();
        if line.contains('\n') || line.contains('\r') {
            return Err(CodecError::CommandContainsNewline { token: line });
        }

        let mut encoded = Vec::with_capacity(line.len() + LINE_TERMINATOR.len());
        encoded.extend_from_slice(line.as_bytes());
        encoded.extend_from_slice(LINE_TERMINATOR);
        Ok(encoded)
    }
}

/// Incremental decoder. Bytes are fed in arbitrary chunks; complete frames are
/// pulled out with [`ReplyParser::next_frame`].
#[derive(Debug, Default)]
pub struct ReplyParser {
    buffer: Vec<u8>,
}

impl ReplyParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns `Ok(None)` while the buffered bytes do not hold a full reply.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        let Some(line_end) = find_crlf(&self.buffer, 0) else {
            return Ok(None);
        };
        let Some(&marker) = self.buffer.first() else {
            return Ok(None);
        };

        match marker {
            b'+' | b'-' => {
                let text = utf8(&self.buffer[1..line_end])?;
                self.buffer.drain(..line_end + LINE_TERMINATOR.len());
                if marker == b'+' {
                    Ok(Some(Frame::Simple(text)))
                } else {
                    Ok(Some(Frame::Error(text)))
                }
            }
            b'$' => self.next_bulk(line_end),
            other => Err(CodecError::UnknownReplyType { marker: other }),
        }
    }

    fn next_bulk(&mut self, header_end: usize) -> Result<Option<Frame>, CodecError> {
        let raw_len = utf8(&self.buffer[1..header_end])?;
        let declared: i64 = raw_len
            .parse()
            .map_err(|_| CodecError::InvalidBulkLength { raw: raw_len.clone() })?;

        if declared < 0 {
            if declared != -1 {
                return Err(CodecError::InvalidBulkLength { raw: raw_len });
            }
            self.buffer.drain(..header_end + LINE_TERMINATOR.len());
            return Ok(Some(Frame::Bulk(None)));
        }

        let size = declared as usize;
        if size > MAX_BULK_SIZE_BYTES {
            return Err(CodecError::BulkTooLarge {
                size,
                limit: MAX_BULK_SIZE_BYTES,
            });
        }

        let body_start = header_end + LINE_TERMINATOR.len();
        let body_end = body_start + size;
        let frame_end = body_end + LINE_TERMINATOR.len();
        if self.buffer.len() < frame_end {
            return Ok(None);
        }
        if &self.buffer[body_end..frame_end] != LINE_TERMINATOR {
            return Err(CodecError::MissingBulkTerminator);
        }

        let body = utf8(&self.buffer[body_start..body_end])?;
        self.buffer.drain(..frame_end);
        Ok(Some(Frame::Bulk(Some(body))))
    }
}

fn find_crlf(buffer: &[u8], from: usize) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(LINE_TERMINATOR.len())
        .position(|window| window == LINE_TERMINATOR)
        .map(|offset| offset + from)
}

fn utf8(bytes: &[u8]) -> Result<String, CodecError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}
