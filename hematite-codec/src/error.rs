use thiserror::Error;

/// Errors raised while encoding or decoding typed values
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The byte does not name a known encoding
    #[error("invalid format code 0x{0:02x}")]
    InvalidFormatCode(u8),

    /// The input ends before one complete value; the caller may retry
    /// once more bytes arrive
    #[error("need more bytes to complete the value")]
    Incomplete,

    /// A string or symbol payload is not valid UTF-8
    #[error("invalid utf-8 in string payload")]
    InvalidUtf8,

    /// A char payload is not a valid UTF-32 code point
    #[error("invalid utf-32 char payload")]
    InvalidChar,

    /// Array elements do not share a single constructor
    #[error("array elements do not share one constructor")]
    HeterogeneousArray,

    /// A map body carried an odd number of items
    #[error("map body carries an odd number of items")]
    OddMapCount,

    /// A size or count prefix disagrees with the bytes that follow
    #[error("size prefix disagrees with the encoded body")]
    InvalidSize,

    /// Extra bytes remained where exactly one value was expected
    #[error("trailing bytes after value")]
    TrailingBytes,
}

impl Error {
    /// True when more input could allow the decode to succeed
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Error::Incomplete)
    }
}
