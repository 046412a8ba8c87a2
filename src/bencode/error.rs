use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("input ended inside a term")]
    Truncated,

    #[error("malformed integer")]
    InvalidInt,

    #[error("malformed string length")]
    InvalidLength,

    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),

    #[error("bytes left over after the outermost term")]
    TrailingBytes,

    #[error("nesting deeper than supported")]
    TooDeep,
}
