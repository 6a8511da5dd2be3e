use thiserror::Error;

#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("empty input")]
    EmptyInput,

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid length prefix")]
    InvalidLength,

    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),

    #[error("dictionary key is not a byte string")]
    InvalidKey,

    #[error("trailing data after value")]
    TrailingData,

    #[error("nesting too deep")]
    NestingTooDeep,
}
