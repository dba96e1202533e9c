use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("unexpected byte {0:?}")]
    UnexpectedByte(u8),

    #[error("invalid integer")]
    InvalidInteger,

    #[error("invalid string length")]
    InvalidStringLength,

    #[error("dictionary key is not a byte string")]
    NonStringKey,

    #[error("nesting deeper than the permitted limit")]
    NestingTooDeep,

    #[error("trailing data after the value")]
    TrailingData,
}
