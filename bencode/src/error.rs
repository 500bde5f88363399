pub type Result<T> = std::result::Result<T, Error>;

// Structural decode errors. The offset is where the decoder gave up.
#[derive(Debug, thiserror::Error)]
pub enum Error {

    #[error("unexpected end of input at offset {0}")]
    Truncated(usize),

    #[error("unknown leading byte {byte:#04x} at offset {offset}")]
    UnknownToken {
        byte: u8,
        offset: usize,
    },

    #[error("invalid integer literal at offset {0}")]
    InvalidInteger(usize),

    #[error("invalid string length prefix at offset {0}")]
    InvalidLength(usize),

    #[error("dictionary key is not a byte string at offset {0}")]
    NonStringKey(usize),
}
