use crate::types::RecordType;

/// Errors that can occur during record encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// The record header carries a protocol version other than 1.
    ///
    /// Fatal: the byte offsets of every later record are untrustworthy.
    #[error("unsupported FastCGI version {0} (expected 1)")]
    UnsupportedVersion(u8),

    /// Content passed to the encoder exceeds the 16-bit length field.
    #[error("record content too large ({size} bytes, max {max})")]
    ContentTooLarge { size: usize, max: usize },

    /// A fixed-layout body is shorter than its record type requires.
    #[error("invalid {record_type:?} body: expected {expected} bytes, got {actual}")]
    InvalidBody {
        record_type: RecordType,
        expected: usize,
        actual: usize,
    },

    /// An I/O error occurred while reading or writing records.
    #[error("record I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed, possibly in the middle of a record.
    #[error("connection closed")]
    ConnectionClosed,

    /// A previous fatal decode error stopped this reader.
    #[error("record stream halted after a fatal error")]
    Halted,
}

impl RecordError {
    /// Whether this error leaves the byte stream in an unknown position.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnsupportedVersion(_) | Self::Halted)
    }
}

pub type Result<T> = std::result::Result<T, RecordError>;

/// Malformed name-value pair encoding.
///
/// Kept apart from [`RecordError`]: it describes the contents of an
/// assembled stream, not the framing around it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamsError {
    /// The buffer ends inside a 1- or 4-byte length prefix.
    #[error("truncated length prefix at offset {offset}")]
    TruncatedLength { offset: usize },

    /// A name or value runs past the end of the buffer.
    #[error("truncated name-value body at offset {offset}: need {needed} bytes, {available} available")]
    TruncatedBody {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// A name or value is too long for the 31-bit length encoding.
    #[error("name-value length {0} exceeds 2^31-1")]
    LengthOverflow(usize),
}
