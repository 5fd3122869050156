//! Error types for the tessera core.
//!
//! None of these are fatal. The tick pipeline logs them and drops the
//! offending input; the next periodic resync repairs whatever was lost.

use thiserror::Error;

/// Errors raised by the attribute codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Slot holds a different type than requested
    #[error("Type mismatch at slot {index}: expected type {expected}, found {found}")]
    TypeMismatch { index: usize, expected: u8, found: u8 },

    /// Slot index beyond the end of the list
    #[error("Slot {index} out of range (list has {len} slots)")]
    OutOfRange { index: usize, len: usize },

    /// Encoded record skips ahead of the next free slot
    #[error("Corrupt record: index {index} with only {len} slots known")]
    CorruptIndex { index: usize, len: usize },

    /// Type code not in the catalogue
    #[error("Unknown attribute type code {0}")]
    UnknownType(u8),

    /// Record length does not match its type
    #[error("Bad length {length} for attribute type {type_code}")]
    BadLength { type_code: u8, length: usize },

    /// Ran out of bytes while decoding
    #[error("Truncated attribute data")]
    Truncated,

    /// Text attribute that is not valid UTF-8
    #[error("Invalid UTF-8 in text attribute")]
    InvalidText,

    /// Too many slots or bytes to fit the header fields
    #[error("Attribute list too large to pack: {0}")]
    TooLarge(String),
}

/// Errors raised while decoding wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Tag outside the message catalogue
    #[error("Unknown message tag {0}")]
    UnknownTag(u16),

    /// Payload written with a different layout version
    #[error("Layout version {found} not supported (expected {expected})")]
    LayoutVersion { expected: u8, found: u8 },

    /// Payload shorter than its fixed header or declared sections
    #[error("Truncated {0} message")]
    Truncated(&'static str),

    /// Bytes left over after a complete message
    #[error("{extra} trailing bytes after {message} message")]
    TrailingBytes { message: &'static str, extra: usize },

    /// Embedded attribute data failed to decode
    #[error("Attribute payload: {0}")]
    Codec(#[from] CodecError),
}
