//! The error taxonomy every fallible kernel operation returns.
//!
//! One variant per row of the error table: loads either succeed with a
//! `BlockGraph` (plus warnings, see [`crate::engine::Warning`]) or fail with
//! exactly one of these, never a half-built graph.

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// A position inside a schema source, for [`Error::SchemaError`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchemaPos {
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for SchemaPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("end of stream: wanted {wanted} bytes, {available} available")]
    EndOfStream { wanted: u64, available: u64 },

    #[error("schema error at {0:?}")]
    SchemaError(Vec<(SchemaPos, String)>),

    #[error("unknown type {0:?}")]
    UnknownType(String),

    #[error("expression error: {0}")]
    ExprError(String),

    #[error("link field declared as {declared:?} but target block {target_index} is {actual:?}")]
    LinkTypeMismatch {
        declared: String,
        actual: String,
        target_index: u32,
    },

    #[error("link index {index} out of range (block table has {len} entries)")]
    LinkOutOfRange { index: i64, len: u32 },

    #[error("cannot assign {value_kind} to field {field:?} of type {declared:?}")]
    TypeError {
        field: String,
        declared: String,
        value_kind: String,
    },

    #[error("unsupported version {version:#010x} (user_version {user_version:#010x})")]
    UnsupportedVersion { version: u32, user_version: u32 },

    #[error("corrupt block: {0}")]
    CorruptBlock(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn from_io(wanted: u64, err: std::io::Error) -> Error {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::EndOfStream {
                wanted,
                available: 0,
            }
        } else {
            Error::Io(err)
        }
    }
}
