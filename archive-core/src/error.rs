use miette::Diagnostic;
use thiserror::Error;

use crate::ids::Id;

/// Errors raised inside the domain layer: malformed archive state, schema
/// mismatches, and post-fetch consistency violations. Transport and
/// authentication failures belong to `archive-client`'s own error type.
#[derive(Debug, Error, Diagnostic)]
pub enum CoreError {
    #[error("channel {channel} header is not valid JSON")]
    MalformedHeader {
        channel: Id,
        #[source]
        source: serde_json::Error,
    },

    #[error("channel {channel} header has incompatible major version {found} (expected {expected})")]
    IncompatibleHeaderVersion {
        channel: Id,
        found: u32,
        expected: u32,
    },

    #[error("channel {channel} data file is {actual} bytes, header records {expected}")]
    DataFileSizeMismatch {
        channel: Id,
        expected: u64,
        actual: u64,
    },

    #[error("post {post} in channel {channel} is not valid JSON")]
    MalformedPost {
        channel: Id,
        post: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("requested time range is empty: afterTime {after} is not before beforeTime {before}")]
    EmptyTimeRange { after: i64, before: i64 },

    #[error("storage merge called with mismatched post ordering")]
    OrderingMismatch,

    #[error("appended storage does not continue from the existing tail (expected postIdBeforeFirst {expected:?}, got last post {actual:?})")]
    NonContiguousAppend {
        expected: Option<Id>,
        actual: Option<Id>,
    },

    #[error("io error accessing archive file")]
    Io(#[from] std::io::Error),

    #[error("{entity} payload from server is missing required field {field:?}")]
    MissingField {
        entity: &'static str,
        field: &'static str,
    },

    #[error("{entity} payload from server is not a JSON object")]
    NotAnObject { entity: &'static str },
}
