//! Crate-level error type.
//!
//! `get`, `put`, and `remove` never surface I/O errors — they mediate through the Loader and
//! Flusher, which capture failures into signals. Only `Store::flush` surfaces them.

use std::io;
use std::sync::Arc;

use snafu::Snafu;

use crate::codec::CodecError;

#[derive(Debug, Snafu, Clone)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    // Named `cause` rather than `source`: snafu treats a field literally named `source` as the
    // error's source and requires it to impl `AsErrorSource`, which `Arc<T>` never does (only
    // `Box<T>` gets the stdlib passthrough). `Arc` here is purely to make `StoreError: Clone` for
    // `FallibleSignal`'s `Shared` future, so it's kept as plain wrapped data instead.
    #[snafu(display("I/O error: {cause}"))]
    Io { cause: Arc<io::Error> },

    #[snafu(display("catalog codec error: {cause}"))]
    Codec { cause: Arc<CodecError> },

    #[snafu(display("no serializer configured for non-bytes value of key {key:?}"))]
    MissingSerializer { key: String },

    #[snafu(display("entry for key {key:?} has neither a value nor a reader"))]
    IllegalState { key: String },

    #[snafu(display("serializer failed for key {key:?}: {reason}"))]
    Serialize { key: String, reason: String },

    #[snafu(display("background task for key {key:?} panicked or was cancelled"))]
    TaskJoin { key: String },

    #[snafu(display("value reader for key {key:?} failed: {reason}"))]
    ReaderFailed { key: String, reason: String },
}

impl From<io::Error> for StoreError {
    fn from(cause: io::Error) -> Self {
        StoreError::Io {
            cause: Arc::new(cause),
        }
    }
}

impl From<CodecError> for StoreError {
    fn from(cause: CodecError) -> Self {
        StoreError::Codec {
            cause: Arc::new(cause),
        }
    }
}
