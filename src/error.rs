use crate::types::{EventId, StreamId};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid argument ({0})")]
    Invalid(String),

    #[error("Attempted to mutate a frozen {0}")]
    Frozen(&'static str),

    #[error("No field named '{0}'")]
    NotFound(String),

    #[error("[resolving] {0}")]
    PathResolution(String),

    #[error("Field type of '{0}' does not match the declared type")]
    TypeMismatch(String),

    #[error("[serialize] {0}")]
    Validation(String),

    #[error("Encountered a CTF stream ID ({0}) that's not defined in the trace")]
    UndefinedStreamId(StreamId),

    #[error("Encountered a CTF event ID ({0}) that's not defined in the stream class")]
    UndefinedEventId(EventId),

    #[error(
        "Encountered an IO error while accessing the packet stream ({})",
        .0.kind()
    )]
    Io(#[from] io::Error),

    #[error("Resource exhausted ({0})")]
    ResourceExhausted(String),
}

impl Error {
    pub(crate) fn invalid<S: Into<String>>(msg: S) -> Self {
        Error::Invalid(msg.into())
    }

    pub(crate) fn not_found<S: Into<String>>(name: S) -> Self {
        Error::NotFound(name.into())
    }

    pub(crate) fn resolution<S: Into<String>>(msg: S) -> Self {
        Error::PathResolution(msg.into())
    }

    pub(crate) fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }
}
