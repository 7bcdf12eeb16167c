use std::io;
use thiserror::Error;

/// Failures surfaced by the transport, the codec, and the node operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("request canceled")]
    Canceled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("value not found")]
    NotFound,

    #[error("no contacts available")]
    NoContacts,

    #[error("refusing to store an empty value")]
    EmptyValue,
}

pub type Result<T> = std::result::Result<T, Error>;
