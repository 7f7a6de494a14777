use std::io;

use thiserror::Error;

use crate::message::{MessageClass, Method};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The caller broke a usage contract, e.g. starting a listener after shutdown.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    #[error("cancelled")]
    Cancelled,
    #[error("timed out")]
    Timeout,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("unexpected message {method:?} {class:?}")]
    UnexpectedMessage { method: Method, class: MessageClass },
    #[error("rejected with {code}: {reason}")]
    Rejected { code: u16, reason: String },
}

impl Error {
    /// Transient faults are retried by the race participants until their deadline.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Timeout | Error::Rejected { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
