use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] natpunch_core::error::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("shutdown")]
    Shutdown,
    #[error("an allocation already exists on this connection")]
    AlreadyAllocated,
}

impl Error {
    /// The failure code a server answers with when a handler fails with `self`.
    pub fn failure_code(&self) -> u16 {
        use natpunch_core::message::error_code;
        match self {
            Error::UnknownUser(_) => error_code::UNKNOWN_USER,
            Error::AlreadyAllocated => error_code::ALLOCATION_MISMATCH,
            Error::Core(natpunch_core::error::Error::InvalidMessage(_))
            | Error::Core(natpunch_core::error::Error::UnexpectedMessage { .. }) => {
                error_code::BAD_REQUEST
            }
            Error::Core(natpunch_core::error::Error::Rejected { code, .. }) => *code,
            _ => error_code::SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
