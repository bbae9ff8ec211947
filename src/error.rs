//! Error taxonomy.
//!
//! Every terminal failure maps one-to-one onto a process exit code, which is
//! part of the external interface (netifd and the hotplug scripts dispatch on
//! it). Variants carry the human-readable message that is persisted to
//! `udiald_error_msg` in the config store.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    InvalidArg(String),
    #[error("{0}")]
    Internal(String),
    #[error("{0}")]
    Signaled(String),
    #[error("{0}")]
    NoModem(String),
    #[error("{0}")]
    Modem(String),
    #[error("{0}")]
    Sim(String),
    #[error("{0}")]
    Unlock(String),
    #[error("{0}")]
    Dial(String),
    #[error("{0}")]
    Auth(String),
    #[error("{0}")]
    Ppp(String),
    #[error("{0}")]
    Network(String),
}

impl Error {
    /// Process exit code for this error kind.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::InvalidArg(_) => 1,
            Error::Internal(_) => 2,
            Error::Signaled(_) => 3,
            Error::NoModem(_) => 4,
            Error::Modem(_) => 5,
            Error::Sim(_) => 6,
            Error::Unlock(_) => 7,
            Error::Dial(_) => 8,
            Error::Auth(_) => 9,
            Error::Ppp(_) => 10,
            Error::Network(_) => 11,
        }
    }

    pub fn is_signaled(&self) -> bool {
        matches!(self, Error::Signaled(_))
    }
}
