use thiserror::Error;

/// Errors surfaced by the internals of the connection manager.
///
/// Public API methods mostly collapse this into a simpler `bool`/`Option` surface
/// (per the manager façade's contract) but every fallible internal call returns this type so
/// that the dispatcher and façade can log the real cause before doing so.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{call} failed: {detail}")]
    Winsock {
        call: &'static str,
        detail: windows::core::Error,
    },

    #[error("invalid options: {0}")]
    InvalidOptions(String),

    #[error("registry access failed: {0}")]
    Registry(windows::core::Error),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn winsock(call: &'static str, detail: windows::core::Error) -> Self {
        Self::Winsock { call, detail }
    }

    /// The raw Winsock error code, if this error wraps one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Winsock { detail, .. } => Some(detail.code().0),
            Error::Registry(detail) => Some(detail.code().0),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
