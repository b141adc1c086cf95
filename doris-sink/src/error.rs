use std::fmt;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Non-retryable load failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    Authentication,
    SchemaMismatch,
    MalformedRequest,
}

impl fmt::Display for FatalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalKind::Authentication => write!(f, "authentication"),
            FatalKind::SchemaMismatch => write!(f, "schema mismatch"),
            FatalKind::MalformedRequest => write!(f, "malformed request"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Serialization Error - {0}")]
    Serialization(String),

    #[error("Transient Load Error - {0}")]
    TransientLoad(String),

    #[error("Fatal Load Error ({kind}) - {message}")]
    FatalLoad { kind: FatalKind, message: String },

    #[error("Retry Exhausted after {attempts} attempts - {last}")]
    RetryExhausted { attempts: usize, last: Box<Error> },

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Shutdown Error - in-flight load {0} did not finish within the grace period")]
    ShutdownTimeout(String),

    #[error("Sink is closed")]
    Closed,

    #[error("Load Task Error - {0}")]
    LoadTask(String),

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),
}

impl Error {
    /// Only transient load errors are worth another attempt with the same label.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientLoad(_))
    }

    pub(crate) fn fatal(kind: FatalKind, message: impl Into<String>) -> Self {
        Error::FatalLoad {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_builder() {
            return Error::fatal(FatalKind::MalformedRequest, e.to_string());
        }
        // connect, timeout, body and decode failures may all succeed on the next attempt
        Error::TransientLoad(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(Error::TransientLoad("timeout".into()).is_retryable());
        assert!(!Error::fatal(FatalKind::SchemaMismatch, "bad column").is_retryable());
        assert!(!Error::Serialization("arity".into()).is_retryable());
        assert!(
            !Error::RetryExhausted {
                attempts: 4,
                last: Box::new(Error::TransientLoad("503".into()))
            }
            .is_retryable()
        );
    }

    #[test]
    fn exhausted_message_wraps_last_error() {
        let err = Error::RetryExhausted {
            attempts: 2,
            last: Box::new(Error::TransientLoad("connection refused".into())),
        };
        assert_eq!(
            err.to_string(),
            "Retry Exhausted after 2 attempts - Transient Load Error - connection refused"
        );
    }
}
