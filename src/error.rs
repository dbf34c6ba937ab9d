use std::collections::BTreeMap;
use std::fmt;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::graph::report::ConfigureError;

/// Result of a user-supplied callback (queue consumers, toolchain lookups).
pub type CallbackResult<T> = anyhow::Result<T, anyhow::Error>;

#[derive(Debug, Error)]
pub enum ForgeError {
    #[error(transparent)]
    UnknownTarget(#[from] UnknownTargetError),

    #[error("Error while assembling the build graph.\n{0}")]
    Graph(#[from] GraphError),

    #[error("Error while patching the build graph.\n{0}")]
    Patch(#[from] PatchError),

    #[error("Event queue error.\n{0}")]
    Queue(#[from] QueueError),

    #[error("Distributed cache error.\n{0}")]
    Cache(#[from] TransportError),

    #[error("Invalid settings.\n{0}")]
    Settings(#[from] SettingsError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Unknown target '{0}'")]
pub struct UnknownTargetError(pub String);

#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    UnknownTarget(#[from] UnknownTargetError),

    #[error("Configure error (enable continue-on-failure to proceed)\n{0}")]
    Configure(ConfigureFailure),

    #[error("Dependency cycle detected through node '{0}'")]
    Cycle(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Every target that failed to configure, keyed by target path.
#[derive(Debug, Default)]
pub struct ConfigureFailure(pub BTreeMap<String, ConfigureError>);

impl fmt::Display for ConfigureFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (path, error) in &self.0 {
            writeln!(f, "{path}:")?;
            for (message, sub) in error.colored_errors() {
                writeln!(f, "  [[{sub}]] {message}")?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Couldn't read required resource file {path}.\n{source}")]
    Resource {
        path: Utf8PathBuf,
        source: anyhow::Error,
    },

    #[error("Toolchain {version} required by '{target}' not found: {message}")]
    Toolchain {
        version: u32,
        target: String,
        message: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue I/O error.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't lock chunk {path}.\n{source}")]
    Lock {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't serialize event.\n{0}")]
    Encode(serde_json::Error),

    #[error("Chunk {chunk}, line {line}: malformed event.\n{source}")]
    Decode {
        chunk: String,
        line: usize,
        source: serde_json::Error,
    },
}

/// Classification of a failed remote-store call, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// The call did not complete in time.
    Timeout,
    /// The backend could not be reached or answered with a server error.
    Unavailable,
    /// The backend asked the client to slow down.
    Throttled,
    /// The request was refused (auth, quota, malformed request).
    Rejected,
    /// The client has been disabled and made no call at all.
    Disabled,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Unavailable => "unavailable",
            TransportErrorKind::Throttled => "throttled",
            TransportErrorKind::Rejected => "rejected",
            TransportErrorKind::Disabled => "disabled",
            TransportErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(TransportErrorKind::Disabled, "distributed cache is disabled")
    }

    /// Default retryability: transient transport conditions only.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::Timeout
                | TransportErrorKind::Unavailable
                | TransportErrorKind::Throttled
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::TimedOut => TransportErrorKind::Timeout,
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::Interrupted => TransportErrorKind::Unavailable,
            ErrorKind::PermissionDenied => TransportErrorKind::Rejected,
            _ => TransportErrorKind::Other,
        };

        TransportError::new(kind, err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Couldn't read settings file {0}.\n{1}")]
    Io(Utf8PathBuf, std::io::Error),

    #[error("Couldn't parse settings file {0}.\n{1}")]
    Json(Utf8PathBuf, serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_errors_are_classified() {
        let err = TransportError::from(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert_eq!(err.kind, TransportErrorKind::Timeout);
        assert!(err.is_retryable());

        let err = TransportError::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert_eq!(err.kind, TransportErrorKind::Rejected);
        assert!(!err.is_retryable());

        assert!(!TransportError::disabled().is_retryable());
    }
}
