use std::sync::Arc;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown signal name: {0:?}")]
    UnknownSignal(String),

    #[error("Unable to watch signal {signal}: {source}")]
    Register {
        signal: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stack capture degraded: {0}")]
    Stacks(String),

    #[error("Memory counters degraded: {0}")]
    MemStats(String),

    #[error("Dump aborted by panic: {0}")]
    Panicked(String),

    #[error("Unable to write dump to {target}: {source}")]
    Sink {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failure classes of the dump pipeline. None of them ever reaches the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The watcher could not be armed and stays inert.
    Configuration,
    /// A snapshot was produced with missing stacks or counters.
    CaptureDegradation,
    /// The report for one dump was dropped.
    Sink,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownSignal(_) | Error::Register { .. } => ErrorKind::Configuration,
            Error::Stacks(_) | Error::MemStats(_) | Error::Panicked(_) => {
                ErrorKind::CaptureDegradation
            }
            Error::Sink { .. } => ErrorKind::Sink,
        }
    }
}

/// Observer for errors the pipeline absorbs.
pub type DiagnosticHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Hook used when the host does not install one: everything goes to `log`.
pub fn log_hook() -> DiagnosticHook {
    Arc::new(|err: &Error| match err.kind() {
        ErrorKind::CaptureDegradation => log::debug!("sigdump: {err}"),
        _ => log::warn!("sigdump: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            Error::UnknownSignal("SIGNOPE".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            Error::Stacks("thread 12 did not respond".into()).kind(),
            ErrorKind::CaptureDegradation
        );
        let err = Error::Sink {
            target: "/nonexistent/x.log".into(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert_eq!(err.kind(), ErrorKind::Sink);
        assert!(err.to_string().contains("/nonexistent/x.log"));
    }
}
