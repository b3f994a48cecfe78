use thiserror::Error;

/// Failures that can occur while capturing a single thread.
///
/// None of these escape the public facade: each one is contained to the
/// thread it concerns and rendered as an omission or a marker in the report.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("thread enumeration unavailable: {0}")]
    EnumerationUnavailable(String),

    #[error("thread {tid} is gone")]
    ThreadGone { tid: i32 },

    #[error("failed to suspend thread {tid}: {reason}")]
    SuspendFailed { tid: i32, reason: String },

    #[error("invalid frame pointer 0x{fp:016x}")]
    InvalidFrame { fp: u64 },

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CaptureError>;
