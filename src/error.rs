use std::time::Duration;

/// Failure reported by a single call into the instrument backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{call} failed (code {code}): {message}")]
pub struct InstrumentError {
    pub call: &'static str,
    pub code: i32,
    pub message: String,
}

impl InstrumentError {
    pub fn new(call: &'static str, code: i32, message: impl Into<String>) -> Self {
        Self {
            call,
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AcqError {
    #[error("no instrument found")]
    DeviceNotFound,

    #[error("instrument could not be opened: {0}")]
    DeviceOpenFailed(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("arm failed: {0}")]
    ArmFailed(InstrumentError),

    #[error("acquisition timed out after {0:?}")]
    AcquisitionTimeout(Duration),

    #[error("read failed: {0}")]
    ReadFailed(InstrumentError),

    #[error("session is not open")]
    SessionNotOpen,

    #[error("a capture is already in flight on this session")]
    CaptureInFlight,

    #[error("acquisition loop is already running")]
    AlreadyRunning,

    #[error("acquisition worker panicked")]
    WorkerPanicked,

    #[error("native library unavailable: {0}")]
    LibraryUnavailable(String),

    #[error(transparent)]
    Instrument(#[from] InstrumentError),
}

impl AcqError {
    /// Errors that end a cycle but leave the session usable for the next one.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            AcqError::SessionNotOpen | AcqError::WorkerPanicked | AcqError::LibraryUnavailable(_)
        )
    }
}
