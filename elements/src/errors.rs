// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use canonical_error::{CanonicalError, CanonicalErrorCode};
use thiserror::Error;

// Failure reported by a camera or mount implementation.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DeviceError {
    #[error("device not connected")]
    NotConnected,

    #[error("device operation timed out")]
    Timeout,

    #[error("device rejected request: {0}")]
    Rejected(String),

    #[error("device hardware fault: {0}")]
    HardwareFault(String),
}

impl DeviceError {
    // Transient errors are worth retrying locally; everything else ends the
    // session.
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Timeout)
    }
}

// Device adapters that are built on cedar's canonical error codes convert at
// the trait boundary.
impl From<CanonicalError> for DeviceError {
    fn from(e: CanonicalError) -> Self {
        match e.code {
            CanonicalErrorCode::DeadlineExceeded => DeviceError::Timeout,
            CanonicalErrorCode::FailedPrecondition => DeviceError::NotConnected,
            CanonicalErrorCode::InvalidArgument
            | CanonicalErrorCode::OutOfRange
            | CanonicalErrorCode::Unimplemented
            | CanonicalErrorCode::PermissionDenied => {
                DeviceError::Rejected(e.message)
            }
            _ => DeviceError::HardwareFault(e.message),
        }
    }
}

// Why a plate solve attempt did not yield a position.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SolveError {
    #[error("no match found")]
    NoMatch,

    #[error("solve timed out")]
    Timeout,

    #[error("malformed solver result: {0}")]
    MalformedResult(String),

    #[error("solver unavailable: {0}")]
    Unavailable(String),
}

impl From<CanonicalError> for SolveError {
    fn from(e: CanonicalError) -> Self {
        match e.code {
            CanonicalErrorCode::NotFound => SolveError::NoMatch,
            CanonicalErrorCode::DeadlineExceeded => SolveError::Timeout,
            CanonicalErrorCode::DataLoss | CanonicalErrorCode::Internal => {
                SolveError::MalformedResult(e.message)
            }
            _ => SolveError::Unavailable(e.message),
        }
    }
}

// Invalid coordinate input to a transform.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DomainError {
    #[error("declination {0} outside -90..90 degrees")]
    Declination(f64),

    #[error("altitude {0} outside -90..90 degrees")]
    Altitude(f64),

    #[error("latitude {0} outside -90..90 degrees")]
    Latitude(f64),

    #[error("non-finite {0} value")]
    NotFinite(&'static str),
}

// Which step of the correction loop a device error came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Configure,
    Capture,
    Readback,
    Slew,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Connect => "connect",
            Stage::Configure => "configure",
            Stage::Capture => "capture",
            Stage::Readback => "position readback",
            Stage::Slew => "slew",
        };
        f.write_str(name)
    }
}

// Terminal reason for an aborted correction session.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("plate solving failed too many times in a row")]
    SolveExhausted,

    #[error("did not converge within the iteration limit")]
    IterationExhausted,

    #[error("session cancelled")]
    Cancelled,

    #[error("{stage} failed: {error}")]
    Device { stage: Stage, error: DeviceError },

    #[error("coordinate error: {0}")]
    Domain(#[from] DomainError),

    // A device or solver implementation panicked inside the loop.
    #[error("internal fault: {0}")]
    Panicked(String),
}
