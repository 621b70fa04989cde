use crate::config::ConfigError;
use crate::protocol::{MalformedFrame, ObjectType, StatusError};
use crate::transport::TransportError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Step of the update a failure happened in
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    Configure,
    SetPrn,
    Select(ObjectType),
    Create(ObjectType),
    Stream(ObjectType),
    Verify(ObjectType),
    Execute(ObjectType),
    Exit,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Configure => write!(f, "configuration"),
            Phase::SetPrn => write!(f, "setting packet receipt notifications"),
            Phase::Select(obj) => write!(f, "selecting {} object", obj),
            Phase::Create(obj) => write!(f, "creating {} object", obj),
            Phase::Stream(obj) => write!(f, "{} transfer", obj),
            Phase::Verify(obj) => write!(f, "verifying {} object", obj),
            Phase::Execute(obj) => write!(f, "executing {} object", obj),
            Phase::Exit => write!(f, "leaving DFU mode"),
        }
    }
}

#[derive(Error, Debug)]
pub enum DfuCause {
    #[error("malformed response: {0}")]
    MalformedFrame(#[from] MalformedFrame),

    #[error("device reported: {0}")]
    Status(#[from] StatusError),

    #[error("device timeout ({timeout:?} without response)")]
    Timeout { timeout: Duration },

    #[error("checksum mismatch: device at offset {offset} crc {crc:#010x}, expected offset {expected_offset} crc {expected_crc:#010x}")]
    ChecksumMismatch {
        offset: u32,
        crc: u32,
        expected_offset: u32,
        expected_crc: u32,
    },

    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    #[error("firmware source: {0}")]
    Firmware(#[from] std::io::Error),

    #[error("device holds a partial object at offset {offset}, resumption is not supported")]
    ResumeNotSupported { offset: u32 },

    #[error("device reported a zero {0} object size")]
    ZeroObjectSize(ObjectType),

    #[error("firmware of {0} bytes does not fit a DFU object")]
    ImageTooLarge(u64),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failure of a DFU session: where it stopped and why.
#[derive(Error, Debug)]
#[error("update failed during {phase}: {cause}")]
pub struct DfuError {
    pub phase: Phase,
    #[source]
    pub cause: DfuCause,
}

impl DfuError {
    pub fn new(phase: Phase, cause: impl Into<DfuCause>) -> Self {
        Self {
            phase,
            cause: cause.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, DfuCause::Timeout { .. })
    }
}

/// Attach a phase to lower level failures
pub(crate) trait PhaseContext<T> {
    fn phase(self, phase: Phase) -> Result<T, DfuError>;
}

impl<T, E: Into<DfuCause>> PhaseContext<T> for Result<T, E> {
    fn phase(self, phase: Phase) -> Result<T, DfuError> {
        self.map_err(|e| DfuError::new(phase, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseError;

    #[test]
    fn test_error_names_phase_and_cause() {
        let err = DfuError::new(
            Phase::Stream(ObjectType::Data),
            DfuCause::Timeout {
                timeout: Duration::from_millis(500),
            },
        );
        assert_eq!(err.to_string(), "update failed during data transfer: device timeout (500ms without response)");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_status_cause() {
        let err = DfuError::new(
            Phase::Create(ObjectType::Command),
            StatusError::Response(ResponseError::InsufficientResources),
        );
        assert_eq!(
            err.to_string(),
            "update failed during creating command object: device reported: not enough memory for the data object"
        );
    }
}
