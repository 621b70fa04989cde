//! Progress and error reporting for frontends.

use crate::error::Phase;
use crate::protocol::{ObjectType, StatusError};
use crate::transfer::TransferState;

/// Events emitted while a session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DfuEvent {
    StateChanged { from: TransferState, to: TransferState },
    /// Bytes of `object` written so far, out of `total`
    Progress { object: ObjectType, sent: u64, total: u64 },
    /// An object was verified and executed on the target
    ObjectCommitted { object: ObjectType, offset: u32, crc32: u32 },
    /// A request timed out and is attempted again
    RequestRetry { phase: Phase, attempt: u32, of: u32 },
    /// Non-success status decoded from a response
    DeviceError { phase: Phase, status: StatusError },
    /// The session aborted; `message` carries the full cause
    Failed { phase: Phase, message: String },
    Completed,
}

/// Receives [`DfuEvent`]s; implemented for any `Fn(&DfuEvent)`.
pub trait DfuObserver: Send + Sync {
    fn on_event(&self, event: &DfuEvent);
}

impl<F: Fn(&DfuEvent) + Send + Sync> DfuObserver for F {
    fn on_event(&self, event: &DfuEvent) {
        self(event)
    }
}

/// Discards all events
pub struct NullObserver;

impl DfuObserver for NullObserver {
    fn on_event(&self, _event: &DfuEvent) {}
}
