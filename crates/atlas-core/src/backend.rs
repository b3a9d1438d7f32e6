//! Interfaces to the collaborators the engine relies on but does not own:
//! the face encoder, the roster/attendance/signature stores and the
//! notification channel.

use crate::classify::LateCutoff;
use crate::types::{
    AttendanceEvent, EnrolledSignature, HistoryEntry, NotificationPayload, RegisteredStudent,
    RosterEntry, Signature,
};
use chrono::NaiveDate;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("storage backend: {0}")]
    Backend(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncoderError {
    #[error("encoder failed: {0}")]
    Failed(String),
    #[error("encoder returned malformed output: {0}")]
    Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// Turns an image into zero or more face signatures.
///
/// "No face found" is `Ok(vec![])`, never an error.
pub trait Encoder {
    fn detect(&mut self, image: &[u8]) -> Result<Vec<Signature>, EncoderError>;
}

/// Read access to student and settings records.
pub trait RosterStore: Send + Sync {
    fn lookup(&self, identity_id: &str) -> Result<RosterEntry, StoreError>;

    /// Configured late cutoff, or `None` when no setting exists.
    fn late_cutoff(&self) -> Result<Option<LateCutoff>, StoreError>;

    /// Students with at least one enrolled face, most recently registered first.
    fn registered_students(&self) -> Result<Vec<RegisteredStudent>, StoreError>;
}

pub trait AttendanceStore: Send + Sync {
    fn append_event(&self, event: &AttendanceEvent) -> Result<(), StoreError>;

    /// Events for `date`, most recent first.
    fn query_events(&self, date: NaiveDate) -> Result<Vec<HistoryEntry>, StoreError>;
}

/// Durable storage backing the identity index.
pub trait SignatureStore: Send + Sync {
    /// Every enrolled signature in enrollment order.
    fn load_all(&self) -> Result<Vec<EnrolledSignature>, StoreError>;

    /// Persist one signature. Must be durable when this returns `Ok`.
    fn insert_signature(&self, enrolled: &EnrolledSignature) -> Result<(), StoreError>;

    /// Delete every signature of an identity; returns how many were removed.
    fn delete_identity(&self, identity_id: &str) -> Result<usize, StoreError>;
}

/// Push channel to a parent's device.
pub trait Notifier: Send {
    fn send(&mut self, address: &str, payload: &NotificationPayload) -> Result<(), NotifyError>;
}
