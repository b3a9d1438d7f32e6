//! atlas-core — Attendance decision engine.
//!
//! Matches observed face signatures against an in-memory identity index,
//! suppresses duplicate recordings with a per-identity cooldown, classifies
//! arrivals as on time or late and hands notifications to a background worker.

pub mod backend;
pub mod classify;
pub mod dispatch;
pub mod gate;
pub mod index;
pub mod matcher;
pub mod service;
pub mod types;

pub use backend::{
    AttendanceStore, Encoder, EncoderError, Notifier, NotifyError, RosterStore, SignatureStore,
    StoreError,
};
pub use classify::LateCutoff;
pub use dispatch::NotificationDispatcher;
pub use gate::{Admission, AttendanceGate, GateState};
pub use index::{IdentityIndex, IndexError};
pub use matcher::{EuclideanMatcher, MatchResult, Matcher};
pub use service::{AttendanceError, AttendanceService, Policy, ServiceStatus};
pub use types::{
    AttendanceEvent, AttendanceStatus, CaptureOutcome, CaptureReport, EnrolledSignature,
    HistoryEntry, IdentityRecord, NotificationPayload, OutcomeStatus, RegisteredStudent,
    RosterEntry, Signature,
};
