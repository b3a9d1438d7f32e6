//! Attendance service: enrollment, removal and capture processing over the
//! identity index, match policy, attendance gate and classification.
//!
//! Locking:
//! - the identity index sits behind an `RwLock`; matching takes read locks only,
//!   and no store or notifier call ever runs while the index lock is held;
//! - enroll/remove are serialized by a single mutation lock;
//! - every operation touching one identity (enroll, remove, admit-then-record)
//!   runs under that identity's keyed lock.

use crate::backend::{AttendanceStore, RosterStore, SignatureStore, StoreError};
use crate::classify::LateCutoff;
use crate::dispatch::NotificationDispatcher;
use crate::gate::{Admission, AttendanceGate, DEFAULT_COOLDOWN_MINUTES};
use crate::index::{IdentityIndex, IndexError};
use crate::matcher::{EuclideanMatcher, Matcher, DEFAULT_TOLERANCE};
use crate::types::{
    format_time, truncate_to_seconds, AttendanceEvent, AttendanceStatus, CaptureOutcome,
    CaptureReport, EnrolledSignature, HistoryEntry, NotificationPayload, OutcomeStatus,
    RegisteredStudent, RosterEntry, Signature,
};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

pub const DEFAULT_MAX_SIGNATURES_PER_IDENTITY: usize = 16;

const UNKNOWN_NAME: &str = "Unknown";

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("expected exactly one face, detected {0}")]
    AmbiguousCapture(usize),
    #[error("identity {identity_id} already has {limit} enrolled signatures")]
    SignatureLimit { identity_id: String, limit: usize },
    #[error("index: {0}")]
    Index(#[from] IndexError),
    #[error("persistence failure: {0}")]
    Persistence(StoreError),
    #[error("store: {0}")]
    Store(StoreError),
}

/// Tunables for matching, cooldown and enrollment.
#[derive(Debug, Clone)]
pub struct Policy {
    /// Maximum Euclidean distance for a match.
    pub tolerance: f32,
    pub cooldown: Duration,
    /// Enrollment is refused once an identity holds this many signatures.
    pub max_signatures_per_identity: usize,
    /// Late cutoff used when the settings source has none or is unreadable.
    pub default_cutoff: LateCutoff,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            cooldown: Duration::minutes(DEFAULT_COOLDOWN_MINUTES),
            max_signatures_per_identity: DEFAULT_MAX_SIGNATURES_PER_IDENTITY,
            default_cutoff: LateCutoff::default(),
        }
    }
}

/// Snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub identities: usize,
    pub signatures: usize,
    pub tolerance: f32,
    pub cooldown_minutes: i64,
    pub cooling_identities: usize,
}

/// One mutex per key, created on demand and dropped once nobody holds or waits on it.
#[derive(Default)]
struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    fn with<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(map.entry(key.to_string()).or_default())
        };
        let result = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };

        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // The map and this call are the only owners left.
        if Arc::strong_count(&lock) == 2 {
            map.remove(key);
        }
        result
    }
}

pub struct AttendanceService {
    policy: Policy,
    index: RwLock<IdentityIndex>,
    gate: AttendanceGate,
    matcher: Box<dyn Matcher + Send + Sync>,
    identity_locks: KeyedLocks,
    mutation: Mutex<()>,
    signatures: Arc<dyn SignatureStore>,
    roster: Arc<dyn RosterStore>,
    events: Arc<dyn AttendanceStore>,
    notifications: Option<NotificationDispatcher>,
}

impl AttendanceService {
    /// Build the service, loading every persisted signature into the index.
    pub fn open(
        policy: Policy,
        signatures: Arc<dyn SignatureStore>,
        roster: Arc<dyn RosterStore>,
        events: Arc<dyn AttendanceStore>,
        notifications: Option<NotificationDispatcher>,
    ) -> Result<Self, AttendanceError> {
        let enrolled = signatures.load_all().map_err(AttendanceError::Store)?;
        let index = IdentityIndex::from_enrolled(enrolled)?;
        tracing::info!(
            identities = index.len(),
            signatures = index.signature_count(),
            "identity index loaded"
        );

        Ok(Self {
            gate: AttendanceGate::new(policy.cooldown),
            policy,
            index: RwLock::new(index),
            matcher: Box::new(EuclideanMatcher),
            identity_locks: KeyedLocks::default(),
            mutation: Mutex::new(()),
            signatures,
            roster,
            events,
            notifications,
        })
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, IdentityIndex> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_index(&self) -> std::sync::RwLockWriteGuard<'_, IdentityIndex> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Enroll the single face detected in an enrollment photo.
    ///
    /// Nothing is added to the in-memory index until the signature store has
    /// durably accepted the signature.
    pub fn enroll(
        &self,
        identity_id: &str,
        pose: Option<&str>,
        detected: Vec<Signature>,
        now: NaiveDateTime,
    ) -> Result<EnrolledSignature, AttendanceError> {
        let signature = match detected.len() {
            0 => return Err(AttendanceError::NoFaceDetected),
            1 => detected.into_iter().next().ok_or(AttendanceError::NoFaceDetected)?,
            n => return Err(AttendanceError::AmbiguousCapture(n)),
        };

        let _mutation = self.mutation.lock().unwrap_or_else(|e| e.into_inner());
        match self.roster.lookup(identity_id) {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => {
                return Err(AttendanceError::NotFound(identity_id.to_string()))
            }
            Err(e) => return Err(AttendanceError::Store(e)),
        }

        self.identity_locks.with(identity_id, || {
            {
                let index = self.read_index();
                index.check_dimension(&signature)?;
                let limit = self.policy.max_signatures_per_identity;
                if index.signature_count_for(identity_id) >= limit {
                    return Err(AttendanceError::SignatureLimit {
                        identity_id: identity_id.to_string(),
                        limit,
                    });
                }
            }

            let enrolled = EnrolledSignature::new(identity_id, pose, signature, now);
            self.signatures
                .insert_signature(&enrolled)
                .map_err(AttendanceError::Persistence)?;

            self.write_index().enroll(enrolled.clone())?;
            tracing::info!(
                identity_id,
                pose = pose.unwrap_or("-"),
                signature_id = %enrolled.signature_id,
                "signature enrolled"
            );
            Ok(enrolled)
        })
    }

    /// Remove an identity and all of its signatures. Returns how many were removed.
    pub fn remove(&self, identity_id: &str) -> Result<usize, AttendanceError> {
        let _mutation = self.mutation.lock().unwrap_or_else(|e| e.into_inner());
        if !self.read_index().contains(identity_id) {
            return Err(AttendanceError::NotFound(identity_id.to_string()));
        }

        self.identity_locks.with(identity_id, || {
            self.signatures
                .delete_identity(identity_id)
                .map_err(AttendanceError::Persistence)?;

            let record = self.write_index().remove(identity_id)?;
            tracing::info!(
                identity_id,
                signatures = record.signatures.len(),
                "identity removed"
            );
            Ok(record.signatures.len())
        })
    }

    /// Resolve, gate, classify and record every face detected in one capture.
    ///
    /// Faces are handled independently: a store failure on one face marks
    /// that face `failed` and the rest of the batch still runs.
    pub fn process_capture(&self, detected: &[Signature], now: NaiveDateTime) -> CaptureReport {
        let outcomes = detected
            .iter()
            .map(|signature| self.process_one(signature, now))
            .collect();
        CaptureReport::from_outcomes(outcomes)
    }

    fn process_one(&self, observed: &Signature, now: NaiveDateTime) -> CaptureOutcome {
        let resolved = {
            let index = self.read_index();
            self.matcher.resolve(observed, &index, self.policy.tolerance)
        };
        match resolved {
            Some(matched) => self.record_match(matched.identity_id, now),
            None => unknown_outcome(now),
        }
    }

    /// Gate and record a resolved identity under its keyed lock.
    ///
    /// The index read lock is released between resolving and locking, so
    /// enrollment is checked again: an identity removed in between is
    /// reported unknown and nothing is recorded.
    fn record_match(&self, identity_id: String, now: NaiveDateTime) -> CaptureOutcome {
        let roster = self.lookup_roster(&identity_id);
        let display_name = roster
            .as_ref()
            .map_or_else(|| identity_id.clone(), |r| r.display_name.clone());

        let recorded = self.identity_locks.with(&identity_id, || {
            if !self.read_index().contains(&identity_id) {
                return None;
            }
            Some(self.admit_and_record(&identity_id, roster.as_ref(), &display_name, now))
        });
        let Some((status, attendance)) = recorded else {
            tracing::debug!(identity_id = %identity_id, "identity removed during capture");
            return unknown_outcome(now);
        };

        CaptureOutcome {
            identity_id: Some(identity_id),
            display_name,
            status,
            attendance,
            timestamp: format_time(truncate_to_seconds(now.time())),
        }
    }

    fn admit_and_record(
        &self,
        identity_id: &str,
        roster: Option<&RosterEntry>,
        display_name: &str,
        now: NaiveDateTime,
    ) -> (OutcomeStatus, Option<AttendanceStatus>) {
        let ticket = match self.gate.try_admit(identity_id, now) {
            Admission::Admitted(ticket) => ticket,
            Admission::Suppressed { remaining } => {
                tracing::debug!(
                    identity_id,
                    remaining_secs = remaining.num_seconds(),
                    "still cooling down; ignored"
                );
                return (OutcomeStatus::Ignored, None);
            }
        };

        let cutoff = self.current_cutoff();
        let event = AttendanceEvent::at(identity_id, now, &cutoff);

        if let Err(e) = self.events.append_event(&event) {
            tracing::error!(identity_id, error = %e, "failed to store attendance event");
            self.gate.rollback(ticket);
            return (OutcomeStatus::Failed, None);
        }

        tracing::info!(
            identity_id,
            status = %event.status,
            time = %event.time_string(),
            cutoff = %cutoff,
            "attendance recorded"
        );

        if let (Some(dispatcher), Some(address)) = (
            &self.notifications,
            roster.and_then(|r| r.notification_address.as_deref()),
        ) {
            dispatcher.dispatch(
                address,
                NotificationPayload {
                    display_name: display_name.to_string(),
                    time: event.time_string(),
                    status: event.status,
                },
            );
        }

        (OutcomeStatus::Recorded, Some(event.status))
    }

    fn lookup_roster(&self, identity_id: &str) -> Option<RosterEntry> {
        match self.roster.lookup(identity_id) {
            Ok(entry) => Some(entry),
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(identity_id, "matched identity has no roster entry");
                None
            }
            Err(e) => {
                tracing::warn!(identity_id, error = %e, "roster lookup failed; using identity id");
                None
            }
        }
    }

    /// Late cutoff read fresh from settings, falling back to the policy default.
    fn current_cutoff(&self) -> LateCutoff {
        match self.roster.late_cutoff() {
            Ok(Some(cutoff)) => cutoff,
            Ok(None) => self.policy.default_cutoff,
            Err(e) => {
                tracing::warn!(error = %e, "late cutoff unavailable; using default");
                self.policy.default_cutoff
            }
        }
    }

    /// Attendance for `date`, most recent first.
    pub fn history(&self, date: NaiveDate) -> Result<Vec<HistoryEntry>, AttendanceError> {
        self.events.query_events(date).map_err(AttendanceError::Store)
    }

    /// Enrolled identity IDs in enrollment order.
    pub fn identities(&self) -> Vec<String> {
        self.read_index().identities()
    }

    pub fn registered_students(&self) -> Result<Vec<RegisteredStudent>, AttendanceError> {
        self.roster
            .registered_students()
            .map_err(AttendanceError::Store)
    }

    pub fn status(&self) -> ServiceStatus {
        let index = self.read_index();
        ServiceStatus {
            identities: index.len(),
            signatures: index.signature_count(),
            tolerance: self.policy.tolerance,
            cooldown_minutes: self.policy.cooldown.num_minutes(),
            cooling_identities: self.gate.tracked(),
        }
    }
}

fn unknown_outcome(now: NaiveDateTime) -> CaptureOutcome {
    CaptureOutcome {
        identity_id: None,
        display_name: UNKNOWN_NAME.to_string(),
        status: OutcomeStatus::Unknown,
        attendance: None,
        timestamp: format_time(truncate_to_seconds(now.time())),
    }
}
