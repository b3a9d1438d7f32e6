use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classify::LateCutoff;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SignatureError {
    #[error("signature is empty")]
    Empty,
    #[error("signature component {index} is not finite")]
    NonFinite { index: usize },
}

/// Face signature produced by the external encoder (typically 128-dimensional).
///
/// Construction validates that the vector is non-empty and every component is
/// finite, so distances between two signatures of equal dimension are always
/// well defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct Signature {
    values: Vec<f32>,
}

impl Signature {
    pub fn new(values: Vec<f32>) -> Result<Self, SignatureError> {
        if values.is_empty() {
            return Err(SignatureError::Empty);
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(SignatureError::NonFinite { index });
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute Euclidean distance between two signatures.
    ///
    /// Callers must compare signatures of equal dimension; extra components
    /// of the longer vector are ignored.
    pub fn euclidean_distance(&self, other: &Signature) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for Signature {
    type Error = SignatureError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<Signature> for Vec<f32> {
    fn from(signature: Signature) -> Self {
        signature.values
    }
}

/// A signature enrolled for an identity, as persisted by the signature store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrolledSignature {
    pub signature_id: String,
    pub identity_id: String,
    /// Enrollment pose (e.g., "front", "left", "right"), if the caller gave one.
    pub pose: Option<String>,
    pub signature: Signature,
    pub enrolled_at: NaiveDateTime,
}

impl EnrolledSignature {
    /// Wrap a freshly detected signature with a new random ID.
    pub fn new(
        identity_id: &str,
        pose: Option<&str>,
        signature: Signature,
        enrolled_at: NaiveDateTime,
    ) -> Self {
        Self {
            signature_id: uuid::Uuid::new_v4().to_string(),
            identity_id: identity_id.to_string(),
            pose: pose.map(str::to_string),
            signature,
            enrolled_at,
        }
    }
}

/// All signatures enrolled for one identity, in enrollment order.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityRecord {
    pub identity_id: String,
    pub signatures: Vec<EnrolledSignature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    OnTime,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnTime => "on_time",
            Self::Late => "late",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on_time" => Some(Self::OnTime),
            "late" => Some(Self::Late),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttendanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OnTime => f.write_str("on time"),
            Self::Late => f.write_str("late"),
        }
    }
}

/// One accepted attendance recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub identity_id: String,
    pub date: NaiveDate,
    /// Time of day truncated to whole seconds.
    pub time: NaiveTime,
    pub status: AttendanceStatus,
}

impl AttendanceEvent {
    /// Build the event for a recording at `now`, classified against `cutoff`.
    pub fn at(identity_id: &str, now: NaiveDateTime, cutoff: &LateCutoff) -> Self {
        Self {
            identity_id: identity_id.to_string(),
            date: now.date(),
            time: truncate_to_seconds(now.time()),
            status: cutoff.classify(now),
        }
    }

    pub fn time_string(&self) -> String {
        format_time(self.time)
    }
}

/// Roster data the engine needs about an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub identity_id: String,
    pub display_name: String,
    /// Push address of the parent's device, if one is registered.
    pub notification_address: Option<String>,
}

/// A roster entry that has at least one enrolled face.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredStudent {
    pub identity_id: String,
    pub display_name: String,
    pub face_registered_at: NaiveDateTime,
}

/// An event joined with the student's display name, for history listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub identity_id: String,
    pub display_name: Option<String>,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: AttendanceStatus,
}

/// Notification sent to a parent when attendance is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub display_name: String,
    pub time: String,
    pub status: AttendanceStatus,
}

impl NotificationPayload {
    pub fn title(&self) -> &'static str {
        "ATLAS attendance report"
    }

    pub fn body(&self) -> String {
        format!(
            "{} was recorded {} at {}.",
            self.display_name, self.status, self.time
        )
    }
}

/// Per-signature result of processing a capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// A new attendance event was stored.
    Recorded,
    /// Matched, but the identity is still cooling down.
    Ignored,
    /// No enrolled identity within tolerance.
    Unknown,
    /// Matched and admitted, but the event could not be stored.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureOutcome {
    /// `None` when the face did not resolve; serialized as `"Unknown"`.
    #[serde(with = "unknown_identity")]
    pub identity_id: Option<String>,
    pub display_name: String,
    pub status: OutcomeStatus,
    pub attendance: Option<AttendanceStatus>,
    pub timestamp: String,
}

/// Result of processing one capture: every detected face, and the ones recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureReport {
    pub all_detected: Vec<CaptureOutcome>,
    pub new_entries: Vec<CaptureOutcome>,
}

impl CaptureReport {
    pub fn from_outcomes(all_detected: Vec<CaptureOutcome>) -> Self {
        let new_entries = all_detected
            .iter()
            .filter(|o| o.status == OutcomeStatus::Recorded)
            .cloned()
            .collect();
        Self {
            all_detected,
            new_entries,
        }
    }
}

pub(crate) fn truncate_to_seconds(time: NaiveTime) -> NaiveTime {
    time.with_nanosecond(0).unwrap_or(time)
}

/// Render a time of day as zero-padded `HH:MM:SS`.
pub fn format_time(time: NaiveTime) -> String {
    time.format("%H:%M:%S").to_string()
}

mod unknown_identity {
    use serde::{Deserialize, Deserializer, Serializer};

    const UNKNOWN: &str = "Unknown";

    pub fn serialize<S: Serializer>(id: &Option<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(id.as_deref().unwrap_or(UNKNOWN))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        let s = String::deserialize(d)?;
        Ok(if s == UNKNOWN { None } else { Some(s) })
    }
}
