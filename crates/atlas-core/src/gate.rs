//! Attendance gate: per-identity cooldown that suppresses duplicate recordings.
//!
//! State per identity is derived lazily from the last recording stamp:
//! no stamp is `NeverRecorded`, a stamp younger than the cooldown window is
//! `Cooling`, anything older is `Eligible`. The check and the stamp happen
//! under one lock, so concurrent captures of the same face admit at most one.

use chrono::{Duration, NaiveDateTime};
use std::collections::HashMap;
use std::sync::Mutex;

pub const DEFAULT_COOLDOWN_MINUTES: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    NeverRecorded,
    Cooling { remaining: Duration },
    Eligible,
}

/// Proof of admission, needed to undo the stamp if the event cannot be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmitTicket {
    identity_id: String,
    stamped_at: NaiveDateTime,
    previous: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted(AdmitTicket),
    Suppressed { remaining: Duration },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted(_))
    }
}

/// Owner of the cooldown state (identity → last recorded time).
pub struct AttendanceGate {
    cooldown: Duration,
    last_recorded: Mutex<HashMap<String, NaiveDateTime>>,
}

impl AttendanceGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_recorded: Mutex::new(HashMap::new()),
        }
    }

    fn evaluate(&self, last: Option<&NaiveDateTime>, now: NaiveDateTime) -> GateState {
        match last {
            None => GateState::NeverRecorded,
            Some(&last) => {
                let elapsed = now - last;
                if elapsed >= self.cooldown {
                    GateState::Eligible
                } else {
                    GateState::Cooling {
                        remaining: self.cooldown - elapsed,
                    }
                }
            }
        }
    }

    /// Current state of `identity_id` as seen at `now`. Read-only.
    pub fn state(&self, identity_id: &str, now: NaiveDateTime) -> GateState {
        let map = self.last_recorded.lock().unwrap_or_else(|e| e.into_inner());
        self.evaluate(map.get(identity_id), now)
    }

    /// Admit `identity_id` at `now` and stamp it, or suppress it while cooling.
    pub fn try_admit(&self, identity_id: &str, now: NaiveDateTime) -> Admission {
        let mut map = self.last_recorded.lock().unwrap_or_else(|e| e.into_inner());
        match self.evaluate(map.get(identity_id), now) {
            GateState::Cooling { remaining } => Admission::Suppressed { remaining },
            GateState::NeverRecorded | GateState::Eligible => {
                let previous = map.insert(identity_id.to_string(), now);
                Admission::Admitted(AdmitTicket {
                    identity_id: identity_id.to_string(),
                    stamped_at: now,
                    previous,
                })
            }
        }
    }

    /// Undo an admission whose event was never stored.
    ///
    /// Only restores the previous stamp if the ticket's stamp is still current.
    pub fn rollback(&self, ticket: AdmitTicket) {
        let mut map = self.last_recorded.lock().unwrap_or_else(|e| e.into_inner());
        if map.get(&ticket.identity_id) != Some(&ticket.stamped_at) {
            return;
        }
        match ticket.previous {
            Some(previous) => {
                map.insert(ticket.identity_id, previous);
            }
            None => {
                map.remove(&ticket.identity_id);
            }
        }
    }

    /// Number of identities with a stamp.
    pub fn tracked(&self) -> usize {
        self.last_recorded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for AttendanceGate {
    fn default() -> Self {
        Self::new(Duration::minutes(DEFAULT_COOLDOWN_MINUTES))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::{Arc, Barrier};

    fn t0() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 9, 2)
            .unwrap()
            .and_hms_opt(6, 45, 0)
            .unwrap()
    }

    #[test]
    fn test_first_recording_always_admitted() {
        let gate = AttendanceGate::default();
        let far_past = NaiveDate::from_ymd_opt(1970, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(gate.state("1001", far_past), GateState::NeverRecorded);
        assert!(gate.try_admit("1001", far_past).is_admitted());
        assert!(gate.try_admit("1002", t0()).is_admitted());
    }

    #[test]
    fn test_suppressed_one_second_before_cooldown() {
        let gate = AttendanceGate::default();
        assert!(gate.try_admit("1001", t0()).is_admitted());

        let now = t0() + Duration::minutes(60) - Duration::seconds(1);
        assert_eq!(
            gate.try_admit("1001", now),
            Admission::Suppressed {
                remaining: Duration::seconds(1)
            }
        );
    }

    #[test]
    fn test_admitted_one_second_after_cooldown() {
        let gate = AttendanceGate::default();
        assert!(gate.try_admit("1001", t0()).is_admitted());

        let now = t0() + Duration::minutes(60) + Duration::seconds(1);
        assert!(gate.try_admit("1001", now).is_admitted());
    }

    #[test]
    fn test_exact_cooldown_is_eligible() {
        let gate = AttendanceGate::default();
        assert!(gate.try_admit("1001", t0()).is_admitted());
        let now = t0() + Duration::minutes(60);
        assert_eq!(gate.state("1001", now), GateState::Eligible);
        assert!(gate.try_admit("1001", now).is_admitted());
    }

    #[test]
    fn test_suppression_does_not_restamp() {
        let gate = AttendanceGate::default();
        assert!(gate.try_admit("1001", t0()).is_admitted());
        assert!(!gate
            .try_admit("1001", t0() + Duration::minutes(30))
            .is_admitted());
        // Cooldown still measured from the first recording.
        assert!(gate
            .try_admit("1001", t0() + Duration::minutes(60))
            .is_admitted());
    }

    #[test]
    fn test_identities_are_independent() {
        let gate = AttendanceGate::default();
        assert!(gate.try_admit("1001", t0()).is_admitted());
        assert!(gate.try_admit("1002", t0()).is_admitted());
        assert_eq!(gate.tracked(), 2);
    }

    #[test]
    fn test_rollback_first_recording() {
        let gate = AttendanceGate::default();
        let Admission::Admitted(ticket) = gate.try_admit("1001", t0()) else {
            panic!("expected admission");
        };
        gate.rollback(ticket);
        assert_eq!(gate.state("1001", t0()), GateState::NeverRecorded);
        assert!(gate.try_admit("1001", t0()).is_admitted());
    }

    #[test]
    fn test_rollback_restores_previous_stamp() {
        let gate = AttendanceGate::default();
        assert!(gate.try_admit("1001", t0()).is_admitted());

        let later = t0() + Duration::minutes(90);
        let Admission::Admitted(ticket) = gate.try_admit("1001", later) else {
            panic!("expected admission");
        };
        gate.rollback(ticket);

        // Back to cooling from t0, which has already expired at `later`.
        assert_eq!(gate.state("1001", later), GateState::Eligible);
        assert_eq!(
            gate.state("1001", t0() + Duration::minutes(10)),
            GateState::Cooling {
                remaining: Duration::minutes(50)
            }
        );
    }

    #[test]
    fn test_stale_rollback_is_ignored() {
        let gate = AttendanceGate::new(Duration::minutes(1));
        let Admission::Admitted(stale) = gate.try_admit("1001", t0()) else {
            panic!("expected admission");
        };
        let later = t0() + Duration::minutes(5);
        assert!(gate.try_admit("1001", later).is_admitted());

        gate.rollback(stale);
        assert!(matches!(gate.state("1001", later), GateState::Cooling { .. }));
    }

    #[test]
    fn test_concurrent_admission_admits_once() {
        let gate = Arc::new(AttendanceGate::default());
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    gate.try_admit("1001", t0()).is_admitted()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert_eq!(admitted, 1);
    }
}
