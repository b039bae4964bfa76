//! Twice-daily attendance ledger.
//!
//! Every (identity, local calendar day) pair moves through
//! `NoRecord → PunchedIn → PunchedOut`; the last state is terminal for the
//! day. [`DayRecord::apply`] is the single transition function. Storage
//! backends call it inside whatever makes their read-modify-write atomic
//! (a mutex here, an immediate SQLite transaction in the CLI store).
//!
//! The ledger has no cooldown of its own: two marks in quick succession
//! produce `PUNCH_IN` then `PUNCH_OUT`. Debouncing repeated recognitions is
//! the capture loop's job.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Event emitted by a mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttendanceEvent {
    PunchIn,
    PunchOut,
    DoneForDay,
}

impl AttendanceEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceEvent::PunchIn => "PUNCH_IN",
            AttendanceEvent::PunchOut => "PUNCH_OUT",
            AttendanceEvent::DoneForDay => "DONE_FOR_DAY",
        }
    }
}

impl fmt::Display for AttendanceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerState {
    NoRecord,
    PunchedIn,
    PunchedOut,
}

/// One identity's punches for one day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayRecord {
    pub punch_in: Option<NaiveDateTime>,
    pub punch_out: Option<NaiveDateTime>,
}

/// Result of applying a mark to a day's record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub event: AttendanceEvent,
    /// Record after the mark.
    pub record: DayRecord,
    /// Whether the record differs from the one passed in.
    pub changed: bool,
}

impl DayRecord {
    pub fn state(&self) -> LedgerState {
        match (self.punch_in, self.punch_out) {
            (Some(_), Some(_)) => LedgerState::PunchedOut,
            (Some(_), None) => LedgerState::PunchedIn,
            (None, _) => LedgerState::NoRecord,
        }
    }

    /// Compute the transition for a mark at `now` against an existing
    /// record (or `None` when the day has no row yet).
    pub fn apply(existing: Option<&DayRecord>, now: NaiveDateTime) -> Transition {
        let current = existing.cloned().unwrap_or_default();
        match current.state() {
            LedgerState::NoRecord => Transition {
                event: AttendanceEvent::PunchIn,
                record: DayRecord {
                    punch_in: Some(now),
                    punch_out: None,
                },
                changed: true,
            },
            LedgerState::PunchedIn => Transition {
                event: AttendanceEvent::PunchOut,
                record: DayRecord {
                    punch_in: current.punch_in,
                    punch_out: Some(now),
                },
                changed: true,
            },
            LedgerState::PunchedOut => Transition {
                event: AttendanceEvent::DoneForDay,
                record: current,
                changed: false,
            },
        }
    }
}

/// Outcome of [`AttendanceLedger::mark`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Punch {
    pub identity: String,
    pub day: NaiveDate,
    pub event: AttendanceEvent,
    pub at: NaiveDateTime,
    pub record: DayRecord,
}

/// In-memory ledger. Each `mark` holds the lock across read and write.
#[derive(Debug, Default)]
pub struct AttendanceLedger {
    records: Mutex<HashMap<(String, NaiveDate), DayRecord>>,
}

impl AttendanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a recognition of `identity` at local wall-clock time `now`.
    pub fn mark(&self, identity: &str, now: NaiveDateTime) -> Punch {
        let day = now.date();
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let key = (identity.to_string(), day);

        let transition = DayRecord::apply(records.get(&key), now);
        if transition.changed {
            records.insert(key, transition.record.clone());
        }

        tracing::info!(identity, %day, event = %transition.event, "attendance marked");

        Punch {
            identity: identity.to_string(),
            day,
            event: transition.event,
            at: now,
            record: transition.record,
        }
    }

    /// Snapshot of one identity's record for a day.
    pub fn record(&self, identity: &str, day: NaiveDate) -> Option<DayRecord> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(&(identity.to_string(), day)).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ts(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_full_day_sequence() {
        let ledger = AttendanceLedger::new();
        let events: Vec<_> = [ts(2, 9, 0), ts(2, 17, 30), ts(2, 18, 0), ts(2, 19, 0)]
            .into_iter()
            .map(|t| ledger.mark("alice", t).event)
            .collect();
        assert_eq!(
            events,
            vec![
                AttendanceEvent::PunchIn,
                AttendanceEvent::PunchOut,
                AttendanceEvent::DoneForDay,
                AttendanceEvent::DoneForDay,
            ]
        );

        let record = ledger.record("alice", ts(2, 0, 0).date()).unwrap();
        assert_eq!(record.punch_in, Some(ts(2, 9, 0)));
        assert_eq!(record.punch_out, Some(ts(2, 17, 30)));
    }

    #[test]
    fn test_no_builtin_cooldown() {
        let ledger = AttendanceLedger::new();
        let t = ts(2, 9, 0);
        assert_eq!(ledger.mark("alice", t).event, AttendanceEvent::PunchIn);
        assert_eq!(ledger.mark("alice", t).event, AttendanceEvent::PunchOut);
    }

    #[test]
    fn test_new_day_starts_fresh() {
        let ledger = AttendanceLedger::new();
        ledger.mark("alice", ts(2, 9, 0));
        ledger.mark("alice", ts(2, 17, 0));
        assert_eq!(
            ledger.mark("alice", ts(2, 23, 59)).event,
            AttendanceEvent::DoneForDay
        );
        assert_eq!(
            ledger.mark("alice", ts(3, 0, 0)).event,
            AttendanceEvent::PunchIn
        );
    }

    #[test]
    fn test_identities_independent() {
        let ledger = AttendanceLedger::new();
        assert_eq!(ledger.mark("alice", ts(2, 9, 0)).event, AttendanceEvent::PunchIn);
        assert_eq!(ledger.mark("bob", ts(2, 9, 1)).event, AttendanceEvent::PunchIn);
        assert!(ledger.record("carol", ts(2, 9, 0).date()).is_none());
    }

    #[test]
    fn test_done_for_day_does_not_mutate() {
        let existing = DayRecord {
            punch_in: Some(ts(2, 9, 0)),
            punch_out: Some(ts(2, 17, 0)),
        };
        let t = DayRecord::apply(Some(&existing), ts(2, 20, 0));
        assert_eq!(t.event, AttendanceEvent::DoneForDay);
        assert!(!t.changed);
        assert_eq!(t.record, existing);
    }

    #[test]
    fn test_concurrent_marks_single_punch_in() {
        let ledger = Arc::new(AttendanceLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || ledger.mark("alice", ts(2, 9, 0)).event)
            })
            .collect();
        let events: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let count = |e| events.iter().filter(|x| **x == e).count();
        assert_eq!(count(AttendanceEvent::PunchIn), 1);
        assert_eq!(count(AttendanceEvent::PunchOut), 1);
        assert_eq!(count(AttendanceEvent::DoneForDay), 6);
    }

    #[test]
    fn test_event_strings() {
        assert_eq!(AttendanceEvent::PunchIn.to_string(), "PUNCH_IN");
        assert_eq!(AttendanceEvent::DoneForDay.as_str(), "DONE_FOR_DAY");
    }
}
