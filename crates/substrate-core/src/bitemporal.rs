//! Bitemporal validity for nodes, edges and entities.
//!
//! Two independent timelines:
//! - valid time (`valid_from`/`valid_to`): when the fact held in reality
//! - recorded time (`recorded_from`/`recorded_to`): when the store knew it
//!
//! Closing `recorded_to` retires a record without losing its history.

use serde::{Deserialize, Serialize};

use crate::time::{Timestamp, now_millis};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitemporal {
    pub valid_from: Timestamp,
    pub valid_to: Option<Timestamp>,
    pub recorded_from: Timestamp,
    pub recorded_to: Option<Timestamp>,
}

impl Bitemporal {
    /// A fresh record valid from `valid_from`, recorded at `recorded_at`.
    pub fn open(valid_from: Timestamp, recorded_at: Timestamp) -> Self {
        Self {
            valid_from,
            valid_to: None,
            recorded_from: recorded_at,
            recorded_to: None,
        }
    }

    pub fn is_valid_at(&self, t: Timestamp) -> bool {
        self.valid_from <= t && self.valid_to.is_none_or(|end| t < end)
    }

    pub fn is_known_at(&self, t: Timestamp) -> bool {
        self.recorded_from <= t && self.recorded_to.is_none_or(|end| t < end)
    }

    /// Still part of current knowledge (not soft-deleted).
    pub fn is_open(&self) -> bool {
        self.recorded_to.is_none()
    }

    pub fn matches(&self, as_of: AsOf) -> bool {
        self.is_known_at(as_of.recorded) && self.is_valid_at(as_of.valid)
    }

    /// Soft-delete: the store stops knowing this record at `at`.
    /// Validity also ends at `at` unless it already ended earlier.
    pub fn close(&mut self, at: Timestamp) {
        if self.recorded_to.is_none() {
            self.recorded_to = Some(at.max(self.recorded_from));
        }
        if self.valid_to.is_none_or(|end| end > at) && at >= self.valid_from {
            self.valid_to = Some(at);
        }
    }

    /// Retire this version in favor of a correction recorded at `at`.
    /// Only the knowledge timeline moves; reality is unchanged.
    pub fn supersede(&mut self, at: Timestamp) {
        if self.recorded_to.is_none() {
            self.recorded_to = Some(at.max(self.recorded_from));
        }
    }

    pub fn was_valid_during(&self, start: Timestamp, end: Timestamp) -> bool {
        self.valid_from < end && self.valid_to.is_none_or(|to| to > start)
    }

    /// Invariant: intervals are non-inverted.
    pub fn is_consistent(&self) -> bool {
        self.valid_to.is_none_or(|to| to >= self.valid_from)
            && self.recorded_to.is_none_or(|to| to >= self.recorded_from)
    }
}

/// Point-in-time selector for reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsOf {
    pub valid: Timestamp,
    pub recorded: Timestamp,
}

impl AsOf {
    /// Current truth as currently known.
    pub fn now() -> Self {
        Self::at(now_millis())
    }

    /// Same instant on both timelines.
    pub fn at(t: Timestamp) -> Self {
        Self {
            valid: t,
            recorded: t,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_record_valid_and_known() {
        let b = Bitemporal::open(100, 200);
        assert!(b.is_valid_at(100));
        assert!(!b.is_valid_at(99));
        assert!(b.is_known_at(200));
        assert!(!b.is_known_at(150));
        assert!(b.is_open());
    }

    #[test]
    fn test_close_ends_both_timelines() {
        let mut b = Bitemporal::open(100, 100);
        b.close(500);
        assert!(!b.is_open());
        assert!(b.is_known_at(499));
        assert!(!b.is_known_at(500));
        assert!(!b.is_valid_at(500));
        assert!(b.is_consistent());
    }

    #[test]
    fn test_close_twice_keeps_first_closure() {
        let mut b = Bitemporal::open(0, 0);
        b.close(10);
        b.close(20);
        assert_eq!(b.recorded_to, Some(10));
        assert_eq!(b.valid_to, Some(10));
    }

    #[test]
    fn test_supersede_leaves_reality_alone() {
        let mut b = Bitemporal::open(0, 0);
        b.supersede(50);
        assert_eq!(b.recorded_to, Some(50));
        assert_eq!(b.valid_to, None);
        assert!(b.matches(AsOf::at(49)));
        assert!(!b.matches(AsOf::at(50)));
    }

    #[test]
    fn test_future_valid_from_not_clipped_by_close() {
        let mut b = Bitemporal::open(1000, 0);
        b.close(500);
        assert_eq!(b.valid_to, None);
        assert!(b.is_consistent());
    }

    #[test]
    fn test_was_valid_during() {
        let mut b = Bitemporal::open(100, 0);
        b.close(200);
        assert!(b.was_valid_during(150, 300));
        assert!(!b.was_valid_during(200, 300));
        assert!(!b.was_valid_during(0, 100));
    }
}
