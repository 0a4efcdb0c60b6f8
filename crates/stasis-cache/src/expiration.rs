//! Expiration bookkeeping for idle beans.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::offset::{Offsettable, to_delta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Scheduled {
    at: DateTime<Utc>,
    /// Breaks ties between ids scheduled at the same instant, oldest first.
    seq: u64,
}

/// Tracks when idle beans become eligible for expiration.
///
/// An id is either scheduled (idle, expiring at a known instant) or merely
/// tracked (currently in use). Deciding what to do with an expired id is up
/// to the caller.
#[derive(Debug)]
pub struct ExpirationTracker<K> {
    timeout: Duration,
    tracked: HashMap<K, Option<Scheduled>>,
    schedule: BTreeMap<Scheduled, K>,
    sequence: u64,
}

impl<K> ExpirationTracker<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            tracked: HashMap::new(),
            schedule: BTreeMap::new(),
            sequence: 0,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Schedule `id` to expire one timeout from now.
    pub fn track(&mut self, id: K) {
        self.track_at(id, Utc::now());
    }

    /// Schedule `id` to expire one timeout after `last_access`, replacing
    /// any earlier schedule.
    pub fn track_at(&mut self, id: K, last_access: DateTime<Utc>) {
        self.unschedule(&id);
        let scheduled = self.next_slot(last_access);
        self.schedule.insert(scheduled, id.clone());
        self.tracked.insert(id, Some(scheduled));
    }

    /// Keep `id` tracked but stop it from expiring while it is in use.
    pub fn invalidate(&mut self, id: &K) {
        if self.tracked.contains_key(id) {
            self.unschedule(id);
            self.tracked.insert(id.clone(), None);
        }
    }

    /// Stop tracking `id` altogether.
    pub fn forget(&mut self, id: &K) {
        self.unschedule(id);
        self.tracked.remove(id);
    }

    /// Schedule `id` again unless it is already scheduled.
    pub fn retry(&mut self, id: K) {
        self.retry_at(id, Utc::now());
    }

    pub fn retry_at(&mut self, id: K, last_access: DateTime<Utc>) {
        if !matches!(self.tracked.get(&id), Some(Some(_))) {
            self.track_at(id, last_access);
        }
    }

    /// Pop the earliest id whose expiration is at or before `at`.
    ///
    /// The returned id is no longer tracked.
    pub fn expired_id(&mut self, at: DateTime<Utc>) -> Option<K> {
        let (&scheduled, _) = self.schedule.first_key_value()?;
        if scheduled.at > at {
            return None;
        }
        let id = self.schedule.remove(&scheduled)?;
        self.tracked.remove(&id);
        Some(id)
    }

    /// Earliest scheduled expiration, if any id is scheduled.
    pub fn next_expiration(&self) -> Option<DateTime<Utc>> {
        self.schedule.keys().next().map(|scheduled| scheduled.at)
    }

    pub fn is_tracked(&self, id: &K) -> bool {
        self.tracked.contains_key(id)
    }

    /// All tracked ids, scheduled or not.
    pub fn tracked_ids(&self) -> Vec<K> {
        self.tracked.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    pub fn clear(&mut self) {
        self.tracked.clear();
        self.schedule.clear();
    }

    fn next_slot(&mut self, last_access: DateTime<Utc>) -> Scheduled {
        self.sequence += 1;
        Scheduled {
            at: last_access.shift(to_delta(self.timeout)),
            seq: self.sequence,
        }
    }

    fn unschedule(&mut self, id: &K) {
        if let Some(Some(scheduled)) = self.tracked.get(id) {
            self.schedule.remove(scheduled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn t(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + TimeDelta::milliseconds(millis)
    }

    fn tracker() -> ExpirationTracker<String> {
        ExpirationTracker::new(Duration::from_millis(1))
    }

    #[test]
    fn test_empty_tracker() {
        let mut tracker = tracker();
        assert!(tracker.expired_id(t(0)).is_none());
        tracker.invalidate(&"missing".to_string());
        tracker.forget(&"missing".to_string());
        assert!(tracker.next_expiration().is_none());
        assert!(tracker.tracked_ids().is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_single_id_expires_after_timeout() {
        let mut tracker = tracker();
        tracker.track_at("id".to_string(), t(0));

        assert!(tracker.expired_id(t(0)).is_none());
        assert_eq!(tracker.next_expiration(), Some(t(1)));
        assert_eq!(tracker.expired_id(t(1)), Some("id".to_string()));
        assert!(tracker.expired_id(t(10)).is_none());
        assert!(tracker.next_expiration().is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_unrepresentable_timeout_never_expires() {
        let mut tracker = ExpirationTracker::new(Duration::from_secs(u64::MAX));
        tracker.track_at("id".to_string(), t(0));

        assert!(tracker.expired_id(t(0)).is_none());
        assert!(tracker.expired_id(t(1_000 * 365 * 24 * 60 * 60 * 1_000)).is_none());
        assert_eq!(tracker.next_expiration(), Some(DateTime::<Utc>::MAX_UTC));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_invalidate_keeps_id_tracked() {
        let mut tracker = tracker();
        tracker.track_at("id".to_string(), t(0));

        tracker.invalidate(&"missing".to_string());
        assert!(tracker.next_expiration().is_some());
        assert!(!tracker.is_tracked(&"missing".to_string()));

        tracker.invalidate(&"id".to_string());
        assert!(tracker.next_expiration().is_none());
        assert!(tracker.expired_id(t(100)).is_none());
        assert_eq!(tracker.tracked_ids(), vec!["id".to_string()]);

        tracker.track_at("id".to_string(), t(5));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.expired_id(t(6)), Some("id".to_string()));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_forget_after_invalidate() {
        let mut tracker = tracker();
        tracker.track_at("id".to_string(), t(0));
        tracker.invalidate(&"id".to_string());
        tracker.forget(&"id".to_string());

        assert!(tracker.is_empty());
        assert!(tracker.next_expiration().is_none());
        assert!(tracker.expired_id(t(100)).is_none());
    }

    #[test]
    fn test_retracking_reschedules() {
        let mut tracker = tracker();
        tracker.track_at("id".to_string(), t(0));
        tracker.track_at("id".to_string(), t(3));
        tracker.track_at("id".to_string(), t(4));

        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.next_expiration(), Some(t(5)));
        assert!(tracker.expired_id(t(4)).is_none());
        assert_eq!(tracker.expired_id(t(9)), Some("id".to_string()));
    }

    #[test]
    fn test_earliest_expires_first() {
        let mut tracker = tracker();
        tracker.track_at("id1".to_string(), t(0));
        tracker.track_at("id2".to_string(), t(5));

        assert!(tracker.expired_id(t(-100)).is_none());
        assert_eq!(tracker.expired_id(t(10)), Some("id1".to_string()));
        assert_eq!(tracker.tracked_ids(), vec!["id2".to_string()]);
        assert_eq!(tracker.expired_id(t(10)), Some("id2".to_string()));
        assert!(tracker.expired_id(t(10)).is_none());
    }

    #[test]
    fn test_invalidating_first_exposes_second() {
        let mut tracker = tracker();
        tracker.track_at("id5".to_string(), t(0));
        tracker.track_at("id6".to_string(), t(5));

        tracker.invalidate(&"id5".to_string());
        assert_eq!(tracker.next_expiration(), Some(t(6)));
        assert_eq!(tracker.expired_id(t(10)), Some("id6".to_string()));
        assert_eq!(tracker.tracked_ids(), vec!["id5".to_string()]);
    }

    #[test]
    fn test_same_instant_expires_in_tracking_order() {
        let mut tracker = tracker();
        tracker.track_at("b".to_string(), t(0));
        tracker.track_at("a".to_string(), t(0));

        assert_eq!(tracker.expired_id(t(1)), Some("b".to_string()));
        assert_eq!(tracker.expired_id(t(1)), Some("a".to_string()));
    }

    #[test]
    fn test_retry_only_reschedules_unscheduled_ids() {
        let mut tracker = tracker();
        tracker.retry("missing".to_string());
        assert!(tracker.is_tracked(&"missing".to_string()));

        tracker.track_at("id".to_string(), t(0));
        tracker.retry_at("id".to_string(), t(50));
        assert_eq!(tracker.expired_id(t(1)), Some("id".to_string()));

        tracker.track_at("id".to_string(), t(0));
        tracker.invalidate(&"id".to_string());
        tracker.retry_at("id".to_string(), t(50));
        assert!(tracker.expired_id(t(1)).is_none());
        assert_eq!(tracker.expired_id(t(51)), Some("id".to_string()));
    }

    #[test]
    fn test_clear() {
        let mut tracker = tracker();
        tracker.track_at("a".to_string(), t(0));
        tracker.track_at("b".to_string(), t(0));
        tracker.clear();

        assert!(tracker.is_empty());
        assert!(tracker.next_expiration().is_none());
    }
}
