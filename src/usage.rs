//! Usage Monitor Gate
//!
//! Ingests access observations from telemetry and answers whether a field's
//! recent usage is low enough for a removal to proceed. It works purely on
//! counters it has already ingested and never performs I/O itself.

use std::collections::BTreeSet;
use std::ops::Bound;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::schema::FieldRef;

/// Access timestamps per field
#[derive(Debug, Default)]
pub struct UsageMonitor {
    samples: DashMap<FieldRef, BTreeSet<DateTime<Utc>>>,
}

impl UsageMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one access
    ///
    /// Idempotent per (field, timestamp): a duplicate delivery returns `false`
    /// and changes nothing.
    pub fn record_access(&self, key: &FieldRef, at: DateTime<Utc>) -> bool {
        let inserted = self.samples.entry(key.clone()).or_default().insert(at);
        if !inserted {
            tracing::debug!(field = %key, %at, "duplicate access delivery ignored");
        }
        inserted
    }

    /// Whether this exact access was already ingested
    pub fn contains(&self, key: &FieldRef, at: DateTime<Utc>) -> bool {
        self.samples
            .get(key)
            .map(|set| set.contains(&at))
            .unwrap_or(false)
    }

    /// Accesses with `from < t <= to`
    pub fn count_between(&self, key: &FieldRef, from: DateTime<Utc>, to: DateTime<Utc>) -> usize {
        if from >= to {
            return 0;
        }
        self.samples
            .get(key)
            .map(|set| {
                set.range((Bound::Excluded(from), Bound::Included(to)))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Accesses within the trailing window ending at `now`
    pub fn count_in_window(&self, key: &FieldRef, window: Duration, now: DateTime<Utc>) -> usize {
        self.count_between(key, now - window, now)
    }

    /// True when the trailing-window access count is at most `threshold`
    pub fn is_below_threshold(
        &self,
        key: &FieldRef,
        window: Duration,
        threshold: usize,
        now: DateTime<Utc>,
    ) -> bool {
        self.count_in_window(key, window, now) <= threshold
    }

    /// Most recent access at or before `now`
    pub fn last_access(&self, key: &FieldRef, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.samples
            .get(key)
            .and_then(|set| set.range(..=now).next_back().copied())
    }

    /// Total accesses ever ingested for a field (after pruning)
    pub fn total(&self, key: &FieldRef) -> usize {
        self.samples.get(key).map(|set| set.len()).unwrap_or(0)
    }

    /// Drop samples older than `cutoff`; returns how many were removed
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for mut entry in self.samples.iter_mut() {
            let kept = entry.value_mut().split_off(&cutoff);
            removed += entry.value().len();
            *entry.value_mut() = kept;
        }
        self.samples.retain(|_, set| !set.is_empty());
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phone() -> FieldRef {
        FieldRef::new("users", "phone_number")
    }

    #[test]
    fn test_record_access_is_idempotent() {
        let monitor = UsageMonitor::new();
        let at = Utc::now();
        assert!(monitor.record_access(&phone(), at));
        assert!(!monitor.record_access(&phone(), at));
        assert_eq!(monitor.total(&phone()), 1);
    }

    #[test]
    fn test_trailing_window_counts() {
        let monitor = UsageMonitor::new();
        let now = Utc::now();
        monitor.record_access(&phone(), now - Duration::days(10));
        monitor.record_access(&phone(), now - Duration::days(2));
        monitor.record_access(&phone(), now - Duration::hours(1));

        assert_eq!(monitor.count_in_window(&phone(), Duration::days(7), now), 2);
        assert!(!monitor.is_below_threshold(&phone(), Duration::days(7), 0, now));
        assert!(monitor.is_below_threshold(&phone(), Duration::days(7), 2, now));
        assert!(monitor.is_below_threshold(&phone(), Duration::minutes(30), 0, now));
    }

    #[test]
    fn test_unknown_field_is_below_threshold() {
        let monitor = UsageMonitor::new();
        assert!(monitor.is_below_threshold(&phone(), Duration::days(7), 0, Utc::now()));
        assert!(monitor.last_access(&phone(), Utc::now()).is_none());
    }

    #[test]
    fn test_future_samples_do_not_count() {
        let monitor = UsageMonitor::new();
        let now = Utc::now();
        monitor.record_access(&phone(), now + Duration::hours(1));
        assert_eq!(monitor.count_in_window(&phone(), Duration::days(1), now), 0);
        assert!(monitor.last_access(&phone(), now).is_none());
    }

    #[test]
    fn test_prune_before() {
        let monitor = UsageMonitor::new();
        let now = Utc::now();
        monitor.record_access(&phone(), now - Duration::days(40));
        monitor.record_access(&phone(), now - Duration::days(1));
        assert_eq!(monitor.prune_before(now - Duration::days(30)), 1);
        assert_eq!(monitor.total(&phone()), 1);
    }
}
