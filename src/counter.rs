//! Per-subdomain access counting, bucketed by a unit interval

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Snapshot of counted accesses: bucket start time -> count.
pub type AccessCount = HashMap<DateTime<Utc>, i64>;

/// Rolling access counter for one subdomain.
///
/// Each request lands in the bucket for the current wall-clock truncated
/// to the counter unit (one minute in cluster mode, ten seconds in local
/// mode). Buckets accumulate until collected for metric publication.
pub struct AccessCounter {
    unit: Duration,
    buckets: Mutex<AccessCount>,
}

impl AccessCounter {
    pub fn new(unit: Duration) -> Self {
        Self {
            unit,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Count one access in the current bucket.
    pub fn add(&self) {
        let bucket = truncate(Utc::now(), self.unit);
        *self.buckets.lock().entry(bucket).or_insert(0) += 1;
    }

    /// Return all non-empty buckets and clear them.
    pub fn collect(&self) -> AccessCount {
        std::mem::take(&mut *self.buckets.lock())
    }
}

/// Truncate a timestamp down to a multiple of the unit.
fn truncate(t: DateTime<Utc>, unit: Duration) -> DateTime<Utc> {
    let secs = unit.as_secs().max(1) as i64;
    let ts = t.timestamp().div_euclid(secs) * secs;
    DateTime::from_timestamp(ts, 0).expect("truncated timestamp in range")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_truncate_to_unit() {
        let t = Utc.with_ymd_and_hms(2024, 11, 7, 11, 22, 33).unwrap();
        assert_eq!(
            truncate(t, Duration::from_secs(60)),
            Utc.with_ymd_and_hms(2024, 11, 7, 11, 22, 0).unwrap()
        );
        assert_eq!(
            truncate(t, Duration::from_secs(10)),
            Utc.with_ymd_and_hms(2024, 11, 7, 11, 22, 30).unwrap()
        );
    }

    #[test]
    fn test_add_accumulates_in_one_bucket() {
        // A large unit keeps every add in the same bucket regardless of
        // when the test runs.
        let counter = AccessCounter::new(Duration::from_secs(3600));
        for _ in 0..5 {
            counter.add();
        }
        let counts = counter.collect();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts.values().sum::<i64>(), 5);
    }

    #[test]
    fn test_collect_clears_buckets() {
        let counter = AccessCounter::new(Duration::from_secs(3600));
        counter.add();
        assert_eq!(counter.collect().values().sum::<i64>(), 1);
        assert!(counter.collect().is_empty());

        // Counts after a collect land in a fresh bucket map.
        counter.add();
        counter.add();
        assert_eq!(counter.collect().values().sum::<i64>(), 2);
    }
}
