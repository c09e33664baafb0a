//! Metric store backing GetAccessCount / PutAccessCounts

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Upstream APIs accept at most this many datums per publish call;
/// callers must chunk accordingly.
pub const MAX_DATUMS_PER_CALL: usize = 20;

/// One published access-count sample.
#[derive(Debug, Clone)]
pub struct AccessDatum {
    pub subdomain: String,
    pub timestamp: DateTime<Utc>,
    pub count: i64,
}

/// The metric-publication backend, consumed by task runners as a pair
/// of operations: publish counter snapshots, and sum recent access for
/// purge decisions.
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Publish up to [`MAX_DATUMS_PER_CALL`] datums.
    async fn put(&self, datums: Vec<AccessDatum>) -> Result<()>;

    /// Sum of counts for a subdomain within the trailing window.
    async fn sum(&self, subdomain: &str, window: Duration) -> Result<i64>;
}

/// In-memory metric store. All state is rebuilt from scratch on restart,
/// matching the gateway's no-persistence model.
pub struct MemoryMetricStore {
    points: Mutex<HashMap<String, BTreeMap<DateTime<Utc>, i64>>>,
    retention: Duration,
}

impl MemoryMetricStore {
    pub fn new() -> Self {
        Self::with_retention(Duration::from_secs(48 * 3600))
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            points: Mutex::new(HashMap::new()),
            retention,
        }
    }

    fn prune(&self, points: &mut HashMap<String, BTreeMap<DateTime<Utc>, i64>>) {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.retention).unwrap_or(ChronoDuration::hours(48));
        for series in points.values_mut() {
            *series = series.split_off(&cutoff);
        }
        points.retain(|_, series| !series.is_empty());
    }
}

impl Default for MemoryMetricStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricStore for MemoryMetricStore {
    async fn put(&self, datums: Vec<AccessDatum>) -> Result<()> {
        if datums.len() > MAX_DATUMS_PER_CALL {
            return Err(Error::ClusterApi(format!(
                "too many datums in one call: {} (max {})",
                datums.len(),
                MAX_DATUMS_PER_CALL
            )));
        }
        let mut points = self.points.lock();
        for datum in datums {
            *points
                .entry(datum.subdomain)
                .or_default()
                .entry(datum.timestamp)
                .or_insert(0) += datum.count;
        }
        self.prune(&mut points);
        Ok(())
    }

    async fn sum(&self, subdomain: &str, window: Duration) -> Result<i64> {
        let begin =
            Utc::now() - ChronoDuration::from_std(window).unwrap_or(ChronoDuration::hours(24));
        let points = self.points.lock();
        let sum = points
            .get(subdomain)
            .map(|series| series.range(begin..).map(|(_, c)| c).sum())
            .unwrap_or(0);
        Ok(sum)
    }
}
