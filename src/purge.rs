//! Idle-subdomain reclamation: validation, single-flight controller,
//! and the cron-driven schedule loop

use crate::error::{Error, Result};
use crate::runner::{TaskRunner, STATUS_RUNNING};
use chrono::Local;
use cron::Schedule;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shortest purge duration accepted from callers.
pub const PURGE_MINIMUM_DURATION: Duration = Duration::from_secs(300);

/// Pause between terminated subdomains to smooth cluster API load.
const PURGE_PACING: Duration = Duration::from_secs(3);

/// Purge request as received over the API or from configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PurgeRequest {
    #[serde(deserialize_with = "seconds_from_number_or_string")]
    pub duration: i64,
    #[serde(default)]
    pub excludes: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
    #[serde(default)]
    pub exclude_regexp: String,
}

/// Accept the duration either as a number or as a numeric string.
fn seconds_from_number_or_string<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(i64),
        String(String),
    }
    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid duration {s}"))),
    }
}

impl PurgeRequest {
    pub fn validate(&self) -> Result<PurgeParams> {
        let minimum = PURGE_MINIMUM_DURATION.as_secs() as i64;
        if self.duration < minimum {
            return Err(Error::Validation(format!(
                "invalid duration {} (at least {minimum})",
                self.duration
            )));
        }

        let excludes_set: HashSet<String> = self.excludes.iter().cloned().collect();
        let mut exclude_tags_map = HashMap::with_capacity(self.exclude_tags.len());
        for tag in &self.exclude_tags {
            let Some((key, value)) = tag.split_once(':') else {
                return Err(Error::Validation(format!(
                    "invalid exclude_tags format {tag}"
                )));
            };
            exclude_tags_map.insert(key.to_string(), value.to_string());
        }
        let exclude_regexp = if self.exclude_regexp.is_empty() {
            None
        } else {
            Some(Regex::new(&self.exclude_regexp).map_err(|_| {
                Error::Validation(format!("invalid exclude_regexp {}", self.exclude_regexp))
            })?)
        };

        Ok(PurgeParams {
            duration: Duration::from_secs(self.duration as u64),
            excludes: self.excludes.clone(),
            exclude_tags: self.exclude_tags.clone(),
            exclude_regexp,
            excludes_set,
            exclude_tags_map,
        })
    }
}

#[cfg(test)]
impl PurgeRequest {
    pub fn for_test(
        duration: i64,
        excludes: &[&str],
        exclude_tags: &[&str],
        exclude_regexp: &str,
    ) -> Self {
        Self {
            duration,
            excludes: excludes.iter().map(|s| s.to_string()).collect(),
            exclude_tags: exclude_tags.iter().map(|s| s.to_string()).collect(),
            exclude_regexp: exclude_regexp.to_string(),
        }
    }
}

/// Validated purge parameters.
#[derive(Debug, Clone)]
pub struct PurgeParams {
    pub duration: Duration,
    pub excludes: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub exclude_regexp: Option<Regex>,

    pub excludes_set: HashSet<String>,
    pub exclude_tags_map: HashMap<String, String>,
}

/// Scheduled purge section of the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PurgeConfig {
    pub schedule: String,
    pub request: PurgeRequest,

    #[serde(skip)]
    pub params: Option<PurgeParams>,
    #[serde(skip)]
    pub cron: Option<Schedule>,
}

impl PurgeConfig {
    pub fn validate(&mut self) -> Result<()> {
        let schedule = Schedule::from_str(&self.schedule).map_err(|e| {
            Error::Validation(format!(
                "invalid schedule expression {}: {e}",
                self.schedule
            ))
        })?;
        self.cron = Some(schedule);
        self.params = Some(self.request.validate()?);
        Ok(())
    }
}

/// Purge orchestration. The mutex is a global single-flight: contenders
/// log and return instead of waiting.
pub struct PurgeController {
    runner: Arc<dyn TaskRunner>,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl PurgeController {
    pub fn new(runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            runner,
            lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    #[cfg(test)]
    pub fn single_flight_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(&self.lock)
    }

    /// Decide which subdomains to purge and dispatch the reclamation in
    /// a detached task, so the caller's request may complete first.
    pub async fn purge(&self, params: &PurgeParams) -> Result<()> {
        let infos = self.runner.list(STATUS_RUNNING).await.map_err(|e| {
            error!(error = %e, "list tasks failed");
            Error::ClusterApi(format!("list tasks failed: {e}"))
        })?;

        info!(
            duration_secs = params.duration.as_secs(),
            excludes = ?params.excludes,
            exclude_tags = ?params.exclude_tags,
            exclude_regexp = ?params.exclude_regexp.as_ref().map(|r| r.as_str()),
            "purge subdomains"
        );

        let mut seen = HashSet::new();
        let mut terminates = Vec::new();
        for info in &infos {
            if info.should_be_purged(params) && seen.insert(info.subdomain.clone()) {
                terminates.push(info.subdomain.clone());
            }
        }

        if terminates.is_empty() {
            info!("no subdomains to purge");
            return Ok(());
        }

        info!(count = terminates.len(), "purging subdomains");
        let runner = Arc::clone(&self.runner);
        let lock = Arc::clone(&self.lock);
        let duration = params.duration;
        tokio::spawn(async move {
            purge_subdomains(runner, lock, terminates, duration).await;
        });
        Ok(())
    }
}

/// Terminate quiet subdomains one by one. Holds the single-flight lock
/// for the whole sweep; a concurrent sweep skips out immediately.
pub(crate) async fn purge_subdomains(
    runner: Arc<dyn TaskRunner>,
    lock: Arc<tokio::sync::Mutex<()>>,
    subdomains: Vec<String>,
    duration: Duration,
) {
    let Ok(_guard) = lock.try_lock() else {
        info!("skip purge subdomains, another purge is running");
        return;
    };
    info!(count = subdomains.len(), "start purge subdomains");
    let mut purged = 0;
    for (i, subdomain) in subdomains.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(PURGE_PACING).await;
        }
        match runner.get_access_count(subdomain, duration).await {
            Err(err) => {
                warn!(subdomain = %subdomain, error = %err, "access count failed");
                continue;
            }
            Ok(sum) if sum > 0 => {
                info!(subdomain = %subdomain, sum, "skip purge, recently accessed");
                continue;
            }
            Ok(_) => {}
        }
        match runner.terminate_by_subdomain(subdomain).await {
            Err(err) => warn!(subdomain = %subdomain, error = %err, "terminate failed"),
            Ok(()) => {
                purged += 1;
                info!(subdomain = %subdomain, "purged");
            }
        }
    }
    info!(purged, "purge subdomains completed");
}

/// Fire scheduled purges until shutdown.
pub async fn run_schedule(
    controller: Arc<PurgeController>,
    purge: PurgeConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let (Some(schedule), Some(params)) = (purge.cron.clone(), purge.params.clone()) else {
        error!("purge schedule is not validated");
        return;
    };
    loop {
        let Some(next) = schedule.upcoming(Local).next() else {
            error!(schedule = %purge.schedule, "no upcoming purge schedule");
            return;
        };
        let wait = (next - Local::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(next = %next.to_rfc3339(), "next scheduled purge");
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                if let Err(err) = controller.purge(&params).await {
                    error!(error = %err, "scheduled purge failed");
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::AccessCount;
    use crate::registry::ProxyControlSender;
    use crate::runner::{TaskInfo, TaskParameter, STATUS_RUNNING};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct StubRunner {
        tasks: Vec<TaskInfo>,
        access: HashMap<String, i64>,
        terminated: Mutex<Vec<String>>,
    }

    impl StubRunner {
        fn new(tasks: Vec<TaskInfo>) -> Self {
            Self {
                tasks,
                access: HashMap::new(),
                terminated: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TaskRunner for StubRunner {
        async fn launch(
            &self,
            _subdomain: &str,
            _param: &TaskParameter,
            _taskdefs: &[String],
        ) -> crate::error::Result<()> {
            Ok(())
        }

        async fn logs(
            &self,
            _subdomain: &str,
            _since: Option<DateTime<Utc>>,
            _tail: usize,
        ) -> crate::error::Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn trace(&self, _id: &str) -> crate::error::Result<String> {
            Ok(String::new())
        }

        async fn terminate(&self, _id: &str) -> crate::error::Result<()> {
            Ok(())
        }

        async fn terminate_by_subdomain(&self, subdomain: &str) -> crate::error::Result<()> {
            self.terminated.lock().push(subdomain.to_string());
            Ok(())
        }

        async fn list(&self, _desired_status: &str) -> crate::error::Result<Vec<TaskInfo>> {
            Ok(self.tasks.clone())
        }

        fn set_proxy_control_channel(&self, _tx: ProxyControlSender) {}

        async fn get_access_count(
            &self,
            subdomain: &str,
            _duration: Duration,
        ) -> crate::error::Result<i64> {
            Ok(*self.access.get(subdomain).unwrap_or(&0))
        }

        async fn put_access_counts(
            &self,
            _counts: HashMap<String, AccessCount>,
        ) -> crate::error::Result<()> {
            Ok(())
        }
    }

    fn running_task(subdomain: &str, age_minutes: i64) -> TaskInfo {
        TaskInfo {
            id: format!("task-{subdomain}"),
            short_id: subdomain.to_string(),
            subdomain: subdomain.to_string(),
            branch: "main".to_string(),
            taskdef: "app".to_string(),
            ip_address: "10.0.0.5".to_string(),
            created: Some(chrono::Local::now() - chrono::Duration::minutes(age_minutes)),
            last_status: STATUS_RUNNING.to_string(),
            port_map: HashMap::new(),
            env: HashMap::new(),
            tags: HashMap::new(),
        }
    }

    #[test]
    fn test_validate_rejects_short_duration() {
        let req = PurgeRequest::for_test(299, &[], &[], "");
        assert!(req.validate().is_err());
        assert!(PurgeRequest::for_test(300, &[], &[], "").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_exclude_tags() {
        let req = PurgeRequest::for_test(300, &[], &["NoColonHere"], "");
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_regexp() {
        let req = PurgeRequest::for_test(300, &[], &[], "[");
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_validate_builds_lookup_maps() {
        let req = PurgeRequest::for_test(600, &["a", "b"], &["DontPurge:true"], "te.t");
        let params = req.validate().unwrap();
        assert_eq!(params.duration, Duration::from_secs(600));
        assert!(params.excludes_set.contains("a"));
        assert_eq!(
            params.exclude_tags_map.get("DontPurge").map(String::as_str),
            Some("true")
        );
        assert!(params.exclude_regexp.as_ref().unwrap().is_match("test"));
    }

    #[test]
    fn test_duration_accepts_string_or_number() {
        let from_string: PurgeRequest = serde_json::from_str(r#"{"duration": "300"}"#).unwrap();
        assert_eq!(from_string.duration, 300);
        let from_number: PurgeRequest = serde_json::from_str(r#"{"duration": 300}"#).unwrap();
        assert_eq!(from_number.duration, 300);
        assert!(serde_json::from_str::<PurgeRequest>(r#"{"duration": "abc"}"#).is_err());
    }

    #[test]
    fn test_purge_config_from_yaml() {
        let yaml = r#"
schedule: "0 */3 * * * *"
request:
  duration: "300"
  excludes:
    - "test"
    - "test2"
  exclude_tags:
    - "DontPurge:true"
  exclude_regexp: "te.t"
"#;
        let mut cfg: PurgeConfig = serde_yaml::from_str(yaml).unwrap();
        cfg.validate().unwrap();

        let params = cfg.params.as_ref().unwrap();
        assert_eq!(params.duration, Duration::from_secs(300));
        assert_eq!(params.excludes.len(), 2);
        assert_eq!(params.exclude_tags.len(), 1);
        assert!(params.exclude_regexp.as_ref().unwrap().is_match("test"));

        let now = Utc.with_ymd_and_hms(2024, 11, 7, 11, 22, 33).unwrap();
        let next = cfg.cron.as_ref().unwrap().after(&now).next().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 11, 7, 11, 24, 0).unwrap());
    }

    #[test]
    fn test_purge_config_rejects_bad_schedule() {
        let mut cfg = PurgeConfig {
            schedule: "not a schedule".to_string(),
            request: PurgeRequest::for_test(300, &[], &[], ""),
            params: None,
            cron: None,
        };
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn test_purge_terminates_quiet_old_subdomains() {
        let runner = Arc::new(StubRunner::new(vec![
            running_task("old-quiet", 10),
            running_task("young", 1),
        ]));
        let controller = PurgeController::new(Arc::clone(&runner) as Arc<dyn TaskRunner>);
        let params = PurgeRequest::for_test(300, &[], &[], "").validate().unwrap();

        controller.purge(&params).await.unwrap();
        // The sweep runs detached; give it a moment.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let terminated = runner.terminated.lock().clone();
        assert_eq!(terminated, vec!["old-quiet".to_string()]);
    }

    #[tokio::test]
    async fn test_purge_skips_recently_accessed() {
        let mut stub = StubRunner::new(vec![running_task("busy", 10)]);
        stub.access.insert("busy".to_string(), 42);
        let runner = Arc::new(stub);
        let controller = PurgeController::new(Arc::clone(&runner) as Arc<dyn TaskRunner>);
        let params = PurgeRequest::for_test(300, &[], &[], "").validate().unwrap();

        controller.purge(&params).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(runner.terminated.lock().is_empty());
    }

    #[tokio::test]
    async fn test_single_flight_contender_skips() {
        let runner = Arc::new(StubRunner::new(Vec::new()));
        let controller = PurgeController::new(Arc::clone(&runner) as Arc<dyn TaskRunner>);
        let lock = controller.single_flight_lock();

        let guard = lock.try_lock().unwrap();
        purge_subdomains(
            Arc::clone(&runner) as Arc<dyn TaskRunner>,
            Arc::clone(&lock),
            vec!["feature-x".to_string()],
            Duration::from_secs(300),
        )
        .await;
        // The contender returned without terminating anything.
        assert!(runner.terminated.lock().is_empty());
        drop(guard);

        purge_subdomains(
            Arc::clone(&runner) as Arc<dyn TaskRunner>,
            lock,
            vec!["feature-x".to_string()],
            Duration::from_secs(300),
        )
        .await;
        assert_eq!(runner.terminated.lock().clone(), vec!["feature-x".to_string()]);
    }
}
