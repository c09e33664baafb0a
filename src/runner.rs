//! Task lifecycle contract shared by the cluster and local backends

use crate::config::Parameter;
use crate::counter::AccessCount;
use crate::error::Result;
use crate::purge::PurgeParams;
use crate::registry::ProxyControlSender;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Tag discriminating tasks owned by this gateway from other tenants of
/// the shared cluster.
pub const TAG_MANAGED_BY: &str = "ManagedBy";
pub const TAG_SUBDOMAIN: &str = "Subdomain";
pub const TAG_TASKDEF: &str = "TaskDef";
pub const TAG_VALUE_GATEWAY: &str = "envgate";

pub const ENV_SUBDOMAIN: &str = "SUBDOMAIN";
pub const ENV_SUBDOMAIN_RAW: &str = "SUBDOMAINRAW";

pub const STATUS_RUNNING: &str = "RUNNING";
pub const STATUS_STOPPED: &str = "STOPPED";

/// Immutable snapshot of one running workload.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub id: String,
    pub short_id: String,
    pub subdomain: String,
    pub branch: String,
    pub taskdef: String,
    #[serde(rename = "ipaddress")]
    pub ip_address: String,
    pub created: Option<DateTime<Local>>,
    pub last_status: String,
    pub port_map: HashMap<String, u16>,
    pub env: HashMap<String, String>,
    pub tags: HashMap<String, String>,
}

impl TaskInfo {
    /// A task is purged only when every exclusion rule passes it by.
    pub fn should_be_purged(&self, p: &PurgeParams) -> bool {
        if self.last_status != STATUS_RUNNING {
            info!(
                status = %self.last_status,
                subdomain = %self.subdomain,
                "skip not running task"
            );
            return false;
        }
        if p.excludes_set.contains(&self.subdomain) {
            info!(subdomain = %self.subdomain, "skip exclude subdomain");
            return false;
        }
        for (key, value) in &self.tags {
            if p.exclude_tags_map.get(key) == Some(value) {
                info!(
                    tag = %format!("{key}={value}"),
                    subdomain = %self.subdomain,
                    "skip exclude tag"
                );
                return false;
            }
        }
        if let Some(re) = &p.exclude_regexp {
            if re.is_match(&self.subdomain) {
                info!(
                    regexp = %re.as_str(),
                    subdomain = %self.subdomain,
                    "skip exclude regexp"
                );
                return false;
            }
        }
        let begin = Local::now()
            - chrono::Duration::from_std(p.duration).unwrap_or(chrono::Duration::zero());
        match self.created {
            Some(created) if created > begin => {
                info!(
                    created = %created.to_rfc3339(),
                    subdomain = %self.subdomain,
                    "skip recent created"
                );
                false
            }
            Some(_) => true,
            // No start timestamp reported yet; treat as recent.
            None => false,
        }
    }
}

/// Launch parameters supplied by the caller, keyed by parameter name.
#[derive(Debug, Clone, Default)]
pub struct TaskParameter(pub HashMap<String, String>);

impl TaskParameter {
    pub fn get(&self, name: &str) -> Option<&String> {
        self.0.get(name)
    }

    /// Environment variables injected into every container of a task.
    pub fn to_env(
        &self,
        subdomain: &str,
        config_params: &[Parameter],
        encode: &dyn Fn(&str) -> String,
    ) -> HashMap<String, String> {
        let mut env = HashMap::with_capacity(self.0.len() + 2);
        env.insert(ENV_SUBDOMAIN.to_string(), encode(subdomain));
        env.insert(ENV_SUBDOMAIN_RAW.to_string(), subdomain.to_string());
        for param in config_params {
            match self.0.get(&param.name) {
                Some(value) if !value.is_empty() => {
                    env.insert(param.env.to_uppercase(), value.clone());
                }
                _ => {}
            }
        }
        env
    }

    /// Cluster tags attached to a launched task. The subdomain value is
    /// base64url-encoded; DNS characters are not tag-safe everywhere.
    pub fn to_tags(&self, subdomain: &str, config_params: &[Parameter]) -> HashMap<String, String> {
        let mut tags = HashMap::with_capacity(self.0.len() + 2);
        tags.insert(TAG_SUBDOMAIN.to_string(), encode_tag_value(subdomain));
        tags.insert(TAG_MANAGED_BY.to_string(), TAG_VALUE_GATEWAY.to_string());
        for param in config_params {
            match self.0.get(&param.name) {
                Some(value) if !value.is_empty() => {
                    tags.insert(param.name.clone(), value.clone());
                }
                _ => {}
            }
        }
        tags
    }
}

pub fn encode_tag_value(s: &str) -> String {
    URL_SAFE.encode(s)
}

pub fn decode_tag_value(s: &str) -> String {
    match URL_SAFE.decode(s) {
        Ok(decoded) => match String::from_utf8(decoded) {
            Ok(v) => v,
            Err(_) => s.to_string(),
        },
        Err(err) => {
            warn!(value = %s, error = %err, "failed to decode tag value");
            s.to_string()
        }
    }
}

/// Launch, enumerate, terminate, log-fetch and trace operations against
/// a task backend, plus the access-count metric seam.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Launch one task per taskdef. Idempotent in effect: any task
    /// already running under the subdomain is terminated first.
    async fn launch(
        &self,
        subdomain: &str,
        param: &TaskParameter,
        taskdefs: &[String],
    ) -> Result<()>;

    /// Merged log lines of every container of every matching task,
    /// trailing `tail` lines (zero means all).
    async fn logs(
        &self,
        subdomain: &str,
        since: Option<DateTime<Utc>>,
        tail: usize,
    ) -> Result<Vec<String>>;

    /// Opaque diagnostic dump for one task.
    async fn trace(&self, id: &str) -> Result<String>;

    /// Stop one task by id.
    async fn terminate(&self, id: &str) -> Result<()>;

    /// Notify the proxy registry, then stop every matching task.
    async fn terminate_by_subdomain(&self, subdomain: &str) -> Result<()>;

    /// Every workload managed by this gateway, subdomain ascending.
    async fn list(&self, desired_status: &str) -> Result<Vec<TaskInfo>>;

    /// Inject the channel notified on proxy add/remove.
    fn set_proxy_control_channel(&self, tx: ProxyControlSender);

    /// Sum of recent accesses from the metric store; the duration is
    /// truncated to a minute.
    async fn get_access_count(&self, subdomain: &str, duration: Duration) -> Result<i64>;

    /// Publish a counter snapshot to the metric store.
    async fn put_access_counts(&self, counts: HashMap<String, AccessCount>) -> Result<()>;
}
