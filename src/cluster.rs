//! ClusterRunner: TaskRunner against the container orchestrator

use crate::config::Config;
use crate::counter::AccessCount;
use crate::error::{Error, Result};
use crate::metrics::{AccessDatum, MetricStore, MAX_DATUMS_PER_CALL};
use crate::registry::{ProxyControl, ProxyControlSender};
use crate::runner::{
    decode_tag_value, TaskInfo, TaskParameter, TaskRunner, STATUS_RUNNING, STATUS_STOPPED,
    TAG_MANAGED_BY, TAG_SUBDOMAIN, TAG_TASKDEF, TAG_VALUE_GATEWAY,
};
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::models::{ContainerInspectResponse, HostConfig};
use bollard::Docker;
use chrono::{DateTime, Local, Utc};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const STOP_TIMEOUT_SECS: i64 = 30;

/// Resolved task definition. Taskdefs are immutable once referenced, so
/// resolutions are memoised for the life of the process.
#[derive(Debug, Clone)]
struct TaskDefSpec {
    name: String,
    image: String,
    command: Vec<String>,
    target_port: u16,
    env: HashMap<String, String>,
}

#[derive(Clone)]
pub struct ClusterRunner {
    cfg: Arc<Config>,
    docker: Docker,
    metrics: Arc<dyn MetricStore>,
    proxy_ch: Arc<Mutex<Option<ProxyControlSender>>>,
    taskdef_cache: Arc<RwLock<HashMap<String, Arc<TaskDefSpec>>>>,
}

impl ClusterRunner {
    pub async fn new(cfg: Arc<Config>, metrics: Arc<dyn MetricStore>) -> Result<Self> {
        let docker = connect(cfg.cluster.docker_host.as_deref()).await?;
        Ok(Self {
            cfg,
            docker,
            metrics,
            proxy_ch: Arc::new(Mutex::new(None)),
            taskdef_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn send_proxy_control(&self, action: ProxyControl) {
        let guard = self.proxy_ch.lock();
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(action).is_err() {
                    warn!("proxy control channel is closed");
                }
            }
            None => warn!("proxy control channel is not set"),
        }
    }

    /// Resolve a taskdef by name, memoised. An undeclared name is
    /// treated as an image reference listening on the default port.
    async fn resolve_taskdef(&self, name: &str) -> Result<Arc<TaskDefSpec>> {
        if let Some(spec) = self.taskdef_cache.read().get(name) {
            debug!(taskdef = %name, "taskdef cache hit");
            return Ok(Arc::clone(spec));
        }
        debug!(taskdef = %name, "taskdef cache miss");

        let spec = match self.cfg.task_def(name) {
            Some(td) => {
                let image = td.image.clone().ok_or_else(|| {
                    Error::Validation(format!("taskdef {name} has no image"))
                })?;
                TaskDefSpec {
                    name: name.to_string(),
                    image,
                    command: td.command.clone(),
                    target_port: td.target_port,
                    env: td.env.clone(),
                }
            }
            None => TaskDefSpec {
                name: name.to_string(),
                image: name.to_string(),
                command: Vec::new(),
                target_port: crate::config::DEFAULT_PORT,
                env: HashMap::new(),
            },
        };

        // Validate the image exists before caching; the resolved spec is
        // immutable from here on.
        self.docker
            .inspect_image(&spec.image)
            .await
            .map_err(|e| Error::ClusterApi(format!("cannot resolve taskdef {name}: {e}")))?;

        let spec = Arc::new(spec);
        self.taskdef_cache
            .write()
            .insert(name.to_string(), Arc::clone(&spec));
        Ok(spec)
    }

    async fn launch_task(
        &self,
        subdomain: &str,
        taskdef: &str,
        param: &TaskParameter,
    ) -> Result<()> {
        info!(subdomain = %subdomain, taskdef = %taskdef, "launching task");
        let spec = self.resolve_taskdef(taskdef).await?;

        let cfg = &self.cfg;
        let mut env = spec.env.clone();
        env.extend(param.to_env(subdomain, &cfg.parameters, &|s| cfg.encode_subdomain(s)));
        let env_list: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let mut labels = param.to_tags(subdomain, &cfg.parameters);
        labels.insert(TAG_TASKDEF.to_string(), spec.name.clone());

        let container_name = container_name(subdomain, &spec.name);
        let host_config = HostConfig {
            network_mode: cfg.cluster.network.clone(),
            ..Default::default()
        };
        let container_config = ContainerConfig {
            image: Some(spec.image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: Some(env_list),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.clone(),
                    platform: None,
                }),
                container_config,
            )
            .await?;
        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;
        info!(subdomain = %subdomain, id = %created.id, "launched task");
        Ok(())
    }

    async fn find(&self, subdomain: &str) -> Result<Vec<TaskInfo>> {
        let infos = self.list(STATUS_RUNNING).await?;
        Ok(infos
            .into_iter()
            .filter(|info| info.subdomain == subdomain)
            .collect())
    }

    async fn task_info(&self, id: &str) -> Result<TaskInfo> {
        let inspect = self.docker.inspect_container(id, None).await?;
        Ok(self.info_from_inspect(id, &inspect).await)
    }

    async fn info_from_inspect(&self, id: &str, inspect: &ContainerInspectResponse) -> TaskInfo {
        let labels = inspect
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();
        let env = inspect
            .config
            .as_ref()
            .and_then(|c| c.env.as_ref())
            .map(|list| parse_env_list(list))
            .unwrap_or_default();

        let subdomain = labels
            .get(TAG_SUBDOMAIN)
            .map(|v| decode_tag_value(v))
            .unwrap_or_default();
        let taskdef = labels.get(TAG_TASKDEF).cloned().unwrap_or_default();

        let mut port_map = HashMap::new();
        if !taskdef.is_empty() {
            match self.resolve_taskdef(&taskdef).await {
                Ok(spec) => {
                    port_map.insert(spec.name.clone(), spec.target_port);
                }
                Err(err) => {
                    warn!(id = %id, taskdef = %taskdef, error = %err, "failed to resolve port map");
                }
            }
        }

        let created = inspect
            .state
            .as_ref()
            .and_then(|s| s.started_at.as_deref())
            .and_then(parse_cluster_time);

        TaskInfo {
            id: id.to_string(),
            short_id: short_id(id),
            subdomain,
            branch: env.get("GIT_BRANCH").cloned().unwrap_or_default(),
            taskdef,
            ip_address: ip_address(inspect, self.cfg.cluster.network.as_deref()),
            created,
            last_status: inspect
                .state
                .as_ref()
                .and_then(|s| s.status.as_ref())
                // ContainerStateStatusEnum variants are RUNNING, EXITED, ...
                .map(|s| format!("{s:?}"))
                .unwrap_or_default(),
            port_map,
            env,
            tags: labels,
        }
    }
}

#[async_trait]
impl TaskRunner for ClusterRunner {
    async fn launch(
        &self,
        subdomain: &str,
        param: &TaskParameter,
        taskdefs: &[String],
    ) -> Result<()> {
        let running = self
            .find(subdomain)
            .await
            .map_err(|e| Error::ClusterApi(format!("failed to get subdomain {subdomain}: {e}")))?;
        if !running.is_empty() {
            info!(
                subdomain = %subdomain,
                tasks = running.len(),
                "subdomain is already running, terminating"
            );
            self.terminate_by_subdomain(subdomain).await?;
        }

        info!(subdomain = %subdomain, taskdefs = ?taskdefs, "launching subdomain");
        let mut set = JoinSet::new();
        for taskdef in taskdefs {
            let this = self.clone();
            let subdomain = subdomain.to_string();
            let taskdef = taskdef.clone();
            let param = param.clone();
            set.spawn(async move { this.launch_task(&subdomain, &taskdef, &param).await });
        }
        join_all(set).await
    }

    async fn logs(
        &self,
        subdomain: &str,
        since: Option<DateTime<Utc>>,
        tail: usize,
    ) -> Result<Vec<String>> {
        let infos = self.find(subdomain).await?;
        if infos.is_empty() {
            return Err(Error::Validation(format!(
                "subdomain {subdomain} is not found"
            )));
        }

        let mut logs = Vec::new();
        for info in &infos {
            let options = LogsOptions::<String> {
                stdout: true,
                stderr: true,
                since: since.map(|t| t.timestamp()).unwrap_or(0),
                tail: if tail > 0 {
                    tail.to_string()
                } else {
                    "all".to_string()
                },
                ..Default::default()
            };
            let mut stream = self.docker.logs(&info.id, Some(options));
            while let Some(entry) = stream.next().await {
                match entry {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => {
                        if let Ok(line) = String::from_utf8(message.to_vec()) {
                            let line = line.trim_end();
                            if !line.is_empty() {
                                logs.push(line.to_string());
                            }
                        }
                    }
                    Ok(LogOutput::StdIn { .. }) => {}
                    Err(err) => {
                        warn!(id = %info.id, error = %err, "failed to get log events");
                        break;
                    }
                }
            }
        }
        if tail > 0 && logs.len() > tail {
            logs.drain(..logs.len() - tail);
        }
        Ok(logs)
    }

    async fn trace(&self, id: &str) -> Result<String> {
        let inspect = self.docker.inspect_container(id, None).await?;
        serde_json::to_string_pretty(&inspect)
            .map_err(|e| Error::ClusterApi(format!("failed to render trace: {e}")))
    }

    async fn terminate(&self, id: &str) -> Result<()> {
        info!(id = %id, "stop task");
        match self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped or already gone is a success for terminate.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn terminate_by_subdomain(&self, subdomain: &str) -> Result<()> {
        let infos = self.find(subdomain).await?;
        self.send_proxy_control(ProxyControl::Remove {
            subdomain: subdomain.to_string(),
        });

        let mut set = JoinSet::new();
        for info in infos {
            let this = self.clone();
            set.spawn(async move { this.terminate(&info.id).await });
        }
        join_all(set).await
    }

    async fn list(&self, desired_status: &str) -> Result<Vec<TaskInfo>> {
        debug!(status = %desired_status, "list cluster tasks");
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{TAG_MANAGED_BY}={TAG_VALUE_GATEWAY}")],
        );
        match desired_status {
            STATUS_RUNNING => {
                filters.insert("status".to_string(), vec!["running".to_string()]);
            }
            STATUS_STOPPED => {
                filters.insert("status".to_string(), vec!["exited".to_string()]);
            }
            _ => {}
        }

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        let mut infos = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else { continue };
            match self.task_info(&id).await {
                Ok(info) => infos.push(info),
                Err(err) => warn!(id = %id, error = %err, "failed to describe task"),
            }
        }
        infos.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        Ok(infos)
    }

    fn set_proxy_control_channel(&self, tx: ProxyControlSender) {
        *self.proxy_ch.lock() = Some(tx);
    }

    async fn get_access_count(&self, subdomain: &str, duration: Duration) -> Result<i64> {
        // The metric store period granularity is one minute.
        let truncated = Duration::from_secs(duration.as_secs() / 60 * 60);
        self.metrics.sum(subdomain, truncated).await
    }

    async fn put_access_counts(&self, counts: HashMap<String, AccessCount>) -> Result<()> {
        let mut datums = Vec::new();
        for (subdomain, buckets) in counts {
            for (timestamp, count) in buckets {
                debug!(subdomain = %subdomain, ts = %timestamp.to_rfc3339(), count, "publish access count");
                datums.push(AccessDatum {
                    subdomain: subdomain.clone(),
                    timestamp,
                    count,
                });
            }
        }
        let calls = datums
            .chunks(MAX_DATUMS_PER_CALL)
            .map(|chunk| self.metrics.put(chunk.to_vec()));
        futures::future::try_join_all(calls).await?;
        Ok(())
    }
}

async fn join_all(mut set: JoinSet<Result<()>>) -> Result<()> {
    let mut first_err = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
            Err(err) => {
                if first_err.is_none() {
                    first_err = Some(Error::ClusterApi(format!("task panicked: {err}")));
                }
            }
        }
    }
    match first_err {
        None => Ok(()),
        Some(err) => Err(err),
    }
}

/// Connect to the Docker endpoint: explicit host, then DOCKER_HOST,
/// then the platform default socket.
async fn connect(docker_host: Option<&str>) -> Result<Docker> {
    let docker = if let Some(host) = docker_host {
        connect_to_host(host)?
    } else if let Ok(host) = std::env::var("DOCKER_HOST") {
        connect_to_host(&host)?
    } else {
        Docker::connect_with_socket_defaults()
            .map_err(|e| Error::ClusterApi(format!("cannot connect to cluster backend: {e}")))?
    };

    docker
        .ping()
        .await
        .map_err(|e| Error::ClusterApi(format!("cluster backend is not responding: {e}")))?;
    debug!("connected to cluster backend");
    Ok(docker)
}

fn connect_to_host(host: &str) -> Result<Docker> {
    if let Some(path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| Error::ClusterApi(format!("cannot connect to socket {path}: {e}")))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| Error::ClusterApi(format!("cannot connect to endpoint {host}: {e}")))
    } else {
        Err(Error::Config(format!(
            "invalid docker_host {host}: expected unix:///path or tcp://host:port"
        )))
    }
}

fn parse_env_list(list: &[String]) -> HashMap<String, String> {
    list.iter()
        .filter_map(|entry| entry.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Trailing segment of the task id, the way operators see it.
fn short_id(id: &str) -> String {
    let tail = id.rsplit('/').next().unwrap_or(id);
    tail.chars().take(12).collect()
}

fn ip_address(inspect: &ContainerInspectResponse, preferred_network: Option<&str>) -> String {
    let Some(networks) = inspect
        .network_settings
        .as_ref()
        .and_then(|ns| ns.networks.as_ref())
    else {
        return String::new();
    };
    if let Some(name) = preferred_network {
        if let Some(ip) = networks
            .get(name)
            .and_then(|ep| ep.ip_address.clone())
            .filter(|ip| !ip.is_empty())
        {
            return ip;
        }
    }
    networks
        .values()
        .filter_map(|ep| ep.ip_address.clone())
        .find(|ip| !ip.is_empty())
        .unwrap_or_default()
}

fn parse_cluster_time(raw: &str) -> Option<DateTime<Local>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Local))
}

/// Container names are restricted to [a-zA-Z0-9_.-]; glob characters in
/// a subdomain pattern are flattened out.
fn container_name(subdomain: &str, taskdef: &str) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '-'
                }
            })
            .collect()
    };
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "envgate-{}-{}-{}",
        sanitize(subdomain),
        sanitize(taskdef),
        &suffix[..8]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{EndpointSettings, NetworkSettings};

    #[test]
    fn test_parse_env_list() {
        let env = parse_env_list(&[
            "GIT_BRANCH=develop".to_string(),
            "SUBDOMAINRAW=feature-x".to_string(),
            "NOEQUALS".to_string(),
            "WITH=EQ=UALS".to_string(),
        ]);
        assert_eq!(env.get("GIT_BRANCH").unwrap(), "develop");
        assert_eq!(env.get("WITH").unwrap(), "EQ=UALS");
        assert!(!env.contains_key("NOEQUALS"));
    }

    #[test]
    fn test_short_id() {
        assert_eq!(
            short_id("9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"),
            "9f86d081884c"
        );
        assert_eq!(short_id("arn-ish/cluster/abcdef123456"), "abcdef123456");
        assert_eq!(short_id("short"), "short");
    }

    #[test]
    fn test_container_name_sanitizes_glob_meta() {
        let name = container_name("pr-*", "app");
        assert!(name.starts_with("envgate-pr---app-"));
        assert!(name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'));
    }

    #[test]
    fn test_ip_address_prefers_configured_network() {
        let mut networks = HashMap::new();
        networks.insert(
            "bridge".to_string(),
            EndpointSettings {
                ip_address: Some("172.17.0.2".to_string()),
                ..Default::default()
            },
        );
        networks.insert(
            "edge-net".to_string(),
            EndpointSettings {
                ip_address: Some("10.1.0.2".to_string()),
                ..Default::default()
            },
        );
        let inspect = ContainerInspectResponse {
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(ip_address(&inspect, Some("edge-net")), "10.1.0.2");
        assert!(!ip_address(&inspect, None).is_empty());
        assert_eq!(ip_address(&ContainerInspectResponse::default(), None), "");
    }

    #[test]
    fn test_parse_cluster_time() {
        let t = parse_cluster_time("2024-11-07T11:22:33.123456789Z").unwrap();
        assert_eq!(t.with_timezone(&Utc).timestamp(), 1730978553);
        assert!(parse_cluster_time("not a time").is_none());
    }
}
