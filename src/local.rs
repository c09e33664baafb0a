//! LocalRunner: in-process child processes standing in for the cluster
//! backend, for development and tests

use crate::config::Config;
use crate::counter::AccessCount;
use crate::error::{Error, Result};
use crate::metrics::{AccessDatum, MetricStore, MAX_DATUMS_PER_CALL};
use crate::registry::{ProxyControl, ProxyControlSender};
use crate::runner::{
    TaskInfo, TaskParameter, TaskRunner, STATUS_RUNNING, STATUS_STOPPED, TAG_TASKDEF,
};
use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const LOG_BUFFER_CAP: usize = 10_000;

type LogBuffer = Arc<Mutex<VecDeque<(DateTime<Utc>, String)>>>;

struct LocalTask {
    id: String,
    subdomain: String,
    taskdef: String,
    target_port: u16,
    created: DateTime<Local>,
    env: HashMap<String, String>,
    tags: HashMap<String, String>,
    child: tokio::sync::Mutex<Child>,
    logs: LogBuffer,
}

impl LocalTask {
    async fn last_status(&self) -> String {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(None) => STATUS_RUNNING.to_string(),
            _ => STATUS_STOPPED.to_string(),
        }
    }

    async fn info(&self) -> TaskInfo {
        TaskInfo {
            id: self.id.clone(),
            short_id: self.id.chars().take(12).collect(),
            subdomain: self.subdomain.clone(),
            branch: self.env.get("GIT_BRANCH").cloned().unwrap_or_default(),
            taskdef: self.taskdef.clone(),
            ip_address: "127.0.0.1".to_string(),
            created: Some(self.created),
            last_status: self.last_status().await,
            port_map: HashMap::from([(self.taskdef.clone(), self.target_port)]),
            env: self.env.clone(),
            tags: self.tags.clone(),
        }
    }
}

#[derive(Clone)]
pub struct LocalRunner {
    cfg: Arc<Config>,
    metrics: Arc<dyn MetricStore>,
    tasks: Arc<DashMap<String, Arc<LocalTask>>>,
    proxy_ch: Arc<Mutex<Option<ProxyControlSender>>>,
}

impl LocalRunner {
    pub fn new(cfg: Arc<Config>, metrics: Arc<dyn MetricStore>) -> Self {
        Self {
            cfg,
            metrics,
            tasks: Arc::new(DashMap::new()),
            proxy_ch: Arc::new(Mutex::new(None)),
        }
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

    async fn spawn_task(
        &self,
        subdomain: &str,
        taskdef: &str,
        param: &TaskParameter,
    ) -> Result<()> {
        let td = self
            .cfg
            .task_def(taskdef)
            .ok_or_else(|| Error::Validation(format!("taskdef {taskdef} is not defined")))?;
        if td.command.is_empty() {
            return Err(Error::Validation(format!("taskdef {taskdef} has no command")));
        }

        let cfg = &self.cfg;
        let mut env = td.env.clone();
        env.extend(param.to_env(subdomain, &cfg.parameters, &|s| cfg.encode_subdomain(s)));
        let mut tags = param.to_tags(subdomain, &cfg.parameters);
        tags.insert(TAG_TASKDEF.to_string(), taskdef.to_string());

        let mut child = Command::new(&td.command[0])
            .args(&td.command[1..])
            .envs(&env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::ClusterApi(format!("failed to spawn taskdef {taskdef}: {e}"))
            })?;

        let logs: LogBuffer = Arc::new(Mutex::new(VecDeque::new()));
        if let Some(stdout) = child.stdout.take() {
            stream_lines(stdout, subdomain.to_string(), Arc::clone(&logs));
        }
        if let Some(stderr) = child.stderr.take() {
            stream_lines(stderr, subdomain.to_string(), Arc::clone(&logs));
        }

        let task = Arc::new(LocalTask {
            id: uuid::Uuid::new_v4().simple().to_string(),
            subdomain: subdomain.to_string(),
            taskdef: taskdef.to_string(),
            target_port: td.target_port,
            created: Local::now(),
            env,
            tags,
            child: tokio::sync::Mutex::new(child),
            logs,
        });
        info!(subdomain = %subdomain, taskdef = %taskdef, id = %task.id, "launched local task");
        self.tasks.insert(task.id.clone(), Arc::clone(&task));

        self.send_proxy_control(ProxyControl::Add {
            subdomain: subdomain.to_string(),
            ip_address: "127.0.0.1".to_string(),
            port: td.target_port,
        });
        Ok(())
    }

    fn tasks_of(&self, subdomain: &str) -> Vec<Arc<LocalTask>> {
        self.tasks
            .iter()
            .filter(|entry| entry.value().subdomain == subdomain)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

fn stream_lines(
    reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    subdomain: String,
    logs: LogBuffer,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "task", subdomain = %subdomain, "{line}");
            let mut buf = logs.lock();
            if buf.len() >= LOG_BUFFER_CAP {
                buf.pop_front();
            }
            buf.push_back((Utc::now(), line));
        }
    });
}

#[async_trait]
impl TaskRunner for LocalRunner {
    async fn launch(
        &self,
        subdomain: &str,
        param: &TaskParameter,
        taskdefs: &[String],
    ) -> Result<()> {
        if !self.tasks_of(subdomain).is_empty() {
            info!(subdomain = %subdomain, "subdomain is already running, terminating");
            self.terminate_by_subdomain(subdomain).await?;
        }
        for taskdef in taskdefs {
            self.spawn_task(subdomain, taskdef, param).await?;
        }
        Ok(())
    }

    async fn logs(
        &self,
        subdomain: &str,
        since: Option<DateTime<Utc>>,
        tail: usize,
    ) -> Result<Vec<String>> {
        let tasks = self.tasks_of(subdomain);
        if tasks.is_empty() {
            return Err(Error::Validation(format!(
                "subdomain {subdomain} is not found"
            )));
        }
        let mut entries: Vec<(DateTime<Utc>, String)> = Vec::new();
        for task in tasks {
            let buf = task.logs.lock();
            entries.extend(
                buf.iter()
                    .filter(|(ts, _)| since.map(|s| *ts >= s).unwrap_or(true))
                    .cloned(),
            );
        }
        entries.sort_by_key(|(ts, _)| *ts);
        let mut lines: Vec<String> = entries.into_iter().map(|(_, line)| line).collect();
        if tail > 0 && lines.len() > tail {
            lines.drain(..lines.len() - tail);
        }
        Ok(lines)
    }

    async fn trace(&self, id: &str) -> Result<String> {
        let task = self
            .tasks
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::ClusterApi(format!("task {id} is not found")))?;
        let info = task.info().await;
        serde_json::to_string_pretty(&info)
            .map_err(|e| Error::ClusterApi(format!("failed to render trace: {e}")))
    }

    async fn terminate(&self, id: &str) -> Result<()> {
        let Some((_, task)) = self.tasks.remove(id) else {
            return Err(Error::ClusterApi(format!("task {id} is not found")));
        };
        info!(id = %id, subdomain = %task.subdomain, "stop local task");
        let mut child = task.child.lock().await;
        if let Err(err) = child.start_kill() {
            warn!(id = %id, error = %err, "failed to kill local task");
        }
        Ok(())
    }

    async fn terminate_by_subdomain(&self, subdomain: &str) -> Result<()> {
        self.send_proxy_control(ProxyControl::Remove {
            subdomain: subdomain.to_string(),
        });
        for task in self.tasks_of(subdomain) {
            self.terminate(&task.id).await?;
        }
        Ok(())
    }

    async fn list(&self, desired_status: &str) -> Result<Vec<TaskInfo>> {
        let tasks: Vec<Arc<LocalTask>> = self
            .tasks
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut infos = Vec::with_capacity(tasks.len());
        for task in tasks {
            let info = task.info().await;
            if info.last_status == desired_status {
                infos.push(info);
            }
        }
        infos.sort_by(|a, b| a.subdomain.cmp(&b.subdomain));
        Ok(infos)
    }

    fn set_proxy_control_channel(&self, tx: ProxyControlSender) {
        *self.proxy_ch.lock() = Some(tx);
    }

    async fn get_access_count(&self, subdomain: &str, duration: Duration) -> Result<i64> {
        let truncated = Duration::from_secs(duration.as_secs() / 60 * 60);
        self.metrics.sum(subdomain, truncated).await
    }

    async fn put_access_counts(&self, counts: HashMap<String, AccessCount>) -> Result<()> {
        let mut datums = Vec::new();
        for (subdomain, buckets) in counts {
            for (timestamp, count) in buckets {
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
