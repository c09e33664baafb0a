//! Gateway configuration: YAML with environment interpolation, loadable
//! from a local path or an object-storage URL. Immutable after load.

use crate::auth::Auth;
use crate::error::{Error, Result};
use crate::purge::PurgeConfig;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_PORT: u16 = 80;

/// Hard timeout for cluster API calls issued by control-plane operations.
pub const API_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Options resolved from the command line before the config file loads.
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    pub path: Option<String>,
    pub domain: String,
    pub local_mode: bool,
    pub default_port: u16,
    pub compat_v1: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub listen: Listen,

    #[serde(default)]
    pub network: Network,

    /// Launch parameters accepted by the control API.
    #[serde(default)]
    pub parameters: Vec<Parameter>,

    /// Named task definitions launchable by subdomain.
    #[serde(default)]
    pub taskdefs: HashMap<String, TaskDef>,

    #[serde(default)]
    pub cluster: ClusterConfig,

    pub auth: Option<Auth>,

    pub purge: Option<PurgeConfig>,

    #[serde(skip)]
    pub local_mode: bool,

    #[serde(skip)]
    pub compat_v1: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HostConfig {
    /// Host serving the web/API surface (e.g. "envgate.dev.example.net").
    #[serde(default)]
    pub web_api: String,

    /// Domain suffix under which subdomains are routed (leading dot).
    #[serde(default)]
    pub reverse_proxy_suffix: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Listen {
    #[serde(default)]
    pub foreign_address: String,

    #[serde(default)]
    pub http: Vec<PortMap>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortMap {
    pub listen: u16,
    pub target: u16,
    #[serde(default)]
    pub require_auth_cookie: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Network {
    /// Upstream proxy timeout in seconds. Zero means unlimited.
    #[serde(default)]
    pub proxy_timeout: u64,
}

/// One declared launch parameter, materialised as a container
/// environment variable and a task tag.
#[derive(Debug, Clone, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub env: String,
    #[serde(default)]
    pub rule: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub description: String,
    #[serde(skip)]
    pub regex: Option<Regex>,
}

/// A named, versioned container specification.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDef {
    /// Container image reference (cluster mode).
    pub image: Option<String>,
    /// Command line for local-mode child processes.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default = "default_target_port")]
    pub target_port: u16,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_target_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ClusterConfig {
    /// Docker endpoint ("unix:///..." or "tcp://..."); falls back to
    /// DOCKER_HOST and then platform defaults.
    pub docker_host: Option<String>,
    /// Docker network attached to launched tasks.
    pub network: Option<String>,
    pub default_taskdef: Option<String>,
}

impl Config {
    /// Load configuration, layering the file (local path or object URL)
    /// over the defaults derived from the command-line options.
    pub async fn load(opts: &ConfigOptions) -> Result<Config> {
        let content = match &opts.path {
            None => {
                info!(
                    domain = %opts.domain,
                    "no config file specified, using default config"
                );
                None
            }
            Some(path) => {
                info!(path = %path, "loading config file");
                Some(load_source(path).await?)
            }
        };
        Self::from_yaml(content.as_deref(), opts)
    }

    /// Build a config from YAML content (None means defaults only).
    pub fn from_yaml(content: Option<&str>, opts: &ConfigOptions) -> Result<Config> {
        let mut cfg: Config = match content {
            Some(raw) => {
                let expanded = interpolate_env(raw);
                serde_yaml::from_str(&expanded)
                    .map_err(|e| Error::Config(format!("cannot parse config: {e}")))?
            }
            None => Config::default(),
        };
        cfg.local_mode = opts.local_mode;
        cfg.compat_v1 = opts.compat_v1;
        cfg.apply_defaults(opts)?;
        Ok(cfg)
    }

    fn apply_defaults(&mut self, opts: &ConfigOptions) -> Result<()> {
        let mut domain = opts.domain.clone();
        if !domain.starts_with('.') {
            domain = format!(".{domain}");
        }
        let default_port = if opts.default_port == 0 {
            DEFAULT_PORT
        } else {
            opts.default_port
        };

        if self.host.web_api.is_empty() {
            self.host.web_api = format!("envgate{domain}");
        }
        if self.host.reverse_proxy_suffix.is_empty() {
            self.host.reverse_proxy_suffix = domain.clone();
        }
        if self.listen.foreign_address.is_empty() {
            self.listen.foreign_address = "0.0.0.0".to_string();
        }
        if self.listen.http.is_empty() {
            self.listen.http.push(PortMap {
                listen: default_port,
                target: default_port,
                require_auth_cookie: false,
            });
        }

        if self.local_mode {
            info!("local mode: setting host suffix to .localtest.me");
            self.host.reverse_proxy_suffix = ".localtest.me".to_string();
            self.host.web_api = "envgate.localtest.me".to_string();
            info!(
                "You can access to http://envgate.localtest.me:{}/",
                self.listen.http[0].listen
            );
        }

        // The branch parameter is always declared.
        if !self.parameters.iter().any(|p| p.name == "branch") {
            self.parameters.push(Parameter {
                name: "branch".to_string(),
                env: "GIT_BRANCH".to_string(),
                rule: String::new(),
                required: true,
                default: String::new(),
                description: String::new(),
                regex: None,
            });
        }
        for param in &mut self.parameters {
            if !param.rule.is_empty() {
                let regex = Regex::new(&param.rule).map_err(|e| {
                    Error::Config(format!("invalid parameter rule: {}: {e}", param.rule))
                })?;
                param.regex = Some(regex);
            }
        }

        if let Some(auth) = &mut self.auth {
            auth.ensure_cookie_secret();
        }
        if let Some(purge) = &mut self.purge {
            purge
                .validate()
                .map_err(|e| Error::Config(format!("invalid purge config: {e}")))?;
        }
        Ok(())
    }

    /// How the SUBDOMAIN environment variable is encoded. Legacy (v1)
    /// containers decoded a base64url value; v2 passes it raw.
    pub fn encode_subdomain(&self, subdomain: &str) -> String {
        if self.compat_v1 {
            crate::runner::encode_tag_value(subdomain)
        } else {
            subdomain.to_string()
        }
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.network.proxy_timeout)
    }

    pub fn task_def(&self, name: &str) -> Option<&TaskDef> {
        self.taskdefs.get(name)
    }
}

/// Expand `{{ env "NAME" "default" }}` templates at load time.
fn interpolate_env(content: &str) -> String {
    let re = Regex::new(r#"\{\{\s*env\s+"([^"]+)"(?:\s+"([^"]*)")?\s*\}\}"#)
        .expect("env template pattern compiles");
    re.replace_all(content, |caps: &regex::Captures| {
        let name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

async fn load_source(path: &str) -> Result<String> {
    if path.starts_with("http://") || path.starts_with("https://") {
        let resp = reqwest::get(path)
            .await
            .map_err(|e| Error::Config(format!("cannot load config: {path}: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::Config(format!(
                "cannot load config: {path}: status {}",
                resp.status()
            )));
        }
        resp.text()
            .await
            .map_err(|e| Error::Config(format!("cannot load config: {path}: {e}")))
    } else if path.starts_with("s3://") {
        Err(Error::Config(format!(
            "cannot load config: {path}: s3:// is not dialable directly, \
             use a presigned or public https:// object URL"
        )))
    } else {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("cannot load config: {path}: {e}")))
    }
}
