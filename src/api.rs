//! HTTP control surface: the JSON API group plus the web group with
//! origin checking and auth-cookie issuance

use crate::auth::origin_allowed;
use crate::config::{Config, API_CALL_TIMEOUT};
use crate::error::{Error, Result};
use crate::purge::{PurgeController, PurgeRequest};
use crate::runner::{TaskParameter, TaskRunner, STATUS_RUNNING, STATUS_STOPPED};
use crate::transport::ProxyBody;
use chrono::{DateTime, Utc};
use glob::Pattern;
use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, ORIGIN, SET_COOKIE};
use hyper::{Method, Request, Response, StatusCode};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::{error, warn};

#[derive(Serialize)]
struct ApiListResponse {
    result: Vec<crate::runner::TaskInfo>,
}

#[derive(Serialize)]
struct ApiCommonResponse {
    result: String,
}

#[derive(Serialize)]
struct ApiLogsResponse {
    result: Vec<String>,
}

#[derive(Serialize)]
struct ApiAccessResponse {
    result: String,
    duration: i64,
    sum: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct LaunchRequest {
    #[serde(default)]
    pub subdomain: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub taskdef: Vec<String>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

impl LaunchRequest {
    fn get_parameter(&self, key: &str) -> String {
        if key == "branch" {
            return self.branch.clone();
        }
        self.parameters.get(key).cloned().unwrap_or_default()
    }
}

/// Accept `taskdef` as a single string or a list.
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

#[derive(Debug, Default, Deserialize)]
pub struct TerminateRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub subdomain: String,
}

/// Shared state behind every control-surface request. The proxy routes
/// requests here when the Host header names the web-api host.
pub struct ApiState {
    cfg: Arc<Config>,
    runner: Arc<dyn TaskRunner>,
    purge: Arc<PurgeController>,
}

impl ApiState {
    pub fn new(cfg: Arc<Config>, runner: Arc<dyn TaskRunner>, purge: Arc<PurgeController>) -> Self {
        Self { cfg, runner, purge }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send,
        B::Error: std::fmt::Display,
    {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);
        let headers = req.headers().clone();
        let is_api = path.starts_with("/api/");

        if is_api {
            if let Some(denied) = self.gate_api(&method, &headers) {
                return denied;
            }
        }
        let set_cookie = if is_api {
            None
        } else {
            match self.gate_web(&method, &headers) {
                Ok(cookie) => cookie,
                Err(denied) => return denied,
            }
        };

        let body = if method == Method::POST {
            match req.into_body().collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(err) => {
                    warn!(error = %err, "cannot read request body");
                    return error_response(&Error::Validation(
                        "cannot read request body".to_string(),
                    ));
                }
            }
        } else {
            Bytes::new()
        };
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let mut resp = match (&method, path.as_str()) {
            (&Method::GET, "/api/list") => self.api_list().await,
            (&Method::POST, "/api/launch") => self.api_launch(&content_type, &body).await,
            (&Method::POST, "/api/terminate") => self.api_terminate(&content_type, &body).await,
            (&Method::GET, "/api/logs") => self.api_logs(query.as_deref()).await,
            (&Method::GET, "/api/access") => self.api_access(query.as_deref()).await,
            (&Method::POST, "/api/purge") => self.api_purge(&body).await,
            (&Method::GET, "/") => self.web_list().await,
            (&Method::GET, p) if p.starts_with("/trace/") => {
                self.web_trace(p.trim_start_matches("/trace/")).await
            }
            (&Method::POST, "/launch") => self.api_launch(&content_type, &body).await,
            (&Method::POST, "/terminate") => self.api_terminate(&content_type, &body).await,
            _ => text_response(StatusCode::NOT_FOUND, "not found"),
        };

        if let Some(cookie) = set_cookie {
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                resp.headers_mut().insert(SET_COOKIE, value);
            }
        }
        resp
    }

    /// API group: content-type gate plus token-only auth.
    fn gate_api(&self, method: &Method, headers: &HeaderMap) -> Option<Response<ProxyBody>> {
        if method == Method::POST && !self.cfg.compat_v1 {
            let content_type = headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !content_type.starts_with("application/json") {
                warn!(content_type = %content_type, "invalid content type");
                return Some(error_response(&Error::Validation(format!(
                    "invalid content type: {content_type}"
                ))));
            }
        }
        if let Some(auth) = &self.cfg.auth {
            if !auth.authorize_api(headers) {
                warn!("all auth methods failed");
                return Some(error_response(&Error::Auth("unauthorized".to_string())));
            }
        }
        None
    }

    /// Web group: any configured auth method, origin check on POST, and
    /// the auth cookie issued on success.
    fn gate_web(
        &self,
        method: &Method,
        headers: &HeaderMap,
    ) -> std::result::Result<Option<String>, Response<ProxyBody>> {
        let Some(auth) = &self.cfg.auth else {
            return Ok(None);
        };
        if !auth.authorize_web(headers) {
            warn!("all auth methods failed");
            return Err(error_response(&Error::Auth("unauthorized".to_string())));
        }
        if method == Method::POST {
            let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok()).unwrap_or("");
            if !origin_allowed(origin, &self.cfg.host.web_api) {
                warn!(origin = %origin, "origin is not allowed");
                return Err(error_response(&Error::Forbidden(format!(
                    "origin is not allowed: {origin}"
                ))));
            }
        }
        match auth.new_auth_cookie(&self.cfg.host.reverse_proxy_suffix) {
            Ok(cookie) => Ok(Some(cookie)),
            Err(err) => {
                error!(error = %err, "failed to create auth cookie");
                Err(error_response(&Error::ClusterApi(
                    "failed to create auth cookie".to_string(),
                )))
            }
        }
    }

    async fn api_list(&self) -> Response<ProxyBody> {
        match self.runner.list(STATUS_RUNNING).await {
            Ok(result) => json_response(StatusCode::OK, &ApiListResponse { result }),
            Err(err) => {
                error!(error = %err, "list failed");
                json_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    &ApiListResponse { result: Vec::new() },
                )
            }
        }
    }

    async fn api_launch(&self, content_type: &str, body: &[u8]) -> Response<ProxyBody> {
        let request = match parse_launch(content_type, body) {
            Ok(r) => r,
            Err(err) => {
                error!(error = %err, "launch failed");
                return error_response(&err);
            }
        };
        match self.launch(request).await {
            Ok(()) => json_response(
                StatusCode::OK,
                &ApiCommonResponse {
                    result: "ok".to_string(),
                },
            ),
            Err(err) => {
                error!(error = %err, "launch failed");
                error_response(&err)
            }
        }
    }

    async fn launch(&self, request: LaunchRequest) -> Result<()> {
        let subdomain = request.subdomain.to_lowercase();
        validate_subdomain(&subdomain)?;

        let mut taskdefs = request.taskdef.clone();
        if taskdefs.is_empty() {
            if let Some(default) = &self.cfg.cluster.default_taskdef {
                taskdefs.push(default.clone());
            }
        }
        if subdomain.is_empty() || taskdefs.is_empty() {
            return Err(Error::Validation(format!(
                "parameter required: subdomain={subdomain}, taskdef={taskdefs:?}"
            )));
        }
        let parameter = load_parameter(&self.cfg.parameters, &|key| request.get_parameter(key))?;

        match tokio::time::timeout(
            API_CALL_TIMEOUT,
            self.runner.launch(&subdomain, &parameter, &taskdefs),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::ClusterApi("launch timed out".to_string())),
        }
    }

    async fn api_terminate(&self, content_type: &str, body: &[u8]) -> Response<ProxyBody> {
        let request: TerminateRequest = match parse_terminate(content_type, body) {
            Ok(r) => r,
            Err(err) => return error_response(&err),
        };
        let result = if !request.id.is_empty() {
            tokio::time::timeout(API_CALL_TIMEOUT, self.runner.terminate(&request.id))
                .await
                .unwrap_or_else(|_| Err(Error::ClusterApi("terminate timed out".to_string())))
        } else if !request.subdomain.is_empty() {
            tokio::time::timeout(
                API_CALL_TIMEOUT,
                self.runner.terminate_by_subdomain(&request.subdomain),
            )
            .await
            .unwrap_or_else(|_| Err(Error::ClusterApi("terminate timed out".to_string())))
        } else {
            Err(Error::Validation(
                "parameter required: id or subdomain".to_string(),
            ))
        };
        match result {
            Ok(()) => json_response(
                StatusCode::OK,
                &ApiCommonResponse {
                    result: "ok".to_string(),
                },
            ),
            Err(err) => {
                error!(error = %err, "terminate failed");
                error_response(&err)
            }
        }
    }

    async fn api_logs(&self, query: Option<&str>) -> Response<ProxyBody> {
        match self.logs(query).await {
            Ok(result) => json_response(StatusCode::OK, &ApiLogsResponse { result }),
            Err(err) => error_response(&err),
        }
    }

    async fn logs(&self, query: Option<&str>) -> Result<Vec<String>> {
        let params = parse_query(query);
        let subdomain = params.get("subdomain").cloned().unwrap_or_default();
        if subdomain.is_empty() {
            return Err(Error::Validation("parameter required: subdomain".to_string()));
        }
        let since = match params.get("since") {
            None => None,
            Some(raw) if raw.is_empty() => None,
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| Error::Validation(format!("cannot parse since: {e}")))?
                    .with_timezone(&Utc),
            ),
        };
        let tail = match params.get("tail").map(String::as_str) {
            None | Some("") | Some("all") => 0,
            Some(raw) => raw
                .parse()
                .map_err(|e| Error::Validation(format!("cannot parse tail: {e}")))?,
        };
        tokio::time::timeout(API_CALL_TIMEOUT, self.runner.logs(&subdomain, since, tail))
            .await
            .unwrap_or_else(|_| Err(Error::ClusterApi("logs timed out".to_string())))
    }

    async fn api_access(&self, query: Option<&str>) -> Response<ProxyBody> {
        let params = parse_query(query);
        let subdomain = params.get("subdomain").cloned().unwrap_or_default();
        let duration = params
            .get("duration")
            .and_then(|raw| raw.parse::<i64>().ok())
            .filter(|d| *d > 0)
            .unwrap_or(86400);
        match self
            .runner
            .get_access_count(&subdomain, std::time::Duration::from_secs(duration as u64))
            .await
        {
            Ok(sum) => json_response(
                StatusCode::OK,
                &ApiAccessResponse {
                    result: "ok".to_string(),
                    duration,
                    sum,
                },
            ),
            Err(err) => {
                error!(error = %err, "access counter failed");
                error_response(&err)
            }
        }
    }

    async fn api_purge(&self, body: &[u8]) -> Response<ProxyBody> {
        let request: PurgeRequest = match serde_json::from_slice(body) {
            Ok(r) => r,
            Err(err) => {
                error!(error = %err, "purge failed");
                return error_response(&Error::Validation(err.to_string()));
            }
        };
        let params = match request.validate() {
            Ok(p) => p,
            Err(err) => {
                error!(error = %err, "purge failed");
                return error_response(&err);
            }
        };
        match self.purge.purge(&params).await {
            Ok(()) => json_response(
                StatusCode::OK,
                &ApiCommonResponse {
                    result: "accepted".to_string(),
                },
            ),
            Err(err) => error_response(&err),
        }
    }

    /// Running tasks first, then one stopped generation per subdomain.
    async fn web_list(&self) -> Response<ProxyBody> {
        let running = match self.runner.list(STATUS_RUNNING).await {
            Ok(infos) => infos,
            Err(err) => return error_response(&err),
        };
        let mut stopped = match self.runner.list(STATUS_STOPPED).await {
            Ok(infos) => infos,
            Err(err) => return error_response(&err),
        };
        stopped.sort_by_key(|info| info.created);
        let mut seen = std::collections::HashSet::new();
        stopped.retain(|info| seen.insert(info.subdomain.clone()));

        let mut result = running;
        result.extend(stopped);
        json_response(StatusCode::OK, &ApiListResponse { result })
    }

    async fn web_trace(&self, id: &str) -> Response<ProxyBody> {
        if id.is_empty() {
            return error_response(&Error::Validation("taskid required".to_string()));
        }
        match self.runner.trace(id).await {
            Ok(trace) => text_response(StatusCode::OK, &trace),
            Err(err) => error_response(&err),
        }
    }
}

/// Resolve each declared parameter from the request, falling back to its
/// default, and enforce required/rule/length constraints.
pub fn load_parameter(
    params: &[crate::config::Parameter],
    get: &dyn Fn(&str) -> String,
) -> Result<TaskParameter> {
    let mut parameter = TaskParameter::default();
    for decl in params {
        let mut value = get(&decl.name);
        if value.is_empty() && !decl.default.is_empty() {
            value = decl.default.clone();
        }
        if value.is_empty() {
            if decl.required {
                return Err(Error::Validation(format!(
                    "lack require parameter: {}",
                    decl.name
                )));
            }
            continue;
        }
        if let Some(regex) = &decl.regex {
            if !regex.is_match(&value) {
                return Err(Error::Validation(format!(
                    "parameter {} value is rule error",
                    decl.name
                )));
            }
        }
        if value.chars().count() > 255 {
            return Err(Error::Validation(format!(
                "parameter {} value is too long (max 255 unicode characters)",
                decl.name
            )));
        }
        parameter.0.insert(decl.name.clone(), value);
    }
    Ok(parameter)
}

/// DNS label with glob metacharacters allowed.
pub fn validate_subdomain(s: &str) -> Result<()> {
    static DNS_NAME_WITH_PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = DNS_NAME_WITH_PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z*?\[\]][a-zA-Z0-9*?\[\]-]{0,61}[a-zA-Z0-9*?\[\]]$")
            .expect("subdomain pattern compiles")
    });

    if s.is_empty() {
        return Err(Error::Validation("subdomain is empty".to_string()));
    }
    if s.len() < 2 {
        return Err(Error::Validation("subdomain is too short".to_string()));
    }
    if s.len() > 63 {
        return Err(Error::Validation("subdomain is too long".to_string()));
    }
    if !re.is_match(s) {
        return Err(Error::Validation(format!(
            "subdomain {s} includes invalid characters"
        )));
    }
    Pattern::new(s).map_err(|e| Error::Validation(format!("invalid subdomain pattern: {e}")))?;
    Ok(())
}

fn parse_launch(content_type: &str, body: &[u8]) -> Result<LaunchRequest> {
    if content_type.starts_with("application/x-www-form-urlencoded") {
        let mut request = LaunchRequest::default();
        for (key, value) in parse_form(body) {
            match key.as_str() {
                "subdomain" => request.subdomain = value,
                "branch" => request.branch = value,
                "taskdef" => request.taskdef.push(value),
                _ => {
                    request.parameters.entry(key).or_insert(value);
                }
            }
        }
        Ok(request)
    } else {
        serde_json::from_slice(body).map_err(|e| Error::Validation(e.to_string()))
    }
}

fn parse_terminate(content_type: &str, body: &[u8]) -> Result<TerminateRequest> {
    if content_type.starts_with("application/x-www-form-urlencoded") {
        let mut request = TerminateRequest::default();
        for (key, value) in parse_form(body) {
            match key.as_str() {
                "id" => request.id = value,
                "subdomain" => request.subdomain = value,
                _ => {}
            }
        }
        Ok(request)
    } else {
        serde_json::from_slice(body).map_err(|e| Error::Validation(e.to_string()))
    }
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some(query) = query else {
        return params;
    };
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(percent_decode(key))
            .or_insert_with(|| percent_decode(value));
    }
    params
}

fn parse_form(body: &[u8]) -> Vec<(String, String)> {
    let Ok(raw) = std::str::from_utf8(body) else {
        return Vec::new();
    };
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (percent_decode(key), percent_decode(value))
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                let hex = bytes.get(i + 1..i + 3);
                match hex.and_then(|h| std::str::from_utf8(h).ok()) {
                    Some(h) => match u8::from_str_radix(h, 16) {
                        Ok(b) => {
                            out.push(b);
                            i += 3;
                        }
                        Err(_) => {
                            out.push(b'%');
                            i += 1;
                        }
                    },
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ProxyBody> {
    let body = serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

fn text_response(status: StatusCode, body: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from(body.to_string()))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum and static header")
}

fn error_response(err: &Error) -> Response<ProxyBody> {
    json_response(
        err.status_code(),
        &ApiCommonResponse {
            result: err.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Auth, TokenAuth};
    use crate::config::{ConfigOptions, Parameter};
    use crate::counter::AccessCount;
    use crate::registry::ProxyControlSender;
    use crate::runner::TaskInfo;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct RecordingRunner {
        launched: Mutex<Vec<(String, Vec<String>)>>,
        terminated: Mutex<Vec<String>>,
    }

    impl RecordingRunner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                launched: Mutex::new(Vec::new()),
                terminated: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TaskRunner for RecordingRunner {
        async fn launch(
            &self,
            subdomain: &str,
            _param: &TaskParameter,
            taskdefs: &[String],
        ) -> Result<()> {
            self.launched
                .lock()
                .push((subdomain.to_string(), taskdefs.to_vec()));
            Ok(())
        }

        async fn logs(
            &self,
            _subdomain: &str,
            _since: Option<DateTime<Utc>>,
            tail: usize,
        ) -> Result<Vec<String>> {
            let lines = vec!["one".to_string(), "two".to_string(), "three".to_string()];
            Ok(if tail > 0 && lines.len() > tail {
                lines[lines.len() - tail..].to_vec()
            } else {
                lines
            })
        }

        async fn trace(&self, id: &str) -> Result<String> {
            Ok(format!("trace of {id}"))
        }

        async fn terminate(&self, id: &str) -> Result<()> {
            self.terminated.lock().push(format!("id:{id}"));
            Ok(())
        }

        async fn terminate_by_subdomain(&self, subdomain: &str) -> Result<()> {
            self.terminated.lock().push(format!("subdomain:{subdomain}"));
            Ok(())
        }

        async fn list(&self, _desired_status: &str) -> Result<Vec<TaskInfo>> {
            Ok(Vec::new())
        }

        fn set_proxy_control_channel(&self, _tx: ProxyControlSender) {}

        async fn get_access_count(&self, _subdomain: &str, _duration: Duration) -> Result<i64> {
            Ok(7)
        }

        async fn put_access_counts(&self, _counts: HashMap<String, AccessCount>) -> Result<()> {
            Ok(())
        }
    }

    fn state_with(cfg: Config, runner: Arc<RecordingRunner>) -> ApiState {
        let runner: Arc<dyn TaskRunner> = runner;
        let purge = Arc::new(PurgeController::new(Arc::clone(&runner)));
        ApiState::new(Arc::new(cfg), runner, purge)
    }

    fn plain_config() -> Config {
        Config::from_yaml(
            None,
            &ConfigOptions {
                domain: "dev.example.net".to_string(),
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn authed_config() -> Config {
        let mut cfg = plain_config();
        let mut auth = Auth {
            token: Some(TokenAuth {
                header: "authorization".to_string(),
                token: "secret-token".to_string(),
            }),
            basic: None,
            signed_header: None,
            cookie_secret: String::new(),
        };
        auth.ensure_cookie_secret();
        cfg.auth = Some(auth);
        cfg
    }

    fn request(method: Method, uri: &str, body: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_of(resp: Response<ProxyBody>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_validate_subdomain() {
        for ok in ["abc", "a-b-c", "a*c", "[ab]c", "pr-123"] {
            assert!(validate_subdomain(ok).is_ok(), "{ok}");
        }
        let too_long = "a".repeat(64);
        for bad in ["", "a", "-ab", "ab-", too_long.as_str(), "ab/cd", "ab.cd"] {
            assert!(validate_subdomain(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_load_parameter() {
        let decls = vec![
            Parameter {
                name: "branch".to_string(),
                env: "GIT_BRANCH".to_string(),
                rule: String::new(),
                required: true,
                default: String::new(),
                description: String::new(),
                regex: None,
            },
            Parameter {
                name: "nick".to_string(),
                env: "NICK".to_string(),
                rule: String::new(),
                required: false,
                default: "anonymous".to_string(),
                description: String::new(),
                regex: Some(Regex::new("^[0-9a-z]+$").unwrap()),
            },
        ];

        // required parameter missing
        let err = load_parameter(&decls, &|_| String::new()).unwrap_err();
        assert!(err.to_string().contains("branch"));

        // default applies when the value is empty
        let params = load_parameter(&decls, &|key| {
            if key == "branch" {
                "develop".to_string()
            } else {
                String::new()
            }
        })
        .unwrap();
        assert_eq!(params.get("nick").unwrap(), "anonymous");

        // rule violations are rejected
        let err = load_parameter(&decls, &|key| {
            if key == "branch" {
                "develop".to_string()
            } else {
                "NOT OK".to_string()
            }
        })
        .unwrap_err();
        assert!(err.to_string().contains("rule error"));

        // values longer than 255 code points are rejected
        let err = load_parameter(&decls, &|key| {
            if key == "branch" {
                "x".repeat(256)
            } else {
                String::new()
            }
        })
        .unwrap_err();
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn test_parse_query_and_form() {
        let q = parse_query(Some("subdomain=feature-x&since=2024-01-01T00%3A00%3A00Z&tail=all"));
        assert_eq!(q.get("subdomain").unwrap(), "feature-x");
        assert_eq!(q.get("since").unwrap(), "2024-01-01T00:00:00Z");
        assert_eq!(q.get("tail").unwrap(), "all");

        let form = parse_form(b"subdomain=feature-x&branch=fix%2Fbug&nick=a+b");
        assert!(form.contains(&("branch".to_string(), "fix/bug".to_string())));
        assert!(form.contains(&("nick".to_string(), "a b".to_string())));
    }

    #[test]
    fn test_parse_launch_taskdef_forms() {
        let single: LaunchRequest =
            serde_json::from_str(r#"{"subdomain":"ab","taskdef":"app"}"#).unwrap();
        assert_eq!(single.taskdef, vec!["app".to_string()]);

        let many: LaunchRequest =
            serde_json::from_str(r#"{"subdomain":"ab","taskdef":["app","worker"]}"#).unwrap();
        assert_eq!(many.taskdef.len(), 2);

        let form = parse_launch(
            "application/x-www-form-urlencoded",
            b"subdomain=ab&branch=main&taskdef=app&nick=me",
        )
        .unwrap();
        assert_eq!(form.subdomain, "ab");
        assert_eq!(form.branch, "main");
        assert_eq!(form.taskdef, vec!["app".to_string()]);
        assert_eq!(form.parameters.get("nick").unwrap(), "me");
    }

    #[tokio::test]
    async fn test_launch_and_terminate_round_trip() {
        let runner = RecordingRunner::new();
        let state = state_with(plain_config(), Arc::clone(&runner));

        let resp = state
            .handle(request(
                Method::POST,
                "/api/launch",
                r#"{"subdomain":"Feature-X","branch":"develop","taskdef":["app"]}"#,
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_of(resp).await, r#"{"result":"ok"}"#);
        assert_eq!(
            runner.launched.lock().clone(),
            vec![("feature-x".to_string(), vec!["app".to_string()])]
        );

        let resp = state
            .handle(request(
                Method::POST,
                "/api/terminate",
                r#"{"subdomain":"feature-x"}"#,
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            runner.terminated.lock().clone(),
            vec!["subdomain:feature-x".to_string()]
        );
    }

    #[tokio::test]
    async fn test_launch_rejects_invalid_subdomain() {
        let state = state_with(plain_config(), RecordingRunner::new());
        let resp = state
            .handle(request(
                Method::POST,
                "/api/launch",
                r#"{"subdomain":"-bad-","branch":"develop","taskdef":["app"]}"#,
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_terminate_requires_id_or_subdomain() {
        let state = state_with(plain_config(), RecordingRunner::new());
        let resp = state
            .handle(request(Method::POST, "/api/terminate", "{}"))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_content_type_gate() {
        let state = state_with(plain_config(), RecordingRunner::new());
        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/launch")
            .header(CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from_static(b"{}")))
            .unwrap();
        let resp = state.handle(req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // v1 compat accepts any content type
        let mut cfg = plain_config();
        cfg.compat_v1 = true;
        let state = state_with(cfg, RecordingRunner::new());
        let req = Request::builder()
            .method(Method::POST)
            .uri("/api/terminate")
            .header(CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from(r#"{"subdomain":"ab"}"#)))
            .unwrap();
        let resp = state.handle(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_auth_gate() {
        let state = state_with(authed_config(), RecordingRunner::new());

        let resp = state.handle(request(Method::GET, "/api/list", "")).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/list")
            .header("authorization", "Bearer secret-token")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = state.handle(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_web_post_requires_matching_origin() {
        let state = state_with(authed_config(), RecordingRunner::new());

        // wrong origin is forbidden even with valid auth
        let req = Request::builder()
            .method(Method::POST)
            .uri("/terminate")
            .header("authorization", "Bearer secret-token")
            .header(ORIGIN, "https://evil.example.com")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(r#"{"subdomain":"ab"}"#)))
            .unwrap();
        let resp = state.handle(req).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        // matching origin passes and issues the auth cookie
        let req = Request::builder()
            .method(Method::POST)
            .uri("/terminate")
            .header("authorization", "Bearer secret-token")
            .header(ORIGIN, "https://envgate.dev.example.net")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(r#"{"subdomain":"ab"}"#)))
            .unwrap();
        let resp = state.handle(req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let cookie = resp.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        assert!(cookie.starts_with("envgate-auth="));
    }

    #[tokio::test]
    async fn test_api_access_defaults_duration() {
        let state = state_with(plain_config(), RecordingRunner::new());
        let resp = state
            .handle(request(Method::GET, "/api/access?subdomain=feature-x", ""))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_of(resp).await;
        assert!(body.contains(r#""duration":86400"#));
        assert!(body.contains(r#""sum":7"#));
    }

    #[tokio::test]
    async fn test_api_logs_parses_tail_and_since() {
        let state = state_with(plain_config(), RecordingRunner::new());
        let resp = state
            .handle(request(
                Method::GET,
                "/api/logs?subdomain=feature-x&tail=2",
                "",
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_of(resp).await;
        assert_eq!(body, r#"{"result":["two","three"]}"#);

        let resp = state
            .handle(request(Method::GET, "/api/logs?tail=2", ""))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = state
            .handle(request(
                Method::GET,
                "/api/logs?subdomain=x&since=notatime",
                "",
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_api_purge_validates_request() {
        let state = state_with(plain_config(), RecordingRunner::new());
        let resp = state
            .handle(request(Method::POST, "/api/purge", r#"{"duration":10}"#))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = state
            .handle(request(
                Method::POST,
                "/api/purge",
                r#"{"duration":300,"excludes":["keep"]}"#,
            ))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_of(resp).await, r#"{"result":"accepted"}"#);
    }

    #[tokio::test]
    async fn test_trace_route() {
        let state = state_with(plain_config(), RecordingRunner::new());
        let resp = state
            .handle(request(Method::GET, "/trace/task-123", ""))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_of(resp).await, "trace of task-123");
    }
}
