//! Upstream forwarding: access counting, cookie enforcement, and
//! timeout mapping around a pooled HTTP client

use crate::auth::{cookie_value, CookieValidator, AUTH_COOKIE_NAME};
use crate::counter::AccessCounter;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Body type produced by the proxy data plane.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Forwards requests for one subdomain to one upstream address.
pub struct UpstreamTransport {
    client: Client<HttpConnector, Incoming>,
    authority: String,
    subdomain: String,
    counter: Arc<AccessCounter>,
    cookie_validator: Option<CookieValidator>,
    timeout: Duration,
}

impl UpstreamTransport {
    pub fn new(
        subdomain: &str,
        authority: &str,
        counter: Arc<AccessCounter>,
        timeout: Duration,
        cookie_validator: Option<CookieValidator>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_keepalive(Some(KEEP_ALIVE));
        if !timeout.is_zero() {
            connector.set_connect_timeout(Some(timeout));
        }
        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            client,
            authority: authority.to_string(),
            subdomain: subdomain.to_string(),
            counter,
            cookie_validator,
            timeout,
        }
    }

    /// Forward one request to the upstream. Auth failures and upstream
    /// timeouts yield synthesised 403/504 responses; other transport
    /// errors surface as 502.
    pub async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        self.counter.add();

        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://{}{}", self.authority, path);
        debug!(subdomain = %self.subdomain, uri = %uri, "upstream roundtrip");

        // OPTIONS is exempt: CORS preflights carry no credentials.
        if req.method() != Method::OPTIONS {
            if let Some(validate) = &self.cookie_validator {
                match cookie_value(req.headers(), AUTH_COOKIE_NAME) {
                    None => {
                        warn!(subdomain = %self.subdomain, uri = %uri, "auth cookie missing");
                        return forbidden_response();
                    }
                    Some(value) => {
                        if let Err(err) = validate(&value) {
                            warn!(subdomain = %self.subdomain, uri = %uri, error = %err, "auth cookie rejected");
                            return forbidden_response();
                        }
                    }
                }
            }
        }

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);
        for (key, value) in parts.headers.iter() {
            builder = builder.header(key, value);
        }
        let upstream_req = match builder.body(body) {
            Ok(r) => r,
            Err(err) => {
                warn!(subdomain = %self.subdomain, uri = %uri, error = %err, "failed to build upstream request");
                return bad_gateway_response(&err.to_string());
            }
        };

        let result = if self.timeout.is_zero() {
            Ok(self.client.request(upstream_req).await)
        } else {
            tokio::time::timeout(self.timeout, self.client.request(upstream_req)).await
        };

        match result {
            Ok(Ok(resp)) => {
                let (parts, body) = resp.into_parts();
                Response::from_parts(parts, body.boxed())
            }
            Ok(Err(err)) => {
                warn!(subdomain = %self.subdomain, uri = %uri, error = %err, "upstream roundtrip failed");
                if err.to_string().contains("timeout") {
                    timeout_response(&self.subdomain, &uri, &err.to_string())
                } else {
                    bad_gateway_response(&err.to_string())
                }
            }
            Err(_elapsed) => {
                warn!(
                    subdomain = %self.subdomain,
                    uri = %uri,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "upstream roundtrip timed out"
                );
                timeout_response(&self.subdomain, &uri, "request timeout")
            }
        }
    }
}

fn synthesize(status: StatusCode, body: String) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from(body)).map_err(|never| match never {}).boxed())
        .expect("valid response with StatusCode enum")
}

/// 504 naming the subdomain, the target URL, and the underlying error.
pub fn timeout_response(subdomain: &str, url: &str, err: &str) -> Response<ProxyBody> {
    synthesize(
        StatusCode::GATEWAY_TIMEOUT,
        format!("{subdomain} upstream timeout: {url} {err}"),
    )
}

pub fn forbidden_response() -> Response<ProxyBody> {
    synthesize(StatusCode::FORBIDDEN, "Forbidden".to_string())
}

pub fn bad_gateway_response(err: &str) -> Response<ProxyBody> {
    synthesize(StatusCode::BAD_GATEWAY, format!("upstream request failed: {err}"))
}
