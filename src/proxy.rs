//! Proxy listeners: one per configured listen port. Requests for the
//! web-api host go to the control surface; everything else resolves a
//! subdomain handler from the registry.

use crate::api::ApiState;
use crate::config::Config;
use crate::registry::ProxyRegistry;
use crate::transport::ProxyBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub struct ProxyServer {
    bind_addr: SocketAddr,
    /// Logical listen port used for registry lookups; matches the bound
    /// port in production, but tests bind port 0.
    listen_port: u16,
    cfg: Arc<Config>,
    registry: Arc<ProxyRegistry>,
    api: Arc<ApiState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        listen_port: u16,
        cfg: Arc<Config>,
        registry: Arc<ProxyRegistry>,
        api: Arc<ApiState>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            listen_port,
            cfg,
            registry,
            api,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    pub async fn run_with_listener(self, listener: TcpListener) -> anyhow::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            listen_port = self.listen_port,
            "proxy server listening"
        );
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let cfg = Arc::clone(&self.cfg);
                            let registry = Arc::clone(&self.registry);
                            let api = Arc::clone(&self.api);
                            let listen_port = self.listen_port;

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req: Request<Incoming>| {
                                    let cfg = Arc::clone(&cfg);
                                    let registry = Arc::clone(&registry);
                                    let api = Arc::clone(&api);
                                    async move {
                                        handle_request(req, cfg, registry, api, listen_port).await
                                    }
                                });
                                if let Err(err) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %err, "connection error");
                                }
                            });
                        }
                        Err(err) => {
                            error!(error = %err, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!(listen_port = self.listen_port, "proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    req: Request<Incoming>,
    cfg: Arc<Config>,
    registry: Arc<ProxyRegistry>,
    api: Arc<ApiState>,
    listen_port: u16,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let host = host_of(&req);
    if host == cfg.host.web_api {
        return Ok(api.handle(req).await);
    }

    let subdomain = host.split('.').next().unwrap_or_default().to_string();
    match registry.find_handler(&subdomain, listen_port) {
        Some(handler) => {
            debug!(subdomain = %subdomain, "proxy handler found");
            Ok(handler.forward(req).await)
        }
        None => {
            debug!(subdomain = %subdomain, "proxy handler not found");
            Ok(not_found_response())
        }
    }
}

/// Host of the request, lowercased and without the port.
fn host_of<B>(req: &Request<B>) -> String {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().host().map(str::to_string))
        .unwrap_or_default();
    raw.split(':').next().unwrap_or_default().to_lowercase()
}

fn not_found_response() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(
            Full::new(Bytes::from_static(b"404 page not found"))
                .map_err(|never| match never {})
                .boxed(),
        )
        .expect("valid response with StatusCode enum")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Empty;

    #[test]
    fn test_host_of_strips_port_and_lowercases() {
        let req = Request::builder()
            .uri("/")
            .header(hyper::header::HOST, "Feature-X.dev.example.net:8080")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert_eq!(host_of(&req), "feature-x.dev.example.net");
    }

    #[test]
    fn test_host_of_falls_back_to_uri() {
        let req = Request::builder()
            .uri("http://pr-42.dev.example.net/path")
            .body(Empty::<Bytes>::new())
            .unwrap();
        assert_eq!(host_of(&req), "pr-42.dev.example.net");
    }

    #[tokio::test]
    async fn test_not_found_body() {
        let resp = not_found_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"404 page not found");
    }
}
