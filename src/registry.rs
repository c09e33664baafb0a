//! Dynamic reverse-proxy registry: per-subdomain, per-listen-port
//! handler table with liveness deadlines and wildcard lookup

use crate::auth::{cookie_validator, CookieValidator};
use crate::config::Config;
use crate::counter::{AccessCount, AccessCounter};
use crate::transport::{ProxyBody, UpstreamTransport};
use glob::Pattern;
use hyper::body::Incoming;
use hyper::{Request, Response};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Idle lifetime of one proxy handler; every successful lookup extends
/// the deadline by this much.
pub const PROXY_HANDLER_LIFETIME: Duration = Duration::from_secs(30);

// Local-mode tasks are never re-announced by a cluster, so handlers
// effectively never expire there.
const LOCAL_HANDLER_LIFETIME: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

const CLUSTER_COUNTER_UNIT: Duration = Duration::from_secs(60);
const LOCAL_COUNTER_UNIT: Duration = Duration::from_secs(10);

/// Registry mutation emitted by a task runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyControl {
    Add {
        subdomain: String,
        ip_address: String,
        port: u16,
    },
    Remove {
        subdomain: String,
    },
}

pub type ProxyControlSender = mpsc::UnboundedSender<ProxyControl>;
pub type ProxyControlReceiver = mpsc::UnboundedReceiver<ProxyControl>;

/// FIFO, single-consumer link between the task runners and the registry.
pub fn proxy_control_channel() -> (ProxyControlSender, ProxyControlReceiver) {
    mpsc::unbounded_channel()
}

/// One upstream handler plus its expiry deadline.
pub struct ProxyHandler {
    transport: UpstreamTransport,
    deadline: Mutex<Instant>,
    lifetime: Duration,
}

impl ProxyHandler {
    fn new(transport: UpstreamTransport, lifetime: Duration) -> Arc<Self> {
        Arc::new(Self {
            transport,
            deadline: Mutex::new(Instant::now() + lifetime),
            lifetime,
        })
    }

    pub fn alive(&self) -> bool {
        Instant::now() < *self.deadline.lock()
    }

    /// Reset the deadline to a full lifetime.
    pub fn extend(&self) {
        *self.deadline.lock() = Instant::now() + self.lifetime;
    }

    pub async fn forward(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        self.transport.forward(req).await
    }
}

/// listen port -> upstream address -> handler. One subdomain may fan out
/// to several upstream addresses; any live handler is acceptable.
#[derive(Default)]
struct ProxyHandlers {
    ports: HashMap<u16, HashMap<String, Arc<ProxyHandler>>>,
}

impl ProxyHandlers {
    /// First live handler on the port. Dead entries observed along the
    /// way are reported through `dead` for cleanup under the write lock.
    fn handler(&self, port: u16, dead: &mut Vec<(u16, String)>) -> Option<Arc<ProxyHandler>> {
        let handlers = self.ports.get(&port)?;
        let mut found = None;
        for (addr, handler) in handlers {
            if handler.alive() {
                if found.is_none() {
                    found = Some(Arc::clone(handler));
                }
            } else {
                info!(addr = %addr, "proxy handler is dead");
                dead.push((port, addr.clone()));
            }
        }
        found
    }

    /// True when a live handler exists for (port, addr); finding one
    /// extends its lifetime. Dead entries are removed in place (callers
    /// hold the write lock).
    fn exists_alive(&mut self, port: u16, addr: &str) -> bool {
        let Some(handlers) = self.ports.get_mut(&port) else {
            return false;
        };
        match handlers.get(addr) {
            Some(handler) if handler.alive() => {
                debug!(addr = %addr, "proxy handler extends lifetime");
                handler.extend();
                true
            }
            Some(_) => {
                info!(addr = %addr, "proxy handler is dead");
                handlers.remove(addr);
                false
            }
            None => false,
        }
    }

    fn add(&mut self, port: u16, addr: String, handler: Arc<ProxyHandler>) {
        info!(addr = %addr, "new proxy handler");
        self.ports.entry(port).or_default().insert(addr, handler);
    }
}

struct Inner {
    /// Registered names in registration order; glob lookups scan this.
    domains: Vec<String>,
    domain_map: HashMap<String, ProxyHandlers>,
    access_counters: HashMap<String, Arc<AccessCounter>>,
}

/// Guarded map of subdomain routes. Request paths take the read lock;
/// mutation happens under the write lock.
pub struct ProxyRegistry {
    cfg: Arc<Config>,
    cookie_validator: Option<CookieValidator>,
    handler_lifetime: Duration,
    counter_unit: Duration,
    inner: RwLock<Inner>,
}

impl ProxyRegistry {
    pub fn new(cfg: Arc<Config>) -> Self {
        let lifetime = if cfg.local_mode {
            LOCAL_HANDLER_LIFETIME
        } else {
            PROXY_HANDLER_LIFETIME
        };
        Self::with_handler_lifetime(cfg, lifetime)
    }

    pub fn with_handler_lifetime(cfg: Arc<Config>, handler_lifetime: Duration) -> Self {
        let counter_unit = if cfg.local_mode {
            debug!(unit_secs = LOCAL_COUNTER_UNIT.as_secs(), "local mode access counter unit");
            LOCAL_COUNTER_UNIT
        } else {
            CLUSTER_COUNTER_UNIT
        };
        let validator = cfg.auth.as_ref().map(|auth| {
            let auth = Arc::new(auth.clone());
            cookie_validator(&auth)
        });
        Self {
            cfg,
            cookie_validator: validator,
            handler_lifetime,
            counter_unit,
            inner: RwLock::new(Inner {
                domains: Vec::new(),
                domain_map: HashMap::new(),
                access_counters: HashMap::new(),
            }),
        }
    }

    /// Interval at which access counters bucket and publish.
    pub fn counter_unit(&self) -> Duration {
        self.counter_unit
    }

    /// True when the name is registered exactly or matches a registered
    /// glob pattern.
    pub fn exists(&self, subdomain: &str) -> bool {
        let inner = self.inner.read();
        if inner.domain_map.contains_key(subdomain) {
            return true;
        }
        inner.domains.iter().any(|name| glob_match(name, subdomain))
    }

    /// Snapshot of registered names in registration order.
    pub fn subdomains(&self) -> Vec<String> {
        self.inner.read().domains.clone()
    }

    /// Resolve a live handler: exact match first, then the first
    /// registered glob that matches. Extends the handler it returns.
    pub fn find_handler(&self, subdomain: &str, port: u16) -> Option<Arc<ProxyHandler>> {
        debug!(subdomain = %subdomain, port, "find handler");
        let mut dead: Vec<(String, u16, String)> = Vec::new();
        let found = {
            let inner = self.inner.read();
            let name = if inner.domain_map.contains_key(subdomain) {
                Some(subdomain.to_string())
            } else {
                inner
                    .domains
                    .iter()
                    .find(|name| glob_match(name, subdomain))
                    .cloned()
            };
            name.and_then(|name| {
                let mut dead_addrs = Vec::new();
                let handler = inner
                    .domain_map
                    .get(&name)
                    .and_then(|ph| ph.handler(port, &mut dead_addrs));
                for (port, addr) in dead_addrs {
                    dead.push((name.clone(), port, addr));
                }
                handler
            })
        };

        // Second phase: remove entries observed dead, re-checking under
        // the write lock so a concurrently extended handler survives.
        if !dead.is_empty() {
            let mut inner = self.inner.write();
            for (name, port, addr) in dead {
                if let Some(handlers) = inner
                    .domain_map
                    .get_mut(&name)
                    .and_then(|ph| ph.ports.get_mut(&port))
                {
                    if handlers.get(&addr).map(|h| !h.alive()).unwrap_or(false) {
                        handlers.remove(&addr);
                    }
                }
            }
        }

        if let Some(handler) = &found {
            handler.extend();
        }
        found
    }

    /// Ensure a live handler per matching listen mapping. When no listen
    /// mapping targets the container port, warns and changes nothing.
    pub fn add_subdomain(&self, subdomain: &str, ip_address: &str, target_port: u16) {
        let addr = format!("{ip_address}:{target_port}");
        debug!(subdomain = %subdomain, addr = %addr, "add subdomain");

        let matches_any = self.cfg.local_mode
            || self
                .cfg
                .listen
                .http
                .iter()
                .any(|pm| pm.target == target_port);
        if !matches_any {
            warn!(
                subdomain = %subdomain,
                target_port,
                "proxy is not created. define the target port in listen.http[]"
            );
            return;
        }

        let inner = &mut *self.inner.write();
        let counter = Arc::clone(
            inner
                .access_counters
                .entry(subdomain.to_string())
                .or_insert_with(|| Arc::new(AccessCounter::new(self.counter_unit))),
        );
        let handlers = inner.domain_map.entry(subdomain.to_string()).or_default();

        for pm in &self.cfg.listen.http {
            // Local mode allows any target port.
            if pm.target != target_port && !self.cfg.local_mode {
                continue;
            }
            if handlers.exists_alive(pm.listen, &addr) {
                continue;
            }
            let validator = if pm.require_auth_cookie {
                self.cookie_validator.clone()
            } else {
                None
            };
            let transport = UpstreamTransport::new(
                subdomain,
                &addr,
                Arc::clone(&counter),
                self.cfg.proxy_timeout(),
                validator,
            );
            handlers.add(
                pm.listen,
                addr.clone(),
                ProxyHandler::new(transport, self.handler_lifetime),
            );
            info!(
                subdomain = %subdomain,
                listen = pm.listen,
                addr = %addr,
                "add subdomain route"
            );
        }

        if !inner.domains.iter().any(|name| name == subdomain) {
            inner.domains.push(subdomain.to_string());
        }
    }

    /// Drop the subdomain's handlers, registration, and access counter.
    pub fn remove_subdomain(&self, subdomain: &str) {
        info!(subdomain = %subdomain, "removing subdomain");
        let mut inner = self.inner.write();
        inner.domain_map.remove(subdomain);
        inner.access_counters.remove(subdomain);
        inner.domains.retain(|name| name != subdomain);
    }

    /// Dispatch one control message.
    pub fn modify(&self, action: ProxyControl) {
        match action {
            ProxyControl::Add {
                subdomain,
                ip_address,
                port,
            } => self.add_subdomain(&subdomain, &ip_address, port),
            ProxyControl::Remove { subdomain } => self.remove_subdomain(&subdomain),
        }
    }

    /// Snapshot every subdomain's counter for metric publication.
    pub fn collect_access_counts(&self) -> HashMap<String, AccessCount> {
        let inner = self.inner.read();
        inner
            .access_counters
            .iter()
            .map(|(subdomain, counter)| (subdomain.clone(), counter.collect()))
            .collect()
    }
}

fn glob_match(pattern: &str, subdomain: &str) -> bool {
    Pattern::new(pattern)
        .map(|p| p.matches(subdomain))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigOptions, PortMap};

    fn test_config() -> Arc<Config> {
        let opts = ConfigOptions {
            domain: "dev.example.net".to_string(),
            ..Default::default()
        };
        let mut cfg = Config::from_yaml(None, &opts).unwrap();
        cfg.listen.http = vec![PortMap {
            listen: 8080,
            target: 80,
            require_auth_cookie: false,
        }];
        Arc::new(cfg)
    }

    fn registry() -> ProxyRegistry {
        ProxyRegistry::new(test_config())
    }

    #[test]
    fn test_add_find_remove() {
        let r = registry();
        r.add_subdomain("feature-x", "10.0.0.5", 80);

        assert!(r.exists("feature-x"));
        assert_eq!(r.subdomains(), vec!["feature-x".to_string()]);
        assert!(r.find_handler("feature-x", 8080).is_some());
        assert!(r.find_handler("feature-x", 9999).is_none());
        assert!(r.find_handler("other", 8080).is_none());

        r.remove_subdomain("feature-x");
        assert!(!r.exists("feature-x"));
        assert!(r.find_handler("feature-x", 8080).is_none());
        assert!(r.subdomains().is_empty());
    }

    #[test]
    fn test_unmatched_target_port_changes_nothing() {
        let r = registry();
        r.add_subdomain("feature-x", "10.0.0.5", 3000);
        assert!(!r.exists("feature-x"));
        assert!(r.subdomains().is_empty());
    }

    #[test]
    fn test_wildcard_lookup() {
        let r = registry();
        r.add_subdomain("pr-*", "10.0.0.9", 80);

        assert!(r.exists("pr-42"));
        assert!(r.find_handler("pr-42", 8080).is_some());
        assert!(r.find_handler("staging", 8080).is_none());
    }

    #[test]
    fn test_character_class_lookup() {
        let r = registry();
        r.add_subdomain("env-[ab]", "10.0.0.9", 80);
        assert!(r.exists("env-a"));
        assert!(r.exists("env-b"));
        assert!(!r.exists("env-c"));
    }

    #[test]
    fn test_registration_order_preserved() {
        let r = registry();
        r.add_subdomain("bravo", "10.0.0.2", 80);
        r.add_subdomain("alpha", "10.0.0.1", 80);
        r.add_subdomain("bravo", "10.0.0.2", 80); // re-add keeps position
        assert_eq!(
            r.subdomains(),
            vec!["bravo".to_string(), "alpha".to_string()]
        );
    }

    #[test]
    fn test_modify_dispatch() {
        let r = registry();
        r.modify(ProxyControl::Add {
            subdomain: "feature-x".to_string(),
            ip_address: "10.0.0.5".to_string(),
            port: 80,
        });
        assert!(r.exists("feature-x"));
        r.modify(ProxyControl::Remove {
            subdomain: "feature-x".to_string(),
        });
        assert!(!r.exists("feature-x"));
    }

    #[tokio::test]
    async fn test_expired_handler_is_dropped_on_lookup() {
        let r = ProxyRegistry::with_handler_lifetime(test_config(), Duration::from_millis(30));
        r.add_subdomain("feature-x", "10.0.0.5", 80);
        assert!(r.find_handler("feature-x", 8080).is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(r.find_handler("feature-x", 8080).is_none());
        // The name stays registered; only the handler expired.
        assert!(r.exists("feature-x"));
    }

    #[tokio::test]
    async fn test_lookup_extends_deadline() {
        let r = ProxyRegistry::with_handler_lifetime(test_config(), Duration::from_millis(80));
        r.add_subdomain("feature-x", "10.0.0.5", 80);

        // Keep touching the handler at half-life; it must stay alive
        // well past the original deadline.
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert!(r.find_handler("feature-x", 8080).is_some());
        }
    }

    #[test]
    fn test_collect_access_counts_snapshots_all() {
        let r = registry();
        r.add_subdomain("feature-x", "10.0.0.5", 80);
        r.add_subdomain("feature-y", "10.0.0.6", 80);
        let counts = r.collect_access_counts();
        assert_eq!(counts.len(), 2);
        assert!(counts.contains_key("feature-x"));
        assert!(counts.contains_key("feature-y"));
    }
}
