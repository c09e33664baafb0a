//! Authentication: bearer token, basic, signed identity header, and the
//! auth cookie consumed by the proxy data plane.

use crate::error::{Error, Result};
use chrono::Utc;
use hyper::header::{HeaderMap, AUTHORIZATION, COOKIE};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Name of the auth cookie issued on successful web auth.
pub const AUTH_COOKIE_NAME: &str = "envgate-auth";

/// Auth cookie lifetime.
pub const AUTH_COOKIE_EXPIRE: Duration = Duration::from_secs(24 * 3600);

/// Validates the auth cookie value; injected into the upstream transport
/// for listen mappings that demand it.
pub type CookieValidator = Arc<dyn Fn(&str) -> Result<()> + Send + Sync>;

/// Authentication configuration. Any configured method passing grants
/// access to the web surface; the API surface accepts the token only.
#[derive(Debug, Clone, Deserialize)]
pub struct Auth {
    pub token: Option<TokenAuth>,
    pub basic: Option<BasicAuth>,
    pub signed_header: Option<SignedHeaderAuth>,
    /// HMAC secret for the auth cookie. Generated at startup when unset.
    #[serde(default)]
    pub cookie_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenAuth {
    #[serde(default = "default_token_header")]
    pub header: String,
    pub token: String,
}

fn default_token_header() -> String {
    AUTHORIZATION.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// Identity-provider signed header (a JWT validated with a shared secret).
#[derive(Debug, Clone, Deserialize)]
pub struct SignedHeaderAuth {
    pub header: String,
    pub secret: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct CookieClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

impl Auth {
    /// Fill in a generated cookie secret when the config leaves it empty.
    pub fn ensure_cookie_secret(&mut self) {
        if self.cookie_secret.is_empty() {
            self.cookie_secret = uuid::Uuid::new_v4().to_string();
        }
    }

    pub fn by_token(&self, headers: &HeaderMap) -> bool {
        let Some(token) = &self.token else {
            return false;
        };
        headers
            .get(&token.header)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.strip_prefix("Bearer ").unwrap_or(v) == token.token)
            .unwrap_or(false)
    }

    pub fn by_basic(&self, headers: &HeaderMap) -> bool {
        let Some(basic) = &self.basic else {
            return false;
        };
        let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let Some(encoded) = value.strip_prefix("Basic ") else {
            return false;
        };
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(pair) = String::from_utf8(decoded) else {
            return false;
        };
        match pair.split_once(':') {
            Some((user, pass)) => user == basic.username && pass == basic.password,
            None => false,
        }
    }

    pub fn by_signed_header(&self, headers: &HeaderMap) -> bool {
        let Some(signed) = &self.signed_header else {
            return false;
        };
        let Some(value) = headers.get(&signed.header).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let key = DecodingKey::from_secret(signed.secret.as_bytes());
        match decode::<serde_json::Value>(value, &key, &Validation::default()) {
            Ok(_) => true,
            Err(err) => {
                warn!(header = %signed.header, error = %err, "signed header validation failed");
                false
            }
        }
    }

    /// Web surface: any configured method passes.
    pub fn authorize_web(&self, headers: &HeaderMap) -> bool {
        self.by_token(headers) || self.by_signed_header(headers) || self.by_basic(headers)
    }

    /// API surface: token only.
    pub fn authorize_api(&self, headers: &HeaderMap) -> bool {
        self.by_token(headers)
    }

    /// Issue the auth cookie as a complete Set-Cookie value, scoped to
    /// the reverse-proxy suffix so every subdomain receives it.
    pub fn new_auth_cookie(&self, domain: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = CookieClaims {
            sub: "envgate".to_string(),
            iat: now,
            exp: now + AUTH_COOKIE_EXPIRE.as_secs() as i64,
        };
        let key = EncodingKey::from_secret(self.cookie_secret.as_bytes());
        let value = encode(&Header::default(), &claims, &key)
            .map_err(|e| Error::Auth(format!("failed to sign auth cookie: {e}")))?;
        Ok(format!(
            "{}={}; Domain={}; Path=/; Max-Age={}; HttpOnly",
            AUTH_COOKIE_NAME,
            value,
            domain.trim_start_matches('.'),
            AUTH_COOKIE_EXPIRE.as_secs()
        ))
    }

    pub fn validate_cookie(&self, value: &str) -> Result<()> {
        let key = DecodingKey::from_secret(self.cookie_secret.as_bytes());
        decode::<CookieClaims>(value, &key, &Validation::default())
            .map(|_| ())
            .map_err(|e| Error::Auth(format!("invalid auth cookie: {e}")))
    }
}

/// Build the cookie-validate function consumed by the upstream transport.
pub fn cookie_validator(auth: &Arc<Auth>) -> CookieValidator {
    let auth = Arc::clone(auth);
    Arc::new(move |value: &str| auth.validate_cookie(value))
}

/// Check that an Origin header points at the configured web-api host.
pub fn origin_allowed(origin: &str, webapi_host: &str) -> bool {
    let rest = match origin.split_once("://") {
        Some((_, rest)) => rest,
        None => return false,
    };
    let authority = rest.split('/').next().unwrap_or(rest);
    let host = authority.split(':').next().unwrap_or(authority);
    !host.is_empty() && host == webapi_host
}

/// Extract a cookie value by name from request headers.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(raw) = header.to_str() else {
            continue;
        };
        for cookie in raw.split(';') {
            let cookie = cookie.trim();
            if let Some(value) = cookie.strip_prefix(name) {
                if let Some(value) = value.strip_prefix('=') {
                    if !value.is_empty() {
                        return Some(value.to_string());
                    }
                }
            }
        }
    }
    None
}
