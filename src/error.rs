//! Error kinds for the gateway and their HTTP status mapping

use hyper::StatusCode;
use thiserror::Error;

/// Typed failures returned by library code. The HTTP adapter maps each
/// kind to a status code; background loops log and continue.
#[derive(Debug, Error)]
pub enum Error {
    /// Request parameter or body is invalid
    #[error("{0}")]
    Validation(String),

    /// All authentication methods failed
    #[error("{0}")]
    Auth(String),

    /// Origin mismatch or missing/invalid auth cookie
    #[error("{0}")]
    Forbidden(String),

    /// Upstream did not respond within the proxy timeout
    #[error("{subdomain} upstream timeout: {url} {message}")]
    UpstreamTimeout {
        subdomain: String,
        url: String,
        message: String,
    },

    /// Non-timeout upstream transport failure
    #[error("upstream request failed: {0}")]
    Upstream(String),

    /// Cluster backend call failed
    #[error("{0}")]
    ClusterApi(String),

    /// Invalid configuration (fatal at startup only)
    #[error("invalid config: {0}")]
    Config(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::Upstream(_) => StatusCode::BAD_GATEWAY,
            Error::ClusterApi(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::ClusterApi(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
