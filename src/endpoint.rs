//! Socket URL resolution for router targets.
//!
//! The management API proxies one WebSocket per router at
//! `/api/ws/routeros/<router-id>`. Which host serves it depends on the
//! deployment; the client only needs the URL to stay stable for a given
//! router id.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::rpc::RpcError;

/// Production API host.
pub const PRODUCTION_HOST: &str = "automais.io:5001";

/// Development API host.
pub const DEVELOPMENT_HOST: &str = "localhost:5000";

/// Path prefix of the per-router socket.
const SOCKET_PATH: [&str; 3] = ["api", "ws", "routeros"];

/// Maps a target key (router id) to the socket URL to dial.
pub trait EndpointResolver: Send + Sync {
    /// Resolve the socket URL for `target`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Endpoint` if no valid URL can be built.
    fn resolve(&self, target: &str) -> Result<Url, RpcError>;
}

impl<F> EndpointResolver for F
where
    F: Fn(&str) -> Result<Url, RpcError> + Send + Sync,
{
    fn resolve(&self, target: &str) -> Result<Url, RpcError> {
        self(target)
    }
}

/// Deployment the dashboard runs in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Production,
    #[default]
    Development,
}

/// Serializable endpoint settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub environment: Environment,
    /// Use `wss://` instead of `ws://`.
    pub secure: bool,
    /// Explicit base URL (`ws://host:port`), overriding the environment host.
    pub base_url: Option<String>,
}

/// Resolver for the management API's per-router socket.
#[derive(Debug, Clone)]
pub struct ApiEndpoint {
    base: Url,
}

impl ApiEndpoint {
    /// Use an explicit base URL such as `ws://127.0.0.1:5000`.
    ///
    /// `http`/`https` bases are mapped to `ws`/`wss`.
    pub fn new(base: &str) -> Result<Self, RpcError> {
        let mut url = Url::parse(base)
            .map_err(|e| RpcError::Endpoint(format!("invalid base URL {}: {}", base, e)))?;

        let scheme = match url.scheme() {
            "ws" | "http" => "ws",
            "wss" | "https" => "wss",
            other => {
                return Err(RpcError::Endpoint(format!(
                    "unsupported scheme {} in {}",
                    other, base
                )))
            }
        };
        url.set_scheme(scheme).map_err(|()| {
            RpcError::Endpoint(format!("cannot use scheme {} for {}", scheme, base))
        })?;

        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(RpcError::Endpoint(format!("base URL {} has no host", base)));
        }

        Ok(Self { base: url })
    }

    /// Host chosen by deployment environment.
    pub fn for_environment(environment: Environment, secure: bool) -> Result<Self, RpcError> {
        let scheme = if secure { "wss" } else { "ws" };
        let host = match environment {
            Environment::Production => PRODUCTION_HOST,
            Environment::Development => DEVELOPMENT_HOST,
        };
        Self::new(&format!("{}://{}", scheme, host))
    }

    /// Build from serialized settings.
    pub fn from_config(config: &EndpointConfig) -> Result<Self, RpcError> {
        match &config.base_url {
            Some(base) => Self::new(base),
            None => Self::for_environment(config.environment, config.secure),
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }
}

impl EndpointResolver for ApiEndpoint {
    fn resolve(&self, target: &str) -> Result<Url, RpcError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(RpcError::Endpoint("router id is required".to_string()));
        }

        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| RpcError::Endpoint(format!("{} cannot carry a path", self.base)))?
            .clear()
            .extend(SOCKET_PATH)
            .push(target);
        Ok(url)
    }
}
