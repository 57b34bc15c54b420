//! Public client for the RouterOS management socket.
//!
//! `RouterOsClient` is a cheap handle: clones share one connection, one
//! pending table and one event bus. Construct one per dashboard (or per
//! process) and pass it where it is needed.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use super::connection::Inner;
use super::error::RpcError;
use super::events::{ClientEvent, EventKind, Subscription};
use crate::config::ClientConfig;
use crate::endpoint::{ApiEndpoint, EndpointResolver};
use crate::models::{Action, ConnectionInfo, ConnectionState, Credentials};

/// Budget for `get_status`: quick, no retry.
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_RETRIES: u32 = 0;

/// Budget for `execute_command`: router commands can be slow.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const COMMAND_RETRIES: u32 = 1;

/// Retry backoff caps, as multiples of the base reconnect delay.
const TIMEOUT_RETRY_CAP: u64 = 3;
const ERROR_RETRY_CAP: u64 = 5;

/// Resilient RPC client for one router connection at a time.
#[derive(Clone)]
pub struct RouterOsClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RouterOsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouterOsClient")
            .field("state", &self.inner.state())
            .field("target", &self.inner.target())
            .finish()
    }
}

impl RouterOsClient {
    /// Create a client that dials URLs produced by `resolver`.
    ///
    /// No socket is opened until [`connect`](Self::connect) or the first
    /// [`send`](Self::send) with a known target.
    pub fn new(config: ClientConfig, resolver: impl EndpointResolver + 'static) -> Self {
        Self {
            inner: Arc::new(Inner::new(config, Arc::new(resolver))),
        }
    }

    /// Create a client that resolves targets with the configured
    /// [`ApiEndpoint`].
    pub fn from_config(config: ClientConfig) -> Result<Self, RpcError> {
        let endpoint = ApiEndpoint::from_config(&config.endpoint)?;
        Ok(Self::new(config, endpoint))
    }

    /// Timeouts and reconnection policy this client was built with.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ==================== Lifecycle ====================

    /// Connect to `router_id`.
    ///
    /// Returns immediately if already connected to that router. Concurrent
    /// calls for the same router share one attempt. Switching routers closes
    /// the previous socket first. A failed attempt is reported to the caller
    /// and is not retried.
    pub async fn connect(&self, router_id: &str) -> Result<(), RpcError> {
        self.inner.connect(router_id, false).await
    }

    /// Replace the current connection with a fresh one to the same router.
    pub async fn reconnect(&self) -> Result<(), RpcError> {
        let target = self.inner.target().ok_or(RpcError::NotConnected)?;
        self.inner.reset_reconnect_attempts();
        self.inner.connect(&target, true).await
    }

    /// Close the connection and stop reconnecting.
    ///
    /// Outstanding requests are rejected.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    // ==================== Requests ====================

    /// Send `message` and wait for the matching response.
    ///
    /// `message` must be a JSON object with a string `action`; the
    /// correlation id is assigned here. If the socket is down and a router
    /// is known, it is reopened first. Timeouts and transport errors are
    /// retried up to `max_retries` times with backoff; router errors are
    /// returned as-is. A timeout on the last attempt force-closes the
    /// connection so the next call starts on a fresh socket.
    pub async fn send(
        &self,
        message: Value,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Value, RpcError> {
        let action = message
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let mut attempt: u32 = 0;

        loop {
            let result = match self.inner.ensure_open().await {
                Ok(generation) => {
                    let result = self.inner.dispatch(generation, &message, timeout).await;
                    if matches!(&result, Err(e) if e.is_timeout()) && attempt >= max_retries {
                        self.inner.force_close(generation, "request timed out");
                    }
                    result
                }
                Err(e) => Err(e),
            };

            let err = match result {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            if attempt >= max_retries || !err.is_retryable() {
                return Err(err);
            }
            // Disconnected by the caller: nothing to retry against.
            if self.inner.target().is_none() {
                return Err(err);
            }

            let delay = self.retry_delay(attempt, &err);
            attempt += 1;
            warn!(
                "{} failed ({}); retrying in {:?} ({}/{})",
                action, err, delay, attempt, max_retries
            );
            tokio::time::sleep(delay).await;

            if err.is_timeout() {
                if let Some(target) = self.inner.target() {
                    if let Err(e) = self.inner.connect(&target, true).await {
                        debug!("Reconnect before retry failed: {}", e);
                    }
                }
            }
        }
    }

    /// [`send`](Self::send) with the configured default timeout and retries.
    pub async fn send_default(&self, message: Value) -> Result<Value, RpcError> {
        let config = &self.inner.config;
        self.send(message, config.request_timeout(), config.request_retries)
            .await
    }

    // base * 2^attempt, capped lower after timeouts than after errors.
    fn retry_delay(&self, attempt: u32, err: &RpcError) -> Duration {
        let base = self.inner.config.reconnect_base_delay_ms.max(1);
        let cap = if err.is_timeout() {
            TIMEOUT_RETRY_CAP
        } else {
            ERROR_RETRY_CAP
        };
        let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(base.saturating_mul(multiplier).min(base.saturating_mul(cap)))
    }

    async fn request(
        &self,
        action: Action,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Value, RpcError> {
        let message = serde_json::to_value(&action)?;
        self.send(message, timeout, max_retries).await
    }

    async fn request_default(&self, action: Action) -> Result<Value, RpcError> {
        let config = &self.inner.config;
        self.request(action, config.request_timeout(), config.request_retries)
            .await
    }

    // ==================== Router operations ====================

    /// Router status and resource usage.
    pub async fn get_status(
        &self,
        router_id: &str,
        router_ip: Option<&str>,
    ) -> Result<Value, RpcError> {
        self.request(
            Action::GetStatus {
                router_id: router_id.to_string(),
                router_ip: router_ip.map(str::to_string),
            },
            STATUS_TIMEOUT,
            STATUS_RETRIES,
        )
        .await
    }

    /// Static routes configured on the router.
    pub async fn list_routes(
        &self,
        router_id: &str,
        router_ip: &str,
        credentials: &Credentials,
    ) -> Result<Value, RpcError> {
        self.request_default(Action::ListRoutes {
            router_id: router_id.to_string(),
            router_ip: router_ip.to_string(),
            credentials: credentials.clone(),
        })
        .await
    }

    /// Run a RouterOS API command.
    pub async fn execute_command(
        &self,
        router_id: &str,
        router_ip: &str,
        credentials: &Credentials,
        command: &str,
    ) -> Result<Value, RpcError> {
        self.request(
            Action::ExecuteCommand {
                router_id: router_id.to_string(),
                router_ip: router_ip.to_string(),
                credentials: credentials.clone(),
                command: command.to_string(),
            },
            COMMAND_TIMEOUT,
            COMMAND_RETRIES,
        )
        .await
    }

    /// Add a static route; `route_data` is passed through to the router
    /// (`dst-address`, `gateway`, ...).
    ///
    /// # Example
    ///
    /// ```ignore
    /// client
    ///     .add_route("r-42", json!({"dst-address": "10.9.0.0/24", "gateway": "10.8.0.1"}))
    ///     .await?;
    /// ```
    pub async fn add_route(&self, router_id: &str, route_data: Value) -> Result<Value, RpcError> {
        self.request_default(Action::AddRoute {
            router_id: router_id.to_string(),
            route_data,
        })
        .await
    }

    /// Remove the route whose RouterOS id (`*1A` style) is `route_routeros_id`.
    pub async fn delete_route(
        &self,
        router_id: &str,
        router_ip: &str,
        credentials: &Credentials,
        route_routeros_id: &str,
    ) -> Result<Value, RpcError> {
        self.request_default(Action::DeleteRoute {
            router_id: router_id.to_string(),
            router_ip: router_ip.to_string(),
            credentials: credentials.clone(),
            route_routeros_id: route_routeros_id.to_string(),
        })
        .await
    }

    // ==================== Events ====================

    /// Subscribe to `kind` events.
    ///
    /// Callbacks for one kind run in registration order on the task that
    /// emitted the event. A panicking callback is logged and skipped.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> Subscription
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, callback)
    }

    // ==================== State ====================

    /// True while a socket is open. `Closing` counts as not connected.
    pub fn is_connected(&self) -> bool {
        self.inner.open_generation().is_some()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// State label for status bars (`CONNECTED`, `DISCONNECTED`, ...).
    pub fn state_label(&self) -> &'static str {
        self.inner.state().as_str()
    }

    /// Router the client is connected (or reconnecting) to.
    pub fn current_target(&self) -> Option<String> {
        self.inner.target()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Point-in-time view of the connection for status displays.
    pub fn snapshot(&self) -> ConnectionInfo {
        self.inner.snapshot()
    }
}
