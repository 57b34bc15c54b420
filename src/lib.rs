//! RouterOS Link Library
//!
//! Client core for the RouterOS management WebSocket:
//!
//! - `rpc` - correlated request/response client with reconnection and heartbeat
//! - `endpoint` - socket URL resolution per router
//! - `config` - timeouts and reconnection policy
//! - `models` - request envelopes and connection state
//!
//! # Usage
//!
//! ```ignore
//! use routeros_link::{ClientConfig, Credentials, RouterOsClient};
//!
//! let client = RouterOsClient::from_config(ClientConfig::resolve(None)?)?;
//! client.connect("r-42").await?;
//! let routes = client
//!     .list_routes("r-42", "10.8.0.2", &Credentials::new("admin", "secret"))
//!     .await?;
//! ```

pub mod config;
pub mod endpoint;
pub mod models;
pub mod rpc;

pub use config::{default_config_path, ClientConfig};
pub use endpoint::{ApiEndpoint, EndpointConfig, EndpointResolver, Environment};
pub use models::{Action, ConnectionInfo, ConnectionState, Credentials};
pub use rpc::{ClientEvent, ErrorKind, EventKind, RouterOsClient, RpcError, Subscription};
