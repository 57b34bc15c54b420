//! Correlated RPC over the RouterOS management WebSocket.
//!
//! The management API exposes one WebSocket per router. Requests and
//! responses share the socket with unsolicited events, so every request is
//! stamped with a correlation id and matched to its response on arrival.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐  send()   ┌──────────────┐  frames   ┌─────────────────┐
//! │ RouterOsClient │ ────────► │ PendingTable │ ────────► │ writer task     │ ──► socket
//! │   (facade)     │ ◄──────── │  id → waiter │ ◄──────── │ reader task     │ ◄── socket
//! └────────────────┘  result   └──────────────┘  replies  └─────────────────┘
//!         │                                                  │ unmatched frames
//!         ▼                                                  ▼
//!   connection lifecycle ◄── heartbeat task              EventBus (`message`)
//! ```
//!
//! # Wire format
//!
//! Requests are JSON objects tagged by `action` plus a numeric `id`:
//!
//! ```text
//! {"action":"get_status","router_id":"r-42","router_ip":null,"id":7}
//! ```
//!
//! Responses echo the id and carry `success`, with `error` on failure.
//! Frames without a known id are delivered as `message` events.
//!
//! # Usage
//!
//! ```ignore
//! use routeros_link::{ClientConfig, RouterOsClient};
//!
//! let client = RouterOsClient::from_config(ClientConfig::default())?;
//! client.connect("r-42").await?;
//! let status = client.get_status("r-42", None).await?;
//! ```

mod client;
mod codec;
mod connection;
mod error;
mod events;
mod heartbeat;
mod pending;

pub use client::RouterOsClient;
pub use connection::{ABNORMAL_CLOSURE, NORMAL_CLOSURE, NO_STATUS_RECEIVED};
pub use error::{ErrorKind, RpcError};
pub use events::{ClientEvent, EventKind, Subscription};
