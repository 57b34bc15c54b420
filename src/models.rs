//! Data models for the RouterOS management protocol.
//!
//! Request envelopes are tagged by `action`; the correlation `id` is added
//! by the codec when the request is written.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of the router connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

impl ConnectionState {
    /// Short display string for status bars.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Open => "CONNECTED",
            ConnectionState::Closing => "CLOSING",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RouterOS API login used by commands that talk to the device directly.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Keep passwords out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Request envelope sent to the router service.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    GetStatus {
        router_id: String,
        router_ip: Option<String>,
    },
    ListRoutes {
        router_id: String,
        router_ip: String,
        #[serde(flatten)]
        credentials: Credentials,
    },
    ExecuteCommand {
        router_id: String,
        router_ip: String,
        #[serde(flatten)]
        credentials: Credentials,
        command: String,
    },
    AddRoute {
        router_id: String,
        route_data: Value,
    },
    DeleteRoute {
        router_id: String,
        router_ip: String,
        #[serde(flatten)]
        credentials: Credentials,
        route_routeros_id: String,
    },
}

impl Action {
    /// Wire name of the action.
    pub fn name(&self) -> &'static str {
        match self {
            Action::GetStatus { .. } => "get_status",
            Action::ListRoutes { .. } => "list_routes",
            Action::ExecuteCommand { .. } => "execute_command",
            Action::AddRoute { .. } => "add_route",
            Action::DeleteRoute { .. } => "delete_route",
        }
    }

    /// Heartbeat probe for `router_id`.
    pub fn status_probe(router_id: &str) -> Self {
        Action::GetStatus {
            router_id: router_id.to_string(),
            router_ip: None,
        }
    }
}

/// Point-in-time view of the client for dashboards.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConnectionInfo {
    pub state: ConnectionState,
    pub target: Option<String>,
    pub reconnect_attempts: u32,
    pub pending_requests: usize,
    pub connected_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_get_status_envelope() {
        let action = Action::GetStatus {
            router_id: "r-42".into(),
            router_ip: Some("10.8.0.2".into()),
        };
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({"action": "get_status", "router_id": "r-42", "router_ip": "10.8.0.2"})
        );
    }

    #[test]
    fn test_status_probe_sends_null_ip() {
        let value = serde_json::to_value(Action::status_probe("r-1")).unwrap();
        assert_eq!(value["router_ip"], Value::Null);
        assert_eq!(value["action"], json!("get_status"));
    }

    #[test]
    fn test_execute_command_flattens_credentials() {
        let action = Action::ExecuteCommand {
            router_id: "r-1".into(),
            router_ip: "10.8.0.2".into(),
            credentials: Credentials::new("admin", "secret"),
            command: "/ip/route/print".into(),
        };
        assert_eq!(
            serde_json::to_value(&action).unwrap(),
            json!({
                "action": "execute_command",
                "router_id": "r-1",
                "router_ip": "10.8.0.2",
                "username": "admin",
                "password": "secret",
                "command": "/ip/route/print"
            })
        );
    }

    #[test]
    fn test_action_names_match_wire_tags() {
        let actions = [
            Action::status_probe("r"),
            Action::AddRoute {
                router_id: "r".into(),
                route_data: json!({"dst-address": "10.0.0.0/24"}),
            },
            Action::DeleteRoute {
                router_id: "r".into(),
                router_ip: "ip".into(),
                credentials: Credentials::new("u", "p"),
                route_routeros_id: "*1A".into(),
            },
        ];
        for action in actions {
            let value = serde_json::to_value(&action).unwrap();
            assert_eq!(value["action"], json!(action.name()));
        }
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let debug = format!("{:?}", Credentials::new("admin", "hunter2"));
        assert!(debug.contains("admin"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_connection_state_labels() {
        assert_eq!(ConnectionState::Open.to_string(), "CONNECTED");
        assert_eq!(ConnectionState::Disconnected.as_str(), "DISCONNECTED");
    }
}
