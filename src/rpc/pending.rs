//! Correlation of outgoing requests with their responses.
//!
//! Every request registers a slot keyed by a monotonically increasing id
//! before it touches the wire. A slot leaves the table exactly once: when
//! its response arrives, when its waiter gives up (timeout or drop), or when
//! the connection is torn down and the whole table is drained.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use super::codec::sanitize_text;
use super::error::RpcError;

/// Outcome delivered to a waiting request.
pub type PendingResult = Result<Value, RpcError>;

/// One in-flight request.
#[derive(Debug)]
struct PendingRequest {
    action: String,
    response_tx: oneshot::Sender<PendingResult>,
    created_at: Instant,
}

/// Table of in-flight requests.
#[derive(Debug)]
pub struct PendingTable {
    next_id: AtomicU64,
    entries: Mutex<HashMap<u64, PendingRequest>>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    /// Create an empty table. The first id handed out is 1.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<u64, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id and register a slot for it.
    ///
    /// The returned guard removes the slot when dropped, so a waiter that
    /// times out or is cancelled never leaves a stale entry behind.
    pub fn register(&self, action: &str) -> (PendingSlot<'_>, oneshot::Receiver<PendingResult>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (response_tx, response_rx) = oneshot::channel();

        self.entries().insert(
            id,
            PendingRequest {
                action: action.to_string(),
                response_tx,
                created_at: Instant::now(),
            },
        );
        trace!("Registered request {} ({})", id, action);

        (PendingSlot { table: self, id }, response_rx)
    }

    /// Deliver a response envelope to the request that shares its id.
    ///
    /// If no request with that id is outstanding the envelope is handed back
    /// so the caller can treat it as unsolicited.
    pub fn complete(&self, id: u64, response: Value) -> Result<(), Value> {
        let Some(pending) = self.entries().remove(&id) else {
            return Err(response);
        };

        debug!(
            "Response for request {} ({}) after {:?}",
            id,
            pending.action,
            pending.created_at.elapsed()
        );
        let _ = pending.response_tx.send(interpret_response(response));
        Ok(())
    }

    /// Remove a slot without completing it. Returns whether it was present.
    fn remove(&self, id: u64) -> bool {
        self.entries().remove(&id).is_some()
    }

    /// Reject every outstanding request with `error` and empty the table.
    ///
    /// Returns the number of requests rejected.
    pub fn reject_all(&self, error: &RpcError) -> usize {
        let drained: Vec<(u64, PendingRequest)> = self.entries().drain().collect();
        let count = drained.len();

        for (id, pending) in drained {
            trace!("Rejecting request {} ({}): {}", id, pending.action, error);
            let _ = pending.response_tx.send(Err(error.clone()));
        }

        if count > 0 {
            debug!("Rejected {} pending request(s): {}", count, error);
        }
        count
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.entries().len()
    }
}

/// RAII handle for a registered request.
#[derive(Debug)]
pub struct PendingSlot<'a> {
    table: &'a PendingTable,
    id: u64,
}

impl PendingSlot<'_> {
    /// Correlation id of this request.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.table.remove(self.id) {
            trace!("Request {} abandoned before a response arrived", self.id);
        }
    }
}

/// Turn a response envelope into the caller's result.
///
/// A response fails when it carries `success: false` or a non-null `error`.
/// The error text is sanitized before it reaches the caller.
fn interpret_response(response: Value) -> PendingResult {
    let failed = response.get("success").and_then(Value::as_bool) == Some(false);
    let error = response.get("error").filter(|e| !e.is_null());

    if failed || error.is_some() {
        let message = match error {
            Some(Value::String(text)) => sanitize_text(text),
            Some(other) => sanitize_text(&other.to_string()),
            None => String::new(),
        };
        let message = if message.is_empty() {
            "unknown error".to_string()
        } else {
            message
        };
        return Err(RpcError::Application(message));
    }

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_ids_are_monotonic_and_unique() {
        let table = PendingTable::new();
        let (a, _rx_a) = table.register("get_status");
        let (b, _rx_b) = table.register("get_status");
        let (c, _rx_c) = table.register("list_routes");

        assert!(a.id() < b.id() && b.id() < c.id());
        assert_eq!(table.len(), 3);
    }

    #[tokio::test]
    async fn test_complete_delivers_to_matching_request() {
        let table = PendingTable::new();
        let (first, rx_first) = table.register("get_status");
        let (second, rx_second) = table.register("get_status");

        assert!(table
            .complete(second.id(), json!({"id": second.id(), "success": true, "n": 2}))
            .is_ok());
        assert!(table
            .complete(first.id(), json!({"id": first.id(), "success": true, "n": 1}))
            .is_ok());

        assert_eq!(rx_first.await.unwrap().unwrap()["n"], json!(1));
        assert_eq!(rx_second.await.unwrap().unwrap()["n"], json!(2));
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_response_is_delivered_only_once() {
        let table = PendingTable::new();
        let (slot, _rx) = table.register("get_status");
        let id = slot.id();

        assert!(table.complete(id, json!({"id": id, "success": true})).is_ok());
        assert!(table.complete(id, json!({"id": id, "success": true})).is_err());
    }

    #[test]
    fn test_dropped_slot_makes_late_response_unsolicited() {
        let table = PendingTable::new();
        let (slot, rx) = table.register("execute_command");
        let id = slot.id();
        drop(slot);
        drop(rx);

        assert_eq!(table.len(), 0);
        let late = json!({"id": id, "success": true});
        assert_eq!(table.complete(id, late.clone()), Err(late));
    }

    #[tokio::test]
    async fn test_application_error_is_sanitized() {
        let table = PendingTable::new();
        let (slot, rx) = table.register("add_route");

        let _ = table.complete(
            slot.id(),
            json!({"id": slot.id(), "success": false, "error": "falha\u{1} na rota\u{fffd}"}),
        );

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err, RpcError::Application("falha na rota".to_string()));
    }

    #[tokio::test]
    async fn test_error_field_without_success_flag_fails() {
        let table = PendingTable::new();
        let (slot, rx) = table.register("delete_route");
        let _ = table.complete(slot.id(), json!({"id": slot.id(), "error": {"code": 7}}));

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err, RpcError::Application(r#"{"code":7}"#.to_string()));
    }

    #[tokio::test]
    async fn test_failure_without_message() {
        let table = PendingTable::new();
        let (slot, rx) = table.register("delete_route");
        let _ = table.complete(slot.id(), json!({"id": slot.id(), "success": false}));

        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err, RpcError::Application("unknown error".to_string()));
    }

    #[tokio::test]
    async fn test_reject_all_drains_table() {
        let table = PendingTable::new();
        let mut receivers = Vec::new();
        let mut slots = Vec::new();
        for _ in 0..4 {
            let (slot, rx) = table.register("get_status");
            slots.push(slot);
            receivers.push(rx);
        }

        let rejected = table.reject_all(&RpcError::Disconnected("socket closed".into()));
        assert_eq!(rejected, 4);
        assert_eq!(table.len(), 0);

        for rx in receivers {
            let err = rx.await.unwrap().unwrap_err();
            assert!(matches!(err, RpcError::Disconnected(_)));
        }
    }
}
