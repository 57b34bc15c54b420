//! Liveness probing for an open socket.
//!
//! Every interval the monitor either declares the socket dead (no liveness
//! signal for more than two intervals) or sends a `get_status` probe through
//! the normal request path. A probe that times out only withholds the
//! liveness update; the staleness check on a later tick decides when to
//! reconnect.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::connection::Inner;
use super::error::RpcError;
use crate::models::Action;

/// A socket is dead once its last liveness signal is older than this many
/// intervals.
const STALE_INTERVALS: u32 = 2;

/// Staleness threshold as seen from a tick.
///
/// Ticks land on interval boundaries, so a socket that missed exactly one
/// heartbeat is about two intervals old at the next check. Half an interval of
/// slack keeps that case alive; two misses in a row still exceed it.
fn stale_after(interval: Duration) -> Duration {
    interval
        .saturating_mul(STALE_INTERVALS)
        .saturating_add(interval / 2)
}

/// Start the monitor for the socket of `generation`.
///
/// The first tick fires one interval after the socket opened. The task ends
/// by itself once that socket is gone.
pub(crate) fn spawn(
    inner: Weak<Inner>,
    generation: u64,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let threshold = stale_after(interval);

        loop {
            ticker.tick().await;

            let Some(client) = inner.upgrade() else {
                break;
            };
            let Some((target, age)) = client.liveness(generation) else {
                trace!("Heartbeat stopping (generation {})", generation);
                break;
            };

            if age > threshold {
                warn!(
                    "No heartbeat from {} for {:?}; forcing reconnect",
                    target, age
                );
                tokio::spawn(recover(client, generation, target));
                break;
            }

            // Probes run beside the ticker so a slow reply never delays the
            // staleness check.
            tokio::spawn(probe(client, generation, target, timeout));
        }
    })
}

async fn probe(client: Arc<Inner>, generation: u64, target: String, timeout: Duration) {
    let message = match serde_json::to_value(Action::status_probe(&target)) {
        Ok(message) => message,
        Err(e) => {
            warn!("Failed to encode heartbeat: {}", e);
            return;
        }
    };

    match client.dispatch(generation, &message, timeout).await {
        Ok(_) => {
            trace!("Heartbeat ok for {}", target);
            client.record_liveness(generation);
        }
        // The service answered, so the socket is alive.
        Err(RpcError::Application(e)) => {
            debug!("Heartbeat for {} answered with error: {}", target, e);
            client.record_liveness(generation);
        }
        Err(e) if e.is_timeout() => {
            warn!("Heartbeat for {} timed out after {:?}", target, timeout);
        }
        Err(e) => {
            warn!("Heartbeat for {} failed: {}", target, e);
            recover(client, generation, target).await;
        }
    }
}

/// Force the dead socket closed and reconnect right away, skipping backoff.
async fn recover(client: Arc<Inner>, generation: u64, target: String) {
    if !client.force_close(generation, "heartbeat lost") {
        return;
    }
    if client.target().as_deref() != Some(target.as_str()) {
        return;
    }

    info!("Reconnecting to {} after heartbeat loss", target);
    client.reset_reconnect_attempts();
    if let Err(e) = client.connect(&target, true).await {
        warn!("Immediate reconnect to {} failed: {}", target, e);
        client.schedule_reconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::endpoint::EndpointResolver;
    use url::Url;

    fn idle_client() -> Arc<Inner> {
        let resolver: Arc<dyn EndpointResolver> = Arc::new(|t: &str| -> Result<Url, RpcError> {
            Url::parse(&format!("ws://127.0.0.1:9/{}", t))
                .map_err(|e| RpcError::Endpoint(e.to_string()))
        });
        Arc::new(Inner::new(ClientConfig::default(), resolver))
    }

    #[tokio::test]
    async fn test_monitor_exits_without_open_socket() {
        let inner = idle_client();
        let handle = spawn(
            Arc::downgrade(&inner),
            7,
            Duration::from_millis(5),
            Duration::from_millis(5),
        );
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor should stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_monitor_exits_when_client_dropped() {
        let inner = idle_client();
        let weak = Arc::downgrade(&inner);
        drop(inner);

        let handle = spawn(weak, 0, Duration::from_millis(5), Duration::from_millis(5));
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor should stop")
            .unwrap();
    }

    #[test]
    fn test_one_missed_heartbeat_is_not_stale() {
        let interval = Duration::from_millis(100);
        // Missed the first probe: checked right on the second tick.
        assert!(interval * 2 < stale_after(interval));
        // Missed two in a row.
        assert!(interval * 3 > stale_after(interval));
    }

    #[tokio::test]
    async fn test_recover_ignores_stale_generation() {
        let inner = idle_client();
        recover(inner.clone(), 3, "r1".to_string()).await;
        assert_eq!(inner.target(), None);
    }
}
