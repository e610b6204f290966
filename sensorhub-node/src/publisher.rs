//! Replication publisher.
//!
//! A single periodic loop drains the replication buffer and broadcasts
//! the batch as one SENSOR_UPDATE envelope to every known peer. Ticks
//! are interval-aligned (next = last + period), so a slow drain doesn't
//! accumulate drift. Failures on individual links are the links'
//! problem; drops are silent by design and the next cycle carries the
//! newest value per key.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::node::HubContext;
use crate::proto::{Envelope, MessageType, SensorUpdate};

pub async fn run(hub: Arc<HubContext>, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_millis(hub.config.publish_interval_ms);
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // the first tick fires immediately; skip it

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let updates = hub.state.drain_replication_updates();
                if updates.is_empty() {
                    continue;
                }
                let count = updates.len();
                let payload = serde_json::to_value(SensorUpdate { updates })
                    .expect("sensor update serialisation is infallible");
                hub.outbound
                    .broadcast(Envelope::new(MessageType::SensorUpdate, hub.node_id(), payload));
                tracing::debug!(count, "published replication batch");
            }
        }
    }
    tracing::info!("replication publisher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::SensorEntry;
    use serde_json::json;

    #[tokio::test]
    async fn drains_and_broadcasts_local_updates() {
        let hub = HubContext::for_tests("n1");
        let dispatcher = Arc::new(crate::membership::build_dispatcher());
        hub.set_dispatcher(Arc::clone(&dispatcher));

        // A link to a dead port: its worker can't connect, so whatever
        // the publisher broadcasts stays queued for inspection.
        hub.outbound
            .ensure_bootstrap_link(&hub, &dispatcher, "127.0.0.1", 1);

        hub.state.apply_local(SensorEntry {
            key: "n1:temp".into(),
            value: json!(20),
            ts_ms: 100,
            origin: "n1".into(),
            meta: None,
        });

        let shutdown = hub.shutdown_signal();
        let task = tokio::spawn(run(Arc::clone(&hub), shutdown));
        tokio::time::sleep(Duration::from_millis(
            hub.config.publish_interval_ms * 4,
        ))
        .await;

        assert!(hub.state.drain_replication_updates().is_empty());
        let queued = hub.outbound.queue_len("bootstrap/127.0.0.1:1");
        assert!(matches!(queued, Some(n) if n >= 1), "queued: {queued:?}");

        hub.trigger_shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }

    #[tokio::test]
    async fn empty_cycles_broadcast_nothing() {
        let hub = HubContext::for_tests("n1");
        let dispatcher = Arc::new(crate::membership::build_dispatcher());
        hub.set_dispatcher(Arc::clone(&dispatcher));
        hub.outbound
            .ensure_bootstrap_link(&hub, &dispatcher, "127.0.0.1", 1);

        let shutdown = hub.shutdown_signal();
        let task = tokio::spawn(run(Arc::clone(&hub), shutdown));
        tokio::time::sleep(Duration::from_millis(
            hub.config.publish_interval_ms * 4,
        ))
        .await;

        assert_eq!(hub.outbound.queue_len("bootstrap/127.0.0.1:1"), Some(0));

        hub.trigger_shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
}
