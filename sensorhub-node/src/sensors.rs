//! Synthetic sensor producers.
//!
//! One task per configured sensor, emitting a reading on its period and
//! feeding it to the state engine as a local entry. The producer owns
//! key construction: `"<node_id>:<sensor_name>"`, timestamped at
//! emission.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::watch;

use crate::config::{SensorKind, SensorSpec};
use crate::node::HubContext;
use crate::proto::{now_ms, SensorEntry};

/// Spawn one producer task per spec.
pub fn spawn_producers(hub: &Arc<HubContext>, specs: Vec<SensorSpec>) {
    for spec in specs {
        tracing::info!(
            sensor = %spec.name,
            kind = spec.kind_name(),
            period_ms = spec.period_ms,
            "starting sensor producer"
        );
        tokio::spawn(run_producer(
            Arc::clone(hub),
            spec,
            hub.shutdown_signal(),
        ));
    }
}

async fn run_producer(hub: Arc<HubContext>, spec: SensorSpec, mut shutdown: watch::Receiver<bool>) {
    let key = format!("{}:{}", hub.node_id(), spec.name);
    let started = Instant::now();
    let mut walk_state = match spec.kind {
        SensorKind::Walk { min, max, .. } => (min + max) / 2.0,
        _ => 0.0,
    };

    let mut interval = tokio::time::interval(Duration::from_millis(spec.period_ms));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let value = next_value(&spec.kind, started.elapsed(), &mut walk_state);
                let entry = SensorEntry {
                    key: key.clone(),
                    value: serde_json::json!(value),
                    ts_ms: now_ms(),
                    origin: hub.node_id().to_string(),
                    meta: Some(meta_for(&spec)),
                };
                hub.state.apply_local(entry);
            }
        }
    }
    tracing::debug!(sensor = %spec.name, "sensor producer stopped");
}

fn meta_for(spec: &SensorSpec) -> serde_json::Map<String, serde_json::Value> {
    let mut meta = serde_json::Map::new();
    meta.insert("type".into(), spec.kind_name().into());
    meta.insert("period_ms".into(), spec.period_ms.into());
    if let Some(unit) = &spec.unit {
        meta.insert("unit".into(), unit.as_str().into());
    }
    meta
}

/// Produce the next reading, rounded to two decimals.
fn next_value(kind: &SensorKind, elapsed: Duration, walk_state: &mut f64) -> f64 {
    let raw = match kind {
        SensorKind::Sine { min, max, wavelength_ms } => {
            let mid = (min + max) / 2.0;
            let amplitude = (max - min) / 2.0;
            let phase = elapsed.as_millis() as f64 / *wavelength_ms as f64;
            mid + amplitude * (phase * std::f64::consts::TAU).sin()
        }
        SensorKind::Random { min, max } => rand::thread_rng().gen_range(*min..=*max),
        SensorKind::Walk { min, max, step } => {
            *walk_state = (*walk_state + rand::thread_rng().gen_range(-*step..=*step))
                .clamp(*min, *max);
            *walk_state
        }
    };
    (raw * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_stays_inside_its_range() {
        let kind = SensorKind::Sine { min: 10.0, max: 20.0, wavelength_ms: 1000 };
        let mut unused = 0.0;
        for ms in (0..5000).step_by(37) {
            let v = next_value(&kind, Duration::from_millis(ms), &mut unused);
            assert!((10.0..=20.0).contains(&v), "sine out of range: {v}");
        }
    }

    #[test]
    fn random_stays_inside_its_range() {
        let kind = SensorKind::Random { min: -5.0, max: 5.0 };
        let mut unused = 0.0;
        for _ in 0..200 {
            let v = next_value(&kind, Duration::ZERO, &mut unused);
            assert!((-5.0..=5.0).contains(&v), "random out of range: {v}");
        }
    }

    #[test]
    fn walk_is_clamped_and_stateful() {
        let kind = SensorKind::Walk { min: 0.0, max: 1.0, step: 10.0 };
        let mut state = 0.5;
        for _ in 0..50 {
            let v = next_value(&kind, Duration::ZERO, &mut state);
            assert!((0.0..=1.0).contains(&v), "walk escaped its clamp: {v}");
            assert_eq!(v, (state * 100.0).round() / 100.0);
        }
    }

    #[tokio::test]
    async fn producer_feeds_the_state_engine() {
        let hub = HubContext::for_tests("n1");
        let spec = SensorSpec {
            name: "temp".into(),
            kind: SensorKind::Random { min: 18.0, max: 26.0 },
            period_ms: 10,
            unit: Some("celsius".into()),
        };
        spawn_producers(&hub, vec![spec]);

        tokio::time::sleep(Duration::from_millis(80)).await;
        hub.trigger_shutdown();

        let snapshot = hub.state.snapshot_state();
        let entry = &snapshot["n1"]["temp"];
        assert_eq!(entry.key, "n1:temp");
        assert_eq!(entry.origin, "n1");
        assert!(entry.ts_ms > 0);
        let meta = entry.meta.as_ref().unwrap();
        assert_eq!(meta["unit"], "celsius");
        assert_eq!(meta["type"], "random");

        // Locally produced readings are queued for replication.
        assert!(!hub.state.drain_replication_updates().is_empty());
    }
}
