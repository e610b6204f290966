//! Node configuration.
//!
//! Every option is reachable both as a CLI flag and an environment
//! variable. Sensor producers use an indexed `SENSOR_<i>_*` family that
//! clap cannot model, so those are read straight from the environment by
//! [`sensor_specs_from_env`]. Bad configuration aborts startup with a
//! non-zero exit.

use anyhow::{bail, Context, Result};
use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "sensorhub-node", about = "Peer-to-peer sensor hub node")]
pub struct NodeConfig {
    /// This node's identity; the LWW tie-breaker, so keep it unique.
    #[arg(long, env = "NODE_ID")]
    pub node_id: String,

    /// Bind address for the peer listener; also advertised to peers.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Peer TCP port. Advertised in JOIN_REQUEST.
    #[arg(long, env = "PORT", default_value_t = 7171)]
    pub port: u16,

    /// Comma-separated `host:port` seeds contacted at startup.
    #[arg(long, env = "BOOTSTRAP_PEERS", value_delimiter = ',')]
    pub bootstrap_peers: Vec<String>,

    /// HTTP read API port; defaults to PORT + 1000.
    #[arg(long, env = "WEB_API_PORT")]
    pub web_api_port: Option<u16>,

    /// Default log directive when RUST_LOG is unset.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Route log output to this file instead of stderr.
    #[arg(long, env = "LOG_FILE")]
    pub log_file: Option<String>,

    /// Truncate LOG_FILE at startup.
    #[arg(long, env = "CLEAR_LOG", default_value_t = false)]
    pub clear_log: bool,

    /// Emit JSON log lines.
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    /// Largest accepted wire frame, in bytes.
    #[arg(long, env = "MAX_FRAME_BYTES", default_value_t = crate::proto::DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: u32,

    /// Replication publisher period.
    #[arg(long, env = "PUBLISH_INTERVAL_MS", default_value_t = 200)]
    pub publish_interval_ms: u64,

    /// Per-peer send queue bound; overflow drops the oldest entry.
    #[arg(long, env = "SEND_QUEUE_CAP", default_value_t = 1024)]
    pub send_queue_cap: usize,

    /// Outbound connect timeout.
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,
}

impl NodeConfig {
    /// The HTTP API port, applying the PORT + 1000 default.
    pub fn web_port(&self) -> u16 {
        self.web_api_port.unwrap_or(self.port.wrapping_add(1000))
    }

    /// Startup validation; failures are `config_error` and fatal.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            bail!("config_error: NODE_ID must be a non-empty string");
        }
        if self.publish_interval_ms == 0 {
            bail!("config_error: PUBLISH_INTERVAL_MS must be positive");
        }
        if self.send_queue_cap == 0 {
            bail!("config_error: SEND_QUEUE_CAP must be positive");
        }
        for seed in &self.bootstrap_peers {
            parse_host_port(seed)
                .with_context(|| format!("config_error: bad BOOTSTRAP_PEERS entry {seed:?}"))?;
        }
        Ok(())
    }

    /// Bootstrap seeds as (host, port) pairs. Call after [`Self::validate`].
    pub fn bootstrap_addrs(&self) -> Vec<(String, u16)> {
        self.bootstrap_peers
            .iter()
            .filter_map(|s| parse_host_port(s).ok())
            .collect()
    }
}

/// Split a `host:port` string. IPv6 literals need brackets.
pub fn parse_host_port(s: &str) -> Result<(String, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .with_context(|| format!("{s:?} is not host:port"))?;
    if host.is_empty() {
        bail!("{s:?} has an empty host");
    }
    let port: u16 = port
        .parse()
        .with_context(|| format!("{s:?} has a bad port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host.to_string(), port))
}

// ---------------------------------------------------------------------------
// Sensor producer specs
// ---------------------------------------------------------------------------

/// What a synthetic producer generates.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorKind {
    /// Sine wave between `min` and `max`, one cycle per `wavelength_ms`.
    Sine { min: f64, max: f64, wavelength_ms: u64 },
    /// Uniform random draw in `[min, max]`.
    Random { min: f64, max: f64 },
    /// Random walk from the midpoint, stepping at most `step`, clamped.
    Walk { min: f64, max: f64, step: f64 },
}

/// One configured sensor producer.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSpec {
    pub name: String,
    pub kind: SensorKind,
    pub period_ms: u64,
    pub unit: Option<String>,
}

impl SensorSpec {
    /// Wire name of the kind, carried in entry `meta`.
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            SensorKind::Sine { .. } => "sine",
            SensorKind::Random { .. } => "random",
            SensorKind::Walk { .. } => "walk",
        }
    }
}

/// Read `SENSORS` and the indexed `SENSOR_<i>_*` family from the
/// process environment.
pub fn sensor_specs_from_env() -> Result<Vec<SensorSpec>> {
    let lookup = |key: String| std::env::var(&key).ok();
    sensor_specs_from(&lookup)
}

/// Testable core of [`sensor_specs_from_env`].
pub fn sensor_specs_from(lookup: &dyn Fn(String) -> Option<String>) -> Result<Vec<SensorSpec>> {
    let count: usize = match lookup("SENSORS".to_string()) {
        None => return Ok(Vec::new()),
        Some(raw) => raw
            .parse()
            .with_context(|| format!("config_error: SENSORS={raw:?} is not a count"))?,
    };

    let mut specs = Vec::with_capacity(count);
    for i in 0..count {
        let var = |suffix: &str| lookup(format!("SENSOR_{i}_{suffix}"));
        let required = |suffix: &str| {
            var(suffix)
                .with_context(|| format!("config_error: SENSOR_{i}_{suffix} is required"))
        };
        let float = |suffix: &str, default: f64| -> Result<f64> {
            match var(suffix) {
                None => Ok(default),
                Some(raw) => raw
                    .parse()
                    .with_context(|| format!("config_error: SENSOR_{i}_{suffix}={raw:?} is not a number")),
            }
        };

        let name = required("NAME")?;
        if name.is_empty() || name.contains(':') {
            bail!("config_error: SENSOR_{i}_NAME {name:?} must be non-empty and colon-free");
        }
        let period_ms: u64 = required("PERIOD_MS")?
            .parse()
            .with_context(|| format!("config_error: SENSOR_{i}_PERIOD_MS is not a duration"))?;
        if period_ms == 0 {
            bail!("config_error: SENSOR_{i}_PERIOD_MS must be positive");
        }

        let min = float("MIN", 0.0)?;
        let max = float("MAX", 100.0)?;
        if min >= max {
            bail!("config_error: SENSOR_{i} has MIN >= MAX");
        }

        let kind = match required("TYPE")?.as_str() {
            "sine" => {
                let wavelength_ms: u64 = match var("WAVELENGTH_MS") {
                    None => 60_000,
                    Some(raw) => raw.parse().with_context(|| {
                        format!("config_error: SENSOR_{i}_WAVELENGTH_MS is not a duration")
                    })?,
                };
                SensorKind::Sine { min, max, wavelength_ms }
            }
            "random" => SensorKind::Random { min, max },
            "walk" => SensorKind::Walk {
                min,
                max,
                step: float("STEP", (max - min) / 20.0)?,
            },
            other => bail!("config_error: SENSOR_{i}_TYPE {other:?} is not sine/random/walk"),
        };

        specs.push(SensorSpec {
            name,
            kind,
            period_ms,
            unit: var("UNIT"),
        });
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn specs(map: &HashMap<String, String>) -> Result<Vec<SensorSpec>> {
        sensor_specs_from(&|key| map.get(&key).cloned())
    }

    #[test]
    fn no_sensors_configured_is_fine() {
        assert!(specs(&env(&[])).unwrap().is_empty());
    }

    #[test]
    fn parses_a_full_sensor_family() {
        let map = env(&[
            ("SENSORS", "2"),
            ("SENSOR_0_TYPE", "sine"),
            ("SENSOR_0_NAME", "temp"),
            ("SENSOR_0_PERIOD_MS", "500"),
            ("SENSOR_0_MIN", "18"),
            ("SENSOR_0_MAX", "26"),
            ("SENSOR_0_WAVELENGTH_MS", "30000"),
            ("SENSOR_0_UNIT", "celsius"),
            ("SENSOR_1_TYPE", "random"),
            ("SENSOR_1_NAME", "hum"),
            ("SENSOR_1_PERIOD_MS", "1000"),
        ]);
        let specs = specs(&map).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "temp");
        assert_eq!(
            specs[0].kind,
            SensorKind::Sine { min: 18.0, max: 26.0, wavelength_ms: 30000 }
        );
        assert_eq!(specs[0].unit.as_deref(), Some("celsius"));
        assert_eq!(specs[1].kind_name(), "random");
        assert_eq!(specs[1].unit, None);
    }

    #[test]
    fn rejects_bad_sensor_config() {
        let base = [
            ("SENSORS", "1"),
            ("SENSOR_0_TYPE", "random"),
            ("SENSOR_0_NAME", "a"),
            ("SENSOR_0_PERIOD_MS", "100"),
        ];

        let mut map = env(&base);
        map.insert("SENSOR_0_NAME".into(), "a:b".into());
        assert!(specs(&map).is_err(), "colon in name must fail");

        let mut map = env(&base);
        map.insert("SENSOR_0_PERIOD_MS".into(), "0".into());
        assert!(specs(&map).is_err(), "zero period must fail");

        let mut map = env(&base);
        map.insert("SENSOR_0_TYPE".into(), "sawtooth".into());
        assert!(specs(&map).is_err(), "unknown type must fail");

        let mut map = env(&base);
        map.insert("SENSOR_0_MIN".into(), "50".into());
        map.insert("SENSOR_0_MAX".into(), "10".into());
        assert!(specs(&map).is_err(), "inverted range must fail");

        let mut map = env(&base);
        map.remove("SENSOR_0_NAME");
        assert!(specs(&map).is_err(), "missing name must fail");
    }

    #[test]
    fn host_port_parsing() {
        assert_eq!(
            parse_host_port("10.0.0.2:7171").unwrap(),
            ("10.0.0.2".to_string(), 7171)
        );
        assert_eq!(
            parse_host_port("[::1]:7171").unwrap(),
            ("::1".to_string(), 7171)
        );
        assert!(parse_host_port("nohost").is_err());
        assert!(parse_host_port(":7171").is_err());
        assert!(parse_host_port("host:notaport").is_err());
    }

    #[test]
    fn web_port_defaults_to_peer_port_plus_1000() {
        let config = NodeConfig::parse_from(["sensorhub-node", "--node-id", "n1", "--port", "7171"]);
        assert_eq!(config.web_port(), 8171);

        let config = NodeConfig::parse_from([
            "sensorhub-node",
            "--node-id",
            "n1",
            "--web-api-port",
            "9000",
        ]);
        assert_eq!(config.web_port(), 9000);
    }

    #[test]
    fn validate_rejects_blank_node_id_and_bad_seeds() {
        let config = NodeConfig::parse_from(["sensorhub-node", "--node-id", "  "]);
        assert!(config.validate().is_err());

        let config = NodeConfig::parse_from([
            "sensorhub-node",
            "--node-id",
            "n1",
            "--bootstrap-peers",
            "10.0.0.2:7171,garbage",
        ]);
        assert!(config.validate().is_err());

        let config = NodeConfig::parse_from([
            "sensorhub-node",
            "--node-id",
            "n1",
            "--bootstrap-peers",
            "10.0.0.2:7171,10.0.0.3:7171",
        ]);
        assert!(config.validate().is_ok());
        assert_eq!(config.bootstrap_addrs().len(), 2);
    }
}
