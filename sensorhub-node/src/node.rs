//! Node wiring and lifecycle.
//!
//! [`HubContext`] bundles the shared subsystems every handler and worker
//! needs: configuration, the LWW state engine, the peer table, and the
//! outbound link manager. [`Node`] builds the context, binds the
//! listeners, spawns the subsystem tasks, seeds the bootstrap joins, and
//! parks until a shutdown signal — which a watch channel then fans out
//! to every loop.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::{NodeConfig, SensorSpec};
use crate::dispatch::Dispatcher;
use crate::outbound::OutboundManager;
use crate::peers::PeerTable;
use crate::state::HubState;

/// Shared hub of subsystems, handed to handlers and workers as
/// `Arc<HubContext>`.
pub struct HubContext {
    pub config: NodeConfig,
    pub state: HubState,
    pub peers: PeerTable,
    pub outbound: OutboundManager,
    /// Set once during startup wiring; outbound link read loops need it.
    dispatcher: OnceLock<Arc<Dispatcher>>,
    /// The port the peer listener actually bound (differs from
    /// `config.port` when 0 was requested).
    listen_port: OnceLock<u16>,
    started_at: Instant,
    shutdown: watch::Sender<bool>,
}

impl HubContext {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let outbound = OutboundManager::new(
            config.send_queue_cap,
            Duration::from_millis(config.connect_timeout_ms),
            config.max_frame_bytes,
            shutdown_rx,
        );
        Arc::new(Self {
            state: HubState::new(&config.node_id),
            peers: PeerTable::new(&config.node_id),
            outbound,
            dispatcher: OnceLock::new(),
            listen_port: OnceLock::new(),
            started_at: Instant::now(),
            shutdown: shutdown_tx,
            config,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn set_dispatcher(&self, dispatcher: Arc<Dispatcher>) {
        let _ = self.dispatcher.set(dispatcher);
    }

    pub fn set_listen_port(&self, port: u16) {
        let _ = self.listen_port.set(port);
    }

    /// The port peers should dial, as advertised in JOIN_REQUEST and
    /// PEER_LIST entries.
    pub fn advertised_port(&self) -> u16 {
        self.listen_port.get().copied().unwrap_or(self.config.port)
    }

    /// Start (or retarget) the outbound link for a known peer.
    pub fn connect_peer(self: &Arc<Self>, node_id: &str, host: &str, port: u16) {
        let Some(dispatcher) = self.dispatcher.get() else {
            tracing::warn!(peer = %node_id, "connect_peer before wiring finished");
            return;
        };
        self.outbound
            .ensure_link(self, dispatcher, node_id, host, port);
    }

    /// Dial a bootstrap address whose node_id we don't know yet and
    /// queue a JOIN_REQUEST on it.
    pub fn connect_bootstrap(self: &Arc<Self>, host: &str, port: u16) {
        let Some(dispatcher) = self.dispatcher.get() else {
            tracing::warn!(%host, port, "connect_bootstrap before wiring finished");
            return;
        };
        let queue = self
            .outbound
            .ensure_bootstrap_link(self, dispatcher, host, port);
        queue.push(crate::membership::join_envelope(self));
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Idempotent: flipping the flag twice is harmless.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Minimal context for unit tests: no listeners, fast publisher.
    #[cfg(test)]
    pub fn for_tests(node_id: &str) -> Arc<Self> {
        use clap::Parser;
        let config = NodeConfig::parse_from([
            "sensorhub-node",
            "--node-id",
            node_id,
            "--host",
            "127.0.0.1",
            "--publish-interval-ms",
            "20",
            "--connect-timeout-ms",
            "200",
        ]);
        Self::new(config)
    }
}

/// A configured node, ready to start.
pub struct Node {
    config: NodeConfig,
    sensors: Vec<SensorSpec>,
}

/// Handle to a started node: the context plus the bound addresses.
pub struct RunningNode {
    pub hub: Arc<HubContext>,
    pub peer_addr: std::net::SocketAddr,
    pub web_addr: std::net::SocketAddr,
}

impl RunningNode {
    pub fn shutdown(&self) {
        self.hub.trigger_shutdown();
        self.hub.outbound.close_all();
    }
}

impl Node {
    pub fn new(config: NodeConfig, sensors: Vec<SensorSpec>) -> Self {
        Self { config, sensors }
    }

    /// Bind listeners, spawn every subsystem, seed the bootstrap joins.
    pub async fn start(self) -> Result<RunningNode> {
        self.config.validate()?;

        let hub = HubContext::new(self.config.clone());
        let dispatcher = Arc::new(crate::membership::build_dispatcher());
        hub.set_dispatcher(Arc::clone(&dispatcher));

        let peer_listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .with_context(|| {
                format!("cannot bind peer listener on {}:{}", self.config.host, self.config.port)
            })?;
        let peer_addr = peer_listener.local_addr()?;
        hub.set_listen_port(peer_addr.port());
        tracing::info!(node_id = %hub.node_id(), "peer listener on {peer_addr}");

        let web_listener = TcpListener::bind((self.config.host.as_str(), self.config.web_port()))
            .await
            .with_context(|| {
                format!(
                    "cannot bind HTTP API on {}:{}",
                    self.config.host,
                    self.config.web_port()
                )
            })?;
        let web_addr = web_listener.local_addr()?;
        tracing::info!("HTTP API on {web_addr}");

        tokio::spawn(crate::inbound::serve(
            peer_listener,
            Arc::clone(&hub),
            Arc::clone(&dispatcher),
            hub.shutdown_signal(),
        ));
        tokio::spawn(crate::web::serve(
            web_listener,
            Arc::clone(&hub),
            hub.shutdown_signal(),
        ));
        tokio::spawn(crate::publisher::run(
            Arc::clone(&hub),
            hub.shutdown_signal(),
        ));
        crate::sensors::spawn_producers(&hub, self.sensors);

        // The node keeps producing regardless of whether any seed
        // answers; joins retry under the links' backoff.
        for (host, port) in self.config.bootstrap_addrs() {
            tracing::info!(%host, port, "contacting bootstrap peer");
            hub.connect_bootstrap(&host, port);
        }

        Ok(RunningNode { hub, peer_addr, web_addr })
    }

    /// Start and block until SIGINT/SIGTERM, then shut down within a
    /// bounded grace period.
    pub async fn run(self) -> Result<()> {
        let running = self.start().await?;

        wait_for_signal().await;
        tracing::info!("shutting down");
        running.shutdown();
        // Let in-flight sends and loops observe the flag.
        tokio::time::sleep(Duration::from_millis(250)).await;
        tracing::info!("shutdown complete");
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sig) => sig,
        Err(e) => {
            tracing::error!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received ctrl-c");
}
