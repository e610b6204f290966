//! Protocol handlers: membership gossip, liveness, and state replication.
//!
//! Membership converges by transitive closure: a JOIN_REQUEST earns a
//! PEER_LIST of everything the receiver knows (itself included), and
//! every *new* name in a received PEER_LIST gets an outbound link and a
//! JOIN_REQUEST of its own. Peers that are already known are never
//! re-joined — address refreshes don't re-trigger the exchange — which
//! keeps a dense graph from ringing.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::dispatch::{decode_payload, Dispatcher, MessageHandler, Session};
use crate::node::HubContext;
use crate::proto::{
    error_kinds, Envelope, ErrorInfo, JoinRequest, MessageType, PeerInfo, PeerList, SensorUpdate,
};

/// Build the full handler table for a hub node.
pub fn build_dispatcher() -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(MessageType::JoinRequest, Box::new(JoinRequestHandler));
    dispatcher.register(MessageType::PeerList, Box::new(PeerListHandler));
    dispatcher.register(MessageType::Ping, Box::new(PingHandler));
    dispatcher.register(MessageType::Pong, Box::new(PongHandler));
    dispatcher.register(MessageType::SensorUpdate, Box::new(SensorUpdateHandler));
    dispatcher.register(MessageType::Ack, Box::new(AckHandler));
    dispatcher.register(MessageType::Error, Box::new(ErrorHandler));
    dispatcher.register(MessageType::GossipState, Box::new(NotImplementedHandler));
    dispatcher.register(MessageType::FullSyncRequest, Box::new(NotImplementedHandler));
    dispatcher.register(MessageType::FullSyncResponse, Box::new(NotImplementedHandler));
    dispatcher
}

/// The JOIN_REQUEST this node sends, advertising its own listen address.
pub fn join_envelope(hub: &HubContext) -> Envelope {
    let payload = serde_json::to_value(JoinRequest {
        host: hub.config.host.clone(),
        port: hub.advertised_port(),
    })
    .expect("join payload serialisation is infallible");
    Envelope::new(MessageType::JoinRequest, hub.node_id(), payload)
}

/// A PEER_LIST of everything this node knows, itself included.
pub fn peer_list_envelope(hub: &HubContext) -> Envelope {
    let mut peers: Vec<PeerInfo> = hub.peers.snapshot().iter().map(|p| p.info()).collect();
    peers.push(PeerInfo {
        node_id: hub.node_id().to_string(),
        host: hub.config.host.clone(),
        port: hub.advertised_port(),
    });
    let payload =
        serde_json::to_value(PeerList { peers }).expect("peer list serialisation is infallible");
    Envelope::new(MessageType::PeerList, hub.node_id(), payload)
}

/// Gossip the updated table to every link. Called only when something
/// NEW was learned, so a converged cluster goes quiet: a PEER_LIST full
/// of known names triggers nothing further.
fn announce_peers(hub: &Arc<HubContext>) {
    hub.outbound.broadcast(peer_list_envelope(hub));
}

/// JOIN_REQUEST: learn the sender, answer with our full peer list on the
/// same session.
struct JoinRequestHandler;

#[async_trait]
impl MessageHandler for JoinRequestHandler {
    async fn handle(&self, hub: &Arc<HubContext>, envelope: Envelope, session: &Session) {
        let Some(join): Option<JoinRequest> = decode_payload(hub, &envelope, session) else {
            return;
        };

        if hub.peers.learn(&envelope.sender_id, &join.host, join.port) {
            hub.connect_peer(&envelope.sender_id, &join.host, join.port);
            // Existing peers hear about the newcomer without having to
            // re-join us; closure survives any join/bootstrap ordering.
            announce_peers(hub);
        } else {
            hub.peers
                .refresh_address(&envelope.sender_id, &join.host, join.port);
        }

        session.reply(peer_list_envelope(hub));
    }
}

/// PEER_LIST: union the sender's knowledge into ours. Every new name
/// gets a link and a transitive JOIN_REQUEST.
struct PeerListHandler;

#[async_trait]
impl MessageHandler for PeerListHandler {
    async fn handle(&self, hub: &Arc<HubContext>, envelope: Envelope, session: &Session) {
        let Some(list): Option<PeerList> = decode_payload(hub, &envelope, session) else {
            return;
        };

        let mut learned_any = false;
        for entry in list.peers {
            if entry.node_id == hub.node_id() {
                continue;
            }
            if hub.peers.learn(&entry.node_id, &entry.host, entry.port) {
                learned_any = true;
                hub.connect_peer(&entry.node_id, &entry.host, entry.port);
                // Introduce ourselves so the new peer learns us (and our
                // neighbours) in turn. Known peers are never re-joined.
                hub.outbound.send(&entry.node_id, join_envelope(hub));
            } else {
                hub.peers
                    .refresh_address(&entry.node_id, &entry.host, entry.port);
            }
        }
        if learned_any {
            announce_peers(hub);
        }
    }
}

/// PING: answer PONG on the same session. No heartbeat loop drives this;
/// receipt alone refreshes the sender's liveness.
struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, hub: &Arc<HubContext>, _envelope: Envelope, session: &Session) {
        session.reply(Envelope::new(MessageType::Pong, hub.node_id(), json!({})));
    }
}

/// PONG: nothing beyond the dispatcher's liveness refresh.
struct PongHandler;

#[async_trait]
impl MessageHandler for PongHandler {
    async fn handle(&self, _hub: &Arc<HubContext>, _envelope: Envelope, _session: &Session) {}
}

/// SENSOR_UPDATE: merge each entry. The state engine is bounded and
/// thread-safe, so merging inline on the read loop is fine.
struct SensorUpdateHandler;

#[async_trait]
impl MessageHandler for SensorUpdateHandler {
    async fn handle(&self, hub: &Arc<HubContext>, envelope: Envelope, session: &Session) {
        let Some(update): Option<SensorUpdate> = decode_payload(hub, &envelope, session) else {
            return;
        };
        let total = update.updates.len();
        let mut accepted = 0usize;
        for entry in update.updates {
            if hub.state.apply_remote(entry) {
                accepted += 1;
            }
        }
        tracing::debug!(
            from = %envelope.sender_id,
            accepted,
            total,
            "merged remote sensor updates"
        );
    }
}

/// ACK is reserved; accept and ignore.
struct AckHandler;

#[async_trait]
impl MessageHandler for AckHandler {
    async fn handle(&self, _hub: &Arc<HubContext>, envelope: Envelope, _session: &Session) {
        tracing::debug!(from = %envelope.sender_id, "ignoring reserved ACK");
    }
}

/// Inbound ERROR: log it, never answer it. Answering would let two nodes
/// volley errors forever.
struct ErrorHandler;

#[async_trait]
impl MessageHandler for ErrorHandler {
    async fn handle(&self, _hub: &Arc<HubContext>, envelope: Envelope, session: &Session) {
        match serde_json::from_value::<ErrorInfo>(envelope.payload) {
            Ok(info) => tracing::warn!(
                from = %envelope.sender_id,
                remote = %session.remote(),
                kind = %info.kind,
                "peer reported error: {}",
                info.detail
            ),
            Err(_) => tracing::warn!(
                from = %envelope.sender_id,
                remote = %session.remote(),
                "peer reported an unreadable error"
            ),
        }
    }
}

/// GOSSIP_STATE / FULL_SYNC_*: wire-compatible but not implemented.
struct NotImplementedHandler;

#[async_trait]
impl MessageHandler for NotImplementedHandler {
    async fn handle(&self, hub: &Arc<HubContext>, envelope: Envelope, session: &Session) {
        session.reply(Envelope::error(
            hub.node_id(),
            error_kinds::NOT_IMPLEMENTED,
            &format!("{} is reserved", envelope.kind),
        ));
    }
}
