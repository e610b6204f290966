//! Frame dispatch: routes decoded envelopes to per-type handlers.
//!
//! Handlers are registered once at startup into a `MessageType → handler`
//! table. The dispatcher validates the sender, refreshes the peer
//! table's liveness for known senders, and hands the envelope over with
//! a [`Session`] the handler can reply on — PEER_LIST answers a
//! JOIN_REQUEST on the very connection it arrived on.
//!
//! Handlers stay bounded: anything long-lived (merging, queueing) runs
//! through the state engine or the outbound manager, never inline I/O.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;

use crate::node::HubContext;
use crate::outbound::SendQueue;
use crate::proto::{error_kinds, Envelope, MessageType};

/// Where a session's replies go.
pub enum ReplySink {
    /// Inbound connection: the writer task's channel.
    Channel(mpsc::Sender<Envelope>),
    /// Outbound link: replies join the link's own send queue, keeping
    /// per-link FIFO.
    Queue(Arc<SendQueue>),
}

/// Handle to the connection a frame arrived on.
pub struct Session {
    remote: String,
    sink: ReplySink,
}

impl Session {
    pub fn new(remote: String, sink: ReplySink) -> Self {
        Self { remote, sink }
    }

    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Best-effort reply on the same connection. A reply that cannot be
    /// queued is dropped — the peer will retry whatever prompted it.
    pub fn reply(&self, envelope: Envelope) {
        match &self.sink {
            ReplySink::Channel(tx) => {
                if tx.try_send(envelope).is_err() {
                    tracing::warn!(remote = %self.remote, "reply dropped: session writer backed up");
                }
            }
            ReplySink::Queue(queue) => queue.push(envelope),
        }
    }
}

/// One registered message handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, hub: &Arc<HubContext>, envelope: Envelope, session: &Session);
}

/// The `MessageType → handler` table.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<MessageType, Box<dyn MessageHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: MessageType, handler: Box<dyn MessageHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Route one decoded envelope.
    pub async fn dispatch(&self, hub: &Arc<HubContext>, envelope: Envelope, session: &Session) {
        if envelope.sender_id.is_empty() {
            tracing::warn!(remote = %session.remote(), "envelope rejected: empty sender_id");
            session.reply(Envelope::error(
                hub.node_id(),
                error_kinds::SCHEMA_MISMATCH,
                "sender_id must be non-empty",
            ));
            return;
        }

        // Liveness refresh for known senders; unknown senders become
        // known through the membership handlers, not here.
        hub.peers.touch(&envelope.sender_id);

        match self.handlers.get(&envelope.kind) {
            Some(handler) => handler.handle(hub, envelope, session).await,
            None => {
                tracing::warn!(
                    remote = %session.remote(),
                    kind = %envelope.kind,
                    "no handler registered"
                );
                session.reply(Envelope::error(
                    hub.node_id(),
                    error_kinds::UNKNOWN_TYPE,
                    &format!("no handler for {}", envelope.kind),
                ));
            }
        }
    }
}

/// Decode a typed payload, answering `schema_mismatch` on failure.
pub fn decode_payload<T: DeserializeOwned>(
    hub: &Arc<HubContext>,
    envelope: &Envelope,
    session: &Session,
) -> Option<T> {
    match serde_json::from_value(envelope.payload.clone()) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!(
                remote = %session.remote(),
                kind = %envelope.kind,
                "schema_mismatch: {e}"
            );
            session.reply(Envelope::error(
                hub.node_id(),
                error_kinds::SCHEMA_MISMATCH,
                &format!("bad {} payload: {e}", envelope.kind),
            ));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::HubContext;
    use crate::proto::ErrorInfo;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, _hub: &Arc<HubContext>, _envelope: Envelope, _session: &Session) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn channel_session() -> (Session, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(8);
        (
            Session::new("test".into(), ReplySink::Channel(tx)),
            rx,
        )
    }

    #[tokio::test]
    async fn routes_to_the_registered_handler() {
        let hub = HubContext::for_tests("n1");
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(MessageType::Ping, Box::new(Counting(Arc::clone(&calls))));

        let (session, _rx) = channel_session();
        let envelope = Envelope::new(MessageType::Ping, "n2", json!({}));
        dispatcher.dispatch(&hub, envelope, &session).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregistered_type_gets_an_unknown_type_error() {
        let hub = HubContext::for_tests("n1");
        let dispatcher = Dispatcher::new();
        let (session, mut rx) = channel_session();

        let envelope = Envelope::new(MessageType::Ack, "n2", json!({"ref_ts_ms": 1}));
        dispatcher.dispatch(&hub, envelope, &session).await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.sender_id, "n1");
        let info: ErrorInfo = serde_json::from_value(reply.payload).unwrap();
        assert_eq!(info.kind, "unknown_type");
    }

    #[tokio::test]
    async fn empty_sender_is_rejected_without_touching_handlers() {
        let hub = HubContext::for_tests("n1");
        let calls = Arc::new(AtomicUsize::new(0));
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(MessageType::Ping, Box::new(Counting(Arc::clone(&calls))));

        let (session, mut rx) = channel_session();
        let envelope = Envelope::new(MessageType::Ping, "", json!({}));
        dispatcher.dispatch(&hub, envelope, &session).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let reply = rx.recv().await.unwrap();
        let info: ErrorInfo = serde_json::from_value(reply.payload).unwrap();
        assert_eq!(info.kind, "schema_mismatch");
    }

    #[tokio::test]
    async fn dispatch_refreshes_last_seen_for_known_senders() {
        let hub = HubContext::for_tests("n1");
        hub.peers.learn("n2", "127.0.0.1", 7171);
        let before = hub.peers.snapshot()[0].last_seen_ms;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(
            MessageType::Ping,
            Box::new(Counting(Arc::new(AtomicUsize::new(0)))),
        );
        let (session, _rx) = channel_session();
        dispatcher
            .dispatch(&hub, Envelope::new(MessageType::Ping, "n2", json!({})), &session)
            .await;

        assert!(hub.peers.snapshot()[0].last_seen_ms >= before);
    }
}
