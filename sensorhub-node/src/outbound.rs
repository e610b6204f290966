//! Outbound peer links.
//!
//! One worker per known peer, owning a bounded FIFO send queue and a
//! single persistent TCP connection to the peer's listen address.
//! Workers reconnect under exponential backoff and also read frames off
//! their connection: PEER_LIST answers to our JOIN_REQUESTs come back on
//! the same socket we sent them on.
//!
//! Enqueueing never blocks. A full queue drops its oldest entry —
//! replication is best-effort and the next publish cycle carries the
//! newest value per key anyway.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{watch, Notify};

use crate::dispatch::{Dispatcher, ReplySink, Session};
use crate::node::HubContext;
use crate::proto::Envelope;

/// Delay ladder for reconnect attempts: 0.5 s, doubling to a 10 s cap,
/// reset on a successful connect.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    const INITIAL: Duration = Duration::from_millis(500);
    const MAX: Duration = Duration::from_secs(10);

    pub fn new() -> Self {
        Self {
            current: Self::INITIAL,
        }
    }

    /// The delay to sleep before the next attempt; advances the ladder.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(Self::MAX);
        delay
    }

    pub fn reset(&mut self) {
        self.current = Self::INITIAL;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded FIFO of serializable envelopes with drop-oldest overflow.
pub struct SendQueue {
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    cap: usize,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SendQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            cap,
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking enqueue. At capacity the oldest entry is dropped and
    /// the overflow counter increments.
    pub fn push(&self, envelope: Envelope) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.cap {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("queue_overflow: dropped oldest queued envelope");
            }
            queue.push_back(envelope);
        }
        self.notify.notify_one();
    }

    pub fn pop(&self) -> Option<Envelope> {
        self.queue.lock().pop_front()
    }

    /// Wait for the next envelope; `None` once the queue is closed and
    /// drained.
    pub async fn recv(&self) -> Option<Envelope> {
        loop {
            if let Some(envelope) = self.pop() {
                return Some(envelope);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// A single outbound link: queue plus the target address its worker dials.
pub struct Link {
    key: String,
    target: Mutex<(String, u16)>,
    pub queue: Arc<SendQueue>,
    reconnects: AtomicU64,
}

impl Link {
    fn target(&self) -> (String, u16) {
        self.target.lock().clone()
    }
}

/// Registry of outbound links.
///
/// Links are keyed by peer `node_id`; bootstrap addresses whose identity
/// is not yet known get a provisional link keyed by `bootstrap/<addr>`,
/// retired once the peer's first PEER_LIST reveals its node_id.
pub struct OutboundManager {
    queue_cap: usize,
    connect_timeout: Duration,
    max_frame: u32,
    links: Mutex<HashMap<String, Arc<Link>>>,
    shutdown: watch::Receiver<bool>,
}

impl OutboundManager {
    pub fn new(
        queue_cap: usize,
        connect_timeout: Duration,
        max_frame: u32,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            queue_cap,
            connect_timeout,
            max_frame,
            links: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    fn bootstrap_key(host: &str, port: u16) -> String {
        format!("bootstrap/{host}:{port}")
    }

    /// Ensure a link keyed by `node_id` exists and targets `host:port`,
    /// spawning its worker on first sight. A provisional bootstrap link
    /// dialing the same address is retired in favour of the real one.
    pub fn ensure_link(
        &self,
        hub: &Arc<HubContext>,
        dispatcher: &Arc<Dispatcher>,
        node_id: &str,
        host: &str,
        port: u16,
    ) {
        let mut links = self.links.lock();
        if let Some(link) = links.get(node_id) {
            *link.target.lock() = (host.to_string(), port);
            return;
        }
        if let Some(provisional) = links.remove(&Self::bootstrap_key(host, port)) {
            tracing::debug!(peer = %node_id, %host, port, "retiring provisional bootstrap link");
            provisional.queue.close();
        }
        let link = self.spawn_link(hub, dispatcher, node_id.to_string(), host, port);
        links.insert(node_id.to_string(), link);
    }

    /// Start a provisional link to a bootstrap address whose node_id is
    /// not yet known.
    pub fn ensure_bootstrap_link(
        &self,
        hub: &Arc<HubContext>,
        dispatcher: &Arc<Dispatcher>,
        host: &str,
        port: u16,
    ) -> Arc<SendQueue> {
        let key = Self::bootstrap_key(host, port);
        let mut links = self.links.lock();
        if let Some(link) = links.get(&key) {
            return Arc::clone(&link.queue);
        }
        let link = self.spawn_link(hub, dispatcher, key.clone(), host, port);
        let queue = Arc::clone(&link.queue);
        links.insert(key, link);
        queue
    }

    fn spawn_link(
        &self,
        hub: &Arc<HubContext>,
        dispatcher: &Arc<Dispatcher>,
        key: String,
        host: &str,
        port: u16,
    ) -> Arc<Link> {
        let link = Arc::new(Link {
            key: key.clone(),
            target: Mutex::new((host.to_string(), port)),
            queue: Arc::new(SendQueue::new(self.queue_cap)),
            reconnects: AtomicU64::new(0),
        });
        tracing::info!(link = %key, %host, port, "starting outbound link worker");
        tokio::spawn(run_link(
            Arc::clone(&link),
            Arc::clone(hub),
            Arc::clone(dispatcher),
            self.connect_timeout,
            self.max_frame,
            self.shutdown.clone(),
        ));
        link
    }

    /// Enqueue to one peer. Returns false when no link exists for it.
    pub fn send(&self, node_id: &str, envelope: Envelope) -> bool {
        match self.links.lock().get(node_id) {
            Some(link) => {
                link.queue.push(envelope);
                true
            }
            None => false,
        }
    }

    /// Enqueue a copy to every link (peers and pending bootstraps). The
    /// manager never holds a link to this node itself.
    pub fn broadcast(&self, envelope: Envelope) {
        let links = self.links.lock();
        for link in links.values() {
            link.queue.push(envelope.clone());
        }
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    /// Queue depth for a link, if one exists under this key.
    pub fn queue_len(&self, key: &str) -> Option<usize> {
        self.links.lock().get(key).map(|l| l.queue.len())
    }

    /// Total envelopes dropped to queue overflow, across links.
    pub fn dropped_total(&self) -> u64 {
        self.links
            .lock()
            .values()
            .map(|l| l.queue.dropped())
            .sum()
    }

    /// Total reconnect attempts across links.
    pub fn reconnects_total(&self) -> u64 {
        self.links
            .lock()
            .values()
            .map(|l| l.reconnects.load(Ordering::Relaxed))
            .sum()
    }

    /// Close every queue so workers drain and exit.
    pub fn close_all(&self) {
        for link in self.links.lock().values() {
            link.queue.close();
        }
    }
}

/// Dial with keepalive enabled so the OS reports silent peer failures.
async fn connect(host: &str, port: u16) -> std::io::Result<TcpStream> {
    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    let addr = addrs.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "address resolved to nothing")
    })?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;
    socket.connect(addr).await
}

/// Per-link worker: connect under backoff, then shuttle queued envelopes
/// out and inbound replies into the dispatcher until the link dies.
async fn run_link(
    link: Arc<Link>,
    hub: Arc<HubContext>,
    dispatcher: Arc<Dispatcher>,
    connect_timeout: Duration,
    max_frame: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new();

    'reconnect: loop {
        if link.queue.is_closed() || *shutdown.borrow() {
            break;
        }

        let (host, port) = link.target();
        let attempt = tokio::select! {
            result = tokio::time::timeout(connect_timeout, connect(&host, port)) => {
                result.unwrap_or_else(|_| {
                    Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))
                })
            }
            _ = shutdown.changed() => break 'reconnect,
        };
        let stream = match attempt {
            Ok(stream) => stream,
            Err(e) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    link = %link.key, %host, port,
                    backoff_ms = delay.as_millis() as u64,
                    "connect_failed: {e}"
                );
                link.reconnects.fetch_add(1, Ordering::Relaxed);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue 'reconnect,
                    _ = shutdown.changed() => break 'reconnect,
                }
            }
        };

        backoff.reset();
        tracing::info!(link = %link.key, %host, port, "outbound link connected");

        let (read_half, mut write_half) = stream.into_split();

        // Replies to frames the peer sends down this socket re-enter our
        // queue, keeping per-link FIFO with everything else we send.
        let session = Session::new(
            format!("{host}:{port}"),
            ReplySink::Queue(Arc::clone(&link.queue)),
        );
        let reader_hub = Arc::clone(&hub);
        let reader_dispatcher = Arc::clone(&dispatcher);
        let reader_shutdown = shutdown.clone();
        let mut reader = tokio::spawn(async move {
            crate::inbound::drive_session(
                read_half,
                reader_hub,
                reader_dispatcher,
                session,
                max_frame,
                reader_shutdown,
            )
            .await;
        });

        loop {
            tokio::select! {
                envelope = link.queue.recv() => {
                    let Some(envelope) = envelope else {
                        // Queue closed: drained, worker done.
                        reader.abort();
                        break 'reconnect;
                    };
                    if let Err(e) = crate::proto::write_frame(&mut write_half, &envelope).await {
                        // The popped envelope is in flight and lost; the
                        // rest of the queue survives for the next connect.
                        tracing::warn!(link = %link.key, "send_failed: {e}");
                        reader.abort();
                        continue 'reconnect;
                    }
                }
                _ = &mut reader => {
                    tracing::debug!(link = %link.key, "outbound link read side closed");
                    continue 'reconnect;
                }
                _ = shutdown.changed() => {
                    reader.abort();
                    break 'reconnect;
                }
            }
        }
    }

    tracing::debug!(link = %link.key, "outbound link worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::MessageType;
    use serde_json::json;

    fn envelope(n: i64) -> Envelope {
        Envelope {
            kind: MessageType::Ping,
            sender_id: "n1".into(),
            ts_ms: n,
            payload: json!({}),
        }
    }

    #[test]
    fn backoff_ladder_caps_at_ten_seconds() {
        let mut backoff = Backoff::new();
        let delays: Vec<f64> = (0..7).map(|_| backoff.next_delay().as_secs_f64()).collect();
        assert_eq!(delays, [0.5, 1.0, 2.0, 4.0, 8.0, 10.0, 10.0]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn queue_is_fifo() {
        let queue = SendQueue::new(8);
        for n in 0..3 {
            queue.push(envelope(n));
        }
        let order: Vec<i64> = (0..3).map(|_| queue.pop().unwrap().ts_ms).collect();
        assert_eq!(order, [0, 1, 2]);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = SendQueue::new(3);
        for n in 0..5 {
            queue.push(envelope(n));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        // The two oldest (0, 1) are gone; the head is now 2.
        assert_eq!(queue.pop().unwrap().ts_ms, 2);
        assert_eq!(queue.pop().unwrap().ts_ms, 3);
        assert_eq!(queue.pop().unwrap().ts_ms, 4);
    }

    #[tokio::test]
    async fn recv_wakes_on_push_and_ends_on_close() {
        let queue = Arc::new(SendQueue::new(4));

        let waiter = Arc::clone(&queue);
        let handle = tokio::spawn(async move { waiter.recv().await });
        tokio::task::yield_now().await;
        queue.push(envelope(42));
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got.ts_ms, 42);

        queue.close();
        assert!(queue.recv().await.is_none());
    }
}
