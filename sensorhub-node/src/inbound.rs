//! Inbound peer listener.
//!
//! Accepts TCP connections and runs one read loop per connection. Each
//! connection gets a writer task owning the write half, fed through the
//! session's reply channel, so handlers can answer on the connection a
//! frame arrived on without blocking the read loop.
//!
//! Any decode failure — truncation, malformed JSON, unrecognized type
//! string, oversize frame — ends the connection. The peer's liveness is
//! only refreshed for frames that decoded cleanly (that happens in the
//! dispatcher).

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};

use crate::dispatch::{Dispatcher, ReplySink, Session};
use crate::node::HubContext;
use crate::proto::{read_frame, write_frame};

/// Accept loop. Runs until the shutdown signal flips.
pub async fn serve(
    listener: TcpListener,
    hub: Arc<HubContext>,
    dispatcher: Arc<Dispatcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!(remote = %addr, "inbound connection accepted");
                        let hub = Arc::clone(&hub);
                        let dispatcher = Arc::clone(&dispatcher);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, addr, hub, dispatcher, shutdown).await;
                        });
                    }
                    Err(e) => tracing::error!("accept error: {e}"),
                }
            }
        }
    }
    tracing::info!("inbound listener stopped");
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    addr: std::net::SocketAddr,
    hub: Arc<HubContext>,
    dispatcher: Arc<Dispatcher>,
    shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();

    let (reply_tx, mut reply_rx) = mpsc::channel(64);
    let writer_remote = addr.to_string();
    let writer = tokio::spawn(async move {
        while let Some(envelope) = reply_rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &envelope).await {
                tracing::debug!(remote = %writer_remote, "session write error: {e}");
                break;
            }
        }
    });

    let session = Session::new(addr.to_string(), ReplySink::Channel(reply_tx));
    let max_frame = hub.config.max_frame_bytes;
    drive_session(read_half, hub, dispatcher, session, max_frame, shutdown).await;

    // drive_session consumed the session, so the reply sender is gone:
    // the writer drains whatever is queued and exits on its own.
    drop(writer);
    tracing::debug!(remote = %addr, "inbound connection closed");
}

/// Read frames off `reader` and dispatch each, until clean close, decode
/// error, or shutdown. Shared by inbound connections and the read side
/// of outbound links.
pub async fn drive_session<R>(
    mut reader: R,
    hub: Arc<HubContext>,
    dispatcher: Arc<Dispatcher>,
    session: Session,
    max_frame: u32,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut reader, max_frame) => {
                match frame {
                    Ok(Some(envelope)) => dispatcher.dispatch(&hub, envelope, &session).await,
                    Ok(None) => {
                        tracing::debug!(remote = %session.remote(), "session closed by peer");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(remote = %session.remote(), "frame_decode: {e}");
                        break;
                    }
                }
            }
        }
    }
}
