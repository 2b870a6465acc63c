//! Background WebSocket task for one node, with reconnect backoff.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use super::{ConnectionState, NodeCommand, NodeConnection, NodeEvent, NodeShared};
use crate::protocol::InboundMessage;

/// How long one connection attempt may take before counting as failed.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Delay before reconnect attempt `retry_count` (1-based).
///
/// `(min(retry - 1, 5) + 5)^2` seconds: 25s on the first attempt,
/// capped at 100s from the sixth attempt on.
pub(crate) fn reconnect_delay(retry_count: u32) -> Duration {
    let step = u64::from(retry_count.saturating_sub(1).min(5) + 5);
    Duration::from_secs(step * step)
}

enum SocketExit {
    /// Closed by the peer or a transport error; reconnect.
    Closed,
    /// `destroy()` was called; stop for good.
    Destroyed,
}

/// Background task managing one node socket with auto-reconnect.
pub(crate) async fn connection_loop(
    shared: Arc<NodeShared>,
    mut cmd_rx: mpsc::UnboundedReceiver<NodeCommand>,
    events: mpsc::Sender<NodeEvent>,
) {
    let key = shared.options.key();

    loop {
        *shared.state.write().await = ConnectionState::Connecting;

        let request = match client_request(&shared) {
            Ok(request) => request,
            Err(e) => {
                warn!(node = %key, error = %e, "invalid node connection parameters");
                *shared.state.write().await = ConnectionState::Disconnected;
                return;
            }
        };

        info!(node = %key, "connecting to voice node");
        match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request))
            .await
        {
            Ok(Ok((ws_stream, _))) => {
                shared.retry_count.store(0, Ordering::Relaxed);
                *shared.state.write().await = ConnectionState::Connected;
                let _ = events
                    .send(NodeEvent::Connected {
                        node: NodeConnection::from_shared(Arc::clone(&shared)),
                    })
                    .await;

                let exit = run_connected(&shared, ws_stream, &mut cmd_rx, &events).await;
                *shared.state.write().await = ConnectionState::Disconnected;
                match exit {
                    SocketExit::Destroyed => {
                        info!(node = %key, "node connection destroyed");
                        return;
                    }
                    SocketExit::Closed => {
                        // Only the transition out of Connected is
                        // reported; failed reconnects stay quiet.
                        warn!(node = %key, "voice node disconnected");
                        let _ = events
                            .send(NodeEvent::Disconnected {
                                node: NodeConnection::from_shared(Arc::clone(&shared)),
                            })
                            .await;
                    }
                }
            }
            Ok(Err(e)) => {
                warn!(node = %key, error = %e, "failed to connect to voice node");
                *shared.state.write().await = ConnectionState::Disconnected;
            }
            Err(_elapsed) => {
                warn!(node = %key, "connection attempt timed out");
                *shared.state.write().await = ConnectionState::Disconnected;
            }
        }

        let attempt = shared.retry_count.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = reconnect_delay(attempt);
        info!(node = %key, attempt, delay_secs = delay.as_secs(), "reconnecting after backoff");
        if backoff_wait(&key, &mut cmd_rx, delay).await {
            *shared.state.write().await = ConnectionState::Disconnected;
            info!(node = %key, "node connection destroyed during backoff");
            return;
        }
    }
}

/// Sleep out the backoff, discarding commands that arrive while the
/// socket is down. Returns true when `destroy()` was requested.
async fn backoff_wait(
    key: &str,
    cmd_rx: &mut mpsc::UnboundedReceiver<NodeCommand>,
    delay: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(NodeCommand::Send(_)) => {
                    debug!(node = %key, "dropping command while disconnected");
                }
                Some(NodeCommand::Destroy) | None => return true,
            },
        }
    }
}

async fn run_connected<S>(
    shared: &Arc<NodeShared>,
    ws_stream: S,
    cmd_rx: &mut mpsc::UnboundedReceiver<NodeCommand>,
    events: &mpsc::Sender<NodeEvent>,
) -> SocketExit
where
    S: futures_util::Stream<
            Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
        > + futures_util::Sink<WsMessage>
        + Unpin,
{
    let key = shared.options.key();
    let (mut ws_write, mut ws_read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = ws_read.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    handle_frame(shared, &text, events).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    return SocketExit::Closed;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(node = %key, error = %e, "websocket error");
                    return SocketExit::Closed;
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                Some(NodeCommand::Send(json)) => {
                    if ws_write.send(WsMessage::Text(json.into())).await.is_err() {
                        return SocketExit::Closed;
                    }
                }
                Some(NodeCommand::Destroy) | None => {
                    let _ = ws_write.send(WsMessage::Close(None)).await;
                    return SocketExit::Destroyed;
                }
            },
        }
    }
}

/// Parse one inbound frame. Stats mutate node state in place; anything
/// else is forwarded to the owner. Malformed frames are dropped.
async fn handle_frame(shared: &Arc<NodeShared>, text: &str, events: &mpsc::Sender<NodeEvent>) {
    let key = shared.options.key();
    match serde_json::from_str::<InboundMessage>(text) {
        Ok(InboundMessage::Stats(stats)) => {
            debug!(node = %key, players = stats.players, "stats report");
            *shared.stats.write().await = stats;
        }
        Ok(InboundMessage::Unknown) => {
            warn!(node = %key, "unknown op from node, dropping");
        }
        Ok(message) => {
            let _ = events
                .send(NodeEvent::Message {
                    node: NodeConnection::from_shared(Arc::clone(shared)),
                    message,
                })
                .await;
        }
        Err(e) => {
            warn!(node = %key, error = %e, "malformed message from node, dropping");
        }
    }
}

fn client_request(
    shared: &Arc<NodeShared>,
) -> Result<
    tokio_tungstenite::tungstenite::handshake::client::Request,
    tokio_tungstenite::tungstenite::Error,
> {
    let options = &shared.options;
    let mut request = options.ws_url().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(
        "Authorization",
        HeaderValue::from_str(&options.password)
            .map_err(|e| tokio_tungstenite::tungstenite::Error::from(
                tokio_tungstenite::tungstenite::http::Error::from(e),
            ))?,
    );
    headers.insert(
        "Num-Shards",
        HeaderValue::from_str(&options.shard_count.to_string()).map_err(|e| {
            tokio_tungstenite::tungstenite::Error::from(
                tokio_tungstenite::tungstenite::http::Error::from(e),
            )
        })?,
    );
    headers.insert(
        "User-Id",
        HeaderValue::from_str(&options.user_id).map_err(|e| {
            tokio_tungstenite::tungstenite::Error::from(
                tokio_tungstenite::tungstenite::http::Error::from(e),
            )
        })?,
    );
    Ok(request)
}
