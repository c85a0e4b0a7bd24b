//! `/ws` subscription endpoint.
//!
//! The handshake validates the query and extracts the credential; the
//! authorizer is consulted once the socket is open, so a denial can be
//! reported with a close code. Each accepted socket runs as a reader and a
//! writer sharing one cancellation token: whichever side fails first tears
//! down the other and removes the subscriber from the hub.

use crate::auth::Authorizer;
use crate::hub::{ChannelKind, HubHandle, Subscriber};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_INTERNAL_ERROR: u16 = 1011;

#[derive(Debug, Clone, Copy)]
pub struct KeepaliveSettings {
    pub ping_period: Duration,
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub outbound_capacity: usize,
    pub max_inbound_bytes: usize,
}

impl Default for KeepaliveSettings {
    fn default() -> Self {
        Self {
            ping_period: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            outbound_capacity: 64,
            max_inbound_bytes: 512,
        }
    }
}

#[derive(Clone)]
pub struct WsState {
    pub hub: HubHandle,
    pub authorizer: Arc<dyn Authorizer>,
    pub keepalive: KeepaliveSettings,
    /// Parent of every subscriber's token.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeQuery {
    #[serde(rename = "deviceId", alias = "subjectKey")]
    subject: Option<String>,
    #[serde(rename = "connType")]
    conn_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Credential {
    token: String,
    /// Carried in Sec-WebSocket-Protocol, which must then be echoed back.
    from_protocol: bool,
}

fn credential(headers: &HeaderMap) -> Option<Credential> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(token) = bearer {
        return Some(Credential {
            token: token.to_string(),
            from_protocol: false,
        });
    }

    headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(|token| Credential {
            token: token.to_string(),
            from_protocol: true,
        })
}

fn subscription(query: SubscribeQuery) -> Option<(String, ChannelKind)> {
    let subject = query.subject.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())?;
    let kind = query.conn_type?.parse::<ChannelKind>().ok()?;
    Some((subject, kind))
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<SubscribeQuery>,
    State(state): State<WsState>,
) -> Response {
    let Some(presented) = credential(&headers) else {
        return (StatusCode::UNAUTHORIZED, "Missing authentication token").into_response();
    };

    let Some((subject, kind)) = subscription(query) else {
        return (
            StatusCode::BAD_REQUEST,
            "deviceId and connType (consumption, status or aggregate) are required",
        )
            .into_response();
    };

    let ws = if presented.from_protocol {
        ws.protocols([presented.token.clone()])
    } else {
        ws
    };

    ws.on_upgrade(move |socket| serve_subscriber(socket, state, presented.token, subject, kind))
}

async fn serve_subscriber(
    mut socket: WebSocket,
    state: WsState,
    token: String,
    subject: String,
    kind: ChannelKind,
) {
    match state.authorizer.authorize(&token).await {
        Ok(true) => {}
        Ok(false) => {
            warn!("Rejected {} subscription for {}: unauthorized", kind, subject);
            close(&mut socket, CLOSE_POLICY_VIOLATION, "unauthorized").await;
            return;
        }
        Err(e) => {
            error!("Authorization check failed: {}", e);
            close(&mut socket, CLOSE_INTERNAL_ERROR, "authorization unavailable").await;
            return;
        }
    }

    let keepalive = state.keepalive;
    let id = Uuid::new_v4();
    let cancel = state.shutdown.child_token();
    let (outbound_tx, outbound_rx) = mpsc::channel(keepalive.outbound_capacity);

    let registered = state
        .hub
        .register(Subscriber {
            id,
            subject: subject.clone(),
            kind,
            outbound: outbound_tx,
            cancel: cancel.clone(),
        })
        .await;
    if registered.is_err() {
        close(&mut socket, CLOSE_GOING_AWAY, "shutting down").await;
        return;
    }
    info!("Subscriber {} connected for {} on {}", id, subject, kind);

    let (sink, stream) = socket.split();
    let last_pong = pump(id, sink, stream, outbound_rx, cancel, &state.hub, keepalive).await;
    info!(
        "Subscriber {} disconnected, last pong {:?} ago",
        id,
        last_pong.elapsed()
    );
}

/// Runs the writer and reader of one registered subscriber until either
/// side stops, then removes it from the hub.
async fn pump<Si, St, E>(
    id: Uuid,
    sink: Si,
    stream: St,
    outbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
    hub: &HubHandle,
    keepalive: KeepaliveSettings,
) -> Instant
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display + Send,
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let writer = tokio::spawn(write_pump(sink, outbound, cancel.clone(), keepalive));
    let last_pong = read_pump(stream, cancel.clone(), keepalive).await;

    cancel.cancel();
    hub.unregister(id);
    if let Err(e) = writer.await {
        error!("Writer of subscriber {} panicked: {}", id, e);
    }
    last_pong
}

async fn close(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("Failed to send close frame: {}", e);
    }
}

async fn send<Si>(sink: &mut Si, message: Message, write_wait: Duration) -> bool
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    match timeout(write_wait, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!("Socket write failed: {}", e);
            false
        }
        Err(_) => {
            debug!("Socket write timed out after {:?}", write_wait);
            false
        }
    }
}

/// Sends hub frames and periodic pings until the socket fails, the hub
/// drops the subscriber or the token fires.
async fn write_pump<Si>(
    mut sink: Si,
    mut outbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
    keepalive: KeepaliveSettings,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let mut ping = tokio::time::interval_at(
        Instant::now() + keepalive.ping_period,
        keepalive.ping_period,
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                send(&mut sink, Message::Close(None), keepalive.write_wait).await;
                break;
            }
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if !send(&mut sink, Message::Text(text), keepalive.write_wait).await {
                        break;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if !send(&mut sink, Message::Ping(Vec::new()), keepalive.write_wait).await {
                    break;
                }
            }
        }
    }

    cancel.cancel();
}

/// Reads until the peer goes away or stops answering pings. Returns the
/// time of the last pong.
async fn read_pump<St, E>(
    mut stream: St,
    cancel: CancellationToken,
    keepalive: KeepaliveSettings,
) -> Instant
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut last_pong = Instant::now();
    let deadline = tokio::time::sleep(keepalive.pong_wait);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut deadline => {
                warn!("No pong within {:?}, closing", keepalive.pong_wait);
                break;
            }
            message = stream.next() => match message {
                Some(Ok(Message::Pong(_))) => {
                    last_pong = Instant::now();
                    deadline.as_mut().reset(last_pong + keepalive.pong_wait);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Text(text))) if text.len() > keepalive.max_inbound_bytes => {
                    debug!("Ignoring oversized frame of {} bytes", text.len());
                }
                Some(Ok(Message::Binary(data))) if data.len() > keepalive.max_inbound_bytes => {
                    debug!("Ignoring oversized frame of {} bytes", data.len());
                }
                // Subscribers have nothing to say.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Socket read failed: {}", e);
                    break;
                }
            },
        }
    }

    cancel.cancel();
    last_pong
}
