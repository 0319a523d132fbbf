//! Realtime transport speaking the Pusher channels protocol (Reverb, Soketi
//! and pusher.com all accept it) over one WebSocket.
//!
//! A reader task owns the socket. Channels get their own bounded queue; the
//! reader awaits room in it, so a slow consumer stalls the socket rather
//! than dropping events.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use condo_sync::{Transport, TransportError, TransportEvent};

const PROTOCOL_VERSION: u8 = 7;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const PONG_TIMEOUT: Duration = Duration::from_secs(30);
const OUTBOUND_BUFFER: usize = 32;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone, Debug)]
pub struct PusherConfig {
    /// `ws://` or `wss://` origin of the server
    pub url: String,
    pub app_key: String,
    /// Idle time before we ping. The server may ask for less.
    pub activity_timeout: Duration,
    pub channel_buffer: usize,
}

impl PusherConfig {
    pub fn endpoint(&self) -> String {
        format!(
            "{}/app/{}?protocol={PROTOCOL_VERSION}&client=condo&version={}",
            self.url.trim_end_matches('/'),
            self.app_key,
            env!("CARGO_PKG_VERSION"),
        )
    }
}

// =============================================================================
// Frames
// =============================================================================

#[derive(Debug, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

/// What one server frame means to us.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Established {
        socket_id: String,
        activity_timeout: Option<Duration>,
    },
    Ping,
    Pong,
    /// Connection-level error
    Error { message: String, code: Option<u64> },
    Subscribed { channel: String },
    SubscriptionError { channel: String, reason: String },
    Event {
        channel: String,
        name: String,
        payload: Value,
    },
    Ignored,
}

/// `data` usually arrives as a JSON document encoded into a string.
pub fn decode_data(data: Value) -> Value {
    match data {
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        other => other,
    }
}

fn subscription_error_reason(data: &Value) -> String {
    ["error", "message", "type"]
        .iter()
        .find_map(|key| data.get(key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| data.to_string())
}

pub fn classify(text: &str) -> Result<Inbound, TransportError> {
    let frame: Frame = serde_json::from_str(text)
        .map_err(|e| TransportError::Protocol(format!("unreadable frame: {e}")))?;
    let data = decode_data(frame.data);

    Ok(match (frame.event.as_str(), frame.channel) {
        ("pusher:connection_established", _) => Inbound::Established {
            socket_id: data
                .get("socket_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            activity_timeout: data
                .get("activity_timeout")
                .and_then(Value::as_u64)
                .map(Duration::from_secs),
        },
        ("pusher:ping", _) => Inbound::Ping,
        ("pusher:pong", _) => Inbound::Pong,
        ("pusher:error", _) => Inbound::Error {
            message: data
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            code: data.get("code").and_then(Value::as_u64),
        },
        ("pusher_internal:subscription_succeeded", Some(channel)) => {
            Inbound::Subscribed { channel }
        }
        ("pusher:subscription_error", Some(channel)) => Inbound::SubscriptionError {
            channel,
            reason: subscription_error_reason(&data),
        },
        (name, Some(channel)) if !name.starts_with("pusher") => Inbound::Event {
            channel,
            name: name.to_string(),
            payload: data,
        },
        _ => Inbound::Ignored,
    })
}

fn frame(event: &str, data: Value) -> String {
    json!({ "event": event, "data": data }).to_string()
}

pub fn subscribe_frame(channel: &str) -> String {
    frame("pusher:subscribe", json!({ "channel": channel }))
}

pub fn unsubscribe_frame(channel: &str) -> String {
    frame("pusher:unsubscribe", json!({ "channel": channel }))
}

fn ping_frame() -> String {
    frame("pusher:ping", json!({}))
}

fn pong_frame() -> String {
    frame("pusher:pong", json!({}))
}

// =============================================================================
// Transport
// =============================================================================

#[derive(Default)]
struct Shared {
    /// Bumped on every successful connect; a reader task only tears down
    /// state stamped with its own generation.
    generation: u64,
    outbound: Option<mpsc::Sender<String>>,
    cancel: Option<CancellationToken>,
    socket_id: Option<String>,
    channels: HashMap<String, mpsc::Sender<TransportEvent>>,
}

impl Shared {
    fn is_connected(&self) -> bool {
        self.outbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

pub struct PusherTransport {
    config: PusherConfig,
    shared: Arc<Mutex<Shared>>,
    connecting: tokio::sync::Mutex<()>,
}

impl PusherTransport {
    pub fn new(config: PusherConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Mutex::new(Shared::default())),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    pub fn is_connected(&self) -> bool {
        self.lock().is_connected()
    }

    pub fn socket_id(&self) -> Option<String> {
        self.lock().socket_id.clone()
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn await_established(
    read: &mut SplitStream<WsStream>,
) -> Result<(String, Option<Duration>), TransportError> {
    while let Some(frame) = read.next().await {
        match frame.map_err(|e| TransportError::Connect(e.to_string()))? {
            WsMessage::Text(text) => match classify(text.as_str())? {
                Inbound::Established {
                    socket_id,
                    activity_timeout,
                } => return Ok((socket_id, activity_timeout)),
                Inbound::Error { message, code } => {
                    return Err(TransportError::Connect(match code {
                        Some(code) => format!("{code}: {message}"),
                        None => message,
                    }));
                }
                _ => {}
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }
    Err(TransportError::Connect(
        "connection closed during handshake".into(),
    ))
}

#[async_trait]
impl Transport for PusherTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let _connecting = self.connecting.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        info!(url = %self.config.url, "connecting to realtime server");
        let (ws, _) = tokio_tungstenite::connect_async(self.config.endpoint())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (write, mut read) = ws.split();

        let (socket_id, server_timeout) =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, await_established(&mut read))
                .await
                .map_err(|_| {
                    TransportError::Connect("timed out waiting for connection_established".into())
                })??;
        let activity = server_timeout
            .map_or(self.config.activity_timeout, |t| {
                t.min(self.config.activity_timeout)
            })
            .max(Duration::from_secs(1));

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let cancel = CancellationToken::new();
        let generation = {
            let mut shared = self.lock();
            shared.generation += 1;
            shared.outbound = Some(outbound_tx);
            shared.cancel = Some(cancel.clone());
            shared.socket_id = Some(socket_id.clone());
            shared.generation
        };
        info!(socket_id = %socket_id, activity_secs = activity.as_secs(), "realtime connection established");

        let connection = Connection {
            write,
            read,
            outbound: outbound_rx,
            shared: self.shared.clone(),
            cancel,
            activity,
            generation,
        };
        tokio::spawn(connection.run());
        Ok(())
    }

    async fn open_channel(
        &self,
        channel: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let (tx, rx) = mpsc::channel(self.config.channel_buffer.max(1));
        let outbound = {
            let mut shared = self.lock();
            let Some(outbound) = shared.outbound.clone() else {
                return Err(TransportError::Connect("not connected".into()));
            };
            if shared.channels.insert(channel.to_string(), tx).is_some() {
                debug!(channel = %channel, "replacing existing channel queue");
            }
            outbound
        };

        if outbound.send(subscribe_frame(channel)).await.is_err() {
            self.lock().channels.remove(channel);
            return Err(TransportError::ConnectionLost);
        }
        debug!(channel = %channel, "subscribe sent");
        Ok(rx)
    }

    async fn leave_channel(&self, channel: &str) {
        let outbound = {
            let mut shared = self.lock();
            if shared.channels.remove(channel).is_none() {
                return;
            }
            shared.outbound.clone()
        };
        if let Some(outbound) = outbound {
            let _ = outbound.send(unsubscribe_frame(channel)).await;
            debug!(channel = %channel, "unsubscribe sent");
        }
    }

    async fn disconnect(&self) {
        let (cancel, channels) = {
            let mut shared = self.lock();
            shared.outbound = None;
            shared.socket_id = None;
            (shared.cancel.take(), std::mem::take(&mut shared.channels))
        };
        if let Some(cancel) = cancel {
            info!(open_channels = channels.len(), "disconnecting from realtime server");
            cancel.cancel();
        }
    }
}

// =============================================================================
// Reader task
// =============================================================================

struct Connection {
    write: SplitSink<WsStream, WsMessage>,
    read: SplitStream<WsStream>,
    outbound: mpsc::Receiver<String>,
    shared: Arc<Mutex<Shared>>,
    cancel: CancellationToken,
    activity: Duration,
    generation: u64,
}

impl Connection {
    async fn run(mut self) {
        let idle = tokio::time::sleep(self.activity);
        tokio::pin!(idle);
        let mut awaiting_pong = false;

        let failure = loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    let _ = self.write.send(WsMessage::Close(None)).await;
                    break None;
                }

                Some(text) = self.outbound.recv() => {
                    if let Err(e) = self.write.send(WsMessage::Text(text.into())).await {
                        warn!(error = %e, "realtime write failed");
                        break Some(TransportError::ConnectionLost);
                    }
                }

                _ = &mut idle => {
                    if awaiting_pong {
                        warn!("realtime server stopped answering pings");
                        break Some(TransportError::ConnectionLost);
                    }
                    debug!("idle, pinging realtime server");
                    if self.write.send(WsMessage::Text(ping_frame().into())).await.is_err() {
                        break Some(TransportError::ConnectionLost);
                    }
                    awaiting_pong = true;
                    idle.as_mut().reset(Instant::now() + PONG_TIMEOUT);
                }

                frame = self.read.next() => {
                    awaiting_pong = false;
                    idle.as_mut().reset(Instant::now() + self.activity);
                    match frame {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Err(e) = self.handle(text.as_str()).await {
                                break Some(e);
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            break Some(TransportError::ConnectionLost);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "realtime read failed");
                            break Some(TransportError::ConnectionLost);
                        }
                    }
                }
            }
        };

        self.shutdown(failure);
    }

    async fn handle(&mut self, text: &str) -> Result<(), TransportError> {
        let inbound = match classify(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "ignoring frame");
                return Ok(());
            }
        };

        match inbound {
            Inbound::Ping => self
                .write
                .send(WsMessage::Text(pong_frame().into()))
                .await
                .map_err(|_| TransportError::ConnectionLost),
            Inbound::Error { message, code } => {
                let reason = match code {
                    Some(code) => format!("{code}: {message}"),
                    None => message,
                };
                Err(TransportError::Protocol(reason))
            }
            Inbound::Subscribed { channel } => {
                self.deliver(&channel, TransportEvent::Subscribed).await;
                Ok(())
            }
            Inbound::SubscriptionError { channel, reason } => {
                let error = TransportError::Subscribe {
                    channel: channel.clone(),
                    reason,
                };
                self.deliver(&channel, TransportEvent::Failed(error)).await;
                lock(&self.shared).channels.remove(&channel);
                Ok(())
            }
            Inbound::Event {
                channel,
                name,
                payload,
            } => {
                self.deliver(&channel, TransportEvent::Event { name, payload })
                    .await;
                Ok(())
            }
            Inbound::Established { .. } | Inbound::Pong | Inbound::Ignored => Ok(()),
        }
    }

    async fn deliver(&self, channel: &str, event: TransportEvent) {
        let Some(tx) = lock(&self.shared).channels.get(channel).cloned() else {
            debug!(channel = %channel, "frame for a channel nobody holds");
            return;
        };
        if tx.send(event).await.is_err() {
            let mut shared = lock(&self.shared);
            if shared
                .channels
                .get(channel)
                .is_some_and(|current| current.same_channel(&tx))
            {
                shared.channels.remove(channel);
            }
        }
    }

    fn shutdown(self, failure: Option<TransportError>) {
        let channels = {
            let mut shared = lock(&self.shared);
            if shared.generation != self.generation {
                return;
            }
            shared.outbound = None;
            shared.cancel = None;
            shared.socket_id = None;
            std::mem::take(&mut shared.channels)
        };

        match failure {
            Some(error) => {
                warn!(error = %error, open_channels = channels.len(), "realtime connection lost");
                for tx in channels.values() {
                    let _ = tx.try_send(TransportEvent::Failed(error.clone()));
                }
            }
            None => info!("realtime connection closed"),
        }
    }
}
