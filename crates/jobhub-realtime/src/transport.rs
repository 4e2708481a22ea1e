use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

use jobhub_types::Frame;
use jobhub_types::events::PHOENIX_TOPIC;

use crate::config::DEFAULT_HEARTBEAT_INTERVAL;
use crate::error::RealtimeError;

/// Protocol version the hosted realtime service expects.
const PROTOCOL_VSN: &str = "1.0.0";

/// Heartbeats missed before the socket is considered dead.
const MAX_MISSED_HEARTBEATS: u8 = 2;

/// A live duplex frame stream. The connection ends when `inbound` yields
/// `None`; dropping `outbound` closes it from our side.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

impl Connection {
    /// Queues a frame. Returns false once the connection is gone.
    pub fn send(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }
}

/// Opens connections to the realtime service.
pub trait Transport: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<Connection, RealtimeError>> + Send;
}

/// WebSocket transport to the hosted realtime service.
#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
    heartbeat_interval: Duration,
}

impl WsTransport {
    /// `base_url` is the `ws://` or `wss://` origin of the service.
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, RealtimeError> {
        let base = base_url.trim_end_matches('/');
        let mut url = url::Url::parse(&format!("{}/realtime/v1/websocket", base))
            .map_err(|_| RealtimeError::InvalidUrl(base_url.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(RealtimeError::InvalidUrl(base_url.to_string()));
        }
        url.query_pairs_mut()
            .append_pair("apikey", api_key)
            .append_pair("vsn", PROTOCOL_VSN);
        Ok(Self {
            url: url.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        })
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    fn connect(&self) -> impl Future<Output = Result<Connection, RealtimeError>> + Send {
        let url = self.url.clone();
        let heartbeat_interval = self.heartbeat_interval;

        async move {
            let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(Box::new)?;
            let (mut sink, mut stream) = socket.split();

            let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
            let (inbound_tx, inbound) = mpsc::unbounded_channel::<Frame>();

            // Set by the reader whenever the server answers a heartbeat
            let heartbeat_acked = Arc::new(AtomicBool::new(true));
            let ack_flag_send = heartbeat_acked.clone();
            let ack_flag_recv = heartbeat_acked;

            let mut send_task = tokio::spawn(async move {
                let mut heartbeat = tokio::time::interval(heartbeat_interval);
                heartbeat.tick().await;
                let mut missed: u8 = 0;
                let mut next_ref: u64 = 0;

                loop {
                    tokio::select! {
                        frame = outbound_rx.recv() => {
                            let Some(frame) = frame else {
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            };
                            let text = match serde_json::to_string(&frame) {
                                Ok(text) => text,
                                Err(e) => {
                                    warn!("Dropping unencodable frame on {}: {}", frame.topic, e);
                                    continue;
                                }
                            };
                            trace!("-> {}", text);
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        _ = heartbeat.tick() => {
                            if ack_flag_send.swap(false, Ordering::Acquire) {
                                missed = 0;
                            } else {
                                missed += 1;
                                if missed >= MAX_MISSED_HEARTBEATS {
                                    warn!("Realtime heartbeat timeout (missed {}), dropping socket", missed);
                                    break;
                                }
                            }
                            next_ref += 1;
                            let Ok(text) = serde_json::to_string(&Frame::heartbeat(next_ref.to_string())) else {
                                continue;
                            };
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            let mut recv_task = tokio::spawn(async move {
                while let Some(msg) = stream.next().await {
                    match msg {
                        Ok(Message::Text(text)) => {
                            trace!("<- {}", text.as_str());
                            match serde_json::from_str::<Frame>(text.as_str()) {
                                Ok(frame) if frame.topic == PHOENIX_TOPIC => {
                                    ack_flag_recv.store(true, Ordering::Release);
                                }
                                Ok(frame) => {
                                    if inbound_tx.send(frame).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    let raw: String = text.as_str().chars().take(200).collect();
                                    warn!("Bad realtime frame: {} -- raw: {}", e, raw);
                                }
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            debug!("Realtime socket read failed: {}", e);
                            break;
                        }
                    }
                }
            });

            // Whichever side finishes first takes the other down
            tokio::spawn(async move {
                tokio::select! {
                    _ = &mut send_task => recv_task.abort(),
                    _ = &mut recv_task => send_task.abort(),
                }
            });

            Ok(Connection { outbound, inbound })
        }
    }
}
