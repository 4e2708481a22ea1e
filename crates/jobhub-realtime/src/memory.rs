//! In-process transport. Lets tests and demos play the realtime service.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Value, json};
use tokio::sync::mpsc;

use jobhub_types::Frame;
use jobhub_types::events::{EVENT_POSTGRES_CHANGES, EVENT_PRESENCE_STATE, EVENT_REPLY};

use crate::error::RealtimeError;
use crate::transport::{Connection, Transport};

/// Client half. Every `connect` hands a [`MemoryPeer`] to the paired
/// [`MemoryServer`].
#[derive(Clone)]
pub struct MemoryTransport {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
}

impl MemoryTransport {
    pub fn pair() -> (Self, MemoryServer) {
        let (peers, incoming) = mpsc::unbounded_channel();
        let transport = Self {
            peers,
            refuse: Arc::new(AtomicUsize::new(0)),
            attempts: Arc::new(AtomicUsize::new(0)),
        };
        (transport, MemoryServer { incoming })
    }

    /// Makes the next `n` connection attempts fail.
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Connection attempts so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    fn connect(&self) -> impl Future<Output = Result<Connection, RealtimeError>> + Send {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let result = if refused {
            Err(RealtimeError::Refused("memory transport refusing".into()))
        } else {
            let (outbound, from_client) = mpsc::unbounded_channel();
            let (to_client, inbound) = mpsc::unbounded_channel();
            let peer = MemoryPeer {
                from_client,
                to_client,
            };
            match self.peers.send(peer) {
                Ok(()) => Ok(Connection { outbound, inbound }),
                Err(_) => Err(RealtimeError::Closed),
            }
        };
        std::future::ready(result)
    }
}

/// Server half: yields one peer per accepted connection.
pub struct MemoryServer {
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }

    /// A peer if one is already waiting.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.try_recv().ok()
    }
}

/// Server side of one connection. Dropping it drops the connection.
pub struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<Frame>,
    to_client: mpsc::UnboundedSender<Frame>,
}

impl MemoryPeer {
    /// Next frame the client sent, `None` once the client hung up.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    pub fn send(&self, frame: Frame) -> bool {
        self.to_client.send(frame).is_ok()
    }

    /// Answers a request frame (typically `phx_join`).
    pub fn reply(&self, request: &Frame, status: &str) -> bool {
        let mut frame = Frame::new(
            request.topic.clone(),
            EVENT_REPLY,
            json!({"status": status, "response": {}}),
        );
        frame.reference = request.reference.clone();
        self.send(frame)
    }

    /// Pushes a row change on `topic` committed at `at`.
    pub fn push_change(
        &self,
        topic: &str,
        kind: &str,
        table: &str,
        record: Value,
        old: Value,
        at: &str,
    ) -> bool {
        self.send(Frame::new(
            topic,
            EVENT_POSTGRES_CHANGES,
            json!({
                "ids": [],
                "data": {
                    "type": kind,
                    "schema": "public",
                    "table": table,
                    "record": record,
                    "old_record": old,
                    "commit_timestamp": at
                }
            }),
        ))
    }

    /// Pushes a full presence state keyed by user id.
    pub fn push_presence(&self, topic: &str, online: &[i64]) -> bool {
        let state: serde_json::Map<String, Value> = online
            .iter()
            .enumerate()
            .map(|(i, id)| (id.to_string(), json!({"metas": [{"phx_ref": format!("ref{}", i)}]})))
            .collect();
        self.send(Frame::new(topic, EVENT_PRESENCE_STATE, Value::Object(state)))
    }
}
