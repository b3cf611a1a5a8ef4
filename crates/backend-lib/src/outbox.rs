// ============================
// crates/backend-lib/src/outbox.rs
// ============================
//! Outbound delivery to connections.
//!
//! Each connection owns a bounded queue drained by its writer task. Sends
//! never wait: a full or closed queue drops the event, logs it and bumps a
//! counter. One slow client therefore cannot stall delivery to anyone else.
use dashmap::DashMap;
use metrics::counter;
use okean_common::{ConnectionId, ServerMessage};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

/// Sending half of a connection's outbound queue
pub type ConnectionSink = mpsc::Sender<ServerMessage>;

#[derive(Default)]
pub struct Outbox {
    sinks: DashMap<ConnectionId, ConnectionSink>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection_id: ConnectionId, sink: ConnectionSink) {
        self.sinks.insert(connection_id, sink);
    }

    pub fn unregister(&self, connection_id: ConnectionId) {
        self.sinks.remove(&connection_id);
    }

    /// Queue one event for one connection. Returns false if it was dropped.
    pub fn send_to(&self, connection_id: ConnectionId, message: ServerMessage) -> bool {
        // Clone the sender so no shard lock is held while sending
        let Some(sink) = self.sinks.get(&connection_id).map(|sink| sink.value().clone()) else {
            counter!(crate::metrics::DELIVERY_DROPPED, "cause" => "unknown").increment(1);
            warn!(connection_id = %connection_id, "no sink for connection, dropping event");
            return false;
        };

        match sink.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                counter!(crate::metrics::DELIVERY_DROPPED, "cause" => "full").increment(1);
                warn!(connection_id = %connection_id, "outbound queue full, dropping event");
                false
            },
            Err(TrySendError::Closed(_)) => {
                counter!(crate::metrics::DELIVERY_DROPPED, "cause" => "closed").increment(1);
                warn!(connection_id = %connection_id, "outbound queue closed, dropping event");
                false
            },
        }
    }

    /// Queue the same event for many connections, skipping `except`
    pub fn send_to_many<'a>(
        &self,
        connections: impl IntoIterator<Item = &'a ConnectionId>,
        except: Option<ConnectionId>,
        message: &ServerMessage,
    ) -> usize {
        connections
            .into_iter()
            .filter(|connection_id| Some(**connection_id) != except)
            .filter(|connection_id| self.send_to(**connection_id, message.clone()))
            .count()
    }

    pub fn is_registered(&self, connection_id: ConnectionId) -> bool {
        self.sinks.contains_key(&connection_id)
    }

    pub fn connection_count(&self) -> usize {
        self.sinks.len()
    }
}
