/// Connection Registry
///
/// **Core Responsibility:**
/// Track at most one live channel per execution id, with heartbeat
/// liveness and bounded queuing of messages that could not be delivered.
///
/// **Critical Properties:**
/// - Registering a second channel for an id retires the first.
/// - Delivery is best-effort, never exactly-once; the heartbeat is a
///   liveness probe, not a correctness guarantee.
/// - Per-id state is independent: no cross-execution locking.
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use optilab_common::types::StreamEnvelope;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::metrics;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const PENDING_QUEUE_CAP: usize = 100;
pub const PENDING_GRACE: Duration = Duration::from_secs(60);
const SEND_ATTEMPTS: u32 = 3;

/// Transport half of one channel. The registry never sees the socket
/// itself, only this seam, so tests can drive it without a listener.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send_text(&self, text: String) -> Result<()>;
    async fn send_ping(&self) -> Result<()>;
    async fn close(&self);
}

struct ConnectionEntry {
    sink: Arc<dyn EventSink>,
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    messages_sent: u64,
    is_alive: bool,
    heartbeat: Option<JoinHandle<()>>,
}

#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, ConnectionEntry>>>,
    pending: Arc<RwLock<HashMap<String, VecDeque<String>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a channel to an execution id. Retires any prior channel for
    /// the id, flushes queued messages, starts the heartbeat.
    pub async fn register(&self, execution_id: &str, sink: Arc<dyn EventSink>) -> bool {
        let retired = {
            let mut connections = self.connections.write().await;
            connections.remove(execution_id)
        };
        if let Some(entry) = retired {
            debug!(
                execution_id = execution_id,
                "Retiring existing channel before re-register"
            );
            if let Some(handle) = entry.heartbeat {
                handle.abort();
            }
            entry.sink.close().await;
            metrics::ACTIVE_CONNECTIONS.dec();
        }

        let now = Utc::now();
        {
            let mut connections = self.connections.write().await;
            connections.insert(
                execution_id.to_string(),
                ConnectionEntry {
                    sink: sink.clone(),
                    connected_at: now,
                    last_heartbeat: now,
                    messages_sent: 0,
                    is_alive: true,
                    heartbeat: None,
                },
            );
        }
        metrics::ACTIVE_CONNECTIONS.inc();

        let handle = tokio::spawn(heartbeat_loop(self.clone(), execution_id.to_string()));
        {
            let mut connections = self.connections.write().await;
            if let Some(entry) = connections.get_mut(execution_id) {
                entry.heartbeat = Some(handle);
            } else {
                // Unregistered in the window between insert and here.
                handle.abort();
            }
        }

        self.flush_pending(execution_id).await;
        true
    }

    async fn flush_pending(&self, execution_id: &str) {
        let queued = {
            let mut pending = self.pending.write().await;
            pending.remove(execution_id)
        };
        let Some(queued) = queued else { return };
        if queued.is_empty() {
            return;
        }

        debug!(
            execution_id = execution_id,
            count = queued.len(),
            "Flushing queued messages to fresh channel"
        );
        for text in queued {
            let sink = {
                let connections = self.connections.read().await;
                connections.get(execution_id).map(|e| e.sink.clone())
            };
            let Some(sink) = sink else { return };
            match sink.send_text(text).await {
                Ok(()) => {
                    let mut connections = self.connections.write().await;
                    if let Some(entry) = connections.get_mut(execution_id) {
                        entry.messages_sent += 1;
                    }
                }
                Err(e) => {
                    warn!(execution_id = execution_id, error = %e, "Flush send failed");
                    return;
                }
            }
        }
    }

    /// Deliver one envelope. Returns false when the message was queued
    /// (or dropped) instead of written to a live channel.
    pub async fn send(&self, execution_id: &str, envelope: &StreamEnvelope) -> bool {
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(e) => {
                warn!(execution_id = execution_id, error = %e, "Failed to serialize envelope");
                return false;
            }
        };

        let sink = {
            let connections = self.connections.read().await;
            connections.get(execution_id).map(|e| e.sink.clone())
        };
        let Some(sink) = sink else {
            self.enqueue(execution_id, text).await;
            return false;
        };

        for attempt in 1..=SEND_ATTEMPTS {
            match sink.send_text(text.clone()).await {
                Ok(()) => {
                    let mut connections = self.connections.write().await;
                    if let Some(entry) = connections.get_mut(execution_id) {
                        entry.messages_sent += 1;
                    }
                    metrics::MESSAGES_SENT.inc();
                    return true;
                }
                Err(e) => {
                    warn!(
                        execution_id = execution_id,
                        attempt = attempt,
                        error = %e,
                        "Channel write failed"
                    );
                    if attempt < SEND_ATTEMPTS {
                        tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                    }
                }
            }
        }

        self.enqueue(execution_id, text).await;
        false
    }

    async fn enqueue(&self, execution_id: &str, text: String) {
        let mut pending = self.pending.write().await;
        let queue = pending.entry(execution_id.to_string()).or_default();
        if queue.len() >= PENDING_QUEUE_CAP {
            queue.pop_front();
        }
        queue.push_back(text);
    }

    /// Record a pong from the client: the channel survived the round.
    pub async fn handle_pong(&self, execution_id: &str) {
        let mut connections = self.connections.write().await;
        if let Some(entry) = connections.get_mut(execution_id) {
            entry.is_alive = true;
            entry.last_heartbeat = Utc::now();
        }
    }

    pub async fn has_connection(&self, execution_id: &str) -> bool {
        self.connections.read().await.contains_key(execution_id)
    }

    pub async fn connection_stats(&self, execution_id: &str) -> Option<(DateTime<Utc>, u64, bool)> {
        let connections = self.connections.read().await;
        connections
            .get(execution_id)
            .map(|e| (e.connected_at, e.messages_sent, e.is_alive))
    }

    /// Drop the live channel now; keep the pending queue for a short
    /// grace window so a reconnect can pick up missed messages.
    pub async fn unregister(&self, execution_id: &str) {
        let entry = {
            let mut connections = self.connections.write().await;
            connections.remove(execution_id)
        };
        let Some(entry) = entry else { return };
        metrics::ACTIVE_CONNECTIONS.dec();

        entry.sink.close().await;
        // Abort last: unregister may be running on the heartbeat task
        // itself, and nothing may run after a self-abort.
        if let Some(handle) = entry.heartbeat {
            handle.abort();
        }

        let pending = self.pending.clone();
        let id = execution_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(PENDING_GRACE).await;
            let mut pending = pending.write().await;
            if pending.remove(&id).is_some() {
                debug!(execution_id = %id, "Purged pending queue after grace window");
            }
        });
    }

    /// Unregister only if `sink` is still the registered channel for
    /// the id. A socket task going away must not retire the channel a
    /// reconnect has already claimed.
    pub async fn unregister_if_current(&self, execution_id: &str, sink: &Arc<dyn EventSink>) {
        let is_current = {
            let connections = self.connections.read().await;
            connections
                .get(execution_id)
                .map(|entry| Arc::ptr_eq(&entry.sink, sink))
                .unwrap_or(false)
        };
        if is_current {
            self.unregister(execution_id).await;
        }
    }

    pub async fn pending_len(&self, execution_id: &str) -> usize {
        self.pending
            .read()
            .await
            .get(execution_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

/// Ping every interval; a round with no pong in between means the
/// client is gone and the channel is terminated.
async fn heartbeat_loop(registry: ConnectionRegistry, execution_id: String) {
    loop {
        tokio::time::sleep(HEARTBEAT_INTERVAL).await;

        let verdict = {
            let mut connections = registry.connections.write().await;
            match connections.get_mut(&execution_id) {
                None => return,
                Some(entry) => {
                    if entry.is_alive {
                        entry.is_alive = false;
                        Some(entry.sink.clone())
                    } else {
                        None
                    }
                }
            }
        };

        match verdict {
            Some(sink) => {
                if sink.send_ping().await.is_err() {
                    warn!(execution_id = %execution_id, "Heartbeat ping failed, dropping channel");
                    registry.unregister(&execution_id).await;
                    return;
                }
            }
            None => {
                warn!(execution_id = %execution_id, "Heartbeat pong never arrived, dropping channel");
                registry.unregister(&execution_id).await;
                return;
            }
        }
    }
}
