use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::envelope::Envelope;

/// Duplicate-suppression window per subscriber. Correlation keys older
/// than this many deliveries are forgotten; the transport's redelivery
/// horizon is far shorter than the window.
const DEDUP_WINDOW: usize = 1024;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The bus is unreachable; the message was not accepted for
    /// delivery. Publishers retry with backoff at the call site.
    #[error("delivery failed: {0}")]
    Delivery(String),

    #[error("bus is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, BusError>;

// ---------------------------------------------------------------------------
// EnvelopeHandler
// ---------------------------------------------------------------------------

/// Invoked once per envelope addressed to the subscribing agent, in
/// per-sender publish order. Handlers run sequentially per subscriber:
/// a slow handler delays later envelopes but never reorders them.
/// Callers needing concurrency must dispatch work internally.
#[async_trait::async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope);
}

// ---------------------------------------------------------------------------
// BusClient
// ---------------------------------------------------------------------------

struct BusInner {
    subscribers: Mutex<HashMap<Uuid, flume::Sender<Envelope>>>,
    closed: AtomicBool,
}

/// Typed publish/subscribe fabric for agent-to-agent envelopes.
///
/// Cheap to clone (shares its internals through `Arc`). `publish`
/// guarantees only that the envelope was accepted for delivery;
/// recipients without a live subscription receive nothing. Delivery is
/// at-least-once at the transport, so the dispatch loop discards
/// duplicate correlation keys before the handler ever runs.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<BusInner>,
}

impl BusClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Accept `envelope` for delivery to each recipient, in order.
    pub fn publish(&self, envelope: Envelope) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Delivery("bus is closed".into()));
        }
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .expect("bus subscriber lock poisoned");
        for recipient in &envelope.recipients {
            if let Some(tx) = subscribers.get(recipient) {
                if tx.send(envelope.clone()).is_err() {
                    // Receiver dropped; prune the dead subscription.
                    subscribers.remove(recipient);
                    tracing::debug!(recipient = %recipient, "pruned dead subscriber");
                }
            } else {
                tracing::debug!(
                    recipient = %recipient,
                    action = %envelope.action,
                    "no live subscription; envelope accepted and dropped"
                );
            }
        }
        Ok(())
    }

    /// Register `handler` for envelopes addressed to `agent_id` and
    /// spawn its dispatch loop. Replaces any previous subscription for
    /// the same agent.
    pub fn subscribe(&self, agent_id: Uuid, handler: Arc<dyn EnvelopeHandler>) {
        let rx = self.register(agent_id);
        tokio::spawn(async move {
            let mut seen: HashSet<(Uuid, Uuid, String)> = HashSet::new();
            let mut order: VecDeque<(Uuid, Uuid, String)> = VecDeque::new();
            while let Ok(envelope) = rx.recv_async().await {
                let key = envelope.dedup_key();
                if seen.contains(&key) {
                    tracing::debug!(
                        correlation_id = %envelope.correlation_id,
                        action = %envelope.action,
                        "duplicate delivery discarded"
                    );
                    continue;
                }
                seen.insert(key.clone());
                order.push_back(key);
                if order.len() > DEDUP_WINDOW {
                    if let Some(old) = order.pop_front() {
                        seen.remove(&old);
                    }
                }
                handler.handle(envelope).await;
            }
        });
    }

    /// Register a raw receiver for `agent_id`. Used by runtime handles
    /// and tests that drive delivery themselves; no de-duplication is
    /// applied.
    pub fn register(&self, agent_id: Uuid) -> flume::Receiver<Envelope> {
        let (tx, rx) = flume::unbounded();
        self.inner
            .subscribers
            .lock()
            .expect("bus subscriber lock poisoned")
            .insert(agent_id, tx);
        rx
    }

    pub fn unsubscribe(&self, agent_id: Uuid) {
        self.inner
            .subscribers
            .lock()
            .expect("bus subscriber lock poisoned")
            .remove(&agent_id);
    }

    /// Tear the bus down; subsequent publishes fail with
    /// [`BusError::Delivery`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .expect("bus subscriber lock poisoned")
            .clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .expect("bus subscriber lock poisoned")
            .len()
    }
}

impl Default for BusClient {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
