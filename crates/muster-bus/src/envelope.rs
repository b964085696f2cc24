use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The unit exchanged between agents.
///
/// Immutable once published. The payload is opaque to the bus and the
/// orchestration core; validation of its contents belongs to the
/// receiving agent. The correlation id groups a request/response
/// exchange and is the key handlers de-duplicate on, since the
/// transport is at-least-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol verb, e.g. "task_assignment", "data_request", "question".
    pub action: String,
    pub sender: Uuid,
    /// Ordered recipients; each gets its own delivery.
    pub recipients: Vec<Uuid>,
    pub payload: serde_json::Value,
    pub correlation_id: Uuid,
    /// Monotonically increasing, scoped to the sender.
    pub seq: u64,
    pub sent_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(
        action: impl Into<String>,
        sender: Uuid,
        recipients: Vec<Uuid>,
        payload: serde_json::Value,
        correlation_id: Uuid,
        seq: u64,
    ) -> Self {
        Self {
            action: action.into(),
            sender,
            recipients,
            payload,
            correlation_id,
            seq,
            sent_at: Utc::now(),
        }
    }

    /// Key used for duplicate suppression: the same correlation id for
    /// the same action from the same sender is the same logical message.
    pub fn dedup_key(&self) -> (Uuid, Uuid, String) {
        (self.sender, self.correlation_id, self.action.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
