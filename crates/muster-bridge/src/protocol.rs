use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frames sent over the task output WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
#[serde(rename_all = "snake_case")]
pub enum StreamFrame {
    /// One output chunk; the client acknowledges progress by
    /// remembering the cursor and resuming from it after a disconnect.
    Chunk {
        cursor: u64,
        text: String,
        at: DateTime<Utc>,
    },
    /// Periodic liveness signal while the task produces no output.
    Ping { timestamp: DateTime<Utc> },
    Error { code: String, message: String },
}

impl StreamFrame {
    pub fn chunk(chunk: &muster_engine::Chunk) -> Self {
        StreamFrame::Chunk {
            cursor: chunk.cursor,
            text: chunk.text.clone(),
            at: chunk.at,
        }
    }

    pub fn ping() -> Self {
        StreamFrame::Ping {
            timestamp: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_frame_wire_shape() {
        let frame = StreamFrame::Chunk {
            cursor: 7,
            text: "compiling".into(),
            at: Utc::now(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "chunk");
        assert_eq!(value["payload"]["cursor"], 7);
        assert_eq!(value["payload"]["text"], "compiling");
    }
}
