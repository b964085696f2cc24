//! Cursor-addressed task output streaming.
//!
//! Each task owns an ordered chunk log. Appending assigns the next
//! cursor and fans the chunk out to live subscribers; a consumer that
//! reconnects with its last acknowledged cursor receives exactly the
//! chunks after it, in order, with no duplicates and no gaps -- replay
//! of retained chunks and registration for the live feed happen under
//! one lock. Retention is bounded; resuming below the eviction floor
//! fails explicitly rather than delivering a gapped stream.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Chunk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Monotonically increasing from 1, scoped to the task.
    pub cursor: u64,
    pub text: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The requested resume point predates the retention window.
    #[error("cursor {requested} evicted; oldest available is {oldest_available}")]
    CursorEvicted { requested: u64, oldest_available: u64 },
}

pub type Result<T> = std::result::Result<T, StreamError>;

// ---------------------------------------------------------------------------
// TaskStream
// ---------------------------------------------------------------------------

struct StreamInner {
    chunks: VecDeque<Chunk>,
    next_cursor: u64,
    /// Number of chunks dropped by retention; cursors `1..=evicted`
    /// are gone.
    evicted: u64,
    live: Vec<flume::Sender<Chunk>>,
}

/// Ordered, restartable-by-cursor output log for one task.
pub struct TaskStream {
    inner: Mutex<StreamInner>,
    retention: usize,
}

impl TaskStream {
    pub fn new(retention: usize) -> Self {
        Self {
            inner: Mutex::new(StreamInner {
                chunks: VecDeque::new(),
                next_cursor: 1,
                evicted: 0,
                live: Vec::new(),
            }),
            retention,
        }
    }

    /// Append a chunk, returning its cursor. Fans out to every live
    /// subscriber; dead subscribers are pruned.
    pub fn append(&self, text: impl Into<String>) -> u64 {
        let mut inner = self.inner.lock().expect("stream lock poisoned");
        let chunk = Chunk {
            cursor: inner.next_cursor,
            text: text.into(),
            at: Utc::now(),
        };
        inner.next_cursor += 1;
        inner.chunks.push_back(chunk.clone());
        if inner.chunks.len() > self.retention {
            inner.chunks.pop_front();
            inner.evicted += 1;
        }
        inner.live.retain(|tx| tx.send(chunk.clone()).is_ok());
        chunk.cursor
    }

    /// Subscribe from a cursor: retained chunks with cursor greater
    /// than `cursor` are replayed first, then live chunks follow in
    /// order. Pass 0 to receive everything retained.
    pub fn subscribe_from(&self, cursor: u64) -> Result<flume::Receiver<Chunk>> {
        let mut inner = self.inner.lock().expect("stream lock poisoned");
        if cursor < inner.evicted {
            return Err(StreamError::CursorEvicted {
                requested: cursor,
                oldest_available: inner.evicted + 1,
            });
        }
        let (tx, rx) = flume::unbounded();
        for chunk in inner.chunks.iter().filter(|c| c.cursor > cursor) {
            // Receiver is still in scope; send cannot fail here.
            let _ = tx.send(chunk.clone());
        }
        inner.live.push(tx);
        Ok(rx)
    }

    /// Cursor of the most recent chunk, or 0 when nothing was emitted.
    pub fn latest_cursor(&self) -> u64 {
        let inner = self.inner.lock().expect("stream lock poisoned");
        inner.next_cursor - 1
    }
}

// ---------------------------------------------------------------------------
// StreamRegistry
// ---------------------------------------------------------------------------

/// Per-task stream lookup shared by the supervisor and the HTTP
/// boundary.
pub struct StreamRegistry {
    streams: DashMap<Uuid, Arc<TaskStream>>,
    retention: usize,
}

impl StreamRegistry {
    pub fn new(retention: usize) -> Self {
        Self {
            streams: DashMap::new(),
            retention,
        }
    }

    pub fn get_or_create(&self, task_id: Uuid) -> Arc<TaskStream> {
        self.streams
            .entry(task_id)
            .or_insert_with(|| Arc::new(TaskStream::new(self.retention)))
            .clone()
    }

    pub fn get(&self, task_id: Uuid) -> Option<Arc<TaskStream>> {
        self.streams.get(&task_id).map(|s| s.clone())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
