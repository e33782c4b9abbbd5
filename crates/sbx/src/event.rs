//! Observable session events.
//!
//! Sessions publish lifecycle changes and operation summaries on a broadcast
//! channel. Presentation (progress output, logging, metrics) is left to
//! whoever subscribes.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::copy::CopyDirection;
use crate::session::SessionState;

/// Capacity of each session's event channel. Slow subscribers lag and miss
/// older events rather than blocking the session.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl SessionEvent {
    pub fn new(session_id: Uuid, kind: EventKind) -> Self {
        Self {
            session_id,
            at: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Provisioned {
        handle: String,
        image: String,
    },
    LibrariesInstalled {
        count: usize,
        #[serde(with = "duration_ms")]
        elapsed: Duration,
    },
    Copied {
        direction: CopyDirection,
        local: PathBuf,
        remote: String,
    },
    CommandFinished {
        exit_code: i32,
        timed_out: bool,
        #[serde(with = "duration_ms")]
        elapsed: Duration,
    },
    /// Teardown did not complete cleanly; the environment may still exist.
    TeardownWarning {
        message: String,
    },
}

mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}
