mod driver;
mod host;
mod relay;
mod store;
mod task;

pub use host::{HostOptions, SessionHost, Shutdown};
pub use relay::{ChannelSink, ExportedTranscript, SinkMessage, StateSink, StateSnapshot};
pub use store::{HistoryError, HistoryItem, HistoryStore};
pub use task::{TaskSession, TaskStatus, TurnError};

use crate::provider::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskIdentity {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl TaskIdentity {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            last_activity_at: now,
        }
    }

    /// Identity of a task loaded from history, dated by its transcript.
    pub fn restored(id: String, messages: &[Message]) -> Self {
        let now = Utc::now();
        Self {
            id,
            created_at: messages.first().map_or(now, |m| m.timestamp),
            last_activity_at: messages.last().map_or(now, |m| m.timestamp),
        }
    }
}

impl Default for TaskIdentity {
    fn default() -> Self {
        Self::new()
    }
}
