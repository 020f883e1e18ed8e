//! Outbound state relay.
//!
//! Every accepted mutation is pushed to the [`StateSink`] as one consolidated
//! [`StateSnapshot`]. Pushes are serialized through a gate; abandoning a task
//! takes the same gate, so once [`Relay::abandon`] returns nothing from that
//! task reaches the sink again.

use super::host::TaskHandle;
use super::store::HistoryItem;
use super::task::{TaskSession, TaskStatus};
use super::TaskIdentity;
use crate::provider::{Message, Role, UsageTotals, models};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Everything a front end needs to render the current state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub active_task: Option<TaskIdentity>,
    pub status: Option<TaskStatus>,
    pub messages: Vec<Message>,
    pub streaming_text: Option<String>,
    pub usage: UsageTotals,
    pub total_cost: f64,
    pub task_history: Vec<HistoryItem>,
    pub model_id: String,
    pub has_api_key: bool,
    pub error: Option<String>,
}

/// A transcript rendered for saving outside the app.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportedTranscript {
    pub task_id: String,
    pub file_name: String,
    pub markdown: String,
}

impl ExportedTranscript {
    pub fn render(item: &HistoryItem, messages: &[Message]) -> Self {
        let stamp = chrono::DateTime::from_timestamp_millis(item.ts)
            .unwrap_or_default()
            .format("%Y-%m-%d_%H-%M-%S");

        let markdown = messages
            .iter()
            .map(|m| {
                let who = match m.role {
                    Role::User => "**User:**",
                    Role::Assistant => "**Assistant:**",
                };
                format!("{who}\n\n{}\n\n", m.content)
            })
            .collect::<Vec<_>>()
            .join("---\n\n");

        Self {
            task_id: item.id.clone(),
            file_name: format!("tack_task_{stamp}.md"),
            markdown,
        }
    }
}

/// Receives host output. Implementations must not block.
pub trait StateSink: Send + Sync {
    fn push(&self, snapshot: StateSnapshot);

    fn exported(&self, _payload: ExportedTranscript) {}
}

/// What the sink receives through a [`ChannelSink`].
#[derive(Debug, Clone)]
pub enum SinkMessage {
    State(Box<StateSnapshot>),
    Exported(ExportedTranscript),
}

/// Forwards everything to an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<SinkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl StateSink for ChannelSink {
    fn push(&self, snapshot: StateSnapshot) {
        // A closed receiver just means nobody is watching any more.
        let _ = self.tx.send(SinkMessage::State(Box::new(snapshot)));
    }

    fn exported(&self, payload: ExportedTranscript) {
        let _ = self.tx.send(SinkMessage::Exported(payload));
    }
}

/// Host-level fields of the snapshot.
#[derive(Debug, Default)]
pub(crate) struct HostView {
    pub task_history: Vec<HistoryItem>,
    pub model_id: String,
    pub has_api_key: bool,
    pub error: Option<String>,
}

impl HostView {
    fn snapshot(&self, task: Option<&TaskSession>) -> StateSnapshot {
        let model = models::resolve(Some(self.model_id.as_str()));
        let Some(task) = task else {
            return StateSnapshot {
                active_task: None,
                status: None,
                messages: Vec::new(),
                streaming_text: None,
                usage: UsageTotals::default(),
                total_cost: 0.0,
                task_history: self.task_history.clone(),
                model_id: model.id.to_string(),
                has_api_key: self.has_api_key,
                error: self.error.clone(),
            };
        };

        StateSnapshot {
            active_task: Some(task.identity().clone()),
            status: Some(task.status()),
            messages: task.messages().to_vec(),
            streaming_text: task.streaming_text().map(str::to_string),
            usage: *task.usage(),
            total_cost: model.cost(task.usage()),
            task_history: self.task_history.clone(),
            model_id: model.id.to_string(),
            has_api_key: self.has_api_key,
            error: task.error().map(str::to_string).or_else(|| self.error.clone()),
        }
    }
}

pub(crate) struct Relay {
    sink: Arc<dyn StateSink>,
    gate: Mutex<HostView>,
}

impl Relay {
    pub fn new(sink: Arc<dyn StateSink>, view: HostView) -> Self {
        Self {
            sink,
            gate: Mutex::new(view),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HostView> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change host fields without pushing.
    pub fn update(&self, f: impl FnOnce(&mut HostView)) {
        f(&mut self.lock());
    }

    /// Push a snapshot of `task` (or of the idle host). Dropped if the task
    /// has been abandoned.
    pub fn publish(&self, task: Option<&TaskHandle>) {
        let view = self.lock();
        let snapshot = match task {
            Some(handle) if handle.is_abandoned() => return,
            Some(handle) => view.snapshot(Some(&*handle.lock())),
            None => view.snapshot(None),
        };
        self.sink.push(snapshot);
    }

    /// Mark a task abandoned under the gate.
    pub fn abandon(&self, task: &TaskHandle) {
        let _gate = self.lock();
        task.mark_abandoned();
    }

    pub fn export(&self, payload: ExportedTranscript) {
        self.sink.exported(payload);
    }
}
