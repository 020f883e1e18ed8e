//! Per-task conversation state machine.

use super::TaskIdentity;
use crate::provider::{self, Message, Role, StreamEvent, UsageTotals};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Streaming,
    Completed,
    Aborting,
    Aborted,
}

impl TaskStatus {
    /// A turn is in flight and another one cannot start.
    #[must_use]
    pub fn is_busy(self) -> bool {
        matches!(self, Self::Streaming | Self::Aborting)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TurnError {
    #[error("A response is still streaming")]
    Busy,
    #[error("Nothing to resume: the last message is not an unanswered user turn")]
    NothingToResume,
    #[error("No active task")]
    NoActiveTask,
}

/// One conversation: transcript, usage totals and the uncommitted reply.
#[derive(Debug)]
pub struct TaskSession {
    identity: TaskIdentity,
    messages: Vec<Message>,
    usage: UsageTotals,
    pending: String,
    status: TaskStatus,
    error: Option<String>,
    persist_partial: bool,
}

impl TaskSession {
    pub fn new(persist_partial: bool) -> Self {
        Self {
            identity: TaskIdentity::new(),
            messages: Vec::new(),
            usage: UsageTotals::default(),
            pending: String::new(),
            status: TaskStatus::Created,
            error: None,
            persist_partial,
        }
    }

    /// Rebuild a task from a stored transcript.
    pub fn from_history(
        id: impl Into<String>,
        messages: Vec<Message>,
        usage: UsageTotals,
        persist_partial: bool,
    ) -> Self {
        let identity = TaskIdentity::restored(id.into(), &messages);
        Self {
            identity,
            messages,
            usage,
            pending: String::new(),
            status: TaskStatus::Created,
            error: None,
            persist_partial,
        }
    }

    pub fn identity(&self) -> &TaskIdentity {
        &self.identity
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn usage(&self) -> &UsageTotals {
        &self.usage
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Text received for the current turn but not yet committed.
    pub fn streaming_text(&self) -> Option<&str> {
        self.status.is_busy().then_some(self.pending.as_str())
    }

    /// Whether the transcript ends in a user turn with no reply.
    pub fn awaiting_response(&self) -> bool {
        self.messages.last().is_some_and(|m| m.role == Role::User)
    }

    /// Append a user message and start streaming the reply.
    pub fn begin_turn(&mut self, text: impl Into<String>) -> Result<(), TurnError> {
        if self.status.is_busy() {
            return Err(TurnError::Busy);
        }
        self.messages.push(Message::user(text));
        self.start_streaming();
        Ok(())
    }

    /// Stream a reply to the trailing user message of a loaded transcript.
    pub fn resume_turn(&mut self) -> Result<(), TurnError> {
        if self.status.is_busy() {
            return Err(TurnError::Busy);
        }
        if !self.awaiting_response() {
            return Err(TurnError::NothingToResume);
        }
        self.start_streaming();
        Ok(())
    }

    fn start_streaming(&mut self) {
        self.pending.clear();
        self.error = None;
        self.status = TaskStatus::Streaming;
        self.touch();
    }

    /// Fold one event into the task. Returns false when the event was discarded.
    pub fn apply(&mut self, event: StreamEvent) -> bool {
        if self.status != TaskStatus::Streaming {
            return false;
        }
        match event {
            StreamEvent::TextDelta(text) => self.pending.push_str(&text),
            StreamEvent::UsageDelta(delta) => self.usage.add(&delta),
            StreamEvent::Malformed(line) => {
                self.error = Some(format!("Skipped malformed stream event: {line}"));
            }
        }
        self.touch();
        true
    }

    /// Streaming -> Aborting. Returns false if no turn was streaming.
    pub fn request_abort(&mut self) -> bool {
        if self.status != TaskStatus::Streaming {
            return false;
        }
        self.status = TaskStatus::Aborting;
        true
    }

    /// Terminate the current turn with the driver's outcome.
    ///
    /// A clean end while streaming commits exactly one assistant message.
    /// Anything else ends `Aborted`, keeping partial text only when
    /// `persist_partial_output` is on.
    pub fn finish(&mut self, outcome: Result<(), &provider::Error>) -> bool {
        match (self.status, outcome) {
            (TaskStatus::Streaming, Ok(())) => {
                let text = std::mem::take(&mut self.pending);
                self.messages.push(Message::assistant(text));
                self.status = TaskStatus::Completed;
            }
            (TaskStatus::Streaming, Err(err)) => {
                self.error = Some(err.display_message());
                self.settle_aborted();
            }
            (TaskStatus::Aborting, _) => self.settle_aborted(),
            _ => return false,
        }
        self.touch();
        true
    }

    fn settle_aborted(&mut self) {
        let text = std::mem::take(&mut self.pending);
        if self.persist_partial && !text.trim().is_empty() {
            self.messages.push(Message::assistant(text));
        }
        self.status = TaskStatus::Aborted;
    }

    fn touch(&mut self) {
        self.identity.last_activity_at = chrono::Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::UsageDelta;

    fn usage(input: u32, output: u32) -> StreamEvent {
        StreamEvent::UsageDelta(UsageDelta {
            input_tokens: input,
            output_tokens: output,
            cache_write_tokens: Some(2),
            cache_read_tokens: None,
        })
    }

    fn text(s: &str) -> StreamEvent {
        StreamEvent::TextDelta(s.to_string())
    }

    #[test]
    fn test_completed_turn_commits_one_message() {
        let mut task = TaskSession::new(false);
        assert_eq!(task.status(), TaskStatus::Created);
        task.begin_turn("Hello").unwrap();

        assert!(task.apply(usage(10, 0)));
        assert!(task.apply(text("Hi")));
        assert!(task.apply(text(" there")));
        assert_eq!(task.streaming_text(), Some("Hi there"));
        assert!(task.apply(usage(0, 5)));

        assert!(task.finish(Ok(())));
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.messages().len(), 2);
        assert_eq!(task.messages()[1].role, Role::Assistant);
        assert_eq!(task.messages()[1].content, "Hi there");
        assert_eq!(task.streaming_text(), None);
        assert_eq!(task.usage().input_tokens, 10);
        assert_eq!(task.usage().output_tokens, 5);
        assert_eq!(task.usage().cache_write_tokens, 4);
    }

    #[test]
    fn test_events_discarded_outside_streaming() {
        let mut task = TaskSession::new(false);
        assert!(!task.apply(text("early")));

        task.begin_turn("q").unwrap();
        assert!(task.finish(Ok(())));
        assert!(!task.apply(text("late")));
        assert!(!task.apply(usage(1, 1)));
        assert_eq!(task.usage().input_tokens, 0);
        assert_eq!(task.messages()[1].content, "");
    }

    #[test]
    fn test_abort_discards_partial_text() {
        let mut task = TaskSession::new(false);
        task.begin_turn("q").unwrap();
        task.apply(text("partial"));

        assert!(task.request_abort());
        assert_eq!(task.status(), TaskStatus::Aborting);
        // Buffered events after the abort are not processed.
        assert!(!task.apply(text(" more")));

        assert!(task.finish(Ok(())));
        assert_eq!(task.status(), TaskStatus::Aborted);
        assert_eq!(task.messages().len(), 1);
        assert_eq!(task.error(), None);
    }

    #[test]
    fn test_abort_persists_partial_text_when_enabled() {
        let mut task = TaskSession::new(true);
        task.begin_turn("q").unwrap();
        task.apply(text("partial"));
        task.request_abort();
        task.finish(Ok(()));
        assert_eq!(task.messages().len(), 2);
        assert_eq!(task.messages()[1].content, "partial");

        // Whitespace-only partials are still dropped.
        let mut task = TaskSession::new(true);
        task.begin_turn("q").unwrap();
        task.apply(text("  "));
        task.request_abort();
        task.finish(Ok(()));
        assert_eq!(task.messages().len(), 1);
    }

    #[test]
    fn test_provider_error_aborts_with_message() {
        let mut task = TaskSession::new(false);
        task.begin_turn("q").unwrap();
        task.apply(text("half"));

        let err = provider::Error::Provider {
            status: 429,
            body: r#"{"error":{"message":"Rate limited"}}"#.to_string(),
        };
        assert!(task.finish(Err(&err)));
        assert_eq!(task.status(), TaskStatus::Aborted);
        assert_eq!(task.messages().len(), 1);
        assert!(task.error().is_some_and(|e| e.contains("Rate limited")));
    }

    #[test]
    fn test_multi_turn_keeps_totals() {
        let mut task = TaskSession::new(false);
        task.begin_turn("one").unwrap();
        task.apply(usage(3, 4));
        task.finish(Ok(()));

        task.begin_turn("two").unwrap();
        assert_eq!(task.begin_turn("three"), Err(TurnError::Busy));
        task.apply(usage(5, 6));
        task.finish(Ok(()));

        assert_eq!(task.messages().len(), 4);
        assert_eq!(task.usage().input_tokens, 8);
        assert_eq!(task.usage().output_tokens, 10);
    }

    #[test]
    fn test_resume_turn_requires_unanswered_user_message() {
        let answered = vec![Message::user("q"), Message::assistant("a")];
        let mut task = TaskSession::from_history("t", answered, UsageTotals::default(), false);
        assert_eq!(task.id(), "t");
        assert_eq!(task.resume_turn(), Err(TurnError::NothingToResume));

        let pending = vec![Message::user("q")];
        let mut task = TaskSession::from_history("t", pending, UsageTotals::default(), false);
        assert!(task.awaiting_response());
        task.resume_turn().unwrap();
        assert_eq!(task.status(), TaskStatus::Streaming);
        assert_eq!(task.messages().len(), 1);
    }

    #[test]
    fn test_malformed_event_sets_warning_only() {
        let mut task = TaskSession::new(false);
        task.begin_turn("q").unwrap();
        assert!(task.apply(StreamEvent::Malformed("data: {oops".into())));
        assert!(task.error().is_some_and(|e| e.contains("{oops")));
        task.finish(Ok(()));
        assert_eq!(task.messages().len(), 2);
    }

    #[test]
    fn test_request_abort_outside_streaming() {
        let mut task = TaskSession::new(false);
        assert!(!task.request_abort());
        assert!(!task.finish(Ok(())));
        assert_eq!(task.status(), TaskStatus::Created);
    }
}
