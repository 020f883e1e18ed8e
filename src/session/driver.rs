//! Streaming driver: runs one turn of a task in its own tokio task.

use super::host::TaskHandle;
use super::relay::Relay;
use super::store::{HistoryError, HistoryItem, HistoryStore};
use crate::provider::{self, LlmApi, Message, models};
use futures::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub(crate) type SharedStore = Arc<Mutex<HistoryStore>>;

/// Run a history operation on the blocking pool.
pub(crate) async fn on_store<T, F>(store: &SharedStore, f: F) -> Result<T, HistoryError>
where
    T: Send + 'static,
    F: FnOnce(&HistoryStore) -> Result<T, HistoryError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || {
        let store = store.lock().unwrap_or_else(PoisonError::into_inner);
        f(&store)
    })
    .await?
}

/// Save a task's transcript and usage, returning the refreshed index.
///
/// The task is read under the store lock, so the last write always carries
/// the newest transcript. Returns `None` without writing when the task was
/// abandoned.
pub(crate) async fn persist(
    store: &SharedStore,
    handle: &TaskHandle,
    model_id: &str,
) -> Result<Option<Vec<HistoryItem>>, HistoryError> {
    let model = models::resolve(Some(model_id));
    let handle = handle.clone();

    on_store(store, move |store| {
        if handle.is_abandoned() {
            return Ok(None);
        }
        let (id, messages, usage) = {
            let task = handle.lock();
            (task.id().to_string(), task.messages().to_vec(), *task.usage())
        };
        let cost = model.cost(&usage);
        store.save(&id, &messages)?;
        store.update_usage(&id, &usage, cost)?;
        Ok(Some(store.list()?))
    })
    .await
}

pub(crate) struct TurnDriver {
    pub api: Arc<dyn LlmApi>,
    pub system_prompt: String,
    pub model_id: String,
    pub history: Vec<Message>,
    pub handle: TaskHandle,
    pub abort_token: CancellationToken,
    pub relay: Arc<Relay>,
    pub store: SharedStore,
    pub done: watch::Sender<bool>,
}

impl TurnDriver {
    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(self) {
        let outcome = self.stream().await;

        match &outcome {
            Ok(()) => {}
            Err(provider::Error::Cancelled) => debug!(task_id = %self.handle.id(), "Turn cancelled"),
            Err(e) => warn!(task_id = %self.handle.id(), "Stream failed: {}", e),
        }

        self.handle.lock().finish(outcome.as_ref().map(|_| ()));

        match persist(&self.store, &self.handle, &self.model_id).await {
            Ok(Some(items)) => self.relay.update(|view| view.task_history = items),
            Ok(None) => debug!(task_id = %self.handle.id(), "Task abandoned, not saving"),
            Err(e) => error!(task_id = %self.handle.id(), "Failed to save task: {}", e),
        }

        self.relay.publish(Some(&self.handle));
        let _ = self.done.send(true);
    }

    /// Consume the provider stream until it ends, fails, or the turn is cancelled.
    async fn stream(&self) -> Result<(), provider::Error> {
        let mut events = tokio::select! {
            biased;
            () = self.abort_token.cancelled() => return Err(provider::Error::Cancelled),
            result = self.api.send(
                &self.system_prompt,
                &self.history,
                Some(self.model_id.as_str()),
            ) => result?,
        };

        loop {
            let next = tokio::select! {
                biased;
                () = self.abort_token.cancelled() => return Err(provider::Error::Cancelled),
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    let accepted = self.handle.lock().apply(event);
                    if accepted {
                        self.relay.publish(Some(&self.handle));
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            }
        }
    }
}
