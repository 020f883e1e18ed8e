//! Session host: owns the single active task slot and the command surface.
//!
//! Replacing the active task is one operation under the slot lock: signal
//! cancel, wait for the driver (bounded by the grace period), install the new
//! task. A driver that misses the grace period is abandoned and can no longer
//! relay state or save.

use super::driver::{SharedStore, TurnDriver, on_store, persist};
use super::relay::{ExportedTranscript, HostView, Relay, StateSink};
use super::store::{HistoryError, HistoryItem, HistoryStore};
use super::task::{TaskSession, TurnError};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::provider::{ApiConfiguration, LlmApi, MalformedEventPolicy, UsageTotals, build_api, models};
use crate::secrets::{self, SecretStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MODEL_SETTING: &str = "model_id";
const BASE_URL_SETTING: &str = "base_url";

/// Shared reference to a task plus its abandonment flag.
#[derive(Clone)]
pub(crate) struct TaskHandle {
    session: Arc<Mutex<TaskSession>>,
    abandoned: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn new(session: TaskSession) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            abandoned: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, TaskSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> String {
        self.lock().id().to_string()
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    pub fn mark_abandoned(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }
}

/// Outcome of cancelling the active task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Nothing was active.
    Idle,
    /// The driver acknowledged within the grace period.
    Confirmed,
    /// The grace period ran out; the task was abandoned.
    Abandoned,
}

struct Turn {
    abort_token: CancellationToken,
    done: watch::Receiver<bool>,
}

struct ActiveTask {
    handle: TaskHandle,
    turn: Option<Turn>,
}

impl ActiveTask {
    fn new(handle: TaskHandle) -> Self {
        Self { handle, turn: None }
    }

    /// Abort the running turn, if any, and wait for its driver.
    async fn shutdown(&mut self, relay: &Relay, grace: Duration) -> Shutdown {
        let Some(mut turn) = self.turn.take() else {
            return Shutdown::Idle;
        };
        if *turn.done.borrow() {
            return Shutdown::Idle;
        }

        self.handle.lock().request_abort();
        turn.abort_token.cancel();

        let confirmed = tokio::time::timeout(grace, turn.done.wait_for(|finished| *finished))
            .await
            .is_ok();
        if confirmed {
            return Shutdown::Confirmed;
        }

        warn!(
            task_id = %self.handle.id(),
            "Task did not stop within {}ms, abandoning it",
            grace.as_millis()
        );
        relay.abandon(&self.handle);
        Shutdown::Abandoned
    }
}

#[derive(Debug, Clone)]
pub struct HostOptions {
    pub system_prompt: String,
    pub grace_period: Duration,
    pub persist_partial_output: bool,
    pub malformed_events: MalformedEventPolicy,
    /// Model used when no selection has been persisted.
    pub model: Option<String>,
    /// Endpoint used when no override has been persisted.
    pub base_url: Option<String>,
}

impl HostOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            system_prompt: config.system_prompt(),
            grace_period: config.abort_grace_period(),
            persist_partial_output: config.persist_partial_output,
            malformed_events: config.malformed_events,
            model: config.model.clone(),
            base_url: config.base_url.clone(),
        }
    }
}

impl Default for HostOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

struct ApiState {
    config: ApiConfiguration,
    api: Arc<dyn LlmApi>,
}

impl ApiState {
    fn model_id(&self) -> &'static str {
        models::resolve(self.config.model_id.as_deref()).id
    }

    fn has_api_key(&self) -> bool {
        self.config.clone().with_env_fallback().validate().is_none()
    }
}

pub struct SessionHost {
    api: RwLock<ApiState>,
    store: SharedStore,
    secrets: Arc<dyn SecretStore>,
    relay: Arc<Relay>,
    options: HostOptions,
    active: tokio::sync::Mutex<Option<ActiveTask>>,
}

impl SessionHost {
    pub fn new(
        api: Arc<dyn LlmApi>,
        api_config: ApiConfiguration,
        store: HistoryStore,
        secrets: Arc<dyn SecretStore>,
        sink: Arc<dyn StateSink>,
        options: HostOptions,
    ) -> Result<Self> {
        let state = ApiState {
            config: api_config,
            api,
        };
        let view = HostView {
            task_history: store.list()?,
            model_id: state.model_id().to_string(),
            has_api_key: state.has_api_key(),
            error: None,
        };

        Ok(Self {
            api: RwLock::new(state),
            store: Arc::new(Mutex::new(store)),
            secrets,
            relay: Arc::new(Relay::new(sink, view)),
            options,
            active: tokio::sync::Mutex::new(None),
        })
    }

    /// Open the on-disk history and build the provider client from stored settings.
    pub fn open(config: &Config, secrets: Arc<dyn SecretStore>, sink: Arc<dyn StateSink>) -> Result<Self> {
        let store = HistoryStore::open(&config.history_db_path())?;
        let options = HostOptions::from_config(config);

        let api_config = ApiConfiguration {
            api_key: secrets.get(secrets::API_KEY).map_err(|e| Error::secrets(&e))?,
            model_id: store.get_setting(MODEL_SETTING)?.or_else(|| options.model.clone()),
            base_url: store
                .get_setting(BASE_URL_SETTING)?
                .or_else(|| options.base_url.clone()),
        };
        let api = build_api(&api_config.clone().with_env_fallback(), options.malformed_events);

        Self::new(api, api_config, store, secrets, sink, options)
    }

    fn api_state(&self) -> std::sync::RwLockReadGuard<'_, ApiState> {
        self.api.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// The stored configuration, without the environment fallback applied.
    pub fn api_configuration(&self) -> ApiConfiguration {
        self.api_state().config.clone()
    }

    pub async fn active_task_id(&self) -> Option<String> {
        let slot = self.active.lock().await;
        slot.as_ref().map(|active| active.handle.id())
    }

    fn ensure_configured(&self) -> Result<()> {
        let config = self.api_state().config.clone().with_env_fallback();
        match config.validate() {
            Some(message) => Err(Error::Config(message)),
            None => Ok(()),
        }
    }

    /// Start a new task with `prompt`, replacing the active one.
    pub async fn start_new(&self, prompt: &str) -> Result<String> {
        self.ensure_configured()?;

        let mut slot = self.active.lock().await;
        self.teardown(&mut slot).await;

        let handle = TaskHandle::new(TaskSession::new(self.options.persist_partial_output));
        handle.lock().begin_turn(prompt)?;
        let id = handle.id();
        debug!(task_id = %id, "Starting new task");

        self.relay.update(|view| view.error = None);
        self.save_initial(&handle).await;

        let mut active = ActiveTask::new(handle);
        self.relay.publish(Some(&active.handle));
        active.turn = Some(self.spawn_turn(&active.handle));
        *slot = Some(active);

        Ok(id)
    }

    /// Load a task from history and make it active.
    ///
    /// Streams right away only if the transcript ends in an unanswered user turn.
    pub async fn resume(&self, task_id: &str) -> Result<()> {
        let mut slot = self.active.lock().await;
        self.teardown(&mut slot).await;

        let stream_pending = self.ensure_configured().is_ok();
        self.install_from_history(&mut slot, task_id, stream_pending)
            .await
    }

    /// Answer the active task with a new user turn.
    pub async fn submit(&self, text: &str) -> Result<()> {
        self.ensure_configured()?;

        let mut slot = self.active.lock().await;
        let active = slot.as_mut().ok_or(TurnError::NoActiveTask)?;
        active.handle.lock().begin_turn(text)?;

        self.relay.update(|view| view.error = None);
        self.save_initial(&active.handle).await;
        self.relay.publish(Some(&active.handle));
        active.turn = Some(self.spawn_turn(&active.handle));

        Ok(())
    }

    /// Abort the running turn, keeping the task active unless it had to be abandoned.
    pub async fn cancel_active(&self) -> Shutdown {
        let mut slot = self.active.lock().await;
        let Some(active) = slot.as_mut() else {
            return Shutdown::Idle;
        };

        let outcome = active.shutdown(&self.relay, self.options.grace_period).await;
        if outcome == Shutdown::Abandoned {
            *slot = None;
            self.relay.publish(None);
        }
        outcome
    }

    /// Cancel the active task and reload it from history.
    pub async fn cancel_task(&self) -> Result<()> {
        let mut slot = self.active.lock().await;
        let Some(id) = slot.as_ref().map(|active| active.handle.id()) else {
            return Ok(());
        };

        self.teardown(&mut slot).await;
        self.install_from_history(&mut slot, &id, false).await
    }

    /// Cancel and drop the active task.
    pub async fn clear_task(&self) {
        let mut slot = self.active.lock().await;
        self.teardown(&mut slot).await;
        self.relay.update(|view| view.error = None);
        self.relay.publish(None);
    }

    pub async fn delete_history(&self, task_id: &str) -> Result<()> {
        let mut slot = self.active.lock().await;
        if slot
            .as_ref()
            .is_some_and(|active| active.handle.id() == task_id)
        {
            self.teardown(&mut slot).await;
        }

        let id = task_id.to_string();
        let result = on_store(&self.store, move |store| {
            store.get_item(&id)?;
            store.remove(&id)?;
            store.list()
        })
        .await;

        match result {
            Ok(items) => {
                debug!(task_id, "Deleted task");
                self.relay.update(|view| view.task_history = items);
                self.relay.publish(slot.as_ref().map(|active| &active.handle));
                Ok(())
            }
            Err(e) => Err(self.report(slot.as_ref(), e).await),
        }
    }

    /// Render a stored task for export and hand it to the sink.
    pub async fn export_history(&self, task_id: &str) -> Result<ExportedTranscript> {
        let id = task_id.to_string();
        let loaded = on_store(&self.store, move |store| {
            let messages = store.load(&id)?;
            let item = store.get_item(&id)?;
            Ok((item, messages))
        })
        .await;

        match loaded {
            Ok((item, messages)) => {
                let payload = ExportedTranscript::render(&item, &messages);
                self.relay.export(payload.clone());
                Ok(payload)
            }
            Err(e) => {
                let slot = self.active.lock().await;
                Err(self.report(slot.as_ref(), e).await)
            }
        }
    }

    /// Store the credential, persist model and endpoint, and rebuild the client.
    pub async fn update_api_configuration(&self, config: ApiConfiguration) -> Result<()> {
        let stored = match config.api_key.as_deref().filter(|key| !key.is_empty()) {
            Some(key) => self.secrets.set(secrets::API_KEY, key),
            None => self.secrets.delete(secrets::API_KEY),
        };
        stored.map_err(|e| Error::secrets(&e))?;

        let model_id = config.model_id.clone();
        let base_url = config.base_url.clone();
        on_store(&self.store, move |store| {
            store.set_setting(MODEL_SETTING, model_id.as_deref())?;
            store.set_setting(BASE_URL_SETTING, base_url.as_deref())
        })
        .await?;

        self.install_api(config);

        let slot = self.active.lock().await;
        self.relay.publish(slot.as_ref().map(|active| &active.handle));
        Ok(())
    }

    fn install_api(&self, config: ApiConfiguration) {
        let api = build_api(
            &config.clone().with_env_fallback(),
            self.options.malformed_events,
        );
        let state = ApiState { config, api };
        let (model_id, has_api_key) = (state.model_id().to_string(), state.has_api_key());

        *self.api.write().unwrap_or_else(PoisonError::into_inner) = state;
        self.relay.update(|view| {
            view.model_id = model_id;
            view.has_api_key = has_api_key;
        });
    }

    /// Cancel the active task and delete all history, settings and the stored key.
    pub async fn reset_state(&self) -> Result<()> {
        let mut slot = self.active.lock().await;
        self.teardown(&mut slot).await;

        on_store(&self.store, HistoryStore::clear).await?;
        self.secrets
            .delete(secrets::API_KEY)
            .map_err(|e| Error::secrets(&e))?;

        self.install_api(ApiConfiguration {
            api_key: None,
            model_id: self.options.model.clone(),
            base_url: self.options.base_url.clone(),
        });
        self.relay.update(|view| {
            view.task_history.clear();
            view.error = None;
        });
        self.relay.publish(None);
        Ok(())
    }

    /// The task index, most recent first.
    pub async fn task_history(&self) -> Result<Vec<HistoryItem>> {
        let items = on_store(&self.store, HistoryStore::list).await?;
        self.relay.update(|view| view.task_history = items.clone());
        Ok(items)
    }

    /// Wait until the active turn, if any, has finished.
    pub async fn wait_for_idle(&self) {
        let done = {
            let slot = self.active.lock().await;
            slot.as_ref()
                .and_then(|active| active.turn.as_ref())
                .map(|turn| turn.done.clone())
        };
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    /// Shut down and remove whatever occupies the slot.
    async fn teardown(&self, slot: &mut Option<ActiveTask>) -> Shutdown {
        let Some(mut active) = slot.take() else {
            return Shutdown::Idle;
        };
        active.shutdown(&self.relay, self.options.grace_period).await
    }

    async fn install_from_history(
        &self,
        slot: &mut Option<ActiveTask>,
        task_id: &str,
        stream_pending: bool,
    ) -> Result<()> {
        let id = task_id.to_string();
        let loaded = on_store(&self.store, move |store| {
            let messages = store.load(&id)?;
            let item = store.get_item(&id)?;
            Ok((item, messages))
        })
        .await;

        let (item, messages) = match loaded {
            Ok(loaded) => loaded,
            Err(e) => return Err(self.report(None, e).await),
        };

        let usage = UsageTotals {
            input_tokens: item.tokens_in,
            output_tokens: item.tokens_out,
            cache_write_tokens: item.cache_writes,
            cache_read_tokens: item.cache_reads,
        };
        let session = TaskSession::from_history(
            item.id,
            messages,
            usage,
            self.options.persist_partial_output,
        );
        let mut active = ActiveTask::new(TaskHandle::new(session));
        let streaming = stream_pending && active.handle.lock().resume_turn().is_ok();

        self.relay.update(|view| view.error = None);
        self.relay.publish(Some(&active.handle));
        if streaming {
            active.turn = Some(self.spawn_turn(&active.handle));
        }
        *slot = Some(active);
        Ok(())
    }

    /// Save the transcript at turn start so the index lists the task.
    async fn save_initial(&self, handle: &TaskHandle) {
        let model_id = self.api_state().model_id();
        match persist(&self.store, handle, model_id).await {
            Ok(Some(items)) => self.relay.update(|view| view.task_history = items),
            Ok(None) => {}
            Err(e) => tracing::error!(task_id = %handle.id(), "Failed to save task: {}", e),
        }
    }

    fn spawn_turn(&self, handle: &TaskHandle) -> Turn {
        let (api, model_id) = {
            let state = self.api_state();
            (Arc::clone(&state.api), state.model_id().to_string())
        };
        let (done_tx, done_rx) = watch::channel(false);
        let abort_token = CancellationToken::new();

        TurnDriver {
            api,
            system_prompt: self.options.system_prompt.clone(),
            model_id,
            history: handle.lock().messages().to_vec(),
            handle: handle.clone(),
            abort_token: abort_token.clone(),
            relay: Arc::clone(&self.relay),
            store: Arc::clone(&self.store),
            done: done_tx,
        }
        .spawn();

        Turn {
            abort_token,
            done: done_rx,
        }
    }

    /// Surface a history failure through the relay and convert it.
    async fn report(&self, active: Option<&ActiveTask>, err: HistoryError) -> Error {
        warn!("History operation failed: {}", err);
        let message = err.to_string();
        // A failed load may have dropped a dangling index entry.
        let items = on_store(&self.store, HistoryStore::list).await.ok();
        self.relay.update(|view| {
            view.error = Some(message);
            if let Some(items) = items {
                view.task_history = items;
            }
        });
        self.relay.publish(active.map(|active| &active.handle));
        Error::History(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{self, EventStream, Message, StreamEvent, UsageDelta};
    use crate::secrets::MemorySecretStore;
    use crate::session::relay::{ChannelSink, SinkMessage, StateSnapshot};
    use crate::session::task::TaskStatus;
    use async_trait::async_trait;
    use futures::{StreamExt, stream};
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    enum Reply {
        Events(Vec<StreamEvent>),
        /// Yield the events, then never finish.
        HangAfter(Vec<StreamEvent>),
        /// The request itself never returns.
        Hang,
        /// Block the worker thread, ignoring cancellation, then yield the events.
        Block(Duration, Vec<StreamEvent>),
        Fail(u16, &'static str),
    }

    struct ScriptedApi {
        replies: Mutex<VecDeque<Reply>>,
        calls: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedApi {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<Vec<Message>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmApi for ScriptedApi {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn send(
            &self,
            _system_prompt: &str,
            history: &[Message],
            _model: Option<&str>,
        ) -> std::result::Result<EventStream, provider::Error> {
            self.calls.lock().unwrap().push(history.to_vec());
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Reply::Events(Vec::new()));

            match reply {
                Reply::Events(events) => Ok(Box::pin(stream::iter(events.into_iter().map(Ok)))),
                Reply::HangAfter(events) => Ok(Box::pin(
                    stream::iter(events.into_iter().map(Ok)).chain(stream::pending()),
                )),
                Reply::Hang => futures::future::pending().await,
                Reply::Block(delay, events) => {
                    std::thread::sleep(delay);
                    Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
                }
                Reply::Fail(status, body) => Err(provider::Error::Provider {
                    status,
                    body: body.to_string(),
                }),
            }
        }
    }

    fn text(s: &str) -> StreamEvent {
        StreamEvent::TextDelta(s.to_string())
    }

    fn usage(input: u32, output: u32) -> StreamEvent {
        StreamEvent::UsageDelta(UsageDelta {
            input_tokens: input,
            output_tokens: output,
            cache_write_tokens: None,
            cache_read_tokens: None,
        })
    }

    fn options() -> HostOptions {
        HostOptions {
            system_prompt: "test".into(),
            grace_period: Duration::from_millis(200),
            persist_partial_output: false,
            malformed_events: MalformedEventPolicy::Skip,
            model: None,
            base_url: None,
        }
    }

    fn host_with(
        api: Arc<ScriptedApi>,
        api_key: Option<&str>,
    ) -> (SessionHost, mpsc::UnboundedReceiver<SinkMessage>) {
        let (sink, rx) = ChannelSink::new();
        let host = SessionHost::new(
            api,
            ApiConfiguration {
                api_key: api_key.map(str::to_string),
                ..Default::default()
            },
            HistoryStore::open_in_memory().unwrap(),
            Arc::new(MemorySecretStore::default()),
            sink,
            options(),
        )
        .unwrap();
        (host, rx)
    }

    fn host(api: Arc<ScriptedApi>) -> (SessionHost, mpsc::UnboundedReceiver<SinkMessage>) {
        host_with(api, Some("test-key"))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SinkMessage>) -> Vec<StateSnapshot> {
        let mut snapshots = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let SinkMessage::State(snapshot) = message {
                snapshots.push(*snapshot);
            }
        }
        snapshots
    }

    fn active_id(snapshot: &StateSnapshot) -> Option<&str> {
        snapshot.active_task.as_ref().map(|t| t.id.as_str())
    }

    #[tokio::test]
    async fn test_start_new_streams_and_saves() {
        let api = ScriptedApi::new(vec![Reply::Events(vec![
            usage(10, 0),
            text("Hi"),
            text(" there"),
            usage(0, 5),
        ])]);
        let (host, mut rx) = host(Arc::clone(&api));

        let id = host.start_new("Hello").await.unwrap();
        host.wait_for_idle().await;

        let snapshots = drain(&mut rx);
        let first = &snapshots[0];
        assert_eq!(active_id(first), Some(id.as_str()));
        assert_eq!(first.status, Some(TaskStatus::Streaming));
        assert_eq!(first.task_history[0].id, id);

        let last = snapshots.last().unwrap();
        assert_eq!(last.status, Some(TaskStatus::Completed));
        assert_eq!(last.messages.len(), 2);
        assert_eq!(last.messages[1].content, "Hi there");
        assert_eq!(last.usage.input_tokens, 10);
        assert_eq!(last.usage.output_tokens, 5);
        assert!(last.total_cost > 0.0);

        let saved = host.store.lock().unwrap().load(&id).unwrap();
        assert_eq!(saved, last.messages);

        let history = host.task_history().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tokens_in, 10);
        assert_eq!(history[0].tokens_out, 5);
        assert_eq!(history[0].task, "Hello");

        assert_eq!(api.calls()[0], vec![last.messages[0].clone()]);
    }

    #[tokio::test]
    async fn test_cancel_then_start_has_one_active_task() {
        let api = ScriptedApi::new(vec![
            Reply::HangAfter(vec![text("old text")]),
            Reply::Events(vec![text("new")]),
        ]);
        let (host, mut rx) = host(api);

        let old = host.start_new("first").await.unwrap();
        // Wait until the old task has streamed something.
        loop {
            if let Some(SinkMessage::State(s)) = rx.recv().await
                && s.streaming_text.as_deref() == Some("old text")
            {
                break;
            }
        }

        assert_eq!(host.cancel_active().await, Shutdown::Confirmed);
        let new = host.start_new("second").await.unwrap();
        host.wait_for_idle().await;

        let snapshots = drain(&mut rx);
        let first_new = snapshots
            .iter()
            .position(|s| active_id(s) == Some(new.as_str()))
            .unwrap();
        let first = &snapshots[first_new];
        assert_eq!(first.messages.len(), 1);
        assert_eq!(first.messages[0].content, "second");
        assert!(!first.streaming_text.clone().unwrap_or_default().contains("old"));

        // Nothing from the old task after the switch.
        assert!(snapshots[first_new..]
            .iter()
            .all(|s| active_id(s) == Some(new.as_str())));
        assert_eq!(host.active_task_id().await, Some(new));
        assert_ne!(host.active_task_id().await, Some(old));
    }

    /// Yield until the scripted API has seen `n` requests.
    async fn wait_for_calls(api: &ScriptedApi, n: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while api.calls().len() < n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_hung_request_replaced_within_grace_period() {
        let api = ScriptedApi::new(vec![Reply::Hang, Reply::Events(vec![text("ok")])]);
        let (host, mut rx) = host(Arc::clone(&api));

        let hung = host.start_new("stuck").await.unwrap();
        wait_for_calls(&api, 1).await;

        let replaced = tokio::time::timeout(Duration::from_secs(2), host.start_new("fresh"))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(2), host.wait_for_idle())
            .await
            .unwrap();

        assert_eq!(api.calls().len(), 2);
        assert_eq!(api.calls()[1][0].content, "fresh");
        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(active_id(&last), Some(replaced.as_str()));
        assert_eq!(last.status, Some(TaskStatus::Completed));
        let ids: Vec<&str> = last.task_history.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec![replaced.as_str(), hung.as_str()]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocked_driver_abandoned_and_replaced() {
        let api = ScriptedApi::new(vec![
            Reply::Block(Duration::from_millis(800), vec![text("late")]),
            Reply::Events(vec![text("ok")]),
        ]);
        let (host, mut rx) = host(Arc::clone(&api));

        let stuck = host.start_new("stuck").await.unwrap();
        wait_for_calls(&api, 1).await;

        let started = std::time::Instant::now();
        let fresh = host.start_new("fresh").await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(800));
        tokio::time::timeout(Duration::from_secs(2), host.wait_for_idle())
            .await
            .unwrap();
        assert_eq!(host.active_task_id().await, Some(fresh.clone()));

        // Let the blocked driver wake up and run to completion.
        tokio::time::sleep(Duration::from_millis(1200)).await;

        let snapshots = drain(&mut rx);
        let switch = snapshots
            .iter()
            .position(|s| active_id(s) == Some(fresh.as_str()))
            .unwrap();
        assert!(snapshots[switch..]
            .iter()
            .all(|s| active_id(s) == Some(fresh.as_str())));

        let saved = host.store.lock().unwrap().load(&stuck).unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].content, "stuck");
        assert_eq!(host.active_task_id().await, Some(fresh));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_active_abandons_blocked_driver() {
        let api = ScriptedApi::new(vec![Reply::Block(Duration::from_millis(800), Vec::new())]);
        let (host, mut rx) = host(Arc::clone(&api));

        host.start_new("stuck").await.unwrap();
        wait_for_calls(&api, 1).await;

        assert_eq!(host.cancel_active().await, Shutdown::Abandoned);
        assert_eq!(host.active_task_id().await, None);
        let last = drain(&mut rx).pop().unwrap();
        assert!(last.active_task.is_none());
    }

    #[tokio::test]
    async fn test_cancel_after_completed_turn_is_idle() {
        let api = ScriptedApi::new(vec![Reply::Events(vec![text("done")])]);
        let (host, _rx) = host(api);

        let id = host.start_new("quick").await.unwrap();
        host.wait_for_idle().await;

        assert_eq!(host.cancel_active().await, Shutdown::Idle);
        assert_eq!(host.active_task_id().await, Some(id));
    }

    #[tokio::test]
    async fn test_late_persist_writes_newest_transcript() {
        let store: SharedStore = Arc::new(Mutex::new(HistoryStore::open_in_memory().unwrap()));
        let handle = TaskHandle::new(TaskSession::new(false));
        {
            let mut task = handle.lock();
            task.begin_turn("first").unwrap();
            task.apply(text("answer"));
            assert!(task.finish(Ok(())));
        }

        // Hold the store so the driver's save queues behind a follow-up turn.
        let guard = store.lock().unwrap();
        let pending = {
            let (store, handle) = (Arc::clone(&store), handle.clone());
            tokio::spawn(async move { persist(&store, &handle, models::DEFAULT_MODEL_ID).await })
        };
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        handle.lock().begin_turn("follow-up").unwrap();
        drop(guard);

        let items = pending.await.unwrap().unwrap().unwrap();
        assert_eq!(items.len(), 1);
        let saved = store.lock().unwrap().load(handle.id().as_str()).unwrap();
        let contents: Vec<&str> = saved.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "answer", "follow-up"]);
    }

    #[tokio::test]
    async fn test_delete_then_load_is_not_found() {
        let api = ScriptedApi::new(vec![Reply::Events(vec![text("done")])]);
        let (host, mut rx) = host(api);

        let id = host.start_new("to delete").await.unwrap();
        host.wait_for_idle().await;
        host.clear_task().await;

        host.delete_history(&id).await.unwrap();
        assert!(matches!(
            host.store.lock().unwrap().load(&id),
            Err(HistoryError::NotFound(_))
        ));
        assert!(drain(&mut rx).last().unwrap().task_history.is_empty());

        let err = host.delete_history(&id).await.unwrap_err();
        assert!(matches!(err, Error::History(HistoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_active_task_cancels_it() {
        let api = ScriptedApi::new(vec![Reply::HangAfter(vec![text("x")])]);
        let (host, _rx) = host(api);

        let id = host.start_new("busy").await.unwrap();
        host.delete_history(&id).await.unwrap();

        assert_eq!(host.active_task_id().await, None);
        assert!(host.task_history().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_error_ends_turn_aborted() {
        let api = ScriptedApi::new(vec![Reply::Fail(
            401,
            r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#,
        )]);
        let (host, mut rx) = host(api);

        host.start_new("hi").await.unwrap();
        host.wait_for_idle().await;

        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(last.status, Some(TaskStatus::Aborted));
        assert_eq!(last.messages.len(), 1);
        assert!(last.error.unwrap().contains("invalid x-api-key"));
    }

    #[tokio::test]
    async fn test_resume_streams_unanswered_turn() {
        let api = ScriptedApi::new(vec![
            Reply::Events(vec![text("answer")]),
            Reply::Events(vec![text("second answer")]),
        ]);
        let (host, mut rx) = host(Arc::clone(&api));
        host.store
            .lock()
            .unwrap()
            .save("stored", &[Message::user("pending question")])
            .unwrap();

        host.resume("stored").await.unwrap();
        host.wait_for_idle().await;

        assert_eq!(api.calls().len(), 1);
        assert_eq!(api.calls()[0][0].content, "pending question");
        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(active_id(&last), Some("stored"));
        assert_eq!(last.messages.len(), 2);

        // Answered transcript: resuming waits for the next submit.
        host.resume("stored").await.unwrap();
        host.wait_for_idle().await;
        assert_eq!(api.calls().len(), 1);

        host.submit("follow-up").await.unwrap();
        host.wait_for_idle().await;
        assert_eq!(api.calls().len(), 2);
        assert_eq!(api.calls()[1].len(), 3);
        assert_eq!(host.store.lock().unwrap().load("stored").unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_resume_missing_task_reports_not_found() {
        let (host, mut rx) = host(ScriptedApi::new(Vec::new()));

        let err = host.resume("missing").await.unwrap_err();
        assert!(matches!(err, Error::History(HistoryError::NotFound(_))));

        let last = drain(&mut rx).pop().unwrap();
        assert!(last.active_task.is_none());
        assert!(last.error.unwrap().contains("Task not found"));
    }

    #[tokio::test]
    async fn test_cancel_task_reloads_from_history() {
        let api = ScriptedApi::new(vec![Reply::HangAfter(vec![text("partial")])]);
        let (host, mut rx) = host(api);

        let id = host.start_new("question").await.unwrap();
        loop {
            if let Some(SinkMessage::State(s)) = rx.recv().await
                && s.streaming_text.as_deref() == Some("partial")
            {
                break;
            }
        }

        host.cancel_task().await.unwrap();

        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(active_id(&last), Some(id.as_str()));
        assert_eq!(last.status, Some(TaskStatus::Created));
        assert_eq!(last.messages.len(), 1);
        assert_eq!(last.messages[0].content, "question");
        assert_eq!(last.streaming_text, None);
    }

    #[tokio::test]
    async fn test_cancel_active_without_task_is_idle() {
        let (host, _rx) = host(ScriptedApi::new(Vec::new()));
        assert_eq!(host.cancel_active().await, Shutdown::Idle);
    }

    #[tokio::test]
    async fn test_unresponsive_driver_is_abandoned() {
        let (sink, mut rx) = ChannelSink::new();
        let relay = Relay::new(sink, HostView::default());
        let handle = TaskHandle::new(TaskSession::new(false));
        handle.lock().begin_turn("q").unwrap();

        // Keep the sender alive and never signal completion.
        let (_done_tx, done_rx) = watch::channel(false);
        let mut active = ActiveTask {
            handle: handle.clone(),
            turn: Some(Turn {
                abort_token: CancellationToken::new(),
                done: done_rx,
            }),
        };

        let outcome = active.shutdown(&relay, Duration::from_millis(20)).await;
        assert_eq!(outcome, Shutdown::Abandoned);
        assert!(handle.is_abandoned());

        relay.publish(Some(&handle));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_abandoned_task_never_saves() {
        let store: SharedStore = Arc::new(Mutex::new(HistoryStore::open_in_memory().unwrap()));
        let handle = TaskHandle::new(TaskSession::new(false));
        handle.lock().begin_turn("q").unwrap();
        handle.mark_abandoned();

        let saved = persist(&store, &handle, models::DEFAULT_MODEL_ID).await.unwrap();
        assert!(saved.is_none());
        assert!(store.lock().unwrap().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_requires_idle_active_task() {
        let api = ScriptedApi::new(vec![Reply::HangAfter(Vec::new())]);
        let (host, _rx) = host(api);

        let err = host.submit("nobody home").await.unwrap_err();
        assert!(matches!(err, Error::Turn(TurnError::NoActiveTask)));

        host.start_new("first").await.unwrap();
        let err = host.submit("too soon").await.unwrap_err();
        assert!(matches!(err, Error::Turn(TurnError::Busy)));
    }

    #[tokio::test]
    async fn test_start_requires_api_key() {
        if provider::env_api_key().is_some() {
            return;
        }
        let (host, _rx) = host_with(ScriptedApi::new(Vec::new()), None);
        let err = host.start_new("hi").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: You must provide a valid API key."
        );
    }

    #[tokio::test]
    async fn test_export_history() {
        let api = ScriptedApi::new(vec![Reply::Events(vec![text("4")])]);
        let (host, mut rx) = host(api);

        let id = host.start_new("What is 2+2?").await.unwrap();
        host.wait_for_idle().await;
        let _ = drain(&mut rx);

        let export = host.export_history(&id).await.unwrap();
        assert_eq!(export.task_id, id);
        assert!(export.markdown.contains("What is 2+2?"));
        assert!(export.markdown.contains("**Assistant:**\n\n4"));

        let Ok(SinkMessage::Exported(sent)) = rx.try_recv() else {
            panic!("expected an export payload");
        };
        assert_eq!(sent, export);
    }

    #[tokio::test]
    async fn test_update_api_configuration_and_reset() {
        let api = ScriptedApi::new(vec![Reply::Events(vec![text("ok")])]);
        let (host, mut rx) = host(api);

        host.start_new("keep me?").await.unwrap();
        host.wait_for_idle().await;

        host.update_api_configuration(ApiConfiguration {
            api_key: Some("sk-ant-new".into()),
            model_id: Some("claude-3-opus-20240229".into()),
            base_url: None,
        })
        .await
        .unwrap();

        assert_eq!(
            host.secrets.get(secrets::API_KEY).unwrap().as_deref(),
            Some("sk-ant-new")
        );
        assert_eq!(
            host.store.lock().unwrap().get_setting(MODEL_SETTING).unwrap().as_deref(),
            Some("claude-3-opus-20240229")
        );
        let last = drain(&mut rx).pop().unwrap();
        assert_eq!(last.model_id, "claude-3-opus-20240229");
        assert!(last.has_api_key);

        host.reset_state().await.unwrap();
        assert_eq!(host.secrets.get(secrets::API_KEY).unwrap(), None);
        assert_eq!(host.store.lock().unwrap().get_setting(MODEL_SETTING).unwrap(), None);
        assert_eq!(host.api_configuration().api_key, None);
        let last = drain(&mut rx).pop().unwrap();
        assert!(last.active_task.is_none());
        assert!(last.task_history.is_empty());
        assert_eq!(last.model_id, models::DEFAULT_MODEL_ID);
    }
}
