//! Background watchers feeding task status into the dispatcher.
//!
//! Two strategies exist:
//!
//! - **Polling** ([`spawn_task_poller`]): while the inbox has active tasks,
//!   wait out the next interval of a back-off table, ask the server for
//!   task status and dispatch the answer. Registering a new task restarts
//!   the table; once the table is exhausted polling stops until the next
//!   registration.
//! - **Push** ([`spawn_task_watcher`] with a [`TaskPushSource`]): status
//!   frames arrive over a persistent connection (a WebSocket in the
//!   browser). Disconnects are retried with exponential back-off; if
//!   connecting keeps failing, the watcher falls back to polling.
//!
//! Both produce the same `INBOX_CHECK_TASK_STATUS_DONE` side-effect action,
//! so the task checker does not know which strategy is running.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_stream::{Stream, StreamExt};

use crate::action::{Action, ActionPayload};
use crate::client::{ApiFuture, TaskApi};
use crate::conf::{DEFAULT_CHECK_INTERVALS_SECS, TaskConf};
use crate::dispatcher::ActionDispatcher;
use crate::error::ClientError;
use crate::model::StatefulModelHandle;
use crate::task::AsyncTaskInfo;
use crate::task_checker::AsyncTaskChecker;

/// Stream of text frames from a push connection.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, ClientError>> + Send>>;

/// Source of pushed task status frames.
///
/// The transport (typically a WebSocket to `taskStatusPushUrl`) is supplied
/// by the embedding application.
pub trait TaskPushSource: Send + Sync {
    /// Open a connection and return its frame stream.
    fn connect(&self) -> ApiFuture<'_, FrameStream>;
}

/// Tuning for task watchers.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use kontext_flux::WatcherConfig;
///
/// let config = WatcherConfig {
///     max_connect_failures: 5,
///     ..WatcherConfig::default()
/// };
/// assert_eq!(config.reconnect_base_delay, Duration::from_secs(1));
/// assert_eq!(config.check_intervals.len(), 14);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherConfig {
    /// Polling back-off table.
    ///
    /// Default: 1, 2, 2, 5, 5, 10, 10, 30, 30, 60, 60, 120, 300, 600 seconds.
    pub check_intervals: Vec<Duration>,

    /// Base delay for exponential back-off between push reconnects.
    ///
    /// Default: 1 second.
    pub reconnect_base_delay: Duration,

    /// Maximum delay between push reconnects.
    ///
    /// Default: 30 seconds.
    pub reconnect_max_delay: Duration,

    /// Consecutive failed connection attempts after which the watcher
    /// switches to polling for good.
    ///
    /// Default: 3.
    pub max_connect_failures: u32,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            check_intervals: DEFAULT_CHECK_INTERVALS_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_connect_failures: 3,
        }
    }
}

impl WatcherConfig {
    pub fn from_task_conf(conf: &TaskConf) -> Self {
        Self {
            check_intervals: conf.check_intervals(),
            ..Self::default()
        }
    }
}

/// Handle for a running watcher.
///
/// Dropping the handle does **not** stop the watcher; call
/// [`shutdown`](WatcherHandle::shutdown).
///
/// `Clone` is cheap: all fields are shared.
#[derive(Clone)]
pub struct WatcherHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
    task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatcherHandle")
            .field("stopping", &*self.shutdown_tx.borrow())
            .finish()
    }
}

impl WatcherHandle {
    fn spawn<F>(watcher: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = watcher => {}
                _ = wait_for_shutdown(shutdown_rx) => {
                    tracing::debug!("task watcher stopped");
                }
            }
        });
        Self {
            shutdown_tx: Arc::new(shutdown_tx),
            task: Arc::new(tokio::sync::Mutex::new(Some(task))),
        }
    }

    /// Stop the watcher and wait for it to exit.
    ///
    /// An in-flight status request is abandoned. Calling `shutdown` more
    /// than once is safe.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().await.take();
        if let Some(join_handle) = task
            && let Err(e) = join_handle.await
        {
            tracing::error!(error = %e, "task watcher panicked");
        }
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // All handles dropped without a shutdown: keep running.
            std::future::pending::<()>().await;
        }
    }
}

/// Decode a push frame: either an array of task records or a single one.
///
/// # Errors
///
/// Returns [`ClientError::Decode`] if the frame is not valid task JSON.
pub fn parse_push_frame(frame: &str) -> Result<Vec<AsyncTaskInfo>, ClientError> {
    let value: serde_json::Value = serde_json::from_str(frame)?;
    if value.is_array() {
        Ok(serde_json::from_value(value)?)
    } else {
        Ok(vec![serde_json::from_value(value)?])
    }
}

/// Start polling task status in the background.
///
/// Must be called within a tokio runtime.
///
/// # Arguments
///
/// * `checker` - The task inbox; read for active tasks, generation and
///   epoch.
/// * `api` - Server access for status checks.
/// * `dispatcher` - Receives the status actions.
/// * `config` - Only `check_intervals` is used.
pub fn spawn_task_poller(
    checker: StatefulModelHandle<AsyncTaskChecker>,
    api: Arc<dyn TaskApi>,
    dispatcher: ActionDispatcher,
    config: WatcherConfig,
) -> WatcherHandle {
    WatcherHandle::spawn(async move {
        run_poll_loop(&checker, api.as_ref(), &dispatcher, &config.check_intervals).await;
    })
}

/// Start watching task status, preferring push over polling.
///
/// Without a push source this is [`spawn_task_poller`]. Must be called
/// within a tokio runtime.
pub fn spawn_task_watcher(
    checker: StatefulModelHandle<AsyncTaskChecker>,
    api: Arc<dyn TaskApi>,
    push: Option<Arc<dyn TaskPushSource>>,
    dispatcher: ActionDispatcher,
    config: WatcherConfig,
) -> WatcherHandle {
    match push {
        Some(push) => WatcherHandle::spawn(async move {
            run_push_loop(&checker, api.as_ref(), push.as_ref(), &dispatcher, &config).await;
        }),
        None => spawn_task_poller(checker, api, dispatcher, config),
    }
}

// --- polling ---

/// Wait until `pred` holds for the checker.
///
/// Returns `false` if the checker's change channel closed.
async fn wait_for_checker(
    checker: &StatefulModelHandle<AsyncTaskChecker>,
    changes: &mut watch::Receiver<u64>,
    pred: impl Fn(&AsyncTaskChecker) -> bool,
) -> bool {
    loop {
        if checker.read(&pred) {
            return true;
        }
        if changes.changed().await.is_err() {
            return false;
        }
    }
}

async fn run_poll_loop(
    checker: &StatefulModelHandle<AsyncTaskChecker>,
    api: &dyn TaskApi,
    dispatcher: &ActionDispatcher,
    intervals: &[Duration],
) {
    let mut changes = checker.subscribe_changes();
    if !wait_for_checker(checker, &mut changes, AsyncTaskChecker::has_active_tasks).await {
        return;
    }
    let mut generation = checker.read(AsyncTaskChecker::generation);
    let mut step = 0;
    tracing::debug!(generation, "task polling started");

    loop {
        let Some(delay) = intervals.get(step).copied() else {
            tracing::info!(generation, "task polling schedule exhausted");
            let seen = generation;
            if !wait_for_checker(checker, &mut changes, |m| {
                m.generation() != seen && m.has_active_tasks()
            })
            .await
            {
                return;
            }
            generation = checker.read(AsyncTaskChecker::generation);
            step = 0;
            continue;
        };

        // A task registered mid-sleep restarts the schedule.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        let restarted = loop {
            tokio::select! {
                _ = &mut sleep => break false,
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let current = checker.read(AsyncTaskChecker::generation);
                    if current != generation {
                        generation = current;
                        break true;
                    }
                }
            }
        };
        if restarted {
            tracing::debug!(
                generation,
                "new task registered, restarting polling schedule"
            );
            step = 0;
            continue;
        }
        step += 1;

        if !checker.read(AsyncTaskChecker::has_active_tasks) {
            tracing::debug!("no active tasks, polling idle");
            if !wait_for_checker(checker, &mut changes, AsyncTaskChecker::has_active_tasks).await {
                return;
            }
            generation = checker.read(AsyncTaskChecker::generation);
            step = 0;
            continue;
        }

        poll_once(checker, api, dispatcher).await;
    }
}

async fn poll_once(
    checker: &StatefulModelHandle<AsyncTaskChecker>,
    api: &dyn TaskApi,
    dispatcher: &ActionDispatcher,
) {
    let epoch = checker.read(AsyncTaskChecker::epoch);
    match api.check_tasks_status().await {
        Ok(data) => {
            tracing::debug!(tasks = data.len(), epoch, "task status received");
            dispatcher.dispatch(ActionPayload::side_effect(Action::InboxCheckTaskStatusDone {
                epoch,
                data,
            }));
        }
        Err(e) => {
            tracing::warn!(error = %e, "task status check failed");
            dispatcher.dispatch_side_effect(Action::error_message(format!(
                "failed to check background tasks: {e}"
            )));
        }
    }
}

// --- push ---

enum StreamOutcome {
    /// The server closed the connection.
    Ended,
    Error(ClientError),
}

async fn run_push_loop(
    checker: &StatefulModelHandle<AsyncTaskChecker>,
    api: &dyn TaskApi,
    push: &dyn TaskPushSource,
    dispatcher: &ActionDispatcher,
    config: &WatcherConfig,
) {
    let mut backoff_delay = config.reconnect_base_delay;
    let mut failures = 0u32;

    loop {
        match push.connect().await {
            Ok(stream) => {
                tracing::info!("task push connected");
                failures = 0;
                backoff_delay = config.reconnect_base_delay;
                match consume_frames(checker, dispatcher, stream).await {
                    StreamOutcome::Ended => tracing::info!("task push closed, reconnecting"),
                    StreamOutcome::Error(e) => {
                        tracing::warn!(error = %e, "task push stream error, reconnecting");
                    }
                }
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(error = %e, failures, "task push connect failed");
                if failures >= config.max_connect_failures {
                    tracing::warn!("task push unavailable, falling back to polling");
                    run_poll_loop(checker, api, dispatcher, &config.check_intervals).await;
                    return;
                }
            }
        }
        tokio::time::sleep(backoff_delay).await;
        backoff_delay = (backoff_delay * 2).min(config.reconnect_max_delay);
    }
}

/// How often a push frame is rebuilt when the task list changed under it.
const FRAME_DELIVERY_ATTEMPTS: usize = 3;

async fn consume_frames(
    checker: &StatefulModelHandle<AsyncTaskChecker>,
    dispatcher: &ActionDispatcher,
    mut stream: FrameStream,
) -> StreamOutcome {
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => return StreamOutcome::Error(e),
        };
        let updates = match parse_push_frame(&frame) {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed push frame");
                continue;
            }
        };
        // Frames may carry only the tasks that changed; tracked tasks
        // missing from the frame are passed through unchanged so they are
        // not mistaken for lost tasks.
        for _ in 0..FRAME_DELIVERY_ATTEMPTS {
            let (epoch, data) =
                checker.read(|m| (m.epoch(), overlay(m.tasks(), updates.clone())));
            dispatcher.dispatch(ActionPayload::side_effect(Action::InboxCheckTaskStatusDone {
                epoch,
                data,
            }));
            // A task registered before delivery made the frame stale.
            if checker.read(AsyncTaskChecker::epoch) == epoch {
                break;
            }
        }
    }
    StreamOutcome::Ended
}

fn overlay(tracked: &[AsyncTaskInfo], mut updates: Vec<AsyncTaskInfo>) -> Vec<AsyncTaskInfo> {
    for task in tracked {
        if !updates.iter().any(|u| u.ident == task.ident) {
            updates.push(task.clone());
        }
    }
    updates
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;

    use super::*;
    use crate::client::test_fixtures::FakeTaskApi;
    use crate::messages::MessageLevel;
    use crate::model::register_stateful;
    use crate::task::AsyncTaskStatus;

    fn tasks(value: serde_json::Value) -> Vec<AsyncTaskInfo> {
        serde_json::from_value(value).expect("valid task list")
    }

    fn add(dispatcher: &ActionDispatcher, ident: &str) {
        dispatcher.dispatch(Action::InboxAddAsyncTask {
            ident: ident.into(),
            label: ident.into(),
            category: "wordlist".into(),
            args: serde_json::Map::new(),
            url: None,
        });
    }

    fn config(intervals: &[u64]) -> WatcherConfig {
        WatcherConfig {
            check_intervals: intervals.iter().map(|s| Duration::from_secs(*s)).collect(),
            ..WatcherConfig::default()
        }
    }

    fn setup(api: &Arc<FakeTaskApi>) -> (ActionDispatcher, StatefulModelHandle<AsyncTaskChecker>) {
        let dispatcher = ActionDispatcher::new();
        let checker = register_stateful(
            AsyncTaskChecker::new(Arc::clone(api) as Arc<dyn TaskApi>, false),
            &dispatcher,
        );
        (dispatcher, checker)
    }

    fn first_status(checker: &StatefulModelHandle<AsyncTaskChecker>) -> AsyncTaskStatus {
        checker.read(|m| m.tasks()[0].status)
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[test]
    fn default_config_matches_backoff_table() {
        let config = WatcherConfig::default();
        let secs: Vec<u64> = config.check_intervals.iter().map(|d| d.as_secs()).collect();
        assert_eq!(
            secs,
            vec![1, 2, 2, 5, 5, 10, 10, 30, 30, 60, 60, 120, 300, 600]
        );
        assert_eq!(config.reconnect_max_delay, Duration::from_secs(30));
        assert_eq!(config.max_connect_failures, 3);
    }

    #[test]
    fn push_frame_accepts_array_or_object() {
        let many = parse_push_frame(r#"[{"ident":"a","status":"STARTED"},{"ident":"b"}]"#)
            .expect("array frame");
        assert_eq!(many.len(), 2);
        let one = parse_push_frame(r#"{"ident":"a","status":"SUCCESS"}"#).expect("object frame");
        assert_eq!(one[0].status, AsyncTaskStatus::Success);
        assert!(parse_push_frame("not json").is_err());
        assert!(parse_push_frame(r#"{"status":"SUCCESS"}"#).is_err());
    }

    #[test]
    fn overlay_keeps_tracked_tasks_missing_from_frame() {
        let tracked = tasks(json!([{"ident": "a"}, {"ident": "b"}]));
        let frame = tasks(json!([{"ident": "b", "status": "SUCCESS"}]));
        let merged = overlay(&tracked, frame);
        let idents: Vec<&str> = merged.iter().map(|t| t.ident.as_str()).collect();
        assert_eq!(idents, vec!["b", "a"]);
        assert_eq!(merged[0].status, AsyncTaskStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn poller_is_idle_without_active_tasks() {
        let api = Arc::new(FakeTaskApi::default());
        let (dispatcher, checker) = setup(&api);
        let handle = spawn_task_poller(checker, api.clone(), dispatcher, config(&[1, 1]));

        advance(60).await;
        assert_eq!(api.status_calls(), 0);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn poller_updates_checker_and_goes_idle() {
        let api = Arc::new(FakeTaskApi::default());
        api.push_status(Ok(tasks(json!([{"ident": "t1", "status": "STARTED"}]))));
        api.push_status(Ok(tasks(json!([{"ident": "t1", "status": "SUCCESS"}]))));
        let (dispatcher, checker) = setup(&api);
        let handle = spawn_task_poller(
            checker.clone(),
            api.clone(),
            dispatcher.clone(),
            config(&[1, 2, 2, 5]),
        );

        add(&dispatcher, "t1");
        advance(2).await;
        assert_eq!(api.status_calls(), 1);
        assert_eq!(first_status(&checker), AsyncTaskStatus::Started);

        advance(2).await;
        assert_eq!(api.status_calls(), 2);
        assert_eq!(first_status(&checker), AsyncTaskStatus::Success);

        advance(60).await;
        assert_eq!(api.status_calls(), 2, "no polling without active tasks");
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn poller_stops_when_schedule_exhausted_and_restarts_on_new_task() {
        let api = Arc::new(FakeTaskApi::default());
        api.push_status(Ok(tasks(json!([{"ident": "t1", "status": "STARTED"}]))));
        let (dispatcher, checker) = setup(&api);
        let handle = spawn_task_poller(checker, api.clone(), dispatcher.clone(), config(&[1, 1]));

        add(&dispatcher, "t1");
        advance(30).await;
        assert_eq!(api.status_calls(), 2);

        api.push_status(Ok(tasks(json!([
            {"ident": "t1", "status": "STARTED"},
            {"ident": "t2", "status": "PENDING"}
        ]))));
        add(&dispatcher, "t2");
        advance(30).await;
        assert_eq!(api.status_calls(), 4);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn poll_failure_shows_error_message_and_consumes_step() {
        let api = Arc::new(FakeTaskApi::default());
        api.push_status(Err("connection reset".into()));
        api.push_status(Ok(tasks(json!([{"ident": "t1", "status": "SUCCESS"}]))));
        let (dispatcher, checker) = setup(&api);
        let errors: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&errors);
        let _sub = dispatcher.register(move |payload, _| {
            if let Action::MessageShow {
                level: MessageLevel::Error,
                text,
            } = &payload.action
            {
                sink.lock().unwrap().push(text.clone());
            }
            Ok(())
        });
        let handle = spawn_task_poller(
            checker.clone(),
            api.clone(),
            dispatcher.clone(),
            config(&[1, 1, 1]),
        );

        add(&dispatcher, "t1");
        advance(3).await;

        assert_eq!(api.status_calls(), 2);
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(errors.lock().unwrap()[0].contains("connection reset"));
        assert_eq!(first_status(&checker), AsyncTaskStatus::Success);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_keeps_polling() {
        let api = Arc::new(FakeTaskApi::default());
        api.push_status(Ok(tasks(json!([{"ident": "t1", "status": "STARTED"}]))));
        let (dispatcher, checker) = setup(&api);
        let handle = spawn_task_poller(checker, api.clone(), dispatcher.clone(), config(&[1, 1]));
        drop(handle);

        add(&dispatcher, "t1");
        advance(5).await;
        assert_eq!(api.status_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_twice_is_safe() {
        let api = Arc::new(FakeTaskApi::default());
        let (dispatcher, checker) = setup(&api);
        let handle = spawn_task_poller(checker, api, dispatcher, WatcherConfig::default());
        handle.shutdown().await;
        handle.shutdown().await;
    }

    struct ScriptedPush {
        frames: Vec<&'static str>,
        fail_connects: AtomicU32,
        connects: AtomicU32,
    }

    impl TaskPushSource for ScriptedPush {
        fn connect(&self) -> ApiFuture<'_, FrameStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let result = if self.fail_connects.load(Ordering::SeqCst) > 0 {
                self.fail_connects.fetch_sub(1, Ordering::SeqCst);
                Err(ClientError::Push("connection refused".into()))
            } else {
                let frames: Vec<Result<String, ClientError>> =
                    self.frames.iter().map(|f| Ok((*f).to_owned())).collect();
                Ok(Box::pin(tokio_stream::iter(frames)) as FrameStream)
            };
            Box::pin(async move { result })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn push_frames_update_checker() {
        let api = Arc::new(FakeTaskApi::default());
        let (dispatcher, checker) = setup(&api);
        add(&dispatcher, "t1");
        add(&dispatcher, "t2");
        let push = Arc::new(ScriptedPush {
            frames: vec![
                r#"{"ident":"t1","status":"STARTED"}"#,
                "garbage",
                r#"[{"ident":"t2","status":"SUCCESS"}]"#,
            ],
            fail_connects: AtomicU32::new(0),
            connects: AtomicU32::new(0),
        });
        let handle = spawn_task_watcher(
            checker.clone(),
            api.clone(),
            Some(push.clone()),
            dispatcher,
            config(&[1]),
        );

        advance(1).await;
        let status = |ident: &str| checker.read(|m| m.task(ident).map(|t| t.status));
        assert_eq!(status("t1"), Some(AsyncTaskStatus::Started));
        assert_eq!(status("t2"), Some(AsyncTaskStatus::Success));
        assert_eq!(api.status_calls(), 0, "push does not poll");
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn push_falls_back_to_polling_after_repeated_failures() {
        let api = Arc::new(FakeTaskApi::default());
        api.push_status(Ok(tasks(json!([{"ident": "t1", "status": "SUCCESS"}]))));
        let (dispatcher, checker) = setup(&api);
        let push = Arc::new(ScriptedPush {
            frames: Vec::new(),
            fail_connects: AtomicU32::new(u32::MAX),
            connects: AtomicU32::new(0),
        });
        let handle = spawn_task_watcher(
            checker.clone(),
            api.clone(),
            Some(push.clone()),
            dispatcher.clone(),
            config(&[1]),
        );

        add(&dispatcher, "t1");
        advance(10).await;

        assert_eq!(push.connects.load(Ordering::SeqCst), 3);
        assert_eq!(api.status_calls(), 1);
        assert_eq!(first_status(&checker), AsyncTaskStatus::Success);
        handle.shutdown().await;
    }
}
