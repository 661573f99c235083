//! The async task inbox: tracks the user's background server jobs.
//!
//! [`AsyncTaskChecker`] is a stateful model. It only reacts to actions; the
//! periodic status checks that feed it live in [`crate::poller`].

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use crate::action::{Action, ActionPayload};
use crate::client::TaskApi;
use crate::dispatcher::ActionDispatcher;
use crate::model::{Epoch, StatefulModel};
use crate::task::{AsyncTaskInfo, AsyncTaskStatus, reconcile};

/// Callback receiving the tasks that just reached a terminal state.
///
/// Runs while the checker is locked for writing, so it must not read the
/// checker through its handle.
pub type OnTaskUpdate = dyn Fn(&[AsyncTaskInfo]) + Send + Sync;

/// Stateful model of the background task inbox.
pub struct AsyncTaskChecker {
    tasks: Vec<AsyncTaskInfo>,
    overview_visible: bool,
    /// Bumped whenever a task is registered; watchers restart their
    /// schedule when it changes.
    generation: u64,
    /// Bumped when a task is registered and when finished tasks are
    /// removed. Status responses issued under an older epoch are dropped.
    epoch: Epoch,
    remove_finished_on_submit: bool,
    on_update: Vec<Arc<OnTaskUpdate>>,
    api: Arc<dyn TaskApi>,
}

impl fmt::Debug for AsyncTaskChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTaskChecker")
            .field("tasks", &self.tasks.len())
            .field("overview_visible", &self.overview_visible)
            .field("generation", &self.generation)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl AsyncTaskChecker {
    /// Create an empty inbox.
    ///
    /// # Arguments
    ///
    /// * `api` - Server access used to remove finished tasks.
    /// * `remove_finished_on_submit` - Forget finished tasks on the server
    ///   when the user closes the overview.
    pub fn new(api: Arc<dyn TaskApi>, remove_finished_on_submit: bool) -> Self {
        Self {
            tasks: Vec::new(),
            overview_visible: false,
            generation: 0,
            epoch: Epoch::default(),
            remove_finished_on_submit,
            on_update: Vec::new(),
            api,
        }
    }

    /// Seed the inbox with tasks embedded in the page bootstrap data.
    ///
    /// Duplicate idents keep their first occurrence.
    pub fn with_tasks(mut self, tasks: Vec<AsyncTaskInfo>) -> Self {
        for task in tasks {
            if !self.contains(&task.ident) {
                self.tasks.push(task);
            }
        }
        if self.has_active_tasks() {
            self.generation += 1;
        }
        self
    }

    /// Register a callback for newly finished tasks.
    ///
    /// Callbacks run in registration order.
    pub fn add_on_update(
        &mut self,
        callback: impl Fn(&[AsyncTaskInfo]) + Send + Sync + 'static,
    ) {
        self.on_update.push(Arc::new(callback));
    }

    pub fn tasks(&self) -> &[AsyncTaskInfo] {
        &self.tasks
    }

    pub fn task(&self, ident: &str) -> Option<&AsyncTaskInfo> {
        self.tasks.iter().find(|t| t.ident == ident)
    }

    fn contains(&self, ident: &str) -> bool {
        self.task(ident).is_some()
    }

    pub fn overview_visible(&self) -> bool {
        self.overview_visible
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.value()
    }

    pub fn has_active_tasks(&self) -> bool {
        self.tasks.iter().any(|t| t.status.is_active())
    }

    /// Number of tasks still pending or running.
    pub fn num_running(&self) -> usize {
        self.tasks.iter().filter(|t| t.status.is_active()).count()
    }

    pub fn num_finished(&self) -> usize {
        self.tasks.len() - self.num_running()
    }

    fn finished_idents(&self) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status.is_terminal())
            .map(|t| t.ident.clone())
            .collect()
    }

    fn add_task(&mut self, task: AsyncTaskInfo) -> bool {
        if self.contains(&task.ident) {
            tracing::debug!(ident = %task.ident, "task already tracked, ignoring");
            return false;
        }
        tracing::info!(ident = %task.ident, category = %task.category, "tracking new task");
        self.tasks.push(task);
        self.generation += 1;
        // A status request already in flight does not know this task.
        self.epoch = self.epoch.next();
        true
    }

    fn apply_status(&mut self, data: &[AsyncTaskInfo]) -> bool {
        let result = reconcile(&self.tasks, data);
        let mut changed = result.changed;
        self.tasks = result.tasks;

        if !result.newly_finished.is_empty() {
            for task in &result.newly_finished {
                if task.status == AsyncTaskStatus::Failure {
                    tracing::warn!(ident = %task.ident, error = ?task.error, "task failed");
                } else {
                    tracing::info!(ident = %task.ident, "task finished");
                }
            }
            changed |= !self.overview_visible;
            self.overview_visible = true;
            for callback in &self.on_update {
                callback(&result.newly_finished);
            }
        }
        changed
    }

    /// Apply the server's task list left after finished tasks were removed.
    ///
    /// Local terminal tasks missing from `remaining` are dropped. Active
    /// local tasks are kept as they are, so a task registered while the
    /// removal was in flight survives; the next status check settles it.
    /// Tasks only the server knows about are appended.
    fn apply_removal(&mut self, remaining: &[AsyncTaskInfo]) -> bool {
        let on_server: HashSet<&str> = remaining.iter().map(|t| t.ident.as_str()).collect();
        let mut tasks: Vec<AsyncTaskInfo> = self
            .tasks
            .iter()
            .filter(|t| t.status.is_active() || on_server.contains(&*t.ident))
            .cloned()
            .collect();
        for task in remaining {
            if !tasks.iter().any(|t| t.ident == task.ident) {
                tasks.push(task.clone());
            }
        }
        let changed = tasks != self.tasks;
        self.tasks = tasks;
        self.epoch = self.epoch.next();
        changed
    }

    fn close_overview(&mut self, dispatcher: &ActionDispatcher) -> bool {
        let was_visible = self.overview_visible;
        self.overview_visible = false;

        let finished = self.finished_idents();
        if !self.remove_finished_on_submit || finished.is_empty() {
            return was_visible;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::error!("no async runtime, cannot remove finished tasks");
            dispatcher.dispatch_side_effect(Action::error_message(
                "failed to remove finished tasks",
            ));
            return was_visible;
        }

        let api = Arc::clone(&self.api);
        let epoch = self.epoch.value();
        tracing::debug!(count = finished.len(), "removing finished tasks");
        dispatcher.dispatch_future(async move {
            match api.remove_task_info(finished).await {
                Ok(data) => {
                    ActionPayload::side_effect(Action::InboxRemoveFinishedDone { epoch, data })
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to remove finished tasks");
                    ActionPayload::side_effect(Action::error_message(e.to_string()))
                }
            }
        });
        was_visible
    }
}

impl StatefulModel for AsyncTaskChecker {
    const NAME: &'static str = "async-task-checker";

    fn on_action(&mut self, action: &ActionPayload, dispatcher: &ActionDispatcher) -> bool {
        match &action.action {
            Action::InboxAddAsyncTask {
                ident,
                label,
                category,
                args,
                url,
            } => self.add_task(AsyncTaskInfo {
                args: args.clone(),
                url: url.clone(),
                ..AsyncTaskInfo::pending(ident, label, category)
            }),
            Action::InboxCheckTaskStatusDone { epoch, data } => {
                if action.error.is_some() {
                    return false;
                }
                if !self.epoch.is_current(*epoch) {
                    tracing::debug!(
                        epoch,
                        current = self.epoch.value(),
                        "stale task status, discarding"
                    );
                    return false;
                }
                self.apply_status(data)
            }
            Action::InboxToggleOverviewVisibility {} => {
                self.overview_visible = !self.overview_visible;
                true
            }
            Action::InboxCloseTaskOverview {} => self.close_overview(dispatcher),
            Action::InboxRemoveFinishedDone { epoch, data } => {
                if action.error.is_some() {
                    return false;
                }
                tracing::debug!(
                    issued = epoch,
                    current = self.epoch.value(),
                    remaining = data.len(),
                    "finished tasks removed"
                );
                self.apply_removal(data)
            }
            _ => false,
        }
    }
}
