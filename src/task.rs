//! Background task records and the server reconciliation rule.
//!
//! Long-running server jobs (word-list builds, sub-corpus creation, ...)
//! are tracked on the client as [`AsyncTaskInfo`] records. Their status is
//! refreshed from server responses via [`reconcile`], which is a pure
//! function so the state machine can be tested without any I/O.

use std::collections::{HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error text attached to tasks the server no longer knows about.
pub const TASK_LOST_ERROR: &str = "task not found on server";

/// Lifecycle state of a background task.
///
/// `PENDING -> STARTED -> {SUCCESS | FAILURE}`, with `RETRY` as a transient
/// state a task may pass through before re-entering `STARTED`. `SUCCESS` and
/// `FAILURE` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AsyncTaskStatus {
    #[default]
    Pending,
    Started,
    Retry,
    Failure,
    Success,
}

impl AsyncTaskStatus {
    /// Returns `true` for `SUCCESS` and `FAILURE`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }

    /// Returns `true` while the server may still change the status.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Started | Self::Retry => 1,
            Self::Failure | Self::Success => 2,
        }
    }

    /// Whether a task in this state may move to `next`.
    ///
    /// Moves never go backwards (`STARTED -> PENDING` is refused), with
    /// `RETRY -> STARTED` as the one allowed step between running states.
    /// Terminal states accept nothing but themselves.
    pub fn can_move_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next.rank() > self.rank()
            || (self == Self::Started && next == Self::Retry)
            || (self == Self::Retry && next == Self::Started)
    }
}

/// A server-tracked background job.
///
/// Only `ident` is required on the wire; status updates pushed by the
/// server often carry just `ident` and `status`, so every other field
/// falls back to its default and is merged with the locally known record
/// (see [`AsyncTaskInfo::merged_with`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncTaskInfo {
    /// Server-assigned identifier, unique within the tracked set.
    pub ident: String,
    #[serde(default)]
    pub status: AsyncTaskStatus,
    /// Creation time in Unix seconds.
    #[serde(default)]
    pub created: f64,
    #[serde(default)]
    pub label: String,
    /// Job family, e.g. `"wordlist"` or `"subcorpus"`.
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Where the finished result can be viewed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl AsyncTaskInfo {
    /// Create a freshly registered `PENDING` task stamped with the current
    /// time.
    pub fn pending(
        ident: impl Into<String>,
        label: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        let created = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        Self {
            ident: ident.into(),
            status: AsyncTaskStatus::Pending,
            created,
            label: label.into(),
            category: category.into(),
            error: None,
            args: Map::new(),
            url: None,
        }
    }

    /// Apply a server update on top of this record.
    ///
    /// Status and error come from `update` unless it would move the task
    /// backwards (see [`AsyncTaskStatus::can_move_to`]), in which case the
    /// local ones are kept. Descriptive fields the update leaves empty keep
    /// their local values.
    pub fn merged_with(&self, update: &AsyncTaskInfo) -> AsyncTaskInfo {
        let (status, error) = if self.status.can_move_to(update.status) {
            (update.status, update.error.clone())
        } else {
            tracing::debug!(
                ident = %self.ident,
                from = ?self.status,
                to = ?update.status,
                "ignoring backward status move"
            );
            (self.status, self.error.clone())
        };
        AsyncTaskInfo {
            ident: self.ident.clone(),
            status,
            created: if update.created > 0.0 {
                update.created
            } else {
                self.created
            },
            label: pick(&update.label, &self.label),
            category: pick(&update.category, &self.category),
            error,
            args: if update.args.is_empty() {
                self.args.clone()
            } else {
                update.args.clone()
            },
            url: update.url.clone().or_else(|| self.url.clone()),
        }
    }
}

fn pick(preferred: &str, fallback: &str) -> String {
    if preferred.is_empty() {
        fallback.to_owned()
    } else {
        preferred.to_owned()
    }
}

/// Outcome of reconciling the tracked task list with a server response.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// The new tracked list: local order first, then newly seen tasks in
    /// response order.
    pub tasks: Vec<AsyncTaskInfo>,
    /// Tasks that moved from an active to a terminal status.
    pub newly_finished: Vec<AsyncTaskInfo>,
    /// Whether `tasks` differs from the input list.
    pub changed: bool,
}

/// Reconcile locally tracked tasks with the server's latest status list.
///
/// Rules:
/// - a local task in a terminal state never changes;
/// - a local active task missing from `response` becomes `FAILURE` with
///   [`TASK_LOST_ERROR`], so lost server jobs cannot hang in `PENDING`;
/// - a response task not tracked locally is appended.
///
/// # Arguments
///
/// * `local` - The currently tracked tasks.
/// * `response` - The server's status list (may be partial records).
///
/// # Returns
///
/// The reconciled list together with the tasks that just finished.
pub fn reconcile(local: &[AsyncTaskInfo], response: &[AsyncTaskInfo]) -> Reconciliation {
    let by_ident: HashMap<&str, &AsyncTaskInfo> =
        response.iter().map(|t| (t.ident.as_str(), t)).collect();

    let mut tasks = Vec::with_capacity(local.len().max(response.len()));
    let mut newly_finished = Vec::new();
    let mut changed = false;

    for task in local {
        if task.status.is_terminal() {
            tasks.push(task.clone());
            continue;
        }
        let next = match by_ident.get(task.ident.as_str()) {
            Some(update) => task.merged_with(update),
            None => {
                tracing::warn!(
                    ident = %task.ident,
                    "task missing from server response, marking failed"
                );
                AsyncTaskInfo {
                    status: AsyncTaskStatus::Failure,
                    error: Some(TASK_LOST_ERROR.to_owned()),
                    ..task.clone()
                }
            }
        };
        if next != *task {
            changed = true;
        }
        if next.status.is_terminal() {
            newly_finished.push(next.clone());
        }
        tasks.push(next);
    }

    let known: HashSet<&str> = local.iter().map(|t| t.ident.as_str()).collect();
    let mut added: HashSet<&str> = HashSet::new();
    for update in response {
        let ident = update.ident.as_str();
        if known.contains(ident) || !added.insert(ident) {
            continue;
        }
        tasks.push(update.clone());
        changed = true;
    }

    Reconciliation {
        tasks,
        newly_finished,
        changed,
    }
}
