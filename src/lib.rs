//! Unidirectional state management for a corpus search client.
//!
//! Every state change starts as an [`Action`] dispatched through an
//! [`ActionDispatcher`]. Models listen to the dispatcher and either derive
//! a new immutable state ([`StatelessModel`]) or mutate themselves in
//! place ([`StatefulModel`]). Side effects run on the tokio runtime and
//! report back by dispatching further actions.
//!
//! [`PageBuilder`] wires the bundled models together: user messages, the
//! CQL editor, the word-list form and the background task checker with its
//! poller.

mod action;
mod client;
mod conf;
mod cql_editor;
mod dispatcher;
mod error;
pub mod highlight;
mod messages;
mod model;
mod page;
mod plugins;
mod poller;
mod storage;
mod task;
mod task_checker;
mod wordlist_form;

pub use action::{Action, ActionFailure, ActionPayload};
pub use client::{
    ApiFuture, Args, CHECK_TASKS_STATUS_PATH, REMOVE_TASK_INFO_PATH, ServerClient, TaskApi,
    WORDLIST_SUBMIT_PATH, WordlistApi, WordlistArgs, WordlistSubmitResponse,
};
pub use conf::{ConfHandle, CorpusIdent, DEFAULT_CHECK_INTERVALS_SECS, PageConf, TaskConf};
pub use cql_editor::{CqlEditorModel, CqlEditorState, splice_chars};
pub use dispatcher::{ActionDispatcher, Listener, Subscription};
pub use error::{ClientError, ConfError, DecodeError, ListenerError};
pub use messages::{DEFAULT_MAX_MESSAGES, MessageLevel, MessageModel, MessageState, UserMessage};
pub use model::{
    Epoch, StatefulModel, StatefulModelHandle, StatelessModel, StatelessModelHandle,
    register_stateful, register_stateless,
};
pub use page::{Page, PageBuilder};
pub use plugins::{EmptyPlugin, PagePlugin, PluginKind, PluginSet};
pub use poller::{
    FrameStream, TaskPushSource, WatcherConfig, WatcherHandle, parse_push_frame, spawn_task_poller,
    spawn_task_watcher,
};
pub use storage::{
    LINE_SELECTION_KEY, LineSelectionStore, LocalStorage, SelectedLine, USER_PREFS_KEY, UserPrefs,
};
pub use task::{AsyncTaskInfo, AsyncTaskStatus, Reconciliation, TASK_LOST_ERROR, reconcile};
pub use task_checker::{AsyncTaskChecker, OnTaskUpdate};
pub use wordlist_form::{
    FormValue, WORDLIST_TASK_CATEGORY, WordlistFormModel, WordlistFormState, parse_min_freq,
};
