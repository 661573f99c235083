//! Page composition: wires configuration, server access, models, plug-ins
//! and task watchers around one dispatcher.

use std::fmt;
use std::sync::Arc;

use crate::action::{Action, ActionPayload};
use crate::client::{ServerClient, TaskApi, WordlistApi};
use crate::conf::{ConfHandle, PageConf};
use crate::cql_editor::{CqlEditorModel, CqlEditorState};
use crate::dispatcher::{ActionDispatcher, Subscription};
use crate::error::ClientError;
use crate::messages::{DEFAULT_MAX_MESSAGES, MessageModel, MessageState};
use crate::model::{
    StatefulModelHandle, StatelessModelHandle, register_stateful, register_stateless,
};
use crate::plugins::{PagePlugin, PluginSet};
use crate::poller::{TaskPushSource, WatcherConfig, WatcherHandle, spawn_task_watcher};
use crate::storage::{LocalStorage, UserPrefs};
use crate::task::AsyncTaskInfo;
use crate::task_checker::AsyncTaskChecker;
use crate::wordlist_form::{WordlistFormModel, WordlistFormState};

type TaskCallback = Box<dyn Fn(&[AsyncTaskInfo]) + Send + Sync>;

/// Builder for a [`Page`].
///
/// Only the page configuration is required. Server APIs default to a
/// [`ServerClient`] rooted at the configured `rootUrl`.
///
/// # Examples
///
/// ```
/// use kontext_flux::{PageBuilder, PageConf};
///
/// let page = PageBuilder::new(PageConf::new("http://localhost/"))
///     .max_messages(5)
///     .build()
///     .expect("valid root URL");
/// assert!(page.messages().state().messages.is_empty());
/// ```
pub struct PageBuilder {
    conf: PageConf,
    task_api: Option<Arc<dyn TaskApi>>,
    wordlist_api: Option<Arc<dyn WordlistApi>>,
    push_source: Option<Arc<dyn TaskPushSource>>,
    plugins: Vec<Arc<dyn PagePlugin>>,
    storage: Option<Arc<LocalStorage>>,
    initial_tasks: Vec<AsyncTaskInfo>,
    task_callbacks: Vec<TaskCallback>,
    watcher_config: Option<WatcherConfig>,
    max_messages: usize,
}

impl PageBuilder {
    pub fn new(conf: PageConf) -> Self {
        Self {
            conf,
            task_api: None,
            wordlist_api: None,
            push_source: None,
            plugins: Vec::new(),
            storage: None,
            initial_tasks: Vec::new(),
            task_callbacks: Vec::new(),
            watcher_config: None,
            max_messages: DEFAULT_MAX_MESSAGES,
        }
    }

    /// Use `api` for task status checks and removal.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn task_api(mut self, api: Arc<dyn TaskApi>) -> Self {
        self.task_api = Some(api);
        self
    }

    pub fn wordlist_api(mut self, api: Arc<dyn WordlistApi>) -> Self {
        self.wordlist_api = Some(api);
        self
    }

    /// Transport for pushed task status. Used only when the configuration
    /// carries a `taskStatusPushUrl`.
    pub fn push_source(mut self, source: Arc<dyn TaskPushSource>) -> Self {
        self.push_source = Some(source);
        self
    }

    /// Offer a plug-in implementation. It is used only if its kind is
    /// listed in the configuration's `activePlugins`.
    pub fn plugin(mut self, plugin: Arc<dyn PagePlugin>) -> Self {
        self.plugins.push(plugin);
        self
    }

    pub fn storage(mut self, storage: Arc<LocalStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Tasks embedded in the page bootstrap data.
    pub fn initial_tasks(mut self, tasks: Vec<AsyncTaskInfo>) -> Self {
        self.initial_tasks = tasks;
        self
    }

    /// Call `callback` with every batch of newly finished tasks.
    pub fn on_task_update(
        mut self,
        callback: impl Fn(&[AsyncTaskInfo]) + Send + Sync + 'static,
    ) -> Self {
        self.task_callbacks.push(Box::new(callback));
        self
    }

    /// Override the watcher tuning derived from the configuration.
    pub fn watcher_config(mut self, config: WatcherConfig) -> Self {
        self.watcher_config = Some(config);
        self
    }

    pub fn max_messages(mut self, max: usize) -> Self {
        self.max_messages = max;
        self
    }

    /// Create the dispatcher and register every model and plug-in.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Url`] if a default [`ServerClient`] is needed
    /// and the configured `rootUrl` is invalid.
    pub fn build(self) -> Result<Page, ClientError> {
        let (task_api, wordlist_api) = match (self.task_api, self.wordlist_api) {
            (Some(tasks), Some(wordlist)) => (tasks, wordlist),
            (tasks, wordlist) => {
                let client = Arc::new(ServerClient::from_conf(&self.conf)?);
                (
                    tasks.unwrap_or_else(|| client.clone() as Arc<dyn TaskApi>),
                    wordlist.unwrap_or_else(|| client as Arc<dyn WordlistApi>),
                )
            }
        };

        let remove_finished_on_submit = self
            .storage
            .as_deref()
            .and_then(|s| UserPrefs::load(s).remove_finished_on_submit)
            .unwrap_or(self.conf.tasks.remove_finished_on_submit);

        let watcher_config = self
            .watcher_config
            .unwrap_or_else(|| WatcherConfig::from_task_conf(&self.conf.tasks));
        let push_source = match (&self.conf.task_status_push_url, self.push_source) {
            (Some(_), Some(source)) => Some(source),
            (None, Some(_)) => {
                tracing::debug!("push source supplied but no taskStatusPushUrl configured");
                None
            }
            _ => None,
        };

        let dispatcher = ActionDispatcher::new();

        let messages = register_stateless(
            MessageModel::new(self.max_messages),
            MessageState::default(),
            &dispatcher,
        );
        let cql_editor = register_stateless(
            CqlEditorModel,
            CqlEditorState::new(self.conf.corpus_ident.all_corpora()),
            &dispatcher,
        );
        let wordlist_form = register_stateless(
            WordlistFormModel::new(wordlist_api),
            WordlistFormState::new(self.conf.corpus_ident.id.clone()),
            &dispatcher,
        );

        let mut checker = AsyncTaskChecker::new(Arc::clone(&task_api), remove_finished_on_submit)
            .with_tasks(self.initial_tasks);
        for callback in self.task_callbacks {
            checker.add_on_update(callback);
        }
        let task_checker = register_stateful(checker, &dispatcher);

        let plugins = PluginSet::from_conf(&self.conf, self.plugins);
        let conf = ConfHandle::new(self.conf);

        let mut subscriptions = vec![track_corpus_switch(&dispatcher, conf.clone())];
        subscriptions.extend(plugins.register_all(&dispatcher));

        tracing::info!(
            corpus = %conf.get().corpus_ident.id,
            plugins = ?plugins,
            push = push_source.is_some(),
            "page composed"
        );

        Ok(Page {
            conf,
            dispatcher,
            plugins,
            messages,
            cql_editor,
            wordlist_form,
            task_checker,
            task_api,
            push_source,
            watcher_config,
            storage: self.storage,
            subscriptions,
            watcher: None,
        })
    }
}

/// Mirror corpus switches into the page configuration.
fn track_corpus_switch(dispatcher: &ActionDispatcher, conf: ConfHandle) -> Subscription {
    dispatcher.register(move |payload: &ActionPayload, _| {
        if let Action::CorpusSwitch { corpora } = &payload.action {
            let Some((primary, aligned)) = corpora.split_first() else {
                return Ok(());
            };
            conf.update(|c| {
                c.corpus_ident.id = primary.clone();
                c.corpus_ident.aligned = aligned.to_vec();
            });
        }
        Ok(())
    })
}

/// A composed page: one dispatcher with all of its models.
pub struct Page {
    conf: ConfHandle,
    dispatcher: ActionDispatcher,
    plugins: PluginSet,
    messages: StatelessModelHandle<MessageModel>,
    cql_editor: StatelessModelHandle<CqlEditorModel>,
    wordlist_form: StatelessModelHandle<WordlistFormModel>,
    task_checker: StatefulModelHandle<AsyncTaskChecker>,
    task_api: Arc<dyn TaskApi>,
    push_source: Option<Arc<dyn TaskPushSource>>,
    watcher_config: WatcherConfig,
    storage: Option<Arc<LocalStorage>>,
    subscriptions: Vec<Subscription>,
    watcher: Option<WatcherHandle>,
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("dispatcher", &self.dispatcher)
            .field("plugins", &self.plugins)
            .field("watching", &self.watcher.is_some())
            .finish()
    }
}

impl Page {
    pub fn conf(&self) -> &ConfHandle {
        &self.conf
    }

    pub fn dispatcher(&self) -> &ActionDispatcher {
        &self.dispatcher
    }

    /// Shorthand for `page.dispatcher().dispatch(..)`.
    pub fn dispatch(&self, payload: impl Into<ActionPayload>) {
        self.dispatcher.dispatch(payload);
    }

    pub fn plugins(&self) -> &PluginSet {
        &self.plugins
    }

    pub fn messages(&self) -> &StatelessModelHandle<MessageModel> {
        &self.messages
    }

    pub fn cql_editor(&self) -> &StatelessModelHandle<CqlEditorModel> {
        &self.cql_editor
    }

    pub fn wordlist_form(&self) -> &StatelessModelHandle<WordlistFormModel> {
        &self.wordlist_form
    }

    pub fn task_checker(&self) -> &StatefulModelHandle<AsyncTaskChecker> {
        &self.task_checker
    }

    pub fn storage(&self) -> Option<&Arc<LocalStorage>> {
        self.storage.as_ref()
    }

    /// Start watching background task status.
    ///
    /// Idempotent: a running watcher is returned as is. Must be called
    /// within a tokio runtime.
    pub fn start_task_watcher(&mut self) -> WatcherHandle {
        if let Some(watcher) = &self.watcher {
            return watcher.clone();
        }
        let watcher = spawn_task_watcher(
            self.task_checker.clone(),
            Arc::clone(&self.task_api),
            self.push_source.clone(),
            self.dispatcher.clone(),
            self.watcher_config.clone(),
        );
        self.watcher = Some(watcher.clone());
        watcher
    }

    /// Stop the task watcher and unregister every model and plug-in.
    pub async fn shutdown(self) {
        if let Some(watcher) = &self.watcher {
            watcher.shutdown().await;
        }
        for subscription in self.subscriptions {
            subscription.dispose();
        }
        self.task_checker.dispose();
        self.wordlist_form.dispose();
        self.cql_editor.dispose();
        self.messages.dispose();
        tracing::info!("page shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::client::test_fixtures::FakeTaskApi;
    use crate::plugins::PluginKind;
    use crate::plugins::test_fixtures::CountingPlugin;
    use crate::task::AsyncTaskStatus;

    fn conf() -> PageConf {
        PageConf::from_json(
            r#"{
                "rootUrl": "http://localhost/",
                "corpusIdent": {"id": "syn2020", "aligned": ["intercorp_en"]},
                "activePlugins": ["corparch"]
            }"#,
        )
        .expect("valid conf")
    }

    #[test]
    fn build_registers_models_per_corpus() {
        let page = PageBuilder::new(conf()).build().expect("page");
        let editor = page.cql_editor().state();
        assert_eq!(editor.corpora, vec!["syn2020", "intercorp_en"]);
        assert_eq!(page.wordlist_form().state().corpus_id, "syn2020");
        // messages, editor, form, checker, corpus tracker
        assert_eq!(page.dispatcher().listener_count(), 5);
    }

    #[test]
    fn invalid_root_url_fails_build() {
        let err = PageBuilder::new(PageConf::new("not a url"))
            .build()
            .unwrap_err();
        assert!(matches!(err, ClientError::Url(_)));
    }

    #[test]
    fn supplied_apis_skip_url_validation() {
        let api = Arc::new(FakeTaskApi::default());
        struct NoWordlist;
        impl WordlistApi for NoWordlist {
            fn submit_wordlist(
                &self,
                _args: crate::client::WordlistArgs,
            ) -> crate::client::ApiFuture<'_, crate::client::WordlistSubmitResponse> {
                let result: Result<crate::client::WordlistSubmitResponse, ClientError> =
                    Err(ClientError::Server("disabled".into()));
                Box::pin(async move { result })
            }
        }
        let page = PageBuilder::new(PageConf::new("not a url"))
            .task_api(api)
            .wordlist_api(Arc::new(NoWordlist))
            .build();
        assert!(page.is_ok());
    }

    #[test]
    fn corpus_switch_updates_conf_and_models() {
        let page = PageBuilder::new(conf()).build().expect("page");
        let mut conf_rx = page.conf().subscribe();

        page.dispatch(Action::CorpusSwitch {
            corpora: vec!["bnc".into()],
        });

        assert!(conf_rx.has_changed().expect("conf alive"));
        assert_eq!(page.conf().get().corpus_ident.id, "bnc");
        assert!(page.conf().get().corpus_ident.aligned.is_empty());
        assert_eq!(page.cql_editor().state().corpora, vec!["bnc"]);
        assert_eq!(page.wordlist_form().state().corpus_id, "bnc");
    }

    #[test]
    fn stored_preference_overrides_configuration() {
        let tmp = tempfile::tempdir().expect("failed to create tempdir");
        let path = tmp.path().join("store.json");
        let storage = Arc::new(LocalStorage::open(path).expect("open"));
        UserPrefs {
            remove_finished_on_submit: Some(true),
            ..UserPrefs::default()
        }
        .save(&storage)
        .expect("save prefs");

        let api = Arc::new(FakeTaskApi::default());
        let page = PageBuilder::new(conf())
            .task_api(api.clone())
            .storage(storage)
            .initial_tasks(
                serde_json::from_value(json!([{"ident": "t1", "status": "SUCCESS"}])).unwrap(),
            )
            .build()
            .expect("page");

        // Without a runtime the removal cannot start; the failure is
        // surfaced as a message instead of a silent no-op.
        page.dispatch(Action::InboxCloseTaskOverview {});
        assert!(page.messages().state().has_errors());
    }

    #[test]
    fn task_callbacks_and_plugins_are_wired() {
        let finished: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&finished);
        let corparch = Arc::new(CountingPlugin::new(PluginKind::Corparch));
        let page = PageBuilder::new(conf())
            .task_api(Arc::new(FakeTaskApi::default()))
            .plugin(corparch.clone())
            .on_task_update(move |tasks| {
                sink.lock()
                    .unwrap()
                    .extend(tasks.iter().map(|t| t.ident.clone()));
            })
            .build()
            .expect("page");

        page.dispatch(Action::InboxAddAsyncTask {
            ident: "t1".into(),
            label: "l".into(),
            category: "wordlist".into(),
            args: serde_json::Map::new(),
            url: None,
        });
        let epoch = page.task_checker().read(|m| m.epoch());
        page.dispatch(ActionPayload::side_effect(Action::InboxCheckTaskStatusDone {
            epoch,
            data: serde_json::from_value(json!([{"ident": "t1", "status": "FAILURE"}])).unwrap(),
        }));

        assert_eq!(*finished.lock().unwrap(), vec!["t1"]);
        assert_eq!(
            page.task_checker().read(|m| m.tasks()[0].status),
            AsyncTaskStatus::Failure
        );
        assert!(page.plugins().is_active(PluginKind::Corparch));
        assert_eq!(corparch.seen.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_disposes_everything() {
        let mut page = PageBuilder::new(conf())
            .task_api(Arc::new(FakeTaskApi::default()))
            .build()
            .expect("page");
        let dispatcher = page.dispatcher().clone();
        let first = page.start_task_watcher();
        let second = page.start_task_watcher();
        drop((first, second));

        page.shutdown().await;
        assert_eq!(dispatcher.listener_count(), 0);
    }
}
