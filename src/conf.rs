//! Page configuration with explicit change notification.
//!
//! The server renders every page with a JSON configuration blob. It is
//! decoded once into an immutable [`PageConf`]; later changes (e.g. the
//! user switching UI language) go through [`ConfHandle::update`], which
//! publishes a new snapshot to every subscriber.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ConfError;
use crate::plugins::PluginKind;

/// Default polling schedule for background task status, in seconds.
pub const DEFAULT_CHECK_INTERVALS_SECS: [u64; 14] =
    [1, 2, 2, 5, 5, 10, 10, 30, 30, 60, 60, 120, 300, 600];

/// Identity of the primary corpus the page works with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorpusIdent {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Aligned (parallel) corpora, in display order.
    #[serde(default)]
    pub aligned: Vec<String>,
}

impl CorpusIdent {
    /// Primary corpus followed by aligned ones.
    pub fn all_corpora(&self) -> Vec<String> {
        std::iter::once(self.id.clone())
            .chain(self.aligned.iter().cloned())
            .collect()
    }
}

/// Background task tracking settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskConf {
    /// Back-off table: the poller waits each interval in turn, then stops.
    pub check_intervals_secs: Vec<u64>,
    /// Ask the server to forget finished tasks when the overview closes.
    pub remove_finished_on_submit: bool,
}

impl Default for TaskConf {
    fn default() -> Self {
        Self {
            check_intervals_secs: DEFAULT_CHECK_INTERVALS_SECS.to_vec(),
            remove_finished_on_submit: false,
        }
    }
}

impl TaskConf {
    pub fn check_intervals(&self) -> Vec<Duration> {
        self.check_intervals_secs
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect()
    }
}

/// Immutable page configuration.
///
/// Only `rootUrl` is required; everything else has a default so that a
/// minimal page can bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageConf {
    #[serde(default = "default_ui_lang")]
    pub ui_lang: String,
    /// Base URL every action path is resolved against. Must end with `/`
    /// for relative paths to nest under it.
    pub root_url: String,
    #[serde(default)]
    pub corpus_ident: CorpusIdent,
    #[serde(default)]
    pub active_plugins: Vec<PluginKind>,
    #[serde(default)]
    pub help_links: HashMap<String, String>,
    /// WebSocket endpoint for task status push; polling is used without it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_status_push_url: Option<String>,
    #[serde(default)]
    pub tasks: TaskConf,
}

fn default_ui_lang() -> String {
    "en".to_owned()
}

impl PageConf {
    /// Minimal configuration rooted at `root_url`.
    pub fn new(root_url: impl Into<String>) -> Self {
        Self {
            ui_lang: default_ui_lang(),
            root_url: root_url.into(),
            corpus_ident: CorpusIdent::default(),
            active_plugins: Vec::new(),
            help_links: HashMap::new(),
            task_status_push_url: None,
            tasks: TaskConf::default(),
        }
    }

    /// Decode the page configuration blob.
    ///
    /// # Errors
    ///
    /// Returns [`ConfError::Parse`] if the JSON is malformed or lacks
    /// `rootUrl`.
    pub fn from_json(json: &str) -> Result<Self, ConfError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and decode a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfError::Io`] if the file cannot be read, or
    /// [`ConfError::Parse`] if its content is invalid.
    pub fn from_file(path: &Path) -> Result<Self, ConfError> {
        let content = std::fs::read_to_string(path)?;
        let conf = Self::from_json(&content)?;
        tracing::debug!(
            path = %path.display(),
            root_url = %conf.root_url,
            "page configuration loaded"
        );
        Ok(conf)
    }

    pub fn is_plugin_active(&self, kind: PluginKind) -> bool {
        self.active_plugins.contains(&kind)
    }

    pub fn help_link(&self, key: &str) -> Option<&str> {
        self.help_links.get(key).map(String::as_str)
    }
}

/// Shared access to the current [`PageConf`] snapshot.
///
/// `Clone` is cheap: clones observe the same configuration.
#[derive(Debug, Clone)]
pub struct ConfHandle {
    tx: Arc<watch::Sender<Arc<PageConf>>>,
}

impl ConfHandle {
    pub fn new(conf: PageConf) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(conf));
        Self { tx: Arc::new(tx) }
    }

    /// Current snapshot.
    pub fn get(&self) -> Arc<PageConf> {
        Arc::clone(&self.tx.borrow())
    }

    /// Replace the configuration with an edited copy and notify
    /// subscribers. Snapshots handed out earlier are unaffected.
    pub fn update(&self, f: impl FnOnce(&mut PageConf)) {
        let mut next = PageConf::clone(&self.get());
        f(&mut next);
        self.tx.send_replace(Arc::new(next));
        tracing::debug!("page configuration updated");
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<PageConf>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_JSON: &str = r#"{
        "uiLang": "cs",
        "rootUrl": "https://kontext.example.org/",
        "corpusIdent": {"id": "syn2020", "name": "SYN2020", "aligned": ["intercorp_en"]},
        "activePlugins": ["corparch", "live_attributes"],
        "helpLinks": {"wordlist": "https://wiki.example.org/wordlist"},
        "tasks": {"checkIntervalsSecs": [1, 3], "removeFinishedOnSubmit": true}
    }"#;

    #[test]
    fn decodes_full_page_configuration() {
        let conf = PageConf::from_json(PAGE_JSON).expect("valid conf");
        assert_eq!(conf.ui_lang, "cs");
        assert_eq!(
            conf.corpus_ident.all_corpora(),
            vec!["syn2020", "intercorp_en"]
        );
        assert!(conf.is_plugin_active(PluginKind::Corparch));
        assert!(!conf.is_plugin_active(PluginKind::Subcmixer));
        assert_eq!(
            conf.help_link("wordlist"),
            Some("https://wiki.example.org/wordlist")
        );
        assert_eq!(
            conf.tasks.check_intervals(),
            vec![Duration::from_secs(1), Duration::from_secs(3)]
        );
        assert!(conf.tasks.remove_finished_on_submit);
        assert_eq!(conf.task_status_push_url, None);
    }

    #[test]
    fn minimal_configuration_uses_defaults() {
        let conf = PageConf::from_json(r#"{"rootUrl": "http://localhost/"}"#).expect("valid conf");
        assert_eq!(conf, PageConf::new("http://localhost/"));
        assert_eq!(
            conf.tasks.check_intervals_secs,
            DEFAULT_CHECK_INTERVALS_SECS.to_vec()
        );
        assert!(!conf.tasks.remove_finished_on_submit);
    }

    #[test]
    fn missing_root_url_is_parse_error() {
        let err = PageConf::from_json(r#"{"uiLang": "en"}"#).unwrap_err();
        assert!(matches!(err, ConfError::Parse(_)));
    }

    #[test]
    fn from_file_reports_missing_file() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let err = PageConf::from_file(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConfError::Io(_)));
    }

    #[test]
    fn from_file_reads_configuration() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join("conf.json");
        std::fs::write(&path, PAGE_JSON).expect("write conf");
        let conf = PageConf::from_file(&path).expect("load conf");
        assert_eq!(conf.corpus_ident.id, "syn2020");
    }

    #[test]
    fn update_publishes_new_snapshot() {
        let handle = ConfHandle::new(PageConf::new("http://localhost/"));
        let before = handle.get();
        let mut rx = handle.subscribe();

        handle.update(|c| c.ui_lang = "de".into());

        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(rx.borrow_and_update().ui_lang, "de");
        assert_eq!(handle.get().ui_lang, "de");
        // Earlier snapshots are immutable.
        assert_eq!(before.ui_lang, "en");
    }
}
