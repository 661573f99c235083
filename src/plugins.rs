//! Optional page plug-ins and their composition.
//!
//! Every plug-in slot always holds an implementation: either one supplied
//! by the embedding application, or [`EmptyPlugin`] when the page
//! configuration does not activate the slot. Callers never branch on
//! "is the plug-in there".

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::conf::PageConf;
use crate::dispatcher::{ActionDispatcher, Subscription};

/// Plug-in slots a page can fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Auth,
    /// Corpus archive / corpus selection widget.
    Corparch,
    LiveAttributes,
    Subcmixer,
}

impl PluginKind {
    pub const ALL: [PluginKind; 4] = [
        PluginKind::Auth,
        PluginKind::Corparch,
        PluginKind::LiveAttributes,
        PluginKind::Subcmixer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Corparch => "corparch",
            Self::LiveAttributes => "live_attributes",
            Self::Subcmixer => "subcmixer",
        }
    }
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pluggable page component.
pub trait PagePlugin: Send + Sync {
    fn kind(&self) -> PluginKind;

    /// Whether the plug-in does anything on this page.
    fn is_active(&self) -> bool {
        true
    }

    /// Hook the plug-in's models into the dispatcher.
    ///
    /// # Returns
    ///
    /// The listener subscription, or `None` if the plug-in does not listen
    /// to actions.
    fn register(&self, dispatcher: &ActionDispatcher) -> Option<Subscription>;
}

/// Null object filling an inactive plug-in slot.
#[derive(Debug, Clone, Copy)]
pub struct EmptyPlugin {
    kind: PluginKind,
}

impl EmptyPlugin {
    pub fn new(kind: PluginKind) -> Self {
        Self { kind }
    }
}

impl PagePlugin for EmptyPlugin {
    fn kind(&self) -> PluginKind {
        self.kind
    }

    fn is_active(&self) -> bool {
        false
    }

    fn register(&self, _dispatcher: &ActionDispatcher) -> Option<Subscription> {
        None
    }
}

/// One implementation per [`PluginKind`], chosen at page composition.
#[derive(Clone)]
pub struct PluginSet {
    plugins: HashMap<PluginKind, Arc<dyn PagePlugin>>,
}

impl fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut active: Vec<&str> = self
            .plugins
            .iter()
            .filter(|(_, p)| p.is_active())
            .map(|(k, _)| k.as_str())
            .collect();
        active.sort_unstable();
        f.debug_struct("PluginSet")
            .field("active", &active)
            .finish()
    }
}

impl Default for PluginSet {
    fn default() -> Self {
        Self::compose(&[], Vec::new())
    }
}

impl PluginSet {
    /// Fill every slot.
    ///
    /// A supplied implementation is used only if its kind is listed in
    /// `active`; all other slots get an [`EmptyPlugin`]. When several
    /// implementations of the same kind are supplied, the last one wins.
    ///
    /// # Arguments
    ///
    /// * `active` - Plug-in kinds enabled by the page configuration.
    /// * `supplied` - Implementations provided by the embedding application.
    pub fn compose(active: &[PluginKind], supplied: Vec<Arc<dyn PagePlugin>>) -> Self {
        let mut plugins: HashMap<PluginKind, Arc<dyn PagePlugin>> = PluginKind::ALL
            .iter()
            .map(|&kind| {
                let plugin: Arc<dyn PagePlugin> = Arc::new(EmptyPlugin::new(kind));
                (kind, plugin)
            })
            .collect();

        for plugin in supplied {
            let kind = plugin.kind();
            if active.contains(&kind) {
                plugins.insert(kind, plugin);
            } else {
                tracing::debug!(plugin = %kind, "plug-in not enabled by page configuration");
            }
        }

        for kind in active {
            if !plugins.get(kind).is_some_and(|p| p.is_active()) {
                tracing::warn!(plugin = %kind, "plug-in enabled but no implementation supplied");
            }
        }

        Self { plugins }
    }

    /// [`compose`](Self::compose) driven by the page configuration.
    pub fn from_conf(conf: &PageConf, supplied: Vec<Arc<dyn PagePlugin>>) -> Self {
        Self::compose(&conf.active_plugins, supplied)
    }

    pub fn get(&self, kind: PluginKind) -> Arc<dyn PagePlugin> {
        match self.plugins.get(&kind) {
            Some(plugin) => Arc::clone(plugin),
            None => Arc::new(EmptyPlugin::new(kind)),
        }
    }

    pub fn is_active(&self, kind: PluginKind) -> bool {
        self.get(kind).is_active()
    }

    /// Register every plug-in with `dispatcher`, in [`PluginKind::ALL`]
    /// order.
    pub fn register_all(&self, dispatcher: &ActionDispatcher) -> Vec<Subscription> {
        PluginKind::ALL
            .iter()
            .filter_map(|kind| self.get(*kind).register(dispatcher))
            .collect()
    }
}
