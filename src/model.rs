//! State containers reacting to dispatched actions.
//!
//! Two flavours exist:
//!
//! - [`StatelessModel`]: state lives in one immutable value behind an
//!   [`Arc`]; [`reduce`](StatelessModel::reduce) is a pure copy-on-write step
//!   and [`side_effects`](StatelessModel::side_effects) may raise follow-up
//!   actions after the new state is published.
//! - [`StatefulModel`]: the model owns mutable fields and reports whether an
//!   action changed them; each change pushes a tick on the model's change
//!   stream.
//!
//! Models never touch another model's state. They talk to each other only
//! by dispatching actions.

use std::fmt;
use std::sync::{Arc, RwLock};

use tokio::sync::watch;

use crate::action::ActionPayload;
use crate::dispatcher::{ActionDispatcher, Subscription};

/// A feature model whose state is an immutable value.
///
/// # Contract
///
/// - [`reduce`](StatelessModel::reduce) must be total: for an action the
///   model does not handle it returns `Arc::clone(state)`, the very same
///   allocation, and never mutates `state`.
/// - [`side_effects`](StatelessModel::side_effects) sees the state that
///   `reduce` just produced. Network work started here must end by
///   dispatching a terminal (success or failure) action.
pub trait StatelessModel: Send + Sync + 'static {
    /// Model name used in logs.
    const NAME: &'static str;

    type State: Clone + Send + Sync + 'static;

    /// Compute the next state.
    fn reduce(&self, state: &Arc<Self::State>, action: &ActionPayload) -> Arc<Self::State>;

    /// React to the just-reduced state by dispatching follow-up actions.
    fn side_effects(
        &self,
        _state: &Self::State,
        _action: &ActionPayload,
        _dispatcher: &ActionDispatcher,
    ) {
    }
}

/// Runtime handle for a registered [`StatelessModel`].
///
/// Views read snapshots through [`state`](Self::state) or await changes on
/// the receiver from [`subscribe`](Self::subscribe). Only states that differ
/// (by pointer) from the previous one are published.
pub struct StatelessModelHandle<M: StatelessModel> {
    state: Arc<watch::Sender<Arc<M::State>>>,
    subscription: Subscription,
}

impl<M: StatelessModel> fmt::Debug for StatelessModelHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatelessModelHandle")
            .field("model", &M::NAME)
            .field("subscription", &self.subscription)
            .finish()
    }
}

impl<M: StatelessModel> StatelessModelHandle<M> {
    /// Current state snapshot.
    pub fn state(&self) -> Arc<M::State> {
        Arc::clone(&self.state.borrow())
    }

    /// Change-notification stream of state snapshots.
    pub fn subscribe(&self) -> watch::Receiver<Arc<M::State>> {
        self.state.subscribe()
    }

    /// Unregister the model from the dispatcher.
    pub fn dispose(self) {
        self.subscription.dispose();
    }
}

/// Register a stateless model with `dispatcher`, starting from `initial`.
///
/// # Returns
///
/// The handle through which the model's state is observed.
pub fn register_stateless<M: StatelessModel>(
    model: M,
    initial: M::State,
    dispatcher: &ActionDispatcher,
) -> StatelessModelHandle<M> {
    let (tx, _rx) = watch::channel(Arc::new(initial));
    let state = Arc::new(tx);
    let sender = Arc::clone(&state);

    let subscription = dispatcher.register(move |payload, dispatcher| {
        let current = Arc::clone(&sender.borrow());
        let next = model.reduce(&current, payload);
        if !Arc::ptr_eq(&current, &next) {
            tracing::trace!(
                model = M::NAME,
                action_type = payload.action_type(),
                "state changed"
            );
            sender.send_replace(Arc::clone(&next));
        }
        model.side_effects(&next, payload, dispatcher);
        Ok(())
    });

    StatelessModelHandle {
        state,
        subscription,
    }
}

/// A feature model that mutates its own fields.
pub trait StatefulModel: Send + Sync + 'static {
    /// Model name used in logs.
    const NAME: &'static str;

    /// Handle `action`, returning `true` when the model changed.
    ///
    /// Actions the model does not recognize must leave it untouched and
    /// return `false`. Follow-up actions go through `dispatcher`; they are
    /// queued until the current broadcast ends.
    fn on_action(&mut self, action: &ActionPayload, dispatcher: &ActionDispatcher) -> bool;
}

/// Runtime handle for a registered [`StatefulModel`].
///
/// `Clone` is cheap; clones share the model.
pub struct StatefulModelHandle<M: StatefulModel> {
    model: Arc<RwLock<M>>,
    changes: Arc<watch::Sender<u64>>,
    subscription: Arc<Subscription>,
}

impl<M: StatefulModel> Clone for StatefulModelHandle<M> {
    fn clone(&self) -> Self {
        Self {
            model: Arc::clone(&self.model),
            changes: Arc::clone(&self.changes),
            subscription: Arc::clone(&self.subscription),
        }
    }
}

impl<M: StatefulModel> fmt::Debug for StatefulModelHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatefulModelHandle")
            .field("model", &M::NAME)
            .field("changes", &*self.changes.borrow())
            .finish()
    }
}

impl<M: StatefulModel> StatefulModelHandle<M> {
    /// Read the model through `f`.
    ///
    /// Keep `f` short: it holds the model's read lock.
    pub fn read<R>(&self, f: impl FnOnce(&M) -> R) -> R {
        let guard = self.model.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    /// Change-notification stream; the value counts emitted changes.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Number of changes emitted so far.
    pub fn change_count(&self) -> u64 {
        *self.changes.borrow()
    }

    /// Unregister the model from the dispatcher.
    ///
    /// Takes effect for all clones of this handle.
    pub fn dispose(self) {
        self.subscription.unregister();
    }
}

/// Register a stateful model with `dispatcher`.
pub fn register_stateful<M: StatefulModel>(
    model: M,
    dispatcher: &ActionDispatcher,
) -> StatefulModelHandle<M> {
    let model = Arc::new(RwLock::new(model));
    let (tx, _rx) = watch::channel(0u64);
    let changes = Arc::new(tx);

    let shared = Arc::clone(&model);
    let ticks = Arc::clone(&changes);
    let subscription = dispatcher.register(move |payload, dispatcher| {
        let changed = {
            let mut guard = shared.write().unwrap_or_else(|e| e.into_inner());
            guard.on_action(payload, dispatcher)
        };
        if changed {
            ticks.send_modify(|n| *n += 1);
        }
        Ok(())
    });

    StatefulModelHandle {
        model,
        changes,
        subscription: Arc::new(subscription),
    }
}

/// Generation counter for discarding stale asynchronous completions.
///
/// A model bumps its epoch whenever earlier in-flight requests become
/// meaningless (corpus switch, list replaced). Requests carry the epoch
/// observed when they were issued; completions whose epoch is not
/// [`current`](Epoch::is_current) are dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Epoch(u64);

impl Epoch {
    pub fn value(self) -> u64 {
        self.0
    }

    /// The next generation.
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn is_current(self, observed: u64) -> bool {
        self.0 == observed
    }
}
