//! The process-wide action broadcast hub.
//!
//! Every state change starts as an [`ActionPayload`] handed to
//! [`ActionDispatcher::dispatch`]. The dispatcher delivers each payload to
//! all registered listeners in registration order. A payload dispatched
//! by a listener during a broadcast is queued and delivered only after the
//! current payload has reached every listener, so no listener ever
//! observes a follow-up action before the action that caused it. Other
//! threads (background tasks reporting completions) wait for the running
//! broadcast to finish and then deliver their own payload.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};

use tokio_stream::{Stream, StreamExt};

use crate::action::{Action, ActionPayload};
use crate::error::ListenerError;

/// Callback invoked for every dispatched payload.
///
/// Receives the dispatcher so it can raise follow-up actions.
pub type Listener =
    dyn Fn(&ActionPayload, &ActionDispatcher) -> Result<(), ListenerError> + Send + Sync;

struct Inner {
    listeners: Vec<(u64, Arc<Listener>)>,
    queue: VecDeque<ActionPayload>,
    /// The thread currently draining `queue`.
    draining: Option<ThreadId>,
    next_id: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Signalled when a thread stops draining.
    drained: Condvar,
}

/// Releases the draining slot even if delivery unwinds.
struct DrainGuard<'a>(&'a ActionDispatcher);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().draining = None;
        self.0.shared.drained.notify_all();
    }
}

/// Broadcast hub decoupling action producers from state consumers.
///
/// `Clone` is cheap: clones share the same listener list and queue.
#[derive(Clone)]
pub struct ActionDispatcher {
    shared: Arc<Shared>,
}

impl fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ActionDispatcher")
            .field("listeners", &inner.listeners.len())
            .field("queued", &inner.queue.len())
            .field("dispatching", &inner.draining.is_some())
            .finish()
    }
}

impl Default for ActionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionDispatcher {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    listeners: Vec::new(),
                    queue: VecDeque::new(),
                    draining: None,
                    next_id: 0,
                }),
                drained: Condvar::new(),
            }),
        }
    }

    // A listener panicking while another thread holds the lock must not
    // take the whole page down, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribe `listener` to every subsequently dispatched payload.
    ///
    /// A listener registered during a broadcast starts receiving with the
    /// next queued payload.
    ///
    /// # Returns
    ///
    /// A [`Subscription`] that must be disposed explicitly; dropping it
    /// leaves the listener registered.
    pub fn register<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ActionPayload, &ActionDispatcher) -> Result<(), ListenerError>
            + Send
            + Sync
            + 'static,
    {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        tracing::debug!(listener_id = id, "listener registered");
        Subscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Number of currently registered listeners.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Deliver `payload` to all listeners.
    ///
    /// The payload (and everything listeners queue behind it) is delivered
    /// before this call returns. Called from inside a listener, the payload
    /// is queued and delivered after the current one. While another thread
    /// is broadcasting, the call blocks until that broadcast is done, so a
    /// listener must not wait on a thread that dispatches.
    pub fn dispatch(&self, payload: impl Into<ActionPayload>) {
        let payload = payload.into();
        let current = thread::current().id();
        {
            let mut inner = self.lock();
            if inner.draining == Some(current) {
                inner.queue.push_back(payload);
                return;
            }
            while inner.draining.is_some() {
                inner = self
                    .shared
                    .drained
                    .wait(inner)
                    .unwrap_or_else(|e| e.into_inner());
            }
            inner.draining = Some(current);
            inner.queue.push_back(payload);
        }
        let _guard = DrainGuard(self);

        loop {
            let (next, listeners) = {
                let mut inner = self.lock();
                match inner.queue.pop_front() {
                    Some(next) => {
                        let listeners: Vec<Arc<Listener>> =
                            inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
                        (next, listeners)
                    }
                    None => return,
                }
            };
            self.deliver(&next, &listeners);
        }
    }

    /// Dispatch `action` marked as a side effect.
    pub fn dispatch_side_effect(&self, action: Action) {
        self.dispatch(ActionPayload::side_effect(action));
    }

    /// Flatten an asynchronous stream of payloads into the dispatcher.
    ///
    /// Each yielded payload goes through [`dispatch`](Self::dispatch) in
    /// stream order. Must be called within a tokio runtime.
    pub fn dispatch_stream<S>(&self, stream: S) -> tokio::task::JoinHandle<()>
    where
        S: Stream<Item = ActionPayload> + Send + 'static,
    {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            tokio::pin!(stream);
            while let Some(payload) = stream.next().await {
                dispatcher.dispatch(payload);
            }
        })
    }

    /// Dispatch the payload produced by `future` once it resolves.
    ///
    /// Must be called within a tokio runtime.
    pub fn dispatch_future<F>(&self, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ActionPayload> + Send + 'static,
    {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let payload = future.await;
            dispatcher.dispatch(payload);
        })
    }

    /// Run every listener on `payload`, isolating failures.
    fn deliver(&self, payload: &ActionPayload, listeners: &[Arc<Listener>]) {
        let _span = tracing::debug_span!(
            "dispatch",
            action_type = payload.action_type(),
            side_effect = payload.is_side_effect,
        )
        .entered();

        for (position, listener) in listeners.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(payload, self))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!(
                        listener = position,
                        action_type = payload.action_type(),
                        error = %e,
                        "listener failed, continuing delivery"
                    );
                }
                Err(panic) => {
                    tracing::error!(
                        listener = position,
                        action_type = payload.action_type(),
                        panic = %panic_message(panic.as_ref()),
                        "listener panicked, continuing delivery"
                    );
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Handle for a registered listener.
///
/// Dropping the handle does **not** unregister the listener; call
/// [`dispose`](Subscription::dispose) on teardown.
pub struct Subscription {
    id: u64,
    shared: Weak<Shared>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

impl Subscription {
    /// Remove the listener from its dispatcher.
    ///
    /// A payload already being broadcast may still reach the listener.
    pub fn dispose(self) {
        self.unregister();
    }

    /// Remove the listener without consuming the handle.
    ///
    /// Used by shared model handles, where several clones own the same
    /// subscription.
    pub(crate) fn unregister(&self) {
        if let Some(shared) = self.shared.upgrade() {
            let mut inner = shared.inner.lock().unwrap_or_else(|e| e.into_inner());
            inner.listeners.retain(|(id, _)| *id != self.id);
            tracing::debug!(listener_id = self.id, "listener disposed");
        }
    }

    /// Returns `true` while the listener is still registered.
    pub fn is_active(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared
                .inner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .listeners
                .iter()
                .any(|(id, _)| *id == self.id),
            None => false,
        }
    }
}
