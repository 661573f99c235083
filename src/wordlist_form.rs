//! Word-list form: local validation and background task submission.
//!
//! Field edits are validated locally and never contact the server. A valid
//! submission starts a server-side word-list build whose task is handed to
//! the async task inbox.

use std::fmt;
use std::sync::Arc;

use crate::action::{Action, ActionPayload};
use crate::client::{WordlistApi, WordlistArgs};
use crate::dispatcher::ActionDispatcher;
use crate::model::StatelessModel;

/// Task category of word-list builds.
pub const WORDLIST_TASK_CATEGORY: &str = "wordlist";

/// A form field value as typed, with its validation result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormValue {
    pub value: String,
    pub is_invalid: bool,
}

impl FormValue {
    pub fn new(value: impl Into<String>, is_invalid: bool) -> Self {
        Self {
            value: value.into(),
            is_invalid,
        }
    }
}

/// Parse a minimum frequency; valid values are integers >= 1.
pub fn parse_min_freq(value: &str) -> Option<u32> {
    value.trim().parse::<u32>().ok().filter(|v| *v >= 1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordlistFormState {
    pub corpus_id: String,
    /// Positional attribute the list is built from, e.g. `lemma`.
    pub wlattr: String,
    /// Regular expression filtering the listed values.
    pub wlpat: String,
    pub min_freq: FormValue,
    pub is_busy: bool,
    pub epoch: u64,
    /// Whether the latest `WORDLIST_FORM_SUBMIT` was accepted. Every submit
    /// rewrites it, and the submit side effect only sends when it is set.
    pub submit_accepted: bool,
}

impl WordlistFormState {
    pub fn new(corpus_id: impl Into<String>) -> Self {
        Self {
            corpus_id: corpus_id.into(),
            wlattr: "word".to_owned(),
            wlpat: ".*".to_owned(),
            min_freq: FormValue::new("5", false),
            is_busy: false,
            epoch: 0,
            submit_accepted: false,
        }
    }

    /// Whether a submission would be accepted.
    pub fn can_submit(&self) -> bool {
        !self.is_busy && !self.min_freq.is_invalid && !self.wlattr.trim().is_empty()
    }

    fn submit_args(&self) -> Option<WordlistArgs> {
        Some(WordlistArgs {
            corpname: self.corpus_id.clone(),
            wlattr: self.wlattr.clone(),
            wlpat: self.wlpat.clone(),
            wlminfreq: parse_min_freq(&self.min_freq.value)?,
        })
    }
}

/// Stateless model of the word-list form.
pub struct WordlistFormModel {
    api: Arc<dyn WordlistApi>,
}

impl fmt::Debug for WordlistFormModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WordlistFormModel").finish_non_exhaustive()
    }
}

impl WordlistFormModel {
    pub fn new(api: Arc<dyn WordlistApi>) -> Self {
        Self { api }
    }

    fn submit(&self, state: &WordlistFormState, dispatcher: &ActionDispatcher) {
        let epoch = state.epoch;
        let Some(args) = state.submit_args() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::error!("no async runtime, cannot submit word list");
            dispatcher.dispatch(
                ActionPayload::side_effect(Action::WordlistFormSubmitDone { epoch, task: None })
                    .with_error("failed to submit word list"),
            );
            return;
        }

        tracing::info!(corpus = %args.corpname, wlattr = %args.wlattr, "submitting word list");
        let api = Arc::clone(&self.api);
        dispatcher.dispatch_future(async move {
            let done =
                |task| ActionPayload::side_effect(Action::WordlistFormSubmitDone { epoch, task });
            match api.submit_wordlist(args).await {
                Ok(response) => done(response.task),
                Err(e) => {
                    tracing::warn!(error = %e, "word list submission failed");
                    done(None).with_error(e.to_string())
                }
            }
        });
    }
}

impl StatelessModel for WordlistFormModel {
    const NAME: &'static str = "wordlist-form";
    type State = WordlistFormState;

    fn reduce(
        &self,
        state: &Arc<WordlistFormState>,
        action: &ActionPayload,
    ) -> Arc<WordlistFormState> {
        let next = match &action.action {
            Action::WordlistFormSetWlattr { value } if *value != state.wlattr => WordlistFormState {
                wlattr: value.clone(),
                ..WordlistFormState::clone(state)
            },
            Action::WordlistFormSetWlpat { value } if *value != state.wlpat => WordlistFormState {
                wlpat: value.clone(),
                ..WordlistFormState::clone(state)
            },
            Action::WordlistFormSetMinFreq { value } => {
                let min_freq = FormValue::new(value.clone(), parse_min_freq(value).is_none());
                if min_freq == state.min_freq {
                    return Arc::clone(state);
                }
                WordlistFormState {
                    min_freq,
                    ..WordlistFormState::clone(state)
                }
            }
            Action::WordlistFormSubmit {} if state.can_submit() => WordlistFormState {
                is_busy: true,
                submit_accepted: true,
                ..WordlistFormState::clone(state)
            },
            Action::WordlistFormSubmit {} => {
                tracing::debug!(busy = state.is_busy, "word list submission refused");
                if !state.submit_accepted {
                    return Arc::clone(state);
                }
                WordlistFormState {
                    submit_accepted: false,
                    ..WordlistFormState::clone(state)
                }
            }
            Action::WordlistFormSubmitDone { epoch, .. }
                if *epoch == state.epoch && state.is_busy =>
            {
                WordlistFormState {
                    is_busy: false,
                    ..WordlistFormState::clone(state)
                }
            }
            Action::CorpusSwitch { corpora } => WordlistFormState {
                corpus_id: corpora.first().cloned().unwrap_or_default(),
                is_busy: false,
                epoch: state.epoch + 1,
                ..WordlistFormState::clone(state)
            },
            _ => return Arc::clone(state),
        };
        Arc::new(next)
    }

    fn side_effects(
        &self,
        state: &WordlistFormState,
        action: &ActionPayload,
        dispatcher: &ActionDispatcher,
    ) {
        match &action.action {
            Action::WordlistFormSubmit {} if state.submit_accepted => {
                self.submit(state, dispatcher)
            }
            Action::WordlistFormSubmitDone {
                epoch,
                task: Some(task),
            } if *epoch == state.epoch && action.error.is_none() => {
                dispatcher.dispatch_side_effect(Action::InboxAddAsyncTask {
                    ident: task.ident.clone(),
                    label: if task.label.is_empty() {
                        format!("word list ({})", state.corpus_id)
                    } else {
                        task.label.clone()
                    },
                    category: WORDLIST_TASK_CATEGORY.to_owned(),
                    args: task.args.clone(),
                    url: task.url.clone(),
                });
            }
            _ => {}
        }
    }
}
