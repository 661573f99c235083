//! Page-level user message channel.
//!
//! Every server or network failure ends up here as an error message; form
//! validation problems stay in their form models instead.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::{Action, ActionPayload};
use crate::model::StatelessModel;

/// Default number of messages kept before the oldest are dropped.
pub const DEFAULT_MAX_MESSAGES: usize = 10;

/// Severity of a user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageLevel {
    Info,
    Warning,
    Error,
    /// Notification that something was sent to the user's inbox.
    Mail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessage {
    pub id: Uuid,
    pub level: MessageLevel,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageState {
    /// Oldest first.
    pub messages: Vec<UserMessage>,
}

impl MessageState {
    pub fn has_errors(&self) -> bool {
        self.messages.iter().any(|m| m.level == MessageLevel::Error)
    }
}

/// Collects messages raised by any model.
///
/// Besides explicit `MESSAGE_SHOW` actions, a side-effect action that
/// carries an error is surfaced as an error message, so completion actions
/// only need to attach their failure once.
#[derive(Debug, Clone)]
pub struct MessageModel {
    max_messages: usize,
}

impl Default for MessageModel {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
        }
    }
}

impl MessageModel {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages: max_messages.max(1),
        }
    }

    fn push(&self, state: &MessageState, level: MessageLevel, text: &str) -> MessageState {
        let mut messages = state.messages.clone();
        messages.push(UserMessage {
            id: Uuid::new_v4(),
            level,
            text: text.to_owned(),
        });
        let overflow = messages.len().saturating_sub(self.max_messages);
        messages.drain(..overflow);
        MessageState { messages }
    }
}

impl StatelessModel for MessageModel {
    const NAME: &'static str = "messages";
    type State = MessageState;

    fn reduce(&self, state: &Arc<MessageState>, action: &ActionPayload) -> Arc<MessageState> {
        match &action.action {
            Action::MessageShow { level, text } => {
                if *level == MessageLevel::Error {
                    tracing::warn!(text = %text, "error message shown");
                }
                Arc::new(self.push(state, *level, text))
            }
            Action::MessageClose { id } => {
                if !state.messages.iter().any(|m| m.id == *id) {
                    return Arc::clone(state);
                }
                Arc::new(MessageState {
                    messages: state
                        .messages
                        .iter()
                        .filter(|m| m.id != *id)
                        .cloned()
                        .collect(),
                })
            }
            _ => match action.error {
                Some(ref error) if action.is_side_effect => {
                    Arc::new(self.push(state, MessageLevel::Error, &error.message))
                }
                _ => Arc::clone(state),
            },
        }
    }
}
