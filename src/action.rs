//! Action payloads: the only messages that flow through the dispatcher.
//!
//! [`Action`] is a closed sum type so that every model handles the action
//! space with exhaustive `match`es. On the wire (page bootstrap data, push
//! frames, logs) an action is the adjacently tagged JSON object
//! `{"actionType": "...", "props": {...}}`; [`ActionPayload`] adds the
//! `error` and `isSideEffect` envelope fields.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;
use crate::messages::MessageLevel;
use crate::task::AsyncTaskInfo;

/// Every event a user or the system can raise.
///
/// All variants are struct variants (some empty) so that `props` is always
/// a JSON object, never `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "actionType",
    content = "props",
    rename_all = "SCREAMING_SNAKE_CASE"
)]
pub enum Action {
    // --- async task inbox ---
    /// A background job was submitted; start tracking it as `PENDING`.
    #[serde(rename_all = "camelCase")]
    InboxAddAsyncTask {
        ident: String,
        label: String,
        category: String,
        #[serde(default)]
        args: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// Latest task statuses from a poll response or a push frame.
    ///
    /// `epoch` is the checker epoch observed when the request was issued.
    #[serde(rename_all = "camelCase")]
    InboxCheckTaskStatusDone {
        epoch: u64,
        data: Vec<AsyncTaskInfo>,
    },
    InboxToggleOverviewVisibility {},
    InboxCloseTaskOverview {},
    /// The server removed finished tasks and returned the remaining list.
    #[serde(rename_all = "camelCase")]
    InboxRemoveFinishedDone {
        epoch: u64,
        data: Vec<AsyncTaskInfo>,
    },

    // --- CQL editor ---
    /// Splice `query` into the raw text of `source_id` at the char `range`
    /// (`None` replaces the whole text).
    #[serde(rename_all = "camelCase")]
    CqlEditorSetRawQuery {
        source_id: String,
        query: String,
        #[serde(default)]
        range: Option<[usize; 2]>,
    },
    #[serde(rename_all = "camelCase")]
    CqlEditorMoveCursor {
        source_id: String,
        raw_anchor_idx: usize,
        raw_focus_idx: usize,
    },

    // --- corpus selection ---
    /// The active corpus list changed (primary corpus first, then aligned).
    #[serde(rename_all = "camelCase")]
    CorpusSwitch { corpora: Vec<String> },

    // --- page messages ---
    #[serde(rename_all = "camelCase")]
    MessageShow { level: MessageLevel, text: String },
    #[serde(rename_all = "camelCase")]
    MessageClose { id: uuid::Uuid },

    // --- word list form ---
    #[serde(rename_all = "camelCase")]
    WordlistFormSetWlattr { value: String },
    #[serde(rename_all = "camelCase")]
    WordlistFormSetWlpat { value: String },
    #[serde(rename_all = "camelCase")]
    WordlistFormSetMinFreq { value: String },
    WordlistFormSubmit {},
    #[serde(rename_all = "camelCase")]
    WordlistFormSubmitDone {
        epoch: u64,
        #[serde(default)]
        task: Option<AsyncTaskInfo>,
    },
}

impl Action {
    /// Wire names of every action, in declaration order.
    pub const TYPES: [&'static str; 15] = [
        "INBOX_ADD_ASYNC_TASK",
        "INBOX_CHECK_TASK_STATUS_DONE",
        "INBOX_TOGGLE_OVERVIEW_VISIBILITY",
        "INBOX_CLOSE_TASK_OVERVIEW",
        "INBOX_REMOVE_FINISHED_DONE",
        "CQL_EDITOR_SET_RAW_QUERY",
        "CQL_EDITOR_MOVE_CURSOR",
        "CORPUS_SWITCH",
        "MESSAGE_SHOW",
        "MESSAGE_CLOSE",
        "WORDLIST_FORM_SET_WLATTR",
        "WORDLIST_FORM_SET_WLPAT",
        "WORDLIST_FORM_SET_MIN_FREQ",
        "WORDLIST_FORM_SUBMIT",
        "WORDLIST_FORM_SUBMIT_DONE",
    ];

    /// The wire name of this action, e.g. `"INBOX_ADD_ASYNC_TASK"`.
    pub fn action_type(&self) -> &'static str {
        match self {
            Self::InboxAddAsyncTask { .. } => "INBOX_ADD_ASYNC_TASK",
            Self::InboxCheckTaskStatusDone { .. } => "INBOX_CHECK_TASK_STATUS_DONE",
            Self::InboxToggleOverviewVisibility {} => "INBOX_TOGGLE_OVERVIEW_VISIBILITY",
            Self::InboxCloseTaskOverview {} => "INBOX_CLOSE_TASK_OVERVIEW",
            Self::InboxRemoveFinishedDone { .. } => "INBOX_REMOVE_FINISHED_DONE",
            Self::CqlEditorSetRawQuery { .. } => "CQL_EDITOR_SET_RAW_QUERY",
            Self::CqlEditorMoveCursor { .. } => "CQL_EDITOR_MOVE_CURSOR",
            Self::CorpusSwitch { .. } => "CORPUS_SWITCH",
            Self::MessageShow { .. } => "MESSAGE_SHOW",
            Self::MessageClose { .. } => "MESSAGE_CLOSE",
            Self::WordlistFormSetWlattr { .. } => "WORDLIST_FORM_SET_WLATTR",
            Self::WordlistFormSetWlpat { .. } => "WORDLIST_FORM_SET_WLPAT",
            Self::WordlistFormSetMinFreq { .. } => "WORDLIST_FORM_SET_MIN_FREQ",
            Self::WordlistFormSubmit {} => "WORDLIST_FORM_SUBMIT",
            Self::WordlistFormSubmitDone { .. } => "WORDLIST_FORM_SUBMIT_DONE",
        }
    }

    /// Shorthand for an error message action.
    pub fn error_message(text: impl Into<String>) -> Self {
        Self::MessageShow {
            level: MessageLevel::Error,
            text: text.into(),
        }
    }
}

/// Failure attached to an action, typically a completion action of a
/// network side effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct ActionFailure {
    pub message: String,
}

impl ActionFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The envelope delivered to every listener.
///
/// Created at the dispatch call site, consumed synchronously by all
/// listeners, then dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionPayload {
    pub action: Action,
    pub error: Option<ActionFailure>,
    /// Set on actions dispatched by a model reacting to another action, so
    /// effect handlers can avoid re-triggering themselves.
    pub is_side_effect: bool,
}

impl From<Action> for ActionPayload {
    fn from(action: Action) -> Self {
        Self::new(action)
    }
}

impl ActionPayload {
    /// Wrap a user-originated action.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            error: None,
            is_side_effect: false,
        }
    }

    /// Wrap an action dispatched as a side effect of another action.
    pub fn side_effect(action: Action) -> Self {
        Self {
            action,
            error: None,
            is_side_effect: true,
        }
    }

    /// Attach a failure to this payload.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(ActionFailure::new(error));
        self
    }

    /// The wire name of the carried action.
    pub fn action_type(&self) -> &'static str {
        self.action.action_type()
    }

    /// The action's arguments as a JSON object.
    ///
    /// Always returns a map, empty for argument-less actions.
    pub fn props(&self) -> Map<String, Value> {
        match serde_json::to_value(&self.action) {
            Ok(Value::Object(mut obj)) => match obj.remove("props") {
                Some(Value::Object(props)) => props,
                _ => Map::new(),
            },
            _ => Map::new(),
        }
    }

    /// Encode to the wire form `{actionType, props, error?, isSideEffect?}`.
    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(
            "actionType".to_owned(),
            Value::String(self.action_type().to_owned()),
        );
        obj.insert("props".to_owned(), Value::Object(self.props()));
        if let Some(ref error) = self.error {
            obj.insert("error".to_owned(), Value::String(error.message.clone()));
        }
        if self.is_side_effect {
            obj.insert("isSideEffect".to_owned(), Value::Bool(true));
        }
        Value::Object(obj)
    }

    /// Decode a wire envelope.
    ///
    /// A missing or `null` `props` is treated as `{}`. `error` may be a
    /// plain string or an object with a `message` field.
    ///
    /// # Errors
    ///
    /// * [`DecodeError::MissingActionType`] - not an object, or no string `actionType`.
    /// * [`DecodeError::UnknownActionType`] - the type is not in [`Action::TYPES`].
    /// * [`DecodeError::InvalidProps`] - `props` does not fit the action type,
    ///   including bad values nested inside it.
    pub fn from_json(value: &Value) -> Result<Self, DecodeError> {
        let obj = value.as_object().ok_or(DecodeError::MissingActionType)?;
        let action_type = obj
            .get("actionType")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingActionType)?;
        if !Action::TYPES.contains(&action_type) {
            return Err(DecodeError::UnknownActionType(action_type.to_owned()));
        }
        let props = match obj.get("props") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(p) => p.clone(),
        };

        // Rebuild the adjacently tagged form serde expects.
        let tagged = serde_json::json!({ "actionType": action_type, "props": props });
        let action = match serde_json::from_value::<Action>(tagged) {
            Ok(action) => action,
            Err(source) => {
                return Err(DecodeError::InvalidProps {
                    action_type: action_type.to_owned(),
                    source,
                });
            }
        };

        let error = match obj.get("error") {
            Some(Value::String(message)) => Some(ActionFailure::new(message.clone())),
            Some(Value::Object(err)) => Some(ActionFailure::new(
                err.get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error"),
            )),
            _ => None,
        };
        let is_side_effect = obj
            .get("isSideEffect")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            action,
            error,
            is_side_effect,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn action_type_matches_serde_tag() {
        let action = Action::CqlEditorSetRawQuery {
            source_id: "c1".into(),
            query: "test".into(),
            range: Some([0, 0]),
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["actionType"], action.action_type());
        assert_eq!(value["props"]["sourceId"], "c1");
        assert_eq!(value["props"]["range"], json!([0, 0]));
    }

    #[test]
    fn empty_action_has_empty_props_map() {
        let payload = ActionPayload::new(Action::InboxToggleOverviewVisibility {});
        assert!(payload.props().is_empty());
        assert_eq!(payload.to_json()["props"], json!({}));
    }

    #[test]
    fn decode_add_task_scenario() {
        let payload = ActionPayload::from_json(&json!({
            "actionType": "INBOX_ADD_ASYNC_TASK",
            "props": {"ident": "t1", "label": "wl", "category": "wordlist"}
        }))
        .unwrap();
        assert_eq!(
            payload.action,
            Action::InboxAddAsyncTask {
                ident: "t1".into(),
                label: "wl".into(),
                category: "wordlist".into(),
                args: Map::new(),
                url: None,
            }
        );
        assert!(!payload.is_side_effect);
        assert_eq!(payload.error, None);
    }

    #[test]
    fn decode_missing_props_as_empty_map() {
        let payload = ActionPayload::from_json(&json!({
            "actionType": "WORDLIST_FORM_SUBMIT",
            "props": null
        }))
        .unwrap();
        assert_eq!(payload.action, Action::WordlistFormSubmit {});

        let payload =
            ActionPayload::from_json(&json!({"actionType": "INBOX_CLOSE_TASK_OVERVIEW"})).unwrap();
        assert_eq!(payload.action, Action::InboxCloseTaskOverview {});
    }

    #[test]
    fn decode_unknown_type_is_rejected() {
        let err =
            ActionPayload::from_json(&json!({"actionType": "NOPE", "props": {}})).unwrap_err();
        assert!(
            matches!(err, DecodeError::UnknownActionType(ref t) if t == "NOPE"),
            "got {err:?}"
        );
    }

    #[test]
    fn decode_invalid_props() {
        let err = ActionPayload::from_json(&json!({
            "actionType": "CQL_EDITOR_MOVE_CURSOR",
            "props": {"sourceId": "c1"}
        }))
        .unwrap_err();
        assert!(
            matches!(err, DecodeError::InvalidProps { .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn bad_nested_value_is_invalid_props() {
        let err = ActionPayload::from_json(&json!({
            "actionType": "MESSAGE_SHOW",
            "props": {"level": "bogus", "text": "x"}
        }))
        .unwrap_err();
        match err {
            DecodeError::InvalidProps { action_type, .. } => {
                assert_eq!(action_type, "MESSAGE_SHOW")
            }
            other => panic!("got {other:?}"),
        }
    }

    #[test]
    fn wire_names_are_listed_once() {
        let mut names = Action::TYPES.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Action::TYPES.len());
        for action in [
            Action::InboxToggleOverviewVisibility {},
            Action::WordlistFormSubmit {},
            Action::error_message("x"),
            Action::WordlistFormSetWlpat { value: "x".into() },
        ] {
            assert!(Action::TYPES.contains(&action.action_type()));
        }
    }

    #[test]
    fn decode_requires_action_type() {
        assert!(matches!(
            ActionPayload::from_json(&json!({"props": {}})),
            Err(DecodeError::MissingActionType)
        ));
        assert!(matches!(
            ActionPayload::from_json(&json!("MESSAGE_SHOW")),
            Err(DecodeError::MissingActionType)
        ));
    }

    #[test]
    fn envelope_fields_survive_encoding() {
        let payload = ActionPayload::side_effect(Action::WordlistFormSubmitDone {
            epoch: 3,
            task: None,
        })
        .with_error("server unavailable");
        let value = payload.to_json();
        assert_eq!(value["isSideEffect"], true);
        assert_eq!(value["error"], "server unavailable");

        let decoded = ActionPayload::from_json(&value).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn decode_error_object_form() {
        let payload = ActionPayload::from_json(&json!({
            "actionType": "INBOX_TOGGLE_OVERVIEW_VISIBILITY",
            "error": {"message": "denied"}
        }))
        .unwrap();
        assert_eq!(payload.error, Some(ActionFailure::new("denied")));
    }
}
