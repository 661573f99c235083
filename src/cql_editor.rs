//! CQL editor text model.
//!
//! Each query input on a page is identified by a source id (the corpus it
//! queries). For every source the model keeps the raw query text, its
//! highlighted rendering and the selection offsets, and keeps the three in
//! sync on every edit. Offsets count characters, not bytes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::action::{Action, ActionPayload};
use crate::highlight::highlight_cql;
use crate::model::StatelessModel;

/// Editor state of all query inputs on the page.
///
/// Invariant: the key sets of the four maps always equal `corpora`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CqlEditorState {
    /// Active source ids, primary corpus first.
    pub corpora: Vec<String>,
    pub raw_code: HashMap<String, String>,
    /// Highlighted HTML of `raw_code`.
    pub rich_code: HashMap<String, String>,
    pub raw_anchor_idx: HashMap<String, usize>,
    pub raw_focus_idx: HashMap<String, usize>,
}

impl CqlEditorState {
    /// Empty editors for `corpora`.
    pub fn new(corpora: Vec<String>) -> Self {
        let mut state = Self {
            corpora: Vec::with_capacity(corpora.len()),
            ..Self::default()
        };
        for source_id in corpora {
            state.set_entry(&source_id, String::new(), 0, 0);
            state.corpora.push(source_id);
        }
        state
    }

    /// Preload a query (e.g. restored from the previous page).
    ///
    /// Ignored for an unknown source id. The cursor is placed at the end.
    pub fn with_query(mut self, source_id: &str, query: &str) -> Self {
        if self.contains(source_id) {
            let end = query.chars().count();
            self.set_entry(source_id, query.to_owned(), end, end);
        }
        self
    }

    pub fn contains(&self, source_id: &str) -> bool {
        self.raw_code.contains_key(source_id)
    }

    pub fn query(&self, source_id: &str) -> Option<&str> {
        self.raw_code.get(source_id).map(String::as_str)
    }

    pub fn rich_query(&self, source_id: &str) -> Option<&str> {
        self.rich_code.get(source_id).map(String::as_str)
    }

    /// `(anchor, focus)` selection offsets.
    pub fn cursor(&self, source_id: &str) -> Option<(usize, usize)> {
        Some((
            *self.raw_anchor_idx.get(source_id)?,
            *self.raw_focus_idx.get(source_id)?,
        ))
    }

    fn set_entry(&mut self, source_id: &str, raw: String, anchor: usize, focus: usize) {
        let rich = highlight_cql(&raw);
        self.rich_code.insert(source_id.to_owned(), rich);
        self.raw_code.insert(source_id.to_owned(), raw);
        self.raw_anchor_idx.insert(source_id.to_owned(), anchor);
        self.raw_focus_idx.insert(source_id.to_owned(), focus);
    }
}

/// Replace the chars of `text` in `range` with `insert`.
///
/// The range is clamped to the text; an inverted range is treated as empty
/// at its start.
///
/// # Returns
///
/// The new text and the char offset just past the inserted part.
pub fn splice_chars(text: &str, range: Option<[usize; 2]>, insert: &str) -> (String, usize) {
    let len = text.chars().count();
    let (start, end) = match range {
        Some([start, end]) => {
            let start = start.min(len);
            (start, end.clamp(start, len))
        }
        None => (0, len),
    };
    let mut out = String::with_capacity(text.len() + insert.len());
    out.extend(text.chars().take(start));
    out.push_str(insert);
    out.extend(text.chars().skip(end));
    (out, start + insert.chars().count())
}

/// Stateless model behind all CQL editors of a page.
#[derive(Debug, Clone, Copy, Default)]
pub struct CqlEditorModel;

impl CqlEditorModel {
    fn set_raw_query(
        state: &Arc<CqlEditorState>,
        source_id: &str,
        query: &str,
        range: Option<[usize; 2]>,
    ) -> Arc<CqlEditorState> {
        let Some(current) = state.query(source_id) else {
            tracing::debug!(source_id, "raw query for unknown source ignored");
            return Arc::clone(state);
        };
        let (raw, cursor) = splice_chars(current, range, query);
        let mut next = CqlEditorState::clone(state);
        next.set_entry(source_id, raw, cursor, cursor);
        Arc::new(next)
    }

    fn move_cursor(
        state: &Arc<CqlEditorState>,
        source_id: &str,
        anchor: usize,
        focus: usize,
    ) -> Arc<CqlEditorState> {
        let Some(len) = state.query(source_id).map(|q| q.chars().count()) else {
            return Arc::clone(state);
        };
        let (anchor, focus) = (anchor.min(len), focus.min(len));
        if state.cursor(source_id) == Some((anchor, focus)) {
            return Arc::clone(state);
        }
        let mut next = CqlEditorState::clone(state);
        next.raw_anchor_idx.insert(source_id.to_owned(), anchor);
        next.raw_focus_idx.insert(source_id.to_owned(), focus);
        Arc::new(next)
    }

    /// Position `i` of the new corpus list inherits the editor at position
    /// `i` of the old one.
    fn switch_corpora(state: &Arc<CqlEditorState>, corpora: &[String]) -> Arc<CqlEditorState> {
        if state.corpora == corpora {
            return Arc::clone(state);
        }
        let mut next = CqlEditorState::new(Vec::new());
        for (i, source_id) in corpora.iter().enumerate() {
            if next.contains(source_id) {
                tracing::warn!(source_id = %source_id, "duplicate corpus in switch, ignoring");
                continue;
            }
            let inherited = state.corpora.get(i).and_then(|old| {
                let raw = state.raw_code.get(old)?;
                Some((raw.clone(), state.cursor(old)?))
            });
            match inherited {
                Some((raw, (anchor, focus))) => next.set_entry(source_id, raw, anchor, focus),
                None => next.set_entry(source_id, String::new(), 0, 0),
            }
            next.corpora.push(source_id.clone());
        }
        tracing::debug!(from = ?state.corpora, to = ?next.corpora, "CQL editors remapped");
        Arc::new(next)
    }
}

impl StatelessModel for CqlEditorModel {
    const NAME: &'static str = "cql-editor";
    type State = CqlEditorState;

    fn reduce(&self, state: &Arc<CqlEditorState>, action: &ActionPayload) -> Arc<CqlEditorState> {
        match &action.action {
            Action::CqlEditorSetRawQuery {
                source_id,
                query,
                range,
            } => Self::set_raw_query(state, source_id, query, *range),
            Action::CqlEditorMoveCursor {
                source_id,
                raw_anchor_idx,
                raw_focus_idx,
            } => Self::move_cursor(state, source_id, *raw_anchor_idx, *raw_focus_idx),
            Action::CorpusSwitch { corpora } => Self::switch_corpora(state, corpora),
            _ => Arc::clone(state),
        }
    }
}
