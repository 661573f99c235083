//! Client-side persistent key/value storage.
//!
//! [`LocalStorage`] keeps a single JSON object in one file and rewrites it
//! atomically (temp file + rename) on every change. On top of it sit the
//! typed views [`UserPrefs`] and [`LineSelectionStore`].

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key under which [`UserPrefs`] are stored.
pub const USER_PREFS_KEY: &str = "userPrefs";
/// Key under which [`LineSelectionStore`] data is stored.
pub const LINE_SELECTION_KEY: &str = "concLines";

/// JSON key/value store backed by one file.
///
/// Reads are served from memory; every write persists the whole object.
#[derive(Debug)]
pub struct LocalStorage {
    path: PathBuf,
    entries: Mutex<Map<String, Value>>,
}

impl LocalStorage {
    /// Open the store at `path`, loading existing entries.
    ///
    /// A missing file yields an empty store. A corrupt file is not a hard
    /// error: it is logged and treated as empty, and is overwritten by the
    /// next write.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` for I/O failures other than file-not-found.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let entries = load_entries(&path)?;
        tracing::debug!(path = %path.display(), keys = entries.len(), "local storage opened");
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read and decode the value under `key`.
    ///
    /// Returns `None` when the key is absent or its value does not decode
    /// as `T`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.lock().get(key).cloned()?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(key, error = %e, "stored value has unexpected shape, ignoring");
                None
            }
        }
    }

    /// Store `value` under `key` and persist.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if serialization or the atomic write fails. The
    /// in-memory entry is updated regardless.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> io::Result<()> {
        let value = serde_json::to_value(value).map_err(io::Error::other)?;
        let mut entries = self.lock();
        entries.insert(key.to_owned(), value);
        save_entries(&self.path, &entries)
    }

    /// Remove `key` and persist.
    ///
    /// # Returns
    ///
    /// `true` if the key was present.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the atomic write fails.
    pub fn remove(&self, key: &str) -> io::Result<bool> {
        let mut entries = self.lock();
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        save_entries(&self.path, &entries)?;
        Ok(true)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

fn load_entries(path: &Path) -> io::Result<Map<String, Value>> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(entries) => Ok(entries),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "corrupt local storage file, starting empty"
                );
                Ok(Map::new())
            }
        },
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Map::new()),
        Err(e) => Err(e),
    }
}

fn save_entries(path: &Path, entries: &Map<String, Value>) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp_path = PathBuf::from(tmp);
    let json = serde_json::to_string_pretty(entries).map_err(io::Error::other)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

// --- typed views ---

/// User preferences remembered across pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserPrefs {
    /// Overrides the server-side default for removing finished tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_finished_on_submit: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui_lang: Option<String>,
    /// Last attribute used in the word-list form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_wlattr: Option<String>,
}

impl UserPrefs {
    /// Stored preferences, or defaults if none were saved.
    pub fn load(storage: &LocalStorage) -> Self {
        storage.get(USER_PREFS_KEY).unwrap_or_default()
    }

    /// # Errors
    ///
    /// Returns `io::Error` if the storage write fails.
    pub fn save(&self, storage: &LocalStorage) -> io::Result<()> {
        storage.set(USER_PREFS_KEY, self)
    }
}

/// A concordance line the user marked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedLine {
    /// Position of the first KWIC token in the corpus.
    pub token_id: u64,
    pub kwic_len: u32,
    /// Group number for line grouping; `None` for plain selection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<u32>,
}

/// Selected concordance lines, grouped by concordance id.
///
/// Each concordance keeps at most one entry per `token_id`; selecting an
/// already selected token replaces its entry.
#[derive(Debug, Clone)]
pub struct LineSelectionStore {
    storage: Arc<LocalStorage>,
}

impl LineSelectionStore {
    pub fn new(storage: Arc<LocalStorage>) -> Self {
        Self { storage }
    }

    fn load(&self) -> BTreeMap<String, Vec<SelectedLine>> {
        self.storage.get(LINE_SELECTION_KEY).unwrap_or_default()
    }

    fn save(&self, data: &BTreeMap<String, Vec<SelectedLine>>) -> io::Result<()> {
        self.storage.set(LINE_SELECTION_KEY, data)
    }

    /// Selected lines of `conc_id`, in selection order.
    pub fn selected(&self, conc_id: &str) -> Vec<SelectedLine> {
        self.load().remove(conc_id).unwrap_or_default()
    }

    /// # Errors
    ///
    /// Returns `io::Error` if the storage write fails.
    pub fn select(&self, conc_id: &str, line: SelectedLine) -> io::Result<()> {
        let mut data = self.load();
        let lines = data.entry(conc_id.to_owned()).or_default();
        match lines.iter_mut().find(|l| l.token_id == line.token_id) {
            Some(existing) => *existing = line,
            None => lines.push(line),
        }
        self.save(&data)
    }

    /// # Returns
    ///
    /// `true` if the line was selected.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the storage write fails.
    pub fn deselect(&self, conc_id: &str, token_id: u64) -> io::Result<bool> {
        let mut data = self.load();
        let Some(lines) = data.get_mut(conc_id) else {
            return Ok(false);
        };
        let before = lines.len();
        lines.retain(|l| l.token_id != token_id);
        if lines.len() == before {
            return Ok(false);
        }
        if lines.is_empty() {
            data.remove(conc_id);
        }
        self.save(&data)?;
        Ok(true)
    }

    /// Drop every selection of `conc_id`.
    ///
    /// # Errors
    ///
    /// Returns `io::Error` if the storage write fails.
    pub fn clear(&self, conc_id: &str) -> io::Result<()> {
        let mut data = self.load();
        if data.remove(conc_id).is_some() {
            self.save(&data)?;
        }
        Ok(())
    }
}
