use crate::fsutil;
use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::warn;

pub const UNKNOWN_UPSTREAM: i64 = -1;

/// One installed unit ("mod").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModUnit {
    pub id: String,
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    /// 1-based load position, 0 when the order file does not list the unit.
    pub number: usize,
    pub is_enabled: bool,
    pub upstream_number: i64,
    pub category_id: Option<u32>,
    pub has_separator_after: bool,
    pub update_checks_enabled: bool,
    pub is_externally_managed: bool,
    pub note: Option<String>,
    pub game_version: Option<String>,
}

impl ModUnit {
    pub fn new(id: &str, name: &str, version: &str, path: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            path,
            number: 0,
            is_enabled: false,
            upstream_number: UNKNOWN_UPSTREAM,
            category_id: None,
            has_separator_after: false,
            update_checks_enabled: true,
            is_externally_managed: false,
            note: None,
            game_version: None,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Side-table row keyed by unit id in `versions.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VersionRecord {
    pub version: String,
    pub upstream_number: i64,
    #[serde(default)]
    pub source_file_name: String,
    #[serde(default = "default_true")]
    pub update_checks_enabled: bool,
}

pub type VersionTable = SideTable<VersionRecord>;
pub type NotesTable = SideTable<String>;
pub type CategoryTable = SideTable<u32>;

/// JSON object map `id -> T`, loaded whole, saved whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideTable<T> {
    pub entries: BTreeMap<String, T>,
}

impl<T> Default for SideTable<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<T: Serialize + DeserializeOwned> SideTable<T> {
    /// Missing file yields an empty table. A file that does not parse is moved
    /// aside and an empty table is returned.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        match serde_json::from_str::<BTreeMap<String, T>>(&raw) {
            Ok(entries) => Ok(Self { entries }),
            Err(err) => {
                let moved = quarantine(path)?;
                warn!(path = ?path, quarantined = ?moved, "corrupt side table reset: {err}");
                Ok(Self::default())
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(&self.entries).context("serialize side table")?;
        fsutil::write_atomic_text(path, &raw).with_context(|| format!("write {:?}", path))
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.entries.get(id)
    }

    pub fn insert(&mut self, id: &str, value: T) {
        self.entries.insert(id.to_string(), value);
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.entries.remove(id)
    }

    /// Moves the row for `old_id` to `new_id`. Returns whether a row moved.
    pub fn rekey(&mut self, old_id: &str, new_id: &str) -> bool {
        match self.entries.remove(old_id) {
            Some(value) => {
                self.entries.insert(new_id.to_string(), value);
                true
            }
            None => false,
        }
    }
}

/// Renames a corrupt file to `<name>.corrupt-<secs>` and returns the new path.
pub fn quarantine(path: &Path) -> Result<PathBuf> {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let file_name = fsutil::file_name_string(path);
    let mut target = path.with_file_name(format!("{file_name}.corrupt-{stamp}"));
    let mut suffix = 1;
    while target.exists() {
        target = path.with_file_name(format!("{file_name}.corrupt-{stamp}-{suffix}"));
        suffix += 1;
    }
    fs::rename(path, &target).with_context(|| format!("quarantine {:?}", path))?;
    Ok(target)
}

fn default_true() -> bool {
    true
}
