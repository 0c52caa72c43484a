use crate::{
    config::CoreConfig,
    error::check_cancelled,
    pak::{normalize_entry_path, EntryReader},
    unit::ModUnit,
};
use anyhow::{Context, Result};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictOwner {
    pub id: String,
    pub name: String,
    pub is_externally_managed: bool,
}

/// A normalized packed path shipped by two or more units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictGroup {
    pub packed_path: String,
    pub owners: Vec<ConflictOwner>,
}

#[derive(Clone)]
pub struct ConflictChecker {
    reader: Arc<dyn EntryReader>,
    packed_extensions: Vec<String>,
}

impl ConflictChecker {
    pub fn new(reader: Arc<dyn EntryReader>, config: &CoreConfig) -> Self {
        Self {
            reader,
            packed_extensions: config.packed_extensions.clone(),
        }
    }

    /// Groups sorted by path. Unreadable folders and packed files are
    /// skipped with a warning.
    pub fn analyze(
        &self,
        units: &[ModUnit],
        cancel: &CancellationToken,
    ) -> Result<Vec<ConflictGroup>> {
        let mut index: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut scanned = 0usize;

        for (owner, unit) in units.iter().enumerate() {
            check_cancelled(cancel)?;
            let files = self.packed_files(&unit.path);
            check_cancelled(cancel)?;
            for file in files {
                check_cancelled(cancel)?;
                let entries = match self.reader.open(&file) {
                    Ok(entries) => entries,
                    Err(err) => {
                        warn!(path = ?file, id = %unit.id, "skipping unreadable packed file: {err:#}");
                        continue;
                    }
                };
                scanned += 1;
                for entry in entries {
                    check_cancelled(cancel)?;
                    if entry.is_directory {
                        continue;
                    }
                    let Some(raw) = entry.path else {
                        continue;
                    };
                    let key = normalize_entry_path(&raw);
                    if key.is_empty() {
                        continue;
                    }
                    let owners = index.entry(key).or_default();
                    if owners.last() != Some(&owner) {
                        owners.push(owner);
                    }
                }
            }
        }

        let groups: Vec<ConflictGroup> = index
            .into_iter()
            .filter(|(_, owners)| owners.len() >= 2)
            .map(|(packed_path, owners)| ConflictGroup {
                packed_path,
                owners: owners
                    .into_iter()
                    .map(|owner| {
                        let unit = &units[owner];
                        ConflictOwner {
                            id: unit.id.clone(),
                            name: unit.name.clone(),
                            is_externally_managed: unit.is_externally_managed,
                        }
                    })
                    .collect(),
            })
            .collect();
        debug!(units = units.len(), packed_files = scanned, conflicts = groups.len(), "conflict scan done");
        Ok(groups)
    }

    pub async fn analyze_async(
        &self,
        units: Vec<ModUnit>,
        cancel: CancellationToken,
    ) -> Result<Vec<ConflictGroup>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.analyze(&units, &cancel))
            .await
            .context("conflict scan task")?
    }

    fn packed_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(path = ?root, "skipping unreadable folder: {err}");
                    continue;
                }
            };
            if entry.file_type().is_file() && self.is_packed(entry.path()) {
                files.push(entry.into_path());
            }
        }
        files.sort();
        files
    }

    fn is_packed(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.packed_extensions
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::extract::testing::write_zip;
    use crate::pak::{testing::write_lspk, ArchiveEntry, PakEntryReader};
    use parking_lot::Mutex;
    use std::{collections::HashMap, fs};
    use tempfile::TempDir;

    fn unit_at(dir: &Path, id: &str) -> ModUnit {
        let path = dir.join(id);
        fs::create_dir_all(&path).unwrap();
        ModUnit::new(id, &format!("{id} name"), "1.0", path)
    }

    fn checker() -> ConflictChecker {
        let config = CoreConfig::with_base(Path::new("/unused"));
        ConflictChecker::new(Arc::new(PakEntryReader), &config)
    }

    #[test]
    fn shared_path_forms_one_group() {
        let dir = TempDir::new().unwrap();
        let first = unit_at(dir.path(), "first");
        let second = unit_at(dir.path(), "second");
        let third = unit_at(dir.path(), "third");
        write_lspk(
            &first.path.join("a.pak"),
            &["Mods\\Override.xml", "mods/first_only.lsx"],
        );
        write_lspk(&first.path.join("b.pak"), &["mods/override.xml"]);
        fs::create_dir_all(second.path.join("data")).unwrap();
        write_zip(
            &second.path.join("data").join("c.pak"),
            &[("mods/", b""), ("mods/override.xml", b"x")],
        );
        write_lspk(&third.path.join("d.pak"), &["public/other.txt"]);

        let groups = checker()
            .analyze(&[first, second, third], &CancellationToken::new())
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].packed_path, "mods/override.xml");
        let ids: Vec<&str> = groups[0].owners.iter().map(|owner| owner.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn unreadable_archives_are_skipped() {
        let dir = TempDir::new().unwrap();
        let first = unit_at(dir.path(), "first");
        let second = unit_at(dir.path(), "second");
        fs::write(first.path.join("broken.pak"), b"garbage!").unwrap();
        let mut oversized = b"LSPK".to_vec();
        oversized.extend_from_slice(&18u32.to_le_bytes());
        oversized.extend_from_slice(&16u64.to_le_bytes());
        oversized.extend_from_slice(&u32::MAX.to_le_bytes());
        oversized.extend_from_slice(&8u32.to_le_bytes());
        oversized.extend_from_slice(&[0u8; 8]);
        fs::write(second.path.join("oversized.pak"), oversized).unwrap();
        write_lspk(&first.path.join("ok.pak"), &["x/y.txt"]);
        write_lspk(&second.path.join("ok.pak"), &["X\\Y.TXT"]);
        let mut missing = ModUnit::new("gone", "gone", "1", dir.path().join("gone"));
        missing.is_externally_managed = true;

        let groups = checker()
            .analyze(&[first, second, missing], &CancellationToken::new())
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].owners.len(), 2);
    }

    /// Serves canned entries keyed by file name and counts opens.
    struct CannedReader {
        entries: HashMap<String, Vec<ArchiveEntry>>,
        opened: Mutex<usize>,
        cancel_after: Option<(usize, CancellationToken)>,
    }

    impl EntryReader for CannedReader {
        fn open(&self, path: &Path) -> Result<Vec<ArchiveEntry>> {
            let mut opened = self.opened.lock();
            *opened += 1;
            if let Some((limit, token)) = &self.cancel_after {
                if *opened >= *limit {
                    token.cancel();
                }
            }
            let name = path.file_name().unwrap().to_string_lossy().to_string();
            Ok(self.entries.get(&name).cloned().unwrap_or_default())
        }
    }

    #[test]
    fn nameless_and_directory_entries_are_ignored() {
        let dir = TempDir::new().unwrap();
        let first = unit_at(dir.path(), "first");
        let second = unit_at(dir.path(), "second");
        fs::write(first.path.join("one.pak"), "").unwrap();
        fs::write(second.path.join("two.pak"), "").unwrap();
        let nameless = ArchiveEntry {
            path: None,
            is_directory: false,
        };
        let reader = CannedReader {
            entries: HashMap::from([
                (
                    "one.pak".to_string(),
                    vec![nameless.clone(), ArchiveEntry::directory("shared/"), ArchiveEntry::file("/")],
                ),
                (
                    "two.pak".to_string(),
                    vec![nameless, ArchiveEntry::directory("shared/"), ArchiveEntry::file("/")],
                ),
            ]),
            opened: Mutex::new(0),
            cancel_after: None,
        };
        let config = CoreConfig::with_base(dir.path());
        let checker = ConflictChecker::new(Arc::new(reader), &config);
        let groups = checker
            .analyze(&[first, second], &CancellationToken::new())
            .unwrap();
        assert!(groups.is_empty());
    }

    #[test]
    fn cancellation_stops_between_archives() {
        let dir = TempDir::new().unwrap();
        let first = unit_at(dir.path(), "first");
        let second = unit_at(dir.path(), "second");
        fs::write(first.path.join("one.pak"), "").unwrap();
        fs::write(second.path.join("two.pak"), "").unwrap();
        let token = CancellationToken::new();
        let reader = Arc::new(CannedReader {
            entries: HashMap::from([(
                "one.pak".to_string(),
                vec![ArchiveEntry::file("a"), ArchiveEntry::file("b")],
            )]),
            opened: Mutex::new(0),
            cancel_after: Some((1, token.clone())),
        });
        let config = CoreConfig::with_base(dir.path());
        let checker = ConflictChecker::new(reader.clone(), &config);
        let err = checker.analyze(&[first, second], &token).unwrap_err();
        assert!(CoreError::is_cancelled(&err));
        assert_eq!(*reader.opened.lock(), 1);
    }

    #[tokio::test]
    async fn async_scan_matches_blocking_scan() {
        let dir = TempDir::new().unwrap();
        let first = unit_at(dir.path(), "first");
        let second = unit_at(dir.path(), "second");
        write_lspk(&first.path.join("a.pak"), &["same.txt"]);
        write_lspk(&second.path.join("a.pak"), &["same.txt"]);
        let units = vec![first, second];
        let checker = checker();
        let blocking = checker.analyze(&units, &CancellationToken::new()).unwrap();
        let background = checker
            .analyze_async(units, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(blocking, background);
    }
}
