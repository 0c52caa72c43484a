use crate::{config::CoreConfig, fsutil};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{info, warn};

const META_FILE: &str = "meta.json";
const MODS_DIR: &str = "mods";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMeta {
    pub timestamp: u64,
    #[serde(default)]
    pub created_nanos: u64,
    pub reason: Option<String>,
    #[serde(default)]
    pub files: usize,
}

#[derive(Debug, Clone)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub meta: BackupMeta,
}

/// Copies the unit folder and the side tables into
/// `<backup_root>/backup-<secs>`, then prunes to the retention count.
pub fn create_backup(config: &CoreConfig, reason: Option<&str>) -> Result<PathBuf> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let stamp = now.as_secs();
    let backup_root = config.backup_root();
    fs::create_dir_all(&backup_root).context("create backups dir")?;

    let mut backup_dir = backup_root.join(format!("backup-{stamp}"));
    let mut suffix = 1;
    while backup_dir.exists() {
        backup_dir = backup_root.join(format!("backup-{stamp}-{suffix}"));
        suffix += 1;
    }
    fs::create_dir_all(&backup_dir).context("create backup dir")?;

    let files = if config.mods_root.exists() {
        fsutil::copy_dir(&config.mods_root, &backup_dir.join(MODS_DIR), None)
            .context("copy unit folder into backup")?
    } else {
        0
    };

    for table in [
        config.versions_path(),
        config.notes_path(),
        config.categories_path(),
    ] {
        if table.exists() {
            let target = backup_dir.join(fsutil::file_name_string(&table));
            fs::copy(&table, &target).with_context(|| format!("copy {:?}", table))?;
        }
    }

    let meta = BackupMeta {
        timestamp: stamp,
        created_nanos: now.as_nanos() as u64,
        reason: reason.map(|value| value.to_string()),
        files,
    };
    let meta_json = serde_json::to_string_pretty(&meta).context("serialize backup meta")?;
    fsutil::write_atomic_text(&backup_dir.join(META_FILE), &meta_json)
        .context("write backup meta")?;
    info!(path = ?backup_dir, files, reason = reason.unwrap_or(""), "backup created");

    prune_backups(&backup_root, config.backup_retention)?;
    Ok(backup_dir)
}

/// Backups under `backup_root`, oldest first. Directories without readable
/// metadata fall back to their modification time.
pub fn list_backups(backup_root: &Path) -> Result<Vec<BackupEntry>> {
    let mut out = Vec::new();
    if !backup_root.exists() {
        return Ok(out);
    }
    for entry in fs::read_dir(backup_root).context("read backups dir")? {
        let entry = entry.context("read backup entry")?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let meta = match read_meta(&path) {
            Some(meta) => meta,
            None => {
                let modified = entry
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .ok()
                    .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                    .unwrap_or_default();
                BackupMeta {
                    timestamp: modified.as_secs(),
                    created_nanos: modified.as_nanos() as u64,
                    reason: None,
                    files: 0,
                }
            }
        };
        out.push(BackupEntry { path, meta });
    }
    out.sort_by(|left, right| {
        left.meta
            .created_nanos
            .cmp(&right.meta.created_nanos)
            .then_with(|| left.path.cmp(&right.path))
    });
    Ok(out)
}

fn read_meta(dir: &Path) -> Option<BackupMeta> {
    let raw = fs::read_to_string(dir.join(META_FILE)).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Deletes the oldest backups until at most `retention` remain. The newest
/// one always survives.
pub fn prune_backups(backup_root: &Path, retention: usize) -> Result<usize> {
    let backups = list_backups(backup_root)?;
    let keep = retention.max(1);
    if backups.len() <= keep {
        return Ok(0);
    }
    let excess = backups.len() - keep;
    let mut removed = 0;
    for backup in backups.into_iter().take(excess) {
        match fs::remove_dir_all(&backup.path) {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = ?backup.path, "prune backup failed: {err}"),
        }
    }
    Ok(removed)
}
