//! The host application's enablement/load-order file.
//!
//! One line per unit id, in load order; `# id` marks a disabled unit. Order
//! tracking decides which of two names is live: `modlist.txt` while tracking
//! is on, `modlist.txt.bak` while it is off. Exactly one of them is
//! authoritative at a time and every transition between them goes through
//! [`OrderFileManager`].

use crate::{
    config::CoreConfig,
    error::CoreError,
    fsutil,
    prompt::{NoticeLevel, Prompt},
};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::{
    collections::HashSet,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use tracing::{debug, info, warn};

pub const BACKUP_SUFFIX: &str = ".bak";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderEntry {
    pub id: String,
    pub enabled: bool,
}

impl OrderEntry {
    pub fn new(id: &str, enabled: bool) -> Self {
        Self {
            id: id.to_string(),
            enabled,
        }
    }
}

/// Blank lines are skipped, repeated ids keep their first position.
pub fn parse_order(raw: &str) -> Vec<OrderEntry> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (id, enabled) = match line.strip_prefix('#') {
            Some(rest) => (rest.trim(), false),
            None => (line, true),
        };
        if id.is_empty() || !seen.insert(id.to_string()) {
            continue;
        }
        out.push(OrderEntry::new(id, enabled));
    }
    out
}

pub fn render_order(entries: &[OrderEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        if !entry.enabled {
            out.push_str("# ");
        }
        out.push_str(&entry.id);
        out.push('\n');
    }
    out
}

pub fn read_order_file(path: &Path) -> Result<Vec<OrderEntry>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(parse_order(&raw)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(err).with_context(|| format!("read order file {:?}", path)),
    }
}

pub fn main_order_path(folder: &Path, file_name: &str) -> PathBuf {
    folder.join(file_name)
}

pub fn backup_order_path(folder: &Path, file_name: &str) -> PathBuf {
    folder.join(format!("{file_name}{BACKUP_SUFFIX}"))
}

pub struct OrderFileManager {
    file_name: String,
    tracking: AtomicBool,
    gate: Mutex<()>,
    prompt: Arc<dyn Prompt>,
    attempts: u32,
    backoff: Duration,
}

impl OrderFileManager {
    pub fn new(config: &CoreConfig, prompt: Arc<dyn Prompt>) -> Self {
        Self {
            file_name: config.order_file_name.clone(),
            tracking: AtomicBool::new(config.order_tracking_enabled),
            gate: Mutex::new(()),
            prompt,
            attempts: config.move_attempts.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn main_path(&self, folder: &Path) -> PathBuf {
        main_order_path(folder, &self.file_name)
    }

    pub fn backup_path(&self, folder: &Path) -> PathBuf {
        backup_order_path(folder, &self.file_name)
    }

    pub fn is_tracking_enabled(&self) -> bool {
        self.tracking.load(Ordering::SeqCst)
    }

    pub fn authoritative_path(&self, folder: &Path) -> PathBuf {
        if self.is_tracking_enabled() {
            self.main_path(folder)
        } else {
            self.backup_path(folder)
        }
    }

    /// Switches order tracking on or off for `folder`.
    pub fn apply_setting(&self, enabled: bool, folder: &Path) -> Result<()> {
        let _gate = self.gate.lock();
        let main = self.main_path(folder);
        let backup = self.backup_path(folder);

        if enabled {
            if backup.exists() {
                self.atomic_move(&backup, &main)?;
            } else if !main.exists() {
                fsutil::write_atomic_text(&main, "").context("create empty order file")?;
                info!(path = ?main, "created empty order file");
            }
        } else if main.exists() {
            self.atomic_move(&main, &backup)?;
            if main.exists() {
                fs::remove_file(&main).context("remove order file after move")?;
            }
        }

        self.tracking.store(enabled, Ordering::SeqCst);
        debug!(enabled, folder = ?folder, "order tracking applied");
        Ok(())
    }

    /// Startup repair for half-finished transitions. Running it twice leaves
    /// the same files as running it once.
    pub fn consolidate(&self, enabled: bool, folder: &Path) -> Result<()> {
        let _gate = self.gate.lock();
        let main = self.main_path(folder);
        let backup = self.backup_path(folder);

        match (enabled, main.exists(), backup.exists()) {
            (true, true, true) => {
                warn!(path = ?backup, "discarding stale order backup");
                fs::remove_file(&backup).context("remove stale order backup")?;
            }
            (true, false, true) => self.atomic_move(&backup, &main)?,
            (true, false, false) => {
                fsutil::write_atomic_text(&main, "").context("create empty order file")?;
                info!(path = ?main, "created empty order file");
            }
            (false, true, _) => self.atomic_move(&main, &backup)?,
            (true, true, false) | (false, false, _) => {}
        }

        self.tracking.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    /// Entries of whichever file is authoritative; empty when it is missing.
    pub fn read_order(&self, folder: &Path) -> Result<Vec<OrderEntry>> {
        let _gate = self.gate.lock();
        read_order_file(&self.authoritative_path(folder))
    }

    /// Writes the authoritative variant. With tracking off a leftover main
    /// file is removed so the host does not pick it up.
    pub fn write_order(&self, folder: &Path, entries: &[OrderEntry]) -> Result<()> {
        let _gate = self.gate.lock();
        let target = self.authoritative_path(folder);
        fsutil::write_atomic_text(&target, &render_order(entries))
            .with_context(|| format!("write order file {:?}", target))?;
        if !self.is_tracking_enabled() {
            let main = self.main_path(folder);
            if main.exists() {
                fs::remove_file(&main).context("remove inactive order file")?;
            }
        }
        debug!(path = ?target, count = entries.len(), "order file written");
        Ok(())
    }

    /// Replaces `dst` with `src`. A missing source fails immediately. IO
    /// failures are retried with linear backoff, asking before each retry.
    pub fn atomic_move(&self, src: &Path, dst: &Path) -> Result<()> {
        if !src.exists() {
            self.prompt.notify(
                NoticeLevel::Error,
                &format!("Cannot move {}: the file does not exist.", src.display()),
            );
            return Err(CoreError::SourceMissing(src.to_path_buf()).into());
        }

        let mut attempt = 1u32;
        loop {
            if attempt > 1 && !src.exists() {
                self.prompt.notify(
                    NoticeLevel::Error,
                    &format!("{} disappeared while retrying the move.", src.display()),
                );
                return Err(CoreError::SourceVanished(src.to_path_buf()).into());
            }

            let err = match replace_file(src, dst) {
                Ok(()) => {
                    info!(src = ?src, dst = ?dst, attempt, "order file moved");
                    return Ok(());
                }
                Err(err) => err,
            };
            warn!(src = ?src, dst = ?dst, attempt, "order file move failed: {err}");

            if !src.exists() {
                self.prompt.notify(
                    NoticeLevel::Error,
                    &format!("{} disappeared while moving it.", src.display()),
                );
                return Err(CoreError::SourceVanished(src.to_path_buf()).into());
            }
            if attempt >= self.attempts {
                self.prompt.notify(
                    NoticeLevel::Error,
                    &format!(
                        "Could not move {} to {} after {attempt} attempts: {err}",
                        src.display(),
                        dst.display()
                    ),
                );
                return Err(CoreError::MoveFailed {
                    src: src.to_path_buf(),
                    dst: dst.to_path_buf(),
                    attempts: attempt,
                    source: err,
                }
                .into());
            }
            let question = format!(
                "Moving {} to {} failed ({err}). The file may be open in another program. Retry?",
                src.display(),
                dst.display()
            );
            if !self.prompt.confirm("Order file busy", &question) {
                return Err(CoreError::MoveAborted {
                    src: src.to_path_buf(),
                    dst: dst.to_path_buf(),
                }
                .into());
            }
            thread::sleep(self.backoff * attempt);
            attempt += 1;
        }
    }
}

fn replace_file(src: &Path, dst: &Path) -> io::Result<()> {
    if dst.exists() {
        fs::remove_file(dst)?;
    }
    fs::rename(src, dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::testing::ScriptedPrompt;
    use crate::prompt::Headless;
    use tempfile::TempDir;

    fn manager(dir: &Path, prompt: Arc<dyn Prompt>) -> OrderFileManager {
        let mut config = CoreConfig::with_base(dir);
        config.retry_backoff_ms = 1;
        OrderFileManager::new(&config, prompt)
    }

    fn snapshot(manager: &OrderFileManager, folder: &Path) -> (Option<String>, Option<String>) {
        (
            fs::read_to_string(manager.main_path(folder)).ok(),
            fs::read_to_string(manager.backup_path(folder)).ok(),
        )
    }

    #[test]
    fn parse_and_render_lines() {
        let entries = parse_order("alpha\n# beta\n\n#gamma\nalpha\n   \n");
        assert_eq!(
            entries,
            vec![
                OrderEntry::new("alpha", true),
                OrderEntry::new("beta", false),
                OrderEntry::new("gamma", false),
            ]
        );
        assert_eq!(render_order(&entries), "alpha\n# beta\n# gamma\n");
    }

    #[test]
    fn inner_hash_in_ids_survives_round_trip() {
        let entries = vec![
            OrderEntry::new("Lamps_#2", true),
            OrderEntry::new("C#_Tools", false),
        ];
        assert_eq!(parse_order(&render_order(&entries)), entries);
    }

    #[test]
    fn enabling_restores_backup_lines() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path(), Arc::new(Headless));
        fs::write(manager.backup_path(dir.path()), "x\ny\n").unwrap();

        manager.apply_setting(true, dir.path()).unwrap();
        assert!(!manager.backup_path(dir.path()).exists());
        let entries = read_order_file(&manager.main_path(dir.path())).unwrap();
        assert_eq!(
            entries,
            vec![OrderEntry::new("x", true), OrderEntry::new("y", true)]
        );
    }

    #[test]
    fn enabling_with_nothing_creates_empty_main() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path(), Arc::new(Headless));
        manager.apply_setting(true, dir.path()).unwrap();
        assert_eq!(snapshot(&manager, dir.path()), (Some(String::new()), None));
    }

    #[test]
    fn disabling_moves_main_over_stale_backup() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path(), Arc::new(Headless));
        fs::write(manager.main_path(dir.path()), "fresh\n").unwrap();
        fs::write(manager.backup_path(dir.path()), "stale\n").unwrap();

        manager.apply_setting(false, dir.path()).unwrap();
        assert_eq!(
            snapshot(&manager, dir.path()),
            (None, Some("fresh\n".to_string()))
        );
        assert!(!manager.is_tracking_enabled());

        manager.apply_setting(false, dir.path()).unwrap();
        assert_eq!(
            snapshot(&manager, dir.path()),
            (None, Some("fresh\n".to_string()))
        );
    }

    #[test]
    fn consolidate_is_idempotent() {
        for enabled in [true, false] {
            for (main, backup) in [
                (Some("m\n"), Some("b\n")),
                (Some("m\n"), None),
                (None, Some("b\n")),
                (None, None),
            ] {
                let dir = TempDir::new().unwrap();
                let manager = manager(dir.path(), Arc::new(Headless));
                if let Some(main) = main {
                    fs::write(manager.main_path(dir.path()), main).unwrap();
                }
                if let Some(backup) = backup {
                    fs::write(manager.backup_path(dir.path()), backup).unwrap();
                }
                manager.consolidate(enabled, dir.path()).unwrap();
                let once = snapshot(&manager, dir.path());
                manager.consolidate(enabled, dir.path()).unwrap();
                assert_eq!(snapshot(&manager, dir.path()), once);
                if enabled {
                    assert!(once.0.is_some() && once.1.is_none());
                } else {
                    assert!(once.0.is_none());
                }
            }
        }
    }

    #[test]
    fn write_order_targets_authoritative_variant() {
        let dir = TempDir::new().unwrap();
        let manager = manager(dir.path(), Arc::new(Headless));
        let entries = vec![OrderEntry::new("a", true), OrderEntry::new("b", false)];
        manager.write_order(dir.path(), &entries).unwrap();
        assert_eq!(manager.read_order(dir.path()).unwrap(), entries);

        manager.apply_setting(false, dir.path()).unwrap();
        fs::write(manager.main_path(dir.path()), "host wrote this\n").unwrap();
        manager.write_order(dir.path(), &entries[..1]).unwrap();
        assert!(!manager.main_path(dir.path()).exists());
        assert_eq!(
            fs::read_to_string(manager.backup_path(dir.path())).unwrap(),
            "a\n"
        );
    }

    #[test]
    fn missing_source_fails_without_retry() {
        let dir = TempDir::new().unwrap();
        let prompt = Arc::new(ScriptedPrompt::with_confirms(&[true, true]));
        let manager = manager(dir.path(), prompt.clone());
        let err = manager
            .atomic_move(&dir.path().join("nope"), &dir.path().join("dst"))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::SourceMissing(_))
        ));
        assert_eq!(*prompt.asked.lock(), 0);
        assert_eq!(prompt.notice_count(NoticeLevel::Error), 1);
    }

    #[test]
    fn locked_target_retries_then_fails() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst");
        fs::write(&src, "x").unwrap();
        fs::create_dir_all(dst.join("blocker")).unwrap();

        let prompt = Arc::new(ScriptedPrompt::with_confirms(&[true, true, true]));
        let manager = manager(dir.path(), prompt.clone());
        let err = manager.atomic_move(&src, &dst).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::MoveFailed { attempts: 3, .. })
        ));
        assert_eq!(*prompt.asked.lock(), 2);
        assert!(src.exists());
    }

    #[test]
    fn declined_retry_aborts() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst");
        fs::write(&src, "x").unwrap();
        fs::create_dir_all(dst.join("blocker")).unwrap();

        let manager = manager(dir.path(), Arc::new(Headless));
        let err = manager.atomic_move(&src, &dst).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::MoveAborted { .. })
        ));
    }

    /// Clears the obstacle (or removes the source) when asked to retry.
    struct FixingPrompt {
        remove: PathBuf,
        remove_is_dir: bool,
    }

    impl Prompt for FixingPrompt {
        fn confirm(&self, _title: &str, _message: &str) -> bool {
            if self.remove_is_dir {
                fs::remove_dir_all(&self.remove).unwrap();
            } else {
                fs::remove_file(&self.remove).unwrap();
            }
            true
        }

        fn request_number(&self, _title: &str, _message: &str) -> Option<i64> {
            None
        }

        fn notify(&self, _level: NoticeLevel, _message: &str) {}
    }

    #[test]
    fn retry_succeeds_once_obstacle_clears() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst");
        fs::write(&src, "payload").unwrap();
        fs::create_dir_all(dst.join("blocker")).unwrap();

        let prompt = Arc::new(FixingPrompt {
            remove: dst.clone(),
            remove_is_dir: true,
        });
        let manager = manager(dir.path(), prompt);
        manager.atomic_move(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "payload");
        assert!(!src.exists());
    }

    #[test]
    fn vanished_source_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst");
        fs::write(&src, "payload").unwrap();
        fs::create_dir_all(dst.join("blocker")).unwrap();

        let prompt = Arc::new(FixingPrompt {
            remove: src.clone(),
            remove_is_dir: false,
        });
        let manager = manager(dir.path(), prompt);
        let err = manager.atomic_move(&src, &dst).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::SourceVanished(_))
        ));
    }
}
