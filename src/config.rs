use crate::fsutil;
use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

pub const APP_DIR_NAME: &str = "modwright";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Folder the host application loads units from; each unit lives in `mods_root/<id>`.
    pub mods_root: PathBuf,
    /// Side tables, temp space, backups and the log file.
    pub data_dir: PathBuf,
    pub profiles_root: PathBuf,
    /// Folders owned by another platform. Scanned, never rewritten.
    #[serde(default)]
    pub external_roots: Vec<PathBuf>,
    #[serde(default = "default_true")]
    pub order_tracking_enabled: bool,
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
    #[serde(default = "default_move_attempts")]
    pub move_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_packed_extensions")]
    pub packed_extensions: Vec<String>,
    #[serde(default = "default_manifest_file_name")]
    pub manifest_file_name: String,
    #[serde(default = "default_order_file_name")]
    pub order_file_name: String,
    #[serde(default = "default_true")]
    pub update_checks_default: bool,
    /// Profile kept in step with the live order, per context.
    #[serde(default)]
    pub active_profiles: BTreeMap<String, String>,
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

impl CoreConfig {
    /// Defaults rooted at `base`: `base/mods`, `base/data`, `base/profiles`.
    pub fn with_base(base: &Path) -> Self {
        Self {
            mods_root: base.join("mods"),
            data_dir: base.join("data"),
            profiles_root: base.join("profiles"),
            external_roots: Vec::new(),
            order_tracking_enabled: true,
            backup_retention: default_backup_retention(),
            move_attempts: default_move_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            packed_extensions: default_packed_extensions(),
            manifest_file_name: default_manifest_file_name(),
            order_file_name: default_order_file_name(),
            update_checks_default: true,
            active_profiles: BTreeMap::new(),
            config_path: None,
        }
    }

    pub fn default_location() -> Result<PathBuf> {
        Ok(base_data_dir()?.join("config.json"))
    }

    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read_to_string(path).context("read config")?;
            let mut config: CoreConfig = serde_json::from_str(&raw).context("parse config")?;
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let base = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => base_data_dir()?,
        };
        let mut config = CoreConfig::with_base(&base);
        config.config_path = Some(path.to_path_buf());
        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self
            .config_path
            .as_ref()
            .context("config has no backing file")?;
        let raw = serde_json::to_string_pretty(self).context("serialize config")?;
        fsutil::write_atomic_text(path, &raw).context("write config")?;
        Ok(())
    }

    pub fn active_profile(&self, context: &str) -> Option<&str> {
        self.active_profiles.get(context).map(String::as_str)
    }

    pub fn set_active_profile(&mut self, context: &str, name: &str) {
        self.active_profiles
            .insert(context.to_string(), name.to_string());
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.mods_root).context("create mods root")?;
        fs::create_dir_all(&self.data_dir).context("create data dir")?;
        fs::create_dir_all(&self.profiles_root).context("create profiles root")?;
        Ok(())
    }

    pub fn versions_path(&self) -> PathBuf {
        self.data_dir.join("versions.json")
    }

    pub fn notes_path(&self) -> PathBuf {
        self.data_dir.join("notes.json")
    }

    pub fn categories_path(&self) -> PathBuf {
        self.data_dir.join("categories.json")
    }

    pub fn temp_root(&self) -> PathBuf {
        self.data_dir.join("tmp")
    }

    pub fn backup_root(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn log_path(&self) -> PathBuf {
        self.data_dir.join("modwright.log")
    }

    pub fn is_packed_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                self.packed_extensions
                    .iter()
                    .any(|known| known.eq_ignore_ascii_case(ext))
            })
            .unwrap_or(false)
    }
}

fn default_true() -> bool {
    true
}

fn default_backup_retention() -> usize {
    5
}

fn default_move_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_packed_extensions() -> Vec<String> {
    vec!["pak".to_string()]
}

fn default_manifest_file_name() -> String {
    "modinfo.xml".to_string()
}

fn default_order_file_name() -> String {
    "modlist.txt".to_string()
}

fn base_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join(APP_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_or_create_writes_defaults_next_to_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let config = CoreConfig::load_or_create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.mods_root, dir.path().join("mods"));
        assert!(config.order_tracking_enabled);
        assert_eq!(config.move_attempts, 3);

        let mut again = CoreConfig::load_or_create(&path).unwrap();
        assert_eq!(again.manifest_file_name, "modinfo.xml");
        again.set_active_profile("Act 2", "Speedrun");
        again.save().unwrap();
        let reloaded = CoreConfig::load_or_create(&path).unwrap();
        assert_eq!(reloaded.active_profile("Act 2"), Some("Speedrun"));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let raw = format!(
            r#"{{"mods_root":{:?},"data_dir":{:?},"profiles_root":{:?},"order_tracking_enabled":false}}"#,
            dir.path().join("m"),
            dir.path().join("d"),
            dir.path().join("p")
        );
        fs::write(&path, raw).unwrap();
        let config = CoreConfig::load_or_create(&path).unwrap();
        assert!(!config.order_tracking_enabled);
        assert_eq!(config.backup_retention, 5);
        assert_eq!(config.packed_extensions, vec!["pak".to_string()]);
        assert_eq!(config.active_profile("anything"), None);
        assert!(config.is_packed_file(Path::new("a/b/Thing.PAK")));
        assert!(!config.is_packed_file(Path::new("a/b/readme.txt")));
    }
}
