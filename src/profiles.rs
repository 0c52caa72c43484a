//! Named snapshots of enablement and load order, stored per host context as
//! `profiles_root/<context>/<name>/{profile.json, <order file>}`.

use crate::{
    config::CoreConfig,
    error::CoreError,
    events::{CoreEvent, EventSink},
    fsutil,
    order_file::{render_order, OrderEntry, OrderFileManager},
    unit::{self, ModUnit},
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub const DEFAULT_PROFILE: &str = "Default";
const PROFILE_FILE: &str = "profile.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub active_ids: BTreeSet<String>,
    #[serde(default)]
    pub load_order: Vec<String>,
    #[serde(default)]
    pub separator_ids: BTreeSet<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_modified: OffsetDateTime,
}

impl Profile {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            active_ids: BTreeSet::new(),
            load_order: Vec::new(),
            separator_ids: BTreeSet::new(),
            last_modified: OffsetDateTime::now_utc(),
        }
    }

    fn order_entries(&self) -> Vec<OrderEntry> {
        self.load_order
            .iter()
            .map(|id| OrderEntry::new(id, self.active_ids.contains(id)))
            .collect()
    }

    /// Replaces `old_id` everywhere. Returns whether anything changed.
    fn rename_id(&mut self, old_id: &str, new_id: &str) -> bool {
        let mut changed = false;
        if self.active_ids.remove(old_id) {
            self.active_ids.insert(new_id.to_string());
            changed = true;
        }
        if self.separator_ids.remove(old_id) {
            self.separator_ids.insert(new_id.to_string());
            changed = true;
        }
        for id in self.load_order.iter_mut().filter(|id| *id == old_id) {
            *id = new_id.to_string();
            changed = true;
        }
        changed
    }
}

/// Directory-safe form of a profile or context name: characters outside
/// `[A-Za-z0-9 _.-]` become `_`.
pub fn sanitize_name(name: &str) -> Result<String> {
    let mapped: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, ' ' | '_' | '.' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let trimmed = mapped.trim().trim_matches('.').trim();
    if trimmed.is_empty() {
        bail!("profile name {name:?} has no usable characters");
    }
    Ok(trimmed.to_string())
}

pub struct ProfilesService {
    context: String,
    context_dir: PathBuf,
    active: String,
    orders: Arc<OrderFileManager>,
    events: EventSink,
}

impl ProfilesService {
    pub fn new(config: &CoreConfig, orders: Arc<OrderFileManager>, context: &str) -> Result<Self> {
        let context_dir = config.profiles_root.join(sanitize_name(context)?);
        let active = config
            .active_profile(context)
            .unwrap_or(DEFAULT_PROFILE)
            .to_string();
        Ok(Self {
            context: context.to_string(),
            context_dir,
            active,
            orders,
            events: EventSink::default(),
        })
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    /// Profile that follows every order or enablement change.
    pub fn active_name(&self) -> &str {
        &self.active
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        sanitize_name(name)?;
        self.active = name.trim().to_string();
        debug!(context = %self.context, name = %self.active, "active profile set");
        Ok(())
    }

    /// Re-snapshots the active profile from `units`, keeping its name.
    pub fn save_active(&self, units: &[ModUnit]) -> Result<Profile> {
        let profile = self.create_from_current_state(&self.active, units);
        self.save(&profile)?;
        Ok(profile)
    }

    fn profile_dir(&self, name: &str) -> Result<PathBuf> {
        Ok(self.context_dir.join(sanitize_name(name)?))
    }

    /// Every readable profile of this context, sorted by name. Unreadable
    /// ones are logged and skipped.
    pub fn list(&self) -> Result<Vec<Profile>> {
        let mut out = Vec::new();
        if !self.context_dir.exists() {
            return Ok(out);
        }
        for entry in fs::read_dir(&self.context_dir).context("read profiles dir")? {
            let entry = entry.context("read profile entry")?;
            let path = entry.path().join(PROFILE_FILE);
            if !path.is_file() {
                continue;
            }
            match read_profile(&path) {
                Ok(profile) => out.push(profile),
                Err(err) => warn!(path = ?path, "skipping unreadable profile: {err:#}"),
            }
        }
        out.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(out)
    }

    /// `None` when missing. A corrupt document is moved aside and also
    /// reported as `None`.
    pub fn load(&self, name: &str) -> Result<Option<Profile>> {
        let path = self.profile_dir(name)?.join(PROFILE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        match read_profile(&path) {
            Ok(profile) if profile.name.trim() == name.trim() => Ok(Some(profile)),
            Ok(profile) => {
                debug!(requested = name, stored = %profile.name, "profile dir holds another name");
                Ok(None)
            }
            Err(err) => {
                let moved = unit::quarantine(&path)?;
                warn!(path = ?path, quarantined = ?moved, "corrupt profile reset: {err:#}");
                Ok(None)
            }
        }
    }

    /// Writes `profile.json` and the profile's own order file. Refuses when
    /// the sanitized directory already belongs to a differently named profile.
    pub fn save(&self, profile: &Profile) -> Result<PathBuf> {
        let dir = self.profile_dir(&profile.name)?;
        if let Ok(existing) = read_profile(&dir.join(PROFILE_FILE)) {
            if existing.name.trim() != profile.name.trim() {
                return Err(CoreError::ProfileNameTaken {
                    requested: profile.name.clone(),
                    existing: existing.name,
                }
                .into());
            }
        }
        fs::create_dir_all(&dir).with_context(|| format!("create {:?}", dir))?;
        let raw = serde_json::to_string_pretty(profile).context("serialize profile")?;
        fsutil::write_atomic_text(&dir.join(PROFILE_FILE), &raw).context("write profile")?;
        fsutil::write_atomic_text(
            &dir.join(self.orders.file_name()),
            &render_order(&profile.order_entries()),
        )
        .context("write profile order file")?;
        debug!(context = %self.context, name = %profile.name, "profile saved");
        self.events.emit(CoreEvent::ProfileSaved {
            context: self.context.clone(),
            name: profile.name.clone(),
        });
        Ok(dir)
    }

    /// Best effort: a directory that cannot be removed (locked file) is
    /// logged and `false` is returned.
    pub fn delete(&self, name: &str) -> Result<bool> {
        let dir = self.profile_dir(name)?;
        if !dir.exists() {
            return Ok(false);
        }
        if let Err(err) = fs::remove_dir_all(&dir) {
            warn!(path = ?dir, "profile delete failed: {err}");
            return Ok(false);
        }
        info!(context = %self.context, name, "profile deleted");
        self.events.emit(CoreEvent::ProfileDeleted {
            context: self.context.clone(),
            name: name.to_string(),
        });
        Ok(true)
    }

    /// Snapshot of the collection as held; externally managed units are left
    /// out.
    pub fn create_from_current_state(&self, name: &str, units: &[ModUnit]) -> Profile {
        let mut profile = Profile::new(name);
        for unit in units.iter().filter(|unit| !unit.is_externally_managed) {
            profile.load_order.push(unit.id.clone());
            if unit.is_enabled {
                profile.active_ids.insert(unit.id.clone());
            }
            if unit.has_separator_after {
                profile.separator_ids.insert(unit.id.clone());
            }
        }
        profile
    }

    /// Reorders `units` to the profile. Units the profile does not list
    /// follow in their previous relative order; externally managed units
    /// keep their state and go last.
    pub fn apply(&self, profile: &Profile, units: &mut Vec<ModUnit>) {
        let mut remaining: Vec<Option<ModUnit>> = units.drain(..).map(Some).collect();
        let mut ordered = Vec::with_capacity(remaining.len());

        for id in &profile.load_order {
            let found = remaining.iter_mut().find(|slot| {
                slot.as_ref()
                    .is_some_and(|unit| !unit.is_externally_managed && unit.id == *id)
            });
            if let Some(unit) = found.and_then(Option::take) {
                ordered.push(unit);
            }
        }
        let (external, unlisted): (Vec<ModUnit>, Vec<ModUnit>) = remaining
            .into_iter()
            .flatten()
            .partition(|unit| unit.is_externally_managed);
        ordered.extend(unlisted);

        for (index, unit) in ordered.iter_mut().enumerate() {
            unit.number = index + 1;
            unit.is_enabled = profile.active_ids.contains(&unit.id);
            unit.has_separator_after = profile.separator_ids.contains(&unit.id);
        }
        for mut unit in external {
            unit.number = 0;
            ordered.push(unit);
        }
        *units = ordered;
    }

    /// Projects the live order into whichever order file is authoritative in
    /// `folder`.
    pub fn write_to_game_folder(&self, folder: &Path, units: &[ModUnit]) -> Result<()> {
        let entries: Vec<OrderEntry> = units
            .iter()
            .filter(|unit| !unit.is_externally_managed)
            .map(|unit| OrderEntry::new(&unit.id, unit.is_enabled))
            .collect();
        self.orders.write_order(folder, &entries)
    }

    pub fn ensure_default_profile(&self, units: &[ModUnit]) -> Result<Profile> {
        if let Some(existing) = self.load(DEFAULT_PROFILE)? {
            return Ok(existing);
        }
        let profile = self.create_from_current_state(DEFAULT_PROFILE, units);
        self.save(&profile)?;
        info!(context = %self.context, "created default profile");
        Ok(profile)
    }

    /// Rewrites `old_id` to `new_id` in every profile of this context.
    /// Returns how many profiles changed.
    pub fn migrate_id(&self, old_id: &str, new_id: &str) -> Result<usize> {
        let mut changed = 0;
        for mut profile in self.list()? {
            if profile.rename_id(old_id, new_id) {
                profile.last_modified = OffsetDateTime::now_utc();
                self.save(&profile)?;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

fn read_profile(path: &Path) -> Result<Profile> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order_file::read_order_file;
    use crate::prompt::Headless;
    use tempfile::TempDir;

    fn service(dir: &Path) -> (CoreConfig, ProfilesService) {
        let config = CoreConfig::with_base(dir);
        let orders = Arc::new(OrderFileManager::new(&config, Arc::new(Headless)));
        let service = ProfilesService::new(&config, orders, "Main Game").unwrap();
        (config, service)
    }

    fn units(layout: &[(&str, bool)]) -> Vec<ModUnit> {
        layout.iter()
            .enumerate()
            .map(|(index, (id, enabled))| {
                let mut unit = ModUnit::new(id, id, "1.0", PathBuf::from(id));
                unit.number = index + 1;
                unit.is_enabled = *enabled;
                unit
            })
            .collect()
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_name("My: Profile/1").unwrap(), "My_ Profile_1");
        assert_eq!(sanitize_name("  spaced  ").unwrap(), "spaced");
        assert!(sanitize_name("   ").is_err());
        assert!(sanitize_name("..").is_err());
    }

    #[test]
    fn save_list_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let (config, service) = service(dir.path());
        let profile = service.create_from_current_state("Run 1", &units(&[("a", true), ("b", false)]));
        let saved = service.save(&profile).unwrap();
        assert_eq!(saved, config.profiles_root.join("Main Game").join("Run 1"));

        let raw = fs::read_to_string(saved.join("profile.json")).unwrap();
        assert!(raw.contains("\"ActiveIds\""));
        assert!(raw.contains("\"LastModified\""));
        assert_eq!(
            read_order_file(&saved.join("modlist.txt")).unwrap(),
            vec![OrderEntry::new("a", true), OrderEntry::new("b", false)]
        );

        assert_eq!(service.list().unwrap(), vec![profile.clone()]);
        assert_eq!(service.load("Run 1").unwrap(), Some(profile));
        assert_eq!(service.load("Nope").unwrap(), None);
    }

    #[test]
    fn corrupt_profiles_are_skipped_or_quarantined() {
        let dir = TempDir::new().unwrap();
        let (_config, service) = service(dir.path());
        service.save(&Profile::new("Good")).unwrap();
        let bad = service.profile_dir("Bad").unwrap();
        fs::create_dir_all(&bad).unwrap();
        fs::write(bad.join("profile.json"), "{oops").unwrap();

        let names: Vec<String> = service.list().unwrap().into_iter().map(|p| p.name).collect();
        assert_eq!(names, vec!["Good".to_string()]);

        assert_eq!(service.load("Bad").unwrap(), None);
        assert!(!bad.join("profile.json").exists());
    }

    #[test]
    fn names_sharing_a_directory_do_not_overwrite_each_other() {
        let dir = TempDir::new().unwrap();
        let (_config, service) = service(dir.path());
        let first = service.create_from_current_state("a/b", &units(&[("x", true)]));
        service.save(&first).unwrap();

        let second = service.create_from_current_state("a_b", &units(&[("y", true)]));
        let err = service.save(&second).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::ProfileNameTaken { .. })
        ));
        assert_eq!(service.load("a/b").unwrap(), Some(first));
        assert_eq!(service.load("a_b").unwrap(), None);
    }

    #[test]
    fn active_profile_follows_changes() {
        let dir = TempDir::new().unwrap();
        let (mut config, service) = service(dir.path());
        assert_eq!(service.active_name(), DEFAULT_PROFILE);
        service.save_active(&units(&[("a", true)])).unwrap();
        let stored = service.load(DEFAULT_PROFILE).unwrap().unwrap();
        assert_eq!(stored.load_order, vec!["a"]);

        config.set_active_profile("Main Game", "Run");
        let orders = Arc::new(OrderFileManager::new(&config, Arc::new(Headless)));
        let mut service = ProfilesService::new(&config, orders, "Main Game").unwrap();
        assert_eq!(service.active_name(), "Run");
        service
            .save_active(&units(&[("a", true), ("b", false)]))
            .unwrap();
        let run = service.load("Run").unwrap().unwrap();
        assert_eq!(run.load_order, vec!["a", "b"]);
        assert_eq!(run.active_ids, BTreeSet::from(["a".to_string()]));

        assert!(service.set_active("  ").is_err());
        service.set_active("Other").unwrap();
        service.save_active(&units(&[("c", true)])).unwrap();
        assert_eq!(service.load("Run").unwrap().unwrap().load_order, vec!["a", "b"]);
        assert_eq!(service.load("Other").unwrap().unwrap().load_order, vec!["c"]);
    }

    #[test]
    fn delete_is_best_effort() {
        let dir = TempDir::new().unwrap();
        let (_config, service) = service(dir.path());
        service.save(&Profile::new("Temp")).unwrap();
        assert!(service.delete("Temp").unwrap());
        assert!(!service.delete("Temp").unwrap());
        assert!(service.list().unwrap().is_empty());
    }

    #[test]
    fn snapshot_skips_external_units() {
        let dir = TempDir::new().unwrap();
        let (_config, service) = service(dir.path());
        let mut all = units(&[("a", true), ("ext", true), ("b", false)]);
        all[1].is_externally_managed = true;
        all[2].has_separator_after = true;
        let profile = service.create_from_current_state("S", &all);
        assert_eq!(profile.load_order, vec!["a", "b"]);
        assert_eq!(profile.active_ids, BTreeSet::from(["a".to_string()]));
        assert_eq!(profile.separator_ids, BTreeSet::from(["b".to_string()]));
    }

    #[test]
    fn apply_reorders_and_appends_unlisted() {
        let dir = TempDir::new().unwrap();
        let (_config, service) = service(dir.path());
        let mut all = units(&[("a", true), ("b", true), ("c", true), ("d", false)]);
        all[1].is_externally_managed = true;
        let mut profile = Profile::new("P");
        profile.load_order = vec!["d".to_string(), "ghost".to_string(), "a".to_string()];
        profile.active_ids = BTreeSet::from(["d".to_string()]);

        service.apply(&profile, &mut all);
        let summary: Vec<(&str, usize, bool)> = all
            .iter()
            .map(|unit| (unit.id.as_str(), unit.number, unit.is_enabled))
            .collect();
        assert_eq!(
            summary,
            vec![("d", 1, true), ("a", 2, false), ("c", 3, false), ("b", 0, true)]
        );
    }

    #[test]
    fn write_to_game_folder_respects_tracking() {
        let dir = TempDir::new().unwrap();
        let (config, service) = service(dir.path());
        let folder = config.mods_root.clone();
        fs::create_dir_all(&folder).unwrap();
        let mut all = units(&[("a", true), ("b", false), ("ext", true)]);
        all[2].is_externally_managed = true;

        service.write_to_game_folder(&folder, &all).unwrap();
        assert_eq!(
            read_order_file(&folder.join("modlist.txt")).unwrap(),
            vec![OrderEntry::new("a", true), OrderEntry::new("b", false)]
        );

        service.orders.apply_setting(false, &folder).unwrap();
        fs::write(folder.join("modlist.txt"), "stray\n").unwrap();
        service.write_to_game_folder(&folder, &all[..1]).unwrap();
        assert!(!folder.join("modlist.txt").exists());
        assert_eq!(
            read_order_file(&folder.join("modlist.txt.bak")).unwrap(),
            vec![OrderEntry::new("a", true)]
        );
    }

    #[test]
    fn default_profile_matches_current_state_once() {
        let dir = TempDir::new().unwrap();
        let (_config, service) = service(dir.path());
        let current = units(&[("x", true), ("y", false), ("z", true)]);
        let created = service.ensure_default_profile(&current).unwrap();
        assert_eq!(created.name, DEFAULT_PROFILE);
        assert_eq!(created.load_order, vec!["x", "y", "z"]);
        assert_eq!(
            created.active_ids,
            BTreeSet::from(["x".to_string(), "z".to_string()])
        );

        let again = service
            .ensure_default_profile(&units(&[("other", true)]))
            .unwrap();
        assert_eq!(again, created);
        assert_eq!(service.list().unwrap().len(), 1);
    }

    #[test]
    fn migrate_id_rewrites_every_profile() {
        let dir = TempDir::new().unwrap();
        let (_config, service) = service(dir.path());
        let mut first = units(&[("old", true), ("keep", false)]);
        first[0].has_separator_after = true;
        service
            .save(&service.create_from_current_state("One", &first))
            .unwrap();
        service
            .save(&service.create_from_current_state("Two", &units(&[("keep", true)])))
            .unwrap();

        assert_eq!(service.migrate_id("old", "new").unwrap(), 1);
        let one = service.load("One").unwrap().unwrap();
        assert_eq!(one.load_order, vec!["new", "keep"]);
        assert!(one.active_ids.contains("new"));
        assert!(one.separator_ids.contains("new"));
        let order = read_order_file(&service.profile_dir("One").unwrap().join("modlist.txt")).unwrap();
        assert_eq!(order[0], OrderEntry::new("new", true));
    }
}
