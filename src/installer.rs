//! Turning archives and folders into units under `mods_root/<id>`, and
//! reading them back.

use crate::{
    backup,
    config::CoreConfig,
    error::{check_cancelled, CoreError},
    events::{CoreEvent, EventSink},
    extract::Extractor,
    fsutil::{self, TempDirGuard},
    manifest::{self, ManifestInfo},
    order_file::{OrderEntry, OrderFileManager},
    prompt::{NoticeLevel, Prompt},
    unit::{CategoryTable, ModUnit, NotesTable, VersionRecord, VersionTable, UNKNOWN_UPSTREAM},
    version::{compare_versions, SourceFileName},
};
use anyhow::{Context, Result};
use std::{
    cmp::Ordering,
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Expected reasons an install does not happen. Nothing durable changed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallRejection {
    #[error("no upstream number in the file name and none was supplied")]
    MissingUpstreamNumber,
    #[error("no manifest and no packed files")]
    Incompatible,
    #[error("manifest has no usable name, version or id")]
    InvalidManifest,
    #[error("{id} {installed} is already installed (incoming {incoming})")]
    NotNewer {
        id: String,
        installed: String,
        incoming: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    Installed(ModUnit),
    Rejected(InstallRejection),
}

impl InstallOutcome {
    pub fn unit(&self) -> Option<&ModUnit> {
        match self {
            InstallOutcome::Installed(unit) => Some(unit),
            InstallOutcome::Rejected(_) => None,
        }
    }
}

/// A manifest located (or synthesized) inside an extraction directory.
struct Staged {
    manifest_path: PathBuf,
    info: ManifestInfo,
}

#[derive(Clone)]
pub struct Installer {
    config: Arc<CoreConfig>,
    extractor: Arc<dyn Extractor>,
    prompt: Arc<dyn Prompt>,
    orders: Arc<OrderFileManager>,
    events: EventSink,
}

impl Installer {
    pub fn new(
        config: Arc<CoreConfig>,
        extractor: Arc<dyn Extractor>,
        prompt: Arc<dyn Prompt>,
        orders: Arc<OrderFileManager>,
    ) -> Self {
        Self {
            config,
            extractor,
            prompt,
            orders,
            events: EventSink::default(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn orders(&self) -> &Arc<OrderFileManager> {
        &self.orders
    }

    pub fn install_archive(
        &self,
        archive: &Path,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome> {
        check_cancelled(cancel)?;
        let source_file_name = fsutil::file_name_string(archive);
        let temp = self.extract_to_temp(archive)?;
        check_cancelled(cancel)?;

        let parsed = SourceFileName::parse(&source_file_name);
        let upstream_number = match parsed.upstream_number {
            Some(number) => number,
            None => match self.prompt.request_number(
                "Upstream number",
                &format!(
                    "No upstream number could be read from {source_file_name}. Enter it to continue."
                ),
            ) {
                Some(number) => number,
                None => {
                    return Ok(self.rejected(archive, InstallRejection::MissingUpstreamNumber))
                }
            },
        };

        let staged = match self.stage(temp.path(), &source_file_name)? {
            Ok(staged) => staged,
            Err(rejection) => return Ok(self.rejected(archive, rejection)),
        };
        let id = staged.info.id.clone();
        let target = self.config.mods_root.join(&id);

        if let Some(rejection) = self.downgrade_guard(&target, &staged.info) {
            return Ok(self.rejected(archive, rejection));
        }

        check_cancelled(cancel)?;
        if target.exists() {
            fs::remove_dir_all(&target)
                .with_context(|| format!("remove previous install {:?}", target))?;
        }
        self.place(&staged.manifest_path, &target)?;

        let record = VersionRecord {
            version: staged.info.version.clone(),
            upstream_number,
            source_file_name,
            update_checks_enabled: self.config.update_checks_default,
        };
        self.save_version_record(&id, record.clone())?;

        let unit = self.unit_from_manifest(&staged.info, target, &record);
        info!(id = %unit.id, version = %unit.version, "installed");
        self.events.emit(CoreEvent::UnitInstalled { id: unit.id.clone() });
        Ok(InstallOutcome::Installed(unit))
    }

    /// Installs a loose folder. The id is always derived from the declared
    /// name and an existing unit with that id is replaced regardless of
    /// version.
    pub fn install_folder(
        &self,
        folder: &Path,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome> {
        check_cancelled(cancel)?;
        let source_name = fsutil::file_name_string(folder);
        let temp = fsutil::make_temp_dir(&self.config.temp_root(), &source_name)?;
        fsutil::copy_dir(folder, temp.path(), None)
            .with_context(|| format!("stage folder {:?}", folder))?;
        check_cancelled(cancel)?;

        let staged = match self.stage(temp.path(), &source_name)? {
            Ok(staged) => staged,
            Err(rejection) => return Ok(self.rejected(folder, rejection)),
        };
        let id = manifest::generate_id(&staged.info.name);
        manifest::ensure_id(&staged.manifest_path, &id).context("store regenerated id")?;
        let info = ManifestInfo {
            id: id.clone(),
            has_explicit_id: true,
            ..staged.info
        };
        let target = self.config.mods_root.join(&id);

        check_cancelled(cancel)?;
        if target.exists() {
            fs::remove_dir_all(&target)
                .with_context(|| format!("remove previous install {:?}", target))?;
        }
        self.place(&staged.manifest_path, &target)?;

        let parsed = SourceFileName::parse(&source_name);
        let record = VersionRecord {
            version: info.version.clone(),
            upstream_number: parsed.upstream_number.unwrap_or(UNKNOWN_UPSTREAM),
            source_file_name: source_name,
            update_checks_enabled: self.config.update_checks_default,
        };
        self.save_version_record(&id, record.clone())?;

        let unit = self.unit_from_manifest(&info, target, &record);
        info!(id = %unit.id, version = %unit.version, "installed folder");
        self.events.emit(CoreEvent::UnitInstalled { id: unit.id.clone() });
        Ok(InstallOutcome::Installed(unit))
    }

    /// Lays a newer archive over an installed unit, keeping `original_id`
    /// whatever the new manifest declares.
    pub fn install_update(
        &self,
        archive: &Path,
        original_id: &str,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome> {
        check_cancelled(cancel)?;
        let target = self.config.mods_root.join(original_id);
        if !target.is_dir() {
            return Err(CoreError::UnitNotFound(original_id.to_string()).into());
        }
        let source_file_name = fsutil::file_name_string(archive);
        let temp = self.extract_to_temp(archive)?;
        check_cancelled(cancel)?;

        let staged = match self.stage(temp.path(), &source_file_name)? {
            Ok(staged) => staged,
            Err(rejection) => return Ok(self.rejected(archive, rejection)),
        };
        let content_root = staged
            .manifest_path
            .parent()
            .context("manifest parent")?
            .to_path_buf();

        check_cancelled(cancel)?;
        // The old manifest stays until the new content is in place.
        hoist_into(&content_root, &target, Some(&staged.manifest_path))?;
        manifest::ensure_id(&staged.manifest_path, original_id).context("restore original id")?;
        let manifest_path = target.join(&self.config.manifest_file_name);
        fsutil::move_file(&staged.manifest_path, &manifest_path).context("swap manifest")?;
        self.remove_stale_manifests(&target)?;
        if content_root != temp.path() {
            if let Err(err) = fs::remove_dir(&content_root) {
                debug!(path = ?content_root, "left extraction dir behind: {err}");
            }
        }

        let info = ManifestInfo {
            id: original_id.to_string(),
            has_explicit_id: true,
            ..staged.info
        };
        let mut versions = VersionTable::load(&self.config.versions_path())?;
        let previous_upstream = versions
            .get(original_id)
            .map(|record| record.upstream_number)
            .unwrap_or(UNKNOWN_UPSTREAM);
        let previous_checks = versions
            .get(original_id)
            .map(|record| record.update_checks_enabled)
            .unwrap_or(self.config.update_checks_default);
        let record = VersionRecord {
            version: info.version.clone(),
            upstream_number: SourceFileName::parse(&source_file_name)
                .upstream_number
                .unwrap_or(previous_upstream),
            source_file_name,
            update_checks_enabled: previous_checks,
        };
        versions.insert(original_id, record.clone());
        versions.save(&self.config.versions_path())?;

        let unit = self.unit_from_manifest(&info, target, &record);
        info!(id = %unit.id, version = %unit.version, "updated");
        self.events.emit(CoreEvent::UnitUpdated { id: unit.id.clone() });
        Ok(InstallOutcome::Installed(unit))
    }

    pub async fn install_archive_async(
        &self,
        archive: PathBuf,
        cancel: CancellationToken,
    ) -> Result<InstallOutcome> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.install_archive(&archive, &cancel))
            .await
            .context("install task")?
    }

    /// Every unit on disk in load order: order-file entries first, then
    /// unlisted units by folder name, then externally managed units.
    pub fn load(&self, cancel: &CancellationToken) -> Result<Vec<ModUnit>> {
        check_cancelled(cancel)?;
        let mut scanned = Vec::new();
        if self.config.mods_root.exists() {
            for dir in sorted_subdirs(&self.config.mods_root)? {
                check_cancelled(cancel)?;
                if let Some(unit) = self.scan_managed(&dir) {
                    scanned.push(unit);
                }
            }
        }

        let root = &self.config.mods_root;
        let placed: HashSet<String> = scanned
            .iter()
            .filter(|unit| unit.path == root.join(&unit.id))
            .map(|unit| unit.id.clone())
            .collect();
        let mut seen = HashSet::new();
        scanned.retain(|unit| {
            let misplaced = unit.path != root.join(&unit.id);
            if !(misplaced && placed.contains(&unit.id)) && seen.insert(unit.id.clone()) {
                return true;
            }
            self.prompt.notify(
                NoticeLevel::Warn,
                &format!(
                    "{} declares id {} which is already taken; it was not loaded.",
                    unit.path.display(),
                    unit.id
                ),
            );
            false
        });

        let order = self.orders.read_order(&self.config.mods_root)?;
        let mut by_id: HashMap<String, ModUnit> = scanned
            .into_iter()
            .map(|unit| (unit.id.clone(), unit))
            .collect();
        let mut units = Vec::with_capacity(by_id.len());
        for entry in &order {
            if let Some(mut unit) = by_id.remove(&entry.id) {
                unit.number = units.len() + 1;
                unit.is_enabled = entry.enabled;
                units.push(unit);
            } else {
                debug!(id = %entry.id, "order entry without unit");
            }
        }
        let mut unlisted: Vec<ModUnit> = by_id.into_values().collect();
        unlisted.sort_by(|left, right| left.path.cmp(&right.path));
        units.extend(unlisted);

        for root in &self.config.external_roots {
            if !root.exists() {
                continue;
            }
            for dir in sorted_subdirs(root)? {
                check_cancelled(cancel)?;
                if let Some(mut unit) = self.scan_unit(&dir, false) {
                    unit.is_externally_managed = true;
                    unit.is_enabled = true;
                    units.push(unit);
                }
            }
        }

        self.merge_side_tables(&mut units)?;
        debug!(count = units.len(), "units loaded");
        Ok(units)
    }

    pub async fn load_async(&self, cancel: CancellationToken) -> Result<Vec<ModUnit>> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.load(&cancel))
            .await
            .context("load task")?
    }

    /// Writes the order file from the collection as held: slice order is
    /// load order. Externally managed units are left out.
    pub fn save_order(&self, units: &[ModUnit]) -> Result<()> {
        let entries: Vec<OrderEntry> = units
            .iter()
            .filter(|unit| !unit.is_externally_managed)
            .map(|unit| OrderEntry::new(&unit.id, unit.is_enabled))
            .collect();
        self.orders.write_order(&self.config.mods_root, &entries)
    }

    pub fn save_version_record(&self, id: &str, record: VersionRecord) -> Result<()> {
        let path = self.config.versions_path();
        let mut table = VersionTable::load(&path)?;
        table.insert(id, record);
        table.save(&path)
    }

    pub fn save_notes(&self, units: &[ModUnit]) -> Result<()> {
        let path = self.config.notes_path();
        let mut table = NotesTable::load(&path)?;
        for unit in units {
            match unit.note.as_deref().map(str::trim) {
                Some(note) if !note.is_empty() => table.insert(&unit.id, note.to_string()),
                _ => {
                    table.remove(&unit.id);
                }
            }
        }
        table.save(&path)?;
        self.events.emit(CoreEvent::NotesChanged);
        Ok(())
    }

    pub fn save_categories(&self, units: &[ModUnit]) -> Result<()> {
        let path = self.config.categories_path();
        let mut table = CategoryTable::load(&path)?;
        for unit in units {
            match unit.category_id {
                Some(category) => table.insert(&unit.id, category),
                None => {
                    table.remove(&unit.id);
                }
            }
        }
        table.save(&path)?;
        self.events.emit(CoreEvent::CategoriesChanged);
        Ok(())
    }

    pub fn create_backup(&self, reason: Option<&str>) -> Result<PathBuf> {
        backup::create_backup(&self.config, reason)
    }

    /// Renames a unit and moves its id everywhere the core stores it:
    /// folder, manifest, side tables and order file. Profiles are migrated
    /// separately.
    pub fn rename_unit(&self, units: &mut [ModUnit], id: &str, new_name: &str) -> Result<ModUnit> {
        let index = self.managed_index(units, id)?;
        let new_name = new_name.trim();
        let new_id = manifest::generate_id(new_name);
        let old_path = units[index].path.clone();
        let manifest_path = manifest::find_manifest(&old_path, &self.config.manifest_file_name)
            .with_context(|| format!("manifest for {id}"))?;

        if new_id == id {
            manifest::update_name_and_id(&manifest_path, new_name, &new_id)?;
            units[index].name = new_name.to_string();
            return Ok(units[index].clone());
        }

        let new_path = self.config.mods_root.join(&new_id);
        if new_path.exists() {
            self.prompt.notify(
                NoticeLevel::Error,
                &format!(
                    "Cannot rename {id} to {new_id}: {} already exists.",
                    new_path.display()
                ),
            );
            return Err(CoreError::TargetExists(new_path).into());
        }

        fs::rename(&old_path, &new_path)
            .with_context(|| format!("rename {:?} -> {:?}", old_path, new_path))?;
        let rel = manifest_path.strip_prefix(&old_path).context("manifest path")?;
        manifest::update_name_and_id(&new_path.join(rel), new_name, &new_id)?;
        self.rekey_side_tables(id, &new_id)?;

        let unit = &mut units[index];
        unit.id = new_id.clone();
        unit.name = new_name.to_string();
        unit.path = new_path;
        let renamed = unit.clone();
        self.save_order(units)?;

        info!(old_id = id, new_id = %new_id, "unit renamed");
        self.events.emit(CoreEvent::UnitRenamed {
            old_id: id.to_string(),
            new_id,
        });
        Ok(renamed)
    }

    pub fn delete_unit(&self, units: &mut Vec<ModUnit>, id: &str) -> Result<ModUnit> {
        let index = self.managed_index(units, id)?;
        let path = units[index].path.clone();
        if path.exists() {
            fs::remove_dir_all(&path).with_context(|| format!("delete {:?}", path))?;
        }
        let removed = units.remove(index);

        let mut versions = VersionTable::load(&self.config.versions_path())?;
        if versions.remove(id).is_some() {
            versions.save(&self.config.versions_path())?;
        }
        let mut notes = NotesTable::load(&self.config.notes_path())?;
        if notes.remove(id).is_some() {
            notes.save(&self.config.notes_path())?;
        }
        let mut categories = CategoryTable::load(&self.config.categories_path())?;
        if categories.remove(id).is_some() {
            categories.save(&self.config.categories_path())?;
        }

        let mut number = 0;
        for unit in units.iter_mut().filter(|unit| unit.number > 0) {
            number += 1;
            unit.number = number;
        }
        self.save_order(units)?;
        info!(id, "unit deleted");
        self.events.emit(CoreEvent::UnitDeleted { id: id.to_string() });
        Ok(removed)
    }

    fn managed_index(&self, units: &[ModUnit], id: &str) -> Result<usize> {
        let index = units
            .iter()
            .position(|unit| unit.id == id)
            .ok_or_else(|| CoreError::UnitNotFound(id.to_string()))?;
        if units[index].is_externally_managed {
            self.prompt.notify(
                NoticeLevel::Warn,
                &format!("{id} is managed by another platform and cannot be changed here."),
            );
            return Err(CoreError::ExternallyManaged(id.to_string()).into());
        }
        Ok(index)
    }

    fn rekey_side_tables(&self, old_id: &str, new_id: &str) -> Result<()> {
        let mut versions = VersionTable::load(&self.config.versions_path())?;
        if versions.rekey(old_id, new_id) {
            versions.save(&self.config.versions_path())?;
        }
        let mut notes = NotesTable::load(&self.config.notes_path())?;
        if notes.rekey(old_id, new_id) {
            notes.save(&self.config.notes_path())?;
        }
        let mut categories = CategoryTable::load(&self.config.categories_path())?;
        if categories.rekey(old_id, new_id) {
            categories.save(&self.config.categories_path())?;
        }
        Ok(())
    }

    fn extract_to_temp(&self, archive: &Path) -> Result<TempDirGuard> {
        if !archive.is_file() {
            return Err(CoreError::SourceMissing(archive.to_path_buf()).into());
        }
        let label = archive
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        let temp = fsutil::make_temp_dir(&self.config.temp_root(), &label)?;
        self.extractor
            .extract(archive, temp.path())
            .with_context(|| format!("extract {:?}", archive))?;
        Ok(temp)
    }

    /// Finds or synthesizes the manifest inside an extraction directory and
    /// parses it, offering one regeneration when it is unusable.
    fn stage(&self, root: &Path, source_name: &str) -> Result<Result<Staged, InstallRejection>> {
        let manifest_name = &self.config.manifest_file_name;
        let manifest_path = match manifest::find_manifest(root, manifest_name) {
            Some(path) => path,
            None => match self.shallowest_packed_dir(root) {
                Some(dir) => manifest::generate(&dir, Some(source_name), manifest_name)?,
                None => return Ok(Err(InstallRejection::Incompatible)),
            },
        };

        let info = match manifest::parse(&manifest_path, true) {
            Some(info) => info,
            None => {
                let regenerate = self.prompt.confirm(
                    "Invalid manifest",
                    &format!(
                        "{} has no usable name or version. Regenerate it from {source_name}?",
                        fsutil::file_name_string(&manifest_path)
                    ),
                );
                if !regenerate {
                    return Ok(Err(InstallRejection::InvalidManifest));
                }
                let dir = manifest_path.parent().context("manifest parent")?;
                fs::remove_file(&manifest_path).context("remove invalid manifest")?;
                let regenerated = manifest::generate(dir, Some(source_name), manifest_name)?;
                match manifest::parse(&regenerated, true) {
                    Some(info) => {
                        return Ok(Ok(Staged {
                            manifest_path: regenerated,
                            info,
                        }))
                    }
                    None => return Ok(Err(InstallRejection::InvalidManifest)),
                }
            }
        };
        if !is_safe_id(&info.id) {
            warn!(id = %info.id, "manifest id is not usable as a folder name");
            return Ok(Err(InstallRejection::InvalidManifest));
        }
        Ok(Ok(Staged {
            manifest_path,
            info,
        }))
    }

    /// Rejects when the installed unit's version is comparable and not older
    /// than the incoming one.
    fn downgrade_guard(&self, target: &Path, incoming: &ManifestInfo) -> Option<InstallRejection> {
        if !target.exists() {
            return None;
        }
        let installed = manifest::find_manifest(target, &self.config.manifest_file_name)
            .and_then(|path| manifest::read_info(&path))?;
        match compare_versions(&installed.version, &incoming.version) {
            Some(Ordering::Greater | Ordering::Equal) => Some(InstallRejection::NotNewer {
                id: incoming.id.clone(),
                installed: installed.version,
                incoming: incoming.version.clone(),
            }),
            Some(Ordering::Less) => None,
            None => {
                debug!(
                    installed = %installed.version,
                    incoming = %incoming.version,
                    "versions not comparable; allowing install"
                );
                None
            }
        }
    }

    /// Moves the manifest into `target` under its canonical name and copies
    /// everything beside it.
    fn place(&self, manifest_path: &Path, target: &Path) -> Result<()> {
        let content_root = manifest_path.parent().context("manifest parent")?;
        fs::create_dir_all(target).with_context(|| format!("create {:?}", target))?;
        fsutil::move_file(
            manifest_path,
            &target.join(&self.config.manifest_file_name),
        )
        .context("move manifest")?;
        let copied = fsutil::copy_dir(content_root, target, Some(manifest_path))
            .context("copy unit files")?;
        debug!(target = ?target, copied, "unit files placed");
        Ok(())
    }

    /// Drops manifest files whose name differs from the canonical one only
    /// by case.
    fn remove_stale_manifests(&self, dir: &Path) -> Result<()> {
        let canonical = dir.join(&self.config.manifest_file_name);
        let current = fs::read(&canonical).with_context(|| format!("read {:?}", canonical))?;
        for entry in fs::read_dir(dir).with_context(|| format!("read {:?}", dir))? {
            let path = entry.context("read entry")?.path();
            let name = fsutil::file_name_string(&path);
            // On case-insensitive filesystems the variant is the canonical file.
            if path.is_file()
                && name != self.config.manifest_file_name
                && name.eq_ignore_ascii_case(&self.config.manifest_file_name)
                && fs::read(&path).ok().as_ref() != Some(&current)
            {
                fs::remove_file(&path).with_context(|| format!("remove {:?}", path))?;
            }
        }
        Ok(())
    }

    fn shallowest_packed_dir(&self, root: &Path) -> Option<PathBuf> {
        WalkDir::new(root)
            .into_iter()
            .filter_entry(|entry| !fsutil::is_ignored_path(entry.path()))
            .flatten()
            .filter(|entry| entry.file_type().is_file() && self.config.is_packed_file(entry.path()))
            .min_by_key(|entry| entry.depth())
            .and_then(|entry| entry.path().parent().map(Path::to_path_buf))
    }

    fn has_packed_files(&self, dir: &Path) -> bool {
        self.shallowest_packed_dir(dir).is_some()
    }

    /// A unit folder under `mods_root`, renamed to its id when they differ.
    fn scan_managed(&self, dir: &Path) -> Option<ModUnit> {
        let mut unit = self.scan_unit(dir, true)?;
        let expected = self.config.mods_root.join(&unit.id);
        if unit.path == expected {
            return Some(unit);
        }
        match self.self_heal(&unit.path, &expected) {
            Ok(()) => {
                info!(from = ?unit.path, to = ?expected, "renamed unit folder to its id");
                unit.path = expected;
            }
            Err(err) => {
                warn!(path = ?unit.path, id = %unit.id, "self-heal rename failed: {err:#}");
                if let Some(CoreError::TargetExists(existing)) = err.downcast_ref::<CoreError>() {
                    self.prompt.notify(
                        NoticeLevel::Warn,
                        &format!(
                            "{} should be named {} but {} already exists.",
                            unit.path.display(),
                            unit.id,
                            existing.display()
                        ),
                    );
                }
            }
        }
        Some(unit)
    }

    fn self_heal(&self, current: &Path, expected: &Path) -> Result<()> {
        if expected.exists() {
            let same = match (fs::canonicalize(current), fs::canonicalize(expected)) {
                (Ok(left), Ok(right)) => left == right,
                _ => false,
            };
            if !same {
                return Err(CoreError::TargetExists(expected.to_path_buf()).into());
            }
            // Case-only rename on a case-insensitive filesystem.
            let hop = current.with_extension("renaming");
            fs::rename(current, &hop).context("rename to intermediate")?;
            fs::rename(&hop, expected).context("rename to id")?;
            return Ok(());
        }
        fs::rename(current, expected).context("rename to id")
    }

    fn scan_unit(&self, dir: &Path, write_back: bool) -> Option<ModUnit> {
        let manifest_name = &self.config.manifest_file_name;
        let manifest_path = match manifest::find_manifest(dir, manifest_name) {
            Some(path) => path,
            None if write_back && self.has_packed_files(dir) => {
                match manifest::generate(dir, None, manifest_name) {
                    Ok(path) => path,
                    Err(err) => {
                        warn!(path = ?dir, "generate manifest failed: {err:#}");
                        return None;
                    }
                }
            }
            None => {
                debug!(path = ?dir, "skipping folder without manifest");
                return None;
            }
        };
        let Some(info) = manifest::parse(&manifest_path, write_back) else {
            warn!(path = ?manifest_path, "skipping unit with invalid manifest");
            return None;
        };
        let mut unit = ModUnit::new(&info.id, &info.name, &info.version, dir.to_path_buf());
        unit.game_version = info.game_version;
        unit.update_checks_enabled = self.config.update_checks_default;
        Some(unit)
    }

    fn merge_side_tables(&self, units: &mut [ModUnit]) -> Result<()> {
        let versions = VersionTable::load(&self.config.versions_path())?;
        let notes = NotesTable::load(&self.config.notes_path())?;
        let categories = CategoryTable::load(&self.config.categories_path())?;
        for unit in units.iter_mut() {
            if let Some(record) = versions.get(&unit.id) {
                if unit.version.trim().is_empty() {
                    unit.version = record.version.clone();
                }
                unit.upstream_number = record.upstream_number;
                unit.update_checks_enabled = record.update_checks_enabled;
            }
            if let Some(note) = notes.get(&unit.id) {
                unit.note = Some(note.clone());
            }
            if let Some(category) = categories.get(&unit.id) {
                unit.category_id = Some(*category);
            }
        }
        Ok(())
    }

    fn unit_from_manifest(
        &self,
        info: &ManifestInfo,
        path: PathBuf,
        record: &VersionRecord,
    ) -> ModUnit {
        let mut unit = ModUnit::new(&info.id, &info.name, &info.version, path);
        unit.upstream_number = record.upstream_number;
        unit.update_checks_enabled = record.update_checks_enabled;
        unit.game_version = info.game_version.clone();
        unit
    }

    fn rejected(&self, source: &Path, rejection: InstallRejection) -> InstallOutcome {
        warn!(source = ?source, "install rejected: {rejection}");
        self.prompt.notify(
            NoticeLevel::Warn,
            &format!("{} was not installed: {rejection}.", fsutil::file_name_string(source)),
        );
        InstallOutcome::Rejected(rejection)
    }
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.starts_with('#')
        && !id.contains(['/', '\\', ':'])
        && !id.chars().any(char::is_control)
}

fn sorted_subdirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("read {:?}", root))? {
        let entry = entry.context("read dir entry")?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if path.is_dir() && !hidden && !fsutil::is_ignored_path(&path) {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Moves every child of `from` except `skip` into `to`, replacing what is
/// there.
fn hoist_into(from: &Path, to: &Path, skip: Option<&Path>) -> Result<()> {
    for entry in fs::read_dir(from).with_context(|| format!("read {:?}", from))? {
        let entry = entry.context("read entry")?;
        let source = entry.path();
        if fsutil::is_ignored_path(&source) || skip == Some(source.as_path()) {
            continue;
        }
        let dest = to.join(entry.file_name());
        if source.is_dir() {
            if dest.is_dir() {
                fsutil::copy_dir(&source, &dest, None)?;
                fs::remove_dir_all(&source).with_context(|| format!("remove {:?}", source))?;
                continue;
            }
            if dest.exists() {
                fs::remove_file(&dest).with_context(|| format!("replace {:?}", dest))?;
            }
            if fs::rename(&source, &dest).is_err() {
                fsutil::copy_dir(&source, &dest, None)?;
                fs::remove_dir_all(&source).with_context(|| format!("remove {:?}", source))?;
            }
        } else {
            if dest.is_dir() {
                fs::remove_dir_all(&dest).with_context(|| format!("replace {:?}", dest))?;
            }
            fsutil::move_file(&source, &dest)?;
        }
    }
    Ok(())
}
