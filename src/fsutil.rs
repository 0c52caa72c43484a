use anyhow::{Context, Result};
use filetime::{set_file_mtime, FileTime};
use std::{
    ffi::OsString,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use walkdir::WalkDir;

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Write next to the target, flush, then rename over it. Readers see the old
/// file or the new one, never a torn write.
pub fn write_atomic_text(path: &Path, contents: &str) -> Result<()> {
    write_atomic_bytes(path, contents.as_bytes())
}

pub fn write_atomic_bytes(path: &Path, contents: &[u8]) -> Result<()> {
    let parent = path.parent().context("atomic write parent dir")?;
    fs::create_dir_all(parent).context("create parent dir")?;
    let file_name = path.file_name().context("atomic write filename")?;
    let mut temp_name = OsString::from(file_name);
    temp_name.push(".tmp");
    let mut temp_path = parent.join(temp_name);
    if temp_path.exists() {
        let mut temp_name = OsString::from(file_name);
        temp_name.push(format!(".{}.tmp", unique_stamp()));
        temp_path = parent.join(temp_name);
    }

    let written = (|| -> Result<()> {
        let mut file = fs::File::create(&temp_path).context("create temp file")?;
        file.write_all(contents).context("write temp file")?;
        file.sync_all().context("flush temp file")?;
        Ok(())
    })();
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(err);
    }
    if let Err(err) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(err).with_context(|| format!("finalize {:?}", path));
    }
    Ok(())
}

/// Removes the directory on drop.
pub struct TempDirGuard {
    path: PathBuf,
}

impl TempDirGuard {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

pub fn make_temp_dir(temp_root: &Path, suffix: &str) -> Result<TempDirGuard> {
    fs::create_dir_all(temp_root).context("create temp root")?;
    let name = format!("work-{}-{}", unique_stamp(), sanitize_label(suffix));
    let temp_dir = temp_root.join(name);
    fs::create_dir_all(&temp_dir).context("create temp dir")?;
    Ok(TempDirGuard::new(temp_dir))
}

fn unique_stamp() -> String {
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos}-{}-{counter}", std::process::id())
}

fn sanitize_label(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

pub fn is_ignored_path(path: &Path) -> bool {
    path.components().any(|component| {
        let part = component.as_os_str().to_string_lossy();
        part.eq_ignore_ascii_case("__MACOSX")
            || part.eq_ignore_ascii_case(".ds_store")
            || part.eq_ignore_ascii_case("thumbs.db")
            || part == ".git"
            || part == ".svn"
    })
}

/// Recursive copy of `source` into `dest`, skipping `skip` and junk entries.
/// Returns the number of files copied.
pub fn copy_dir(source: &Path, dest: &Path, skip: Option<&Path>) -> Result<usize> {
    let mut copied = 0usize;
    for entry in WalkDir::new(source)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            !is_ignored_path(entry.path()) && skip.map_or(true, |skip| entry.path() != skip)
        })
    {
        let entry = entry?;
        let rel = entry.path().strip_prefix(source).context("rel path")?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).context("create dir")?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).context("create file dir")?;
            }
            fs::copy(entry.path(), &target)
                .with_context(|| format!("copy {:?}", entry.path()))?;
            preserve_mtime(entry.path(), &target);
            copied += 1;
        }
    }
    Ok(copied)
}

/// Rename when possible, copy + remove when the rename crosses devices.
pub fn move_file(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).context("create move target dir")?;
    }
    if fs::rename(source, dest).is_ok() {
        return Ok(());
    }
    fs::copy(source, dest).with_context(|| format!("copy {:?}", source))?;
    preserve_mtime(source, dest);
    fs::remove_file(source).with_context(|| format!("remove {:?}", source))?;
    Ok(())
}

pub fn preserve_mtime(source: &Path, dest: &Path) {
    let Ok(meta) = fs::metadata(source) else {
        return;
    };
    let Ok(modified) = meta.modified() else {
        return;
    };
    let mtime = FileTime::from_system_time(modified);
    let _ = set_file_mtime(dest, mtime);
}

pub fn file_name_string(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_replaces_and_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("file.json");
        write_atomic_text(&path, "one").unwrap();
        write_atomic_text(&path, "two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .flatten()
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn temp_guard_cleans_up_on_drop() {
        let dir = TempDir::new().unwrap();
        let dropped = {
            let guard = make_temp_dir(dir.path(), "drop me").unwrap();
            fs::write(guard.path().join("x"), "x").unwrap();
            guard.path().to_path_buf()
        };
        assert!(!dropped.exists());
        assert!(dir.path().exists());
    }

    #[test]
    fn copy_dir_skips_junk_and_excluded_path() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("__MACOSX")).unwrap();
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("__MACOSX").join("x"), "x").unwrap();
        fs::write(src.join("sub").join("a.pak"), "a").unwrap();
        fs::write(src.join("skip.xml"), "s").unwrap();
        let dest = dir.path().join("dest");
        let copied = copy_dir(&src, &dest, Some(&src.join("skip.xml"))).unwrap();
        assert_eq!(copied, 1);
        assert!(dest.join("sub").join("a.pak").exists());
        assert!(!dest.join("skip.xml").exists());
        assert!(!dest.join("__MACOSX").exists());
    }
}
