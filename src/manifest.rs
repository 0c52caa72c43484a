//! The per-unit `modinfo.xml` document: parse, synthesize, rewrite, and the
//! id derivation every other component relies on.
//!
//! ```xml
//! <?xml version="1.0" encoding="utf-8"?>
//! <modinfo>
//!   <id>Better_Lamps</id>
//!   <name>Better Lamps</name>
//!   <version>1.2</version>
//!   <gameVersion>1.0.3</gameVersion>
//! </modinfo>
//! ```

use crate::{
    fsutil,
    version::{SourceFileName, PLACEHOLDER_VERSION},
};
use anyhow::{Context, Result};
use quick_xml::{
    events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event},
    Reader, Writer,
};
use serde::Deserialize;
use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const ROOT_ELEMENT: &str = "modinfo";
const INVALID_ID_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const ORDER_COMMENT: char = '#';
const MANIFEST_SEARCH_DEPTH: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub has_explicit_id: bool,
    pub game_version: Option<String>,
    pub author: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ManifestDoc {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default, rename = "gameVersion")]
    game_version: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Reads a manifest. Returns `None` when the file is unreadable or lacks a
/// name or version. A legacy header is rewritten on disk first. Without an
/// explicit id one is derived from the name and, when `write_back` is set,
/// stored in the document.
pub fn parse(path: &Path, write_back: bool) -> Option<ManifestInfo> {
    if let Err(err) = normalize_legacy_header(path) {
        warn!(path = ?path, "legacy header rewrite failed: {err:#}");
    }
    let info = read_info(path)?;
    if write_back && !info.has_explicit_id {
        if let Err(err) = ensure_id(path, &info.id) {
            warn!(path = ?path, "persist derived id failed: {err:#}");
        }
    }
    Some(info)
}

/// Same result as [`parse`] without touching the file; a legacy header is
/// only fixed in memory.
pub fn read_info(path: &Path) -> Option<ManifestInfo> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) => {
            warn!(path = ?path, "read manifest failed: {err}");
            return None;
        }
    };
    let raw = fix_legacy_declaration(&raw).unwrap_or(raw);
    let doc: ManifestDoc = match quick_xml::de::from_str(raw.trim_start_matches('\u{feff}')) {
        Ok(doc) => doc,
        Err(err) => {
            warn!(path = ?path, "parse manifest failed: {err}");
            return None;
        }
    };

    let Some(name) = non_blank(doc.name) else {
        debug!(path = ?path, "manifest has no name");
        return None;
    };
    let Some(version) = non_blank(doc.version) else {
        debug!(path = ?path, "manifest has no version");
        return None;
    };
    let (id, has_explicit_id) = match non_blank(doc.id) {
        Some(id) => (id, true),
        None => (generate_id(&name), false),
    };

    Some(ManifestInfo {
        id,
        name,
        version,
        has_explicit_id,
        game_version: non_blank(doc.game_version),
        author: non_blank(doc.author),
        description: non_blank(doc.description),
    })
}

/// Filesystem-safe id for `name`. Never empty, same name gives the same id.
/// Never starts with `#`, the order file's disabled marker.
pub fn generate_id(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for ch in name.trim().chars() {
        let mapped = if ch.is_whitespace() || ch.is_control() || INVALID_ID_CHARS.contains(&ch) {
            '_'
        } else {
            ch
        };
        if mapped == '_' {
            if last_was_sep {
                continue;
            }
            last_was_sep = true;
        } else {
            last_was_sep = false;
        }
        out.push(mapped);
    }

    let trimmed = out
        .trim_start_matches(['_', '.', ' ', ORDER_COMMENT])
        .trim_end_matches(['_', '.', ' ']);
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }

    let hash = blake3::hash(name.as_bytes());
    format!("mod_{}", &hash.to_hex().as_str()[..12])
}

/// Rewrites a `version="2.0"` XML declaration to `1.0` in place. Returns
/// whether the file changed.
pub fn normalize_legacy_header(path: &Path) -> Result<bool> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    let Some(fixed) = fix_legacy_declaration(&raw) else {
        return Ok(false);
    };
    fsutil::write_atomic_text(path, &fixed).context("write normalized manifest")?;
    info!(path = ?path, "rewrote legacy manifest header");
    Ok(true)
}

fn fix_legacy_declaration(raw: &str) -> Option<String> {
    let body = raw.trim_start_matches('\u{feff}').trim_start();
    if !body.starts_with("<?xml") {
        return None;
    }
    let offset = raw.len() - body.len();
    let decl_end = offset + body.find("?>")?;
    let decl = &raw[offset..decl_end];
    let fixed_decl = decl
        .replacen("version=\"2.0\"", "version=\"1.0\"", 1)
        .replacen("version='2.0'", "version='1.0'", 1);
    if fixed_decl == decl {
        return None;
    }
    Some(format!("{}{}{}", &raw[..offset], fixed_decl, &raw[decl_end..]))
}

/// Writes a manifest for a folder that has packed files but no manifest.
/// `source_name` (archive or folder name) feeds the naming convention;
/// defaults to the folder's own name.
pub fn generate(folder: &Path, source_name: Option<&str>, file_name: &str) -> Result<PathBuf> {
    let source = source_name
        .map(str::to_string)
        .unwrap_or_else(|| fsutil::file_name_string(folder));
    let parsed = SourceFileName::parse(&source);
    let name = parsed
        .name
        .clone()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| parsed.stem.trim().to_string());
    let name = if name.is_empty() {
        "Unnamed Mod".to_string()
    } else {
        name
    };
    let version = if parsed.conventional {
        parsed.version_or_default()
    } else {
        PLACEHOLDER_VERSION.to_string()
    };

    let xml = render(&[("name", name.as_str()), ("version", version.as_str())])?;
    let path = folder.join(file_name);
    fsutil::write_atomic_text(&path, &xml).context("write generated manifest")?;
    info!(path = ?path, name, version, "generated manifest");
    Ok(path)
}

fn render(fields: &[(&str, &str)]) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
        .context("write manifest decl")?;
    writer
        .write_event(Event::Start(BytesStart::new(ROOT_ELEMENT)))
        .context("write manifest root")?;
    for (field, value) in fields {
        write_field(&mut writer, field, value)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(ROOT_ELEMENT)))
        .context("close manifest root")?;
    String::from_utf8(writer.into_inner()).context("manifest utf-8")
}

fn write_field(writer: &mut Writer<Vec<u8>>, field: &str, value: &str) -> Result<()> {
    writer
        .write_event(Event::Start(BytesStart::new(field)))
        .context("write field start")?;
    writer
        .write_event(Event::Text(BytesText::new(value)))
        .context("write field text")?;
    writer
        .write_event(Event::End(BytesEnd::new(field)))
        .context("write field end")?;
    Ok(())
}

pub fn update_name_and_id(path: &Path, new_name: &str, new_id: &str) -> Result<()> {
    set_fields(path, &[("name", new_name), ("id", new_id)]).map(|_| ())
}

/// Stores `id` unless the document already carries exactly that id.
pub fn ensure_id(path: &Path, id: &str) -> Result<bool> {
    set_fields(path, &[("id", id)])
}

/// In-place rewrite of top-level fields; other content is kept. Skips the
/// write when every field already has the requested value.
fn set_fields(path: &Path, updates: &[(&str, &str)]) -> Result<bool> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    let raw = raw.trim_start_matches('\u{feff}');
    let doc: ManifestDoc = quick_xml::de::from_str(raw).context("parse manifest")?;
    let unchanged = updates.iter().all(|(field, value)| {
        let current = match *field {
            "id" => doc.id.as_deref(),
            "name" => doc.name.as_deref(),
            "version" => doc.version.as_deref(),
            _ => None,
        };
        current.map(str::trim) == Some(*value)
    });
    if unchanged {
        return Ok(false);
    }

    let rewritten = rewrite_fields(raw, updates)?;
    fsutil::write_atomic_text(path, &rewritten).context("write manifest")?;
    Ok(true)
}

fn rewrite_fields(raw: &str, updates: &[(&str, &str)]) -> Result<String> {
    let lookup = |name: &str| {
        updates
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, value)| *value)
    };
    let mut reader = Reader::from_str(raw);
    reader.trim_text(true);
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
    let mut seen: HashSet<String> = HashSet::new();
    let mut depth = 0usize;
    let mut replacing: Option<String> = None;

    loop {
        let event = reader.read_event().context("read manifest xml")?;
        match event {
            Event::Start(e) => {
                depth += 1;
                if replacing.is_some() {
                    continue;
                }
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if depth == 2 {
                    if let Some(value) = lookup(&name) {
                        writer
                            .write_event(Event::Start(e))
                            .context("write field start")?;
                        writer
                            .write_event(Event::Text(BytesText::new(value)))
                            .context("write field text")?;
                        seen.insert(name.clone());
                        replacing = Some(name);
                        continue;
                    }
                }
                writer
                    .write_event(Event::Start(e))
                    .context("copy start")?;
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if let Some(current) = &replacing {
                    if depth == 2 && *current == name {
                        replacing = None;
                        writer
                            .write_event(Event::End(e))
                            .context("write field end")?;
                    }
                    depth = depth.saturating_sub(1);
                    continue;
                }
                if depth == 1 {
                    for (field, value) in updates {
                        if !seen.contains(*field) {
                            write_field(&mut writer, field, value)?;
                        }
                    }
                }
                depth = depth.saturating_sub(1);
                writer.write_event(Event::End(e)).context("copy end")?;
            }
            Event::Empty(e) => {
                if replacing.is_some() {
                    continue;
                }
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if depth == 1 {
                    if let Some(value) = lookup(&name) {
                        write_field(&mut writer, &name, value)?;
                        seen.insert(name);
                        continue;
                    }
                }
                writer.write_event(Event::Empty(e)).context("copy empty")?;
            }
            Event::Text(_) | Event::CData(_) if replacing.is_some() => {}
            Event::Eof => break,
            other => writer.write_event(other).context("copy event")?,
        }
    }

    String::from_utf8(writer.into_inner()).context("manifest utf-8")
}

/// Shallowest manifest under `root`, matched case-insensitively.
pub fn find_manifest(root: &Path, file_name: &str) -> Option<PathBuf> {
    let mut candidates: Vec<(usize, PathBuf)> = Vec::new();
    for entry in WalkDir::new(root)
        .max_depth(MANIFEST_SEARCH_DEPTH)
        .into_iter()
        .filter_entry(|entry| !fsutil::is_ignored_path(entry.path()))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if entry
            .file_name()
            .to_string_lossy()
            .eq_ignore_ascii_case(file_name)
        {
            candidates.push((entry.depth(), entry.path().to_path_buf()));
        }
    }
    candidates.sort();
    candidates.into_iter().map(|(_, path)| path).next()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
