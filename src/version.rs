//! Loosely dotted-numeric versions and the archive/folder naming grammar.

use regex::Regex;
use std::{cmp::Ordering, fmt, sync::OnceLock};

/// Version used when neither the manifest nor the file name supplies one.
pub const PLACEHOLDER_VERSION: &str = "1.0.0";

const ARCHIVE_SUFFIXES: [&str; 5] = [".zip", ".7z", ".rar", ".tar.gz", ".tar"];

/// `1.2`, `v1.2.0`, `2.0.1-beta` (the `-beta` tail is ignored). Anything with
/// a segment that does not start with a digit is not comparable.
#[derive(Debug, Clone)]
pub struct LooseVersion {
    parts: Vec<u64>,
}

impl LooseVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        if trimmed.is_empty() {
            return None;
        }
        let mut parts = Vec::new();
        for segment in trimmed.split('.') {
            let digits: String = segment.chars().take_while(|ch| ch.is_ascii_digit()).collect();
            if digits.is_empty() {
                return None;
            }
            parts.push(digits.parse().ok()?);
            if digits.len() != segment.len() {
                // `2.0.1-beta`: the tail ends the numeric part.
                break;
            }
        }
        Some(Self { parts })
    }
}

impl PartialEq for LooseVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LooseVersion {}

impl PartialOrd for LooseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LooseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.parts.len().max(other.parts.len());
        for index in 0..len {
            let left = self.parts.get(index).copied().unwrap_or(0);
            let right = other.parts.get(index).copied().unwrap_or(0);
            match left.cmp(&right) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        Ordering::Equal
    }
}

impl fmt::Display for LooseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.parts.iter().map(|part| part.to_string()).collect();
        write!(f, "{}", joined.join("."))
    }
}

/// `None` when either side is not comparable.
pub fn compare_versions(left: &str, right: &str) -> Option<Ordering> {
    Some(LooseVersion::parse(left)?.cmp(&LooseVersion::parse(right)?))
}

/// One pass over a download name such as `Better Lamps-1234-1-2-1700000000.zip`.
///
/// Conventional names (`name-upstream-major-minor[-rest]`) yield all fields
/// from their segments. Other names fall back to the first standalone digit
/// run for the upstream number and, with four or more segments, the third
/// segment for the version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFileName {
    pub stem: String,
    pub conventional: bool,
    pub name: Option<String>,
    pub upstream_number: Option<i64>,
    pub version: Option<String>,
}

impl SourceFileName {
    pub fn parse(file_name: &str) -> Self {
        let stem = strip_archive_suffix(file_name.trim()).to_string();
        let segments: Vec<&str> = stem.split('-').map(str::trim).collect();
        let conventional = segments.len() >= 4
            && !segments[0].is_empty()
            && is_digits(segments[1])
            && is_digits(segments[2]);

        if conventional {
            let version = if is_digits(segments[3]) {
                format!("{}.{}", segments[2], segments[3])
            } else {
                segments[2].to_string()
            };
            return Self {
                name: Some(segments[0].replace('_', " ").trim().to_string()),
                upstream_number: segments[1].parse().ok(),
                version: Some(version),
                conventional,
                stem,
            };
        }

        let version = if segments.len() >= 4 && !segments[2].is_empty() {
            Some(segments[2].to_string())
        } else {
            None
        };
        Self {
            name: None,
            upstream_number: first_standalone_number(&stem),
            version,
            conventional,
            stem,
        }
    }

    pub fn version_or_default(&self) -> String {
        self.version
            .clone()
            .unwrap_or_else(|| PLACEHOLDER_VERSION.to_string())
    }
}

fn strip_archive_suffix(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    for suffix in ARCHIVE_SUFFIXES {
        if lower.ends_with(suffix) && lower.len() > suffix.len() {
            return &name[..name.len() - suffix.len()];
        }
    }
    name
}

fn is_digits(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|ch| ch.is_ascii_digit())
}

fn first_standalone_number(value: &str) -> Option<i64> {
    static STANDALONE: OnceLock<Regex> = OnceLock::new();
    let pattern = STANDALONE.get_or_init(|| {
        Regex::new(r"(?:^|[^0-9A-Za-z])([0-9]+)(?:$|[^0-9A-Za-z])").expect("static regex")
    });
    pattern
        .captures_iter(value)
        .filter_map(|caps| caps.get(1))
        .find_map(|digits| digits.as_str().parse().ok())
}
