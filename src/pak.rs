//! Listing the entries of packed payload files without extracting them.

use anyhow::{bail, Context, Result};
use lz4_flex::block::decompress;
use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};
use zstd::bulk::decompress as zstd_decompress;

/// One entry of a packed file. Some formats carry nameless entries, hence
/// the optional path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub path: Option<String>,
    pub is_directory: bool,
}

impl ArchiveEntry {
    pub fn file(path: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            is_directory: false,
        }
    }

    pub fn directory(path: &str) -> Self {
        Self {
            path: Some(path.to_string()),
            is_directory: true,
        }
    }
}

pub trait EntryReader: Send + Sync {
    fn open(&self, path: &Path) -> Result<Vec<ArchiveEntry>>;
}

/// Reads LSPK (v18+) file tables and zip central directories, picked by
/// magic bytes rather than extension.
#[derive(Debug, Default, Clone, Copy)]
pub struct PakEntryReader;

impl EntryReader for PakEntryReader {
    fn open(&self, path: &Path) -> Result<Vec<ArchiveEntry>> {
        let mut file = File::open(path).with_context(|| format!("open pak {:?}", path))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)
            .with_context(|| format!("read pak header {:?}", path))?;
        file.seek(SeekFrom::Start(0))?;
        match &magic {
            b"LSPK" => read_lspk_entries(&mut file),
            [b'P', b'K', 0x03, 0x04] | [b'P', b'K', 0x05, 0x06] => read_zip_entries(file),
            _ => bail!("unrecognized packed format {:?}", path),
        }
    }
}

fn read_zip_entries(file: File) -> Result<Vec<ArchiveEntry>> {
    let mut archive = zip::ZipArchive::new(file).context("read zip directory")?;
    let mut out = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let entry = archive.by_index_raw(index).context("zip entry")?;
        let name = entry.name();
        out.push(ArchiveEntry {
            path: if name.is_empty() {
                None
            } else {
                Some(name.to_string())
            },
            is_directory: entry.is_dir(),
        });
    }
    Ok(out)
}

const LSPK_ENTRY_LEN: usize = 272;
const LSPK_PATH_LEN: usize = 256;
const LSPK_MIN_VERSION: u32 = 18;
const LSPK_MAX_ENTRIES: usize = 1 << 20;
// lz4 cannot expand a block by more than this factor.
const LSPK_MAX_RATIO: usize = 255;

/// The file-table location read from an LSPK header, checked against the
/// real file size before anything is allocated.
struct LspkTable {
    offset: u64,
    file_count: usize,
    compressed_len: usize,
}

impl LspkTable {
    fn read(file: &mut File) -> Result<Self> {
        let file_len = file.metadata().context("stat pak")?.len();
        let mut id = [0u8; 4];
        file.read_exact(&mut id)?;
        let version = read_u32(file)?;
        if version < LSPK_MIN_VERSION {
            bail!("unsupported pak version {version}");
        }
        let footer_offset = read_u64(file)?;
        if i64::try_from(footer_offset).is_err() {
            bail!("pak file table offset {footer_offset} out of range");
        }
        let body_offset = footer_offset
            .checked_add(8)
            .filter(|end| *end <= file_len)
            .with_context(|| format!("pak file table offset {footer_offset} past end"))?;
        file.seek(SeekFrom::Start(footer_offset))
            .context("seek pak file table")?;

        let file_count = read_u32(file)? as usize;
        let compressed_len = read_u32(file)? as usize;
        if compressed_len as u64 > file_len - body_offset {
            bail!("pak file table length {compressed_len} exceeds file");
        }
        if file_count > LSPK_MAX_ENTRIES
            || file_count * LSPK_ENTRY_LEN > compressed_len.saturating_mul(LSPK_MAX_RATIO)
        {
            bail!("pak file count {file_count} does not fit its table");
        }
        Ok(Self {
            offset: body_offset,
            file_count,
            compressed_len,
        })
    }

    fn decompressed_len(&self) -> usize {
        self.file_count * LSPK_ENTRY_LEN
    }
}

fn read_lspk_entries(file: &mut File) -> Result<Vec<ArchiveEntry>> {
    let table_info = LspkTable::read(file)?;
    let file_count = table_info.file_count;
    file.seek(SeekFrom::Start(table_info.offset))
        .context("seek pak file table body")?;
    let mut compressed = vec![0u8; table_info.compressed_len];
    file.read_exact(&mut compressed)
        .context("read pak file table")?;
    let table = match decompress(&compressed, table_info.decompressed_len()) {
        Ok(table) => table,
        Err(_) => zstd_decompress(&compressed, table_info.decompressed_len())
            .context("decompress pak file table")?,
    };

    let mut out = Vec::with_capacity(file_count);
    for index in 0..file_count {
        let start = index * LSPK_ENTRY_LEN;
        let end = start + LSPK_ENTRY_LEN;
        if end > table.len() {
            break;
        }
        let entry = &table[start..end];
        let path_end = entry[..LSPK_PATH_LEN]
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(LSPK_PATH_LEN);
        let raw_path = String::from_utf8_lossy(&entry[..path_end]);
        out.push(ArchiveEntry {
            path: if raw_path.is_empty() {
                None
            } else {
                Some(raw_path.to_string())
            },
            is_directory: false,
        });
    }

    Ok(out)
}

fn read_u32(file: &mut File) -> Result<u32> {
    let mut bytes = [0u8; 4];
    file.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_u64(file: &mut File) -> Result<u64> {
    let mut bytes = [0u8; 8];
    file.read_exact(&mut bytes)?;
    Ok(u64::from_le_bytes(bytes))
}

/// Key used to compare entries across units: forward slashes, no leading
/// slash, lower case. Empty means "no usable path".
pub fn normalize_entry_path(path: &str) -> String {
    path.replace('\\', "/")
        .trim_start_matches('/')
        .to_lowercase()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::io::Write;

    /// Minimal LSPK v18 file with an lz4-compressed file table.
    pub fn write_lspk(path: &Path, entries: &[&str]) {
        let mut table = Vec::new();
        for entry in entries {
            let mut row = vec![0u8; 272];
            row[..entry.len()].copy_from_slice(entry.as_bytes());
            table.extend_from_slice(&row);
        }
        let compressed = lz4_flex::block::compress(&table);

        let header_len = 4 + 4 + 8;
        let mut out = Vec::new();
        out.extend_from_slice(b"LSPK");
        out.extend_from_slice(&18u32.to_le_bytes());
        out.extend_from_slice(&(header_len as u64).to_le_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        out.extend_from_slice(&compressed);
        let mut file = File::create(path).unwrap();
        file.write_all(&out).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::testing::write_lspk;
    use super::*;
    use crate::extract::testing::write_zip;
    use tempfile::TempDir;

    #[test]
    fn reads_lspk_table() {
        let dir = TempDir::new().unwrap();
        let pak = dir.path().join("a.pak");
        write_lspk(&pak, &["Mods\\Thing\\meta.lsx", "Public/Thing/Stats.txt"]);
        let entries = PakEntryReader.open(&pak).unwrap();
        assert_eq!(
            entries,
            vec![
                ArchiveEntry::file("Mods\\Thing\\meta.lsx"),
                ArchiveEntry::file("Public/Thing/Stats.txt"),
            ]
        );
    }

    #[test]
    fn reads_zip_directory_without_extracting() {
        let dir = TempDir::new().unwrap();
        let pak = dir.path().join("b.pak");
        write_zip(&pak, &[("mods/", b""), ("mods/override.xml", b"<x/>")]);
        let entries = PakEntryReader.open(&pak).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_directory);
        assert_eq!(entries[1], ArchiveEntry::file("mods/override.xml"));
    }

    fn lspk_header(footer_offset: u64, file_count: u32, compressed_len: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"LSPK");
        out.extend_from_slice(&18u32.to_le_bytes());
        out.extend_from_slice(&footer_offset.to_le_bytes());
        out.extend_from_slice(&file_count.to_le_bytes());
        out.extend_from_slice(&compressed_len.to_le_bytes());
        out
    }

    #[test]
    fn corrupt_lspk_tables_are_errors() {
        let dir = TempDir::new().unwrap();
        let pak = dir.path().join("bad.pak");

        let mut huge_count = lspk_header(16, u32::MAX, 8);
        huge_count.extend_from_slice(&[0u8; 8]);
        std::fs::write(&pak, &huge_count).unwrap();
        assert!(PakEntryReader.open(&pak).is_err());

        std::fs::write(&pak, lspk_header(16, 2, u32::MAX)).unwrap();
        assert!(PakEntryReader.open(&pak).is_err());

        std::fs::write(&pak, lspk_header(u64::MAX, 1, 1)).unwrap();
        assert!(PakEntryReader.open(&pak).is_err());

        std::fs::write(&pak, lspk_header(4096, 1, 1)).unwrap();
        assert!(PakEntryReader.open(&pak).is_err());
    }

    #[test]
    fn rejects_unknown_magic() {
        let dir = TempDir::new().unwrap();
        let pak = dir.path().join("c.pak");
        std::fs::write(&pak, b"nope nope").unwrap();
        assert!(PakEntryReader.open(&pak).is_err());
    }

    #[test]
    fn normalizes_separators_and_case() {
        assert_eq!(normalize_entry_path("\\Mods\\Override.XML"), "mods/override.xml");
        assert_eq!(normalize_entry_path("/"), "");
    }
}
