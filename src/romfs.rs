//! RomFS: the hierarchical virtual filesystem reader.
//!
//! The filesystem region starts with the IVFC header and master-hash
//! area; the tree payload ("level 3") follows at the next level-3-block
//! boundary and holds a sub-header, directory/file hash tables,
//! directory/file metadata tables, and the packed file data.
//!
//! Directories and files form a singly-linked sibling forest: each
//! directory record points at its first child directory and first
//! contained file, and every record points at the next sibling at the
//! same level. Offsets index into the metadata tables; 0xFFFFFFFF means
//! "none". The walk is an explicit worklist over table offsets with
//! visited sets, so corrupt inputs with cycles fail fast instead of
//! recursing forever.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::align::align_up;
use crate::format::{
    read_u32_le, read_u64_le, IvfcHeader, Level3Header, IVFC_HEADER_SIZE, LEVEL3_HEADER_SIZE,
    MASTER_HASH_OFFSET, NO_OFFSET,
};
use crate::{CtrError, Result};

/// Byte-range descriptor of one file in the tree.
#[derive(Debug, Clone)]
pub struct RomfsFile {
    /// Full path, ancestor directory names joined with `/`. The root
    /// directory's name is empty, so paths carry no leading separator.
    pub path: String,
    /// Offset of this file's record in the file-metadata table.
    pub meta_offset: u32,
    /// Data offset relative to the file-data area.
    pub data_offset: u64,
    /// Data length in bytes. The format stores u64 but no supported
    /// game file exceeds a 32-bit range.
    pub size: u32,
}

/// Parsed filesystem region.
#[derive(Debug)]
pub struct Romfs {
    /// Absolute offset of the region in the source file.
    pub region_offset: u64,
    /// Region length from the container header.
    pub region_size: u64,
    /// Region header, including the per-level block-size exponents.
    pub header: IvfcHeader,
    /// Start of level 3 relative to the region start.
    pub level3_offset: u64,
    /// Table layout within level 3.
    pub level3: Level3Header,
    /// Every file found by the walk, in walk order.
    pub files: Vec<RomfsFile>,
    /// Full path → index into [`files`](Self::files).
    pub by_path: HashMap<String, usize>,
}

/// Directory metadata record.
///
/// ```text
/// 0x00  parent directory offset (u32)
/// 0x04  next sibling directory offset (u32)
/// 0x08  first child directory offset (u32)
/// 0x0C  first file offset (u32)
/// 0x10  next directory in hash bucket (u32)
/// 0x14  name length in bytes (u32)
/// 0x18  name, UTF-16LE
/// ```
struct DirEntry {
    sibling: u32,
    first_child: u32,
    first_file: u32,
    name: String,
}

/// File metadata record.
///
/// ```text
/// 0x00  parent directory offset (u32)
/// 0x04  next sibling file offset (u32)
/// 0x08  data offset (u64)
/// 0x10  data length (u64)
/// 0x18  next file in hash bucket (u32)
/// 0x1C  name length in bytes (u32)
/// 0x20  name, UTF-16LE
/// ```
struct FileEntry {
    sibling: u32,
    data_offset: u64,
    data_size: u64,
    name: String,
}

/// Fixed-field size of a directory record before the name.
pub(crate) const DIR_ENTRY_FIXED: usize = 0x18;
/// Fixed-field size of a file record before the name.
pub(crate) const FILE_ENTRY_FIXED: usize = 0x20;
/// Offset of the data-offset field inside a file record.
pub(crate) const FILE_ENTRY_DATA_OFFSET: usize = 0x08;
/// Offset of the data-length field inside a file record.
pub(crate) const FILE_ENTRY_DATA_SIZE: usize = 0x10;

impl DirEntry {
    fn parse(table: &[u8], offset: u32) -> Result<Self> {
        let base = checked_range(table, offset, DIR_ENTRY_FIXED, "directory")?;
        let name_len = read_u32_le(table, base + 0x14) as usize;
        let name = decode_name(table, base + DIR_ENTRY_FIXED, name_len, "directory")?;
        Ok(Self {
            sibling: read_u32_le(table, base + 0x04),
            first_child: read_u32_le(table, base + 0x08),
            first_file: read_u32_le(table, base + 0x0C),
            name,
        })
    }
}

impl FileEntry {
    fn parse(table: &[u8], offset: u32) -> Result<Self> {
        let base = checked_range(table, offset, FILE_ENTRY_FIXED, "file")?;
        let name_len = read_u32_le(table, base + 0x1C) as usize;
        let name = decode_name(table, base + FILE_ENTRY_FIXED, name_len, "file")?;
        Ok(Self {
            sibling: read_u32_le(table, base + 0x04),
            data_offset: read_u64_le(table, base + FILE_ENTRY_DATA_OFFSET),
            data_size: read_u64_le(table, base + FILE_ENTRY_DATA_SIZE),
            name,
        })
    }
}

fn checked_range(table: &[u8], offset: u32, fixed: usize, what: &str) -> Result<usize> {
    let base = offset as usize;
    if base + fixed > table.len() {
        return Err(CtrError::corrupt(format!(
            "{what} metadata offset 0x{offset:X} out of range"
        )));
    }
    Ok(base)
}

/// Decode a fixed-width UTF-16LE name, trimming zero padding.
fn decode_name(table: &[u8], start: usize, len: usize, what: &str) -> Result<String> {
    if len % 2 != 0 || start + len > table.len() {
        return Err(CtrError::corrupt(format!("{what} name field out of range")));
    }
    let mut units: Vec<u16> = table[start..start + len]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    while units.last() == Some(&0) {
        units.pop();
    }
    Ok(String::from_utf16_lossy(&units))
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

impl Romfs {
    /// Parse the filesystem region at `region_offset`.
    ///
    /// Returns `Ok(None)` when the region magic does not match; some
    /// containers legitimately lack a filesystem. Any structural damage
    /// (bad level-3 header, out-of-range or cyclic offsets) is an error;
    /// a partially populated map is never returned.
    pub fn parse(file: &mut File, region_offset: u64, region_size: u64) -> Result<Option<Self>> {
        let mut header_buf = [0u8; IVFC_HEADER_SIZE];
        file.seek(SeekFrom::Start(region_offset))?;
        file.read_exact(&mut header_buf)?;
        if !IvfcHeader::matches_magic(&header_buf) {
            tracing::debug!(region_offset, "no filesystem region magic, treating as absent");
            return Ok(None);
        }
        let header = IvfcHeader::from_bytes(&header_buf)?;

        let level3_block = header.levels[2].block_size();
        let level3_offset = align_up(
            MASTER_HASH_OFFSET + header.master_hash_size as u64,
            level3_block,
        );

        let mut level3_buf = [0u8; LEVEL3_HEADER_SIZE as usize];
        file.seek(SeekFrom::Start(region_offset + level3_offset))?;
        file.read_exact(&mut level3_buf)
            .map_err(|_| CtrError::corrupt("level-3 header truncated"))?;
        let level3 = Level3Header::from_bytes(&level3_buf)?;

        let dir_meta = read_table(file, region_offset + level3_offset, level3.dir_meta)?;
        let file_meta = read_table(file, region_offset + level3_offset, level3.file_meta)?;

        let (files, by_path) = walk(&dir_meta, &file_meta)?;

        tracing::debug!(
            region_offset,
            level3_offset,
            files = files.len(),
            "parsed filesystem region"
        );
        Ok(Some(Self {
            region_offset,
            region_size,
            header,
            level3_offset,
            level3,
            files,
            by_path,
        }))
    }

    /// Look up a file descriptor by full path.
    pub fn file(&self, path: &str) -> Option<&RomfsFile> {
        self.by_path.get(path).map(|&i| &self.files[i])
    }

    /// Absolute offset of a file's data in the source file.
    pub fn abs_data_offset(&self, record: &RomfsFile) -> u64 {
        self.region_offset
            + self.level3_offset
            + self.level3.file_data_offset as u64
            + record.data_offset
    }

    /// Read one file's bytes from the source file.
    pub fn read(&self, file: &mut File, record: &RomfsFile) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; record.size as usize];
        file.seek(SeekFrom::Start(self.abs_data_offset(record)))?;
        file.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

fn read_table(file: &mut File, level3_start: u64, (offset, len): (u32, u32)) -> Result<Vec<u8>> {
    let mut table = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(level3_start + offset as u64))?;
    file.read_exact(&mut table)
        .map_err(|_| CtrError::corrupt("metadata table truncated"))?;
    Ok(table)
}

/// Worklist walk over the directory forest.
///
/// The root directory sits at offset 0 with an empty name. Every file
/// chain hanging off a directory is consumed before its children are
/// pushed. Visited-offset sets turn any revisit (shared subtree or
/// cycle) into a hard error.
fn walk(dir_meta: &[u8], file_meta: &[u8]) -> Result<(Vec<RomfsFile>, HashMap<String, usize>)> {
    let mut files = Vec::new();
    let mut by_path = HashMap::new();
    let mut visited_dirs: HashSet<u32> = HashSet::new();
    let mut visited_files: HashSet<u32> = HashSet::new();

    if dir_meta.is_empty() {
        return Ok((files, by_path));
    }

    let mut stack: Vec<(u32, String)> = vec![(0, String::new())];
    while let Some((dir_offset, prefix)) = stack.pop() {
        if !visited_dirs.insert(dir_offset) {
            return Err(CtrError::corrupt(format!(
                "directory walk revisited offset 0x{dir_offset:X}"
            )));
        }
        let dir = DirEntry::parse(dir_meta, dir_offset)?;
        let dir_path = join_path(&prefix, &dir.name);

        let mut file_offset = dir.first_file;
        while file_offset != NO_OFFSET {
            if !visited_files.insert(file_offset) {
                return Err(CtrError::corrupt(format!(
                    "file walk revisited offset 0x{file_offset:X}"
                )));
            }
            let entry = FileEntry::parse(file_meta, file_offset)?;
            if entry.data_size > u32::MAX as u64 {
                return Err(CtrError::corrupt(format!(
                    "file '{}' exceeds 32-bit size range",
                    entry.name
                )));
            }
            let path = join_path(&dir_path, &entry.name);
            files.push(RomfsFile {
                path: path.clone(),
                meta_offset: file_offset,
                data_offset: entry.data_offset,
                size: entry.data_size as u32,
            });
            by_path.insert(path, files.len() - 1);
            file_offset = entry.sibling;
        }

        if dir.sibling != NO_OFFSET {
            stack.push((dir.sibling, prefix));
        }
        if dir.first_child != NO_OFFSET {
            stack.push((dir.first_child, dir_path));
        }
    }

    Ok((files, by_path))
}
