//! ExeFS: the flat code-segment file table.
//!
//! A fixed 0x200-byte header holds ten slot records (8-byte ASCII name,
//! u32 offset, u32 size) followed by the slot data. Per-slot SHA-256
//! hashes are packed in reverse slot order at the tail of the header
//! block, so slot 0's hash occupies the last 32 bytes. The primary
//! executable lives in the `.code` slot; everything else (icon, banner,
//! logo) is auxiliary and round-tripped verbatim.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::align::align_up_usize;
use crate::format::{EXEFS_HEADER_SIZE, EXEFS_SLOT_COUNT, EXEFS_SLOT_SIZE, MEDIA_UNIT};
use crate::{CtrError, Result};

/// One slot record of the code-segment file table.
#[derive(Debug, Clone, Copy)]
pub struct ExefsSlot {
    /// Raw 8-byte name field, zero-padded ASCII.
    pub name: [u8; 8],
    /// Data offset relative to the end of the header block.
    pub offset: u32,
    /// Data size in bytes.
    pub size: u32,
}

impl ExefsSlot {
    /// Record size in the header.
    pub const SIZE: usize = EXEFS_SLOT_SIZE;

    /// Parse a slot record.
    pub fn from_bytes(buf: &[u8; EXEFS_SLOT_SIZE]) -> Self {
        let mut name = [0u8; 8];
        name.copy_from_slice(&buf[0..8]);
        Self {
            name,
            offset: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            size: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        }
    }

    /// Serialize a slot record.
    pub fn to_bytes(&self) -> [u8; EXEFS_SLOT_SIZE] {
        let mut buf = [0u8; EXEFS_SLOT_SIZE];
        buf[0..8].copy_from_slice(&self.name);
        buf[8..12].copy_from_slice(&self.offset.to_le_bytes());
        buf[12..16].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Name with zero padding trimmed.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(8);
        std::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// A slot is in use when it has a name and a non-zero size.
    pub fn is_valid(&self) -> bool {
        self.name[0] != 0 && self.size != 0
    }
}

/// Parsed code-segment region.
#[derive(Debug)]
pub struct Exefs {
    region_offset: u64,
    slots: Vec<ExefsSlot>,
}

impl Exefs {
    /// Parse the slot table at `region_offset` in `file`.
    ///
    /// `region_size` is the region length from the container header and
    /// bounds every slot's data range.
    pub fn parse(file: &mut File, region_offset: u64, region_size: u64) -> Result<Self> {
        let mut header = [0u8; EXEFS_HEADER_SIZE];
        file.seek(SeekFrom::Start(region_offset))?;
        file.read_exact(&mut header)
            .map_err(|_| CtrError::corrupt("code-segment header truncated"))?;

        let mut slots = Vec::with_capacity(EXEFS_SLOT_COUNT);
        let data_size = region_size.saturating_sub(EXEFS_HEADER_SIZE as u64);
        for i in 0..EXEFS_SLOT_COUNT {
            let base = i * EXEFS_SLOT_SIZE;
            let slot =
                ExefsSlot::from_bytes(header[base..base + EXEFS_SLOT_SIZE].try_into().unwrap());
            if slot.is_valid() {
                let end = slot.offset as u64 + slot.size as u64;
                if end > data_size {
                    return Err(CtrError::corrupt(format!(
                        "code-segment slot '{}' extends past region end",
                        slot.name()
                    )));
                }
                if slots
                    .iter()
                    .any(|s: &ExefsSlot| s.is_valid() && s.name == slot.name)
                {
                    return Err(CtrError::corrupt(format!(
                        "duplicate code-segment slot name '{}'",
                        slot.name()
                    )));
                }
            }
            slots.push(slot);
        }

        tracing::debug!(
            region_offset,
            valid = slots.iter().filter(|s| s.is_valid()).count(),
            "parsed code-segment slot table"
        );
        Ok(Self {
            region_offset,
            slots,
        })
    }

    /// All ten slots in table order, including unused ones.
    pub fn slots(&self) -> &[ExefsSlot] {
        &self.slots
    }

    /// Find a valid slot by name.
    pub fn slot_named(&self, name: &str) -> Option<&ExefsSlot> {
        self.slots
            .iter()
            .find(|s| s.is_valid() && s.name() == name)
    }

    /// Read a slot's raw bytes from the source file.
    pub fn read_slot(&self, file: &mut File, slot: &ExefsSlot) -> Result<Vec<u8>> {
        let abs = self.region_offset + EXEFS_HEADER_SIZE as u64 + slot.offset as u64;
        let mut bytes = vec![0u8; slot.size as usize];
        file.seek(SeekFrom::Start(abs))?;
        file.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

/// Serialize a full code-segment region from final slot contents.
///
/// `slots` holds the surviving valid slots in original table order, with
/// their raw name fields preserved. Data is re-packed sequentially at
/// media-unit alignment, per-slot hashes are recomputed into the
/// reverse-order hash list, and the whole region is padded to a media
/// unit.
pub fn build_exefs(slots: &[([u8; 8], Vec<u8>)]) -> Vec<u8> {
    assert!(slots.len() <= EXEFS_SLOT_COUNT);

    let mut header = vec![0u8; EXEFS_HEADER_SIZE];
    let mut data: Vec<u8> = Vec::new();
    for (i, (name, bytes)) in slots.iter().enumerate() {
        let offset = align_up_usize(data.len(), MEDIA_UNIT as usize);
        data.resize(offset, 0);
        data.extend_from_slice(bytes);

        let record = ExefsSlot {
            name: *name,
            offset: offset as u32,
            size: bytes.len() as u32,
        };
        let base = i * EXEFS_SLOT_SIZE;
        header[base..base + EXEFS_SLOT_SIZE].copy_from_slice(&record.to_bytes());

        let hash = Sha256::digest(bytes);
        let hash_pos = EXEFS_HEADER_SIZE - 0x20 * (i + 1);
        header[hash_pos..hash_pos + 0x20].copy_from_slice(&hash);
    }

    let mut region = header;
    region.extend_from_slice(&data);
    region.resize(align_up_usize(region.len(), MEDIA_UNIT as usize), 0);
    region
}

/// Cache of the decompressed primary executable.
///
/// With a writable scratch directory available the bytes live in a
/// scratch file (keeps peak memory down for large ROMs); otherwise an
/// owned in-memory copy. Either way [`load`](Self::load) hands out a
/// fresh copy so callers never alias the cached original.
pub(crate) enum CodeCache {
    Memory(Vec<u8>),
    Scratch(NamedTempFile),
}

impl CodeCache {
    pub(crate) fn store(scratch_dir: Option<&Path>, bytes: &[u8]) -> Result<Self> {
        match scratch_dir {
            Some(dir) => {
                let mut tmp = NamedTempFile::new_in(dir)?;
                tmp.write_all(bytes)?;
                tmp.flush()?;
                Ok(Self::Scratch(tmp))
            }
            None => Ok(Self::Memory(bytes.to_vec())),
        }
    }

    pub(crate) fn load(&self) -> Result<Vec<u8>> {
        match self {
            Self::Memory(bytes) => Ok(bytes.clone()),
            Self::Scratch(tmp) => Ok(std::fs::read(tmp.path())?),
        }
    }
}

/// Stamp a descriptive string and seed into an icon (SMDH) blob.
///
/// Writes "note (seed)" into the UTF-16 short-description field of each
/// of the 16 title blocks. Returns false (and leaves the blob untouched)
/// when the blob is not icon-shaped. Pure data transform; the engine
/// treats the blob as opaque otherwise.
pub fn stamp_icon_title(icon: &mut [u8], note: &str, seed: u64) -> bool {
    const TITLE_BLOCKS: usize = 16;
    const TITLE_BLOCK_SIZE: usize = 0x200;
    const TITLES_OFFSET: usize = 0x08;
    const SHORT_DESC_CHARS: usize = 0x40;

    if icon.len() < TITLES_OFFSET + TITLE_BLOCKS * TITLE_BLOCK_SIZE || &icon[0..4] != b"SMDH" {
        return false;
    }

    let text = format!("{note} ({seed})");
    let mut units: Vec<u16> = text.encode_utf16().collect();
    units.truncate(SHORT_DESC_CHARS - 1);

    for block in 0..TITLE_BLOCKS {
        let base = TITLES_OFFSET + block * TITLE_BLOCK_SIZE;
        let field = &mut icon[base..base + SHORT_DESC_CHARS * 2];
        field.fill(0);
        for (i, unit) in units.iter().enumerate() {
            field[i * 2..i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
    }
    true
}
