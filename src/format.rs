//! Binary layout constants and fixed-size header structures.
//!
//! Everything here is bit-exact and must match the format family for
//! round-trip compatibility. Multi-byte fields are little-endian except
//! where noted; the four-character magics are stored as raw ASCII bytes.

use crate::{CtrError, Result};

/// Alignment granularity for most region offsets and lengths. Region
/// offset/size fields in the NCCH header are stored in media units.
pub const MEDIA_UNIT: u64 = 0x200;

/// NCCH header (0x200) plus extended header (0x800), copied verbatim on
/// rebuild.
pub const HEADER_AND_EXHEADER_SIZE: usize = 0xA00;

/// Offset of the NCCH/NCSD magic relative to the structure start.
pub const MAGIC_OFFSET: u64 = 0x100;

/// Magic of the primary container.
pub const NCCH_MAGIC: &[u8; 4] = b"NCCH";

/// Magic of the disk-image wrapper.
pub const NCSD_MAGIC: &[u8; 4] = b"NCSD";

/// A disk image always places its first NCCH at this fixed offset.
pub const NCSD_NCCH_OFFSET: u64 = 0x4000;

/// Outer header size of the installable-package wrapper; doubles as its
/// identifying constant (first u32 of the file).
pub const CIA_HEADER_SIZE: u32 = 0x2020;

/// Sections inside an installable package are aligned to this boundary.
pub const CIA_SECTION_ALIGN: u64 = 64;

/// Fixed size of the ExeFS header block.
pub const EXEFS_HEADER_SIZE: usize = 0x200;

/// Number of slot records in the ExeFS header.
pub const EXEFS_SLOT_COUNT: usize = 10;

/// Size of one ExeFS slot record (8-byte name, u32 offset, u32 size).
pub const EXEFS_SLOT_SIZE: usize = 0x10;

/// Slot name of the primary executable.
pub const CODE_SLOT_NAME: &str = ".code";

/// Slot name of the icon/metadata (SMDH) blob.
pub const ICON_SLOT_NAME: &str = "icon";

/// RomFS region magic at offset 0x00.
pub const IVFC_MAGIC: &[u8; 4] = b"IVFC";

/// Second RomFS magic, u32 LE at offset 0x04.
pub const IVFC_MAGIC2: u32 = 0x10000;

/// Size of the RomFS region header.
pub const IVFC_HEADER_SIZE: usize = 0x5C;

/// The master-hash area begins here, directly after the padded header.
pub const MASTER_HASH_OFFSET: u64 = 0x60;

/// Self-described size of the level-3 sub-header.
pub const LEVEL3_HEADER_SIZE: u32 = 0x28;

/// Sentinel in directory/file metadata meaning "no offset".
pub const NO_OFFSET: u32 = 0xFFFF_FFFF;

/// Rebuilt RomFS regions are placed at this alignment, stricter than the
/// media unit. Known-fragile when game updates are layered on top; kept
/// as observed behavior.
pub const ROMFS_REBUILD_ALIGN: u64 = 0x1000;

// NCCH header field offsets, relative to the container start.
/// Content size in media units (u32).
pub const NCCH_CONTENT_SIZE: usize = 0x104;
/// Program id (u64).
pub const NCCH_PROGRAM_ID: usize = 0x118;
/// Crypto/content flags byte (last byte of the 8-byte flag field at 0x188).
pub const NCCH_CRYPTO_FLAGS: usize = 0x18F;
/// Plain region offset/size in media units (u32 each).
pub const NCCH_PLAIN_REGION: usize = 0x190;
/// Logo region offset/size in media units (u32 each).
pub const NCCH_LOGO_REGION: usize = 0x198;
/// ExeFS region offset/size in media units (u32 each).
pub const NCCH_EXEFS_REGION: usize = 0x1A0;
/// ExeFS superblock hash-region size in media units (u32).
pub const NCCH_EXEFS_HASH_SIZE: usize = 0x1A8;
/// RomFS region offset/size in media units (u32 each).
pub const NCCH_ROMFS_REGION: usize = 0x1B0;
/// RomFS superblock hash-region size in media units (u32).
pub const NCCH_ROMFS_HASH_SIZE: usize = 0x1B8;
/// ExeFS superblock hash (32 bytes).
pub const NCCH_EXEFS_SUPERBLOCK_HASH: usize = 0x1C0;
/// RomFS superblock hash (32 bytes).
pub const NCCH_ROMFS_SUPERBLOCK_HASH: usize = 0x1E0;

/// Crypto flag bit: content is stored unencrypted.
pub const FLAG_NO_CRYPTO: u8 = 0x04;
/// Crypto flag bit: content uses seed crypto.
pub const FLAG_SEED_CRYPTO: u8 = 0x20;

/// Extended-header byte whose bit 0 marks the primary executable as
/// compressed, relative to the container start.
pub const EXHEADER_CODE_FLAGS: usize = 0x20D;
/// Bit of [`EXHEADER_CODE_FLAGS`] marking a compressed executable.
pub const FLAG_CODE_COMPRESSED: u8 = 0x01;

/// Read a u32 LE from `buf` at `off`.
pub(crate) fn read_u32_le(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

/// Read a u64 LE from `buf` at `off`.
pub(crate) fn read_u64_le(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

/// Write a u32 LE into `buf` at `off`.
pub(crate) fn write_u32_le(buf: &mut [u8], off: usize, value: u32) {
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
}

/// Write a u64 LE into `buf` at `off`.
pub(crate) fn write_u64_le(buf: &mut [u8], off: usize, value: u64) {
    buf[off..off + 8].copy_from_slice(&value.to_le_bytes());
}

/// One level descriptor inside the RomFS region header.
#[derive(Debug, Clone, Copy)]
pub struct IvfcLevel {
    /// Offset of this level in the logical hash-tree address space.
    pub logical_offset: u64,
    /// Size of this level's hashed payload in bytes.
    pub size: u64,
    /// Block size as a power-of-two exponent. Independent per level and
    /// always re-read from the source header; different images use
    /// different block sizes.
    pub block_exponent: u32,
}

impl IvfcLevel {
    /// Block size in bytes.
    pub fn block_size(&self) -> u64 {
        1u64 << self.block_exponent
    }
}

/// RomFS region header.
///
/// Layout (0x5C bytes total):
/// ```text
/// Offset  Size  Field
/// 0x00    4     magic ("IVFC")
/// 0x04    4     magic number 0x10000 (u32 LE)
/// 0x08    4     master hash size (u32 LE)
/// 0x0C    8     level-1 logical offset (u64 LE)
/// 0x14    8     level-1 hashdata size (u64 LE)
/// 0x1C    4     level-1 block size exponent (u32 LE)
/// 0x20    4     reserved
/// 0x24    8     level-2 logical offset
/// 0x2C    8     level-2 hashdata size
/// 0x34    4     level-2 block size exponent
/// 0x38    4     reserved
/// 0x3C    8     level-3 logical offset
/// 0x44    8     level-3 hashdata size
/// 0x4C    4     level-3 block size exponent
/// 0x50    4     reserved
/// 0x54    4     info size
/// 0x58    4     reserved
/// ```
/// The master-hash area follows at 0x60.
#[derive(Debug, Clone)]
pub struct IvfcHeader {
    /// Size of the master-hash area in bytes.
    pub master_hash_size: u32,
    /// Level descriptors for levels 1-3 (level 0 is the master hash
    /// itself, stored in the header area).
    pub levels: [IvfcLevel; 3],
}

impl IvfcHeader {
    /// Check both magics without fully parsing. A mismatch means the
    /// container legitimately lacks a filesystem region, which is not an
    /// error by itself.
    pub fn matches_magic(buf: &[u8]) -> bool {
        buf.len() >= 8 && &buf[0..4] == IVFC_MAGIC && read_u32_le(buf, 4) == IVFC_MAGIC2
    }

    /// Parse the region header. The caller is expected to have checked
    /// [`matches_magic`](Self::matches_magic) first.
    pub fn from_bytes(buf: &[u8; IVFC_HEADER_SIZE]) -> Result<Self> {
        if !Self::matches_magic(buf) {
            return Err(CtrError::corrupt("bad filesystem region magic"));
        }
        let level = |base: usize| IvfcLevel {
            logical_offset: read_u64_le(buf, base),
            size: read_u64_le(buf, base + 8),
            block_exponent: read_u32_le(buf, base + 16),
        };
        Ok(Self {
            master_hash_size: read_u32_le(buf, 0x08),
            levels: [level(0x0C), level(0x24), level(0x3C)],
        })
    }

    /// Serialize the header. Reserved fields are written as zeroes and
    /// the info-size field mirrors the header size, matching freshly
    /// built images.
    pub fn to_bytes(&self) -> [u8; IVFC_HEADER_SIZE] {
        let mut buf = [0u8; IVFC_HEADER_SIZE];
        buf[0..4].copy_from_slice(IVFC_MAGIC);
        write_u32_le(&mut buf, 0x04, IVFC_MAGIC2);
        write_u32_le(&mut buf, 0x08, self.master_hash_size);
        for (i, base) in [0x0C, 0x24, 0x3C].into_iter().enumerate() {
            write_u64_le(&mut buf, base, self.levels[i].logical_offset);
            write_u64_le(&mut buf, base + 8, self.levels[i].size);
            write_u32_le(&mut buf, base + 16, self.levels[i].block_exponent);
        }
        write_u32_le(&mut buf, 0x54, IVFC_HEADER_SIZE as u32);
        buf
    }
}

/// Level-3 sub-header: offsets and lengths of the directory/file tables,
/// all relative to the level-3 start.
///
/// Layout (0x28 bytes, all u32 LE):
/// ```text
/// Offset  Field
/// 0x00    header length (must equal 0x28)
/// 0x04    directory hash table offset
/// 0x08    directory hash table length
/// 0x0C    directory metadata table offset
/// 0x10    directory metadata table length
/// 0x14    file hash table offset
/// 0x18    file hash table length
/// 0x1C    file metadata table offset
/// 0x20    file metadata table length
/// 0x24    file data offset
/// ```
#[derive(Debug, Clone, Copy)]
pub struct Level3Header {
    /// Directory hash table offset/length.
    pub dir_hash: (u32, u32),
    /// Directory metadata table offset/length.
    pub dir_meta: (u32, u32),
    /// File hash table offset/length.
    pub file_hash: (u32, u32),
    /// File metadata table offset/length.
    pub file_meta: (u32, u32),
    /// Start of the file data area.
    pub file_data_offset: u32,
}

impl Level3Header {
    /// Parse the sub-header, validating its self-described length.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < LEVEL3_HEADER_SIZE as usize {
            return Err(CtrError::corrupt("level-3 header truncated"));
        }
        let len = read_u32_le(buf, 0x00);
        if len != LEVEL3_HEADER_SIZE {
            return Err(CtrError::corrupt(format!(
                "level-3 header length 0x{len:X}, expected 0x{LEVEL3_HEADER_SIZE:X}"
            )));
        }
        Ok(Self {
            dir_hash: (read_u32_le(buf, 0x04), read_u32_le(buf, 0x08)),
            dir_meta: (read_u32_le(buf, 0x0C), read_u32_le(buf, 0x10)),
            file_hash: (read_u32_le(buf, 0x14), read_u32_le(buf, 0x18)),
            file_meta: (read_u32_le(buf, 0x1C), read_u32_le(buf, 0x20)),
            file_data_offset: read_u32_le(buf, 0x24),
        })
    }

    /// Serialize the sub-header.
    pub fn to_bytes(&self) -> [u8; LEVEL3_HEADER_SIZE as usize] {
        let mut buf = [0u8; LEVEL3_HEADER_SIZE as usize];
        write_u32_le(&mut buf, 0x00, LEVEL3_HEADER_SIZE);
        write_u32_le(&mut buf, 0x04, self.dir_hash.0);
        write_u32_le(&mut buf, 0x08, self.dir_hash.1);
        write_u32_le(&mut buf, 0x0C, self.dir_meta.0);
        write_u32_le(&mut buf, 0x10, self.dir_meta.1);
        write_u32_le(&mut buf, 0x14, self.file_hash.0);
        write_u32_le(&mut buf, 0x18, self.file_hash.1);
        write_u32_le(&mut buf, 0x1C, self.file_meta.0);
        write_u32_le(&mut buf, 0x20, self.file_meta.1);
        write_u32_le(&mut buf, 0x24, self.file_data_offset);
        buf
    }
}
