//! Container orchestration: open, mutate, rebuild.
//!
//! A [`Container`] owns a read handle on the source file plus the
//! offsets derived from the container header, the parsed code-segment
//! slot table, and the parsed filesystem map. Mutations accumulate in
//! memory (`write_file`, `write_code`); nothing touches the source file.
//! An explicit rebuild then streams a complete new container, or writes
//! the mutated entries as a loose overlay directory for runtime
//! layered-FS loaders.
//!
//! Everything is single-threaded, synchronous, blocking I/O. A rebuild
//! either completes or leaves a partial output the caller must discard;
//! write-to-temp-then-rename hardening belongs to the caller.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::align::align_up;
use crate::detect::{self, ContainerKind};
use crate::exefs::{build_exefs, stamp_icon_title, CodeCache, Exefs, ExefsSlot};
use crate::format::{
    read_u32_le, read_u64_le, write_u32_le, CODE_SLOT_NAME, EXEFS_HEADER_SIZE, EXHEADER_CODE_FLAGS,
    FLAG_CODE_COMPRESSED, FLAG_NO_CRYPTO, FLAG_SEED_CRYPTO, HEADER_AND_EXHEADER_SIZE,
    ICON_SLOT_NAME, MEDIA_UNIT, NCCH_CONTENT_SIZE, NCCH_CRYPTO_FLAGS, NCCH_EXEFS_HASH_SIZE,
    NCCH_EXEFS_REGION, NCCH_EXEFS_SUPERBLOCK_HASH, NCCH_LOGO_REGION, NCCH_PLAIN_REGION,
    NCCH_PROGRAM_ID, NCCH_ROMFS_HASH_SIZE, NCCH_ROMFS_REGION, NCCH_ROMFS_SUPERBLOCK_HASH,
    ROMFS_REBUILD_ALIGN,
};
use crate::rebuild::rebuild_romfs;
use crate::romfs::Romfs;
use crate::{CtrError, Result};

/// Reversible transform for the stored primary executable.
///
/// The codec itself is out of scope here; callers plug in whatever the
/// container family uses. The engine only promises to call
/// [`decompress`](Self::decompress) when the extended header flags the
/// executable as compressed, and to re-apply [`compress`](Self::compress)
/// at rebuild time. In between, decompressed bytes are the single source
/// of truth.
pub trait CodeCodec {
    /// Compress decompressed code back to its stored form.
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;
    /// Expand stored code to its decompressed form.
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Well-known filesystem paths whose presence is strong evidence that a
/// parse produced real data rather than cipher noise. Some real-world
/// images carry a wrong crypto flag bit, so the flag alone cannot be
/// trusted.
const PLAINTEXT_PROBE_FILES: &[&str] = &["a/0/0/0", "static.crs"];

/// An opened container.
pub struct Container {
    path: PathBuf,
    file: Option<File>,
    kind: ContainerKind,
    ncch_offset: u64,
    header: Vec<u8>,
    exefs_offset: u64,
    exefs: Option<Exefs>,
    romfs: Option<Romfs>,
    code_cache: Option<CodeCache>,
    code_changed: bool,
    overrides: HashMap<String, Vec<u8>>,
    scratch_dir: Option<PathBuf>,
    codec: Option<Box<dyn CodeCodec>>,
}

impl Container {
    /// Open a container file.
    ///
    /// Locates the primary container inside the outer wrapper, caches
    /// the header-derived region offsets, and parses the code-segment
    /// slot table and filesystem tree. A parse failure with no plaintext
    /// evidence is reported as [`CtrError::EncryptedOrUnsupported`] so
    /// callers can show a specific message.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let located = detect::detect(&mut file)?;

        let mut header = vec![0u8; HEADER_AND_EXHEADER_SIZE];
        file.seek(SeekFrom::Start(located.ncch_offset))?;
        file.read_exact(&mut header)
            .map_err(|_| CtrError::corrupt("container header truncated"))?;

        let exefs_offset =
            located.ncch_offset + read_u32_le(&header, NCCH_EXEFS_REGION) as u64 * MEDIA_UNIT;
        let exefs_size = read_u32_le(&header, NCCH_EXEFS_REGION + 4) as u64 * MEDIA_UNIT;
        let romfs_offset =
            located.ncch_offset + read_u32_le(&header, NCCH_ROMFS_REGION) as u64 * MEDIA_UNIT;
        let romfs_size = read_u32_le(&header, NCCH_ROMFS_REGION + 4) as u64 * MEDIA_UNIT;

        let flag_plaintext = header[NCCH_CRYPTO_FLAGS] & FLAG_NO_CRYPTO != 0;

        // Filesystem first: a successfully parsed tree feeds the
        // decryption heuristic used to classify code-segment failures.
        let romfs = if romfs_size > 0 {
            match Romfs::parse(&mut file, romfs_offset, romfs_size) {
                Ok(parsed) => parsed,
                Err(err) => return Err(classify_parse_failure(err, flag_plaintext)),
            }
        } else {
            None
        };
        let sentinel_plaintext = romfs
            .as_ref()
            .map(|r| PLAINTEXT_PROBE_FILES.iter().any(|p| r.file(p).is_some()))
            .unwrap_or(false);

        let exefs = if exefs_size > 0 {
            match Exefs::parse(&mut file, exefs_offset, exefs_size) {
                Ok(parsed) => Some(parsed),
                Err(err) => {
                    return Err(classify_parse_failure(
                        err,
                        flag_plaintext || sentinel_plaintext,
                    ))
                }
            }
        } else {
            None
        };

        tracing::info!(
            path = %path.display(),
            kind = ?located.kind,
            ncch_offset = located.ncch_offset,
            files = romfs.as_ref().map(|r| r.files.len()).unwrap_or(0),
            "opened container"
        );
        Ok(Self {
            path,
            file: Some(file),
            kind: located.kind,
            ncch_offset: located.ncch_offset,
            header,
            exefs_offset,
            exefs,
            romfs,
            code_cache: None,
            code_changed: false,
            overrides: HashMap::new(),
            scratch_dir: None,
            codec: None,
        })
    }

    /// Set the codec used for the compressed primary executable.
    pub fn with_codec(mut self, codec: Box<dyn CodeCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Set a writable scratch directory. When present, the decompressed
    /// code cache lives in a scratch file there instead of memory.
    pub fn with_scratch_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.scratch_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// The detected outer wrapper.
    pub fn kind(&self) -> ContainerKind {
        self.kind
    }

    /// Program id from the container header, used to key overlay output.
    pub fn program_id(&self) -> u64 {
        read_u64_le(&self.header, NCCH_PROGRAM_ID)
    }

    /// Whether the container carries a filesystem region.
    pub fn has_filesystem(&self) -> bool {
        self.romfs.is_some()
    }

    /// Whether the container content is readable without decryption.
    ///
    /// Checks the crypto flag bit first; since some real-world images
    /// carry the wrong bit, a parsed filesystem containing one of the
    /// well-known file names also counts as plaintext evidence.
    pub fn is_plaintext(&self) -> bool {
        if self.header[NCCH_CRYPTO_FLAGS] & FLAG_NO_CRYPTO != 0 {
            return true;
        }
        self.romfs
            .as_ref()
            .map(|r| PLAINTEXT_PROBE_FILES.iter().any(|p| r.file(p).is_some()))
            .unwrap_or(false)
    }

    /// All filesystem paths, in tree-walk order.
    pub fn file_paths(&self) -> Vec<&str> {
        self.romfs
            .iter()
            .flat_map(|r| r.files.iter().map(|f| f.path.as_str()))
            .collect()
    }

    /// Read one filesystem file. A pending override written via
    /// [`write_file`](Self::write_file) is returned in place of the
    /// original bytes.
    pub fn read_file(&mut self, path: &str) -> Result<Vec<u8>> {
        if let Some(bytes) = self.overrides.get(path) {
            return Ok(bytes.clone());
        }
        let (offset, size) = {
            let romfs = self.romfs.as_ref().ok_or_else(|| no_such_file(path))?;
            let record = romfs.file(path).ok_or_else(|| no_such_file(path))?;
            (romfs.abs_data_offset(record), record.size as usize)
        };
        self.read_at(offset, size)
    }

    /// Queue new content for a filesystem file. Applied at rebuild time;
    /// the source file is never modified.
    pub fn write_file(&mut self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let romfs = self.romfs.as_ref().ok_or_else(|| no_such_file(path))?;
        if romfs.file(path).is_none() {
            return Err(no_such_file(path));
        }
        if bytes.len() as u64 > u32::MAX as u64 {
            return Err(CtrError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("new content for '{path}' exceeds 32-bit size range"),
            )));
        }
        self.overrides.insert(path.to_string(), bytes);
        Ok(())
    }

    /// Read the primary executable, decompressed.
    ///
    /// The first call parses and (if flagged) decompresses the `.code`
    /// slot, then caches the result; later calls serve fresh copies from
    /// the cache.
    pub fn read_code(&mut self) -> Result<Vec<u8>> {
        self.ensure_code_cache()?;
        self.code_cache.as_ref().unwrap().load()
    }

    /// Queue new decompressed code. Overwrites the cache unconditionally;
    /// compression is re-applied only at rebuild time if the extended
    /// header flags the executable as compressed.
    pub fn write_code(&mut self, bytes: &[u8]) -> Result<()> {
        self.code_cache = Some(CodeCache::store(self.scratch_dir.as_deref(), bytes)?);
        self.code_changed = true;
        Ok(())
    }

    /// Read the raw icon/metadata blob, if the container has one.
    pub fn read_icon(&mut self) -> Result<Option<Vec<u8>>> {
        let slot = match self.exefs.as_ref().and_then(|e| e.slot_named(ICON_SLOT_NAME)) {
            Some(slot) => *slot,
            None => return Ok(None),
        };
        self.read_exefs_slot(&slot).map(Some)
    }

    /// Drop the OS file handle. Reads after this reopen the file lazily
    /// from the cached path; detection and offset bookkeeping are not
    /// re-run.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Rebuild into a complete new container file.
    ///
    /// Output layout: header and extended header verbatim (crypto flags
    /// normalized to unsigned/unencrypted, signature zeroed), logo and
    /// plain regions relocated directly after the header, then the
    /// rebuilt code segment at the next media-unit boundary and the
    /// rebuilt filesystem at the next 4096-byte boundary, with the two
    /// superblock hashes recomputed over the header-specified hash
    /// regions.
    ///
    /// `note`/`seed` optionally stamp a descriptive string into the icon
    /// blob. On failure the partially written output must be discarded
    /// by the caller.
    pub fn rebuild_to_file(
        &mut self,
        out_path: impl AsRef<Path>,
        note: Option<&str>,
        seed: Option<u64>,
    ) -> Result<()> {
        let out_path = out_path.as_ref();
        let mut out = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(out_path)?;

        let mut header = self.header.clone();
        header[NCCH_CRYPTO_FLAGS] |= FLAG_NO_CRYPTO;
        header[NCCH_CRYPTO_FLAGS] &= !FLAG_SEED_CRYPTO;

        let mut cursor = HEADER_AND_EXHEADER_SIZE as u64;
        for region in [NCCH_LOGO_REGION, NCCH_PLAIN_REGION] {
            let offset = read_u32_le(&header, region) as u64 * MEDIA_UNIT;
            let size = read_u32_le(&header, region + 4) as u64 * MEDIA_UNIT;
            if size == 0 {
                continue;
            }
            let new_offset = align_up(cursor, MEDIA_UNIT);
            let bytes = self.read_at(self.ncch_offset + offset, size as usize)?;
            out.seek(SeekFrom::Start(new_offset))?;
            out.write_all(&bytes)?;
            write_u32_le(&mut header, region, (new_offset / MEDIA_UNIT) as u32);
            cursor = new_offset + size;
        }

        let mut exefs_location = None;
        if self.exefs.is_some() {
            let region = self.build_exefs_region(note, seed)?;
            let new_offset = align_up(cursor, MEDIA_UNIT);
            out.seek(SeekFrom::Start(new_offset))?;
            out.write_all(&region)?;
            write_u32_le(&mut header, NCCH_EXEFS_REGION, (new_offset / MEDIA_UNIT) as u32);
            write_u32_le(
                &mut header,
                NCCH_EXEFS_REGION + 4,
                (region.len() as u64 / MEDIA_UNIT) as u32,
            );
            cursor = new_offset + region.len() as u64;
            exefs_location = Some(new_offset);
        }

        let mut romfs_location = None;
        if let Some(romfs) = &self.romfs {
            // Stricter than the general media-unit alignment; this
            // constant is sensitive when game updates are layered on
            // top of the rebuilt image.
            let new_offset = align_up(cursor, ROMFS_REBUILD_ALIGN);
            let mut src = File::open(&self.path)?;
            let region_len = rebuild_romfs(&mut src, romfs, &self.overrides, &mut out, new_offset)?;
            write_u32_le(&mut header, NCCH_ROMFS_REGION, (new_offset / MEDIA_UNIT) as u32);
            write_u32_le(
                &mut header,
                NCCH_ROMFS_REGION + 4,
                (region_len / MEDIA_UNIT) as u32,
            );
            cursor = new_offset + region_len;
            romfs_location = Some(new_offset);
        } else {
            write_u32_le(&mut header, NCCH_ROMFS_REGION, 0);
            write_u32_le(&mut header, NCCH_ROMFS_REGION + 4, 0);
            header[NCCH_ROMFS_SUPERBLOCK_HASH..NCCH_ROMFS_SUPERBLOCK_HASH + 0x20].fill(0);
        }

        let total = align_up(cursor, MEDIA_UNIT);
        out.set_len(total)?;
        write_u32_le(&mut header, NCCH_CONTENT_SIZE, (total / MEDIA_UNIT) as u32);

        if let Some(offset) = exefs_location {
            let len = read_u32_le(&header, NCCH_EXEFS_HASH_SIZE) as u64 * MEDIA_UNIT;
            let digest = hash_output_range(&mut out, offset, len)?;
            header[NCCH_EXEFS_SUPERBLOCK_HASH..NCCH_EXEFS_SUPERBLOCK_HASH + 0x20]
                .copy_from_slice(&digest);
        }
        if let Some(offset) = romfs_location {
            let len = read_u32_le(&header, NCCH_ROMFS_HASH_SIZE) as u64 * MEDIA_UNIT;
            let digest = hash_output_range(&mut out, offset, len)?;
            header[NCCH_ROMFS_SUPERBLOCK_HASH..NCCH_ROMFS_SUPERBLOCK_HASH + 0x20]
                .copy_from_slice(&digest);
        }

        // The output is deliberately unsigned.
        header[..0x100].fill(0);
        out.seek(SeekFrom::Start(0))?;
        out.write_all(&header)?;

        tracing::info!(
            out = %out_path.display(),
            size = total,
            mutated_files = self.overrides.len(),
            code_changed = self.code_changed,
            "rebuilt container"
        );
        Ok(())
    }

    /// Write only the mutated entries as loose files under
    /// `out_dir/<program-id>/`, for a host loader that overlays them at
    /// runtime: changed code as `code.bin`, changed filesystem entries
    /// under `romfs/`. No hash-tree work happens in this mode; the
    /// loader verifies nothing.
    ///
    /// Returns the created per-title directory.
    pub fn rebuild_to_overlay(&mut self, out_dir: impl AsRef<Path>) -> Result<PathBuf> {
        let title_dir = out_dir
            .as_ref()
            .join(format!("{:016X}", self.program_id()));
        std::fs::create_dir_all(&title_dir)?;

        if self.code_changed {
            let code = self.code_cache.as_ref().unwrap().load()?;
            std::fs::write(title_dir.join("code.bin"), code)?;
        }

        for (path, bytes) in &self.overrides {
            let dest = title_dir.join("romfs").join(path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(dest, bytes)?;
        }

        tracing::info!(
            dir = %title_dir.display(),
            files = self.overrides.len(),
            code_changed = self.code_changed,
            "wrote overlay directory"
        );
        Ok(title_dir)
    }

    fn code_is_compressed(&self) -> bool {
        self.header[EXHEADER_CODE_FLAGS] & FLAG_CODE_COMPRESSED != 0
    }

    fn ensure_code_cache(&mut self) -> Result<()> {
        if self.code_cache.is_some() {
            return Ok(());
        }
        let slot = *self
            .exefs
            .as_ref()
            .and_then(|e| e.slot_named(CODE_SLOT_NAME))
            .ok_or_else(|| CtrError::corrupt("container has no primary executable slot"))?;
        let raw = self.read_exefs_slot(&slot)?;
        let code = if self.code_is_compressed() {
            let codec = self
                .codec
                .as_ref()
                .ok_or(CtrError::EncryptedOrUnsupported)?;
            codec.decompress(&raw)?
        } else {
            raw
        };
        self.code_cache = Some(CodeCache::store(self.scratch_dir.as_deref(), &code)?);
        Ok(())
    }

    /// Final contents for every valid slot, serialized as a fresh
    /// code-segment region with a recomputed hash list. An untouched
    /// compressed executable is copied verbatim, skipping a pointless
    /// decompress/recompress round trip.
    fn build_exefs_region(&mut self, note: Option<&str>, seed: Option<u64>) -> Result<Vec<u8>> {
        let slots: Vec<ExefsSlot> = self
            .exefs
            .as_ref()
            .unwrap()
            .slots()
            .iter()
            .filter(|s| s.is_valid())
            .copied()
            .collect();

        let mut built = Vec::with_capacity(slots.len());
        for slot in slots {
            let bytes = if slot.name() == CODE_SLOT_NAME && self.code_cache.is_some() {
                let code = self.code_cache.as_ref().unwrap().load()?;
                if self.code_is_compressed() {
                    let codec = self
                        .codec
                        .as_ref()
                        .ok_or(CtrError::EncryptedOrUnsupported)?;
                    codec.compress(&code)?
                } else {
                    code
                }
            } else {
                let mut raw = self.read_exefs_slot(&slot)?;
                if slot.name() == ICON_SLOT_NAME {
                    if let Some(note) = note {
                        stamp_icon_title(&mut raw, note, seed.unwrap_or(0));
                    }
                }
                raw
            };
            built.push((slot.name, bytes));
        }
        Ok(build_exefs(&built))
    }

    fn read_exefs_slot(&mut self, slot: &ExefsSlot) -> Result<Vec<u8>> {
        let offset = self.exefs_offset + EXEFS_HEADER_SIZE as u64 + slot.offset as u64;
        self.read_at(offset, slot.size as usize)
    }

    fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let file = self.file()?;
        let mut bytes = vec![0u8; len];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    fn file(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            tracing::debug!(path = %self.path.display(), "reopening source file");
            self.file = Some(File::open(&self.path)?);
        }
        Ok(self.file.as_mut().unwrap())
    }
}

fn classify_parse_failure(err: CtrError, plaintext_evidence: bool) -> CtrError {
    match err {
        CtrError::CorruptStructure(_) if !plaintext_evidence => CtrError::EncryptedOrUnsupported,
        other => other,
    }
}

fn no_such_file(path: &str) -> CtrError {
    CtrError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no such file in filesystem: {path}"),
    ))
}

fn hash_output_range(out: &mut File, offset: u64, len: u64) -> Result<[u8; 32]> {
    let mut bytes = vec![0u8; len as usize];
    out.seek(SeekFrom::Start(offset))?;
    out.read_exact(&mut bytes)?;
    Ok(Sha256::digest(&bytes).into())
}
