//! Filesystem region rebuilding.
//!
//! Content-only mutation: the directory/file tree shape never changes,
//! so the region header, level-3 sub-header, hash tables, and directory
//! metadata are copied verbatim. File data is re-packed contiguously
//! (mutated lengths shift every subsequent offset), then the whole hash
//! tree is recomputed bottom-up. The tree is always rebuilt in full;
//! there is no incremental update path.
//!
//! On-disk order after the level-3 payload is level 1 then level 2, even
//! though level 1 is derived from level 2. That quirk is part of the
//! format and is preserved exactly.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use sha2::{Digest, Sha256};

use crate::align::align_up;
use crate::format::{write_u64_le, MASTER_HASH_OFFSET, MEDIA_UNIT};
use crate::romfs::{Romfs, FILE_ENTRY_DATA_OFFSET, FILE_ENTRY_DATA_SIZE};
use crate::{CtrError, Result};

const COPY_BUF: usize = 64 * 1024;

/// Rebuild the filesystem region of `romfs` into `out` at
/// `out_region_start`, applying `overrides` (full path → new bytes).
///
/// Returns the new region length, already padded to the media unit.
/// Steps run in strict order because each step's output offset depends
/// on the previous step's total length.
pub fn rebuild_romfs(
    src: &mut File,
    romfs: &Romfs,
    overrides: &HashMap<String, Vec<u8>>,
    out: &mut File,
    out_region_start: u64,
) -> Result<u64> {
    let level3 = romfs.level3_offset;

    // 1. Region header, master-hash area, and level-3 sub-header,
    // verbatim. Master hashes get overwritten at the end.
    copy_range(
        src,
        romfs.region_offset,
        level3 + crate::format::LEVEL3_HEADER_SIZE as u64,
        out,
        out_region_start,
    )?;

    // 2. Hash tables and directory metadata are unaffected by
    // content-only changes.
    for (offset, len) in [romfs.level3.dir_hash, romfs.level3.dir_meta, romfs.level3.file_hash] {
        copy_range(
            src,
            romfs.region_offset + level3 + offset as u64,
            len as u64,
            out,
            out_region_start + level3 + offset as u64,
        )?;
    }

    // 3. Re-pack the file metadata: entries sorted by original data
    // offset (stable on walk order), new offsets assigned as a running
    // sum so the data region stays contiguous with no gaps.
    let (file_meta_off, file_meta_len) = romfs.level3.file_meta;
    let mut file_meta = vec![0u8; file_meta_len as usize];
    src.seek(SeekFrom::Start(romfs.region_offset + level3 + file_meta_off as u64))?;
    src.read_exact(&mut file_meta)?;

    let mut order: Vec<usize> = (0..romfs.files.len()).collect();
    order.sort_by_key(|&i| (romfs.files[i].data_offset, i));

    let mut running = 0u64;
    let mut layout: Vec<(usize, u64, u64)> = Vec::with_capacity(order.len());
    for &i in &order {
        let record = &romfs.files[i];
        let new_len = overrides
            .get(&record.path)
            .map(|b| b.len() as u64)
            .unwrap_or(record.size as u64);
        let base = record.meta_offset as usize;
        write_u64_le(&mut file_meta, base + FILE_ENTRY_DATA_OFFSET, running);
        write_u64_le(&mut file_meta, base + FILE_ENTRY_DATA_SIZE, new_len);
        layout.push((i, running, new_len));
        running += new_len;
    }

    out.seek(SeekFrom::Start(out_region_start + level3 + file_meta_off as u64))?;
    out.write_all(&file_meta)?;

    // 4. Stream the file data in the same order.
    let data_start = out_region_start + level3 + romfs.level3.file_data_offset as u64;
    for &(i, new_offset, new_len) in &layout {
        let record = &romfs.files[i];
        match overrides.get(&record.path) {
            Some(bytes) => {
                out.seek(SeekFrom::Start(data_start + new_offset))?;
                out.write_all(bytes)?;
            }
            None => {
                copy_range(
                    src,
                    romfs.abs_data_offset(record),
                    new_len,
                    out,
                    data_start + new_offset,
                )?;
            }
        }
    }
    let data_size = running;

    // 5. Tree geometry. The hashed level-3 payload is the whole level-3
    // region: sub-header, tables, and packed data. Block sizes come from
    // the source header's per-level exponents; they differ between
    // images and between levels.
    let level3_size = romfs.level3.file_data_offset as u64 + data_size;
    let b1 = romfs.header.levels[0].block_size();
    let b2 = romfs.header.levels[1].block_size();
    let b3 = romfs.header.levels[2].block_size();

    let num_level3_blocks = level3_size.div_ceil(b3);
    let level2_size = num_level3_blocks * 32;
    let num_level2_blocks = level2_size.div_ceil(b2);
    let level1_size = num_level2_blocks * 32;
    let num_level1_blocks = level1_size.div_ceil(b1);
    let master_size = num_level1_blocks * 32;

    if master_size > romfs.header.master_hash_size as u64 {
        return Err(CtrError::corrupt(format!(
            "rebuilt master hash needs 0x{master_size:X} bytes, header reserves 0x{:X}",
            romfs.header.master_hash_size
        )));
    }

    let level1_start = out_region_start + level3 + level3_size;
    let level2_start = level1_start + level1_size;

    // 6. Level 3 → level 2 digests, reading the freshly written region
    // back in block-size chunks. The final partial chunk is zero-padded
    // in the digest input only, never on disk. Sparse stretches (tables
    // that end short of the data start) read back as zeroes once the
    // file is extended to the payload end.
    if out.metadata()?.len() < level1_start {
        out.set_len(level1_start)?;
    }
    let level2 = hash_file_chunks(out, out_region_start + level3, level3_size, b3)?;
    out.seek(SeekFrom::Start(level2_start))?;
    out.write_all(&level2)?;

    // 7. Level 2 → level 1 digests. Physically placed *before* level 2.
    let level1 = hash_buffer_chunks(&level2, b2 as usize);
    out.seek(SeekFrom::Start(level1_start))?;
    out.write_all(&level1)?;

    // 8. Level 1 → master hashes in the region header area; the unused
    // remainder of the reserved area is zeroed.
    let master = hash_buffer_chunks(&level1, b1 as usize);
    out.seek(SeekFrom::Start(out_region_start + MASTER_HASH_OFFSET))?;
    out.write_all(&master)?;
    let spare = romfs.header.master_hash_size as usize - master.len();
    if spare > 0 {
        out.write_all(&vec![0u8; spare])?;
    }

    // 9. Per-level descriptors. Logical offsets describe the tree's
    // address space: level 1 at zero, each next level at the following
    // block boundary of its own block size. The master-hash size field
    // is left verbatim; the level-3 start derives from it.
    let l2_logical = align_up(level1_size, b2);
    let l3_logical = align_up(l2_logical + level2_size, b3);
    for (base, logical, size) in [
        (0x0C, 0, level1_size),
        (0x24, l2_logical, level2_size),
        (0x3C, l3_logical, level3_size),
    ] {
        out.seek(SeekFrom::Start(out_region_start + base))?;
        out.write_all(&(logical).to_le_bytes())?;
        out.write_all(&size.to_le_bytes())?;
    }

    // 10. Pad the region end to the media unit.
    let end = level2_start + level2_size - out_region_start;
    let region_len = align_up(end, MEDIA_UNIT);
    out.seek(SeekFrom::Start(out_region_start + end))?;
    out.write_all(&vec![0u8; (region_len - end) as usize])?;

    tracing::info!(
        files = romfs.files.len(),
        mutated = overrides.len(),
        data_size,
        region_len,
        "rebuilt filesystem region"
    );
    Ok(region_len)
}

/// Copy `len` bytes from `src` at `src_offset` to `out` at `out_offset`.
fn copy_range(src: &mut File, src_offset: u64, len: u64, out: &mut File, out_offset: u64) -> Result<()> {
    src.seek(SeekFrom::Start(src_offset))?;
    out.seek(SeekFrom::Start(out_offset))?;
    let mut buf = vec![0u8; COPY_BUF];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(COPY_BUF as u64) as usize;
        src.read_exact(&mut buf[..n])?;
        out.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Digest a file range in `block`-sized chunks, one 32-byte digest per
/// chunk, zero-padding the final partial chunk in the digest input.
fn hash_file_chunks(file: &mut File, start: u64, size: u64, block: u64) -> Result<Vec<u8>> {
    let blocks = size.div_ceil(block);
    let mut digests = Vec::with_capacity((blocks * 32) as usize);
    let mut buf = vec![0u8; block as usize];
    let mut remaining = size;
    let mut pos = start;
    while remaining > 0 {
        let n = remaining.min(block) as usize;
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut buf[..n])?;
        buf[n..].fill(0);
        digests.extend_from_slice(&Sha256::digest(&buf[..]));
        pos += n as u64;
        remaining -= n as u64;
    }
    Ok(digests)
}

/// In-memory variant of [`hash_file_chunks`] for the small upper levels.
fn hash_buffer_chunks(data: &[u8], block: usize) -> Vec<u8> {
    let mut digests = Vec::new();
    let zeroes = vec![0u8; block];
    for chunk in data.chunks(block) {
        let mut hasher = Sha256::new();
        hasher.update(chunk);
        if chunk.len() < block {
            hasher.update(&zeroes[chunk.len()..]);
        }
        digests.extend_from_slice(&hasher.finalize());
    }
    digests
}
