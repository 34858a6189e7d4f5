//! Synthetic container images for tests.
//!
//! Builds minimal but structurally complete images: a filesystem region
//! with real directory/file metadata tables, a code-segment region, and
//! the three outer wrappers. Hash areas of freshly built regions are
//! left zeroed; the rebuild path is what produces valid trees, and the
//! readers never verify hashes.

use crate::align::{align_up, align_up_usize};
use crate::exefs::build_exefs;
use crate::format::{
    write_u32_le, write_u64_le, CIA_HEADER_SIZE, EXHEADER_CODE_FLAGS, FLAG_CODE_COMPRESSED,
    FLAG_NO_CRYPTO, HEADER_AND_EXHEADER_SIZE, IVFC_MAGIC, IVFC_MAGIC2, LEVEL3_HEADER_SIZE,
    MASTER_HASH_OFFSET, MEDIA_UNIT, NCCH_CONTENT_SIZE, NCCH_CRYPTO_FLAGS, NCCH_EXEFS_HASH_SIZE,
    NCCH_EXEFS_REGION, NCCH_MAGIC, NCCH_PLAIN_REGION, NCCH_PROGRAM_ID, NCCH_ROMFS_HASH_SIZE,
    NCCH_ROMFS_REGION,
    NCSD_MAGIC, NCSD_NCCH_OFFSET, NO_OFFSET,
};
use crate::romfs::{DIR_ENTRY_FIXED, FILE_ENTRY_FIXED};

struct DirNode {
    name: String,
    parent: usize,
    children: Vec<usize>,
    files: Vec<usize>,
}

struct FileNode {
    name: String,
    data: Vec<u8>,
}

/// Build a filesystem region from `(path, data)` pairs.
///
/// Directories are created on first mention; file data is packed
/// contiguously in argument order. Name-length fields are written
/// padded to the 4-byte storage width, so parsing exercises the
/// padding trim.
pub(crate) fn build_romfs_region(files: &[(&str, &[u8])], exponents: (u32, u32, u32)) -> Vec<u8> {
    let mut dirs: Vec<DirNode> = vec![DirNode {
        name: String::new(),
        parent: 0,
        children: Vec::new(),
        files: Vec::new(),
    }];
    let mut file_nodes: Vec<FileNode> = Vec::new();

    for (path, data) in files {
        let mut cur = 0usize;
        let parts: Vec<&str> = path.split('/').collect();
        for part in &parts[..parts.len() - 1] {
            cur = match dirs[cur]
                .children
                .iter()
                .copied()
                .find(|&c| dirs[c].name == *part)
            {
                Some(existing) => existing,
                None => {
                    let idx = dirs.len();
                    dirs.push(DirNode {
                        name: part.to_string(),
                        parent: cur,
                        children: Vec::new(),
                        files: Vec::new(),
                    });
                    dirs[cur].children.push(idx);
                    idx
                }
            };
        }
        let file_idx = file_nodes.len();
        file_nodes.push(FileNode {
            name: parts[parts.len() - 1].to_string(),
            data: data.to_vec(),
        });
        dirs[cur].files.push(file_idx);
    }

    // Record offsets within the metadata tables.
    let name_width = |name: &str| align_up_usize(name.encode_utf16().count() * 2, 4);
    let mut dir_offsets = Vec::with_capacity(dirs.len());
    let mut pos = 0usize;
    for dir in &dirs {
        dir_offsets.push(pos as u32);
        pos += DIR_ENTRY_FIXED + name_width(&dir.name);
    }
    let dir_meta_len = pos;

    let mut file_offsets = Vec::with_capacity(file_nodes.len());
    pos = 0;
    for file in &file_nodes {
        file_offsets.push(pos as u32);
        pos += FILE_ENTRY_FIXED + name_width(&file.name);
    }
    let file_meta_len = pos;

    let put_name = |table: &mut Vec<u8>, name: &str| {
        let width = name_width(name);
        let start = table.len();
        table.resize(start + width, 0);
        for (i, unit) in name.encode_utf16().enumerate() {
            table[start + i * 2..start + i * 2 + 2].copy_from_slice(&unit.to_le_bytes());
        }
    };

    // Serialize directory metadata.
    let mut dir_meta = Vec::with_capacity(dir_meta_len);
    for (idx, dir) in dirs.iter().enumerate() {
        let sibling = dirs[dir.parent]
            .children
            .iter()
            .skip_while(|&&c| c != idx)
            .nth(1)
            .map(|&c| dir_offsets[c])
            .filter(|_| idx != 0)
            .unwrap_or(NO_OFFSET);
        let first_child = dir.children.first().map(|&c| dir_offsets[c]);
        let first_file = dir.files.first().map(|&f| file_offsets[f]);

        let base = dir_meta.len();
        dir_meta.resize(base + DIR_ENTRY_FIXED, 0);
        write_u32_le(&mut dir_meta, base, dir_offsets[dir.parent]);
        write_u32_le(&mut dir_meta, base + 0x04, sibling);
        write_u32_le(&mut dir_meta, base + 0x08, first_child.unwrap_or(NO_OFFSET));
        write_u32_le(&mut dir_meta, base + 0x0C, first_file.unwrap_or(NO_OFFSET));
        write_u32_le(&mut dir_meta, base + 0x10, NO_OFFSET);
        write_u32_le(&mut dir_meta, base + 0x14, name_width(&dir.name) as u32);
        put_name(&mut dir_meta, &dir.name);
    }

    // Serialize file metadata; data offsets are a running sum in
    // argument order.
    let mut file_meta = Vec::with_capacity(file_meta_len);
    let mut data = Vec::new();
    for (idx, file) in file_nodes.iter().enumerate() {
        let parent = dirs
            .iter()
            .position(|d| d.files.contains(&idx))
            .unwrap();
        let sibling = dirs[parent]
            .files
            .iter()
            .skip_while(|&&f| f != idx)
            .nth(1)
            .map(|&f| file_offsets[f])
            .unwrap_or(NO_OFFSET);

        let base = file_meta.len();
        file_meta.resize(base + FILE_ENTRY_FIXED, 0);
        write_u32_le(&mut file_meta, base, dir_offsets[parent]);
        write_u32_le(&mut file_meta, base + 0x04, sibling);
        write_u64_le(&mut file_meta, base + 0x08, data.len() as u64);
        write_u64_le(&mut file_meta, base + 0x10, file.data.len() as u64);
        write_u32_le(&mut file_meta, base + 0x18, NO_OFFSET);
        write_u32_le(&mut file_meta, base + 0x1C, name_width(&file.name) as u32);
        put_name(&mut file_meta, &file.name);

        data.extend_from_slice(&file.data);
    }

    // Level-3 layout: sub-header, hash tables (token-sized; readers copy
    // them verbatim and never index them), metadata tables, file data.
    let dir_hash_len = 4u32;
    let file_hash_len = 4u32;
    let dir_hash_off = LEVEL3_HEADER_SIZE;
    let dir_meta_off = dir_hash_off + dir_hash_len;
    let file_hash_off = dir_meta_off + dir_meta.len() as u32;
    let file_meta_off = file_hash_off + file_hash_len;
    let file_data_off = file_meta_off + file_meta.len() as u32;
    let level3_size = file_data_off as u64 + data.len() as u64;

    let (e1, e2, e3) = exponents;
    let (b1, b2, b3) = (1u64 << e1, 1u64 << e2, 1u64 << e3);
    let n3 = level3_size.div_ceil(b3);
    let l2_size = n3 * 32;
    let n2 = l2_size.div_ceil(b2);
    let l1_size = n2 * 32;
    let n1 = l1_size.div_ceil(b1);
    let master_hash_size = (n1 * 32) as u32;

    let level3_offset = align_up(MASTER_HASH_OFFSET + master_hash_size as u64, b3);

    let mut region = vec![0u8; level3_offset as usize];
    region[0..4].copy_from_slice(IVFC_MAGIC);
    write_u32_le(&mut region, 0x04, IVFC_MAGIC2);
    write_u32_le(&mut region, 0x08, master_hash_size);
    for (base, exp) in [(0x0C, e1), (0x24, e2), (0x3C, e3)] {
        write_u32_le(&mut region, base + 16, exp);
    }
    write_u64_le(&mut region, 0x14, l1_size);
    write_u64_le(&mut region, 0x2C, l2_size);
    write_u64_le(&mut region, 0x44, level3_size);

    let level3_base = region.len();
    region.resize(level3_base + file_data_off as usize, 0);
    write_u32_le(&mut region, level3_base, LEVEL3_HEADER_SIZE);
    write_u32_le(&mut region, level3_base + 0x04, dir_hash_off);
    write_u32_le(&mut region, level3_base + 0x08, dir_hash_len);
    write_u32_le(&mut region, level3_base + 0x0C, dir_meta_off);
    write_u32_le(&mut region, level3_base + 0x10, dir_meta.len() as u32);
    write_u32_le(&mut region, level3_base + 0x14, file_hash_off);
    write_u32_le(&mut region, level3_base + 0x18, file_hash_len);
    write_u32_le(&mut region, level3_base + 0x1C, file_meta_off);
    write_u32_le(&mut region, level3_base + 0x20, file_meta.len() as u32);
    write_u32_le(&mut region, level3_base + 0x24, file_data_off);

    region[level3_base + dir_hash_off as usize..level3_base + (dir_hash_off + dir_hash_len) as usize]
        .fill(0xFF);
    region[level3_base + dir_meta_off as usize
        ..level3_base + dir_meta_off as usize + dir_meta.len()]
        .copy_from_slice(&dir_meta);
    region[level3_base + file_hash_off as usize
        ..level3_base + (file_hash_off + file_hash_len) as usize]
        .fill(0xFF);
    region[level3_base + file_meta_off as usize
        ..level3_base + file_meta_off as usize + file_meta.len()]
        .copy_from_slice(&file_meta);
    region.extend_from_slice(&data);

    region.resize(align_up_usize(region.len(), MEDIA_UNIT as usize), 0);
    region
}

/// Level-3 start of a built region, for tests that patch raw metadata.
pub(crate) fn level3_offset_of(region: &[u8]) -> usize {
    let master_hash_size = crate::format::read_u32_le(region, 0x08) as u64;
    let b3 = 1u64 << crate::format::read_u32_le(region, 0x4C);
    align_up(MASTER_HASH_OFFSET + master_hash_size, b3) as usize
}

/// Knobs for a synthetic container.
pub(crate) struct NcchSpec<'a> {
    pub code: &'a [u8],
    pub icon: Option<&'a [u8]>,
    /// Plain-region content; padded to a media unit and placed at the
    /// end of the image so rebuilds have to relocate it.
    pub plain: Option<&'a [u8]>,
    pub romfs_files: &'a [(&'a str, &'a [u8])],
    pub exponents: (u32, u32, u32),
    pub compressed_code: bool,
    pub no_crypto_flag: bool,
    pub program_id: u64,
}

impl Default for NcchSpec<'_> {
    fn default() -> Self {
        Self {
            code: b"\xEA\x00\x00\x00default code",
            icon: None,
            plain: None,
            romfs_files: &[],
            exponents: (9, 9, 9),
            compressed_code: false,
            no_crypto_flag: true,
            program_id: 0x0004_0000_0005_5D00,
        }
    }
}

fn name8(name: &str) -> [u8; 8] {
    let mut buf = [0u8; 8];
    buf[..name.len()].copy_from_slice(name.as_bytes());
    buf
}

/// Build a bare container image.
pub(crate) fn build_ncch(spec: &NcchSpec) -> Vec<u8> {
    let mut image = vec![0u8; HEADER_AND_EXHEADER_SIZE];
    image[0x100..0x104].copy_from_slice(NCCH_MAGIC);
    write_u64_le(&mut image, NCCH_PROGRAM_ID, spec.program_id);
    if spec.no_crypto_flag {
        image[NCCH_CRYPTO_FLAGS] |= FLAG_NO_CRYPTO;
    }
    if spec.compressed_code {
        image[EXHEADER_CODE_FLAGS] |= FLAG_CODE_COMPRESSED;
    }

    let mut slots = vec![(name8(".code"), spec.code.to_vec())];
    if let Some(icon) = spec.icon {
        slots.push((name8("icon"), icon.to_vec()));
    }
    let exefs = build_exefs(&slots);
    let exefs_offset = image.len() as u64;
    image.extend_from_slice(&exefs);
    write_u32_le(
        &mut image,
        NCCH_EXEFS_REGION,
        (exefs_offset / MEDIA_UNIT) as u32,
    );
    write_u32_le(
        &mut image,
        NCCH_EXEFS_REGION + 4,
        (exefs.len() as u64 / MEDIA_UNIT) as u32,
    );
    write_u32_le(&mut image, NCCH_EXEFS_HASH_SIZE, 1);

    if !spec.romfs_files.is_empty() {
        let romfs = build_romfs_region(spec.romfs_files, spec.exponents);
        let romfs_offset = align_up(image.len() as u64, 0x1000);
        image.resize(romfs_offset as usize, 0);
        image.extend_from_slice(&romfs);
        write_u32_le(
            &mut image,
            NCCH_ROMFS_REGION,
            (romfs_offset / MEDIA_UNIT) as u32,
        );
        write_u32_le(
            &mut image,
            NCCH_ROMFS_REGION + 4,
            (romfs.len() as u64 / MEDIA_UNIT) as u32,
        );
        write_u32_le(&mut image, NCCH_ROMFS_HASH_SIZE, 1);
    }

    if let Some(plain) = spec.plain {
        let plain_offset = align_up(image.len() as u64, MEDIA_UNIT);
        image.resize(plain_offset as usize, 0);
        image.extend_from_slice(plain);
        image.resize(align_up_usize(image.len(), MEDIA_UNIT as usize), 0);
        write_u32_le(
            &mut image,
            NCCH_PLAIN_REGION,
            (plain_offset / MEDIA_UNIT) as u32,
        );
        let plain_size = (image.len() as u64 - plain_offset) / MEDIA_UNIT;
        write_u32_le(
            &mut image,
            NCCH_PLAIN_REGION + 4,
            plain_size as u32,
        );
    }

    image.resize(align_up_usize(image.len(), MEDIA_UNIT as usize), 0);
    let content_size = image.len() as u64 / MEDIA_UNIT;
    write_u32_le(
        &mut image,
        NCCH_CONTENT_SIZE,
        content_size as u32,
    );
    image
}

/// Wrap a container in a disk image.
pub(crate) fn build_ncsd(ncch: &[u8]) -> Vec<u8> {
    let mut image = vec![0u8; NCSD_NCCH_OFFSET as usize];
    image[0x100..0x104].copy_from_slice(NCSD_MAGIC);
    image.extend_from_slice(ncch);
    image
}

/// Wrap a container in an installable package.
pub(crate) fn build_cia(ncch: &[u8]) -> Vec<u8> {
    let cert_size = 0xA00u32;
    let ticket_size = 0x350u32;
    let tmd_size = 0xB34u32;

    let mut offset = align_up(CIA_HEADER_SIZE as u64, 64);
    let mut image = vec![0u8; offset as usize];
    write_u32_le(&mut image, 0x00, CIA_HEADER_SIZE);
    write_u32_le(&mut image, 0x08, cert_size);
    write_u32_le(&mut image, 0x0C, ticket_size);
    write_u32_le(&mut image, 0x10, tmd_size);

    for size in [cert_size, ticket_size, tmd_size] {
        offset = align_up(offset + size as u64, 64);
        image.resize(offset as usize, 0xAA);
    }
    image.extend_from_slice(ncch);
    image
}

/// Write an image to a fresh temp directory and return both.
pub(crate) fn write_image(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("image.bin");
    std::fs::write(&path, bytes).unwrap();
    (dir, path)
}
