//! Container auto-detection.
//!
//! Determines where the primary NCCH lives inside an arbitrary input
//! file: bare NCCH (`.cxi`/`.app`), NCSD disk image (`.3ds`), or CIA
//! installable package (`.cia`).
//!
//! Probing costs a handful of 4-byte reads, so all three interpretations
//! are tried unconditionally; an ambiguous header never causes a false
//! negative.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::align::align_up;
use crate::format::{
    CIA_HEADER_SIZE, CIA_SECTION_ALIGN, MAGIC_OFFSET, NCCH_MAGIC, NCSD_MAGIC, NCSD_NCCH_OFFSET,
};
use crate::{CtrError, Result};

/// The detected outer wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// Bare NCCH, container starts at offset 0.
    Ncch,
    /// Disk image; the first NCCH sits at a fixed offset.
    Ncsd,
    /// Installable package; the content section holds the NCCH.
    Cia,
}

/// Result of a successful probe.
#[derive(Debug, Clone, Copy)]
pub struct Located {
    /// Which wrapper matched.
    pub kind: ContainerKind,
    /// Absolute byte offset of the primary NCCH.
    pub ncch_offset: u64,
}

/// Find the primary NCCH container in `file`.
///
/// Checks in order:
/// 1. CIA package: first u32 equals the package header-size constant;
///    walk the cert-chain/ticket/title-metadata preamble to the content
///    section and probe for the NCCH magic there.
/// 2. Bare NCCH magic at 0x100 (offset 0).
/// 3. NCSD magic at 0x100 (NCCH at 0x4000).
///
/// A package header-size word can collide with other formats by
/// coincidence, so a failed package walk falls through to the direct
/// probes rather than erroring out.
pub fn detect(file: &mut File) -> Result<Located> {
    if let Some(offset) = try_cia(file)? {
        tracing::debug!(ncch_offset = offset, "detected installable package");
        return Ok(Located {
            kind: ContainerKind::Cia,
            ncch_offset: offset,
        });
    }

    if probe_magic(file, 0, NCCH_MAGIC)? {
        tracing::debug!("detected bare container");
        return Ok(Located {
            kind: ContainerKind::Ncch,
            ncch_offset: 0,
        });
    }

    if probe_magic(file, 0, NCSD_MAGIC)? {
        tracing::debug!(ncch_offset = NCSD_NCCH_OFFSET, "detected disk image");
        return Ok(Located {
            kind: ContainerKind::Ncsd,
            ncch_offset: NCSD_NCCH_OFFSET,
        });
    }

    Err(CtrError::not_a_container(
        "no NCCH, NCSD, or CIA magic found",
    ))
}

/// Try the installable-package interpretation.
///
/// Returns the content-section offset if a valid embedded NCCH is found
/// there, `None` otherwise. Sections follow the header in order
/// cert-chain, ticket, title metadata, content, each aligned to a
/// 64-byte boundary.
fn try_cia(file: &mut File) -> Result<Option<u64>> {
    let mut head = [0u8; 0x14];
    if !read_exact_at(file, 0, &mut head)? {
        return Ok(None);
    }
    if u32::from_le_bytes(head[0x00..0x04].try_into().unwrap()) != CIA_HEADER_SIZE {
        return Ok(None);
    }

    let cert_size = u32::from_le_bytes(head[0x08..0x0C].try_into().unwrap()) as u64;
    let ticket_size = u32::from_le_bytes(head[0x0C..0x10].try_into().unwrap()) as u64;
    let tmd_size = u32::from_le_bytes(head[0x10..0x14].try_into().unwrap()) as u64;

    let mut offset = align_up(CIA_HEADER_SIZE as u64, CIA_SECTION_ALIGN);
    offset = align_up(offset + cert_size, CIA_SECTION_ALIGN);
    offset = align_up(offset + ticket_size, CIA_SECTION_ALIGN);
    offset = align_up(offset + tmd_size, CIA_SECTION_ALIGN);

    if probe_magic(file, offset, NCCH_MAGIC)? {
        Ok(Some(offset))
    } else {
        Ok(None)
    }
}

/// Check for a 4-byte magic at `base + 0x100`.
fn probe_magic(file: &mut File, base: u64, magic: &[u8; 4]) -> Result<bool> {
    let mut buf = [0u8; 4];
    if !read_exact_at(file, base + MAGIC_OFFSET, &mut buf)? {
        return Ok(false);
    }
    Ok(&buf == magic)
}

/// Read exactly `buf.len()` bytes at `offset`. A read past the end of
/// the file yields `Ok(false)` so a short input just fails the probe
/// instead of aborting detection.
fn read_exact_at(file: &mut File, offset: u64, buf: &mut [u8]) -> Result<bool> {
    file.seek(SeekFrom::Start(offset))?;
    match file.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}
