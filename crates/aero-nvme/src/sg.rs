//! Scatter-gather builder.
//!
//! Turns the data pointer of a command (PRP pair or SGL descriptor) into a validated list of
//! guest address ranges. Both forms are guest-controlled linked structures, so traversal reads
//! them through [`Dma`] one page (PRP) or one chunk of descriptors (SGL) at a time and stops at
//! the first alignment, type or length violation.

use thiserror::Error;

use crate::command::{psdt, NvmeCommand};
use crate::memory::{Dma, MemoryError, Region};
use crate::NvmeStatus;

/// Upper bound on discontiguous ranges per mapping (host scatter-gather limit).
pub const MAX_SG_ENTRIES: usize = 1024;
/// SGL segments are fetched this many descriptors at a time (one 4KiB page).
pub const SGL_SEGMENT_CHUNK: usize = 256;
/// Upper bound on segments followed for a single SGL.
pub const MAX_SGL_SEGMENTS: usize = 1024;
pub const SGL_DESCRIPTOR_SIZE: usize = 16;

/// SGL descriptor type (bits 7:4 of the last byte).
pub mod sgl_type {
    pub const DATA_BLOCK: u8 = 0x0;
    pub const BIT_BUCKET: u8 = 0x1;
    pub const SEGMENT: u8 = 0x2;
    pub const LAST_SEGMENT: u8 = 0x3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SglDescriptor {
    pub addr: u64,
    pub len: u32,
    pub kind: u8,
}

impl SglDescriptor {
    pub fn parse(bytes: &[u8; SGL_DESCRIPTOR_SIZE]) -> Self {
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&bytes[0..8]);
        SglDescriptor {
            addr: u64::from_le_bytes(addr),
            len: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            kind: bytes[15] >> 4,
        }
    }

    pub fn to_bytes(&self) -> [u8; SGL_DESCRIPTOR_SIZE] {
        let mut out = [0u8; SGL_DESCRIPTOR_SIZE];
        out[0..8].copy_from_slice(&self.addr.to_le_bytes());
        out[8..12].copy_from_slice(&self.len.to_le_bytes());
        out[15] = self.kind << 4;
        out
    }

    pub fn data_block(addr: u64, len: u32) -> Self {
        SglDescriptor {
            addr,
            len,
            kind: sgl_type::DATA_BLOCK,
        }
    }

    pub fn bit_bucket(len: u32) -> Self {
        SglDescriptor {
            addr: 0,
            len,
            kind: sgl_type::BIT_BUCKET,
        }
    }

    pub fn segment(addr: u64, len: u32) -> Self {
        SglDescriptor {
            addr,
            len,
            kind: sgl_type::SEGMENT,
        }
    }

    pub fn last_segment(addr: u64, len: u32) -> Self {
        SglDescriptor {
            addr,
            len,
            kind: sgl_type::LAST_SEGMENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SgError {
    #[error("misaligned PRP entry {addr:#x}")]
    InvalidPrpOffset { addr: u64 },
    #[error("failed to read descriptor memory at {addr:#x}")]
    Transfer { addr: u64 },
    #[error("invalid SGL segment descriptor")]
    InvalidSegment,
    #[error("segment descriptor found among data descriptors")]
    UnexpectedSegment,
    #[error("SGL segment chain exceeds 1024 segments")]
    ChainTooLong,
    #[error("invalid SGL descriptor type {0:#x}")]
    InvalidDescriptorType(u8),
    #[error("descriptor list too short: {remaining} bytes unmapped")]
    TooShort { remaining: usize },
    #[error("descriptor list too long: {excess} bytes beyond the transfer")]
    TooLong { excess: usize },
    #[error("descriptor address range overflows")]
    LengthOverflow,
    #[error("mapping mixes guest memory and controller-local memory")]
    MixedRegions,
    #[error("mapping exceeds 1024 ranges")]
    TooManyMappings,
    #[error("unsupported data pointer type {0}")]
    InvalidPsdt(u8),
}

impl SgError {
    pub fn status(&self) -> NvmeStatus {
        match self {
            SgError::InvalidPrpOffset { .. } => NvmeStatus::INVALID_PRP_OFFSET,
            SgError::Transfer { .. } => NvmeStatus::DATA_TRANSFER_ERROR,
            SgError::InvalidSegment => NvmeStatus::INVALID_SGL_SEG_DESCR,
            SgError::UnexpectedSegment | SgError::ChainTooLong => {
                NvmeStatus::INVALID_NUM_SGL_DESCRS
            }
            SgError::InvalidDescriptorType(_) => NvmeStatus::SGL_DESCR_TYPE_INVALID,
            SgError::TooShort { .. } | SgError::TooLong { .. } | SgError::LengthOverflow => {
                NvmeStatus::DATA_SGL_LEN_INVALID
            }
            SgError::MixedRegions => NvmeStatus::INVALID_USE_OF_CMB,
            SgError::TooManyMappings => NvmeStatus::INTERNAL_DEVICE_ERROR,
            SgError::InvalidPsdt(_) => NvmeStatus::INVALID_FIELD,
        }
    }

    /// Status when the failing list described metadata rather than data.
    pub fn metadata_status(&self) -> NvmeStatus {
        match self {
            SgError::TooShort { .. } | SgError::TooLong { .. } | SgError::LengthOverflow => {
                NvmeStatus::MD_SGL_LEN_INVALID
            }
            other => other.status(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub addr: u64,
    pub len: usize,
    /// Bit bucket: bytes are consumed from the transfer but never reach the host.
    pub discard: bool,
}

/// Ordered list of host ranges covering exactly one transfer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScatterGatherList {
    region: Option<Region>,
    entries: Vec<SgEntry>,
    len: usize,
}

impl ScatterGatherList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn region(&self) -> Option<Region> {
        self.region
    }

    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    pub fn total_len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a host range resolved into `region`.
    pub fn push(&mut self, region: Region, addr: u64, len: usize) -> Result<(), SgError> {
        if len == 0 {
            return Ok(());
        }
        match self.region {
            None => self.region = Some(region),
            Some(existing) if existing != region => return Err(SgError::MixedRegions),
            Some(_) => {}
        }
        self.append(
            SgEntry {
                addr,
                len,
                discard: false,
            },
            true,
        )
    }

    /// Appends a bit bucket range.
    pub fn push_discard(&mut self, len: usize) -> Result<(), SgError> {
        if len == 0 {
            return Ok(());
        }
        self.append(
            SgEntry {
                addr: 0,
                len,
                discard: true,
            },
            true,
        )
    }

    fn append(&mut self, entry: SgEntry, bounded: bool) -> Result<(), SgError> {
        if let Some(last) = self.entries.last_mut() {
            let contiguous = if entry.discard {
                last.discard
            } else {
                !last.discard && last.addr.checked_add(last.len as u64) == Some(entry.addr)
            };
            if contiguous {
                last.len += entry.len;
                self.len += entry.len;
                return Ok(());
            }
        }
        if bounded && self.entries.len() >= MAX_SG_ENTRIES {
            tracing::error!(
                entries = self.entries.len(),
                "scatter-gather mapping exceeds host range limit"
            );
            return Err(SgError::TooManyMappings);
        }
        self.entries.push(entry);
        self.len += entry.len;
        Ok(())
    }

    /// Re-chunks an extended-LBA mapping into its data and metadata parts.
    pub fn split(&self, lba_size: usize, meta_size: usize) -> (ScatterGatherList, ScatterGatherList) {
        let mut data = ScatterGatherList {
            region: self.region,
            ..Default::default()
        };
        let mut meta = ScatterGatherList {
            region: self.region,
            ..Default::default()
        };
        if meta_size == 0 || lba_size == 0 {
            return (self.clone(), meta);
        }

        let mut in_data = true;
        let mut left = lba_size;
        for entry in &self.entries {
            let mut off = 0usize;
            while off < entry.len {
                let n = (entry.len - off).min(left);
                let piece = SgEntry {
                    addr: if entry.discard {
                        0
                    } else {
                        entry.addr + off as u64
                    },
                    len: n,
                    discard: entry.discard,
                };
                let target = if in_data { &mut data } else { &mut meta };
                // Re-segmentation of an already bounded list; no new host ranges are created.
                let _ = target.append(piece, false);
                off += n;
                left -= n;
                if left == 0 {
                    in_data = !in_data;
                    left = if in_data { lba_size } else { meta_size };
                }
            }
        }
        (data, meta)
    }

    /// Copies the mapped host bytes into `buf` (host to device).
    pub fn gather(&self, dma: &Dma<'_>, buf: &mut [u8]) -> Result<(), MemoryError> {
        let mut off = 0usize;
        for entry in &self.entries {
            if off >= buf.len() {
                break;
            }
            let n = entry.len.min(buf.len() - off);
            if entry.discard {
                buf[off..off + n].fill(0);
            } else {
                dma.read(entry.addr, &mut buf[off..off + n])?;
            }
            off += n;
        }
        Ok(())
    }

    /// Copies `buf` out to the mapped host ranges (device to host).
    pub fn scatter(&self, dma: &mut Dma<'_>, buf: &[u8]) -> Result<(), MemoryError> {
        let mut off = 0usize;
        for entry in &self.entries {
            if off >= buf.len() {
                break;
            }
            let n = entry.len.min(buf.len() - off);
            if !entry.discard {
                dma.write(entry.addr, &buf[off..off + n])?;
            }
            off += n;
        }
        Ok(())
    }
}

/// Direction of the transfer a mapping is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToDevice,
    FromDevice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgOptions {
    pub page_size: usize,
    pub excess_length: bool,
    pub direction: Direction,
}

/// Maps the command data pointer according to its PSDT.
pub fn map_dptr(
    dma: &Dma<'_>,
    cmd: &NvmeCommand,
    len: usize,
    opts: SgOptions,
) -> Result<ScatterGatherList, SgError> {
    match cmd.psdt {
        psdt::PRP => map_prp(dma, opts.page_size, cmd.prp1, cmd.prp2, len),
        psdt::SGL_MPTR_CONTIGUOUS | psdt::SGL_MPTR_SGL => {
            map_sgl(dma, SglDescriptor::parse(&cmd.sgl1()), len, opts)
        }
        other => Err(SgError::InvalidPsdt(other)),
    }
}

/// Maps the separate metadata pointer (MPTR).
pub fn map_mptr(
    dma: &Dma<'_>,
    cmd: &NvmeCommand,
    len: usize,
    opts: SgOptions,
) -> Result<ScatterGatherList, SgError> {
    if cmd.psdt == psdt::SGL_MPTR_SGL {
        let mut raw = [0u8; SGL_DESCRIPTOR_SIZE];
        dma.read(cmd.mptr, &mut raw)
            .map_err(|_| SgError::Transfer { addr: cmd.mptr })?;
        return map_sgl(dma, SglDescriptor::parse(&raw), len, opts);
    }
    let mut sg = ScatterGatherList::new();
    sg.push(dma.classify(cmd.mptr), cmd.mptr, len)?;
    Ok(sg)
}

/// Maps a PRP1/PRP2 pair, following PRP lists (and their chain pointers) when needed.
pub fn map_prp(
    dma: &Dma<'_>,
    page_size: usize,
    prp1: u64,
    prp2: u64,
    len: usize,
) -> Result<ScatterGatherList, SgError> {
    let mut sg = ScatterGatherList::new();
    if len == 0 {
        return Ok(sg);
    }

    let page = page_size as u64;
    let mask = page - 1;

    let first = len.min(page_size - (prp1 & mask) as usize);
    sg.push(dma.classify(prp1), prp1, first)?;
    let mut remaining = len - first;
    if remaining == 0 {
        return Ok(sg);
    }

    if remaining <= page_size {
        if prp2 & mask != 0 {
            tracing::warn!(prp2, "misaligned PRP2");
            return Err(SgError::InvalidPrpOffset { addr: prp2 });
        }
        sg.push(dma.classify(prp2), prp2, remaining)?;
        return Ok(sg);
    }

    // PRP2 is a list pointer; it may start mid-page but must be qword aligned.
    if prp2 & 0x7 != 0 {
        tracing::warn!(prp2, "misaligned PRP list pointer");
        return Err(SgError::InvalidPrpOffset { addr: prp2 });
    }
    let max_entries = page_size / 8;
    let mut list = prp2;
    let mut nents = (page_size - (prp2 & mask) as usize) / 8;
    let mut idx = 0usize;

    while remaining > 0 {
        let mut entry = read_prp_entry(dma, list, idx)?;

        if idx == nents - 1 && remaining > page_size {
            if entry & mask != 0 {
                tracing::warn!(entry, "misaligned PRP list chain pointer");
                return Err(SgError::InvalidPrpOffset { addr: entry });
            }
            list = entry;
            idx = 0;
            nents = remaining.div_ceil(page_size).min(max_entries);
            entry = read_prp_entry(dma, list, idx)?;
        }

        if entry & mask != 0 {
            tracing::warn!(entry, "misaligned PRP list entry");
            return Err(SgError::InvalidPrpOffset { addr: entry });
        }

        let chunk = remaining.min(page_size);
        sg.push(dma.classify(entry), entry, chunk)?;
        remaining -= chunk;
        idx += 1;
    }

    Ok(sg)
}

fn read_prp_entry(dma: &Dma<'_>, list: u64, idx: usize) -> Result<u64, SgError> {
    let addr = list.wrapping_add(idx as u64 * 8);
    dma.read_u64(addr).map_err(|_| SgError::Transfer { addr })
}

/// Maps an SGL whose first descriptor is `sgl`.
pub fn map_sgl(
    dma: &Dma<'_>,
    sgl: SglDescriptor,
    len: usize,
    opts: SgOptions,
) -> Result<ScatterGatherList, SgError> {
    let mut sg = ScatterGatherList::new();
    let mut remaining = len;

    // A single data block describes the whole transfer.
    if sgl.kind == sgl_type::DATA_BLOCK {
        map_sgl_data(dma, &mut sg, &[sgl], &mut remaining, opts)?;
        return finish_sgl(sg, remaining);
    }

    let mut seg = sgl;
    let mut chunk = Vec::with_capacity(SGL_SEGMENT_CHUNK);
    for _ in 0..MAX_SGL_SEGMENTS {
        if seg.kind != sgl_type::SEGMENT && seg.kind != sgl_type::LAST_SEGMENT {
            return Err(SgError::InvalidSegment);
        }

        let seg_len = seg.len as usize;
        if seg_len == 0 || seg_len % SGL_DESCRIPTOR_SIZE != 0 {
            return Err(SgError::InvalidSegment);
        }
        if seg.addr.checked_add(seg_len as u64).is_none() {
            return Err(SgError::LengthOverflow);
        }

        let mut count = seg_len / SGL_DESCRIPTOR_SIZE;
        let mut addr = seg.addr;
        while count > SGL_SEGMENT_CHUNK {
            read_descriptors(dma, addr, SGL_SEGMENT_CHUNK, &mut chunk)?;
            map_sgl_data(dma, &mut sg, &chunk, &mut remaining, opts)?;
            count -= SGL_SEGMENT_CHUNK;
            addr += (SGL_SEGMENT_CHUNK * SGL_DESCRIPTOR_SIZE) as u64;
        }

        read_descriptors(dma, addr, count, &mut chunk)?;
        let last = chunk[count - 1];

        // A segment ending in a data descriptor terminates the list.
        if last.kind == sgl_type::DATA_BLOCK || last.kind == sgl_type::BIT_BUCKET {
            map_sgl_data(dma, &mut sg, &chunk, &mut remaining, opts)?;
            return finish_sgl(sg, remaining);
        }

        if seg.kind == sgl_type::LAST_SEGMENT {
            return Err(SgError::InvalidSegment);
        }

        map_sgl_data(dma, &mut sg, &chunk[..count - 1], &mut remaining, opts)?;
        seg = last;
    }

    Err(SgError::ChainTooLong)
}

fn finish_sgl(sg: ScatterGatherList, remaining: usize) -> Result<ScatterGatherList, SgError> {
    if remaining != 0 {
        return Err(SgError::TooShort { remaining });
    }
    Ok(sg)
}

fn read_descriptors(
    dma: &Dma<'_>,
    addr: u64,
    count: usize,
    out: &mut Vec<SglDescriptor>,
) -> Result<(), SgError> {
    let mut raw = vec![0u8; count * SGL_DESCRIPTOR_SIZE];
    dma.read(addr, &mut raw)
        .map_err(|_| SgError::Transfer { addr })?;
    out.clear();
    for bytes in raw.chunks_exact(SGL_DESCRIPTOR_SIZE) {
        let mut d = [0u8; SGL_DESCRIPTOR_SIZE];
        d.copy_from_slice(bytes);
        out.push(SglDescriptor::parse(&d));
    }
    Ok(())
}

fn map_sgl_data(
    dma: &Dma<'_>,
    sg: &mut ScatterGatherList,
    descriptors: &[SglDescriptor],
    remaining: &mut usize,
    opts: SgOptions,
) -> Result<(), SgError> {
    for d in descriptors {
        match d.kind {
            sgl_type::BIT_BUCKET if opts.direction == Direction::ToDevice => continue,
            sgl_type::BIT_BUCKET | sgl_type::DATA_BLOCK => {}
            sgl_type::SEGMENT | sgl_type::LAST_SEGMENT => return Err(SgError::UnexpectedSegment),
            other => return Err(SgError::InvalidDescriptorType(other)),
        }

        let dlen = d.len as usize;
        if dlen == 0 {
            continue;
        }

        if *remaining == 0 {
            if opts.excess_length {
                break;
            }
            return Err(SgError::TooLong { excess: dlen });
        }
        if dlen > *remaining && !opts.excess_length {
            return Err(SgError::TooLong {
                excess: dlen - *remaining,
            });
        }

        let trans = dlen.min(*remaining);
        if d.kind == sgl_type::BIT_BUCKET {
            sg.push_discard(trans)?;
        } else {
            if d.addr.checked_add(dlen as u64).is_none() {
                return Err(SgError::LengthOverflow);
            }
            sg.push(dma.classify(d.addr), d.addr, trans)?;
        }
        *remaining -= trans;
    }
    Ok(())
}
