//! Namespaces: geometry, LBA formats, identify data and the optional zone set.
//!
//! Logical block data occupies the start of the backend. Separate metadata, when the active format
//! has any, follows the last data block (`nlbas * lba_size`), `metadata_size` bytes per block.

use crate::backend::BlockBackend;
use crate::command::{csi, CommandSet, NvmeCommand, MAX_NAMESPACES};
use crate::params::NamespaceParams;
use crate::pi::{PiContext, PI_TUPLE_SIZE};
use crate::regs::css;
use crate::zone::ZoneSet;
use crate::{NvmeError, NvmeStatus};

pub const IDENTIFY_DATA_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbaFormat {
    pub lba_size: u32,
    pub metadata_size: u16,
}

impl LbaFormat {
    const fn new(lba_size: u32, metadata_size: u16) -> Self {
        LbaFormat {
            lba_size,
            metadata_size,
        }
    }

    /// LBA data size as a power of two.
    pub fn lbads(&self) -> u8 {
        self.lba_size.trailing_zeros() as u8
    }
}

pub const LBA_FORMATS: [LbaFormat; 8] = [
    LbaFormat::new(512, 0),
    LbaFormat::new(512, 8),
    LbaFormat::new(512, 16),
    LbaFormat::new(512, 64),
    LbaFormat::new(4096, 0),
    LbaFormat::new(4096, 8),
    LbaFormat::new(4096, 16),
    LbaFormat::new(4096, 64),
];

/// The on-media layout selected by a Format NVM command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSpec {
    pub lbaf: u8,
    pub extended: bool,
    pub pi_type: u8,
    pub pi_first: bool,
}

impl FormatSpec {
    /// Decodes and validates Format NVM CDW10.
    pub fn from_cdw10(cdw10: u32) -> Result<FormatSpec, NvmeStatus> {
        let spec = FormatSpec {
            lbaf: (cdw10 & 0xf) as u8,
            extended: cdw10 & (1 << 4) != 0,
            pi_type: ((cdw10 >> 5) & 0x7) as u8,
            pi_first: cdw10 & (1 << 8) != 0,
        };
        let format = LBA_FORMATS
            .get(spec.lbaf as usize)
            .ok_or(NvmeStatus::INVALID_FORMAT)?;
        if spec.pi_type > 3 {
            return Err(NvmeStatus::INVALID_FIELD);
        }
        if spec.pi_type != 0 && (format.metadata_size as usize) < PI_TUPLE_SIZE {
            return Err(NvmeStatus::INVALID_FORMAT);
        }
        Ok(spec)
    }
}

/// Host-visible traffic counters for the SMART log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceStats {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub reads: u64,
    pub writes: u64,
}

impl NamespaceStats {
    pub fn add(&mut self, other: &NamespaceStats) {
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.reads += other.reads;
        self.writes += other.writes;
    }
}

pub struct Namespace {
    params: NamespaceParams,
    backend: Box<dyn BlockBackend>,
    lbaf: u8,
    extended: bool,
    pi_type: u8,
    pi_first: bool,
    nlbas: u64,
    csi: u8,
    /// Command set the namespace is driven with under the current CC.CSS; `None` when I/O
    /// commands are not accepted.
    iocs: Option<CommandSet>,
    attached: bool,
    zones: Option<ZoneSet>,
    /// Deallocated or unwritten logical block error reporting.
    dulbe: bool,
    pub(crate) stats: NamespaceStats,
    auto_transition: bool,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("nsid", &self.params.nsid)
            .field("lbaf", &self.lbaf)
            .field("nlbas", &self.nlbas)
            .field("csi", &self.csi)
            .field("attached", &self.attached)
            .finish_non_exhaustive()
    }
}

fn format_index(lba_size: u32, metadata_size: u16) -> Option<u8> {
    LBA_FORMATS
        .iter()
        .position(|f| f.lba_size == lba_size && f.metadata_size == metadata_size)
        .map(|i| i as u8)
}

impl Namespace {
    pub fn new(params: NamespaceParams, backend: Box<dyn BlockBackend>) -> Result<Self, NvmeError> {
        if params.nsid == 0 || params.nsid > MAX_NAMESPACES {
            return Err(NvmeError::InvalidNamespaceId(params.nsid));
        }
        let lbaf = format_index(params.lba_size, params.metadata_size).ok_or(
            NvmeError::UnsupportedFormat {
                lba_size: params.lba_size,
                metadata_size: params.metadata_size,
            },
        )?;
        if params.pi_type > 3 {
            return Err(NvmeError::param("pi_type", "must be 0..=3"));
        }
        if params.pi_type != 0 && (params.metadata_size as usize) < PI_TUPLE_SIZE {
            return Err(NvmeError::param(
                "pi_type",
                "protection information needs at least 8 bytes of metadata",
            ));
        }
        if params.mssrl == 0 || params.mcl < params.mssrl as u32 {
            return Err(NvmeError::param("mcl", "must be at least mssrl"));
        }
        let csi = match &params.zoned {
            Some(zoned) => {
                zoned.validate()?;
                csi::ZONED
            }
            None => csi::NVM,
        };

        let mut ns = Namespace {
            lbaf,
            extended: params.extended_lba,
            pi_type: params.pi_type,
            pi_first: params.pi_first,
            attached: !params.detached,
            params,
            backend,
            nlbas: 0,
            csi,
            iocs: None,
            zones: None,
            dulbe: false,
            stats: NamespaceStats::default(),
            auto_transition: true,
        };
        ns.update_geometry()?;
        Ok(ns)
    }

    fn update_geometry(&mut self) -> Result<(), NvmeError> {
        let format = self.format();
        let block = format.lba_size as u64 + format.metadata_size as u64;
        let len = self.backend.len();
        let mut nlbas = len / block;
        if let Some(zoned) = &self.params.zoned {
            let zones = ZoneSet::new(nlbas, zoned, self.auto_transition);
            nlbas = zones.nlbas();
            self.zones = Some(zones);
        }
        if nlbas == 0 {
            return Err(NvmeError::BackendTooSmall { len });
        }
        self.nlbas = nlbas;
        Ok(())
    }

    pub(crate) fn set_auto_transition(&mut self, enabled: bool) {
        self.auto_transition = enabled;
        if let Some(zoned) = &self.params.zoned {
            self.zones = Some(ZoneSet::new(self.nlbas, zoned, enabled));
        }
    }

    pub fn nsid(&self) -> u32 {
        self.params.nsid
    }

    pub fn params(&self) -> &NamespaceParams {
        &self.params
    }

    pub fn format(&self) -> LbaFormat {
        LBA_FORMATS[self.lbaf as usize]
    }

    pub fn lba_size(&self) -> usize {
        self.format().lba_size as usize
    }

    pub fn metadata_size(&self) -> usize {
        self.format().metadata_size as usize
    }

    pub fn extended(&self) -> bool {
        self.extended
    }

    pub fn pi_type(&self) -> u8 {
        self.pi_type
    }

    pub fn nlbas(&self) -> u64 {
        self.nlbas
    }

    pub fn csi(&self) -> u8 {
        self.csi
    }

    pub fn command_set(&self) -> Option<CommandSet> {
        self.iocs
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub(crate) fn set_attached(&mut self, attached: bool) {
        self.attached = attached;
    }

    pub fn dulbe(&self) -> bool {
        self.dulbe
    }

    pub(crate) fn set_dulbe(&mut self, enabled: bool) {
        self.dulbe = enabled;
    }

    pub fn zones(&self) -> Option<&ZoneSet> {
        self.zones.as_ref()
    }

    pub fn zones_mut(&mut self) -> Option<&mut ZoneSet> {
        self.zones.as_mut()
    }

    pub fn stats(&self) -> NamespaceStats {
        self.stats
    }

    pub(crate) fn backend_mut(&mut self) -> &mut dyn BlockBackend {
        self.backend.as_mut()
    }

    pub(crate) fn backend(&self) -> &dyn BlockBackend {
        self.backend.as_ref()
    }

    /// Picks the command set for the controller's CC.CSS.
    pub(crate) fn select_command_set(&mut self, cc_css: u8) {
        self.iocs = match (self.csi, cc_css) {
            (_, css::ADMIN_ONLY) => None,
            (csi::NVM, _) => Some(CommandSet::Nvm),
            (csi::ZONED, css::ALL_SUPPORTED) => Some(CommandSet::Zoned),
            (csi::ZONED, css::NVM) => Some(CommandSet::Nvm),
            _ => None,
        };
    }

    /// Byte offset of `lba` in the backend. Fails with LBA_RANGE when it does not fit in 64 bits.
    pub fn data_offset(&self, lba: u64) -> Result<u64, NvmeStatus> {
        lba.checked_mul(self.lba_size() as u64)
            .ok_or(NvmeStatus::LBA_RANGE)
    }

    /// Metadata is stored after the data area, `metadata_size` bytes per block.
    pub fn meta_offset(&self, lba: u64) -> Result<u64, NvmeStatus> {
        lba.checked_mul(self.metadata_size() as u64)
            .and_then(|off| off.checked_add(self.nlbas * self.lba_size() as u64))
            .ok_or(NvmeStatus::LBA_RANGE)
    }

    pub fn data_len(&self, nlb: u64) -> u64 {
        nlb * self.lba_size() as u64
    }

    pub fn meta_len(&self, nlb: u64) -> u64 {
        nlb * self.metadata_size() as u64
    }

    pub fn check_bounds(&self, slba: u64, nlb: u64) -> Result<(), NvmeStatus> {
        match slba.checked_add(nlb) {
            Some(end) if end <= self.nlbas => Ok(()),
            _ => {
                tracing::debug!(slba, nlb, nsze = self.nlbas, "LBA out of range");
                Err(NvmeStatus::LBA_RANGE)
            }
        }
    }

    /// Protection context for a read/write style command, when the format carries PI.
    pub fn pi_context(&self, cmd: &NvmeCommand) -> Option<PiContext> {
        if self.pi_type == 0 {
            return None;
        }
        Some(PiContext {
            pi_type: self.pi_type,
            pi_first: self.pi_first,
            lba_size: self.lba_size(),
            meta_size: self.metadata_size(),
            slba: cmd.slba(),
            prinfo: cmd.prinfo(),
            reftag: cmd.cdw14,
            apptag: cmd.cdw15 as u16,
            appmask: (cmd.cdw15 >> 16) as u16,
        })
    }

    /// Applies a completed Format NVM.
    pub(crate) fn apply_format(&mut self, spec: FormatSpec) -> Result<(), NvmeError> {
        let previous = (self.lbaf, self.extended, self.pi_type, self.pi_first);
        self.lbaf = spec.lbaf;
        self.extended = spec.extended;
        self.pi_type = spec.pi_type;
        self.pi_first = spec.pi_first;
        if let Err(err) = self.update_geometry() {
            (self.lbaf, self.extended, self.pi_type, self.pi_first) = previous;
            return Err(err);
        }
        Ok(())
    }

    /// Identify Namespace (CNS 0x00), NVM command set view.
    pub fn identify(&self) -> Vec<u8> {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        let nsze = self.nlbas;
        data[0..8].copy_from_slice(&nsze.to_le_bytes()); // NSZE
        data[8..16].copy_from_slice(&nsze.to_le_bytes()); // NCAP
        data[16..24].copy_from_slice(&nsze.to_le_bytes()); // NUSE

        // NSFEAT: deallocated or unwritten logical block error supported.
        data[24] = 1 << 2;
        data[25] = (LBA_FORMATS.len() - 1) as u8;
        data[26] = self.lbaf | if self.extended { 1 << 4 } else { 0 };
        // MC: extended LBA and separate metadata buffer.
        data[27] = 0x3;
        // DPC: types 1-3, first or last eight bytes.
        data[28] = 0x1f;
        data[29] = self.pi_type | if self.pi_first { 1 << 3 } else { 0 };
        data[30] = self.params.shared as u8;
        // DLFEAT: deallocated blocks read as zeroes; write zeroes deallocates.
        data[33] = 0x9;

        data[74..76].copy_from_slice(&self.params.mssrl.to_le_bytes());
        data[76..80].copy_from_slice(&self.params.mcl.to_le_bytes());
        data[80] = self.params.msrc;
        data[104..120].copy_from_slice(&self.params.uuid);

        for (i, f) in LBA_FORMATS.iter().enumerate() {
            let off = 128 + i * 4;
            data[off..off + 2].copy_from_slice(&f.metadata_size.to_le_bytes());
            data[off + 2] = f.lbads();
        }
        data
    }

    /// I/O command set specific Identify Namespace (CNS 0x05).
    pub fn identify_csi(&self, csi: u8) -> Result<Vec<u8>, NvmeStatus> {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        match (csi, self.zones.as_ref()) {
            (csi::NVM, _) => Ok(data),
            (csi::ZONED, Some(zones)) => {
                let mut ozcs = 0u16;
                if zones.cross_zone_read() {
                    ozcs |= 1 << 0;
                }
                if zones.zrwa().is_some() {
                    ozcs |= 1 << 1;
                }
                data[2..4].copy_from_slice(&ozcs.to_le_bytes());
                let limit = |n: u32| n.wrapping_sub(1);
                data[4..8].copy_from_slice(&limit(zones.max_active()).to_le_bytes());
                data[8..12].copy_from_slice(&limit(zones.max_open()).to_le_bytes());
                if let Some(zrwa) = zones.zrwa() {
                    data[44..48].copy_from_slice(&limit(zones.zrwa_total()).to_le_bytes());
                    data[48..50].copy_from_slice(&(zrwa.flush_granularity as u16).to_le_bytes());
                    data[50..52].copy_from_slice(&(zrwa.size as u16).to_le_bytes());
                    // ZRWACAP: explicit ZRWA flush supported.
                    data[52] = 0x1;
                }
                for i in 0..LBA_FORMATS.len() {
                    let off = 2816 + i * 16;
                    data[off..off + 8].copy_from_slice(&zones.zone_size().to_le_bytes());
                    data[off + 8] = (zones.zd_ext_size() / 64) as u8;
                }
                Ok(data)
            }
            _ => Err(NvmeStatus::INVALID_FIELD),
        }
    }

    /// Namespace Identification Descriptor list (CNS 0x03).
    pub fn descriptors(&self) -> Vec<u8> {
        const NIDT_UUID: u8 = 0x3;
        const NIDT_CSI: u8 = 0x4;

        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        let mut off = 0;
        if self.params.uuid != [0u8; 16] {
            data[off] = NIDT_UUID;
            data[off + 1] = 16;
            data[off + 4..off + 20].copy_from_slice(&self.params.uuid);
            off += 20;
        }
        data[off] = NIDT_CSI;
        data[off + 1] = 1;
        data[off + 4] = self.csi;
        data
    }
}
