//! NVM and zoned I/O command sets.
//!
//! Handlers validate a command completely before anything is staged, then describe the backend
//! work as a [`Job`]. Write-side data is gathered from the host up front; read-side data is
//! scattered once the backend has produced it.

use crate::backend::{BlockOp, BlockStatus};
use crate::command::{
    command_effects, CommandEffects, IoOpcode, NvmeCommand, MAX_NAMESPACES, NSID_BROADCAST,
};
use crate::job::{Finish, Job, Step, Then};
use crate::memory::Dma;
use crate::pi::PiContext;
use crate::sg::{map_dptr, map_mptr, Direction, ScatterGatherList};
use crate::zone::{action, OpenKind, ReportFilter, ZONE_REPORT_HEADER_SIZE};
use crate::{Done, MemoryBus, Namespace, NvmeController, NvmeStatus, Outcome};

const DSM_RANGE_SIZE: usize = 16;
const COPY_RANGE_SIZE: usize = 32;

/// Dataset management attribute: deallocate.
const DSM_AD: u32 = 1 << 2;

/// Geometry of one block transfer, resolved against the namespace format.
#[derive(Debug, Clone, Copy)]
struct Transfer {
    slba: u64,
    nlb: u64,
    data_offset: u64,
    data_len: u64,
    meta_offset: u64,
    /// Metadata stored on the media for the range.
    meta_len: u64,
    /// Metadata exchanged with the host; zero when PRACT strips an 8-byte tuple.
    host_meta: usize,
    lba_size: usize,
    meta_size: usize,
    extended: bool,
    pi: Option<PiContext>,
}

impl Transfer {
    /// Resolves a range of the namespace. Ranges that fall outside it fail with LBA_RANGE.
    fn new(ns: &Namespace, cmd: &NvmeCommand, slba: u64, nlb: u64) -> Result<Self, NvmeStatus> {
        ns.check_bounds(slba, nlb)?;
        let pi = ns.pi_context(cmd).map(|ctx| PiContext { slba, ..ctx });
        let meta_len = ns.meta_len(nlb);
        let stripped = pi.is_some_and(|ctx| ctx.pract() && ctx.tuple_only());
        Ok(Transfer {
            slba,
            nlb,
            data_offset: ns.data_offset(slba)?,
            data_len: ns.data_len(nlb),
            meta_offset: ns.meta_offset(slba)?,
            meta_len,
            host_meta: if stripped { 0 } else { meta_len as usize },
            lba_size: ns.lba_size(),
            meta_size: ns.metadata_size(),
            extended: ns.extended(),
            pi,
        })
    }

    /// Bytes described by the host data (and metadata) pointers.
    fn host_len(&self) -> usize {
        self.data_len as usize + self.host_meta
    }

    /// Backend reads for the data and, when the format has any, the metadata.
    fn read_steps(&self, nsid: u32, job: &mut Job) {
        job.push(Step::read(nsid, self.data_offset, self.data_len));
        if self.meta_len != 0 {
            job.push(Step::read(nsid, self.meta_offset, self.meta_len));
        }
    }
}

impl NvmeController {
    pub(crate) fn execute_io(&mut self, cmd: &NvmeCommand, memory: &mut dyn MemoryBus) -> Outcome {
        let nsid = cmd.nsid;
        if nsid == 0 || (nsid > MAX_NAMESPACES && nsid != NSID_BROADCAST) {
            tracing::debug!(nsid, "invalid namespace id");
            return Err(NvmeStatus::INVALID_NSID);
        }
        if nsid == NSID_BROADCAST && cmd.opc == IoOpcode::Flush.raw() {
            return Ok(self.broadcast_flush());
        }

        let ns = self.io_namespace(nsid)?;
        let Some(set) = ns.command_set() else {
            return Err(NvmeStatus::INVALID_OPCODE);
        };
        if !command_effects(set, cmd.opc).contains(CommandEffects::CSUPP) {
            tracing::debug!(opcode = cmd.opc, ?set, "unsupported I/O opcode");
            return Err(NvmeStatus::INVALID_OPCODE);
        }
        let Some(op) = IoOpcode::from_raw(cmd.opc) else {
            return Err(NvmeStatus::INVALID_OPCODE);
        };
        if cmd.fuse != 0 {
            return Err(NvmeStatus::INVALID_FIELD);
        }

        match op {
            IoOpcode::Flush => Ok(Done::Job(Job::new(Finish::Status).with(Step::new(
                nsid,
                BlockOp::Flush,
                NvmeStatus::INTERNAL_DEVICE_ERROR,
            )))),
            IoOpcode::Read => self.read(cmd, memory),
            IoOpcode::Write | IoOpcode::WriteZeroes | IoOpcode::ZoneAppend => {
                self.write(cmd, op, memory)
            }
            IoOpcode::Compare => self.compare(cmd, memory),
            IoOpcode::Verify => self.verify(cmd),
            IoOpcode::DatasetManagement => self.dataset_management(cmd, memory),
            IoOpcode::Copy => self.copy(cmd, memory),
            IoOpcode::ZoneMgmtSend => self.zone_mgmt_send(cmd, memory),
            IoOpcode::ZoneMgmtRecv => self.zone_mgmt_recv(cmd, memory),
        }
    }

    fn io_namespace(&self, nsid: u32) -> Result<&Namespace, NvmeStatus> {
        self.namespaces
            .get(&nsid)
            .filter(|ns| ns.is_attached())
            .ok_or(NvmeStatus::INVALID_FIELD)
    }

    /// Flushes every attached namespace in ascending nsid order.
    fn broadcast_flush(&self) -> Done {
        let mut job = Job::new(Finish::Status);
        for ns in self.namespaces.values().filter(|ns| ns.is_attached()) {
            job.push(Step::new(
                ns.nsid(),
                BlockOp::Flush,
                NvmeStatus::INTERNAL_DEVICE_ERROR,
            ));
        }
        Done::Job(job)
    }

    /// Maps the host buffers of a transfer. Extended-LBA buffers interleave data and metadata and
    /// are split per block; otherwise metadata comes from MPTR.
    fn map_transfer(
        &mut self,
        cmd: &NvmeCommand,
        t: &Transfer,
        direction: Direction,
        memory: &mut dyn MemoryBus,
    ) -> Result<(ScatterGatherList, Option<ScatterGatherList>), NvmeStatus> {
        let opts = self.sg_options(direction);
        let dma = Dma::new(memory, &mut self.local);
        if t.extended && t.host_meta != 0 {
            let sg = map_dptr(&dma, cmd, t.host_len(), opts).map_err(|e| e.status())?;
            let (data, meta) = sg.split(t.lba_size, t.meta_size);
            return Ok((data, Some(meta)));
        }
        let data = map_dptr(&dma, cmd, t.data_len as usize, opts).map_err(|e| e.status())?;
        if t.extended || t.host_meta == 0 {
            return Ok((data, None));
        }
        let meta = map_mptr(&dma, cmd, t.host_meta, opts).map_err(|e| e.metadata_status())?;
        Ok((data, Some(meta)))
    }

    fn gather(
        &mut self,
        sg: &ScatterGatherList,
        memory: &mut dyn MemoryBus,
    ) -> Result<Vec<u8>, NvmeStatus> {
        let dma = Dma::new(memory, &mut self.local);
        let mut buf = vec![0u8; sg.total_len()];
        sg.gather(&dma, &mut buf)
            .map_err(|_| NvmeStatus::DATA_TRANSFER_ERROR)?;
        Ok(buf)
    }

    /// Range checks shared by every command that reads stored blocks.
    fn check_readable(&self, nsid: u32, t: &Transfer) -> Result<(), NvmeStatus> {
        let ns = self.io_namespace(nsid)?;
        ns.check_bounds(t.slba, t.nlb)?;
        if let Some(zones) = ns.zones() {
            zones.check_read(t.slba, t.nlb)?;
        }
        if ns.dulbe() && ns.backend().block_status(t.data_offset, t.data_len) != BlockStatus::Allocated
        {
            tracing::debug!(nsid, slba = t.slba, nlb = t.nlb, "read of deallocated blocks");
            return Err(NvmeStatus::DEALLOCATED_OR_UNWRITTEN);
        }
        Ok(())
    }

    fn read(&mut self, cmd: &NvmeCommand, memory: &mut dyn MemoryBus) -> Outcome {
        let nsid = cmd.nsid;
        let t = Transfer::new(self.io_namespace(nsid)?, cmd, cmd.slba(), cmd.nlb() as u64)?;
        self.check_mdts(t.host_len())?;
        self.check_readable(nsid, &t)?;
        let (data, meta) = self.map_transfer(cmd, &t, Direction::FromDevice, memory)?;

        if let Some(ns) = self.namespaces.get_mut(&nsid) {
            ns.stats.reads += 1;
            ns.stats.bytes_read += t.data_len;
        }
        let mut job = Job::new(Finish::Read {
            data,
            meta,
            pi: t.pi,
        });
        t.read_steps(nsid, &mut job);
        Ok(Done::Job(job))
    }

    fn write(&mut self, cmd: &NvmeCommand, op: IoOpcode, memory: &mut dyn MemoryBus) -> Outcome {
        let nsid = cmd.nsid;
        let zeroes = op == IoOpcode::WriteZeroes;
        let append = op == IoOpcode::ZoneAppend;
        let nlb = cmd.nlb() as u64;
        let ns = self.io_namespace(nsid)?;

        let mut slba = cmd.slba();
        if append {
            let zones = ns.zones().ok_or(NvmeStatus::INVALID_OPCODE)?;
            let data_len = ns.data_len(nlb) as usize;
            if self.params.zasl != 0 && data_len > self.page_size << self.params.zasl {
                tracing::debug!(data_len, zasl = self.params.zasl, "append exceeds ZASL");
                return Err(NvmeStatus::INVALID_FIELD);
            }
            let zone = zones
                .zone(zones.zone_index(slba))
                .ok_or(NvmeStatus::LBA_RANGE)?;
            if slba != zone.zslba || zone.has_zrwa() {
                return Err(NvmeStatus::INVALID_FIELD);
            }
            slba = zone.write_ptr();
        }

        let t = Transfer::new(ns, cmd, slba, nlb)?;
        if !zeroes {
            self.check_mdts(t.host_len())?;
        }
        let zone = match ns.zones() {
            Some(zones) => Some(zones.check_write(slba, nlb)?),
            None => None,
        };

        let mut job = Job::new(match zone {
            Some(idx) => Finish::ZoneWrite {
                nsid,
                zone: idx,
                nlb,
                result: if append { slba } else { 0 },
            },
            None => Finish::Status,
        });

        if zeroes {
            job.push(Step::write_zeroes(nsid, t.data_offset, t.data_len));
            match t.pi {
                Some(ctx) if t.meta_len != 0 && ctx.pract() => {
                    let mut meta = vec![0u8; t.meta_len as usize];
                    self.pi
                        .generate(&ctx, &vec![0u8; t.data_len as usize], &mut meta);
                    job.push(Step::write(nsid, t.meta_offset, meta));
                }
                _ if t.meta_len != 0 => {
                    job.push(Step::write_zeroes(nsid, t.meta_offset, t.meta_len));
                }
                _ => {}
            }
        } else {
            let (data_sg, meta_sg) = self.map_transfer(cmd, &t, Direction::ToDevice, memory)?;
            let data = self.gather(&data_sg, memory)?;
            let mut meta = match &meta_sg {
                Some(sg) => self.gather(sg, memory)?,
                None => vec![0u8; t.meta_len as usize],
            };
            if let Some(ctx) = t.pi {
                if ctx.pract() {
                    self.pi.generate(&ctx, &data, &mut meta);
                } else if ctx.checks() {
                    self.pi.check(&ctx, &data, &meta)?;
                }
            }
            job.push(Step::write(nsid, t.data_offset, data));
            if t.meta_len != 0 {
                job.push(Step::write(nsid, t.meta_offset, meta));
            }
        }

        let Some(ns) = self.namespaces.get_mut(&nsid) else {
            return Err(NvmeStatus::INTERNAL_DEVICE_ERROR);
        };
        if let (Some(idx), Some(zones)) = (zone, ns.zones_mut()) {
            zones.begin_write(idx, slba, nlb)?;
        }
        ns.stats.writes += 1;
        if !zeroes {
            ns.stats.bytes_written += t.data_len;
        }
        tracing::trace!(nsid, slba, nlb, ?op, "write staged");
        Ok(Done::Job(job))
    }

    fn compare(&mut self, cmd: &NvmeCommand, memory: &mut dyn MemoryBus) -> Outcome {
        let nsid = cmd.nsid;
        let t = Transfer::new(self.io_namespace(nsid)?, cmd, cmd.slba(), cmd.nlb() as u64)?;
        self.check_mdts(t.host_len())?;
        self.check_readable(nsid, &t)?;

        let (data_sg, meta_sg) = self.map_transfer(cmd, &t, Direction::ToDevice, memory)?;
        let data = self.gather(&data_sg, memory)?;
        let meta = match &meta_sg {
            Some(sg) => Some(self.gather(sg, memory)?),
            None => None,
        };

        let mut job = Job::new(Finish::Compare {
            data,
            meta: meta.clone(),
        });
        job.push(Step::read(nsid, t.data_offset, t.data_len));
        if meta.is_some() {
            job.push(Step::read(nsid, t.meta_offset, t.meta_len));
        }
        Ok(Done::Job(job))
    }

    fn verify(&mut self, cmd: &NvmeCommand) -> Outcome {
        let nsid = cmd.nsid;
        let t = Transfer::new(self.io_namespace(nsid)?, cmd, cmd.slba(), cmd.nlb() as u64)?;
        if self.params.vsl != 0 && t.data_len as usize > self.page_size << self.params.vsl {
            tracing::debug!(len = t.data_len, vsl = self.params.vsl, "verify exceeds VSL");
            return Err(NvmeStatus::INVALID_FIELD);
        }
        self.check_readable(nsid, &t)?;

        let mut job = Job::new(Finish::Verify { pi: t.pi });
        t.read_steps(nsid, &mut job);
        Ok(Done::Job(job))
    }

    fn dataset_management(&mut self, cmd: &NvmeCommand, memory: &mut dyn MemoryBus) -> Outcome {
        let nsid = cmd.nsid;
        let nr = (cmd.cdw10 & 0xff) as usize + 1;
        if cmd.cdw11 & DSM_AD == 0 {
            // Only deallocation has an effect; other attributes are hints.
            return Ok(Done::Complete(0));
        }
        let raw = self.dma_from_host(cmd, nr * DSM_RANGE_SIZE, memory)?;
        let ns = self.io_namespace(nsid)?;
        let dmrsl = self.params.dmrsl as u64;

        let mut job = Job::new(Finish::Status);
        for range in raw.chunks_exact(DSM_RANGE_SIZE) {
            let nlb = u32::from_le_bytes([range[4], range[5], range[6], range[7]]) as u64;
            let mut slba = [0u8; 8];
            slba.copy_from_slice(&range[8..16]);
            let slba = u64::from_le_bytes(slba);

            if nlb == 0 || nlb > dmrsl || ns.check_bounds(slba, nlb).is_err() {
                tracing::debug!(nsid, slba, nlb, "skipping dataset management range");
                continue;
            }
            let offset = ns.data_offset(slba)?;
            let len = ns.data_len(nlb);
            let mut step = Step::new(
                nsid,
                BlockOp::Discard { offset, len },
                NvmeStatus::INTERNAL_DEVICE_ERROR,
            )
            .non_fatal();
            if ns.metadata_size() != 0 {
                step = step.then(Then::ZeroMetadata {
                    offset,
                    len,
                    meta_offset: ns.meta_offset(slba)?,
                    meta_len: ns.meta_len(nlb),
                });
            }
            job.push(step);
        }
        Ok(Done::Job(job))
    }

    fn copy(&mut self, cmd: &NvmeCommand, memory: &mut dyn MemoryBus) -> Outcome {
        let nsid = cmd.nsid;
        let nr = (cmd.cdw12 & 0xff) as usize + 1;
        let format = (cmd.cdw12 >> 8) & 0xf;
        let prinfor = ((cmd.cdw12 >> 12) & 0xf) as u8;
        let sdlba = cmd.cdw10 as u64 | (cmd.cdw11 as u64) << 32;

        if format != 0 {
            return Err(NvmeStatus::INVALID_FIELD);
        }
        let limits = {
            let params = self.io_namespace(nsid)?.params();
            (params.msrc as usize, params.mssrl as u64, params.mcl as u64)
        };
        let (msrc, mssrl, mcl) = limits;
        if nr > msrc + 1 {
            return Err(NvmeStatus::CMD_SIZE_LIMIT);
        }

        let raw = self.dma_from_host(cmd, nr * COPY_RANGE_SIZE, memory)?;
        let ns = self.io_namespace(nsid)?;

        struct Range {
            slba: u64,
            nlb: u64,
            reftag: u32,
            apptag: u16,
            appmask: u16,
        }
        let ranges: Vec<Range> = raw
            .chunks_exact(COPY_RANGE_SIZE)
            .map(|r| {
                let mut slba = [0u8; 8];
                slba.copy_from_slice(&r[8..16]);
                Range {
                    slba: u64::from_le_bytes(slba),
                    nlb: u16::from_le_bytes([r[16], r[17]]) as u64 + 1,
                    reftag: u32::from_le_bytes([r[24], r[25], r[26], r[27]]),
                    apptag: u16::from_le_bytes([r[28], r[29]]),
                    appmask: u16::from_le_bytes([r[30], r[31]]),
                }
            })
            .collect();

        let mut total = 0u64;
        for range in &ranges {
            if range.nlb > mssrl {
                return Err(NvmeStatus::CMD_SIZE_LIMIT);
            }
            total += range.nlb;
        }
        if total > mcl {
            return Err(NvmeStatus::CMD_SIZE_LIMIT);
        }

        ns.check_bounds(sdlba, total)?;
        let zone = match ns.zones() {
            Some(zones) => Some(zones.check_write(sdlba, total)?),
            None => None,
        };

        // Sources are processed in order; the first invalid one ends the copy.
        let mut job = Job::new(Finish::Copy { zone: None });
        let mut dlba = sdlba;
        for range in &ranges {
            let source = Transfer::new(ns, cmd, range.slba, range.nlb)
                .and_then(|t| self.check_readable(nsid, &t).map(|()| t));
            let t = match source {
                Ok(t) => t,
                Err(status) => {
                    tracing::debug!(nsid, slba = range.slba, nlb = range.nlb, %status, "invalid copy source");
                    job.fail(status);
                    break;
                }
            };
            let pi = t.pi.map(|ctx| PiContext {
                prinfo: prinfor,
                reftag: range.reftag,
                apptag: range.apptag,
                appmask: range.appmask,
                ..ctx
            });
            let copy = Then::CopyRange {
                nsid,
                offset: ns.data_offset(dlba)?,
                meta_offset: (t.meta_len != 0)
                    .then(|| ns.meta_offset(dlba))
                    .transpose()?,
                pi,
                zone: zone.map(|idx| (idx, range.nlb)),
            };
            if t.meta_len != 0 {
                job.push(Step::read(nsid, t.data_offset, t.data_len));
                job.push(Step::read(nsid, t.meta_offset, t.meta_len).then(copy));
            } else {
                job.push(Step::read(nsid, t.data_offset, t.data_len).then(copy));
            }
            dlba += range.nlb;
        }

        let copied = dlba - sdlba;
        let Some(ns) = self.namespaces.get_mut(&nsid) else {
            return Err(NvmeStatus::INTERNAL_DEVICE_ERROR);
        };
        if let (Some(idx), Some(zones), true) = (zone, ns.zones_mut(), copied != 0) {
            zones.begin_write(idx, sdlba, copied)?;
            job.finish = Finish::Copy {
                zone: Some((nsid, idx, copied)),
            };
        }
        tracing::debug!(nsid, sdlba, ranges = nr, copied, "copy staged");
        Ok(Done::Job(job))
    }

    fn zone_mgmt_send(&mut self, cmd: &NvmeCommand, memory: &mut dyn MemoryBus) -> Outcome {
        let nsid = cmd.nsid;
        let slba = cmd.slba();
        let act = (cmd.cdw13 & 0xff) as u8;
        let all = cmd.cdw13 & (1 << 8) != 0;
        let zrwaa = cmd.cdw13 & (1 << 9) != 0;
        tracing::debug!(nsid, slba, act, all, zrwaa, "zone management send");

        if all && (act == action::SET_ZD_EXT || act == action::ZRWA_FLUSH || zrwaa) {
            return Err(NvmeStatus::INVALID_FIELD);
        }

        let ns = self.io_namespace(nsid)?;
        let zones = ns.zones().ok_or(NvmeStatus::INVALID_OPCODE)?;
        let idx = zones.zone_index(slba);
        if !all {
            if slba >= ns.nlbas() {
                return Err(NvmeStatus::LBA_RANGE);
            }
            let zone = zones.zone(idx).ok_or(NvmeStatus::LBA_RANGE)?;
            if act != action::ZRWA_FLUSH && slba != zone.zslba {
                return Err(NvmeStatus::INVALID_FIELD);
            }
        }

        let ext = if act == action::SET_ZD_EXT {
            let size = zones.zd_ext_size();
            if size == 0 {
                return Err(NvmeStatus::INVALID_FIELD);
            }
            Some(self.dma_from_host(cmd, size, memory)?)
        } else {
            None
        };

        let Some(ns) = self.namespaces.get_mut(&nsid) else {
            return Err(NvmeStatus::INTERNAL_DEVICE_ERROR);
        };
        let Some(zones) = ns.zones_mut() else {
            return Err(NvmeStatus::INVALID_OPCODE);
        };

        let mut reset = Vec::new();
        match (act, all) {
            (action::OPEN, false) => {
                let kind = if zrwaa {
                    OpenKind::ExplicitZrwa
                } else {
                    OpenKind::Explicit
                };
                zones.open(idx, kind)?;
            }
            (action::OPEN | action::CLOSE | action::FINISH | action::OFFLINE, true) => {
                zones.apply_all(act)?;
            }
            (action::CLOSE | action::FINISH | action::OFFLINE, false) => zones.apply(idx, act)?,
            (action::RESET, true) => reset = zones.apply_all(act)?,
            (action::RESET, false) => {
                let written = zones
                    .zone(idx)
                    .is_some_and(|z| z.write_ptr() != z.zslba || z.state().is_open());
                zones.reset(idx)?;
                if written {
                    reset.push(idx);
                }
            }
            (action::SET_ZD_EXT, false) => {
                zones.set_zd_ext(idx, ext.as_deref().unwrap_or_default())?;
            }
            (action::ZRWA_FLUSH, false) => zones.flush_zrwa(idx, slba)?,
            _ => return Err(NvmeStatus::INVALID_FIELD),
        }

        if reset.is_empty() {
            return Ok(Done::Complete(0));
        }
        // Reset zones read back as zeroes.
        let mut job = Job::new(Finish::Status);
        for idx in reset {
            let Some((zslba, zcap)) = ns.zones().and_then(|z| z.zone(idx)).map(|z| (z.zslba, z.zcap))
            else {
                continue;
            };
            job.push(Step::write_zeroes(nsid, ns.data_offset(zslba)?, ns.data_len(zcap)));
            if ns.metadata_size() != 0 {
                job.push(Step::write_zeroes(nsid, ns.meta_offset(zslba)?, ns.meta_len(zcap)));
            }
        }
        Ok(Done::Job(job))
    }

    fn zone_mgmt_recv(&mut self, cmd: &NvmeCommand, memory: &mut dyn MemoryBus) -> Outcome {
        let nsid = cmd.nsid;
        let slba = cmd.slba();
        let act = (cmd.cdw13 & 0xff) as u8;
        let filter = ((cmd.cdw13 >> 8) & 0xff) as u8;
        let partial = cmd.cdw13 & (1 << 16) != 0;
        let len = (cmd.cdw12 as usize + 1) * 4;

        let ns = self.io_namespace(nsid)?;
        let zones = ns.zones().ok_or(NvmeStatus::INVALID_OPCODE)?;
        if slba >= ns.nlbas() {
            return Err(NvmeStatus::LBA_RANGE);
        }
        let extended = match act {
            0 => false,
            1 if zones.zd_ext_size() != 0 => true,
            _ => return Err(NvmeStatus::INVALID_FIELD),
        };
        let filter = ReportFilter::from_raw(filter).ok_or(NvmeStatus::INVALID_FIELD)?;
        if len < ZONE_REPORT_HEADER_SIZE {
            return Err(NvmeStatus::INVALID_FIELD);
        }
        self.check_mdts(len)?;

        let report = zones.report(zones.zone_index(slba), filter, extended, partial, len);
        self.dma_to_host(cmd, &report, memory)?;
        Ok(Done::Complete(0))
    }
}
