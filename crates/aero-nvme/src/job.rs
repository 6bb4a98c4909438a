//! Deferred command execution.
//!
//! A command that needs the backend is turned into a [`Job`]: an ordered list of backend
//! operations with one operation in flight at a time, plus a [`Finish`] action run once every
//! step has completed (or the first fatal step has failed).

use std::collections::VecDeque;

use crate::backend::{BlockCompletion, BlockOp, BlockStatus};
use crate::memory::{Dma, MemoryBus};
use crate::namespace::FormatSpec;
use crate::pi::PiContext;
use crate::queue::{RequestHandle, RequestState};
use crate::sg::ScatterGatherList;
use crate::{NvmeController, NvmeStatus};

#[derive(Debug)]
pub(crate) struct Job {
    pub steps: VecDeque<Step>,
    /// Read results of steps marked [`Then::Keep`], in completion order.
    pub bufs: Vec<Vec<u8>>,
    pub finish: Finish,
    /// First failure observed; `SUCCESS` while everything went through.
    pub status: NvmeStatus,
    /// Units of work completed (copy source ranges).
    pub progress: u32,
    /// The step currently submitted to the backend.
    pub current: Option<Pending>,
}

impl Job {
    pub fn new(finish: Finish) -> Self {
        Job {
            steps: VecDeque::new(),
            bufs: Vec::new(),
            finish,
            status: NvmeStatus::SUCCESS,
            progress: 0,
            current: None,
        }
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push_back(step);
    }

    pub fn with(mut self, step: Step) -> Self {
        self.push(step);
        self
    }

    /// Zone blocks reserved by this job that its finish action would still commit.
    pub fn zone_reservation(&self) -> Option<(u32, usize, u64)> {
        match self.finish {
            Finish::ZoneWrite { nsid, zone, nlb, .. } => Some((nsid, zone, nlb)),
            Finish::Copy { zone } => zone.filter(|&(_, _, n)| n != 0),
            _ => None,
        }
    }

    pub fn fail(&mut self, status: NvmeStatus) {
        if self.status.is_success() {
            self.status = status;
        }
    }
}

#[derive(Debug)]
pub(crate) struct Step {
    pub nsid: u32,
    pub op: BlockOp,
    /// Status recorded when the backend reports an error.
    pub on_error: NvmeStatus,
    /// A failed fatal step abandons the remaining steps.
    pub fatal: bool,
    pub then: Then,
}

impl Step {
    pub fn new(nsid: u32, op: BlockOp, on_error: NvmeStatus) -> Self {
        Step {
            nsid,
            op,
            on_error,
            fatal: true,
            then: Then::Nothing,
        }
    }

    pub fn read(nsid: u32, offset: u64, len: u64) -> Self {
        Step::new(
            nsid,
            BlockOp::Read { offset, len },
            NvmeStatus::UNRECOVERED_READ,
        )
        .then(Then::Keep)
    }

    pub fn write(nsid: u32, offset: u64, data: Vec<u8>) -> Self {
        Step::new(
            nsid,
            BlockOp::Write { offset, data },
            NvmeStatus::WRITE_FAULT,
        )
    }

    pub fn write_zeroes(nsid: u32, offset: u64, len: u64) -> Self {
        Step::new(
            nsid,
            BlockOp::WriteZeroes { offset, len },
            NvmeStatus::WRITE_FAULT,
        )
    }

    pub fn then(mut self, then: Then) -> Self {
        self.then = then;
        self
    }

    pub fn non_fatal(mut self) -> Self {
        self.fatal = false;
        self
    }

    /// Splits off the operation handed to the backend.
    pub fn into_parts(self) -> (BlockOp, Pending) {
        (
            self.op,
            Pending {
                nsid: self.nsid,
                on_error: self.on_error,
                fatal: self.fatal,
                then: self.then,
            },
        )
    }
}

/// Bookkeeping for a submitted step.
#[derive(Debug)]
pub(crate) struct Pending {
    pub nsid: u32,
    pub on_error: NvmeStatus,
    pub fatal: bool,
    pub then: Then,
}

/// Follow-up run after a step succeeds.
#[derive(Debug)]
pub(crate) enum Then {
    Nothing,
    /// Stash the read data in [`Job::bufs`].
    Keep,
    /// Write the staged source range (data, then metadata) to the destination.
    CopyRange {
        nsid: u32,
        offset: u64,
        meta_offset: Option<u64>,
        pi: Option<PiContext>,
        zone: Option<(usize, u64)>,
    },
    /// One copy range fully written; advances the destination zone by the range length.
    CountRange { zone: Option<(usize, u64)> },
    /// Zero the metadata of a discarded range once it reads back deallocated.
    ZeroMetadata {
        offset: u64,
        len: u64,
        meta_offset: u64,
        meta_len: u64,
    },
}

#[derive(Debug)]
pub(crate) enum Finish {
    /// Complete with the job status.
    Status,
    /// Transfer the read data (`bufs[0]`) and metadata (`bufs[1]`) to the host.
    Read {
        data: ScatterGatherList,
        meta: Option<ScatterGatherList>,
        pi: Option<PiContext>,
    },
    Compare {
        data: Vec<u8>,
        meta: Option<Vec<u8>>,
    },
    Verify {
        pi: Option<PiContext>,
    },
    /// Commit a zoned write (or append) of `nlb` blocks once the data is stored.
    ZoneWrite {
        nsid: u32,
        zone: usize,
        nlb: u64,
        result: u64,
    },
    /// A failed copy reports the number of ranges completed.
    Copy {
        /// Destination zone as (nsid, zone, blocks reserved but not yet committed).
        zone: Option<(u32, usize, u64)>,
    },
    /// Apply the new format to every listed namespace once its media is zeroed.
    Format {
        nsids: Vec<u32>,
        spec: FormatSpec,
    },
}

impl NvmeController {
    /// Submits the next step of `job`, or runs its finish action when no step is left.
    pub(crate) fn advance_job(
        &mut self,
        handle: RequestHandle,
        mut job: Job,
        memory: &mut dyn MemoryBus,
    ) {
        let Some(step) = job.steps.pop_front() else {
            self.finish_job(handle, job, memory);
            return;
        };
        let (op, pending) = step.into_parts();
        let nsid = pending.nsid;
        if !self.namespaces.contains_key(&nsid) {
            tracing::error!(nsid, "job step targets a namespace that is gone");
            job.fail(NvmeStatus::INTERNAL_DEVICE_ERROR);
            job.steps.clear();
            self.finish_job(handle, job, memory);
            return;
        }
        job.current = Some(pending);
        let Some(req) = self.request_mut(handle) else {
            return;
        };
        req.job = Some(job);
        if let Some(ns) = self.namespaces.get_mut(&nsid) {
            ns.backend_mut().submit(handle, op);
        }
    }

    pub(crate) fn on_backend_completion(
        &mut self,
        completion: BlockCompletion,
        memory: &mut dyn MemoryBus,
    ) {
        let handle = completion.handle;
        let Some(req) = self.request_mut(handle) else {
            tracing::debug!(?handle, "dropping backend completion for a stale request");
            return;
        };
        if req.state != RequestState::InFlight {
            return;
        }
        let Some(mut job) = req.job.take() else {
            return;
        };
        let Some(pending) = job.current.take() else {
            req.job = Some(job);
            return;
        };

        match completion.result {
            Err(err) if pending.fatal => {
                tracing::warn!(?handle, nsid = pending.nsid, %err, "backend operation failed");
                job.fail(pending.on_error);
                job.steps.clear();
            }
            Err(err) => {
                tracing::debug!(?handle, nsid = pending.nsid, %err, "best-effort backend operation failed");
            }
            Ok(data) => self.run_then(&mut job, pending.nsid, pending.then, data),
        }
        self.advance_job(handle, job, memory);
    }

    fn run_then(&mut self, job: &mut Job, nsid: u32, then: Then, data: Vec<u8>) {
        match then {
            Then::Nothing => {}
            Then::Keep => job.bufs.push(data),
            Then::CountRange { zone } => {
                job.progress += 1;
                if let Some((idx, nlb)) = zone {
                    if let Some(zones) = self.namespaces.get_mut(&nsid).and_then(|ns| ns.zones_mut()) {
                        zones.finish_write(idx, nlb);
                    }
                    if let Finish::Copy {
                        zone: Some((_, _, reserved)),
                    } = &mut job.finish
                    {
                        *reserved = reserved.saturating_sub(nlb);
                    }
                }
            }
            Then::CopyRange {
                nsid: dst,
                offset,
                meta_offset,
                pi,
                zone,
            } => {
                let (data, meta) = match meta_offset {
                    Some(_) => (job.bufs.pop().unwrap_or_default(), Some(data)),
                    None => (data, None),
                };
                if let (Some(ctx), Some(meta)) = (pi.as_ref(), meta.as_ref()) {
                    if ctx.checks() {
                        if let Err(status) = self.pi.check(ctx, &data, meta) {
                            job.fail(status);
                            job.steps.clear();
                            return;
                        }
                    }
                }
                let done = Then::CountRange { zone };
                match (meta_offset, meta) {
                    (Some(moff), Some(meta)) => {
                        job.steps
                            .push_front(Step::write(dst, moff, meta).then(done));
                        job.steps.push_front(Step::write(dst, offset, data));
                    }
                    _ => job.steps.push_front(Step::write(dst, offset, data).then(done)),
                }
            }
            Then::ZeroMetadata {
                offset,
                len,
                meta_offset,
                meta_len,
            } => {
                let Some(ns) = self.namespaces.get(&nsid) else {
                    return;
                };
                if ns.backend().block_status(offset, len) == BlockStatus::Deallocated {
                    job.steps
                        .push_front(Step::write_zeroes(nsid, meta_offset, meta_len).non_fatal());
                }
            }
        }
    }

    fn finish_job(&mut self, handle: RequestHandle, mut job: Job, memory: &mut dyn MemoryBus) {
        let mut status = job.status;
        let mut result = 0u64;
        let bufs = std::mem::take(&mut job.bufs);

        match job.finish {
            Finish::Status => {}
            Finish::Read { data, meta, pi } => {
                if status.is_success() {
                    status = self.finish_read(&bufs, &data, meta.as_ref(), pi.as_ref(), memory);
                }
            }
            Finish::Compare { data, meta } => {
                if status.is_success() {
                    let same_data = bufs.first().is_some_and(|b| *b == data);
                    let same_meta = match &meta {
                        Some(meta) => bufs.get(1).is_some_and(|b| b == meta),
                        None => true,
                    };
                    if !same_data || !same_meta {
                        status = NvmeStatus::COMPARE_FAILURE;
                    }
                }
            }
            Finish::Verify { pi } => {
                if let (true, Some(ctx)) = (status.is_success(), pi) {
                    if ctx.checks() {
                        let empty = Vec::new();
                        let data = bufs.first().unwrap_or(&empty);
                        let meta = bufs.get(1).unwrap_or(&empty);
                        if let Err(err) = self.pi.check(&ctx, data, meta) {
                            status = err;
                        }
                    }
                }
            }
            Finish::ZoneWrite {
                nsid,
                zone,
                nlb,
                result: assigned,
            } => {
                // The write pointer moves even when the write failed; the blocks were reserved.
                if let Some(zones) = self.namespaces.get_mut(&nsid).and_then(|ns| ns.zones_mut()) {
                    zones.finish_write(zone, nlb);
                }
                result = assigned;
            }
            Finish::Copy { zone } => {
                // Ranges that were never written still consume their reservation, as a failed
                // zoned write does, so the write pointer catches up with it.
                if let Some((nsid, idx, reserved)) = zone.filter(|&(_, _, n)| n != 0) {
                    if let Some(zones) = self.namespaces.get_mut(&nsid).and_then(|ns| ns.zones_mut()) {
                        tracing::debug!(nsid, zone = idx, reserved, "committing unwritten copy blocks");
                        zones.finish_write(idx, reserved);
                    }
                }
                if !status.is_success() {
                    result = job.progress as u64;
                }
            }
            Finish::Format { nsids, spec } => {
                if status.is_success() {
                    for nsid in nsids {
                        let Some(ns) = self.namespaces.get_mut(&nsid) else {
                            continue;
                        };
                        if let Err(err) = ns.apply_format(spec) {
                            tracing::warn!(nsid, %err, "format could not be applied");
                            status = NvmeStatus::INVALID_FORMAT;
                            break;
                        }
                        tracing::info!(nsid, lbaf = spec.lbaf, "namespace formatted");
                    }
                }
            }
        }
        self.complete(handle, status, result, memory);
    }

    fn finish_read(
        &mut self,
        bufs: &[Vec<u8>],
        data: &ScatterGatherList,
        meta: Option<&ScatterGatherList>,
        pi: Option<&PiContext>,
        memory: &mut dyn MemoryBus,
    ) -> NvmeStatus {
        let empty = Vec::new();
        let block_data = bufs.first().unwrap_or(&empty);
        let block_meta = bufs.get(1).unwrap_or(&empty);
        if let Some(ctx) = pi {
            if ctx.checks() {
                if let Err(status) = self.pi.check(ctx, block_data, block_meta) {
                    return status;
                }
            }
        }
        let mut dma = Dma::new(memory, &mut self.local);
        if data.scatter(&mut dma, block_data).is_err() {
            return NvmeStatus::DATA_TRANSFER_ERROR;
        }
        if let Some(meta) = meta {
            if meta.scatter(&mut dma, block_meta).is_err() {
                return NvmeStatus::DATA_TRANSFER_ERROR;
            }
        }
        NvmeStatus::SUCCESS
    }
}
