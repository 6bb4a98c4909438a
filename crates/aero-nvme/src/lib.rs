//! NVMe (NVM Express) controller command-processing core.
//!
//! The controller owns the BAR0 register file, every submission/completion queue pair, the
//! namespace table and the asynchronous event queue. It is driven from outside through three
//! collaborators:
//! - a [`MemoryBus`] for guest physical memory (rings, PRP/SGL lists, data buffers),
//! - one [`BlockBackend`] per namespace, completing block operations asynchronously,
//! - an optional [`InterruptSink`] that delivers the vectors the controller decides to raise.
//!
//! Everything runs on the caller's thread. A register or doorbell write processes as much work as
//! is available and returns; commands waiting on a backend finish on a later call to
//! [`NvmeController::poll`] (or any doorbell write), once the backend reports completion.
//!
//! Supported:
//! - BAR0 register set (CAP/VS/INTMS/INTMC/CC/CSTS/AQA/ASQ/ACQ/CMBLOC/CMBSZ/PMR* + doorbells)
//! - Admin commands: queue management, Identify, Get/Set Features, Get Log Page, Abort,
//!   Asynchronous Event Request, Namespace Attachment, Format NVM
//! - NVM commands: Read, Write, Write Zeroes, Compare, Verify, Flush, Dataset Management, Copy
//! - Zoned namespaces: Zone Management Send/Receive, Zone Append, zone random write areas
//! - PRP and SGL data pointers, controller memory buffer and persistent memory region
//! - Pin-based interrupts (via [`NvmeController::intx_level`]) and MSI-X vectors.

mod admin;
pub mod aer;
pub mod backend;
pub mod command;
mod error;
pub mod features;
mod io;
pub mod irq;
mod job;
pub mod log_page;
pub mod memory;
pub mod namespace;
pub mod params;
pub mod pi;
pub mod queue;
pub mod regs;
pub mod sg;
mod status;
pub mod zone;

use std::collections::{BTreeMap, BTreeSet};

pub use aer::{AsyncEvent, AsyncEventQueue};
pub use backend::{BlockBackend, BlockCompletion, BlockOp, BlockStatus, MemBackend};
pub use command::NvmeCommand;
pub use error::{BackendError, NvmeError};
pub use irq::InterruptSink;
pub use memory::{MemoryBus, MemoryError};
pub use namespace::Namespace;
pub use params::{NamespaceParams, NvmeParams, ZonedParams};
pub use queue::{CompletionQueue, CqEntry, RequestHandle, SubmissionQueue};
pub use status::NvmeStatus;

use aer::{error_info, event_type};
use command::NVME_SQE_SIZE;
use features::Features;
use irq::InterruptNotifier;
use job::Job;
use memory::{Dma, LocalMemory, LocalRegion};
use pi::{ProtectionInfo, T10Dif};
use queue::{Request, RequestState};
use regs::*;
use sg::{map_dptr, Direction, SgOptions};

/// How a handler finished with a command.
#[derive(Debug)]
pub(crate) enum Done {
    /// Completed successfully; the value fills completion dwords 0-1.
    Complete(u64),
    /// Continues as backend operations.
    Job(Job),
    /// Parked until an async event is available.
    Deferred,
}

pub(crate) type Outcome = Result<Done, NvmeStatus>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// CC.EN cleared: queues and in-flight work are dropped, configuration is kept.
    Controller,
    /// Function level reset: additionally restores registers and features to their defaults.
    Function,
}

/// NVMe controller state machine + BAR0 register space.
pub struct NvmeController {
    params: NvmeParams,

    // Registers (BAR0)
    cap: Capabilities,
    cc: ControllerConfig,
    csts: Csts,
    aqa: u32,
    asq: u64,
    acq: u64,
    pmrctl: u32,
    pmr_base: Option<u64>,

    page_size: usize,
    local: LocalMemory,

    /// Indexed by queue id; slot 0 is the admin pair.
    sqs: Vec<Option<SubmissionQueue>>,
    cqs: Vec<Option<CompletionQueue>>,

    namespaces: BTreeMap<u32, Namespace>,
    features: Features,
    aeq: AsyncEventQueue,
    /// Changed Namespace List log contents.
    changed_nsids: BTreeSet<u32>,

    irq: InterruptNotifier,
    pi: Box<dyn ProtectionInfo>,
    next_tag: u64,
}

impl std::fmt::Debug for NvmeController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NvmeController")
            .field("cc", &self.cc)
            .field("csts", &self.csts)
            .field("page_size", &self.page_size)
            .field("namespaces", &self.namespaces.keys().collect::<Vec<_>>())
            .field("irq", &self.irq)
            .finish_non_exhaustive()
    }
}

impl NvmeController {
    pub fn new(params: NvmeParams) -> Result<Self, NvmeError> {
        params.validate()?;

        let local = LocalMemory {
            cmb: (params.cmb_size != 0).then(|| LocalRegion::new(params.cmb_size as usize)),
            pmr: (params.pmr_size != 0).then(|| LocalRegion::new(params.pmr_size as usize)),
        };
        let cap = Capabilities::new(params.mqes, local.cmb.is_some(), local.pmr.is_some());
        let nqueues = params.max_ioqpairs as usize + 1;

        Ok(NvmeController {
            cap,
            cc: ControllerConfig(0),
            csts: Csts::empty(),
            aqa: 0,
            asq: 0,
            acq: 0,
            pmrctl: 0,
            pmr_base: None,
            page_size: 4096,
            local,
            sqs: (0..nqueues).map(|_| None).collect(),
            cqs: (0..nqueues).map(|_| None).collect(),
            namespaces: BTreeMap::new(),
            features: Features::default(),
            aeq: AsyncEventQueue::new(params.aer_max_queued, params.aerl),
            changed_nsids: BTreeSet::new(),
            irq: InterruptNotifier::default(),
            pi: Box::new(T10Dif),
            next_tag: 0,
            params,
        })
    }

    pub fn params(&self) -> &NvmeParams {
        &self.params
    }

    pub fn bar0_len(&self) -> u64 {
        // Registers (0x0..0x1000) + one SQ tail and one CQ head doorbell per queue pair.
        (NVME_DOORBELL_BASE + self.sqs.len() as u64 * 8).next_power_of_two()
    }

    /// Adds a namespace. It becomes visible to the host once attached (see
    /// [`NamespaceParams::detached`]).
    pub fn attach_namespace(&mut self, mut ns: Namespace) -> Result<(), NvmeError> {
        let nsid = ns.nsid();
        if self.namespaces.contains_key(&nsid) {
            return Err(NvmeError::NamespaceExists(nsid));
        }
        ns.set_auto_transition(self.params.auto_transition_zones);
        if self.csts.contains(Csts::RDY) {
            ns.select_command_set(self.cc.css());
        }
        tracing::info!(
            nsid,
            nlbas = ns.nlbas(),
            lba_size = ns.lba_size(),
            zoned = ns.zones().is_some(),
            "namespace added"
        );
        self.namespaces.insert(nsid, ns);
        Ok(())
    }

    /// Removes a namespace, aborting requests waiting on its backend. Their completions are
    /// posted on the next [`NvmeController::poll`].
    pub fn detach_namespace(&mut self, nsid: u32) -> Result<Namespace, NvmeError> {
        if !self.namespaces.contains_key(&nsid) {
            return Err(NvmeError::NamespaceNotFound(nsid));
        }
        let affected: Vec<RequestHandle> = self
            .in_flight()
            .into_iter()
            .filter(|&h| self.current_nsid(h) == Some(nsid))
            .collect();
        for handle in affected {
            self.cancel_backend(handle);
            self.finalize(handle, NvmeStatus::ABORT_REQUESTED, 0);
        }
        tracing::info!(nsid, "namespace removed");
        self.namespaces
            .remove(&nsid)
            .ok_or(NvmeError::NamespaceNotFound(nsid))
    }

    pub fn namespace(&self, nsid: u32) -> Option<&Namespace> {
        self.namespaces.get(&nsid)
    }

    pub fn namespace_mut(&mut self, nsid: u32) -> Option<&mut Namespace> {
        self.namespaces.get_mut(&nsid)
    }

    pub fn set_interrupt_sink(&mut self, sink: Option<Box<dyn InterruptSink>>) {
        self.irq.set_sink(sink);
    }

    /// Mirrors the MSI-X enable bit of the PCI function.
    pub fn set_msix_enabled(&mut self, enabled: bool) {
        self.irq.set_msix(enabled);
        self.refresh_intx_level();
    }

    /// Legacy INTx level (asserted = true).
    pub fn intx_level(&self) -> bool {
        self.irq.level()
    }

    pub fn set_protection(&mut self, pi: Box<dyn ProtectionInfo>) {
        self.pi = pi;
    }

    /// Guest physical address the controller memory buffer BAR is mapped at.
    pub fn set_cmb_base(&mut self, base: Option<u64>) {
        if let Some(cmb) = self.local.cmb.as_mut() {
            cmb.set_base(base);
        }
    }

    /// Guest physical address of the persistent memory region BAR. The region only decodes while
    /// PMRCTL.EN is set.
    pub fn set_pmr_base(&mut self, base: Option<u64>) {
        self.pmr_base = base;
        self.update_pmr_mapping();
    }

    pub fn cmb(&self) -> Option<&LocalRegion> {
        self.local.cmb.as_ref()
    }

    pub fn pmr(&self) -> Option<&LocalRegion> {
        self.local.pmr.as_ref()
    }

    fn update_pmr_mapping(&mut self) {
        let base = if self.pmrctl & 1 != 0 {
            self.pmr_base
        } else {
            None
        };
        if let Some(pmr) = self.local.pmr.as_mut() {
            pmr.set_base(base);
        }
    }

    pub fn csts(&self) -> Csts {
        self.csts
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn async_event_queue(&self) -> &AsyncEventQueue {
        &self.aeq
    }

    pub fn submission_queue(&self, sqid: u16) -> Option<&SubmissionQueue> {
        self.sqs.get(sqid as usize)?.as_ref()
    }

    pub fn completion_queue(&self, cqid: u16) -> Option<&CompletionQueue> {
        self.cqs.get(cqid as usize)?.as_ref()
    }

    pub fn mmio_read(&self, offset: u64, size: usize) -> u64 {
        match (offset, size) {
            (NVME_REG_CAP, 8) => self.cap.0,
            (NVME_REG_CAP, 4) => self.cap.0 & 0xffff_ffff,
            (NVME_REG_CAP_HI, 4) => self.cap.0 >> 32,
            (NVME_REG_VS, 4) => NVME_VERSION as u64,
            (NVME_REG_INTMS, 4) | (NVME_REG_INTMC, 4) => self.irq.mask() as u64,
            (NVME_REG_CC, 4) => self.cc.0 as u64,
            (NVME_REG_CSTS, 4) => self.csts.bits() as u64,
            (NVME_REG_NSSR, 4) => 0,
            (NVME_REG_AQA, 4) => self.aqa as u64,
            (NVME_REG_ASQ, 8) => self.asq,
            (NVME_REG_ASQ, 4) => self.asq & 0xffff_ffff,
            (NVME_REG_ASQ_HI, 4) => self.asq >> 32,
            (NVME_REG_ACQ, 8) => self.acq,
            (NVME_REG_ACQ, 4) => self.acq & 0xffff_ffff,
            (NVME_REG_ACQ_HI, 4) => self.acq >> 32,
            (NVME_REG_CMBLOC, 4) if self.local.cmb.is_some() => CMB_BAR as u64,
            (NVME_REG_CMBSZ, 4) => cmbsz(self.params.cmb_size) as u64,
            (NVME_REG_PMRCAP, 4) => pmrcap(self.local.pmr.is_some()) as u64,
            (NVME_REG_PMRCTL, 4) => self.pmrctl as u64,
            (NVME_REG_PMRSTS, 4) => {
                // NRDY while the region is disabled.
                let not_ready = self.local.pmr.is_some() && self.pmrctl & 1 == 0;
                (not_ready as u64) << 8
            }
            _ => 0,
        }
    }

    /// Register write from the transport. Doorbell writes run queue processing before returning.
    pub fn mmio_write(
        &mut self,
        offset: u64,
        size: usize,
        value: u64,
        memory: &mut dyn MemoryBus,
    ) {
        match (offset, size) {
            (
                NVME_REG_AQA | NVME_REG_ASQ | NVME_REG_ASQ_HI | NVME_REG_ACQ | NVME_REG_ACQ_HI,
                _,
            ) if self.cc.enabled() => {
                tracing::warn!(offset, "admin queue attributes are read-only while enabled");
            }
            (NVME_REG_INTMS, 4) => {
                if !self.irq.msix() {
                    self.irq.set_mask(value as u32);
                }
            }
            (NVME_REG_INTMC, 4) => {
                if !self.irq.msix() {
                    self.irq.clear_mask(value as u32);
                }
            }
            (NVME_REG_CC, 4) => self.write_cc(value as u32, memory),
            (NVME_REG_NSSR, 4) => {
                tracing::debug!(value, "NVM subsystem reset is not supported");
            }
            (NVME_REG_AQA, 4) => self.aqa = value as u32,
            (NVME_REG_ASQ, 8) => self.asq = value,
            (NVME_REG_ASQ, 4) => self.asq = (self.asq & !0xffff_ffff) | (value & 0xffff_ffff),
            (NVME_REG_ASQ_HI, 4) => self.asq = (self.asq & 0xffff_ffff) | (value << 32),
            (NVME_REG_ACQ, 8) => self.acq = value,
            (NVME_REG_ACQ, 4) => self.acq = (self.acq & !0xffff_ffff) | (value & 0xffff_ffff),
            (NVME_REG_ACQ_HI, 4) => self.acq = (self.acq & 0xffff_ffff) | (value << 32),
            (NVME_REG_PMRCTL, 4) if self.local.pmr.is_some() => {
                self.pmrctl = value as u32 & 1;
                self.update_pmr_mapping();
            }
            _ if offset >= NVME_DOORBELL_BASE && size == 4 => {
                match Doorbell::decode(offset, self.cap.dstrd()) {
                    Some(doorbell) => self.on_doorbell_write(doorbell, value as u32, memory),
                    None => {
                        tracing::warn!(offset, "write to an invalid doorbell offset");
                        self.doorbell_error(error_info::INVALID_DB_REGISTER, memory);
                    }
                }
            }
            _ => {
                tracing::trace!(offset, size, value, "ignored register write");
            }
        }
    }

    fn write_cc(&mut self, value: u32, memory: &mut dyn MemoryBus) {
        let prev = self.cc;
        self.cc = ControllerConfig(value);

        if !prev.enabled() && self.cc.enabled() {
            if let Err(reason) = self.start() {
                tracing::warn!(reason, cc = value, "controller enable failed");
                self.csts = Csts::CFS;
            }
        } else if prev.enabled() && !self.cc.enabled() {
            self.reset(ResetKind::Controller);
        }

        if self.cc.shn() != 0 {
            if !self.csts.contains(Csts::SHST_COMPLETE) {
                self.shutdown(memory);
            }
        } else {
            self.csts.remove(Csts::SHST_MASK);
        }
    }

    /// CC.EN 0 -> 1: validates the admin queue configuration and creates the admin pair.
    fn start(&mut self) -> Result<(), &'static str> {
        if self.sqs[0].is_some() || self.cqs[0].is_some() {
            return Err("admin queues already exist");
        }
        // AQA: ASQS bits 11:0, ACQS bits 27:16, both 0-based.
        let asqs = self.aqa & 0xfff;
        let acqs = (self.aqa >> 16) & 0xfff;
        if asqs == 0 || acqs == 0 {
            return Err("admin queue size is zero");
        }
        let mps = self.cc.mps();
        if mps < self.cap.mpsmin() || mps > self.cap.mpsmax() {
            return Err("unsupported memory page size");
        }
        let page_size = 1usize << (12 + mps);
        let mask = page_size as u64 - 1;
        if self.asq == 0 || self.asq & mask != 0 {
            return Err("admin submission queue is not page aligned");
        }
        if self.acq == 0 || self.acq & mask != 0 {
            return Err("admin completion queue is not page aligned");
        }
        if !self.cap.supports_css(self.cc.css()) {
            return Err("unsupported command set selection");
        }
        if self.cc.iocqes() != 4 || self.cc.iosqes() != 6 {
            return Err("unsupported I/O queue entry size");
        }

        self.page_size = page_size;
        let mut cq = CompletionQueue::new(0, self.acq, acqs as u16 + 1, 0, true);
        cq.sqs.push(0);
        self.cqs[0] = Some(cq);
        self.sqs[0] = Some(SubmissionQueue::new(0, 0, self.asq, asqs as u16 + 1));

        let css = self.cc.css();
        for ns in self.namespaces.values_mut() {
            ns.select_command_set(css);
        }
        self.features.timestamp.reset();
        self.csts = Csts::RDY;
        self.refresh_intx_level();
        tracing::info!(page_size, asqs = asqs + 1, acqs = acqs + 1, css, "controller ready");
        Ok(())
    }

    /// Drops every queue and request. See [`ResetKind`].
    pub fn reset(&mut self, kind: ResetKind) {
        tracing::info!(?kind, "controller reset");
        for handle in self.in_flight() {
            self.cancel_backend(handle);
        }
        self.sqs.iter_mut().for_each(|sq| *sq = None);
        self.cqs.iter_mut().for_each(|cq| *cq = None);
        self.aeq.reset();
        self.csts = Csts::empty();

        if kind == ResetKind::Function {
            self.cc = ControllerConfig(0);
            self.aqa = 0;
            self.asq = 0;
            self.acq = 0;
            self.pmrctl = 0;
            self.update_pmr_mapping();
            self.irq.reset();
            self.features = Features::default();
            self.page_size = 4096;
            self.changed_nsids.clear();
            for ns in self.namespaces.values_mut() {
                ns.set_dulbe(false);
            }
        }
        self.refresh_intx_level();
    }

    /// Finishes outstanding work, flushes every backend and reports shutdown complete.
    pub fn shutdown(&mut self, memory: &mut dyn MemoryBus) {
        self.run(memory);
        // No request owns the flush; its completion is dropped as stale.
        let handle = RequestHandle {
            sqid: u16::MAX,
            slot: 0,
            tag: self.next_tag,
        };
        self.next_tag += 1;
        for ns in self.namespaces.values_mut() {
            ns.backend_mut().submit(handle, BlockOp::Flush);
        }
        self.drain_backends(memory);
        self.csts.remove(Csts::SHST_MASK);
        self.csts.insert(Csts::SHST_COMPLETE);
        tracing::info!("shutdown complete");
    }

    /// Collects backend completions and processes every queue until nothing moves.
    pub fn poll(&mut self, memory: &mut dyn MemoryBus) {
        self.run(memory);
    }

    /// Queues an asynchronous event and delivers it if a request is outstanding.
    pub fn enqueue_event(&mut self, event: AsyncEvent, memory: &mut dyn MemoryBus) {
        self.aeq.enqueue(event);
        self.process_aers(memory);
    }

    pub fn on_doorbell_write(&mut self, doorbell: Doorbell, value: u32, memory: &mut dyn MemoryBus) {
        if !self.csts.contains(Csts::RDY) || self.csts.contains(Csts::CFS) {
            tracing::debug!(?doorbell, value, "doorbell write while not ready");
            return;
        }
        match doorbell {
            Doorbell::SqTail(sqid) => {
                let Some(sq) = self.sqs.get_mut(sqid as usize).and_then(Option::as_mut) else {
                    tracing::warn!(sqid, "doorbell for a nonexistent submission queue");
                    return self.doorbell_error(error_info::INVALID_DB_REGISTER, memory);
                };
                if value >= sq.size as u32 {
                    tracing::warn!(sqid, value, size = sq.size, "submission queue tail out of range");
                    return self.doorbell_error(error_info::INVALID_DB_VALUE, memory);
                }
                sq.tail = value as u16;
                tracing::trace!(sqid, tail = value, "sq tail doorbell");
                self.run(memory);
            }
            Doorbell::CqHead(cqid) => {
                let Some(cq) = self.cqs.get_mut(cqid as usize).and_then(Option::as_mut) else {
                    tracing::warn!(cqid, "doorbell for a nonexistent completion queue");
                    return self.doorbell_error(error_info::INVALID_DB_REGISTER, memory);
                };
                if value >= cq.size as u32 {
                    tracing::warn!(cqid, value, size = cq.size, "completion queue head out of range");
                    return self.doorbell_error(error_info::INVALID_DB_VALUE, memory);
                }
                cq.head = value as u16;
                tracing::trace!(cqid, head = value, "cq head doorbell");
                self.post_cqes(cqid, memory);
                let idle = self
                    .completion_queue(cqid)
                    .filter(|cq| cq.is_empty() && cq.irq_enabled)
                    .map(|cq| cq.vector);
                if let (Some(vector), true) = (idle, self.irq.msix()) {
                    self.irq.deassert(vector);
                }
                self.refresh_intx_level();
                self.run(memory);
            }
        }
    }

    fn doorbell_error(&mut self, info: u8, memory: &mut dyn MemoryBus) {
        if self.aeq.outstanding() == 0 {
            return;
        }
        self.aeq.enqueue(AsyncEvent::new(
            event_type::ERROR,
            info,
            log_page::lid::ERROR_INFO,
        ));
        self.process_aers(memory);
    }

    pub fn create_completion_queue(
        &mut self,
        cqid: u16,
        vector: u16,
        base: u64,
        size: u32,
        irq_enabled: bool,
    ) -> Result<(), NvmeStatus> {
        if cqid == 0 || self.cqs.get(cqid as usize).map_or(true, Option::is_some) {
            tracing::debug!(cqid, "invalid completion queue id");
            return Err(NvmeStatus::INVALID_QID);
        }
        self.check_queue_geometry(base, size)?;
        if vector >= self.params.msix_qsize || (!self.irq.msix() && vector != 0) {
            tracing::debug!(cqid, vector, "invalid interrupt vector");
            return Err(NvmeStatus::INVALID_IRQ_VECTOR);
        }
        self.cqs[cqid as usize] = Some(CompletionQueue::new(
            cqid,
            base,
            size as u16,
            vector,
            irq_enabled,
        ));
        tracing::debug!(cqid, base, size, vector, irq_enabled, "completion queue created");
        Ok(())
    }

    pub fn create_submission_queue(
        &mut self,
        sqid: u16,
        cqid: u16,
        base: u64,
        size: u32,
    ) -> Result<(), NvmeStatus> {
        if cqid == 0 || self.completion_queue(cqid).is_none() {
            tracing::debug!(sqid, cqid, "submission queue bound to an invalid completion queue");
            return Err(NvmeStatus::INVALID_CQID);
        }
        if sqid == 0 || self.sqs.get(sqid as usize).map_or(true, Option::is_some) {
            tracing::debug!(sqid, "invalid submission queue id");
            return Err(NvmeStatus::INVALID_QID);
        }
        self.check_queue_geometry(base, size)?;
        self.sqs[sqid as usize] = Some(SubmissionQueue::new(sqid, cqid, base, size as u16));
        if let Some(cq) = self.cqs[cqid as usize].as_mut() {
            cq.sqs.push(sqid);
        }
        tracing::debug!(sqid, cqid, base, size, "submission queue created");
        Ok(())
    }

    fn check_queue_geometry(&self, base: u64, size: u32) -> Result<(), NvmeStatus> {
        let max = (self.cap.mqes() as u32 + 1).min(u16::MAX as u32);
        if size < 2 || size > max {
            tracing::debug!(size, max, "queue size out of range");
            return Err(NvmeStatus::MAX_QSIZE_EXCEEDED);
        }
        if base == 0 || base & (self.page_size as u64 - 1) != 0 {
            tracing::warn!(base, "queue base is not page aligned");
            return Err(NvmeStatus::INVALID_PRP_OFFSET);
        }
        Ok(())
    }

    /// Deletes an I/O submission queue: in-flight requests complete as aborted, completions
    /// that still fit are posted and the rest are dropped with the queue.
    pub fn delete_submission_queue(
        &mut self,
        sqid: u16,
        memory: &mut dyn MemoryBus,
    ) -> Result<(), NvmeStatus> {
        let Some(sq) = self.submission_queue(sqid).filter(|_| sqid != 0) else {
            return Err(NvmeStatus::INVALID_QID);
        };
        let cqid = sq.cqid;
        let in_flight = sq.handles_in(RequestState::InFlight);
        for handle in in_flight {
            self.cancel_backend(handle);
            self.finalize(handle, NvmeStatus::ABORT_SQ_DELETED, 0);
        }
        self.post_cqes(cqid, memory);

        if let Some(cq) = self.cqs.get_mut(cqid as usize).and_then(Option::as_mut) {
            let before = cq.pending.len();
            cq.pending.retain(|h| h.sqid != sqid);
            let dropped = before - cq.pending.len();
            if dropped != 0 {
                tracing::debug!(sqid, cqid, dropped, "completions dropped with the queue");
            }
            cq.sqs.retain(|&s| s != sqid);
        }
        self.sqs[sqid as usize] = None;
        tracing::debug!(sqid, "submission queue deleted");
        Ok(())
    }

    pub fn delete_completion_queue(&mut self, cqid: u16) -> Result<(), NvmeStatus> {
        let Some(cq) = self.completion_queue(cqid).filter(|_| cqid != 0) else {
            return Err(NvmeStatus::INVALID_CQID);
        };
        if !cq.sqs.is_empty() {
            tracing::debug!(cqid, bound = ?cq.sqs, "completion queue still in use");
            return Err(NvmeStatus::INVALID_QUEUE_DELETION);
        }
        let raised = (cq.irq_enabled && !cq.is_empty()).then_some(cq.vector);
        if let (Some(vector), true) = (raised, self.irq.msix()) {
            self.irq.deassert(vector);
        }
        self.cqs[cqid as usize] = None;
        self.refresh_intx_level();
        tracing::debug!(cqid, "completion queue deleted");
        Ok(())
    }

    /// Fetches and executes commands from one submission queue.
    pub fn poll_submission_queue(&mut self, sqid: u16, memory: &mut dyn MemoryBus) {
        self.process_sq(sqid, memory);
    }

    /// Updates a completion queue head, as a doorbell write would.
    pub fn notify_completion_queue_doorbell(
        &mut self,
        cqid: u16,
        head: u16,
        memory: &mut dyn MemoryBus,
    ) {
        self.on_doorbell_write(Doorbell::CqHead(cqid), head as u32, memory);
    }

    fn run(&mut self, memory: &mut dyn MemoryBus) {
        loop {
            if self.csts.contains(Csts::CFS) {
                return;
            }
            let mut progress = self.drain_backends(memory);
            for cqid in 0..self.cqs.len() as u16 {
                if self.completion_queue(cqid).is_some_and(|cq| cq.pending() != 0) {
                    progress |= self.post_cqes(cqid, memory);
                }
            }
            for sqid in 0..self.sqs.len() as u16 {
                progress |= self.process_sq(sqid, memory);
            }
            self.process_aers(memory);
            if !progress {
                return;
            }
        }
    }

    fn process_sq(&mut self, sqid: u16, memory: &mut dyn MemoryBus) -> bool {
        let mut fetched = false;
        while !self.csts.contains(Csts::CFS) {
            let Some(sq) = self.sqs.get_mut(sqid as usize).and_then(Option::as_mut) else {
                break;
            };
            if sq.is_empty() || !sq.has_free_slot() {
                break;
            }
            let addr = sq.entry_addr(sq.head);
            let mut bytes = [0u8; NVME_SQE_SIZE];
            if let Err(err) = Dma::new(memory, &mut self.local).read(addr, &mut bytes) {
                tracing::error!(sqid, addr, %err, "failed to fetch command; controller fatal");
                self.csts.insert(Csts::CFS);
                break;
            }
            let cmd = NvmeCommand::parse(bytes);
            // The entry stays in the ring until a request slot holds it.
            let Some(handle) = sq.alloc(cmd, self.next_tag) else {
                break;
            };
            sq.advance_head();
            self.next_tag += 1;
            fetched = true;
            tracing::debug!(sqid, cid = cmd.cid, opcode = cmd.opc, nsid = cmd.nsid, "command fetched");

            let outcome = if sqid == 0 {
                self.execute_admin(handle, &cmd, memory)
            } else {
                self.execute_io(&cmd, memory)
            };
            self.settle(handle, outcome, memory);
        }
        fetched
    }

    fn settle(&mut self, handle: RequestHandle, outcome: Outcome, memory: &mut dyn MemoryBus) {
        match outcome {
            Ok(Done::Complete(result)) => self.complete(handle, NvmeStatus::SUCCESS, result, memory),
            Ok(Done::Job(job)) => self.advance_job(handle, job, memory),
            Ok(Done::Deferred) => {
                if let Some(req) = self.request_mut(handle) {
                    req.state = RequestState::AwaitingEvent;
                }
            }
            Err(status) => {
                tracing::debug!(?handle, %status, "command failed");
                self.complete(handle, status, 0, memory);
            }
        }
    }

    pub(crate) fn request(&self, handle: RequestHandle) -> Option<&Request> {
        self.sqs.get(handle.sqid as usize)?.as_ref()?.get(handle)
    }

    pub(crate) fn request_mut(&mut self, handle: RequestHandle) -> Option<&mut Request> {
        self.sqs.get_mut(handle.sqid as usize)?.as_mut()?.get_mut(handle)
    }

    fn in_flight(&self) -> Vec<RequestHandle> {
        self.sqs
            .iter()
            .flatten()
            .flat_map(|sq| sq.handles_in(RequestState::InFlight))
            .collect()
    }

    /// Namespace whose backend currently holds an operation for `handle`.
    fn current_nsid(&self, handle: RequestHandle) -> Option<u32> {
        self.request(handle)?
            .job
            .as_ref()?
            .current
            .as_ref()
            .map(|p| p.nsid)
    }

    fn cancel_backend(&mut self, handle: RequestHandle) {
        if let Some(nsid) = self.current_nsid(handle) {
            if let Some(ns) = self.namespaces.get_mut(&nsid) {
                ns.backend_mut().cancel(handle);
            }
        }
    }

    /// Records the final status and queues the completion for posting. A request that is already
    /// completing is left alone. Returns the completion queue to post on.
    fn finalize(&mut self, handle: RequestHandle, status: NvmeStatus, result: u64) -> Option<u16> {
        let sq = self.sqs.get_mut(handle.sqid as usize)?.as_mut()?;
        let cqid = sq.cqid;
        let req = sq.get_mut(handle)?;
        if req.state == RequestState::Completing {
            return None;
        }
        if req.state == RequestState::AwaitingEvent {
            self.aeq.cancel(handle);
        }
        req.status = status;
        req.result = result;
        req.state = RequestState::Completing;
        let reservation = req.job.take().and_then(|job| job.zone_reservation());
        if let Some((nsid, idx, nlb)) = reservation {
            // An abandoned zoned write still consumes the blocks it reserved.
            if let Some(zones) = self.namespaces.get_mut(&nsid).and_then(|ns| ns.zones_mut()) {
                zones.finish_write(idx, nlb);
            }
        }
        self.cqs.get_mut(cqid as usize)?.as_mut()?.pending.push_back(handle);
        Some(cqid)
    }

    pub(crate) fn complete(
        &mut self,
        handle: RequestHandle,
        status: NvmeStatus,
        result: u64,
        memory: &mut dyn MemoryBus,
    ) {
        if let Some(cqid) = self.finalize(handle, status, result) {
            self.post_cqes(cqid, memory);
        }
    }

    /// Writes pending completion entries while the ring has room. Returns whether anything was
    /// posted.
    fn post_cqes(&mut self, cqid: u16, memory: &mut dyn MemoryBus) -> bool {
        let mut posted = false;
        loop {
            let Some(cq) = self.cqs.get_mut(cqid as usize).and_then(Option::as_mut) else {
                return posted;
            };
            if cq.is_full() {
                break;
            }
            let Some(handle) = cq.pending.pop_front() else {
                break;
            };
            let Some(sq) = self.sqs.get_mut(handle.sqid as usize).and_then(Option::as_mut) else {
                continue;
            };
            let sqhd = sq.head;
            let Some(req) = sq.release(handle) else {
                continue;
            };
            let entry = CqEntry {
                dw0: req.result as u32,
                dw1: (req.result >> 32) as u32,
                sqhd,
                sqid: handle.sqid,
                cid: req.cmd.cid,
                status: req.status.encode_without_phase() | cq.phase as u16,
            };
            let addr = cq.tail_addr();
            if let Err(err) = Dma::new(memory, &mut self.local).write(addr, &entry.to_bytes()) {
                tracing::error!(cqid, addr, %err, "failed to post completion; controller fatal");
                self.csts.insert(Csts::CFS);
                return posted;
            }
            cq.advance_tail();
            posted = true;
            tracing::trace!(cqid, sqid = handle.sqid, cid = entry.cid, status = %req.status, "completion posted");
        }

        let raise = self
            .completion_queue(cqid)
            .filter(|cq| posted && cq.irq_enabled)
            .map(|cq| cq.vector);
        if let (Some(vector), true) = (raise, self.irq.msix()) {
            self.irq.assert(vector);
        }
        self.refresh_intx_level();
        posted
    }

    fn refresh_intx_level(&mut self) {
        let pending = self
            .cqs
            .iter()
            .flatten()
            .filter(|cq| cq.irq_enabled && !cq.is_empty())
            .fold(0u32, |acc, cq| acc | 1 << (cq.vector & 31));
        self.irq.set_pending(pending);
    }

    fn drain_backends(&mut self, memory: &mut dyn MemoryBus) -> bool {
        let mut completions = Vec::new();
        for ns in self.namespaces.values_mut() {
            while let Some(completion) = ns.backend_mut().poll_completion() {
                completions.push(completion);
            }
        }
        let any = !completions.is_empty();
        for completion in completions {
            self.on_backend_completion(completion, memory);
        }
        any
    }

    fn process_aers(&mut self, memory: &mut dyn MemoryBus) {
        for (handle, event) in self.aeq.process() {
            tracing::debug!(?event, ?handle, "delivering async event");
            self.complete(handle, NvmeStatus::SUCCESS, event.result() as u64, memory);
        }
    }

    pub(crate) fn sg_options(&self, direction: Direction) -> SgOptions {
        SgOptions {
            page_size: self.page_size,
            excess_length: self.params.sgl_excess_length,
            direction,
        }
    }

    /// Rejects transfers larger than MDTS.
    pub(crate) fn check_mdts(&self, len: usize) -> Result<(), NvmeStatus> {
        if self.params.mdts != 0 && len > self.page_size << self.params.mdts {
            tracing::debug!(len, mdts = self.params.mdts, "transfer exceeds MDTS");
            return Err(NvmeStatus::INVALID_FIELD);
        }
        Ok(())
    }

    /// Copies controller-generated data to the command's data pointer.
    pub(crate) fn dma_to_host(
        &mut self,
        cmd: &NvmeCommand,
        data: &[u8],
        memory: &mut dyn MemoryBus,
    ) -> Result<(), NvmeStatus> {
        let opts = self.sg_options(Direction::FromDevice);
        let mut dma = Dma::new(memory, &mut self.local);
        let sg = map_dptr(&dma, cmd, data.len(), opts).map_err(|e| e.status())?;
        sg.scatter(&mut dma, data)
            .map_err(|_| NvmeStatus::DATA_TRANSFER_ERROR)
    }

    /// Reads `len` bytes of host data from the command's data pointer.
    pub(crate) fn dma_from_host(
        &mut self,
        cmd: &NvmeCommand,
        len: usize,
        memory: &mut dyn MemoryBus,
    ) -> Result<Vec<u8>, NvmeStatus> {
        let opts = self.sg_options(Direction::ToDevice);
        let dma = Dma::new(memory, &mut self.local);
        let sg = map_dptr(&dma, cmd, len, opts).map_err(|e| e.status())?;
        let mut buf = vec![0u8; len];
        sg.gather(&dma, &mut buf)
            .map_err(|_| NvmeStatus::DATA_TRANSFER_ERROR)?;
        Ok(buf)
    }
}

pub(crate) fn write_ascii_padded(dst: &mut [u8], s: &str) {
    dst.fill(b' ');
    let bytes = s.as_bytes();
    let len = bytes.len().min(dst.len());
    dst[..len].copy_from_slice(&bytes[..len]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{AdminOpcode, IoOpcode};

    struct TestMem {
        buf: Vec<u8>,
    }

    impl TestMem {
        fn new(size: usize) -> Self {
            Self { buf: vec![0u8; size] }
        }
    }

    impl MemoryBus for TestMem {
        fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
            let start = paddr as usize;
            let end = start.checked_add(buf.len()).ok_or(MemoryError::OutOfBounds {
                addr: paddr,
                len: buf.len(),
            })?;
            if end > self.buf.len() {
                return Err(MemoryError::OutOfBounds {
                    addr: paddr,
                    len: buf.len(),
                });
            }
            buf.copy_from_slice(&self.buf[start..end]);
            Ok(())
        }

        fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError> {
            let start = paddr as usize;
            let end = start.checked_add(buf.len()).ok_or(MemoryError::OutOfBounds {
                addr: paddr,
                len: buf.len(),
            })?;
            if end > self.buf.len() {
                return Err(MemoryError::OutOfBounds {
                    addr: paddr,
                    len: buf.len(),
                });
            }
            self.buf[start..end].copy_from_slice(buf);
            Ok(())
        }
    }

    const ASQ: u64 = 0x10000;
    const ACQ: u64 = 0x20000;
    const CC_ENABLE: u64 = 0x0046_0001;

    fn build_command(opc: u8) -> [u8; 64] {
        let mut cmd = [0u8; 64];
        cmd[0] = opc;
        cmd
    }

    fn set_cid(cmd: &mut [u8; 64], cid: u16) {
        cmd[2..4].copy_from_slice(&cid.to_le_bytes());
    }

    fn set_nsid(cmd: &mut [u8; 64], nsid: u32) {
        cmd[4..8].copy_from_slice(&nsid.to_le_bytes());
    }

    fn set_prp1(cmd: &mut [u8; 64], prp1: u64) {
        cmd[24..32].copy_from_slice(&prp1.to_le_bytes());
    }

    fn set_cdw10(cmd: &mut [u8; 64], val: u32) {
        cmd[40..44].copy_from_slice(&val.to_le_bytes());
    }

    fn set_cdw11(cmd: &mut [u8; 64], val: u32) {
        cmd[44..48].copy_from_slice(&val.to_le_bytes());
    }

    fn set_cdw12(cmd: &mut [u8; 64], val: u32) {
        cmd[48..52].copy_from_slice(&val.to_le_bytes());
    }

    fn read_cqe(mem: &TestMem, addr: u64) -> CqEntry {
        let mut bytes = [0u8; 16];
        mem.read_physical(addr, &mut bytes).unwrap();
        CqEntry::parse(&bytes)
    }

    fn controller(disk: MemBackend) -> NvmeController {
        let mut ctrl = NvmeController::new(NvmeParams::default()).unwrap();
        let ns = Namespace::new(NamespaceParams::default(), Box::new(disk)).unwrap();
        ctrl.attach_namespace(ns).unwrap();
        ctrl
    }

    fn enable(ctrl: &mut NvmeController, mem: &mut TestMem) {
        ctrl.mmio_write(NVME_REG_AQA, 4, 0x000f_000f, mem); // 16/16 entries
        ctrl.mmio_write(NVME_REG_ASQ, 8, ASQ, mem);
        ctrl.mmio_write(NVME_REG_ACQ, 8, ACQ, mem);
        ctrl.mmio_write(NVME_REG_CC, 4, CC_ENABLE, mem);
    }

    /// Submits `cmd` at admin slot `slot` and rings the doorbell.
    fn submit_admin(ctrl: &mut NvmeController, mem: &mut TestMem, slot: u16, cmd: &[u8; 64]) {
        mem.write_physical(ASQ + slot as u64 * 64, cmd).unwrap();
        ctrl.mmio_write(0x1000, 4, (slot as u64 + 1) % 16, mem);
    }

    fn create_io_queues(ctrl: &mut NvmeController, mem: &mut TestMem, io_cq: u64, io_sq: u64) {
        let mut cmd = build_command(AdminOpcode::CreateCq.raw());
        set_cid(&mut cmd, 1);
        set_prp1(&mut cmd, io_cq);
        set_cdw10(&mut cmd, (15 << 16) | 1); // qsize 16, qid 1
        set_cdw11(&mut cmd, 0x3); // PC + IEN
        submit_admin(ctrl, mem, 0, &cmd);

        let mut cmd = build_command(AdminOpcode::CreateSq.raw());
        set_cid(&mut cmd, 2);
        set_prp1(&mut cmd, io_sq);
        set_cdw10(&mut cmd, (15 << 16) | 1);
        set_cdw11(&mut cmd, (1 << 16) | 0x1); // cqid 1, PC
        submit_admin(ctrl, mem, 1, &cmd);

        assert_eq!(read_cqe(mem, ACQ).status & !0x1, 0);
        assert_eq!(read_cqe(mem, ACQ + 16).status & !0x1, 0);
    }

    #[test]
    fn registers_enable_sets_rdy() {
        let mut ctrl = controller(MemBackend::new(1024 * 512));
        let mut mem = TestMem::new(1024 * 1024);
        enable(&mut ctrl, &mut mem);

        assert_eq!(ctrl.mmio_read(NVME_REG_CSTS, 4) & 1, 1);
        assert_eq!(ctrl.mmio_read(NVME_REG_VS, 4), 0x0001_0400);
        assert_eq!(ctrl.mmio_read(NVME_REG_CAP, 8) & 0xffff, 0x7ff);
        // Dword halves agree with the 64-bit view.
        let cap = ctrl.mmio_read(NVME_REG_CAP, 4) | ctrl.mmio_read(NVME_REG_CAP_HI, 4) << 32;
        assert_eq!(cap, ctrl.mmio_read(NVME_REG_CAP, 8));

        // Admin queue registers are frozen while enabled.
        ctrl.mmio_write(NVME_REG_ASQ, 8, 0x50000, &mut mem);
        assert_eq!(ctrl.mmio_read(NVME_REG_ASQ, 8), ASQ);

        ctrl.mmio_write(NVME_REG_CC, 4, 0, &mut mem);
        assert_eq!(ctrl.mmio_read(NVME_REG_CSTS, 4), 0);
        assert!(ctrl.submission_queue(0).is_none());
    }

    #[test]
    fn enable_with_bad_config_sets_cfs() {
        let mut ctrl = controller(MemBackend::new(1024 * 512));
        let mut mem = TestMem::new(1024 * 1024);
        ctrl.mmio_write(NVME_REG_AQA, 4, 0x000f_000f, &mut mem);
        ctrl.mmio_write(NVME_REG_ASQ, 8, ASQ + 0x10, &mut mem);
        ctrl.mmio_write(NVME_REG_ACQ, 8, ACQ, &mut mem);
        ctrl.mmio_write(NVME_REG_CC, 4, CC_ENABLE, &mut mem);

        let csts = ctrl.mmio_read(NVME_REG_CSTS, 4) as u32;
        assert_eq!(csts & Csts::RDY.bits(), 0);
        assert_ne!(csts & Csts::CFS.bits(), 0);

        // Doorbells are ignored in the failed state.
        ctrl.mmio_write(0x1000, 4, 1, &mut mem);
        assert_eq!(read_cqe(&mem, ACQ).cid, 0);
    }

    #[test]
    fn admin_identify_controller_writes_data_and_completion() {
        let mut ctrl = controller(MemBackend::new(1024 * 512));
        let mut mem = TestMem::new(1024 * 1024);
        let id_buf = 0x30000;
        enable(&mut ctrl, &mut mem);

        let mut cmd = build_command(AdminOpcode::Identify.raw());
        set_cid(&mut cmd, 0x1234);
        set_prp1(&mut cmd, id_buf);
        set_cdw10(&mut cmd, 0x01); // CNS=1 (controller)
        submit_admin(&mut ctrl, &mut mem, 0, &cmd);

        let cqe = read_cqe(&mem, ACQ);
        assert_eq!(cqe.cid, 0x1234);
        assert_eq!(cqe.sqid, 0);
        assert_eq!(cqe.sqhd, 1);
        assert_eq!(cqe.status & 0x1, 1); // phase
        assert_eq!(cqe.status & !0x1, 0); // success

        assert_eq!(mem.read_u16(id_buf).unwrap(), 0x1d1d);
        assert_eq!(&mem.buf[id_buf as usize + 4..id_buf as usize + 24], b"AERO0000000000000001");
        assert_eq!(mem.read_u32(id_buf + 516).unwrap(), 256);
        assert_eq!(mem.buf[id_buf as usize + 512], 0x66);
        assert_eq!(mem.buf[id_buf as usize + 513], 0x44);
    }

    #[test]
    fn create_io_queues_and_rw_roundtrip() {
        let disk = MemBackend::new(1024 * 512);
        let mut ctrl = controller(disk.clone());
        let mut mem = TestMem::new(1024 * 1024);
        let io_cq = 0x40000;
        let io_sq = 0x50000;
        let write_buf = 0x60000;
        let read_buf = 0x61000;
        enable(&mut ctrl, &mut mem);
        create_io_queues(&mut ctrl, &mut mem, io_cq, io_sq);

        let payload: Vec<u8> = (0..1024u32).map(|i| (i * 7) as u8).collect();
        mem.write_physical(write_buf, &payload).unwrap();

        let mut cmd = build_command(IoOpcode::Write.raw());
        set_cid(&mut cmd, 0x10);
        set_nsid(&mut cmd, 1);
        set_prp1(&mut cmd, write_buf);
        set_cdw10(&mut cmd, 4); // slba
        set_cdw12(&mut cmd, 1); // 2 blocks
        mem.write_physical(io_sq, &cmd).unwrap();
        ctrl.mmio_write(0x1008, 4, 1, &mut mem);

        let cqe = read_cqe(&mem, io_cq);
        assert_eq!(cqe.cid, 0x10);
        assert_eq!(cqe.sqid, 1);
        assert_eq!(cqe.status, 1);
        assert_eq!(disk.read_at(4 * 512, 1024), payload);

        let mut cmd = build_command(IoOpcode::Read.raw());
        set_cid(&mut cmd, 0x11);
        set_nsid(&mut cmd, 1);
        set_prp1(&mut cmd, read_buf);
        set_cdw10(&mut cmd, 4);
        set_cdw12(&mut cmd, 1);
        mem.write_physical(io_sq + 64, &cmd).unwrap();
        ctrl.mmio_write(0x1008, 4, 2, &mut mem);

        let cqe = read_cqe(&mem, io_cq + 16);
        assert_eq!(cqe.cid, 0x11);
        assert_eq!(cqe.status, 1);
        assert_eq!(&mem.buf[read_buf as usize..read_buf as usize + 1024], &payload[..]);

        let stats = ctrl.namespace(1).unwrap().stats();
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.bytes_written, 1024);
    }

    #[test]
    fn cq_phase_toggles_on_wrap() {
        let mut ctrl = controller(MemBackend::new(1024 * 512));
        let mut mem = TestMem::new(1024 * 1024);
        // 4-entry admin queues.
        ctrl.mmio_write(NVME_REG_AQA, 4, 0x0003_0003, &mut mem);
        ctrl.mmio_write(NVME_REG_ASQ, 8, ASQ, &mut mem);
        ctrl.mmio_write(NVME_REG_ACQ, 8, ACQ, &mut mem);
        ctrl.mmio_write(NVME_REG_CC, 4, CC_ENABLE, &mut mem);

        let mut flush = build_command(AdminOpcode::GetFeatures.raw());
        set_cdw10(&mut flush, features::fid::VOLATILE_WRITE_CACHE as u32);
        for i in 0..3u16 {
            set_cid(&mut flush, i);
            mem.write_physical(ASQ + i as u64 * 64, &flush).unwrap();
        }
        ctrl.mmio_write(0x1000, 4, 3, &mut mem);
        for i in 0..3u64 {
            assert_eq!(read_cqe(&mem, ACQ + i * 16).status & 1, 1);
        }
        // The ring is full (3 of 4 slots); a fourth completion waits for the head to move.
        set_cid(&mut flush, 3);
        mem.write_physical(ASQ + 3 * 64, &flush).unwrap();
        ctrl.mmio_write(0x1000, 4, 0, &mut mem);
        assert_eq!(ctrl.completion_queue(0).unwrap().pending(), 1);

        ctrl.mmio_write(0x1004, 4, 3, &mut mem);
        let cqe = read_cqe(&mem, ACQ + 3 * 16);
        assert_eq!(cqe.cid, 3);
        assert_eq!(cqe.status & 1, 1);

        set_cid(&mut flush, 4);
        mem.write_physical(ASQ, &flush).unwrap();
        ctrl.mmio_write(0x1000, 4, 1, &mut mem);
        let cqe = read_cqe(&mem, ACQ);
        assert_eq!(cqe.cid, 4);
        assert_eq!(cqe.status & 1, 0); // phase flipped after wrap
    }

    #[test]
    fn intx_follows_unread_completions_and_mask() {
        let mut ctrl = controller(MemBackend::new(1024 * 512));
        let mut mem = TestMem::new(1024 * 1024);
        enable(&mut ctrl, &mut mem);

        let mut cmd = build_command(AdminOpcode::GetFeatures.raw());
        set_cdw10(&mut cmd, features::fid::ARBITRATION as u32);
        submit_admin(&mut ctrl, &mut mem, 0, &cmd);
        assert!(ctrl.intx_level());

        ctrl.mmio_write(NVME_REG_INTMS, 4, 1, &mut mem);
        assert!(!ctrl.intx_level());
        ctrl.mmio_write(NVME_REG_INTMC, 4, 1, &mut mem);
        assert!(ctrl.intx_level());

        ctrl.mmio_write(0x1004, 4, 1, &mut mem);
        assert!(!ctrl.intx_level());
    }

    #[test]
    fn invalid_doorbell_raises_error_event() {
        let mut ctrl = controller(MemBackend::new(1024 * 512));
        let mut mem = TestMem::new(1024 * 1024);
        enable(&mut ctrl, &mut mem);

        let mut aer = build_command(AdminOpcode::AsyncEventRequest.raw());
        set_cid(&mut aer, 0x77);
        submit_admin(&mut ctrl, &mut mem, 0, &aer);
        assert_eq!(ctrl.async_event_queue().outstanding(), 1);
        assert_eq!(read_cqe(&mem, ACQ).cid, 0);

        // SQ 5 does not exist.
        ctrl.mmio_write(0x1000 + 5 * 8, 4, 1, &mut mem);
        let cqe = read_cqe(&mem, ACQ);
        assert_eq!(cqe.cid, 0x77);
        assert_eq!(cqe.status & !1, 0);
        assert_eq!(
            cqe.dw0,
            AsyncEvent::new(event_type::ERROR, error_info::INVALID_DB_REGISTER, 0x1).result()
        );
    }

    #[test]
    fn shutdown_flushes_backends() {
        let disk = MemBackend::new(1024 * 512);
        let mut ctrl = controller(disk.clone());
        let mut mem = TestMem::new(1024 * 1024);
        enable(&mut ctrl, &mut mem);

        ctrl.mmio_write(NVME_REG_CC, 4, CC_ENABLE | 1 << 14, &mut mem); // SHN = normal
        let shst = ctrl.mmio_read(NVME_REG_CSTS, 4) as u32 & Csts::SHST_MASK.bits();
        assert_eq!(shst, Csts::SHST_COMPLETE.bits());
        assert_eq!(disk.flush_count(), 1);

        ctrl.mmio_write(NVME_REG_CC, 4, CC_ENABLE, &mut mem);
        assert_eq!(ctrl.mmio_read(NVME_REG_CSTS, 4) as u32 & Csts::SHST_MASK.bits(), 0);
    }

    #[test]
    fn function_reset_restores_registers() {
        let mut ctrl = controller(MemBackend::new(1024 * 512));
        let mut mem = TestMem::new(1024 * 1024);
        enable(&mut ctrl, &mut mem);
        ctrl.mmio_write(NVME_REG_INTMS, 4, 1, &mut mem);

        ctrl.reset(ResetKind::Function);
        assert_eq!(ctrl.mmio_read(NVME_REG_CC, 4), 0);
        assert_eq!(ctrl.mmio_read(NVME_REG_AQA, 4), 0);
        assert_eq!(ctrl.mmio_read(NVME_REG_INTMS, 4), 0);
        assert_eq!(ctrl.mmio_read(NVME_REG_CSTS, 4), 0);

        // The controller can be brought up again.
        enable(&mut ctrl, &mut mem);
        assert_eq!(ctrl.mmio_read(NVME_REG_CSTS, 4) & 1, 1);
    }

    #[test]
    fn namespace_table_management() {
        let mut ctrl = controller(MemBackend::new(1024 * 512));
        let dup = Namespace::new(NamespaceParams::default(), Box::new(MemBackend::new(4096))).unwrap();
        assert_eq!(ctrl.attach_namespace(dup), Err(NvmeError::NamespaceExists(1)));
        assert!(ctrl.detach_namespace(1).is_ok());
        assert_eq!(ctrl.detach_namespace(1).unwrap_err(), NvmeError::NamespaceNotFound(1));
    }

    #[test]
    fn bar0_covers_every_doorbell() {
        let ctrl = controller(MemBackend::new(1024 * 512));
        // 65 queue pairs * 8 bytes past 0x1000.
        assert_eq!(ctrl.bar0_len(), 0x2000);
    }
}
