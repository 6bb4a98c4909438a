//! Submission/completion ring state and the per-queue request pool.

use std::collections::VecDeque;

use crate::command::{NvmeCommand, NVME_CQE_SIZE, NVME_SQE_SIZE};
use crate::job::Job;
use crate::NvmeStatus;

/// Names one in-flight request.
///
/// `tag` is unique for the controller's lifetime, so a handle held by the backend cannot alias a
/// request that later reuses the same queue slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    pub sqid: u16,
    pub slot: u16,
    pub tag: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqEntry {
    pub dw0: u32,
    pub dw1: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    pub status: u16,
}

impl CqEntry {
    pub fn to_bytes(self) -> [u8; NVME_CQE_SIZE] {
        let mut out = [0u8; NVME_CQE_SIZE];
        out[0..4].copy_from_slice(&self.dw0.to_le_bytes());
        out[4..8].copy_from_slice(&self.dw1.to_le_bytes());
        let dw2 = (self.sqid as u32) << 16 | self.sqhd as u32;
        out[8..12].copy_from_slice(&dw2.to_le_bytes());
        let dw3 = (self.status as u32) << 16 | self.cid as u32;
        out[12..16].copy_from_slice(&dw3.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8; NVME_CQE_SIZE]) -> Self {
        let dw = |i: usize| {
            u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]])
        };
        let dw2 = dw(8);
        let dw3 = dw(12);
        CqEntry {
            dw0: dw(0),
            dw1: dw(4),
            sqhd: dw2 as u16,
            sqid: (dw2 >> 16) as u16,
            cid: dw3 as u16,
            status: (dw3 >> 16) as u16,
        }
    }

    pub fn phase(&self) -> bool {
        self.status & 1 != 0
    }

    pub fn nvme_status(&self) -> NvmeStatus {
        NvmeStatus::decode(self.status)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestState {
    /// Executing, possibly waiting on the backend.
    InFlight,
    /// Parked until an async event is available.
    AwaitingEvent,
    /// Status final; queued for posting on the completion queue.
    Completing,
}

#[derive(Debug)]
pub(crate) struct Request {
    pub handle: RequestHandle,
    pub cmd: NvmeCommand,
    pub status: NvmeStatus,
    pub result: u64,
    pub state: RequestState,
    pub job: Option<Job>,
}

#[derive(Debug)]
pub struct SubmissionQueue {
    pub sqid: u16,
    pub cqid: u16,
    pub base: u64,
    pub size: u16,
    pub head: u16,
    pub tail: u16,
    slots: Vec<Option<Request>>,
    free: VecDeque<u16>,
}

impl SubmissionQueue {
    pub fn new(sqid: u16, cqid: u16, base: u64, size: u16) -> Self {
        SubmissionQueue {
            sqid,
            cqid,
            base,
            size,
            head: 0,
            tail: 0,
            slots: (0..size).map(|_| None).collect(),
            free: (0..size).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    pub fn has_free_slot(&self) -> bool {
        !self.free.is_empty()
    }

    pub fn entry_addr(&self, index: u16) -> u64 {
        self.base + index as u64 * NVME_SQE_SIZE as u64
    }

    pub fn advance_head(&mut self) {
        self.head = (self.head + 1) % self.size;
    }

    /// Number of requests currently borrowed from the pool.
    pub fn outstanding(&self) -> usize {
        self.size as usize - self.free.len()
    }

    pub(crate) fn alloc(&mut self, cmd: NvmeCommand, tag: u64) -> Option<RequestHandle> {
        let slot = self.free.pop_front()?;
        let handle = RequestHandle {
            sqid: self.sqid,
            slot,
            tag,
        };
        self.slots[slot as usize] = Some(Request {
            handle,
            cmd,
            status: NvmeStatus::SUCCESS,
            result: 0,
            state: RequestState::InFlight,
            job: None,
        });
        Some(handle)
    }

    pub(crate) fn get_mut(&mut self, handle: RequestHandle) -> Option<&mut Request> {
        self.slots
            .get_mut(handle.slot as usize)?
            .as_mut()
            .filter(|req| req.handle == handle)
    }

    pub(crate) fn get(&self, handle: RequestHandle) -> Option<&Request> {
        self.slots
            .get(handle.slot as usize)?
            .as_ref()
            .filter(|req| req.handle == handle)
    }

    /// Returns the request's slot to the pool.
    pub(crate) fn release(&mut self, handle: RequestHandle) -> Option<Request> {
        let slot = self.slots.get_mut(handle.slot as usize)?;
        if slot.as_ref().map(|r| r.handle) != Some(handle) {
            return None;
        }
        self.free.push_back(handle.slot);
        slot.take()
    }

    pub(crate) fn handles_in(&self, state: RequestState) -> Vec<RequestHandle> {
        self.slots
            .iter()
            .flatten()
            .filter(|req| req.state == state)
            .map(|req| req.handle)
            .collect()
    }
}

#[derive(Debug)]
pub struct CompletionQueue {
    pub cqid: u16,
    pub base: u64,
    pub size: u16,
    pub head: u16,
    pub tail: u16,
    pub phase: bool,
    pub vector: u16,
    pub irq_enabled: bool,
    /// Submission queues completing into this queue.
    pub(crate) sqs: Vec<u16>,
    /// Requests whose completion entries are waiting for ring space, in posting order.
    pub(crate) pending: VecDeque<RequestHandle>,
}

impl CompletionQueue {
    pub fn new(cqid: u16, base: u64, size: u16, vector: u16, irq_enabled: bool) -> Self {
        CompletionQueue {
            cqid,
            base,
            size,
            head: 0,
            tail: 0,
            phase: true,
            vector,
            irq_enabled,
            sqs: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Advancing the tail would collide with the head.
    pub fn is_full(&self) -> bool {
        (self.tail + 1) % self.size == self.head
    }

    pub fn tail_addr(&self) -> u64 {
        self.base + self.tail as u64 * NVME_CQE_SIZE as u64
    }

    /// Moves the tail past a freshly written entry; the phase flips when the tail wraps.
    pub fn advance_tail(&mut self) {
        self.tail = (self.tail + 1) % self.size;
        if self.tail == 0 {
            self.phase = !self.phase;
        }
    }

    pub fn bound_sqs(&self) -> &[u16] {
        &self.sqs
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
