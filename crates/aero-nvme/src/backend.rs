//! Block storage collaborator.
//!
//! The controller never blocks on storage: it submits a [`BlockOp`] tagged with the issuing
//! request's [`RequestHandle`] and later collects [`BlockCompletion`]s by polling. A completion
//! whose handle no longer names a live request (its queue was deleted meanwhile) is dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::queue::RequestHandle;
use crate::BackendError;

/// Allocation tracking granularity of [`MemBackend`].
pub const MEM_BACKEND_GRANULE: u64 = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOp {
    Read { offset: u64, len: u64 },
    Write { offset: u64, data: Vec<u8> },
    /// Zero the range; the backend may deallocate it.
    WriteZeroes { offset: u64, len: u64 },
    Discard { offset: u64, len: u64 },
    Flush,
}

impl BlockOp {
    pub fn is_read(&self) -> bool {
        matches!(self, BlockOp::Read { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCompletion {
    pub handle: RequestHandle,
    /// Read data for [`BlockOp::Read`]; empty otherwise.
    pub result: Result<Vec<u8>, BackendError>,
}

/// Allocation state of a byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Every block holds written data.
    Allocated,
    /// Every block is deallocated and reads back as zeroes.
    Deallocated,
    Mixed,
}

pub trait BlockBackend: Send {
    /// Size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn submit(&mut self, handle: RequestHandle, op: BlockOp);

    fn poll_completion(&mut self) -> Option<BlockCompletion>;

    fn block_status(&self, offset: u64, len: u64) -> BlockStatus;

    /// Best-effort cancellation of an operation that has not completed yet.
    fn cancel(&mut self, _handle: RequestHandle) {}
}

#[derive(Debug, Default)]
struct MemState {
    data: Vec<u8>,
    allocated: Vec<bool>,
    completions: VecDeque<BlockCompletion>,
    hold: bool,
    fail_reads: bool,
    fail_writes: bool,
    fail_flush: bool,
    flushes: u64,
    submitted: u64,
}

/// RAM-backed [`BlockBackend`] that completes every operation at submission time.
///
/// Clones share the same storage so a test can keep a handle after moving the backend into a
/// namespace.
#[derive(Debug, Clone)]
pub struct MemBackend {
    state: Arc<Mutex<MemState>>,
}

impl MemBackend {
    pub fn new(len: u64) -> Self {
        let granules = len.div_ceil(MEM_BACKEND_GRANULE) as usize;
        MemBackend {
            state: Arc::new(Mutex::new(MemState {
                data: vec![0u8; len as usize],
                allocated: vec![false; granules],
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the stored bytes.
    pub fn read_at(&self, offset: u64, len: usize) -> Vec<u8> {
        let state = self.state();
        let start = (offset as usize).min(state.data.len());
        let end = start.saturating_add(len).min(state.data.len());
        state.data[start..end].to_vec()
    }

    /// Writes directly into the store, marking the range allocated.
    pub fn write_at(&self, offset: u64, data: &[u8]) {
        let mut state = self.state();
        let _ = state.write(offset, data);
    }

    /// Keep completions queued (not returned by `poll_completion`) while set.
    pub fn set_hold_completions(&self, hold: bool) {
        self.state().hold = hold;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state().fail_reads = fail;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    pub fn set_fail_flush(&self, fail: bool) {
        self.state().fail_flush = fail;
    }

    pub fn flush_count(&self) -> u64 {
        self.state().flushes
    }

    pub fn submitted(&self) -> u64 {
        self.state().submitted
    }

    pub fn queued_completions(&self) -> usize {
        self.state().completions.len()
    }
}

impl MemState {
    fn range(&self, offset: u64, len: u64) -> Result<std::ops::Range<usize>, BackendError> {
        let oob = BackendError::OutOfRange { offset, len };
        let end = offset.checked_add(len).ok_or(oob.clone())?;
        if end > self.data.len() as u64 {
            return Err(oob);
        }
        Ok(offset as usize..end as usize)
    }

    fn granules(offset: u64, len: u64) -> std::ops::Range<usize> {
        let first = (offset / MEM_BACKEND_GRANULE) as usize;
        let last = (offset + len).div_ceil(MEM_BACKEND_GRANULE) as usize;
        first..last
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), BackendError> {
        let range = self.range(offset, data.len() as u64)?;
        self.data[range].copy_from_slice(data);
        for g in Self::granules(offset, data.len() as u64) {
            self.allocated[g] = true;
        }
        Ok(())
    }

    fn deallocate(&mut self, offset: u64, len: u64) -> Result<(), BackendError> {
        let range = self.range(offset, len)?;
        self.data[range].fill(0);
        // Only whole granules inside the range lose their allocation.
        let first = offset.div_ceil(MEM_BACKEND_GRANULE) as usize;
        let last = ((offset + len) / MEM_BACKEND_GRANULE) as usize;
        for g in first..last.max(first) {
            self.allocated[g] = false;
        }
        Ok(())
    }

    fn execute(&mut self, op: BlockOp) -> Result<Vec<u8>, BackendError> {
        match op {
            BlockOp::Read { offset, len } => {
                if self.fail_reads {
                    return Err(BackendError::Io);
                }
                let range = self.range(offset, len)?;
                Ok(self.data[range].to_vec())
            }
            BlockOp::Write { offset, data } => {
                if self.fail_writes {
                    return Err(BackendError::Io);
                }
                self.write(offset, &data)?;
                Ok(Vec::new())
            }
            BlockOp::WriteZeroes { offset, len } => {
                if self.fail_writes {
                    return Err(BackendError::Io);
                }
                self.deallocate(offset, len)?;
                Ok(Vec::new())
            }
            BlockOp::Discard { offset, len } => {
                self.deallocate(offset, len)?;
                Ok(Vec::new())
            }
            BlockOp::Flush => {
                if self.fail_flush {
                    return Err(BackendError::Io);
                }
                self.flushes += 1;
                Ok(Vec::new())
            }
        }
    }
}

impl BlockBackend for MemBackend {
    fn len(&self) -> u64 {
        self.state().data.len() as u64
    }

    fn submit(&mut self, handle: RequestHandle, op: BlockOp) {
        let mut state = self.state();
        state.submitted += 1;
        let result = state.execute(op);
        state.completions.push_back(BlockCompletion { handle, result });
    }

    fn poll_completion(&mut self) -> Option<BlockCompletion> {
        let mut state = self.state();
        if state.hold {
            return None;
        }
        state.completions.pop_front()
    }

    fn block_status(&self, offset: u64, len: u64) -> BlockStatus {
        let state = self.state();
        let granules = MemState::granules(offset, len);
        let mut any_allocated = false;
        let mut any_free = false;
        for g in granules {
            match state.allocated.get(g) {
                Some(true) => any_allocated = true,
                _ => any_free = true,
            }
        }
        match (any_allocated, any_free) {
            (true, false) => BlockStatus::Allocated,
            (false, _) => BlockStatus::Deallocated,
            (true, true) => BlockStatus::Mixed,
        }
    }

    fn cancel(&mut self, handle: RequestHandle) {
        self.state().completions.retain(|c| c.handle != handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(tag: u64) -> RequestHandle {
        RequestHandle {
            sqid: 1,
            slot: 0,
            tag,
        }
    }

    #[test]
    fn write_then_read_back() {
        let mut be = MemBackend::new(4096);
        be.submit(
            handle(1),
            BlockOp::Write {
                offset: 512,
                data: vec![0xaa; 512],
            },
        );
        be.submit(
            handle(2),
            BlockOp::Read {
                offset: 512,
                len: 512,
            },
        );
        assert_eq!(be.poll_completion().unwrap().result, Ok(Vec::new()));
        let read = be.poll_completion().unwrap();
        assert_eq!(read.handle, handle(2));
        assert_eq!(read.result.unwrap(), vec![0xaa; 512]);
        assert!(be.poll_completion().is_none());
    }

    #[test]
    fn block_status_tracks_allocation() {
        let mut be = MemBackend::new(4096);
        assert_eq!(be.block_status(0, 4096), BlockStatus::Deallocated);

        be.write_at(0, &[1u8; 1024]);
        assert_eq!(be.block_status(0, 1024), BlockStatus::Allocated);
        assert_eq!(be.block_status(0, 2048), BlockStatus::Mixed);

        be.submit(
            handle(1),
            BlockOp::Discard {
                offset: 0,
                len: 512,
            },
        );
        assert_eq!(be.block_status(0, 512), BlockStatus::Deallocated);
        assert_eq!(be.read_at(0, 4), vec![0u8; 4]);
    }

    #[test]
    fn out_of_range_and_injected_failures() {
        let mut be = MemBackend::new(1024);
        be.submit(
            handle(1),
            BlockOp::Read {
                offset: 1000,
                len: 100,
            },
        );
        assert!(matches!(
            be.poll_completion().unwrap().result,
            Err(BackendError::OutOfRange { .. })
        ));

        be.set_fail_flush(true);
        be.submit(handle(2), BlockOp::Flush);
        assert_eq!(be.poll_completion().unwrap().result, Err(BackendError::Io));
        assert_eq!(be.flush_count(), 0);
    }

    #[test]
    fn held_completions_can_be_cancelled() {
        let mut be = MemBackend::new(1024);
        be.set_hold_completions(true);
        be.submit(handle(7), BlockOp::Flush);
        assert!(be.poll_completion().is_none());
        be.cancel(handle(7));
        be.set_hold_completions(false);
        assert!(be.poll_completion().is_none());
    }
}
