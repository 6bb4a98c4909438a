//! Asynchronous event queue.
//!
//! Events are buffered in a bounded FIFO until the host leaves an Asynchronous Event Request
//! outstanding. Delivering an event masks its type until the host re-arms it by reading the
//! associated log page.

use std::collections::VecDeque;

use crate::queue::RequestHandle;
use crate::NvmeStatus;

pub mod event_type {
    pub const ERROR: u8 = 0x0;
    pub const SMART: u8 = 0x1;
    pub const NOTICE: u8 = 0x2;
}

/// Error status event information.
pub mod error_info {
    pub const INVALID_DB_REGISTER: u8 = 0x0;
    pub const INVALID_DB_VALUE: u8 = 0x1;
}

/// SMART / health status event information.
pub mod smart_info {
    pub const RELIABILITY: u8 = 0x0;
    pub const TEMP_THRESHOLD: u8 = 0x1;
    pub const SPARE_BELOW_THRESHOLD: u8 = 0x2;
}

/// Notice event information.
pub mod notice_info {
    pub const NS_ATTR_CHANGED: u8 = 0x0;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncEvent {
    pub event_type: u8,
    pub info: u8,
    pub log_page: u8,
}

impl AsyncEvent {
    pub fn new(event_type: u8, info: u8, log_page: u8) -> Self {
        AsyncEvent {
            event_type,
            info,
            log_page,
        }
    }

    /// Completion dword 0 for the delivering request.
    pub fn result(&self) -> u32 {
        self.event_type as u32 | (self.info as u32) << 8 | (self.log_page as u32) << 16
    }
}

#[derive(Debug)]
pub struct AsyncEventQueue {
    events: VecDeque<AsyncEvent>,
    max_queued: usize,
    /// Outstanding request limit, 0-based.
    aerl: u8,
    requests: Vec<RequestHandle>,
    /// Bit per event type.
    mask: u8,
}

impl AsyncEventQueue {
    pub fn new(max_queued: u32, aerl: u8) -> Self {
        AsyncEventQueue {
            events: VecDeque::new(),
            max_queued: max_queued as usize,
            aerl,
            requests: Vec::new(),
            mask: 0,
        }
    }

    /// Queues an event. Returns `false` when the queue is full and the event was dropped.
    pub fn enqueue(&mut self, event: AsyncEvent) -> bool {
        if self.events.len() >= self.max_queued {
            tracing::debug!(?event, "async event queue full; dropping event");
            return false;
        }
        tracing::debug!(?event, "async event queued");
        self.events.push_back(event);
        true
    }

    /// Parks an Asynchronous Event Request until an event is available.
    pub fn request(&mut self, handle: RequestHandle) -> Result<(), NvmeStatus> {
        if self.requests.len() > self.aerl as usize {
            tracing::debug!(outstanding = self.requests.len(), "AER limit exceeded");
            return Err(NvmeStatus::AER_LIMIT_EXCEEDED);
        }
        self.requests.push(handle);
        Ok(())
    }

    /// Unmasks an event type.
    pub fn clear(&mut self, event_type: u8) {
        self.mask &= !(1u8 << (event_type & 0x7));
    }

    pub fn is_masked(&self, event_type: u8) -> bool {
        self.mask & (1u8 << (event_type & 0x7)) != 0
    }

    /// Pairs queued events with outstanding requests, oldest event first. Events of a masked type
    /// stay queued.
    pub fn process(&mut self) -> Vec<(RequestHandle, AsyncEvent)> {
        let mut delivered = Vec::new();
        let mut kept = VecDeque::with_capacity(self.events.len());
        while let Some(event) = self.events.pop_front() {
            if self.is_masked(event.event_type) {
                kept.push_back(event);
                continue;
            }
            let Some(handle) = self.requests.pop() else {
                kept.push_back(event);
                kept.extend(self.events.drain(..));
                break;
            };
            self.mask |= 1u8 << (event.event_type & 0x7);
            delivered.push((handle, event));
        }
        self.events = kept;
        delivered
    }

    pub fn outstanding(&self) -> usize {
        self.requests.len()
    }

    pub fn queued(&self) -> usize {
        self.events.len()
    }

    pub fn events(&self) -> impl Iterator<Item = &AsyncEvent> {
        self.events.iter()
    }

    /// Forgets a request whose queue is going away.
    pub fn cancel(&mut self, handle: RequestHandle) -> bool {
        let before = self.requests.len();
        self.requests.retain(|h| *h != handle);
        self.requests.len() != before
    }

    /// Drops every event, request and mask bit. Returns the dropped requests.
    pub fn reset(&mut self) -> Vec<RequestHandle> {
        self.events.clear();
        self.mask = 0;
        std::mem::take(&mut self.requests)
    }
}
