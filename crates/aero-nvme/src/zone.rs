//! Zoned namespace state machine.
//!
//! Zones live in one flat vector. Each zone in a listed state (explicitly open, implicitly open,
//! closed, full) is also threaded onto an intrusive doubly-linked list for that state, in the
//! order it entered the state. The lists drive bulk "select all" operations and the eviction of
//! the oldest implicitly opened zone.

use bitflags::bitflags;
use thiserror::Error;

use crate::params::ZonedParams;
use crate::NvmeStatus;

pub const ZONE_DESCRIPTOR_SIZE: usize = 64;
pub const ZONE_REPORT_HEADER_SIZE: usize = 64;
/// Zone type: sequential write required.
pub const ZONE_TYPE_SEQ_WRITE: u8 = 0x2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZoneState {
    Empty,
    ImplicitlyOpen,
    ExplicitlyOpen,
    Closed,
    ReadOnly,
    Full,
    Offline,
}

impl ZoneState {
    pub fn raw(self) -> u8 {
        match self {
            ZoneState::Empty => 0x1,
            ZoneState::ImplicitlyOpen => 0x2,
            ZoneState::ExplicitlyOpen => 0x3,
            ZoneState::Closed => 0x4,
            ZoneState::ReadOnly => 0xd,
            ZoneState::Full => 0xe,
            ZoneState::Offline => 0xf,
        }
    }

    fn list(self) -> Option<usize> {
        match self {
            ZoneState::ExplicitlyOpen => Some(0),
            ZoneState::ImplicitlyOpen => Some(1),
            ZoneState::Closed => Some(2),
            ZoneState::Full => Some(3),
            _ => None,
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, ZoneState::ImplicitlyOpen | ZoneState::ExplicitlyOpen)
    }

    /// Zone write pointer is meaningful in this state.
    pub fn wp_valid(self) -> bool {
        !matches!(
            self,
            ZoneState::Full | ZoneState::ReadOnly | ZoneState::Offline
        )
    }
}

bitflags! {
    /// Zone attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ZoneAttrs: u8 {
        const FINISHED_BY_CONTROLLER = 1 << 0;
        const RESET_RECOMMENDED = 1 << 1;
        const ZRWA_VALID = 1 << 3;
        const ZD_EXT_VALID = 1 << 7;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ZoneError {
    #[error("invalid zone state transition")]
    InvalidTransition,
    #[error("too many active zones")]
    TooManyActive,
    #[error("too many open zones")]
    TooManyOpen,
    #[error("no zone random write area resources")]
    NoZrwaResources,
    #[error("write does not start at the write pointer")]
    InvalidWrite,
    #[error("write crosses the zone boundary")]
    Boundary,
    #[error("zone is full")]
    Full,
    #[error("zone is read only")]
    ReadOnly,
    #[error("zone is offline")]
    Offline,
    #[error("invalid field")]
    InvalidField,
}

impl ZoneError {
    pub fn status(self) -> NvmeStatus {
        match self {
            ZoneError::InvalidTransition => NvmeStatus::ZONE_INVALID_TRANSITION,
            ZoneError::TooManyActive => NvmeStatus::ZONE_TOO_MANY_ACTIVE,
            ZoneError::TooManyOpen => NvmeStatus::ZONE_TOO_MANY_OPEN,
            ZoneError::NoZrwaResources => NvmeStatus::NO_ZRWA_RESOURCES,
            ZoneError::InvalidWrite => NvmeStatus::ZONE_INVALID_WRITE,
            ZoneError::Boundary => NvmeStatus::ZONE_BOUNDARY_ERROR,
            ZoneError::Full => NvmeStatus::ZONE_FULL,
            ZoneError::ReadOnly => NvmeStatus::ZONE_READ_ONLY,
            ZoneError::Offline => NvmeStatus::ZONE_OFFLINE,
            ZoneError::InvalidField => NvmeStatus::INVALID_FIELD,
        }
    }
}

impl From<ZoneError> for NvmeStatus {
    fn from(err: ZoneError) -> Self {
        err.status()
    }
}

/// How a zone is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenKind {
    /// Implicit open by a write.
    Auto,
    Explicit,
    /// Explicit open that also allocates a zone random write area.
    ExplicitZrwa,
}

/// Zone management send actions.
pub mod action {
    pub const CLOSE: u8 = 0x01;
    pub const FINISH: u8 = 0x02;
    pub const OPEN: u8 = 0x03;
    pub const RESET: u8 = 0x04;
    pub const OFFLINE: u8 = 0x05;
    pub const SET_ZD_EXT: u8 = 0x10;
    pub const ZRWA_FLUSH: u8 = 0x11;
}

/// Zone receive report filter (cdw13 bits 15:8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFilter {
    All,
    State(ZoneState),
}

impl ReportFilter {
    pub fn from_raw(raw: u8) -> Option<ReportFilter> {
        Some(match raw {
            0 => ReportFilter::All,
            1 => ReportFilter::State(ZoneState::Empty),
            2 => ReportFilter::State(ZoneState::ImplicitlyOpen),
            3 => ReportFilter::State(ZoneState::ExplicitlyOpen),
            4 => ReportFilter::State(ZoneState::Closed),
            5 => ReportFilter::State(ZoneState::Full),
            6 => ReportFilter::State(ZoneState::ReadOnly),
            7 => ReportFilter::State(ZoneState::Offline),
            _ => return None,
        })
    }

    fn matches(self, state: ZoneState) -> bool {
        match self {
            ReportFilter::All => true,
            ReportFilter::State(s) => s == state,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Zone {
    pub zslba: u64,
    pub zcap: u64,
    /// Committed write pointer.
    pub wp: u64,
    /// Reservation pointer: where the next accepted write starts.
    w_ptr: u64,
    state: ZoneState,
    attrs: ZoneAttrs,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Zone {
    pub fn state(&self) -> ZoneState {
        self.state
    }

    pub fn attrs(&self) -> ZoneAttrs {
        self.attrs
    }

    pub fn write_ptr(&self) -> u64 {
        self.w_ptr
    }

    /// End of the writable range.
    pub fn write_boundary(&self) -> u64 {
        self.zslba + self.zcap
    }

    pub fn has_zrwa(&self) -> bool {
        self.attrs.contains(ZoneAttrs::ZRWA_VALID)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ZoneList {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZrwaConfig {
    pub size: u64,
    pub flush_granularity: u64,
}

#[derive(Debug, Clone)]
pub struct ZoneSet {
    zones: Vec<Zone>,
    zone_size: u64,
    lists: [ZoneList; 4],
    max_active: u32,
    max_open: u32,
    nr_active: u32,
    nr_open: u32,
    zrwa: Option<ZrwaConfig>,
    zrwa_total: u32,
    zrwa_free: u32,
    zd_ext_size: usize,
    zd_ext: Vec<u8>,
    cross_zone_read: bool,
    auto_transition: bool,
}

impl ZoneSet {
    /// Lays out `nlbas / zone_size` zones; trailing blocks that do not fill a zone are unused.
    pub fn new(nlbas: u64, params: &ZonedParams, auto_transition: bool) -> Self {
        let zone_size = params.zone_size.max(1);
        let nr_zones = (nlbas / zone_size) as usize;
        let zcap = params.capacity();
        let zones = (0..nr_zones)
            .map(|i| {
                let zslba = i as u64 * zone_size;
                Zone {
                    zslba,
                    zcap,
                    wp: zslba,
                    w_ptr: zslba,
                    state: ZoneState::Empty,
                    attrs: ZoneAttrs::empty(),
                    prev: None,
                    next: None,
                }
            })
            .collect();
        let zd_ext_size = params.zd_ext_size as usize;
        ZoneSet {
            zones,
            zone_size,
            lists: [ZoneList::default(); 4],
            max_active: params.max_active,
            max_open: params.max_open,
            nr_active: 0,
            nr_open: 0,
            zrwa: (params.numzrwa != 0).then_some(ZrwaConfig {
                size: params.zrwa_size,
                flush_granularity: params.zrwa_flush_granularity,
            }),
            zrwa_total: params.numzrwa,
            zrwa_free: params.numzrwa,
            zd_ext_size,
            zd_ext: vec![0u8; nr_zones * zd_ext_size],
            cross_zone_read: params.cross_zone_read,
            auto_transition,
        }
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn zone_size(&self) -> u64 {
        self.zone_size
    }

    /// Blocks covered by whole zones.
    pub fn nlbas(&self) -> u64 {
        self.zones.len() as u64 * self.zone_size
    }

    pub fn zone(&self, idx: usize) -> Option<&Zone> {
        self.zones.get(idx)
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn zone_index(&self, lba: u64) -> usize {
        (lba / self.zone_size) as usize
    }

    pub fn nr_open(&self) -> u32 {
        self.nr_open
    }

    pub fn nr_active(&self) -> u32 {
        self.nr_active
    }

    pub fn max_open(&self) -> u32 {
        self.max_open
    }

    pub fn max_active(&self) -> u32 {
        self.max_active
    }

    pub fn zrwa(&self) -> Option<ZrwaConfig> {
        self.zrwa
    }

    pub fn zrwa_available(&self) -> u32 {
        self.zrwa_free
    }

    pub fn zrwa_total(&self) -> u32 {
        self.zrwa_total
    }

    pub fn zd_ext_size(&self) -> usize {
        self.zd_ext_size
    }

    pub fn cross_zone_read(&self) -> bool {
        self.cross_zone_read
    }

    /// Zone indices in the list for `state`, oldest first.
    pub fn list(&self, state: ZoneState) -> Vec<usize> {
        let mut out = Vec::new();
        let Some(list) = state.list() else {
            return out;
        };
        let mut cur = self.lists[list].head;
        while let Some(idx) = cur {
            out.push(idx);
            cur = self.zones[idx].next;
            if out.len() > self.zones.len() {
                tracing::error!(?state, "zone list is corrupt");
                break;
            }
        }
        out
    }

    fn unlink(&mut self, idx: usize) {
        let Some(list) = self.zones[idx].state.list() else {
            return;
        };
        let (prev, next) = (self.zones[idx].prev, self.zones[idx].next);
        match prev {
            Some(p) => self.zones[p].next = next,
            None => self.lists[list].head = next,
        }
        match next {
            Some(n) => self.zones[n].prev = prev,
            None => self.lists[list].tail = prev,
        }
        self.lists[list].len -= 1;
        self.zones[idx].prev = None;
        self.zones[idx].next = None;
    }

    fn link_tail(&mut self, idx: usize) {
        let Some(list) = self.zones[idx].state.list() else {
            return;
        };
        let tail = self.lists[list].tail;
        self.zones[idx].prev = tail;
        self.zones[idx].next = None;
        match tail {
            Some(t) => self.zones[t].next = Some(idx),
            None => self.lists[list].head = Some(idx),
        }
        self.lists[list].tail = Some(idx);
        self.lists[list].len += 1;
    }

    fn assign(&mut self, idx: usize, state: ZoneState) {
        self.unlink(idx);
        self.zones[idx].state = state;
        self.link_tail(idx);
    }

    fn dec_open(&mut self) {
        match self.nr_open.checked_sub(1) {
            Some(n) => self.nr_open = n,
            None => tracing::error!("open zone count underflow"),
        }
    }

    fn dec_active(&mut self) {
        match self.nr_active.checked_sub(1) {
            Some(n) => self.nr_active = n,
            None => tracing::error!("active zone count underflow"),
        }
    }

    fn release_zrwa(&mut self, idx: usize) {
        if self.zones[idx].attrs.contains(ZoneAttrs::ZRWA_VALID) {
            self.zones[idx].attrs.remove(ZoneAttrs::ZRWA_VALID);
            self.zrwa_free += 1;
        }
    }

    pub fn check_resources(&self, act: u32, open: u32, zrwa: u32) -> Result<(), ZoneError> {
        if self.max_active != 0 && self.nr_active + act > self.max_active {
            return Err(ZoneError::TooManyActive);
        }
        if self.max_open != 0 && self.nr_open + open > self.max_open {
            return Err(ZoneError::TooManyOpen);
        }
        if zrwa > self.zrwa_free {
            return Err(ZoneError::NoZrwaResources);
        }
        Ok(())
    }

    /// Closes the oldest implicitly opened zone when the open limit is reached.
    fn auto_transition(&mut self) {
        if !self.auto_transition || self.max_open == 0 || self.nr_open < self.max_open {
            return;
        }
        if let Some(idx) = self.lists[1].head {
            tracing::debug!(zone = idx, "auto-closing implicitly open zone");
            let _ = self.close(idx);
        }
    }

    pub fn open(&mut self, idx: usize, kind: OpenKind) -> Result<(), ZoneError> {
        let zrwa = kind == OpenKind::ExplicitZrwa;
        if zrwa && self.zrwa.is_none() {
            return Err(ZoneError::InvalidField);
        }
        let state = self.zones.get(idx).ok_or(ZoneError::InvalidField)?.state;
        match state {
            ZoneState::Empty | ZoneState::Closed => {
                let act = u32::from(state == ZoneState::Empty);
                self.auto_transition();
                self.check_resources(act, 1, u32::from(zrwa))?;
                self.nr_active += act;
                self.nr_open += 1;
                if kind == OpenKind::Auto {
                    self.assign(idx, ZoneState::ImplicitlyOpen);
                    return Ok(());
                }
                self.assign(idx, ZoneState::ExplicitlyOpen);
            }
            ZoneState::ImplicitlyOpen => {
                if kind == OpenKind::Auto {
                    return Ok(());
                }
                if zrwa {
                    self.check_resources(0, 0, 1)?;
                }
                self.assign(idx, ZoneState::ExplicitlyOpen);
            }
            ZoneState::ExplicitlyOpen => {
                if zrwa && !self.zones[idx].has_zrwa() {
                    self.check_resources(0, 0, 1)?;
                }
            }
            _ => return Err(ZoneError::InvalidTransition),
        }
        if zrwa && !self.zones[idx].has_zrwa() {
            self.zrwa_free -= 1;
            self.zones[idx].attrs.insert(ZoneAttrs::ZRWA_VALID);
        }
        Ok(())
    }

    pub fn close(&mut self, idx: usize) -> Result<(), ZoneError> {
        match self.zones.get(idx).ok_or(ZoneError::InvalidField)?.state {
            ZoneState::ImplicitlyOpen | ZoneState::ExplicitlyOpen => {
                self.dec_open();
                self.assign(idx, ZoneState::Closed);
                Ok(())
            }
            ZoneState::Closed => Ok(()),
            _ => Err(ZoneError::InvalidTransition),
        }
    }

    pub fn finish(&mut self, idx: usize) -> Result<(), ZoneError> {
        let state = self.zones.get(idx).ok_or(ZoneError::InvalidField)?.state;
        match state {
            ZoneState::Full => return Ok(()),
            ZoneState::ImplicitlyOpen | ZoneState::ExplicitlyOpen => {
                self.dec_open();
                self.dec_active();
                self.release_zrwa(idx);
            }
            ZoneState::Closed => {
                self.dec_active();
                self.release_zrwa(idx);
            }
            ZoneState::Empty => {}
            _ => return Err(ZoneError::InvalidTransition),
        }
        self.assign(idx, ZoneState::Full);
        Ok(())
    }

    pub fn reset(&mut self, idx: usize) -> Result<(), ZoneError> {
        let state = self.zones.get(idx).ok_or(ZoneError::InvalidField)?.state;
        match state {
            ZoneState::Empty => return Ok(()),
            ZoneState::ImplicitlyOpen | ZoneState::ExplicitlyOpen => {
                self.dec_open();
                self.dec_active();
            }
            ZoneState::Closed => self.dec_active(),
            ZoneState::Full => {}
            _ => return Err(ZoneError::InvalidTransition),
        }
        self.release_zrwa(idx);
        let zone = &mut self.zones[idx];
        zone.w_ptr = zone.zslba;
        zone.wp = zone.zslba;
        zone.attrs = ZoneAttrs::empty();
        self.assign(idx, ZoneState::Empty);
        Ok(())
    }

    pub fn offline(&mut self, idx: usize) -> Result<(), ZoneError> {
        match self.zones.get(idx).ok_or(ZoneError::InvalidField)?.state {
            ZoneState::ReadOnly => {
                self.assign(idx, ZoneState::Offline);
                Ok(())
            }
            ZoneState::Offline => Ok(()),
            _ => Err(ZoneError::InvalidTransition),
        }
    }

    /// Media failure hook: the zone stops accepting writes.
    pub fn mark_read_only(&mut self, idx: usize) -> Result<(), ZoneError> {
        let state = self.zones.get(idx).ok_or(ZoneError::InvalidField)?.state;
        match state {
            ZoneState::ImplicitlyOpen | ZoneState::ExplicitlyOpen => {
                self.dec_open();
                self.dec_active();
            }
            ZoneState::Closed => self.dec_active(),
            ZoneState::Empty | ZoneState::Full => {}
            ZoneState::ReadOnly | ZoneState::Offline => return Err(ZoneError::InvalidTransition),
        }
        self.release_zrwa(idx);
        self.assign(idx, ZoneState::ReadOnly);
        Ok(())
    }

    /// Stores a zone descriptor extension; the zone becomes active and closed.
    pub fn set_zd_ext(&mut self, idx: usize, data: &[u8]) -> Result<(), ZoneError> {
        if self.zd_ext_size == 0 {
            return Err(ZoneError::InvalidField);
        }
        if self.zones.get(idx).ok_or(ZoneError::InvalidField)?.state != ZoneState::Empty {
            return Err(ZoneError::InvalidTransition);
        }
        self.check_resources(1, 0, 0)?;
        self.nr_active += 1;
        let off = idx * self.zd_ext_size;
        let n = data.len().min(self.zd_ext_size);
        self.zd_ext[off..off + n].copy_from_slice(&data[..n]);
        self.zones[idx].attrs.insert(ZoneAttrs::ZD_EXT_VALID);
        self.assign(idx, ZoneState::Closed);
        Ok(())
    }

    pub fn zd_ext(&self, idx: usize) -> &[u8] {
        let off = idx * self.zd_ext_size;
        &self.zd_ext[off..off + self.zd_ext_size]
    }

    /// Applies a bulk action to every zone in the action's eligible states, stopping at the first
    /// failure. Returns the zones acted upon.
    pub fn apply_all(&mut self, act: u8) -> Result<Vec<usize>, ZoneError> {
        let states: &[ZoneState] = match act {
            action::OPEN => &[ZoneState::Closed],
            action::CLOSE => &[ZoneState::ImplicitlyOpen, ZoneState::ExplicitlyOpen],
            action::FINISH => &[
                ZoneState::ImplicitlyOpen,
                ZoneState::ExplicitlyOpen,
                ZoneState::Closed,
            ],
            action::RESET => &[
                ZoneState::ImplicitlyOpen,
                ZoneState::ExplicitlyOpen,
                ZoneState::Closed,
                ZoneState::Full,
            ],
            action::OFFLINE => &[ZoneState::ReadOnly],
            _ => return Err(ZoneError::InvalidField),
        };
        let targets: Vec<usize> = if act == action::OFFLINE {
            (0..self.zones.len())
                .filter(|&i| self.zones[i].state == ZoneState::ReadOnly)
                .collect()
        } else {
            states.iter().flat_map(|&s| self.list(s)).collect()
        };
        for &idx in &targets {
            self.apply(idx, act)?;
        }
        Ok(targets)
    }

    pub fn apply(&mut self, idx: usize, act: u8) -> Result<(), ZoneError> {
        match act {
            action::OPEN => self.open(idx, OpenKind::Explicit),
            action::CLOSE => self.close(idx),
            action::FINISH => self.finish(idx),
            action::RESET => self.reset(idx),
            action::OFFLINE => self.offline(idx),
            _ => Err(ZoneError::InvalidField),
        }
    }

    fn check_state_for_write(zone: &Zone) -> Result<(), ZoneError> {
        match zone.state {
            ZoneState::Empty
            | ZoneState::ImplicitlyOpen
            | ZoneState::ExplicitlyOpen
            | ZoneState::Closed => Ok(()),
            ZoneState::Full => Err(ZoneError::Full),
            ZoneState::ReadOnly => Err(ZoneError::ReadOnly),
            ZoneState::Offline => Err(ZoneError::Offline),
        }
    }

    /// Validates a write of `nlb` blocks at `slba` without changing any state.
    pub fn check_write(&self, slba: u64, nlb: u64) -> Result<usize, ZoneError> {
        let idx = self.zone_index(slba);
        let zone = self.zones.get(idx).ok_or(ZoneError::Boundary)?;
        Self::check_state_for_write(zone)?;

        if zone.has_zrwa() {
            let window = self.zrwa.map_or(0, |z| z.size);
            if slba < zone.w_ptr || slba + nlb > zone.w_ptr + 2 * window {
                return Err(ZoneError::InvalidWrite);
            }
        } else if slba != zone.w_ptr {
            return Err(ZoneError::InvalidWrite);
        }

        if slba + nlb > zone.write_boundary() {
            return Err(ZoneError::Boundary);
        }
        Ok(idx)
    }

    /// Accepts a checked write: opens the zone implicitly and reserves the blocks. Writes that
    /// run past the random write area commit (flush) the excess first.
    pub fn begin_write(&mut self, idx: usize, slba: u64, nlb: u64) -> Result<(), ZoneError> {
        self.open(idx, OpenKind::Auto)?;
        if self.zones[idx].has_zrwa() {
            let cfg = self.zrwa.unwrap_or(ZrwaConfig {
                size: 0,
                flush_granularity: 1,
            });
            let end = slba + nlb;
            let window_end = self.zones[idx].w_ptr + cfg.size;
            if end > window_end {
                let fg = cfg.flush_granularity.max(1);
                let excess = (end - window_end).div_ceil(fg) * fg;
                tracing::debug!(zone = idx, excess, "implicit ZRWA flush");
                self.commit(idx, excess);
            }
            return Ok(());
        }
        self.zones[idx].w_ptr += nlb;
        Ok(())
    }

    /// Completes a write started with [`ZoneSet::begin_write`].
    pub fn finish_write(&mut self, idx: usize, nlb: u64) {
        let Some(zone) = self.zones.get(idx) else {
            return;
        };
        if zone.has_zrwa() {
            return;
        }
        let live = matches!(
            zone.state,
            ZoneState::ImplicitlyOpen | ZoneState::ExplicitlyOpen | ZoneState::Closed
        );
        if !live || zone.wp.saturating_add(nlb) > zone.w_ptr {
            // The zone was reset or finished while the write was in flight.
            tracing::debug!(zone = idx, nlb, state = ?zone.state, "dropping stale zone write");
            return;
        }
        self.advance_wp(idx, nlb);
    }

    fn advance_wp(&mut self, idx: usize, nlb: u64) {
        let zone = &mut self.zones[idx];
        zone.wp = (zone.wp + nlb).min(zone.write_boundary());
        if zone.wp == zone.write_boundary() {
            if let Err(err) = self.finish(idx) {
                tracing::warn!(zone = idx, %err, "zone could not be finished at its write boundary");
            }
        }
    }

    fn commit(&mut self, idx: usize, nlb: u64) {
        let zone = &mut self.zones[idx];
        let nlb = nlb.min(zone.write_boundary() - zone.w_ptr);
        zone.w_ptr += nlb;
        self.advance_wp(idx, nlb);
    }

    /// Explicit ZRWA flush: commits everything up to and including `elba`.
    pub fn flush_zrwa(&mut self, idx: usize, elba: u64) -> Result<(), ZoneError> {
        let cfg = self.zrwa.ok_or(ZoneError::InvalidField)?;
        let zone = self.zones.get(idx).ok_or(ZoneError::InvalidField)?;
        if !zone.has_zrwa() {
            return Err(ZoneError::InvalidField);
        }
        if elba < zone.wp || elba > zone.wp + cfg.size {
            return Err(ZoneError::Boundary);
        }
        let nlb = elba - zone.wp + 1;
        if nlb % cfg.flush_granularity.max(1) != 0 {
            return Err(ZoneError::InvalidField);
        }
        self.open(idx, OpenKind::Auto)?;
        self.commit(idx, nlb);
        Ok(())
    }

    /// Validates a read; zones other than offline are readable.
    pub fn check_read(&self, slba: u64, nlb: u64) -> Result<(), ZoneError> {
        let idx = self.zone_index(slba);
        let zone = self.zones.get(idx).ok_or(ZoneError::Boundary)?;
        if zone.state == ZoneState::Offline {
            return Err(ZoneError::Offline);
        }
        let end = slba + nlb;
        let boundary = zone.zslba + self.zone_size;
        if end <= boundary {
            return Ok(());
        }
        if !self.cross_zone_read {
            return Err(ZoneError::Boundary);
        }
        let last = self.zone_index(end - 1);
        for z in &self.zones[idx + 1..=last.min(self.zones.len() - 1)] {
            if z.state == ZoneState::Offline {
                return Err(ZoneError::Offline);
            }
        }
        Ok(())
    }

    pub fn descriptor(&self, idx: usize) -> [u8; ZONE_DESCRIPTOR_SIZE] {
        let mut out = [0u8; ZONE_DESCRIPTOR_SIZE];
        let zone = &self.zones[idx];
        out[0] = ZONE_TYPE_SEQ_WRITE;
        out[1] = zone.state.raw() << 4;
        out[2] = zone.attrs.bits();
        out[8..16].copy_from_slice(&zone.zcap.to_le_bytes());
        out[16..24].copy_from_slice(&zone.zslba.to_le_bytes());
        let wp = if zone.state.wp_valid() {
            zone.wp
        } else {
            u64::MAX
        };
        out[24..32].copy_from_slice(&wp.to_le_bytes());
        out
    }

    /// Builds a zone report of exactly `len` bytes starting at zone `start`.
    pub fn report(
        &self,
        start: usize,
        filter: ReportFilter,
        extended: bool,
        partial: bool,
        len: usize,
    ) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        let entry = ZONE_DESCRIPTOR_SIZE + if extended { self.zd_ext_size } else { 0 };
        let max_zones = len.saturating_sub(ZONE_REPORT_HEADER_SIZE) / entry;

        let matching = self.zones[start.min(self.zones.len())..]
            .iter()
            .enumerate()
            .filter(|(_, z)| filter.matches(z.state));

        let mut nr_zones = 0u64;
        let mut off = ZONE_REPORT_HEADER_SIZE;
        for (rel, _) in matching {
            if partial && nr_zones as usize >= max_zones {
                break;
            }
            if (nr_zones as usize) < max_zones {
                let idx = start + rel;
                buf[off..off + ZONE_DESCRIPTOR_SIZE].copy_from_slice(&self.descriptor(idx));
                if extended {
                    let ext_off = off + ZONE_DESCRIPTOR_SIZE;
                    if self.zones[idx].attrs.contains(ZoneAttrs::ZD_EXT_VALID) {
                        buf[ext_off..ext_off + self.zd_ext_size].copy_from_slice(self.zd_ext(idx));
                    }
                }
                off += entry;
            }
            nr_zones += 1;
        }
        if buf.len() >= 8 {
            buf[0..8].copy_from_slice(&nr_zones.to_le_bytes());
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zones(max_open: u32, max_active: u32) -> ZoneSet {
        let params = ZonedParams {
            zone_size: 64,
            zone_capacity: 48,
            max_open,
            max_active,
            ..Default::default()
        };
        ZoneSet::new(64 * 8, &params, true)
    }

    #[test]
    fn write_opens_implicitly_and_fills() {
        let mut z = zones(0, 0);
        let idx = z.check_write(0, 16).unwrap();
        z.begin_write(idx, 0, 16).unwrap();
        assert_eq!(z.zone(0).unwrap().state(), ZoneState::ImplicitlyOpen);
        assert_eq!(z.zone(0).unwrap().write_ptr(), 16);
        assert_eq!(z.zone(0).unwrap().wp, 0);
        z.finish_write(idx, 16);
        assert_eq!(z.zone(0).unwrap().wp, 16);

        assert_eq!(z.check_write(8, 8), Err(ZoneError::InvalidWrite));
        assert_eq!(z.check_write(16, 40), Err(ZoneError::Boundary));

        z.begin_write(0, 16, 32).unwrap();
        z.finish_write(0, 32);
        assert_eq!(z.zone(0).unwrap().state(), ZoneState::Full);
        assert_eq!(z.nr_open(), 0);
        assert_eq!(z.nr_active(), 0);
        assert_eq!(z.check_write(48, 1), Err(ZoneError::Full));
    }

    #[test]
    fn write_completing_after_reset_leaves_zone_empty() {
        let mut z = zones(0, 0);
        z.begin_write(0, 0, 16).unwrap();
        z.reset(0).unwrap();
        z.finish_write(0, 16);
        let zone = z.zone(0).unwrap();
        assert_eq!(zone.state(), ZoneState::Empty);
        assert_eq!(zone.wp, 0);
        assert_eq!(zone.write_ptr(), 0);
        assert_eq!(z.nr_active(), 0);

        // Same for a zone finished by the host while the write was in flight.
        z.begin_write(1, 64, 8).unwrap();
        z.finish(1).unwrap();
        z.finish_write(1, 8);
        assert_eq!(z.zone(1).unwrap().state(), ZoneState::Full);
        assert_eq!(z.zone(1).unwrap().wp, 64);
    }

    #[test]
    fn oldest_implicit_zone_is_closed_at_open_limit() {
        let mut z = zones(1, 0);
        z.begin_write(0, 0, 1).unwrap();
        z.begin_write(1, 64, 1).unwrap();
        assert_eq!(z.zone(0).unwrap().state(), ZoneState::Closed);
        assert_eq!(z.zone(1).unwrap().state(), ZoneState::ImplicitlyOpen);
        assert_eq!(z.nr_open(), 1);
        assert_eq!(z.nr_active(), 2);
        assert_eq!(z.list(ZoneState::Closed), vec![0]);
    }

    #[test]
    fn explicit_open_is_not_evicted() {
        let mut z = zones(1, 0);
        z.open(0, OpenKind::Explicit).unwrap();
        assert_eq!(z.open(1, OpenKind::Auto), Err(ZoneError::TooManyOpen));
        assert_eq!(z.zone(1).unwrap().state(), ZoneState::Empty);
    }

    #[test]
    fn active_limit_and_release() {
        let mut z = zones(0, 2);
        z.open(0, OpenKind::Explicit).unwrap();
        z.open(1, OpenKind::Explicit).unwrap();
        z.close(1).unwrap();
        assert_eq!(z.open(2, OpenKind::Explicit), Err(ZoneError::TooManyActive));
        z.finish(1).unwrap();
        z.open(2, OpenKind::Explicit).unwrap();
        z.reset(0).unwrap();
        assert_eq!(z.nr_active(), 1);
        assert_eq!(z.nr_open(), 1);
        assert_eq!(z.zone(0).unwrap().state(), ZoneState::Empty);
    }

    #[test]
    fn invalid_transitions() {
        let mut z = zones(0, 0);
        assert_eq!(z.close(0), Err(ZoneError::InvalidTransition));
        assert_eq!(z.offline(0), Err(ZoneError::InvalidTransition));
        z.mark_read_only(0).unwrap();
        assert_eq!(z.open(0, OpenKind::Explicit), Err(ZoneError::InvalidTransition));
        assert_eq!(z.check_write(0, 1), Err(ZoneError::ReadOnly));
        z.offline(0).unwrap();
        assert_eq!(z.check_read(0, 1), Err(ZoneError::Offline));
    }

    #[test]
    fn select_all_reset() {
        let mut z = zones(0, 0);
        z.open(0, OpenKind::Explicit).unwrap();
        z.begin_write(1, 64, 4).unwrap();
        z.finish(2).unwrap();
        let reset = z.apply_all(action::RESET).unwrap();
        assert_eq!(reset, vec![0, 1, 2]);
        assert!(z.zones().iter().all(|zone| zone.state() == ZoneState::Empty));
        assert_eq!(z.nr_open(), 0);
        assert_eq!(z.nr_active(), 0);
    }

    #[test]
    fn zrwa_window_and_implicit_flush() {
        let params = ZonedParams {
            zone_size: 64,
            numzrwa: 1,
            zrwa_size: 8,
            zrwa_flush_granularity: 4,
            ..Default::default()
        };
        let mut z = ZoneSet::new(128, &params, true);
        z.open(0, OpenKind::ExplicitZrwa).unwrap();
        assert_eq!(z.zrwa_available(), 0);
        assert_eq!(
            z.open(1, OpenKind::ExplicitZrwa),
            Err(ZoneError::NoZrwaResources)
        );

        // Random writes inside the window do not move the write pointer.
        z.check_write(4, 4).unwrap();
        z.begin_write(0, 4, 4).unwrap();
        z.finish_write(0, 4);
        assert_eq!(z.zone(0).unwrap().wp, 0);

        // Writing up to block 10 overruns the 8-block window by 2, flushed as 4.
        z.check_write(8, 2).unwrap();
        z.begin_write(0, 8, 2).unwrap();
        assert_eq!(z.zone(0).unwrap().wp, 4);
        assert_eq!(z.check_write(2, 1), Err(ZoneError::InvalidWrite));

        z.flush_zrwa(0, 7).unwrap();
        assert_eq!(z.zone(0).unwrap().wp, 8);
        assert_eq!(z.flush_zrwa(0, 9), Err(ZoneError::InvalidField));

        z.finish(0).unwrap();
        assert_eq!(z.zrwa_available(), 1);
    }

    #[test]
    fn cross_zone_read() {
        let mut z = zones(0, 0);
        assert_eq!(z.check_read(60, 8), Err(ZoneError::Boundary));
        z.cross_zone_read = true;
        z.check_read(60, 8).unwrap();
    }

    #[test]
    fn report_counts_and_filters() {
        let mut z = zones(0, 0);
        z.open(1, OpenKind::Explicit).unwrap();
        z.begin_write(3, 192, 8).unwrap();
        z.finish_write(3, 8);

        let full = z.report(0, ReportFilter::All, false, false, 64 + 2 * 64);
        assert_eq!(u64::from_le_bytes(full[0..8].try_into().unwrap()), 8);
        // First descriptor: zone 0, empty.
        assert_eq!(full[64 + 1] >> 4, ZoneState::Empty.raw());
        assert_eq!(&full[64 + 16..64 + 24], &0u64.to_le_bytes());

        let partial = z.report(0, ReportFilter::All, false, true, 64 + 2 * 64);
        assert_eq!(u64::from_le_bytes(partial[0..8].try_into().unwrap()), 2);

        let open = z.report(
            0,
            ReportFilter::State(ZoneState::ImplicitlyOpen),
            false,
            false,
            128,
        );
        assert_eq!(u64::from_le_bytes(open[0..8].try_into().unwrap()), 1);
        assert_eq!(
            u64::from_le_bytes(open[64 + 24..64 + 32].try_into().unwrap()),
            200
        );
    }
}
