//! Get Features / Set Features.

use std::time::Instant;

use bitflags::bitflags;

use crate::aer::{event_type, smart_info};
use crate::command::{NvmeCommand, NSID_BROADCAST};
use crate::log_page::lid;
use crate::{AsyncEvent, Done, MemoryBus, NvmeController, NvmeStatus, Outcome};

/// Feature identifiers.
pub mod fid {
    pub const ARBITRATION: u8 = 0x01;
    pub const POWER_MANAGEMENT: u8 = 0x02;
    pub const TEMPERATURE_THRESHOLD: u8 = 0x04;
    pub const ERROR_RECOVERY: u8 = 0x05;
    pub const VOLATILE_WRITE_CACHE: u8 = 0x06;
    pub const NUMBER_OF_QUEUES: u8 = 0x07;
    pub const INTERRUPT_COALESCING: u8 = 0x08;
    pub const INTERRUPT_VECTOR_CONF: u8 = 0x09;
    pub const WRITE_ATOMICITY: u8 = 0x0a;
    pub const ASYNC_EVENT_CONF: u8 = 0x0b;
    pub const TIMESTAMP: u8 = 0x0e;
    pub const COMMAND_SET_PROFILE: u8 = 0x19;
}

/// Get Features SEL values.
mod select {
    pub const CURRENT: u8 = 0;
    pub const DEFAULT: u8 = 1;
    pub const SAVED: u8 = 2;
    pub const SUPPORTED: u8 = 3;
}

bitflags! {
    /// Capabilities reported for SEL = 3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureCaps: u32 {
        const SAVE = 1 << 0;
        const NS_SPECIFIC = 1 << 1;
        const CHANGE = 1 << 2;
    }
}

/// `None` for unsupported features.
pub fn capabilities(fid: u8) -> Option<FeatureCaps> {
    let caps = match fid {
        fid::TEMPERATURE_THRESHOLD
        | fid::VOLATILE_WRITE_CACHE
        | fid::NUMBER_OF_QUEUES
        | fid::ASYNC_EVENT_CONF
        | fid::TIMESTAMP
        | fid::COMMAND_SET_PROFILE => FeatureCaps::CHANGE,
        fid::ERROR_RECOVERY => FeatureCaps::CHANGE | FeatureCaps::NS_SPECIFIC,
        fid::ARBITRATION
        | fid::POWER_MANAGEMENT
        | fid::INTERRUPT_COALESCING
        | fid::INTERRUPT_VECTOR_CONF
        | fid::WRITE_ATOMICITY => FeatureCaps::empty(),
        _ => return None,
    };
    Some(caps)
}

/// Composite temperature reported by the controller, in Kelvin.
pub const COMPOSITE_TEMPERATURE: u16 = 0x143;
pub const DEFAULT_TEMP_OVER: u16 = 0x157;

/// Async event configuration: SMART temperature warning.
const AEC_SMART_TEMPERATURE: u32 = 1 << 1;

/// Host timestamp, advanced by the controller clock since it was set.
#[derive(Debug, Clone, Copy)]
pub struct Timestamp {
    host_ms: u64,
    /// 0 after reset, 1 once the host set it.
    origin: u8,
    set_at: Instant,
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp {
            host_ms: 0,
            origin: 0,
            set_at: Instant::now(),
        }
    }
}

impl Timestamp {
    pub fn reset(&mut self) {
        *self = Timestamp::default();
    }

    pub fn set(&mut self, ms: u64) {
        self.host_ms = ms & 0xffff_ffff_ffff;
        self.origin = 1;
        self.set_at = Instant::now();
    }

    /// Timestamp data structure: 48-bit milliseconds, origin in bits 51:49.
    pub fn value(&self) -> u64 {
        let elapsed = self.set_at.elapsed().as_millis() as u64;
        let ms = self.host_ms.wrapping_add(elapsed) & 0xffff_ffff_ffff;
        ms | (self.origin as u64 & 0x7) << 49
    }
}

#[derive(Debug, Clone)]
pub struct Features {
    pub arbitration: u32,
    pub power_state: u32,
    pub temp_over: u16,
    pub temp_under: u16,
    /// Time limited error recovery.
    pub tler: u16,
    pub volatile_write_cache: bool,
    pub interrupt_coalescing: u32,
    pub async_config: u32,
    pub iocsci: u32,
    pub timestamp: Timestamp,
}

impl Default for Features {
    fn default() -> Self {
        Features {
            // Arbitration burst: no limit.
            arbitration: 0x7,
            power_state: 0,
            temp_over: DEFAULT_TEMP_OVER,
            temp_under: 0,
            tler: 0,
            volatile_write_cache: true,
            interrupt_coalescing: 0,
            async_config: 0,
            iocsci: 0,
            timestamp: Timestamp::default(),
        }
    }
}

impl Features {
    /// Composite temperature is outside the configured thresholds.
    pub fn temperature_alarm(&self) -> bool {
        COMPOSITE_TEMPERATURE >= self.temp_over || COMPOSITE_TEMPERATURE <= self.temp_under
    }
}

impl NvmeController {
    fn queue_count_result(&self) -> u64 {
        let n = self.params.max_ioqpairs as u64 - 1;
        n | n << 16
    }

    /// Namespace-specific features need a valid namespace.
    fn feature_namespace(&self, nsid: u32, allow_broadcast: bool) -> Result<(), NvmeStatus> {
        if nsid == NSID_BROADCAST {
            return if allow_broadcast {
                Ok(())
            } else {
                Err(NvmeStatus::INVALID_NSID)
            };
        }
        if nsid == 0 || nsid > crate::command::MAX_NAMESPACES {
            return Err(NvmeStatus::INVALID_NSID);
        }
        if !self.namespaces.contains_key(&nsid) {
            return Err(NvmeStatus::INVALID_FIELD);
        }
        Ok(())
    }

    pub(crate) fn get_features(
        &mut self,
        cmd: &NvmeCommand,
        memory: &mut dyn MemoryBus,
    ) -> Outcome {
        let fid = (cmd.cdw10 & 0xff) as u8;
        let sel = ((cmd.cdw10 >> 8) & 0x7) as u8;
        tracing::debug!(fid, sel, nsid = cmd.nsid, "get features");

        let Some(caps) = capabilities(fid) else {
            return Err(NvmeStatus::INVALID_FIELD);
        };
        if caps.contains(FeatureCaps::NS_SPECIFIC) {
            self.feature_namespace(cmd.nsid, false)?;
        }

        let defaults;
        let features = match sel {
            select::CURRENT => &self.features,
            select::DEFAULT | select::SAVED => {
                defaults = Features::default();
                &defaults
            }
            select::SUPPORTED => return Ok(Done::Complete(caps.bits() as u64)),
            _ => return Err(NvmeStatus::INVALID_FIELD),
        };

        let result = match fid {
            fid::ARBITRATION => features.arbitration,
            fid::POWER_MANAGEMENT => features.power_state,
            fid::TEMPERATURE_THRESHOLD => {
                let tmpsel = (cmd.cdw11 >> 16) & 0xf;
                let thsel = (cmd.cdw11 >> 20) & 0x3;
                match (tmpsel, thsel) {
                    // Only the composite sensor is reported.
                    (1.., _) => 0,
                    (0, 0) => features.temp_over as u32,
                    (0, 1) => features.temp_under as u32,
                    _ => return Err(NvmeStatus::INVALID_FIELD),
                }
            }
            fid::ERROR_RECOVERY => {
                let dulbe = sel == select::CURRENT
                    && self.namespaces.get(&cmd.nsid).is_some_and(|ns| ns.dulbe());
                features.tler as u32 | (dulbe as u32) << 16
            }
            fid::VOLATILE_WRITE_CACHE => features.volatile_write_cache as u32,
            fid::NUMBER_OF_QUEUES => self.queue_count_result() as u32,
            fid::INTERRUPT_COALESCING => features.interrupt_coalescing,
            fid::INTERRUPT_VECTOR_CONF => {
                let iv = cmd.cdw11 & 0xffff;
                if iv >= self.params.msix_qsize as u32 {
                    return Err(NvmeStatus::INVALID_FIELD);
                }
                // Coalescing is never applied to the admin vector.
                let admin_vector = self.completion_queue(0).map_or(0, |cq| cq.vector as u32);
                iv | ((iv == admin_vector) as u32) << 16
            }
            fid::WRITE_ATOMICITY => 0,
            fid::ASYNC_EVENT_CONF => features.async_config,
            fid::TIMESTAMP => {
                let ts = features.timestamp.value();
                self.dma_to_host(cmd, &ts.to_le_bytes(), memory)?;
                0
            }
            fid::COMMAND_SET_PROFILE => features.iocsci,
            _ => return Err(NvmeStatus::INVALID_FIELD),
        };
        Ok(Done::Complete(result as u64))
    }

    pub(crate) fn set_features(
        &mut self,
        cmd: &NvmeCommand,
        memory: &mut dyn MemoryBus,
    ) -> Outcome {
        let fid = (cmd.cdw10 & 0xff) as u8;
        let save = cmd.cdw10 & (1 << 31) != 0;
        tracing::debug!(fid, save, nsid = cmd.nsid, value = cmd.cdw11, "set features");

        let caps = capabilities(fid).unwrap_or(FeatureCaps::empty());
        if save && !caps.contains(FeatureCaps::SAVE) {
            return Err(NvmeStatus::FID_NOT_SAVEABLE);
        }
        if !caps.contains(FeatureCaps::CHANGE) {
            return Err(NvmeStatus::FEAT_NOT_CHANGEABLE);
        }
        if caps.contains(FeatureCaps::NS_SPECIFIC) {
            self.feature_namespace(cmd.nsid, true)?;
        } else if cmd.nsid != 0 && cmd.nsid != NSID_BROADCAST {
            return Err(NvmeStatus::FEAT_NOT_NS_SPECIFIC);
        }

        match fid {
            fid::TEMPERATURE_THRESHOLD => {
                let tmpth = cmd.cdw11 as u16;
                let tmpsel = (cmd.cdw11 >> 16) & 0xf;
                let thsel = (cmd.cdw11 >> 20) & 0x3;
                if tmpsel != 0 {
                    return Ok(Done::Complete(0));
                }
                match thsel {
                    0 => self.features.temp_over = tmpth,
                    1 => self.features.temp_under = tmpth,
                    _ => return Err(NvmeStatus::INVALID_FIELD),
                }
                if self.features.temperature_alarm()
                    && self.features.async_config & AEC_SMART_TEMPERATURE != 0
                {
                    self.aeq.enqueue(AsyncEvent::new(
                        event_type::SMART,
                        smart_info::TEMP_THRESHOLD,
                        lid::SMART,
                    ));
                }
            }
            fid::ERROR_RECOVERY => {
                self.features.tler = cmd.cdw11 as u16;
                let dulbe = cmd.cdw11 & (1 << 16) != 0;
                if cmd.nsid == NSID_BROADCAST {
                    for ns in self.namespaces.values_mut() {
                        ns.set_dulbe(dulbe);
                    }
                } else if let Some(ns) = self.namespaces.get_mut(&cmd.nsid) {
                    ns.set_dulbe(dulbe);
                }
            }
            fid::VOLATILE_WRITE_CACHE => {
                self.features.volatile_write_cache = cmd.cdw11 & 1 != 0;
            }
            fid::NUMBER_OF_QUEUES => {
                let io_queues = self.sqs.iter().skip(1).flatten().count()
                    + self.cqs.iter().skip(1).flatten().count();
                if io_queues != 0 {
                    return Err(NvmeStatus::CMD_SEQ_ERROR);
                }
                if cmd.cdw11 & 0xffff == 0xffff || cmd.cdw11 >> 16 == 0xffff {
                    return Err(NvmeStatus::INVALID_FIELD);
                }
                return Ok(Done::Complete(self.queue_count_result()));
            }
            fid::ASYNC_EVENT_CONF => self.features.async_config = cmd.cdw11,
            fid::TIMESTAMP => {
                let data = self.dma_from_host(cmd, 8, memory)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&data);
                self.features.timestamp.set(u64::from_le_bytes(raw));
            }
            fid::COMMAND_SET_PROFILE => {
                // Only the first I/O command set combination is offered.
                let iocsci = cmd.cdw11 & 0x1ff;
                if iocsci != 0 {
                    return Err(NvmeStatus::INVALID_FIELD);
                }
                self.features.iocsci = iocsci;
            }
            _ => return Err(NvmeStatus::FEAT_NOT_CHANGEABLE),
        }
        Ok(Done::Complete(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_table() {
        assert_eq!(capabilities(fid::ARBITRATION), Some(FeatureCaps::empty()));
        assert!(capabilities(fid::ERROR_RECOVERY)
            .unwrap()
            .contains(FeatureCaps::NS_SPECIFIC | FeatureCaps::CHANGE));
        assert_eq!(capabilities(0x7f), None);
    }

    #[test]
    fn default_thresholds_do_not_alarm() {
        let mut features = Features::default();
        assert!(!features.temperature_alarm());
        features.temp_over = COMPOSITE_TEMPERATURE;
        assert!(features.temperature_alarm());
    }

    #[test]
    fn timestamp_layout() {
        let mut ts = Timestamp::default();
        assert_eq!(ts.value() >> 48, 0);
        ts.set(0x1234_5678);
        let value = ts.value();
        assert_eq!(value >> 49, 1);
        assert!(value & 0xffff_ffff_ffff >= 0x1234_5678);
    }
}
