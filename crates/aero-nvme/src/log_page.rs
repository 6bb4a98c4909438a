//! Get Log Page.

use crate::aer::event_type;
use crate::command::{command_effects, csi, CommandSet, NvmeCommand, NSID_BROADCAST};
use crate::features::COMPOSITE_TEMPERATURE;
use crate::namespace::NamespaceStats;
use crate::regs::css;
use crate::{write_ascii_padded, Done, MemoryBus, NvmeController, NvmeStatus, Outcome};

/// Log page identifiers.
pub mod lid {
    pub const ERROR_INFO: u8 = 0x01;
    pub const SMART: u8 = 0x02;
    pub const FW_SLOT: u8 = 0x03;
    pub const CHANGED_NS: u8 = 0x04;
    pub const CMD_EFFECTS: u8 = 0x05;
}

const ERROR_LOG_ENTRY_SIZE: usize = 64;
const SMART_LOG_SIZE: usize = 512;
const FW_SLOT_LOG_SIZE: usize = 512;
const CHANGED_NS_LOG_SIZE: usize = 4096;
const CMD_EFFECTS_LOG_SIZE: usize = 4096;

/// Critical warning: temperature outside the configured thresholds.
const CRITICAL_WARNING_TEMPERATURE: u8 = 1 << 1;

/// SMART data units are thousands of 512-byte units, rounded up.
fn data_units(bytes: u64) -> u64 {
    (bytes / 512).div_ceil(1000)
}

impl NvmeController {
    pub(crate) fn get_log_page(&mut self, cmd: &NvmeCommand, memory: &mut dyn MemoryBus) -> Outcome {
        let lid = (cmd.cdw10 & 0xff) as u8;
        let rae = cmd.cdw10 & (1 << 15) != 0;
        let numd = (cmd.cdw11 & 0xffff) << 16 | cmd.cdw10 >> 16;
        let len = (numd as usize + 1) * 4;
        let offset = (cmd.cdw13 as u64) << 32 | cmd.cdw12 as u64;
        tracing::debug!(lid, rae, len, offset, "get log page");

        if offset & 0x3 != 0 {
            return Err(NvmeStatus::INVALID_FIELD);
        }
        self.check_mdts(len)?;

        let page = match lid {
            lid::ERROR_INFO => vec![0u8; ERROR_LOG_ENTRY_SIZE],
            lid::SMART => self.smart_log(cmd.nsid)?,
            lid::FW_SLOT => self.firmware_slot_log(),
            lid::CHANGED_NS => self.changed_ns_log(),
            lid::CMD_EFFECTS => self.command_effects_log((cmd.cdw14 >> 24) as u8),
            _ => {
                tracing::debug!(lid, "unsupported log page");
                return Err(NvmeStatus::INVALID_FIELD);
            }
        };
        if offset >= page.len() as u64 {
            return Err(NvmeStatus::INVALID_FIELD);
        }
        let start = offset as usize;
        let end = page.len().min(start + len);
        self.dma_to_host(cmd, &page[start..end], memory)?;

        if !rae {
            match lid {
                lid::ERROR_INFO => self.aeq.clear(event_type::ERROR),
                lid::SMART => self.aeq.clear(event_type::SMART),
                lid::CHANGED_NS => {
                    self.changed_nsids.clear();
                    self.aeq.clear(event_type::NOTICE);
                }
                _ => {}
            }
        }
        Ok(Done::Complete(0))
    }

    fn smart_log(&self, nsid: u32) -> Result<Vec<u8>, NvmeStatus> {
        let mut stats = NamespaceStats::default();
        if nsid == 0 || nsid == NSID_BROADCAST {
            for ns in self.namespaces.values() {
                stats.add(&ns.stats());
            }
        } else {
            let ns = self.namespaces.get(&nsid).ok_or(NvmeStatus::INVALID_FIELD)?;
            stats = ns.stats();
        }

        let mut log = vec![0u8; SMART_LOG_SIZE];
        if self.features.temperature_alarm() {
            log[0] |= CRITICAL_WARNING_TEMPERATURE;
        }
        log[1..3].copy_from_slice(&COMPOSITE_TEMPERATURE.to_le_bytes());
        // 128-bit counters; the upper halves stay zero.
        log[32..40].copy_from_slice(&data_units(stats.bytes_read).to_le_bytes());
        log[48..56].copy_from_slice(&data_units(stats.bytes_written).to_le_bytes());
        log[64..72].copy_from_slice(&stats.reads.to_le_bytes());
        log[80..88].copy_from_slice(&stats.writes.to_le_bytes());
        Ok(log)
    }

    fn firmware_slot_log(&self) -> Vec<u8> {
        let mut log = vec![0u8; FW_SLOT_LOG_SIZE];
        // AFI: slot 1 active.
        log[0] = 0x1;
        write_ascii_padded(&mut log[8..16], &self.params.firmware);
        log
    }

    fn changed_ns_log(&self) -> Vec<u8> {
        let mut log = vec![0u8; CHANGED_NS_LOG_SIZE];
        if self.changed_nsids.len() > CHANGED_NS_LOG_SIZE / 4 {
            log[0..4].copy_from_slice(&u32::MAX.to_le_bytes());
            return log;
        }
        for (chunk, nsid) in log.chunks_exact_mut(4).zip(&self.changed_nsids) {
            chunk.copy_from_slice(&nsid.to_le_bytes());
        }
        log
    }

    fn command_effects_log(&self, requested_csi: u8) -> Vec<u8> {
        let mut log = vec![0u8; CMD_EFFECTS_LOG_SIZE];
        let io_set = match (self.cc.css(), requested_csi) {
            (css::NVM, _) => Some(CommandSet::Nvm),
            (css::ALL_SUPPORTED, csi::NVM) => Some(CommandSet::Nvm),
            (css::ALL_SUPPORTED, csi::ZONED) => Some(CommandSet::Zoned),
            _ => None,
        };
        for opc in 0..=255u8 {
            let off = opc as usize * 4;
            let acs = command_effects(CommandSet::Admin, opc).bits();
            log[off..off + 4].copy_from_slice(&acs.to_le_bytes());
            if let Some(set) = io_set {
                let iocs = command_effects(set, opc).bits();
                log[1024 + off..1024 + off + 4].copy_from_slice(&iocs.to_le_bytes());
            }
        }
        log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_units_round_up() {
        assert_eq!(data_units(0), 0);
        assert_eq!(data_units(512), 1);
        assert_eq!(data_units(512 * 1000), 1);
        assert_eq!(data_units(512 * 1001), 2);
    }
}
