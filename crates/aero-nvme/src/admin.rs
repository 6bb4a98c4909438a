//! Admin command set.

use crate::aer::{event_type, notice_info};
use crate::backend::BlockOp;
use crate::command::{csi, AdminOpcode, NvmeCommand, MAX_NAMESPACES, NSID_BROADCAST};
use crate::features::DEFAULT_TEMP_OVER;
use crate::job::{Finish, Job, Step};
use crate::log_page::lid;
use crate::namespace::{FormatSpec, IDENTIFY_DATA_SIZE};
use crate::queue::RequestHandle;
use crate::regs::NVME_VERSION;
use crate::{
    write_ascii_padded, AsyncEvent, Done, MemoryBus, Namespace, NvmeController, NvmeStatus,
    Outcome,
};

/// Identify CNS values.
mod cns {
    pub const NAMESPACE: u8 = 0x00;
    pub const CONTROLLER: u8 = 0x01;
    pub const ACTIVE_NS_LIST: u8 = 0x02;
    pub const NS_DESCRIPTORS: u8 = 0x03;
    pub const CSI_NAMESPACE: u8 = 0x05;
    pub const CSI_CONTROLLER: u8 = 0x06;
    pub const CSI_ACTIVE_NS_LIST: u8 = 0x07;
    pub const ALLOCATED_NS_LIST: u8 = 0x10;
    pub const ALLOCATED_NAMESPACE: u8 = 0x11;
    pub const IO_COMMAND_SET: u8 = 0x1c;
}

/// PCI vendor id (and subsystem vendor id) reported in Identify Controller.
pub const NVME_VENDOR_ID: u16 = 0x1d1d;

const NQN_PREFIX: &str = "nqn.2019-08.dev.aero:";

/// Async event configuration: namespace attribute notices.
const AEC_NS_ATTR: u32 = 1 << 8;

/// Controller id of this controller in namespace attachment lists.
const CONTROLLER_ID: u16 = 0;

impl NvmeController {
    pub(crate) fn execute_admin(
        &mut self,
        handle: RequestHandle,
        cmd: &NvmeCommand,
        memory: &mut dyn MemoryBus,
    ) -> Outcome {
        let Some(op) = AdminOpcode::from_raw(cmd.opc) else {
            tracing::debug!(opcode = cmd.opc, "unsupported admin opcode");
            return Err(NvmeStatus::INVALID_OPCODE);
        };
        // Admin commands use PRPs and are never fused.
        if cmd.psdt != 0 || cmd.fuse != 0 {
            return Err(NvmeStatus::INVALID_FIELD);
        }

        match op {
            AdminOpcode::DeleteSq => {
                self.delete_submission_queue((cmd.cdw10 & 0xffff) as u16, memory)?;
                Ok(Done::Complete(0))
            }
            AdminOpcode::CreateSq => {
                // Physically contiguous queues only.
                if cmd.cdw11 & 0x1 == 0 {
                    return Err(NvmeStatus::INVALID_FIELD);
                }
                self.create_submission_queue(
                    (cmd.cdw10 & 0xffff) as u16,
                    (cmd.cdw11 >> 16) as u16,
                    cmd.prp1,
                    (cmd.cdw10 >> 16) + 1,
                )?;
                Ok(Done::Complete(0))
            }
            AdminOpcode::GetLogPage => self.get_log_page(cmd, memory),
            AdminOpcode::DeleteCq => {
                self.delete_completion_queue((cmd.cdw10 & 0xffff) as u16)?;
                Ok(Done::Complete(0))
            }
            AdminOpcode::CreateCq => {
                if cmd.cdw11 & 0x1 == 0 {
                    return Err(NvmeStatus::INVALID_FIELD);
                }
                self.create_completion_queue(
                    (cmd.cdw10 & 0xffff) as u16,
                    (cmd.cdw11 >> 16) as u16,
                    cmd.prp1,
                    (cmd.cdw10 >> 16) + 1,
                    cmd.cdw11 & 0x2 != 0,
                )?;
                Ok(Done::Complete(0))
            }
            AdminOpcode::Identify => self.identify(cmd, memory),
            AdminOpcode::Abort => {
                let sqid = (cmd.cdw10 & 0xffff) as u16;
                if self.submission_queue(sqid).is_none() {
                    return Err(NvmeStatus::INVALID_FIELD);
                }
                // Bit 0 set: the command was not aborted.
                Ok(Done::Complete(1))
            }
            AdminOpcode::SetFeatures => self.set_features(cmd, memory),
            AdminOpcode::GetFeatures => self.get_features(cmd, memory),
            AdminOpcode::AsyncEventRequest => {
                self.aeq.request(handle)?;
                Ok(Done::Deferred)
            }
            AdminOpcode::NamespaceAttachment => self.namespace_attachment(cmd, memory),
            AdminOpcode::FormatNvm => self.format_nvm(cmd),
        }
    }

    fn identify(&mut self, cmd: &NvmeCommand, memory: &mut dyn MemoryBus) -> Outcome {
        let cns = (cmd.cdw10 & 0xff) as u8;
        let set = (cmd.cdw11 >> 24) as u8;
        tracing::debug!(cns, nsid = cmd.nsid, csi = set, "identify");

        let data = match cns {
            cns::NAMESPACE => self.identify_namespace(cmd.nsid, true, |ns| Ok(ns.identify()))?,
            cns::ALLOCATED_NAMESPACE => {
                self.identify_namespace(cmd.nsid, false, |ns| Ok(ns.identify()))?
            }
            cns::CSI_NAMESPACE => {
                self.identify_namespace(cmd.nsid, true, |ns| ns.identify_csi(set))?
            }
            cns::CONTROLLER => self.identify_controller(),
            cns::CSI_CONTROLLER => self.identify_controller_csi(set)?,
            cns::ACTIVE_NS_LIST => self.namespace_list(cmd.nsid, |ns| ns.is_attached())?,
            cns::CSI_ACTIVE_NS_LIST => {
                if set != csi::NVM && set != csi::ZONED {
                    return Err(NvmeStatus::INVALID_FIELD);
                }
                self.namespace_list(cmd.nsid, |ns| ns.is_attached() && ns.csi() == set)?
            }
            cns::ALLOCATED_NS_LIST => self.namespace_list(cmd.nsid, |_| true)?,
            cns::NS_DESCRIPTORS => {
                self.check_nsid(cmd.nsid)?;
                let ns = self
                    .namespaces
                    .get(&cmd.nsid)
                    .filter(|ns| ns.is_attached())
                    .ok_or(NvmeStatus::INVALID_FIELD)?;
                ns.descriptors()
            }
            cns::IO_COMMAND_SET => {
                let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
                // Combination 0: NVM and zoned.
                let vector = 1u64 << csi::NVM | 1u64 << csi::ZONED;
                data[0..8].copy_from_slice(&vector.to_le_bytes());
                data
            }
            _ => {
                tracing::debug!(cns, "unsupported identify CNS");
                return Err(NvmeStatus::INVALID_FIELD);
            }
        };
        self.dma_to_host(cmd, &data, memory)?;
        Ok(Done::Complete(0))
    }

    fn check_nsid(&self, nsid: u32) -> Result<(), NvmeStatus> {
        if nsid == 0 || nsid > MAX_NAMESPACES {
            return Err(NvmeStatus::INVALID_NSID);
        }
        Ok(())
    }

    /// Identify data for one namespace. Namespaces that are not allocated (or, with
    /// `active_only`, not attached) report an all-zero structure.
    fn identify_namespace(
        &self,
        nsid: u32,
        active_only: bool,
        build: impl FnOnce(&Namespace) -> Result<Vec<u8>, NvmeStatus>,
    ) -> Result<Vec<u8>, NvmeStatus> {
        self.check_nsid(nsid)?;
        match self.namespaces.get(&nsid) {
            Some(ns) if ns.is_attached() || !active_only => build(ns),
            _ => Ok(vec![0u8; IDENTIFY_DATA_SIZE]),
        }
    }

    /// Up to 1024 namespace ids greater than `start`, in increasing order.
    fn namespace_list(
        &self,
        start: u32,
        include: impl Fn(&Namespace) -> bool,
    ) -> Result<Vec<u8>, NvmeStatus> {
        if start >= NSID_BROADCAST - 1 {
            return Err(NvmeStatus::INVALID_NSID);
        }
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        let ids = self
            .namespaces
            .range(start.saturating_add(1)..)
            .filter(|(_, ns)| include(ns))
            .map(|(&nsid, _)| nsid);
        for (chunk, nsid) in data.chunks_exact_mut(4).zip(ids) {
            chunk.copy_from_slice(&nsid.to_le_bytes());
        }
        Ok(data)
    }

    fn identify_controller(&self) -> Vec<u8> {
        let params = &self.params;
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        data[0..2].copy_from_slice(&NVME_VENDOR_ID.to_le_bytes()); // VID
        data[2..4].copy_from_slice(&NVME_VENDOR_ID.to_le_bytes()); // SSVID
        write_ascii_padded(&mut data[4..24], &params.serial);
        write_ascii_padded(&mut data[24..64], &params.model);
        write_ascii_padded(&mut data[64..72], &params.firmware);
        data[72] = 6; // RAB
        data[77] = params.mdts;
        data[78..80].copy_from_slice(&CONTROLLER_ID.to_le_bytes());
        data[80..84].copy_from_slice(&NVME_VERSION.to_le_bytes());
        // OAES: namespace attribute notices.
        data[92..96].copy_from_slice(&(1u32 << 8).to_le_bytes());
        data[111] = 1; // CNTRLTYPE: I/O controller

        // OACS: format NVM, namespace management/attachment.
        data[256..258].copy_from_slice(&(1u16 << 1 | 1u16 << 3).to_le_bytes());
        data[258] = 3; // ACL
        data[259] = params.aerl;
        data[260] = 0x3; // FRMW: slot 1 read-only, one slot
        data[261] = 0x7; // LPA: per-namespace SMART, command effects, extended data
        data[266..268].copy_from_slice(&DEFAULT_TEMP_OVER.to_le_bytes());
        data[268..270].copy_from_slice(&0x175u16.to_le_bytes()); // CCTEMP

        data[512] = 0x66; // SQES
        data[513] = 0x44; // CQES
        data[516..520].copy_from_slice(&MAX_NAMESPACES.to_le_bytes());
        // ONCS: compare, dataset management, write zeroes, save/select in features, timestamp,
        // verify, copy.
        let oncs: u16 = 1 << 0 | 1 << 2 | 1 << 3 | 1 << 4 | 1 << 6 | 1 << 7 | 1 << 8;
        data[520..522].copy_from_slice(&oncs.to_le_bytes());
        // VWC: present, broadcast flush supported.
        data[525] = 0x7;
        data[534..536].copy_from_slice(&1u16.to_le_bytes()); // OCFS: copy format 0

        let mut sgls: u32 = 1 | 1 << 16 | 1 << 19;
        if params.sgl_excess_length {
            sgls |= 1 << 18;
        }
        data[536..540].copy_from_slice(&sgls.to_le_bytes());

        let nqn = format!("{NQN_PREFIX}{}", params.serial);
        let len = nqn.len().min(256);
        data[768..768 + len].copy_from_slice(&nqn.as_bytes()[..len]);

        // Power state 0: 25 W, entry/exit latencies.
        data[2048..2050].copy_from_slice(&0x9c4u16.to_le_bytes());
        data[2052..2056].copy_from_slice(&0x10u32.to_le_bytes());
        data[2056..2060].copy_from_slice(&0x4u32.to_le_bytes());
        data
    }

    fn identify_controller_csi(&self, set: u8) -> Result<Vec<u8>, NvmeStatus> {
        let mut data = vec![0u8; IDENTIFY_DATA_SIZE];
        match set {
            csi::NVM => {
                data[0] = self.params.vsl;
                data[4..8].copy_from_slice(&self.params.dmrsl.to_le_bytes());
            }
            csi::ZONED => data[0] = self.params.zasl,
            _ => return Err(NvmeStatus::INVALID_FIELD),
        }
        Ok(data)
    }

    fn namespace_attachment(&mut self, cmd: &NvmeCommand, memory: &mut dyn MemoryBus) -> Outcome {
        let nsid = cmd.nsid;
        let sel = cmd.cdw10 & 0xf;
        self.check_nsid(nsid)?;
        if !self.namespaces.contains_key(&nsid) {
            return Err(NvmeStatus::INVALID_FIELD);
        }
        let attach = match sel {
            0 => true,
            1 => false,
            _ => return Err(NvmeStatus::INVALID_FIELD),
        };

        let list = self.dma_from_host(cmd, IDENTIFY_DATA_SIZE, memory)?;
        let count = u16::from_le_bytes([list[0], list[1]]) as usize;
        if count == 0 || count > IDENTIFY_DATA_SIZE / 2 - 1 {
            return Err(NvmeStatus::NS_CTRL_LIST_INVALID);
        }
        let ids = list[2..2 + count * 2]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]));
        for id in ids {
            if id != CONTROLLER_ID {
                tracing::debug!(id, "attachment list names an unknown controller");
                return Err(NvmeStatus::NS_CTRL_LIST_INVALID);
            }
            let Some(ns) = self.namespaces.get_mut(&nsid) else {
                return Err(NvmeStatus::INVALID_FIELD);
            };
            match (attach, ns.is_attached()) {
                (true, true) => return Err(NvmeStatus::NS_ALREADY_ATTACHED),
                (false, false) => return Err(NvmeStatus::NS_NOT_ATTACHED),
                _ => ns.set_attached(attach),
            }
            tracing::info!(nsid, attach, "namespace attachment changed");

            if self.changed_nsids.insert(nsid) && self.features.async_config & AEC_NS_ATTR != 0 {
                self.aeq.enqueue(AsyncEvent::new(
                    event_type::NOTICE,
                    notice_info::NS_ATTR_CHANGED,
                    lid::CHANGED_NS,
                ));
            }
        }
        Ok(Done::Complete(0))
    }

    fn format_nvm(&mut self, cmd: &NvmeCommand) -> Outcome {
        let ses = (cmd.cdw10 >> 9) & 0x7;
        if ses > 1 {
            // Cryptographic erase is not supported.
            return Err(NvmeStatus::INVALID_FIELD);
        }
        let spec = FormatSpec::from_cdw10(cmd.cdw10)?;

        let nsids: Vec<u32> = if cmd.nsid == NSID_BROADCAST {
            self.namespaces
                .values()
                .filter(|ns| ns.is_attached())
                .map(|ns| ns.nsid())
                .collect()
        } else {
            self.check_nsid(cmd.nsid)?;
            match self.namespaces.get(&cmd.nsid) {
                Some(ns) if ns.is_attached() => vec![cmd.nsid],
                _ => return Err(NvmeStatus::INVALID_FIELD),
            }
        };

        let mut job = Job::new(Finish::Format {
            nsids: nsids.clone(),
            spec,
        });
        for nsid in nsids {
            let Some(ns) = self.namespaces.get(&nsid) else {
                continue;
            };
            if ns.zones().is_some() {
                return Err(NvmeStatus::INVALID_FORMAT);
            }
            let len = ns.backend().len();
            tracing::info!(nsid, lbaf = spec.lbaf, ses, "formatting namespace");
            job.push(Step::new(
                nsid,
                BlockOp::WriteZeroes { offset: 0, len },
                NvmeStatus::INTERNAL_DEVICE_ERROR,
            ));
        }
        Ok(Done::Job(job))
    }
}
