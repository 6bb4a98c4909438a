//! Submission queue entry decoding and the per-command-set capability table.

use bitflags::bitflags;

pub const NVME_SQE_SIZE: usize = 64;
pub const NVME_CQE_SIZE: usize = 16;

pub const NSID_BROADCAST: u32 = 0xffff_ffff;
pub const MAX_NAMESPACES: u32 = 256;

/// PSDT values.
pub mod psdt {
    pub const PRP: u8 = 0;
    pub const SGL_MPTR_CONTIGUOUS: u8 = 1;
    pub const SGL_MPTR_SGL: u8 = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NvmeCommand {
    pub opc: u8,
    pub fuse: u8,
    pub psdt: u8,
    pub cid: u16,
    pub nsid: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

fn le_u32(bytes: &[u8; NVME_SQE_SIZE], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn le_u64(bytes: &[u8; NVME_SQE_SIZE], off: usize) -> u64 {
    (le_u32(bytes, off + 4) as u64) << 32 | le_u32(bytes, off) as u64
}

impl NvmeCommand {
    pub fn parse(bytes: [u8; NVME_SQE_SIZE]) -> NvmeCommand {
        let dw0 = le_u32(&bytes, 0);
        NvmeCommand {
            opc: (dw0 & 0xff) as u8,
            fuse: ((dw0 >> 8) & 0x3) as u8,
            psdt: ((dw0 >> 14) & 0x3) as u8,
            cid: (dw0 >> 16) as u16,
            nsid: le_u32(&bytes, 4),
            mptr: le_u64(&bytes, 16),
            prp1: le_u64(&bytes, 24),
            prp2: le_u64(&bytes, 32),
            cdw10: le_u32(&bytes, 40),
            cdw11: le_u32(&bytes, 44),
            cdw12: le_u32(&bytes, 48),
            cdw13: le_u32(&bytes, 52),
            cdw14: le_u32(&bytes, 56),
            cdw15: le_u32(&bytes, 60),
        }
    }

    pub fn to_bytes(&self) -> [u8; NVME_SQE_SIZE] {
        let mut out = [0u8; NVME_SQE_SIZE];
        let dw0 = self.opc as u32
            | ((self.fuse as u32 & 0x3) << 8)
            | ((self.psdt as u32 & 0x3) << 14)
            | (self.cid as u32) << 16;
        out[0..4].copy_from_slice(&dw0.to_le_bytes());
        out[4..8].copy_from_slice(&self.nsid.to_le_bytes());
        out[16..24].copy_from_slice(&self.mptr.to_le_bytes());
        out[24..32].copy_from_slice(&self.prp1.to_le_bytes());
        out[32..40].copy_from_slice(&self.prp2.to_le_bytes());
        for (i, dw) in [
            self.cdw10, self.cdw11, self.cdw12, self.cdw13, self.cdw14, self.cdw15,
        ]
        .iter()
        .enumerate()
        {
            let off = 40 + i * 4;
            out[off..off + 4].copy_from_slice(&dw.to_le_bytes());
        }
        out
    }

    /// Starting LBA of read/write style commands (CDW10/CDW11).
    pub fn slba(&self) -> u64 {
        (self.cdw11 as u64) << 32 | self.cdw10 as u64
    }

    /// Number of logical blocks of read/write style commands (1-based).
    pub fn nlb(&self) -> u32 {
        (self.cdw12 & 0xffff) + 1
    }

    /// Data pointer viewed as an SGL descriptor (bytes 24..40).
    pub fn sgl1(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..8].copy_from_slice(&self.prp1.to_le_bytes());
        out[8..16].copy_from_slice(&self.prp2.to_le_bytes());
        out
    }

    /// PRINFO field of the read/write control word.
    pub fn prinfo(&self) -> u8 {
        ((self.cdw12 >> 26) & 0xf) as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOpcode {
    DeleteSq,
    CreateSq,
    GetLogPage,
    DeleteCq,
    CreateCq,
    Identify,
    Abort,
    SetFeatures,
    GetFeatures,
    AsyncEventRequest,
    NamespaceAttachment,
    FormatNvm,
}

impl AdminOpcode {
    pub const ALL: [AdminOpcode; 12] = [
        AdminOpcode::DeleteSq,
        AdminOpcode::CreateSq,
        AdminOpcode::GetLogPage,
        AdminOpcode::DeleteCq,
        AdminOpcode::CreateCq,
        AdminOpcode::Identify,
        AdminOpcode::Abort,
        AdminOpcode::SetFeatures,
        AdminOpcode::GetFeatures,
        AdminOpcode::AsyncEventRequest,
        AdminOpcode::NamespaceAttachment,
        AdminOpcode::FormatNvm,
    ];

    pub fn from_raw(opc: u8) -> Option<AdminOpcode> {
        Self::ALL.iter().copied().find(|op| op.raw() == opc)
    }

    pub fn raw(self) -> u8 {
        match self {
            AdminOpcode::DeleteSq => 0x00,
            AdminOpcode::CreateSq => 0x01,
            AdminOpcode::GetLogPage => 0x02,
            AdminOpcode::DeleteCq => 0x04,
            AdminOpcode::CreateCq => 0x05,
            AdminOpcode::Identify => 0x06,
            AdminOpcode::Abort => 0x08,
            AdminOpcode::SetFeatures => 0x09,
            AdminOpcode::GetFeatures => 0x0a,
            AdminOpcode::AsyncEventRequest => 0x0c,
            AdminOpcode::NamespaceAttachment => 0x15,
            AdminOpcode::FormatNvm => 0x80,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOpcode {
    Flush,
    Write,
    Read,
    Compare,
    WriteZeroes,
    DatasetManagement,
    Verify,
    Copy,
    ZoneMgmtSend,
    ZoneMgmtRecv,
    ZoneAppend,
}

impl IoOpcode {
    pub const ALL: [IoOpcode; 11] = [
        IoOpcode::Flush,
        IoOpcode::Write,
        IoOpcode::Read,
        IoOpcode::Compare,
        IoOpcode::WriteZeroes,
        IoOpcode::DatasetManagement,
        IoOpcode::Verify,
        IoOpcode::Copy,
        IoOpcode::ZoneMgmtSend,
        IoOpcode::ZoneMgmtRecv,
        IoOpcode::ZoneAppend,
    ];

    pub fn from_raw(opc: u8) -> Option<IoOpcode> {
        Self::ALL.iter().copied().find(|op| op.raw() == opc)
    }

    pub fn raw(self) -> u8 {
        match self {
            IoOpcode::Flush => 0x00,
            IoOpcode::Write => 0x01,
            IoOpcode::Read => 0x02,
            IoOpcode::Compare => 0x05,
            IoOpcode::WriteZeroes => 0x08,
            IoOpcode::DatasetManagement => 0x09,
            IoOpcode::Verify => 0x0c,
            IoOpcode::Copy => 0x19,
            IoOpcode::ZoneMgmtSend => 0x79,
            IoOpcode::ZoneMgmtRecv => 0x7a,
            IoOpcode::ZoneAppend => 0x7d,
        }
    }

    /// Commands that move data from the host to the device.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            IoOpcode::Write | IoOpcode::WriteZeroes | IoOpcode::ZoneAppend
        )
    }
}

/// Command set a queue entry is interpreted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandSet {
    Admin,
    Nvm,
    Zoned,
}

/// Command Set Identifier values.
pub mod csi {
    pub const NVM: u8 = 0x00;
    pub const ZONED: u8 = 0x02;
}

bitflags! {
    /// Commands Supported and Effects entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandEffects: u32 {
        /// Command supported.
        const CSUPP = 1 << 0;
        /// Logical block content change.
        const LBCC = 1 << 1;
        /// Namespace capability change.
        const NCC = 1 << 2;
        /// Namespace inventory change.
        const NIC = 1 << 3;
        /// Controller capability change.
        const CCC = 1 << 4;
    }
}

/// Capability lookup keyed by (command set, opcode). An empty result means unsupported.
pub fn command_effects(set: CommandSet, opc: u8) -> CommandEffects {
    let supported = CommandEffects::CSUPP;
    let writes = CommandEffects::CSUPP | CommandEffects::LBCC;
    match set {
        CommandSet::Admin => match AdminOpcode::from_raw(opc) {
            Some(AdminOpcode::NamespaceAttachment) => supported | CommandEffects::NIC,
            Some(AdminOpcode::FormatNvm) => writes,
            Some(_) => supported,
            None => CommandEffects::empty(),
        },
        CommandSet::Nvm | CommandSet::Zoned => match IoOpcode::from_raw(opc) {
            Some(IoOpcode::ZoneMgmtSend | IoOpcode::ZoneAppend) if set == CommandSet::Zoned => {
                writes
            }
            Some(IoOpcode::ZoneMgmtRecv) if set == CommandSet::Zoned => supported,
            Some(IoOpcode::ZoneMgmtSend | IoOpcode::ZoneMgmtRecv | IoOpcode::ZoneAppend) => {
                CommandEffects::empty()
            }
            Some(IoOpcode::Read | IoOpcode::Compare | IoOpcode::Verify) => supported,
            Some(_) => writes,
            None => CommandEffects::empty(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_decodes_dword0_fields() {
        let mut bytes = [0u8; NVME_SQE_SIZE];
        bytes[0] = 0x01;
        bytes[1] = 0x40 | 0x01; // PSDT=1, FUSE=1
        bytes[2..4].copy_from_slice(&0xbeefu16.to_le_bytes());
        bytes[4..8].copy_from_slice(&7u32.to_le_bytes());
        bytes[48..52].copy_from_slice(&9u32.to_le_bytes());
        let cmd = NvmeCommand::parse(bytes);
        assert_eq!(cmd.opc, 0x01);
        assert_eq!(cmd.psdt, 1);
        assert_eq!(cmd.fuse, 1);
        assert_eq!(cmd.cid, 0xbeef);
        assert_eq!(cmd.nsid, 7);
        assert_eq!(cmd.nlb(), 10);
        assert_eq!(NvmeCommand::parse(cmd.to_bytes()), cmd);
    }

    #[test]
    fn effects_table_separates_command_sets() {
        let append = IoOpcode::ZoneAppend.raw();
        assert!(command_effects(CommandSet::Zoned, append).contains(CommandEffects::LBCC));
        assert!(command_effects(CommandSet::Nvm, append).is_empty());
        assert_eq!(
            command_effects(CommandSet::Nvm, IoOpcode::Read.raw()),
            CommandEffects::CSUPP
        );
        assert!(command_effects(CommandSet::Admin, 0x7f).is_empty());
        assert!(command_effects(CommandSet::Admin, 0x15).contains(CommandEffects::NIC));
    }

    #[test]
    fn opcode_round_trip() {
        for op in AdminOpcode::ALL {
            assert_eq!(AdminOpcode::from_raw(op.raw()), Some(op));
        }
        for op in IoOpcode::ALL {
            assert_eq!(IoOpcode::from_raw(op.raw()), Some(op));
        }
        assert_eq!(IoOpcode::from_raw(0x03), None);
    }
}
