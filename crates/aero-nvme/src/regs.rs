//! BAR0 register offsets and field decoding.

use bitflags::bitflags;

pub const NVME_REG_CAP: u64 = 0x0000;
pub const NVME_REG_CAP_HI: u64 = NVME_REG_CAP + 4;
pub const NVME_REG_VS: u64 = 0x0008;
pub const NVME_REG_INTMS: u64 = 0x000c;
pub const NVME_REG_INTMC: u64 = 0x0010;
pub const NVME_REG_CC: u64 = 0x0014;
pub const NVME_REG_CSTS: u64 = 0x001c;
pub const NVME_REG_NSSR: u64 = 0x0020;
pub const NVME_REG_AQA: u64 = 0x0024;
pub const NVME_REG_ASQ: u64 = 0x0028;
pub const NVME_REG_ASQ_HI: u64 = NVME_REG_ASQ + 4;
pub const NVME_REG_ACQ: u64 = 0x0030;
pub const NVME_REG_ACQ_HI: u64 = NVME_REG_ACQ + 4;
pub const NVME_REG_CMBLOC: u64 = 0x0038;
pub const NVME_REG_CMBSZ: u64 = 0x003c;
pub const NVME_REG_PMRCAP: u64 = 0x0e00;
pub const NVME_REG_PMRCTL: u64 = 0x0e04;
pub const NVME_REG_PMRSTS: u64 = 0x0e08;

pub const NVME_DOORBELL_BASE: u64 = 0x1000;

/// NVMe 1.4.0
pub const NVME_VERSION: u32 = 0x0001_0400;

pub const CC_EN: u32 = 1 << 0;

/// BAR holding the controller memory buffer.
pub const CMB_BAR: u32 = 2;
/// BAR holding the persistent memory region.
pub const PMR_BAR: u32 = 4;

/// CMBSZ for a buffer of `size` bytes: every use supported, 4 KiB size units.
pub fn cmbsz(size: u64) -> u32 {
    if size == 0 {
        return 0;
    }
    let units = (size / 4096).min(0xf_ffff) as u32;
    0x1f | units << 12
}

/// PMRCAP: read and write data support, located in [`PMR_BAR`].
pub fn pmrcap(present: bool) -> u32 {
    if !present {
        return 0;
    }
    (1 << 3) | (1 << 4) | PMR_BAR << 5
}

bitflags! {
    /// Controller Status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Csts: u32 {
        const RDY = 1 << 0;
        const CFS = 1 << 1;
        /// SHST = 10b (shutdown processing complete).
        const SHST_COMPLETE = 0b10 << 2;
        const SHST_MASK = 0b11 << 2;
    }
}

/// CC.CSS values.
pub mod css {
    pub const NVM: u8 = 0;
    pub const ALL_SUPPORTED: u8 = 6;
    pub const ADMIN_ONLY: u8 = 7;
}

/// Field view of a CC register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig(pub u32);

impl ControllerConfig {
    pub fn enabled(self) -> bool {
        self.0 & CC_EN != 0
    }

    pub fn css(self) -> u8 {
        ((self.0 >> 4) & 0x7) as u8
    }

    pub fn mps(self) -> u32 {
        (self.0 >> 7) & 0xf
    }

    pub fn shn(self) -> u32 {
        (self.0 >> 14) & 0x3
    }

    pub fn iosqes(self) -> u32 {
        (self.0 >> 16) & 0xf
    }

    pub fn iocqes(self) -> u32 {
        (self.0 >> 20) & 0xf
    }
}

/// Capabilities register builder/decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(pub u64);

impl Capabilities {
    const CSS_NVM: u64 = 1 << 0;
    const CSS_CSI_SUPP: u64 = 1 << 6;
    const CSS_ADMIN_ONLY: u64 = 1 << 7;

    pub fn new(mqes: u16, cmb: bool, pmr: bool) -> Self {
        let mut cap = mqes as u64;
        cap |= 1 << 16; // CQR: queues must be physically contiguous
        cap |= 0xf << 24; // TO: 7.5s
        cap |= (Self::CSS_NVM | Self::CSS_CSI_SUPP | Self::CSS_ADMIN_ONLY) << 37;
        cap |= 4u64 << 52; // MPSMAX: 64KiB pages
        if cmb {
            cap |= 1 << 57;
        }
        if pmr {
            cap |= 1 << 56;
        }
        Capabilities(cap)
    }

    /// Maximum queue entries, 0-based.
    pub fn mqes(self) -> u16 {
        (self.0 & 0xffff) as u16
    }

    pub fn dstrd(self) -> u32 {
        ((self.0 >> 32) & 0xf) as u32
    }

    pub fn mpsmin(self) -> u32 {
        ((self.0 >> 48) & 0xf) as u32
    }

    pub fn mpsmax(self) -> u32 {
        ((self.0 >> 52) & 0xf) as u32
    }

    pub fn supports_css(self, css: u8) -> bool {
        let bit = match css {
            css::NVM => Self::CSS_NVM,
            css::ALL_SUPPORTED => Self::CSS_CSI_SUPP,
            css::ADMIN_ONLY => Self::CSS_ADMIN_ONLY,
            _ => return false,
        };
        (self.0 >> 37) & bit != 0
    }
}

/// Decoded doorbell offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Doorbell {
    SqTail(u16),
    CqHead(u16),
}

impl Doorbell {
    pub fn decode(offset: u64, dstrd: u32) -> Option<Doorbell> {
        if offset < NVME_DOORBELL_BASE {
            return None;
        }
        let stride = 4u64 << dstrd;
        let rel = offset - NVME_DOORBELL_BASE;
        if rel % stride != 0 {
            return None;
        }
        let idx = rel / stride;
        let qid = u16::try_from(idx / 2).ok()?;
        Some(if idx % 2 == 1 {
            Doorbell::CqHead(qid)
        } else {
            Doorbell::SqTail(qid)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbell_decode_stride() {
        assert_eq!(Doorbell::decode(0x1000, 0), Some(Doorbell::SqTail(0)));
        assert_eq!(Doorbell::decode(0x1004, 0), Some(Doorbell::CqHead(0)));
        assert_eq!(Doorbell::decode(0x1008, 0), Some(Doorbell::SqTail(1)));
        assert_eq!(Doorbell::decode(0x1010, 1), Some(Doorbell::SqTail(1)));
        assert_eq!(Doorbell::decode(0x1002, 0), None);
        assert_eq!(Doorbell::decode(0xfff, 0), None);
    }

    #[test]
    fn cap_fields() {
        let cap = Capabilities::new(0x7ff, false, false);
        assert_eq!(cap.mqes(), 0x7ff);
        assert_eq!(cap.mpsmin(), 0);
        assert_eq!(cap.mpsmax(), 4);
        assert!(cap.supports_css(css::NVM));
        assert!(cap.supports_css(css::ALL_SUPPORTED));
        assert!(!cap.supports_css(3));
    }

    #[test]
    fn local_memory_registers() {
        assert_eq!(cmbsz(0), 0);
        assert_eq!(cmbsz(1 << 20), 0x1f | 256 << 12);
        assert_eq!(pmrcap(true) >> 5 & 0x7, PMR_BAR);
    }

    #[test]
    fn cc_fields() {
        let cc = ControllerConfig(CC_EN | (6 << 4) | (1 << 7) | (6 << 16) | (4 << 20));
        assert!(cc.enabled());
        assert_eq!(cc.css(), 6);
        assert_eq!(cc.mps(), 1);
        assert_eq!(cc.iosqes(), 6);
        assert_eq!(cc.iocqes(), 4);
        assert_eq!(cc.shn(), 0);
    }
}
