//! Completion status codes.
//!
//! A status is carried as `(sct, sc, dnr)` and only packed into the 15-bit wire field when a
//! completion entry is written.

use std::fmt;

/// Status Code Type values.
pub mod sct {
    pub const GENERIC: u8 = 0x0;
    pub const COMMAND_SPECIFIC: u8 = 0x1;
    pub const MEDIA: u8 = 0x2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NvmeStatus {
    pub sct: u8,
    pub sc: u8,
    pub dnr: bool,
}

const fn generic(sc: u8) -> NvmeStatus {
    NvmeStatus {
        sct: sct::GENERIC,
        sc,
        dnr: true,
    }
}

const fn specific(sc: u8) -> NvmeStatus {
    NvmeStatus {
        sct: sct::COMMAND_SPECIFIC,
        sc,
        dnr: true,
    }
}

const fn media(sc: u8) -> NvmeStatus {
    NvmeStatus {
        sct: sct::MEDIA,
        sc,
        dnr: false,
    }
}

impl NvmeStatus {
    pub const SUCCESS: NvmeStatus = NvmeStatus {
        sct: 0,
        sc: 0,
        dnr: false,
    };

    pub const INVALID_OPCODE: NvmeStatus = generic(0x01);
    pub const INVALID_FIELD: NvmeStatus = generic(0x02);
    pub const CMD_ID_CONFLICT: NvmeStatus = generic(0x03);
    pub const DATA_TRANSFER_ERROR: NvmeStatus = generic(0x04).retryable();
    pub const INTERNAL_DEVICE_ERROR: NvmeStatus = generic(0x06);
    pub const ABORT_REQUESTED: NvmeStatus = generic(0x07).retryable();
    pub const ABORT_SQ_DELETED: NvmeStatus = generic(0x08).retryable();
    pub const INVALID_NSID: NvmeStatus = generic(0x0b);
    pub const CMD_SEQ_ERROR: NvmeStatus = generic(0x0c);
    pub const INVALID_SGL_SEG_DESCR: NvmeStatus = generic(0x0d);
    pub const INVALID_NUM_SGL_DESCRS: NvmeStatus = generic(0x0e);
    pub const DATA_SGL_LEN_INVALID: NvmeStatus = generic(0x0f);
    pub const MD_SGL_LEN_INVALID: NvmeStatus = generic(0x10);
    pub const SGL_DESCR_TYPE_INVALID: NvmeStatus = generic(0x11);
    pub const INVALID_USE_OF_CMB: NvmeStatus = generic(0x12);
    pub const INVALID_PRP_OFFSET: NvmeStatus = generic(0x13);
    pub const NO_ZRWA_RESOURCES: NvmeStatus = generic(0x15).retryable();
    pub const LBA_RANGE: NvmeStatus = generic(0x80);

    pub const INVALID_CQID: NvmeStatus = specific(0x00);
    pub const INVALID_QID: NvmeStatus = specific(0x01);
    pub const MAX_QSIZE_EXCEEDED: NvmeStatus = specific(0x02);
    pub const AER_LIMIT_EXCEEDED: NvmeStatus = specific(0x05);
    pub const INVALID_IRQ_VECTOR: NvmeStatus = specific(0x08);
    pub const INVALID_FORMAT: NvmeStatus = specific(0x0a);
    pub const INVALID_QUEUE_DELETION: NvmeStatus = specific(0x0c);
    pub const FID_NOT_SAVEABLE: NvmeStatus = specific(0x0d);
    pub const FEAT_NOT_CHANGEABLE: NvmeStatus = specific(0x0e);
    pub const FEAT_NOT_NS_SPECIFIC: NvmeStatus = specific(0x0f);
    pub const NS_ALREADY_ATTACHED: NvmeStatus = specific(0x18);
    pub const NS_PRIVATE: NvmeStatus = specific(0x19);
    pub const NS_NOT_ATTACHED: NvmeStatus = specific(0x1a);
    pub const NS_CTRL_LIST_INVALID: NvmeStatus = specific(0x1c);
    pub const CMD_SIZE_LIMIT: NvmeStatus = specific(0x83);
    pub const ZONE_BOUNDARY_ERROR: NvmeStatus = specific(0xb8);
    pub const ZONE_FULL: NvmeStatus = specific(0xb9);
    pub const ZONE_READ_ONLY: NvmeStatus = specific(0xba);
    pub const ZONE_OFFLINE: NvmeStatus = specific(0xbb);
    pub const ZONE_INVALID_WRITE: NvmeStatus = specific(0xbc);
    // Resource exhaustion: the host may retry once zones are released.
    pub const ZONE_TOO_MANY_ACTIVE: NvmeStatus = specific(0xbd).retryable();
    pub const ZONE_TOO_MANY_OPEN: NvmeStatus = specific(0xbe).retryable();
    pub const ZONE_INVALID_TRANSITION: NvmeStatus = specific(0xbf);

    pub const WRITE_FAULT: NvmeStatus = media(0x80);
    pub const UNRECOVERED_READ: NvmeStatus = media(0x81);
    pub const GUARD_CHECK_ERROR: NvmeStatus = media(0x82);
    pub const APPTAG_CHECK_ERROR: NvmeStatus = media(0x83);
    pub const REFTAG_CHECK_ERROR: NvmeStatus = media(0x84);
    pub const COMPARE_FAILURE: NvmeStatus = media(0x85);
    pub const DEALLOCATED_OR_UNWRITTEN: NvmeStatus = media(0x87).do_not_retry();

    pub const fn retryable(self) -> NvmeStatus {
        NvmeStatus { dnr: false, ..self }
    }

    pub const fn do_not_retry(self) -> NvmeStatus {
        NvmeStatus { dnr: true, ..self }
    }

    pub fn is_success(self) -> bool {
        self.sct == 0 && self.sc == 0
    }

    /// Compares type and code, ignoring DNR.
    pub fn same_code(self, other: NvmeStatus) -> bool {
        self.sct == other.sct && self.sc == other.sc
    }

    /// Status field (bits 15:1 of CQE dword 3 high half) without the phase tag.
    pub fn encode_without_phase(self) -> u16 {
        let mut val: u16 = 0;
        val |= (self.sc as u16) << 1;
        val |= ((self.sct & 0x7) as u16) << 9;
        if self.dnr {
            val |= 1 << 14;
        }
        val
    }

    /// Inverse of [`NvmeStatus::encode_without_phase`]; the phase bit is ignored.
    pub fn decode(field: u16) -> NvmeStatus {
        NvmeStatus {
            sc: ((field >> 1) & 0xff) as u8,
            sct: ((field >> 9) & 0x7) as u8,
            dnr: field & (1 << 14) != 0,
        }
    }
}

impl fmt::Display for NvmeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sct={:#x} sc={:#04x}", self.sct, self.sc)?;
        if self.dnr {
            write!(f, " dnr")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_places_fields() {
        let raw = NvmeStatus::ZONE_INVALID_WRITE.encode_without_phase();
        assert_eq!(raw, (0xbc << 1) | (1 << 9) | (1 << 14));
        assert_eq!(NvmeStatus::decode(raw | 1), NvmeStatus::ZONE_INVALID_WRITE);
    }

    #[test]
    fn success_encodes_to_zero() {
        assert_eq!(NvmeStatus::SUCCESS.encode_without_phase(), 0);
        assert!(NvmeStatus::SUCCESS.is_success());
        assert!(!NvmeStatus::WRITE_FAULT.is_success());
    }

    #[test]
    fn same_code_ignores_dnr() {
        assert!(NvmeStatus::INVALID_FIELD.same_code(NvmeStatus::INVALID_FIELD.retryable()));
        assert!(!NvmeStatus::INVALID_FIELD.same_code(NvmeStatus::INVALID_OPCODE));
    }
}
