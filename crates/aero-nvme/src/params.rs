//! Controller and namespace configuration.
//!
//! Both structures deserialize with `#[serde(default)]`, so a configuration file only needs to
//! name the fields it overrides.

use serde::{Deserialize, Serialize};

use crate::NvmeError;

/// Largest number of I/O queue pairs a controller may be configured with.
pub const MAX_IOQPAIRS: u16 = 256;
/// Largest MSI-X table the controller models.
pub const MAX_MSIX_QSIZE: u16 = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NvmeParams {
    pub serial: String,
    pub model: String,
    pub firmware: String,
    /// Number of I/O queue pairs (the admin pair is extra).
    pub max_ioqpairs: u16,
    /// Interrupt vectors available to completion queues.
    pub msix_qsize: u16,
    /// Maximum queue entries, 0-based (CAP.MQES).
    pub mqes: u16,
    /// Async event request limit, 0-based.
    pub aerl: u8,
    pub aer_max_queued: u32,
    /// Maximum data transfer size as a power of two in pages; 0 is unlimited.
    pub mdts: u8,
    /// Zone append size limit as a power of two in pages; 0 defers to MDTS.
    pub zasl: u8,
    /// Verify size limit as a power of two in pages.
    pub vsl: u8,
    /// Dataset management range size limit in logical blocks.
    pub dmrsl: u32,
    /// Controller memory buffer size in bytes; 0 disables it.
    pub cmb_size: u64,
    /// Persistent memory region size in bytes; 0 disables it.
    pub pmr_size: u64,
    /// Advertise SGL excess length support (longer descriptors are truncated, not rejected).
    pub sgl_excess_length: bool,
    /// Close the oldest implicitly opened zone when the open limit is reached.
    pub auto_transition_zones: bool,
}

impl Default for NvmeParams {
    fn default() -> Self {
        NvmeParams {
            serial: "AERO0000000000000001".to_string(),
            model: "Aero NVMe Controller".to_string(),
            firmware: "1.0".to_string(),
            max_ioqpairs: 64,
            msix_qsize: 65,
            mqes: 0x7ff,
            aerl: 3,
            aer_max_queued: 64,
            mdts: 7,
            zasl: 0,
            vsl: 7,
            dmrsl: 0x0040_0000,
            cmb_size: 0,
            pmr_size: 0,
            sgl_excess_length: false,
            auto_transition_zones: true,
        }
    }
}

impl NvmeParams {
    pub fn validate(&self) -> Result<(), NvmeError> {
        if self.serial.is_empty() {
            return Err(NvmeError::param("serial", "must not be empty"));
        }
        if self.serial.len() > 20 {
            return Err(NvmeError::param("serial", "at most 20 characters"));
        }
        if self.max_ioqpairs == 0 || self.max_ioqpairs > MAX_IOQPAIRS {
            return Err(NvmeError::param(
                "max_ioqpairs",
                format!("must be in 1..={MAX_IOQPAIRS}"),
            ));
        }
        if self.msix_qsize == 0 || self.msix_qsize > MAX_MSIX_QSIZE {
            return Err(NvmeError::param(
                "msix_qsize",
                format!("must be in 1..={MAX_MSIX_QSIZE}"),
            ));
        }
        if self.mqes == 0 {
            return Err(NvmeError::param("mqes", "must be at least 1"));
        }
        if self.mdts != 0 && self.zasl > self.mdts {
            return Err(NvmeError::param("zasl", "must not exceed mdts"));
        }
        if self.vsl == 0 {
            return Err(NvmeError::param("vsl", "must not be zero"));
        }
        if self.pmr_size != 0 && !self.pmr_size.is_power_of_two() {
            return Err(NvmeError::param("pmr_size", "must be a power of two"));
        }
        if self.dmrsl == 0 {
            return Err(NvmeError::param("dmrsl", "must not be zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceParams {
    pub nsid: u32,
    pub lba_size: u32,
    pub metadata_size: u16,
    /// Metadata is transferred interleaved with each logical block.
    pub extended_lba: bool,
    /// End-to-end protection type (0 disables protection information).
    pub pi_type: u8,
    /// Protection information occupies the first bytes of the metadata.
    pub pi_first: bool,
    pub shared: bool,
    /// Start out allocated but not attached.
    pub detached: bool,
    /// Copy: maximum source range count, 0-based.
    pub msrc: u8,
    /// Copy: maximum single source range length in blocks.
    pub mssrl: u16,
    /// Copy: maximum total copy length in blocks.
    pub mcl: u32,
    pub uuid: [u8; 16],
    pub zoned: Option<ZonedParams>,
}

impl Default for NamespaceParams {
    fn default() -> Self {
        NamespaceParams {
            nsid: 1,
            lba_size: 512,
            metadata_size: 0,
            extended_lba: false,
            pi_type: 0,
            pi_first: false,
            shared: true,
            detached: false,
            msrc: 127,
            mssrl: 128,
            mcl: 128,
            uuid: [0; 16],
            zoned: None,
        }
    }
}

/// Zoned namespace geometry. Sizes are in logical blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZonedParams {
    pub zone_size: u64,
    /// 0 means equal to `zone_size`.
    pub zone_capacity: u64,
    /// 0 means unlimited.
    pub max_active: u32,
    /// 0 means unlimited.
    pub max_open: u32,
    /// Zone descriptor extension size in bytes (multiple of 64).
    pub zd_ext_size: u32,
    pub cross_zone_read: bool,
    /// Number of zone random write area resources; 0 disables ZRWA.
    pub numzrwa: u32,
    pub zrwa_size: u64,
    pub zrwa_flush_granularity: u64,
}

impl Default for ZonedParams {
    fn default() -> Self {
        ZonedParams {
            zone_size: 4096,
            zone_capacity: 0,
            max_active: 0,
            max_open: 0,
            zd_ext_size: 0,
            cross_zone_read: false,
            numzrwa: 0,
            zrwa_size: 0,
            zrwa_flush_granularity: 0,
        }
    }
}

impl ZonedParams {
    pub fn capacity(&self) -> u64 {
        if self.zone_capacity == 0 {
            self.zone_size
        } else {
            self.zone_capacity
        }
    }

    pub fn validate(&self) -> Result<(), NvmeError> {
        if self.zone_size == 0 {
            return Err(NvmeError::param("zone_size", "must not be zero"));
        }
        if self.capacity() > self.zone_size {
            return Err(NvmeError::param(
                "zone_capacity",
                "must not exceed the zone size",
            ));
        }
        if self.zd_ext_size % 64 != 0 {
            return Err(NvmeError::param("zd_ext_size", "must be a multiple of 64"));
        }
        if self.max_active != 0 && self.max_open > self.max_active {
            return Err(NvmeError::param(
                "max_open",
                "must not exceed max_active",
            ));
        }
        if self.numzrwa != 0 {
            if self.zrwa_size == 0 || self.zrwa_flush_granularity == 0 {
                return Err(NvmeError::param(
                    "zrwa_size",
                    "ZRWA size and flush granularity are required when numzrwa is set",
                ));
            }
            if self.zrwa_size % self.zrwa_flush_granularity != 0 {
                return Err(NvmeError::param(
                    "zrwa_flush_granularity",
                    "must divide the ZRWA size",
                ));
            }
            if self.max_active != 0 && self.numzrwa > self.max_active {
                return Err(NvmeError::param("numzrwa", "must not exceed max_active"));
            }
        }
        Ok(())
    }
}
