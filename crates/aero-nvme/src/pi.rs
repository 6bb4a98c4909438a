//! End-to-end data protection.
//!
//! The controller treats protection information as a pluggable check/generate function over
//! (data, metadata) pairs. [`T10Dif`] provides the 16-bit guard format.

use crate::NvmeStatus;

pub const PI_TUPLE_SIZE: usize = 8;

/// PRINFO bits of the read/write control word.
pub mod prinfo {
    pub const PRCHK_REF: u8 = 1 << 0;
    pub const PRCHK_APP: u8 = 1 << 1;
    pub const PRCHK_GUARD: u8 = 1 << 2;
    pub const PRACT: u8 = 1 << 3;
}

/// Everything a protection function needs to know about one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PiContext {
    pub pi_type: u8,
    pub pi_first: bool,
    pub lba_size: usize,
    pub meta_size: usize,
    pub slba: u64,
    pub prinfo: u8,
    pub reftag: u32,
    pub apptag: u16,
    pub appmask: u16,
}

impl PiContext {
    pub fn pract(&self) -> bool {
        self.prinfo & prinfo::PRACT != 0
    }

    /// Any of the guard, application tag or reference tag checks is requested.
    pub fn checks(&self) -> bool {
        self.prinfo & (prinfo::PRCHK_GUARD | prinfo::PRCHK_APP | prinfo::PRCHK_REF) != 0
    }

    /// Metadata holds nothing but the tuple, so PRACT strips/inserts it entirely.
    pub fn tuple_only(&self) -> bool {
        self.meta_size == PI_TUPLE_SIZE
    }

    fn tuple_offset(&self) -> usize {
        if self.pi_first {
            0
        } else {
            self.meta_size - PI_TUPLE_SIZE
        }
    }
}

pub trait ProtectionInfo: Send {
    /// Validates the tuples in `meta` against `data`.
    fn check(&self, ctx: &PiContext, data: &[u8], meta: &[u8]) -> Result<(), NvmeStatus>;

    /// Fills the tuples in `meta` for `data`.
    fn generate(&self, ctx: &PiContext, data: &[u8], meta: &mut [u8]);
}

/// T10 DIF with a CRC-16 guard (polynomial 0x8bb7).
#[derive(Debug, Clone, Copy, Default)]
pub struct T10Dif;

pub fn crc16_t10dif(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x8bb7
            } else {
                crc << 1
            };
        }
    }
    crc
}

impl ProtectionInfo for T10Dif {
    fn check(&self, ctx: &PiContext, data: &[u8], meta: &[u8]) -> Result<(), NvmeStatus> {
        if ctx.meta_size < PI_TUPLE_SIZE || ctx.lba_size == 0 {
            return Ok(());
        }
        let mut reftag = ctx.reftag;
        for (block, md) in data
            .chunks_exact(ctx.lba_size)
            .zip(meta.chunks_exact(ctx.meta_size))
        {
            let off = ctx.tuple_offset();
            let tuple = &md[off..off + PI_TUPLE_SIZE];
            let guard = u16::from_be_bytes([tuple[0], tuple[1]]);
            let apptag = u16::from_be_bytes([tuple[2], tuple[3]]);
            let stored_ref = u32::from_be_bytes([tuple[4], tuple[5], tuple[6], tuple[7]]);

            // Escape values disable checking for the block.
            let escaped = apptag == 0xffff && (ctx.pi_type != 3 || stored_ref == 0xffff_ffff);
            if !escaped {
                if ctx.prinfo & prinfo::PRCHK_GUARD != 0 {
                    let covered = if ctx.pi_first {
                        block.to_vec()
                    } else {
                        let mut v = block.to_vec();
                        v.extend_from_slice(&md[..off]);
                        v
                    };
                    if crc16_t10dif(&covered) != guard {
                        return Err(NvmeStatus::GUARD_CHECK_ERROR);
                    }
                }
                if ctx.prinfo & prinfo::PRCHK_APP != 0
                    && (apptag & ctx.appmask) != (ctx.apptag & ctx.appmask)
                {
                    return Err(NvmeStatus::APPTAG_CHECK_ERROR);
                }
                if ctx.prinfo & prinfo::PRCHK_REF != 0 && ctx.pi_type != 3 && stored_ref != reftag
                {
                    return Err(NvmeStatus::REFTAG_CHECK_ERROR);
                }
            }
            if ctx.pi_type == 1 || ctx.pi_type == 2 {
                reftag = reftag.wrapping_add(1);
            }
        }
        Ok(())
    }

    fn generate(&self, ctx: &PiContext, data: &[u8], meta: &mut [u8]) {
        if ctx.meta_size < PI_TUPLE_SIZE || ctx.lba_size == 0 {
            return;
        }
        let mut reftag = ctx.reftag;
        let off = ctx.tuple_offset();
        for (block, md) in data
            .chunks_exact(ctx.lba_size)
            .zip(meta.chunks_exact_mut(ctx.meta_size))
        {
            let guard = if ctx.pi_first {
                crc16_t10dif(block)
            } else {
                let mut v = block.to_vec();
                v.extend_from_slice(&md[..off]);
                crc16_t10dif(&v)
            };
            md[off..off + 2].copy_from_slice(&guard.to_be_bytes());
            md[off + 2..off + 4].copy_from_slice(&ctx.apptag.to_be_bytes());
            md[off + 4..off + 8].copy_from_slice(&reftag.to_be_bytes());
            if ctx.pi_type == 1 || ctx.pi_type == 2 {
                reftag = reftag.wrapping_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(prinfo: u8) -> PiContext {
        PiContext {
            pi_type: 1,
            pi_first: false,
            lba_size: 512,
            meta_size: 8,
            slba: 0,
            prinfo,
            reftag: 10,
            apptag: 0x1234,
            appmask: 0xffff,
        }
    }

    #[test]
    fn crc_known_vector() {
        assert_eq!(crc16_t10dif(b"123456789"), 0xd0db);
    }

    #[test]
    fn generate_then_check() {
        let data: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        let mut meta = vec![0u8; 16];
        let all = prinfo::PRCHK_GUARD | prinfo::PRCHK_APP | prinfo::PRCHK_REF;
        T10Dif.generate(&ctx(all), &data, &mut meta);
        T10Dif.check(&ctx(all), &data, &meta).unwrap();

        let mut corrupt = data.clone();
        corrupt[600] ^= 1;
        assert_eq!(
            T10Dif.check(&ctx(all), &corrupt, &meta),
            Err(NvmeStatus::GUARD_CHECK_ERROR)
        );

        let mut wrong_ref = ctx(prinfo::PRCHK_REF);
        wrong_ref.reftag = 11;
        assert_eq!(
            T10Dif.check(&wrong_ref, &data, &meta),
            Err(NvmeStatus::REFTAG_CHECK_ERROR)
        );
        // Unchecked fields are ignored.
        T10Dif.check(&ctx(0), &corrupt, &meta).unwrap();
    }

    #[test]
    fn escape_apptag_skips_checks() {
        let data = vec![0u8; 512];
        let mut meta = vec![0u8; 8];
        meta[2] = 0xff;
        meta[3] = 0xff;
        T10Dif
            .check(&ctx(prinfo::PRCHK_GUARD | prinfo::PRCHK_REF), &data, &meta)
            .unwrap();
    }
}
