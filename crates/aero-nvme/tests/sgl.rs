#![cfg(not(target_arch = "wasm32"))]

mod common;

use aero_nvme::memory::{Dma, LocalMemory};
use aero_nvme::sg::{map_prp, map_sgl, Direction, SgError, SgOptions, SglDescriptor};
use aero_nvme::MemoryBus;
use proptest::prelude::*;

use common::TestMem;

const PAGE: usize = 4096;
const DATA: u64 = 0x10_0000;
const LIST: u64 = 0x20_0000;
const SEGMENT: u64 = 0x30_0000;

fn opts(excess_length: bool) -> SgOptions {
    SgOptions {
        page_size: PAGE,
        excess_length,
        direction: Direction::FromDevice,
    }
}

/// PRP pointers for a buffer of `len` bytes starting `offset` bytes into the page at `DATA`.
fn prp_pointers(mem: &mut TestMem, offset: usize, len: usize) -> (u64, u64) {
    let prp1 = DATA + offset as u64;
    let first = len.min(PAGE - offset);
    let remaining = len - first;
    let next = DATA + PAGE as u64;
    if remaining == 0 {
        return (prp1, 0);
    }
    if remaining <= PAGE {
        return (prp1, next);
    }
    for i in 0..remaining.div_ceil(PAGE) {
        mem.write_u64(LIST + i as u64 * 8, next + (i * PAGE) as u64)
            .unwrap();
    }
    (prp1, LIST)
}

/// Writes a last-segment list of data blocks of the given lengths, each on its own page.
fn sgl_segment(mem: &mut TestMem, lens: &[u32]) -> SglDescriptor {
    for (i, &len) in lens.iter().enumerate() {
        let d = SglDescriptor::data_block(DATA + (i * PAGE) as u64, len);
        mem.fill(SEGMENT + (i * 16) as u64, &d.to_bytes());
    }
    SglDescriptor::last_segment(SEGMENT, (lens.len() * 16) as u32)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prp_mapping_covers_exactly_the_transfer(
        offset in (0usize..PAGE / 4).prop_map(|dw| dw * 4),
        len in 1usize..=64 * 1024,
    ) {
        let mut mem = TestMem::new(4 * 1024 * 1024);
        let (prp1, prp2) = prp_pointers(&mut mem, offset, len);
        let mut local = LocalMemory::default();
        let dma = Dma::new(&mut mem, &mut local);

        let sg = map_prp(&dma, PAGE, prp1, prp2, len).unwrap();
        prop_assert_eq!(sg.total_len(), len);
        // The pages are contiguous, so the ranges coalesce.
        prop_assert_eq!(sg.entries().len(), 1);
        prop_assert_eq!(sg.entries()[0].addr, prp1);
    }

    #[test]
    fn sgl_mapping_length_must_match(
        lens in prop::collection::vec(1u32..=2048, 1..8),
    ) {
        let total: usize = lens.iter().map(|&l| l as usize).sum();
        let mut mem = TestMem::new(4 * 1024 * 1024);
        let sgl = sgl_segment(&mut mem, &lens);
        let mut local = LocalMemory::default();
        let dma = Dma::new(&mut mem, &mut local);

        let sg = map_sgl(&dma, sgl, total, opts(false)).unwrap();
        prop_assert_eq!(sg.total_len(), total);
        prop_assert_eq!(sg.entries().len(), lens.len());

        prop_assert_eq!(
            map_sgl(&dma, sgl, total + 1, opts(false)).unwrap_err(),
            SgError::TooShort { remaining: 1 }
        );
        prop_assert_eq!(
            map_sgl(&dma, sgl, total - 1, opts(false)).unwrap_err(),
            SgError::TooLong { excess: 1 }
        );

        // Advertised excess length truncates instead.
        let sg = map_sgl(&dma, sgl, total - 1, opts(true)).unwrap();
        prop_assert_eq!(sg.total_len(), total - 1);
    }

    #[test]
    fn scatter_then_gather_preserves_data(
        offset in (0usize..PAGE / 4).prop_map(|dw| dw * 4),
        data in prop::collection::vec(any::<u8>(), 1..=3 * PAGE),
    ) {
        let mut mem = TestMem::new(4 * 1024 * 1024);
        let (prp1, prp2) = prp_pointers(&mut mem, offset, data.len());
        let mut local = LocalMemory::default();
        let mut dma = Dma::new(&mut mem, &mut local);

        let sg = map_prp(&dma, PAGE, prp1, prp2, data.len()).unwrap();
        sg.scatter(&mut dma, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        sg.gather(&dma, &mut back).unwrap();
        prop_assert_eq!(back, data);
    }
}

#[test]
fn sgl_length_errors_map_to_length_statuses() {
    use aero_nvme::NvmeStatus;

    let short = SgError::TooShort { remaining: 8 };
    let long = SgError::TooLong { excess: 8 };
    assert_eq!(short.status(), NvmeStatus::DATA_SGL_LEN_INVALID);
    assert_eq!(long.status(), NvmeStatus::DATA_SGL_LEN_INVALID);
    assert_eq!(short.metadata_status(), NvmeStatus::MD_SGL_LEN_INVALID);
}
