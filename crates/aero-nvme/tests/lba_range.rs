#![cfg(not(target_arch = "wasm32"))]

mod common;

use aero_nvme::command::IoOpcode;
use aero_nvme::{MemBackend, NvmeStatus};
use proptest::prelude::*;

use common::*;

const NSZE: u64 = 1024;

fn harness(disk: &MemBackend) -> Harness {
    let mut h = Harness::with_disk(disk);
    h.enable();
    h.create_io_queues();
    h
}

fn copy_from(slba: u64, nlb: u32, sdlba: u64, h: &mut Harness) -> aero_nvme::NvmeCommand {
    let mut range = [0u8; 32];
    range[8..16].copy_from_slice(&slba.to_le_bytes());
    range[16..18].copy_from_slice(&((nlb - 1) as u16).to_le_bytes());
    h.mem.fill(BUF, &range);

    let mut cmd = command(IoOpcode::Copy.raw());
    cmd.nsid = 1;
    cmd.prp1 = BUF;
    cmd.cdw10 = sdlba as u32;
    cmd.cdw11 = (sdlba >> 32) as u32;
    cmd
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 128,
        .. ProptestConfig::default()
    })]

    #[test]
    fn addresses_past_the_namespace_fail_with_lba_range(
        slba in prop_oneof![NSZE..=u64::MAX, (u64::MAX - 64)..=u64::MAX],
        nlb in 1u32..=64,
    ) {
        let disk = MemBackend::new(NSZE * 512);
        let mut h = harness(&disk);

        for op in [IoOpcode::Read, IoOpcode::Write, IoOpcode::Compare, IoOpcode::Verify] {
            let cqe = h.io_cmd(io(op, 1, slba, nlb, BUF));
            prop_assert_eq!(cqe.nvme_status(), NvmeStatus::LBA_RANGE, "{:?}", op);
        }

        let cmd = copy_from(slba, nlb, 0, &mut h);
        let cqe = h.io_cmd(cmd);
        prop_assert_eq!(cqe.nvme_status(), NvmeStatus::LBA_RANGE);
        prop_assert_eq!(cqe.dw0, 0);

        let cmd = copy_from(0, nlb, slba, &mut h);
        prop_assert_eq!(h.io_cmd(cmd).nvme_status(), NvmeStatus::LBA_RANGE);

        prop_assert_eq!(h.csts() & CSTS_CFS, 0);
        prop_assert_eq!(disk.submitted(), 0);
    }
}

#[test]
fn last_block_is_addressable() {
    let disk = MemBackend::new(NSZE * 512);
    let mut h = harness(&disk);

    h.mem.fill(BUF, &[0x5a; 512]);
    assert_status(
        &h.io_cmd(io(IoOpcode::Write, 1, NSZE - 1, 1, BUF)),
        NvmeStatus::SUCCESS,
    );
    assert_eq!(disk.read_at((NSZE - 1) * 512, 512), vec![0x5a; 512]);
    assert_status(
        &h.io_cmd(io(IoOpcode::Read, 1, NSZE - 1, 2, BUF)),
        NvmeStatus::LBA_RANGE,
    );
    assert_status(
        &h.io_cmd(io(IoOpcode::Read, 1, u64::MAX, 1, BUF)),
        NvmeStatus::LBA_RANGE,
    );
}
