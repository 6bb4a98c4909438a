mod common;

use aero_nvme::command::AdminOpcode;
use aero_nvme::{MemBackend, MemoryBus, NvmeController, NvmeParams, NvmeStatus};

use common::*;

fn make_controller() -> NvmeController {
    NvmeController::new(NvmeParams::default()).unwrap()
}

fn program_minimal_admin_queues(ctrl: &mut NvmeController, mem: &mut TestMem) {
    // Valid admin queues so CC.EN attempts reach the later checks.
    ctrl.mmio_write(NVME_REG_AQA, 4, 0x000f_000f, mem);
    ctrl.mmio_write(NVME_REG_ASQ, 8, ASQ, mem);
    ctrl.mmio_write(NVME_REG_ACQ, 8, ACQ, mem);
}

#[test]
fn enable_rejects_unsupported_page_size() {
    let mut ctrl = make_controller();
    let mut mem = TestMem::new(MEM_SIZE);
    program_minimal_admin_queues(&mut ctrl, &mut mem);

    // MPS=15 => 128 MiB pages; only 4 KiB pages are advertised.
    let cc = CC_EN | CC_ENTRY_SIZES | (15u32 << 7);
    ctrl.mmio_write(NVME_REG_CC, 4, u64::from(cc), &mut mem);

    let csts = ctrl.mmio_read(NVME_REG_CSTS, 4) as u32;
    assert_eq!(csts & CSTS_RDY, 0);
    assert_ne!(csts & CSTS_CFS, 0);
}

#[test]
fn enable_rejects_unsupported_entry_sizes() {
    let mut ctrl = make_controller();
    let mut mem = TestMem::new(MEM_SIZE);
    program_minimal_admin_queues(&mut ctrl, &mut mem);

    ctrl.mmio_write(NVME_REG_CC, 4, u64::from(CC_EN), &mut mem);
    let csts = ctrl.mmio_read(NVME_REG_CSTS, 4) as u32;
    assert_eq!(csts & CSTS_RDY, 0);
    assert_ne!(csts & CSTS_CFS, 0);

    // Clearing EN recovers.
    ctrl.mmio_write(NVME_REG_CC, 4, 0, &mut mem);
    assert_eq!(ctrl.mmio_read(NVME_REG_CSTS, 4), 0);
    ctrl.mmio_write(NVME_REG_CC, 4, u64::from(CC_EN | CC_ENTRY_SIZES), &mut mem);
    assert_eq!(ctrl.mmio_read(NVME_REG_CSTS, 4) as u32 & CSTS_RDY, CSTS_RDY);
}

#[test]
fn enable_with_large_aqa_does_not_panic() {
    let mut ctrl = make_controller();
    let mut mem = TestMem::new(MEM_SIZE);
    program_minimal_admin_queues(&mut ctrl, &mut mem);

    ctrl.mmio_write(NVME_REG_AQA, 4, 0xffff_ffff, &mut mem);
    ctrl.mmio_write(NVME_REG_CC, 4, u64::from(CC_EN | CC_ENTRY_SIZES), &mut mem);

    // 12-bit sizes: 4096 entries each.
    assert_eq!(ctrl.mmio_read(NVME_REG_CSTS, 4) as u32 & CSTS_RDY, CSTS_RDY);
    assert_eq!(ctrl.submission_queue(0).unwrap().size, 4096);
    assert_eq!(ctrl.completion_queue(0).unwrap().size, 4096);
}

#[test]
fn enable_rejects_misaligned_admin_queue() {
    let mut ctrl = make_controller();
    let mut mem = TestMem::new(MEM_SIZE);
    program_minimal_admin_queues(&mut ctrl, &mut mem);
    ctrl.mmio_write(NVME_REG_ASQ, 8, ASQ + 0x40, &mut mem);

    ctrl.mmio_write(NVME_REG_CC, 4, u64::from(CC_EN | CC_ENTRY_SIZES), &mut mem);
    let csts = ctrl.mmio_read(NVME_REG_CSTS, 4) as u32;
    assert_eq!(csts & CSTS_RDY, 0);
    assert_ne!(csts & CSTS_CFS, 0);
}

#[test]
fn admin_queue_registers_are_frozen_while_enabled() {
    let disk = MemBackend::new(64 * 512);
    let mut h = Harness::with_disk(&disk);
    h.enable();
    h.mmio_write(NVME_REG_ASQ, 8, 0x7000);
    assert_eq!(h.ctrl.mmio_read(NVME_REG_ASQ, 8), ASQ);
}

#[test]
fn odd_register_accesses_are_harmless() {
    let mut ctrl = make_controller();
    let mut mem = TestMem::new(MEM_SIZE);

    for offset in [0x01, 0x13, 0x40, 0x0fff, 0x1001, 0x1003, 0x3fff] {
        for size in [1, 2, 4, 8] {
            let _ = ctrl.mmio_read(offset, size);
            ctrl.mmio_write(offset, size, u64::MAX, &mut mem);
        }
    }
    // Doorbells are ignored until the controller is ready.
    ctrl.mmio_write(0x1000, 4, 3, &mut mem);
    assert_eq!(ctrl.mmio_read(NVME_REG_CSTS, 4), 0);
    assert_eq!(ctrl.mmio_read(NVME_REG_CAP, 8) & 0xffff, 0x7ff);
}

#[test]
fn out_of_range_doorbell_value_is_reported_not_applied() {
    let disk = MemBackend::new(64 * 512);
    let mut h = Harness::with_disk(&disk);
    h.enable();

    h.submit_admin(admin(AdminOpcode::AsyncEventRequest));
    // Admin SQ has 16 entries.
    h.mmio_write(0x1000, 4, 16);
    let cqe = h.admin_completion().unwrap();
    assert_eq!((cqe.dw0 >> 8) & 0xff, aero_nvme::aer::error_info::INVALID_DB_VALUE as u32);
    assert_eq!(h.ctrl.submission_queue(0).unwrap().tail, 1);
    assert_eq!(h.csts() & CSTS_CFS, 0);
}

#[test]
fn shutdown_notification_completes() {
    let disk = MemBackend::new(64 * 512);
    let mut h = Harness::with_disk(&disk);
    h.enable();

    let cc = h.ctrl.mmio_read(NVME_REG_CC, 4);
    h.mmio_write(NVME_REG_CC, 4, cc | 1 << 14);
    assert_eq!(h.csts() & (0x3 << 2), 0x2 << 2);
    assert_eq!(disk.flush_count(), 1);
}

#[test]
fn completion_write_failure_is_fatal() {
    let disk = MemBackend::new(64 * 512);
    let mut h = Harness::with_disk(&disk);
    h.enable();

    // I/O completion queue outside guest memory.
    let mut cq = admin(AdminOpcode::CreateCq);
    cq.prp1 = 0x1000_0000;
    cq.cdw10 = (15 << 16) | 1;
    cq.cdw11 = 0x1;
    assert_status(&h.admin_cmd(cq), NvmeStatus::SUCCESS);
    let mut sq = admin(AdminOpcode::CreateSq);
    sq.prp1 = IO_SQ;
    sq.cdw10 = (15 << 16) | 1;
    sq.cdw11 = (1 << 16) | 0x1;
    assert_status(&h.admin_cmd(sq), NvmeStatus::SUCCESS);

    let flush = {
        let mut cmd = command(0x00);
        cmd.nsid = 1;
        cmd.cid = 0x55;
        cmd
    };
    h.mem.write_physical(IO_SQ, &flush.to_bytes()).unwrap();
    h.mmio_write(0x1008, 4, 1);
    assert_ne!(h.csts() & CSTS_CFS, 0);
}
