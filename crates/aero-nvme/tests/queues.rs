#![cfg(not(target_arch = "wasm32"))]

mod common;

use std::collections::BTreeSet;

use aero_nvme::command::{AdminOpcode, IoOpcode};
use aero_nvme::{MemBackend, NvmeStatus};
use proptest::prelude::*;

use common::*;

const QUEUE_ENTRIES: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Step {
    submit: usize,
    consume: usize,
}

fn assert_ring_bounds(h: &Harness) {
    for id in 0..=1 {
        let sq = h.ctrl.submission_queue(id).unwrap();
        assert!(sq.head < sq.size && sq.tail < sq.size);
        let cq = h.ctrl.completion_queue(id).unwrap();
        assert!(cq.head < cq.size && cq.tail < cq.size);
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn every_command_completes_once_across_wraps(
        steps in prop::collection::vec(
            (1usize..=6, 0usize..=8).prop_map(|(submit, consume)| Step { submit, consume }),
            1..40,
        ),
    ) {
        let disk = MemBackend::new(64 * 512);
        let mut h = Harness::with_disk(&disk);
        h.enable();
        h.create_io_queues();

        let mut submitted = BTreeSet::new();
        let mut completed = BTreeSet::new();
        for step in steps {
            // The host never has more commands outstanding than the rings can hold.
            let room = QUEUE_ENTRIES - 1 - (submitted.len() - completed.len());
            for _ in 0..step.submit.min(room) {
                let slba = submitted.len() as u64 % 64;
                let cid = h.submit_io(io(IoOpcode::Read, 1, slba, 1, BUF));
                prop_assert!(submitted.insert(cid));
            }
            for _ in 0..step.consume {
                let Some(cqe) = h.io_completion() else { break };
                prop_assert!(cqe.nvme_status().is_success());
                prop_assert!(submitted.contains(&cqe.cid));
                prop_assert!(completed.insert(cqe.cid), "cid {} completed twice", cqe.cid);
            }
            assert_ring_bounds(&h);
        }

        while let Some(cqe) = h.io_completion() {
            prop_assert!(completed.insert(cqe.cid), "cid {} completed twice", cqe.cid);
        }
        prop_assert_eq!(submitted, completed);
        prop_assert!(h.ctrl.completion_queue(1).unwrap().is_empty());
    }
}

#[test]
fn full_completion_queue_defers_posting() {
    let disk = MemBackend::new(64 * 512);
    let mut h = Harness::with_disk(&disk);
    h.enable();
    h.create_io_queues();

    for _ in 0..QUEUE_ENTRIES - 1 {
        h.submit_io(io(IoOpcode::Read, 1, 0, 1, BUF));
    }
    let cq = h.ctrl.completion_queue(1).unwrap();
    assert!(cq.is_full());
    assert_eq!(cq.pending(), 0);

    // One more command completes but waits for room in the ring.
    let late = h.submit_io(io(IoOpcode::Read, 1, 0, 1, BUF));
    assert_eq!(h.ctrl.completion_queue(1).unwrap().pending(), 1);

    let mut consumed = Vec::new();
    while let Some(cqe) = h.io_completion() {
        consumed.push(cqe.cid);
    }
    assert_eq!(consumed.len(), QUEUE_ENTRIES);
    assert_eq!(consumed.last(), Some(&late));
}

#[test]
fn entries_stay_in_the_ring_while_every_request_slot_is_busy() {
    let disk = MemBackend::new(64 * 512);
    let mut h = Harness::with_disk(&disk);
    h.enable();
    h.create_io_queues();

    disk.set_hold_completions(true);
    let mut cids = BTreeSet::new();
    for i in 0..QUEUE_ENTRIES - 1 {
        cids.insert(h.submit_io(io(IoOpcode::Read, 1, i as u64, 1, BUF)));
    }
    // The ring wrapped, so the host can place one more entry than it has slots left.
    cids.insert(h.submit_io(io(IoOpcode::Read, 1, 15, 1, BUF)));
    let sq = h.ctrl.submission_queue(1).unwrap();
    assert_eq!(sq.outstanding(), QUEUE_ENTRIES);
    assert_eq!(sq.head, 0);

    cids.insert(h.submit_io(io(IoOpcode::Read, 1, 16, 1, BUF)));
    let sq = h.ctrl.submission_queue(1).unwrap();
    assert_eq!(sq.outstanding(), QUEUE_ENTRIES);
    assert_eq!(sq.head, 0);
    assert_eq!(sq.tail, 1);
    assert_eq!(h.csts() & CSTS_CFS, 0);

    disk.set_hold_completions(false);
    h.ctrl.poll(&mut h.mem);
    let mut completed = BTreeSet::new();
    while let Some(cqe) = h.io_completion() {
        assert_status(&cqe, NvmeStatus::SUCCESS);
        assert!(completed.insert(cqe.cid), "cid {} completed twice", cqe.cid);
        h.ctrl.poll(&mut h.mem);
    }
    assert_eq!(completed, cids);
    assert_eq!(h.ctrl.submission_queue(1).unwrap().head, 1);
}

#[test]
fn deleting_a_queue_aborts_in_flight_commands_once() {
    let disk = MemBackend::new(64 * 512);
    let mut h = Harness::with_disk(&disk);
    h.enable();
    h.create_io_queues();

    disk.set_hold_completions(true);
    let a = h.submit_io(io(IoOpcode::Read, 1, 0, 1, BUF));
    let b = h.submit_io(io(IoOpcode::Read, 1, 1, 1, BUF));
    assert!(h.io_completion().is_none());
    assert_eq!(h.ctrl.submission_queue(1).unwrap().outstanding(), 2);

    let mut delete = admin(AdminOpcode::DeleteSq);
    delete.cdw10 = 1;
    assert_status(&h.admin_cmd(delete), NvmeStatus::SUCCESS);

    let first = h.io_completion().unwrap();
    let second = h.io_completion().unwrap();
    assert_eq!((first.cid, second.cid), (a, b));
    assert_status(&first, NvmeStatus::ABORT_SQ_DELETED);
    assert_status(&second, NvmeStatus::ABORT_SQ_DELETED);

    // Late backend completions for the deleted queue are dropped.
    disk.set_hold_completions(false);
    h.ctrl.poll(&mut h.mem);
    assert!(h.io_completion().is_none());

    assert_status(&h.admin_cmd(delete), NvmeStatus::INVALID_QID);
    assert!(h.io_completion().is_none());
    assert!(h.ctrl.submission_queue(1).is_none());
}

#[test]
fn doorbell_writes_to_missing_queues_raise_an_error_event() {
    let disk = MemBackend::new(64 * 512);
    let mut h = Harness::with_disk(&disk);
    h.enable();

    h.submit_admin(admin(AdminOpcode::AsyncEventRequest));
    // Tail doorbell for a submission queue that was never created.
    h.mmio_write(0x1000 + 5 * 8, 4, 1);
    let cqe = h.admin_completion().unwrap();
    assert_status(&cqe, NvmeStatus::SUCCESS);
    assert_eq!(cqe.dw0 & 0x7, aero_nvme::aer::event_type::ERROR as u32);
    assert_eq!(
        (cqe.dw0 >> 8) & 0xff,
        aero_nvme::aer::error_info::INVALID_DB_REGISTER as u32
    );
    assert_eq!(h.csts() & CSTS_CFS, 0);
}
