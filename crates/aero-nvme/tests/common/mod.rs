#![allow(dead_code)]

use aero_nvme::command::{AdminOpcode, IoOpcode, NvmeCommand};
use aero_nvme::{
    CqEntry, MemBackend, MemoryBus, MemoryError, Namespace, NamespaceParams, NvmeController,
    NvmeParams, NvmeStatus,
};

pub const NVME_REG_CAP: u64 = 0x00;
pub const NVME_REG_CC: u64 = 0x14;
pub const NVME_REG_CSTS: u64 = 0x1c;
pub const NVME_REG_AQA: u64 = 0x24;
pub const NVME_REG_ASQ: u64 = 0x28;
pub const NVME_REG_ACQ: u64 = 0x30;

pub const CC_EN: u32 = 1 << 0;
/// IOCQES=4, IOSQES=6.
pub const CC_ENTRY_SIZES: u32 = 0x0046_0000;
pub const CC_CSS_ALL: u32 = 6 << 4;
pub const CSTS_RDY: u32 = 1 << 0;
pub const CSTS_CFS: u32 = 1 << 1;

pub const ASQ: u64 = 0x10000;
pub const ACQ: u64 = 0x20000;
pub const IO_CQ: u64 = 0x40000;
pub const IO_SQ: u64 = 0x50000;
/// Start of the area tests use for data buffers.
pub const BUF: u64 = 0x100000;

pub const MEM_SIZE: usize = 4 * 1024 * 1024;

pub struct TestMem {
    pub buf: Vec<u8>,
}

impl TestMem {
    pub fn new(size: usize) -> Self {
        Self { buf: vec![0u8; size] }
    }

    pub fn slice(&self, addr: u64, len: usize) -> &[u8] {
        &self.buf[addr as usize..addr as usize + len]
    }

    pub fn fill(&mut self, addr: u64, data: &[u8]) {
        self.buf[addr as usize..addr as usize + data.len()].copy_from_slice(data);
    }
}

impl MemoryBus for TestMem {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let start = paddr as usize;
        let end = start.checked_add(buf.len()).ok_or(MemoryError::OutOfBounds {
            addr: paddr,
            len: buf.len(),
        })?;
        if end > self.buf.len() {
            return Err(MemoryError::OutOfBounds {
                addr: paddr,
                len: buf.len(),
            });
        }
        buf.copy_from_slice(&self.buf[start..end]);
        Ok(())
    }

    fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        let start = paddr as usize;
        let end = start.checked_add(buf.len()).ok_or(MemoryError::OutOfBounds {
            addr: paddr,
            len: buf.len(),
        })?;
        if end > self.buf.len() {
            return Err(MemoryError::OutOfBounds {
                addr: paddr,
                len: buf.len(),
            });
        }
        self.buf[start..end].copy_from_slice(buf);
        Ok(())
    }
}

pub fn command(opc: u8) -> NvmeCommand {
    NvmeCommand {
        opc,
        fuse: 0,
        psdt: 0,
        cid: 0,
        nsid: 0,
        mptr: 0,
        prp1: 0,
        prp2: 0,
        cdw10: 0,
        cdw11: 0,
        cdw12: 0,
        cdw13: 0,
        cdw14: 0,
        cdw15: 0,
    }
}

pub fn admin(op: AdminOpcode) -> NvmeCommand {
    command(op.raw())
}

/// Read/write style command on `nsid` covering `nlb` blocks (1-based) at `slba`.
pub fn io(op: IoOpcode, nsid: u32, slba: u64, nlb: u32, buf: u64) -> NvmeCommand {
    let mut cmd = command(op.raw());
    cmd.nsid = nsid;
    cmd.prp1 = buf;
    cmd.cdw10 = slba as u32;
    cmd.cdw11 = (slba >> 32) as u32;
    cmd.cdw12 = nlb - 1;
    cmd
}

/// Points the command at a single SGL data block descriptor.
pub fn use_sgl(cmd: &mut NvmeCommand, addr: u64, len: u32) {
    cmd.psdt = 1;
    cmd.prp1 = addr;
    cmd.prp2 = len as u64;
}

pub fn namespace(params: NamespaceParams, disk: &MemBackend) -> Namespace {
    Namespace::new(params, Box::new(disk.clone())).unwrap()
}

pub fn assert_status(cqe: &CqEntry, expected: NvmeStatus) {
    let status = cqe.nvme_status();
    assert!(
        status.same_code(expected),
        "cid {:#x}: expected {expected}, got {status}",
        cqe.cid
    );
}

/// Ring cursor for a queue pair driven the way a host driver would.
struct Ring {
    sq_base: u64,
    cq_base: u64,
    size: u16,
    sq_tail: u16,
    cq_head: u16,
    phase: bool,
    sq_doorbell: u64,
    cq_doorbell: u64,
}

impl Ring {
    fn new(qid: u16, sq_base: u64, cq_base: u64, size: u16) -> Self {
        Ring {
            sq_base,
            cq_base,
            size,
            sq_tail: 0,
            cq_head: 0,
            phase: true,
            sq_doorbell: 0x1000 + qid as u64 * 8,
            cq_doorbell: 0x1000 + qid as u64 * 8 + 4,
        }
    }
}

pub struct Harness {
    pub ctrl: NvmeController,
    pub mem: TestMem,
    admin: Ring,
    io: Option<Ring>,
    next_cid: u16,
}

impl Harness {
    pub fn new(params: NvmeParams, namespaces: Vec<Namespace>) -> Self {
        let mut ctrl = NvmeController::new(params).unwrap();
        for ns in namespaces {
            ctrl.attach_namespace(ns).unwrap();
        }
        Harness {
            ctrl,
            mem: TestMem::new(MEM_SIZE),
            admin: Ring::new(0, ASQ, ACQ, 16),
            io: None,
            next_cid: 1,
        }
    }

    /// Controller with one 1 MiB namespace on `disk`.
    pub fn with_disk(disk: &MemBackend) -> Self {
        Self::new(
            NvmeParams::default(),
            vec![namespace(NamespaceParams::default(), disk)],
        )
    }

    pub fn mmio_write(&mut self, offset: u64, size: usize, value: u64) {
        self.ctrl.mmio_write(offset, size, value, &mut self.mem);
    }

    pub fn csts(&self) -> u32 {
        self.ctrl.mmio_read(NVME_REG_CSTS, 4) as u32
    }

    /// Programs admin queues of `entries` each and sets CC.EN with `cc_extra` ORed in.
    pub fn enable_with(&mut self, entries: u16, cc_extra: u32) {
        let n = (entries - 1) as u64;
        self.admin = Ring::new(0, ASQ, ACQ, entries);
        // A fresh completion ring starts with every phase tag clear.
        self.mem.fill(ACQ, &vec![0u8; entries as usize * 16]);
        self.mmio_write(NVME_REG_AQA, 4, n << 16 | n);
        self.mmio_write(NVME_REG_ASQ, 8, ASQ);
        self.mmio_write(NVME_REG_ACQ, 8, ACQ);
        self.mmio_write(NVME_REG_CC, 4, (CC_ENTRY_SIZES | CC_EN | cc_extra) as u64);
    }

    pub fn enable(&mut self) {
        self.enable_with(16, 0);
        assert_eq!(self.csts() & CSTS_RDY, CSTS_RDY);
    }

    /// Enables with every I/O command set selected (zoned namespaces become zoned).
    pub fn enable_all_command_sets(&mut self) {
        self.enable_with(16, CC_CSS_ALL);
        assert_eq!(self.csts() & CSTS_RDY, CSTS_RDY);
    }

    fn alloc_cid(&mut self) -> u16 {
        let cid = self.next_cid;
        self.next_cid = self.next_cid.wrapping_add(1).max(1);
        cid
    }

    /// Writes the command into the admin ring and rings the tail doorbell. Returns its cid.
    pub fn submit_admin(&mut self, mut cmd: NvmeCommand) -> u16 {
        cmd.cid = self.alloc_cid();
        let ring = &mut self.admin;
        let addr = ring.sq_base + ring.sq_tail as u64 * 64;
        ring.sq_tail = (ring.sq_tail + 1) % ring.size;
        let (tail, doorbell) = (ring.sq_tail, ring.sq_doorbell);
        self.mem.write_physical(addr, &cmd.to_bytes()).unwrap();
        self.mmio_write(doorbell, 4, tail as u64);
        cmd.cid
    }

    /// Consumes the next admin completion if one has been posted.
    pub fn admin_completion(&mut self) -> Option<CqEntry> {
        Self::take_completion(&mut self.ctrl, &mut self.mem, &mut self.admin)
    }

    pub fn admin_cmd(&mut self, cmd: NvmeCommand) -> CqEntry {
        let cid = self.submit_admin(cmd);
        let cqe = self.admin_completion().expect("admin command did not complete");
        assert_eq!(cqe.cid, cid);
        cqe
    }

    pub fn create_io_queues(&mut self) {
        let mut cmd = admin(AdminOpcode::CreateCq);
        cmd.prp1 = IO_CQ;
        cmd.cdw10 = (15 << 16) | 1; // 16 entries, qid 1
        cmd.cdw11 = 0x3; // PC + IEN
        assert_status(&self.admin_cmd(cmd), NvmeStatus::SUCCESS);

        let mut cmd = admin(AdminOpcode::CreateSq);
        cmd.prp1 = IO_SQ;
        cmd.cdw10 = (15 << 16) | 1;
        cmd.cdw11 = (1 << 16) | 0x1; // cqid 1, PC
        assert_status(&self.admin_cmd(cmd), NvmeStatus::SUCCESS);

        self.io = Some(Ring::new(1, IO_SQ, IO_CQ, 16));
    }

    pub fn submit_io(&mut self, mut cmd: NvmeCommand) -> u16 {
        cmd.cid = self.alloc_cid();
        let ring = self.io.as_mut().expect("I/O queues not created");
        let addr = ring.sq_base + ring.sq_tail as u64 * 64;
        ring.sq_tail = (ring.sq_tail + 1) % ring.size;
        let (tail, doorbell) = (ring.sq_tail, ring.sq_doorbell);
        self.mem.write_physical(addr, &cmd.to_bytes()).unwrap();
        self.mmio_write(doorbell, 4, tail as u64);
        cmd.cid
    }

    pub fn io_completion(&mut self) -> Option<CqEntry> {
        let ring = self.io.as_mut().expect("I/O queues not created");
        Self::take_completion(&mut self.ctrl, &mut self.mem, ring)
    }

    pub fn io_cmd(&mut self, cmd: NvmeCommand) -> CqEntry {
        let cid = self.submit_io(cmd);
        let cqe = self.io_completion().expect("I/O command did not complete");
        assert_eq!(cqe.cid, cid);
        cqe
    }

    fn take_completion(
        ctrl: &mut NvmeController,
        mem: &mut TestMem,
        ring: &mut Ring,
    ) -> Option<CqEntry> {
        let mut bytes = [0u8; 16];
        mem.read_physical(ring.cq_base + ring.cq_head as u64 * 16, &mut bytes)
            .unwrap();
        let cqe = CqEntry::parse(&bytes);
        if cqe.phase() != ring.phase {
            return None;
        }
        ring.cq_head = (ring.cq_head + 1) % ring.size;
        if ring.cq_head == 0 {
            ring.phase = !ring.phase;
        }
        ctrl.mmio_write(ring.cq_doorbell, 4, ring.cq_head as u64, mem);
        Some(cqe)
    }
}
