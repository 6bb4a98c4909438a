//! Guest memory access and address-space classification.
//!
//! Data pointers supplied by the guest may land in ordinary guest RAM (reached through a
//! [`MemoryBus`]) or in one of the controller-local regions exposed through a BAR: the controller
//! memory buffer (CMB) and the persistent memory region (PMR).

use thiserror::Error;

/// Errors returned when guest memory cannot be accessed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    #[error("memory access out of bounds: addr={addr:#x} len={len}")]
    OutOfBounds { addr: u64, len: usize },
}

/// Guest physical memory access used for DMA.
pub trait MemoryBus {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) -> Result<(), MemoryError>;
    fn write_physical(&mut self, paddr: u64, buf: &[u8]) -> Result<(), MemoryError>;

    fn read_u16(&self, paddr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read_physical(paddr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, paddr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, paddr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_u32(&mut self, paddr: u64, val: u32) -> Result<(), MemoryError> {
        self.write_physical(paddr, &val.to_le_bytes())
    }

    fn write_u64(&mut self, paddr: u64, val: u64) -> Result<(), MemoryError> {
        self.write_physical(paddr, &val.to_le_bytes())
    }
}

/// Address space a mapped range resolves into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// Ordinary guest memory; transfers go through the [`MemoryBus`].
    Dma,
    /// Controller memory buffer.
    ControllerBuffer,
    /// Persistent memory region.
    PersistentMemory,
}

/// A controller-owned buffer that becomes guest-addressable once its BAR is placed.
#[derive(Debug, Clone)]
pub struct LocalRegion {
    base: Option<u64>,
    data: Vec<u8>,
}

impl LocalRegion {
    pub fn new(size: usize) -> Self {
        LocalRegion {
            base: None,
            data: vec![0u8; size],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn base(&self) -> Option<u64> {
        self.base
    }

    pub fn set_base(&mut self, base: Option<u64>) {
        self.base = base;
    }

    pub fn contains(&self, addr: u64) -> bool {
        match self.base {
            Some(base) => addr >= base && addr - base < self.data.len() as u64,
            None => false,
        }
    }

    fn range(&self, addr: u64, len: usize) -> Result<std::ops::Range<usize>, MemoryError> {
        let oob = MemoryError::OutOfBounds { addr, len };
        let base = self.base.ok_or(oob.clone())?;
        let start = addr.checked_sub(base).ok_or(oob.clone())?;
        let start = usize::try_from(start).map_err(|_| oob.clone())?;
        let end = start.checked_add(len).ok_or(oob.clone())?;
        if end > self.data.len() {
            return Err(oob);
        }
        Ok(start..end)
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    pub fn write(&mut self, addr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        let range = self.range(addr, buf.len())?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// The controller-local regions. Classification is by start address, as seen by the guest.
#[derive(Debug, Clone, Default)]
pub struct LocalMemory {
    pub cmb: Option<LocalRegion>,
    pub pmr: Option<LocalRegion>,
}

impl LocalMemory {
    pub fn classify(&self, addr: u64) -> Region {
        if self.cmb.as_ref().is_some_and(|r| r.contains(addr)) {
            Region::ControllerBuffer
        } else if self.pmr.as_ref().is_some_and(|r| r.contains(addr)) {
            Region::PersistentMemory
        } else {
            Region::Dma
        }
    }

    fn region_mut(&mut self, region: Region) -> Option<&mut LocalRegion> {
        match region {
            Region::ControllerBuffer => self.cmb.as_mut(),
            Region::PersistentMemory => self.pmr.as_mut(),
            Region::Dma => None,
        }
    }

    fn region(&self, region: Region) -> Option<&LocalRegion> {
        match region {
            Region::ControllerBuffer => self.cmb.as_ref(),
            Region::PersistentMemory => self.pmr.as_ref(),
            Region::Dma => None,
        }
    }
}

/// Memory resolver: routes a transfer to guest memory or to a controller-local region.
pub struct Dma<'a> {
    mem: &'a mut dyn MemoryBus,
    local: &'a mut LocalMemory,
}

impl<'a> Dma<'a> {
    pub fn new(mem: &'a mut dyn MemoryBus, local: &'a mut LocalMemory) -> Self {
        Dma { mem, local }
    }

    pub fn classify(&self, addr: u64) -> Region {
        self.local.classify(addr)
    }

    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        match self.local.classify(addr) {
            Region::Dma => self.mem.read_physical(addr, buf),
            region => match self.local.region(region) {
                Some(r) => r.read(addr, buf),
                None => Err(MemoryError::OutOfBounds {
                    addr,
                    len: buf.len(),
                }),
            },
        }
    }

    pub fn write(&mut self, addr: u64, buf: &[u8]) -> Result<(), MemoryError> {
        match self.local.classify(addr) {
            Region::Dma => self.mem.write_physical(addr, buf),
            region => match self.local.region_mut(region) {
                Some(r) => r.write(addr, buf),
                None => Err(MemoryError::OutOfBounds {
                    addr,
                    len: buf.len(),
                }),
            },
        }
    }

    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}
