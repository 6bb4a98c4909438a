//! Completion interrupt signalling.
//!
//! The controller decides when a vector should be raised or lowered; an [`InterruptSink`]
//! supplied by the platform performs the delivery. In pin-based mode every completion queue shares
//! one line whose level is derived from the per-vector pending bits and the INTMS mask.

pub trait InterruptSink: Send {
    fn assert(&mut self, vector: u16);
    fn deassert(&mut self, vector: u16);
}

#[derive(Default)]
pub struct InterruptNotifier {
    msix: bool,
    /// INTMS: per-vector mask for pin-based interrupts.
    mask: u32,
    /// Pin-based pending vectors.
    pending: u32,
    level: bool,
    sink: Option<Box<dyn InterruptSink>>,
}

impl std::fmt::Debug for InterruptNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptNotifier")
            .field("msix", &self.msix)
            .field("mask", &self.mask)
            .field("pending", &self.pending)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

impl InterruptNotifier {
    pub fn set_sink(&mut self, sink: Option<Box<dyn InterruptSink>>) {
        self.sink = sink;
    }

    /// Switches between message-signalled (per vector) and pin-based delivery.
    pub fn set_msix(&mut self, enabled: bool) {
        self.msix = enabled;
        self.pending = 0;
        self.update_level();
    }

    pub fn msix(&self) -> bool {
        self.msix
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn set_mask(&mut self, bits: u32) {
        self.mask |= bits;
        self.update_level();
    }

    pub fn clear_mask(&mut self, bits: u32) {
        self.mask &= !bits;
        self.update_level();
    }

    pub fn level(&self) -> bool {
        self.level
    }

    pub fn assert(&mut self, vector: u16) {
        if self.msix {
            tracing::trace!(vector, "raising MSI-X vector");
            if let Some(sink) = self.sink.as_mut() {
                sink.assert(vector);
            }
            return;
        }
        self.pending |= 1u32 << (vector & 31);
        self.update_level();
    }

    pub fn deassert(&mut self, vector: u16) {
        if self.msix {
            if let Some(sink) = self.sink.as_mut() {
                sink.deassert(vector);
            }
            return;
        }
        self.pending &= !(1u32 << (vector & 31));
        self.update_level();
    }

    /// Pin-based mode: replaces the set of vectors with unread completions.
    pub fn set_pending(&mut self, vectors: u32) {
        if self.msix {
            return;
        }
        self.pending = vectors;
        self.update_level();
    }

    /// Drops every pending pin-based vector and the mask.
    pub fn reset(&mut self) {
        self.pending = 0;
        self.mask = 0;
        self.update_level();
    }

    fn update_level(&mut self) {
        let level = !self.msix && (self.pending & !self.mask) != 0;
        if level == self.level {
            return;
        }
        self.level = level;
        if let Some(sink) = self.sink.as_mut() {
            if level {
                sink.assert(0);
            } else {
                sink.deassert(0);
            }
        }
    }
}
