//! Endpoint Descriptors: the hardware-visible per-endpoint queue heads.
//!
//! Each ED is a 16-byte DMA image (info word, TD tail, TD head, next ED)
//! paired with a software mirror holding schedule placement and lifecycle
//! state. The TD chain always ends in a reusable dummy TD so new work can be
//! appended by rewriting only the tail pointer, without a lock the hardware
//! would have to honour.

use usb_hcd::{Direction, HcBus, UsbSpeed};

use crate::td::TdHandle;

// ED info word (dword 0).
const ED_FA_MASK: u32 = 0x7F; // function (device) address
const ED_EN_SHIFT: u32 = 7; // endpoint number
const ED_DIR_SHIFT: u32 = 11; // 00 from TD, 01 OUT, 10 IN
const ED_SPEED_LOW: u32 = 1 << 13;
pub(crate) const ED_SKIP: u32 = 1 << 14;
const ED_FORMAT_ISO: u32 = 1 << 15;
const ED_MPS_SHIFT: u32 = 16;

// Flag bits carried in the TD head pointer (dword 2).
pub(crate) const ED_HEAD_HALTED: u32 = 1 << 0;
pub(crate) const ED_HEAD_TOGGLE_CARRY: u32 = 1 << 1;
pub(crate) const ED_PTR_MASK: u32 = !0xF;

/// Stable handle into the ED slab.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct EdHandle(pub u32);

/// Identity of an ED: one per (device, endpoint, direction) triple, with the
/// direction collapsed for control endpoints (the transfer direction comes
/// from each TD).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct EdKey {
    pub device: u8,
    pub endpoint: u8,
    pub direction: Option<Direction>,
}

/// ED lifecycle. Hardware reclamation is always deferred to the next frame
/// boundary, so the pending states are the only path out of `Operational`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EdState {
    /// Created, never linked into a schedule.
    New,
    /// Off the schedule, reusable by the next submission.
    Unlinked,
    /// Linked and serviced by the hardware.
    Operational,
    /// Queued for the frame-boundary reaper to splice out cancelled TDs.
    PendingUrbDelete,
    /// Queued for the reaper to tear the whole endpoint down.
    PendingFullDelete,
}

impl EdState {
    pub fn is_pending_delete(self) -> bool {
        matches!(self, EdState::PendingUrbDelete | EdState::PendingFullDelete)
    }
}

/// Which schedule structure an ED lives on when linked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ListKind {
    Control,
    Bulk,
    Periodic,
    Iso,
}

#[derive(Debug)]
pub(crate) struct Ed {
    pub bus_addr: u32,
    pub key: EdKey,
    pub state: EdState,
    pub list: ListKind,
    pub speed: UsbSpeed,
    pub max_packet: u16,
    /// Pending (hardware-owned) TDs in queue order; the dummy tail is not a
    /// member.
    pub queue: Vec<TdHandle>,
    pub dummy: TdHandle,
    // Periodic placement.
    pub interval: u32,
    pub branch: u32,
    pub load: u32,
    /// Stable tie-break for the descending-interval periodic chain order.
    pub seq: u64,
    /// Frame in which the ED was queued for deferred removal.
    pub rm_frame: u32,
    /// This removal is holding its list's processing-enable bit off.
    pub counted_removal: bool,
}

impl Ed {
    pub fn info_word(&self, skip: bool) -> u32 {
        let dir = match self.key.direction {
            None => 0b00,
            Some(Direction::Out) => 0b01,
            Some(Direction::In) => 0b10,
        };
        let mut info = u32::from(self.key.device) & ED_FA_MASK
            | (u32::from(self.key.endpoint) & 0xF) << ED_EN_SHIFT
            | dir << ED_DIR_SHIFT
            | u32::from(self.max_packet) << ED_MPS_SHIFT;
        if self.speed == UsbSpeed::Low {
            info |= ED_SPEED_LOW;
        }
        if self.list == ListKind::Iso {
            info |= ED_FORMAT_ISO;
        }
        if skip {
            info |= ED_SKIP;
        }
        info
    }

    /// Writes the full initial ED image: empty queue (head == tail == dummy),
    /// no successor.
    pub fn write_initial(&self, bus: &mut dyn HcBus, dummy_addr: u32) {
        bus.dma_write_u32(self.bus_addr, self.info_word(false));
        bus.dma_write_u32(self.bus_addr + 4, dummy_addr);
        bus.dma_write_u32(self.bus_addr + 8, dummy_addr);
        bus.dma_write_u32(self.bus_addr + 12, 0);
    }

    pub fn set_skip(&self, bus: &mut dyn HcBus, skip: bool) {
        bus.dma_write_u32(self.bus_addr, self.info_word(skip));
    }

    pub fn write_tail(&self, bus: &mut dyn HcBus, tail: u32) {
        bus.dma_write_u32(self.bus_addr + 4, tail);
    }

    pub fn read_head(&self, bus: &mut dyn HcBus) -> u32 {
        bus.dma_read_u32(self.bus_addr + 8)
    }

    /// Rewrites the head pointer preserving nothing: used by the reaper once
    /// the hardware is guaranteed off this ED.
    pub fn write_head(&self, bus: &mut dyn HcBus, head: u32) {
        bus.dma_write_u32(self.bus_addr + 8, head);
    }

    pub fn write_next(&self, bus: &mut dyn HcBus, next: u32) {
        bus.dma_write_u32(self.bus_addr + 12, next);
    }

    pub fn is_halted(&self, bus: &mut dyn HcBus) -> bool {
        self.read_head(bus) & ED_HEAD_HALTED != 0
    }

    /// Clears the halt bit and resets the data toggle, keeping the queue
    /// position.
    pub fn clear_halt(&self, bus: &mut dyn HcBus) {
        let head = self.read_head(bus) & ED_PTR_MASK;
        self.write_head(bus, head);
    }
}
