//! Per-controller device registry.
//!
//! A fixed 128-slot table (one per USB device address) owned by the
//! controller instance. Each live entry tracks the device's speed, its use
//! count (incremented for every in-flight URB), per-endpoint halt flags and
//! the set of pending URB ids.

use std::collections::HashSet;

use crate::error::{UsbError, UsbResult};
use crate::urb::UrbId;
use crate::usb::{Direction, UsbSpeed};

pub const MAX_DEVICES: usize = 128;

/// USB device address, doubling as the registry slot index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u8);

impl DeviceId {
    pub fn address(self) -> u8 {
        self.0
    }
}

impl core::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

#[derive(Debug)]
struct DeviceEntry {
    speed: UsbSpeed,
    use_count: u32,
    is_root_hub: bool,
    /// One bit per endpoint number, split by direction. Endpoint 0 (control)
    /// never latches a halt: control stalls are protocol stalls.
    halted_in: u16,
    halted_out: u16,
    pending: HashSet<UrbId>,
}

/// Address-indexed table of live devices on one bus.
#[derive(Debug)]
pub struct DeviceRegistry {
    slots: Vec<Option<DeviceEntry>>,
    root_hub: Option<DeviceId>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_DEVICES).map(|_| None).collect(),
            root_hub: None,
        }
    }

    /// Allocates the lowest free address. Address 0 is the unconfigured
    /// default address and is never handed out.
    pub fn alloc(&mut self, speed: UsbSpeed) -> UsbResult<DeviceId> {
        for addr in 1..MAX_DEVICES {
            if self.slots[addr].is_none() {
                self.slots[addr] = Some(DeviceEntry {
                    speed,
                    use_count: 0,
                    is_root_hub: false,
                    halted_in: 0,
                    halted_out: 0,
                    pending: HashSet::new(),
                });
                return Ok(DeviceId(addr as u8));
            }
        }
        Err(UsbError::NoMemory)
    }

    /// Registers the controller's virtual root hub. Called once at probe.
    pub fn alloc_root_hub(&mut self, speed: UsbSpeed) -> UsbResult<DeviceId> {
        let id = self.alloc(speed)?;
        self.entry_mut(id)?.is_root_hub = true;
        self.root_hub = Some(id);
        Ok(id)
    }

    /// Frees a device slot. Fails while URBs are still pending on it.
    pub fn free(&mut self, id: DeviceId) -> UsbResult<()> {
        let entry = self.entry(id)?;
        if !entry.pending.is_empty() {
            return Err(UsbError::InProgress);
        }
        if Some(id) == self.root_hub {
            self.root_hub = None;
        }
        self.slots[id.0 as usize] = None;
        Ok(())
    }

    pub fn root_hub(&self) -> Option<DeviceId> {
        self.root_hub
    }

    pub fn is_root_hub(&self, id: DeviceId) -> bool {
        Some(id) == self.root_hub
    }

    pub fn is_live(&self, id: DeviceId) -> bool {
        self.slots[id.0 as usize].is_some()
    }

    pub fn speed(&self, id: DeviceId) -> UsbResult<UsbSpeed> {
        Ok(self.entry(id)?.speed)
    }

    fn entry(&self, id: DeviceId) -> UsbResult<&DeviceEntry> {
        self.slots[id.0 as usize].as_ref().ok_or(UsbError::NoDevice)
    }

    fn entry_mut(&mut self, id: DeviceId) -> UsbResult<&mut DeviceEntry> {
        self.slots[id.0 as usize].as_mut().ok_or(UsbError::NoDevice)
    }

    pub fn is_halted(&self, id: DeviceId, endpoint: u8, direction: Direction) -> bool {
        let Ok(entry) = self.entry(id) else {
            return false;
        };
        let mask = 1u16 << (endpoint & 0x0f);
        match direction {
            Direction::In => entry.halted_in & mask != 0,
            Direction::Out => entry.halted_out & mask != 0,
        }
    }

    /// Latches a halt reported by the completion processor. Endpoint 0 is
    /// exempt (protocol stall, self-clearing at the next SETUP).
    pub fn set_halted(&mut self, id: DeviceId, endpoint: u8, direction: Direction) {
        if endpoint & 0x0f == 0 {
            return;
        }
        if let Ok(entry) = self.entry_mut(id) {
            let mask = 1u16 << (endpoint & 0x0f);
            match direction {
                Direction::In => entry.halted_in |= mask,
                Direction::Out => entry.halted_out |= mask,
            }
        }
    }

    pub fn clear_halted(&mut self, id: DeviceId, endpoint: u8, direction: Direction) {
        if let Ok(entry) = self.entry_mut(id) {
            let mask = !(1u16 << (endpoint & 0x0f));
            match direction {
                Direction::In => entry.halted_in &= mask,
                Direction::Out => entry.halted_out &= mask,
            }
        }
    }

    /// Records a newly submitted URB and takes a device reference.
    pub fn add_pending(&mut self, id: DeviceId, urb: UrbId) -> UsbResult<()> {
        let entry = self.entry_mut(id)?;
        entry.use_count += 1;
        entry.pending.insert(urb);
        Ok(())
    }

    /// Drops a retired URB and releases its device reference.
    pub fn remove_pending(&mut self, id: DeviceId, urb: UrbId) {
        if let Ok(entry) = self.entry_mut(id) {
            if entry.pending.remove(&urb) {
                entry.use_count = entry.use_count.saturating_sub(1);
            }
        }
    }

    pub fn use_count(&self, id: DeviceId) -> u32 {
        self.entry(id).map(|e| e.use_count).unwrap_or(0)
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
