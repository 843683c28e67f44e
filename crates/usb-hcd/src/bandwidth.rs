//! Frame bandwidth admission control.
//!
//! USB 1.1 frames are 1 ms; periodic (interrupt + isochronous) transfers may
//! reserve at most 90% of the frame, leaving the rest for control and bulk
//! traffic. Bus time is computed with the classic worst-case formula
//! (signalling overhead + bit-stuffed payload time, in nanoseconds) and the
//! per-controller counter tracks exactly what was admitted.

use crate::error::{UsbError, UsbResult};
use crate::usb::UsbSpeed;

/// Full frame, in nanoseconds.
pub const FRAME_TIME_NS: u32 = 1_000_000;

/// Portion of the frame periodic transfers may occupy.
pub const PERIODIC_BUDGET_NS: u32 = FRAME_TIME_NS / 10 * 9;

const BW_HOST_DELAY_NS: u64 = 1_000;
const BW_HUB_LS_SETUP_NS: u64 = 333;

/// Worst-case (bit-stuffed) time for `bytes` of payload, in "bit time"
/// units scaled by 10/7 stuffing overhead.
fn bit_time(bytes: u64) -> u64 {
    7 * 8 * bytes / 6
}

/// Worst-case bus time for one service of a periodic endpoint, in
/// nanoseconds.
pub fn bus_time_ns(speed: UsbSpeed, is_input: bool, is_iso: bool, bytes: usize) -> u32 {
    let bytes = bytes as u64;
    let ns = match speed {
        UsbSpeed::Low => {
            // Low speed supports interrupt only; the hub setup tokens
            // bracket every low-speed transaction.
            let tmp = if is_input {
                67_667 * (31 + 10 * bit_time(bytes)) / 1_000
            } else {
                66_700 * (31 + 10 * bit_time(bytes)) / 1_000
            };
            let base = if is_input { 64_060 } else { 64_107 };
            base + 2 * BW_HUB_LS_SETUP_NS + BW_HOST_DELAY_NS + tmp
        }
        UsbSpeed::Full => {
            let tmp = 8_354 * (31 + 10 * bit_time(bytes)) / 1_000;
            let base = match (is_iso, is_input) {
                (true, true) => 7_268,
                (true, false) => 6_265,
                (false, _) => 9_107,
            };
            base + BW_HOST_DELAY_NS + tmp
        }
    };
    ns as u32
}

/// Per-controller periodic bandwidth ledger.
#[derive(Debug, Default)]
pub struct FrameBandwidth {
    allocated_ns: u32,
}

impl FrameBandwidth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocated_ns(&self) -> u32 {
        self.allocated_ns
    }

    /// Admits `ns` of periodic bus time or rejects the transfer outright.
    pub fn claim(&mut self, ns: u32) -> UsbResult<()> {
        let next = self.allocated_ns.saturating_add(ns);
        if next > PERIODIC_BUDGET_NS {
            return Err(UsbError::BandwidthExceeded);
        }
        self.allocated_ns = next;
        Ok(())
    }

    pub fn release(&mut self, ns: u32) {
        self.allocated_ns = self.allocated_ns.saturating_sub(ns);
    }
}

/// Snaps a requested periodic interval down to the nearest supported power
/// of two, clamped to the 32-slot periodic schedule.
pub fn snap_interval(requested: u32) -> u32 {
    let requested = requested.clamp(1, 32);
    // Highest power of two <= requested.
    1 << (31 - requested.leading_zeros())
}
