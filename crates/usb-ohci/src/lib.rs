//! OHCI-class host controller driver for the `usb-hcd` dispatch core.
//!
//! The driver turns validated URBs into hardware ED/TD queues in a
//! DMA-consistent window, processes the controller's done list from
//! interrupt context, reclaims endpoints through a two-phase frame-boundary
//! deletion protocol, and emulates the root hub in software over the `HcRh*`
//! registers. The hardware is reached exclusively through the platform's
//! [`usb_hcd::HcBus`], so the driver runs unchanged against real MMIO or a
//! simulated controller.

mod dma;
mod ed;
mod hc;
pub mod regs;
mod roothub;
mod schedule;
mod td;

pub use hc::{Ohci, OhciConfig};
pub use roothub::{ROOT_HUB_CONFIG_DESCRIPTOR, ROOT_HUB_DEVICE_DESCRIPTOR};
