//! Hardware-independent USB host controller dispatch core.
//!
//! This crate owns everything a host stack shares across controller types:
//! the request (URB) model and its single-giveback lifecycle, the portable
//! error taxonomy, the per-controller device registry, frame bandwidth
//! admission control, the controller lifecycle state machine, root-hub
//! request dispatch with its software poll timer, and the [`hcd::HcDriver`]
//! vtable a concrete controller driver (e.g. `usb-ohci`) plugs into.
//!
//! Concurrency contract: one lock per controller covers all shared mutable
//! state; completion callbacks are always invoked with that lock released,
//! and no lock is ever held across a blocking operation.

pub mod bandwidth;
pub mod bus;
pub mod error;
pub mod hcd;
pub mod registry;
pub mod urb;
pub mod usb;

pub use bus::HcBus;
pub use error::{TransferError, UsbError, UsbResult};
pub use hcd::{callback, HcDriver, HcState, Hcd, IrqOutcome, SubmitError, UnlinkOutcome};
pub use registry::{DeviceId, DeviceRegistry};
pub use urb::{IsoPacket, Pipe, Urb, UrbCallback, UrbFlags, UrbId, UrbStatus};
pub use usb::{Direction, SetupPacket, TransferType, UsbSpeed};
