//! The request (URB) model: one in-flight asynchronous I/O operation on one
//! endpoint.
//!
//! A URB is built by the client, submitted by value and owned by the core
//! while in flight; the client keeps the [`UrbId`] returned by submit. At
//! exactly one "giveback" event the URB's own completion callback is invoked
//! with `&mut Urb`, after which the core either drops the URB or, for
//! periodic interrupt pipes, re-queues it until an unlink ends the cycle.

use bitflags::bitflags;

use crate::error::{TransferError, UsbError};
use crate::registry::DeviceId;
use crate::usb::{Direction, SetupPacket, TransferType, UsbSpeed};

/// Handle identifying a submitted URB. Stable across interrupt-pipe
/// auto-resubmission, so it can always be passed to unlink.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UrbId(pub(crate) u64);

impl core::fmt::Display for UrbId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "urb#{}", self.0)
    }
}

bitflags! {
    /// Client-controlled transfer options.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct UrbFlags: u32 {
        /// Terminate an exact-multiple bulk OUT with a zero-length packet.
        const ZERO_PACKET = 1 << 0;
        /// Treat a short read as an error instead of a success.
        const SHORT_NOT_OK = 1 << 1;
        /// Unlink returns immediately; completion arrives on the normal path.
        const ASYNC_UNLINK = 1 << 2;
        /// Start an isochronous stream at the next reachable frame.
        const ISO_ASAP = 1 << 3;
    }
}

/// Addressing and transfer attributes of the target endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pipe {
    pub device: DeviceId,
    pub endpoint: u8,
    pub direction: Direction,
    pub transfer: TransferType,
    pub speed: UsbSpeed,
    pub max_packet: u16,
}

/// One service opportunity of an isochronous URB.
///
/// `status` is `None` while the packet is in flight and for packets that
/// completed cleanly; per-packet wire errors never fail the whole URB.
#[derive(Clone, Debug, Default)]
pub struct IsoPacket {
    pub offset: usize,
    pub length: usize,
    pub actual_length: usize,
    pub status: Option<TransferError>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UrbStatus {
    /// Submitted, not yet given back.
    Pending,
    /// Given back successfully; `actual_length` is valid.
    Ok,
    /// Given back with an error.
    Failed(UsbError),
}

pub type UrbCallback = Box<dyn FnMut(&mut Urb) + Send>;

pub struct Urb {
    pub pipe: Pipe,
    /// Data buffer. Filled by the core before giveback for IN transfers;
    /// consumed for OUT transfers at submission.
    pub buffer: Vec<u8>,
    /// Present iff `pipe.transfer == Control`.
    pub setup: Option<SetupPacket>,
    /// Requested polling/service interval in frames (periodic pipes). The
    /// core snaps it to the nearest supported power of two at submission.
    pub interval: u32,
    /// Explicit start frame for isochronous streams without `ISO_ASAP`.
    pub start_frame: u16,
    pub iso_packets: Vec<IsoPacket>,
    pub flags: UrbFlags,
    pub status: UrbStatus,
    pub actual_length: usize,
    /// Frame bus-time reserved by admission control, in nanoseconds.
    pub(crate) reserved_bandwidth_ns: u32,
    pub(crate) id: Option<UrbId>,
    callback: Option<UrbCallback>,
}

impl Urb {
    fn new(pipe: Pipe, buffer: Vec<u8>, callback: UrbCallback) -> Self {
        Self {
            pipe,
            buffer,
            setup: None,
            interval: 0,
            start_frame: 0,
            iso_packets: Vec::new(),
            flags: UrbFlags::empty(),
            status: UrbStatus::Pending,
            actual_length: 0,
            reserved_bandwidth_ns: 0,
            id: None,
            callback: Some(callback),
        }
    }

    pub fn control(
        pipe: Pipe,
        setup: SetupPacket,
        buffer: Vec<u8>,
        callback: UrbCallback,
    ) -> Self {
        let mut urb = Self::new(pipe, buffer, callback);
        urb.setup = Some(setup);
        urb
    }

    pub fn bulk(pipe: Pipe, buffer: Vec<u8>, callback: UrbCallback) -> Self {
        Self::new(pipe, buffer, callback)
    }

    pub fn interrupt(pipe: Pipe, buffer: Vec<u8>, interval: u32, callback: UrbCallback) -> Self {
        let mut urb = Self::new(pipe, buffer, callback);
        urb.interval = interval;
        urb
    }

    pub fn isochronous(
        pipe: Pipe,
        buffer: Vec<u8>,
        packets: Vec<IsoPacket>,
        callback: UrbCallback,
    ) -> Self {
        let mut urb = Self::new(pipe, buffer, callback);
        urb.iso_packets = packets;
        urb.interval = 1;
        urb.flags |= UrbFlags::ISO_ASAP;
        urb
    }

    /// Handle assigned at submission; `None` before the URB is accepted.
    pub fn id(&self) -> Option<UrbId> {
        self.id
    }

    /// Bus time reserved for this URB by admission control, in nanoseconds.
    pub fn reserved_bandwidth_ns(&self) -> u32 {
        self.reserved_bandwidth_ns
    }

    /// Takes the completion callback out for invocation. The giveback path
    /// puts it back when the URB is re-queued (interrupt auto-resubmit).
    pub(crate) fn take_callback(&mut self) -> Option<UrbCallback> {
        self.callback.take()
    }

    pub(crate) fn put_callback(&mut self, callback: UrbCallback) {
        self.callback = Some(callback);
    }

    /// Resets per-flight bookkeeping for interrupt auto-resubmission.
    pub(crate) fn reset_for_resubmit(&mut self) {
        self.status = UrbStatus::Pending;
        self.actual_length = 0;
    }
}

impl core::fmt::Debug for Urb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Urb")
            .field("pipe", &self.pipe)
            .field("id", &self.id)
            .field("len", &self.buffer.len())
            .field("status", &self.status)
            .field("actual_length", &self.actual_length)
            .finish_non_exhaustive()
    }
}
