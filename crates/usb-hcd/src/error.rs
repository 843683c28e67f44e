//! Portable error taxonomy for asynchronous USB I/O.
//!
//! Controller drivers translate raw hardware condition codes into
//! [`TransferError`] exactly once, at their completion-processing boundary;
//! nothing above that boundary ever observes a hardware code.

use thiserror::Error;

/// Failure of an individual transfer on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("CRC error")]
    Crc,
    #[error("bit stuffing violation")]
    BitStuffing,
    #[error("data toggle mismatch")]
    DataToggleMismatch,
    #[error("endpoint returned STALL")]
    Stall,
    #[error("device not responding")]
    NoResponse,
    #[error("data overrun")]
    Overrun,
    #[error("data underrun")]
    Underrun,
}

/// Error type used across the host stack's client-facing surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum UsbError {
    #[error("out of memory or DMA-capable resources")]
    NoMemory,
    #[error("device is not connected or not registered")]
    NoDevice,
    #[error("controller or endpoint is shutting down")]
    ShuttingDown,
    #[error("endpoint is halted; clear the halt before reuse")]
    EndpointHalted,
    #[error("invalid request parameter")]
    BadParameter,
    #[error("periodic transfer would oversubscribe the frame budget")]
    BandwidthExceeded,
    #[error("transfer failed: {0}")]
    Transfer(#[from] TransferError),
    #[error("request cancelled by unlink")]
    Cancelled,
    #[error("request is already completing; unlink came too late")]
    TooLate,
    #[error("unlink already in progress")]
    InProgress,
    #[error("timed out")]
    Timeout,
}

pub type UsbResult<T> = Result<T, UsbError>;
