//! Hardware-independent dispatch core.
//!
//! Owns the request lifecycle (submit / unlink / giveback), the controller
//! lifecycle state machine and the vtable boundary to the controller-specific
//! driver. One lock per controller serialises thread-context entry points
//! (submit, unlink, lifecycle) with interrupt-context entry points
//! ([`Hcd::interrupt`]); completion callbacks always run with that lock
//! released.

use std::collections::HashMap;
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::bandwidth::{bus_time_ns, snap_interval, FrameBandwidth};
use crate::error::{TransferError, UsbError, UsbResult};
use crate::registry::{DeviceId, DeviceRegistry};
use crate::urb::{Urb, UrbCallback, UrbFlags, UrbId, UrbStatus};
use crate::usb::{Direction, SetupPacket, TransferType, UsbSpeed};

/// Poll period of the simulated root-hub status-change endpoint. The root
/// hub has no physical interrupt source; a software timer re-samples the
/// change bits instead.
pub const ROOT_HUB_POLL_MS: u32 = 255;

/// How long a synchronous unlink waits for the completion callback to run
/// before reporting [`UsbError::Timeout`] to the caller. The URB's real
/// completion still arrives later via the normal path.
pub const SYNC_UNLINK_TIMEOUT: Duration = Duration::from_secs(3);

/// Controller lifecycle states.
///
/// `Quiescing` and `Resuming` are the transient legs of the suspend/resume
/// paths; submission is accepted only in `Running`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HcState {
    Halt,
    Ready,
    Running,
    Quiescing,
    Resuming,
    Suspended,
}

/// Result of asking the driver to service its interrupt sources.
#[derive(Default)]
pub struct IrqOutcome {
    /// The interrupt belonged to this controller.
    pub handled: bool,
    /// URBs retired by this interrupt, in giveback (FIFO) order.
    pub completions: Vec<Urb>,
    /// The controller hit an unrecoverable fault and disabled itself.
    pub fault: bool,
    /// Root-hub port change latched; the status poll will pick it up.
    pub root_hub_change: bool,
}

/// Controller-specific driver vtable consumed by the generic core.
///
/// Construction and drop play the controller allocate/free roles; everything
/// else is called with the per-controller lock held, so implementations need
/// no locking of their own.
pub trait HcDriver: Send {
    fn start(&mut self) -> UsbResult<()>;
    fn stop(&mut self);
    fn suspend(&mut self) -> UsbResult<()>;
    fn resume(&mut self) -> UsbResult<()>;

    fn frame_number(&mut self) -> u16;

    /// Queues a validated URB onto the hardware schedule. On failure the URB
    /// is handed back so the caller retains ownership; no partial hardware
    /// state may remain.
    fn enqueue(&mut self, urb: Urb) -> Result<(), (Urb, UsbError)>;

    /// Marks an in-flight URB for deferred removal and returns its flags.
    /// `TooLate` if the URB is unknown or already completing.
    fn dequeue(&mut self, id: UrbId) -> UsbResult<UrbFlags>;

    /// Schedules deferred teardown of every endpoint structure owned by
    /// `device`. Outstanding URBs complete as cancelled via the normal path.
    fn free_endpoint_resources(&mut self, device: DeviceId);

    /// Clears the hardware halt state of one endpoint.
    fn clear_halt(&mut self, device: DeviceId, endpoint: u8, direction: Direction);

    /// Fills `buf` with the hub-change bitmap; returns 0 when nothing
    /// changed.
    fn hub_status_data(&mut self, buf: &mut [u8]) -> usize;

    /// Services one root-hub control request synchronously. IN data lands at
    /// the front of `data`; the returned length is the actual length.
    fn hub_control(&mut self, setup: SetupPacket, data: &mut [u8]) -> UsbResult<usize>;

    /// Services pending interrupt causes (completion processing, deferred
    /// deletion, fault detection).
    fn process_interrupt(&mut self) -> IrqOutcome;

    /// Fails every in-flight URB with `ShuttingDown` and returns them for
    /// giveback.
    fn kill_all(&mut self) -> Vec<Urb>;
}

/// Submission failure, returning URB ownership to the caller.
#[derive(Debug)]
pub struct SubmitError {
    pub error: UsbError,
    pub urb: Urb,
}

impl core::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "submit failed: {}", self.error)
    }
}

impl std::error::Error for SubmitError {}

/// Outcome of an unlink request. The URB's final status is always delivered
/// at giveback, not here.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnlinkOutcome {
    /// The completion callback has already run (synchronous unlink).
    Completed,
    /// Cancellation is underway; giveback arrives on the normal path.
    InProgress,
}

struct RootHubPipe {
    device: DeviceId,
    pending: Option<Urb>,
    countdown_ms: u32,
}

struct Inner {
    state: HcState,
    driver: Box<dyn HcDriver>,
    registry: DeviceRegistry,
    bandwidth: FrameBandwidth,
    next_urb: u64,
    sync_unlinks: HashMap<UrbId, SyncSender<()>>,
    root_hub: RootHubPipe,
    needs_restart: bool,
}

/// One host controller instance: generic core plus its driver.
pub struct Hcd {
    inner: Mutex<Inner>,
}

impl Hcd {
    /// Binds the core to a probed controller driver and registers the
    /// virtual root-hub device for the enumeration layer to find.
    pub fn new(driver: Box<dyn HcDriver>) -> UsbResult<Self> {
        let mut registry = DeviceRegistry::new();
        let root_hub = registry.alloc_root_hub(UsbSpeed::Full)?;
        debug!(%root_hub, "registered virtual root hub");
        Ok(Self {
            inner: Mutex::new(Inner {
                state: HcState::Ready,
                driver,
                registry,
                bandwidth: FrameBandwidth::new(),
                next_urb: 1,
                sync_unlinks: HashMap::new(),
                root_hub: RootHubPipe {
                    device: root_hub,
                    pending: None,
                    countdown_ms: ROOT_HUB_POLL_MS,
                },
                needs_restart: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking completion callback must not wedge every subsequent
        // submit; the inner state is consistent at every unlock point.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The controller's virtual root-hub device.
    pub fn root_hub(&self) -> DeviceId {
        self.lock().root_hub.device
    }

    pub fn state(&self) -> HcState {
        self.lock().state
    }

    // ----- device registry surface -----

    pub fn alloc_device(&self, speed: UsbSpeed) -> UsbResult<DeviceId> {
        self.lock().registry.alloc(speed)
    }

    pub fn free_device(&self, device: DeviceId) -> UsbResult<()> {
        let mut inner = self.lock();
        inner.registry.free(device)?;
        inner.driver.free_endpoint_resources(device);
        Ok(())
    }

    /// Explicit stall recovery: clears both the registry flag and the
    /// hardware halt so the endpoint can be used again.
    pub fn clear_halt(&self, device: DeviceId, endpoint: u8, direction: Direction) -> UsbResult<()> {
        let mut inner = self.lock();
        if !inner.registry.is_live(device) {
            return Err(UsbError::NoDevice);
        }
        inner.registry.clear_halted(device, endpoint, direction);
        inner.driver.clear_halt(device, endpoint, direction);
        Ok(())
    }

    pub fn frame_number(&self, device: DeviceId) -> UsbResult<u16> {
        let mut inner = self.lock();
        if !inner.registry.is_live(device) {
            return Err(UsbError::NoDevice);
        }
        Ok(inner.driver.frame_number())
    }

    // ----- request lifecycle -----

    /// Validates and queues a URB. On success the core owns the URB until
    /// its single giveback; the returned id can be passed to unlink at any
    /// point before that.
    pub fn submit(&self, mut urb: Urb) -> Result<UrbId, SubmitError> {
        let mut inner = self.lock();

        if let Err(error) = validate(&inner, &urb) {
            return Err(SubmitError { error, urb });
        }

        let id = UrbId(inner.next_urb);
        inner.next_urb += 1;
        urb.id = Some(id);

        // Periodic pipes pass admission control before touching hardware.
        if urb.pipe.transfer.is_periodic() {
            urb.interval = snap_interval(urb.interval);
            let bytes = match urb.pipe.transfer {
                TransferType::Interrupt => urb.buffer.len(),
                _ => urb
                    .iso_packets
                    .iter()
                    .map(|p| p.length)
                    .max()
                    .unwrap_or(0),
            };
            let ns = bus_time_ns(
                urb.pipe.speed,
                urb.pipe.direction == Direction::In,
                urb.pipe.transfer == TransferType::Isochronous,
                bytes,
            );
            if let Err(error) = inner.bandwidth.claim(ns) {
                warn!(%id, ns, "periodic admission rejected");
                return Err(SubmitError { error, urb });
            }
            urb.reserved_bandwidth_ns = ns;
        }

        if inner.registry.is_root_hub(urb.pipe.device) {
            return self.submit_root_hub(inner, urb, id);
        }

        if let Err(error) = inner.registry.add_pending(urb.pipe.device, id) {
            let ns = urb.reserved_bandwidth_ns;
            inner.bandwidth.release(ns);
            return Err(SubmitError { error, urb });
        }

        match inner.driver.enqueue(urb) {
            Ok(()) => Ok(id),
            Err((mut urb, error)) => {
                inner.registry.remove_pending(urb.pipe.device, id);
                let ns = urb.reserved_bandwidth_ns;
                inner.bandwidth.release(ns);
                urb.reserved_bandwidth_ns = 0;
                urb.id = None;
                Err(SubmitError { error, urb })
            }
        }
    }

    /// Root-hub pipes never reach hardware: control requests are answered
    /// synchronously in software and the status pipe parks on the poll
    /// timer.
    fn submit_root_hub(
        &self,
        mut inner: MutexGuard<'_, Inner>,
        mut urb: Urb,
        id: UrbId,
    ) -> Result<UrbId, SubmitError> {
        match urb.pipe.transfer {
            TransferType::Control => {
                let setup = match urb.setup {
                    Some(setup) => setup,
                    None => {
                        return Err(SubmitError {
                            error: UsbError::BadParameter,
                            urb,
                        })
                    }
                };
                match inner.driver.hub_control(setup, &mut urb.buffer) {
                    Ok(n) => {
                        urb.actual_length = n;
                        urb.status = UrbStatus::Ok;
                    }
                    Err(error) => urb.status = UrbStatus::Failed(error),
                }
                drop(inner);
                self.give_back(urb);
                Ok(id)
            }
            TransferType::Interrupt => {
                if inner.root_hub.pending.is_some() {
                    let ns = urb.reserved_bandwidth_ns;
                    inner.bandwidth.release(ns);
                    return Err(SubmitError {
                        error: UsbError::InProgress,
                        urb,
                    });
                }
                let device = urb.pipe.device;
                if let Err(error) = inner.registry.add_pending(device, id) {
                    let ns = urb.reserved_bandwidth_ns;
                    inner.bandwidth.release(ns);
                    return Err(SubmitError { error, urb });
                }
                inner.root_hub.pending = Some(urb);
                Ok(id)
            }
            _ => {
                let ns = urb.reserved_bandwidth_ns;
                inner.bandwidth.release(ns);
                Err(SubmitError {
                    error: UsbError::BadParameter,
                    urb,
                })
            }
        }
    }

    /// Synchronous unlink: blocks until the URB's completion callback has
    /// run, unless the URB carries `ASYNC_UNLINK`. Idempotent: a second
    /// unlink of the same URB reports `TooLate`.
    pub fn unlink(&self, id: UrbId) -> UsbResult<UnlinkOutcome> {
        let rx = {
            let mut inner = self.lock();

            if let Some(urb) = take_root_hub_pending(&mut inner, id) {
                drop(inner);
                self.give_back(urb);
                return Ok(UnlinkOutcome::Completed);
            }

            if inner.sync_unlinks.contains_key(&id) {
                return Err(UsbError::TooLate);
            }

            let flags = inner.driver.dequeue(id)?;
            if flags.contains(UrbFlags::ASYNC_UNLINK) {
                return Ok(UnlinkOutcome::InProgress);
            }

            // Substitute a one-shot rendezvous for the caller; the giveback
            // path fires it right after the real completion callback.
            let (tx, rx) = mpsc::sync_channel(1);
            inner.sync_unlinks.insert(id, tx);
            rx
        };

        match rx.recv_timeout(SYNC_UNLINK_TIMEOUT) {
            Ok(()) => Ok(UnlinkOutcome::Completed),
            Err(_) => {
                self.lock().sync_unlinks.remove(&id);
                warn!(%id, "synchronous unlink timed out; completion will arrive later");
                Err(UsbError::Timeout)
            }
        }
    }

    /// Asynchronous unlink: mandatory from interrupt/atomic context. Marks
    /// the URB cancelled and returns; cleanup happens on the completion
    /// path.
    pub fn unlink_async(&self, id: UrbId) -> UsbResult<UnlinkOutcome> {
        let mut inner = self.lock();
        if let Some(urb) = take_root_hub_pending(&mut inner, id) {
            drop(inner);
            self.give_back(urb);
            return Ok(UnlinkOutcome::Completed);
        }
        if inner.sync_unlinks.contains_key(&id) {
            return Err(UsbError::TooLate);
        }
        inner.driver.dequeue(id)?;
        Ok(UnlinkOutcome::InProgress)
    }

    // ----- interrupt and timer entry points -----

    /// Platform IRQ entry point. Returns true if the interrupt belonged to
    /// this controller.
    pub fn interrupt(&self) -> bool {
        let outcome = {
            let mut inner = self.lock();
            let outcome = inner.driver.process_interrupt();
            if outcome.fault {
                error!("unrecoverable controller fault; requesting restart from thread context");
                inner.state = HcState::Halt;
                inner.needs_restart = true;
            }
            outcome
        };
        for urb in outcome.completions {
            self.give_back(urb);
        }
        outcome.handled
    }

    /// Advances the root-hub poll timer by `ms` milliseconds. The platform
    /// drives this from its timer tick; it is deliberately distinct from
    /// the hardware interrupt path.
    pub fn tick_ms(&self, ms: u32) {
        let completed = {
            let mut inner = self.lock();
            if inner.state != HcState::Running {
                return;
            }
            inner.root_hub.countdown_ms = inner.root_hub.countdown_ms.saturating_sub(ms);
            if inner.root_hub.countdown_ms > 0 {
                return;
            }
            inner.root_hub.countdown_ms = ROOT_HUB_POLL_MS;

            let Some(mut urb) = inner.root_hub.pending.take() else {
                return;
            };
            let mut bitmap = [0u8; 8];
            let n = inner.driver.hub_status_data(&mut bitmap);
            if n == 0 {
                // Nothing changed: silently re-arm.
                inner.root_hub.pending = Some(urb);
                return;
            }
            let len = n.min(urb.buffer.len());
            urb.buffer[..len].copy_from_slice(&bitmap[..len]);
            urb.actual_length = len;
            urb.status = UrbStatus::Ok;
            urb
        };
        self.give_back(completed);
    }

    // ----- controller lifecycle -----

    pub fn start(&self) -> UsbResult<()> {
        let mut inner = self.lock();
        match inner.state {
            HcState::Ready | HcState::Halt => {}
            _ => return Err(UsbError::BadParameter),
        }
        inner.driver.start()?;
        inner.state = HcState::Running;
        debug!("controller running");
        Ok(())
    }

    /// Stops the controller, failing every in-flight URB with
    /// `ShuttingDown`.
    pub fn stop(&self) {
        let killed = {
            let mut inner = self.lock();
            inner.state = HcState::Halt;
            let killed = inner.driver.kill_all();
            inner.driver.stop();
            killed
        };
        for urb in killed {
            self.give_back(urb);
        }
    }

    pub fn suspend(&self) -> UsbResult<()> {
        let mut inner = self.lock();
        if inner.state != HcState::Running {
            return Err(UsbError::BadParameter);
        }
        inner.state = HcState::Quiescing;
        match inner.driver.suspend() {
            Ok(()) => {
                inner.state = HcState::Suspended;
                debug!("controller suspended");
                Ok(())
            }
            Err(e) => {
                inner.state = HcState::Running;
                Err(e)
            }
        }
    }

    pub fn resume(&self) -> UsbResult<()> {
        {
            let mut inner = self.lock();
            if inner.state != HcState::Suspended {
                return Err(UsbError::BadParameter);
            }
            inner.state = HcState::Resuming;
            match inner.driver.resume() {
                Ok(()) => {
                    inner.state = HcState::Running;
                    debug!("controller resumed");
                }
                Err(e) => {
                    inner.state = HcState::Suspended;
                    return Err(e);
                }
            }
        }
        // Drain whatever the done queue accumulated while suspended.
        self.interrupt();
        Ok(())
    }

    /// True after an unrecoverable fault; the platform must call
    /// [`Hcd::restart`] from thread context.
    pub fn needs_restart(&self) -> bool {
        self.lock().needs_restart
    }

    /// Full hard-reset recovery. Never called from interrupt context.
    pub fn restart(&self) -> UsbResult<()> {
        let killed = {
            let mut inner = self.lock();
            let killed = inner.driver.kill_all();
            inner.driver.stop();
            inner.state = HcState::Halt;
            killed
        };
        for urb in killed {
            self.give_back(urb);
        }
        let mut inner = self.lock();
        inner.driver.start()?;
        inner.state = HcState::Running;
        inner.needs_restart = false;
        debug!("controller restarted after fault");
        Ok(())
    }

    // ----- giveback -----

    /// The single event returning a completed URB to its client: invokes the
    /// completion callback with the lock released, then settles accounting
    /// and either retires the URB or re-queues it (interrupt pipes with a
    /// polling interval persist until an explicit unlink).
    fn give_back(&self, mut urb: Urb) {
        let id = urb.id.expect("in-flight URB always has an id");

        // A stall halts the endpoint before the client can see the failure,
        // so a resubmit from the callback observes the halt. Control pipes
        // see protocol stalls, which never latch.
        if urb.status == UrbStatus::Failed(UsbError::Transfer(TransferError::Stall))
            && urb.pipe.transfer != TransferType::Control
        {
            self.lock()
                .registry
                .set_halted(urb.pipe.device, urb.pipe.endpoint, urb.pipe.direction);
        }

        let mut callback = urb.take_callback();
        if let Some(cb) = callback.as_mut() {
            cb(&mut urb);
        }

        let mut inner = self.lock();
        let device = urb.pipe.device;

        let wants_resubmit = urb.pipe.transfer == TransferType::Interrupt
            && urb.interval > 0
            && urb.status == UrbStatus::Ok
            && !inner.sync_unlinks.contains_key(&id)
            && inner.state == HcState::Running
            && inner.registry.is_live(device);

        let mut retired = Some(urb);
        if wants_resubmit {
            let mut urb = retired.take().expect("urb present");
            if let Some(cb) = callback.take() {
                urb.put_callback(cb);
            }
            urb.reset_for_resubmit();
            if inner.registry.is_root_hub(device) {
                inner.root_hub.pending = Some(urb);
            } else {
                match inner.driver.enqueue(urb) {
                    Ok(()) => {}
                    Err((urb, e)) => {
                        warn!(%id, error = %e, "interrupt auto-resubmit failed");
                        retired = Some(urb);
                    }
                }
            }
        }

        if let Some(urb) = retired {
            inner.registry.remove_pending(device, id);
            let ns = urb.reserved_bandwidth_ns;
            inner.bandwidth.release(ns);
        }

        if let Some(tx) = inner.sync_unlinks.remove(&id) {
            let _ = tx.send(());
        }
    }
}

/// Pulls the parked root-hub status URB if `id` names it, marking it
/// cancelled.
fn take_root_hub_pending(inner: &mut Inner, id: UrbId) -> Option<Urb> {
    let pending = inner.root_hub.pending.as_ref()?;
    if pending.id() != Some(id) {
        return None;
    }
    let mut urb = inner.root_hub.pending.take()?;
    urb.status = UrbStatus::Failed(UsbError::Cancelled);
    Some(urb)
}

fn validate(inner: &Inner, urb: &Urb) -> UsbResult<()> {
    if inner.state != HcState::Running {
        return Err(UsbError::ShuttingDown);
    }
    if !inner.registry.is_live(urb.pipe.device) {
        return Err(UsbError::NoDevice);
    }
    if urb.pipe.max_packet == 0 {
        return Err(UsbError::BadParameter);
    }
    if urb.pipe.transfer != TransferType::Control
        && inner
            .registry
            .is_halted(urb.pipe.device, urb.pipe.endpoint, urb.pipe.direction)
    {
        return Err(UsbError::EndpointHalted);
    }

    let max_packet = urb.pipe.max_packet as usize;
    match urb.pipe.transfer {
        TransferType::Control => {
            let setup = urb.setup.ok_or(UsbError::BadParameter)?;
            // The buffer must cover the whole data stage in either direction.
            if urb.buffer.len() < setup.length as usize {
                return Err(UsbError::BadParameter);
            }
        }
        TransferType::Bulk => {
            if urb.setup.is_some() {
                return Err(UsbError::BadParameter);
            }
        }
        TransferType::Interrupt => {
            if urb.setup.is_some() || urb.buffer.len() > max_packet {
                return Err(UsbError::BadParameter);
            }
        }
        TransferType::Isochronous => {
            if urb.iso_packets.is_empty() {
                return Err(UsbError::BadParameter);
            }
            for packet in &urb.iso_packets {
                if packet.length > max_packet
                    || packet.offset + packet.length > urb.buffer.len()
                {
                    return Err(UsbError::BadParameter);
                }
            }
        }
    }
    Ok(())
}

/// Convenience constructor for a completion callback from a plain closure.
pub fn callback<F: FnMut(&mut Urb) + Send + 'static>(f: F) -> UrbCallback {
    Box::new(f)
}
