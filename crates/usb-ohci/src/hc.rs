//! OHCI controller driver.
//!
//! Implements the [`HcDriver`] vtable for an OHCI-class controller: endpoint
//! resolution and TD submission, done-list completion processing, the
//! frame-boundary deferred deletion engine, root-hub request translation and
//! the hardware lifecycle. All entry points run under the dispatch core's
//! per-controller lock.

use std::collections::HashMap;

use tracing::{debug, error, warn};

use usb_hcd::hcd::{HcDriver, IrqOutcome};
use usb_hcd::{
    DeviceId, Direction, HcBus, TransferType, Urb, UrbFlags, UrbId, UrbStatus, UsbError,
    UsbResult,
};

use crate::dma::{
    DmaRegion, Handle, ReverseMap, Slab, DESC_SLOT_SIZE, HCCA_ALIGN, HCCA_DONE_HEAD, HCCA_SIZE,
};
use crate::ed::{Ed, EdHandle, EdKey, EdState, ListKind, ED_HEAD_TOGGLE_CARRY, ED_PTR_MASK};
use crate::regs;
use crate::roothub::RootHub;
use crate::schedule::Schedule;
use crate::td::{self, DataPid, Td, TdHandle, TdKind, TdToggle, TD_DI_NONE, TD_MAX_DATA};

/// Bounded spins for reset/settle polls; the register read dominates, so
/// these are microseconds of real time.
const RESET_SPINS: usize = 1_000;
const SETTLE_SPINS: usize = 10_000;

/// Safety cap when walking the hardware-written done list.
const DONE_LIST_BUDGET: usize = 4_096;

/// Platform description of the DMA-consistent window the driver may carve
/// descriptors and staging buffers from.
#[derive(Clone, Copy, Debug)]
pub struct OhciConfig {
    pub dma_base: u32,
    pub dma_len: u32,
}

/// One planned hardware chunk of a URB.
#[derive(Clone, Copy, Debug)]
struct TdPlan {
    kind: TdKind,
    /// Offset into the URB data buffer.
    offset: usize,
    len: usize,
}

struct UrbRecord {
    urb: Urb,
    ed: EdHandle,
    td_count: usize,
    retired: usize,
    /// Staged DMA span for setup + data.
    span: Option<(u32, u32)>,
    cancelled: bool,
    error: Option<usb_hcd::TransferError>,
    /// Bytes moved by data-phase TDs only (setup/status never count).
    data_actual: usize,
}

pub struct Ohci {
    bus: Box<dyn HcBus>,
    irq: u32,
    dma_base: u32,
    dma_len: u32,
    hcca: u32,
    dma: DmaRegion,
    eds: Slab<Ed>,
    tds: Slab<Td>,
    reverse: ReverseMap,
    ed_map: HashMap<EdKey, EdHandle>,
    inflight: HashMap<UrbId, UrbRecord>,
    schedule: Schedule,
    /// Pending-removal lists selected by frame parity: the list the hardware
    /// might still be scanning is never the one being reaped.
    ed_rm: [Vec<EdHandle>; 2],
    root_hub: RootHub,
    disabled: bool,
    next_ed_seq: u64,
    frame_hi: u32,
    last_frame_lo: u16,
}

impl Ohci {
    /// Resets the controller, carves the HCCA out of the DMA window and
    /// reads the root-hub geometry. The controller is left halted; the core
    /// starts it.
    pub fn probe(mut bus: Box<dyn HcBus>, irq: u32, config: OhciConfig) -> UsbResult<Self> {
        let mut dma = DmaRegion::new(config.dma_base, config.dma_len);
        let hcca = dma.alloc(HCCA_SIZE, HCCA_ALIGN)?;

        let revision = bus.mmio_read(regs::HC_REVISION) & 0xFF;
        let num_ports = (bus.mmio_read(regs::HC_RH_DESCRIPTOR_A) & regs::RH_A_NDP_MASK) as u8;
        if num_ports == 0 {
            return Err(UsbError::NoDevice);
        }

        let mut ohci = Self {
            bus,
            irq,
            dma_base: config.dma_base,
            dma_len: config.dma_len,
            hcca,
            dma,
            eds: Slab::new(),
            tds: Slab::new(),
            reverse: ReverseMap::default(),
            ed_map: HashMap::new(),
            inflight: HashMap::new(),
            schedule: Schedule::new(),
            ed_rm: [Vec::new(), Vec::new()],
            root_hub: RootHub::new(num_ports),
            disabled: false,
            next_ed_seq: 0,
            frame_hi: 0,
            last_frame_lo: 0,
        };
        ohci.hw_reset()?;
        debug!(revision, num_ports, irq, "ohci controller probed");
        Ok(ohci)
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    // ----- hardware bring-up -----

    fn hw_reset(&mut self) -> UsbResult<()> {
        self.bus
            .mmio_write(regs::HC_COMMAND_STATUS, regs::CMDSTATUS_HCR);
        for _ in 0..RESET_SPINS {
            if self.bus.mmio_read(regs::HC_COMMAND_STATUS) & regs::CMDSTATUS_HCR == 0 {
                return Ok(());
            }
        }
        error!("controller reset did not complete");
        Err(UsbError::ShuttingDown)
    }

    fn hw_configure(&mut self) {
        let fi = regs::FM_INTERVAL_FI_DEFAULT;
        self.bus.mmio_write(
            regs::HC_FM_INTERVAL,
            regs::FM_INTERVAL_FIT | regs::fm_interval_fsmps(fi) | fi,
        );
        self.bus
            .mmio_write(regs::HC_PERIODIC_START, regs::periodic_start(fi));

        // Fresh HCCA: empty interrupt table, clear done head.
        for slot in 0..32u32 {
            self.bus.dma_write_u32(self.hcca + slot * 4, 0);
        }
        self.bus.dma_write_u32(self.hcca + HCCA_DONE_HEAD, 0);
        self.bus.mmio_write(regs::HC_HCCA, self.hcca);

        self.bus.mmio_write(regs::HC_CONTROL_HEAD_ED, 0);
        self.bus.mmio_write(regs::HC_CONTROL_CURRENT_ED, 0);
        self.bus.mmio_write(regs::HC_BULK_HEAD_ED, 0);
        self.bus.mmio_write(regs::HC_BULK_CURRENT_ED, 0);

        self.bus.mmio_write(
            regs::HC_CONTROL,
            regs::CONTROL_CBSR_4_TO_1
                | regs::CONTROL_PLE
                | regs::CONTROL_IE
                | regs::CONTROL_HCFS_OPERATIONAL,
        );

        // Ack stale causes, then enable everything but SF (armed on demand
        // by the deferred deletion engine).
        self.bus
            .mmio_write(regs::HC_INTERRUPT_STATUS, !regs::INT_MIE);
        self.bus.mmio_write(
            regs::HC_INTERRUPT_ENABLE,
            regs::INT_MIE
                | regs::INT_WDH
                | regs::INT_RD
                | regs::INT_UE
                | regs::INT_FNO
                | regs::INT_RHSC
                | regs::INT_SO,
        );

        // Global port power.
        self.bus.mmio_write(regs::HC_RH_STATUS, regs::RH_S_LPSC);
    }

    /// Rewrites every hardware list from software state; used after start
    /// and after a lost-power resume.
    fn restore_schedule(&mut self) {
        let control_head = self
            .schedule
            .write_async(ListKind::Control, &self.eds, &mut *self.bus);
        self.bus.mmio_write(regs::HC_CONTROL_HEAD_ED, control_head);
        let bulk_head = self
            .schedule
            .write_async(ListKind::Bulk, &self.eds, &mut *self.bus);
        self.bus.mmio_write(regs::HC_BULK_HEAD_ED, bulk_head);
        self.schedule
            .write_periodic(&self.eds, &mut *self.bus, self.hcca);
        self.update_list_enables();
        if control_head != 0 {
            self.bus
                .mmio_write(regs::HC_COMMAND_STATUS, regs::CMDSTATUS_CLF);
        }
        if bulk_head != 0 {
            self.bus
                .mmio_write(regs::HC_COMMAND_STATUS, regs::CMDSTATUS_BLF);
        }
        if !self.ed_rm[0].is_empty() || !self.ed_rm[1].is_empty() {
            self.bus.mmio_write(regs::HC_INTERRUPT_ENABLE, regs::INT_SF);
        }
    }

    /// List-enable bits follow the empty/non-empty transitions, and are
    /// never re-enabled while a removal is outstanding on that list.
    fn update_list_enables(&mut self) {
        let mut control = self.bus.mmio_read(regs::HC_CONTROL);
        let want_cle = !self.schedule.control.members.is_empty()
            && self.schedule.control.pending_removals == 0;
        let want_ble =
            !self.schedule.bulk.members.is_empty() && self.schedule.bulk.pending_removals == 0;
        if want_cle {
            control |= regs::CONTROL_CLE;
        } else {
            control &= !regs::CONTROL_CLE;
        }
        if want_ble {
            control |= regs::CONTROL_BLE;
        } else {
            control &= !regs::CONTROL_BLE;
        }
        self.bus.mmio_write(regs::HC_CONTROL, control);
    }

    /// 32-bit frame counter extended from the 16-bit hardware register.
    fn current_frame(&mut self) -> u32 {
        let lo = (self.bus.mmio_read(regs::HC_FM_NUMBER) & 0xFFFF) as u16;
        if lo < self.last_frame_lo {
            self.frame_hi += 1;
        }
        self.last_frame_lo = lo;
        (self.frame_hi << 16) | u32::from(lo)
    }

    // ----- endpoint resolution -----

    fn create_ed(&mut self, urb: &Urb) -> UsbResult<EdHandle> {
        let ed_addr = self.dma.alloc(DESC_SLOT_SIZE, DESC_SLOT_SIZE)?;
        let dummy_addr = match self.dma.alloc(DESC_SLOT_SIZE, DESC_SLOT_SIZE) {
            Ok(addr) => addr,
            Err(e) => {
                self.dma.free(ed_addr, DESC_SLOT_SIZE);
                return Err(e);
            }
        };

        let key = ed_key(urb);
        let list = match urb.pipe.transfer {
            TransferType::Control => ListKind::Control,
            TransferType::Bulk => ListKind::Bulk,
            TransferType::Interrupt => ListKind::Periodic,
            TransferType::Isochronous => ListKind::Iso,
        };
        let seq = self.next_ed_seq;
        self.next_ed_seq += 1;

        let ed_h = EdHandle(self.eds.insert(Ed {
            bus_addr: ed_addr,
            key,
            state: EdState::New,
            list,
            speed: urb.pipe.speed,
            max_packet: urb.pipe.max_packet,
            queue: Vec::new(),
            dummy: TdHandle(u32::MAX),
            interval: 1,
            branch: 0,
            load: 0,
            seq,
            rm_frame: 0,
            counted_removal: false,
        }));
        let dummy_h = TdHandle(self.tds.insert(Td::dummy(dummy_addr, ed_h)));
        self.eds.get_mut(ed_h.0).expect("just inserted").dummy = dummy_h;

        self.reverse.insert(ed_addr, Handle::Ed(ed_h));
        self.reverse.insert(dummy_addr, Handle::Td(dummy_h));

        let ed = self.eds.get(ed_h.0).expect("just inserted");
        ed.write_initial(&mut *self.bus, dummy_addr);

        self.ed_map.insert(key, ed_h);
        Ok(ed_h)
    }

    fn resolve_ed(&mut self, urb: &Urb) -> UsbResult<EdHandle> {
        let key = ed_key(urb);
        if let Some(&h) = self.ed_map.get(&key) {
            let ed = self.eds.get(h.0).expect("mapped ED is live");
            if ed.state.is_pending_delete() {
                // Mid-deletion endpoints take no new work.
                return Err(UsbError::ShuttingDown);
            }
            return Ok(h);
        }
        self.create_ed(urb)
    }

    /// Links an ED into its schedule structure if it is not already linked.
    fn link_ed(&mut self, h: EdHandle, urb: &Urb) {
        let (kind, ed_addr, state) = {
            let ed = self.eds.get(h.0).expect("live ED");
            (ed.list, ed.bus_addr, ed.state)
        };
        if state == EdState::Operational {
            return;
        }
        debug_assert!(
            matches!(state, EdState::New | EdState::Unlinked),
            "linking an ED in {state:?}"
        );

        match kind {
            ListKind::Control | ListKind::Bulk => {
                let tail_addr = self
                    .schedule
                    .async_list(kind)
                    .tail()
                    .map(|t| self.eds.get(t.0).expect("live ED").bus_addr);
                {
                    let ed = self.eds.get(h.0).expect("live ED");
                    ed.write_next(&mut *self.bus, 0);
                }
                match tail_addr {
                    Some(tail) => self.bus.dma_write_u32(tail + 12, ed_addr),
                    None => {
                        let reg = if kind == ListKind::Control {
                            regs::HC_CONTROL_HEAD_ED
                        } else {
                            regs::HC_BULK_HEAD_ED
                        };
                        self.bus.mmio_write(reg, ed_addr);
                    }
                }
                self.schedule.async_list(kind).members.push(h);
                self.update_list_enables();
            }
            ListKind::Periodic => {
                let interval = urb.interval.clamp(1, 32);
                let load = (urb.reserved_bandwidth_ns() / 1_000).max(1);
                let branch = self.schedule.least_loaded_branch(interval);
                {
                    let ed = self.eds.get_mut(h.0).expect("live ED");
                    ed.interval = interval;
                    ed.load = load;
                    ed.branch = branch;
                }
                self.schedule.add_branch_load(branch, interval, load);
                self.schedule.insert_periodic(h, &self.eds);
                self.schedule
                    .write_periodic(&self.eds, &mut *self.bus, self.hcca);
            }
            ListKind::Iso => {
                self.schedule.iso.push(h);
                self.schedule
                    .write_periodic(&self.eds, &mut *self.bus, self.hcca);
            }
        }
        self.eds.get_mut(h.0).expect("live ED").state = EdState::Operational;
    }

    // ----- TD submission -----

    fn fill_tds(
        &mut self,
        ed_h: EdHandle,
        id: UrbId,
        urb: &Urb,
        plan: &[TdPlan],
        span: Option<(u32, u32)>,
        fresh: Vec<u32>,
    ) {
        let n = plan.len();
        debug_assert_eq!(fresh.len(), n);

        let (old_dummy_h, old_dummy_addr) = {
            let ed = self.eds.get(ed_h.0).expect("live ED");
            let dummy = self.tds.get(ed.dummy.0).expect("live dummy TD");
            (ed.dummy, dummy.bus_addr)
        };

        // The current dummy becomes the first new TD; the last fresh slot is
        // the next dummy. Appending therefore only ever moves the tail.
        let mut addrs = Vec::with_capacity(n + 1);
        addrs.push(old_dummy_addr);
        addrs.extend(fresh);

        let data_base = span.map(|(base, _)| base).unwrap_or(0);
        let is_control = urb.pipe.transfer == TransferType::Control;
        let data_offset = if is_control { 8 } else { 0 };
        let data_dir = transfer_direction(urb);

        for (i, p) in plan.iter().enumerate() {
            let addr = addrs[i];
            let next = addrs[i + 1];
            let delay = if i + 1 == n { 1 } else { TD_DI_NONE };
            match p.kind {
                TdKind::Iso { packet } => {
                    let frame = urb.start_frame.wrapping_add(packet as u16);
                    let data = (data_base + data_offset + p.offset as u32, p.len as u32);
                    td::write_iso(
                        &mut *self.bus,
                        addr,
                        td::iso_control_word(frame, delay),
                        data,
                        next,
                    );
                }
                kind => {
                    let (pid, toggle, rounding) = general_td_shape(urb, plan, i, kind, data_dir);
                    let data = td_data_span(p, kind, data_base, data_offset);
                    let word = td::general_control_word(rounding, pid, delay, toggle);
                    td::write_general(&mut *self.bus, addr, word, data, next);
                }
            }
        }
        // Fresh dummy image: inert until the next append fills it.
        td::write_general(&mut *self.bus, addrs[n], 0, None, 0);

        // Software mirrors: the old dummy record is reused for TD 0.
        {
            let first = self.tds.get_mut(old_dummy_h.0).expect("live dummy TD");
            first.urb = Some(id);
            first.kind = plan[0].kind;
            first.data = td_data_span(&plan[0], plan[0].kind, data_base, data_offset);
            first.index = 0;
        }
        let mut handles = vec![old_dummy_h];
        for (i, p) in plan.iter().enumerate().skip(1) {
            let data = td_data_span(p, p.kind, data_base, data_offset);
            let h = TdHandle(self.tds.insert(Td {
                bus_addr: addrs[i],
                ed: ed_h,
                urb: Some(id),
                kind: p.kind,
                data,
                index: i,
            }));
            self.reverse.insert(addrs[i], Handle::Td(h));
            handles.push(h);
        }
        let new_dummy = TdHandle(self.tds.insert(Td::dummy(addrs[n], ed_h)));
        self.reverse.insert(addrs[n], Handle::Td(new_dummy));

        {
            let ed = self.eds.get_mut(ed_h.0).expect("live ED");
            ed.queue.extend(handles);
            ed.dummy = new_dummy;
        }
        // Publish: hardware sees the new work once the tail moves.
        let ed = self.eds.get(ed_h.0).expect("live ED");
        ed.write_tail(&mut *self.bus, addrs[n]);
    }

    // ----- deferred deletion -----

    /// Marks an ED for removal: skip bit now, splice and reclaim only in the
    /// frame-boundary handler. This mark-then-reap protocol is the only way
    /// hardware-owned lists are ever shrunk.
    fn defer_ed_removal(&mut self, h: EdHandle, target: EdState) {
        let frame = self.current_frame();
        let (state, kind) = {
            let ed = self.eds.get(h.0).expect("live ED");
            (ed.state, ed.list)
        };
        match state {
            EdState::PendingFullDelete => return,
            EdState::PendingUrbDelete => {
                if target == EdState::PendingFullDelete {
                    self.eds.get_mut(h.0).expect("live ED").state = target;
                }
                return;
            }
            _ => {}
        }

        let was_linked = state == EdState::Operational;
        let counted = was_linked && matches!(kind, ListKind::Control | ListKind::Bulk);
        {
            let ed = self.eds.get_mut(h.0).expect("live ED");
            ed.state = target;
            ed.rm_frame = frame;
            ed.counted_removal = counted;
        }
        {
            let ed = self.eds.get(h.0).expect("live ED");
            ed.set_skip(&mut *self.bus, true);
        }
        if counted {
            match kind {
                ListKind::Control => self.schedule.control.pending_removals += 1,
                ListKind::Bulk => self.schedule.bulk.pending_removals += 1,
                _ => {}
            }
            // The list bit drops immediately and stays off until the reaper
            // drains the removal queue.
            self.update_list_enables();
        }
        self.ed_rm[(frame & 1) as usize].push(h);
        self.bus.mmio_write(regs::HC_INTERRUPT_ENABLE, regs::INT_SF);
    }

    /// Frame-boundary reaper. Processes only the parity list the hardware is
    /// guaranteed to be done with: entries armed in frame F are reaped at the
    /// first start-of-frame whose parity matches F again, i.e. no earlier
    /// than F + 2, a full frame after the skip bit became visible.
    fn reap_removals(&mut self, out: &mut Vec<Urb>) {
        let frame = self.current_frame();
        let parity = (frame & 1) as usize;
        let taken = std::mem::take(&mut self.ed_rm[parity]);

        // Only entries armed at least two frames ago are safe: the skip bit
        // has then been visible across a full frame the hardware completed.
        // Younger entries (armed this frame, before this interrupt ran) wait
        // for the next same-parity boundary.
        let (ready, young): (Vec<EdHandle>, Vec<EdHandle>) = taken.into_iter().partition(|&h| {
            let ed = self.eds.get(h.0).expect("removal entry names a live ED");
            frame >= ed.rm_frame + 2
        });
        self.ed_rm[parity] = young;

        let mut touched_async = [false; 2]; // control, bulk
        let mut touched_periodic = false;

        for h in ready {
            let (state, kind, counted, was_member) = {
                let ed = self.eds.get(h.0).expect("removal entry names a live ED");
                (
                    ed.state,
                    ed.list,
                    ed.counted_removal,
                    self.member_of_schedule(h, ed.list),
                )
            };

            match kind {
                ListKind::Control => touched_async[0] = true,
                ListKind::Bulk => touched_async[1] = true,
                _ => touched_periodic = true,
            }

            // Retire every TD belonging to a cancelled URB (all of them for
            // a full delete), computing final partial lengths first.
            let full_delete = state == EdState::PendingFullDelete;
            self.splice_cancelled_tds(h, full_delete, out);

            if counted {
                match kind {
                    ListKind::Control => {
                        self.schedule.control.pending_removals =
                            self.schedule.control.pending_removals.saturating_sub(1)
                    }
                    ListKind::Bulk => {
                        self.schedule.bulk.pending_removals =
                            self.schedule.bulk.pending_removals.saturating_sub(1)
                    }
                    _ => {}
                }
            }

            let queue_empty = self.eds.get(h.0).expect("live ED").queue.is_empty();
            if full_delete {
                self.unlink_from_schedule(h, was_member);
                self.free_ed(h);
            } else if queue_empty {
                self.unlink_from_schedule(h, was_member);
                let ed = self.eds.get_mut(h.0).expect("live ED");
                ed.state = EdState::Unlinked;
                ed.counted_removal = false;
            } else {
                // Work from other URBs survives: back into service.
                {
                    let ed = self.eds.get_mut(h.0).expect("live ED");
                    ed.state = EdState::Operational;
                    ed.counted_removal = false;
                }
                let ed = self.eds.get(h.0).expect("live ED");
                ed.set_skip(&mut *self.bus, false);
            }
        }

        // Restore hardware heads and processing-enable bits once the lists
        // are consistent again.
        if touched_async[0] {
            let head = self
                .schedule
                .write_async(ListKind::Control, &self.eds, &mut *self.bus);
            self.bus.mmio_write(regs::HC_CONTROL_HEAD_ED, head);
            self.bus.mmio_write(regs::HC_CONTROL_CURRENT_ED, 0);
            if head != 0 {
                self.bus
                    .mmio_write(regs::HC_COMMAND_STATUS, regs::CMDSTATUS_CLF);
            }
        }
        if touched_async[1] {
            let head = self
                .schedule
                .write_async(ListKind::Bulk, &self.eds, &mut *self.bus);
            self.bus.mmio_write(regs::HC_BULK_HEAD_ED, head);
            self.bus.mmio_write(regs::HC_BULK_CURRENT_ED, 0);
            if head != 0 {
                self.bus
                    .mmio_write(regs::HC_COMMAND_STATUS, regs::CMDSTATUS_BLF);
            }
        }
        if touched_periodic {
            self.schedule
                .write_periodic(&self.eds, &mut *self.bus, self.hcca);
        }
        self.update_list_enables();

        if self.ed_rm[0].is_empty() && self.ed_rm[1].is_empty() {
            self.bus
                .mmio_write(regs::HC_INTERRUPT_DISABLE, regs::INT_SF);
        }
    }

    fn member_of_schedule(&self, h: EdHandle, kind: ListKind) -> bool {
        match kind {
            ListKind::Control => self.schedule.control.members.contains(&h),
            ListKind::Bulk => self.schedule.bulk.members.contains(&h),
            ListKind::Periodic => self.schedule.periodic.contains(&h),
            ListKind::Iso => self.schedule.iso.contains(&h),
        }
    }

    /// Splices cancelled TDs out of an ED's chain and retires them with
    /// final lengths. Safe only from the reaper (or with the ED halted).
    fn splice_cancelled_tds(&mut self, ed_h: EdHandle, all: bool, out: &mut Vec<Urb>) {
        let queue = self.eds.get(ed_h.0).expect("live ED").queue.clone();
        let mut doomed = Vec::new();
        for td_h in queue {
            let urb_id = match self.tds.get(td_h.0).and_then(|t| t.urb) {
                Some(id) => id,
                None => continue,
            };
            let cancelled = all
                || self
                    .inflight
                    .get(&urb_id)
                    .map(|rec| rec.cancelled)
                    .unwrap_or(true);
            if cancelled {
                doomed.push((td_h, urb_id));
            }
        }

        for (td_h, urb_id) in doomed {
            // A partially progressed TD still reports the bytes it moved.
            let (addr, kind, data) = {
                let t = self.tds.get(td_h.0).expect("live TD");
                (t.bus_addr, t.kind, t.data)
            };
            let actual = match data {
                Some((base, len)) => {
                    let cbp = self.bus.dma_read_u32(addr + 4);
                    if cbp == 0 {
                        0 // never started (or fully consumed; cancelled TDs report conservatively)
                    } else {
                        cbp.saturating_sub(base).min(len)
                    }
                }
                None => 0,
            };
            if let Some(rec) = self.inflight.get_mut(&urb_id) {
                if kind.counts_bytes() {
                    rec.data_actual += actual as usize;
                }
                rec.retired += 1;
            }
            self.free_td(td_h);
            {
                let ed = self.eds.get_mut(ed_h.0).expect("live ED");
                ed.queue.retain(|&t| t != td_h);
            }
            self.finalize_if_done(urb_id, out);
        }

        self.rewrite_td_chain(ed_h);
    }

    /// Rewrites an ED's TD chain (and head pointer) to match the software
    /// queue, preserving the toggle-carry bit. Halt is cleared: the chain is
    /// only rewritten once the offending work has been removed.
    fn rewrite_td_chain(&mut self, ed_h: EdHandle) {
        let (ed_addr, queue, dummy_addr, old_head) = {
            let ed = self.eds.get(ed_h.0).expect("live ED");
            let dummy_addr = self.tds.get(ed.dummy.0).expect("live dummy").bus_addr;
            let head = ed.read_head(&mut *self.bus);
            (ed.bus_addr, ed.queue.clone(), dummy_addr, head)
        };
        let mut next = dummy_addr;
        for &td_h in queue.iter().rev() {
            let addr = self.tds.get(td_h.0).expect("live TD").bus_addr;
            self.bus.dma_write_u32(addr + 8, next);
            next = addr;
        }
        let head = next | (old_head & ED_HEAD_TOGGLE_CARRY);
        self.bus.dma_write_u32(ed_addr + 8, head);
    }

    fn unlink_from_schedule(&mut self, h: EdHandle, was_member: bool) {
        if !was_member {
            return;
        }
        let (kind, branch, interval, load) = {
            let ed = self.eds.get(h.0).expect("live ED");
            (ed.list, ed.branch, ed.interval, ed.load)
        };
        self.schedule.remove_member(kind, h);
        if kind == ListKind::Periodic {
            self.schedule.remove_branch_load(branch, interval, load);
        }
    }

    fn free_td(&mut self, h: TdHandle) {
        if let Some(td) = self.tds.remove(h.0) {
            self.reverse.remove(td.bus_addr);
            self.dma.free(td.bus_addr, DESC_SLOT_SIZE);
        }
    }

    /// Full ED teardown: dummy TD, reverse entries and the DMA slots go; the
    /// endpoint key becomes reusable.
    fn free_ed(&mut self, h: EdHandle) {
        let Some(ed) = self.eds.remove(h.0) else {
            return;
        };
        self.free_td(ed.dummy);
        self.reverse.remove(ed.bus_addr);
        self.dma.free(ed.bus_addr, DESC_SLOT_SIZE);
        self.ed_map.remove(&ed.key);
    }

    // ----- completion processing -----

    /// Drains the hardware's most-recent-first done list, restoring FIFO
    /// order before retiring.
    fn process_done_list(&mut self, head: u32, out: &mut Vec<Urb>) {
        let mut addrs = Vec::new();
        let mut addr = head & ED_PTR_MASK;
        while addr != 0 && addrs.len() < DONE_LIST_BUDGET {
            if self.reverse.lookup(addr).is_none() {
                warn!(addr, "done list references an unknown descriptor");
                break;
            }
            addrs.push(addr);
            addr = self.bus.dma_read_u32(addr + 8) & ED_PTR_MASK;
        }
        addrs.reverse();
        for addr in addrs {
            self.retire_done_td(addr, out);
        }
    }

    fn retire_done_td(&mut self, addr: u32, out: &mut Vec<Urb>) {
        let Some(Handle::Td(td_h)) = self.reverse.lookup(addr) else {
            warn!(addr, "done list entry is not a TD");
            return;
        };
        let (ed_h, urb_id, kind, data) = {
            let t = self.tds.get(td_h.0).expect("reverse-mapped TD is live");
            (t.ed, t.urb, t.kind, t.data)
        };
        let Some(urb_id) = urb_id else {
            warn!(addr, "dummy TD retired by hardware");
            return;
        };

        let word0 = self.bus.dma_read_u32(addr);
        let cc = (word0 >> td::TD_CC_SHIFT) & 0xF;

        // Per-TD accounting. Hardware leaves CBP pointing at the first
        // untransferred byte, or 0 when the span was fully consumed.
        let (moved, wire_error) = match kind {
            TdKind::Iso { packet } => {
                let psw = self.bus.dma_read_u16(addr + td::ITD_PSW0);
                let pcc = u32::from(psw >> td::PSW_CC_SHIFT) & 0xF;
                let err = td::condition_code_to_error(pcc);
                let size = usize::from(psw & td::PSW_SIZE_MASK);
                let len = data.map(|(_, l)| l as usize).unwrap_or(0);
                // OUT packets report size 0 on success; the whole span went.
                let moved = if err.is_none() && size == 0 { len } else { size };
                if let Some(rec) = self.inflight.get_mut(&urb_id) {
                    if let Some(p) = rec.urb.iso_packets.get_mut(packet) {
                        p.actual_length = moved;
                        p.status = err;
                    }
                }
                // Per-packet errors never fail the whole isochronous URB.
                (moved, None)
            }
            _ => {
                let cbp = self.bus.dma_read_u32(addr + 4);
                let moved = match data {
                    Some((base, len)) => {
                        if cbp == 0 {
                            len as usize
                        } else {
                            cbp.saturating_sub(base).min(len) as usize
                        }
                    }
                    None => 0,
                };
                (moved, td::condition_code_to_error(cc))
            }
        };

        {
            let ed = self.eds.get_mut(ed_h.0).expect("live ED");
            ed.queue.retain(|&t| t != td_h);
        }
        self.free_td(td_h);

        let fatal = if let Some(rec) = self.inflight.get_mut(&urb_id) {
            if kind.counts_bytes() {
                rec.data_actual += moved;
            }
            if let Some(e) = wire_error {
                if rec.error.is_none() {
                    rec.error = Some(e);
                }
            }
            rec.retired += 1;
            wire_error.is_some()
        } else {
            warn!(%urb_id, "completion for a URB that is no longer in flight");
            false
        };

        if fatal {
            // The hardware halted the ED; the rest of this URB's chain will
            // never run. Retire it now, while the ED is quiescent. Only a
            // stall keeps the endpoint halted afterwards; the client must
            // clear that one explicitly.
            let keep_halted = matches!(
                self.inflight.get(&urb_id).and_then(|r| r.error),
                Some(usb_hcd::TransferError::Stall)
            );
            self.abort_remaining_tds(urb_id, ed_h, keep_halted);
        }

        self.finalize_if_done(urb_id, out);
    }

    /// Retires the unreached TDs of a failed URB and mends the chain. The ED
    /// is halted at this point, so the hardware is not walking it.
    fn abort_remaining_tds(&mut self, urb_id: UrbId, ed_h: EdHandle, keep_halted: bool) {
        let queue = self.eds.get(ed_h.0).expect("live ED").queue.clone();
        for td_h in queue {
            let belongs = self.tds.get(td_h.0).map(|t| t.urb == Some(urb_id)) == Some(true);
            if !belongs {
                continue;
            }
            self.free_td(td_h);
            let ed = self.eds.get_mut(ed_h.0).expect("live ED");
            ed.queue.retain(|&t| t != td_h);
            if let Some(rec) = self.inflight.get_mut(&urb_id) {
                rec.retired += 1;
            }
        }
        self.rewrite_td_chain(ed_h);
        if keep_halted {
            // rewrite_td_chain cleared the hardware halt; re-assert it so
            // the endpoint stays quiescent until the client clears it.
            let ed = self.eds.get(ed_h.0).expect("live ED");
            let head = ed.read_head(&mut *self.bus);
            ed.write_head(&mut *self.bus, head | crate::ed::ED_HEAD_HALTED);
        }
    }

    /// Exactly-once giveback: fires when the retired-TD counter reaches the
    /// URB's TD count.
    fn finalize_if_done(&mut self, urb_id: UrbId, out: &mut Vec<Urb>) {
        let done = match self.inflight.get(&urb_id) {
            Some(rec) => {
                debug_assert!(rec.retired <= rec.td_count, "retired counter overran");
                rec.retired == rec.td_count
            }
            None => false,
        };
        if !done {
            return;
        }
        let mut rec = self.inflight.remove(&urb_id).expect("checked above");

        if let Some((base, len)) = rec.span {
            let is_control = rec.urb.pipe.transfer == TransferType::Control;
            let data_base = if is_control { base + 8 } else { base };
            if transfer_direction(&rec.urb) == Direction::In && !rec.urb.buffer.is_empty() {
                let mut staged = vec![0u8; rec.urb.buffer.len()];
                self.bus.dma_read(data_base, &mut staged);
                rec.urb.buffer.copy_from_slice(&staged);
            }
            self.dma.free(base, len);
        }

        rec.urb.actual_length = rec.data_actual;
        rec.urb.status = if rec.cancelled {
            UrbStatus::Failed(UsbError::Cancelled)
        } else if let Some(e) = rec.error {
            UrbStatus::Failed(UsbError::Transfer(e))
        } else {
            UrbStatus::Ok
        };
        out.push(rec.urb);

        // An idle operational control/bulk ED leaves the schedule at the
        // next frame boundary; its head and tail now point at the same dummy
        // TD. Periodic EDs stay linked: interrupt pipes resubmit through the
        // core and isochronous streams keep their reserved slots until an
        // explicit unlink.
        let (idle, state, kind) = {
            let ed = self.eds.get(rec.ed.0).expect("live ED");
            (ed.queue.is_empty(), ed.state, ed.list)
        };
        if idle
            && state == EdState::Operational
            && matches!(kind, ListKind::Control | ListKind::Bulk)
        {
            self.defer_ed_removal(rec.ed, EdState::PendingUrbDelete);
        }
    }

    /// Unrecoverable fault: disable the controller and fail everything. The
    /// restart itself is the platform's job, from thread context.
    fn die(&mut self) -> Vec<Urb> {
        self.disabled = true;
        self.bus
            .mmio_write(regs::HC_INTERRUPT_DISABLE, regs::INT_MIE);
        self.bus.mmio_write(regs::HC_CONTROL, regs::CONTROL_HCFS_RESET);
        self.teardown_all()
    }

    /// Drops every descriptor structure and returns the in-flight URBs
    /// failed with `ShuttingDown`.
    fn teardown_all(&mut self) -> Vec<Urb> {
        let mut ids: Vec<UrbId> = self.inflight.keys().copied().collect();
        ids.sort_unstable();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let mut rec = self.inflight.remove(&id).expect("key just listed");
            rec.urb.status = UrbStatus::Failed(UsbError::ShuttingDown);
            out.push(rec.urb);
        }

        self.eds = Slab::new();
        self.tds = Slab::new();
        self.reverse = ReverseMap::default();
        self.ed_map.clear();
        self.schedule = Schedule::new();
        self.ed_rm = [Vec::new(), Vec::new()];
        self.dma = DmaRegion::new(self.dma_base, self.dma_len);
        self.hcca = self
            .dma
            .alloc(HCCA_SIZE, HCCA_ALIGN)
            .expect("fresh window fits the HCCA");
        out
    }
}

impl HcDriver for Ohci {
    fn start(&mut self) -> UsbResult<()> {
        self.hw_reset()?;
        self.disabled = false;
        self.hw_configure();
        self.restore_schedule();
        Ok(())
    }

    fn stop(&mut self) {
        self.bus
            .mmio_write(regs::HC_INTERRUPT_DISABLE, regs::INT_MIE);
        self.bus.mmio_write(regs::HC_CONTROL, regs::CONTROL_HCFS_RESET);
    }

    fn suspend(&mut self) -> UsbResult<()> {
        let mut control = self.bus.mmio_read(regs::HC_CONTROL);
        control &= !(regs::CONTROL_PLE | regs::CONTROL_IE | regs::CONTROL_CLE | regs::CONTROL_BLE);
        self.bus.mmio_write(regs::HC_CONTROL, control);

        // Let in-flight frame activity settle across one frame boundary.
        let frame = self.bus.mmio_read(regs::HC_FM_NUMBER);
        for _ in 0..SETTLE_SPINS {
            if self.bus.mmio_read(regs::HC_FM_NUMBER) != frame {
                break;
            }
        }

        let control = (self.bus.mmio_read(regs::HC_CONTROL) & !regs::CONTROL_HCFS_MASK)
            | regs::CONTROL_HCFS_SUSPEND;
        self.bus.mmio_write(regs::HC_CONTROL, control);
        Ok(())
    }

    fn resume(&mut self) -> UsbResult<()> {
        let control = self.bus.mmio_read(regs::HC_CONTROL);
        match control & regs::CONTROL_HCFS_MASK {
            regs::CONTROL_HCFS_SUSPEND | regs::CONTROL_HCFS_RESUME => {
                // Merely suspended: signal resume, then re-enable schedules.
                self.bus.mmio_write(
                    regs::HC_CONTROL,
                    (control & !regs::CONTROL_HCFS_MASK) | regs::CONTROL_HCFS_RESUME,
                );
                let frame = self.bus.mmio_read(regs::HC_FM_NUMBER);
                for _ in 0..SETTLE_SPINS {
                    if self.bus.mmio_read(regs::HC_FM_NUMBER) != frame {
                        break;
                    }
                }
                let control = (self.bus.mmio_read(regs::HC_CONTROL)
                    & !regs::CONTROL_HCFS_MASK)
                    | regs::CONTROL_HCFS_OPERATIONAL
                    | regs::CONTROL_PLE
                    | regs::CONTROL_IE;
                self.bus.mmio_write(regs::HC_CONTROL, control);
                self.update_list_enables();
                Ok(())
            }
            regs::CONTROL_HCFS_RESET => {
                // Lost power: full restart, then relink the surviving
                // schedule.
                debug!("resume found controller reset; restarting");
                self.hw_reset()?;
                self.hw_configure();
                self.restore_schedule();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn frame_number(&mut self) -> u16 {
        (self.bus.mmio_read(regs::HC_FM_NUMBER) & 0xFFFF) as u16
    }

    fn enqueue(&mut self, mut urb: Urb) -> Result<(), (Urb, UsbError)> {
        if self.disabled {
            return Err((urb, UsbError::ShuttingDown));
        }
        let id = urb.id().expect("core assigns the id before enqueue");

        let ed_h = match self.resolve_ed(&urb) {
            Ok(h) => h,
            Err(e) => return Err((urb, e)),
        };

        if urb.pipe.transfer == TransferType::Isochronous && urb.flags.contains(UrbFlags::ISO_ASAP)
        {
            // Next reachable frame, with one frame of scheduling slack.
            urb.start_frame = self.frame_number().wrapping_add(2);
        }

        let plan = match plan_tds(&urb) {
            Ok(p) => p,
            Err(e) => return Err((urb, e)),
        };

        // Allocate everything up front so failure leaves no partial state.
        let span_len = staged_len(&urb);
        let span = if span_len > 0 {
            match self.dma.alloc(span_len, 4) {
                Ok(base) => Some((base, span_len)),
                Err(e) => return Err((urb, e)),
            }
        } else {
            None
        };
        let mut fresh = Vec::with_capacity(plan.len());
        for _ in 0..plan.len() {
            match self.dma.alloc(DESC_SLOT_SIZE, DESC_SLOT_SIZE) {
                Ok(addr) => fresh.push(addr),
                Err(e) => {
                    for addr in fresh {
                        self.dma.free(addr, DESC_SLOT_SIZE);
                    }
                    if let Some((base, len)) = span {
                        self.dma.free(base, len);
                    }
                    return Err((urb, e));
                }
            }
        }

        // Stage setup + data into the DMA window.
        if let Some((base, _)) = span {
            if let Some(setup) = urb.setup {
                self.bus.dma_write(base, &setup.to_bytes());
                if !urb.buffer.is_empty() {
                    self.bus.dma_write(base + 8, &urb.buffer);
                }
            } else if !urb.buffer.is_empty() {
                self.bus.dma_write(base, &urb.buffer);
            }
        }

        // A halted control endpoint recovers on the next SETUP.
        if urb.pipe.transfer == TransferType::Control {
            let ed = self.eds.get(ed_h.0).expect("live ED");
            if ed.is_halted(&mut *self.bus) {
                ed.clear_halt(&mut *self.bus);
            }
        }

        let td_count = plan.len();
        self.fill_tds(ed_h, id, &urb, &plan, span, fresh);
        self.link_ed(ed_h, &urb);

        match urb.pipe.transfer {
            TransferType::Control => self
                .bus
                .mmio_write(regs::HC_COMMAND_STATUS, regs::CMDSTATUS_CLF),
            TransferType::Bulk => self
                .bus
                .mmio_write(regs::HC_COMMAND_STATUS, regs::CMDSTATUS_BLF),
            _ => {}
        }

        self.inflight.insert(
            id,
            UrbRecord {
                urb,
                ed: ed_h,
                td_count,
                retired: 0,
                span,
                cancelled: false,
                error: None,
                data_actual: 0,
            },
        );
        Ok(())
    }

    fn dequeue(&mut self, id: UrbId) -> UsbResult<UrbFlags> {
        let (flags, ed_h) = {
            let rec = self.inflight.get_mut(&id).ok_or(UsbError::TooLate)?;
            if rec.cancelled {
                return Err(UsbError::TooLate);
            }
            rec.cancelled = true;
            (rec.urb.flags, rec.ed)
        };
        self.defer_ed_removal(ed_h, EdState::PendingUrbDelete);
        Ok(flags)
    }

    fn free_endpoint_resources(&mut self, device: DeviceId) {
        let doomed: Vec<EdHandle> = self
            .ed_map
            .iter()
            .filter(|(key, _)| key.device == device.address())
            .map(|(_, &h)| h)
            .collect();
        for h in doomed {
            for rec in self.inflight.values_mut() {
                if rec.ed == h {
                    rec.cancelled = true;
                }
            }
            self.defer_ed_removal(h, EdState::PendingFullDelete);
        }
    }

    fn clear_halt(&mut self, device: DeviceId, endpoint: u8, direction: Direction) {
        let key = EdKey {
            device: device.address(),
            endpoint,
            direction: Some(direction),
        };
        if let Some(&h) = self.ed_map.get(&key) {
            let ed = self.eds.get(h.0).expect("mapped ED is live");
            ed.clear_halt(&mut *self.bus);
        }
    }

    fn hub_status_data(&mut self, buf: &mut [u8]) -> usize {
        self.root_hub.status_data(&mut *self.bus, buf)
    }

    fn hub_control(
        &mut self,
        setup: usb_hcd::SetupPacket,
        data: &mut [u8],
    ) -> UsbResult<usize> {
        self.root_hub.control(&mut *self.bus, setup, data)
    }

    fn process_interrupt(&mut self) -> IrqOutcome {
        let mut outcome = IrqOutcome::default();
        if self.disabled {
            return outcome;
        }
        let enabled = self.bus.mmio_read(regs::HC_INTERRUPT_ENABLE);
        if enabled & regs::INT_MIE == 0 {
            return outcome;
        }
        let pending = self.bus.mmio_read(regs::HC_INTERRUPT_STATUS) & enabled & !regs::INT_MIE;
        if pending == 0 {
            return outcome;
        }
        outcome.handled = true;

        if pending & regs::INT_UE != 0 {
            error!("unrecoverable controller error; controller disabled");
            outcome.fault = true;
            outcome.completions = self.die();
            return outcome;
        }

        if pending & regs::INT_WDH != 0 {
            let head = self.bus.dma_read_u32(self.hcca + HCCA_DONE_HEAD);
            self.bus.dma_write_u32(self.hcca + HCCA_DONE_HEAD, 0);
            self.process_done_list(head, &mut outcome.completions);
            self.bus
                .mmio_write(regs::HC_INTERRUPT_STATUS, regs::INT_WDH);
        }

        if pending & regs::INT_SF != 0 {
            self.bus.mmio_write(regs::HC_INTERRUPT_STATUS, regs::INT_SF);
            self.reap_removals(&mut outcome.completions);
        }

        if pending & regs::INT_RHSC != 0 {
            outcome.root_hub_change = true;
            self.bus
                .mmio_write(regs::HC_INTERRUPT_STATUS, regs::INT_RHSC);
        }

        if pending & regs::INT_RD != 0 {
            debug!("remote wakeup / resume detected");
            self.bus.mmio_write(regs::HC_INTERRUPT_STATUS, regs::INT_RD);
        }

        if pending & regs::INT_FNO != 0 {
            let _ = self.current_frame();
            self.bus
                .mmio_write(regs::HC_INTERRUPT_STATUS, regs::INT_FNO);
        }

        if pending & regs::INT_SO != 0 {
            warn!("scheduling overrun");
            self.bus.mmio_write(regs::HC_INTERRUPT_STATUS, regs::INT_SO);
        }

        outcome
    }

    fn kill_all(&mut self) -> Vec<Urb> {
        self.teardown_all()
    }
}

fn ed_key(urb: &Urb) -> EdKey {
    EdKey {
        device: urb.pipe.device.address(),
        endpoint: urb.pipe.endpoint,
        // Control endpoints are bidirectional; the TD carries the PID.
        direction: match urb.pipe.transfer {
            TransferType::Control => None,
            _ => Some(urb.pipe.direction),
        },
    }
}

/// Direction data actually moves for this URB (control follows the SETUP).
fn transfer_direction(urb: &Urb) -> Direction {
    match urb.setup {
        Some(setup) if setup.is_in() => Direction::In,
        Some(_) => Direction::Out,
        None => urb.pipe.direction,
    }
}

fn staged_len(urb: &Urb) -> u32 {
    let setup = if urb.setup.is_some() { 8 } else { 0 };
    (setup + urb.buffer.len()) as u32
}

/// Computes the TD breakdown: bulk in 4KB chunks plus an optional trailing
/// zero-length TD, control as setup + data + status, interrupt as one TD,
/// isochronous as one TD per packet.
fn plan_tds(urb: &Urb) -> UsbResult<Vec<TdPlan>> {
    let mut plan = Vec::new();
    match urb.pipe.transfer {
        TransferType::Control => {
            let setup = urb.setup.ok_or(UsbError::BadParameter)?;
            plan.push(TdPlan {
                kind: TdKind::Setup,
                offset: 0,
                len: 8,
            });
            let data_len = (setup.length as usize).min(urb.buffer.len());
            let mut off = 0;
            while off < data_len {
                let len = (data_len - off).min(TD_MAX_DATA);
                plan.push(TdPlan {
                    kind: TdKind::Data,
                    offset: off,
                    len,
                });
                off += len;
            }
            plan.push(TdPlan {
                kind: TdKind::Status,
                offset: 0,
                len: 0,
            });
        }
        TransferType::Bulk => {
            let len = urb.buffer.len();
            if len == 0 {
                plan.push(TdPlan {
                    kind: TdKind::Data,
                    offset: 0,
                    len: 0,
                });
            } else {
                let mut off = 0;
                while off < len {
                    let chunk = (len - off).min(TD_MAX_DATA);
                    plan.push(TdPlan {
                        kind: TdKind::Data,
                        offset: off,
                        len: chunk,
                    });
                    off += chunk;
                }
                let max_packet = usize::from(urb.pipe.max_packet);
                if urb.flags.contains(UrbFlags::ZERO_PACKET)
                    && urb.pipe.direction == Direction::Out
                    && len % max_packet == 0
                {
                    plan.push(TdPlan {
                        kind: TdKind::Data,
                        offset: len,
                        len: 0,
                    });
                }
            }
        }
        TransferType::Interrupt => {
            plan.push(TdPlan {
                kind: TdKind::Data,
                offset: 0,
                len: urb.buffer.len(),
            });
        }
        TransferType::Isochronous => {
            if urb.iso_packets.is_empty() {
                return Err(UsbError::BadParameter);
            }
            for (i, p) in urb.iso_packets.iter().enumerate() {
                plan.push(TdPlan {
                    kind: TdKind::Iso { packet: i },
                    offset: p.offset,
                    len: p.length,
                });
            }
        }
    }
    Ok(plan)
}

/// PID, toggle and rounding for one general TD.
fn general_td_shape(
    urb: &Urb,
    plan: &[TdPlan],
    index: usize,
    kind: TdKind,
    data_dir: Direction,
) -> (DataPid, TdToggle, bool) {
    let dir_pid = |d: Direction| match d {
        Direction::In => DataPid::In,
        Direction::Out => DataPid::Out,
    };
    let allow_short = !urb.flags.contains(UrbFlags::SHORT_NOT_OK);
    match kind {
        TdKind::Setup => (DataPid::Setup, TdToggle::Data0, false),
        TdKind::Status => {
            let has_data = plan.iter().any(|p| p.kind == TdKind::Data && p.len > 0);
            let pid = if has_data {
                dir_pid(opposite(data_dir))
            } else {
                DataPid::In
            };
            (pid, TdToggle::Data1, true)
        }
        TdKind::Data if urb.pipe.transfer == TransferType::Control => {
            // First data TD of a control transfer starts at DATA1; the rest
            // continue the ED's toggle carry.
            let toggle = if index == 1 {
                TdToggle::Data1
            } else {
                TdToggle::Carry
            };
            (dir_pid(data_dir), toggle, allow_short)
        }
        _ => (dir_pid(urb.pipe.direction), TdToggle::Carry, allow_short),
    }
}

fn opposite(d: Direction) -> Direction {
    match d {
        Direction::In => Direction::Out,
        Direction::Out => Direction::In,
    }
}

/// DMA span a TD covers: the setup packet sits at the front of the staged
/// span, control data starts 8 bytes in.
fn td_data_span(
    p: &TdPlan,
    kind: TdKind,
    span_base: u32,
    data_offset: u32,
) -> Option<(u32, u32)> {
    match kind {
        TdKind::Setup => Some((span_base, 8)),
        TdKind::Status => None,
        TdKind::Data | TdKind::Iso { .. } => {
            (p.len > 0).then(|| (span_base + data_offset + p.offset as u32, p.len as u32))
        }
    }
}
