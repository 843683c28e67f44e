//! Schedule manager: links and unlinks EDs on the four hardware lists.
//!
//! Control and bulk are plain singly linked lists with a cached tail for
//! O(1) append. Interrupt EDs live on a 32-slot periodic table shaped as a
//! binary tree: an ED with effective interval `P` (a power of two) and
//! branch `b` appears in every slot congruent to `b` mod `P`. Per-slot
//! chains are ordered by strictly descending interval with a stable
//! tie-break, which makes each ED's successor identical in every slot it
//! occupies (powers of two nest congruence classes), so the single hardware
//! `NextED` field is well-defined. The isochronous chain is spliced after
//! every interrupt branch.
//!
//! Unlink never mutates a hardware-visible list here; EDs leave the software
//! membership and the rewritten hardware chains only from the frame-boundary
//! reaper in `hc.rs`.

use usb_hcd::HcBus;

use crate::dma::{Slab, HCCA_INT_TABLE};
use crate::ed::{Ed, EdHandle, ListKind};

pub(crate) const PERIODIC_SLOTS: usize = 32;

/// Control or bulk list: member order mirrors the hardware chain.
#[derive(Debug, Default)]
pub(crate) struct AsyncList {
    pub members: Vec<EdHandle>,
    /// Removals queued on this list; its processing-enable bit must stay off
    /// until the reaper drains them.
    pub pending_removals: u32,
}

impl AsyncList {
    pub fn tail(&self) -> Option<EdHandle> {
        self.members.last().copied()
    }
}

#[derive(Debug)]
pub(crate) struct Schedule {
    pub control: AsyncList,
    pub bulk: AsyncList,
    /// All interrupt EDs, sorted by (interval descending, seq ascending).
    pub periodic: Vec<EdHandle>,
    pub iso: Vec<EdHandle>,
    pub branch_load: [u32; PERIODIC_SLOTS],
}

impl Schedule {
    pub fn new() -> Self {
        Self {
            control: AsyncList::default(),
            bulk: AsyncList::default(),
            periodic: Vec::new(),
            iso: Vec::new(),
            branch_load: [0; PERIODIC_SLOTS],
        }
    }

    pub fn async_list(&mut self, kind: ListKind) -> &mut AsyncList {
        match kind {
            ListKind::Control => &mut self.control,
            ListKind::Bulk => &mut self.bulk,
            _ => unreachable!("periodic lists are not async lists"),
        }
    }

    /// Greedy branch balancing: among the `interval` possible residue
    /// classes, pick the one whose slots carry the least total load.
    pub fn least_loaded_branch(&self, interval: u32) -> u32 {
        let interval = interval.clamp(1, PERIODIC_SLOTS as u32) as usize;
        let mut best = 0usize;
        let mut best_load = u32::MAX;
        for branch in 0..interval {
            let load = (branch..PERIODIC_SLOTS)
                .step_by(interval)
                .map(|slot| self.branch_load[slot])
                .sum();
            if load < best_load {
                best = branch;
                best_load = load;
            }
        }
        best as u32
    }

    /// Adds an ED's declared load to every slot it occupies.
    pub fn add_branch_load(&mut self, branch: u32, interval: u32, load: u32) {
        let interval = interval.clamp(1, PERIODIC_SLOTS as u32) as usize;
        let mut slot = branch as usize;
        while slot < PERIODIC_SLOTS {
            self.branch_load[slot] += load;
            slot += interval;
        }
    }

    pub fn remove_branch_load(&mut self, branch: u32, interval: u32, load: u32) {
        let interval = interval.clamp(1, PERIODIC_SLOTS as u32) as usize;
        let mut slot = branch as usize;
        while slot < PERIODIC_SLOTS {
            self.branch_load[slot] = self.branch_load[slot].saturating_sub(load);
            slot += interval;
        }
    }

    /// Inserts an interrupt ED into the globally ordered periodic set.
    pub fn insert_periodic(&mut self, handle: EdHandle, eds: &Slab<Ed>) {
        let (interval, seq) = {
            let ed = eds.get(handle.0).expect("live ED");
            (ed.interval, ed.seq)
        };
        let pos = self
            .periodic
            .partition_point(|&h| {
                let other = eds.get(h.0).expect("live ED");
                (other.interval, core::cmp::Reverse(other.seq))
                    > (interval, core::cmp::Reverse(seq))
            });
        self.periodic.insert(pos, handle);
    }

    pub fn remove_member(&mut self, kind: ListKind, handle: EdHandle) {
        let list = match kind {
            ListKind::Control => &mut self.control.members,
            ListKind::Bulk => &mut self.bulk.members,
            ListKind::Periodic => &mut self.periodic,
            ListKind::Iso => &mut self.iso,
        };
        list.retain(|&h| h != handle);
    }

    /// Members of one periodic slot, in hardware chain order.
    pub fn slot_chain<'a>(
        &'a self,
        eds: &'a Slab<Ed>,
        slot: usize,
    ) -> impl Iterator<Item = EdHandle> + 'a {
        self.periodic.iter().copied().filter(move |&h| {
            let ed = eds.get(h.0).expect("live ED");
            let interval = ed.interval.clamp(1, PERIODIC_SLOTS as u32);
            slot as u32 % interval == ed.branch
        })
    }

    /// Rewrites one async list's hardware chain; returns the head bus
    /// address (0 when empty).
    pub fn write_async(&self, kind: ListKind, eds: &Slab<Ed>, bus: &mut dyn HcBus) -> u32 {
        let members = match kind {
            ListKind::Control => &self.control.members,
            ListKind::Bulk => &self.bulk.members,
            _ => unreachable!("periodic lists are not async lists"),
        };
        write_chain(members, eds, bus, 0);
        members
            .first()
            .map(|&h| eds.get(h.0).expect("live ED").bus_addr)
            .unwrap_or(0)
    }

    /// Rewrites the whole periodic structure: the isochronous chain, every
    /// interrupt slot chain (terminated into the iso head) and the 32 HCCA
    /// interrupt-table entries.
    pub fn write_periodic(&self, eds: &Slab<Ed>, bus: &mut dyn HcBus, hcca: u32) {
        let iso_head = self
            .iso
            .first()
            .map(|&h| eds.get(h.0).expect("live ED").bus_addr)
            .unwrap_or(0);
        write_chain(&self.iso, eds, bus, 0);

        for slot in 0..PERIODIC_SLOTS {
            let chain: Vec<EdHandle> = self.slot_chain(eds, slot).collect();
            write_chain(&chain, eds, bus, iso_head);
            let entry = chain
                .first()
                .map(|&h| eds.get(h.0).expect("live ED").bus_addr)
                .unwrap_or(iso_head);
            bus.dma_write_u32(hcca + HCCA_INT_TABLE + (slot as u32) * 4, entry);
        }
    }
}

impl Default for Schedule {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes `NextED` links so the hardware chain matches `members`, ending in
/// `terminator`. Suffix sharing across periodic slots makes repeated writes
/// of the same field identical, so per-slot rewrites never conflict.
fn write_chain(members: &[EdHandle], eds: &Slab<Ed>, bus: &mut dyn HcBus, terminator: u32) {
    for pair in members.windows(2) {
        let ed = eds.get(pair[0].0).expect("live ED");
        let next = eds.get(pair[1].0).expect("live ED");
        ed.write_next(bus, next.bus_addr);
    }
    if let Some(&last) = members.last() {
        eds.get(last.0).expect("live ED").write_next(bus, terminator);
    }
}
