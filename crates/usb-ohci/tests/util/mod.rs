#![allow(dead_code)]

//! Simulated OHCI controller for integration tests.
//!
//! The simulator plays the hardware side of the contract: it owns the
//! register file, walks the ED/TD chains the driver writes into the shared
//! DMA window, executes transactions against scripted endpoints, retires TDs
//! onto a most-recent-first done list and raises interrupt status bits at
//! frame boundaries. Tests drive time explicitly, one 1 ms frame at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use usb_hcd::{HcBus, Hcd};
use usb_ohci::regs;
use usb_ohci::{Ohci, OhciConfig};

pub const MEM_BASE: u32 = 0x0010_0000;
pub const MEM_SIZE: u32 = 0x0004_0000;
pub const SIM_IRQ: u32 = 11;
pub const NUM_PORTS: usize = 2;

const ED_SKIP: u32 = 1 << 14;
const ED_FORMAT_ISO: u32 = 1 << 15;
const ED_HEAD_HALTED: u32 = 1 << 0;
const PTR_MASK: u32 = !0xF;

const CC_NO_ERROR: u32 = 0x0;
const CC_STALL: u32 = 0x4;
const CC_NO_RESPONSE: u32 = 0x5;
const CC_DATA_UNDERRUN: u32 = 0x9;

/// Walk budgets so a malformed schedule cannot hang a test.
const MAX_EDS_PER_LIST: usize = 256;
const MAX_TDS_PER_ED: usize = 64;

/// Scripted behaviour of one (device address, endpoint) pair.
pub enum EpScript {
    /// Each IN token pops one payload; an empty queue NAKs.
    InData(VecDeque<Vec<u8>>),
    /// Accept OUT data into the sink.
    AcceptOut,
    /// Serve a control data stage after SETUP.
    ControlIn(Vec<u8>),
    Stall,
    NoResponse,
    Nak,
}

#[derive(Default)]
struct SimRegs {
    control: u32,
    cmd_status: u32,
    int_status: u32,
    int_enable: u32,
    hcca: u32,
    control_head: u32,
    control_current: u32,
    bulk_head: u32,
    bulk_current: u32,
    fm_interval: u32,
    fm_number: u32,
    periodic_start: u32,
    ls_threshold: u32,
    rh_desc_a: u32,
    rh_desc_b: u32,
    rh_status: u32,
    ports: [u32; NUM_PORTS],
}

struct PortTimer {
    reset_frames: u8,
}

pub struct SimState {
    regs: SimRegs,
    mem: Vec<u8>,
    scripts: HashMap<(u8, u8), EpScript>,
    /// Control data stages pending after a SETUP: (data, progress).
    ep0: HashMap<(u8, u8), (Vec<u8>, usize)>,
    sinks: HashMap<(u8, u8), Vec<u8>>,
    done_head: u32,
    port_timers: [PortTimer; NUM_PORTS],
}

impl SimState {
    fn new() -> Self {
        let reg_file = SimRegs {
            rh_desc_a: NUM_PORTS as u32 | regs::RH_A_PSM | (0x32 << regs::RH_A_POTPGT_SHIFT),
            fm_interval: regs::FM_INTERVAL_FI_DEFAULT,
            ..SimRegs::default()
        };
        Self {
            regs: reg_file,
            mem: vec![0; MEM_SIZE as usize],
            scripts: HashMap::new(),
            ep0: HashMap::new(),
            sinks: HashMap::new(),
            done_head: 0,
            port_timers: [PortTimer { reset_frames: 0 }, PortTimer { reset_frames: 0 }],
        }
    }

    // ----- DMA helpers -----

    fn rd32(&self, addr: u32) -> u32 {
        let i = (addr - MEM_BASE) as usize;
        u32::from_le_bytes(self.mem[i..i + 4].try_into().unwrap())
    }

    fn wr32(&mut self, addr: u32, value: u32) {
        let i = (addr - MEM_BASE) as usize;
        self.mem[i..i + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn rd16(&self, addr: u32) -> u16 {
        let i = (addr - MEM_BASE) as usize;
        u16::from_le_bytes(self.mem[i..i + 2].try_into().unwrap())
    }

    fn wr16(&mut self, addr: u32, value: u16) {
        let i = (addr - MEM_BASE) as usize;
        self.mem[i..i + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn read_bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        let i = (addr - MEM_BASE) as usize;
        self.mem[i..i + len].to_vec()
    }

    fn write_bytes(&mut self, addr: u32, data: &[u8]) {
        let i = (addr - MEM_BASE) as usize;
        self.mem[i..i + data.len()].copy_from_slice(data);
    }

    // ----- register file -----

    fn reset_controller(&mut self) {
        let rh_a = self.regs.rh_desc_a;
        let rh_b = self.regs.rh_desc_b;
        self.regs = SimRegs {
            rh_desc_a: rh_a,
            rh_desc_b: rh_b,
            fm_interval: regs::FM_INTERVAL_FI_DEFAULT,
            ..SimRegs::default()
        };
        self.done_head = 0;
    }

    fn mmio_read(&mut self, offset: u32) -> u32 {
        match offset {
            regs::HC_REVISION => 0x10,
            regs::HC_CONTROL => self.regs.control,
            regs::HC_COMMAND_STATUS => self.regs.cmd_status,
            regs::HC_INTERRUPT_STATUS => self.regs.int_status,
            regs::HC_INTERRUPT_ENABLE | regs::HC_INTERRUPT_DISABLE => self.regs.int_enable,
            regs::HC_HCCA => self.regs.hcca,
            regs::HC_CONTROL_HEAD_ED => self.regs.control_head,
            regs::HC_CONTROL_CURRENT_ED => self.regs.control_current,
            regs::HC_BULK_HEAD_ED => self.regs.bulk_head,
            regs::HC_BULK_CURRENT_ED => self.regs.bulk_current,
            regs::HC_FM_INTERVAL => self.regs.fm_interval,
            regs::HC_FM_NUMBER => self.regs.fm_number & 0xFFFF,
            regs::HC_PERIODIC_START => self.regs.periodic_start,
            regs::HC_LS_THRESHOLD => self.regs.ls_threshold,
            regs::HC_RH_DESCRIPTOR_A => self.regs.rh_desc_a,
            regs::HC_RH_DESCRIPTOR_B => self.regs.rh_desc_b,
            regs::HC_RH_STATUS => self.regs.rh_status,
            _ if (regs::HC_RH_PORT_STATUS
                ..regs::HC_RH_PORT_STATUS + 4 * NUM_PORTS as u32)
                .contains(&offset) =>
            {
                let port = ((offset - regs::HC_RH_PORT_STATUS) / 4) as usize;
                self.regs.ports[port]
            }
            _ => 0,
        }
    }

    fn mmio_write(&mut self, offset: u32, value: u32) {
        match offset {
            regs::HC_CONTROL => self.regs.control = value,
            regs::HC_COMMAND_STATUS => {
                if value & regs::CMDSTATUS_HCR != 0 {
                    self.reset_controller();
                    return;
                }
                self.regs.cmd_status |= value & (regs::CMDSTATUS_CLF | regs::CMDSTATUS_BLF);
            }
            regs::HC_INTERRUPT_STATUS => self.regs.int_status &= !value,
            regs::HC_INTERRUPT_ENABLE => self.regs.int_enable |= value,
            regs::HC_INTERRUPT_DISABLE => self.regs.int_enable &= !value,
            regs::HC_HCCA => self.regs.hcca = value & !0xFF,
            regs::HC_CONTROL_HEAD_ED => self.regs.control_head = value & PTR_MASK,
            regs::HC_CONTROL_CURRENT_ED => self.regs.control_current = value & PTR_MASK,
            regs::HC_BULK_HEAD_ED => self.regs.bulk_head = value & PTR_MASK,
            regs::HC_BULK_CURRENT_ED => self.regs.bulk_current = value & PTR_MASK,
            regs::HC_FM_INTERVAL => self.regs.fm_interval = value,
            regs::HC_PERIODIC_START => self.regs.periodic_start = value,
            regs::HC_LS_THRESHOLD => self.regs.ls_threshold = value,
            regs::HC_RH_STATUS => {
                if value & regs::RH_S_LPSC != 0 {
                    for port in self.regs.ports.iter_mut() {
                        *port |= regs::PORT_PPS;
                    }
                }
                if value & regs::RH_S_LPS != 0 {
                    for port in self.regs.ports.iter_mut() {
                        *port &= !regs::PORT_PPS;
                    }
                }
                if value & regs::RH_S_OCIC != 0 {
                    self.regs.rh_status &= !regs::RH_S_OCIC;
                }
            }
            _ if (regs::HC_RH_PORT_STATUS
                ..regs::HC_RH_PORT_STATUS + 4 * NUM_PORTS as u32)
                .contains(&offset) =>
            {
                let port = ((offset - regs::HC_RH_PORT_STATUS) / 4) as usize;
                self.write_port(port, value);
            }
            _ => {}
        }
    }

    fn write_port(&mut self, port: usize, value: u32) {
        let reg = &mut self.regs.ports[port];
        let connected = *reg & regs::PORT_CCS != 0;

        if value & regs::PORT_PES != 0 {
            if connected {
                *reg |= regs::PORT_PES;
            } else {
                *reg |= regs::PORT_CSC;
            }
        }
        if value & regs::PORT_CCS != 0 {
            // ClearPortEnable.
            *reg &= !regs::PORT_PES;
        }
        if value & regs::PORT_PSS != 0 && connected {
            *reg |= regs::PORT_PSS;
        }
        if value & regs::PORT_POCI != 0 && *reg & regs::PORT_PSS != 0 {
            // ClearSuspendStatus: resume completes immediately in the model.
            *reg &= !regs::PORT_PSS;
            *reg |= regs::PORT_PSSC;
        }
        if value & regs::PORT_PRS != 0 {
            if connected {
                *reg |= regs::PORT_PRS;
                self.port_timers[port].reset_frames = 3;
            } else {
                *reg |= regs::PORT_CSC;
            }
        }
        if value & regs::PORT_PPS != 0 {
            *reg |= regs::PORT_PPS;
        }
        if value & regs::PORT_LSDA != 0 {
            // ClearPortPower.
            *reg &= !regs::PORT_PPS;
        }
        // Write-1-to-clear change bits.
        *reg &= !(value & regs::PORT_CHANGE_MASK);

        if self.regs.ports[port] & regs::PORT_CHANGE_MASK != 0 {
            self.regs.int_status |= regs::INT_RHSC;
        }
    }

    // ----- frame engine -----

    fn operational(&self) -> bool {
        self.regs.control & regs::CONTROL_HCFS_MASK == regs::CONTROL_HCFS_OPERATIONAL
    }

    fn frame(&mut self) {
        for port in 0..NUM_PORTS {
            if self.port_timers[port].reset_frames > 0 {
                self.port_timers[port].reset_frames -= 1;
                if self.port_timers[port].reset_frames == 0 {
                    let reg = &mut self.regs.ports[port];
                    *reg &= !regs::PORT_PRS;
                    *reg |= regs::PORT_PES | regs::PORT_PRSC;
                    self.regs.int_status |= regs::INT_RHSC;
                }
            }
        }

        if !self.operational() {
            return;
        }

        self.regs.fm_number = (self.regs.fm_number + 1) & 0xFFFF;
        let hcca = self.regs.hcca;
        if hcca != 0 {
            self.wr16(hcca + 0x80, self.regs.fm_number as u16);
        }
        self.regs.int_status |= regs::INT_SF;

        if self.regs.control & regs::CONTROL_PLE != 0 && hcca != 0 {
            let slot = self.regs.fm_number & 0x1F;
            let head = self.rd32(hcca + slot * 4);
            self.walk_ed_chain(head);
        }
        if self.regs.control & regs::CONTROL_CLE != 0 {
            let head = self.regs.control_head;
            self.walk_ed_chain(head);
            self.regs.cmd_status &= !regs::CMDSTATUS_CLF;
        }
        if self.regs.control & regs::CONTROL_BLE != 0 {
            let head = self.regs.bulk_head;
            self.walk_ed_chain(head);
            self.regs.cmd_status &= !regs::CMDSTATUS_BLF;
        }

        // Write back the accumulated done queue once WDH is acknowledged.
        if self.done_head != 0 && self.regs.int_status & regs::INT_WDH == 0 && hcca != 0 {
            self.wr32(hcca + 0x84, self.done_head);
            self.done_head = 0;
            self.regs.int_status |= regs::INT_WDH;
        }
    }

    fn walk_ed_chain(&mut self, mut ed_addr: u32) {
        let mut visited = 0;
        while ed_addr & PTR_MASK != 0 && visited < MAX_EDS_PER_LIST {
            visited += 1;
            let addr = ed_addr & PTR_MASK;
            self.process_ed(addr);
            ed_addr = self.rd32(addr + 12);
        }
    }

    fn process_ed(&mut self, ed_addr: u32) {
        let info = self.rd32(ed_addr);
        if info & ED_SKIP != 0 {
            return;
        }
        let fa = (info & 0x7F) as u8;
        let en = ((info >> 7) & 0xF) as u8;
        let max_packet = ((info >> 16) & 0x7FF) as usize;
        let iso = info & ED_FORMAT_ISO != 0;

        for _ in 0..MAX_TDS_PER_ED {
            let head = self.rd32(ed_addr + 8);
            if head & ED_HEAD_HALTED != 0 {
                return;
            }
            let tail = self.rd32(ed_addr + 4) & PTR_MASK;
            let td = head & PTR_MASK;
            if td == tail || td == 0 {
                return;
            }
            let outcome = if iso {
                self.execute_iso_td(fa, en, info, td)
            } else {
                self.execute_general_td(fa, en, max_packet, td)
            };
            match outcome {
                TdOutcome::Retired(next) => {
                    let toggle = head & 0x2;
                    self.wr32(ed_addr + 8, (next & PTR_MASK) | toggle);
                    self.retire(td);
                }
                TdOutcome::Halt(next) => {
                    // The errored TD still retires; the head advances past it
                    // and the ED halts.
                    self.retire(td);
                    self.wr32(ed_addr + 8, (next & PTR_MASK) | ED_HEAD_HALTED);
                    return;
                }
                TdOutcome::Nak => return,
                TdOutcome::NotReady => return,
            }
        }
    }

    /// Moves a retired TD onto the most-recent-first done queue by reusing
    /// its NextTD field, exactly as the hardware does.
    fn retire(&mut self, td: u32) {
        self.wr32(td + 8, self.done_head);
        self.done_head = td;
    }

    fn execute_general_td(&mut self, fa: u8, en: u8, _max_packet: usize, td: u32) -> TdOutcome {
        let word0 = self.rd32(td);
        let cbp = self.rd32(td + 4);
        let next = self.rd32(td + 8);
        let be = self.rd32(td + 12);
        let rounding = word0 & (1 << 18) != 0;
        let pid = (word0 >> 19) & 0x3;
        let len = if cbp == 0 {
            0
        } else {
            (be - cbp + 1) as usize
        };

        let finish = |state: &mut Self, cc: u32, new_cbp: u32| {
            let w0 = (state.rd32(td) & 0x0FFF_FFFF) | (cc << 28);
            state.wr32(td, w0);
            state.wr32(td + 4, new_cbp);
        };

        match pid {
            // SETUP
            0b00 => {
                let setup = self.read_bytes(cbp, 8);
                match self.scripts.get(&(fa, en)) {
                    Some(EpScript::ControlIn(data)) => {
                        let mut stage = data.clone();
                        let wlength = u16::from_le_bytes([setup[6], setup[7]]) as usize;
                        stage.truncate(wlength);
                        self.ep0.insert((fa, en), (stage, 0));
                        finish(self, CC_NO_ERROR, 0);
                        TdOutcome::Retired(next)
                    }
                    Some(EpScript::Stall) => {
                        finish(self, CC_STALL, cbp);
                        TdOutcome::Halt(next)
                    }
                    Some(EpScript::NoResponse) | None => {
                        finish(self, CC_NO_RESPONSE, cbp);
                        TdOutcome::Halt(next)
                    }
                    _ => {
                        finish(self, CC_NO_ERROR, 0);
                        TdOutcome::Retired(next)
                    }
                }
            }
            // OUT
            0b01 => match self.scripts.get(&(fa, en)) {
                Some(EpScript::AcceptOut) | Some(EpScript::ControlIn(_)) => {
                    if len > 0 {
                        let data = self.read_bytes(cbp, len);
                        self.sinks.entry((fa, en)).or_default().extend_from_slice(&data);
                    }
                    finish(self, CC_NO_ERROR, 0);
                    TdOutcome::Retired(next)
                }
                Some(EpScript::Stall) => {
                    finish(self, CC_STALL, cbp);
                    TdOutcome::Halt(next)
                }
                Some(EpScript::Nak) => TdOutcome::Nak,
                Some(EpScript::NoResponse) | None => {
                    finish(self, CC_NO_RESPONSE, cbp);
                    TdOutcome::Halt(next)
                }
                Some(EpScript::InData(_)) => {
                    finish(self, CC_NO_ERROR, 0);
                    TdOutcome::Retired(next)
                }
            },
            // IN
            0b10 => {
                // Control status stages are zero-length INs; always ack.
                if len == 0 {
                    finish(self, CC_NO_ERROR, 0);
                    return TdOutcome::Retired(next);
                }
                let payload: Option<Vec<u8>> = if let Some((stage, progress)) =
                    self.ep0.get_mut(&(fa, en))
                {
                    let remaining = stage.len() - *progress;
                    let n = remaining.min(len);
                    let chunk = stage[*progress..*progress + n].to_vec();
                    *progress += n;
                    Some(chunk)
                } else {
                    match self.scripts.get_mut(&(fa, en)) {
                        Some(EpScript::InData(queue)) => queue.pop_front(),
                        Some(EpScript::Stall) => {
                            finish(self, CC_STALL, cbp);
                            return TdOutcome::Halt(next);
                        }
                        Some(EpScript::Nak) => return TdOutcome::Nak,
                        Some(EpScript::NoResponse) | None => {
                            finish(self, CC_NO_RESPONSE, cbp);
                            return TdOutcome::Halt(next);
                        }
                        _ => Some(Vec::new()),
                    }
                };
                let Some(bytes) = payload else {
                    return TdOutcome::Nak;
                };
                let n = bytes.len().min(len);
                self.write_bytes(cbp, &bytes[..n]);
                if n == len {
                    finish(self, CC_NO_ERROR, 0);
                    TdOutcome::Retired(next)
                } else if rounding {
                    finish(self, CC_NO_ERROR, cbp + n as u32);
                    TdOutcome::Retired(next)
                } else {
                    finish(self, CC_DATA_UNDERRUN, cbp + n as u32);
                    TdOutcome::Halt(next)
                }
            }
            _ => {
                finish(self, CC_NO_RESPONSE, cbp);
                TdOutcome::Halt(next)
            }
        }
    }

    fn execute_iso_td(&mut self, fa: u8, en: u8, ed_info: u32, td: u32) -> TdOutcome {
        let word0 = self.rd32(td);
        let next = self.rd32(td + 8);
        let sf = (word0 & 0xFFFF) as u16;
        let cur = self.regs.fm_number as u16;
        // Future start frame: leave the TD for a later frame.
        if (cur.wrapping_sub(sf)) & 0x8000 != 0 {
            return TdOutcome::NotReady;
        }

        let psw = self.rd16(td + 16);
        let offset = psw & 0x1FFF;
        let bp0 = self.rd32(td + 4);
        let be = self.rd32(td + 12);
        let base = if offset & 0x1000 != 0 {
            (be & !0xFFF) | u32::from(offset & 0xFFF)
        } else {
            bp0 + u32::from(offset & 0xFFF)
        };
        let len = if be >= base { (be - base + 1) as usize } else { 0 };
        let dir_in = (ed_info >> 11) & 0x3 == 0b10;

        let (size, cc) = if dir_in {
            match self.scripts.get_mut(&(fa, en)) {
                Some(EpScript::InData(queue)) => match queue.pop_front() {
                    Some(bytes) => {
                        let n = bytes.len().min(len);
                        self.write_bytes(base, &bytes[..n]);
                        (n as u16, CC_NO_ERROR)
                    }
                    // Isochronous has no retries: a missed service is an
                    // empty packet.
                    None => (0, CC_NO_ERROR),
                },
                _ => (0, CC_NO_RESPONSE),
            }
        } else {
            if len > 0 {
                let data = self.read_bytes(base, len);
                self.sinks.entry((fa, en)).or_default().extend_from_slice(&data);
            }
            (0, CC_NO_ERROR) // OUT packets report size 0 on success
        };

        self.wr16(td + 16, size & 0x7FF | (cc as u16) << 12);
        let w0 = (word0 & 0x0FFF_FFFF) | (CC_NO_ERROR << 28);
        self.wr32(td, w0);
        TdOutcome::Retired(next)
    }
}

enum TdOutcome {
    Retired(u32),
    Halt(u32),
    Nak,
    NotReady,
}

/// Shared handle to the simulated controller.
#[derive(Clone)]
pub struct SimHc {
    state: Arc<Mutex<SimState>>,
}

impl SimHc {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    pub fn bus(&self) -> SimBus {
        SimBus {
            state: self.state.clone(),
        }
    }

    /// Advances one 1 ms frame.
    pub fn frame(&self) {
        self.state.lock().unwrap().frame();
    }

    pub fn script(&self, address: u8, endpoint: u8, script: EpScript) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert((address, endpoint), script);
    }

    pub fn sink(&self, address: u8, endpoint: u8) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .sinks
            .get(&(address, endpoint))
            .cloned()
            .unwrap_or_default()
    }

    pub fn connect(&self, port: usize, low_speed: bool) {
        let mut st = self.state.lock().unwrap();
        let reg = &mut st.regs.ports[port];
        *reg |= regs::PORT_CCS | regs::PORT_CSC;
        if low_speed {
            *reg |= regs::PORT_LSDA;
        }
        st.regs.int_status |= regs::INT_RHSC;
    }

    pub fn port_status(&self, port: usize) -> u32 {
        self.state.lock().unwrap().regs.ports[port]
    }

    pub fn hcfs(&self) -> u32 {
        self.state.lock().unwrap().regs.control & regs::CONTROL_HCFS_MASK
    }

    pub fn control_list_enabled(&self) -> bool {
        self.state.lock().unwrap().regs.control & regs::CONTROL_CLE != 0
    }

    pub fn bulk_list_enabled(&self) -> bool {
        self.state.lock().unwrap().regs.control & regs::CONTROL_BLE != 0
    }

    /// Hardware-eye scan of the bulk list: ED bus addresses reachable from
    /// the head register.
    pub fn scan_bulk_eds(&self) -> Vec<u32> {
        let st = self.state.lock().unwrap();
        scan_chain(&st, st.regs.bulk_head)
    }

    pub fn scan_control_eds(&self) -> Vec<u32> {
        let st = self.state.lock().unwrap();
        scan_chain(&st, st.regs.control_head)
    }

    /// EDs reachable from one HCCA interrupt-table slot.
    pub fn scan_periodic_slot(&self, slot: u32) -> Vec<u32> {
        let st = self.state.lock().unwrap();
        if st.regs.hcca == 0 {
            return Vec::new();
        }
        let head = st.rd32(st.regs.hcca + slot * 4);
        scan_chain(&st, head)
    }

    /// TDs queued on an ED, head to tail (the dummy is excluded).
    pub fn scan_ed_tds(&self, ed_addr: u32) -> Vec<u32> {
        let st = self.state.lock().unwrap();
        let tail = st.rd32(ed_addr + 4) & PTR_MASK;
        let mut td = st.rd32(ed_addr + 8) & PTR_MASK;
        let mut out = Vec::new();
        while td != 0 && td != tail && out.len() < MAX_TDS_PER_ED {
            out.push(td);
            td = st.rd32(td + 8) & PTR_MASK;
        }
        out
    }

    /// Raw DMA word read for structural assertions.
    pub fn read_dma_u32(&self, addr: u32) -> u32 {
        self.state.lock().unwrap().rd32(addr)
    }

    /// Raises the unrecoverable-error interrupt.
    pub fn inject_fault(&self) {
        self.state.lock().unwrap().regs.int_status |= regs::INT_UE;
    }

    /// Simulates losing power while suspended: registers reset, memory
    /// survives.
    pub fn power_loss(&self) {
        self.state.lock().unwrap().reset_controller();
    }
}

impl Default for SimHc {
    fn default() -> Self {
        Self::new()
    }
}

fn scan_chain(st: &SimState, mut ed: u32) -> Vec<u32> {
    let mut out = Vec::new();
    while ed & PTR_MASK != 0 && out.len() < MAX_EDS_PER_LIST {
        let addr = ed & PTR_MASK;
        out.push(addr);
        ed = st.rd32(addr + 12);
    }
    out
}

pub struct SimBus {
    state: Arc<Mutex<SimState>>,
}

impl HcBus for SimBus {
    fn mmio_read(&mut self, offset: u32) -> u32 {
        self.state.lock().unwrap().mmio_read(offset)
    }

    fn mmio_write(&mut self, offset: u32, value: u32) {
        self.state.lock().unwrap().mmio_write(offset, value)
    }

    fn dma_read(&mut self, addr: u32, buf: &mut [u8]) {
        let st = self.state.lock().unwrap();
        let i = (addr - MEM_BASE) as usize;
        buf.copy_from_slice(&st.mem[i..i + buf.len()]);
    }

    fn dma_write(&mut self, addr: u32, buf: &[u8]) {
        let mut st = self.state.lock().unwrap();
        let i = (addr - MEM_BASE) as usize;
        st.mem[i..i + buf.len()].copy_from_slice(buf);
    }
}

/// A probed and started controller stack against the simulator.
pub fn harness() -> (Hcd, SimHc) {
    let sim = SimHc::new();
    let ohci = Ohci::probe(
        Box::new(sim.bus()),
        SIM_IRQ,
        OhciConfig {
            dma_base: MEM_BASE,
            dma_len: MEM_SIZE,
        },
    )
    .expect("probe succeeds against the simulator");
    let hcd = Hcd::new(Box::new(ohci)).expect("core binds the driver");
    hcd.start().expect("controller starts");
    (hcd, sim)
}

/// Runs `n` frames, servicing the interrupt after each.
pub fn run_frames(hcd: &Hcd, sim: &SimHc, n: usize) {
    for _ in 0..n {
        sim.frame();
        hcd.interrupt();
    }
}
