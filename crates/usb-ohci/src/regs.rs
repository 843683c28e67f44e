//! OHCI operational register layout and bit definitions.
//!
//! Offsets are relative to the memory-mapped register base supplied by the
//! platform at probe. Names follow the OHCI specification (rev 1.0a).

pub const HC_REVISION: u32 = 0x00;
pub const HC_CONTROL: u32 = 0x04;
pub const HC_COMMAND_STATUS: u32 = 0x08;
pub const HC_INTERRUPT_STATUS: u32 = 0x0C;
pub const HC_INTERRUPT_ENABLE: u32 = 0x10;
pub const HC_INTERRUPT_DISABLE: u32 = 0x14;
pub const HC_HCCA: u32 = 0x18;
pub const HC_PERIOD_CURRENT_ED: u32 = 0x1C;
pub const HC_CONTROL_HEAD_ED: u32 = 0x20;
pub const HC_CONTROL_CURRENT_ED: u32 = 0x24;
pub const HC_BULK_HEAD_ED: u32 = 0x28;
pub const HC_BULK_CURRENT_ED: u32 = 0x2C;
pub const HC_DONE_HEAD: u32 = 0x30;
pub const HC_FM_INTERVAL: u32 = 0x34;
pub const HC_FM_REMAINING: u32 = 0x38;
pub const HC_FM_NUMBER: u32 = 0x3C;
pub const HC_PERIODIC_START: u32 = 0x40;
pub const HC_LS_THRESHOLD: u32 = 0x44;
pub const HC_RH_DESCRIPTOR_A: u32 = 0x48;
pub const HC_RH_DESCRIPTOR_B: u32 = 0x4C;
pub const HC_RH_STATUS: u32 = 0x50;
/// Per-port status registers follow at 4-byte stride (port 1 first).
pub const HC_RH_PORT_STATUS: u32 = 0x54;

// HcControl
pub const CONTROL_CBSR_MASK: u32 = 0x3; // control/bulk service ratio
pub const CONTROL_CBSR_4_TO_1: u32 = 0x3;
pub const CONTROL_PLE: u32 = 1 << 2; // periodic list enable
pub const CONTROL_IE: u32 = 1 << 3; // isochronous enable
pub const CONTROL_CLE: u32 = 1 << 4; // control list enable
pub const CONTROL_BLE: u32 = 1 << 5; // bulk list enable
pub const CONTROL_HCFS_MASK: u32 = 0x3 << 6; // host controller functional state
pub const CONTROL_HCFS_RESET: u32 = 0x0 << 6;
pub const CONTROL_HCFS_RESUME: u32 = 0x1 << 6;
pub const CONTROL_HCFS_OPERATIONAL: u32 = 0x2 << 6;
pub const CONTROL_HCFS_SUSPEND: u32 = 0x3 << 6;
pub const CONTROL_IR: u32 = 1 << 8; // interrupt routing (SMM)
pub const CONTROL_RWC: u32 = 1 << 9; // remote wakeup connected
pub const CONTROL_RWE: u32 = 1 << 10; // remote wakeup enable

// HcCommandStatus
pub const CMDSTATUS_HCR: u32 = 1 << 0; // host controller reset
pub const CMDSTATUS_CLF: u32 = 1 << 1; // control list filled
pub const CMDSTATUS_BLF: u32 = 1 << 2; // bulk list filled
pub const CMDSTATUS_OCR: u32 = 1 << 3; // ownership change request

// HcInterruptStatus / Enable / Disable
pub const INT_SO: u32 = 1 << 0; // scheduling overrun
pub const INT_WDH: u32 = 1 << 1; // writeback done head
pub const INT_SF: u32 = 1 << 2; // start of frame
pub const INT_RD: u32 = 1 << 3; // resume detected
pub const INT_UE: u32 = 1 << 4; // unrecoverable error
pub const INT_FNO: u32 = 1 << 5; // frame number overflow
pub const INT_RHSC: u32 = 1 << 6; // root hub status change
pub const INT_OC: u32 = 1 << 30; // ownership change
pub const INT_MIE: u32 = 1 << 31; // master interrupt enable

// HcFmInterval
pub const FM_INTERVAL_FI_DEFAULT: u32 = 11_999; // 12 MHz bit times per 1 ms frame
pub const FM_INTERVAL_FIT: u32 = 1 << 31;

/// Largest full-speed packet that fits the default frame interval.
pub fn fm_interval_fsmps(fi: u32) -> u32 {
    ((fi - 210) * 6 / 7) << 16
}

/// Periodic processing starts at 90% of the frame.
pub fn periodic_start(fi: u32) -> u32 {
    fi * 9 / 10
}

// HcRhDescriptorA
pub const RH_A_NDP_MASK: u32 = 0xFF; // number of downstream ports
pub const RH_A_PSM: u32 = 1 << 8; // power switching mode (per-port)
pub const RH_A_NPS: u32 = 1 << 9; // no power switching
pub const RH_A_DT: u32 = 1 << 10; // device type (always 0)
pub const RH_A_OCPM: u32 = 1 << 11; // over-current protection mode
pub const RH_A_NOCP: u32 = 1 << 12; // no over-current protection
pub const RH_A_POTPGT_SHIFT: u32 = 24; // power-on to power-good time

// HcRhStatus
pub const RH_S_LPS: u32 = 1 << 0; // local power status / clear global power
pub const RH_S_OCI: u32 = 1 << 1; // over-current indicator
pub const RH_S_DRWE: u32 = 1 << 15; // device remote wakeup enable
pub const RH_S_LPSC: u32 = 1 << 16; // local power status change / set global power
pub const RH_S_OCIC: u32 = 1 << 17; // over-current indicator change
pub const RH_S_CRWE: u32 = 1 << 31; // clear remote wakeup enable

// HcRhPortStatus. Reads give status; writes are feature triggers (the
// "clear" aliases name the write side of the same bit).
pub const PORT_CCS: u32 = 1 << 0; // current connect status / clear port enable
pub const PORT_PES: u32 = 1 << 1; // port enable status / set port enable
pub const PORT_PSS: u32 = 1 << 2; // port suspend status / set port suspend
pub const PORT_POCI: u32 = 1 << 3; // port over-current / clear suspend status
pub const PORT_PRS: u32 = 1 << 4; // port reset status / set port reset
pub const PORT_PPS: u32 = 1 << 8; // port power status / set port power
pub const PORT_LSDA: u32 = 1 << 9; // low speed device attached / clear port power
pub const PORT_CSC: u32 = 1 << 16; // connect status change
pub const PORT_PESC: u32 = 1 << 17; // port enable status change
pub const PORT_PSSC: u32 = 1 << 18; // port suspend status change
pub const PORT_OCIC: u32 = 1 << 19; // port over-current indicator change
pub const PORT_PRSC: u32 = 1 << 20; // port reset status change

/// All port change bits, as reported through the status-change pipe.
pub const PORT_CHANGE_MASK: u32 =
    PORT_CSC | PORT_PESC | PORT_PSSC | PORT_OCIC | PORT_PRSC;
