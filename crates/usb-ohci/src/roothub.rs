//! Root hub emulation.
//!
//! The root hub is the mandatory virtual hub fronting the controller's own
//! ports. It has no bus presence: every standard and class-specific control
//! request is serviced synchronously by reading or writing the real `HcRh*`
//! registers and packing canned descriptors; unsupported requests answer
//! with a protocol stall. Its status-change endpoint has no interrupt source
//! either; the dispatch core polls [`status_data`] from a software timer.

use usb_hcd::usb::{
    SetupPacket, USB_DESCRIPTOR_TYPE_CONFIGURATION, USB_DESCRIPTOR_TYPE_DEVICE,
    USB_DESCRIPTOR_TYPE_ENDPOINT, USB_DESCRIPTOR_TYPE_HUB, USB_DESCRIPTOR_TYPE_INTERFACE,
    USB_DESCRIPTOR_TYPE_STRING, USB_REQUEST_CLEAR_FEATURE, USB_REQUEST_GET_CONFIGURATION,
    USB_REQUEST_GET_DESCRIPTOR, USB_REQUEST_GET_STATUS, USB_REQUEST_SET_ADDRESS,
    USB_REQUEST_SET_CONFIGURATION, USB_REQUEST_SET_FEATURE,
};
use tracing::debug;
use usb_hcd::{HcBus, TransferError, UsbError, UsbResult};

use crate::regs;

// Hub class feature selectors (USB 2.0 spec, table 11-17).
const HUB_FEATURE_C_LOCAL_POWER: u16 = 0;
const HUB_FEATURE_C_OVER_CURRENT: u16 = 1;
const PORT_FEATURE_ENABLE: u16 = 1;
const PORT_FEATURE_SUSPEND: u16 = 2;
const PORT_FEATURE_RESET: u16 = 4;
const PORT_FEATURE_POWER: u16 = 8;
const PORT_FEATURE_C_CONNECTION: u16 = 16;
const PORT_FEATURE_C_ENABLE: u16 = 17;
const PORT_FEATURE_C_SUSPEND: u16 = 18;
const PORT_FEATURE_C_OVER_CURRENT: u16 = 19;
const PORT_FEATURE_C_RESET: u16 = 20;

/// Canned device descriptor: USB 1.1 hub, 8-byte control pipe, one
/// configuration. Byte-exact per the wire format.
pub const ROOT_HUB_DEVICE_DESCRIPTOR: [u8; 18] = [
    0x12, // bLength
    USB_DESCRIPTOR_TYPE_DEVICE,
    0x10, 0x01, // bcdUSB (1.10)
    0x09, // bDeviceClass (Hub)
    0x00, // bDeviceSubClass
    0x00, // bDeviceProtocol
    0x08, // bMaxPacketSize0
    0x00, 0x00, // idVendor
    0x00, 0x00, // idProduct
    0x00, 0x01, // bcdDevice (1.00)
    0x01, // iManufacturer
    0x02, // iProduct
    0x00, // iSerialNumber
    0x01, // bNumConfigurations
];

/// Canned configuration: one hub interface with the interrupt IN
/// status-change endpoint (2-byte bitmap, 255 ms poll interval).
pub const ROOT_HUB_CONFIG_DESCRIPTOR: [u8; 25] = [
    // Configuration descriptor
    0x09, // bLength
    USB_DESCRIPTOR_TYPE_CONFIGURATION,
    25, 0x00, // wTotalLength
    0x01, // bNumInterfaces
    0x01, // bConfigurationValue
    0x00, // iConfiguration
    0x40, // bmAttributes (self-powered)
    0x00, // bMaxPower
    // Interface descriptor
    0x09, // bLength
    USB_DESCRIPTOR_TYPE_INTERFACE,
    0x00, // bInterfaceNumber
    0x00, // bAlternateSetting
    0x01, // bNumEndpoints
    0x09, // bInterfaceClass (Hub)
    0x00, // bInterfaceSubClass
    0x00, // bInterfaceProtocol
    0x00, // iInterface
    // Endpoint descriptor (Interrupt IN)
    0x07, // bLength
    USB_DESCRIPTOR_TYPE_ENDPOINT,
    0x81, // bEndpointAddress
    0x03, // bmAttributes (Interrupt)
    0x02, 0x00, // wMaxPacketSize
    0xFF, // bInterval
];

fn string_descriptor_langid(langid: u16) -> Vec<u8> {
    let [l0, l1] = langid.to_le_bytes();
    vec![4, USB_DESCRIPTOR_TYPE_STRING, l0, l1]
}

fn string_descriptor_utf16le(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + s.len() * 2);
    out.push(0); // bLength placeholder
    out.push(USB_DESCRIPTOR_TYPE_STRING);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out[0] = out.len() as u8;
    out
}

/// Virtual state the emulator keeps besides the live hardware registers.
#[derive(Debug)]
pub(crate) struct RootHub {
    pub address: u8,
    pub configuration: u8,
    pub num_ports: u8,
}

impl RootHub {
    pub fn new(num_ports: u8) -> Self {
        Self {
            address: 0,
            configuration: 0,
            num_ports,
        }
    }

    fn port_reg(&self, port: u16) -> Option<u32> {
        if port == 0 || port > u16::from(self.num_ports) {
            return None;
        }
        Some(regs::HC_RH_PORT_STATUS + 4 * (u32::from(port) - 1))
    }

    /// Builds the hub class descriptor from the live `HcRhDescriptorA/B`
    /// registers.
    fn hub_descriptor(&self, bus: &mut dyn HcBus) -> Vec<u8> {
        let a = bus.mmio_read(regs::HC_RH_DESCRIPTOR_A);
        let b = bus.mmio_read(regs::HC_RH_DESCRIPTOR_B);
        let nports = (a & regs::RH_A_NDP_MASK) as u8;

        let mut characteristics: u16 = 0;
        if a & regs::RH_A_PSM != 0 {
            characteristics |= 0x0001; // per-port power switching
        }
        if a & regs::RH_A_NPS != 0 {
            characteristics |= 0x0002; // no power switching
        }
        if a & regs::RH_A_NOCP != 0 {
            characteristics |= 0x0010; // no over-current protection
        } else if a & regs::RH_A_OCPM != 0 {
            characteristics |= 0x0008; // per-port over-current
        }

        let bitmap_len = (usize::from(nports) + 1 + 7) / 8;
        let mut desc = Vec::with_capacity(7 + 2 * bitmap_len);
        desc.push((7 + 2 * bitmap_len) as u8); // bLength
        desc.push(USB_DESCRIPTOR_TYPE_HUB);
        desc.push(nports); // bNbrPorts
        desc.extend_from_slice(&characteristics.to_le_bytes());
        desc.push(((a >> regs::RH_A_POTPGT_SHIFT) & 0xFF) as u8); // bPwrOn2PwrGood
        desc.push(0x00); // bHubContrCurrent
        // DeviceRemovable straight from HcRhDescriptorB.
        for i in 0..bitmap_len {
            desc.push(((b >> (8 * i)) & 0xFF) as u8);
        }
        // PortPwrCtrlMask: all ports.
        for _ in 0..bitmap_len {
            desc.push(0xFF);
        }
        desc
    }

    fn get_descriptor(&self, bus: &mut dyn HcBus, setup: SetupPacket) -> Option<Vec<u8>> {
        let desc_type = (setup.value >> 8) as u8;
        let index = (setup.value & 0xFF) as u8;
        match desc_type {
            USB_DESCRIPTOR_TYPE_DEVICE => Some(ROOT_HUB_DEVICE_DESCRIPTOR.to_vec()),
            USB_DESCRIPTOR_TYPE_CONFIGURATION => Some(ROOT_HUB_CONFIG_DESCRIPTOR.to_vec()),
            USB_DESCRIPTOR_TYPE_STRING => match index {
                0 => Some(string_descriptor_langid(0x0409)), // en-US
                1 => Some(string_descriptor_utf16le("usb-hcd")),
                2 => Some(string_descriptor_utf16le("OHCI Root Hub")),
                _ => None,
            },
            USB_DESCRIPTOR_TYPE_HUB => Some(self.hub_descriptor(bus)),
            _ => None,
        }
    }

    /// Services one control request. IN data is written to the front of
    /// `data`; the return value is the actual length, truncated to
    /// `wLength`. Unsupported requests stall.
    pub fn control(
        &mut self,
        bus: &mut dyn HcBus,
        setup: SetupPacket,
        data: &mut [u8],
    ) -> UsbResult<usize> {
        let reply: Option<Vec<u8>> = match (setup.request_type, setup.request) {
            // --- standard device requests ---
            (0x80, USB_REQUEST_GET_STATUS) => Some(vec![0x01, 0x00]), // self-powered
            (0x80, USB_REQUEST_GET_DESCRIPTOR) => self.get_descriptor(bus, setup),
            (0x80, USB_REQUEST_GET_CONFIGURATION) => Some(vec![self.configuration]),
            (0x00, USB_REQUEST_SET_ADDRESS) => {
                self.address = (setup.value & 0x7F) as u8;
                debug!(address = self.address, "root hub addressed");
                Some(Vec::new())
            }
            (0x00, USB_REQUEST_SET_CONFIGURATION) => {
                self.configuration = (setup.value & 0xFF) as u8;
                Some(Vec::new())
            }
            (0x00, USB_REQUEST_SET_FEATURE | USB_REQUEST_CLEAR_FEATURE) => None,
            // --- hub class requests ---
            (0xa0, USB_REQUEST_GET_STATUS) => {
                let status = bus.mmio_read(regs::HC_RH_STATUS)
                    & (regs::RH_S_LPS | regs::RH_S_OCI | regs::RH_S_LPSC | regs::RH_S_OCIC);
                Some(status.to_le_bytes().to_vec())
            }
            (0xa0, USB_REQUEST_GET_DESCRIPTOR) => {
                ((setup.value >> 8) as u8 == USB_DESCRIPTOR_TYPE_HUB)
                    .then(|| self.hub_descriptor(bus))
            }
            (0x20, USB_REQUEST_CLEAR_FEATURE) => match setup.value {
                HUB_FEATURE_C_LOCAL_POWER => Some(Vec::new()),
                HUB_FEATURE_C_OVER_CURRENT => {
                    bus.mmio_write(regs::HC_RH_STATUS, regs::RH_S_OCIC);
                    Some(Vec::new())
                }
                _ => None,
            },
            (0xa3, USB_REQUEST_GET_STATUS) => self.port_reg(setup.index).map(|reg| {
                let status = bus.mmio_read(reg)
                    & (0x0000_031F | regs::PORT_CHANGE_MASK);
                status.to_le_bytes().to_vec()
            }),
            (0x23, USB_REQUEST_SET_FEATURE) => {
                let reg = self.port_reg(setup.index);
                match (reg, setup.value) {
                    (Some(reg), PORT_FEATURE_SUSPEND) => {
                        bus.mmio_write(reg, regs::PORT_PSS);
                        Some(Vec::new())
                    }
                    (Some(reg), PORT_FEATURE_RESET) => {
                        bus.mmio_write(reg, regs::PORT_PRS);
                        Some(Vec::new())
                    }
                    (Some(reg), PORT_FEATURE_POWER) => {
                        bus.mmio_write(reg, regs::PORT_PPS);
                        Some(Vec::new())
                    }
                    _ => None,
                }
            }
            (0x23, USB_REQUEST_CLEAR_FEATURE) => {
                let reg = self.port_reg(setup.index);
                // Writes trigger the "clear" alias of each bit.
                let trigger = match setup.value {
                    PORT_FEATURE_ENABLE => Some(regs::PORT_CCS),
                    PORT_FEATURE_SUSPEND => Some(regs::PORT_POCI),
                    PORT_FEATURE_POWER => Some(regs::PORT_LSDA),
                    PORT_FEATURE_C_CONNECTION => Some(regs::PORT_CSC),
                    PORT_FEATURE_C_ENABLE => Some(regs::PORT_PESC),
                    PORT_FEATURE_C_SUSPEND => Some(regs::PORT_PSSC),
                    PORT_FEATURE_C_OVER_CURRENT => Some(regs::PORT_OCIC),
                    PORT_FEATURE_C_RESET => Some(regs::PORT_PRSC),
                    _ => None,
                };
                match (reg, trigger) {
                    (Some(reg), Some(bit)) => {
                        bus.mmio_write(reg, bit);
                        Some(Vec::new())
                    }
                    _ => None,
                }
            }
            _ => None,
        };

        match reply {
            Some(bytes) => {
                let n = bytes.len().min(setup.length as usize).min(data.len());
                data[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            None => Err(UsbError::Transfer(TransferError::Stall)),
        }
    }

    /// Fills `buf` with the status-change bitmap (bit 0 = hub, bit N = port
    /// N). Returns 0 when nothing changed so the poll timer re-arms
    /// silently.
    pub fn status_data(&self, bus: &mut dyn HcBus, buf: &mut [u8]) -> usize {
        let len = ((usize::from(self.num_ports) + 1 + 7) / 8).min(buf.len());
        buf[..len].fill(0);
        let mut changed = false;

        let hub_status = bus.mmio_read(regs::HC_RH_STATUS);
        if hub_status & (regs::RH_S_LPSC | regs::RH_S_OCIC) != 0 {
            buf[0] |= 1;
            changed = true;
        }

        for port in 1..=u16::from(self.num_ports) {
            let Some(reg) = self.port_reg(port) else {
                break;
            };
            if bus.mmio_read(reg) & regs::PORT_CHANGE_MASK != 0 {
                let bit = usize::from(port);
                if bit / 8 < len {
                    buf[bit / 8] |= 1 << (bit % 8);
                }
                changed = true;
            }
        }

        if changed {
            len
        } else {
            0
        }
    }
}
