//! Wire-level USB vocabulary shared by the dispatch core and controller
//! drivers: the 8-byte SETUP packet, standard request/descriptor constants
//! and the pipe attribute enums.

pub const USB_DESCRIPTOR_TYPE_DEVICE: u8 = 0x01;
pub const USB_DESCRIPTOR_TYPE_CONFIGURATION: u8 = 0x02;
pub const USB_DESCRIPTOR_TYPE_STRING: u8 = 0x03;
pub const USB_DESCRIPTOR_TYPE_INTERFACE: u8 = 0x04;
pub const USB_DESCRIPTOR_TYPE_ENDPOINT: u8 = 0x05;
pub const USB_DESCRIPTOR_TYPE_HUB: u8 = 0x29;

pub const USB_REQUEST_GET_STATUS: u8 = 0x00;
pub const USB_REQUEST_CLEAR_FEATURE: u8 = 0x01;
pub const USB_REQUEST_SET_FEATURE: u8 = 0x03;
pub const USB_REQUEST_SET_ADDRESS: u8 = 0x05;
pub const USB_REQUEST_GET_DESCRIPTOR: u8 = 0x06;
pub const USB_REQUEST_GET_CONFIGURATION: u8 = 0x08;
pub const USB_REQUEST_SET_CONFIGURATION: u8 = 0x09;
pub const USB_REQUEST_GET_INTERFACE: u8 = 0x0a;
pub const USB_REQUEST_SET_INTERFACE: u8 = 0x0b;

pub const USB_FEATURE_ENDPOINT_HALT: u16 = 0;
pub const USB_FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 1;

/// The fixed-layout 8-byte SETUP packet that starts every control transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn to_bytes(self) -> [u8; 8] {
        let v = self.value.to_le_bytes();
        let i = self.index.to_le_bytes();
        let l = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            v[0],
            v[1],
            i[0],
            i[1],
            l[0],
            l[1],
        ]
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// True for device-to-host requests (bit 7 of `bmRequestType`).
    pub fn is_in(self) -> bool {
        self.request_type & 0x80 != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,
    Full,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

impl TransferType {
    /// Periodic transfers reserve frame bandwidth and live on the periodic
    /// schedule.
    pub fn is_periodic(self) -> bool {
        matches!(self, TransferType::Interrupt | TransferType::Isochronous)
    }
}
