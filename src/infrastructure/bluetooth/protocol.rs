//! Bluetooth Assigned Numbers
//!
//! UUIDs and class-of-device fields used when talking to a Bluetooth stack.

use anyhow::Result;
use uuid::Uuid;

const BASE: u128 = 0x0000_0000_0000_1000_8000_0080_5F9B_34FB;

/// Bluetooth Base UUID: 00000000-0000-1000-8000-00805F9B34FB
pub const BASE_UUID: Uuid = Uuid::from_u128(BASE);

/// Well-known 16-bit service and protocol UUIDs
pub mod short {
    pub const SDP: u16 = 0x0001;
    pub const RFCOMM: u16 = 0x0003;
    pub const OBEX: u16 = 0x0008;
    pub const L2CAP: u16 = 0x0100;
    pub const SERVICE_DISCOVERY_SERVER: u16 = 0x1000;
    pub const PUBLIC_BROWSE_GROUP: u16 = 0x1002;
    pub const SERIAL_PORT: u16 = 0x1101;
    pub const OBEX_OBJECT_PUSH: u16 = 0x1105;
    pub const OBEX_FILE_TRANSFER: u16 = 0x1106;
    pub const HEADSET: u16 = 0x1108;
    pub const AUDIO_SINK: u16 = 0x110B;
    pub const HANDSFREE: u16 = 0x111E;
    pub const HID: u16 = 0x1124;
}

/// Serial Port Profile
pub const SERIAL_PORT_UUID: Uuid = from_short(short::SERIAL_PORT);

/// Matches every browsable service on a device
pub const PUBLIC_BROWSE_GROUP_UUID: Uuid = from_short(short::PUBLIC_BROWSE_GROUP);

/// Expand a 16-bit assigned number onto the Base UUID
pub const fn from_short(value: u16) -> Uuid {
    from_u32(value as u32)
}

/// Expand a 32-bit assigned number onto the Base UUID
pub const fn from_u32(value: u32) -> Uuid {
    Uuid::from_u128(BASE | ((value as u128) << 96))
}

/// The 32-bit assigned number of `uuid` if it lies on the Base UUID
pub fn to_u32(uuid: &Uuid) -> Option<u32> {
    let raw = uuid.as_u128();
    if raw & ((1u128 << 96) - 1) == BASE {
        Some((raw >> 96) as u32)
    } else {
        None
    }
}

/// Whether a service UUID passes a discovery filter.
///
/// The nil UUID and the public browse group match everything.
pub fn matches_filter(filter: &Uuid, service: &Uuid) -> bool {
    filter.is_nil() || *filter == PUBLIC_BROWSE_GROUP_UUID || filter == service
}

/// Parse a UUID given either as a 4/8 hex digit assigned number or in full
///
/// # Examples
/// `"1101"`, `"0x1101"`, `"00001101"` and
/// `"00001101-0000-1000-8000-00805f9b34fb"` all name the Serial Port Profile.
pub fn parse_uuid(uuid_str: &str) -> Result<Uuid> {
    let s = uuid_str.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);

    match s.len() {
        4 | 8 => {
            let value = u32::from_str_radix(s, 16)
                .map_err(|_| anyhow::anyhow!("Invalid UUID format: {}", uuid_str))?;
            Ok(from_u32(value))
        }
        _ => Uuid::parse_str(s).map_err(|e| anyhow::anyhow!("Invalid UUID {}: {}", uuid_str, e)),
    }
}

/// Major device class, bits 8-12 of the class-of-device field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MajorDeviceClass {
    Miscellaneous,
    Computer,
    Phone,
    NetworkAccessPoint,
    AudioVideo,
    Peripheral,
    Imaging,
    Wearable,
    Toy,
    Health,
    Uncategorized,
    Reserved(u8),
}

impl MajorDeviceClass {
    pub fn from_class(class_of_device: u32) -> Self {
        match ((class_of_device >> 8) & 0x1F) as u8 {
            0x00 => Self::Miscellaneous,
            0x01 => Self::Computer,
            0x02 => Self::Phone,
            0x03 => Self::NetworkAccessPoint,
            0x04 => Self::AudioVideo,
            0x05 => Self::Peripheral,
            0x06 => Self::Imaging,
            0x07 => Self::Wearable,
            0x08 => Self::Toy,
            0x09 => Self::Health,
            0x1F => Self::Uncategorized,
            other => Self::Reserved(other),
        }
    }
}

/// Minor device class, bits 2-7
pub fn minor_device_class(class_of_device: u32) -> u8 {
    ((class_of_device >> 2) & 0x3F) as u8
}

/// Major service classes advertised in bits 13-23
pub fn service_classes(class_of_device: u32) -> Vec<&'static str> {
    const NAMES: [(u32, &str); 10] = [
        (13, "Limited Discoverable"),
        (14, "LE Audio"),
        (16, "Positioning"),
        (17, "Networking"),
        (18, "Rendering"),
        (19, "Capturing"),
        (20, "Object Transfer"),
        (21, "Audio"),
        (22, "Telephony"),
        (23, "Information"),
    ];
    NAMES
        .iter()
        .filter(|(bit, _)| class_of_device & (1 << bit) != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Hex dump used when printing attribute blobs
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
