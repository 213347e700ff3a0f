use crate::domain::error::CONNERR_CANCELED;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Class-of-device is a 24-bit field.
pub const CLASS_OF_DEVICE_MASK: u32 = 0x00FF_FFFF;

/// A 48-bit Bluetooth device address, most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BtAddr([u8; 6]);

impl BtAddr {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Address packed into the low 48 bits of a `u64`
    pub fn to_u64(self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
    }

    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 6];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (value >> (8 * (5 - i))) as u8;
        }
        Self(bytes)
    }
}

impl From<[u8; 6]> for BtAddr {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl From<BtAddr> for [u8; 6] {
    fn from(addr: BtAddr) -> Self {
        addr.0
    }
}

impl fmt::Display for BtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid Bluetooth address: {0:?}")]
pub struct InvalidAddress(pub String);

impl FromStr for BtAddr {
    type Err = InvalidAddress;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidAddress(s.to_string());
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for b in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *b = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for BtAddr {
    type Error = InvalidAddress;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BtAddr> for String {
    fn from(addr: BtAddr) -> Self {
        addr.to_string()
    }
}

/// A device reported by device discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    address: BtAddr,
    name: String,
    class_of_device: u32,
}

impl DeviceRecord {
    pub fn new(address: BtAddr, name: impl Into<String>, class_of_device: u32) -> Self {
        Self {
            address,
            name: name.into(),
            class_of_device: class_of_device & CLASS_OF_DEVICE_MASK,
        }
    }

    pub fn address(&self) -> BtAddr {
        self.address
    }

    /// Empty when names were not requested or could not be resolved
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_of_device(&self) -> u32 {
        self.class_of_device
    }
}

impl Default for DeviceRecord {
    fn default() -> Self {
        Self::new(BtAddr::default(), String::new(), 0)
    }
}

/// Everything about a service record except its attribute blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceHeader {
    pub address: BtAddr,
    pub uuid: Uuid,
    pub name: String,
    pub port: Option<u8>,
}

/// A service reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    header: ServiceHeader,
    attributes: Vec<u8>,
}

impl ServiceRecord {
    pub fn new(address: BtAddr, uuid: Uuid, attributes: Vec<u8>) -> Self {
        Self {
            header: ServiceHeader {
                address,
                uuid,
                name: String::new(),
                port: None,
            },
            attributes,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.header.name = name.into();
        self
    }

    pub fn with_port(mut self, port: u8) -> Self {
        self.header.port = Some(port);
        self
    }

    pub fn address(&self) -> BtAddr {
        self.header.address
    }

    pub fn uuid(&self) -> Uuid {
        self.header.uuid
    }

    pub fn name(&self) -> &str {
        &self.header.name
    }

    pub fn port(&self) -> Option<u8> {
        self.header.port
    }

    pub fn attributes(&self) -> &[u8] {
        &self.attributes
    }

    pub fn header(&self) -> &ServiceHeader {
        &self.header
    }

    pub fn size(&self) -> ServiceSize {
        ServiceSize {
            attributes: self.attributes.len(),
            name: self.header.name.len(),
        }
    }

    pub fn into_parts(self) -> (ServiceHeader, Vec<u8>) {
        (self.header, self.attributes)
    }
}

impl Default for ServiceRecord {
    fn default() -> Self {
        Self::new(BtAddr::default(), Uuid::nil(), Vec::new())
    }
}

/// Buffer sizes needed to receive the next queued service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceSize {
    pub attributes: usize,
    pub name: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryKind {
    Device,
    Service,
}

/// The current or most recently completed discovery operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiscoveryState {
    #[default]
    Idle,
    DeviceDiscoveryRunning,
    ServiceDiscoveryRunning,
    Finished,
    Canceled,
    Failed(i32),
}

impl DiscoveryState {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::DeviceDiscoveryRunning | Self::ServiceDiscoveryRunning
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Canceled | Self::Failed(_))
    }

    pub fn running(kind: DiscoveryKind) -> Self {
        match kind {
            DiscoveryKind::Device => Self::DeviceDiscoveryRunning,
            DiscoveryKind::Service => Self::ServiceDiscoveryRunning,
        }
    }

    /// 0 while running, 1 when idle or finished, negative on cancel/failure
    pub fn code(&self) -> i32 {
        match self {
            Self::DeviceDiscoveryRunning | Self::ServiceDiscoveryRunning => 0,
            Self::Idle | Self::Finished => 1,
            Self::Canceled => CONNERR_CANCELED,
            Self::Failed(code) => *code,
        }
    }
}

impl From<DiscoveryOutcome> for DiscoveryState {
    fn from(outcome: DiscoveryOutcome) -> Self {
        match outcome {
            DiscoveryOutcome::Finished => Self::Finished,
            DiscoveryOutcome::Canceled => Self::Canceled,
            DiscoveryOutcome::Failed(code) => Self::Failed(code),
        }
    }
}

/// Terminal result of one discovery operation, handed to its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    Finished,
    Canceled,
    Failed(i32),
}

impl DiscoveryOutcome {
    pub fn code(&self) -> i32 {
        DiscoveryState::from(*self).code()
    }
}
