//! Error types and the integer result codes used by the C-style facade.

use crate::domain::models::BtAddr;
use thiserror::Error;

/// Generic failure.
pub const CONNERR_GENERIC: i32 = -2;
/// Too many operations in flight (a discovery is already running).
pub const CONNERR_MAX: i32 = -3;
/// Internal inconsistency.
pub const CONNERR_INTERNAL: i32 = -5;
/// The Bluetooth adapter is not available.
pub const CONNERR_UNAVAILABLE: i32 = -12;
/// The operation was canceled by the caller.
pub const CONNERR_CANCELED: i32 = -13;
/// The requested device or service could not be found.
pub const CONNERR_NOTFOUND: i32 = -17;

/// Codes with a fixed meaning that adapter codes must not shadow
const RESERVED_CODES: [i32; 6] = [
    CONNERR_GENERIC,
    CONNERR_MAX,
    CONNERR_INTERNAL,
    CONNERR_UNAVAILABLE,
    CONNERR_CANCELED,
    CONNERR_NOTFOUND,
];

/// Failures reported by a native Bluetooth adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("Bluetooth adapter unavailable: {0}")]
    Unavailable(String),
    #[error("Bluetooth I/O error {code}: {message}")]
    Io { code: i32, message: String },
    #[error("Device {0} not found")]
    NotFound(BtAddr),
    #[error("Operation canceled")]
    Canceled,
}

impl AdapterError {
    /// Negative result code for this failure. `Io` keeps the adapter's own code
    /// when it is negative and not one of the `CONNERR_*` codes; the raw code
    /// is always in the message.
    pub fn code(&self) -> i32 {
        match self {
            Self::Unavailable(_) => CONNERR_UNAVAILABLE,
            Self::Io { code, .. } if *code < 0 && !RESERVED_CODES.contains(code) => *code,
            Self::Io { .. } => CONNERR_GENERIC,
            Self::NotFound(_) => CONNERR_NOTFOUND,
            Self::Canceled => CONNERR_CANCELED,
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("A discovery engine is already alive in this process")]
    AlreadyInitialized,
    #[error("A discovery operation is already running")]
    Busy,
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("Buffer too small: {needed} bytes needed")]
    BufferTooSmall { needed: usize },
    #[error("Failed to spawn discovery worker: {0}")]
    Spawn(#[source] std::io::Error),
}

impl Error {
    pub fn code(&self) -> i32 {
        match self {
            Self::AlreadyInitialized => CONNERR_INTERNAL,
            Self::Busy => CONNERR_MAX,
            Self::Adapter(e) => e.code(),
            Self::BufferTooSmall { .. } => CONNERR_GENERIC,
            Self::Spawn(_) => CONNERR_INTERNAL,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
