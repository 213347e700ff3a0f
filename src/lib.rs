//! Bluetooth device and service discovery.
//!
//! One [`DiscoveryEngine`] per process runs at most one discovery at a time on
//! a background worker, over a native stack behind [`BluetoothAdapter`].
//! Results are drained from FIFO queues; [`engine::facade`] exposes the same
//! operations as integer-result-code functions.

pub mod domain;
pub mod engine;
pub mod infrastructure;

pub use domain::error::{AdapterError, Error, Result};
pub use domain::models::{
    BtAddr, DeviceRecord, DiscoveryKind, DiscoveryOutcome, DiscoveryState, ServiceHeader,
    ServiceRecord, ServiceSize,
};
pub use engine::{CancelToken, DiscoveryEngine};
pub use infrastructure::bluetooth::{BluetoothAdapter, ScriptedAdapter};
