//! Bluetooth Module
//!
//! Native stack adapters used by the discovery engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               DiscoveryEngine                 │
//! │  (state machine, worker thread, queues)       │
//! └──────────────────────┬───────────────────────┘
//!                        │ dyn BluetoothAdapter
//!          ┌─────────────┼──────────────┐
//!          ▼             ▼              ▼
//!   ┌────────────┐ ┌──────────────┐ ┌──────────┐
//!   │   BlueZ    │ │  Scripted    │ │ Protocol │
//!   │ (D-Bus,    │ │ (in-memory   │ │ - UUIDs  │
//!   │  Linux)    │ │  fake)       │ │ - CoD    │
//!   └────────────┘ └──────────────┘ └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Well-known UUIDs, UUID parsing and class-of-device decoding
//! - [`scripted`] - Replays a scripted radio environment, for tests and demos
//! - `bluez` - BlueZ adapter (feature `bluez`, Linux only)

pub mod protocol;
pub mod scripted;

#[cfg(all(feature = "bluez", target_os = "linux"))]
pub mod bluez;

#[cfg(all(feature = "bluez", target_os = "linux"))]
pub use bluez::BluezAdapter;
pub use scripted::ScriptedAdapter;

use crate::domain::error::AdapterError;
use crate::domain::models::{BtAddr, DeviceRecord, ServiceRecord};
use crate::engine::cancel::CancelToken;
use std::ops::ControlFlow;
use uuid::Uuid;

/// Receives records as the adapter reports them. `Break` asks the adapter to
/// stop enumerating.
pub type RecordSink<'a, T> = &'a mut dyn FnMut(T) -> ControlFlow<()>;

/// The native Bluetooth stack as seen by the discovery engine.
///
/// Enumeration calls block for as long as the radio needs (seconds). They must
/// check `cancel` between records and return promptly once it is set.
pub trait BluetoothAdapter: Send + Sync + 'static {
    /// Address of the local controller
    fn local_address(&self) -> Result<BtAddr, AdapterError>;

    /// Report nearby devices in discovery order.
    ///
    /// A device whose name cannot be resolved is still reported, with an
    /// empty name.
    fn enumerate_devices(
        &self,
        resolve_names: bool,
        sink: RecordSink<'_, DeviceRecord>,
        cancel: &CancelToken,
    ) -> Result<(), AdapterError>;

    /// Report the services of `address` matching the `uuid` filter
    fn enumerate_services(
        &self,
        address: BtAddr,
        uuid: Uuid,
        sink: RecordSink<'_, ServiceRecord>,
        cancel: &CancelToken,
    ) -> Result<(), AdapterError>;
}
