//! Process-wide C-style entry points.
//!
//! Every function returns an integer result code instead of a `Result`, and
//! talks to the one engine created by [`init`]. Using any of them before
//! `init` is a programming error and panics.

use crate::domain::models::{BtAddr, DeviceRecord, ServiceRecord, ServiceSize};
use crate::engine::discovery::DiscoveryEngine;
use crate::infrastructure::bluetooth::BluetoothAdapter;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

static ENGINE: Mutex<Option<Arc<DiscoveryEngine>>> = Mutex::new(None);

/// How long `close` waits for calls still running on other threads
const CLOSE_WAIT: Duration = Duration::from_secs(5);

fn slot() -> MutexGuard<'static, Option<Arc<DiscoveryEngine>>> {
    ENGINE.lock().unwrap_or_else(|e| e.into_inner())
}

/// The slot lock is released before `f` runs, so a start that waits for the
/// previous worker cannot block a callback that polls through this facade.
fn with_engine<R>(operation: &str, f: impl FnOnce(&DiscoveryEngine) -> R) -> R {
    let engine = slot().clone();
    match engine {
        Some(engine) => f(&engine),
        None => panic!("Bluetooth {} called before init", operation),
    }
}

/// Create the discovery engine. Panics if it already exists.
pub fn init(adapter: impl BluetoothAdapter) {
    init_shared(Arc::new(adapter))
}

pub fn init_shared(adapter: Arc<dyn BluetoothAdapter>) {
    let mut slot = slot();
    assert!(slot.is_none(), "Bluetooth init called twice");
    match DiscoveryEngine::with_adapter(adapter) {
        Ok(engine) => *slot = Some(Arc::new(engine)),
        Err(e) => panic!("Bluetooth init failed: {}", e),
    }
}

/// Destroy the engine, canceling any running discovery first.
///
/// Calls already running on other threads keep the engine alive; `close`
/// waits for them so that an `init` right after it succeeds.
pub fn close() {
    let Some(mut engine) = slot().take() else {
        warn!("Bluetooth close called without init");
        return;
    };

    // Dropped outside the slot lock; joins the worker
    let deadline = Instant::now() + CLOSE_WAIT;
    loop {
        match Arc::try_unwrap(engine) {
            Ok(last) => {
                drop(last);
                return;
            }
            Err(shared) if Instant::now() < deadline => {
                engine = shared;
                thread::sleep(Duration::from_millis(5));
            }
            Err(shared) => {
                warn!(
                    "Bluetooth engine still in use {:?} after close, releasing later",
                    CLOSE_WAIT
                );
                drop(shared);
                return;
            }
        }
    }
}

pub fn is_initialized() -> bool {
    slot().is_some()
}

/// Fill `out` with the local adapter address. Returns 0 or a negative code.
pub fn get_local_address(out: &mut BtAddr) -> i32 {
    with_engine("getLocalAddress", |engine| match engine.local_address() {
        Ok(address) => {
            *out = address;
            0
        }
        Err(e) => {
            warn!("Local address unavailable: {}", e);
            e.code()
        }
    })
}

/// 0 while running, 1 when finished, negative when canceled or failed
pub fn discovery_state() -> i32 {
    with_engine("discoveryState", |engine| engine.state().code())
}

/// 1 if a running discovery was asked to stop, 0 if nothing was running.
///
/// The operation's callback still arrives, with the canceled code. Wait for
/// it before starting the next discovery.
pub fn cancel_discovery() -> i32 {
    with_engine("cancelDiscovery", |engine| engine.cancel_discovery() as i32)
}

/// 0 if accepted; negative if busy or failed. `callback` gets the terminal code.
pub fn start_device_discovery<F>(callback: F, resolve_names: bool) -> i32
where
    F: FnOnce(i32) + Send + 'static,
{
    with_engine("startDeviceDiscovery", |engine| {
        match engine.start_device_discovery(move |outcome| callback(outcome.code()), resolve_names) {
            Ok(()) => 0,
            Err(e) => {
                debug!("startDeviceDiscovery rejected: {}", e);
                e.code()
            }
        }
    })
}

/// 1 and fills `out` if a device was queued, 0 if the queue is empty
pub fn get_next_device(out: &mut DeviceRecord) -> i32 {
    with_engine("getNextDevice", |engine| match engine.next_device() {
        Some(device) => {
            *out = device;
            1
        }
        None => 0,
    })
}

/// 0 if accepted; negative if busy or failed. `callback` gets the terminal code.
pub fn start_service_discovery<F>(callback: F, address: &BtAddr, uuid: &Uuid) -> i32
where
    F: FnOnce(i32) + Send + 'static,
{
    with_engine("startServiceDiscovery", |engine| {
        match engine.start_service_discovery(move |outcome| callback(outcome.code()), *address, *uuid)
        {
            Ok(()) => 0,
            Err(e) => {
                debug!("startServiceDiscovery rejected: {}", e);
                e.code()
            }
        }
    })
}

/// 1 and fills `out` if a service was queued, 0 if the queue is empty
pub fn get_next_service(out: &mut ServiceRecord) -> i32 {
    with_engine("getNextService", |engine| match engine.next_service() {
        Some(service) => {
            *out = service;
            1
        }
        None => 0,
    })
}

/// 1 and fills `out` with the head service's sizes, 0 if the queue is empty.
/// The head is not consumed.
pub fn get_next_service_size(out: &mut ServiceSize) -> i32 {
    with_engine("getNextServiceSize", |engine| match engine.next_service_size() {
        Some(size) => {
            *out = size;
            1
        }
        None => 0,
    })
}
