//! Scripted Adapter
//!
//! An in-memory radio environment. Devices and services are replayed in the
//! order they were added, optionally with a delay between records, a pause
//! point, or a scripted failure at the end.

use super::{protocol, BluetoothAdapter, RecordSink};
use crate::domain::error::AdapterError;
use crate::domain::models::{BtAddr, DeviceRecord, ServiceRecord};
use crate::engine::cancel::CancelToken;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_millis(2);

#[derive(Debug, Clone)]
struct ScriptedDevice {
    address: BtAddr,
    /// `None` makes name resolution fail for this device
    name: Option<String>,
    class_of_device: u32,
}

/// Pause point shared between the adapter and a test.
struct Pause {
    after: usize,
    reached: Mutex<Option<mpsc::Sender<()>>>,
    released: AtomicBool,
}

/// Test-side handle for a pause set with [`ScriptedAdapter::pause_after`].
pub struct PauseHandle {
    reached: mpsc::Receiver<()>,
    pause: Arc<Pause>,
}

impl PauseHandle {
    /// Block until the adapter has reported the configured number of records
    pub fn wait_reached(&self, timeout: Duration) -> bool {
        self.reached.recv_timeout(timeout).is_ok()
    }

    /// Let the adapter continue past the pause point
    pub fn release(&self) {
        self.pause.released.store(true, Ordering::Release);
    }
}

pub struct ScriptedAdapter {
    local_address: Option<BtAddr>,
    devices: Vec<ScriptedDevice>,
    services: Vec<ServiceRecord>,
    record_delay: Duration,
    device_failure: Option<AdapterError>,
    service_failure: Option<AdapterError>,
    ignore_cancel: bool,
    pause: Option<Arc<Pause>>,
}

impl ScriptedAdapter {
    pub fn new(local_address: BtAddr) -> Self {
        Self {
            local_address: Some(local_address),
            devices: Vec::new(),
            services: Vec::new(),
            record_delay: Duration::ZERO,
            device_failure: None,
            service_failure: None,
            ignore_cancel: false,
            pause: None,
        }
    }

    /// An adapter whose radio is switched off: every call fails
    pub fn unavailable() -> Self {
        let mut adapter = Self::new(BtAddr::default());
        adapter.local_address = None;
        adapter
    }

    pub fn with_device(mut self, address: BtAddr, name: &str, class_of_device: u32) -> Self {
        self.devices.push(ScriptedDevice {
            address,
            name: Some(name.to_string()),
            class_of_device,
        });
        self
    }

    /// A device whose remote name request fails
    pub fn with_nameless_device(mut self, address: BtAddr, class_of_device: u32) -> Self {
        self.devices.push(ScriptedDevice {
            address,
            name: None,
            class_of_device,
        });
        self
    }

    pub fn with_service(mut self, service: ServiceRecord) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_record_delay(mut self, delay: Duration) -> Self {
        self.record_delay = delay;
        self
    }

    /// Fail device discovery after all scripted devices were reported
    pub fn fail_devices_with(mut self, error: AdapterError) -> Self {
        self.device_failure = Some(error);
        self
    }

    pub fn fail_services_with(mut self, error: AdapterError) -> Self {
        self.service_failure = Some(error);
        self
    }

    /// Keep reporting records after cancellation, like a stack that only
    /// notices cancellation when its scan ends
    pub fn ignoring_cancel(mut self) -> Self {
        self.ignore_cancel = true;
        self
    }

    /// Stop after `after` records of any enumeration until released or canceled
    pub fn pause_after(mut self, after: usize) -> (Self, PauseHandle) {
        let (tx, rx) = mpsc::channel();
        let pause = Arc::new(Pause {
            after,
            reached: Mutex::new(Some(tx)),
            released: AtomicBool::new(false),
        });
        self.pause = Some(Arc::clone(&pause));
        (self, PauseHandle { reached: rx, pause })
    }

    fn check_available(&self) -> Result<(), AdapterError> {
        match self.local_address {
            Some(_) => Ok(()),
            None => Err(AdapterError::Unavailable("radio is off".to_string())),
        }
    }

    fn is_cancelled(&self, cancel: &CancelToken) -> bool {
        !self.ignore_cancel && cancel.is_cancelled()
    }

    /// Sleep in small slices so cancellation is noticed quickly
    fn wait(&self, duration: Duration, cancel: &CancelToken) -> bool {
        let mut left = duration;
        while !left.is_zero() {
            if self.is_cancelled(cancel) {
                return false;
            }
            let step = left.min(POLL_INTERVAL);
            std::thread::sleep(step);
            left -= step;
        }
        !self.is_cancelled(cancel)
    }

    fn wait_at_pause(&self, reported: usize, cancel: &CancelToken) -> bool {
        let Some(pause) = &self.pause else {
            return true;
        };
        if reported != pause.after {
            return true;
        }
        if let Some(tx) = pause.reached.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
        while !pause.released.load(Ordering::Acquire) {
            if self.is_cancelled(cancel) {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        true
    }

    /// Replay `records` into `sink`, honoring delay, pause and cancellation
    fn replay<T>(
        &self,
        records: impl IntoIterator<Item = T>,
        sink: RecordSink<'_, T>,
        cancel: &CancelToken,
    ) -> ControlFlow<()> {
        for (reported, record) in records.into_iter().enumerate() {
            if !self.wait_at_pause(reported, cancel) || !self.wait(self.record_delay, cancel) {
                return ControlFlow::Break(());
            }
            sink(record)?;
        }
        ControlFlow::Continue(())
    }
}

impl BluetoothAdapter for ScriptedAdapter {
    fn local_address(&self) -> Result<BtAddr, AdapterError> {
        self.local_address
            .ok_or_else(|| AdapterError::Unavailable("radio is off".to_string()))
    }

    fn enumerate_devices(
        &self,
        resolve_names: bool,
        sink: RecordSink<'_, DeviceRecord>,
        cancel: &CancelToken,
    ) -> Result<(), AdapterError> {
        self.check_available()?;

        let records = self.devices.iter().map(|device| {
            let name = match (&device.name, resolve_names) {
                (_, false) => String::new(),
                (Some(name), true) => name.clone(),
                (None, true) => {
                    warn!("Name request for {} failed", device.address);
                    String::new()
                }
            };
            debug!("Scripted device {} ({:?})", device.address, name);
            DeviceRecord::new(device.address, name, device.class_of_device)
        });

        if self.replay(records, sink, cancel).is_break() {
            return Ok(());
        }

        match &self.device_failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn enumerate_services(
        &self,
        address: BtAddr,
        uuid: Uuid,
        sink: RecordSink<'_, ServiceRecord>,
        cancel: &CancelToken,
    ) -> Result<(), AdapterError> {
        self.check_available()?;

        let known = self.devices.iter().any(|d| d.address == address)
            || self.services.iter().any(|s| s.address() == address);
        if !known {
            return Err(AdapterError::NotFound(address));
        }

        let records = self
            .services
            .iter()
            .filter(|s| s.address() == address && protocol::matches_filter(&uuid, &s.uuid()))
            .cloned();

        if self.replay(records, sink, cancel).is_break() {
            return Ok(());
        }

        match &self.service_failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}
