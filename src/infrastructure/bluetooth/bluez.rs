//! BlueZ Adapter
//!
//! Drives the BlueZ daemon over D-Bus through `bluer`. The trait calls are
//! blocking, so the adapter owns a small tokio runtime and blocks on it from
//! the discovery worker thread.

use super::{protocol, BluetoothAdapter, RecordSink};
use crate::domain::error::{AdapterError, CONNERR_GENERIC};
use crate::domain::models::{BtAddr, DeviceRecord, ServiceRecord};
use crate::domain::settings::DiscoverySettings;
use crate::engine::cancel::CancelToken;
use bluer::{AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport};
use futures::StreamExt;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tunables taken from [`DiscoverySettings`]
#[derive(Debug, Clone)]
pub struct BluezConfig {
    pub adapter_name: Option<String>,
    pub scan_duration: Duration,
    pub name_timeout: Duration,
}

impl From<&DiscoverySettings> for BluezConfig {
    fn from(s: &DiscoverySettings) -> Self {
        Self {
            adapter_name: s.adapter_name.clone(),
            scan_duration: Duration::from_millis(s.scan_duration_ms),
            name_timeout: Duration::from_millis(s.name_timeout_ms),
        }
    }
}

pub struct BluezAdapter {
    runtime: Runtime,
    // Keeps the D-Bus connection alive for `adapter`
    _session: bluer::Session,
    adapter: bluer::Adapter,
    config: BluezConfig,
}

fn map_err(e: bluer::Error) -> AdapterError {
    match e.kind {
        bluer::ErrorKind::NotReady | bluer::ErrorKind::NotAvailable => {
            AdapterError::Unavailable(e.to_string())
        }
        _ => AdapterError::Io {
            code: CONNERR_GENERIC,
            message: e.to_string(),
        },
    }
}

fn to_addr(address: Address) -> BtAddr {
    BtAddr::new(address.0)
}

impl BluezAdapter {
    pub fn new(config: BluezConfig) -> Result<Self, AdapterError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("bluez-io")
            .enable_all()
            .build()
            .map_err(|e| AdapterError::Unavailable(format!("Failed to start runtime: {}", e)))?;

        let (session, adapter) = runtime.block_on(async {
            let session = bluer::Session::new().await.map_err(map_err)?;
            let adapter = match &config.adapter_name {
                Some(name) => session.adapter(name).map_err(map_err)?,
                None => session.default_adapter().await.map_err(map_err)?,
            };
            if !adapter.is_powered().await.map_err(map_err)? {
                info!("Powering on Bluetooth adapter {}", adapter.name());
                adapter.set_powered(true).await.map_err(map_err)?;
            }
            Ok::<_, AdapterError>((session, adapter))
        })?;

        info!("Using Bluetooth adapter: {}", adapter.name());

        Ok(Self {
            runtime,
            _session: session,
            adapter,
            config,
        })
    }

    async fn resolve_name(&self, device: &bluer::Device) -> String {
        match tokio::time::timeout(self.config.name_timeout, device.name()).await {
            Ok(Ok(Some(name))) => name,
            Ok(Ok(None)) => {
                debug!("No name known for {}", device.address());
                String::new()
            }
            Ok(Err(e)) => {
                warn!("Name request for {} failed: {}", device.address(), e);
                String::new()
            }
            Err(_) => {
                warn!("Name request for {} timed out", device.address());
                String::new()
            }
        }
    }

    async fn report_device(
        &self,
        address: Address,
        resolve_names: bool,
        sink: RecordSink<'_, DeviceRecord>,
    ) -> Result<ControlFlow<()>, AdapterError> {
        let device = self.adapter.device(address).map_err(map_err)?;
        let class_of_device = device.class().await.map_err(map_err)?.unwrap_or(0);
        let name = if resolve_names {
            self.resolve_name(&device).await
        } else {
            String::new()
        };
        debug!("Found device {} ({:?}), class {:#08X}", address, name, class_of_device);
        Ok(sink(DeviceRecord::new(to_addr(address), name, class_of_device)))
    }

    async fn discover_devices(
        &self,
        resolve_names: bool,
        sink: RecordSink<'_, DeviceRecord>,
        cancel: &CancelToken,
    ) -> Result<(), AdapterError> {
        self.adapter
            .set_discovery_filter(DiscoveryFilter {
                transport: DiscoveryTransport::BrEdr,
                ..Default::default()
            })
            .await
            .map_err(map_err)?;

        // Discovery stops when the stream is dropped
        let events = self.adapter.discover_devices().await.map_err(map_err)?;
        tokio::pin!(events);

        let deadline = tokio::time::sleep(self.config.scan_duration);
        tokio::pin!(deadline);

        let mut seen = HashSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Device inquiry canceled");
                    return Ok(());
                }
                _ = &mut deadline => {
                    debug!("Inquiry window elapsed, {} device(s)", seen.len());
                    return Ok(());
                }
                event = events.next() => match event {
                    Some(AdapterEvent::DeviceAdded(address)) => {
                        if !seen.insert(address) {
                            continue;
                        }
                        if self.report_device(address, resolve_names, &mut *sink).await?.is_break() {
                            return Ok(());
                        }
                    }
                    Some(_) => {}
                    None => return Ok(()),
                }
            }
        }
    }

    async fn discover_services(
        &self,
        address: BtAddr,
        uuid: Uuid,
        sink: RecordSink<'_, ServiceRecord>,
        cancel: &CancelToken,
    ) -> Result<(), AdapterError> {
        let bluer_addr = Address::new(*address.as_bytes());
        let known = self.adapter.device_addresses().await.map_err(map_err)?;
        if !known.contains(&bluer_addr) {
            return Err(AdapterError::NotFound(address));
        }

        let device = self.adapter.device(bluer_addr).map_err(map_err)?;
        // Service class UUIDs come from the SDP/EIR data BlueZ already holds
        let uuids = device.uuids().await.map_err(map_err)?.unwrap_or_default();
        let service_data = device.service_data().await.map_err(map_err)?.unwrap_or_default();

        let mut matching: Vec<Uuid> = uuids
            .into_iter()
            .filter(|u| protocol::matches_filter(&uuid, u))
            .collect();
        matching.sort();

        for service_uuid in matching {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let attributes = service_data.get(&service_uuid).cloned().unwrap_or_default();
            debug!("Service {} on {}", service_uuid, address);
            if sink(ServiceRecord::new(address, service_uuid, attributes)).is_break() {
                return Ok(());
            }
        }
        Ok(())
    }
}

impl BluetoothAdapter for BluezAdapter {
    fn local_address(&self) -> Result<BtAddr, AdapterError> {
        self.runtime
            .block_on(self.adapter.address())
            .map(to_addr)
            .map_err(map_err)
    }

    fn enumerate_devices(
        &self,
        resolve_names: bool,
        sink: RecordSink<'_, DeviceRecord>,
        cancel: &CancelToken,
    ) -> Result<(), AdapterError> {
        self.runtime
            .block_on(self.discover_devices(resolve_names, sink, cancel))
    }

    fn enumerate_services(
        &self,
        address: BtAddr,
        uuid: Uuid,
        sink: RecordSink<'_, ServiceRecord>,
        cancel: &CancelToken,
    ) -> Result<(), AdapterError> {
        self.runtime
            .block_on(self.discover_services(address, uuid, sink, cancel))
    }
}
