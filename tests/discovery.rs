use bt_discovery::domain::error::{
    AdapterError, Error, CONNERR_CANCELED, CONNERR_INTERNAL, CONNERR_NOTFOUND,
};
use bt_discovery::infrastructure::bluetooth::{protocol, BluetoothAdapter, RecordSink};
use bt_discovery::{
    BtAddr, CancelToken, DeviceRecord, DiscoveryEngine, DiscoveryOutcome, DiscoveryState,
    ScriptedAdapter, ServiceRecord,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

const TIMEOUT: Duration = Duration::from_secs(5);

// Only one engine may exist per process
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

fn addr(last: u8) -> BtAddr {
    BtAddr::new([0x00, 0x11, 0x22, 0x33, 0x44, last])
}

fn three_devices() -> ScriptedAdapter {
    ScriptedAdapter::new(addr(0))
        .with_device(addr(0xA), "Alpha", 0x5A020C)
        .with_device(addr(0xB), "Bravo", 0x240404)
        .with_device(addr(0xC), "Charlie", 0x040680)
}

/// Callback that reports every invocation on a channel
fn recorder() -> (
    impl FnOnce(DiscoveryOutcome) + Send + 'static,
    mpsc::Receiver<DiscoveryOutcome>,
) {
    let (tx, rx) = mpsc::channel();
    (
        move |outcome| {
            let _ = tx.send(outcome);
        },
        rx,
    )
}

fn wait_outcome(rx: &mpsc::Receiver<DiscoveryOutcome>) -> DiscoveryOutcome {
    rx.recv_timeout(TIMEOUT).expect("terminal callback not delivered")
}

fn drain_devices(engine: &DiscoveryEngine) -> Vec<DeviceRecord> {
    std::iter::from_fn(|| engine.next_device()).collect()
}

#[test]
fn test_three_devices_without_names_in_order() {
    let _guard = serial();
    let engine = DiscoveryEngine::new(three_devices()).unwrap();
    let (cb, rx) = recorder();

    engine.start_device_discovery(cb, false).unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Finished);
    assert_eq!(engine.state(), DiscoveryState::Finished);

    let devices = drain_devices(&engine);
    let addresses: Vec<_> = devices.iter().map(|d| d.address()).collect();
    assert_eq!(addresses, vec![addr(0xA), addr(0xB), addr(0xC)]);
    assert!(devices.iter().all(|d| d.name().is_empty()));
    assert!(engine.next_device().is_none());
}

#[test]
fn test_names_resolved_and_partial_failure_tolerated() {
    let _guard = serial();
    let adapter = ScriptedAdapter::new(addr(0))
        .with_device(addr(1), "Phone", 0x5A020C)
        .with_nameless_device(addr(2), 0x240404);
    let engine = DiscoveryEngine::new(adapter).unwrap();
    let (cb, rx) = recorder();

    engine.start_device_discovery(cb, true).unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Finished);

    let devices = drain_devices(&engine);
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].name(), "Phone");
    assert_eq!(devices[1].name(), "");
    assert_eq!(devices[1].class_of_device(), 0x240404);
}

#[test]
fn test_second_start_while_running_is_busy() {
    let _guard = serial();
    let (adapter, pause) = three_devices().pause_after(1);
    let engine = DiscoveryEngine::new(adapter).unwrap();
    let (cb, rx) = recorder();

    engine.start_device_discovery(cb, false).unwrap();
    assert!(pause.wait_reached(TIMEOUT));

    let (other_cb, other_rx) = recorder();
    let err = engine.start_device_discovery(other_cb, false).unwrap_err();
    assert!(matches!(err, Error::Busy));
    let (svc_cb, _svc_rx) = recorder();
    let err = engine
        .start_service_discovery(svc_cb, addr(0xA), protocol::SERIAL_PORT_UUID)
        .unwrap_err();
    assert!(matches!(err, Error::Busy));

    // The in-flight operation is untouched
    assert_eq!(engine.state(), DiscoveryState::DeviceDiscoveryRunning);
    assert_eq!(engine.pending_devices(), 1);

    pause.release();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Finished);
    assert_eq!(drain_devices(&engine).len(), 3);
    // The rejected callback is dropped without firing
    assert!(other_rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn test_cancel_after_first_device() {
    let _guard = serial();
    let (adapter, pause) = three_devices().pause_after(1);
    let engine = DiscoveryEngine::new(adapter).unwrap();
    let (cb, rx) = recorder();

    engine.start_device_discovery(cb, false).unwrap();
    assert!(pause.wait_reached(TIMEOUT));
    assert!(engine.cancel_discovery());

    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Canceled);
    assert_eq!(engine.state(), DiscoveryState::Canceled);
    assert_eq!(engine.state().code(), CONNERR_CANCELED);

    let devices = drain_devices(&engine);
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].address(), addr(0xA));
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn test_cancel_blocks_adapter_that_ignores_it() {
    let _guard = serial();
    let (adapter, pause) = three_devices().ignoring_cancel().pause_after(1);
    let engine = DiscoveryEngine::new(adapter).unwrap();
    let (cb, rx) = recorder();

    engine.start_device_discovery(cb, false).unwrap();
    assert!(pause.wait_reached(TIMEOUT));
    assert!(engine.cancel_discovery());
    // The adapter keeps going; nothing it reports may be queued
    pause.release();

    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Canceled);
    assert_eq!(drain_devices(&engine).len(), 1);
}

#[test]
fn test_cancel_with_nothing_running() {
    let _guard = serial();
    let engine = DiscoveryEngine::new(three_devices()).unwrap();
    assert!(!engine.cancel_discovery());
    assert_eq!(engine.state(), DiscoveryState::Idle);

    let (cb, rx) = recorder();
    engine.start_device_discovery(cb, false).unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Finished);

    assert!(!engine.cancel_discovery());
    assert!(!engine.cancel_device_discovery());
    assert_eq!(engine.state(), DiscoveryState::Finished);
}

#[test]
fn test_cancel_device_discovery_ignores_service_discovery() {
    let _guard = serial();
    let (adapter, pause) = ScriptedAdapter::new(addr(0))
        .with_device(addr(1), "Speaker", 0x240414)
        .with_service(ServiceRecord::new(addr(1), protocol::SERIAL_PORT_UUID, vec![1]))
        .with_service(ServiceRecord::new(addr(1), protocol::SERIAL_PORT_UUID, vec![2]))
        .pause_after(1);
    let engine = DiscoveryEngine::new(adapter).unwrap();
    let (cb, rx) = recorder();

    engine
        .start_service_discovery(cb, addr(1), protocol::SERIAL_PORT_UUID)
        .unwrap();
    assert!(pause.wait_reached(TIMEOUT));
    assert!(!engine.cancel_device_discovery());
    assert_eq!(engine.state(), DiscoveryState::ServiceDiscoveryRunning);

    assert!(engine.cancel_discovery());
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Canceled);
    assert_eq!(engine.pending_services(), 1);
}

#[test]
fn test_adapter_failure_reports_code() {
    let _guard = serial();
    let adapter = three_devices().fail_devices_with(AdapterError::Io {
        code: -112,
        message: "host is down".to_string(),
    });
    let engine = DiscoveryEngine::new(adapter).unwrap();
    let (cb, rx) = recorder();

    engine.start_device_discovery(cb, false).unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Failed(-112));
    assert_eq!(engine.state(), DiscoveryState::Failed(-112));
    assert_eq!(engine.state().code(), -112);
    // Devices reported before the failure are still delivered
    assert_eq!(drain_devices(&engine).len(), 3);
}

#[test]
fn test_unavailable_adapter() {
    let _guard = serial();
    let engine = DiscoveryEngine::new(ScriptedAdapter::unavailable()).unwrap();
    assert!(matches!(
        engine.local_address(),
        Err(Error::Adapter(AdapterError::Unavailable(_)))
    ));

    let (cb, rx) = recorder();
    engine.start_device_discovery(cb, true).unwrap();
    assert!(matches!(wait_outcome(&rx), DiscoveryOutcome::Failed(code) if code < 0));
}

#[test]
fn test_restart_after_terminal_states_discards_stale_records() {
    let _guard = serial();
    let engine = DiscoveryEngine::new(three_devices()).unwrap();

    // Finished with undrained records
    let (cb, rx) = recorder();
    engine.start_device_discovery(cb, false).unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Finished);
    assert_eq!(engine.pending_devices(), 3);

    let (cb, rx) = recorder();
    engine.start_device_discovery(cb, true).unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Finished);
    let devices = drain_devices(&engine);
    assert_eq!(devices.len(), 3);
    assert_eq!(devices[0].name(), "Alpha");
}

#[test]
fn test_restart_after_cancel() {
    let _guard = serial();
    let (adapter, pause) = three_devices().pause_after(1);
    let engine = DiscoveryEngine::new(adapter).unwrap();

    let (cb, rx) = recorder();
    engine.start_device_discovery(cb, false).unwrap();
    assert!(pause.wait_reached(TIMEOUT));
    assert!(engine.cancel_discovery());
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Canceled);

    // The pause only triggers once; the rerun reports everything
    pause.release();
    let (cb, rx) = recorder();
    engine.start_device_discovery(cb, false).unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Finished);
    assert_eq!(drain_devices(&engine).len(), 3);
}

#[test]
fn test_every_accepted_start_calls_back_once() {
    let _guard = serial();
    let engine = DiscoveryEngine::new(three_devices()).unwrap();
    let (tx, rx) = mpsc::channel();

    for round in 0..5 {
        let tx = tx.clone();
        engine
            .start_device_discovery(move |outcome| tx.send((round, outcome)).unwrap(), false)
            .unwrap();
        let (seen_round, outcome) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(seen_round, round);
        assert_eq!(outcome, DiscoveryOutcome::Finished);
    }
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

#[test]
fn test_start_from_own_callback_chains_next_discovery() {
    let _guard = serial();
    let spp = protocol::SERIAL_PORT_UUID;
    let adapter = three_devices().with_service(ServiceRecord::new(addr(0xA), spp, vec![7]));
    let engine = Arc::new(DiscoveryEngine::new(adapter).unwrap());
    let (services_cb, services_rx) = recorder();
    let (tx, rx) = mpsc::channel();

    let inner = Arc::clone(&engine);
    engine
        .start_device_discovery(
            move |_| {
                let state = inner.state();
                let chained = inner.start_service_discovery(services_cb, addr(0xA), spp);
                // The test thread must own the last reference so drop joins the workers
                drop(inner);
                tx.send((state, chained.is_ok())).unwrap();
            },
            false,
        )
        .unwrap();

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), (DiscoveryState::Finished, true));
    assert_eq!(wait_outcome(&services_rx), DiscoveryOutcome::Finished);
    assert_eq!(engine.pending_devices(), 3);
    assert_eq!(engine.pending_services(), 1);
}

/// Panics on the first device enumeration, then reports a single device
struct PanicOnceAdapter {
    panicked: AtomicBool,
}

impl BluetoothAdapter for PanicOnceAdapter {
    fn local_address(&self) -> Result<BtAddr, AdapterError> {
        Ok(addr(0))
    }

    fn enumerate_devices(
        &self,
        _resolve_names: bool,
        sink: RecordSink<'_, DeviceRecord>,
        _cancel: &CancelToken,
    ) -> Result<(), AdapterError> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("radio driver fault");
        }
        let _ = sink(DeviceRecord::new(addr(1), "Survivor", 0));
        Ok(())
    }

    fn enumerate_services(
        &self,
        address: BtAddr,
        _uuid: Uuid,
        _sink: RecordSink<'_, ServiceRecord>,
        _cancel: &CancelToken,
    ) -> Result<(), AdapterError> {
        Err(AdapterError::NotFound(address))
    }
}

#[test]
fn test_adapter_panic_fails_operation_and_rearms() {
    let _guard = serial();
    let engine = DiscoveryEngine::new(PanicOnceAdapter {
        panicked: AtomicBool::new(false),
    })
    .unwrap();

    let (cb, rx) = recorder();
    engine.start_device_discovery(cb, false).unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Failed(CONNERR_INTERNAL));
    assert_eq!(engine.state(), DiscoveryState::Failed(CONNERR_INTERNAL));

    let (cb, rx) = recorder();
    engine.start_device_discovery(cb, false).unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Finished);
    assert_eq!(drain_devices(&engine).len(), 1);
}

#[test]
fn test_service_discovery_and_size_peek() {
    let _guard = serial();
    let spp = protocol::SERIAL_PORT_UUID;
    let hid = protocol::from_short(protocol::short::HID);
    let adapter = ScriptedAdapter::new(addr(0))
        .with_device(addr(1), "Combo", 0x002540)
        .with_service(ServiceRecord::new(addr(1), spp, vec![0x35, 0x03, 0x19]).with_name("SPP"))
        .with_service(ServiceRecord::new(addr(1), hid, vec![0x09]))
        .with_service(ServiceRecord::new(addr(1), spp, vec![0xAA; 40]).with_port(4));
    let engine = DiscoveryEngine::new(adapter).unwrap();

    let (cb, rx) = recorder();
    engine.start_service_discovery(cb, addr(1), spp).unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Finished);

    let mut sizes = Vec::new();
    while let Some(size) = engine.next_service_size() {
        let service = engine.next_service().unwrap();
        assert_eq!(size.attributes, service.attributes().len());
        assert_eq!(size.name, service.name().len());
        assert_eq!(service.uuid(), spp);
        sizes.push(size.attributes);
    }
    assert_eq!(sizes, vec![3, 40]);
    assert!(engine.next_service().is_none());
}

#[test]
fn test_service_into_small_buffer_keeps_record() {
    let _guard = serial();
    let spp = protocol::SERIAL_PORT_UUID;
    let adapter = ScriptedAdapter::new(addr(0))
        .with_service(ServiceRecord::new(addr(1), spp, vec![1, 2, 3, 4, 5]).with_port(3));
    let engine = DiscoveryEngine::new(adapter).unwrap();

    let (cb, rx) = recorder();
    engine.start_service_discovery(cb, addr(1), spp).unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Finished);

    let mut small = [0u8; 2];
    let err = engine.next_service_into(&mut small).unwrap_err();
    assert!(matches!(err, Error::BufferTooSmall { needed: 5 }));
    assert_eq!(engine.pending_services(), 1);

    let mut buf = [0u8; 16];
    let (header, len) = engine.next_service_into(&mut buf).unwrap().unwrap();
    assert_eq!(&buf[..len], &[1, 2, 3, 4, 5]);
    assert_eq!(header.address, addr(1));
    assert_eq!(header.port, Some(3));
    assert!(engine.next_service_into(&mut buf).unwrap().is_none());
}

#[test]
fn test_service_discovery_unknown_device() {
    let _guard = serial();
    let engine = DiscoveryEngine::new(three_devices()).unwrap();
    let (cb, rx) = recorder();

    engine
        .start_service_discovery(cb, addr(0x77), protocol::SERIAL_PORT_UUID)
        .unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Failed(CONNERR_NOTFOUND));
}

#[test]
fn test_service_restart_discards_stale_records() {
    let _guard = serial();
    let spp = protocol::SERIAL_PORT_UUID;
    let hid = protocol::from_short(protocol::short::HID);
    let adapter = ScriptedAdapter::new(addr(0))
        .with_service(ServiceRecord::new(addr(1), spp, vec![1]))
        .with_service(ServiceRecord::new(addr(1), hid, vec![2, 2]));
    let engine = DiscoveryEngine::new(adapter).unwrap();

    // Nil matches every service; nothing is drained
    let (cb, rx) = recorder();
    engine.start_service_discovery(cb, addr(1), Uuid::nil()).unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Finished);
    assert_eq!(engine.pending_services(), 2);

    let (cb, rx) = recorder();
    engine.start_service_discovery(cb, addr(1), spp).unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Finished);
    assert_eq!(engine.pending_services(), 1);

    let service = engine.next_service().unwrap();
    assert_eq!(service.uuid(), spp);
    assert_eq!(service.attributes(), &[1]);
    assert!(engine.next_service().is_none());
}

#[test]
fn test_device_and_service_queues_are_independent() {
    let _guard = serial();
    let spp = protocol::SERIAL_PORT_UUID;
    let adapter = three_devices().with_service(ServiceRecord::new(addr(0xA), spp, vec![7]));
    let engine = DiscoveryEngine::new(adapter).unwrap();

    let (cb, rx) = recorder();
    engine.start_device_discovery(cb, false).unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Finished);

    let (cb, rx) = recorder();
    engine.start_service_discovery(cb, addr(0xA), spp).unwrap();
    assert_eq!(wait_outcome(&rx), DiscoveryOutcome::Finished);

    assert_eq!(engine.pending_devices(), 3);
    assert_eq!(engine.pending_services(), 1);
}

#[test]
fn test_single_instance() {
    let _guard = serial();
    let engine = DiscoveryEngine::new(three_devices()).unwrap();
    assert!(DiscoveryEngine::is_alive());
    assert!(matches!(
        DiscoveryEngine::new(three_devices()),
        Err(Error::AlreadyInitialized)
    ));

    drop(engine);
    assert!(!DiscoveryEngine::is_alive());
    let again = DiscoveryEngine::new(three_devices());
    assert!(again.is_ok());
}

#[test]
fn test_drop_cancels_and_waits_for_callback() {
    let _guard = serial();
    let (adapter, pause) = three_devices().pause_after(1);
    let engine = DiscoveryEngine::new(adapter).unwrap();
    let (cb, rx) = recorder();

    engine.start_device_discovery(cb, false).unwrap();
    assert!(pause.wait_reached(TIMEOUT));
    drop(engine);

    // Already delivered by the time drop returned
    assert_eq!(rx.try_recv().unwrap(), DiscoveryOutcome::Canceled);
    assert!(!DiscoveryEngine::is_alive());
}

#[tokio::test]
async fn test_subscribe_observes_transitions() {
    let _guard = serial();
    let adapter = three_devices().with_record_delay(Duration::from_millis(5));
    let engine = DiscoveryEngine::new(adapter).unwrap();
    let mut states = engine.subscribe();
    assert_eq!(*states.borrow(), DiscoveryState::Idle);

    engine.start_device_discovery(|_| {}, false).unwrap();
    let finished = tokio::time::timeout(TIMEOUT, states.wait_for(|s| s.is_terminal()))
        .await
        .expect("no terminal state")
        .map(|s| *s)
        .unwrap();
    assert_eq!(finished, DiscoveryState::Finished);
    // Every device is queued before the terminal state is published
    assert_eq!(engine.pending_devices(), 3);
}
