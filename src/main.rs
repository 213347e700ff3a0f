use anyhow::Result;
use bt_discovery::domain::error::CONNERR_CANCELED;
use bt_discovery::domain::models::{BtAddr, DeviceRecord, ServiceRecord, ServiceSize};
use bt_discovery::domain::settings::{DiscoverySettings, SettingsService};
use bt_discovery::engine::facade;
use bt_discovery::infrastructure::bluetooth::{protocol, BluetoothAdapter, ScriptedAdapter};
use bt_discovery::infrastructure::logging;
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

struct CliOptions {
    simulate: bool,
    resolve_names: Option<bool>,
    service_uuid: Option<String>,
}

impl CliOptions {
    fn parse(args: impl Iterator<Item = String>) -> Result<Self> {
        let mut options = Self {
            simulate: false,
            resolve_names: None,
            service_uuid: None,
        };
        let mut args = args.peekable();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--simulate" => options.simulate = true,
                "--no-names" => options.resolve_names = Some(false),
                "--services" => {
                    // The UUID is optional; settings provide the default
                    if let Some(uuid) = args.next_if(|a| !a.starts_with("--")) {
                        options.service_uuid = Some(uuid);
                    } else {
                        options.service_uuid = Some(String::new());
                    }
                }
                "-h" | "--help" => {
                    println!("usage: bt-discover [--simulate] [--no-names] [--services [UUID]]");
                    std::process::exit(0);
                }
                other => anyhow::bail!("Unknown argument: {}", other),
            }
        }
        Ok(options)
    }
}

fn main() -> Result<()> {
    let options = CliOptions::parse(std::env::args().skip(1))?;
    let mut settings = SettingsService::new()?;
    let _log_guard = logging::init_logger(&settings.get().log_settings)?;
    info!("Settings loaded from {}", settings.path().display());

    let discovery = settings.get().discovery.clone();
    let adapter: Arc<dyn BluetoothAdapter> = if options.simulate {
        Arc::new(simulated_adapter())
    } else {
        native_adapter(&discovery)?
    };

    facade::init_shared(adapter);
    let result = run(&options, &discovery, &mut settings);
    facade::close();
    result
}

fn run(
    options: &CliOptions,
    discovery: &DiscoverySettings,
    settings: &mut SettingsService,
) -> Result<()> {
    let mut local = BtAddr::default();
    if facade::get_local_address(&mut local) == 0 {
        println!("Local adapter: {}", local);
    }

    let resolve_names = options.resolve_names.unwrap_or(discovery.resolve_names);
    let (tx, rx) = mpsc::channel();
    let code = facade::start_device_discovery(
        move |code| {
            let _ = tx.send(code);
        },
        resolve_names,
    );
    if code < 0 {
        anyhow::bail!("Device discovery rejected ({})", code);
    }

    let mut devices = Vec::new();
    let done = wait_draining(&rx, || {
        let mut device = DeviceRecord::default();
        while facade::get_next_device(&mut device) == 1 {
            print_device(&device);
            devices.push(device.clone());
        }
    })?;
    report_outcome("Device discovery", done)?;

    for device in &devices {
        if let Err(e) = settings.add_known_address(device.address()) {
            warn!("Could not remember {}: {:#}", device.address(), e);
        }
    }

    let Some(uuid_arg) = &options.service_uuid else {
        return Ok(());
    };
    let uuid_str = if uuid_arg.is_empty() {
        discovery.service_uuid.as_str()
    } else {
        uuid_arg.as_str()
    };
    let uuid = protocol::parse_uuid(uuid_str)?;

    for device in &devices {
        discover_services(device.address(), uuid)?;
    }
    Ok(())
}

fn discover_services(address: BtAddr, uuid: Uuid) -> Result<()> {
    println!("Services of {} matching {}:", address, uuid);
    let (tx, rx) = mpsc::channel();
    let code = facade::start_service_discovery(
        move |code| {
            let _ = tx.send(code);
        },
        &address,
        &uuid,
    );
    if code < 0 {
        anyhow::bail!("Service discovery on {} rejected ({})", address, code);
    }

    let done = wait_draining(&rx, || {
        let mut size = ServiceSize::default();
        while facade::get_next_service_size(&mut size) == 1 {
            let mut service = ServiceRecord::default();
            if facade::get_next_service(&mut service) != 1 {
                break;
            }
            print_service(&service, size);
        }
    })?;

    if let Err(e) = report_outcome("Service discovery", done) {
        // One unreachable device should not end the whole run
        warn!("Service discovery on {}: {:#}", address, e);
    }
    Ok(())
}

/// Drain records while waiting for the terminal callback, then drain once more
fn wait_draining(rx: &mpsc::Receiver<i32>, mut drain: impl FnMut()) -> Result<i32> {
    loop {
        drain();
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(code) => {
                drain();
                return Ok(code);
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                anyhow::bail!("Discovery worker went away without reporting")
            }
        }
    }
}

fn report_outcome(what: &str, code: i32) -> Result<()> {
    match code {
        1 => {
            info!("{} finished", what);
            Ok(())
        }
        CONNERR_CANCELED => {
            info!("{} canceled", what);
            Ok(())
        }
        code => Err(anyhow::anyhow!("{} failed with code {}", what, code)),
    }
}

fn print_device(device: &DeviceRecord) {
    let name = if device.name().is_empty() {
        "<unknown>"
    } else {
        device.name()
    };
    let cod = device.class_of_device();
    println!(
        "  {}  {:<24} {:?} [{}]",
        device.address(),
        name,
        protocol::MajorDeviceClass::from_class(cod),
        protocol::service_classes(cod).join(", ")
    );
}

fn print_service(service: &ServiceRecord, size: ServiceSize) {
    println!(
        "  {}  {} byte(s): {}",
        service.uuid(),
        size.attributes,
        protocol::hex(service.attributes())
    );
}

fn simulated_adapter() -> ScriptedAdapter {
    let phone = BtAddr::new([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);
    let headset = BtAddr::new([0x00, 0x0D, 0x44, 0x12, 0x9E, 0x01]);
    let printer = BtAddr::new([0x00, 0x80, 0x98, 0x24, 0x15, 0x6B]);

    ScriptedAdapter::new(BtAddr::new([0x00, 0x15, 0x83, 0x0C, 0xBF, 0xEB]))
        .with_device(phone, "Pocket Phone", 0x5A020C)
        .with_device(headset, "Stereo Headset", 0x240404)
        .with_nameless_device(printer, 0x040680)
        .with_service(
            ServiceRecord::new(phone, protocol::SERIAL_PORT_UUID, vec![0x35, 0x03, 0x19, 0x11, 0x01])
                .with_name("Serial Port")
                .with_port(3),
        )
        .with_service(
            ServiceRecord::new(
                phone,
                protocol::from_short(protocol::short::OBEX_OBJECT_PUSH),
                vec![0x35, 0x03, 0x19, 0x11, 0x05],
            )
            .with_name("OBEX Object Push")
            .with_port(9),
        )
        .with_service(
            ServiceRecord::new(
                headset,
                protocol::from_short(protocol::short::HEADSET),
                vec![0x35, 0x03, 0x19, 0x11, 0x08],
            )
            .with_port(2),
        )
        .with_record_delay(Duration::from_millis(300))
}

#[cfg(all(feature = "bluez", target_os = "linux"))]
fn native_adapter(discovery: &DiscoverySettings) -> Result<Arc<dyn BluetoothAdapter>> {
    use anyhow::Context;
    use bt_discovery::infrastructure::bluetooth::bluez::{BluezAdapter, BluezConfig};

    let adapter = BluezAdapter::new(BluezConfig::from(discovery))
        .context("Failed to open the BlueZ adapter")?;
    Ok(Arc::new(adapter))
}

#[cfg(not(all(feature = "bluez", target_os = "linux")))]
fn native_adapter(_discovery: &DiscoverySettings) -> Result<Arc<dyn BluetoothAdapter>> {
    anyhow::bail!(
        "No native Bluetooth adapter in this build (enable the `bluez` feature on Linux), \
         use --simulate to run against a scripted environment"
    )
}
