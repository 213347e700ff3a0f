//! Discovery Engine
//!
//! Owns the discovery state machine and runs one adapter enumeration at a time
//! on a background worker thread.
//!
//! ```text
//!   Idle ──start──▶ DeviceDiscoveryRunning ──ok──────▶ Finished
//!     │                      │ ├──adapter error──▶ Failed(code)
//!     │                      │ └──cancel─────────▶ Canceled
//!     └──start──▶ ServiceDiscoveryRunning  (same exits)
//!
//!   Finished / Canceled / Failed ──start──▶ *Running
//! ```

use crate::domain::error::{AdapterError, Error, Result, CONNERR_INTERNAL};
use crate::domain::models::{
    BtAddr, DeviceRecord, DiscoveryKind, DiscoveryOutcome, DiscoveryState, ServiceHeader,
    ServiceRecord, ServiceSize,
};
use crate::engine::cancel::CancelToken;
use crate::engine::queue::{PopIf, ResultQueue};
use crate::infrastructure::bluetooth::BluetoothAdapter;
use std::ops::ControlFlow;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Set while a [`DiscoveryEngine`] exists in this process
static ENGINE_ALIVE: AtomicBool = AtomicBool::new(false);

/// Terminal notification for one discovery operation
pub type DiscoveryCallback = Box<dyn FnOnce(DiscoveryOutcome) + Send + 'static>;

struct Inner {
    state: DiscoveryState,
    /// Token of the running operation
    cancel: Option<CancelToken>,
    /// Worker of the latest operation. Still `Some` after the terminal state is
    /// published, until the next start or drop joins it.
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<DiscoveryState>,
    devices: ResultQueue<DeviceRecord>,
    services: ResultQueue<ServiceRecord>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, inner: &mut Inner, state: DiscoveryState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    fn seal(&self, kind: DiscoveryKind) {
        match kind {
            DiscoveryKind::Device => self.devices.seal(),
            DiscoveryKind::Service => self.services.seal(),
        }
    }
}

/// What a worker enumerates
enum Job {
    Devices { resolve_names: bool },
    Services { address: BtAddr, uuid: Uuid },
}

impl Job {
    fn kind(&self) -> DiscoveryKind {
        match self {
            Job::Devices { .. } => DiscoveryKind::Device,
            Job::Services { .. } => DiscoveryKind::Service,
        }
    }
}

/// The single live discovery engine.
///
/// At most one exists per process; [`DiscoveryEngine::new`] fails with
/// [`Error::AlreadyInitialized`] while another is alive. Dropping the engine
/// cancels the running operation and waits for its worker, so the terminal
/// callback has fired by the time `drop` returns.
pub struct DiscoveryEngine {
    adapter: Arc<dyn BluetoothAdapter>,
    shared: Arc<Shared>,
}

impl DiscoveryEngine {
    pub fn new(adapter: impl BluetoothAdapter) -> Result<Self> {
        Self::with_adapter(Arc::new(adapter))
    }

    pub fn with_adapter(adapter: Arc<dyn BluetoothAdapter>) -> Result<Self> {
        if ENGINE_ALIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadyInitialized);
        }

        let (state_tx, _) = watch::channel(DiscoveryState::Idle);
        info!("Discovery engine initialized");

        Ok(Self {
            adapter,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: DiscoveryState::Idle,
                    cancel: None,
                    worker: None,
                }),
                state_tx,
                devices: ResultQueue::new(),
                services: ResultQueue::new(),
            }),
        })
    }

    /// Whether an engine currently exists in this process
    pub fn is_alive() -> bool {
        ENGINE_ALIVE.load(Ordering::Acquire)
    }

    pub fn local_address(&self) -> Result<BtAddr> {
        Ok(self.adapter.local_address()?)
    }

    pub fn state(&self) -> DiscoveryState {
        self.shared.lock().state
    }

    /// Watch state transitions, e.g. to await a terminal state
    pub fn subscribe(&self) -> watch::Receiver<DiscoveryState> {
        self.shared.state_tx.subscribe()
    }

    /// Start enumerating nearby devices in the background.
    ///
    /// Returns [`Error::Busy`] if an operation is running. Undrained devices
    /// from a previous run are discarded. `callback` fires exactly once, after
    /// the last device has been queued.
    pub fn start_device_discovery<F>(&self, callback: F, resolve_names: bool) -> Result<()>
    where
        F: FnOnce(DiscoveryOutcome) + Send + 'static,
    {
        self.start(Job::Devices { resolve_names }, Box::new(callback))
    }

    /// Start enumerating the services of `address` matching `uuid`.
    ///
    /// Same contract as [`DiscoveryEngine::start_device_discovery`]; undrained
    /// services from a previous run are discarded.
    pub fn start_service_discovery<F>(&self, callback: F, address: BtAddr, uuid: Uuid) -> Result<()>
    where
        F: FnOnce(DiscoveryOutcome) + Send + 'static,
    {
        self.start(Job::Services { address, uuid }, Box::new(callback))
    }

    /// Request cancellation of the running operation.
    ///
    /// Returns false when nothing is running. Once this returns true no
    /// further record is queued and the callback will report `Canceled`.
    pub fn cancel_discovery(&self) -> bool {
        self.cancel_matching(|_| true)
    }

    /// Like [`DiscoveryEngine::cancel_discovery`] but only for device discovery
    pub fn cancel_device_discovery(&self) -> bool {
        self.cancel_matching(|kind| kind == DiscoveryKind::Device)
    }

    pub fn next_device(&self) -> Option<DeviceRecord> {
        self.shared.devices.pop()
    }

    pub fn next_service(&self) -> Option<ServiceRecord> {
        self.shared.services.pop()
    }

    /// Sizes of the head service, without consuming it
    pub fn next_service_size(&self) -> Option<ServiceSize> {
        self.shared.services.peek_with(ServiceRecord::size)
    }

    /// Pop the head service, copying its attributes into `buf`.
    ///
    /// Returns the header and the number of bytes written. When `buf` is too
    /// small the service stays queued and `BufferTooSmall` reports the size.
    pub fn next_service_into(&self, buf: &mut [u8]) -> Result<Option<(ServiceHeader, usize)>> {
        let mut needed = 0;
        let capacity = buf.len();
        match self.shared.services.pop_if(|s| {
            needed = s.attributes().len();
            needed <= capacity
        }) {
            PopIf::Empty => Ok(None),
            PopIf::Rejected => Err(Error::BufferTooSmall { needed }),
            PopIf::Popped(service) => {
                let (header, attributes) = service.into_parts();
                buf[..attributes.len()].copy_from_slice(&attributes);
                Ok(Some((header, attributes.len())))
            }
        }
    }

    pub fn pending_devices(&self) -> usize {
        self.shared.devices.len()
    }

    pub fn pending_services(&self) -> usize {
        self.shared.services.len()
    }

    fn cancel_matching(&self, accept: impl FnOnce(DiscoveryKind) -> bool) -> bool {
        let inner = self.shared.lock();
        let kind = match inner.state {
            DiscoveryState::DeviceDiscoveryRunning => DiscoveryKind::Device,
            DiscoveryState::ServiceDiscoveryRunning => DiscoveryKind::Service,
            _ => return false,
        };
        if !accept(kind) {
            return false;
        }
        if let Some(token) = &inner.cancel {
            token.cancel();
        }
        // Sealed under the state lock: the worker cannot queue past this point
        self.shared.seal(kind);
        info!("{:?} discovery cancel requested", kind);
        true
    }

    /// Join the previous worker once it has published its terminal state.
    fn reap_worker(&self) -> Result<()> {
        let handle = {
            let mut inner = self.shared.lock();
            if inner.state.is_running() {
                return Err(Error::Busy);
            }
            match inner.worker.take() {
                Some(handle) if handle.thread().id() == thread::current().id() => {
                    // Called from the worker's own callback; nothing shared is
                    // touched after it returns, so the worker is detached
                    debug!("Detaching discovery worker from its own callback");
                    None
                }
                other => other,
            }
        };

        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Previous discovery worker panicked");
            }
        }
        Ok(())
    }

    fn start(&self, job: Job, callback: DiscoveryCallback) -> Result<()> {
        let kind = job.kind();
        if let Err(e) = self.reap_worker() {
            debug!("{:?} discovery rejected: {}", kind, e);
            return Err(e);
        }

        let mut inner = self.shared.lock();
        if inner.state.is_running() || inner.worker.is_some() {
            return Err(Error::Busy);
        }

        match kind {
            DiscoveryKind::Device => self.shared.devices.reset(),
            DiscoveryKind::Service => self.shared.services.reset(),
        }

        let token = CancelToken::new();
        let previous = inner.state;
        self.shared.set_state(&mut inner, DiscoveryState::running(kind));
        inner.cancel = Some(token.clone());

        let adapter = Arc::clone(&self.adapter);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("bt-discovery".to_string())
            .spawn(move || run_worker(adapter, shared, job, token, callback));

        match spawned {
            Ok(handle) => {
                inner.worker = Some(handle);
                info!("{:?} discovery started", kind);
                Ok(())
            }
            Err(e) => {
                error!("Failed to spawn discovery worker: {}", e);
                inner.cancel = None;
                self.shared.set_state(&mut inner, previous);
                Err(Error::Spawn(e))
            }
        }
    }
}

fn run_worker(
    adapter: Arc<dyn BluetoothAdapter>,
    shared: Arc<Shared>,
    job: Job,
    token: CancelToken,
    callback: DiscoveryCallback,
) {
    let kind = job.kind();
    let mut queued = 0usize;

    let enumerated = panic::catch_unwind(AssertUnwindSafe(|| match job {
        Job::Devices { resolve_names } => {
            let mut sink = |device: DeviceRecord| {
                if token.is_cancelled() || !shared.devices.push(device) {
                    return ControlFlow::Break(());
                }
                queued += 1;
                ControlFlow::Continue(())
            };
            adapter.enumerate_devices(resolve_names, &mut sink, &token)
        }
        Job::Services { address, uuid } => {
            let mut sink = |service: ServiceRecord| {
                if token.is_cancelled() || !shared.services.push(service) {
                    return ControlFlow::Break(());
                }
                queued += 1;
                ControlFlow::Continue(())
            };
            adapter.enumerate_services(address, uuid, &mut sink, &token)
        }
    }));

    let outcome = {
        let mut inner = shared.lock();
        // Decided under the lock so a cancel that returned true always wins
        let outcome = if token.is_cancelled() {
            DiscoveryOutcome::Canceled
        } else {
            match enumerated {
                Ok(Ok(())) => DiscoveryOutcome::Finished,
                Ok(Err(AdapterError::Canceled)) => DiscoveryOutcome::Canceled,
                Ok(Err(e)) => {
                    error!("{:?} discovery failed: {}", kind, e);
                    DiscoveryOutcome::Failed(e.code())
                }
                Err(_) => {
                    error!("{:?} discovery aborted: adapter panicked", kind);
                    DiscoveryOutcome::Failed(CONNERR_INTERNAL)
                }
            }
        };
        if outcome == DiscoveryOutcome::Canceled {
            shared.seal(kind);
        }
        inner.cancel = None;
        shared.set_state(&mut inner, outcome.into());
        outcome
    };

    info!("{:?} discovery ended: {:?}, {} record(s)", kind, outcome, queued);
    callback(outcome);
}

impl Drop for DiscoveryEngine {
    fn drop(&mut self) {
        self.cancel_discovery();

        let handle = self.shared.lock().worker.take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("Discovery worker panicked during shutdown");
            }
        }

        self.shared.devices.clear();
        self.shared.services.clear();
        ENGINE_ALIVE.store(false, Ordering::Release);
        info!("Discovery engine closed");
    }
}
