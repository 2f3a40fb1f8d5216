//! Wasm runtime for policy modules.
//!
//! A [`PolicyModule`] compiles and pre-links a module once. Each policy gets a
//! single long-lived [`PolicyInstance`] created from it; calls to the instance
//! are serialized. An instance whose guest faulted is discarded and
//! re-created from the pre-linked module on the next call.

mod host;
mod wapc;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use wasmtime::{Config, Engine, InstancePre, Linker, Memory, Module, Store, Trap, TypedFunc};

use crate::limits::ResourceLimits;
use wapc::{GuestOutput, GuestState};

pub use host::{DEFAULT_RESPONSE, HostCall, HostCallHandler, HostCallResult, HostCallRouter};

/// Errors that can occur while loading or calling a policy module
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The module cannot be compiled or linked
    #[error("cannot compile module: {0}")]
    Compile(String),
    /// The module cannot be instantiated or initialized
    #[error("cannot instantiate module: {0}")]
    Instantiate(String),
    /// A required export is missing
    #[error("module does not export `{0}`")]
    MissingExport(&'static str),
    /// The guest reported an error
    #[error("guest error: {0}")]
    Guest(String),
    /// The guest reported success without a response
    #[error("guest returned neither a response nor an error")]
    NoResponse,
    /// The guest trapped
    #[error("guest trapped: {0}")]
    Trap(String),
    /// Execution timeout exceeded
    #[error("timeout exceeded")]
    Timeout,
    /// Memory limit exceeded
    #[error("memory limit exceeded")]
    MemoryLimit,
    /// A payload does not fit the guest ABI
    #[error("payload of {0} bytes is too large")]
    PayloadTooLarge(usize),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Whether the guest was interrupted mid-call, leaving its instance unusable.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            RuntimeError::Trap(_) | RuntimeError::Timeout | RuntimeError::MemoryLimit
        )
    }
}

/// Statistics about the calls served by an instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationStats {
    /// Number of calls made
    pub invocations: u64,
    /// Number of calls that faulted
    pub faults: u64,
    /// Wall clock time of the last call in milliseconds
    pub last_wall_time_ms: u64,
}

#[derive(Debug, Default)]
struct StatsCounter {
    invocations: AtomicU64,
    faults: AtomicU64,
    last_wall_time_ms: AtomicU64,
}

impl StatsCounter {
    fn record(&self, elapsed: Duration, faulted: bool) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if faulted {
            self.faults.fetch_add(1, Ordering::Relaxed);
        }
        self.last_wall_time_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> InvocationStats {
        InvocationStats {
            invocations: self.invocations.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            last_wall_time_ms: self.last_wall_time_ms.load(Ordering::Relaxed),
        }
    }
}

/// A compiled, pre-linked policy module.
///
/// Cloning is cheap. Each module owns its engine, so a deadline expiring in
/// one module never interrupts guests of another.
#[derive(Clone)]
pub struct PolicyModule {
    engine: Engine,
    instance_pre: InstancePre<GuestState>,
    router: Arc<HostCallRouter>,
    limits: ResourceLimits,
    forward_output: bool,
}

impl std::fmt::Debug for PolicyModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyModule")
            .field("limits", &self.limits)
            .field("forward_output", &self.forward_output)
            .finish_non_exhaustive()
    }
}

impl PolicyModule {
    /// Load a module from a file (binary or text format).
    pub fn from_file(
        path: impl AsRef<Path>,
        router: Arc<HostCallRouter>,
        limits: ResourceLimits,
        forward_output: bool,
    ) -> Result<Self, RuntimeError> {
        let engine = Self::create_engine()?;
        let module = Module::from_file(&engine, path.as_ref())
            .map_err(|e| RuntimeError::Compile(format!("{e:#}")))?;
        Self::from_module(engine, module, router, limits, forward_output)
    }

    /// Load a module from bytes (binary or text format).
    pub fn from_bytes(
        bytes: impl AsRef<[u8]>,
        router: Arc<HostCallRouter>,
        limits: ResourceLimits,
        forward_output: bool,
    ) -> Result<Self, RuntimeError> {
        let engine = Self::create_engine()?;
        let module = Module::new(&engine, bytes.as_ref())
            .map_err(|e| RuntimeError::Compile(format!("{e:#}")))?;
        Self::from_module(engine, module, router, limits, forward_output)
    }

    fn create_engine() -> Result<Engine, RuntimeError> {
        let mut config = Config::new();
        config.async_support(true);
        // Deadlines are enforced by bumping the epoch from a watchdog
        config.epoch_interruption(true);
        Engine::new(&config).map_err(|e| RuntimeError::Compile(format!("{e:#}")))
    }

    fn from_module(
        engine: Engine,
        module: Module,
        router: Arc<HostCallRouter>,
        limits: ResourceLimits,
        forward_output: bool,
    ) -> Result<Self, RuntimeError> {
        let mut linker = Linker::new(&engine);
        wapc::add_to_linker(&mut linker).map_err(|e| RuntimeError::Compile(format!("{e:#}")))?;

        let instance_pre = linker
            .instantiate_pre(&module)
            .map_err(|e| RuntimeError::Compile(format!("{e:#}")))?;

        Ok(Self {
            engine,
            instance_pre,
            router,
            limits,
            forward_output,
        })
    }

    /// Resource limits applied to instances of this module.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Create the instance serving policy `name`.
    ///
    /// The guest is instantiated and initialized right away, so a module that
    /// cannot start fails here rather than on its first request.
    pub async fn instantiate(&self, name: &str) -> Result<PolicyInstance, RuntimeError> {
        let name: Arc<str> = Arc::from(name);
        let live = self.start(&name).await?;
        Ok(PolicyInstance {
            name,
            module: self.clone(),
            live: Mutex::new(Some(live)),
            stats: StatsCounter::default(),
        })
    }

    async fn start(&self, name: &Arc<str>) -> Result<LiveInstance, RuntimeError> {
        let state = GuestState::new(
            Arc::clone(name),
            Arc::clone(&self.router),
            self.limits.max_memory_bytes,
        );
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limiter);
        store.set_epoch_deadline(1);
        let watchdog = Watchdog::arm(&self.engine, self.limits.timeout);

        let instance = self
            .instance_pre
            .instantiate_async(&mut store)
            .await
            .map_err(|e| match fault(e, store.data()) {
                RuntimeError::Trap(msg) => RuntimeError::Instantiate(msg),
                other => other,
            })?;

        for init in ["_initialize", "_start", "wapc_init"] {
            let Some(func) = instance.get_func(&mut store, init) else {
                continue;
            };
            let func = func
                .typed::<(), ()>(&store)
                .map_err(|e| RuntimeError::Instantiate(format!("{init}: {e:#}")))?;
            match func.call_async(&mut store, ()).await {
                Ok(()) => {}
                // Command-style guests exit from `_start`
                Err(e) if e
                    .downcast_ref::<wasmtime_wasi::I32Exit>()
                    .is_some_and(|exit| exit.0 == 0) => {}
                Err(e) => {
                    return Err(match fault(e, store.data()) {
                        RuntimeError::Trap(msg) => {
                            RuntimeError::Instantiate(format!("{init}: {msg}"))
                        }
                        other => other,
                    });
                }
            }
        }
        drop(watchdog);
        store.data().output().emit(name, self.forward_output);

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or(RuntimeError::MissingExport("memory"))?;
        let guest_call = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, "__guest_call")
            .map_err(|_| RuntimeError::MissingExport("__guest_call"))?;

        debug!(policy = %name, "policy instance started");
        Ok(LiveInstance {
            store,
            guest_call,
            _memory: memory,
        })
    }
}

/// The running guest behind a [`PolicyInstance`].
struct LiveInstance {
    store: Store<GuestState>,
    guest_call: TypedFunc<(i32, i32), i32>,
    // Checked at start so that calls never hit a guest without memory
    _memory: Memory,
}

impl LiveInstance {
    /// Run one call, returning its outcome and what the guest printed.
    async fn call(
        &mut self,
        engine: &Engine,
        operation: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> (Result<Vec<u8>, RuntimeError>, GuestOutput) {
        let (Ok(op_len), Ok(msg_len)) = (i32::try_from(operation.len()), i32::try_from(payload.len()))
        else {
            let len = operation.len().max(payload.len());
            return (Err(RuntimeError::PayloadTooLarge(len)), GuestOutput::default());
        };

        self.store.data_mut().begin(operation, payload);
        self.store.set_epoch_deadline(1);
        let watchdog = Watchdog::arm(engine, timeout);
        let outcome = self
            .guest_call
            .call_async(&mut self.store, (op_len, msg_len))
            .await;
        drop(watchdog);

        let output = self.store.data().output();
        let result = match outcome {
            Ok(code) => self.store.data_mut().finish(code),
            Err(e) => Err(fault(e, self.store.data())),
        };
        (result, output)
    }
}

/// Classify an error raised while the guest was running.
fn fault(err: anyhow::Error, state: &GuestState) -> RuntimeError {
    if state.limiter.exceeded() {
        return RuntimeError::MemoryLimit;
    }
    match err.downcast_ref::<Trap>() {
        Some(Trap::Interrupt) => RuntimeError::Timeout,
        _ => RuntimeError::Trap(format!("{err:#}")),
    }
}

/// Bumps the engine epoch when a deadline expires, trapping running guests.
///
/// Runs on its own thread: a guest stuck in a loop keeps its executor thread
/// busy, so the deadline cannot rely on the async runtime. Dropping the
/// watchdog disarms it.
struct Watchdog {
    _disarm: mpsc::Sender<()>,
}

impl Watchdog {
    fn arm(engine: &Engine, timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel::<()>();
        let engine = engine.clone();
        std::thread::spawn(move || {
            if let Err(mpsc::RecvTimeoutError::Timeout) = rx.recv_timeout(timeout) {
                engine.increment_epoch();
            }
        });
        Self { _disarm: tx }
    }
}

/// The single instance serving one policy.
pub struct PolicyInstance {
    name: Arc<str>,
    module: PolicyModule,
    live: Mutex<Option<LiveInstance>>,
    stats: StatsCounter,
}

impl std::fmt::Debug for PolicyInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyInstance")
            .field("name", &self.name)
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl PolicyInstance {
    /// Name of the policy served by this instance.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resource limits of the module behind this instance.
    pub fn limits(&self) -> &ResourceLimits {
        &self.module.limits
    }

    /// Call `operation` with `payload` under the module's default timeout.
    pub async fn invoke(&self, operation: &str, payload: &[u8]) -> Result<Vec<u8>, RuntimeError> {
        self.invoke_with_timeout(operation, payload, self.module.limits.timeout)
            .await
    }

    /// Call `operation` with `payload`, trapping the guest after `timeout`.
    pub async fn invoke_with_timeout(
        &self,
        operation: &str,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, RuntimeError> {
        let mut slot = self.live.lock().await;
        let start = Instant::now();

        let mut live = match slot.take() {
            Some(live) => live,
            None => {
                debug!(policy = %self.name, "re-creating policy instance");
                self.module.start(&self.name).await?
            }
        };

        let (result, output) = live
            .call(&self.module.engine, operation, payload, timeout)
            .await;
        output.emit(&self.name, self.module.forward_output);
        let faulted = matches!(&result, Err(e) if e.is_fault());
        self.stats.record(start.elapsed(), faulted);

        if faulted {
            if let Err(e) = &result {
                warn!(policy = %self.name, operation, error = %e, "guest faulted, discarding instance");
            }
        } else {
            *slot = Some(live);
        }
        result
    }

    /// Snapshot of the calls served so far.
    pub fn stats(&self) -> InvocationStats {
        self.stats.snapshot()
    }
}
