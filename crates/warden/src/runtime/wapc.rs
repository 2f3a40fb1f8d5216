//! Host side of the waPC guest protocol.
//!
//! A call goes like this: the host stores the operation and payload, then
//! calls the guest export `__guest_call(op_len, msg_len)`. The guest pulls
//! both with `__guest_request`, may issue `__host_call`s, and finishes by
//! reporting either `__guest_response` or `__guest_error`. The export
//! returns 1 on success and 0 on failure.

use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use wasmtime::{Caller, Linker, Memory};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::p1::WasiP1Ctx;
use wasmtime_wasi::p2::pipe::MemoryOutputPipe;

use super::RuntimeError;
use super::host::{HostCall, HostCallRouter};

/// Import module name used by waPC guests.
const WAPC: &str = "wapc";

/// Target used for guest console output.
pub(crate) const GUEST_LOG_TARGET: &str = "warden::guest";

/// Bytes kept per stream and per call; writes beyond fail in the guest.
const OUTPUT_CAPACITY: usize = 64 * 1024;

/// What a guest wrote to stdout and stderr during one call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct GuestOutput {
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
}

impl GuestOutput {
    /// Log every line under [`GUEST_LOG_TARGET`]: at `info` when output is
    /// forwarded, at `debug` otherwise.
    pub(crate) fn emit(&self, policy: &str, forward: bool) {
        for (stream, bytes) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            for line in String::from_utf8_lossy(bytes).lines() {
                if forward {
                    tracing::info!(target: GUEST_LOG_TARGET, policy, stream, "{line}");
                } else {
                    tracing::debug!(target: GUEST_LOG_TARGET, policy, stream, "{line}");
                }
            }
        }
    }
}

/// State held by the store of a policy instance.
pub(crate) struct GuestState {
    wasi: WasiP1Ctx,
    stdout_pipe: MemoryOutputPipe,
    stderr_pipe: MemoryOutputPipe,
    pub(crate) limiter: StoreLimiter,
    policy: Arc<str>,
    router: Arc<HostCallRouter>,
    request: Option<(Vec<u8>, Vec<u8>)>,
    response: Option<Vec<u8>>,
    error: Option<String>,
    host_response: Option<Vec<u8>>,
    host_error: Option<String>,
}

impl GuestState {
    pub(crate) fn new(policy: Arc<str>, router: Arc<HostCallRouter>, max_memory_bytes: u64) -> Self {
        let (wasi, stdout_pipe, stderr_pipe) = wasi_with_pipes();
        Self {
            wasi,
            stdout_pipe,
            stderr_pipe,
            limiter: StoreLimiter::new(max_memory_bytes),
            policy,
            router,
            request: None,
            response: None,
            error: None,
            host_response: None,
            host_error: None,
        }
    }

    /// Stage a request for the next `__guest_call`.
    pub(crate) fn begin(&mut self, operation: &str, payload: &[u8]) {
        self.request = Some((operation.as_bytes().to_vec(), payload.to_vec()));
        self.response = None;
        self.error = None;
        self.host_response = None;
        self.host_error = None;
        self.limiter.reset();
        // The context only holds stdio, so a fresh one loses nothing
        (self.wasi, self.stdout_pipe, self.stderr_pipe) = wasi_with_pipes();
    }

    /// Output written by the guest since the last [`GuestState::begin`].
    pub(crate) fn output(&self) -> GuestOutput {
        GuestOutput {
            stdout: self.stdout_pipe.contents().to_vec(),
            stderr: self.stderr_pipe.contents().to_vec(),
        }
    }

    /// Collect the outcome of a `__guest_call` that returned `code`.
    pub(crate) fn finish(&mut self, code: i32) -> Result<Vec<u8>, RuntimeError> {
        self.request = None;
        self.host_response = None;
        self.host_error = None;
        let response = self.response.take();
        let error = self.error.take();

        match (code, response, error) {
            (1, Some(response), _) => Ok(response),
            (_, _, Some(error)) => Err(RuntimeError::Guest(error)),
            (1, None, None) => Err(RuntimeError::NoResponse),
            (_, _, None) => Err(RuntimeError::Guest(
                "guest call failed without an error message".to_string(),
            )),
        }
    }
}

/// WASI context without preopens or environment, stdio captured in memory.
fn wasi_with_pipes() -> (WasiP1Ctx, MemoryOutputPipe, MemoryOutputPipe) {
    let stdout_pipe = MemoryOutputPipe::new(OUTPUT_CAPACITY);
    let stderr_pipe = MemoryOutputPipe::new(OUTPUT_CAPACITY);
    let wasi = WasiCtxBuilder::new()
        .stdout(stdout_pipe.clone())
        .stderr(stderr_pipe.clone())
        .build_p1();
    (wasi, stdout_pipe, stderr_pipe)
}

/// Memory limiter for guest stores.
///
/// Remembers whether it refused a growth request, so that the trap a guest
/// raises after a failed allocation can be reported as a memory limit.
pub(crate) struct StoreLimiter {
    max_memory: u64,
    exceeded: bool,
}

impl StoreLimiter {
    fn new(max_memory: u64) -> Self {
        Self {
            max_memory,
            exceeded: false,
        }
    }

    pub(crate) fn exceeded(&self) -> bool {
        self.exceeded
    }

    fn reset(&mut self) {
        self.exceeded = false;
    }
}

impl wasmtime::ResourceLimiter for StoreLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        let allowed = desired as u64 <= self.max_memory || current == desired;
        if !allowed {
            self.exceeded = true;
        }
        Ok(allowed)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        _desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Add WASI preview1 and the waPC host functions to `linker`.
pub(crate) fn add_to_linker(linker: &mut Linker<GuestState>) -> anyhow::Result<()> {
    wasmtime_wasi::p1::add_to_linker_async(linker, |s: &mut GuestState| &mut s.wasi)?;

    linker.func_wrap(
        WAPC,
        "__guest_request",
        |mut caller: Caller<'_, GuestState>, op_ptr: i32, ptr: i32| -> anyhow::Result<()> {
            let (operation, payload) = caller
                .data()
                .request
                .clone()
                .ok_or_else(|| anyhow!("__guest_request called outside of a guest call"))?;
            let memory = guest_memory(&mut caller)?;
            memory.write(&mut caller, offset(op_ptr), &operation)?;
            memory.write(&mut caller, offset(ptr), &payload)?;
            Ok(())
        },
    )?;

    linker.func_wrap(
        WAPC,
        "__guest_response",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let memory = guest_memory(&mut caller)?;
            let response = read_bytes(&caller, memory, ptr, len)?;
            caller.data_mut().response = Some(response);
            Ok(())
        },
    )?;

    linker.func_wrap(
        WAPC,
        "__guest_error",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let memory = guest_memory(&mut caller)?;
            let error = read_bytes(&caller, memory, ptr, len)?;
            caller.data_mut().error = Some(String::from_utf8_lossy(&error).into_owned());
            Ok(())
        },
    )?;

    linker.func_wrap_async(
        WAPC,
        "__host_call",
        |caller: Caller<'_, GuestState>, args: (i32, i32, i32, i32, i32, i32, i32, i32)| {
            Box::new(host_call(caller, args))
        },
    )?;

    linker.func_wrap(
        WAPC,
        "__host_response",
        |mut caller: Caller<'_, GuestState>, ptr: i32| -> anyhow::Result<()> {
            let Some(response) = caller.data_mut().host_response.take() else {
                return Ok(());
            };
            let memory = guest_memory(&mut caller)?;
            memory.write(&mut caller, offset(ptr), &response)?;
            caller.data_mut().host_response = Some(response);
            Ok(())
        },
    )?;

    linker.func_wrap(
        WAPC,
        "__host_response_len",
        |caller: Caller<'_, GuestState>| -> i32 {
            caller
                .data()
                .host_response
                .as_ref()
                .map_or(0, |r| r.len() as i32)
        },
    )?;

    linker.func_wrap(
        WAPC,
        "__host_error",
        |mut caller: Caller<'_, GuestState>, ptr: i32| -> anyhow::Result<()> {
            let Some(error) = caller.data_mut().host_error.take() else {
                return Ok(());
            };
            let memory = guest_memory(&mut caller)?;
            memory.write(&mut caller, offset(ptr), error.as_bytes())?;
            caller.data_mut().host_error = Some(error);
            Ok(())
        },
    )?;

    linker.func_wrap(
        WAPC,
        "__host_error_len",
        |caller: Caller<'_, GuestState>| -> i32 {
            caller
                .data()
                .host_error
                .as_ref()
                .map_or(0, |e| e.len() as i32)
        },
    )?;

    linker.func_wrap(
        WAPC,
        "__console_log",
        |mut caller: Caller<'_, GuestState>, ptr: i32, len: i32| -> anyhow::Result<()> {
            let memory = guest_memory(&mut caller)?;
            let line = read_bytes(&caller, memory, ptr, len)?;
            tracing::info!(
                target: GUEST_LOG_TARGET,
                policy = %caller.data().policy,
                "{}",
                String::from_utf8_lossy(&line)
            );
            Ok(())
        },
    )?;

    Ok(())
}

async fn host_call(
    mut caller: Caller<'_, GuestState>,
    (bd_ptr, bd_len, ns_ptr, ns_len, op_ptr, op_len, ptr, len): (
        i32,
        i32,
        i32,
        i32,
        i32,
        i32,
        i32,
        i32,
    ),
) -> anyhow::Result<i32> {
    let memory = guest_memory(&mut caller)?;
    let binding = read_string(&caller, memory, bd_ptr, bd_len).context("binding")?;
    let namespace = read_string(&caller, memory, ns_ptr, ns_len).context("namespace")?;
    let operation = read_string(&caller, memory, op_ptr, op_len).context("operation")?;
    let payload = read_bytes(&caller, memory, ptr, len)?;

    let state = caller.data_mut();
    state.host_response = None;
    state.host_error = None;
    let router = Arc::clone(&state.router);
    let call = HostCall {
        policy: Arc::clone(&state.policy),
        binding,
        namespace,
        operation,
        payload,
    };

    let outcome = router.dispatch(call).await;

    let state = caller.data_mut();
    Ok(match outcome {
        Ok(response) => {
            state.host_response = Some(response);
            1
        }
        Err(error) => {
            state.host_error = Some(error);
            0
        }
    })
}

fn guest_memory(caller: &mut Caller<'_, GuestState>) -> anyhow::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .ok_or_else(|| anyhow!("guest does not export memory"))
}

/// Guest pointers are unsigned 32-bit offsets passed as `i32`.
fn offset(ptr: i32) -> usize {
    ptr as u32 as usize
}

fn read_bytes(
    caller: &Caller<'_, GuestState>,
    memory: Memory,
    ptr: i32,
    len: i32,
) -> anyhow::Result<Vec<u8>> {
    let start = offset(ptr);
    let end = start + offset(len);
    memory
        .data(caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| anyhow!("guest buffer {start}..{end} is out of bounds"))
}

fn read_string(
    caller: &Caller<'_, GuestState>,
    memory: Memory,
    ptr: i32,
    len: i32,
) -> anyhow::Result<String> {
    Ok(String::from_utf8(read_bytes(caller, memory, ptr, len)?)?)
}
