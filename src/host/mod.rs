//! The `env` import surface guests link against.
//!
//! Each submodule registers one family of `proxy_*` functions. All of them
//! follow the same shape: marshal arguments out of guest memory, dispatch
//! through the active context's capability scope, marshal results back and
//! collapse any failure to the ABI's flat result code. Host functions never
//! trap on guest mistakes; bad pointers and bad arguments come back as
//! codes the guest can handle.

use wasmtime::{Caller, Extern, Linker, Memory, TypedFunc};

use crate::constants::*;
use crate::error::{result_code, WasmError};
use crate::instance::HostState;
use crate::memory;

mod buffers;
mod foreign;
mod grpc;
mod headers;
mod http_call;
mod logging;
mod metrics;
mod properties;
mod shared_data;
mod stream;

pub(crate) fn add_host_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    logging::add_functions(linker)?;
    headers::add_functions(linker)?;
    buffers::add_functions(linker)?;
    properties::add_functions(linker)?;
    stream::add_functions(linker)?;
    http_call::add_functions(linker)?;
    grpc::add_functions(linker)?;
    shared_data::add_functions(linker)?;
    metrics::add_functions(linker)?;
    foreign::add_functions(linker)?;

    linker.func_wrap(
        "env",
        "proxy_get_current_time_nanoseconds",
        |mut caller: Caller<'_, HostState>, ret_time_ptr: i32| -> i32 {
            let memory = match memory_of(&mut caller) {
                Ok(memory) => memory,
                Err(e) => return e.code(),
            };
            let now = match caller.data_mut().with_handler(|h| h.current_time_nanos()) {
                Ok(now) => now,
                Err(e) => return e.code(),
            };
            result_code(memory::write_u64(&mut caller, &memory, ret_time_ptr as u32, now))
        },
    )?;

    // Emitted by emscripten-built guests on memory.grow; nothing to do.
    linker.func_wrap(
        "env",
        "emscripten_notify_memory_growth",
        |_caller: Caller<'_, HostState>, _memory_index: i32| {},
    )?;

    Ok(())
}

pub(in crate::host) fn memory_of(
    caller: &mut Caller<'_, HostState>,
) -> Result<Memory, WasmError> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(WasmError::invalid_memory_access)
}

pub(in crate::host) fn malloc_of(
    caller: &mut Caller<'_, HostState>,
) -> Result<TypedFunc<i32, i32>, WasmError> {
    let func = caller
        .get_export("proxy_on_memory_allocate")
        .or_else(|| caller.get_export("malloc"))
        .and_then(Extern::into_func)
        .ok_or_else(WasmError::invalid_memory_access)?;
    func.typed::<i32, i32>(&mut *caller)
        .map_err(|_| WasmError::invalid_memory_access())
}

/// Copies `data` into a fresh guest allocation and fills the pointer/size
/// out-parameters.
pub(in crate::host) fn copy_out(
    caller: &mut Caller<'_, HostState>,
    data: &[u8],
    ret_ptr: i32,
    ret_size: i32,
) -> Result<(), WasmError> {
    let mem = memory_of(caller)?;
    let malloc = malloc_of(caller)?;
    memory::copy_to_guest(
        &mut *caller,
        &mem,
        &malloc,
        data,
        ret_ptr as u32,
        ret_size as u32,
    )
}

pub(in crate::host) fn read_guest_bytes(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, WasmError> {
    let mem = memory_of(caller)?;
    memory::read_bytes(&mut *caller, &mem, ptr as u32, len as u32)
}

pub(in crate::host) fn read_guest_string(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    len: i32,
) -> Result<String, WasmError> {
    let mem = memory_of(caller)?;
    memory::read_string(&mut *caller, &mem, ptr as u32, len as u32)
}

pub(in crate::host) fn write_guest_u32(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    value: u32,
) -> Result<(), WasmError> {
    let mem = memory_of(caller)?;
    memory::write_u32(&mut *caller, &mem, ptr as u32, value)
}

pub(in crate::host) fn write_guest_u64(
    caller: &mut Caller<'_, HostState>,
    ptr: i32,
    value: u64,
) -> Result<(), WasmError> {
    let mem = memory_of(caller)?;
    memory::write_u64(&mut *caller, &mem, ptr as u32, value)
}

/// Looks a typed guest export up from inside a host call, for the few
/// places (the `proxy_done` handshake) where the host re-enters the guest.
pub(in crate::host) fn typed_export<P, R>(
    caller: &mut Caller<'_, HostState>,
    name: &str,
) -> Option<TypedFunc<P, R>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    let func = caller.get_export(name).and_then(Extern::into_func)?;
    func.typed::<P, R>(&mut *caller).ok()
}
