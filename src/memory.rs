//! Marshaling between host values and guest linear memory.
//!
//! Every helper validates the guest-supplied range; anything out of bounds
//! surfaces as `InvalidMemoryAccess` rather than a trap. Out-parameters are
//! written through guest-allocated buffers obtained from the module's own
//! allocator export.

use wasmtime::{AsContext, AsContextMut, Memory, TypedFunc};

use crate::error::WasmError;

pub(crate) fn read_bytes(
    store: impl AsContext,
    memory: &Memory,
    ptr: u32,
    len: u32,
) -> Result<Vec<u8>, WasmError> {
    let data = memory.data(&store);
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(WasmError::invalid_memory_access)?;
    if end > data.len() {
        return Err(WasmError::invalid_memory_access());
    }
    Ok(data[start..end].to_vec())
}

pub(crate) fn read_string(
    store: impl AsContext,
    memory: &Memory,
    ptr: u32,
    len: u32,
) -> Result<String, WasmError> {
    let bytes = read_bytes(store, memory, ptr, len)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

pub(crate) fn read_u32(
    store: impl AsContext,
    memory: &Memory,
    ptr: u32,
) -> Result<u32, WasmError> {
    let bytes = read_bytes(store, memory, ptr, 4)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes);
    Ok(u32::from_le_bytes(raw))
}

pub(crate) fn write_bytes(
    mut store: impl AsContextMut,
    memory: &Memory,
    ptr: u32,
    data: &[u8],
) -> Result<(), WasmError> {
    let mem = memory.data_mut(&mut store);
    let start = ptr as usize;
    let end = start
        .checked_add(data.len())
        .ok_or_else(WasmError::invalid_memory_access)?;
    if end > mem.len() {
        return Err(WasmError::invalid_memory_access());
    }
    mem[start..end].copy_from_slice(data);
    Ok(())
}

pub(crate) fn write_u32(
    store: impl AsContextMut,
    memory: &Memory,
    ptr: u32,
    value: u32,
) -> Result<(), WasmError> {
    write_bytes(store, memory, ptr, &value.to_le_bytes())
}

pub(crate) fn write_u64(
    store: impl AsContextMut,
    memory: &Memory,
    ptr: u32,
    value: u64,
) -> Result<(), WasmError> {
    write_bytes(store, memory, ptr, &value.to_le_bytes())
}

/// Allocates `len` bytes inside the guest through its allocator export.
///
/// A null return from the allocator means the guest is out of memory, which
/// reads back as an invalid access.
fn allocate(
    mut store: impl AsContextMut,
    malloc: &TypedFunc<i32, i32>,
    len: u32,
) -> Result<u32, WasmError> {
    let ptr = malloc
        .call(&mut store, len as i32)
        .map_err(|_| WasmError::invalid_memory_access())?;
    if ptr == 0 {
        return Err(WasmError::invalid_memory_access());
    }
    Ok(ptr as u32)
}

/// Copies `data` into a fresh guest allocation and stores the resulting
/// pointer and size through the two out-parameters. Empty data writes a
/// null pointer and zero size without touching the allocator.
pub(crate) fn copy_to_guest(
    mut store: impl AsContextMut,
    memory: &Memory,
    malloc: &TypedFunc<i32, i32>,
    data: &[u8],
    ret_ptr: u32,
    ret_size: u32,
) -> Result<(), WasmError> {
    if data.is_empty() {
        write_u32(&mut store, memory, ret_ptr, 0)?;
        write_u32(&mut store, memory, ret_size, 0)?;
        return Ok(());
    }
    let ptr = allocate(&mut store, malloc, data.len() as u32)?;
    write_bytes(&mut store, memory, ptr, data)?;
    write_u32(&mut store, memory, ret_ptr, ptr)?;
    write_u32(&mut store, memory, ret_size, data.len() as u32)?;
    Ok(())
}
