//! Shared key/value data and shared queues.

use wasmtime::{Caller, Linker};

use crate::constants::*;
use crate::error::{result_code, WasmError};
use crate::handler::QueueName;
use crate::instance::HostState;

use super::{copy_out, read_guest_bytes, read_guest_string, write_guest_u32};

/// Queue names are scoped by the owning VM; the guest addresses queues by
/// bare name, so the host fills the `vm_id` half in from the property space.
fn vm_scoped_name(
    caller: &mut Caller<'_, HostState>,
    name: &str,
) -> Result<QueueName, WasmError> {
    let path = vec!["vm_id".to_string()];
    let vm_id = caller
        .data_mut()
        .with_handler(|h| h.get_property(&path))?
        .ok_or_else(WasmError::internal_failure)?;
    let vm_id =
        String::from_utf8(vm_id).map_err(|_| WasmError::internal_failure())?;
    Ok(QueueName::new(vm_id, name))
}

pub(super) fn add_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "proxy_get_shared_data",
        |mut caller: Caller<'_, HostState>,
         key_ptr: i32,
         key_len: i32,
         ret_value_ptr: i32,
         ret_value_size: i32,
         ret_cas_ptr: i32|
         -> i32 {
            let key = match read_guest_string(&mut caller, key_ptr, key_len) {
                Ok(key) => key,
                Err(e) => return e.code(),
            };
            let entry = match caller.data_mut().with_handler(|h| h.get_shared_data(&key)) {
                Ok(entry) => entry,
                Err(e) => return e.code(),
            };
            if let Err(e) = copy_out(&mut caller, &entry.data, ret_value_ptr, ret_value_size) {
                return e.code();
            }
            result_code(write_guest_u32(&mut caller, ret_cas_ptr, entry.cas))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_set_shared_data",
        |mut caller: Caller<'_, HostState>,
         key_ptr: i32,
         key_len: i32,
         value_ptr: i32,
         value_len: i32,
         cas: i32|
         -> i32 {
            let key = match read_guest_string(&mut caller, key_ptr, key_len) {
                Ok(key) => key,
                Err(e) => return e.code(),
            };
            // Null pointer with zero length deletes the key; an empty value
            // at a real pointer stores an empty entry.
            let value = if value_ptr == 0 && value_len == 0 {
                None
            } else {
                match read_guest_bytes(&mut caller, value_ptr, value_len) {
                    Ok(value) => Some(value),
                    Err(e) => return e.code(),
                }
            };
            caller
                .data_mut()
                .with_handler(|h| h.set_shared_data(&key, value.as_deref(), cas as u32))
                .as_i32()
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_register_shared_queue",
        |mut caller: Caller<'_, HostState>,
         name_ptr: i32,
         name_len: i32,
         ret_queue_id_ptr: i32|
         -> i32 {
            let name = match read_guest_string(&mut caller, name_ptr, name_len) {
                Ok(name) => name,
                Err(e) => return e.code(),
            };
            let queue_name = match vm_scoped_name(&mut caller, &name) {
                Ok(queue_name) => queue_name,
                Err(e) => return e.code(),
            };
            let queue_id = match caller
                .data_mut()
                .with_handler(|h| h.register_shared_queue(&queue_name))
            {
                Ok(queue_id) => queue_id,
                Err(e) => return e.code(),
            };
            result_code(write_guest_u32(&mut caller, ret_queue_id_ptr, queue_id))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_resolve_shared_queue",
        |mut caller: Caller<'_, HostState>,
         vm_id_ptr: i32,
         vm_id_len: i32,
         name_ptr: i32,
         name_len: i32,
         ret_queue_id_ptr: i32|
         -> i32 {
            let vm_id = match read_guest_string(&mut caller, vm_id_ptr, vm_id_len) {
                Ok(vm_id) => vm_id,
                Err(e) => return e.code(),
            };
            let name = match read_guest_string(&mut caller, name_ptr, name_len) {
                Ok(name) => name,
                Err(e) => return e.code(),
            };
            let queue_name = QueueName::new(vm_id, name);
            let queue_id = match caller
                .data_mut()
                .with_handler(|h| h.resolve_shared_queue(&queue_name))
            {
                Ok(queue_id) => queue_id,
                Err(e) => return e.code(),
            };
            result_code(write_guest_u32(&mut caller, ret_queue_id_ptr, queue_id))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_enqueue_shared_queue",
        |mut caller: Caller<'_, HostState>,
         queue_id: i32,
         value_ptr: i32,
         value_len: i32|
         -> i32 {
            let value = match read_guest_bytes(&mut caller, value_ptr, value_len) {
                Ok(value) => value,
                Err(e) => return e.code(),
            };
            caller
                .data_mut()
                .with_handler(|h| h.enqueue_shared_queue(queue_id as u32, &value))
                .as_i32()
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_dequeue_shared_queue",
        |mut caller: Caller<'_, HostState>,
         queue_id: i32,
         ret_value_ptr: i32,
         ret_value_size: i32|
         -> i32 {
            let item = match caller
                .data_mut()
                .with_handler(|h| h.dequeue_shared_queue(queue_id as u32))
            {
                Ok(item) => item,
                Err(e) => return e.code(),
            };
            // A registered-but-drained queue answers Empty, not NotFound.
            let Some(item) = item else {
                return PROXY_RESULT_EMPTY;
            };
            result_code(copy_out(&mut caller, &item, ret_value_ptr, ret_value_size))
        },
    )?;

    Ok(())
}
