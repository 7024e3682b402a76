//! Byte-buffer access.
//!
//! Reads clamp the requested window to the buffer's actual extent; only a
//! start past the end or an overflowing range is an error. Writes splice
//! the payload into the existing buffer, which covers prepend, append and
//! full replacement. Buffer type values outside the known set route to the
//! custom-buffer hooks.

use wasmtime::{Caller, Linker};

use crate::codec::{buffer_slice, replace_bytes};
use crate::constants::*;
use crate::error::{result_code, WasmResult};
use crate::instance::HostState;
use crate::types::BufferType;

use super::{copy_out, read_guest_bytes, write_guest_u32};

pub(super) fn add_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "proxy_get_buffer_bytes",
        |mut caller: Caller<'_, HostState>,
         buffer_type: i32,
         start: i32,
         length: i32,
         ret_ptr: i32,
         ret_size: i32|
         -> i32 {
            let data = caller.data_mut().with_handler(|h| {
                match BufferType::from_i32(buffer_type) {
                    Some(buffer_type) => h.get_buffer(buffer_type).map(<[u8]>::to_vec),
                    None => h.get_custom_buffer(buffer_type).map(<[u8]>::to_vec),
                }
            });
            // Absent and empty both read as NotFound.
            let Some(data) = data else {
                return PROXY_RESULT_NOT_FOUND;
            };
            if data.is_empty() {
                return PROXY_RESULT_NOT_FOUND;
            }
            let window = match buffer_slice(&data, start as u32, length as u32) {
                Ok(window) => window.to_vec(),
                Err(e) => return e.code(),
            };
            result_code(copy_out(&mut caller, &window, ret_ptr, ret_size))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_set_buffer_bytes",
        |mut caller: Caller<'_, HostState>,
         buffer_type: i32,
         start: i32,
         length: i32,
         data_ptr: i32,
         data_len: i32|
         -> i32 {
            let change = match read_guest_bytes(&mut caller, data_ptr, data_len) {
                Ok(change) => change,
                Err(e) => return e.code(),
            };
            let result = caller.data_mut().with_handler(|h| {
                match BufferType::from_i32(buffer_type) {
                    Some(buffer_type) => {
                        let Some(existing) = h.get_buffer(buffer_type) else {
                            return WasmResult::NotFound;
                        };
                        let updated =
                            replace_bytes(existing, &change, start as u32, length as u32);
                        h.set_buffer(buffer_type, updated)
                    }
                    None => {
                        let Some(existing) = h.get_custom_buffer(buffer_type) else {
                            return WasmResult::NotFound;
                        };
                        let updated =
                            replace_bytes(existing, &change, start as u32, length as u32);
                        h.set_custom_buffer(buffer_type, updated)
                    }
                }
            });
            result.as_i32()
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_get_buffer_status",
        |mut caller: Caller<'_, HostState>,
         buffer_type: i32,
         ret_size_ptr: i32,
         ret_flags_ptr: i32|
         -> i32 {
            let size = caller.data_mut().with_handler(|h| {
                match BufferType::from_i32(buffer_type) {
                    Some(buffer_type) => h.get_buffer(buffer_type).map(|b| b.len()),
                    None => h.get_custom_buffer(buffer_type).map(|b| b.len()),
                }
            });
            let Some(size) = size else {
                return PROXY_RESULT_NOT_FOUND;
            };
            if let Err(e) = write_guest_u32(&mut caller, ret_size_ptr, size as u32) {
                return e.code();
            }
            result_code(write_guest_u32(&mut caller, ret_flags_ptr, 0))
        },
    )?;

    Ok(())
}
