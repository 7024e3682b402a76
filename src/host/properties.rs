//! Property access. Paths travel NUL-joined on the wire.

use wasmtime::{Caller, Linker};

use crate::codec::decode_path;
use crate::constants::*;
use crate::error::result_code;
use crate::instance::HostState;

use super::{copy_out, read_guest_bytes};

pub(super) fn add_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "proxy_get_property",
        |mut caller: Caller<'_, HostState>,
         path_ptr: i32,
         path_len: i32,
         ret_ptr: i32,
         ret_size: i32|
         -> i32 {
            let raw = match read_guest_bytes(&mut caller, path_ptr, path_len) {
                Ok(raw) => raw,
                Err(e) => return e.code(),
            };
            let path = decode_path(&raw);
            let value = match caller.data_mut().with_handler(|h| h.get_property(&path)) {
                Ok(value) => value,
                Err(e) => return e.code(),
            };
            let Some(value) = value else {
                return PROXY_RESULT_NOT_FOUND;
            };
            result_code(copy_out(&mut caller, &value, ret_ptr, ret_size))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_set_property",
        |mut caller: Caller<'_, HostState>,
         path_ptr: i32,
         path_len: i32,
         value_ptr: i32,
         value_len: i32|
         -> i32 {
            let raw = match read_guest_bytes(&mut caller, path_ptr, path_len) {
                Ok(raw) => raw,
                Err(e) => return e.code(),
            };
            let path = decode_path(&raw);
            let value = match read_guest_bytes(&mut caller, value_ptr, value_len) {
                Ok(value) => value,
                Err(e) => return e.code(),
            };
            caller
                .data_mut()
                .with_handler(|h| h.set_property(&path, &value))
                .as_i32()
        },
    )?;

    Ok(())
}
