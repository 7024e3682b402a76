//! Host-registered foreign functions the guest can call by name.

use wasmtime::{Caller, Linker};

use crate::constants::*;
use crate::error::result_code;
use crate::instance::HostState;

use super::{copy_out, read_guest_bytes, read_guest_string};

pub(super) fn add_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "proxy_call_foreign_function",
        |mut caller: Caller<'_, HostState>,
         name_ptr: i32,
         name_len: i32,
         args_ptr: i32,
         args_len: i32,
         ret_results_ptr: i32,
         ret_results_size: i32|
         -> i32 {
            let name = match read_guest_string(&mut caller, name_ptr, name_len) {
                Ok(name) => name,
                Err(e) => return e.code(),
            };
            let args = match read_guest_bytes(&mut caller, args_ptr, args_len) {
                Ok(args) => args,
                Err(e) => return e.code(),
            };
            let Some(func) = caller.data_mut().with_handler(|h| h.foreign_function(&name))
            else {
                return PROXY_RESULT_NOT_FOUND;
            };
            let results = func(&args);
            result_code(copy_out(&mut caller, &results, ret_results_ptr, ret_results_size))
        },
    )?;

    Ok(())
}
