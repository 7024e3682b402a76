//! `proxy_log` and `proxy_get_log_level`.

use wasmtime::{Caller, Linker};

use crate::constants::*;
use crate::error::result_code;
use crate::instance::HostState;
use crate::types::LogLevel;

use super::{read_guest_string, write_guest_u32};

pub(super) fn add_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "proxy_log",
        |mut caller: Caller<'_, HostState>, level: i32, message_ptr: i32, message_len: i32| -> i32 {
            let Some(level) = LogLevel::from_i32(level) else {
                return PROXY_RESULT_BAD_ARGUMENT;
            };
            let message = match read_guest_string(&mut caller, message_ptr, message_len) {
                Ok(message) => message,
                Err(e) => return e.code(),
            };
            result_code(caller.data_mut().with_handler(|h| h.log(level, &message)))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_get_log_level",
        |mut caller: Caller<'_, HostState>, ret_level_ptr: i32| -> i32 {
            let level = match caller.data_mut().with_handler(|h| h.log_level()) {
                Ok(level) => level,
                Err(e) => return e.code(),
            };
            result_code(write_guest_u32(&mut caller, ret_level_ptr, level.as_i32() as u32))
        },
    )?;

    Ok(())
}
