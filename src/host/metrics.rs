//! Metric definition and updates.

use wasmtime::{Caller, Linker};

use crate::constants::*;
use crate::error::result_code;
use crate::instance::HostState;
use crate::types::MetricType;

use super::{read_guest_string, write_guest_u32, write_guest_u64};

pub(super) fn add_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "proxy_define_metric",
        |mut caller: Caller<'_, HostState>,
         metric_type: i32,
         name_ptr: i32,
         name_len: i32,
         ret_metric_id_ptr: i32|
         -> i32 {
            let Some(metric_type) = MetricType::from_i32(metric_type) else {
                return PROXY_RESULT_BAD_ARGUMENT;
            };
            let name = match read_guest_string(&mut caller, name_ptr, name_len) {
                Ok(name) => name,
                Err(e) => return e.code(),
            };
            let metric_id = match caller
                .data_mut()
                .with_handler(|h| h.define_metric(metric_type, &name))
            {
                Ok(metric_id) => metric_id,
                Err(e) => return e.code(),
            };
            result_code(write_guest_u32(&mut caller, ret_metric_id_ptr, metric_id))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_record_metric",
        |mut caller: Caller<'_, HostState>, metric_id: i32, value: i64| -> i32 {
            caller
                .data_mut()
                .with_handler(|h| h.record_metric(metric_id as u32, value as u64))
                .as_i32()
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_increment_metric",
        |mut caller: Caller<'_, HostState>, metric_id: i32, offset: i64| -> i32 {
            caller
                .data_mut()
                .with_handler(|h| h.increment_metric(metric_id as u32, offset))
                .as_i32()
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_get_metric",
        |mut caller: Caller<'_, HostState>, metric_id: i32, ret_value_ptr: i32| -> i32 {
            let value = match caller
                .data_mut()
                .with_handler(|h| h.get_metric(metric_id as u32))
            {
                Ok(value) => value,
                Err(e) => return e.code(),
            };
            result_code(write_guest_u64(&mut caller, ret_value_ptr, value))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_remove_metric",
        |mut caller: Caller<'_, HostState>, metric_id: i32| -> i32 {
            caller
                .data_mut()
                .with_handler(|h| h.remove_metric(metric_id as u32))
                .as_i32()
        },
    )?;

    Ok(())
}
