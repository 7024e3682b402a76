//! Unary gRPC calls. Streaming (`proxy_grpc_stream`/`proxy_grpc_send`) is
//! declined with `Unimplemented` so guests can detect the gap.

use wasmtime::{Caller, Linker};

use crate::codec::decode_map;
use crate::constants::*;
use crate::error::result_code;
use crate::instance::HostState;

use super::{read_guest_bytes, read_guest_string, write_guest_u32};

pub(super) fn add_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "proxy_grpc_call",
        |mut caller: Caller<'_, HostState>,
         upstream_ptr: i32,
         upstream_len: i32,
         service_ptr: i32,
         service_len: i32,
         method_ptr: i32,
         method_len: i32,
         metadata_ptr: i32,
         metadata_len: i32,
         message_ptr: i32,
         message_len: i32,
         timeout_ms: i32,
         ret_call_id_ptr: i32|
         -> i32 {
            let upstream = match read_guest_string(&mut caller, upstream_ptr, upstream_len) {
                Ok(upstream) => upstream,
                Err(e) => return e.code(),
            };
            let service = match read_guest_string(&mut caller, service_ptr, service_len) {
                Ok(service) => service,
                Err(e) => return e.code(),
            };
            let method = match read_guest_string(&mut caller, method_ptr, method_len) {
                Ok(method) => method,
                Err(e) => return e.code(),
            };
            let raw_metadata = match read_guest_bytes(&mut caller, metadata_ptr, metadata_len) {
                Ok(raw) => raw,
                Err(e) => return e.code(),
            };
            let message = match read_guest_bytes(&mut caller, message_ptr, message_len) {
                Ok(message) => message,
                Err(e) => return e.code(),
            };
            let call_id = match caller.data_mut().with_handler(|h| {
                h.grpc_call(
                    &upstream,
                    &service,
                    &method,
                    decode_map(&raw_metadata),
                    &message,
                    timeout_ms as u32,
                )
            }) {
                Ok(call_id) => call_id,
                Err(e) => return e.code(),
            };
            result_code(write_guest_u32(&mut caller, ret_call_id_ptr, call_id))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_grpc_cancel",
        |mut caller: Caller<'_, HostState>, call_id: i32| -> i32 {
            caller
                .data_mut()
                .with_handler(|h| h.grpc_cancel(call_id as u32))
                .as_i32()
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_grpc_close",
        |mut caller: Caller<'_, HostState>, call_id: i32| -> i32 {
            caller
                .data_mut()
                .with_handler(|h| h.grpc_close(call_id as u32))
                .as_i32()
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_grpc_stream",
        |_caller: Caller<'_, HostState>,
         _upstream_ptr: i32,
         _upstream_len: i32,
         _service_ptr: i32,
         _service_len: i32,
         _method_ptr: i32,
         _method_len: i32,
         _metadata_ptr: i32,
         _metadata_len: i32,
         _ret_stream_id_ptr: i32|
         -> i32 { PROXY_RESULT_UNIMPLEMENTED },
    )?;

    linker.func_wrap(
        "env",
        "proxy_grpc_send",
        |_caller: Caller<'_, HostState>,
         _stream_id: i32,
         _message_ptr: i32,
         _message_len: i32,
         _end_stream: i32|
         -> i32 { PROXY_RESULT_UNIMPLEMENTED },
    )?;

    Ok(())
}
