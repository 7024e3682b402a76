//! Flow control and context lifecycle: effective context, pause/resume,
//! local responses, tick scheduling and the `proxy_done` handshake.

use wasmtime::{Caller, Linker};

use crate::codec::decode_map;
use crate::constants::*;
use crate::instance::HostState;
use crate::types::{Action, LocalResponse, StreamType};

use super::{read_guest_bytes, typed_export};

pub(super) fn add_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "proxy_set_effective_context",
        |mut caller: Caller<'_, HostState>, context_id: i32| -> i32 {
            caller
                .data_mut()
                .set_effective_context(context_id as u32)
                .as_i32()
        },
    )?;

    // Completes a close the guest deferred by returning false from
    // `proxy_on_done`: log, unregister, then delete, re-entering the guest
    // for the remaining lifecycle exports.
    linker.func_wrap(
        "env",
        "proxy_done",
        |mut caller: Caller<'_, HostState>| -> i32 {
            let context_id = caller.data().active_context;
            let plugin_context = caller.data().plugin_context;
            {
                let Some(slot) = caller.data_mut().contexts.get_mut(context_id) else {
                    return PROXY_RESULT_NOT_FOUND;
                };
                if !slot.close_started {
                    return PROXY_RESULT_NOT_FOUND;
                }
                if slot.close_done {
                    return PROXY_RESULT_OK;
                }
                slot.close_done = true;
            }
            // The slot comes out of the table even when `proxy_on_log`
            // traps; a retry must see NotFound, not a half-closed context.
            let mut trapped = false;
            if let Some(on_log) = typed_export::<i32, ()>(&mut caller, "proxy_on_log") {
                trapped = on_log.call(&mut caller, context_id as i32).is_err();
            }
            caller.data_mut().contexts.remove(context_id);
            if context_id == plugin_context {
                caller.data_mut().plugin_context = 0;
                caller.data_mut().active_context = 0;
            } else {
                caller.data_mut().active_context = plugin_context;
            }
            if trapped {
                return PROXY_RESULT_INTERNAL_FAILURE;
            }
            if let Some(on_delete) = typed_export::<i32, ()>(&mut caller, "proxy_on_delete") {
                if on_delete.call(&mut caller, context_id as i32).is_err() {
                    return PROXY_RESULT_INTERNAL_FAILURE;
                }
            }
            PROXY_RESULT_OK
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_send_local_response",
        |mut caller: Caller<'_, HostState>,
         status_code: i32,
         details_ptr: i32,
         details_len: i32,
         body_ptr: i32,
         body_len: i32,
         headers_ptr: i32,
         headers_len: i32,
         grpc_status: i32|
         -> i32 {
            let status_details = match read_guest_bytes(&mut caller, details_ptr, details_len) {
                Ok(details) => details,
                Err(e) => return e.code(),
            };
            let body = match read_guest_bytes(&mut caller, body_ptr, body_len) {
                Ok(body) => body,
                Err(e) => return e.code(),
            };
            let raw_headers = match read_guest_bytes(&mut caller, headers_ptr, headers_len) {
                Ok(raw) => raw,
                Err(e) => return e.code(),
            };
            let response = LocalResponse {
                status_code: status_code as u32,
                status_details,
                headers: decode_map(&raw_headers),
                body,
                grpc_status,
            };
            caller
                .data_mut()
                .with_handler(|h| h.send_http_response(response))
                .as_i32()
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_set_tick_period_milliseconds",
        |mut caller: Caller<'_, HostState>, period_ms: i32| -> i32 {
            caller
                .data_mut()
                .with_handler(|h| h.set_tick_period(period_ms as u32))
                .as_i32()
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_continue_stream",
        |mut caller: Caller<'_, HostState>, stream_type: i32| -> i32 {
            let Some(stream_type) = StreamType::from_i32(stream_type) else {
                return PROXY_RESULT_BAD_ARGUMENT;
            };
            caller
                .data_mut()
                .with_handler(|h| h.set_action(stream_type, Action::Continue))
                .as_i32()
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_close_stream",
        |_caller: Caller<'_, HostState>, _stream_type: i32| -> i32 {
            PROXY_RESULT_UNIMPLEMENTED
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_get_status",
        |_caller: Caller<'_, HostState>,
         _ret_code_ptr: i32,
         _ret_message_ptr: i32,
         _ret_message_size: i32|
         -> i32 { PROXY_RESULT_UNIMPLEMENTED },
    )?;

    // Pre-0.2 spellings still emitted by older SDKs. No return value on
    // the wire, so failures are dropped.
    linker.func_wrap(
        "env",
        "proxy_continue_request",
        |mut caller: Caller<'_, HostState>| {
            let _ = caller
                .data_mut()
                .with_handler(|h| h.set_action(StreamType::Request, Action::Continue));
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_continue_response",
        |mut caller: Caller<'_, HostState>| {
            let _ = caller
                .data_mut()
                .with_handler(|h| h.set_action(StreamType::Response, Action::Continue));
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_clear_route_cache",
        |mut caller: Caller<'_, HostState>| {
            let _ = caller.data_mut().with_handler(|h| h.clear_route_cache());
        },
    )?;

    Ok(())
}
