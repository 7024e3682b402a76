//! Outbound HTTP calls.

use wasmtime::{Caller, Linker};

use crate::codec::decode_map;
use crate::constants::*;
use crate::error::{result_code, WasmError};
use crate::instance::HostState;
use crate::map::ProxyMap;

use super::{read_guest_bytes, read_guest_string, write_guest_u32};

struct CallArgs {
    headers: ProxyMap,
    body: Vec<u8>,
    trailers: ProxyMap,
}

fn read_call_args(
    caller: &mut Caller<'_, HostState>,
    headers_ptr: i32,
    headers_len: i32,
    body_ptr: i32,
    body_len: i32,
    trailers_ptr: i32,
    trailers_len: i32,
) -> Result<CallArgs, WasmError> {
    let raw_headers = read_guest_bytes(caller, headers_ptr, headers_len)?;
    let body = read_guest_bytes(caller, body_ptr, body_len)?;
    let raw_trailers = read_guest_bytes(caller, trailers_ptr, trailers_len)?;
    Ok(CallArgs {
        headers: decode_map(&raw_headers),
        body,
        trailers: decode_map(&raw_trailers),
    })
}

pub(super) fn add_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "proxy_http_call",
        |mut caller: Caller<'_, HostState>,
         uri_ptr: i32,
         uri_len: i32,
         headers_ptr: i32,
         headers_len: i32,
         body_ptr: i32,
         body_len: i32,
         trailers_ptr: i32,
         trailers_len: i32,
         timeout_ms: i32,
         ret_call_id_ptr: i32|
         -> i32 {
            let uri = match read_guest_string(&mut caller, uri_ptr, uri_len) {
                Ok(uri) => uri,
                Err(e) => return e.code(),
            };
            let args = match read_call_args(
                &mut caller,
                headers_ptr,
                headers_len,
                body_ptr,
                body_len,
                trailers_ptr,
                trailers_len,
            ) {
                Ok(args) => args,
                Err(e) => return e.code(),
            };
            let call_id = match caller.data_mut().with_handler(|h| {
                h.http_call(
                    &uri,
                    args.headers,
                    &args.body,
                    args.trailers,
                    timeout_ms as u32,
                )
            }) {
                Ok(call_id) => call_id,
                Err(e) => return e.code(),
            };
            result_code(write_guest_u32(&mut caller, ret_call_id_ptr, call_id))
        },
    )?;

    // Same wire shape as `proxy_http_call`, but the first argument names a
    // configured upstream instead of carrying a URI.
    linker.func_wrap(
        "env",
        "proxy_dispatch_http_call",
        |mut caller: Caller<'_, HostState>,
         upstream_ptr: i32,
         upstream_len: i32,
         headers_ptr: i32,
         headers_len: i32,
         body_ptr: i32,
         body_len: i32,
         trailers_ptr: i32,
         trailers_len: i32,
         timeout_ms: i32,
         ret_call_id_ptr: i32|
         -> i32 {
            let upstream = match read_guest_string(&mut caller, upstream_ptr, upstream_len) {
                Ok(upstream) => upstream,
                Err(e) => return e.code(),
            };
            let args = match read_call_args(
                &mut caller,
                headers_ptr,
                headers_len,
                body_ptr,
                body_len,
                trailers_ptr,
                trailers_len,
            ) {
                Ok(args) => args,
                Err(e) => return e.code(),
            };
            let call_id = match caller.data_mut().with_handler(|h| {
                h.dispatch_http_call(
                    &upstream,
                    args.headers,
                    &args.body,
                    args.trailers,
                    timeout_ms as u32,
                )
            }) {
                Ok(call_id) => call_id,
                Err(e) => return e.code(),
            };
            result_code(write_guest_u32(&mut caller, ret_call_id_ptr, call_id))
        },
    )?;

    Ok(())
}
