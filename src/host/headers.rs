//! Header-map access: pairs, single values and sizes.
//!
//! Maps are addressed by `MapType`; an absent map (wrong flow, no such
//! payload staged) is `NotFound` throughout.

use wasmtime::{Caller, Linker};

use crate::codec::{decode_map, encode_map, encoded_map_size};
use crate::constants::*;
use crate::error::result_code;
use crate::instance::HostState;
use crate::types::MapType;

use super::{copy_out, read_guest_bytes, read_guest_string, write_guest_u32};

pub(super) fn add_functions(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(
        "env",
        "proxy_get_header_map_pairs",
        |mut caller: Caller<'_, HostState>, map_type: i32, ret_ptr: i32, ret_size: i32| -> i32 {
            let Some(map_type) = MapType::from_i32(map_type) else {
                return PROXY_RESULT_BAD_ARGUMENT;
            };
            let encoded = caller
                .data_mut()
                .with_handler(|h| h.get_map(map_type).map(|map| encode_map(map)));
            let Some(encoded) = encoded else {
                return PROXY_RESULT_NOT_FOUND;
            };
            result_code(copy_out(&mut caller, &encoded, ret_ptr, ret_size))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_set_header_map_pairs",
        |mut caller: Caller<'_, HostState>, map_type: i32, data_ptr: i32, data_len: i32| -> i32 {
            let Some(map_type) = MapType::from_i32(map_type) else {
                return PROXY_RESULT_BAD_ARGUMENT;
            };
            let data = match read_guest_bytes(&mut caller, data_ptr, data_len) {
                Ok(data) => data,
                Err(e) => return e.code(),
            };
            let incoming = decode_map(&data);
            let found = caller.data_mut().with_handler(|h| {
                let Some(map) = h.get_map(map_type) else {
                    return false;
                };
                // Keys present in the payload are replaced wholesale;
                // everything else in the map survives.
                for key in incoming.keys() {
                    map.remove(&key);
                }
                for (key, value) in incoming.entries() {
                    map.add(key, value);
                }
                true
            });
            if found {
                PROXY_RESULT_OK
            } else {
                PROXY_RESULT_NOT_FOUND
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_get_header_map_value",
        |mut caller: Caller<'_, HostState>,
         map_type: i32,
         key_ptr: i32,
         key_len: i32,
         ret_ptr: i32,
         ret_size: i32|
         -> i32 {
            let Some(map_type) = MapType::from_i32(map_type) else {
                return PROXY_RESULT_BAD_ARGUMENT;
            };
            let key = match read_guest_string(&mut caller, key_ptr, key_len) {
                Ok(key) => key,
                Err(e) => return e.code(),
            };
            let value = caller.data_mut().with_handler(|h| {
                h.get_map(map_type)
                    .and_then(|map| map.get(&key).map(str::to_string))
            });
            let Some(value) = value else {
                return PROXY_RESULT_NOT_FOUND;
            };
            result_code(copy_out(&mut caller, value.as_bytes(), ret_ptr, ret_size))
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_add_header_map_value",
        |mut caller: Caller<'_, HostState>,
         map_type: i32,
         key_ptr: i32,
         key_len: i32,
         value_ptr: i32,
         value_len: i32|
         -> i32 {
            mutate_value(&mut caller, map_type, key_ptr, key_len, value_ptr, value_len, Mutation::Add)
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_replace_header_map_value",
        |mut caller: Caller<'_, HostState>,
         map_type: i32,
         key_ptr: i32,
         key_len: i32,
         value_ptr: i32,
         value_len: i32|
         -> i32 {
            mutate_value(&mut caller, map_type, key_ptr, key_len, value_ptr, value_len, Mutation::Replace)
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_remove_header_map_value",
        |mut caller: Caller<'_, HostState>, map_type: i32, key_ptr: i32, key_len: i32| -> i32 {
            let Some(map_type) = MapType::from_i32(map_type) else {
                return PROXY_RESULT_BAD_ARGUMENT;
            };
            let key = match read_guest_string(&mut caller, key_ptr, key_len) {
                Ok(key) => key,
                Err(e) => return e.code(),
            };
            let found = caller.data_mut().with_handler(|h| match h.get_map(map_type) {
                Some(map) => {
                    map.remove(&key);
                    true
                }
                None => false,
            });
            if found {
                PROXY_RESULT_OK
            } else {
                PROXY_RESULT_NOT_FOUND
            }
        },
    )?;

    linker.func_wrap(
        "env",
        "proxy_get_header_map_size",
        |mut caller: Caller<'_, HostState>, map_type: i32, ret_size_ptr: i32| -> i32 {
            let Some(map_type) = MapType::from_i32(map_type) else {
                return PROXY_RESULT_BAD_ARGUMENT;
            };
            let size = caller
                .data_mut()
                .with_handler(|h| h.get_map(map_type).map(|map| encoded_map_size(map)));
            let Some(size) = size else {
                return PROXY_RESULT_NOT_FOUND;
            };
            result_code(write_guest_u32(&mut caller, ret_size_ptr, size as u32))
        },
    )?;

    Ok(())
}

enum Mutation {
    Add,
    Replace,
}

fn mutate_value(
    caller: &mut Caller<'_, HostState>,
    map_type: i32,
    key_ptr: i32,
    key_len: i32,
    value_ptr: i32,
    value_len: i32,
    mutation: Mutation,
) -> i32 {
    let Some(map_type) = MapType::from_i32(map_type) else {
        return PROXY_RESULT_BAD_ARGUMENT;
    };
    let key = match read_guest_string(caller, key_ptr, key_len) {
        Ok(key) => key,
        Err(e) => return e.code(),
    };
    let value = match read_guest_string(caller, value_ptr, value_len) {
        Ok(value) => value,
        Err(e) => return e.code(),
    };
    let found = caller.data_mut().with_handler(|h| match h.get_map(map_type) {
        Some(map) => {
            match mutation {
                Mutation::Add => map.add(&key, &value),
                Mutation::Replace => map.put(&key, &value),
            }
            true
        }
        None => false,
    });
    if found {
        PROXY_RESULT_OK
    } else {
        PROXY_RESULT_NOT_FOUND
    }
}
