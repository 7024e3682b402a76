//! Raw ABI constants shared between the host-function layer and the guest.
//!
//! These are the wire values fixed by the Proxy-Wasm ABI; the typed enums in
//! `types` and `error` are built on top of them. Host functions return these
//! directly as `i32` so nothing structured ever crosses the boundary.

// Result codes returned by every host function.
pub const PROXY_RESULT_OK: i32 = 0;
pub const PROXY_RESULT_NOT_FOUND: i32 = 1;
pub const PROXY_RESULT_BAD_ARGUMENT: i32 = 2;
pub const PROXY_RESULT_SERIALIZATION_FAILURE: i32 = 3;
pub const PROXY_RESULT_PARSE_FAILURE: i32 = 4;
pub const PROXY_RESULT_INVALID_MEMORY_ACCESS: i32 = 6;
pub const PROXY_RESULT_EMPTY: i32 = 7;
pub const PROXY_RESULT_CAS_MISMATCH: i32 = 8;
pub const PROXY_RESULT_INTERNAL_FAILURE: i32 = 10;
pub const PROXY_RESULT_UNIMPLEMENTED: i32 = 12;

// Filter actions returned by per-exchange guest entry points.
pub const PROXY_ACTION_CONTINUE: i32 = 0;
pub const PROXY_ACTION_PAUSE: i32 = 1;

// Log levels for proxy_log / proxy_get_log_level.
pub const PROXY_LOG_TRACE: i32 = 0;
pub const PROXY_LOG_DEBUG: i32 = 1;
pub const PROXY_LOG_INFO: i32 = 2;
pub const PROXY_LOG_WARN: i32 = 3;
pub const PROXY_LOG_ERROR: i32 = 4;
pub const PROXY_LOG_CRITICAL: i32 = 5;

// Buffer sources addressed by proxy_get_buffer_bytes / proxy_set_buffer_bytes.
pub const BUFFER_TYPE_HTTP_REQUEST_BODY: i32 = 0;
pub const BUFFER_TYPE_HTTP_RESPONSE_BODY: i32 = 1;
pub const BUFFER_TYPE_DOWNSTREAM_DATA: i32 = 2;
pub const BUFFER_TYPE_UPSTREAM_DATA: i32 = 3;
pub const BUFFER_TYPE_HTTP_CALL_RESPONSE_BODY: i32 = 4;
pub const BUFFER_TYPE_GRPC_RECEIVE_BUFFER: i32 = 5;
pub const BUFFER_TYPE_VM_CONFIGURATION: i32 = 6;
pub const BUFFER_TYPE_PLUGIN_CONFIGURATION: i32 = 7;
pub const BUFFER_TYPE_CALL_DATA: i32 = 8;

// Header map sources addressed by the proxy_*_header_map_* family.
pub const MAP_TYPE_HTTP_REQUEST_HEADERS: i32 = 0;
pub const MAP_TYPE_HTTP_REQUEST_TRAILERS: i32 = 1;
pub const MAP_TYPE_HTTP_RESPONSE_HEADERS: i32 = 2;
pub const MAP_TYPE_HTTP_RESPONSE_TRAILERS: i32 = 3;
pub const MAP_TYPE_GRPC_RECEIVE_INITIAL_METADATA: i32 = 4;
pub const MAP_TYPE_GRPC_RECEIVE_TRAILING_METADATA: i32 = 5;
pub const MAP_TYPE_HTTP_CALL_RESPONSE_HEADERS: i32 = 6;
pub const MAP_TYPE_HTTP_CALL_RESPONSE_TRAILERS: i32 = 7;

// Stream identifiers used by proxy_continue_stream / proxy_close_stream and
// the action bookkeeping.
pub const STREAM_TYPE_REQUEST: i32 = 0;
pub const STREAM_TYPE_RESPONSE: i32 = 1;
pub const STREAM_TYPE_DOWNSTREAM: i32 = 2;
pub const STREAM_TYPE_UPSTREAM: i32 = 3;

// Metric kinds for proxy_define_metric.
pub const METRIC_TYPE_COUNTER: i32 = 0;
pub const METRIC_TYPE_GAUGE: i32 = 1;
pub const METRIC_TYPE_HISTOGRAM: i32 = 2;

/// Context id passed as the parent of the first (plugin) context.
pub const ROOT_CONTEXT_ID: u32 = 0;
