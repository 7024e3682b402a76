//! Capability surface the host offers to guests, split into pluggable
//! backend traits and one internal dispatch trait.
//!
//! Backends (`LogHandler`, `MetricsHandler`, `SharedDataHandler`,
//! `SharedQueueHandler`) are what embedders implement. The internal
//! [`Handler`] trait is what the ABI layer calls; its default method bodies
//! are the sentinel layer, so a scope only overrides what it can actually
//! answer and everything else reports `Unimplemented` or absent.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{WasmError, WasmResult};
use crate::map::ProxyMap;
use crate::types::{Action, BufferType, LocalResponse, LogLevel, MapType, MetricType, StreamType};

/// A host-side function guests can invoke through `proxy_call_foreign_function`.
pub type ForeignFunction = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

/// Listener invoked by a queue backend whenever an item lands on a queue.
pub type QueueReadyListener = Arc<dyn Fn(u32) + Send + Sync>;

/// A shared-data value together with its compare-and-swap version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedData {
    pub data: Vec<u8>,
    pub cas: u32,
}

impl SharedData {
    pub fn new(data: Vec<u8>, cas: u32) -> Self {
        Self { data, cas }
    }
}

/// Identifies a shared queue: the owning VM id plus the queue's name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueName {
    vm_id: String,
    name: String,
}

impl QueueName {
    pub fn new(vm_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            name: name.into(),
        }
    }

    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Receives log lines emitted by guests.
///
/// The default methods drop everything and advertise the most verbose level,
/// so guests keep sending.
pub trait LogHandler: Send + Sync {
    fn log(&self, level: LogLevel, message: &str) -> Result<(), WasmError> {
        let _ = (level, message);
        Ok(())
    }

    fn log_level(&self) -> Result<LogLevel, WasmError> {
        Ok(LogLevel::Trace)
    }
}

/// Log backend that discards everything and reports `Critical` so guests
/// stop formatting messages nobody will see.
pub struct NopLogHandler;

impl LogHandler for NopLogHandler {
    fn log(&self, _level: LogLevel, _message: &str) -> Result<(), WasmError> {
        Ok(())
    }

    fn log_level(&self) -> Result<LogLevel, WasmError> {
        Ok(LogLevel::Critical)
    }
}

/// Backend for guest-defined metrics.
pub trait MetricsHandler: Send + Sync {
    fn define_metric(&self, metric_type: MetricType, name: &str) -> Result<u32, WasmError> {
        let _ = (metric_type, name);
        Err(WasmError::unimplemented())
    }

    fn remove_metric(&self, metric_id: u32) -> WasmResult {
        let _ = metric_id;
        WasmResult::Unimplemented
    }

    fn record_metric(&self, metric_id: u32, value: u64) -> WasmResult {
        let _ = (metric_id, value);
        WasmResult::Unimplemented
    }

    fn increment_metric(&self, metric_id: u32, offset: i64) -> WasmResult {
        let _ = (metric_id, offset);
        WasmResult::Unimplemented
    }

    fn get_metric(&self, metric_id: u32) -> Result<u64, WasmError> {
        let _ = metric_id;
        Err(WasmError::unimplemented())
    }
}

/// Backend for the shared key-value store with CAS versioning.
///
/// A zero `cas` on write is unconditional; a non-zero `cas` must match the
/// stored version or the write fails with `CasMismatch`.
pub trait SharedDataHandler: Send + Sync {
    fn get_shared_data(&self, key: &str) -> Result<SharedData, WasmError> {
        let _ = key;
        Err(WasmError::unimplemented())
    }

    fn set_shared_data(&self, key: &str, value: Option<&[u8]>, cas: u32) -> WasmResult {
        let _ = (key, value, cas);
        WasmResult::Unimplemented
    }
}

/// Backend for shared message queues.
///
/// `register` creates the queue if needed and returns its id; `resolve` only
/// looks an existing queue up. `dequeue` returns `Ok(None)` when the queue
/// exists but is drained.
pub trait SharedQueueHandler: Send + Sync {
    fn register_shared_queue(&self, name: &QueueName) -> Result<u32, WasmError> {
        let _ = name;
        Err(WasmError::unimplemented())
    }

    fn resolve_shared_queue(&self, name: &QueueName) -> Result<u32, WasmError> {
        let _ = name;
        Err(WasmError::unimplemented())
    }

    fn dequeue_shared_queue(&self, queue_id: u32) -> Result<Option<Vec<u8>>, WasmError> {
        let _ = queue_id;
        Err(WasmError::unimplemented())
    }

    fn enqueue_shared_queue(&self, queue_id: u32, value: &[u8]) -> WasmResult {
        let _ = (queue_id, value);
        WasmResult::Unimplemented
    }

    /// Registers a listener fired after each successful enqueue, with the
    /// queue id. Backends without notification support may ignore it.
    fn add_queue_ready_listener(&self, listener: QueueReadyListener) {
        let _ = listener;
    }
}

/// Internal capability dispatch used by the ABI layer.
///
/// Implemented by the per-exchange and plugin-wide scopes. Every method has
/// a sentinel default so scopes override only what they can answer.
pub(crate) trait Handler {
    fn log(&mut self, level: LogLevel, message: &str) -> Result<(), WasmError> {
        let _ = (level, message);
        Ok(())
    }

    fn log_level(&mut self) -> Result<LogLevel, WasmError> {
        Ok(LogLevel::Trace)
    }

    fn plugin_config(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn vm_config(&mut self) -> Option<Vec<u8>> {
        None
    }

    fn set_tick_period(&mut self, period_ms: u32) -> WasmResult {
        let _ = period_ms;
        WasmResult::Unimplemented
    }

    fn current_time_nanos(&mut self) -> Result<u64, WasmError> {
        Ok(SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0))
    }

    fn get_property(&mut self, path: &[String]) -> Result<Option<Vec<u8>>, WasmError> {
        let _ = path;
        Ok(None)
    }

    fn set_property(&mut self, path: &[String], value: &[u8]) -> WasmResult {
        let _ = (path, value);
        WasmResult::Unimplemented
    }

    fn send_http_response(&mut self, response: LocalResponse) -> WasmResult {
        let _ = response;
        WasmResult::Unimplemented
    }

    fn set_action(&mut self, stream_type: StreamType, action: Action) -> WasmResult {
        let _ = (stream_type, action);
        WasmResult::Unimplemented
    }

    fn clear_route_cache(&mut self) -> WasmResult {
        WasmResult::Unimplemented
    }

    /// Live view of a header map; mutations through it are visible to the
    /// surrounding exchange.
    fn get_map(&mut self, map_type: MapType) -> Option<&mut ProxyMap> {
        let _ = map_type;
        None
    }

    fn get_custom_map(&mut self, map_type: i32) -> Option<&mut ProxyMap> {
        let _ = map_type;
        None
    }

    fn get_buffer(&mut self, buffer_type: BufferType) -> Option<&[u8]> {
        let _ = buffer_type;
        None
    }

    fn set_buffer(&mut self, buffer_type: BufferType, data: Vec<u8>) -> WasmResult {
        let _ = (buffer_type, data);
        WasmResult::Unimplemented
    }

    fn get_custom_buffer(&mut self, buffer_type: i32) -> Option<&[u8]> {
        let _ = buffer_type;
        None
    }

    fn set_custom_buffer(&mut self, buffer_type: i32, data: Vec<u8>) -> WasmResult {
        let _ = (buffer_type, data);
        WasmResult::Unimplemented
    }

    fn http_call(
        &mut self,
        uri: &str,
        headers: ProxyMap,
        body: &[u8],
        trailers: ProxyMap,
        timeout_ms: u32,
    ) -> Result<u32, WasmError> {
        let _ = (uri, headers, body, trailers, timeout_ms);
        Err(WasmError::unimplemented())
    }

    fn dispatch_http_call(
        &mut self,
        upstream: &str,
        headers: ProxyMap,
        body: &[u8],
        trailers: ProxyMap,
        timeout_ms: u32,
    ) -> Result<u32, WasmError> {
        let _ = (upstream, headers, body, trailers, timeout_ms);
        Err(WasmError::unimplemented())
    }

    fn grpc_call(
        &mut self,
        upstream: &str,
        service: &str,
        method: &str,
        initial_metadata: ProxyMap,
        message: &[u8],
        timeout_ms: u32,
    ) -> Result<u32, WasmError> {
        let _ = (upstream, service, method, initial_metadata, message, timeout_ms);
        Err(WasmError::unimplemented())
    }

    fn grpc_cancel(&mut self, call_id: u32) -> WasmResult {
        let _ = call_id;
        WasmResult::Unimplemented
    }

    fn grpc_close(&mut self, call_id: u32) -> WasmResult {
        let _ = call_id;
        WasmResult::Unimplemented
    }

    fn define_metric(&mut self, metric_type: MetricType, name: &str) -> Result<u32, WasmError> {
        let _ = (metric_type, name);
        Err(WasmError::unimplemented())
    }

    fn remove_metric(&mut self, metric_id: u32) -> WasmResult {
        let _ = metric_id;
        WasmResult::Unimplemented
    }

    fn record_metric(&mut self, metric_id: u32, value: u64) -> WasmResult {
        let _ = (metric_id, value);
        WasmResult::Unimplemented
    }

    fn increment_metric(&mut self, metric_id: u32, offset: i64) -> WasmResult {
        let _ = (metric_id, offset);
        WasmResult::Unimplemented
    }

    fn get_metric(&mut self, metric_id: u32) -> Result<u64, WasmError> {
        let _ = metric_id;
        Err(WasmError::unimplemented())
    }

    fn get_shared_data(&mut self, key: &str) -> Result<SharedData, WasmError> {
        let _ = key;
        Err(WasmError::unimplemented())
    }

    fn set_shared_data(&mut self, key: &str, value: Option<&[u8]>, cas: u32) -> WasmResult {
        let _ = (key, value, cas);
        WasmResult::Unimplemented
    }

    fn register_shared_queue(&mut self, name: &QueueName) -> Result<u32, WasmError> {
        let _ = name;
        Err(WasmError::unimplemented())
    }

    fn resolve_shared_queue(&mut self, name: &QueueName) -> Result<u32, WasmError> {
        let _ = name;
        Err(WasmError::unimplemented())
    }

    fn dequeue_shared_queue(&mut self, queue_id: u32) -> Result<Option<Vec<u8>>, WasmError> {
        let _ = queue_id;
        Err(WasmError::unimplemented())
    }

    fn enqueue_shared_queue(&mut self, queue_id: u32, value: &[u8]) -> WasmResult {
        let _ = (queue_id, value);
        WasmResult::Unimplemented
    }

    fn foreign_function(&mut self, name: &str) -> Option<ForeignFunction> {
        let _ = name;
        None
    }
}

/// The sentinel handler. Holds no state; every call lands on a default body.
pub(crate) struct DefaultHandler;

impl Handler for DefaultHandler {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_defaults_report_unimplemented_or_absent() {
        let mut handler = DefaultHandler;
        assert_eq!(handler.set_tick_period(100), WasmResult::Unimplemented);
        assert!(handler.get_map(MapType::HttpRequestHeaders).is_none());
        assert!(handler.get_buffer(BufferType::HttpRequestBody).is_none());
        assert!(handler.http_call("http://x", ProxyMap::new(), b"", ProxyMap::new(), 0).is_err());
        assert_eq!(
            handler.get_shared_data("k").unwrap_err().result(),
            WasmResult::Unimplemented
        );
        assert!(handler.log(LogLevel::Info, "dropped").is_ok());
    }

    #[test]
    fn nop_log_handler_reports_critical() {
        let handler = NopLogHandler;
        assert_eq!(handler.log_level().unwrap(), LogLevel::Critical);
        assert!(handler.log(LogLevel::Error, "dropped").is_ok());
    }
}
