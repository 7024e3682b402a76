//! Embedder-facing adaptors that bridge plugins to the surrounding server.
//!
//! A [`ServerAdaptor`] supplies scheduling: recurring ticks plus outbound
//! HTTP and gRPC calls. A [`HttpRequestAdaptor`] exposes one in-flight
//! exchange of the embedding server (its header maps, peer addresses, and
//! well-known properties) to the plugin. Both default to refusing what they
//! do not support, so a minimal embedder only implements ticks.

use std::sync::Arc;

use crate::codec::encode_map;
use crate::error::{WasmError, WasmResult};
use crate::map::ProxyMap;
use crate::properties;

/// Cancels a previously scheduled task. Dropping it without calling leaves
/// the task running.
pub type CancelHandle = Box<dyn FnOnce() + Send>;

/// A tick callback, invoked once per period until cancelled.
pub type TickTask = Arc<dyn Fn() + Send + Sync>;

/// One-shot completion for an outbound HTTP call: status, response headers,
/// response body.
pub type HttpCallCallback = Box<dyn FnOnce(u32, ProxyMap, Vec<u8>) + Send>;

/// Streaming events for an outbound gRPC call.
pub trait GrpcCallResponseHandler: Send {
    fn on_headers(&self, metadata: ProxyMap);
    fn on_message(&self, data: Vec<u8>);
    fn on_trailers(&self, trailers: ProxyMap);
    fn on_close(&self, status: i32);
}

/// Why a schedule request was refused.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("not supported by this server adaptor")]
    Unsupported,
    #[error("scheduling failed: {0}")]
    Failed(String),
}

/// An outbound HTTP call, already resolved against the upstream table.
pub struct HttpCallRequest {
    pub method: String,
    pub host: String,
    pub port: u16,
    pub uri: String,
    pub headers: ProxyMap,
    pub body: Vec<u8>,
    pub trailers: ProxyMap,
    pub timeout_ms: u32,
}

/// An outbound gRPC call, already resolved against the upstream table.
pub struct GrpcCallRequest {
    pub host: String,
    pub port: u16,
    pub plaintext: bool,
    pub service: String,
    pub method: String,
    pub initial_metadata: ProxyMap,
    pub message: Vec<u8>,
    pub timeout_ms: u32,
}

/// Scheduling services a server lends to its plugins.
pub trait ServerAdaptor: Send + Sync {
    /// Runs `task` every `period_ms` milliseconds until the returned handle
    /// is invoked.
    fn schedule_tick(&self, period_ms: u64, task: TickTask) -> CancelHandle;

    fn schedule_http_call(
        &self,
        request: HttpCallRequest,
        on_response: HttpCallCallback,
    ) -> Result<CancelHandle, ScheduleError> {
        let _ = (request, on_response);
        Err(ScheduleError::Unsupported)
    }

    fn schedule_grpc_call(
        &self,
        request: GrpcCallRequest,
        events: Box<dyn GrpcCallResponseHandler>,
    ) -> Result<CancelHandle, ScheduleError> {
        let _ = (request, events);
        Err(ScheduleError::Unsupported)
    }
}

/// View of one server exchange as seen by a plugin.
///
/// Map getters hand out live references; whatever the guest edits through
/// them is what the adaptor applies back to the server's own structures
/// after the filter call returns. The property methods cover the well-known
/// attribute catalog; unanswered paths fall through to the per-exchange
/// overlay store.
pub trait HttpRequestAdaptor: Send {
    fn remote_address(&self) -> String {
        String::new()
    }

    fn remote_port(&self) -> u32 {
        0
    }

    fn local_address(&self) -> String {
        String::new()
    }

    fn local_port(&self) -> u32 {
        0
    }

    fn protocol(&self) -> String {
        "HTTP/1.1".to_string()
    }

    fn request_headers(&mut self) -> Option<&mut ProxyMap> {
        None
    }

    fn request_trailers(&mut self) -> Option<&mut ProxyMap> {
        None
    }

    fn response_headers(&mut self) -> Option<&mut ProxyMap> {
        None
    }

    fn response_trailers(&mut self) -> Option<&mut ProxyMap> {
        None
    }

    fn grpc_receive_initial_metadata(&mut self) -> Option<&mut ProxyMap> {
        None
    }

    fn grpc_receive_trailing_metadata(&mut self) -> Option<&mut ProxyMap> {
        None
    }

    /// Serves a well-known property from the typed accessors. Ports encode
    /// as 8-byte little-endian integers, matching what guests compiled
    /// against Envoy expect.
    fn get_property(&mut self, path: &[String]) -> Result<Option<Vec<u8>>, WasmError> {
        if properties::matches(path, properties::SOURCE_ADDRESS) {
            return Ok(Some(self.remote_address().into_bytes()));
        }
        if properties::matches(path, properties::SOURCE_PORT) {
            return Ok(Some((self.remote_port() as u64).to_le_bytes().to_vec()));
        }
        if properties::matches(path, properties::DESTINATION_ADDRESS) {
            return Ok(Some(self.local_address().into_bytes()));
        }
        if properties::matches(path, properties::DESTINATION_PORT) {
            return Ok(Some((self.local_port() as u64).to_le_bytes().to_vec()));
        }
        if properties::matches(path, properties::REQUEST_PROTOCOL) {
            return Ok(Some(self.protocol().into_bytes()));
        }
        if properties::matches(path, properties::REQUEST_HEADERS) {
            return Ok(self.request_headers().map(|map| encode_map(map)));
        }
        if properties::matches(path, properties::RESPONSE_HEADERS) {
            return Ok(self.response_headers().map(|map| encode_map(map)));
        }
        if properties::matches(path, properties::RESPONSE_TRAILERS) {
            return Ok(self.response_trailers().map(|map| encode_map(map)));
        }
        Ok(None)
    }

    /// `NotFound` means "not mine"; the caller then writes to the overlay.
    fn set_property(&mut self, path: &[String], value: &[u8]) -> WasmResult {
        let _ = (path, value);
        WasmResult::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PeerOnlyAdaptor;

    impl HttpRequestAdaptor for PeerOnlyAdaptor {
        fn remote_address(&self) -> String {
            "10.0.0.7".to_string()
        }

        fn remote_port(&self) -> u32 {
            41812
        }
    }

    #[test]
    fn default_property_dispatch_answers_peer_attributes() {
        let mut adaptor = PeerOnlyAdaptor;
        let path = vec!["source".to_string(), "address".to_string()];
        assert_eq!(
            adaptor.get_property(&path).unwrap(),
            Some(b"10.0.0.7".to_vec())
        );

        let path = vec!["source".to_string(), "port".to_string()];
        assert_eq!(
            adaptor.get_property(&path).unwrap(),
            Some(41812u64.to_le_bytes().to_vec())
        );

        let path = vec!["request".to_string(), "id".to_string()];
        assert_eq!(adaptor.get_property(&path).unwrap(), None);
    }

    #[test]
    fn unhandled_set_property_reports_not_found() {
        let mut adaptor = PeerOnlyAdaptor;
        let path = vec!["request".to_string(), "path".to_string()];
        assert_eq!(adaptor.set_property(&path, b"/x"), WasmResult::NotFound);
    }
}
