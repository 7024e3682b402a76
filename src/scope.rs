//! Capability scopes: what a guest call can touch given the context it runs
//! in.
//!
//! Every host function resolves the active context to a [`Scope`] and goes
//! through the [`Handler`] impl here. Plugin-wide concerns (logging, ticks,
//! outbound calls, metrics, shared state) answer the same way whatever the
//! flow; per-flow concerns (header maps, bodies, pause state, the local
//! response) are only reachable while the matching flow is active.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::adaptor::{
    GrpcCallRequest, HttpCallCallback, HttpCallRequest, ScheduleError, ServerAdaptor, TickTask,
};
use crate::dispatch::{
    clamp_tick_period, normalize_request_path, resolve_upstream, split_pseudo_headers,
    PendingCalls, Upstream,
};
use crate::error::{WasmError, WasmResult};
use crate::exchange::{ExchangeState, StreamState};
use crate::handler::{
    ForeignFunction, Handler, LogHandler, MetricsHandler, QueueName, SharedData,
    SharedDataHandler, SharedQueueHandler,
};
use crate::map::ProxyMap;
use crate::plugin::{GrpcEventRelay, PluginCore};
use crate::properties;
use crate::types::{Action, BufferType, LocalResponse, LogLevel, MapType, MetricType, StreamType};

/// Plugin-wide state living inside the instance's store.
pub(crate) struct PluginState {
    pub name: String,
    pub vm_config: Vec<u8>,
    pub plugin_config: Vec<u8>,
    pub properties: HashMap<Vec<String>, Vec<u8>>,
    pub func_call_data: Vec<u8>,
    pub strict_upstreams: bool,
    pub upstreams: HashMap<String, Upstream>,
    pub min_tick_period_ms: u32,
    pub tick_period_ms: u32,
    pub cancel_tick: Option<crate::adaptor::CancelHandle>,
    pub calls: PendingCalls,
    pub log: Arc<dyn LogHandler>,
    pub metrics: Arc<dyn MetricsHandler>,
    pub shared_data: Arc<dyn SharedDataHandler>,
    pub shared_queues: Arc<dyn SharedQueueHandler>,
    pub foreign_functions: HashMap<String, ForeignFunction>,
    pub adaptor: Arc<dyn ServerAdaptor>,
    /// Back-reference for completion callbacks; empty until the owning
    /// plugin finishes construction.
    pub plugin_ref: Weak<PluginCore>,
}

/// Staging area for call-response and gRPC event payloads.
///
/// Completions run on the plugin context, so these live beside the context
/// registry rather than inside any one flow. They are populated just before
/// the matching `proxy_on_*` export fires and cleared right after.
#[derive(Default)]
pub(crate) struct CallScratch {
    pub call_headers: Option<ProxyMap>,
    pub call_trailers: Option<ProxyMap>,
    pub call_body: Option<Vec<u8>>,
    pub grpc_initial: Option<ProxyMap>,
    pub grpc_trailing: Option<ProxyMap>,
    pub grpc_message: Option<Vec<u8>>,
}

impl CallScratch {
    pub(crate) fn clear(&mut self) {
        *self = CallScratch::default();
    }
}

/// The flow the active context is attached to.
pub(crate) enum Flow<'a> {
    Plugin,
    Http(&'a mut ExchangeState),
    Stream(&'a mut StreamState),
}

pub(crate) struct Scope<'a> {
    pub plugin: &'a mut PluginState,
    pub scratch: &'a mut CallScratch,
    pub flow: Flow<'a>,
}

impl<'a> Scope<'a> {
    fn schedule_http(
        &mut self,
        target: Upstream,
        headers: ProxyMap,
        body: &[u8],
        trailers: ProxyMap,
        timeout_ms: u32,
    ) -> Result<u32, WasmError> {
        let line = split_pseudo_headers(&headers)?;
        let path = normalize_request_path(&line.scheme, &line.authority, &line.path)?;
        let port = target.port_for(&line.scheme);
        let request = HttpCallRequest {
            method: line.method,
            host: target.host,
            port,
            uri: path,
            headers: line.headers,
            body: body.to_vec(),
            trailers,
            timeout_ms,
        };
        let id = self.plugin.calls.next_id();
        let weak = self.plugin.plugin_ref.clone();
        let on_response: HttpCallCallback = Box::new(move |status, headers, body| {
            if let Some(core) = weak.upgrade() {
                core.complete_http_call(id, status, headers, body);
            }
        });
        match self.plugin.adaptor.schedule_http_call(request, on_response) {
            Ok(cancel) => {
                self.plugin.calls.insert_http(id, cancel);
                Ok(id)
            }
            Err(ScheduleError::Unsupported) => Err(WasmError::unimplemented()),
            Err(ScheduleError::Failed(_)) => Err(WasmError::internal_failure()),
        }
    }
}

impl<'a> Handler for Scope<'a> {
    fn log(&mut self, level: LogLevel, message: &str) -> Result<(), WasmError> {
        self.plugin.log.log(level, message)
    }

    fn log_level(&mut self) -> Result<LogLevel, WasmError> {
        self.plugin.log.log_level()
    }

    fn plugin_config(&mut self) -> Option<Vec<u8>> {
        if self.plugin.plugin_config.is_empty() {
            None
        } else {
            Some(self.plugin.plugin_config.clone())
        }
    }

    fn vm_config(&mut self) -> Option<Vec<u8>> {
        if self.plugin.vm_config.is_empty() {
            None
        } else {
            Some(self.plugin.vm_config.clone())
        }
    }

    fn set_tick_period(&mut self, period_ms: u32) -> WasmResult {
        if period_ms == self.plugin.tick_period_ms {
            return WasmResult::Ok;
        }
        if let Some(cancel) = self.plugin.cancel_tick.take() {
            cancel();
        }
        self.plugin.tick_period_ms = period_ms;
        if period_ms == 0 {
            return WasmResult::Ok;
        }
        let effective = clamp_tick_period(period_ms, self.plugin.min_tick_period_ms);
        let weak = self.plugin.plugin_ref.clone();
        let task: TickTask = Arc::new(move || {
            if let Some(core) = weak.upgrade() {
                core.deliver_tick();
            }
        });
        self.plugin.cancel_tick = Some(self.plugin.adaptor.schedule_tick(effective, task));
        WasmResult::Ok
    }

    fn get_property(&mut self, path: &[String]) -> Result<Option<Vec<u8>>, WasmError> {
        match &mut self.flow {
            Flow::Plugin => {
                if let Some(value) = self.plugin.properties.get(path) {
                    return Ok(Some(value.clone()));
                }
                // The vm id falls back to the plugin name so queue
                // registration works without any seeding.
                if properties::matches(path, properties::PLUGIN_NAME)
                    || properties::matches(path, properties::PLUGIN_ROOT_ID)
                    || properties::matches(path, properties::PLUGIN_VM_ID)
                    || properties::matches(path, properties::VM_ID)
                {
                    return Ok(Some(self.plugin.name.clone().into_bytes()));
                }
                Ok(None)
            }
            Flow::Http(exchange) => {
                if let Some(value) = exchange.adaptor.get_property(path)? {
                    return Ok(Some(value));
                }
                Ok(exchange.properties.get(path).cloned())
            }
            Flow::Stream(stream) => Ok(stream.properties.get(path).cloned()),
        }
    }

    fn set_property(&mut self, path: &[String], value: &[u8]) -> WasmResult {
        match &mut self.flow {
            Flow::Plugin => {
                self.plugin.properties.insert(path.to_vec(), value.to_vec());
                WasmResult::Ok
            }
            Flow::Http(exchange) => {
                // NotFound from the adaptor means "not one of mine"; the
                // value then lands in the per-exchange overlay.
                match exchange.adaptor.set_property(path, value) {
                    WasmResult::NotFound => {
                        exchange.properties.insert(path.to_vec(), value.to_vec());
                        WasmResult::Ok
                    }
                    other => other,
                }
            }
            Flow::Stream(stream) => {
                stream.properties.insert(path.to_vec(), value.to_vec());
                WasmResult::Ok
            }
        }
    }

    fn send_http_response(&mut self, response: LocalResponse) -> WasmResult {
        match &mut self.flow {
            Flow::Http(exchange) => {
                exchange.send_response = Some(response);
                exchange.gate.release();
                WasmResult::Ok
            }
            _ => WasmResult::Unimplemented,
        }
    }

    fn set_action(&mut self, _stream_type: StreamType, action: Action) -> WasmResult {
        match &mut self.flow {
            Flow::Http(exchange) => {
                exchange.action = action;
                if action == Action::Continue {
                    exchange.gate.release();
                }
                WasmResult::Ok
            }
            Flow::Stream(stream) => {
                stream.action = action;
                if action == Action::Continue {
                    stream.gate.release();
                }
                WasmResult::Ok
            }
            Flow::Plugin => WasmResult::BadArgument,
        }
    }

    fn get_map(&mut self, map_type: MapType) -> Option<&mut ProxyMap> {
        match map_type {
            MapType::HttpCallResponseHeaders => return self.scratch.call_headers.as_mut(),
            MapType::HttpCallResponseTrailers => return self.scratch.call_trailers.as_mut(),
            MapType::GrpcReceiveInitialMetadata => return self.scratch.grpc_initial.as_mut(),
            MapType::GrpcReceiveTrailingMetadata => return self.scratch.grpc_trailing.as_mut(),
            _ => {}
        }
        match &mut self.flow {
            Flow::Http(exchange) => match map_type {
                MapType::HttpRequestHeaders => exchange.adaptor.request_headers(),
                MapType::HttpRequestTrailers => exchange.adaptor.request_trailers(),
                MapType::HttpResponseHeaders => exchange.adaptor.response_headers(),
                MapType::HttpResponseTrailers => exchange.adaptor.response_trailers(),
                _ => None,
            },
            _ => None,
        }
    }

    fn get_buffer(&mut self, buffer_type: BufferType) -> Option<&[u8]> {
        match buffer_type {
            BufferType::VmConfiguration => return Some(&self.plugin.vm_config),
            BufferType::PluginConfiguration => return Some(&self.plugin.plugin_config),
            BufferType::CallData => return Some(&self.plugin.func_call_data),
            BufferType::HttpCallResponseBody => return self.scratch.call_body.as_deref(),
            BufferType::GrpcReceiveBuffer => return self.scratch.grpc_message.as_deref(),
            _ => {}
        }
        match &mut self.flow {
            Flow::Http(exchange) => match buffer_type {
                BufferType::HttpRequestBody => exchange.request_body.force(),
                BufferType::HttpResponseBody => exchange.response_body.force(),
                _ => None,
            },
            Flow::Stream(stream) => match buffer_type {
                BufferType::DownstreamData => stream.downstream_data.as_deref(),
                BufferType::UpstreamData => stream.upstream_data.as_deref(),
                _ => None,
            },
            Flow::Plugin => None,
        }
    }

    fn set_buffer(&mut self, buffer_type: BufferType, data: Vec<u8>) -> WasmResult {
        match buffer_type {
            BufferType::CallData => {
                self.plugin.func_call_data = data;
                return WasmResult::Ok;
            }
            BufferType::HttpCallResponseBody => {
                self.scratch.call_body = Some(data);
                return WasmResult::Ok;
            }
            BufferType::GrpcReceiveBuffer => {
                self.scratch.grpc_message = Some(data);
                return WasmResult::Ok;
            }
            _ => {}
        }
        match &mut self.flow {
            Flow::Http(exchange) => match buffer_type {
                BufferType::HttpRequestBody => {
                    exchange.request_body.set(data);
                    WasmResult::Ok
                }
                BufferType::HttpResponseBody => {
                    exchange.response_body.set(data);
                    WasmResult::Ok
                }
                _ => WasmResult::NotFound,
            },
            Flow::Stream(stream) => match buffer_type {
                BufferType::DownstreamData => {
                    stream.downstream_data = Some(data);
                    WasmResult::Ok
                }
                BufferType::UpstreamData => {
                    stream.upstream_data = Some(data);
                    WasmResult::Ok
                }
                _ => WasmResult::NotFound,
            },
            Flow::Plugin => WasmResult::NotFound,
        }
    }

    fn http_call(
        &mut self,
        uri: &str,
        headers: ProxyMap,
        body: &[u8],
        trailers: ProxyMap,
        timeout_ms: u32,
    ) -> Result<u32, WasmError> {
        let target = resolve_upstream(
            &self.plugin.upstreams,
            self.plugin.strict_upstreams,
            uri,
        )?;
        self.schedule_http(target, headers, body, trailers, timeout_ms)
    }

    fn dispatch_http_call(
        &mut self,
        upstream: &str,
        headers: ProxyMap,
        body: &[u8],
        trailers: ProxyMap,
        timeout_ms: u32,
    ) -> Result<u32, WasmError> {
        self.http_call(upstream, headers, body, trailers, timeout_ms)
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
        let target = resolve_upstream(
            &self.plugin.upstreams,
            self.plugin.strict_upstreams,
            upstream,
        )?;
        if target.scheme != "http" && target.scheme != "https" {
            let _ = self.plugin.log.log(
                LogLevel::Error,
                &format!("grpc call upstream is not an http/https endpoint: {}", upstream),
            );
            return Err(WasmError::bad_argument());
        }
        let request = GrpcCallRequest {
            host: target.host.clone(),
            port: target.port_for(&target.scheme),
            plaintext: target.plaintext(),
            service: service.to_string(),
            method: method.to_string(),
            initial_metadata,
            message: message.to_vec(),
            timeout_ms,
        };
        let id = self.plugin.calls.next_id();
        let relay = GrpcEventRelay::new(id, self.plugin.plugin_ref.clone());
        match self.plugin.adaptor.schedule_grpc_call(request, Box::new(relay)) {
            Ok(cancel) => {
                self.plugin.calls.insert_grpc(id, cancel);
                Ok(id)
            }
            Err(ScheduleError::Unsupported) => Err(WasmError::unimplemented()),
            Err(ScheduleError::Failed(_)) => Err(WasmError::internal_failure()),
        }
    }

    fn grpc_cancel(&mut self, call_id: u32) -> WasmResult {
        match self.plugin.calls.remove_grpc(call_id) {
            Some(cancel) => {
                cancel();
                WasmResult::Ok
            }
            None => WasmResult::NotFound,
        }
    }

    fn grpc_close(&mut self, call_id: u32) -> WasmResult {
        // Unary calls have no half-close; treat it as a cancel.
        self.grpc_cancel(call_id)
    }

    fn define_metric(&mut self, metric_type: MetricType, name: &str) -> Result<u32, WasmError> {
        self.plugin.metrics.define_metric(metric_type, name)
    }

    fn remove_metric(&mut self, metric_id: u32) -> WasmResult {
        self.plugin.metrics.remove_metric(metric_id)
    }

    fn record_metric(&mut self, metric_id: u32, value: u64) -> WasmResult {
        self.plugin.metrics.record_metric(metric_id, value)
    }

    fn increment_metric(&mut self, metric_id: u32, offset: i64) -> WasmResult {
        self.plugin.metrics.increment_metric(metric_id, offset)
    }

    fn get_metric(&mut self, metric_id: u32) -> Result<u64, WasmError> {
        self.plugin.metrics.get_metric(metric_id)
    }

    fn get_shared_data(&mut self, key: &str) -> Result<SharedData, WasmError> {
        self.plugin.shared_data.get_shared_data(key)
    }

    fn set_shared_data(&mut self, key: &str, value: Option<&[u8]>, cas: u32) -> WasmResult {
        self.plugin.shared_data.set_shared_data(key, value, cas)
    }

    fn register_shared_queue(&mut self, name: &QueueName) -> Result<u32, WasmError> {
        self.plugin.shared_queues.register_shared_queue(name)
    }

    fn resolve_shared_queue(&mut self, name: &QueueName) -> Result<u32, WasmError> {
        self.plugin.shared_queues.resolve_shared_queue(name)
    }

    fn dequeue_shared_queue(&mut self, queue_id: u32) -> Result<Option<Vec<u8>>, WasmError> {
        self.plugin.shared_queues.dequeue_shared_queue(queue_id)
    }

    fn enqueue_shared_queue(&mut self, queue_id: u32, value: &[u8]) -> WasmResult {
        self.plugin.shared_queues.enqueue_shared_queue(queue_id, value)
    }

    fn foreign_function(&mut self, name: &str) -> Option<ForeignFunction> {
        self.plugin.foreign_functions.get(name).cloned()
    }
}
