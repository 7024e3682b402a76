//! A running plugin: one guest instance behind one execution lock.
//!
//! Everything that enters the guest (filter callbacks, ticks, call
//! completions, queue notifications) first takes the lock, so guest code
//! never runs concurrently with itself. Completion callbacks capture a
//! `Weak` back-reference; a plugin that was dropped while a call was in
//! flight simply never hears about the result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::adaptor::{GrpcCallResponseHandler, HttpRequestAdaptor, ServerAdaptor};
use crate::dispatch::PendingCalls;
use crate::error::StartError;
use crate::exchange::{HttpExchange, NetworkStream};
use crate::handler::{
    ForeignFunction, LogHandler, MetricsHandler, NopLogHandler, QueueReadyListener,
    SharedDataHandler, SharedQueueHandler,
};
use crate::instance::PluginVm;
use crate::map::ProxyMap;
use crate::registry::LoadedPlugin;
use crate::scope::PluginState;
use crate::simple::{SimpleMetricsHandler, SimpleSharedDataHandler, SimpleSharedQueueHandler};

/// Backends a plugin talks to. Clone-cheap; all fields are shared handles,
/// so several plugins can point at the same backends.
#[derive(Clone)]
pub struct PluginHandlers {
    pub log: Arc<dyn LogHandler>,
    pub metrics: Arc<dyn MetricsHandler>,
    pub shared_data: Arc<dyn SharedDataHandler>,
    pub shared_queues: Arc<dyn SharedQueueHandler>,
    pub foreign_functions: HashMap<String, ForeignFunction>,
    /// Properties visible to the guest from the first callback on, e.g. a
    /// `vm_id` override for shared queues.
    pub properties: HashMap<Vec<String>, Vec<u8>>,
}

impl Default for PluginHandlers {
    fn default() -> Self {
        Self {
            log: Arc::new(NopLogHandler),
            metrics: Arc::new(SimpleMetricsHandler::new()),
            shared_data: Arc::new(SimpleSharedDataHandler::new()),
            shared_queues: Arc::new(SimpleSharedQueueHandler::new()),
            foreign_functions: HashMap::new(),
            properties: HashMap::new(),
        }
    }
}

pub(crate) struct PluginCore {
    name: String,
    vm: Mutex<PluginVm>,
}

impl PluginCore {
    pub(crate) fn lock(&self) -> MutexGuard<'_, PluginVm> {
        self.vm.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn deliver_tick(&self) {
        let mut vm = self.lock();
        if let Err(e) = vm.tick() {
            ftlog::error!("[wasm:{}] tick failed: {}", self.name, e);
        }
    }

    /// HTTP call completion. A call that was cancelled (or already
    /// completed) is no longer in the pending table and gets dropped here.
    pub(crate) fn complete_http_call(
        &self,
        call_id: u32,
        status: u32,
        mut headers: ProxyMap,
        body: Vec<u8>,
    ) {
        let mut vm = self.lock();
        if vm.state().plugin.calls.remove_http(call_id).is_none() {
            return;
        }
        if !headers.contains(":status") {
            headers.add(":status", &status.to_string());
        }
        if let Err(e) = vm.deliver_http_call_response(call_id, headers, body) {
            ftlog::error!("[wasm:{}] http call response failed: {}", self.name, e);
        }
    }

    pub(crate) fn complete_grpc_headers(&self, call_id: u32, metadata: ProxyMap) {
        let mut vm = self.lock();
        if !vm.state().plugin.calls.contains_grpc(call_id) {
            return;
        }
        if let Err(e) = vm.deliver_grpc_headers(call_id, metadata) {
            ftlog::error!("[wasm:{}] grpc headers failed: {}", self.name, e);
        }
    }

    pub(crate) fn complete_grpc_message(&self, call_id: u32, message: Vec<u8>) {
        let mut vm = self.lock();
        if !vm.state().plugin.calls.contains_grpc(call_id) {
            return;
        }
        if let Err(e) = vm.deliver_grpc_message(call_id, message) {
            ftlog::error!("[wasm:{}] grpc message failed: {}", self.name, e);
        }
    }

    pub(crate) fn complete_grpc_trailers(&self, call_id: u32, trailers: ProxyMap) {
        let mut vm = self.lock();
        if !vm.state().plugin.calls.contains_grpc(call_id) {
            return;
        }
        if let Err(e) = vm.deliver_grpc_trailers(call_id, trailers) {
            ftlog::error!("[wasm:{}] grpc trailers failed: {}", self.name, e);
        }
    }

    /// Close retires the call id before entering the guest, so a
    /// `proxy_grpc_cancel` from inside the callback is a clean NotFound.
    pub(crate) fn complete_grpc_close(&self, call_id: u32, grpc_status: i32) {
        let mut vm = self.lock();
        if vm.state().plugin.calls.remove_grpc(call_id).is_none() {
            return;
        }
        if let Err(e) = vm.deliver_grpc_close(call_id, grpc_status) {
            ftlog::error!("[wasm:{}] grpc close failed: {}", self.name, e);
        }
    }

    pub(crate) fn deliver_queue_ready(&self, queue_id: u32) {
        let mut vm = self.lock();
        if let Err(e) = vm.deliver_queue_ready(queue_id) {
            ftlog::error!("[wasm:{}] queue notification failed: {}", self.name, e);
        }
    }
}

/// Relays gRPC transport events into the owning plugin under its lock.
pub(crate) struct GrpcEventRelay {
    call_id: u32,
    core: Weak<PluginCore>,
}

impl GrpcEventRelay {
    pub(crate) fn new(call_id: u32, core: Weak<PluginCore>) -> Self {
        Self { call_id, core }
    }
}

impl GrpcCallResponseHandler for GrpcEventRelay {
    fn on_headers(&self, metadata: ProxyMap) {
        if let Some(core) = self.core.upgrade() {
            core.complete_grpc_headers(self.call_id, metadata);
        }
    }

    fn on_message(&self, data: Vec<u8>) {
        if let Some(core) = self.core.upgrade() {
            core.complete_grpc_message(self.call_id, data);
        }
    }

    fn on_trailers(&self, trailers: ProxyMap) {
        if let Some(core) = self.core.upgrade() {
            core.complete_grpc_trailers(self.call_id, trailers);
        }
    }

    fn on_close(&self, status: i32) {
        if let Some(core) = self.core.upgrade() {
            core.complete_grpc_close(self.call_id, status);
        }
    }
}

/// Handle to a started plugin instance. Clones share the instance.
#[derive(Clone)]
pub struct Plugin {
    core: Arc<PluginCore>,
}

impl Plugin {
    /// Instantiates, bootstraps and starts the guest. Any rejection or trap
    /// during startup fails construction; a plugin that exists is a plugin
    /// that configured successfully.
    pub fn new(
        loaded: &LoadedPlugin,
        handlers: PluginHandlers,
        adaptor: Arc<dyn ServerAdaptor>,
    ) -> Result<Plugin, StartError> {
        let shared_queues = handlers.shared_queues.clone();
        let state = PluginState {
            name: loaded.name().to_string(),
            vm_config: loaded.vm_config().to_vec(),
            plugin_config: loaded.plugin_config().to_vec(),
            properties: handlers.properties,
            func_call_data: Vec::new(),
            strict_upstreams: loaded.strict_upstreams(),
            upstreams: loaded.upstreams().clone(),
            min_tick_period_ms: loaded.min_tick_period_ms(),
            tick_period_ms: 0,
            cancel_tick: None,
            calls: PendingCalls::new(),
            log: handlers.log,
            metrics: handlers.metrics,
            shared_data: handlers.shared_data,
            shared_queues: handlers.shared_queues,
            foreign_functions: handlers.foreign_functions,
            adaptor,
            plugin_ref: Weak::new(),
        };
        let vm = PluginVm::new(loaded, state)?;
        let core = Arc::new(PluginCore {
            name: loaded.name().to_string(),
            vm: Mutex::new(vm),
        });
        core.lock().state().plugin.plugin_ref = Arc::downgrade(&core);

        // Queue notifications arrive from arbitrary threads, possibly while
        // this plugin holds its own lock (a guest enqueueing to a queue it
        // listens on). Deliver from a fresh thread to keep enqueue
        // non-reentrant.
        let weak = Arc::downgrade(&core);
        let listener: QueueReadyListener = Arc::new(move |queue_id| {
            let weak = weak.clone();
            std::thread::spawn(move || {
                if let Some(core) = weak.upgrade() {
                    core.deliver_queue_ready(queue_id);
                }
            });
        });
        shared_queues.add_queue_ready_listener(listener);

        core.lock().start()?;
        Ok(Plugin { core })
    }

    pub fn name(&self) -> String {
        self.core.name.clone()
    }

    /// Seeds a plugin-scoped property, e.g. `vm_id` for shared queues.
    pub fn set_property(&self, path: &[&str], value: &[u8]) {
        let path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        self.core
            .lock()
            .state()
            .plugin
            .properties
            .insert(path, value.to_vec());
    }

    /// Opens an HTTP exchange context for one request/response pair.
    pub fn create_exchange(
        &self,
        adaptor: Box<dyn HttpRequestAdaptor>,
    ) -> anyhow::Result<HttpExchange> {
        let mut vm = self.core.lock();
        let id = vm.create_exchange(adaptor)?;
        let gate = vm
            .context_gate(id)
            .ok_or_else(|| anyhow::anyhow!("exchange context {} vanished", id))?;
        drop(vm);
        Ok(HttpExchange::new(self.core.clone(), id, gate))
    }

    /// Opens a network (TCP stream) context.
    pub fn create_stream(&self) -> anyhow::Result<NetworkStream> {
        let mut vm = self.core.lock();
        let id = vm.create_stream()?;
        let gate = vm
            .context_gate(id)
            .ok_or_else(|| anyhow::anyhow!("stream context {} vanished", id))?;
        drop(vm);
        Ok(NetworkStream::new(self.core.clone(), id, gate))
    }

    /// Invokes a guest-registered foreign-function callback.
    pub fn call_foreign_callback(&self, function_id: u32, data: Vec<u8>) -> anyhow::Result<()> {
        self.core.lock().deliver_foreign_function(function_id, data)
    }

    /// Stops ticks, cancels outstanding calls and closes the plugin
    /// context. Safe to call more than once.
    pub fn close(&self) {
        let mut vm = self.core.lock();
        if let Some(cancel) = vm.state().plugin.cancel_tick.take() {
            cancel();
        }
        vm.state().plugin.tick_period_ms = 0;
        vm.state().plugin.calls.cancel_all();
        if let Err(e) = vm.close_plugin() {
            ftlog::error!("[wasm:{}] close failed: {}", self.core.name, e);
        }
    }

    pub(crate) fn core(&self) -> &Arc<PluginCore> {
        &self.core
    }
}
