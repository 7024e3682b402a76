//! One live guest instance: its store, its typed exports and the lifecycle
//! bookkeeping around them.
//!
//! All delivery into the guest funnels through [`PluginVm`]. Callers hold
//! the owning plugin's lock, so nothing here synchronizes; the methods just
//! refuel, point the active context at the right slot and invoke the export.

use wasmtime::Store;

use crate::abi::AbiExports;
use crate::constants::ROOT_CONTEXT_ID;
use crate::context::{ContextKind, ContextRegistry};
use crate::error::{StartError, WasmResult};
use crate::exchange::{ExchangeState, PauseGate, StreamState};
use crate::handler::Handler;
use crate::map::ProxyMap;
use crate::registry::LoadedPlugin;
use crate::scope::{CallScratch, Flow, PluginState, Scope};
use crate::types::{Action, LocalResponse};

/// Everything the host functions can reach through the store.
pub(crate) struct HostState {
    pub contexts: ContextRegistry,
    pub active_context: u32,
    pub plugin_context: u32,
    pub plugin: PluginState,
    pub scratch: CallScratch,
    pub wasi: wasmtime_wasi::p1::WasiP1Ctx,
}

impl HostState {
    /// Resolves the active context to a capability scope and runs `f`
    /// against it. An unknown active context falls back to the plugin
    /// scope, which covers host calls made during bootstrap.
    pub(crate) fn with_handler<R>(&mut self, f: impl FnOnce(&mut dyn Handler) -> R) -> R {
        let HostState {
            contexts,
            plugin,
            scratch,
            active_context,
            ..
        } = self;
        let flow = match contexts.get_mut(*active_context).map(|slot| &mut slot.kind) {
            Some(ContextKind::HttpExchange(exchange)) => Flow::Http(&mut **exchange),
            Some(ContextKind::NetworkStream(stream)) => Flow::Stream(&mut **stream),
            _ => Flow::Plugin,
        };
        let mut scope = Scope {
            plugin,
            scratch,
            flow,
        };
        f(&mut scope)
    }

    /// `proxy_set_effective_context`: the target must be a live context.
    pub(crate) fn set_effective_context(&mut self, context_id: u32) -> WasmResult {
        if self.contexts.contains(context_id) {
            self.active_context = context_id;
            WasmResult::Ok
        } else {
            WasmResult::BadArgument
        }
    }
}

pub(crate) struct PluginVm {
    store: Store<HostState>,
    abi: AbiExports,
    fuel: u64,
}

impl PluginVm {
    pub(crate) fn new(loaded: &LoadedPlugin, plugin: PluginState) -> Result<PluginVm, StartError> {
        let wasi = wasmtime_wasi::WasiCtxBuilder::new()
            .inherit_stdout()
            .inherit_stderr()
            .build_p1();
        let state = HostState {
            contexts: ContextRegistry::new(),
            active_context: 0,
            plugin_context: 0,
            plugin,
            scratch: CallScratch::default(),
            wasi,
        };
        let mut store = Store::new(loaded.engine(), state);
        store
            .set_fuel(loaded.fuel())
            .map_err(StartError::Instantiation)?;
        let instance = loaded
            .instance_pre()
            .instantiate(&mut store)
            .map_err(StartError::Instantiation)?;
        let abi = AbiExports::bind(&mut store, &instance).map_err(StartError::Instantiation)?;
        let mut vm = PluginVm {
            store,
            abi,
            fuel: loaded.fuel(),
        };
        vm.abi.bootstrap(&mut vm.store).map_err(StartError::Trap)?;
        Ok(vm)
    }

    pub(crate) fn state(&mut self) -> &mut HostState {
        self.store.data_mut()
    }

    /// Tops the fuel budget back up before entering the guest. Each entry
    /// gets the full budget; a guest that burns through it traps out of the
    /// current callback only.
    fn refuel(&mut self) -> anyhow::Result<()> {
        self.store.set_fuel(self.fuel)
    }

    fn activate(&mut self, context_id: u32) {
        self.store.data_mut().active_context = context_id;
    }

    /// Creates the plugin (root) context and walks the guest through
    /// vm-start and configure. Rejections fail the whole plugin.
    pub(crate) fn start(&mut self) -> Result<(), StartError> {
        self.refuel().map_err(StartError::Trap)?;
        let id = self.state().contexts.allocate(ContextKind::Plugin);
        self.state().plugin_context = id;
        self.activate(id);
        self.abi
            .on_context_create(&mut self.store, id, ROOT_CONTEXT_ID)
            .map_err(StartError::Trap)?;
        let vm_config_len = self.state().plugin.vm_config.len() as u32;
        if !self
            .abi
            .on_vm_start(&mut self.store, id, vm_config_len)
            .map_err(StartError::Trap)?
        {
            return Err(StartError::VmStartRejected);
        }
        let plugin_config_len = self.state().plugin.plugin_config.len() as u32;
        if !self
            .abi
            .on_configure(&mut self.store, id, plugin_config_len)
            .map_err(StartError::Trap)?
        {
            return Err(StartError::ConfigureRejected);
        }
        Ok(())
    }

    pub(crate) fn plugin_context(&mut self) -> u32 {
        self.state().plugin_context
    }

    // ---- context setup ------------------------------------------------------

    pub(crate) fn create_exchange(
        &mut self,
        adaptor: Box<dyn crate::adaptor::HttpRequestAdaptor>,
    ) -> anyhow::Result<u32> {
        self.refuel()?;
        let id = self
            .state()
            .contexts
            .allocate(ContextKind::HttpExchange(Box::new(ExchangeState::new(adaptor))));
        let parent = self.state().plugin_context;
        self.activate(id);
        self.abi.on_context_create(&mut self.store, id, parent)?;
        Ok(id)
    }

    pub(crate) fn create_stream(&mut self) -> anyhow::Result<u32> {
        self.refuel()?;
        let id = self
            .state()
            .contexts
            .allocate(ContextKind::NetworkStream(Box::new(StreamState::new())));
        let parent = self.state().plugin_context;
        self.activate(id);
        self.abi.on_context_create(&mut self.store, id, parent)?;
        Ok(id)
    }

    pub(crate) fn context_gate(&mut self, context_id: u32) -> Option<std::sync::Arc<PauseGate>> {
        match self.state().contexts.get_mut(context_id).map(|s| &mut s.kind) {
            Some(ContextKind::HttpExchange(exchange)) => Some(exchange.gate.clone()),
            Some(ContextKind::NetworkStream(stream)) => Some(stream.gate.clone()),
            _ => None,
        }
    }

    fn set_flow_action(&mut self, context_id: u32, action: Action) {
        match self.state().contexts.get_mut(context_id).map(|s| &mut s.kind) {
            Some(ContextKind::HttpExchange(exchange)) => exchange.action = action,
            Some(ContextKind::NetworkStream(stream)) => stream.action = action,
            _ => {}
        }
    }

    /// If the guest left the context paused (and produced no local
    /// response), arms the pause gate and hands it back so the caller can
    /// wait after releasing the plugin lock.
    pub(crate) fn pause_gate_if_needed(
        &mut self,
        context_id: u32,
    ) -> Option<std::sync::Arc<PauseGate>> {
        let slot = self.state().contexts.get_mut(context_id)?;
        match &mut slot.kind {
            ContextKind::HttpExchange(exchange) => {
                if exchange.action == Action::Pause && exchange.send_response.is_none() {
                    exchange.gate.arm();
                    Some(exchange.gate.clone())
                } else {
                    None
                }
            }
            ContextKind::NetworkStream(stream) => {
                if stream.action == Action::Pause {
                    stream.gate.arm();
                    Some(stream.gate.clone())
                } else {
                    None
                }
            }
            ContextKind::Plugin => None,
        }
    }

    pub(crate) fn consume_send_response(&mut self, context_id: u32) -> Option<LocalResponse> {
        self.state()
            .contexts
            .get_mut(context_id)
            .and_then(|slot| slot.exchange_mut())
            .and_then(|exchange| exchange.send_response.take())
    }

    pub(crate) fn with_exchange<R>(
        &mut self,
        context_id: u32,
        f: impl FnOnce(&mut ExchangeState) -> R,
    ) -> Option<R> {
        self.state()
            .contexts
            .get_mut(context_id)
            .and_then(|slot| slot.exchange_mut())
            .map(f)
    }

    pub(crate) fn with_stream<R>(
        &mut self,
        context_id: u32,
        f: impl FnOnce(&mut StreamState) -> R,
    ) -> Option<R> {
        self.state()
            .contexts
            .get_mut(context_id)
            .and_then(|slot| slot.stream_mut())
            .map(f)
    }

    // ---- HTTP exchange deliveries -------------------------------------------

    pub(crate) fn call_on_request_headers(
        &mut self,
        context_id: u32,
        end_of_stream: bool,
    ) -> anyhow::Result<Action> {
        self.refuel()?;
        self.activate(context_id);
        let num_headers = self
            .with_exchange(context_id, |e| {
                e.adaptor.request_headers().map(|m| m.len()).unwrap_or(0)
            })
            .unwrap_or(0);
        let action = self.abi.on_request_headers(
            &mut self.store,
            context_id,
            num_headers as u32,
            end_of_stream,
        )?;
        self.set_flow_action(context_id, action);
        Ok(action)
    }

    pub(crate) fn call_on_request_body(
        &mut self,
        context_id: u32,
        end_of_stream: bool,
    ) -> anyhow::Result<Action> {
        self.refuel()?;
        self.activate(context_id);
        let body_size = self
            .with_exchange(context_id, |e| e.request_body.len())
            .unwrap_or(0);
        let action = self.abi.on_request_body(
            &mut self.store,
            context_id,
            body_size as u32,
            end_of_stream,
        )?;
        self.set_flow_action(context_id, action);
        Ok(action)
    }

    pub(crate) fn call_on_request_trailers(&mut self, context_id: u32) -> anyhow::Result<Action> {
        self.refuel()?;
        self.activate(context_id);
        let num_trailers = self
            .with_exchange(context_id, |e| {
                e.adaptor.request_trailers().map(|m| m.len()).unwrap_or(0)
            })
            .unwrap_or(0);
        let action =
            self.abi
                .on_request_trailers(&mut self.store, context_id, num_trailers as u32)?;
        self.set_flow_action(context_id, action);
        Ok(action)
    }

    pub(crate) fn call_on_response_headers(
        &mut self,
        context_id: u32,
        end_of_stream: bool,
    ) -> anyhow::Result<Action> {
        self.refuel()?;
        self.activate(context_id);
        let num_headers = self
            .with_exchange(context_id, |e| {
                e.adaptor.response_headers().map(|m| m.len()).unwrap_or(0)
            })
            .unwrap_or(0);
        let action = self.abi.on_response_headers(
            &mut self.store,
            context_id,
            num_headers as u32,
            end_of_stream,
        )?;
        self.set_flow_action(context_id, action);
        Ok(action)
    }

    pub(crate) fn call_on_response_body(
        &mut self,
        context_id: u32,
        end_of_stream: bool,
    ) -> anyhow::Result<Action> {
        self.refuel()?;
        self.activate(context_id);
        let body_size = self
            .with_exchange(context_id, |e| e.response_body.len())
            .unwrap_or(0);
        let action = self.abi.on_response_body(
            &mut self.store,
            context_id,
            body_size as u32,
            end_of_stream,
        )?;
        self.set_flow_action(context_id, action);
        Ok(action)
    }

    pub(crate) fn call_on_response_trailers(&mut self, context_id: u32) -> anyhow::Result<Action> {
        self.refuel()?;
        self.activate(context_id);
        let num_trailers = self
            .with_exchange(context_id, |e| {
                e.adaptor.response_trailers().map(|m| m.len()).unwrap_or(0)
            })
            .unwrap_or(0);
        let action =
            self.abi
                .on_response_trailers(&mut self.store, context_id, num_trailers as u32)?;
        self.set_flow_action(context_id, action);
        Ok(action)
    }

    // ---- network stream deliveries ------------------------------------------

    pub(crate) fn call_on_new_connection(&mut self, context_id: u32) -> anyhow::Result<Action> {
        self.refuel()?;
        self.activate(context_id);
        let action = self.abi.on_new_connection(&mut self.store, context_id)?;
        self.set_flow_action(context_id, action);
        Ok(action)
    }

    pub(crate) fn call_on_downstream_data(
        &mut self,
        context_id: u32,
        end_of_stream: bool,
    ) -> anyhow::Result<Action> {
        self.refuel()?;
        self.activate(context_id);
        let data_size = self
            .with_stream(context_id, |s| {
                s.downstream_data.as_ref().map(|d| d.len()).unwrap_or(0)
            })
            .unwrap_or(0);
        let action = self.abi.on_downstream_data(
            &mut self.store,
            context_id,
            data_size as u32,
            end_of_stream,
        )?;
        self.set_flow_action(context_id, action);
        Ok(action)
    }

    pub(crate) fn call_on_upstream_data(
        &mut self,
        context_id: u32,
        end_of_stream: bool,
    ) -> anyhow::Result<Action> {
        self.refuel()?;
        self.activate(context_id);
        let data_size = self
            .with_stream(context_id, |s| {
                s.upstream_data.as_ref().map(|d| d.len()).unwrap_or(0)
            })
            .unwrap_or(0);
        let action = self.abi.on_upstream_data(
            &mut self.store,
            context_id,
            data_size as u32,
            end_of_stream,
        )?;
        self.set_flow_action(context_id, action);
        Ok(action)
    }

    pub(crate) fn call_on_downstream_connection_close(
        &mut self,
        context_id: u32,
        peer_type: u32,
    ) -> anyhow::Result<()> {
        self.refuel()?;
        self.activate(context_id);
        self.abi
            .on_downstream_connection_close(&mut self.store, context_id, peer_type)
    }

    pub(crate) fn call_on_upstream_connection_close(
        &mut self,
        context_id: u32,
        peer_type: u32,
    ) -> anyhow::Result<()> {
        self.refuel()?;
        self.activate(context_id);
        self.abi
            .on_upstream_connection_close(&mut self.store, context_id, peer_type)
    }

    // ---- plugin-context deliveries ------------------------------------------

    pub(crate) fn tick(&mut self) -> anyhow::Result<()> {
        self.refuel()?;
        let plugin_context = self.state().plugin_context;
        if plugin_context == 0 {
            return Ok(());
        }
        self.activate(plugin_context);
        self.abi.on_tick(&mut self.store, plugin_context)
    }

    pub(crate) fn deliver_http_call_response(
        &mut self,
        call_id: u32,
        headers: ProxyMap,
        body: Vec<u8>,
    ) -> anyhow::Result<()> {
        self.refuel()?;
        let plugin_context = self.state().plugin_context;
        self.activate(plugin_context);
        let num_headers = headers.len() as u32;
        let body_size = body.len() as u32;
        {
            let scratch = &mut self.state().scratch;
            scratch.call_headers = Some(headers);
            scratch.call_trailers = Some(ProxyMap::new());
            scratch.call_body = Some(body);
        }
        let result = self.abi.on_http_call_response(
            &mut self.store,
            plugin_context,
            call_id,
            num_headers,
            body_size,
            0,
        );
        self.state().scratch.clear();
        result
    }

    pub(crate) fn deliver_grpc_headers(
        &mut self,
        call_id: u32,
        metadata: ProxyMap,
    ) -> anyhow::Result<()> {
        self.refuel()?;
        let plugin_context = self.state().plugin_context;
        self.activate(plugin_context);
        let num_elements = metadata.len() as u32;
        self.state().scratch.grpc_initial = Some(metadata);
        let result = self.abi.on_grpc_receive_initial_metadata(
            &mut self.store,
            plugin_context,
            call_id,
            num_elements,
        );
        self.state().scratch.clear();
        result
    }

    pub(crate) fn deliver_grpc_message(
        &mut self,
        call_id: u32,
        message: Vec<u8>,
    ) -> anyhow::Result<()> {
        self.refuel()?;
        let plugin_context = self.state().plugin_context;
        self.activate(plugin_context);
        let message_size = message.len() as u32;
        self.state().scratch.grpc_message = Some(message);
        let result =
            self.abi
                .on_grpc_receive(&mut self.store, plugin_context, call_id, message_size);
        self.state().scratch.clear();
        result
    }

    pub(crate) fn deliver_grpc_trailers(
        &mut self,
        call_id: u32,
        trailers: ProxyMap,
    ) -> anyhow::Result<()> {
        self.refuel()?;
        let plugin_context = self.state().plugin_context;
        self.activate(plugin_context);
        let num_elements = trailers.len() as u32;
        self.state().scratch.grpc_trailing = Some(trailers);
        let result = self.abi.on_grpc_receive_trailing_metadata(
            &mut self.store,
            plugin_context,
            call_id,
            num_elements,
        );
        self.state().scratch.clear();
        result
    }

    pub(crate) fn deliver_grpc_close(&mut self, call_id: u32, status: i32) -> anyhow::Result<()> {
        self.refuel()?;
        let plugin_context = self.state().plugin_context;
        self.activate(plugin_context);
        self.abi
            .on_grpc_close(&mut self.store, plugin_context, call_id, status)
    }

    pub(crate) fn deliver_queue_ready(&mut self, queue_id: u32) -> anyhow::Result<()> {
        self.refuel()?;
        let plugin_context = self.state().plugin_context;
        if plugin_context == 0 {
            return Ok(());
        }
        self.activate(plugin_context);
        self.abi
            .on_queue_ready(&mut self.store, plugin_context, queue_id)
    }

    pub(crate) fn deliver_foreign_function(
        &mut self,
        function_id: u32,
        data: Vec<u8>,
    ) -> anyhow::Result<()> {
        self.refuel()?;
        let plugin_context = self.state().plugin_context;
        self.activate(plugin_context);
        let data_size = data.len() as u32;
        self.state().plugin.func_call_data = data;
        let result = self.abi.on_foreign_function(
            &mut self.store,
            plugin_context,
            function_id,
            data_size,
        );
        self.state().plugin.func_call_data.clear();
        result
    }

    // ---- context teardown ---------------------------------------------------

    /// First half of the close handshake. `proxy_on_done` returning false
    /// means the guest has async work outstanding; it finishes later by
    /// calling `proxy_done`.
    pub(crate) fn close_context(&mut self, context_id: u32) -> anyhow::Result<()> {
        let Some(slot) = self.state().contexts.get_mut(context_id) else {
            return Ok(());
        };
        if slot.close_started {
            return Ok(());
        }
        slot.close_started = true;
        self.refuel()?;
        self.activate(context_id);
        let done = self.abi.on_done(&mut self.store, context_id)?;
        if done {
            self.finish_close(context_id)?;
        }
        Ok(())
    }

    /// Second half: log, unregister, then delete. The active context is
    /// reset to the plugin context before `proxy_on_delete`, since the
    /// closed id is no longer valid.
    pub(crate) fn finish_close(&mut self, context_id: u32) -> anyhow::Result<()> {
        let Some(slot) = self.state().contexts.get_mut(context_id) else {
            return Ok(());
        };
        if slot.close_done {
            return Ok(());
        }
        slot.close_done = true;
        // Unregister even when on_log traps, so the slot never sticks
        // around half closed.
        let logged = self.abi.on_log(&mut self.store, context_id);
        let plugin_context = self.state().plugin_context;
        self.state().contexts.remove(context_id);
        if context_id == plugin_context {
            self.state().plugin_context = 0;
            self.state().active_context = 0;
        } else {
            self.activate(plugin_context);
        }
        logged?;
        self.abi.on_delete(&mut self.store, context_id)?;
        Ok(())
    }

    /// Tears the plugin context down. Flow contexts are expected to be
    /// closed already by their owners.
    pub(crate) fn close_plugin(&mut self) -> anyhow::Result<()> {
        let plugin_context = self.state().plugin_context;
        if plugin_context == 0 {
            return Ok(());
        }
        self.close_context(plugin_context)
    }
}
