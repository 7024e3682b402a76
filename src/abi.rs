//! Typed bindings for the guest's ABI exports.
//!
//! Every `proxy_on_*` callback is optional; a missing export answers with
//! the ABI's documented default instead of failing. The allocator and the
//! linear memory are the only hard requirements, since nothing can be
//! marshaled without them.

use anyhow::Context as _;
use wasmtime::{AsContextMut, Func, Instance, Memory, TypedFunc, Val, ValType};

use crate::types::Action;

#[derive(Clone)]
pub(crate) struct AbiExports {
    pub memory: Memory,
    pub malloc: TypedFunc<i32, i32>,
    initialize: Option<Func>,
    main: Option<Func>,
    start: Option<Func>,
    on_context_create: Option<TypedFunc<(i32, i32), ()>>,
    on_done: Option<TypedFunc<i32, i32>>,
    on_log: Option<TypedFunc<i32, ()>>,
    on_delete: Option<TypedFunc<i32, ()>>,
    on_vm_start: Option<TypedFunc<(i32, i32), i32>>,
    on_configure: Option<TypedFunc<(i32, i32), i32>>,
    validate_configuration: Option<TypedFunc<(i32, i32), i32>>,
    on_tick: Option<TypedFunc<i32, ()>>,
    on_new_connection: Option<TypedFunc<i32, i32>>,
    on_downstream_data: Option<TypedFunc<(i32, i32, i32), i32>>,
    on_downstream_connection_close: Option<TypedFunc<(i32, i32), ()>>,
    on_upstream_data: Option<TypedFunc<(i32, i32, i32), i32>>,
    on_upstream_connection_close: Option<TypedFunc<(i32, i32), ()>>,
    on_request_headers: Option<TypedFunc<(i32, i32, i32), i32>>,
    on_request_body: Option<TypedFunc<(i32, i32, i32), i32>>,
    on_request_trailers: Option<TypedFunc<(i32, i32), i32>>,
    on_response_headers: Option<TypedFunc<(i32, i32, i32), i32>>,
    on_response_body: Option<TypedFunc<(i32, i32, i32), i32>>,
    on_response_trailers: Option<TypedFunc<(i32, i32), i32>>,
    on_http_call_response: Option<TypedFunc<(i32, i32, i32, i32, i32), ()>>,
    on_grpc_receive_initial_metadata: Option<TypedFunc<(i32, i32, i32), ()>>,
    on_grpc_receive: Option<TypedFunc<(i32, i32, i32), ()>>,
    on_grpc_receive_trailing_metadata: Option<TypedFunc<(i32, i32, i32), ()>>,
    on_grpc_close: Option<TypedFunc<(i32, i32, i32), ()>>,
    on_queue_ready: Option<TypedFunc<(i32, i32), ()>>,
    on_foreign_function: Option<TypedFunc<(i32, i32, i32), ()>>,
}

fn typed<P, R>(store: &mut impl AsContextMut, instance: &Instance, name: &str) -> Option<TypedFunc<P, R>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    instance.get_typed_func::<P, R>(&mut *store, name).ok()
}

impl AbiExports {
    pub(crate) fn bind(mut store: impl AsContextMut, instance: &Instance) -> anyhow::Result<Self> {
        let mut store = &mut store;
        let memory = instance
            .get_memory(&mut store, "memory")
            .context("module does not export its linear memory")?;

        // Since 0.2.x, proxy_on_memory_allocate is the allocator; malloc is
        // the pre-0.2 name.
        let malloc = typed(&mut store, instance, "proxy_on_memory_allocate")
            .or_else(|| typed(&mut store, instance, "malloc"))
            .context("module exports no allocator")?;

        Ok(Self {
            memory,
            malloc,
            initialize: instance.get_func(&mut store, "_initialize"),
            main: instance.get_func(&mut store, "main"),
            start: instance.get_func(&mut store, "_start"),
            on_context_create: typed(&mut store, instance, "proxy_on_context_create"),
            on_done: typed(&mut store, instance, "proxy_on_done"),
            on_log: typed(&mut store, instance, "proxy_on_log"),
            on_delete: typed(&mut store, instance, "proxy_on_delete"),
            on_vm_start: typed(&mut store, instance, "proxy_on_vm_start"),
            on_configure: typed(&mut store, instance, "proxy_on_configure"),
            validate_configuration: typed(&mut store, instance, "proxy_validate_configuration"),
            on_tick: typed(&mut store, instance, "proxy_on_tick"),
            on_new_connection: typed(&mut store, instance, "proxy_on_new_connection"),
            on_downstream_data: typed(&mut store, instance, "proxy_on_downstream_data"),
            on_downstream_connection_close: typed(
                &mut store,
                instance,
                "proxy_on_downstream_connection_close",
            ),
            on_upstream_data: typed(&mut store, instance, "proxy_on_upstream_data"),
            on_upstream_connection_close: typed(
                &mut store,
                instance,
                "proxy_on_upstream_connection_close",
            ),
            on_request_headers: typed(&mut store, instance, "proxy_on_request_headers"),
            on_request_body: typed(&mut store, instance, "proxy_on_request_body"),
            on_request_trailers: typed(&mut store, instance, "proxy_on_request_trailers"),
            on_response_headers: typed(&mut store, instance, "proxy_on_response_headers"),
            on_response_body: typed(&mut store, instance, "proxy_on_response_body"),
            on_response_trailers: typed(&mut store, instance, "proxy_on_response_trailers"),
            on_http_call_response: typed(&mut store, instance, "proxy_on_http_call_response"),
            on_grpc_receive_initial_metadata: typed(
                &mut store,
                instance,
                "proxy_on_grpc_receive_initial_metadata",
            ),
            on_grpc_receive: typed(&mut store, instance, "proxy_on_grpc_receive"),
            on_grpc_receive_trailing_metadata: typed(
                &mut store,
                instance,
                "proxy_on_grpc_receive_trailing_metadata",
            ),
            on_grpc_close: typed(&mut store, instance, "proxy_on_grpc_close"),
            on_queue_ready: typed(&mut store, instance, "proxy_on_queue_ready"),
            on_foreign_function: typed(&mut store, instance, "proxy_on_foreign_function"),
        })
    }

    /// Runs the module's bootstrap exports: a reactor's `_initialize` (then
    /// `main(0, 0)` when present), otherwise a command's `_start`.
    pub(crate) fn bootstrap(&self, mut store: impl AsContextMut) -> anyhow::Result<()> {
        if let Some(init) = self.initialize {
            call_untyped(&mut store, &init)?;
            if let Some(main) = self.main {
                call_untyped(&mut store, &main)?;
            }
        } else if let Some(start) = self.start {
            call_untyped(&mut store, &start)?;
        }
        Ok(())
    }

    pub(crate) fn on_context_create(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        parent_id: u32,
    ) -> anyhow::Result<()> {
        if let Some(f) = &self.on_context_create {
            f.call(&mut store, (context_id as i32, parent_id as i32))?;
        }
        Ok(())
    }

    pub(crate) fn on_done(&self, mut store: impl AsContextMut, context_id: u32) -> anyhow::Result<bool> {
        match &self.on_done {
            Some(f) => Ok(f.call(&mut store, context_id as i32)? != 0),
            None => Ok(true),
        }
    }

    pub(crate) fn on_log(&self, mut store: impl AsContextMut, context_id: u32) -> anyhow::Result<()> {
        if let Some(f) = &self.on_log {
            f.call(&mut store, context_id as i32)?;
        }
        Ok(())
    }

    pub(crate) fn on_delete(&self, mut store: impl AsContextMut, context_id: u32) -> anyhow::Result<()> {
        if let Some(f) = &self.on_delete {
            f.call(&mut store, context_id as i32)?;
        }
        Ok(())
    }

    pub(crate) fn on_vm_start(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        vm_config_size: u32,
    ) -> anyhow::Result<bool> {
        match &self.on_vm_start {
            Some(f) => Ok(f.call(&mut store, (context_id as i32, vm_config_size as i32))? != 0),
            None => Ok(true),
        }
    }

    pub(crate) fn on_configure(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        config_size: u32,
    ) -> anyhow::Result<bool> {
        match &self.on_configure {
            Some(f) => Ok(f.call(&mut store, (context_id as i32, config_size as i32))? != 0),
            None => Ok(true),
        }
    }

    pub(crate) fn validate_configuration(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        config_size: u32,
    ) -> anyhow::Result<bool> {
        match &self.validate_configuration {
            Some(f) => Ok(f.call(&mut store, (context_id as i32, config_size as i32))? != 0),
            None => Ok(true),
        }
    }

    pub(crate) fn on_tick(&self, mut store: impl AsContextMut, context_id: u32) -> anyhow::Result<()> {
        if let Some(f) = &self.on_tick {
            f.call(&mut store, context_id as i32)?;
        }
        Ok(())
    }

    pub(crate) fn on_new_connection(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
    ) -> anyhow::Result<Action> {
        match &self.on_new_connection {
            Some(f) => Ok(Action::from_i32(f.call(&mut store, context_id as i32)?)),
            None => Ok(Action::Continue),
        }
    }

    pub(crate) fn on_downstream_data(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        data_size: u32,
        end_of_stream: bool,
    ) -> anyhow::Result<Action> {
        match &self.on_downstream_data {
            Some(f) => Ok(Action::from_i32(f.call(
                &mut store,
                (context_id as i32, data_size as i32, end_of_stream as i32),
            )?)),
            None => Ok(Action::Continue),
        }
    }

    pub(crate) fn on_downstream_connection_close(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        peer_type: u32,
    ) -> anyhow::Result<()> {
        if let Some(f) = &self.on_downstream_connection_close {
            f.call(&mut store, (context_id as i32, peer_type as i32))?;
        }
        Ok(())
    }

    pub(crate) fn on_upstream_data(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        data_size: u32,
        end_of_stream: bool,
    ) -> anyhow::Result<Action> {
        match &self.on_upstream_data {
            Some(f) => Ok(Action::from_i32(f.call(
                &mut store,
                (context_id as i32, data_size as i32, end_of_stream as i32),
            )?)),
            None => Ok(Action::Continue),
        }
    }

    pub(crate) fn on_upstream_connection_close(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        peer_type: u32,
    ) -> anyhow::Result<()> {
        if let Some(f) = &self.on_upstream_connection_close {
            f.call(&mut store, (context_id as i32, peer_type as i32))?;
        }
        Ok(())
    }

    pub(crate) fn on_request_headers(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        num_headers: u32,
        end_of_stream: bool,
    ) -> anyhow::Result<Action> {
        match &self.on_request_headers {
            Some(f) => Ok(Action::from_i32(f.call(
                &mut store,
                (context_id as i32, num_headers as i32, end_of_stream as i32),
            )?)),
            None => Ok(Action::Continue),
        }
    }

    pub(crate) fn on_request_body(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        body_size: u32,
        end_of_stream: bool,
    ) -> anyhow::Result<Action> {
        match &self.on_request_body {
            Some(f) => Ok(Action::from_i32(f.call(
                &mut store,
                (context_id as i32, body_size as i32, end_of_stream as i32),
            )?)),
            None => Ok(Action::Continue),
        }
    }

    pub(crate) fn on_request_trailers(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        num_trailers: u32,
    ) -> anyhow::Result<Action> {
        match &self.on_request_trailers {
            Some(f) => Ok(Action::from_i32(
                f.call(&mut store, (context_id as i32, num_trailers as i32))?,
            )),
            None => Ok(Action::Continue),
        }
    }

    pub(crate) fn on_response_headers(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        num_headers: u32,
        end_of_stream: bool,
    ) -> anyhow::Result<Action> {
        match &self.on_response_headers {
            Some(f) => Ok(Action::from_i32(f.call(
                &mut store,
                (context_id as i32, num_headers as i32, end_of_stream as i32),
            )?)),
            None => Ok(Action::Continue),
        }
    }

    pub(crate) fn on_response_body(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        body_size: u32,
        end_of_stream: bool,
    ) -> anyhow::Result<Action> {
        match &self.on_response_body {
            Some(f) => Ok(Action::from_i32(f.call(
                &mut store,
                (context_id as i32, body_size as i32, end_of_stream as i32),
            )?)),
            None => Ok(Action::Continue),
        }
    }

    pub(crate) fn on_response_trailers(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        num_trailers: u32,
    ) -> anyhow::Result<Action> {
        match &self.on_response_trailers {
            Some(f) => Ok(Action::from_i32(
                f.call(&mut store, (context_id as i32, num_trailers as i32))?,
            )),
            None => Ok(Action::Continue),
        }
    }

    pub(crate) fn on_http_call_response(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        call_id: u32,
        num_headers: u32,
        body_size: u32,
        num_trailers: u32,
    ) -> anyhow::Result<()> {
        if let Some(f) = &self.on_http_call_response {
            f.call(
                &mut store,
                (
                    context_id as i32,
                    call_id as i32,
                    num_headers as i32,
                    body_size as i32,
                    num_trailers as i32,
                ),
            )?;
        }
        Ok(())
    }

    pub(crate) fn on_grpc_receive_initial_metadata(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        call_id: u32,
        num_elements: u32,
    ) -> anyhow::Result<()> {
        if let Some(f) = &self.on_grpc_receive_initial_metadata {
            f.call(
                &mut store,
                (context_id as i32, call_id as i32, num_elements as i32),
            )?;
        }
        Ok(())
    }

    pub(crate) fn on_grpc_receive(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        call_id: u32,
        message_size: u32,
    ) -> anyhow::Result<()> {
        if let Some(f) = &self.on_grpc_receive {
            f.call(
                &mut store,
                (context_id as i32, call_id as i32, message_size as i32),
            )?;
        }
        Ok(())
    }

    pub(crate) fn on_grpc_receive_trailing_metadata(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        call_id: u32,
        num_elements: u32,
    ) -> anyhow::Result<()> {
        if let Some(f) = &self.on_grpc_receive_trailing_metadata {
            f.call(
                &mut store,
                (context_id as i32, call_id as i32, num_elements as i32),
            )?;
        }
        Ok(())
    }

    pub(crate) fn on_grpc_close(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        call_id: u32,
        status: i32,
    ) -> anyhow::Result<()> {
        if let Some(f) = &self.on_grpc_close {
            f.call(&mut store, (context_id as i32, call_id as i32, status))?;
        }
        Ok(())
    }

    pub(crate) fn on_queue_ready(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        queue_id: u32,
    ) -> anyhow::Result<()> {
        if let Some(f) = &self.on_queue_ready {
            f.call(&mut store, (context_id as i32, queue_id as i32))?;
        }
        Ok(())
    }

    pub(crate) fn on_foreign_function(
        &self,
        mut store: impl AsContextMut,
        context_id: u32,
        function_id: u32,
        data_size: u32,
    ) -> anyhow::Result<()> {
        if let Some(f) = &self.on_foreign_function {
            f.call(
                &mut store,
                (context_id as i32, function_id as i32, data_size as i32),
            )?;
        }
        Ok(())
    }
}

/// Calls a bootstrap export whose exact signature varies between toolchains,
/// passing zeroes for any parameters and discarding results.
fn call_untyped(mut store: impl AsContextMut, func: &Func) -> anyhow::Result<()> {
    let ty = func.ty(store.as_context_mut());
    let params = ty
        .params()
        .map(|t| match t {
            ValType::I32 => Ok(Val::I32(0)),
            ValType::I64 => Ok(Val::I64(0)),
            ValType::F32 => Ok(Val::F32(0)),
            ValType::F64 => Ok(Val::F64(0)),
            other => anyhow::bail!("unsupported bootstrap parameter type {other}"),
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    let mut results = vec![Val::I32(0); ty.results().len()];
    func.call(&mut store, &params, &mut results)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmtime::{Engine, Instance, Module, Store};

    const MINIMAL: &str = r#"
        (module
          (memory (export "memory") 1)
          (global $started (mut i32) (i32.const 0))
          (func (export "proxy_on_memory_allocate") (param i32) (result i32)
            i32.const 1024)
          (func (export "_start")
            i32.const 1
            global.set $started)
          (func (export "started") (result i32)
            global.get $started))
    "#;

    fn bind(wat: &str) -> (Store<()>, Instance, AbiExports) {
        let engine = Engine::default();
        let module = Module::new(&engine, wat).unwrap();
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, &module, &[]).unwrap();
        let exports = AbiExports::bind(&mut store, &instance).unwrap();
        (store, instance, exports)
    }

    #[test]
    fn missing_callbacks_answer_defaults() {
        let (mut store, _, exports) = bind(MINIMAL);
        assert!(exports.on_done(&mut store, 1).unwrap());
        assert!(exports.on_vm_start(&mut store, 1, 0).unwrap());
        assert!(exports.validate_configuration(&mut store, 1, 0).unwrap());
        assert_eq!(
            exports.on_request_headers(&mut store, 2, 0, true).unwrap(),
            Action::Continue
        );
        exports.on_log(&mut store, 1).unwrap();
        exports.on_tick(&mut store, 1).unwrap();
    }

    #[test]
    fn bootstrap_runs_start_for_command_modules() {
        let (mut store, instance, exports) = bind(MINIMAL);
        exports.bootstrap(&mut store).unwrap();
        let started = instance
            .get_typed_func::<(), i32>(&mut store, "started")
            .unwrap()
            .call(&mut store, ())
            .unwrap();
        assert_eq!(started, 1);
    }

    #[test]
    fn bootstrap_prefers_initialize_and_main() {
        let wat = r#"
            (module
              (memory (export "memory") 1)
              (global $mode (mut i32) (i32.const 0))
              (func (export "proxy_on_memory_allocate") (param i32) (result i32)
                i32.const 1024)
              (func (export "_initialize")
                i32.const 10
                global.set $mode)
              (func (export "main") (param i32 i32) (result i32)
                global.get $mode
                i32.const 1
                i32.add
                global.set $mode
                i32.const 0)
              (func (export "_start")
                i32.const 99
                global.set $mode)
              (func (export "mode") (result i32)
                global.get $mode))
        "#;
        let (mut store, instance, exports) = bind(wat);
        exports.bootstrap(&mut store).unwrap();
        let mode = instance
            .get_typed_func::<(), i32>(&mut store, "mode")
            .unwrap()
            .call(&mut store, ())
            .unwrap();
        // _initialize then main, never _start.
        assert_eq!(mode, 11);
    }

    #[test]
    fn allocator_is_required() {
        let engine = Engine::default();
        let module = Module::new(&engine, r#"(module (memory (export "memory") 1))"#).unwrap();
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, &module, &[]).unwrap();
        assert!(AbiExports::bind(&mut store, &instance).is_err());
    }
}
