//! Loading and caching of guest modules.
//!
//! Modules compile once into an [`InstancePre`]; instantiation per plugin
//! (or per request, for non-shared plugins) is then just memory setup. The
//! engine runs the pooling allocator sized from configuration and meters
//! execution with fuel.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use wasmtime::{Engine, InstancePre, Linker, Module, PoolingAllocationConfig};

use crate::adaptor::ServerAdaptor;
use crate::dispatch::Upstream;
use crate::host;
use crate::instance::HostState;
use crate::plugin::{Plugin, PluginHandlers};
use crate::pool::Pool;
use crate::simple::FtlogLogHandler;
use crate::types::{PluginConfig, PoolingConfig, WasmConfig, WasmDefaults};

/// Roughly 1M instructions per millisecond of budget.
const FUEL_PER_MS: u64 = 1_000_000;

pub fn create_engine(pooling: &PoolingConfig) -> anyhow::Result<Engine> {
    let mut config = wasmtime::Config::new();
    config.cranelift_opt_level(wasmtime::OptLevel::Speed);
    config.consume_fuel(true);

    let mut pooling_config = PoolingAllocationConfig::default();
    pooling_config.total_memories(pooling.total_memories);
    pooling_config.total_tables(pooling.total_tables);
    pooling_config.max_memory_size(pooling.max_memory_size);
    config.allocation_strategy(wasmtime::InstanceAllocationStrategy::Pooling(pooling_config));

    match Engine::new(&config) {
        Ok(engine) => Ok(engine),
        Err(e) => {
            // Pooling needs virtual-memory headroom some hosts lack.
            ftlog::warn!("pooling allocator unavailable ({}), using on-demand", e);
            let mut config = wasmtime::Config::new();
            config.cranelift_opt_level(wasmtime::OptLevel::Speed);
            config.consume_fuel(true);
            Engine::new(&config)
        }
    }
}

/// A compiled module plus everything needed to instantiate plugins from it.
pub struct LoadedPlugin {
    name: String,
    engine: Engine,
    instance_pre: InstancePre<HostState>,
    fuel: u64,
    min_tick_period_ms: u32,
    shared: bool,
    strict_upstreams: bool,
    upstreams: HashMap<String, Upstream>,
    vm_config: Vec<u8>,
    plugin_config: Vec<u8>,
}

impl LoadedPlugin {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shared(&self) -> bool {
        self.shared
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn instance_pre(&self) -> &InstancePre<HostState> {
        &self.instance_pre
    }

    pub(crate) fn fuel(&self) -> u64 {
        self.fuel
    }

    pub(crate) fn min_tick_period_ms(&self) -> u32 {
        self.min_tick_period_ms
    }

    pub(crate) fn strict_upstreams(&self) -> bool {
        self.strict_upstreams
    }

    pub(crate) fn upstreams(&self) -> &HashMap<String, Upstream> {
        &self.upstreams
    }

    pub(crate) fn vm_config(&self) -> &[u8] {
        &self.vm_config
    }

    pub(crate) fn plugin_config(&self) -> &[u8] {
        &self.plugin_config
    }
}

/// Compiles (or deserializes) the module and links the host surface.
pub fn load_plugin(
    engine: &Engine,
    config: &PluginConfig,
    defaults: &WasmDefaults,
) -> anyhow::Result<LoadedPlugin> {
    ftlog::info!("loading wasm plugin: {}", config.name);

    let path: &Path = &config.file;
    if !path.exists() {
        anyhow::bail!("plugin file not found: {}", path.display());
    }

    let module = if path.extension().map(|e| e == "cwasm").unwrap_or(false) {
        // Precompiled artifact; trusted input by definition.
        unsafe { Module::deserialize_file(engine, path)? }
    } else {
        Module::from_file(engine, path)?
    };

    let mut linker: Linker<HostState> = Linker::new(engine);
    host::add_host_functions(&mut linker)?;
    wasmtime_wasi::p1::add_to_linker_sync(&mut linker, |state: &mut HostState| &mut state.wasi)?;
    let instance_pre = linker.instantiate_pre(&module)?;

    let mut upstreams = HashMap::new();
    for (name, uri) in &config.upstreams {
        let upstream = Upstream::parse(uri)
            .ok_or_else(|| anyhow::anyhow!("plugin {}: bad upstream uri: {}", config.name, uri))?;
        upstreams.insert(name.clone(), upstream);
    }

    let max_execution_time_ms = config
        .max_execution_time_ms
        .unwrap_or(defaults.max_execution_time_ms);

    Ok(LoadedPlugin {
        name: config.name.clone(),
        engine: engine.clone(),
        instance_pre,
        fuel: max_execution_time_ms * FUEL_PER_MS,
        min_tick_period_ms: config
            .min_tick_period_ms
            .unwrap_or(defaults.min_tick_period_ms),
        shared: config.shared,
        strict_upstreams: config.strict_upstreams,
        upstreams,
        vm_config: config
            .vm_config
            .as_deref()
            .map(|s| s.as_bytes().to_vec())
            .unwrap_or_default(),
        plugin_config: config
            .plugin_config
            .as_deref()
            .map(|s| s.as_bytes().to_vec())
            .unwrap_or_default(),
    })
}

/// All configured plugins, each behind the pool its sharing mode demands.
pub struct PluginRegistry {
    engine: Engine,
    pools: HashMap<String, Pool>,
}

impl PluginRegistry {
    pub fn new(config: &WasmConfig, adaptor: Arc<dyn ServerAdaptor>) -> anyhow::Result<Self> {
        config.validate()?;
        let engine = create_engine(&config.pooling)?;
        let mut pools = HashMap::new();
        for plugin_config in &config.plugins {
            let loaded = Arc::new(load_plugin(&engine, plugin_config, &config.defaults)?);
            let handlers = PluginHandlers {
                log: Arc::new(FtlogLogHandler::new(&plugin_config.name)),
                ..PluginHandlers::default()
            };
            let adaptor = adaptor.clone();
            let factory = Box::new(move || {
                Plugin::new(&loaded, handlers.clone(), adaptor.clone())
            });
            let pool = if plugin_config.shared {
                Pool::shared(factory)
            } else {
                Pool::per_request(factory)
            };
            pools.insert(plugin_config.name.clone(), pool);
        }
        Ok(Self { engine, pools })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn pool(&self, name: &str) -> Option<&Pool> {
        self.pools.get(name)
    }

    pub fn plugin_names(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    /// Closes every pooled instance. Called on server shutdown.
    pub fn close(&self) {
        for pool in self.pools.values() {
            pool.close();
        }
    }
}
