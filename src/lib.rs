//! Host-side Proxy-Wasm runtime on wasmtime.
//!
//! Loads Proxy-Wasm guest modules (ABI v0.2.x), drives their lifecycle and
//! exposes the full `proxy_*` host-call surface: header maps, buffers,
//! properties, timers, outbound HTTP/gRPC calls, shared data, shared queues,
//! metrics and foreign functions.
//!
//! # Features
//! - AOT `.cwasm` loading next to plain `.wasm`, pooling allocator with
//!   on-demand fallback, fuel-based execution limits
//! - Shared or per-request instantiation per plugin via [`Pool`]
//! - Pause/resume flow control bridged to synchronous server loops through
//!   [`HttpExchange`] and [`NetworkStream`]
//! - Pluggable backends for logging, metrics, shared data and queues, plus a
//!   [`ServerAdaptor`] for timers and outbound calls
//!
//! The embedding server builds a [`PluginRegistry`] from a [`WasmConfig`],
//! borrows a [`Plugin`] from the pool per request, creates an exchange and
//! feeds it the request phases:
//!
//! ```no_run
//! use proxy_wasm_host::{FilterOutcome, PluginRegistry, WasmConfig};
//! # fn adaptor() -> std::sync::Arc<dyn proxy_wasm_host::ServerAdaptor> { unimplemented!() }
//! # fn request_adaptor() -> Box<dyn proxy_wasm_host::HttpRequestAdaptor> { unimplemented!() }
//! # fn main() -> anyhow::Result<()> {
//! let config: WasmConfig = toml::from_str(std::fs::read_to_string("wasm.toml")?.as_str())?;
//! let registry = PluginRegistry::new(&config, adaptor())?;
//! let pool = registry.pool("auth-filter").unwrap();
//! let plugin = pool.borrow()?;
//! let exchange = plugin.create_exchange(request_adaptor())?;
//! match exchange.on_request_headers(false)? {
//!     FilterOutcome::Continue => { /* forward upstream */ }
//!     FilterOutcome::LocalResponse(_resp) => { /* answer directly */ }
//! }
//! exchange.close()?;
//! pool.release(plugin);
//! # Ok(())
//! # }
//! ```

mod abi;
mod codec;
mod constants;
mod context;
mod dispatch;
mod exchange;
mod host;
mod instance;
mod memory;
mod pool;
mod registry;
mod scope;

pub mod adaptor;
pub mod error;
pub mod handler;
pub mod map;
pub mod plugin;
pub mod properties;
pub mod simple;
pub mod types;

pub use adaptor::{
    CancelHandle, GrpcCallRequest, GrpcCallResponseHandler, HttpCallCallback, HttpCallRequest,
    HttpRequestAdaptor, ScheduleError, ServerAdaptor, TickTask,
};
pub use dispatch::Upstream;
pub use error::{StartError, WasmError, WasmResult};
pub use exchange::{HttpExchange, NetworkStream};
pub use handler::{
    ForeignFunction, LogHandler, MetricsHandler, NopLogHandler, QueueName, QueueReadyListener,
    SharedData, SharedDataHandler, SharedQueueHandler,
};
pub use map::ProxyMap;
pub use plugin::{Plugin, PluginHandlers};
pub use pool::{Pool, PluginFactory};
pub use registry::{create_engine, load_plugin, LoadedPlugin, PluginRegistry};
pub use simple::{
    FtlogLogHandler, SimpleMetricsHandler, SimpleSharedDataHandler, SimpleSharedQueueHandler,
};
pub use types::{
    Action, BufferType, FilterOutcome, LocalResponse, LogLevel, MapType, MetricType, PluginConfig,
    PoolingConfig, StreamType, WasmConfig, WasmDefaults,
};

#[cfg(test)]
mod tests;
