//! Typed views over the raw ABI constants plus the host-side configuration
//! model.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::constants::*;
use crate::map::ProxyMap;

/// Per-exchange verdict a guest entry point returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    Pause,
}

impl Action {
    /// Anything that is not a clean `CONTINUE` pauses the stream.
    pub fn from_i32(value: i32) -> Action {
        match value {
            PROXY_ACTION_CONTINUE => Action::Continue,
            _ => Action::Pause,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            Action::Continue => PROXY_ACTION_CONTINUE,
            Action::Pause => PROXY_ACTION_PAUSE,
        }
    }
}

/// Guest log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    pub fn from_i32(value: i32) -> Option<LogLevel> {
        match value {
            PROXY_LOG_TRACE => Some(LogLevel::Trace),
            PROXY_LOG_DEBUG => Some(LogLevel::Debug),
            PROXY_LOG_INFO => Some(LogLevel::Info),
            PROXY_LOG_WARN => Some(LogLevel::Warn),
            PROXY_LOG_ERROR => Some(LogLevel::Error),
            PROXY_LOG_CRITICAL => Some(LogLevel::Critical),
            _ => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            LogLevel::Trace => PROXY_LOG_TRACE,
            LogLevel::Debug => PROXY_LOG_DEBUG,
            LogLevel::Info => PROXY_LOG_INFO,
            LogLevel::Warn => PROXY_LOG_WARN,
            LogLevel::Error => PROXY_LOG_ERROR,
            LogLevel::Critical => PROXY_LOG_CRITICAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

impl MetricType {
    pub fn from_i32(value: i32) -> Option<MetricType> {
        match value {
            METRIC_TYPE_COUNTER => Some(MetricType::Counter),
            METRIC_TYPE_GAUGE => Some(MetricType::Gauge),
            METRIC_TYPE_HISTOGRAM => Some(MetricType::Histogram),
            _ => None,
        }
    }
}

/// Which half of which stream an action or continue call refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Request,
    Response,
    Downstream,
    Upstream,
}

impl StreamType {
    pub fn from_i32(value: i32) -> Option<StreamType> {
        match value {
            STREAM_TYPE_REQUEST => Some(StreamType::Request),
            STREAM_TYPE_RESPONSE => Some(StreamType::Response),
            STREAM_TYPE_DOWNSTREAM => Some(StreamType::Downstream),
            STREAM_TYPE_UPSTREAM => Some(StreamType::Upstream),
            _ => None,
        }
    }
}

/// Named byte buffers the guest can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferType {
    HttpRequestBody,
    HttpResponseBody,
    DownstreamData,
    UpstreamData,
    HttpCallResponseBody,
    GrpcReceiveBuffer,
    VmConfiguration,
    PluginConfiguration,
    CallData,
}

impl BufferType {
    pub fn from_i32(value: i32) -> Option<BufferType> {
        match value {
            BUFFER_TYPE_HTTP_REQUEST_BODY => Some(BufferType::HttpRequestBody),
            BUFFER_TYPE_HTTP_RESPONSE_BODY => Some(BufferType::HttpResponseBody),
            BUFFER_TYPE_DOWNSTREAM_DATA => Some(BufferType::DownstreamData),
            BUFFER_TYPE_UPSTREAM_DATA => Some(BufferType::UpstreamData),
            BUFFER_TYPE_HTTP_CALL_RESPONSE_BODY => Some(BufferType::HttpCallResponseBody),
            BUFFER_TYPE_GRPC_RECEIVE_BUFFER => Some(BufferType::GrpcReceiveBuffer),
            BUFFER_TYPE_VM_CONFIGURATION => Some(BufferType::VmConfiguration),
            BUFFER_TYPE_PLUGIN_CONFIGURATION => Some(BufferType::PluginConfiguration),
            BUFFER_TYPE_CALL_DATA => Some(BufferType::CallData),
            _ => None,
        }
    }
}

/// Named header/trailer maps the guest can address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    HttpRequestHeaders,
    HttpRequestTrailers,
    HttpResponseHeaders,
    HttpResponseTrailers,
    GrpcReceiveInitialMetadata,
    GrpcReceiveTrailingMetadata,
    HttpCallResponseHeaders,
    HttpCallResponseTrailers,
}

impl MapType {
    pub fn from_i32(value: i32) -> Option<MapType> {
        match value {
            MAP_TYPE_HTTP_REQUEST_HEADERS => Some(MapType::HttpRequestHeaders),
            MAP_TYPE_HTTP_REQUEST_TRAILERS => Some(MapType::HttpRequestTrailers),
            MAP_TYPE_HTTP_RESPONSE_HEADERS => Some(MapType::HttpResponseHeaders),
            MAP_TYPE_HTTP_RESPONSE_TRAILERS => Some(MapType::HttpResponseTrailers),
            MAP_TYPE_GRPC_RECEIVE_INITIAL_METADATA => Some(MapType::GrpcReceiveInitialMetadata),
            MAP_TYPE_GRPC_RECEIVE_TRAILING_METADATA => Some(MapType::GrpcReceiveTrailingMetadata),
            MAP_TYPE_HTTP_CALL_RESPONSE_HEADERS => Some(MapType::HttpCallResponseHeaders),
            MAP_TYPE_HTTP_CALL_RESPONSE_TRAILERS => Some(MapType::HttpCallResponseTrailers),
            _ => None,
        }
    }
}

/// A guest's "answer this request directly" directive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalResponse {
    pub status_code: u32,
    pub status_details: Vec<u8>,
    pub headers: ProxyMap,
    pub body: Vec<u8>,
    pub grpc_status: i32,
}

/// What an exchange entry point resolved to once the guest (and any pause it
/// requested) finished with it.
#[derive(Debug, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Forward the traffic; header/body mutations are visible through the
    /// adaptor.
    Continue,
    /// Stop forwarding and answer with the guest-provided response.
    LocalResponse(LocalResponse),
}

// ---- configuration ----------------------------------------------------------

/// Top-level `[wasm]` configuration section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct WasmConfig {
    #[serde(default)]
    pub defaults: WasmDefaults,
    #[serde(default)]
    pub pooling: PoolingConfig,
    #[serde(default)]
    pub plugins: Vec<PluginConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WasmDefaults {
    /// Per-entry execution budget, converted to fuel at roughly 1M
    /// instructions per millisecond.
    #[serde(default = "default_max_execution_time_ms")]
    pub max_execution_time_ms: u64,
    /// Floor applied to guest-requested tick periods.
    #[serde(default = "default_min_tick_period_ms")]
    pub min_tick_period_ms: u32,
}

impl Default for WasmDefaults {
    fn default() -> Self {
        WasmDefaults {
            max_execution_time_ms: default_max_execution_time_ms(),
            min_tick_period_ms: default_min_tick_period_ms(),
        }
    }
}

fn default_max_execution_time_ms() -> u64 {
    100
}

fn default_min_tick_period_ms() -> u32 {
    100
}

/// Sizing for the wasmtime pooling allocator.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolingConfig {
    #[serde(default = "default_total_memories")]
    pub total_memories: u32,
    #[serde(default = "default_total_tables")]
    pub total_tables: u32,
    #[serde(default = "default_max_memory_size")]
    pub max_memory_size: usize,
}

impl Default for PoolingConfig {
    fn default() -> Self {
        PoolingConfig {
            total_memories: default_total_memories(),
            total_tables: default_total_tables(),
            max_memory_size: default_max_memory_size(),
        }
    }
}

fn default_total_memories() -> u32 {
    128
}

fn default_total_tables() -> u32 {
    128
}

fn default_max_memory_size() -> usize {
    10 * 1024 * 1024
}

/// One `[[wasm.plugins]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    /// Path to a `.wasm` module or precompiled `.cwasm` artifact.
    pub file: PathBuf,
    /// Shared plugins serve every request from one instance; non-shared get
    /// a fresh instance per request.
    #[serde(default = "default_shared")]
    pub shared: bool,
    /// Refuse dispatch to upstream names missing from `upstreams` instead of
    /// parsing them as literal URIs.
    #[serde(default)]
    pub strict_upstreams: bool,
    /// Named upstream endpoints, e.g. `backend = "http://127.0.0.1:8080"`.
    #[serde(default)]
    pub upstreams: HashMap<String, String>,
    #[serde(default)]
    pub vm_config: Option<String>,
    #[serde(default)]
    pub plugin_config: Option<String>,
    /// Per-plugin override of the tick-period floor.
    #[serde(default)]
    pub min_tick_period_ms: Option<u32>,
    /// Per-plugin override of the execution budget.
    #[serde(default)]
    pub max_execution_time_ms: Option<u64>,
}

fn default_shared() -> bool {
    true
}

impl WasmConfig {
    /// Rejects configurations that would otherwise fail at dispatch time:
    /// duplicate plugin names, missing module files, unparseable upstreams.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = std::collections::HashSet::new();
        for plugin in &self.plugins {
            if !seen.insert(plugin.name.as_str()) {
                anyhow::bail!("duplicate plugin name: {}", plugin.name);
            }
            if !plugin.file.exists() {
                anyhow::bail!(
                    "plugin {}: module file not found: {}",
                    plugin.name,
                    plugin.file.display()
                );
            }
            for (upstream, uri) in &plugin.upstreams {
                if crate::dispatch::Upstream::parse(uri).is_none() {
                    anyhow::bail!(
                        "plugin {}: upstream {} is not a valid URI: {}",
                        plugin.name,
                        upstream,
                        uri
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_from_i32_treats_unknown_as_pause() {
        assert_eq!(Action::from_i32(0), Action::Continue);
        assert_eq!(Action::from_i32(1), Action::Pause);
        assert_eq!(Action::from_i32(7), Action::Pause);
    }

    #[test]
    fn config_defaults_apply() {
        let config: WasmConfig = toml::from_str("").unwrap();
        assert_eq!(config.defaults.max_execution_time_ms, 100);
        assert_eq!(config.defaults.min_tick_period_ms, 100);
        assert_eq!(config.pooling.total_memories, 128);
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn plugin_config_parses() {
        let config: WasmConfig = toml::from_str(
            r#"
            [[plugins]]
            name = "auth"
            file = "auth.wasm"
            shared = false
            strict_upstreams = true

            [plugins.upstreams]
            backend = "http://127.0.0.1:8080"
            "#,
        )
        .unwrap();
        assert_eq!(config.plugins.len(), 1);
        let plugin = &config.plugins[0];
        assert_eq!(plugin.name, "auth");
        assert!(!plugin.shared);
        assert!(plugin.strict_upstreams);
        assert_eq!(
            plugin.upstreams.get("backend").map(String::as_str),
            Some("http://127.0.0.1:8080")
        );
    }

    fn plugin_entry(name: &str, file: &std::path::Path) -> PluginConfig {
        PluginConfig {
            name: name.to_string(),
            file: file.to_path_buf(),
            shared: true,
            strict_upstreams: false,
            upstreams: HashMap::new(),
            vm_config: None,
            plugin_config: None,
            min_tick_period_ms: None,
            max_execution_time_ms: None,
        }
    }

    #[test]
    fn validate_rejects_duplicate_names_and_missing_files() {
        let file = tempfile::NamedTempFile::new().unwrap();

        let config = WasmConfig {
            plugins: vec![plugin_entry("auth", file.path())],
            ..WasmConfig::default()
        };
        assert!(config.validate().is_ok());

        let config = WasmConfig {
            plugins: vec![
                plugin_entry("auth", file.path()),
                plugin_entry("auth", file.path()),
            ],
            ..WasmConfig::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate"));

        let config = WasmConfig {
            plugins: vec![plugin_entry("auth", std::path::Path::new("/no/such.wasm"))],
            ..WasmConfig::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("not found"));
    }
}
