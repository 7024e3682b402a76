//! In-process backend implementations.
//!
//! Good enough for single-server deployments and for tests. Everything here
//! is concurrency-safe on its own, since backends are shared across plugins
//! and called both under and outside the plugin execution lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{WasmError, WasmResult};
use crate::handler::{
    LogHandler, MetricsHandler, QueueName, QueueReadyListener, SharedData, SharedDataHandler,
    SharedQueueHandler,
};
use crate::types::{LogLevel, MetricType};

/// Guest log lines forwarded to the server's own log, tagged with the
/// plugin name.
pub struct FtlogLogHandler {
    prefix: String,
}

impl FtlogLogHandler {
    pub fn new(plugin_name: &str) -> Self {
        Self {
            prefix: format!("[wasm:{}]", plugin_name),
        }
    }
}

impl LogHandler for FtlogLogHandler {
    fn log(&self, level: LogLevel, message: &str) -> Result<(), WasmError> {
        match level {
            LogLevel::Trace => ftlog::trace!("{} {}", self.prefix, message),
            LogLevel::Debug => ftlog::debug!("{} {}", self.prefix, message),
            LogLevel::Info => ftlog::info!("{} {}", self.prefix, message),
            LogLevel::Warn => ftlog::warn!("{} {}", self.prefix, message),
            LogLevel::Error | LogLevel::Critical => {
                ftlog::error!("{} {}", self.prefix, message)
            }
        }
        Ok(())
    }

    fn log_level(&self) -> Result<LogLevel, WasmError> {
        Ok(LogLevel::Trace)
    }
}

struct Metric {
    value: u64,
}

/// Metric store keyed by the ids it hands out. Counters, gauges and
/// histograms all collapse to a single value cell here.
pub struct SimpleMetricsHandler {
    next_id: AtomicU32,
    metrics: DashMap<u32, Metric>,
}

impl SimpleMetricsHandler {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            metrics: DashMap::new(),
        }
    }
}

impl Default for SimpleMetricsHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsHandler for SimpleMetricsHandler {
    fn define_metric(&self, _metric_type: MetricType, _name: &str) -> Result<u32, WasmError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.metrics.insert(id, Metric { value: 0 });
        Ok(id)
    }

    fn remove_metric(&self, metric_id: u32) -> WasmResult {
        match self.metrics.remove(&metric_id) {
            Some(_) => WasmResult::Ok,
            None => WasmResult::NotFound,
        }
    }

    fn record_metric(&self, metric_id: u32, value: u64) -> WasmResult {
        match self.metrics.get_mut(&metric_id) {
            Some(mut metric) => {
                metric.value = value;
                WasmResult::Ok
            }
            None => WasmResult::NotFound,
        }
    }

    fn increment_metric(&self, metric_id: u32, offset: i64) -> WasmResult {
        match self.metrics.get_mut(&metric_id) {
            Some(mut metric) => {
                metric.value = metric.value.wrapping_add_signed(offset);
                WasmResult::Ok
            }
            None => WasmResult::NotFound,
        }
    }

    fn get_metric(&self, metric_id: u32) -> Result<u64, WasmError> {
        self.metrics
            .get(&metric_id)
            .map(|metric| metric.value)
            .ok_or_else(WasmError::not_found)
    }
}

/// CAS-versioned key-value store.
///
/// Versions start at 1 on first write and bump on every successful update.
/// A zero expected version writes unconditionally.
pub struct SimpleSharedDataHandler {
    data: DashMap<String, SharedData>,
}

impl SimpleSharedDataHandler {
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
        }
    }
}

impl Default for SimpleSharedDataHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedDataHandler for SimpleSharedDataHandler {
    fn get_shared_data(&self, key: &str) -> Result<SharedData, WasmError> {
        self.data
            .get(key)
            .map(|entry| entry.clone())
            .ok_or_else(WasmError::not_found)
    }

    fn set_shared_data(&self, key: &str, value: Option<&[u8]>, cas: u32) -> WasmResult {
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if cas != 0 && cas != occupied.get().cas {
                    return WasmResult::CasMismatch;
                }
                match value {
                    Some(value) => {
                        let next_cas = occupied.get().cas.wrapping_add(1).max(1);
                        occupied.insert(SharedData::new(value.to_vec(), next_cas));
                    }
                    None => {
                        occupied.remove();
                    }
                }
                WasmResult::Ok
            }
            Entry::Vacant(vacant) => {
                if cas != 0 {
                    return WasmResult::CasMismatch;
                }
                if let Some(value) = value {
                    vacant.insert(SharedData::new(value.to_vec(), 1));
                }
                WasmResult::Ok
            }
        }
    }
}

/// FIFO queues addressable across plugin instances by `(vm_id, name)`.
pub struct SimpleSharedQueueHandler {
    next_id: AtomicU32,
    ids: DashMap<QueueName, u32>,
    queues: DashMap<u32, Mutex<VecDeque<Vec<u8>>>>,
    listeners: Mutex<Vec<QueueReadyListener>>,
}

impl SimpleSharedQueueHandler {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            ids: DashMap::new(),
            queues: DashMap::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl Default for SimpleSharedQueueHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedQueueHandler for SimpleSharedQueueHandler {
    /// Idempotent: re-registering an existing queue hands back its id.
    fn register_shared_queue(&self, name: &QueueName) -> Result<u32, WasmError> {
        let id = *self.ids.entry(name.clone()).or_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            self.queues.insert(id, Mutex::new(VecDeque::new()));
            id
        });
        Ok(id)
    }

    /// Lookup only; resolving never creates a queue.
    fn resolve_shared_queue(&self, name: &QueueName) -> Result<u32, WasmError> {
        self.ids
            .get(name)
            .map(|entry| *entry)
            .ok_or_else(WasmError::not_found)
    }

    fn dequeue_shared_queue(&self, queue_id: u32) -> Result<Option<Vec<u8>>, WasmError> {
        let queue = self.queues.get(&queue_id).ok_or_else(WasmError::not_found)?;
        let mut items = queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(items.pop_front())
    }

    fn enqueue_shared_queue(&self, queue_id: u32, value: &[u8]) -> WasmResult {
        let Some(queue) = self.queues.get(&queue_id) else {
            return WasmResult::NotFound;
        };
        {
            let mut items = queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            items.push_back(value.to_vec());
        }
        drop(queue);
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        for listener in listeners {
            listener(queue_id);
        }
        WasmResult::Ok
    }

    fn add_queue_ready_listener(&self, listener: QueueReadyListener) {
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(listener);
    }
}
