//! End-to-end tests that drive real guest modules built from WAT through
//! the public embedding surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::adaptor::{
    CancelHandle, HttpCallCallback, HttpCallRequest, HttpRequestAdaptor, ScheduleError,
    ServerAdaptor, TickTask,
};
use crate::codec::encode_map;
use crate::error::WasmError;
use crate::handler::{LogHandler, QueueName, SharedQueueHandler};
use crate::map::ProxyMap;
use crate::plugin::{Plugin, PluginHandlers};
use crate::pool::Pool;
use crate::registry::{create_engine, load_plugin, LoadedPlugin};
use crate::simple::SimpleSharedQueueHandler;
use crate::types::{FilterOutcome, LogLevel, PluginConfig, PoolingConfig, WasmDefaults};

// ---- backends and adaptors --------------------------------------------------

#[derive(Default)]
struct RecordingLogHandler {
    entries: Mutex<Vec<(LogLevel, String)>>,
}

impl RecordingLogHandler {
    fn entries(&self) -> Vec<(LogLevel, String)> {
        self.entries.lock().unwrap().clone()
    }

    fn messages(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl LogHandler for RecordingLogHandler {
    fn log(&self, level: LogLevel, message: &str) -> Result<(), WasmError> {
        self.entries
            .lock()
            .unwrap()
            .push((level, message.to_string()));
        Ok(())
    }
}

/// Records everything a plugin schedules instead of running it, so tests
/// control exactly when ticks fire and calls complete.
#[derive(Default)]
struct TestScheduler {
    ticks: Mutex<Vec<(u64, TickTask, Arc<AtomicBool>)>>,
    http_calls: Mutex<Vec<(HttpCallRequest, Option<HttpCallCallback>)>>,
}

impl TestScheduler {
    fn tick_periods(&self) -> Vec<u64> {
        self.ticks.lock().unwrap().iter().map(|t| t.0).collect()
    }

    fn tick_cancelled(&self, index: usize) -> bool {
        self.ticks.lock().unwrap()[index].2.load(Ordering::SeqCst)
    }

    fn fire_tick(&self, index: usize) {
        let task = self.ticks.lock().unwrap()[index].1.clone();
        task();
    }

    fn http_request<R>(&self, index: usize, f: impl FnOnce(&HttpCallRequest) -> R) -> R {
        f(&self.http_calls.lock().unwrap()[index].0)
    }

    fn take_http_callback(&self, index: usize) -> HttpCallCallback {
        self.http_calls.lock().unwrap()[index].1.take().unwrap()
    }
}

impl ServerAdaptor for TestScheduler {
    fn schedule_tick(&self, period_ms: u64, task: TickTask) -> CancelHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.ticks
            .lock()
            .unwrap()
            .push((period_ms, task, cancelled.clone()));
        Box::new(move || cancelled.store(true, Ordering::SeqCst))
    }

    fn schedule_http_call(
        &self,
        request: HttpCallRequest,
        on_response: HttpCallCallback,
    ) -> Result<CancelHandle, ScheduleError> {
        self.http_calls
            .lock()
            .unwrap()
            .push((request, Some(on_response)));
        Ok(Box::new(|| {}))
    }
}

/// Request adaptor over fixed header maps. On drop (exchange teardown) it
/// snapshots the final request headers so tests can assert guest edits.
#[derive(Default)]
struct StaticRequestAdaptor {
    headers: ProxyMap,
    final_headers: Option<Arc<Mutex<Option<ProxyMap>>>>,
}

impl HttpRequestAdaptor for StaticRequestAdaptor {
    fn request_headers(&mut self) -> Option<&mut ProxyMap> {
        Some(&mut self.headers)
    }
}

impl Drop for StaticRequestAdaptor {
    fn drop(&mut self) {
        if let Some(slot) = &self.final_headers {
            *slot.lock().unwrap() = Some(self.headers.clone());
        }
    }
}

// ---- fixtures ---------------------------------------------------------------

/// Allocator plus the lifecycle exports every guest needs. The bump
/// allocator starts at the second page; data segments stay in the first.
const COMMON_EXPORTS: &str = r#"
  (global $heap (mut i32) (i32.const 65536))
  (func (export "proxy_on_memory_allocate") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (local.get $ptr) (local.get $size)))
    (local.get $ptr))
  (func (export "proxy_on_context_create") (param i32 i32))
  (func (export "proxy_on_done") (param i32) (result i32) (i32.const 1))
  (func (export "proxy_on_log") (param i32))
  (func (export "proxy_on_delete") (param i32))
"#;

fn wat_bytes(data: &[u8]) -> String {
    data.iter().map(|b| format!("\\{:02x}", b)).collect()
}

static ENGINE: Lazy<wasmtime::Engine> =
    Lazy::new(|| create_engine(&PoolingConfig::default()).unwrap());

fn load_from_wat(
    wat: &str,
    upstreams: &[(&str, &str)],
) -> (LoadedPlugin, tempfile::NamedTempFile) {
    let wasm = wat::parse_str(wat).unwrap();
    let file = tempfile::Builder::new().suffix(".wasm").tempfile().unwrap();
    std::fs::write(file.path(), &wasm).unwrap();
    let config = PluginConfig {
        name: "test-plugin".to_string(),
        file: file.path().to_path_buf(),
        shared: true,
        strict_upstreams: false,
        upstreams: upstreams
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        vm_config: None,
        plugin_config: None,
        min_tick_period_ms: None,
        max_execution_time_ms: None,
    };
    let loaded = load_plugin(&ENGINE, &config, &WasmDefaults::default()).unwrap();
    (loaded, file)
}

fn start_plugin(
    wat: &str,
    upstreams: &[(&str, &str)],
    log: Arc<RecordingLogHandler>,
    adaptor: Arc<dyn ServerAdaptor>,
) -> (Plugin, tempfile::NamedTempFile) {
    let (loaded, file) = load_from_wat(wat, upstreams);
    let handlers = PluginHandlers {
        log,
        ..PluginHandlers::default()
    };
    let plugin = Plugin::new(&loaded, handlers, adaptor).unwrap();
    (plugin, file)
}

// ---- guests -----------------------------------------------------------------

/// Denies requests carrying `x-block` with a 403, tags everything else with
/// `x-filtered: 1`.
fn gate_guest() -> String {
    format!(
        r#"(module
  (import "env" "proxy_get_header_map_value"
    (func $get_header (param i32 i32 i32 i32 i32) (result i32)))
  (import "env" "proxy_add_header_map_value"
    (func $add_header (param i32 i32 i32 i32 i32) (result i32)))
  (import "env" "proxy_send_local_response"
    (func $send_local (param i32 i32 i32 i32 i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 2)
  (data (i32.const 16) "x-block")
  (data (i32.const 32) "x-filtered")
  (data (i32.const 48) "1")
  (data (i32.const 64) "denied")
  {COMMON_EXPORTS}
  (func (export "proxy_on_request_headers") (param i32 i32 i32) (result i32)
    (if (i32.eqz (call $get_header (i32.const 0) (i32.const 16) (i32.const 7)
                   (i32.const 1024) (i32.const 1032)))
      (then
        (drop (call $send_local (i32.const 403) (i32.const 0) (i32.const 0)
                (i32.const 64) (i32.const 6) (i32.const 0) (i32.const 0)
                (i32.const -1)))
        (return (i32.const 1))))
    (drop (call $add_header (i32.const 0) (i32.const 32) (i32.const 10)
            (i32.const 48) (i32.const 1)))
    (i32.const 0))
)"#
    )
}

/// Logs "started" on VM start, asks for a 5ms tick, logs "tick" per tick.
fn ticker_guest() -> String {
    format!(
        r#"(module
  (import "env" "proxy_log" (func $log (param i32 i32 i32) (result i32)))
  (import "env" "proxy_set_tick_period_milliseconds"
    (func $set_tick (param i32) (result i32)))
  (memory (export "memory") 2)
  (data (i32.const 16) "started")
  (data (i32.const 32) "tick")
  {COMMON_EXPORTS}
  (func (export "proxy_on_vm_start") (param i32 i32) (result i32)
    (drop (call $log (i32.const 2) (i32.const 16) (i32.const 7)))
    (drop (call $set_tick (i32.const 5)))
    (drop (call $set_tick (i32.const 5)))
    (i32.const 1))
  (func (export "proxy_on_tick") (param i32)
    (drop (call $log (i32.const 2) (i32.const 32) (i32.const 4))))
)"#
    )
}

/// Dispatches an outbound call to the `backend` upstream on VM start, then
/// logs the response status and body when the completion arrives.
fn caller_guest(path: &str) -> String {
    let headers = encode_map(&ProxyMap::of(&[
        (":method", "GET"),
        (":path", path),
        (":authority", "backend"),
    ]));
    let headers_len = headers.len();
    let headers = wat_bytes(&headers);
    format!(
        r#"(module
  (import "env" "proxy_dispatch_http_call"
    (func $dispatch (param i32 i32 i32 i32 i32 i32 i32 i32 i32 i32) (result i32)))
  (import "env" "proxy_get_header_map_value"
    (func $get_header (param i32 i32 i32 i32 i32) (result i32)))
  (import "env" "proxy_get_buffer_bytes"
    (func $get_buffer (param i32 i32 i32 i32 i32) (result i32)))
  (import "env" "proxy_log" (func $log (param i32 i32 i32) (result i32)))
  (memory (export "memory") 2)
  (data (i32.const 16) "backend")
  (data (i32.const 32) "{headers}")
  (data (i32.const 512) ":status")
  {COMMON_EXPORTS}
  (func (export "proxy_on_vm_start") (param i32 i32) (result i32)
    (drop (call $dispatch (i32.const 16) (i32.const 7)
            (i32.const 32) (i32.const {headers_len})
            (i32.const 0) (i32.const 0)
            (i32.const 0) (i32.const 0)
            (i32.const 1000) (i32.const 1024)))
    (i32.const 1))
  (func (export "proxy_on_http_call_response") (param i32 i32 i32 i32 i32)
    (if (i32.eqz (call $get_header (i32.const 6) (i32.const 512) (i32.const 7)
                   (i32.const 1028) (i32.const 1036)))
      (then (drop (call $log (i32.const 2)
                    (i32.load (i32.const 1028)) (i32.load (i32.const 1036))))))
    (if (i32.eqz (call $get_buffer (i32.const 4) (i32.const 0) (i32.const 65535)
                   (i32.const 1044) (i32.const 1052)))
      (then (drop (call $log (i32.const 2)
                    (i32.load (i32.const 1044)) (i32.load (i32.const 1052)))))))
)"#
    )
}

/// Fires a gRPC call at an upstream that is not mapped to an http/https
/// endpoint.
fn grpc_to_tcp_guest() -> String {
    format!(
        r#"(module
  (import "env" "proxy_grpc_call"
    (func $grpc (param i32 i32 i32 i32 i32 i32 i32 i32 i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 2)
  (data (i32.const 16) "tcp://backend:7000")
  (data (i32.const 64) "svc")
  (data (i32.const 80) "m")
  {COMMON_EXPORTS}
  (func (export "proxy_on_vm_start") (param i32 i32) (result i32)
    (drop (call $grpc (i32.const 16) (i32.const 18)
            (i32.const 64) (i32.const 3)
            (i32.const 80) (i32.const 1)
            (i32.const 0) (i32.const 0)
            (i32.const 0) (i32.const 0)
            (i32.const 1000) (i32.const 1024)))
    (i32.const 1))
)"#
    )
}

/// Writes and reads back shared data, then round-trips one item through a
/// shared queue, logging what came back each time.
fn state_guest() -> String {
    format!(
        r#"(module
  (import "env" "proxy_set_shared_data"
    (func $set_shared (param i32 i32 i32 i32 i32) (result i32)))
  (import "env" "proxy_get_shared_data"
    (func $get_shared (param i32 i32 i32 i32 i32) (result i32)))
  (import "env" "proxy_register_shared_queue"
    (func $register_queue (param i32 i32 i32) (result i32)))
  (import "env" "proxy_enqueue_shared_queue"
    (func $enqueue (param i32 i32 i32) (result i32)))
  (import "env" "proxy_dequeue_shared_queue"
    (func $dequeue (param i32 i32 i32) (result i32)))
  (import "env" "proxy_log" (func $log (param i32 i32 i32) (result i32)))
  (memory (export "memory") 2)
  (data (i32.const 16) "k")
  (data (i32.const 18) "v")
  (data (i32.const 20) "jobs")
  (data (i32.const 26) "q1")
  {COMMON_EXPORTS}
  (func (export "proxy_on_vm_start") (param i32 i32) (result i32)
    (drop (call $set_shared (i32.const 16) (i32.const 1)
            (i32.const 18) (i32.const 1) (i32.const 0)))
    (if (i32.eqz (call $get_shared (i32.const 16) (i32.const 1)
                   (i32.const 1024) (i32.const 1032) (i32.const 1040)))
      (then (drop (call $log (i32.const 2)
                    (i32.load (i32.const 1024)) (i32.load (i32.const 1032))))))
    (if (i32.eqz (call $register_queue (i32.const 20) (i32.const 4) (i32.const 1048)))
      (then
        (drop (call $enqueue (i32.load (i32.const 1048)) (i32.const 26) (i32.const 2)))
        (if (i32.eqz (call $dequeue (i32.load (i32.const 1048))
                       (i32.const 1056) (i32.const 1064)))
          (then (drop (call $log (i32.const 2)
                        (i32.load (i32.const 1056)) (i32.load (i32.const 1064))))))))
    (i32.const 1))
)"#
    )
}

/// Counts request-headers calls in instance state and logs the count as a
/// single digit.
fn counter_guest() -> String {
    format!(
        r#"(module
  (import "env" "proxy_log" (func $log (param i32 i32 i32) (result i32)))
  (memory (export "memory") 2)
  (global $count (mut i32) (i32.const 0))
  {COMMON_EXPORTS}
  (func (export "proxy_on_request_headers") (param i32 i32 i32) (result i32)
    (global.set $count (i32.add (global.get $count) (i32.const 1)))
    (i32.store8 (i32.const 100) (i32.add (i32.const 48) (global.get $count)))
    (drop (call $log (i32.const 2) (i32.const 100) (i32.const 1)))
    (i32.const 0))
)"#
    )
}

/// Pauses every request and resumes it from the next tick via
/// `proxy_set_effective_context` + `proxy_continue_stream`.
fn pauser_guest() -> String {
    format!(
        r#"(module
  (import "env" "proxy_set_tick_period_milliseconds"
    (func $set_tick (param i32) (result i32)))
  (import "env" "proxy_set_effective_context"
    (func $set_context (param i32) (result i32)))
  (import "env" "proxy_continue_stream"
    (func $continue_stream (param i32) (result i32)))
  (memory (export "memory") 2)
  (global $waiting (mut i32) (i32.const 0))
  {COMMON_EXPORTS}
  (func (export "proxy_on_vm_start") (param i32 i32) (result i32)
    (drop (call $set_tick (i32.const 100)))
    (i32.const 1))
  (func (export "proxy_on_request_headers") (param $ctx i32) (param i32 i32) (result i32)
    (global.set $waiting (local.get $ctx))
    (i32.const 1))
  (func (export "proxy_on_tick") (param i32)
    (if (i32.ne (global.get $waiting) (i32.const 0))
      (then
        (drop (call $set_context (global.get $waiting)))
        (drop (call $continue_stream (i32.const 0)))
        (global.set $waiting (i32.const 0)))))
)"#
    )
}

/// Defers its own teardown: flow contexts answer `proxy_on_done` with "not
/// yet", then finish from the next tick via `proxy_done`. Logs "deleted"
/// once the host re-enters `proxy_on_delete`.
fn deferred_close_guest() -> String {
    r#"(module
  (import "env" "proxy_log" (func $log (param i32 i32 i32) (result i32)))
  (import "env" "proxy_set_tick_period_milliseconds"
    (func $set_tick (param i32) (result i32)))
  (import "env" "proxy_set_effective_context"
    (func $set_context (param i32) (result i32)))
  (import "env" "proxy_done" (func $done (result i32)))
  (memory (export "memory") 2)
  (data (i32.const 16) "deleted")
  (global $heap (mut i32) (i32.const 65536))
  (global $closing (mut i32) (i32.const 0))
  (func (export "proxy_on_memory_allocate") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (local.get $ptr) (local.get $size)))
    (local.get $ptr))
  (func (export "proxy_on_context_create") (param i32 i32))
  (func (export "proxy_on_log") (param i32))
  (func (export "proxy_on_vm_start") (param i32 i32) (result i32)
    (drop (call $set_tick (i32.const 100)))
    (i32.const 1))
  (func (export "proxy_on_done") (param $ctx i32) (result i32)
    (if (result i32) (i32.eq (local.get $ctx) (i32.const 1))
      (then (i32.const 1))
      (else
        (global.set $closing (local.get $ctx))
        (i32.const 0))))
  (func (export "proxy_on_delete") (param $ctx i32)
    (if (i32.ne (local.get $ctx) (i32.const 1))
      (then (drop (call $log (i32.const 2) (i32.const 16) (i32.const 7))))))
  (func (export "proxy_on_tick") (param i32)
    (if (i32.ne (global.get $closing) (i32.const 0))
      (then
        (drop (call $set_context (global.get $closing)))
        (drop (call $done))
        (global.set $closing (i32.const 0)))))
)"#
    .to_string()
}

/// Like the deferred-close guest, but `proxy_on_log` traps for flow
/// contexts. Logs "removed" only if the failed `proxy_done` still
/// unregistered the context.
fn trapping_log_guest() -> String {
    r#"(module
  (import "env" "proxy_log" (func $log (param i32 i32 i32) (result i32)))
  (import "env" "proxy_set_tick_period_milliseconds"
    (func $set_tick (param i32) (result i32)))
  (import "env" "proxy_set_effective_context"
    (func $set_context (param i32) (result i32)))
  (import "env" "proxy_done" (func $done (result i32)))
  (memory (export "memory") 2)
  (data (i32.const 16) "removed")
  (global $heap (mut i32) (i32.const 65536))
  (global $closing (mut i32) (i32.const 0))
  (func (export "proxy_on_memory_allocate") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (local.get $ptr) (local.get $size)))
    (local.get $ptr))
  (func (export "proxy_on_context_create") (param i32 i32))
  (func (export "proxy_on_log") (param $ctx i32)
    (if (i32.ne (local.get $ctx) (i32.const 1)) (then unreachable)))
  (func (export "proxy_on_delete") (param i32))
  (func (export "proxy_on_vm_start") (param i32 i32) (result i32)
    (drop (call $set_tick (i32.const 100)))
    (i32.const 1))
  (func (export "proxy_on_done") (param $ctx i32) (result i32)
    (if (result i32) (i32.eq (local.get $ctx) (i32.const 1))
      (then (i32.const 1))
      (else
        (global.set $closing (local.get $ctx))
        (i32.const 0))))
  (func (export "proxy_on_tick") (param i32) (local $r i32)
    (if (i32.ne (global.get $closing) (i32.const 0))
      (then
        (drop (call $set_context (global.get $closing)))
        (local.set $r (call $done))
        (if (i32.and
              (i32.eq (local.get $r) (i32.const 10))
              (i32.eq (call $set_context (global.get $closing)) (i32.const 2)))
          (then (drop (call $log (i32.const 2) (i32.const 16) (i32.const 7)))))
        (global.set $closing (i32.const 0)))))
)"#
    .to_string()
}

// ---- tests ------------------------------------------------------------------

#[test]
fn filter_continues_and_edits_request_headers() {
    let log = Arc::new(RecordingLogHandler::default());
    let scheduler = Arc::new(TestScheduler::default());
    let (plugin, _file) = start_plugin(&gate_guest(), &[], log, scheduler);

    let snapshot = Arc::new(Mutex::new(None));
    let adaptor = StaticRequestAdaptor {
        headers: ProxyMap::of(&[(":method", "GET"), (":path", "/")]),
        final_headers: Some(snapshot.clone()),
    };
    let exchange = plugin.create_exchange(Box::new(adaptor)).unwrap();
    let outcome = exchange.on_request_headers(true).unwrap();
    assert_eq!(outcome, FilterOutcome::Continue);
    exchange.close().unwrap();

    let headers = snapshot.lock().unwrap().take().unwrap();
    assert_eq!(headers.get("x-filtered"), Some("1"));
    plugin.close();
}

#[test]
fn filter_answers_with_local_response() {
    let log = Arc::new(RecordingLogHandler::default());
    let scheduler = Arc::new(TestScheduler::default());
    let (plugin, _file) = start_plugin(&gate_guest(), &[], log, scheduler);

    let adaptor = StaticRequestAdaptor {
        headers: ProxyMap::of(&[(":method", "GET"), (":path", "/"), ("x-block", "yes")]),
        final_headers: None,
    };
    let exchange = plugin.create_exchange(Box::new(adaptor)).unwrap();
    match exchange.on_request_headers(true).unwrap() {
        FilterOutcome::LocalResponse(response) => {
            assert_eq!(response.status_code, 403);
            assert_eq!(response.body, b"denied");
        }
        FilterOutcome::Continue => panic!("expected a local response"),
    }
    exchange.close().unwrap();
    plugin.close();
}

#[test]
fn guest_logs_reach_the_backend() {
    let log = Arc::new(RecordingLogHandler::default());
    let scheduler = Arc::new(TestScheduler::default());
    let (plugin, _file) = start_plugin(&ticker_guest(), &[], log.clone(), scheduler);

    assert!(log.messages().contains(&"started".to_string()));
    plugin.close();
}

#[test]
fn tick_period_is_clamped_and_ticks_deliver() {
    let log = Arc::new(RecordingLogHandler::default());
    let scheduler = Arc::new(TestScheduler::default());
    let (plugin, _file) = start_plugin(&ticker_guest(), &[], log.clone(), scheduler.clone());

    // The guest asked for 5ms; the default floor is 100ms.
    assert_eq!(scheduler.tick_periods(), vec![100]);

    scheduler.fire_tick(0);
    scheduler.fire_tick(0);
    let ticks = log.messages().iter().filter(|m| *m == "tick").count();
    assert_eq!(ticks, 2);

    plugin.close();
    assert!(scheduler.tick_cancelled(0));
}

#[test]
fn dispatch_resolves_upstream_and_delivers_completion() {
    let log = Arc::new(RecordingLogHandler::default());
    let scheduler = Arc::new(TestScheduler::default());
    let (plugin, _file) = start_plugin(
        &caller_guest("/check"),
        &[("backend", "http://127.0.0.1:9000")],
        log.clone(),
        scheduler.clone(),
    );

    scheduler.http_request(0, |request| {
        assert_eq!(request.method, "GET");
        assert_eq!(request.host, "127.0.0.1");
        assert_eq!(request.port, 9000);
        assert_eq!(request.uri, "/check");
        assert_eq!(request.timeout_ms, 1000);
    });

    let callback = scheduler.take_http_callback(0);
    callback(200, ProxyMap::new(), b"pong".to_vec());

    let messages = log.messages();
    assert!(messages.contains(&"200".to_string()));
    assert!(messages.contains(&"pong".to_string()));
    plugin.close();
}

#[test]
fn dispatch_gives_a_relative_path_its_leading_slash() {
    let log = Arc::new(RecordingLogHandler::default());
    let scheduler = Arc::new(TestScheduler::default());
    let (plugin, _file) = start_plugin(
        &caller_guest("check"),
        &[("backend", "http://127.0.0.1:9000")],
        log,
        scheduler.clone(),
    );

    scheduler.http_request(0, |request| {
        assert_eq!(request.uri, "/check");
    });
    plugin.close();
}

#[test]
fn grpc_call_to_a_non_http_upstream_logs_an_error() {
    let log = Arc::new(RecordingLogHandler::default());
    let scheduler = Arc::new(TestScheduler::default());
    let (plugin, _file) = start_plugin(&grpc_to_tcp_guest(), &[], log.clone(), scheduler);

    assert!(log
        .entries()
        .iter()
        .any(|(level, message)| *level == LogLevel::Error
            && message.contains("tcp://backend:7000")));
    plugin.close();
}

#[test]
fn completion_after_close_is_a_no_op() {
    let log = Arc::new(RecordingLogHandler::default());
    let scheduler = Arc::new(TestScheduler::default());
    let (plugin, _file) = start_plugin(
        &caller_guest("/check"),
        &[("backend", "http://127.0.0.1:9000")],
        log.clone(),
        scheduler.clone(),
    );

    let callback = scheduler.take_http_callback(0);
    plugin.close();
    callback(200, ProxyMap::new(), b"pong".to_vec());

    assert!(!log.messages().contains(&"200".to_string()));
}

#[test]
fn shared_data_and_queues_roundtrip_through_the_abi() {
    let log = Arc::new(RecordingLogHandler::default());
    let scheduler = Arc::new(TestScheduler::default());
    let (plugin, _file) = start_plugin(&state_guest(), &[], log.clone(), scheduler);

    assert_eq!(log.messages(), vec!["v".to_string(), "q1".to_string()]);
    plugin.close();
}

#[test]
fn queue_names_scope_to_the_plugin_name_unless_a_vm_id_is_seeded() {
    let scheduler = Arc::new(TestScheduler::default());

    // Default scope: the plugin name stands in for the vm id.
    let queues = Arc::new(SimpleSharedQueueHandler::new());
    let (loaded, _file) = load_from_wat(&state_guest(), &[]);
    let handlers = PluginHandlers {
        shared_queues: queues.clone(),
        ..PluginHandlers::default()
    };
    let plugin = Plugin::new(&loaded, handlers, scheduler.clone()).unwrap();
    assert!(queues
        .resolve_shared_queue(&QueueName::new("test-plugin", "jobs"))
        .is_ok());
    plugin.close();

    // A seeded vm_id property wins over the fallback.
    let queues = Arc::new(SimpleSharedQueueHandler::new());
    let (loaded, _file) = load_from_wat(&state_guest(), &[]);
    let handlers = PluginHandlers {
        shared_queues: queues.clone(),
        properties: HashMap::from([(vec!["vm_id".to_string()], b"vm-a".to_vec())]),
        ..PluginHandlers::default()
    };
    let plugin = Plugin::new(&loaded, handlers, scheduler).unwrap();
    assert!(queues
        .resolve_shared_queue(&QueueName::new("vm-a", "jobs"))
        .is_ok());
    assert!(queues
        .resolve_shared_queue(&QueueName::new("test-plugin", "jobs"))
        .is_err());
    plugin.close();
}

#[test]
fn shared_instances_keep_state_and_per_request_instances_do_not() {
    let log = Arc::new(RecordingLogHandler::default());
    let scheduler: Arc<TestScheduler> = Arc::new(TestScheduler::default());
    let (loaded, _file) = load_from_wat(&counter_guest(), &[]);
    let loaded = Arc::new(loaded);

    let factory = {
        let loaded = loaded.clone();
        let log = log.clone();
        let scheduler = scheduler.clone();
        Box::new(move || {
            let handlers = PluginHandlers {
                log: log.clone(),
                ..PluginHandlers::default()
            };
            Plugin::new(&loaded, handlers, scheduler.clone())
        })
    };

    // Shared: one instance sees both exchanges.
    let pool = Pool::shared(factory);
    let plugin = pool.borrow().unwrap();
    for _ in 0..2 {
        let exchange = plugin
            .create_exchange(Box::new(StaticRequestAdaptor::default()))
            .unwrap();
        exchange.on_request_headers(true).unwrap();
        exchange.close().unwrap();
    }
    pool.release(plugin);
    pool.close();
    assert_eq!(log.messages(), vec!["1".to_string(), "2".to_string()]);

    // Per-request: a fresh instance per borrow starts counting over.
    let log = Arc::new(RecordingLogHandler::default());
    let factory = {
        let log = log.clone();
        Box::new(move || {
            let handlers = PluginHandlers {
                log: log.clone(),
                ..PluginHandlers::default()
            };
            Plugin::new(&loaded, handlers, scheduler.clone())
        })
    };
    let pool = Pool::per_request(factory);
    for _ in 0..2 {
        let plugin = pool.borrow().unwrap();
        let exchange = plugin
            .create_exchange(Box::new(StaticRequestAdaptor::default()))
            .unwrap();
        exchange.on_request_headers(true).unwrap();
        exchange.close().unwrap();
        pool.release(plugin);
    }
    assert_eq!(log.messages(), vec!["1".to_string(), "1".to_string()]);
}

#[test]
fn paused_exchange_resumes_from_a_tick() {
    let log = Arc::new(RecordingLogHandler::default());
    let scheduler = Arc::new(TestScheduler::default());
    let (plugin, _file) = start_plugin(&pauser_guest(), &[], log, scheduler.clone());

    let exchange = plugin
        .create_exchange(Box::new(StaticRequestAdaptor::default()))
        .unwrap();
    let done = Arc::new(AtomicBool::new(false));
    let worker = {
        let done = done.clone();
        thread::spawn(move || {
            let outcome = exchange.on_request_headers(true).unwrap();
            done.store(true, Ordering::SeqCst);
            (exchange, outcome)
        })
    };

    // The tick could race ahead of the headers call, so keep firing until
    // the worker reports back.
    for _ in 0..500 {
        if done.load(Ordering::SeqCst) {
            break;
        }
        thread::sleep(Duration::from_millis(10));
        scheduler.fire_tick(0);
    }
    let (exchange, outcome) = worker.join().unwrap();
    assert_eq!(outcome, FilterOutcome::Continue);
    exchange.close().unwrap();
    plugin.close();
}

#[test]
fn deferred_close_completes_via_done() {
    let log = Arc::new(RecordingLogHandler::default());
    let scheduler = Arc::new(TestScheduler::default());
    let (plugin, _file) =
        start_plugin(&deferred_close_guest(), &[], log.clone(), scheduler.clone());

    let exchange = plugin
        .create_exchange(Box::new(StaticRequestAdaptor::default()))
        .unwrap();
    exchange.close().unwrap();
    // Re-closing while the guest still owes a `proxy_done` is a no-op.
    exchange.close().unwrap();
    assert!(!log.messages().iter().any(|m| m == "deleted"));

    scheduler.fire_tick(0);
    assert!(log.messages().iter().any(|m| m == "deleted"));
    plugin.close();
}

#[test]
fn trap_during_done_still_unregisters_the_context() {
    let log = Arc::new(RecordingLogHandler::default());
    let scheduler = Arc::new(TestScheduler::default());
    let (plugin, _file) =
        start_plugin(&trapping_log_guest(), &[], log.clone(), scheduler.clone());

    let exchange = plugin
        .create_exchange(Box::new(StaticRequestAdaptor::default()))
        .unwrap();
    exchange.close().unwrap();

    // `proxy_done` answers InternalFailure for the trapped on_log, but the
    // context is gone: re-targeting it is a BadArgument.
    scheduler.fire_tick(0);
    assert!(log.messages().iter().any(|m| m == "removed"));
    plugin.close();
}
