//! Per-exchange state: everything one HTTP exchange or TCP stream carries
//! between filter callbacks.
//!
//! Bodies are lazy. A server can hand over a loader instead of bytes, and
//! the load only happens if the guest (or the body callback itself) asks
//! for the payload.

use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Condvar, Mutex};

use crate::adaptor::HttpRequestAdaptor;
use crate::instance::PluginVm;
use crate::types::{Action, FilterOutcome, LocalResponse};

pub(crate) enum BodyState {
    Absent,
    Deferred(Box<dyn FnOnce() -> Vec<u8> + Send>),
    Loaded(Vec<u8>),
}

impl BodyState {
    /// Loads a deferred body if needed and returns the bytes.
    pub(crate) fn force(&mut self) -> Option<&[u8]> {
        if let BodyState::Deferred(_) = self {
            let loader = match mem::replace(self, BodyState::Absent) {
                BodyState::Deferred(loader) => loader,
                _ => unreachable!(),
            };
            *self = BodyState::Loaded(loader());
        }
        match self {
            BodyState::Loaded(data) => Some(data.as_slice()),
            _ => None,
        }
    }

    pub(crate) fn set(&mut self, data: Vec<u8>) {
        *self = BodyState::Loaded(data);
    }

    /// Byte length after forcing; absent bodies count as zero.
    pub(crate) fn len(&mut self) -> usize {
        self.force().map(|data| data.len()).unwrap_or(0)
    }

    /// Takes the loaded bytes out, forcing a deferred loader first.
    pub(crate) fn take(&mut self) -> Option<Vec<u8>> {
        self.force();
        match mem::replace(self, BodyState::Absent) {
            BodyState::Loaded(data) => Some(data),
            _ => None,
        }
    }
}

/// Blocks the event thread of a paused exchange until another delivery
/// resumes it.
///
/// The gate is armed while the plugin lock is still held, so a resume
/// signal can never slip in between arming and waiting.
pub(crate) struct PauseGate {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl PauseGate {
    pub(crate) fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Clears any stale signal from a previous pause cycle.
    pub(crate) fn arm(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(|p| p.into_inner());
        *signaled = false;
    }

    /// Blocks until [`release`](Self::release) runs. Returns immediately if
    /// it already has since the last [`arm`](Self::arm).
    pub(crate) fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(|p| p.into_inner());
        while !*signaled {
            signaled = self
                .cond
                .wait(signaled)
                .unwrap_or_else(|p| p.into_inner());
        }
    }

    pub(crate) fn release(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(|p| p.into_inner());
        *signaled = true;
        self.cond.notify_all();
    }
}

/// State of one HTTP exchange flowing through a plugin.
pub(crate) struct ExchangeState {
    pub adaptor: Box<dyn HttpRequestAdaptor>,
    pub request_body: BodyState,
    pub response_body: BodyState,
    pub action: Action,
    pub send_response: Option<LocalResponse>,
    pub properties: HashMap<Vec<String>, Vec<u8>>,
    pub gate: std::sync::Arc<PauseGate>,
}

impl ExchangeState {
    pub(crate) fn new(adaptor: Box<dyn HttpRequestAdaptor>) -> Self {
        Self {
            adaptor,
            request_body: BodyState::Absent,
            response_body: BodyState::Absent,
            action: Action::Continue,
            send_response: None,
            properties: HashMap::new(),
            gate: std::sync::Arc::new(PauseGate::new()),
        }
    }
}

/// State of one TCP stream flowing through a plugin.
pub(crate) struct StreamState {
    pub downstream_data: Option<Vec<u8>>,
    pub upstream_data: Option<Vec<u8>>,
    pub action: Action,
    pub properties: HashMap<Vec<String>, Vec<u8>>,
    pub gate: std::sync::Arc<PauseGate>,
}

impl StreamState {
    pub(crate) fn new() -> Self {
        Self {
            downstream_data: None,
            upstream_data: None,
            action: Action::Continue,
            properties: HashMap::new(),
            gate: std::sync::Arc::new(PauseGate::new()),
        }
    }
}

/// One HTTP request/response pair flowing through a plugin.
///
/// Entry points run the matching guest callback under the plugin lock. When
/// the guest pauses, the calling thread blocks on the exchange's gate until
/// a later delivery (a call completion, a tick) resumes it, then the pending
/// local response, if any, is consumed into the outcome.
pub struct HttpExchange {
    core: Arc<crate::plugin::PluginCore>,
    id: u32,
    gate: Arc<PauseGate>,
}

impl HttpExchange {
    pub(crate) fn new(
        core: Arc<crate::plugin::PluginCore>,
        id: u32,
        gate: Arc<PauseGate>,
    ) -> Self {
        Self { core, id, gate }
    }

    pub fn context_id(&self) -> u32 {
        self.id
    }

    fn run(
        &self,
        deliver: impl FnOnce(&mut PluginVm, u32) -> anyhow::Result<Action>,
    ) -> anyhow::Result<FilterOutcome> {
        let mut vm = self.core.lock();
        let action = deliver(&mut vm, self.id)?;
        if action == Action::Pause && vm.pause_gate_if_needed(self.id).is_some() {
            drop(vm);
            self.gate.wait();
            vm = self.core.lock();
        }
        Ok(match vm.consume_send_response(self.id) {
            Some(response) => FilterOutcome::LocalResponse(response),
            None => FilterOutcome::Continue,
        })
    }

    pub fn on_request_headers(&self, end_of_stream: bool) -> anyhow::Result<FilterOutcome> {
        self.run(|vm, id| vm.call_on_request_headers(id, end_of_stream))
    }

    pub fn on_request_body(&self, end_of_stream: bool) -> anyhow::Result<FilterOutcome> {
        self.run(|vm, id| vm.call_on_request_body(id, end_of_stream))
    }

    pub fn on_request_trailers(&self) -> anyhow::Result<FilterOutcome> {
        self.run(|vm, id| vm.call_on_request_trailers(id))
    }

    pub fn on_response_headers(&self, end_of_stream: bool) -> anyhow::Result<FilterOutcome> {
        self.run(|vm, id| vm.call_on_response_headers(id, end_of_stream))
    }

    pub fn on_response_body(&self, end_of_stream: bool) -> anyhow::Result<FilterOutcome> {
        self.run(|vm, id| vm.call_on_response_body(id, end_of_stream))
    }

    pub fn on_response_trailers(&self) -> anyhow::Result<FilterOutcome> {
        self.run(|vm, id| vm.call_on_response_trailers(id))
    }

    pub fn set_request_body(&self, body: Vec<u8>) {
        self.core
            .lock()
            .with_exchange(self.id, |e| e.request_body.set(body));
    }

    /// Hands over a loader instead of bytes; it only runs if the guest (or
    /// the body callback) actually reads the body.
    pub fn set_request_body_loader(&self, loader: Box<dyn FnOnce() -> Vec<u8> + Send>) {
        self.core
            .lock()
            .with_exchange(self.id, |e| e.request_body = BodyState::Deferred(loader));
    }

    pub fn set_response_body(&self, body: Vec<u8>) {
        self.core
            .lock()
            .with_exchange(self.id, |e| e.response_body.set(body));
    }

    pub fn set_response_body_loader(&self, loader: Box<dyn FnOnce() -> Vec<u8> + Send>) {
        self.core
            .lock()
            .with_exchange(self.id, |e| e.response_body = BodyState::Deferred(loader));
    }

    /// The request body as the guest left it. `None` when it was never
    /// loaded, meaning the server forwards the original.
    pub fn take_request_body(&self) -> Option<Vec<u8>> {
        self.core
            .lock()
            .with_exchange(self.id, |e| e.request_body.take())
            .flatten()
    }

    pub fn take_response_body(&self) -> Option<Vec<u8>> {
        self.core
            .lock()
            .with_exchange(self.id, |e| e.response_body.take())
            .flatten()
    }

    /// Closes the exchange context. The guest may defer teardown by
    /// returning false from `proxy_on_done` and calling `proxy_done` later.
    pub fn close(&self) -> anyhow::Result<()> {
        self.core.lock().close_context(self.id)
    }
}

/// One TCP stream flowing through a plugin.
pub struct NetworkStream {
    core: Arc<crate::plugin::PluginCore>,
    id: u32,
    gate: Arc<PauseGate>,
}

impl NetworkStream {
    pub(crate) fn new(
        core: Arc<crate::plugin::PluginCore>,
        id: u32,
        gate: Arc<PauseGate>,
    ) -> Self {
        Self { core, id, gate }
    }

    pub fn context_id(&self) -> u32 {
        self.id
    }

    fn run(
        &self,
        deliver: impl FnOnce(&mut PluginVm, u32) -> anyhow::Result<Action>,
    ) -> anyhow::Result<Action> {
        let mut vm = self.core.lock();
        let action = deliver(&mut vm, self.id)?;
        if action == Action::Pause && vm.pause_gate_if_needed(self.id).is_some() {
            drop(vm);
            self.gate.wait();
            vm = self.core.lock();
        }
        Ok(vm
            .with_stream(self.id, |s| s.action)
            .unwrap_or(Action::Continue))
    }

    pub fn on_new_connection(&self) -> anyhow::Result<Action> {
        self.run(|vm, id| vm.call_on_new_connection(id))
    }

    pub fn on_downstream_data(
        &self,
        data: Vec<u8>,
        end_of_stream: bool,
    ) -> anyhow::Result<Action> {
        {
            let mut vm = self.core.lock();
            vm.with_stream(self.id, |s| s.downstream_data = Some(data));
        }
        self.run(|vm, id| vm.call_on_downstream_data(id, end_of_stream))
    }

    pub fn on_upstream_data(&self, data: Vec<u8>, end_of_stream: bool) -> anyhow::Result<Action> {
        {
            let mut vm = self.core.lock();
            vm.with_stream(self.id, |s| s.upstream_data = Some(data));
        }
        self.run(|vm, id| vm.call_on_upstream_data(id, end_of_stream))
    }

    /// The downstream buffer as the guest left it.
    pub fn take_downstream_data(&self) -> Option<Vec<u8>> {
        self.core
            .lock()
            .with_stream(self.id, |s| s.downstream_data.take())
            .flatten()
    }

    pub fn take_upstream_data(&self) -> Option<Vec<u8>> {
        self.core
            .lock()
            .with_stream(self.id, |s| s.upstream_data.take())
            .flatten()
    }

    pub fn on_downstream_close(&self, peer_type: u32) -> anyhow::Result<()> {
        self.core
            .lock()
            .call_on_downstream_connection_close(self.id, peer_type)
    }

    pub fn on_upstream_close(&self, peer_type: u32) -> anyhow::Result<()> {
        self.core
            .lock()
            .call_on_upstream_connection_close(self.id, peer_type)
    }

    pub fn close(&self) -> anyhow::Result<()> {
        self.core.lock().close_context(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn deferred_body_loads_once() {
        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        let mut body = BodyState::Deferred(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            b"lazy".to_vec()
        }));

        assert_eq!(body.force(), Some(&b"lazy"[..]));
        assert_eq!(body.len(), 4);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn absent_body_has_zero_length() {
        let mut body = BodyState::Absent;
        assert_eq!(body.force(), None);
        assert_eq!(body.len(), 0);
    }

    #[test]
    fn gate_release_before_wait_is_not_lost() {
        let gate = PauseGate::new();
        gate.arm();
        gate.release();
        // Must return immediately.
        gate.wait();
    }

    #[test]
    fn gate_wakes_waiting_thread() {
        let gate = Arc::new(PauseGate::new());
        gate.arm();
        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait())
        };
        thread::sleep(Duration::from_millis(20));
        gate.release();
        waiter.join().unwrap();
    }

    #[test]
    fn arm_clears_previous_signal() {
        let gate = Arc::new(PauseGate::new());
        gate.release();
        gate.arm();
        let waiter = {
            let gate = gate.clone();
            thread::spawn(move || gate.wait())
        };
        thread::sleep(Duration::from_millis(20));
        gate.release();
        waiter.join().unwrap();
    }
}
