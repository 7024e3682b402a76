//! Instance pooling.
//!
//! A shared pool lazily starts one instance and hands the same one to every
//! borrower, so guest state (memory, counters) persists across requests. A
//! per-request pool starts a fresh instance per borrow and tears it down on
//! release, giving each request a clean slate.

use std::sync::Mutex;

use crate::error::StartError;
use crate::plugin::Plugin;

pub type PluginFactory = Box<dyn Fn() -> Result<Plugin, StartError> + Send + Sync>;

enum Mode {
    Shared(Mutex<Option<Plugin>>),
    PerRequest,
}

pub struct Pool {
    factory: PluginFactory,
    mode: Mode,
}

impl Pool {
    pub fn shared(factory: PluginFactory) -> Pool {
        Pool {
            factory,
            mode: Mode::Shared(Mutex::new(None)),
        }
    }

    pub fn per_request(factory: PluginFactory) -> Pool {
        Pool {
            factory,
            mode: Mode::PerRequest,
        }
    }

    /// Hands out a started instance. The first borrow of a shared pool pays
    /// for the start; a start failure leaves the slot empty so the next
    /// borrow retries.
    pub fn borrow(&self) -> Result<Plugin, StartError> {
        match &self.mode {
            Mode::Shared(slot) => {
                let mut slot = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if let Some(plugin) = slot.as_ref() {
                    return Ok(plugin.clone());
                }
                let plugin = (self.factory)()?;
                *slot = Some(plugin.clone());
                Ok(plugin)
            }
            Mode::PerRequest => (self.factory)(),
        }
    }

    pub fn release(&self, plugin: Plugin) {
        match &self.mode {
            Mode::Shared(_) => {}
            Mode::PerRequest => plugin.close(),
        }
    }

    /// Closes the cached instance of a shared pool. Per-request pools hold
    /// nothing between borrows.
    pub fn close(&self) {
        if let Mode::Shared(slot) = &self.mode {
            let plugin = slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            if let Some(plugin) = plugin {
                plugin.close();
            }
        }
    }
}
