//! Registry of live guest contexts and their close/delete state.
//!
//! Context ids are handed out once and never reused within a VM. The
//! two-phase close flags track the split between "the guest was asked to
//! finish" and "logging and deletion ran"; the transition logic itself
//! lives with the VM, which is the only place that can call back into the
//! guest.

use std::collections::HashMap;

use crate::exchange::{ExchangeState, StreamState};

pub(crate) enum ContextKind {
    Plugin,
    HttpExchange(Box<ExchangeState>),
    NetworkStream(Box<StreamState>),
}

pub(crate) struct ContextSlot {
    pub close_started: bool,
    pub close_done: bool,
    pub kind: ContextKind,
}

impl ContextSlot {
    fn new(kind: ContextKind) -> Self {
        Self {
            close_started: false,
            close_done: false,
            kind,
        }
    }

    pub(crate) fn exchange_mut(&mut self) -> Option<&mut ExchangeState> {
        match &mut self.kind {
            ContextKind::HttpExchange(state) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn stream_mut(&mut self) -> Option<&mut StreamState> {
        match &mut self.kind {
            ContextKind::NetworkStream(state) => Some(state),
            _ => None,
        }
    }
}

pub(crate) struct ContextRegistry {
    slots: HashMap<u32, ContextSlot>,
    next_id: u32,
}

impl ContextRegistry {
    pub(crate) fn new() -> Self {
        Self {
            slots: HashMap::new(),
            next_id: 1,
        }
    }

    /// Inserts a new context and returns its freshly allocated id.
    pub(crate) fn allocate(&mut self, kind: ContextKind) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(id, ContextSlot::new(kind));
        id
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.slots.contains_key(&id)
    }

    pub(crate) fn get_mut(&mut self, id: u32) -> Option<&mut ContextSlot> {
        self.slots.get_mut(&id)
    }

    pub(crate) fn remove(&mut self, id: u32) -> Option<ContextSlot> {
        self.slots.remove(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_sequential_and_not_reused() {
        let mut registry = ContextRegistry::new();
        let first = registry.allocate(ContextKind::Plugin);
        let second = registry.allocate(ContextKind::NetworkStream(Box::new(StreamState::new())));
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        registry.remove(first);
        let third = registry.allocate(ContextKind::Plugin);
        assert_eq!(third, 3);
        assert!(!registry.contains(first));
        assert!(registry.contains(second));
    }
}
