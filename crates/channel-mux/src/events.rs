//! Manager-level listeners for connection-state and channel-list changes.

use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crate::types::ConnectionState;

pub type StatusListener = Arc<dyn Fn(ConnectionState) + Send + Sync>;
pub type ChannelListListener = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Id-keyed listener list. Ids are never reused.
pub(crate) struct ListenerSet<L> {
    next_id: u64,
    listeners: BTreeMap<u64, L>,
}

impl<L> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            next_id: 0,
            listeners: BTreeMap::new(),
        }
    }
}

impl<L: Clone> ListenerSet<L> {
    pub fn add(&mut self, listener: L) -> u64 {
        self.next_id += 1;
        self.listeners.insert(self.next_id, listener);
        self.next_id
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.listeners.remove(&id).is_some()
    }

    pub fn snapshot(&self) -> Vec<L> {
        self.listeners.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }
}

#[derive(Default)]
pub(crate) struct EventBus {
    pub status: ListenerSet<StatusListener>,
    pub channel_list: ListenerSet<ChannelListListener>,
}

/// A listener notification captured under the manager lock and delivered
/// after it is released, in the order it was captured.
pub(crate) enum Notice {
    Status(Vec<StatusListener>, ConnectionState),
    ChannelList(Vec<ChannelListListener>, Vec<String>),
}

impl Notice {
    pub(crate) fn deliver(self) {
        match self {
            Notice::Status(listeners, state) => notify_status(listeners, state),
            Notice::ChannelList(listeners, channels) => notify_channel_list(listeners, &channels),
        }
    }
}

/// Run a user callback, containing any panic it raises.
///
/// Returns false if the callback panicked.
pub(crate) fn invoke_isolated(what: &str, f: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::warn!(callback = what, %reason, "callback panicked");
            false
        }
    }
}

pub(crate) fn notify_status(listeners: Vec<StatusListener>, state: ConnectionState) {
    for listener in listeners {
        invoke_isolated("status listener", || listener(state));
    }
}

pub(crate) fn notify_channel_list(listeners: Vec<ChannelListListener>, channels: &[String]) {
    for listener in listeners {
        invoke_isolated("channel-list listener", || listener(channels));
    }
}
