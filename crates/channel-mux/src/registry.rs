//! Channel → callback bookkeeping.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::protocol::InboundMessage;

/// Subscriber callback invoked once per inbound frame on its channel.
pub type ChannelCallback = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// Registered callbacks keyed by channel.
///
/// Every registration gets its own id, so registering the same callback twice
/// yields two independent entries. Channels with no callbacks left are pruned.
#[derive(Default)]
pub(crate) struct ChannelRegistry {
    next_id: u64,
    channels: HashMap<String, Vec<(u64, ChannelCallback)>>,
}

impl ChannelRegistry {
    pub fn add(&mut self, channel: &str, callback: ChannelCallback) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.channels
            .entry(channel.to_string())
            .or_default()
            .push((id, callback));
        id
    }

    /// Remove one registration. Returns false if it was already gone.
    pub fn remove(&mut self, channel: &str, id: u64) -> bool {
        let Some(entries) = self.channels.get_mut(channel) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            self.channels.remove(channel);
        }
        removed
    }

    /// Copy of the callbacks currently registered for `channel`.
    pub fn snapshot(&self, channel: &str) -> Vec<ChannelCallback> {
        self.channels
            .get(channel)
            .map(|entries| entries.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }

    pub fn channel_counts(&self) -> BTreeMap<String, usize> {
        self.channels
            .iter()
            .map(|(channel, entries)| (channel.clone(), entries.len()))
            .collect()
    }
}
