use std::collections::HashMap;
use std::sync::RwLock;

use crate::channels::Channel;

/// Channels owned by one endpoint, keyed by channel name.
///
/// Locks are held only for the map operation itself, never while a handler
/// runs, so handlers may freely send on other channels.
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Channel>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `channel` under `name`, returning the entry it replaced.
    pub fn register(&self, name: impl Into<String>, channel: Channel) -> Option<Channel> {
        self.channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.into(), channel)
    }

    pub fn get(&self, name: &str) -> Option<Channel> {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Channel> {
        self.channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name)
    }

    /// Removes `name` only while it still refers to channel `id`.
    pub fn remove_instance(&self, name: &str, id: u64) -> bool {
        let mut channels = self
            .channels
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match channels.get(name) {
            Some(channel) if channel.id() == id => {
                channels.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.channels
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
