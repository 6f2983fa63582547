//! Per-relay subscription bookkeeping.

use nostr::Filter;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Subscription ids and the filters that created them, keyed by relay URL.
///
/// Each method takes the lock once, so readers never see half of an update.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    relays: RwLock<HashMap<String, HashMap<String, Filter>>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, HashMap<String, Filter>>> {
        self.relays.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, HashMap<String, Filter>>> {
        self.relays.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, relay_url: &str, id: impl Into<String>, filter: Filter) {
        self.write()
            .entry(relay_url.to_string())
            .or_default()
            .insert(id.into(), filter);
    }

    pub fn remove(&self, relay_url: &str, id: &str) -> Option<Filter> {
        let mut relays = self.write();
        let subscriptions = relays.get_mut(relay_url)?;
        let removed = subscriptions.remove(id);
        if subscriptions.is_empty() {
            relays.remove(relay_url);
        }
        removed
    }

    /// Ids on `relay_url` whose filter is structurally equal to `filter`.
    pub fn find_by_filter(&self, relay_url: &str, filter: &Filter) -> Vec<String> {
        self.read()
            .get(relay_url)
            .map(|subscriptions| {
                subscriptions
                    .iter()
                    .filter(|(_, recorded)| *recorded == filter)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot of `id -> filter` for one relay.
    pub fn filters_of(&self, relay_url: &str) -> HashMap<String, Filter> {
        self.read().get(relay_url).cloned().unwrap_or_default()
    }

    /// Move the filter recorded under `old_id` to `new_id`.
    ///
    /// Returns `false` if `old_id` is no longer recorded.
    pub fn replace(&self, relay_url: &str, old_id: &str, new_id: impl Into<String>) -> bool {
        let mut relays = self.write();
        let Some(subscriptions) = relays.get_mut(relay_url) else {
            return false;
        };
        match subscriptions.remove(old_id) {
            Some(filter) => {
                subscriptions.insert(new_id.into(), filter);
                true
            }
            None => false,
        }
    }

    /// Drop every subscription recorded for `relay_url`, returning them.
    pub fn remove_relay(&self, relay_url: &str) -> HashMap<String, Filter> {
        self.write().remove(relay_url).unwrap_or_default()
    }

    pub fn len(&self, relay_url: &str) -> usize {
        self.read().get(relay_url).map_or(0, HashMap::len)
    }
}
