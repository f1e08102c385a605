//! Local-client subscriptions, coalesced into one remote subscription per characteristic

use std::collections::{BTreeSet, HashMap};

use crate::gatt::{CharacteristicId, ClientId};

/// Map from characteristic to the local clients subscribed to it
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscribers: HashMap<CharacteristicId, BTreeSet<ClientId>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber. Returns true when the set went from empty to non-empty.
    pub fn subscribe(&mut self, characteristic: CharacteristicId, client: ClientId) -> bool {
        let set = self.subscribers.entry(characteristic).or_default();
        let was_empty = set.is_empty();
        set.insert(client);
        was_empty
    }

    /// Remove a subscriber. Returns true when the set went from non-empty to empty.
    pub fn unsubscribe(&mut self, characteristic: &CharacteristicId, client: &ClientId) -> bool {
        let Some(set) = self.subscribers.get_mut(characteristic) else {
            return false;
        };
        if !set.remove(client) {
            return false;
        }
        if set.is_empty() {
            self.subscribers.remove(characteristic);
            return true;
        }
        false
    }

    /// Clients subscribed to a characteristic
    pub fn subscribers(&self, characteristic: &CharacteristicId) -> Vec<ClientId> {
        self.subscribers
            .get(characteristic)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any client is subscribed to the characteristic
    pub fn is_subscribed(&self, characteristic: &CharacteristicId) -> bool {
        self.subscribers.contains_key(characteristic)
    }

    /// Number of characteristics with at least one subscriber
    pub fn subscribed_characteristics(&self) -> usize {
        self.subscribers.len()
    }

    /// Forget every subscription
    pub fn clear(&mut self) {
        self.subscribers.clear();
    }
}
