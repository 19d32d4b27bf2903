//! Local mirror of the hub's subscription set.
//!
//! Tracks which device IDs the session has asked the hub for, so the set
//! can be replayed after a reconnect.

use std::collections::BTreeSet;

use super::messages::HubCommand;

/// Manages the set of device subscriptions for a single hub session.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionManager {
    /// Subscribed device IDs. If `subscribe_all` is true, this set is ignored.
    device_ids: BTreeSet<String>,
    /// Whether `subscribeAll` was sent.
    subscribe_all: bool,
}

impl SubscriptionManager {
    /// Creates a new empty subscription manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds device IDs to the subscription set.
    pub fn subscribe<S: AsRef<str>>(&mut self, ids: &[S]) {
        for id in ids {
            self.device_ids.insert(id.as_ref().to_string());
        }
    }

    /// Enables the wildcard subscription.
    pub fn subscribe_all(&mut self) {
        self.subscribe_all = true;
    }

    /// Removes device IDs from the subscription set.
    pub fn unsubscribe<S: AsRef<str>>(&mut self, ids: &[S]) {
        for id in ids {
            self.device_ids.remove(id.as_ref());
        }
    }

    /// Returns the number of explicitly subscribed device IDs.
    #[must_use]
    pub fn count(&self) -> usize {
        self.device_ids.len()
    }

    /// Returns `true` if the wildcard subscription is active.
    #[must_use]
    pub fn is_subscribed_all(&self) -> bool {
        self.subscribe_all
    }

    /// Explicitly subscribed device IDs, sorted.
    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.device_ids.iter().map(String::as_str)
    }

    /// Commands that restore this subscription set on a fresh stream.
    #[must_use]
    pub fn replay_commands(&self) -> Vec<HubCommand> {
        let mut commands = Vec::new();
        if self.subscribe_all {
            commands.push(HubCommand::subscribe_all());
        }
        if !self.device_ids.is_empty() {
            commands.push(HubCommand::subscribe(
                self.device_ids.iter().cloned().collect(),
            ));
        }
        commands
    }
}
