//! Change-notification registry.
//!
//! Subscriptions are layer-agnostic: a watch on `(group, name)` matches a
//! mutation of that key in any layer. The registry is a two-level map,
//! group then name, so delivery work is proportional to the number of
//! matching subscribers. Each subscription remembers the msgid of the
//! `NOTIFY` request that created it; every `CHANGED` frame delivered for
//! it reuses that msgid as its correlation id.
//!
//! A subscription may be registered before its group exists; it simply
//! matches nothing until the first change arrives.

use std::collections::HashMap;
use std::os::fd::RawFd;

use tracing::debug;

const NOTIFY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::notify");

/// One registered watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    /// Descriptor of the subscribed client.
    pub fd: RawFd,
    /// Correlation id of the originating `NOTIFY` request.
    pub msgid: u64,
}

/// Registry of `(group, name) → subscribers`.
#[derive(Debug, Default)]
pub struct Notifier {
    watches: HashMap<String, HashMap<Option<String>, Vec<Subscription>>>,
}

impl Notifier {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a watch.
    ///
    /// Returns `false` when the client already watches this key; the
    /// existing registration, and its msgid, stay in place.
    pub fn subscribe(
        &mut self,
        group: &str,
        name: Option<&str>,
        subscription: Subscription,
    ) -> bool {
        let subscribers = self
            .watches
            .entry(group.to_string())
            .or_default()
            .entry(name.map(str::to_string))
            .or_default();
        if subscribers
            .iter()
            .any(|existing| existing.fd == subscription.fd)
        {
            return false;
        }
        debug!(
            target: NOTIFY_TARGET,
            group,
            name = name.unwrap_or_default(),
            fd = subscription.fd,
            msgid = subscription.msgid,
            "subscription registered"
        );
        subscribers.push(subscription);
        true
    }

    /// Removes a client's watch on a key, returning the msgid of the
    /// retracted registration.
    pub fn unsubscribe(&mut self, group: &str, name: Option<&str>, fd: RawFd) -> Option<u64> {
        let names = self.watches.get_mut(group)?;
        let subscribers = names.get_mut(&name.map(str::to_string))?;
        let position = subscribers.iter().position(|existing| existing.fd == fd)?;
        let removed = subscribers.swap_remove(position);
        if subscribers.is_empty() {
            names.remove(&name.map(str::to_string));
            if names.is_empty() {
                self.watches.remove(group);
            }
        }
        debug!(
            target: NOTIFY_TARGET,
            group,
            name = name.unwrap_or_default(),
            fd,
            msgid = removed.msgid,
            "subscription retracted"
        );
        Some(removed.msgid)
    }

    /// Returns the subscribers watching `(group, name)`.
    #[must_use]
    pub fn subscribers(&self, group: &str, name: Option<&str>) -> Vec<Subscription> {
        self.watches
            .get(group)
            .and_then(|names| names.get(&name.map(str::to_string)))
            .cloned()
            .unwrap_or_default()
    }

    /// Retracts every watch held by a disconnecting client.
    pub fn drop_client(&mut self, fd: RawFd) {
        self.watches.retain(|_, names| {
            names.retain(|_, subscribers| {
                subscribers.retain(|subscription| subscription.fd != fd);
                !subscribers.is_empty()
            });
            !names.is_empty()
        });
    }

    /// Returns the total number of registered watches.
    #[must_use]
    pub fn len(&self) -> usize {
        self.watches
            .values()
            .flat_map(HashMap::values)
            .map(Vec::len)
            .sum()
    }

    /// Returns `true` when nothing is watched.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }
}
