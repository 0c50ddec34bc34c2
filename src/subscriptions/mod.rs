//! Channel registry: at most one listener per channel, replace on re-register.

use crate::wire::{Notification, OutboundMessage};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Callback invoked with `(payload, channel)` for each push notification.
pub type NotificationCallback = Arc<dyn Fn(&Value, &str) + Send + Sync>;

/// Current registration of a channel.
#[derive(Clone)]
pub struct ListenerInfo {
    pub channel: String,
    pub initial_query: Value,
    callback: NotificationCallback,
}

impl ListenerInfo {
    pub fn new(channel: impl Into<String>, initial_query: Value, callback: NotificationCallback) -> Self {
        // The wire format expects an object; anything else is sent as `{}`.
        let initial_query = if initial_query.is_object() {
            initial_query
        } else {
            Value::Object(Map::new())
        };
        Self {
            channel: channel.into(),
            initial_query,
            callback,
        }
    }

    pub fn subscribe_message(&self) -> OutboundMessage {
        OutboundMessage::Subscribe {
            channel: self.channel.clone(),
            initial_query: self.initial_query.clone(),
        }
    }
}

impl fmt::Debug for ListenerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerInfo")
            .field("channel", &self.channel)
            .field("initial_query", &self.initial_query)
            .finish_non_exhaustive()
    }
}

/// A notification matched to its callback, ready to run outside any lock.
pub struct Dispatch {
    callback: NotificationCallback,
    notification: Notification,
}

impl Dispatch {
    pub fn deliver(self) {
        (self.callback)(&self.notification.payload, &self.notification.channel);
    }
}

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    listeners: BTreeMap<String, ListenerInfo>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`, returning the registration it replaced.
    pub fn subscribe(&mut self, listener: ListenerInfo) -> Option<ListenerInfo> {
        self.listeners.insert(listener.channel.clone(), listener)
    }

    pub fn unsubscribe(&mut self, channel: &str) -> Option<ListenerInfo> {
        self.listeners.remove(channel)
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.listeners.contains_key(channel)
    }

    pub fn has_subscriptions(&self) -> bool {
        !self.listeners.is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn channels(&self) -> Vec<String> {
        self.listeners.keys().cloned().collect()
    }

    /// `_sub` messages for every registered channel, sent on each new
    /// connection and each poll.
    pub fn subscription_messages(&self) -> Vec<OutboundMessage> {
        self.listeners
            .values()
            .map(ListenerInfo::subscribe_message)
            .collect()
    }

    /// Match notifications to callbacks. Notifications for channels without a
    /// listener are dropped; the count of dropped ones is returned alongside.
    pub fn route(&self, notifications: Vec<Notification>) -> (Vec<Dispatch>, usize) {
        let mut dispatches = Vec::with_capacity(notifications.len());
        let mut dropped = 0;
        for notification in notifications {
            match self.listeners.get(&notification.channel) {
                Some(listener) => dispatches.push(Dispatch {
                    callback: Arc::clone(&listener.callback),
                    notification,
                }),
                None => {
                    tracing::debug!(
                        "Dropping notification for unsubscribed channel '{}'",
                        notification.channel
                    );
                    dropped += 1;
                }
            }
        }
        (dispatches, dropped)
    }
}
