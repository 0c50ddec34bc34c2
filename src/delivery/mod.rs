//! Picks what is due for transmission and reconciles server acknowledgements.
//!
//! The engine is transport agnostic: batches produced here go out over the
//! websocket or the fallback poller, and responses from either are fed back
//! through [`DeliveryEngine::reconcile`].

use crate::config::ResendOrder;
use crate::queue::QueueStore;
use crate::wire::{DecodedBatch, InboundMessage, Notification, OutboundMessage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime counters for operational visibility.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DeliveryStats {
    /// Delivery messages handed to a transport, resends included.
    pub items_sent_total: u64,
    /// Subset of `items_sent_total` that were resends after a timeout.
    pub resends_total: u64,
    /// Acknowledgements that removed a pending item.
    pub acks_total: u64,
    /// Acknowledgements whose correlation id matched nothing.
    pub unknown_acks_total: u64,
    /// Notifications routed to a registered callback.
    pub notifications_total: u64,
    /// Notifications for channels without a listener.
    pub notifications_dropped_total: u64,
    /// Inbound entries or frames dropped as malformed.
    pub malformed_total: u64,
    /// Items evicted by queue size limits.
    pub evictions_total: u64,
    /// Items dropped by queue age limits.
    pub expirations_total: u64,
    pub socket_connects_total: u64,
    pub socket_disconnects_total: u64,
    pub polls_total: u64,
    pub poll_failures_total: u64,
}

#[derive(Debug)]
pub struct DeliveryEngine {
    next_correlation_id: u64,
    resend_timeout: chrono::Duration,
    order: ResendOrder,
    stats: DeliveryStats,
}

impl DeliveryEngine {
    pub fn new(resend_timeout: Duration, order: ResendOrder) -> Self {
        Self {
            next_correlation_id: 1,
            resend_timeout: chrono::Duration::from_std(resend_timeout)
                .unwrap_or(chrono::Duration::MAX),
            order,
            stats: DeliveryStats::default(),
        }
    }

    pub fn stats(&self) -> DeliveryStats {
        self.stats
    }

    pub fn stats_mut(&mut self) -> &mut DeliveryStats {
        &mut self.stats
    }

    fn next_correlation_id(&mut self) -> u64 {
        let id = self.next_correlation_id;
        self.next_correlation_id += 1;
        id
    }

    /// Select every item never sent or sent longer ago than the resend
    /// timeout, stamp it with a fresh correlation id and return the batch.
    /// Earlier ids of a resent item stay valid for acknowledgement.
    pub fn compute_due_items(
        &mut self,
        queues: &mut QueueStore,
        now: DateTime<Utc>,
    ) -> Vec<OutboundMessage> {
        self.stats.expirations_total += queues.purge_expired(now) as u64;

        let mut due = Vec::new();
        for queue in queues.queues_mut() {
            for item in &mut queue.items {
                let is_due = match item.last_sent_at {
                    None => true,
                    Some(sent) => now - sent >= self.resend_timeout,
                };
                if !is_due {
                    continue;
                }
                if item.last_sent_at.is_some() {
                    self.stats.resends_total += 1;
                }
                let correlation_id = self.next_correlation_id();
                item.correlation_ids.push(correlation_id);
                item.last_sent_at = Some(now);
                due.push((
                    item.timestamp,
                    OutboundMessage::Delivery {
                        correlation_id,
                        elapsed_ms: item.elapsed_ms(now),
                        queue: queue.name.clone(),
                        payload: item.payload.clone(),
                    },
                ));
            }
        }

        // Stable sort keeps queue order for items enqueued at the same instant.
        match self.order {
            ResendOrder::OldestFirst => due.sort_by_key(|(created, _)| *created),
            ResendOrder::NewestFirst => due.sort_by(|(a, _), (b, _)| b.cmp(a)),
        }

        self.stats.items_sent_total += due.len() as u64;
        due.into_iter().map(|(_, message)| message).collect()
    }

    /// Apply a response batch: acknowledged items leave their queue,
    /// notifications are returned for routing. Items absent from the batch
    /// stay pending until their resend timeout elapses.
    pub fn reconcile(&mut self, queues: &mut QueueStore, batch: DecodedBatch) -> Vec<Notification> {
        self.stats.malformed_total += batch.malformed as u64;

        let mut notifications = Vec::new();
        let mut removed_any = false;
        for message in batch.messages {
            match message {
                InboundMessage::Ack { correlation_id, .. } => {
                    if queues.acknowledge(correlation_id) {
                        self.stats.acks_total += 1;
                        removed_any = true;
                    } else {
                        tracing::debug!("Ack for unknown correlation id {correlation_id}");
                        self.stats.unknown_acks_total += 1;
                    }
                }
                InboundMessage::Notification(notification) => notifications.push(notification),
                InboundMessage::Control { tag, .. } => {
                    tracing::debug!("Ignoring inbound control message '{tag}'");
                }
            }
        }

        if removed_any {
            queues.persist();
        }
        notifications
    }
}
