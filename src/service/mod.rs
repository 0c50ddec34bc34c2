//! The `Outpost` service: queues, subscriptions and the delivery loop.
//!
//! Application calls are synchronous and only touch shared state behind a
//! mutex; all network work happens on the loop task started by
//! [`Outpost::start`].

mod driver;

use crate::config::Config;
use crate::delivery::{DeliveryEngine, DeliveryStats};
use crate::error::OutpostError;
use crate::queue::{QueueLimits, QueueStore};
use crate::store::{create_store, PersistentStore};
use crate::subscriptions::{ChannelRegistry, ListenerInfo, NotificationCallback};
use crate::transport::{
    HttpPollClient, PollClient, PollPolicy, SocketChannel, SocketConnector, TungsteniteConnector,
};
use crate::wire::OutboundMessage;
use chrono::Utc;
use driver::{Driver, DriverSettings};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Transport currently carrying traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveTransport {
    Socket,
    Poller,
    Offline,
}

/// Everything application calls and the loop both touch.
pub(crate) struct CoreState {
    pub(crate) queues: QueueStore,
    pub(crate) engine: DeliveryEngine,
    pub(crate) registry: ChannelRegistry,
    /// Mirrors the loop's socket state so callers know whether control
    /// messages can go out right away.
    pub(crate) socket_open: bool,
    pub(crate) control_outbox: Vec<OutboundMessage>,
    pub(crate) force_poll_requested: bool,
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<CoreState>,
    pub(crate) wake: Notify,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Assembles an [`Outpost`]; every collaborator can be swapped out.
pub struct OutpostBuilder {
    config: Config,
    store: Option<Arc<dyn PersistentStore>>,
    connector: Option<Arc<dyn SocketConnector>>,
    poll_client: Option<Arc<dyn PollClient>>,
}

impl OutpostBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            store: None,
            connector: None,
            poll_client: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn socket_connector(mut self, connector: Arc<dyn SocketConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn poll_client(mut self, client: Arc<dyn PollClient>) -> Self {
        self.poll_client = Some(client);
        self
    }

    pub fn build(self) -> Result<Outpost, OutpostError> {
        let config = self.config;
        config.validate().map_err(OutpostError::InvalidConfig)?;

        let connector = if config.socket.enabled {
            Some(self.connector.unwrap_or_else(|| {
                Arc::new(TungsteniteConnector::new(config.socket.connect_timeout()))
                    as Arc<dyn SocketConnector>
            }))
        } else {
            None
        };

        let poll_client = if config.poller.enabled {
            match self.poll_client {
                Some(client) => Some(client),
                None => {
                    let client = HttpPollClient::new(
                        config.endpoints.poll_url.clone(),
                        config.poller.request_timeout(),
                    )
                    .map_err(|e| OutpostError::InvalidConfig(format!("{e:#}")))?;
                    Some(Arc::new(client) as Arc<dyn PollClient>)
                }
            }
        } else {
            None
        };

        let store = self
            .store
            .unwrap_or_else(|| create_store(&config.storage, &config.state_dir));

        let state = CoreState {
            queues: QueueStore::new(store),
            engine: DeliveryEngine::new(
                config.delivery.resend_timeout(),
                config.delivery.resend_order,
            ),
            registry: ChannelRegistry::new(),
            socket_open: false,
            control_outbox: Vec::new(),
            force_poll_requested: false,
        };

        Ok(Outpost {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                wake: Notify::new(),
            }),
            connector,
            poll_client,
            running: Mutex::new(None),
        })
    }
}

/// Client-side delivery service.
pub struct Outpost {
    config: Config,
    shared: Arc<Shared>,
    connector: Option<Arc<dyn SocketConnector>>,
    poll_client: Option<Arc<dyn PollClient>>,
    running: Mutex<Option<Running>>,
}

impl Outpost {
    pub fn builder(config: Config) -> OutpostBuilder {
        OutpostBuilder::new(config)
    }

    pub fn from_config(config: Config) -> Result<Self, OutpostError> {
        OutpostBuilder::new(config).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a named queue and get a handle for feeding it. Items
    /// persisted under the same name by an earlier run are restored.
    pub fn create_queue(&self, name: &str, limits: QueueLimits) -> Result<Enqueuer, OutpostError> {
        self.shared.state.lock().queues.create_queue(name, limits)?;
        tracing::info!(
            "Queue '{name}' ready (max_items={}, max_age_seconds={})",
            limits.max_items,
            limits.retention.as_seconds()
        );
        Ok(Enqueuer {
            name: name.to_string(),
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn enqueue(
        &self,
        queue: &str,
        payload: Value,
        dedup_key: Option<&str>,
    ) -> Result<(), OutpostError> {
        enqueue_into(&self.shared, queue, payload, dedup_key)
    }

    /// Listen on `channel`, replacing any earlier listener for it.
    pub fn subscribe<F>(&self, channel: &str, initial_query: Value, callback: F)
    where
        F: Fn(&Value, &str) + Send + Sync + 'static,
    {
        let callback: NotificationCallback = Arc::new(callback);
        let listener = ListenerInfo::new(channel, initial_query, callback);
        {
            let mut state = self.shared.state.lock();
            let subscribe = listener.subscribe_message();
            let replaced = state.registry.subscribe(listener);
            if state.socket_open {
                if replaced.is_some() {
                    state.control_outbox.push(OutboundMessage::Unsubscribe {
                        channel: channel.to_string(),
                    });
                }
                state.control_outbox.push(subscribe);
            }
            state.force_poll_requested = true;
        }
        tracing::debug!("Subscribed to channel '{channel}'");
        self.shared.wake.notify_one();
    }

    /// Stop listening on `channel`. Returns whether a listener was removed.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        let removed = {
            let mut state = self.shared.state.lock();
            let removed = state.registry.unsubscribe(channel).is_some();
            if removed && state.socket_open {
                state.control_outbox.push(OutboundMessage::Unsubscribe {
                    channel: channel.to_string(),
                });
            }
            removed
        };
        if removed {
            tracing::debug!("Unsubscribed from channel '{channel}'");
            self.shared.wake.notify_one();
        }
        removed
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.shared.state.lock().registry.is_subscribed(channel)
    }

    /// Spawn the delivery loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), OutpostError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(OutpostError::AlreadyStarted);
        }

        let socket_url = SocketChannel::endpoint(
            &self.config.endpoints.socket_url,
            &self.config.client.instance_id,
        );
        let settings = DriverSettings {
            socket_url,
            reconnect_delay: self.config.socket.reconnect_delay(),
            tick: self.config.poller.tick(),
            poll_policy: PollPolicy::from_config(
                &self.config.poller,
                self.config.socket.silence_threshold(),
            ),
        };
        let cancel = CancellationToken::new();
        let driver = Driver::new(
            Arc::clone(&self.shared),
            settings,
            self.connector.clone(),
            self.poll_client.clone(),
            cancel.clone(),
        );
        let handle = tokio::spawn(driver.run());

        tracing::info!(
            "Outpost started (instance {}, socket {}, poller {})",
            self.config.client.instance_id,
            if self.connector.is_some() { "on" } else { "off" },
            if self.poll_client.is_some() { "on" } else { "off" },
        );
        *running = Some(Running { cancel, handle });
        Ok(())
    }

    /// Cancel the loop, close the socket and wait for the task to finish.
    /// Pending items stay queued (and persisted) for the next start.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(Running { cancel, handle }) = running else {
            return;
        };
        cancel.cancel();
        if let Err(e) = handle.await {
            tracing::warn!("Delivery loop ended abnormally: {e}");
        }
        tracing::info!("Outpost stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn stats(&self) -> DeliveryStats {
        self.shared.state.lock().engine.stats()
    }

    /// Items still waiting for an acknowledgement in `queue`.
    pub fn pending(&self, queue: &str) -> Option<usize> {
        self.shared.state.lock().queues.len(queue)
    }

    pub fn pending_total(&self) -> usize {
        self.shared.state.lock().queues.pending_total()
    }

    pub fn active_transport(&self) -> ActiveTransport {
        if !self.is_running() {
            return ActiveTransport::Offline;
        }
        if self.shared.state.lock().socket_open {
            ActiveTransport::Socket
        } else if self.poll_client.is_some() {
            ActiveTransport::Poller
        } else {
            ActiveTransport::Offline
        }
    }
}

impl Drop for Outpost {
    fn drop(&mut self) {
        // Without an explicit stop the loop would outlive its handle.
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

/// Handle returned by [`Outpost::create_queue`].
#[derive(Clone)]
pub struct Enqueuer {
    name: String,
    shared: Arc<Shared>,
}

impl Enqueuer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enqueue(&self, payload: Value) -> Result<(), OutpostError> {
        enqueue_into(&self.shared, &self.name, payload, None)
    }

    /// Enqueue, first dropping any pending item of this queue with the same
    /// key.
    pub fn enqueue_with_key(&self, payload: Value, dedup_key: &str) -> Result<(), OutpostError> {
        enqueue_into(&self.shared, &self.name, payload, Some(dedup_key))
    }
}

impl std::fmt::Debug for Enqueuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enqueuer").field("name", &self.name).finish()
    }
}

fn enqueue_into(
    shared: &Shared,
    queue: &str,
    payload: Value,
    dedup_key: Option<&str>,
) -> Result<(), OutpostError> {
    {
        let mut state = shared.state.lock();
        let CoreState { queues, engine, .. } = &mut *state;
        let outcome = queues.enqueue(queue, payload, dedup_key.map(str::to_string), Utc::now())?;
        engine.stats_mut().evictions_total += outcome.evicted as u64;
    }
    shared.wake.notify_one();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn offline_config() -> Config {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        config
    }

    #[test]
    fn duplicate_queue_is_rejected() {
        let outpost = Outpost::from_config(offline_config()).unwrap();
        outpost.create_queue("stat", QueueLimits::default()).unwrap();
        let err = outpost
            .create_queue("stat", QueueLimits::default())
            .unwrap_err();
        assert_eq!(
            err,
            OutpostError::DuplicateQueue {
                name: "stat".into()
            }
        );
    }

    #[test]
    fn enqueue_to_unknown_queue_fails() {
        let outpost = Outpost::from_config(offline_config()).unwrap();
        let err = outpost.enqueue("missing", json!(1), None).unwrap_err();
        assert_eq!(
            err,
            OutpostError::UnknownQueue {
                name: "missing".into()
            }
        );
    }

    #[test]
    fn enqueuer_applies_limits_and_dedup() {
        let outpost = Outpost::from_config(offline_config()).unwrap();
        let stat = outpost.create_queue("stat", QueueLimits::new(2, -1)).unwrap();
        for payload in ["A", "B", "C"] {
            stat.enqueue(json!(payload)).unwrap();
        }
        stat.enqueue_with_key(json!("D"), "k1").unwrap();
        stat.enqueue_with_key(json!("E"), "k1").unwrap();

        assert_eq!(outpost.pending("stat"), Some(2));
        assert_eq!(outpost.stats().evictions_total, 2);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = offline_config();
        config.socket.enabled = false;
        config.poller.enabled = false;
        assert!(matches!(
            Outpost::from_config(config),
            Err(OutpostError::InvalidConfig(_))
        ));
    }

    #[test]
    fn subscribe_while_offline_only_requests_a_poll() {
        let outpost = Outpost::builder(offline_config())
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();
        outpost.subscribe("cast", json!({}), |_, _| {});
        outpost.subscribe("cast", json!({}), |_, _| {});

        let state = outpost.shared.state.lock();
        assert!(state.control_outbox.is_empty());
        assert!(state.force_poll_requested);
        assert_eq!(state.registry.len(), 1);
    }

    #[test]
    fn resubscribe_while_connected_queues_unsub_then_sub() {
        let outpost = Outpost::from_config(offline_config()).unwrap();
        outpost.subscribe("cast", json!({}), |_, _| {});
        outpost.shared.state.lock().socket_open = true;
        outpost.subscribe("cast", json!({"v": 2}), |_, _| {});
        assert!(outpost.unsubscribe("cast"));
        assert!(!outpost.unsubscribe("cast"));

        let state = outpost.shared.state.lock();
        assert_eq!(
            state.control_outbox,
            vec![
                OutboundMessage::Unsubscribe {
                    channel: "cast".into()
                },
                OutboundMessage::Subscribe {
                    channel: "cast".into(),
                    initial_query: json!({"v": 2}),
                },
                OutboundMessage::Unsubscribe {
                    channel: "cast".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn start_twice_fails_and_stop_is_idempotent() {
        let mut config = offline_config();
        config.socket.enabled = false;
        config.endpoints.poll_url = "http://127.0.0.1:9/events".into();
        let outpost = Outpost::from_config(config).unwrap();

        assert_eq!(outpost.active_transport(), ActiveTransport::Offline);
        outpost.start().unwrap();
        assert_eq!(outpost.start(), Err(OutpostError::AlreadyStarted));
        assert_eq!(outpost.active_transport(), ActiveTransport::Poller);

        outpost.stop().await;
        outpost.stop().await;
        assert!(!outpost.is_running());
    }
}
