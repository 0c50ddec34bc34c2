use super::{CoreState, Shared};
use crate::transport::{
    FallbackPoller, PollClient, PollPolicy, SocketChannel, SocketConnector, SocketFrame,
    SocketSession,
};
use crate::wire::{decode_batch_text, decode_entries, DecodedBatch, OutboundMessage};
use chrono::Utc;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub(crate) struct DriverSettings {
    pub(crate) socket_url: String,
    pub(crate) reconnect_delay: Duration,
    pub(crate) tick: Duration,
    pub(crate) poll_policy: PollPolicy,
}

/// Results of work the loop spawned off.
enum LoopEvent {
    Connected(anyhow::Result<SocketSession>),
    PollFinished(anyhow::Result<Vec<Value>>),
}

enum Wakeup {
    Tick,
    Notified,
    Event(LoopEvent),
    Frame(SocketFrame),
    Reconnect,
}

struct PollSide {
    gate: FallbackPoller,
    client: Arc<dyn PollClient>,
}

/// Single task owning every transport. Shared state is locked briefly and
/// never across an await.
pub(crate) struct Driver {
    shared: Arc<Shared>,
    settings: DriverSettings,
    connector: Option<Arc<dyn SocketConnector>>,
    socket: SocketChannel,
    poll: Option<PollSide>,
    reconnect_at: Option<Instant>,
    events_tx: mpsc::UnboundedSender<LoopEvent>,
    events_rx: mpsc::UnboundedReceiver<LoopEvent>,
    cancel: CancellationToken,
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    pub(crate) fn new(
        shared: Arc<Shared>,
        settings: DriverSettings,
        connector: Option<Arc<dyn SocketConnector>>,
        poll_client: Option<Arc<dyn PollClient>>,
        cancel: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let poll = poll_client.map(|client| PollSide {
            gate: FallbackPoller::new(settings.poll_policy),
            client,
        });
        Self {
            shared,
            settings,
            connector,
            socket: SocketChannel::new(),
            poll,
            reconnect_at: None,
            events_tx,
            events_rx,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        self.start_connect();

        let mut tick = tokio::time::interval(self.settings.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let status = self.socket.status();
            let force_at = self
                .poll
                .as_ref()
                .and_then(|p| p.gate.force_wakeup(Instant::now(), status));
            let wakeup = tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = tick.tick() => Wakeup::Tick,
                () = self.shared.wake.notified() => Wakeup::Notified,
                Some(event) = self.events_rx.recv() => Wakeup::Event(event),
                frame = self.socket.next_frame() => Wakeup::Frame(frame),
                () = sleep_until_opt(self.reconnect_at) => Wakeup::Reconnect,
                () = sleep_until_opt(force_at) => Wakeup::Tick,
            };

            match wakeup {
                Wakeup::Tick => self.on_tick(),
                Wakeup::Notified => self.on_wake(),
                Wakeup::Event(LoopEvent::Connected(result)) => self.on_connected(result),
                Wakeup::Event(LoopEvent::PollFinished(result)) => self.on_poll_finished(result),
                Wakeup::Frame(frame) => self.on_frame(frame),
                Wakeup::Reconnect => {
                    self.reconnect_at = None;
                    self.start_connect();
                }
            }
        }

        self.socket.close();
        self.shared.state.lock().socket_open = false;
    }

    fn start_connect(&mut self) {
        let Some(connector) = self.connector.clone() else {
            return;
        };
        self.socket.begin_connect();
        let url = self.settings.socket_url.clone();
        let tx = self.events_tx.clone();
        tracing::debug!("Connecting socket to {url}");
        tokio::spawn(async move {
            let result = connector.connect(&url).await;
            // A closed channel means the loop is gone; the session drops here.
            let _ = tx.send(LoopEvent::Connected(result));
        });
    }

    fn schedule_reconnect(&mut self) {
        if self.connector.is_some() {
            self.reconnect_at = Some(Instant::now() + self.settings.reconnect_delay);
        }
    }

    fn on_connected(&mut self, result: anyhow::Result<SocketSession>) {
        let session = match result {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!("Socket connect failed: {e:#}");
                self.socket.connect_failed();
                self.schedule_reconnect();
                return;
            }
        };

        self.socket.opened(session, Instant::now());
        if let Some(poll) = self.poll.as_mut() {
            poll.gate.clear_force();
        }

        let batch = {
            let mut state = self.shared.state.lock();
            state.socket_open = true;
            // The full subscription set below supersedes anything queued.
            state.control_outbox.clear();
            state.force_poll_requested = false;

            let now = Utc::now();
            let mut batch = vec![OutboundMessage::time_sync(now)];
            batch.extend(state.registry.subscription_messages());
            let CoreState { queues, engine, .. } = &mut *state;
            engine.stats_mut().socket_connects_total += 1;
            batch.extend(engine.compute_due_items(queues, now));
            batch
        };
        tracing::info!("Socket connected, sending {} message(s)", batch.len());
        self.send_over_socket(&batch);
    }

    fn on_frame(&mut self, frame: SocketFrame) {
        match frame {
            SocketFrame::Text(text) => {
                self.socket.touch(Instant::now());
                match decode_batch_text(&text) {
                    Ok(batch) => self.ingest(batch),
                    Err(e) => {
                        tracing::warn!("Dropping malformed socket frame: {e}");
                        self.shared.state.lock().engine.stats_mut().malformed_total += 1;
                    }
                }
            }
            SocketFrame::Closed(reason) => {
                tracing::info!(
                    "Socket closed{}",
                    reason.map(|r| format!(": {r}")).unwrap_or_default()
                );
                self.on_disconnect();
            }
        }
    }

    /// Tear down a connection that was open and arm the reconnect timer.
    fn on_disconnect(&mut self) {
        self.socket.close();
        {
            let mut state = self.shared.state.lock();
            state.socket_open = false;
            state.engine.stats_mut().socket_disconnects_total += 1;
        }
        self.schedule_reconnect();
    }

    fn on_tick(&mut self) {
        if self.socket.is_open() {
            let batch = {
                let mut state = self.shared.state.lock();
                let CoreState { queues, engine, .. } = &mut *state;
                engine.compute_due_items(queues, Utc::now())
            };
            self.send_over_socket(&batch);
        } else {
            self.maybe_poll();
        }
    }

    fn on_wake(&mut self) {
        let (outbox, force) = {
            let mut state = self.shared.state.lock();
            (
                std::mem::take(&mut state.control_outbox),
                std::mem::take(&mut state.force_poll_requested),
            )
        };

        if self.socket.is_open() {
            let mut batch = outbox;
            {
                let mut state = self.shared.state.lock();
                let CoreState { queues, engine, .. } = &mut *state;
                batch.extend(engine.compute_due_items(queues, Utc::now()));
            }
            self.send_over_socket(&batch);
            return;
        }

        if !outbox.is_empty() {
            tracing::debug!(
                "Socket not open, dropping {} control message(s); subscriptions are resent on connect",
                outbox.len()
            );
        }
        if force {
            if let Some(poll) = self.poll.as_mut() {
                poll.gate.request_force(Instant::now());
            }
        }
    }

    fn send_over_socket(&mut self, batch: &[OutboundMessage]) {
        if batch.is_empty() {
            return;
        }
        let was_open = self.socket.is_open();
        if !self.socket.send_batch(batch) && was_open {
            self.on_disconnect();
        }
    }

    fn maybe_poll(&mut self) {
        let Some(poll) = self.poll.as_mut() else {
            return;
        };
        let now = Instant::now();
        let status = self.socket.status();

        let batch = {
            let mut state = self.shared.state.lock();
            if !poll
                .gate
                .should_send(now, status, state.registry.has_subscriptions())
            {
                return;
            }
            let wall_now = Utc::now();
            let mut batch = vec![OutboundMessage::time_sync(wall_now)];
            batch.extend(state.registry.subscription_messages());
            let CoreState { queues, engine, .. } = &mut *state;
            batch.extend(engine.compute_due_items(queues, wall_now));
            engine.stats_mut().polls_total += 1;
            batch
        };
        poll.gate.mark_sent(now);

        tracing::debug!("Polling with {} message(s)", batch.len());
        let events: Vec<Value> = batch.iter().map(OutboundMessage::to_value).collect();
        let client = Arc::clone(&poll.client);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = client.exchange(events).await;
            let _ = tx.send(LoopEvent::PollFinished(result));
        });
    }

    fn on_poll_finished(&mut self, result: anyhow::Result<Vec<Value>>) {
        if let Some(poll) = self.poll.as_mut() {
            poll.gate.mark_finished();
        }
        match result {
            Ok(entries) => self.ingest(decode_entries(&entries)),
            Err(e) => {
                tracing::warn!("Poll failed: {e:#}");
                self.shared.state.lock().engine.stats_mut().poll_failures_total += 1;
            }
        }
    }

    /// Reconcile a response batch and run notification callbacks.
    fn ingest(&mut self, batch: DecodedBatch) {
        let dispatches = {
            let mut state = self.shared.state.lock();
            let CoreState {
                queues,
                engine,
                registry,
                ..
            } = &mut *state;
            let notifications = engine.reconcile(queues, batch);
            let (dispatches, dropped) = registry.route(notifications);
            let stats = engine.stats_mut();
            stats.notifications_total += dispatches.len() as u64;
            stats.notifications_dropped_total += dropped as u64;
            dispatches
        };

        for dispatch in dispatches {
            if std::panic::catch_unwind(AssertUnwindSafe(|| dispatch.deliver())).is_err() {
                tracing::warn!("Notification callback panicked");
            }
        }
    }
}
