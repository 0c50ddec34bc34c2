use super::socket::SocketStatus;
use super::PollClient;
use crate::config::PollerConfig;
use crate::wire::{PollRequest, PollResponse};
use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// Timing knobs of the fallback transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub silence_threshold: Duration,
    pub subscribed_spacing: Duration,
    pub idle_spacing: Duration,
    pub force_debounce: Duration,
}

impl PollPolicy {
    pub fn from_config(poller: &PollerConfig, silence_threshold: Duration) -> Self {
        Self {
            silence_threshold,
            subscribed_spacing: poller.subscribed_spacing(),
            idle_spacing: poller.idle_spacing(),
            force_debounce: poller.force_debounce(),
        }
    }
}

/// Send gate for the fallback transport. The loop asks on every tick; this
/// decides whether a poll actually goes out.
#[derive(Debug)]
pub struct FallbackPoller {
    policy: PollPolicy,
    last_send: Option<Instant>,
    in_flight: bool,
    force_at: Option<Instant>,
}

impl FallbackPoller {
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            policy,
            last_send: None,
            in_flight: false,
            force_at: None,
        }
    }

    /// Ask for an immediate poll. Repeated requests push the deadline out so
    /// a burst of subscriptions results in one request.
    pub fn request_force(&mut self, now: Instant) {
        self.force_at = Some(now + self.policy.force_debounce);
    }

    /// When the pending forced poll matures, if any.
    pub fn force_deadline(&self) -> Option<Instant> {
        self.force_at
    }

    /// Deadline the loop should sleep on for a forced poll. A matured force
    /// that cannot go out yet returns `None`; the next tick or poll
    /// completion picks it up, since matured forces skip spacing.
    pub fn force_wakeup(&self, now: Instant, status: SocketStatus) -> Option<Instant> {
        let at = self.force_at?;
        if at > now || (!self.in_flight && self.socket_unavailable(status, now)) {
            Some(at)
        } else {
            None
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Whether the socket counts as unavailable.
    pub fn socket_unavailable(&self, status: SocketStatus, now: Instant) -> bool {
        if status.open {
            return false;
        }
        if !status.ever_connected {
            return true;
        }
        match status.last_receive {
            Some(at) => now.saturating_duration_since(at) > self.policy.silence_threshold,
            None => true,
        }
    }

    /// Minimum gap since the previous poll.
    pub fn required_spacing(&self, now: Instant, has_subscriptions: bool) -> Duration {
        if self.force_at.is_some_and(|at| now >= at) {
            Duration::ZERO
        } else if has_subscriptions {
            self.policy.subscribed_spacing
        } else {
            self.policy.idle_spacing
        }
    }

    pub fn should_send(&self, now: Instant, status: SocketStatus, has_subscriptions: bool) -> bool {
        if self.in_flight || !self.socket_unavailable(status, now) {
            return false;
        }
        match self.last_send {
            None => true,
            Some(last) => {
                now.saturating_duration_since(last) >= self.required_spacing(now, has_subscriptions)
            }
        }
    }

    pub fn mark_sent(&mut self, now: Instant) {
        self.last_send = Some(now);
        self.in_flight = true;
        self.force_at = None;
    }

    pub fn mark_finished(&mut self) {
        self.in_flight = false;
    }

    /// Drop a pending forced poll, e.g. once the socket carries subscriptions.
    pub fn clear_force(&mut self) {
        self.force_at = None;
    }
}

/// HTTP implementation of [`PollClient`]: one POST per exchange.
#[derive(Debug, Clone)]
pub struct HttpPollClient {
    client: reqwest::Client,
    url: String,
}

impl HttpPollClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build poll HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PollClient for HttpPollClient {
    async fn exchange(&self, events: Vec<Value>) -> anyhow::Result<Vec<Value>> {
        let response = self
            .client
            .post(&self.url)
            .json(&PollRequest { events })
            .send()
            .await
            .with_context(|| format!("Poll request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Poll endpoint returned {status}");
        }

        let body: PollResponse = response
            .json()
            .await
            .context("Poll response was not a valid batch body")?;
        Ok(body.completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> PollPolicy {
        PollPolicy {
            silence_threshold: Duration::from_secs(120),
            subscribed_spacing: Duration::from_secs(10),
            idle_spacing: Duration::from_secs(30),
            force_debounce: Duration::from_millis(200),
        }
    }

    fn never_connected() -> SocketStatus {
        SocketStatus {
            open: false,
            ever_connected: false,
            last_receive: None,
        }
    }

    #[test]
    fn polls_immediately_when_socket_never_connected() {
        let poller = FallbackPoller::new(policy());
        assert!(poller.should_send(Instant::now(), never_connected(), false));
    }

    #[test]
    fn open_socket_suppresses_polling() {
        let poller = FallbackPoller::new(policy());
        let now = Instant::now();
        let status = SocketStatus {
            open: true,
            ever_connected: true,
            last_receive: Some(now),
        };
        assert!(!poller.should_send(now, status, true));
    }

    #[test]
    fn recently_active_socket_holds_off_polling() {
        let poller = FallbackPoller::new(policy());
        let now = Instant::now();
        let dropped = SocketStatus {
            open: false,
            ever_connected: true,
            last_receive: Some(now),
        };

        assert!(!poller.should_send(now + Duration::from_secs(60), dropped, false));
        assert!(poller.should_send(now + Duration::from_secs(121), dropped, false));
    }

    #[test]
    fn spacing_adapts_to_subscriptions() {
        let mut poller = FallbackPoller::new(policy());
        let start = Instant::now();
        poller.mark_sent(start);
        poller.mark_finished();

        let at = |secs| start + Duration::from_secs(secs);
        assert!(!poller.should_send(at(9), never_connected(), true));
        assert!(poller.should_send(at(10), never_connected(), true));
        assert!(!poller.should_send(at(29), never_connected(), false));
        assert!(poller.should_send(at(30), never_connected(), false));
    }

    #[test]
    fn forced_poll_waits_for_debounce_then_skips_spacing() {
        let mut poller = FallbackPoller::new(policy());
        let start = Instant::now();
        poller.mark_sent(start);
        poller.mark_finished();

        poller.request_force(start + Duration::from_secs(1));
        poller.request_force(start + Duration::from_millis(1100));
        assert_eq!(
            poller.force_deadline(),
            Some(start + Duration::from_millis(1300))
        );

        assert!(!poller.should_send(start + Duration::from_millis(1250), never_connected(), true));
        assert!(poller.should_send(start + Duration::from_millis(1300), never_connected(), true));

        poller.mark_sent(start + Duration::from_millis(1300));
        assert!(poller.force_deadline().is_none());
    }

    #[test]
    fn matured_force_is_not_a_wakeup_while_poll_in_flight() {
        let mut poller = FallbackPoller::new(policy());
        let start = Instant::now();
        poller.mark_sent(start);
        poller.request_force(start);

        let due = start + Duration::from_millis(200);
        let later = start + Duration::from_secs(1);
        assert_eq!(poller.force_wakeup(start, never_connected()), Some(due));
        assert_eq!(poller.force_wakeup(later, never_connected()), None);

        poller.mark_finished();
        assert_eq!(poller.force_wakeup(later, never_connected()), Some(due));
        assert!(poller.should_send(later, never_connected(), true));
    }

    #[test]
    fn matured_force_waits_out_socket_silence_window() {
        let mut poller = FallbackPoller::new(policy());
        let start = Instant::now();
        let dropped = SocketStatus {
            open: false,
            ever_connected: true,
            last_receive: Some(start),
        };
        poller.request_force(start);

        let inside = start + Duration::from_secs(5);
        assert_eq!(poller.force_wakeup(inside, dropped), None);
        assert!(!poller.should_send(inside, dropped, true));

        let past = start + Duration::from_secs(121);
        assert!(poller.force_wakeup(past, dropped).is_some());
        assert!(poller.should_send(past, dropped, true));
    }

    #[test]
    fn only_one_poll_in_flight() {
        let mut poller = FallbackPoller::new(policy());
        let now = Instant::now();
        poller.mark_sent(now);
        poller.request_force(now);
        let later = now + Duration::from_secs(60);
        assert!(!poller.should_send(later, never_connected(), false));
        poller.mark_finished();
        assert!(poller.should_send(later, never_connected(), false));
    }
}
