use std::fmt;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Initial,
    Connecting,
    Connected,
    Stale,
    Reconnecting,
    Backoff,
    /// Retry budget exhausted. Only an explicit retry leaves this state.
    Failed,
    Suspended,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Initial => "initial",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Stale => "stale",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Backoff => "backoff",
            ConnectionState::Failed => "failed",
            ConnectionState::Suspended => "suspended",
        }
    }

    /// A transport is open and frames are expected to flow.
    pub fn is_linked(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Stale)
    }

    fn is_dialing(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthConfig {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Fractional jitter applied to each backoff delay, e.g. `0.2` for ±20 %.
    pub backoff_jitter: f64,
    pub max_retries: u32,
    /// A link that closes sooner than this after connecting counts as a
    /// failed attempt and goes through backoff.
    pub min_stable_link: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            heartbeat_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            backoff_jitter: 0.2,
            max_retries: 8,
            min_stable_link: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    /// Drop any current transport and dial a new one.
    Connect,
    SendHeartbeat { nonce: u64 },
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
}

/// Heartbeat-driven connection lifecycle. Every method is driven by an event
/// or `poll(now)`; nothing here waits on I/O.
#[derive(Debug)]
pub struct ConnectionHealth {
    config: HealthConfig,
    state: ConnectionState,
    rng: StdRng,
    failures: u32,
    linked_since: Option<Instant>,
    connect_deadline: Option<Instant>,
    backoff_until: Option<Instant>,
    next_probe: Option<Instant>,
    probe_deadline: Option<Instant>,
    missed_probes: u32,
    next_nonce: u64,
}

impl ConnectionHealth {
    pub fn new(config: HealthConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_seed(config: HealthConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: HealthConfig, rng: StdRng) -> Self {
        Self {
            config,
            state: ConnectionState::Initial,
            rng,
            failures: 0,
            linked_since: None,
            connect_deadline: None,
            backoff_until: None,
            next_probe: None,
            probe_deadline: None,
            missed_probes: 0,
            next_nonce: 1,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn start(&mut self, now: Instant) -> Vec<HealthAction> {
        if self.state != ConnectionState::Initial {
            return Vec::new();
        }
        self.dial(ConnectionState::Connecting, now)
    }

    pub fn on_connected(&mut self, now: Instant) -> Vec<HealthAction> {
        if !self.state.is_dialing() {
            return Vec::new();
        }
        let mut actions = Vec::new();
        self.clear_timers();
        self.linked_since = Some(now);
        self.next_probe = Some(now + self.config.heartbeat_interval);
        self.transition(ConnectionState::Connected, &mut actions);
        actions
    }

    pub fn on_connect_failed(&mut self, now: Instant) -> Vec<HealthAction> {
        if !self.state.is_dialing() {
            return Vec::new();
        }
        self.fail_attempt(now)
    }

    fn fail_attempt(&mut self, now: Instant) -> Vec<HealthAction> {
        let mut actions = Vec::new();
        self.clear_timers();
        self.failures += 1;
        if self.failures >= self.config.max_retries {
            warn!(
                target: "beach_stream::health",
                attempts = self.failures,
                "retry budget exhausted"
            );
            self.transition(ConnectionState::Failed, &mut actions);
            return actions;
        }
        let delay = self.backoff_delay(self.failures - 1);
        debug!(
            target: "beach_stream::health",
            attempt = self.failures,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.backoff_until = Some(now + delay);
        self.transition(ConnectionState::Backoff, &mut actions);
        actions
    }

    /// Any inbound frame proves the link is alive.
    pub fn on_traffic(&mut self, now: Instant) -> Vec<HealthAction> {
        let mut actions = Vec::new();
        if !self.state.is_linked() {
            return actions;
        }
        self.missed_probes = 0;
        self.probe_deadline = None;
        if self.next_probe.is_none() {
            self.next_probe = Some(now + self.config.heartbeat_interval);
        }
        if self.state == ConnectionState::Stale {
            self.transition(ConnectionState::Connected, &mut actions);
        }
        actions
    }

    pub fn on_transport_closed(&mut self, now: Instant) -> Vec<HealthAction> {
        if self.state.is_dialing() {
            return self.on_connect_failed(now);
        }
        if !self.state.is_linked() {
            return Vec::new();
        }
        if !self.link_is_stable(now) {
            debug!(target: "beach_stream::health", attempt = self.failures + 1, "link closed right after connecting");
            return self.fail_attempt(now);
        }
        self.failures = 0;
        self.dial(ConnectionState::Reconnecting, now)
    }

    fn link_is_stable(&self, now: Instant) -> bool {
        self.linked_since
            .is_some_and(|since| now.saturating_duration_since(since) >= self.config.min_stable_link)
    }

    pub fn suspend(&mut self) -> Vec<HealthAction> {
        let mut actions = Vec::new();
        if matches!(
            self.state,
            ConnectionState::Suspended | ConnectionState::Failed
        ) {
            return actions;
        }
        self.clear_timers();
        self.transition(ConnectionState::Suspended, &mut actions);
        actions
    }

    pub fn resume(&mut self, now: Instant) -> Vec<HealthAction> {
        if self.state != ConnectionState::Suspended {
            return Vec::new();
        }
        self.failures = 0;
        self.dial(ConnectionState::Connecting, now)
    }

    /// User-initiated retry out of `Failed`.
    pub fn retry(&mut self, now: Instant) -> Vec<HealthAction> {
        if self.state != ConnectionState::Failed {
            return Vec::new();
        }
        self.failures = 0;
        self.dial(ConnectionState::Connecting, now)
    }

    pub fn poll(&mut self, now: Instant) -> Vec<HealthAction> {
        let mut actions = Vec::new();
        match self.state {
            ConnectionState::Backoff => {
                if self.backoff_until.is_some_and(|at| now >= at) {
                    actions.extend(self.dial(ConnectionState::Connecting, now));
                }
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                if self.connect_deadline.is_some_and(|at| now >= at) {
                    debug!(target: "beach_stream::health", state = %self.state, "connect attempt timed out");
                    actions.extend(self.on_connect_failed(now));
                }
            }
            ConnectionState::Connected | ConnectionState::Stale => {
                if self.probe_deadline.is_some_and(|at| now >= at) {
                    self.missed_probes += 1;
                    self.probe_deadline = None;
                    if self.missed_probes >= 2 {
                        info!(target: "beach_stream::health", "two heartbeats unanswered; reconnecting");
                        if self.link_is_stable(now) {
                            self.failures = 0;
                        }
                        actions.extend(self.dial(ConnectionState::Reconnecting, now));
                        return actions;
                    }
                    self.transition(ConnectionState::Stale, &mut actions);
                    // Re-probe at once so a second miss lands one timeout later.
                    actions.push(self.probe(now));
                } else if self.probe_deadline.is_none()
                    && self.next_probe.is_some_and(|at| now >= at)
                {
                    actions.push(self.probe(now));
                }
            }
            ConnectionState::Initial | ConnectionState::Failed | ConnectionState::Suspended => {}
        }
        actions
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let candidates = match self.state {
            ConnectionState::Backoff => [self.backoff_until, None],
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                [self.connect_deadline, None]
            }
            ConnectionState::Connected | ConnectionState::Stale => match self.probe_deadline {
                Some(deadline) => [Some(deadline), None],
                None => [self.next_probe, None],
            },
            ConnectionState::Initial | ConnectionState::Failed | ConnectionState::Suspended => {
                [None, None]
            }
        };
        candidates.into_iter().flatten().min()
    }

    fn dial(&mut self, to: ConnectionState, now: Instant) -> Vec<HealthAction> {
        let mut actions = Vec::new();
        self.clear_timers();
        self.connect_deadline = Some(now + self.config.connect_timeout);
        self.transition(to, &mut actions);
        actions.push(HealthAction::Connect);
        actions
    }

    fn probe(&mut self, now: Instant) -> HealthAction {
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        self.probe_deadline = Some(now + self.config.heartbeat_timeout);
        self.next_probe = Some(now + self.config.heartbeat_interval);
        HealthAction::SendHeartbeat { nonce }
    }

    fn backoff_delay(&mut self, attempt: u32) -> Duration {
        let base = self
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let capped = base.min(self.config.backoff_max);
        let jitter = self.config.backoff_jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return capped;
        }
        let factor = self.rng.gen_range(1.0 - jitter..=1.0 + jitter);
        capped.mul_f64(factor)
    }

    fn clear_timers(&mut self) {
        self.linked_since = None;
        self.connect_deadline = None;
        self.backoff_until = None;
        self.next_probe = None;
        self.probe_deadline = None;
        self.missed_probes = 0;
    }

    fn transition(&mut self, to: ConnectionState, actions: &mut Vec<HealthAction>) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        debug!(target: "beach_stream::health", %from, %to, "connection state");
        actions.push(HealthAction::StateChanged { from, to });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn changes(actions: &[HealthAction]) -> Vec<(ConnectionState, ConnectionState)> {
        actions
            .iter()
            .filter_map(|action| match action {
                HealthAction::StateChanged { from, to } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    fn connected(start: Instant) -> ConnectionHealth {
        let mut health = ConnectionHealth::with_seed(HealthConfig::default(), 7);
        assert!(health.start(start).contains(&HealthAction::Connect));
        health.on_connected(start);
        assert_eq!(health.state(), ConnectionState::Connected);
        health
    }

    #[test_timeout::timeout]
    fn silence_moves_connected_to_stale_then_reconnecting() {
        let start = Instant::now();
        let mut health = connected(start);
        let mut actions = Vec::new();
        for second in 1..=26 {
            actions.extend(health.poll(start + Duration::from_secs(second)));
        }
        assert_eq!(
            changes(&actions),
            vec![
                (ConnectionState::Connected, ConnectionState::Stale),
                (ConnectionState::Stale, ConnectionState::Reconnecting),
            ]
        );
        let probes = actions
            .iter()
            .filter(|a| matches!(a, HealthAction::SendHeartbeat { .. }))
            .count();
        assert_eq!(probes, 2);
        assert_eq!(actions.last(), Some(&HealthAction::Connect));
    }

    #[test_timeout::timeout]
    fn reply_clears_stale() {
        let start = Instant::now();
        let mut health = connected(start);
        health.poll(start + Duration::from_secs(15));
        health.poll(start + Duration::from_secs(20));
        assert_eq!(health.state(), ConnectionState::Stale);
        let actions = health.on_traffic(start + Duration::from_secs(21));
        assert_eq!(
            changes(&actions),
            vec![(ConnectionState::Stale, ConnectionState::Connected)]
        );
        assert!(health.poll(start + Duration::from_secs(26)).is_empty());
    }

    #[test_timeout::timeout]
    fn transport_close_reconnects_immediately() {
        let start = Instant::now();
        let mut health = connected(start);
        let actions = health.on_transport_closed(start + Duration::from_secs(11));
        assert_eq!(
            actions,
            vec![
                HealthAction::StateChanged {
                    from: ConnectionState::Connected,
                    to: ConnectionState::Reconnecting,
                },
                HealthAction::Connect,
            ]
        );
    }

    #[test_timeout::timeout]
    fn link_dropped_right_after_connect_spends_retry_budget() {
        let config = HealthConfig::default();
        let mut health = ConnectionHealth::with_seed(config, 3);
        let mut now = Instant::now();
        health.start(now);
        for attempt in 1..config.max_retries {
            health.on_connected(now);
            let actions = health.on_transport_closed(now);
            assert!(!actions.contains(&HealthAction::Connect));
            assert_eq!(health.state(), ConnectionState::Backoff);
            assert_eq!(health.failures(), attempt);
            now = health.next_deadline().expect("backoff deadline");
            assert!(health.poll(now).contains(&HealthAction::Connect));
        }
        health.on_connected(now);
        health.on_transport_closed(now);
        assert_eq!(health.state(), ConnectionState::Failed);
    }

    #[test_timeout::timeout]
    fn stable_link_clears_failures_before_reconnecting() {
        let mut health = ConnectionHealth::with_seed(HealthConfig::default(), 5);
        let mut now = Instant::now();
        health.start(now);
        health.on_connect_failed(now);
        now = health.next_deadline().expect("backoff deadline");
        health.poll(now);
        health.on_connected(now);
        assert_eq!(health.failures(), 1);

        let actions = health.on_transport_closed(now + Duration::from_secs(30));
        assert!(actions.contains(&HealthAction::Connect));
        assert_eq!(health.state(), ConnectionState::Reconnecting);
        assert_eq!(health.failures(), 0);
    }

    #[test_timeout::timeout]
    fn failures_back_off_with_bounded_jitter_until_budget_exhausted() {
        let config = HealthConfig::default();
        let mut health = ConnectionHealth::with_seed(config, 42);
        let mut now = Instant::now();
        health.start(now);
        for attempt in 0..config.max_retries - 1 {
            health.on_connect_failed(now);
            assert_eq!(health.state(), ConnectionState::Backoff);
            let delay = health.next_deadline().unwrap() - now;
            let nominal = config
                .backoff_base
                .saturating_mul(1 << attempt)
                .min(config.backoff_max);
            assert!(delay >= nominal.mul_f64(0.8) && delay <= nominal.mul_f64(1.2));
            now += delay;
            assert!(health.poll(now).contains(&HealthAction::Connect));
            assert_eq!(health.state(), ConnectionState::Connecting);
        }
        health.on_connect_failed(now);
        assert_eq!(health.state(), ConnectionState::Failed);
        assert_eq!(health.next_deadline(), None);
        assert!(health.poll(now + Duration::from_secs(3600)).is_empty());

        let actions = health.retry(now);
        assert!(actions.contains(&HealthAction::Connect));
        assert_eq!(health.failures(), 0);
    }

    #[test_timeout::timeout]
    fn suspend_and_resume() {
        let start = Instant::now();
        let mut health = connected(start);
        health.suspend();
        assert_eq!(health.state(), ConnectionState::Suspended);
        assert_eq!(health.next_deadline(), None);
        assert!(health.poll(start + Duration::from_secs(60)).is_empty());
        let actions = health.resume(start + Duration::from_secs(60));
        assert_eq!(
            changes(&actions),
            vec![(ConnectionState::Suspended, ConnectionState::Connecting)]
        );
    }

    #[test_timeout::timeout]
    fn hung_connect_attempt_times_out() {
        let start = Instant::now();
        let mut health = ConnectionHealth::with_seed(HealthConfig::default(), 1);
        health.start(start);
        assert_eq!(health.next_deadline(), Some(start + Duration::from_secs(10)));
        health.poll(start + Duration::from_secs(10));
        assert_eq!(health.state(), ConnectionState::Backoff);
    }
}
