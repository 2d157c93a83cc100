//! Connection session management: state machine, backoff, heartbeat,
//! circuit breaker.
//!
//! - State machine with well-defined transitions per connection
//! - Exponential backoff with full jitter (thundering herd prevention)
//! - Heartbeat monitoring (ping/pong + data staleness)
//! - Proactive reconnection before the venue's 24h connection limit
//! - Per-shard circuit breaker with exponentially growing cooldown
//!
//! The hot path never logs; transitions are cold-path and log structured
//! events.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{info, warn};

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct SessionConfig {
    // Backoff
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,

    // Timeouts
    pub connect_timeout_ms: u64,
    pub subscribe_timeout_ms: u64,
    pub snapshot_timeout_ms: u64,

    // Heartbeat
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    /// No inbound frame for this long counts as a stall.
    pub idle_window_ms: u64,

    // Proactive refresh before the venue's hard connection lifetime.
    pub proactive_refresh_secs: u64,

    // Circuit breaker
    pub breaker_threshold: u32,
    pub breaker_window_secs: u64,
    pub breaker_cooldown_secs: u64,
    pub breaker_cooldown_max_secs: u64,

    // Depth snapshot
    pub depth_snapshot_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 100,
            backoff_max_ms: 30_000,

            connect_timeout_ms: 10_000,
            subscribe_timeout_ms: 5_000,
            snapshot_timeout_ms: 5_000,

            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            idle_window_ms: 15_000,

            proactive_refresh_secs: 23 * 3600,

            breaker_threshold: 5,
            breaker_window_secs: 120,
            breaker_cooldown_secs: 30,
            breaker_cooldown_max_secs: 900,

            depth_snapshot_limit: 1000,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        let read = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok());

        if let Some(v) = read("STREAM_BACKOFF_BASE_MS") {
            cfg.backoff_base_ms = v;
        }
        if let Some(v) = read("STREAM_BACKOFF_MAX_MS") {
            cfg.backoff_max_ms = v;
        }
        if let Some(v) = read("STREAM_CONNECT_TIMEOUT_MS") {
            cfg.connect_timeout_ms = v;
        }
        if let Some(v) = read("STREAM_IDLE_WINDOW_MS") {
            cfg.idle_window_ms = v;
        }
        if let Some(v) = read("STREAM_PING_INTERVAL_MS") {
            cfg.ping_interval_ms = v;
        }
        if let Some(v) = read("STREAM_BREAKER_THRESHOLD") {
            cfg.breaker_threshold = v as u32;
        }
        if let Some(v) = read("STREAM_BREAKER_COOLDOWN_SECS") {
            cfg.breaker_cooldown_secs = v;
        }
        cfg
    }
}

// =============================================================================
// STATE MACHINE
// =============================================================================

/// Per-connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    /// Controlled shutdown: in-flight events are flushed before closing.
    Draining,
    Reconnecting,
    /// Circuit breaker open; connecting is suppressed.
    Failed,
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnState::Disconnected => "DISCONNECTED",
            ConnState::Connecting => "CONNECTING",
            ConnState::Connected => "CONNECTED",
            ConnState::Draining => "DRAINING",
            ConnState::Reconnecting => "RECONNECTING",
            ConnState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Why a transition happened; drives telemetry and breaker accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Started,
    ConnectOk,
    SubscribeOk,
    ConnectTimeout,
    SubscribeTimeout,
    PongTimeout,
    Stall,
    ServerClose,
    TransportError,
    ProtocolError,
    ProactiveRefresh,
    BreakerOpen,
    ShutdownRequested,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransitionReason::Started => "started",
            TransitionReason::ConnectOk => "connect_ok",
            TransitionReason::SubscribeOk => "subscribe_ok",
            TransitionReason::ConnectTimeout => "connect_timeout",
            TransitionReason::SubscribeTimeout => "subscribe_timeout",
            TransitionReason::PongTimeout => "pong_timeout",
            TransitionReason::Stall => "stall",
            TransitionReason::ServerClose => "server_close",
            TransitionReason::TransportError => "transport_error",
            TransitionReason::ProtocolError => "protocol_error",
            TransitionReason::ProactiveRefresh => "proactive_refresh",
            TransitionReason::BreakerOpen => "breaker_open",
            TransitionReason::ShutdownRequested => "shutdown",
        };
        f.write_str(s)
    }
}

// =============================================================================
// BACKOFF (FULL JITTER)
// =============================================================================

/// Exponential backoff with full jitter: each delay is uniform in
/// `[0, min(cap, base * 2^attempt))`, floored at the base.
#[derive(Debug)]
pub struct BackoffCalculator {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
    rng_state: u64,
}

impl BackoffCalculator {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms: base_ms.max(1),
            max_ms,
            attempt: 0,
            rng_state: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0x9e3779b9)
                | 1,
        }
    }

    /// xorshift64; good enough for jitter.
    #[inline]
    fn next_random(&mut self) -> f64 {
        self.rng_state ^= self.rng_state << 13;
        self.rng_state ^= self.rng_state >> 7;
        self.rng_state ^= self.rng_state << 17;
        (self.rng_state as f64) / (u64::MAX as f64)
    }

    pub fn next_backoff(&mut self) -> Duration {
        let ceiling = ((self.base_ms as f64) * 2f64.powi(self.attempt as i32))
            .min(self.max_ms as f64);
        let jittered = (self.next_random() * ceiling).max(self.base_ms as f64);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(jittered as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

// =============================================================================
// HEARTBEAT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    Ok,
    SendPing,
    PongTimeout,
    /// No market data inside the idle window.
    Stall,
}

/// Tracks ping/pong and data freshness for one connection.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    ping_interval: Duration,
    pong_timeout: Duration,
    idle_window: Duration,
    last_ping_sent: Option<Instant>,
    awaiting_pong: bool,
    last_data: Instant,
}

impl HeartbeatMonitor {
    pub fn new(cfg: &SessionConfig) -> Self {
        Self {
            ping_interval: Duration::from_millis(cfg.ping_interval_ms),
            pong_timeout: Duration::from_millis(cfg.pong_timeout_ms),
            idle_window: Duration::from_millis(cfg.idle_window_ms),
            last_ping_sent: None,
            awaiting_pong: false,
            last_data: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.last_ping_sent = None;
        self.awaiting_pong = false;
        self.last_data = Instant::now();
    }

    #[inline]
    pub fn record_data(&mut self) {
        self.last_data = Instant::now();
    }

    pub fn record_ping_sent(&mut self) {
        self.last_ping_sent = Some(Instant::now());
        self.awaiting_pong = true;
    }

    pub fn record_pong(&mut self) {
        self.awaiting_pong = false;
    }

    pub fn check(&mut self) -> HeartbeatAction {
        let now = Instant::now();

        if self.awaiting_pong {
            if let Some(sent) = self.last_ping_sent {
                if now.duration_since(sent) > self.pong_timeout {
                    return HeartbeatAction::PongTimeout;
                }
            }
        }

        if now.duration_since(self.last_data) > self.idle_window {
            return HeartbeatAction::Stall;
        }

        let due = match self.last_ping_sent {
            None => true,
            Some(sent) => now.duration_since(sent) > self.ping_interval,
        };
        if due && !self.awaiting_pong {
            return HeartbeatAction::SendPing;
        }

        HeartbeatAction::Ok
    }
}

// =============================================================================
// CIRCUIT BREAKER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-shard circuit breaker: after `threshold` failures within `window`,
/// opens for a cooldown; a half-open probe allows one attempt; probe failure
/// re-opens with exponentially increased cooldown up to a cap.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    window: Duration,
    base_cooldown: Duration,
    max_cooldown: Duration,
    failures: VecDeque<Instant>,
    open_until: Option<Instant>,
    half_open: bool,
    consecutive_opens: u32,
    shard: String,
}

impl CircuitBreaker {
    pub fn new(cfg: &SessionConfig, shard: impl Into<String>) -> Self {
        Self {
            threshold: cfg.breaker_threshold.max(1),
            window: Duration::from_secs(cfg.breaker_window_secs),
            base_cooldown: Duration::from_secs(cfg.breaker_cooldown_secs),
            max_cooldown: Duration::from_secs(cfg.breaker_cooldown_max_secs),
            failures: VecDeque::new(),
            open_until: None,
            half_open: false,
            consecutive_opens: 0,
            shard: shard.into(),
        }
    }

    pub fn state(&self) -> BreakerState {
        match self.open_until {
            Some(until) if Instant::now() < until => BreakerState::Open,
            Some(_) => BreakerState::HalfOpen,
            None if self.half_open => BreakerState::HalfOpen,
            None => BreakerState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == BreakerState::Open
    }

    /// How long connecting stays suppressed, if open.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        self.open_until
            .and_then(|until| until.checked_duration_since(Instant::now()))
    }

    /// Call before a connection attempt. Returns false while open; while
    /// half-open, exactly one probe passes.
    pub fn allow_attempt(&mut self) -> bool {
        match self.state() {
            BreakerState::Open => false,
            BreakerState::HalfOpen => {
                self.open_until = None;
                self.half_open = true;
                true
            }
            BreakerState::Closed => true,
        }
    }

    pub fn record_success(&mut self) {
        if self.half_open || self.consecutive_opens > 0 {
            info!(shard = %self.shard, "breaker_closed");
        }
        self.failures.clear();
        self.open_until = None;
        self.half_open = false;
        self.consecutive_opens = 0;
    }

    pub fn record_failure(&mut self) {
        let now = Instant::now();

        // Half-open probe failure re-opens immediately with a longer cooldown.
        if self.half_open {
            self.half_open = false;
            self.open(now);
            return;
        }

        self.failures.push_back(now);
        while let Some(front) = self.failures.front() {
            if now.duration_since(*front) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }

        if self.failures.len() as u32 >= self.threshold {
            self.failures.clear();
            self.open(now);
        }
    }

    fn open(&mut self, now: Instant) {
        let cooldown = self
            .base_cooldown
            .saturating_mul(1u32 << self.consecutive_opens.min(16))
            .min(self.max_cooldown);
        self.consecutive_opens = self.consecutive_opens.saturating_add(1);
        self.open_until = Some(now + cooldown);
        warn!(
            shard = %self.shard,
            cooldown_secs = cooldown.as_secs(),
            opens = self.consecutive_opens,
            "breaker_opened"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SessionConfig {
        SessionConfig::default()
    }

    #[test]
    fn test_backoff_full_jitter_bounds() {
        let mut backoff = BackoffCalculator::new(100, 30_000);
        let mut prev_ceiling = 100u128;
        for _ in 0..12 {
            let d = backoff.next_backoff();
            assert!(d.as_millis() >= 100);
            assert!(d.as_millis() <= 30_000);
            prev_ceiling = (prev_ceiling * 2).min(30_000);
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        // Post-reset the ceiling is the base again.
        let d = backoff.next_backoff();
        assert!(d.as_millis() >= 100 && d.as_millis() <= 200);
    }

    #[test]
    fn test_heartbeat_stall_detection() {
        let mut c = cfg();
        c.idle_window_ms = 5;
        c.ping_interval_ms = 60_000;
        let mut hb = HeartbeatMonitor::new(&c);
        hb.record_ping_sent();
        hb.record_pong();

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(hb.check(), HeartbeatAction::Stall);

        hb.record_data();
        assert_eq!(hb.check(), HeartbeatAction::Ok);
    }

    #[test]
    fn test_heartbeat_pong_timeout() {
        let mut c = cfg();
        c.pong_timeout_ms = 5;
        c.idle_window_ms = 60_000;
        let mut hb = HeartbeatMonitor::new(&c);
        hb.record_ping_sent();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(hb.check(), HeartbeatAction::PongTimeout);
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let mut c = cfg();
        c.breaker_threshold = 3;
        let mut breaker = CircuitBreaker::new(&c, "shard-0");

        assert!(breaker.allow_attempt());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_attempt());
    }

    #[test]
    fn test_breaker_half_open_probe() {
        let mut c = cfg();
        c.breaker_threshold = 1;
        c.breaker_cooldown_secs = 0;
        let mut breaker = CircuitBreaker::new(&c, "shard-0");

        breaker.record_failure();
        // Zero cooldown: immediately half-open; one probe allowed.
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.allow_attempt());

        // Probe success closes it.
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_breaker_cooldown_grows() {
        let mut c = cfg();
        c.breaker_threshold = 1;
        c.breaker_cooldown_secs = 10;
        c.breaker_cooldown_max_secs = 900;
        let mut breaker = CircuitBreaker::new(&c, "shard-0");

        breaker.record_failure();
        let first = breaker.remaining_cooldown().unwrap();

        // Simulate a failed half-open probe by forcing the state.
        breaker.half_open = true;
        breaker.open_until = None;
        breaker.record_failure();
        let second = breaker.remaining_cooldown().unwrap();
        assert!(second > first);
    }
}
