//! Per-client sliding-window admission.
//!
//! Every client (origin address plus a short user-agent hash) keeps two
//! insertion-ordered timestamp queues, one per horizon. A request is admitted
//! only if both queues, after dropping entries older than the horizon, are
//! below their limits. Stale clients are evicted by a periodic sweep rather
//! than on the request path.

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::ConfigError;
use crate::metrics::{ACTIVE_CLIENTS, ADMISSIONS_DENIED};

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;

/// The subset of an inbound request the controller looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    pub origin: String,
    pub user_agent: String,
}

impl RequestMeta {
    /// `forwarded_for` wins over the socket peer; only its first hop is used.
    pub fn new(forwarded_for: Option<&str>, remote_addr: &str, user_agent: &str) -> Self {
        let origin = forwarded_for
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|hop| !hop.is_empty())
            .unwrap_or(remote_addr);

        Self { origin: origin.to_string(), user_agent: user_agent.to_string() }
    }
}

/// Rate-limit subject key: `{origin}:{8 hex chars of the user-agent hash}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ClientFingerprint(String);

impl ClientFingerprint {
    pub fn from_meta(meta: &RequestMeta) -> Self {
        let digest = Sha256::digest(meta.user_agent.as_bytes());
        let hex = format!("{digest:x}");
        Self(format!("{}:{}", meta.origin, &hex[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which horizon rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    PerMinute,
    PerHour,
}

impl LimitReason {
    pub fn message(&self) -> &'static str {
        match self {
            LimitReason::PerMinute => "Too many requests per minute",
            LimitReason::PerHour => "Too many requests per hour",
        }
    }

    pub fn retry_after(&self) -> Duration {
        match self {
            LimitReason::PerMinute => Duration::from_secs(60),
            LimitReason::PerHour => Duration::from_secs(3600),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitReason::PerMinute => "per_minute",
            LimitReason::PerHour => "per_hour",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Denied(LimitReason),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }

    pub fn reason(&self) -> Option<LimitReason> {
        match self {
            Admission::Allowed => None,
            Admission::Denied(reason) => Some(*reason),
        }
    }
}

/// Per-horizon limits. `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AdmissionLimits {
    per_minute: Option<u32>,
    per_hour: Option<u32>,
}

impl AdmissionLimits {
    pub fn new(per_minute: Option<u32>, per_hour: Option<u32>) -> Result<Self, ConfigError> {
        if per_minute == Some(0) || per_hour == Some(0) {
            return Err(ConfigError::Invalid(
                "rate limits must be positive; use unbounded to disable a horizon".into(),
            ));
        }
        if let (Some(minute), Some(hour)) = (per_minute, per_hour) {
            if minute > hour {
                return Err(ConfigError::Invalid(format!(
                    "per-minute limit {minute} exceeds per-hour limit {hour}"
                )));
            }
        }
        Ok(Self { per_minute, per_hour })
    }

    pub fn per_minute(&self) -> Option<u32> {
        self.per_minute
    }

    pub fn per_hour(&self) -> Option<u32> {
        self.per_hour
    }
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self { per_minute: Some(10), per_hour: Some(100) }
    }
}

/// Timestamps (epoch millis) of admitted requests for one client
#[derive(Debug, Default)]
pub struct ClientWindow {
    minute_hits: VecDeque<i64>,
    hour_hits: VecDeque<i64>,
}

impl ClientWindow {
    fn trim(&mut self, now_ms: i64) {
        trim_before(&mut self.minute_hits, now_ms - MINUTE_MS);
        trim_before(&mut self.hour_hits, now_ms - HOUR_MS);
    }

    fn is_empty(&self) -> bool {
        self.minute_hits.is_empty() && self.hour_hits.is_empty()
    }
}

fn trim_before(hits: &mut VecDeque<i64>, cutoff: i64) {
    while hits.front().is_some_and(|&t| t < cutoff) {
        hits.pop_front();
    }
}

fn over_limit(hits: &VecDeque<i64>, limit: Option<u32>) -> bool {
    limit.is_some_and(|limit| hits.len() >= limit as usize)
}

/// Result of one eviction pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub evicted: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    pub enabled: bool,
    pub active_clients: usize,
    pub total_minute_requests: usize,
    pub total_hour_requests: usize,
    pub requests_per_minute_limit: Option<u32>,
    pub requests_per_hour_limit: Option<u32>,
}

pub struct AdmissionController {
    windows: DashMap<ClientFingerprint, ClientWindow>,
    limits: AdmissionLimits,
    enabled: bool,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    pub fn new(enabled: bool, limits: AdmissionLimits, clock: Arc<dyn Clock>) -> Self {
        Self { windows: DashMap::new(), limits, enabled, clock }
    }

    pub fn admit(&self, meta: &RequestMeta) -> Admission {
        if !self.enabled {
            return Admission::Allowed;
        }
        self.admit_fingerprint(&ClientFingerprint::from_meta(meta))
    }

    pub fn admit_fingerprint(&self, fingerprint: &ClientFingerprint) -> Admission {
        if !self.enabled {
            return Admission::Allowed;
        }
        let now_ms = self.clock.now().timestamp_millis();

        // The shard lock is held for the whole check-and-record step.
        let mut window = self.windows.entry(fingerprint.clone()).or_default();
        window.trim(now_ms);

        let decision = if over_limit(&window.minute_hits, self.limits.per_minute) {
            Admission::Denied(LimitReason::PerMinute)
        } else if over_limit(&window.hour_hits, self.limits.per_hour) {
            Admission::Denied(LimitReason::PerHour)
        } else {
            window.minute_hits.push_back(now_ms);
            window.hour_hits.push_back(now_ms);
            Admission::Allowed
        };

        if let Admission::Denied(reason) = decision {
            warn!(
                fingerprint = %fingerprint,
                reason = reason.as_str(),
                minute_hits = window.minute_hits.len(),
                hour_hits = window.hour_hits.len(),
                "Rate limit exceeded"
            );
            ADMISSIONS_DENIED.with_label_values(&[reason.as_str()]).inc();
        }
        decision
    }

    /// Trim every client's windows and drop clients with nothing left.
    /// Locks one shard at a time, so unrelated admits keep flowing.
    pub fn sweep(&self) -> SweepStats {
        let now_ms = self.clock.now().timestamp_millis();
        let before = self.windows.len();

        self.windows.retain(|_, window| {
            window.trim(now_ms);
            !window.is_empty()
        });

        let remaining = self.windows.len();
        ACTIVE_CLIENTS.set(remaining as f64);
        SweepStats { evicted: before.saturating_sub(remaining), remaining }
    }

    /// Read-only view; never inserts entries.
    pub fn snapshot(&self) -> AdmissionSnapshot {
        let now_ms = self.clock.now().timestamp_millis();
        let (mut minute, mut hour) = (0, 0);

        for entry in self.windows.iter() {
            minute += entry.minute_hits.iter().filter(|&&t| t >= now_ms - MINUTE_MS).count();
            hour += entry.hour_hits.iter().filter(|&&t| t >= now_ms - HOUR_MS).count();
        }

        AdmissionSnapshot {
            enabled: self.enabled,
            active_clients: self.windows.len(),
            total_minute_requests: minute,
            total_hour_requests: hour,
            requests_per_minute_limit: self.limits.per_minute,
            requests_per_hour_limit: self.limits.per_hour,
        }
    }

    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Periodic client eviction, independent of the admit path.
pub fn spawn_client_sweeper(
    controller: Arc<AdmissionController>,
    sweep_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        info!(interval = ?sweep_interval, "Client window sweeper started");

        loop {
            ticker.tick().await;
            let stats = controller.sweep();
            debug!(
                evicted = stats.evicted,
                active_clients = stats.remaining,
                "Rate limiter cleanup completed"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Local, TimeDelta};

    fn controller(minute: Option<u32>, hour: Option<u32>) -> (AdmissionController, ManualClock) {
        let clock = ManualClock::new(Local::now());
        let limits = AdmissionLimits::new(minute, hour).unwrap();
        (AdmissionController::new(true, limits, Arc::new(clock.clone())), clock)
    }

    fn meta(ip: &str) -> RequestMeta {
        RequestMeta::new(None, ip, "test-agent/1.0")
    }

    #[test]
    fn origin_prefers_first_forwarded_hop() {
        let m = RequestMeta::new(Some(" 203.0.113.7 , 10.0.0.1"), "127.0.0.1", "ua");
        assert_eq!(m.origin, "203.0.113.7");

        let m = RequestMeta::new(Some(""), "127.0.0.1", "ua");
        assert_eq!(m.origin, "127.0.0.1");
    }

    #[test]
    fn fingerprint_is_origin_plus_short_hash() {
        let fp = ClientFingerprint::from_meta(&RequestMeta::new(None, "10.1.2.3", ""));
        let (origin, hash) = fp.as_str().rsplit_once(':').unwrap();
        assert_eq!(origin, "10.1.2.3");
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));

        let again = ClientFingerprint::from_meta(&RequestMeta::new(None, "10.1.2.3", ""));
        assert_eq!(fp, again);
        let other_agent = ClientFingerprint::from_meta(&RequestMeta::new(None, "10.1.2.3", "x"));
        assert_ne!(fp, other_agent);
    }

    #[test]
    fn minute_limit_then_window_slides() {
        let (ctl, clock) = controller(Some(3), Some(100));
        let m = meta("1.1.1.1");

        for _ in 0..3 {
            assert!(ctl.admit(&m).is_allowed());
        }
        assert_eq!(ctl.admit(&m), Admission::Denied(LimitReason::PerMinute));

        clock.advance(TimeDelta::seconds(61));
        assert!(ctl.admit(&m).is_allowed());
    }

    #[test]
    fn denied_requests_are_not_recorded() {
        let (ctl, clock) = controller(Some(1), Some(100));
        let m = meta("1.1.1.1");

        assert!(ctl.admit(&m).is_allowed());
        for _ in 0..5 {
            assert!(!ctl.admit(&m).is_allowed());
        }
        clock.advance(TimeDelta::seconds(61));
        assert!(ctl.admit(&m).is_allowed());
        assert_eq!(ctl.snapshot().total_hour_requests, 2);
    }

    #[test]
    fn unbounded_horizon_never_denies() {
        let (ctl, _clock) = controller(None, Some(5));
        let m = meta("2.2.2.2");
        for _ in 0..5 {
            assert!(ctl.admit(&m).is_allowed());
        }
        assert_eq!(ctl.admit(&m), Admission::Denied(LimitReason::PerHour));
    }

    #[test]
    fn disabled_controller_admits_without_tracking() {
        let clock = ManualClock::new(Local::now());
        let ctl = AdmissionController::new(
            false,
            AdmissionLimits::new(Some(1), Some(1)).unwrap(),
            Arc::new(clock),
        );
        for _ in 0..10 {
            assert!(ctl.admit(&meta("3.3.3.3")).is_allowed());
        }
        assert_eq!(ctl.snapshot().active_clients, 0);
    }

    #[test]
    fn sweep_evicts_idle_clients_only() {
        let (ctl, clock) = controller(Some(10), Some(100));
        ctl.admit(&meta("4.4.4.4"));
        clock.advance(TimeDelta::minutes(30));
        ctl.admit(&meta("5.5.5.5"));

        clock.advance(TimeDelta::minutes(31));
        let stats = ctl.sweep();

        assert_eq!(stats, SweepStats { evicted: 1, remaining: 1 });
        let snap = ctl.snapshot();
        assert_eq!(snap.active_clients, 1);
        assert_eq!(snap.total_minute_requests, 0);
        assert_eq!(snap.total_hour_requests, 1);
    }

    #[test]
    fn snapshot_does_not_create_entries() {
        let (ctl, _clock) = controller(Some(10), Some(100));
        let snap = ctl.snapshot();
        assert_eq!(snap.active_clients, 0);
        assert_eq!(snap.requests_per_minute_limit, Some(10));
        assert_eq!(snap.requests_per_hour_limit, Some(100));
    }

    #[test]
    fn limits_reject_out_of_range() {
        assert!(AdmissionLimits::new(Some(0), Some(10)).is_err());
        assert!(AdmissionLimits::new(Some(20), Some(10)).is_err());
        assert!(AdmissionLimits::new(None, None).is_ok());
        assert!(AdmissionLimits::new(Some(20), None).is_ok());
    }
}
