// Message and connection rate limiting.
//
// Each rate identity (user id, or connection id for anonymous clients) owns
// a token bucket plus a short sliding window of accepted timestamps that caps
// bursts. Each source address owns a tracker with its live connection ids and
// an optional temporary block. Rejections feed a sliding-window abuse check
// that blocks the offending address.
//
// All operations take `now` explicitly so the gateway can drive them from
// `tokio::time` and tests can step the clock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{LimitKind, RateLimitError};

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// When false message checks always succeed. Connection ceilings and
    /// address blocks still apply.
    pub enabled: bool,
    /// Bucket capacity; refilled evenly across `window`.
    pub messages_per_window: u32,
    pub window: Duration,
    /// Share of the capacity that may be spent inside `burst_window`.
    pub burst_fraction: f64,
    pub burst_window: Duration,
    /// Span of the sliding window the abuse check looks back over.
    pub abuse_window: Duration,
    /// Rejections in the window must exceed this before a block is considered.
    pub abuse_min_rejections: u64,
    /// Rejected/total ratio that must be exceeded to block.
    pub abuse_rejection_ratio: f64,
    pub block_duration: Duration,
    /// Idle buckets older than this are dropped by `cleanup`.
    pub bucket_retention: Duration,
    pub max_connections_per_address: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            messages_per_window: 120,
            window: Duration::from_secs(60),
            burst_fraction: 0.5,
            burst_window: Duration::from_secs(10),
            abuse_window: Duration::from_secs(60),
            abuse_min_rejections: 20,
            abuse_rejection_ratio: 0.5,
            block_duration: Duration::from_secs(300),
            bucket_retention: Duration::from_secs(600),
            max_connections_per_address: 10,
        }
    }
}

impl RateLimitConfig {
    fn burst_limit(&self) -> usize {
        ((self.messages_per_window as f64) * self.burst_fraction).floor().max(1.0) as usize
    }
}

/// Check outcomes inside the trailing abuse window, oldest first.
#[derive(Debug, Clone, Default)]
struct AbuseWindow {
    outcomes: VecDeque<(Instant, bool)>,
    rejected: u64,
}

impl AbuseWindow {
    fn record(&mut self, now: Instant, rejected: bool) {
        self.outcomes.push_back((now, rejected));
        self.rejected += u64::from(rejected);
    }

    /// Forget outcomes at least `length` old.
    fn prune(&mut self, now: Instant, length: Duration) {
        while let Some(&(at, rejected)) = self.outcomes.front() {
            if now.saturating_duration_since(at) < length {
                break;
            }
            self.outcomes.pop_front();
            self.rejected -= u64::from(rejected);
        }
    }

    fn total(&self) -> u64 {
        self.outcomes.len() as u64
    }

    fn is_abusive(&self, config: &RateLimitConfig) -> bool {
        let total = self.total();
        total > 0
            && self.rejected > config.abuse_min_rejections
            && (self.rejected as f64 / total as f64) > config.abuse_rejection_ratio
    }
}

#[derive(Debug)]
struct RateBucket {
    tokens: u32,
    last_refill: Instant,
    accepted: VecDeque<Instant>,
    abuse: AbuseWindow,
    last_seen: Instant,
}

impl RateBucket {
    fn full(capacity: u32, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            accepted: VecDeque::new(),
            abuse: AbuseWindow::default(),
            last_seen: now,
        }
    }

    /// Credit whole tokens earned since `last_refill`. The refill mark only
    /// advances by the time those whole tokens represent so fractional
    /// progress carries over to the next check.
    fn refill(&mut self, now: Instant, capacity: u32, window: Duration) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned =
            (elapsed.as_secs_f64() / window.as_secs_f64() * f64::from(capacity)).floor() as u64;
        if earned == 0 {
            return;
        }

        let refilled = (u64::from(self.tokens) + earned).min(u64::from(capacity)) as u32;
        if refilled >= capacity {
            self.last_refill = now;
        } else {
            self.last_refill += window.mul_f64(earned as f64 / f64::from(capacity));
        }
        self.tokens = refilled;
    }

    fn prune_accepted(&mut self, now: Instant, burst_window: Duration) {
        while let Some(oldest) = self.accepted.front() {
            if now.saturating_duration_since(*oldest) >= burst_window {
                self.accepted.pop_front();
            } else {
                break;
            }
        }
    }
}

#[derive(Debug)]
struct AddressTracker {
    connections: HashSet<String>,
    first_connection: Option<Instant>,
    blocked_until: Option<Instant>,
    attempts: AbuseWindow,
    last_seen: Instant,
}

impl AddressTracker {
    fn new(now: Instant) -> Self {
        Self {
            connections: HashSet::new(),
            first_connection: None,
            blocked_until: None,
            attempts: AbuseWindow::default(),
            last_seen: now,
        }
    }

    fn block_remaining(&mut self, now: Instant) -> Option<Duration> {
        match self.blocked_until {
            Some(until) if until > now => Some(until - now),
            Some(_) => {
                self.blocked_until = None;
                None
            }
            None => None,
        }
    }
}

/// Outcome of a [`RateLimiter::cleanup`] pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub buckets_removed: usize,
    pub addresses_removed: usize,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: HashMap<String, RateBucket>,
    addresses: HashMap<IpAddr, AddressTracker>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, buckets: HashMap::new(), addresses: HashMap::new() }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Admit or reject one inbound message for `identity` arriving from `address`.
    ///
    /// Returns the tokens left in the bucket on success.
    pub fn check_message(
        &mut self,
        identity: &str,
        address: IpAddr,
        now: Instant,
    ) -> Result<u32, RateLimitError> {
        if let Some(remaining) = self.block_remaining(address, now) {
            return Err(RateLimitError {
                kind: LimitKind::Blocked,
                retry_after_secs: ceil_secs(remaining),
            });
        }

        let capacity = self.config.messages_per_window;
        if !self.config.enabled {
            return Ok(capacity);
        }

        let burst_limit = self.config.burst_limit();
        let bucket = self
            .buckets
            .entry(identity.to_owned())
            .or_insert_with(|| RateBucket::full(capacity, now));

        bucket.last_seen = now;
        bucket.abuse.prune(now, self.config.abuse_window);
        bucket.refill(now, capacity, self.config.window);
        bucket.prune_accepted(now, self.config.burst_window);

        let verdict = if bucket.tokens == 0 {
            let next_window = (bucket.last_refill + self.config.window).saturating_duration_since(now);
            Err(RateLimitError { kind: LimitKind::MessageRate, retry_after_secs: ceil_secs(next_window) })
        } else if bucket.accepted.len() >= burst_limit {
            let clears_at = bucket
                .accepted
                .front()
                .map(|oldest| (*oldest + self.config.burst_window).saturating_duration_since(now))
                .unwrap_or(self.config.burst_window);
            Err(RateLimitError { kind: LimitKind::Burst, retry_after_secs: ceil_secs(clears_at) })
        } else {
            bucket.tokens -= 1;
            bucket.accepted.push_back(now);
            Ok(bucket.tokens)
        };

        bucket.abuse.record(now, verdict.is_err());
        if let Err(error) = &verdict {
            debug!(identity, %address, kind = %error.kind, "message rate limited");
            if bucket.abuse.is_abusive(&self.config) {
                let (rejected, total) = (bucket.abuse.rejected, bucket.abuse.total());
                self.block(address, now, rejected, total);
            }
        }

        verdict
    }

    /// Check whether `address` may open `connection_id`.
    ///
    /// A connection id the address already holds is always allowed; that is
    /// the reconnect-with-same-id path.
    pub fn check_connection(
        &mut self,
        address: IpAddr,
        connection_id: &str,
        now: Instant,
    ) -> Result<(), RateLimitError> {
        if let Some(remaining) = self.block_remaining(address, now) {
            return Err(RateLimitError {
                kind: LimitKind::Blocked,
                retry_after_secs: ceil_secs(remaining),
            });
        }

        let max = self.config.max_connections_per_address;
        let tracker = self.addresses.entry(address).or_insert_with(|| AddressTracker::new(now));
        tracker.last_seen = now;
        tracker.attempts.prune(now, self.config.abuse_window);

        if tracker.connections.contains(connection_id) || tracker.connections.len() < max {
            tracker.attempts.record(now, false);
            return Ok(());
        }

        tracker.attempts.record(now, true);
        warn!(%address, limit = max, "connection limit reached for address");
        if tracker.attempts.is_abusive(&self.config) {
            let (rejected, total) = (tracker.attempts.rejected, tracker.attempts.total());
            self.block(address, now, rejected, total);
        }

        Err(RateLimitError { kind: LimitKind::ConnectionLimit, retry_after_secs: 1 })
    }

    /// Record a live connection for `address`. Idempotent per connection id.
    pub fn track_connection(&mut self, address: IpAddr, connection_id: &str, now: Instant) {
        let tracker = self.addresses.entry(address).or_insert_with(|| AddressTracker::new(now));
        if tracker.connections.is_empty() {
            tracker.first_connection = Some(now);
        }
        tracker.connections.insert(connection_id.to_owned());
        tracker.last_seen = now;
    }

    /// Forget a live connection. Safe to call for unknown ids.
    pub fn untrack_connection(&mut self, address: IpAddr, connection_id: &str) {
        if let Some(tracker) = self.addresses.get_mut(&address) {
            tracker.connections.remove(connection_id);
            if tracker.connections.is_empty() {
                tracker.first_connection = None;
            }
        }
    }

    pub fn connection_count(&self, address: IpAddr) -> usize {
        self.addresses.get(&address).map_or(0, |tracker| tracker.connections.len())
    }

    pub fn is_blocked(&mut self, address: IpAddr, now: Instant) -> bool {
        self.block_remaining(address, now).is_some()
    }

    /// Seconds left on an address block, if one is active.
    pub fn blocked_for(&mut self, address: IpAddr, now: Instant) -> Option<u64> {
        self.block_remaining(address, now).map(ceil_secs)
    }

    /// Clear the bucket for `identity` and, when given, the block and
    /// counters for `address`. Live connection tracking is kept.
    pub fn reset_limits(&mut self, identity: &str, address: Option<IpAddr>) {
        self.buckets.remove(identity);
        if let Some(address) = address {
            if let Some(tracker) = self.addresses.get_mut(&address) {
                tracker.blocked_until = None;
                tracker.attempts = AbuseWindow::default();
            }
        }
    }

    /// Drop idle buckets and trackers with no connections and no active block.
    pub fn cleanup(&mut self, now: Instant) -> CleanupReport {
        let retention = self.config.bucket_retention;

        let buckets_before = self.buckets.len();
        self.buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_seen) < retention);

        let addresses_before = self.addresses.len();
        self.addresses.retain(|_, tracker| {
            let blocked = tracker.blocked_until.is_some_and(|until| until > now);
            !tracker.connections.is_empty() || blocked
        });

        CleanupReport {
            buckets_removed: buckets_before - self.buckets.len(),
            addresses_removed: addresses_before - self.addresses.len(),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn blocked_address_count(&self, now: Instant) -> usize {
        self.addresses
            .values()
            .filter(|tracker| tracker.blocked_until.is_some_and(|until| until > now))
            .count()
    }

    fn block_remaining(&mut self, address: IpAddr, now: Instant) -> Option<Duration> {
        self.addresses.get_mut(&address).and_then(|tracker| tracker.block_remaining(now))
    }

    fn block(&mut self, address: IpAddr, now: Instant, rejected: u64, total: u64) {
        let tracker = self.addresses.entry(address).or_insert_with(|| AddressTracker::new(now));
        tracker.blocked_until = Some(now + self.config.block_duration);
        warn!(
            %address,
            rejected,
            total,
            block_secs = self.config.block_duration.as_secs(),
            "blocking address after sustained rate limit violations"
        );
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    const ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10));
    const OTHER_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 11));

    fn limiter(messages: u32, burst_fraction: f64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            messages_per_window: messages,
            burst_fraction,
            ..RateLimitConfig::default()
        })
    }

    #[test]
    fn full_bucket_admits_capacity_then_rejects_until_window_passes() {
        let mut limiter = limiter(10, 1.0);
        let start = Instant::now();

        for n in 0..10 {
            assert!(limiter.check_message("user-1", ADDR, start).is_ok(), "message {n}");
        }
        let rejected = limiter.check_message("user-1", ADDR, start).unwrap_err();
        assert_eq!(rejected.kind, LimitKind::MessageRate);
        assert!(rejected.retry_after_secs > 0);

        let later = start + Duration::from_secs(60);
        for n in 0..10 {
            assert!(limiter.check_message("user-1", ADDR, later).is_ok(), "refilled message {n}");
        }
    }

    #[test]
    fn partial_refill_credits_only_whole_tokens() {
        let mut limiter = limiter(10, 1.0);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.check_message("user-1", ADDR, start).expect("initial capacity");
        }

        // One token per 6s: 10s earns a single token.
        let t1 = start + Duration::from_secs(10);
        assert_eq!(limiter.check_message("user-1", ADDR, t1), Ok(0));
        assert!(limiter.check_message("user-1", ADDR, t1).is_err());

        // The 4s left over after the first token counts toward the next one.
        let t2 = start + Duration::from_secs(13);
        assert_eq!(limiter.check_message("user-1", ADDR, t2), Ok(0));
    }

    #[test]
    fn retry_after_reports_remaining_window_seconds() {
        let mut limiter = limiter(10, 1.0);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.check_message("user-1", ADDR, start).expect("initial capacity");
        }

        let rejected = limiter
            .check_message("user-1", ADDR, start + Duration::from_millis(500))
            .unwrap_err();
        assert_eq!(rejected.retry_after_secs, 60);
    }

    #[test]
    fn burst_is_capped_even_with_tokens_left() {
        let mut limiter = limiter(120, 0.5);
        let start = Instant::now();

        for n in 0..60 {
            assert!(limiter.check_message("user-1", ADDR, start).is_ok(), "message {n}");
        }
        let rejected = limiter.check_message("user-1", ADDR, start).unwrap_err();
        assert_eq!(rejected.kind, LimitKind::Burst);
        assert_eq!(rejected.retry_after_secs, 10);

        let after_burst = start + Duration::from_secs(10);
        assert!(limiter.check_message("user-1", ADDR, after_burst).is_ok());
    }

    #[test]
    fn identities_have_independent_buckets() {
        let mut limiter = limiter(2, 1.0);
        let now = Instant::now();
        limiter.check_message("a", ADDR, now).expect("a first");
        limiter.check_message("a", ADDR, now).expect("a second");
        assert!(limiter.check_message("a", ADDR, now).is_err());
        assert!(limiter.check_message("b", ADDR, now).is_ok());
    }

    #[test]
    fn sustained_rejections_block_the_address() {
        let mut limiter = limiter(10, 1.0);
        let now = Instant::now();

        let mut kinds = Vec::new();
        for _ in 0..40 {
            if let Err(error) = limiter.check_message("flooder", ADDR, now) {
                kinds.push(error.kind);
            }
        }

        assert!(kinds.contains(&LimitKind::Blocked), "flood should escalate to a block");
        assert!(limiter.is_blocked(ADDR, now));
        assert!(!limiter.is_blocked(OTHER_ADDR, now));

        let blocked = limiter.check_message("someone-else", ADDR, now).unwrap_err();
        assert_eq!(blocked.kind, LimitKind::Blocked);
        assert_eq!(blocked.retry_after_secs, 300);
        assert_eq!(
            limiter.check_connection(ADDR, "conn-new", now).unwrap_err().kind,
            LimitKind::Blocked
        );

        let expired = now + Duration::from_secs(301);
        assert!(!limiter.is_blocked(ADDR, expired));
        assert!(limiter.check_message("someone-else", ADDR, expired).is_ok());
    }

    #[test]
    fn few_rejections_do_not_block() {
        let mut limiter = limiter(10, 1.0);
        let now = Instant::now();
        for _ in 0..25 {
            let _ = limiter.check_message("user-1", ADDR, now);
        }
        // 15 rejections is under the minimum of 20.
        assert!(!limiter.is_blocked(ADDR, now));
    }

    #[test]
    fn abuse_counters_forget_outcomes_older_than_their_window() {
        let mut limiter = limiter(10, 1.0);
        let start = Instant::now();
        for _ in 0..25 {
            let _ = limiter.check_message("user-1", ADDR, start);
        }

        // The first 25 outcomes have aged out. A refilled bucket admits ten
        // and rejects ten, which is not enough on its own.
        let later = start + Duration::from_secs(61);
        for _ in 0..20 {
            let _ = limiter.check_message("user-1", ADDR, later);
        }
        assert!(!limiter.is_blocked(ADDR, later));
    }

    #[test]
    fn rejections_straddling_a_window_boundary_count_together() {
        let mut limiter = RateLimiter::new(RateLimitConfig {
            messages_per_window: 10,
            window: Duration::from_secs(3600),
            burst_fraction: 1.0,
            ..RateLimitConfig::default()
        });
        let start = Instant::now();
        for _ in 0..10 {
            limiter.check_message("user-1", ADDR, start).expect("initial capacity");
        }

        let before = start + Duration::from_secs(50);
        for _ in 0..15 {
            assert!(limiter.check_message("user-1", ADDR, before).is_err());
        }
        assert!(!limiter.is_blocked(ADDR, before));

        // 11s later the accepted burst has aged out, the 15 rejections have not.
        let after = start + Duration::from_secs(61);
        for _ in 0..15 {
            let _ = limiter.check_message("user-1", ADDR, after);
        }
        assert!(limiter.is_blocked(ADDR, after));
    }

    #[test]
    fn connection_limit_per_address() {
        let mut limiter = RateLimiter::new(RateLimitConfig {
            max_connections_per_address: 2,
            ..RateLimitConfig::default()
        });
        let now = Instant::now();

        for id in ["c1", "c2"] {
            limiter.check_connection(ADDR, id, now).expect("under limit");
            limiter.track_connection(ADDR, id, now);
        }
        assert_eq!(limiter.connection_count(ADDR), 2);

        let rejected = limiter.check_connection(ADDR, "c3", now).unwrap_err();
        assert_eq!(rejected.kind, LimitKind::ConnectionLimit);

        // Reusing a held id is the reconnect path and stays allowed.
        assert!(limiter.check_connection(ADDR, "c2", now).is_ok());
        // Tracking the same id twice does not double count.
        limiter.track_connection(ADDR, "c2", now);
        assert_eq!(limiter.connection_count(ADDR), 2);

        limiter.untrack_connection(ADDR, "c1");
        assert!(limiter.check_connection(ADDR, "c3", now).is_ok());
    }

    #[test]
    fn repeated_connection_violations_block_the_address() {
        let mut limiter = RateLimiter::new(RateLimitConfig {
            max_connections_per_address: 1,
            ..RateLimitConfig::default()
        });
        let now = Instant::now();
        limiter.check_connection(ADDR, "held", now).expect("first connection");
        limiter.track_connection(ADDR, "held", now);

        for n in 0..21 {
            let _ = limiter.check_connection(ADDR, &format!("extra-{n}"), now);
        }
        assert!(limiter.is_blocked(ADDR, now));
    }

    #[test]
    fn reset_limits_clears_bucket_and_block() {
        let mut limiter = limiter(10, 1.0);
        let now = Instant::now();
        for _ in 0..40 {
            let _ = limiter.check_message("flooder", ADDR, now);
        }
        assert!(limiter.is_blocked(ADDR, now));

        limiter.reset_limits("flooder", Some(ADDR));
        assert!(!limiter.is_blocked(ADDR, now));
        assert_eq!(limiter.check_message("flooder", ADDR, now), Ok(9));
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let mut limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            messages_per_window: 1,
            ..RateLimitConfig::default()
        });
        let now = Instant::now();
        for _ in 0..100 {
            assert!(limiter.check_message("user-1", ADDR, now).is_ok());
        }
    }

    #[test]
    fn disabled_limiter_still_honours_address_blocks() {
        let mut limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            max_connections_per_address: 1,
            ..RateLimitConfig::default()
        });
        let now = Instant::now();
        limiter.check_connection(ADDR, "held", now).expect("first connection");
        limiter.track_connection(ADDR, "held", now);
        for n in 0..21 {
            let _ = limiter.check_connection(ADDR, &format!("extra-{n}"), now);
        }
        assert!(limiter.is_blocked(ADDR, now));

        let blocked = limiter.check_message("user-1", ADDR, now).unwrap_err();
        assert_eq!(blocked.kind, LimitKind::Blocked);
        assert!(limiter.check_message("user-1", OTHER_ADDR, now).is_ok());
    }

    #[test]
    fn cleanup_drops_idle_buckets_and_empty_trackers() {
        let mut limiter = limiter(10, 1.0);
        let start = Instant::now();
        limiter.check_message("idle", ADDR, start).expect("first message");
        limiter.track_connection(OTHER_ADDR, "live", start);
        limiter.check_connection(ADDR, "probe", start).expect("tracker created");

        let report = limiter.cleanup(start + Duration::from_secs(601));
        assert_eq!(report, CleanupReport { buckets_removed: 1, addresses_removed: 1 });
        assert_eq!(limiter.bucket_count(), 0);
        assert_eq!(limiter.connection_count(OTHER_ADDR), 1);
    }
}
