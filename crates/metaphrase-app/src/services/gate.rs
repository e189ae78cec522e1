//! Rate-limit gate: per-provider-group admission control.
//!
//! Each limit key owns a pair of token buckets, one for requests per minute
//! and one for tokens per minute. Buckets refill lazily on every query from
//! a monotonic clock; a zero limit disables that dimension. `wait` blocks
//! until both dimensions can be satisfied, sleeping in cancellation-aware
//! slices of at most 200 ms. There is no waiter queue; concurrent waiters
//! race on re-evaluation, which is acceptable for the small, bounded worker
//! pools driving this gate.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::pipeline::error::{PipelineError, PipelineResult};

/// Rate-limit grouping key, usually derived from provider identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitKey(String);

impl LimitKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for LimitKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Per-key limit configuration. A zero disables that dimension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    pub rpm: usize,
    pub tpm: usize,
    pub max_tokens_per_request: usize,
}

impl Limits {
    pub fn is_unlimited(&self) -> bool {
        self.rpm == 0 && self.tpm == 0 && self.max_tokens_per_request == 0
    }
}

/// One admission request.
#[derive(Debug, Clone)]
pub struct Ask<'a> {
    pub key: &'a LimitKey,
    /// Must be >= 1.
    pub requests: usize,
    pub tokens: usize,
}

const MIN_SLEEP: Duration = Duration::from_millis(10);
const MAX_SLEEP_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug)]
struct Bucket {
    capacity: usize,
    level: f64,
    rate_per_sec: f64,
    last: Instant,
}

impl Bucket {
    fn new(capacity: usize, now: Instant) -> Self {
        Self {
            capacity,
            level: capacity as f64,
            rate_per_sec: capacity as f64 / 60.0,
            last: now,
        }
    }

    fn disabled(now: Instant) -> Self {
        Self { capacity: 0, level: 0.0, rate_per_sec: 0.0, last: now }
    }

    fn enabled(&self) -> bool {
        self.capacity > 0
    }

    fn refill(&mut self, now: Instant) {
        if !self.enabled() {
            return;
        }
        // A clock that appears to go backwards counts as zero elapsed time.
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        self.level = (self.level + elapsed * self.rate_per_sec).min(self.capacity as f64);
        self.last = now;
    }

    fn can_take(&self, n: usize) -> bool {
        !self.enabled() || n == 0 || self.level >= n as f64
    }

    fn take(&mut self, n: usize) {
        if !self.enabled() || n == 0 {
            return;
        }
        self.level = (self.level - n as f64).max(0.0);
    }

    fn wait_secs_for(&self, n: usize) -> f64 {
        if !self.enabled() || n == 0 {
            return 0.0;
        }
        let deficit = n as f64 - self.level;
        if deficit <= 0.0 {
            return 0.0;
        }
        deficit / self.rate_per_sec
    }

    fn available(&self) -> usize {
        if !self.enabled() {
            return 0;
        }
        self.level.clamp(0.0, self.capacity as f64) as usize
    }
}

#[derive(Debug)]
struct Entry {
    limits: Limits,
    requests: Bucket,
    tokens: Bucket,
}

impl Entry {
    fn new(limits: Limits, now: Instant) -> Self {
        let requests = if limits.rpm > 0 {
            Bucket::new(limits.rpm, now)
        } else {
            Bucket::disabled(now)
        };
        let tokens = if limits.tpm > 0 {
            Bucket::new(limits.tpm, now)
        } else {
            Bucket::disabled(now)
        };
        Self { limits, requests, tokens }
    }
}

/// Concurrency-safe rate-limit gate over a static key→limits map. Keys not
/// present in the map are unlimited.
#[derive(Debug)]
pub struct RateGate {
    entries: Mutex<HashMap<LimitKey, Entry>>,
}

impl RateGate {
    pub fn new(limits: HashMap<LimitKey, Limits>) -> Self {
        let now = Instant::now();
        let entries = limits
            .into_iter()
            .map(|(key, lim)| (key, Entry::new(lim, now)))
            .collect();
        Self { entries: Mutex::new(entries) }
    }

    fn validate(&self, ask: &Ask<'_>) -> PipelineResult<()> {
        if ask.requests == 0 {
            return Err(PipelineError::invalid("gate ask must request at least 1"));
        }
        let entries = self.entries.lock().expect("gate mutex poisoned");
        if let Some(entry) = entries.get(ask.key) {
            let cap = entry.limits.max_tokens_per_request;
            if cap > 0 && ask.tokens > cap {
                return Err(PipelineError::invalid(format!(
                    "request of {} tokens exceeds the per-request cap of {cap}",
                    ask.tokens
                )));
            }
        }
        Ok(())
    }

    /// Non-blocking admission attempt.
    pub fn try_acquire(&self, ask: &Ask<'_>) -> bool {
        if self.validate(ask).is_err() {
            return false;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("gate mutex poisoned");
        let Some(entry) = entries.get_mut(ask.key) else {
            return true;
        };
        entry.requests.refill(now);
        entry.tokens.refill(now);
        if entry.requests.can_take(ask.requests) && entry.tokens.can_take(ask.tokens) {
            entry.requests.take(ask.requests);
            entry.tokens.take(ask.tokens);
            true
        } else {
            false
        }
    }

    /// Blocks until both dimensions admit the ask, or cancellation.
    pub async fn wait(&self, ctx: &CancellationToken, ask: &Ask<'_>) -> PipelineResult<()> {
        self.validate(ask)?;
        loop {
            if ctx.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let wait_secs = {
                let now = Instant::now();
                let mut entries = self.entries.lock().expect("gate mutex poisoned");
                let Some(entry) = entries.get_mut(ask.key) else {
                    return Ok(());
                };
                entry.requests.refill(now);
                entry.tokens.refill(now);
                if entry.requests.can_take(ask.requests) && entry.tokens.can_take(ask.tokens) {
                    entry.requests.take(ask.requests);
                    entry.tokens.take(ask.tokens);
                    return Ok(());
                }
                entry
                    .requests
                    .wait_secs_for(ask.requests)
                    .max(entry.tokens.wait_secs_for(ask.tokens))
            };
            let sleep = Duration::from_secs_f64(wait_secs)
                .max(MIN_SLEEP)
                .min(MAX_SLEEP_SLICE);
            tokio::select! {
                _ = ctx.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    /// Diagnostic floor of current availability `(requests, tokens)` for a
    /// key. Never affects admission.
    pub fn snapshot(&self, key: &LimitKey) -> (usize, usize) {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("gate mutex poisoned");
        let Some(entry) = entries.get_mut(key) else {
            return (0, 0);
        };
        entry.requests.refill(now);
        entry.tokens.refill(now);
        (entry.requests.available(), entry.tokens.available())
    }
}

/// Derives the rate-limit grouping key for a provider: the client name plus
/// a hash of the resolved API key, so distinct accounts of one provider get
/// independent buckets. Resolution order: explicit `api_key`, then the
/// environment variable named by `api_key_env`; the mock client falls back
/// to its built-in debug key.
pub fn derive_limit_key(
    client: &str,
    options: Option<&serde_json::Value>,
) -> PipelineResult<LimitKey> {
    let pick = |field: &str| -> Option<String> {
        options
            .and_then(|v| v.get(field))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let mut key = pick("api_key");
    if key.is_none() {
        if let Some(env_name) = pick("api_key_env") {
            key = std::env::var(&env_name).ok().filter(|s| !s.is_empty());
        }
    }
    if key.is_none() && client == "mock" {
        key = Some(crate::services::llm::mock::MOCK_DEBUG_KEY.to_string());
    }
    let Some(key) = key else {
        return Err(PipelineError::invalid(format!(
            "no api key available to derive a rate-limit key for client {client}"
        )));
    };
    let digest = blake3::hash(key.as_bytes());
    Ok(LimitKey::new(format!("{client}:{}", digest.to_hex())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_gate(rpm: usize, tpm: usize, cap: usize) -> (RateGate, LimitKey) {
        let key = LimitKey::from("test");
        let mut map = HashMap::new();
        map.insert(key.clone(), Limits { rpm, tpm, max_tokens_per_request: cap });
        (RateGate::new(map), key)
    }

    #[tokio::test]
    async fn unknown_keys_are_unlimited() {
        let (gate, _) = make_gate(1, 1, 0);
        let other = LimitKey::from("other");
        let ask = Ask { key: &other, requests: 100, tokens: 1_000_000 };
        assert!(gate.try_acquire(&ask));
        gate.wait(&CancellationToken::new(), &ask).await.expect("unlimited key");
    }

    #[tokio::test]
    async fn per_request_cap_rejects_immediately() {
        let (gate, key) = make_gate(10, 1000, 50);
        let ask = Ask { key: &key, requests: 1, tokens: 51 };
        let err = gate.wait(&CancellationToken::new(), &ask).await.unwrap_err();
        assert_eq!(err.code(), crate::pipeline::error::ErrorCode::Invariant);
        assert!(!gate.try_acquire(&ask));

        let exact = Ask { key: &key, requests: 1, tokens: 50 };
        assert!(gate.try_acquire(&exact));
    }

    #[tokio::test]
    async fn zero_requests_is_invalid() {
        let (gate, key) = make_gate(10, 0, 0);
        let ask = Ask { key: &key, requests: 0, tokens: 0 };
        assert!(gate.wait(&CancellationToken::new(), &ask).await.is_err());
    }

    #[tokio::test]
    async fn dimensions_are_enforced_independently() {
        let (gate, key) = make_gate(2, 100, 0);
        let ask = Ask { key: &key, requests: 1, tokens: 10 };
        assert!(gate.try_acquire(&ask));
        assert!(gate.try_acquire(&ask));
        // rpm bucket exhausted even though tpm has room
        assert!(!gate.try_acquire(&ask));

        let (gate, key) = make_gate(100, 20, 0);
        let ask = Ask { key: &key, requests: 1, tokens: 15 };
        assert!(gate.try_acquire(&ask));
        assert!(!gate.try_acquire(&ask));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_blocks_until_refill() {
        let (gate, key) = make_gate(60, 0, 0); // refills 1 request per second
        let ctx = CancellationToken::new();
        for _ in 0..60 {
            gate.wait(&ctx, &Ask { key: &key, requests: 1, tokens: 0 })
                .await
                .expect("initial burst fits capacity");
        }
        assert!(!gate.try_acquire(&Ask { key: &key, requests: 1, tokens: 0 }));

        let started = Instant::now();
        gate.wait(&ctx, &Ask { key: &key, requests: 1, tokens: 0 })
            .await
            .expect("wait must succeed after refill");
        // One request refills in ~1s of virtual time.
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn sixty_second_window_never_exceeds_limits() {
        let (gate, key) = make_gate(10, 100, 0);
        let ctx = CancellationToken::new();
        let mut granted_requests = 0usize;
        let mut granted_tokens = 0usize;
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(30) {
            let ask = Ask { key: &key, requests: 1, tokens: 7 };
            if gate.try_acquire(&ask) {
                granted_requests += 1;
                granted_tokens += 7;
            } else {
                tokio::time::advance(Duration::from_millis(250)).await;
            }
        }
        // Capacity plus half a minute of refill, per dimension.
        assert!(granted_requests <= 10 + 5, "granted {granted_requests} requests");
        assert!(granted_tokens <= 100 + 50 + 7, "granted {granted_tokens} tokens");
        drop(ctx);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_observes_cancellation_during_sleep() {
        let (gate, key) = make_gate(1, 0, 0);
        let ctx = CancellationToken::new();
        gate.wait(&ctx, &Ask { key: &key, requests: 1, tokens: 0 })
            .await
            .expect("first request fits");

        let waiter = {
            let ctx = ctx.clone();
            let key = key.clone();
            tokio::spawn(async move {
                let ask = Ask { key: &key, requests: 1, tokens: 0 };
                gate.wait(&ctx, &ask).await
            })
        };
        tokio::time::advance(Duration::from_millis(50)).await;
        ctx.cancel();
        let err = waiter.await.expect("task joins").unwrap_err();
        assert_eq!(err.code(), crate::pipeline::error::ErrorCode::Cancel);
    }

    #[tokio::test]
    async fn snapshot_reports_floor_without_admitting() {
        let (gate, key) = make_gate(10, 40, 0);
        let (req, tok) = gate.snapshot(&key);
        assert_eq!((req, tok), (10, 40));
        assert!(gate.try_acquire(&Ask { key: &key, requests: 2, tokens: 10 }));
        let (req, tok) = gate.snapshot(&key);
        assert!(req <= 8);
        assert!(tok <= 30);
    }

    #[test]
    fn limit_key_derivation_hashes_the_api_key() {
        let opts = serde_json::json!({"api_key": "secret"});
        let a = derive_limit_key("openai", Some(&opts)).expect("explicit key");
        let b = derive_limit_key("openai", Some(&opts)).expect("explicit key");
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("openai:"));
        assert!(!a.as_str().contains("secret"));

        let mock = derive_limit_key("mock", None).expect("mock fallback");
        assert!(mock.as_str().starts_with("mock:"));

        assert!(derive_limit_key("openai", None).is_err());
    }
}
