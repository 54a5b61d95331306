//! Usage ledger backing rate, cost and execution-count rules.
//!
//! Counters are kept per key (`session:<id>`, `user:<id>`) in a fixed set of
//! mutex shards, plus one global counter for the daily cost ceiling. Every
//! observation reads the prior usage and records the current request inside
//! the same critical section, and a request id is recorded at most once per
//! key so re-checks of one request never double count.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, PoisonError};

const SHARDS: usize = 16;

/// Entries older than this are pruned on the next observation of the key.
const RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone)]
struct UsageEntry {
    at: DateTime<Utc>,
    request_id: String,
    tokens: u64,
}

#[derive(Debug, Default)]
struct KeyUsage {
    entries: Vec<UsageEntry>,
    /// Tokens ever recorded for the key; survives pruning.
    lifetime_tokens: u64,
    executions: HashMap<String, u32>,
}

impl KeyUsage {
    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(RETENTION_DAYS);
        self.entries.retain(|e| e.at >= cutoff);
    }

    fn snapshot(&self, request_id: &str, now: DateTime<Utc>) -> UsageSnapshot {
        let mut snap = UsageSnapshot::default();
        let minute = now - Duration::minutes(1);
        let hour = now - Duration::hours(1);
        let day = now - Duration::days(1);
        for entry in self.entries.iter().filter(|e| e.request_id != request_id) {
            if entry.at >= minute {
                snap.requests_minute += 1;
                snap.tokens_minute += entry.tokens;
            }
            if entry.at >= hour {
                snap.requests_hour += 1;
                snap.tokens_hour += entry.tokens;
            }
            if entry.at >= day {
                snap.requests_day += 1;
                snap.tokens_day += entry.tokens;
            }
        }
        let own: u64 = self
            .entries
            .iter()
            .filter(|e| e.request_id == request_id)
            .map(|e| e.tokens)
            .sum();
        snap.lifetime_tokens = self.lifetime_tokens.saturating_sub(own);
        snap
    }

    fn record(&mut self, request_id: &str, tokens: u64, now: DateTime<Utc>) {
        if self.entries.iter().any(|e| e.request_id == request_id) {
            return;
        }
        self.entries.push(UsageEntry {
            at: now,
            request_id: request_id.to_string(),
            tokens,
        });
        self.lifetime_tokens += tokens;
    }
}

/// Usage recorded for a key before the current request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub requests_minute: u32,
    pub requests_hour: u32,
    pub requests_day: u32,
    pub tokens_minute: u64,
    pub tokens_hour: u64,
    pub tokens_day: u64,
    pub lifetime_tokens: u64,
}

/// Sharded per-key usage counters.
pub struct UsageLedger {
    shards: Vec<Mutex<HashMap<String, KeyUsage>>>,
    global: Mutex<KeyUsage>,
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageLedger {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            global: Mutex::new(KeyUsage::default()),
        }
    }

    pub fn session_key(session_id: &str) -> String {
        format!("session:{session_id}")
    }

    pub fn user_key(user_id: Option<&str>) -> String {
        format!("user:{}", user_id.unwrap_or("anonymous"))
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, KeyUsage>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    /// Read prior usage for `key` and record this request, atomically.
    pub fn observe(&self, key: &str, request_id: &str, tokens: u64, now: DateTime<Utc>) -> UsageSnapshot {
        let mut shard = self.shard(key).lock().unwrap_or_else(PoisonError::into_inner);
        let usage = shard.entry(key.to_string()).or_default();
        usage.prune(now);
        let snap = usage.snapshot(request_id, now);
        usage.record(request_id, tokens, now);
        snap
    }

    /// Same as [`observe`](Self::observe) for the cross-session counter.
    pub fn observe_global(&self, request_id: &str, tokens: u64, now: DateTime<Utc>) -> UsageSnapshot {
        let mut usage = self.global.lock().unwrap_or_else(PoisonError::into_inner);
        usage.prune(now);
        let snap = usage.snapshot(request_id, now);
        usage.record(request_id, tokens, now);
        snap
    }

    /// Count one completed execution of `capability` under `key`.
    pub fn record_execution(&self, key: &str, capability: &str) {
        let mut shard = self.shard(key).lock().unwrap_or_else(PoisonError::into_inner);
        *shard
            .entry(key.to_string())
            .or_default()
            .executions
            .entry(capability.to_string())
            .or_insert(0) += 1;
    }

    /// Executions recorded under `key` for capabilities accepted by `filter`.
    pub fn executions_matching(&self, key: &str, filter: impl Fn(&str) -> bool) -> u32 {
        let shard = self.shard(key).lock().unwrap_or_else(PoisonError::into_inner);
        shard
            .get(key)
            .map(|u| {
                u.executions
                    .iter()
                    .filter(|(cap, _)| filter(cap))
                    .map(|(_, n)| *n)
                    .sum()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_request_counts_once() {
        let ledger = UsageLedger::new();
        let now = Utc::now();
        let first = ledger.observe("session:s", "r1", 10, now);
        assert_eq!(first.requests_minute, 0);
        let again = ledger.observe("session:s", "r1", 10, now);
        assert_eq!(again.requests_minute, 0);
        assert_eq!(again.lifetime_tokens, 0);
        let next = ledger.observe("session:s", "r2", 5, now);
        assert_eq!(next.requests_minute, 1);
        assert_eq!(next.tokens_minute, 10);
        assert_eq!(next.lifetime_tokens, 10);
    }

    #[test]
    fn windows_roll() {
        let ledger = UsageLedger::new();
        let now = Utc::now();
        ledger.observe("k", "old", 100, now - Duration::minutes(30));
        ledger.observe("k", "older", 100, now - Duration::hours(5));
        let snap = ledger.observe("k", "now", 1, now);
        assert_eq!(snap.requests_minute, 0);
        assert_eq!(snap.requests_hour, 1);
        assert_eq!(snap.requests_day, 2);
        assert_eq!(snap.tokens_day, 200);
    }

    #[test]
    fn keys_are_independent() {
        let ledger = UsageLedger::new();
        let now = Utc::now();
        ledger.observe("session:a", "r1", 1, now);
        let snap = ledger.observe("session:b", "r2", 1, now);
        assert_eq!(snap.requests_minute, 0);
        let global = ledger.observe_global("r1", 1, now);
        assert_eq!(global.requests_day, 0);
        assert_eq!(ledger.observe_global("r2", 1, now).requests_day, 1);
    }

    #[test]
    fn executions_filtered() {
        let ledger = UsageLedger::new();
        ledger.record_execution("session:s", "calculator");
        ledger.record_execution("session:s", "calculator");
        ledger.record_execution("session:s", "web_search");
        assert_eq!(ledger.executions_matching("session:s", |_| true), 3);
        assert_eq!(ledger.executions_matching("session:s", |c| c == "calculator"), 2);
        assert_eq!(ledger.executions_matching("session:other", |_| true), 0);
    }
}
