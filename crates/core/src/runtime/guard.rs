use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Admission check run before any work in a cycle.
#[async_trait]
pub trait UsageGuard: Send + Sync {
    async fn allows(&self, identity: &str) -> bool;

    /// Messages admitted for `identity` within the guard's rate window,
    /// including the current one. Guards that do not track rate report zero.
    async fn recent_rate(&self, _identity: &str) -> u32 {
        0
    }
}

/// Admits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unmetered;

#[async_trait]
impl UsageGuard for Unmetered {
    async fn allows(&self, _identity: &str) -> bool {
        true
    }
}

/// Admits at most `limit` cycles per identity for the lifetime of the guard.
#[derive(Debug)]
pub struct CycleQuota {
    limit: u32,
    used: Mutex<HashMap<String, u32>>,
}

impl CycleQuota {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: Mutex::new(HashMap::new()) }
    }

    pub fn used(&self, identity: &str) -> u32 {
        self.used.lock().unwrap_or_else(|e| e.into_inner()).get(identity).copied().unwrap_or(0)
    }
}

#[async_trait]
impl UsageGuard for CycleQuota {
    async fn allows(&self, identity: &str) -> bool {
        let mut used = self.used.lock().unwrap_or_else(|e| e.into_inner());
        let count = used.entry(identity.to_string()).or_insert(0);
        if *count >= self.limit {
            tracing::info!(identity, limit = self.limit, "cycle quota exhausted");
            return false;
        }
        *count += 1;
        true
    }
}

/// Admits everything and counts admissions per identity over a sliding window.
#[derive(Debug)]
pub struct MessageRate {
    window: Duration,
    seen: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl MessageRate {
    pub fn per_minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    pub fn new(window: Duration) -> Self {
        Self { window, seen: Mutex::new(HashMap::new()) }
    }

    fn count(&self, identity: &str, now: Instant, record: bool) -> u32 {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let times = seen.entry(identity.to_string()).or_default();
        while times.front().is_some_and(|t| now.duration_since(*t) > self.window) {
            times.pop_front();
        }
        if record {
            times.push_back(now);
        }
        u32::try_from(times.len()).unwrap_or(u32::MAX)
    }
}

impl Default for MessageRate {
    fn default() -> Self {
        Self::per_minute()
    }
}

#[async_trait]
impl UsageGuard for MessageRate {
    async fn allows(&self, identity: &str) -> bool {
        self.count(identity, Instant::now(), true);
        true
    }

    async fn recent_rate(&self, identity: &str) -> u32 {
        self.count(identity, Instant::now(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unmetered_admits() {
        assert!(Unmetered.allows("anyone").await);
    }

    #[tokio::test]
    async fn quota_is_per_identity() {
        let q = CycleQuota::new(2);
        assert!(q.allows("a").await);
        assert!(q.allows("a").await);
        assert!(!q.allows("a").await);
        assert!(q.allows("b").await);
        assert_eq!(q.used("a"), 2);
        assert_eq!(q.used("c"), 0);
        assert_eq!(q.recent_rate("a").await, 0);
    }

    #[tokio::test]
    async fn rate_counts_admissions_per_identity() {
        let r = MessageRate::per_minute();
        for _ in 0..3 {
            assert!(r.allows("a").await);
        }
        assert!(r.allows("b").await);
        assert_eq!(r.recent_rate("a").await, 3);
        assert_eq!(r.recent_rate("b").await, 1);
        assert_eq!(r.recent_rate("c").await, 0);
    }

    #[test]
    fn rate_forgets_messages_outside_the_window() {
        let r = MessageRate::new(Duration::from_secs(60));
        let start = Instant::now();
        r.count("a", start, true);
        r.count("a", start + Duration::from_secs(30), true);
        assert_eq!(r.count("a", start + Duration::from_secs(59), false), 2);
        assert_eq!(r.count("a", start + Duration::from_secs(75), false), 1);
        assert_eq!(r.count("a", start + Duration::from_secs(200), false), 0);
    }
}
