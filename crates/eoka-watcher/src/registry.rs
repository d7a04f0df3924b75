//! Per-session watcher definitions and their lifecycle state.

use crate::clock::Clock;
use crate::config::Limits;
use crate::watcher::{RawWatcherSpec, Watcher, WatcherSpec, WatcherStatus, WatcherSummary};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Owns a session's watchers.
///
/// Expired watchers are invisible to every read, even before they are pruned.
#[derive(Debug)]
pub struct WatcherRegistry {
    watchers: HashMap<String, Watcher>,
    limits: Limits,
    enabled: bool,
    next_seq: u64,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl WatcherRegistry {
    pub fn new(limits: Limits, clock: Arc<dyn Clock>) -> Self {
        Self::with_cancellation(limits, clock, CancellationToken::new())
    }

    /// Registry whose pending waits end when `cancel` fires.
    pub fn with_cancellation(
        limits: Limits,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            watchers: HashMap::new(),
            limits,
            enabled: true,
            next_seq: 0,
            clock,
            cancel,
        }
    }

    /// Validate a raw registration against this registry's limits and add it.
    pub fn register(&mut self, raw: &RawWatcherSpec) -> Result<WatcherSummary> {
        let spec = raw.validate(&self.limits)?;
        self.add(spec)
    }

    /// Add a watcher.
    pub fn add(&mut self, spec: WatcherSpec) -> Result<WatcherSummary> {
        if spec.duration_ms == 0 || spec.duration_ms > self.limits.max_duration_ms {
            return Err(Error::Validation(format!(
                "duration must be between 1 and {} ms, got {}",
                self.limits.max_duration_ms, spec.duration_ms
            )));
        }
        if spec.cooldown_ms > self.limits.max_duration_ms {
            return Err(Error::Validation(format!(
                "cooldownMs must be at most {} ms, got {}",
                self.limits.max_duration_ms, spec.cooldown_ms
            )));
        }

        let now = self.clock.now_ms();
        if self
            .watchers
            .get(&spec.name)
            .is_some_and(|w| !w.is_expired(now))
        {
            return Err(Error::DuplicateName(spec.name));
        }
        let live = self.watchers.values().filter(|w| !w.is_expired(now)).count();
        if live >= self.limits.max_watchers {
            return Err(Error::CapacityExceeded {
                max: self.limits.max_watchers,
            });
        }

        let watcher = Watcher::new(spec, now, self.next_seq);
        self.next_seq += 1;
        let summary = watcher.summary();
        info!(
            "watcher '{}' registered (priority {}, expires at {})",
            watcher.name, watcher.priority, watcher.expires_at
        );
        // Replaces an expired watcher of the same name, if any.
        self.watchers.insert(watcher.name.clone(), watcher);
        Ok(summary)
    }

    /// Remove a watcher. Returns whether an unexpired one existed.
    pub fn remove(&mut self, name: &str) -> bool {
        let now = self.clock.now_ms();
        match self.watchers.remove(name) {
            Some(w) => {
                debug!("watcher '{}' removed", name);
                !w.is_expired(now)
            }
            None => false,
        }
    }

    /// Get a watcher by name.
    pub fn get(&self, name: &str) -> Option<&Watcher> {
        let now = self.clock.now_ms();
        self.watchers.get(name).filter(|w| !w.is_expired(now))
    }

    /// Drop expired watchers. Returns how many were pruned.
    pub fn prune(&mut self) -> usize {
        let now = self.clock.now_ms();
        let before = self.watchers.len();
        self.watchers.retain(|name, w| {
            let keep = !w.is_expired(now);
            if !keep {
                debug!("watcher '{}' expired", name);
            }
            keep
        });
        before - self.watchers.len()
    }

    /// Unexpired watchers, in no particular order.
    pub fn active_snapshot(&mut self) -> Vec<Watcher> {
        self.prune();
        self.watchers.values().cloned().collect()
    }

    /// Unexpired watchers, highest priority first, then oldest registration first.
    pub fn ordered_snapshot(&mut self) -> Vec<Watcher> {
        let mut watchers = self.active_snapshot();
        watchers.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.registered_at.cmp(&b.registered_at))
                .then(a.seq.cmp(&b.seq))
        });
        watchers
    }

    pub fn mark_inactive(&mut self, name: &str) {
        if let Some(w) = self.get_live_mut(name) {
            w.status = WatcherStatus::Inactive;
        }
    }

    pub fn record_trigger(&mut self, name: &str) {
        let now = self.clock.now_ms();
        if let Some(w) = self.get_live_mut(name) {
            w.trigger_count += 1;
            w.last_triggered_at = Some(now);
        }
    }

    /// Remove every watcher. Returns how many unexpired ones were removed.
    pub fn clear(&mut self) -> usize {
        self.prune();
        let removed = self.watchers.len();
        self.watchers.clear();
        removed
    }

    /// Number of unexpired watchers.
    pub fn len(&self) -> usize {
        let now = self.clock.now_ms();
        self.watchers.values().filter(|w| !w.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Token cancelled when the owning session ends.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    fn get_live_mut(&mut self, name: &str) -> Option<&mut Watcher> {
        let now = self.clock.now_ms();
        self.watchers.get_mut(name).filter(|w| !w.is_expired(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::locator::Locator;

    fn spec(name: &str, duration: u64) -> WatcherSpec {
        WatcherSpec::new(
            name,
            Locator::css(format!("#{}", name)),
            Locator::css(format!("#{} .close", name)),
            duration,
        )
    }

    fn registry(clock: &ManualClock) -> WatcherRegistry {
        WatcherRegistry::new(Limits::default(), Arc::new(clock.clone()))
    }

    #[test]
    fn test_add_sets_timestamps_and_defaults() {
        let clock = ManualClock::new(10_000);
        let mut reg = registry(&clock);
        let summary = reg.add(spec("a", 5_000)).unwrap();
        assert_eq!(summary.registered_at, 10_000);
        assert_eq!(summary.expires_at, 15_000);
        assert_eq!(summary.status, WatcherStatus::Active);

        let w = reg.get("a").unwrap();
        assert_eq!(w.trigger_count, 0);
        assert!(w.last_triggered_at.is_none());
        assert_eq!(w.priority, 0);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let clock = ManualClock::new(0);
        let mut reg = registry(&clock);
        reg.add(spec("a", 5_000)).unwrap();
        let err = reg.add(spec("a", 5_000)).unwrap_err();
        assert!(matches!(err, Error::DuplicateName(ref n) if n == "a"));
    }

    #[test]
    fn test_duplicate_name_allowed_after_expiry() {
        let clock = ManualClock::new(0);
        let mut reg = registry(&clock);
        reg.add(spec("a", 1_000)).unwrap();
        clock.advance(1_000);
        assert!(reg.add(spec("a", 1_000)).is_ok());
    }

    #[test]
    fn test_capacity_counts_only_unexpired() {
        let clock = ManualClock::new(0);
        let mut reg = registry(&clock);
        reg.add(spec("short", 1_000)).unwrap();
        for name in ["b", "c", "d", "e"] {
            reg.add(spec(name, 60_000)).unwrap();
        }
        let err = reg.add(spec("f", 60_000)).unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { max: 5 }));

        clock.advance(1_000);
        assert!(reg.add(spec("f", 60_000)).is_ok());
        assert_eq!(reg.len(), 5);
    }

    #[test]
    fn test_duration_over_limit_rejected() {
        let clock = ManualClock::new(0);
        let mut reg = registry(&clock);
        assert!(matches!(
            reg.add(spec("a", 60_001)),
            Err(Error::Validation(_))
        ));
        assert!(matches!(reg.add(spec("a", 0)), Err(Error::Validation(_))));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_cooldown_over_limit_rejected() {
        let clock = ManualClock::new(0);
        let mut reg = registry(&clock);
        let raw: RawWatcherSpec = serde_json::from_value(serde_json::json!({
            "name": "slow",
            "referenceLocator": {"using": "id", "value": "banner"},
            "actionLocator": {"using": "css selector", "value": "#banner .ok"},
            "duration": 10_000,
            "cooldownMs": 1_000_000_000_000u64,
        }))
        .unwrap();
        assert!(matches!(reg.register(&raw), Err(Error::Validation(_))));
        assert!(matches!(
            reg.add(spec("slow", 10_000).cooldown_ms(60_001)),
            Err(Error::Validation(_))
        ));
        assert!(reg.is_empty());
        assert!(reg.add(spec("slow", 10_000).cooldown_ms(60_000)).is_ok());
    }

    #[test]
    fn test_expired_watchers_are_invisible() {
        let clock = ManualClock::new(0);
        let mut reg = registry(&clock);
        reg.add(spec("a", 1_000)).unwrap();
        clock.advance(999);
        assert!(reg.get("a").is_some());
        clock.advance(1);
        assert!(reg.get("a").is_none());
        assert_eq!(reg.len(), 0);
        assert!(reg.active_snapshot().is_empty());
        assert!(!reg.remove("a"));
    }

    #[test]
    fn test_remove() {
        let clock = ManualClock::new(0);
        let mut reg = registry(&clock);
        reg.add(spec("a", 1_000)).unwrap();
        assert!(reg.remove("a"));
        assert!(!reg.remove("a"));
        assert!(!reg.remove("never"));
    }

    #[test]
    fn test_ordered_snapshot_priority_then_fifo() {
        let clock = ManualClock::new(0);
        let mut reg = registry(&clock);
        reg.add(spec("low", 60_000).priority(-1)).unwrap();
        clock.advance(1);
        reg.add(spec("mid-1", 60_000).priority(5)).unwrap();
        reg.add(spec("mid-2", 60_000).priority(5)).unwrap();
        clock.advance(1);
        reg.add(spec("high", 60_000).priority(10)).unwrap();
        reg.add(spec("mid-3", 60_000).priority(5)).unwrap();

        let order: Vec<_> = reg.ordered_snapshot().into_iter().map(|w| w.name).collect();
        assert_eq!(order, ["high", "mid-1", "mid-2", "mid-3", "low"]);

        let snap = reg.ordered_snapshot();
        for pair in snap.windows(2) {
            assert!(pair[0].priority >= pair[1].priority);
            if pair[0].priority == pair[1].priority {
                assert!(pair[0].registered_at <= pair[1].registered_at);
            }
        }
    }

    #[test]
    fn test_record_trigger_and_mark_inactive() {
        let clock = ManualClock::new(100);
        let mut reg = registry(&clock);
        reg.add(spec("a", 60_000)).unwrap();
        clock.advance(50);
        reg.record_trigger("a");
        reg.record_trigger("missing");
        reg.mark_inactive("a");
        reg.mark_inactive("missing");

        let w = reg.get("a").unwrap();
        assert_eq!(w.trigger_count, 1);
        assert_eq!(w.last_triggered_at, Some(150));
        assert_eq!(w.status, WatcherStatus::Inactive);
    }

    #[test]
    fn test_clear_counts_unexpired() {
        let clock = ManualClock::new(0);
        let mut reg = registry(&clock);
        reg.add(spec("a", 1_000)).unwrap();
        reg.add(spec("b", 5_000)).unwrap();
        reg.add(spec("c", 5_000)).unwrap();
        clock.advance(2_000);
        assert_eq!(reg.clear(), 2);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_global_gate() {
        let clock = ManualClock::new(0);
        let mut reg = registry(&clock);
        assert!(reg.is_enabled());
        reg.disable();
        assert!(!reg.is_enabled());
        reg.enable();
        assert!(reg.is_enabled());
    }
}
