//! Per-session state and the owned map of live sessions.

use crate::cache::ElementReferenceCache;
use crate::clock::{Clock, SystemClock};
use crate::config::{Limits, WatchConfig};
use crate::registry::WatcherRegistry;
use crate::watcher::{RawWatcherSpec, Watcher, WatcherSpec, WatcherSummary};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A session handle shared between the manager and in-flight calls.
pub type SharedSession = Arc<Mutex<WatchSession>>;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    /// The caller closed the session normally.
    Closed,
    /// The host lost the session (crash, transport failure, signal).
    Aborted,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::Closed => f.write_str("closed"),
            EndReason::Aborted => f.write_str("aborted"),
        }
    }
}

/// Response to `list`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherList {
    pub watchers: Vec<Watcher>,
    pub total_count: usize,
    pub enabled: bool,
}

/// One session's watchers and element cache.
///
/// Calls on a session are serialized by whoever holds it; nothing in here
/// locks. Waits inside a call end when the session's cancellation token fires.
#[derive(Debug)]
pub struct WatchSession {
    pub(crate) registry: WatcherRegistry,
    pub(crate) cache: ElementReferenceCache,
}

impl WatchSession {
    pub fn new(limits: Limits, clock: Arc<dyn Clock>) -> Self {
        Self::with_cancellation(limits, clock, CancellationToken::new())
    }

    pub fn with_cancellation(
        limits: Limits,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry: WatcherRegistry::with_cancellation(limits, clock.clone(), cancel),
            cache: ElementReferenceCache::new(limits.max_cache_entries, limits.cache_ttl_ms, clock),
        }
    }

    /// Token that fires when this session ends.
    pub fn cancellation(&self) -> &CancellationToken {
        self.registry.cancellation()
    }

    pub fn registry(&self) -> &WatcherRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut WatcherRegistry {
        &mut self.registry
    }

    pub fn cache(&self) -> &ElementReferenceCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ElementReferenceCache {
        &mut self.cache
    }

    /// Register a watcher from raw caller input.
    pub fn register(&mut self, raw: &RawWatcherSpec) -> Result<WatcherSummary> {
        self.registry.register(raw)
    }

    /// Unregister a watcher by name.
    pub fn unregister(&mut self, name: &str) -> Result<()> {
        if self.registry.remove(name) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("watcher '{}'", name)))
        }
    }

    /// Every unexpired watcher with its full state, highest priority first.
    pub fn list(&mut self) -> WatcherList {
        let watchers = self.registry.ordered_snapshot();
        WatcherList {
            total_count: watchers.len(),
            watchers,
            enabled: self.registry.is_enabled(),
        }
    }

    /// Remove every watcher. Returns how many were removed.
    pub fn clear_all(&mut self) -> usize {
        self.registry.clear()
    }

    pub fn enable(&mut self) -> &'static str {
        self.registry.enable();
        "watchers enabled"
    }

    pub fn disable(&mut self) -> &'static str {
        self.registry.disable();
        "watchers disabled"
    }

    /// Prune expired watchers and sweep expired cache entries.
    pub fn maintain(&mut self) {
        let watchers = self.registry.prune();
        let elements = self.cache.cleanup();
        if watchers + elements > 0 {
            debug!(
                "session maintenance pruned {} watchers, {} element refs",
                watchers, elements
            );
        }
    }

    /// Forget every element reference. Call when the document is replaced.
    pub fn reset_elements(&mut self) {
        self.cache.clear();
    }
}

/// Owned map from session id to that session's state.
///
/// Ending a session cancels its pending waits and drops the manager's handle,
/// so its registry and cache go away as soon as any in-flight call returns.
#[derive(Debug)]
pub struct SessionManager {
    sessions: HashMap<String, SessionEntry>,
    limits: Limits,
    presets: Vec<WatcherSpec>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug)]
struct SessionEntry {
    session: SharedSession,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(config: &WatchConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &WatchConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.limits.validate()?;
        Ok(Self {
            sessions: HashMap::new(),
            limits: config.limits,
            presets: config.presets()?,
            clock,
        })
    }

    /// Get a session, creating it (with preset watchers) if it does not exist.
    pub fn open(&mut self, id: &str) -> SharedSession {
        let limits = self.limits;
        let clock = &self.clock;
        let presets = &self.presets;
        let entry = self.sessions.entry(id.to_string()).or_insert_with(|| {
            let cancel = CancellationToken::new();
            let mut session = WatchSession::with_cancellation(limits, clock.clone(), cancel.clone());
            for spec in presets {
                if let Err(e) = session.registry.add(spec.clone()) {
                    warn!("preset watcher '{}' not registered: {}", spec.name, e);
                }
            }
            info!(
                "watch session {} opened ({} preset watchers)",
                id,
                session.registry.len()
            );
            SessionEntry {
                session: Arc::new(Mutex::new(session)),
                cancel,
            }
        });
        entry.session.clone()
    }

    pub fn get(&self, id: &str) -> Option<SharedSession> {
        self.sessions.get(id).map(|entry| entry.session.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sessions.keys().map(|k| k.as_str())
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// End one session. Returns whether it existed.
    ///
    /// Never waits on the session's lock: a call that is mid-cooldown is
    /// cancelled instead.
    pub fn end(&mut self, id: &str, reason: EndReason) -> bool {
        let Some(entry) = self.sessions.remove(id) else {
            return false;
        };
        entry.cancel.cancel();
        match entry.session.try_lock() {
            Ok(session) => info!(
                "watch session {} {} ({} watchers, {} element refs discarded)",
                id,
                reason,
                session.registry.len(),
                session.cache.len()
            ),
            Err(_) => info!("watch session {} {} (in-flight call cancelled)", id, reason),
        }
        true
    }

    /// End every session. Returns how many were ended.
    pub fn end_all(&mut self, reason: EndReason) -> usize {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        ids.iter().filter(|id| self.end(id, reason)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use serde_json::json;

    fn raw(name: &str, duration: u64) -> RawWatcherSpec {
        serde_json::from_value(json!({
            "name": name,
            "referenceLocator": {"using": "id", "value": name},
            "actionLocator": {"using": "css selector", "value": format!("#{} button", name)},
            "duration": duration,
        }))
        .unwrap()
    }

    fn manager(yaml: &str, clock: &ManualClock) -> SessionManager {
        let config = WatchConfig::parse(yaml).unwrap();
        SessionManager::with_clock(&config, Arc::new(clock.clone())).unwrap()
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let clock = ManualClock::new(0);
        let mut mgr = manager("{}", &clock);
        mgr.open("s1")
            .lock()
            .await
            .register(&raw("banner", 10_000))
            .unwrap();
        mgr.open("s2");
        assert_eq!(mgr.get("s1").unwrap().lock().await.registry().len(), 1);
        assert_eq!(mgr.get("s2").unwrap().lock().await.registry().len(), 0);
        // Same name is fine in another session.
        assert!(mgr
            .open("s2")
            .lock()
            .await
            .register(&raw("banner", 10_000))
            .is_ok());
    }

    #[tokio::test]
    async fn test_open_existing_returns_same_session() {
        let clock = ManualClock::new(0);
        let mut mgr = manager("{}", &clock);
        let first = mgr.open("s1");
        first.lock().await.register(&raw("banner", 10_000)).unwrap();
        assert!(Arc::ptr_eq(&first, &mgr.open("s1")));
        assert_eq!(mgr.open("s1").lock().await.registry().len(), 1);
        assert_eq!(mgr.len(), 1);
    }

    #[tokio::test]
    async fn test_presets_registered_on_open() {
        let clock = ManualClock::new(0);
        let yaml = r##"
watchers:
  - name: cookies
    reference_locator: { using: css selector, value: "#cookies" }
    action_locator: { using: css selector, value: "#cookies .accept" }
    duration: 30000
    priority: 3
"##;
        let mut mgr = manager(yaml, &clock);
        let list = mgr.open("tab-1").lock().await.list();
        assert_eq!(list.total_count, 1);
        assert_eq!(list.watchers[0].name, "cookies");
        assert_eq!(list.watchers[0].priority, 3);
        assert_eq!(list.watchers[0].registered_at, 0);
    }

    #[tokio::test]
    async fn test_end_discards_state() {
        let clock = ManualClock::new(0);
        let mut mgr = manager("{}", &clock);
        let old = mgr.open("s1");
        old.lock().await.register(&raw("banner", 10_000)).unwrap();
        assert!(mgr.end("s1", EndReason::Closed));
        assert!(!mgr.contains("s1"));
        assert!(!mgr.end("s1", EndReason::Closed));
        assert!(old.lock().await.cancellation().is_cancelled());
        // A reopened session starts empty.
        let reopened = mgr.open("s1");
        assert_eq!(reopened.lock().await.registry().len(), 0);
        assert!(!reopened.lock().await.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_end_all() {
        let clock = ManualClock::new(0);
        let mut mgr = manager("{}", &clock);
        let sessions: Vec<SharedSession> = ["a", "b", "c"].iter().map(|id| mgr.open(id)).collect();
        assert_eq!(mgr.end_all(EndReason::Aborted), 3);
        assert!(mgr.is_empty());
        for session in sessions {
            assert!(session.lock().await.cancellation().is_cancelled());
        }
    }

    #[tokio::test]
    async fn test_end_does_not_wait_for_busy_session() {
        let clock = ManualClock::new(0);
        let mut mgr = manager("{}", &clock);
        let busy = mgr.open("busy");
        let other = mgr.open("other");
        let guard = busy.lock().await;

        // Another session stays usable while this one is held.
        assert!(other.try_lock().is_ok());

        assert!(mgr.end("busy", EndReason::Aborted));
        assert!(guard.cancellation().is_cancelled());
        assert!(!other.lock().await.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_commands() {
        let clock = ManualClock::new(0);
        let mut mgr = manager("{}", &clock);
        let handle = mgr.open("s");
        let mut session = handle.lock().await;
        session.register(&raw("a", 10_000)).unwrap();
        session.register(&raw("b", 1_000)).unwrap();

        assert!(matches!(
            session.register(&raw("a", 10_000)),
            Err(Error::DuplicateName(_))
        ));
        assert!(matches!(session.unregister("zzz"), Err(Error::NotFound(_))));

        clock.advance(1_000);
        let list = session.list();
        assert_eq!(list.total_count, 1);
        assert!(list.enabled);

        assert_eq!(session.disable(), "watchers disabled");
        assert!(!session.list().enabled);
        session.enable();

        session.unregister("a").unwrap();
        session.register(&raw("c", 10_000)).unwrap();
        assert_eq!(session.clear_all(), 1);
        assert_eq!(session.list().total_count, 0);
    }

    #[tokio::test]
    async fn test_maintain_prunes() {
        let clock = ManualClock::new(0);
        let mut mgr = manager("limits: { cache_ttl_ms: 5000 }", &clock);
        let handle = mgr.open("s");
        let mut session = handle.lock().await;
        session.register(&raw("a", 1_000)).unwrap();
        session
            .cache_mut()
            .record_single(&"e1".into(), &crate::Locator::css("#x"));
        clock.advance(6_000);
        session.maintain();
        assert!(session.cache().is_empty());
        assert!(session.registry().is_empty());
    }
}
