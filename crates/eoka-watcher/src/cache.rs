//! Element reference cache.
//!
//! Remembers which locator produced each element id, so a stale reference can be
//! re-located after an interstitial is dismissed, and keeps the old-id to new-id
//! mapping that lets callers keep using the id they were handed.

use crate::clock::Clock;
use crate::element::ElementId;
use crate::locator::Locator;
use lru::LruCache;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

/// How a cached element was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementSource {
    /// Result of a single-element lookup.
    Single,
    /// Position in the result of a multi-element lookup.
    Indexed(usize),
}

/// Provenance of a previously located element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedElementRef {
    pub locator: Locator,
    pub source: ElementSource,
    pub created_at: u64,
}

#[derive(Debug)]
pub struct ElementReferenceCache {
    entries: LruCache<ElementId, CachedElementRef>,
    ttl_ms: u64,
    /// stale id -> replacement id. Targets are never keys themselves.
    forward: HashMap<ElementId, ElementId>,
    /// replacement id -> stale ids currently pointing at it.
    reverse: HashMap<ElementId, HashSet<ElementId>>,
    clock: Arc<dyn Clock>,
}

impl ElementReferenceCache {
    pub fn new(max_entries: usize, ttl_ms: u64, clock: Arc<dyn Clock>) -> Self {
        let cap = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(cap),
            ttl_ms,
            forward: HashMap::new(),
            reverse: HashMap::new(),
            clock,
        }
    }

    /// Remember an element found by a single-element lookup.
    pub fn record_single(&mut self, id: &ElementId, locator: &Locator) {
        self.insert(id, locator, ElementSource::Single);
    }

    /// Remember every element of a multi-element lookup with its position.
    pub fn record_many(&mut self, ids: &[ElementId], locator: &Locator) {
        for (index, id) in ids.iter().enumerate() {
            self.insert(id, locator, ElementSource::Indexed(index));
        }
    }

    /// Insert or overwrite an entry with an explicit source.
    pub fn insert(&mut self, id: &ElementId, locator: &Locator, source: ElementSource) {
        let entry = CachedElementRef {
            locator: locator.clone(),
            source,
            created_at: self.clock.now_ms(),
        };
        if let Some((evicted, _)) = self.entries.push(id.clone(), entry) {
            if &evicted != id {
                debug!("element cache full, evicted {}", evicted);
            }
        }
    }

    /// Look up an element's provenance. Expired entries are removed and reported absent.
    pub fn lookup(&mut self, id: &ElementId) -> Option<CachedElementRef> {
        let now = self.clock.now_ms();
        let expired = self
            .entries
            .peek(id)
            .map(|e| self.is_expired(e, now))?;
        if expired {
            debug!("element cache entry {} expired", id);
            self.entries.pop(id);
            return None;
        }
        self.entries.get(id).cloned()
    }

    /// Record that `old` has been replaced by `new`.
    ///
    /// Every mapping that currently resolves to `old` is rewritten to `new`, so
    /// resolution is always a single hop. `new` was just located, so any mapping
    /// it had of its own is dropped.
    pub fn remap_id(&mut self, old: &ElementId, new: &ElementId) {
        if old == new {
            return;
        }
        if let Some(previous) = self.forward.remove(new) {
            self.detach(&previous, new);
        }

        if let Some(sources) = self.reverse.remove(old) {
            for source in sources {
                self.forward.insert(source.clone(), new.clone());
                self.reverse.entry(new.clone()).or_default().insert(source);
            }
        }

        if let Some(previous) = self.forward.remove(old) {
            self.detach(&previous, old);
        }
        debug!("element {} remapped to {}", old, new);
        self.forward.insert(old.clone(), new.clone());
        self.reverse.entry(new.clone()).or_default().insert(old.clone());
    }

    /// The id `id` currently stands for, or `None` if it was never remapped.
    pub fn resolve(&self, id: &ElementId) -> Option<&ElementId> {
        self.forward.get(id)
    }

    /// Like [`resolve`](Self::resolve), falling back to `id` itself.
    pub fn resolve_or_self(&self, id: &ElementId) -> ElementId {
        self.resolve(id).cloned().unwrap_or_else(|| id.clone())
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn cleanup(&mut self) -> usize {
        let now = self.clock.now_ms();
        let expired: Vec<ElementId> = self
            .entries
            .iter()
            .filter(|(_, e)| self.is_expired(e, now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            self.entries.pop(id);
        }
        if !expired.is_empty() {
            debug!("element cache swept {} expired entries", expired.len());
        }
        expired.len()
    }

    /// Drop all entries and mappings.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.forward.clear();
        self.reverse.clear();
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn mapping_count(&self) -> usize {
        self.forward.len()
    }

    fn is_expired(&self, entry: &CachedElementRef, now: u64) -> bool {
        now.saturating_sub(entry.created_at) > self.ttl_ms
    }

    fn detach(&mut self, target: &ElementId, source: &ElementId) {
        if let Some(set) = self.reverse.get_mut(target) {
            set.remove(source);
            if set.is_empty() {
                self.reverse.remove(target);
            }
        }
    }
}
