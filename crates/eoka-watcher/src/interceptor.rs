//! Intercepted driver operations.
//!
//! Lookups and element actions go through here. When one fails in a way an
//! interstitial could explain, the session's watchers get one pass; if any fired,
//! the operation is retried exactly once.

use crate::cache::{CachedElementRef, ElementSource};
use crate::driver::{AutomationDriver, DriverError};
use crate::element::{ActionArgs, ActionKind, ElementId};
use crate::engine::check_watchers;
use crate::locator::Locator;
use crate::registry::WatcherRegistry;
use crate::session::WatchSession;
use crate::{Error, Result};
use std::future::Future;
use tracing::debug;

/// What to return when the retry itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnRetryFailure {
    /// Surface the result of the first attempt.
    KeepOriginal,
    /// Surface the retry's error.
    Surface,
}

/// Run the matching engine and retry once, if `needs_recovery` says so.
///
/// `record` sees whichever successful value is returned.
async fn recover_once<D, T, Fut>(
    driver: &D,
    registry: &mut WatcherRegistry,
    original: Result<T>,
    needs_recovery: impl FnOnce(&Result<T>) -> bool,
    mut record: impl FnMut(&T),
    retry: impl FnOnce() -> Fut,
    on_retry_failure: OnRetryFailure,
) -> Result<T>
where
    D: AutomationDriver + ?Sized,
    Fut: Future<Output = Result<T>>,
{
    if !needs_recovery(&original) {
        if let Ok(value) = &original {
            record(value);
        }
        return original;
    }

    if !check_watchers(driver, registry).await {
        debug!("no watcher fired, returning original result");
        return original;
    }
    if registry.is_cancelled() {
        debug!("session ended during watcher pass, returning original result");
        return original;
    }

    debug!("watcher fired, retrying once");
    match retry().await {
        Ok(value) => {
            record(&value);
            Ok(value)
        }
        Err(e) => match on_retry_failure {
            OnRetryFailure::KeepOriginal => {
                debug!("retry failed ({}), returning original result", e);
                original
            }
            OnRetryFailure::Surface => Err(e),
        },
    }
}

fn lookup_failed<T>(result: &Result<T>) -> bool {
    matches!(result, Err(Error::NotFound(_) | Error::StaleReference(_)))
}

fn empty_or_failed<T>(result: &Result<Vec<T>>) -> bool {
    match result {
        Ok(found) => found.is_empty(),
        Err(_) => true,
    }
}

fn went_stale<T>(result: &Result<T>) -> bool {
    matches!(result, Err(Error::StaleReference(_)))
}

impl WatchSession {
    /// Locate a single element, recovering once from an interstitial.
    pub async fn find_element<D>(&mut self, driver: &D, locator: &Locator) -> Result<ElementId>
    where
        D: AutomationDriver + ?Sized,
    {
        let original = driver.locate_one(locator).await.map_err(Error::from);
        let cache = &mut self.cache;
        recover_once(
            driver,
            &mut self.registry,
            original,
            lookup_failed,
            |id| cache.record_single(id, locator),
            || async { driver.locate_one(locator).await.map_err(Error::from) },
            OnRetryFailure::KeepOriginal,
        )
        .await
    }

    /// Locate every matching element, recovering once from an interstitial.
    ///
    /// An empty result is not an error; it is returned as-is when nothing could
    /// be dismissed or the retry fails.
    pub async fn find_elements<D>(
        &mut self,
        driver: &D,
        locator: &Locator,
    ) -> Result<Vec<ElementId>>
    where
        D: AutomationDriver + ?Sized,
    {
        let original = driver.locate_many(locator).await.map_err(Error::from);
        let cache = &mut self.cache;
        recover_once(
            driver,
            &mut self.registry,
            original,
            empty_or_failed,
            |ids| {
                if !ids.is_empty() {
                    cache.record_many(ids, locator);
                }
            },
            || async { driver.locate_many(locator).await.map_err(Error::from) },
            OnRetryFailure::KeepOriginal,
        )
        .await
    }

    /// Invoke an action on an element, recovering once from a stale reference.
    ///
    /// `element` may be an id that was remapped by an earlier recovery.
    pub async fn element_action<D>(
        &mut self,
        driver: &D,
        element: &ElementId,
        action: ActionKind,
        args: &ActionArgs,
    ) -> Result<serde_json::Value>
    where
        D: AutomationDriver + ?Sized,
    {
        args.check(action)?;
        let resolved = self.cache.resolve_or_self(element);
        if &resolved != element {
            debug!("element {} resolves to {}", element, resolved);
        }
        let original = driver
            .act(&resolved, action, args)
            .await
            .map_err(Error::from);

        let cache = &mut self.cache;
        let retry = move || async move {
            let cached = cache.lookup(&resolved).ok_or_else(|| {
                Error::RecoveryImpossible(format!(
                    "element {} went stale and no locator is cached for it",
                    resolved
                ))
            })?;
            let fresh = relocate(driver, &cached).await?;
            cache.insert(&fresh, &cached.locator, cached.source);
            // Rewrites `element` too when it was already mapped onto `resolved`.
            cache.remap_id(&resolved, &fresh);
            debug!("retrying {} on {} (was {})", action, fresh, resolved);
            driver.act(&fresh, action, args).await.map_err(Error::from)
        };

        recover_once(
            driver,
            &mut self.registry,
            original,
            went_stale,
            |_| {},
            retry,
            OnRetryFailure::Surface,
        )
        .await
    }
}

/// Find a stale element again using the locator that produced it.
async fn relocate<D>(driver: &D, cached: &CachedElementRef) -> Result<ElementId>
where
    D: AutomationDriver + ?Sized,
{
    let found = match cached.source {
        ElementSource::Single => driver.locate_one(&cached.locator).await,
        ElementSource::Indexed(index) => {
            driver
                .locate_many(&cached.locator)
                .await
                .and_then(|ids| {
                    ids.into_iter().nth(index).ok_or_else(|| {
                        DriverError::NotFound(format!("no element at index {}", index))
                    })
                })
        }
    };
    found.map_err(|e| {
        Error::RecoveryImpossible(format!(
            "cached locator {} no longer resolves: {}",
            cached.locator, e
        ))
    })
}
