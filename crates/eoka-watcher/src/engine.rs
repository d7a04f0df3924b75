//! Watcher matching: one priority-ordered check-and-dismiss pass.

use crate::driver::AutomationDriver;
use crate::element::{ActionArgs, ActionKind};
use crate::registry::WatcherRegistry;
use crate::watcher::Watcher;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Run one pass over the registry's watchers. Returns whether any watcher fired.
///
/// Every active watcher is evaluated, in `ordered_snapshot` order, even after an
/// earlier one fires: lower-priority watchers may cover unrelated interstitials.
/// A watcher whose dismissal fails is skipped for this pass without error.
/// Once the registry's session is cancelled the pass stops, cutting any
/// cooldown short.
pub async fn check_watchers<D>(driver: &D, registry: &mut WatcherRegistry) -> bool
where
    D: AutomationDriver + ?Sized,
{
    if !registry.is_enabled() {
        debug!("watchers disabled, skipping check");
        return false;
    }
    let cancel = registry.cancellation().clone();
    if cancel.is_cancelled() {
        debug!("session ended, skipping check");
        return false;
    }
    let watchers = registry.ordered_snapshot();
    if watchers.is_empty() {
        return false;
    }

    let mut fired = false;
    for watcher in &watchers {
        if cancel.is_cancelled() {
            break;
        }
        if !watcher.is_active() {
            continue;
        }
        if !dismiss(driver, watcher).await {
            continue;
        }

        registry.record_trigger(&watcher.name);
        fired = true;
        info!(
            "watcher '{}' dismissed interstitial (trigger #{})",
            watcher.name,
            watcher.trigger_count + 1
        );
        if watcher.stop_on_found {
            registry.mark_inactive(&watcher.name);
            debug!("watcher '{}' deactivated after first dismissal", watcher.name);
        } else if watcher.cooldown_ms > 0 {
            debug!("watcher '{}' cooling down {}ms", watcher.name, watcher.cooldown_ms);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(watcher.cooldown_ms)) => {}
                _ = cancel.cancelled() => {
                    debug!("watcher '{}' cooldown cut short, session ended", watcher.name);
                    break;
                }
            }
        }
    }
    fired
}

/// Detect and dismiss one watcher's interstitial. Returns whether it was dismissed.
async fn dismiss<D>(driver: &D, watcher: &Watcher) -> bool
where
    D: AutomationDriver + ?Sized,
{
    if let Err(e) = driver.locate_one(&watcher.reference_locator).await {
        debug!("watcher '{}': reference not present ({})", watcher.name, e);
        return false;
    }

    let button = match driver.locate_one(&watcher.action_locator).await {
        Ok(id) => id,
        Err(e) => {
            warn!(
                "watcher '{}': action element {} not found: {}",
                watcher.name, watcher.action_locator, e
            );
            return false;
        }
    };
    if let Err(e) = driver
        .act(&button, ActionKind::Click, &ActionArgs::none())
        .await
    {
        warn!("watcher '{}': dismissal click failed: {}", watcher.name, e);
        return false;
    }
    true
}
