//! The automation driver seam.
//!
//! The watcher core never talks to a browser directly. Everything it needs from
//! the remote automation target goes through [`AutomationDriver`].

use crate::element::{ActionArgs, ActionKind, ElementId};
use crate::locator::Locator;
use async_trait::async_trait;

/// Failure reported by a driver call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// No element matched the locator.
    #[error("no such element: {0}")]
    NotFound(String),

    /// The element reference no longer points at a live element.
    #[error("stale element reference: {0}")]
    StaleReference(String),

    /// Anything else (transport, script, protocol).
    #[error("{0}")]
    Other(String),
}

impl DriverError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, DriverError::StaleReference(_))
    }
}

/// Result type for driver calls.
pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Operations the watcher core consumes from the automation target.
#[async_trait]
pub trait AutomationDriver: Send + Sync {
    /// Locate a single element. Fails with [`DriverError::NotFound`] when nothing matches.
    async fn locate_one(&self, locator: &Locator) -> DriverResult<ElementId>;

    /// Locate every matching element, in document order. Empty when nothing matches.
    async fn locate_many(&self, locator: &Locator) -> DriverResult<Vec<ElementId>>;

    /// Invoke `action` on `element`.
    async fn act(
        &self,
        element: &ElementId,
        action: ActionKind,
        args: &ActionArgs,
    ) -> DriverResult<serde_json::Value>;
}
