//! # eoka-watcher
//!
//! Interstitial watchers for browser automation. Register declarative watchers
//! once per session; when a lookup or element action fails the way a consent
//! banner or promo overlay would make it fail, the watchers are checked, a
//! matching one is dismissed, and the operation is retried once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use eoka_watcher::{AutomationDriver, Locator, SessionManager, WatchConfig, WatcherSpec};
//!
//! # async fn run(driver: &impl AutomationDriver) -> eoka_watcher::Result<()> {
//! let mut sessions = SessionManager::new(&WatchConfig::default())?;
//! let handle = sessions.open("tab-1");
//! let mut session = handle.lock().await;
//! session.registry_mut().add(
//!     WatcherSpec::new(
//!         "cookies",
//!         Locator::css("#cookie-banner"),
//!         Locator::css("#cookie-banner .accept"),
//!         60_000,
//!     )
//!     .priority(10),
//! )?;
//!
//! // Dismisses the banner and retries if it was in the way.
//! let button = session.find_element(driver, &Locator::css("#checkout")).await?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod driver;
pub mod element;
pub mod engine;
mod interceptor;
pub mod locator;
pub mod registry;
pub mod session;
pub mod watcher;

pub use cache::{CachedElementRef, ElementReferenceCache, ElementSource};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Limits, WatchConfig};
pub use driver::{AutomationDriver, DriverError, DriverResult};
pub use element::{ActionArgs, ActionKind, ElementId, WireElementRef};
pub use engine::check_watchers;
pub use locator::{Locator, Strategy};
pub use registry::WatcherRegistry;
pub use session::{EndReason, SessionManager, SharedSession, WatchSession, WatcherList};
pub use watcher::{RawWatcherSpec, Watcher, WatcherSpec, WatcherStatus, WatcherSummary};

/// Result type for eoka-watcher operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while registering watchers or running intercepted calls.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("watcher limit reached ({max} per session)")]
    CapacityExceeded { max: usize },

    #[error("watcher '{0}' is already registered")]
    DuplicateName(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("stale element reference: {0}")]
    StaleReference(String),

    #[error("recovery impossible: {0}")]
    RecoveryImpossible(String),

    #[error("driver error: {0}")]
    Driver(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("yaml parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::CapacityExceeded { .. } => "capacity_error",
            Error::DuplicateName(_) => "duplicate_name_error",
            Error::NotFound(_) => "not_found_error",
            Error::StaleReference(_) => "stale_reference_error",
            Error::RecoveryImpossible(_) => "recovery_impossible_error",
            Error::Driver(_) => "driver_error",
            Error::Config(_) | Error::Yaml(_) | Error::Io(_) => "config_error",
        }
    }
}

impl From<DriverError> for Error {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::NotFound(msg) => Error::NotFound(msg),
            DriverError::StaleReference(msg) => Error::StaleReference(msg),
            DriverError::Other(msg) => Error::Driver(msg),
        }
    }
}
