//! YAML config schema: limits and preset watchers.

use crate::watcher::{RawWatcherSpec, WatcherSpec};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::path::Path;

/// Top-level config structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WatchConfig {
    /// Per-session limits.
    #[serde(default)]
    pub limits: Limits,

    /// Watchers registered on every new session.
    #[serde(default)]
    pub watchers: Vec<RawWatcherSpec>,
}

impl WatchConfig {
    /// Load config from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    /// Parse config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self> {
        let config: WatchConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate limits and preset watchers.
    pub fn validate(&self) -> Result<()> {
        self.limits.validate()?;
        self.presets()?;
        Ok(())
    }

    /// Preset watchers, validated against the configured limits.
    pub fn presets(&self) -> Result<Vec<WatcherSpec>> {
        if self.watchers.len() > self.limits.max_watchers {
            return Err(Error::Config(format!(
                "{} preset watchers exceed limits.max_watchers ({})",
                self.watchers.len(),
                self.limits.max_watchers
            )));
        }
        let mut seen = HashSet::new();
        let mut specs = Vec::with_capacity(self.watchers.len());
        for (i, raw) in self.watchers.iter().enumerate() {
            let spec = raw
                .validate(&self.limits)
                .map_err(|e| Error::Config(format!("watchers[{}]: {}", i, e)))?;
            if !seen.insert(spec.name.clone()) {
                return Err(Error::Config(format!(
                    "watchers[{}]: duplicate watcher name '{}'",
                    i, spec.name
                )));
            }
            specs.push(spec);
        }
        Ok(specs)
    }
}

/// Per-session resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum unexpired watchers per session.
    pub max_watchers: usize,
    /// Upper bound on a watcher's duration.
    pub max_duration_ms: u64,
    /// Element reference cache capacity.
    pub max_cache_entries: usize,
    /// Element reference time-to-live.
    pub cache_ttl_ms: u64,
}

impl Limits {
    pub const MAX_WATCHERS_RANGE: RangeInclusive<usize> = 1..=20;
    pub const MAX_DURATION_RANGE: RangeInclusive<u64> = 1_000..=600_000;
    pub const MAX_CACHE_ENTRIES_RANGE: RangeInclusive<usize> = 10..=200;
    pub const CACHE_TTL_RANGE: RangeInclusive<u64> = 5_000..=300_000;

    /// Reject any limit outside its allowed range.
    pub fn validate(&self) -> Result<()> {
        check_range("max_watchers", self.max_watchers, Self::MAX_WATCHERS_RANGE)?;
        check_range("max_duration_ms", self.max_duration_ms, Self::MAX_DURATION_RANGE)?;
        check_range(
            "max_cache_entries",
            self.max_cache_entries,
            Self::MAX_CACHE_ENTRIES_RANGE,
        )?;
        check_range("cache_ttl_ms", self.cache_ttl_ms, Self::CACHE_TTL_RANGE)?;
        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_watchers: 5,
            max_duration_ms: 60_000,
            max_cache_entries: 50,
            cache_ttl_ms: 60_000,
        }
    }
}

fn check_range<T>(field: &str, value: T, range: RangeInclusive<T>) -> Result<()>
where
    T: PartialOrd + std::fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "limits.{} must be between {} and {}, got {}",
            field,
            range.start(),
            range.end(),
            value
        )))
    }
}
