//! Element locators: a closed set of strategies plus a selector value.

use crate::{Error, Result};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Element location strategy.
///
/// The set is closed: adding a strategy means adding a variant here and teaching
/// every driver how to resolve it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    CssSelector,
    XPath,
    Id,
    Name,
    ClassName,
    TagName,
    LinkText,
    PartialLinkText,
    AccessibilityId,
}

const STRATEGIES: &[(&str, Strategy)] = &[
    ("css selector", Strategy::CssSelector),
    ("xpath", Strategy::XPath),
    ("id", Strategy::Id),
    ("name", Strategy::Name),
    ("class name", Strategy::ClassName),
    ("tag name", Strategy::TagName),
    ("link text", Strategy::LinkText),
    ("partial link text", Strategy::PartialLinkText),
    ("accessibility id", Strategy::AccessibilityId),
];

impl Strategy {
    /// Wire spelling of this strategy.
    pub fn as_str(&self) -> &'static str {
        STRATEGIES
            .iter()
            .find(|(_, strategy)| strategy == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    /// All accepted wire spellings.
    pub fn names() -> impl Iterator<Item = &'static str> {
        STRATEGIES.iter().map(|(name, _)| *name)
    }
}

impl FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        STRATEGIES
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, strategy)| *strategy)
            .ok_or_else(|| {
                Error::Validation(format!(
                    "unknown locator strategy '{}', expected one of: {}",
                    s,
                    Strategy::names().collect::<Vec<_>>().join(", ")
                ))
            })
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Strategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Strategy {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A (strategy, value) pair identifying one or more elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub using: Strategy,
    pub value: String,
}

impl Locator {
    pub fn new(using: Strategy, value: impl Into<String>) -> Self {
        Self {
            using,
            value: value.into(),
        }
    }

    /// Shorthand for a CSS selector locator.
    pub fn css(value: impl Into<String>) -> Self {
        Self::new(Strategy::CssSelector, value)
    }

    /// Build a locator from a loosely typed `{using, value}` object.
    ///
    /// `field` names the offending field in validation messages.
    pub fn from_json(value: &serde_json::Value, field: &str) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| Error::Validation(format!("{} must be an object", field)))?;
        let using = obj
            .get("using")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Validation(format!("{}.using must be a string", field)))?;
        let val = obj
            .get("value")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Validation(format!("{}.value must be a string", field)))?;
        if val.is_empty() {
            return Err(Error::Validation(format!("{}.value must not be empty", field)));
        }
        Ok(Self::new(using.parse()?, val))
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.using, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_every_strategy() {
        for name in Strategy::names() {
            let s: Strategy = name.parse().unwrap();
            assert_eq!(s.as_str(), name);
        }
    }

    #[test]
    fn test_every_variant_has_a_wire_name() {
        for strategy in [
            Strategy::CssSelector,
            Strategy::XPath,
            Strategy::Id,
            Strategy::Name,
            Strategy::ClassName,
            Strategy::TagName,
            Strategy::LinkText,
            Strategy::PartialLinkText,
            Strategy::AccessibilityId,
        ] {
            assert_ne!(strategy.as_str(), "unknown", "{:?}", strategy);
        }
        assert_eq!(Strategy::PartialLinkText.as_str(), "partial link text");
        assert_eq!(Strategy::names().count(), 9);
    }

    #[test]
    fn test_unknown_strategy_is_validation_error() {
        let err = "-android uiautomator".parse::<Strategy>().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("css selector"));
    }

    #[test]
    fn test_locator_from_json() {
        let loc = Locator::from_json(&json!({"using": "xpath", "value": "//button"}), "actionLocator")
            .unwrap();
        assert_eq!(loc.using, Strategy::XPath);
        assert_eq!(loc.value, "//button");
    }

    #[test]
    fn test_locator_from_json_rejects_malformed() {
        assert!(Locator::from_json(&json!("#btn"), "referenceLocator").is_err());
        assert!(Locator::from_json(&json!({"using": "id"}), "referenceLocator").is_err());
        let err = Locator::from_json(&json!({"using": "id", "value": ""}), "referenceLocator")
            .unwrap_err();
        assert!(err.to_string().contains("referenceLocator.value"));
    }

    #[test]
    fn test_locator_serde_uses_wire_names() {
        let loc = Locator::new(Strategy::AccessibilityId, "Close");
        let v = serde_json::to_value(&loc).unwrap();
        assert_eq!(v, json!({"using": "accessibility id", "value": "Close"}));
        let back: Locator = serde_json::from_value(v).unwrap();
        assert_eq!(back, loc);
    }
}
