//! Element identifiers and the closed set of element actions.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// W3C WebDriver element reference key.
pub const W3C_ELEMENT_KEY: &str = "element-6066-11e4-a23e-4b4d-6a5c-43f5a1e3f5ec";

/// Legacy (JSON wire protocol) element reference key.
pub const LEGACY_ELEMENT_KEY: &str = "ELEMENT";

/// Canonical element identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElementId(String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode an element reference in either accepted wire shape.
    pub fn from_wire(value: &serde_json::Value) -> Result<Self> {
        let wire = WireElementRef::deserialize(value).map_err(|_| {
            Error::Validation(format!(
                "element reference must carry '{}' or '{}'",
                W3C_ELEMENT_KEY, LEGACY_ELEMENT_KEY
            ))
        })?;
        Ok(wire.into())
    }

    /// Encode as a wire reference carrying both keys.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            W3C_ELEMENT_KEY: self.0,
            LEGACY_ELEMENT_KEY: self.0,
        })
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ElementId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The two element reference shapes accepted at the boundary.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireElementRef {
    W3c {
        #[serde(rename = "element-6066-11e4-a23e-4b4d-6a5c-43f5a1e3f5ec")]
        id: String,
    },
    Legacy {
        #[serde(rename = "ELEMENT")]
        id: String,
    },
}

impl From<WireElementRef> for ElementId {
    fn from(wire: WireElementRef) -> Self {
        match wire {
            WireElementRef::W3c { id } | WireElementRef::Legacy { id } => ElementId(id),
        }
    }
}

/// An action that can be invoked on a located element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Click,
    Clear,
    SendKeys,
    GetText,
    GetAttribute,
    GetProperty,
    GetTagName,
    IsDisplayed,
    IsEnabled,
    IsSelected,
    GetRect,
}

const ACTION_KINDS: &[(&str, ActionKind)] = &[
    ("click", ActionKind::Click),
    ("clear", ActionKind::Clear),
    ("send_keys", ActionKind::SendKeys),
    ("get_text", ActionKind::GetText),
    ("get_attribute", ActionKind::GetAttribute),
    ("get_property", ActionKind::GetProperty),
    ("get_tag_name", ActionKind::GetTagName),
    ("is_displayed", ActionKind::IsDisplayed),
    ("is_enabled", ActionKind::IsEnabled),
    ("is_selected", ActionKind::IsSelected),
    ("get_rect", ActionKind::GetRect),
];

impl ActionKind {
    /// Short name for logging and the wire.
    pub fn name(&self) -> &'static str {
        ACTION_KINDS
            .iter()
            .find(|(_, kind)| kind == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    /// Whether this action needs a string argument, and under which key.
    pub fn required_arg(&self) -> Option<&'static str> {
        match self {
            Self::SendKeys => Some("text"),
            Self::GetAttribute | Self::GetProperty => Some("name"),
            _ => None,
        }
    }
}

impl FromStr for ActionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ACTION_KINDS
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| {
                let names: Vec<_> = ACTION_KINDS.iter().map(|(n, _)| *n).collect();
                Error::Validation(format!(
                    "unsupported action '{}', expected one of: {}",
                    s,
                    names.join(", ")
                ))
            })
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Arguments passed along with an action, e.g. `{"text": "hello"}` for `send_keys`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionArgs(pub serde_json::Value);

impl ActionArgs {
    pub fn none() -> Self {
        Self(serde_json::Value::Null)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self(serde_json::json!({ "text": text.into() }))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self(serde_json::json!({ "name": name.into() }))
    }

    /// Get a string argument.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_str())
    }

    /// Check the arguments satisfy what `kind` needs.
    pub fn check(&self, kind: ActionKind) -> Result<()> {
        if let Some(key) = kind.required_arg() {
            if self.get_str(key).is_none() {
                return Err(Error::Validation(format!(
                    "action '{}' requires string argument '{}'",
                    kind, key
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_w3c_shape() {
        let id = ElementId::from_wire(&json!({ W3C_ELEMENT_KEY: "abc" })).unwrap();
        assert_eq!(id.as_str(), "abc");
    }

    #[test]
    fn test_decode_legacy_shape() {
        let id = ElementId::from_wire(&json!({ "ELEMENT": "xyz" })).unwrap();
        assert_eq!(id.as_str(), "xyz");
    }

    #[test]
    fn test_decode_rejects_other_shapes() {
        assert!(ElementId::from_wire(&json!("abc")).is_err());
        assert!(ElementId::from_wire(&json!({ "id": "abc" })).is_err());
        assert!(ElementId::from_wire(&json!({ "ELEMENT": 3 })).is_err());
    }

    #[test]
    fn test_to_wire_carries_both_keys() {
        let wire = ElementId::new("e1").to_wire();
        assert_eq!(wire[W3C_ELEMENT_KEY], "e1");
        assert_eq!(wire[LEGACY_ELEMENT_KEY], "e1");
        assert_eq!(ElementId::from_wire(&wire).unwrap(), ElementId::new("e1"));
    }

    #[test]
    fn test_action_table_is_closed() {
        assert_eq!("click".parse::<ActionKind>().unwrap(), ActionKind::Click);
        assert_eq!("get_rect".parse::<ActionKind>().unwrap(), ActionKind::GetRect);
        assert!("double_click".parse::<ActionKind>().is_err());
        for (name, kind) in ACTION_KINDS {
            assert_eq!(kind.name(), *name);
        }
    }

    #[test]
    fn test_action_args_check() {
        assert!(ActionArgs::none().check(ActionKind::Click).is_ok());
        assert!(ActionArgs::none().check(ActionKind::SendKeys).is_err());
        assert!(ActionArgs::text("hi").check(ActionKind::SendKeys).is_ok());
        assert!(ActionArgs::named("href").check(ActionKind::GetAttribute).is_ok());
    }
}
