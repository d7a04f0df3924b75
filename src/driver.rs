//! `AutomationDriver` over a live `eoka::Page`.
//!
//! Elements are located by injected JS and tagged with a `data-eoka-watch`
//! attribute; the attribute value is the element id handed to callers. A node
//! that is re-rendered gets a fresh id, so acting on the old id finds nothing
//! attached and reports a stale reference.

use async_trait::async_trait;
use eoka::Page;
use eoka_watcher::{
    ActionArgs, ActionKind, AutomationDriver, DriverError, DriverResult, ElementId, Locator,
};
use serde::Deserialize;
use serde_json::Value;

/// Attribute carrying the element id.
pub const ID_ATTR: &str = "data-eoka-watch";

const LOCATE_JS: &str = r#"
((using, value) => {
    const all = (list) => Array.from(list || []);
    const byText = (exact) => all(document.querySelectorAll('a')).filter(a => {
        const t = (a.innerText || a.textContent || '').trim();
        return exact ? t === value : t.includes(value);
    });
    let found;
    try {
        switch (using) {
            case 'css selector': found = all(document.querySelectorAll(value)); break;
            case 'xpath': {
                const snap = document.evaluate(value, document, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null);
                found = [];
                for (let i = 0; i < snap.snapshotLength; i++) found.push(snap.snapshotItem(i));
                found = found.filter(n => n.nodeType === 1);
                break;
            }
            case 'id': found = all(document.querySelectorAll('[id]')).filter(e => e.id === value); break;
            case 'name': found = all(document.getElementsByName(value)); break;
            case 'class name': found = all(document.getElementsByClassName(value)); break;
            case 'tag name': found = all(document.getElementsByTagName(value)); break;
            case 'link text': found = byText(true); break;
            case 'partial link text': found = byText(false); break;
            case 'accessibility id':
                found = all(document.querySelectorAll('[aria-label]')).filter(e => e.getAttribute('aria-label') === value);
                break;
            default: return { ids: [], error: 'unsupported strategy ' + using };
        }
    } catch (e) {
        return { ids: [], error: 'invalid ' + using + ' ' + JSON.stringify(value) + ': ' + e.message };
    }
    if (!window.__eokaWatchDoc) {
        window.__eokaWatchDoc = Math.random().toString(36).slice(2, 10);
        window.__eokaWatchSeq = 0;
    }
    const ids = found.map(el => {
        let id = el.getAttribute('data-eoka-watch');
        if (!id) {
            id = 'ew' + window.__eokaWatchDoc + '-' + (++window.__eokaWatchSeq);
            el.setAttribute('data-eoka-watch', id);
        }
        return id;
    });
    return { ids };
})
"#;

const ACT_JS: &str = r#"
((id, action, args) => {
    const el = document.querySelector('[data-eoka-watch="' + CSS.escape(id) + '"]');
    if (!el || !el.isConnected) {
        return { stale: /^ew[0-9a-z]+-\d+$/.test(id), value: null };
    }
    const r = el.getBoundingClientRect();
    const s = getComputedStyle(el);
    const plain = (v) => (v === null || ['string', 'number', 'boolean'].includes(typeof v)) ? v : String(v);
    let value = null;
    switch (action) {
        case 'probe': break;
        case 'focus': el.focus(); break;
        case 'get_text': value = (el.innerText ?? el.textContent ?? '').trim(); break;
        case 'get_attribute': value = el.getAttribute(args.name); break;
        case 'get_property': value = el[args.name] === undefined ? null : plain(el[args.name]); break;
        case 'get_tag_name': value = el.tagName.toLowerCase(); break;
        case 'is_displayed':
            value = r.width > 0 && r.height > 0 && s.visibility !== 'hidden' && s.display !== 'none';
            break;
        case 'is_enabled': value = !el.disabled; break;
        case 'is_selected': value = !!(el.checked || el.selected); break;
        case 'get_rect': value = { x: r.x, y: r.y, width: r.width, height: r.height }; break;
        default: return { found: true, stale: false, error: 'unsupported action ' + action };
    }
    return { found: true, stale: false, value };
})
"#;

#[derive(Debug, Deserialize)]
struct Located {
    #[serde(default)]
    ids: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Acted {
    #[serde(default)]
    found: bool,
    #[serde(default)]
    stale: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Drives one tab.
pub struct PageDriver<'a> {
    page: &'a Page,
}

impl<'a> PageDriver<'a> {
    pub fn new(page: &'a Page) -> Self {
        Self { page }
    }

    /// CSS selector matching a tagged element.
    pub fn selector(id: &ElementId) -> String {
        format!("[{}=\"{}\"]", ID_ATTR, id.as_str().replace('"', "\\\""))
    }

    async fn locate(&self, locator: &Locator) -> DriverResult<Vec<ElementId>> {
        let js = locate_script(locator)?;
        let located: Located = self.page.evaluate(&js).await.map_err(other)?;
        if let Some(error) = located.error {
            return Err(DriverError::Other(error));
        }
        Ok(located.ids.into_iter().map(ElementId::new).collect())
    }

    /// Run an in-page action, mapping a missing node onto stale/not-found.
    async fn run(&self, element: &ElementId, action: &str, args: &ActionArgs) -> DriverResult<Value> {
        let js = act_script(element, action, args)?;
        let acted: Acted = self.page.evaluate(&js).await.map_err(other)?;
        if !acted.found {
            return Err(if acted.stale {
                DriverError::StaleReference(format!("element {} is no longer attached", element))
            } else {
                DriverError::NotFound(format!("no such element {}", element))
            });
        }
        if let Some(error) = acted.error {
            return Err(DriverError::Other(error));
        }
        Ok(acted.value)
    }
}

#[async_trait]
impl AutomationDriver for PageDriver<'_> {
    async fn locate_one(&self, locator: &Locator) -> DriverResult<ElementId> {
        self.locate(locator)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DriverError::NotFound(format!("{} not found", locator)))
    }

    async fn locate_many(&self, locator: &Locator) -> DriverResult<Vec<ElementId>> {
        self.locate(locator).await
    }

    async fn act(
        &self,
        element: &ElementId,
        action: ActionKind,
        args: &ActionArgs,
    ) -> DriverResult<Value> {
        let selector = Self::selector(element);
        match action {
            ActionKind::Click => {
                self.run(element, "probe", args).await?;
                self.page.click(&selector).await.map_err(other)?;
                Ok(Value::Null)
            }
            ActionKind::Clear => {
                self.run(element, "probe", args).await?;
                self.page.fill(&selector, "").await.map_err(other)?;
                Ok(Value::Null)
            }
            ActionKind::SendKeys => {
                let text = args.get_str("text").unwrap_or_default();
                self.run(element, "focus", args).await?;
                self.page.type_text(text).await.map_err(other)?;
                Ok(Value::Null)
            }
            _ => self.run(element, action.name(), args).await,
        }
    }
}

fn other(e: eoka::Error) -> DriverError {
    DriverError::Other(e.to_string())
}

fn js_arg(value: &impl serde::Serialize) -> DriverResult<String> {
    serde_json::to_string(value).map_err(|e| DriverError::Other(format!("failed to escape JS: {}", e)))
}

fn locate_script(locator: &Locator) -> DriverResult<String> {
    Ok(format!(
        "{}({},{})",
        LOCATE_JS,
        js_arg(&locator.using.as_str())?,
        js_arg(&locator.value)?
    ))
}

fn act_script(element: &ElementId, action: &str, args: &ActionArgs) -> DriverResult<String> {
    let args = if args.0.is_object() { &args.0 } else { &Value::Null };
    Ok(format!(
        "{}({},{},{})",
        ACT_JS,
        js_arg(&element.as_str())?,
        js_arg(&action)?,
        js_arg(args)?
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use eoka_watcher::Strategy;

    #[test]
    fn test_selector_quotes_id() {
        assert_eq!(
            PageDriver::selector(&ElementId::new("ewabc-1")),
            "[data-eoka-watch=\"ewabc-1\"]"
        );
        assert_eq!(
            PageDriver::selector(&ElementId::new("a\"b")),
            "[data-eoka-watch=\"a\\\"b\"]"
        );
    }

    #[test]
    fn test_locate_script_escapes_arguments() {
        let locator = Locator::new(Strategy::XPath, "//a[text()=\"it's\"]");
        let js = locate_script(&locator).unwrap();
        assert!(js.ends_with(r#"("xpath","//a[text()=\"it's\"]")"#));
    }

    #[test]
    fn test_act_script_passes_named_args() {
        let js = act_script(
            &ElementId::new("ewabc-3"),
            "get_attribute",
            &ActionArgs::named("href"),
        )
        .unwrap();
        assert!(js.ends_with(r#"("ewabc-3","get_attribute",{"name":"href"})"#));
    }

    #[test]
    fn test_act_script_drops_non_object_args() {
        let js = act_script(
            &ElementId::new("ewabc-3"),
            "get_text",
            &ActionArgs(serde_json::json!("junk")),
        )
        .unwrap();
        assert!(js.ends_with(r#"("ewabc-3","get_text",null)"#));
    }
}
