use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters},
    model::*,
    tool, tool_handler, tool_router, ServerHandler,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use eoka::{Browser, Page, StealthConfig};
use eoka_watcher::{
    ActionArgs, ActionKind, ElementId, EndReason, Locator, RawWatcherSpec, SessionManager,
    SharedSession, WatchConfig, WatchSession,
};

use crate::driver::PageDriver;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const ERR_NO_BROWSER: &str = "No browser open. Use navigate first.";
const ERR_NO_TAB: &str = "No tab open. Use navigate first.";

// ---------------------------------------------------------------------------
// Request types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct NavigateRequest {
    #[schemars(description = "URL to navigate to")]
    pub url: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct NewTabRequest {
    #[schemars(description = "URL to open in the new tab (optional, defaults to about:blank)")]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct TabIdRequest {
    #[schemars(description = "Tab ID (from new_tab or navigate)")]
    pub tab_id: String,
}

#[derive(Debug, Default, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterWatcherRequest {
    #[schemars(description = "Unique watcher name (max 128 chars)")]
    pub name: Option<Value>,
    #[schemars(
        description = "Locator whose presence means the interstitial is showing: {using, value}"
    )]
    pub reference_locator: Option<Value>,
    #[schemars(description = "Locator of the element to click to dismiss it: {using, value}")]
    pub action_locator: Option<Value>,
    #[schemars(description = "Lifetime in milliseconds")]
    pub duration: Option<Value>,
    #[schemars(description = "Higher runs first (default 0)")]
    pub priority: Option<Value>,
    #[schemars(description = "Deactivate after the first dismissal (default false)")]
    pub stop_on_found: Option<Value>,
    #[schemars(description = "Pause after each dismissal in milliseconds (default 0)")]
    pub cooldown_ms: Option<Value>,
}

impl From<RegisterWatcherRequest> for RawWatcherSpec {
    fn from(req: RegisterWatcherRequest) -> Self {
        Self {
            name: req.name,
            reference_locator: req.reference_locator,
            action_locator: req.action_locator,
            duration: req.duration,
            priority: req.priority,
            stop_on_found: req.stop_on_found,
            cooldown_ms: req.cooldown_ms,
        }
    }
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct WatcherNameRequest {
    #[schemars(description = "Watcher name")]
    pub name: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct LocatorRequest {
    #[schemars(
        description = "Strategy: css selector, xpath, id, name, class name, tag name, link text, partial link text, accessibility id"
    )]
    pub using: String,
    #[schemars(description = "Strategy-specific selector value")]
    pub value: String,
}

impl LocatorRequest {
    fn locator(&self) -> Result<Locator, ErrorData> {
        let raw = json!({ "using": self.using, "value": self.value });
        Locator::from_json(&raw, "locator").map_err(|e| watch_err(&e))
    }
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
pub struct ElementActionRequest {
    #[schemars(
        description = "Element reference from find_element(s): {\"element-6066-11e4-a23e-4b4d-6a5c-43f5a1e3f5ec\": id} or {\"ELEMENT\": id}"
    )]
    pub element: Value,
    #[schemars(
        description = "Action: click, clear, send_keys, get_text, get_attribute, get_property, get_tag_name, is_displayed, is_enabled, is_selected, get_rect"
    )]
    pub action: String,
    #[schemars(description = "Action arguments: {text} for send_keys, {name} for get_attribute/get_property")]
    pub args: Option<Value>,
}

// ---------------------------------------------------------------------------
// Browser State
// ---------------------------------------------------------------------------

/// Browser, its tabs, and one watch session per tab (keyed by target id).
///
/// Pages and sessions are handed out as shared handles so that slow work on
/// one tab never holds this state.
struct BrowserState {
    browser: Browser,
    tabs: HashMap<String, Arc<Page>>,
    current_tab_id: Option<String>,
    sessions: SessionManager,
    /// Set to true when a transport error is detected; triggers relaunch on next call
    unhealthy: bool,
}

impl BrowserState {
    async fn new(headless: bool, sessions: SessionManager) -> eoka::Result<Self> {
        let patch_binary = std::env::var("EOKA_PATCH_BINARY")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let config = StealthConfig {
            headless,
            patch_binary,
            ..Default::default()
        };
        info!("launching browser (headless={})", headless);
        let browser = Browser::launch_with_config(config).await?;
        Ok(Self {
            browser,
            tabs: HashMap::new(),
            current_tab_id: None,
            sessions,
            unhealthy: false,
        })
    }

    /// Navigate the current tab, creating the first tab if needed.
    ///
    /// Returns the tab id, its page, and whether an existing document was
    /// replaced.
    async fn ensure_tab(&mut self, url: &str) -> eoka::Result<(String, Arc<Page>, bool)> {
        if let Some(existing_id) = self.current_tab_id.clone() {
            if let Some(page) = self.tabs.get(&existing_id).cloned() {
                page.goto(url).await?;
                return Ok((existing_id, page, true));
            }
        }
        let page = Arc::new(self.browser.new_page(url).await?);
        let new_id = page.target_id().to_string();
        self.tabs.insert(new_id.clone(), page.clone());
        self.sessions.open(&new_id);
        self.current_tab_id = Some(new_id.clone());
        Ok((new_id, page, false))
    }

    /// Current tab's page and watch session handles.
    fn current(&mut self) -> Result<(Arc<Page>, SharedSession), ErrorData> {
        let id = self.current_tab_id.as_ref().ok_or_else(|| err(ERR_NO_TAB))?;
        let page = self.tabs.get(id).cloned().ok_or_else(|| err(ERR_NO_TAB))?;
        Ok((page, self.sessions.open(id)))
    }

    async fn new_tab(&mut self, url: Option<&str>) -> eoka::Result<String> {
        let page = match url {
            Some(u) => self.browser.new_page(u).await?,
            None => self.browser.new_blank_page().await?,
        };
        let tab_id = page.target_id().to_string();
        self.tabs.insert(tab_id.clone(), Arc::new(page));
        self.sessions.open(&tab_id);
        self.browser.activate_tab(&tab_id).await?;
        self.current_tab_id = Some(tab_id.clone());
        Ok(tab_id)
    }

    async fn switch_tab(&mut self, tab_id: &str) -> eoka::Result<()> {
        if !self.tabs.contains_key(tab_id) {
            return Err(eoka::Error::ElementNotFound(format!(
                "Tab {} not found",
                tab_id
            )));
        }
        self.browser.activate_tab(tab_id).await?;
        self.current_tab_id = Some(tab_id.to_string());
        Ok(())
    }

    async fn close_tab(&mut self, tab_id: &str) -> eoka::Result<()> {
        if self.tabs.len() <= 1 {
            return Err(eoka::Error::CdpSimple("Cannot close the last tab".into()));
        }
        if !self.tabs.contains_key(tab_id) {
            return Err(eoka::Error::ElementNotFound(format!(
                "Tab {} not found",
                tab_id
            )));
        }

        self.browser.close_tab(tab_id).await?;
        self.tabs.remove(tab_id);
        self.sessions.end(tab_id, EndReason::Closed);

        if self.current_tab_id.as_deref() == Some(tab_id) {
            if let Some(new_id) = self.tabs.keys().next().cloned() {
                self.current_tab_id = Some(new_id.clone());
                self.browser.activate_tab(&new_id).await?;
            } else {
                self.current_tab_id = None;
            }
        }
        Ok(())
    }

    /// End every session and close the browser.
    ///
    /// Ending the sessions cancels any cooldown still running on them.
    async fn close(mut self, reason: EndReason) -> eoka::Result<()> {
        let ended = self.sessions.end_all(reason);
        info!("closing browser ({} sessions {})", ended, reason);
        self.browser.close().await
    }

    /// Map a browser error, marking the state unhealthy on transport failure.
    fn fail(&mut self, e: impl std::fmt::Display) -> ErrorData {
        let msg = e.to_string();
        if is_transport_error(&msg) {
            warn!("connection lost, marking unhealthy: {}", msg);
            self.unhealthy = true;
            return ErrorData::internal_error(
                format!("{} (connection lost - will relaunch on next call)", msg),
                None::<Value>,
            );
        }
        err(msg)
    }

}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

fn err(e: impl std::fmt::Display) -> ErrorData {
    ErrorData::internal_error(e.to_string(), None::<Value>)
}

/// Caller mistakes are `invalid_params`; everything else carries its code.
fn watch_err(e: &eoka_watcher::Error) -> ErrorData {
    let msg = format!("{}: {}", e.code(), e);
    match e {
        eoka_watcher::Error::Validation(_) => ErrorData::invalid_params(msg, None::<Value>),
        _ => ErrorData::internal_error(msg, None::<Value>),
    }
}

/// Check if an error indicates a broken connection that requires a relaunch
fn is_transport_error(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    msg.contains("websocket")
        || msg.contains("transport")
        || msg.contains("timed out")
        || msg.contains("connection")
        || msg.contains("broken pipe")
        || msg.contains("reset by peer")
}

fn text_ok(s: impl Into<String>) -> Result<CallToolResult, ErrorData> {
    Ok(CallToolResult::success(vec![Content::text(s.into())]))
}

fn json_ok(value: &impl Serialize) -> Result<CallToolResult, ErrorData> {
    text_ok(serde_json::to_string_pretty(value).map_err(err)?)
}

#[derive(Clone)]
pub struct WatchServer {
    state: Arc<Mutex<Option<BrowserState>>>,
    config: Arc<WatchConfig>,
    tool_router: ToolRouter<Self>,
    headless: bool,
}

impl WatchServer {
    /// Current tab's page and its locked, freshly maintained session.
    ///
    /// The browser lock is released before the session lock is taken, so a
    /// call waiting on one tab does not hold up the others.
    async fn session(&self) -> Result<(Arc<Page>, OwnedMutexGuard<WatchSession>), ErrorData> {
        self.ensure_browser().await?;
        let (page, session) = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().ok_or_else(|| err(ERR_NO_BROWSER))?;
            state.current()?
        };
        let mut session = session.lock_owned().await;
        session.maintain();
        Ok((page, session))
    }

    /// Map an error from a watch session, marking the browser unhealthy on
    /// transport failure.
    async fn watch_failure(&self, e: eoka_watcher::Error) -> ErrorData {
        if matches!(e, eoka_watcher::Error::Driver(_)) && is_transport_error(&e.to_string()) {
            let mut guard = self.state.lock().await;
            if let Some(state) = guard.as_mut() {
                return state.fail(format!("{}: {}", e.code(), e));
            }
        }
        watch_err(&e)
    }

    async fn ensure_browser(&self) -> Result<(), ErrorData> {
        let mut guard = self.state.lock().await;
        if guard.as_ref().map(|s| s.unhealthy).unwrap_or(false) {
            warn!("browser unhealthy, relaunching");
            if let Some(state) = guard.take() {
                let _ = state.close(EndReason::Aborted).await;
            }
        }
        if guard.is_none() {
            let sessions = SessionManager::new(&self.config).map_err(|e| watch_err(&e))?;
            let state = BrowserState::new(self.headless, sessions)
                .await
                .map_err(err)?;
            *guard = Some(state);
        }
        Ok(())
    }

    /// End every session and close the browser, if one is open.
    pub async fn shutdown(&self, reason: EndReason) {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.take() {
            if let Err(e) = state.close(reason).await {
                warn!("browser close failed: {}", e);
            }
        }
    }
}

#[tool_router]
impl WatchServer {
    pub fn new(config: WatchConfig, headless: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(None)),
            config: Arc::new(config),
            tool_router: Self::tool_router(),
            headless,
        }
    }

    // =========================================================================
    // Tabs
    // =========================================================================

    #[tool(description = "Navigate the current tab to a URL. Launches browser on first call.")]
    async fn navigate(
        &self,
        req: Parameters<NavigateRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        self.ensure_browser().await?;
        let (tab_id, page, replaced, session) = {
            let mut guard = self.state.lock().await;
            let state = guard.as_mut().ok_or_else(|| err(ERR_NO_BROWSER))?;
            let (tab_id, page, replaced) = match state.ensure_tab(&req.0.url).await {
                Ok(tab) => tab,
                Err(e) => return Err(state.fail(e)),
            };
            let session = state.sessions.open(&tab_id);
            (tab_id, page, replaced, session)
        };
        if replaced {
            // The old document's elements are gone.
            session.lock().await.reset_elements();
        }
        let url = page.url().await.map_err(err)?;
        let title = page.title().await.map_err(err)?;
        text_ok(format!(
            "Navigated [{}] to: {}\nTitle: {}",
            tab_id, url, title
        ))
    }

    #[tool(description = "Open a new tab with its own watchers. Returns the new tab ID.")]
    async fn new_tab(&self, req: Parameters<NewTabRequest>) -> Result<CallToolResult, ErrorData> {
        self.ensure_browser().await?;
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| err(ERR_NO_BROWSER))?;

        let tab_id = match state.new_tab(req.0.url.as_deref()).await {
            Ok(id) => id,
            Err(e) => return Err(state.fail(e)),
        };
        let session = state.sessions.get(&tab_id);
        drop(guard);
        let watchers = match session {
            Some(session) => session.lock().await.registry().len(),
            None => 0,
        };
        text_ok(format!(
            "Opened new tab [{}] ({} preset watchers)",
            tab_id, watchers
        ))
    }

    #[tool(description = "Switch to a different tab by ID.")]
    async fn switch_tab(&self, req: Parameters<TabIdRequest>) -> Result<CallToolResult, ErrorData> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| err(ERR_NO_BROWSER))?;

        if let Err(e) = state.switch_tab(&req.0.tab_id).await {
            return Err(state.fail(e));
        }
        text_ok(format!("Switched to tab [{}]", req.0.tab_id))
    }

    #[tool(description = "Close a tab by ID, discarding its watchers. Cannot close the last tab.")]
    async fn close_tab(&self, req: Parameters<TabIdRequest>) -> Result<CallToolResult, ErrorData> {
        let mut guard = self.state.lock().await;
        let state = guard.as_mut().ok_or_else(|| err(ERR_NO_BROWSER))?;

        if let Err(e) = state.close_tab(&req.0.tab_id).await {
            return Err(state.fail(e));
        }
        text_ok(format!("Closed tab [{}]", req.0.tab_id))
    }

    #[tool(description = "Close the browser and discard every tab's watchers.")]
    async fn close(&self) -> Result<CallToolResult, ErrorData> {
        let mut guard = self.state.lock().await;
        if let Some(state) = guard.take() {
            state.close(EndReason::Closed).await.map_err(err)?;
        }
        text_ok("Browser closed.")
    }

    // =========================================================================
    // Watchers
    // =========================================================================

    #[tool(
        description = "Register a watcher on the current tab. When a lookup or action fails, watchers whose referenceLocator is present get their actionLocator clicked, then the call is retried once."
    )]
    async fn register_watcher(
        &self,
        req: Parameters<RegisterWatcherRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let (_, mut session) = self.session().await?;

        let summary = session
            .register(&req.0.into())
            .map_err(|e| watch_err(&e))?;
        json_ok(&summary)
    }

    #[tool(description = "Remove a watcher from the current tab by name.")]
    async fn unregister_watcher(
        &self,
        req: Parameters<WatcherNameRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let (_, mut session) = self.session().await?;

        session
            .unregister(&req.0.name)
            .map_err(|e| watch_err(&e))?;
        json_ok(&json!({ "removed": req.0.name }))
    }

    #[tool(description = "List the current tab's unexpired watchers, highest priority first.")]
    async fn list_watchers(&self) -> Result<CallToolResult, ErrorData> {
        let (_, mut session) = self.session().await?;
        json_ok(&session.list())
    }

    #[tool(description = "Remove every watcher from the current tab.")]
    async fn clear_watchers(&self) -> Result<CallToolResult, ErrorData> {
        let (_, mut session) = self.session().await?;
        json_ok(&json!({ "removedCount": session.clear_all() }))
    }

    #[tool(description = "Turn interstitial recovery back on for the current tab.")]
    async fn enable_watchers(&self) -> Result<CallToolResult, ErrorData> {
        let (_, mut session) = self.session().await?;
        json_ok(&json!({ "message": session.enable() }))
    }

    #[tool(
        description = "Suspend interstitial recovery for the current tab. Watchers are kept; failures are returned unchanged."
    )]
    async fn disable_watchers(&self) -> Result<CallToolResult, ErrorData> {
        let (_, mut session) = self.session().await?;
        json_ok(&json!({ "message": session.disable() }))
    }

    // =========================================================================
    // Intercepted operations
    // =========================================================================

    #[tool(
        description = "Find one element. If it is missing, watchers get one chance to dismiss an interstitial and the lookup is retried once. Returns an element reference."
    )]
    async fn find_element(
        &self,
        req: Parameters<LocatorRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let locator = req.0.locator()?;
        let (page, mut session) = self.session().await?;

        let driver = PageDriver::new(&page);
        let result = session.find_element(&driver, &locator).await;
        drop(session);
        let id = match result {
            Ok(id) => id,
            Err(e) => return Err(self.watch_failure(e).await),
        };
        json_ok(&id.to_wire())
    }

    #[tool(
        description = "Find all matching elements. An empty result triggers one watcher pass and one retry. Returns an array of element references."
    )]
    async fn find_elements(
        &self,
        req: Parameters<LocatorRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let locator = req.0.locator()?;
        let (page, mut session) = self.session().await?;

        let driver = PageDriver::new(&page);
        let result = session.find_elements(&driver, &locator).await;
        drop(session);
        let ids = match result {
            Ok(ids) => ids,
            Err(e) => return Err(self.watch_failure(e).await),
        };
        let refs: Vec<Value> = ids.iter().map(ElementId::to_wire).collect();
        json_ok(&refs)
    }

    #[tool(
        description = "Run an action on an element. A stale reference triggers one watcher pass, the element is re-found with its original locator, and the action is retried once. Old references keep working afterwards."
    )]
    async fn element_action(
        &self,
        req: Parameters<ElementActionRequest>,
    ) -> Result<CallToolResult, ErrorData> {
        let element = ElementId::from_wire(&req.0.element).map_err(|e| watch_err(&e))?;
        let action: ActionKind = req.0.action.parse().map_err(|e| watch_err(&e))?;
        let args = ActionArgs(req.0.args.unwrap_or(Value::Null));
        let (page, mut session) = self.session().await?;

        let driver = PageDriver::new(&page);
        let result = session.element_action(&driver, &element, action, &args).await;
        drop(session);
        let value = match result {
            Ok(value) => value,
            Err(e) => return Err(self.watch_failure(e).await),
        };
        json_ok(&json!({ "value": value }))
    }
}

#[tool_handler]
impl ServerHandler for WatchServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "eoka-watch".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Browser automation with interstitial watchers.\n\n\
                 WATCHERS: register_watcher({name, referenceLocator, actionLocator, duration, priority?, stopOnFound?, cooldownMs?})\n\
                 Locators are {using, value}; using is one of css selector, xpath, id, name, class name, tag name, link text, partial link text, accessibility id.\n\
                 RECOVERY: find_element/find_elements/element_action run watchers and retry once when blocked or stale.\n\
                 Each tab has its own watchers: navigate, new_tab, switch_tab, close_tab."
                    .into(),
            ),
        }
    }
}

/// Serve MCP on stdio until the client disconnects or Ctrl-C.
pub async fn run_server(config: WatchConfig, headless: bool) -> anyhow::Result<()> {
    use rmcp::ServiceExt;

    let server = WatchServer::new(config, headless);
    let handle = server.clone();
    let service = server.serve(rmcp::transport::stdio()).await?;
    tokio::select! {
        res = service.waiting() => {
            res?;
            handle.shutdown(EndReason::Closed).await;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, ending all sessions");
            handle.shutdown(EndReason::Aborted).await;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors() {
        assert!(is_transport_error("WebSocket closed"));
        assert!(is_transport_error("Connection reset by peer"));
        assert!(is_transport_error("request timed out"));
        assert!(!is_transport_error("element #x not found"));
    }

    #[test]
    fn test_validation_is_invalid_params() {
        let e = watch_err(&eoka_watcher::Error::Validation("duration is required".into()));
        assert_eq!(e.code, ErrorCode::INVALID_PARAMS);
        assert!(e.message.starts_with("validation_error: "));

        let e = watch_err(&eoka_watcher::Error::CapacityExceeded { max: 5 });
        assert_eq!(e.code, ErrorCode::INTERNAL_ERROR);
        assert!(e.message.starts_with("capacity_error: "));
    }

    #[test]
    fn test_locator_request() {
        let req = LocatorRequest {
            using: "xpath".into(),
            value: "//button".into(),
        };
        assert_eq!(req.locator().unwrap().value, "//button");

        let bad = LocatorRequest {
            using: "shadow".into(),
            value: "x".into(),
        };
        assert_eq!(bad.locator().unwrap_err().code, ErrorCode::INVALID_PARAMS);
    }

    #[test]
    fn test_register_request_camel_case() {
        let req: RegisterWatcherRequest = serde_json::from_value(json!({
            "name": "cookies",
            "referenceLocator": {"using": "id", "value": "consent"},
            "actionLocator": {"using": "css selector", "value": "#consent .ok"},
            "duration": 10000,
            "stopOnFound": true,
        }))
        .unwrap();
        let spec = RawWatcherSpec::from(req)
            .validate(&eoka_watcher::Limits::default())
            .unwrap();
        assert_eq!(spec.name, "cookies");
        assert!(spec.stop_on_found);
        assert_eq!(spec.duration_ms, 10_000);
    }

    #[test]
    fn test_register_request_rejects_long_cooldown() {
        let req: RegisterWatcherRequest = serde_json::from_value(json!({
            "name": "slow",
            "referenceLocator": {"using": "id", "value": "promo"},
            "actionLocator": {"using": "id", "value": "promo-close"},
            "duration": 10000,
            "cooldownMs": 1_000_000_000_000u64,
        }))
        .unwrap();
        let e = RawWatcherSpec::from(req)
            .validate(&eoka_watcher::Limits::default())
            .unwrap_err();
        let data = watch_err(&e);
        assert_eq!(data.code, ErrorCode::INVALID_PARAMS);
        assert!(data.message.contains("cooldownMs"));
    }
}
