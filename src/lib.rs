//! # eoka-watch
//!
//! MCP server that puts interstitial watchers in front of browser automation.
//! Each browser tab gets its own watch session; lookups and element actions
//! that hit a consent banner or modal are recovered once, automatically.
//!
//! The engine lives in [`eoka_watcher`]; this crate supplies the `eoka`-backed
//! [`PageDriver`] and the stdio MCP surface.

pub mod driver;
pub mod mcp;

pub use driver::PageDriver;
pub use eoka_watcher;
pub use mcp::{run_server, WatchServer};
