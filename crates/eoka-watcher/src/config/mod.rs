pub mod schema;

pub use schema::{Limits, WatchConfig};
