//! Platform adapters for Herald.
//!
//! Concrete [`PlatformAdapter`] implementations for a self-hosted CMS and
//! the social networks Herald publishes to, plus a file-backed connection
//! registry.

mod bluesky;
mod connections;
mod http;
mod mastodon;
mod render;
mod wordpress;

use std::sync::Arc;

use herald_scheduler::{AdapterRegistry, PlatformAdapter};

pub use bluesky::BlueskyAdapter;
pub use connections::{ConnectionsFileError, FileConnectionRegistry};
pub use mastodon::MastodonAdapter;
pub use wordpress::WordPressAdapter;

/// User agent sent by the REST adapters.
pub const USER_AGENT: &str = concat!("herald/", env!("CARGO_PKG_VERSION"));

/// Registry with every built-in adapter sharing one HTTP client.
pub fn builtin_adapters() -> Result<AdapterRegistry, reqwest::Error> {
    let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;

    let adapters: [Arc<dyn PlatformAdapter>; 3] = [
        Arc::new(WordPressAdapter::new(http.clone())),
        Arc::new(MastodonAdapter::new(http)),
        Arc::new(BlueskyAdapter::new()),
    ];
    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register(adapter);
    }
    Ok(registry)
}
