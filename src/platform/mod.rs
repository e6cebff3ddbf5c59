//! Platform adapters: pure functions over the environment the operator runs in.
//!
//! Detects the orchestrator flavor, resolves proxy settings and provides the
//! default image references for every managed component.

mod images;
mod infrastructure;
mod proxy;

pub use images::ImageDefaults;
pub use infrastructure::Infrastructure;
pub use proxy::ProxySettings;
