pub mod cache;
pub mod client;
pub mod utils;
pub mod watch;

/// Default user agent for `ingress-cache` - automatically uses the package version
///
/// All API clients should be created through `client::new(Some(USER_AGENT))`.
/// The user-agent can be overridden via the `INGRESS_CACHE_USER_AGENT` environment variable.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Environment variable overriding [`USER_AGENT`]
pub const USER_AGENT_ENV: &str = "INGRESS_CACHE_USER_AGENT";
