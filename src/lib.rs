//! sslly-nginx - a transactional reload supervisor for nginx
//!
//! This library turns a user-authored routing table plus a directory of
//! TLS materials into a validated nginx configuration and applies it to a
//! colocated nginx process without dropping traffic:
//! - Watches the config and TLS directories, coalescing change bursts
//!   through a debounce window
//! - Parses a flexible upstream mini-DSL (ports, host:port, `[https]`
//!   prefix, IPv6, path suffixes, directory-backed static sites)
//! - Identifies certificates by content and pairs each with its private
//!   key by public-key equality, selecting by expiry when hosts have
//!   several candidates
//! - Stages certificates and the rendered config into an immutable
//!   runtime snapshot and promotes it with an atomic directory swap
//! - Drives nginx through test → graceful reload → health verification
//! - Persists a last-good snapshot with an in-progress marker, so a crash
//!   mid-reload rolls back on the next start

pub mod app;
pub mod backup;
pub mod certs;
pub mod config;
pub mod fsutil;
pub mod logging;
pub mod nginx;
pub mod paths;
pub mod render;
pub mod runtime_cache;
pub mod static_sites;
pub mod summary;
pub mod upstream;
pub mod watcher;
