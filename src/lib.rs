//! hookd — a multi-tenant, hook-driven HTTP/HTTPS daemon.
//!
//! The request pipeline is externalized into **hook modules**: Lua files
//! discovered under a base directory, hot-reloaded on filesystem change.
//! Each request resolves to a site (by Host header), then to a chain of
//! hook functions (by hook name and category mask); the chain produces a
//! response descriptor which the daemon renders and, when eligible, caches
//! by `(host, URL)` in a size-bounded LRU.
//!
//! # Key concepts
//! - [`hooks::registry::HookRegistry`] maps hook names to priority-sorted
//!   chains; the module loader and filesystem watcher keep it current.
//! - [`hooks::executor::Executor`] invokes chains in three modes — CALL
//!   (deferred terminal callback), CALL_SYNC (inline, skips ASYNC hooks),
//!   and DISPATCH (fire-and-forget).
//! - [`dispatch::handle`] is the per-request pipeline: plaintext-upgrade
//!   policy, site resolution, upload admission, cache lookup, chain
//!   invocation, rendering, cache insertion.
//! - [`descriptor::ResponseDescriptor`] is the value object hooks return.
//! - [`cache::ResponseCache`] is the LRU with per-entry absolute expiry.
//!
//! # Hook modules
//!
//! A module is a file named `*.hook.lua` whose chunk returns a table.
//! Entries named per the `h<Policy><Categories>_<hookName>` grammar become
//! hook functions:
//!
//! ```lua
//! return {
//!     default_priority = 10,
//!     priorities = { ["hSA_www.example$"] = -5 },
//!     ["hSA_www.example$"] = function(params, headers, body)
//!         return { status = 200, data = "<h1>hi</h1>", type = "text/html",
//!                  etag = "\"v1\"", maxage = 300 }
//!     end,
//! }
//! ```
//!
//! # Compatibility
//! - Runtime: `tokio`
//! - HTTP: `hyper` 1.x, HTTP/1.1 (plaintext and TLS via rustls)
//! - Hook scripting: Lua 5.4 (`mlua`, vendored)

/// HTTP response body wrapper.
pub mod body;

/// Size-bounded LRU response cache with per-entry expiry.
pub mod cache;

/// Arena-backed linked list and ring-buffer queue.
pub mod collections;

/// Server and site configuration.
pub mod config;

/// Response descriptors produced by hooks.
pub mod descriptor;

/// Request dispatcher and shared server state.
pub mod dispatch;

/// Typed error definitions.
pub mod error;

/// Hook model, registry, executor, loader, and watcher.
pub mod hooks;

/// Plaintext-to-HTTPS upgrade redirects.
pub mod redirect;

/// Descriptor-to-response rendering.
pub mod render;

/// Listener manager and connection loops.
mod server;

/// TLS acceptor construction.
pub mod server_tls;

/// Tracing subscriber setup.
pub mod tracing;

/// Core type aliases.
pub mod types;

pub use bytes::Bytes;
pub use http::{header, Method, StatusCode};

pub use config::ServerConfig;
pub use dispatch::Server;

/// Binds the configured endpoints and serves until the accept loops end.
pub use server::serve;
