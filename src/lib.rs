//! forkproxy - single-process, event-driven HTTP/1.1 forward proxy
//!
//! Terminates TCP from clients, forwards requests to origin servers, caches
//! cacheable `GET` responses in a bounded LRU with TTL semantics, and
//! optionally intercepts `CONNECT` tunnels either as opaque byte relays or
//! as Man-In-The-Middle TLS terminations using a proxy certificate and key.
//!
//! # Architecture
//!
//! - [`framer`] — stateless extraction of complete requests/responses from
//!   a growing byte buffer, including chunked transfer-encoding.
//! - [`cache`] — the bounded LRU response cache.
//! - [`registry`] — the tagged per-socket state shape a single-threaded
//!   port of this proxy would index into (not wired into the live
//!   per-task dispatcher; see its module docs).
//! - [`connection`] — the per-connection-task request loop: `GET`
//!   caching, `CONNECT` tunneling/MITM, and opaque forwarding.
//! - [`tls`] — loading the proxy's static TLS identity and building the
//!   `rustls` contexts used for MITM interception.
//! - [`config`] — command-line parsing and the resolved runtime config.
//! - [`limits`] — tunable capacity/timeout knobs shared by the above.

pub mod cache;
pub mod config;
pub mod connection;
pub mod errors;
pub mod framer;
pub mod limits;
pub mod registry;
pub mod stream;
pub mod tls;
mod util;
