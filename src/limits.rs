//! Tunable limits consumed by the cache, registry, and dispatcher.
//!
//! Every magic number in the core has one named, documented home here
//! instead of being scattered through the connection-handling code.

use std::time::Duration;

/// Capacity and buffering limits.
///
/// Defaults favor a small forward-proxy deployment; override via the CLI
/// surface in [`crate::config`] where a flag is exposed, or by constructing
/// this struct directly when embedding the proxy as a library.
#[derive(Debug, Clone)]
pub struct ProxyLimits {
    /// Maximum number of cached responses (default: `256`).
    pub cache_capacity: usize,

    /// Per-connection byte buffer cap before a resource-exhaustion
    /// disconnect is raised (default: `1 MiB`). The reference implementation
    /// grows this buffer without bound; §5 calls that out as a gap to close.
    pub max_buffer_bytes: usize,

    /// Chunk size used for each read off a socket (default: `8 KiB`).
    pub read_chunk_size: usize,

    /// A connection with no successful read for this long is closed
    /// (default: `60 seconds`).
    pub idle_timeout: Duration,

    #[doc(hidden)]
    #[allow(dead_code)]
    pub _priv: (),
}

impl Default for ProxyLimits {
    fn default() -> Self {
        Self {
            cache_capacity: 256,
            max_buffer_bytes: 1024 * 1024,
            read_chunk_size: 8 * 1024,
            idle_timeout: Duration::from_secs(60),
            _priv: (),
        }
    }
}
