use std::{error, fmt, io};

/// Closed taxonomy of failures the dispatcher must decide how to react to
/// (§7): which socket to disconnect, or whether to abort the process.
#[derive(Debug)]
pub enum ProxyError {
    /// A read/write on a socket failed outright.
    Io(io::Error),
    /// A zero-byte read; an orderly peer close, not a real error.
    PeerClosed,
    /// The request/response head or a chunk was malformed.
    Framing(crate::framer::FramingError),
    /// A per-socket limit (buffer cap, descriptor budget) was exceeded.
    ResourceExhausted(&'static str),
    /// Bind, listen, or TLS identity load failed; the process cannot start.
    Startup(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Io(e) => write!(f, "i/o error: {e}"),
            ProxyError::PeerClosed => write!(f, "peer closed the connection"),
            ProxyError::Framing(e) => write!(f, "framing error: {e:?}"),
            ProxyError::ResourceExhausted(what) => write!(f, "resource exhausted: {what}"),
            ProxyError::Startup(msg) => write!(f, "startup failed: {msg}"),
        }
    }
}

impl error::Error for ProxyError {}

impl From<io::Error> for ProxyError {
    fn from(err: io::Error) -> Self {
        ProxyError::Io(err)
    }
}

impl From<crate::framer::FramingError> for ProxyError {
    fn from(err: crate::framer::FramingError) -> Self {
        ProxyError::Framing(err)
    }
}

impl ProxyError {
    /// Whether this failure should cascade to the peer side of a pairing
    /// (§4.4 disconnect cascade) rather than being local to one socket.
    pub fn is_fatal_for_pair(&self) -> bool {
        !matches!(self, ProxyError::ResourceExhausted(_))
    }
}
