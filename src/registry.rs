//! Per-descriptor socket state (§4.3), keyed by a monotonic connection id
//! rather than a raw OS descriptor (tokio exposes no `FD_SETSIZE`-style
//! fixed descriptor table, §4.3 grounding note).
//!
//! This module is not wired into the live per-connection-task dispatcher
//! (§5, §9): each task owns its sockets as local variables instead of a
//! shared array. It exists to document, and test, the fuller tagged-variant
//! shape a single-threaded `select()`-style port of this proxy would use
//! in place of booleans-plus-nullable-handle (§9 Design Notes).

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub type ConnId = u64;

/// Per-descriptor state distinguishing client vs origin, plaintext vs TLS,
/// and tunnel vs proxied — replacing the reference's boolean-plus-handle
/// pair (§9 Design Notes).
pub enum SocketState {
    PlainClient,
    TlsClient {
        origin_id: ConnId,
    },
    PlainOrigin {
        client_id: ConnId,
        pending_key: Option<Vec<u8>>,
        chunked: bool,
    },
    TlsOrigin {
        client_id: ConnId,
        pending_key: Option<Vec<u8>>,
        chunked: bool,
    },
    TunnelEnd {
        peer_id: ConnId,
    },
}

struct Entry {
    state: SocketState,
    buffer: Vec<u8>,
    last_input_at: Instant,
}

/// An array (here, a map) of optional per-connection state, indexed by
/// [`ConnId`] (§4.3).
#[derive(Default)]
pub struct Registry {
    next_id: ConnId,
    entries: HashMap<ConnId, Entry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_client(&mut self) -> ConnId {
        self.insert(SocketState::PlainClient)
    }

    pub fn add_origin(&mut self, client_id: ConnId, pending_key: Option<Vec<u8>>) -> ConnId {
        self.insert(SocketState::PlainOrigin {
            client_id,
            pending_key,
            chunked: false,
        })
    }

    /// Registers one end of an opaque `CONNECT` tunnel, paired with `peer_id`
    /// (§4.4: tunnel bytes relay verbatim, neither end is client/origin-typed).
    pub fn add_tunnel_end(&mut self, peer_id: ConnId) -> ConnId {
        self.insert(SocketState::TunnelEnd { peer_id })
    }

    fn insert(&mut self, state: SocketState) -> ConnId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            Entry {
                state,
                buffer: Vec::new(),
                last_input_at: Instant::now(),
            },
        );
        id
    }

    /// Removes `id`. Idempotent: removing an already-absent id is a no-op
    /// (§4.3 invariant).
    pub fn remove(&mut self, id: ConnId) {
        self.entries.remove(&id);
    }

    pub fn get(&self, id: ConnId) -> Option<&SocketState> {
        self.entries.get(&id).map(|e| &e.state)
    }

    pub fn is_client(&self, id: ConnId) -> bool {
        matches!(
            self.get(id),
            Some(SocketState::PlainClient) | Some(SocketState::TlsClient { .. })
        )
    }

    pub fn is_tls(&self, id: ConnId) -> bool {
        matches!(
            self.get(id),
            Some(SocketState::TlsClient { .. }) | Some(SocketState::TlsOrigin { .. })
        )
    }

    pub fn is_tunnel(&self, id: ConnId) -> bool {
        matches!(self.get(id), Some(SocketState::TunnelEnd { .. }))
    }

    pub fn buffer_append(&mut self, id: ConnId, bytes: &[u8]) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.buffer.extend_from_slice(bytes);
        }
    }

    pub fn buffer(&self, id: ConnId) -> Option<&[u8]> {
        self.entries.get(&id).map(|e| e.buffer.as_slice())
    }

    pub fn touch(&mut self, id: ConnId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.last_input_at = Instant::now();
        }
    }

    pub fn is_idle_expired(&self, id: ConnId, idle: Duration) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|e| e.last_input_at.elapsed() >= idle)
    }

    /// Every origin whose peer is `client_id` (§4.4 disconnect cascade).
    pub fn origins_of_client(&self, client_id: ConnId) -> Vec<ConnId> {
        self.entries
            .iter()
            .filter_map(|(&id, entry)| match &entry.state {
                SocketState::PlainOrigin { client_id: c, .. }
                | SocketState::TlsOrigin { client_id: c, .. }
                    if *c == client_id =>
                {
                    Some(id)
                }
                _ => None,
            })
            .collect()
    }
}
