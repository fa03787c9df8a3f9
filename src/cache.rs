//! Bounded LRU cache for complete HTTP responses.
//!
//! Backed by a doubly-linked list (sentinel head/tail) plus a `HashMap` index,
//! mirroring the reference cache's structure: `put` promotes to the front,
//! `get` does **not** promote (see `DESIGN.md` for why that asymmetry is kept),
//! and eviction purges every stale entry before falling back to a single
//! tail eviction.
//!
//! Ages are measured against `tokio::time::Instant` rather than the wall
//! clock — a monotonic clock is explicitly licensed by the source behavior
//! (§3: "a monotonic-or-wall clock shared across the process") and lets tests
//! fast-forward TTL expiry deterministically with `tokio::time::advance`
//! instead of sleeping in real time.

use std::collections::HashMap;
use tokio::time::Instant;

type NodeId = usize;

struct Node {
    key: Vec<u8>,
    value: Vec<u8>,
    created_at: Instant,
    max_age: u64,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

/// A fixed-capacity, TTL-aware LRU cache keyed by opaque byte strings.
///
/// Construct with [`Cache::new`]; capacity is fixed for the cache's lifetime,
/// mirroring the reference's one-time `init(capacity)` contract.
pub struct Cache {
    capacity: usize,
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    index: HashMap<Vec<u8>, NodeId>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
}

/// Result of a successful [`Cache::get`]: a copy of the stored bytes and
/// their age in seconds at the moment of the read.
pub struct Hit {
    pub value: Vec<u8>,
    pub age: u64,
}

impl Cache {
    /// Creates an empty cache. `capacity == 0` means every `put` is rejected.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    /// Inserts or updates `key`. Promotes the entry to the front either way.
    ///
    /// Returns `false` without mutating anything if `capacity == 0`.
    pub fn put(&mut self, key: &[u8], value: Vec<u8>, max_age: u64) -> bool {
        if self.capacity == 0 {
            return false;
        }

        let now = Instant::now();

        if let Some(&id) = self.index.get(key) {
            self.detach(id);
            let node = self.nodes[id].as_mut().expect("indexed node present");
            node.value = value;
            node.created_at = now;
            node.max_age = max_age;
            self.push_front(id);
            return true;
        }

        if self.index.len() >= self.capacity {
            let purged = self.purge_stale(now);
            if purged == 0 {
                if let Some(tail) = self.tail {
                    self.remove_node(tail);
                }
            }
        }

        let id = self.alloc(Node {
            key: key.to_vec(),
            value,
            created_at: now,
            max_age,
            prev: None,
            next: None,
        });
        self.index.insert(key.to_vec(), id);
        self.push_front(id);
        true
    }

    /// Looks up `key`. A stale hit is evicted and reported as a miss.
    /// Does not change recency ordering (§9 Open Questions: preserved).
    pub fn get(&mut self, key: &[u8]) -> Option<Hit> {
        let &id = self.index.get(key)?;
        let node = self.nodes[id].as_ref().expect("indexed node present");
        let age = Instant::now().saturating_duration_since(node.created_at).as_secs();

        if age >= node.max_age {
            self.remove_node(id);
            return None;
        }

        Some(Hit {
            value: node.value.clone(),
            age,
        })
    }

    /// Drops every entry, keeping the configured capacity.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    fn purge_stale(&mut self, now: Instant) -> usize {
        let stale: Vec<NodeId> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| {
                let node = slot.as_ref()?;
                (now.saturating_duration_since(node.created_at).as_secs() >= node.max_age)
                    .then_some(id)
            })
            .collect();

        let count = stale.len();
        for id in stale {
            self.remove_node(id);
        }
        count
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn push_front(&mut self, id: NodeId) {
        let old_head = self.head;
        {
            let node = self.nodes[id].as_mut().expect("node just allocated");
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            self.nodes[h].as_mut().expect("head present").prev = Some(id);
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    fn detach(&mut self, id: NodeId) {
        let (prev, next) = {
            let node = self.nodes[id].as_ref().expect("node present");
            (node.prev, node.next)
        };

        match prev {
            Some(p) => self.nodes[p].as_mut().expect("prev present").next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.nodes[n].as_mut().expect("next present").prev = prev,
            None => self.tail = prev,
        }
    }

    fn remove_node(&mut self, id: NodeId) {
        self.detach(id);
        if let Some(node) = self.nodes[id].take() {
            self.index.remove(&node.key);
        }
        self.free.push(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get_round_trips() {
        let mut cache = Cache::new(4);
        assert!(cache.put(b"example.com/index.html", b"hello".to_vec(), 60));

        let hit = cache.get(b"example.com/index.html").unwrap();
        assert_eq!(hit.value, b"hello");
        assert_eq!(hit.age, 0);
    }

    #[test]
    fn zero_max_age_is_immediately_stale() {
        let mut cache = Cache::new(4);
        cache.put(b"k", b"v".to_vec(), 0);
        assert!(cache.get(b"k").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn capacity_zero_rejects_every_put() {
        let mut cache = Cache::new(0);
        assert!(!cache.put(b"k", b"v".to_vec(), 3600));
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_without_stale_entries_drops_the_tail() {
        let mut cache = Cache::new(2);
        cache.put(b"k1", b"v1".to_vec(), 3600);
        cache.put(b"k2", b"v2".to_vec(), 3600);
        cache.put(b"k3", b"v3".to_vec(), 3600);

        assert!(cache.get(b"k1").is_none());
        assert!(cache.get(b"k2").is_some());
        assert!(cache.get(b"k3").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn put_on_existing_key_overwrites_and_promotes() {
        let mut cache = Cache::new(2);
        cache.put(b"k1", b"v1".to_vec(), 3600);
        cache.put(b"k2", b"v2".to_vec(), 3600);
        cache.put(b"k1", b"v1-new".to_vec(), 3600);
        cache.put(b"k3", b"v3".to_vec(), 3600);

        // k1 was promoted by the overwrite, so k2 (least recently touched) evicts.
        assert!(cache.get(b"k2").is_none());
        assert_eq!(cache.get(b"k1").unwrap().value, b"v1-new");
        assert!(cache.get(b"k3").is_some());
    }

    #[test]
    fn get_never_promotes_recency() {
        let mut cache = Cache::new(2);
        cache.put(b"k1", b"v1".to_vec(), 3600);
        cache.put(b"k2", b"v2".to_vec(), 3600);

        // Reading k1 repeatedly must not save it from tail eviction.
        cache.get(b"k1");
        cache.get(b"k1");
        cache.put(b"k3", b"v3".to_vec(), 3600);

        assert!(cache.get(b"k1").is_none());
        assert!(cache.get(b"k2").is_some());
    }

    #[test]
    fn clear_empties_the_cache() {
        let mut cache = Cache::new(4);
        cache.put(b"k1", b"v1".to_vec(), 3600);
        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(b"k1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entry_goes_stale_after_virtual_time_advances_past_max_age() {
        let mut cache = Cache::new(4);
        cache.put(b"k", b"v".to_vec(), 60);
        assert!(cache.get(b"k").is_some());

        tokio::time::advance(std::time::Duration::from_secs(61)).await;

        assert!(cache.get(b"k").is_none());
    }
}
