//! Keyed FIFO queue: simultaneously an insertion-ordered queue and a
//! multimap keyed by an opaque, hashable key.
//!
//! This backs the endpoint's outbound write queue, where the key is a
//! connection's [`crate::pool::PoolKey`]. Both the global FIFO order and
//! each key's own bucket chain are doubly linked, so `pop_head` and
//! `delete_all` unlink in O(1) per node rather than walking the whole
//! queue -- `delete_all` costs O(count) for that key, not O(queue length),
//! which is what makes connection teardown cheap even with a large
//! backlog of other connections' queued writes.

use crate::pool::{Pool, PoolKey};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Bucket count for the chaining hash index. 103 is the value the C
/// original used; it's "big enough" for the expected handful of
/// same-key collisions per connection, not a hard requirement.
const BASENUM: usize = 103;

struct Node<K, V> {
    key: K,
    value: V,
    g_prev: Option<PoolKey>,
    g_next: Option<PoolKey>,
    b_prev: Option<PoolKey>,
    b_next: Option<PoolKey>,
}

/// An ordered, key-groupable FIFO of `(key, value)` entries.
pub struct KeyedQueue<K, V> {
    nodes: Pool<Node<K, V>>,
    g_head: Option<PoolKey>,
    g_tail: Option<PoolKey>,
    bucket_head: Vec<Option<PoolKey>>,
    bucket_tail: Vec<Option<PoolKey>>,
    len: usize,
}

fn bucket_of<K: Hash>(key: &K) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % BASENUM as u64) as usize
}

impl<K: Copy + Eq + Hash, V> KeyedQueue<K, V> {
    /// `initial_capacity` sizes the inner node pool; it scales with the
    /// expected connection count but grows on demand regardless.
    pub fn new(initial_capacity: usize) -> Self {
        KeyedQueue {
            nodes: Pool::new(initial_capacity.max(1), 0),
            g_head: None,
            g_tail: None,
            bucket_head: vec![None; BASENUM],
            bucket_tail: vec![None; BASENUM],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `(key, value)` at the tail of both the global FIFO and the
    /// key's own bucket chain (so the bucket chain is itself oldest-first).
    pub fn append(&mut self, key: K, value: V) {
        let node = Node {
            key,
            value,
            g_prev: self.g_tail,
            g_next: None,
            b_prev: None,
            b_next: None,
        };
        let node_key = self
            .nodes
            .alloc(node)
            .expect("queue node pool is unbounded");

        match self.g_tail {
            Some(prev) => self.nodes.get_mut(prev).unwrap().g_next = Some(node_key),
            None => self.g_head = Some(node_key),
        }
        self.g_tail = Some(node_key);

        let bucket = bucket_of(&key);
        if let Some(prev) = self.bucket_tail[bucket] {
            self.nodes.get_mut(prev).unwrap().b_next = Some(node_key);
            self.nodes.get_mut(node_key).unwrap().b_prev = Some(prev);
        } else {
            self.bucket_head[bucket] = Some(node_key);
        }
        self.bucket_tail[bucket] = Some(node_key);

        self.len += 1;
    }

    pub fn peek_head(&self) -> Option<&V> {
        self.g_head.map(|k| &self.nodes.get(k).unwrap().value)
    }

    /// Mutable access to the oldest entry, for shrinking a partially-sent
    /// write-queue entry in place without unlinking it.
    pub fn front_mut(&mut self) -> Option<(K, &mut V)> {
        let head = self.g_head?;
        let node = self.nodes.get_mut(head).unwrap();
        Some((node.key, &mut node.value))
    }

    pub fn peek_head_key(&self) -> Option<K> {
        self.g_head.map(|k| self.nodes.get(k).unwrap().key)
    }

    /// Remove and return the oldest `(key, value)` in the queue.
    pub fn pop_head(&mut self) -> Option<(K, V)> {
        let head = self.g_head?;
        self.unlink_global(head);
        self.unlink_bucket(head);
        let node = self.nodes.free(head).expect("head key must be live");
        self.len -= 1;
        Some((node.key, node.value))
    }

    /// Return the oldest value still queued for `key`, if any.
    pub fn find_first(&self, key: K) -> Option<&V> {
        let bucket = bucket_of(&key);
        let mut cur = self.bucket_head[bucket];
        while let Some(k) = cur {
            let node = self.nodes.get(k).unwrap();
            if node.key == key {
                return Some(&node.value);
            }
            cur = node.b_next;
        }
        None
    }

    /// Remove every entry for `key` from both the FIFO and the hash
    /// index. Returns the number of entries removed.
    pub fn delete_all(&mut self, key: K) -> usize {
        let bucket = bucket_of(&key);
        let mut cur = self.bucket_head[bucket];
        let mut removed = 0;
        while let Some(k) = cur {
            let next = self.nodes.get(k).unwrap().b_next;
            if self.nodes.get(k).unwrap().key == key {
                self.unlink_global(k);
                // Bucket unlink here only needs forward traversal since
                // we're walking the chain ourselves; splice directly.
                let (bp, bn) = {
                    let node = self.nodes.get(k).unwrap();
                    (node.b_prev, node.b_next)
                };
                match bp {
                    Some(p) => self.nodes.get_mut(p).unwrap().b_next = bn,
                    None => self.bucket_head[bucket] = bn,
                }
                match bn {
                    Some(n) => self.nodes.get_mut(n).unwrap().b_prev = bp,
                    None => self.bucket_tail[bucket] = bp,
                }
                self.nodes.free(k);
                self.len -= 1;
                removed += 1;
            }
            cur = next;
        }
        removed
    }

    fn unlink_global(&mut self, k: PoolKey) {
        let (gp, gn) = {
            let node = self.nodes.get(k).unwrap();
            (node.g_prev, node.g_next)
        };
        match gp {
            Some(p) => self.nodes.get_mut(p).unwrap().g_next = gn,
            None => self.g_head = gn,
        }
        match gn {
            Some(n) => self.nodes.get_mut(n).unwrap().g_prev = gp,
            None => self.g_tail = gp,
        }
    }

    fn unlink_bucket(&mut self, k: PoolKey) {
        let key = self.nodes.get(k).unwrap().key;
        let bucket = bucket_of(&key);
        let (bp, bn) = {
            let node = self.nodes.get(k).unwrap();
            (node.b_prev, node.b_next)
        };
        match bp {
            Some(p) => self.nodes.get_mut(p).unwrap().b_next = bn,
            None => self.bucket_head[bucket] = bn,
        }
        match bn {
            Some(n) => self.nodes.get_mut(n).unwrap().b_prev = bp,
            None => self.bucket_tail[bucket] = bp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved_across_keys() {
        let mut q: KeyedQueue<u32, &'static str> = KeyedQueue::new(4);
        q.append(1, "a");
        q.append(2, "b");
        q.append(1, "c");
        assert_eq!(q.pop_head(), Some((1, "a")));
        assert_eq!(q.pop_head(), Some((2, "b")));
        assert_eq!(q.pop_head(), Some((1, "c")));
        assert_eq!(q.pop_head(), None);
    }

    #[test]
    fn find_first_returns_oldest_for_key() {
        let mut q: KeyedQueue<u32, &'static str> = KeyedQueue::new(4);
        q.append(7, "first");
        q.append(7, "second");
        assert_eq!(q.find_first(7), Some(&"first"));
        assert_eq!(q.find_first(8), None);
    }

    #[test]
    fn delete_all_purges_key_and_keeps_others_in_order() {
        let mut q: KeyedQueue<u32, &'static str> = KeyedQueue::new(4);
        q.append(1, "a1");
        q.append(2, "b1");
        q.append(1, "a2");
        q.append(2, "b2");
        q.append(1, "a3");

        let removed = q.delete_all(1);
        assert_eq!(removed, 3);
        assert_eq!(q.find_first(1), None);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop_head(), Some((2, "b1")));
        assert_eq!(q.pop_head(), Some((2, "b2")));
        assert_eq!(q.pop_head(), None);
    }

    #[test]
    fn delete_all_on_empty_key_is_noop() {
        let mut q: KeyedQueue<u32, &'static str> = KeyedQueue::new(4);
        q.append(1, "a");
        assert_eq!(q.delete_all(99), 0);
        assert_eq!(q.len(), 1);
    }
}
