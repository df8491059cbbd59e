//! Inverted Page Table Hash Index
//!
//! Fixed-capacity separate-chaining hash table mapping (pid, page address)
//! to a frame index. Chain nodes live in a pre-sized arena and are linked
//! by index, with unused nodes threaded on a free list, so the index never
//! allocates after construction.
//!
//! The index is not internally synchronized; the inverted page table keeps
//! it under the same lock as its entry array.

use alloc::vec;
use alloc::vec::Vec;

use crate::kdump;
use crate::types::{trunc_page, Pid, PAGE_SHIFT};

/// Null link
const NIL: u32 = u32::MAX;

/// Multiplier spreading pids across buckets
const PID_MULTIPLIER: u64 = 0x9E37_79B9;

/// Chain node
#[derive(Debug, Clone, Copy)]
struct Node {
    pid: Pid,
    vpage: u64,
    value: usize,
    next: u32,
}

impl Node {
    const EMPTY: Node = Node {
        pid: Pid(0),
        vpage: 0,
        value: 0,
        next: NIL,
    };
}

/// Smallest prime not below `n`, by trial division
pub fn next_prime(n: usize) -> usize {
    fn is_prime(n: usize) -> bool {
        if n < 2 {
            return false;
        }
        let mut d = 2;
        while d * d <= n {
            if n % d == 0 {
                return false;
            }
            d += 1;
        }
        true
    }

    let mut candidate = n.max(2);
    while !is_prime(candidate) {
        candidate += 1;
    }
    candidate
}

/// Hash index keyed by (pid, page address)
#[derive(Debug)]
pub struct HashIndex {
    heads: Vec<u32>,
    nodes: Vec<Node>,
    free_head: u32,
    len: usize,
}

impl HashIndex {
    /// Create an index holding at most `capacity` keys
    pub fn new(capacity: usize) -> Self {
        assert!(capacity < NIL as usize, "hash index capacity too large");

        let buckets = next_prime(capacity);
        let mut nodes = vec![Node::EMPTY; capacity];
        for (i, node) in nodes.iter_mut().enumerate() {
            node.next = if i + 1 < capacity { (i + 1) as u32 } else { NIL };
        }

        Self {
            heads: vec![NIL; buckets],
            nodes,
            free_head: if capacity > 0 { 0 } else { NIL },
            len: 0,
        }
    }

    fn bucket(&self, pid: Pid, vpage: u64) -> usize {
        let vpn = vpage >> PAGE_SHIFT;
        let mixed = vpn.wrapping_add(u64::from(pid.as_u32()).wrapping_mul(PID_MULTIPLIER));
        (mixed % self.heads.len() as u64) as usize
    }

    /// Add a key
    ///
    /// Callers check for an existing key first; inserting a duplicate
    /// shadows the older node until it is deleted.
    ///
    /// # Panics
    ///
    /// Panics if every node is in use.
    pub fn insert(&mut self, pid: Pid, vaddr: u64, value: usize) {
        let node = self.free_head;
        if node == NIL {
            panic!("hash index: no free node");
        }
        let vpage = trunc_page(vaddr);
        let bucket = self.bucket(pid, vpage);

        let slot = &mut self.nodes[node as usize];
        self.free_head = slot.next;
        *slot = Node {
            pid,
            vpage,
            value,
            next: self.heads[bucket],
        };
        self.heads[bucket] = node;
        self.len += 1;
    }

    /// Find the value stored for a key
    pub fn search(&self, pid: Pid, vaddr: u64) -> Option<usize> {
        let vpage = trunc_page(vaddr);
        let mut cur = self.heads[self.bucket(pid, vpage)];
        while cur != NIL {
            let node = &self.nodes[cur as usize];
            if node.pid == pid && node.vpage == vpage {
                return Some(node.value);
            }
            cur = node.next;
        }
        None
    }

    /// Remove a key, returning its value (no-op if absent)
    pub fn delete(&mut self, pid: Pid, vaddr: u64) -> Option<usize> {
        let vpage = trunc_page(vaddr);
        let bucket = self.bucket(pid, vpage);

        let mut prev = NIL;
        let mut cur = self.heads[bucket];
        while cur != NIL {
            let node = self.nodes[cur as usize];
            if node.pid == pid && node.vpage == vpage {
                if prev == NIL {
                    self.heads[bucket] = node.next;
                } else {
                    self.nodes[prev as usize].next = node.next;
                }
                self.nodes[cur as usize] = Node {
                    next: self.free_head,
                    ..Node::EMPTY
                };
                self.free_head = cur;
                self.len -= 1;
                return Some(node.value);
            }
            prev = cur;
            cur = node.next;
        }
        None
    }

    /// Number of keys stored
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of keys
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.heads.len()
    }

    /// Length of the free node list
    pub fn free_nodes(&self) -> usize {
        let mut count = 0;
        let mut cur = self.free_head;
        while cur != NIL {
            count += 1;
            cur = self.nodes[cur as usize].next;
        }
        count
    }

    /// Print every non-empty bucket chain
    pub fn dump(&self) {
        kdump!(
            "hash index: {} keys, {} buckets, {} free nodes",
            self.len,
            self.heads.len(),
            self.free_nodes()
        );
        for (bucket, &head) in self.heads.iter().enumerate() {
            let mut cur = head;
            while cur != NIL {
                let node = &self.nodes[cur as usize];
                kdump!(
                    "  [{}] pid {} page {:#x} -> frame {}",
                    bucket,
                    node.pid,
                    node.vpage,
                    node.value
                );
                cur = node.next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_prime() {
        assert_eq!(next_prime(0), 2);
        assert_eq!(next_prime(2), 2);
        assert_eq!(next_prime(8), 11);
        assert_eq!(next_prime(13), 13);
        assert_eq!(next_prime(100), 101);
    }

    #[test]
    fn test_insert_search_delete() {
        let mut index = HashIndex::new(8);
        assert_eq!(index.bucket_count(), 11);

        index.insert(Pid(1), 0x4000, 3);
        index.insert(Pid(2), 0x4000, 5);
        assert_eq!(index.search(Pid(1), 0x4abc), Some(3));
        assert_eq!(index.search(Pid(2), 0x4000), Some(5));
        assert_eq!(index.search(Pid(3), 0x4000), None);
        assert_eq!(index.len(), 2);

        assert_eq!(index.delete(Pid(1), 0x4000), Some(3));
        assert_eq!(index.search(Pid(1), 0x4000), None);
        assert_eq!(index.delete(Pid(1), 0x4000), None);
        assert_eq!(index.search(Pid(2), 0x4000), Some(5));
        assert_eq!(index.free_nodes(), 7);
    }

    #[test]
    fn test_colliding_chain() {
        let mut index = HashIndex::new(4);
        for i in 0..4u64 {
            index.insert(Pid(7), i << PAGE_SHIFT, i as usize);
        }
        assert_eq!(index.free_nodes(), 0);

        // Delete from the middle of a chain
        assert_eq!(index.delete(Pid(7), 0x1000), Some(1));
        for i in [0u64, 2, 3] {
            assert_eq!(index.search(Pid(7), i << PAGE_SHIFT), Some(i as usize));
        }
        index.insert(Pid(8), 0x1000, 9);
        assert_eq!(index.search(Pid(8), 0x1000), Some(9));
    }

    #[test]
    #[should_panic(expected = "no free node")]
    fn test_pool_exhaustion_panics() {
        let mut index = HashIndex::new(2);
        index.insert(Pid(1), 0x1000, 0);
        index.insert(Pid(1), 0x2000, 1);
        index.insert(Pid(1), 0x3000, 2);
    }
}
