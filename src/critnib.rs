//! Ordered `u64` → value radix map
//!
//! An adaptive radix tree branching on key nibbles, used for the
//! process-wide pool registries (by UUID and by address) and for the
//! per-thread lane-info maps. Besides exact lookup it answers
//! less-or-equal queries, which is how a raw address is resolved to the
//! pool that owns it.
//!
//! The first insertion lands in a preallocated root slot and cannot fail;
//! inserting an existing key keeps the first value and reports the clash.

use crate::error::{Error, Result};
use std::sync::RwLock;

#[inline]
fn prefix_mask(shift: u32) -> u64 {
    if shift >= 60 {
        0
    } else {
        !0u64 << (shift + 4)
    }
}

#[inline]
fn prefix(key: u64, shift: u32) -> u64 {
    key & prefix_mask(shift)
}

#[inline]
fn nib(key: u64, shift: u32) -> usize {
    ((key >> shift) & 0xf) as usize
}

/// Nibble position of the highest bit where the two keys differ
#[inline]
fn diff_shift(a: u64, b: u64) -> u32 {
    debug_assert_ne!(a, b);
    let hb = 63 - (a ^ b).leading_zeros();
    (hb / 4) * 4
}

enum Slot<V: Copy> {
    Empty,
    Leaf { key: u64, value: V },
    Node(Box<Node<V>>),
}

impl<V: Copy> Default for Slot<V> {
    fn default() -> Self {
        Slot::Empty
    }
}

struct Node<V: Copy> {
    shift: u32,
    path: u64,
    children: [Slot<V>; 16],
}

impl<V: Copy> Node<V> {
    fn new(shift: u32, path: u64) -> Box<Self> {
        Box::new(Node {
            shift,
            path,
            children: Default::default(),
        })
    }
}

/// Thread-safe ordered map from `u64` keys to copyable values
pub struct Critnib<V: Copy> {
    root: RwLock<Slot<V>>,
}

unsafe impl<V: Copy> Send for Critnib<V> {}
unsafe impl<V: Copy> Sync for Critnib<V> {}

impl<V: Copy> Critnib<V> {
    pub fn new() -> Self {
        Self {
            root: RwLock::new(Slot::Empty),
        }
    }

    /// Inserts `key`; an existing key keeps its first value
    pub fn insert(&self, key: u64, value: V) -> Result<()> {
        enum Act {
            Fill,
            Clash,
            SplitLeaf(u64),
            SplitNode(u64, u32),
            Descend(usize),
        }

        let mut guard = self.root.write().unwrap();
        let mut cur: &mut Slot<V> = &mut *guard;
        loop {
            let act = match &*cur {
                Slot::Empty => Act::Fill,
                Slot::Leaf { key: k, .. } => {
                    if *k == key {
                        Act::Clash
                    } else {
                        Act::SplitLeaf(*k)
                    }
                }
                Slot::Node(n) => {
                    if prefix(key, n.shift) != n.path {
                        Act::SplitNode(n.path, n.shift)
                    } else {
                        Act::Descend(nib(key, n.shift))
                    }
                }
            };
            match act {
                Act::Fill => {
                    *cur = Slot::Leaf { key, value };
                    return Ok(());
                }
                Act::Clash => return Err(Error::Exists),
                Act::SplitLeaf(other) => {
                    let shift = diff_shift(other, key);
                    let mut node = Node::new(shift, prefix(key, shift));
                    node.children[nib(other, shift)] = std::mem::take(cur);
                    node.children[nib(key, shift)] = Slot::Leaf { key, value };
                    *cur = Slot::Node(node);
                    return Ok(());
                }
                Act::SplitNode(path, node_shift) => {
                    let shift = diff_shift(path, prefix(key, node_shift));
                    debug_assert!(shift > node_shift);
                    let mut parent = Node::new(shift, prefix(key, shift));
                    parent.children[nib(path, shift)] = std::mem::take(cur);
                    parent.children[nib(key, shift)] = Slot::Leaf { key, value };
                    *cur = Slot::Node(parent);
                    return Ok(());
                }
                Act::Descend(idx) => {
                    cur = match cur {
                        Slot::Node(n) => &mut n.children[idx],
                        _ => unreachable!(),
                    };
                }
            }
        }
    }

    /// Exact lookup
    pub fn get(&self, key: u64) -> Option<V> {
        let guard = self.root.read().unwrap();
        let mut cur: &Slot<V> = &*guard;
        loop {
            match cur {
                Slot::Empty => return None,
                Slot::Leaf { key: k, value } => {
                    return if *k == key { Some(*value) } else { None }
                }
                Slot::Node(n) => {
                    if prefix(key, n.shift) != n.path {
                        return None;
                    }
                    cur = &n.children[nib(key, n.shift)];
                }
            }
        }
    }

    /// Removes `key`, returning the value that was stored under it
    pub fn remove(&self, key: u64) -> Option<V> {
        let mut guard = self.root.write().unwrap();
        Self::remove_rec(&mut *guard, key)
    }

    fn remove_rec(slot: &mut Slot<V>, key: u64) -> Option<V> {
        match slot {
            Slot::Empty => None,
            Slot::Leaf { key: k, value } => {
                if *k == key {
                    let v = *value;
                    *slot = Slot::Empty;
                    Some(v)
                } else {
                    None
                }
            }
            Slot::Node(n) => {
                if prefix(key, n.shift) != n.path {
                    return None;
                }
                let v = Self::remove_rec(&mut n.children[nib(key, n.shift)], key)?;

                // collapse single-child nodes so stale paths do not linger
                let mut remaining = 0;
                let mut last = 16;
                for (i, c) in n.children.iter().enumerate() {
                    if !matches!(c, Slot::Empty) {
                        remaining += 1;
                        last = i;
                    }
                }
                if remaining == 0 {
                    *slot = Slot::Empty;
                } else if remaining == 1 {
                    let child = std::mem::take(&mut n.children[last]);
                    *slot = child;
                }
                Some(v)
            }
        }
    }

    /// The entry with the largest key less than or equal to `key`
    pub fn find_le(&self, key: u64) -> Option<(u64, V)> {
        let guard = self.root.read().unwrap();
        Self::find_le_rec(&*guard, key)
    }

    fn find_le_rec(slot: &Slot<V>, key: u64) -> Option<(u64, V)> {
        match slot {
            Slot::Empty => None,
            Slot::Leaf { key: k, value } => {
                if *k <= key {
                    Some((*k, *value))
                } else {
                    None
                }
            }
            Slot::Node(n) => {
                let p = prefix(key, n.shift);
                if p < n.path {
                    None
                } else if p > n.path {
                    Self::max_rec(slot)
                } else {
                    let idx = nib(key, n.shift);
                    if let Some(r) = Self::find_le_rec(&n.children[idx], key) {
                        return Some(r);
                    }
                    for j in (0..idx).rev() {
                        if let r @ Some(_) = Self::max_rec(&n.children[j]) {
                            return r;
                        }
                    }
                    None
                }
            }
        }
    }

    fn max_rec(slot: &Slot<V>) -> Option<(u64, V)> {
        match slot {
            Slot::Empty => None,
            Slot::Leaf { key, value } => Some((*key, *value)),
            Slot::Node(n) => {
                for c in n.children.iter().rev() {
                    if let r @ Some(_) = Self::max_rec(c) {
                        return r;
                    }
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::prelude::*;
    use std::collections::BTreeMap;

    #[test]
    fn exact_lookup() {
        let c = Critnib::new();
        c.insert(1, 10u64).unwrap();
        c.insert(0xdeadbeef, 20).unwrap();
        assert_eq!(c.get(1), Some(10));
        assert_eq!(c.get(0xdeadbeef), Some(20));
        assert_eq!(c.get(2), None);
    }

    #[test]
    fn duplicate_insert_keeps_first() {
        let c = Critnib::new();
        c.insert(7, 1u64).unwrap();
        assert!(matches!(c.insert(7, 2), Err(Error::Exists)));
        assert_eq!(c.get(7), Some(1));
    }

    #[test]
    fn remove_returns_value() {
        let c = Critnib::new();
        c.insert(42, 99u64).unwrap();
        assert_eq!(c.remove(42), Some(99));
        assert_eq!(c.get(42), None);
        assert_eq!(c.remove(42), None);
        assert_eq!(c.remove(1234), None);
    }

    #[test]
    fn find_le_basic() {
        let c = Critnib::new();
        for k in &[1u64, 2, 3, 4, 0xf, 0xe, 0x11, 0x12, 0x20] {
            c.insert(*k, *k).unwrap();
        }
        assert_eq!(c.find_le(6).map(|(k, _)| k), Some(4));
        assert_eq!(c.find_le(0x15).map(|(k, _)| k), Some(0x12));
        assert_eq!(c.find_le(0xfffffff).map(|(k, _)| k), Some(0x20));
        assert_eq!(c.find_le(0), None);
        assert_eq!(c.find_le(1).map(|(k, _)| k), Some(1));
    }

    #[test]
    fn randomized_against_btreemap() {
        let mut rng = StdRng::seed_from_u64(0x6c61_6e65);
        let c = Critnib::new();
        let mut model = BTreeMap::new();

        for _ in 0..4000 {
            let k = if rng.gen_bool(0.5) {
                rng.gen_range(0..512u64)
            } else {
                rng.gen::<u64>()
            };
            match rng.gen_range(0..3) {
                0 => {
                    let r = c.insert(k, k ^ 0xff);
                    if model.insert(k, k ^ 0xff).is_some() {
                        assert!(r.is_err());
                    } else {
                        assert!(r.is_ok());
                    }
                }
                1 => {
                    assert_eq!(c.remove(k), model.remove(&k));
                }
                _ => {
                    assert_eq!(c.get(k), model.get(&k).copied());
                    let q = rng.gen::<u64>();
                    let expect = model.range(..=q).next_back().map(|(k, v)| (*k, *v));
                    assert_eq!(c.find_le(q), expect);
                }
            }
        }
    }
}
