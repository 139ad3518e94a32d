//! A concurrent, pointer-tagged, single-mutex radix trie over arbitrary
//! length, length-prefixed binary keys.
//!
//! Fanout is fixed at 16 (one child slot per nibble), and path compression
//! comes from each internal node carrying a `(byte_offset, bit_offset)`
//! discriminator naming exactly the nibble it branches on, rather than one
//! node per bit or per byte. Keys where one is a byte-prefix of another are
//! out of scope (see the crate's `DESIGN.md`); every other arbitrary-length
//! binary key is supported.
//!
//! All mutation and lookup goes through a single [`parking_lot::Mutex`]
//! guarding the root pointer; there is no lock-free read path.

mod node;

use parking_lot::Mutex;

use crate::error::InsertError;
use node::{ConcreteNodePtr, Discriminator, InternalNode, LeafNode, NodePtr, OpaqueNodePtr};

/// Index of the most significant set bit in a nonzero byte, counting from
/// bit 7 (MSB) down to bit 0 (LSB).
fn util_mssb_index(byte: u8) -> u8 {
    debug_assert_ne!(byte, 0);
    7 - byte.leading_zeros() as u8
}

/// The nibble of `byte` at `bit_offset` (`0` or `4`).
fn slice_index(byte: u8, bit_offset: u8) -> u8 {
    (byte >> bit_offset) & 0xF
}

/// The nibble boundary (`0` or `4`) containing bit index `bit`.
fn nibble_boundary(bit: u8) -> u8 {
    if bit >= 4 {
        4
    } else {
        0
    }
}

/// Total ordering over `(byte_offset, bit_offset)` discriminator positions:
/// shallower (earlier-compared) positions are "less than" deeper ones. The
/// high nibble of a byte (`bit_offset == 4`) is compared before the low
/// nibble (`bit_offset == 0`).
fn position_rank(byte_offset: usize, bit_offset: u8) -> usize {
    byte_offset * 2 + if bit_offset == 4 { 0 } else { 1 }
}

/// The first byte offset at which `a` and `b` differ, treating a key as
/// implicitly padded with zero bytes past its length. Returns `None` if the
/// keys are equal up to the longer key's length (the keys are equal, or one
/// is a byte-prefix of the other — both unsupported per spec's Non-goals).
fn first_diff_byte(a: &[u8], b: &[u8]) -> Option<usize> {
    let len = a.len().max(b.len());
    (0..len).find(|&i| a.get(i).copied().unwrap_or(0) != b.get(i).copied().unwrap_or(0))
}

/// The discriminator naming the first nibble at which `a` and `b` diverge.
fn divergence(a: &[u8], b: &[u8]) -> Option<Discriminator> {
    let byte_offset = first_diff_byte(a, b)?;
    let ab = a.get(byte_offset).copied().unwrap_or(0);
    let bb = b.get(byte_offset).copied().unwrap_or(0);
    let differing = ab ^ bb;
    let bit_offset = nibble_boundary(util_mssb_index(differing));
    Some(Discriminator {
        byte_offset,
        bit_offset,
    })
}

struct IndexInner<V> {
    root: Option<OpaqueNodePtr<V>>,
}

/// The radix trie index.
pub struct Index<V> {
    inner: Mutex<IndexInner<V>>,
}

// SAFETY: every `OpaqueNodePtr<V>` reachable from `Index` is only read or
// written while `inner`'s mutex is held; the mutex is what makes sharing
// the trie across threads sound, not anything about the raw pointers
// themselves.
unsafe impl<V: Send> Send for Index<V> {}
unsafe impl<V: Send> Sync for Index<V> {}

impl<V> Default for Index<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Index<V> {
    /// An empty index.
    pub fn new() -> Self {
        Index {
            inner: Mutex::new(IndexInner { root: None }),
        }
    }

    /// Follow any child repeatedly to reach some leaf under `start`, used
    /// to get a representative key to compare the new key against.
    ///
    /// # Safety
    ///
    /// Caller must hold the index's mutex.
    unsafe fn find_representative(start: OpaqueNodePtr<V>) -> NodePtr<LeafNode<V>> {
        let mut cur = start;
        loop {
            match cur.to_concrete() {
                ConcreteNodePtr::Leaf(leaf) => return leaf,
                ConcreteNodePtr::Internal(node) => {
                    // SAFETY: caller holds the mutex; every internal node has
                    // at least one child (enforced by edge-shortening on
                    // remove), so this cannot panic.
                    let node = unsafe { node.as_ref() };
                    cur = node
                        .children
                        .iter()
                        .find_map(|c| *c)
                        .expect("internal node with no children");
                }
            }
        }
    }

    /// Insert `key` with `value`.
    ///
    /// # Errors
    ///
    /// Returns [`InsertError::AlreadyPresent`] if `key` is already present.
    ///
    /// # Safety
    ///
    /// `key` must remain valid and unmoved for as long as it stays
    /// reachable from this index (until a successful [`Index::remove`] of
    /// the same key).
    pub unsafe fn insert(&self, key: &[u8], value: V) -> Result<(), InsertError> {
        let mut inner = self.inner.lock();

        let root = match inner.root {
            None => {
                // SAFETY: caller guarantees `key`'s validity/lifetime.
                let leaf = NodePtr::allocate(unsafe { LeafNode::new(key, value) });
                inner.root = Some(OpaqueNodePtr::from_leaf(leaf));
                log::trace!("index: inserted first key, len={}", key.len());
                return Ok(());
            }
            Some(root) => root,
        };

        // First descent: find a representative leaf to compare against.
        let mut cur = root;
        let representative = loop {
            match cur.to_concrete() {
                ConcreteNodePtr::Leaf(leaf) => break leaf,
                ConcreteNodePtr::Internal(node_ptr) => {
                    // SAFETY: mutex held.
                    let node = unsafe { node_ptr.as_ref() };
                    let nibble = node.discriminator.nibble_of(key);
                    match node.children[nibble as usize] {
                        Some(child) => cur = child,
                        // SAFETY: mutex held.
                        None => break unsafe { Self::find_representative(cur) },
                    }
                }
            }
        };

        // SAFETY: mutex held, and the representative's backing key storage
        // is guaranteed valid by the precondition on the original `insert`
        // call that placed it.
        let existing_key = unsafe { representative.as_ref().key() };
        let Some(divergence) = divergence(existing_key, key) else {
            return Err(InsertError::AlreadyPresent);
        };
        let divergence_rank = position_rank(divergence.byte_offset, divergence.bit_offset);

        // Second descent: re-walk from root, following only discriminators
        // strictly before the divergence point, to find the splice point.
        let mut parent: Option<(NodePtr<InternalNode<V>>, u8)> = None;
        let mut cur = root;
        loop {
            match cur.to_concrete() {
                ConcreteNodePtr::Leaf(_) => break,
                ConcreteNodePtr::Internal(node_ptr) => {
                    // SAFETY: mutex held.
                    let node = unsafe { node_ptr.as_ref() };
                    let rank = position_rank(node.discriminator.byte_offset, node.discriminator.bit_offset);
                    if rank >= divergence_rank {
                        break;
                    }
                    let nibble = node.discriminator.nibble_of(key);
                    let child = node.children[nibble as usize]
                        .expect("existing subtree must share the new key's nibble before the divergence point");
                    parent = Some((node_ptr, nibble));
                    cur = child;
                }
            }
        }

        // SAFETY: caller guarantees `key`'s validity/lifetime.
        let new_leaf = NodePtr::allocate(unsafe { LeafNode::new(key, value) });
        let mut new_internal = InternalNode::new(divergence);
        let new_nibble = divergence.nibble_of(key);
        let existing_nibble = divergence.nibble_of(existing_key);
        debug_assert_ne!(new_nibble, existing_nibble);
        new_internal.children[new_nibble as usize] = Some(OpaqueNodePtr::from_leaf(new_leaf));
        new_internal.children[existing_nibble as usize] = Some(cur);
        let new_internal = OpaqueNodePtr::from_internal(NodePtr::allocate(new_internal));

        match parent {
            Some((parent_ptr, nibble)) => {
                // SAFETY: mutex held, exclusive access to this node's children.
                let parent = unsafe { parent_ptr.as_mut() };
                parent.children[nibble as usize] = Some(new_internal);
            }
            None => inner.root = Some(new_internal),
        }
        log::trace!(
            "index: split at byte_offset={} bit_offset={}",
            divergence.byte_offset,
            divergence.bit_offset
        );

        Ok(())
    }

    /// Look up `key`, invoking `f` with the stored value if present.
    ///
    /// # Safety
    ///
    /// Any key previously inserted must still have valid, unmoved backing
    /// storage for the duration of this call.
    pub unsafe fn lookup<R>(&self, key: &[u8], f: impl FnOnce(&V) -> R) -> Option<R> {
        let inner = self.inner.lock();
        let mut cur = inner.root?;
        loop {
            match cur.to_concrete() {
                ConcreteNodePtr::Leaf(leaf) => {
                    // SAFETY: mutex held; backing storage validity is the
                    // caller's precondition.
                    let leaf = unsafe { leaf.as_ref() };
                    return if unsafe { leaf.key() } == key {
                        Some(f(&leaf.value))
                    } else {
                        None
                    };
                }
                ConcreteNodePtr::Internal(node_ptr) => {
                    // SAFETY: mutex held.
                    let node = unsafe { node_ptr.as_ref() };
                    let nibble = node.discriminator.nibble_of(key);
                    cur = node.children[nibble as usize]?;
                }
            }
        }
    }

    /// Remove `key`, returning its value if present.
    ///
    /// Performs edge-shortening: if removing a leaf leaves its parent
    /// internal node with exactly one remaining child, the parent is
    /// collapsed out of the trie and that child takes its place.
    ///
    /// # Safety
    ///
    /// Any key previously inserted must still have valid, unmoved backing
    /// storage for the duration of this call.
    pub unsafe fn remove(&self, key: &[u8]) -> Option<V> {
        let mut inner = self.inner.lock();
        let root = inner.root?;

        // Root is a single leaf with no parent to shorten.
        if let ConcreteNodePtr::Leaf(leaf) = root.to_concrete() {
            // SAFETY: mutex held.
            if unsafe { leaf.as_ref().key() } != key {
                return None;
            }
            inner.root = None;
            // SAFETY: unique ownership, no longer reachable from the trie.
            let value = unsafe { leaf.into_inner() }.value;
            return Some(value);
        }

        // grandparent: the internal node one level above `parent`, needed to
        // rewrite its child slot if `parent` gets collapsed.
        let mut grandparent: Option<(NodePtr<InternalNode<V>>, u8)> = None;
        let mut parent: (NodePtr<InternalNode<V>>, u8);
        let mut cur = root;
        loop {
            match cur.to_concrete() {
                ConcreteNodePtr::Leaf(_) => unreachable!("root already handled as non-leaf"),
                ConcreteNodePtr::Internal(node_ptr) => {
                    // SAFETY: mutex held.
                    let node = unsafe { node_ptr.as_ref() };
                    let nibble = node.discriminator.nibble_of(key);
                    let Some(child) = node.children[nibble as usize] else {
                        return None;
                    };
                    if let ConcreteNodePtr::Leaf(leaf) = child.to_concrete() {
                        // SAFETY: mutex held.
                        if unsafe { leaf.as_ref().key() } != key {
                            return None;
                        }
                        parent = (node_ptr, nibble);
                        break;
                    }
                    grandparent = Some((node_ptr, nibble));
                    cur = child;
                }
            }
        }

        let (parent_ptr, nibble_in_parent) = parent;
        // SAFETY: mutex held, exclusive access.
        let parent_node = unsafe { parent_ptr.as_mut() };
        let removed_leaf = parent_node.children[nibble_in_parent as usize].take().unwrap();
        let ConcreteNodePtr::Leaf(removed_leaf) = removed_leaf.to_concrete() else {
            unreachable!("just matched a leaf above");
        };
        // SAFETY: unique ownership, unlinked from the trie above.
        let value = unsafe { removed_leaf.into_inner() }.value;

        if let Some((remaining_nibble, remaining_child)) = parent_node.only_child() {
            // Collapse `parent` out of the trie: its one remaining child
            // takes its place in the grandparent (or becomes the new root).
            match grandparent {
                Some((grandparent_ptr, nibble_in_grandparent)) => {
                    // SAFETY: mutex held, exclusive access.
                    let grandparent_node = unsafe { grandparent_ptr.as_mut() };
                    grandparent_node.children[nibble_in_grandparent as usize] = Some(remaining_child);
                }
                None => inner.root = Some(remaining_child),
            }
            let _ = remaining_nibble;
            // SAFETY: `parent_ptr` is now unreachable from the trie and
            // uniquely owned here.
            unsafe { parent_ptr.deallocate() };
            log::trace!("index: collapsed internal node on remove");
        }

        Some(value)
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        match inner.root {
            None => 0,
            Some(root) => count(root),
        }
    }

    /// Whether the index holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn count<V>(node: OpaqueNodePtr<V>) -> usize {
    match node.to_concrete() {
        ConcreteNodePtr::Leaf(_) => 1,
        ConcreteNodePtr::Internal(node_ptr) => {
            // SAFETY: mutex held by caller (`Index::len`).
            let node = unsafe { node_ptr.as_ref() };
            node.children.iter().flatten().map(|c| count(*c)).sum()
        }
    }
}

/// # Safety
///
/// `node` and everything below it must be uniquely owned (no other
/// `OpaqueNodePtr` aliases any part of this subtree) and not used again
/// after this call.
unsafe fn drop_recursive<V>(node: OpaqueNodePtr<V>) {
    match node.to_concrete() {
        ConcreteNodePtr::Leaf(leaf) => {
            // SAFETY: caller guarantees unique ownership.
            unsafe { leaf.deallocate() };
        }
        ConcreteNodePtr::Internal(node_ptr) => {
            // SAFETY: caller guarantees unique ownership; we read the
            // children before freeing the node itself.
            let children: Vec<_> = unsafe { node_ptr.as_ref() }.children.iter().flatten().copied().collect();
            for child in children {
                // SAFETY: each child is uniquely owned by this subtree.
                unsafe { drop_recursive(child) };
            }
            // SAFETY: caller guarantees unique ownership.
            unsafe { node_ptr.deallocate() };
        }
    }
}

impl<V> Drop for Index<V> {
    fn drop(&mut self) {
        if let Some(root) = self.inner.get_mut().root {
            // SAFETY: `&mut self` guarantees no concurrent access, and this
            // is the only owner of the trie's allocations.
            unsafe { drop_recursive(root) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_lookup_remove_single_key() {
        let index: Index<u32> = Index::new();
        let key = b"hello".to_vec();
        unsafe {
            index.insert(&key, 42).unwrap();
            assert_eq!(index.lookup(&key, |v| *v), Some(42));
            assert_eq!(index.remove(&key), Some(42));
            assert_eq!(index.lookup(&key, |v| *v), None);
        }
    }

    #[test]
    fn insert_duplicate_key_errors() {
        let index: Index<u32> = Index::new();
        let key = b"dup".to_vec();
        unsafe {
            index.insert(&key, 1).unwrap();
            assert_eq!(index.insert(&key, 2), Err(InsertError::AlreadyPresent));
        }
    }

    #[test]
    fn insert_diverging_keys_both_lookup() {
        let index: Index<u32> = Index::new();
        let a = b"apple".to_vec();
        let b = b"apricot".to_vec();
        unsafe {
            index.insert(&a, 1).unwrap();
            index.insert(&b, 2).unwrap();
            assert_eq!(index.lookup(&a, |v| *v), Some(1));
            assert_eq!(index.lookup(&b, |v| *v), Some(2));
            assert_eq!(index.len(), 2);
        }
    }

    #[test]
    fn remove_collapses_internal_node() {
        let index: Index<u32> = Index::new();
        let a = b"apple".to_vec();
        let b = b"apricot".to_vec();
        unsafe {
            index.insert(&a, 1).unwrap();
            index.insert(&b, 2).unwrap();
            assert_eq!(index.remove(&a), Some(1));
            assert_eq!(index.lookup(&b, |v| *v), Some(2));
            assert_eq!(index.len(), 1);
        }
    }

    #[test]
    fn many_keys_survive_shuffled_removal() {
        let index: Index<usize> = Index::new();
        let keys: Vec<Vec<u8>> = (0..200u32).map(|i| i.to_be_bytes().to_vec()).collect();
        unsafe {
            for (i, k) in keys.iter().enumerate() {
                index.insert(k, i).unwrap();
            }
            for (i, k) in keys.iter().enumerate() {
                assert_eq!(index.lookup(k, |v| *v), Some(i));
            }
            for k in keys.iter().step_by(2) {
                assert!(index.remove(k).is_some());
            }
            for (i, k) in keys.iter().enumerate() {
                if i % 2 == 0 {
                    assert_eq!(index.lookup(k, |v| *v), None);
                } else {
                    assert_eq!(index.lookup(k, |v| *v), Some(i));
                }
            }
        }
    }
}
