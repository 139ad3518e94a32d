//! An approximate-LRU eviction policy.
//!
//! The queue itself — a doubly-linked list ordered from most- to
//! least-recently-used — is protected by a single [`parking_lot::Mutex`].
//! `touch` (the hot path, called on every cache hit) avoids that mutex in
//! the common case: instead of splicing the list directly, it reserves a
//! slot in a small lock-free "touched buffer" and only drains that buffer
//! into the real list — under the mutex — once it fills up or an `evict`
//! needs an up-to-date ordering. This trades strict recency ordering for
//! throughput: the queue is approximately, not strictly, LRU-ordered.
//!
//! Each node has a one-word tri-state flag coordinating this:
//!
//!  - `IDLE` (0): not reserved in the touched buffer.
//!  - `RESERVING` (1): a thread has claimed a buffer slot for this node
//!    and is about to write into it.
//!  - `PENDING` (2): the slot write landed; the node is waiting to be
//!    drained into the list.
//!
//! The flag guarantees at most one touched-buffer reservation per node per
//! drain cycle: a second concurrent `touch` sees `RESERVING` or `PENDING`
//! and becomes a no-op. A CAS that should be uncontended (`RESERVING` ->
//! `PENDING`, performed only by the thread that won the `IDLE` -> `RESERVING`
//! race) failing indicates the invariant was violated by a bug elsewhere in
//! this module, not a condition a caller can recover from, so it is
//! fail-stop: log and abort the process.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::AttachError;

/// Default capacity of the touched buffer (spec's suggested constant).
pub const DEFAULT_TOUCHED_BUFFER_CAPACITY: usize = 256;

const IDLE: u8 = 0;
const RESERVING: u8 = 1;
const PENDING: u8 = 2;

/// A node in the intrusive LRU list.
struct PolicyNode<D> {
    prev: Option<NonNull<PolicyNode<D>>>,
    next: Option<NonNull<PolicyNode<D>>>,
    touch_state: AtomicU8,
    /// Index into the touched buffer this node last reserved, valid only
    /// while `touch_state` is `RESERVING` or `PENDING`. Lets a targeted
    /// `detach`/`evict` clear the buffer slot before freeing the node,
    /// rather than leaving a dangling pointer for the next drain to read.
    i_used: AtomicUsize,
    data: D,
}

/// A caller-owned slot the policy writes its own node identifier into.
///
/// The surrounding cache embeds one of these in each entry and
/// zero-initializes it; [`LruPolicy::attach`] fills it in, and
/// [`LruPolicy::touch`] / [`LruPolicy::detach`] use it to find the node in
/// O(1) without a hash lookup.
pub struct BackPtrSlot<D>(Option<NonNull<PolicyNode<D>>>);

impl<D> BackPtrSlot<D> {
    /// A slot not yet attached to any node.
    pub fn new() -> Self {
        BackPtrSlot(None)
    }

    /// Whether this slot has not been attached (or has been detached).
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

impl<D> Default for BackPtrSlot<D> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: a `BackPtrSlot` is only ever dereferenced through `LruPolicy`'s
// own synchronized methods (the mutex for `attach`/`detach`, the atomic
// touch-state protocol for `touch`), never directly by callers, so sharing
// the slot itself across threads carries no additional hazard beyond what
// `LruPolicy<D>` already requires of `D`.
unsafe impl<D: Send> Send for BackPtrSlot<D> {}
unsafe impl<D: Send> Sync for BackPtrSlot<D> {}

/// One pending touch recorded in the lock-free buffer, awaiting drain.
struct TouchedSlot<D> {
    node: AtomicUsize,
    _marker: std::marker::PhantomData<D>,
}

impl<D> TouchedSlot<D> {
    fn empty() -> Self {
        TouchedSlot {
            node: AtomicUsize::new(0),
            _marker: std::marker::PhantomData,
        }
    }
}

struct TouchedBuffer<D> {
    slots: Box<[TouchedSlot<D>]>,
    /// Number of slots reserved (and possibly still being written) since the
    /// last drain; drained atomically via `swap` so a concurrent reserver
    /// racing a drain either lands in this cycle or the next one, never
    /// both and never neither.
    n_reserved: AtomicUsize,
}

impl<D> TouchedBuffer<D> {
    fn with_capacity(capacity: usize) -> Self {
        TouchedBuffer {
            slots: (0..capacity).map(|_| TouchedSlot::empty()).collect(),
            n_reserved: AtomicUsize::new(0),
        }
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Reserve a slot index, or `None` if the buffer is full.
    fn reserve(&self) -> Option<usize> {
        let idx = self.n_reserved.fetch_add(1, Ordering::AcqRel);
        if idx < self.capacity() {
            Some(idx)
        } else {
            // Over capacity: undo our reservation so the counter doesn't
            // grow without bound across repeated overflows.
            self.n_reserved.fetch_sub(1, Ordering::AcqRel);
            None
        }
    }

    fn write(&self, idx: usize, node: NonNull<PolicyNode<D>>) {
        self.slots[idx].node.store(node.as_ptr() as usize, Ordering::Release);
    }

    /// Clear slot `idx` if it still holds `node`, so a node about to be
    /// freed is never read back by a later `drain`. No-op if the slot was
    /// already drained (or reused) in the meantime.
    fn clear_if(&self, idx: usize, node: NonNull<PolicyNode<D>>) {
        if idx >= self.slots.len() {
            return;
        }
        let _ = self.slots[idx].node.compare_exchange(
            node.as_ptr() as usize,
            0,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Atomically take every slot written so far and reset the buffer for
    /// the next cycle.
    fn drain(&self) -> Vec<NonNull<PolicyNode<D>>> {
        let n = self.n_reserved.swap(0, Ordering::AcqRel).min(self.capacity());
        let mut out = Vec::with_capacity(n);
        for slot in &self.slots[..n] {
            let raw = slot.node.swap(0, Ordering::AcqRel);
            if raw != 0 {
                // SAFETY: non-zero values are only ever written by `write`
                // from a valid `NonNull<PolicyNode<D>>`.
                out.push(unsafe { NonNull::new_unchecked(raw as *mut PolicyNode<D>) });
            }
        }
        out
    }
}

struct ListInner<D> {
    head: Option<NonNull<PolicyNode<D>>>,
    tail: Option<NonNull<PolicyNode<D>>>,
    len: usize,
}

/// An approximate-LRU eviction policy over opaque per-entry data `D`.
pub struct LruPolicy<D> {
    list: Mutex<ListInner<D>>,
    touched: TouchedBuffer<D>,
}

// SAFETY: all access to the `NonNull<PolicyNode<D>>` pointers embedded in
// `ListInner`/`TouchedBuffer` happens either under `list`'s mutex or through
// the atomics in `TouchedSlot`/the touch-state flag; the policy does not
// expose raw pointers to callers.
unsafe impl<D: Send> Send for LruPolicy<D> {}
unsafe impl<D: Send> Sync for LruPolicy<D> {}

impl<D> Default for LruPolicy<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> LruPolicy<D> {
    /// A new policy with the default touched-buffer capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOUCHED_BUFFER_CAPACITY)
    }

    /// A new policy with an explicit touched-buffer capacity.
    pub fn with_capacity(touched_buffer_capacity: usize) -> Self {
        LruPolicy {
            list: Mutex::new(ListInner {
                head: None,
                tail: None,
                len: 0,
            }),
            touched: TouchedBuffer::with_capacity(touched_buffer_capacity),
        }
    }

    /// Insert `data` at the most-recently-used end and bind `slot` to it.
    ///
    /// # Errors
    ///
    /// Returns [`AttachError::AlreadyAttached`] if `slot` is already bound
    /// to a node.
    pub fn attach(&self, slot: &mut BackPtrSlot<D>, data: D) -> Result<(), AttachError> {
        if !slot.is_empty() {
            return Err(AttachError::AlreadyAttached);
        }
        let node = Box::leak(Box::new(PolicyNode {
            prev: None,
            next: None,
            touch_state: AtomicU8::new(IDLE),
            i_used: AtomicUsize::new(0),
            data,
        }));
        let node_ptr = NonNull::from(node);

        let mut list = self.list.lock();
        self.push_front(&mut list, node_ptr);
        slot.0 = Some(node_ptr);
        log::trace!("policy: attached node, len={}", list.len);
        Ok(())
    }

    /// Record that the node bound to `slot` was used, approximately
    /// promoting it toward the most-recently-used end.
    ///
    /// This is the hot path: in the common case it only performs an atomic
    /// CAS and a slot write, never taking `self.list`'s mutex. If the
    /// touched buffer is full, it falls back to draining the buffer (and
    /// moving this node) under the mutex.
    pub fn touch(&self, slot: &BackPtrSlot<D>) {
        let Some(node_ptr) = slot.0 else { return };
        // SAFETY: `node_ptr` was produced by `attach` and stays valid until
        // `detach` removes it; callers may not reuse a slot across detach
        // without re-attaching.
        let node = unsafe { node_ptr.as_ref() };

        match node
            .touch_state
            .compare_exchange(IDLE, RESERVING, Ordering::AcqRel, Ordering::Acquire)
        {
            Err(_) => {
                // Already RESERVING or PENDING: someone else's touch will
                // carry this node into the next drain. Nothing to do.
                return;
            }
            Ok(_) => {}
        }

        match self.touched.reserve() {
            Some(idx) => {
                self.touched.write(idx, node_ptr);
                node.i_used.store(idx, Ordering::Release);
                if node
                    .touch_state
                    .compare_exchange(RESERVING, PENDING, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    log::error!("policy: touch state corrupted (RESERVING -> PENDING CAS failed)");
                    std::process::abort();
                }
            }
            None => {
                // Buffer is full: drain it under the mutex, then move this
                // node to the front directly.
                node.touch_state.store(IDLE, Ordering::Release);
                let mut list = self.list.lock();
                self.drain_locked(&mut list);
                self.move_to_front_locked(&mut list, node_ptr);
                log::debug!("policy: touched buffer full, drained under lock");
            }
        }
    }

    /// Evict and return the least-recently-used node's data, draining any
    /// pending touches first so the choice reflects the latest known order.
    pub fn evict(&self) -> Option<D> {
        let mut list = self.list.lock();
        self.drain_locked(&mut list);
        let tail = list.tail?;
        self.unlink_locked(&mut list, tail);
        // SAFETY: `tail` was just unlinked, making this the sole owner.
        let node = unsafe { Box::from_raw(tail.as_ptr()) };
        log::trace!("policy: evicted node, len={}", list.len);
        Some(node.data)
    }

    /// Remove the node bound to `slot` from the policy, wherever it sits in
    /// the list, and return its data. No-op (returns `None`) if `slot` is
    /// empty.
    pub fn detach(&self, slot: &mut BackPtrSlot<D>) -> Option<D> {
        let Some(node_ptr) = slot.0.take() else {
            // A caller detaching an already-empty slot is either detaching
            // twice or detaching a slot that was never attached; neither is
            // unsound (it's a documented no-op) but both are usually a sign
            // the caller's own bookkeeping drifted from the policy's.
            log::warn!("policy: detach called on an already-empty back-pointer slot");
            return None;
        };
        let mut list = self.list.lock();
        self.unlink_locked(&mut list, node_ptr);
        // SAFETY: exclusive access via `list`'s mutex.
        let node_ref = unsafe { node_ptr.as_ref() };
        if node_ref.touch_state.load(Ordering::Acquire) != IDLE {
            self.touched.clear_if(node_ref.i_used.load(Ordering::Acquire), node_ptr);
        }
        // SAFETY: just unlinked, and any touched-buffer slot referencing it
        // was just cleared above, so nothing else can read this pointer.
        let node = unsafe { Box::from_raw(node_ptr.as_ptr()) };
        Some(node.data)
    }

    /// Number of nodes currently in the policy.
    pub fn len(&self) -> usize {
        self.list.lock().len
    }

    /// Whether the policy holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push_front(&self, list: &mut ListInner<D>, node_ptr: NonNull<PolicyNode<D>>) {
        // SAFETY: exclusive access via `list`'s mutex.
        let node = unsafe { &mut *node_ptr.as_ptr() };
        node.prev = None;
        node.next = list.head;
        match list.head {
            // SAFETY: exclusive access via `list`'s mutex.
            Some(head) => unsafe { (*head.as_ptr()).prev = Some(node_ptr) },
            None => list.tail = Some(node_ptr),
        }
        list.head = Some(node_ptr);
        list.len += 1;
    }

    fn unlink_locked(&self, list: &mut ListInner<D>, node_ptr: NonNull<PolicyNode<D>>) {
        // SAFETY: exclusive access via `list`'s mutex.
        let node = unsafe { &mut *node_ptr.as_ptr() };
        match node.prev {
            // SAFETY: exclusive access via `list`'s mutex.
            Some(prev) => unsafe { (*prev.as_ptr()).next = node.next },
            None => list.head = node.next,
        }
        match node.next {
            // SAFETY: exclusive access via `list`'s mutex.
            Some(next) => unsafe { (*next.as_ptr()).prev = node.prev },
            None => list.tail = node.prev,
        }
        node.prev = None;
        node.next = None;
        list.len -= 1;
    }

    fn move_to_front_locked(&self, list: &mut ListInner<D>, node_ptr: NonNull<PolicyNode<D>>) {
        if list.head == Some(node_ptr) {
            return;
        }
        self.unlink_locked(list, node_ptr);
        self.push_front(list, node_ptr);
    }

    /// Drain the touched buffer and move every node it names to the front,
    /// in the order the buffer recorded them (oldest touch first, so the
    /// most recent touch ends up actually nearest the front).
    fn drain_locked(&self, list: &mut ListInner<D>) {
        for node_ptr in self.touched.drain() {
            // SAFETY: `node_ptr` was written into the buffer by `touch`
            // while the node was still attached, and `detach` clears any
            // slot it still owns before freeing the node (see `detach`), so
            // every pointer reaching this loop is still live.
            let node = unsafe { node_ptr.as_ref() };
            node.touch_state.store(IDLE, Ordering::Release);
            self.move_to_front_locked(list, node_ptr);
        }
    }
}

impl<D> Drop for LruPolicy<D> {
    fn drop(&mut self) {
        let mut cur = self.list.get_mut().head;
        while let Some(node_ptr) = cur {
            // SAFETY: `&mut self` guarantees no concurrent access; each node
            // is visited exactly once by following `next`.
            let node = unsafe { Box::from_raw(node_ptr.as_ptr()) };
            cur = node.next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_then_evict_is_lru_order() {
        let policy: LruPolicy<u32> = LruPolicy::new();
        let mut slots: Vec<_> = (0..3).map(|_| BackPtrSlot::new()).collect();
        for (i, slot) in slots.iter_mut().enumerate() {
            policy.attach(slot, i as u32).unwrap();
        }
        assert_eq!(policy.len(), 3);
        assert_eq!(policy.evict(), Some(0));
        assert_eq!(policy.evict(), Some(1));
        assert_eq!(policy.evict(), Some(2));
        assert_eq!(policy.evict(), None);
    }

    #[test]
    fn touch_promotes_node_to_front() {
        let policy: LruPolicy<u32> = LruPolicy::new();
        let mut slots: Vec<_> = (0..3).map(|_| BackPtrSlot::new()).collect();
        for (i, slot) in slots.iter_mut().enumerate() {
            policy.attach(slot, i as u32).unwrap();
        }
        // list is MRU-first: [2, 1, 0]; touching 0 should keep it from
        // being the next eviction once the touch is drained.
        policy.touch(&slots[0]);
        assert_eq!(policy.evict(), Some(1));
        assert_eq!(policy.evict(), Some(2));
        assert_eq!(policy.evict(), Some(0));
    }

    #[test]
    fn detach_removes_specific_node() {
        let policy: LruPolicy<u32> = LruPolicy::new();
        let mut slots: Vec<_> = (0..3).map(|_| BackPtrSlot::new()).collect();
        for (i, slot) in slots.iter_mut().enumerate() {
            policy.attach(slot, i as u32).unwrap();
        }
        assert_eq!(policy.detach(&mut slots[1]), Some(1));
        assert!(slots[1].is_empty());
        assert_eq!(policy.len(), 2);
        assert_eq!(policy.evict(), Some(0));
        assert_eq!(policy.evict(), Some(2));
    }

    #[test]
    fn attach_twice_without_detach_errors() {
        let policy: LruPolicy<u32> = LruPolicy::new();
        let mut slot = BackPtrSlot::new();
        policy.attach(&mut slot, 1).unwrap();
        assert_eq!(policy.attach(&mut slot, 2), Err(AttachError::AlreadyAttached));
    }

    #[test]
    fn detach_after_touch_does_not_leave_dangling_buffer_entry() {
        // Regression test: `touch` parks the node pointer in the touched
        // buffer (state PENDING) without taking the list mutex; `detach`
        // must scrub that entry before freeing the node, or a later drain
        // would dereference freed memory.
        let policy: LruPolicy<u32> = LruPolicy::new();
        let mut slots: Vec<_> = (0..3).map(|_| BackPtrSlot::new()).collect();
        for (i, slot) in slots.iter_mut().enumerate() {
            policy.attach(slot, i as u32).unwrap();
        }
        policy.touch(&slots[1]);
        assert_eq!(policy.detach(&mut slots[1]), Some(1));
        // Draining here would touch freed memory if the buffer still held
        // node 1's pointer; exercising `evict` (which drains first) is the
        // regression check.
        assert_eq!(policy.evict(), Some(0));
        assert_eq!(policy.evict(), Some(2));
        assert_eq!(policy.evict(), None);
    }

    #[test]
    fn touched_buffer_overflow_falls_back_to_locked_path() {
        let policy: LruPolicy<u32> = LruPolicy::with_capacity(2);
        let mut slots: Vec<_> = (0..5).map(|_| BackPtrSlot::new()).collect();
        for (i, slot) in slots.iter_mut().enumerate() {
            policy.attach(slot, i as u32).unwrap();
        }
        for slot in &slots {
            policy.touch(slot);
        }
        assert_eq!(policy.len(), 5);
    }
}
