#![deny(
    missing_docs,
    clippy::missing_safety_doc,
    unsafe_op_in_unsafe_fn,
    deprecated_in_future,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls
)]

//! Index and eviction core for a volatile in-memory cache.
//!
//! This crate provides two pieces a cache builds on top of, and nothing
//! else: a concurrent key/value lookup structure ([`index`]) and an
//! approximate-LRU eviction order ([`policy`]). Neither owns the cache's
//! payload storage, and neither exposes a `put`/`get`/`evict` public API —
//! that surface, along with statistics counters and the on-disk/wire
//! format, belongs to the cache built on top of this crate.
//!
//! # Modules
//!
//! - [`index`]: a single-mutex radix trie over length-prefixed binary keys.
//! - [`policy`]: a single-mutex doubly-linked LRU queue fronted by a
//!   lock-free touched buffer.
//! - [`error`]: error types for both modules' fallible operations.

pub mod error;
pub mod index;
pub mod policy;
mod tagged_pointer;

pub use index::Index;
pub use policy::{BackPtrSlot, LruPolicy};
