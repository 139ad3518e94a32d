//! Property-based tests for [`cachetrie::Index`].

use std::collections::HashMap;

use cachetrie::Index;
use proptest::prelude::*;

/// Keys are distinct byte strings with no byte-prefix relationship between
/// any two of them (unsupported, per the index's Non-goals): achieved here
/// by fixing every key to the same length.
fn fixed_length_keys(len: usize, count: usize) -> impl Strategy<Value = Vec<Vec<u8>>> {
    proptest::collection::hash_set(proptest::collection::vec(any::<u8>(), len), count)
        .prop_map(|set| set.into_iter().collect())
}

proptest! {
    #[test]
    fn insert_then_lookup_every_key(keys in fixed_length_keys(4, 40)) {
        let _ = env_logger::try_init();
        let index: Index<usize> = Index::new();
        for (i, key) in keys.iter().enumerate() {
            unsafe { index.insert(key, i).unwrap(); }
        }
        for (i, key) in keys.iter().enumerate() {
            prop_assert_eq!(unsafe { index.lookup(key, |v| *v) }, Some(i));
        }
        prop_assert_eq!(index.len(), keys.len());
    }

    #[test]
    fn remove_forgets_key_but_keeps_others(keys in fixed_length_keys(4, 40)) {
        let _ = env_logger::try_init();
        prop_assume!(!keys.is_empty());
        let index: Index<usize> = Index::new();
        for (i, key) in keys.iter().enumerate() {
            unsafe { index.insert(key, i).unwrap(); }
        }

        let removed = &keys[0];
        let removed_value = unsafe { index.remove(removed) };
        prop_assert_eq!(removed_value, Some(0));
        prop_assert_eq!(unsafe { index.lookup(removed, |v| *v) }, None);

        for (i, key) in keys.iter().enumerate().skip(1) {
            prop_assert_eq!(unsafe { index.lookup(key, |v| *v) }, Some(i));
        }
    }

    #[test]
    fn insert_remove_sequence_matches_reference_map(
        keys in fixed_length_keys(3, 30),
        ops in proptest::collection::vec(any::<(proptest::sample::Index, bool)>(), 60),
    ) {
        let _ = env_logger::try_init();
        prop_assume!(!keys.is_empty());
        let index: Index<usize> = Index::new();
        let mut reference: HashMap<Vec<u8>, usize> = HashMap::new();

        for (op_idx, (key_idx, should_insert)) in ops.into_iter().enumerate() {
            // Borrowed from `keys`, which outlives the index below, so the
            // pointer the index stores stays valid for the whole test.
            let key: &[u8] = key_idx.get(&keys);
            if should_insert {
                if !reference.contains_key(key) {
                    unsafe { index.insert(key, op_idx).unwrap(); }
                    reference.insert(key.to_vec(), op_idx);
                }
            } else if reference.remove(key).is_some() {
                prop_assert!(unsafe { index.remove(key) }.is_some());
            }
        }

        for (key, value) in &reference {
            prop_assert_eq!(unsafe { index.lookup(key, |v| *v) }, Some(*value));
        }
        prop_assert_eq!(index.len(), reference.len());
    }
}
