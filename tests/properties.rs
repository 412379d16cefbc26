use std::collections::BTreeMap;

use proptest::prelude::*;
use shardbox::{
    codec::{ColumnHasher, Erasure, MerkleTree, merkle_root_hex},
    crypto::{hash, hash_hex},
    download::{ByteRange, block_range, windows},
};

fn arb_shards() -> impl Strategy<Value = (usize, usize)> {
    (1usize..6, 0usize..4)
}

proptest! {
    #![proptest_config(ProptestConfig {
        failure_persistence: None,
        .. ProptestConfig::default()
    })]

    #[test]
    fn test_resolved_range_stays_inside_object(
        total in 1u64..1_000_000,
        start in 0u64..1_000_000,
        end in proptest::option::of(0u64..2_000_000),
    ) {
        match ByteRange::new(start, end).resolve(total) {
            Ok(Some((s, e))) => {
                prop_assert_eq!(s, start);
                prop_assert!(s <= e);
                prop_assert!(e < total);
                if let Some(end) = end {
                    prop_assert_eq!(e, end.min(total - 1));
                }
            }
            Ok(None) => prop_assert!(false, "non-empty object resolved to nothing"),
            Err(_) => prop_assert!(start >= total || end.is_some_and(|end| end < start)),
        }
    }

    #[test]
    fn test_suffix_header_covers_the_tail(total in 1u64..1_000_000, suffix in 1u64..2_000_000) {
        let range = ByteRange::parse_header(&format!("bytes=-{}", suffix), total).unwrap();
        let (start, end) = range.resolve(total).unwrap().unwrap();
        prop_assert_eq!(end, total - 1);
        prop_assert_eq!(end - start + 1, suffix.min(total));
    }

    #[test]
    fn test_explicit_header_round_trips(start in 0u64..100_000, len in 0u64..100_000) {
        let end = start + len;
        let range = ByteRange::parse_header(&format!("bytes={}-{}", start, end), end + 1).unwrap();
        prop_assert_eq!(range, ByteRange::new(start, Some(end)));
    }

    #[test]
    fn test_windows_tile_the_block_span(first in 0u64..10_000, len in 0u64..5_000, window in 1u64..64) {
        let last = first + len;
        let tiles = windows(first, last, window);
        prop_assert_eq!(tiles.first().map(|t| t.0), Some(first));
        prop_assert_eq!(tiles.last().map(|t| t.1), Some(last));
        for (s, e) in &tiles {
            prop_assert!(s <= e);
            prop_assert!(e - s < window);
        }
        for pair in tiles.windows(2) {
            prop_assert_eq!(pair[0].1 + 1, pair[1].0);
        }
    }

    #[test]
    fn test_block_range_contains_both_ends(start in 0u64..1_000_000, len in 0u64..1_000_000, chunk in 1u64..70_000) {
        let end = start + len;
        let (first, last) = block_range(start, end, chunk);
        prop_assert!(first * chunk <= start && start < (first + 1) * chunk);
        prop_assert!(last * chunk <= end && end < (last + 1) * chunk);
    }

    #[test]
    fn test_every_leaf_has_a_valid_proof(count in 1usize..40, pick in any::<prop::sample::Index>()) {
        let leaves: Vec<_> = (0..count).map(|i| hash(i.to_le_bytes())).collect();
        let tree = MerkleTree::new(leaves.clone());
        let root = tree.root_hex();
        let index = pick.index(count);
        let proof = tree.proof(index).unwrap();
        prop_assert!(proof.verify(&leaves[index], &root));

        let stranger = hash(b"not a leaf");
        prop_assert!(!proof.verify(&stranger, &root));
        prop_assert!(tree.proof(count).is_none());
    }

    #[test]
    fn test_column_frontier_matches_full_tree(count in 0usize..300) {
        let leaves: Vec<String> = (0..count).map(|i| hash_hex(i.to_le_bytes())).collect();
        let mut column = ColumnHasher::default();
        for leaf in &leaves {
            column.push(leaf).unwrap();
            prop_assert!(column.is_consistent());
        }
        prop_assert_eq!(column.len(), count as u64);
        prop_assert!(column.frontier.len() <= 9);
        prop_assert_eq!(column.root_hex(), merkle_root_hex(&leaves));
        prop_assert!(serde_json::to_vec(&column).unwrap().len() < 1_000);
    }

    #[test]
    fn test_any_data_shards_rebuild_the_chunk(
        (data, parity) in arb_shards(),
        chunk in proptest::collection::vec(any::<u8>(), 1..2_048),
        drop_seed in any::<u64>(),
    ) {
        let erasure = Erasure::new(data, parity).unwrap();
        let shard_size = erasure.shard_size(chunk.len());
        let shards = erasure.encode(&chunk, shard_size).unwrap();
        prop_assert_eq!(shards.len(), data + parity);

        let mut available: BTreeMap<usize, Vec<u8>> = shards.into_iter().enumerate().collect();
        let mut seed = drop_seed;
        for _ in 0..parity {
            let keys: Vec<usize> = available.keys().copied().collect();
            let victim = keys[(seed as usize) % keys.len()];
            available.remove(&victim);
            seed = seed.rotate_left(7) ^ 0x9e37_79b9_7f4a_7c15;
        }
        let rebuilt = erasure.reconstruct(&available).unwrap();
        prop_assert_eq!(&rebuilt[..chunk.len()], chunk.as_slice());

        if let Some(first) = available.keys().next().copied() {
            available.remove(&first);
            prop_assert!(erasure.reconstruct(&available).is_err());
        }
    }
}
