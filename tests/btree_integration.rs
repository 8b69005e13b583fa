//! # B+Tree Integration Tests
//!
//! End-to-end behaviour of the public tree API on real files:
//! 1. Committed data is visible to later transactions
//! 2. Readers keep their snapshot while a writer commits
//! 3. Splits and merges keep every key reachable and in order
//! 4. Large values round-trip through the overflow file and are reclaimed
//! 5. Aborted and dropped transactions leave no trace

use std::path::Path;

use cowtree::btree::NodeView;
use cowtree::storage::{Storage, StorageConfig};
use cowtree::{BpTree, Lexicographic, TxnState};
use tempfile::tempdir;

fn open_tree(path: &Path, pages: u64) -> BpTree {
    BpTree::builder()
        .path(path)
        .total_pages(pages)
        .cache_capacity(64)
        .open()
        .unwrap()
}

fn key(i: u32) -> [u8; 4] {
    i.to_be_bytes()
}

/// Reads a node of a closed tree file.
fn with_node<R>(path: &Path, page_id: u64, f: impl FnOnce(NodeView<'_>) -> R) -> R {
    let storage = Storage::open(path, StorageConfig::default()).unwrap();
    let page = storage.load(page_id).unwrap();
    f(NodeView::from_page(page.as_slice()).unwrap())
}

mod round_trip {
    use super::*;

    #[test]
    fn committed_value_visible_to_next_reader() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 64);

        let mut txn = tree.begin_write().unwrap();
        txn.put(b"hello", b"world", &Lexicographic).unwrap();
        let sequence = txn.commit().unwrap();

        assert_eq!(sequence, 1);
        let read = tree.begin_read().unwrap();
        assert_eq!(
            read.get(b"hello", &Lexicographic).unwrap(),
            Some(b"world".to_vec())
        );
        assert_eq!(read.get(b"absent", &Lexicographic).unwrap(), None);
    }

    #[test]
    fn sequence_advances_once_per_commit() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 64);

        for i in 0..5u32 {
            let mut txn = tree.begin_write().unwrap();
            txn.put(&key(i), b"v", &Lexicographic).unwrap();
            assert_eq!(txn.commit().unwrap(), i as u64 + 1);
        }

        assert_eq!(tree.sequence(), 5);
    }

    #[test]
    fn empty_key_and_empty_value_are_valid() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 32);

        let mut txn = tree.begin_write().unwrap();
        txn.put(b"", b"", &Lexicographic).unwrap();
        txn.commit().unwrap();

        let read = tree.begin_read().unwrap();
        assert_eq!(read.get(b"", &Lexicographic).unwrap(), Some(Vec::new()));
    }
}

mod isolation {
    use super::*;

    #[test]
    fn reader_keeps_snapshot_across_commit() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 64);
        let mut txn = tree.begin_write().unwrap();
        txn.put(b"k", b"old", &Lexicographic).unwrap();
        txn.commit().unwrap();

        let reader = tree.begin_read().unwrap();
        let mut writer = tree.begin_write().unwrap();
        writer.remove(b"k", None, &Lexicographic).unwrap();
        writer.put(b"k", b"new", &Lexicographic).unwrap();
        writer.put(b"other", b"x", &Lexicographic).unwrap();
        writer.commit().unwrap();

        assert_eq!(
            reader.get(b"k", &Lexicographic).unwrap(),
            Some(b"old".to_vec()),
            "reader SHOULD see the snapshot it started on"
        );
        assert_eq!(reader.get(b"other", &Lexicographic).unwrap(), None);

        let fresh = tree.begin_read().unwrap();
        assert_eq!(fresh.get(b"k", &Lexicographic).unwrap(), Some(b"new".to_vec()));
    }

    #[test]
    fn uncommitted_writes_invisible_to_readers() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 64);

        let mut writer = tree.begin_write().unwrap();
        writer.put(b"pending", b"1", &Lexicographic).unwrap();

        let reader = tree.begin_read().unwrap();
        assert_eq!(reader.get(b"pending", &Lexicographic).unwrap(), None);
        assert_eq!(
            writer.get(b"pending", &Lexicographic).unwrap(),
            Some(b"1".to_vec())
        );
    }

    #[test]
    fn pages_replaced_under_a_reader_are_reclaimed_after_it_ends() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 64);
        let mut txn = tree.begin_write().unwrap();
        txn.put(b"a", b"1", &Lexicographic).unwrap();
        txn.commit().unwrap();
        let free_before = tree.stats().free_pages;

        let reader = tree.begin_read().unwrap();
        let mut txn = tree.begin_write().unwrap();
        txn.put(b"b", b"2", &Lexicographic).unwrap();
        txn.commit().unwrap();

        assert_eq!(tree.stats().pending_reclaim_pages, 1);
        assert_eq!(tree.stats().free_pages, free_before - 1);

        drop(reader);
        assert_eq!(tree.stats().pending_reclaim_pages, 0);
        assert_eq!(tree.stats().free_pages, free_before);
    }
}

mod splits {
    use super::*;

    #[test]
    fn full_leaf_splits_into_two_children() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.cow");
        let tree = open_tree(&path, 64);

        let mut txn = tree.begin_write().unwrap();
        for i in 0..513u32 {
            txn.put(&key(i), &key(i), &Lexicographic).unwrap();
        }
        txn.commit().unwrap();

        let read = tree.begin_read().unwrap();
        let keys: Vec<Vec<u8>> = read
            .scan()
            .unwrap()
            .collect_remaining()
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        let expected: Vec<Vec<u8>> = (0..513u32).map(|i| key(i).to_vec()).collect();
        assert_eq!(keys, expected);
        drop(read);

        let root = tree.root_page_id();
        tree.close().unwrap();
        with_node(&path, root, |node| {
            assert!(node.is_internal(), "root SHOULD be internal after a split");
            assert_eq!(node.num_entries(), 2);
            assert_eq!(node.key(0).unwrap(), b"");
        });
    }

    #[test]
    fn random_order_inserts_read_back_sorted() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 256);
        let count = 5000u32;

        let mut txn = tree.begin_write().unwrap();
        for i in 0..count {
            let k = (i * 761) % count;
            txn.put(&key(k), format!("value-{}", k).as_bytes(), &Lexicographic)
                .unwrap();
        }
        txn.commit().unwrap();

        let read = tree.begin_read().unwrap();
        let mut cursor = read.scan().unwrap();
        let mut last: Option<Vec<u8>> = None;
        let mut seen = 0;
        while cursor.valid() {
            let k = cursor.key().unwrap().to_vec();
            if let Some(prev) = &last {
                assert!(prev <= &k, "keys SHOULD come back in order");
            }
            last = Some(k);
            seen += 1;
            cursor.advance().unwrap();
        }
        assert_eq!(seen, count);
        assert_eq!(
            read.get(&key(4321), &Lexicographic).unwrap(),
            Some(b"value-4321".to_vec())
        );
    }

    #[test]
    fn duplicates_spanning_leaves_keep_insertion_order() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 64);

        let mut txn = tree.begin_write().unwrap();
        txn.put(b"a", b"before", &Lexicographic).unwrap();
        for i in 0..1200u32 {
            txn.put(b"dup", &key(i), &Lexicographic).unwrap();
        }
        txn.put(b"z", b"after", &Lexicographic).unwrap();
        txn.commit().unwrap();

        let read = tree.begin_read().unwrap();
        let values = read.get_all(b"dup", &Lexicographic).unwrap();
        let expected: Vec<Vec<u8>> = (0..1200u32).map(|i| key(i).to_vec()).collect();
        assert_eq!(values, expected);
        assert_eq!(read.get(b"dup", &Lexicographic).unwrap(), Some(key(0).to_vec()));
    }

    #[test]
    fn large_keys_split_by_bytes() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 128);

        let mut txn = tree.begin_write().unwrap();
        for i in 0..200u32 {
            let mut k = vec![b'k'; 1000];
            k[..4].copy_from_slice(&key(i));
            txn.put(&k, &[0u8; 1000], &Lexicographic).unwrap();
        }
        txn.commit().unwrap();

        let read = tree.begin_read().unwrap();
        assert_eq!(read.scan().unwrap().collect_remaining().unwrap().len(), 200);
    }
}

mod removal {
    use super::*;

    #[test]
    fn remove_everything_returns_all_pages() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 256);
        let initial_free = tree.stats().free_pages;

        let mut txn = tree.begin_write().unwrap();
        for i in 0..3000u32 {
            txn.put(&key(i), &[3u8; 24], &Lexicographic).unwrap();
        }
        txn.commit().unwrap();
        assert!(tree.stats().free_pages < initial_free - 2);

        let mut txn = tree.begin_write().unwrap();
        for i in (0..3000u32).filter(|i| i % 2 == 1) {
            assert!(txn.remove(&key(i), None, &Lexicographic).unwrap());
        }
        for i in (0..3000u32).step_by(500) {
            assert!(txn.get(&key(i), &Lexicographic).unwrap().is_some());
            assert!(txn.get(&key(i + 1), &Lexicographic).unwrap().is_none());
        }
        txn.commit().unwrap();

        let mut txn = tree.begin_write().unwrap();
        for i in (0..3000u32).filter(|i| i % 2 == 0) {
            assert!(txn.remove(&key(i), None, &Lexicographic).unwrap());
        }
        txn.commit().unwrap();

        let read = tree.begin_read().unwrap();
        assert!(!read.scan().unwrap().valid());
        drop(read);
        assert_eq!(
            tree.stats().free_pages,
            initial_free,
            "an empty tree SHOULD hold only its root leaf"
        );
    }

    #[test]
    fn remove_missing_key_is_a_no_op() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 32);
        let mut txn = tree.begin_write().unwrap();
        txn.put(b"a", b"1", &Lexicographic).unwrap();
        txn.commit().unwrap();

        let mut txn = tree.begin_write().unwrap();
        assert!(!txn.remove(b"b", None, &Lexicographic).unwrap());
        assert_eq!(txn.shadow_count(), 0);
        assert_eq!(txn.commit().unwrap(), 1, "nothing changed, no new sequence");
    }

    #[test]
    fn remove_from_the_middle_keeps_neighbours() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 128);
        let mut txn = tree.begin_write().unwrap();
        for i in 0..2000u32 {
            txn.put(&key(i), &key(i), &Lexicographic).unwrap();
        }
        for i in 500..1500u32 {
            txn.remove(&key(i), None, &Lexicographic).unwrap();
        }
        txn.commit().unwrap();

        let read = tree.begin_read().unwrap();
        let mut cursor = read.seek(&key(400), &Lexicographic).unwrap();
        let mut keys = Vec::new();
        for _ in 0..200 {
            keys.push(cursor.key().unwrap().to_vec());
            cursor.advance().unwrap();
        }
        assert_eq!(keys[99], key(499).to_vec());
        assert_eq!(keys[100], key(1500).to_vec());
    }
}

mod overflow {
    use super::*;

    fn big(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn large_values_round_trip() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 64);
        let value = big(1, 200_000);

        let mut txn = tree.begin_write().unwrap();
        txn.put(b"blob", &value, &Lexicographic).unwrap();
        txn.put(b"small", b"x", &Lexicographic).unwrap();
        txn.commit().unwrap();

        let read = tree.begin_read().unwrap();
        assert_eq!(read.get(b"blob", &Lexicographic).unwrap(), Some(value));
        assert_eq!(tree.stats().overflow_tail, 200_000);
        assert!(dir.path().join("t.cow.ovf").exists());
    }

    #[test]
    fn removed_ranges_are_reused() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 64);

        let mut txn = tree.begin_write().unwrap();
        txn.put(b"a", &big(1, 50_000), &Lexicographic).unwrap();
        txn.put(b"b", &big(2, 50_000), &Lexicographic).unwrap();
        txn.put(b"c", &big(3, 50_000), &Lexicographic).unwrap();
        txn.commit().unwrap();

        let mut txn = tree.begin_write().unwrap();
        assert!(txn.remove(b"b", None, &Lexicographic).unwrap());
        txn.commit().unwrap();
        assert_eq!(tree.stats().overflow_free_bytes, 50_000);

        let mut txn = tree.begin_write().unwrap();
        txn.put(b"d", &big(4, 30_000), &Lexicographic).unwrap();
        txn.commit().unwrap();

        let stats = tree.stats();
        assert_eq!(stats.overflow_tail, 150_000);
        assert_eq!(stats.overflow_free_bytes, 20_000);
        let read = tree.begin_read().unwrap();
        assert_eq!(read.get(b"c", &Lexicographic).unwrap(), Some(big(3, 50_000)));
        assert_eq!(read.get(b"d", &Lexicographic).unwrap(), Some(big(4, 30_000)));
    }

    #[test]
    fn remove_by_value_matches_overflow_contents() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 64);
        let first = big(5, 4000);
        let second = big(6, 4000);

        let mut txn = tree.begin_write().unwrap();
        txn.put(b"k", &first, &Lexicographic).unwrap();
        txn.put(b"k", &second, &Lexicographic).unwrap();
        assert!(txn.remove(b"k", Some(&second), &Lexicographic).unwrap());
        txn.commit().unwrap();

        let read = tree.begin_read().unwrap();
        assert_eq!(read.get_all(b"k", &Lexicographic).unwrap(), vec![first]);
    }
}

mod abort {
    use super::*;

    #[test]
    fn abort_discards_writes_and_allocations() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 64);
        let before = tree.stats();

        let mut txn = tree.begin_write().unwrap();
        for i in 0..800u32 {
            txn.put(&key(i), &[0u8; 8], &Lexicographic).unwrap();
        }
        txn.put(b"blob", &vec![1u8; 10_000], &Lexicographic).unwrap();
        assert_eq!(txn.state(), TxnState::Active);
        txn.abort();

        let after = tree.stats();
        assert_eq!(after.free_pages, before.free_pages);
        assert_eq!(after.overflow_tail, 0);
        assert_eq!(after.sequence, before.sequence);
        assert_eq!(after.active_snapshots, 0);

        let read = tree.begin_read().unwrap();
        assert_eq!(read.get(&key(1), &Lexicographic).unwrap(), None);
    }

    #[test]
    fn dropped_writer_releases_lock() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 32);

        {
            let mut txn = tree.begin_write().unwrap();
            txn.put(b"a", b"1", &Lexicographic).unwrap();
        }

        let mut txn = tree.begin_write().unwrap();
        assert_eq!(txn.get(b"a", &Lexicographic).unwrap(), None);
        txn.put(b"b", b"2", &Lexicographic).unwrap();
        assert_eq!(txn.commit().unwrap(), 1);
    }

    #[test]
    fn read_transaction_commit_is_a_no_op() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 32);

        let read = tree.begin_read().unwrap();
        assert_eq!(read.commit().unwrap(), 0);
        assert_eq!(tree.stats().active_snapshots, 0);
    }
}

mod exhaustion {
    use super::*;

    #[test]
    fn running_out_of_pages_fails_and_leaves_tree_intact() {
        let dir = tempdir().unwrap();
        let tree = open_tree(&dir.path().join("t.cow"), 8);
        let mut txn = tree.begin_write().unwrap();
        txn.put(b"keep", b"me", &Lexicographic).unwrap();
        txn.commit().unwrap();

        let mut txn = tree.begin_write().unwrap();
        let mut failed = false;
        for i in 0..100_000u32 {
            if let Err(e) = txn.put(&key(i), &[0u8; 500], &Lexicographic) {
                assert!(e.to_string().contains("exhausted"), "unexpected error: {}", e);
                failed = true;
                break;
            }
        }
        assert!(failed, "an 8-page file SHOULD run out of pages");
        txn.abort();

        let read = tree.begin_read().unwrap();
        assert_eq!(read.get(b"keep", &Lexicographic).unwrap(), Some(b"me".to_vec()));
    }

    fn wide_key(i: u32) -> Vec<u8> {
        let mut k = vec![b'w'; 996];
        k.extend_from_slice(&((i * 7919) % 100_000).to_be_bytes());
        k
    }

    #[test]
    fn failed_put_keeps_every_acknowledged_key() {
        for pages in [20u64, 22, 23, 32, 41, 50, 77, 113] {
            let dir = tempdir().unwrap();
            let tree = open_tree(&dir.path().join("t.cow"), pages);

            let mut txn = tree.begin_write().unwrap();
            let mut stored = Vec::new();
            for i in 0..10_000u32 {
                let k = wide_key(i);
                let shadows = txn.shadow_count();
                let free = tree.stats().free_pages;
                match txn.put(&k, b"v", &Lexicographic) {
                    Ok(()) => stored.push(k),
                    Err(e) => {
                        assert!(e.to_string().contains("exhausted"), "unexpected error: {}", e);
                        assert_eq!(txn.state(), TxnState::Active);
                        assert_eq!(txn.shadow_count(), shadows);
                        assert_eq!(
                            tree.stats().free_pages,
                            free,
                            "a failed put SHOULD NOT hold pages (pages={})",
                            pages
                        );
                        break;
                    }
                }
            }
            assert!(stored.len() < 10_000, "pages={} SHOULD run out", pages);
            txn.commit().unwrap();

            let read = tree.begin_read().unwrap();
            let scanned = read.scan().unwrap().collect_remaining().unwrap();
            assert_eq!(
                scanned.len(),
                stored.len(),
                "every acknowledged put SHOULD survive the commit (pages={})",
                pages
            );
            for k in &stored {
                assert_eq!(
                    read.get(k, &Lexicographic).unwrap(),
                    Some(b"v".to_vec()),
                    "pages={}",
                    pages
                );
            }
        }
    }
}
