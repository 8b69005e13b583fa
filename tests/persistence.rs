//! # Persistence and Recovery Tests
//!
//! A tree file is only ever changed by publishing a new super-block slot.
//! These tests reopen files after clean closes, dropped handles and a torn
//! super-block slot, and check that the last intact commit is what comes
//! back.

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use cowtree::config::SUPERBLOCK_SLOT_SIZE;
use cowtree::{BpTree, Lexicographic};
use tempfile::tempdir;

fn open_tree(path: &Path, pages: u64) -> BpTree {
    BpTree::builder()
        .path(path)
        .total_pages(pages)
        .cache_capacity(32)
        .open()
        .unwrap()
}

fn key(i: u32) -> [u8; 4] {
    i.to_be_bytes()
}

#[test]
fn committed_data_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.cow");

    {
        let tree = open_tree(&path, 128);
        let mut txn = tree.begin_write().unwrap();
        for i in 0..2000u32 {
            txn.put(&key(i), format!("v{}", i).as_bytes(), &Lexicographic)
                .unwrap();
        }
        txn.put(b"blob", &vec![9u8; 40_000], &Lexicographic).unwrap();
        txn.commit().unwrap();
        tree.close().unwrap();
    }

    let tree = BpTree::open(&path).unwrap();
    assert_eq!(tree.sequence(), 1);
    assert_eq!(tree.stats().total_pages, 128);
    let read = tree.begin_read().unwrap();
    for i in (0..2000u32).step_by(37) {
        assert_eq!(
            read.get(&key(i), &Lexicographic).unwrap(),
            Some(format!("v{}", i).into_bytes())
        );
    }
    assert_eq!(
        read.get(b"blob", &Lexicographic).unwrap(),
        Some(vec![9u8; 40_000])
    );
}

#[test]
fn free_page_count_matches_after_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.cow");
    let free;

    {
        let tree = open_tree(&path, 128);
        let mut txn = tree.begin_write().unwrap();
        for i in 0..1500u32 {
            txn.put(&key(i), &[1u8; 16], &Lexicographic).unwrap();
        }
        txn.commit().unwrap();
        free = tree.stats().free_pages;
        tree.close().unwrap();
    }

    let tree = open_tree(&path, 128);
    assert_eq!(tree.stats().free_pages, free);
}

#[test]
fn uncommitted_writes_are_lost_on_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.cow");

    {
        let tree = open_tree(&path, 64);
        let mut txn = tree.begin_write().unwrap();
        txn.put(b"kept", b"1", &Lexicographic).unwrap();
        txn.commit().unwrap();

        let mut txn = tree.begin_write().unwrap();
        txn.put(b"lost", b"2", &Lexicographic).unwrap();
        drop(txn);
        drop(tree);
    }

    let tree = open_tree(&path, 64);
    let read = tree.begin_read().unwrap();
    assert_eq!(read.get(b"kept", &Lexicographic).unwrap(), Some(b"1".to_vec()));
    assert_eq!(read.get(b"lost", &Lexicographic).unwrap(), None);
}

#[test]
fn pages_retired_under_a_reader_are_released_on_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.cow");
    let free_without_reader;

    {
        let tree = open_tree(&path, 64);
        let mut txn = tree.begin_write().unwrap();
        txn.put(b"a", b"1", &Lexicographic).unwrap();
        txn.commit().unwrap();

        let reader = tree.begin_read().unwrap();
        let mut txn = tree.begin_write().unwrap();
        txn.put(b"b", b"2", &Lexicographic).unwrap();
        txn.commit().unwrap();
        assert!(tree.stats().pending_reclaim_pages > 0);

        drop(reader);
        free_without_reader = tree.stats().free_pages;
        // Drop without close: the persisted bitmap still marks the retired
        // page as used.
        drop(tree);
    }

    let tree = open_tree(&path, 64);
    assert_eq!(tree.stats().free_pages, free_without_reader);
}

#[test]
fn torn_newest_slot_falls_back_to_previous_commit() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.cow");

    {
        let tree = open_tree(&path, 64);
        let mut txn = tree.begin_write().unwrap();
        txn.put(b"first", b"1", &Lexicographic).unwrap();
        assert_eq!(txn.commit().unwrap(), 1);

        let mut txn = tree.begin_write().unwrap();
        txn.put(b"second", b"2", &Lexicographic).unwrap();
        assert_eq!(txn.commit().unwrap(), 2);
        tree.close().unwrap();
    }

    // Sequence 2 lives in slot 0. Flip a byte inside its checksummed body.
    {
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let mut byte = [0u8; 1];
        let offset = (SUPERBLOCK_SLOT_SIZE / 2) as u64 + 8;
        file.read_exact_at(&mut byte, offset).unwrap();
        byte[0] ^= 0xFF;
        file.write_all_at(&byte, offset).unwrap();
        file.sync_all().unwrap();
    }

    let tree = open_tree(&path, 64);
    assert_eq!(tree.sequence(), 1, "recovery SHOULD pick the intact slot");
    let read = tree.begin_read().unwrap();
    assert_eq!(read.get(b"first", &Lexicographic).unwrap(), Some(b"1".to_vec()));
    assert_eq!(read.get(b"second", &Lexicographic).unwrap(), None);
    drop(read);

    let mut txn = tree.begin_write().unwrap();
    txn.put(b"third", b"3", &Lexicographic).unwrap();
    assert_eq!(txn.commit().unwrap(), 2);
}

#[test]
fn file_with_both_slots_torn_fails_to_open() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.cow");
    open_tree(&path, 32).close().unwrap();

    {
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all_at(&vec![0xAA; SUPERBLOCK_SLOT_SIZE * 2], 0)
            .unwrap();
    }

    let err = BpTree::open(&path).unwrap_err();
    assert!(
        format!("{:#}", err).contains("super-block"),
        "unexpected error: {:#}",
        err
    );
}

#[test]
fn overflow_free_list_is_rebuilt_from_live_values() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.cow");

    {
        let tree = open_tree(&path, 64);
        let mut txn = tree.begin_write().unwrap();
        txn.put(b"a", &vec![1u8; 10_000], &Lexicographic).unwrap();
        txn.put(b"b", &vec![2u8; 10_000], &Lexicographic).unwrap();
        txn.put(b"c", &vec![3u8; 10_000], &Lexicographic).unwrap();
        txn.commit().unwrap();

        let mut txn = tree.begin_write().unwrap();
        txn.remove(b"b", None, &Lexicographic).unwrap();
        txn.commit().unwrap();
        tree.close().unwrap();
    }

    let tree = open_tree(&path, 64);
    let stats = tree.stats();
    assert_eq!(stats.overflow_tail, 30_000);
    assert_eq!(stats.overflow_free_bytes, 10_000);

    let read = tree.begin_read().unwrap();
    assert_eq!(
        read.get(b"c", &Lexicographic).unwrap(),
        Some(vec![3u8; 10_000])
    );
}
