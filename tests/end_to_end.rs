//! # End-to-End Scenario
//!
//! A small tree file goes through commit, an aborted remove and a final
//! read: the abort must not have applied.

use cowtree::{BpTree, Lexicographic, TxnState};
use tempfile::tempdir;

#[test]
fn aborted_remove_leaves_committed_value() {
    let dir = tempdir().unwrap();
    let tree = BpTree::builder()
        .path(dir.path().join("e2e.cow"))
        .total_pages(128)
        .open()
        .unwrap();

    let mut txn = tree.begin_write().unwrap();
    txn.put(b"a", &1u64.to_le_bytes(), &Lexicographic).unwrap();
    txn.put(b"b", &2u64.to_le_bytes(), &Lexicographic).unwrap();
    assert_eq!(txn.commit().unwrap(), 1);

    let mut txn = tree.begin_write().unwrap();
    assert!(txn.remove(b"a", None, &Lexicographic).unwrap());
    assert_eq!(txn.get(b"a", &Lexicographic).unwrap(), None);
    assert_eq!(txn.state(), TxnState::Active);
    txn.abort();

    let txn = tree.begin_read().unwrap();
    assert_eq!(
        txn.get(b"a", &Lexicographic).unwrap(),
        Some(1u64.to_le_bytes().to_vec()),
        "abort SHOULD NOT have applied the remove"
    );
    assert_eq!(
        txn.get(b"b", &Lexicographic).unwrap(),
        Some(2u64.to_le_bytes().to_vec())
    );
    assert_eq!(txn.sequence(), 1);
    drop(txn);

    let stats = tree.stats();
    assert_eq!(stats.sequence, 1);
    assert_eq!(stats.free_pages, 128 - 3);
    tree.close().unwrap();
}
