//! Serializability scenarios with the serial safety net enabled.

use mvolt::{AbortReason, MvoltConfig, MvoltInstance};
use tempfile::tempdir;

fn open_serializable(dir: &std::path::Path) -> MvoltInstance {
    MvoltInstance::open(MvoltConfig::serializable(dir)).expect("open instance")
}

#[test]
fn write_skew_is_rejected() {
    let dir = tempdir().expect("tempdir");
    let db = open_serializable(dir.path());
    db.put(b"a", b"1").expect("seed a");
    db.put(b"b", b"1").expect("seed b");

    let mut t1 = db.begin().expect("t1");
    let mut t2 = db.begin().expect("t2");
    assert!(t1.read(b"b").expect("read").is_some());
    assert!(t2.read(b"a").expect("read").is_some());
    assert!(t1.update(b"a", b"0").expect("t1 writes a"));
    assert!(t2.update(b"b", b"0").expect("t2 writes b"));

    t1.commit().expect("first committer wins");
    let err = t2.commit().expect_err("second committer is the pivot");
    assert_eq!(err.abort_reason(), Some(AbortReason::SsnExclusionFailure));

    // State remains the serializable outcome of t1 alone.
    assert_eq!(db.get(b"a").expect("get"), Some(b"0".to_vec()));
    assert_eq!(db.get(b"b").expect("get"), Some(b"1".to_vec()));
    db.shutdown();
}

#[test]
fn plain_anti_dependency_still_commits() {
    let dir = tempdir().expect("tempdir");
    let db = open_serializable(dir.path());
    db.put(b"x", b"old").expect("seed");

    let mut reader = db.begin().expect("reader");
    assert_eq!(reader.read(b"x").expect("read"), Some(b"old".to_vec()));

    // An overwriter commits between the read and the reader's commit.
    db.put(b"x", b"new").expect("overwrite");

    // reader -> overwriter is the only edge; the exclusion window holds.
    reader.commit().expect("reader commits");
    db.shutdown();
}

#[test]
fn retried_pivot_succeeds() {
    let dir = tempdir().expect("tempdir");
    let db = open_serializable(dir.path());
    db.put(b"a", b"1").expect("seed a");
    db.put(b"b", b"1").expect("seed b");

    let mut t1 = db.begin().expect("t1");
    let mut t2 = db.begin().expect("t2");
    assert!(t1.read(b"b").expect("read").is_some());
    assert!(t2.read(b"a").expect("read").is_some());
    assert!(t1.update(b"a", b"10").expect("t1 writes"));
    assert!(t2.update(b"b", b"20").expect("t2 writes"));
    t1.commit().expect("t1");
    assert!(t2.commit().is_err(), "pivot aborts");

    // Re-running the aborted transaction on the new snapshot is clean.
    let mut retry = db.begin().expect("retry");
    assert_eq!(retry.read(b"a").expect("read"), Some(b"10".to_vec()));
    assert!(retry.update(b"b", b"20").expect("update"));
    retry.commit().expect("retry commits");

    assert_eq!(db.get(b"b").expect("get"), Some(b"20".to_vec()));
    db.shutdown();
}

#[test]
fn read_only_transactions_never_fail_certification() {
    let dir = tempdir().expect("tempdir");
    let db = open_serializable(dir.path());
    db.put(b"k", b"1").expect("seed");

    let mut snap = db.begin().expect("snap");
    assert_eq!(snap.read(b"k").expect("read"), Some(b"1".to_vec()));
    for i in 0..10u8 {
        db.put(b"k", &[i]).expect("churn");
    }
    snap.commit().expect("read-only commit");
    db.shutdown();
}

#[test]
fn serializable_history_over_disjoint_keys_is_untouched() {
    let dir = tempdir().expect("tempdir");
    let db = open_serializable(dir.path());
    db.put(b"p", b"1").expect("seed p");
    db.put(b"q", b"1").expect("seed q");

    let mut t1 = db.begin().expect("t1");
    let mut t2 = db.begin().expect("t2");
    assert!(t1.update(b"p", b"2").expect("t1 writes p"));
    assert!(t2.update(b"q", b"2").expect("t2 writes q"));
    t1.commit().expect("t1");
    t2.commit().expect("t2");
    assert_eq!(db.get(b"p").expect("get"), Some(b"2".to_vec()));
    assert_eq!(db.get(b"q").expect("get"), Some(b"2".to_vec()));
    db.shutdown();
}
