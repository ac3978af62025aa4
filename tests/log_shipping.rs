//! Primary/backup log shipping over loopback TCP.

use mvolt::{MvoltConfig, MvoltInstance, PersistPolicy, ReplayPolicy, Role};
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const WAIT: Duration = Duration::from_secs(10);

fn primary_config(dir: &std::path::Path) -> MvoltConfig {
    MvoltConfig {
        log_dir: dir.to_path_buf(),
        primary_listen_addr: Some("127.0.0.1:0".to_string()),
        ..MvoltConfig::default()
    }
}

fn backup_config(dir: &std::path::Path, primary: &MvoltInstance) -> MvoltConfig {
    let addr = primary.primary_local_addr().expect("primary addr");
    MvoltConfig {
        role: Role::Backup,
        log_dir: dir.to_path_buf(),
        primary_addr: Some(addr.to_string()),
        ..MvoltConfig::default()
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn sync_replay_acks_only_after_persist_and_replay() {
    let pdir = tempdir().expect("pdir");
    let bdir = tempdir().expect("bdir");
    let primary = MvoltInstance::open(primary_config(pdir.path())).expect("primary");

    // Data committed and flushed before the backup joins travels in the
    // startup handshake.
    primary.put(b"boot", b"strap").expect("seed");
    primary.flush().expect("flush");

    let backup = MvoltInstance::open(backup_config(bdir.path(), &primary)).expect("backup");
    assert!(wait_for(|| primary.connected_backups() == 1));
    assert_eq!(backup.get(b"boot").expect("get"), Some(b"strap".to_vec()));

    // Data committed afterwards travels as shipped windows.
    primary.put(b"k", b"v2").expect("put");
    let shipped = primary.ship_committed().expect("ship");

    // Under sync persistence + sync replay the ack already implies both.
    let persisted = backup
        .control()
        .persisted_lsn_offset
        .load(Ordering::Acquire);
    assert!(
        persisted >= shipped,
        "ack returned before persistence: {persisted} < {shipped}"
    );
    let replayed = backup.control().replayed_lsn_offset.load(Ordering::Acquire);
    assert!(replayed >= shipped, "sync replay lagged the ack");

    assert_eq!(backup.get(b"k").expect("get"), Some(b"v2".to_vec()));

    backup.shutdown();
    primary.shutdown();
}

#[test]
fn pipelined_replay_catches_up_after_the_ack() {
    let pdir = tempdir().expect("pdir");
    let bdir = tempdir().expect("bdir");
    let primary = MvoltInstance::open(primary_config(pdir.path())).expect("primary");
    let backup = MvoltInstance::open(MvoltConfig {
        replay_policy: ReplayPolicy::Pipelined,
        ..backup_config(bdir.path(), &primary)
    })
    .expect("backup");
    assert!(wait_for(|| primary.connected_backups() == 1));

    for i in 0..20u32 {
        primary
            .put(format!("key{i}").as_bytes(), &i.to_be_bytes())
            .expect("put");
    }
    let shipped = primary.ship_committed().expect("ship");
    assert!(
        backup.wait_backup_replayed(shipped, WAIT),
        "pipelined redo never drained"
    );
    for i in (0..20u32).step_by(7) {
        let raw = backup
            .get(format!("key{i}").as_bytes())
            .expect("get")
            .expect("present");
        assert_eq!(u32::from_be_bytes(raw.as_slice().try_into().expect("u32")), i);
    }

    backup.shutdown();
    primary.shutdown();
}

#[test]
fn background_replay_drives_redo_from_the_bounds_file() {
    let pdir = tempdir().expect("pdir");
    let bdir = tempdir().expect("bdir");
    let primary = MvoltInstance::open(primary_config(pdir.path())).expect("primary");
    let backup = MvoltInstance::open(MvoltConfig {
        replay_policy: ReplayPolicy::Background,
        ..backup_config(bdir.path(), &primary)
    })
    .expect("backup");
    assert!(wait_for(|| primary.connected_backups() == 1));

    primary.put(b"bg", b"one").expect("put");
    let first = primary.ship_committed().expect("ship");
    primary.put(b"bg", b"two").expect("put");
    let second = primary.ship_committed().expect("ship");
    assert!(second > first);

    assert!(
        backup.wait_backup_replayed(second, WAIT),
        "background replayer never consumed the bounds"
    );
    assert_eq!(backup.get(b"bg").expect("get"), Some(b"two".to_vec()));
    assert!(bdir.path().join("replay_bounds").exists());

    backup.shutdown();
    primary.shutdown();
}

#[test]
fn async_persistence_ships_without_waiting() {
    let pdir = tempdir().expect("pdir");
    let bdir = tempdir().expect("bdir");
    let primary = MvoltInstance::open(MvoltConfig {
        persist_policy: PersistPolicy::Async,
        group_commit_bytes: 256,
        ..primary_config(pdir.path())
    })
    .expect("primary");
    let backup = MvoltInstance::open(MvoltConfig {
        persist_policy: PersistPolicy::Async,
        replay_policy: ReplayPolicy::Background,
        group_commit_bytes: 256,
        ..backup_config(bdir.path(), &primary)
    })
    .expect("backup");
    assert!(wait_for(|| primary.connected_backups() == 1));

    for i in 0..10u32 {
        primary
            .put(format!("a{i}").as_bytes(), &[i as u8; 64])
            .expect("put");
    }
    let committed = primary.log().committed_offset();
    // No explicit ship call: the shipping daemon drains the durable log.
    assert!(
        wait_for(|| backup.control().replayed_lsn_offset.load(Ordering::Acquire) >= committed),
        "async pipeline never replayed the workload"
    );
    assert_eq!(
        backup.get(b"a9").expect("get"),
        Some(vec![9u8; 64]),
        "latest write visible on the backup"
    );

    backup.shutdown();
    primary.shutdown();
}

#[test]
fn nvram_persist_on_replay_acks_through_redo() {
    let pdir = tempdir().expect("pdir");
    let bdir = tempdir().expect("bdir");
    let primary = MvoltInstance::open(MvoltConfig {
        persist_policy: PersistPolicy::Nvram,
        ..primary_config(pdir.path())
    })
    .expect("primary");
    let backup = MvoltInstance::open(MvoltConfig {
        persist_policy: PersistPolicy::Nvram,
        nvram_log_buffer: true,
        persist_nvram_on_replay: true,
        replay_policy: ReplayPolicy::Sync,
        ..backup_config(bdir.path(), &primary)
    })
    .expect("backup");
    assert!(wait_for(|| primary.connected_backups() == 1));

    primary.put(b"nv", b"ram").expect("put");
    let shipped = primary.ship_committed().expect("ship");
    assert!(
        wait_for(|| backup.control().persisted_nvram_offset.load(Ordering::Acquire) >= shipped),
        "nvram horizon never advanced"
    );
    assert_eq!(backup.get(b"nv").expect("get"), Some(b"ram".to_vec()));

    backup.shutdown();
    primary.shutdown();
}

#[test]
fn checkpointed_primary_bootstraps_a_backup_from_the_checkpoint() {
    let pdir = tempdir().expect("pdir");
    let bdir = tempdir().expect("bdir");
    let primary = MvoltInstance::open(MvoltConfig {
        enable_chkpt: true,
        ..primary_config(pdir.path())
    })
    .expect("primary");

    for i in 0..8u32 {
        primary
            .put(format!("c{i}").as_bytes(), &i.to_be_bytes())
            .expect("put");
    }
    let info = primary.checkpoint().expect("checkpoint");
    assert!(info.size > 0);
    // Post-checkpoint traffic rides the segment tails.
    primary.put(b"after", b"chkpt").expect("put");
    primary.flush().expect("flush");

    let backup = MvoltInstance::open(backup_config(bdir.path(), &primary)).expect("backup");
    assert!(wait_for(|| primary.connected_backups() == 1));
    assert_eq!(backup.get(b"c3").expect("get"), Some(3u32.to_be_bytes().to_vec()));
    assert_eq!(backup.get(b"after").expect("get"), Some(b"chkpt".to_vec()));

    // And live windows still apply on top.
    primary.put(b"after", b"window").expect("put");
    let shipped = primary.ship_committed().expect("ship");
    assert!(backup.wait_backup_replayed(shipped, WAIT));
    assert_eq!(backup.get(b"after").expect("get"), Some(b"window".to_vec()));

    backup.shutdown();
    primary.shutdown();
}
