use criterion::{Criterion, black_box, criterion_group, criterion_main};
use mvolt::{MvoltConfig, MvoltInstance};
use tempfile::tempdir;

const SEEDED_KEYS: u32 = 10_000;

fn setup_db(ssn: bool) -> (tempfile::TempDir, MvoltInstance) {
    let dir = tempdir().expect("temp");
    let mut config = if ssn {
        MvoltConfig::serializable(dir.path())
    } else {
        MvoltConfig {
            log_dir: dir.path().to_path_buf(),
            ..MvoltConfig::default()
        }
    };
    config.log_segment_bytes = 256 * 1024 * 1024;
    let db = MvoltInstance::open(config).expect("open");
    for i in 0..SEEDED_KEYS {
        db.put(format!("key{i:06}").as_bytes(), &i.to_be_bytes())
            .expect("seed");
    }
    (dir, db)
}

fn bench_point_reads(c: &mut Criterion) {
    let (_dir, db) = setup_db(false);
    let mut i = 0u32;
    c.bench_function("si_point_read", |b| {
        b.iter(|| {
            let key = format!("key{:06}", i % SEEDED_KEYS);
            i = i.wrapping_add(7919);
            black_box(db.get(key.as_bytes()).expect("get"));
        })
    });
}

fn bench_updates(c: &mut Criterion) {
    let (_dir, db) = setup_db(false);
    let mut i = 0u32;
    c.bench_function("si_update_commit", |b| {
        b.iter(|| {
            let key = format!("key{:06}", i % SEEDED_KEYS);
            i = i.wrapping_add(104_729);
            db.put(key.as_bytes(), &i.to_be_bytes()).expect("put");
        })
    });
}

fn bench_ssn_read_then_update(c: &mut Criterion) {
    let (_dir, db) = setup_db(true);
    let mut i = 0u32;
    c.bench_function("ssn_read_modify_write", |b| {
        b.iter(|| {
            let read_key = format!("key{:06}", i % SEEDED_KEYS);
            let write_key = format!("key{:06}", (i + 1) % SEEDED_KEYS);
            i = i.wrapping_add(31);
            let mut tx = db.begin().expect("begin");
            black_box(tx.read(read_key.as_bytes()).expect("read"));
            tx.update(write_key.as_bytes(), &i.to_be_bytes())
                .expect("update");
            tx.commit().expect("commit");
        })
    });
}

fn bench_read_only_commit(c: &mut Criterion) {
    let (_dir, db) = setup_db(true);
    c.bench_function("ssn_read_only_txn", |b| {
        b.iter(|| {
            let mut tx = db.begin().expect("begin");
            black_box(tx.read(b"key000042").expect("read"));
            tx.commit().expect("commit");
        })
    });
}

criterion_group!(
    benches,
    bench_point_reads,
    bench_updates,
    bench_ssn_read_then_update,
    bench_read_only_commit
);
criterion_main!(benches);
