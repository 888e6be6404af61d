//! Integration tests for the database lifecycle.
//!
//! These tests exercise the full flow from definition through create,
//! update, fetch, close and reopen, against real files on every
//! file-backed storage backend.

use rrdb::error::{FormatError, RrdError, ValidationError};
use rrdb::{
    ArcDef, BackendKind, ConsolFun, DbOptions, DsDef, DsType, LockMode, RrdDatabase, RrdDef,
};
use std::path::Path;
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

/// Aligned to every step used below.
const T0: u64 = 920_805_000;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn options(backend: BackendKind) -> DbOptions {
    DbOptions {
        backend,
        lock_mode: LockMode::Disabled,
    }
}

/// One gauge, one counter, averages at two resolutions plus a max archive.
fn traffic_def(path: &Path) -> RrdDef {
    let mut def = RrdDef::new(path, 300);
    def.set_start_time(T0 - 300);
    def.add_datasource(DsDef::new("temp", DsType::Gauge, 600, Some(-40.0), Some(60.0)).unwrap());
    def.add_datasource(DsDef::new("bytes", DsType::Counter, 600, Some(0.0), None).unwrap());
    def.add_archive(ArcDef::new(ConsolFun::Average, 0.5, 1, 12).unwrap());
    def.add_archive(ArcDef::new(ConsolFun::Average, 0.5, 12, 24).unwrap());
    def.add_archive(ArcDef::new(ConsolFun::Max, 0.5, 6, 10).unwrap());
    def
}

/// Feeds one update every step: temp is `i`, bytes grow 3000 per step.
fn feed(db: &RrdDatabase, count: u64) {
    for i in 0..count {
        #[allow(clippy::cast_precision_loss)]
        let values = [i as f64, (i * 3000) as f64];
        db.update(T0 + i * 300, &values).unwrap();
    }
}

#[test]
fn test_equal_definitions_produce_identical_files() {
    init_tracing();
    let dir = tempdir().unwrap();
    let file_path = dir.path().join("file.rrd");
    let mmap_path = dir.path().join("mmap.rrd");

    let by_file = RrdDatabase::create_with(&traffic_def(&file_path), options(BackendKind::File)).unwrap();
    let by_mmap = RrdDatabase::create_with(&traffic_def(&mmap_path), options(BackendKind::Mmap)).unwrap();
    feed(&by_file, 30);
    feed(&by_mmap, 30);
    by_file.close().unwrap();
    by_mmap.close().unwrap();

    let file_bytes = std::fs::read(&file_path).unwrap();
    let mmap_bytes = std::fs::read(&mmap_path).unwrap();
    assert_eq!(file_bytes, mmap_bytes);
    assert_eq!(
        file_bytes.len() as u64,
        traffic_def(&file_path).estimated_size().unwrap()
    );
    assert!(file_bytes.starts_with(b"RRDB, version 0.1"));
}

#[test]
fn test_reopen_sees_the_same_database() {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("traffic.rrd");
    let def = traffic_def(&path);

    let (before, dump_before) = {
        let db = RrdDatabase::create(&def).unwrap();
        feed(&db, 40);
        let data = db
            .create_fetch_request(ConsolFun::Average, T0, T0 + 39 * 300)
            .unwrap()
            .fetch_data()
            .unwrap();
        let dump = db.dump_xml().unwrap();
        db.close().unwrap();
        (data, dump)
    };

    let db = RrdDatabase::open(&path).unwrap();
    assert_eq!(db.last_update_time().unwrap(), T0 + 39 * 300);
    assert_eq!(db.dump_xml().unwrap(), dump_before);

    let after = db
        .create_fetch_request(ConsolFun::Average, T0, T0 + 39 * 300)
        .unwrap()
        .fetch_data()
        .unwrap();
    assert_eq!(before.timestamps(), after.timestamps());
    for ds in ["temp", "bytes"] {
        let (a, b) = (before.values(ds).unwrap(), after.values(ds).unwrap());
        assert!(a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits()));
    }

    let mut expected = def.clone();
    expected.set_start_time(T0 + 39 * 300);
    assert_eq!(db.definition().unwrap(), expected);

    // Updates continue where the closed handle stopped.
    db.update(T0 + 40 * 300, &[40.0, 120_000.0]).unwrap();
    assert!(matches!(
        db.update(T0 + 40 * 300, &[41.0, 120_000.0]),
        Err(RrdError::TimestampOrder { .. })
    ));
}

#[test]
fn test_one_step_average() {
    let dir = tempdir().unwrap();
    let mut def = RrdDef::new(dir.path().join("a.rrd"), 300);
    def.set_start_time(T0 - 300);
    def.add_datasource(DsDef::new("x", DsType::Gauge, 600, None, None).unwrap());
    def.add_archive(ArcDef::new(ConsolFun::Average, 0.5, 1, 10).unwrap());

    let db = RrdDatabase::create(&def).unwrap();
    db.update(T0, &[10.0]).unwrap();
    db.update(T0 + 300, &[20.0]).unwrap();

    let data = db
        .create_fetch_request(ConsolFun::Average, T0, T0 + 300)
        .unwrap()
        .fetch_data()
        .unwrap();
    assert_eq!(data.timestamps(), &[T0, T0 + 300]);
    assert_eq!(data.values("x").unwrap(), &[10.0, 20.0]);
}

#[test]
fn test_two_step_average() {
    // Rows of 600 seconds end on odd multiples of 300 here.
    let t0 = T0 + 300;
    let dir = tempdir().unwrap();
    let mut def = RrdDef::new(dir.path().join("b.rrd"), 300);
    def.set_start_time(t0 - 300);
    def.add_datasource(DsDef::new("x", DsType::Gauge, 600, None, None).unwrap());
    def.add_archive(ArcDef::new(ConsolFun::Average, 0.5, 2, 10).unwrap());

    let db = RrdDatabase::create(&def).unwrap();
    for (i, value) in [10.0, 20.0, 30.0, 40.0].into_iter().enumerate() {
        db.update(t0 + i as u64 * 300, &[value]).unwrap();
    }

    let data = db
        .create_fetch_request(ConsolFun::Average, t0 + 300, t0 + 900)
        .unwrap()
        .set_resolution(600)
        .unwrap()
        .fetch_data()
        .unwrap();
    assert_eq!(data.step(), 600);
    assert_eq!(data.timestamps(), &[t0 + 300, t0 + 900]);
    assert_eq!(data.values(0usize).unwrap(), &[15.0, 35.0]);
}

#[test]
fn test_counter_rates_and_heartbeat_gaps() {
    let dir = tempdir().unwrap();
    let db = RrdDatabase::create(&traffic_def(&dir.path().join("c.rrd"))).unwrap();
    db.update(T0, &[1.0, 0.0]).unwrap();
    db.update(T0 + 300, &[2.0, 3000.0]).unwrap();
    db.update(T0 + 600, &[3.0, 6000.0]).unwrap();
    // Longer than the heartbeat: everything in between is unknown.
    db.update(T0 + 1800, &[4.0, 18_000.0]).unwrap();

    let data = db
        .create_fetch_request(ConsolFun::Average, T0, T0 + 1800)
        .unwrap()
        .fetch_data()
        .unwrap();
    assert_eq!(data.step(), 300);

    let bytes = data.values("bytes").unwrap();
    assert!(bytes[0].is_nan());
    assert_eq!(&bytes[1..3], &[10.0, 10.0]);
    assert!(bytes[3..].iter().all(|v| v.is_nan()));

    let temp = data.values("temp").unwrap();
    assert_eq!(&temp[..3], &[1.0, 2.0, 3.0]);
    assert!(temp[3..].iter().all(|v| v.is_nan()));
}

#[test]
fn test_out_of_range_values_are_unknown() {
    let dir = tempdir().unwrap();
    let db = RrdDatabase::create(&traffic_def(&dir.path().join("r.rrd"))).unwrap();
    db.update(T0, &[25.0, 0.0]).unwrap();
    db.update(T0 + 300, &[99.0, 0.0]).unwrap();

    let data = db
        .create_fetch_request(ConsolFun::Average, T0, T0 + 300)
        .unwrap()
        .fetch_data()
        .unwrap();
    let temp = data.values("temp").unwrap();
    assert_eq!(temp[0], 25.0);
    assert!(temp[1].is_nan());
}

#[test]
fn test_open_ended_fetch_is_rejected() {
    let dir = tempdir().unwrap();
    let db = RrdDatabase::create(&traffic_def(&dir.path().join("w.rrd"))).unwrap();
    feed(&db, 3);

    let err = db
        .create_fetch_request(ConsolFun::Average, T0, u64::MAX)
        .unwrap()
        .fetch_data()
        .unwrap_err();
    assert!(matches!(
        err,
        RrdError::Validation(ValidationError::FetchWindowTooLarge { end: u64::MAX, .. })
    ));

    // The handle stays usable.
    let data = db
        .create_fetch_request(ConsolFun::Average, T0, T0 + 600)
        .unwrap()
        .fetch_data()
        .unwrap();
    assert_eq!(data.values("temp").unwrap(), &[0.0, 1.0, 2.0]);
}

#[test]
fn test_archive_selection() {
    let dir = tempdir().unwrap();
    let db = RrdDatabase::create(&traffic_def(&dir.path().join("s.rrd"))).unwrap();
    feed(&db, 48);
    let last = db.last_update_time().unwrap();
    assert_eq!(last, T0 + 47 * 300);

    // Both averages cover the window; the finer one is closer to 1 second.
    let recent = db
        .create_fetch_request(ConsolFun::Average, last - 1800, last - 300)
        .unwrap()
        .fetch_data()
        .unwrap();
    assert_eq!(recent.step(), 300);
    assert_eq!(
        recent.values("temp").unwrap(),
        &[41.0, 42.0, 43.0, 44.0, 45.0, 46.0]
    );

    // Same window, coarse resolution requested.
    let coarse = db
        .create_fetch_request(ConsolFun::Average, last - 1800, last - 300)
        .unwrap()
        .set_resolution(3600)
        .unwrap()
        .fetch_data()
        .unwrap();
    assert_eq!(coarse.step(), 3600);

    // Only the coarse archive reaches back far enough.
    let old = db
        .create_fetch_request(ConsolFun::Average, last - 7200, last - 300)
        .unwrap()
        .set_resolution(300)
        .unwrap()
        .fetch_data()
        .unwrap();
    assert_eq!(old.step(), 3600);

    // No full match: the larger overlap wins.
    let partial = db
        .create_fetch_request(ConsolFun::Average, last - 7200, last)
        .unwrap()
        .fetch_data()
        .unwrap();
    assert_eq!(partial.step(), 3600);

    let max = db
        .create_fetch_request(ConsolFun::Max, last - 1800, last)
        .unwrap()
        .fetch_data()
        .unwrap();
    assert_eq!(max.step(), 1800);

    assert!(matches!(
        db.create_fetch_request(ConsolFun::Min, last - 1800, last)
            .unwrap()
            .fetch_data(),
        Err(RrdError::NoMatchingArchive {
            consol_fun: ConsolFun::Min
        })
    ));
}

#[test]
fn test_fail_fast_lock() {
    init_tracing();
    let dir = tempdir().unwrap();
    let path = dir.path().join("locked.rrd");
    let locking = DbOptions {
        backend: BackendKind::File,
        lock_mode: LockMode::FailFast,
    };

    let holder = RrdDatabase::create_with(&traffic_def(&path), locking).unwrap();
    assert!(matches!(
        RrdDatabase::open_with(&path, locking),
        Err(RrdError::LockContention { .. })
    ));

    holder.close().unwrap();
    let reopened = RrdDatabase::open_with(&path, locking).unwrap();
    assert_eq!(reopened.ds_count().unwrap(), 2);
}

#[test]
fn test_closed_handle_rejects_calls() {
    let dir = tempdir().unwrap();
    let db = RrdDatabase::create(&traffic_def(&dir.path().join("x.rrd"))).unwrap();
    db.close().unwrap();
    db.close().unwrap();
    assert!(db.is_closed());
    assert!(matches!(db.update(T0, &[1.0, 1.0]), Err(RrdError::Closed { .. })));
    assert!(matches!(db.last_update_time(), Err(RrdError::Closed { .. })));
}

#[test]
fn test_foreign_and_damaged_files() {
    let dir = tempdir().unwrap();

    let foreign = dir.path().join("foreign.rrd");
    std::fs::write(&foreign, vec![b'x'; 4096]).unwrap();
    assert!(matches!(
        RrdDatabase::open(&foreign),
        Err(RrdError::Format(FormatError::BadSignature { .. }))
    ));

    let path = dir.path().join("damaged.rrd");
    RrdDatabase::create(&traffic_def(&path)).unwrap().close().unwrap();
    let bytes = std::fs::read(&path).unwrap();

    std::fs::write(&path, &bytes[..bytes.len() - 8]).unwrap();
    assert!(matches!(
        RrdDatabase::open(&path),
        Err(RrdError::Format(FormatError::Truncated { .. }))
    ));

    let mut padded = bytes.clone();
    padded.extend_from_slice(&[0; 16]);
    std::fs::write(&path, &padded).unwrap();
    assert!(matches!(
        RrdDatabase::open(&path),
        Err(RrdError::Format(FormatError::TrailingBytes { trailing: 16, .. }))
    ));
}
