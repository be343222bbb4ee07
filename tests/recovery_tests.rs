use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use graphite::{DataFile, GraphiteError, Record, RecordFile, StoreConfig, TransactionManager};
use tempfile::tempdir;

const RECORD_SIZE: usize = 16;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config() -> StoreConfig {
    StoreConfig {
        record_size: RECORD_SIZE,
        max_trans: 10,
    }
}

fn shared_record(id: u64, payload: &[u8]) -> graphite::SharedRecord {
    let mut record = Record::new(id, RECORD_SIZE);
    record.write_bytes(0, payload);
    Arc::new(Mutex::new(record))
}

/// First payload byte of a record in the data file, 0 if the file does
/// not reach the record's offset.
fn data_byte(data_path: &Path, id: u64) -> u8 {
    let bytes = fs::read(data_path).unwrap_or_default();
    let offset = id as usize * RECORD_SIZE;
    if offset < bytes.len() {
        bytes[offset]
    } else {
        0
    }
}

#[test]
fn test_commit_then_crash_then_recover() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("graph.db");

    {
        let mut rf = RecordFile::open_with_config(&path, config()).unwrap();
        let record = rf.get(7).unwrap();
        record.lock().unwrap().write_bytes(0, b"A");
        rf.release(record).unwrap();
        rf.flush().unwrap();
        // Simulated crash: the record file is dropped without close,
        // so the log was never drained into the data file.
    }
    assert_eq!(data_byte(&path, 7), 0);

    let mut rf = RecordFile::open_with_config(&path, config()).unwrap();
    assert_eq!(data_byte(&path, 7), b'A');

    let log = fs::read(format!("{}.tlg", path.display())).unwrap();
    assert_eq!(log, vec![0x66, 0x42]);

    let record = rf.get(7).unwrap();
    assert_eq!(record.lock().unwrap().read_u8(0), b'A');
    rf.release(record).unwrap();
    rf.close().unwrap();
}

#[test]
fn test_later_image_wins_within_frame() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("graph.db");

    {
        let mut owner = DataFile::open(&path, RECORD_SIZE).unwrap();
        let mut tm = TransactionManager::new(&mut owner, true).unwrap();
        tm.start(&mut owner).unwrap();
        tm.add(shared_record(5, b"X"));
        tm.add(shared_record(5, b"Y"));
        tm.commit().unwrap();
    }

    let mut owner = DataFile::open(&path, RECORD_SIZE).unwrap();
    let _tm = TransactionManager::new(&mut owner, true).unwrap();

    assert_eq!(data_byte(&path, 5), b'Y');
}

#[test]
fn test_bad_magic_log_is_discarded_at_boot() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("graph.db");

    fs::write(format!("{}.tlg", path.display()), [0xFF, 0xFF]).unwrap();

    // The foreign log must not prevent startup.
    let mut rf = RecordFile::open_with_config(&path, config()).unwrap();

    let log = fs::read(format!("{}.tlg", path.display())).unwrap();
    assert_eq!(log, vec![0x66, 0x42]);

    // And the file is fully usable afterwards.
    let record = rf.get(1).unwrap();
    record.lock().unwrap().write_bytes(0, b"ok");
    rf.release(record).unwrap();
    rf.flush().unwrap();
    rf.close().unwrap();
    assert_eq!(data_byte(&path, 1), b'o');
}

#[test]
fn test_torn_trailing_frame_is_detected() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("graph.db");
    let log_path = format!("{}.tlg", path.display());

    {
        let mut rf = RecordFile::open_with_config(&path, config()).unwrap();
        for (id, payload) in [(1u64, b"A"), (2u64, b"B")] {
            let record = rf.get(id).unwrap();
            record.lock().unwrap().write_bytes(0, payload);
            rf.release(record).unwrap();
            rf.flush().unwrap();
        }
        // Crash without drain.
    }

    // Cut the second frame short, as a torn write would.
    let bytes = fs::read(&log_path).unwrap();
    fs::write(&log_path, &bytes[..bytes.len() - 3]).unwrap();

    let err = RecordFile::open_with_config(&path, config()).unwrap_err();
    assert!(matches!(err, GraphiteError::Truncated(_)));

    // The first frame's effects are durable, the torn frame's are not.
    assert_eq!(data_byte(&path, 1), b'A');
    assert_eq!(data_byte(&path, 2), 0);
}

#[test]
fn test_replay_is_idempotent() {
    init_logging();
    let dir = tempdir().unwrap();
    let path = dir.path().join("graph.db");
    let log_path = format!("{}.tlg", path.display());

    {
        let mut owner = DataFile::open(&path, RECORD_SIZE).unwrap();
        let mut tm = TransactionManager::new(&mut owner, true).unwrap();
        for (id, payload) in [(1u64, b"A"), (2u64, b"B")] {
            tm.start(&mut owner).unwrap();
            tm.add(shared_record(id, payload));
            tm.commit().unwrap();
        }
    }
    let log_copy = fs::read(&log_path).unwrap();

    {
        let mut owner = DataFile::open(&path, RECORD_SIZE).unwrap();
        let _tm = TransactionManager::new(&mut owner, true).unwrap();
    }
    let after_first = fs::read(&path).unwrap();

    // Replaying the very same log a second time must not change the
    // data file in any way.
    fs::write(&log_path, &log_copy).unwrap();
    {
        let mut owner = DataFile::open(&path, RECORD_SIZE).unwrap();
        let _tm = TransactionManager::new(&mut owner, true).unwrap();
    }
    let after_second = fs::read(&path).unwrap();

    assert_eq!(after_first, after_second);
}

#[test]
fn test_crash_at_every_byte_offset() {
    init_logging();
    let dir = tempdir().unwrap();

    // Build a reference log with two committed frames.
    let build_path = dir.path().join("build").join("graph.db");
    fs::create_dir_all(build_path.parent().unwrap()).unwrap();
    let build_log = format!("{}.tlg", build_path.display());

    let frame1_end;
    let frame2_end;
    {
        let mut owner = DataFile::open(&build_path, RECORD_SIZE).unwrap();
        let mut tm = TransactionManager::new(&mut owner, true).unwrap();

        tm.start(&mut owner).unwrap();
        tm.add(shared_record(1, b"A"));
        tm.commit().unwrap();
        frame1_end = fs::metadata(&build_log).unwrap().len() as usize;

        tm.start(&mut owner).unwrap();
        tm.add(shared_record(2, b"B"));
        tm.add(shared_record(3, b"C"));
        tm.commit().unwrap();
        frame2_end = fs::metadata(&build_log).unwrap().len() as usize;
    }
    let log = fs::read(&build_log).unwrap();
    assert_eq!(log.len(), frame2_end);

    // Replay every possible crash prefix of the log. Recovery must
    // apply whole frames and nothing else.
    for cut in 0..=log.len() {
        let cut_dir = dir.path().join(format!("cut{}", cut));
        fs::create_dir(&cut_dir).unwrap();
        let data_path = cut_dir.join("graph.db");
        fs::write(format!("{}.tlg", data_path.display()), &log[..cut]).unwrap();

        let mut owner = DataFile::open(&data_path, RECORD_SIZE).unwrap();
        let result = TransactionManager::new(&mut owner, true);
        drop(owner);

        let at_boundary = cut == 2 || cut == frame1_end || cut == frame2_end;
        let before_header = cut < 2;
        assert_eq!(
            result.is_ok(),
            at_boundary || before_header,
            "unexpected recovery outcome at cut {}",
            cut
        );

        let frames_applied = if cut >= frame2_end {
            2
        } else if cut >= frame1_end {
            1
        } else {
            0
        };

        let expect_byte = |applied: bool, payload: u8| if applied { payload } else { 0 };
        assert_eq!(
            data_byte(&data_path, 1),
            expect_byte(frames_applied >= 1, b'A'),
            "record 1 at cut {}",
            cut
        );
        assert_eq!(
            data_byte(&data_path, 2),
            expect_byte(frames_applied >= 2, b'B'),
            "record 2 at cut {}",
            cut
        );
        assert_eq!(
            data_byte(&data_path, 3),
            expect_byte(frames_applied >= 2, b'C'),
            "record 3 at cut {}",
            cut
        );
    }
}
