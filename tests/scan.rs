mod common;

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use tempfile::TempDir;

use dropstore::completeness::{MarkerFileDetector, ReadyItem};
use dropstore::error::DropstoreError;
use dropstore::lifecycle::StopToken;
use dropstore::registration::RegistrationOutcome;
use dropstore::scan::{DirectoryScanner, FAULTY_PATHS_FILE, HighWaterMark, PathHandler, ScanReport};
use dropstore::store::Store;

use common::{FixedFreeSpace, MockClock, START_MILLIS, code, write_file};

#[derive(Clone, Copy)]
enum Behavior {
    Consume,
    Leave,
    Fail,
    Defect,
    ConsumeAndStop,
}

struct RecordingHandler {
    behavior: Behavior,
    stop: StopToken,
    handled: Mutex<Vec<Utf8PathBuf>>,
}

impl PathHandler for RecordingHandler {
    fn handle(&self, item: &ReadyItem) -> Result<RegistrationOutcome, DropstoreError> {
        self.handled
            .lock()
            .unwrap()
            .push(item.incoming().to_path_buf());
        match self.behavior {
            Behavior::Consume | Behavior::ConsumeAndStop => {
                Store::remove_path(item.incoming()).unwrap();
                item.complete()?;
                if matches!(self.behavior, Behavior::ConsumeAndStop) {
                    self.stop.request_stop();
                }
                Ok(RegistrationOutcome::Registered(code("ds1")))
            }
            Behavior::Leave => Ok(RegistrationOutcome::Registered(code("ds1"))),
            Behavior::Fail => Err(DropstoreError::UserFailure("no sample".to_string())),
            Behavior::Defect => Err(DropstoreError::Defect("broken".to_string())),
        }
    }
}

struct Fixture {
    _temp: TempDir,
    incoming_dir: Utf8PathBuf,
    free_space: Arc<FixedFreeSpace>,
    clock: Arc<MockClock>,
    stop: StopToken,
    handler: Arc<RecordingHandler>,
}

impl Fixture {
    fn new(behavior: Behavior) -> Self {
        let (temp, root) = common::temp_root();
        let incoming_dir = root.join("incoming");
        fs::create_dir_all(incoming_dir.as_std_path()).unwrap();
        let stop = StopToken::new();
        Self {
            _temp: temp,
            incoming_dir,
            free_space: Arc::new(FixedFreeSpace::new(1_000_000)),
            clock: Arc::new(MockClock::new(START_MILLIS)),
            handler: Arc::new(RecordingHandler {
                behavior,
                stop: stop.clone(),
                handled: Mutex::new(Vec::new()),
            }),
            stop,
        }
    }

    fn drop_data_set(&self, name: &str) -> Utf8PathBuf {
        write_file(&self.incoming_dir.join(name).join("data.txt"), "payload");
        let marker = self
            .incoming_dir
            .join(format!(".MARKER_is_finished_{name}"));
        write_file(&marker, "");
        marker
    }

    fn scanner(&self, reprocess_faulty: bool) -> DirectoryScanner {
        DirectoryScanner::new(
            "main",
            self.incoming_dir.clone(),
            Box::new(MarkerFileDetector::new()),
            self.handler.clone(),
            reprocess_faulty,
            HighWaterMark::new(
                self.incoming_dir.clone(),
                Some(500_000),
                self.free_space.clone(),
            ),
            Duration::from_secs(5),
            self.clock.clone(),
            self.stop.clone(),
        )
        .unwrap()
    }

    fn handled(&self) -> Vec<Utf8PathBuf> {
        self.handler.handled.lock().unwrap().clone()
    }
}

#[test]
fn ready_items_are_handled_in_name_order() {
    let fixture = Fixture::new(Behavior::Consume);
    fixture.drop_data_set("b");
    fixture.drop_data_set("a");
    write_file(&fixture.incoming_dir.join("c/data.txt"), "still uploading");

    let report = fixture.scanner(false).scan_once().unwrap();

    assert_eq!(
        report,
        ScanReport {
            processed: 2,
            ..ScanReport::default()
        }
    );
    assert_eq!(
        fixture.handled(),
        vec![fixture.incoming_dir.join("a"), fixture.incoming_dir.join("b")]
    );
    assert!(fixture.incoming_dir.join("c").as_std_path().exists());
}

#[test]
fn leftovers_are_marked_faulty_and_skipped() {
    let fixture = Fixture::new(Behavior::Leave);
    let marker = fixture.drop_data_set("ds1");
    let mut scanner = fixture.scanner(false);

    let first = scanner.scan_once().unwrap();
    assert_eq!(first.processed, 1);
    assert!(scanner.faulty_paths().contains(&marker));
    let persisted =
        fs::read_to_string(fixture.incoming_dir.join(FAULTY_PATHS_FILE).as_std_path()).unwrap();
    assert_eq!(persisted, format!("{marker}\n"));

    let second = scanner.scan_once().unwrap();
    assert_eq!(second.skipped_faulty, 1);
    assert_eq!(fixture.handled().len(), 1);

    let restarted = fixture.scanner(false);
    assert!(restarted.faulty_paths().contains(&marker));
}

#[test]
fn removed_faulty_paths_are_forgotten() {
    let fixture = Fixture::new(Behavior::Leave);
    let marker = fixture.drop_data_set("ds1");
    let mut scanner = fixture.scanner(false);
    scanner.scan_once().unwrap();

    fs::remove_file(marker.as_std_path()).unwrap();
    scanner.scan_once().unwrap();

    assert!(!scanner.faulty_paths().contains(&marker));
    let persisted =
        fs::read_to_string(fixture.incoming_dir.join(FAULTY_PATHS_FILE).as_std_path()).unwrap();
    assert!(persisted.is_empty());
}

#[test]
fn reprocessing_faulty_paths_retries_them() {
    let fixture = Fixture::new(Behavior::Leave);
    fixture.drop_data_set("ds1");
    let mut scanner = fixture.scanner(true);

    scanner.scan_once().unwrap();
    scanner.scan_once().unwrap();

    assert_eq!(fixture.handled().len(), 2);
    assert_eq!(scanner.faulty_paths().paths().count(), 0);
}

#[test]
fn failures_do_not_stop_the_scan() {
    let fixture = Fixture::new(Behavior::Fail);
    fixture.drop_data_set("ds1");
    fixture.drop_data_set("ds2");

    let report = fixture.scanner(false).scan_once().unwrap();

    assert_eq!(report.failed, 2);
    assert_eq!(fixture.handled().len(), 2);
}

#[test]
fn defects_end_the_scanner() {
    let fixture = Fixture::new(Behavior::Defect);
    fixture.drop_data_set("ds1");

    let err = fixture.scanner(false).scan_once().unwrap_err();

    assert_matches!(err, DropstoreError::Defect(_));
}

#[test]
fn low_disk_space_pauses_work() {
    let fixture = Fixture::new(Behavior::Consume);
    fixture.drop_data_set("ds1");
    fixture.free_space.set(100);
    let mut scanner = fixture.scanner(false);

    let report = scanner.scan_once().unwrap();
    assert!(report.throttled);
    assert!(fixture.handled().is_empty());

    fixture.free_space.set(600_000);
    let report = scanner.scan_once().unwrap();
    assert_eq!(report.processed, 1);
}

#[test]
fn run_returns_after_stop_request() {
    let fixture = Fixture::new(Behavior::ConsumeAndStop);
    fixture.drop_data_set("ds1");

    fixture.scanner(false).run().unwrap();

    assert_eq!(fixture.handled(), vec![fixture.incoming_dir.join("ds1")]);
    assert!(fixture.clock.sleeps.lock().unwrap().is_empty());
}
