mod common;

use std::fs;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use assert_matches::assert_matches;
use camino::Utf8Path;
use dropstore::completeness::{
    CompletenessDetector, MarkerFileDetector, QuietPeriodDetector, ReadyItem,
};
use dropstore::error::DropstoreError;

use common::{MockClock, START_MILLIS, capture_logs, write_file};

fn set_modified(path: &Utf8Path, secs: u64) {
    let file = fs::OpenOptions::new()
        .write(true)
        .open(path.as_std_path())
        .unwrap();
    file.set_modified(UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
}

#[test]
fn marker_file_makes_item_ready() {
    let (_temp, root) = common::temp_root();
    let incoming = root.join("ds1");
    write_file(&incoming.join("data.txt"), "payload");
    let marker = root.join(".MARKER_is_finished_ds1");
    write_file(&marker, "");

    let mut detector = MarkerFileDetector::new();
    let item = detector.check(&marker).unwrap().unwrap();

    assert_eq!(item, ReadyItem::new(incoming, Some(marker.clone())));
    item.complete().unwrap();
    assert!(!marker.as_std_path().exists());
    item.complete().unwrap();
}

#[test]
fn marker_without_data_is_dropped() {
    let (_temp, root) = common::temp_root();
    let marker = root.join(".MARKER_is_finished_ds1");
    write_file(&marker, "");

    let err = MarkerFileDetector::new().check(&marker).unwrap_err();

    assert_matches!(err, DropstoreError::Environment(message) if message.contains("ds1"));
    assert!(!marker.as_std_path().exists());
}

#[test]
fn quiet_period_waits_for_stable_modification_time() {
    let (_temp, root) = common::temp_root();
    let incoming = root.join("plate.raw");
    write_file(&incoming, "partial");
    set_modified(&incoming, 1_000);
    let clock = Arc::new(MockClock::new(START_MILLIS));
    let mut detector = QuietPeriodDetector::new(clock.clone(), Duration::from_secs(60));
    assert!(detector.accepts_entry("plate.raw"));
    assert!(!detector.accepts_entry(".faulty_paths"));

    assert_eq!(detector.check(&incoming).unwrap(), None);
    clock.advance(Duration::from_secs(30));
    assert_eq!(detector.check(&incoming).unwrap(), None);

    set_modified(&incoming, 2_000);
    clock.advance(Duration::from_secs(40));
    assert_eq!(detector.check(&incoming).unwrap(), None);
    clock.advance(Duration::from_secs(59));
    assert_eq!(detector.check(&incoming).unwrap(), None);
    clock.advance(Duration::from_secs(1));
    assert_eq!(
        detector.check(&incoming).unwrap(),
        Some(ReadyItem::new(incoming.clone(), None))
    );

    assert_eq!(detector.check(&incoming).unwrap(), None);
}

#[test]
fn quiet_period_ignores_vanished_items() {
    let (_temp, root) = common::temp_root();
    let clock = Arc::new(MockClock::new(START_MILLIS));
    let mut detector = QuietPeriodDetector::new(clock, Duration::from_secs(1));

    assert_eq!(detector.check(&root.join("gone")).unwrap(), None);
}

#[test]
fn quiet_period_gives_up_after_repeated_errors() {
    let (_temp, root) = common::temp_root();
    write_file(&root.join("plain.txt"), "not a directory");
    let unreadable = root.join("plain.txt/plate.raw");
    let clock = Arc::new(MockClock::new(START_MILLIS));
    let mut detector = QuietPeriodDetector::new(clock, Duration::from_secs(1));

    let (results, logs) = capture_logs(|| {
        (0..3)
            .map(|_| detector.check(&unreadable))
            .collect::<Vec<_>>()
    });

    assert_matches!(results[0], Ok(None));
    assert_matches!(results[1], Ok(None));
    assert_matches!(&results[2], Err(DropstoreError::Environment(message)) if message.contains("plate.raw"));
    assert!(logs.contains("(2. attempt)"));
    assert!(logs.contains("after 3 attempts"));
    assert_eq!(detector.tracked(), 0);
}

#[test]
fn quiet_period_forgets_items_no_longer_listed() {
    let (_temp, root) = common::temp_root();
    let first = root.join("first.raw");
    let second = root.join("second.raw");
    write_file(&first, "a");
    write_file(&second, "b");
    let clock = Arc::new(MockClock::new(START_MILLIS));
    let mut detector = QuietPeriodDetector::new(clock, Duration::from_secs(60));

    assert_eq!(detector.check(&first).unwrap(), None);
    assert_eq!(detector.check(&second).unwrap(), None);
    assert_eq!(detector.tracked(), 2);

    fs::remove_file(first.as_std_path()).unwrap();
    detector.retain_listed(&[second.clone()]);

    assert_eq!(detector.tracked(), 1);
}
