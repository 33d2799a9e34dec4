mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use tempfile::TempDir;

use dropstore::app::App;
use dropstore::clock::SystemTimeProvider;
use dropstore::config::{ArchiverEntry, Config, ConfigLoader, ThreadEntry};
use dropstore::domain::{ArchivingStatus, Status};
use dropstore::error::DropstoreError;
use dropstore::lifecycle::StopToken;

use common::{
    FixedFreeSpace, MockCatalog, MockClock, MockDeleter, MockNotifier, START_MILLIS, code,
    stored_data_set, write_file,
};

struct Fixture {
    _temp: TempDir,
    root: Utf8PathBuf,
    catalog: Arc<MockCatalog>,
    deleter: Arc<MockDeleter>,
}

impl Fixture {
    fn new() -> Self {
        let (temp, root) = common::temp_root();
        Self {
            _temp: temp,
            root,
            catalog: Arc::new(MockCatalog::default()),
            deleter: Arc::new(MockDeleter::default()),
        }
    }

    fn config(&self, with_archiver: bool) -> Config {
        Config {
            data_store_code: Some("DSS1".to_string()),
            store_root: Some(self.root.join("store").to_string()),
            shutdown_file: Some(self.root.join("shutdown").to_string()),
            shutdown_timeout_ms: Some(5_000),
            threads: vec![ThreadEntry {
                name: Some("main".to_string()),
                incoming_dir: self.root.join("incoming").to_string(),
                incoming_dir_create: true,
                ..ThreadEntry::default()
            }],
            archiver: with_archiver.then(|| ArchiverEntry {
                database_path: self.root.join("archive.db").to_string(),
                staging_dir: self.root.join("staging").to_string(),
                final_dir: self.root.join("final").to_string(),
                ..ArchiverEntry::default()
            }),
            ..Config::default()
        }
    }

    fn app(&self, config: Config) -> App {
        App::new(
            ConfigLoader::resolve_config(config).unwrap(),
            self.catalog.clone(),
            Arc::new(MockNotifier::default()),
            Arc::new(FixedFreeSpace::new(u64::MAX / 1024)),
            self.deleter.clone(),
            Arc::new(MockClock::new(START_MILLIS)),
        )
    }

    fn stored(&self, code_value: &str, content: &str) {
        write_file(
            &self
                .root
                .join("store")
                .join(code_value)
                .join("original/data.txt"),
            content,
        );
        self.catalog
            .add_data_set(stored_data_set(code_value, code_value, None));
    }
}

#[test]
fn check_reports_problems() {
    let fixture = Fixture::new();
    let app = fixture.app(fixture.config(true));
    write_file(
        &fixture.root.join("store/identified/.MARKER_processing_ds1"),
        "",
    );

    let result = app.check().unwrap();

    assert!(!result.ok);
    assert!(result.threads[0].problem.is_some());
    assert_eq!(result.leftover_processing_markers.len(), 1);
    let database = result.archive_database.unwrap();
    assert_eq!(database.schema_version, 1);
    assert_eq!(database.containers, 0);

    let json = serde_json::to_value(app.containers().unwrap()).unwrap();
    assert_eq!(json, serde_json::json!({"containers": []}));
}

#[test]
fn check_passes_on_a_prepared_environment() {
    let fixture = Fixture::new();
    std::fs::create_dir_all(fixture.root.join("incoming").as_std_path()).unwrap();

    let result = fixture.app(fixture.config(false)).check().unwrap();

    assert!(result.ok, "{result:?}");
    assert!(result.archive_database.is_none());
}

#[test]
fn archive_and_unarchive_through_the_app() {
    let fixture = Fixture::new();
    fixture.stored("ds1", "first payload");
    fixture.stored("ds2", "second payload");
    let app = fixture.app(fixture.config(true));

    let status = app.archive(&[code("ds1"), code("ds2")], true, None).unwrap();

    assert!(status.is_ok(), "{status:?}");
    assert_eq!(*fixture.deleter.waits.lock().unwrap(), 1);
    assert_eq!(
        fixture.catalog.status_log(),
        vec!["[ds1, ds2]: AVAILABLE false", "[ds1, ds2]: ARCHIVED true"]
    );
    let listing = app.containers().unwrap();
    assert_eq!(listing.containers.len(), 1);
    assert_eq!(listing.containers[0].data_sets.len(), 2);
    let json = serde_json::to_value(&listing).unwrap();
    assert_eq!(json["containers"][0]["id"], 1);
    assert_eq!(json["containers"][0]["data_sets"][1]["code"], "ds2");

    std::fs::remove_dir_all(fixture.root.join("store/ds1").as_std_path()).unwrap();
    let status = app.unarchive(&[code("ds1")]).unwrap();

    assert_eq!(status.status_of(&code("ds1")), Some(&Status::Ok));
    assert_eq!(
        std::fs::read_to_string(
            fixture
                .root
                .join("store/ds1/original/data.txt")
                .as_std_path()
        )
        .unwrap(),
        "first payload"
    );
    assert_eq!(
        fixture.catalog.status_updates.lock().unwrap().last().unwrap().status,
        ArchivingStatus::Available
    );
}

#[test]
fn unknown_codes_are_reported() {
    let fixture = Fixture::new();
    let app = fixture.app(fixture.config(true));

    let status = app.archive(&[code("missing")], false, None).unwrap();

    assert_eq!(
        status.status_of(&code("missing")),
        Some(&Status::Error(
            "Data set 'missing' is unknown to the catalog".to_string()
        ))
    );
    assert!(fixture.catalog.status_updates.lock().unwrap().is_empty());
}

#[test]
fn archiving_needs_an_archiver_section() {
    let fixture = Fixture::new();
    let app = fixture.app(fixture.config(false));

    let err = app.unarchive(&[code("ds1")]).unwrap_err();

    assert_matches!(err, DropstoreError::Configuration(_));
}

#[test]
fn run_ends_when_the_shutdown_file_appears() {
    let fixture = Fixture::new();
    write_file(&fixture.root.join("shutdown"), "");
    let app = App::new(
        ConfigLoader::resolve_config(fixture.config(false)).unwrap(),
        fixture.catalog.clone(),
        Arc::new(MockNotifier::default()),
        Arc::new(FixedFreeSpace::new(u64::MAX / 1024)),
        fixture.deleter.clone(),
        Arc::new(SystemTimeProvider),
    );

    let result = app.run(StopToken::new()).unwrap();

    assert_eq!(result.threads, vec!["main"]);
    assert!(!result.forced_shutdown);
    assert_eq!(result.unfinished_workers, 0);
    assert!(!fixture.root.join("shutdown").as_std_path().exists());
    assert!(fixture.root.join("incoming").as_std_path().is_dir());
}
