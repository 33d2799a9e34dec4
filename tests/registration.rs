mod common;

use std::fs;
use std::sync::Arc;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use dropstore::completeness::ReadyItem;
use dropstore::config::ExtractorSettings;
use dropstore::domain::{DataSetDescriptor, DataSetInfo, StorageFormat};
use dropstore::error::DropstoreError;
use dropstore::extraction::{
    ConfiguredTypeExtractor, DataSetInfoExtractor, DataSetTypes, FileNameInfoExtractor,
};
use dropstore::lifecycle::StopToken;
use dropstore::registration::{DataSetRegistrator, RegistrationOutcome, RegistratorSettings};
use dropstore::storage::{
    DefaultStorageProcessor, StorageProcessor, StorageTransaction, UnstoreAction,
};
use dropstore::store::Store;

use common::{MockCatalog, MockNotifier, capture_logs, code, write_file};

const INCOMING_NAME: &str = "cp1_20240101-1";
const IDENTIFIED_BASE: &str = "identified/LAB/PROJ/EXP1/RAW/20240101-1";

struct UnreadableExtractor;

impl DataSetInfoExtractor for UnreadableExtractor {
    fn extract(&self, incoming: &Utf8Path) -> Result<DataSetInfo, DropstoreError> {
        Err(DropstoreError::UserFailure(format!(
            "No sample code found in '{incoming}'"
        )))
    }

    fn uploader_email(&self, _incoming: &Utf8Path) -> Option<String> {
        Some("uploader@example.org".to_string())
    }
}

/// Requests a stop as soon as the data has been stored, before the catalog sees it.
struct StoppingStorage {
    inner: DefaultStorageProcessor,
    stop: StopToken,
}

struct StoppingTransaction {
    inner: Box<dyn StorageTransaction>,
    stop: StopToken,
}

impl StorageProcessor for StoppingStorage {
    fn storage_format(&self) -> StorageFormat {
        self.inner.storage_format()
    }

    fn create_transaction(
        &self,
        incoming: &Utf8Path,
        base_directory: &Utf8Path,
    ) -> Box<dyn StorageTransaction> {
        Box::new(StoppingTransaction {
            inner: self.inner.create_transaction(incoming, base_directory),
            stop: self.stop.clone(),
        })
    }
}

impl StorageTransaction for StoppingTransaction {
    fn store_data(&mut self, descriptor: &DataSetDescriptor) -> Result<Utf8PathBuf, DropstoreError> {
        let stored = self.inner.store_data(descriptor)?;
        self.stop.request_stop();
        Ok(stored)
    }

    fn commit(&mut self) -> Result<(), DropstoreError> {
        self.inner.commit()
    }

    fn rollback(&mut self, error: &DropstoreError) -> UnstoreAction {
        self.inner.rollback(error)
    }
}

struct Fixture {
    _temp: TempDir,
    store: Store,
    incoming: Utf8PathBuf,
    marker: Utf8PathBuf,
    catalog: Arc<MockCatalog>,
    notifier: Arc<MockNotifier>,
    stop: StopToken,
    extractor: Arc<dyn DataSetInfoExtractor>,
    settings: RegistratorSettings,
}

impl Fixture {
    fn new() -> Self {
        let (temp, root) = common::temp_root();
        let incoming = root.join("incoming").join(INCOMING_NAME);
        write_file(&incoming.join("image.tif"), "pixels");
        let marker = root
            .join("incoming")
            .join(format!(".MARKER_is_finished_{INCOMING_NAME}"));
        write_file(&marker, "");
        let catalog = Arc::new(MockCatalog::default());
        catalog.add_sample("DEFAULT", "CP1", Some("/LAB/PROJ/EXP1"), Some("user@example.org"));
        Self {
            _temp: temp,
            store: Store::new(root.join("store")),
            incoming,
            marker,
            catalog,
            notifier: Arc::new(MockNotifier::default()),
            stop: StopToken::new(),
            extractor: Arc::new(FileNameInfoExtractor::new(ExtractorSettings {
                index_of_data_set_code: Some(1),
                ..ExtractorSettings::default()
            })),
            settings: RegistratorSettings {
                data_store_code: "DSS1".to_string(),
                delete_unidentified: false,
                notify_successful_registration: true,
            },
        }
    }

    fn registrator(&self) -> DataSetRegistrator {
        self.registrator_with(Arc::new(DefaultStorageProcessor::new(
            UnstoreAction::MoveToError,
        )))
    }

    fn registrator_with(&self, storage: Arc<dyn StorageProcessor>) -> DataSetRegistrator {
        DataSetRegistrator::new(
            self.store.clone(),
            self.settings.clone(),
            self.catalog.clone(),
            Arc::clone(&self.extractor),
            Arc::new(ConfiguredTypeExtractor::new(DataSetTypes {
                data_set_type: "RAW".to_string(),
                file_format_type: "TIFF".to_string(),
                locator_type: "RELATIVE_LOCATION".to_string(),
                storage_format: StorageFormat::Proprietary,
                is_measured: true,
            })),
            storage,
            self.notifier.clone(),
            self.stop.clone(),
        )
    }

    fn item(&self) -> ReadyItem {
        ReadyItem::new(self.incoming.clone(), Some(self.marker.clone()))
    }
}

#[test]
fn identified_data_set_is_stored_and_registered() {
    let fixture = Fixture::new();

    let (outcome, logs) = capture_logs(|| fixture.registrator().register(&fixture.item()));

    assert_eq!(outcome.unwrap(), RegistrationOutcome::Registered(code("20240101-1")));
    let stored = fixture
        .store
        .root()
        .join(IDENTIFIED_BASE)
        .join("original")
        .join(INCOMING_NAME)
        .join("image.tif");
    assert_eq!(fs::read_to_string(stored.as_std_path()).unwrap(), "pixels");
    assert!(!fixture.incoming.as_std_path().exists());
    assert!(!fixture.marker.as_std_path().exists());
    assert!(fixture.store.leftover_processing_markers().unwrap().is_empty());

    let registered = fixture.catalog.registered.lock().unwrap();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].location, IDENTIFIED_BASE);
    assert_eq!(registered[0].data_store_code, "DSS1");
    assert_eq!(registered[0].file_format_type, "TIFF");
    assert_eq!(registered[0].sample.as_ref().unwrap().as_str(), "/DEFAULT/CP1");

    assert!(logs.contains(
        "Successfully registered data set '20240101-1' for sample '/DEFAULT/CP1', data set type 'RAW'"
    ));
    let messages = fixture.notifier.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].0, "Success: data set for experiment 'EXP1'");
    assert_eq!(messages[0].2, "user@example.org");
}

#[test]
fn data_set_code_is_allocated_when_not_given() {
    let mut fixture = Fixture::new();
    fixture.extractor = Arc::new(FileNameInfoExtractor::new(ExtractorSettings::default()));
    fixture.settings.notify_successful_registration = false;

    let outcome = fixture.registrator().register(&fixture.item()).unwrap();

    assert_eq!(
        outcome,
        RegistrationOutcome::Registered(code("20240101000000-1"))
    );
    assert!(fixture.notifier.messages.lock().unwrap().is_empty());
}

#[test]
fn unknown_sample_moves_to_unidentified() {
    let fixture = Fixture::new();
    fixture.catalog.samples.lock().unwrap().clear();

    let outcome = fixture.registrator().register(&fixture.item()).unwrap();

    let target = fixture
        .store
        .root()
        .join("unidentified/RAW")
        .join(INCOMING_NAME);
    assert_eq!(outcome, RegistrationOutcome::Unidentified(Some(target.clone())));
    assert!(target.join("image.tif").as_std_path().exists());
    assert!(!fixture.marker.as_std_path().exists());
    assert!(fixture.catalog.registered.lock().unwrap().is_empty());
}

#[test]
fn unidentified_data_set_can_be_deleted() {
    let mut fixture = Fixture::new();
    fixture.settings.delete_unidentified = true;
    fixture.catalog.add_sample("DEFAULT", "CP1", None, None);

    let outcome = fixture.registrator().register(&fixture.item()).unwrap();

    assert_eq!(outcome, RegistrationOutcome::Unidentified(None));
    assert!(!fixture.incoming.as_std_path().exists());
}

#[test]
fn catalog_failure_rolls_back_to_error_area() {
    let fixture = Fixture::new();
    *fixture.catalog.registration_failure.lock().unwrap() = Some("catalog down".to_string());

    let (outcome, logs) = capture_logs(|| fixture.registrator().register(&fixture.item()));

    assert_eq!(
        outcome.unwrap(),
        RegistrationOutcome::RolledBack(UnstoreAction::MoveToError)
    );
    assert!(logs.contains(
        "Registration of data set '20240101-1 (sample /DEFAULT/CP1)' failed. catalog request failed: catalog down"
    ));
    let error_dir = fixture.store.root().join("error/RAW");
    assert!(error_dir.join(INCOMING_NAME).join("image.tif").as_std_path().exists());
    let exception = fs::read_to_string(
        error_dir
            .join(format!("{INCOMING_NAME}.exception"))
            .as_std_path(),
    )
    .unwrap();
    assert!(exception.starts_with("catalog request failed: catalog down\n"));
    assert!(!fixture.store.root().join(IDENTIFIED_BASE).as_std_path().exists());
    assert!(!fixture.incoming.as_std_path().exists());
    assert!(!fixture.marker.as_std_path().exists());
}

#[test]
fn identification_failure_notifies_the_uploader() {
    let mut fixture = Fixture::new();
    fixture.extractor = Arc::new(UnreadableExtractor);

    let err = fixture.registrator().register(&fixture.item()).unwrap_err();

    assert_matches!(err, DropstoreError::UserFailure(_));
    assert!(fixture.incoming.as_std_path().exists());
    let messages = fixture.notifier.messages.lock().unwrap();
    assert_eq!(
        messages[0].0,
        format!("Error when trying to identify data set '{}'.", fixture.incoming)
    );
    assert_eq!(messages[0].2, "uploader@example.org");
}

#[test]
fn stop_request_leaves_incoming_untouched() {
    let fixture = Fixture::new();
    fixture.stop.request_stop();

    let outcome = fixture.registrator().register(&fixture.item()).unwrap();

    assert_eq!(outcome, RegistrationOutcome::Interrupted);
    assert!(fixture.incoming.join("image.tif").as_std_path().exists());
    assert!(fixture.marker.as_std_path().exists());
    assert!(fixture.catalog.registered.lock().unwrap().is_empty());
}

#[test]
fn stop_request_after_storing_rolls_back() {
    let fixture = Fixture::new();
    let registrator = fixture.registrator_with(Arc::new(StoppingStorage {
        inner: DefaultStorageProcessor::new(UnstoreAction::MoveToError),
        stop: fixture.stop.clone(),
    }));

    let (outcome, logs) = capture_logs(|| registrator.register(&fixture.item()));

    assert_eq!(outcome.unwrap(), RegistrationOutcome::Interrupted);
    assert!(logs.contains("Requested to stop registration of data set"));
    assert_eq!(
        fs::read_to_string(fixture.incoming.join("image.tif").as_std_path()).unwrap(),
        "pixels"
    );
    assert!(fixture.marker.as_std_path().exists());
    assert!(fixture.catalog.registered.lock().unwrap().is_empty());
    assert!(!fixture.store.root().join(IDENTIFIED_BASE).as_std_path().exists());
    assert!(!fixture.store.root().join("error").as_std_path().exists());
    assert!(fixture.store.leftover_processing_markers().unwrap().is_empty());
}
