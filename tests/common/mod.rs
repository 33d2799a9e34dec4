#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;

use dropstore::catalog::{CatalogService, ExperimentInfo, SampleInfo};
use dropstore::clock::TimeProvider;
use dropstore::domain::{
    DataSetCode, DataSetDescriptor, DataSetInfo, ExperimentIdentifier, NewDataSet,
    RegistrationDetails, SampleIdentifier, StatusUpdate, StoredDataSet,
};
use dropstore::error::DropstoreError;
use dropstore::services::{DeletionService, FreeSpaceProvider, Notifier};

pub const START_MILLIS: u64 = 1_700_000_000_000;
pub const START_STAMP: &str = "20231114-221320";

pub fn code(value: &str) -> DataSetCode {
    value.parse().unwrap()
}

pub fn temp_root() -> (TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, root)
}

pub fn write_file(path: &Utf8Path, content: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path()).unwrap();
    }
    fs::write(path.as_std_path(), content).unwrap();
}

pub fn stored_data_set(code_value: &str, location: &str, size: Option<u64>) -> StoredDataSet {
    StoredDataSet {
        descriptor: DataSetDescriptor::from_info(DataSetInfo::default(), code(code_value), "MDT"),
        location: Utf8PathBuf::from(location),
        size,
        registration: RegistrationDetails::default(),
    }
}

#[derive(Default)]
pub struct MockCatalog {
    next_code: Mutex<u32>,
    pub samples: Mutex<HashMap<String, SampleInfo>>,
    pub experiments: Mutex<HashMap<String, ExperimentInfo>>,
    pub data_sets: Mutex<BTreeMap<DataSetCode, StoredDataSet>>,
    pub registered: Mutex<Vec<NewDataSet>>,
    pub status_updates: Mutex<Vec<StatusUpdate>>,
    pub sizes: Mutex<Vec<(DataSetCode, u64)>>,
    pub accessed: Mutex<Vec<DataSetCode>>,
    pub archive_requests: Mutex<Vec<(Vec<DataSetCode>, bool, BTreeMap<String, String>)>>,
    pub registration_failure: Mutex<Option<String>>,
}

impl MockCatalog {
    pub fn add_sample(&self, space: &str, sample: &str, experiment: Option<&str>, email: Option<&str>) {
        let identifier = SampleIdentifier::new(space, sample);
        let experiment = experiment.map(|value| ExperimentInfo {
            identifier: value.parse::<ExperimentIdentifier>().unwrap(),
            registrator_email: email.map(str::to_string),
        });
        self.samples.lock().unwrap().insert(
            identifier.as_str().to_string(),
            SampleInfo {
                identifier,
                experiment,
            },
        );
    }

    pub fn add_data_set(&self, data_set: StoredDataSet) {
        self.data_sets
            .lock()
            .unwrap()
            .insert(data_set.code().clone(), data_set);
    }

    /// One line per update: `[ds1, ds2]: ARCHIVED true`.
    pub fn status_log(&self) -> Vec<String> {
        self.status_updates
            .lock()
            .unwrap()
            .iter()
            .map(|update| {
                format!(
                    "{}: {} {}",
                    dropstore::domain::format_codes(&update.codes),
                    update.status,
                    update.present_in_archive
                )
            })
            .collect()
    }
}

impl CatalogService for MockCatalog {
    fn create_data_set_code(&self) -> Result<DataSetCode, DropstoreError> {
        let mut next = self.next_code.lock().unwrap();
        *next += 1;
        format!("20240101000000-{}", *next).parse()
    }

    fn get_sample(&self, identifier: &SampleIdentifier) -> Result<Option<SampleInfo>, DropstoreError> {
        Ok(self.samples.lock().unwrap().get(identifier.as_str()).cloned())
    }

    fn get_experiment(
        &self,
        identifier: &ExperimentIdentifier,
    ) -> Result<Option<ExperimentInfo>, DropstoreError> {
        Ok(self
            .experiments
            .lock()
            .unwrap()
            .get(&identifier.to_string())
            .cloned())
    }

    fn register_data_set(&self, data_set: &NewDataSet) -> Result<(), DropstoreError> {
        if let Some(message) = self.registration_failure.lock().unwrap().clone() {
            return Err(DropstoreError::CatalogHttp(message));
        }
        self.registered.lock().unwrap().push(data_set.clone());
        Ok(())
    }

    fn update_archiving_status(&self, update: &StatusUpdate) -> Result<(), DropstoreError> {
        self.status_updates.lock().unwrap().push(update.clone());
        Ok(())
    }

    fn update_data_set_size(&self, code: &DataSetCode, size: u64) -> Result<(), DropstoreError> {
        self.sizes.lock().unwrap().push((code.clone(), size));
        Ok(())
    }

    fn notify_data_set_access(&self, code: &DataSetCode) -> Result<(), DropstoreError> {
        self.accessed.lock().unwrap().push(code.clone());
        Ok(())
    }

    fn list_data_sets(&self, codes: &[DataSetCode]) -> Result<Vec<StoredDataSet>, DropstoreError> {
        let data_sets = self.data_sets.lock().unwrap();
        Ok(codes
            .iter()
            .filter_map(|code| data_sets.get(code).cloned())
            .collect())
    }

    fn archive_data_sets(
        &self,
        codes: &[DataSetCode],
        remove_from_store: bool,
        options: &BTreeMap<String, String>,
    ) -> Result<(), DropstoreError> {
        self.archive_requests
            .lock()
            .unwrap()
            .push((codes.to_vec(), remove_from_store, options.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockDeleter {
    pub requests: Mutex<Vec<String>>,
    pub waits: Mutex<usize>,
}

impl DeletionService for MockDeleter {
    fn schedule_deletion(
        &self,
        data_sets: &[StoredDataSet],
        _max_retries: u32,
        _retry_delay: Duration,
    ) -> Result<(), DropstoreError> {
        let joined = data_sets
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        self.requests.lock().unwrap().push(format!("[{joined}]"));
        Ok(())
    }

    fn wait_all(&self) {
        *self.waits.lock().unwrap() += 1;
    }
}

#[derive(Default)]
pub struct MockNotifier {
    pub messages: Mutex<Vec<(String, String, String)>>,
}

impl Notifier for MockNotifier {
    fn send_message(&self, subject: &str, content: &str, recipient: &str) {
        self.messages.lock().unwrap().push((
            subject.to_string(),
            content.to_string(),
            recipient.to_string(),
        ));
    }
}

pub struct FixedFreeSpace {
    pub free_kb: Mutex<u64>,
}

impl FixedFreeSpace {
    pub fn new(free_kb: u64) -> Self {
        Self {
            free_kb: Mutex::new(free_kb),
        }
    }

    pub fn set(&self, free_kb: u64) {
        *self.free_kb.lock().unwrap() = free_kb;
    }
}

impl FreeSpaceProvider for FixedFreeSpace {
    fn free_space_kb(&self, _path: &Utf8Path) -> Result<u64, DropstoreError> {
        Ok(*self.free_kb.lock().unwrap())
    }
}

type SleepAction = Box<dyn FnOnce() + Send>;

/// Virtual clock: `sleep` advances time instead of blocking and fires actions registered for
/// the time reached.
pub struct MockClock {
    now: Mutex<u64>,
    actions: Mutex<Vec<(u64, SleepAction)>>,
    pub sleeps: Mutex<Vec<Duration>>,
}

impl MockClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: Mutex::new(start_millis),
            actions: Mutex::new(Vec::new()),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, duration: Duration) {
        *self.now.lock().unwrap() += duration.as_millis() as u64;
    }

    /// Runs `action` on the first sleep that ends at or after `start + offset`.
    pub fn at(&self, offset: Duration, action: impl FnOnce() + Send + 'static) {
        let due = START_MILLIS + offset.as_millis() as u64;
        self.actions.lock().unwrap().push((due, Box::new(action)));
    }
}

impl TimeProvider for MockClock {
    fn now_millis(&self) -> u64 {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        let now = {
            let mut now = self.now.lock().unwrap();
            *now += duration.as_millis() as u64;
            *now
        };
        let due = {
            let mut actions = self.actions.lock().unwrap();
            let (due, pending): (Vec<_>, Vec<_>) =
                actions.drain(..).partition(|(at, _)| *at <= now);
            *actions = pending;
            due
        };
        for (_, action) in due {
            action();
        }
    }
}

#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
    }
}

pub struct LogWriter(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter(Arc::clone(&self.0))
    }
}

/// Runs `f` with a formatter that writes INFO and above of the current thread into a string.
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .with_max_level(tracing::Level::INFO)
        .finish();
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, buffer.contents())
}
