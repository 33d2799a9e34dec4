use std::slice;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::Utf8Path;
use tracing::{error, info, warn};

use crate::archiver::DataSetLocks;
use crate::clock::TimeProvider;
use crate::domain::StoredDataSet;
use crate::error::DropstoreError;
use crate::store::Store;

pub trait DeletionService: Send + Sync {
    fn schedule_deletion(
        &self,
        data_sets: &[StoredDataSet],
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<(), DropstoreError>;

    /// Blocks until every scheduled deletion has either succeeded or given up.
    fn wait_all(&self) {}
}

pub trait Notifier: Send + Sync {
    fn send_message(&self, subject: &str, content: &str, recipient: &str);
}

pub trait FreeSpaceProvider: Send + Sync {
    fn free_space_kb(&self, path: &Utf8Path) -> Result<u64, DropstoreError>;
}

/// Deletes store copies in the background, retrying failed deletions. A data set is only
/// touched while its lock is free.
pub struct StoreDeletionService {
    store: Store,
    locks: Arc<DataSetLocks>,
    clock: Arc<dyn TimeProvider>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StoreDeletionService {
    pub fn new(store: Store, locks: Arc<DataSetLocks>, clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            store,
            locks,
            clock,
            workers: Mutex::new(Vec::new()),
        }
    }
}

impl DeletionService for StoreDeletionService {
    fn schedule_deletion(
        &self,
        data_sets: &[StoredDataSet],
        max_retries: u32,
        retry_delay: Duration,
    ) -> Result<(), DropstoreError> {
        let targets = data_sets
            .iter()
            .map(|data_set| (data_set.code().clone(), self.store.resolve(data_set.location())))
            .collect::<Vec<_>>();
        let locks = Arc::clone(&self.locks);
        let clock = Arc::clone(&self.clock);
        let worker = thread::Builder::new()
            .name("data-set-deletion".to_string())
            .spawn(move || {
                for (code, path) in targets {
                    let mut attempt = 0;
                    loop {
                        let removed = {
                            let _guard = locks.lock_all(slice::from_ref(&code));
                            if path.as_std_path().exists() {
                                Store::remove_path(&path).map(|()| true)
                            } else {
                                Ok(false)
                            }
                        };
                        match removed {
                            Ok(true) => {
                                info!("Data set {code} deleted from '{path}'");
                                break;
                            }
                            Ok(false) => break,
                            Err(err) if attempt < max_retries => {
                                attempt += 1;
                                warn!(
                                    "Deleting data set {code} failed ({attempt}. attempt), retrying in {retry_delay:?}: {err}"
                                );
                                clock.sleep(retry_delay);
                            }
                            Err(err) => {
                                error!(target: "notify", "Giving up deleting data set {code} at '{path}': {err}");
                                break;
                            }
                        }
                    }
                }
            })
            .map_err(|err| DropstoreError::Environment(err.to_string()))?;
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(worker);
        Ok(())
    }

    fn wait_all(&self) {
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if worker.join().is_err() {
                error!("A deletion worker panicked");
            }
        }
    }
}

/// Mail delivery is outside this process; messages go to the `notify` log target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_message(&self, subject: &str, content: &str, recipient: &str) {
        info!(target: "notify", "Message to {recipient}: {subject}\n{content}");
    }
}

/// Free space of the file system holding a path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsFreeSpaceProvider;

impl FreeSpaceProvider for FsFreeSpaceProvider {
    fn free_space_kb(&self, path: &Utf8Path) -> Result<u64, DropstoreError> {
        fs2::available_space(path.as_std_path())
            .map(|bytes| bytes / 1024)
            .map_err(|err| {
                DropstoreError::Environment(format!("cannot determine free space of '{path}': {err}"))
            })
    }
}
