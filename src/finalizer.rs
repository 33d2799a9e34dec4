use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::archive_db::{ArchiveDatabase, ContainerRef};
use crate::catalog::CatalogService;
use crate::clock::TimeProvider;
use crate::config::ArchiverSettings;
use crate::domain::{
    ArchivingStatus, DataSetCode, ProcessingStatus, StatusUpdate, StoredDataSet, format_codes,
};
use crate::error::DropstoreError;
use crate::services::DeletionService;
use crate::store::Store;

pub const SUB_DIRECTORY_OPTION: &str = "sub-directory";

/// Everything a finalizer run needs to know about one freshly written container.
#[derive(Debug, Clone)]
pub struct FinalizationRequest {
    /// Container path as recorded in the archive database, relative to the final directory.
    pub container_path: String,
    pub original_file: Utf8PathBuf,
    pub replicated_file: Utf8PathBuf,
    pub container_id: Option<i64>,
    pub start_time: DateTime<Utc>,
    pub polling_time: Duration,
    pub max_waiting_time: Duration,
    pub status: ArchivingStatus,
    pub sub_directory: Option<String>,
    pub data_sets: Vec<StoredDataSet>,
}

impl FinalizationRequest {
    pub fn codes(&self) -> Vec<DataSetCode> {
        self.data_sets
            .iter()
            .map(|data_set| data_set.code().clone())
            .collect()
    }

    pub fn parameters(&self) -> BTreeMap<&'static str, String> {
        let mut parameters = BTreeMap::new();
        parameters.insert("container-path", self.container_path.clone());
        parameters.insert("original-file-path", self.original_file.to_string());
        parameters.insert("replicated-file-path", self.replicated_file.to_string());
        parameters.insert(
            "start-time",
            self.start_time.format("%Y-%m-%d %H:%M:%S").to_string(),
        );
        parameters.insert(
            "finalizer-polling-time",
            self.polling_time.as_millis().to_string(),
        );
        parameters.insert(
            "finalizer-max-waiting-time",
            self.max_waiting_time.as_millis().to_string(),
        );
        parameters.insert("status", self.status.to_string());
        if let Some(sub_directory) = &self.sub_directory {
            parameters.insert(SUB_DIRECTORY_OPTION, sub_directory.clone());
        }
        if let Some(id) = self.container_id {
            parameters.insert("container-id", id.to_string());
        }
        parameters
    }

    pub fn format_parameters(&self) -> String {
        let joined = self
            .parameters()
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!("{{{joined}}}")
    }
}

/// Removes archive files that must not outlive a failed replication.
pub trait ArchiveCleaner: Send + Sync {
    fn delete(&self, path: &Utf8Path);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FileCleaner;

impl ArchiveCleaner for FileCleaner {
    fn delete(&self, path: &Utf8Path) {
        match Store::remove_path(path) {
            Ok(()) => info!("Deleted '{path}'"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("'{path}' already gone");
            }
            Err(err) => warn!(target: "notify", "Could not delete '{path}': {err}"),
        }
    }
}

/// Hands finished containers to the finalizer.
pub trait FinalizationScheduler: Send + Sync {
    fn schedule(&self, request: FinalizationRequest) -> Result<(), DropstoreError>;
}

/// Runs every finalization on its own worker thread; the wait loop blocks that worker.
pub struct ThreadFinalizationScheduler {
    finalizer: Arc<ReplicationFinalizer>,
    workers: Mutex<Vec<JoinHandle<ProcessingStatus>>>,
}

impl ThreadFinalizationScheduler {
    pub fn new(finalizer: Arc<ReplicationFinalizer>) -> Self {
        Self {
            finalizer,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Blocks until every scheduled run has finished and returns their statuses.
    pub fn wait_all(&self) -> Vec<ProcessingStatus> {
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let mut statuses = Vec::new();
        for worker in workers {
            match worker.join() {
                Ok(status) => statuses.push(status),
                Err(_) => error!("A finalizer worker panicked"),
            }
        }
        statuses
    }
}

impl FinalizationScheduler for ThreadFinalizationScheduler {
    fn schedule(&self, request: FinalizationRequest) -> Result<(), DropstoreError> {
        let finalizer = Arc::clone(&self.finalizer);
        let worker = thread::Builder::new()
            .name(format!("finalizer-{}", request.container_path))
            .spawn(move || finalizer.finalize(&request))
            .map_err(|err| DropstoreError::Environment(format!("cannot start finalizer: {err}")))?;
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(worker);
        Ok(())
    }
}

/// Confirms that a container reached the replicated area before data sets count as archived.
pub struct ReplicationFinalizer {
    database: ArchiveDatabase,
    catalog: Arc<dyn CatalogService>,
    deleter: Arc<dyn DeletionService>,
    cleaner: Arc<dyn ArchiveCleaner>,
    clock: Arc<dyn TimeProvider>,
    pause_file: Option<Utf8PathBuf>,
    deletion_max_retries: u32,
    deletion_retry_delay: Duration,
}

impl ReplicationFinalizer {
    pub fn new(
        settings: &ArchiverSettings,
        database: ArchiveDatabase,
        catalog: Arc<dyn CatalogService>,
        deleter: Arc<dyn DeletionService>,
        cleaner: Arc<dyn ArchiveCleaner>,
        clock: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            database,
            catalog,
            deleter,
            cleaner,
            clock,
            pause_file: settings.pause_file.clone(),
            deletion_max_retries: settings.deletion_max_retries,
            deletion_retry_delay: settings.deletion_retry_delay,
        }
    }

    pub fn finalize(&self, request: &FinalizationRequest) -> ProcessingStatus {
        info!("Parameters: {}", request.format_parameters());
        let codes = request.codes();
        let mut status = ProcessingStatus::new();
        let original = &request.original_file;

        if !original.as_std_path().exists() {
            let message =
                format!("Replication of '{original}' failed because the original file does not exist.");
            error!("{message}");
            self.handle_failure(request);
            status.add_error_all(&codes, &message);
            return status;
        }

        if let Err(reason) = self.verify_container(request) {
            warn!("{reason}");
            return self.fail(request, status);
        }

        info!(
            "Waiting for replication of archive '{original}' containing the following data sets: {}",
            format_codes(&codes)
        );
        if !self.wait_for_replication(request) {
            return self.fail(request, status);
        }

        match self.confirm(request) {
            Ok(()) => status.add_ok_all(&codes),
            Err(err) => {
                error!(target: "notify", "Finalizing '{original}' failed: {err}");
                status.add_error_all(&codes, &err.to_string());
            }
        }
        status
    }

    fn fail(&self, request: &FinalizationRequest, mut status: ProcessingStatus) -> ProcessingStatus {
        let message = format!("Replication of '{}' failed.", request.original_file);
        error!("{message}");
        self.handle_failure(request);
        status.add_error_all(&request.codes(), &message);
        status
    }

    fn verify_container(&self, request: &FinalizationRequest) -> Result<(), String> {
        let Some(id) = request.container_id else {
            return Ok(());
        };
        let query = self.database.query().map_err(|err| err.to_string())?;
        let container = query
            .get_container_for_id(id)
            .map_err(|err| err.to_string())?
            .ok_or_else(|| {
                format!("No container found in Multi Data Set Archive database with container ID {id}.")
            })?;
        if !request.original_file.as_str().ends_with(&container.path) {
            return Err(format!(
                "Archive file '{}' doesn't end with '{}'.",
                request.original_file, container.path
            ));
        }

        let mut recorded = query
            .list_data_sets_for_container_id(id)
            .map_err(|err| err.to_string())?
            .into_iter()
            .map(|membership| membership.code)
            .collect::<Vec<_>>();
        let mut provided = request.codes();
        recorded.sort();
        provided.sort();
        if recorded != provided {
            return Err(format!(
                "Data sets in Multi Data Set Archive database are different from provided data sets: \
                 Provided data sets: {}. Data sets in Multi Data Set Archive database: {}",
                format_codes(&provided),
                format_codes(&recorded)
            ));
        }
        Ok(())
    }

    /// Polls until the replica has as many bytes as the original. Time spent while the pause
    /// file exists is not charged against the maximum waiting time.
    fn wait_for_replication(&self, request: &FinalizationRequest) -> bool {
        let original = &request.original_file;
        let replica = &request.replicated_file;
        let expected = match fs::metadata(original.as_std_path()) {
            Ok(metadata) => metadata.len(),
            Err(err) => {
                warn!("Cannot read size of '{original}': {err}");
                return false;
            }
        };
        let max_waiting = request.max_waiting_time.as_millis() as u64;
        let started = self.clock.now_millis();
        let mut paused_total = 0u64;
        let mut paused_since: Option<u64> = None;
        let mut polls = 0u32;

        loop {
            let now = self.clock.now_millis();
            if let Some(pause_file) = self.pause_file_present() {
                if paused_since.is_none() {
                    info!(
                        "Condition still not fulfilled after {}, condition: Pause file '{pause_file}' is present. \
                         The following action is paused: Waiting for replicated file {replica}",
                        format_elapsed(now.saturating_sub(started + paused_total))
                    );
                    paused_since = Some(now);
                }
                self.clock.sleep(request.polling_time);
                continue;
            }
            if let Some(since) = paused_since.take() {
                let paused = now.saturating_sub(since);
                paused_total += paused;
                info!(
                    "Condition fulfilled after {}, condition: Pause file '{}' has been removed. \
                     The following action continues: Waiting for replicated file {replica}",
                    format_elapsed(paused),
                    self.pause_file.as_deref().map(Utf8Path::as_str).unwrap_or_default()
                );
            }

            let elapsed = now.saturating_sub(started + paused_total);
            let replicated = fs::metadata(replica.as_std_path()).ok().map(|metadata| metadata.len());
            let condition = format!(
                "{} bytes of {expected} bytes are replicated for {original}",
                replicated.unwrap_or(0)
            );
            if replicated == Some(expected) {
                info!("Condition fulfilled after {}, condition: {condition}", format_elapsed(elapsed));
                return true;
            }
            if polls == 0 || elapsed >= max_waiting {
                info!(
                    "Condition still not fulfilled after {}, condition: {condition}",
                    format_elapsed(elapsed)
                );
            } else {
                debug!(
                    "Condition still not fulfilled after {}, condition: {condition}",
                    format_elapsed(elapsed)
                );
            }
            if elapsed >= max_waiting {
                return false;
            }
            polls += 1;
            self.clock.sleep(request.polling_time);
        }
    }

    fn pause_file_present(&self) -> Option<&Utf8Path> {
        self.pause_file
            .as_deref()
            .filter(|pause_file| pause_file.as_std_path().exists())
    }

    fn confirm(&self, request: &FinalizationRequest) -> Result<(), DropstoreError> {
        if request.status == ArchivingStatus::Archived {
            self.deleter.schedule_deletion(
                &request.data_sets,
                self.deletion_max_retries,
                self.deletion_retry_delay,
            )?;
        }
        self.catalog
            .update_archiving_status(&StatusUpdate::new(request.codes(), request.status, true))
    }

    fn handle_failure(&self, request: &FinalizationRequest) {
        let codes = request.codes();
        if let Err(err) = self.remove_container_row(request) {
            error!(target: "notify", "Could not remove container '{}' from the archive database: {err}", request.container_path);
        }
        if let Err(err) = self.catalog.update_archiving_status(&StatusUpdate::new(
            codes.clone(),
            ArchivingStatus::Available,
            false,
        )) {
            error!(target: "notify", "Could not reset archiving status of {}: {err}", format_codes(&codes));
        }

        let mut options = BTreeMap::new();
        if let Some(sub_directory) = &request.sub_directory {
            options.insert(SUB_DIRECTORY_OPTION.to_string(), sub_directory.clone());
        }
        let remove_from_store = request.status == ArchivingStatus::Archived;
        if let Err(err) = self
            .catalog
            .archive_data_sets(&codes, remove_from_store, &options)
        {
            error!(target: "notify", "Could not request archiving of {} again: {err}", format_codes(&codes));
        }

        self.cleaner.delete(&request.original_file);
        self.cleaner.delete(&request.replicated_file);
    }

    fn remove_container_row(&self, request: &FinalizationRequest) -> Result<(), DropstoreError> {
        let mut transaction = self.database.begin()?;
        let container = match request.container_id {
            Some(id) => ContainerRef::Id(id),
            None => ContainerRef::Path(&request.container_path),
        };
        if transaction.delete_container(container)? {
            info!("Removed container '{}' from the archive database", request.container_path);
        }
        transaction.commit()
    }
}

fn format_elapsed(millis: u64) -> String {
    let seconds = millis / 1000;
    if seconds == 0 {
        return "< 1sec".to_string();
    }
    if seconds < 60 {
        return format!("{seconds}sec");
    }
    let minutes = seconds / 60;
    if minutes < 60 {
        return match seconds % 60 {
            0 => format!("{minutes}min"),
            rest => format!("{minutes}min {rest}sec"),
        };
    }
    match minutes % 60 {
        0 => format!("{}h", minutes / 60),
        rest => format!("{}h {rest}min", minutes / 60),
    }
}
