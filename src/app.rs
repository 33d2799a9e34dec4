use std::fs;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::archive_db::ArchiveDatabase;
use crate::archiver::{DataSetLocks, MultiDataSetArchiver};
use crate::catalog::{CatalogService, HttpCatalogClient};
use crate::clock::{SystemTimeProvider, TimeProvider};
use crate::completeness::{CompletenessDetector, MarkerFileDetector, QuietPeriodDetector};
use crate::config::{ArchiverSettings, CompletenessSettings, ResolvedConfig, ThreadSettings};
use crate::domain::{
    ArchiveContainer, ArchiveMembership, DataSetCode, ProcessingStatus, Status, StoredDataSet,
};
use crate::error::DropstoreError;
use crate::extraction::{ConfiguredTypeExtractor, FileNameInfoExtractor};
use crate::finalizer::{
    FileCleaner, FinalizationScheduler, ReplicationFinalizer, ThreadFinalizationScheduler,
};
use crate::fs_util::check_fully_accessible;
use crate::lifecycle::{CommitGate, Shutdown, StopToken};
use crate::registration::{DataSetRegistrator, RegistratorSettings};
use crate::scan::{DirectoryScanner, HighWaterMark};
use crate::services::{
    DeletionService, FreeSpaceProvider, FsFreeSpaceProvider, LogNotifier, Notifier,
    StoreDeletionService,
};
use crate::storage::DefaultStorageProcessor;
use crate::store::Store;

const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub threads: Vec<String>,
    pub forced_shutdown: bool,
    pub unfinished_workers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub store_root: String,
    pub threads: Vec<ThreadCheck>,
    pub leftover_processing_markers: Vec<String>,
    pub archive_database: Option<ArchiveDatabaseCheck>,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThreadCheck {
    pub name: String,
    pub incoming_dir: String,
    pub problem: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveDatabaseCheck {
    pub path: String,
    pub schema_version: i64,
    pub containers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainersResult {
    pub containers: Vec<ContainerListing>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerListing {
    #[serde(flatten)]
    pub container: ArchiveContainer,
    pub data_sets: Vec<ArchiveMembership>,
}

/// Wires the configured collaborators into scanners, the archiver and the finalizer.
pub struct App {
    config: ResolvedConfig,
    store: Store,
    catalog: Arc<dyn CatalogService>,
    notifier: Arc<dyn Notifier>,
    free_space: Arc<dyn FreeSpaceProvider>,
    deleter: Arc<dyn DeletionService>,
    locks: Arc<DataSetLocks>,
    clock: Arc<dyn TimeProvider>,
}

impl App {
    pub fn new(
        config: ResolvedConfig,
        catalog: Arc<dyn CatalogService>,
        notifier: Arc<dyn Notifier>,
        free_space: Arc<dyn FreeSpaceProvider>,
        deleter: Arc<dyn DeletionService>,
        clock: Arc<dyn TimeProvider>,
    ) -> Self {
        let store = Store::new(config.store_root.clone());
        Self {
            config,
            store,
            catalog,
            notifier,
            free_space,
            deleter,
            locks: Arc::new(DataSetLocks::new()),
            clock,
        }
    }

    /// Shares data set locks with collaborators built outside the app, such as the deleter.
    pub fn with_locks(mut self, locks: Arc<DataSetLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Production wiring: HTTP catalog, log notifications, file system free space and background
    /// deletion sharing the archiver's locks.
    pub fn from_config(config: ResolvedConfig) -> Result<Self, DropstoreError> {
        let url = config.catalog_url.clone().ok_or_else(|| {
            DropstoreError::Configuration("catalog_url is required for this command".to_string())
        })?;
        let catalog: Arc<dyn CatalogService> = Arc::new(HttpCatalogClient::new(&url)?);
        let clock: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        let locks = Arc::new(DataSetLocks::new());
        let deleter: Arc<dyn DeletionService> = Arc::new(StoreDeletionService::new(
            Store::new(config.store_root.clone()),
            Arc::clone(&locks),
            Arc::clone(&clock),
        ));
        Ok(Self::new(
            config,
            catalog,
            Arc::new(LogNotifier),
            Arc::new(FsFreeSpaceProvider),
            deleter,
            clock,
        )
        .with_locks(locks))
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn build_scanner(
        &self,
        settings: &ThreadSettings,
        stop: &StopToken,
    ) -> Result<(DirectoryScanner, Arc<CommitGate>), DropstoreError> {
        if settings.incoming_dir_create {
            fs::create_dir_all(settings.incoming_dir.as_std_path())
                .map_err(|err| DropstoreError::Filesystem(format!("{}: {err}", settings.incoming_dir)))?;
        }
        if let Some(problem) = check_fully_accessible(settings.incoming_dir.as_std_path(), "incoming directory") {
            return Err(DropstoreError::Environment(format!("Thread '{}': {problem}", settings.name)));
        }

        let detector: Box<dyn CompletenessDetector> = match settings.completeness {
            CompletenessSettings::MarkerFile => Box::new(MarkerFileDetector::new()),
            CompletenessSettings::QuietPeriod(quiet_period) => {
                Box::new(QuietPeriodDetector::new(Arc::clone(&self.clock), quiet_period))
            }
        };
        let registrator = DataSetRegistrator::new(
            self.store.clone(),
            RegistratorSettings {
                data_store_code: self.config.data_store_code.clone(),
                delete_unidentified: settings.delete_unidentified,
                notify_successful_registration: self.config.notify_successful_registration,
            },
            Arc::clone(&self.catalog),
            Arc::new(FileNameInfoExtractor::new(settings.extractor.clone())),
            Arc::new(ConfiguredTypeExtractor::from_settings(settings)),
            Arc::new(DefaultStorageProcessor::new(settings.on_error)),
            Arc::clone(&self.notifier),
            stop.clone(),
        );
        let gate = registrator.commit_gate();
        let scanner = DirectoryScanner::new(
            &settings.name,
            settings.incoming_dir.clone(),
            detector,
            Arc::new(registrator),
            settings.reprocess_faulty_datasets,
            HighWaterMark::new(
                settings.incoming_dir.clone(),
                self.config.highwater_mark_kb,
                Arc::clone(&self.free_space),
            ),
            settings.check_interval,
            Arc::clone(&self.clock),
            stop.clone(),
        )?;
        Ok((scanner, gate))
    }

    /// Runs one scanner thread per watched directory until the shutdown file appears or every
    /// scanner has ended.
    pub fn run(&self, stop: StopToken) -> Result<RunResult, DropstoreError> {
        self.store.ensure_root()?;
        for marker in self.store.leftover_processing_markers()? {
            warn!(target: "notify", "Processing marker '{marker}' left over from an earlier run");
        }

        let mut shutdown = Shutdown::new(stop.clone(), self.config.shutdown_timeout);
        let mut workers: Vec<JoinHandle<Result<(), DropstoreError>>> = Vec::new();
        let mut names = Vec::new();
        let mut scanners = Vec::new();
        for settings in &self.config.threads {
            let (scanner, gate) = self.build_scanner(settings, &stop)?;
            shutdown.watch(gate);
            scanners.push((settings, scanner));
        }
        for (settings, scanner) in scanners {
            let worker = thread::Builder::new()
                .name(settings.name.clone())
                .spawn(move || scanner.run())
                .map_err(|err| {
                    DropstoreError::Environment(format!("cannot start thread '{}': {err}", settings.name))
                })?;
            workers.push(worker);
            names.push(settings.name.clone());
        }
        info!("Started {} scanner thread(s)", workers.len());

        loop {
            if stop.is_stop_requested() {
                break;
            }
            if let Some(shutdown_file) = &self.config.shutdown_file
                && shutdown_file.as_std_path().exists()
            {
                info!("Shutdown file '{shutdown_file}' found");
                if let Err(err) = fs::remove_file(shutdown_file.as_std_path()) {
                    warn!("Could not remove shutdown file '{shutdown_file}': {err}");
                }
                break;
            }
            if workers.iter().all(JoinHandle::is_finished) {
                warn!("All scanner threads have ended");
                break;
            }
            thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }

        let outcome = shutdown.run(workers);
        Ok(RunResult {
            threads: names,
            forced_shutdown: outcome.forced,
            unfinished_workers: outcome.unfinished_workers,
        })
    }

    /// Self-test of the configured environment without touching any data.
    pub fn check(&self) -> Result<CheckResult, DropstoreError> {
        self.store.ensure_root()?;
        let threads = self
            .config
            .threads
            .iter()
            .map(|settings| ThreadCheck {
                name: settings.name.clone(),
                incoming_dir: settings.incoming_dir.to_string(),
                problem: check_fully_accessible(
                    settings.incoming_dir.as_std_path(),
                    "incoming directory",
                ),
            })
            .collect::<Vec<_>>();
        let leftover_processing_markers = self
            .store
            .leftover_processing_markers()?
            .into_iter()
            .map(|marker| marker.to_string())
            .collect::<Vec<_>>();
        let archive_database = match &self.config.archiver {
            Some(settings) => {
                let database = ArchiveDatabase::open(&settings.database_path)?;
                Some(ArchiveDatabaseCheck {
                    path: settings.database_path.to_string(),
                    schema_version: database.schema_version()?,
                    containers: database.query()?.list_containers()?.len(),
                })
            }
            None => None,
        };
        let ok = threads.iter().all(|thread| thread.problem.is_none())
            && leftover_processing_markers.is_empty();
        Ok(CheckResult {
            store_root: self.store.root().to_string(),
            threads,
            leftover_processing_markers,
            archive_database,
            ok,
        })
    }

    pub fn archive(
        &self,
        codes: &[DataSetCode],
        remove_from_store: bool,
        sub_directory: Option<&str>,
    ) -> Result<ProcessingStatus, DropstoreError> {
        let settings = self.archiver_settings()?;
        let mut status = ProcessingStatus::new();
        let data_sets = self.known_data_sets(codes, &mut status)?;
        if data_sets.is_empty() {
            return Ok(status);
        }
        let database = ArchiveDatabase::open(&settings.database_path)?;
        let mut archiver = MultiDataSetArchiver::new(
            settings.clone(),
            self.store.clone(),
            database.clone(),
            Arc::clone(&self.catalog),
            Arc::clone(&self.deleter),
            Arc::clone(&self.free_space),
            Arc::clone(&self.clock),
        )
        .with_locks(Arc::clone(&self.locks));
        let scheduler = settings.replicated_dir.as_ref().map(|_| {
            Arc::new(ThreadFinalizationScheduler::new(Arc::new(ReplicationFinalizer::new(
                settings,
                database,
                Arc::clone(&self.catalog),
                Arc::clone(&self.deleter),
                Arc::new(FileCleaner),
                Arc::clone(&self.clock),
            ))))
        });
        if let Some(scheduler) = &scheduler {
            let scheduler: Arc<dyn FinalizationScheduler> = scheduler.clone();
            archiver = archiver.with_scheduler(scheduler);
        }

        let mut finished = vec![archiver.archive(&data_sets, remove_from_store, sub_directory)];
        if let Some(scheduler) = scheduler {
            finished.extend(scheduler.wait_all());
        }
        self.deleter.wait_all();
        for result in finished {
            for entry in result.entries() {
                status.add(&entry.code, entry.status.clone());
            }
        }
        Ok(status)
    }

    pub fn unarchive(&self, codes: &[DataSetCode]) -> Result<ProcessingStatus, DropstoreError> {
        let settings = self.archiver_settings()?;
        let mut status = ProcessingStatus::new();
        let data_sets = self.known_data_sets(codes, &mut status)?;
        if data_sets.is_empty() {
            return Ok(status);
        }
        let database = ArchiveDatabase::open(&settings.database_path)?;
        let archiver = MultiDataSetArchiver::new(
            settings.clone(),
            self.store.clone(),
            database,
            Arc::clone(&self.catalog),
            Arc::clone(&self.deleter),
            Arc::clone(&self.free_space),
            Arc::clone(&self.clock),
        )
        .with_locks(Arc::clone(&self.locks));
        for entry in archiver.unarchive(&data_sets).entries() {
            status.add(&entry.code, entry.status.clone());
        }
        Ok(status)
    }

    pub fn containers(&self) -> Result<ContainersResult, DropstoreError> {
        let settings = self.archiver_settings()?;
        let query = ArchiveDatabase::open(&settings.database_path)?.query()?;
        let mut containers = Vec::new();
        for container in query.list_containers()? {
            let data_sets = query.list_data_sets_for_container_id(container.id)?;
            containers.push(ContainerListing {
                container,
                data_sets,
            });
        }
        Ok(ContainersResult { containers })
    }

    fn known_data_sets(
        &self,
        codes: &[DataSetCode],
        status: &mut ProcessingStatus,
    ) -> Result<Vec<StoredDataSet>, DropstoreError> {
        let data_sets = self.catalog.list_data_sets(codes)?;
        for code in codes {
            if !data_sets.iter().any(|data_set| data_set.code() == code) {
                let message = format!("Data set '{code}' is unknown to the catalog");
                warn!("{message}");
                status.add(code, Status::Error(message));
            }
        }
        Ok(data_sets)
    }

    fn archiver_settings(&self) -> Result<&ArchiverSettings, DropstoreError> {
        self.config.archiver.as_ref().ok_or_else(|| {
            DropstoreError::Configuration("no archiver section in the configuration".to_string())
        })
    }
}
