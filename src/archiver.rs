use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, error, info, warn};

use crate::archive_db::{ArchiveDatabase, ArchiveTransaction};
use crate::catalog::CatalogService;
use crate::clock::{TimeProvider, format_container_timestamp};
use crate::config::ArchiverSettings;
use crate::domain::{
    ArchiveContainer, ArchivingStatus, ContainerSizeClass, DataSetCode, ProcessingStatus,
    StatusUpdate, StoredDataSet, format_codes,
};
use crate::error::DropstoreError;
use crate::finalizer::{FinalizationRequest, FinalizationScheduler};
use crate::fs_util::{self, ContainerEntry};
use crate::services::{DeletionService, FreeSpaceProvider};
use crate::store::{Store, atomic_rename_dir};

/// Per data set code locks. A caller acquires all of its codes at once, so two packers never
/// hold overlapping sets.
#[derive(Debug, Default)]
pub struct DataSetLocks {
    locked: Mutex<HashSet<DataSetCode>>,
    released: Condvar,
}

impl DataSetLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_all(self: &Arc<Self>, codes: &[DataSetCode]) -> DataSetLockGuard {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        while codes.iter().any(|code| locked.contains(code)) {
            locked = self
                .released
                .wait(locked)
                .unwrap_or_else(PoisonError::into_inner);
        }
        locked.extend(codes.iter().cloned());
        DataSetLockGuard {
            locks: Arc::clone(self),
            codes: codes.to_vec(),
        }
    }

    pub fn is_locked(&self, code: &DataSetCode) -> bool {
        self.locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(code)
    }
}

pub struct DataSetLockGuard {
    locks: Arc<DataSetLocks>,
    codes: Vec<DataSetCode>,
}

impl Drop for DataSetLockGuard {
    fn drop(&mut self) {
        let mut locked = self
            .locks
            .locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for code in &self.codes {
            locked.remove(code);
        }
        self.locks.released.notify_all();
    }
}

/// Packs several small data sets into one tar container, records the membership and hands the
/// container to replication.
pub struct MultiDataSetArchiver {
    settings: ArchiverSettings,
    store: Store,
    database: ArchiveDatabase,
    catalog: Arc<dyn CatalogService>,
    deleter: Arc<dyn DeletionService>,
    free_space: Arc<dyn FreeSpaceProvider>,
    scheduler: Option<Arc<dyn FinalizationScheduler>>,
    locks: Arc<DataSetLocks>,
    clock: Arc<dyn TimeProvider>,
}

struct PackedContainer {
    container: ArchiveContainer,
    file: Utf8PathBuf,
}

impl MultiDataSetArchiver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: ArchiverSettings,
        store: Store,
        database: ArchiveDatabase,
        catalog: Arc<dyn CatalogService>,
        deleter: Arc<dyn DeletionService>,
        free_space: Arc<dyn FreeSpaceProvider>,
        clock: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            settings,
            store,
            database,
            catalog,
            deleter,
            free_space,
            scheduler: None,
            locks: Arc::new(DataSetLocks::new()),
            clock,
        }
    }

    /// Replication is only waited for when a scheduler is present and a replicated directory is
    /// configured.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn FinalizationScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_locks(mut self, locks: Arc<DataSetLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn locks(&self) -> &Arc<DataSetLocks> {
        &self.locks
    }

    pub fn archive(
        &self,
        data_sets: &[StoredDataSet],
        remove_from_store: bool,
        sub_directory: Option<&str>,
    ) -> ProcessingStatus {
        info!(
            "Archiving of the following datasets has been requested: {}",
            describe(data_sets)
        );
        let codes = codes_of(data_sets);
        let mut status = ProcessingStatus::new();
        match self.try_archive(data_sets, remove_from_store, sub_directory) {
            Ok(()) => status.add_ok_all(&codes),
            Err(err) => {
                error!(target: "notify", "Archiving {} failed: {err}", format_codes(&codes));
                status.add_error_all(&codes, &err.to_string());
            }
        }
        status
    }

    fn try_archive(
        &self,
        data_sets: &[StoredDataSet],
        remove_from_store: bool,
        sub_directory: Option<&str>,
    ) -> Result<(), DropstoreError> {
        let all_codes = codes_of(data_sets);
        let final_status = if remove_from_store {
            ArchivingStatus::Archived
        } else {
            ArchivingStatus::Available
        };
        let mut transaction = self.database.begin()?;

        let mut new_data_sets = Vec::new();
        for data_set in data_sets {
            match transaction.get_data_set_for_code(data_set.code())? {
                Some(membership) => debug!(
                    "Data set {} already archived in container {}",
                    data_set.code(),
                    membership.container_id
                ),
                None => new_data_sets.push(data_set.clone()),
            }
        }

        if new_data_sets.is_empty() {
            transaction.close();
            self.catalog
                .update_archiving_status(&StatusUpdate::new(all_codes, final_status, true))?;
            if remove_from_store {
                self.schedule_deletion(data_sets)?;
            }
            return Ok(());
        }

        let new_data_sets = self.with_sizes(new_data_sets)?;
        if let Err(err) = self.check_container_size(&new_data_sets) {
            self.abort(&mut transaction, &all_codes);
            return Err(err);
        }

        let new_codes = codes_of(&new_data_sets);
        self.catalog.update_archiving_status(&StatusUpdate::new(
            new_codes.clone(),
            ArchivingStatus::Available,
            false,
        ))?;

        let packed = {
            let _guard = self.locks.lock_all(&new_codes);
            match self.pack(&mut transaction, &new_data_sets, sub_directory) {
                Ok(packed) => packed,
                Err(err) => {
                    self.abort(&mut transaction, &all_codes);
                    return Err(err);
                }
            }
        };

        let replicated_dir = match (&self.scheduler, &self.settings.replicated_dir) {
            (Some(scheduler), Some(replicated_dir)) => Some((scheduler, replicated_dir)),
            _ => None,
        };
        let Some((scheduler, replicated_dir)) = replicated_dir else {
            self.catalog
                .update_archiving_status(&StatusUpdate::new(all_codes, final_status, true))?;
            if remove_from_store {
                self.schedule_deletion(data_sets)?;
            }
            return Ok(());
        };

        let already_archived = data_sets
            .iter()
            .filter(|data_set| !new_codes.contains(data_set.code()))
            .cloned()
            .collect::<Vec<_>>();
        if !already_archived.is_empty() {
            self.catalog.update_archiving_status(&StatusUpdate::new(
                codes_of(&already_archived),
                final_status,
                true,
            ))?;
            if remove_from_store {
                self.schedule_deletion(&already_archived)?;
            }
        }
        scheduler.schedule(FinalizationRequest {
            original_file: packed.file,
            replicated_file: replicated_dir.join(&packed.container.path),
            container_path: packed.container.path,
            container_id: Some(packed.container.id),
            start_time: self.clock.now(),
            polling_time: self.settings.finalizer_polling_time,
            max_waiting_time: self.settings.finalizer_max_waiting_time,
            status: final_status,
            sub_directory: sub_directory.map(str::to_string),
            data_sets: new_data_sets,
        })
    }

    fn with_sizes(&self, data_sets: Vec<StoredDataSet>) -> Result<Vec<StoredDataSet>, DropstoreError> {
        let mut sized = Vec::with_capacity(data_sets.len());
        for mut data_set in data_sets {
            if data_set.size.is_none() {
                let path = self.store.resolve(data_set.location());
                let size = fs_util::path_size(path.as_std_path()).map_err(|err| {
                    DropstoreError::Filesystem(format!(
                        "cannot determine size of data set {} at '{path}': {err}",
                        data_set.code()
                    ))
                })?;
                self.catalog.update_data_set_size(data_set.code(), size)?;
                data_set.size = Some(size);
            }
            sized.push(data_set);
        }
        Ok(sized)
    }

    fn check_container_size(&self, data_sets: &[StoredDataSet]) -> Result<(), DropstoreError> {
        let total = data_sets
            .iter()
            .map(|data_set| data_set.size.unwrap_or(0))
            .sum::<u64>();
        let minimum = self.settings.minimum_container_size;
        let maximum = self.settings.maximum_container_size;
        match ContainerSizeClass::classify(total, minimum, maximum) {
            ContainerSizeClass::Ok => Ok(()),
            ContainerSizeClass::TooSmall => Err(DropstoreError::UserFailure(format!(
                "Set of data sets specified for archiving is too small ({total} bytes) to be archived \
                 with multi dataset archiver because minimum size is {minimum} bytes."
            ))),
            ContainerSizeClass::TooBig => Err(DropstoreError::UserFailure(format!(
                "Set of data sets specified for archiving is too big ({total} bytes) to be archived \
                 with multi dataset archiver because maximum size is {} bytes.",
                maximum.unwrap_or_default()
            ))),
        }
    }

    fn pack(
        &self,
        transaction: &mut ArchiveTransaction,
        data_sets: &[StoredDataSet],
        sub_directory: Option<&str>,
    ) -> Result<PackedContainer, DropstoreError> {
        let first = data_sets
            .first()
            .ok_or_else(|| DropstoreError::Defect("nothing to pack".to_string()))?;
        let name = format!(
            "{}-{}.{}",
            first.code(),
            format_container_timestamp(&self.clock.now()),
            self.settings.container_extension
        );
        let container_path = match sub_directory {
            Some(sub_directory) => format!("{sub_directory}/{name}"),
            None => name.clone(),
        };
        let staged = self.settings.staging_dir.join(&name);
        let final_file = self.settings.final_dir.join(&container_path);

        let result = self.write_and_record(
            transaction,
            data_sets,
            &name,
            &container_path,
            &staged,
            &final_file,
        );
        let _ = fs::remove_file(staged.as_std_path());
        match result {
            Ok(container) => Ok(PackedContainer {
                container,
                file: final_file,
            }),
            Err(err) => {
                if let Err(remove_err) = fs::remove_file(final_file.as_std_path())
                    && remove_err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!("Could not remove '{final_file}': {remove_err}");
                }
                Err(err)
            }
        }
    }

    fn write_and_record(
        &self,
        transaction: &mut ArchiveTransaction,
        data_sets: &[StoredDataSet],
        name: &str,
        container_path: &str,
        staged: &Utf8Path,
        final_file: &Utf8Path,
    ) -> Result<ArchiveContainer, DropstoreError> {
        let sources = data_sets
            .iter()
            .map(|data_set| self.store.resolve(data_set.location()))
            .collect::<Vec<_>>();
        let entries = data_sets
            .iter()
            .zip(&sources)
            .map(|(data_set, source)| {
                info!("Archive dataset {} in {name}", data_set.code());
                ContainerEntry {
                    code: data_set.code().as_str(),
                    source: source.as_path(),
                    meta_data: meta_data_tsv(data_set),
                }
            })
            .collect::<Vec<_>>();
        fs_util::write_container(staged, &entries).map_err(|err| {
            error!("Packing {name} failed: {err}");
            DropstoreError::Environment(format!("Couldn't create package file in stage archive {name}"))
        })?;
        info!("Data sets archived: {name}");

        let final_dir = final_file.parent().unwrap_or(self.settings.final_dir.as_path());
        info!("Copy archive container from '{staged}' to '{final_dir}'");
        let started = Instant::now();
        Store::copy_file_atomic(staged, final_file).map_err(|err| {
            DropstoreError::Environment(format!(
                "Couldn't copy archive container {name} to '{final_dir}': {err}"
            ))
        })?;
        info!("Copying archive container took {:?}", started.elapsed());

        if self.settings.sanity_check {
            self.sanity_check(final_file, data_sets)?;
        }

        let container = transaction.create_container(container_path)?;
        for data_set in data_sets {
            transaction.insert_dataset(data_set.code(), data_set.size.unwrap_or(0), &container)?;
        }
        transaction.commit()?;
        Ok(container)
    }

    fn sanity_check(&self, container: &Utf8Path, data_sets: &[StoredDataSet]) -> Result<(), DropstoreError> {
        info!("Start sanity check on {}", describe(data_sets));
        let payload = fs_util::container_payload_sizes(container)?;
        for data_set in data_sets {
            let source = self.store.resolve(data_set.location());
            let expected = fs_util::path_size(source.as_std_path())
                .map_err(|err| DropstoreError::Filesystem(format!("{source}: {err}")))?;
            let packed = payload.get(data_set.code().as_str()).copied().unwrap_or(0);
            if packed != expected {
                return Err(DropstoreError::Environment(format!(
                    "Sanity check for data set {} failed: {packed} bytes in container '{container}', \
                     {expected} bytes in store",
                    data_set.code()
                )));
            }
        }
        info!("Sanity check finished.");
        Ok(())
    }

    fn abort(&self, transaction: &mut ArchiveTransaction, codes: &[DataSetCode]) {
        if let Err(err) = transaction.rollback() {
            warn!("Rolling back archive transaction failed: {err}");
        }
        transaction.close();
        if let Err(err) = self.catalog.update_archiving_status(&StatusUpdate::new(
            codes.to_vec(),
            ArchivingStatus::Available,
            false,
        )) {
            error!(target: "notify", "Could not reset archiving status of {}: {err}", format_codes(codes));
        }
    }

    fn schedule_deletion(&self, data_sets: &[StoredDataSet]) -> Result<(), DropstoreError> {
        self.deleter.schedule_deletion(
            data_sets,
            self.settings.deletion_max_retries,
            self.settings.deletion_retry_delay,
        )
    }

    pub fn unarchive(&self, data_sets: &[StoredDataSet]) -> ProcessingStatus {
        info!(
            "Unarchiving of the following datasets has been requested: {}",
            describe(data_sets)
        );
        let codes = codes_of(data_sets);
        let mut status = ProcessingStatus::new();
        match self.try_unarchive(&codes) {
            Ok(()) => status.add_ok_all(&codes),
            Err(err) => {
                let message = format!("Unarchiving failed: {err}");
                error!(target: "notify", "{message}");
                status.add_error_all(&codes, &message);
            }
        }
        status
    }

    fn try_unarchive(&self, requested: &[DataSetCode]) -> Result<(), DropstoreError> {
        let codes = self.data_set_codes_for_unarchiving(requested)?;
        let Some(first) = codes.first() else {
            return Ok(());
        };
        let query = self.database.query()?;
        let membership = query.get_data_set_for_code(first)?.ok_or_else(|| {
            DropstoreError::UserFailure(format!("Data set {first} is not archived in any container"))
        })?;
        let container = query
            .get_container_for_id(membership.container_id)?
            .ok_or_else(|| {
                DropstoreError::ArchiveDb(format!("container {} is missing", membership.container_id))
            })?;
        let sizes = query
            .list_data_sets_for_container_id(container.id)?
            .into_iter()
            .map(|membership| (membership.code, membership.size_in_bytes))
            .collect::<BTreeMap<_, _>>();
        let data_sets = self.catalog.list_data_sets(&codes)?;

        let _guard = self.locks.lock_all(&codes);
        let requested_size = data_sets
            .iter()
            .map(|data_set| {
                data_set
                    .size
                    .or_else(|| sizes.get(data_set.code()).copied())
                    .unwrap_or(0)
            })
            .sum::<u64>();
        self.check_free_space(requested_size, data_sets.len())?;

        let container_file = self.settings.final_dir.join(&container.path);
        for data_set in &data_sets {
            self.restore(&container_file, data_set)?;
            self.catalog.notify_data_set_access(data_set.code())?;
        }
        self.catalog
            .update_archiving_status(&StatusUpdate::new(codes, ArchivingStatus::Available, true))
    }

    fn check_free_space(&self, requested: u64, count: usize) -> Result<(), DropstoreError> {
        let share = self
            .settings
            .unarchiving_scratch_dir
            .clone()
            .unwrap_or_else(|| self.store.root().to_path_buf());
        let free_kb = self.free_space.free_space_kb(&share)?;
        let free = free_kb
            .saturating_mul(1024)
            .saturating_sub(self.settings.minimum_free_scratch_space);
        info!(
            "Free space on unarchiving scratch share '{share}': {}, requested space for unarchiving {count} data sets: {}",
            fs_util::byte_count_to_display_size(free),
            fs_util::byte_count_to_display_size(requested)
        );
        if free < requested {
            return Err(DropstoreError::Environment(format!(
                "Not enough free space on unarchiving scratch share '{share}': {} available, {} requested",
                fs_util::byte_count_to_display_size(free),
                fs_util::byte_count_to_display_size(requested)
            )));
        }
        Ok(())
    }

    fn restore(&self, container_file: &Utf8Path, data_set: &StoredDataSet) -> Result<(), DropstoreError> {
        let target = self.store.resolve(data_set.location());
        let parent = target.parent().unwrap_or(self.store.root());
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| DropstoreError::Filesystem(format!("{parent}: {err}")))?;
        let scratch = tempfile::Builder::new()
            .prefix(".unarchive-")
            .tempdir_in(parent.as_std_path())
            .map_err(|err| DropstoreError::Filesystem(format!("{parent}: {err}")))?;
        let scratch_path = Utf8PathBuf::from_path_buf(scratch.path().to_path_buf())
            .map_err(|path| DropstoreError::Filesystem(format!("non UTF-8 path {}", path.display())))?;
        let bytes = fs_util::extract_container_member(container_file, data_set.code().as_str(), &scratch_path)?;
        atomic_rename_dir(scratch.keep().as_path(), target.as_std_path())
            .map_err(|err| DropstoreError::Filesystem(format!("restore {target}: {err}")))?;
        info!("Data set {} restored to '{target}' ({bytes} bytes)", data_set.code());
        Ok(())
    }

    /// All codes that have to be restored together with `codes`: the full membership of the one
    /// container they belong to.
    pub fn data_set_codes_for_unarchiving(
        &self,
        codes: &[DataSetCode],
    ) -> Result<Vec<DataSetCode>, DropstoreError> {
        if codes.is_empty() {
            return Ok(Vec::new());
        }
        let query = self.database.query()?;
        let mut containers: BTreeMap<i64, Vec<DataSetCode>> = BTreeMap::new();
        for code in codes {
            let membership = query.get_data_set_for_code(code)?.ok_or_else(|| {
                DropstoreError::UserFailure(format!("Data set {code} is not archived in any container"))
            })?;
            containers
                .entry(membership.container_id)
                .or_default()
                .push(code.clone());
        }
        if containers.len() > 1 {
            let listing = containers
                .iter()
                .map(|(id, codes)| format!("{id}={}", format_codes(codes)))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(DropstoreError::UserFailure(format!(
                "Datasets selected for unarchiving do not all belong to one container, but to {} different containers: {{{listing}}}",
                containers.len()
            )));
        }
        let Some((&container_id, _)) = containers.iter().next() else {
            return Ok(Vec::new());
        };
        Ok(query
            .list_data_sets_for_container_id(container_id)?
            .into_iter()
            .map(|membership| membership.code)
            .collect())
    }
}

fn codes_of(data_sets: &[StoredDataSet]) -> Vec<DataSetCode> {
    data_sets
        .iter()
        .map(|data_set| data_set.code().clone())
        .collect()
}

fn describe(data_sets: &[StoredDataSet]) -> String {
    let joined = data_sets
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{joined}]")
}

/// Tab separated `section key value` rows describing one packed data set.
pub fn meta_data_tsv(data_set: &StoredDataSet) -> String {
    let descriptor = &data_set.descriptor;
    let registration = &data_set.registration;
    let mut rows: Vec<(&str, &str, String)> = vec![
        ("data_set", "code", descriptor.code.to_string()),
        (
            "data_set",
            "production_timestamp",
            descriptor
                .production_date
                .map(|date| date.to_rfc3339())
                .unwrap_or_default(),
        ),
        (
            "data_set",
            "producer_code",
            descriptor.producer_code.clone().unwrap_or_default(),
        ),
        ("data_set", "data_set_type", descriptor.data_set_type.clone()),
        (
            "data_set",
            "is_measured",
            registration.is_measured.to_string().to_uppercase(),
        ),
        ("data_set", "is_complete", descriptor.is_complete.to_string()),
        (
            "data_set",
            "parent_codes",
            descriptor
                .parent_codes
                .iter()
                .map(DataSetCode::as_str)
                .collect::<Vec<_>>()
                .join(","),
        ),
    ];
    if let Some(sample) = &descriptor.sample {
        rows.push(("sample", "sample_identifier", sample.to_string()));
    }
    if let Some(experiment) = &descriptor.experiment {
        rows.push(("experiment", "space_code", experiment.space.clone()));
        rows.push(("experiment", "project_code", experiment.project.clone()));
        rows.push(("experiment", "experiment_code", experiment.code.clone()));
        rows.push((
            "experiment",
            "experiment_type_code",
            registration.experiment_type_code.clone().unwrap_or_default(),
        ));
        rows.push((
            "experiment",
            "registration_timestamp",
            registration
                .registration_timestamp
                .map(|timestamp| timestamp.to_rfc3339())
                .unwrap_or_default(),
        ));
        rows.push((
            "experiment",
            "registrator",
            registration.registrator.clone().unwrap_or_default(),
        ));
    }
    let mut tsv = String::new();
    for (section, key, value) in rows {
        tsv.push_str(&format!("{section}\t{key}\t{value}\n"));
    }
    tsv
}
