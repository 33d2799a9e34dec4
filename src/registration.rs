use std::fmt::Write as _;
use std::fs;
use std::sync::Arc;
use std::time::Instant;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, error, info, warn};

use crate::catalog::CatalogService;
use crate::completeness::ReadyItem;
use crate::domain::{DataSetCode, DataSetDescriptor, NewDataSet};
use crate::error::{DropstoreError, ErrorCategory};
use crate::extraction::{DataSetInfoExtractor, DataSetTypes, TypeExtractor};
use crate::lifecycle::{CommitGate, StopToken};
use crate::services::Notifier;
use crate::storage::{StorageProcessor, StorageTransaction, UnstoreAction};
use crate::store::{StorageStrategy, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Discovered,
    Prepared,
    Identified,
    Unidentified,
    Stored,
    Registered,
    Cleaned,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationOutcome {
    Registered(DataSetCode),
    /// Moved to the unidentified area, or deleted when the target is `None`.
    Unidentified(Option<Utf8PathBuf>),
    RolledBack(UnstoreAction),
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Storing,
    Registering,
}

impl Phase {
    fn failure_message(&self, descriptor: &DataSetDescriptor) -> String {
        match self {
            Phase::Storing => format!("Storing data set '{descriptor}' failed."),
            Phase::Registering => format!("Registration of data set '{descriptor}' failed."),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistratorSettings {
    pub data_store_code: String,
    pub delete_unidentified: bool,
    pub notify_successful_registration: bool,
}

pub struct DataSetRegistrator {
    store: Store,
    settings: RegistratorSettings,
    catalog: Arc<dyn CatalogService>,
    extractor: Arc<dyn DataSetInfoExtractor>,
    types: Arc<dyn TypeExtractor>,
    storage: Arc<dyn StorageProcessor>,
    notifier: Arc<dyn Notifier>,
    gate: Arc<CommitGate>,
    stop: StopToken,
}

impl DataSetRegistrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        settings: RegistratorSettings,
        catalog: Arc<dyn CatalogService>,
        extractor: Arc<dyn DataSetInfoExtractor>,
        types: Arc<dyn TypeExtractor>,
        storage: Arc<dyn StorageProcessor>,
        notifier: Arc<dyn Notifier>,
        stop: StopToken,
    ) -> Self {
        Self {
            store,
            settings,
            catalog,
            extractor,
            types,
            storage,
            notifier,
            gate: Arc::new(CommitGate::new()),
            stop,
        }
    }

    pub fn commit_gate(&self) -> Arc<CommitGate> {
        Arc::clone(&self.gate)
    }

    pub fn stop_token(&self) -> &StopToken {
        &self.stop
    }

    /// Drives one ready item from discovery to a terminal state. Only defects and failures to
    /// identify the item are returned as errors; everything else is handled here.
    pub fn register(&self, item: &ReadyItem) -> Result<RegistrationOutcome, DropstoreError> {
        let incoming = item.incoming();
        let mut state = RegistrationState::Discovered;
        if self.stop.is_stop_requested() {
            return Ok(RegistrationOutcome::Interrupted);
        }

        let (descriptor, types, strategy) = match self.identify(incoming) {
            Ok(identified) => identified,
            Err(err) if err.is_interrupted() => return Ok(RegistrationOutcome::Interrupted),
            Err(err) => {
                if err.category() == ErrorCategory::HighLevel
                    && let Some(email) = self.extractor.uploader_email(incoming)
                {
                    self.notifier.send_message(
                        &format!("Error when trying to identify data set '{incoming}'."),
                        &err.to_string(),
                        &email,
                    );
                }
                return Err(err);
            }
        };

        let base_directory = self.create_base_directory(strategy, &descriptor, incoming)?;
        transition(incoming, &mut state, RegistrationState::Prepared);

        if strategy != StorageStrategy::Identified {
            transition(incoming, &mut state, RegistrationState::Unidentified);
            return self.move_unidentified(item, &descriptor, &base_directory);
        }
        transition(incoming, &mut state, RegistrationState::Identified);

        let mut transaction = self.storage.create_transaction(incoming, &base_directory);
        let marker = self.store.processing_marker(&base_directory);
        let mut phase = Phase::Storing;
        let result = fs::File::create(marker.as_std_path())
            .map_err(|err| {
                DropstoreError::Environment(format!("Cannot create marker file '{marker}': {err}"))
            })
            .and_then(|_| {
                self.store_and_register(
                    item,
                    &descriptor,
                    &types,
                    transaction.as_mut(),
                    &mut phase,
                    &mut state,
                )
            });
        if let Err(err) = fs::remove_file(marker.as_std_path())
            && marker.as_std_path().exists()
        {
            error!(target: "notify", "Removing file '{marker}' failed: {err}");
        }

        match result {
            Ok(()) => {
                self.log_and_notify_success(&descriptor, &types);
                if incoming.as_std_path().exists()
                    && let Err(err) = Store::remove_path(incoming)
                {
                    error!("Cannot delete '{incoming}': {err}");
                }
                transition(incoming, &mut state, RegistrationState::Cleaned);
                Ok(RegistrationOutcome::Registered(descriptor.code.clone()))
            }
            Err(err) => {
                transition(incoming, &mut state, RegistrationState::RolledBack);
                self.rollback(item, &descriptor, transaction.as_mut(), phase, err)
            }
        }
    }

    fn identify(
        &self,
        incoming: &Utf8Path,
    ) -> Result<(DataSetDescriptor, DataSetTypes, StorageStrategy), DropstoreError> {
        let info = self.extractor.extract(incoming)?;
        debug!("Extracted data set information {info:?} from incoming data set path '{incoming}'");
        let code = match info.code.clone() {
            Some(code) => code,
            None => self.catalog.create_data_set_code()?,
        };
        let types = self.types.extract_types(incoming);
        let descriptor = DataSetDescriptor::from_info(info, code, &types.data_set_type);

        if let Some(sample) = &descriptor.sample {
            let experiment = self
                .catalog
                .get_sample(sample)?
                .and_then(|sample| sample.experiment);
            return Ok(match experiment {
                Some(experiment) => (
                    descriptor.with_experiment(experiment.identifier, experiment.registrator_email),
                    types,
                    StorageStrategy::Identified,
                ),
                None => (descriptor, types, StorageStrategy::Unidentified),
            });
        }
        if let Some(identifier) = &descriptor.experiment {
            return Ok(match self.catalog.get_experiment(identifier)? {
                Some(experiment) => (
                    descriptor.with_experiment(experiment.identifier, experiment.registrator_email),
                    types,
                    StorageStrategy::Identified,
                ),
                None => (descriptor, types, StorageStrategy::Unidentified),
            });
        }
        Ok((descriptor, types, StorageStrategy::Unidentified))
    }

    fn create_base_directory(
        &self,
        strategy: StorageStrategy,
        descriptor: &DataSetDescriptor,
        incoming: &Utf8Path,
    ) -> Result<Utf8PathBuf, DropstoreError> {
        let base_directory = strategy.compute_base_directory(self.store.root(), descriptor)?;
        fs::create_dir_all(base_directory.as_std_path()).map_err(|err| {
            DropstoreError::Environment(format!(
                "Creating data set base directory '{base_directory}' for data set '{incoming}' failed: {err}"
            ))
        })?;
        Ok(base_directory)
    }

    fn store_and_register(
        &self,
        item: &ReadyItem,
        descriptor: &DataSetDescriptor,
        types: &DataSetTypes,
        transaction: &mut dyn StorageTransaction,
        phase: &mut Phase,
        state: &mut RegistrationState,
    ) -> Result<(), DropstoreError> {
        let incoming = item.incoming();
        info!("Start storing data set {descriptor}.");
        let started = Instant::now();
        let stored = transaction.store_data(descriptor)?;
        info!(
            "Finished storing data set {descriptor}, took {:?}",
            started.elapsed()
        );
        let location = self.store.relative_location(&stored)?;
        transition(incoming, state, RegistrationState::Stored);

        let new_data_set = NewDataSet {
            code: descriptor.code.clone(),
            data_set_type: types.data_set_type.clone(),
            file_format_type: types.file_format_type.clone(),
            locator_type: types.locator_type.clone(),
            location: location.to_string(),
            storage_format: self.storage.storage_format(),
            is_complete: descriptor.is_complete,
            is_measured: types.is_measured,
            sample: descriptor.sample.clone(),
            experiment: descriptor.experiment.clone(),
            parent_codes: descriptor.parent_codes.clone(),
            producer_code: descriptor.producer_code.clone(),
            production_date: descriptor.production_date,
            data_store_code: self.settings.data_store_code.clone(),
        };

        let _guard = self.gate.enter();
        self.stop.check(descriptor.code.as_str())?;
        *phase = Phase::Registering;
        self.catalog.register_data_set(&new_data_set)?;
        transaction.commit()?;
        transition(incoming, state, RegistrationState::Registered);
        if let Err(err) = item.complete() {
            warn!("Clean up after registering '{incoming}' failed: {err}");
        }
        Ok(())
    }

    fn move_unidentified(
        &self,
        item: &ReadyItem,
        descriptor: &DataSetDescriptor,
        base_directory: &Utf8Path,
    ) -> Result<RegistrationOutcome, DropstoreError> {
        let incoming = item.incoming();
        let target = if self.settings.delete_unidentified {
            Store::remove_path(incoming).map_err(|err| {
                DropstoreError::Filesystem(format!("Cannot delete '{incoming}': {err}"))
            })?;
            info!("Unidentified data set '{incoming}' has been deleted");
            None
        } else {
            let target = Store::move_into_unique(incoming, base_directory)?;
            warn!(target: "notify", "Data set '{incoming}' could not be identified and has been moved to '{target}'");
            Some(target)
        };
        if let Some(email) = &descriptor.registrator_email {
            self.notifier.send_message(
                &format!("Data set '{}' could not be identified", descriptor.code),
                &format!(
                    "No sample or experiment registered for data set {descriptor} uploaded as '{incoming}'."
                ),
                email,
            );
        }
        if let Err(err) = item.complete() {
            warn!("Clean up after moving '{incoming}' failed: {err}");
        }
        Ok(RegistrationOutcome::Unidentified(target))
    }

    fn rollback(
        &self,
        item: &ReadyItem,
        descriptor: &DataSetDescriptor,
        transaction: &mut dyn StorageTransaction,
        phase: Phase,
        err: DropstoreError,
    ) -> Result<RegistrationOutcome, DropstoreError> {
        let incoming = item.incoming();
        if err.is_interrupted() {
            warn!("Requested to stop registration of data set '{descriptor}'");
            transaction.rollback(&err);
            return Ok(RegistrationOutcome::Interrupted);
        }
        error!(target: "notify", "{} {err}", phase.failure_message(descriptor));
        if err.is_defect() {
            return Err(err);
        }

        let action = transaction.rollback(&err);
        match action {
            UnstoreAction::MoveToError => {
                let error_directory =
                    self.create_base_directory(StorageStrategy::Error, descriptor, incoming)?;
                match Store::move_into_unique(incoming, &error_directory) {
                    Ok(target) => {
                        write_exception(&target, incoming, &err);
                        if let Err(err) = item.complete() {
                            warn!("Clean up after moving '{incoming}' to '{target}' failed: {err}");
                        }
                    }
                    Err(move_err) => {
                        error!(target: "notify", "{move_err}");
                        if let Some(name) = incoming.file_name() {
                            write_exception(&error_directory.join(name), incoming, &err);
                        }
                    }
                }
            }
            UnstoreAction::Delete => {
                if incoming.as_std_path().exists()
                    && let Err(delete_err) = Store::remove_path(incoming)
                {
                    error!(target: "notify", "Cannot delete '{incoming}': {delete_err}");
                } else if let Err(err) = item.complete() {
                    warn!("Clean up after deleting '{incoming}' failed: {err}");
                }
            }
            UnstoreAction::LeaveUntouched => {}
        }
        Ok(RegistrationOutcome::RolledBack(action))
    }

    fn log_and_notify_success(&self, descriptor: &DataSetDescriptor, types: &DataSetTypes) {
        let message = success_message(descriptor, types);
        info!("{message}");
        if !self.settings.notify_successful_registration {
            return;
        }
        info!(target: "notify", "{message}");
        if let (Some(email), Some(experiment)) =
            (&descriptor.registrator_email, &descriptor.experiment)
            && !email.trim().is_empty()
        {
            self.notifier.send_message(
                &format!("Success: data set for experiment '{}'", experiment.code),
                &message,
                email,
            );
        }
    }
}

fn transition(incoming: &Utf8Path, state: &mut RegistrationState, next: RegistrationState) {
    debug!("'{incoming}': {:?} -> {next:?}", *state);
    *state = next;
}

fn success_message(descriptor: &DataSetDescriptor, types: &DataSetTypes) -> String {
    let experiment = descriptor
        .experiment
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_default();
    let mut message = match &descriptor.sample {
        Some(sample) => format!(
            "Successfully registered data set '{}' for sample '{sample}', data set type '{}', experiment '{experiment}' with the catalog service.",
            descriptor.code, types.data_set_type
        ),
        None => format!(
            "Successfully registered data set '{}' for experiment '{experiment}' and data set type '{}' with the catalog service.",
            descriptor.code, types.data_set_type
        ),
    };
    message.push_str("\n\n");
    let _ = writeln!(message, "Experiment Identifier:\t{experiment}");
    if let Some(producer) = &descriptor.producer_code {
        let _ = writeln!(message, "Producer Code:\t{producer}");
    }
    if let Some(date) = &descriptor.production_date {
        let _ = writeln!(message, "Production Date:\t{date}");
    }
    if !descriptor.parent_codes.is_empty() {
        let parents = descriptor
            .parent_codes
            .iter()
            .map(DataSetCode::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(message, "Parent Data Sets:\t{parents}");
    }
    let _ = writeln!(message, "Is complete:\t{}", descriptor.is_complete);
    message
}

fn write_exception(target: &Utf8Path, incoming: &Utf8Path, err: &DropstoreError) {
    let Some(name) = incoming.file_name() else {
        return;
    };
    let directory = target.parent().unwrap_or(target);
    let file = directory.join(format!("{name}.exception"));
    let content = format!(
        "{err}\n\ncategory: {:?}\nincoming: {incoming}\ndetail: {err:?}\n",
        err.category()
    );
    if let Err(write_err) = fs::write(file.as_std_path(), content) {
        warn!("Could not write out the exception '{name}.exception' in file '{file}': {write_err}");
    }
}
