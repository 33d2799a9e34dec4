use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::DropstoreError;
use crate::storage::UnstoreAction;

pub const CONFIG_FILE_NAME: &str = "dropstore.json";

const DEFAULT_QUIET_PERIOD_MS: u64 = 300_000;
const DEFAULT_CHECK_INTERVAL_MS: u64 = 60_000;
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_POLLING_TIME_MS: u64 = 20_000;
const DEFAULT_MAX_WAITING_TIME_MS: u64 = 300_000;
const DEFAULT_DELETION_MAX_RETRIES: u32 = 11;
const DEFAULT_DELETION_RETRY_DELAY_S: u64 = 300;
const DEFAULT_MINIMUM_FREE_SCRATCH_SPACE: u64 = 1024 * 1024 * 1024;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub data_store_code: Option<String>,
    #[serde(default)]
    pub store_root: Option<String>,
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default)]
    pub highwater_mark_kb: Option<u64>,
    #[serde(default)]
    pub notify_successful_registration: bool,
    #[serde(default)]
    pub shutdown_timeout_ms: Option<u64>,
    #[serde(default)]
    pub shutdown_file: Option<String>,
    #[serde(default)]
    pub threads: Vec<ThreadEntry>,
    #[serde(default)]
    pub archiver: Option<ArchiverEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletenessCondition {
    MarkerFile,
    AutoDetection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ThreadEntry {
    #[serde(default)]
    pub name: Option<String>,
    pub incoming_dir: String,
    #[serde(default)]
    pub incoming_dir_create: bool,
    #[serde(default)]
    pub completeness: Option<CompletenessCondition>,
    #[serde(default)]
    pub quiet_period_ms: Option<u64>,
    #[serde(default)]
    pub check_interval_ms: Option<u64>,
    #[serde(default)]
    pub delete_unidentified: bool,
    #[serde(default)]
    pub reprocess_faulty_datasets: bool,
    #[serde(default)]
    pub on_error: Option<UnstoreAction>,
    #[serde(default)]
    pub data_set_type: Option<String>,
    #[serde(default)]
    pub file_format_type: Option<String>,
    #[serde(default)]
    pub locator_type: Option<String>,
    #[serde(default)]
    pub extractor: ExtractorEntry,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ExtractorEntry {
    #[serde(default)]
    pub entity_separator: Option<String>,
    #[serde(default)]
    pub index_of_sample_code: Option<i32>,
    #[serde(default)]
    pub index_of_data_set_code: Option<i32>,
    #[serde(default)]
    pub index_of_parent_data_set_codes: Option<i32>,
    #[serde(default)]
    pub index_of_producer_code: Option<i32>,
    #[serde(default)]
    pub space_code: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ArchiverEntry {
    pub database_path: String,
    pub staging_dir: String,
    pub final_dir: String,
    #[serde(default)]
    pub replicated_dir: Option<String>,
    #[serde(default)]
    pub minimum_container_size_bytes: Option<u64>,
    #[serde(default)]
    pub maximum_container_size_bytes: Option<u64>,
    #[serde(default)]
    pub container_extension: Option<String>,
    #[serde(default)]
    pub sanity_check: Option<bool>,
    #[serde(default)]
    pub pause_file: Option<String>,
    #[serde(default)]
    pub finalizer_polling_time_ms: Option<u64>,
    #[serde(default)]
    pub finalizer_max_waiting_time_ms: Option<u64>,
    #[serde(default)]
    pub deletion_max_retries: Option<u32>,
    #[serde(default)]
    pub deletion_retry_delay_s: Option<u64>,
    #[serde(default)]
    pub unarchiving_scratch_dir: Option<String>,
    #[serde(default)]
    pub minimum_free_scratch_space_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractorSettings {
    pub entity_separator: String,
    pub index_of_sample_code: i32,
    pub index_of_data_set_code: Option<i32>,
    pub index_of_parent_data_set_codes: Option<i32>,
    pub index_of_producer_code: Option<i32>,
    pub space_code: String,
}

impl Default for ExtractorSettings {
    fn default() -> Self {
        Self {
            entity_separator: "_".to_string(),
            index_of_sample_code: 0,
            index_of_data_set_code: None,
            index_of_parent_data_set_codes: None,
            index_of_producer_code: None,
            space_code: "DEFAULT".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletenessSettings {
    MarkerFile,
    QuietPeriod(Duration),
}

#[derive(Debug, Clone)]
pub struct ThreadSettings {
    pub name: String,
    pub incoming_dir: Utf8PathBuf,
    pub incoming_dir_create: bool,
    pub completeness: CompletenessSettings,
    pub check_interval: Duration,
    pub delete_unidentified: bool,
    pub reprocess_faulty_datasets: bool,
    pub on_error: UnstoreAction,
    pub data_set_type: String,
    pub file_format_type: String,
    pub locator_type: String,
    pub extractor: ExtractorSettings,
}

#[derive(Debug, Clone)]
pub struct ArchiverSettings {
    pub database_path: Utf8PathBuf,
    pub staging_dir: Utf8PathBuf,
    pub final_dir: Utf8PathBuf,
    pub replicated_dir: Option<Utf8PathBuf>,
    pub minimum_container_size: u64,
    pub maximum_container_size: Option<u64>,
    pub container_extension: String,
    pub sanity_check: bool,
    pub pause_file: Option<Utf8PathBuf>,
    pub finalizer_polling_time: Duration,
    pub finalizer_max_waiting_time: Duration,
    pub deletion_max_retries: u32,
    pub deletion_retry_delay: Duration,
    pub unarchiving_scratch_dir: Option<Utf8PathBuf>,
    pub minimum_free_scratch_space: u64,
}

impl ArchiverSettings {
    pub fn new(
        database_path: Utf8PathBuf,
        staging_dir: Utf8PathBuf,
        final_dir: Utf8PathBuf,
    ) -> Self {
        Self {
            database_path,
            staging_dir,
            final_dir,
            replicated_dir: None,
            minimum_container_size: 0,
            maximum_container_size: None,
            container_extension: "tar".to_string(),
            sanity_check: true,
            pause_file: None,
            finalizer_polling_time: Duration::from_millis(DEFAULT_POLLING_TIME_MS),
            finalizer_max_waiting_time: Duration::from_millis(DEFAULT_MAX_WAITING_TIME_MS),
            deletion_max_retries: DEFAULT_DELETION_MAX_RETRIES,
            deletion_retry_delay: Duration::from_secs(DEFAULT_DELETION_RETRY_DELAY_S),
            unarchiving_scratch_dir: None,
            minimum_free_scratch_space: DEFAULT_MINIMUM_FREE_SCRATCH_SPACE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_store_code: String,
    pub store_root: Utf8PathBuf,
    pub catalog_url: Option<String>,
    pub highwater_mark_kb: Option<u64>,
    pub notify_successful_registration: bool,
    pub shutdown_timeout: Duration,
    pub shutdown_file: Option<Utf8PathBuf>,
    pub threads: Vec<ThreadSettings>,
    pub archiver: Option<ArchiverSettings>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, DropstoreError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => Self::default_config_path().ok_or(DropstoreError::MissingConfig)?,
        };

        let content = fs::read_to_string(&config_path)
            .map_err(|_| DropstoreError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| DropstoreError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    fn default_config_path() -> Option<PathBuf> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.exists() {
            return Some(local);
        }
        BaseDirs::new()
            .map(|dirs| dirs.config_dir().join("dropstore").join(CONFIG_FILE_NAME))
            .filter(|path| path.exists())
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, DropstoreError> {
        let data_store_code = required(config.data_store_code, "data_store_code")?;
        let store_root = Utf8PathBuf::from(required(config.store_root, "store_root")?);

        let threads = config
            .threads
            .into_iter()
            .enumerate()
            .map(|(index, entry)| resolve_thread(index, entry))
            .collect::<Result<Vec<_>, DropstoreError>>()?;

        let mut names = HashSet::new();
        let mut incoming_dirs = HashSet::new();
        for thread in &threads {
            if !names.insert(thread.name.clone()) {
                return Err(DropstoreError::Configuration(format!(
                    "duplicate thread name '{}'",
                    thread.name
                )));
            }
            if !incoming_dirs.insert(thread.incoming_dir.clone()) {
                return Err(DropstoreError::Configuration(format!(
                    "incoming directory '{}' is watched by more than one thread",
                    thread.incoming_dir
                )));
            }
            if thread.incoming_dir.starts_with(&store_root) {
                return Err(DropstoreError::Configuration(format!(
                    "incoming directory '{}' must not be inside the store root '{store_root}'",
                    thread.incoming_dir
                )));
            }
        }

        let archiver = config.archiver.map(resolve_archiver).transpose()?;

        Ok(ResolvedConfig {
            data_store_code,
            store_root,
            catalog_url: config.catalog_url,
            highwater_mark_kb: config.highwater_mark_kb,
            notify_successful_registration: config.notify_successful_registration,
            shutdown_timeout: Duration::from_millis(
                config
                    .shutdown_timeout_ms
                    .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
            ),
            shutdown_file: config.shutdown_file.map(Utf8PathBuf::from),
            threads,
            archiver,
        })
    }
}

fn required(value: Option<String>, key: &str) -> Result<String, DropstoreError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| DropstoreError::Configuration(format!("{key} must be set")))
}

fn resolve_thread(index: usize, entry: ThreadEntry) -> Result<ThreadSettings, DropstoreError> {
    let name = entry
        .name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| format!("thread-{}", index + 1));
    if entry.incoming_dir.trim().is_empty() {
        return Err(DropstoreError::Configuration(format!(
            "thread '{name}': incoming_dir must be set"
        )));
    }

    let completeness = match entry
        .completeness
        .unwrap_or(CompletenessCondition::MarkerFile)
    {
        CompletenessCondition::MarkerFile => CompletenessSettings::MarkerFile,
        CompletenessCondition::AutoDetection => {
            let quiet_period = entry.quiet_period_ms.unwrap_or(DEFAULT_QUIET_PERIOD_MS);
            if quiet_period == 0 {
                return Err(DropstoreError::Configuration(format!(
                    "thread '{name}': quiet_period_ms must be positive"
                )));
            }
            CompletenessSettings::QuietPeriod(Duration::from_millis(quiet_period))
        }
    };

    let check_interval = entry.check_interval_ms.unwrap_or(DEFAULT_CHECK_INTERVAL_MS);
    if check_interval == 0 {
        return Err(DropstoreError::Configuration(format!(
            "thread '{name}': check_interval_ms must be positive"
        )));
    }

    let defaults = ExtractorSettings::default();
    let extractor = ExtractorSettings {
        entity_separator: entry
            .extractor
            .entity_separator
            .filter(|separator| !separator.is_empty())
            .unwrap_or(defaults.entity_separator),
        index_of_sample_code: entry
            .extractor
            .index_of_sample_code
            .unwrap_or(defaults.index_of_sample_code),
        index_of_data_set_code: entry.extractor.index_of_data_set_code,
        index_of_parent_data_set_codes: entry.extractor.index_of_parent_data_set_codes,
        index_of_producer_code: entry.extractor.index_of_producer_code,
        space_code: entry
            .extractor
            .space_code
            .unwrap_or(defaults.space_code)
            .to_uppercase(),
    };

    Ok(ThreadSettings {
        name,
        incoming_dir: Utf8PathBuf::from(entry.incoming_dir.trim()),
        incoming_dir_create: entry.incoming_dir_create,
        completeness,
        check_interval: Duration::from_millis(check_interval),
        delete_unidentified: entry.delete_unidentified,
        reprocess_faulty_datasets: entry.reprocess_faulty_datasets,
        on_error: entry.on_error.unwrap_or(UnstoreAction::MoveToError),
        data_set_type: entry
            .data_set_type
            .unwrap_or_else(|| "UNKNOWN".to_string())
            .to_uppercase(),
        file_format_type: entry
            .file_format_type
            .unwrap_or_else(|| "PROPRIETARY".to_string())
            .to_uppercase(),
        locator_type: entry
            .locator_type
            .unwrap_or_else(|| "RELATIVE_LOCATION".to_string()),
        extractor,
    })
}

fn resolve_archiver(entry: ArchiverEntry) -> Result<ArchiverSettings, DropstoreError> {
    if entry.database_path.trim().is_empty()
        || entry.staging_dir.trim().is_empty()
        || entry.final_dir.trim().is_empty()
    {
        return Err(DropstoreError::Configuration(
            "archiver: database_path, staging_dir and final_dir must be set".to_string(),
        ));
    }
    if entry.staging_dir == entry.final_dir {
        return Err(DropstoreError::Configuration(
            "archiver: staging_dir and final_dir must differ".to_string(),
        ));
    }

    let mut settings = ArchiverSettings::new(
        Utf8PathBuf::from(entry.database_path),
        Utf8PathBuf::from(entry.staging_dir),
        Utf8PathBuf::from(entry.final_dir),
    );
    settings.replicated_dir = entry.replicated_dir.map(Utf8PathBuf::from);
    settings.minimum_container_size = entry.minimum_container_size_bytes.unwrap_or(0);
    settings.maximum_container_size = entry.maximum_container_size_bytes;
    if let Some(maximum) = settings.maximum_container_size
        && maximum < settings.minimum_container_size
    {
        return Err(DropstoreError::Configuration(format!(
            "archiver: maximum container size {maximum} is below minimum container size {}",
            settings.minimum_container_size
        )));
    }
    if let Some(extension) = entry.container_extension {
        let extension = extension.trim().trim_start_matches('.').to_string();
        if extension.is_empty() {
            return Err(DropstoreError::Configuration(
                "archiver: container_extension must not be empty".to_string(),
            ));
        }
        settings.container_extension = extension;
    }
    if let Some(sanity_check) = entry.sanity_check {
        settings.sanity_check = sanity_check;
    }
    settings.pause_file = entry.pause_file.map(Utf8PathBuf::from);
    if let Some(polling) = entry.finalizer_polling_time_ms {
        settings.finalizer_polling_time = Duration::from_millis(polling);
    }
    if let Some(max_wait) = entry.finalizer_max_waiting_time_ms {
        settings.finalizer_max_waiting_time = Duration::from_millis(max_wait);
    }
    if settings.finalizer_polling_time.is_zero() {
        return Err(DropstoreError::Configuration(
            "archiver: finalizer_polling_time_ms must be positive".to_string(),
        ));
    }
    if let Some(retries) = entry.deletion_max_retries {
        settings.deletion_max_retries = retries;
    }
    if let Some(delay) = entry.deletion_retry_delay_s {
        settings.deletion_retry_delay = Duration::from_secs(delay);
    }
    settings.unarchiving_scratch_dir = entry.unarchiving_scratch_dir.map(Utf8PathBuf::from);
    if let Some(minimum) = entry.minimum_free_scratch_space_bytes {
        settings.minimum_free_scratch_space = minimum;
    }
    Ok(settings)
}
