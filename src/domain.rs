use std::fmt;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DropstoreError;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataSetCode(String);

impl DataSetCode {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataSetCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DataSetCode {
    type Err = DropstoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '+'));
        if !is_valid || normalized.starts_with('.') {
            return Err(DropstoreError::InvalidDataSetCode(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExperimentIdentifier {
    pub space: String,
    pub project: String,
    pub code: String,
}

impl fmt::Display for ExperimentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}", self.space, self.project, self.code)
    }
}

impl FromStr for ExperimentIdentifier {
    type Err = DropstoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().trim_start_matches('/');
        let parts = trimmed.split('/').collect::<Vec<_>>();
        let is_valid = parts.len() == 3 && parts.iter().all(|part| !part.trim().is_empty());
        if !is_valid {
            return Err(DropstoreError::InvalidExperimentIdentifier(value.to_string()));
        }
        Ok(Self {
            space: parts[0].trim().to_uppercase(),
            project: parts[1].trim().to_uppercase(),
            code: parts[2].trim().to_uppercase(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleIdentifier(String);

impl SampleIdentifier {
    pub fn new(space: &str, code: &str) -> Self {
        Self(format!("/{}/{}", space.to_uppercase(), code.to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn code(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for SampleIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BooleanOrUnknown {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for BooleanOrUnknown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BooleanOrUnknown::True => write!(f, "TRUE"),
            BooleanOrUnknown::False => write!(f, "FALSE"),
            BooleanOrUnknown::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Metadata as produced by an extractor. The code may still be missing; it is
/// allocated by the catalog before the descriptor is frozen.
#[derive(Debug, Clone, Default)]
pub struct DataSetInfo {
    pub code: Option<DataSetCode>,
    pub sample: Option<SampleIdentifier>,
    pub experiment: Option<ExperimentIdentifier>,
    pub producer_code: Option<String>,
    pub production_date: Option<DateTime<Utc>>,
    pub is_complete: BooleanOrUnknown,
    pub parent_codes: Vec<DataSetCode>,
    pub uploader_email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSetDescriptor {
    pub code: DataSetCode,
    pub data_set_type: String,
    pub sample: Option<SampleIdentifier>,
    pub experiment: Option<ExperimentIdentifier>,
    pub producer_code: Option<String>,
    pub production_date: Option<DateTime<Utc>>,
    pub is_complete: BooleanOrUnknown,
    pub parent_codes: Vec<DataSetCode>,
    pub registrator_email: Option<String>,
}

impl DataSetDescriptor {
    pub fn from_info(info: DataSetInfo, code: DataSetCode, data_set_type: &str) -> Self {
        Self {
            code,
            data_set_type: data_set_type.to_string(),
            sample: info.sample,
            experiment: info.experiment,
            producer_code: info.producer_code,
            production_date: info.production_date,
            is_complete: info.is_complete,
            parent_codes: info.parent_codes,
            registrator_email: info.uploader_email,
        }
    }

    pub fn with_experiment(
        mut self,
        experiment: ExperimentIdentifier,
        registrator_email: Option<String>,
    ) -> Self {
        self.experiment = Some(experiment);
        if registrator_email.is_some() {
            self.registrator_email = registrator_email;
        }
        self
    }
}

impl fmt::Display for DataSetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(sample) = &self.sample {
            write!(f, " (sample {sample})")?;
        } else if let Some(experiment) = &self.experiment {
            write!(f, " (experiment {experiment})")?;
        }
        Ok(())
    }
}

/// Catalog attributes of a registered data set that only appear in archive metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationDetails {
    pub is_measured: bool,
    pub experiment_type_code: Option<String>,
    pub registration_timestamp: Option<DateTime<Utc>>,
    pub registrator: Option<String>,
}

impl Default for RegistrationDetails {
    fn default() -> Self {
        Self {
            is_measured: true,
            experiment_type_code: None,
            registration_timestamp: None,
            registrator: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDataSet {
    pub descriptor: DataSetDescriptor,
    pub location: Utf8PathBuf,
    pub size: Option<u64>,
    #[serde(default)]
    pub registration: RegistrationDetails,
}

impl StoredDataSet {
    pub fn code(&self) -> &DataSetCode {
        &self.descriptor.code
    }

    pub fn location(&self) -> &Utf8Path {
        &self.location
    }
}

impl fmt::Display for StoredDataSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dataset '{}'", self.descriptor.code)
    }
}

#[derive(Debug, Clone)]
pub struct IncomingItem {
    pub path: Utf8PathBuf,
    pub discovered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchivingStatus {
    Available,
    Archived,
}

impl fmt::Display for ArchivingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchivingStatus::Available => write!(f, "AVAILABLE"),
            ArchivingStatus::Archived => write!(f, "ARCHIVED"),
        }
    }
}

impl FromStr for ArchivingStatus {
    type Err = DropstoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "AVAILABLE" => Ok(ArchivingStatus::Available),
            "ARCHIVED" => Ok(ArchivingStatus::Archived),
            _ => Err(DropstoreError::InvalidArchivingStatus(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusUpdate {
    pub codes: Vec<DataSetCode>,
    pub status: ArchivingStatus,
    pub present_in_archive: bool,
}

impl StatusUpdate {
    pub fn new(codes: Vec<DataSetCode>, status: ArchivingStatus, present_in_archive: bool) -> Self {
        Self {
            codes,
            status,
            present_in_archive,
        }
    }
}

impl fmt::Display for StatusUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", format_codes(&self.codes), self.status)
    }
}

pub fn format_codes(codes: &[DataSetCode]) -> String {
    let joined = codes
        .iter()
        .map(DataSetCode::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    format!("[{joined}]")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "message", rename_all = "UPPERCASE")]
pub enum Status {
    Ok,
    Error(String),
}

impl Status {
    pub fn is_error(&self) -> bool {
        matches!(self, Status::Error(_))
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Ok => write!(f, "OK"),
            Status::Error(message) => write!(f, "ERROR: \"{message}\""),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessingEntry {
    pub code: DataSetCode,
    pub status: Status,
}

/// One status per requested data set, in request order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessingStatus {
    entries: Vec<ProcessingEntry>,
}

impl ProcessingStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, code: &DataSetCode, status: Status) {
        if let Some(entry) = self.entries.iter_mut().find(|entry| &entry.code == code) {
            entry.status = status;
            return;
        }
        self.entries.push(ProcessingEntry {
            code: code.clone(),
            status,
        });
    }

    pub fn add_ok_all<'a>(&mut self, codes: impl IntoIterator<Item = &'a DataSetCode>) {
        for code in codes {
            self.add(code, Status::Ok);
        }
    }

    pub fn add_error_all<'a>(
        &mut self,
        codes: impl IntoIterator<Item = &'a DataSetCode>,
        message: &str,
    ) {
        for code in codes {
            self.add(code, Status::Error(message.to_string()));
        }
    }

    pub fn status_of(&self, code: &DataSetCode) -> Option<&Status> {
        self.entries
            .iter()
            .find(|entry| &entry.code == code)
            .map(|entry| &entry.status)
    }

    pub fn error_statuses(&self) -> Vec<&Status> {
        let mut errors: Vec<&Status> = Vec::new();
        for entry in &self.entries {
            if entry.status.is_error() && !errors.contains(&&entry.status) {
                errors.push(&entry.status);
            }
        }
        errors
    }

    pub fn is_ok(&self) -> bool {
        self.entries.iter().all(|entry| !entry.status.is_error())
    }

    pub fn entries(&self) -> &[ProcessingEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerSizeClass {
    TooSmall,
    Ok,
    TooBig,
}

impl ContainerSizeClass {
    pub fn classify(total: u64, minimum: u64, maximum: Option<u64>) -> Self {
        if total < minimum {
            return ContainerSizeClass::TooSmall;
        }
        match maximum {
            Some(maximum) if total > maximum => ContainerSizeClass::TooBig,
            _ => ContainerSizeClass::Ok,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveContainer {
    pub id: i64,
    pub path: String,
}

impl fmt::Display for ArchiveContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchiveContainer [id={}, path={}]", self.id, self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveMembership {
    pub id: i64,
    pub code: DataSetCode,
    pub container_id: i64,
    pub size_in_bytes: u64,
}

impl fmt::Display for ArchiveMembership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ArchiveMembership [id={}, code={}, containerId={}, sizeInBytes={}]",
            self.id, self.code, self.container_id, self.size_in_bytes
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageFormat {
    Proprietary,
    Bds,
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageFormat::Proprietary => write!(f, "PROPRIETARY"),
            StorageFormat::Bds => write!(f, "BDS"),
        }
    }
}

/// Record handed to the catalog when a stored data set is registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewDataSet {
    pub code: DataSetCode,
    pub data_set_type: String,
    pub file_format_type: String,
    pub locator_type: String,
    pub location: String,
    pub storage_format: StorageFormat,
    pub is_complete: BooleanOrUnknown,
    pub is_measured: bool,
    pub sample: Option<SampleIdentifier>,
    pub experiment: Option<ExperimentIdentifier>,
    pub parent_codes: Vec<DataSetCode>,
    pub producer_code: Option<String>,
    pub production_date: Option<DateTime<Utc>>,
    pub data_store_code: String,
}
