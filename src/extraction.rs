use camino::Utf8Path;

use crate::config::{ExtractorSettings, ThreadSettings};
use crate::domain::{DataSetCode, DataSetInfo, SampleIdentifier, StorageFormat};
use crate::error::DropstoreError;

pub trait DataSetInfoExtractor: Send + Sync {
    fn extract(&self, incoming: &Utf8Path) -> Result<DataSetInfo, DropstoreError>;

    /// Who to tell when `extract` fails, if the item itself reveals it.
    fn uploader_email(&self, _incoming: &Utf8Path) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSetTypes {
    pub data_set_type: String,
    pub file_format_type: String,
    pub locator_type: String,
    pub storage_format: StorageFormat,
    pub is_measured: bool,
}

pub trait TypeExtractor: Send + Sync {
    fn extract_types(&self, incoming: &Utf8Path) -> DataSetTypes;
}

/// Same types for every item of one watched directory.
#[derive(Debug, Clone)]
pub struct ConfiguredTypeExtractor {
    types: DataSetTypes,
}

impl ConfiguredTypeExtractor {
    pub fn new(types: DataSetTypes) -> Self {
        Self { types }
    }

    pub fn from_settings(settings: &ThreadSettings) -> Self {
        Self::new(DataSetTypes {
            data_set_type: settings.data_set_type.clone(),
            file_format_type: settings.file_format_type.clone(),
            locator_type: settings.locator_type.clone(),
            storage_format: StorageFormat::Proprietary,
            is_measured: true,
        })
    }
}

impl TypeExtractor for ConfiguredTypeExtractor {
    fn extract_types(&self, _incoming: &Utf8Path) -> DataSetTypes {
        self.types.clone()
    }
}

/// Reads sample code, data set code, parents and producer from separator-delimited file names,
/// e.g. `SAMPLE1_20240101-1_PARENT1 PARENT2` with separator `_`.
#[derive(Debug, Clone)]
pub struct FileNameInfoExtractor {
    settings: ExtractorSettings,
}

impl FileNameInfoExtractor {
    pub fn new(settings: ExtractorSettings) -> Self {
        Self { settings }
    }

    fn token<'a>(&self, name: &str, tokens: &[&'a str], index: i32) -> Result<&'a str, DropstoreError> {
        let resolved = if index < 0 {
            tokens.len() as i64 + index as i64
        } else {
            index as i64
        };
        usize::try_from(resolved)
            .ok()
            .and_then(|resolved| tokens.get(resolved).copied())
            .ok_or_else(|| {
                DropstoreError::UserFailure(format!(
                    "Cannot extract entity with index {index} from '{name}': only {} entities separated by '{}'",
                    tokens.len(),
                    self.settings.entity_separator
                ))
            })
    }
}

impl DataSetInfoExtractor for FileNameInfoExtractor {
    fn extract(&self, incoming: &Utf8Path) -> Result<DataSetInfo, DropstoreError> {
        let name = if incoming.is_dir() {
            incoming.file_name()
        } else {
            incoming.file_stem()
        }
        .ok_or_else(|| DropstoreError::UserFailure(format!("invalid incoming path '{incoming}'")))?;
        let tokens = name
            .split(self.settings.entity_separator.as_str())
            .collect::<Vec<_>>();

        let sample_code = self
            .token(name, &tokens, self.settings.index_of_sample_code)?
            .trim()
            .to_uppercase();
        if sample_code.is_empty() {
            return Err(DropstoreError::UserFailure(format!(
                "No sample code found in '{name}'"
            )));
        }

        let mut info = DataSetInfo {
            sample: Some(SampleIdentifier::new(&self.settings.space_code, &sample_code)),
            ..DataSetInfo::default()
        };

        if let Some(index) = self.settings.index_of_data_set_code {
            let code = self.token(name, &tokens, index)?;
            info.code = Some(code.parse::<DataSetCode>()?);
        }
        if let Some(index) = self.settings.index_of_parent_data_set_codes {
            info.parent_codes = self
                .token(name, &tokens, index)?
                .split_whitespace()
                .map(str::parse)
                .collect::<Result<Vec<DataSetCode>, _>>()?;
        }
        if let Some(index) = self.settings.index_of_producer_code {
            let producer = self.token(name, &tokens, index)?.trim();
            if !producer.is_empty() {
                info.producer_code = Some(producer.to_string());
            }
        }
        Ok(info)
    }
}
