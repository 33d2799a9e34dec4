use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum DropstoreError {
    #[error("invalid data set code: {0}")]
    InvalidDataSetCode(String),

    #[error("invalid experiment identifier: {0}")]
    InvalidExperimentIdentifier(String),

    #[error("invalid archiving status: {0}")]
    InvalidArchivingStatus(String),

    #[error("missing config file dropstore.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("{0}")]
    Environment(String),

    #[error("archive database error: {0}")]
    ArchiveDb(String),

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("data set not found: {0}")]
    DataSetNotFound(String),

    #[error("{0}")]
    UserFailure(String),

    #[error("processing of '{0}' has been interrupted")]
    Interrupted(String),

    #[error("internal invariant violated: {0}")]
    Defect(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Environment,
    HighLevel,
    Interrupted,
    Defect,
}

impl DropstoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            DropstoreError::MissingConfig
            | DropstoreError::ConfigRead(_)
            | DropstoreError::ConfigParse(_)
            | DropstoreError::Configuration(_) => ErrorCategory::Configuration,
            DropstoreError::Filesystem(_)
            | DropstoreError::Environment(_)
            | DropstoreError::ArchiveDb(_)
            | DropstoreError::CatalogHttp(_)
            | DropstoreError::CatalogStatus { .. } => ErrorCategory::Environment,
            DropstoreError::InvalidDataSetCode(_)
            | DropstoreError::InvalidExperimentIdentifier(_)
            | DropstoreError::InvalidArchivingStatus(_)
            | DropstoreError::DataSetNotFound(_)
            | DropstoreError::UserFailure(_) => ErrorCategory::HighLevel,
            DropstoreError::Interrupted(_) => ErrorCategory::Interrupted,
            DropstoreError::Defect(_) => ErrorCategory::Defect,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.category() == ErrorCategory::Interrupted
    }

    pub fn is_defect(&self) -> bool {
        self.category() == ErrorCategory::Defect
    }
}
