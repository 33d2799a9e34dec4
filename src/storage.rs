use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::domain::{DataSetDescriptor, StorageFormat};
use crate::error::DropstoreError;
use crate::store::Store;

pub const ORIGINAL_DIR: &str = "original";

/// What to do with the incoming copy when storing or registering fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UnstoreAction {
    MoveToError,
    LeaveUntouched,
    Delete,
}

pub trait StorageProcessor: Send + Sync {
    fn storage_format(&self) -> StorageFormat;

    fn create_transaction(
        &self,
        incoming: &Utf8Path,
        base_directory: &Utf8Path,
    ) -> Box<dyn StorageTransaction>;
}

pub trait StorageTransaction: Send {
    /// Places the incoming item below the base directory and returns the stored data directory.
    fn store_data(&mut self, descriptor: &DataSetDescriptor) -> Result<Utf8PathBuf, DropstoreError>;

    fn commit(&mut self) -> Result<(), DropstoreError>;

    /// Undoes `store_data` and tells the caller what to do with the incoming item.
    fn rollback(&mut self, error: &DropstoreError) -> UnstoreAction;
}

/// Moves the incoming item unchanged into `<base>/original/<name>`.
#[derive(Debug, Clone)]
pub struct DefaultStorageProcessor {
    on_error: UnstoreAction,
}

impl DefaultStorageProcessor {
    pub fn new(on_error: UnstoreAction) -> Self {
        Self { on_error }
    }
}

impl StorageProcessor for DefaultStorageProcessor {
    fn storage_format(&self) -> StorageFormat {
        StorageFormat::Proprietary
    }

    fn create_transaction(
        &self,
        incoming: &Utf8Path,
        base_directory: &Utf8Path,
    ) -> Box<dyn StorageTransaction> {
        Box::new(MoveTransaction {
            incoming: incoming.to_path_buf(),
            base_directory: base_directory.to_path_buf(),
            on_error: self.on_error,
            state: TransactionState::Initial,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TransactionState {
    Initial,
    Stored(Utf8PathBuf),
    Committed,
    RolledBack,
}

struct MoveTransaction {
    incoming: Utf8PathBuf,
    base_directory: Utf8PathBuf,
    on_error: UnstoreAction,
    state: TransactionState,
}

impl StorageTransaction for MoveTransaction {
    fn store_data(&mut self, descriptor: &DataSetDescriptor) -> Result<Utf8PathBuf, DropstoreError> {
        if self.state != TransactionState::Initial {
            return Err(DropstoreError::Defect(format!(
                "storage transaction for '{}' already used",
                descriptor.code
            )));
        }
        let original = self.base_directory.join(ORIGINAL_DIR);
        let stored = Store::move_into(&self.incoming, &original)?;
        info!("Data set {} stored in '{}'", descriptor.code, self.base_directory);
        self.state = TransactionState::Stored(stored);
        Ok(self.base_directory.clone())
    }

    fn commit(&mut self) -> Result<(), DropstoreError> {
        match self.state {
            TransactionState::Stored(_) => {
                self.state = TransactionState::Committed;
                Ok(())
            }
            _ => Err(DropstoreError::Defect(format!(
                "cannot commit storage of '{}' in state {:?}",
                self.incoming, self.state
            ))),
        }
    }

    fn rollback(&mut self, error: &DropstoreError) -> UnstoreAction {
        let previous = std::mem::replace(&mut self.state, TransactionState::RolledBack);
        let TransactionState::Stored(stored) = previous else {
            return self.on_error;
        };
        info!("Rolling back storage of '{}' after: {error}", self.incoming);
        if let Err(err) = Store::move_path(&stored, &self.incoming) {
            error!(
                target: "notify",
                "Could not move '{stored}' back to '{}': {err}", self.incoming
            );
            return UnstoreAction::LeaveUntouched;
        }
        let _ = fs::remove_dir(self.base_directory.join(ORIGINAL_DIR).as_std_path());
        let _ = fs::remove_dir(self.base_directory.as_std_path());
        self.on_error
    }
}
