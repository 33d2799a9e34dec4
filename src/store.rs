use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;

use crate::completeness::PROCESSING_PREFIX;
use crate::domain::DataSetDescriptor;
use crate::error::DropstoreError;

pub const IDENTIFIED_DIR: &str = "identified";
pub const UNIDENTIFIED_DIR: &str = "unidentified";
pub const ERROR_DIR: &str = "error";

#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), DropstoreError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| DropstoreError::Filesystem(err.to_string()))
    }

    /// Location of record for a stored path; anything outside the store root is a defect.
    pub fn relative_location(&self, path: &Utf8Path) -> Result<Utf8PathBuf, DropstoreError> {
        match path.strip_prefix(&self.root) {
            Ok(relative) if !relative.as_str().is_empty() => Ok(relative.to_path_buf()),
            _ => Err(DropstoreError::Defect(format!(
                "stored path '{path}' is not below the store root '{}'",
                self.root
            ))),
        }
    }

    pub fn resolve(&self, location: &Utf8Path) -> Utf8PathBuf {
        if location.is_absolute() {
            location.to_path_buf()
        } else {
            self.root.join(location)
        }
    }

    pub fn processing_marker(&self, directory: &Utf8Path) -> Utf8PathBuf {
        let name = directory.file_name().unwrap_or("data-set");
        let parent = directory.parent().unwrap_or(&self.root);
        parent.join(format!("{PROCESSING_PREFIX}{name}"))
    }

    /// Processing markers a crash inside the commit window left behind.
    pub fn leftover_processing_markers(&self) -> Result<Vec<Utf8PathBuf>, DropstoreError> {
        if !self.root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut markers = Vec::new();
        for path in walk_dir(self.root.as_std_path())? {
            let is_marker = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(|name| name.starts_with(PROCESSING_PREFIX))
                .unwrap_or(false);
            if is_marker && let Ok(path) = Utf8PathBuf::from_path_buf(path) {
                markers.push(path);
            }
        }
        markers.sort();
        Ok(markers)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), DropstoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), DropstoreError> {
        let parent = dest
            .parent()
            .ok_or_else(|| DropstoreError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix(".dropstore-copy")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        fs::copy(source.as_std_path(), temp.path())
            .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        if dest.as_std_path().exists() {
            fs::remove_file(dest.as_std_path())
                .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        }
        temp.persist(dest.as_std_path())
            .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Moves `source` into `dest_dir`, keeping its file name.
    pub fn move_into(source: &Utf8Path, dest_dir: &Utf8Path) -> Result<Utf8PathBuf, DropstoreError> {
        let name = source
            .file_name()
            .ok_or_else(|| DropstoreError::Filesystem(format!("invalid path '{source}'")))?;
        fs::create_dir_all(dest_dir.as_std_path()).map_err(|err| {
            DropstoreError::Filesystem(format!("cannot create directory '{dest_dir}': {err}"))
        })?;
        let target = dest_dir.join(name);
        Self::move_path(source, &target)?;
        Ok(target)
    }

    /// Like `move_into`, but picks a free name if the target already exists.
    pub fn move_into_unique(
        source: &Utf8Path,
        dest_dir: &Utf8Path,
    ) -> Result<Utf8PathBuf, DropstoreError> {
        let name = source
            .file_name()
            .ok_or_else(|| DropstoreError::Filesystem(format!("invalid path '{source}'")))?;
        fs::create_dir_all(dest_dir.as_std_path()).map_err(|err| {
            DropstoreError::Filesystem(format!("cannot create directory '{dest_dir}': {err}"))
        })?;
        let mut target = dest_dir.join(name);
        let mut counter = 1;
        while target.as_std_path().exists() {
            target = dest_dir.join(format!("{name}.{counter}"));
            counter += 1;
        }
        Self::move_path(source, &target)?;
        Ok(target)
    }

    pub fn move_path(source: &Utf8Path, target: &Utf8Path) -> Result<(), DropstoreError> {
        if target.as_std_path().exists() {
            return Err(DropstoreError::Filesystem(format!(
                "cannot move '{source}' to '{target}': target exists"
            )));
        }
        fs::rename(source.as_std_path(), target.as_std_path()).map_err(|err| {
            DropstoreError::Filesystem(format!("cannot move '{source}' to '{target}': {err}"))
        })
    }

    pub fn remove_path(path: &Utf8Path) -> io::Result<()> {
        let metadata = fs::symlink_metadata(path.as_std_path())?;
        if metadata.is_dir() {
            fs::remove_dir_all(path.as_std_path())
        } else {
            fs::remove_file(path.as_std_path())
        }
    }
}

/// Where an incoming item goes, selected by how far the registrator got with identifying it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageStrategy {
    Identified,
    Unidentified,
    Error,
}

impl StorageStrategy {
    pub fn compute_base_directory(
        &self,
        store_root: &Utf8Path,
        descriptor: &DataSetDescriptor,
    ) -> Result<Utf8PathBuf, DropstoreError> {
        let data_set_type = sanitize(&descriptor.data_set_type);
        match self {
            StorageStrategy::Identified => {
                let experiment = descriptor.experiment.as_ref().ok_or_else(|| {
                    DropstoreError::Defect(format!(
                        "data set '{}' identified without an experiment",
                        descriptor.code
                    ))
                })?;
                Ok(store_root
                    .join(IDENTIFIED_DIR)
                    .join(sanitize(&experiment.space))
                    .join(sanitize(&experiment.project))
                    .join(sanitize(&experiment.code))
                    .join(data_set_type)
                    .join(descriptor.code.as_str()))
            }
            StorageStrategy::Unidentified => {
                Ok(store_root.join(UNIDENTIFIED_DIR).join(data_set_type))
            }
            StorageStrategy::Error => Ok(store_root.join(ERROR_DIR).join(data_set_type)),
        }
    }
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' => '_',
            other => other,
        })
        .collect()
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, DropstoreError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if entry
                .file_type()
                .map_err(|err| DropstoreError::Filesystem(err.to_string()))?
                .is_dir()
            {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

pub fn atomic_rename_dir(from: &Path, to: &Path) -> io::Result<()> {
    if to.exists() {
        fs::remove_dir_all(to)?;
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::rename(from, to)
}
