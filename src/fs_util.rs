use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use camino::Utf8Path;
use tar::{Archive, Builder, EntryType, Header};

use crate::error::DropstoreError;

pub const META_DATA_FILE: &str = "meta-data.tsv";

/// One data set as it is packed into a container: `<code>/<payload...>` plus `<code>/meta-data.tsv`.
pub struct ContainerEntry<'a> {
    pub code: &'a str,
    pub source: &'a Utf8Path,
    pub meta_data: String,
}

pub fn write_container(path: &Utf8Path, entries: &[ContainerEntry<'_>]) -> Result<(), DropstoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
    }
    let file = fs::File::create(path.as_std_path())
        .map_err(|err| DropstoreError::Filesystem(format!("create container {path}: {err}")))?;
    let mut builder = Builder::new(file);
    builder.follow_symlinks(false);

    for entry in entries {
        let root = PathBuf::from(entry.code);
        let source = entry.source.as_std_path();
        let metadata = fs::symlink_metadata(source)
            .map_err(|err| DropstoreError::Filesystem(format!("{}: {err}", entry.source)))?;
        if metadata.is_dir() {
            builder
                .append_dir(&root, source)
                .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
            append_dir_recursive(&mut builder, source, source, &root)?;
        } else if metadata.is_file() {
            let file_name = source
                .file_name()
                .ok_or_else(|| DropstoreError::Filesystem(format!("invalid path {}", entry.source)))?;
            builder
                .append_path_with_name(source, root.join(file_name))
                .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        } else {
            return Err(DropstoreError::Filesystem(format!(
                "{} is neither a file nor a directory",
                entry.source
            )));
        }

        let content = entry.meta_data.as_bytes();
        let mut header = Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, root.join(META_DATA_FILE), content)
            .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
    }

    let mut file = builder
        .into_inner()
        .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
    io::Write::flush(&mut file).map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
    file.sync_all()
        .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
    Ok(())
}

fn append_dir_recursive(
    builder: &mut Builder<fs::File>,
    root: &Path,
    path: &Path,
    prefix: &Path,
) -> Result<(), DropstoreError> {
    let mut entries = fs::read_dir(path)
        .map_err(|err| DropstoreError::Filesystem(err.to_string()))?
        .collect::<Result<Vec<_>, io::Error>>()
        .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let file_type = entry
            .file_type()
            .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        let entry_path = entry.path();
        let relative = entry_path
            .strip_prefix(root)
            .map_err(|_| DropstoreError::Filesystem("container path invalid".to_string()))?;
        let name = prefix.join(relative);
        if file_type.is_dir() {
            builder
                .append_dir(&name, &entry_path)
                .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
            append_dir_recursive(builder, root, &entry_path, prefix)?;
        } else if file_type.is_file() {
            builder
                .append_path_with_name(&entry_path, &name)
                .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        } else {
            return Err(DropstoreError::Filesystem(format!(
                "{} is neither a file nor a directory",
                entry_path.display()
            )));
        }
    }
    Ok(())
}

/// Payload bytes per data set code, meta data files excluded.
pub fn container_payload_sizes(path: &Utf8Path) -> Result<BTreeMap<String, u64>, DropstoreError> {
    let file = fs::File::open(path.as_std_path())
        .map_err(|err| DropstoreError::Filesystem(format!("open container {path}: {err}")))?;
    let mut archive = Archive::new(file);
    let mut sizes = BTreeMap::new();
    for entry in archive
        .entries()
        .map_err(|err| DropstoreError::Filesystem(err.to_string()))?
    {
        let entry = entry.map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        let entry_path = entry
            .path()
            .map_err(|err| DropstoreError::Filesystem(err.to_string()))?
            .into_owned();
        validate_relative_path(&entry_path)?;
        let mut components = entry_path.components();
        let Some(Component::Normal(code)) = components.next() else {
            continue;
        };
        let code = code.to_string_lossy().to_string();
        let size = sizes.entry(code).or_insert(0u64);
        let rest = components.as_path();
        if entry.header().entry_type() == EntryType::Regular && rest != Path::new(META_DATA_FILE) {
            *size += entry.size();
        }
    }
    Ok(sizes)
}

/// Unpacks the payload of one data set (without its meta data file) into `dest_dir`.
pub fn extract_container_member(
    container: &Utf8Path,
    code: &str,
    dest_dir: &Utf8Path,
) -> Result<u64, DropstoreError> {
    let file = fs::File::open(container.as_std_path())
        .map_err(|err| DropstoreError::Filesystem(format!("open container {container}: {err}")))?;
    let mut archive = Archive::new(file);
    let mut extracted = 0u64;
    fs::create_dir_all(dest_dir.as_std_path())
        .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;

    for entry in archive
        .entries()
        .map_err(|err| DropstoreError::Filesystem(err.to_string()))?
    {
        let mut entry = entry.map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        let entry_type = entry.header().entry_type();
        match entry_type {
            EntryType::Directory | EntryType::Regular => {}
            _ => {
                return Err(DropstoreError::Filesystem(
                    "containers may not contain special entries".to_string(),
                ));
            }
        }
        let entry_path = entry
            .path()
            .map_err(|err| DropstoreError::Filesystem(err.to_string()))?
            .into_owned();
        validate_relative_path(&entry_path)?;
        let Ok(relative) = entry_path.strip_prefix(code) else {
            continue;
        };
        if relative.as_os_str().is_empty() || relative == Path::new(META_DATA_FILE) {
            continue;
        }
        let dest_path = dest_dir.as_std_path().join(relative);
        if entry_type == EntryType::Directory {
            fs::create_dir_all(&dest_path)
                .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        } else {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent)
                    .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
            }
            extracted += entry.size();
            entry
                .unpack(&dest_path)
                .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        }
    }
    Ok(extracted)
}

fn validate_relative_path(path: &Path) -> Result<(), DropstoreError> {
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(DropstoreError::Filesystem(format!(
                    "container entry escapes its root: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

pub fn path_size(path: &Path) -> io::Result<u64> {
    let metadata = fs::symlink_metadata(path)?;
    if !metadata.is_dir() {
        return Ok(metadata.len());
    }
    let mut total = 0;
    for entry in fs::read_dir(path)? {
        total += path_size(&entry?.path())?;
    }
    Ok(total)
}

/// Most recent modification time of `path` or anything below it.
pub fn last_modified(path: &Path) -> io::Result<SystemTime> {
    let metadata = fs::symlink_metadata(path)?;
    let mut latest = metadata.modified()?;
    if metadata.is_dir() {
        for entry in fs::read_dir(path)? {
            let modified = last_modified(&entry?.path())?;
            if modified > latest {
                latest = modified;
            }
        }
    }
    Ok(latest)
}

/// Returns a description of the problem if `path` cannot be fully read and written.
pub fn check_fully_accessible(path: &Path, kind: &str) -> Option<String> {
    let metadata = match fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(err) => return Some(format!("{kind} '{}' is not accessible: {err}", path.display())),
    };
    if metadata.permissions().readonly() {
        return Some(format!("{kind} '{}' is not writable", path.display()));
    }
    if metadata.is_dir() {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(err) => {
                return Some(format!("{kind} '{}' is not readable: {err}", path.display()));
            }
        };
        for entry in entries {
            match entry {
                Ok(entry) => {
                    if let Some(problem) = check_fully_accessible(&entry.path(), kind) {
                        return Some(problem);
                    }
                }
                Err(err) => {
                    return Some(format!("{kind} '{}' is not readable: {err}", path.display()));
                }
            }
        }
    } else if let Err(err) = fs::File::open(path) {
        return Some(format!("{kind} '{}' is not readable: {err}", path.display()));
    }
    None
}

pub fn byte_count_to_display_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KB", "MB", "GB", "TB", "PB"];
    if bytes < 1024 {
        return format!("{bytes} bytes");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}
