use std::fs;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use tracing::debug;

use crate::domain::{ArchiveContainer, ArchiveMembership, DataSetCode};
use crate::error::DropstoreError;

const SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Location of the container/membership catalog; hands out transactions and read-only queries.
#[derive(Debug, Clone)]
pub struct ArchiveDatabase {
    path: Utf8PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRef<'a> {
    Id(i64),
    Path(&'a str),
}

impl ArchiveDatabase {
    pub fn open(path: &Utf8Path) -> Result<Self, DropstoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_str().is_empty()
        {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| DropstoreError::Filesystem(err.to_string()))?;
        }
        let mut connection = open_connection(path, false)?;
        initialize_schema(&mut connection)?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn begin(&self) -> Result<ArchiveTransaction, DropstoreError> {
        Ok(ArchiveTransaction {
            connection: Some(open_connection(&self.path, false)?),
            in_transaction: false,
        })
    }

    pub fn query(&self) -> Result<ArchiveQuery, DropstoreError> {
        Ok(ArchiveQuery {
            connection: open_connection(&self.path, true)?,
        })
    }

    pub fn schema_version(&self) -> Result<i64, DropstoreError> {
        let connection = open_connection(&self.path, true)?;
        connection
            .query_row("SELECT version FROM archive_meta LIMIT 1", params![], |row| {
                row.get(0)
            })
            .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))
    }
}

fn open_connection(path: &Utf8Path, read_only: bool) -> Result<Connection, DropstoreError> {
    let flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_FULL_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX
    };
    let connection = Connection::open_with_flags(path.as_std_path(), flags)
        .map_err(|err| DropstoreError::ArchiveDb(format!("open {path}: {err}")))?;
    connection
        .execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
    if !read_only {
        connection
            .execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")
            .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
    }
    connection
        .busy_timeout(BUSY_TIMEOUT)
        .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
    Ok(connection)
}

fn initialize_schema(connection: &mut Connection) -> Result<(), DropstoreError> {
    let tx = connection
        .transaction()
        .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
    tx.execute_batch("CREATE TABLE IF NOT EXISTS archive_meta (version INTEGER NOT NULL);")
        .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
    let version: Option<i64> = tx
        .query_row("SELECT version FROM archive_meta LIMIT 1", params![], |row| {
            row.get(0)
        })
        .optional()
        .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
    match version {
        None => {
            tx.execute(
                "INSERT INTO archive_meta (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )
            .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
            tx.execute_batch(
                "CREATE TABLE IF NOT EXISTS containers (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    path TEXT NOT NULL UNIQUE
                );
                CREATE TABLE IF NOT EXISTS data_sets (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    code TEXT NOT NULL UNIQUE,
                    container_id INTEGER NOT NULL
                        REFERENCES containers (id) ON DELETE CASCADE,
                    size_in_bytes INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS data_sets_container_idx
                    ON data_sets (container_id);",
            )
            .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
        }
        Some(SCHEMA_VERSION) => {}
        Some(other) => {
            return Err(DropstoreError::ArchiveDb(format!(
                "unsupported archive database schema version {other}"
            )));
        }
    }
    tx.commit()
        .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))
}

fn read_container(row: &Row<'_>) -> rusqlite::Result<ArchiveContainer> {
    Ok(ArchiveContainer {
        id: row.get(0)?,
        path: row.get(1)?,
    })
}

fn read_membership(row: &Row<'_>) -> rusqlite::Result<(i64, String, i64, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn to_membership(raw: (i64, String, i64, i64)) -> Result<ArchiveMembership, DropstoreError> {
    let (id, code, container_id, size) = raw;
    Ok(ArchiveMembership {
        id,
        code: code
            .parse()
            .map_err(|_| DropstoreError::ArchiveDb(format!("invalid data set code '{code}' in archive database")))?,
        container_id,
        size_in_bytes: u64::try_from(size)
            .map_err(|_| DropstoreError::ArchiveDb(format!("negative size for '{code}'")))?,
    })
}

fn data_set_for_code(
    connection: &Connection,
    code: &DataSetCode,
) -> Result<Option<ArchiveMembership>, DropstoreError> {
    connection
        .query_row(
            "SELECT id, code, container_id, size_in_bytes FROM data_sets WHERE code = ?1",
            params![code.as_str()],
            read_membership,
        )
        .optional()
        .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?
        .map(to_membership)
        .transpose()
}

fn container_for_id(
    connection: &Connection,
    id: i64,
) -> Result<Option<ArchiveContainer>, DropstoreError> {
    connection
        .query_row(
            "SELECT id, path FROM containers WHERE id = ?1",
            params![id],
            read_container,
        )
        .optional()
        .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))
}

fn data_sets_for_container_id(
    connection: &Connection,
    container_id: i64,
) -> Result<Vec<ArchiveMembership>, DropstoreError> {
    let mut stmt = connection
        .prepare_cached(
            "SELECT id, code, container_id, size_in_bytes FROM data_sets
             WHERE container_id = ?1 ORDER BY id",
        )
        .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
    let rows = stmt
        .query_map(params![container_id], read_membership)
        .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
    let mut memberships = Vec::new();
    for row in rows {
        let raw = row.map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
        memberships.push(to_membership(raw)?);
    }
    Ok(memberships)
}

/// A write transaction on the archive catalog. Nothing is visible to other connections before
/// `commit`; dropping an uncommitted transaction rolls it back.
pub struct ArchiveTransaction {
    connection: Option<Connection>,
    in_transaction: bool,
}

impl ArchiveTransaction {
    fn connection(&self) -> Result<&Connection, DropstoreError> {
        self.connection
            .as_ref()
            .ok_or_else(|| DropstoreError::ArchiveDb("archive transaction is closed".to_string()))
    }

    fn begin_if_needed(&mut self) -> Result<(), DropstoreError> {
        if !self.in_transaction {
            self.connection()?
                .execute_batch("BEGIN IMMEDIATE")
                .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
            self.in_transaction = true;
        }
        Ok(())
    }

    pub fn create_container(&mut self, path: &str) -> Result<ArchiveContainer, DropstoreError> {
        self.begin_if_needed()?;
        let connection = self.connection()?;
        connection
            .execute("INSERT INTO containers (path) VALUES (?1)", params![path])
            .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
        let container = ArchiveContainer {
            id: connection.last_insert_rowid(),
            path: path.to_string(),
        };
        debug!("Created {container}");
        Ok(container)
    }

    pub fn insert_dataset(
        &mut self,
        code: &DataSetCode,
        size_in_bytes: u64,
        container: &ArchiveContainer,
    ) -> Result<ArchiveMembership, DropstoreError> {
        self.begin_if_needed()?;
        let connection = self.connection()?;
        let size = i64::try_from(size_in_bytes)
            .map_err(|_| DropstoreError::ArchiveDb(format!("size of '{code}' out of range")))?;
        connection
            .execute(
                "INSERT INTO data_sets (code, container_id, size_in_bytes) VALUES (?1, ?2, ?3)",
                params![code.as_str(), container.id, size],
            )
            .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
        Ok(ArchiveMembership {
            id: connection.last_insert_rowid(),
            code: code.clone(),
            container_id: container.id,
            size_in_bytes,
        })
    }

    pub fn get_data_set_for_code(
        &self,
        code: &DataSetCode,
    ) -> Result<Option<ArchiveMembership>, DropstoreError> {
        data_set_for_code(self.connection()?, code)
    }

    pub fn get_container_for_id(&self, id: i64) -> Result<Option<ArchiveContainer>, DropstoreError> {
        container_for_id(self.connection()?, id)
    }

    pub fn list_data_sets_for_container_id(
        &self,
        container_id: i64,
    ) -> Result<Vec<ArchiveMembership>, DropstoreError> {
        data_sets_for_container_id(self.connection()?, container_id)
    }

    /// Removes a container and its memberships. Returns whether a row was deleted.
    pub fn delete_container(&mut self, container: ContainerRef<'_>) -> Result<bool, DropstoreError> {
        self.begin_if_needed()?;
        let connection = self.connection()?;
        let deleted = match container {
            ContainerRef::Id(id) => connection.execute("DELETE FROM containers WHERE id = ?1", params![id]),
            ContainerRef::Path(path) => {
                connection.execute("DELETE FROM containers WHERE path = ?1", params![path])
            }
        }
        .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
        Ok(deleted > 0)
    }

    pub fn commit(&mut self) -> Result<(), DropstoreError> {
        if self.in_transaction {
            self.connection()?
                .execute_batch("COMMIT")
                .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
            self.in_transaction = false;
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), DropstoreError> {
        if self.in_transaction {
            self.in_transaction = false;
            self.connection()?
                .execute_batch("ROLLBACK")
                .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if self.connection.is_none() {
            return;
        }
        if let Err(err) = self.rollback() {
            debug!("Rolling back on close failed: {err}");
        }
        self.connection = None;
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_none()
    }
}

impl Drop for ArchiveTransaction {
    fn drop(&mut self) {
        self.close();
    }
}

/// Read-only lookups that never take the write lock.
pub struct ArchiveQuery {
    connection: Connection,
}

impl ArchiveQuery {
    pub fn get_data_set_for_code(
        &self,
        code: &DataSetCode,
    ) -> Result<Option<ArchiveMembership>, DropstoreError> {
        data_set_for_code(&self.connection, code)
    }

    pub fn get_container_for_id(&self, id: i64) -> Result<Option<ArchiveContainer>, DropstoreError> {
        container_for_id(&self.connection, id)
    }

    pub fn list_data_sets_for_container_id(
        &self,
        container_id: i64,
    ) -> Result<Vec<ArchiveMembership>, DropstoreError> {
        data_sets_for_container_id(&self.connection, container_id)
    }

    pub fn list_containers(&self) -> Result<Vec<ArchiveContainer>, DropstoreError> {
        let mut stmt = self
            .connection
            .prepare("SELECT id, path FROM containers ORDER BY id")
            .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
        let rows = stmt
            .query_map(params![], read_container)
            .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|err| DropstoreError::ArchiveDb(err.to_string()))
    }
}
