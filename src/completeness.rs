use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{error, info, warn};

use crate::clock::TimeProvider;
use crate::error::DropstoreError;
use crate::fs_util;

pub const IS_FINISHED_PREFIX: &str = ".MARKER_is_finished_";
pub const PROCESSING_PREFIX: &str = ".MARKER_processing_";
pub const QUIET_PERIOD_ERROR_TOLERANCE: u32 = 3;

/// An incoming item that is safe to process, plus the marker to drop once it has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyItem {
    incoming: Utf8PathBuf,
    marker: Option<Utf8PathBuf>,
}

impl ReadyItem {
    pub fn new(incoming: Utf8PathBuf, marker: Option<Utf8PathBuf>) -> Self {
        Self { incoming, marker }
    }

    pub fn incoming(&self) -> &Utf8Path {
        &self.incoming
    }

    pub fn marker(&self) -> Option<&Utf8Path> {
        self.marker.as_deref()
    }

    pub fn complete(&self) -> Result<(), DropstoreError> {
        if let Some(marker) = &self.marker {
            match fs::remove_file(marker.as_std_path()) {
                Ok(()) => info!("Marker file '{marker}' has been removed"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => {
                    error!(target: "notify", "Could not remove marker file '{marker}': {err}");
                    return Err(DropstoreError::Filesystem(err.to_string()));
                }
            }
        }
        Ok(())
    }
}

pub trait CompletenessDetector: Send {
    /// Whether a directory entry with this name is a candidate at all.
    fn accepts_entry(&self, name: &str) -> bool;

    fn check(&mut self, path: &Utf8Path) -> Result<Option<ReadyItem>, DropstoreError>;

    /// Called with the candidates of the current scan before they are checked.
    fn retain_listed(&mut self, _listed: &[Utf8PathBuf]) {}
}

#[derive(Debug, Default)]
pub struct MarkerFileDetector;

impl MarkerFileDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn marker_for(incoming: &Utf8Path) -> Option<Utf8PathBuf> {
        let name = incoming.file_name()?;
        Some(
            incoming
                .parent()
                .unwrap_or(Utf8Path::new(""))
                .join(format!("{IS_FINISHED_PREFIX}{name}")),
        )
    }
}

impl CompletenessDetector for MarkerFileDetector {
    fn accepts_entry(&self, name: &str) -> bool {
        name.len() > IS_FINISHED_PREFIX.len() && name.starts_with(IS_FINISHED_PREFIX)
    }

    fn check(&mut self, marker: &Utf8Path) -> Result<Option<ReadyItem>, DropstoreError> {
        let Some(name) = marker
            .file_name()
            .and_then(|name| name.strip_prefix(IS_FINISHED_PREFIX))
        else {
            return Ok(None);
        };
        let incoming = marker.parent().unwrap_or(Utf8Path::new("")).join(name);

        if let Some(problem) = fs_util::check_fully_accessible(incoming.as_std_path(), "incoming")
        {
            if let Err(err) = fs::remove_file(marker.as_std_path()) {
                warn!("Could not remove marker file '{marker}': {err}");
            }
            error!(target: "notify", "{problem}");
            return Err(DropstoreError::Environment(format!(
                "Incoming data set '{incoming}' cannot be processed: {problem}"
            )));
        }

        Ok(Some(ReadyItem::new(incoming, Some(marker.to_path_buf()))))
    }
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    last_modified: SystemTime,
    unchanged_since_millis: u64,
}

/// Accepts an item once its latest modification time has stayed put for the quiet period.
pub struct QuietPeriodDetector {
    clock: Arc<dyn TimeProvider>,
    quiet_period: Duration,
    observations: HashMap<Utf8PathBuf, Observation>,
    error_counts: HashMap<Utf8PathBuf, u32>,
}

impl QuietPeriodDetector {
    pub fn new(clock: Arc<dyn TimeProvider>, quiet_period: Duration) -> Self {
        Self {
            clock,
            quiet_period,
            observations: HashMap::new(),
            error_counts: HashMap::new(),
        }
    }

    /// Number of items currently being watched or failing.
    pub fn tracked(&self) -> usize {
        self.observations
            .keys()
            .chain(self.error_counts.keys())
            .collect::<HashSet<_>>()
            .len()
    }

    fn record_error(&mut self, path: &Utf8Path, err: io::Error) -> Result<Option<ReadyItem>, DropstoreError> {
        let count = self.error_counts.entry(path.to_path_buf()).or_insert(0);
        *count += 1;
        if *count < QUIET_PERIOD_ERROR_TOLERANCE {
            warn!("Cannot determine last modification time of '{path}' ({count}. attempt): {err}");
            return Ok(None);
        }
        let count = *count;
        self.error_counts.remove(path);
        error!(
            target: "notify",
            "Cannot determine last modification time of '{path}' after {count} attempts: {err}"
        );
        Err(DropstoreError::Environment(format!(
            "cannot determine last modification time of '{path}': {err}"
        )))
    }
}

impl CompletenessDetector for QuietPeriodDetector {
    fn accepts_entry(&self, name: &str) -> bool {
        !name.starts_with('.')
    }

    fn retain_listed(&mut self, listed: &[Utf8PathBuf]) {
        let listed = listed.iter().collect::<HashSet<_>>();
        self.observations.retain(|path, _| listed.contains(path));
        self.error_counts.retain(|path, _| listed.contains(path));
    }

    fn check(&mut self, path: &Utf8Path) -> Result<Option<ReadyItem>, DropstoreError> {
        let last_modified = match fs_util::last_modified(path.as_std_path()) {
            Ok(last_modified) => last_modified,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.observations.remove(path);
                self.error_counts.remove(path);
                return Ok(None);
            }
            Err(err) => return self.record_error(path, err),
        };
        self.error_counts.remove(path);

        let now = self.clock.now_millis();
        match self.observations.get(path) {
            Some(observation) if observation.last_modified == last_modified => {
                let quiet_for = now.saturating_sub(observation.unchanged_since_millis);
                if quiet_for >= self.quiet_period.as_millis() as u64 {
                    self.observations.remove(path);
                    return Ok(Some(ReadyItem::new(path.to_path_buf(), None)));
                }
                Ok(None)
            }
            _ => {
                self.observations.insert(
                    path.to_path_buf(),
                    Observation {
                        last_modified,
                        unchanged_since_millis: now,
                    },
                );
                Ok(None)
            }
        }
    }
}
