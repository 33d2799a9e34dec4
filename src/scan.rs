use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, error, info, warn};

use crate::clock::TimeProvider;
use crate::completeness::{CompletenessDetector, ReadyItem};
use crate::error::DropstoreError;
use crate::lifecycle::StopToken;
use crate::registration::{DataSetRegistrator, RegistrationOutcome};
use crate::services::FreeSpaceProvider;
use crate::store::Store;

pub const FAULTY_PATHS_FILE: &str = ".faulty_paths";

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub trait PathHandler: Send + Sync {
    fn handle(&self, item: &ReadyItem) -> Result<RegistrationOutcome, DropstoreError>;
}

impl PathHandler for DataSetRegistrator {
    fn handle(&self, item: &ReadyItem) -> Result<RegistrationOutcome, DropstoreError> {
        self.register(item)
    }
}

/// Paths that were still present after being handled; persisted so a restart does not retry them.
#[derive(Debug)]
pub struct FaultyPaths {
    file: Utf8PathBuf,
    paths: BTreeSet<Utf8PathBuf>,
}

impl FaultyPaths {
    pub fn load(incoming_dir: &Utf8Path) -> Result<Self, DropstoreError> {
        let file = incoming_dir.join(FAULTY_PATHS_FILE);
        let paths = match fs::read_to_string(file.as_std_path()) {
            Ok(content) => content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(Utf8PathBuf::from)
                .collect(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeSet::new(),
            Err(err) => {
                return Err(DropstoreError::Filesystem(format!(
                    "cannot read faulty paths from '{file}': {err}"
                )));
            }
        };
        Ok(Self { file, paths })
    }

    pub fn contains(&self, path: &Utf8Path) -> bool {
        self.paths.contains(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.paths.iter().map(Utf8PathBuf::as_path)
    }

    pub fn add(&mut self, path: &Utf8Path) -> Result<(), DropstoreError> {
        if self.paths.insert(path.to_path_buf()) {
            error!(target: "notify", "Path '{path}' could not be processed and is marked as faulty");
            self.persist()?;
        }
        Ok(())
    }

    /// Forgets paths an operator has removed or renamed.
    pub fn prune(&mut self) -> Result<(), DropstoreError> {
        let before = self.paths.len();
        self.paths.retain(|path| path.as_std_path().exists());
        if self.paths.len() != before {
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), DropstoreError> {
        let mut content = String::new();
        for path in &self.paths {
            content.push_str(path.as_str());
            content.push('\n');
        }
        Store::write_bytes_atomic(&self.file, content.as_bytes())
    }
}

pub struct HighWaterMark {
    path: Utf8PathBuf,
    threshold_kb: Option<u64>,
    provider: Arc<dyn FreeSpaceProvider>,
    throttled: bool,
}

impl HighWaterMark {
    pub fn new(
        path: Utf8PathBuf,
        threshold_kb: Option<u64>,
        provider: Arc<dyn FreeSpaceProvider>,
    ) -> Self {
        Self {
            path,
            threshold_kb,
            provider,
            throttled: false,
        }
    }

    pub fn allows_work(&mut self) -> bool {
        let Some(threshold) = self.threshold_kb else {
            return true;
        };
        let free = match self.provider.free_space_kb(&self.path) {
            Ok(free) => free,
            Err(err) => {
                warn!("Cannot determine free space on '{}': {err}", self.path);
                return true;
            }
        };
        if free < threshold {
            if !self.throttled {
                warn!(
                    target: "notify",
                    "The amount of available space ({free} KB) on '{}' is lower than the specified high water mark ({threshold} KB).",
                    self.path
                );
            }
            self.throttled = true;
            return false;
        }
        if self.throttled {
            info!(
                target: "notify",
                "The amount of available space ({free} KB) on '{}' is again sufficient (greater than the specified high water mark: {threshold} KB).",
                self.path
            );
        }
        self.throttled = false;
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub processed: usize,
    pub failed: usize,
    pub skipped_faulty: usize,
    pub throttled: bool,
    pub interrupted: bool,
}

pub struct DirectoryScanner {
    name: String,
    incoming_dir: Utf8PathBuf,
    detector: Box<dyn CompletenessDetector>,
    handler: Arc<dyn PathHandler>,
    faulty: FaultyPaths,
    reprocess_faulty: bool,
    high_water_mark: HighWaterMark,
    check_interval: Duration,
    clock: Arc<dyn TimeProvider>,
    stop: StopToken,
}

impl DirectoryScanner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        incoming_dir: Utf8PathBuf,
        detector: Box<dyn CompletenessDetector>,
        handler: Arc<dyn PathHandler>,
        reprocess_faulty: bool,
        high_water_mark: HighWaterMark,
        check_interval: Duration,
        clock: Arc<dyn TimeProvider>,
        stop: StopToken,
    ) -> Result<Self, DropstoreError> {
        let faulty = FaultyPaths::load(&incoming_dir)?;
        Ok(Self {
            name: name.to_string(),
            incoming_dir,
            detector,
            handler,
            faulty,
            reprocess_faulty,
            high_water_mark,
            check_interval,
            clock,
            stop,
        })
    }

    pub fn faulty_paths(&self) -> &FaultyPaths {
        &self.faulty
    }

    /// One pass over the watched directory. Only defects end the scanner.
    pub fn scan_once(&mut self) -> Result<ScanReport, DropstoreError> {
        let mut report = ScanReport::default();
        if !self.high_water_mark.allows_work() {
            report.throttled = true;
            return Ok(report);
        }

        let entries = match self.list_candidates() {
            Ok(entries) => entries,
            Err(err) => {
                error!("Cannot list incoming directory '{}': {err}", self.incoming_dir);
                return Ok(report);
            }
        };
        self.detector.retain_listed(&entries);
        if let Err(err) = self.faulty.prune() {
            warn!("{err}");
        }

        for path in entries {
            if self.stop.is_stop_requested() {
                report.interrupted = true;
                break;
            }
            if !self.reprocess_faulty && self.faulty.contains(&path) {
                report.skipped_faulty += 1;
                continue;
            }

            let item = match self.detector.check(&path) {
                Ok(Some(item)) => item,
                Ok(None) => continue,
                Err(err) => {
                    error!(target: "notify", "Thread '{}': {err}", self.name);
                    report.failed += 1;
                    self.mark_faulty_if_present(&path);
                    continue;
                }
            };

            match self.handler.handle(&item) {
                Ok(RegistrationOutcome::Interrupted) => {
                    info!("Thread '{}': processing of '{path}' interrupted", self.name);
                    report.interrupted = true;
                    break;
                }
                Ok(outcome) => {
                    debug!("Thread '{}': '{path}' handled: {outcome:?}", self.name);
                    report.processed += 1;
                }
                Err(err) if err.is_defect() => return Err(err),
                Err(err) => {
                    error!(
                        target: "notify",
                        "Thread '{}': processing of '{}' failed: {err}",
                        self.name,
                        item.incoming()
                    );
                    report.failed += 1;
                }
            }
            self.mark_faulty_if_present(&path);
        }
        Ok(report)
    }

    pub fn run(mut self) -> Result<(), DropstoreError> {
        info!(
            "Thread '{}' watching '{}' every {:?}",
            self.name, self.incoming_dir, self.check_interval
        );
        while !self.stop.is_stop_requested() {
            self.scan_once()?;
            let mut remaining = self.check_interval;
            while !remaining.is_zero() && !self.stop.is_stop_requested() {
                let step = remaining.min(STOP_POLL_INTERVAL);
                self.clock.sleep(step);
                remaining -= step;
            }
        }
        info!("Thread '{}' stopped", self.name);
        Ok(())
    }

    fn list_candidates(&self) -> io::Result<Vec<Utf8PathBuf>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.incoming_dir.as_std_path())? {
            let entry = entry?;
            let Ok(name) = entry.file_name().into_string() else {
                warn!(
                    "Ignoring non UTF-8 entry {:?} in '{}'",
                    entry.file_name(),
                    self.incoming_dir
                );
                continue;
            };
            if name == FAULTY_PATHS_FILE || !self.detector.accepts_entry(&name) {
                continue;
            }
            entries.push(self.incoming_dir.join(name));
        }
        entries.sort();
        Ok(entries)
    }

    fn mark_faulty_if_present(&mut self, path: &Utf8Path) {
        if self.reprocess_faulty || self.stop.is_stop_requested() || !path.as_std_path().exists()
        {
            return;
        }
        if let Err(err) = self.faulty.add(path) {
            error!("{err}");
        }
    }
}
