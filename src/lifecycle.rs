use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::error::DropstoreError;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Cooperative cancellation shared by every worker of one service instance.
#[derive(Debug, Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn check(&self, subject: &str) -> Result<(), DropstoreError> {
        if self.is_stop_requested() {
            return Err(DropstoreError::Interrupted(subject.to_string()));
        }
        Ok(())
    }
}

/// Serializes the commit window of one registrator and lets shutdown wait for it.
#[derive(Debug, Default)]
pub struct CommitGate {
    busy: Mutex<bool>,
    idle: Condvar,
}

pub struct CommitGuard<'a> {
    gate: &'a CommitGate,
}

impl CommitGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> CommitGuard<'_> {
        let busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        let mut busy = self
            .idle
            .wait_while(busy, |busy| *busy)
            .unwrap_or_else(PoisonError::into_inner);
        *busy = true;
        CommitGuard { gate: self }
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `false` if a commit was still running when the timeout elapsed.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        let (busy, _) = self
            .idle
            .wait_timeout_while(busy, timeout, |busy| *busy)
            .unwrap_or_else(PoisonError::into_inner);
        !*busy
    }
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        let mut busy = self.gate.busy.lock().unwrap_or_else(PoisonError::into_inner);
        *busy = false;
        self.gate.idle.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub forced: bool,
    pub unfinished_workers: usize,
}

/// Two-phase shutdown: signal stop, then wait for in-flight commits and workers until a deadline.
pub struct Shutdown {
    stop: StopToken,
    gates: Vec<Arc<CommitGate>>,
    timeout: Duration,
}

impl Shutdown {
    pub fn new(stop: StopToken, timeout: Duration) -> Self {
        Self {
            stop,
            gates: Vec::new(),
            timeout,
        }
    }

    pub fn watch(&mut self, gate: Arc<CommitGate>) {
        self.gates.push(gate);
    }

    pub fn run(self, workers: Vec<JoinHandle<Result<(), DropstoreError>>>) -> ShutdownOutcome {
        info!("Shutdown requested, stopping {} worker(s)", workers.len());
        self.stop.request_stop();

        let deadline = Instant::now() + self.timeout;
        let mut forced = false;
        for gate in &self.gates {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !gate.wait_idle(remaining) {
                warn!(
                    "Registration still committing after {:?}, continuing shutdown",
                    self.timeout
                );
                forced = true;
            }
        }

        let mut pending = workers;
        while !pending.is_empty() && Instant::now() < deadline {
            let (finished, running): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|worker| worker.is_finished());
            for worker in finished {
                match worker.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => error!("Worker terminated with error: {err}"),
                    Err(_) => error!("Worker panicked"),
                }
            }
            pending = running;
            if !pending.is_empty() {
                thread::sleep(JOIN_POLL_INTERVAL);
            }
        }
        if !pending.is_empty() {
            warn!("{} worker(s) did not stop before the shutdown deadline", pending.len());
            forced = true;
        }

        ShutdownOutcome {
            forced,
            unfinished_workers: pending.len(),
        }
    }
}
