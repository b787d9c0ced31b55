//! Module containing the [`Runtime`] execution context.
//!
//! The runtime replaces process-wide globals: it owns the worker pool and
//! the cooperative stop flag, and carries the rate-limited progress
//! observer. It is created once by the driver and passed by reference into
//! the propagator.

use crate::error::{ConfigError, Error};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Snapshot handed to the progress observer after each phase.
#[derive(Clone, Copy, Debug)]
pub struct PhaseReport<'a> {
    /// Name of the completed phase.
    pub phase: &'a str,
    /// Wall-clock duration of the phase.
    pub duration: Duration,
}

type Observer = Box<dyn Fn(&PhaseReport<'_>) + Send + Sync>;

struct Monitor {
    observer: Observer,
    min_interval: Duration,
    last: Option<Instant>,
}

/// Execution context shared by the propagation phases.
pub struct Runtime {
    pool: rayon::ThreadPool,
    workers: usize,
    stop: AtomicBool,
    monitor: Mutex<Option<Monitor>>,
}

impl Runtime {
    /// Builds a runtime with a fixed-size worker pool of `workers`
    /// threads.
    ///
    /// # Errors
    ///
    /// Returns a config error when the pool cannot be created.
    pub fn new(workers: usize) -> Result<Self, Error> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|err| {
                Error::Config(ConfigError::InvalidValue {
                    key: "runtime/numThreads".to_owned(),
                    reason: err.to_string(),
                })
            })?;

        Ok(Self {
            pool,
            workers,
            stop: AtomicBool::new(false),
            monitor: Mutex::new(None),
        })
    }

    /// The worker pool.
    #[must_use]
    pub const fn pool(&self) -> &rayon::ThreadPool {
        &self.pool
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Requests cooperative cancellation; checked between phases, never
    /// within one.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Attaches a progress observer invoked between phases, at most once
    /// per `min_interval`.
    pub fn set_monitor(&self, observer: Observer, min_interval: Duration) {
        *self.monitor.lock().unwrap() = Some(Monitor {
            observer,
            min_interval,
            last: None,
        });
    }

    /// Reports a completed phase to the observer, rate-limited.
    pub fn observe_phase(&self, report: &PhaseReport<'_>) {
        let mut guard = self.monitor.lock().unwrap();
        if let Some(monitor) = guard.as_mut() {
            let due = monitor
                .last
                .is_none_or(|last| last.elapsed() >= monitor.min_interval);
            if due {
                (monitor.observer)(report);
                monitor.last = Some(Instant::now());
            }
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.workers)
            .field("stop", &self.stop_requested())
            .finish_non_exhaustive()
    }
}
