//! Background trigger for sync attempts.
//!
//! One attempt runs right after start, then one per interval until the
//! scheduler is stopped. The interval is the replica's `syncInterval` option,
//! read again after every attempt, unless a fixed one is set. Attempts never overlap: the thread runs them one
//! after the other, and the driver's exclusive section keeps them apart from
//! erasure passes and other maintenance.

use crate::core::replica::Replica;
use crate::core::sync::config::SyncConfig;
use crate::core::sync::driver::{SyncDriver, SyncOutcome};
use crate::Result;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

type OutcomeObserver = Box<dyn Fn(&SyncOutcome) + Send>;

/// Shortest wait between attempts taken from configuration.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

pub struct SyncScheduler {
    driver: SyncDriver,
    replica: Arc<Mutex<Replica>>,
    interval: Option<Duration>,
    observer: Option<OutcomeObserver>,
}

/// Stops the scheduler thread when told to, or when dropped.
pub struct SchedulerHandle {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl SyncScheduler {
    pub fn new(driver: SyncDriver, replica: Arc<Mutex<Replica>>) -> Self {
        Self {
            driver,
            replica,
            interval: None,
            observer: None,
        }
    }

    /// Uses `interval` instead of the configured one.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Calls `observer` with the outcome of every attempt.
    #[must_use]
    pub fn on_outcome(mut self, observer: impl Fn(&SyncOutcome) + Send + 'static) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Spawns the scheduler thread.
    pub fn start(self) -> Result<SchedulerHandle> {
        let Self {
            mut driver,
            replica,
            interval,
            observer,
        } = self;
        let (stop, stopped) = mpsc::channel::<()>();

        let thread = thread::Builder::new().name("arbor-sync".to_string()).spawn(move || loop {
            let (outcome, wait) = {
                let mut replica = replica.lock().unwrap_or_else(PoisonError::into_inner);
                let outcome = driver.sync(&mut replica);
                (outcome, next_interval(&driver, &replica, interval))
            };
            if !outcome.success {
                log::warn!("Scheduled sync failed: {}", outcome.message.as_deref().unwrap_or("unknown error"));
            }
            if let Some(observer) = &observer {
                observer(&outcome);
            }

            match stopped.recv_timeout(wait) {
                Err(RecvTimeoutError::Timeout) => continue,
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;

        log::info!("Sync scheduler started");
        Ok(SchedulerHandle {
            stop,
            thread: Some(thread),
        })
    }
}

/// Wait before the next attempt: `fixed` if set, else the configured interval.
fn next_interval(driver: &SyncDriver, replica: &Replica, fixed: Option<Duration>) -> Duration {
    if let Some(fixed) = fixed {
        return fixed;
    }
    match driver.resolve_config(replica) {
        Ok(config) => config.interval().max(MIN_INTERVAL),
        Err(e) => {
            log::warn!("Could not read the sync interval, using the default: {e}");
            SyncConfig::default().interval()
        }
    }
}

impl SchedulerHandle {
    /// Stops the scheduler and waits for a running attempt to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Sync scheduler thread panicked");
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
