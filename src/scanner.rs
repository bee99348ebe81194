//! Background scanner that snapshots high-activity owners into the history store.
//!
//! Each tick takes a ranking snapshot under the registry's shared lock, then
//! persists outside any lock. A failed append is logged and dropped; the next
//! tick takes a fresh snapshot instead of retrying.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::admin::AdminPredicate;
use crate::history::{HighActiveRecord, HistoryStore};
use crate::registry::SlotRegistry;

pub(crate) const DEFAULT_SCAN_INTERVAL_SECS: u64 = 600;
pub(crate) const DEFAULT_SCAN_WINDOW_SECS: i64 = 600;
pub(crate) const DEFAULT_SCAN_THRESHOLD: usize = 5;

/// Upper bound on how long a stop request can go unnoticed.
const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ScannerConfig {
    #[serde(default = "default_enabled")]
    pub(crate) enabled: bool,
    #[serde(default = "default_interval_secs")]
    pub(crate) interval_secs: u64,
    #[serde(default = "default_window_secs")]
    pub(crate) window_secs: i64,
    #[serde(default = "default_threshold")]
    pub(crate) threshold: usize,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}

fn default_window_secs() -> i64 {
    DEFAULT_SCAN_WINDOW_SECS
}

fn default_threshold() -> usize {
    DEFAULT_SCAN_THRESHOLD
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: DEFAULT_SCAN_INTERVAL_SECS,
            window_secs: DEFAULT_SCAN_WINDOW_SECS,
            threshold: DEFAULT_SCAN_THRESHOLD,
        }
    }
}

impl ScannerConfig {
    pub(crate) fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Outcome of a single scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ScanReport {
    /// Owners at or above the threshold, admins included.
    pub(crate) candidates: usize,
    pub(crate) skipped_admins: usize,
    pub(crate) written: usize,
    pub(crate) failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ScannerStats {
    pub(crate) ticks: u64,
    pub(crate) records_written: u64,
    pub(crate) write_failures: u64,
    pub(crate) is_running: bool,
}

/// Handle for controlling the background scanner. Clones share state.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScannerHandle {
    stop_signal: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    records_written: Arc<AtomicU64>,
    write_failures: Arc<AtomicU64>,
    is_running: Arc<AtomicBool>,
}

impl ScannerHandle {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Signal the scanner to stop before its next tick.
    pub(crate) fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    pub(crate) fn should_stop(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub(crate) fn stats(&self) -> ScannerStats {
        ScannerStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            is_running: self.is_running.load(Ordering::Relaxed),
        }
    }

    fn record_tick(&self, report: &ScanReport) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.records_written
            .fetch_add(report.written as u64, Ordering::Relaxed);
        self.write_failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);
    }

    fn set_running(&self, running: bool) {
        self.is_running.store(running, Ordering::SeqCst);
    }

    /// Sleep for `interval`, waking early on stop. Returns true if stop was requested.
    fn wait_or_stop(&self, interval: Duration) -> bool {
        let deadline = Instant::now() + interval;
        loop {
            if self.should_stop() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(STOP_POLL.min(deadline - now));
        }
    }
}

pub(crate) fn scan_once(
    registry: &SlotRegistry,
    admins: &dyn AdminPredicate,
    store: &dyn HistoryStore,
    config: &ScannerConfig,
) -> ScanReport {
    scan_once_at(registry, admins, store, config, Utc::now().timestamp())
}

pub(crate) fn scan_once_at(
    registry: &SlotRegistry,
    admins: &dyn AdminPredicate,
    store: &dyn HistoryStore,
    config: &ScannerConfig,
    now: i64,
) -> ScanReport {
    // The registry lock is released once this returns; persistence below runs unlocked.
    let high = registry.high_active_users_at(config.window_secs, config.threshold, now);

    let mut report = ScanReport {
        candidates: high.len(),
        ..ScanReport::default()
    };
    for entry in high {
        if admins.is_admin(entry.owner_id) {
            tracing::debug!(owner_id = entry.owner_id, "skipping administrator");
            report.skipped_admins += 1;
            continue;
        }
        let record = HighActiveRecord {
            id: 0,
            owner_id: entry.owner_id,
            owner_name: entry.owner_name,
            active_slots: entry.active_slots,
            window_secs: config.window_secs,
            created_at: now,
        };
        match store.append(&record) {
            Ok(_) => report.written += 1,
            Err(err) => {
                report.failed += 1;
                tracing::warn!(
                    owner_id = record.owner_id,
                    active_slots = record.active_slots,
                    error = %err,
                    "failed to persist high-activity record"
                );
            }
        }
    }
    report
}

/// Run the scanner until `handle.stop()` is called.
///
/// Waits one `interval` before the first scan, like a ticker.
pub(crate) fn run_scanner_loop(
    handle: &ScannerHandle,
    config: &ScannerConfig,
    interval: Duration,
    registry: &SlotRegistry,
    admins: &dyn AdminPredicate,
    store: &dyn HistoryStore,
) {
    handle.set_running(true);
    tracing::info!(
        interval_secs = interval.as_secs(),
        window_secs = config.window_secs,
        threshold = config.threshold,
        "high-activity scanner started"
    );

    while !handle.wait_or_stop(interval) {
        let report = scan_once(registry, admins, store, config);
        handle.record_tick(&report);
        if report.written > 0 || report.failed > 0 {
            tracing::info!(
                candidates = report.candidates,
                written = report.written,
                failed = report.failed,
                skipped_admins = report.skipped_admins,
                "high-activity scan complete"
            );
        } else {
            tracing::debug!(candidates = report.candidates, "high-activity scan complete");
        }
    }

    handle.set_running(false);
    let stats = handle.stats();
    tracing::info!(
        ticks = stats.ticks,
        records_written = stats.records_written,
        "high-activity scanner stopped"
    );
}

/// Start the scanner on a named background thread.
pub(crate) fn spawn_scanner(
    config: ScannerConfig,
    registry: Arc<SlotRegistry>,
    admins: Arc<dyn AdminPredicate>,
    store: Arc<dyn HistoryStore>,
) -> io::Result<(ScannerHandle, JoinHandle<()>)> {
    let handle = ScannerHandle::new();
    let worker = handle.clone();
    let join = thread::Builder::new()
        .name("slotwatch-scanner".to_string())
        .spawn(move || {
            let interval = config.interval();
            run_scanner_loop(
                &worker,
                &config,
                interval,
                &registry,
                admins.as_ref(),
                store.as_ref(),
            );
        })?;
    Ok((handle, join))
}
