//! Retention sweeps over the artifact store.
//!
//! A sweep deletes every file in day-buckets strictly older than
//! `today - cutoff_days`, then removes those buckets once empty. Each sweep
//! appends one line to `cleanup_log.txt` under the store's base directory;
//! the timestamp of the last line decides whether a scheduled sweep is due.

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeDelta, TimeZone};
use serde::Serialize;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::error::{LogParseError, Result, StoreError};
use crate::metrics::{CLEANUP_BYTES_FREED, CLEANUP_FILES_DELETED, CLEANUP_RUNS};
use crate::storage::{ArtifactStore, StorageRecord, StorageStats, to_mb};

pub const CLEANUP_LOG_FILE: &str = "cleanup_log.txt";
const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

fn schedule_period() -> TimeDelta {
    TimeDelta::hours(24)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepPhase {
    Enumerating,
    Deleting,
    PruningDirs,
    Logged,
}

impl fmt::Display for SweepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SweepPhase::Enumerating => "enumerating",
            SweepPhase::Deleting => "deleting",
            SweepPhase::PruningDirs => "pruning_dirs",
            SweepPhase::Logged => "logged",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub cutoff_date: NaiveDate,
    pub max_age_days: u32,
    pub files_found: u64,
    pub files_deleted: u64,
    pub dirs_removed: u64,
    pub bytes_freed: u64,
    pub bytes_eligible: u64,
    pub size_freed_mb: f64,
    pub potential_size_to_free_mb: f64,
}

/// One line of the cleanup log
#[derive(Debug, Clone, PartialEq)]
pub struct CleanupLogEntry {
    pub timestamp: DateTime<Local>,
    pub dry_run: bool,
    pub files_found: u64,
    pub files_deleted: u64,
    pub bytes_freed: u64,
}

impl CleanupLogEntry {
    pub fn to_line(&self) -> String {
        format!(
            "{} - Cleanup{}: Found {} files, Deleted {} files, Freed {:?} MB",
            self.timestamp.naive_local().format(LOG_TIMESTAMP_FORMAT),
            if self.dry_run { " (DRY RUN)" } else { "" },
            self.files_found,
            self.files_deleted,
            to_mb(self.bytes_freed),
        )
    }
}

/// Timestamp field of a log line: everything before the first `" - "`.
pub fn parse_log_timestamp(line: &str) -> std::result::Result<DateTime<Local>, LogParseError> {
    let line = line.trim();
    let field = line.split(" - ").next().unwrap_or_default().trim();
    let malformed = || LogParseError::Malformed(line.to_string());

    if let Ok(ts) = DateTime::parse_from_rfc3339(field) {
        return Ok(ts.with_timezone(&Local));
    }
    let naive = NaiveDateTime::parse_from_str(field, "%Y-%m-%dT%H:%M:%S%.f").map_err(|_| malformed())?;
    Local.from_local_datetime(&naive).earliest().ok_or_else(malformed)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ScheduleOutcome {
    Ran(CleanupReport),
    NotDue {
        last_cleanup: DateTime<Local>,
        #[serde(rename = "next_cleanup_in_seconds", serialize_with = "as_secs")]
        next_in: Duration,
    },
}

fn as_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanupStatus {
    pub storage_stats: StorageStats,
    pub last_cleanup: Option<DateTime<Local>>,
    pub files_eligible_for_cleanup: u64,
    pub bytes_eligible: u64,
    pub potential_space_to_free_mb: f64,
    pub max_age_days: u32,
}

pub struct RetentionService {
    store: Arc<ArtifactStore>,
    max_age_days: u32,
    log_path: PathBuf,
    // single-flight: held for the whole sweep
    flight: Mutex<()>,
}

impl RetentionService {
    pub fn new(store: Arc<ArtifactStore>, max_age_days: u32) -> Self {
        let log_path = store.base_dir().join(CLEANUP_LOG_FILE);
        Self { store, max_age_days, log_path, flight: Mutex::new(()) }
    }

    pub fn max_age_days(&self) -> u32 {
        self.max_age_days
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn sweep(&self, cutoff_days: u32, dry_run: bool) -> Result<CleanupReport> {
        let _flight = self.flight.lock().unwrap_or_else(|e| e.into_inner());
        self.sweep_locked(cutoff_days, dry_run, true)
    }

    /// Real sweep with the configured retention, ignoring the schedule.
    pub fn run_forced(&self) -> Result<CleanupReport> {
        info!("Performing forced cleanup");
        self.sweep(self.max_age_days, false)
    }

    pub fn run_if_due(&self) -> Result<ScheduleOutcome> {
        let _flight = self.flight.lock().unwrap_or_else(|e| e.into_inner());

        match self.last_cleanup() {
            Ok(last) => {
                let elapsed = self.now() - last;
                if elapsed <= schedule_period() {
                    let next_in = (schedule_period() - elapsed).to_std().unwrap_or_default();
                    debug!(last_cleanup = %last, ?next_in, "Cleanup not needed yet");
                    return Ok(ScheduleOutcome::NotDue { last_cleanup: last, next_in });
                }
            }
            Err(reason) => debug!(%reason, "No usable previous cleanup"),
        }

        info!("Performing scheduled cleanup");
        self.sweep_locked(self.max_age_days, false, true).map(ScheduleOutcome::Ran)
    }

    pub fn due_for_scheduled_run(&self) -> bool {
        match self.last_cleanup() {
            Ok(last) => self.now() - last > schedule_period(),
            Err(_) => true,
        }
    }

    /// Timestamp of the last non-empty log line.
    pub fn last_cleanup(&self) -> std::result::Result<DateTime<Local>, LogParseError> {
        let contents = match fs::read_to_string(&self.log_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(LogParseError::Missing),
            Err(e) => return Err(LogParseError::Unreadable(e.to_string())),
        };
        let line = contents
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or(LogParseError::Empty)?;
        parse_log_timestamp(line)
    }

    /// Storage usage plus a dry-run estimate. Does not write to the log.
    pub fn status(&self) -> Result<CleanupStatus> {
        let storage_stats = self.store.stats()?;
        let estimate = {
            let _flight = self.flight.lock().unwrap_or_else(|e| e.into_inner());
            self.sweep_locked(self.max_age_days, true, false)?
        };

        Ok(CleanupStatus {
            storage_stats,
            last_cleanup: self.last_cleanup().ok(),
            files_eligible_for_cleanup: estimate.files_found,
            bytes_eligible: estimate.bytes_eligible,
            potential_space_to_free_mb: estimate.potential_size_to_free_mb,
            max_age_days: self.max_age_days,
        })
    }

    fn now(&self) -> DateTime<Local> {
        self.store.clock().now()
    }

    fn sweep_locked(&self, cutoff_days: u32, dry_run: bool, record: bool) -> Result<CleanupReport> {
        let now = self.now();
        let cutoff_date = now
            .date_naive()
            .checked_sub_signed(TimeDelta::days(cutoff_days.into()))
            .unwrap_or(NaiveDate::MIN);

        debug!(phase = %SweepPhase::Enumerating, %cutoff_date, dry_run, "Sweep");
        let mut expired_dirs = Vec::new();
        let mut candidates: Vec<StorageRecord> = Vec::new();
        for (date, dir) in self.store.buckets()? {
            if date >= cutoff_date {
                continue;
            }
            match self.store.bucket_files(date, &dir) {
                Ok(files) => candidates.extend(files),
                Err(e) => {
                    warn!(bucket = %date, error = %e, "Skipping unreadable bucket");
                    continue;
                }
            }
            expired_dirs.push((date, dir));
        }
        let bytes_eligible: u64 = candidates.iter().map(|c| c.size_bytes).sum();

        let (mut files_deleted, mut bytes_freed, mut dirs_removed) = (0u64, 0u64, 0u64);
        if !dry_run {
            debug!(phase = %SweepPhase::Deleting, candidates = candidates.len(), "Sweep");
            (files_deleted, bytes_freed) = delete_candidates(&candidates);

            debug!(phase = %SweepPhase::PruningDirs, buckets = expired_dirs.len(), "Sweep");
            for (date, dir) in &expired_dirs {
                if remove_if_empty(dir) {
                    dirs_removed += 1;
                    info!(bucket = %date, "Deleted empty directory");
                }
            }
        }

        let report = CleanupReport {
            dry_run,
            cutoff_date,
            max_age_days: cutoff_days,
            files_found: candidates.len() as u64,
            files_deleted,
            dirs_removed,
            bytes_freed,
            bytes_eligible,
            size_freed_mb: to_mb(bytes_freed),
            potential_size_to_free_mb: to_mb(bytes_eligible),
        };

        if record {
            let entry = CleanupLogEntry {
                timestamp: now,
                dry_run,
                files_found: report.files_found,
                files_deleted,
                bytes_freed,
            };
            if let Err(e) = self.append_log(&entry) {
                error!(path = %self.log_path.display(), error = %e, "Failed to write cleanup log");
            }
            CLEANUP_RUNS.inc();
            CLEANUP_FILES_DELETED.inc_by(files_deleted as f64);
            CLEANUP_BYTES_FREED.inc_by(bytes_freed as f64);
            debug!(phase = %SweepPhase::Logged, "Sweep");
        }

        info!(
            dry_run,
            files_found = report.files_found,
            files_deleted,
            dirs_removed,
            bytes_freed,
            bytes_eligible,
            "Cleanup finished"
        );
        Ok(report)
    }

    fn append_log(&self, entry: &CleanupLogEntry) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| StoreError::io("opening cleanup log", e))?;
        writeln!(file, "{}", entry.to_line()).map_err(|e| StoreError::io("appending cleanup log", e))
    }
}

/// Best-effort removal. A failed delete is logged and the rest still go.
/// Returns files deleted and bytes freed.
fn delete_candidates(candidates: &[StorageRecord]) -> (u64, u64) {
    let (mut files_deleted, mut bytes_freed) = (0u64, 0u64);
    for candidate in candidates {
        match fs::remove_file(&candidate.path) {
            Ok(()) => {
                files_deleted += 1;
                bytes_freed += candidate.size_bytes;
                info!(path = %candidate.path.display(), "Deleted old file");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %candidate.path.display(), "Already gone");
            }
            Err(e) => {
                error!(
                    path = %candidate.path.display(),
                    bucket = %candidate.bucket,
                    error = %e,
                    "Failed to delete file"
                );
            }
        }
    }
    (files_deleted, bytes_freed)
}

fn remove_if_empty(dir: &Path) -> bool {
    let empty = match fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                error!(dir = %dir.display(), error = %e, "Failed to inspect directory");
            }
            return false;
        }
    };
    if !empty {
        return false;
    }
    match fs::remove_dir(dir) {
        Ok(()) => true,
        Err(e) => {
            error!(dir = %dir.display(), error = %e, "Failed to delete directory");
            false
        }
    }
}

/// Calls `run_if_due` on a fixed interval.
pub fn spawn_cleanup_scheduler(
    service: Arc<RetentionService>,
    check_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval = ?check_interval, "Cleanup scheduler started");

        loop {
            ticker.tick().await;
            let service = Arc::clone(&service);
            match tokio::task::spawn_blocking(move || service.run_if_due()).await {
                Ok(Ok(ScheduleOutcome::Ran(report))) => {
                    debug!(files_deleted = report.files_deleted, "Scheduled cleanup ran");
                }
                Ok(Ok(ScheduleOutcome::NotDue { .. })) => {}
                Ok(Err(e)) => error!(error = %e, "Scheduled cleanup failed"),
                Err(e) => error!(error = %e, "Scheduled cleanup task panicked"),
            }
        }
    })
}
