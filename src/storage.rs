//! Date-partitioned artifact store.
//!
//! Layout: `{base}/{YYYY-MM-DD}/{YYYYmmdd_HHMMSS_mmm}_{8 hex}.{ext}`. The
//! directory tree is the only source of truth; records are rebuilt from
//! `stat` on every read.

use chrono::{DateTime, Local, NaiveDate, TimeDelta};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{Result, StoreError};
use crate::metrics::{ARTIFACTS_SAVED, ARTIFACT_BYTES_WRITTEN};

pub const BUCKET_FORMAT: &str = "%Y-%m-%d";
pub const ALLOWED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
pub const DEFAULT_EXTENSION: &str = "png";
const MAX_NAME_ATTEMPTS: u32 = 100;

/// One persisted artifact as seen on disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageRecord {
    pub filename: String,
    pub bucket: NaiveDate,
    pub size_bytes: u64,
    pub created_at: DateTime<Local>,
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketUsage {
    pub date: NaiveDate,
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStats {
    pub total_files: u64,
    pub total_bytes: u64,
    pub total_mb: f64,
    pub buckets: Vec<BucketUsage>,
    pub base_directory: String,
}

/// Bytes to megabytes, rounded to two decimals.
pub fn to_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}

/// Rejects anything that could escape a bucket or isn't an allowed image name.
pub fn validate_filename(filename: &str) -> Result<()> {
    let invalid = || StoreError::InvalidFilename(filename.to_string());

    if filename.is_empty() {
        return Err(invalid());
    }
    if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
        return Err(invalid());
    }
    if !filename
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        return Err(invalid());
    }

    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .ok_or_else(invalid)?;
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(invalid());
    }
    Ok(())
}

/// 8 hex chars of the prompt digest
pub fn prompt_hash(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    format!("{digest:x}")[..8].to_string()
}

pub fn make_filename(at: DateTime<Local>, prompt: &str, extension: &str) -> String {
    format!("{}_{}.{}", at.format("%Y%m%d_%H%M%S_%3f"), prompt_hash(prompt), extension)
}

/// `name_N.ext` for the N-th retry of a taken name.
fn numbered(filename: &str, n: u32) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}_{n}.{ext}"),
        None => format!("{filename}_{n}"),
    }
}

pub fn parse_bucket(name: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(name, BUCKET_FORMAT).ok()
}

pub struct ArtifactStore {
    base_dir: PathBuf,
    resolve_search_days: u32,
    clock: Arc<dyn Clock>,
}

impl ArtifactStore {
    /// Opens (and creates if needed) the base directory.
    pub fn open(
        base_dir: impl Into<PathBuf>,
        resolve_search_days: u32,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).map_err(|e| {
            StoreError::io(format!("creating base directory {}", base_dir.display()), e)
        })?;
        info!(base_dir = %base_dir.display(), resolve_search_days, "Artifact store ready");

        Ok(Self { base_dir, resolve_search_days, clock })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn resolve_search_days(&self) -> u32 {
        self.resolve_search_days
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn bucket_path(&self, date: NaiveDate) -> PathBuf {
        self.base_dir.join(date.format(BUCKET_FORMAT).to_string())
    }

    pub fn save(&self, bytes: &[u8], prompt: &str) -> Result<StorageRecord> {
        self.save_with_extension(bytes, prompt, DEFAULT_EXTENSION)
    }

    /// Writes into today's bucket. A record is only returned once the file
    /// is confirmed on disk with a non-zero size; partial files are removed.
    pub fn save_with_extension(
        &self,
        bytes: &[u8],
        prompt: &str,
        extension: &str,
    ) -> Result<StorageRecord> {
        let extension = extension.trim_start_matches('.').to_ascii_lowercase();
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(StoreError::InvalidExtension(extension));
        }

        let now = self.clock.now();
        let bucket = now.date_naive();
        let filename = make_filename(now, prompt, &extension);
        validate_filename(&filename)?;

        let dir = self.bucket_path(bucket);
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::io(format!("creating bucket {bucket}"), e))?;

        // same prompt in the same millisecond: the existing file belongs to
        // an earlier save, so take the next numbered name instead
        let mut attempt = 0;
        let (filename, path) = loop {
            let candidate = match attempt {
                0 => filename.clone(),
                n => numbered(&filename, n),
            };
            let path = dir.join(&candidate);
            match write_new(&path, bytes) {
                Ok(()) => break (candidate, path),
                Err(e)
                    if e.kind() == io::ErrorKind::AlreadyExists && attempt < MAX_NAME_ATTEMPTS =>
                {
                    debug!(filename = %candidate, bucket = %bucket, "Name taken, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    let context = format!("writing {candidate} in bucket {bucket}");
                    return Err(StoreError::io(context, e));
                }
            }
        };

        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            Err(e) => {
                discard(&path);
                return Err(StoreError::io(format!("verifying {filename} in bucket {bucket}"), e));
            }
        };
        if meta.len() == 0 {
            discard(&path);
            return Err(StoreError::EmptyWrite(path));
        }

        ARTIFACTS_SAVED.inc();
        ARTIFACT_BYTES_WRITTEN.inc_by(meta.len() as f64);
        info!(filename = %filename, bucket = %bucket, size = meta.len(), "File saved");

        Ok(StorageRecord {
            filename,
            bucket,
            size_bytes: meta.len(),
            created_at: modified_time(&meta).unwrap_or(now),
            path,
        })
    }

    /// Searches the most recent `resolve_search_days` buckets, newest first.
    /// Names failing validation are reported as not found without touching disk.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf> {
        if validate_filename(filename).is_err() {
            return Err(StoreError::NotFound(filename.to_string()));
        }

        let today = self.clock.now().date_naive();
        for days_back in 0..self.resolve_search_days {
            let Some(date) = today.checked_sub_signed(TimeDelta::days(days_back.into())) else {
                break;
            };
            if let Some(path) = self.lookup(filename, date)? {
                return Ok(path);
            }
        }
        Err(StoreError::NotFound(filename.to_string()))
    }

    /// Looks only in the given bucket.
    pub fn resolve_on(&self, filename: &str, date: NaiveDate) -> Result<PathBuf> {
        if validate_filename(filename).is_err() {
            return Err(StoreError::NotFound(filename.to_string()));
        }
        self.lookup(filename, date)?
            .ok_or_else(|| StoreError::NotFound(filename.to_string()))
    }

    fn lookup(&self, filename: &str, date: NaiveDate) -> Result<Option<PathBuf>> {
        let path = self.bucket_path(date).join(filename);
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(path)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(format!("stat {filename} in bucket {date}"), e)),
        }
    }

    pub fn info(&self, filename: &str) -> Result<StorageRecord> {
        let path = self.resolve(filename)?;
        let bucket = path
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .and_then(parse_bucket)
            .ok_or_else(|| StoreError::NotFound(filename.to_string()))?;
        let meta = fs::metadata(&path)
            .map_err(|e| StoreError::io(format!("stat {filename} in bucket {bucket}"), e))?;

        Ok(StorageRecord {
            filename: filename.to_string(),
            bucket,
            size_bytes: meta.len(),
            created_at: modified_time(&meta).unwrap_or_else(|| self.clock.now()),
            path,
        })
    }

    /// Removes one artifact found through `resolve`. Returns the freed size.
    pub fn delete(&self, filename: &str) -> Result<u64> {
        let record = self.info(filename)?;
        fs::remove_file(&record.path).map_err(|e| {
            StoreError::io(format!("deleting {filename} in bucket {}", record.bucket), e)
        })?;
        info!(filename = %filename, bucket = %record.bucket, "File deleted");
        Ok(record.size_bytes)
    }

    /// Newest first. Without a date every bucket is scanned.
    pub fn list(&self, date: Option<NaiveDate>, limit: Option<usize>) -> Result<Vec<StorageRecord>> {
        let buckets = match date {
            Some(date) => {
                let dir = self.bucket_path(date);
                if dir.is_dir() { vec![(date, dir)] } else { Vec::new() }
            }
            None => self.buckets()?,
        };

        let mut records = Vec::new();
        for (date, dir) in buckets {
            records.extend(self.bucket_files(date, &dir)?);
        }

        records.sort_by(|a, b| {
            b.created_at.cmp(&a.created_at).then_with(|| b.filename.cmp(&a.filename))
        });
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    pub fn stats(&self) -> Result<StorageStats> {
        let mut buckets = Vec::new();
        let (mut total_files, mut total_bytes) = (0u64, 0u64);

        for (date, dir) in self.buckets()? {
            let files = self.bucket_files(date, &dir)?;
            if files.is_empty() {
                continue;
            }
            let bytes: u64 = files.iter().map(|f| f.size_bytes).sum();
            total_files += files.len() as u64;
            total_bytes += bytes;
            buckets.push(BucketUsage { date, files: files.len() as u64, bytes });
        }
        buckets.sort_by(|a, b| b.date.cmp(&a.date));

        Ok(StorageStats {
            total_files,
            total_bytes,
            total_mb: to_mb(total_bytes),
            buckets,
            base_directory: self.base_dir.display().to_string(),
        })
    }

    /// Date-named directories directly under the base. Anything else is skipped.
    pub(crate) fn buckets(&self) -> Result<Vec<(NaiveDate, PathBuf)>> {
        let entries = fs::read_dir(&self.base_dir).map_err(|e| {
            StoreError::io(format!("reading base directory {}", self.base_dir.display()), e)
        })?;

        let mut buckets = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("reading base directory entry", e))?;
            let name = entry.file_name();
            let Some(date) = name.to_str().and_then(parse_bucket) else {
                debug!(entry = ?name, "Skipping non-bucket entry");
                continue;
            };
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => buckets.push((date, entry.path())),
                Ok(_) => debug!(entry = ?name, "Skipping non-directory bucket name"),
                Err(e) => warn!(entry = ?name, error = %e, "Could not stat bucket"),
            }
        }
        Ok(buckets)
    }

    /// Files in one bucket that pass filename validation.
    pub(crate) fn bucket_files(&self, date: NaiveDate, dir: &Path) -> Result<Vec<StorageRecord>> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(format!("reading bucket {date}"), e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(format!("reading bucket {date}"), e))?;
            let Some(filename) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_filename(&filename).is_err() {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                // removed between readdir and stat
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(StoreError::io(format!("stat {filename} in bucket {date}"), e));
                }
            };
            records.push(StorageRecord {
                filename,
                bucket: date,
                size_bytes: meta.len(),
                created_at: modified_time(&meta).unwrap_or_else(|| self.clock.now()),
                path: entry.path(),
            });
        }
        Ok(records)
    }
}

/// Creates `path` exclusively. Only a file this call created is removed on failure.
fn write_new(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let written = file.write_all(bytes).and_then(|()| file.sync_all());
    if written.is_err() {
        drop(file);
        discard(path);
    }
    written
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "Could not remove partial file");
        }
    }
}

fn modified_time(meta: &fs::Metadata) -> Option<DateTime<Local>> {
    meta.modified().ok().map(DateTime::<Local>::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn store_at(start: DateTime<Local>) -> (ArtifactStore, ManualClock, TempDir) {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(start);
        let store = ArtifactStore::open(dir.path(), 7, Arc::new(clock.clone())).unwrap();
        (store, clock, dir)
    }

    fn noon(y: i32, m: u32, d: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn validation_rules() {
        assert!(validate_filename("20240101_120000_000_abcdef12.png").is_ok());
        assert!(validate_filename("photo.JPEG").is_ok());

        for bad in ["", "../../etc/passwd", "a/b.png", "a\\b.png", "x.exe", "no_ext", "sp ace.png", ".png", "..png"] {
            assert!(validate_filename(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn filename_format() {
        let at = Local.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap() + TimeDelta::milliseconds(7);
        let name = make_filename(at, "a red fox", "png");

        assert!(name.starts_with("20240101_120000_007_"), "{name}");
        assert!(name.ends_with(".png"));
        assert_eq!(name.len(), "20240101_120000_007_".len() + 8 + ".png".len());
        assert!(validate_filename(&name).is_ok());
    }

    #[test]
    fn save_writes_into_today_bucket() {
        let (store, _clock, dir) = store_at(noon(2024, 3, 5));
        let record = store.save(b"\x89PNG fake", "a cat").unwrap();

        assert_eq!(record.bucket, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert_eq!(record.size_bytes, 9);
        assert_eq!(record.path, dir.path().join("2024-03-05").join(&record.filename));
        assert_eq!(fs::read(&record.path).unwrap(), b"\x89PNG fake");
    }

    #[test]
    fn empty_write_is_not_reported() {
        let (store, _clock, dir) = store_at(noon(2024, 3, 5));
        let err = store.save(b"", "nothing").unwrap_err();

        assert!(matches!(err, StoreError::EmptyWrite(_)));
        assert_eq!(fs::read_dir(dir.path().join("2024-03-05")).unwrap().count(), 0);
    }

    #[test]
    fn disallowed_extension_rejected_before_io() {
        let (store, _clock, dir) = store_at(noon(2024, 3, 5));
        let err = store.save_with_extension(b"data", "p", "gif").unwrap_err();

        assert!(matches!(err, StoreError::InvalidExtension(_)));
        assert!(!dir.path().join("2024-03-05").exists());
    }

    #[test]
    fn resolve_on_explicit_date() {
        let (store, clock, _dir) = store_at(noon(2024, 3, 5));
        let record = store.save(b"data", "p").unwrap();

        clock.advance(TimeDelta::days(30));
        assert!(store.resolve(&record.filename).is_err());
        assert_eq!(store.resolve_on(&record.filename, record.bucket).unwrap(), record.path);
    }

    #[test]
    fn stats_skip_stray_entries() {
        let (store, clock, dir) = store_at(noon(2024, 3, 5));
        store.save(b"12345", "one").unwrap();
        clock.advance(TimeDelta::days(1));
        store.save(b"123", "two").unwrap();
        store.save(b"1234567", "three").unwrap();

        fs::write(dir.path().join("cleanup_log.txt"), "x").unwrap();
        fs::create_dir(dir.path().join("not-a-date")).unwrap();
        fs::write(dir.path().join("not-a-date").join("x.png"), "zz").unwrap();
        fs::write(dir.path().join("2024-03-06").join("notes.txt"), "ignored").unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.total_bytes, 15);
        assert_eq!(stats.buckets.len(), 2);
        assert_eq!(stats.buckets[0].date, NaiveDate::from_ymd_opt(2024, 3, 6).unwrap());
        assert_eq!(stats.buckets[0].files, 2);
        assert_eq!(stats.buckets[0].bytes, 10);
    }

    #[test]
    fn list_filters_and_limits() {
        let (store, clock, _dir) = store_at(noon(2024, 3, 5));
        store.save(b"a", "one").unwrap();
        clock.advance(TimeDelta::days(1));
        store.save(b"b", "two").unwrap();
        clock.advance(TimeDelta::milliseconds(5));
        store.save(b"c", "three").unwrap();

        let names: Vec<_> =
            store.list(None, None).unwrap().into_iter().map(|r| r.filename).collect();
        assert_eq!(names.len(), 3);
        assert_eq!(names[0], make_filename(clock.now(), "three", "png"));
        assert_eq!(names[1], make_filename(clock.now() - TimeDelta::milliseconds(5), "two", "png"));
        assert_eq!(names[2], make_filename(noon(2024, 3, 5), "one", "png"));

        let limited = store.list(None, Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].filename, names[0]);

        let day_one = store.list(NaiveDate::from_ymd_opt(2024, 3, 5), None).unwrap();
        assert_eq!(day_one.len(), 1);
        assert!(store.list(NaiveDate::from_ymd_opt(2020, 1, 1), None).unwrap().is_empty());
    }

    #[test]
    fn same_prompt_same_millisecond_keeps_both() {
        let (store, _clock, _dir) = store_at(noon(2024, 3, 5));
        let first = store.save(b"first", "same prompt").unwrap();
        let second = store.save(b"second!", "same prompt").unwrap();

        assert_ne!(first.filename, second.filename);
        assert!(validate_filename(&second.filename).is_ok());
        assert_eq!(second.filename, numbered(&first.filename, 1));
        assert_eq!(fs::read(store.resolve(&first.filename).unwrap()).unwrap(), b"first");
        assert_eq!(fs::read(store.resolve(&second.filename).unwrap()).unwrap(), b"second!");
    }

    #[test]
    fn delete_removes_single_file() {
        let (store, _clock, _dir) = store_at(noon(2024, 3, 5));
        let record = store.save(b"abcd", "p").unwrap();
        let info = store.info(&record.filename).unwrap();
        assert_eq!(info.size_bytes, 4);
        assert_eq!(info.bucket, record.bucket);

        assert_eq!(store.delete(&record.filename).unwrap(), 4);
        assert!(matches!(store.resolve(&record.filename), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete("../x.png"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn mb_rounding() {
        assert_eq!(to_mb(0), 0.0);
        assert_eq!(to_mb(1024 * 1024), 1.0);
        assert_eq!(to_mb(1024 * 1024 * 3 / 2), 1.5);
    }
}
