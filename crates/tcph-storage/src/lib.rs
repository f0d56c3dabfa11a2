//! On-disk dataset layout, atomic commits, retention, and HTTP fetch.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use reqwest::StatusCode;
use tcph_core::{format_day, parse_day};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tcph-storage";

/// File name used inside every `date=<d>` partition directory.
pub const PARTITION_FILE: &str = "part.parquet";

/// Paths of every artifact the pipeline reads or writes, rooted at one base
/// directory. Transient directories (`archives/`, `extracted/`) are deleted
/// at the end of a run; partition directories are permanent or
/// retention-managed.
#[derive(Debug, Clone)]
pub struct DatasetLayout {
    base: PathBuf,
}

impl DatasetLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.base.join("archives")
    }

    pub fn archive_path(&self, date: NaiveDate) -> PathBuf {
        self.archives_dir()
            .join(format!("prices-{}.zip", format_day(date)))
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.base.join("extracted")
    }

    pub fn raw_daily_dir(&self) -> PathBuf {
        self.base.join("raw_daily")
    }

    pub fn curated_dir(&self) -> PathBuf {
        self.base.join("curated")
    }

    pub fn raw_partition(&self, date: NaiveDate) -> PathBuf {
        partition_path(&self.raw_daily_dir(), date)
    }

    pub fn curated_partition(&self, date: NaiveDate) -> PathBuf {
        partition_path(&self.curated_dir(), date)
    }

    pub fn products_path(&self) -> PathBuf {
        self.base.join("products.parquet")
    }

    pub fn groups_path(&self) -> PathBuf {
        self.base.join("groups.parquet")
    }

    pub fn combined_path(&self) -> PathBuf {
        self.base.join("combined.parquet")
    }

    pub fn ensure_base_dirs(&self) -> anyhow::Result<()> {
        for dir in [
            self.archives_dir(),
            self.extracted_dir(),
            self.raw_daily_dir(),
            self.curated_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        Ok(())
    }
}

fn partition_path(root: &Path, date: NaiveDate) -> PathBuf {
    root.join(format!("date={}", format_day(date)))
        .join(PARTITION_FILE)
}

/// Dates of the `date=<d>` partition directories under `root`, ascending.
/// A missing root directory reads as an empty dataset.
pub fn partition_dates(root: &Path) -> anyhow::Result<Vec<NaiveDate>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut dates = Vec::new();
    let entries =
        std::fs::read_dir(root).with_context(|| format!("listing {}", root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("listing {}", root.display()))?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let Some(day) = name.to_str().and_then(|n| n.strip_prefix("date=")) else {
            continue;
        };
        match parse_day(day) {
            Ok(date) => dates.push(date),
            Err(err) => warn!(
                partition = %name.to_string_lossy(),
                error = %err,
                "ignoring partition directory with unparseable date"
            ),
        }
    }
    dates.sort_unstable();
    Ok(dates)
}

/// Sibling staging path for an atomic replace of `target`; also creates the
/// parent directory so the caller can open the staging file directly.
pub fn prepare_staging(target: &Path) -> anyhow::Result<PathBuf> {
    let parent = target
        .parent()
        .with_context(|| format!("{} has no parent directory", target.display()))?;
    std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    let name = target
        .file_name()
        .with_context(|| format!("{} has no file name", target.display()))?
        .to_string_lossy()
        .into_owned();
    Ok(parent.join(format!(".{name}.{}.tmp", Uuid::new_v4())))
}

/// Promote a fully-written staging file over its canonical path. The rename
/// is the commit point: readers only ever see the old file or the new one.
pub fn promote(staging: &Path, target: &Path) -> anyhow::Result<()> {
    std::fs::rename(staging, target).with_context(|| {
        format!(
            "promoting staged file {} -> {}",
            staging.display(),
            target.display()
        )
    })
}

/// Write `bytes` to `target` through a staging file and rename.
pub async fn write_bytes_atomic(target: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let staging = prepare_staging(target)?;
    let result = async {
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&staging)
            .await
            .with_context(|| format!("opening staging file {}", staging.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing staging file {}", staging.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing staging file {}", staging.display()))?;
        drop(file);
        promote(&staging, target)
    }
    .await;
    if result.is_err() {
        let _ = fs::remove_file(&staging).await;
    }
    result
}

#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    pub kept: usize,
    pub removed: Vec<NaiveDate>,
}

/// Keep the `keep` most recent raw per-day partitions and delete the rest.
/// An individual partition that fails to delete is logged and left behind;
/// retention never blocks dataset correctness.
pub fn prune_raw_partitions(
    layout: &DatasetLayout,
    keep: usize,
) -> anyhow::Result<PruneReport> {
    let root = layout.raw_daily_dir();
    let mut dates = partition_dates(&root)?;
    dates.sort_unstable_by(|a, b| b.cmp(a));

    let mut report = PruneReport {
        kept: dates.len().min(keep),
        removed: Vec::new(),
    };
    for date in dates.into_iter().skip(keep) {
        let dir = root.join(format!("date={}", format_day(date)));
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => report.removed.push(date),
            Err(err) => warn!(
                partition = %dir.display(),
                error = %err,
                "failed to prune raw partition"
            ),
        }
    }
    Ok(report)
}

/// Delete the run's transient download/extraction directories. `archives/`
/// always goes; `extracted/` survives when the operator asked to keep it.
pub fn remove_transient_dirs(layout: &DatasetLayout, keep_extracted: bool) -> anyhow::Result<()> {
    remove_dir_if_present(&layout.archives_dir())?;
    if !keep_extracted {
        remove_dir_if_present(&layout.extracted_dir())?;
    }
    Ok(())
}

fn remove_dir_if_present(dir: &Path) -> anyhow::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing {}", dir.display())),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin retrying HTTP client for the upstream archive/metadata endpoints.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Fetch a URL, retrying transient failures; `Ok(None)` when the server
    /// reports the resource as absent (404), which callers treat as a
    /// zero-row day rather than an error.
    pub async fn fetch_optional(&self, url: &str) -> Result<Option<Vec<u8>>, FetchError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(Some(body));
                    }
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }

    /// Fetch a URL whose absence is an error (metadata endpoints).
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        match self.fetch_optional(url).await? {
            Some(bytes) => Ok(bytes),
            None => Err(FetchError::HttpStatus {
                status: StatusCode::NOT_FOUND.as_u16(),
                url: url.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn day(s: &str) -> NaiveDate {
        parse_day(s).expect("test date")
    }

    #[test]
    fn layout_paths_are_date_keyed() {
        let layout = DatasetLayout::new("/data");
        assert_eq!(
            layout.raw_partition(day("2024-02-08")),
            PathBuf::from("/data/raw_daily/date=2024-02-08/part.parquet")
        );
        assert_eq!(
            layout.curated_partition(day("2024-02-08")),
            PathBuf::from("/data/curated/date=2024-02-08/part.parquet")
        );
        assert_eq!(
            layout.archive_path(day("2024-02-08")),
            PathBuf::from("/data/archives/prices-2024-02-08.zip")
        );
    }

    #[test]
    fn partition_dates_parses_and_sorts() {
        let dir = tempdir().expect("tempdir");
        for name in ["date=2024-02-10", "date=2024-02-08", "not-a-partition"] {
            std::fs::create_dir_all(dir.path().join(name)).expect("mkdir");
        }
        std::fs::write(dir.path().join("date=stray-file"), b"x").expect("write");

        let dates = partition_dates(dir.path()).expect("list");
        assert_eq!(dates, vec![day("2024-02-08"), day("2024-02-10")]);
    }

    #[test]
    fn partition_dates_of_missing_dir_is_empty() {
        let dir = tempdir().expect("tempdir");
        let dates = partition_dates(&dir.path().join("nope")).expect("list");
        assert!(dates.is_empty());
    }

    #[tokio::test]
    async fn atomic_write_replaces_without_leftover_staging() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("nested").join("table.parquet");

        write_bytes_atomic(&target, b"first").await.expect("first write");
        write_bytes_atomic(&target, b"second").await.expect("second write");

        assert_eq!(std::fs::read(&target).expect("read"), b"second");
        let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn prune_keeps_most_recent_partitions() {
        let dir = tempdir().expect("tempdir");
        let layout = DatasetLayout::new(dir.path());
        for d in ["2024-02-05", "2024-02-06", "2024-02-07", "2024-02-08"] {
            let path = layout.raw_partition(day(d));
            std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
            std::fs::write(path, b"rows").expect("write");
        }

        let report = prune_raw_partitions(&layout, 2).expect("prune");
        assert_eq!(report.kept, 2);
        assert_eq!(report.removed, vec![day("2024-02-06"), day("2024-02-05")]);

        let remaining = partition_dates(&layout.raw_daily_dir()).expect("list");
        assert_eq!(remaining, vec![day("2024-02-07"), day("2024-02-08")]);
    }

    #[test]
    fn prune_with_fewer_partitions_than_window_removes_nothing() {
        let dir = tempdir().expect("tempdir");
        let layout = DatasetLayout::new(dir.path());
        let path = layout.raw_partition(day("2024-02-08"));
        std::fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        std::fs::write(path, b"rows").expect("write");

        let report = prune_raw_partitions(&layout, 7).expect("prune");
        assert_eq!(report.kept, 1);
        assert!(report.removed.is_empty());
    }

    #[test]
    fn transient_cleanup_respects_keep_extracted() {
        let dir = tempdir().expect("tempdir");
        let layout = DatasetLayout::new(dir.path());
        layout.ensure_base_dirs().expect("bootstrap");

        remove_transient_dirs(&layout, true).expect("cleanup");
        assert!(!layout.archives_dir().exists());
        assert!(layout.extracted_dir().exists());

        remove_transient_dirs(&layout, false).expect("cleanup");
        assert!(!layout.extracted_dir().exists());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_millis(900),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(900));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(900));
    }
}
