//! Collection cycle, trigger scheduling, and fingerprint-gated bulk load.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use tamalog_adapters::{DelayStatusAdapter, SourceAdapter, WeatherAdapter};
use tamalog_core::{error_marker, Observation};
use tamalog_storage::{
    sha256_hex, FingerprintFile, HttpClientConfig, HttpFetcher, ObservationStore, StoreError,
    WeatherArchive,
};

pub const CRATE_NAME: &str = "tamalog-sync";

/// Process-wide configuration, read once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub forecast_base: String,
    pub office_code: String,
    pub region_code: String,
    pub status_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub pacing_delay_ms: u64,
    pub poll_interval_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("TAMALOG_DB")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./transport_weather.db")),
            snapshot_path: std::env::var("TAMALOG_SNAPSHOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./weather.csv")),
            forecast_base: std::env::var("TAMALOG_FORECAST_BASE").unwrap_or_else(|_| {
                "https://www.jma.go.jp/bosai/forecast/data/forecast".to_string()
            }),
            office_code: std::env::var("TAMALOG_OFFICE_CODE")
                .unwrap_or_else(|_| "130000".to_string()),
            region_code: std::env::var("TAMALOG_REGION_CODE")
                .unwrap_or_else(|_| "130010".to_string()),
            status_url: std::env::var("TAMALOG_STATUS_URL")
                .unwrap_or_else(|_| "https://transit.yahoo.co.jp/diainfo/156/0".to_string()),
            user_agent: std::env::var("TAMALOG_USER_AGENT")
                .unwrap_or_else(|_| "tamalog/0.1".to_string()),
            http_timeout_secs: std::env::var("TAMALOG_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            pacing_delay_ms: std::env::var("TAMALOG_PACING_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1000),
            poll_interval_secs: std::env::var("TAMALOG_POLL_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
        }
    }
}

/// Wire the configured adapters and HTTP client into a ready cycle.
pub fn build_cycle(config: &AppConfig, store: ObservationStore) -> anyhow::Result<CollectionCycle> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    let weather = WeatherAdapter::new(&config.forecast_base, &config.office_code, &config.region_code);
    let delay = DelayStatusAdapter::new(
        config.status_url.clone(),
        Duration::from_millis(config.pacing_delay_ms),
    );
    Ok(CollectionCycle::new(
        http,
        Box::new(weather),
        Box::new(delay),
        store,
    ))
}

/// One round of fetch-both-sources-and-append-one-row.
pub struct CollectionCycle {
    http: HttpFetcher,
    weather: Box<dyn SourceAdapter>,
    delay: Box<dyn SourceAdapter>,
    store: ObservationStore,
}

impl CollectionCycle {
    pub fn new(
        http: HttpFetcher,
        weather: Box<dyn SourceAdapter>,
        delay: Box<dyn SourceAdapter>,
        store: ObservationStore,
    ) -> Self {
        Self {
            http,
            weather,
            delay,
            store,
        }
    }

    /// Run one cycle. Never fails outward: a failed fetch becomes an
    /// error-marker field, a failed append is logged and swallowed so the
    /// next trigger still fires. The two fetches run concurrently and
    /// cannot block each other.
    pub async fn run(&self) -> Observation {
        let now = Local::now();
        let (weather_res, delay_res) =
            tokio::join!(self.weather.fetch(&self.http), self.delay.fetch(&self.http));

        let weather_value = match weather_res {
            Ok(value) => value,
            Err(err) => {
                warn!(source = self.weather.source_id(), %err, "fetch failed");
                error_marker(&err)
            }
        };
        let delay_status_value = match delay_res {
            Ok(value) => value,
            Err(err) => {
                warn!(source = self.delay.source_id(), %err, "fetch failed");
                error_marker(&err)
            }
        };

        let observation = Observation::at(now, weather_value, delay_status_value);
        match self.store.append(&observation).await {
            Ok(id) => info!(
                id,
                date = %observation.captured_date,
                time = %observation.captured_time,
                "observation appended"
            ),
            Err(err) => error!(%err, "failed to append observation"),
        }
        observation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// The daily trigger window: every hour on the hour from 05:00 through
/// midnight inclusive, 20 triggers per day, local wall clock.
pub fn daily_triggers() -> Vec<NaiveTime> {
    let mut times: Vec<NaiveTime> = (5..24)
        .filter_map(|h| NaiveTime::from_hms_opt(h, 0, 0))
        .collect();
    times.push(NaiveTime::MIN);
    times.sort();
    times
}

/// Latest trigger instant in `(last_fired, now]`, or None.
///
/// Triggers are calendar times of day, so candidates are laid onto both
/// today and yesterday to cover polls shortly after midnight. Taking the
/// latest due instant gives last-trigger-wins: an overrun cycle skips the
/// triggers it slept through instead of queueing them.
pub fn next_due(
    triggers: &[NaiveTime],
    last_fired: DateTime<Local>,
    now: DateTime<Local>,
) -> Option<DateTime<Local>> {
    let today = now.date_naive();
    let mut latest: Option<DateTime<Local>> = None;
    for day in [today.pred_opt(), Some(today)].into_iter().flatten() {
        for &time in triggers {
            let Some(instant) = day.and_time(time).and_local_timezone(Local).single() else {
                continue;
            };
            if instant > last_fired && instant <= now {
                latest = Some(latest.map_or(instant, |cur| cur.max(instant)));
            }
        }
    }
    latest
}

pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

pub fn shutdown_channel() -> (ShutdownHandle, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, rx)
}

/// Drives the collection cycle at the configured wall-clock triggers.
///
/// Cycles are strictly serialized with respect to the loop; cancellation
/// is checked at iteration boundaries only, so an in-flight cycle always
/// completes before the loop exits.
pub struct Scheduler {
    cycle: CollectionCycle,
    triggers: Vec<NaiveTime>,
    poll_interval: Duration,
    shutdown: watch::Receiver<bool>,
    state: SchedulerState,
}

impl Scheduler {
    pub fn new(cycle: CollectionCycle, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            cycle,
            triggers: daily_triggers(),
            poll_interval: Duration::from_secs(1),
            shutdown,
            state: SchedulerState::Stopped,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Run until the shutdown signal flips. Triggers that were already in
    /// the past at start are not replayed; the baseline is the start time.
    pub async fn run(&mut self) {
        self.state = SchedulerState::Running;
        info!(triggers = self.triggers.len(), "scheduler started");
        let mut last_fired = Local::now();

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            if let Some(due) = next_due(&self.triggers, last_fired, Local::now()) {
                last_fired = due;
                info!(trigger = %due, "trigger due, running collection cycle");
                self.cycle.run().await;
            }

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        self.state = SchedulerState::Stopped;
        info!("scheduler stopped");
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("snapshot io: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BulkLoadReport {
    pub reloaded: bool,
    pub inserted: usize,
    pub skipped_duplicates: usize,
    pub skipped_malformed: usize,
}

/// Parse one data line of the snapshot: `id,area_name,date,weather_desc`.
/// Area names are free text (non-ASCII included); the trailing field takes
/// any remaining commas.
pub fn parse_snapshot_line(line: &str) -> Option<tamalog_core::BulkRow> {
    let mut parts = line.splitn(4, ',');
    let id = parts.next()?.trim().parse().ok()?;
    let area_name = parts.next()?.trim().to_string();
    let date = parts.next()?.trim().to_string();
    let weather_desc = parts.next()?.trim().to_string();
    Some(tamalog_core::BulkRow {
        id,
        area_name,
        date,
        weather_desc,
    })
}

/// Idempotent bulk import: rebuilds the archive table from the snapshot
/// file only when the file's content hash differs from the recorded one.
pub struct BulkLoader {
    archive: WeatherArchive,
    // Serializes loader invocations; reload is drop-and-rebuild and must
    // never race itself.
    guard: Mutex<()>,
}

impl BulkLoader {
    pub fn new(archive: WeatherArchive) -> Self {
        Self {
            archive,
            guard: Mutex::new(()),
        }
    }

    /// True iff a reload occurred. Missing snapshot and unchanged snapshot
    /// are both quiet no-ops.
    pub async fn sync_if_changed(&self, snapshot: &Path) -> Result<bool, LoadError> {
        self.sync_report(snapshot).await.map(|report| report.reloaded)
    }

    pub async fn sync_report(&self, snapshot: &Path) -> Result<BulkLoadReport, LoadError> {
        let _guard = self.guard.lock().await;

        let bytes = match tokio::fs::read(snapshot).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(path = %snapshot.display(), "snapshot file missing, leaving store untouched");
                return Ok(BulkLoadReport::default());
            }
            Err(err) => return Err(err.into()),
        };

        let digest = sha256_hex(&bytes);
        let fingerprint = FingerprintFile::for_snapshot(snapshot);
        if fingerprint.load().await?.as_deref() == Some(digest.as_str()) {
            info!(path = %snapshot.display(), "snapshot unchanged, skipping reload");
            return Ok(BulkLoadReport::default());
        }

        info!(path = %snapshot.display(), "snapshot changed, rebuilding archive table");
        let text = String::from_utf8(bytes)?;
        self.archive.reset_schema().await?;

        let mut report = BulkLoadReport {
            reloaded: true,
            ..Default::default()
        };
        // First line is the header row.
        for (line_no, line) in text.lines().enumerate().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            let Some(row) = parse_snapshot_line(line) else {
                warn!(line_no, "malformed snapshot row skipped");
                report.skipped_malformed += 1;
                continue;
            };
            match self.archive.insert(&row).await {
                Ok(()) => report.inserted += 1,
                Err(StoreError::DuplicateId { id }) => {
                    warn!(id, line_no, "duplicate snapshot id skipped");
                    report.skipped_duplicates += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }

        // Only now does the fingerprint advance; a failure anywhere above
        // leaves the old record in place and forces another rebuild.
        fingerprint.store(&digest).await?;
        info!(
            inserted = report.inserted,
            skipped_duplicates = report.skipped_duplicates,
            skipped_malformed = report.skipped_malformed,
            "archive reload complete"
        );
        Ok(report)
    }
}
