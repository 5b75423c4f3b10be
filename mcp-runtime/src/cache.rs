use std::collections::BTreeSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use semlayer_core::listing::{
    ListedMetric, ManifestDescriptions, parse_dimension_listing, parse_metric_listing,
};
use semlayer_core::{Metric, MetricsSnapshot};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::runner::{CommandError, CommandRunner, Invocation};

pub const SNAPSHOT_FILE_NAME: &str = "semantic_layer_cache.json";
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub project_dir: PathBuf,
    pub snapshot_path: PathBuf,
    pub manifest_path: PathBuf,
    pub dbt_bin: String,
    pub mf_bin: String,
    /// Upper bound on concurrent dimension lookups during one rebuild.
    pub dimension_concurrency: usize,
    pub build_timeout: Duration,
    /// How long a missing snapshot file is remembered before `fetch` looks
    /// at the disk again.
    pub snapshot_recheck: Duration,
}

impl CacheConfig {
    /// Defaults rooted at `project_dir`, with artifacts under `target/`.
    pub fn for_project(project_dir: impl Into<PathBuf>) -> Self {
        let project_dir = project_dir.into();
        let target_dir = project_dir.join("target");
        Self {
            snapshot_path: target_dir.join(SNAPSHOT_FILE_NAME),
            manifest_path: target_dir.join(MANIFEST_FILE_NAME),
            project_dir,
            dbt_bin: "dbt".to_string(),
            mf_bin: "mf".to_string(),
            dimension_concurrency: 8,
            build_timeout: Duration::from_secs(900),
            snapshot_recheck: Duration::from_secs(5),
        }
    }
}

/// What a reader sees: a ready snapshot, or why there is none yet.
#[derive(Debug, Clone)]
pub enum CacheStatus {
    Ready(Arc<MetricsSnapshot>),
    Building,
    Absent,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Ready(_) => "ready",
            CacheStatus::Building => "building",
            CacheStatus::Absent => "absent",
        }
    }

    pub fn snapshot(&self) -> Option<&Arc<MetricsSnapshot>> {
        match self {
            CacheStatus::Ready(snapshot) => Some(snapshot),
            CacheStatus::Building | CacheStatus::Absent => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RebuildError {
    #[error("metric listing could not run: {0}")]
    Listing(#[from] CommandError),
    #[error("metric listing exited with code {exit_code}: {stderr}")]
    ListingFailed { exit_code: String, stderr: String },
    #[error("metrics cache rebuild timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
}

/// Counts a pending or running build for as long as it is held.
struct BuildGuard(Arc<AtomicUsize>);

impl BuildGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for BuildGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Process-wide metric catalog.
///
/// Readers take the current snapshot without waiting on a rebuild. Rebuilds
/// are serialized by `rebuild_lock` and publish a new snapshot wholesale.
pub struct MetricsCache {
    config: CacheConfig,
    runner: Arc<dyn CommandRunner>,
    snapshot: RwLock<Option<Arc<MetricsSnapshot>>>,
    builds_in_flight: Arc<AtomicUsize>,
    rebuild_lock: Mutex<()>,
    /// Set when the snapshot file was last found missing.
    snapshot_missing_since: RwLock<Option<Instant>>,
}

impl MetricsCache {
    pub fn new(config: CacheConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            snapshot: RwLock::new(None),
            builds_in_flight: Arc::new(AtomicUsize::new(0)),
            rebuild_lock: Mutex::new(()),
            snapshot_missing_since: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn current(&self) -> Option<Arc<MetricsSnapshot>> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_building(&self) -> bool {
        self.builds_in_flight.load(Ordering::SeqCst) > 0
    }

    /// Current state without triggering a build. With nothing in memory, a
    /// persisted snapshot is loaded on the spot if one exists.
    pub fn fetch(&self) -> CacheStatus {
        if let Some(snapshot) = self.current() {
            return CacheStatus::Ready(snapshot);
        }
        if let Some(snapshot) = self.load_persisted() {
            let snapshot = Arc::new(snapshot);
            self.publish(Arc::clone(&snapshot));
            return CacheStatus::Ready(snapshot);
        }
        if self.is_building() {
            CacheStatus::Building
        } else {
            CacheStatus::Absent
        }
    }

    /// Rebuilds end to end, publishes and persists. Concurrent callers queue
    /// behind the rebuild already running.
    pub async fn refresh(&self) -> Result<Arc<MetricsSnapshot>, RebuildError> {
        let _exclusive = self.rebuild_lock.lock().await;
        let _building = BuildGuard::enter(&self.builds_in_flight);

        let limit = self.config.build_timeout;
        let snapshot = tokio::time::timeout(limit, self.rebuild())
            .await
            .map_err(|_| RebuildError::TimedOut(limit))??;

        let snapshot = Arc::new(snapshot);
        self.publish(Arc::clone(&snapshot));
        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Startup hook: adopt a persisted snapshot, or spawn the one initial
    /// background build. Returns the build task when one was spawned.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if let Some(snapshot) = self.load_persisted() {
            tracing::info!(
                metrics = snapshot.len(),
                path = %self.config.snapshot_path.display(),
                "loaded persisted metrics snapshot"
            );
            self.publish(Arc::new(snapshot));
            return None;
        }

        tracing::info!("no persisted metrics snapshot; starting background build");
        let pending = BuildGuard::enter(&self.builds_in_flight);
        let cache = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _pending = pending;
            match cache.refresh().await {
                Ok(snapshot) => tracing::info!(
                    metrics = snapshot.len(),
                    "background metrics cache build finished"
                ),
                Err(err) => tracing::error!(error = %err, "background metrics cache build failed"),
            }
        }))
    }

    fn publish(&self, snapshot: Arc<MetricsSnapshot>) {
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
        self.set_snapshot_missing(None);
    }

    fn set_snapshot_missing(&self, since: Option<Instant>) {
        *self
            .snapshot_missing_since
            .write()
            .unwrap_or_else(PoisonError::into_inner) = since;
    }

    /// True while a recent read found no snapshot file.
    fn snapshot_recently_missing(&self) -> bool {
        self.snapshot_missing_since
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|since| since.elapsed() < self.config.snapshot_recheck)
    }

    fn load_persisted(&self) -> Option<MetricsSnapshot> {
        if self.snapshot_recently_missing() {
            return None;
        }
        let path = &self.config.snapshot_path;
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.set_snapshot_missing(Some(Instant::now()));
                return None;
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "cannot read metrics snapshot"
                );
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "ignoring unreadable metrics snapshot"
                );
                None
            }
        }
    }

    async fn persist(&self, snapshot: &MetricsSnapshot) {
        let path = &self.config.snapshot_path;
        match write_snapshot(path, snapshot).await {
            Ok(()) => tracing::debug!(path = %path.display(), "persisted metrics snapshot"),
            Err(err) => tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to persist metrics snapshot; keeping in-memory copy"
            ),
        }
    }

    async fn rebuild(&self) -> Result<MetricsSnapshot, RebuildError> {
        tracing::info!(
            project_dir = %self.config.project_dir.display(),
            "building metrics cache"
        );
        let listed = self.list_metrics().await?;
        let manifest = self.load_manifest().await;

        let permits = Arc::new(Semaphore::new(self.config.dimension_concurrency.max(1)));
        let mut lookups = JoinSet::new();
        for entry in listed {
            let description = manifest.describe(&entry);
            let invocation = self.dimensions_invocation(&entry.name);
            let runner = Arc::clone(&self.runner);
            let permits = Arc::clone(&permits);
            lookups.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let dimensions = fetch_dimensions(runner.as_ref(), &invocation, &entry.name).await;
                Metric {
                    name: entry.name,
                    description,
                    dimensions,
                }
            });
        }

        let mut metrics = Vec::with_capacity(lookups.len());
        while let Some(joined) = lookups.join_next().await {
            match joined {
                Ok(metric) => metrics.push(metric),
                Err(err) => {
                    tracing::error!(error = %err, "dimension lookup task died; metric omitted")
                }
            }
        }

        let snapshot = MetricsSnapshot::new(metrics, Some(Utc::now()));
        tracing::info!(metrics = snapshot.len(), "metrics cache built");
        Ok(snapshot)
    }

    async fn list_metrics(&self) -> Result<Vec<ListedMetric>, RebuildError> {
        let invocation = self.listing_invocation();
        tracing::info!(command = %invocation.display(), "listing metrics");
        let output = self.runner.run(&invocation).await?;
        if !output.success() {
            return Err(RebuildError::ListingFailed {
                exit_code: output.exit_code_label(),
                stderr: output.stderr.trim().to_string(),
            });
        }

        let listed = parse_metric_listing(&output.stdout);
        if listed.is_empty() {
            tracing::warn!("metric listing returned no metrics");
        }
        Ok(listed)
    }

    async fn load_manifest(&self) -> ManifestDescriptions {
        let path = &self.config.manifest_path;
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "no build manifest; using listing descriptions (run `dbt compile` to generate one)"
                );
                return ManifestDescriptions::default();
            }
        };
        ManifestDescriptions::from_json(&raw).unwrap_or_else(|err| {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "ignoring unparseable build manifest"
            );
            ManifestDescriptions::default()
        })
    }

    fn listing_invocation(&self) -> Invocation {
        Invocation::new(&self.config.dbt_bin, &self.config.project_dir).args([
            "ls",
            "--resource-type",
            "metric",
            "--output",
            "json",
            "--quiet",
        ])
    }

    fn dimensions_invocation(&self, metric: &str) -> Invocation {
        Invocation::new(&self.config.mf_bin, &self.config.project_dir)
            .args(["list", "dimensions", "--metrics", metric])
    }
}

async fn fetch_dimensions(
    runner: &dyn CommandRunner,
    invocation: &Invocation,
    metric: &str,
) -> BTreeSet<String> {
    match runner.run(invocation).await {
        Ok(output) if output.success() => parse_dimension_listing(&output.stdout)
            .into_iter()
            .collect(),
        Ok(output) => {
            tracing::warn!(
                metric,
                exit_code = %output.exit_code_label(),
                stderr = %output.stderr.trim(),
                "dimension listing failed; metric keeps no dimensions"
            );
            BTreeSet::new()
        }
        Err(err) => {
            tracing::warn!(
                metric,
                error = %err,
                "dimension listing could not run; metric keeps no dimensions"
            );
            BTreeSet::new()
        }
    }
}

/// Writes to a sibling staging file, then renames it over `path`.
async fn write_snapshot(path: &Path, snapshot: &MetricsSnapshot) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(snapshot)?;

    let mut staging = OsString::from(path.as_os_str());
    staging.push(".tmp");
    let staging = PathBuf::from(staging);

    tokio::fs::write(&staging, body).await?;
    tokio::fs::rename(&staging, path).await
}
