//! Ferry sync: one generic orchestrator per resource type, plus a staged
//! driver for syncing every type.
//!
//! A run walks `Idle → Windowing → Fetching → Transforming → Applying →
//! Watermarking → Done`; any failure lands in `Failed` and surfaces as a
//! [`SyncError`] naming the phase reached. Pages are processed strictly one
//! after another; only the lookups inside one page run concurrently.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use ferry_core::config::{validate_runner, DEFAULT_RUNNER};
use ferry_core::{
    ApplyCollaborator, Draft, LookupRequest, MarkerFailurePolicy, MarkerWriter, QueryPredicate,
    ResourceType, ScopeKey, SourceQuery, Statistics, SyncConfig, SyncError, SyncPhase, TypeId, Watermark,
    WatermarkStorage,
};
use ferry_hub::BatchFetcher;
use ferry_refs::{KeySource, PageKeys};
use ferry_resolve::BatchResolver;
use ferry_store::IdKeyCache;
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

pub mod driver;

pub use driver::{DriverReport, Outcome, Selection, SyncDriver, STAGES};

/// The external systems one run talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourceQuery>,
    pub lookup: Arc<dyn LookupRequest>,
    pub marker: Arc<dyn MarkerWriter>,
    pub watermarks: Arc<dyn WatermarkStorage>,
    pub apply: Arc<dyn ApplyCollaborator>,
}

/// Per-resource-type behaviour handed to the generic [`Orchestrator`].
#[derive(Clone)]
pub struct ResourceProfile {
    pub resource: ResourceType,
    pub scan: fn(ResourceType, &[Json]) -> BTreeMap<TypeId, BTreeSet<String>>,
    pub identities: fn(ResourceType, &[Json]) -> Vec<(String, String)>,
    pub rewrite: fn(ResourceType, &Json, &dyn KeySource) -> Draft,
    /// Custom objects whose container starts with this prefix are not synced.
    pub skip_container_prefix: Option<String>,
}

fn rewrite_draft(resource: ResourceType, raw: &Json, keys: &dyn KeySource) -> Draft { ferry_refs::rewrite(resource, raw, keys) }

impl ResourceProfile {
    pub fn for_resource(resource: ResourceType, cfg: &SyncConfig) -> Self {
        let skip_container_prefix = (resource == ResourceType::CustomObjects && !cfg.sync_project_sync_custom_objects)
            .then(|| cfg.own_container_prefix());
        Self {
            resource,
            scan: ferry_refs::scan_page,
            identities: ferry_refs::page_identities,
            rewrite: rewrite_draft,
            skip_container_prefix,
        }
    }

    /// Drop resources this profile never syncs.
    pub fn retain(&self, page: Vec<Json>) -> Vec<Json> {
        let Some(prefix) = self.skip_container_prefix.as_deref() else { return page };
        page.into_iter()
            .filter(|raw| !raw.get("container").and_then(Json::as_str).is_some_and(|c| c.starts_with(prefix)))
            .collect()
    }
}

/// `(resourceType, runner|absent, isFullSync)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub resource: ResourceType,
    pub runner: Option<String>,
    pub full: bool,
}

impl SyncRequest {
    pub fn delta(resource: ResourceType) -> Self { Self { resource, runner: None, full: false } }

    pub fn full(resource: ResourceType) -> Self { Self { resource, runner: None, full: true } }

    pub fn with_runner(mut self, runner: impl Into<String>) -> Self {
        self.runner = Some(runner.into());
        self
    }
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub resource: ResourceType,
    pub runner: String,
    pub predicate: QueryPredicate,
    pub statistics: Statistics,
    pub pages: u64,
    pub elapsed: Duration,
    /// The record persisted at the end of the run, if any.
    pub watermark: Option<Watermark>,
}

/// Drives one resource type's run through the sync phases.
pub struct Orchestrator {
    cfg: SyncConfig,
    collab: Collaborators,
    resolver: BatchResolver,
    profile: ResourceProfile,
    phase: SyncPhase,
}

/// Window decided in `Windowing`.
struct Window {
    predicate: QueryPredicate,
    anchor: Option<DateTime<Utc>>,
}

impl Orchestrator {
    pub fn new(resource: ResourceType, cfg: SyncConfig, collab: Collaborators, cache: Arc<IdKeyCache>) -> Self {
        let cfg = cfg.normalized();
        let resolver = BatchResolver::new(Arc::clone(&collab.lookup), cache, cfg.chunk_size);
        let profile = ResourceProfile::for_resource(resource, &cfg);
        Self { cfg, collab, resolver, profile, phase: SyncPhase::Idle }
    }

    pub fn phase(&self) -> SyncPhase { self.phase }

    pub fn resource(&self) -> ResourceType { self.profile.resource }

    fn enter(&mut self, next: SyncPhase) {
        debug!(resource = %self.profile.resource, from = %self.phase, to = %next, "phase transition");
        self.phase = next;
    }

    fn fail(&mut self, source: anyhow::Error) -> SyncError {
        let err = SyncError::new(self.profile.resource, self.phase, source);
        self.enter(SyncPhase::Failed);
        counter!("sync_runs_failed_total", 1u64);
        err
    }

    /// Run one sync to completion. The orchestrator is single-use.
    pub async fn run(&mut self, req: &SyncRequest) -> Result<RunSummary, SyncError> {
        if self.phase != SyncPhase::Idle {
            return Err(SyncError::new(self.profile.resource, self.phase, anyhow!("orchestrator already ran")));
        }
        if req.resource != self.profile.resource {
            let err = anyhow!("request for {} sent to the {} orchestrator", req.resource, self.profile.resource);
            return Err(self.fail(err));
        }
        let runner = match validate_runner(req.runner.as_deref().unwrap_or(DEFAULT_RUNNER)) {
            Ok(r) => r,
            Err(e) => return Err(self.fail(e.into())),
        };
        match self.drive(&runner, req.full).await {
            Ok(summary) => Ok(summary),
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn drive(&mut self, runner: &str, full: bool) -> Result<RunSummary> {
        let started = Instant::now();
        let resource = self.profile.resource;
        let scope = ScopeKey::new(self.cfg.application.clone(), runner, resource);

        self.enter(SyncPhase::Windowing);
        let window = self.window(&scope, full).await?;
        info!(%resource, runner, window = ?window.predicate.to_where(), "sync started");

        let mut fetcher = BatchFetcher::new(
            Arc::clone(&self.collab.source),
            resource,
            window.predicate.clone(),
            self.cfg.page_size,
        );
        let mut totals = Statistics::default();
        loop {
            self.enter(SyncPhase::Fetching);
            let Some(page) = fetcher.next_page().await.context("fetching source page")? else { break };
            let page = self.profile.retain(page);
            if page.is_empty() {
                continue;
            }

            self.enter(SyncPhase::Transforming);
            let drafts = self.transform(&page).await?;

            self.enter(SyncPhase::Applying);
            let t0 = Instant::now();
            let stats = self.collab.apply.apply(resource, drafts).await.context("applying drafts")?;
            histogram!("sync_page_apply_ms", t0.elapsed().as_secs_f64() * 1000.0);
            counter!("sync_pages_total", 1u64);
            totals.merge(&stats);
            debug!(%resource, page = fetcher.pages(), processed = totals.processed, "page applied");
        }

        let elapsed = started.elapsed();
        let watermark = match window.anchor {
            Some(anchor) => {
                self.enter(SyncPhase::Watermarking);
                Some(self.persist_watermark(&scope, anchor, totals, elapsed).await?)
            }
            None => {
                warn!(%resource, runner, "no marker timestamp for this run; watermark not persisted");
                None
            }
        };

        self.enter(SyncPhase::Done);
        histogram!("sync_run_ms", elapsed.as_secs_f64() * 1000.0);
        info!(%resource, runner, took_ms = elapsed.as_millis() as u64, "{}", totals.report(resource));
        Ok(RunSummary {
            resource,
            runner: runner.to_string(),
            predicate: window.predicate,
            statistics: totals,
            pages: fetcher.pages(),
            elapsed,
            watermark,
        })
    }

    /// Decide the query predicate and anchor the window on the target's clock.
    async fn window(&self, scope: &ScopeKey, full: bool) -> Result<Window> {
        let previous = if full {
            None
        } else {
            let t0 = Instant::now();
            let w = self.collab.watermarks.get(scope).await.context("reading watermark")?;
            histogram!("watermark_read_ms", t0.elapsed().as_secs_f64() * 1000.0);
            w
        };
        let anchor = match self.collab.marker.write_marker().await {
            Ok(ts) => Some(ts),
            Err(e) => match self.cfg.marker_failure {
                MarkerFailurePolicy::Abort => return Err(e.context("writing timestamp marker")),
                MarkerFailurePolicy::SkipWatermark => {
                    warn!(scope = %scope, error = %format!("{:#}", e), "marker write failed; continuing without a watermark");
                    None
                }
            },
        };
        let predicate = match (previous, anchor) {
            (None, _) => QueryPredicate::All,
            (Some(w), Some(to)) => QueryPredicate::ModifiedBetween { from: w.last_sync_timestamp, to },
            (Some(w), None) => QueryPredicate::ModifiedSince { from: w.last_sync_timestamp },
        };
        if !full && !predicate.is_windowed() {
            info!(scope = %scope, "no previous watermark; syncing everything this run");
        }
        Ok(Window { predicate, anchor })
    }

    /// Scan the whole page, resolve once, then rewrite each resource against
    /// the page's own keys first and the shared cache second.
    async fn transform(&self, page: &[Json]) -> Result<Vec<Draft>> {
        let resource = self.profile.resource;
        let cache = self.resolver.cache();
        let identities = (self.profile.identities)(resource, page);
        let seeded = cache.extend(identities.iter().cloned());
        let ids = (self.profile.scan)(resource, page);
        let report = self.resolver.resolve(&ids).await.context("resolving references")?;
        debug!(%resource, seeded, cached = report.cached, requests = report.requests, keyless = report.keyless, "page resolved");

        let mut keys = PageKeys::new(&**cache);
        keys.extend(identities);
        keys.extend(report.keys);
        Ok(page.iter().map(|raw| (self.profile.rewrite)(resource, raw, &keys)).collect())
    }

    async fn persist_watermark(
        &self,
        scope: &ScopeKey,
        anchor: DateTime<Utc>,
        statistics: Statistics,
        elapsed: Duration,
    ) -> Result<Watermark> {
        let buffer = chrono::Duration::from_std(self.cfg.watermark_buffer).context("watermark buffer out of range")?;
        let last_sync_timestamp = anchor
            .checked_sub_signed(buffer)
            .with_context(|| format!("watermark buffer of {}s reaches before the earliest timestamp", buffer.num_seconds()))?;
        let record = Watermark {
            scope: scope.clone(),
            last_sync_timestamp,
            statistics,
            application_version: self.cfg.application_version.clone(),
            last_sync_duration_millis: i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
        };
        let t0 = Instant::now();
        let stored = self.collab.watermarks.put(scope, record).await.context("writing watermark")?;
        histogram!("watermark_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(scope = %scope, ts = %stored.last_sync_timestamp, "watermark persisted");
        Ok(stored)
    }
}
