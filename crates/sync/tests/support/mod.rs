#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use ferry_apply::UpsertApplier;
use ferry_core::{
    ApplyCollaborator, Draft, LookupRequest, MarkerWriter, Page, PageToken, QueryPredicate, ResourceType, SourceQuery, Statistics,
    WatermarkStorage,
};
use ferry_hub::{Clock, MemoryProject};
use ferry_sync::Collaborators;

pub fn t_anchor() -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap() }

/// Source and target projects; the target's clock is pinned to [`t_anchor`].
pub fn projects() -> (Arc<MemoryProject>, Arc<MemoryProject>) {
    let source = Arc::new(MemoryProject::new("source"));
    let target = Arc::new(MemoryProject::new("target"));
    target.set_clock(Clock::Manual(t_anchor()));
    (source, target)
}

pub fn collaborators(source: &Arc<MemoryProject>, target: &Arc<MemoryProject>) -> Collaborators {
    Collaborators {
        source: Arc::clone(source) as Arc<dyn SourceQuery>,
        lookup: Arc::clone(source) as Arc<dyn LookupRequest>,
        marker: Arc::clone(target) as Arc<dyn MarkerWriter>,
        watermarks: Arc::clone(target) as Arc<dyn WatermarkStorage>,
        apply: Arc::new(UpsertApplier::new(Arc::clone(target))),
    }
}

/// Records every predicate it is queried with.
pub struct RecordingSource {
    pub inner: Arc<MemoryProject>,
    pub predicates: Mutex<Vec<QueryPredicate>>,
    pub fail: bool,
}

impl RecordingSource {
    pub fn new(inner: Arc<MemoryProject>) -> Self { Self { inner, predicates: Mutex::new(Vec::new()), fail: false } }
}

#[async_trait::async_trait]
impl SourceQuery for RecordingSource {
    async fn fetch_page(
        &self,
        resource: ResourceType,
        predicate: &QueryPredicate,
        limit: usize,
        token: Option<&PageToken>,
    ) -> Result<Page> {
        self.predicates.lock().unwrap().push(predicate.clone());
        if self.fail {
            return Err(anyhow!("connection reset by peer"));
        }
        self.inner.fetch_page(resource, predicate, limit, token).await
    }
}

pub struct FailingMarker;

#[async_trait::async_trait]
impl MarkerWriter for FailingMarker {
    async fn write_marker(&self) -> Result<DateTime<Utc>> { Err(anyhow!("502 bad gateway")) }
}

/// Fails for the listed resource types, delegates otherwise.
pub struct FlakyApply {
    pub inner: Arc<dyn ApplyCollaborator>,
    pub fail_for: Vec<ResourceType>,
    pub calls: AtomicUsize,
}

impl FlakyApply {
    pub fn new(inner: Arc<dyn ApplyCollaborator>, fail_for: Vec<ResourceType>) -> Self {
        Self { inner, fail_for, calls: AtomicUsize::new(0) }
    }
}

#[async_trait::async_trait]
impl ApplyCollaborator for FlakyApply {
    async fn apply(&self, resource: ResourceType, drafts: Vec<Draft>) -> Result<Statistics> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_for.contains(&resource) {
            return Err(anyhow!("target rejected batch"));
        }
        self.inner.apply(resource, drafts).await
    }
}

/// Answers from the source project, but reports custom objects with a blank key.
pub struct BlankCustomObjectKeys {
    pub inner: Arc<MemoryProject>,
}

#[async_trait::async_trait]
impl LookupRequest for BlankCustomObjectKeys {
    async fn lookup(&self, type_id: &str, ids: &[String]) -> Result<Vec<(String, Option<String>)>> {
        let pairs = self.inner.lookup(type_id, ids).await?;
        if type_id != "key-value-document" {
            return Ok(pairs);
        }
        Ok(pairs.into_iter().map(|(id, _)| (id, Some(String::new()))).collect())
    }
}
