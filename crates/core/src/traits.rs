//! Collaborator interfaces consumed by the engine. Implementations live
//! elsewhere (`ferry-hub`, `ferry-persist`, `ferry-apply`) or in tests.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::{Draft, Page, PageToken, QueryPredicate, ResourceType, ScopeKey, Statistics, Watermark};

/// Paged query over one source collection. Pages come back in a stable server-defined order.
#[async_trait::async_trait]
pub trait SourceQuery: Send + Sync {
    async fn fetch_page(
        &self,
        resource: ResourceType,
        predicate: &QueryPredicate,
        limit: usize,
        token: Option<&PageToken>,
    ) -> Result<Page>;
}

/// Id-to-key lookup for one chunk of ids of a single reference type.
/// Ids that do not exist are simply absent from the result; a `None` or blank key
/// means the resource exists without a key.
#[async_trait::async_trait]
pub trait LookupRequest: Send + Sync {
    async fn lookup(&self, type_id: &str, ids: &[String]) -> Result<Vec<(String, Option<String>)>>;
}

/// Writes a disposable record to the target and returns its server-stamped modification time.
#[async_trait::async_trait]
pub trait MarkerWriter: Send + Sync {
    async fn write_marker(&self) -> Result<DateTime<Utc>>;
}

/// Durable per-scope watermark record. Unreadable records must be reported as absent.
#[async_trait::async_trait]
pub trait WatermarkStorage: Send + Sync {
    async fn get(&self, scope: &ScopeKey) -> Result<Option<Watermark>>;
    async fn put(&self, scope: &ScopeKey, watermark: Watermark) -> Result<Watermark>;
}

/// External diff/patch engine. Returns counters for the drafts it was handed.
#[async_trait::async_trait]
pub trait ApplyCollaborator: Send + Sync {
    async fn apply(&self, resource: ResourceType, drafts: Vec<Draft>) -> Result<Statistics>;
}
