//! Ferry resolve: turn the uncached ids of a page into keys with as few
//! lookup requests as possible, all in flight at once.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use ferry_core::{LookupRequest, TypeId};
use ferry_store::IdKeyCache;
use metrics::{counter, histogram};
use tracing::debug;

/// What one `resolve` call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveReport {
    /// Ids asked for that were already cached.
    pub cached: usize,
    /// Lookup requests issued (one per chunk).
    pub requests: usize,
    /// Keys inserted into the cache.
    pub resolved: usize,
    /// Returned ids without a usable key; these stay id-based.
    pub keyless: usize,
    /// `(id, key)` pairs this call resolved, independent of later cache evictions.
    pub keys: Vec<(String, String)>,
}

pub struct BatchResolver {
    lookup: Arc<dyn LookupRequest>,
    cache: Arc<IdKeyCache>,
    chunk_size: usize,
}

impl BatchResolver {
    pub fn new(lookup: Arc<dyn LookupRequest>, cache: Arc<IdKeyCache>, chunk_size: usize) -> Self {
        Self { lookup, cache, chunk_size: chunk_size.max(1) }
    }

    pub fn cache(&self) -> &Arc<IdKeyCache> { &self.cache }

    /// Split every type's uncached ids into chunks. Already cached ids are never requested.
    pub fn plan(&self, ids_by_type: &BTreeMap<TypeId, BTreeSet<String>>) -> (Vec<(TypeId, Vec<String>)>, usize) {
        let mut chunks = Vec::new();
        let mut cached = 0usize;
        for (type_id, ids) in ids_by_type {
            let missing = self.cache.uncached(ids.iter());
            cached += ids.len() - missing.len();
            for chunk in missing.chunks(self.chunk_size) {
                chunks.push((type_id.clone(), chunk.to_vec()));
            }
        }
        (chunks, cached)
    }

    /// Fill the cache for every id in `ids_by_type` and return the keys found.
    /// Fails as a whole if any chunk fails.
    pub async fn resolve(&self, ids_by_type: &BTreeMap<TypeId, BTreeSet<String>>) -> Result<ResolveReport> {
        let (chunks, cached) = self.plan(ids_by_type);
        let mut report = ResolveReport { cached, ..ResolveReport::default() };
        if chunks.is_empty() {
            return Ok(report);
        }
        let t0 = Instant::now();
        report.requests = chunks.len();
        counter!("resolve_requests_total", chunks.len() as u64);

        let lookups = chunks.iter().map(|(type_id, ids)| async move {
            self.lookup
                .lookup(type_id, ids)
                .await
                .with_context(|| format!("looking up keys for {} {} ids", ids.len(), type_id))
        });
        let results = futures::future::try_join_all(lookups).await?;

        for pairs in results {
            for (id, key) in pairs {
                match key {
                    Some(k) if self.cache.insert(id.as_str(), k.as_str()) => {
                        report.resolved += 1;
                        report.keys.push((id, k));
                    }
                    _ => {
                        debug!(id = %id, "lookup returned no key; reference stays id-based");
                        report.keyless += 1;
                    }
                }
            }
        }
        histogram!("resolve_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(
            requests = report.requests,
            resolved = report.resolved,
            keyless = report.keyless,
            cached = report.cached,
            took_ms = %t0.elapsed().as_millis(),
            "resolved page references"
        );
        Ok(report)
    }
}
