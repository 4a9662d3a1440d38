//! Ferry hub: paged access to a project's collections.
//!
//! [`BatchFetcher`] walks any [`SourceQuery`] page by page. [`MemoryProject`]
//! is a complete in-process project used as source and target by the CLI and
//! by tests.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use ferry_core::{Page, PageToken, QueryPredicate, ResourceType, SourceQuery};
use metrics::counter;
use serde_json::Value as Json;
use tracing::debug;

pub mod memory;
pub mod snapshot;

pub use memory::{Clock, MemoryProject};
pub use snapshot::ProjectSnapshot;

/// Pulls fixed-size pages of one collection, strictly one after another.
pub struct BatchFetcher {
    source: Arc<dyn SourceQuery>,
    resource: ResourceType,
    predicate: QueryPredicate,
    page_size: usize,
    next: Option<PageToken>,
    done: bool,
    pages: u64,
}

impl BatchFetcher {
    pub fn new(source: Arc<dyn SourceQuery>, resource: ResourceType, predicate: QueryPredicate, page_size: usize) -> Self {
        Self { source, resource, predicate, page_size: page_size.max(1), next: None, done: false, pages: 0 }
    }

    pub fn predicate(&self) -> &QueryPredicate { &self.predicate }
    pub fn pages(&self) -> u64 { self.pages }

    /// The next non-empty page, or `None` once the collection is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Json>>> {
        while !self.done {
            let Page { resources, next } =
                self.source.fetch_page(self.resource, &self.predicate, self.page_size, self.next.as_ref()).await?;
            self.done = next.is_none();
            self.next = next;
            if resources.is_empty() {
                continue;
            }
            self.pages += 1;
            counter!("fetch_pages_total", 1u64);
            debug!(resource = %self.resource, page = self.pages, size = resources.len(), "fetched page");
            return Ok(Some(resources));
        }
        Ok(None)
    }
}
