//! Multi-resource-type driver: dependency stages run in order, types inside a
//! stage run concurrently and share one ID→Key cache.

use std::str::FromStr;
use std::sync::Arc;

use ferry_core::{ConfigError, ResourceType, SyncConfig, SyncError};
use ferry_store::IdKeyCache;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{Collaborators, Orchestrator, RunSummary, SyncRequest};

/// Referenced types are synced before the types pointing at them.
pub const STAGES: [&[ResourceType]; 4] = [
    &[
        ResourceType::Types,
        ResourceType::ProductTypes,
        ResourceType::States,
        ResourceType::TaxCategories,
        ResourceType::CustomObjects,
        ResourceType::Customers,
    ],
    &[ResourceType::Categories],
    &[ResourceType::Products, ResourceType::InventoryEntries, ResourceType::CartDiscounts],
    &[ResourceType::ShoppingLists],
];

/// One resource type or every type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    One(ResourceType),
    All,
}

impl FromStr for Selection {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "all" {
            return Ok(Selection::All);
        }
        s.parse().map(Selection::One)
    }
}

#[derive(Debug)]
pub enum Outcome {
    Succeeded(RunSummary),
    Failed(SyncError),
    /// Not started: an earlier stage failed or the run was aborted.
    Skipped,
}

/// Terminal outcome of every selected resource type, in execution order.
#[derive(Debug, Default)]
pub struct DriverReport {
    pub outcomes: Vec<(ResourceType, Outcome)>,
}

impl DriverReport {
    pub fn is_success(&self) -> bool { self.outcomes.iter().all(|(_, o)| matches!(o, Outcome::Succeeded(_))) }

    pub fn failures(&self) -> impl Iterator<Item = &SyncError> {
        self.outcomes.iter().filter_map(|(_, o)| match o {
            Outcome::Failed(e) => Some(e),
            _ => None,
        })
    }

    pub fn outcome(&self, resource: ResourceType) -> Option<&Outcome> {
        self.outcomes.iter().find(|(rt, _)| *rt == resource).map(|(_, o)| o)
    }
}

pub struct SyncDriver {
    cfg: SyncConfig,
    collab: Collaborators,
    cache: Arc<IdKeyCache>,
    abort: Option<watch::Receiver<bool>>,
}

impl SyncDriver {
    pub fn new(cfg: SyncConfig, collab: Collaborators) -> Self {
        let cfg = cfg.normalized();
        let cache = Arc::new(IdKeyCache::with_capacity(cfg.cache_capacity));
        Self { cfg, collab, cache, abort: None }
    }

    /// Stop before the next stage once the receiver reads `true`.
    pub fn with_abort(mut self, abort: watch::Receiver<bool>) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn cache(&self) -> &Arc<IdKeyCache> { &self.cache }

    fn aborted(&self) -> bool { self.abort.as_ref().is_some_and(|rx| *rx.borrow()) }

    pub async fn run_one(&self, req: SyncRequest) -> Result<RunSummary, SyncError> {
        let mut orchestrator =
            Orchestrator::new(req.resource, self.cfg.clone(), self.collab.clone(), Arc::clone(&self.cache));
        orchestrator.run(&req).await
    }

    pub async fn run(&self, selection: Selection, runner: Option<&str>, full: bool) -> DriverReport {
        let request = |resource| SyncRequest { resource, runner: runner.map(str::to_string), full };
        let mut report = DriverReport::default();
        match selection {
            Selection::One(resource) => {
                let outcome = match self.run_one(request(resource)).await {
                    Ok(summary) => Outcome::Succeeded(summary),
                    Err(e) => Outcome::Failed(e),
                };
                report.outcomes.push((resource, outcome));
            }
            Selection::All => {
                let mut halted = false;
                for (stage, resources) in STAGES.iter().enumerate() {
                    if !halted && self.aborted() {
                        warn!(stage, "sync aborted; remaining stages skipped");
                        halted = true;
                    }
                    if halted {
                        report.outcomes.extend(resources.iter().map(|rt| (*rt, Outcome::Skipped)));
                        continue;
                    }
                    info!(stage, types = resources.len(), "starting stage");
                    let results = join_all(resources.iter().map(|rt| self.run_one(request(*rt)))).await;
                    for (rt, result) in resources.iter().zip(results) {
                        match result {
                            Ok(summary) => report.outcomes.push((*rt, Outcome::Succeeded(summary))),
                            Err(e) => {
                                warn!(resource = %rt, phase = %e.phase, error = %e, "resource sync failed");
                                halted = true;
                                report.outcomes.push((*rt, Outcome::Failed(e)));
                            }
                        }
                    }
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_cover_every_type_once() {
        let mut seen: Vec<ResourceType> = STAGES.iter().flat_map(|s| s.iter().copied()).collect();
        assert_eq!(seen.len(), ResourceType::ALL.len());
        seen.sort_by_key(|rt| rt.as_str());
        seen.dedup();
        assert_eq!(seen.len(), ResourceType::ALL.len());
    }

    #[test]
    fn selection_parses_all_and_names() {
        assert_eq!("all".parse::<Selection>().unwrap(), Selection::All);
        assert_eq!("productTypes".parse::<Selection>().unwrap(), Selection::One(ResourceType::ProductTypes));
        assert!(matches!("Products".parse::<Selection>(), Err(ConfigError::UnknownResource(_))));
    }
}
