//! Error types surfaced to callers of the sync engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ResourceType;

/// Rejected before any network call is made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown resource type: {0} (expected one of products, categories, types, productTypes, inventoryEntries, cartDiscounts, taxCategories, states, customObjects, customers, shoppingLists or all)")]
    UnknownResource(String),
    #[error("invalid runner name: {0:?} (expected letters, digits, '-' or '_')")]
    InvalidRunner(String),
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Orchestrator states. `Failed` is reachable from any other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    Idle,
    Windowing,
    Fetching,
    Transforming,
    Applying,
    Watermarking,
    Done,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Windowing => "windowing",
            SyncPhase::Fetching => "fetching",
            SyncPhase::Transforming => "transforming",
            SyncPhase::Applying => "applying",
            SyncPhase::Watermarking => "watermarking",
            SyncPhase::Done => "done",
            SyncPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A failed run: which resource type, how far it got, and why.
#[derive(Debug, thiserror::Error)]
#[error("{resource} sync failed during {phase}: {source:#}")]
pub struct SyncError {
    pub resource: ResourceType,
    pub phase: SyncPhase,
    #[source]
    pub source: anyhow::Error,
}

impl SyncError {
    pub fn new(resource: ResourceType, phase: SyncPhase, source: anyhow::Error) -> Self {
        Self { resource, phase, source }
    }
}
