//! Ferry apply: upsert rewritten drafts into a target project.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use ferry_core::{ApplyCollaborator, Draft, ResourceType, Statistics};
use ferry_hub::MemoryProject;
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tracing::{debug, warn};

/// Fields the target stamps on stored resources; ignored when diffing.
const SERVER_FIELDS: [&str; 7] =
    ["id", "version", "versionModifiedAt", "createdAt", "lastModifiedAt", "createdBy", "lastModifiedBy"];

/// What happened to one draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Created,
    /// Replaced; the top-level draft fields that differed.
    Updated(Vec<String>),
    Unchanged,
    Failed,
}

fn strip_server_fields(mut v: Json) -> Json {
    if let Some(obj) = v.as_object_mut() {
        for f in SERVER_FIELDS.iter() {
            obj.remove(*f);
        }
    }
    v
}

/// Top-level fields of `draft` that the stored resource lacks or holds with a
/// different value, plus stored fields the draft no longer carries.
fn changed_fields(draft: &Json, stored: &Json) -> Vec<String> {
    let stored = strip_server_fields(stored.clone());
    let (Some(d), Some(s)) = (draft.as_object(), stored.as_object()) else {
        return if draft == &stored { Vec::new() } else { vec![String::from("<root>")] };
    };
    let mut changed: Vec<String> = d
        .iter()
        .filter(|(k, v)| !SERVER_FIELDS.contains(&k.as_str()) && s.get(*k) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    changed.extend(s.keys().filter(|k| !d.contains_key(*k)).cloned());
    changed
}

/// Reference locator (`key` or `id`) of a rewritten identifier, for matching.
fn locator_of(v: Option<&Json>) -> String {
    v.and_then(|r| r.get("key").or_else(|| r.get("id")))
        .and_then(Json::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Inventory entries have no key; they match on `sku|supplyChannel`.
fn inventory_match_key(body: &Json) -> Option<String> {
    let sku = body.get("sku").and_then(Json::as_str).filter(|s| !s.trim().is_empty())?;
    Some(format!("{}|{}", sku, locator_of(body.get("supplyChannel"))))
}

fn match_key(draft: &Draft) -> Option<String> {
    match draft.resource {
        ResourceType::InventoryEntries => inventory_match_key(&draft.body),
        _ => draft.identity(),
    }
}

/// Applies drafts to a [`MemoryProject`]: create when missing, replace when changed.
pub struct UpsertApplier {
    target: Arc<MemoryProject>,
}

impl UpsertApplier {
    pub fn new(target: Arc<MemoryProject>) -> Self { Self { target } }

    fn find_existing(&self, resource: ResourceType, key: &str) -> Option<Json> {
        match resource {
            ResourceType::InventoryEntries => self
                .target
                .all(resource)
                .into_iter()
                .find(|r| inventory_match_key(r).as_deref() == Some(key)),
            _ => self.target.find_by_identity(resource, key),
        }
    }

    /// Upsert one draft.
    pub fn apply_one(&self, draft: &Draft) -> Outcome {
        let resource = draft.resource;
        let Some(key) = match_key(draft) else {
            warn!(%resource, "draft has no identity on the target; skipping");
            return Outcome::Failed;
        };
        let result = match self.find_existing(resource, &key) {
            None => self.target.create(resource, draft.body.clone()).map(|_| Outcome::Created),
            Some(existing) => {
                let changed = changed_fields(&draft.body, &existing);
                if changed.is_empty() {
                    Ok(Outcome::Unchanged)
                } else {
                    let id = existing.get("id").and_then(Json::as_str).unwrap_or_default();
                    self.target.replace(resource, id, draft.body.clone()).map(|_| Outcome::Updated(changed))
                }
            }
        };
        match result {
            Ok(outcome) => {
                debug!(%resource, key = %key, ?outcome, "applied draft");
                outcome
            }
            Err(e) => {
                warn!(%resource, key = %key, error = %e, "apply failed");
                Outcome::Failed
            }
        }
    }
}

#[async_trait::async_trait]
impl ApplyCollaborator for UpsertApplier {
    async fn apply(&self, resource: ResourceType, drafts: Vec<Draft>) -> Result<Statistics> {
        let t0 = std::time::Instant::now();
        let mut stats = Statistics::default();
        for draft in &drafts {
            stats.processed += 1;
            match self.apply_one(draft) {
                Outcome::Created => stats.created += 1,
                Outcome::Updated(_) => stats.updated += 1,
                Outcome::Unchanged => {}
                Outcome::Failed => stats.failed += 1,
            }
        }
        histogram!("apply_batch_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("apply_drafts_total", stats.processed);
        if stats.failed > 0 {
            counter!("apply_err", stats.failed);
        }
        Ok(stats)
    }
}
