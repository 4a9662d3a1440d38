//! In-memory project: collections of raw JSON resources keyed by reference
//! type id, with server-side stamping of ids, versions and timestamps.

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use ferry_core::config::DEFAULT_APPLICATION;
use ferry_core::{
    last_modified_at, LookupRequest, MarkerWriter, Page, PageToken, QueryPredicate, ResourceType, ScopeKey,
    SourceQuery, Watermark, WatermarkStorage,
};
use metrics::counter;
use serde_json::{json, Value as Json};
use tracing::{debug, warn};
use uuid::Uuid;

const CUSTOM_OBJECT_TYPE_ID: &str = "key-value-document";
const MARKER_KEY: &str = "timestampGenerator";
const WATERMARK_KEY: &str = "watermark";

/// Source of "server" time for stamped fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    System,
    /// Fixed instant, advanced explicitly by tests.
    Manual(DateTime<Utc>),
}

pub struct MemoryProject {
    key: String,
    application: String,
    collections: RwLock<BTreeMap<String, Vec<Json>>>,
    clock: Mutex<Clock>,
    lookup_log: Mutex<Vec<(String, Vec<String>)>>,
}

fn ts_string(ts: DateTime<Utc>) -> String { ts.to_rfc3339_opts(SecondsFormat::Millis, true) }

fn id_of(raw: &Json) -> Option<&str> { raw.get("id").and_then(Json::as_str) }

/// Key a raw resource stored under `type_id` can be referenced by.
fn reference_key_of(type_id: &str, raw: &Json) -> Option<String> {
    match ResourceType::from_reference_type_id(type_id) {
        Some(rt) => rt.reference_key(raw),
        None => raw.get("key").and_then(Json::as_str).filter(|s| !s.trim().is_empty()).map(str::to_string),
    }
}

impl MemoryProject {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            application: DEFAULT_APPLICATION.to_string(),
            collections: RwLock::new(BTreeMap::new()),
            clock: Mutex::new(Clock::System),
            lookup_log: Mutex::new(Vec::new()),
        }
    }

    /// Application name used for the marker and watermark custom object containers.
    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = application.into();
        self
    }

    pub fn key(&self) -> &str { &self.key }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Vec<Json>>> {
        self.collections.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Vec<Json>>> {
        self.collections.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn set_clock(&self, clock: Clock) {
        *self.clock.lock().unwrap_or_else(|p| p.into_inner()) = clock;
    }

    pub fn now(&self) -> DateTime<Utc> {
        match *self.clock.lock().unwrap_or_else(|p| p.into_inner()) {
            Clock::System => Utc::now(),
            Clock::Manual(ts) => ts,
        }
    }

    /// Move a manual clock forward; no-op for the system clock.
    pub fn advance(&self, by: chrono::Duration) {
        let mut clock = self.clock.lock().unwrap_or_else(|p| p.into_inner());
        if let Clock::Manual(ts) = *clock {
            *clock = Clock::Manual(ts + by);
        }
    }

    /// Store a resource exactly as given (fixtures, snapshot loading).
    pub fn put_raw(&self, resource: ResourceType, raw: Json) {
        self.put_raw_type(resource.reference_type_id(), raw);
    }

    pub fn put_raw_type(&self, type_id: &str, raw: Json) {
        let mut cols = self.write();
        let col = cols.entry(type_id.to_string()).or_default();
        match id_of(&raw).and_then(|id| col.iter().position(|r| id_of(r) == Some(id))) {
            Some(idx) => col[idx] = raw,
            None => col.push(raw),
        }
    }

    /// Server-side create: assigns id, version 1 and timestamps.
    pub fn create(&self, resource: ResourceType, body: Json) -> Result<Json> {
        let mut obj = body.as_object().cloned().ok_or_else(|| anyhow!("{} draft is not an object", resource))?;
        let now = ts_string(self.now());
        obj.insert("id".into(), Json::String(Uuid::new_v4().to_string()));
        obj.insert("version".into(), json!(1));
        obj.insert("createdAt".into(), Json::String(now.clone()));
        obj.insert("lastModifiedAt".into(), Json::String(now));
        let stored = Json::Object(obj);
        self.write().entry(resource.reference_type_id().to_string()).or_default().push(stored.clone());
        Ok(stored)
    }

    /// Server-side update of an existing resource: keeps id and createdAt, bumps version.
    pub fn replace(&self, resource: ResourceType, id: &str, body: Json) -> Result<Json> {
        let mut cols = self.write();
        let col = cols.get_mut(resource.reference_type_id()).ok_or_else(|| anyhow!("{} {} not found", resource, id))?;
        let existing = col.iter_mut().find(|r| id_of(r) == Some(id)).ok_or_else(|| anyhow!("{} {} not found", resource, id))?;
        let mut obj = body.as_object().cloned().ok_or_else(|| anyhow!("{} draft is not an object", resource))?;
        let version = existing.get("version").and_then(Json::as_i64).unwrap_or(0) + 1;
        obj.insert("id".into(), Json::String(id.to_string()));
        obj.insert("version".into(), json!(version));
        if let Some(created) = existing.get("createdAt") {
            obj.insert("createdAt".into(), created.clone());
        }
        obj.insert("lastModifiedAt".into(), Json::String(ts_string(self.now())));
        *existing = Json::Object(obj);
        Ok(existing.clone())
    }

    pub fn all(&self, resource: ResourceType) -> Vec<Json> { self.all_of_type(resource.reference_type_id()) }

    pub fn all_of_type(&self, type_id: &str) -> Vec<Json> { self.read().get(type_id).cloned().unwrap_or_default() }

    pub fn type_ids(&self) -> Vec<String> { self.read().keys().cloned().collect() }

    pub fn count(&self, resource: ResourceType) -> usize {
        self.read().get(resource.reference_type_id()).map(Vec::len).unwrap_or(0)
    }

    pub fn find_by_identity(&self, resource: ResourceType, identity: &str) -> Option<Json> {
        self.read()
            .get(resource.reference_type_id())?
            .iter()
            .find(|r| resource.identity(r).as_deref() == Some(identity))
            .cloned()
    }

    /// Every `(type id, ids)` chunk this project was asked to look up.
    pub fn lookup_log(&self) -> Vec<(String, Vec<String>)> {
        self.lookup_log.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn upsert_custom_object(&self, container: &str, key: &str, value: Json) -> Json {
        let now = ts_string(self.now());
        let mut cols = self.write();
        let col = cols.entry(CUSTOM_OBJECT_TYPE_ID.to_string()).or_default();
        let pos = col.iter().position(|r| {
            r.get("container").and_then(Json::as_str) == Some(container) && r.get("key").and_then(Json::as_str) == Some(key)
        });
        match pos {
            Some(idx) => {
                let existing = &mut col[idx];
                let version = existing.get("version").and_then(Json::as_i64).unwrap_or(0) + 1;
                existing["value"] = value;
                existing["version"] = json!(version);
                existing["lastModifiedAt"] = Json::String(now);
                existing.clone()
            }
            None => {
                let stored = json!({
                    "id": Uuid::new_v4().to_string(),
                    "version": 1,
                    "container": container,
                    "key": key,
                    "value": value,
                    "createdAt": now,
                    "lastModifiedAt": now,
                });
                col.push(stored.clone());
                stored
            }
        }
    }

    fn custom_object(&self, container: &str, key: &str) -> Option<Json> {
        self.read().get(CUSTOM_OBJECT_TYPE_ID)?.iter().find(|r| {
            r.get("container").and_then(Json::as_str) == Some(container) && r.get("key").and_then(Json::as_str) == Some(key)
        }).cloned()
    }

    /// Container holding the watermark of one scope.
    pub fn watermark_container(scope: &ScopeKey) -> String {
        format!("{}.{}.{}", scope.application, scope.runner, scope.resource_type)
    }
}

#[async_trait::async_trait]
impl SourceQuery for MemoryProject {
    /// Pages are ordered by id; the token is the last id of the previous page.
    async fn fetch_page(
        &self,
        resource: ResourceType,
        predicate: &QueryPredicate,
        limit: usize,
        token: Option<&PageToken>,
    ) -> Result<Page> {
        let mut matching: Vec<Json> = self
            .all(resource)
            .into_iter()
            .filter(|r| predicate.matches(last_modified_at(r)))
            .filter(|r| match (token, id_of(r)) {
                (Some(PageToken(after)), Some(id)) => id > after.as_str(),
                (Some(_), None) => false,
                (None, _) => true,
            })
            .collect();
        matching.sort_by(|a, b| id_of(a).cmp(&id_of(b)));
        let has_more = matching.len() > limit;
        matching.truncate(limit);
        let next = if has_more { matching.last().and_then(id_of).map(|id| PageToken(id.to_string())) } else { None };
        counter!("memory_pages_served_total", 1u64);
        Ok(Page { resources: matching, next })
    }
}

#[async_trait::async_trait]
impl LookupRequest for MemoryProject {
    async fn lookup(&self, type_id: &str, ids: &[String]) -> Result<Vec<(String, Option<String>)>> {
        self.lookup_log.lock().unwrap_or_else(|p| p.into_inner()).push((type_id.to_string(), ids.to_vec()));
        let cols = self.read();
        let Some(col) = cols.get(type_id) else { return Ok(Vec::new()) };
        Ok(col
            .iter()
            .filter_map(|r| {
                let id = id_of(r)?;
                ids.iter().any(|wanted| wanted == id).then(|| (id.to_string(), reference_key_of(type_id, r)))
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl MarkerWriter for MemoryProject {
    async fn write_marker(&self) -> Result<DateTime<Utc>> {
        let container = format!("{}.{}", self.application, MARKER_KEY);
        let stored = self.upsert_custom_object(&container, MARKER_KEY, Json::String(Uuid::new_v4().to_string()));
        let ts = last_modified_at(&stored).context("marker has no lastModifiedAt")?;
        debug!(project = %self.key, ts = %ts, "wrote timestamp marker");
        Ok(ts)
    }
}

#[async_trait::async_trait]
impl WatermarkStorage for MemoryProject {
    async fn get(&self, scope: &ScopeKey) -> Result<Option<Watermark>> {
        let Some(obj) = self.custom_object(&Self::watermark_container(scope), WATERMARK_KEY) else { return Ok(None) };
        match serde_json::from_value::<Watermark>(obj.get("value").cloned().unwrap_or(Json::Null)) {
            Ok(w) => Ok(Some(w)),
            Err(e) => {
                warn!(scope = %scope, error = %e, "stored watermark is unreadable; treating as absent");
                Ok(None)
            }
        }
    }

    async fn put(&self, scope: &ScopeKey, watermark: Watermark) -> Result<Watermark> {
        let value = serde_json::to_value(&watermark).context("serializing watermark")?;
        self.upsert_custom_object(&Self::watermark_container(scope), WATERMARK_KEY, value);
        Ok(watermark)
    }
}
