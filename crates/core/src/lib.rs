//! Ferry core types: references, drafts, statistics, watermarks and the
//! collaborator traits the sync engine talks to.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as Json;

pub mod config;
pub mod error;
pub mod traits;

pub use config::{MarkerFailurePolicy, SyncConfig};
pub use error::{ConfigError, SyncError, SyncPhase};
pub use traits::{ApplyCollaborator, LookupRequest, MarkerWriter, SourceQuery, WatermarkStorage};

/// Reference type discriminator, e.g. `product-type`.
pub type TypeId = String;

pub mod prelude {
    pub use super::{
        Draft, Page, PageToken, QueryPredicate, Reference, ResourceIdentifier, ResourceType, ScopeKey, Statistics,
        TypeId, Watermark,
    };
    pub use super::{ApplyCollaborator, LookupRequest, MarkerWriter, SourceQuery, WatermarkStorage};
}

/// Untyped pointer into a collection of the source project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    pub type_id: TypeId,
    pub id: String,
}

impl Reference {
    pub fn new(type_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self { type_id: type_id.into(), id: id.into() }
    }

    /// Recognize a reference structurally: an object carrying a string `typeId` and a string `id`.
    pub fn from_json(v: &Json) -> Option<Self> {
        let obj = v.as_object()?;
        let type_id = obj.get("typeId")?.as_str()?;
        let id = obj.get("id")?.as_str()?;
        Some(Self::new(type_id, id))
    }

    /// Build the target-facing identifier given the cached key (if any).
    pub fn to_identifier(&self, key: Option<String>) -> ResourceIdentifier {
        match key {
            Some(k) if !k.trim().is_empty() => ResourceIdentifier::by_key(self.type_id.clone(), k),
            _ => ResourceIdentifier::by_id(self.type_id.clone(), self.id.clone()),
        }
    }
}

/// How a [`ResourceIdentifier`] locates its target: exactly one of key or id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    Key(String),
    Id(String),
}

/// A reference as carried by a draft. Serializes as `{typeId, key}` or `{typeId, id}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceIdentifier {
    type_id: TypeId,
    locator: Locator,
}

impl ResourceIdentifier {
    pub fn by_key(type_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self { type_id: type_id.into(), locator: Locator::Key(key.into()) }
    }

    pub fn by_id(type_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self { type_id: type_id.into(), locator: Locator::Id(id.into()) }
    }

    pub fn type_id(&self) -> &str { &self.type_id }
    pub fn locator(&self) -> &Locator { &self.locator }

    pub fn key(&self) -> Option<&str> {
        match &self.locator { Locator::Key(k) => Some(k), Locator::Id(_) => None }
    }

    pub fn id(&self) -> Option<&str> {
        match &self.locator { Locator::Id(i) => Some(i), Locator::Key(_) => None }
    }

    pub fn to_json(&self) -> Json {
        let mut m = serde_json::Map::new();
        m.insert("typeId".into(), Json::String(self.type_id.clone()));
        match &self.locator {
            Locator::Key(k) => m.insert("key".into(), Json::String(k.clone())),
            Locator::Id(i) => m.insert("id".into(), Json::String(i.clone())),
        };
        Json::Object(m)
    }
}

impl Serialize for ResourceIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("typeId", &self.type_id)?;
        match &self.locator {
            Locator::Key(k) => map.serialize_entry("key", k)?,
            Locator::Id(i) => map.serialize_entry("id", i)?,
        }
        map.end()
    }
}

/// The collections this tool knows how to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceType {
    #[serde(rename = "products")]
    Products,
    #[serde(rename = "categories")]
    Categories,
    #[serde(rename = "types")]
    Types,
    #[serde(rename = "productTypes")]
    ProductTypes,
    #[serde(rename = "inventoryEntries")]
    InventoryEntries,
    #[serde(rename = "cartDiscounts")]
    CartDiscounts,
    #[serde(rename = "taxCategories")]
    TaxCategories,
    #[serde(rename = "states")]
    States,
    #[serde(rename = "customObjects")]
    CustomObjects,
    #[serde(rename = "customers")]
    Customers,
    #[serde(rename = "shoppingLists")]
    ShoppingLists,
}

impl ResourceType {
    pub const ALL: [ResourceType; 11] = [
        ResourceType::Types,
        ResourceType::ProductTypes,
        ResourceType::States,
        ResourceType::TaxCategories,
        ResourceType::CustomObjects,
        ResourceType::Customers,
        ResourceType::Categories,
        ResourceType::Products,
        ResourceType::InventoryEntries,
        ResourceType::CartDiscounts,
        ResourceType::ShoppingLists,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Products => "products",
            ResourceType::Categories => "categories",
            ResourceType::Types => "types",
            ResourceType::ProductTypes => "productTypes",
            ResourceType::InventoryEntries => "inventoryEntries",
            ResourceType::CartDiscounts => "cartDiscounts",
            ResourceType::TaxCategories => "taxCategories",
            ResourceType::States => "states",
            ResourceType::CustomObjects => "customObjects",
            ResourceType::Customers => "customers",
            ResourceType::ShoppingLists => "shoppingLists",
        }
    }

    /// The `typeId` other resources use when they reference this collection.
    pub fn reference_type_id(&self) -> &'static str {
        match self {
            ResourceType::Products => "product",
            ResourceType::Categories => "category",
            ResourceType::Types => "type",
            ResourceType::ProductTypes => "product-type",
            ResourceType::InventoryEntries => "inventory-entry",
            ResourceType::CartDiscounts => "cart-discount",
            ResourceType::TaxCategories => "tax-category",
            ResourceType::States => "state",
            ResourceType::CustomObjects => "key-value-document",
            ResourceType::Customers => "customer",
            ResourceType::ShoppingLists => "shopping-list",
        }
    }

    pub fn from_reference_type_id(type_id: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|rt| rt.reference_type_id() == type_id)
    }

    /// Portable identity of a raw resource of this type, if it has one.
    /// Custom objects are identified by `container|key`; inventory entries carry no key.
    pub fn identity(&self, raw: &Json) -> Option<String> {
        let non_blank = |v: Option<&Json>| v.and_then(Json::as_str).map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        match self {
            ResourceType::InventoryEntries => None,
            ResourceType::CustomObjects => {
                let container = non_blank(raw.get("container"))?;
                let key = non_blank(raw.get("key"))?;
                Some(format!("{}|{}", container, key))
            }
            _ => non_blank(raw.get("key")),
        }
    }

    /// Key other resources may use to point at this one. Custom objects are only referenced by id.
    pub fn reference_key(&self, raw: &Json) -> Option<String> {
        match self {
            ResourceType::CustomObjects => None,
            _ => self.identity(raw),
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for ResourceType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|rt| rt.as_str() == s)
            .ok_or_else(|| ConfigError::UnknownResource(s.to_string()))
    }
}

/// Target-facing creation/update payload produced after reference rewriting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub resource: ResourceType,
    pub body: Json,
}

impl Draft {
    pub fn new(resource: ResourceType, body: Json) -> Self { Self { resource, body } }

    pub fn identity(&self) -> Option<String> { self.resource.identity(&self.body) }
}

/// Per-run counters returned by the apply collaborator. The engine only
/// accumulates and stores them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Statistics {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub failed: u64,
}

impl Statistics {
    pub fn merge(&mut self, other: &Statistics) {
        self.processed += other.processed;
        self.created += other.created;
        self.updated += other.updated;
        self.failed += other.failed;
    }

    pub fn report(&self, resource: ResourceType) -> String {
        format!(
            "Summary: {} {} were processed in total ({} created, {} updated and {} failed to sync).",
            self.processed, resource, self.created, self.updated, self.failed
        )
    }
}

/// Storage scope of a watermark. Case-sensitive, one record per scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeKey {
    pub application: String,
    pub runner: String,
    pub resource_type: ResourceType,
}

impl ScopeKey {
    pub fn new(application: impl Into<String>, runner: impl Into<String>, resource_type: ResourceType) -> Self {
        Self { application: application.into(), runner: runner.into(), resource_type }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.application, self.runner, self.resource_type)
    }
}

/// Last successful sync of one scope, persisted at the end of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Watermark {
    pub scope: ScopeKey,
    pub last_sync_timestamp: DateTime<Utc>,
    pub statistics: Statistics,
    pub application_version: String,
    pub last_sync_duration_millis: i64,
}

/// Filter applied to a source collection query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPredicate {
    /// No time filter.
    All,
    /// `lastModifiedAt` within `[from, to]`.
    ModifiedBetween { from: DateTime<Utc>, to: DateTime<Utc> },
    /// `lastModifiedAt >= from`; used when the window has no anchored upper bound.
    ModifiedSince { from: DateTime<Utc> },
}

impl QueryPredicate {
    pub fn is_windowed(&self) -> bool { !matches!(self, QueryPredicate::All) }

    pub fn matches(&self, last_modified_at: Option<DateTime<Utc>>) -> bool {
        match (self, last_modified_at) {
            (QueryPredicate::All, _) => true,
            (_, None) => false,
            (QueryPredicate::ModifiedBetween { from, to }, Some(ts)) => ts >= *from && ts <= *to,
            (QueryPredicate::ModifiedSince { from }, Some(ts)) => ts >= *from,
        }
    }

    /// Render as a where-clause for a remote query endpoint. `None` means no filter.
    pub fn to_where(&self) -> Option<String> {
        let fmt_ts = |ts: &DateTime<Utc>| ts.to_rfc3339_opts(SecondsFormat::Millis, true);
        match self {
            QueryPredicate::All => None,
            QueryPredicate::ModifiedBetween { from, to } => Some(format!(
                "lastModifiedAt >= \"{}\" AND lastModifiedAt <= \"{}\"",
                fmt_ts(from),
                fmt_ts(to)
            )),
            QueryPredicate::ModifiedSince { from } => Some(format!("lastModifiedAt >= \"{}\"", fmt_ts(from))),
        }
    }
}

/// Opaque continuation token handed back by the source query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageToken(pub String);

/// One page of raw resources plus the token for the next one (`None` when done).
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub resources: Vec<Json>,
    pub next: Option<PageToken>,
}

/// Parse the server-stamped `lastModifiedAt` of a raw resource.
pub fn last_modified_at(raw: &Json) -> Option<DateTime<Utc>> {
    raw.get("lastModifiedAt")
        .and_then(Json::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
