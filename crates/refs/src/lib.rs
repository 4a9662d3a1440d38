//! Ferry refs: find every embedded reference in a raw resource and rewrite
//! it into a key-based (or, failing that, id-based) resource identifier.
//!
//! References are recognized structurally (`{typeId, id}`), wherever they
//! sit. Product variant attributes go through the typed [`AttributeValue`]
//! tree so nested and set-of-nested groups keep their names and order.
//! Both [`scan`] and [`rewrite`] work on the draft-shaped form produced by
//! [`shape::shape`], so every reference found is exactly one that gets rewritten.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ferry_core::{Draft, Reference, ResourceIdentifier, ResourceType, TypeId};
use ferry_store::IdKeyCache;
use serde_json::{Map, Value as Json};

pub mod attributes;
pub mod shape;

pub use attributes::{parse_attributes, Attribute, AttributeValue, RefJson};

const CATEGORY_TYPE_ID: &str = "category";

/// Read access to resolved keys.
pub trait KeySource {
    fn key_for(&self, id: &str) -> Option<String>;
}

impl KeySource for IdKeyCache {
    fn key_for(&self, id: &str) -> Option<String> { self.get(id) }
}

impl KeySource for HashMap<String, String> {
    fn key_for(&self, id: &str) -> Option<String> { self.get(id).cloned() }
}

/// Keys learned while processing one page. Checked before `shared`, which
/// may evict them between resolve and rewrite.
pub struct PageKeys<'a, K: KeySource + ?Sized> {
    local: HashMap<String, String>,
    shared: &'a K,
}

impl<'a, K: KeySource + ?Sized> PageKeys<'a, K> {
    pub fn new(shared: &'a K) -> Self { Self { local: HashMap::new(), shared } }

    /// Remember `(id, key)` pairs; blank keys are skipped.
    pub fn extend<I>(&mut self, pairs: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.local.extend(pairs.into_iter().filter(|(_, key)| !key.trim().is_empty()));
    }

    pub fn len(&self) -> usize { self.local.len() }
    pub fn is_empty(&self) -> bool { self.local.is_empty() }
}

impl<K: KeySource + ?Sized> KeySource for PageKeys<'_, K> {
    fn key_for(&self, id: &str) -> Option<String> {
        self.local.get(id).cloned().or_else(|| self.shared.key_for(id))
    }
}

fn identifier_for<K: KeySource + ?Sized>(r: &Reference, keys: &K) -> ResourceIdentifier {
    r.to_identifier(keys.key_for(&r.id))
}

// ---- structural walk over plain JSON ----

fn collect_json(v: &Json, out: &mut Vec<Reference>) {
    if let Some(r) = Reference::from_json(v) {
        out.push(r);
        return;
    }
    match v {
        Json::Object(m) => {
            for vv in m.values() { collect_json(vv, out); }
        }
        Json::Array(items) => {
            for vv in items { collect_json(vv, out); }
        }
        _ => {}
    }
}

fn rewrite_json<K: KeySource + ?Sized>(v: &Json, keys: &K) -> Json {
    if let Some(r) = Reference::from_json(v) {
        return identifier_for(&r, keys).to_json();
    }
    match v {
        Json::Object(m) => Json::Object(m.iter().map(|(k, vv)| (k.clone(), rewrite_json(vv, keys))).collect()),
        Json::Array(items) => Json::Array(items.iter().map(|vv| rewrite_json(vv, keys)).collect()),
        other => other.clone(),
    }
}

// ---- product variants: attributes as typed trees ----

fn collect_variant(v: &Json, out: &mut Vec<Reference>) {
    let Some(obj) = v.as_object() else { return collect_json(v, out) };
    for (k, vv) in obj {
        match (k.as_str(), parse_attributes(vv)) {
            ("attributes", Some(attrs)) => {
                for a in &attrs {
                    a.value.visit_refs(&mut |r: &Reference| out.push(r.clone()));
                }
            }
            _ => collect_json(vv, out),
        }
    }
}

fn rewrite_variant<K: KeySource + ?Sized>(v: &Json, keys: &K) -> Json {
    let Some(obj) = v.as_object() else { return rewrite_json(v, keys) };
    let mut out = Map::new();
    for (k, vv) in obj {
        let rewritten = match (k.as_str(), parse_attributes(vv)) {
            ("attributes", Some(attrs)) => Json::Array(
                attrs
                    .iter()
                    .map(|a| a.map_refs(&mut |r: &Reference| identifier_for(r, keys)).to_json())
                    .collect(),
            ),
            _ => rewrite_json(vv, keys),
        };
        out.insert(k.clone(), rewritten);
    }
    Json::Object(out)
}

fn collect_product(obj: &Map<String, Json>, out: &mut Vec<Reference>) {
    for (k, v) in obj {
        match k.as_str() {
            "masterVariant" => collect_variant(v, out),
            "variants" => match v.as_array() {
                Some(vs) => {
                    for var in vs { collect_variant(var, out); }
                }
                None => collect_json(v, out),
            },
            // hint keys are category ids
            "categoryOrderHints" => match v.as_object() {
                Some(hints) => out.extend(hints.keys().map(|id| Reference::new(CATEGORY_TYPE_ID, id.clone()))),
                None => collect_json(v, out),
            },
            _ => collect_json(v, out),
        }
    }
}

fn rewrite_product<K: KeySource + ?Sized>(obj: &Map<String, Json>, keys: &K) -> Json {
    let mut out = Map::new();
    for (k, v) in obj {
        let rewritten = match k.as_str() {
            "masterVariant" => rewrite_variant(v, keys),
            "variants" => match v.as_array() {
                Some(vs) => Json::Array(vs.iter().map(|var| rewrite_variant(var, keys)).collect()),
                None => rewrite_json(v, keys),
            },
            "categoryOrderHints" => match v.as_object() {
                Some(hints) => Json::Object(
                    hints.iter().map(|(id, hint)| (keys.key_for(id).unwrap_or_else(|| id.clone()), hint.clone())).collect(),
                ),
                None => rewrite_json(v, keys),
            },
            _ => rewrite_json(v, keys),
        };
        out.insert(k.clone(), rewritten);
    }
    Json::Object(out)
}

fn collect_shaped(resource: ResourceType, shaped: &Json, out: &mut Vec<Reference>) {
    match (resource, shaped.as_object()) {
        (ResourceType::Products, Some(obj)) => collect_product(obj, out),
        _ => collect_json(shaped, out),
    }
}

// ---- public surface ----

/// Every reference embedded in `raw`, in document order. Duplicates and
/// self-references are kept; callers deduplicate with [`group_ids`].
pub fn scan(resource: ResourceType, raw: &Json) -> Vec<Reference> {
    let shaped = shape::shape(resource, raw);
    let mut out = Vec::new();
    collect_shaped(resource, &shaped, &mut out);
    out
}

/// Build the draft for `raw`: shaped for the target, every reference
/// replaced by `{typeId, key}` when `keys` knows its id and `{typeId, id}`
/// otherwise. `raw` is not modified.
pub fn rewrite<K: KeySource + ?Sized>(resource: ResourceType, raw: &Json, keys: &K) -> Draft {
    let shaped = shape::shape(resource, raw);
    let body = match (resource, shaped.as_object()) {
        (ResourceType::Products, Some(obj)) => rewrite_product(obj, keys),
        _ => rewrite_json(&shaped, keys),
    };
    Draft::new(resource, body)
}

/// Deduplicate ids per referenced type.
pub fn group_ids<'a, I>(refs: I) -> BTreeMap<TypeId, BTreeSet<String>>
where
    I: IntoIterator<Item = &'a Reference>,
{
    let mut out: BTreeMap<TypeId, BTreeSet<String>> = BTreeMap::new();
    for r in refs {
        out.entry(r.type_id.clone()).or_default().insert(r.id.clone());
    }
    out
}

/// Scan a whole page and merge the results.
pub fn scan_page(resource: ResourceType, page: &[Json]) -> BTreeMap<TypeId, BTreeSet<String>> {
    let refs: Vec<Reference> = page.iter().flat_map(|raw| scan(resource, raw)).collect();
    metrics::histogram!("refs_per_page", refs.len() as f64);
    group_ids(refs.iter())
}

/// `(id, key)` of each resource on the page that other resources can reference by key.
pub fn page_identities(resource: ResourceType, page: &[Json]) -> Vec<(String, String)> {
    page.iter()
        .filter_map(|raw| {
            let id = raw.get("id").and_then(Json::as_str)?.to_string();
            let identity = resource.reference_key(raw)?;
            Some((id, identity))
        })
        .collect()
}
