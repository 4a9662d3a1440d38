//! Typed attribute trees.
//!
//! Product variant attributes are user-defined and arbitrarily nested: a
//! value can be a scalar, a reference, a set of values, or a nested group of
//! named attributes (a set of nested groups is a `Set` of `Nested`). The tree
//! is generic over the reference payload so that rewriting is a
//! shape-preserving `map_refs` from `Reference` to `ResourceIdentifier`.

use ferry_core::{Reference, ResourceIdentifier};
use serde_json::{Map, Value as Json};

/// Anything that can sit at a reference position in an attribute tree.
pub trait RefJson {
    fn ref_json(&self) -> Json;
}

impl RefJson for Reference {
    fn ref_json(&self) -> Json {
        serde_json::json!({ "typeId": self.type_id, "id": self.id })
    }
}

impl RefJson for ResourceIdentifier {
    fn ref_json(&self) -> Json { self.to_json() }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue<R> {
    /// String, number, bool or null.
    Scalar(Json),
    Reference(R),
    /// Homogeneous or not; order is kept.
    Set(Vec<AttributeValue<R>>),
    /// Ordered named sub-attributes.
    Nested(Vec<Attribute<R>>),
    /// A plain JSON object (money, localized text, enum value, opaque payload).
    Object(Vec<(String, AttributeValue<R>)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute<R> {
    pub name: String,
    pub value: AttributeValue<R>,
}

fn is_attribute_object(v: &Json) -> bool {
    match v.as_object() {
        Some(m) => m.len() == 2 && m.get("name").map(Json::is_string).unwrap_or(false) && m.contains_key("value"),
        None => false,
    }
}

impl Attribute<Reference> {
    /// Parse `{ "name": ..., "value": ... }`.
    pub fn from_json(v: &Json) -> Option<Self> {
        if !is_attribute_object(v) { return None; }
        let name = v.get("name")?.as_str()?.to_string();
        let value = AttributeValue::from_json(v.get("value")?);
        Some(Attribute { name, value })
    }
}

impl AttributeValue<Reference> {
    /// Classify a raw attribute value by its shape.
    pub fn from_json(v: &Json) -> Self {
        if let Some(r) = Reference::from_json(v) {
            return AttributeValue::Reference(r);
        }
        match v {
            Json::Array(items) if !items.is_empty() && items.iter().all(is_attribute_object) => {
                AttributeValue::Nested(items.iter().filter_map(Attribute::from_json).collect())
            }
            Json::Array(items) => AttributeValue::Set(items.iter().map(AttributeValue::from_json).collect()),
            Json::Object(m) => {
                AttributeValue::Object(m.iter().map(|(k, vv)| (k.clone(), AttributeValue::from_json(vv))).collect())
            }
            scalar => AttributeValue::Scalar(scalar.clone()),
        }
    }
}

/// Parse a variant's `attributes` array; `None` if it is not a list of named attributes.
pub fn parse_attributes(v: &Json) -> Option<Vec<Attribute<Reference>>> {
    let items = v.as_array()?;
    items.iter().map(Attribute::from_json).collect()
}

impl<R> AttributeValue<R> {
    /// Call `f` for every reference, depth first, in document order.
    pub fn visit_refs<F: FnMut(&R)>(&self, f: &mut F) {
        match self {
            AttributeValue::Scalar(_) => {}
            AttributeValue::Reference(r) => f(r),
            AttributeValue::Set(items) => {
                for item in items { item.visit_refs(f); }
            }
            AttributeValue::Nested(attrs) => {
                for attr in attrs { attr.value.visit_refs(f); }
            }
            AttributeValue::Object(fields) => {
                for (_, v) in fields { v.visit_refs(f); }
            }
        }
    }

    /// Same tree, references replaced through `f`.
    pub fn map_refs<S, F: FnMut(&R) -> S>(&self, f: &mut F) -> AttributeValue<S> {
        match self {
            AttributeValue::Scalar(v) => AttributeValue::Scalar(v.clone()),
            AttributeValue::Reference(r) => AttributeValue::Reference(f(r)),
            AttributeValue::Set(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items { out.push(item.map_refs(f)); }
                AttributeValue::Set(out)
            }
            AttributeValue::Nested(attrs) => {
                let mut out = Vec::with_capacity(attrs.len());
                for attr in attrs { out.push(attr.map_refs(f)); }
                AttributeValue::Nested(out)
            }
            AttributeValue::Object(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (k, v) in fields { out.push((k.clone(), v.map_refs(f))); }
                AttributeValue::Object(out)
            }
        }
    }

    pub fn depth(&self) -> usize {
        match self {
            AttributeValue::Scalar(_) | AttributeValue::Reference(_) => 0,
            AttributeValue::Set(items) => 1 + items.iter().map(AttributeValue::depth).max().unwrap_or(0),
            AttributeValue::Nested(attrs) => 1 + attrs.iter().map(|a| a.value.depth()).max().unwrap_or(0),
            AttributeValue::Object(fields) => 1 + fields.iter().map(|(_, v)| v.depth()).max().unwrap_or(0),
        }
    }
}

impl<R> Attribute<R> {
    pub fn map_refs<S, F: FnMut(&R) -> S>(&self, f: &mut F) -> Attribute<S> {
        Attribute { name: self.name.clone(), value: self.value.map_refs(f) }
    }
}

impl<R: RefJson> AttributeValue<R> {
    pub fn to_json(&self) -> Json {
        match self {
            AttributeValue::Scalar(v) => v.clone(),
            AttributeValue::Reference(r) => r.ref_json(),
            AttributeValue::Set(items) => Json::Array(items.iter().map(AttributeValue::to_json).collect()),
            AttributeValue::Nested(attrs) => Json::Array(attrs.iter().map(Attribute::to_json).collect()),
            AttributeValue::Object(fields) => {
                Json::Object(fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect::<Map<_, _>>())
            }
        }
    }
}

impl<R: RefJson> Attribute<R> {
    pub fn to_json(&self) -> Json {
        let mut m = Map::new();
        m.insert("name".into(), Json::String(self.name.clone()));
        m.insert("value".into(), self.value.to_json());
        Json::Object(m)
    }
}
