//! Raw resource → draft-shaped JSON, before any reference is touched.

use ferry_core::ResourceType;
use serde_json::{Map, Value as Json};

/// Fields the server stamps on every resource; drafts never carry them.
pub const SERVER_MANAGED: [&str; 7] =
    ["id", "version", "versionModifiedAt", "createdAt", "lastModifiedAt", "createdBy", "lastModifiedBy"];

/// Fields copied from the staged product projection into a product draft.
const PRODUCT_PROJECTION_FIELDS: [&str; 11] = [
    "name",
    "slug",
    "description",
    "categories",
    "categoryOrderHints",
    "masterVariant",
    "variants",
    "searchKeywords",
    "metaTitle",
    "metaDescription",
    "metaKeywords",
];

fn strip_server_managed(obj: &mut Map<String, Json>) {
    for f in SERVER_MANAGED.iter() {
        obj.remove(*f);
    }
}

fn strip_ids_in(list: Option<&mut Json>) {
    if let Some(Json::Array(items)) = list {
        for item in items.iter_mut() {
            if let Some(o) = item.as_object_mut() {
                o.remove("id");
            }
        }
    }
}

fn shape_variant(v: &mut Json) {
    if let Some(o) = v.as_object_mut() {
        o.remove("id");
        strip_ids_in(o.get_mut("prices"));
        strip_ids_in(o.get_mut("assets"));
        o.remove("availability");
        o.remove("scopedPrice");
    }
}

fn shape_product(raw: &Map<String, Json>) -> Map<String, Json> {
    let mut out = raw.clone();
    strip_server_managed(&mut out);
    let master = out.remove("masterData");
    if let Some(Json::Object(md)) = master {
        let published = md.get("published").and_then(Json::as_bool).unwrap_or(false);
        if let Some(Json::Object(staged)) = md.get("staged") {
            for f in PRODUCT_PROJECTION_FIELDS.iter() {
                if let Some(v) = staged.get(*f) {
                    out.insert((*f).to_string(), v.clone());
                }
            }
        }
        out.insert("publish".into(), Json::Bool(published));
    }
    if let Some(mv) = out.get_mut("masterVariant") {
        shape_variant(mv);
    }
    if let Some(Json::Array(vs)) = out.get_mut("variants") {
        for v in vs.iter_mut() {
            shape_variant(v);
        }
    }
    out
}

fn shape_shopping_list(raw: &Map<String, Json>) -> Map<String, Json> {
    let mut out = raw.clone();
    strip_server_managed(&mut out);
    if let Some(Json::Array(items)) = out.get_mut("lineItems") {
        for item in items.iter_mut() {
            let Some(li) = item.as_object() else { continue };
            let sku = li.get("variant").and_then(|v| v.get("sku")).and_then(Json::as_str).map(str::to_string);
            let mut draft = Map::new();
            match sku {
                Some(sku) => {
                    draft.insert("sku".into(), Json::String(sku));
                }
                None => {
                    for f in ["productId", "variantId"] {
                        if let Some(v) = li.get(f) {
                            draft.insert(f.into(), v.clone());
                        }
                    }
                }
            }
            for f in ["quantity", "addedAt", "custom"] {
                if let Some(v) = li.get(f) {
                    draft.insert(f.into(), v.clone());
                }
            }
            *item = Json::Object(draft);
        }
    }
    strip_ids_in(out.get_mut("textLineItems"));
    out
}

fn shape_custom_object(raw: &Map<String, Json>) -> Map<String, Json> {
    let mut out = Map::new();
    for f in ["container", "key", "value"] {
        if let Some(v) = raw.get(f) {
            out.insert(f.into(), v.clone());
        }
    }
    out
}

/// Produce the draft-shaped JSON for `raw`. Non-object input is returned unchanged.
pub fn shape(resource: ResourceType, raw: &Json) -> Json {
    let Some(obj) = raw.as_object() else { return raw.clone() };
    let shaped = match resource {
        ResourceType::Products => shape_product(obj),
        ResourceType::ShoppingLists => shape_shopping_list(obj),
        ResourceType::CustomObjects => shape_custom_object(obj),
        ResourceType::Categories => {
            let mut out = obj.clone();
            strip_server_managed(&mut out);
            strip_ids_in(out.get_mut("assets"));
            out
        }
        _ => {
            let mut out = obj.clone();
            strip_server_managed(&mut out);
            out
        }
    };
    Json::Object(shaped)
}
