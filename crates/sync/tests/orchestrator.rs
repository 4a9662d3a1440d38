#![forbid(unsafe_code)]

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use ferry_core::{
    MarkerFailurePolicy, QueryPredicate, ResourceType, ScopeKey, Statistics, SyncConfig, SyncPhase, Watermark,
    WatermarkStorage,
};
use ferry_hub::MemoryProject;
use ferry_store::IdKeyCache;
use ferry_sync::{Orchestrator, SyncRequest};
use serde_json::json;
use support::*;

fn cfg() -> SyncConfig { SyncConfig::default() }

fn cache() -> Arc<IdKeyCache> { Arc::new(IdKeyCache::with_capacity(10_000)) }

fn scope(resource: ResourceType) -> ScopeKey { ScopeKey::new("ferry-project-sync", "runnerName", resource) }

async fn stored(target: &MemoryProject, resource: ResourceType) -> Option<Watermark> {
    WatermarkStorage::get(target, &scope(resource)).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watermark_is_anchor_minus_two_minutes() {
    let (source, target) = projects();
    source.put_raw(ResourceType::States, json!({ "id": "s1", "key": "open" }));
    let mut o = Orchestrator::new(ResourceType::States, cfg(), collaborators(&source, &target), cache());
    let summary = o.run(&SyncRequest::delta(ResourceType::States)).await.unwrap();

    let expected = t_anchor() - ChronoDuration::minutes(2);
    assert_eq!(summary.watermark.as_ref().map(|w| w.last_sync_timestamp), Some(expected));
    let w = stored(&target, ResourceType::States).await.expect("watermark written");
    assert_eq!(w.last_sync_timestamp, expected);
    assert_eq!(w.statistics, Statistics { processed: 1, created: 1, updated: 0, failed: 0 });
    assert_eq!(w.application_version, env!("CARGO_PKG_VERSION"));
    assert_eq!(o.phase(), SyncPhase::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_watermark_falls_back_to_unfiltered_query_and_still_writes_one() {
    let (source, target) = projects();
    source.put_raw(ResourceType::Types, json!({ "id": "t1", "key": "order-fields", "lastModifiedAt": "2020-01-01T00:00:00.000Z" }));
    let recording = Arc::new(RecordingSource::new(Arc::clone(&source)));
    let mut collab = collaborators(&source, &target);
    collab.source = recording.clone();

    let mut o = Orchestrator::new(ResourceType::Types, cfg(), collab, cache());
    let summary = o.run(&SyncRequest::delta(ResourceType::Types)).await.unwrap();
    assert_eq!(summary.predicate, QueryPredicate::All);
    assert!(recording.predicates.lock().unwrap().iter().all(|p| *p == QueryPredicate::All));
    assert_eq!(summary.statistics.created, 1);
    assert!(stored(&target, ResourceType::Types).await.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delta_run_queries_between_watermark_and_marker_time() {
    let (source, target) = projects();
    let from = t_anchor() - ChronoDuration::hours(1);
    WatermarkStorage::put(
        &*target,
        &scope(ResourceType::States),
        Watermark {
            scope: scope(ResourceType::States),
            last_sync_timestamp: from,
            statistics: Statistics::default(),
            application_version: "0.0.1".into(),
            last_sync_duration_millis: 10,
        },
    )
    .await
    .unwrap();
    for (id, ts) in [("s1", "2024-05-01T10:00:00.000Z"), ("s2", "2024-05-01T11:30:00.000Z"), ("s3", "2024-05-01T12:30:00.000Z")] {
        source.put_raw(ResourceType::States, json!({ "id": id, "key": id, "lastModifiedAt": ts }));
    }
    let recording = Arc::new(RecordingSource::new(Arc::clone(&source)));
    let mut collab = collaborators(&source, &target);
    collab.source = recording.clone();

    let mut o = Orchestrator::new(ResourceType::States, cfg(), collab, cache());
    let summary = o.run(&SyncRequest::delta(ResourceType::States)).await.unwrap();
    let window = QueryPredicate::ModifiedBetween { from, to: t_anchor() };
    assert_eq!(summary.predicate, window);
    assert_eq!(recording.predicates.lock().unwrap()[0], window);
    assert_eq!(summary.statistics.processed, 1);
    assert!(target.find_by_identity(ResourceType::States, "s2").is_some());

    // a full run ignores the stored watermark
    let mut full = Orchestrator::new(ResourceType::States, cfg(), collaborators(&source, &target), cache());
    let summary = full.run(&SyncRequest::full(ResourceType::States)).await.unwrap();
    assert_eq!(summary.predicate, QueryPredicate::All);
    assert_eq!(summary.statistics.processed, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_uncached_references_resolve_in_one_chunk() {
    let (source, target) = projects();
    source.put_raw(ResourceType::ProductTypes, json!({ "id": "pt-1", "key": "shoes" }));
    source.put_raw(ResourceType::ProductTypes, json!({ "id": "pt-2", "key": "shirts" }));
    source.put_raw(ResourceType::Products, json!({ "id": "p-1", "key": "sneaker", "productType": { "typeId": "product-type", "id": "pt-1" } }));
    source.put_raw(ResourceType::Products, json!({ "id": "p-2", "key": "polo", "productType": { "typeId": "product-type", "id": "pt-2" } }));

    let mut o = Orchestrator::new(ResourceType::Products, cfg(), collaborators(&source, &target), cache());
    o.run(&SyncRequest::full(ResourceType::Products)).await.unwrap();

    let log = source.lookup_log();
    assert_eq!(log.len(), 1, "log={:?}", log);
    let (type_id, mut ids) = log[0].clone();
    ids.sort();
    assert_eq!((type_id.as_str(), ids), ("product-type", vec!["pt-1".to_string(), "pt-2".to_string()]));

    let sneaker = target.find_by_identity(ResourceType::Products, "sneaker").unwrap();
    assert_eq!(sneaker["productType"], json!({ "typeId": "product-type", "key": "shoes" }));
    let polo = target.find_by_identity(ResourceType::Products, "polo").unwrap();
    assert_eq!(polo["productType"], json!({ "typeId": "product-type", "key": "shirts" }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn siblings_from_an_earlier_page_are_not_looked_up_again() {
    let (source, target) = projects();
    for i in 0..501 {
        let mut cat = json!({ "id": format!("c{:03}", i), "key": format!("cat-{}", i) });
        if i > 0 {
            cat["parent"] = json!({ "typeId": "category", "id": format!("c{:03}", i - 1) });
        }
        source.put_raw(ResourceType::Categories, cat);
    }
    let cfg = SyncConfig { page_size: 500, ..SyncConfig::default() };
    let mut o = Orchestrator::new(ResourceType::Categories, cfg, collaborators(&source, &target), cache());
    let summary = o.run(&SyncRequest::full(ResourceType::Categories)).await.unwrap();

    assert_eq!(summary.pages, 2);
    assert_eq!(summary.statistics.processed, 501);
    assert!(source.lookup_log().is_empty(), "page 2 must reuse page 1 keys");
    let last = target.find_by_identity(ResourceType::Categories, "cat-500").unwrap();
    assert_eq!(last["parent"], json!({ "typeId": "category", "key": "cat-499" }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_apply_reports_phase_and_writes_no_watermark() {
    let (source, target) = projects();
    source.put_raw(ResourceType::Customers, json!({ "id": "u1", "key": "alice" }));
    let mut collab = collaborators(&source, &target);
    collab.apply = Arc::new(FlakyApply::new(collab.apply.clone(), vec![ResourceType::Customers]));

    let mut o = Orchestrator::new(ResourceType::Customers, cfg(), collab, cache());
    let err = o.run(&SyncRequest::delta(ResourceType::Customers)).await.unwrap_err();
    assert_eq!(err.resource, ResourceType::Customers);
    assert_eq!(err.phase, SyncPhase::Applying);
    assert!(err.to_string().contains("target rejected batch"), "err={}", err);
    assert_eq!(o.phase(), SyncPhase::Failed);
    assert!(stored(&target, ResourceType::Customers).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_fetch_reports_fetching_phase() {
    let (source, target) = projects();
    let mut recording = RecordingSource::new(Arc::clone(&source));
    recording.fail = true;
    let mut collab = collaborators(&source, &target);
    collab.source = Arc::new(recording);

    let mut o = Orchestrator::new(ResourceType::States, cfg(), collab, cache());
    let err = o.run(&SyncRequest::delta(ResourceType::States)).await.unwrap_err();
    assert_eq!(err.phase, SyncPhase::Fetching);
    assert!(format!("{}", err).contains("connection reset"), "err={}", err);
    assert!(stored(&target, ResourceType::States).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_runner_is_rejected_before_any_call() {
    let (source, target) = projects();
    let mut o = Orchestrator::new(ResourceType::States, cfg(), collaborators(&source, &target), cache());
    let err = o.run(&SyncRequest::delta(ResourceType::States).with_runner("night ly")).await.unwrap_err();
    assert_eq!(err.phase, SyncPhase::Idle);
    // no marker was written
    assert_eq!(target.count(ResourceType::CustomObjects), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn marker_failure_aborts_by_default() {
    let (source, target) = projects();
    source.put_raw(ResourceType::States, json!({ "id": "s1", "key": "open" }));
    let mut collab = collaborators(&source, &target);
    collab.marker = Arc::new(FailingMarker);
    let flaky = Arc::new(FlakyApply::new(collab.apply.clone(), vec![]));
    collab.apply = flaky.clone();

    let mut o = Orchestrator::new(ResourceType::States, cfg(), collab, cache());
    let err = o.run(&SyncRequest::delta(ResourceType::States)).await.unwrap_err();
    assert_eq!(err.phase, SyncPhase::Windowing);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn marker_failure_can_skip_the_watermark() {
    let (source, target) = projects();
    let from = t_anchor() - ChronoDuration::days(1);
    let previous = Watermark {
        scope: scope(ResourceType::States),
        last_sync_timestamp: from,
        statistics: Statistics::default(),
        application_version: "0.0.1".into(),
        last_sync_duration_millis: 1,
    };
    WatermarkStorage::put(&*target, &scope(ResourceType::States), previous.clone()).await.unwrap();
    source.put_raw(ResourceType::States, json!({ "id": "s1", "key": "open", "lastModifiedAt": "2024-05-01T11:00:00.000Z" }));
    let mut collab = collaborators(&source, &target);
    collab.marker = Arc::new(FailingMarker);

    let cfg = SyncConfig { marker_failure: MarkerFailurePolicy::SkipWatermark, ..SyncConfig::default() };
    let mut o = Orchestrator::new(ResourceType::States, cfg, collab, cache());
    let summary = o.run(&SyncRequest::delta(ResourceType::States)).await.unwrap();
    assert_eq!(summary.predicate, QueryPredicate::ModifiedSince { from });
    assert_eq!(summary.statistics.created, 1);
    assert!(summary.watermark.is_none());
    assert_eq!(stored(&target, ResourceType::States).await, Some(previous));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn own_custom_objects_are_not_copied() {
    let (source, target) = projects();
    source.put_raw(ResourceType::CustomObjects, json!({ "id": "o1", "container": "ferry-project-sync.timestampGenerator", "key": "timestampGenerator", "value": "x" }));
    source.put_raw(ResourceType::CustomObjects, json!({ "id": "o2", "container": "banners", "key": "home", "value": { "title": "hi" } }));

    let mut o = Orchestrator::new(ResourceType::CustomObjects, cfg(), collaborators(&source, &target), cache());
    let summary = o.run(&SyncRequest::full(ResourceType::CustomObjects)).await.unwrap();
    assert_eq!(summary.statistics.processed, 1);
    assert!(target.find_by_identity(ResourceType::CustomObjects, "banners|home").is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn buffer_is_configurable() {
    let (source, target) = projects();
    let cfg = SyncConfig { watermark_buffer: Duration::from_secs(30), ..SyncConfig::default() };
    let mut o = Orchestrator::new(ResourceType::TaxCategories, cfg, collaborators(&source, &target), cache());
    let summary = o.run(&SyncRequest::delta(ResourceType::TaxCategories)).await.unwrap();
    assert_eq!(summary.pages, 0);
    assert_eq!(summary.watermark.unwrap().last_sync_timestamp, t_anchor() - ChronoDuration::seconds(30));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resolved_keys_survive_a_cache_smaller_than_the_page() {
    let (source, target) = projects();
    for i in 0..3 {
        source.put_raw(ResourceType::Categories, json!({ "id": format!("c{}", i), "key": format!("cat-{}", i) }));
    }
    source.put_raw(ResourceType::Products, json!({
        "id": "p1", "key": "sneaker",
        "masterData": { "published": false, "staged": {
            "categories": [
                { "typeId": "category", "id": "c0" },
                { "typeId": "category", "id": "c1" },
                { "typeId": "category", "id": "c2" }
            ],
            "masterVariant": { "id": 1, "sku": "s-1", "attributes": [] }
        } }
    }));

    let small = Arc::new(IdKeyCache::with_capacity(2));
    let mut o = Orchestrator::new(ResourceType::Products, cfg(), collaborators(&source, &target), Arc::clone(&small));
    o.run(&SyncRequest::full(ResourceType::Products)).await.unwrap();

    assert_eq!(source.lookup_log().len(), 1);
    assert!(small.evicted() > 0);
    let sneaker = target.find_by_identity(ResourceType::Products, "sneaker").unwrap();
    assert_eq!(
        sneaker["categories"],
        json!([
            { "typeId": "category", "key": "cat-0" },
            { "typeId": "category", "key": "cat-1" },
            { "typeId": "category", "key": "cat-2" }
        ])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_buffer_fails_in_watermarking_instead_of_panicking() {
    let (source, target) = projects();
    source.put_raw(ResourceType::States, json!({ "id": "s1", "key": "open" }));
    let cfg = SyncConfig { watermark_buffer: Duration::from_secs(1_000_000_000_000_000), ..SyncConfig::default() };
    let mut o = Orchestrator::new(ResourceType::States, cfg, collaborators(&source, &target), cache());
    let err = o.run(&SyncRequest::delta(ResourceType::States)).await.unwrap_err();
    assert_eq!(err.phase, SyncPhase::Watermarking);
    assert!(format!("{:#}", err.source).contains("watermark buffer"), "err={:#}", err.source);
    assert!(stored(&target, ResourceType::States).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn set_of_nested_attribute_keeps_order_and_blank_keyed_custom_object_ids() {
    let (source, target) = projects();
    source.put_raw(ResourceType::Categories, json!({ "id": "c-1", "key": "cat" }));
    source.put_raw(ResourceType::ProductTypes, json!({ "id": "pt-1", "key": "ptype" }));
    source.put_raw(ResourceType::CustomObjects, json!({ "id": "co-1", "container": "cfg", "key": "banner", "value": 1 }));
    source.put_raw(ResourceType::States, json!({ "id": "s-1", "key": "st" }));
    source.put_raw(ResourceType::Customers, json!({ "id": "u-1", "key": "cust" }));
    let group = json!([
        { "name": "category", "value": { "typeId": "category", "id": "c-1" } },
        { "name": "productType", "value": { "typeId": "product-type", "id": "pt-1" } },
        { "name": "customObject", "value": { "typeId": "key-value-document", "id": "co-1" } },
        { "name": "state", "value": { "typeId": "state", "id": "s-1" } },
        { "name": "customer", "value": { "typeId": "customer", "id": "u-1" } }
    ]);
    source.put_raw(ResourceType::Products, json!({
        "id": "p1", "key": "bundle-product",
        "masterData": { "published": false, "staged": {
            "masterVariant": { "id": 1, "sku": "b-1", "attributes": [{ "name": "bundle", "value": [group] }] }
        } }
    }));
    let mut collab = collaborators(&source, &target);
    collab.lookup = Arc::new(BlankCustomObjectKeys { inner: Arc::clone(&source) });

    let cache = cache();
    let mut o = Orchestrator::new(ResourceType::Products, cfg(), collab, Arc::clone(&cache));
    o.run(&SyncRequest::full(ResourceType::Products)).await.unwrap();

    assert!(source.lookup_log().iter().any(|(t, ids)| t == "key-value-document" && ids == &vec!["co-1".to_string()]));
    assert!(!cache.contains("co-1"));
    let product = target.find_by_identity(ResourceType::Products, "bundle-product").unwrap();
    let entries = product["masterVariant"]["attributes"][0]["value"][0].as_array().cloned().unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e["name"].as_str().unwrap()).collect();
    assert_eq!(names, vec!["category", "productType", "customObject", "state", "customer"]);
    assert_eq!(entries[0]["value"], json!({ "typeId": "category", "key": "cat" }));
    assert_eq!(entries[1]["value"], json!({ "typeId": "product-type", "key": "ptype" }));
    assert_eq!(entries[2]["value"], json!({ "typeId": "key-value-document", "id": "co-1" }));
    assert_eq!(entries[3]["value"], json!({ "typeId": "state", "key": "st" }));
    assert_eq!(entries[4]["value"], json!({ "typeId": "customer", "key": "cust" }));
}
