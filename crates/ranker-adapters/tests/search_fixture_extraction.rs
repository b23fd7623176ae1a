// Fixture-driven extraction through the public API, as the sync pipeline drives it.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ranker_adapters::{FixedSampler, PageValidator, RecordExtractor, StaticPageRenderer};
use ranker_storage::RetryPolicy;

const SEARCH_URL: &str = "https://apps.shopify.com/search?q=returns+and+exchanges&page=1";

fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures/shopify-search")
        .join(name)
}

#[tokio::test]
async fn sample_fixture_yields_three_distinct_fingerprints() {
    let renderer = StaticPageRenderer::new()
        .with_page_file(SEARCH_URL, fixture_path("sample.html"))
        .expect("fixture");
    let validator = PageValidator::new(Arc::new(renderer), RetryPolicy::new(0, Duration::ZERO))
        .with_sampler(Arc::new(FixedSampler(vec![0, 2])));

    let extraction = RecordExtractor::new(validator).extract(SEARCH_URL).await.expect("extract");

    assert!(extraction.validation.passed);
    let ranks: Vec<u32> = extraction.records.iter().map(|r| r.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3]);
    let fingerprints: HashSet<&str> = extraction.records.iter().map(|r| r.fingerprint.as_str()).collect();
    assert_eq!(fingerprints.len(), 3);
    let ads: Vec<bool> = extraction.records.iter().map(|r| r.is_ad).collect();
    assert_eq!(ads, vec![false, true, false]);
}

#[tokio::test]
async fn reextracting_identical_markup_reproduces_fingerprints() {
    let html = std::fs::read_to_string(fixture_path("sample.html")).expect("fixture");
    let first = ranker_adapters::extract_from_html(&html, &Default::default()).expect("first");
    let second = ranker_adapters::extract_from_html(&html, &Default::default()).expect("second");
    assert_eq!(first.records, second.records);
}
