//! Search-page rendering, structural validation, and listing extraction.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use ranker_core::{ListingFields, RecordError, ScrapedRecord};
use ranker_storage::{retry_with_policy, FetchError, HttpFetcher, RetryDisposition, RetryPolicy, Transient};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const CRATE_NAME: &str = "ranker-adapters";

pub const SEARCH_HOST: &str = "apps.shopify.com";
pub const SEARCH_PATH: &str = "/search";

/// Query-string marker Shopify puts on paid placements.
pub const AD_MARKER: &str = "surface_type=search_ad";

pub const DEFAULT_SAMPLE_SIZE: usize = 3;

static RATING_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d\.\d").expect("rating shape regex"));
static RATING_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\d+").expect("rating value regex"));
static REVIEWS_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r".* total reviews").expect("reviews shape regex"));

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("results container {0} not found")]
    MissingContainer(String),
    #[error(transparent)]
    Render(#[from] RenderError),
}

/// CSS selectors and attribute names that describe a search results page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchSelectors {
    pub results_container: String,
    pub card: String,
    pub name_attr: String,
    pub link_attr: String,
    pub position_attr: String,
    pub screen_reader_text: String,
}

impl Default for SearchSelectors {
    fn default() -> Self {
        Self {
            results_container: "div.search-results-component".to_string(),
            card: r#"div[data-controller="app-card"]"#.to_string(),
            name_attr: "data-app-card-name-value".to_string(),
            link_attr: "data-app-card-app-link-value".to_string(),
            position_attr: "data-app-card-intra-position-value".to_string(),
            screen_reader_text: "span.tw-sr-only".to_string(),
        }
    }
}

/// A URL on the marketplace search endpoint with a non-empty `q`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchUrl(Url);

impl SearchUrl {
    pub fn parse(input: &str) -> Result<Self, AdapterError> {
        let url = Url::parse(input).map_err(|e| AdapterError::Message(format!("{input}: {e}")))?;
        if url.scheme() != "https" || url.host_str() != Some(SEARCH_HOST) || url.path() != SEARCH_PATH {
            return Err(AdapterError::Message(format!(
                "{input}: expected https://{SEARCH_HOST}{SEARCH_PATH}?q=..."
            )));
        }
        let has_query = url
            .query_pairs()
            .any(|(key, value)| key == "q" && !value.trim().is_empty());
        if !has_query {
            return Err(AdapterError::Message(format!("{input}: missing search term q")));
        }
        Ok(Self(url))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// Read-only view of a rendered document element.
pub trait DomElement: Sized {
    fn find_all(&self, selector: &str) -> Result<Vec<Self>, AdapterError>;
    fn attribute(&self, name: &str) -> Option<String>;
    fn text(&self) -> String;
    fn parent(&self) -> Option<Self>;
}

impl<'a> DomElement for ElementRef<'a> {
    fn find_all(&self, selector: &str) -> Result<Vec<Self>, AdapterError> {
        let sel = Selector::parse(selector).map_err(|e| AdapterError::Message(e.to_string()))?;
        Ok(self.select(&sel).collect())
    }

    fn attribute(&self, name: &str) -> Option<String> {
        self.value().attr(name).map(ToString::to_string)
    }

    fn text(&self) -> String {
        ElementRef::text(self).collect()
    }

    fn parent(&self) -> Option<Self> {
        (**self).parent().and_then(ElementRef::wrap)
    }
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    /// Selector that must be present before the page counts as rendered.
    pub wait_for: String,
    pub timeout: Duration,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            wait_for: SearchSelectors::default().results_container,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub url: String,
    pub final_url: String,
    pub html: String,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("timed out after {after:?} loading {url}")]
    Timeout { url: String, after: Duration },
    #[error("{selector} never appeared on {url}")]
    SelectorNotFound { selector: String, url: String },
    #[error("invalid selector {0}")]
    InvalidSelector(String),
    #[error("no page available for {0}")]
    NotFound(String),
}

impl Transient for RenderError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            RenderError::Fetch(err) => err.disposition(),
            RenderError::Timeout { .. } => RetryDisposition::Retryable,
            RenderError::SelectorNotFound { .. }
            | RenderError::InvalidSelector(_)
            | RenderError::NotFound(_) => RetryDisposition::NonRetryable,
        }
    }
}

/// Loads a URL and hands back the document once `wait_for` is present.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, url: &str, options: &RenderOptions) -> Result<RenderedPage, RenderError>;
}

fn ensure_selector_present(html: &str, url: &str, selector: &str) -> Result<(), RenderError> {
    let sel = Selector::parse(selector).map_err(|e| RenderError::InvalidSelector(format!("{selector}: {e}")))?;
    let document = Html::parse_document(html);
    if document.select(&sel).next().is_some() {
        Ok(())
    } else {
        Err(RenderError::SelectorNotFound {
            selector: selector.to_string(),
            url: url.to_string(),
        })
    }
}

/// Renders server-side markup fetched over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPageRenderer {
    http: HttpFetcher,
}

impl HttpPageRenderer {
    pub fn new(http: HttpFetcher) -> Self {
        Self { http }
    }
}

#[async_trait]
impl PageRenderer for HttpPageRenderer {
    async fn render(&self, url: &str, options: &RenderOptions) -> Result<RenderedPage, RenderError> {
        let fetched = tokio::time::timeout(options.timeout, self.http.fetch_text(url))
            .await
            .map_err(|_| RenderError::Timeout {
                url: url.to_string(),
                after: options.timeout,
            })??;
        ensure_selector_present(&fetched.body, url, &options.wait_for)?;
        debug!(url, final_url = %fetched.final_url, bytes = fetched.body.len(), "page rendered");
        Ok(RenderedPage {
            url: url.to_string(),
            final_url: fetched.final_url,
            html: fetched.body,
        })
    }
}

/// Serves pre-captured markup keyed by URL. Counts renders and can be told to
/// time out on a window of render attempts.
#[derive(Debug, Default)]
pub struct StaticPageRenderer {
    pages: HashMap<String, String>,
    renders: AtomicUsize,
    timeout_from: AtomicUsize,
    timeout_until: AtomicUsize,
}

impl StaticPageRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: impl Into<String>, html: impl Into<String>) -> Self {
        self.pages.insert(url.into(), html.into());
        self
    }

    pub fn with_page_file(self, url: impl Into<String>, path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let html = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Ok(self.with_page(url, html))
    }

    pub fn render_count(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    /// Time out the next `count` renders.
    pub fn fail_next_renders(&self, count: usize) {
        self.fail_renders_after(0, count);
    }

    /// Let `successes` more renders through, then time out the `count` after them.
    pub fn fail_renders_after(&self, successes: usize, count: usize) {
        let from = self.render_count() + successes;
        self.timeout_from.store(from, Ordering::SeqCst);
        self.timeout_until.store(from + count, Ordering::SeqCst);
    }
}

#[async_trait]
impl PageRenderer for StaticPageRenderer {
    async fn render(&self, url: &str, options: &RenderOptions) -> Result<RenderedPage, RenderError> {
        let attempt = self.renders.fetch_add(1, Ordering::SeqCst);
        let failing = self.timeout_from.load(Ordering::SeqCst)..self.timeout_until.load(Ordering::SeqCst);
        if failing.contains(&attempt) {
            return Err(RenderError::Timeout {
                url: url.to_string(),
                after: options.timeout,
            });
        }
        let html = self
            .pages
            .get(url)
            .ok_or_else(|| RenderError::NotFound(url.to_string()))?;
        ensure_selector_present(html, url, &options.wait_for)?;
        Ok(RenderedPage {
            url: url.to_string(),
            final_url: url.to_string(),
            html: html.clone(),
        })
    }
}

/// Picks which cards the validator inspects.
pub trait CardSampler: Send + Sync {
    fn sample(&self, card_count: usize, sample_size: usize) -> Vec<usize>;
}

/// Uniform sampling with replacement.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSampler;

impl CardSampler for RandomSampler {
    fn sample(&self, card_count: usize, sample_size: usize) -> Vec<usize> {
        if card_count == 0 {
            return Vec::new();
        }
        let mut rng = rand::rng();
        (0..sample_size)
            .map(|_| rng.random_range(0..card_count))
            .collect()
    }
}

/// Always inspects the same indices, wrapped to the card count.
#[derive(Debug, Clone)]
pub struct FixedSampler(pub Vec<usize>);

impl CardSampler for FixedSampler {
    fn sample(&self, card_count: usize, _sample_size: usize) -> Vec<usize> {
        if card_count == 0 {
            return Vec::new();
        }
        self.0.iter().map(|i| i % card_count).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Error)]
pub enum ValidationFailure {
    #[error("not a search url: {0}")]
    InvalidUrl(String),
    #[error("render failed: {0}")]
    Render(String),
    #[error("selector error: {0}")]
    Selector(String),
    #[error("results container {0} not found")]
    MissingContainer(String),
    #[error("expected more than one app card, found {0}")]
    TooFewCards(usize),
    #[error("card {index} has no {attribute}")]
    MissingAttribute { index: usize, attribute: String },
    #[error("card {index} lacks rating/review elements")]
    MissingSubElement { index: usize },
    #[error("card {index} rating text {text:?} does not start with d.d")]
    BadRating { index: usize, text: String },
    #[error("card {index} reviews text {text:?} does not match '... total reviews'")]
    BadReviews { index: usize, text: String },
}

impl From<AdapterError> for ValidationFailure {
    fn from(err: AdapterError) -> Self {
        ValidationFailure::Selector(err.to_string())
    }
}

/// Outcome of one validation pass, kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationReport {
    pub url: String,
    pub passed: bool,
    pub card_count: usize,
    pub sampled: Vec<usize>,
    pub failure: Option<ValidationFailure>,
}

impl ValidationReport {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            passed: false,
            card_count: 0,
            sampled: Vec::new(),
            failure: None,
        }
    }

    fn finish(mut self, result: Result<(), ValidationFailure>) -> Self {
        match result {
            Ok(()) => self.passed = true,
            Err(failure) => {
                self.passed = false;
                self.failure = Some(failure);
            }
        }
        self
    }
}

fn non_empty_attr<E: DomElement>(element: &E, name: &str) -> Option<String> {
    element
        .attribute(name)
        .filter(|value| !value.trim().is_empty())
}

fn results_container<E: DomElement>(root: &E, selectors: &SearchSelectors) -> Result<Option<E>, AdapterError> {
    Ok(root.find_all(&selectors.results_container)?.into_iter().next())
}

/// Parent text of the first screen-reader span, which holds the star rating.
fn rating_text<E: DomElement>(spans: &[E]) -> Option<String> {
    spans
        .first()
        .and_then(DomElement::parent)
        .map(|p| p.text().trim().to_string())
}

pub fn parse_rating(text: &str) -> Option<f64> {
    RATING_VALUE
        .find(text)
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

pub fn strip_query(link: &str) -> &str {
    link.split('?').next().unwrap_or(link)
}

fn check_card<E: DomElement>(card: &E, index: usize, selectors: &SearchSelectors) -> Result<(), ValidationFailure> {
    for attribute in [&selectors.name_attr, &selectors.link_attr, &selectors.position_attr] {
        if non_empty_attr(card, attribute).is_none() {
            return Err(ValidationFailure::MissingAttribute {
                index,
                attribute: attribute.clone(),
            });
        }
    }

    let spans = card.find_all(&selectors.screen_reader_text)?;
    if spans.len() < 2 {
        return Err(ValidationFailure::MissingSubElement { index });
    }
    let rating = rating_text(&spans).unwrap_or_default();
    if !RATING_SHAPE.is_match(&rating) {
        return Err(ValidationFailure::BadRating { index, text: rating });
    }
    let reviews = spans[1].text().trim().to_string();
    if !REVIEWS_SHAPE.is_match(&reviews) {
        return Err(ValidationFailure::BadReviews { index, text: reviews });
    }
    Ok(())
}

/// Structural self-check of a rendered search page.
pub fn check_document<E: DomElement>(
    root: &E,
    selectors: &SearchSelectors,
    sampler: &dyn CardSampler,
    sample_size: usize,
    report: &mut ValidationReport,
) -> Result<(), ValidationFailure> {
    let container = results_container(root, selectors)?
        .ok_or_else(|| ValidationFailure::MissingContainer(selectors.results_container.clone()))?;

    let cards = container.find_all(&selectors.card)?;
    report.card_count = cards.len();
    if cards.len() <= 1 {
        return Err(ValidationFailure::TooFewCards(cards.len()));
    }

    report.sampled = sampler.sample(cards.len(), sample_size);
    debug!(sampled = ?report.sampled, "sampling app cards");
    for &index in &report.sampled {
        let card = cards
            .get(index)
            .ok_or_else(|| ValidationFailure::Selector(format!("sampled card {index} out of range")))?;
        check_card(card, index, selectors)?;
    }
    Ok(())
}

fn inspect_page(
    html: &str,
    url: &str,
    selectors: &SearchSelectors,
    sampler: &dyn CardSampler,
    sample_size: usize,
) -> ValidationReport {
    let document = Html::parse_document(html);
    let mut report = ValidationReport::new(url);
    let result = check_document(&document.root_element(), selectors, sampler, sample_size, &mut report);
    report.finish(result)
}

/// Renders a search page and asserts it still has the shape extraction relies on.
#[derive(Clone)]
pub struct PageValidator {
    renderer: Arc<dyn PageRenderer>,
    sampler: Arc<dyn CardSampler>,
    selectors: SearchSelectors,
    render: RenderOptions,
    retry: RetryPolicy,
    sample_size: usize,
}

impl PageValidator {
    pub fn new(renderer: Arc<dyn PageRenderer>, retry: RetryPolicy) -> Self {
        Self {
            renderer,
            sampler: Arc::new(RandomSampler),
            selectors: SearchSelectors::default(),
            render: RenderOptions::default(),
            retry,
            sample_size: DEFAULT_SAMPLE_SIZE,
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn CardSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_render_options(mut self, render: RenderOptions) -> Self {
        self.render = render;
        self
    }

    pub fn with_selectors(mut self, selectors: SearchSelectors) -> Self {
        self.render.wait_for = selectors.results_container.clone();
        self.selectors = selectors;
        self
    }

    /// Full diagnostic report. Never fails: problems land in `failure`.
    pub async fn check(&self, url: &str) -> ValidationReport {
        if let Err(err) = SearchUrl::parse(url) {
            return ValidationReport::new(url).finish(Err(ValidationFailure::InvalidUrl(err.to_string())));
        }

        let rendered = retry_with_policy(&self.retry, "validate", |_| {
            self.renderer.render(url, &self.render)
        })
        .await;

        let report = match rendered {
            Ok(page) => inspect_page(&page.html, url, &self.selectors, self.sampler.as_ref(), self.sample_size),
            Err(err) => ValidationReport::new(url).finish(Err(ValidationFailure::Render(err.to_string()))),
        };

        match &report.failure {
            None => info!(url, cards = report.card_count, sampled = ?report.sampled, "search page passed validation"),
            Some(failure) => warn!(url, cards = report.card_count, %failure, "search page failed validation"),
        }
        report
    }

    pub async fn validate(&self, url: &str) -> bool {
        self.check(url).await.passed
    }
}

#[derive(Debug, Error)]
pub enum CardError {
    #[error("missing attribute {0}")]
    MissingAttribute(String),
    #[error("unparsable rank {0:?}")]
    BadRank(String),
    #[error("missing reviews element")]
    MissingReviews,
    #[error("rank {0} already used by an earlier card")]
    DuplicateRank(u32),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedCard {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExtractedBatch {
    pub records: Vec<ScrapedRecord>,
    pub skipped: Vec<SkippedCard>,
}

fn required_attr<E: DomElement>(card: &E, name: &str) -> Result<String, CardError> {
    non_empty_attr(card, name).ok_or_else(|| CardError::MissingAttribute(name.to_string()))
}

/// Read one card into a fingerprinted record, or explain why it cannot be.
pub fn extract_card<E: DomElement>(card: &E, selectors: &SearchSelectors) -> Result<ScrapedRecord, CardError> {
    let name = required_attr(card, &selectors.name_attr)?.trim().to_string();
    let raw_link = required_attr(card, &selectors.link_attr)?;
    let raw_rank = required_attr(card, &selectors.position_attr)?;
    let rank = raw_rank
        .trim()
        .parse::<u32>()
        .map_err(|_| CardError::BadRank(raw_rank.clone()))?;

    let spans = card.find_all(&selectors.screen_reader_text)?;
    let total_reviews = spans
        .get(1)
        .map(|span| span.text().trim().to_string())
        .ok_or(CardError::MissingReviews)?;
    let average_rating = rating_text(&spans).as_deref().and_then(parse_rating);

    let record = ScrapedRecord::from_fields(ListingFields {
        name,
        url: strip_query(&raw_link).to_string(),
        rank,
        average_rating,
        total_reviews,
        is_ad: raw_link.contains(AD_MARKER),
    })?;
    Ok(record)
}

/// Walk every card under the results container in document order.
pub fn extract_document<E: DomElement>(root: &E, selectors: &SearchSelectors) -> Result<ExtractedBatch, AdapterError> {
    let container = results_container(root, selectors)?
        .ok_or_else(|| AdapterError::MissingContainer(selectors.results_container.clone()))?;

    let mut batch = ExtractedBatch::default();
    let mut ranks = HashSet::new();
    for (index, card) in container.find_all(&selectors.card)?.iter().enumerate() {
        let outcome = extract_card(card, selectors).and_then(|record| {
            if ranks.insert(record.rank) {
                Ok(record)
            } else {
                Err(CardError::DuplicateRank(record.rank))
            }
        });
        match outcome {
            Ok(record) => batch.records.push(record),
            Err(err) => {
                warn!(card = index, error = %err, "skipping app card");
                batch.skipped.push(SkippedCard {
                    index,
                    reason: err.to_string(),
                });
            }
        }
    }
    Ok(batch)
}

pub fn extract_from_html(html: &str, selectors: &SearchSelectors) -> Result<ExtractedBatch, AdapterError> {
    let document = Html::parse_document(html);
    extract_document(&document.root_element(), selectors)
}

/// Result of one extraction attempt, including the gate decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Extraction {
    pub validation: ValidationReport,
    pub records: Vec<ScrapedRecord>,
    pub skipped: Vec<SkippedCard>,
}

/// Validates, then extracts one record per card.
#[derive(Clone)]
pub struct RecordExtractor {
    validator: PageValidator,
}

impl RecordExtractor {
    pub fn new(validator: PageValidator) -> Self {
        Self { validator }
    }

    pub fn validator(&self) -> &PageValidator {
        &self.validator
    }

    /// Empty `records` when validation fails; extraction is not attempted.
    pub async fn extract(&self, url: &str) -> Result<Extraction, AdapterError> {
        let validation = self.validator.check(url).await;
        if !validation.passed {
            warn!(url, "validation failed; skipping extraction");
            return Ok(Extraction {
                validation,
                records: Vec::new(),
                skipped: Vec::new(),
            });
        }

        let v = &self.validator;
        let page = retry_with_policy(&v.retry, "extract", |_| v.renderer.render(url, &v.render)).await?;
        let batch = extract_from_html(&page.html, &v.selectors)?;
        info!(
            url,
            records = batch.records.len(),
            skipped = batch.skipped.len(),
            "extracted records from search page"
        );
        Ok(Extraction {
            validation,
            records: batch.records,
            skipped: batch.skipped,
        })
    }
}
