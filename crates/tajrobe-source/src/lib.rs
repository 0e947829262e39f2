//! Remote source contracts + the tajrobe REST API implementations.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use tajrobe_core::{CompanyProfile, RemoteReview};
use tajrobe_storage::{FetchError, FetchOutcome, HttpFetcher};
use thiserror::Error;

pub const CRATE_NAME: &str = "tajrobe-source";

pub const DEFAULT_API_BASE_URL: &str = "https://api.tajrobe.wiki/api/client";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding response from {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{url} returned no reviews; cannot determine the latest review id")]
    EmptyListing { url: String },
    #[error("{url} does not exist")]
    NotFound { url: String },
}

/// Where reviews come from. The pipeline only ever talks to this trait.
#[async_trait]
pub trait ReviewSource: Send + Sync {
    /// Highest review id currently known to the source.
    async fn latest_review_id(&self) -> Result<u64, SourceError>;

    /// A single review, or `None` when the id does not exist on the source.
    async fn fetch_review(&self, review_id: u64) -> Result<Option<RemoteReview>, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CompanyPage {
    pub companies: Vec<CompanyProfile>,
    #[serde(rename = "totalPages")]
    pub total_pages: u32,
}

/// Paginated company directory.
#[async_trait]
pub trait CompanyCatalog: Send + Sync {
    /// Fetch a 1-based page.
    async fn fetch_company_page(&self, page: u32) -> Result<CompanyPage, SourceError>;
}

#[derive(Debug, Deserialize)]
struct ReviewEnvelope {
    data: RemoteReview,
}

#[derive(Debug, Deserialize)]
struct ReviewListingEnvelope {
    data: ReviewListingPage,
}

#[derive(Debug, Deserialize)]
struct ReviewListingPage {
    #[serde(default)]
    data: Vec<ReviewCursor>,
}

#[derive(Debug, Deserialize)]
struct ReviewCursor {
    id: u64,
}

fn decode<T: DeserializeOwned>(url: &str, body: &[u8]) -> Result<T, SourceError> {
    serde_json::from_slice(body).map_err(|source| SourceError::Decode {
        url: url.to_string(),
        source,
    })
}

/// `{ "data": { ...review... } }`
pub fn parse_review_body(url: &str, body: &[u8]) -> Result<RemoteReview, SourceError> {
    decode::<ReviewEnvelope>(url, body).map(|envelope| envelope.data)
}

/// `{ "data": { "data": [ { "id": N, ... } ] } }`, newest first.
pub fn parse_latest_review_id(url: &str, body: &[u8]) -> Result<u64, SourceError> {
    let envelope: ReviewListingEnvelope = decode(url, body)?;
    envelope
        .data
        .data
        .first()
        .map(|cursor| cursor.id)
        .ok_or_else(|| SourceError::EmptyListing {
            url: url.to_string(),
        })
}

pub fn parse_company_page(url: &str, body: &[u8]) -> Result<CompanyPage, SourceError> {
    decode(url, body)
}

fn trim_base(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Review endpoints of the public client API.
#[derive(Debug, Clone)]
pub struct ApiReviewSource {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl ApiReviewSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl AsRef<str>) -> Self {
        Self {
            http,
            base_url: trim_base(base_url.as_ref()),
        }
    }

    pub fn latest_review_url(&self) -> String {
        format!("{}/review?page=1&per_page=1", self.base_url)
    }

    pub fn review_url(&self, review_id: u64) -> String {
        format!("{}/review/{review_id}", self.base_url)
    }
}

#[async_trait]
impl ReviewSource for ApiReviewSource {
    async fn latest_review_id(&self) -> Result<u64, SourceError> {
        let url = self.latest_review_url();
        match self.http.fetch(&url).await? {
            FetchOutcome::Found(body) => parse_latest_review_id(&url, &body),
            FetchOutcome::NotFound => Err(SourceError::NotFound { url }),
        }
    }

    async fn fetch_review(&self, review_id: u64) -> Result<Option<RemoteReview>, SourceError> {
        let url = self.review_url(review_id);
        match self.http.fetch(&url).await? {
            FetchOutcome::Found(body) => parse_review_body(&url, &body).map(Some),
            FetchOutcome::NotFound => Ok(None),
        }
    }
}

/// Company listing endpoint used to refresh the company cache.
#[derive(Debug, Clone)]
pub struct ApiCompanyCatalog {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl ApiCompanyCatalog {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl AsRef<str>) -> Self {
        Self {
            http,
            base_url: trim_base(base_url.as_ref()),
        }
    }

    pub fn page_url(&self, page: u32) -> String {
        format!("{}/companies?page={page}", self.base_url)
    }
}

#[async_trait]
impl CompanyCatalog for ApiCompanyCatalog {
    async fn fetch_company_page(&self, page: u32) -> Result<CompanyPage, SourceError> {
        let url = self.page_url(page);
        match self.http.fetch(&url).await? {
            FetchOutcome::Found(body) => parse_company_page(&url, &body),
            FetchOutcome::NotFound => Err(SourceError::NotFound { url }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tajrobe_storage::HttpClientConfig;

    fn fetcher() -> Arc<HttpFetcher> {
        Arc::new(HttpFetcher::new(HttpClientConfig::default()).expect("fetcher"))
    }

    #[test]
    fn review_envelope_unwraps_data() {
        let body = r#"{
            "data": {
                "id": 4512,
                "company_id": 88,
                "title": "محیط کاری خوب",
                "description": "<p>تجربه مثبت</p>",
                "rate": 4,
                "review_status": "APPROVED",
                "review_type": "REVIEW",
                "salary": 25000000,
                "job_title": "Backend Developer",
                "created_at": "2024-03-01T10:00:00.000000Z",
                "updated_at": "2024-03-02T10:00:00.000000Z",
                "company": {"id": 88, "name": "Digikala"},
                "answer": null
            }
        }"#;
        let review = parse_review_body("test://review/4512", body.as_bytes()).expect("parse");
        assert_eq!(review.id, 4512);
        assert_eq!(review.company_id, 88);
        assert_eq!(review.rate, Some(4.0));
        assert_eq!(review.job_title.as_deref(), Some("Backend Developer"));
        assert!(review.answer.is_none());
        assert_eq!(review.company.as_ref().unwrap()["name"], "Digikala");
    }

    #[test]
    fn review_without_company_id_is_a_decode_error() {
        let err = parse_review_body("test://review/1", br#"{"data": {"id": 1}}"#).expect_err("missing company_id");
        assert!(matches!(err, SourceError::Decode { .. }));
    }

    #[test]
    fn latest_id_comes_from_first_listing_entry() {
        let body = br#"{"data": {"current_page": 1, "data": [{"id": 9120, "company_id": 3}], "total": 9000}}"#;
        assert_eq!(parse_latest_review_id("test://review", body).unwrap(), 9120);
    }

    #[test]
    fn empty_listing_or_missing_id_is_fatal() {
        let empty = parse_latest_review_id("test://review", br#"{"data": {"data": []}}"#);
        assert!(matches!(empty, Err(SourceError::EmptyListing { .. })));

        let missing = parse_latest_review_id("test://review", br#"{"data": {"data": [{"title": "x"}]}}"#);
        assert!(matches!(missing, Err(SourceError::Decode { .. })));

        let garbage = parse_latest_review_id("test://review", b"<html>maintenance</html>");
        assert!(matches!(garbage, Err(SourceError::Decode { .. })));
    }

    #[test]
    fn company_page_parses_total_pages() {
        let body = br#"{"companies": [{"id": 1, "name": "Snapp", "slug": "snapp"}], "totalPages": 12}"#;
        let page = parse_company_page("test://companies", body).unwrap();
        assert_eq!(page.total_pages, 12);
        assert_eq!(page.companies[0].slug.as_deref(), Some("snapp"));
    }

    #[test]
    fn urls_follow_the_api_layout() {
        let source = ApiReviewSource::new(fetcher(), "https://api.example.test/api/client/");
        assert_eq!(
            source.latest_review_url(),
            "https://api.example.test/api/client/review?page=1&per_page=1"
        );
        assert_eq!(source.review_url(17), "https://api.example.test/api/client/review/17");

        let catalog = ApiCompanyCatalog::new(fetcher(), "https://api.example.test");
        assert_eq!(catalog.page_url(3), "https://api.example.test/companies?page=3");
    }
}
