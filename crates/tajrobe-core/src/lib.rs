//! Core domain model for the tajrobe review dataset.
//!
//! The dataset is a flat list of [`Company`] records, each owning its
//! [`Review`]s. Everything here is pure: set/range arithmetic over review ids
//! and the in-memory merge of freshly fetched reviews.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tajrobe-core";

/// Format tag stamped into `_meta.version` of every imported review.
pub const IMPORT_FORMAT_VERSION: &str = "1.0";

/// Publication state assigned to imported reviews.
pub const PUBLISHED_STATUS: &str = "PUBLISH";

pub const MAX_REVIEW_RATE: f64 = 5.0;

/// Storage-layer surrogate key, serialized as `{ "$oid": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageId {
    #[serde(rename = "$oid")]
    pub oid: String,
}

/// Storage-layer timestamp, serialized as `{ "$date": "..." }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDate {
    #[serde(rename = "$date")]
    pub date: DateTime<Utc>,
}

impl StorageDate {
    pub fn new(date: DateTime<Utc>) -> Self {
        Self { date }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMeta {
    pub imported_at: DateTime<Utc>,
    pub version: String,
}

/// Company fields shared by the review dataset and the company catalog cache.
///
/// Keys the schema does not name are kept in `extra` so a rewrite of the file
/// never loses data the site depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyProfile {
    pub id: u64,
    #[serde(default)]
    pub slug: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rate: Option<f64>,
    #[serde(default)]
    pub review_average: Option<f64>,
    #[serde(default)]
    pub total_review: Option<u64>,
    #[serde(default)]
    pub salary_min: Option<f64>,
    #[serde(default)]
    pub salary_max: Option<f64>,
    #[serde(default)]
    pub verified: Option<u8>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Top-level persisted record of the dataset file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    #[serde(flatten)]
    pub profile: CompanyProfile,
    #[serde(default)]
    pub reviews: Vec<Review>,
}

impl Company {
    pub fn id(&self) -> u64 {
        self.profile.id
    }
}

/// Persisted review shape, nested under exactly one [`Company`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub storage_id: Option<StorageId>,
    pub id: u64,
    pub company_id: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rate: Option<f64>,
    #[serde(default)]
    pub review_status: Option<String>,
    #[serde(default)]
    pub review_type: Option<String>,
    #[serde(default)]
    pub salary: Option<f64>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub answer: Option<JsonValue>,
    #[serde(default)]
    pub approved_by: Option<JsonValue>,
    /// Source's embedded company summary, JSON-encoded.
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub sexual_harassment: Option<JsonValue>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub stored_at: Option<StorageDate>,
    #[serde(rename = "updatedAt", default, skip_serializing_if = "Option::is_none")]
    pub stored_updated_at: Option<StorageDate>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<ImportMeta>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Review {
    /// Convert a fetched record into the persisted shape with import metadata attached.
    pub fn from_remote(remote: RemoteReview, storage_id: StorageId, imported_at: DateTime<Utc>) -> Self {
        Self {
            storage_id: Some(storage_id),
            id: remote.id,
            company_id: remote.company_id,
            title: remote.title,
            description: remote.description,
            rate: remote.rate,
            review_status: remote.review_status,
            review_type: remote.review_type,
            salary: remote.salary,
            job_title: remote.job_title,
            created_at: remote.created_at,
            updated_at: remote.updated_at,
            status: Some(PUBLISHED_STATUS.to_string()),
            answer: remote.answer,
            approved_by: remote.approved_by,
            company: remote.company.map(|value| value.to_string()),
            sexual_harassment: remote.sexual_harassment,
            start_date: remote.start_date,
            stored_at: Some(StorageDate::new(imported_at)),
            stored_updated_at: Some(StorageDate::new(imported_at)),
            meta: Some(ImportMeta {
                imported_at,
                version: IMPORT_FORMAT_VERSION.to_string(),
            }),
            extra: Map::new(),
        }
    }
}

/// Review record as served by the remote API; handoff contract from sources into the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteReview {
    pub id: u64,
    pub company_id: u64,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub rate: Option<f64>,
    #[serde(default)]
    pub review_status: Option<String>,
    #[serde(default)]
    pub review_type: Option<String>,
    #[serde(default)]
    pub salary: Option<f64>,
    #[serde(default)]
    pub job_title: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub answer: Option<JsonValue>,
    #[serde(default)]
    pub approved_by: Option<JsonValue>,
    #[serde(default)]
    pub company: Option<JsonValue>,
    #[serde(default)]
    pub sexual_harassment: Option<JsonValue>,
    #[serde(default)]
    pub start_date: Option<String>,
}

impl RemoteReview {
    pub fn new(id: u64, company_id: u64) -> Self {
        Self {
            id,
            company_id,
            title: None,
            description: None,
            rate: None,
            review_status: None,
            review_type: None,
            salary: None,
            job_title: None,
            created_at: None,
            updated_at: None,
            answer: None,
            approved_by: None,
            company: None,
            sexual_harassment: None,
            start_date: None,
        }
    }
}

/// Source of surrogate storage ids for imported reviews.
pub trait StorageIdGenerator: Send + Sync {
    fn next_id(&self) -> StorageId;
}

#[derive(Debug, Default)]
pub struct UuidStorageIds;

impl StorageIdGenerator for UuidStorageIds {
    fn next_id(&self) -> StorageId {
        StorageId {
            oid: Uuid::new_v4().simple().to_string(),
        }
    }
}

/// Monotonic hex counter; deterministic output for fixtures and tests.
#[derive(Debug, Default)]
pub struct SequentialStorageIds {
    next: AtomicU64,
}

impl SequentialStorageIds {
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }
}

impl StorageIdGenerator for SequentialStorageIds {
    fn next_id(&self) -> StorageId {
        let value = self.next.fetch_add(1, Ordering::Relaxed);
        StorageId {
            oid: format!("{value:024x}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvariantViolation {
    #[error("company id {0} appears more than once")]
    DuplicateCompany(u64),
    #[error("review {review_id} is stored under company {company_id} but references company {referenced}")]
    ForeignReview {
        review_id: u64,
        company_id: u64,
        referenced: u64,
    },
    #[error("review id {review_id} appears under company {first_company} and company {second_company}")]
    DuplicateReview {
        review_id: u64,
        first_company: u64,
        second_company: u64,
    },
    #[error("review {review_id} has rate {rate} outside 0..=5")]
    RateOutOfRange { review_id: u64, rate: f64 },
}

/// Check dataset-wide invariants that the type schema alone cannot express.
pub fn validate_dataset(companies: &[Company]) -> Result<(), InvariantViolation> {
    let mut seen = HashSet::with_capacity(companies.len());
    let mut review_owner: HashMap<u64, u64> = HashMap::new();
    for company in companies {
        if !seen.insert(company.id()) {
            return Err(InvariantViolation::DuplicateCompany(company.id()));
        }
        for review in &company.reviews {
            if review.company_id != company.id() {
                return Err(InvariantViolation::ForeignReview {
                    review_id: review.id,
                    company_id: company.id(),
                    referenced: review.company_id,
                });
            }
            if let Some(first_company) = review_owner.insert(review.id, company.id()) {
                return Err(InvariantViolation::DuplicateReview {
                    review_id: review.id,
                    first_company,
                    second_company: company.id(),
                });
            }
            check_rate(review.id, review.rate)?;
        }
    }
    Ok(())
}

/// Reject fetched records that would make the dataset fail validation on the next load.
pub fn validate_remote_review(review: &RemoteReview) -> Result<(), InvariantViolation> {
    check_rate(review.id, review.rate)
}

fn check_rate(review_id: u64, rate: Option<f64>) -> Result<(), InvariantViolation> {
    match rate {
        Some(rate) if !(0.0..=MAX_REVIEW_RATE).contains(&rate) => {
            Err(InvariantViolation::RateOutOfRange { review_id, rate })
        }
        _ => Ok(()),
    }
}

/// Every review id currently present in the dataset.
pub fn known_review_ids(companies: &[Company]) -> HashSet<u64> {
    companies
        .iter()
        .flat_map(|company| company.reviews.iter().map(|review| review.id))
        .collect()
}

/// Ids in `1..=latest_review_id` not yet present, ascending.
pub fn candidate_ids(latest_review_id: u64, known: &HashSet<u64>) -> Vec<u64> {
    (1..=latest_review_id).filter(|id| !known.contains(id)).collect()
}

/// Split candidates into positional batches of `batch_size` (minimum 1).
pub fn partition_batches(candidates: &[u64], batch_size: usize) -> Vec<Vec<u64>> {
    candidates
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Group fetched reviews by owning company, keeping fetch order inside each group.
pub fn group_by_company(reviews: Vec<RemoteReview>) -> BTreeMap<u64, Vec<RemoteReview>> {
    let mut groups: BTreeMap<u64, Vec<RemoteReview>> = BTreeMap::new();
    for review in reviews {
        groups.entry(review.company_id).or_default().push(review);
    }
    groups
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub merged: usize,
    pub orphaned: usize,
    /// Company ids referenced by fetched reviews but missing from the dataset.
    pub orphan_company_ids: Vec<u64>,
}

/// Append fetched reviews to their owning companies.
///
/// Reviews whose company is not in the dataset are dropped and counted.
pub fn merge_reviews(
    companies: &mut [Company],
    fetched: Vec<RemoteReview>,
    ids: &dyn StorageIdGenerator,
    imported_at: DateTime<Utc>,
) -> MergeOutcome {
    let positions: HashMap<u64, usize> = companies
        .iter()
        .enumerate()
        .map(|(idx, company)| (company.id(), idx))
        .collect();

    let mut outcome = MergeOutcome::default();
    for (company_id, group) in group_by_company(fetched) {
        let Some(&idx) = positions.get(&company_id) else {
            outcome.orphaned += group.len();
            outcome.orphan_company_ids.push(company_id);
            continue;
        };
        outcome.merged += group.len();
        companies[idx].reviews.extend(
            group
                .into_iter()
                .map(|remote| Review::from_remote(remote, ids.next_id(), imported_at)),
        );
    }
    outcome
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatasetStats {
    pub companies: usize,
    pub reviews: usize,
    pub companies_without_reviews: usize,
    pub highest_review_id: Option<u64>,
}

pub fn dataset_stats(companies: &[Company]) -> DatasetStats {
    DatasetStats {
        companies: companies.len(),
        reviews: companies.iter().map(|c| c.reviews.len()).sum(),
        companies_without_reviews: companies.iter().filter(|c| c.reviews.is_empty()).count(),
        highest_review_id: companies
            .iter()
            .flat_map(|c| c.reviews.iter().map(|r| r.id))
            .max(),
    }
}
