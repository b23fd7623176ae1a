//! Core record model and content fingerprinting for the app ranker.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "ranker-core";

/// Hex length of a SHA-256 fingerprint.
pub const FINGERPRINT_HEX_LEN: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("listing name is empty")]
    EmptyName,
    #[error("listing url is empty")]
    EmptyUrl,
    #[error("rank must be positive, got {0}")]
    NonPositiveRank(u32),
    #[error("average rating is not a finite number")]
    NonFiniteRating,
    #[error("serializing listing fields: {0}")]
    Serialize(String),
}

/// The six observed values of one listing card.
///
/// Field order is part of the fingerprint contract: reordering these fields
/// changes every digest ever stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingFields {
    pub name: String,
    pub url: String,
    pub rank: u32,
    pub average_rating: Option<f64>,
    pub total_reviews: String,
    pub is_ad: bool,
}

impl ListingFields {
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.name.trim().is_empty() {
            return Err(RecordError::EmptyName);
        }
        if self.url.trim().is_empty() {
            return Err(RecordError::EmptyUrl);
        }
        if self.rank == 0 {
            return Err(RecordError::NonPositiveRank(self.rank));
        }
        if self.average_rating.is_some_and(|r| !r.is_finite()) {
            return Err(RecordError::NonFiniteRating);
        }
        Ok(())
    }

    /// Canonical serialization hashed into the fingerprint.
    pub fn canonical_string(&self) -> Result<String, RecordError> {
        serde_json::to_string(self).map_err(|e| RecordError::Serialize(e.to_string()))
    }

    pub fn fingerprint(&self) -> Result<String, RecordError> {
        let canonical = self.canonical_string()?;
        Ok(sha256_hex(canonical.as_bytes()))
    }
}

/// One marketplace listing observed on one page load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapedRecord {
    pub name: String,
    pub url: String,
    pub rank: u32,
    pub average_rating: Option<f64>,
    pub total_reviews: String,
    pub is_ad: bool,
    pub fingerprint: String,
}

impl ScrapedRecord {
    /// Validate the observed fields and seal them with their fingerprint.
    pub fn from_fields(fields: ListingFields) -> Result<Self, RecordError> {
        fields.validate()?;
        let fingerprint = fields.fingerprint()?;
        let ListingFields {
            name,
            url,
            rank,
            average_rating,
            total_reviews,
            is_ad,
        } = fields;
        Ok(Self {
            name,
            url,
            rank,
            average_rating,
            total_reviews,
            is_ad,
            fingerprint,
        })
    }

    pub fn fields(&self) -> ListingFields {
        ListingFields {
            name: self.name.clone(),
            url: self.url.clone(),
            rank: self.rank,
            average_rating: self.average_rating,
            total_reviews: self.total_reviews.clone(),
            is_ad: self.is_ad,
        }
    }

    /// True when the stored fingerprint still matches the record's fields.
    pub fn fingerprint_matches(&self) -> bool {
        self.fields()
            .fingerprint()
            .map(|fp| fp == self.fingerprint)
            .unwrap_or(false)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
