//! Core lead model and content fingerprinting.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "leads-core";

/// Fallback text used when a scraped listing has no description element.
pub const NO_DESCRIPTION: &str = "No description available.";

/// Origin channel of a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeadSource {
    Form,
    Scraper,
}

impl LeadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadSource::Form => "form",
            LeadSource::Scraper => "scraper",
        }
    }
}

impl fmt::Display for LeadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown lead source {0:?}")]
pub struct UnknownLeadSource(pub String);

impl FromStr for LeadSource {
    type Err = UnknownLeadSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "form" => Ok(LeadSource::Form),
            "scraper" => Ok(LeadSource::Scraper),
            other => Err(UnknownLeadSource(other.to_string())),
        }
    }
}

/// Content-derived identity of a lead. Two leads with the same key are duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Wraps an already computed digest, e.g. one read back from storage.
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for IdentityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lowercase then trim. Absent content normalizes to the empty string.
pub fn normalize_fragment(input: Option<&str>) -> String {
    input.unwrap_or_default().to_lowercase().trim().to_string()
}

/// Fingerprint an ordered list of fields.
///
/// Every field is normalized on its own before the fields are concatenated
/// (no separator), so padding or casing in one field can never leak into the
/// next. The digest is SHA-256 rendered as lowercase hex; there is no salt, so
/// keys are stable across restarts and deployments.
pub fn fingerprint_fields<'a, I>(fields: I) -> IdentityKey
where
    I: IntoIterator<Item = Option<&'a str>>,
{
    let combined = fields
        .into_iter()
        .map(normalize_fragment)
        .collect::<String>();
    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    IdentityKey(hex::encode(hasher.finalize()))
}

/// Identity rule for form submissions: normalized email, then normalized details.
pub fn generate_identity_key(email: Option<&str>, details: Option<&str>) -> IdentityKey {
    fingerprint_fields([email, details])
}

/// Identity rule for scraped leads, which carry no email: normalized details only.
pub fn generate_details_hash(details: Option<&str>) -> IdentityKey {
    fingerprint_fields([details])
}

/// Structured pieces a listing item was rendered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingFields {
    pub title: String,
    pub url: String,
    pub description: String,
}

impl ListingFields {
    /// Render the labeled `details` text. Scraped identity keys hash this exact
    /// string, so the format must not change without re-keying stored leads.
    pub fn render_details(&self) -> String {
        format!(
            "Title: {} - URL: {} - Description: {}",
            self.title, self.url, self.description
        )
    }
}

/// A candidate lead before identity has been computed or storage attempted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeadDraft {
    pub name: Option<String>,
    pub email: Option<String>,
    pub details: Option<String>,
    pub source: LeadSource,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing: Option<ListingFields>,
}

impl LeadDraft {
    pub fn from_form(name: String, email: String, details: String, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: Some(name),
            email: Some(email),
            details: Some(details),
            source: LeadSource::Form,
            timestamp,
            listing: None,
        }
    }

    pub fn from_listing(listing: ListingFields, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: None,
            email: None,
            details: Some(listing.render_details()),
            source: LeadSource::Scraper,
            timestamp,
            listing: Some(listing),
        }
    }

    /// Identity key under the rule for this draft's source.
    pub fn identity_key(&self) -> IdentityKey {
        match self.source {
            LeadSource::Form => {
                generate_identity_key(self.email.as_deref(), self.details.as_deref())
            }
            LeadSource::Scraper => generate_details_hash(self.details.as_deref()),
        }
    }

    /// Converts into an insertable lead; `None` when `details` is absent.
    pub fn into_new_lead(self) -> Option<NewLead> {
        let details = self.details?;
        Some(NewLead {
            name: self.name,
            email: self.email,
            details,
            source: self.source,
            timestamp: self.timestamp,
        })
    }
}

/// A lead ready to be written: `details` is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
    pub name: Option<String>,
    pub email: Option<String>,
    pub details: String,
    pub source: LeadSource,
    pub timestamp: DateTime<Utc>,
}

/// Persisted lead. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    pub name: Option<String>,
    pub email: Option<String>,
    pub details: String,
    pub source: LeadSource,
    pub timestamp: DateTime<Utc>,
    pub identity_key: IdentityKey,
}
