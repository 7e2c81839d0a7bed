//! Shared data types passed between the acquisition stages.

use std::fmt;

use crate::slug::ascii_slug;

/// One (country, fruit) pairing read from the fact store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub fact_id: i64,
    pub country_id: i64,
    pub country_slug: String,
    pub country_name: String,
    pub fruit_name: String,
}

impl Subject {
    /// Output file name without extension, e.g. `cote-divoire-cocoa-pod`.
    pub fn file_stem(&self) -> String {
        let parts: Vec<String> = [ascii_slug(&self.country_slug), ascii_slug(&self.fruit_name)]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect();
        if parts.is_empty() {
            return format!("fact-{}", self.fact_id);
        }
        parts.join("-")
    }
}

/// Final outcome of one subject, rendered as a manifest tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionStatus {
    Ok,
    NotFound,
    /// Any other machine-readable failure tag (`too_small`, `http_error:Dns`, ...).
    Failed(String),
}

impl AcquisitionStatus {
    pub fn as_tag(&self) -> &str {
        match self {
            Self::Ok => "ok",
            Self::NotFound => "not_found",
            Self::Failed(tag) => tag,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for AcquisitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Ledger entry for one processed subject. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionResult {
    pub subject: Subject,
    pub image_url: String,
    pub status: AcquisitionStatus,
    /// Content type of the saved image, or the degraded-save tag.
    pub detail: String,
    pub tried_titles: Vec<String>,
    /// Relative path written to the fact store, empty when nothing was saved.
    pub saved_as: String,
}

pub const DEGRADED_DETAIL_PREFIX: &str = "saved_raw_due_to:";

impl AcquisitionResult {
    pub fn tried_titles_joined(&self) -> String {
        self.tried_titles.join(" | ")
    }

    /// Saved without normalization because decoding or re-encoding failed.
    pub fn is_degraded(&self) -> bool {
        self.detail.starts_with(DEGRADED_DETAIL_PREFIX)
    }
}
