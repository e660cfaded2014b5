//! Core domain model for jobtrack postings and the ingestion handoff types.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobtrack-core";

/// Upper bound on persisted description length, counted in characters.
pub const DESCRIPTION_MAX_CHARS: usize = 1500;

/// Stored location when neither the result nor the query carried one.
pub const LOCATION_PLACEHOLDER: &str = "—";

/// Source marker for postings created through the annotation API.
pub const MANUAL_SOURCE: &str = "Manual";

pub const UNKNOWN_SOURCE: &str = "Unknown";

/// A job board the pipeline trusts as a posting source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    /// Lower-case attribution identifier, e.g. `linkedin`.
    pub id: &'static str,
    /// Registrable domain matched against the link host suffix.
    pub domain: &'static str,
    pub display_name: &'static str,
}

pub const PLATFORMS: &[Platform] = &[
    Platform {
        id: "linkedin",
        domain: "linkedin.com",
        display_name: "Linkedin",
    },
    Platform {
        id: "indeed",
        domain: "indeed.com",
        display_name: "Indeed",
    },
    Platform {
        id: "glassdoor",
        domain: "glassdoor.com",
        display_name: "Glassdoor",
    },
];

pub fn platform_by_id(id: &str) -> Option<&'static Platform> {
    PLATFORMS.iter().find(|p| p.id == id)
}

pub fn platform_for_host(host: &str) -> Option<&'static Platform> {
    PLATFORMS.iter().find(|p| host.ends_with(p.domain))
}

/// Persisted posting. `link` is the identity; `id` is the handle used by annotation callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub id: Uuid,
    pub link: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub source: String,
    pub first_seen: NaiveDate,
    pub last_seen: NaiveDate,
    pub applied: bool,
    pub status: Option<String>,
}

impl Posting {
    pub fn is_manual(&self) -> bool {
        self.source == MANUAL_SOURCE
    }
}

/// Normalized, filtered and source-resolved result ready for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingCandidate {
    pub link: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub source: String,
}

/// Fields written only when the link is first seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertOnlyFields {
    pub title: String,
    pub company: String,
    pub location: String,
    pub description: String,
    pub source: String,
    pub first_seen: NaiveDate,
    pub applied: bool,
}

/// Fields written on every reconciliation of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshFields {
    pub last_seen: NaiveDate,
}

/// One conditional upsert: `on_insert` when the link is absent, `refresh` always.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostingUpsert {
    pub link: String,
    pub on_insert: InsertOnlyFields,
    pub refresh: RefreshFields,
}

impl PostingUpsert {
    pub fn from_candidate(candidate: PostingCandidate, today: NaiveDate) -> Self {
        Self {
            link: candidate.link,
            on_insert: InsertOnlyFields {
                title: candidate.title,
                company: candidate.company,
                location: candidate.location,
                description: truncate_chars(&candidate.description, DESCRIPTION_MAX_CHARS),
                source: candidate.source,
                first_seen: today,
                applied: false,
            },
            refresh: RefreshFields { last_seen: today },
        }
    }

    /// The posting this upsert creates when the link is new.
    pub fn into_new_posting(self, id: Uuid) -> Posting {
        Posting {
            id,
            link: self.link,
            title: self.on_insert.title,
            company: self.on_insert.company,
            location: self.on_insert.location,
            description: self.on_insert.description,
            source: self.on_insert.source,
            first_seen: self.on_insert.first_seen,
            last_seen: self.refresh.last_seen,
            applied: self.on_insert.applied,
            status: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Matched,
}

/// Posting added by hand through the annotation API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NewManualPosting {
    pub link: String,
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub applied: Option<bool>,
}

impl NewManualPosting {
    pub fn into_posting(self, id: Uuid, today: NaiveDate) -> Posting {
        Posting {
            id,
            link: self.link.trim().to_string(),
            title: collapse_whitespace(&self.title),
            company: collapse_whitespace(&self.company),
            location: collapse_whitespace(&self.location),
            description: truncate_chars(&self.description, DESCRIPTION_MAX_CHARS),
            source: MANUAL_SOURCE.to_string(),
            first_seen: today,
            last_seen: today,
            applied: self.applied.unwrap_or(true),
            status: self.status.filter(|s| !s.trim().is_empty()),
        }
    }
}

/// Read-side filter. Empty strings are treated as "no filter".
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PostingQuery {
    #[serde(default)]
    pub q: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub applied: Option<bool>,
}

impl PostingQuery {
    pub fn text(&self) -> Option<&str> {
        non_blank(self.q.as_deref())
    }

    pub fn source(&self) -> Option<&str> {
        non_blank(self.source.as_deref())
    }

    pub fn status(&self) -> Option<&str> {
        non_blank(self.status.as_deref())
    }

    pub fn matches(&self, posting: &Posting) -> bool {
        if let Some(needle) = self.text() {
            let needle = needle.to_lowercase();
            let hit = [&posting.title, &posting.company, &posting.location]
                .iter()
                .any(|field| field.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        if let Some(source) = self.source() {
            if posting.source != source {
                return false;
            }
        }
        if let Some(status) = self.status() {
            if posting.status.as_deref() != Some(status) {
                return false;
            }
        }
        if let Some(applied) = self.applied {
            if posting.applied != applied {
                return false;
            }
        }
        true
    }
}

/// Orders by `last_seen` then `first_seen`, newest first.
pub fn sort_newest_first(postings: &mut [Posting]) {
    postings.sort_by(|a, b| {
        b.last_seen
            .cmp(&a.last_seen)
            .then_with(|| b.first_seen.cmp(&a.first_seen))
    });
}

pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => input[..byte_idx].to_string(),
        None => input.to_string(),
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
