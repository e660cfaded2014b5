//! External job-search adapters plus the record screening stages (normalize, quality, source).

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use jobtrack_core::{
    collapse_whitespace, platform_by_id, platform_for_host, PostingCandidate, LOCATION_PLACEHOLDER,
    PLATFORMS, UNKNOWN_SOURCE,
};
use reqwest::{Client, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "jobtrack-adapters";

const SERPAPI_BASE_URL: &str = "https://serpapi.com";
const SERPAPI_NO_RESULTS: &str = "hasn't returned any results";

/// Raw `jobs_results` entry as returned by the search provider. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RawJobResult {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub via: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub apply_options: Vec<ApplyOption>,
    #[serde(default)]
    pub job_link: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

/// Treats an explicit JSON `null` list like a missing one.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ApplyOption {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("search provider error: {0}")]
    Api(String),
    #[error("http status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("could not decode response for {context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid base url '{0}'")]
    BaseUrl(String),
}

/// A provider that answers one (keyword, location) query with raw result records.
#[async_trait]
pub trait JobSearchSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn search(&self, keyword: &str, location: &str) -> Result<Vec<RawJobResult>, SearchError>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default, deserialize_with = "null_as_empty")]
    jobs_results: Vec<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

/// SerpAPI `google_jobs` client.
#[derive(Debug, Clone)]
pub struct SerpApiClient {
    client: Client,
    api_key: String,
    base_url: Url,
}

impl SerpApiClient {
    pub fn new(api_key: &str, timeout: Duration) -> Result<Self, SearchError> {
        Self::with_base_url(api_key, timeout, SERPAPI_BASE_URL)
    }

    /// Client against a custom base URL, e.g. a mock server.
    pub fn with_base_url(api_key: &str, timeout: Duration, base_url: &str) -> Result<Self, SearchError> {
        let client = Client::builder()
            .gzip(true)
            .timeout(timeout)
            .user_agent(concat!("jobtrack/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let normalised = format!("{}/", base_url.trim_end_matches('/'));
        let base_url = Url::parse(&normalised).map_err(|_| SearchError::BaseUrl(base_url.to_string()))?;
        Ok(Self {
            client,
            api_key: api_key.to_owned(),
            base_url,
        })
    }

    fn search_url(&self, keyword: &str, location: &str) -> Result<Url, SearchError> {
        let mut url = self
            .base_url
            .join("search.json")
            .map_err(|_| SearchError::BaseUrl(self.base_url.to_string()))?;
        url.query_pairs_mut()
            .append_pair("engine", "google_jobs")
            .append_pair("q", keyword)
            .append_pair("location", location)
            .append_pair("hl", "en")
            .append_pair("api_key", &self.api_key)
            .append_pair("num", "100");
        Ok(url)
    }
}

#[async_trait]
impl JobSearchSource for SerpApiClient {
    fn source_id(&self) -> &'static str {
        "serpapi-google-jobs"
    }

    async fn search(&self, keyword: &str, location: &str) -> Result<Vec<RawJobResult>, SearchError> {
        let url = self.search_url(keyword, location)?;
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        if !status.is_success() {
            let message = serde_json::from_str::<SearchResponse>(&text)
                .ok()
                .and_then(|r| r.error)
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
            return Err(SearchError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: SearchResponse =
            serde_json::from_str(&text).map_err(|source| SearchError::Decode {
                context: format!("google_jobs(q={keyword}, location={location})"),
                source,
            })?;

        match parsed.error {
            Some(message) if message.contains(SERPAPI_NO_RESULTS) => Ok(Vec::new()),
            Some(message) => Err(SearchError::Api(message)),
            None => Ok(decode_records(parsed.jobs_results)),
        }
    }
}

/// Decodes each record on its own; a record of the wrong shape is dropped, not the whole page.
fn decode_records(values: Vec<serde_json::Value>) -> Vec<RawJobResult> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<RawJobResult>(value) {
            Ok(raw) => Some(raw),
            Err(err) => {
                debug!(error = %err, "skipping undecodable result");
                None
            }
        })
        .collect()
}

/// A raw result after whitespace cleanup and link selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRecord {
    pub title: String,
    pub company: String,
    pub via: String,
    pub link: String,
    pub location: String,
    pub description: String,
}

fn clean(value: Option<&str>) -> String {
    collapse_whitespace(value.unwrap_or_default())
}

fn usable_link(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// Apply link, then listing link, then the generic link.
pub fn canonical_link(raw: &RawJobResult) -> Option<String> {
    usable_link(raw.apply_options.first().and_then(|o| o.link.as_deref()))
        .or_else(|| usable_link(raw.job_link.as_deref()))
        .or_else(|| usable_link(raw.link.as_deref()))
}

/// Returns `None` when the record has no title or no usable link.
pub fn normalize_record(raw: &RawJobResult, query_location: &str) -> Option<NormalizedRecord> {
    let title = clean(raw.title.as_deref());
    if title.is_empty() {
        return None;
    }
    let link = canonical_link(raw)?;

    let location = [clean(raw.location.as_deref()), collapse_whitespace(query_location)]
        .into_iter()
        .find(|l| !l.is_empty())
        .unwrap_or_else(|| LOCATION_PLACEHOLDER.to_string());

    Some(NormalizedRecord {
        title,
        company: clean(raw.company_name.as_deref()),
        via: clean(raw.via.as_deref()),
        link,
        location,
        description: clean(raw.description.as_deref()),
    })
}

pub const COMPANY_DENYLIST: &[&str] = &[
    "confidential",
    "hiring multiple",
    "urgent",
    "apply now",
    "recruiter",
    "staffing",
    "agency",
    "job opening",
];

pub const COMPANY_MIN_CHARS: usize = 2;
pub const COMPANY_MAX_CHARS: usize = 80;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Company-name heuristic. Substrings and names are compared lower-cased.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QualityRules {
    pub denylist: Vec<String>,
    pub blocked_names: Vec<String>,
    pub min_chars: usize,
    pub max_chars: usize,
}

impl Default for QualityRules {
    fn default() -> Self {
        Self {
            denylist: COMPANY_DENYLIST.iter().map(|s| s.to_string()).collect(),
            blocked_names: PLATFORMS
                .iter()
                .map(|p| p.id.to_string())
                .chain(std::iter::once("unknown".to_string()))
                .collect(),
            min_chars: COMPANY_MIN_CHARS,
            max_chars: COMPANY_MAX_CHARS,
        }
    }
}

impl QualityRules {
    /// Load rules from YAML; keys left out keep their built-in values.
    pub fn from_yaml_path(path: &Path) -> Result<Self, RulesError> {
        let text = std::fs::read_to_string(path).map_err(|source| RulesError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut rules: Self = serde_yaml::from_str(&text).map_err(|source| RulesError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        for entry in rules.denylist.iter_mut().chain(rules.blocked_names.iter_mut()) {
            *entry = entry.to_lowercase();
        }
        Ok(rules)
    }

    pub fn accepts_company(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        let lower = name.to_lowercase();
        if self.denylist.iter().any(|bad| lower.contains(bad.as_str())) {
            return false;
        }
        if self.blocked_names.iter().any(|blocked| *blocked == lower) {
            return false;
        }
        let len = name.chars().count();
        (self.min_chars..=self.max_chars).contains(&len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceVerdict {
    pub accepted: bool,
    /// Display name when accepted; informational only when rejected.
    pub name: String,
}

/// Attribute a posting to an allowed platform by its `via` text or its link host.
pub fn resolve_source(link: &str, via: Option<&str>) -> SourceVerdict {
    let via_norm = via.unwrap_or_default().trim().to_lowercase();
    if let Some(platform) = platform_by_id(&via_norm) {
        return SourceVerdict {
            accepted: true,
            name: platform.display_name.to_string(),
        };
    }

    let host = Url::parse(link)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_default();
    if let Some(platform) = platform_for_host(&host) {
        return SourceVerdict {
            accepted: true,
            name: platform.display_name.to_string(),
        };
    }

    SourceVerdict {
        accepted: false,
        name: via
            .filter(|v| !v.is_empty())
            .unwrap_or(UNKNOWN_SOURCE)
            .to_string(),
    }
}

/// Why a raw result was skipped. Skips are filtering decisions, not failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    Incomplete,
    Company(String),
    OffPlatform(String),
}

/// Normalize, quality-check and attribute one raw result.
pub fn screen_result(
    raw: &RawJobResult,
    query_location: &str,
    rules: &QualityRules,
) -> Result<PostingCandidate, Rejection> {
    let record = normalize_record(raw, query_location).ok_or(Rejection::Incomplete)?;
    if !rules.accepts_company(&record.company) {
        return Err(Rejection::Company(record.company));
    }
    let verdict = resolve_source(&record.link, Some(&record.via));
    if !verdict.accepted {
        debug!(link = %record.link, via = %verdict.name, "off-platform result");
        return Err(Rejection::OffPlatform(verdict.name));
    }
    Ok(PostingCandidate {
        link: record.link,
        title: record.title,
        company: record.company,
        location: record.location,
        description: record.description,
        source: verdict.name,
    })
}
