//! Ingestion orchestration: keyword × location matrix, screening, reconciliation, scheduling.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use jobtrack_adapters::{screen_result, JobSearchSource, QualityRules, SerpApiClient};
use jobtrack_core::UpsertOutcome;
use jobtrack_storage::{reconcile, utc_today, PostingStore};
use serde::Serialize;
use thiserror::Error;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobtrack-sync";

pub const DEFAULT_KEYWORDS: &str =
    "devops,sre,site reliability,platform engineer,cloud engineer,kubernetes,terraform,ci/cd";
pub const DEFAULT_LOCATION: &str = "United States";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required; put it in .env as {0}=...")]
    MissingEnvVar(String),
    #[error("invalid value for {var}: {reason}")]
    InvalidEnvVar { var: String, reason: String },
}

/// Settings for the ingestion pipeline. Building one fails without a search API key.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub api_key: String,
    pub serpapi_base_url: String,
    pub keywords: Vec<String>,
    pub locations: Vec<String>,
    pub query_failure_delay: Duration,
    pub http_timeout: Duration,
    pub quality_rules_path: Option<PathBuf>,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl IngestConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parse_u64 = |key: &str, default: u64| -> Result<u64, ConfigError> {
            match non_empty(key) {
                Some(raw) => raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                    ConfigError::InvalidEnvVar {
                        var: key.to_string(),
                        reason: e.to_string(),
                    }
                }),
                None => Ok(default),
            }
        };

        let api_key =
            non_empty("SERPAPI_KEY").ok_or_else(|| ConfigError::MissingEnvVar("SERPAPI_KEY".into()))?;
        let keywords = split_list(&lookup("KEYWORDS").unwrap_or_else(|| DEFAULT_KEYWORDS.to_string()));
        let locations = split_list(
            &non_empty("LOCATIONS")
                .or_else(|| lookup("LOCATION"))
                .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
        );

        Ok(Self {
            api_key,
            serpapi_base_url: non_empty("SERPAPI_BASE_URL")
                .unwrap_or_else(|| "https://serpapi.com".to_string()),
            keywords,
            locations,
            query_failure_delay: Duration::from_millis(parse_u64(
                "JOBTRACK_QUERY_FAILURE_DELAY_MS",
                1000,
            )?),
            http_timeout: Duration::from_secs(parse_u64("JOBTRACK_HTTP_TIMEOUT_SECS", 30)?),
            quality_rules_path: non_empty("JOBTRACK_QUALITY_RULES").map(PathBuf::from),
            sync_cron_1: non_empty("SYNC_CRON_1").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            sync_cron_2: non_empty("SYNC_CRON_2").unwrap_or_else(|| "0 0 18 * * *".to_string()),
        })
    }

    pub fn plan(&self) -> QueryPlan {
        QueryPlan {
            keywords: self.keywords.clone(),
            locations: self.locations.clone(),
        }
    }
}

/// Comma-separated configuration value into trimmed, non-empty entries.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryPlan {
    pub keywords: Vec<String>,
    pub locations: Vec<String>,
}

impl QueryPlan {
    /// Every (location, keyword) pair, location-major.
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.locations.iter().flat_map(move |location| {
            self.keywords
                .iter()
                .map(move |keyword| (location.as_str(), keyword.as_str()))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PairSummary {
    pub keyword: String,
    pub location: String,
    pub raw_results: usize,
    /// Results that passed normalization, quality and source checks.
    pub processed: usize,
    pub upserted_or_matched: usize,
    pub inserted: usize,
    pub failed_upserts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryFailure {
    pub keyword: String,
    pub location: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pairs: Vec<PairSummary>,
    pub failed_queries: Vec<QueryFailure>,
}

impl RunSummary {
    pub fn total_processed(&self) -> usize {
        self.pairs.iter().map(|p| p.processed).sum()
    }

    pub fn total_upserted_or_matched(&self) -> usize {
        self.pairs.iter().map(|p| p.upserted_or_matched).sum()
    }

    pub fn total_inserted(&self) -> usize {
        self.pairs.iter().map(|p| p.inserted).sum()
    }

    pub fn total_failed_upserts(&self) -> usize {
        self.pairs.iter().map(|p| p.failed_upserts).sum()
    }
}

pub struct IngestPipeline {
    search: Arc<dyn JobSearchSource>,
    store: Arc<dyn PostingStore>,
    plan: QueryPlan,
    rules: QualityRules,
    failure_delay: Duration,
    today: fn() -> NaiveDate,
}

impl IngestPipeline {
    pub fn new(search: Arc<dyn JobSearchSource>, store: Arc<dyn PostingStore>, plan: QueryPlan) -> Self {
        Self {
            search,
            store,
            plan,
            rules: QualityRules::default(),
            failure_delay: Duration::from_secs(1),
            today: utc_today,
        }
    }

    /// SerpAPI-backed pipeline with rules and delays taken from `config`.
    pub fn from_config(config: &IngestConfig, store: Arc<dyn PostingStore>) -> Result<Self> {
        let search = SerpApiClient::with_base_url(
            &config.api_key,
            config.http_timeout,
            &config.serpapi_base_url,
        )
        .context("building search client")?;
        let rules = match &config.quality_rules_path {
            Some(path) => QualityRules::from_yaml_path(path)?,
            None => QualityRules::default(),
        };
        Ok(Self::new(Arc::new(search), store, config.plan())
            .with_rules(rules)
            .with_failure_delay(config.query_failure_delay))
    }

    pub fn with_rules(mut self, rules: QualityRules) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_failure_delay(mut self, delay: Duration) -> Self {
        self.failure_delay = delay;
        self
    }

    pub fn with_clock(mut self, today: fn() -> NaiveDate) -> Self {
        self.today = today;
        self
    }

    /// One pass over the whole matrix. Query and upsert failures are absorbed into the summary.
    pub async fn run_once(&self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("ingest_run", %run_id, source = self.search.source_id());
        self.run_matrix(run_id).instrument(span).await
    }

    async fn run_matrix(&self, run_id: Uuid) -> RunSummary {
        let started_at = Utc::now();
        let mut pairs = Vec::new();
        let mut failed_queries = Vec::new();

        for (location, keyword) in self.plan.pairs() {
            let results = match self.search.search(keyword, location).await {
                Ok(results) => results,
                Err(err) => {
                    warn!(keyword, location, error = %err, "search failed; skipping pair");
                    failed_queries.push(QueryFailure {
                        keyword: keyword.to_string(),
                        location: location.to_string(),
                        error: err.to_string(),
                    });
                    tokio::time::sleep(self.failure_delay).await;
                    continue;
                }
            };

            let mut pair = PairSummary {
                keyword: keyword.to_string(),
                location: location.to_string(),
                raw_results: results.len(),
                ..Default::default()
            };

            for raw in &results {
                let candidate = match screen_result(raw, location, &self.rules) {
                    Ok(candidate) => candidate,
                    Err(rejection) => {
                        debug!(?rejection, "skipped result");
                        continue;
                    }
                };
                pair.processed += 1;

                let link = candidate.link.clone();
                match reconcile(self.store.as_ref(), candidate, (self.today)()).await {
                    Ok(outcome) => {
                        pair.upserted_or_matched += 1;
                        if outcome == UpsertOutcome::Inserted {
                            pair.inserted += 1;
                        }
                    }
                    Err(err) => {
                        pair.failed_upserts += 1;
                        warn!(%link, error = %err, "upsert failed");
                    }
                }
            }

            info!(
                keyword,
                location,
                raw = pair.raw_results,
                processed = pair.processed,
                upserted_or_matched = pair.upserted_or_matched,
                inserted = pair.inserted,
                "pair complete"
            );
            pairs.push(pair);
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            pairs,
            failed_queries,
        };
        info!(
            processed = summary.total_processed(),
            upserted_or_matched = summary.total_upserted_or_matched(),
            inserted = summary.total_inserted(),
            failed_queries = summary.failed_queries.len(),
            "ingest run complete"
        );
        summary
    }
}

/// Scheduler that runs `pipeline` on each cron expression. The caller starts and owns it.
pub async fn build_scheduler(pipeline: Arc<IngestPipeline>, crons: &[String]) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for cron in crons {
        let pipeline = Arc::clone(&pipeline);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                let summary = pipeline.run_once().await;
                info!(
                    run_id = %summary.run_id,
                    upserted_or_matched = summary.total_upserted_or_matched(),
                    "scheduled ingest finished"
                );
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use async_trait::async_trait;
    use jobtrack_adapters::{ApplyOption, RawJobResult, SearchError};
    use jobtrack_core::{Posting, PostingQuery, PostingUpsert, DESCRIPTION_MAX_CHARS};
    use jobtrack_storage::{MemoryPostingStore, SourceCount, StoreError};

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    fn day_one() -> NaiveDate {
        day(1)
    }

    fn day_two() -> NaiveDate {
        day(2)
    }

    #[derive(Default)]
    struct FakeSearch {
        responses: HashMap<(String, String), Vec<RawJobResult>>,
        failing: Vec<(String, String)>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl FakeSearch {
        fn respond(mut self, keyword: &str, location: &str, results: Vec<RawJobResult>) -> Self {
            self.responses
                .insert((keyword.to_string(), location.to_string()), results);
            self
        }

        fn fail(mut self, keyword: &str, location: &str) -> Self {
            self.failing.push((keyword.to_string(), location.to_string()));
            self
        }
    }

    #[async_trait]
    impl JobSearchSource for FakeSearch {
        fn source_id(&self) -> &'static str {
            "fake"
        }

        async fn search(&self, keyword: &str, location: &str) -> Result<Vec<RawJobResult>, SearchError> {
            let key = (keyword.to_string(), location.to_string());
            self.calls.lock().unwrap().push(key.clone());
            if self.failing.contains(&key) {
                return Err(SearchError::Api("rate limited".into()));
            }
            Ok(self.responses.get(&key).cloned().unwrap_or_default())
        }
    }

    /// Fails every upsert whose link contains `poison`; delegates everything else.
    struct FlakyStore {
        inner: MemoryPostingStore,
        poison: &'static str,
    }

    #[async_trait]
    impl PostingStore for FlakyStore {
        async fn upsert_by_link(&self, upsert: PostingUpsert) -> Result<UpsertOutcome, StoreError> {
            if upsert.link.contains(self.poison) {
                return Err(StoreError::DuplicateLink(upsert.link));
            }
            self.inner.upsert_by_link(upsert).await
        }
        async fn get_by_link(&self, link: &str) -> Result<Option<Posting>, StoreError> {
            self.inner.get_by_link(link).await
        }
        async fn list(&self, query: &PostingQuery) -> Result<Vec<Posting>, StoreError> {
            self.inner.list(query).await
        }
        async fn sources(&self) -> Result<Vec<String>, StoreError> {
            self.inner.sources().await
        }
        async fn counts_by_source(&self) -> Result<Vec<SourceCount>, StoreError> {
            self.inner.counts_by_source().await
        }
        async fn set_applied(&self, id: Uuid, applied: bool) -> Result<(), StoreError> {
            self.inner.set_applied(id, applied).await
        }
        async fn set_status(&self, id: Uuid, status: &str) -> Result<(), StoreError> {
            self.inner.set_status(id, status).await
        }
        async fn insert_manual(&self, posting: Posting) -> Result<Posting, StoreError> {
            self.inner.insert_manual(posting).await
        }
        async fn delete_manual(&self, id: Uuid) -> Result<(), StoreError> {
            self.inner.delete_manual(id).await
        }
    }

    fn job(title: &str, company: &str, link: &str, description: &str) -> RawJobResult {
        RawJobResult {
            title: Some(title.to_string()),
            company_name: Some(company.to_string()),
            via: Some("LinkedIn".to_string()),
            description: Some(description.to_string()),
            apply_options: vec![ApplyOption {
                title: Some("LinkedIn".to_string()),
                link: Some(link.to_string()),
            }],
            ..Default::default()
        }
    }

    fn plan(keywords: &[&str], locations: &[&str]) -> QueryPlan {
        QueryPlan {
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            locations: locations.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn pipeline(search: FakeSearch, store: Arc<dyn PostingStore>, plan: QueryPlan) -> IngestPipeline {
        IngestPipeline::new(Arc::new(search), store, plan)
            .with_failure_delay(Duration::ZERO)
            .with_clock(day_one)
    }

    #[tokio::test]
    async fn duplicate_links_in_one_query_collapse_to_one_posting() {
        let link = "https://www.linkedin.com/jobs/view/100";
        let search = FakeSearch::default().respond(
            "sre",
            "Remote",
            vec![
                job("SRE", "Acme Corp", link, "first description"),
                job("SRE", "Acme Corp", link, "second description"),
            ],
        );
        let store = Arc::new(MemoryPostingStore::new());
        let summary = pipeline(search, store.clone(), plan(&["sre"], &["Remote"]))
            .run_once()
            .await;

        assert_eq!(store.len().await, 1);
        let posting = store.get_by_link(link).await.unwrap().unwrap();
        assert_eq!(posting.description, "first description");
        assert_eq!(posting.last_seen, day(1));
        assert_eq!(summary.pairs[0].processed, 2);
        assert_eq!(summary.pairs[0].upserted_or_matched, 2);
        assert_eq!(summary.pairs[0].inserted, 1);
    }

    #[tokio::test]
    async fn failed_query_is_excluded_and_run_continues() {
        let search = FakeSearch::default()
            .fail("kubernetes", "Germany")
            .respond(
                "sre",
                "Germany",
                vec![job("SRE", "Acme Corp", "https://www.linkedin.com/jobs/view/1", "d")],
            )
            .respond(
                "kubernetes",
                "Remote",
                vec![job("K8s Engineer", "Globex", "https://www.linkedin.com/jobs/view/2", "d")],
            );
        let store = Arc::new(MemoryPostingStore::new());
        let summary = pipeline(
            search,
            store.clone(),
            plan(&["sre", "kubernetes"], &["Germany", "Remote"]),
        )
        .run_once()
        .await;

        assert_eq!(summary.pairs.len(), 3);
        assert!(summary
            .pairs
            .iter()
            .all(|p| !(p.keyword == "kubernetes" && p.location == "Germany")));
        assert_eq!(
            summary.failed_queries,
            vec![QueryFailure {
                keyword: "kubernetes".into(),
                location: "Germany".into(),
                error: "search provider error: rate limited".into(),
            }]
        );
        assert_eq!(summary.total_upserted_or_matched(), 2);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn queries_run_location_major() {
        let search = Arc::new(FakeSearch::default());
        let store: Arc<dyn PostingStore> = Arc::new(MemoryPostingStore::new());
        IngestPipeline::new(search.clone(), store, plan(&["sre", "devops"], &["Remote", "Germany"]))
            .with_failure_delay(Duration::ZERO)
            .run_once()
            .await;

        let calls = search.calls.lock().unwrap().clone();
        let expected: Vec<(String, String)> = [
            ("sre", "Remote"),
            ("devops", "Remote"),
            ("sre", "Germany"),
            ("devops", "Germany"),
        ]
        .iter()
        .map(|(k, l)| (k.to_string(), l.to_string()))
        .collect();
        assert_eq!(calls, expected);
    }

    #[tokio::test]
    async fn rerun_is_idempotent_apart_from_last_seen() {
        let results = vec![
            job("SRE", "Acme Corp", "https://www.linkedin.com/jobs/view/1", "a"),
            job("Platform Engineer", "Initech", "https://www.linkedin.com/jobs/view/2", "b"),
            job("Recruiter bait", "Staffing Agency", "https://www.linkedin.com/jobs/view/3", "c"),
        ];
        let store = Arc::new(MemoryPostingStore::new());

        pipeline(
            FakeSearch::default().respond("sre", "Remote", results.clone()),
            store.clone(),
            plan(&["sre"], &["Remote"]),
        )
        .run_once()
        .await;
        let before = store.all().await;

        let second = pipeline(
            FakeSearch::default().respond("sre", "Remote", results),
            store.clone(),
            plan(&["sre"], &["Remote"]),
        )
        .with_clock(day_two)
        .run_once()
        .await;
        let after = store.all().await;

        assert_eq!(before.len(), 2);
        assert_eq!(second.total_inserted(), 0);
        assert_eq!(second.total_upserted_or_matched(), 2);
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(a.last_seen, day(2));
            assert_eq!(Posting { last_seen: b.last_seen, ..a.clone() }, *b);
        }
    }

    #[tokio::test]
    async fn rerun_keeps_applied_flag() {
        let link = "https://www.linkedin.com/jobs/view/55";
        let store = Arc::new(MemoryPostingStore::new());
        let run = || {
            pipeline(
                FakeSearch::default().respond("sre", "Remote", vec![job("SRE", "Acme Corp", link, "d")]),
                store.clone(),
                plan(&["sre"], &["Remote"]),
            )
        };

        run().run_once().await;
        let id = store.get_by_link(link).await.unwrap().unwrap().id;
        store.set_applied(id, true).await.unwrap();
        run().run_once().await;

        assert!(store.get_by_link(link).await.unwrap().unwrap().applied);
    }

    #[tokio::test]
    async fn upsert_failure_is_counted_and_other_items_continue() {
        let store = Arc::new(FlakyStore {
            inner: MemoryPostingStore::new(),
            poison: "/view/13",
        });
        let search = FakeSearch::default().respond(
            "sre",
            "Remote",
            vec![
                job("SRE", "Acme Corp", "https://www.linkedin.com/jobs/view/13", "d"),
                job("SRE", "Initech", "https://www.linkedin.com/jobs/view/14", "d"),
            ],
        );
        let summary = pipeline(search, store.clone(), plan(&["sre"], &["Remote"]))
            .run_once()
            .await;

        assert_eq!(summary.pairs[0].processed, 2);
        assert_eq!(summary.pairs[0].upserted_or_matched, 1);
        assert_eq!(summary.total_failed_upserts(), 1);
        assert_eq!(store.inner.len().await, 1);
    }

    #[tokio::test]
    async fn long_descriptions_are_truncated_on_insert() {
        let link = "https://www.linkedin.com/jobs/view/9";
        let store = Arc::new(MemoryPostingStore::new());
        pipeline(
            FakeSearch::default().respond(
                "sre",
                "Remote",
                vec![job("SRE", "Acme Corp", link, &"word ".repeat(400))],
            ),
            store.clone(),
            plan(&["sre"], &["Remote"]),
        )
        .run_once()
        .await;

        let posting = store.get_by_link(link).await.unwrap().unwrap();
        assert!(posting.description.chars().count() <= DESCRIPTION_MAX_CHARS);
        assert_eq!(posting.description.chars().count(), 1500);
    }

    #[test]
    fn config_requires_api_key() {
        let err = IngestConfig::from_lookup(|_| None).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref v) if v == "SERPAPI_KEY"));

        let err = IngestConfig::from_lookup(|key| (key == "SERPAPI_KEY").then(|| "  ".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    }

    #[test]
    fn config_parses_lists_and_falls_back_to_single_location() {
        let config = IngestConfig::from_lookup(|key| match key {
            "SERPAPI_KEY" => Some("k".into()),
            "KEYWORDS" => Some(" sre , ,kubernetes,".into()),
            "LOCATIONS" => Some("".into()),
            "LOCATION" => Some("Germany".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.keywords, vec!["sre", "kubernetes"]);
        assert_eq!(config.locations, vec!["Germany"]);
        assert_eq!(config.query_failure_delay, Duration::from_secs(1));

        let defaults = IngestConfig::from_lookup(|key| (key == "SERPAPI_KEY").then(|| "k".into())).unwrap();
        assert_eq!(defaults.locations, vec![DEFAULT_LOCATION]);
        assert_eq!(defaults.keywords.len(), 8);
        assert!(defaults.quality_rules_path.is_none());
    }

    #[test]
    fn config_rejects_non_numeric_delay() {
        let err = IngestConfig::from_lookup(|key| match key {
            "SERPAPI_KEY" => Some("k".into()),
            "JOBTRACK_QUERY_FAILURE_DELAY_MS" => Some("soon".into()),
            _ => None,
        })
        .unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidEnvVar { ref var, .. } if var == "JOBTRACK_QUERY_FAILURE_DELAY_MS")
        );
    }

    #[tokio::test]
    async fn scheduler_accepts_configured_crons() {
        let config = IngestConfig::from_lookup(|key| (key == "SERPAPI_KEY").then(|| "k".into())).unwrap();
        let store: Arc<dyn PostingStore> = Arc::new(MemoryPostingStore::new());
        let pipeline = Arc::new(IngestPipeline::new(Arc::new(FakeSearch::default()), store, config.plan()));
        let sched = build_scheduler(pipeline, &[config.sync_cron_1, config.sync_cron_2]).await;
        assert!(sched.is_ok());
    }
}
