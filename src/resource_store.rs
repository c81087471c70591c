use anyhow::{Context as _, anyhow, bail};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use http::header::{AUTHORIZATION, CONTENT_RANGE};
use tracing::{debug, instrument};
use url::Url;

use crate::session::Session;

/// Column holding the owning subject in every counted table.
const OWNER_COLUMN: &str = "user_id";

/// Logical collections whose rows count toward monthly usage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Collection {
    /// Surveys created by the subject.
    Surveys,
    /// Testimonials collected through the subject's surveys.
    Testimonials,
}

impl Collection {
    fn table(self) -> &'static str {
        match self {
            Collection::Surveys => "surveys",
            Collection::Testimonials => "testimonials",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.table())
    }
}

/// Count-only access to the relational store.
#[async_trait]
pub(crate) trait ResourceStore: Send + Sync {
    /// Rows in `collection` owned by `subject_id` created at or after `since`.
    async fn count(
        &self,
        collection: Collection,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<u64>;
}

/// PostgREST-style REST endpoint answering exact counts via `Content-Range`.
#[derive(Clone, Debug)]
pub(crate) struct RestResourceStore {
    client: reqwest::Client,
    rest_url: Url,
    api_key: Option<String>,
    session: Session,
}

impl RestResourceStore {
    pub(crate) fn new(
        backend_url: &Url,
        api_key: Option<String>,
        session: Session,
    ) -> anyhow::Result<Self> {
        let rest_url = backend_url
            .join("rest/v1/")
            .map_err(|err| anyhow!("Invalid backend URL {backend_url}: {err}"))?;

        Ok(Self {
            client: reqwest::Client::new(),
            rest_url,
            api_key,
            session,
        })
    }

    fn count_url(
        &self,
        collection: Collection,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<Url> {
        let mut url = self
            .rest_url
            .join(collection.table())
            .with_context(|| format!("Invalid collection {collection}"))?;

        url.query_pairs_mut()
            .append_pair("select", "id")
            .append_pair(OWNER_COLUMN, &format!("eq.{subject_id}"))
            .append_pair(
                "created_at",
                &format!("gte.{}", since.to_rfc3339_opts(SecondsFormat::Secs, true)),
            );

        Ok(url)
    }
}

/// Total from a `Content-Range` value such as `0-9/42` or `*/0`.
fn parse_content_range_total(value: &str) -> anyhow::Result<u64> {
    let Some((_, total)) = value.rsplit_once('/') else {
        bail!("Malformed Content-Range header {value:?}");
    };

    total
        .parse()
        .with_context(|| format!("Content-Range header {value:?} carries no exact count"))
}

#[async_trait]
impl ResourceStore for RestResourceStore {
    #[instrument(skip(self, since))]
    async fn count(
        &self,
        collection: Collection,
        subject_id: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<u64> {
        let url = self.count_url(collection, subject_id, since)?;

        let mut request = self
            .client
            .head(url.clone())
            .header(AUTHORIZATION, self.session.authorization())
            .header("Prefer", "count=exact");

        if let Some(api_key) = &self.api_key {
            request = request.header("apikey", api_key);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to count rows at {url}"))?
            .error_for_status()
            .with_context(|| format!("Failed to count rows at {url}"))?;

        let content_range = response
            .headers()
            .get(CONTENT_RANGE)
            .with_context(|| format!("Count response from {url} has no Content-Range header"))?
            .to_str()
            .with_context(|| format!("Count response from {url} has a non-text Content-Range"))?;

        let count = parse_content_range_total(content_range)?;
        debug!(count, "Counted rows");
        Ok(count)
    }
}
