use std::time::Duration;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use http::header::AUTHORIZATION;
use serde::{Deserialize, de::DeserializeOwned};
use tokio::time::timeout;
use tracing::{debug, instrument};
use url::Url;

use crate::session::Session;

const CHECK_SUBSCRIPTION_FUNCTION: &str = "check-subscription";
const CREATE_CHECKOUT_FUNCTION: &str = "create-checkout";
const CUSTOMER_PORTAL_FUNCTION: &str = "customer-portal";

/// Tier label as reported by the billing backend.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RemoteTier {
    Free,
    Pro,
}

/// Body returned by the subscription check function.
#[derive(Clone, Debug, Deserialize)]
pub(crate) struct SubscriptionStatus {
    pub(crate) subscribed: bool,
    pub(crate) subscription_tier: RemoteTier,
    #[serde(default)]
    pub(crate) subscription_end: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RedirectUrl {
    url: Url,
}

/// Authoritative answer about the caller's subscription.
#[async_trait]
pub(crate) trait EntitlementOracle: Send + Sync {
    async fn check_subscription(&self) -> anyhow::Result<SubscriptionStatus>;
}

/// Checkout and billing portal initiation. Both return a URL to open.
#[async_trait]
pub(crate) trait BillingFunctions: Send + Sync {
    async fn create_checkout(&self) -> anyhow::Result<Url>;

    async fn customer_portal(&self) -> anyhow::Result<Url>;
}

/// Calls named serverless functions on the backend with the session's bearer
/// credential.
#[derive(Clone, Debug)]
pub(crate) struct FunctionsClient {
    client: reqwest::Client,
    functions_url: Url,
    api_key: Option<String>,
    session: Session,
    request_timeout: Duration,
}

impl FunctionsClient {
    pub(crate) fn new(
        backend_url: &Url,
        api_key: Option<String>,
        session: Session,
        request_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let functions_url = backend_url
            .join("functions/v1/")
            .map_err(|err| anyhow!("Invalid backend URL {backend_url}: {err}"))?;

        Ok(Self {
            client: reqwest::Client::new(),
            functions_url,
            api_key,
            session,
            request_timeout,
        })
    }

    #[instrument(level = "error", skip(self))]
    async fn invoke<T: DeserializeOwned>(&self, function: &str) -> anyhow::Result<T> {
        let url = self
            .functions_url
            .join(function)
            .map_err(|err| anyhow!("Invalid function name {function}: {err}"))?;

        debug!(%url, "Invoking backend function");

        let mut request = self
            .client
            .post(url.clone())
            .header(AUTHORIZATION, self.session.authorization());

        if let Some(api_key) = &self.api_key {
            request = request.header("apikey", api_key);
        }

        let response = match timeout(self.request_timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                return Err(anyhow!(err).context(format!("Failed to invoke function at {url}")));
            }
            Err(_) => {
                bail!(
                    "Invoking function {url} timed out ({:?})",
                    self.request_timeout
                );
            }
        };

        let status = response.status();

        if !status.is_success() {
            match timeout(Duration::from_secs(5), response.text()).await {
                Ok(Ok(text)) => bail!("Function {url} failed: {status}: {text}"),
                Ok(Err(err)) => bail!(
                    "Function {url} failed: {status} <Error while receiving response body>: {err:#?}"
                ),
                Err(_) => bail!(
                    "Function {url} failed: {status} <Timed out while receiving response body>"
                ),
            }
        }

        match timeout(self.request_timeout, response.json::<T>()).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(err)) => {
                Err(anyhow!(err).context(format!("Failed to parse response from function {url}")))
            }
            Err(_) => bail!("Timed out while receiving response body from function {url}"),
        }
    }
}

#[async_trait]
impl EntitlementOracle for FunctionsClient {
    #[instrument(skip(self), fields(subject = self.session.subject_id()))]
    async fn check_subscription(&self) -> anyhow::Result<SubscriptionStatus> {
        self.invoke(CHECK_SUBSCRIPTION_FUNCTION).await
    }
}

#[async_trait]
impl BillingFunctions for FunctionsClient {
    #[instrument(skip(self), fields(subject = self.session.subject_id()))]
    async fn create_checkout(&self) -> anyhow::Result<Url> {
        let RedirectUrl { url } = self.invoke(CREATE_CHECKOUT_FUNCTION).await?;
        Ok(url)
    }

    #[instrument(skip(self), fields(subject = self.session.subject_id()))]
    async fn customer_portal(&self) -> anyhow::Result<Url> {
        let RedirectUrl { url } = self.invoke(CUSTOMER_PORTAL_FUNCTION).await?;
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_subscription_status() {
        let status: SubscriptionStatus = serde_json::from_str(
            r#"{"subscribed":true,"subscription_tier":"pro","subscription_end":"2024-05-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(status.subscribed);
        assert_eq!(status.subscription_tier, RemoteTier::Pro);
        assert_eq!(
            status.subscription_end.as_deref(),
            Some("2024-05-01T00:00:00Z")
        );

        let status: SubscriptionStatus =
            serde_json::from_str(r#"{"subscribed":false,"subscription_tier":"free"}"#).unwrap();
        assert_eq!(status.subscription_tier, RemoteTier::Free);
        assert!(status.subscription_end.is_none());
    }

    #[test]
    fn rejects_unknown_tier() {
        assert!(
            serde_json::from_str::<SubscriptionStatus>(
                r#"{"subscribed":true,"subscription_tier":"enterprise"}"#
            )
            .is_err()
        );
    }

    #[test]
    fn functions_url_is_nested_under_backend() {
        let session = Session::parse(&crate::session::token_for("abc")).unwrap();
        let client = FunctionsClient::new(
            &Url::parse("https://project.example.co/").unwrap(),
            None,
            session,
            Duration::from_secs(10),
        )
        .unwrap();
        assert_eq!(
            client.functions_url.join("check-subscription").unwrap().as_str(),
            "https://project.example.co/functions/v1/check-subscription"
        );
    }
}
