use anyhow::{Context as _, anyhow, bail, ensure};
use base64::prelude::*;
use chrono::{DateTime, Utc};
use http::HeaderValue;
use serde::Deserialize;
use tracing::warn;

/// Authenticated caller identity derived from the backend access token.
///
/// The token signature is not checked here; the backend verifies it on every
/// request. We only need the subject to scope local persistence.
#[derive(Clone, Debug)]
pub(crate) struct Session {
    subject_id: String,
    expires_at: Option<DateTime<Utc>>,
    authorization: HeaderValue,
}

#[derive(Deserialize)]
struct Claims {
    sub: String,
    exp: Option<i64>,
}

impl Session {
    pub(crate) fn parse(access_token: &str) -> anyhow::Result<Self> {
        const ERROR_MESSAGE: &str = "Invalid access token";

        let access_token = access_token.trim();
        let access_token = access_token
            .strip_prefix("Bearer ")
            .unwrap_or(access_token);

        let parts = access_token.split('.').collect::<Vec<_>>();

        let [_header, payload, _signature] = parts[..] else {
            bail!(ERROR_MESSAGE);
        };

        let decoded_payload = BASE64_URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|_| anyhow!(ERROR_MESSAGE))?;

        let claims: Claims =
            serde_json::from_slice(&decoded_payload).map_err(|_| anyhow!(ERROR_MESSAGE))?;

        ensure!(!claims.sub.is_empty(), ERROR_MESSAGE);

        let expires_at = claims
            .exp
            .and_then(|exp| DateTime::<Utc>::from_timestamp(exp, 0));

        if let Some(expires_at) = expires_at
            && expires_at <= Utc::now()
        {
            warn!(%expires_at, "Access token has expired, backend requests will be rejected");
        }

        let mut authorization = HeaderValue::from_str(&format!("Bearer {access_token}"))
            .context("Unexpected error: Failed to convert access token to header value")?;
        authorization.set_sensitive(true);

        Ok(Self {
            subject_id: claims.sub,
            expires_at,
            authorization,
        })
    }

    pub(crate) fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub(crate) fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub(crate) fn authorization(&self) -> &HeaderValue {
        &self.authorization
    }
}

#[cfg(test)]
pub(crate) fn token_for(subject: &str) -> String {
    let header = BASE64_URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = BASE64_URL_SAFE_NO_PAD.encode(
        serde_json::json!({ "sub": subject, "exp": 4_102_444_800_i64 })
            .to_string()
            .as_bytes(),
    );
    format!("{header}.{payload}.c2lnbmF0dXJl")
}
