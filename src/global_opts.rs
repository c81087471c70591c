use std::{path::PathBuf, time::Duration};

use clap::Args;
use url::Url;

use crate::{entitlement::EntitlementSettings, usage::UsageSettings};

#[derive(Debug, Args)]
pub(crate) struct GlobalOpts {
    /// Backend base URL
    ///
    /// Serverless functions are called under `functions/v1/` and counts are
    /// read from `rest/v1/` relative to this URL.
    #[arg(short, long, env = "TQ_BACKEND_URL")]
    pub(crate) backend_url: Url,

    /// Anonymous API key sent alongside the access token
    #[arg(short = 'k', long, env = "TQ_ANON_KEY", hide_env_values = true)]
    pub(crate) anon_key: Option<String>,

    /// Access token of the signed-in account (JWT)
    ///
    /// The subject claim of the token selects which account's plan and usage
    /// are checked. The token is never written to disk.
    #[arg(short = 't', long, env = "TQ_ACCESS_TOKEN", hide_env_values = true)]
    pub(crate) access_token: String,

    /// Directory holding the local plan and usage cache
    #[arg(long, env = "TQ_CACHE_DIR", default_value = ".testimonial-quota")]
    pub(crate) cache_dir: PathBuf,

    /// Minimum seconds between automatic subscription checks
    #[arg(long, env = "TQ_CHECK_COOLDOWN_SECS", default_value_t = 60)]
    pub(crate) check_cooldown_secs: u32,

    /// Seconds a cached free plan is trusted before falling back to Free
    #[arg(long, env = "TQ_CACHE_MAX_AGE_SECS", default_value_t = 600)]
    pub(crate) cache_max_age_secs: u32,

    /// Seconds a usage count is served without re-counting
    #[arg(long, env = "TQ_USAGE_TTL_SECS", default_value_t = 300)]
    pub(crate) usage_ttl_secs: u32,

    /// Timeout in seconds for the usage count queries
    #[arg(long, env = "TQ_USAGE_TIMEOUT_SECS", default_value_t = 8)]
    pub(crate) usage_timeout_secs: u32,

    /// Timeout in seconds for the subscription check
    #[arg(long, env = "TQ_CHECK_TIMEOUT_SECS", default_value_t = 10)]
    pub(crate) check_timeout_secs: u32,

    /// Seconds between background subscription checks in watch mode
    #[arg(long, env = "TQ_POLL_INTERVAL_SECS", default_value_t = 300)]
    pub(crate) poll_interval_secs: u32,

    /// Seconds between month rollover checks in watch mode
    #[arg(long, env = "TQ_RESET_INTERVAL_SECS", default_value_t = 3600)]
    pub(crate) reset_interval_secs: u32,
}

impl GlobalOpts {
    pub(crate) fn entitlement_settings(&self) -> EntitlementSettings {
        EntitlementSettings {
            cooldown: chrono::Duration::seconds(self.check_cooldown_secs.into()),
            cache_max_age: chrono::Duration::seconds(self.cache_max_age_secs.into()),
            request_timeout: Duration::from_secs(self.check_timeout_secs.into()),
        }
    }

    pub(crate) fn usage_settings(&self) -> UsageSettings {
        UsageSettings {
            ttl: chrono::Duration::seconds(self.usage_ttl_secs.into()),
            query_timeout: Duration::from_secs(self.usage_timeout_secs.into()),
        }
    }

    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1).into())
    }

    pub(crate) fn reset_interval(&self) -> Duration {
        Duration::from_secs(self.reset_interval_secs.max(1).into())
    }
}
