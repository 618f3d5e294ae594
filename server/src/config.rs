use referral_ledger_execution::EngineConfig;
use std::collections::HashSet;
use std::path::PathBuf;

pub const DEFAULT_HTTP_RATE_LIMIT_PER_SECOND: u64 = 50;
pub const DEFAULT_HTTP_RATE_LIMIT_BURST: u32 = 100;
pub const DEFAULT_HTTP_BODY_LIMIT_BYTES: usize = 64 * 1024;
pub const DEFAULT_PERSISTENCE_BATCH_SIZE: usize = 256;
pub const DEFAULT_HOLD_SWEEP_INTERVAL_SECS: u64 = 3_600;

/// Shared secrets presented by collaborators. `None` disables the corresponding check, except
/// for the admin token: without one, every admin route answers 401.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthTokens {
    pub admin: Option<String>,
    pub identity_gateway: Option<String>,
    pub billing_webhook: Option<String>,
    pub metrics: Option<String>,
}

impl AuthTokens {
    pub fn from_env() -> Self {
        Self {
            admin: non_empty_env("ADMIN_AUTH_TOKEN"),
            identity_gateway: non_empty_env("IDENTITY_GATEWAY_TOKEN"),
            billing_webhook: non_empty_env("BILLING_WEBHOOK_TOKEN"),
            metrics: non_empty_env("METRICS_AUTH_TOKEN"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub engine: EngineConfig,
    pub tokens: AuthTokens,
    /// Browser origins allowed by CORS; `*` allows any.
    pub allowed_origins: HashSet<String>,
    pub http_rate_limit_per_second: Option<u64>,
    pub http_rate_limit_burst: Option<u32>,
    pub http_body_limit_bytes: Option<usize>,
    /// SQLite journal location (persistence disabled when omitted).
    pub persistence_path: Option<PathBuf>,
    pub persistence_batch_size: usize,
    /// Period of the background hold sweep (disabled when omitted).
    pub hold_sweep_interval_secs: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            tokens: AuthTokens::default(),
            allowed_origins: HashSet::new(),
            http_rate_limit_per_second: Some(DEFAULT_HTTP_RATE_LIMIT_PER_SECOND),
            http_rate_limit_burst: Some(DEFAULT_HTTP_RATE_LIMIT_BURST),
            http_body_limit_bytes: Some(DEFAULT_HTTP_BODY_LIMIT_BYTES),
            persistence_path: None,
            persistence_batch_size: DEFAULT_PERSISTENCE_BATCH_SIZE,
            hold_sweep_interval_secs: Some(DEFAULT_HOLD_SWEEP_INTERVAL_SECS),
        }
    }
}

pub fn parse_allowed_origins(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

pub fn parse_env_u64(var: &str) -> Option<u64> {
    std::env::var(var).ok().and_then(|v| v.trim().parse().ok())
}

pub fn parse_env_u32(var: &str) -> Option<u32> {
    std::env::var(var).ok().and_then(|v| v.trim().parse().ok())
}

fn non_empty_env(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
