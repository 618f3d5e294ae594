use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use referral_ledger_execution::{EngineConfig, FraudConfig};
use referral_ledger_server::{
    parse_allowed_origins, parse_env_u32, parse_env_u64, Api, AuthTokens, ServerConfig, Service,
};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() -> Result<()> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .ok()
        .and_then(|value| {
            let trimmed = value.trim().to_string();
            (!trimmed.is_empty()).then_some(trimmed)
        });

    if let Some(endpoint) = endpoint {
        let service_name = std::env::var("OTEL_SERVICE_NAME")
            .unwrap_or_else(|_| "referral-ledger-server".to_string());
        let rate = std::env::var("OTEL_SAMPLING_RATE")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .map(|value| value.clamp(0.0, 1.0))
            .unwrap_or(1.0);
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .build()
            .context("failed to build OTLP exporter")?;
        let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
            .with_sampler(opentelemetry_sdk::trace::Sampler::TraceIdRatioBased(rate))
            .with_resource(
                opentelemetry_sdk::Resource::builder_empty()
                    .with_attributes([opentelemetry::KeyValue::new("service.name", service_name)])
                    .build(),
            )
            .with_batch_exporter(exporter)
            .build();
        let tracer = tracer_provider.tracer("referral-ledger-server");
        opentelemetry::global::set_tracer_provider(tracer_provider);

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(LevelFilter::INFO))
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host interface to bind (default: localhost).
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    /// Origin used to build signup links (falls back to PUBLIC_BASE_URL).
    #[arg(long)]
    public_base_url: Option<String>,

    /// Path to the SQLite ledger journal (persistence disabled when omitted).
    #[arg(long)]
    persistence_path: Option<PathBuf>,

    /// Max journal rows written per transaction (0 uses default).
    #[arg(long)]
    persistence_batch_size: Option<usize>,

    /// HTTP rate limit per IP in requests per second (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_per_second: Option<u64>,

    /// HTTP rate limit burst size (0 disables rate limiting).
    #[arg(long)]
    http_rate_limit_burst: Option<u32>,

    /// Max request body size in bytes (0 disables limit).
    #[arg(long)]
    http_body_limit_bytes: Option<usize>,

    /// Window in seconds within which signups sharing an IP are flagged.
    #[arg(long)]
    fraud_shared_ip_window_secs: Option<u64>,

    /// Period of the background hold sweep in seconds (0 disables the sweep).
    #[arg(long)]
    hold_sweep_interval_secs: Option<u64>,
}

fn is_production() -> bool {
    matches!(
        std::env::var("NODE_ENV").as_deref(),
        Ok("production") | Ok("prod")
    )
}

/// Maps an optional arg value to Option: 0 => None, Some(v) => Some(v), None => default
fn map_optional_limit<T: Copy + PartialEq + From<u8>>(
    arg: Option<T>,
    default: Option<T>,
) -> Option<T> {
    match arg {
        Some(v) if v == T::from(0) => None,
        Some(v) => Some(v),
        None => default,
    }
}

fn build_config(args: &Args) -> Result<ServerConfig> {
    let defaults = ServerConfig::default();

    let public_base_url = args
        .public_base_url
        .clone()
        .or_else(|| std::env::var("PUBLIC_BASE_URL").ok())
        .map(|value| value.trim().trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| defaults.engine.public_base_url.clone());
    if !public_base_url.starts_with("http://") && !public_base_url.starts_with("https://") {
        anyhow::bail!("public_base_url must be an http(s) origin (got {public_base_url})");
    }

    let mut fraud = FraudConfig::default();
    if let Some(window) = args.fraud_shared_ip_window_secs {
        if window == 0 {
            anyhow::bail!("fraud_shared_ip_window_secs must be > 0 when set");
        }
        fraud.shared_ip_window_secs = window;
    }

    // CLI flags win over the environment, which wins over the defaults.
    let http_rate_limit_per_second = map_optional_limit(
        args.http_rate_limit_per_second
            .or_else(|| parse_env_u64("RATE_LIMIT_HTTP_PER_SEC")),
        defaults.http_rate_limit_per_second,
    );
    let http_rate_limit_burst = map_optional_limit(
        args.http_rate_limit_burst
            .or_else(|| parse_env_u32("RATE_LIMIT_HTTP_BURST")),
        defaults.http_rate_limit_burst,
    );

    let persistence_batch_size = match args.persistence_batch_size {
        Some(0) | None => defaults.persistence_batch_size,
        Some(size) => size,
    };

    Ok(ServerConfig {
        engine: EngineConfig {
            public_base_url,
            fraud,
            ..defaults.engine
        },
        tokens: AuthTokens::from_env(),
        allowed_origins: std::env::var("ALLOWED_HTTP_ORIGINS")
            .map(|raw| parse_allowed_origins(&raw))
            .unwrap_or_default(),
        http_rate_limit_per_second,
        http_rate_limit_burst,
        http_body_limit_bytes: map_optional_limit(
            args.http_body_limit_bytes,
            defaults.http_body_limit_bytes,
        ),
        persistence_path: args.persistence_path.clone(),
        persistence_batch_size,
        hold_sweep_interval_secs: map_optional_limit(
            args.hold_sweep_interval_secs,
            defaults.hold_sweep_interval_secs,
        ),
    })
}

fn require_env(var: &str) -> Result<String> {
    let value = std::env::var(var).unwrap_or_default();
    if value.trim().is_empty() {
        anyhow::bail!("Missing required env: {var}");
    }
    Ok(value)
}

fn require_positive_u64(var: &str) -> Result<()> {
    let value = require_env(var)?;
    let parsed: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {var}: {value}"))?;
    if parsed == 0 {
        anyhow::bail!("Invalid {var}: {value}");
    }
    Ok(())
}

fn ensure_production_env() -> Result<()> {
    if !is_production() {
        return Ok(());
    }

    require_env("ADMIN_AUTH_TOKEN")?;
    require_env("IDENTITY_GATEWAY_TOKEN")?;
    require_env("BILLING_WEBHOOK_TOKEN")?;
    require_env("METRICS_AUTH_TOKEN")?;
    require_env("ALLOWED_HTTP_ORIGINS")?;
    require_positive_u64("RATE_LIMIT_HTTP_PER_SEC")?;
    require_positive_u64("RATE_LIMIT_HTTP_BURST")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(?err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse args
    let args = Args::parse();

    // Create logger
    init_tracing()?;

    ensure_production_env()?;

    let config = build_config(&args)?;
    if config.tokens.admin.is_none() {
        tracing::warn!("ADMIN_AUTH_TOKEN is not set; admin routes will refuse every request");
    }
    let service = Arc::new(Service::open(config).context("open referral ledger")?);
    service.start_hold_sweeper();

    let api = Api::new(service.clone());
    let app = api.router();

    // Start server
    let addr = SocketAddr::new(args.host, args.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("axum server error")?;

    service.flush().await;
    info!("Ledger journal flushed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_limits_and_base_url() {
        let args = Args::parse_from([
            "referral-ledger-server",
            "--public-base-url",
            "https://refer.example.com/",
            "--http-body-limit-bytes",
            "0",
            "--hold-sweep-interval-secs",
            "60",
            "--fraud-shared-ip-window-secs",
            "600",
            "--persistence-batch-size",
            "0",
        ]);
        let config = build_config(&args).expect("config should parse");
        assert_eq!(config.engine.public_base_url, "https://refer.example.com");
        assert_eq!(config.http_body_limit_bytes, None);
        assert_eq!(config.hold_sweep_interval_secs, Some(60));
        assert_eq!(config.engine.fraud.shared_ip_window_secs, 600);
        assert_eq!(
            config.persistence_batch_size,
            ServerConfig::default().persistence_batch_size
        );
    }

    #[test]
    fn rejects_non_http_base_url() {
        let args = Args::parse_from([
            "referral-ledger-server",
            "--public-base-url",
            "ftp://refer.example.com",
        ]);
        let err = build_config(&args).unwrap_err();
        assert!(
            err.to_string().contains("public_base_url"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn rejects_zero_fraud_window() {
        let args = Args::parse_from([
            "referral-ledger-server",
            "--public-base-url",
            "https://refer.example.com",
            "--fraud-shared-ip-window-secs",
            "0",
        ]);
        assert!(build_config(&args).is_err());
    }

    #[test]
    fn zero_disables_optional_limits() {
        assert_eq!(map_optional_limit(Some(0u64), Some(5)), None);
        assert_eq!(map_optional_limit(Some(3u64), Some(5)), Some(3));
        assert_eq!(map_optional_limit(None, Some(5u64)), Some(5));
    }
}
