//! HTTP service for the referral ledger.
//!
//! Wraps a [`referral_ledger_execution::Engine`] with the referrer, admin and collaborator
//! routes, shared-secret authentication, Prometheus metrics and an optional SQLite journal the
//! ledger is restored from on startup.

use anyhow::Context;
use referral_ledger_execution::{Engine, LedgerError, LedgerSnapshot};
use referral_ledger_types::ReferralId;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

mod api;
pub use api::Api;
mod config;
pub use config::{
    parse_allowed_origins, parse_env_u32, parse_env_u64, AuthTokens, ServerConfig,
    DEFAULT_HOLD_SWEEP_INTERVAL_SECS, DEFAULT_HTTP_BODY_LIMIT_BYTES,
    DEFAULT_HTTP_RATE_LIMIT_BURST, DEFAULT_HTTP_RATE_LIMIT_PER_SECOND,
    DEFAULT_PERSISTENCE_BATCH_SIZE,
};
mod metrics;
pub use metrics::{
    HttpMetrics, HttpMetricsSnapshot, JournalMetrics, JournalMetricsSnapshot, LatencySnapshot,
    LedgerMetrics, LedgerMetricsSnapshot, Route,
};
mod persistence;
pub use persistence::LedgerJournal;

pub struct Service {
    engine: Arc<Engine>,
    config: ServerConfig,
    journal: Option<Arc<LedgerJournal>>,
    http_metrics: HttpMetrics,
    ledger_metrics: LedgerMetrics,
    journal_metrics: Arc<JournalMetrics>,
}

impl Service {
    pub fn new(engine: Arc<Engine>, config: ServerConfig) -> Self {
        Self {
            engine,
            config,
            journal: None,
            http_metrics: HttpMetrics::default(),
            ledger_metrics: LedgerMetrics::default(),
            journal_metrics: Arc::new(JournalMetrics::default()),
        }
    }

    /// Builds the engine from `config`, restoring it from the journal when one is configured.
    pub fn open(config: ServerConfig) -> anyhow::Result<Self> {
        let journal_metrics = Arc::new(JournalMetrics::default());
        let (journal, snapshot) = match &config.persistence_path {
            Some(path) => {
                let (journal, snapshot) = LedgerJournal::load_and_start_sqlite(
                    path,
                    config.persistence_batch_size,
                    journal_metrics.clone(),
                )
                .context("load and start ledger journal")?;
                info!(path = %path.display(), "Ledger persistence enabled");
                (Some(Arc::new(journal)), snapshot)
            }
            None => {
                warn!("Ledger persistence disabled; state is lost on restart");
                (None, LedgerSnapshot::default())
            }
        };

        let mut engine = Engine::new(config.engine.clone()).with_snapshot(snapshot);
        if let Some(journal) = &journal {
            engine = engine.with_sink(journal.clone());
        }

        Ok(Self {
            engine: Arc::new(engine),
            config,
            journal,
            http_metrics: HttpMetrics::default(),
            ledger_metrics: LedgerMetrics::default(),
            journal_metrics,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn http_metrics(&self) -> &HttpMetrics {
        &self.http_metrics
    }

    pub fn ledger_metrics(&self) -> &LedgerMetrics {
        &self.ledger_metrics
    }

    pub fn journal_metrics(&self) -> &JournalMetrics {
        &self.journal_metrics
    }

    pub fn persistence_enabled(&self) -> bool {
        self.journal.is_some()
    }

    /// Counts ledger invariant violations before the error reaches the caller.
    pub fn observe<T>(&self, result: Result<T, LedgerError>) -> Result<T, LedgerError> {
        if let Err(err @ LedgerError::Inconsistent { .. }) = &result {
            self.ledger_metrics.inc_inconsistency();
            tracing::error!(error = %err, "ledger invariant violated; nothing committed");
        }
        result
    }

    pub async fn release_holds(&self) -> Result<Vec<ReferralId>, LedgerError> {
        let released = self.observe(self.engine.release_matured_holds().await)?;
        self.ledger_metrics.add_holds_released(released.len());
        Ok(released)
    }

    /// Periodically releases matured holds, so referrals without further payments still become
    /// eligible. No-op when the sweep interval is unset.
    pub fn start_hold_sweeper(self: &Arc<Self>) {
        let Some(secs) = self.config.hold_sweep_interval_secs.filter(|secs| *secs > 0) else {
            return;
        };
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match service.release_holds().await {
                    Ok(released) if !released.is_empty() => {
                        info!(count = released.len(), "hold sweep released referrals");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "hold sweep failed"),
                }
            }
        });
        info!(interval_secs = secs, "Hold sweeper started");
    }

    /// Waits until every committed change has reached the journal.
    pub async fn flush(&self) {
        if let Some(journal) = &self.journal {
            journal.flush().await;
        }
    }
}
