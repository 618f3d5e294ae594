use referral_ledger_types::{
    api::{HistoryResponse, MyCodeResponse, ReferralStats, ReferralView},
    CommissionEvent, Referral, ReferralId, ReferralSettings, ReferralStatus, SettingsVersion,
    UserId,
};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::codes::{CodeRegistry, ReferrerProfile};
use crate::error::LedgerError;
use crate::fraud::{FraudCollector, FraudConfig};
use crate::identity::{EmailIdentityResolver, IdentityResolver};
use crate::locks::KeyedLocks;
use crate::payouts::{DisbursementClient, LoggingDisbursement};
use crate::settings::SettingsStore;
use crate::state::{Balance, LedgerChange, LedgerSink, LedgerSnapshot, LedgerState, NoopSink};

const DEFAULT_PUBLIC_BASE_URL: &str = "http://localhost:3000";

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Origin used to build shareable signup links.
    pub public_base_url: String,
    pub fraud: FraudConfig,
    /// Settings published as version 1 when nothing was restored.
    pub initial_settings: ReferralSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            public_base_url: DEFAULT_PUBLIC_BASE_URL.to_string(),
            fraud: FraudConfig::default(),
            initial_settings: ReferralSettings::default(),
        }
    }
}

/// The referral ledger.
///
/// Lock order for every mutation: referrer lock, then referral lock(s), then the state lock.
/// Committed changes are handed to the [`LedgerSink`] before the keyed locks are released, so the
/// sink observes changes of one referrer in commit order.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: SettingsStore,
    pub(crate) codes: CodeRegistry,
    pub(crate) fraud: FraudCollector,
    pub(crate) identity: Arc<dyn IdentityResolver>,
    pub(crate) disbursement: Arc<dyn DisbursementClient>,
    pub(crate) sink: Arc<dyn LedgerSink>,
    pub(crate) state: RwLock<LedgerState>,
    pub(crate) referrer_locks: KeyedLocks<UserId>,
    pub(crate) referral_locks: KeyedLocks<ReferralId>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        // The initial version applies to every timestamp until an administrator publishes another.
        let settings = SettingsStore::new(config.initial_settings.clone(), 0);
        let fraud = FraudCollector::new(config.fraud.clone());
        Self {
            config,
            clock: Arc::new(SystemClock),
            settings,
            codes: CodeRegistry::default(),
            fraud,
            identity: Arc::new(EmailIdentityResolver),
            disbursement: Arc::new(LoggingDisbursement),
            sink: Arc::new(NoopSink),
            state: RwLock::new(LedgerState::default()),
            referrer_locks: KeyedLocks::default(),
            referral_locks: KeyedLocks::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn LedgerSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_disbursement(mut self, disbursement: Arc<dyn DisbursementClient>) -> Self {
        self.disbursement = disbursement;
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }

    /// Loads persisted rows. Must be called before the engine serves requests.
    pub fn with_snapshot(mut self, snapshot: LedgerSnapshot) -> Self {
        let LedgerSnapshot {
            settings,
            codes,
            referrals,
            events,
            payouts,
        } = snapshot;
        tracing::info!(
            settings = settings.len(),
            codes = codes.len(),
            referrals = referrals.len(),
            events = events.len(),
            payouts = payouts.len(),
            "restoring ledger snapshot"
        );
        self.settings.restore(settings);
        self.codes.restore(codes);
        *self.state.get_mut() = LedgerState::restore(referrals, events, payouts);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn current_settings(&self) -> Arc<SettingsVersion> {
        self.settings.current()
    }

    /// Returns the caller's referral code and signup link, issuing a code on first use.
    pub fn my_code(
        &self,
        referrer_id: &UserId,
        profile: &ReferrerProfile,
    ) -> Result<MyCodeResponse, LedgerError> {
        let record = self
            .codes
            .get_or_issue(
                referrer_id,
                profile,
                self.now(),
                &mut rand::thread_rng(),
                |record| self.emit(&[LedgerChange::Code(record.clone())]),
            )
            .ok_or_else(|| {
                LedgerError::InvalidRequest("unable to allocate a unique referral code".to_string())
            })?;
        let link = format!(
            "{}/signup?ref={}",
            self.config.public_base_url.trim_end_matches('/'),
            record.code
        );
        Ok(MyCodeResponse {
            code: record.code,
            link,
        })
    }

    pub async fn stats(&self, referrer_id: &str) -> ReferralStats {
        let settings = self.settings.current();
        let state = self.state.read().await;
        let balance = state.balance(referrer_id);
        let mut stats = ReferralStats {
            total_earned_cents: balance.earned_cents,
            pending_earnings_cents: balance
                .pending_review_cents
                .saturating_add(balance.reserved_cents),
            available_payout_cents: balance.available_cents,
            min_payout_cents: settings.settings.min_payout_cents,
            can_request_payout: balance.available_cents > 0
                && balance.available_cents >= settings.settings.min_payout_cents,
            ..ReferralStats::default()
        };
        for referral in state.referrals_of(referrer_id) {
            stats.total_referrals += 1;
            match referral.status {
                ReferralStatus::Pending => stats.pending_referrals += 1,
                ReferralStatus::Eligible | ReferralStatus::Paid => stats.active_referrals += 1,
                ReferralStatus::Rejected | ReferralStatus::ClawedBack => {}
            }
        }
        stats
    }

    /// The caller's referrals, newest first.
    pub async fn history(&self, referrer_id: &str) -> HistoryResponse {
        let state = self.state.read().await;
        let mut referrals: Vec<ReferralView> =
            state.referrals_of(referrer_id).map(ReferralView::from).collect();
        referrals.sort_by(|a, b| b.signup_at.cmp(&a.signup_at).then(b.id.cmp(&a.id)));
        HistoryResponse { referrals }
    }

    pub async fn balance(&self, referrer_id: &str) -> Balance {
        self.state.read().await.balance(referrer_id)
    }

    pub async fn referral(&self, id: ReferralId) -> Result<Referral, LedgerError> {
        self.state
            .read()
            .await
            .referral(id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("referral", id))
    }

    pub async fn events_for(&self, referral_id: ReferralId) -> Vec<CommissionEvent> {
        self.state.read().await.events_of(referral_id).cloned().collect()
    }

    /// Full copy of the ledger, in the shape persistence stores it.
    pub async fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.read().await;
        LedgerSnapshot {
            settings: self.settings.history(),
            codes: self.codes.records(),
            referrals: state.referrals().cloned().collect(),
            events: state
                .referrals()
                .flat_map(|referral| state.events_of(referral.id))
                .cloned()
                .collect(),
            payouts: state.payouts().cloned().collect(),
        }
    }

    pub(crate) fn emit(&self, changes: &[LedgerChange]) {
        if !changes.is_empty() {
            self.sink.record(changes);
        }
    }

    /// Referral and referrer ids for a referred user, if the user was referred at all.
    pub(crate) async fn lookup_referred(&self, user_id: &str) -> Option<(ReferralId, UserId)> {
        let state = self.state.read().await;
        state
            .referral_of(user_id)
            .map(|referral| (referral.id, referral.referrer_id.clone()))
    }
}
