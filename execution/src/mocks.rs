//! Test doubles for the engine's collaborators, plus helpers to drive common flows.

use referral_ledger_types::{
    api::{PaymentNotification, RefundNotification, ReversalKind, SignupNotification},
    PayoutRequest, ReferralSettings, SECONDS_PER_DAY,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::codes::ReferrerProfile;
use crate::engine::{Engine, EngineConfig};
use crate::payouts::DisbursementClient;
use crate::state::{LedgerChange, LedgerSink};

/// Start of the test timeline (2024-01-01T00:00:00Z).
pub const EPOCH: u64 = 1_704_067_200;

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(now: u64) -> Self {
        Self {
            now: AtomicU64::new(now),
        }
    }

    pub fn set(&self, now: u64) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    /// Moves to `days` whole days after [`EPOCH`].
    pub fn set_day(&self, days: u64) {
        self.set(EPOCH + days * SECONDS_PER_DAY);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Sink that keeps every change in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    changes: Mutex<Vec<LedgerChange>>,
}

impl RecordingSink {
    pub fn changes(&self) -> Vec<LedgerChange> {
        self.changes.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl LedgerSink for RecordingSink {
    fn record(&self, changes: &[LedgerChange]) {
        if let Ok(mut recorded) = self.changes.lock() {
            recorded.extend_from_slice(changes);
        }
    }
}

/// Disbursement client that remembers what it was asked to pay.
#[derive(Debug, Default)]
pub struct RecordingDisbursement {
    submitted: Mutex<Vec<PayoutRequest>>,
}

impl RecordingDisbursement {
    pub fn submitted(&self) -> Vec<PayoutRequest> {
        self.submitted.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl DisbursementClient for RecordingDisbursement {
    fn submit(&self, payout: &PayoutRequest) {
        if let Ok(mut submitted) = self.submitted.lock() {
            submitted.push(payout.clone());
        }
    }
}

/// An engine wired to test doubles, with the clock at [`EPOCH`].
pub struct Harness {
    pub engine: Arc<Engine>,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<RecordingSink>,
    pub disbursement: Arc<RecordingDisbursement>,
}

impl Harness {
    pub fn new(settings: ReferralSettings) -> Self {
        let clock = Arc::new(ManualClock::new(EPOCH));
        let sink = Arc::new(RecordingSink::default());
        let disbursement = Arc::new(RecordingDisbursement::default());
        let engine = Engine::new(EngineConfig {
            public_base_url: "https://app.example.com".to_string(),
            initial_settings: settings,
            ..EngineConfig::default()
        })
        .with_clock(clock.clone())
        .with_sink(sink.clone())
        .with_disbursement(disbursement.clone());
        Self {
            engine: Arc::new(engine),
            clock,
            sink,
            disbursement,
        }
    }

    /// Issues (or returns) the referrer's code.
    pub fn code_for(&self, referrer: &str) -> String {
        self.code_with_profile(referrer, ReferrerProfile::default())
    }

    pub fn code_with_profile(&self, referrer: &str, profile: ReferrerProfile) -> String {
        match self.engine.my_code(&referrer.to_string(), &profile) {
            Ok(response) => response.code,
            Err(err) => panic!("code issuance failed: {err}"),
        }
    }
}

pub fn signup(code: &str, referred: &str) -> SignupNotification {
    SignupNotification {
        referral_code: code.to_string(),
        referred_user_id: referred.to_string(),
        referred_email: None,
        signup_ip: None,
        signed_up_at: None,
    }
}

pub fn payment(payment_id: &str, user: &str, amount_cents: u64) -> PaymentNotification {
    PaymentNotification {
        payment_id: payment_id.to_string(),
        user_id: user.to_string(),
        amount_cents,
        paid_at: None,
    }
}

pub fn refund(payment_id: &str, user: &str) -> RefundNotification {
    RefundNotification {
        payment_id: payment_id.to_string(),
        user_id: user.to_string(),
        kind: ReversalKind::Refund,
    }
}

/// Settings used by most scenarios: the defaults with no hold and review disabled.
pub fn instant_settings() -> ReferralSettings {
    ReferralSettings {
        hold_days: 0,
        auto_approve_under_cents: u64::MAX,
        ..ReferralSettings::default()
    }
}
