//! JSON request and response bodies exchanged over the service boundary.

use serde::{Deserialize, Serialize};

use crate::{
    PaymentMethod, PayoutId, PayoutRequest, PayoutStatus, Referral, ReferralId, ReferralSettings,
    ReferralStatus, SettingsVersion, UserId,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MyCodeResponse {
    pub code: String,
    pub link: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralStats {
    pub total_earned_cents: u64,
    pub pending_earnings_cents: u64,
    pub available_payout_cents: u64,
    pub active_referrals: usize,
    pub total_referrals: usize,
    pub pending_referrals: usize,
    pub min_payout_cents: u64,
    pub can_request_payout: bool,
}

/// Referrer-facing projection of a referral. Fraud signals and network details stay admin-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralView {
    pub id: ReferralId,
    pub referred_user_id: UserId,
    pub referral_code: String,
    pub status: ReferralStatus,
    pub signup_at: u64,
    pub first_payment_at: Option<u64>,
    pub eligible_at: Option<u64>,
    pub months_paid: u32,
    pub total_commission_cents: u64,
    pub upfront_paid: bool,
    pub rejection_reason: Option<String>,
}

impl From<&Referral> for ReferralView {
    fn from(referral: &Referral) -> Self {
        Self {
            id: referral.id,
            referred_user_id: referral.referred_user_id.clone(),
            referral_code: referral.referral_code.clone(),
            status: referral.status,
            signup_at: referral.signup_at,
            first_payment_at: referral.first_payment_at,
            eligible_at: referral.eligible_at,
            months_paid: referral.months_paid,
            total_commission_cents: referral.total_commission_cents,
            upfront_paid: referral.upfront_paid,
            rejection_reason: referral.rejection_reason.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub referrals: Vec<ReferralView>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRequestBody {
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub payment_email: Option<String>,
    /// Omitted to request the whole available balance.
    #[serde(default)]
    pub amount_cents: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutSummary {
    pub id: PayoutId,
    pub amount_cents: u64,
    pub status: PayoutStatus,
    pub payment_method: PaymentMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_email: Option<String>,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<u64>,
}

impl From<&PayoutRequest> for PayoutSummary {
    fn from(payout: &PayoutRequest) -> Self {
        Self {
            id: payout.id,
            amount_cents: payout.amount_cents,
            status: payout.status,
            payment_method: payout.payment_method,
            payment_email: payout.payment_email.clone(),
            created_at: payout.created_at,
            resolved_at: payout.resolved_at,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutHistoryResponse {
    pub payout_requests: Vec<PayoutSummary>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub total: usize,
    pub pending: usize,
    pub eligible: usize,
    pub paid: usize,
    pub rejected: usize,
    pub clawed_back: usize,
}

impl StatusSummary {
    pub fn count(&mut self, status: ReferralStatus) {
        self.total += 1;
        match status {
            ReferralStatus::Pending => self.pending += 1,
            ReferralStatus::Eligible => self.eligible += 1,
            ReferralStatus::Paid => self.paid += 1,
            ReferralStatus::Rejected => self.rejected += 1,
            ReferralStatus::ClawedBack => self.clawed_back += 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub total_pages: usize,
}

impl Pagination {
    pub fn new(page: usize, limit: usize, total: usize) -> Self {
        let limit = limit.max(1);
        Self {
            page,
            limit,
            total,
            total_pages: total.div_ceil(limit),
        }
    }

    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.limit)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminReferralList {
    pub referrals: Vec<Referral>,
    pub summary: StatusSummary,
    pub pagination: Pagination,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminPayoutList {
    pub payout_requests: Vec<PayoutRequest>,
    pub pagination: Pagination,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsResponse {
    pub version: u64,
    pub effective_at: u64,
    #[serde(flatten)]
    pub settings: ReferralSettings,
}

impl From<&SettingsVersion> for SettingsResponse {
    fn from(version: &SettingsVersion) -> Self {
        Self {
            version: version.version,
            effective_at: version.effective_at,
            settings: version.settings.clone(),
        }
    }
}

/// Billing collaborator: a new user signed up with a referral code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignupNotification {
    pub referral_code: String,
    pub referred_user_id: UserId,
    #[serde(default)]
    pub referred_email: Option<String>,
    #[serde(default)]
    pub signup_ip: Option<String>,
    #[serde(default)]
    pub signed_up_at: Option<u64>,
}

/// Billing collaborator: a referred user paid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentNotification {
    pub payment_id: String,
    pub user_id: UserId,
    pub amount_cents: u64,
    #[serde(default)]
    pub paid_at: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReversalKind {
    Refund,
    Chargeback,
}

/// Billing collaborator: a payment was refunded or charged back.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundNotification {
    pub payment_id: String,
    pub user_id: UserId,
    pub kind: ReversalKind,
}

/// Disbursement collaborator (or an admin on its behalf) reporting a payout outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutResolution {
    pub status: PayoutStatus,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedHolds {
    pub released: Vec<ReferralId>,
}
