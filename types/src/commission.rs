use serde::{Deserialize, Serialize};

use crate::{EventId, ReferralId, UserId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionKind {
    Upfront,
    Monthly,
}

/// Append-only ledger entry. Once written only `reversed_cents`, `reversed` and `reversed_at`
/// ever change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionEvent {
    pub id: EventId,
    pub referral_id: ReferralId,
    pub referrer_id: UserId,
    pub kind: CommissionKind,
    pub amount_cents: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month_index: Option<u32>,
    /// Billing payment this commission is tied to; refunds of it claw the event back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    pub settings_version: u64,
    pub created_at: u64,
    /// Part of `amount_cents` taken back while the rest stays live (a rejected referral keeps
    /// only what was already paid out or reserved).
    #[serde(default, skip_serializing_if = "is_zero")]
    pub reversed_cents: u64,
    pub reversed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reversed_at: Option<u64>,
}

impl CommissionEvent {
    pub fn is_monthly(&self) -> bool {
        self.kind == CommissionKind::Monthly
    }

    /// Amount still counted toward the referral's total.
    pub fn live_amount(&self) -> u64 {
        if self.reversed {
            0
        } else {
            self.amount_cents.saturating_sub(self.reversed_cents)
        }
    }
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

/// Sum of non-reversed commission across `events`.
pub fn live_total<'a>(events: impl IntoIterator<Item = &'a CommissionEvent>) -> u64 {
    events
        .into_iter()
        .fold(0u64, |acc, event| acc.saturating_add(event.live_amount()))
}
