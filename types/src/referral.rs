use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error as ThisError;

use crate::{CommissionEvent, ReferralId, UserId};

/// Lifecycle of a referral.
///
/// Allowed transitions:
///
/// | from      | to                              |
/// |-----------|---------------------------------|
/// | pending   | eligible, rejected              |
/// | eligible  | paid, rejected, clawed_back     |
/// | paid      | clawed_back                     |
/// | rejected  | (terminal)                      |
/// | clawed_back | (terminal)                    |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralStatus {
    Pending,
    Eligible,
    Paid,
    Rejected,
    ClawedBack,
}

impl ReferralStatus {
    pub const ALL: [ReferralStatus; 5] = [
        ReferralStatus::Pending,
        ReferralStatus::Eligible,
        ReferralStatus::Paid,
        ReferralStatus::Rejected,
        ReferralStatus::ClawedBack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReferralStatus::Pending => "pending",
            ReferralStatus::Eligible => "eligible",
            ReferralStatus::Paid => "paid",
            ReferralStatus::Rejected => "rejected",
            ReferralStatus::ClawedBack => "clawed_back",
        }
    }

    pub fn can_transition_to(self, next: ReferralStatus) -> bool {
        use ReferralStatus::*;
        matches!(
            (self, next),
            (Pending, Eligible)
                | (Pending, Rejected)
                | (Eligible, Paid)
                | (Eligible, Rejected)
                | (Eligible, ClawedBack)
                | (Paid, ClawedBack)
        )
    }

    /// Whether commission on this referral counts toward the referrer's payable balance.
    pub fn is_payable(self) -> bool {
        matches!(self, ReferralStatus::Eligible | ReferralStatus::Paid)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReferralStatus::Rejected | ReferralStatus::ClawedBack)
    }
}

impl fmt::Display for ReferralStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReferralStatus {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "eligible" => Ok(Self::Eligible),
            "paid" => Ok(Self::Paid),
            "rejected" => Ok(Self::Rejected),
            "clawed_back" => Ok(Self::ClawedBack),
            _ => Err("valid values: pending, eligible, paid, rejected, clawed_back"),
        }
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
#[error("invalid referral transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ReferralStatus,
    pub to: ReferralStatus,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudFlagKind {
    SharedIp,
    SharedEmailDomain,
    SelfReferral,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudFlag {
    #[serde(rename = "type")]
    pub kind: FraudFlagKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Other referral sharing the signal, when the match was against a sibling referral.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_referral_id: Option<ReferralId>,
    pub detected_at: u64,
    #[serde(default)]
    pub resolved: bool,
}

impl FraudFlag {
    /// Two flags describe the same signal when kind and subject match.
    pub fn same_signal(&self, other: &FraudFlag) -> bool {
        self.kind == other.kind
            && self.domain == other.domain
            && self.ip == other.ip
            && self.related_referral_id == other.related_referral_id
    }
}

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum ReferralInvariantError {
    #[error("total_commission_cents mismatch (recorded={recorded}, ledger={ledger})")]
    TotalMismatch { recorded: u64, ledger: u64 },
    #[error("months_paid exceeds max_months (months_paid={months_paid}, max={max})")]
    MonthsExceeded { months_paid: u32, max: u32 },
    #[error("monthly event count mismatch (months_paid={months_paid}, events={events})")]
    MonthlyCountMismatch { months_paid: u32, events: u32 },
    #[error("commission event {event_id} does not belong to referral {referral_id}")]
    ForeignEvent { event_id: u64, referral_id: u64 },
    #[error("{status} referral carries commission events")]
    CommissionWhilePending { status: ReferralStatus },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referral {
    pub id: ReferralId,
    pub referrer_id: UserId,
    pub referred_user_id: UserId,
    pub referral_code: String,
    pub status: ReferralStatus,
    pub signup_at: u64,
    pub signup_ip: Option<String>,
    pub referred_email: Option<String>,
    pub first_payment_at: Option<u64>,
    pub first_payment_id: Option<String>,
    pub eligible_at: Option<u64>,
    pub months_paid: u32,
    pub total_commission_cents: u64,
    pub upfront_paid: bool,
    pub rejection_reason: Option<String>,
    pub fraud_flags: Vec<FraudFlag>,
    /// Review flag raised by the auto-approval policy; not a status.
    pub needs_manual_review: bool,
    pub approved_at: Option<u64>,
    pub approved_by: Option<UserId>,
    pub resolved_at: Option<u64>,
    pub settings_version: u64,
    /// Payment ids already applied, so billing retries are no-ops.
    #[serde(default)]
    pub processed_payments: BTreeSet<String>,
    /// Refund ids already applied.
    #[serde(default)]
    pub processed_reversals: BTreeSet<String>,
}

impl Referral {
    pub fn transition(&mut self, next: ReferralStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn has_unresolved_flags(&self) -> bool {
        self.fraud_flags.iter().any(|flag| !flag.resolved)
    }

    /// Adds a flag unless the same signal is already recorded. Returns whether it was added.
    pub fn add_flag(&mut self, flag: FraudFlag) -> bool {
        if self.fraud_flags.iter().any(|existing| existing.same_signal(&flag)) {
            return false;
        }
        self.fraud_flags.push(flag);
        true
    }

    pub fn resolve_flags(&mut self) {
        for flag in &mut self.fraud_flags {
            flag.resolved = true;
        }
    }

    /// Checks this referral against its own ledger entries.
    pub fn validate_invariants<'a>(
        &self,
        events: impl IntoIterator<Item = &'a CommissionEvent>,
        max_months: u32,
    ) -> Result<(), ReferralInvariantError> {
        let mut ledger = 0u64;
        let mut monthly = 0u32;
        let mut any = false;
        for event in events {
            if event.referral_id != self.id {
                return Err(ReferralInvariantError::ForeignEvent {
                    event_id: event.id,
                    referral_id: self.id,
                });
            }
            any = true;
            if event.is_monthly() {
                monthly += 1;
            }
            ledger = ledger.saturating_add(event.live_amount());
        }
        if ledger != self.total_commission_cents {
            return Err(ReferralInvariantError::TotalMismatch {
                recorded: self.total_commission_cents,
                ledger,
            });
        }
        if self.months_paid > max_months {
            return Err(ReferralInvariantError::MonthsExceeded {
                months_paid: self.months_paid,
                max: max_months,
            });
        }
        if monthly != self.months_paid {
            return Err(ReferralInvariantError::MonthlyCountMismatch {
                months_paid: self.months_paid,
                events: monthly,
            });
        }
        if any && self.status == ReferralStatus::Pending {
            return Err(ReferralInvariantError::CommissionWhilePending {
                status: self.status,
            });
        }
        Ok(())
    }
}
