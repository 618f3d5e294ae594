//! Referral lifecycle driven by billing notifications.
//!
//! A referral starts `pending`. It becomes `eligible` once a qualifying payment is on record and
//! the hold period since signup has elapsed; that step books the upfront bonus. Every later
//! payment books one monthly commission until `max_months` is reached. Refunds reverse the
//! commission tied to the refunded payment; the referral is only moved to `clawed_back` when
//! nothing of its commission remains live.

use referral_ledger_types::{
    api::{PaymentNotification, RefundNotification, SignupNotification},
    CommissionKind, Referral, ReferralId, ReferralSettings, ReferralStatus, SettingsVersion,
};
use std::collections::BTreeSet;

use crate::engine::Engine;
use crate::error::LedgerError;
use crate::state::{is_release_due, LedgerState, NewCommission, Staged};

/// Rejection reason recorded on self-referrals.
pub const SELF_REFERRAL_REASON: &str = "self_referral";

impl Engine {
    /// Creates the referral for a new signup. Repeated notifications for the same referred user
    /// return the existing referral.
    pub async fn attribute_signup(
        &self,
        signup: SignupNotification,
    ) -> Result<Referral, LedgerError> {
        let referred_user_id = signup.referred_user_id.trim().to_string();
        if referred_user_id.is_empty() {
            return Err(LedgerError::InvalidRequest(
                "referred_user_id is required".to_string(),
            ));
        }
        let settings = self.settings.current();
        if !settings.settings.is_active {
            tracing::info!(code = %signup.referral_code, "signup rejected: program inactive");
            return Err(LedgerError::ProgramInactive);
        }
        let code = self
            .codes
            .resolve(&signup.referral_code)
            .ok_or_else(|| LedgerError::not_found("referral code", &signup.referral_code))?;

        let _referrer = self.referrer_locks.lock(&code.referrer_id).await;
        let now = self.now();
        let mut state = self.state.write().await;
        if let Some(existing) = state.referral_of(&referred_user_id) {
            tracing::debug!(
                referral_id = existing.id,
                referred = %referred_user_id,
                "signup already attributed"
            );
            return Ok(existing.clone());
        }

        let id = state.next_referral_id();
        let mut referral = Referral {
            id,
            referrer_id: code.referrer_id.clone(),
            referred_user_id,
            referral_code: code.code.clone(),
            status: ReferralStatus::Pending,
            signup_at: signup.signed_up_at.map_or(now, |at| at.min(now)),
            signup_ip: non_empty(signup.signup_ip),
            referred_email: non_empty(signup.referred_email),
            first_payment_at: None,
            first_payment_id: None,
            eligible_at: None,
            months_paid: 0,
            total_commission_cents: 0,
            upfront_paid: false,
            rejection_reason: None,
            fraud_flags: Vec::new(),
            needs_manual_review: false,
            approved_at: None,
            approved_by: None,
            resolved_at: None,
            settings_version: settings.version,
            processed_payments: BTreeSet::new(),
            processed_reversals: BTreeSet::new(),
        };

        if self.identity.same_identity(
            &code,
            &referral.referred_user_id,
            referral.referred_email.as_deref(),
        ) {
            referral.status = ReferralStatus::Rejected;
            referral.rejection_reason = Some(SELF_REFERRAL_REASON.to_string());
            referral.resolved_at = Some(now);
            referral.add_flag(self.fraud.self_referral_flag(now));
            tracing::warn!(
                referral_id = id,
                referrer = %referral.referrer_id,
                referred = %referral.referred_user_id,
                "self-referral rejected"
            );
        } else {
            let same_ip: Vec<&Referral> = match referral.signup_ip.as_deref() {
                Some(ip) => state.referrals_from_ip(ip).collect(),
                None => Vec::new(),
            };
            let flags = self.fraud.scan(&referral, &code, same_ip, now);
            for flag in flags {
                tracing::warn!(
                    referral_id = id,
                    kind = ?flag.kind,
                    ip = flag.ip.as_deref().unwrap_or(""),
                    domain = flag.domain.as_deref().unwrap_or(""),
                    "fraud signal at signup"
                );
                referral.add_flag(flag);
            }
            referral.needs_manual_review = referral.has_unresolved_flags();
        }

        let changes = state.commit(Staged::new(referral.clone()), now)?;
        self.emit(&changes);
        tracing::info!(
            referral_id = id,
            referrer = %referral.referrer_id,
            status = %referral.status,
            needs_manual_review = referral.needs_manual_review,
            "referral attributed"
        );
        Ok(referral)
    }

    /// Applies a qualifying payment by a referred user. Returns `None` for users that were not
    /// referred.
    pub async fn record_payment(
        &self,
        payment: PaymentNotification,
    ) -> Result<Option<Referral>, LedgerError> {
        if payment.payment_id.trim().is_empty() {
            return Err(LedgerError::InvalidRequest(
                "payment_id is required".to_string(),
            ));
        }
        let Some((referral_id, referrer_id)) = self.lookup_referred(&payment.user_id).await else {
            tracing::debug!(user = %payment.user_id, "payment from non-referred user");
            return Ok(None);
        };

        let _referrer = self.referrer_locks.lock(&referrer_id).await;
        let _referral = self.referral_locks.lock(&referral_id).await;
        let now = self.now();
        let paid_at = payment.paid_at.map_or(now, |at| at.min(now));
        let version = self.settings.at(paid_at);
        let mut state = self.state.write().await;
        let mut referral = state
            .referral(referral_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("referral", referral_id))?;
        if !referral
            .processed_payments
            .insert(payment.payment_id.clone())
        {
            tracing::debug!(
                referral_id,
                payment_id = %payment.payment_id,
                "duplicate payment ignored"
            );
            return Ok(Some(referral));
        }

        let mut appended = Vec::new();
        let mut cap = u32::MAX;
        if referral.status == ReferralStatus::Pending {
            if referral.first_payment_at.is_none() && payment.amount_cents > 0 {
                referral.first_payment_at = Some(paid_at);
                referral.first_payment_id = Some(payment.payment_id.clone());
            }
            let released = match referral.first_payment_at {
                Some(first_paid_at) => {
                    let upfront_version = self.settings.at(first_paid_at);
                    release_hold(&mut referral, &upfront_version, now, &mut appended)?
                }
                None => false,
            };
            // A later payment that finds the hold matured accrues as if the sweep had run first.
            if released
                && referral.first_payment_id.as_deref() != Some(payment.payment_id.as_str())
            {
                if let Some(max_months) =
                    accrue_monthly(&mut referral, &payment, &version, &mut appended)
                {
                    cap = max_months;
                }
            }
        } else if referral.status == ReferralStatus::Eligible {
            if let Some(max_months) =
                accrue_monthly(&mut referral, &payment, &version, &mut appended)
            {
                cap = max_months;
            }
        } else {
            tracing::debug!(
                referral_id,
                status = %referral.status,
                amount_cents = payment.amount_cents,
                "payment does not accrue commission"
            );
        }

        let appended_cents = appended
            .iter()
            .fold(0u64, |acc, new: &NewCommission| acc.saturating_add(new.amount_cents));
        if !appended.is_empty() {
            flag_for_review(&state, &mut referral, appended_cents, &version.settings);
        }
        let mut staged = Staged::new(referral.clone()).with_cap(cap);
        staged.appended = appended;
        let changes = state.commit(staged, now)?;
        self.emit(&changes);
        Ok(Some(referral))
    }

    /// Moves every pending referral whose hold has matured to `eligible`. Returns the ids moved.
    pub async fn release_matured_holds(&self) -> Result<Vec<ReferralId>, LedgerError> {
        let now = self.now();
        let candidates: Vec<(ReferralId, String)> = {
            let state = self.state.read().await;
            state
                .referrals()
                .filter_map(|referral| {
                    let paid_at = referral.first_payment_at?;
                    let hold = self.settings.at(paid_at).settings.hold_secs();
                    is_release_due(referral, hold, now)
                        .then(|| (referral.id, referral.referrer_id.clone()))
                })
                .collect()
        };

        let mut released = Vec::new();
        for (referral_id, referrer_id) in candidates {
            let _referrer = self.referrer_locks.lock(&referrer_id).await;
            let _referral = self.referral_locks.lock(&referral_id).await;
            let mut state = self.state.write().await;
            let Some(mut referral) = state.referral(referral_id).cloned() else {
                continue;
            };
            let Some(paid_at) = referral.first_payment_at else {
                continue;
            };
            let version = self.settings.at(paid_at);
            let mut appended = Vec::new();
            if !release_hold(&mut referral, &version, now, &mut appended)? {
                continue;
            }
            let appended_cents = appended
                .iter()
                .fold(0u64, |acc, new: &NewCommission| acc.saturating_add(new.amount_cents));
            if !appended.is_empty() {
                flag_for_review(&state, &mut referral, appended_cents, &version.settings);
            }
            let mut staged = Staged::new(referral);
            staged.appended = appended;
            let changes = state.commit(staged, now)?;
            self.emit(&changes);
            released.push(referral_id);
        }
        if !released.is_empty() {
            tracing::info!(count = released.len(), "matured holds released");
        }
        Ok(released)
    }

    /// Applies a refund or chargeback of a referred user's payment.
    pub async fn record_reversal(
        &self,
        refund: RefundNotification,
    ) -> Result<Option<Referral>, LedgerError> {
        let Some((referral_id, referrer_id)) = self.lookup_referred(&refund.user_id).await else {
            tracing::debug!(user = %refund.user_id, "refund from non-referred user");
            return Ok(None);
        };

        let _referrer = self.referrer_locks.lock(&referrer_id).await;
        let _referral = self.referral_locks.lock(&referral_id).await;
        let now = self.now();
        let mut state = self.state.write().await;
        let mut referral = state
            .referral(referral_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("referral", referral_id))?;
        if !referral
            .processed_reversals
            .insert(refund.payment_id.clone())
        {
            tracing::debug!(
                referral_id,
                payment_id = %refund.payment_id,
                "duplicate refund ignored"
            );
            return Ok(Some(referral));
        }

        if referral.status == ReferralStatus::Pending
            && referral.first_payment_id.as_deref() == Some(refund.payment_id.as_str())
        {
            referral.first_payment_at = None;
            referral.first_payment_id = None;
            tracing::info!(referral_id, "first payment refunded during hold");
        }

        let mut reversed = Vec::new();
        let mut tied = 0usize;
        for event in state
            .events_of(referral_id)
            .filter(|event| event.payment_id.as_deref() == Some(refund.payment_id.as_str()))
        {
            tied += 1;
            if event.reversed {
                continue;
            }
            reversed.push(event.id);
            referral.total_commission_cents = referral
                .total_commission_cents
                .saturating_sub(event.live_amount());
        }
        if tied > 0 && reversed.is_empty() {
            tracing::warn!(
                referral_id,
                payment_id = %refund.payment_id,
                "commission already reversed; ignoring"
            );
        }

        if !reversed.is_empty() {
            if referral.status.is_payable() && referral.total_commission_cents == 0 {
                referral.transition(ReferralStatus::ClawedBack)?;
                referral.resolved_at = Some(now);
                referral.needs_manual_review = false;
                tracing::info!(
                    referral_id,
                    kind = ?refund.kind,
                    payment_id = %refund.payment_id,
                    "referral clawed back"
                );
            } else {
                tracing::info!(
                    referral_id,
                    kind = ?refund.kind,
                    payment_id = %refund.payment_id,
                    remaining_cents = referral.total_commission_cents,
                    "partial clawback"
                );
            }
        }

        let mut staged = Staged::new(referral.clone());
        staged.reversed = reversed;
        let changes = state.commit(staged, now)?;
        self.emit(&changes);
        Ok(Some(referral))
    }
}

/// Books the monthly commission of a qualifying payment on an eligible referral. Returns the
/// month cap of the settings version used when an event was booked.
fn accrue_monthly(
    referral: &mut Referral,
    payment: &PaymentNotification,
    version: &SettingsVersion,
    appended: &mut Vec<NewCommission>,
) -> Option<u32> {
    if payment.amount_cents == 0 {
        tracing::debug!(referral_id = referral.id, "zero-amount payment ignored");
        return None;
    }
    if referral.months_paid >= version.settings.max_months {
        tracing::debug!(referral_id = referral.id, "monthly cap reached; payment ignored");
        return None;
    }
    let amount = version.settings.monthly_commission(payment.amount_cents);
    referral.months_paid += 1;
    referral.total_commission_cents = referral.total_commission_cents.saturating_add(amount);
    appended.push(NewCommission {
        kind: CommissionKind::Monthly,
        amount_cents: amount,
        month_index: Some(referral.months_paid),
        payment_id: Some(payment.payment_id.clone()),
        settings_version: version.version,
    });
    tracing::info!(
        referral_id = referral.id,
        amount_cents = amount,
        month = referral.months_paid,
        settings_version = version.version,
        "monthly commission accrued"
    );
    Some(version.settings.max_months)
}

/// Releases a matured hold, booking the upfront bonus once at the settings version in effect at
/// the first payment. Returns whether the referral moved.
fn release_hold(
    referral: &mut Referral,
    version: &SettingsVersion,
    now: u64,
    appended: &mut Vec<NewCommission>,
) -> Result<bool, LedgerError> {
    if !is_release_due(referral, version.settings.hold_secs(), now) {
        return Ok(false);
    }
    referral.transition(ReferralStatus::Eligible)?;
    let matured_at = referral
        .signup_at
        .saturating_add(version.settings.hold_secs())
        .max(referral.first_payment_at.unwrap_or(now));
    referral.eligible_at = Some(matured_at.min(now));
    tracing::info!(referral_id = referral.id, "hold released; referral eligible");
    if referral.upfront_paid {
        return Ok(true);
    }
    let amount = version.settings.upfront_amount_cents;
    referral.upfront_paid = true;
    referral.total_commission_cents = referral.total_commission_cents.saturating_add(amount);
    appended.push(NewCommission {
        kind: CommissionKind::Upfront,
        amount_cents: amount,
        month_index: None,
        payment_id: referral.first_payment_id.clone(),
        settings_version: version.version,
    });
    tracing::info!(
        referral_id = referral.id,
        amount_cents = amount,
        settings_version = version.version,
        "upfront commission accrued"
    );
    Ok(true)
}

/// Holds the referral for manual review when the referrer's unpaid commission reaches the
/// auto-approval threshold or an unresolved fraud flag is present. An administrator's approval
/// exempts the referral from the threshold but not from new flags.
pub(crate) fn flag_for_review(
    state: &LedgerState,
    referral: &mut Referral,
    appended_cents: u64,
    settings: &ReferralSettings,
) {
    if referral.needs_manual_review {
        return;
    }
    let unpaid = state
        .unpaid_commission(&referral.referrer_id)
        .saturating_add(appended_cents);
    let over_threshold =
        referral.approved_at.is_none() && unpaid >= settings.auto_approve_under_cents;
    if over_threshold || referral.has_unresolved_flags() {
        referral.needs_manual_review = true;
        tracing::info!(
            referral_id = referral.id,
            unpaid_cents = unpaid,
            threshold_cents = settings.auto_approve_under_cents,
            flagged = referral.has_unresolved_flags(),
            "referral held for manual review"
        );
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
