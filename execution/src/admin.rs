//! Administrator operations. Every entry point goes through [`Engine::admin`], which refuses
//! callers without the administrator role.

use referral_ledger_types::{
    api::{AdminPayoutList, AdminReferralList, Pagination, PayoutResolution, StatusSummary},
    PayoutId, PayoutRequest, PayoutStatus, Referral, ReferralId, ReferralStatus, SettingsUpdate,
    SettingsVersion, UserId, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT, MAX_REASON_LENGTH,
};
use std::sync::Arc;

use crate::engine::Engine;
use crate::error::LedgerError;
use crate::identity::Caller;
use crate::state::{LedgerChange, LedgerState, Staged};

/// Page selection for admin listings. Zero values fall back to the defaults.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn new(page: Option<usize>, limit: Option<usize>) -> Self {
        Self {
            page: page.unwrap_or(1),
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT),
        }
    }

    fn normalized(self) -> (usize, usize) {
        let page = self.page.max(1);
        let limit = match self.limit {
            0 => DEFAULT_PAGE_LIMIT,
            limit => limit.min(MAX_PAGE_LIMIT),
        };
        (page, limit)
    }
}

pub struct AdminGateway<'a> {
    engine: &'a Engine,
    admin_id: UserId,
}

impl Engine {
    pub fn admin(&self, caller: &Caller) -> Result<AdminGateway<'_>, LedgerError> {
        if !caller.is_admin() {
            tracing::warn!(user = %caller.user_id, "admin operation refused");
            return Err(LedgerError::Unauthorized);
        }
        Ok(AdminGateway {
            engine: self,
            admin_id: caller.user_id.clone(),
        })
    }
}

impl AdminGateway<'_> {
    pub fn admin_id(&self) -> &str {
        &self.admin_id
    }

    /// Clears the review flag and resolves fraud flags on a pending or eligible referral. An
    /// eligible referral with nothing to review cannot be approved; repeating an approval is a
    /// no-op.
    pub async fn approve(&self, referral_id: ReferralId) -> Result<Referral, LedgerError> {
        self.edit(referral_id, |_, referral, now| {
            if !matches!(
                referral.status,
                ReferralStatus::Pending | ReferralStatus::Eligible
            ) {
                return Err(LedgerError::transition(
                    "referral",
                    referral.status,
                    "approved",
                ));
            }
            if !referral.needs_manual_review && !referral.has_unresolved_flags() {
                if referral.approved_at.is_some() {
                    return Ok(None);
                }
                if referral.status == ReferralStatus::Eligible {
                    return Err(LedgerError::transition(
                        "referral",
                        referral.status,
                        "approved",
                    ));
                }
            }
            referral.needs_manual_review = false;
            referral.resolve_flags();
            referral.approved_at = Some(now);
            referral.approved_by = Some(self.admin_id.clone());
            tracing::info!(referral_id, admin = %self.admin_id, "referral approved");
            Ok(Some(Staged::new(referral.clone())))
        })
        .await
    }

    /// Rejects a pending or eligible referral. Only commission already reserved or disbursed
    /// stays on the books; the rest is reversed and a reserved share follows once its payout is
    /// rejected.
    pub async fn reject(
        &self,
        referral_id: ReferralId,
        reason: Option<String>,
    ) -> Result<Referral, LedgerError> {
        let reason = reason
            .map(|reason| reason.trim().to_string())
            .filter(|reason| !reason.is_empty());
        if reason
            .as_ref()
            .is_some_and(|reason| reason.len() > MAX_REASON_LENGTH)
        {
            return Err(LedgerError::InvalidRequest(format!(
                "reason must be at most {MAX_REASON_LENGTH} characters"
            )));
        }
        self.edit(referral_id, |state, referral, now| {
            if referral.status == ReferralStatus::Rejected {
                return Ok(None);
            }
            referral.transition(ReferralStatus::Rejected)?;
            referral.rejection_reason = reason.clone();
            referral.resolved_at = Some(now);
            referral.needs_manual_review = false;

            let allocated = state.allocations_of(&referral.referrer_id, None);
            let mut staged = Staged::new(referral.clone());
            for event in state.events_of(referral_id) {
                let live = event.live_amount();
                let keep = allocated.get(&event.id).copied().unwrap_or(0).min(live);
                if keep == live {
                    continue;
                }
                if keep == 0 {
                    staged.reversed.push(event.id);
                } else {
                    staged.trimmed.push((event.id, keep));
                }
                referral.total_commission_cents = referral
                    .total_commission_cents
                    .saturating_sub(live - keep);
            }
            tracing::info!(
                referral_id,
                admin = %self.admin_id,
                reversed = staged.reversed.len(),
                trimmed = staged.trimmed.len(),
                remaining_cents = referral.total_commission_cents,
                "referral rejected"
            );
            staged.referral = referral.clone();
            Ok(Some(staged))
        })
        .await
    }

    /// Marks an eligible referral whose commission has been (at least partly) disbursed as paid.
    pub async fn mark_paid(&self, referral_id: ReferralId) -> Result<Referral, LedgerError> {
        self.edit(referral_id, |state, referral, now| {
            if referral.status == ReferralStatus::Paid {
                return Ok(None);
            }
            if referral.status == ReferralStatus::Eligible && state.disbursed_for(referral_id) == 0 {
                tracing::info!(referral_id, "mark paid refused: nothing disbursed");
                return Err(LedgerError::transition(
                    "referral",
                    referral.status,
                    ReferralStatus::Paid,
                ));
            }
            referral.transition(ReferralStatus::Paid)?;
            referral.resolved_at = Some(now);
            tracing::info!(referral_id, admin = %self.admin_id, "referral marked paid");
            Ok(Some(Staged::new(referral.clone())))
        })
        .await
    }

    /// Re-runs fraud checks, appending signals not yet recorded.
    pub async fn rescan_fraud(&self, referral_id: ReferralId) -> Result<Referral, LedgerError> {
        let engine = self.engine;
        self.edit(referral_id, |state, referral, now| {
            let Some(code) = engine.codes.code_of(&referral.referrer_id) else {
                return Ok(None);
            };
            let same_ip: Vec<&Referral> = match referral.signup_ip.as_deref() {
                Some(ip) => state.referrals_from_ip(ip).collect(),
                None => Vec::new(),
            };
            let flags = engine.fraud.scan(referral, &code, same_ip, now);
            let mut added = 0usize;
            for flag in flags {
                if referral.add_flag(flag) {
                    added += 1;
                }
            }
            if added == 0 {
                return Ok(None);
            }
            if !referral.status.is_terminal() {
                referral.needs_manual_review = true;
            }
            tracing::warn!(referral_id, added, "fraud rescan added signals");
            Ok(Some(Staged::new(referral.clone())))
        })
        .await
    }

    pub fn settings(&self) -> Arc<SettingsVersion> {
        self.engine.settings.current()
    }

    pub fn settings_history(&self) -> Vec<SettingsVersion> {
        self.engine.settings.history()
    }

    /// Publishes a new settings version. Accruals already booked keep their version.
    pub fn update_settings(
        &self,
        update: &SettingsUpdate,
    ) -> Result<Arc<SettingsVersion>, LedgerError> {
        let engine = self.engine;
        let version = engine
            .settings
            .update(update, &self.admin_id, engine.now(), |version| {
                engine.emit(&[LedgerChange::Settings(version.clone())])
            })
            .map_err(|err| {
                tracing::info!(admin = %self.admin_id, error = %err, "settings update refused");
                LedgerError::from(err)
            })?;
        tracing::info!(
            admin = %self.admin_id,
            version = version.version,
            is_active = version.settings.is_active,
            "referral settings updated"
        );
        Ok(version)
    }

    /// Referrals newest first, filtered by status. The summary always covers every referral.
    pub async fn list_referrals(
        &self,
        status: Option<ReferralStatus>,
        page: PageRequest,
    ) -> AdminReferralList {
        let (page, limit) = page.normalized();
        let state = self.engine.state.read().await;
        let mut summary = StatusSummary::default();
        for referral in state.referrals() {
            summary.count(referral.status);
        }
        let matching: Vec<&Referral> = state
            .referrals()
            .rev()
            .filter(|referral| status.map_or(true, |status| referral.status == status))
            .collect();
        let pagination = Pagination::new(page, limit, matching.len());
        let referrals = matching
            .into_iter()
            .skip(pagination.offset())
            .take(limit)
            .cloned()
            .collect();
        AdminReferralList {
            referrals,
            summary,
            pagination,
        }
    }

    pub async fn list_payouts(
        &self,
        status: Option<PayoutStatus>,
        page: PageRequest,
    ) -> AdminPayoutList {
        let (page, limit) = page.normalized();
        let state = self.engine.state.read().await;
        let matching: Vec<&PayoutRequest> = state
            .payouts()
            .rev()
            .filter(|payout| status.map_or(true, |status| payout.status == status))
            .collect();
        let pagination = Pagination::new(page, limit, matching.len());
        let payout_requests = matching
            .into_iter()
            .skip(pagination.offset())
            .take(limit)
            .cloned()
            .collect();
        AdminPayoutList {
            payout_requests,
            pagination,
        }
    }

    pub async fn resolve_payout(
        &self,
        payout_id: PayoutId,
        resolution: PayoutResolution,
    ) -> Result<PayoutRequest, LedgerError> {
        tracing::info!(payout_id, admin = %self.admin_id, status = %resolution.status, "admin payout resolution");
        self.engine.resolve_payout(payout_id, resolution).await
    }

    /// Runs `apply` on a copy of the referral under the referrer and referral locks. `Ok(None)`
    /// means nothing changed and the stored referral is returned as is.
    async fn edit<F>(&self, referral_id: ReferralId, apply: F) -> Result<Referral, LedgerError>
    where
        F: FnOnce(&LedgerState, &mut Referral, u64) -> Result<Option<Staged>, LedgerError>,
    {
        let engine = self.engine;
        let referrer_id = engine.referral(referral_id).await?.referrer_id;
        let _referrer = engine.referrer_locks.lock(&referrer_id).await;
        let _referral = engine.referral_locks.lock(&referral_id).await;
        let now = engine.now();
        let mut state = engine.state.write().await;
        let mut referral = state
            .referral(referral_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("referral", referral_id))?;
        let Some(staged) = apply(&*state, &mut referral, now)? else {
            return Ok(referral);
        };
        let changes = state.commit(staged, now)?;
        engine.emit(&changes);
        Ok(referral)
    }
}

