use referral_ledger_types::{
    api::{PayoutHistoryResponse, PayoutRequestBody, PayoutResolution, PayoutSummary},
    EventId, PayoutId, PayoutRequest, PayoutStatus, ReferralId, ReferralStatus, MAX_REASON_LENGTH,
};
use std::collections::BTreeMap;

use crate::engine::Engine;
use crate::error::LedgerError;
use crate::state::Staged;

/// Outbound side of the payment rail. Receives every payout request once it has been reserved.
pub trait DisbursementClient: Send + Sync {
    fn submit(&self, payout: &PayoutRequest);
}

/// Default client: records the request and leaves transmission to an operator.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingDisbursement;

impl DisbursementClient for LoggingDisbursement {
    fn submit(&self, payout: &PayoutRequest) {
        tracing::info!(
            payout_id = payout.id,
            referrer = %payout.referrer_id,
            amount_cents = payout.amount_cents,
            method = ?payout.payment_method,
            "payout awaiting disbursement"
        );
    }
}

impl Engine {
    /// Reserves commission for a payout. The whole available balance is requested when
    /// `amount_cents` is omitted.
    pub async fn request_payout(
        &self,
        referrer_id: &str,
        body: PayoutRequestBody,
    ) -> Result<PayoutRequest, LedgerError> {
        let payment_email = body
            .payment_email
            .map(|email| email.trim().to_string())
            .filter(|email| !email.is_empty());
        match payment_email.as_deref() {
            None if body.payment_method.requires_email() => {
                return Err(LedgerError::InvalidRequest(
                    "payment_email is required for paypal payouts".to_string(),
                ));
            }
            Some(email) if !email.contains('@') => {
                return Err(LedgerError::InvalidRequest(
                    "payment_email is not a valid address".to_string(),
                ));
            }
            _ => {}
        }

        let referrer_id = referrer_id.to_string();
        let _referrer = self.referrer_locks.lock(&referrer_id).await;
        let settings = self.settings.current();
        let min_payout_cents = settings.settings.min_payout_cents;
        let now = self.now();
        let mut state = self.state.write().await;
        let available_cents = state.balance(&referrer_id).available_cents;
        let requested_cents = body.amount_cents.unwrap_or(available_cents);
        let insufficient = LedgerError::InsufficientBalance {
            available_cents,
            requested_cents,
            min_payout_cents,
        };
        if available_cents == 0
            || requested_cents == 0
            || available_cents < min_payout_cents
            || requested_cents < min_payout_cents
            || requested_cents > available_cents
        {
            tracing::info!(
                referrer = %referrer_id,
                available_cents,
                requested_cents,
                min_payout_cents,
                "payout refused"
            );
            return Err(insufficient);
        }
        let Some(allocations) = state.allocate_fifo(&referrer_id, requested_cents) else {
            tracing::warn!(referrer = %referrer_id, requested_cents, "allocation fell short of balance");
            return Err(insufficient);
        };

        let payout = PayoutRequest {
            id: state.next_payout_id(),
            referrer_id: referrer_id.clone(),
            amount_cents: requested_cents,
            status: PayoutStatus::Pending,
            payment_method: body.payment_method,
            payment_email,
            created_at: now,
            resolved_at: None,
            resolution_note: None,
            allocations,
        };
        let change = state.put_payout(payout.clone());
        drop(state);
        self.emit(&[change]);
        tracing::info!(
            payout_id = payout.id,
            referrer = %referrer_id,
            amount_cents = payout.amount_cents,
            allocations = payout.allocations.len(),
            "payout requested"
        );
        self.disbursement.submit(&payout);
        Ok(payout)
    }

    /// The referrer's payout requests, newest first.
    pub async fn payout_history(&self, referrer_id: &str) -> PayoutHistoryResponse {
        let state = self.state.read().await;
        let mut payout_requests: Vec<PayoutSummary> =
            state.payouts_of(referrer_id).map(PayoutSummary::from).collect();
        payout_requests.sort_by(|a, b| b.id.cmp(&a.id));
        PayoutHistoryResponse { payout_requests }
    }

    /// Records a disbursement outcome. Repeating the current status is a no-op. Rejection releases
    /// the reservation; released commission of rejected or clawed-back referrals is reversed.
    pub async fn resolve_payout(
        &self,
        payout_id: PayoutId,
        resolution: PayoutResolution,
    ) -> Result<PayoutRequest, LedgerError> {
        let note = resolution
            .note
            .map(|note| note.trim().to_string())
            .filter(|note| !note.is_empty());
        if note.as_ref().is_some_and(|note| note.len() > MAX_REASON_LENGTH) {
            return Err(LedgerError::InvalidRequest(format!(
                "note must be at most {MAX_REASON_LENGTH} characters"
            )));
        }

        let (referrer_id, referral_ids) = {
            let state = self.state.read().await;
            let payout = state
                .payout(payout_id)
                .ok_or_else(|| LedgerError::not_found("payout", payout_id))?;
            let referral_ids: Vec<ReferralId> = payout
                .allocations
                .iter()
                .filter_map(|allocation| state.event(allocation.event_id))
                .map(|event| event.referral_id)
                .collect();
            (payout.referrer_id.clone(), referral_ids)
        };
        let _referrer = self.referrer_locks.lock(&referrer_id).await;
        let _referrals = self.referral_locks.lock_many(&referral_ids).await;

        let now = self.now();
        let mut state = self.state.write().await;
        let mut payout = state
            .payout(payout_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found("payout", payout_id))?;
        if payout.status == resolution.status {
            tracing::debug!(payout_id, status = %payout.status, "payout already resolved");
            return Ok(payout);
        }
        if !payout.status.can_transition_to(resolution.status) {
            return Err(LedgerError::transition(
                "payout",
                payout.status,
                resolution.status,
            ));
        }
        let previous = payout.status;
        payout.status = resolution.status;
        if resolution.status.is_terminal() {
            payout.resolved_at = Some(now);
        }
        if note.is_some() {
            payout.resolution_note = note;
        }

        let mut staged = Vec::new();
        if resolution.status == PayoutStatus::Rejected {
            let remaining = state.allocations_of(&referrer_id, Some(payout_id));
            let mut released: BTreeMap<ReferralId, Vec<(EventId, u64)>> = BTreeMap::new();
            for allocation in &payout.allocations {
                let Some(event) = state.event(allocation.event_id) else {
                    continue;
                };
                let live = event.live_amount();
                let keep = remaining.get(&event.id).copied().unwrap_or(0).min(live);
                if keep == live {
                    continue;
                }
                let closed = state.referral(event.referral_id).is_some_and(|referral| {
                    matches!(
                        referral.status,
                        ReferralStatus::Rejected | ReferralStatus::ClawedBack
                    )
                });
                if closed {
                    let entry = released.entry(event.referral_id).or_default();
                    if !entry.iter().any(|(id, _)| *id == event.id) {
                        entry.push((event.id, keep));
                    }
                }
            }
            for (referral_id, events) in released {
                let Some(mut referral) = state.referral(referral_id).cloned() else {
                    continue;
                };
                let mut edit = Staged::new(referral.clone());
                for (event_id, keep) in &events {
                    let live = state.event(*event_id).map_or(0, |event| event.live_amount());
                    referral.total_commission_cents = referral
                        .total_commission_cents
                        .saturating_sub(live.saturating_sub(*keep));
                    if *keep == 0 {
                        edit.reversed.push(*event_id);
                    } else {
                        edit.trimmed.push((*event_id, *keep));
                    }
                }
                tracing::info!(
                    referral_id,
                    events = events.len(),
                    remaining_cents = referral.total_commission_cents,
                    "released commission of closed referral reversed"
                );
                edit.referral = referral;
                staged.push(edit);
            }
        }

        let mut changes = state.commit_all(staged, now)?;
        changes.push(state.put_payout(payout.clone()));
        self.emit(&changes);
        tracing::info!(
            payout_id,
            referrer = %referrer_id,
            from = %previous,
            to = %payout.status,
            "payout resolved"
        );
        Ok(payout)
    }
}
