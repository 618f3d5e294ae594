//! In-memory ledger tables and the atomic commit path.
//!
//! Every mutation of a referral goes through [`Staged`]: the caller edits a copy of the referral,
//! lists the commission events to append and reverse, and [`LedgerState::commit_all`] checks the
//! referral invariants against the projected ledger before anything is written. A failed check
//! leaves the tables untouched.

use referral_ledger_types::{
    Allocation, CommissionEvent, CommissionKind, EventId, PayoutId, PayoutRequest, PayoutStatus,
    Referral, ReferralId, ReferralStatus, SettingsVersion, UserId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::codes::CodeRecord;
use crate::error::LedgerError;

/// A single persisted row, emitted after every successful commit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum LedgerChange {
    Settings(SettingsVersion),
    Code(CodeRecord),
    Referral(Referral),
    Event(CommissionEvent),
    Payout(PayoutRequest),
}

/// Everything needed to rebuild an engine after a restart.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub settings: Vec<SettingsVersion>,
    pub codes: Vec<CodeRecord>,
    pub referrals: Vec<Referral>,
    pub events: Vec<CommissionEvent>,
    pub payouts: Vec<PayoutRequest>,
}

/// Receives committed changes in commit order.
pub trait LedgerSink: Send + Sync {
    fn record(&self, changes: &[LedgerChange]);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl LedgerSink for NoopSink {
    fn record(&self, _changes: &[LedgerChange]) {}
}

/// Commission to append; ids and timestamps are assigned on commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewCommission {
    pub kind: CommissionKind,
    pub amount_cents: u64,
    pub month_index: Option<u32>,
    pub payment_id: Option<String>,
    pub settings_version: u64,
}

/// A pending edit of one referral and its ledger entries.
#[derive(Clone, Debug)]
pub struct Staged {
    pub referral: Referral,
    pub appended: Vec<NewCommission>,
    pub reversed: Vec<EventId>,
    /// Events cut down to the given live amount instead of being reversed outright.
    pub trimmed: Vec<(EventId, u64)>,
    pub max_months: u32,
}

impl Staged {
    pub fn new(referral: Referral) -> Self {
        Self {
            referral,
            appended: Vec::new(),
            reversed: Vec::new(),
            trimmed: Vec::new(),
            max_months: u32::MAX,
        }
    }

    /// Caps `months_paid` at the settings version used for this accrual.
    pub fn with_cap(mut self, max_months: u32) -> Self {
        self.max_months = max_months;
        self
    }

    pub fn appended_cents(&self) -> u64 {
        self.appended
            .iter()
            .fold(0u64, |acc, new| acc.saturating_add(new.amount_cents))
    }
}

/// Money view of one referrer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Balance {
    /// Live commission on eligible and paid referrals.
    pub earned_cents: u64,
    /// Live, unallocated commission on referrals awaiting manual review.
    pub pending_review_cents: u64,
    /// Allocated to pending or processing payouts.
    pub reserved_cents: u64,
    /// Allocated to completed payouts.
    pub disbursed_cents: u64,
    /// Allocations beyond an event's live amount, including everything on reversed events.
    pub debt_cents: u64,
    pub available_cents: u64,
}

#[derive(Clone, Debug, Default)]
pub struct LedgerState {
    referrals: BTreeMap<ReferralId, Referral>,
    events: BTreeMap<EventId, CommissionEvent>,
    payouts: BTreeMap<PayoutId, PayoutRequest>,
    by_referrer: HashMap<UserId, Vec<ReferralId>>,
    by_referred: HashMap<UserId, ReferralId>,
    by_signup_ip: HashMap<String, Vec<ReferralId>>,
    events_by_referral: HashMap<ReferralId, Vec<EventId>>,
    payouts_by_referrer: HashMap<UserId, Vec<PayoutId>>,
    next_referral_id: ReferralId,
    next_event_id: EventId,
    next_payout_id: PayoutId,
}

impl LedgerState {
    /// Rebuilds tables and indexes from persisted rows.
    pub fn restore(
        referrals: Vec<Referral>,
        events: Vec<CommissionEvent>,
        payouts: Vec<PayoutRequest>,
    ) -> Self {
        let mut state = LedgerState::default();
        for referral in referrals {
            state.index_referral(&referral);
            state.next_referral_id = state.next_referral_id.max(referral.id);
            state.referrals.insert(referral.id, referral);
        }
        for event in events {
            state
                .events_by_referral
                .entry(event.referral_id)
                .or_default()
                .push(event.id);
            state.next_event_id = state.next_event_id.max(event.id);
            state.events.insert(event.id, event);
        }
        for ids in state.events_by_referral.values_mut() {
            ids.sort_unstable();
        }
        for payout in payouts {
            state
                .payouts_by_referrer
                .entry(payout.referrer_id.clone())
                .or_default()
                .push(payout.id);
            state.next_payout_id = state.next_payout_id.max(payout.id);
            state.payouts.insert(payout.id, payout);
        }
        for ids in state.payouts_by_referrer.values_mut() {
            ids.sort_unstable();
        }
        state
    }

    pub fn referral(&self, id: ReferralId) -> Option<&Referral> {
        self.referrals.get(&id)
    }

    pub fn referral_of(&self, referred_user_id: &str) -> Option<&Referral> {
        let id = self.by_referred.get(referred_user_id)?;
        self.referrals.get(id)
    }

    pub fn referrals(&self) -> impl DoubleEndedIterator<Item = &Referral> {
        self.referrals.values()
    }

    pub fn referrals_of<'a>(&'a self, referrer_id: &str) -> impl Iterator<Item = &'a Referral> {
        self.by_referrer
            .get(referrer_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.referrals.get(id))
    }

    pub fn referrals_from_ip<'a>(&'a self, ip: &str) -> impl Iterator<Item = &'a Referral> {
        self.by_signup_ip
            .get(ip)
            .into_iter()
            .flatten()
            .filter_map(|id| self.referrals.get(id))
    }

    pub fn event(&self, id: EventId) -> Option<&CommissionEvent> {
        self.events.get(&id)
    }

    pub fn events_of<'a>(
        &'a self,
        referral_id: ReferralId,
    ) -> impl Iterator<Item = &'a CommissionEvent> {
        self.events_by_referral
            .get(&referral_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.events.get(id))
    }

    pub fn payout(&self, id: PayoutId) -> Option<&PayoutRequest> {
        self.payouts.get(&id)
    }

    pub fn payouts(&self) -> impl DoubleEndedIterator<Item = &PayoutRequest> {
        self.payouts.values()
    }

    pub fn payouts_of<'a>(&'a self, referrer_id: &str) -> impl Iterator<Item = &'a PayoutRequest> {
        self.payouts_by_referrer
            .get(referrer_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.payouts.get(id))
    }

    pub fn next_referral_id(&mut self) -> ReferralId {
        self.next_referral_id += 1;
        self.next_referral_id
    }

    pub fn next_payout_id(&mut self) -> PayoutId {
        self.next_payout_id += 1;
        self.next_payout_id
    }

    /// Allocated cents per event across payouts that still hold funds, optionally ignoring one
    /// payout (used to project a rejection before it is written).
    pub fn allocations_of(
        &self,
        referrer_id: &str,
        ignoring: Option<PayoutId>,
    ) -> HashMap<EventId, u64> {
        let mut allocated: HashMap<EventId, u64> = HashMap::new();
        for payout in self.payouts_of(referrer_id) {
            if !payout.holds_funds() || Some(payout.id) == ignoring {
                continue;
            }
            for allocation in &payout.allocations {
                let entry = allocated.entry(allocation.event_id).or_default();
                *entry = entry.saturating_add(allocation.amount_cents);
            }
        }
        allocated
    }

    /// Cents of one referral's commission allocated to completed payouts.
    pub fn disbursed_for(&self, referral_id: ReferralId) -> u64 {
        let Some(referral) = self.referrals.get(&referral_id) else {
            return 0;
        };
        self.payouts_of(&referral.referrer_id)
            .filter(|payout| payout.status == PayoutStatus::Completed)
            .flat_map(|payout| payout.allocations.iter())
            .filter(|allocation| {
                self.events
                    .get(&allocation.event_id)
                    .is_some_and(|event| event.referral_id == referral_id)
            })
            .fold(0u64, |acc, allocation| {
                acc.saturating_add(allocation.amount_cents)
            })
    }

    pub fn balance(&self, referrer_id: &str) -> Balance {
        let mut balance = Balance::default();
        for payout in self.payouts_of(referrer_id) {
            let sum = payout
                .allocations
                .iter()
                .fold(0u64, |acc, allocation| acc.saturating_add(allocation.amount_cents));
            match payout.status {
                PayoutStatus::Pending | PayoutStatus::Processing => {
                    balance.reserved_cents = balance.reserved_cents.saturating_add(sum)
                }
                PayoutStatus::Completed => {
                    balance.disbursed_cents = balance.disbursed_cents.saturating_add(sum)
                }
                PayoutStatus::Rejected => {}
            }
        }

        let allocated = self.allocations_of(referrer_id, None);
        let mut free = 0u64;
        for referral in self.referrals_of(referrer_id) {
            for event in self.events_of(referral.id) {
                let used = allocated.get(&event.id).copied().unwrap_or(0);
                let live = event.live_amount();
                balance.debt_cents = balance
                    .debt_cents
                    .saturating_add(used.saturating_sub(live));
                if event.reversed || !referral.status.is_payable() {
                    continue;
                }
                balance.earned_cents = balance.earned_cents.saturating_add(live);
                let unallocated = live.saturating_sub(used);
                if referral.needs_manual_review {
                    balance.pending_review_cents =
                        balance.pending_review_cents.saturating_add(unallocated);
                } else {
                    free = free.saturating_add(unallocated);
                }
            }
        }
        balance.available_cents = free.saturating_sub(balance.debt_cents);
        balance
    }

    /// Live commission on payable referrals not yet disbursed. Drives the review threshold.
    pub fn unpaid_commission(&self, referrer_id: &str) -> u64 {
        let balance = self.balance(referrer_id);
        balance.earned_cents.saturating_sub(balance.disbursed_cents)
    }

    /// Oldest-first allocation of `amount` over the referrer's free commission. Returns `None`
    /// when the free commission does not cover the amount.
    pub fn allocate_fifo(&self, referrer_id: &str, amount: u64) -> Option<Vec<Allocation>> {
        let allocated = self.allocations_of(referrer_id, None);
        let mut payable: Vec<&CommissionEvent> = self
            .referrals_of(referrer_id)
            .filter(|referral| referral.status.is_payable() && !referral.needs_manual_review)
            .flat_map(|referral| self.events_of(referral.id))
            .filter(|event| !event.reversed)
            .collect();
        payable.sort_by_key(|event| (event.created_at, event.id));

        let mut remaining = amount;
        let mut allocations = Vec::new();
        for event in payable {
            if remaining == 0 {
                break;
            }
            let used = allocated.get(&event.id).copied().unwrap_or(0);
            let free = event.live_amount().saturating_sub(used);
            if free == 0 {
                continue;
            }
            let take = free.min(remaining);
            allocations.push(Allocation {
                event_id: event.id,
                amount_cents: take,
            });
            remaining -= take;
        }
        (remaining == 0).then_some(allocations)
    }

    /// Validates every staged edit against its projected ledger, then applies all of them.
    pub fn commit_all(
        &mut self,
        staged: Vec<Staged>,
        now: u64,
    ) -> Result<Vec<LedgerChange>, LedgerError> {
        let mut next_event_id = self.next_event_id;
        let mut planned = Vec::with_capacity(staged.len());
        for edit in staged {
            let referral_id = edit.referral.id;
            let mut projected: Vec<CommissionEvent> = self.events_of(referral_id).cloned().collect();
            let mut touched = Vec::new();
            for event in projected.iter_mut() {
                if event.reversed {
                    continue;
                }
                if edit.reversed.contains(&event.id) {
                    event.reversed = true;
                    event.reversed_at = Some(now);
                    touched.push(event.clone());
                } else if let Some((_, keep)) = edit.trimmed.iter().find(|(id, _)| *id == event.id)
                {
                    if *keep < event.live_amount() {
                        event.reversed_cents = event.amount_cents.saturating_sub(*keep);
                        event.reversed_at = Some(now);
                        touched.push(event.clone());
                    }
                }
            }
            for new in &edit.appended {
                next_event_id += 1;
                let event = CommissionEvent {
                    id: next_event_id,
                    referral_id,
                    referrer_id: edit.referral.referrer_id.clone(),
                    kind: new.kind,
                    amount_cents: new.amount_cents,
                    month_index: new.month_index,
                    payment_id: new.payment_id.clone(),
                    settings_version: new.settings_version,
                    created_at: now,
                    reversed_cents: 0,
                    reversed: false,
                    reversed_at: None,
                };
                projected.push(event.clone());
                touched.push(event);
            }
            edit.referral
                .validate_invariants(projected.iter(), edit.max_months)
                .map_err(|source| {
                    tracing::error!(referral_id, error = %source, "ledger invariant violated");
                    LedgerError::Inconsistent {
                        referral_id,
                        source,
                    }
                })?;
            planned.push((edit.referral, touched));
        }

        self.next_event_id = next_event_id;
        let mut changes = Vec::new();
        for (referral, touched) in planned {
            for event in touched {
                let ids = self.events_by_referral.entry(event.referral_id).or_default();
                if !ids.contains(&event.id) {
                    ids.push(event.id);
                }
                self.events.insert(event.id, event.clone());
                changes.push(LedgerChange::Event(event));
            }
            if !self.referrals.contains_key(&referral.id) {
                self.index_referral(&referral);
            }
            self.referrals.insert(referral.id, referral.clone());
            changes.push(LedgerChange::Referral(referral));
        }
        Ok(changes)
    }

    pub fn commit(&mut self, staged: Staged, now: u64) -> Result<Vec<LedgerChange>, LedgerError> {
        self.commit_all(vec![staged], now)
    }

    pub fn put_payout(&mut self, payout: PayoutRequest) -> LedgerChange {
        if !self.payouts.contains_key(&payout.id) {
            self.payouts_by_referrer
                .entry(payout.referrer_id.clone())
                .or_default()
                .push(payout.id);
        }
        self.payouts.insert(payout.id, payout.clone());
        LedgerChange::Payout(payout)
    }

    fn index_referral(&mut self, referral: &Referral) {
        self.by_referrer
            .entry(referral.referrer_id.clone())
            .or_default()
            .push(referral.id);
        self.by_referred
            .insert(referral.referred_user_id.clone(), referral.id);
        if let Some(ip) = &referral.signup_ip {
            self.by_signup_ip
                .entry(ip.clone())
                .or_default()
                .push(referral.id);
        }
    }
}

/// Pending referrals whose hold has matured and who have a qualifying payment on record.
pub fn is_release_due(referral: &Referral, hold_secs: u64, now: u64) -> bool {
    referral.status == ReferralStatus::Pending
        && referral.first_payment_at.is_some()
        && now >= referral.signup_at.saturating_add(hold_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn referral(id: ReferralId, referrer: &str, status: ReferralStatus) -> Referral {
        Referral {
            id,
            referrer_id: referrer.to_string(),
            referred_user_id: format!("referred-{id}"),
            referral_code: "ABCD2345".to_string(),
            status,
            signup_at: 0,
            signup_ip: None,
            referred_email: None,
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
            settings_version: 1,
            processed_payments: BTreeSet::new(),
            processed_reversals: BTreeSet::new(),
        }
    }

    fn upfront(amount: u64) -> NewCommission {
        NewCommission {
            kind: CommissionKind::Upfront,
            amount_cents: amount,
            month_index: None,
            payment_id: Some("pay-1".to_string()),
            settings_version: 1,
        }
    }

    fn seeded(amount: u64) -> LedgerState {
        let mut state = LedgerState::default();
        let id = state.next_referral_id();
        let mut record = referral(id, "alice", ReferralStatus::Eligible);
        record.upfront_paid = true;
        record.total_commission_cents = amount;
        let mut staged = Staged::new(record);
        staged.appended.push(upfront(amount));
        state.commit(staged, 10).expect("commit");
        state
    }

    #[test]
    fn test_commit_assigns_ids_and_indexes() {
        let state = seeded(2_500);
        let stored = state.referral_of("referred-1").expect("indexed");
        assert_eq!(stored.total_commission_cents, 2_500);
        let events: Vec<_> = state.events_of(stored.id).collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, 1);
        assert_eq!(events[0].created_at, 10);
        assert_eq!(state.balance("alice").available_cents, 2_500);
    }

    #[test]
    fn test_commit_rejects_total_mismatch_atomically() {
        let mut state = LedgerState::default();
        let first = referral(state.next_referral_id(), "alice", ReferralStatus::Eligible);
        let mut bad = referral(state.next_referral_id(), "alice", ReferralStatus::Eligible);
        bad.total_commission_cents = 1;
        let mut good = Staged::new(first);
        good.referral.total_commission_cents = 100;
        good.appended.push(upfront(100));

        let err = state
            .commit_all(vec![good, Staged::new(bad)], 5)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Inconsistent { referral_id: 2, .. }));
        assert!(state.referral(1).is_none());
        assert_eq!(state.events_of(1).count(), 0);
    }

    #[test]
    fn test_commit_rejects_commission_while_pending() {
        let mut state = LedgerState::default();
        let mut pending = referral(state.next_referral_id(), "alice", ReferralStatus::Pending);
        pending.total_commission_cents = 100;
        let mut staged = Staged::new(pending);
        staged.appended.push(upfront(100));
        assert!(state.commit(staged, 1).is_err());
    }

    #[test]
    fn test_fifo_allocation_and_reservation() {
        let mut state = seeded(2_500);
        let mut second = referral(state.next_referral_id(), "alice", ReferralStatus::Eligible);
        second.total_commission_cents = 4_000;
        let mut staged = Staged::new(second);
        staged.appended.push(upfront(4_000));
        state.commit(staged, 20).expect("commit");

        let allocations = state.allocate_fifo("alice", 3_000).expect("covered");
        assert_eq!(
            allocations,
            vec![
                Allocation {
                    event_id: 1,
                    amount_cents: 2_500
                },
                Allocation {
                    event_id: 2,
                    amount_cents: 500
                },
            ]
        );
        assert!(state.allocate_fifo("alice", 6_501).is_none());

        let id = state.next_payout_id();
        state.put_payout(PayoutRequest {
            id,
            referrer_id: "alice".to_string(),
            amount_cents: 3_000,
            status: PayoutStatus::Pending,
            payment_method: referral_ledger_types::PaymentMethod::Stripe,
            payment_email: None,
            created_at: 30,
            resolved_at: None,
            resolution_note: None,
            allocations,
        });
        let balance = state.balance("alice");
        assert_eq!(balance.reserved_cents, 3_000);
        assert_eq!(balance.available_cents, 3_500);
        assert_eq!(balance.earned_cents, 6_500);
    }

    #[test]
    fn test_reversed_allocation_becomes_debt() {
        let mut state = seeded(6_000);
        let allocations = state.allocate_fifo("alice", 6_000).expect("covered");
        let id = state.next_payout_id();
        state.put_payout(PayoutRequest {
            id,
            referrer_id: "alice".to_string(),
            amount_cents: 6_000,
            status: PayoutStatus::Completed,
            payment_method: referral_ledger_types::PaymentMethod::Stripe,
            payment_email: None,
            created_at: 30,
            resolved_at: Some(31),
            resolution_note: None,
            allocations,
        });

        let mut clawed = state.referral(1).cloned().expect("referral");
        clawed.total_commission_cents = 0;
        let mut staged = Staged::new(clawed);
        staged.reversed.push(1);
        state.commit(staged, 40).expect("commit");

        let balance = state.balance("alice");
        assert_eq!(balance.debt_cents, 6_000);
        assert_eq!(balance.available_cents, 0);
        assert_eq!(state.disbursed_for(1), 6_000);
    }

    #[test]
    fn test_trim_keeps_allocated_share_live() {
        let mut state = seeded(6_000);
        let allocations = state.allocate_fifo("alice", 5_000).expect("covered");
        let id = state.next_payout_id();
        state.put_payout(PayoutRequest {
            id,
            referrer_id: "alice".to_string(),
            amount_cents: 5_000,
            status: PayoutStatus::Completed,
            payment_method: referral_ledger_types::PaymentMethod::Stripe,
            payment_email: None,
            created_at: 30,
            resolved_at: Some(31),
            resolution_note: None,
            allocations,
        });

        let mut mismatched = state.referral(1).cloned().expect("referral");
        mismatched.total_commission_cents = 6_000;
        let mut staged = Staged::new(mismatched);
        staged.trimmed.push((1, 5_000));
        assert!(state.commit(staged, 40).is_err());

        let mut rejected = state.referral(1).cloned().expect("referral");
        rejected.status = ReferralStatus::Rejected;
        rejected.total_commission_cents = 5_000;
        let mut staged = Staged::new(rejected);
        staged.trimmed.push((1, 5_000));
        let changes = state.commit(staged, 41).expect("commit");
        assert!(matches!(
            &changes[0],
            LedgerChange::Event(event) if event.reversed_cents == 1_000 && !event.reversed
        ));

        let event = state.event(1).expect("event");
        assert_eq!(event.live_amount(), 5_000);
        assert_eq!(event.reversed_at, Some(41));
        let balance = state.balance("alice");
        assert_eq!(balance.debt_cents, 0);
        assert_eq!(balance.available_cents, 0);
        assert_eq!(state.disbursed_for(1), 5_000);
    }

    #[test]
    fn test_review_commission_is_not_available() {
        let mut state = seeded(2_500);
        let mut flagged = state.referral(1).cloned().expect("referral");
        flagged.needs_manual_review = true;
        state.commit(Staged::new(flagged), 11).expect("commit");
        let balance = state.balance("alice");
        assert_eq!(balance.available_cents, 0);
        assert_eq!(balance.pending_review_cents, 2_500);
        assert!(state.allocate_fifo("alice", 1).is_none());
    }

    #[test]
    fn test_restore_rebuilds_indexes_and_counters() {
        let state = seeded(2_500);
        let referrals: Vec<_> = state.referrals().cloned().collect();
        let events: Vec<_> = state.events.values().cloned().collect();
        let mut restored = LedgerState::restore(referrals, events, Vec::new());
        assert_eq!(restored.referrals_of("alice").count(), 1);
        assert_eq!(restored.balance("alice").available_cents, 2_500);
        assert_eq!(restored.next_referral_id(), 2);
    }

    #[test]
    fn test_release_due() {
        let mut pending = referral(1, "alice", ReferralStatus::Pending);
        assert!(!is_release_due(&pending, 100, 1_000));
        pending.first_payment_at = Some(5);
        assert!(!is_release_due(&pending, 100, 99));
        assert!(is_release_due(&pending, 100, 100));
    }
}
