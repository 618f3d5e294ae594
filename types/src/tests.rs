use super::*;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn referral(id: ReferralId, status: ReferralStatus) -> Referral {
    Referral {
        id,
        referrer_id: "alice".to_string(),
        referred_user_id: "bob".to_string(),
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

fn event(id: EventId, referral_id: ReferralId, kind: CommissionKind, amount: u64) -> CommissionEvent {
    CommissionEvent {
        id,
        referral_id,
        referrer_id: "alice".to_string(),
        kind,
        amount_cents: amount,
        month_index: (kind == CommissionKind::Monthly).then_some(1),
        payment_id: None,
        settings_version: 1,
        created_at: 0,
        reversed_cents: 0,
        reversed: false,
        reversed_at: None,
    }
}

#[test]
fn test_status_transition_table() {
    use ReferralStatus::*;
    let allowed = [
        (Pending, Eligible),
        (Pending, Rejected),
        (Eligible, Paid),
        (Eligible, Rejected),
        (Eligible, ClawedBack),
        (Paid, ClawedBack),
    ];
    for from in ReferralStatus::ALL {
        for to in ReferralStatus::ALL {
            assert_eq!(
                from.can_transition_to(to),
                allowed.contains(&(from, to)),
                "{from} -> {to}"
            );
        }
    }
}

#[test]
fn test_transition_rejects_backward_move() {
    let mut referral = referral(1, ReferralStatus::Eligible);
    let err = referral.transition(ReferralStatus::Pending).unwrap_err();
    assert_eq!(
        err,
        TransitionError {
            from: ReferralStatus::Eligible,
            to: ReferralStatus::Pending
        }
    );
    assert_eq!(referral.status, ReferralStatus::Eligible);
}

#[test]
fn test_status_serializes_snake_case() {
    let json = serde_json::to_string(&ReferralStatus::ClawedBack).unwrap();
    assert_eq!(json, "\"clawed_back\"");
    assert_eq!("clawed_back".parse::<ReferralStatus>(), Ok(ReferralStatus::ClawedBack));
    assert!("approved".parse::<ReferralStatus>().is_err());
}

#[test]
fn test_monthly_commission_rounds_half_up() {
    let settings = ReferralSettings {
        monthly_percent: 10,
        ..ReferralSettings::default()
    };
    assert_eq!(settings.monthly_commission(20_000), 2_000);
    assert_eq!(settings.monthly_commission(1_005), 101);
    assert_eq!(settings.monthly_commission(1_004), 100);
    assert_eq!(settings.monthly_commission(0), 0);
}

#[test]
fn test_settings_update_keeps_omitted_fields() {
    let base = ReferralSettings::default();
    let update = SettingsUpdate {
        monthly_percent: Some(15),
        is_active: Some(false),
        ..SettingsUpdate::default()
    };
    let next = update.apply(&base).expect("valid update");
    assert_eq!(next.monthly_percent, 15);
    assert!(!next.is_active);
    assert_eq!(next.upfront_amount_cents, base.upfront_amount_cents);
    assert_eq!(next.max_months, base.max_months);
}

#[test]
fn test_settings_update_rejects_invalid_fields() {
    let base = ReferralSettings::default();
    let negative = SettingsUpdate {
        min_payout_cents: Some(-1),
        ..SettingsUpdate::default()
    };
    assert_eq!(
        negative.apply(&base),
        Err(SettingsError::Negative {
            field: "min_payout_cents",
            got: -1
        })
    );

    let percent = SettingsUpdate {
        monthly_percent: Some(101),
        ..SettingsUpdate::default()
    };
    assert_eq!(
        percent.apply(&base),
        Err(SettingsError::PercentOutOfRange { got: 101 })
    );

    let months = SettingsUpdate {
        max_months: Some(0),
        ..SettingsUpdate::default()
    };
    assert_eq!(months.apply(&base), Err(SettingsError::MaxMonthsZero));

    let huge = SettingsUpdate {
        hold_days: Some(i64::MAX),
        ..SettingsUpdate::default()
    };
    assert!(matches!(
        huge.apply(&base),
        Err(SettingsError::OutOfRange { field: "hold_days", .. })
    ));
}

#[test]
fn test_settings_update_deserializes_negative_values() {
    let update: SettingsUpdate =
        serde_json::from_str(r#"{"upfront_amount_cents": -5, "is_active": true}"#).unwrap();
    assert_eq!(update.upfront_amount_cents, Some(-5));
    assert!(update.apply(&ReferralSettings::default()).is_err());
}

#[test]
fn test_invariants_accept_consistent_referral() {
    let mut referral = referral(7, ReferralStatus::Eligible);
    let mut reversed = event(2, 7, CommissionKind::Monthly, 1_000);
    reversed.reversed = true;
    let events = vec![event(1, 7, CommissionKind::Upfront, 2_500), reversed];
    referral.total_commission_cents = 2_500;
    referral.months_paid = 1;
    referral.validate_invariants(&events, 12).expect("consistent");
}

#[test]
fn test_invariants_count_trimmed_event_remainder() {
    let mut referral = referral(7, ReferralStatus::Rejected);
    let mut trimmed = event(1, 7, CommissionKind::Upfront, 6_000);
    trimmed.reversed_cents = 1_000;
    assert_eq!(trimmed.live_amount(), 5_000);
    referral.total_commission_cents = 6_000;
    assert!(matches!(
        referral.validate_invariants([&trimmed], 12),
        Err(ReferralInvariantError::TotalMismatch { ledger: 5_000, .. })
    ));
    referral.total_commission_cents = 5_000;
    referral.validate_invariants([&trimmed], 12).expect("consistent");
}

#[test]
fn test_invariants_detect_total_mismatch() {
    let mut referral = referral(7, ReferralStatus::Eligible);
    referral.total_commission_cents = 100;
    let events = vec![event(1, 7, CommissionKind::Upfront, 2_500)];
    assert_eq!(
        referral.validate_invariants(&events, 12),
        Err(ReferralInvariantError::TotalMismatch {
            recorded: 100,
            ledger: 2_500
        })
    );
}

#[test]
fn test_invariants_detect_pending_commission_and_cap() {
    let mut pending = referral(3, ReferralStatus::Pending);
    pending.total_commission_cents = 2_500;
    let events = vec![event(1, 3, CommissionKind::Upfront, 2_500)];
    assert!(matches!(
        pending.validate_invariants(&events, 12),
        Err(ReferralInvariantError::CommissionWhilePending { .. })
    ));

    let mut capped = referral(4, ReferralStatus::Eligible);
    capped.months_paid = 3;
    assert!(matches!(
        capped.validate_invariants(std::iter::empty(), 2),
        Err(ReferralInvariantError::MonthsExceeded { .. })
    ));
}

#[test]
fn test_add_flag_deduplicates_signal() {
    let mut referral = referral(1, ReferralStatus::Pending);
    let flag = FraudFlag {
        kind: FraudFlagKind::SharedIp,
        domain: None,
        ip: Some("10.0.0.1".to_string()),
        related_referral_id: None,
        detected_at: 5,
        resolved: false,
    };
    assert!(referral.add_flag(flag.clone()));
    assert!(!referral.add_flag(FraudFlag {
        detected_at: 9,
        ..flag
    }));
    assert!(referral.has_unresolved_flags());
    referral.resolve_flags();
    assert!(!referral.has_unresolved_flags());
}

#[test]
fn test_fraud_flag_wire_format() {
    let flag = FraudFlag {
        kind: FraudFlagKind::SharedEmailDomain,
        domain: Some("acme.io".to_string()),
        ip: None,
        related_referral_id: None,
        detected_at: 42,
        resolved: false,
    };
    let value = serde_json::to_value(&flag).unwrap();
    assert_eq!(value["type"], "shared_email_domain");
    assert_eq!(value["domain"], "acme.io");
    assert!(value.get("ip").is_none());
}

#[test]
fn test_payout_status_transitions() {
    use PayoutStatus::*;
    assert!(Pending.can_transition_to(Processing));
    assert!(Processing.can_transition_to(Completed));
    assert!(Pending.can_transition_to(Rejected));
    assert!(!Completed.can_transition_to(Rejected));
    assert!(!Rejected.can_transition_to(Pending));
    assert!(Processing.is_open());
    assert!(Completed.is_terminal());
}

#[test]
fn test_pagination_offsets() {
    let pagination = api::Pagination::new(3, 20, 45);
    assert_eq!(pagination.total_pages, 3);
    assert_eq!(pagination.offset(), 40);
    assert_eq!(api::Pagination::new(1, 0, 0).total_pages, 0);
}

proptest! {
    #[test]
    fn prop_monthly_commission_never_exceeds_payment(
        payment in 0u64..10_000_000_000,
        percent in 0u32..=100,
    ) {
        let settings = ReferralSettings { monthly_percent: percent, ..ReferralSettings::default() };
        let commission = settings.monthly_commission(payment);
        prop_assert!(commission <= payment);
        if percent == 100 {
            prop_assert_eq!(commission, payment);
        }
    }

    #[test]
    fn prop_live_total_ignores_reversed(amounts in proptest::collection::vec((0u64..1_000_000, any::<bool>()), 0..32)) {
        let events: Vec<_> = amounts
            .iter()
            .enumerate()
            .map(|(idx, (amount, reversed))| {
                let mut entry = event(idx as u64, 1, CommissionKind::Monthly, *amount);
                entry.reversed = *reversed;
                entry
            })
            .collect();
        let expected: u64 = amounts.iter().filter(|(_, reversed)| !reversed).map(|(amount, _)| amount).sum();
        prop_assert_eq!(live_total(&events), expected);
    }
}
