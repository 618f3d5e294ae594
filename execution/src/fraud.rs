//! Advisory fraud signals.
//!
//! Flags never move a referral between statuses. They are shown to administrators and any
//! unresolved flag disables auto-approval for the referral carrying it.

use referral_ledger_types::{FraudFlag, FraudFlagKind, Referral};

use crate::codes::CodeRecord;
use crate::identity::email_domain;

const DEFAULT_SHARED_IP_WINDOW_SECS: u64 = 24 * 60 * 60;
const DEFAULT_IGNORED_EMAIL_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "outlook.com",
    "hotmail.com",
    "live.com",
    "icloud.com",
    "proton.me",
    "protonmail.com",
    "aol.com",
];

#[derive(Clone, Debug)]
pub struct FraudConfig {
    /// Signups from the same IP within this many seconds of each other are flagged.
    pub shared_ip_window_secs: u64,
    /// Free-mail providers whose shared domain says nothing about the people behind it.
    pub ignored_email_domains: Vec<String>,
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            shared_ip_window_secs: DEFAULT_SHARED_IP_WINDOW_SECS,
            ignored_email_domains: DEFAULT_IGNORED_EMAIL_DOMAINS
                .iter()
                .map(|domain| domain.to_string())
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FraudCollector {
    config: FraudConfig,
}

impl FraudCollector {
    pub fn new(config: FraudConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &FraudConfig {
        &self.config
    }

    /// Collects signals for `candidate`. `same_ip` are other referrals that signed up from the
    /// candidate's IP; only those inside the window are reported.
    pub fn scan<'a>(
        &self,
        candidate: &Referral,
        referrer: &CodeRecord,
        same_ip: impl IntoIterator<Item = &'a Referral>,
        now: u64,
    ) -> Vec<FraudFlag> {
        let mut flags = Vec::new();

        if let Some(ip) = candidate.signup_ip.as_deref() {
            if referrer.last_ip.as_deref() == Some(ip) {
                flags.push(FraudFlag {
                    kind: FraudFlagKind::SharedIp,
                    domain: None,
                    ip: Some(ip.to_string()),
                    related_referral_id: None,
                    detected_at: now,
                    resolved: false,
                });
            }
            for other in same_ip {
                if other.id == candidate.id || other.signup_ip.as_deref() != Some(ip) {
                    continue;
                }
                if other.signup_at.abs_diff(candidate.signup_at) > self.config.shared_ip_window_secs {
                    continue;
                }
                flags.push(FraudFlag {
                    kind: FraudFlagKind::SharedIp,
                    domain: None,
                    ip: Some(ip.to_string()),
                    related_referral_id: Some(other.id),
                    detected_at: now,
                    resolved: false,
                });
            }
        }

        let referred_domain = candidate.referred_email.as_deref().and_then(email_domain);
        let referrer_domain = referrer.email.as_deref().and_then(email_domain);
        if let (Some(referred), Some(referrer)) = (referred_domain, referrer_domain) {
            if referred == referrer && !self.is_ignored_domain(&referred) {
                flags.push(FraudFlag {
                    kind: FraudFlagKind::SharedEmailDomain,
                    domain: Some(referred),
                    ip: None,
                    related_referral_id: None,
                    detected_at: now,
                    resolved: false,
                });
            }
        }

        flags
    }

    pub fn self_referral_flag(&self, now: u64) -> FraudFlag {
        FraudFlag {
            kind: FraudFlagKind::SelfReferral,
            domain: None,
            ip: None,
            related_referral_id: None,
            detected_at: now,
            resolved: false,
        }
    }

    fn is_ignored_domain(&self, domain: &str) -> bool {
        self.config
            .ignored_email_domains
            .iter()
            .any(|ignored| ignored.eq_ignore_ascii_case(domain))
    }
}
