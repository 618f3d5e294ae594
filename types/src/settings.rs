use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::{
    UserId, DEFAULT_AUTO_APPROVE_UNDER_CENTS, DEFAULT_HOLD_DAYS, DEFAULT_MAX_MONTHS,
    DEFAULT_MIN_PAYOUT_CENTS, DEFAULT_MONTHLY_PERCENT, DEFAULT_UPFRONT_AMOUNT_CENTS,
    SECONDS_PER_DAY,
};

#[derive(Debug, ThisError, PartialEq, Eq)]
pub enum SettingsError {
    #[error("{field} must be >= 0 (got={got})")]
    Negative { field: &'static str, got: i64 },
    #[error("{field} is too large (got={got})")]
    OutOfRange { field: &'static str, got: i64 },
    #[error("monthly_percent must be within 0..=100 (got={got})")]
    PercentOutOfRange { got: i64 },
    #[error("max_months must be >= 1")]
    MaxMonthsZero,
}

/// Program-wide commission rules.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralSettings {
    pub upfront_amount_cents: u64,
    pub monthly_percent: u32,
    pub max_months: u32,
    pub hold_days: u32,
    pub min_payout_cents: u64,
    pub auto_approve_under_cents: u64,
    pub is_active: bool,
}

impl Default for ReferralSettings {
    fn default() -> Self {
        Self {
            upfront_amount_cents: DEFAULT_UPFRONT_AMOUNT_CENTS,
            monthly_percent: DEFAULT_MONTHLY_PERCENT,
            max_months: DEFAULT_MAX_MONTHS,
            hold_days: DEFAULT_HOLD_DAYS,
            min_payout_cents: DEFAULT_MIN_PAYOUT_CENTS,
            auto_approve_under_cents: DEFAULT_AUTO_APPROVE_UNDER_CENTS,
            is_active: true,
        }
    }
}

impl ReferralSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.monthly_percent > 100 {
            return Err(SettingsError::PercentOutOfRange {
                got: self.monthly_percent as i64,
            });
        }
        if self.max_months == 0 {
            return Err(SettingsError::MaxMonthsZero);
        }
        Ok(())
    }

    pub fn hold_secs(&self) -> u64 {
        (self.hold_days as u64).saturating_mul(SECONDS_PER_DAY)
    }

    /// Monthly commission for a payment, rounded half-up to the nearest cent.
    pub fn monthly_commission(&self, payment_cents: u64) -> u64 {
        let scaled = (payment_cents as u128) * (self.monthly_percent as u128) + 50;
        (scaled / 100).min(u64::MAX as u128) as u64
    }
}

/// An immutable, numbered settings snapshot. Accruals record the version they used.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsVersion {
    pub version: u64,
    pub effective_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<UserId>,
    #[serde(flatten)]
    pub settings: ReferralSettings,
}

/// Admin-supplied settings payload. Signed integers so that negative input is reported as an
/// `InvalidSettings` rather than a deserialization failure; omitted fields keep their value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub upfront_amount_cents: Option<i64>,
    #[serde(default)]
    pub monthly_percent: Option<i64>,
    #[serde(default)]
    pub max_months: Option<i64>,
    #[serde(default)]
    pub hold_days: Option<i64>,
    #[serde(default)]
    pub min_payout_cents: Option<i64>,
    #[serde(default)]
    pub auto_approve_under_cents: Option<i64>,
    #[serde(default)]
    pub is_active: Option<bool>,
}

impl SettingsUpdate {
    pub fn apply(&self, base: &ReferralSettings) -> Result<ReferralSettings, SettingsError> {
        if let Some(got) = self.monthly_percent {
            if !(0..=100).contains(&got) {
                return Err(SettingsError::PercentOutOfRange { got });
            }
        }
        let next = ReferralSettings {
            upfront_amount_cents: cents(
                "upfront_amount_cents",
                self.upfront_amount_cents,
                base.upfront_amount_cents,
            )?,
            monthly_percent: count("monthly_percent", self.monthly_percent, base.monthly_percent)?,
            max_months: count("max_months", self.max_months, base.max_months)?,
            hold_days: count("hold_days", self.hold_days, base.hold_days)?,
            min_payout_cents: cents(
                "min_payout_cents",
                self.min_payout_cents,
                base.min_payout_cents,
            )?,
            auto_approve_under_cents: cents(
                "auto_approve_under_cents",
                self.auto_approve_under_cents,
                base.auto_approve_under_cents,
            )?,
            is_active: self.is_active.unwrap_or(base.is_active),
        };
        next.validate()?;
        Ok(next)
    }
}

impl From<&ReferralSettings> for SettingsUpdate {
    fn from(settings: &ReferralSettings) -> Self {
        Self {
            upfront_amount_cents: Some(settings.upfront_amount_cents as i64),
            monthly_percent: Some(settings.monthly_percent as i64),
            max_months: Some(settings.max_months as i64),
            hold_days: Some(settings.hold_days as i64),
            min_payout_cents: Some(settings.min_payout_cents as i64),
            auto_approve_under_cents: Some(settings.auto_approve_under_cents as i64),
            is_active: Some(settings.is_active),
        }
    }
}

fn cents(field: &'static str, value: Option<i64>, current: u64) -> Result<u64, SettingsError> {
    match value {
        None => Ok(current),
        Some(got) if got < 0 => Err(SettingsError::Negative { field, got }),
        Some(got) => Ok(got as u64),
    }
}

fn count(field: &'static str, value: Option<i64>, current: u32) -> Result<u32, SettingsError> {
    match value {
        None => Ok(current),
        Some(got) if got < 0 => Err(SettingsError::Negative { field, got }),
        Some(got) => u32::try_from(got).map_err(|_| SettingsError::OutOfRange { field, got }),
    }
}
