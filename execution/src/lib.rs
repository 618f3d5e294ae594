//! Referral ledger engine.
//!
//! Attributes signups to referrers, accrues commission from billing notifications, reserves
//! commission for payouts and exposes the administrator review operations. The HTTP service in
//! `referral-ledger-server` is a thin layer over [`Engine`].
//!
//! ## Ledger invariants
//! - `total_commission_cents` equals the sum of the referral's non-reversed commission events.
//! - No commission event exists while a referral is `pending`; at most `max_months` monthly
//!   events are ever booked.
//! - Commission events are append-only; the only later change is being marked reversed.
//! - A payout reservation never exceeds the referrer's available balance at reservation time.
//!
//! Every mutation validates the invariants on the projected ledger and fails with
//! [`LedgerError::Inconsistent`] without writing anything when they do not hold.
//!
//! ## Example
//! ```rust,ignore
//! use referral_ledger_execution::{Engine, EngineConfig, ReferrerProfile};
//!
//! # async fn example() -> Result<(), referral_ledger_execution::LedgerError> {
//! let engine = Engine::new(EngineConfig::default());
//! let code = engine.my_code(&"alice".to_string(), &ReferrerProfile::default())?;
//! // Billing reports the signup and payments through `attribute_signup` / `record_payment`.
//! # Ok(())
//! # }
//! ```

mod accrual;
mod admin;
mod clock;
mod codes;
mod engine;
mod error;
mod fraud;
mod identity;
mod locks;
mod payouts;
mod settings;
mod state;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;


pub use accrual::SELF_REFERRAL_REASON;
pub use admin::{AdminGateway, PageRequest};
pub use clock::{Clock, SystemClock};
pub use codes::{normalize_code, CodeRecord, CodeRegistry, ReferrerProfile};
pub use engine::{Engine, EngineConfig};
pub use error::LedgerError;
pub use fraud::{FraudCollector, FraudConfig};
pub use identity::{email_domain, normalize_email, Caller, EmailIdentityResolver, IdentityResolver, Role};
pub use locks::KeyedLocks;
pub use payouts::{DisbursementClient, LoggingDisbursement};
pub use settings::SettingsStore;
pub use state::{Balance, LedgerChange, LedgerSink, LedgerSnapshot, LedgerState, NoopSink};
