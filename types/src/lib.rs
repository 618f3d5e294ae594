//! Referral ledger domain types.
//!
//! Defines settings, referral, commission and payout records shared by the execution engine and
//! the HTTP service, plus the JSON views exchanged with clients.

pub mod api;
mod commission;
mod constants;
mod payout;
mod referral;
mod settings;

pub use commission::*;
pub use constants::*;
pub use payout::*;
pub use referral::*;
pub use settings::*;

/// Opaque identity of a user, as issued by the identity collaborator.
pub type UserId = String;
pub type ReferralId = u64;
pub type EventId = u64;
pub type PayoutId = u64;

#[cfg(test)]
mod tests;
