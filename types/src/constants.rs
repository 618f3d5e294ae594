/// Seconds in one hold day.
pub const SECONDS_PER_DAY: u64 = 86_400;

/// Length of generated referral codes.
pub const REFERRAL_CODE_LENGTH: usize = 8;

/// Alphabet used for referral codes (no 0/O/1/I to keep codes readable).
pub const REFERRAL_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Default settings applied before an administrator saves the first version.
pub const DEFAULT_UPFRONT_AMOUNT_CENTS: u64 = 2_500;
pub const DEFAULT_MONTHLY_PERCENT: u32 = 10;
pub const DEFAULT_MAX_MONTHS: u32 = 12;
pub const DEFAULT_HOLD_DAYS: u32 = 30;
pub const DEFAULT_MIN_PAYOUT_CENTS: u64 = 5_000;
pub const DEFAULT_AUTO_APPROVE_UNDER_CENTS: u64 = 10_000;

/// Maximum length accepted for free-text rejection reasons and payout notes.
pub const MAX_REASON_LENGTH: usize = 500;

/// Pagination bounds for list endpoints.
pub const DEFAULT_PAGE_LIMIT: usize = 20;
pub const MAX_PAGE_LIMIT: usize = 100;
