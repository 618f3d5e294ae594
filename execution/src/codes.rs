use rand::Rng;
use referral_ledger_types::{UserId, REFERRAL_CODE_ALPHABET, REFERRAL_CODE_LENGTH};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Attempts at drawing an unused code before giving up.
const MAX_CODE_ATTEMPTS: usize = 32;

/// A referrer's code plus the contact details fraud checks compare signups against.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeRecord {
    pub code: String,
    pub referrer_id: UserId,
    pub email: Option<String>,
    pub last_ip: Option<String>,
    pub created_at: u64,
}

/// What the identity collaborator knows about the referrer at request time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReferrerProfile {
    pub email: Option<String>,
    pub ip: Option<String>,
}

#[derive(Default)]
struct CodeBook {
    by_code: HashMap<String, CodeRecord>,
    by_user: HashMap<UserId, String>,
}

#[derive(Default)]
pub struct CodeRegistry {
    book: RwLock<CodeBook>,
}

impl CodeRegistry {
    pub fn restore(&self, records: Vec<CodeRecord>) {
        let mut book = self.write();
        for record in records {
            book.by_user
                .insert(record.referrer_id.clone(), record.code.clone());
            book.by_code.insert(record.code.clone(), record);
        }
    }

    /// Returns the referrer's code, issuing one on first use. Profile details refresh the record.
    /// `on_change` runs under the registry lock whenever the record was created or modified.
    pub fn get_or_issue(
        &self,
        referrer_id: &UserId,
        profile: &ReferrerProfile,
        now: u64,
        rng: &mut impl Rng,
        on_change: impl FnOnce(&CodeRecord),
    ) -> Option<CodeRecord> {
        let mut book = self.write();
        if let Some(code) = book.by_user.get(referrer_id).cloned() {
            let record = book.by_code.get_mut(&code)?;
            let mut changed = false;
            if profile.email.is_some() && record.email != profile.email {
                record.email = profile.email.clone();
                changed = true;
            }
            if profile.ip.is_some() && record.last_ip != profile.ip {
                record.last_ip = profile.ip.clone();
                changed = true;
            }
            if changed {
                on_change(record);
            }
            return Some(record.clone());
        }

        let code = (0..MAX_CODE_ATTEMPTS)
            .map(|_| generate_code(rng))
            .find(|candidate| !book.by_code.contains_key(candidate))?;
        let record = CodeRecord {
            code: code.clone(),
            referrer_id: referrer_id.clone(),
            email: profile.email.clone(),
            last_ip: profile.ip.clone(),
            created_at: now,
        };
        on_change(&record);
        book.by_user.insert(referrer_id.clone(), code.clone());
        book.by_code.insert(code, record.clone());
        tracing::info!(referrer = %referrer_id, code = %record.code, "referral code issued");
        Some(record)
    }

    pub fn resolve(&self, code: &str) -> Option<CodeRecord> {
        let code = normalize_code(code);
        self.read().by_code.get(&code).cloned()
    }

    pub fn code_of(&self, referrer_id: &str) -> Option<CodeRecord> {
        let book = self.read();
        let code = book.by_user.get(referrer_id)?;
        book.by_code.get(code).cloned()
    }

    pub fn records(&self) -> Vec<CodeRecord> {
        let mut records: Vec<CodeRecord> = self.read().by_code.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.code.cmp(&b.code)));
        records
    }

    fn read(&self) -> RwLockReadGuard<'_, CodeBook> {
        match self.book.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("code registry lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, CodeBook> {
        match self.book.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("code registry lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

fn generate_code(rng: &mut impl Rng) -> String {
    (0..REFERRAL_CODE_LENGTH)
        .map(|_| REFERRAL_CODE_ALPHABET[rng.gen_range(0..REFERRAL_CODE_ALPHABET.len())] as char)
        .collect()
}
