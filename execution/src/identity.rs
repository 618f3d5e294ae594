use referral_ledger_types::UserId;

use crate::codes::CodeRecord;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

/// Authenticated caller, as resolved by the identity collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn user(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::User,
        }
    }

    pub fn admin(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Decides whether a referred signup is the referrer under another account.
pub trait IdentityResolver: Send + Sync {
    fn same_identity(
        &self,
        referrer: &CodeRecord,
        referred_user_id: &str,
        referred_email: Option<&str>,
    ) -> bool;
}

/// Treats accounts as the same person when ids match or emails normalize to the same mailbox.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmailIdentityResolver;

impl IdentityResolver for EmailIdentityResolver {
    fn same_identity(
        &self,
        referrer: &CodeRecord,
        referred_user_id: &str,
        referred_email: Option<&str>,
    ) -> bool {
        if referrer.referrer_id == referred_user_id {
            return true;
        }
        match (referrer.email.as_deref(), referred_email) {
            (Some(left), Some(right)) => match (normalize_email(left), normalize_email(right)) {
                (Some(left), Some(right)) => left == right,
                _ => false,
            },
            _ => false,
        }
    }
}

/// Canonical mailbox: lowercase, `+tag` removed, gmail dots ignored.
pub fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim().to_ascii_lowercase();
    let (local, domain) = email.rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    let local = local.split('+').next().unwrap_or(local);
    let (local, domain) = match domain {
        "gmail.com" | "googlemail.com" => (local.replace('.', ""), "gmail.com"),
        _ => (local.to_string(), domain),
    };
    Some(format!("{local}@{domain}"))
}

pub fn email_domain(email: &str) -> Option<String> {
    let (_, domain) = email.trim().rsplit_once('@')?;
    let domain = domain.to_ascii_lowercase();
    (!domain.is_empty()).then_some(domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(referrer: &str, email: Option<&str>) -> CodeRecord {
        CodeRecord {
            code: "ABCD2345".to_string(),
            referrer_id: referrer.to_string(),
            email: email.map(str::to_string),
            last_ip: None,
            created_at: 0,
        }
    }

    #[test]
    fn test_normalize_email() {
        assert_eq!(
            normalize_email(" John.Doe+promo@GoogleMail.com "),
            Some("johndoe@gmail.com".to_string())
        );
        assert_eq!(
            normalize_email("a.b+x@acme.io"),
            Some("a.b@acme.io".to_string())
        );
        assert_eq!(normalize_email("not-an-email"), None);
        assert_eq!(normalize_email("@acme.io"), None);
    }

    #[test]
    fn test_same_identity_by_id_or_mailbox() {
        let resolver = EmailIdentityResolver;
        let referrer = record("alice", Some("alice@gmail.com"));
        assert!(resolver.same_identity(&referrer, "alice", None));
        assert!(resolver.same_identity(&referrer, "alt", Some("a.lice+2@gmail.com")));
        assert!(!resolver.same_identity(&referrer, "bob", Some("bob@gmail.com")));
        assert!(!resolver.same_identity(&record("alice", None), "bob", Some("alice@gmail.com")));
    }

    #[test]
    fn test_email_domain() {
        assert_eq!(email_domain("x@Acme.IO"), Some("acme.io".to_string()));
        assert_eq!(email_domain("x@"), None);
    }
}
