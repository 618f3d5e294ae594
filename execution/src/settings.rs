use referral_ledger_types::{ReferralSettings, SettingsError, SettingsUpdate, SettingsVersion, UserId};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Append-only history of settings versions.
///
/// Readers take an `Arc` snapshot, so a computation keeps the version it started with even if an
/// administrator publishes a new one concurrently.
pub struct SettingsStore {
    versions: RwLock<Vec<Arc<SettingsVersion>>>,
}

impl SettingsStore {
    pub fn new(initial: ReferralSettings, effective_at: u64) -> Self {
        Self {
            versions: RwLock::new(vec![Arc::new(SettingsVersion {
                version: 1,
                effective_at,
                updated_by: None,
                settings: initial,
            })]),
        }
    }

    /// Replaces the history with persisted versions (ignored when empty).
    pub fn restore(&self, mut versions: Vec<SettingsVersion>) {
        if versions.is_empty() {
            return;
        }
        versions.sort_by_key(|version| version.version);
        *self.write() = versions.into_iter().map(Arc::new).collect();
    }

    pub fn current(&self) -> Arc<SettingsVersion> {
        let versions = self.read();
        versions
            .last()
            .cloned()
            .unwrap_or_else(|| Arc::new(default_version()))
    }

    /// Version in effect at `ts`; timestamps before the first version map to the first.
    pub fn at(&self, ts: u64) -> Arc<SettingsVersion> {
        let versions = self.read();
        versions
            .iter()
            .rev()
            .find(|version| version.effective_at <= ts)
            .or_else(|| versions.first())
            .cloned()
            .unwrap_or_else(|| Arc::new(default_version()))
    }

    pub fn get(&self, version: u64) -> Option<Arc<SettingsVersion>> {
        self.read()
            .iter()
            .find(|candidate| candidate.version == version)
            .cloned()
    }

    pub fn history(&self) -> Vec<SettingsVersion> {
        self.read().iter().map(|version| (**version).clone()).collect()
    }

    /// Validates `update` against the current version and publishes the result as a new version.
    /// `on_publish` runs while the store is still locked so observers see versions in order.
    pub fn update(
        &self,
        update: &SettingsUpdate,
        updated_by: &UserId,
        now: u64,
        on_publish: impl FnOnce(&SettingsVersion),
    ) -> Result<Arc<SettingsVersion>, SettingsError> {
        let mut versions = self.write();
        let (base, number, floor) = match versions.last() {
            Some(last) => (last.settings.clone(), last.version + 1, last.effective_at),
            None => (ReferralSettings::default(), 1, 0),
        };
        let settings = update.apply(&base)?;
        let version = Arc::new(SettingsVersion {
            version: number,
            effective_at: now.max(floor),
            updated_by: Some(updated_by.clone()),
            settings,
        });
        on_publish(&version);
        versions.push(version.clone());
        Ok(version)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<SettingsVersion>>> {
        match self.versions.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("settings store lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<SettingsVersion>>> {
        match self.versions.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("settings store lock poisoned; recovering");
                poisoned.into_inner()
            }
        }
    }
}

fn default_version() -> SettingsVersion {
    SettingsVersion {
        version: 0,
        effective_at: 0,
        updated_by: None,
        settings: ReferralSettings::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_publishes_new_version() {
        let store = SettingsStore::new(ReferralSettings::default(), 100);
        let update = SettingsUpdate {
            monthly_percent: Some(20),
            ..SettingsUpdate::default()
        };
        let mut published = None;
        let version = store
            .update(&update, &"root".to_string(), 500, |v| published = Some(v.version))
            .expect("valid");
        assert_eq!(version.version, 2);
        assert_eq!(published, Some(2));
        assert_eq!(store.current().settings.monthly_percent, 20);
        assert_eq!(store.history().len(), 2);
    }

    #[test]
    fn test_invalid_update_leaves_history_untouched() {
        let store = SettingsStore::new(ReferralSettings::default(), 0);
        let update = SettingsUpdate {
            monthly_percent: Some(150),
            ..SettingsUpdate::default()
        };
        assert!(store
            .update(&update, &"root".to_string(), 10, |_| {})
            .is_err());
        assert_eq!(store.current().version, 1);
    }

    #[test]
    fn test_snapshot_at_timestamp() {
        let store = SettingsStore::new(ReferralSettings::default(), 100);
        let update = SettingsUpdate {
            monthly_percent: Some(25),
            ..SettingsUpdate::default()
        };
        store
            .update(&update, &"root".to_string(), 1_000, |_| {})
            .unwrap();

        assert_eq!(store.at(50).version, 1);
        assert_eq!(store.at(999).version, 1);
        assert_eq!(store.at(1_000).version, 2);
        assert_eq!(store.at(5_000).settings.monthly_percent, 25);
        assert_eq!(store.get(1).map(|v| v.settings.monthly_percent), Some(10));
    }

    #[test]
    fn test_snapshot_survives_update() {
        let store = SettingsStore::new(ReferralSettings::default(), 0);
        let snapshot = store.current();
        let update = SettingsUpdate {
            upfront_amount_cents: Some(1),
            ..SettingsUpdate::default()
        };
        store.update(&update, &"root".to_string(), 1, |_| {}).unwrap();
        assert_eq!(snapshot.settings.upfront_amount_cents, 2_500);
        assert_eq!(store.current().settings.upfront_amount_cents, 1);
    }
}
