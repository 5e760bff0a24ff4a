//! Keyed, deduplicated player alerts.

use crate::types::{AlertSeverity, PlayerAlert};
use std::collections::BTreeMap;

/// Alerts keyed by origin, so a repeated problem replaces its previous
/// report instead of piling up.
#[derive(Clone, Debug, Default)]
pub struct AlertManager {
    alerts: BTreeMap<String, PlayerAlert>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the alert for `key`. Returns whether anything changed.
    pub fn set(&mut self, key: impl Into<String>, alert: PlayerAlert) -> bool {
        let key = key.into();
        if self.alerts.get(&key) == Some(&alert) {
            return false;
        }
        self.alerts.insert(key, alert);
        true
    }

    /// Returns whether an alert was removed.
    pub fn clear(&mut self, key: &str) -> bool {
        self.alerts.remove(key).is_some()
    }

    /// Remove every alert whose key starts with `prefix`.
    pub fn clear_prefix(&mut self, prefix: &str) -> bool {
        let before = self.alerts.len();
        self.alerts.retain(|key, _| !key.starts_with(prefix));
        self.alerts.len() != before
    }

    pub fn clear_all(&mut self) -> bool {
        let changed = !self.alerts.is_empty();
        self.alerts.clear();
        changed
    }

    pub fn has_errors(&self) -> bool {
        self.alerts
            .values()
            .any(|a| a.severity == AlertSeverity::Error)
    }

    /// Alerts ordered by key.
    pub fn alerts(&self) -> Vec<PlayerAlert> {
        self.alerts.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_deduplicates() {
        let mut alerts = AlertManager::new();
        assert!(alerts.set("decode:/a", PlayerAlert::warn("bad record")));
        assert!(!alerts.set("decode:/a", PlayerAlert::warn("bad record")));
        assert!(alerts.set("decode:/a", PlayerAlert::warn("another bad record")));
        assert_eq!(alerts.len(), 1);
    }

    #[test]
    fn test_clear_prefix() {
        let mut alerts = AlertManager::new();
        alerts.set("decode:/a", PlayerAlert::warn("a"));
        alerts.set("decode:/b", PlayerAlert::warn("b"));
        alerts.set("source", PlayerAlert::error("gone"));
        assert!(alerts.has_errors());

        assert!(alerts.clear_prefix("decode:"));
        assert_eq!(alerts.len(), 1);
        assert!(alerts.clear("source"));
        assert!(!alerts.has_errors());
        assert!(!alerts.clear_all());
    }
}
