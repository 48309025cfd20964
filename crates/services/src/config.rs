use chrono::Duration;
use domains::CollectionName;
use serde::{Deserialize, Serialize};

/// Engine-side tuning knobs. Built from `configs::VotingSettings` by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VotingConfig {
    pub rate_limits_enabled: bool,
    pub history_window_hours: i64,
    pub warning_cooldown_minutes: i64,
    pub search_indexed_collections: Vec<CollectionName>,
    pub rescore_inactive_after_days: i64,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            rate_limits_enabled: true,
            history_window_hours: 24,
            warning_cooldown_minutes: 60,
            search_indexed_collections: vec![
                CollectionName::Posts,
                CollectionName::Comments,
                CollectionName::Tags,
            ],
            rescore_inactive_after_days: 30,
        }
    }
}

impl VotingConfig {
    // Out-of-range values saturate instead of panicking; the settings layer
    // rejects them before they get here.
    pub fn history_window(&self) -> Duration {
        Duration::try_hours(self.history_window_hours).unwrap_or(Duration::MAX)
    }

    pub fn warning_cooldown(&self) -> Duration {
        Duration::try_minutes(self.warning_cooldown_minutes).unwrap_or(Duration::MAX)
    }

    pub fn inactive_after(&self) -> Duration {
        Duration::try_days(self.rescore_inactive_after_days).unwrap_or(Duration::MAX)
    }

    pub fn is_search_indexed(&self, collection: CollectionName) -> bool {
        self.search_indexed_collections.contains(&collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_huge_durations_do_not_panic() {
        let config = VotingConfig {
            history_window_hours: i64::MAX,
            warning_cooldown_minutes: i64::MAX,
            rescore_inactive_after_days: i64::MAX,
            ..VotingConfig::default()
        };
        assert_eq!(config.history_window(), Duration::MAX);
        assert_eq!(config.warning_cooldown(), Duration::MAX);
        assert_eq!(config.inactive_after(), Duration::MAX);
        assert_eq!(VotingConfig::default().history_window(), Duration::hours(24));
    }
}
