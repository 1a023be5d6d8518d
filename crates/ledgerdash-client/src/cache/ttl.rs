//! Freshness classes for cached domains.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How long a domain's cached data stays valid after a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TtlClass {
    /// 1 minute: fast-moving data (notifications, activity).
    Short,
    /// 5 minutes: working lists (deals, invoices, briefs).
    Medium,
    /// 15 minutes: slow-moving reference data (clients, team).
    Long,
    /// 1 hour: near-static data (settings, catalogs).
    VeryLong,
}

impl TtlClass {
    pub fn duration(self) -> Duration {
        match self {
            Self::Short => Duration::minutes(1),
            Self::Medium => Duration::minutes(5),
            Self::Long => Duration::minutes(15),
            Self::VeryLong => Duration::hours(1),
        }
    }

    /// `now − last_fetch < ttl`; never-fetched data is not fresh.
    pub fn is_fresh(self, last_fetch: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_fetch {
            Some(fetched_at) => now - fetched_at < self.duration(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_fetched_is_stale() {
        assert!(!TtlClass::VeryLong.is_fresh(None, Utc::now()));
    }

    #[test]
    fn test_boundary_is_exclusive() {
        let t0 = Utc::now();
        let ttl = TtlClass::Medium;
        assert!(ttl.is_fresh(Some(t0), t0 + Duration::minutes(4)));
        assert!(!ttl.is_fresh(Some(t0), t0 + Duration::minutes(5)));
        assert!(!ttl.is_fresh(Some(t0), t0 + Duration::minutes(6)));
    }

    #[test]
    fn test_durations_are_ordered() {
        assert!(TtlClass::Short.duration() < TtlClass::Medium.duration());
        assert!(TtlClass::Medium.duration() < TtlClass::Long.duration());
        assert!(TtlClass::Long.duration() < TtlClass::VeryLong.duration());
    }
}
