use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::location::Location;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// How long a cached fix can be handed out before a real fetch is needed
pub enum RefreshInterval {
    /// Never serve from cache, always fetch
    #[default]
    AlwaysFresh,
    /// Serve from cache while the fix is younger than this
    Every(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedLocation {
    pub location: Location,
    pub stored_at: Instant,
}

impl CachedLocation {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.stored_at)
    }
}

/// Holds the last fix that resolved a fetch
#[derive(Debug, Default)]
pub struct LocationCache {
    entry: Option<CachedLocation>,
}

impl LocationCache {
    pub fn read(&self) -> Option<CachedLocation> {
        self.entry
    }

    pub fn location(&self) -> Option<Location> {
        self.entry.map(|c| c.location)
    }

    /// Replace the cached fix, last write wins
    pub fn write(&mut self, location: Location, now: Instant) {
        self.entry = Some(CachedLocation {
            location,
            stored_at: now,
        });
    }

    pub fn is_fresh(&self, refresh_interval: RefreshInterval, now: Instant) -> bool {
        match (refresh_interval, self.entry) {
            (RefreshInterval::Every(interval), Some(cached)) => cached.age(now) < interval,
            _ => false,
        }
    }
}
