use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::UtcDT;

/// A "part" of a location
pub type LocationComponent = f64;

/// Radius of uncertainty in meters
pub type Meters = f64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
/// A single fix as reported by a [crate::LocationProvider]
pub struct Location {
    /// Latitude
    pub lat: LocationComponent,
    /// Longitude
    pub long: LocationComponent,
    /// Horizontal accuracy radius in meters, smaller is better
    pub accuracy: Meters,
    /// When the fix was measured
    pub timestamp: UtcDT,
}

impl Location {
    /// Create a fix measured right now
    pub fn new(lat: LocationComponent, long: LocationComponent, accuracy: Meters) -> Self {
        Self {
            lat,
            long,
            accuracy,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
/// The accuracy a caller wants from a fetch
pub enum Accuracy {
    /// Whatever the provider considers its best, any fix is accepted
    Best,
    /// Only accept fixes with an accuracy radius at or below this many meters
    Within(Meters),
}

impl Accuracy {
    pub const NEAREST_TEN_METERS: Self = Self::Within(10.0);
    pub const HUNDRED_METERS: Self = Self::Within(100.0);
    pub const KILOMETER: Self = Self::Within(1000.0);
    pub const THREE_KILOMETERS: Self = Self::Within(3000.0);

    /// Check if the given fix is good enough to resolve a fetch at this accuracy
    pub fn accepts(&self, fix: &Location) -> bool {
        match self {
            Self::Best => true,
            Self::Within(radius) => fix.accuracy <= *radius,
        }
    }
}

impl Default for Accuracy {
    fn default() -> Self {
        Self::HUNDRED_METERS
    }
}
