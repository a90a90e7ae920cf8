//! Content priority levels.

use serde::{Deserialize, Deserializer, Serialize};

/// Scheduling priority of an outgoing message. Lower is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    /// Number of distinct levels.
    pub const LEVELS: usize = 8;

    /// Protocol control, groups and accounts.
    pub const HIGH: Self = Self(0);

    /// Ordinary maps, lists and streams.
    pub const MEDIUM: Self = Self(3);

    /// Binary streams.
    pub const LOW: Self = Self(6);

    /// Create a priority, clamping to the lowest level.
    pub fn new(level: u8) -> Self {
        Self(level.min(Self::LEVELS as u8 - 1))
    }

    /// The level as a queue index.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn level(self) -> u8 {
        self.0
    }

    /// Whether receivers should treat this as low-priority content.
    pub fn is_low(self) -> bool {
        self >= Self::LOW
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u8::deserialize(deserializer).map(Priority::new)
    }
}
