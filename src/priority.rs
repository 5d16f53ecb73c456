//! Priority tiers for scheduled callbacks and animation jobs
//!
//! Lower variants sort first: `Critical < High < Normal < Low < Idle`.
//! The frame scheduler normally sees `Critical..=Low`; `Idle` exists for
//! background animation jobs that should only run when slots are free.

use serde::{Deserialize, Serialize};

/// Execution priority, highest first.
///
/// Derived `Ord` follows declaration order, so sorting a batch of ready
/// work ascending puts `Critical` items at the front.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Must run this frame (input response, queue pumps).
    Critical,
    /// Visible animation work.
    High,
    /// Default tier.
    #[default]
    Normal,
    /// Deferred cosmetic work.
    Low,
    /// Runs only when nothing else is waiting for a slot.
    Idle,
}

impl Priority {
    /// All tiers, highest first.
    pub const ALL: [Priority; 5] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
        Priority::Idle,
    ];

    /// Tier index, 0 = `Critical`.
    pub fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical < Priority::High);
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert!(Priority::Low < Priority::Idle);
    }

    #[test]
    fn test_sort_puts_critical_first() {
        let mut tiers = vec![Priority::Low, Priority::Critical, Priority::Normal];
        tiers.sort();
        assert_eq!(tiers[0], Priority::Critical);
        assert_eq!(tiers[2], Priority::Low);
    }

    #[test]
    fn test_index_matches_all() {
        for (i, p) in Priority::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
    }
}
