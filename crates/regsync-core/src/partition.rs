//! Partition identifiers
//!
//! A partition is one jurisdiction (a state or territory) processed
//! independently. Sequential rebuild-all mode walks partitions in
//! [`DEFAULT_PARTITION_ORDER`] (or a configured override) so each finished
//! partition knows which one to hand off to.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Declared processing order for sequential rebuilds.
pub const DEFAULT_PARTITION_ORDER: &[&str] = &[
    "AL", "AK", "AZ", "AR", "CA", "CO", "CT", "DE", "DC", "FL", "GA", "HI", "ID", "IL", "IN",
    "IA", "KS", "KY", "LA", "ME", "MD", "MA", "MI", "MN", "MS", "MO", "MT", "NE", "NV", "NH",
    "NJ", "NM", "NY", "NC", "ND", "OH", "OK", "OR", "PA", "PR", "RI", "SC", "SD", "TN", "TX",
    "UT", "VT", "VA", "WA", "WV", "WI", "WY",
];

/// Upper-cased jurisdiction code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionId(String);

impl PartitionId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionId {
    fn from(s: &str) -> Self {
        PartitionId::new(s)
    }
}

/// The partition after `current` in `order`, or `None` when `current` is the
/// last one (or not listed at all).
pub fn next_in_order<'a>(order: &'a [PartitionId], current: &PartitionId) -> Option<&'a PartitionId> {
    let position = order.iter().position(|p| p == current)?;
    order.get(position + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_id_is_normalized() {
        assert_eq!(PartitionId::new(" tx ").as_str(), "TX");
        assert_eq!(PartitionId::from("ca"), PartitionId::new("CA"));
    }

    #[test]
    fn test_next_in_order() {
        let order: Vec<PartitionId> = ["CA", "NY", "TX"].iter().map(PartitionId::new).collect();
        assert_eq!(
            next_in_order(&order, &PartitionId::new("NY")),
            Some(&PartitionId::new("TX"))
        );
        assert_eq!(next_in_order(&order, &PartitionId::new("TX")), None);
        assert_eq!(next_in_order(&order, &PartitionId::new("WA")), None);
    }

    #[test]
    fn test_default_order_has_no_duplicates() {
        let mut seen = std::collections::HashSet::new();
        for p in DEFAULT_PARTITION_ORDER {
            assert!(seen.insert(*p), "duplicate partition {p}");
        }
    }
}
