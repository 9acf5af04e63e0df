//! Recent-N Manifests
//!
//! A manifest tracks, for one (scope, brand, category), the ids of the most
//! recent source rows (`recent_ids`) and what is currently mirrored
//! downstream (`mirrored_ids`). The two lists only differ while a refresh is
//! waiting to be mirrored.
//!
//! Ordering is most-recent-first by event timestamp, ties broken by record id
//! ascending, capped at [`MAX_RECENT`], without duplicates.

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::record::SourceRow;

pub const MAX_RECENT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Key of the aggregate scope this manifest belongs to, e.g. `state#TX`
    pub scope: String,
    pub brand: String,
    pub category: String,
    pub recent_ids: Vec<String>,
    #[serde(default)]
    pub mirrored_ids: Vec<String>,
    /// Raw company names that resolved to `brand`
    #[serde(default)]
    pub member_brands: BTreeSet<String>,
    pub updated_at: i64,
}

impl Manifest {
    pub fn new(scope: impl Into<String>, brand: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            brand: brand.into(),
            category: category.into(),
            recent_ids: Vec::new(),
            mirrored_ids: Vec::new(),
            member_brands: BTreeSet::new(),
            updated_at: 0,
        }
    }

    pub fn key(&self) -> String {
        manifest_key(&self.scope, &self.brand, &self.category)
    }

    /// True when the downstream mirror does not reflect `recent_ids`.
    pub fn needs_mirror(&self) -> bool {
        self.recent_ids != self.mirrored_ids
    }
}

pub fn manifest_key(scope: &str, brand: &str, category: &str) -> String {
    format!("{}/{}/{}", scope, brand, category)
}

/// Pick the `depth` most recent distinct record ids.
pub fn select_recent<'a>(rows: impl IntoIterator<Item = &'a SourceRow>, depth: usize) -> Vec<String> {
    let mut ordered: Vec<&SourceRow> = rows.into_iter().collect();
    ordered.sort_by(|a, b| {
        b.occurred_at
            .cmp(&a.occurred_at)
            .then_with(|| a.record_id.cmp(&b.record_id))
    });

    let mut seen = HashSet::new();
    ordered
        .into_iter()
        .filter(|row| seen.insert(row.record_id.as_str()))
        .take(depth)
        .map(|row| row.record_id.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, at: i64) -> SourceRow {
        SourceRow {
            record_id: id.to_string(),
            company: "Acme".to_string(),
            city: "Austin".to_string(),
            state: "TX".to_string(),
            category: "osha".to_string(),
            penalty_cents: 100,
            occurred_at: at,
        }
    }

    #[test]
    fn test_select_recent_orders_and_caps() {
        let rows: Vec<SourceRow> = (0..9).map(|i| row(&format!("r{i}"), i * 10)).collect();
        let recent = select_recent(&rows, MAX_RECENT);
        assert_eq!(recent, vec!["r8", "r7", "r6", "r5", "r4"]);
    }

    #[test]
    fn test_select_recent_breaks_ties_by_id() {
        let rows = vec![row("b", 5), row("a", 5), row("c", 9)];
        assert_eq!(select_recent(&rows, MAX_RECENT), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_select_recent_drops_duplicates() {
        let rows = vec![row("a", 5), row("a", 5), row("b", 1)];
        assert_eq!(select_recent(&rows, MAX_RECENT), vec!["a", "b"]);
    }

    #[test]
    fn test_needs_mirror() {
        let mut manifest = Manifest::new("state#TX", "acme", "osha");
        assert!(!manifest.needs_mirror());
        manifest.recent_ids = vec!["1".to_string()];
        assert!(manifest.needs_mirror());
        manifest.mirrored_ids = manifest.recent_ids.clone();
        assert!(!manifest.needs_mirror());
        assert_eq!(manifest.key(), "state#TX/acme/osha");
    }
}
