//! Source Rows and Aggregate Records
//!
//! ## SourceRow
//! One normalized violation record as it sits in the columnar lake. Parsers
//! upstream have already mapped every agency's raw layout onto this shape.
//!
//! ## AggregateRecord
//! Rolled-up stats for one entity at one scope. Records form a hierarchy:
//!
//! ```text
//! nation#US
//!   └── state#TX                (children: cities)
//!         ├── city#TX#Austin    (children: brands)
//!         └── company#TX#acme   (children: cities)
//! ```
//!
//! Keys are derived from the partition so concurrent partitions never write
//! the same key. The `children` map is the field that can grow without bound;
//! when a record outgrows the destination ceiling it is split across overflow
//! chunks keyed `<primary>#chunk<N>` (see [`crate::chunk`]).
//!
//! Money is kept as integer cents so two computations over the same rows
//! compare equal regardless of summation order.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::partition::PartitionId;

/// Entity name used for the single nation-scope record.
pub const NATION_ENTITY: &str = "US";

/// A normalized violation row read from the source lake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRow {
    /// Stable record identifier, e.g. `OSHA-20240315-0042`
    pub record_id: String,
    /// Company name as reported by the agency (not yet alias-resolved)
    pub company: String,
    pub city: String,
    /// Two-letter jurisdiction code; doubles as the partition id
    pub state: String,
    /// Violation category (agency or program)
    pub category: String,
    pub penalty_cents: i64,
    /// Event timestamp in milliseconds since epoch
    pub occurred_at: i64,
}

impl SourceRow {
    pub fn stats(&self) -> Stats {
        Stats {
            count: 1,
            sum_cents: self.penalty_cents,
        }
    }
}

/// Aggregation level of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Company,
    City,
    State,
    Nation,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Company => "company",
            Scope::City => "city",
            Scope::State => "state",
            Scope::Nation => "nation",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "company" => Ok(Scope::Company),
            "city" => Ok(Scope::City),
            "state" => Ok(Scope::State),
            "nation" => Ok(Scope::Nation),
            other => Err(CoreError::InvalidKey(format!("unknown scope: {other}"))),
        }
    }
}

/// Count and penalty total for a group of rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub count: u64,
    pub sum_cents: i64,
}

impl Stats {
    pub fn add(&mut self, other: Stats) {
        self.count += other.count;
        self.sum_cents += other.sum_cents;
    }

    pub fn subtract(&mut self, other: Stats) {
        self.count = self.count.saturating_sub(other.count);
        self.sum_cents -= other.sum_cents;
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.sum_cents == 0
    }
}

/// Build the partition-scoped key for an entity.
///
/// The partition is ignored for the nation scope, which has a single record.
pub fn entity_key(scope: Scope, partition: &PartitionId, entity: &str) -> String {
    match scope {
        Scope::Company => format!("company#{}#{}", partition, entity),
        Scope::City => format!("city#{}#{}", partition, entity),
        Scope::State => format!("state#{}", partition),
        Scope::Nation => format!("nation#{}", entity),
    }
}

/// Key of the `index`-th overflow chunk of a primary record.
pub fn chunk_key(primary_key: &str, index: u32) -> String {
    format!("{}#chunk{}", primary_key, index)
}

/// Position of a record within a split family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// 0 for the primary record, 1.. for overflow chunks
    pub index: u32,
    pub total: u32,
}

/// Rolled-up stats for one entity at one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub key: String,
    pub scope: Scope,
    pub partition: PartitionId,
    pub entity: String,
    pub count: u64,
    pub sum_cents: i64,
    /// Stats per violation category
    #[serde(default)]
    pub breakdown: BTreeMap<String, Stats>,
    /// Stats per child entity one level down the hierarchy
    #[serde(default)]
    pub children: BTreeMap<String, Stats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkInfo>,
    pub updated_at: i64,
}

impl AggregateRecord {
    pub fn new(scope: Scope, partition: PartitionId, entity: impl Into<String>, now: i64) -> Self {
        let entity = entity.into();
        Self {
            key: entity_key(scope, &partition, &entity),
            scope,
            partition,
            entity,
            count: 0,
            sum_cents: 0,
            breakdown: BTreeMap::new(),
            children: BTreeMap::new(),
            chunk: None,
            updated_at: now,
        }
    }

    pub fn stats(&self) -> Stats {
        Stats {
            count: self.count,
            sum_cents: self.sum_cents,
        }
    }

    /// Count one source row, attributing it to `child`.
    pub fn record_row(&mut self, row: &SourceRow, child: &str) {
        let stats = row.stats();
        self.count += stats.count;
        self.sum_cents += stats.sum_cents;
        self.breakdown
            .entry(row.category.clone())
            .or_default()
            .add(stats);
        self.children.entry(child.to_string()).or_default().add(stats);
    }

    /// Fold another record of the same entity into this one.
    pub fn merge(&mut self, other: &AggregateRecord) {
        self.count += other.count;
        self.sum_cents += other.sum_cents;
        for (category, stats) in &other.breakdown {
            self.breakdown.entry(category.clone()).or_default().add(*stats);
        }
        for (child, stats) in &other.children {
            self.children.entry(child.clone()).or_default().add(*stats);
        }
    }

    /// Remove a contribution previously added with [`merge`](Self::merge).
    pub fn unmerge(&mut self, other: &AggregateRecord) {
        self.count = self.count.saturating_sub(other.count);
        self.sum_cents -= other.sum_cents;
        subtract_map(&mut self.breakdown, &other.breakdown);
        subtract_map(&mut self.children, &other.children);
    }

    /// Content equality, ignoring `updated_at`.
    pub fn same_content(&self, other: &AggregateRecord) -> bool {
        self.key == other.key
            && self.scope == other.scope
            && self.partition == other.partition
            && self.entity == other.entity
            && self.count == other.count
            && self.sum_cents == other.sum_cents
            && self.breakdown == other.breakdown
            && self.children == other.children
            && self.chunk == other.chunk
    }

    /// Overflow chunks carry only part of `children`; everything else lives
    /// on the primary.
    pub fn is_overflow_chunk(&self) -> bool {
        self.chunk.map(|c| c.index > 0).unwrap_or(false)
    }
}

fn subtract_map(target: &mut BTreeMap<String, Stats>, other: &BTreeMap<String, Stats>) {
    for (name, stats) in other {
        if let Some(existing) = target.get_mut(name) {
            existing.subtract(*stats);
            if existing.is_empty() {
                target.remove(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, city: &str, category: &str, cents: i64) -> SourceRow {
        SourceRow {
            record_id: id.to_string(),
            company: "Acme".to_string(),
            city: city.to_string(),
            state: "TX".to_string(),
            category: category.to_string(),
            penalty_cents: cents,
            occurred_at: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_entity_keys_are_partition_scoped() {
        let tx = PartitionId::new("tx");
        assert_eq!(entity_key(Scope::Company, &tx, "acme"), "company#TX#acme");
        assert_eq!(entity_key(Scope::City, &tx, "Austin"), "city#TX#Austin");
        assert_eq!(entity_key(Scope::State, &tx, "ignored"), "state#TX");
        assert_eq!(entity_key(Scope::Nation, &tx, NATION_ENTITY), "nation#US");
        assert_eq!(chunk_key("state#TX", 2), "state#TX#chunk2");
    }

    #[test]
    fn test_record_row_updates_breakdown_and_children() {
        let mut state = AggregateRecord::new(Scope::State, PartitionId::new("TX"), "TX", 0);
        state.record_row(&row("1", "Austin", "osha", 500), "Austin");
        state.record_row(&row("2", "Austin", "epa", 250), "Austin");
        state.record_row(&row("3", "Dallas", "osha", 100), "Dallas");

        assert_eq!(state.count, 3);
        assert_eq!(state.sum_cents, 850);
        assert_eq!(state.breakdown["osha"], Stats { count: 2, sum_cents: 600 });
        assert_eq!(state.children["Austin"], Stats { count: 2, sum_cents: 750 });
        assert_eq!(state.children["Dallas"].count, 1);
    }

    #[test]
    fn test_merge_then_unmerge_restores_original() {
        let tx = PartitionId::new("TX");
        let mut base = AggregateRecord::new(Scope::State, tx.clone(), "TX", 0);
        base.record_row(&row("1", "Austin", "osha", 500), "Austin");
        let original = base.clone();

        let mut contribution = AggregateRecord::new(Scope::State, tx, "TX", 0);
        contribution.record_row(&row("2", "Dallas", "epa", 300), "Dallas");

        base.merge(&contribution);
        assert_eq!(base.count, 2);
        base.unmerge(&contribution);
        assert!(base.same_content(&original));
        assert!(!base.children.contains_key("Dallas"));
    }

    #[test]
    fn test_same_content_ignores_updated_at() {
        let tx = PartitionId::new("TX");
        let a = AggregateRecord::new(Scope::City, tx.clone(), "Austin", 1);
        let b = AggregateRecord::new(Scope::City, tx, "Austin", 2);
        assert_ne!(a, b);
        assert!(a.same_content(&b));
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!("city".parse::<Scope>().unwrap(), Scope::City);
        assert!("county".parse::<Scope>().is_err());
    }
}
