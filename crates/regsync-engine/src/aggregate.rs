//! Source row aggregation
//!
//! Rows of one partition roll up into three scopes:
//!
//! | Scope   | Key                     | `children`   |
//! |---------|-------------------------|--------------|
//! | State   | `state#<P>`             | cities       |
//! | City    | `city#<P>#<city>`       | brands       |
//! | Company | `company#<P>#<brand>`   | cities       |
//!
//! A partition's aggregate is the fold of its per-city contributions, which is
//! what lets a rebuild commit city by city and revert one city cleanly.

use std::collections::BTreeMap;

use regsync_core::{AggregateRecord, PartitionId, Scope, SourceRow};

use crate::alias::AliasCache;
use crate::error::Result;

const UNKNOWN_CITY: &str = "UNKNOWN";

/// City name a row is grouped under.
pub fn city_of(row: &SourceRow) -> String {
    let city = row.city.trim();
    if city.is_empty() {
        UNKNOWN_CITY.to_string()
    } else {
        city.to_string()
    }
}

/// Rows grouped by city, in city-name order.
pub fn group_by_city(rows: &[SourceRow]) -> BTreeMap<String, Vec<SourceRow>> {
    let mut cities: BTreeMap<String, Vec<SourceRow>> = BTreeMap::new();
    for row in rows {
        cities.entry(city_of(row)).or_default().push(row.clone());
    }
    cities
}

/// Everything one city adds to the partition.
#[derive(Debug, Clone)]
pub struct CityContribution {
    pub city: AggregateRecord,
    /// The city's share of `state#<P>`
    pub state: AggregateRecord,
    /// The city's share of each `company#<P>#<brand>`
    pub companies: BTreeMap<String, AggregateRecord>,
}

pub async fn contribute_city(
    partition: &PartitionId,
    city: &str,
    rows: &[SourceRow],
    aliases: &AliasCache,
    now: i64,
) -> Result<CityContribution> {
    let mut city_record = AggregateRecord::new(Scope::City, partition.clone(), city, now);
    let mut state = AggregateRecord::new(Scope::State, partition.clone(), partition.as_str(), now);
    let mut companies: BTreeMap<String, AggregateRecord> = BTreeMap::new();

    for row in rows {
        let brand = aliases.resolve(&row.company).await?;
        city_record.record_row(row, &brand);
        state.record_row(row, city);
        companies
            .entry(brand.clone())
            .or_insert_with(|| AggregateRecord::new(Scope::Company, partition.clone(), brand, now))
            .record_row(row, city);
    }

    Ok(CityContribution {
        city: city_record,
        state,
        companies,
    })
}

/// Full aggregate of one partition, unchunked.
#[derive(Debug, Clone)]
pub struct PartitionAggregate {
    pub state: AggregateRecord,
    pub cities: BTreeMap<String, AggregateRecord>,
    pub companies: BTreeMap<String, AggregateRecord>,
}

impl PartitionAggregate {
    pub fn empty(partition: &PartitionId, now: i64) -> Self {
        Self {
            state: AggregateRecord::new(Scope::State, partition.clone(), partition.as_str(), now),
            cities: BTreeMap::new(),
            companies: BTreeMap::new(),
        }
    }

    pub fn add(&mut self, contribution: CityContribution) {
        self.state.merge(&contribution.state);
        for (brand, share) in contribution.companies {
            match self.companies.get_mut(&brand) {
                Some(existing) => existing.merge(&share),
                None => {
                    self.companies.insert(brand, share);
                }
            }
        }
        self.cities
            .insert(contribution.city.entity.clone(), contribution.city);
    }

    /// Every record: state, then cities, then companies.
    pub fn records(&self) -> Vec<AggregateRecord> {
        let mut records = Vec::with_capacity(1 + self.cities.len() + self.companies.len());
        records.push(self.state.clone());
        records.extend(self.cities.values().cloned());
        records.extend(self.companies.values().cloned());
        records
    }
}

/// Aggregate all rows of a partition.
pub async fn aggregate_rows(
    partition: &PartitionId,
    rows: &[SourceRow],
    aliases: &AliasCache,
    now: i64,
) -> Result<PartitionAggregate> {
    let mut aggregate = PartitionAggregate::empty(partition, now);
    for (city, city_rows) in group_by_city(rows) {
        aggregate.add(contribute_city(partition, &city, &city_rows, aliases, now).await?);
    }
    Ok(aggregate)
}
