//! Recent-N Manifest Engine
//!
//! For every (brand, category) of a partition a manifest lists the ids of
//! the most recent source rows, and what the downstream mirror currently
//! holds:
//!
//! ```text
//! manifests/<P>/<brand>/<category>.json
//!   recent_ids:   [r9, r7, r6, r4, r3]   what should be mirrored
//!   mirrored_ids: [r7, r6, r4, r3, r1]   what is mirrored
//! ```
//!
//! [`ManifestEngine::refresh_recent`] recomputes `recent_ids` from source
//! rows. [`ManifestEngine::update_manifests`] then replaces the mirror of
//! every manifest whose lists differ: delete everything mirrored, fetch and
//! write everything recent, record the new mirrored list. The replace is
//! exact, so the mirror never holds an evicted record or more than the cap.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{Datelike, Months, NaiveDate};
use regsync_core::{entity_key, now_ms, select_recent, Manifest, PartitionId, Scope, SourceRow};
use regsync_observability::metrics;
use regsync_store::{
    escape_segment, get_typed, location_for_month, path_safe, put_typed, MirroredRecord, SourceReader,
};
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::error::Result;

/// Builds one candidate location for a record id, if it can.
type LocationBuilder = fn(&str) -> Option<String>;

/// Finds a source record by id by trying plausible time partitions in order.
///
/// Ids usually embed their event date (`OSHA-20240315-0042`), which names the
/// month directory. Records filed late or early land in a neighbouring month,
/// and a partition-wide scan is the last resort.
pub struct RecordLocator {
    source: Arc<dyn SourceReader>,
    builders: Vec<LocationBuilder>,
}

impl RecordLocator {
    pub fn new(source: Arc<dyn SourceReader>) -> Self {
        Self {
            source,
            builders: vec![
                id_month as LocationBuilder,
                id_previous_month,
                id_next_month,
                whole_partition,
            ],
        }
    }

    /// Candidate locations for an id, most likely first, without duplicates.
    pub fn candidates(&self, record_id: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.builders
            .iter()
            .filter_map(|build| build(record_id))
            .filter(|location| seen.insert(location.clone()))
            .collect()
    }

    /// First hit across the candidates; `None` once they are exhausted.
    pub async fn locate(&self, partition: &PartitionId, record_id: &str) -> Result<Option<SourceRow>> {
        for location in self.candidates(record_id) {
            if let Some(row) = self.source.fetch_record(partition, &location, record_id).await? {
                debug!(partition = %partition, record_id = %record_id, location = %location, "located record");
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
}

fn id_date(record_id: &str) -> Option<NaiveDate> {
    record_id
        .split(|c: char| !c.is_ascii_digit())
        .filter(|part| part.len() == 8)
        .find_map(|part| NaiveDate::parse_from_str(part, "%Y%m%d").ok())
}

fn month_of(date: NaiveDate) -> String {
    location_for_month(date.year(), date.month())
}

fn id_month(record_id: &str) -> Option<String> {
    id_date(record_id).map(month_of)
}

fn id_previous_month(record_id: &str) -> Option<String> {
    id_date(record_id)
        .and_then(|d| d.checked_sub_months(Months::new(1)))
        .map(month_of)
}

fn id_next_month(record_id: &str) -> Option<String> {
    id_date(record_id)
        .and_then(|d| d.checked_add_months(Months::new(1)))
        .map(month_of)
}

fn whole_partition(_record_id: &str) -> Option<String> {
    Some(String::new())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestReport {
    /// Manifests whose mirror was replaced
    pub applied: usize,
    /// Recent ids that could not be found in the source
    pub misses: usize,
}

pub struct ManifestEngine {
    ctx: EngineContext,
    locator: RecordLocator,
}

impl ManifestEngine {
    pub fn new(ctx: EngineContext) -> Self {
        let locator = RecordLocator::new(ctx.source.clone());
        Self { ctx, locator }
    }

    fn storage_key(partition: &PartitionId, brand: &str, category: &str) -> String {
        format!(
            "manifests/{}/{}/{}.json",
            path_safe(partition.as_str()),
            escape_segment(brand),
            escape_segment(category)
        )
    }

    pub async fn load(&self, partition: &PartitionId, brand: &str, category: &str) -> Result<Option<Manifest>> {
        Ok(get_typed(self.ctx.json.as_ref(), &Self::storage_key(partition, brand, category)).await?)
    }

    async fn save(&self, partition: &PartitionId, manifest: &Manifest) -> Result<()> {
        let key = Self::storage_key(partition, &manifest.brand, &manifest.category);
        put_typed(self.ctx.json.as_ref(), &key, manifest).await?;
        Ok(())
    }

    /// Recompute `recent_ids` for every (brand, category) in `rows`.
    ///
    /// `mirrored_ids` is left untouched. Returns the number of manifests
    /// that changed.
    pub async fn refresh_recent(&self, partition: &PartitionId, rows: &[SourceRow]) -> Result<usize> {
        let mut groups: BTreeMap<(String, String), Vec<&SourceRow>> = BTreeMap::new();
        let mut members: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for row in rows {
            let brand = self.ctx.aliases.resolve(&row.company).await?;
            members
                .entry(brand.clone())
                .or_default()
                .insert(row.company.trim().to_string());
            groups
                .entry((brand, row.category.clone()))
                .or_default()
                .push(row);
        }

        let scope = entity_key(Scope::State, partition, partition.as_str());
        let mut changed = 0;
        for ((brand, category), group) in groups {
            let recent = select_recent(group.iter().copied(), self.ctx.config.manifest_depth);
            let mut manifest = self
                .load(partition, &brand, &category)
                .await?
                .unwrap_or_else(|| Manifest::new(scope.clone(), brand.clone(), category.clone()));

            let member_brands = members.get(&brand).cloned().unwrap_or_default();
            let merged: BTreeSet<String> = manifest.member_brands.union(&member_brands).cloned().collect();
            if manifest.recent_ids == recent && manifest.member_brands == merged {
                continue;
            }

            manifest.recent_ids = recent;
            manifest.member_brands = merged;
            manifest.updated_at = now_ms();
            self.save(partition, &manifest).await?;
            changed += 1;
        }

        info!(partition = %partition, changed, "refreshed recent manifests");
        Ok(changed)
    }

    /// Replace the mirror of every manifest whose recent and mirrored lists
    /// differ.
    pub async fn update_manifests(&self, partition: &PartitionId) -> Result<ManifestReport> {
        let prefix = format!("manifests/{}/", path_safe(partition.as_str()));
        let mut report = ManifestReport::default();

        for key in self.ctx.json.list_keys(&prefix).await? {
            let Some(mut manifest) = get_typed::<Manifest>(self.ctx.json.as_ref(), &key).await? else {
                continue;
            };
            if !manifest.needs_mirror() {
                continue;
            }
            report.misses += self.replace_mirror(partition, &manifest).await?;

            manifest.mirrored_ids = manifest.recent_ids.clone();
            manifest.updated_at = now_ms();
            put_typed(self.ctx.json.as_ref(), &key, &manifest).await?;
            report.applied += 1;
            metrics::MANIFESTS_MIRRORED_TOTAL.inc();
        }

        info!(
            partition = %partition,
            applied = report.applied,
            misses = report.misses,
            "manifests mirrored"
        );
        Ok(report)
    }

    /// Delete the mirrored ids, then write the recent ones. Returns the
    /// number of recent ids that could not be found.
    async fn replace_mirror(&self, partition: &PartitionId, manifest: &Manifest) -> Result<usize> {
        let mirror_key = manifest.key();
        let batch_size = self.ctx.config.batch_size;

        for batch in manifest.mirrored_ids.chunks(batch_size) {
            self.ctx.mirror.delete_batch(&mirror_key, batch).await?;
        }

        let mut fetched = Vec::with_capacity(manifest.recent_ids.len());
        let mut misses = 0;
        for (rank, id) in manifest.recent_ids.iter().enumerate() {
            match self.locator.locate(partition, id).await? {
                Some(row) => fetched.push(MirroredRecord {
                    manifest_key: mirror_key.clone(),
                    rank: rank as u32,
                    row,
                }),
                None => {
                    warn!(
                        partition = %partition,
                        manifest = %mirror_key,
                        record_id = %id,
                        "recent record not found in source, skipping"
                    );
                    metrics::MIRROR_LOOKUP_MISSES_TOTAL.inc();
                    misses += 1;
                }
            }
        }

        for batch in fetched.chunks(batch_size) {
            self.ctx.mirror.put_batch(batch).await?;
        }
        Ok(misses)
    }
}
