//! Size Estimator and Chunker
//!
//! Destination records have a hard serialized-size ceiling. A record's size is
//! its compact JSON length in bytes, which is what the read store is billed
//! and limited on.
//!
//! ## Splitting
//!
//! When a record outgrows the ceiling, its `children` map is split:
//!
//! 1. Entries are ordered by significance (count desc, then sum desc, then name)
//!    so the most important children stay on the primary record.
//! 2. Entries are packed greedily into the primary until the next one would
//!    cross `ceiling - reserved`.
//! 3. The remainder spills into overflow chunks keyed `<key>#chunk<N>`, each
//!    tagged with its index and the family total.
//!
//! Every entry lands in exactly one record of the family, and every record in
//! the family estimates at or under the ceiling. [`reassemble`] reverses the
//! split.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::{CoreError, Result};
use crate::record::{chunk_key, AggregateRecord, ChunkInfo, Stats};

/// Bytes held back from every record for chunk tags and key suffixes.
pub const DEFAULT_RESERVED_METADATA_BYTES: usize = 256;

/// One record of a split family.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkedRecord {
    pub record: AggregateRecord,
    pub is_overflow_chunk: bool,
    pub chunk_index: u32,
    pub total_chunks: u32,
}

/// Serialized (compact JSON, UTF-8) size of a value in bytes.
pub fn estimate_size<T: Serialize + ?Sized>(value: &T) -> Result<usize> {
    Ok(serde_json::to_vec(value)?.len())
}

/// Split `field` across `base` and as many overflow chunks as needed.
///
/// `base` supplies everything except the split field; its own `children`
/// are ignored. The returned family always starts with the primary record.
pub fn split_for_ceiling(
    base: &AggregateRecord,
    field: &BTreeMap<String, Stats>,
    ceiling: usize,
    reserved: usize,
) -> Result<Vec<ChunkedRecord>> {
    let budget = ceiling
        .checked_sub(reserved)
        .filter(|b| *b > 0)
        .ok_or(CoreError::CeilingTooSmall { ceiling, reserved })?;

    let mut primary = base.clone();
    primary.children.clear();
    primary.chunk = None;

    let primary_base = estimate_size(&primary)?;
    if primary_base > budget {
        return Err(CoreError::BaseExceedsCeiling {
            key: base.key.clone(),
            size: primary_base,
            budget,
        });
    }

    // Widest possible chunk key, so the budget holds for any index.
    let overflow_template = overflow_record(&primary, u32::MAX);
    let overflow_base = estimate_size(&overflow_template)?;

    let mut entries: Vec<(&String, &Stats)> = field.iter().collect();
    entries.sort_by(|a, b| {
        b.1.count
            .cmp(&a.1.count)
            .then(b.1.sum_cents.cmp(&a.1.sum_cents))
            .then(a.0.cmp(b.0))
    });

    let mut packs: Vec<BTreeMap<String, Stats>> = vec![BTreeMap::new()];
    let mut used = primary_base;
    for (name, stats) in entries {
        // key + ':' + value + ','
        let entry_size = estimate_size(name)? + estimate_size(stats)? + 2;
        if used + entry_size > budget {
            if overflow_base + entry_size > budget {
                return Err(CoreError::EntryTooLarge {
                    key: base.key.clone(),
                    entry: name.clone(),
                    size: entry_size,
                });
            }
            packs.push(BTreeMap::new());
            used = overflow_base;
        }
        used += entry_size;
        if let Some(pack) = packs.last_mut() {
            pack.insert(name.clone(), *stats);
        }
    }

    let total = packs.len() as u32;
    let mut family = Vec::with_capacity(packs.len());
    for (index, children) in packs.into_iter().enumerate() {
        let index = index as u32;
        let mut record = if index == 0 {
            primary.clone()
        } else {
            overflow_record(&primary, index)
        };
        record.children = children;
        if total > 1 {
            record.chunk = Some(ChunkInfo { index, total });
        }

        let size = estimate_size(&record)?;
        if size > ceiling {
            return Err(CoreError::ChunkOverflow {
                key: record.key,
                size,
                ceiling,
            });
        }

        family.push(ChunkedRecord {
            record,
            is_overflow_chunk: index > 0,
            chunk_index: index,
            total_chunks: total,
        });
    }

    Ok(family)
}

/// Lay a record out for the destination: unchanged when it fits, otherwise
/// split over its `children`.
pub fn chunk_record(
    record: &AggregateRecord,
    ceiling: usize,
    reserved: usize,
) -> Result<Vec<AggregateRecord>> {
    let mut whole = record.clone();
    whole.chunk = None;
    if estimate_size(&whole)? + reserved <= ceiling {
        return Ok(vec![whole]);
    }
    Ok(split_for_ceiling(record, &record.children, ceiling, reserved)?
        .into_iter()
        .map(|c| c.record)
        .collect())
}

/// Rebuild the original record from its primary and overflow chunks.
///
/// Chunks may be given in any order; a missing index is an error.
pub fn reassemble(primary: &AggregateRecord, chunks: &[AggregateRecord]) -> Result<AggregateRecord> {
    let mut whole = primary.clone();
    whole.chunk = None;

    let total = match primary.chunk {
        Some(info) if info.total > 1 => info.total,
        _ => return Ok(whole),
    };

    for index in 1..total {
        let chunk = chunks
            .iter()
            .find(|c| c.chunk.map(|i| i.index) == Some(index))
            .ok_or_else(|| CoreError::MissingChunk {
                key: primary.key.clone(),
                index,
            })?;
        for (name, stats) in &chunk.children {
            whole.children.entry(name.clone()).or_default().add(*stats);
        }
    }

    Ok(whole)
}

fn overflow_record(primary: &AggregateRecord, index: u32) -> AggregateRecord {
    let mut record = primary.clone();
    record.key = chunk_key(&primary.key, index);
    record.count = 0;
    record.sum_cents = 0;
    record.breakdown.clear();
    record.children.clear();
    record.chunk = None;
    record
}
