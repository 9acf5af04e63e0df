//! Chunking completeness tests
//!
//! For a spread of field sizes and ceilings, every split family must hold
//! each original entry exactly once and keep every member under the ceiling.

use std::collections::{BTreeMap, HashSet};

use regsync_core::{
    estimate_size, reassemble, split_for_ceiling, AggregateRecord, PartitionId, Scope, Stats,
    DEFAULT_RESERVED_METADATA_BYTES,
};

fn state_record(children: usize, name_len: usize) -> AggregateRecord {
    let mut record = AggregateRecord::new(Scope::State, PartitionId::new("CA"), "CA", 1_700_000_000_000);
    record.breakdown.insert(
        "osha".to_string(),
        Stats {
            count: 3,
            sum_cents: 10,
        },
    );
    for i in 0..children {
        let name = format!("{i:0width$}", width = name_len.max(4));
        record.children.insert(
            name,
            Stats {
                count: ((i * 7919) % 101) as u64 + 1,
                sum_cents: (i as i64) * 37,
            },
        );
    }
    record
}

#[test]
fn every_entry_lands_in_exactly_one_chunk() {
    for (children, name_len, ceiling) in [(0, 4, 1_024), (10, 8, 1_024), (300, 12, 2_048), (2_000, 24, 16_384)] {
        let record = state_record(children, name_len);
        let family = split_for_ceiling(&record, &record.children, ceiling, DEFAULT_RESERVED_METADATA_BYTES).unwrap();

        let mut seen = HashSet::new();
        let mut union = BTreeMap::new();
        for member in &family {
            let size = estimate_size(&member.record).unwrap();
            assert!(size <= ceiling, "{} is {} bytes, ceiling {}", member.record.key, size, ceiling);
            for (name, stats) in &member.record.children {
                assert!(seen.insert(name.clone()), "duplicate entry {name}");
                union.insert(name.clone(), *stats);
            }
        }
        assert_eq!(union, record.children, "children={children} ceiling={ceiling}");
    }
}

#[test]
fn overflow_chunks_carry_no_totals() {
    let record = state_record(400, 16);
    let family = split_for_ceiling(&record, &record.children, 2_048, DEFAULT_RESERVED_METADATA_BYTES).unwrap();
    assert!(family.len() > 1);

    let primary = &family[0].record;
    assert_eq!(primary.count, record.count);
    assert_eq!(primary.breakdown, record.breakdown);
    for member in &family[1..] {
        assert!(member.is_overflow_chunk);
        assert_eq!(member.record.count, 0);
        assert!(member.record.breakdown.is_empty());
        assert_eq!(member.record.key, format!("state#CA#chunk{}", member.chunk_index));
    }

    let chunks: Vec<AggregateRecord> = family[1..].iter().map(|c| c.record.clone()).collect();
    let whole = reassemble(primary, &chunks).unwrap();
    assert!(whole.same_content(&record));
}
