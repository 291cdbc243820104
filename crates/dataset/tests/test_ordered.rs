//! End-to-end ordered dataset tests over the local pool.

use std::sync::Arc;
use strata_core::codec::CodecSpec;
use strata_core::{Annotation, Interval, Region, RegionValueBuilder, VType};
use strata_dataset::stream::{MemStream, PartSource};
use strata_dataset::{
    EngineConfig, JoinType, LocalPool, OrderedPartitioner, OrderedRvd, OrderedRvdType,
};

fn int_typ() -> OrderedRvdType {
    OrderedRvdType::new(
        VType::struct_of(vec![("k", VType::int32()), ("v", VType::int32())]),
        vec!["k".to_string(), "v".to_string()],
        vec!["k".to_string()],
    )
    .unwrap()
}

fn row(k: i32, v: i32) -> Annotation {
    Annotation::Struct(vec![Annotation::Int32(k), Annotation::Int32(v)])
}

fn pk(k: i32) -> Annotation {
    Annotation::Struct(vec![Annotation::Int32(k)])
}

fn encode_rows(typ: &OrderedRvdType, rows: &[Annotation]) -> PartSource {
    let encoded: Vec<Vec<u8>> = rows
        .iter()
        .map(|a| {
            let mut region = Region::new();
            let mut rvb = RegionValueBuilder::new(&typ.row_type);
            rvb.add_annotation(&mut region, &typ.row_type, a);
            let off = rvb.end();
            strata_core::codec::encode_row(&typ.row_type, &region, off)
        })
        .collect();
    MemStream::source(Arc::new(encoded))
}

fn int_bounds(cuts: &[(i32, i32)]) -> Vec<Interval> {
    cuts.iter()
        .enumerate()
        .map(|(i, (start, end))| Interval::new(pk(*start), pk(*end), i == 0, true))
        .collect()
}

/// Evenly partitioned dataset with keys 0..n over `parts` partitions.
fn ranged_dataset(n: i32, parts: i32) -> OrderedRvd {
    let typ = int_typ();
    let per = n / parts;
    let mut partitions = Vec::new();
    let mut cuts = Vec::new();
    for p in 0..parts {
        let lo = p * per;
        let hi = if p == parts - 1 { n } else { (p + 1) * per };
        partitions.push((lo..hi).map(|k| row(k, k * 10)).collect::<Vec<_>>());
        cuts.push((if p == 0 { 0 } else { lo - 1 }, hi - 1));
    }
    let partitioner = OrderedPartitioner::new(typ.pk_type(), int_bounds(&cuts)).unwrap();
    OrderedRvd::from_annotations(typ, partitioner, partitions, LocalPool::new()).unwrap()
}

fn keys_of(rows: &[Annotation]) -> Vec<i32> {
    rows.iter()
        .map(|a| a.fields().unwrap()[0].as_i32().unwrap())
        .collect()
}

#[test]
fn test_shuffled_input_coerces_via_shuffle() {
    // 10 partitions of scattered int keys: nothing is sorted, so coercion
    // must shuffle into 10 partitions covering min..max
    let typ = int_typ();
    let mut sources = Vec::new();
    for p in 0..10i32 {
        // partition p holds p, p+10, ..., p+90 in reverse: partitions
        // overlap pairwise and nothing is sorted
        let rows: Vec<Annotation> = (0..10i32).rev().map(|i| row(p + 10 * i, p)).collect();
        sources.push(encode_rows(&typ, &rows));
    }
    let dataset = OrderedRvd::coerce(
        typ,
        LocalPool::new(),
        &EngineConfig::default(),
        sources,
    )
    .unwrap();

    assert_eq!(dataset.num_partitions(), 10);
    dataset.validate().unwrap();
    assert_eq!(dataset.count().unwrap(), 100);
    // range covers the observed min and max keys
    let range = dataset.partitioner().range();
    assert_eq!(range.start.fields().unwrap()[0].as_i32(), Some(0));
    assert_eq!(range.end.fields().unwrap()[0].as_i32(), Some(99));
    // collected keys are globally sorted
    let keys = keys_of(&dataset.collect().unwrap());
    let mut sorted = keys.clone();
    sorted.sort_unstable();
    assert_eq!(keys, sorted);
}

#[test]
fn test_sorted_input_coerces_as_is() {
    let typ = int_typ();
    let sources = vec![
        encode_rows(&typ, &[row(0, 0), row(1, 0)]),
        encode_rows(&typ, &[row(2, 0), row(3, 0)]),
    ];
    let dataset = OrderedRvd::coerce(
        typ,
        LocalPool::new(),
        &EngineConfig::default(),
        sources,
    )
    .unwrap();
    assert_eq!(dataset.num_partitions(), 2);
    dataset.validate().unwrap();
    assert_eq!(keys_of(&dataset.collect().unwrap()), vec![0, 1, 2, 3]);
}

#[test]
fn test_pk_sorted_input_gets_local_sort() {
    // PK-sorted but K-unsorted within each k run
    let typ = int_typ();
    let sources = vec![
        encode_rows(&typ, &[row(0, 5), row(0, 1), row(1, 2)]),
        encode_rows(&typ, &[row(2, 9), row(2, 3)]),
    ];
    let dataset = OrderedRvd::coerce(
        typ,
        LocalPool::new(),
        &EngineConfig::default(),
        sources,
    )
    .unwrap();
    dataset.validate().unwrap();
    let rows = dataset.collect().unwrap();
    assert_eq!(
        rows.iter()
            .map(|a| {
                let f = a.fields().unwrap();
                (f[0].as_i32().unwrap(), f[1].as_i32().unwrap())
            })
            .collect::<Vec<_>>(),
        vec![(0, 1), (0, 5), (1, 2), (2, 3), (2, 9)]
    );
}

#[test]
fn test_boundary_equal_pks_are_adjusted() {
    // partition 1 starts with the same pk that ends partition 0: its
    // leading run must shift onto partition 0's tail
    let typ = int_typ();
    let sources = vec![
        encode_rows(&typ, &[row(0, 0), row(5, 1)]),
        encode_rows(&typ, &[row(5, 2), row(9, 0)]),
    ];
    let dataset = OrderedRvd::coerce(
        typ,
        LocalPool::new(),
        &EngineConfig::default(),
        sources,
    )
    .unwrap();
    dataset.validate().unwrap();
    assert_eq!(dataset.count().unwrap(), 4);
    let keys = keys_of(&dataset.collect().unwrap());
    assert_eq!(keys, vec![0, 5, 5, 9]);
}

#[test]
fn test_partition_sorted_union_interleaves_exactly() {
    // two datasets on (contig, position) over contig "1", positions
    // 1..=1000, split at {250, 500, 750, 1000}
    let typ = OrderedRvdType::new(
        VType::struct_of(vec![("contig", VType::str()), ("position", VType::int32())]),
        vec!["contig".to_string(), "position".to_string()],
        vec!["contig".to_string(), "position".to_string()],
    )
    .unwrap();
    let cpk = |p: i32| {
        Annotation::Struct(vec![Annotation::Str("1".to_string()), Annotation::Int32(p)])
    };
    let bounds = vec![
        Interval::new(cpk(1), cpk(250), true, true),
        Interval::new(cpk(250), cpk(500), false, true),
        Interval::new(cpk(500), cpk(750), false, true),
        Interval::new(cpk(750), cpk(1000), false, true),
    ];
    let partitioner = OrderedPartitioner::new(typ.pk_type(), bounds).unwrap();
    let split = |pred: fn(i32) -> bool| -> Vec<Vec<Annotation>> {
        (0..4)
            .map(|p| {
                let lo = p * 250 + 1;
                let hi = (p + 1) * 250;
                (lo..=hi).filter(|x| pred(*x)).map(cpk).collect()
            })
            .collect()
    };
    let pool = LocalPool::new();
    let odds = OrderedRvd::from_annotations(
        typ.clone(),
        partitioner.clone(),
        split(|x| x % 2 == 1),
        pool.clone(),
    )
    .unwrap();
    let evens =
        OrderedRvd::from_annotations(typ, partitioner, split(|x| x % 2 == 0), pool).unwrap();

    let union = odds.partition_sorted_union(&evens).unwrap();
    union.validate().unwrap();
    assert_eq!(
        union.count().unwrap(),
        odds.count().unwrap() + evens.count().unwrap()
    );
    let positions: Vec<i32> = union
        .collect()
        .unwrap()
        .iter()
        .map(|a| a.fields().unwrap()[1].as_i32().unwrap())
        .collect();
    assert_eq!(positions, (1..=1000).collect::<Vec<_>>());
}

#[test]
fn test_filter_intervals_narrows_partitions() {
    // 20 partitions over two contigs; only the partitions overlapping the
    // query intervals load, and every surviving row lies inside one
    let typ = OrderedRvdType::new(
        VType::struct_of(vec![("contig", VType::str()), ("position", VType::int32())]),
        vec!["contig".to_string(), "position".to_string()],
        vec!["contig".to_string(), "position".to_string()],
    )
    .unwrap();
    let cpk = |c: &str, p: i32| {
        Annotation::Struct(vec![Annotation::Str(c.to_string()), Annotation::Int32(p)])
    };
    let mut bounds = Vec::new();
    let mut partitions = Vec::new();
    for (ci, contig) in ["1", "2"].iter().enumerate() {
        for p in 0..10i32 {
            let lo = p * 50;
            let hi = (p + 1) * 50;
            let start = if ci == 0 && p == 0 {
                cpk("1", 0)
            } else if p == 0 {
                // adjacency across contigs: "1" ends where "2" begins
                cpk("1", 500)
            } else {
                cpk(contig, lo)
            };
            bounds.push(Interval::new(
                start,
                cpk(contig, hi),
                ci == 0 && p == 0,
                true,
            ));
            partitions.push(((lo + 1)..=hi).map(|x| cpk(contig, x)).collect::<Vec<_>>());
        }
    }
    let partitioner = OrderedPartitioner::new(typ.pk_type(), bounds).unwrap();
    let dataset =
        OrderedRvd::from_annotations(typ, partitioner, partitions, LocalPool::new()).unwrap();
    dataset.validate().unwrap();

    let intervals = vec![
        Interval::new(cpk("1", 100), cpk("1", 200), true, true),
        Interval::new(cpk("2", 50), cpk("2", 150), true, true),
    ];
    let narrowed = dataset.filter_intervals(&intervals).unwrap();
    assert!(narrowed.num_partitions() < 20);
    let rows = narrowed.collect().unwrap();
    assert!(!rows.is_empty());
    for a in &rows {
        let f = a.fields().unwrap();
        let contig = f[0].as_str().unwrap();
        let position = f[1].as_i32().unwrap();
        let inside = (contig == "1" && (100..=200).contains(&position))
            || (contig == "2" && (50..=150).contains(&position));
        assert!(inside, "row ({}, {}) escaped the intervals", contig, position);
    }
}

#[test]
fn test_coalesce_without_shuffle() {
    let dataset = ranged_dataset(100, 10);
    // max >= partitions: unchanged
    let same = dataset.coalesce(10, false).unwrap();
    assert_eq!(same.num_partitions(), 10);
    // fewer partitions, same rows
    let fewer = dataset.coalesce(3, false).unwrap();
    assert!(fewer.num_partitions() <= 3);
    assert_eq!(fewer.count().unwrap(), 100);
    fewer.validate().unwrap();
}

#[test]
fn test_coalesce_with_shuffle() {
    let dataset = ranged_dataset(100, 10);
    let fewer = dataset.coalesce(4, true).unwrap();
    assert!(fewer.num_partitions() <= 4);
    assert_eq!(fewer.count().unwrap(), 100);
    fewer.validate().unwrap();
}

#[test]
fn test_head_truncates_bounds() {
    let dataset = ranged_dataset(100, 10);
    let top = dataset.head(25).unwrap();
    assert_eq!(top.count().unwrap(), 25);
    assert_eq!(top.num_partitions(), 3);
    top.validate().unwrap();
    assert_eq!(keys_of(&top.collect().unwrap()), (0..25).collect::<Vec<_>>());
}

#[test]
fn test_subset_partitions_preserves_invariants() {
    let dataset = ranged_dataset(100, 10);
    let subset = dataset.subset_partitions(&[1, 4, 7]).unwrap();
    assert_eq!(subset.num_partitions(), 3);
    subset.partitioner().check_invariants().unwrap();
    assert_eq!(subset.count().unwrap(), 30);
}

#[test]
fn test_filter_and_sample_keep_partitioner() {
    let dataset = ranged_dataset(100, 10);
    let row_type = dataset.typ().row_type.clone();
    let filtered = dataset.filter(Arc::new(move |row| {
        let a = strata_core::annotation::read_annotation(&row_type, row.region, row.offset);
        Ok(a.fields().unwrap()[0].as_i32().unwrap() % 2 == 0)
    }));
    assert_eq!(filtered.count().unwrap(), 50);
    assert_eq!(filtered.partitioner(), dataset.partitioner());

    let sampled = dataset.sample(0.5, 42);
    let n = sampled.count().unwrap();
    assert!(n > 20 && n < 80, "sampled {} of 100", n);
    // deterministic under the same seed
    assert_eq!(dataset.sample(0.5, 42).count().unwrap(), n);
}

#[test]
fn test_group_and_distinct_by_key() {
    let typ = OrderedRvdType::new(
        VType::struct_of(vec![("k", VType::int32()), ("v", VType::int32())]),
        vec!["k".to_string()],
        vec!["k".to_string()],
    )
    .unwrap();
    let partitioner =
        OrderedPartitioner::new(typ.pk_type(), int_bounds(&[(1, 10)])).unwrap();
    let dataset = OrderedRvd::from_annotations(
        typ,
        partitioner,
        vec![vec![row(1, 10), row(1, 11), row(2, 20)]],
        LocalPool::new(),
    )
    .unwrap();

    let grouped = dataset.group_by_key("values").unwrap();
    grouped.validate().unwrap();
    let rows = grouped.collect().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[0],
        Annotation::Struct(vec![
            Annotation::Int32(1),
            Annotation::Array(vec![
                Annotation::Struct(vec![Annotation::Int32(10)]),
                Annotation::Struct(vec![Annotation::Int32(11)]),
            ]),
        ])
    );

    let distinct = dataset.distinct_by_key();
    assert_eq!(keys_of(&distinct.collect().unwrap()), vec![1, 2]);
}

#[test]
fn test_ordered_join_through_datasets() {
    let typ = OrderedRvdType::new(
        VType::struct_of(vec![("k", VType::int32()), ("a", VType::int32())]),
        vec!["k".to_string()],
        vec!["k".to_string()],
    )
    .unwrap();
    let rtyp = OrderedRvdType::new(
        VType::struct_of(vec![("k", VType::int32()), ("b", VType::int32())]),
        vec!["k".to_string()],
        vec!["k".to_string()],
    )
    .unwrap();
    let pool = LocalPool::new();
    let left = OrderedRvd::from_annotations(
        typ,
        OrderedPartitioner::new(
            VType::struct_of(vec![("k", VType::int32())]).required(),
            int_bounds(&[(0, 5), (5, 10)]),
        )
        .unwrap(),
        vec![vec![row(1, 10), row(3, 30)], vec![row(7, 70)]],
        pool.clone(),
    )
    .unwrap();
    let right = OrderedRvd::from_annotations(
        rtyp,
        OrderedPartitioner::new(
            VType::struct_of(vec![("k", VType::int32())]).required(),
            int_bounds(&[(0, 12)]),
        )
        .unwrap(),
        vec![vec![row(3, 300), row(11, 1100)]],
        pool,
    )
    .unwrap();

    let joined = left.ordered_join(&right, JoinType::Outer).unwrap();
    joined.validate().unwrap();
    let rows: Vec<(i32, Option<i32>, Option<i32>)> = joined
        .collect()
        .unwrap()
        .iter()
        .map(|a| {
            let f = a.fields().unwrap();
            (f[0].as_i32().unwrap(), f[1].as_i32(), f[2].as_i32())
        })
        .collect();
    assert_eq!(
        rows,
        vec![
            (1, Some(10), None),
            (3, Some(30), Some(300)),
            (7, Some(70), None),
            (11, None, Some(1100)),
        ]
    );

    let inner = left.ordered_join(&right, JoinType::Inner).unwrap();
    assert_eq!(inner.count().unwrap(), 1);
}

#[test]
fn test_map_rows_with_compiled_expression() {
    use strata_expr::{BinOp, FunctionRegistry, Ir, compile};

    let dataset = ranged_dataset(20, 2);
    let row_type = dataset.typ().row_type.clone();
    // row -> {k: row.k, v: row.v + 1}
    let ir = Ir::make_struct(vec![
        ("k", Ir::get_field(Ir::In(0), "k")),
        ("v", Ir::bin(BinOp::Add, Ir::get_field(Ir::In(0), "v"), Ir::I32(1))),
    ]);
    let compiled = Arc::new(
        compile(
            &ir,
            &[row_type.clone()],
            Arc::new(FunctionRegistry::with_builtins()),
        )
        .unwrap(),
    );

    // the output row layout is exactly the compiled routine's result type
    let new_typ = OrderedRvdType::new(
        compiled.typ.clone(),
        vec!["k".to_string(), "v".to_string()],
        vec!["k".to_string()],
    )
    .unwrap();
    let src_type = row_type.clone();
    let mapped = dataset
        .map_rows(
            new_typ,
            Arc::new(move |row, out| {
                // re-root the input row in the output region, then run the
                // compiled routine against that region
                let mut rvb = RegionValueBuilder::new(&src_type);
                rvb.add_region_value(out, &src_type, row.region, row.offset);
                let off = rvb.end();
                let result = compiled
                    .eval_row(out, &[(off as u64, false)], None)?;
                Ok(result as usize)
            }),
        )
        .unwrap();
    mapped.validate().unwrap();
    let rows = mapped.collect().unwrap();
    assert_eq!(rows.len(), 20);
    let f = rows[3].fields().unwrap();
    assert_eq!(f[0].as_i32(), Some(3));
    assert_eq!(f[1].as_i32(), Some(31));
}

#[test]
#[serial_test::serial]
fn test_write_read_round_trip() {
    let dir = tempfile::TempDir::new().unwrap();
    let dataset = ranged_dataset(60, 3);
    dataset
        .write(dir.path(), CodecSpec::zstd(None))
        .unwrap();

    let manifest = std::fs::read_to_string(dir.path().join("metadata.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&manifest).unwrap();
    assert_eq!(parsed["codec"]["id"], "zstd");
    assert_eq!(parsed["partFiles"].as_array().unwrap().len(), 3);
    assert_eq!(parsed["rangeBounds"].as_array().unwrap().len(), 3);

    let back = OrderedRvd::read(dir.path(), LocalPool::new()).unwrap();
    back.validate().unwrap();
    assert_eq!(back.typ(), dataset.typ());
    assert_eq!(back.partitioner(), dataset.partitioner());
    assert_eq!(back.collect().unwrap(), dataset.collect().unwrap());
}

#[test]
fn test_zip_partitions() {
    let a = ranged_dataset(20, 2);
    let b = ranged_dataset(20, 2);
    let typ = Arc::new(a.typ().clone());
    let zipped = a
        .zip_partitions_preserves_partitioning(
            &b,
            a.typ().clone(),
            Arc::new(move |left, right| {
                Ok(Box::new(strata_dataset::stream::MergeUnionStream::new(
                    typ.clone(),
                    left,
                    right,
                )) as Box<dyn strata_dataset::RowStream>)
            }),
        )
        .unwrap();
    assert_eq!(zipped.count().unwrap(), 40);
    zipped.validate().unwrap();
}
