//! The ordered distributed dataset
//!
//! An `OrderedRvd` is (type, partitioner, partition sources, pool): a
//! stream of region values per partition, non-decreasing by the full key
//! within each partition, with every row's partition key inside its
//! partition's bound. Operations either preserve the partitioner (map,
//! filter, zip) or recompute bounds deterministically (head, coalesce,
//! subset); a shuffle re-establishes both orderings.

use crate::coerce::{scan_infos, shuffle};
use crate::config::EngineConfig;
use crate::join::{JoinType, MergeJoinStream, joined_row_type};
use crate::partitioner::OrderedPartitioner;
use crate::pool::{ComputePool, run_typed};
use crate::rvd_type::OrderedRvdType;
use crate::stream::{
    ConcatStream, DistinctByKeyStream, FilterStream, GroupByKeyStream, MapStream, MemStream,
    MergeUnionStream, PartFn, PartSource, RowMapFn, RowPredFn, RowStream, SampleStream,
    TakeStream, drive_collect, drive_count, drive_encode,
};
use std::cmp::Ordering;
use std::sync::Arc;
use strata_core::codec::encode_row;
use strata_core::{
    Annotation, EngineError, ExtOrd, Field, Interval, IntervalTree, Kind, Region,
    RegionValueBuilder, VType,
};

pub type PartIdxFn = Arc<
    dyn Fn(usize, Box<dyn RowStream>) -> Result<Box<dyn RowStream>, EngineError> + Send + Sync,
>;
pub type ZipPartFn = Arc<
    dyn Fn(Box<dyn RowStream>, Box<dyn RowStream>) -> Result<Box<dyn RowStream>, EngineError>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct OrderedRvd {
    typ: OrderedRvdType,
    partitioner: OrderedPartitioner,
    parts: Vec<PartSource>,
    pool: Arc<dyn ComputePool>,
}

impl OrderedRvd {
    pub fn new(
        typ: OrderedRvdType,
        partitioner: OrderedPartitioner,
        parts: Vec<PartSource>,
        pool: Arc<dyn ComputePool>,
    ) -> Result<OrderedRvd, EngineError> {
        if partitioner.num_partitions() != parts.len() {
            return Err(EngineError::structural(format!(
                "{} bounds for {} partitions",
                partitioner.num_partitions(),
                parts.len()
            )));
        }
        if partitioner.pk_type() != &typ.pk_type() {
            return Err(EngineError::structural(format!(
                "partitioner keyed by {} but dataset partition key is {}",
                partitioner.pk_type(),
                typ.pk_type()
            )));
        }
        Ok(OrderedRvd {
            typ,
            partitioner,
            parts,
            pool,
        })
    }

    /// Build from in-memory annotations, one vector per partition. The
    /// caller asserts rows are K-sorted and correctly assigned; `validate`
    /// checks.
    pub fn from_annotations(
        typ: OrderedRvdType,
        partitioner: OrderedPartitioner,
        partitions: Vec<Vec<Annotation>>,
        pool: Arc<dyn ComputePool>,
    ) -> Result<OrderedRvd, EngineError> {
        let parts = partitions
            .into_iter()
            .map(|rows| {
                let encoded: Vec<Vec<u8>> = rows
                    .iter()
                    .map(|a| {
                        let mut region = Region::new();
                        let mut rvb = RegionValueBuilder::new(&typ.row_type);
                        rvb.add_annotation(&mut region, &typ.row_type, a);
                        let off = rvb.end();
                        encode_row(&typ.row_type, &region, off)
                    })
                    .collect();
                MemStream::source(Arc::new(encoded))
            })
            .collect();
        OrderedRvd::new(typ, partitioner, parts, pool)
    }

    /// Build an ordered dataset from arbitrarily ordered partition
    /// sources, choosing AS_IS / LOCAL_SORT / SHUFFLE from observed
    /// sortedness.
    pub fn coerce(
        typ: OrderedRvdType,
        pool: Arc<dyn ComputePool>,
        config: &EngineConfig,
        sources: Vec<PartSource>,
    ) -> Result<OrderedRvd, EngineError> {
        crate::coerce::coerce(typ, pool, config, sources)
    }

    pub fn typ(&self) -> &OrderedRvdType {
        &self.typ
    }

    pub fn partitioner(&self) -> &OrderedPartitioner {
        &self.partitioner
    }

    pub fn num_partitions(&self) -> usize {
        self.parts.len()
    }

    pub(crate) fn parts(&self) -> &[PartSource] {
        &self.parts
    }

    pub(crate) fn pool(&self) -> &Arc<dyn ComputePool> {
        &self.pool
    }

    /// Check the dataset invariant on every partition: rows non-decreasing
    /// by K, each row's PK inside its partition's bound.
    pub fn validate(&self) -> Result<(), EngineError> {
        let ord = ExtOrd::missing_greatest();
        let jobs: Vec<_> = self
            .parts
            .iter()
            .enumerate()
            .map(|(idx, source)| {
                let source = source.clone();
                let typ = self.typ.clone();
                let bound = self.partitioner.range_bounds()[idx].clone();
                let k_type = typ.k_type();
                let pk_type = typ.pk_type();
                let pk_len = typ.pk_len();
                move || -> Result<(), EngineError> {
                    let mut stream = source()?;
                    let mut prev: Option<Annotation> = None;
                    while stream.advance()? {
                        let row = stream.current();
                        let key = typ.key_annotation(row.region, row.offset);
                        if let Some(p) = &prev {
                            if ord.compare(&k_type, p, &key) == Ordering::Greater {
                                return Err(EngineError::structural(format!(
                                    "partition {}: keys not monotone at {:?}",
                                    idx, key
                                )));
                            }
                        }
                        let pk = key.prefix(pk_len);
                        if !bound.contains(&pk_type, &ord, &pk) {
                            return Err(EngineError::structural(format!(
                                "partition {}: key {:?} outside bound",
                                idx, pk
                            )));
                        }
                        prev = Some(key);
                    }
                    Ok(())
                }
            })
            .collect();
        run_typed::<(), _>(self.pool.as_ref(), jobs)?;
        Ok(())
    }

    fn with_parts(&self, typ: OrderedRvdType, parts: Vec<PartSource>) -> OrderedRvd {
        OrderedRvd {
            typ,
            partitioner: self.partitioner.clone(),
            parts,
            pool: self.pool.clone(),
        }
    }

    /// Rewrite every partition stream; the caller guarantees sort order
    /// and PK assignment are preserved.
    pub fn map_partitions_preserves_partitioning(
        &self,
        new_typ: OrderedRvdType,
        f: PartFn,
    ) -> Result<OrderedRvd, EngineError> {
        let f2: PartIdxFn = Arc::new(move |_idx, stream| f(stream));
        self.map_partitions_with_index_preserves_partitioning(new_typ, f2)
    }

    pub fn map_partitions_with_index_preserves_partitioning(
        &self,
        new_typ: OrderedRvdType,
        f: PartIdxFn,
    ) -> Result<OrderedRvd, EngineError> {
        if new_typ.pk_type() != self.typ.pk_type() {
            return Err(EngineError::user(format!(
                "partition-preserving map cannot change the partition key ({} to {})",
                self.typ.pk_type(),
                new_typ.pk_type()
            )));
        }
        let parts = self
            .parts
            .iter()
            .enumerate()
            .map(|(idx, source)| {
                let source = source.clone();
                let f = f.clone();
                Arc::new(move || f(idx, source()?)) as PartSource
            })
            .collect();
        Ok(self.with_parts(new_typ, parts))
    }

    /// Row-to-row rewrite preserving keys.
    pub fn map_rows(
        &self,
        new_typ: OrderedRvdType,
        f: RowMapFn,
    ) -> Result<OrderedRvd, EngineError> {
        let g: PartFn = Arc::new(move |stream| {
            Ok(Box::new(MapStream::new(stream, f.clone())) as Box<dyn RowStream>)
        });
        self.map_partitions_preserves_partitioning(new_typ, g)
    }

    pub fn filter(&self, p: RowPredFn) -> OrderedRvd {
        let parts = self
            .parts
            .iter()
            .map(|source| {
                let source = source.clone();
                let p = p.clone();
                Arc::new(move || {
                    Ok(Box::new(FilterStream::new(source()?, p.clone())) as Box<dyn RowStream>)
                }) as PartSource
            })
            .collect();
        self.with_parts(self.typ.clone(), parts)
    }

    /// Seeded Bernoulli sample; keeps the partitioner.
    pub fn sample(&self, p: f64, seed: u64) -> OrderedRvd {
        let parts = self
            .parts
            .iter()
            .enumerate()
            .map(|(idx, source)| {
                let source = source.clone();
                Arc::new(move || {
                    Ok(Box::new(SampleStream::new(
                        source()?,
                        p,
                        seed.wrapping_add(idx as u64),
                    )) as Box<dyn RowStream>)
                }) as PartSource
            })
            .collect();
        self.with_parts(self.typ.clone(), parts)
    }

    /// Pair partitions elementwise with another dataset sharing this
    /// partitioner.
    pub fn zip_partitions_preserves_partitioning(
        &self,
        other: &OrderedRvd,
        new_typ: OrderedRvdType,
        f: ZipPartFn,
    ) -> Result<OrderedRvd, EngineError> {
        if self.partitioner != other.partitioner {
            return Err(EngineError::user(
                "zip requires identically partitioned datasets",
            ));
        }
        let parts = self
            .parts
            .iter()
            .zip(&other.parts)
            .map(|(a, b)| {
                let a = a.clone();
                let b = b.clone();
                let f = f.clone();
                Arc::new(move || f(a()?, b()?)) as PartSource
            })
            .collect();
        Ok(self.with_parts(new_typ, parts))
    }

    pub fn count(&self) -> Result<u64, EngineError> {
        let jobs: Vec<_> = self
            .parts
            .iter()
            .map(|source| {
                let source = source.clone();
                move || drive_count(source()?)
            })
            .collect();
        Ok(run_typed(self.pool.as_ref(), jobs)?.into_iter().sum())
    }

    /// All rows in global key order (partition order, then within).
    pub fn collect(&self) -> Result<Vec<Annotation>, EngineError> {
        let jobs: Vec<_> = self
            .parts
            .iter()
            .map(|source| {
                let source = source.clone();
                let row_type = self.typ.row_type.clone();
                move || drive_collect(source()?, &row_type)
            })
            .collect();
        Ok(run_typed::<Vec<Annotation>, _>(self.pool.as_ref(), jobs)?
            .into_iter()
            .flatten()
            .collect())
    }

    pub(crate) fn partition_counts(&self) -> Result<Vec<u64>, EngineError> {
        let jobs: Vec<_> = self
            .parts
            .iter()
            .map(|source| {
                let source = source.clone();
                move || drive_count(source()?)
            })
            .collect();
        run_typed(self.pool.as_ref(), jobs)
    }

    /// First `n` rows; tail partitions are dropped and the bounds
    /// truncated.
    pub fn head(&self, n: u64) -> Result<OrderedRvd, EngineError> {
        let counts = self.partition_counts()?;
        let mut cum = 0u64;
        let mut last = 0usize;
        let mut take_in_last = 0u64;
        for (idx, count) in counts.iter().enumerate() {
            last = idx;
            if cum + count >= n {
                take_in_last = n - cum;
                break;
            }
            cum += count;
            take_in_last = *count;
        }
        let keep: Vec<usize> = (0..=last).collect();
        let mut parts: Vec<PartSource> = self.parts[..=last].to_vec();
        let source = parts[last].clone();
        parts[last] = Arc::new(move || {
            Ok(Box::new(TakeStream::new(source()?, take_in_last as usize)) as Box<dyn RowStream>)
        });
        Ok(OrderedRvd {
            typ: self.typ.clone(),
            partitioner: self.partitioner.subset(&keep)?,
            parts,
            pool: self.pool.clone(),
        })
    }

    /// Merge contiguous partitions per the final indices in `part_ends`.
    pub fn block_coalesce(&self, part_ends: &[usize]) -> Result<OrderedRvd, EngineError> {
        if part_ends.last() != Some(&(self.num_partitions() - 1)) {
            return Err(EngineError::user(format!(
                "block coalesce must end at partition {}, got {:?}",
                self.num_partitions() - 1,
                part_ends
            )));
        }
        let mut parts = Vec::with_capacity(part_ends.len());
        let mut prev: isize = -1;
        for &end in part_ends {
            let members: Vec<PartSource> = self.parts[(prev + 1) as usize..=end].to_vec();
            parts.push(Arc::new(move || {
                Ok(Box::new(ConcatStream::new(members.clone())) as Box<dyn RowStream>)
            }) as PartSource);
            prev = end as isize;
        }
        Ok(OrderedRvd {
            typ: self.typ.clone(),
            partitioner: self.partitioner.coalesce_range_bounds(part_ends)?,
            parts,
            pool: self.pool.clone(),
        })
    }

    /// Merge into at most `max` evenly sized groups by partition count.
    pub fn naive_coalesce(&self, max: usize) -> Result<OrderedRvd, EngineError> {
        let n = self.num_partitions();
        if max >= n {
            return Ok(self.clone());
        }
        let ends: Vec<usize> = (1..=max).map(|g| g * n / max - 1).collect();
        self.block_coalesce(&ends)
    }

    /// Reduce to at most `max` partitions. Without shuffling, contiguous
    /// partitions merge along cumulative row counts (binary search with
    /// tie-advance keeps the ends monotone); with shuffling, key ranges
    /// are resampled and rows redistributed.
    pub fn coalesce(&self, max: usize, shuffle_rows: bool) -> Result<OrderedRvd, EngineError> {
        let n = self.num_partitions();
        if !shuffle_rows {
            if max >= n {
                return Ok(self.clone());
            }
            let counts = self.partition_counts()?;
            let mut cum = Vec::with_capacity(n);
            let mut total = 0u64;
            for c in &counts {
                total += c;
                cum.push(total);
            }
            let mut ends: Vec<usize> = Vec::with_capacity(max);
            for g in 1..=max as u64 {
                let target = total * g / max as u64;
                let mut end = cum.partition_point(|&c| c < target);
                if end == n {
                    end = n - 1;
                }
                if let Some(&prev) = ends.last() {
                    if end <= prev {
                        end = prev + 1;
                    }
                }
                if end >= n - 1 {
                    ends.push(n - 1);
                    break;
                }
                ends.push(end);
            }
            if ends.last() != Some(&(n - 1)) {
                ends.push(n - 1);
            }
            self.block_coalesce(&ends)
        } else {
            let config = EngineConfig::default();
            let infos = scan_infos(&self.typ, self.pool.as_ref(), &config, &self.parts)?;
            shuffle(
                self.typ.clone(),
                Arc::new(self.typ.clone()),
                self.pool.clone(),
                &infos,
                &self.parts,
                max,
            )
        }
    }

    /// Keep the partitions at `keep` (ascending).
    pub fn subset_partitions(&self, keep: &[usize]) -> Result<OrderedRvd, EngineError> {
        let parts = keep.iter().map(|&i| self.parts[i].clone()).collect();
        Ok(OrderedRvd {
            typ: self.typ.clone(),
            partitioner: self.partitioner.subset(keep)?,
            parts,
            pool: self.pool.clone(),
        })
    }

    /// Two-pointer K-merge of identically typed, identically partitioned
    /// datasets.
    pub fn partition_sorted_union(&self, other: &OrderedRvd) -> Result<OrderedRvd, EngineError> {
        if self.typ != other.typ {
            return Err(EngineError::user("union requires identical types"));
        }
        if self.partitioner != other.partitioner {
            return Err(EngineError::user(
                "union requires identical partitioners",
            ));
        }
        let typ = Arc::new(self.typ.clone());
        let parts = self
            .parts
            .iter()
            .zip(&other.parts)
            .map(|(a, b)| {
                let a = a.clone();
                let b = b.clone();
                let typ = typ.clone();
                Arc::new(move || {
                    Ok(Box::new(MergeUnionStream::new(typ.clone(), a()?, b()?))
                        as Box<dyn RowStream>)
                }) as PartSource
            })
            .collect();
        Ok(self.with_parts(self.typ.clone(), parts))
    }

    /// Group each equal-by-key run into one row of
    /// `(key..., values_field: [value struct...])`.
    pub fn group_by_key(&self, values_field: &str) -> Result<OrderedRvd, EngineError> {
        let mut fields: Vec<Field> = Vec::new();
        let row_fields = self.typ.row_fields();
        for name in &self.typ.key {
            fields.push(
                row_fields
                    .iter()
                    .find(|f| f.name == *name)
                    .expect("validated at construction")
                    .clone(),
            );
        }
        fields.push(Field {
            name: values_field.to_string(),
            typ: VType::array_of(self.typ.value_type()).required(),
        });
        let out_row_type = VType::new(Kind::Struct(fields), true);
        let new_typ = OrderedRvdType::new(
            out_row_type.clone(),
            self.typ.key.clone(),
            self.typ.partition_key.clone(),
        )?;
        let typ = Arc::new(self.typ.clone());
        let f: PartFn = Arc::new(move |stream| {
            Ok(Box::new(GroupByKeyStream::new(
                typ.clone(),
                out_row_type.clone(),
                stream,
            )) as Box<dyn RowStream>)
        });
        self.map_partitions_preserves_partitioning(new_typ, f)
    }

    /// First row of each equal-by-key run.
    pub fn distinct_by_key(&self) -> OrderedRvd {
        let typ = Arc::new(self.typ.clone());
        let parts = self
            .parts
            .iter()
            .map(|source| {
                let source = source.clone();
                let typ = typ.clone();
                Arc::new(move || {
                    Ok(Box::new(DistinctByKeyStream::new(typ.clone(), source()?))
                        as Box<dyn RowStream>)
                }) as PartSource
            })
            .collect();
        self.with_parts(self.typ.clone(), parts)
    }

    /// Redistribute this dataset's rows over another partitioner (the PK
    /// types must match): each new partition concatenates the slices of
    /// the old partitions its bound overlaps.
    pub fn constrain_to_ordered_partitioner(
        &self,
        new_partitioner: OrderedPartitioner,
    ) -> Result<OrderedRvd, EngineError> {
        if new_partitioner.pk_type() != self.partitioner.pk_type() {
            return Err(EngineError::user(format!(
                "cannot constrain a {} partitioner to {}",
                self.partitioner.pk_type(),
                new_partitioner.pk_type()
            )));
        }
        let typ = Arc::new(self.typ.clone());
        let pk_type = self.typ.pk_type();
        let ord = ExtOrd::missing_greatest();
        let parts: Vec<PartSource> = new_partitioner
            .range_bounds()
            .iter()
            .map(|bound| {
                let overlapping: Vec<PartSource> = self
                    .partitioner
                    .get_partition_range(bound)
                    .into_iter()
                    .map(|i| self.parts[i].clone())
                    .collect();
                let bound = bound.clone();
                let typ = typ.clone();
                let pk_type = pk_type.clone();
                Arc::new(move || {
                    let concat = Box::new(ConcatStream::new(overlapping.clone()));
                    let bound = bound.clone();
                    let typ2 = typ.clone();
                    let pk_type = pk_type.clone();
                    let pred: RowPredFn = Arc::new(move |row| {
                        let pk = typ2.pk_annotation(row.region, row.offset);
                        Ok(bound.contains(&pk_type, &ord, &pk))
                    });
                    Ok(Box::new(FilterStream::new(concat, pred)) as Box<dyn RowStream>)
                }) as PartSource
            })
            .collect();
        OrderedRvd::new(self.typ.clone(), new_partitioner, parts, self.pool.clone())
    }

    /// Key both sides, align partitioners, and merge-join co-partitioned
    /// streams.
    pub fn ordered_join(
        &self,
        right: &OrderedRvd,
        how: JoinType,
    ) -> Result<OrderedRvd, EngineError> {
        self.join_impl(right, how, false)
    }

    /// Like `ordered_join`, with duplicate keys on the right collapsed to
    /// their first row.
    pub fn ordered_join_distinct(
        &self,
        right: &OrderedRvd,
        how: JoinType,
    ) -> Result<OrderedRvd, EngineError> {
        self.join_impl(right, how, true)
    }

    /// The raw outer-aligned merge of two keyed datasets; both sides'
    /// unmatched rows survive with the other side missing.
    pub fn ordered_zip_join(&self, right: &OrderedRvd) -> Result<OrderedRvd, EngineError> {
        self.join_impl(right, JoinType::Outer, false)
    }

    fn join_impl(
        &self,
        right: &OrderedRvd,
        how: JoinType,
        distinct: bool,
    ) -> Result<OrderedRvd, EngineError> {
        let aligned = self
            .partitioner
            .enlarge_to_range(right.partitioner.pk_type(), &right.partitioner.range())?;
        let left = self.constrain_to_ordered_partitioner(aligned.clone())?;
        let right2 = right.constrain_to_ordered_partitioner(aligned.clone())?;

        let out_row = joined_row_type(&self.typ, &right.typ, how)?;
        let out_typ = OrderedRvdType::new(
            out_row.clone(),
            self.typ.key.clone(),
            self.typ.partition_key.clone(),
        )?;
        let left_typ = Arc::new(self.typ.clone());
        let right_typ = Arc::new(right.typ.clone());

        let parts = left
            .parts
            .iter()
            .zip(&right2.parts)
            .map(|(a, b)| {
                let a = a.clone();
                let b = b.clone();
                let left_typ = left_typ.clone();
                let right_typ = right_typ.clone();
                let out_row = out_row.clone();
                Arc::new(move || {
                    Ok(Box::new(MergeJoinStream::new(
                        left_typ.clone(),
                        right_typ.clone(),
                        out_row.clone(),
                        how,
                        distinct,
                        a()?,
                        b()?,
                    )) as Box<dyn RowStream>)
                }) as PartSource
            })
            .collect();
        OrderedRvd::new(out_typ, aligned, parts, self.pool.clone())
    }

    /// Narrow to the partitions whose bounds may overlap the query
    /// intervals, then filter rows by PK membership.
    pub fn filter_intervals(&self, intervals: &[Interval]) -> Result<OrderedRvd, EngineError> {
        let ord = ExtOrd::missing_greatest();
        let pk_type = self.typ.pk_type();
        let mut keep: Vec<usize> = intervals
            .iter()
            .flat_map(|interval| self.partitioner.get_partition_range(interval))
            .collect();
        keep.sort_unstable();
        keep.dedup();
        if keep.is_empty() {
            keep.push(0);
        }
        let narrowed = self.subset_partitions(&keep)?;
        let tree = Arc::new(IntervalTree::build(
            pk_type.clone(),
            ord,
            intervals.iter().cloned().enumerate().map(|(i, iv)| (iv, i)).collect(),
        ));
        let typ = Arc::new(self.typ.clone());
        let pred: RowPredFn = Arc::new(move |row| {
            let pk = typ.pk_annotation(row.region, row.offset);
            Ok(!tree.containing_point(&pk).is_empty())
        });
        Ok(narrowed.filter(pred))
    }

    /// Encode every partition's rows (test and write plumbing).
    pub(crate) fn encode_partitions(&self) -> Result<Vec<Vec<Vec<u8>>>, EngineError> {
        let jobs: Vec<_> = self
            .parts
            .iter()
            .map(|source| {
                let source = source.clone();
                let row_type = self.typ.row_type.clone();
                move || drive_encode(source()?, &row_type)
            })
            .collect();
        run_typed(self.pool.as_ref(), jobs)
    }
}
