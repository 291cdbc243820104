//! Ordered range partitioner
//!
//! N pairwise non-overlapping, weakly adjacent PK intervals, one per
//! partition: every adjacent pair shares its endpoint with exactly one
//! side inclusive, and no bound is definitely empty. Lookups go through an
//! interval tree built lazily on first use (the broadcast handle of the
//! partitioner); keys outside the overall range clamp to the first or
//! last partition.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::{Arc, OnceLock};
use strata_core::{Annotation, EngineError, ExtOrd, Interval, IntervalTree, VType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderedPartitioner {
    pk_type: VType,
    range_bounds: Vec<Interval>,
    #[serde(skip)]
    tree: OnceLock<Arc<IntervalTree<usize>>>,
}

impl PartialEq for OrderedPartitioner {
    fn eq(&self, other: &Self) -> bool {
        self.pk_type == other.pk_type && self.range_bounds == other.range_bounds
    }
}

impl OrderedPartitioner {
    pub fn new(
        pk_type: VType,
        range_bounds: Vec<Interval>,
    ) -> Result<OrderedPartitioner, EngineError> {
        let p = OrderedPartitioner {
            pk_type,
            range_bounds,
            tree: OnceLock::new(),
        };
        p.check_invariants()?;
        Ok(p)
    }

    fn ord() -> ExtOrd {
        ExtOrd::missing_greatest()
    }

    pub fn pk_type(&self) -> &VType {
        &self.pk_type
    }

    pub fn num_partitions(&self) -> usize {
        self.range_bounds.len()
    }

    pub fn range_bounds(&self) -> &[Interval] {
        &self.range_bounds
    }

    /// The spanning interval of the whole partitioner.
    pub fn range(&self) -> Interval {
        let first = self.range_bounds.first().expect("non-empty partitioner");
        let last = self.range_bounds.last().expect("non-empty partitioner");
        Interval::new(
            first.start.clone(),
            last.end.clone(),
            first.includes_start,
            last.includes_end,
        )
    }

    /// Every exposed partitioner satisfies: strictly ordered bounds,
    /// pairwise non-overlapping, transitively adjacent with exactly one
    /// inclusive endpoint per adjacency, none definitely empty.
    pub fn check_invariants(&self) -> Result<(), EngineError> {
        let ord = Self::ord();
        if self.range_bounds.is_empty() {
            return Err(EngineError::structural("partitioner with no bounds"));
        }
        for (i, bound) in self.range_bounds.iter().enumerate() {
            if ord.compare(&self.pk_type, &bound.start, &bound.end) == Ordering::Greater {
                return Err(EngineError::structural(format!(
                    "bound {} has start after end",
                    i
                )));
            }
            if bound.definitely_empty(&self.pk_type, &ord) {
                return Err(EngineError::structural(format!(
                    "bound {} is definitely empty",
                    i
                )));
            }
        }
        for i in 1..self.range_bounds.len() {
            let prev = &self.range_bounds[i - 1];
            let next = &self.range_bounds[i];
            if ord.compare(&self.pk_type, &prev.end, &next.start) != Ordering::Equal {
                return Err(EngineError::structural(format!(
                    "bounds {} and {} are not adjacent",
                    i - 1,
                    i
                )));
            }
            if prev.includes_end == next.includes_start {
                return Err(EngineError::structural(format!(
                    "adjacency between bounds {} and {} must have exactly one inclusive endpoint",
                    i - 1,
                    i
                )));
            }
        }
        Ok(())
    }

    /// The lazily built lookup tree (shared by reference once built).
    pub fn tree(&self) -> &Arc<IntervalTree<usize>> {
        self.tree.get_or_init(|| {
            Arc::new(IntervalTree::build(
                self.pk_type.clone(),
                Self::ord(),
                self.range_bounds
                    .iter()
                    .cloned()
                    .enumerate()
                    .map(|(i, interval)| (interval, i))
                    .collect(),
            ))
        })
    }

    /// Partition index of a key. A full key (of which PK is a prefix) is
    /// projected down; out-of-range keys clamp to the first or last
    /// partition.
    pub fn get_partition(&self, key: &Annotation) -> usize {
        let pk = self.project(key);
        let ord = Self::ord();
        let range = self.range();
        let below = match ord.compare(&self.pk_type, &pk, &range.start) {
            Ordering::Less => true,
            Ordering::Equal => !range.includes_start,
            Ordering::Greater => false,
        };
        if below {
            return 0;
        }
        let above = match ord.compare(&self.pk_type, &pk, &range.end) {
            Ordering::Greater => true,
            Ordering::Equal => !range.includes_end,
            Ordering::Less => false,
        };
        if above {
            return self.num_partitions() - 1;
        }
        let hits = self.tree().containing_point(&pk);
        assert_eq!(
            hits.len(),
            1,
            "key {:?} must lie in exactly one bound, found {}",
            pk,
            hits.len()
        );
        *hits[0]
    }

    fn project(&self, key: &Annotation) -> Annotation {
        let n = match &self.pk_type.kind {
            strata_core::Kind::Struct(fields) => fields.len(),
            _ => unreachable!("pk type is a struct"),
        };
        match key {
            Annotation::Struct(fields) if fields.len() > n => key.prefix(n),
            _ => key.clone(),
        }
    }

    /// Indices of the partitions whose bounds may overlap `interval`, in
    /// ascending order.
    pub fn get_partition_range(&self, interval: &Interval) -> Vec<usize> {
        self.tree()
            .overlapping(interval)
            .into_iter()
            .copied()
            .collect()
    }

    /// Extend the first bound's start and last bound's end (both made
    /// inclusive) so the range covers `new_range`. The new range must be
    /// over the same PK point type; enlarging across point types is not
    /// supported.
    pub fn enlarge_to_range(
        &self,
        point_typ: &VType,
        new_range: &Interval,
    ) -> Result<OrderedPartitioner, EngineError> {
        if point_typ != &self.pk_type {
            return Err(EngineError::user(format!(
                "cannot enlarge partitioner over {} to a range over {}",
                self.pk_type, point_typ
            )));
        }
        let ord = Self::ord();
        let mut bounds = self.range_bounds.clone();
        let first = bounds.first_mut().expect("non-empty partitioner");
        if ord.compare(&self.pk_type, &new_range.start, &first.start) == Ordering::Less {
            first.start = new_range.start.clone();
            first.includes_start = true;
        }
        let last = bounds.last_mut().expect("non-empty partitioner");
        if ord.compare(&self.pk_type, &new_range.end, &last.end) == Ordering::Greater {
            last.end = new_range.end.clone();
            last.includes_end = true;
        }
        OrderedPartitioner::new(self.pk_type.clone(), bounds)
    }

    /// Merge contiguous partitions into the groups whose final indices are
    /// `new_part_end` (ascending, last = numPartitions - 1).
    pub fn coalesce_range_bounds(
        &self,
        new_part_end: &[usize],
    ) -> Result<OrderedPartitioner, EngineError> {
        let mut bounds = Vec::with_capacity(new_part_end.len());
        let mut prev: isize = -1;
        for &end in new_part_end {
            let start_bound = &self.range_bounds[(prev + 1) as usize];
            let end_bound = &self.range_bounds[end];
            bounds.push(Interval::new(
                start_bound.start.clone(),
                end_bound.end.clone(),
                start_bound.includes_start,
                end_bound.includes_end,
            ));
            prev = end as isize;
        }
        OrderedPartitioner::new(self.pk_type.clone(), bounds)
    }

    /// Keep the bounds at `keep` (ascending). Gaps left by dropped
    /// partitions are folded into the preceding kept bound so adjacency
    /// survives.
    pub fn subset(&self, keep: &[usize]) -> Result<OrderedPartitioner, EngineError> {
        let mut bounds: Vec<Interval> =
            keep.iter().map(|&i| self.range_bounds[i].clone()).collect();
        for i in 0..bounds.len().saturating_sub(1) {
            let next_start = bounds[i + 1].start.clone();
            let next_includes = bounds[i + 1].includes_start;
            bounds[i].end = next_start;
            bounds[i].includes_end = !next_includes;
        }
        OrderedPartitioner::new(self.pk_type.clone(), bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i32) -> Annotation {
        Annotation::Struct(vec![Annotation::Int32(v)])
    }

    fn pk_type() -> VType {
        VType::struct_of(vec![("k", VType::int32())]).required()
    }

    /// [0,10], (10,20], (20,30]
    fn partitioner() -> OrderedPartitioner {
        OrderedPartitioner::new(
            pk_type(),
            vec![
                Interval::new(int(0), int(10), true, true),
                Interval::new(int(10), int(20), false, true),
                Interval::new(int(20), int(30), false, true),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_lookup_and_clamping() {
        let p = partitioner();
        assert_eq!(p.get_partition(&int(0)), 0);
        assert_eq!(p.get_partition(&int(10)), 0);
        assert_eq!(p.get_partition(&int(11)), 1);
        assert_eq!(p.get_partition(&int(30)), 2);
        // out of range clamps
        assert_eq!(p.get_partition(&int(-5)), 0);
        assert_eq!(p.get_partition(&int(99)), 2);
    }

    #[test]
    fn test_full_key_projects_to_pk() {
        let p = partitioner();
        let full = Annotation::Struct(vec![Annotation::Int32(15), Annotation::Int32(999)]);
        assert_eq!(p.get_partition(&full), 1);
    }

    #[test]
    fn test_partition_range() {
        let p = partitioner();
        let q = Interval::new(int(5), int(25), true, true);
        assert_eq!(p.get_partition_range(&q), vec![0, 1, 2]);
        let q = Interval::new(int(12), int(13), true, true);
        assert_eq!(p.get_partition_range(&q), vec![1]);
    }

    #[test]
    fn test_invariant_rejects_overlap_and_gap() {
        // gap between 10 and 12
        assert!(
            OrderedPartitioner::new(
                pk_type(),
                vec![
                    Interval::new(int(0), int(10), true, true),
                    Interval::new(int(12), int(20), false, true),
                ],
            )
            .is_err()
        );
        // both endpoints inclusive at the adjacency
        assert!(
            OrderedPartitioner::new(
                pk_type(),
                vec![
                    Interval::new(int(0), int(10), true, true),
                    Interval::new(int(10), int(20), true, true),
                ],
            )
            .is_err()
        );
    }

    #[test]
    fn test_enlarge_to_range() {
        let p = partitioner();
        let wider = p
            .enlarge_to_range(&pk_type(), &Interval::new(int(-10), int(50), true, true))
            .unwrap();
        assert_eq!(wider.range_bounds()[0].start, int(-10));
        assert_eq!(wider.range_bounds()[2].end, int(50));
        assert_eq!(wider.get_partition(&int(-5)), 0);
        assert_eq!(wider.get_partition(&int(45)), 2);
    }

    #[test]
    fn test_enlarge_rejects_different_point_type() {
        let p = partitioner();
        let other = VType::struct_of(vec![("k", VType::str())]).required();
        let err = p
            .enlarge_to_range(&other, &Interval::new(int(0), int(1), true, true))
            .unwrap_err();
        assert!(matches!(err, EngineError::User(_)));
    }

    #[test]
    fn test_coalesce_range_bounds() {
        let p = partitioner();
        let merged = p.coalesce_range_bounds(&[1, 2]).unwrap();
        assert_eq!(merged.num_partitions(), 2);
        assert_eq!(merged.range_bounds()[0], Interval::new(int(0), int(20), true, true));
        assert_eq!(merged.range_bounds()[1], Interval::new(int(20), int(30), false, true));
    }

    #[test]
    fn test_subset_folds_gaps() {
        let p = partitioner();
        let kept = p.subset(&[0, 2]).unwrap();
        assert_eq!(kept.num_partitions(), 2);
        // partition 1's range folds into partition 0's bound
        assert_eq!(kept.range_bounds()[0], Interval::new(int(0), int(20), true, true));
        kept.check_invariants().unwrap();
    }
}
