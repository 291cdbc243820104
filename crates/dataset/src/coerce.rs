//! Coercion: building an ordered dataset from an arbitrary stream
//!
//! One sampling scan per partition produces a `PartitionKeyInfo` (min/max
//! key, observed sortedness, reservoir of sampled keys). Partitions sort
//! by min key, then the cheapest sufficient strategy wins:
//!
//! - AS_IS: every partition is K-sorted and partition key ranges only
//!   touch at boundaries. Boundary-equal PK runs are shifted onto the
//!   predecessor's tail ("adjustments").
//! - AS_IS + LOCAL_SORT: partitions are at least PK-sorted with the same
//!   boundary property; PK-equivalent runs are lazily K-sorted through a
//!   priority queue on read.
//! - SHUFFLE: anything else. Target ranges come from the sampled keys
//!   (ties extended so no two partitions share a PK), rows ship keyed by
//!   K, and each target partition is sorted on arrival.

use crate::config::EngineConfig;
use crate::partitioner::OrderedPartitioner;
use crate::pool::{ComputePool, run_typed};
use crate::rvd::OrderedRvd;
use crate::rvd_type::OrderedRvdType;
use crate::stream::{
    ConcatStream, DropLeadingPkStream, LocalSortStream, MemStream, PartSource, RowStream,
    TakeLeadingPkStream,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use strata_core::codec::{decode_row, encode_row};
use strata_core::{Annotation, EngineError, ExtOrd, Interval};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Sortedness {
    Unsorted,
    /// Non-decreasing by PK, but not by full K
    PSorted,
    /// Non-decreasing by full K
    KSorted,
}

/// Per-partition facts gathered by the sampling scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionKeyInfo {
    pub part_idx: usize,
    pub n_rows: u64,
    pub min_k: Annotation,
    pub max_k: Annotation,
    pub sortedness: Sortedness,
    /// Reservoir of sampled full keys
    pub samples: Vec<Annotation>,
}

/// Scan one partition: sortedness, key extrema, reservoir sample.
fn scan_partition(
    typ: &OrderedRvdType,
    source: &PartSource,
    part_idx: usize,
    reservoir: usize,
) -> Result<Option<PartitionKeyInfo>, EngineError> {
    let ord = ExtOrd::missing_greatest();
    let k_type = typ.k_type();
    let pk_len = typ.pk_len();
    let mut stream = source()?;
    let mut rng = StdRng::seed_from_u64(part_idx as u64);

    let mut n_rows = 0u64;
    let mut prev: Option<Annotation> = None;
    let mut min_k: Option<Annotation> = None;
    let mut max_k: Option<Annotation> = None;
    let mut k_sorted = true;
    let mut pk_sorted = true;
    let mut samples: Vec<Annotation> = Vec::new();

    while stream.advance()? {
        let row = stream.current();
        let key = typ.key_annotation(row.region, row.offset);
        if let Some(prev_key) = &prev {
            match ord.compare(&k_type, prev_key, &key) {
                Ordering::Greater => {
                    k_sorted = false;
                    let fields = k_type.struct_fields().expect("key type is a struct");
                    if ord.compare_fields(
                        &fields,
                        prev_key.fields().unwrap(),
                        key.fields().unwrap(),
                        pk_len,
                    ) == Ordering::Greater
                    {
                        pk_sorted = false;
                    }
                }
                _ => {}
            }
        }
        min_k = Some(match min_k {
            None => key.clone(),
            Some(m) => {
                if ord.compare(&k_type, &key, &m) == Ordering::Less {
                    key.clone()
                } else {
                    m
                }
            }
        });
        max_k = Some(match max_k {
            None => key.clone(),
            Some(m) => {
                if ord.compare(&k_type, &key, &m) == Ordering::Greater {
                    key.clone()
                } else {
                    m
                }
            }
        });
        // reservoir sampling
        let i = n_rows as usize;
        if samples.len() < reservoir {
            samples.push(key.clone());
        } else {
            let j = rng.gen_range(0..=i);
            if j < reservoir {
                samples[j] = key.clone();
            }
        }
        prev = Some(key);
        n_rows += 1;
    }

    Ok(min_k.map(|min_k| PartitionKeyInfo {
        part_idx,
        n_rows,
        min_k,
        max_k: max_k.expect("max exists when min does"),
        sortedness: if k_sorted {
            Sortedness::KSorted
        } else if pk_sorted {
            Sortedness::PSorted
        } else {
            Sortedness::Unsorted
        },
        samples,
    }))
}

/// Scan every partition, dropping the empty ones; the survivors come back
/// sorted by min key.
pub(crate) fn scan_infos(
    typ: &OrderedRvdType,
    pool: &dyn ComputePool,
    config: &EngineConfig,
    sources: &[PartSource],
) -> Result<Vec<PartitionKeyInfo>, EngineError> {
    let ord = ExtOrd::missing_greatest();
    let k_type = typ.k_type();
    let reservoir = config
        .sample_per_partition
        .min(config.max_global_samples / sources.len().max(1))
        .max(1);
    let jobs: Vec<_> = sources
        .iter()
        .enumerate()
        .map(|(i, source)| {
            let typ = typ.clone();
            let source = source.clone();
            move || scan_partition(&typ, &source, i, reservoir)
        })
        .collect();
    let mut infos: Vec<PartitionKeyInfo> = run_typed(pool, jobs)?.into_iter().flatten().collect();
    infos.sort_by(|a, b| ord.compare(&k_type, &a.min_k, &b.min_k));
    Ok(infos)
}

/// Build an ordered dataset from arbitrarily ordered partition sources.
pub fn coerce(
    typ: OrderedRvdType,
    pool: Arc<dyn ComputePool>,
    config: &EngineConfig,
    sources: Vec<PartSource>,
) -> Result<OrderedRvd, EngineError> {
    let ord = ExtOrd::missing_greatest();
    let pk_type = typ.pk_type();
    let pk_len = typ.pk_len();
    let typ_arc = Arc::new(typ.clone());

    let infos = scan_infos(&typ, pool.as_ref(), config, &sources)?;

    if infos.is_empty() {
        // an empty dataset still carries one (all-missing) bound
        let missing_pk = Annotation::Struct(vec![Annotation::Missing; pk_len]);
        let partitioner = OrderedPartitioner::new(
            pk_type,
            vec![Interval::new(missing_pk.clone(), missing_pk, true, true)],
        )?;
        return OrderedRvd::new(
            typ,
            partitioner,
            vec![MemStream::source(Arc::new(Vec::new()))],
            pool,
        );
    }

    // boundary property: adjacent pk ranges may only touch, never overlap
    let mut boundaries_ok = true;
    for pair in infos.windows(2) {
        let prev_max_pk = pair[0].max_k.prefix(pk_len);
        let next_min_pk = pair[1].min_k.prefix(pk_len);
        if ord.compare(&pk_type, &prev_max_pk, &next_min_pk) == Ordering::Greater {
            boundaries_ok = false;
            break;
        }
    }
    let worst = infos
        .iter()
        .map(|i| i.sortedness)
        .min()
        .expect("non-empty infos");

    if boundaries_ok && worst >= Sortedness::PSorted {
        let strategy = if worst == Sortedness::KSorted {
            "AS_IS"
        } else {
            "AS_IS+LOCAL_SORT"
        };
        debug!(strategy, partitions = infos.len(), "coercion strategy chosen");
        coerce_as_is(typ, typ_arc, pool, &infos, &sources, worst)
    } else {
        debug!(
            strategy = "SHUFFLE",
            partitions = infos.len(),
            "coercion strategy chosen"
        );
        let n_out = infos.len();
        shuffle(typ, typ_arc, pool, &infos, &sources, n_out)
    }
}

/// Reassemble the sorted partitions in place, shifting boundary-equal PK
/// runs onto the predecessor and K-sorting runs where needed.
fn coerce_as_is(
    typ: OrderedRvdType,
    typ_arc: Arc<OrderedRvdType>,
    pool: Arc<dyn ComputePool>,
    infos: &[PartitionKeyInfo],
    sources: &[PartSource],
    worst: Sortedness,
) -> Result<OrderedRvd, EngineError> {
    let ord = ExtOrd::missing_greatest();
    let pk_type = typ.pk_type();
    let pk_len = typ.pk_len();

    struct Group {
        members: Vec<PartSource>,
        /// Leading run of the member after the group, if it shares our
        /// boundary
        tail_donor: Option<PartSource>,
        min_pk: Annotation,
        max_pk: Annotation,
        drops_leading: bool,
        multi_source: bool,
    }

    let mut groups: Vec<Group> = Vec::new();
    let mut i = 0usize;
    let mut prev_boundary: Option<Annotation> = None;
    while i < infos.len() {
        let leader = &infos[i];
        let leader_min_pk = leader.min_k.prefix(pk_len);
        let max_pk = leader.max_k.prefix(pk_len);
        let mut members = vec![sources[leader.part_idx].clone()];
        let drops_leading = prev_boundary
            .as_ref()
            .map(|b| ord.compare(&pk_type, b, &leader_min_pk) == Ordering::Equal)
            .unwrap_or(false);
        i += 1;
        // absorb whole partitions that consist entirely of the boundary PK
        while i < infos.len() {
            let next = &infos[i];
            let next_min = next.min_k.prefix(pk_len);
            let next_max = next.max_k.prefix(pk_len);
            if ord.compare(&pk_type, &next_min, &max_pk) == Ordering::Equal
                && ord.compare(&pk_type, &next_max, &max_pk) == Ordering::Equal
            {
                members.push(sources[next.part_idx].clone());
                i += 1;
            } else {
                break;
            }
        }
        // the next partition may donate its leading boundary-equal run
        let tail_donor = if i < infos.len() {
            let next = &infos[i];
            let next_min = next.min_k.prefix(pk_len);
            if ord.compare(&pk_type, &next_min, &max_pk) == Ordering::Equal {
                Some(sources[next.part_idx].clone())
            } else {
                None
            }
        } else {
            None
        };
        let multi_source = members.len() > 1 || tail_donor.is_some() || drops_leading;
        groups.push(Group {
            members,
            tail_donor,
            min_pk: leader_min_pk,
            max_pk: max_pk.clone(),
            drops_leading,
            multi_source,
        });
        prev_boundary = Some(max_pk);
    }

    let mut bounds = Vec::with_capacity(groups.len());
    let mut new_sources: Vec<PartSource> = Vec::with_capacity(groups.len());
    let mut prev_end: Option<Annotation> = None;
    for group in groups {
        let start = match &prev_end {
            None => (group.min_pk.clone(), true),
            Some(end) => (end.clone(), false),
        };
        bounds.push(Interval::new(start.0, group.max_pk.clone(), start.1, true));
        prev_end = Some(group.max_pk.clone());

        let typ_c = typ_arc.clone();
        let needs_sort = worst == Sortedness::PSorted || group.multi_source;
        let members = group.members;
        let tail_donor = group.tail_donor;
        let drop_boundary = if group.drops_leading {
            Some(group.min_pk.clone())
        } else {
            None
        };
        let take_boundary = group.max_pk.clone();
        let source: PartSource = Arc::new(move || {
            let mut parts: Vec<PartSource> = Vec::new();
            for (idx, member) in members.iter().enumerate() {
                let member = member.clone();
                if idx == 0 {
                    if let Some(boundary) = drop_boundary.clone() {
                        let typ = typ_c.clone();
                        parts.push(Arc::new(move || {
                            Ok(Box::new(DropLeadingPkStream::new(
                                typ.clone(),
                                boundary.clone(),
                                member()?,
                            )) as Box<dyn RowStream>)
                        }));
                        continue;
                    }
                }
                parts.push(member);
            }
            if let Some(donor) = tail_donor.clone() {
                let typ = typ_c.clone();
                let boundary = take_boundary.clone();
                parts.push(Arc::new(move || {
                    Ok(Box::new(TakeLeadingPkStream::new(
                        typ.clone(),
                        boundary.clone(),
                        donor()?,
                    )) as Box<dyn RowStream>)
                }));
            }
            let concat = Box::new(ConcatStream::new(parts)) as Box<dyn RowStream>;
            if needs_sort {
                Ok(Box::new(LocalSortStream::new(typ_c.clone(), concat)) as Box<dyn RowStream>)
            } else {
                Ok(concat)
            }
        });
        new_sources.push(source);
    }

    let partitioner = OrderedPartitioner::new(typ.pk_type(), bounds)?;
    OrderedRvd::new(typ, partitioner, new_sources, pool)
}

/// Compute target ranges from the samples, ship rows keyed by K, and sort
/// each target partition.
pub(crate) fn shuffle(
    typ: OrderedRvdType,
    typ_arc: Arc<OrderedRvdType>,
    pool: Arc<dyn ComputePool>,
    infos: &[PartitionKeyInfo],
    sources: &[PartSource],
    n_out: usize,
) -> Result<OrderedRvd, EngineError> {
    let ord = ExtOrd::missing_greatest();
    let pk_type = typ.pk_type();
    let pk_len = typ.pk_len();

    // evenly spaced cut points over the sampled PKs, ties collapsed so no
    // two partitions share a PK
    let mut sample_pks: Vec<Annotation> = infos
        .iter()
        .flat_map(|info| info.samples.iter().map(|k| k.prefix(pk_len)))
        .collect();
    sample_pks.sort_by(|a, b| ord.compare(&pk_type, a, b));

    let global_min = infos
        .iter()
        .map(|i| i.min_k.prefix(pk_len))
        .reduce(|a, b| {
            if ord.compare(&pk_type, &b, &a) == Ordering::Less {
                b
            } else {
                a
            }
        })
        .expect("non-empty infos");
    let global_max = infos
        .iter()
        .map(|i| i.max_k.prefix(pk_len))
        .reduce(|a, b| {
            if ord.compare(&pk_type, &b, &a) == Ordering::Greater {
                b
            } else {
                a
            }
        })
        .expect("non-empty infos");

    let n_out = n_out.max(1);
    let mut cuts: Vec<Annotation> = Vec::new();
    for i in 1..n_out {
        let cut = sample_pks[i * sample_pks.len() / n_out].clone();
        let distinct = cuts
            .last()
            .map(|prev| ord.compare(&pk_type, prev, &cut) != Ordering::Equal)
            .unwrap_or(true)
            && ord.compare(&pk_type, &global_min, &cut) == Ordering::Less
            && ord.compare(&pk_type, &cut, &global_max) == Ordering::Less;
        if distinct {
            cuts.push(cut);
        }
    }

    let mut bounds = Vec::with_capacity(cuts.len() + 1);
    let mut prev = global_min.clone();
    let mut first = true;
    for cut in &cuts {
        bounds.push(Interval::new(prev.clone(), cut.clone(), first, true));
        prev = cut.clone();
        first = false;
    }
    bounds.push(Interval::new(prev, global_max, first, true));
    let partitioner = OrderedPartitioner::new(pk_type, bounds)?;
    let n_parts = partitioner.num_partitions();

    // ship (destination, row) pairs through the pool
    let partitioner_blob = pool.broadcast(
        bincode::serialize(&partitioner)
            .map_err(|e| EngineError::Codec(format!("partitioner encode: {}", e)))?,
    );
    let jobs: Vec<_> = sources
        .iter()
        .map(|source| {
            let source = source.clone();
            let typ = typ_arc.clone();
            let blob = partitioner_blob.clone();
            move || -> Result<Vec<(u32, Vec<u8>)>, EngineError> {
                let partitioner: OrderedPartitioner = bincode::deserialize(&blob)
                    .map_err(|e| EngineError::Codec(format!("partitioner decode: {}", e)))?;
                let mut stream = source()?;
                let mut out = Vec::new();
                while stream.advance()? {
                    let row = stream.current();
                    let key = typ.key_annotation(row.region, row.offset);
                    let dest = partitioner.get_partition(&key) as u32;
                    out.push((dest, encode_row(&typ.row_type, row.region, row.offset)));
                }
                Ok(out)
            }
        })
        .collect();
    let shipped = run_typed(pool.as_ref(), jobs)?;

    let mut buckets: Vec<Vec<Vec<u8>>> = vec![Vec::new(); n_parts];
    for part in shipped {
        for (dest, row) in part {
            buckets[dest as usize].push(row);
        }
    }

    // sort each destination partition by full key
    let sort_jobs: Vec<_> = buckets
        .into_iter()
        .map(|rows| {
            let typ = typ_arc.clone();
            move || -> Result<Vec<Vec<u8>>, EngineError> {
                let mut decoded: Vec<(Vec<u8>, strata_core::Region)> = rows
                    .into_iter()
                    .map(|bytes| {
                        let region = decode_row(bytes.clone());
                        (bytes, region)
                    })
                    .collect();
                decoded.sort_by(|a, b| typ.compare_rows_by_key(&a.1, 0, &b.1, 0));
                Ok(decoded.into_iter().map(|(bytes, _)| bytes).collect())
            }
        })
        .collect();
    let sorted = run_typed(pool.as_ref(), sort_jobs)?;

    let new_sources: Vec<PartSource> = sorted
        .into_iter()
        .map(|rows| MemStream::source(Arc::new(rows)))
        .collect();
    OrderedRvd::new(typ, partitioner, new_sources, pool)
}
