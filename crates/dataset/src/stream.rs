//! Cooperative row streams
//!
//! A `RowStream` is a pull-based lending iterator: `advance()` steps to
//! the next row, `current()` borrows it as a region value. Each adapter
//! owns whatever regions its rows live in, so a borrowed row is valid
//! until the next `advance` and never longer. Rows that must outlive that
//! window (run buffering, merge staging) are deep-copied into
//! `WritableRegionValue`s.

use crate::rvd_type::OrderedRvdType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use strata_core::annotation::read_annotation;
use strata_core::codec::{decode_row, encode_row};
use strata_core::{
    Annotation, EngineError, ExtOrd, Region, RegionValue, RegionValueBuilder, VType,
    WritableRegionValue,
};

pub trait RowStream: Send {
    /// Step to the next row; false when the partition is exhausted.
    fn advance(&mut self) -> Result<bool, EngineError>;

    /// The current row. Valid only after `advance` returned true, until
    /// the next `advance`.
    fn current(&self) -> RegionValue<'_>;
}

/// Regenerates a partition's stream on demand (lazy lineage).
pub type PartSource = Arc<dyn Fn() -> Result<Box<dyn RowStream>, EngineError> + Send + Sync>;

/// Rewrites one partition stream into another.
pub type PartFn =
    Arc<dyn Fn(Box<dyn RowStream>) -> Result<Box<dyn RowStream>, EngineError> + Send + Sync>;

/// Row-to-row rewrite: read the input row, write the output row into the
/// scratch region, return its offset.
pub type RowMapFn =
    Arc<dyn Fn(RegionValue<'_>, &mut Region) -> Result<usize, EngineError> + Send + Sync>;

pub type RowPredFn = Arc<dyn Fn(RegionValue<'_>) -> Result<bool, EngineError> + Send + Sync>;

// ----------------------------------------------------------------------
// sources
// ----------------------------------------------------------------------

/// Stream over materialized encoded rows; each row decodes into a fresh
/// region.
pub struct MemStream {
    rows: Arc<Vec<Vec<u8>>>,
    idx: usize,
    region: Region,
}

impl MemStream {
    pub fn new(rows: Arc<Vec<Vec<u8>>>) -> MemStream {
        MemStream {
            rows,
            idx: 0,
            region: Region::new(),
        }
    }

    pub fn source(rows: Arc<Vec<Vec<u8>>>) -> PartSource {
        Arc::new(move || Ok(Box::new(MemStream::new(rows.clone())) as Box<dyn RowStream>))
    }
}

impl RowStream for MemStream {
    fn advance(&mut self) -> Result<bool, EngineError> {
        if self.idx == self.rows.len() {
            return Ok(false);
        }
        self.region = decode_row(self.rows[self.idx].clone());
        self.idx += 1;
        Ok(true)
    }

    fn current(&self) -> RegionValue<'_> {
        debug_assert!(self.idx > 0, "current before advance");
        RegionValue::new(&self.region, 0)
    }
}

// ----------------------------------------------------------------------
// adapters
// ----------------------------------------------------------------------

pub struct MapStream {
    inner: Box<dyn RowStream>,
    f: RowMapFn,
    region: Region,
    offset: usize,
}

impl MapStream {
    pub fn new(inner: Box<dyn RowStream>, f: RowMapFn) -> MapStream {
        MapStream {
            inner,
            f,
            region: Region::new(),
            offset: 0,
        }
    }
}

impl RowStream for MapStream {
    fn advance(&mut self) -> Result<bool, EngineError> {
        if !self.inner.advance()? {
            return Ok(false);
        }
        self.region.clear();
        self.offset = (self.f)(self.inner.current(), &mut self.region)?;
        Ok(true)
    }

    fn current(&self) -> RegionValue<'_> {
        RegionValue::new(&self.region, self.offset)
    }
}

pub struct FilterStream {
    inner: Box<dyn RowStream>,
    p: RowPredFn,
}

impl FilterStream {
    pub fn new(inner: Box<dyn RowStream>, p: RowPredFn) -> FilterStream {
        FilterStream { inner, p }
    }
}

impl RowStream for FilterStream {
    fn advance(&mut self) -> Result<bool, EngineError> {
        loop {
            if !self.inner.advance()? {
                return Ok(false);
            }
            if (self.p)(self.inner.current())? {
                return Ok(true);
            }
        }
    }

    fn current(&self) -> RegionValue<'_> {
        self.inner.current()
    }
}

/// Seeded Bernoulli sample.
pub struct SampleStream {
    inner: Box<dyn RowStream>,
    rng: StdRng,
    p: f64,
}

impl SampleStream {
    pub fn new(inner: Box<dyn RowStream>, p: f64, seed: u64) -> SampleStream {
        SampleStream {
            inner,
            rng: StdRng::seed_from_u64(seed),
            p,
        }
    }
}

impl RowStream for SampleStream {
    fn advance(&mut self) -> Result<bool, EngineError> {
        loop {
            if !self.inner.advance()? {
                return Ok(false);
            }
            if self.rng.gen_bool(self.p) {
                return Ok(true);
            }
        }
    }

    fn current(&self) -> RegionValue<'_> {
        self.inner.current()
    }
}

pub struct TakeStream {
    inner: Box<dyn RowStream>,
    remaining: usize,
}

impl TakeStream {
    pub fn new(inner: Box<dyn RowStream>, n: usize) -> TakeStream {
        TakeStream {
            inner,
            remaining: n,
        }
    }
}

impl RowStream for TakeStream {
    fn advance(&mut self) -> Result<bool, EngineError> {
        if self.remaining == 0 {
            return Ok(false);
        }
        if !self.inner.advance()? {
            self.remaining = 0;
            return Ok(false);
        }
        self.remaining -= 1;
        Ok(true)
    }

    fn current(&self) -> RegionValue<'_> {
        self.inner.current()
    }
}

/// Concatenation of several partition sources, opened lazily in order.
pub struct ConcatStream {
    sources: Vec<PartSource>,
    next: usize,
    current: Option<Box<dyn RowStream>>,
}

impl ConcatStream {
    pub fn new(sources: Vec<PartSource>) -> ConcatStream {
        ConcatStream {
            sources,
            next: 0,
            current: None,
        }
    }
}

impl RowStream for ConcatStream {
    fn advance(&mut self) -> Result<bool, EngineError> {
        loop {
            if let Some(stream) = self.current.as_mut() {
                if stream.advance()? {
                    return Ok(true);
                }
                self.current = None;
            }
            if self.next == self.sources.len() {
                return Ok(false);
            }
            self.current = Some((self.sources[self.next])()?);
            self.next += 1;
        }
    }

    fn current(&self) -> RegionValue<'_> {
        self.current
            .as_ref()
            .expect("current before advance")
            .current()
    }
}

/// Two-pointer K-merge of two streams sorted by the same key.
pub struct MergeUnionStream {
    typ: Arc<OrderedRvdType>,
    a: Box<dyn RowStream>,
    b: Box<dyn RowStream>,
    a_live: bool,
    b_live: bool,
    started: bool,
    emit_a: bool,
}

impl MergeUnionStream {
    pub fn new(
        typ: Arc<OrderedRvdType>,
        a: Box<dyn RowStream>,
        b: Box<dyn RowStream>,
    ) -> MergeUnionStream {
        MergeUnionStream {
            typ,
            a,
            b,
            a_live: false,
            b_live: false,
            started: false,
            emit_a: true,
        }
    }
}

impl RowStream for MergeUnionStream {
    fn advance(&mut self) -> Result<bool, EngineError> {
        if !self.started {
            self.a_live = self.a.advance()?;
            self.b_live = self.b.advance()?;
            self.started = true;
        } else if self.emit_a {
            self.a_live = self.a.advance()?;
        } else {
            self.b_live = self.b.advance()?;
        }
        match (self.a_live, self.b_live) {
            (false, false) => Ok(false),
            (true, false) => {
                self.emit_a = true;
                Ok(true)
            }
            (false, true) => {
                self.emit_a = false;
                Ok(true)
            }
            (true, true) => {
                let ra = self.a.current();
                let rb = self.b.current();
                let ord = self
                    .typ
                    .compare_rows_by_key(ra.region, ra.offset, rb.region, rb.offset);
                self.emit_a = ord != Ordering::Greater;
                Ok(true)
            }
        }
    }

    fn current(&self) -> RegionValue<'_> {
        if self.emit_a {
            self.a.current()
        } else {
            self.b.current()
        }
    }
}

/// Staircase grouping: each maximal equal-by-key run becomes one output
/// row of (key fields, array of value structs). Run rows are deep-copied
/// into staging regions; the output row is built fresh per run.
pub struct GroupByKeyStream {
    typ: Arc<OrderedRvdType>,
    out_row_type: VType,
    inner: Box<dyn RowStream>,
    pending: Option<WritableRegionValue>,
    exhausted: bool,
    out: WritableRegionValue,
}

impl GroupByKeyStream {
    pub fn new(
        typ: Arc<OrderedRvdType>,
        out_row_type: VType,
        inner: Box<dyn RowStream>,
    ) -> GroupByKeyStream {
        GroupByKeyStream {
            typ,
            out_row_type,
            inner,
            pending: None,
            exhausted: false,
            out: WritableRegionValue::new(),
        }
    }
}

impl RowStream for GroupByKeyStream {
    fn advance(&mut self) -> Result<bool, EngineError> {
        let first = match self.pending.take() {
            Some(row) => row,
            None => {
                if self.exhausted || !self.inner.advance()? {
                    return Ok(false);
                }
                let mut wrv = WritableRegionValue::new();
                let row = self.inner.current();
                wrv.set_copy(&self.typ.row_type, row.region, row.offset);
                wrv
            }
        };
        let mut run = vec![first];
        loop {
            if !self.inner.advance()? {
                self.exhausted = true;
                break;
            }
            let row = self.inner.current();
            let lead = run[0].value();
            let same = self.typ.compare_rows_by_key(
                lead.region,
                lead.offset,
                row.region,
                row.offset,
            ) == Ordering::Equal;
            let mut wrv = WritableRegionValue::new();
            wrv.set_copy(&self.typ.row_type, row.region, row.offset);
            if same {
                run.push(wrv);
            } else {
                self.pending = Some(wrv);
                break;
            }
        }

        // build (key..., values: [value...])
        self.out.clear();
        let lead = run[0].value();
        let row_typ = &self.typ.row_type;
        let row_fields = self.typ.row_fields();
        let value_indices = self.typ.value_indices();
        let mut rvb = RegionValueBuilder::new(&self.out_row_type);
        rvb.start_struct(&mut self.out.region, true);
        for &ki in &self.typ.key_indices() {
            if row_typ.is_field_defined(lead.region, lead.offset, ki) {
                let content = row_typ.load_field(lead.region, lead.offset, ki);
                rvb.add_region_value(
                    &mut self.out.region,
                    &row_fields[ki].typ,
                    lead.region,
                    content,
                );
            } else {
                rvb.set_missing(&mut self.out.region);
            }
            rvb.advance();
        }
        rvb.start_array(&mut self.out.region, run.len(), true);
        for wrv in &run {
            let row = wrv.value();
            rvb.start_struct(&mut self.out.region, true);
            for &fi in &value_indices {
                if row_typ.is_field_defined(row.region, row.offset, fi) {
                    let content = row_typ.load_field(row.region, row.offset, fi);
                    rvb.add_region_value(
                        &mut self.out.region,
                        &row_fields[fi].typ,
                        row.region,
                        content,
                    );
                } else {
                    rvb.set_missing(&mut self.out.region);
                }
                rvb.advance();
            }
            rvb.end_struct();
            rvb.advance();
        }
        rvb.end_array();
        rvb.end_struct();
        self.out.offset = rvb.end();
        self.out.present = true;
        Ok(true)
    }

    fn current(&self) -> RegionValue<'_> {
        self.out.value()
    }
}

/// First row of each equal-by-key run.
pub struct DistinctByKeyStream {
    typ: Arc<OrderedRvdType>,
    inner: Box<dyn RowStream>,
    prev: WritableRegionValue,
    started: bool,
}

impl DistinctByKeyStream {
    pub fn new(typ: Arc<OrderedRvdType>, inner: Box<dyn RowStream>) -> DistinctByKeyStream {
        DistinctByKeyStream {
            typ,
            inner,
            prev: WritableRegionValue::new(),
            started: false,
        }
    }
}

impl RowStream for DistinctByKeyStream {
    fn advance(&mut self) -> Result<bool, EngineError> {
        loop {
            if !self.inner.advance()? {
                return Ok(false);
            }
            let row = self.inner.current();
            let fresh = !self.started || {
                let prev = self.prev.value();
                self.typ
                    .compare_rows_by_key(prev.region, prev.offset, row.region, row.offset)
                    != Ordering::Equal
            };
            if fresh {
                self.prev.set_copy(&self.typ.row_type, row.region, row.offset);
                self.started = true;
                return Ok(true);
            }
        }
    }

    fn current(&self) -> RegionValue<'_> {
        self.prev.value()
    }
}

/// Heap entry ordering rows by full key (min-heap via reversed Ord).
struct HeapRow {
    typ: Arc<OrderedRvdType>,
    row: WritableRegionValue,
}

impl PartialEq for HeapRow {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapRow {}

impl PartialOrd for HeapRow {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapRow {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.row.value();
        let b = other.row.value();
        // reversed so BinaryHeap pops the smallest key first
        self.typ
            .compare_rows_by_key(a.region, a.offset, b.region, b.offset)
            .reverse()
    }
}

/// K-sorts each PK-equivalent run through a priority queue; the input
/// must already be PK-sorted.
pub struct LocalSortStream {
    typ: Arc<OrderedRvdType>,
    inner: Box<dyn RowStream>,
    heap: BinaryHeap<HeapRow>,
    pending: Option<WritableRegionValue>,
    exhausted: bool,
    out: WritableRegionValue,
}

impl LocalSortStream {
    pub fn new(typ: Arc<OrderedRvdType>, inner: Box<dyn RowStream>) -> LocalSortStream {
        LocalSortStream {
            typ,
            inner,
            heap: BinaryHeap::new(),
            pending: None,
            exhausted: false,
            out: WritableRegionValue::new(),
        }
    }

    fn load_run(&mut self) -> Result<bool, EngineError> {
        let first = match self.pending.take() {
            Some(row) => row,
            None => {
                if self.exhausted || !self.inner.advance()? {
                    return Ok(false);
                }
                let mut wrv = WritableRegionValue::new();
                let row = self.inner.current();
                wrv.set_copy(&self.typ.row_type, row.region, row.offset);
                wrv
            }
        };
        let lead = first.region.clone();
        let lead_off = first.offset;
        self.heap.push(HeapRow {
            typ: self.typ.clone(),
            row: first,
        });
        loop {
            if !self.inner.advance()? {
                self.exhausted = true;
                break;
            }
            let row = self.inner.current();
            let same = self
                .typ
                .compare_rows_by_pk(&lead, lead_off, row.region, row.offset)
                == Ordering::Equal;
            let mut wrv = WritableRegionValue::new();
            wrv.set_copy(&self.typ.row_type, row.region, row.offset);
            if same {
                self.heap.push(HeapRow {
                    typ: self.typ.clone(),
                    row: wrv,
                });
            } else {
                self.pending = Some(wrv);
                break;
            }
        }
        Ok(true)
    }
}

impl RowStream for LocalSortStream {
    fn advance(&mut self) -> Result<bool, EngineError> {
        if self.heap.is_empty() && !self.load_run()? {
            return Ok(false);
        }
        let top = self.heap.pop().expect("non-empty run");
        self.out = top.row;
        Ok(true)
    }

    fn current(&self) -> RegionValue<'_> {
        self.out.value()
    }
}

/// Emits only the leading rows whose PK equals `boundary`, then stops.
pub struct TakeLeadingPkStream {
    typ: Arc<OrderedRvdType>,
    pk_type: VType,
    boundary: Annotation,
    inner: Box<dyn RowStream>,
    done: bool,
}

impl TakeLeadingPkStream {
    pub fn new(
        typ: Arc<OrderedRvdType>,
        boundary: Annotation,
        inner: Box<dyn RowStream>,
    ) -> TakeLeadingPkStream {
        let pk_type = typ.pk_type();
        TakeLeadingPkStream {
            typ,
            pk_type,
            boundary,
            inner,
            done: false,
        }
    }
}

impl RowStream for TakeLeadingPkStream {
    fn advance(&mut self) -> Result<bool, EngineError> {
        if self.done {
            return Ok(false);
        }
        if !self.inner.advance()? {
            self.done = true;
            return Ok(false);
        }
        let row = self.inner.current();
        let pk = self.typ.pk_annotation(row.region, row.offset);
        let same = ExtOrd::missing_greatest().compare(&self.pk_type, &pk, &self.boundary)
            == Ordering::Equal;
        if !same {
            self.done = true;
            return Ok(false);
        }
        Ok(true)
    }

    fn current(&self) -> RegionValue<'_> {
        self.inner.current()
    }
}

/// Drops the leading rows whose PK equals `boundary`, then passes through.
pub struct DropLeadingPkStream {
    typ: Arc<OrderedRvdType>,
    pk_type: VType,
    boundary: Annotation,
    inner: Box<dyn RowStream>,
    dropping: bool,
}

impl DropLeadingPkStream {
    pub fn new(
        typ: Arc<OrderedRvdType>,
        boundary: Annotation,
        inner: Box<dyn RowStream>,
    ) -> DropLeadingPkStream {
        let pk_type = typ.pk_type();
        DropLeadingPkStream {
            typ,
            pk_type,
            boundary,
            inner,
            dropping: true,
        }
    }
}

impl RowStream for DropLeadingPkStream {
    fn advance(&mut self) -> Result<bool, EngineError> {
        loop {
            if !self.inner.advance()? {
                return Ok(false);
            }
            if !self.dropping {
                return Ok(true);
            }
            let row = self.inner.current();
            let pk = self.typ.pk_annotation(row.region, row.offset);
            if ExtOrd::missing_greatest().compare(&self.pk_type, &pk, &self.boundary)
                != Ordering::Equal
            {
                self.dropping = false;
                return Ok(true);
            }
        }
    }

    fn current(&self) -> RegionValue<'_> {
        self.inner.current()
    }
}

// ----------------------------------------------------------------------
// drivers
// ----------------------------------------------------------------------

pub fn drive_count(mut stream: Box<dyn RowStream>) -> Result<u64, EngineError> {
    let mut n = 0u64;
    while stream.advance()? {
        n += 1;
    }
    Ok(n)
}

pub fn drive_collect(
    mut stream: Box<dyn RowStream>,
    row_type: &VType,
) -> Result<Vec<Annotation>, EngineError> {
    let mut out = Vec::new();
    while stream.advance()? {
        let row = stream.current();
        out.push(read_annotation(row_type, row.region, row.offset));
    }
    Ok(out)
}

pub fn drive_encode(
    mut stream: Box<dyn RowStream>,
    row_type: &VType,
) -> Result<Vec<Vec<u8>>, EngineError> {
    let mut out = Vec::new();
    while stream.advance()? {
        let row = stream.current();
        out.push(encode_row(row_type, row.region, row.offset));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typ() -> Arc<OrderedRvdType> {
        Arc::new(
            OrderedRvdType::new(
                VType::struct_of(vec![("k", VType::int32()), ("v", VType::int32())]),
                vec!["k".to_string()],
                vec!["k".to_string()],
            )
            .unwrap(),
        )
    }

    fn encode(t: &OrderedRvdType, rows: &[(i32, i32)]) -> Arc<Vec<Vec<u8>>> {
        let out = rows
            .iter()
            .map(|(k, v)| {
                let mut region = Region::new();
                let mut rvb = RegionValueBuilder::new(&t.row_type);
                rvb.add_annotation(
                    &mut region,
                    &t.row_type,
                    &Annotation::Struct(vec![Annotation::Int32(*k), Annotation::Int32(*v)]),
                );
                let off = rvb.end();
                encode_row(&t.row_type, &region, off)
            })
            .collect();
        Arc::new(out)
    }

    fn decode_all(t: &OrderedRvdType, stream: Box<dyn RowStream>) -> Vec<(i32, i32)> {
        drive_collect(stream, &t.row_type)
            .unwrap()
            .into_iter()
            .map(|a| {
                let fields = a.fields().unwrap();
                (fields[0].as_i32().unwrap(), fields[1].as_i32().unwrap())
            })
            .collect()
    }

    #[test]
    fn test_mem_and_map_stream() {
        let t = typ();
        let rows = encode(&t, &[(1, 10), (2, 20)]);
        let stream = MemStream::new(rows);
        let t2 = t.clone();
        let mapped = MapStream::new(
            Box::new(stream),
            Arc::new(move |row, out| {
                let a = read_annotation(&t2.row_type, row.region, row.offset);
                let fields = a.fields().unwrap();
                let doubled = Annotation::Struct(vec![
                    fields[0].clone(),
                    Annotation::Int32(fields[1].as_i32().unwrap() * 2),
                ]);
                let mut rvb = RegionValueBuilder::new(&t2.row_type);
                rvb.add_annotation(out, &t2.row_type, &doubled);
                Ok(rvb.end())
            }),
        );
        assert_eq!(decode_all(&t, Box::new(mapped)), vec![(1, 20), (2, 40)]);
    }

    #[test]
    fn test_merge_union_interleaves() {
        let t = typ();
        let a = MemStream::new(encode(&t, &[(1, 0), (3, 0), (5, 0)]));
        let b = MemStream::new(encode(&t, &[(2, 0), (3, 1), (6, 0)]));
        let merged = MergeUnionStream::new(t.clone(), Box::new(a), Box::new(b));
        assert_eq!(
            decode_all(&t, Box::new(merged)),
            vec![(1, 0), (2, 0), (3, 0), (3, 1), (5, 0), (6, 0)]
        );
    }

    #[test]
    fn test_group_by_key_stream() {
        let t = typ();
        let out_type = VType::struct_of(vec![
            ("k", VType::int32()),
            (
                "values",
                VType::array_of(t.value_type().required()).required(),
            ),
        ]);
        let inner = MemStream::new(encode(&t, &[(1, 10), (1, 11), (2, 20)]));
        let grouped = GroupByKeyStream::new(t.clone(), out_type.clone(), Box::new(inner));
        let rows = drive_collect(Box::new(grouped), &out_type).unwrap();
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
    }

    #[test]
    fn test_distinct_by_key_keeps_first() {
        let t = typ();
        let inner = MemStream::new(encode(&t, &[(1, 10), (1, 11), (2, 20), (2, 21)]));
        let distinct = DistinctByKeyStream::new(t.clone(), Box::new(inner));
        assert_eq!(decode_all(&t, Box::new(distinct)), vec![(1, 10), (2, 20)]);
    }

    #[test]
    fn test_local_sort_orders_within_pk_runs() {
        // key = (k, v), pk = k: v unsorted within each k run
        let t = Arc::new(
            OrderedRvdType::new(
                VType::struct_of(vec![("k", VType::int32()), ("v", VType::int32())]),
                vec!["k".to_string(), "v".to_string()],
                vec!["k".to_string()],
            )
            .unwrap(),
        );
        let inner = MemStream::new(encode(&t, &[(1, 12), (1, 10), (1, 11), (2, 1), (2, 0)]));
        let sorted = LocalSortStream::new(t.clone(), Box::new(inner));
        assert_eq!(
            decode_all(&t, Box::new(sorted)),
            vec![(1, 10), (1, 11), (1, 12), (2, 0), (2, 1)]
        );
    }

    #[test]
    fn test_take_and_drop_leading_pk() {
        let t = typ();
        let boundary = Annotation::Struct(vec![Annotation::Int32(1)]);
        let inner = MemStream::new(encode(&t, &[(1, 10), (1, 11), (2, 20)]));
        let take = TakeLeadingPkStream::new(t.clone(), boundary.clone(), Box::new(inner));
        assert_eq!(decode_all(&t, Box::new(take)), vec![(1, 10), (1, 11)]);

        let inner = MemStream::new(encode(&t, &[(1, 10), (1, 11), (2, 20)]));
        let drop = DropLeadingPkStream::new(t.clone(), boundary, Box::new(inner));
        assert_eq!(decode_all(&t, Box::new(drop)), vec![(2, 20)]);
    }

    #[test]
    fn test_concat_and_take() {
        let t = typ();
        let s1 = MemStream::source(encode(&t, &[(1, 0), (2, 0)]));
        let s2 = MemStream::source(encode(&t, &[(3, 0)]));
        let concat = ConcatStream::new(vec![s1, s2]);
        let take = TakeStream::new(Box::new(concat), 2);
        assert_eq!(decode_all(&t, Box::new(take)), vec![(1, 0), (2, 0)]);
    }
}
