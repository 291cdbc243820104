//! Ordered merge joins
//!
//! Both sides arrive co-partitioned and key-sorted, so a join is a
//! two-cursor merge per partition. Equal-key runs on the right are
//! buffered (deep copies) and crossed with each matching left row; the
//! "distinct" variant collapses a right run to its first row. Unmatched
//! sides emit per the join type, with the absent side's fields missing.

use crate::rvd_type::OrderedRvdType;
use crate::stream::RowStream;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use strata_core::{
    EngineError, ExtOrd, Field, Kind, Region, RegionValue, RegionValueBuilder, VType,
    WritableRegionValue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Outer,
}

impl JoinType {
    pub fn keeps_unmatched_left(self) -> bool {
        matches!(self, JoinType::Left | JoinType::Outer)
    }

    pub fn keeps_unmatched_right(self) -> bool {
        matches!(self, JoinType::Right | JoinType::Outer)
    }
}

/// Structural kind equality, ignoring `required` flags.
fn kinds_match(a: &VType, b: &VType) -> bool {
    use strata_core::Kind::*;
    match (&a.kind, &b.kind) {
        (Array(x), Array(y)) | (Set(x), Set(y)) | (Interval(x), Interval(y)) => kinds_match(x, y),
        (Dict(xk, xv), Dict(yk, yv)) => kinds_match(xk, yk) && kinds_match(xv, yv),
        (Struct(xs), Struct(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys)
                    .all(|(x, y)| x.name == y.name && kinds_match(&x.typ, &y.typ))
        }
        (Tuple(xs), Tuple(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| kinds_match(x, y))
        }
        (x, y) => std::mem::discriminant(x) == std::mem::discriminant(y),
    }
}

/// Output row type of a join: every left field, then the right side's
/// non-key fields. Fields that can come up absent lose their `required`
/// flag.
pub fn joined_row_type(
    left: &OrderedRvdType,
    right: &OrderedRvdType,
    how: JoinType,
) -> Result<VType, EngineError> {
    if left.key.len() != right.key.len() {
        return Err(EngineError::user(format!(
            "join keys differ in length: {:?} vs {:?}",
            left.key, right.key
        )));
    }
    let left_fields = left.row_fields();
    let right_fields = right.row_fields();
    for (li, ri) in left.key_indices().iter().zip(right.key_indices()) {
        let lt = &left_fields[*li].typ;
        let rt = &right_fields[ri].typ;
        if !kinds_match(lt, rt) {
            return Err(EngineError::user(format!(
                "join key types disagree: {} vs {}",
                lt, rt
            )));
        }
    }
    let mut out = Vec::new();
    for field in &left_fields {
        let mut typ = field.typ.clone();
        // a right-only row fills left fields from the right (keys) or
        // leaves them missing, so nothing on the left stays required
        if how.keeps_unmatched_right() {
            typ.required = false;
        }
        out.push(Field {
            name: field.name.clone(),
            typ,
        });
    }
    for &vi in &right.value_indices() {
        let field = &right.row_fields()[vi];
        if left_fields.iter().any(|f| f.name == field.name) {
            return Err(EngineError::user(format!(
                "join would duplicate field `{}`; rename before joining",
                field.name
            )));
        }
        let mut typ = field.typ.clone();
        if how.keeps_unmatched_left() {
            typ.required = false;
        }
        out.push(Field {
            name: field.name.clone(),
            typ,
        });
    }
    Ok(VType::new(Kind::Struct(out), true))
}

/// Compare a left row and a right row over the first `n` key fields.
fn compare_keys_cross(
    left_typ: &OrderedRvdType,
    lr: &Region,
    lo: usize,
    right_typ: &OrderedRvdType,
    rr: &Region,
    ro: usize,
    n: usize,
) -> Ordering {
    let ord = ExtOrd::missing_greatest();
    let lf = left_typ.row_fields();
    let rf = right_typ.row_fields();
    let li = left_typ.key_indices();
    let ri = right_typ.key_indices();
    for k in 0..n {
        let (i, j) = (li[k], ri[k]);
        let da = left_typ.row_type.is_field_defined(lr, lo, i);
        let db = right_typ.row_type.is_field_defined(rr, ro, j);
        let step = match (da, db) {
            (false, false) => Ordering::Equal,
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (true, true) => {
                let ca = left_typ.row_type.load_field(lr, lo, i);
                let cb = right_typ.row_type.load_field(rr, ro, j);
                ord.compare_raw(&lf[i].typ, lr, ca, rr, cb)
            }
        };
        if step != Ordering::Equal {
            return step;
        }
    }
    Ordering::Equal
}

pub struct MergeJoinStream {
    left_typ: Arc<OrderedRvdType>,
    right_typ: Arc<OrderedRvdType>,
    out_typ: VType,
    how: JoinType,
    distinct: bool,
    left: Box<dyn RowStream>,
    right: Box<dyn RowStream>,
    started: bool,
    l_live: bool,
    /// Buffered right run of equal keys
    run: Vec<WritableRegionValue>,
    run_idx: usize,
    run_matched: bool,
    right_pending: Option<WritableRegionValue>,
    right_exhausted: bool,
    emitting_right_only: bool,
    out: WritableRegionValue,
}

impl MergeJoinStream {
    pub fn new(
        left_typ: Arc<OrderedRvdType>,
        right_typ: Arc<OrderedRvdType>,
        out_typ: VType,
        how: JoinType,
        distinct: bool,
        left: Box<dyn RowStream>,
        right: Box<dyn RowStream>,
    ) -> MergeJoinStream {
        MergeJoinStream {
            left_typ,
            right_typ,
            out_typ,
            how,
            distinct,
            left,
            right,
            started: false,
            l_live: false,
            run: Vec::new(),
            run_idx: 0,
            run_matched: false,
            right_pending: None,
            right_exhausted: false,
            emitting_right_only: false,
            out: WritableRegionValue::new(),
        }
    }

    /// Pull the next equal-key run from the right side into `run`.
    fn load_run(&mut self) -> Result<(), EngineError> {
        self.run.clear();
        self.run_idx = 0;
        self.run_matched = false;
        let first = match self.right_pending.take() {
            Some(row) => row,
            None => {
                if self.right_exhausted || !self.right.advance()? {
                    self.right_exhausted = true;
                    return Ok(());
                }
                let mut wrv = WritableRegionValue::new();
                let row = self.right.current();
                wrv.set_copy(&self.right_typ.row_type, row.region, row.offset);
                wrv
            }
        };
        self.run.push(first);
        loop {
            if !self.right.advance()? {
                self.right_exhausted = true;
                return Ok(());
            }
            let row = self.right.current();
            let lead = self.run[0].value();
            let same = self.right_typ.compare_rows_by_key(
                lead.region,
                lead.offset,
                row.region,
                row.offset,
            ) == Ordering::Equal;
            let mut wrv = WritableRegionValue::new();
            wrv.set_copy(&self.right_typ.row_type, row.region, row.offset);
            if same {
                if !self.distinct {
                    self.run.push(wrv);
                }
            } else {
                self.right_pending = Some(wrv);
                return Ok(());
            }
        }
    }

    /// Build the joined row from the present sides.
    fn build(&mut self, left: Option<RegionValue<'_>>, right: Option<RegionValue<'_>>) {
        let left_typ = self.left_typ.clone();
        let right_typ = self.right_typ.clone();
        let left_fields = left_typ.row_fields();
        let right_fields = right_typ.row_fields();
        let n_key = left_typ.key.len();
        let left_key_indices = left_typ.key_indices();
        let right_key_indices = right_typ.key_indices();

        self.out.clear();
        let mut rvb = RegionValueBuilder::new(&self.out_typ);
        rvb.start_struct(&mut self.out.region, true);
        for (i, field) in left_fields.iter().enumerate() {
            let key_pos = left_key_indices.iter().position(|&k| k == i);
            match (&left, key_pos) {
                (Some(row), _) => {
                    if left_typ.row_type.is_field_defined(row.region, row.offset, i) {
                        let content = left_typ.row_type.load_field(row.region, row.offset, i);
                        rvb.add_region_value(
                            &mut self.out.region,
                            &field.typ,
                            row.region,
                            content,
                        );
                    } else {
                        rvb.set_missing(&mut self.out.region);
                    }
                }
                (None, Some(k)) if k < n_key => {
                    // right-only row: key values come from the right side
                    let row = right.as_ref().expect("one side is always present");
                    let j = right_key_indices[k];
                    if right_typ.row_type.is_field_defined(row.region, row.offset, j) {
                        let content = right_typ.row_type.load_field(row.region, row.offset, j);
                        rvb.add_region_value(
                            &mut self.out.region,
                            &field.typ,
                            row.region,
                            content,
                        );
                    } else {
                        rvb.set_missing(&mut self.out.region);
                    }
                }
                (None, _) => rvb.set_missing(&mut self.out.region),
            }
            rvb.advance();
        }
        for &vi in &right_typ.value_indices() {
            match &right {
                Some(row) => {
                    if right_typ.row_type.is_field_defined(row.region, row.offset, vi) {
                        let content = right_typ.row_type.load_field(row.region, row.offset, vi);
                        rvb.add_region_value(
                            &mut self.out.region,
                            &right_fields[vi].typ,
                            row.region,
                            content,
                        );
                    } else {
                        rvb.set_missing(&mut self.out.region);
                    }
                }
                None => rvb.set_missing(&mut self.out.region),
            }
            rvb.advance();
        }
        rvb.end_struct();
        self.out.offset = rvb.end();
        self.out.present = true;
    }

    fn build_left_only(&mut self) {
        let left = self.left_cursor_copy();
        self.build(Some(left.value()), None);
    }

    /// Copy the left cursor so `build` can borrow it while writing `out`.
    fn left_cursor_copy(&mut self) -> WritableRegionValue {
        let mut wrv = WritableRegionValue::new();
        let row = self.left.current();
        wrv.set_copy(&self.left_typ.row_type, row.region, row.offset);
        wrv
    }
}

impl RowStream for MergeJoinStream {
    fn advance(&mut self) -> Result<bool, EngineError> {
        if !self.started {
            self.started = true;
            self.l_live = self.left.advance()?;
            self.load_run()?;
        }
        loop {
            if self.emitting_right_only {
                if self.run_idx < self.run.len() {
                    let row = std::mem::take(&mut self.run[self.run_idx]);
                    self.run_idx += 1;
                    self.build(None, Some(row.value()));
                    return Ok(true);
                }
                self.emitting_right_only = false;
                self.run.clear();
                self.load_run()?;
                continue;
            }

            if !self.l_live {
                // left exhausted: drain unmatched right runs
                if self.run.is_empty() {
                    if self.right_exhausted {
                        return Ok(false);
                    }
                    self.load_run()?;
                    continue;
                }
                if self.how.keeps_unmatched_right() && !self.run_matched {
                    self.emitting_right_only = true;
                    self.run_idx = 0;
                    continue;
                }
                self.run.clear();
                self.load_run()?;
                continue;
            }

            if self.run.is_empty() {
                if !self.right_exhausted {
                    self.load_run()?;
                    continue;
                }
                // right exhausted: left rows are unmatched
                if self.how.keeps_unmatched_left() {
                    self.build_left_only();
                    self.l_live = self.left.advance()?;
                    return Ok(true);
                }
                return Ok(false);
            }

            let cmp = {
                let lrow = self.left.current();
                let lead = self.run[0].value();
                compare_keys_cross(
                    &self.left_typ,
                    lrow.region,
                    lrow.offset,
                    &self.right_typ,
                    lead.region,
                    lead.offset,
                    self.left_typ.key.len(),
                )
            };
            match cmp {
                Ordering::Less => {
                    if self.how.keeps_unmatched_left() {
                        self.build_left_only();
                        self.l_live = self.left.advance()?;
                        return Ok(true);
                    }
                    self.l_live = self.left.advance()?;
                }
                Ordering::Greater => {
                    if self.how.keeps_unmatched_right() && !self.run_matched {
                        self.emitting_right_only = true;
                        self.run_idx = 0;
                        continue;
                    }
                    self.run.clear();
                    self.load_run()?;
                }
                Ordering::Equal => {
                    self.run_matched = true;
                    let left = self.left_cursor_copy();
                    let right = std::mem::replace(
                        &mut self.run[self.run_idx],
                        WritableRegionValue::new(),
                    );
                    self.build(Some(left.value()), Some(right.value()));
                    self.run[self.run_idx] = right;
                    self.run_idx += 1;
                    if self.run_idx == self.run.len() {
                        self.run_idx = 0;
                        self.l_live = self.left.advance()?;
                    }
                    return Ok(true);
                }
            }
        }
    }

    fn current(&self) -> RegionValue<'_> {
        self.out.value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{MemStream, drive_collect};
    use strata_core::Annotation;
    use strata_core::codec::encode_row;

    fn typ(value_name: &str) -> Arc<OrderedRvdType> {
        Arc::new(
            OrderedRvdType::new(
                VType::struct_of(vec![("k", VType::int32()), (value_name, VType::int32())]),
                vec!["k".to_string()],
                vec!["k".to_string()],
            )
            .unwrap(),
        )
    }

    fn rows(t: &OrderedRvdType, data: &[(i32, i32)]) -> Box<dyn RowStream> {
        let encoded = data
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
        Box::new(MemStream::new(Arc::new(encoded)))
    }

    fn join(
        how: JoinType,
        distinct: bool,
        left: &[(i32, i32)],
        right: &[(i32, i32)],
    ) -> Vec<Vec<Option<i32>>> {
        let lt = typ("a");
        let rt = typ("b");
        let out_typ = joined_row_type(&lt, &rt, how).unwrap();
        let stream = MergeJoinStream::new(
            lt.clone(),
            rt.clone(),
            out_typ.clone(),
            how,
            distinct,
            rows(&lt, left),
            rows(&rt, right),
        );
        drive_collect(Box::new(stream), &out_typ)
            .unwrap()
            .into_iter()
            .map(|a| {
                a.fields()
                    .unwrap()
                    .iter()
                    .map(|f| f.as_i32())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn test_inner_join_crosses_duplicates() {
        let got = join(
            JoinType::Inner,
            false,
            &[(1, 10), (2, 20), (2, 21), (4, 40)],
            &[(2, 200), (2, 201), (3, 300)],
        );
        assert_eq!(
            got,
            vec![
                vec![Some(2), Some(20), Some(200)],
                vec![Some(2), Some(20), Some(201)],
                vec![Some(2), Some(21), Some(200)],
                vec![Some(2), Some(21), Some(201)],
            ]
        );
    }

    #[test]
    fn test_left_join_fills_missing_right() {
        let got = join(JoinType::Left, false, &[(1, 10), (2, 20)], &[(2, 200)]);
        assert_eq!(
            got,
            vec![
                vec![Some(1), Some(10), None],
                vec![Some(2), Some(20), Some(200)],
            ]
        );
    }

    #[test]
    fn test_right_join_keeps_unmatched_right() {
        let got = join(JoinType::Right, false, &[(2, 20)], &[(1, 100), (2, 200)]);
        assert_eq!(
            got,
            vec![
                vec![Some(1), None, Some(100)],
                vec![Some(2), Some(20), Some(200)],
            ]
        );
    }

    #[test]
    fn test_outer_join_emits_both_sides() {
        let got = join(
            JoinType::Outer,
            false,
            &[(1, 10), (3, 30)],
            &[(2, 200), (3, 300), (4, 400)],
        );
        assert_eq!(
            got,
            vec![
                vec![Some(1), Some(10), None],
                vec![Some(2), None, Some(200)],
                vec![Some(3), Some(30), Some(300)],
                vec![Some(4), None, Some(400)],
            ]
        );
    }

    #[test]
    fn test_join_distinct_collapses_right_duplicates() {
        let got = join(
            JoinType::Inner,
            true,
            &[(2, 20)],
            &[(2, 200), (2, 201)],
        );
        assert_eq!(got, vec![vec![Some(2), Some(20), Some(200)]]);
    }
}
