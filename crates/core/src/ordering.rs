//! Extended orderings with missing semantics
//!
//! `ExtOrd` defines a total order over values of a given type, with missing
//! values sorting greatest or least per the `missing_greatest` flag. Two
//! entry points exist: `compare` over materialized annotations, and
//! `compare_raw` directly over `(region, offset)` pairs against the packed
//! layout. The two always agree; `compare_raw` exists so sort and join
//! paths never materialize rows.
//!
//! Struct ordering is lexicographic over fields. Arrays compare
//! elementwise, then by length. Intervals order by
//! `(start, !includesStart, end, includesEnd)`. Floats use `total_cmp` so
//! the order is total even in the presence of NaN.

use crate::annotation::Annotation;
use crate::region::Region;
use crate::types::{Field, Kind, VType};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtOrd {
    pub missing_greatest: bool,
}

impl ExtOrd {
    pub fn missing_greatest() -> ExtOrd {
        ExtOrd {
            missing_greatest: true,
        }
    }

    pub fn missing_least() -> ExtOrd {
        ExtOrd {
            missing_greatest: false,
        }
    }

    fn missing_cmp(&self, a_missing: bool, b_missing: bool) -> Option<Ordering> {
        match (a_missing, b_missing) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(if self.missing_greatest {
                Ordering::Greater
            } else {
                Ordering::Less
            }),
            (false, true) => Some(if self.missing_greatest {
                Ordering::Less
            } else {
                Ordering::Greater
            }),
            (false, false) => None,
        }
    }

    /// Total order over annotations of type `typ`.
    pub fn compare(&self, typ: &VType, a: &Annotation, b: &Annotation) -> Ordering {
        if let Some(ord) = self.missing_cmp(a.is_missing(), b.is_missing()) {
            return ord;
        }
        match &typ.kind {
            Kind::Bool => a.as_bool().unwrap().cmp(&b.as_bool().unwrap()),
            Kind::Int32 | Kind::Call => a.as_i32().unwrap().cmp(&b.as_i32().unwrap()),
            Kind::Int64 => a.as_i64().unwrap().cmp(&b.as_i64().unwrap()),
            Kind::Float32 => match (a, b) {
                (Annotation::Float32(x), Annotation::Float32(y)) => x.total_cmp(y),
                _ => panic!("float32 annotation expected"),
            },
            Kind::Float64 => a.as_f64().unwrap().total_cmp(&b.as_f64().unwrap()),
            Kind::Str => a.as_str().unwrap().cmp(b.as_str().unwrap()),
            Kind::Binary => match (a, b) {
                (Annotation::Binary(x), Annotation::Binary(y)) => x.cmp(y),
                _ => panic!("binary annotation expected"),
            },
            Kind::Interval(point) => {
                let af = a.fields().unwrap();
                let bf = b.fields().unwrap();
                self.compare(point, &af[0], &bf[0])
                    .then_with(|| {
                        // inclusive start sorts first
                        let ais = !af[2].as_bool().unwrap();
                        let bis = !bf[2].as_bool().unwrap();
                        ais.cmp(&bis)
                    })
                    .then_with(|| self.compare(point, &af[1], &bf[1]))
                    .then_with(|| {
                        let aie = af[3].as_bool().unwrap();
                        let bie = bf[3].as_bool().unwrap();
                        aie.cmp(&bie)
                    })
            }
            Kind::Struct(_) | Kind::Tuple(_) | Kind::Locus => {
                let fields = typ.struct_fields().expect("struct-like kind");
                self.compare_fields(&fields, a.fields().unwrap(), b.fields().unwrap(), fields.len())
            }
            Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _) => {
                let elem = typ.array_element().expect("array-shaped kind");
                let xs = a.elements().unwrap();
                let ys = b.elements().unwrap();
                for (x, y) in xs.iter().zip(ys.iter()) {
                    let ord = self.compare(&elem, x, y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                xs.len().cmp(&ys.len())
            }
        }
    }

    /// Lexicographic comparison of the first `n` fields of two struct
    /// annotations (partition-key prefix comparison).
    pub fn compare_fields(
        &self,
        fields: &[Field],
        a: &[Annotation],
        b: &[Annotation],
        n: usize,
    ) -> Ordering {
        for i in 0..n {
            let ord = self.compare(&fields[i].typ, &a[i], &b[i]);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Total order over two packed values of type `typ` at content offsets
    /// `oa` / `ob`, without materializing. Agrees with `compare`.
    pub fn compare_raw(
        &self,
        typ: &VType,
        ra: &Region,
        oa: usize,
        rb: &Region,
        ob: usize,
    ) -> Ordering {
        match &typ.kind {
            Kind::Bool => ra.load_bool(oa).cmp(&rb.load_bool(ob)),
            Kind::Int32 | Kind::Call => ra.load_i32(oa).cmp(&rb.load_i32(ob)),
            Kind::Int64 => ra.load_i64(oa).cmp(&rb.load_i64(ob)),
            Kind::Float32 => ra.load_f32(oa).total_cmp(&rb.load_f32(ob)),
            Kind::Float64 => ra.load_f64(oa).total_cmp(&rb.load_f64(ob)),
            Kind::Str | Kind::Binary => {
                let la = ra.load_i32(oa) as usize;
                let lb = rb.load_i32(ob) as usize;
                ra.load_bytes(oa + 4, la).cmp(rb.load_bytes(ob + 4, lb))
            }
            Kind::Interval(point) => self
                .raw_field_cmp(typ, point, 0, ra, oa, rb, ob)
                .then_with(|| {
                    let ais = !ra.load_bool(typ.field_offset(oa, 2));
                    let bis = !rb.load_bool(typ.field_offset(ob, 2));
                    ais.cmp(&bis)
                })
                .then_with(|| self.raw_field_cmp(typ, point, 1, ra, oa, rb, ob))
                .then_with(|| {
                    let aie = ra.load_bool(typ.field_offset(oa, 3));
                    let bie = rb.load_bool(typ.field_offset(ob, 3));
                    aie.cmp(&bie)
                }),
            Kind::Struct(_) | Kind::Tuple(_) | Kind::Locus => {
                let fields = typ.struct_fields().expect("struct-like kind");
                self.compare_raw_prefix(typ, &fields, fields.len(), ra, oa, rb, ob)
            }
            Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _) => {
                let elem = typ.array_element().expect("array-shaped kind");
                let la = typ.load_length(ra, oa);
                let lb = typ.load_length(rb, ob);
                for i in 0..la.min(lb) {
                    let da = typ.is_element_defined(ra, oa, i);
                    let db = typ.is_element_defined(rb, ob, i);
                    if let Some(ord) = self.missing_cmp(!da, !db) {
                        if ord != Ordering::Equal {
                            return ord;
                        }
                        if !da {
                            continue;
                        }
                    }
                    let ca = typ.load_element(ra, oa, la, i);
                    let cb = typ.load_element(rb, ob, lb, i);
                    let ord = self.compare_raw(&elem, ra, ca, rb, cb);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                la.cmp(&lb)
            }
        }
    }

    /// Lexicographic raw comparison of the first `n` fields of two packed
    /// structs.
    pub fn compare_raw_prefix(
        &self,
        typ: &VType,
        fields: &[Field],
        n: usize,
        ra: &Region,
        oa: usize,
        rb: &Region,
        ob: usize,
    ) -> Ordering {
        for i in 0..n {
            let da = typ.is_field_defined(ra, oa, i);
            let db = typ.is_field_defined(rb, ob, i);
            if let Some(ord) = self.missing_cmp(!da, !db) {
                if ord != Ordering::Equal {
                    return ord;
                }
                if !da {
                    continue;
                }
            }
            let ca = typ.load_field(ra, oa, i);
            let cb = typ.load_field(rb, ob, i);
            let ord = self.compare_raw(&fields[i].typ, ra, ca, rb, cb);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    fn raw_field_cmp(
        &self,
        styp: &VType,
        ftyp: &VType,
        i: usize,
        ra: &Region,
        oa: usize,
        rb: &Region,
        ob: usize,
    ) -> Ordering {
        let da = styp.is_field_defined(ra, oa, i);
        let db = styp.is_field_defined(rb, ob, i);
        if let Some(ord) = self.missing_cmp(!da, !db) {
            if ord != Ordering::Equal || !da {
                return ord;
            }
        }
        let ca = styp.load_field(ra, oa, i);
        let cb = styp.load_field(rb, ob, i);
        self.compare_raw(ftyp, ra, ca, rb, cb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::RegionValueBuilder;

    fn write(typ: &VType, a: &Annotation) -> (Region, usize) {
        let mut region = Region::new();
        let mut rvb = RegionValueBuilder::new(typ);
        rvb.add_annotation(&mut region, typ, a);
        let off = rvb.end();
        (region, off)
    }

    fn agree(typ: &VType, a: &Annotation, b: &Annotation) -> Ordering {
        let ord = ExtOrd::missing_greatest();
        let logical = ord.compare(typ, a, b);
        let (ra, oa) = write(typ, a);
        let (rb, ob) = write(typ, b);
        let raw = ord.compare_raw(typ, &ra, oa, &rb, ob);
        assert_eq!(logical, raw, "raw/logical disagree for {} vs {:?} {:?}", typ, a, b);
        logical
    }

    #[test]
    fn test_primitive_order() {
        assert_eq!(
            agree(&VType::int32(), &Annotation::Int32(1), &Annotation::Int32(2)),
            Ordering::Less
        );
        assert_eq!(
            agree(
                &VType::str(),
                &Annotation::Str("ab".into()),
                &Annotation::Str("b".into())
            ),
            Ordering::Less
        );
    }

    #[test]
    fn test_missing_sorts_greatest() {
        let typ = VType::struct_of(vec![("a", VType::int32())]);
        assert_eq!(
            agree(
                &typ,
                &Annotation::Struct(vec![Annotation::Int32(100)]),
                &Annotation::Struct(vec![Annotation::Missing]),
            ),
            Ordering::Less
        );
    }

    #[test]
    fn test_struct_lexicographic() {
        let typ = VType::struct_of(vec![("a", VType::str()), ("b", VType::int32())]);
        let x = Annotation::Struct(vec![Annotation::Str("1".into()), Annotation::Int32(9)]);
        let y = Annotation::Struct(vec![Annotation::Str("2".into()), Annotation::Int32(1)]);
        assert_eq!(agree(&typ, &x, &y), Ordering::Less);
    }

    #[test]
    fn test_array_elementwise_then_length() {
        let typ = VType::array_of(VType::int32());
        let x = Annotation::Array(vec![Annotation::Int32(1), Annotation::Int32(2)]);
        let y = Annotation::Array(vec![Annotation::Int32(1)]);
        assert_eq!(agree(&typ, &x, &y), Ordering::Greater);
    }

    #[test]
    fn test_interval_order() {
        let typ = VType::interval_of(VType::int32().required());
        let mk = |s: i32, e: i32, is: bool, ie: bool| {
            Annotation::Struct(vec![
                Annotation::Int32(s),
                Annotation::Int32(e),
                Annotation::Bool(is),
                Annotation::Bool(ie),
            ])
        };
        // same start: inclusive start sorts first
        assert_eq!(agree(&typ, &mk(1, 5, true, false), &mk(1, 5, false, false)), Ordering::Less);
        // same start/inclusivity: shorter end sorts first
        assert_eq!(agree(&typ, &mk(1, 4, true, true), &mk(1, 5, true, false)), Ordering::Less);
        // same span: exclusive end sorts first
        assert_eq!(agree(&typ, &mk(1, 5, true, false), &mk(1, 5, true, true)), Ordering::Less);
    }

    #[test]
    fn test_prefix_compare() {
        let typ = VType::struct_of(vec![("a", VType::int32()), ("b", VType::int32())]);
        let ord = ExtOrd::missing_greatest();
        let fields = typ.struct_fields().unwrap();
        let x = [Annotation::Int32(1), Annotation::Int32(9)];
        let y = [Annotation::Int32(1), Annotation::Int32(0)];
        assert_eq!(ord.compare_fields(&fields, &x, &y, 1), Ordering::Equal);
        assert_eq!(ord.compare_fields(&fields, &x, &y, 2), Ordering::Greater);
    }
}
