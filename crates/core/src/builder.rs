//! RegionValueBuilder - staged construction of packed row values
//!
//! The builder drives a type/offset/index stack so nested starts compose:
//! `start` (root), `start_struct`/`end_struct`, `start_array`/`end_array`,
//! `set_missing`, `advance`, the typed adders, the unchecked
//! `add_annotation` path, and `add_region_value` (deep copy across
//! regions). `end()` returns the root offset; on a cleared region the root
//! lands at offset 0.
//!
//! Builder misuse (adder/type mismatch, set_missing on a required slot,
//! end with open composites) is a programming error and panics.

use crate::annotation::Annotation;
use crate::region::{Region, RegionValue, WritableRegionValue};
use crate::types::{ArrayLayout, Kind, StructLayout, VType};

#[derive(Debug)]
enum Frame {
    Struct {
        layout: StructLayout,
        off: usize,
        i: usize,
    },
    Array {
        layout: ArrayLayout,
        off: usize,
        len: usize,
        i: usize,
        elems_start: usize,
    },
}

#[derive(Debug)]
pub struct RegionValueBuilder {
    root: VType,
    frames: Vec<Frame>,
    root_offset: Option<usize>,
}

impl RegionValueBuilder {
    pub fn new(root: &VType) -> Self {
        RegionValueBuilder {
            root: root.clone(),
            frames: Vec::new(),
            root_offset: None,
        }
    }

    /// The type of the slot the next add targets.
    pub fn current_type(&self) -> VType {
        match self.frames.last() {
            None => self.root.clone(),
            Some(Frame::Struct { layout, i, .. }) => layout.field_types[*i].clone(),
            Some(Frame::Array { layout, .. }) => layout.elem.clone(),
        }
    }

    /// Begin the root value: pushes a struct frame for struct-like roots,
    /// no-op for primitives. Array roots go through `start_array`.
    pub fn start(&mut self, region: &mut Region, init: bool) {
        match &self.root.kind {
            Kind::Struct(_) | Kind::Tuple(_) | Kind::Locus | Kind::Interval(_) => {
                self.start_struct(region, init)
            }
            Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _) => {
                panic!("start on array root: use start_array")
            }
            _ => {}
        }
    }

    /// Inline address of the current slot, or None at root.
    fn slot_addr(&self) -> Option<usize> {
        match self.frames.last() {
            None => None,
            Some(Frame::Struct { layout, off, i }) => Some(off + layout.field_offsets[*i]),
            Some(Frame::Array {
                layout,
                elems_start,
                i,
                ..
            }) => Some(elems_start + i * layout.elem_stride),
        }
    }

    /// Address for an inline primitive write; allocates at root.
    fn prim_slot(&mut self, region: &mut Region, align: usize, size: usize) -> usize {
        match self.slot_addr() {
            Some(addr) => addr,
            None => {
                let off = region.allocate(align, size);
                self.set_root(off);
                off
            }
        }
    }

    /// Record a pointer-kind value: store its content offset into the
    /// current slot, or make it the root.
    fn put_pointer(&mut self, region: &mut Region, content: usize) {
        match self.slot_addr() {
            Some(addr) => region.store_offset(addr, content),
            None => self.set_root(content),
        }
    }

    fn set_root(&mut self, off: usize) {
        debug_assert!(self.root_offset.is_none(), "root value built twice");
        self.root_offset = Some(off);
    }

    pub fn start_struct(&mut self, region: &mut Region, init: bool) {
        let typ = self.current_type();
        let layout = typ.struct_layout();
        let off = match self.slot_addr() {
            Some(addr) => addr,
            None => {
                let off = region.allocate(layout.align.max(1), layout.size);
                self.set_root(off);
                off
            }
        };
        if init {
            for b in 0..layout.n_missing_bytes {
                region.store_u8(off + b, 0);
            }
        }
        self.frames.push(Frame::Struct { layout, off, i: 0 });
    }

    pub fn end_struct(&mut self) {
        match self.frames.pop() {
            Some(Frame::Struct { layout, i, .. }) => {
                assert_eq!(i, layout.n_fields(), "end_struct before all fields added");
            }
            other => panic!("end_struct without start_struct (top: {:?})", other),
        }
    }

    pub fn start_array(&mut self, region: &mut Region, len: usize, init: bool) {
        let typ = self.current_type();
        let layout = typ.array_layout();
        let n_missing = layout.n_missing_bytes(len);
        let off = region.allocate(layout.align, 4 + n_missing);
        region.store_i32(off, len as i32);
        if init {
            for b in 0..n_missing {
                region.store_u8(off + 4 + b, 0);
            }
        }
        let elems_start = region.allocate(layout.elem_align, len * layout.elem_stride);
        debug_assert_eq!(elems_start, layout.elements_offset(off, len));
        self.put_pointer(region, off);
        self.frames.push(Frame::Array {
            layout,
            off,
            len,
            i: 0,
            elems_start,
        });
    }

    pub fn end_array(&mut self) {
        match self.frames.pop() {
            Some(Frame::Array { len, i, .. }) => {
                assert_eq!(i, len, "end_array before all elements added");
            }
            other => panic!("end_array without start_array (top: {:?})", other),
        }
    }

    /// Mark the current slot missing. Panics on a required slot or at root.
    pub fn set_missing(&mut self, region: &mut Region) {
        match self.frames.last() {
            None => panic!("cannot set the root value missing"),
            Some(Frame::Struct { layout, off, i }) => match layout.missing_bits[*i] {
                Some(bit) => region.set_bit(*off, bit),
                None => panic!("set_missing on required field {}", i),
            },
            Some(Frame::Array { layout, off, i, .. }) => {
                assert!(
                    !layout.elem_required,
                    "set_missing on required array element"
                );
                region.set_bit(off + 4, *i);
            }
        }
    }

    /// Step to the next field or element.
    pub fn advance(&mut self) {
        match self.frames.last_mut() {
            None => {}
            Some(Frame::Struct { i, .. }) | Some(Frame::Array { i, .. }) => *i += 1,
        }
    }

    pub fn add_bool(&mut self, region: &mut Region, v: bool) {
        let addr = self.prim_slot(region, 1, 1);
        region.store_bool(addr, v);
    }

    pub fn add_i32(&mut self, region: &mut Region, v: i32) {
        let addr = self.prim_slot(region, 4, 4);
        region.store_i32(addr, v);
    }

    pub fn add_i64(&mut self, region: &mut Region, v: i64) {
        let addr = self.prim_slot(region, 8, 8);
        region.store_i64(addr, v);
    }

    pub fn add_f32(&mut self, region: &mut Region, v: f32) {
        let addr = self.prim_slot(region, 4, 4);
        region.store_f32(addr, v);
    }

    pub fn add_f64(&mut self, region: &mut Region, v: f64) {
        let addr = self.prim_slot(region, 8, 8);
        region.store_f64(addr, v);
    }

    pub fn add_binary(&mut self, region: &mut Region, bytes: &[u8]) {
        let content = region.allocate(4, 4 + bytes.len());
        region.store_i32(content, bytes.len() as i32);
        region.store_bytes(content + 4, bytes);
        self.put_pointer(region, content);
    }

    pub fn add_string(&mut self, region: &mut Region, s: &str) {
        self.add_binary(region, s.as_bytes());
    }

    /// The unchecked generic path: write `a` as a value of type `typ` into
    /// the current slot. The annotation must be fundamental-shaped for
    /// `typ`; a mismatch panics.
    pub fn add_annotation(&mut self, region: &mut Region, typ: &VType, a: &Annotation) {
        match (&typ.kind, a) {
            (_, Annotation::Missing) => self.set_missing(region),
            (Kind::Bool, Annotation::Bool(v)) => self.add_bool(region, *v),
            (Kind::Int32 | Kind::Call, Annotation::Int32(v)) => self.add_i32(region, *v),
            (Kind::Int64, Annotation::Int64(v)) => self.add_i64(region, *v),
            (Kind::Float32, Annotation::Float32(v)) => self.add_f32(region, *v),
            (Kind::Float64, Annotation::Float64(v)) => self.add_f64(region, *v),
            (Kind::Str, Annotation::Str(s)) => self.add_string(region, s),
            (Kind::Str, Annotation::Binary(b)) => self.add_binary(region, b),
            (Kind::Binary, Annotation::Binary(b)) => self.add_binary(region, b),
            (
                Kind::Struct(_) | Kind::Tuple(_) | Kind::Locus | Kind::Interval(_),
                Annotation::Struct(values),
            ) => {
                let fields = typ.struct_fields().expect("struct-like kind");
                assert_eq!(fields.len(), values.len(), "struct arity mismatch");
                self.start_struct(region, true);
                for (field, value) in fields.iter().zip(values) {
                    self.add_annotation(region, &field.typ, value);
                    self.advance();
                }
                self.end_struct();
            }
            (Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _), Annotation::Array(values)) => {
                let elem = typ.array_element().expect("array-shaped kind");
                self.start_array(region, values.len(), true);
                for value in values {
                    self.add_annotation(region, &elem, value);
                    self.advance();
                }
                self.end_array();
            }
            (kind, a) => panic!("annotation {:?} does not fit type kind {:?}", a, kind),
        }
    }

    /// Deep-copy the value of type `typ` at `src_off` (a content offset in
    /// `src`) into the current slot of this builder's region.
    pub fn add_region_value(
        &mut self,
        region: &mut Region,
        typ: &VType,
        src: &Region,
        src_off: usize,
    ) {
        match &typ.kind {
            Kind::Bool => self.add_bool(region, src.load_bool(src_off)),
            Kind::Int32 | Kind::Call => self.add_i32(region, src.load_i32(src_off)),
            Kind::Int64 => self.add_i64(region, src.load_i64(src_off)),
            Kind::Float32 => self.add_f32(region, src.load_f32(src_off)),
            Kind::Float64 => self.add_f64(region, src.load_f64(src_off)),
            Kind::Str | Kind::Binary => {
                let len = src.load_i32(src_off) as usize;
                self.add_binary(region, src.load_bytes(src_off + 4, len));
            }
            Kind::Struct(_) | Kind::Tuple(_) | Kind::Locus | Kind::Interval(_) => {
                let fields = typ.struct_fields().expect("struct-like kind");
                self.start_struct(region, true);
                for (i, field) in fields.iter().enumerate() {
                    if typ.is_field_defined(src, src_off, i) {
                        let content = typ.load_field(src, src_off, i);
                        self.add_region_value(region, &field.typ, src, content);
                    } else {
                        self.set_missing(region);
                    }
                    self.advance();
                }
                self.end_struct();
            }
            Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _) => {
                let elem = typ.array_element().expect("array-shaped kind");
                let len = typ.load_length(src, src_off);
                self.start_array(region, len, true);
                for i in 0..len {
                    if typ.is_element_defined(src, src_off, i) {
                        let content = typ.load_element(src, src_off, len, i);
                        self.add_region_value(region, &elem, src, content);
                    } else {
                        self.set_missing(region);
                    }
                    self.advance();
                }
                self.end_array();
            }
        }
    }

    /// Same-region variant of `add_region_value`: deep-copy the value at
    /// content offset `src_off` of `region` into the current slot. Offsets
    /// stay valid across the appends because the arena only grows.
    pub fn add_value_within(&mut self, region: &mut Region, typ: &VType, src_off: usize) {
        match &typ.kind {
            Kind::Bool => {
                let v = region.load_bool(src_off);
                self.add_bool(region, v);
            }
            Kind::Int32 | Kind::Call => {
                let v = region.load_i32(src_off);
                self.add_i32(region, v);
            }
            Kind::Int64 => {
                let v = region.load_i64(src_off);
                self.add_i64(region, v);
            }
            Kind::Float32 => {
                let v = region.load_f32(src_off);
                self.add_f32(region, v);
            }
            Kind::Float64 => {
                let v = region.load_f64(src_off);
                self.add_f64(region, v);
            }
            Kind::Str | Kind::Binary => {
                let len = region.load_i32(src_off) as usize;
                let bytes = region.load_bytes(src_off + 4, len).to_vec();
                self.add_binary(region, &bytes);
            }
            Kind::Struct(_) | Kind::Tuple(_) | Kind::Locus | Kind::Interval(_) => {
                let fields = typ.struct_fields().expect("struct-like kind");
                self.start_struct(region, true);
                for (i, field) in fields.iter().enumerate() {
                    if typ.is_field_defined(region, src_off, i) {
                        let content = typ.load_field(region, src_off, i);
                        self.add_value_within(region, &field.typ, content);
                    } else {
                        self.set_missing(region);
                    }
                    self.advance();
                }
                self.end_struct();
            }
            Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _) => {
                let elem = typ.array_element().expect("array-shaped kind");
                let len = typ.load_length(region, src_off);
                self.start_array(region, len, true);
                for i in 0..len {
                    if typ.is_element_defined(region, src_off, i) {
                        let content = typ.load_element(region, src_off, len, i);
                        self.add_value_within(region, &elem, content);
                    } else {
                        self.set_missing(region);
                    }
                    self.advance();
                }
                self.end_array();
            }
        }
    }

    /// Finish and return the root offset.
    pub fn end(&mut self) -> usize {
        assert!(self.frames.is_empty(), "end() with open composites");
        self.root_offset.expect("end() before any value was built")
    }
}

impl WritableRegionValue {
    /// Replace the held value with a deep copy of `src_off` (type `typ`).
    pub fn set_copy(&mut self, typ: &VType, src: &Region, src_off: usize) {
        self.region.clear();
        let mut rvb = RegionValueBuilder::new(typ);
        rvb.add_region_value(&mut self.region, typ, src, src_off);
        self.offset = rvb.end();
        self.present = true;
    }

    /// Materialize a projection of `row`'s fields `indices` as a value of
    /// `select_typ` (the struct of those fields, in order).
    pub fn set_select(
        &mut self,
        row_typ: &VType,
        select_typ: &VType,
        indices: &[usize],
        row: RegionValue<'_>,
    ) {
        self.region.clear();
        let fields = select_typ.struct_fields().expect("selection is a struct");
        debug_assert_eq!(fields.len(), indices.len());
        let mut rvb = RegionValueBuilder::new(select_typ);
        rvb.start_struct(&mut self.region, true);
        for (field, &idx) in fields.iter().zip(indices) {
            if row_typ.is_field_defined(row.region, row.offset, idx) {
                let content = row_typ.load_field(row.region, row.offset, idx);
                rvb.add_region_value(&mut self.region, &field.typ, row.region, content);
            } else {
                rvb.set_missing(&mut self.region);
            }
            rvb.advance();
        }
        rvb.end_struct();
        self.offset = rvb.end();
        self.present = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::read_annotation;

    fn roundtrip(typ: &VType, a: &Annotation) {
        let mut region = Region::new();
        let mut rvb = RegionValueBuilder::new(typ);
        rvb.add_annotation(&mut region, typ, a);
        let off = rvb.end();
        assert_eq!(&read_annotation(typ, &region, off), a, "type {}", typ);
    }

    #[test]
    fn test_primitive_roundtrip() {
        roundtrip(&VType::int32(), &Annotation::Int32(-42));
        roundtrip(&VType::int64(), &Annotation::Int64(1 << 40));
        roundtrip(&VType::float64(), &Annotation::Float64(2.75));
        roundtrip(&VType::bool(), &Annotation::Bool(true));
        roundtrip(&VType::str(), &Annotation::Str("hello".to_string()));
    }

    #[test]
    fn test_struct_roundtrip_with_missing_field() {
        let typ = VType::struct_of(vec![
            ("a", VType::int32()),
            ("b", VType::str()),
            ("c", VType::float64()),
        ]);
        roundtrip(
            &typ,
            &Annotation::Struct(vec![
                Annotation::Int32(7),
                Annotation::Missing,
                Annotation::Float64(0.5),
            ]),
        );
    }

    #[test]
    fn test_array_roundtrip_with_missing_elements() {
        let typ = VType::array_of(VType::int32());
        roundtrip(
            &typ,
            &Annotation::Array(vec![
                Annotation::Int32(1),
                Annotation::Missing,
                Annotation::Int32(3),
            ]),
        );
    }

    #[test]
    fn test_nested_roundtrip() {
        let typ = VType::struct_of(vec![
            ("xs", VType::array_of(VType::struct_of(vec![
                ("k", VType::str().required()),
                ("v", VType::int64()),
            ]))),
            ("name", VType::str()),
        ]);
        roundtrip(
            &typ,
            &Annotation::Struct(vec![
                Annotation::Array(vec![
                    Annotation::Struct(vec![
                        Annotation::Str("x".to_string()),
                        Annotation::Int64(10),
                    ]),
                    Annotation::Missing,
                ]),
                Annotation::Missing,
            ]),
        );
    }

    #[test]
    fn test_locus_and_interval_roundtrip() {
        roundtrip(
            &VType::locus(),
            &Annotation::Struct(vec![
                Annotation::Str("chr1".to_string()),
                Annotation::Int32(1234),
            ]),
        );
        roundtrip(
            &VType::interval_of(VType::int32().required()),
            &Annotation::Struct(vec![
                Annotation::Int32(5),
                Annotation::Int32(10),
                Annotation::Bool(true),
                Annotation::Bool(false),
            ]),
        );
    }

    #[test]
    fn test_cleared_region_root_is_zero() {
        let typ = VType::struct_of(vec![("a", VType::int32())]);
        let mut region = Region::new();
        region.allocate(1, 17);
        region.clear();
        let mut rvb = RegionValueBuilder::new(&typ);
        rvb.add_annotation(&mut region, &typ, &Annotation::Struct(vec![Annotation::Int32(1)]));
        assert_eq!(rvb.end(), 0);
    }

    #[test]
    fn test_set_select_projects_key_fields() {
        let row_typ = VType::struct_of(vec![
            ("contig", VType::str()),
            ("position", VType::int32()),
            ("payload", VType::float64()),
        ]);
        let key_typ = VType::struct_of(vec![
            ("contig", VType::str()),
            ("position", VType::int32()),
        ]);
        let mut region = Region::new();
        let mut rvb = RegionValueBuilder::new(&row_typ);
        rvb.add_annotation(
            &mut region,
            &row_typ,
            &Annotation::Struct(vec![
                Annotation::Str("chr2".to_string()),
                Annotation::Int32(55),
                Annotation::Float64(9.0),
            ]),
        );
        let off = rvb.end();

        let mut key = WritableRegionValue::new();
        key.set_select(&row_typ, &key_typ, &[0, 1], RegionValue::new(&region, off));
        let got = read_annotation(&key_typ, &key.region, key.offset);
        assert_eq!(
            got,
            Annotation::Struct(vec![
                Annotation::Str("chr2".to_string()),
                Annotation::Int32(55)
            ])
        );
    }

    #[test]
    fn test_interval_endpoints_load_distinct_fields() {
        let typ = VType::interval_of(VType::int32().required());
        let mut region = Region::new();
        let mut rvb = RegionValueBuilder::new(&typ);
        rvb.add_annotation(
            &mut region,
            &typ,
            &Annotation::Struct(vec![
                Annotation::Int32(5),
                Annotation::Int32(10),
                Annotation::Bool(true),
                Annotation::Bool(false),
            ]),
        );
        let off = rvb.end();
        let start = typ.interval_load_start(&region, off);
        let end = typ.interval_load_end(&region, off);
        assert_eq!(region.load_i32(start), 5);
        // end loads field index 1, never a second copy of start
        assert_eq!(region.load_i32(end), 10);
        assert_ne!(start, end);
    }

    #[test]
    #[should_panic(expected = "required")]
    fn test_set_missing_on_required_field_panics() {
        let typ = VType::struct_of(vec![("a", VType::int32().required())]);
        let mut region = Region::new();
        let mut rvb = RegionValueBuilder::new(&typ);
        rvb.start_struct(&mut region, true);
        rvb.set_missing(&mut region);
    }
}
