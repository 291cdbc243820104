//! Logical types and the packed row layout
//!
//! A `VType` pairs a logical kind with a `required` flag. Virtual kinds
//! (Str, Call, Locus, Interval, Set, Dict, Tuple) are described by their
//! *fundamental* representation - the shape the row codec actually stores:
//!
//! - `Str` stores as `Binary`
//! - `Call` stores as `Int32`
//! - `Locus` stores as `Struct{contig: Str!, position: Int32!}`
//! - `Interval(p)` stores as
//!   `Struct{start: p, end: p, includesStart: Bool!, includesEnd: Bool!}`
//! - `Set(e)` stores as `Array(e)`, `Dict(k,v)` as `Array(Struct{key,value})`
//! - `Tuple(ts)` stores as a struct with fields named "0", "1", ...
//!
//! # Layout
//!
//! Primitives occupy their natural size/alignment. Pointer kinds (Binary,
//! Str, Array, Set, Dict) occupy an 8-byte region offset. Structs lay out
//! inline: a missing-bit header of one bit per *optional* field (absent
//! when every field is required - a required field never has a bit
//! allocated), then fields at fixed offsets honoring alignment. Arrays
//! store a 4-byte length, element missing bits (absent for required
//! elements), then aligned elements at a fixed stride.
//!
//! Accessing a field or element whose missing bit is set is undefined;
//! readers must consult `is_field_defined` / `is_element_defined` first.

use crate::region::Region;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A named struct field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub typ: VType,
}

/// The logical kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    Str,
    Binary,
    /// Genotype call, stored as a packed Int32
    Call,
    /// Genomic position: contig name plus 1-based position
    Locus,
    Interval(Box<VType>),
    Array(Box<VType>),
    Set(Box<VType>),
    Dict(Box<VType>, Box<VType>),
    Struct(Vec<Field>),
    Tuple(Vec<VType>),
}

/// A logical type: a kind plus a `required` flag.
///
/// `required` means a value of this type can never be missing, and no
/// missing bit is allocated for it in any containing struct or array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VType {
    pub kind: Kind,
    pub required: bool,
}

/// Round `off` up to a multiple of `align` (a power of two).
pub fn align_up(off: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (off + align - 1) & !(align - 1)
}

impl VType {
    pub fn new(kind: Kind, required: bool) -> Self {
        VType { kind, required }
    }

    // Optional-by-default constructors; `.required()` upgrades.
    pub fn bool() -> Self {
        VType::new(Kind::Bool, false)
    }
    pub fn int32() -> Self {
        VType::new(Kind::Int32, false)
    }
    pub fn int64() -> Self {
        VType::new(Kind::Int64, false)
    }
    pub fn float32() -> Self {
        VType::new(Kind::Float32, false)
    }
    pub fn float64() -> Self {
        VType::new(Kind::Float64, false)
    }
    pub fn str() -> Self {
        VType::new(Kind::Str, false)
    }
    pub fn binary() -> Self {
        VType::new(Kind::Binary, false)
    }
    pub fn call() -> Self {
        VType::new(Kind::Call, false)
    }
    pub fn locus() -> Self {
        VType::new(Kind::Locus, false)
    }
    pub fn interval_of(point: VType) -> Self {
        VType::new(Kind::Interval(Box::new(point)), false)
    }
    pub fn array_of(elem: VType) -> Self {
        VType::new(Kind::Array(Box::new(elem)), false)
    }
    pub fn set_of(elem: VType) -> Self {
        VType::new(Kind::Set(Box::new(elem)), false)
    }
    pub fn dict_of(key: VType, value: VType) -> Self {
        VType::new(Kind::Dict(Box::new(key), Box::new(value)), false)
    }
    pub fn struct_of(fields: Vec<(&str, VType)>) -> Self {
        VType::new(
            Kind::Struct(
                fields
                    .into_iter()
                    .map(|(name, typ)| Field {
                        name: name.to_string(),
                        typ,
                    })
                    .collect(),
            ),
            false,
        )
    }
    pub fn tuple_of(types: Vec<VType>) -> Self {
        VType::new(Kind::Tuple(types), false)
    }

    /// The same type with `required` set.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// True for kinds whose layout equals their logical shape.
    pub fn is_fundamental(&self) -> bool {
        match &self.kind {
            Kind::Bool | Kind::Int32 | Kind::Int64 | Kind::Float32 | Kind::Float64
            | Kind::Binary => true,
            Kind::Array(elem) => elem.is_fundamental(),
            Kind::Struct(fields) => fields.iter().all(|f| f.typ.is_fundamental()),
            _ => false,
        }
    }

    /// Fully rewrite virtual kinds to their on-wire representation.
    pub fn fundamental(&self) -> VType {
        let kind = match &self.kind {
            Kind::Bool => Kind::Bool,
            Kind::Int32 | Kind::Call => Kind::Int32,
            Kind::Int64 => Kind::Int64,
            Kind::Float32 => Kind::Float32,
            Kind::Float64 => Kind::Float64,
            Kind::Str | Kind::Binary => Kind::Binary,
            Kind::Locus | Kind::Interval(_) | Kind::Struct(_) | Kind::Tuple(_) => {
                let fields = self
                    .struct_fields()
                    .expect("struct-like kind")
                    .iter()
                    .map(|f| Field {
                        name: f.name.clone(),
                        typ: f.typ.fundamental(),
                    })
                    .collect();
                Kind::Struct(fields)
            }
            Kind::Array(elem) => Kind::Array(Box::new(elem.fundamental())),
            Kind::Set(elem) => Kind::Array(Box::new(elem.fundamental())),
            Kind::Dict(k, v) => Kind::Array(Box::new(
                VType::struct_of(vec![("key", (**k).clone()), ("value", (**v).clone())])
                    .required()
                    .fundamental(),
            )),
        };
        VType::new(kind, self.required)
    }

    /// The struct-shaped view of a struct-like kind (Struct, Tuple, Locus,
    /// Interval). One level deep: field types stay virtual.
    pub fn struct_fields(&self) -> Option<Vec<Field>> {
        match &self.kind {
            Kind::Struct(fields) => Some(fields.clone()),
            Kind::Tuple(types) => Some(
                types
                    .iter()
                    .enumerate()
                    .map(|(i, t)| Field {
                        name: i.to_string(),
                        typ: t.clone(),
                    })
                    .collect(),
            ),
            Kind::Locus => Some(vec![
                Field {
                    name: "contig".to_string(),
                    typ: VType::str().required(),
                },
                Field {
                    name: "position".to_string(),
                    typ: VType::int32().required(),
                },
            ]),
            Kind::Interval(point) => Some(vec![
                Field {
                    name: "start".to_string(),
                    typ: (**point).clone(),
                },
                Field {
                    name: "end".to_string(),
                    typ: (**point).clone(),
                },
                Field {
                    name: "includesStart".to_string(),
                    typ: VType::bool().required(),
                },
                Field {
                    name: "includesEnd".to_string(),
                    typ: VType::bool().required(),
                },
            ]),
            _ => None,
        }
    }

    /// The element type of an array-shaped kind (Array, Set, Dict).
    pub fn array_element(&self) -> Option<VType> {
        match &self.kind {
            Kind::Array(elem) | Kind::Set(elem) => Some((**elem).clone()),
            Kind::Dict(k, v) => Some(
                VType::struct_of(vec![("key", (**k).clone()), ("value", (**v).clone())])
                    .required(),
            ),
            _ => None,
        }
    }

    /// True when a value of this type is stored as an 8-byte region offset.
    pub fn is_pointer_kind(&self) -> bool {
        matches!(
            &self.kind,
            Kind::Str | Kind::Binary | Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _)
        )
    }

    /// Size in bytes of the slot a value of this type occupies inline.
    pub fn byte_size(&self) -> usize {
        match &self.kind {
            Kind::Bool => 1,
            Kind::Int32 | Kind::Float32 | Kind::Call => 4,
            Kind::Int64 | Kind::Float64 => 8,
            Kind::Str | Kind::Binary | Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _) => 8,
            Kind::Locus | Kind::Interval(_) | Kind::Struct(_) | Kind::Tuple(_) => {
                self.struct_layout().size
            }
        }
    }

    /// Alignment of the inline slot.
    pub fn alignment(&self) -> usize {
        match &self.kind {
            Kind::Bool => 1,
            Kind::Int32 | Kind::Float32 | Kind::Call => 4,
            Kind::Int64 | Kind::Float64 => 8,
            Kind::Str | Kind::Binary | Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _) => 8,
            Kind::Locus | Kind::Interval(_) | Kind::Struct(_) | Kind::Tuple(_) => {
                self.struct_layout().align
            }
        }
    }

    /// Layout of a struct-like kind. Panics on other kinds.
    pub fn struct_layout(&self) -> StructLayout {
        let fields = self
            .struct_fields()
            .unwrap_or_else(|| panic!("struct_layout on non-struct type {}", self));
        StructLayout::of(&fields)
    }

    /// Layout of an array-shaped kind. Panics on other kinds.
    pub fn array_layout(&self) -> ArrayLayout {
        let elem = self
            .array_element()
            .unwrap_or_else(|| panic!("array_layout on non-array type {}", self));
        ArrayLayout::of(&elem)
    }

    // ------------------------------------------------------------------
    // Readers over (region, offset)
    // ------------------------------------------------------------------

    /// Offset of field `i` inside the struct at `struct_off`.
    pub fn field_offset(&self, struct_off: usize, i: usize) -> usize {
        struct_off + self.struct_layout().field_offsets[i]
    }

    pub fn is_field_defined(&self, region: &Region, struct_off: usize, i: usize) -> bool {
        !self.is_field_missing(region, struct_off, i)
    }

    pub fn is_field_missing(&self, region: &Region, struct_off: usize, i: usize) -> bool {
        match self.struct_layout().missing_bits[i] {
            None => false,
            Some(bit) => region.load_bit(struct_off, bit),
        }
    }

    /// Resolve field `i` of the struct at `struct_off` to the offset of its
    /// content. Pointer-kind fields are followed through their stored
    /// offset. The field must be defined.
    pub fn load_field(&self, region: &Region, struct_off: usize, i: usize) -> usize {
        let fields = self.struct_fields().expect("load_field on non-struct");
        let addr = self.field_offset(struct_off, i);
        if fields[i].typ.is_pointer_kind() {
            region.load_offset(addr)
        } else {
            addr
        }
    }

    /// Length of the array at `array_off`.
    pub fn load_length(&self, region: &Region, array_off: usize) -> usize {
        debug_assert!(self.array_element().is_some());
        region.load_i32(array_off) as usize
    }

    /// Offset of element `i` of an array of length `len` at `array_off`.
    pub fn element_offset(&self, array_off: usize, len: usize, i: usize) -> usize {
        let layout = self.array_layout();
        layout.elements_offset(array_off, len) + i * layout.elem_stride
    }

    pub fn is_element_defined(&self, region: &Region, array_off: usize, i: usize) -> bool {
        let layout = self.array_layout();
        if layout.elem_required {
            true
        } else {
            !region.load_bit(array_off + 4, i)
        }
    }

    /// Resolve element `i` to the offset of its content, following
    /// pointer-kind elements. The element must be defined.
    pub fn load_element(&self, region: &Region, array_off: usize, len: usize, i: usize) -> usize {
        let layout = self.array_layout();
        let addr = layout.elements_offset(array_off, len) + i * layout.elem_stride;
        if layout.elem_pointer {
            region.load_offset(addr)
        } else {
            addr
        }
    }

    /// Content offset of an interval's start point.
    pub fn interval_load_start(&self, region: &Region, off: usize) -> usize {
        debug_assert!(matches!(self.kind, Kind::Interval(_)));
        self.load_field(region, off, 0)
    }

    /// Content offset of an interval's end point (field index 1).
    pub fn interval_load_end(&self, region: &Region, off: usize) -> usize {
        debug_assert!(matches!(self.kind, Kind::Interval(_)));
        self.load_field(region, off, 1)
    }
}

impl fmt::Display for VType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Bool => write!(f, "Bool")?,
            Kind::Int32 => write!(f, "Int32")?,
            Kind::Int64 => write!(f, "Int64")?,
            Kind::Float32 => write!(f, "Float32")?,
            Kind::Float64 => write!(f, "Float64")?,
            Kind::Str => write!(f, "Str")?,
            Kind::Binary => write!(f, "Binary")?,
            Kind::Call => write!(f, "Call")?,
            Kind::Locus => write!(f, "Locus")?,
            Kind::Interval(p) => write!(f, "Interval[{}]", p)?,
            Kind::Array(e) => write!(f, "Array[{}]", e)?,
            Kind::Set(e) => write!(f, "Set[{}]", e)?,
            Kind::Dict(k, v) => write!(f, "Dict[{}, {}]", k, v)?,
            Kind::Struct(fields) => {
                write!(f, "Struct{{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.typ)?;
                }
                write!(f, "}}")?;
            }
            Kind::Tuple(types) => {
                write!(f, "Tuple[")?;
                for (i, t) in types.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", t)?;
                }
                write!(f, "]")?;
            }
        }
        if self.required {
            write!(f, "!")?;
        }
        Ok(())
    }
}

/// Precomputed layout of a struct-like type.
///
/// Field offsets and missing-bit positions are functions of the type
/// alone, so a layout can be computed once and reused across rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    /// Total inline size, padded to `align`
    pub size: usize,
    pub align: usize,
    /// Missing-bit header length in bytes
    pub n_missing_bytes: usize,
    /// Offset of each field relative to the struct start
    pub field_offsets: Vec<usize>,
    /// Bit position (within the header) of each field's missing bit;
    /// None for required fields
    pub missing_bits: Vec<Option<usize>>,
    /// Whether each field is stored as a region offset
    pub field_pointer: Vec<bool>,
    pub field_types: Vec<VType>,
}

impl StructLayout {
    pub fn of(fields: &[Field]) -> StructLayout {
        let mut missing_bits = Vec::with_capacity(fields.len());
        let mut n_optional = 0usize;
        for field in fields {
            if field.typ.required {
                missing_bits.push(None);
            } else {
                missing_bits.push(Some(n_optional));
                n_optional += 1;
            }
        }
        let n_missing_bytes = n_optional.div_ceil(8);

        let mut align = 1usize;
        let mut cursor = n_missing_bytes;
        let mut field_offsets = Vec::with_capacity(fields.len());
        let mut field_pointer = Vec::with_capacity(fields.len());
        let mut field_types = Vec::with_capacity(fields.len());
        for field in fields {
            let fa = field.typ.alignment();
            let fs = field.typ.byte_size();
            align = align.max(fa);
            cursor = align_up(cursor, fa);
            field_offsets.push(cursor);
            cursor += fs;
            field_pointer.push(field.typ.is_pointer_kind());
            field_types.push(field.typ.clone());
        }
        StructLayout {
            size: align_up(cursor, align),
            align,
            n_missing_bytes,
            field_offsets,
            missing_bits,
            field_pointer,
            field_types,
        }
    }

    pub fn n_fields(&self) -> usize {
        self.field_offsets.len()
    }
}

/// Precomputed layout of an array-shaped type's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrayLayout {
    pub elem: VType,
    pub elem_required: bool,
    pub elem_pointer: bool,
    pub elem_align: usize,
    pub elem_stride: usize,
    /// Content alignment: length word and element alignment both honored
    pub align: usize,
}

impl ArrayLayout {
    pub fn of(elem: &VType) -> ArrayLayout {
        let elem_align = elem.alignment();
        ArrayLayout {
            elem_required: elem.required,
            elem_pointer: elem.is_pointer_kind(),
            elem_align,
            elem_stride: align_up(elem.byte_size(), elem_align),
            align: elem_align.max(4),
            elem: elem.clone(),
        }
    }

    /// Length of the missing-bit region for `len` elements.
    pub fn n_missing_bytes(&self, len: usize) -> usize {
        if self.elem_required { 0 } else { len.div_ceil(8) }
    }

    /// Absolute offset of the first element of an array at `array_off`.
    pub fn elements_offset(&self, array_off: usize, len: usize) -> usize {
        align_up(array_off + 4 + self.n_missing_bytes(len), self.elem_align)
    }

    /// Total content size for `len` elements starting at `array_off`.
    pub fn content_size(&self, array_off: usize, len: usize) -> usize {
        self.elements_offset(array_off, len) + len * self.elem_stride - array_off
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_sizes() {
        assert_eq!(VType::bool().byte_size(), 1);
        assert_eq!(VType::int32().byte_size(), 4);
        assert_eq!(VType::int64().byte_size(), 8);
        assert_eq!(VType::float64().alignment(), 8);
        assert_eq!(VType::call().byte_size(), 4);
        // pointer kinds are stored as 8-byte offsets
        assert_eq!(VType::str().byte_size(), 8);
        assert_eq!(VType::array_of(VType::int32()).byte_size(), 8);
    }

    #[test]
    fn test_struct_layout_missing_header() {
        let t = VType::struct_of(vec![
            ("a", VType::int32()),
            ("b", VType::int64()),
            ("c", VType::bool()),
        ]);
        let layout = t.struct_layout();
        // three optional fields -> one header byte
        assert_eq!(layout.n_missing_bytes, 1);
        assert_eq!(layout.missing_bits, vec![Some(0), Some(1), Some(2)]);
        // a at 4 (aligned past header), b at 8, c at 16
        assert_eq!(layout.field_offsets, vec![4, 8, 16]);
        assert_eq!(layout.align, 8);
        assert_eq!(layout.size, 24);
    }

    #[test]
    fn test_all_required_struct_has_no_header() {
        let t = VType::struct_of(vec![
            ("a", VType::int32().required()),
            ("b", VType::int32().required()),
        ]);
        let layout = t.struct_layout();
        assert_eq!(layout.n_missing_bytes, 0);
        assert_eq!(layout.missing_bits, vec![None, None]);
        assert_eq!(layout.field_offsets, vec![0, 4]);
        assert_eq!(layout.size, 8);
    }

    #[test]
    fn test_locus_fundamental() {
        let f = VType::locus().fundamental();
        match &f.kind {
            Kind::Struct(fields) => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].name, "contig");
                assert!(matches!(fields[0].typ.kind, Kind::Binary));
                assert!(fields[0].typ.required);
                assert!(matches!(fields[1].typ.kind, Kind::Int32));
            }
            other => panic!("expected struct, got {:?}", other),
        }
    }

    #[test]
    fn test_interval_fundamental_shape() {
        let t = VType::interval_of(VType::int32().required());
        let fields = t.struct_fields().unwrap();
        assert_eq!(
            fields.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
            vec!["start", "end", "includesStart", "includesEnd"]
        );
    }

    #[test]
    fn test_array_layout() {
        let t = VType::array_of(VType::int64());
        let layout = t.array_layout();
        assert_eq!(layout.elem_stride, 8);
        assert_eq!(layout.n_missing_bytes(9), 2);
        // content at 0: 4-byte length + 2 missing bytes, elements aligned to 8
        assert_eq!(layout.elements_offset(0, 9), 8);
        // required elements drop the bit region
        let t2 = VType::array_of(VType::int64().required());
        assert_eq!(t2.array_layout().n_missing_bytes(9), 0);
        assert_eq!(t2.array_layout().elements_offset(0, 9), 8);
    }

    #[test]
    fn test_dict_fundamental_is_array_of_struct() {
        let t = VType::dict_of(VType::str(), VType::int32());
        let f = t.fundamental();
        match &f.kind {
            Kind::Array(elem) => match &elem.kind {
                Kind::Struct(fields) => {
                    assert_eq!(fields[0].name, "key");
                    assert_eq!(fields[1].name, "value");
                }
                other => panic!("expected struct element, got {:?}", other),
            },
            other => panic!("expected array, got {:?}", other),
        }
    }
}
