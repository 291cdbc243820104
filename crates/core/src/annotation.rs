//! Annotation - the dynamic value carrier
//!
//! An `Annotation` is a tagged sum over the *fundamental* kinds only;
//! virtual kinds (locus, interval, call, set, dict, tuple) appear through
//! their fundamental shape. This avoids a universal dynamic type: every
//! annotation is interpreted against a static `VType` by the code touching
//! it. The generic `add_annotation` builder path and JSON import/export are
//! the only consumers; hot paths use the typed readers and adders.

use crate::region::Region;
use crate::types::{Kind, VType};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Annotation {
    Missing,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Str(String),
    Binary(Vec<u8>),
    Array(Vec<Annotation>),
    Struct(Vec<Annotation>),
}

impl Annotation {
    pub fn is_missing(&self) -> bool {
        matches!(self, Annotation::Missing)
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Annotation::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Annotation::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Annotation::Float64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Annotation::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Annotation::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn fields(&self) -> Option<&[Annotation]> {
        match self {
            Annotation::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn elements(&self) -> Option<&[Annotation]> {
        match self {
            Annotation::Array(elems) => Some(elems),
            _ => None,
        }
    }

    /// Truncate a struct annotation to its first `n` fields (partition-key
    /// projection of a full key).
    pub fn prefix(&self, n: usize) -> Annotation {
        match self {
            Annotation::Struct(fields) => Annotation::Struct(fields[..n].to_vec()),
            other => panic!("prefix of non-struct annotation {:?}", other),
        }
    }
}

/// Materialize the value of type `typ` at content offset `off`.
///
/// `off` must be the value's content address (pointer kinds already
/// resolved), as produced by `load_field` / `load_element` / the builder.
pub fn read_annotation(typ: &VType, region: &Region, off: usize) -> Annotation {
    match &typ.kind {
        Kind::Bool => Annotation::Bool(region.load_bool(off)),
        Kind::Int32 | Kind::Call => Annotation::Int32(region.load_i32(off)),
        Kind::Int64 => Annotation::Int64(region.load_i64(off)),
        Kind::Float32 => Annotation::Float32(region.load_f32(off)),
        Kind::Float64 => Annotation::Float64(region.load_f64(off)),
        Kind::Str => {
            let len = region.load_i32(off) as usize;
            let bytes = region.load_bytes(off + 4, len);
            Annotation::Str(String::from_utf8(bytes.to_vec()).expect("non-utf8 string value"))
        }
        Kind::Binary => {
            let len = region.load_i32(off) as usize;
            Annotation::Binary(region.load_bytes(off + 4, len).to_vec())
        }
        Kind::Locus | Kind::Interval(_) | Kind::Struct(_) | Kind::Tuple(_) => {
            let fields = typ.struct_fields().expect("struct-like kind");
            let mut out = Vec::with_capacity(fields.len());
            for (i, field) in fields.iter().enumerate() {
                if typ.is_field_defined(region, off, i) {
                    let content = typ.load_field(region, off, i);
                    out.push(read_annotation(&field.typ, region, content));
                } else {
                    out.push(Annotation::Missing);
                }
            }
            Annotation::Struct(out)
        }
        Kind::Array(_) | Kind::Set(_) | Kind::Dict(_, _) => {
            let elem = typ.array_element().expect("array-shaped kind");
            let len = typ.load_length(region, off);
            let mut out = Vec::with_capacity(len);
            for i in 0..len {
                if typ.is_element_defined(region, off, i) {
                    let content = typ.load_element(region, off, len, i);
                    out.push(read_annotation(&elem, region, content));
                } else {
                    out.push(Annotation::Missing);
                }
            }
            Annotation::Array(out)
        }
    }
}
