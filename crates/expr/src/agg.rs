//! Aggregator protocol
//!
//! Each aggregator op declares its element type, result type, and the four
//! state operations: zero, seq (the in-partition step invoked by emitted
//! code), combine (partial aggregation across partitions), and result.
//! States are plain serializable enums mutated in place; `AggCtx` owns the
//! state vector for one evaluation and ships partial states between
//! partitions bincode-encoded.
//!
//! Combine is associative for every op; it is additionally commutative for
//! Sum, Product, Max, Min, and Count. Collect and Take respect partition
//! order, so their partials must be combined in ascending partition index.
//!
//! Missing elements: Sum, Product, Max, and Min skip them; Count counts
//! every produced element; Collect and Take preserve them as missing.

use crate::interp::bits_to_annotation;
use serde::{Deserialize, Serialize};
use strata_core::{Annotation, EngineError, Kind, Region, VType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggOp {
    Sum,
    Product,
    Max,
    Min,
    Count,
    Collect,
    Take,
}

/// One aggregator instance extracted from an expression.
#[derive(Debug, Clone, PartialEq)]
pub struct AggSpec {
    pub op: AggOp,
    /// Type of the elements the aggregable feeds in
    pub elem_typ: VType,
    /// Constant operator arguments (e.g. n for Take)
    pub args: Vec<Annotation>,
}

impl AggSpec {
    /// Result type of this aggregator. Sum and Product widen integers to
    /// Int64 and floats to Float64; Count is a required Int64 (it is never
    /// missing); Max/Min keep the element type.
    pub fn result_type(&self) -> Result<VType, EngineError> {
        match self.op {
            AggOp::Sum | AggOp::Product => match &self.elem_typ.kind {
                Kind::Int32 | Kind::Int64 => Ok(VType::int64().required()),
                Kind::Float32 | Kind::Float64 => Ok(VType::float64().required()),
                other => Err(EngineError::user(format!(
                    "{:?} aggregator requires a numeric element, got {:?}",
                    self.op, other
                ))),
            },
            AggOp::Max | AggOp::Min => match &self.elem_typ.kind {
                Kind::Int32 | Kind::Int64 | Kind::Float32 | Kind::Float64 => {
                    let mut t = self.elem_typ.clone();
                    t.required = false;
                    Ok(t)
                }
                other => Err(EngineError::user(format!(
                    "{:?} aggregator requires a numeric element, got {:?}",
                    self.op, other
                ))),
            },
            AggOp::Count => Ok(VType::int64().required()),
            AggOp::Collect | AggOp::Take => {
                Ok(VType::array_of(self.elem_typ.clone()).required())
            }
        }
    }

    fn take_n(&self) -> usize {
        match self.args.first() {
            Some(Annotation::Int32(n)) => (*n).max(0) as usize,
            other => panic!("Take aggregator without an Int32 argument: {:?}", other),
        }
    }

    fn is_float(&self) -> bool {
        matches!(self.elem_typ.kind, Kind::Float32 | Kind::Float64)
    }

    /// The seed state.
    pub fn zero(&self) -> AggState {
        match (self.op, self.is_float()) {
            (AggOp::Sum, false) => AggState::SumI64(0),
            (AggOp::Sum, true) => AggState::SumF64(0.0),
            (AggOp::Product, false) => AggState::ProductI64(1),
            (AggOp::Product, true) => AggState::ProductF64(1.0),
            (AggOp::Max, false) => AggState::MaxI64(None),
            (AggOp::Max, true) => AggState::MaxF64(None),
            (AggOp::Min, false) => AggState::MinI64(None),
            (AggOp::Min, true) => AggState::MinF64(None),
            (AggOp::Count, _) => AggState::Count(0),
            (AggOp::Collect, _) => AggState::Collect(Vec::new()),
            (AggOp::Take, _) => AggState::Take {
                n: self.take_n(),
                values: Vec::new(),
            },
        }
    }
}

/// Per-aggregator running state. Lives in the evaluation's dedicated state
/// vector; seq mutates in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggState {
    SumI64(i64),
    SumF64(f64),
    ProductI64(i64),
    ProductF64(f64),
    MaxI64(Option<i64>),
    MaxF64(Option<f64>),
    MinI64(Option<i64>),
    MinF64(Option<f64>),
    Count(i64),
    Collect(Vec<Annotation>),
    Take { n: usize, values: Vec<Annotation> },
}

impl AggState {
    /// Fold one element (slot bits + missing flag) into the state.
    pub fn seq(&mut self, spec: &AggSpec, region: &Region, v: u64, missing: bool) {
        match self {
            AggState::Count(c) => *c += 1,
            AggState::Collect(values) => {
                values.push(element_annotation(spec, region, v, missing));
            }
            AggState::Take { n, values } => {
                if values.len() < *n {
                    values.push(element_annotation(spec, region, v, missing));
                }
            }
            _ if missing => {}
            AggState::SumI64(acc) => *acc += int_bits(&spec.elem_typ, v),
            AggState::SumF64(acc) => *acc += float_bits(&spec.elem_typ, v),
            AggState::ProductI64(acc) => *acc *= int_bits(&spec.elem_typ, v),
            AggState::ProductF64(acc) => *acc *= float_bits(&spec.elem_typ, v),
            AggState::MaxI64(acc) => {
                let x = int_bits(&spec.elem_typ, v);
                *acc = Some(acc.map_or(x, |a| a.max(x)));
            }
            AggState::MaxF64(acc) => {
                let x = float_bits(&spec.elem_typ, v);
                *acc = Some(acc.map_or(x, |a| a.max(x)));
            }
            AggState::MinI64(acc) => {
                let x = int_bits(&spec.elem_typ, v);
                *acc = Some(acc.map_or(x, |a| a.min(x)));
            }
            AggState::MinF64(acc) => {
                let x = float_bits(&spec.elem_typ, v);
                *acc = Some(acc.map_or(x, |a| a.min(x)));
            }
        }
    }

    /// Merge a later partial into this one. Panics on mismatched variants;
    /// partials always come from the same compilation.
    pub fn combine(&mut self, other: &AggState) {
        match (self, other) {
            (AggState::SumI64(a), AggState::SumI64(b)) => *a += b,
            (AggState::SumF64(a), AggState::SumF64(b)) => *a += b,
            (AggState::ProductI64(a), AggState::ProductI64(b)) => *a *= b,
            (AggState::ProductF64(a), AggState::ProductF64(b)) => *a *= b,
            (AggState::MaxI64(a), AggState::MaxI64(b)) => {
                *a = merge_opt(*a, *b, i64::max);
            }
            (AggState::MaxF64(a), AggState::MaxF64(b)) => {
                *a = merge_opt(*a, *b, f64::max);
            }
            (AggState::MinI64(a), AggState::MinI64(b)) => {
                *a = merge_opt(*a, *b, i64::min);
            }
            (AggState::MinF64(a), AggState::MinF64(b)) => {
                *a = merge_opt(*a, *b, f64::min);
            }
            (AggState::Count(a), AggState::Count(b)) => *a += b,
            (AggState::Collect(a), AggState::Collect(b)) => a.extend(b.iter().cloned()),
            (AggState::Take { n, values }, AggState::Take { values: other, .. }) => {
                for v in other {
                    if values.len() >= *n {
                        break;
                    }
                    values.push(v.clone());
                }
            }
            (a, b) => panic!("combining mismatched aggregator states {:?} / {:?}", a, b),
        }
    }

    /// Materialize the result. Sum/Product over no elements return the
    /// op's zero, defined; Max/Min over no elements are missing.
    pub fn result(&self, spec: &AggSpec) -> Annotation {
        match self {
            AggState::SumI64(v) | AggState::ProductI64(v) => Annotation::Int64(*v),
            AggState::SumF64(v) | AggState::ProductF64(v) => Annotation::Float64(*v),
            AggState::MaxI64(v) | AggState::MinI64(v) => match v {
                None => Annotation::Missing,
                Some(x) => match spec.elem_typ.kind {
                    Kind::Int32 => Annotation::Int32(*x as i32),
                    _ => Annotation::Int64(*x),
                },
            },
            AggState::MaxF64(v) | AggState::MinF64(v) => match v {
                None => Annotation::Missing,
                Some(x) => match spec.elem_typ.kind {
                    Kind::Float32 => Annotation::Float32(*x as f32),
                    _ => Annotation::Float64(*x),
                },
            },
            AggState::Count(c) => Annotation::Int64(*c),
            AggState::Collect(values) => Annotation::Array(values.clone()),
            AggState::Take { values, .. } => Annotation::Array(values.clone()),
        }
    }
}

fn merge_opt<T: Copy>(a: Option<T>, b: Option<T>, f: impl Fn(T, T) -> T) -> Option<T> {
    match (a, b) {
        (Some(x), Some(y)) => Some(f(x, y)),
        (x, None) => x,
        (None, y) => y,
    }
}

fn int_bits(typ: &VType, v: u64) -> i64 {
    match typ.kind {
        Kind::Int32 => (v as i64) as i32 as i64,
        _ => v as i64,
    }
}

fn float_bits(typ: &VType, v: u64) -> f64 {
    match typ.kind {
        Kind::Float32 => f32::from_bits(v as u32) as f64,
        _ => f64::from_bits(v),
    }
}

fn element_annotation(spec: &AggSpec, region: &Region, v: u64, missing: bool) -> Annotation {
    if missing {
        Annotation::Missing
    } else {
        bits_to_annotation(&spec.elem_typ, region, v)
    }
}

/// The aggregation context of one evaluation: specs plus mutable states.
#[derive(Debug, Clone)]
pub struct AggCtx {
    pub specs: Vec<AggSpec>,
    pub states: Vec<AggState>,
}

impl AggCtx {
    pub fn new(specs: Vec<AggSpec>) -> AggCtx {
        let states = specs.iter().map(AggSpec::zero).collect();
        AggCtx { specs, states }
    }

    pub fn seq(&mut self, idx: usize, region: &Region, v: u64, missing: bool) {
        let spec = &self.specs[idx];
        self.states[idx].seq(spec, region, v, missing);
    }

    /// Merge a later partition's partial states into this one, in order.
    pub fn combine(&mut self, other: &[AggState]) {
        assert_eq!(self.states.len(), other.len(), "partial state arity mismatch");
        for (state, partial) in self.states.iter_mut().zip(other) {
            state.combine(partial);
        }
    }

    pub fn results(&self) -> Vec<Annotation> {
        self.specs
            .iter()
            .zip(&self.states)
            .map(|(spec, state)| state.result(spec))
            .collect()
    }

    /// Serialize the partial states for cross-partition transport.
    pub fn encode_states(&self) -> Result<Vec<u8>, EngineError> {
        bincode::serialize(&self.states)
            .map_err(|e| EngineError::Codec(format!("aggregator state encode: {}", e)))
    }

    pub fn decode_states(bytes: &[u8]) -> Result<Vec<AggState>, EngineError> {
        bincode::deserialize(bytes)
            .map_err(|e| EngineError::Codec(format!("aggregator state decode: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_spec() -> AggSpec {
        AggSpec {
            op: AggOp::Sum,
            elem_typ: VType::int32(),
            args: vec![],
        }
    }

    #[test]
    fn test_sum_skips_missing_and_zero_is_defined() {
        let spec = sum_spec();
        let mut state = spec.zero();
        let region = Region::new();
        state.seq(&spec, &region, 5u64, false);
        state.seq(&spec, &region, 0, true);
        state.seq(&spec, &region, (-2i64) as u64, false);
        assert_eq!(state.result(&spec), Annotation::Int64(3));
        // all-missing sum stays the defined zero
        let empty = spec.zero();
        assert_eq!(empty.result(&spec), Annotation::Int64(0));
    }

    #[test]
    fn test_max_over_nothing_is_missing() {
        let spec = AggSpec {
            op: AggOp::Max,
            elem_typ: VType::int32(),
            args: vec![],
        };
        assert_eq!(spec.zero().result(&spec), Annotation::Missing);
    }

    #[test]
    fn test_combine_in_partition_order() {
        let spec = AggSpec {
            op: AggOp::Take,
            elem_typ: VType::int32(),
            args: vec![Annotation::Int32(3)],
        };
        let region = Region::new();
        let mut a = spec.zero();
        a.seq(&spec, &region, 1, false);
        let mut b = spec.zero();
        b.seq(&spec, &region, 2, false);
        b.seq(&spec, &region, 3, false);
        b.seq(&spec, &region, 4, false);
        a.combine(&b);
        assert_eq!(
            a.result(&spec),
            Annotation::Array(vec![
                Annotation::Int32(1),
                Annotation::Int32(2),
                Annotation::Int32(3)
            ])
        );
    }

    #[test]
    fn test_state_transport_round_trip() {
        let ctx = AggCtx::new(vec![sum_spec()]);
        let bytes = ctx.encode_states().unwrap();
        let back = AggCtx::decode_states(&bytes).unwrap();
        assert_eq!(back, ctx.states);
    }

    #[test]
    fn test_count_counts_missing_elements() {
        let spec = AggSpec {
            op: AggOp::Count,
            elem_typ: VType::int32(),
            args: vec![],
        };
        let region = Region::new();
        let mut state = spec.zero();
        state.seq(&spec, &region, 0, true);
        state.seq(&spec, &region, 7, false);
        assert_eq!(state.result(&spec), Annotation::Int64(2));
    }
}
