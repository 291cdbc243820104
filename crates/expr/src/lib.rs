//! Strata expression compiler
//!
//! A typed expression tree (`Ir`) lowers through the triplet emitter into
//! specialized row-processing routines (`CompiledFn`): structured,
//! type-specialized instruction blocks over raw 8-byte locals, executed by
//! the interpreter in this crate. Row layout offsets are resolved at emit
//! time, so the compiled routine touches regions with precomputed offsets
//! only.
//!
//! Aggregations compile separately: `compile_with_aggregators` splits an
//! expression into a per-row seq routine, serializable partial states, and
//! a result routine evaluated after cross-partition combining.

pub mod agg;
pub mod emit;
pub mod functions;
pub mod instr;
pub mod interp;
pub mod ir;

pub use agg::{AggCtx, AggOp, AggSpec, AggState};
pub use emit::{AggCompilation, EmitError, compile, compile_with_aggregators, infer_type};
pub use functions::FunctionRegistry;
pub use instr::{CompiledFn, Instr, PrimKind, Slot};
pub use interp::{annotation_to_bits, bits_to_annotation, prim_kind_of};
pub use ir::{BinOp, Ir, UnOp};
