//! Compiled routine representation
//!
//! The emitter lowers typed IR into a structured instruction tree over a
//! frame of raw 8-byte locals (nanbox discipline: the slot is untyped bits,
//! the opcode knows the type). Row-layout offsets and missing-bit positions
//! are baked into the instructions at emit time, so executing a routine
//! involves no layout computation.
//!
//! Argument convention: slot 0 is the special region argument. User input i
//! occupies value slot `1 + 2i` and missing slot `2 + 2i`. Aggregator seq
//! routines reserve slot 1 for the aggregation state, carry the ambient
//! element pair at slots 2/3, and scope pairs after; fresh locals follow
//! the arguments in every routine.

use std::sync::Arc;
use strata_core::VType;

/// Index into the frame's locals.
pub type Slot = u32;

/// Primitive value kinds as carried in slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimKind {
    /// 0/1 in the low bit
    Bool,
    /// sign-extended into the i64 bits
    I32,
    I64,
    /// f32 bits in the low 32
    F32,
    /// f64 bits
    F64,
}

/// Numeric kinds an arithmetic instruction is specialized to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumKind {
    I32,
    I64,
    F32,
    F64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub enum Instr {
    ConstI64 {
        dst: Slot,
        v: i64,
    },
    ConstF32 {
        dst: Slot,
        v: f32,
    },
    ConstF64 {
        dst: Slot,
        v: f64,
    },
    /// Write string constant `s` into the region; dst = content offset
    ConstStr {
        dst: Slot,
        s: usize,
    },
    Copy {
        dst: Slot,
        src: Slot,
    },

    Arith {
        op: ArithOp,
        kind: NumKind,
        dst: Slot,
        l: Slot,
        r: Slot,
    },
    Cmp {
        op: CmpOp,
        kind: NumKind,
        dst: Slot,
        l: Slot,
        r: Slot,
    },
    Not {
        dst: Slot,
        src: Slot,
    },
    Neg {
        kind: NumKind,
        dst: Slot,
        src: Slot,
    },
    Cast {
        from: NumKind,
        to: NumKind,
        dst: Slot,
        src: Slot,
    },
    /// Length of ArrayRange(start, stop, step): fatal on step 0 and on
    /// lengths exceeding Int32
    RangeLen {
        dst: Slot,
        start: Slot,
        stop: Slot,
        step: Slot,
    },

    // ---- region reads (offsets baked at emit time) ----
    /// Read a primitive at the region offset held in `addr`
    LoadPrim {
        kind: PrimKind,
        dst: Slot,
        addr: Slot,
    },
    /// dst = obj + off, following the stored offset for pointer fields
    LoadField {
        off: usize,
        pointer: bool,
        dst: Slot,
        obj: Slot,
    },
    /// dst = missing bit `bit` of the struct at obj (only emitted for
    /// optional fields)
    FieldMissing {
        bit: usize,
        dst: Slot,
        obj: Slot,
    },
    LoadLength {
        dst: Slot,
        arr: Slot,
    },
    /// Element address computation with the array layout baked in
    LoadElement {
        stride: usize,
        align: usize,
        has_bits: bool,
        pointer: bool,
        dst: Slot,
        arr: Slot,
        len: Slot,
        idx: Slot,
    },
    /// Only emitted for optional elements
    ElementMissing {
        dst: Slot,
        arr: Slot,
        idx: Slot,
    },

    // ---- row builder ----
    /// Push a builder for the interned type
    BldStart {
        typ: usize,
    },
    BldStartStruct,
    BldEndStruct,
    BldStartArray {
        len: Slot,
    },
    BldEndArray,
    BldSetMissing,
    BldAdvance,
    BldAddPrim {
        kind: PrimKind,
        src: Slot,
    },
    /// Deep-copy the value of interned type `typ` at the content offset in
    /// `src` (same region)
    BldAddValue {
        typ: usize,
        src: Slot,
    },
    /// Pop the builder; dst = root offset
    BldEnd {
        dst: Slot,
    },

    // ---- growable (value, missing) buffers for unknown-length arrays ----
    BufNew {
        buf: usize,
    },
    BufPush {
        buf: usize,
        v: Slot,
        m: Slot,
    },
    /// Materialize buffer `buf` as an array of interned type `typ`
    BufWriteArray {
        buf: usize,
        typ: usize,
        dst: Slot,
    },

    // ---- structured control ----
    If {
        cond: Slot,
        then_blk: Vec<Instr>,
        else_blk: Vec<Instr>,
    },
    Loop {
        body: Vec<Instr>,
    },
    Break,

    /// Raise a fatal user error; `{}` placeholders in the interned message
    /// are filled from `args` (rendered as i64)
    Fatal {
        msg: usize,
        args: Vec<Slot>,
    },

    /// Invoke a memoized sub-routine with (value, missing) argument pairs
    CallSub {
        sub: usize,
        args: Vec<(Slot, Slot)>,
        dst_v: Slot,
        dst_m: Slot,
    },
    /// Feed one element into aggregator `agg`
    AggSeq {
        agg: usize,
        v: Slot,
        m: Slot,
    },
}

/// A compiled row-processing routine.
#[derive(Debug, Clone)]
pub struct CompiledFn {
    pub n_locals: usize,
    pub n_bufs: usize,
    pub body: Vec<Instr>,
    pub ret_v: Slot,
    pub ret_m: Slot,
    /// Result type of the routine
    pub typ: VType,
    /// True for aggregator seq routines: slot 1 is the state argument and
    /// input pairs start at slot 2
    pub is_agg_seq: bool,
    /// Interned types referenced by builder instructions
    pub types: Vec<VType>,
    /// Interned strings (constants and fatal messages)
    pub strings: Vec<String>,
    /// Memoized sub-routines for user-function call sites
    pub subs: Vec<Arc<CompiledFn>>,
}
