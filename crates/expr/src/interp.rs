//! Execution of compiled routines
//!
//! A frame is a vector of raw 8-byte locals plus a builder stack and the
//! growable element buffers used by unknown-length array construction.
//! Control flow is structured (If / Loop / Break), so execution is a
//! recursive walk with a small `Flow` signal.
//!
//! Fatal errors surface as `EngineError::User` with the offending values
//! formatted in; missingness never raises.

use crate::agg::AggCtx;
use crate::instr::{ArithOp, CmpOp, CompiledFn, Instr, NumKind, PrimKind, Slot};
use strata_core::annotation::read_annotation;
use strata_core::types::align_up;
use strata_core::{Annotation, EngineError, Kind, Region, RegionValueBuilder, VType};

enum Flow {
    Normal,
    Break,
}

struct Exec<'a, 'f> {
    f: &'f CompiledFn,
    locals: Vec<u64>,
    builders: Vec<RegionValueBuilder>,
    bufs: Vec<Vec<(u64, bool)>>,
    region: &'a mut Region,
    aggs: Option<&'a mut AggCtx>,
}

impl CompiledFn {
    /// Run the routine against `region`, with `args` as (value bits,
    /// missing) pairs placed per the argument convention. Returns the root
    /// (value bits, missing).
    pub fn eval_raw(
        &self,
        region: &mut Region,
        args: &[(u64, bool)],
        aggs: Option<&mut AggCtx>,
    ) -> Result<(u64, bool), EngineError> {
        let mut locals = vec![0u64; self.n_locals];
        for (i, (v, m)) in args.iter().enumerate() {
            let base = self.arg_base() as usize + 2 * i;
            locals[base] = *v;
            locals[base + 1] = *m as u64;
        }
        let mut exec = Exec {
            f: self,
            locals,
            builders: Vec::new(),
            bufs: vec![Vec::new(); self.n_bufs],
            region,
            aggs,
        };
        exec.block(&self.body)?;
        let v = exec.locals[self.ret_v as usize];
        let m = exec.locals[self.ret_m as usize] != 0;
        Ok((v, m))
    }

    /// First argument slot: 1 normally, 2 for aggregator seq routines
    /// (slot 1 is the aggregation-state argument).
    fn arg_base(&self) -> Slot {
        if self.is_agg_seq { 2 } else { 1 }
    }

    /// Evaluate with annotation arguments and result.
    pub fn eval_annotations(
        &self,
        region: &mut Region,
        arg_types: &[VType],
        args: &[Annotation],
        aggs: Option<&mut AggCtx>,
    ) -> Result<Annotation, EngineError> {
        debug_assert_eq!(arg_types.len(), args.len());
        let bits: Vec<(u64, bool)> = arg_types
            .iter()
            .zip(args)
            .map(|(t, a)| annotation_to_bits(t, a, region))
            .collect();
        let (v, m) = self.eval_raw(region, &bits, aggs)?;
        if m {
            Ok(Annotation::Missing)
        } else {
            Ok(bits_to_annotation(&self.typ, region, v))
        }
    }

    /// Evaluate where the root result must be defined (row-producing
    /// routines).
    pub fn eval_row(
        &self,
        region: &mut Region,
        args: &[(u64, bool)],
        aggs: Option<&mut AggCtx>,
    ) -> Result<u64, EngineError> {
        let (v, m) = self.eval_raw(region, args, aggs)?;
        if m {
            return Err(EngineError::user("cannot return a missing value at the root"));
        }
        Ok(v)
    }
}

impl<'a, 'f> Exec<'a, 'f> {
    fn get(&self, s: Slot) -> u64 {
        self.locals[s as usize]
    }

    fn set(&mut self, s: Slot, v: u64) {
        self.locals[s as usize] = v;
    }

    fn get_bool(&self, s: Slot) -> bool {
        self.locals[s as usize] != 0
    }

    fn block(&mut self, instrs: &[Instr]) -> Result<Flow, EngineError> {
        for instr in instrs {
            match self.step(instr)? {
                Flow::Normal => {}
                Flow::Break => return Ok(Flow::Break),
            }
        }
        Ok(Flow::Normal)
    }

    fn step(&mut self, instr: &Instr) -> Result<Flow, EngineError> {
        match instr {
            Instr::ConstI64 { dst, v } => self.set(*dst, *v as u64),
            Instr::ConstF32 { dst, v } => self.set(*dst, v.to_bits() as u64),
            Instr::ConstF64 { dst, v } => self.set(*dst, v.to_bits()),
            Instr::ConstStr { dst, s } => {
                let bytes = self.f.strings[*s].as_bytes();
                let content = self.region.allocate(4, 4 + bytes.len());
                self.region.store_i32(content, bytes.len() as i32);
                self.region.store_bytes(content + 4, bytes);
                self.set(*dst, content as u64);
            }
            Instr::Copy { dst, src } => {
                let v = self.get(*src);
                self.set(*dst, v);
            }
            Instr::Arith { op, kind, dst, l, r } => {
                let v = arith(*op, *kind, self.get(*l), self.get(*r))?;
                self.set(*dst, v);
            }
            Instr::Cmp { op, kind, dst, l, r } => {
                let v = cmp(*op, *kind, self.get(*l), self.get(*r));
                self.set(*dst, v as u64);
            }
            Instr::Not { dst, src } => {
                let v = !self.get_bool(*src);
                self.set(*dst, v as u64);
            }
            Instr::Neg { kind, dst, src } => {
                let v = match kind {
                    NumKind::I32 => (-(self.get(*src) as i64 as i32)) as i64 as u64,
                    NumKind::I64 => (self.get(*src) as i64).wrapping_neg() as u64,
                    NumKind::F32 => (-f32::from_bits(self.get(*src) as u32)).to_bits() as u64,
                    NumKind::F64 => (-f64::from_bits(self.get(*src))).to_bits(),
                };
                self.set(*dst, v);
            }
            Instr::Cast { from, to, dst, src } => {
                let v = cast(*from, *to, self.get(*src));
                self.set(*dst, v);
            }
            Instr::RangeLen {
                dst,
                start,
                stop,
                step,
            } => {
                let start = self.get(*start) as i64 as i32 as i64;
                let stop = self.get(*stop) as i64 as i32 as i64;
                let step = self.get(*step) as i64 as i32 as i64;
                if step == 0 {
                    return Err(EngineError::user("array range cannot have step size 0"));
                }
                let len = if step > 0 {
                    let d = stop - start;
                    if d <= 0 { 0 } else { (d + step - 1) / step }
                } else {
                    let d = start - stop;
                    let s = -step;
                    if d <= 0 { 0 } else { (d + s - 1) / s }
                };
                if len > i32::MAX as i64 {
                    return Err(EngineError::user(format!(
                        "array range would have {} elements, exceeding Int32 capacity",
                        len
                    )));
                }
                self.set(*dst, len as u64);
            }
            Instr::LoadPrim { kind, dst, addr } => {
                let off = self.get(*addr) as usize;
                let v = match kind {
                    PrimKind::Bool => self.region.load_bool(off) as u64,
                    PrimKind::I32 => self.region.load_i32(off) as i64 as u64,
                    PrimKind::I64 => self.region.load_i64(off) as u64,
                    PrimKind::F32 => self.region.load_f32(off).to_bits() as u64,
                    PrimKind::F64 => self.region.load_f64(off).to_bits(),
                };
                self.set(*dst, v);
            }
            Instr::LoadField {
                off,
                pointer,
                dst,
                obj,
            } => {
                let addr = self.get(*obj) as usize + off;
                let v = if *pointer {
                    self.region.load_offset(addr) as u64
                } else {
                    addr as u64
                };
                self.set(*dst, v);
            }
            Instr::FieldMissing { bit, dst, obj } => {
                let base = self.get(*obj) as usize;
                let v = self.region.load_bit(base, *bit);
                self.set(*dst, v as u64);
            }
            Instr::LoadLength { dst, arr } => {
                let off = self.get(*arr) as usize;
                let v = self.region.load_i32(off) as i64 as u64;
                self.set(*dst, v);
            }
            Instr::LoadElement {
                stride,
                align,
                has_bits,
                pointer,
                dst,
                arr,
                len,
                idx,
            } => {
                let arr_off = self.get(*arr) as usize;
                let len = self.get(*len) as usize;
                let idx = self.get(*idx) as i64 as usize;
                let n_missing = if *has_bits { len.div_ceil(8) } else { 0 };
                let elems = align_up(arr_off + 4 + n_missing, *align);
                let addr = elems + idx * stride;
                let v = if *pointer {
                    self.region.load_offset(addr) as u64
                } else {
                    addr as u64
                };
                self.set(*dst, v);
            }
            Instr::ElementMissing { dst, arr, idx } => {
                let arr_off = self.get(*arr) as usize;
                let idx = self.get(*idx) as i64 as usize;
                let v = self.region.load_bit(arr_off + 4, idx);
                self.set(*dst, v as u64);
            }
            Instr::BldStart { typ } => {
                self.builders
                    .push(RegionValueBuilder::new(&self.f.types[*typ]));
            }
            Instr::BldStartStruct => {
                let rvb = self.builders.last_mut().expect("builder stack empty");
                rvb.start_struct(self.region, true);
            }
            Instr::BldEndStruct => {
                let rvb = self.builders.last_mut().expect("builder stack empty");
                rvb.end_struct();
            }
            Instr::BldStartArray { len } => {
                let n = self.locals[*len as usize] as usize;
                let rvb = self.builders.last_mut().expect("builder stack empty");
                rvb.start_array(self.region, n, true);
            }
            Instr::BldEndArray => {
                let rvb = self.builders.last_mut().expect("builder stack empty");
                rvb.end_array();
            }
            Instr::BldSetMissing => {
                let rvb = self.builders.last_mut().expect("builder stack empty");
                rvb.set_missing(self.region);
            }
            Instr::BldAdvance => {
                let rvb = self.builders.last_mut().expect("builder stack empty");
                rvb.advance();
            }
            Instr::BldAddPrim { kind, src } => {
                let bits = self.locals[*src as usize];
                let rvb = self.builders.last_mut().expect("builder stack empty");
                add_prim(rvb, self.region, *kind, bits);
            }
            Instr::BldAddValue { typ, src } => {
                let off = self.locals[*src as usize] as usize;
                let rvb = self.builders.last_mut().expect("builder stack empty");
                rvb.add_value_within(self.region, &self.f.types[*typ], off);
            }
            Instr::BldEnd { dst } => {
                let mut rvb = self.builders.pop().expect("builder stack empty");
                let off = rvb.end();
                self.set(*dst, off as u64);
            }
            Instr::BufNew { buf } => self.bufs[*buf].clear(),
            Instr::BufPush { buf, v, m } => {
                let value = self.get(*v);
                let missing = self.get_bool(*m);
                self.bufs[*buf].push((value, missing));
            }
            Instr::BufWriteArray { buf, typ, dst } => {
                let array_typ = &self.f.types[*typ];
                let elem = array_typ.array_element().expect("array type");
                let items = std::mem::take(&mut self.bufs[*buf]);
                let mut rvb = RegionValueBuilder::new(array_typ);
                rvb.start_array(self.region, items.len(), true);
                for (v, m) in &items {
                    if *m {
                        rvb.set_missing(self.region);
                    } else {
                        match prim_kind_of(&elem) {
                            Some(kind) => add_prim(&mut rvb, self.region, kind, *v),
                            None => rvb.add_value_within(self.region, &elem, *v as usize),
                        }
                    }
                    rvb.advance();
                }
                rvb.end_array();
                let off = rvb.end();
                self.bufs[*buf] = items;
                self.set(*dst, off as u64);
            }
            Instr::If {
                cond,
                then_blk,
                else_blk,
            } => {
                let flow = if self.get_bool(*cond) {
                    self.block(then_blk)?
                } else {
                    self.block(else_blk)?
                };
                return Ok(flow);
            }
            Instr::Loop { body } => loop {
                match self.block(body)? {
                    Flow::Normal => {}
                    Flow::Break => break,
                }
            },
            Instr::Break => return Ok(Flow::Break),
            Instr::Fatal { msg, args } => {
                let rendered = render_message(
                    &self.f.strings[*msg],
                    &args
                        .iter()
                        .map(|s| self.get(*s) as i64)
                        .collect::<Vec<_>>(),
                );
                return Err(EngineError::User(rendered));
            }
            Instr::CallSub {
                sub,
                args,
                dst_v,
                dst_m,
            } => {
                let bits: Vec<(u64, bool)> = args
                    .iter()
                    .map(|(v, m)| (self.get(*v), self.get_bool(*m)))
                    .collect();
                let (v, m) = self.f.subs[*sub].eval_raw(self.region, &bits, None)?;
                self.set(*dst_v, v);
                self.set(*dst_m, m as u64);
            }
            Instr::AggSeq { agg, v, m } => {
                let value = self.get(*v);
                let missing = self.get_bool(*m);
                let ctx = self
                    .aggs
                    .as_mut()
                    .expect("aggregator instruction outside an aggregation context");
                ctx.seq(*agg, self.region, value, missing);
            }
        }
        Ok(Flow::Normal)
    }
}

fn add_prim(rvb: &mut RegionValueBuilder, region: &mut Region, kind: PrimKind, bits: u64) {
    match kind {
        PrimKind::Bool => rvb.add_bool(region, bits != 0),
        PrimKind::I32 => rvb.add_i32(region, bits as i64 as i32),
        PrimKind::I64 => rvb.add_i64(region, bits as i64),
        PrimKind::F32 => rvb.add_f32(region, f32::from_bits(bits as u32)),
        PrimKind::F64 => rvb.add_f64(region, f64::from_bits(bits)),
    }
}

fn arith(op: ArithOp, kind: NumKind, l: u64, r: u64) -> Result<u64, EngineError> {
    match kind {
        NumKind::I32 => {
            let a = l as i64 as i32;
            let b = r as i64 as i32;
            let v = int_arith(op, a as i64, b as i64)? as i32;
            Ok(v as i64 as u64)
        }
        NumKind::I64 => {
            let v = int_arith(op, l as i64, r as i64)?;
            Ok(v as u64)
        }
        NumKind::F32 => {
            let a = f32::from_bits(l as u32) as f64;
            let b = f32::from_bits(r as u32) as f64;
            Ok(((float_arith(op, a, b)) as f32).to_bits() as u64)
        }
        NumKind::F64 => {
            let a = f64::from_bits(l);
            let b = f64::from_bits(r);
            Ok(float_arith(op, a, b).to_bits())
        }
    }
}

fn int_arith(op: ArithOp, a: i64, b: i64) -> Result<i64, EngineError> {
    match op {
        ArithOp::Add => Ok(a.wrapping_add(b)),
        ArithOp::Sub => Ok(a.wrapping_sub(b)),
        ArithOp::Mul => Ok(a.wrapping_mul(b)),
        ArithOp::Div => {
            if b == 0 {
                Err(EngineError::user("division by zero"))
            } else {
                Ok(a.wrapping_div(b))
            }
        }
        ArithOp::FloorDiv => {
            if b == 0 {
                Err(EngineError::user("division by zero"))
            } else {
                Ok(floor_div(a, b))
            }
        }
        ArithOp::Mod => {
            if b == 0 {
                Err(EngineError::user("modulo by zero"))
            } else {
                Ok(a.wrapping_rem(b))
            }
        }
    }
}

fn float_arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::FloorDiv => (a / b).floor(),
        ArithOp::Mod => a % b,
    }
}

/// Floor division (rounds toward negative infinity).
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r < 0) != (b < 0) { q - 1 } else { q }
}

fn cmp(op: CmpOp, kind: NumKind, l: u64, r: u64) -> bool {
    let ord = match kind {
        NumKind::I32 | NumKind::I64 => (l as i64).cmp(&(r as i64)),
        NumKind::F32 => f32::from_bits(l as u32).total_cmp(&f32::from_bits(r as u32)),
        NumKind::F64 => f64::from_bits(l).total_cmp(&f64::from_bits(r)),
    };
    match op {
        CmpOp::Eq => ord.is_eq(),
        CmpOp::Ne => ord.is_ne(),
        CmpOp::Lt => ord.is_lt(),
        CmpOp::Le => ord.is_le(),
        CmpOp::Gt => ord.is_gt(),
        CmpOp::Ge => ord.is_ge(),
    }
}

fn cast(from: NumKind, to: NumKind, v: u64) -> u64 {
    let as_f64 = match from {
        NumKind::I32 => v as i64 as i32 as f64,
        NumKind::I64 => v as i64 as f64,
        NumKind::F32 => f32::from_bits(v as u32) as f64,
        NumKind::F64 => f64::from_bits(v),
    };
    let as_i64 = match from {
        NumKind::I32 => v as i64,
        NumKind::I64 => v as i64,
        NumKind::F32 => f32::from_bits(v as u32) as i64,
        NumKind::F64 => f64::from_bits(v) as i64,
    };
    match to {
        NumKind::I32 => (as_i64 as i32) as i64 as u64,
        NumKind::I64 => as_i64 as u64,
        NumKind::F32 => (as_f64 as f32).to_bits() as u64,
        NumKind::F64 => as_f64.to_bits(),
    }
}

fn render_message(template: &str, args: &[i64]) -> String {
    let mut out = String::with_capacity(template.len() + 8 * args.len());
    let mut rest = template;
    let mut i = 0;
    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        if i < args.len() {
            out.push_str(&args[i].to_string());
            i += 1;
        } else {
            out.push_str("{}");
        }
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}

/// Slot kind of a type, or None for region-offset (pointer / composite)
/// values.
pub fn prim_kind_of(typ: &VType) -> Option<PrimKind> {
    match &typ.kind {
        Kind::Bool => Some(PrimKind::Bool),
        Kind::Int32 | Kind::Call => Some(PrimKind::I32),
        Kind::Int64 => Some(PrimKind::I64),
        Kind::Float32 => Some(PrimKind::F32),
        Kind::Float64 => Some(PrimKind::F64),
        _ => None,
    }
}

/// Lower an annotation argument into slot bits, writing composites into
/// the region.
pub fn annotation_to_bits(typ: &VType, a: &Annotation, region: &mut Region) -> (u64, bool) {
    if a.is_missing() {
        return (0, true);
    }
    match (prim_kind_of(typ), a) {
        (Some(PrimKind::Bool), Annotation::Bool(b)) => (*b as u64, false),
        (Some(PrimKind::I32), Annotation::Int32(v)) => (*v as i64 as u64, false),
        (Some(PrimKind::I64), Annotation::Int64(v)) => (*v as u64, false),
        (Some(PrimKind::F32), Annotation::Float32(v)) => (v.to_bits() as u64, false),
        (Some(PrimKind::F64), Annotation::Float64(v)) => (v.to_bits(), false),
        (None, _) => {
            let mut rvb = RegionValueBuilder::new(typ);
            rvb.add_annotation(region, typ, a);
            (rvb.end() as u64, false)
        }
        (kind, a) => panic!("annotation {:?} does not fit slot kind {:?}", a, kind),
    }
}

/// Raise slot bits back to an annotation.
pub fn bits_to_annotation(typ: &VType, region: &Region, v: u64) -> Annotation {
    match prim_kind_of(typ) {
        Some(PrimKind::Bool) => Annotation::Bool(v != 0),
        Some(PrimKind::I32) => Annotation::Int32(v as i64 as i32),
        Some(PrimKind::I64) => Annotation::Int64(v as i64),
        Some(PrimKind::F32) => Annotation::Float32(f32::from_bits(v as u32)),
        Some(PrimKind::F64) => Annotation::Float64(f64::from_bits(v)),
        None => read_annotation(typ, region, v as usize),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_div_rounds_down() {
        assert_eq!(floor_div(7, 2), 3);
        assert_eq!(floor_div(-7, 2), -4);
        assert_eq!(floor_div(7, -2), -4);
        assert_eq!(floor_div(-7, -2), 3);
        assert_eq!(floor_div(6, 3), 2);
    }

    #[test]
    fn test_render_message() {
        assert_eq!(
            render_message("index {} out of bounds ({} elements)", &[5, 3]),
            "index 5 out of bounds (3 elements)"
        );
        assert_eq!(render_message("no args", &[]), "no args");
    }

    #[test]
    fn test_cast_matrix() {
        // i32 -> f64
        assert_eq!(
            f64::from_bits(cast(NumKind::I32, NumKind::F64, (-3i64) as u64)),
            -3.0
        );
        // f64 -> i32 truncates
        assert_eq!(
            cast(NumKind::F64, NumKind::I32, 2.9f64.to_bits()) as i64,
            2
        );
        // i32 -> i64 sign extends
        assert_eq!(cast(NumKind::I32, NumKind::I64, (-1i64) as u64) as i64, -1);
    }
}
