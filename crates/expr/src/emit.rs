//! The triplet emitter
//!
//! Every IR node lowers to a triplet (setup block, missing slot, value
//! slot). Three invariants hold on every path:
//!
//! 1. At most one evaluation: a sub-expression's code is emitted once and
//!    its result slots are referenced thereafter.
//! 2. Unconditional setup: a node's setup executes on every static path
//!    that could observe its missing or value slot.
//! 3. Missingness gates value: the value slot is meaningful only when the
//!    missing slot is false; the missing path stores a default so no slot
//!    is ever read uninitialized.
//!
//! Array nodes produce an `ArrayIter` (the array-iterator triplet): length
//! calculation, an optional known length, and a generator that pushes each
//! element through a continuation exactly once. Known-length consumers
//! preallocate through the row builder; unknown-length consumers buffer
//! pairs and copy. Aggregables compose the same way on a per-element
//! continuation ending in an `AggSeq` instruction.

use crate::agg::AggSpec;
use crate::functions::{FnDef, FunctionRegistry, same_kind};
use crate::instr::{ArithOp, CmpOp, CompiledFn, Instr, NumKind, Slot};
use crate::interp::prim_kind_of;
use crate::ir::{BinOp, Ir, UnOp};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use strata_core::{Annotation, Field, Kind, VType};
use tracing::debug;

#[derive(Debug)]
pub struct EmitError(pub String);

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "emit error: {}", self.0)
    }
}

impl std::error::Error for EmitError {}

fn err<T>(msg: impl Into<String>) -> Result<T, EmitError> {
    Err(EmitError(msg.into()))
}

#[derive(Debug, Clone)]
struct Binding {
    typ: VType,
    v: Slot,
    m: Slot,
}

#[derive(Debug, Clone, Default)]
struct Env {
    vars: HashMap<String, Binding>,
}

impl Env {
    fn bind(&self, name: &str, binding: Binding) -> Env {
        let mut next = self.clone();
        next.vars.insert(name.to_string(), binding);
        next
    }

    fn get(&self, name: &str) -> Option<&Binding> {
        self.vars.get(name)
    }
}

/// (setup, isMissing, value)
struct EmitTriplet {
    setup: Vec<Instr>,
    m: Slot,
    v: Slot,
}

type ContFn<'c> = dyn FnMut(&mut Emitter, Slot, Slot) -> Result<Vec<Instr>, EmitError> + 'c;
type GenFn<'ir> =
    Box<dyn FnOnce(&mut Emitter, &mut ContFn<'_>) -> Result<Vec<Instr>, EmitError> + 'ir>;

/// The array-iterator triplet: setup + missingness, an optional known
/// length, and a one-shot generator that drives a continuation per element
/// (continuation arguments: element missing slot, element value slot).
struct ArrayIter<'ir> {
    setup: Vec<Instr>,
    m: Slot,
    known_len: Option<Slot>,
    elem: VType,
    r#gen: GenFn<'ir>,
}

pub struct Emitter {
    registry: Arc<FunctionRegistry>,
    input_types: Vec<VType>,
    arg_base: Slot,
    next_slot: Slot,
    n_bufs: usize,
    types: Vec<VType>,
    strings: Vec<String>,
    subs: Vec<Arc<CompiledFn>>,
    sub_memo: HashMap<(String, Vec<VType>), usize>,
    /// Present when emitting an aggregator seq routine: the ambient
    /// element's type and (value, missing) slots
    agg_elem: Option<(VType, Slot, Slot)>,
}

impl Emitter {
    fn new(
        input_types: Vec<VType>,
        registry: Arc<FunctionRegistry>,
        agg_elem_typ: Option<VType>,
    ) -> Emitter {
        let is_agg = agg_elem_typ.is_some();
        let arg_base: Slot = if is_agg { 2 } else { 1 };
        let next_slot = arg_base + 2 * input_types.len() as Slot;
        Emitter {
            registry,
            input_types,
            arg_base,
            next_slot,
            n_bufs: 0,
            types: Vec::new(),
            strings: Vec::new(),
            subs: Vec::new(),
            sub_memo: HashMap::new(),
            agg_elem: agg_elem_typ.map(|t| (t, 2, 3)),
        }
    }

    fn slot(&mut self) -> Slot {
        let s = self.next_slot;
        self.next_slot += 1;
        s
    }

    fn pair(&mut self) -> (Slot, Slot) {
        (self.slot(), self.slot())
    }

    fn buf(&mut self) -> usize {
        let b = self.n_bufs;
        self.n_bufs += 1;
        b
    }

    fn intern_type(&mut self, t: &VType) -> usize {
        if let Some(i) = self.types.iter().position(|x| x == t) {
            return i;
        }
        self.types.push(t.clone());
        self.types.len() - 1
    }

    fn intern_string(&mut self, s: &str) -> usize {
        if let Some(i) = self.strings.iter().position(|x| x == s) {
            return i;
        }
        self.strings.push(s.to_string());
        self.strings.len() - 1
    }

    fn finish(self, t: EmitTriplet, typ: VType, is_agg_seq: bool) -> CompiledFn {
        let f = CompiledFn {
            n_locals: self.next_slot as usize,
            n_bufs: self.n_bufs,
            body: t.setup,
            ret_v: t.v,
            ret_m: t.m,
            typ,
            is_agg_seq,
            types: self.types,
            strings: self.strings,
            subs: self.subs,
        };
        debug!(
            n_locals = f.n_locals,
            n_bufs = f.n_bufs,
            n_subs = f.subs.len(),
            "compiled row routine"
        );
        f
    }

    // ------------------------------------------------------------------
    // small codegen helpers
    // ------------------------------------------------------------------

    fn const_bool(&mut self, block: &mut Vec<Instr>, b: bool) -> Slot {
        let s = self.slot();
        block.push(Instr::ConstI64 {
            dst: s,
            v: b as i64,
        });
        s
    }

    /// dst = a || b over missing-bit slots
    fn or_missing(&mut self, block: &mut Vec<Instr>, a: Slot, b: Slot) -> Slot {
        let dst = self.slot();
        block.push(Instr::If {
            cond: a,
            then_blk: vec![Instr::ConstI64 { dst, v: 1 }],
            else_blk: vec![Instr::Copy { dst, src: b }],
        });
        dst
    }

    /// Cast `src` (type `from`) to the kind of `to` if they differ,
    /// returning the slot holding the converted value.
    fn cast_to(
        &mut self,
        block: &mut Vec<Instr>,
        from: &VType,
        to: &VType,
        src: Slot,
    ) -> Result<Slot, EmitError> {
        if same_kind(from, to) {
            return Ok(src);
        }
        let (Some(fk), Some(tk)) = (num_kind(from), num_kind(to)) else {
            return err(format!("cannot cast {} to {}", from, to));
        };
        let dst = self.slot();
        block.push(Instr::Cast {
            from: fk,
            to: tk,
            dst,
            src,
        });
        Ok(dst)
    }

    /// Load the value at the content address in `addr` as a slot value:
    /// primitives are read, everything else keeps its offset.
    fn load_typed(&self, block: &mut Vec<Instr>, typ: &VType, addr: Slot) {
        if let Some(kind) = prim_kind_of(typ) {
            block.push(Instr::LoadPrim {
                kind,
                dst: addr,
                addr,
            });
        }
    }

    /// Builder add of the slot value `v` of type `typ` (assumed defined).
    fn bld_add(&mut self, block: &mut Vec<Instr>, typ: &VType, v: Slot) {
        match prim_kind_of(typ) {
            Some(kind) => block.push(Instr::BldAddPrim { kind, src: v }),
            None => {
                let t = self.intern_type(typ);
                block.push(Instr::BldAddValue { typ: t, src: v });
            }
        }
    }

    // ------------------------------------------------------------------
    // type inference
    // ------------------------------------------------------------------

    /// Result type of `ir` under `env`. Emission derives the same types;
    /// this is the standalone pass used for array element types and
    /// aggregator results.
    fn infer(&self, ir: &Ir, env: &Env) -> Result<VType, EmitError> {
        match ir {
            Ir::NA(t) => {
                let mut t = t.clone();
                t.required = false;
                Ok(t)
            }
            Ir::I32(_) => Ok(VType::int32().required()),
            Ir::I64(_) => Ok(VType::int64().required()),
            Ir::F32(_) => Ok(VType::float32().required()),
            Ir::F64(_) => Ok(VType::float64().required()),
            Ir::Bool(_) => Ok(VType::bool().required()),
            Ir::Str(_) => Ok(VType::str().required()),
            Ir::IsNa(_) => Ok(VType::bool().required()),
            Ir::If { cond, cnsq, altr } => {
                let ct = self.infer(cond, env)?;
                if !matches!(ct.kind, Kind::Bool) {
                    return err(format!("If condition must be Bool, got {}", ct));
                }
                let lt = self.infer(cnsq, env)?;
                let rt = self.infer(altr, env)?;
                promote(&lt, &rt)
            }
            Ir::Let { name, value, body } => {
                let vt = self.infer(value, env)?;
                let env2 = env.bind(
                    name,
                    Binding {
                        typ: vt,
                        v: 0,
                        m: 0,
                    },
                );
                self.infer(body, &env2)
            }
            Ir::MapNa { name, value, body } => {
                let mut vt = self.infer(value, env)?;
                vt.required = true;
                let env2 = env.bind(
                    name,
                    Binding {
                        typ: vt,
                        v: 0,
                        m: 0,
                    },
                );
                let mut bt = self.infer(body, &env2)?;
                bt.required = false;
                Ok(bt)
            }
            Ir::Ref(name) => match env.get(name) {
                Some(b) => Ok(b.typ.clone()),
                None => err(format!("symbol `{}` not found", name)),
            },
            Ir::In(i) => match self.input_types.get(*i) {
                Some(t) => Ok(t.clone()),
                None => err(format!("input {} out of range", i)),
            },
            Ir::Cast { value, typ } => {
                let vt = self.infer(value, env)?;
                Ok(VType::new(typ.kind.clone(), vt.required))
            }
            Ir::ApplyBinOp { op, l, r } => {
                let lt = self.infer(l, env)?;
                let rt = self.infer(r, env)?;
                let required = lt.required && rt.required;
                match op {
                    BinOp::And | BinOp::Or => Ok(VType::new(Kind::Bool, required)),
                    BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                        Ok(VType::new(Kind::Bool, required))
                    }
                    _ => promote(&lt, &rt),
                }
            }
            Ir::ApplyUnOp { op, v } => {
                let vt = self.infer(v, env)?;
                match op {
                    UnOp::Negate => Ok(vt),
                    UnOp::Bang => Ok(VType::new(Kind::Bool, vt.required)),
                }
            }
            Ir::MakeArray { elem, .. } => Ok(VType::array_of(elem.clone()).required()),
            Ir::ArrayRef { a, .. } => {
                let at = self.infer(a, env)?;
                let mut elem = array_elem(&at)?;
                elem.required = false;
                Ok(elem)
            }
            Ir::ArrayLen(a) => {
                let at = self.infer(a, env)?;
                array_elem(&at)?;
                Ok(VType::new(Kind::Int32, at.required))
            }
            Ir::ArrayRange { start, stop, step } => {
                let required = self.infer(start, env)?.required
                    && self.infer(stop, env)?.required
                    && self.infer(step, env)?.required;
                Ok(VType::new(
                    Kind::Array(Box::new(VType::int32().required())),
                    required,
                ))
            }
            Ir::ArrayMap { a, name, body } => {
                let at = self.infer(a, env)?;
                let elem = array_elem(&at)?;
                let env2 = env.bind(
                    name,
                    Binding {
                        typ: elem,
                        v: 0,
                        m: 0,
                    },
                );
                let bt = self.infer(body, &env2)?;
                Ok(VType::new(Kind::Array(Box::new(bt)), at.required))
            }
            Ir::ArrayFilter { a, name, body } => {
                let at = self.infer(a, env)?;
                let elem = array_elem(&at)?;
                let env2 = env.bind(
                    name,
                    Binding {
                        typ: elem.clone(),
                        v: 0,
                        m: 0,
                    },
                );
                let pt = self.infer(body, &env2)?;
                if !matches!(pt.kind, Kind::Bool) {
                    return err(format!("filter predicate must be Bool, got {}", pt));
                }
                Ok(VType::new(Kind::Array(Box::new(elem)), at.required))
            }
            Ir::ArrayFlatMap { a, name, body } => {
                let at = self.infer(a, env)?;
                let elem = array_elem(&at)?;
                let env2 = env.bind(
                    name,
                    Binding {
                        typ: elem,
                        v: 0,
                        m: 0,
                    },
                );
                let bt = self.infer(body, &env2)?;
                let inner = array_elem(&bt)?;
                Ok(VType::new(Kind::Array(Box::new(inner)), at.required))
            }
            Ir::ArrayFold {
                a,
                zero,
                acc_name,
                value_name,
                body,
            } => {
                let at = self.infer(a, env)?;
                let elem = array_elem(&at)?;
                let zt = self.infer(zero, env)?;
                let env2 = env
                    .bind(
                        acc_name,
                        Binding {
                            typ: zt.clone(),
                            v: 0,
                            m: 0,
                        },
                    )
                    .bind(
                        value_name,
                        Binding {
                            typ: elem,
                            v: 0,
                            m: 0,
                        },
                    );
                let bt = self.infer(body, &env2)?;
                if !same_kind(&zt, &bt) {
                    return err(format!("fold accumulator {} and body {} disagree", zt, bt));
                }
                Ok(VType::new(zt.kind, false))
            }
            Ir::MakeStruct(fields) => {
                let mut out = Vec::with_capacity(fields.len());
                for (name, f) in fields {
                    out.push(Field {
                        name: name.clone(),
                        typ: self.infer(f, env)?,
                    });
                }
                Ok(VType::new(Kind::Struct(out), true))
            }
            Ir::InsertFields { old, fields } => {
                let ot = self.infer(old, env)?;
                let mut out = match &ot.kind {
                    Kind::Struct(fs) => fs.clone(),
                    other => return err(format!("InsertFields on non-struct {:?}", other)),
                };
                for (name, f) in fields {
                    let ft = self.infer(f, env)?;
                    match out.iter_mut().find(|existing| existing.name == *name) {
                        Some(existing) => existing.typ = ft,
                        None => out.push(Field {
                            name: name.clone(),
                            typ: ft,
                        }),
                    }
                }
                Ok(VType::new(Kind::Struct(out), ot.required))
            }
            Ir::GetField { o, name } => {
                let ot = self.infer(o, env)?;
                let fields = match &ot.kind {
                    Kind::Struct(fs) => fs.clone(),
                    _ => ot
                        .struct_fields()
                        .ok_or_else(|| EmitError(format!("GetField on non-struct {}", ot)))?,
                };
                match fields.iter().find(|f| f.name == *name) {
                    Some(f) => {
                        let mut t = f.typ.clone();
                        t.required = t.required && ot.required;
                        Ok(t)
                    }
                    None => err(format!("struct has no field `{}`", name)),
                }
            }
            Ir::MakeTuple(items) => {
                let types = items
                    .iter()
                    .map(|item| self.infer(item, env))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(VType::new(Kind::Tuple(types), true))
            }
            Ir::GetTupleElement { o, idx } => {
                let ot = self.infer(o, env)?;
                match &ot.kind {
                    Kind::Tuple(types) => match types.get(*idx) {
                        Some(t) => {
                            let mut t = t.clone();
                            t.required = t.required && ot.required;
                            Ok(t)
                        }
                        None => err(format!("tuple has no element {}", idx)),
                    },
                    other => err(format!("GetTupleElement on {:?}", other)),
                }
            }
            Ir::AggIn => match &self.agg_elem {
                Some((t, _, _)) => Ok(t.clone()),
                None => err("AggIn outside an aggregation"),
            },
            Ir::AggMap { .. } | Ir::AggFilter { .. } | Ir::AggFlatMap { .. } => {
                err("an aggregable has no value type; it must feed an aggregator op")
            }
            Ir::ApplyAggOp { a, op, args } => {
                let elem = self.agg_elem_type_of(a, env)?;
                let spec = AggSpec {
                    op: *op,
                    elem_typ: elem,
                    args: args.iter().map(lit_annotation).collect::<Result<_, _>>()?,
                };
                spec.result_type().map_err(|e| EmitError(e.to_string()))
            }
            Ir::Apply { function, args } => {
                let arg_types = args
                    .iter()
                    .map(|a| self.infer(a, env))
                    .collect::<Result<Vec<_>, _>>()?;
                let def = self.resolve(function, &arg_types)?;
                let mut env2 = Env::default();
                for (param, typ) in def.params.iter().zip(&arg_types) {
                    env2.vars.insert(
                        param.clone(),
                        Binding {
                            typ: typ.clone(),
                            v: 0,
                            m: 0,
                        },
                    );
                }
                self.infer(&def.body, &env2)
            }
        }
    }

    fn resolve(&self, name: &str, arg_types: &[VType]) -> Result<FnDef, EmitError> {
        match self.registry.resolve(name, arg_types) {
            Some(def) => Ok(def.clone()),
            None => err(format!(
                "no function `{}` for argument types ({})",
                name,
                arg_types
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
        }
    }

    /// Element type produced by an aggregable expression.
    fn agg_elem_type_of(&self, ir: &Ir, env: &Env) -> Result<VType, EmitError> {
        match ir {
            Ir::AggIn => match &self.agg_elem {
                Some((t, _, _)) => Ok(t.clone()),
                None => err("aggregable outside an aggregation context"),
            },
            Ir::AggMap { a, name, body } => {
                let inner = self.agg_elem_type_of(a, env)?;
                let env2 = env.bind(
                    name,
                    Binding {
                        typ: inner,
                        v: 0,
                        m: 0,
                    },
                );
                self.infer(body, &env2)
            }
            Ir::AggFilter { a, .. } => self.agg_elem_type_of(a, env),
            Ir::AggFlatMap { a, name, body } => {
                let inner = self.agg_elem_type_of(a, env)?;
                let env2 = env.bind(
                    name,
                    Binding {
                        typ: inner,
                        v: 0,
                        m: 0,
                    },
                );
                let bt = self.infer(body, &env2)?;
                array_elem(&bt)
            }
            other => err(format!("not an aggregable expression: {:?}", other)),
        }
    }

    // ------------------------------------------------------------------
    // emission
    // ------------------------------------------------------------------

    fn emit(&mut self, ir: &Ir, env: &Env) -> Result<(EmitTriplet, VType), EmitError> {
        match ir {
            Ir::NA(_) => {
                let typ = self.infer(ir, env)?;
                let (v, m) = self.pair();
                let setup = vec![Instr::ConstI64 { dst: m, v: 1 }, Instr::ConstI64 { dst: v, v: 0 }];
                Ok((EmitTriplet { setup, m, v }, typ))
            }
            Ir::I32(x) => self.emit_const(Instr::ConstI64 { dst: 0, v: *x as i64 }, VType::int32().required()),
            Ir::I64(x) => self.emit_const(Instr::ConstI64 { dst: 0, v: *x }, VType::int64().required()),
            Ir::F32(x) => self.emit_const(Instr::ConstF32 { dst: 0, v: *x }, VType::float32().required()),
            Ir::F64(x) => self.emit_const(Instr::ConstF64 { dst: 0, v: *x }, VType::float64().required()),
            Ir::Bool(x) => self.emit_const(Instr::ConstI64 { dst: 0, v: *x as i64 }, VType::bool().required()),
            Ir::Str(s) => {
                let idx = self.intern_string(s);
                self.emit_const(Instr::ConstStr { dst: 0, s: idx }, VType::str().required())
            }
            Ir::IsNa(inner) => {
                let (t, _) = self.emit(inner, env)?;
                let (v, m) = self.pair();
                let mut setup = t.setup;
                setup.push(Instr::Copy { dst: v, src: t.m });
                setup.push(Instr::ConstI64 { dst: m, v: 0 });
                Ok((EmitTriplet { setup, m, v }, VType::bool().required()))
            }
            Ir::If { cond, cnsq, altr } => {
                let (ct, ctyp) = self.emit(cond, env)?;
                if !matches!(ctyp.kind, Kind::Bool) {
                    return err(format!("If condition must be Bool, got {}", ctyp));
                }
                let (lt, ltyp) = self.emit(cnsq, env)?;
                let (rt, rtyp) = self.emit(altr, env)?;
                let typ = promote(&ltyp, &rtyp)?;
                let (v, m) = self.pair();

                let mut then_blk = lt.setup;
                let lv = self.cast_to(&mut then_blk, &ltyp, &typ, lt.v)?;
                then_blk.push(Instr::Copy { dst: m, src: lt.m });
                then_blk.push(Instr::Copy { dst: v, src: lv });

                let mut else_blk = rt.setup;
                let rv = self.cast_to(&mut else_blk, &rtyp, &typ, rt.v)?;
                else_blk.push(Instr::Copy { dst: m, src: rt.m });
                else_blk.push(Instr::Copy { dst: v, src: rv });

                let mut setup = ct.setup;
                setup.push(Instr::If {
                    cond: ct.m,
                    then_blk: vec![
                        Instr::ConstI64 { dst: m, v: 1 },
                        Instr::ConstI64 { dst: v, v: 0 },
                    ],
                    else_blk: vec![Instr::If {
                        cond: ct.v,
                        then_blk,
                        else_blk,
                    }],
                });
                Ok((EmitTriplet { setup, m, v }, typ))
            }
            Ir::Let { name, value, body } => {
                let (vt, vtyp) = self.emit(value, env)?;
                let env2 = env.bind(
                    name,
                    Binding {
                        typ: vtyp,
                        v: vt.v,
                        m: vt.m,
                    },
                );
                let (bt, btyp) = self.emit(body, &env2)?;
                let mut setup = vt.setup;
                setup.extend(bt.setup);
                Ok((
                    EmitTriplet {
                        setup,
                        m: bt.m,
                        v: bt.v,
                    },
                    btyp,
                ))
            }
            Ir::MapNa { name, value, body } => {
                let (vt, mut vtyp) = self.emit(value, env)?;
                vtyp.required = true;
                let typ = {
                    let mut t = self.infer(ir, env)?;
                    t.required = false;
                    t
                };
                let (v, m) = self.pair();
                let mut setup = vt.setup;

                let mut else_blk = Vec::new();
                let cf = self.const_bool(&mut else_blk, false);
                let env2 = env.bind(
                    name,
                    Binding {
                        typ: vtyp,
                        v: vt.v,
                        m: cf,
                    },
                );
                let (bt, _) = self.emit(body, &env2)?;
                else_blk.extend(bt.setup);
                else_blk.push(Instr::Copy { dst: m, src: bt.m });
                else_blk.push(Instr::Copy { dst: v, src: bt.v });

                setup.push(Instr::If {
                    cond: vt.m,
                    then_blk: vec![
                        Instr::ConstI64 { dst: m, v: 1 },
                        Instr::ConstI64 { dst: v, v: 0 },
                    ],
                    else_blk,
                });
                Ok((EmitTriplet { setup, m, v }, typ))
            }
            Ir::Ref(name) => match env.get(name) {
                Some(b) => Ok((
                    EmitTriplet {
                        setup: Vec::new(),
                        m: b.m,
                        v: b.v,
                    },
                    b.typ.clone(),
                )),
                None => err(format!("symbol `{}` not found", name)),
            },
            Ir::In(i) => {
                if self.agg_elem.is_some() {
                    return err("In is not allowed inside an aggregator");
                }
                let typ = match self.input_types.get(*i) {
                    Some(t) => t.clone(),
                    None => return err(format!("input {} out of range", i)),
                };
                let v = self.arg_base + 2 * *i as Slot;
                let m = v + 1;
                Ok((
                    EmitTriplet {
                        setup: Vec::new(),
                        m,
                        v,
                    },
                    typ,
                ))
            }
            Ir::Cast { value, typ: to } => {
                let (t, vtyp) = self.emit(value, env)?;
                let out_typ = VType::new(to.kind.clone(), vtyp.required);
                let mut setup = t.setup;
                let casted = self.cast_to(&mut setup, &vtyp, &out_typ, t.v)?;
                Ok((
                    EmitTriplet {
                        setup,
                        m: t.m,
                        v: casted,
                    },
                    out_typ,
                ))
            }
            Ir::ApplyBinOp { op, l, r } => self.emit_binop(*op, l, r, env),
            Ir::ApplyUnOp { op, v } => {
                let (t, vtyp) = self.emit(v, env)?;
                let (dst, m) = self.pair();
                let mut setup = t.setup;
                setup.push(Instr::Copy { dst: m, src: t.m });
                match op {
                    UnOp::Negate => {
                        let Some(kind) = num_kind(&vtyp) else {
                            return err(format!("cannot negate {}", vtyp));
                        };
                        setup.push(Instr::If {
                            cond: m,
                            then_blk: vec![Instr::ConstI64 { dst, v: 0 }],
                            else_blk: vec![Instr::Neg {
                                kind,
                                dst,
                                src: t.v,
                            }],
                        });
                        Ok((EmitTriplet { setup, m, v: dst }, vtyp))
                    }
                    UnOp::Bang => {
                        if !matches!(vtyp.kind, Kind::Bool) {
                            return err(format!("cannot negate non-Bool {}", vtyp));
                        }
                        setup.push(Instr::If {
                            cond: m,
                            then_blk: vec![Instr::ConstI64 { dst, v: 0 }],
                            else_blk: vec![Instr::Not { dst, src: t.v }],
                        });
                        Ok((
                            EmitTriplet { setup, m, v: dst },
                            VType::new(Kind::Bool, vtyp.required),
                        ))
                    }
                }
            }
            Ir::MakeArray { elem, args } => {
                let typ = VType::array_of(elem.clone()).required();
                let mut setup = Vec::new();
                let mut triplets = Vec::with_capacity(args.len());
                for arg in args {
                    let (mut t, at) = self.emit(arg, env)?;
                    if !same_kind(&at, elem) {
                        return err(format!("array element {} does not fit {}", at, elem));
                    }
                    setup.append(&mut t.setup);
                    triplets.push(t);
                }
                let (v, m) = self.pair();
                setup.push(Instr::ConstI64 { dst: m, v: 0 });
                let len = self.slot();
                setup.push(Instr::ConstI64 {
                    dst: len,
                    v: args.len() as i64,
                });
                let t_idx = self.intern_type(&typ);
                setup.push(Instr::BldStart { typ: t_idx });
                setup.push(Instr::BldStartArray { len });
                for t in &triplets {
                    let mut add_blk = Vec::new();
                    self.bld_add(&mut add_blk, elem, t.v);
                    setup.push(Instr::If {
                        cond: t.m,
                        then_blk: vec![Instr::BldSetMissing],
                        else_blk: add_blk,
                    });
                    setup.push(Instr::BldAdvance);
                }
                setup.push(Instr::BldEndArray);
                setup.push(Instr::BldEnd { dst: v });
                Ok((EmitTriplet { setup, m, v }, typ))
            }
            Ir::ArrayRef { a, i } => self.emit_array_ref(a, i, env),
            Ir::ArrayLen(a) => {
                let (t, atyp) = self.emit(a, env)?;
                array_elem(&atyp)?;
                let (v, m) = self.pair();
                let mut setup = t.setup;
                setup.push(Instr::Copy { dst: m, src: t.m });
                setup.push(Instr::If {
                    cond: m,
                    then_blk: vec![Instr::ConstI64 { dst: v, v: 0 }],
                    else_blk: vec![Instr::LoadLength { dst: v, arr: t.v }],
                });
                Ok((
                    EmitTriplet { setup, m, v },
                    VType::new(Kind::Int32, atyp.required),
                ))
            }
            Ir::ArrayRange { .. }
            | Ir::ArrayMap { .. }
            | Ir::ArrayFilter { .. }
            | Ir::ArrayFlatMap { .. } => self.emit_array_value(ir, env),
            Ir::ArrayFold {
                a,
                zero,
                acc_name,
                value_name,
                body,
            } => self.emit_fold(a, zero, acc_name, value_name, body, env),
            Ir::MakeStruct(fields) => {
                let mut field_types = Vec::with_capacity(fields.len());
                let mut setup = Vec::new();
                let mut triplets = Vec::with_capacity(fields.len());
                for (name, f) in fields {
                    let (t, ft) = self.emit(f, env)?;
                    setup.extend(t.setup.iter().cloned());
                    triplets.push((t, ft.clone()));
                    field_types.push(Field {
                        name: name.clone(),
                        typ: ft,
                    });
                }
                let typ = VType::new(Kind::Struct(field_types), true);
                let (v, m) = self.pair();
                setup.push(Instr::ConstI64 { dst: m, v: 0 });
                let t_idx = self.intern_type(&typ);
                setup.push(Instr::BldStart { typ: t_idx });
                setup.push(Instr::BldStartStruct);
                for (t, ft) in &triplets {
                    let mut add_blk = Vec::new();
                    self.bld_add(&mut add_blk, ft, t.v);
                    setup.push(Instr::If {
                        cond: t.m,
                        then_blk: vec![Instr::BldSetMissing],
                        else_blk: add_blk,
                    });
                    setup.push(Instr::BldAdvance);
                }
                setup.push(Instr::BldEndStruct);
                setup.push(Instr::BldEnd { dst: v });
                Ok((EmitTriplet { setup, m, v }, typ))
            }
            Ir::MakeTuple(items) => {
                let named: Vec<(String, Ir)> = items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| (i.to_string(), item.clone()))
                    .collect();
                let (t, styp) = self.emit(&Ir::MakeStruct(named), env)?;
                let types = match styp.kind {
                    Kind::Struct(fields) => fields.into_iter().map(|f| f.typ).collect(),
                    _ => unreachable!("MakeStruct emits a struct"),
                };
                Ok((t, VType::new(Kind::Tuple(types), true)))
            }
            Ir::InsertFields { old, fields } => self.emit_insert_fields(old, fields, env),
            Ir::GetField { o, name } => {
                let (t, otyp) = self.emit(o, env)?;
                let struct_fields = otyp
                    .struct_fields()
                    .ok_or_else(|| EmitError(format!("GetField on non-struct {}", otyp)))?;
                let idx = struct_fields
                    .iter()
                    .position(|f| f.name == *name)
                    .ok_or_else(|| EmitError(format!("struct has no field `{}`", name)))?;
                self.emit_field_access(t, &otyp, &struct_fields, idx)
            }
            Ir::GetTupleElement { o, idx } => {
                let (t, otyp) = self.emit(o, env)?;
                if !matches!(otyp.kind, Kind::Tuple(_)) {
                    return err(format!("GetTupleElement on {}", otyp));
                }
                let struct_fields = otyp.struct_fields().expect("tuple is struct-like");
                if *idx >= struct_fields.len() {
                    return err(format!("tuple has no element {}", idx));
                }
                self.emit_field_access(t, &otyp, &struct_fields, *idx)
            }
            Ir::AggIn | Ir::AggMap { .. } | Ir::AggFilter { .. } | Ir::AggFlatMap { .. } => {
                err("an aggregable is not a value; apply an aggregator op")
            }
            Ir::ApplyAggOp { .. } => {
                err("aggregation is not supported in this context; use compile_with_aggregators")
            }
            Ir::Apply { function, args } => self.emit_apply(function, args, env),
        }
    }

    fn emit_const(&mut self, template: Instr, typ: VType) -> Result<(EmitTriplet, VType), EmitError> {
        let (v, m) = self.pair();
        let instr = match template {
            Instr::ConstI64 { v: x, .. } => Instr::ConstI64 { dst: v, v: x },
            Instr::ConstF32 { v: x, .. } => Instr::ConstF32 { dst: v, v: x },
            Instr::ConstF64 { v: x, .. } => Instr::ConstF64 { dst: v, v: x },
            Instr::ConstStr { s, .. } => Instr::ConstStr { dst: v, s },
            other => panic!("not a constant instruction: {:?}", other),
        };
        let setup = vec![instr, Instr::ConstI64 { dst: m, v: 0 }];
        Ok((EmitTriplet { setup, m, v }, typ))
    }

    fn emit_binop(
        &mut self,
        op: BinOp,
        l: &Ir,
        r: &Ir,
        env: &Env,
    ) -> Result<(EmitTriplet, VType), EmitError> {
        let (lt, ltyp) = self.emit(l, env)?;
        let (rt, rtyp) = self.emit(r, env)?;
        let required = ltyp.required && rtyp.required;
        let mut setup = lt.setup;
        setup.extend(rt.setup);
        let m = self.or_missing(&mut setup, lt.m, rt.m);
        let v = self.slot();

        let mut compute = Vec::new();
        let typ = match op {
            BinOp::And | BinOp::Or => {
                if !matches!(ltyp.kind, Kind::Bool) || !matches!(rtyp.kind, Kind::Bool) {
                    return err(format!("{:?} requires Bool operands", op));
                }
                let (then_blk, else_blk) = if matches!(op, BinOp::And) {
                    (
                        vec![Instr::Copy { dst: v, src: rt.v }],
                        vec![Instr::ConstI64 { dst: v, v: 0 }],
                    )
                } else {
                    (
                        vec![Instr::ConstI64 { dst: v, v: 1 }],
                        vec![Instr::Copy { dst: v, src: rt.v }],
                    )
                };
                compute.push(Instr::If {
                    cond: lt.v,
                    then_blk,
                    else_blk,
                });
                VType::new(Kind::Bool, required)
            }
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                let kind = if matches!(ltyp.kind, Kind::Bool) && matches!(rtyp.kind, Kind::Bool) {
                    if !matches!(op, BinOp::Eq | BinOp::Ne) {
                        return err("Bool supports only == and !=");
                    }
                    NumKind::I64
                } else {
                    let wide = promote(&ltyp, &rtyp)?;
                    num_kind(&wide).ok_or_else(|| {
                        EmitError(format!("cannot compare {} and {}", ltyp, rtyp))
                    })?
                };
                let (lv, rv) = if kind == NumKind::I64 && matches!(ltyp.kind, Kind::Bool) {
                    (lt.v, rt.v)
                } else {
                    let wide = promote(&ltyp, &rtyp)?;
                    (
                        self.cast_to(&mut compute, &ltyp, &wide, lt.v)?,
                        self.cast_to(&mut compute, &rtyp, &wide, rt.v)?,
                    )
                };
                compute.push(Instr::Cmp {
                    op: cmp_of(op),
                    kind,
                    dst: v,
                    l: lv,
                    r: rv,
                });
                VType::new(Kind::Bool, required)
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::FloorDiv | BinOp::Mod => {
                let wide = promote(&ltyp, &rtyp)?;
                let kind = num_kind(&wide)
                    .ok_or_else(|| EmitError(format!("cannot apply {:?} to {}", op, wide)))?;
                let lv = self.cast_to(&mut compute, &ltyp, &wide, lt.v)?;
                let rv = self.cast_to(&mut compute, &rtyp, &wide, rt.v)?;
                compute.push(Instr::Arith {
                    op: arith_of(op),
                    kind,
                    dst: v,
                    l: lv,
                    r: rv,
                });
                VType::new(wide.kind, required)
            }
        };
        setup.push(Instr::If {
            cond: m,
            then_blk: vec![Instr::ConstI64 { dst: v, v: 0 }],
            else_blk: compute,
        });
        Ok((EmitTriplet { setup, m, v }, typ))
    }

    fn emit_array_ref(
        &mut self,
        a: &Ir,
        i: &Ir,
        env: &Env,
    ) -> Result<(EmitTriplet, VType), EmitError> {
        let (at, atyp) = self.emit(a, env)?;
        let (it, ityp) = self.emit(i, env)?;
        if !matches!(ityp.kind, Kind::Int32) {
            return err(format!("array index must be Int32, got {}", ityp));
        }
        let mut elem = array_elem(&atyp)?;
        elem.required = false;
        let layout = atyp.array_layout();

        let mut setup = at.setup;
        setup.extend(it.setup);
        let both = self.or_missing(&mut setup, at.m, it.m);
        let (v, m) = self.pair();
        setup.push(Instr::Copy { dst: m, src: both });

        let len = self.slot();
        let zero = self.slot();
        let ge = self.slot();
        let lt = self.slot();
        let inb = self.slot();
        let msg = self.intern_string("array index {} out of bounds ({} elements)");

        // in-bounds, defined element: load
        let mut load_blk = Vec::new();
        load_blk.push(Instr::LoadElement {
            stride: layout.elem_stride,
            align: layout.elem_align,
            has_bits: !layout.elem_required,
            pointer: layout.elem_pointer,
            dst: v,
            arr: at.v,
            len,
            idx: it.v,
        });
        self.load_typed(&mut load_blk, &elem, v);

        let mut elem_blk = Vec::new();
        if layout.elem_required {
            elem_blk.extend(load_blk);
        } else {
            let em = self.slot();
            elem_blk.push(Instr::ElementMissing {
                dst: em,
                arr: at.v,
                idx: it.v,
            });
            elem_blk.push(Instr::If {
                cond: em,
                then_blk: vec![
                    Instr::ConstI64 { dst: m, v: 1 },
                    Instr::ConstI64 { dst: v, v: 0 },
                ],
                else_blk: load_blk,
            });
        }

        let defined_blk = vec![
            Instr::LoadLength { dst: len, arr: at.v },
            Instr::ConstI64 { dst: zero, v: 0 },
            Instr::Cmp {
                op: CmpOp::Ge,
                kind: NumKind::I64,
                dst: ge,
                l: it.v,
                r: zero,
            },
            Instr::Cmp {
                op: CmpOp::Lt,
                kind: NumKind::I64,
                dst: lt,
                l: it.v,
                r: len,
            },
            Instr::If {
                cond: ge,
                then_blk: vec![Instr::Copy { dst: inb, src: lt }],
                else_blk: vec![Instr::ConstI64 { dst: inb, v: 0 }],
            },
            Instr::If {
                cond: inb,
                then_blk: elem_blk,
                else_blk: vec![Instr::Fatal {
                    msg,
                    args: vec![it.v, len],
                }],
            },
        ];

        setup.push(Instr::If {
            cond: both,
            then_blk: vec![Instr::ConstI64 { dst: v, v: 0 }],
            else_blk: defined_blk,
        });
        Ok((EmitTriplet { setup, m, v }, elem))
    }

    fn emit_field_access(
        &mut self,
        t: EmitTriplet,
        otyp: &VType,
        fields: &[Field],
        idx: usize,
    ) -> Result<(EmitTriplet, VType), EmitError> {
        let layout = otyp.struct_layout();
        let ftyp = &fields[idx].typ;
        let mut out_typ = ftyp.clone();
        out_typ.required = out_typ.required && otyp.required;

        let (v, m) = self.pair();
        let mut setup = t.setup;

        let mut load_blk = vec![Instr::LoadField {
            off: layout.field_offsets[idx],
            pointer: layout.field_pointer[idx],
            dst: v,
            obj: t.v,
        }];
        self.load_typed(&mut load_blk, ftyp, v);

        let defined_blk = match layout.missing_bits[idx] {
            None => {
                let mut blk = vec![Instr::ConstI64 { dst: m, v: 0 }];
                blk.extend(load_blk);
                blk
            }
            Some(bit) => vec![
                Instr::FieldMissing {
                    bit,
                    dst: m,
                    obj: t.v,
                },
                Instr::If {
                    cond: m,
                    then_blk: vec![Instr::ConstI64 { dst: v, v: 0 }],
                    else_blk: load_blk,
                },
            ],
        };

        setup.push(Instr::If {
            cond: t.m,
            then_blk: vec![
                Instr::ConstI64 { dst: m, v: 1 },
                Instr::ConstI64 { dst: v, v: 0 },
            ],
            else_blk: defined_blk,
        });
        Ok((EmitTriplet { setup, m, v }, out_typ))
    }

    fn emit_insert_fields(
        &mut self,
        old: &Ir,
        fields: &[(String, Ir)],
        env: &Env,
    ) -> Result<(EmitTriplet, VType), EmitError> {
        let (ot, otyp) = self.emit(old, env)?;
        let old_fields = match &otyp.kind {
            Kind::Struct(fs) => fs.clone(),
            other => return err(format!("InsertFields on non-struct {:?}", other)),
        };
        let old_layout = otyp.struct_layout();

        let mut setup = Vec::new();
        setup.extend(ot.setup.iter().cloned());
        let mut new_triplets: HashMap<&str, (EmitTriplet, VType)> = HashMap::new();
        let mut order: Vec<&str> = old_fields.iter().map(|f| f.name.as_str()).collect();
        for (name, f) in fields {
            let (t, ft) = self.emit(f, env)?;
            setup.extend(t.setup.iter().cloned());
            if !order.contains(&name.as_str()) {
                order.push(name.as_str());
            }
            new_triplets.insert(name.as_str(), (t, ft));
        }

        let mut result_fields = Vec::with_capacity(order.len());
        for name in &order {
            let typ = match new_triplets.get(*name) {
                Some((_, ft)) => ft.clone(),
                None => {
                    old_fields
                        .iter()
                        .find(|f| f.name == **name)
                        .expect("kept field exists")
                        .typ
                        .clone()
                }
            };
            result_fields.push(Field {
                name: name.to_string(),
                typ,
            });
        }
        let typ = VType::new(Kind::Struct(result_fields.clone()), otyp.required);

        let (v, m) = self.pair();
        setup.push(Instr::Copy { dst: m, src: ot.m });

        let mut build_blk = Vec::new();
        let t_idx = self.intern_type(&typ);
        build_blk.push(Instr::BldStart { typ: t_idx });
        build_blk.push(Instr::BldStartStruct);
        for (i, name) in order.iter().enumerate() {
            let ftyp = &result_fields[i].typ;
            match new_triplets.get(*name) {
                Some((t, ft)) => {
                    let mut add_blk = Vec::new();
                    self.bld_add(&mut add_blk, ft, t.v);
                    build_blk.push(Instr::If {
                        cond: t.m,
                        then_blk: vec![Instr::BldSetMissing],
                        else_blk: add_blk,
                    });
                }
                None => {
                    let old_idx = old_fields
                        .iter()
                        .position(|f| f.name == **name)
                        .expect("kept field exists");
                    let addr = self.slot();
                    let mut copy_blk = vec![Instr::LoadField {
                        off: old_layout.field_offsets[old_idx],
                        pointer: old_layout.field_pointer[old_idx],
                        dst: addr,
                        obj: ot.v,
                    }];
                    self.load_typed(&mut copy_blk, ftyp, addr);
                    self.bld_add(&mut copy_blk, ftyp, addr);
                    match old_layout.missing_bits[old_idx] {
                        None => build_blk.extend(copy_blk),
                        Some(bit) => {
                            let fm = self.slot();
                            build_blk.push(Instr::FieldMissing {
                                bit,
                                dst: fm,
                                obj: ot.v,
                            });
                            build_blk.push(Instr::If {
                                cond: fm,
                                then_blk: vec![Instr::BldSetMissing],
                                else_blk: copy_blk,
                            });
                        }
                    }
                }
            }
            build_blk.push(Instr::BldAdvance);
        }
        build_blk.push(Instr::BldEndStruct);
        build_blk.push(Instr::BldEnd { dst: v });

        setup.push(Instr::If {
            cond: ot.m,
            then_blk: vec![Instr::ConstI64 { dst: v, v: 0 }],
            else_blk: build_blk,
        });
        Ok((EmitTriplet { setup, m, v }, typ))
    }

    fn emit_apply(
        &mut self,
        function: &str,
        args: &[Ir],
        env: &Env,
    ) -> Result<(EmitTriplet, VType), EmitError> {
        if self.agg_elem.is_some() {
            return err("Apply is not allowed inside an aggregator");
        }
        let mut setup = Vec::new();
        let mut arg_slots = Vec::with_capacity(args.len());
        let mut arg_types = Vec::with_capacity(args.len());
        for arg in args {
            let (t, at) = self.emit(arg, env)?;
            setup.extend(t.setup.iter().cloned());
            arg_slots.push((t.v, t.m));
            arg_types.push(at);
        }
        let key = (
            function.to_string(),
            arg_types.iter().map(strip_required).collect::<Vec<_>>(),
        );
        let sub_idx = match self.sub_memo.get(&key) {
            Some(&idx) => idx,
            None => {
                let def = self.resolve(function, &arg_types)?;
                let sub = compile_fn_body(&def, &arg_types, self.registry.clone())?;
                let idx = self.subs.len();
                self.subs.push(Arc::new(sub));
                self.sub_memo.insert(key, idx);
                idx
            }
        };
        let typ = self.subs[sub_idx].typ.clone();
        let (v, m) = self.pair();
        setup.push(Instr::CallSub {
            sub: sub_idx,
            args: arg_slots,
            dst_v: v,
            dst_m: m,
        });
        Ok((EmitTriplet { setup, m, v }, typ))
    }

    // ------------------------------------------------------------------
    // array iterator triplets
    // ------------------------------------------------------------------

    fn emit_array_iter<'ir>(
        &mut self,
        ir: &'ir Ir,
        env: &Env,
    ) -> Result<ArrayIter<'ir>, EmitError> {
        match ir {
            Ir::ArrayRange { start, stop, step } => {
                let (st, stt) = self.emit(start, env)?;
                let (et, ett) = self.emit(stop, env)?;
                let (pt, ptt) = self.emit(step, env)?;
                for t in [&stt, &ett, &ptt] {
                    if !matches!(t.kind, Kind::Int32) {
                        return err(format!("range bounds must be Int32, got {}", t));
                    }
                }
                let mut setup = st.setup;
                setup.extend(et.setup);
                setup.extend(pt.setup);
                let m01 = self.or_missing(&mut setup, st.m, et.m);
                let m = self.or_missing(&mut setup, m01, pt.m);
                let len = self.slot();
                setup.push(Instr::If {
                    cond: m,
                    then_blk: vec![Instr::ConstI64 { dst: len, v: 0 }],
                    else_blk: vec![Instr::RangeLen {
                        dst: len,
                        start: st.v,
                        stop: et.v,
                        step: pt.v,
                    }],
                });
                let (sv, pv) = (st.v, pt.v);
                let r#gen: GenFn<'ir> = Box::new(move |em, cont| {
                    let mut blk = Vec::new();
                    let cf = em.const_bool(&mut blk, false);
                    let i = em.slot();
                    let one = em.slot();
                    let done = em.slot();
                    let tmp = em.slot();
                    let ev = em.slot();
                    blk.push(Instr::ConstI64 { dst: i, v: 0 });
                    blk.push(Instr::ConstI64 { dst: one, v: 1 });
                    let mut body = vec![
                        Instr::Cmp {
                            op: CmpOp::Ge,
                            kind: NumKind::I64,
                            dst: done,
                            l: i,
                            r: len,
                        },
                        Instr::If {
                            cond: done,
                            then_blk: vec![Instr::Break],
                            else_blk: vec![],
                        },
                        Instr::Arith {
                            op: ArithOp::Mul,
                            kind: NumKind::I32,
                            dst: tmp,
                            l: i,
                            r: pv,
                        },
                        Instr::Arith {
                            op: ArithOp::Add,
                            kind: NumKind::I32,
                            dst: ev,
                            l: sv,
                            r: tmp,
                        },
                    ];
                    body.extend(cont(em, cf, ev)?);
                    body.push(Instr::Arith {
                        op: ArithOp::Add,
                        kind: NumKind::I64,
                        dst: i,
                        l: i,
                        r: one,
                    });
                    blk.push(Instr::Loop { body });
                    Ok(blk)
                });
                Ok(ArrayIter {
                    setup,
                    m,
                    known_len: Some(len),
                    elem: VType::int32().required(),
                    r#gen,
                })
            }
            Ir::ArrayMap { a, name, body } => {
                let inner = self.emit_array_iter(a, env)?;
                let elem_in = inner.elem.clone();
                let env2 = env.clone();
                let elem_out = {
                    let benv = env2.bind(
                        name,
                        Binding {
                            typ: elem_in.clone(),
                            v: 0,
                            m: 0,
                        },
                    );
                    self.infer(body, &benv)?
                };
                let name: &'ir str = name;
                let body: &'ir Ir = body;
                let inner_gen = inner.r#gen;
                let r#gen: GenFn<'ir> = Box::new(move |em, cont| {
                    inner_gen(em, &mut |em, m_e, v_e| {
                        let env3 = env2.bind(
                            name,
                            Binding {
                                typ: elem_in.clone(),
                                v: v_e,
                                m: m_e,
                            },
                        );
                        let (bt, _) = em.emit(body, &env3)?;
                        let mut blk = bt.setup;
                        blk.extend(cont(em, bt.m, bt.v)?);
                        Ok(blk)
                    })
                });
                Ok(ArrayIter {
                    setup: inner.setup,
                    m: inner.m,
                    known_len: inner.known_len,
                    elem: elem_out,
                    r#gen,
                })
            }
            Ir::ArrayFilter { a, name, body } => {
                let inner = self.emit_array_iter(a, env)?;
                let elem = inner.elem.clone();
                let env2 = env.clone();
                let name: &'ir str = name;
                let body: &'ir Ir = body;
                let elem_c = elem.clone();
                let inner_gen = inner.r#gen;
                let r#gen: GenFn<'ir> = Box::new(move |em, cont| {
                    inner_gen(em, &mut |em, m_e, v_e| {
                        let env3 = env2.bind(
                            name,
                            Binding {
                                typ: elem_c.clone(),
                                v: v_e,
                                m: m_e,
                            },
                        );
                        let (pt, ptyp) = em.emit(body, &env3)?;
                        if !matches!(ptyp.kind, Kind::Bool) {
                            return err(format!("filter predicate must be Bool, got {}", ptyp));
                        }
                        let mut blk = pt.setup;
                        let keep = em.slot();
                        blk.push(Instr::If {
                            cond: pt.m,
                            then_blk: vec![Instr::ConstI64 { dst: keep, v: 0 }],
                            else_blk: vec![Instr::Copy {
                                dst: keep,
                                src: pt.v,
                            }],
                        });
                        let kept = cont(em, m_e, v_e)?;
                        blk.push(Instr::If {
                            cond: keep,
                            then_blk: kept,
                            else_blk: vec![],
                        });
                        Ok(blk)
                    })
                });
                Ok(ArrayIter {
                    setup: inner.setup,
                    m: inner.m,
                    known_len: None,
                    elem,
                    r#gen,
                })
            }
            Ir::ArrayFlatMap { a, name, body } => {
                let inner = self.emit_array_iter(a, env)?;
                let elem_in = inner.elem.clone();
                let env2 = env.clone();
                let out_elem = {
                    let benv = env2.bind(
                        name,
                        Binding {
                            typ: elem_in.clone(),
                            v: 0,
                            m: 0,
                        },
                    );
                    let bt = self.infer(body, &benv)?;
                    array_elem(&bt)?
                };
                let name: &'ir str = name;
                let body: &'ir Ir = body;
                let inner_gen = inner.r#gen;
                let r#gen: GenFn<'ir> = Box::new(move |em, cont| {
                    inner_gen(em, &mut |em, m_e, v_e| {
                        let env3 = env2.bind(
                            name,
                            Binding {
                                typ: elem_in.clone(),
                                v: v_e,
                                m: m_e,
                            },
                        );
                        let (bt, btyp) = em.emit(body, &env3)?;
                        let mut blk = bt.setup;
                        let walk = em.emit_elem_loop(&btyp, bt.v, cont)?;
                        blk.push(Instr::If {
                            cond: bt.m,
                            then_blk: vec![],
                            else_blk: walk,
                        });
                        Ok(blk)
                    })
                });
                Ok(ArrayIter {
                    setup: inner.setup,
                    m: inner.m,
                    known_len: None,
                    elem: out_elem,
                    r#gen,
                })
            }
            // any other array-typed expression: evaluate it, then walk
            other => {
                let (t, atyp) = self.emit(other, env)?;
                let elem = array_elem(&atyp)?;
                let len = self.slot();
                let mut setup = t.setup;
                setup.push(Instr::If {
                    cond: t.m,
                    then_blk: vec![Instr::ConstI64 { dst: len, v: 0 }],
                    else_blk: vec![Instr::LoadLength { dst: len, arr: t.v }],
                });
                let arr = t.v;
                let atyp_c = atyp.clone();
                let r#gen: GenFn<'ir> = Box::new(move |em, cont| {
                    em.emit_elem_loop_with_len(&atyp_c, arr, len, cont)
                });
                Ok(ArrayIter {
                    setup,
                    m: t.m,
                    known_len: Some(len),
                    elem,
                    r#gen,
                })
            }
        }
    }

    /// Loop over the elements of the defined array at slot `arr`
    /// (length loaded internally), driving `cont` once per element.
    fn emit_elem_loop(
        &mut self,
        arr_typ: &VType,
        arr: Slot,
        cont: &mut ContFn<'_>,
    ) -> Result<Vec<Instr>, EmitError> {
        let len = self.slot();
        let mut blk = vec![Instr::LoadLength { dst: len, arr }];
        blk.extend(self.emit_elem_loop_with_len(arr_typ, arr, len, cont)?);
        Ok(blk)
    }

    fn emit_elem_loop_with_len(
        &mut self,
        arr_typ: &VType,
        arr: Slot,
        len: Slot,
        cont: &mut ContFn<'_>,
    ) -> Result<Vec<Instr>, EmitError> {
        let elem = array_elem(arr_typ)?;
        let layout = arr_typ.array_layout();
        let mut blk = Vec::new();
        let i = self.slot();
        let one = self.slot();
        let done = self.slot();
        let em_s = self.slot();
        let ev = self.slot();
        blk.push(Instr::ConstI64 { dst: i, v: 0 });
        blk.push(Instr::ConstI64 { dst: one, v: 1 });

        let mut load_blk = vec![Instr::LoadElement {
            stride: layout.elem_stride,
            align: layout.elem_align,
            has_bits: !layout.elem_required,
            pointer: layout.elem_pointer,
            dst: ev,
            arr,
            len,
            idx: i,
        }];
        self.load_typed(&mut load_blk, &elem, ev);

        let mut body = vec![
            Instr::Cmp {
                op: CmpOp::Ge,
                kind: NumKind::I64,
                dst: done,
                l: i,
                r: len,
            },
            Instr::If {
                cond: done,
                then_blk: vec![Instr::Break],
                else_blk: vec![],
            },
        ];
        if layout.elem_required {
            body.push(Instr::ConstI64 { dst: em_s, v: 0 });
            body.extend(load_blk);
        } else {
            body.push(Instr::ElementMissing {
                dst: em_s,
                arr,
                idx: i,
            });
            body.push(Instr::If {
                cond: em_s,
                then_blk: vec![Instr::ConstI64 { dst: ev, v: 0 }],
                else_blk: load_blk,
            });
        }
        body.extend(cont(self, em_s, ev)?);
        body.push(Instr::Arith {
            op: ArithOp::Add,
            kind: NumKind::I64,
            dst: i,
            l: i,
            r: one,
        });
        blk.push(Instr::Loop { body });
        Ok(blk)
    }

    /// Materialize an array-producing node as an array value.
    fn emit_array_value(&mut self, ir: &Ir, env: &Env) -> Result<(EmitTriplet, VType), EmitError> {
        let typ = self.infer(ir, env)?;
        let iter = self.emit_array_iter(ir, env)?;
        let elem = iter.elem.clone();
        let arr_typ = VType::array_of(elem.clone()).required();
        let (v, m) = self.pair();
        let mut setup = iter.setup;
        setup.push(Instr::Copy { dst: m, src: iter.m });

        let build_blk = match iter.known_len {
            Some(len) => {
                let t_idx = self.intern_type(&arr_typ);
                let mut blk = vec![
                    Instr::BldStart { typ: t_idx },
                    Instr::BldStartArray { len },
                ];
                let elem_c = elem.clone();
                let push = (iter.r#gen)(self, &mut |em, m_e, v_e| {
                    let mut add_blk = Vec::new();
                    em.bld_add(&mut add_blk, &elem_c, v_e);
                    Ok(vec![
                        Instr::If {
                            cond: m_e,
                            then_blk: vec![Instr::BldSetMissing],
                            else_blk: add_blk,
                        },
                        Instr::BldAdvance,
                    ])
                })?;
                blk.extend(push);
                blk.push(Instr::BldEndArray);
                blk.push(Instr::BldEnd { dst: v });
                blk
            }
            None => {
                let b = self.buf();
                let t_idx = self.intern_type(&arr_typ);
                let mut blk = vec![Instr::BufNew { buf: b }];
                let push = (iter.r#gen)(self, &mut |_em, m_e, v_e| {
                    Ok(vec![Instr::BufPush {
                        buf: b,
                        v: v_e,
                        m: m_e,
                    }])
                })?;
                blk.extend(push);
                blk.push(Instr::BufWriteArray {
                    buf: b,
                    typ: t_idx,
                    dst: v,
                });
                blk
            }
        };
        setup.push(Instr::If {
            cond: m,
            then_blk: vec![Instr::ConstI64 { dst: v, v: 0 }],
            else_blk: build_blk,
        });
        Ok((EmitTriplet { setup, m, v }, typ))
    }

    fn emit_fold(
        &mut self,
        a: &Ir,
        zero: &Ir,
        acc_name: &str,
        value_name: &str,
        body: &Ir,
        env: &Env,
    ) -> Result<(EmitTriplet, VType), EmitError> {
        let iter = self.emit_array_iter(a, env)?;
        let elem = iter.elem.clone();
        let (zt, ztyp) = self.emit(zero, env)?;
        let typ = VType::new(ztyp.kind.clone(), false);

        let (acc_v, acc_m) = self.pair();
        let (v, m) = self.pair();
        let mut setup = iter.setup;
        setup.extend(zt.setup);
        setup.push(Instr::Copy {
            dst: acc_v,
            src: zt.v,
        });
        setup.push(Instr::Copy {
            dst: acc_m,
            src: zt.m,
        });

        let env2 = env.clone();
        let ztyp_c = ztyp.clone();
        let walk = (iter.r#gen)(self, &mut |em, m_e, v_e| {
            let env3 = env2
                .bind(
                    acc_name,
                    Binding {
                        typ: ztyp_c.clone(),
                        v: acc_v,
                        m: acc_m,
                    },
                )
                .bind(
                    value_name,
                    Binding {
                        typ: elem.clone(),
                        v: v_e,
                        m: m_e,
                    },
                );
            let (bt, btyp) = em.emit(body, &env3)?;
            if !same_kind(&btyp, &ztyp_c) {
                return err(format!("fold accumulator {} and body {} disagree", ztyp_c, btyp));
            }
            let mut blk = bt.setup;
            blk.push(Instr::Copy {
                dst: acc_v,
                src: bt.v,
            });
            blk.push(Instr::Copy {
                dst: acc_m,
                src: bt.m,
            });
            Ok(blk)
        })?;

        let mut defined_blk = walk;
        defined_blk.push(Instr::Copy { dst: m, src: acc_m });
        defined_blk.push(Instr::Copy { dst: v, src: acc_v });

        setup.push(Instr::If {
            cond: iter.m,
            then_blk: vec![
                Instr::ConstI64 { dst: m, v: 1 },
                Instr::ConstI64 { dst: v, v: 0 },
            ],
            else_blk: defined_blk,
        });
        Ok((EmitTriplet { setup, m, v }, typ))
    }

    // ------------------------------------------------------------------
    // aggregable emission
    // ------------------------------------------------------------------

    /// Compile an aggregable into a block that drives `cont` once per
    /// produced element.
    fn emit_agg(
        &mut self,
        ir: &Ir,
        env: &Env,
        cont: &mut ContFn<'_>,
    ) -> Result<Vec<Instr>, EmitError> {
        match ir {
            Ir::AggIn => {
                let (_, ev, em) = self
                    .agg_elem
                    .clone()
                    .ok_or_else(|| EmitError("AggIn outside an aggregation".to_string()))?;
                cont(self, em, ev)
            }
            Ir::AggMap { a, name, body } => {
                let elem_in = self.agg_elem_type_of(a, env)?;
                self.emit_agg(a, env, &mut |em, m_e, v_e| {
                    let env2 = env.bind(
                        name,
                        Binding {
                            typ: elem_in.clone(),
                            v: v_e,
                            m: m_e,
                        },
                    );
                    let (bt, _) = em.emit(body, &env2)?;
                    let mut blk = bt.setup;
                    blk.extend(cont(em, bt.m, bt.v)?);
                    Ok(blk)
                })
            }
            Ir::AggFilter { a, name, body } => {
                let elem_in = self.agg_elem_type_of(a, env)?;
                self.emit_agg(a, env, &mut |em, m_e, v_e| {
                    let env2 = env.bind(
                        name,
                        Binding {
                            typ: elem_in.clone(),
                            v: v_e,
                            m: m_e,
                        },
                    );
                    let (pt, ptyp) = em.emit(body, &env2)?;
                    if !matches!(ptyp.kind, Kind::Bool) {
                        return err(format!("filter predicate must be Bool, got {}", ptyp));
                    }
                    let mut blk = pt.setup;
                    let keep = em.slot();
                    blk.push(Instr::If {
                        cond: pt.m,
                        then_blk: vec![Instr::ConstI64 { dst: keep, v: 0 }],
                        else_blk: vec![Instr::Copy {
                            dst: keep,
                            src: pt.v,
                        }],
                    });
                    let kept = cont(em, m_e, v_e)?;
                    blk.push(Instr::If {
                        cond: keep,
                        then_blk: kept,
                        else_blk: vec![],
                    });
                    Ok(blk)
                })
            }
            Ir::AggFlatMap { a, name, body } => {
                let elem_in = self.agg_elem_type_of(a, env)?;
                self.emit_agg(a, env, &mut |em, m_e, v_e| {
                    let env2 = env.bind(
                        name,
                        Binding {
                            typ: elem_in.clone(),
                            v: v_e,
                            m: m_e,
                        },
                    );
                    let (bt, btyp) = em.emit(body, &env2)?;
                    let mut blk = bt.setup;
                    let walk = em.emit_elem_loop(&btyp, bt.v, cont)?;
                    blk.push(Instr::If {
                        cond: bt.m,
                        then_blk: vec![],
                        else_blk: walk,
                    });
                    Ok(blk)
                })
            }
            Ir::ApplyAggOp { .. } => err("nested aggregations are not allowed"),
            other => err(format!("not an aggregable expression: {:?}", other)),
        }
    }
}

// ----------------------------------------------------------------------
// helpers
// ----------------------------------------------------------------------

fn num_kind(t: &VType) -> Option<NumKind> {
    match t.kind {
        Kind::Int32 => Some(NumKind::I32),
        Kind::Int64 => Some(NumKind::I64),
        Kind::Float32 => Some(NumKind::F32),
        Kind::Float64 => Some(NumKind::F64),
        _ => None,
    }
}

/// Unify two operand/branch types: identical kinds pass through, numeric
/// kinds widen (Int32 < Int64 < Float32 < Float64).
fn promote(a: &VType, b: &VType) -> Result<VType, EmitError> {
    let required = a.required && b.required;
    if same_kind(a, b) {
        return Ok(VType::new(a.kind.clone(), required));
    }
    match (num_kind(a), num_kind(b)) {
        (Some(ka), Some(kb)) => {
            let kind = if rank(ka) >= rank(kb) { ka } else { kb };
            let out = match kind {
                NumKind::I32 => Kind::Int32,
                NumKind::I64 => Kind::Int64,
                NumKind::F32 => Kind::Float32,
                NumKind::F64 => Kind::Float64,
            };
            Ok(VType::new(out, required))
        }
        _ => err(format!("cannot unify types {} and {}", a, b)),
    }
}

fn rank(k: NumKind) -> u8 {
    match k {
        NumKind::I32 => 0,
        NumKind::I64 => 1,
        NumKind::F32 => 2,
        NumKind::F64 => 3,
    }
}

fn arith_of(op: BinOp) -> ArithOp {
    match op {
        BinOp::Add => ArithOp::Add,
        BinOp::Sub => ArithOp::Sub,
        BinOp::Mul => ArithOp::Mul,
        BinOp::Div => ArithOp::Div,
        BinOp::FloorDiv => ArithOp::FloorDiv,
        BinOp::Mod => ArithOp::Mod,
        other => panic!("not an arithmetic operator: {:?}", other),
    }
}

fn cmp_of(op: BinOp) -> CmpOp {
    match op {
        BinOp::Eq => CmpOp::Eq,
        BinOp::Ne => CmpOp::Ne,
        BinOp::Lt => CmpOp::Lt,
        BinOp::Le => CmpOp::Le,
        BinOp::Gt => CmpOp::Gt,
        BinOp::Ge => CmpOp::Ge,
        other => panic!("not a comparison operator: {:?}", other),
    }
}

fn array_elem(t: &VType) -> Result<VType, EmitError> {
    t.array_element()
        .ok_or_else(|| EmitError(format!("expected an array type, got {}", t)))
}

fn strip_required(t: &VType) -> VType {
    let kind = match &t.kind {
        Kind::Interval(p) => Kind::Interval(Box::new(strip_required(p))),
        Kind::Array(e) => Kind::Array(Box::new(strip_required(e))),
        Kind::Set(e) => Kind::Set(Box::new(strip_required(e))),
        Kind::Dict(k, v) => Kind::Dict(Box::new(strip_required(k)), Box::new(strip_required(v))),
        Kind::Struct(fs) => Kind::Struct(
            fs.iter()
                .map(|f| Field {
                    name: f.name.clone(),
                    typ: strip_required(&f.typ),
                })
                .collect(),
        ),
        Kind::Tuple(ts) => Kind::Tuple(ts.iter().map(strip_required).collect()),
        other => other.clone(),
    };
    VType::new(kind, false)
}

fn lit_annotation(ir: &Ir) -> Result<Annotation, EmitError> {
    match ir {
        Ir::I32(v) => Ok(Annotation::Int32(*v)),
        Ir::I64(v) => Ok(Annotation::Int64(*v)),
        Ir::F64(v) => Ok(Annotation::Float64(*v)),
        Ir::Bool(v) => Ok(Annotation::Bool(*v)),
        Ir::Str(s) => Ok(Annotation::Str(s.clone())),
        other => err(format!(
            "aggregator arguments must be literals, got {:?}",
            other
        )),
    }
}

fn compile_fn_body(
    def: &FnDef,
    arg_types: &[VType],
    registry: Arc<FunctionRegistry>,
) -> Result<CompiledFn, EmitError> {
    let mut em = Emitter::new(arg_types.to_vec(), registry, None);
    let mut env = Env::default();
    for (i, (param, typ)) in def.params.iter().zip(arg_types).enumerate() {
        env.vars.insert(
            param.clone(),
            Binding {
                typ: typ.clone(),
                v: 1 + 2 * i as Slot,
                m: 2 + 2 * i as Slot,
            },
        );
    }
    let (t, typ) = em.emit(&def.body, &env)?;
    Ok(em.finish(t, typ, false))
}

// ----------------------------------------------------------------------
// public entry points
// ----------------------------------------------------------------------

/// Compile an aggregation-free expression into a routine over the given
/// inputs.
pub fn compile(
    ir: &Ir,
    input_types: &[VType],
    registry: Arc<FunctionRegistry>,
) -> Result<CompiledFn, EmitError> {
    let mut em = Emitter::new(input_types.to_vec(), registry, None);
    let env = Env::default();
    let (t, typ) = em.emit(ir, &env)?;
    Ok(em.finish(t, typ, false))
}

/// Infer an expression's result type without keeping the emitted code.
pub fn infer_type(
    ir: &Ir,
    input_types: &[VType],
    registry: Arc<FunctionRegistry>,
) -> Result<VType, EmitError> {
    let em = Emitter::new(input_types.to_vec(), registry, None);
    em.infer(ir, &Env::default())
}

/// An aggregating expression split into its two routines.
pub struct AggCompilation {
    pub specs: Vec<AggSpec>,
    /// Per-element routine: argument 0 is the aggregable element, then
    /// scope pairs
    pub seq: CompiledFn,
    /// Post-combine routine: the original inputs followed by one extra
    /// input per aggregator result, in spec order
    pub result: CompiledFn,
}

/// Split an expression containing `ApplyAggOp` nodes into a seq routine
/// (run once per aggregable element) and a result routine (run after
/// combining partial states, with the aggregator results appended to the
/// inputs).
pub fn compile_with_aggregators(
    ir: &Ir,
    input_types: &[VType],
    elem_type: &VType,
    scope: &[(String, VType)],
    registry: Arc<FunctionRegistry>,
) -> Result<AggCompilation, EmitError> {
    let mut agg_nodes = Vec::new();
    collect_agg_ops(ir, &mut agg_nodes);
    if agg_nodes.is_empty() {
        return err("expression contains no aggregations");
    }

    // an emitter in seq mode types the aggregables and hosts their code;
    // argument 0 is the ambient element, scope pairs follow
    let mut seq_inputs = vec![elem_type.clone()];
    seq_inputs.extend(scope.iter().map(|(_, t)| t.clone()));
    let mut em = Emitter::new(seq_inputs, registry.clone(), Some(elem_type.clone()));
    let mut env = Env::default();
    for (i, (name, typ)) in scope.iter().enumerate() {
        env.vars.insert(
            name.clone(),
            Binding {
                typ: typ.clone(),
                v: 4 + 2 * i as Slot,
                m: 5 + 2 * i as Slot,
            },
        );
    }

    let mut specs = Vec::with_capacity(agg_nodes.len());
    for node in &agg_nodes {
        let Ir::ApplyAggOp { a, op, args } = node else {
            unreachable!("collect_agg_ops returns ApplyAggOp nodes");
        };
        let elem = em.agg_elem_type_of(a, &env)?;
        specs.push(AggSpec {
            op: *op,
            elem_typ: elem,
            args: args.iter().map(lit_annotation).collect::<Result<_, _>>()?,
        });
    }

    let mut body = Vec::new();
    for (idx, node) in agg_nodes.iter().enumerate() {
        let Ir::ApplyAggOp { a, .. } = node else {
            unreachable!();
        };
        let blk = em.emit_agg(a, &env, &mut |_em, m, v| {
            Ok(vec![Instr::AggSeq { agg: idx, v, m }])
        })?;
        body.extend(blk);
    }
    let (rv, rm) = em.pair();
    body.push(Instr::ConstI64 { dst: rv, v: 0 });
    body.push(Instr::ConstI64 { dst: rm, v: 0 });
    let seq = em.finish(
        EmitTriplet {
            setup: body,
            m: rm,
            v: rv,
        },
        VType::bool().required(),
        true,
    );

    // result routine: aggregator results become trailing inputs
    let mut result_inputs = input_types.to_vec();
    for spec in &specs {
        result_inputs.push(spec.result_type().map_err(|e| EmitError(e.to_string()))?);
    }
    let mut counter = input_types.len();
    let rewritten = rewrite_agg_ops(ir, &mut counter);
    let result = compile(&rewritten, &result_inputs, registry)?;

    debug!(
        n_aggs = specs.len(),
        "compiled aggregation into seq + result routines"
    );
    Ok(AggCompilation {
        specs,
        seq,
        result,
    })
}

/// Collect `ApplyAggOp` nodes in tree order, not descending into
/// aggregables (nested aggregation is rejected during seq emission).
fn collect_agg_ops<'a>(ir: &'a Ir, out: &mut Vec<&'a Ir>) {
    match ir {
        Ir::ApplyAggOp { .. } => out.push(ir),
        Ir::NA(_)
        | Ir::I32(_)
        | Ir::I64(_)
        | Ir::F32(_)
        | Ir::F64(_)
        | Ir::Bool(_)
        | Ir::Str(_)
        | Ir::Ref(_)
        | Ir::In(_)
        | Ir::AggIn => {}
        Ir::IsNa(v) | Ir::ApplyUnOp { v, .. } | Ir::ArrayLen(v) | Ir::Cast { value: v, .. } => {
            collect_agg_ops(v, out)
        }
        Ir::If { cond, cnsq, altr } => {
            collect_agg_ops(cond, out);
            collect_agg_ops(cnsq, out);
            collect_agg_ops(altr, out);
        }
        Ir::Let { value, body, .. } | Ir::MapNa { value, body, .. } => {
            collect_agg_ops(value, out);
            collect_agg_ops(body, out);
        }
        Ir::ApplyBinOp { l, r, .. } => {
            collect_agg_ops(l, out);
            collect_agg_ops(r, out);
        }
        Ir::MakeArray { args, .. } | Ir::MakeTuple(args) => {
            for a in args {
                collect_agg_ops(a, out);
            }
        }
        Ir::ArrayRef { a, i } => {
            collect_agg_ops(a, out);
            collect_agg_ops(i, out);
        }
        Ir::ArrayRange { start, stop, step } => {
            collect_agg_ops(start, out);
            collect_agg_ops(stop, out);
            collect_agg_ops(step, out);
        }
        Ir::ArrayMap { a, body, .. }
        | Ir::ArrayFilter { a, body, .. }
        | Ir::ArrayFlatMap { a, body, .. }
        | Ir::AggMap { a, body, .. }
        | Ir::AggFilter { a, body, .. }
        | Ir::AggFlatMap { a, body, .. } => {
            collect_agg_ops(a, out);
            collect_agg_ops(body, out);
        }
        Ir::ArrayFold { a, zero, body, .. } => {
            collect_agg_ops(a, out);
            collect_agg_ops(zero, out);
            collect_agg_ops(body, out);
        }
        Ir::MakeStruct(fields) | Ir::InsertFields { fields, .. } => {
            if let Ir::InsertFields { old, .. } = ir {
                collect_agg_ops(old, out);
            }
            for (_, f) in fields {
                collect_agg_ops(f, out);
            }
        }
        Ir::GetField { o, .. } | Ir::GetTupleElement { o, .. } => collect_agg_ops(o, out),
        Ir::Apply { args, .. } => {
            for a in args {
                collect_agg_ops(a, out);
            }
        }
    }
}

/// Clone the tree, replacing each `ApplyAggOp` (in the same traversal
/// order as `collect_agg_ops`) with a fresh trailing input.
fn rewrite_agg_ops(ir: &Ir, counter: &mut usize) -> Ir {
    match ir {
        Ir::ApplyAggOp { .. } => {
            let i = *counter;
            *counter += 1;
            Ir::In(i)
        }
        Ir::IsNa(v) => Ir::IsNa(Box::new(rewrite_agg_ops(v, counter))),
        Ir::ApplyUnOp { op, v } => Ir::ApplyUnOp {
            op: *op,
            v: Box::new(rewrite_agg_ops(v, counter)),
        },
        Ir::ArrayLen(v) => Ir::ArrayLen(Box::new(rewrite_agg_ops(v, counter))),
        Ir::Cast { value, typ } => Ir::Cast {
            value: Box::new(rewrite_agg_ops(value, counter)),
            typ: typ.clone(),
        },
        Ir::If { cond, cnsq, altr } => Ir::If {
            cond: Box::new(rewrite_agg_ops(cond, counter)),
            cnsq: Box::new(rewrite_agg_ops(cnsq, counter)),
            altr: Box::new(rewrite_agg_ops(altr, counter)),
        },
        Ir::Let { name, value, body } => Ir::Let {
            name: name.clone(),
            value: Box::new(rewrite_agg_ops(value, counter)),
            body: Box::new(rewrite_agg_ops(body, counter)),
        },
        Ir::MapNa { name, value, body } => Ir::MapNa {
            name: name.clone(),
            value: Box::new(rewrite_agg_ops(value, counter)),
            body: Box::new(rewrite_agg_ops(body, counter)),
        },
        Ir::ApplyBinOp { op, l, r } => Ir::ApplyBinOp {
            op: *op,
            l: Box::new(rewrite_agg_ops(l, counter)),
            r: Box::new(rewrite_agg_ops(r, counter)),
        },
        Ir::MakeArray { elem, args } => Ir::MakeArray {
            elem: elem.clone(),
            args: args.iter().map(|a| rewrite_agg_ops(a, counter)).collect(),
        },
        Ir::MakeTuple(args) => {
            Ir::MakeTuple(args.iter().map(|a| rewrite_agg_ops(a, counter)).collect())
        }
        Ir::ArrayRef { a, i } => Ir::ArrayRef {
            a: Box::new(rewrite_agg_ops(a, counter)),
            i: Box::new(rewrite_agg_ops(i, counter)),
        },
        Ir::ArrayRange { start, stop, step } => Ir::ArrayRange {
            start: Box::new(rewrite_agg_ops(start, counter)),
            stop: Box::new(rewrite_agg_ops(stop, counter)),
            step: Box::new(rewrite_agg_ops(step, counter)),
        },
        Ir::ArrayMap { a, name, body } => Ir::ArrayMap {
            a: Box::new(rewrite_agg_ops(a, counter)),
            name: name.clone(),
            body: Box::new(rewrite_agg_ops(body, counter)),
        },
        Ir::ArrayFilter { a, name, body } => Ir::ArrayFilter {
            a: Box::new(rewrite_agg_ops(a, counter)),
            name: name.clone(),
            body: Box::new(rewrite_agg_ops(body, counter)),
        },
        Ir::ArrayFlatMap { a, name, body } => Ir::ArrayFlatMap {
            a: Box::new(rewrite_agg_ops(a, counter)),
            name: name.clone(),
            body: Box::new(rewrite_agg_ops(body, counter)),
        },
        Ir::ArrayFold {
            a,
            zero,
            acc_name,
            value_name,
            body,
        } => Ir::ArrayFold {
            a: Box::new(rewrite_agg_ops(a, counter)),
            zero: Box::new(rewrite_agg_ops(zero, counter)),
            acc_name: acc_name.clone(),
            value_name: value_name.clone(),
            body: Box::new(rewrite_agg_ops(body, counter)),
        },
        Ir::MakeStruct(fields) => Ir::MakeStruct(
            fields
                .iter()
                .map(|(n, f)| (n.clone(), rewrite_agg_ops(f, counter)))
                .collect(),
        ),
        Ir::InsertFields { old, fields } => Ir::InsertFields {
            old: Box::new(rewrite_agg_ops(old, counter)),
            fields: fields
                .iter()
                .map(|(n, f)| (n.clone(), rewrite_agg_ops(f, counter)))
                .collect(),
        },
        Ir::GetField { o, name } => Ir::GetField {
            o: Box::new(rewrite_agg_ops(o, counter)),
            name: name.clone(),
        },
        Ir::GetTupleElement { o, idx } => Ir::GetTupleElement {
            o: Box::new(rewrite_agg_ops(o, counter)),
            idx: *idx,
        },
        Ir::Apply { function, args } => Ir::Apply {
            function: function.clone(),
            args: args.iter().map(|a| rewrite_agg_ops(a, counter)).collect(),
        },
        // leaves (and aggregables, which cannot contain ApplyAggOp)
        other => other.clone(),
    }
}
