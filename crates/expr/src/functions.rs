//! User-function registry
//!
//! Functions are IR templates registered under a name with declared
//! argument signatures. A signature may contain type variables; resolution
//! unifies the declared signature against the actual argument types and
//! picks the first overload that fits. The emitter memoizes one compiled
//! sub-routine per (name, concrete argument types) signature and reuses it
//! across call sites.

use crate::ir::{BinOp, Ir, UnOp};
use std::collections::HashMap;
use strata_core::{Kind, VType};

/// Declared argument shape. Only the kinds functions actually dispatch on
/// are representable; `Var` matches anything and binds.
#[derive(Debug, Clone, PartialEq)]
pub enum SigType {
    Var(String),
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    Str,
    Array(Box<SigType>),
}

impl SigType {
    /// Unify against an actual type, extending the substitution. The
    /// `required` flag never participates in unification.
    pub fn unify(&self, actual: &VType, subst: &mut HashMap<String, VType>) -> bool {
        match self {
            SigType::Var(name) => match subst.get(name) {
                Some(bound) => same_kind(bound, actual),
                None => {
                    subst.insert(name.clone(), actual.clone());
                    true
                }
            },
            SigType::Bool => matches!(actual.kind, Kind::Bool),
            SigType::Int32 => matches!(actual.kind, Kind::Int32),
            SigType::Int64 => matches!(actual.kind, Kind::Int64),
            SigType::Float32 => matches!(actual.kind, Kind::Float32),
            SigType::Float64 => matches!(actual.kind, Kind::Float64),
            SigType::Str => matches!(actual.kind, Kind::Str),
            SigType::Array(elem) => match &actual.kind {
                Kind::Array(a) => elem.unify(a, subst),
                _ => false,
            },
        }
    }
}

/// Structural kind equality, ignoring `required` everywhere.
pub fn same_kind(a: &VType, b: &VType) -> bool {
    match (&a.kind, &b.kind) {
        (Kind::Array(x), Kind::Array(y))
        | (Kind::Set(x), Kind::Set(y))
        | (Kind::Interval(x), Kind::Interval(y)) => same_kind(x, y),
        (Kind::Dict(xk, xv), Kind::Dict(yk, yv)) => same_kind(xk, yk) && same_kind(xv, yv),
        (Kind::Struct(xs), Kind::Struct(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .zip(ys)
                    .all(|(x, y)| x.name == y.name && same_kind(&x.typ, &y.typ))
        }
        (Kind::Tuple(xs), Kind::Tuple(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| same_kind(x, y))
        }
        (x, y) => std::mem::discriminant(x) == std::mem::discriminant(y),
    }
}

/// One registered overload: parameter names, declared signature, and the
/// IR body (parameters appear as `Ref`s).
#[derive(Debug, Clone)]
pub struct FnDef {
    pub name: String,
    pub params: Vec<String>,
    pub sig: Vec<SigType>,
    pub body: Ir,
}

#[derive(Debug, Default)]
pub struct FunctionRegistry {
    fns: HashMap<String, Vec<FnDef>>,
}

impl FunctionRegistry {
    pub fn new() -> FunctionRegistry {
        FunctionRegistry::default()
    }

    pub fn register(&mut self, def: FnDef) {
        self.fns.entry(def.name.clone()).or_default().push(def);
    }

    /// First overload whose declared signature unifies with the actual
    /// argument types.
    pub fn resolve(&self, name: &str, actual: &[VType]) -> Option<&FnDef> {
        let overloads = self.fns.get(name)?;
        overloads.iter().find(|def| {
            def.sig.len() == actual.len() && {
                let mut subst = HashMap::new();
                def.sig
                    .iter()
                    .zip(actual)
                    .all(|(sig, typ)| sig.unify(typ, &mut subst))
            }
        })
    }

    pub fn overloads(&self, name: &str) -> usize {
        self.fns.get(name).map_or(0, Vec::len)
    }

    /// The registry with the standard numeric and missingness builtins.
    pub fn with_builtins() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();

        for (sig, zero) in [
            (SigType::Int32, Ir::I32(0)),
            (SigType::Int64, Ir::I64(0)),
            (SigType::Float64, Ir::F64(0.0)),
        ] {
            registry.register(FnDef {
                name: "abs".to_string(),
                params: vec!["x".to_string()],
                sig: vec![sig],
                body: Ir::if_(
                    Ir::bin(BinOp::Lt, Ir::ref_("x"), zero),
                    Ir::ApplyUnOp {
                        op: UnOp::Negate,
                        v: Box::new(Ir::ref_("x")),
                    },
                    Ir::ref_("x"),
                ),
            });
        }

        for sig in [SigType::Int32, SigType::Int64, SigType::Float64] {
            registry.register(FnDef {
                name: "min".to_string(),
                params: vec!["x".to_string(), "y".to_string()],
                sig: vec![sig.clone(), sig.clone()],
                body: Ir::if_(
                    Ir::bin(BinOp::Lt, Ir::ref_("x"), Ir::ref_("y")),
                    Ir::ref_("x"),
                    Ir::ref_("y"),
                ),
            });
            registry.register(FnDef {
                name: "max".to_string(),
                params: vec!["x".to_string(), "y".to_string()],
                sig: vec![sig.clone(), sig.clone()],
                body: Ir::if_(
                    Ir::bin(BinOp::Gt, Ir::ref_("x"), Ir::ref_("y")),
                    Ir::ref_("x"),
                    Ir::ref_("y"),
                ),
            });
        }

        registry.register(FnDef {
            name: "to_i64".to_string(),
            params: vec!["x".to_string()],
            sig: vec![SigType::Int32],
            body: Ir::Cast {
                value: Box::new(Ir::ref_("x")),
                typ: VType::int64(),
            },
        });
        for sig in [SigType::Int32, SigType::Int64, SigType::Float32] {
            registry.register(FnDef {
                name: "to_f64".to_string(),
                params: vec!["x".to_string()],
                sig: vec![sig],
                body: Ir::Cast {
                    value: Box::new(Ir::ref_("x")),
                    typ: VType::float64(),
                },
            });
        }

        registry.register(FnDef {
            name: "is_defined".to_string(),
            params: vec!["x".to_string()],
            sig: vec![SigType::Var("T".to_string())],
            body: Ir::ApplyUnOp {
                op: UnOp::Bang,
                v: Box::new(Ir::is_na(Ir::ref_("x"))),
            },
        });

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_by_argument_types() {
        let registry = FunctionRegistry::with_builtins();
        let i = registry.resolve("abs", &[VType::int32()]).unwrap();
        assert_eq!(i.sig, vec![SigType::Int32]);
        let f = registry.resolve("abs", &[VType::float64()]).unwrap();
        assert_eq!(f.sig, vec![SigType::Float64]);
        assert!(registry.resolve("abs", &[VType::str()]).is_none());
        assert!(registry.resolve("nope", &[VType::int32()]).is_none());
    }

    #[test]
    fn test_var_binds_consistently() {
        let mut subst = HashMap::new();
        let t = SigType::Var("T".to_string());
        assert!(t.unify(&VType::int32(), &mut subst));
        // second use of T must match the binding
        assert!(t.unify(&VType::int32().required(), &mut subst));
        assert!(!t.unify(&VType::str(), &mut subst));
    }

    #[test]
    fn test_array_sig_unifies_element() {
        let mut subst = HashMap::new();
        let sig = SigType::Array(Box::new(SigType::Var("T".to_string())));
        assert!(sig.unify(&VType::array_of(VType::float64()), &mut subst));
        assert!(same_kind(&subst["T"], &VType::float64()));
    }
}
