//! The typed expression tree
//!
//! Every node's result type is inferred during emission; variable bindings
//! resolve by lexical environment lookup keyed by name. Aggregator subtrees
//! bottom out at `AggIn`, which refers to the ambient aggregable's element.
//! The tree is owned, so no cyclic IR can be constructed.

use crate::agg::AggOp;
use strata_core::VType;

/// Binary primitive operators. Comparison and boolean operators produce
/// `Bool`; `And`/`Or` are strict in missingness like every other operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    /// Same-kind division: truncating on integers, IEEE on floats.
    /// Integer division by zero is fatal.
    Div,
    /// Floor division on both integers and floats
    FloorDiv,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Negate,
    /// Boolean negation
    Bang,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Ir {
    /// Missing literal of an explicit type
    NA(VType),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Str(String),

    IsNa(Box<Ir>),
    If {
        cond: Box<Ir>,
        cnsq: Box<Ir>,
        altr: Box<Ir>,
    },
    Let {
        name: String,
        value: Box<Ir>,
        body: Box<Ir>,
    },
    /// Short-circuit on missing: if `value` is missing the result is
    /// missing and `body` is skipped; otherwise `name` is bound non-missing.
    MapNa {
        name: String,
        value: Box<Ir>,
        body: Box<Ir>,
    },
    Ref(String),
    /// User input `i` (value/missing-bit argument pair i)
    In(usize),
    Cast {
        value: Box<Ir>,
        typ: VType,
    },

    ApplyBinOp {
        op: BinOp,
        l: Box<Ir>,
        r: Box<Ir>,
    },
    ApplyUnOp {
        op: UnOp,
        v: Box<Ir>,
    },

    MakeArray {
        elem: VType,
        args: Vec<Ir>,
    },
    ArrayRef {
        a: Box<Ir>,
        i: Box<Ir>,
    },
    ArrayLen(Box<Ir>),
    ArrayRange {
        start: Box<Ir>,
        stop: Box<Ir>,
        step: Box<Ir>,
    },
    ArrayMap {
        a: Box<Ir>,
        name: String,
        body: Box<Ir>,
    },
    ArrayFilter {
        a: Box<Ir>,
        name: String,
        body: Box<Ir>,
    },
    ArrayFlatMap {
        a: Box<Ir>,
        name: String,
        body: Box<Ir>,
    },
    ArrayFold {
        a: Box<Ir>,
        zero: Box<Ir>,
        acc_name: String,
        value_name: String,
        body: Box<Ir>,
    },

    MakeStruct(Vec<(String, Ir)>),
    /// Copy `old`'s fields, overriding or appending the named fields.
    /// An override replaces the old field's value and missingness.
    InsertFields {
        old: Box<Ir>,
        fields: Vec<(String, Ir)>,
    },
    GetField {
        o: Box<Ir>,
        name: String,
    },
    MakeTuple(Vec<Ir>),
    GetTupleElement {
        o: Box<Ir>,
        idx: usize,
    },

    /// The ambient aggregable's element (valid only inside an aggregable)
    AggIn,
    AggMap {
        a: Box<Ir>,
        name: String,
        body: Box<Ir>,
    },
    AggFilter {
        a: Box<Ir>,
        name: String,
        body: Box<Ir>,
    },
    AggFlatMap {
        a: Box<Ir>,
        name: String,
        body: Box<Ir>,
    },
    ApplyAggOp {
        a: Box<Ir>,
        op: AggOp,
        /// Operator arguments (e.g. n for Take), evaluated outside the
        /// aggregable scope
        args: Vec<Ir>,
    },

    /// User function call, resolved through the registry
    Apply {
        function: String,
        args: Vec<Ir>,
    },
}

impl Ir {
    // Constructor helpers keep test expressions readable.
    pub fn let_(name: &str, value: Ir, body: Ir) -> Ir {
        Ir::Let {
            name: name.to_string(),
            value: Box::new(value),
            body: Box::new(body),
        }
    }

    pub fn if_(cond: Ir, cnsq: Ir, altr: Ir) -> Ir {
        Ir::If {
            cond: Box::new(cond),
            cnsq: Box::new(cnsq),
            altr: Box::new(altr),
        }
    }

    pub fn is_na(v: Ir) -> Ir {
        Ir::IsNa(Box::new(v))
    }

    pub fn ref_(name: &str) -> Ir {
        Ir::Ref(name.to_string())
    }

    pub fn bin(op: BinOp, l: Ir, r: Ir) -> Ir {
        Ir::ApplyBinOp {
            op,
            l: Box::new(l),
            r: Box::new(r),
        }
    }

    pub fn get_field(o: Ir, name: &str) -> Ir {
        Ir::GetField {
            o: Box::new(o),
            name: name.to_string(),
        }
    }

    pub fn array_ref(a: Ir, i: Ir) -> Ir {
        Ir::ArrayRef {
            a: Box::new(a),
            i: Box::new(i),
        }
    }

    pub fn array_range(start: Ir, stop: Ir, step: Ir) -> Ir {
        Ir::ArrayRange {
            start: Box::new(start),
            stop: Box::new(stop),
            step: Box::new(step),
        }
    }

    pub fn array_map(a: Ir, name: &str, body: Ir) -> Ir {
        Ir::ArrayMap {
            a: Box::new(a),
            name: name.to_string(),
            body: Box::new(body),
        }
    }

    pub fn array_filter(a: Ir, name: &str, body: Ir) -> Ir {
        Ir::ArrayFilter {
            a: Box::new(a),
            name: name.to_string(),
            body: Box::new(body),
        }
    }

    pub fn array_flat_map(a: Ir, name: &str, body: Ir) -> Ir {
        Ir::ArrayFlatMap {
            a: Box::new(a),
            name: name.to_string(),
            body: Box::new(body),
        }
    }

    pub fn array_fold(a: Ir, zero: Ir, acc: &str, value: &str, body: Ir) -> Ir {
        Ir::ArrayFold {
            a: Box::new(a),
            zero: Box::new(zero),
            acc_name: acc.to_string(),
            value_name: value.to_string(),
            body: Box::new(body),
        }
    }

    pub fn agg_map(a: Ir, name: &str, body: Ir) -> Ir {
        Ir::AggMap {
            a: Box::new(a),
            name: name.to_string(),
            body: Box::new(body),
        }
    }

    pub fn agg_filter(a: Ir, name: &str, body: Ir) -> Ir {
        Ir::AggFilter {
            a: Box::new(a),
            name: name.to_string(),
            body: Box::new(body),
        }
    }

    pub fn agg_flat_map(a: Ir, name: &str, body: Ir) -> Ir {
        Ir::AggFlatMap {
            a: Box::new(a),
            name: name.to_string(),
            body: Box::new(body),
        }
    }

    pub fn apply_agg(a: Ir, op: AggOp, args: Vec<Ir>) -> Ir {
        Ir::ApplyAggOp {
            a: Box::new(a),
            op,
            args,
        }
    }

    pub fn apply(function: &str, args: Vec<Ir>) -> Ir {
        Ir::Apply {
            function: function.to_string(),
            args,
        }
    }

    pub fn map_na(name: &str, value: Ir, body: Ir) -> Ir {
        Ir::MapNa {
            name: name.to_string(),
            value: Box::new(value),
            body: Box::new(body),
        }
    }

    pub fn make_struct(fields: Vec<(&str, Ir)>) -> Ir {
        Ir::MakeStruct(
            fields
                .into_iter()
                .map(|(name, ir)| (name.to_string(), ir))
                .collect(),
        )
    }

    pub fn insert_fields(old: Ir, fields: Vec<(&str, Ir)>) -> Ir {
        Ir::InsertFields {
            old: Box::new(old),
            fields: fields
                .into_iter()
                .map(|(name, ir)| (name.to_string(), ir))
                .collect(),
        }
    }
}
