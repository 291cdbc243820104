//! End-to-end expression tests: compile IR, run the routine, check the
//! annotation that comes back.

use std::sync::Arc;
use strata_core::{Annotation, EngineError, Region, VType};
use strata_expr::{
    AggCtx, AggOp, BinOp, FunctionRegistry, Ir, annotation_to_bits, compile,
    compile_with_aggregators,
};

fn registry() -> Arc<FunctionRegistry> {
    Arc::new(FunctionRegistry::with_builtins())
}

fn eval0(ir: &Ir) -> Result<Annotation, EngineError> {
    let f = compile(ir, &[], registry()).expect("compile");
    let mut region = Region::new();
    f.eval_annotations(&mut region, &[], &[], None)
}

fn eval1(ir: &Ir, input: &VType, arg: Annotation) -> Result<Annotation, EngineError> {
    let f = compile(ir, std::slice::from_ref(input), registry()).expect("compile");
    let mut region = Region::new();
    f.eval_annotations(&mut region, std::slice::from_ref(input), &[arg], None)
}

fn ints(values: &[i32]) -> Annotation {
    Annotation::Array(values.iter().map(|v| Annotation::Int32(*v)).collect())
}

#[test]
fn test_array_range() {
    let got = eval0(&Ir::array_range(Ir::I32(0), Ir::I32(10), Ir::I32(3))).unwrap();
    assert_eq!(got, ints(&[0, 3, 6, 9]));

    let got = eval0(&Ir::array_range(Ir::I32(10), Ir::I32(0), Ir::I32(-3))).unwrap();
    assert_eq!(got, ints(&[10, 7, 4, 1]));

    let got = eval0(&Ir::array_range(Ir::I32(5), Ir::I32(5), Ir::I32(1))).unwrap();
    assert_eq!(got, ints(&[]));
}

#[test]
fn test_array_range_step_zero_is_fatal() {
    let err = eval0(&Ir::array_range(Ir::I32(0), Ir::I32(10), Ir::I32(0))).unwrap_err();
    match err {
        EngineError::User(msg) => assert!(msg.contains("step size 0"), "{}", msg),
        other => panic!("expected a user error, got {:?}", other),
    }
}

#[test]
fn test_array_range_with_missing_bound_is_missing() {
    let got = eval0(&Ir::array_range(
        Ir::I32(0),
        Ir::NA(VType::int32()),
        Ir::I32(1),
    ))
    .unwrap();
    assert_eq!(got, Annotation::Missing);
}

#[test]
fn test_if_isna_recovers_missing() {
    // If(IsNA(x), 0, x + 1) over {null, 4, 7} = {0, 5, 8}
    let ir = Ir::if_(
        Ir::is_na(Ir::In(0)),
        Ir::I32(0),
        Ir::bin(BinOp::Add, Ir::In(0), Ir::I32(1)),
    );
    let t = VType::int32();
    assert_eq!(eval1(&ir, &t, Annotation::Missing).unwrap(), Annotation::Int32(0));
    assert_eq!(eval1(&ir, &t, Annotation::Int32(4)).unwrap(), Annotation::Int32(5));
    assert_eq!(eval1(&ir, &t, Annotation::Int32(7)).unwrap(), Annotation::Int32(8));
}

#[test]
fn test_missing_operand_propagates() {
    let ir = Ir::bin(BinOp::Add, Ir::In(0), Ir::I32(1));
    assert_eq!(
        eval1(&ir, &VType::int32(), Annotation::Missing).unwrap(),
        Annotation::Missing
    );
    // missing If condition is missing, even though branches are defined
    let ir = Ir::if_(Ir::NA(VType::bool()), Ir::I32(1), Ir::I32(2));
    assert_eq!(eval0(&ir).unwrap(), Annotation::Missing);
}

#[test]
fn test_map_na_short_circuits() {
    // MapNA(x, v, x * 2): missing v skips the body
    let ir = Ir::map_na("x", Ir::In(0), Ir::bin(BinOp::Mul, Ir::ref_("x"), Ir::I32(2)));
    let t = VType::int32();
    assert_eq!(eval1(&ir, &t, Annotation::Int32(21)).unwrap(), Annotation::Int32(42));
    assert_eq!(eval1(&ir, &t, Annotation::Missing).unwrap(), Annotation::Missing);
}

#[test]
fn test_let_binds_once() {
    let ir = Ir::let_(
        "x",
        Ir::bin(BinOp::Add, Ir::I32(20), Ir::I32(1)),
        Ir::bin(BinOp::Add, Ir::ref_("x"), Ir::ref_("x")),
    );
    assert_eq!(eval0(&ir).unwrap(), Annotation::Int32(42));
}

#[test]
fn test_array_map_filter_flatmap() {
    // map: [0,3,6,9] * 2
    let ir = Ir::array_map(
        Ir::array_range(Ir::I32(0), Ir::I32(10), Ir::I32(3)),
        "x",
        Ir::bin(BinOp::Mul, Ir::ref_("x"), Ir::I32(2)),
    );
    assert_eq!(eval0(&ir).unwrap(), ints(&[0, 6, 12, 18]));

    // filter: keep odd
    let ir = Ir::array_filter(
        Ir::array_range(Ir::I32(0), Ir::I32(6), Ir::I32(1)),
        "x",
        Ir::bin(
            BinOp::Eq,
            Ir::bin(BinOp::Mod, Ir::ref_("x"), Ir::I32(2)),
            Ir::I32(1),
        ),
    );
    assert_eq!(eval0(&ir).unwrap(), ints(&[1, 3, 5]));

    // flat_map: x -> range(0, x, 1)
    let ir = Ir::array_flat_map(
        Ir::array_range(Ir::I32(1), Ir::I32(4), Ir::I32(1)),
        "x",
        Ir::array_range(Ir::I32(0), Ir::ref_("x"), Ir::I32(1)),
    );
    assert_eq!(eval0(&ir).unwrap(), ints(&[0, 0, 1, 0, 1, 2]));
}

#[test]
fn test_array_map_keeps_missing_elements() {
    let elems = VType::array_of(VType::int32());
    let ir = Ir::array_map(
        Ir::In(0),
        "x",
        Ir::bin(BinOp::Add, Ir::ref_("x"), Ir::I32(1)),
    );
    let got = eval1(
        &ir,
        &elems,
        Annotation::Array(vec![
            Annotation::Int32(1),
            Annotation::Missing,
            Annotation::Int32(3),
        ]),
    )
    .unwrap();
    assert_eq!(
        got,
        Annotation::Array(vec![
            Annotation::Int32(2),
            Annotation::Missing,
            Annotation::Int32(4),
        ])
    );
}

#[test]
fn test_array_fold_sum() {
    let ir = Ir::array_fold(
        Ir::array_range(Ir::I32(1), Ir::I32(5), Ir::I32(1)),
        Ir::I32(0),
        "acc",
        "x",
        Ir::bin(BinOp::Add, Ir::ref_("acc"), Ir::ref_("x")),
    );
    assert_eq!(eval0(&ir).unwrap(), Annotation::Int32(10));

    // folding a missing array is missing
    let ir = Ir::array_fold(
        Ir::NA(VType::array_of(VType::int32())),
        Ir::I32(0),
        "acc",
        "x",
        Ir::bin(BinOp::Add, Ir::ref_("acc"), Ir::ref_("x")),
    );
    assert_eq!(eval0(&ir).unwrap(), Annotation::Missing);
}

#[test]
fn test_array_ref_out_of_bounds_is_fatal() {
    let arr = Ir::MakeArray {
        elem: VType::int32().required(),
        args: vec![Ir::I32(1), Ir::I32(2)],
    };
    let err = eval0(&Ir::array_ref(arr, Ir::I32(5))).unwrap_err();
    match err {
        EngineError::User(msg) => {
            assert!(msg.contains("index 5"), "{}", msg);
            assert!(msg.contains("2 elements"), "{}", msg);
        }
        other => panic!("expected a user error, got {:?}", other),
    }
}

#[test]
fn test_array_ref_missing_index_is_missing_not_fatal() {
    let arr = Ir::MakeArray {
        elem: VType::int32().required(),
        args: vec![Ir::I32(1)],
    };
    let got = eval0(&Ir::array_ref(arr, Ir::NA(VType::int32()))).unwrap();
    assert_eq!(got, Annotation::Missing);
}

#[test]
fn test_struct_construction_and_access() {
    let ir = Ir::get_field(
        Ir::make_struct(vec![
            ("a", Ir::I32(1)),
            ("b", Ir::Str("hello".to_string())),
        ]),
        "b",
    );
    assert_eq!(eval0(&ir).unwrap(), Annotation::Str("hello".to_string()));
}

#[test]
fn test_insert_fields_overrides_and_appends() {
    let base = Ir::make_struct(vec![("a", Ir::I32(1)), ("b", Ir::NA(VType::int32()))]);
    let ir = Ir::insert_fields(base, vec![("b", Ir::I32(9)), ("c", Ir::Bool(true))]);
    let got = eval0(&ir).unwrap();
    assert_eq!(
        got,
        Annotation::Struct(vec![
            Annotation::Int32(1),
            Annotation::Int32(9),
            Annotation::Bool(true),
        ])
    );
}

#[test]
fn test_tuple_element() {
    let ir = Ir::GetTupleElement {
        o: Box::new(Ir::MakeTuple(vec![Ir::I32(4), Ir::F64(0.5)])),
        idx: 1,
    };
    assert_eq!(eval0(&ir).unwrap(), Annotation::Float64(0.5));
}

#[test]
fn test_division_by_zero_is_fatal() {
    let err = eval0(&Ir::bin(BinOp::Div, Ir::I32(1), Ir::I32(0))).unwrap_err();
    assert!(matches!(err, EngineError::User(_)));
}

#[test]
fn test_numeric_promotion() {
    let got = eval0(&Ir::bin(BinOp::Add, Ir::I32(1), Ir::F64(0.5))).unwrap();
    assert_eq!(got, Annotation::Float64(1.5));
}

#[test]
fn test_apply_resolves_and_memoizes() {
    let ir = Ir::bin(
        BinOp::Add,
        Ir::apply("abs", vec![Ir::I32(-5)]),
        Ir::apply("abs", vec![Ir::I32(-2)]),
    );
    let f = compile(&ir, &[], registry()).unwrap();
    // two call sites with the same signature share one sub-routine
    assert_eq!(f.subs.len(), 1);
    let mut region = Region::new();
    let got = f.eval_annotations(&mut region, &[], &[], None).unwrap();
    assert_eq!(got, Annotation::Int32(7));
}

#[test]
fn test_apply_unresolved_is_an_error() {
    let ir = Ir::apply("abs", vec![Ir::Str("x".to_string())]);
    assert!(compile(&ir, &[], registry()).is_err());
}

fn run_aggregation(
    ir: &Ir,
    elem_type: &VType,
    elems: &[Annotation],
) -> Result<Annotation, EngineError> {
    let c = compile_with_aggregators(ir, &[], elem_type, &[], registry()).expect("agg compile");
    let mut ctx = AggCtx::new(c.specs.clone());
    let mut region = Region::new();
    for elem in elems {
        region.clear();
        let bits = annotation_to_bits(elem_type, elem, &mut region);
        c.seq.eval_raw(&mut region, &[bits], Some(&mut ctx))?;
    }
    let results = ctx.results();
    let result_types: Vec<VType> = c
        .specs
        .iter()
        .map(|s| s.result_type().unwrap())
        .collect();
    region.clear();
    c.result
        .eval_annotations(&mut region, &result_types, &results, None)
}

#[test]
fn test_sum_of_filtered_aggregable() {
    // sum(filter(a, x -> x > 0)) over [1, null, -2, 3] = 4
    let ir = Ir::apply_agg(
        Ir::agg_filter(Ir::AggIn, "x", Ir::bin(BinOp::Gt, Ir::ref_("x"), Ir::I32(0))),
        AggOp::Sum,
        vec![],
    );
    let got = run_aggregation(
        &ir,
        &VType::int32(),
        &[
            Annotation::Int32(1),
            Annotation::Missing,
            Annotation::Int32(-2),
            Annotation::Int32(3),
        ],
    )
    .unwrap();
    assert_eq!(got, Annotation::Int64(4));
}

#[test]
fn test_sum_over_all_missing_is_defined_zero() {
    let ir = Ir::apply_agg(Ir::AggIn, AggOp::Sum, vec![]);
    let got = run_aggregation(
        &ir,
        &VType::int32(),
        &[Annotation::Missing, Annotation::Missing],
    )
    .unwrap();
    assert_eq!(got, Annotation::Int64(0));
}

#[test]
fn test_agg_map_and_flat_map() {
    // sum(map(a, x -> x * 10))
    let ir = Ir::apply_agg(
        Ir::agg_map(Ir::AggIn, "x", Ir::bin(BinOp::Mul, Ir::ref_("x"), Ir::I32(10))),
        AggOp::Sum,
        vec![],
    );
    let got = run_aggregation(
        &ir,
        &VType::int32(),
        &[Annotation::Int32(1), Annotation::Int32(2)],
    )
    .unwrap();
    assert_eq!(got, Annotation::Int64(30));

    // count(flat_map(a, x -> range(0, x)))
    let ir = Ir::apply_agg(
        Ir::agg_flat_map(
            Ir::AggIn,
            "x",
            Ir::array_range(Ir::I32(0), Ir::ref_("x"), Ir::I32(1)),
        ),
        AggOp::Count,
        vec![],
    );
    let got = run_aggregation(
        &ir,
        &VType::int32(),
        &[Annotation::Int32(2), Annotation::Int32(3)],
    )
    .unwrap();
    assert_eq!(got, Annotation::Int64(5));
}

#[test]
fn test_take_aggregator_arguments() {
    let ir = Ir::apply_agg(Ir::AggIn, AggOp::Take, vec![Ir::I32(2)]);
    let got = run_aggregation(
        &ir,
        &VType::int32(),
        &[
            Annotation::Int32(5),
            Annotation::Missing,
            Annotation::Int32(7),
        ],
    )
    .unwrap();
    assert_eq!(
        got,
        Annotation::Array(vec![Annotation::Int32(5), Annotation::Missing])
    );
}

#[test]
fn test_nested_aggregation_rejected() {
    let inner = Ir::apply_agg(Ir::AggIn, AggOp::Sum, vec![]);
    let ir = Ir::apply_agg(
        Ir::agg_map(Ir::AggIn, "x", inner),
        AggOp::Sum,
        vec![],
    );
    assert!(compile_with_aggregators(&ir, &[], &VType::int32(), &[], registry()).is_err());
}

#[test]
fn test_partial_aggregation_combines_across_partitions() {
    let ir = Ir::apply_agg(Ir::AggIn, AggOp::Sum, vec![]);
    let t = VType::int32();
    let c = compile_with_aggregators(&ir, &[], &t, &[], registry()).unwrap();

    // partition 1
    let mut ctx1 = AggCtx::new(c.specs.clone());
    let mut region = Region::new();
    for v in [1, 2] {
        region.clear();
        let bits = annotation_to_bits(&t, &Annotation::Int32(v), &mut region);
        c.seq.eval_raw(&mut region, &[bits], Some(&mut ctx1)).unwrap();
    }
    // partition 2, shipped over the wire
    let mut ctx2 = AggCtx::new(c.specs.clone());
    for v in [3, 4] {
        region.clear();
        let bits = annotation_to_bits(&t, &Annotation::Int32(v), &mut region);
        c.seq.eval_raw(&mut region, &[bits], Some(&mut ctx2)).unwrap();
    }
    let wire = ctx2.encode_states().unwrap();
    ctx1.combine(&AggCtx::decode_states(&wire).unwrap());
    assert_eq!(ctx1.results(), vec![Annotation::Int64(10)]);
}
