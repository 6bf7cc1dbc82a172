//! The interpreter and compiled routines must agree on results, faults and
//! heap effects.

mod common;

use std::collections::BTreeMap;

use proptest::prelude::*;
use skipper_vm::jit::JitCompiler;
use skipper_vm::vm::{Class, Constant, Function, OutputBuffer, Program, TraceEvent, TypeRef, Variable};
use skipper_vm::{JitMode, Op, RuntimeConfig, Value, Vm, VmError};

use common::{assemble, item, pool, run_with, single_function};

type Observation = (Result<(Value, String), VmError>, String);

fn observe(config: RuntimeConfig, program: &Program) -> Observation {
    let out = OutputBuffer::new();
    let vm = Vm::new(config);
    let mut heap = vm.new_heap().with_output(Box::new(out.clone()));
    let result = vm.run(program, &mut heap).map(|o| (o.result, o.display));
    (result, out.contents())
}

/// Interpreter observation, checked against the compiled tier when the host
/// can compile.
fn observe_both(program: &Program) -> Observation {
    observe_limited(program, None)
}

/// Like [`observe_both`], on heaps capped at `heap_limit` bytes.
fn observe_limited(program: &Program, heap_limit: Option<usize>) -> Observation {
    let interpreted = observe(RuntimeConfig { heap_limit, ..RuntimeConfig::interpreter() }, program);
    if JitCompiler::is_supported() {
        let compiled = observe(RuntimeConfig { heap_limit, ..RuntimeConfig::eager_jit() }, program);
        assert_eq!(interpreted, compiled, "tiers disagree");
    }
    interpreted
}

fn main_only(code: Vec<Op>, constants: Vec<Constant>) -> Program {
    Program::new(vec![Function::new("main", code)], constants)
}

fn expect_value(program: &Program) -> (Value, String) {
    match observe_both(program).0 {
        Ok(result) => result,
        Err(e) => panic!("unexpected fault: {}", e),
    }
}

fn expect_fault(program: &Program) -> VmError {
    match observe_both(program).0 {
        Ok((value, _)) => panic!("expected a fault, got {:?}", value),
        Err(e) => e,
    }
}

fn factorial_program() -> Program {
    let fact = vec![
        Op::LoadLocal { func: 1, slot: 0 },
        Op::Push(1),
        Op::CmpLe,
        Op::JumpIfFalse(6),
        Op::Push(1),
        Op::Return,
        Op::LoadLocal { func: 1, slot: 0 },
        Op::LoadLocal { func: 1, slot: 0 },
        Op::Push(1),
        Op::Sub,
        Op::Call { func: 1, argc: 1 },
        Op::Mul,
        Op::Return,
    ];
    Program::new(
        vec![
            Function::new("main", vec![Op::Push(0), Op::Call { func: 1, argc: 1 }, Op::Return]),
            Function::new("fact", fact)
                .with_params(vec![Variable::new("n", TypeRef::Int)])
                .with_return_type(TypeRef::Int),
        ],
        vec![Constant::Int(5), Constant::Int(1)],
    )
}

fn counter_class() -> Class {
    Class {
        name: "Counter".to_string(),
        fields: vec![Variable::new("n", TypeRef::Int)],
        methods: BTreeMap::from([("get".to_string(), 1)]),
    }
}

// ===== Scenarios =====

#[test]
fn test_add_under_both_tiers() {
    let program = main_only(
        vec![Op::Push(0), Op::Push(1), Op::Add, Op::Return],
        vec![Constant::Int(10), Constant::Int(20)],
    );
    assert_eq!(expect_value(&program), (Value::from_i32(30), "30".to_string()));
}

#[test]
fn test_recursive_factorial_compiled() {
    let program = factorial_program();
    assert_eq!(expect_value(&program).0, Value::from_i32(120));

    if JitCompiler::is_supported() {
        let outcome = Vm::new(RuntimeConfig::eager_jit()).run_program(&program).unwrap();
        assert_eq!(outcome.compiled_functions, vec![0, 1]);
        assert_eq!(outcome.jit_compile_count, 2);
    }
}

#[test]
fn test_divide_by_zero_under_both_tiers() {
    let program = main_only(
        vec![Op::Push(0), Op::Push(1), Op::Div, Op::Return],
        vec![Constant::Int(1), Constant::Int(0)],
    );
    assert_eq!(expect_fault(&program), VmError::DivideByZero);
}

// ===== Per-opcode table =====

#[test]
fn test_stack_ops() {
    // [1, 2] -> SWAP -> [2, 1] -> SUB -> 1 -> DUP, MUL -> 1
    let program = main_only(
        vec![Op::Push(0), Op::Push(1), Op::Swap, Op::Sub, Op::Dup, Op::Mul, Op::Push(1), Op::Pop, Op::Return],
        vec![Constant::Int(1), Constant::Int(2)],
    );
    assert_eq!(expect_value(&program).0, Value::from_i32(1));
}

#[test]
fn test_numeric_promotion() {
    let constants = vec![
        Constant::Int(2),
        Constant::Double(0.5),
        Constant::Long(1 << 40),
        Constant::Char('A'),
    ];
    let cases = [
        (Op::Add, 0, 1, Value::from_f64(2.5)),
        (Op::Mul, 2, 0, Value::from_i64(1 << 41)),
        (Op::Add, 3, 0, Value::from_i32(67)),
        (Op::Mod, 2, 0, Value::from_i64(0)),
        (Op::Div, 1, 0, Value::from_f64(0.25)),
    ];
    for (op, a, b, expected) in cases {
        let program = main_only(vec![Op::Push(a), Op::Push(b), op, Op::Return], constants.clone());
        assert_eq!(expect_value(&program).0, expected, "{} {} {}", a, op, b);
    }
}

#[test]
fn test_integer_overflow_wraps() {
    let program = main_only(
        vec![Op::Push(0), Op::Push(1), Op::Add, Op::Return],
        vec![Constant::Int(i32::MAX), Constant::Int(1)],
    );
    assert_eq!(expect_value(&program).0, Value::from_i32(i32::MIN));
}

#[test]
fn test_negate_and_logic() {
    let constants = vec![Constant::Long(9), Constant::Bool(true), Constant::Bool(false)];
    let neg = main_only(vec![Op::Push(0), Op::Neg, Op::Return], constants.clone());
    assert_eq!(expect_value(&neg).0, Value::from_i64(-9));

    let logic = main_only(
        vec![Op::Push(1), Op::Push(2), Op::Or, Op::Push(2), Op::And, Op::Not, Op::Return],
        constants,
    );
    assert_eq!(expect_value(&logic).0, Value::from_bool(true));
}

#[test]
fn test_comparisons() {
    let constants = vec![
        Constant::Int(3),
        Constant::Double(3.0),
        Constant::Double(f64::NAN),
        Constant::Long(-1),
    ];
    let cases = [
        (Op::CmpEq, 0, 1, true),
        (Op::CmpNe, 0, 3, true),
        (Op::CmpLt, 3, 0, true),
        (Op::CmpGt, 2, 0, false),
        (Op::CmpLe, 2, 3, true),
        (Op::CmpGe, 2, 2, true),
        (Op::CmpEq, 2, 2, true),
    ];
    for (op, a, b, expected) in cases {
        let program = main_only(vec![Op::Push(a), Op::Push(b), op, Op::Return], constants.clone());
        assert_eq!(expect_value(&program).0, Value::from_bool(expected), "{} {} {}", a, op, b);
    }
}

#[test]
fn test_globals_coerce_to_declared_type() {
    let mut program = main_only(
        vec![Op::Push(0), Op::StoreGlobal(0), Op::LoadGlobal(0), Op::Return],
        vec![Constant::Int(5)],
    );
    program.globals = vec![Variable::new("total", TypeRef::Long)];
    assert_eq!(expect_value(&program).0, Value::from_i64(5));
}

#[test]
fn test_loop_with_calls() {
    // for (i = 0; i < 3; i = i + 1) { double(i); } return i;
    let main = vec![
        Op::Push(0),
        Op::StoreLocal { func: 0, slot: 0 },
        Op::LoadLocal { func: 0, slot: 0 },
        Op::Push(1),
        Op::CmpLt,
        Op::JumpIfFalse(14),
        Op::LoadLocal { func: 0, slot: 0 },
        Op::Call { func: 1, argc: 1 },
        Op::Pop,
        Op::LoadLocal { func: 0, slot: 0 },
        Op::Push(2),
        Op::Add,
        Op::StoreLocal { func: 0, slot: 0 },
        Op::Jump(2),
        Op::LoadLocal { func: 0, slot: 0 },
        Op::Return,
    ];
    let double = vec![Op::LoadLocal { func: 1, slot: 0 }, Op::Push(3), Op::Mul, Op::Return];
    let program = Program::new(
        vec![
            Function::new("main", main).with_locals(vec![Variable::new("i", TypeRef::Int)]),
            Function::new("double", double).with_params(vec![Variable::new("n", TypeRef::Int)]),
        ],
        vec![Constant::Int(0), Constant::Int(3), Constant::Int(1), Constant::Int(2)],
    );
    assert_eq!(expect_value(&program).0, Value::from_i32(3));
}

#[test]
fn test_objects_and_methods() {
    let main = vec![
        Op::NewObject(0),
        Op::Dup,
        Op::Push(0),
        Op::SetField { class: 0, field: 0 },
        Op::CallMethod { class: 0, method: 1 },
        Op::Return,
    ];
    let get = vec![
        Op::LoadLocal { func: 1, slot: 0 },
        Op::GetField { class: 0, field: 0 },
        Op::Return,
    ];
    let mut program = Program::new(
        vec![Function::new("main", main), Function::new("Counter.get", get)],
        vec![Constant::Int(7)],
    );
    program.classes = vec![counter_class()];
    assert_eq!(expect_value(&program).0, Value::from_i32(7));
}

#[test]
fn test_arrays() {
    let program = main_only(
        vec![
            Op::Push(0),
            Op::NewArray(0),
            Op::Dup,
            Op::Push(1),
            Op::Push(2),
            Op::SetElement,
            Op::Push(1),
            Op::GetElement,
            Op::Return,
        ],
        vec![Constant::Int(3), Constant::Int(1), Constant::Int(42)],
    );
    assert_eq!(expect_value(&program).0, Value::from_i32(42));
}

#[test]
fn test_string_concat_and_output() {
    let program = main_only(
        vec![
            Op::Push(0),
            Op::Push(1),
            Op::Add,
            Op::Dup,
            Op::CallNative(3),
            Op::Return,
        ],
        vec![Constant::String("n=".to_string()), Constant::Int(5)],
    );
    let (result, output) = observe_both(&program);
    assert_eq!(result.unwrap().1, "n=5");
    assert_eq!(output, "n=5\n");
}

#[test]
fn test_jump_past_end_returns() {
    let program = main_only(
        vec![Op::Push(0), Op::Jump(9), Op::Push(1), Op::Return],
        vec![Constant::Int(1), Constant::Int(2)],
    );
    assert_eq!(expect_value(&program).0, Value::from_i32(1));
}

// ===== Faults =====

#[test]
fn test_user_faults_match() {
    let long_mod = main_only(
        vec![Op::Push(0), Op::Push(1), Op::Mod, Op::Return],
        vec![Constant::Long(4), Constant::Long(0)],
    );
    assert_eq!(expect_fault(&long_mod), VmError::DivideByZero);

    let mut null_field = main_only(
        vec![Op::Push(0), Op::GetField { class: 0, field: 0 }, Op::Return],
        vec![Constant::Null],
    );
    null_field.classes = vec![counter_class()];
    assert_eq!(expect_fault(&null_field), VmError::NullReference);

    let out_of_range = main_only(
        vec![Op::Push(0), Op::NewArray(0), Op::Push(1), Op::GetElement, Op::Return],
        vec![Constant::Int(2), Constant::Int(5)],
    );
    assert_eq!(expect_fault(&out_of_range), VmError::IndexOutOfRange { index: 5, length: 2 });

    let negative = main_only(
        vec![Op::Push(0), Op::NewArray(0), Op::Return],
        vec![Constant::Int(-1)],
    );
    assert_eq!(expect_fault(&negative), VmError::NegativeArraySize(-1));
}

#[test]
fn test_out_of_memory_matches() {
    // 16-byte header + 4 elements fills the heap; the first array stays live
    let two_arrays = main_only(
        vec![Op::Push(0), Op::NewArray(0), Op::Push(0), Op::NewArray(0), Op::Return],
        vec![Constant::Int(4)],
    );
    assert_eq!(
        observe_limited(&two_arrays, Some(56)).0,
        Err(VmError::OutOfMemory { requested: 32 })
    );

    let huge = main_only(
        vec![Op::Push(0), Op::NewArray(0), Op::Return],
        vec![Constant::Int(i32::MAX)],
    );
    assert_eq!(
        observe_limited(&huge, Some(1 << 20)).0,
        Err(VmError::OutOfMemory { requested: i32::MAX as usize * 8 })
    );
}

#[test]
fn test_fault_in_callee_propagates() {
    let program = Program::new(
        vec![
            Function::new("main", vec![Op::Call { func: 1, argc: 0 }, Op::Push(0), Op::Return]),
            Function::new("boom", vec![Op::Push(0), Op::Push(1), Op::Div, Op::Return]),
        ],
        vec![Constant::Int(1), Constant::Int(0)],
    );
    assert_eq!(expect_fault(&program), VmError::DivideByZero);
}

// ===== Determinism and tiering =====

#[test]
fn test_traces_are_deterministic() {
    let program = factorial_program();
    let config = RuntimeConfig { trace_execution: true, ..RuntimeConfig::interpreter() };
    let first = Vm::new(config.clone()).run_program(&program).unwrap();
    let second = Vm::new(config).run_program(&program).unwrap();
    assert!(!first.trace.is_empty());
    assert_eq!(first.trace, second.trace);
}

#[test]
fn test_compiled_calls_are_traced() {
    if !JitCompiler::is_supported() {
        return;
    }
    let program = factorial_program();
    let config = RuntimeConfig { trace_execution: true, ..RuntimeConfig::eager_jit() };
    let outcome = Vm::new(config).run_program(&program).unwrap();
    let compiled_calls = outcome
        .trace
        .iter()
        .filter(|e| matches!(e, TraceEvent::Compiled { func: 1 }))
        .count();
    // fact(5) .. fact(1)
    assert_eq!(compiled_calls, 5);
}

#[test]
fn test_threshold_controls_compiled_set() {
    if !JitCompiler::is_supported() {
        return;
    }
    let program = factorial_program();
    let with_threshold = |threshold| RuntimeConfig {
        jit_mode: JitMode::On,
        jit_threshold: threshold,
        ..RuntimeConfig::default()
    };

    // fact is called 5 times, main once
    let cold = Vm::new(with_threshold(6)).run_program(&program).unwrap();
    assert!(cold.compiled_functions.is_empty());

    let warm = Vm::new(with_threshold(3)).run_program(&program).unwrap();
    assert_eq!(warm.compiled_functions, vec![1]);
    assert_eq!(warm.result, Value::from_i32(120));
}

#[test]
fn test_jit_off_never_compiles() {
    let outcome = Vm::new(RuntimeConfig::interpreter()).run_program(&factorial_program()).unwrap();
    assert!(outcome.compiled_functions.is_empty());
    assert_eq!(outcome.jit_compile_count, 0);
}

#[test]
fn test_forced_jit_on_unsupported_target_faults() {
    if JitCompiler::is_supported() {
        return;
    }
    let err = Vm::new(RuntimeConfig::eager_jit()).run_program(&factorial_program()).unwrap_err();
    assert!(matches!(err, VmError::Jit(_)));
}

// ===== Properties =====

fn scalar() -> impl Strategy<Value = Constant> {
    prop_oneof![
        any::<i32>().prop_map(Constant::Int),
        Just(Constant::Int(0)),
        any::<i64>().prop_map(Constant::Long),
        (-1.0e6f64..1.0e6).prop_map(Constant::Double),
        any::<bool>().prop_map(Constant::Bool),
        proptest::char::range('\0', '\u{7f}').prop_map(Constant::Char),
    ]
}

fn binary_op() -> impl Strategy<Value = Op> {
    prop::sample::select(vec![
        Op::Add,
        Op::Sub,
        Op::Mul,
        Op::Div,
        Op::Mod,
        Op::CmpEq,
        Op::CmpNe,
        Op::CmpLt,
        Op::CmpGt,
        Op::CmpLe,
        Op::CmpGe,
        Op::And,
        Op::Or,
    ])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_binary_ops_agree(a in scalar(), b in scalar(), op in binary_op()) {
        prop_assume!(JitCompiler::is_supported());
        let program = main_only(vec![Op::Push(0), Op::Push(1), op, Op::Return], vec![a, b]);
        let interpreted = run_with(RuntimeConfig::interpreter(), &program);
        let compiled = run_with(RuntimeConfig::eager_jit(), &program);
        prop_assert_eq!(interpreted, compiled);
    }

    #[test]
    fn prop_generated_functions_agree(items in prop::collection::vec(item(), 1..32)) {
        prop_assume!(JitCompiler::is_supported());
        let program = single_function(assemble(&items), pool());
        let interpreted = run_with(RuntimeConfig::interpreter(), &program);
        let compiled = run_with(RuntimeConfig::eager_jit(), &program);
        prop_assert_eq!(interpreted, compiled);
    }
}
