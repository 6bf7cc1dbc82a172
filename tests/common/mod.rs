#![allow(dead_code)]

use proptest::prelude::*;
use skipper_vm::vm::{Constant, Function, Program, TypeRef, Variable};
use skipper_vm::{Op, RuntimeConfig, Value, Vm, VmError};

pub const LOCAL_SLOTS: usize = 4;

/// Pool shared by generated functions.
pub fn pool() -> Vec<Constant> {
    vec![
        Constant::Int(0),
        Constant::Int(1),
        Constant::Int(7),
        Constant::Int(-3),
        Constant::Long(3),
        Constant::Double(2.5),
        Constant::Double(-0.0),
        Constant::Bool(true),
        Constant::Bool(false),
        Constant::Char('a'),
    ]
}

pub fn int_locals() -> Vec<Variable> {
    (0..LOCAL_SLOTS).map(|i| Variable::new(format!("v{}", i), TypeRef::Int)).collect()
}

/// One generated instruction. Jumps only go forward, so every generated
/// function terminates.
#[derive(Debug, Clone)]
pub enum Item {
    Push(usize),
    Pop,
    Dup,
    Binary(Op),
    Load(usize),
    Store(usize),
    Branch { when: bool, skip: usize },
    Jump { skip: usize },
    Return,
}

pub fn item() -> impl Strategy<Value = Item> {
    let binary = prop::sample::select(vec![
        Op::Add,
        Op::Sub,
        Op::Mul,
        Op::Div,
        Op::Mod,
        Op::And,
        Op::Or,
        Op::CmpEq,
        Op::CmpNe,
        Op::CmpLt,
        Op::CmpGe,
    ]);
    prop_oneof![
        4 => (0..pool().len()).prop_map(Item::Push),
        1 => Just(Item::Pop),
        1 => Just(Item::Dup),
        3 => binary.prop_map(Item::Binary),
        1 => (0..LOCAL_SLOTS).prop_map(Item::Load),
        1 => (0..LOCAL_SLOTS).prop_map(Item::Store),
        2 => (any::<bool>(), 0..5usize).prop_map(|(when, skip)| Item::Branch { when, skip }),
        1 => (0..5usize).prop_map(|skip| Item::Jump { skip }),
        1 => Just(Item::Return),
    ]
}

pub fn assemble(items: &[Item]) -> Vec<Op> {
    let len = items.len();
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let forward = |skip: usize| (i + 1 + skip).min(len);
            match *item {
                Item::Push(k) => Op::Push(k),
                Item::Pop => Op::Pop,
                Item::Dup => Op::Dup,
                Item::Binary(op) => op,
                Item::Load(slot) => Op::LoadLocal { func: 0, slot },
                Item::Store(slot) => Op::StoreLocal { func: 0, slot },
                Item::Branch { when: true, skip } => Op::JumpIfTrue(forward(skip)),
                Item::Branch { when: false, skip } => Op::JumpIfFalse(forward(skip)),
                Item::Jump { skip } => Op::Jump(forward(skip)),
                Item::Return => Op::Return,
            }
        })
        .collect()
}

pub fn single_function(code: Vec<Op>, constants: Vec<Constant>) -> Program {
    Program::new(vec![Function::new("main", code).with_locals(int_locals())], constants)
}

pub fn run_with(config: RuntimeConfig, program: &Program) -> Result<Value, VmError> {
    Vm::new(config).run_program(program).map(|outcome| outcome.result)
}
