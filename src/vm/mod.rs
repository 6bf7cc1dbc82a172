mod context;
mod error;
mod heap;
pub mod interpreter;
mod machine;
mod ops;
mod program;
mod runtime;
pub mod semantics;
mod tiering;
mod value;

pub use context::{ExecutionContext, MIN_LOCAL_SLOTS, OperandStack, TraceEvent, check_not_null};
pub use error::VmError;
pub use heap::{GcStats, HEADER_SIZE, Heap, HeapObject, OutputBuffer, natives};
pub use machine::{RunOutcome, Vm};
pub use ops::{Op, RawInstruction};
pub use program::{Class, Constant, Function, Program, TypeRef, Variable};
pub use runtime::{RootProvider, Runtime, SLOT_SIZE, StackAccess};
pub use tiering::{Tier, TieringController};
pub use value::{ObjRef, Value, ValueKind, format_f64};
