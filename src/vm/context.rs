//! Per-run execution state shared by the interpreter and compiled code.
//!
//! The context owns the operand stack, the active locals, the globals and
//! the call-frame stack. Every instruction-level action lives here so both
//! tiers run exactly the same code for the same opcode.

use tracing::trace;

use crate::jit::JitCompiler;

use super::error::VmError;
use super::interpreter;
use super::ops::Op;
use super::program::{Constant, Program};
use super::runtime::{RootProvider, Runtime, SLOT_SIZE, StackAccess};
use super::semantics::{self, ArithOp, CompareOp};
use super::tiering::{Tier, TieringController};
use super::value::{ObjRef, Value};

/// Minimum size of a locals array.
pub const MIN_LOCAL_SLOTS: usize = 64;

const INITIAL_STACK_CAPACITY: usize = 256;

// =============================================================================
// Operand stack
// =============================================================================

#[derive(Debug)]
pub struct OperandStack {
    values: Vec<Value>,
}

impl OperandStack {
    pub fn new() -> Self {
        Self { values: Vec::with_capacity(INITIAL_STACK_CAPACITY) }
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.values
    }

    fn truncate(&mut self, len: usize) {
        self.values.truncate(len);
    }
}

impl Default for OperandStack {
    fn default() -> Self {
        Self::new()
    }
}

impl StackAccess for OperandStack {
    fn push(&mut self, value: Value) {
        self.values.push(value);
    }

    fn pop(&mut self) -> Result<Value, VmError> {
        self.values.pop().ok_or(VmError::StackUnderflow)
    }

    fn peek(&self) -> Result<Value, VmError> {
        self.values.last().copied().ok_or(VmError::StackUnderflow)
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

/// Saved state of a suspended caller.
#[derive(Debug)]
struct CallFrame {
    func: usize,
    locals: Vec<Value>,
}

/// One entry of the execution trace.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    Step { func: usize, ip: usize, op: Op },
    Compiled { func: usize },
}

/// Fail on a null reference, otherwise return the handle.
pub fn check_not_null(value: Value) -> Result<ObjRef, VmError> {
    if value.is_null() || (value.is_object_ref() && value.raw() == 0) {
        return Err(VmError::NullReference);
    }
    Ok(value.as_object_ref())
}

// =============================================================================
// ExecutionContext
// =============================================================================

pub struct ExecutionContext<'a> {
    program: &'a Program,
    runtime: &'a mut dyn Runtime,
    stack: OperandStack,
    current: Option<usize>,
    locals: Vec<Value>,
    globals: Vec<Value>,
    frames: Vec<CallFrame>,
    tiering: TieringController,
    jit: JitCompiler,
    trace_execution: bool,
    trace: Vec<TraceEvent>,
    /// Fault raised inside a compiled routine, picked up after it returns
    pending_fault: Option<VmError>,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        program: &'a Program,
        runtime: &'a mut dyn Runtime,
        tiering: TieringController,
    ) -> Self {
        Self {
            program,
            runtime,
            stack: OperandStack::new(),
            current: None,
            locals: Vec::new(),
            globals: vec![Value::null(); program.globals.len()],
            frames: Vec::new(),
            tiering,
            jit: JitCompiler::new(),
            trace_execution: false,
            trace: Vec::new(),
            pending_fault: None,
        }
    }

    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.trace_execution = enabled;
        self
    }

    pub fn program(&self) -> &'a Program {
        self.program
    }

    pub fn runtime(&self) -> &dyn Runtime {
        &*self.runtime
    }

    pub fn tiering(&self) -> &TieringController {
        &self.tiering
    }

    pub fn jit(&self) -> &JitCompiler {
        &self.jit
    }

    pub fn stack(&self) -> &OperandStack {
        &self.stack
    }

    pub fn globals(&self) -> &[Value] {
        &self.globals
    }

    pub fn take_trace(&mut self) -> Vec<TraceEvent> {
        std::mem::take(&mut self.trace)
    }

    pub fn call_depth(&self) -> usize {
        self.frames.len() + self.current.is_some() as usize
    }

    // ===== Stack =====

    pub fn push_stack(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop_stack(&mut self) -> Result<Value, VmError> {
        self.stack.pop()
    }

    pub fn peek_stack(&self) -> Result<Value, VmError> {
        self.stack.peek()
    }

    /// `POP`: discard the top value if there is one.
    pub fn discard(&mut self) {
        let _ = self.stack.pop();
    }

    pub fn dup(&mut self) -> Result<(), VmError> {
        let top = self.stack.peek()?;
        self.stack.push(top);
        Ok(())
    }

    pub fn swap(&mut self) -> Result<(), VmError> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        self.stack.push(b);
        self.stack.push(a);
        Ok(())
    }

    /// Pop a branch condition.
    pub fn pop_condition(&mut self) -> Result<bool, VmError> {
        Ok(self.stack.pop()?.as_bool())
    }

    // ===== Variables =====

    pub fn push_constant(&mut self, index: usize) -> Result<(), VmError> {
        let program = self.program;
        let value = match program.constant(index)? {
            Constant::String(text) => {
                let r = self.with_collect_retry(|rt| rt.allocate_string(text))?;
                Value::from_object_ref(r)
            }
            scalar => scalar.to_value().unwrap_or_default(),
        };
        self.stack.push(value);
        Ok(())
    }

    pub fn load_local(&self, slot: usize) -> Result<Value, VmError> {
        self.locals.get(slot).copied().ok_or(VmError::InvalidLocalSlot(slot))
    }

    /// Store into the active locals, coercing to the slot's declared type.
    pub fn store_local(&mut self, slot: usize, value: Value) -> Result<(), VmError> {
        let declared = self
            .current
            .and_then(|id| self.program.functions.get(id))
            .and_then(|f| f.local_type(slot));
        let value = match declared {
            Some(ty) => semantics::coerce_to_type(ty, value),
            None => value,
        };
        let target = self.locals.get_mut(slot).ok_or(VmError::InvalidLocalSlot(slot))?;
        *target = value;
        Ok(())
    }

    pub fn load_global(&self, slot: usize) -> Result<Value, VmError> {
        self.globals.get(slot).copied().ok_or(VmError::InvalidGlobalSlot(slot))
    }

    pub fn store_global(&mut self, slot: usize, value: Value) -> Result<(), VmError> {
        let descriptor = self.program.globals.get(slot).ok_or(VmError::InvalidGlobalSlot(slot))?;
        let value = semantics::coerce_to_type(&descriptor.ty, value);
        let target = self.globals.get_mut(slot).ok_or(VmError::InvalidGlobalSlot(slot))?;
        *target = value;
        Ok(())
    }

    // ===== Arithmetic, comparison, logic =====

    /// Pop b, pop a, push `a op b`. Division checks its divisor before
    /// touching the dividend.
    pub fn arithmetic(&mut self, op: ArithOp) -> Result<(), VmError> {
        let b = self.stack.pop()?;
        if matches!(op, ArithOp::Div | ArithOp::Mod) && semantics::is_integer_zero(b) {
            return Err(VmError::DivideByZero);
        }
        let a = self.stack.pop()?;

        if op == ArithOp::Add {
            let string_operands = (a.is_object_ref() && (b.is_object_ref() || semantics::is_concat_scalar(b)))
                || (semantics::is_concat_scalar(a) && b.is_object_ref());
            if string_operands {
                let joined = self.concat(a, b)?;
                self.stack.push(joined);
                return Ok(());
            }
        }

        let result = semantics::arithmetic(op, a, b)?;
        self.stack.push(result);
        Ok(())
    }

    pub fn compare(&mut self, op: CompareOp) -> Result<(), VmError> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        self.stack.push(Value::from_bool(semantics::compare(op, a, b)));
        Ok(())
    }

    pub fn negate(&mut self) -> Result<(), VmError> {
        let v = self.stack.pop()?;
        self.stack.push(semantics::negate(v));
        Ok(())
    }

    pub fn logical_and(&mut self) -> Result<(), VmError> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        self.stack.push(semantics::logical_and(a, b));
        Ok(())
    }

    pub fn logical_or(&mut self) -> Result<(), VmError> {
        let b = self.stack.pop()?;
        let a = self.stack.pop()?;
        self.stack.push(semantics::logical_or(a, b));
        Ok(())
    }

    pub fn logical_not(&mut self) -> Result<(), VmError> {
        let v = self.stack.pop()?;
        self.stack.push(semantics::logical_not(v));
        Ok(())
    }

    /// String `ADD`. Scalar operands are formatted and allocated first.
    fn concat(&mut self, a: Value, b: Value) -> Result<Value, VmError> {
        // operands stay on the stack while allocating so a collection keeps them
        let base = self.stack.len();
        self.stack.push(a);
        self.stack.push(b);
        let result = self.concat_rooted(a, b);
        self.stack.truncate(base);
        result.map(Value::from_object_ref)
    }

    fn concat_rooted(&mut self, a: Value, b: Value) -> Result<ObjRef, VmError> {
        let left = self.as_string_ref(a)?;
        let right = self.as_string_ref(b)?;
        self.with_collect_retry(|rt| rt.concat_strings(left, right))
    }

    fn as_string_ref(&mut self, v: Value) -> Result<ObjRef, VmError> {
        if v.is_object_ref() {
            return Ok(v.as_object_ref());
        }
        let text = v.to_string();
        let r = self.with_collect_retry(|rt| rt.allocate_string(&text))?;
        self.stack.push(Value::from_object_ref(r));
        Ok(r)
    }

    // ===== Objects and arrays =====

    pub fn new_object(&mut self, class_id: usize) -> Result<(), VmError> {
        let class = self.program.class(class_id)?;
        let payload = class.fields.len() * SLOT_SIZE;
        self.ensure_capacity(payload)?;
        let r = self.runtime.allocate_object(payload, class_id)?;
        self.stack.push(Value::from_object_ref(r));
        Ok(())
    }

    pub fn new_array(&mut self) -> Result<(), VmError> {
        let length = self.stack.pop()?.as_i32();
        if length < 0 {
            return Err(VmError::NegativeArraySize(length));
        }
        let length = length as usize;
        self.ensure_capacity(length * SLOT_SIZE)?;
        let r = self.runtime.allocate_array(length)?;
        self.stack.push(Value::from_object_ref(r));
        Ok(())
    }

    pub fn get_field(&mut self, class_id: usize, field_id: usize) -> Result<(), VmError> {
        let obj = check_not_null(self.stack.pop()?)?;
        let field = self.program.field(class_id, field_id)?;
        let raw = self.runtime.read_field(obj, field_id)?;
        let value = if field.ty.is_primitive() {
            semantics::reinterpret_as(&field.ty, raw)
        } else {
            raw
        };
        self.stack.push(value);
        Ok(())
    }

    pub fn set_field(&mut self, class_id: usize, field_id: usize) -> Result<(), VmError> {
        let value = self.stack.pop()?;
        let obj = check_not_null(self.stack.pop()?)?;
        let field = self.program.field(class_id, field_id)?;
        let value = semantics::coerce_to_type(&field.ty, value);
        self.runtime.write_field(obj, field_id, value)
    }

    pub fn get_element(&mut self) -> Result<(), VmError> {
        let index = self.stack.pop()?.as_i32();
        let arr = check_not_null(self.stack.pop()?)?;
        let value = self.runtime.read_element(arr, index)?;
        self.stack.push(value);
        Ok(())
    }

    pub fn set_element(&mut self) -> Result<(), VmError> {
        let value = self.stack.pop()?;
        let index = self.stack.pop()?.as_i32();
        let arr = check_not_null(self.stack.pop()?)?;
        self.runtime.write_element(arr, index, value)
    }

    // ===== Allocation =====

    /// Make room for `size` payload bytes, collecting once if needed.
    fn ensure_capacity(&mut self, size: usize) -> Result<(), VmError> {
        if self.runtime.can_allocate(size) {
            return Ok(());
        }
        self.collect_garbage();
        if self.runtime.can_allocate(size) {
            Ok(())
        } else {
            Err(VmError::OutOfMemory { requested: size })
        }
    }

    fn with_collect_retry<T>(
        &mut self,
        mut allocate: impl FnMut(&mut dyn Runtime) -> Result<T, VmError>,
    ) -> Result<T, VmError> {
        match allocate(&mut *self.runtime) {
            Err(VmError::OutOfMemory { .. }) => {
                self.collect_garbage();
                allocate(&mut *self.runtime)
            }
            other => other,
        }
    }

    pub fn collect_garbage(&mut self) {
        let roots = self.collect_roots();
        self.runtime.collect(&roots);
    }

    // ===== Calls =====

    pub fn call_function(&mut self, func_id: usize) -> Result<(), VmError> {
        self.invoke(func_id, false)
    }

    /// Call a method body. `method_id` is the function id of the body; the
    /// receiver sits below the arguments on the stack.
    pub fn call_method(&mut self, class_id: usize, method_id: usize) -> Result<(), VmError> {
        self.program.class(class_id)?;
        self.invoke(method_id, true)
    }

    pub fn call_native(&mut self, native_id: usize) -> Result<(), VmError> {
        self.runtime.invoke_native(native_id, &mut self.stack)
    }

    fn invoke(&mut self, func_id: usize, has_receiver: bool) -> Result<(), VmError> {
        let func = self.program.function(func_id)?;
        let offset = has_receiver as usize;
        let size = (offset + func.params.len() + func.locals.len()).max(MIN_LOCAL_SLOTS);
        let mut locals = vec![Value::null(); size];

        for (i, param) in func.params.iter().enumerate().rev() {
            let arg = self.stack.pop()?;
            locals[offset + i] = semantics::coerce_to_type(&param.ty, arg);
        }
        if has_receiver {
            let receiver = self.stack.pop()?;
            check_not_null(receiver)?;
            locals[0] = receiver;
        }

        self.enter_function_frame(func_id, locals);
        let result = self.dispatch(func_id);
        self.exit_function_frame();
        result
    }

    pub fn enter_function_frame(&mut self, func_id: usize, locals: Vec<Value>) {
        if let Some(caller) = self.current {
            let saved = std::mem::replace(&mut self.locals, locals);
            self.frames.push(CallFrame { func: caller, locals: saved });
        } else {
            self.locals = locals;
        }
        self.current = Some(func_id);
    }

    pub fn exit_function_frame(&mut self) {
        match self.frames.pop() {
            Some(frame) => {
                self.current = Some(frame.func);
                self.locals = frame.locals;
            }
            None => {
                self.current = None;
                self.locals = Vec::new();
            }
        }
    }

    fn dispatch(&mut self, func_id: usize) -> Result<(), VmError> {
        let program = self.program;
        match self.tiering.on_call(func_id) {
            Tier::Interpret => interpreter::execute(self, func_id),
            Tier::Compile => {
                self.jit.compile(func_id, program)?;
                self.tiering.mark_compiled(func_id);
                self.run_compiled(func_id)
            }
            Tier::Compiled => self.run_compiled(func_id),
        }
    }

    fn run_compiled(&mut self, func_id: usize) -> Result<(), VmError> {
        let routine = self
            .jit
            .routine(func_id)
            .ok_or_else(|| VmError::Jit(format!("no compiled routine for function {}", func_id)))?;
        if self.trace_execution {
            trace!(func = func_id, "compiled call");
            self.trace.push(TraceEvent::Compiled { func: func_id });
        }
        routine.invoke(self)
    }

    // ===== Tracing and faults =====

    pub(crate) fn trace_step(&mut self, func: usize, ip: usize, op: Op) {
        if self.trace_execution {
            trace!(func, ip, op = %op, "step");
            self.trace.push(TraceEvent::Step { func, ip, op });
        }
    }

    pub(crate) fn set_pending_fault(&mut self, fault: VmError) {
        self.pending_fault = Some(fault);
    }

    pub(crate) fn take_pending_fault(&mut self) -> Option<VmError> {
        self.pending_fault.take()
    }
}

impl RootProvider for ExecutionContext<'_> {
    fn visit_roots(&self, visit: &mut dyn FnMut(ObjRef)) {
        let frames = self.frames.iter().flat_map(|f| f.locals.iter());
        self.stack
            .as_slice()
            .iter()
            .chain(self.locals.iter())
            .chain(frames)
            .chain(self.globals.iter())
            .filter_map(|v| v.live_ref())
            .for_each(|r| visit(r));
    }
}
