//! Contract between the execution engine and the heap/native runtime.

use super::error::VmError;
use super::value::{ObjRef, Value};

/// Payload bytes per object field or array element.
pub const SLOT_SIZE: usize = 8;

/// Operand-stack view handed to native functions.
pub trait StackAccess {
    fn push(&mut self, value: Value);
    fn pop(&mut self) -> Result<Value, VmError>;
    fn peek(&self) -> Result<Value, VmError>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Source of GC roots.
pub trait RootProvider {
    /// Call `visit` once for every non-null object reference held by the
    /// engine: operand stack, active locals, suspended frames and globals.
    fn visit_roots(&self, visit: &mut dyn FnMut(ObjRef));

    fn collect_roots(&self) -> Vec<ObjRef> {
        let mut roots = Vec::new();
        self.visit_roots(&mut |r| roots.push(r));
        roots
    }
}

/// Heap, collector and native functions as seen by the engine.
///
/// Sizes are byte payloads. The engine checks `can_allocate` before object
/// and array allocations and collects once before giving up.
pub trait Runtime {
    fn can_allocate(&self, size: usize) -> bool;

    fn allocate_object(&mut self, payload_size: usize, class_id: usize) -> Result<ObjRef, VmError>;
    fn allocate_array(&mut self, length: usize) -> Result<ObjRef, VmError>;
    fn allocate_string(&mut self, text: &str) -> Result<ObjRef, VmError>;
    fn concat_strings(&mut self, a: ObjRef, b: ObjRef) -> Result<ObjRef, VmError>;

    fn read_field(&self, obj: ObjRef, field: usize) -> Result<Value, VmError>;
    fn write_field(&mut self, obj: ObjRef, field: usize, value: Value) -> Result<(), VmError>;

    /// Bounds-checked element read. Raises `IndexOutOfRange`.
    fn read_element(&self, arr: ObjRef, index: i32) -> Result<Value, VmError>;
    /// Bounds-checked element write. Raises `IndexOutOfRange`.
    fn write_element(&mut self, arr: ObjRef, index: i32, value: Value) -> Result<(), VmError>;

    /// Reclaim everything not reachable from `roots`.
    fn collect(&mut self, roots: &[ObjRef]);

    fn invoke_native(&mut self, id: usize, stack: &mut dyn StackAccess) -> Result<(), VmError>;

    /// Text of a value for display. Runtimes that own strings print them
    /// as their contents.
    fn describe(&self, value: Value) -> String {
        value.to_string()
    }
}
