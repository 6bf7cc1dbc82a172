//! Faults raised by the execution engine.
//!
//! There are two families:
//! - user-program faults (division by zero, null dereference, bad index,
//!   bad array size, heap exhaustion) that a well-formed image can hit
//! - internal-invariant faults that only a malformed image or an engine
//!   bug can produce
//!
//! Both tiers raise the same variants for the same program state.

/// Fault raised while loading or executing a program image.
#[derive(Debug, Clone, PartialEq)]
pub enum VmError {
    /// Integer division or modulo by zero
    DivideByZero,
    /// Field, element or method receiver access through a null reference
    NullReference,
    /// Array access outside `0..length`
    IndexOutOfRange { index: i32, length: usize },
    /// `NEW_ARRAY` with a negative length
    NegativeArraySize(i32),
    /// Allocation still failed after a collection
    OutOfMemory { requested: usize },

    UnknownFunction(usize),
    UnknownClass(usize),
    UnknownField { class: usize, field: usize },
    UnknownNative(usize),
    /// Pop or peek on an empty operand stack
    StackUnderflow,
    UnsupportedOpcode(String),
    MissingEntryPoint(String),
    InvalidConstant(usize),
    InvalidLocalSlot(usize),
    InvalidGlobalSlot(usize),
    /// Handle that does not name a live heap object
    InvalidReference(u64),
    /// Heap object of the wrong shape for the requested operation
    TypeMismatch { expected: &'static str, found: &'static str },
    MalformedInstruction { op: String, reason: String },
    InvalidImage(String),
    /// Native output could not be written
    Io(String),
    /// Native code generation failed
    Jit(String),
}

impl VmError {
    /// Whether the fault is one a well-formed program can raise at runtime.
    pub fn is_user_fault(&self) -> bool {
        matches!(
            self,
            VmError::DivideByZero
                | VmError::NullReference
                | VmError::IndexOutOfRange { .. }
                | VmError::NegativeArraySize(_)
                | VmError::OutOfMemory { .. }
        )
    }
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::DivideByZero => write!(f, "attempted to divide by zero"),
            VmError::NullReference => write!(f, "null reference"),
            VmError::IndexOutOfRange { index, length } => {
                write!(f, "index {} out of range for array of length {}", index, length)
            }
            VmError::NegativeArraySize(len) => {
                write!(f, "array size cannot be negative: {}", len)
            }
            VmError::OutOfMemory { requested } => {
                write!(f, "out of memory: heap full after collection ({} bytes requested)", requested)
            }
            VmError::UnknownFunction(id) => write!(f, "function id {} not found", id),
            VmError::UnknownClass(id) => write!(f, "class id {} not found", id),
            VmError::UnknownField { class, field } => {
                write!(f, "field id {} not found in class {}", field, class)
            }
            VmError::UnknownNative(id) => write!(f, "native function id {} not found", id),
            VmError::StackUnderflow => write!(f, "operand stack underflow"),
            VmError::UnsupportedOpcode(op) => write!(f, "unsupported opcode {}", op),
            VmError::MissingEntryPoint(name) => {
                write!(f, "entry point function '{}' not found", name)
            }
            VmError::InvalidConstant(idx) => write!(f, "constant index {} out of range", idx),
            VmError::InvalidLocalSlot(slot) => write!(f, "local slot {} out of range", slot),
            VmError::InvalidGlobalSlot(slot) => write!(f, "global slot {} out of range", slot),
            VmError::InvalidReference(raw) => write!(f, "invalid object reference {:#x}", raw),
            VmError::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {}, found {}", expected, found)
            }
            VmError::MalformedInstruction { op, reason } => {
                write!(f, "malformed {} instruction: {}", op, reason)
            }
            VmError::InvalidImage(msg) => write!(f, "invalid program image: {}", msg),
            VmError::Io(msg) => write!(f, "io error: {}", msg),
            VmError::Jit(msg) => write!(f, "jit compilation failed: {}", msg),
        }
    }
}

impl std::error::Error for VmError {}
