use serde::{Deserialize, Serialize};

use super::error::VmError;

/// Bytecode operations of the Skipper VM.
///
/// Operands are indices whose meaning depends on the opcode: constant-pool
/// index, local or global slot, absolute jump target, class/field/method id,
/// native id. Jump targets are absolute positions in the enclosing function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawInstruction", into = "RawInstruction")]
pub enum Op {
    // ========================================
    // Stack
    // ========================================
    Push(usize), // constant-pool index
    Pop,
    Dup,
    Swap,

    // ========================================
    // Variables
    // ========================================
    /// `func` names the declaring function and is informational only.
    LoadLocal { func: usize, slot: usize },
    StoreLocal { func: usize, slot: usize },
    LoadGlobal(usize),
    StoreGlobal(usize),

    // ========================================
    // Arithmetic (numeric promotion, wrapping)
    // ========================================
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,

    // ========================================
    // Comparison
    // ========================================
    CmpEq,
    CmpNe,
    CmpLt,
    CmpGt,
    CmpLe,
    CmpGe,

    // ========================================
    // Logic
    // ========================================
    And,
    Or,
    Not,

    // ========================================
    // Control flow
    // ========================================
    Jump(usize),
    JumpIfTrue(usize),
    JumpIfFalse(usize),
    Return,

    // ========================================
    // Calls
    // ========================================
    Call { func: usize, argc: usize },
    /// `method` is the function id of the method body.
    CallMethod { class: usize, method: usize },
    CallNative(usize),

    // ========================================
    // Objects and arrays
    // ========================================
    NewObject(usize), // class id
    NewArray(usize),  // element type id, length popped from the stack
    GetField { class: usize, field: usize },
    SetField { class: usize, field: usize },
    GetElement,
    SetElement,
}

impl Op {
    /// Opcode mnemonic as written in program images.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Push(_) => "PUSH",
            Op::Pop => "POP",
            Op::Dup => "DUP",
            Op::Swap => "SWAP",
            Op::LoadLocal { .. } => "LOAD_LOCAL",
            Op::StoreLocal { .. } => "STORE_LOCAL",
            Op::LoadGlobal(_) => "LOAD_GLOBAL",
            Op::StoreGlobal(_) => "STORE_GLOBAL",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mul => "MUL",
            Op::Div => "DIV",
            Op::Mod => "MOD",
            Op::Neg => "NEG",
            Op::CmpEq => "CMP_EQ",
            Op::CmpNe => "CMP_NE",
            Op::CmpLt => "CMP_LT",
            Op::CmpGt => "CMP_GT",
            Op::CmpLe => "CMP_LE",
            Op::CmpGe => "CMP_GE",
            Op::And => "AND",
            Op::Or => "OR",
            Op::Not => "NOT",
            Op::Jump(_) => "JUMP",
            Op::JumpIfTrue(_) => "JUMP_IF_TRUE",
            Op::JumpIfFalse(_) => "JUMP_IF_FALSE",
            Op::Return => "RETURN",
            Op::Call { .. } => "CALL",
            Op::CallMethod { .. } => "CALL_METHOD",
            Op::CallNative(_) => "CALL_NATIVE",
            Op::NewObject(_) => "NEW_OBJECT",
            Op::NewArray(_) => "NEW_ARRAY",
            Op::GetField { .. } => "GET_FIELD",
            Op::SetField { .. } => "SET_FIELD",
            Op::GetElement => "GET_ELEMENT",
            Op::SetElement => "SET_ELEMENT",
        }
    }

    /// Operands in image order.
    pub fn operands(&self) -> Vec<usize> {
        match *self {
            Op::Push(a)
            | Op::LoadGlobal(a)
            | Op::StoreGlobal(a)
            | Op::Jump(a)
            | Op::JumpIfTrue(a)
            | Op::JumpIfFalse(a)
            | Op::CallNative(a)
            | Op::NewObject(a)
            | Op::NewArray(a) => vec![a],
            Op::LoadLocal { func, slot } | Op::StoreLocal { func, slot } => vec![func, slot],
            Op::Call { func, argc } => vec![func, argc],
            Op::CallMethod { class, method } => vec![class, method],
            Op::GetField { class, field } | Op::SetField { class, field } => vec![class, field],
            _ => Vec::new(),
        }
    }

    /// Jump target of `JUMP`, `JUMP_IF_TRUE` or `JUMP_IF_FALSE`.
    pub fn jump_target(&self) -> Option<usize> {
        match *self {
            Op::Jump(t) | Op::JumpIfTrue(t) | Op::JumpIfFalse(t) => Some(t),
            _ => None,
        }
    }

    /// Same jump with a new target. Non-jumps are returned unchanged.
    pub fn with_jump_target(self, target: usize) -> Op {
        match self {
            Op::Jump(_) => Op::Jump(target),
            Op::JumpIfTrue(_) => Op::JumpIfTrue(target),
            Op::JumpIfFalse(_) => Op::JumpIfFalse(target),
            other => other,
        }
    }

    pub fn is_jump(&self) -> bool {
        self.jump_target().is_some()
    }

    pub fn is_conditional_jump(&self) -> bool {
        matches!(self, Op::JumpIfTrue(_) | Op::JumpIfFalse(_))
    }

    pub fn is_compare(&self) -> bool {
        matches!(
            self,
            Op::CmpEq | Op::CmpNe | Op::CmpLt | Op::CmpGt | Op::CmpLe | Op::CmpGe
        )
    }

    /// Whether control never falls through to the next instruction.
    pub fn ends_block(&self) -> bool {
        matches!(self, Op::Jump(_) | Op::Return)
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())?;
        for operand in self.operands() {
            write!(f, " {}", operand)?;
        }
        Ok(())
    }
}

/// Wire form of an instruction: `{"op": "LOAD_LOCAL", "args": [0, 1]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawInstruction {
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<i64>,
}

impl From<Op> for RawInstruction {
    fn from(op: Op) -> Self {
        RawInstruction {
            op: op.name().to_string(),
            args: op.operands().into_iter().map(|a| a as i64).collect(),
        }
    }
}

impl TryFrom<RawInstruction> for Op {
    type Error = VmError;

    fn try_from(raw: RawInstruction) -> Result<Self, Self::Error> {
        let arity = match raw.op.as_str() {
            "POP" | "DUP" | "SWAP" | "ADD" | "SUB" | "MUL" | "DIV" | "MOD" | "NEG" | "CMP_EQ"
            | "CMP_NE" | "CMP_LT" | "CMP_GT" | "CMP_LE" | "CMP_GE" | "AND" | "OR" | "NOT"
            | "RETURN" | "GET_ELEMENT" | "SET_ELEMENT" => 0,
            "PUSH" | "LOAD_GLOBAL" | "STORE_GLOBAL" | "JUMP" | "JUMP_IF_TRUE"
            | "JUMP_IF_FALSE" | "CALL_NATIVE" | "NEW_OBJECT" | "NEW_ARRAY" => 1,
            "LOAD_LOCAL" | "STORE_LOCAL" | "CALL" | "CALL_METHOD" | "GET_FIELD" | "SET_FIELD" => 2,
            _ => return Err(VmError::UnsupportedOpcode(raw.op)),
        };

        if raw.args.len() != arity {
            return Err(VmError::MalformedInstruction {
                reason: format!("expected {} operands, got {}", arity, raw.args.len()),
                op: raw.op,
            });
        }

        let mut args = Vec::with_capacity(arity);
        for &arg in &raw.args {
            let arg = usize::try_from(arg).map_err(|_| VmError::MalformedInstruction {
                op: raw.op.clone(),
                reason: format!("operand {} is negative", arg),
            })?;
            args.push(arg);
        }

        let op = match raw.op.as_str() {
            "PUSH" => Op::Push(args[0]),
            "POP" => Op::Pop,
            "DUP" => Op::Dup,
            "SWAP" => Op::Swap,
            "LOAD_LOCAL" => Op::LoadLocal { func: args[0], slot: args[1] },
            "STORE_LOCAL" => Op::StoreLocal { func: args[0], slot: args[1] },
            "LOAD_GLOBAL" => Op::LoadGlobal(args[0]),
            "STORE_GLOBAL" => Op::StoreGlobal(args[0]),
            "ADD" => Op::Add,
            "SUB" => Op::Sub,
            "MUL" => Op::Mul,
            "DIV" => Op::Div,
            "MOD" => Op::Mod,
            "NEG" => Op::Neg,
            "CMP_EQ" => Op::CmpEq,
            "CMP_NE" => Op::CmpNe,
            "CMP_LT" => Op::CmpLt,
            "CMP_GT" => Op::CmpGt,
            "CMP_LE" => Op::CmpLe,
            "CMP_GE" => Op::CmpGe,
            "AND" => Op::And,
            "OR" => Op::Or,
            "NOT" => Op::Not,
            "JUMP" => Op::Jump(args[0]),
            "JUMP_IF_TRUE" => Op::JumpIfTrue(args[0]),
            "JUMP_IF_FALSE" => Op::JumpIfFalse(args[0]),
            "RETURN" => Op::Return,
            "CALL" => Op::Call { func: args[0], argc: args[1] },
            "CALL_METHOD" => Op::CallMethod { class: args[0], method: args[1] },
            "CALL_NATIVE" => Op::CallNative(args[0]),
            "NEW_OBJECT" => Op::NewObject(args[0]),
            "NEW_ARRAY" => Op::NewArray(args[0]),
            "GET_FIELD" => Op::GetField { class: args[0], field: args[1] },
            "SET_FIELD" => Op::SetField { class: args[0], field: args[1] },
            "GET_ELEMENT" => Op::GetElement,
            "SET_ELEMENT" => Op::SetElement,
            _ => return Err(VmError::UnsupportedOpcode(raw.op)),
        };
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(op: &str, args: &[i64]) -> RawInstruction {
        RawInstruction { op: op.to_string(), args: args.to_vec() }
    }

    #[test]
    fn test_decode_instructions() {
        assert_eq!(Op::try_from(raw("PUSH", &[3])).unwrap(), Op::Push(3));
        assert_eq!(
            Op::try_from(raw("STORE_LOCAL", &[0, 2])).unwrap(),
            Op::StoreLocal { func: 0, slot: 2 }
        );
        assert_eq!(Op::try_from(raw("RETURN", &[])).unwrap(), Op::Return);
    }

    #[test]
    fn test_unknown_opcode_is_unsupported() {
        let err = Op::try_from(raw("FROBNICATE", &[])).unwrap_err();
        assert!(matches!(err, VmError::UnsupportedOpcode(name) if name == "FROBNICATE"));
    }

    #[test]
    fn test_wrong_arity_is_malformed() {
        let err = Op::try_from(raw("JUMP", &[])).unwrap_err();
        assert!(matches!(err, VmError::MalformedInstruction { .. }));

        let err = Op::try_from(raw("ADD", &[1])).unwrap_err();
        assert!(matches!(err, VmError::MalformedInstruction { .. }));
    }

    #[test]
    fn test_negative_operand_is_malformed() {
        let err = Op::try_from(raw("PUSH", &[-1])).unwrap_err();
        assert!(matches!(err, VmError::MalformedInstruction { .. }));
    }

    #[test]
    fn test_json_form() {
        let op: Op = serde_json::from_str(r#"{"op":"CALL","args":[4,2]}"#).unwrap();
        assert_eq!(op, Op::Call { func: 4, argc: 2 });
        assert_eq!(serde_json::to_string(&Op::Dup).unwrap(), r#"{"op":"DUP"}"#);
    }

    #[test]
    fn test_jump_helpers() {
        assert_eq!(Op::JumpIfFalse(7).jump_target(), Some(7));
        assert_eq!(Op::JumpIfFalse(7).with_jump_target(2), Op::JumpIfFalse(2));
        assert_eq!(Op::Add.with_jump_target(2), Op::Add);
        assert!(Op::Jump(0).ends_block());
        assert!(Op::Return.ends_block());
        assert!(!Op::JumpIfTrue(0).ends_block());
    }

    #[test]
    fn test_display() {
        assert_eq!(Op::LoadLocal { func: 1, slot: 3 }.to_string(), "LOAD_LOCAL 1 3");
        assert_eq!(Op::Neg.to_string(), "NEG");
    }
}
