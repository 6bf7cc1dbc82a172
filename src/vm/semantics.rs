//! Value-level operations shared by the interpreter, the JIT helpers and the
//! constant folder.
//!
//! Numeric promotion: if either operand is Float64 the operation runs in f64,
//! else if either is Int64 it runs in i64, else in i32. Bool and Char take
//! part through their raw payload. Integer arithmetic wraps.

use std::cmp::Ordering;

use super::error::VmError;
use super::program::TypeRef;
use super::value::{Value, ValueKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    F64,
    I64,
    I32,
}

fn width(a: Value, b: Value) -> Width {
    if a.kind() == ValueKind::Float64 || b.kind() == ValueKind::Float64 {
        Width::F64
    } else if a.kind() == ValueKind::Int64 || b.kind() == ValueKind::Int64 {
        Width::I64
    } else {
        Width::I32
    }
}

pub fn to_f64(v: Value) -> f64 {
    match v.kind() {
        ValueKind::Float64 => v.as_f64(),
        ValueKind::Int64 => v.as_i64() as f64,
        _ => v.as_i32() as f64,
    }
}

pub fn to_i64(v: Value) -> i64 {
    match v.kind() {
        ValueKind::Float64 => v.as_f64() as i64,
        ValueKind::Int64 => v.as_i64(),
        _ => v.as_i32() as i64,
    }
}

/// Int32 or Int64 zero. Bool and Char zeros are caught after promotion.
pub fn is_integer_zero(v: Value) -> bool {
    matches!(v.kind(), ValueKind::Int32 | ValueKind::Int64) && v.raw() == 0
}

/// `a op b` with numeric promotion.
///
/// Division and modulo by an integer zero fail before promotion. A float
/// divisor of zero follows IEEE.
pub fn arithmetic(op: ArithOp, a: Value, b: Value) -> Result<Value, VmError> {
    let divides = matches!(op, ArithOp::Div | ArithOp::Mod);
    if divides && is_integer_zero(b) {
        return Err(VmError::DivideByZero);
    }

    match width(a, b) {
        Width::F64 => {
            let (x, y) = (to_f64(a), to_f64(b));
            let r = match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
                ArithOp::Mul => x * y,
                ArithOp::Div => x / y,
                ArithOp::Mod => x % y,
            };
            Ok(Value::from_f64(r))
        }
        Width::I64 => {
            let (x, y) = (to_i64(a), to_i64(b));
            // bool/char divisors reach here with a zero payload
            if divides && y == 0 {
                return Err(VmError::DivideByZero);
            }
            let r = match op {
                ArithOp::Add => x.wrapping_add(y),
                ArithOp::Sub => x.wrapping_sub(y),
                ArithOp::Mul => x.wrapping_mul(y),
                ArithOp::Div => x.wrapping_div(y),
                ArithOp::Mod => x.wrapping_rem(y),
            };
            Ok(Value::from_i64(r))
        }
        Width::I32 => {
            let (x, y) = (a.as_i32(), b.as_i32());
            if divides && y == 0 {
                return Err(VmError::DivideByZero);
            }
            let r = match op {
                ArithOp::Add => x.wrapping_add(y),
                ArithOp::Sub => x.wrapping_sub(y),
                ArithOp::Mul => x.wrapping_mul(y),
                ArithOp::Div => x.wrapping_div(y),
                ArithOp::Mod => x.wrapping_rem(y),
            };
            Ok(Value::from_i32(r))
        }
    }
}

pub fn negate(v: Value) -> Value {
    match v.kind() {
        ValueKind::Float64 => Value::from_f64(-v.as_f64()),
        ValueKind::Int64 => Value::from_i64(v.as_i64().wrapping_neg()),
        _ => Value::from_i32(v.as_i32().wrapping_neg()),
    }
}

/// Total order over promoted numerics. NaN sorts below every number and
/// equals itself; `-0.0` equals `0.0`.
pub fn compare_numeric(a: Value, b: Value) -> Ordering {
    match width(a, b) {
        Width::F64 => {
            let (x, y) = (to_f64(a), to_f64(b));
            match x.partial_cmp(&y) {
                Some(ord) => ord,
                None => match (x.is_nan(), y.is_nan()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Less,
                    _ => Ordering::Greater,
                },
            }
        }
        Width::I64 => to_i64(a).cmp(&to_i64(b)),
        Width::I32 => a.as_i32().cmp(&b.as_i32()),
    }
}

/// Equality compares numerically when both sides are numeric and by raw
/// payload otherwise. Ordering always compares numerically.
pub fn compare(op: CompareOp, a: Value, b: Value) -> bool {
    match op {
        CompareOp::Eq => values_equal(a, b),
        CompareOp::Ne => !values_equal(a, b),
        CompareOp::Lt => compare_numeric(a, b) == Ordering::Less,
        CompareOp::Gt => compare_numeric(a, b) == Ordering::Greater,
        CompareOp::Le => compare_numeric(a, b) != Ordering::Greater,
        CompareOp::Ge => compare_numeric(a, b) != Ordering::Less,
    }
}

fn values_equal(a: Value, b: Value) -> bool {
    if a.is_numeric() && b.is_numeric() {
        compare_numeric(a, b) == Ordering::Equal
    } else {
        a.raw() == b.raw()
    }
}

pub fn logical_and(a: Value, b: Value) -> Value {
    Value::from_bool(a.as_bool() && b.as_bool())
}

pub fn logical_or(a: Value, b: Value) -> Value {
    Value::from_bool(a.as_bool() || b.as_bool())
}

pub fn logical_not(v: Value) -> Value {
    Value::from_bool(!v.as_bool())
}

/// Scalars that `ADD` formats when the other operand is a string.
pub fn is_concat_scalar(v: Value) -> bool {
    matches!(
        v.kind(),
        ValueKind::Int32 | ValueKind::Int64 | ValueKind::Float64 | ValueKind::Bool | ValueKind::Char
    )
}

/// Coerce a value stored into a slot of declared type `ty`.
pub fn coerce_to_type(ty: &TypeRef, v: Value) -> Value {
    if *ty == TypeRef::Long && v.kind() == ValueKind::Int32 {
        return Value::from_i64(v.as_i32() as i64);
    }
    v
}

/// Reread a stored payload as the declared primitive type of its field.
pub fn reinterpret_as(ty: &TypeRef, v: Value) -> Value {
    match ty {
        TypeRef::Double => Value::from_raw(ValueKind::Float64, v.raw()),
        TypeRef::Long => Value::from_raw(ValueKind::Int64, v.raw()),
        TypeRef::Int => Value::from_i32(v.as_i32()),
        TypeRef::Bool => Value::from_bool(v.raw() != 0),
        TypeRef::Char => Value::from_char(v.as_char()),
        _ => v,
    }
}
