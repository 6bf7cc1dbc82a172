use std::fmt;

/// Handle to a heap object. Handle 0 is the null reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef(pub u64);

impl ObjRef {
    pub const NULL: ObjRef = ObjRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Runtime kind of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueKind {
    Null = 0,
    Int32 = 1,
    Int64 = 2,
    Float64 = 3,
    Bool = 4,
    Char = 5,
    ObjectRef = 6,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Int32 => "int",
            ValueKind::Int64 => "long",
            ValueKind::Float64 => "double",
            ValueKind::Bool => "bool",
            ValueKind::Char => "char",
            ValueKind::ObjectRef => "object",
        }
    }
}

/// A fixed-size tagged value: a kind plus a 64-bit raw payload.
///
/// Payload encodings:
/// - Int32: sign-extended to 64 bits
/// - Int64: two's complement
/// - Float64: IEEE 754 bits
/// - Bool: 0 or 1
/// - Char: Unicode scalar value
/// - ObjectRef: heap handle (0 is null)
///
/// Accessors reinterpret the payload without conversion. Callers pick the
/// accessor matching the kind, or go through `semantics` for promotion.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Value {
    kind: ValueKind,
    raw: u64,
}

impl Value {
    pub const fn null() -> Self {
        Self { kind: ValueKind::Null, raw: 0 }
    }

    pub const fn from_i32(v: i32) -> Self {
        Self { kind: ValueKind::Int32, raw: v as i64 as u64 }
    }

    pub const fn from_i64(v: i64) -> Self {
        Self { kind: ValueKind::Int64, raw: v as u64 }
    }

    pub fn from_f64(v: f64) -> Self {
        Self { kind: ValueKind::Float64, raw: v.to_bits() }
    }

    pub const fn from_bool(v: bool) -> Self {
        Self { kind: ValueKind::Bool, raw: v as u64 }
    }

    pub const fn from_char(v: char) -> Self {
        Self { kind: ValueKind::Char, raw: v as u64 }
    }

    pub const fn from_object_ref(r: ObjRef) -> Self {
        Self { kind: ValueKind::ObjectRef, raw: r.0 }
    }

    /// Build a value from a kind and a raw payload, as read back from memory.
    pub const fn from_raw(kind: ValueKind, raw: u64) -> Self {
        Self { kind, raw }
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    pub fn as_i32(&self) -> i32 {
        self.raw as u32 as i32
    }

    pub fn as_i64(&self) -> i64 {
        self.raw as i64
    }

    pub fn as_f64(&self) -> f64 {
        f64::from_bits(self.raw)
    }

    pub fn as_bool(&self) -> bool {
        self.raw != 0
    }

    pub fn as_char(&self) -> char {
        char::from_u32(self.raw as u32).unwrap_or(char::REPLACEMENT_CHARACTER)
    }

    pub fn as_object_ref(&self) -> ObjRef {
        ObjRef(self.raw)
    }

    pub fn is_null(&self) -> bool {
        self.kind == ValueKind::Null
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.kind, ValueKind::Int32 | ValueKind::Int64 | ValueKind::Float64)
    }

    pub fn is_object_ref(&self) -> bool {
        self.kind == ValueKind::ObjectRef
    }

    /// Non-null object handle carried by this value, if any.
    pub fn live_ref(&self) -> Option<ObjRef> {
        if self.kind == ValueKind::ObjectRef && self.raw != 0 {
            Some(ObjRef(self.raw))
        } else {
            None
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::null()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ValueKind::Null => write!(f, "Null"),
            ValueKind::Int32 => write!(f, "Int32({})", self.as_i32()),
            ValueKind::Int64 => write!(f, "Int64({})", self.as_i64()),
            ValueKind::Float64 => write!(f, "Float64({:?})", self.as_f64()),
            ValueKind::Bool => write!(f, "Bool({})", self.as_bool()),
            ValueKind::Char => write!(f, "Char({:?})", self.as_char()),
            ValueKind::ObjectRef => write!(f, "ObjectRef({:#x})", self.raw),
        }
    }
}

/// Canonical text of a value. Scalars use the form string concatenation
/// produces; object references print as an opaque handle.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ValueKind::Null => write!(f, "null"),
            ValueKind::Int32 => write!(f, "{}", self.as_i32()),
            ValueKind::Int64 => write!(f, "{}", self.as_i64()),
            ValueKind::Float64 => write!(f, "{}", format_f64(self.as_f64())),
            ValueKind::Bool => write!(f, "{}", if self.as_bool() { "true" } else { "false" }),
            ValueKind::Char => write!(f, "{}", self.as_char()),
            ValueKind::ObjectRef => write!(f, "<object {:#x}>", self.raw),
        }
    }
}

/// Shortest round-trip text of a double.
///
/// Integral values carry no fraction. Scientific notation (`1.5E+20`,
/// `1E-05`) kicks in when the decimal exponent is at least 15 or below -4.
pub fn format_f64(d: f64) -> String {
    if d.is_nan() {
        return "NaN".to_string();
    }
    if d.is_infinite() {
        return if d > 0.0 { "∞" } else { "-∞" }.to_string();
    }
    if d == 0.0 {
        return if d.is_sign_negative() { "-0" } else { "0" }.to_string();
    }

    // `{:e}` yields the shortest round-trip digits, e.g. "-1.25e-7"
    let sci = format!("{:e}", d);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();

    let mut out = String::from(sign);
    if !(-4..15).contains(&exp) {
        out.push_str(&digits[..1]);
        if digits.len() > 1 {
            out.push('.');
            out.push_str(&digits[1..]);
        }
        out.push('E');
        out.push(if exp < 0 { '-' } else { '+' });
        out.push_str(&format!("{:02}", exp.unsigned_abs()));
    } else if exp >= 0 {
        let int_len = exp as usize + 1;
        if digits.len() <= int_len {
            out.push_str(&digits);
            out.push_str(&"0".repeat(int_len - digits.len()));
        } else {
            out.push_str(&digits[..int_len]);
            out.push('.');
            out.push_str(&digits[int_len..]);
        }
    } else {
        out.push_str("0.");
        out.push_str(&"0".repeat((-exp - 1) as usize));
        out.push_str(&digits);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int32_is_sign_extended() {
        let v = Value::from_i32(-1);
        assert_eq!(v.kind(), ValueKind::Int32);
        assert_eq!(v.raw(), u64::MAX);
        assert_eq!(v.as_i32(), -1);
        assert_eq!(v.as_i64(), -1);
    }

    #[test]
    fn test_accessors_reinterpret_payload() {
        assert_eq!(Value::from_i64(i64::MIN).as_i64(), i64::MIN);
        assert_eq!(Value::from_f64(2.5).as_f64(), 2.5);
        assert!(Value::from_bool(true).as_bool());
        assert!(!Value::from_bool(false).as_bool());
        assert_eq!(Value::from_char('ж').as_char(), 'ж');
        assert_eq!(Value::from_object_ref(ObjRef(7)).as_object_ref(), ObjRef(7));
    }

    #[test]
    fn test_live_ref() {
        assert_eq!(Value::from_object_ref(ObjRef(3)).live_ref(), Some(ObjRef(3)));
        assert_eq!(Value::from_object_ref(ObjRef::NULL).live_ref(), None);
        assert_eq!(Value::null().live_ref(), None);
        assert_eq!(Value::from_i64(3).live_ref(), None);
    }

    #[test]
    fn test_raw_equality_for_refs_and_null() {
        assert_eq!(Value::null().raw(), Value::from_object_ref(ObjRef::NULL).raw());
        assert_ne!(
            Value::from_object_ref(ObjRef(1)).raw(),
            Value::from_object_ref(ObjRef(2)).raw()
        );
    }

    #[test]
    fn test_format_f64_plain() {
        assert_eq!(format_f64(3.0), "3");
        assert_eq!(format_f64(1.5), "1.5");
        assert_eq!(format_f64(-0.25), "-0.25");
        assert_eq!(format_f64(0.1), "0.1");
        assert_eq!(format_f64(123456789012345.6), "123456789012345.6");
        assert_eq!(format_f64(0.0001), "0.0001");
    }

    #[test]
    fn test_format_f64_scientific() {
        assert_eq!(format_f64(1e15), "1E+15");
        assert_eq!(format_f64(1.5e20), "1.5E+20");
        assert_eq!(format_f64(0.00001), "1E-05");
        assert_eq!(format_f64(-2.5e-7), "-2.5E-07");
    }

    #[test]
    fn test_format_f64_special() {
        assert_eq!(format_f64(f64::NAN), "NaN");
        assert_eq!(format_f64(f64::INFINITY), "∞");
        assert_eq!(format_f64(f64::NEG_INFINITY), "-∞");
        assert_eq!(format_f64(0.0), "0");
        assert_eq!(format_f64(-0.0), "-0");
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::from_i32(-42).to_string(), "-42");
        assert_eq!(Value::from_i64(1 << 40).to_string(), "1099511627776");
        assert_eq!(Value::from_bool(true).to_string(), "true");
        assert_eq!(Value::from_char('x').to_string(), "x");
        assert_eq!(Value::from_f64(2.0).to_string(), "2");
        assert_eq!(Value::null().to_string(), "null");
    }

    #[test]
    fn test_debug() {
        assert_eq!(format!("{:?}", Value::from_i32(30)), "Int32(30)");
        assert_eq!(format!("{:?}", Value::from_f64(1.5)), "Float64(1.5)");
    }
}
