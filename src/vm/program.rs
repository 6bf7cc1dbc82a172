//! Program image: functions, classes, constant pool and globals.
//!
//! The image is read-only while a program runs. Optimizer passes may append
//! to the constant pool but never renumber existing entries.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::error::VmError;
use super::ops::{Op, RawInstruction};
use super::value::Value;

/// Declared type of a local, parameter, global or field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TypeRef {
    Int,
    Long,
    Double,
    Bool,
    Char,
    String,
    Void,
    Class(String),
    Array(Box<TypeRef>),
}

impl TypeRef {
    pub fn parse(text: &str) -> TypeRef {
        let text = text.trim();
        if let Some(element) = text.strip_suffix("[]") {
            return TypeRef::Array(Box::new(TypeRef::parse(element)));
        }
        match text {
            "int" => TypeRef::Int,
            "long" => TypeRef::Long,
            "double" => TypeRef::Double,
            "bool" => TypeRef::Bool,
            "char" => TypeRef::Char,
            "string" => TypeRef::String,
            "void" => TypeRef::Void,
            name => TypeRef::Class(name.to_string()),
        }
    }

    /// Whether values of this type live in the raw payload rather than the heap.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            TypeRef::Int | TypeRef::Long | TypeRef::Double | TypeRef::Bool | TypeRef::Char
        )
    }
}

impl From<String> for TypeRef {
    fn from(text: String) -> Self {
        TypeRef::parse(&text)
    }
}

impl From<TypeRef> for String {
    fn from(ty: TypeRef) -> Self {
        ty.to_string()
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeRef::Int => write!(f, "int"),
            TypeRef::Long => write!(f, "long"),
            TypeRef::Double => write!(f, "double"),
            TypeRef::Bool => write!(f, "bool"),
            TypeRef::Char => write!(f, "char"),
            TypeRef::String => write!(f, "string"),
            TypeRef::Void => write!(f, "void"),
            TypeRef::Class(name) => write!(f, "{}", name),
            TypeRef::Array(element) => write!(f, "{}[]", element),
        }
    }
}

/// Constant-pool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Constant {
    Null,
    Int(i32),
    Long(i64),
    Double(f64),
    Bool(bool),
    Char(char),
    String(String),
}

impl Constant {
    /// Scalar value of this constant. Strings need a heap allocation and
    /// return `None`.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            Constant::Null => Some(Value::null()),
            Constant::Int(v) => Some(Value::from_i32(*v)),
            Constant::Long(v) => Some(Value::from_i64(*v)),
            Constant::Double(v) => Some(Value::from_f64(*v)),
            Constant::Bool(v) => Some(Value::from_bool(*v)),
            Constant::Char(v) => Some(Value::from_char(*v)),
            Constant::String(_) => None,
        }
    }

    /// Constant holding a scalar value. Object references have no constant form.
    pub fn from_value(value: Value) -> Option<Constant> {
        use super::value::ValueKind;

        match value.kind() {
            ValueKind::Null => Some(Constant::Null),
            ValueKind::Int32 => Some(Constant::Int(value.as_i32())),
            ValueKind::Int64 => Some(Constant::Long(value.as_i64())),
            ValueKind::Float64 => Some(Constant::Double(value.as_f64())),
            ValueKind::Bool => Some(Constant::Bool(value.as_bool())),
            ValueKind::Char => Some(Constant::Char(value.as_char())),
            ValueKind::ObjectRef => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Constant::Null => "null",
            Constant::Int(_) => "int",
            Constant::Long(_) => "long",
            Constant::Double(_) => "double",
            Constant::Bool(_) => "bool",
            Constant::Char(_) => "char",
            Constant::String(_) => "string",
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::String(s) => write!(f, "{:?}", s),
            Constant::Char(c) => write!(f, "{:?}", c),
            other => match other.to_value() {
                Some(v) => write!(f, "{}", v),
                None => Ok(()),
            },
        }
    }
}

/// A named, typed slot: parameter, local, global or field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeRef,
}

impl Variable {
    pub fn new(name: impl Into<String>, ty: TypeRef) -> Self {
        Self { name: name.into(), ty }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Function {
    pub name: String,
    pub params: Vec<Variable>,
    /// Declared type of each local slot, indexed by slot.
    pub locals: Vec<Variable>,
    pub return_type: TypeRef,
    pub code: Vec<Op>,
}

impl Function {
    pub fn new(name: impl Into<String>, code: Vec<Op>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            locals: Vec::new(),
            return_type: TypeRef::Void,
            code,
        }
    }

    pub fn with_params(mut self, params: Vec<Variable>) -> Self {
        self.params = params;
        self
    }

    pub fn with_locals(mut self, locals: Vec<Variable>) -> Self {
        self.locals = locals;
        self
    }

    pub fn with_return_type(mut self, ty: TypeRef) -> Self {
        self.return_type = ty;
        self
    }

    /// Declared type of local slot `slot`, if the image declares one.
    pub fn local_type(&self, slot: usize) -> Option<&TypeRef> {
        self.locals.get(slot).map(|v| &v.ty)
    }

    /// Numbered instruction listing, one instruction per line.
    pub fn listing(&self) -> String {
        let mut out = String::new();
        for (i, op) in self.code.iter().enumerate() {
            out.push_str(&format!("{:4}: {}\n", i, op));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Class {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<Variable>,
    /// Method name to function id.
    #[serde(default)]
    pub methods: BTreeMap<String, usize>,
}

fn default_entry() -> String {
    "main".to_string()
}

/// An executable program image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Program {
    pub entry: String,
    pub constants: Vec<Constant>,
    pub globals: Vec<Variable>,
    pub classes: Vec<Class>,
    pub functions: Vec<Function>,
}

impl Program {
    pub fn new(functions: Vec<Function>, constants: Vec<Constant>) -> Self {
        Self {
            entry: default_entry(),
            constants,
            globals: Vec::new(),
            classes: Vec::new(),
            functions,
        }
    }

    pub fn from_json(text: &str) -> Result<Program, VmError> {
        let raw: RawProgram =
            serde_json::from_str(text).map_err(|e| VmError::InvalidImage(e.to_string()))?;
        Program::try_from(raw)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Program, VmError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| VmError::InvalidImage(format!("{}: {}", path.display(), e)))?;
        Program::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, VmError> {
        serde_json::to_string_pretty(self).map_err(|e| VmError::InvalidImage(e.to_string()))
    }

    pub fn function(&self, id: usize) -> Result<&Function, VmError> {
        self.functions.get(id).ok_or(VmError::UnknownFunction(id))
    }

    pub fn class(&self, id: usize) -> Result<&Class, VmError> {
        self.classes.get(id).ok_or(VmError::UnknownClass(id))
    }

    pub fn field(&self, class_id: usize, field_id: usize) -> Result<&Variable, VmError> {
        self.class(class_id)?
            .fields
            .get(field_id)
            .ok_or(VmError::UnknownField { class: class_id, field: field_id })
    }

    pub fn constant(&self, index: usize) -> Result<&Constant, VmError> {
        self.constants.get(index).ok_or(VmError::InvalidConstant(index))
    }

    pub fn function_id(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    pub fn entry_function(&self) -> Result<usize, VmError> {
        self.function_id(&self.entry)
            .ok_or_else(|| VmError::MissingEntryPoint(self.entry.clone()))
    }
}

// Wire form. Instructions stay raw until conversion so decode faults keep
// their own variants instead of being flattened into a JSON error.

#[derive(Deserialize)]
struct RawFunction {
    name: String,
    #[serde(default)]
    params: Vec<Variable>,
    #[serde(default)]
    locals: Vec<Variable>,
    #[serde(default = "void_type")]
    return_type: TypeRef,
    #[serde(default)]
    code: Vec<RawInstruction>,
}

fn void_type() -> TypeRef {
    TypeRef::Void
}

#[derive(Deserialize)]
struct RawProgram {
    #[serde(default = "default_entry")]
    entry: String,
    #[serde(default)]
    constants: Vec<Constant>,
    #[serde(default)]
    globals: Vec<Variable>,
    #[serde(default)]
    classes: Vec<Class>,
    #[serde(default)]
    functions: Vec<RawFunction>,
}

impl TryFrom<RawProgram> for Program {
    type Error = VmError;

    fn try_from(raw: RawProgram) -> Result<Self, Self::Error> {
        let functions = raw
            .functions
            .into_iter()
            .map(|f| {
                let code = f
                    .code
                    .into_iter()
                    .map(Op::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Function {
                    name: f.name,
                    params: f.params,
                    locals: f.locals,
                    return_type: f.return_type,
                    code,
                })
            })
            .collect::<Result<Vec<_>, VmError>>()?;

        Ok(Program {
            entry: raw.entry,
            constants: raw.constants,
            globals: raw.globals,
            classes: raw.classes,
            functions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IMAGE: &str = r#"{
        "constants": [{"type":"int","value":10}, {"type":"string","value":"hi"}, {"type":"null"}],
        "globals": [{"name":"g","type":"long"}],
        "classes": [{"name":"Point","fields":[{"name":"x","type":"int"}],"methods":{"len":1}}],
        "functions": [
            {"name":"main","return_type":"int",
             "code":[{"op":"PUSH","args":[0]},{"op":"RETURN"}]},
            {"name":"Point.len","params":[{"name":"self","type":"Point"}],
             "locals":[{"name":"xs","type":"int[][]"}],"code":[]}
        ]
    }"#;

    #[test]
    fn test_load_image() {
        let program = Program::from_json(IMAGE).unwrap();
        assert_eq!(program.entry, "main");
        assert_eq!(program.constants[0], Constant::Int(10));
        assert_eq!(program.constants[1], Constant::String("hi".to_string()));
        assert_eq!(program.constants[2], Constant::Null);
        assert_eq!(program.globals[0].ty, TypeRef::Long);
        assert_eq!(program.classes[0].methods["len"], 1);
        assert_eq!(program.functions[0].code, vec![Op::Push(0), Op::Return]);
        assert_eq!(
            program.functions[1].locals[0].ty,
            TypeRef::Array(Box::new(TypeRef::Array(Box::new(TypeRef::Int))))
        );
        assert_eq!(program.entry_function().unwrap(), 0);
    }

    #[test]
    fn test_unknown_opcode_keeps_its_variant() {
        let err = Program::from_json(
            r#"{"functions":[{"name":"main","code":[{"op":"HALT"}]}]}"#,
        )
        .unwrap_err();
        assert_eq!(err, VmError::UnsupportedOpcode("HALT".to_string()));
    }

    #[test]
    fn test_bad_json_is_invalid_image() {
        let err = Program::from_json("{ not json").unwrap_err();
        assert!(matches!(err, VmError::InvalidImage(_)));
    }

    #[test]
    fn test_missing_entry_point() {
        let mut program = Program::new(vec![Function::new("helper", vec![])], vec![]);
        program.entry = "start".to_string();
        assert_eq!(
            program.entry_function().unwrap_err(),
            VmError::MissingEntryPoint("start".to_string())
        );
    }

    #[test]
    fn test_json_round_trip_keeps_code() {
        let program = Program::from_json(IMAGE).unwrap();
        let reloaded = Program::from_json(&program.to_json().unwrap()).unwrap();
        assert_eq!(program, reloaded);
    }

    #[test]
    fn test_type_display() {
        assert_eq!(TypeRef::parse("Point[]").to_string(), "Point[]");
        assert!(TypeRef::Char.is_primitive());
        assert!(!TypeRef::String.is_primitive());
    }

    #[test]
    fn test_lookups_fail_with_typed_faults() {
        let program = Program::from_json(IMAGE).unwrap();
        assert_eq!(program.function(9).unwrap_err(), VmError::UnknownFunction(9));
        assert_eq!(program.class(3).unwrap_err(), VmError::UnknownClass(3));
        assert_eq!(
            program.field(0, 4).unwrap_err(),
            VmError::UnknownField { class: 0, field: 4 }
        );
        assert_eq!(program.constant(7).unwrap_err(), VmError::InvalidConstant(7));
    }
}
