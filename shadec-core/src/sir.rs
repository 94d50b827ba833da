//! The stack intermediate representation: a closed, platform-neutral
//! instruction set produced by the front-end and executed by the back-end.
//!
//! Programs serialize to a line-oriented text form: one instruction per
//! line, encoded as the fields of a JSON array without the enclosing
//! brackets. The text form round-trips losslessly.
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use ordered_float::OrderedFloat;
use serde_json::{json, Value};

use crate::error::{Result, ShaderError};

/// Branch target. Labels originate as source bytecode addresses; loop
/// reconstruction adds synthetic labels which may be negative.
pub type Label = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    Geometry,
}
impl ShaderStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Fragment => "fragment",
            Self::Compute => "compute",
            Self::Geometry => "geometry",
        }
    }
}
impl FromStr for ShaderStage {
    type Err = ShaderError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "vertex" => Ok(Self::Vertex),
            "fragment" => Ok(Self::Fragment),
            "compute" => Ok(Self::Compute),
            "geometry" => Ok(Self::Geometry),
            _ => Err(ShaderError::MalformedIr(format!(
                "unknown shader stage `{}`",
                s
            ))),
        }
    }
}
impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Input,
    Output,
    Uniform,
    Buffer,
    Sampler,
    Texture,
}
impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Uniform => "uniform",
            Self::Buffer => "buffer",
            Self::Sampler => "sampler",
            Self::Texture => "texture",
        }
    }
}
impl FromStr for ResourceKind {
    type Err = ShaderError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "input" => Ok(Self::Input),
            "output" => Ok(Self::Output),
            "uniform" => Ok(Self::Uniform),
            "buffer" => Ok(Self::Buffer),
            "sampler" => Ok(Self::Sampler),
            "texture" => Ok(Self::Texture),
            _ => Err(ShaderError::MalformedIr(format!(
                "unknown resource kind `{}`",
                s
            ))),
        }
    }
}
impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a resource binds: a location/binding index, a
/// `(bind group, binding)` pair, or a named builtin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Slot {
    Index(u32),
    Pair(u32, u32),
    Builtin(String),
}

/// A compile-time constant as it appears in the source constant pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstValue {
    Bool(bool),
    Int(i64),
    Float(OrderedFloat<f64>),
}
impl ConstValue {
    pub fn float(x: f64) -> Self {
        ConstValue::Float(OrderedFloat(x))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    And,
    Or,
}
impl BinOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Mod => "mod",
            Self::Pow => "pow",
            Self::And => "and",
            Self::Or => "or",
        }
    }
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(Self::Add),
            "sub" => Ok(Self::Sub),
            "mul" => Ok(Self::Mul),
            "div" => Ok(Self::Div),
            "mod" => Ok(Self::Mod),
            "pow" => Ok(Self::Pow),
            "and" => Ok(Self::And),
            "or" => Ok(Self::Or),
            _ => Err(ShaderError::MalformedIr(format!(
                "unknown binary op `{}`",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    Not,
}
impl UnOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Neg => "neg",
            Self::Not => "not",
        }
    }
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "neg" => Ok(Self::Neg),
            "not" => Ok(Self::Not),
            _ => Err(ShaderError::MalformedIr(format!("unknown unary op `{}`", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}
impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
        }
    }
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            "==" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            _ => Err(ShaderError::MalformedIr(format!(
                "unknown compare op `{}`",
                s
            ))),
        }
    }
}

/// One stack-IR instruction. The set is closed: the text form rejects
/// anything else.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    EntryPoint {
        name: String,
        stage: ShaderStage,
        exec_modes: BTreeMap<String, Vec<u32>>,
    },
    FuncEnd,
    Call {
        nargs: u32,
    },
    Return,
    Resource {
        name: String,
        kind: ResourceKind,
        slot: Slot,
        type_name: String,
    },
    LoadName(String),
    StoreName(String),
    LoadIndex,
    StoreIndex,
    LoadAttr(String),
    LoadConst(ConstValue),
    LoadArray {
        nargs: u32,
    },
    BinaryOp(BinOp),
    UnaryOp(UnOp),
    Compare(CmpOp),
    Select,
    PopTop,
    DupTop,
    RotTwo,
    Label(Label),
    Branch(Label),
    BranchConditional {
        true_label: Label,
        false_label: Label,
    },
    BranchLoop {
        iter_label: Label,
        continue_label: Label,
        merge_label: Label,
    },
}

impl Instr {
    /// True for instructions that end a basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Instr::Branch(_) | Instr::BranchConditional { .. } | Instr::BranchLoop { .. }
        )
    }
}

/// Serialize a program to its line-oriented text form.
pub fn serialize(prog: &[Instr]) -> String {
    let mut out = String::new();
    for instr in prog {
        let line = instr_to_json(instr).to_string();
        // Drop the enclosing array brackets; the line itself is the record.
        out.push_str(&line[1..line.len() - 1]);
        out.push('\n');
    }
    out
}

fn instr_to_json(instr: &Instr) -> Value {
    match instr {
        Instr::EntryPoint {
            name,
            stage,
            exec_modes,
        } => {
            json!(["entrypoint", name, stage.as_str(), exec_modes])
        }
        Instr::FuncEnd => json!(["func_end"]),
        Instr::Call { nargs } => json!(["call", nargs]),
        Instr::Return => json!(["return"]),
        Instr::Resource {
            name,
            kind,
            slot,
            type_name,
        } => {
            let slot = match slot {
                Slot::Index(i) => json!(i),
                Slot::Pair(g, b) => json!([g, b]),
                Slot::Builtin(s) => json!(s),
            };
            json!(["resource", name, kind.as_str(), slot, type_name])
        }
        Instr::LoadName(name) => json!(["load_name", name]),
        Instr::StoreName(name) => json!(["store_name", name]),
        Instr::LoadIndex => json!(["load_index"]),
        Instr::StoreIndex => json!(["store_index"]),
        Instr::LoadAttr(name) => json!(["load_attr", name]),
        Instr::LoadConst(value) => {
            let value = match value {
                ConstValue::Bool(b) => json!(b),
                ConstValue::Int(i) => json!(i),
                ConstValue::Float(f) => json!(f.into_inner()),
            };
            json!(["load_constant", value])
        }
        Instr::LoadArray { nargs } => json!(["load_array", nargs]),
        Instr::BinaryOp(op) => json!(["binary_op", op.as_str()]),
        Instr::UnaryOp(op) => json!(["unary_op", op.as_str()]),
        Instr::Compare(op) => json!(["compare", op.as_str()]),
        Instr::Select => json!(["select"]),
        Instr::PopTop => json!(["pop_top"]),
        Instr::DupTop => json!(["dup_top"]),
        Instr::RotTwo => json!(["rot_two"]),
        Instr::Label(l) => json!(["label", l]),
        Instr::Branch(l) => json!(["branch", l]),
        Instr::BranchConditional {
            true_label,
            false_label,
        } => json!(["branch_conditional", true_label, false_label]),
        Instr::BranchLoop {
            iter_label,
            continue_label,
            merge_label,
        } => json!(["branch_loop", iter_label, continue_label, merge_label]),
    }
}

/// Parse the text form back into a program.
pub fn parse(text: &str) -> Result<Vec<Instr>> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Value = serde_json::from_str(&format!("[{}]", line))
            .map_err(|e| ShaderError::MalformedIr(format!("{}: {}", e, line)))?;
        let fields = match fields {
            Value::Array(fields) => fields,
            _ => return Err(ShaderError::MalformedIr(line.to_string())),
        };
        out.push(instr_from_json(&fields, line)?);
    }
    Ok(out)
}

fn instr_from_json(fields: &[Value], line: &str) -> Result<Instr> {
    let bad = || ShaderError::MalformedIr(line.to_string());
    let opcode = fields.get(0).and_then(Value::as_str).ok_or_else(bad)?;
    let arg_str = |i: usize| -> Result<String> {
        fields
            .get(i)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(bad)
    };
    let arg_u32 = |i: usize| -> Result<u32> {
        fields
            .get(i)
            .and_then(Value::as_u64)
            .map(|x| x as u32)
            .ok_or_else(bad)
    };
    let arg_label = |i: usize| -> Result<Label> {
        fields
            .get(i)
            .and_then(Value::as_i64)
            .map(|x| x as Label)
            .ok_or_else(bad)
    };
    let instr = match opcode {
        "entrypoint" => {
            let mut exec_modes = BTreeMap::new();
            if let Some(Value::Object(map)) = fields.get(3) {
                for (key, args) in map {
                    let args = args
                        .as_array()
                        .ok_or_else(bad)?
                        .iter()
                        .map(|x| x.as_u64().map(|v| v as u32).ok_or_else(bad))
                        .collect::<Result<Vec<u32>>>()?;
                    exec_modes.insert(key.clone(), args);
                }
            } else {
                return Err(bad());
            }
            Instr::EntryPoint {
                name: arg_str(1)?,
                stage: arg_str(2)?.parse()?,
                exec_modes,
            }
        }
        "func_end" => Instr::FuncEnd,
        "call" => Instr::Call { nargs: arg_u32(1)? },
        "return" => Instr::Return,
        "resource" => {
            let slot = match fields.get(3).ok_or_else(bad)? {
                Value::Number(n) => Slot::Index(n.as_u64().ok_or_else(bad)? as u32),
                Value::String(s) => Slot::Builtin(s.clone()),
                Value::Array(pair) if pair.len() == 2 => {
                    let g = pair[0].as_u64().ok_or_else(bad)? as u32;
                    let b = pair[1].as_u64().ok_or_else(bad)? as u32;
                    Slot::Pair(g, b)
                }
                _ => return Err(bad()),
            };
            Instr::Resource {
                name: arg_str(1)?,
                kind: arg_str(2)?.parse()?,
                slot,
                type_name: arg_str(4)?,
            }
        }
        "load_name" => Instr::LoadName(arg_str(1)?),
        "store_name" => Instr::StoreName(arg_str(1)?),
        "load_index" => Instr::LoadIndex,
        "store_index" => Instr::StoreIndex,
        "load_attr" => Instr::LoadAttr(arg_str(1)?),
        "load_constant" => {
            let value = match fields.get(1).ok_or_else(bad)? {
                Value::Bool(b) => ConstValue::Bool(*b),
                Value::Number(n) if n.is_i64() => ConstValue::Int(n.as_i64().unwrap_or(0)),
                Value::Number(n) => ConstValue::float(n.as_f64().ok_or_else(bad)?),
                _ => return Err(bad()),
            };
            Instr::LoadConst(value)
        }
        "load_array" => Instr::LoadArray { nargs: arg_u32(1)? },
        "binary_op" => Instr::BinaryOp(BinOp::from_str(&arg_str(1)?)?),
        "unary_op" => Instr::UnaryOp(UnOp::from_str(&arg_str(1)?)?),
        "compare" => Instr::Compare(CmpOp::from_str(&arg_str(1)?)?),
        "select" => Instr::Select,
        "pop_top" => Instr::PopTop,
        "dup_top" => Instr::DupTop,
        "rot_two" => Instr::RotTwo,
        "label" => Instr::Label(arg_label(1)?),
        "branch" => Instr::Branch(arg_label(1)?),
        "branch_conditional" => Instr::BranchConditional {
            true_label: arg_label(1)?,
            false_label: arg_label(2)?,
        },
        "branch_loop" => Instr::BranchLoop {
            iter_label: arg_label(1)?,
            continue_label: arg_label(2)?,
            merge_label: arg_label(3)?,
        },
        other => {
            return Err(ShaderError::MalformedIr(format!(
                "unknown opcode `{}`",
                other
            )))
        }
    };
    Ok(instr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_program() -> Vec<Instr> {
        let mut exec_modes = BTreeMap::new();
        exec_modes.insert("LocalSize".to_string(), vec![1, 1, 1]);
        vec![
            Instr::EntryPoint {
                name: "main".to_string(),
                stage: ShaderStage::Compute,
                exec_modes,
            },
            Instr::Resource {
                name: "input.index".to_string(),
                kind: ResourceKind::Input,
                slot: Slot::Builtin("GlobalInvocationId".to_string()),
                type_name: "i32".to_string(),
            },
            Instr::Resource {
                name: "buffer.data".to_string(),
                kind: ResourceKind::Buffer,
                slot: Slot::Pair(0, 1),
                type_name: "Array(f32)".to_string(),
            },
            Instr::LoadName("buffer.data".to_string()),
            Instr::LoadConst(ConstValue::Int(0)),
            Instr::LoadIndex,
            Instr::LoadConst(ConstValue::float(0.5)),
            Instr::BinaryOp(BinOp::Mul),
            Instr::StoreName("x".to_string()),
            Instr::LoadConst(ConstValue::Bool(true)),
            Instr::BranchConditional {
                true_label: 10,
                false_label: 20,
            },
            Instr::Label(10),
            Instr::Branch(20),
            Instr::Label(20),
            Instr::BranchLoop {
                iter_label: -1,
                continue_label: 30,
                merge_label: 40,
            },
            Instr::Return,
            Instr::FuncEnd,
        ]
    }

    #[test]
    fn text_form_round_trips() {
        let prog = sample_program();
        let text = serialize(&prog);
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed, prog);
        // A second round through the printer is bit-identical.
        assert_eq!(serialize(&parsed), text);
    }

    #[test]
    fn text_form_is_line_oriented_json() {
        let prog = vec![Instr::LoadConst(ConstValue::float(0.5))];
        assert_eq!(serialize(&prog), "\"load_constant\",0.5\n");
    }

    #[test]
    fn parse_rejects_unknown_opcodes() {
        match parse("\"warp_drive\",1") {
            Err(ShaderError::MalformedIr(msg)) => assert!(msg.contains("warp_drive")),
            other => panic!("expected MalformedIr, got {:?}", other),
        }
    }

    #[test]
    fn parse_skips_blank_lines() {
        let parsed = parse("\n\"pop_top\"\n\n\"dup_top\"\n").unwrap();
        assert_eq!(parsed, vec![Instr::PopTop, Instr::DupTop]);
    }

    #[test]
    fn int_and_float_constants_stay_distinct() {
        let prog = vec![
            Instr::LoadConst(ConstValue::Int(2)),
            Instr::LoadConst(ConstValue::float(2.0)),
        ];
        let parsed = parse(&serialize(&prog)).unwrap();
        assert_eq!(parsed, prog);
    }
}
