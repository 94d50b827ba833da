//! The front-end input contract: the pieces of a CPython 3.7 code object
//! the walker consumes, delivered as plain data.
use num_derive::FromPrimitive;

use shadec_core::sir::Slot;

/// The stack opcodes the walker recognizes, with their CPython 3.7
/// numbering. Instructions are two bytes: opcode, immediate argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
pub enum SrcOp {
    PopTop = 1,
    RotTwo = 2,
    DupTop = 4,
    UnaryPositive = 10,
    UnaryNegative = 11,
    UnaryNot = 12,
    BinaryPower = 19,
    BinaryMultiply = 20,
    BinaryModulo = 22,
    BinaryAdd = 23,
    BinarySubtract = 24,
    BinarySubscr = 25,
    BinaryTrueDivide = 27,
    StoreSubscr = 60,
    GetIter = 68,
    BreakLoop = 80,
    ReturnValue = 83,
    PopBlock = 87,
    ForIter = 93,
    StoreAttr = 95,
    LoadConst = 100,
    BuildTuple = 102,
    BuildList = 103,
    BuildMap = 105,
    LoadAttr = 106,
    CompareOp = 107,
    JumpForward = 110,
    JumpIfFalseOrPop = 111,
    JumpIfTrueOrPop = 112,
    JumpAbsolute = 113,
    PopJumpIfFalse = 114,
    PopJumpIfTrue = 115,
    LoadGlobal = 116,
    ContinueLoop = 119,
    SetupLoop = 120,
    LoadFast = 124,
    StoreFast = 125,
    CallFunction = 131,
    LoadDeref = 136,
    BuildConstKeyMap = 156,
    LoadMethod = 160,
    CallMethod = 161,
}

/// The relational operators of the source `COMPARE_OP` table, by index.
/// Anything past `>=` (identity, containment, exception matching) is
/// rejected.
pub const COMPARE_OPS: [&str; 6] = ["<", "<=", "==", "!=", ">", ">="];

/// An entry of the source constant pool.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolConst {
    /// The source `None` singleton; only legal as the implicit return
    /// value.
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// Kept so docstrings can sit in the pool unreferenced; loading one is
    /// an error.
    Str(String),
}

/// The `(kind, slot, subtype)` annotation attached to one shader
/// argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgAnnotation {
    /// `input`, `output`, `uniform`, `buffer`, `sampler` or `texture`.
    pub kind: String,
    pub slot: Slot,
    /// The type name, resolved by the type registry.
    pub type_name: String,
}

/// Everything the front-end needs from one source function.
#[derive(Debug, Clone, Default)]
pub struct FnBytecode {
    /// Raw bytecode: pairs of (opcode byte, argument byte).
    pub code: Vec<u8>,
    pub consts: Vec<PoolConst>,
    /// Local variable names; the first `argcount` are the arguments.
    pub varnames: Vec<String>,
    /// Non-local names referenced by the code.
    pub names: Vec<String>,
    /// Closure variable names; must be empty.
    pub freevars: Vec<String>,
    pub argcount: usize,
    /// Annotation per argument name.
    pub annotations: Vec<(String, ArgAnnotation)>,
}
impl FnBytecode {
    pub fn annotation(&self, name: &str) -> Option<&ArgAnnotation> {
        self.annotations
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a)
    }
}
