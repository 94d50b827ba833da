//! Compile error taxonomy.
use thiserror::Error;

/// Any way a shader compile can fail. Every error aborts the current
/// compile; the first failure encountered is the one reported.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShaderError {
    #[error("unsupported source opcode {opcode} at bytecode offset {offset}")]
    UnsupportedSourceOp { opcode: String, offset: usize },
    #[error("unsupported constant at bytecode offset {offset}: only float/int/bool are allowed")]
    UnsupportedConstant { offset: usize },
    #[error("shader argument `{0}` must be annotated with a resource triple")]
    UnannotatedArgument(String),
    #[error("bad resource annotation for `{name}`: {reason}")]
    BadResourceAnnotation { name: String, reason: String },
    #[error("{namespace} slot {slot} for `{name}` already taken by `{other}`")]
    DuplicateSlot {
        namespace: String,
        slot: String,
        name: String,
        other: String,
    },
    #[error("not a known builtin i/o variable: {0}")]
    UnknownBuiltin(String),
    #[error("unknown type name `{0}`")]
    UnknownType(String),
    #[error("abstract type `{0}` where a concrete type is required")]
    AbstractType(String),
    #[error("type mismatch: {0}")]
    TypeMismatch(String),
    #[error("invalid swizzle `{0}`")]
    InvalidSwizzle(String),
    #[error("cannot store to {0}")]
    IllegalStoreTarget(String),
    #[error("unresolved control flow: {0}")]
    UnresolvedControlFlow(String),
    #[error("unknown intrinsic `{0}`")]
    UnknownIntrinsic(String),
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("using unknown variable `{0}`")]
    UnknownName(String),
    #[error("malformed stack IR: {0}")]
    MalformedIr(String),
}

pub type Result<T> = std::result::Result<T, ShaderError>;
