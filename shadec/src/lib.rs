//! shadec compiles a restricted subset of a dynamic scripting language,
//! delivered as annotated stack bytecode, into binary SPIR-V modules.
//!
//! The pipeline has two stages. The front-end walks the source bytecode
//! and reconstructs structured control flow into a platform-neutral stack
//! IR ([`shadec_core::sir`]). The back-end executes that IR on a symbolic
//! stack machine and emits a SPIR-V module.
pub use shadec_core::{error::Result, error::ShaderError, sir, spv, ty};
pub use spirv;

pub mod backend;
pub mod frontend;
pub mod stdlib;

pub use crate::frontend::bytecode::{ArgAnnotation, FnBytecode, PoolConst};
pub use shadec_core::sir::ShaderStage;
pub use shadec_core::spv::SpirvBinary;

/// Knobs for a single compile. Replaces any notion of process-wide state:
/// every run owns its options.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Rewrite branch-shaped ternaries into branch-free `OpSelect` where
    /// the rewrite is provably safe.
    pub convert_ternary_to_select: bool,
}
impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            convert_ternary_to_select: true,
        }
    }
}

/// Generator magic word stamped into emitted module headers.
pub const GENERATOR_MAGIC: u32 = 0x0001_B00C;

/// Compile one annotated function to a SPIR-V binary.
pub fn compile(
    func: &FnBytecode,
    stage: ShaderStage,
    options: &CompileOptions,
) -> Result<SpirvBinary> {
    let program = frontend::lower(func, stage, options)?;
    backend::generate(&program)
}

/// Compile straight to the little-endian byte image of the module.
pub fn compile_to_bytes(
    func: &FnBytecode,
    stage: ShaderStage,
    options: &CompileOptions,
) -> Result<Vec<u8>> {
    compile(func, stage, options).map(|bin| bin.bytes())
}

#[cfg(test)]
mod tests;
