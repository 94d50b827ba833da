//! SPIR-V module construction: id allocation, type/constant deduplication
//! and the per-section instruction buffers that become the final binary.
use fnv::{FnvHashMap, FnvHashSet};
use half::f16;
use spirv::{
    AddressingModel, Capability, Decoration, ExecutionModel, MemoryModel, Op, StorageClass,
};

use crate::error::{Result, ShaderError};
use crate::spv::{Instruction, InstructionBuilder, SpirvBinary, SpirvHeader};
use crate::ty::{ImageType, ScalarType, Type};

/// Instruction buffers a caller can append to directly. Capabilities and
/// the entry point are managed by the builder itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Extensions,
    ExecutionModes,
    DebugNames,
    Annotations,
    TypesConstsGlobals,
}

/// A scalar constant value destined for the module, carried in full
/// precision until the target scalar type narrows it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstScalar {
    Bool(bool),
    Int(i64),
    Float(f64),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Bool(bool),
    W32(u32),
    W64(u64),
}

/// Id pool, memo tables and section buffers for one module. All `intern_*`
/// operations are idempotent: re-interning yields the id minted the first
/// time around.
#[derive(Default)]
pub struct ModuleBuilder {
    next_id: u32,
    capabilities: Vec<Capability>,
    extensions: Vec<Instruction>,
    ext_inst_imports: Vec<Instruction>,
    execution_modes: Vec<Instruction>,
    debug_names: Vec<Instruction>,
    annotations: Vec<Instruction>,
    types_consts: Vec<Instruction>,
    functions: Vec<Instruction>,
    func_head: Vec<Instruction>,
    func_vars: Vec<Instruction>,
    func_body: Vec<Instruction>,
    entry_point: Option<(ExecutionModel, u32, String)>,
    interface_ids: Vec<u32>,
    ty_memo: FnvHashMap<(Type, bool), u32>,
    ptr_memo: FnvHashMap<(u32, Type, bool), u32>,
    sampled_image_memo: FnvHashMap<ImageType, u32>,
    fn_ty_void: Option<u32>,
    const_memo: FnvHashMap<(ScalarType, ConstKey), u32>,
    composite_memo: FnvHashMap<(u32, Vec<u32>), u32>,
    const_scalars: FnvHashMap<u32, (ScalarType, ConstScalar)>,
    const_ids: FnvHashSet<u32>,
    glsl_ext: Option<u32>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        let mut out = Self::default();
        out.next_id = 1;
        out.capabilities.push(Capability::Shader);
        out
    }

    /// Mint a fresh result id. Word 0 is reserved and never returned.
    pub fn new_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn add_capability(&mut self, cap: Capability) {
        if !self.capabilities.contains(&cap) {
            self.capabilities.push(cap);
        }
    }

    pub fn emit(&mut self, section: Section, instr: Instruction) {
        let buf = match section {
            Section::Extensions => &mut self.extensions,
            Section::ExecutionModes => &mut self.execution_modes,
            Section::DebugNames => &mut self.debug_names,
            Section::Annotations => &mut self.annotations,
            Section::TypesConstsGlobals => &mut self.types_consts,
        };
        buf.push(instr);
    }

    /// Append to the opening block of the current function (`OpFunction`,
    /// the entry `OpLabel`).
    pub fn emit_func_head(&mut self, instr: Instruction) {
        self.func_head.push(instr);
    }
    /// Append a function-local `OpVariable`; these are hoisted to sit
    /// directly after the entry label when the function is closed.
    pub fn emit_func_var(&mut self, instr: Instruction) {
        self.func_vars.push(instr);
    }
    pub fn emit_func(&mut self, instr: Instruction) {
        self.func_body.push(instr);
    }

    /// Seal the current function: head, hoisted variables and body are
    /// flushed to the function stream in that order.
    pub fn end_function(&mut self) {
        self.functions.extend(self.func_head.drain(..));
        self.functions.extend(self.func_vars.drain(..));
        self.functions.extend(self.func_body.drain(..));
    }

    pub fn set_entry_point(&mut self, model: ExecutionModel, func_id: u32, name: &str) {
        self.entry_point = Some((model, func_id, name.to_string()));
    }
    pub fn add_interface_id(&mut self, id: u32) {
        self.interface_ids.push(id);
    }

    pub fn name_id(&mut self, id: u32, name: &str) {
        let instr = InstructionBuilder::new(Op::Name).push(id).push_str(name).build();
        self.debug_names.push(instr);
    }
    pub fn name_member(&mut self, id: u32, member: u32, name: &str) {
        let instr = InstructionBuilder::new(Op::MemberName)
            .push(id)
            .push(member)
            .push_str(name)
            .build();
        self.debug_names.push(instr);
    }
    pub fn decorate(&mut self, id: u32, decoration: Decoration, extra: &[u32]) {
        let instr = InstructionBuilder::new(Op::Decorate)
            .push(id)
            .push(decoration as u32)
            .push_list(extra)
            .build();
        self.annotations.push(instr);
    }
    pub fn decorate_member(&mut self, id: u32, member: u32, decoration: Decoration, extra: &[u32]) {
        let instr = InstructionBuilder::new(Op::MemberDecorate)
            .push(id)
            .push(member)
            .push(decoration as u32)
            .push_list(extra)
            .build();
        self.annotations.push(instr);
    }

    /// The id of the imported `GLSL.std.450` extended instruction set.
    pub fn glsl_ext_set(&mut self) -> u32 {
        if let Some(id) = self.glsl_ext {
            return id;
        }
        let id = self.new_id();
        let instr = InstructionBuilder::new(Op::ExtInstImport)
            .push(id)
            .push_str("GLSL.std.450")
            .build();
        self.ext_inst_imports.push(instr);
        self.glsl_ext = Some(id);
        id
    }

    /// The `void ()` function type every entry point shares.
    pub fn fn_type_void(&mut self) -> Result<u32> {
        if let Some(id) = self.fn_ty_void {
            return Ok(id);
        }
        let void_id = self.intern_type(&Type::Void, false)?;
        let id = self.new_id();
        let instr = InstructionBuilder::new(Op::TypeFunction)
            .push(id)
            .push(void_id)
            .build();
        self.types_consts.push(instr);
        self.fn_ty_void = Some(id);
        Ok(id)
    }

    /// Obtain the id of a type, emitting it (and its dependencies) on
    /// first use. With `layout` set, composite types additionally receive
    /// the member `Offset` / `ArrayStride` decorations block interfaces
    /// require.
    pub fn intern_type(&mut self, ty: &Type, layout: bool) -> Result<u32> {
        // Only arrays and structs carry layout decorations; everything
        // else must land on one id regardless of the flag.
        let layout = layout && matches!(ty, Type::Array(_) | Type::Struct(_));
        let memo_key = (ty.clone(), layout);
        if let Some(id) = self.ty_memo.get(&memo_key) {
            return Ok(*id);
        }
        let instr = match ty {
            Type::Void => {
                let id = self.new_id();
                (id, InstructionBuilder::new(Op::TypeVoid).push(id).build())
            }
            Type::Scalar(scalar_ty) => {
                self.add_scalar_capabilities(scalar_ty);
                let id = self.new_id();
                let instr = match scalar_ty {
                    ScalarType::Boolean => InstructionBuilder::new(Op::TypeBool).push(id).build(),
                    ScalarType::Integer { bits, is_signed } => {
                        InstructionBuilder::new(Op::TypeInt)
                            .push(id)
                            .push(*bits)
                            .push(*is_signed as u32)
                            .build()
                    }
                    ScalarType::Float { bits } => InstructionBuilder::new(Op::TypeFloat)
                        .push(id)
                        .push(*bits)
                        .build(),
                };
                (id, instr)
            }
            Type::Vector(x) => {
                let elem = self.intern_type(&Type::Scalar(x.scalar_ty.clone()), false)?;
                let id = self.new_id();
                let instr = InstructionBuilder::new(Op::TypeVector)
                    .push(id)
                    .push(elem)
                    .push(x.scalar_count)
                    .build();
                (id, instr)
            }
            Type::Matrix(x) => {
                self.add_capability(Capability::Matrix);
                let col = self.intern_type(&Type::Vector(x.column_ty()), false)?;
                let id = self.new_id();
                let instr = InstructionBuilder::new(Op::TypeMatrix)
                    .push(id)
                    .push(col)
                    .push(x.ncols)
                    .build();
                (id, instr)
            }
            Type::Array(x) => {
                let elem = self.intern_type(&x.element_ty, layout)?;
                let id = match x.element_count {
                    Some(n) => {
                        let len = self
                            .intern_scalar_constant(&ScalarType::u32(), &ConstScalar::Int(n as i64))?;
                        let id = self.new_id();
                        let instr = InstructionBuilder::new(Op::TypeArray)
                            .push(id)
                            .push(elem)
                            .push(len)
                            .build();
                        self.types_consts.push(instr);
                        id
                    }
                    None => {
                        let id = self.new_id();
                        let instr = InstructionBuilder::new(Op::TypeRuntimeArray)
                            .push(id)
                            .push(elem)
                            .build();
                        self.types_consts.push(instr);
                        id
                    }
                };
                if layout {
                    let stride = x.element_ty.stride()? as u32;
                    self.decorate(id, Decoration::ArrayStride, &[stride]);
                }
                self.ty_memo.insert(memo_key, id);
                return Ok(id);
            }
            Type::Struct(x) => {
                let mut member_ids = Vec::with_capacity(x.members.len());
                for (_, member_ty) in x.members.iter() {
                    member_ids.push(self.intern_type(member_ty, layout)?);
                }
                let id = self.new_id();
                let instr = InstructionBuilder::new(Op::TypeStruct)
                    .push(id)
                    .push_list(&member_ids)
                    .build();
                self.types_consts.push(instr);
                if let Some(name) = &x.name {
                    let name = name.clone();
                    self.name_id(id, &name);
                }
                for (i, (member_name, _)) in x.members.clone().iter().enumerate() {
                    self.name_member(id, i as u32, member_name);
                }
                if layout {
                    for (i, (_, member_ty)) in x.members.clone().iter().enumerate() {
                        let offset = ty.member_offset(i)? as u32;
                        self.decorate_member(id, i as u32, Decoration::Offset, &[offset]);
                        if let Type::Matrix(m) = member_ty {
                            let stride = Type::Vector(m.column_ty()).stride()? as u32;
                            self.decorate_member(id, i as u32, Decoration::ColMajor, &[]);
                            self.decorate_member(id, i as u32, Decoration::MatrixStride, &[stride]);
                        }
                    }
                }
                self.ty_memo.insert(memo_key, id);
                return Ok(id);
            }
            Type::Image(x) => {
                if x.dim == spirv::Dim::Dim1D {
                    self.add_capability(Capability::Sampled1D);
                }
                let sampled = if x.is_sampled() { 1 } else { 2 };
                let texel = self.intern_type(&Type::Scalar(x.scalar_ty.clone()), false)?;
                let id = self.new_id();
                let instr = InstructionBuilder::new(Op::TypeImage)
                    .push(id)
                    .push(texel)
                    .push(x.dim as u32)
                    .push(0) // not a depth image
                    .push(0) // not arrayed
                    .push(0) // single-sampled
                    .push(sampled)
                    .push(x.fmt as u32)
                    .build();
                (id, instr)
            }
            Type::Sampler => {
                let id = self.new_id();
                (id, InstructionBuilder::new(Op::TypeSampler).push(id).build())
            }
            Type::Abstract(name) => return Err(ShaderError::AbstractType(name.clone())),
        };
        let (id, instr) = instr;
        self.types_consts.push(instr);
        self.ty_memo.insert(memo_key, id);
        Ok(id)
    }

    /// Obtain the id of a pointer type, deduped by storage class and
    /// pointee.
    pub fn intern_ptr_type(
        &mut self,
        storage_class: StorageClass,
        ty: &Type,
        layout: bool,
    ) -> Result<u32> {
        let layout = layout && matches!(ty, Type::Array(_) | Type::Struct(_));
        let key = (storage_class as u32, ty.clone(), layout);
        if let Some(id) = self.ptr_memo.get(&key) {
            return Ok(*id);
        }
        let pointee = self.intern_type(ty, layout)?;
        let id = self.new_id();
        let instr = InstructionBuilder::new(Op::TypePointer)
            .push(id)
            .push(storage_class as u32)
            .push(pointee)
            .build();
        self.types_consts.push(instr);
        self.ptr_memo.insert(key, id);
        Ok(id)
    }

    /// Obtain the id of the sampled-image type wrapping `img`.
    pub fn intern_sampled_image_type(&mut self, img: &ImageType) -> Result<u32> {
        if let Some(id) = self.sampled_image_memo.get(img) {
            return Ok(*id);
        }
        let img_id = self.intern_type(&Type::Image(img.clone()), false)?;
        let id = self.new_id();
        let instr = InstructionBuilder::new(Op::TypeSampledImage)
            .push(id)
            .push(img_id)
            .build();
        self.types_consts.push(instr);
        self.sampled_image_memo.insert(img.clone(), id);
        Ok(id)
    }

    /// Obtain the id of a scalar constant, deduped by type and bit
    /// pattern.
    pub fn intern_scalar_constant(
        &mut self,
        scalar_ty: &ScalarType,
        value: &ConstScalar,
    ) -> Result<u32> {
        let (key, words) = encode_scalar(scalar_ty, value)?;
        let memo_key = (scalar_ty.clone(), key);
        if let Some(id) = self.const_memo.get(&memo_key) {
            return Ok(*id);
        }
        let ty_id = self.intern_type(&Type::Scalar(scalar_ty.clone()), false)?;
        let id = self.new_id();
        let instr = match &memo_key.1 {
            ConstKey::Bool(true) => InstructionBuilder::new(Op::ConstantTrue)
                .push(ty_id)
                .push(id)
                .build(),
            ConstKey::Bool(false) => InstructionBuilder::new(Op::ConstantFalse)
                .push(ty_id)
                .push(id)
                .build(),
            _ => InstructionBuilder::new(Op::Constant)
                .push(ty_id)
                .push(id)
                .push_list(&words)
                .build(),
        };
        self.types_consts.push(instr);
        self.const_memo.insert(memo_key, id);
        self.const_scalars
            .insert(id, (scalar_ty.clone(), *value));
        self.const_ids.insert(id);
        Ok(id)
    }

    /// Obtain the id of a constant composite with the given (constant)
    /// component ids, deduped structurally.
    pub fn intern_constant_composite(&mut self, ty_id: u32, components: &[u32]) -> u32 {
        let key = (ty_id, components.to_vec());
        if let Some(id) = self.composite_memo.get(&key) {
            return *id;
        }
        let id = self.new_id();
        let instr = InstructionBuilder::new(Op::ConstantComposite)
            .push(ty_id)
            .push(id)
            .push_list(components)
            .build();
        self.types_consts.push(instr);
        self.composite_memo.insert(key, id);
        self.const_ids.insert(id);
        id
    }

    /// The scalar type and value behind `id`, if it names a scalar
    /// constant of this module. The back-end folds conversions through
    /// this.
    pub fn constant_scalar(&self, id: u32) -> Option<&(ScalarType, ConstScalar)> {
        self.const_scalars.get(&id)
    }
    /// True if `id` names a constant (scalar or composite).
    pub fn is_constant(&self, id: u32) -> bool {
        self.const_ids.contains(&id)
    }

    fn add_scalar_capabilities(&mut self, scalar_ty: &ScalarType) {
        match scalar_ty {
            ScalarType::Float { bits: 16 } => self.add_capability(Capability::Float16),
            ScalarType::Float { bits: 64 } => self.add_capability(Capability::Float64),
            ScalarType::Integer { bits: 8, .. } => self.add_capability(Capability::Int8),
            ScalarType::Integer { bits: 16, .. } => self.add_capability(Capability::Int16),
            ScalarType::Integer { bits: 64, .. } => self.add_capability(Capability::Int64),
            _ => {}
        }
    }

    /// Pack everything into a binary, sections in the order the SPIR-V
    /// specification mandates.
    pub fn assemble(mut self, generator: u32) -> SpirvBinary {
        self.end_function();
        let mut words = Vec::new();
        let header = SpirvHeader {
            generator,
            bound: self.next_id,
            ..Default::default()
        };
        words.extend_from_slice(&header.words());
        for cap in self.capabilities.iter() {
            let instr = InstructionBuilder::new(Op::Capability).push(*cap as u32).build();
            words.extend_from_slice(instr.words());
        }
        for instr in self.extensions.iter() {
            words.extend_from_slice(instr.words());
        }
        for instr in self.ext_inst_imports.iter() {
            words.extend_from_slice(instr.words());
        }
        let memory_model = InstructionBuilder::new(Op::MemoryModel)
            .push(AddressingModel::Logical as u32)
            .push(MemoryModel::GLSL450 as u32)
            .build();
        words.extend_from_slice(memory_model.words());
        if let Some((model, func_id, name)) = &self.entry_point {
            let instr = InstructionBuilder::new(Op::EntryPoint)
                .push(*model as u32)
                .push(*func_id)
                .push_str(name)
                .push_list(&self.interface_ids)
                .build();
            words.extend_from_slice(instr.words());
        }
        for buf in [
            &self.execution_modes,
            &self.debug_names,
            &self.annotations,
            &self.types_consts,
            &self.functions,
        ]
        .iter()
        {
            for instr in buf.iter() {
                words.extend_from_slice(instr.words());
            }
        }
        log::debug!(
            "assembled module: bound {}, {} type/const instrs, {} function instrs",
            self.next_id,
            self.types_consts.len(),
            self.functions.len()
        );
        SpirvBinary::from(words)
    }
}

fn encode_scalar(scalar_ty: &ScalarType, value: &ConstScalar) -> Result<(ConstKey, Vec<u32>)> {
    let as_int = |value: &ConstScalar| -> i64 {
        match value {
            ConstScalar::Bool(b) => *b as i64,
            ConstScalar::Int(i) => *i,
            ConstScalar::Float(f) => *f as i64,
        }
    };
    let as_float = |value: &ConstScalar| -> f64 {
        match value {
            ConstScalar::Bool(b) => *b as u8 as f64,
            ConstScalar::Int(i) => *i as f64,
            ConstScalar::Float(f) => *f,
        }
    };
    let out = match scalar_ty {
        ScalarType::Boolean => {
            let b = match value {
                ConstScalar::Bool(b) => *b,
                _ => {
                    return Err(ShaderError::TypeMismatch(format!(
                        "cannot make a bool constant from {:?}",
                        value
                    )))
                }
            };
            (ConstKey::Bool(b), Vec::new())
        }
        ScalarType::Integer { bits: 64, .. } => {
            let v = as_int(value) as u64;
            (
                ConstKey::W64(v),
                vec![(v & 0xFFFF_FFFF) as u32, (v >> 32) as u32],
            )
        }
        ScalarType::Integer { bits, .. } => {
            let mask = if *bits == 32 {
                u32::MAX
            } else {
                (1u32 << bits) - 1
            };
            let v = (as_int(value) as u32) & mask;
            (ConstKey::W32(v), vec![v])
        }
        ScalarType::Float { bits: 16 } => {
            let v = f16::from_f64(as_float(value)).to_bits() as u32;
            (ConstKey::W32(v), vec![v])
        }
        ScalarType::Float { bits: 64 } => {
            let v = as_float(value).to_bits();
            (
                ConstKey::W64(v),
                vec![(v & 0xFFFF_FFFF) as u32, (v >> 32) as u32],
            )
        }
        ScalarType::Float { .. } => {
            let v = (as_float(value) as f32).to_bits();
            (ConstKey::W32(v), vec![v])
        }
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::VectorType;

    fn f32_ty() -> Type {
        Type::Scalar(ScalarType::f32())
    }

    #[test]
    fn interning_is_idempotent() {
        let mut b = ModuleBuilder::new();
        let a = b.intern_type(&f32_ty(), false).unwrap();
        let c = b.intern_type(&f32_ty(), false).unwrap();
        assert_eq!(a, c);
        let k1 = b
            .intern_scalar_constant(&ScalarType::f32(), &ConstScalar::Float(1.5))
            .unwrap();
        let k2 = b
            .intern_scalar_constant(&ScalarType::f32(), &ConstScalar::Float(1.5))
            .unwrap();
        assert_eq!(k1, k2);
        let k3 = b
            .intern_scalar_constant(&ScalarType::f32(), &ConstScalar::Float(2.5))
            .unwrap();
        assert_ne!(k1, k3);
    }

    #[test]
    fn vector_type_emits_scalar_dependency_once() {
        let mut b = ModuleBuilder::new();
        let vec2 = Type::Vector(VectorType {
            scalar_ty: ScalarType::f32(),
            scalar_count: 2,
        });
        b.intern_type(&vec2, false).unwrap();
        b.intern_type(&f32_ty(), false).unwrap();
        let bin = b.assemble(0);
        let float_decls = bin
            .instrs()
            .unwrap()
            .filter_map(|i| i.ok())
            .filter(|i| i.op() == Some(Op::TypeFloat))
            .count();
        assert_eq!(float_decls, 1);
    }

    #[test]
    fn bound_covers_all_ids() {
        let mut b = ModuleBuilder::new();
        b.intern_type(&f32_ty(), false).unwrap();
        b.intern_scalar_constant(&ScalarType::f32(), &ConstScalar::Float(3.0))
            .unwrap();
        let bin = b.assemble(0);
        let header = bin.header().unwrap();
        let mut max_id = 0;
        for instr in bin.instrs().unwrap() {
            let instr = instr.unwrap();
            // Only the result-id carrying ops matter here; literal operand
            // words may exceed the bound legitimately.
            if instr.op() == Some(Op::TypeFloat) || instr.op() == Some(Op::Constant) {
                let mut ops = instr.operands();
                let id = match instr.op() {
                    Some(Op::TypeFloat) => ops.read_id().unwrap(),
                    _ => {
                        ops.read_id().unwrap();
                        ops.read_id().unwrap()
                    }
                };
                max_id = max_id.max(id);
            }
        }
        assert!(header.bound > max_id);
    }

    #[test]
    fn sixty_four_bit_constants_take_two_words() {
        let mut b = ModuleBuilder::new();
        b.intern_scalar_constant(&ScalarType::float(64), &ConstScalar::Float(2.5))
            .unwrap();
        let bin = b.assemble(0);
        let constant = bin
            .instrs()
            .unwrap()
            .filter_map(|i| i.ok())
            .find(|i| i.op() == Some(Op::Constant))
            .unwrap();
        // type id + result id + two value words
        assert_eq!(constant.operands().len(), 4);
        let words = constant.operands().as_slice().to_vec();
        let bits = (words[2] as u64) | ((words[3] as u64) << 32);
        assert_eq!(f64::from_bits(bits), 2.5);
    }

    #[test]
    fn capabilities_follow_the_types() {
        let mut b = ModuleBuilder::new();
        b.intern_type(&Type::Scalar(ScalarType::float(64)), false).unwrap();
        b.intern_type(&Type::Scalar(ScalarType::uint(8)), false).unwrap();
        let bin = b.assemble(0);
        let caps = bin
            .instrs()
            .unwrap()
            .filter_map(|i| i.ok())
            .filter(|i| i.op() == Some(Op::Capability))
            .map(|i| i.operands().read_u32().unwrap())
            .collect::<Vec<_>>();
        assert!(caps.contains(&(Capability::Shader as u32)));
        assert!(caps.contains(&(Capability::Float64 as u32)));
        assert!(caps.contains(&(Capability::Int8 as u32)));
    }
}
