//! Back-end: executes stack IR on a symbolic stack machine and emits a
//! SPIR-V module.
use fnv::FnvHashMap;
use spirv::{Decoration, ExecutionMode, ExecutionModel, Op, StorageClass};

use shadec_core::error::{Result, ShaderError};
use shadec_core::sir::{Instr, Label, ResourceKind, ShaderStage, Slot};
use shadec_core::spv::builder::{ConstScalar, ModuleBuilder, Section};
use shadec_core::spv::{InstructionBuilder, SpirvBinary};
use shadec_core::ty::{ScalarType, StructType, Type, TypeRegistry, VectorType};

use crate::stdlib;
use crate::stdlib::{Intrinsic, IntrinsicKind, ResultKind};

mod arith;
mod value;

use self::value::{Value, ValueId, VariableAccess};

/// Generate a SPIR-V binary from a stack-IR program.
pub fn generate(prog: &[Instr]) -> Result<SpirvBinary> {
    let mut backend = Backend::new(prog);
    for instr in prog.iter() {
        backend.exec(instr)?;
    }
    Ok(backend.b.assemble(crate::GENERATOR_MAGIC))
}

struct OpenLoop {
    merge: Label,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeKind {
    Selection,
    Loop,
}

pub(crate) struct Backend {
    pub(crate) b: ModuleBuilder,
    pub(crate) reg: TypeRegistry,
    stack: Vec<Value>,
    /// Resource tables, keyed by the full `kind.name` resource name.
    resources: FnvHashMap<String, (ResourceKind, VariableAccess)>,
    /// `(namespace, slot) -> resource name`; catches double bindings.
    slotmap: FnvHashMap<(String, String), String>,
    /// Function-local variables, one `Function`-storage `OpVariable` per
    /// stored name.
    locals: FnvHashMap<String, VariableAccess>,
    label_ids: FnvHashMap<Label, u32>,
    /// Stack snapshots per incoming edge, for phi insertion at merges.
    incoming: FnvHashMap<Label, Vec<(u32, Vec<ValueId>)>>,
    /// Branch targets of the block starting at each label, precomputed
    /// from the program; drives selection-merge deduction.
    successors: FnvHashMap<Label, Vec<Label>>,
    open_loops: Vec<OpenLoop>,
    /// Merge labels of constructs not yet closed, tagged by construct
    /// kind; a `return` inside an open selection of a fragment shader
    /// discards instead.
    merge_stack: Vec<(Label, MergeKind)>,
    stage: Option<ShaderStage>,
    cur_block: u32,
    terminated: bool,
}

impl Backend {
    fn new(prog: &[Instr]) -> Self {
        Backend {
            b: ModuleBuilder::new(),
            reg: TypeRegistry::new(),
            stack: Vec::new(),
            resources: Default::default(),
            slotmap: Default::default(),
            locals: Default::default(),
            label_ids: Default::default(),
            incoming: Default::default(),
            successors: compute_successors(prog),
            open_loops: Vec::new(),
            merge_stack: Vec::new(),
            stage: None,
            cur_block: 0,
            terminated: true,
        }
    }

    fn exec(&mut self, instr: &Instr) -> Result<()> {
        match instr {
            Instr::EntryPoint {
                name,
                stage,
                exec_modes,
            } => self.op_entrypoint(name, *stage, exec_modes),
            Instr::FuncEnd => self.op_func_end(),
            Instr::Call { nargs } => self.op_call(*nargs),
            Instr::Return => self.op_return(),
            Instr::Resource {
                name,
                kind,
                slot,
                type_name,
            } => self.op_resource(name, *kind, slot, type_name),
            Instr::LoadName(name) => self.op_load_name(name),
            Instr::StoreName(name) => self.op_store_name(name),
            Instr::LoadIndex => self.op_load_index(),
            Instr::StoreIndex => self.op_store_index(),
            Instr::LoadAttr(name) => self.op_load_attr(name),
            Instr::LoadConst(value) => self.op_load_constant(value),
            Instr::LoadArray { nargs } => self.op_load_array(*nargs),
            Instr::BinaryOp(op) => self.binary_op(*op),
            Instr::UnaryOp(op) => self.unary_op(*op),
            Instr::Compare(op) => self.compare_op(*op),
            Instr::Select => self.op_select(),
            Instr::PopTop => {
                self.pop()?;
                Ok(())
            }
            Instr::DupTop => {
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| ShaderError::MalformedIr("stack underflow".to_string()))?;
                self.stack.push(top);
                Ok(())
            }
            Instr::RotTwo => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.stack.push(a);
                self.stack.push(b);
                Ok(())
            }
            Instr::Label(l) => self.op_label(*l),
            Instr::Branch(l) => self.op_branch(*l),
            Instr::BranchConditional {
                true_label,
                false_label,
            } => self.op_branch_conditional(*true_label, *false_label),
            Instr::BranchLoop {
                iter_label,
                continue_label,
                merge_label,
            } => self.op_branch_loop(*iter_label, *continue_label, *merge_label),
        }
    }

    // %% Function framing

    fn op_entrypoint(
        &mut self,
        name: &str,
        stage: ShaderStage,
        exec_modes: &std::collections::BTreeMap<String, Vec<u32>>,
    ) -> Result<()> {
        let model = match stage {
            ShaderStage::Vertex => ExecutionModel::Vertex,
            ShaderStage::Fragment => ExecutionModel::Fragment,
            ShaderStage::Compute => ExecutionModel::GLCompute,
            ShaderStage::Geometry => ExecutionModel::Geometry,
        };
        let func_id = self.b.new_id();
        self.b.set_entry_point(model, func_id, name);
        self.b.name_id(func_id, name);
        self.stage = Some(stage);

        let mut modes = exec_modes.clone();
        if stage == ShaderStage::Fragment
            && !modes.contains_key("OriginLowerLeft")
            && !modes.contains_key("OriginUpperLeft")
        {
            modes.insert("OriginLowerLeft".to_string(), Vec::new());
        }
        if stage == ShaderStage::Compute && !modes.contains_key("LocalSize") {
            modes.insert("LocalSize".to_string(), vec![1, 1, 1]);
        }
        for (mode_name, args) in modes.iter() {
            let mode = execution_mode_from_name(mode_name)?;
            let instr = InstructionBuilder::new(Op::ExecutionMode)
                .push(func_id)
                .push(mode as u32)
                .push_list(args)
                .build();
            self.b.emit(Section::ExecutionModes, instr);
        }

        let void_id = self.b.intern_type(&Type::Void, false)?;
        let fn_ty = self.b.fn_type_void()?;
        let instr = InstructionBuilder::new(Op::Function)
            .push(void_id)
            .push(func_id)
            .push(0) // no function control
            .push(fn_ty)
            .build();
        self.b.emit_func_head(instr);
        let entry = self.b.new_id();
        self.b
            .emit_func_head(InstructionBuilder::new(Op::Label).push(entry).build());
        self.cur_block = entry;
        self.terminated = false;
        Ok(())
    }

    fn op_func_end(&mut self) -> Result<()> {
        if !self.terminated {
            self.emit(InstructionBuilder::new(Op::Return).build());
            self.terminated = true;
        }
        self.emit(InstructionBuilder::new(Op::FunctionEnd).build());
        self.b.end_function();
        Ok(())
    }

    fn op_return(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        // An early return inside a selection body of a fragment shader
        // discards the pixel; a bare loop body returns normally.
        let in_selection = matches!(self.merge_stack.last(), Some((_, MergeKind::Selection)));
        if self.stage == Some(ShaderStage::Fragment) && in_selection {
            self.emit(InstructionBuilder::new(Op::Kill).build());
        } else {
            self.emit(InstructionBuilder::new(Op::Return).build());
        }
        self.terminated = true;
        Ok(())
    }

    // %% Resources

    fn op_resource(
        &mut self,
        name: &str,
        kind: ResourceKind,
        slot: &Slot,
        type_name: &str,
    ) -> Result<()> {
        let ty = self.reg.resolve(type_name)?;
        if ty.is_abstract() {
            return Err(ShaderError::AbstractType(type_name.to_string()));
        }
        if self.resources.contains_key(name) {
            return Err(ShaderError::BadResourceAnnotation {
                name: name.to_string(),
                reason: "resource already exists".to_string(),
            });
        }
        let access = match kind {
            ResourceKind::Input | ResourceKind::Output => {
                let storage_class = match kind {
                    ResourceKind::Input => StorageClass::Input,
                    _ => StorageClass::Output,
                };
                let access = self.make_variable(storage_class, &ty, false, name)?;
                match slot {
                    Slot::Index(location) => {
                        self.claim_slot(kind.as_str(), &location.to_string(), name)?;
                        self.b
                            .decorate(access.var_id, Decoration::Location, &[*location]);
                    }
                    Slot::Builtin(builtin_name) => {
                        self.claim_slot(kind.as_str(), builtin_name, name)?;
                        let builtin = stdlib::builtin_decoration(builtin_name)
                            .ok_or_else(|| ShaderError::UnknownBuiltin(builtin_name.clone()))?;
                        self.b
                            .decorate(access.var_id, Decoration::BuiltIn, &[builtin as u32]);
                    }
                    Slot::Pair(..) => {
                        return Err(ShaderError::BadResourceAnnotation {
                            name: name.to_string(),
                            reason: "inputs and outputs bind by location, not by bind group"
                                .to_string(),
                        });
                    }
                }
                self.b.add_interface_id(access.var_id);
                access
            }
            ResourceKind::Uniform | ResourceKind::Buffer => {
                let (bind_group, binding) = self.block_slot(name, slot)?;
                // A block variable is always a struct; wrap loose types in
                // a single-member struct so attribute access keeps working.
                let (block_ty, wrapped) = match &ty {
                    Type::Struct(_) => (ty.clone(), false),
                    _ => (
                        Type::Struct(StructType {
                            name: Some(format!("{}_block", name)),
                            members: vec![(name.to_string(), ty.clone())],
                        }),
                        true,
                    ),
                };
                let access = self.make_variable(StorageClass::Uniform, &block_ty, true, name)?;
                let block_decoration = match kind {
                    ResourceKind::Uniform => Decoration::Block,
                    _ => Decoration::BufferBlock,
                };
                self.b.decorate(access.var_id, block_decoration, &[]);
                self.b
                    .decorate(access.var_id, Decoration::DescriptorSet, &[bind_group]);
                self.b.decorate(access.var_id, Decoration::Binding, &[binding]);
                if wrapped {
                    let zero = self
                        .b
                        .intern_scalar_constant(&ScalarType::i32(), &ConstScalar::Int(0))?;
                    access.index(zero, Some(0))?
                } else {
                    access
                }
            }
            ResourceKind::Sampler | ResourceKind::Texture => {
                let matches_kind = match kind {
                    ResourceKind::Sampler => ty == Type::Sampler,
                    _ => ty.is_image(),
                };
                if !matches_kind {
                    return Err(ShaderError::BadResourceAnnotation {
                        name: name.to_string(),
                        reason: format!("type `{}` does not fit a {} binding", ty, kind),
                    });
                }
                let (bind_group, binding) = self.block_slot(name, slot)?;
                let access =
                    self.make_variable(StorageClass::UniformConstant, &ty, false, name)?;
                self.b
                    .decorate(access.var_id, Decoration::DescriptorSet, &[bind_group]);
                self.b.decorate(access.var_id, Decoration::Binding, &[binding]);
                access
            }
        };
        self.resources.insert(name.to_string(), (kind, access));
        Ok(())
    }

    fn block_slot(&mut self, name: &str, slot: &Slot) -> Result<(u32, u32)> {
        let (bind_group, binding) = match slot {
            Slot::Index(binding) => (0, *binding),
            Slot::Pair(bind_group, binding) => (*bind_group, *binding),
            Slot::Builtin(_) => {
                return Err(ShaderError::BadResourceAnnotation {
                    name: name.to_string(),
                    reason: "block resources bind by (bind group, binding)".to_string(),
                });
            }
        };
        let namespace = format!("bindgroup-{}", bind_group);
        self.claim_slot(&namespace, &binding.to_string(), name)?;
        Ok((bind_group, binding))
    }

    fn claim_slot(&mut self, namespace: &str, slot: &str, name: &str) -> Result<()> {
        let key = (namespace.to_string(), slot.to_string());
        if let Some(other) = self.slotmap.get(&key) {
            return Err(ShaderError::DuplicateSlot {
                namespace: namespace.to_string(),
                slot: slot.to_string(),
                name: name.to_string(),
                other: other.clone(),
            });
        }
        self.slotmap.insert(key, name.to_string());
        Ok(())
    }

    fn make_variable(
        &mut self,
        storage_class: StorageClass,
        ty: &Type,
        layout: bool,
        name: &str,
    ) -> Result<VariableAccess> {
        let ptr = self.b.intern_ptr_type(storage_class, ty, layout)?;
        let id = self.b.new_id();
        let instr = InstructionBuilder::new(Op::Variable)
            .push(ptr)
            .push(id)
            .push(storage_class as u32)
            .build();
        self.b.emit(Section::TypesConstsGlobals, instr);
        self.b.name_id(id, name);
        Ok(VariableAccess::new(id, storage_class, ty.clone(), layout))
    }

    // %% Loads and stores

    fn op_load_name(&mut self, name: &str) -> Result<()> {
        if let Some(access) = self.locals.get(name) {
            self.stack.push(Value::Access(access.clone()));
            return Ok(());
        }
        if let Some((_, access)) = self.resources.get(name) {
            self.stack.push(Value::Access(access.clone()));
            return Ok(());
        }
        if name.starts_with("stdlib.") || name.starts_with("texture.") {
            self.stack.push(Value::Intrinsic(name.to_string()));
            return Ok(());
        }
        if let Ok(ty) = self.reg.resolve(name) {
            self.stack.push(Value::Type(ty));
            return Ok(());
        }
        Err(ShaderError::UnknownName(name.to_string()))
    }

    fn op_store_name(&mut self, name: &str) -> Result<()> {
        let value = self.pop()?;
        if let Some((kind, access)) = self.resources.get(name).cloned() {
            return match kind {
                ResourceKind::Output | ResourceKind::Buffer => {
                    let value = self.materialize(value)?;
                    self.store_access(&access, &value)
                }
                _ => Err(ShaderError::IllegalStoreTarget(format!(
                    "{} `{}`",
                    kind, name
                ))),
            };
        }
        let value = self.materialize(value)?;
        let access = match self.locals.get(name) {
            Some(access) => {
                if access.ty != value.ty {
                    return Err(ShaderError::TypeMismatch(format!(
                        "variable `{}` is {}, cannot store {}",
                        name, access.ty, value.ty
                    )));
                }
                access.clone()
            }
            None => {
                let access = self.fresh_function_var(&value.ty, Some(name))?;
                self.locals.insert(name.to_string(), access.clone());
                access
            }
        };
        self.store_access(&access, &value)
    }

    fn op_load_constant(&mut self, value: &shadec_core::sir::ConstValue) -> Result<()> {
        use shadec_core::sir::ConstValue;
        let (scalar_ty, scalar) = match value {
            ConstValue::Bool(b) => (ScalarType::Boolean, ConstScalar::Bool(*b)),
            ConstValue::Int(i) => (ScalarType::i32(), ConstScalar::Int(*i)),
            ConstValue::Float(f) => (ScalarType::f32(), ConstScalar::Float(f.into_inner())),
        };
        let id = self.b.intern_scalar_constant(&scalar_ty, &scalar)?;
        self.stack.push(Value::Id(ValueId {
            id,
            ty: Type::Scalar(scalar_ty),
        }));
        Ok(())
    }

    fn op_load_index(&mut self) -> Result<()> {
        let index = self.pop()?;
        let container = self.pop()?;
        let index = self.materialize(index)?;
        match index.ty.element_scalar() {
            Some(scalar) if scalar.is_integer() => {}
            _ => {
                return Err(ShaderError::TypeMismatch(format!(
                    "subscripts must be integers, got {}",
                    index.ty
                )))
            }
        }
        let static_index = self.static_index_of(index.id);
        match container {
            Value::Access(access) => {
                let access = access.index(index.id, static_index)?;
                self.stack.push(Value::Access(access));
                Ok(())
            }
            Value::Id(container) => {
                let element = self.index_immediate(container, index)?;
                self.stack.push(Value::Id(element));
                Ok(())
            }
            other => Err(ShaderError::TypeMismatch(format!(
                "cannot index into {:?}",
                other
            ))),
        }
    }

    fn op_store_index(&mut self) -> Result<()> {
        let index = self.pop()?;
        let target = self.pop()?;
        let value = self.pop()?;
        match target {
            Value::Access(access) => {
                let index = self.materialize(index)?;
                let static_index = self.static_index_of(index.id);
                let target = access.index(index.id, static_index)?;
                let value = self.materialize(value)?;
                self.store_access(&target, &value)
            }
            _ => Err(ShaderError::IllegalStoreTarget(
                "an immediate value".to_string(),
            )),
        }
    }

    fn op_load_attr(&mut self, name: &str) -> Result<()> {
        let ob = self.pop()?;
        match ob {
            Value::Access(access) => match access.ty.clone() {
                Type::Struct(st) => {
                    let index = st.member_index(name).ok_or_else(|| {
                        ShaderError::TypeMismatch(format!(
                            "attribute `{}` invalid for {}",
                            name, access.ty
                        ))
                    })?;
                    let index_id = self
                        .b
                        .intern_scalar_constant(&ScalarType::i32(), &ConstScalar::Int(index as i64))?;
                    let access = access.index(index_id, Some(index as u32))?;
                    self.stack.push(Value::Access(access));
                    Ok(())
                }
                Type::Vector(vt) => {
                    let indices = swizzle_indices(name, vt.scalar_count)?;
                    if indices.len() == 1 {
                        let index_id = self.b.intern_scalar_constant(
                            &ScalarType::i32(),
                            &ConstScalar::Int(indices[0] as i64),
                        )?;
                        let access = access.index(index_id, Some(indices[0]))?;
                        self.stack.push(Value::Access(access));
                    } else {
                        let vector = self.load_access(&access)?;
                        let shuffled = self.swizzle(&vector, &vt, &indices)?;
                        self.stack.push(Value::Id(shuffled));
                    }
                    Ok(())
                }
                other => Err(ShaderError::TypeMismatch(format!(
                    "attribute access on {}",
                    other
                ))),
            },
            Value::Id(value) => match value.ty.clone() {
                Type::Vector(vt) => {
                    let indices = swizzle_indices(name, vt.scalar_count)?;
                    if indices.len() == 1 {
                        let element = self.composite_extract(
                            &value,
                            Type::Scalar(vt.scalar_ty.clone()),
                            indices[0],
                        )?;
                        self.stack.push(Value::Id(element));
                    } else {
                        let shuffled = self.swizzle(&value, &vt, &indices)?;
                        self.stack.push(Value::Id(shuffled));
                    }
                    Ok(())
                }
                Type::Struct(st) => {
                    let index = st.member_index(name).ok_or_else(|| {
                        ShaderError::TypeMismatch(format!(
                            "attribute `{}` invalid for {}",
                            name, value.ty
                        ))
                    })?;
                    let member_ty = st.members[index].1.clone();
                    let element = self.composite_extract(&value, member_ty, index as u32)?;
                    self.stack.push(Value::Id(element));
                    Ok(())
                }
                other => Err(ShaderError::TypeMismatch(format!(
                    "attribute access on {}",
                    other
                ))),
            },
            other => Err(ShaderError::TypeMismatch(format!(
                "attribute access on {:?}",
                other
            ))),
        }
    }

    fn op_load_array(&mut self, nargs: u32) -> Result<()> {
        let args = self.pop_values(nargs as usize)?;
        let mut elements = Vec::with_capacity(args.len());
        for arg in args {
            elements.push(self.materialize(arg)?);
        }
        let packed = self.array_packing(elements)?;
        self.stack.push(Value::Id(packed));
        Ok(())
    }

    // %% Calls

    fn op_call(&mut self, nargs: u32) -> Result<()> {
        let args = self.pop_values(nargs as usize)?;
        let func = self.pop()?;
        match func {
            Value::Type(ty) => {
                if ty.is_abstract() {
                    return Err(ShaderError::AbstractType(ty.to_string()));
                }
                match ty {
                    Type::Vector(vt) => {
                        let mut elements = Vec::with_capacity(args.len());
                        for arg in args {
                            elements.push(self.materialize(arg)?);
                        }
                        let packed = self.vector_packing(&vt, elements)?;
                        self.stack.push(Value::Id(packed));
                        Ok(())
                    }
                    Type::Scalar(st) => {
                        if args.len() != 1 {
                            return Err(ShaderError::TypeMismatch(
                                "scalar conversion needs exactly one argument".to_string(),
                            ));
                        }
                        let arg = {
                            let arg = args.into_iter().next().expect("length checked");
                            self.materialize(arg)?
                        };
                        let converted =
                            self.convert_scalar_or_vector(&Type::Scalar(st), arg)?;
                        self.stack.push(Value::Id(converted));
                        Ok(())
                    }
                    other => Err(ShaderError::TypeMismatch(format!(
                        "cannot construct a value of {}",
                        other
                    ))),
                }
            }
            Value::Intrinsic(name) => self.call_intrinsic(&name, args),
            other => Err(ShaderError::UnknownIntrinsic(format!("{:?}", other))),
        }
    }

    fn call_intrinsic(&mut self, name: &str, args: Vec<Value>) -> Result<()> {
        let bare = name.splitn(2, '.').nth(1).unwrap_or(name);
        let intrinsic: Intrinsic = stdlib::lookup(bare)
            .ok_or_else(|| ShaderError::UnknownIntrinsic(name.to_string()))?;
        if args.len() != intrinsic.nargs {
            return Err(ShaderError::ShapeMismatch(format!(
                "{} expects {} arguments, got {}",
                name,
                intrinsic.nargs,
                args.len()
            )));
        }
        match intrinsic.kind {
            IntrinsicKind::Ext { nr, result } => {
                let mut vals = Vec::with_capacity(args.len());
                for arg in args {
                    vals.push(self.materialize(arg)?);
                }
                let first_ty = vals[0].ty.clone();
                for val in vals.iter() {
                    if val.ty != first_ty {
                        return Err(ShaderError::TypeMismatch(format!(
                            "{} arguments must share one type",
                            name
                        )));
                    }
                }
                match first_ty.element_scalar() {
                    Some(scalar) if scalar.is_float() => {}
                    _ => {
                        return Err(ShaderError::TypeMismatch(format!(
                            "{} is only defined for float scalars and vectors",
                            name
                        )))
                    }
                }
                let result_ty = match result {
                    ResultKind::Same => first_ty,
                    ResultKind::Component => match &first_ty {
                        Type::Vector(vt) => Type::Scalar(vt.scalar_ty.clone()),
                        other => other.clone(),
                    },
                };
                let out = self.ext_inst(nr, &result_ty, &vals)?;
                self.stack.push(Value::Id(out));
                Ok(())
            }
            IntrinsicKind::Abs => {
                let val = {
                    let arg = args.into_iter().next().expect("arity checked");
                    self.materialize(arg)?
                };
                let nr = match val.ty.element_scalar() {
                    Some(scalar) if scalar.is_float() => stdlib::GLSL_FABS,
                    Some(scalar) if scalar.is_signed_integer() => stdlib::GLSL_SABS,
                    _ => {
                        return Err(ShaderError::TypeMismatch(format!(
                            "abs is not defined for {}",
                            val.ty
                        )))
                    }
                };
                let result_ty = val.ty.clone();
                let out = self.ext_inst(nr, &result_ty, &[val])?;
                self.stack.push(Value::Id(out));
                Ok(())
            }
            IntrinsicKind::ImageRead => self.image_read(args),
            IntrinsicKind::ImageWrite => self.image_write(args),
            IntrinsicKind::ImageSample => self.image_sample(args),
        }
    }

    fn ext_inst(&mut self, nr: u32, result_ty: &Type, args: &[ValueId]) -> Result<ValueId> {
        let set = self.b.glsl_ext_set();
        let ty_id = self.b.intern_type(result_ty, false)?;
        let id = self.b.new_id();
        let mut instr = InstructionBuilder::new(Op::ExtInst)
            .push(ty_id)
            .push(id)
            .push(set)
            .push(nr);
        for arg in args {
            instr = instr.push(arg.id);
        }
        self.emit(instr.build());
        Ok(ValueId {
            id,
            ty: result_ty.clone(),
        })
    }

    fn texel_vector_ty(image_scalar: &ScalarType) -> Type {
        Type::Vector(VectorType {
            scalar_ty: image_scalar.clone(),
            scalar_count: 4,
        })
    }

    fn image_read(&mut self, args: Vec<Value>) -> Result<()> {
        let mut it = args.into_iter();
        let image = self.materialize(it.next().expect("arity checked"))?;
        let coords = self.materialize(it.next().expect("arity checked"))?;
        let img_ty = match &image.ty {
            Type::Image(img) if !img.is_sampled() => img.clone(),
            Type::Image(_) => {
                return Err(ShaderError::TypeMismatch(
                    "sampled textures cannot be read directly; use sample".to_string(),
                ))
            }
            other => {
                return Err(ShaderError::TypeMismatch(format!(
                    "read expects a texture, got {}",
                    other
                )))
            }
        };
        match coords.ty.element_scalar() {
            Some(scalar) if scalar.is_integer() => {}
            _ => {
                return Err(ShaderError::TypeMismatch(
                    "read coordinates must be integers".to_string(),
                ))
            }
        }
        let result_ty = Self::texel_vector_ty(&img_ty.scalar_ty);
        let ty_id = self.b.intern_type(&result_ty, false)?;
        let id = self.b.new_id();
        let instr = InstructionBuilder::new(Op::ImageRead)
            .push(ty_id)
            .push(id)
            .push(image.id)
            .push(coords.id)
            .build();
        self.emit(instr);
        self.stack.push(Value::Id(ValueId { id, ty: result_ty }));
        Ok(())
    }

    fn image_write(&mut self, args: Vec<Value>) -> Result<()> {
        let mut it = args.into_iter();
        let image = self.materialize(it.next().expect("arity checked"))?;
        let coords = self.materialize(it.next().expect("arity checked"))?;
        let color = self.materialize(it.next().expect("arity checked"))?;
        match &image.ty {
            Type::Image(img) if !img.is_sampled() => {}
            other => {
                return Err(ShaderError::TypeMismatch(format!(
                    "write expects a storage texture, got {}",
                    other
                )))
            }
        }
        let instr = InstructionBuilder::new(Op::ImageWrite)
            .push(image.id)
            .push(coords.id)
            .push(color.id)
            .build();
        self.emit(instr);
        self.stack.push(Value::Void);
        Ok(())
    }

    fn image_sample(&mut self, args: Vec<Value>) -> Result<()> {
        let mut it = args.into_iter();
        let image = self.materialize(it.next().expect("arity checked"))?;
        let sampler = self.materialize(it.next().expect("arity checked"))?;
        let coords = self.materialize(it.next().expect("arity checked"))?;
        let img_ty = match &image.ty {
            Type::Image(img) if img.is_sampled() => img.clone(),
            other => {
                return Err(ShaderError::TypeMismatch(format!(
                    "sample expects a sampled texture, got {}",
                    other
                )))
            }
        };
        if sampler.ty != Type::Sampler {
            return Err(ShaderError::TypeMismatch(format!(
                "sample expects a sampler, got {}",
                sampler.ty
            )));
        }
        let sampled_ty = self.b.intern_sampled_image_type(&img_ty)?;
        let sampled_id = self.b.new_id();
        let instr = InstructionBuilder::new(Op::SampledImage)
            .push(sampled_ty)
            .push(sampled_id)
            .push(image.id)
            .push(sampler.id)
            .build();
        self.emit(instr);
        let result_ty = Self::texel_vector_ty(&img_ty.scalar_ty);
        let ty_id = self.b.intern_type(&result_ty, false)?;
        let id = self.b.new_id();
        let instr = InstructionBuilder::new(Op::ImageSampleImplicitLod)
            .push(ty_id)
            .push(id)
            .push(sampled_id)
            .push(coords.id)
            .build();
        self.emit(instr);
        self.stack.push(Value::Id(ValueId { id, ty: result_ty }));
        Ok(())
    }

    // %% Structured control flow

    fn op_label(&mut self, label: Label) -> Result<()> {
        if !self.terminated {
            return Err(ShaderError::MalformedIr(format!(
                "fall-through into label {}",
                label
            )));
        }
        let id = self.label_id(label);
        self.emit(InstructionBuilder::new(Op::Label).push(id).build());
        self.cur_block = id;
        self.terminated = false;
        while self.merge_stack.last().map(|(l, _)| *l) == Some(label) {
            self.merge_stack.pop();
        }
        while self.open_loops.last().map(|l| l.merge) == Some(label) {
            self.open_loops.pop();
        }

        self.stack.clear();
        let edges = self.incoming.remove(&label).unwrap_or_default();
        if edges.is_empty() {
            return Ok(());
        }
        let depth = edges[0].1.len();
        if edges.iter().any(|(_, snapshot)| snapshot.len() != depth) {
            return Err(ShaderError::UnresolvedControlFlow(format!(
                "inconsistent stack depth at merge label {}",
                label
            )));
        }
        for position in 0..depth {
            let first = edges[0].1[position].clone();
            if edges
                .iter()
                .all(|(_, snapshot)| snapshot[position].id == first.id)
            {
                self.stack.push(Value::Id(first));
                continue;
            }
            for (_, snapshot) in edges.iter() {
                if snapshot[position].ty != first.ty {
                    return Err(ShaderError::TypeMismatch(format!(
                        "merge label {} receives values of different types",
                        label
                    )));
                }
            }
            let ty_id = self.b.intern_type(&first.ty, false)?;
            let id = self.b.new_id();
            let mut instr = InstructionBuilder::new(Op::Phi).push(ty_id).push(id);
            for (pred, snapshot) in edges.iter() {
                instr = instr.push(snapshot[position].id).push(*pred);
            }
            self.emit(instr.build());
            self.stack.push(Value::Id(ValueId {
                id,
                ty: first.ty,
            }));
        }
        Ok(())
    }

    fn op_branch(&mut self, label: Label) -> Result<()> {
        if self.terminated {
            // The block already returned; the trailing jump is dead.
            return Ok(());
        }
        self.record_edge(label)?;
        let id = self.label_id(label);
        self.emit(InstructionBuilder::new(Op::Branch).push(id).build());
        self.terminated = true;
        Ok(())
    }

    fn op_branch_conditional(&mut self, true_label: Label, false_label: Label) -> Result<()> {
        let cond = self.pop()?;
        let cond = self.materialize(cond)?;
        if cond.ty != Type::Scalar(ScalarType::Boolean) {
            return Err(ShaderError::TypeMismatch(format!(
                "branch condition must be a bool, got {}",
                cond.ty
            )));
        }
        self.record_edge(true_label)?;
        self.record_edge(false_label)?;
        // The iterator block of the innermost loop branches straight to
        // the loop merge; that conditional carries no selection header.
        let loop_exit = self
            .open_loops
            .last()
            .map_or(false, |l| l.merge == true_label || l.merge == false_label);
        if !loop_exit {
            let merge = self
                .common_successor(true_label, false_label)
                .unwrap_or(false_label);
            let merge_id = self.label_id(merge);
            self.emit(
                InstructionBuilder::new(Op::SelectionMerge)
                    .push(merge_id)
                    .push(0) // no selection control
                    .build(),
            );
            self.merge_stack.push((merge, MergeKind::Selection));
        }
        let true_id = self.label_id(true_label);
        let false_id = self.label_id(false_label);
        let instr = InstructionBuilder::new(Op::BranchConditional)
            .push(cond.id)
            .push(true_id)
            .push(false_id)
            .build();
        self.emit(instr);
        self.terminated = true;
        Ok(())
    }

    fn op_branch_loop(
        &mut self,
        iter_label: Label,
        continue_label: Label,
        merge_label: Label,
    ) -> Result<()> {
        self.record_edge(iter_label)?;
        let merge_id = self.label_id(merge_label);
        let continue_id = self.label_id(continue_label);
        let iter_id = self.label_id(iter_label);
        self.emit(
            InstructionBuilder::new(Op::LoopMerge)
                .push(merge_id)
                .push(continue_id)
                .push(0) // no loop control
                .build(),
        );
        self.emit(InstructionBuilder::new(Op::Branch).push(iter_id).build());
        self.open_loops.push(OpenLoop { merge: merge_label });
        self.merge_stack.push((merge_label, MergeKind::Loop));
        self.terminated = true;
        Ok(())
    }

    fn op_select(&mut self) -> Result<()> {
        let else_value = self.pop()?;
        let then_value = self.pop()?;
        let cond = self.pop()?;
        let else_value = self.materialize(else_value)?;
        let then_value = self.materialize(then_value)?;
        let cond = self.materialize(cond)?;
        if cond.ty != Type::Scalar(ScalarType::Boolean) {
            return Err(ShaderError::TypeMismatch(format!(
                "select condition must be a bool, got {}",
                cond.ty
            )));
        }
        if then_value.ty != else_value.ty {
            return Err(ShaderError::TypeMismatch(format!(
                "select arms disagree: {} vs {}",
                then_value.ty, else_value.ty
            )));
        }
        let ty_id = self.b.intern_type(&then_value.ty, false)?;
        let id = self.b.new_id();
        let instr = InstructionBuilder::new(Op::Select)
            .push(ty_id)
            .push(id)
            .push(cond.id)
            .push(then_value.id)
            .push(else_value.id)
            .build();
        self.emit(instr);
        self.stack.push(Value::Id(ValueId {
            id,
            ty: then_value.ty,
        }));
        Ok(())
    }

    // %% Plumbing shared with the arithmetic half (arith.rs)

    pub(crate) fn emit(&mut self, instr: shadec_core::spv::Instruction) {
        self.b.emit_func(instr);
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| ShaderError::MalformedIr("stack underflow".to_string()))
    }

    fn pop_values(&mut self, n: usize) -> Result<Vec<Value>> {
        if self.stack.len() < n {
            return Err(ShaderError::MalformedIr("stack underflow".to_string()));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    pub(crate) fn materialize(&mut self, value: Value) -> Result<ValueId> {
        match value {
            Value::Id(v) => Ok(v),
            Value::Access(access) => self.load_access(&access),
            Value::Type(ty) => Err(ShaderError::TypeMismatch(format!(
                "type `{}` used as a value",
                ty
            ))),
            Value::Intrinsic(name) => Err(ShaderError::TypeMismatch(format!(
                "intrinsic `{}` used as a value",
                name
            ))),
            Value::Void => Err(ShaderError::TypeMismatch(
                "a void result has no value".to_string(),
            )),
        }
    }

    fn load_access(&mut self, access: &VariableAccess) -> Result<ValueId> {
        let ptr = self.chain_pointer(access, Op::AccessChain)?;
        let ty_id = self.b.intern_type(&access.ty, access.layout)?;
        let id = self.b.new_id();
        let instr = InstructionBuilder::new(Op::Load)
            .push(ty_id)
            .push(id)
            .push(ptr)
            .build();
        self.emit(instr);
        Ok(ValueId {
            id,
            ty: access.ty.clone(),
        })
    }

    fn store_access(&mut self, access: &VariableAccess, value: &ValueId) -> Result<()> {
        if access.ty != value.ty {
            return Err(ShaderError::TypeMismatch(format!(
                "cannot store {} into {}",
                value.ty, access.ty
            )));
        }
        let ptr = self.chain_pointer(access, Op::AccessChain)?;
        let instr = InstructionBuilder::new(Op::Store).push(ptr).push(value.id).build();
        self.emit(instr);
        Ok(())
    }

    fn chain_pointer(&mut self, access: &VariableAccess, chain_op: Op) -> Result<u32> {
        if access.chain.is_empty() {
            return Ok(access.var_id);
        }
        let ptr_ty = self
            .b
            .intern_ptr_type(access.storage_class, &access.ty, access.layout)?;
        let id = self.b.new_id();
        let mut instr = InstructionBuilder::new(chain_op)
            .push(ptr_ty)
            .push(id)
            .push(access.var_id);
        for (index_id, _) in access.chain.iter() {
            instr = instr.push(*index_id);
        }
        self.emit(instr.build());
        Ok(id)
    }

    /// Spill an immediate composite into a function-local variable and
    /// load one element through an in-bounds chain.
    fn index_immediate(&mut self, container: ValueId, index: ValueId) -> Result<ValueId> {
        let element_ty = container.ty.index_ty().ok_or_else(|| {
            ShaderError::TypeMismatch(format!("cannot index into {}", container.ty))
        })?;
        let spill = self.fresh_function_var(&container.ty, None)?;
        self.store_access(&spill, &container)?;
        let ptr_ty = self
            .b
            .intern_ptr_type(StorageClass::Function, &element_ty, false)?;
        let ptr = self.b.new_id();
        let instr = InstructionBuilder::new(Op::InBoundsAccessChain)
            .push(ptr_ty)
            .push(ptr)
            .push(spill.var_id)
            .push(index.id)
            .build();
        self.emit(instr);
        let ty_id = self.b.intern_type(&element_ty, false)?;
        let id = self.b.new_id();
        let instr = InstructionBuilder::new(Op::Load).push(ty_id).push(id).push(ptr).build();
        self.emit(instr);
        Ok(ValueId { id, ty: element_ty })
    }

    fn fresh_function_var(&mut self, ty: &Type, name: Option<&str>) -> Result<VariableAccess> {
        let ptr = self
            .b
            .intern_ptr_type(StorageClass::Function, ty, false)?;
        let id = self.b.new_id();
        let instr = InstructionBuilder::new(Op::Variable)
            .push(ptr)
            .push(id)
            .push(StorageClass::Function as u32)
            .build();
        self.b.emit_func_var(instr);
        if let Some(name) = name {
            self.b.name_id(id, name);
        }
        Ok(VariableAccess::new(id, StorageClass::Function, ty.clone(), false))
    }

    fn static_index_of(&self, id: u32) -> Option<u32> {
        match self.b.constant_scalar(id) {
            Some((_, ConstScalar::Int(i))) if *i >= 0 => Some(*i as u32),
            _ => None,
        }
    }

    fn composite_extract(&mut self, value: &ValueId, element_ty: Type, index: u32) -> Result<ValueId> {
        let ty_id = self.b.intern_type(&element_ty, false)?;
        let id = self.b.new_id();
        let instr = InstructionBuilder::new(Op::CompositeExtract)
            .push(ty_id)
            .push(id)
            .push(value.id)
            .push(index)
            .build();
        self.emit(instr);
        Ok(ValueId { id, ty: element_ty })
    }

    fn swizzle(&mut self, vector: &ValueId, vt: &VectorType, indices: &[u32]) -> Result<ValueId> {
        let result_ty = Type::Vector(VectorType {
            scalar_ty: vt.scalar_ty.clone(),
            scalar_count: indices.len() as u32,
        });
        let ty_id = self.b.intern_type(&result_ty, false)?;
        let id = self.b.new_id();
        let mut instr = InstructionBuilder::new(Op::VectorShuffle)
            .push(ty_id)
            .push(id)
            .push(vector.id)
            .push(vector.id);
        for index in indices {
            instr = instr.push(*index);
        }
        self.emit(instr.build());
        Ok(ValueId { id, ty: result_ty })
    }

    fn label_id(&mut self, label: Label) -> u32 {
        if let Some(id) = self.label_ids.get(&label) {
            return *id;
        }
        let id = self.b.new_id();
        self.label_ids.insert(label, id);
        id
    }

    fn record_edge(&mut self, target: Label) -> Result<()> {
        let snapshot = if self.stack.is_empty() {
            Vec::new()
        } else {
            let values = std::mem::replace(&mut self.stack, Vec::new());
            let mut ids = Vec::with_capacity(values.len());
            for value in values {
                ids.push(self.materialize(value)?);
            }
            self.stack = ids.iter().cloned().map(Value::Id).collect();
            ids
        };
        self.incoming
            .entry(target)
            .or_insert_with(Vec::new)
            .push((self.cur_block, snapshot));
        Ok(())
    }

    fn common_successor(&self, a: Label, b: Label) -> Option<Label> {
        let succ_a = self.successors.get(&a)?;
        let succ_b = self.successors.get(&b)?;
        succ_a.iter().copied().find(|s| succ_b.contains(s))
    }
}

fn compute_successors(prog: &[Instr]) -> FnvHashMap<Label, Vec<Label>> {
    let mut out: FnvHashMap<Label, Vec<Label>> = Default::default();
    let mut cur: Option<Label> = None;
    for instr in prog.iter() {
        match instr {
            Instr::Label(l) => cur = Some(*l),
            Instr::Branch(l) => {
                if let Some(block) = cur.take() {
                    out.insert(block, vec![*l]);
                }
            }
            Instr::BranchConditional {
                true_label,
                false_label,
            } => {
                if let Some(block) = cur.take() {
                    out.insert(block, vec![*true_label, *false_label]);
                }
            }
            Instr::BranchLoop { iter_label, .. } => {
                if let Some(block) = cur.take() {
                    out.insert(block, vec![*iter_label]);
                }
            }
            _ => {}
        }
    }
    out
}

fn execution_mode_from_name(name: &str) -> Result<ExecutionMode> {
    let mode = match name {
        "OriginLowerLeft" => ExecutionMode::OriginLowerLeft,
        "OriginUpperLeft" => ExecutionMode::OriginUpperLeft,
        "LocalSize" => ExecutionMode::LocalSize,
        "DepthReplacing" => ExecutionMode::DepthReplacing,
        "EarlyFragmentTests" => ExecutionMode::EarlyFragmentTests,
        "PointMode" => ExecutionMode::PointMode,
        _ => {
            return Err(ShaderError::MalformedIr(format!(
                "unknown execution mode `{}`",
                name
            )))
        }
    };
    Ok(mode)
}

fn swizzle_indices(name: &str, width: u32) -> Result<Vec<u32>> {
    if name.is_empty() || name.len() > 4 {
        return Err(ShaderError::InvalidSwizzle(name.to_string()));
    }
    let mut indices = Vec::with_capacity(name.len());
    for c in name.chars() {
        let index = match c {
            'x' | 'r' => 0,
            'y' | 'g' => 1,
            'z' | 'b' => 2,
            'w' | 'a' => 3,
            _ => return Err(ShaderError::InvalidSwizzle(name.to_string())),
        };
        if index >= width {
            return Err(ShaderError::InvalidSwizzle(name.to_string()));
        }
        indices.push(index);
    }
    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swizzles_map_both_alphabets() {
        assert_eq!(swizzle_indices("xyzw", 4).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(swizzle_indices("rgba", 4).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(swizzle_indices("zy", 3).unwrap(), vec![2, 1]);
        assert!(swizzle_indices("q", 4).is_err());
        assert!(swizzle_indices("z", 2).is_err());
        assert!(swizzle_indices("xxxxx", 4).is_err());
    }

    #[test]
    fn successor_table_reads_block_structure() {
        use shadec_core::sir::Instr as I;
        let prog = vec![
            I::Label(1),
            I::BranchConditional {
                true_label: 2,
                false_label: 3,
            },
            I::Label(2),
            I::Branch(4),
            I::Label(3),
            I::Branch(4),
            I::Label(4),
            I::Return,
        ];
        let succ = compute_successors(&prog);
        assert_eq!(succ.get(&1), Some(&vec![2, 3]));
        assert_eq!(succ.get(&2), Some(&vec![4]));
        assert_eq!(succ.get(&3), Some(&vec![4]));
        assert_eq!(succ.get(&4), None);
    }
}
