//! Front-end: walks source stack bytecode and emits stack IR with
//! structured control flow reconstructed from the raw jumps.
use fnv::{FnvHashMap, FnvHashSet};
use num_traits::FromPrimitive;

use shadec_core::error::{Result, ShaderError};
use shadec_core::sir::{BinOp, CmpOp, ConstValue, Instr, Label, ResourceKind, ShaderStage, UnOp};
use shadec_core::ty::TypeRegistry;

use crate::CompileOptions;

pub mod bytecode;
pub mod passes;

use self::bytecode::{ArgAnnotation, FnBytecode, PoolConst, SrcOp, COMPARE_OPS};

// Raw opcode bytes the loop-kind scan looks for.
const RAW_POP_BLOCK: u8 = 87;
const RAW_FOR_ITER: u8 = 93;
const RAW_SETUP_LOOP: u8 = 120;
const RAW_STORE_FAST: u8 = 125;

/// Lower one annotated function to a stack-IR program.
pub fn lower(
    func: &FnBytecode,
    stage: ShaderStage,
    options: &CompileOptions,
) -> Result<Vec<Instr>> {
    let mut walker = Walker::new(func);
    walker.emit(Instr::EntryPoint {
        name: "main".to_string(),
        stage,
        exec_modes: Default::default(),
    });
    walker.lower_arguments()?;
    walker.run()?;
    walker.emit(Instr::FuncEnd);

    let Walker {
        mut out,
        protected,
        value_leaving,
        ..
    } = walker;
    if options.convert_ternary_to_select {
        passes::convert_ternaries(&mut out, &value_leaving);
    }
    passes::collapse_empty_blocks(&mut out, &protected);
    passes::flatten_or_patterns(&mut out);
    Ok(out)
}

/// What the walker knows about a stack entry at compile time.
#[derive(Debug, Clone, PartialEq)]
enum StackVal {
    /// A value that only exists at run time.
    Runtime,
    /// The literal `None`, as loaded for the implicit function return.
    NoneLit,
    Const(ConstValue),
    Name(String),
    /// The `range` builtin marker.
    Range,
    /// The standard-library namespace marker.
    Stdlib,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    While,
    For,
}

#[derive(Debug, Clone)]
struct LoopFrame {
    kind: LoopKind,
    merge_label: Label,
    pop_block_label: Label,
    /// Synthetic label of the loop header; odd so it can never collide
    /// with a bytecode address.
    header_label: Label,
    /// Synthetic label of the block holding the loop condition.
    iter_label: Label,
    continue_label: Label,
    body_label: Label,
    /// Index of the emitted `branch_loop`, so the placeholder condition
    /// block can be cut back out when a `while` test shows up.
    branch_loop_index: usize,
    /// 0: a `range()` call is expected, 1: seen, 2: consumed by the iter.
    range_specified: i32,
    iter_name: String,
}

struct Walker<'a> {
    func: &'a FnBytecode,
    ptr: usize,
    out: Vec<Instr>,
    stack: Vec<StackVal>,
    labels: FnvHashMap<usize, Label>,
    protected: FnvHashSet<Label>,
    loops: Vec<LoopFrame>,
    kinds: FnvHashMap<String, ResourceKind>,
    reg: TypeRegistry,
    /// Labels whose block ends deeper than it started; feeds the
    /// ternary-to-select pass.
    value_leaving: FnvHashSet<Label>,
    cur_block: Option<Label>,
    block_start_depth: usize,
}

impl<'a> Walker<'a> {
    fn new(func: &'a FnBytecode) -> Self {
        Walker {
            func,
            ptr: 0,
            out: Vec::new(),
            stack: Vec::new(),
            labels: Default::default(),
            protected: Default::default(),
            loops: Vec::new(),
            kinds: Default::default(),
            reg: TypeRegistry::new(),
            value_leaving: Default::default(),
            cur_block: None,
            block_start_depth: 0,
        }
    }

    fn emit(&mut self, instr: Instr) {
        match &instr {
            Instr::Branch(_) => {
                debug_assert!(
                    !self.out.last().map_or(false, Instr::is_terminator),
                    "branch emitted after a terminator"
                );
                if let Some(block) = self.cur_block {
                    if self.stack.len() > self.block_start_depth {
                        self.value_leaving.insert(block);
                    }
                }
            }
            Instr::Label(l) => {
                self.cur_block = Some(*l);
                self.block_start_depth = self.stack.len();
            }
            _ => {}
        }
        self.out.push(instr);
    }

    fn lower_arguments(&mut self) -> Result<()> {
        for i in 0..self.func.argcount {
            let name = self
                .func
                .varnames
                .get(i)
                .ok_or_else(|| {
                    ShaderError::MalformedIr("argument count exceeds varnames".to_string())
                })?
                .clone();
            let ann: &ArgAnnotation = self
                .func
                .annotation(&name)
                .ok_or_else(|| ShaderError::UnannotatedArgument(name.clone()))?;
            let kind: ResourceKind = ann.kind.to_lowercase().parse().map_err(|_| {
                ShaderError::BadResourceAnnotation {
                    name: name.clone(),
                    reason: format!("unknown resource kind `{}`", ann.kind),
                }
            })?;
            self.emit(Instr::Resource {
                name: format!("{}.{}", kind.as_str(), name),
                kind,
                slot: ann.slot.clone(),
                type_name: ann.type_name.clone(),
            });
            self.kinds.insert(name, kind);
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        while self.ptr < self.func.code.len() {
            if let Some(&label) = self.labels.get(&self.ptr) {
                if !self.protected.contains(&label) {
                    if !self.out.last().map_or(false, Instr::is_terminator) {
                        self.emit(Instr::Branch(label));
                    }
                    self.emit(Instr::Label(label));
                }
            }
            let offset = self.ptr;
            let opcode = self.next()?;
            let op = SrcOp::from_u8(opcode).ok_or_else(|| ShaderError::UnsupportedSourceOp {
                opcode: format!("#{}", opcode),
                offset,
            })?;
            self.dispatch(op, offset)?;
        }
        if !self.loops.is_empty() {
            return Err(ShaderError::UnresolvedControlFlow(
                "loop not closed at end of bytecode".to_string(),
            ));
        }
        Ok(())
    }

    fn dispatch(&mut self, op: SrcOp, offset: usize) -> Result<()> {
        match op {
            SrcOp::PopTop => {
                self.next()?;
                self.pop()?;
                self.emit(Instr::PopTop);
            }
            SrcOp::RotTwo => {
                self.next()?;
                let a = self.pop()?;
                let b = self.pop()?;
                self.stack.push(a);
                self.stack.push(b);
                self.emit(Instr::RotTwo);
            }
            SrcOp::DupTop => {
                self.next()?;
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| ShaderError::MalformedIr("stack underflow".to_string()))?;
                self.stack.push(top);
                self.emit(Instr::DupTop);
            }
            SrcOp::UnaryPositive => {
                // `+x` is the identity on every shader type.
                self.next()?;
            }
            SrcOp::UnaryNegative => {
                self.next()?;
                self.pop()?;
                self.stack.push(StackVal::Runtime);
                self.emit(Instr::UnaryOp(UnOp::Neg));
            }
            SrcOp::UnaryNot => {
                self.next()?;
                self.pop()?;
                self.stack.push(StackVal::Runtime);
                self.emit(Instr::UnaryOp(UnOp::Not));
            }
            SrcOp::BinaryPower => {
                self.next()?;
                let exp = self.pop()?;
                self.pop()?;
                self.stack.push(StackVal::Runtime);
                if exp == StackVal::Const(ConstValue::Int(2)) {
                    // x ** 2: drop the already-emitted exponent and square.
                    self.emit(Instr::PopTop);
                    self.emit(Instr::DupTop);
                    self.emit(Instr::BinaryOp(BinOp::Mul));
                } else {
                    self.emit(Instr::BinaryOp(BinOp::Pow));
                }
            }
            SrcOp::BinaryMultiply => self.binary(BinOp::Mul)?,
            SrcOp::BinaryModulo => self.binary(BinOp::Mod)?,
            SrcOp::BinaryAdd => self.binary(BinOp::Add)?,
            SrcOp::BinarySubtract => self.binary(BinOp::Sub)?,
            SrcOp::BinaryTrueDivide => self.binary(BinOp::Div)?,
            SrcOp::BinarySubscr => {
                self.next()?;
                self.pop()?;
                self.pop()?;
                self.stack.push(StackVal::Runtime);
                self.emit(Instr::LoadIndex);
            }
            SrcOp::StoreSubscr => {
                self.next()?;
                self.pop()?;
                self.pop()?;
                self.pop()?;
                self.emit(Instr::StoreIndex);
            }
            SrcOp::GetIter => {
                self.next()?;
                let func = self.pop()?;
                if func != StackVal::Range {
                    return Err(ShaderError::UnresolvedControlFlow(
                        "can only loop over range()".to_string(),
                    ));
                }
                self.stack.push(StackVal::Range);
            }
            SrcOp::BreakLoop => {
                self.next()?;
                let merge = self
                    .loops
                    .last()
                    .map(|f| f.merge_label)
                    .ok_or_else(|| {
                        ShaderError::UnresolvedControlFlow("break outside a loop".to_string())
                    })?;
                self.emit(Instr::Branch(merge));
            }
            SrcOp::ReturnValue => {
                self.next()?;
                let result = self.pop()?;
                if result != StackVal::NoneLit {
                    return Err(ShaderError::TypeMismatch(
                        "shaders cannot return a value".to_string(),
                    ));
                }
                if self.ptr < self.func.code.len() {
                    self.emit(Instr::Return);
                }
            }
            SrcOp::PopBlock => self.op_pop_block()?,
            SrcOp::ForIter => self.op_for_iter()?,
            SrcOp::StoreAttr => {
                let i = self.next()?;
                let name = self.name_at(i)?;
                self.pop()?;
                self.pop()?;
                return Err(ShaderError::IllegalStoreTarget(format!(
                    "attribute `{}`",
                    name
                )));
            }
            SrcOp::LoadConst => {
                let i = self.next()? as usize;
                let constant = self.func.consts.get(i).ok_or_else(|| {
                    ShaderError::MalformedIr(format!("constant index {} out of range", i))
                })?;
                match constant {
                    PoolConst::Bool(b) => {
                        let v = ConstValue::Bool(*b);
                        self.emit(Instr::LoadConst(v.clone()));
                        self.stack.push(StackVal::Const(v));
                    }
                    PoolConst::Int(x) => {
                        let v = ConstValue::Int(*x);
                        self.emit(Instr::LoadConst(v.clone()));
                        self.stack.push(StackVal::Const(v));
                    }
                    PoolConst::Float(x) => {
                        let v = ConstValue::float(*x);
                        self.emit(Instr::LoadConst(v.clone()));
                        self.stack.push(StackVal::Const(v));
                    }
                    PoolConst::None => self.stack.push(StackVal::NoneLit),
                    PoolConst::Str(_) => {
                        return Err(ShaderError::UnsupportedConstant { offset });
                    }
                }
            }
            SrcOp::BuildTuple => {
                return Err(ShaderError::TypeMismatch(
                    "tuples are not supported in shaders".to_string(),
                ));
            }
            SrcOp::BuildList => {
                let n = self.next()? as u32;
                for _ in 0..n {
                    self.pop()?;
                }
                self.stack.push(StackVal::Runtime);
                self.emit(Instr::LoadArray { nargs: n });
            }
            SrcOp::BuildMap | SrcOp::BuildConstKeyMap => {
                return Err(ShaderError::TypeMismatch(
                    "dicts are not allowed in shaders".to_string(),
                ));
            }
            SrcOp::LoadAttr => {
                let i = self.next()?;
                let name = self.name_at(i)?;
                let ob = self.pop()?;
                match ob {
                    StackVal::Stdlib => {
                        let func_name = format!("stdlib.{}", name);
                        self.stack.push(StackVal::Name(func_name.clone()));
                        self.emit(Instr::LoadName(func_name));
                    }
                    StackVal::Name(ref tex) if tex.starts_with("texture.") => {
                        let func_name = format!("texture.{}", name);
                        self.stack.push(ob.clone());
                        self.stack.push(StackVal::Name(func_name.clone()));
                        self.emit(Instr::PopTop);
                        self.emit(Instr::LoadName(func_name));
                        self.emit(Instr::LoadName(tex.clone()));
                    }
                    _ => {
                        self.emit(Instr::LoadAttr(name));
                        self.stack.push(StackVal::Runtime);
                    }
                }
            }
            SrcOp::CompareOp => {
                let i = self.next()? as usize;
                let cmp = COMPARE_OPS.get(i).ok_or_else(|| {
                    ShaderError::UnsupportedSourceOp {
                        opcode: format!("COMPARE_OP #{}", i),
                        offset,
                    }
                })?;
                self.pop()?;
                self.pop()?;
                self.stack.push(StackVal::Runtime);
                self.emit(Instr::Compare(CmpOp::from_str(cmp)?));
            }
            SrcOp::JumpForward => {
                let delta = self.next()? as usize;
                let target = self.ptr + delta;
                self.set_label(target)?;
                // The source occasionally emits a dead forward jump right
                // after another jump; it belongs to no live block.
                if self.out.last().map_or(false, Instr::is_terminator) {
                    return Ok(());
                }
                self.emit(Instr::Branch(target as Label));
            }
            SrcOp::JumpIfFalseOrPop | SrcOp::JumpIfTrueOrPop => {
                return Err(ShaderError::UnresolvedControlFlow(
                    "implicit bool conversions are not supported; use `x if y else z`"
                        .to_string(),
                ));
            }
            SrcOp::JumpAbsolute => {
                let target = self.next()? as usize;
                self.set_label(target)?;
                // Dead jump after a `break`'s branch; no live block to end.
                if self.out.last().map_or(false, Instr::is_terminator) {
                    return Ok(());
                }
                self.emit(Instr::Branch(target as Label));
            }
            SrcOp::PopJumpIfFalse => {
                let target = self.next()? as usize;
                self.pop()?;
                let target = self.check_while_test(target);
                self.set_label(self.ptr)?; // go here if the condition holds
                self.set_label(target)?;
                self.emit(Instr::BranchConditional {
                    true_label: self.ptr as Label,
                    false_label: target as Label,
                });
            }
            SrcOp::PopJumpIfTrue => {
                let target = self.next()? as usize;
                self.pop()?;
                let target = self.check_while_test(target);
                self.set_label(self.ptr)?;
                self.set_label(target)?;
                self.emit(Instr::BranchConditional {
                    true_label: target as Label,
                    false_label: self.ptr as Label,
                });
            }
            SrcOp::LoadGlobal => {
                let i = self.next()?;
                let name = self.name_at(i)?;
                match name.as_str() {
                    "stdlib" => self.stack.push(StackVal::Stdlib),
                    "range" => self.stack.push(StackVal::Range),
                    _ => {
                        self.emit(Instr::LoadName(name.clone()));
                        self.stack.push(StackVal::Name(name));
                    }
                }
            }
            SrcOp::ContinueLoop => {
                let target = self.next()? as usize;
                let continue_label = self
                    .loops
                    .last()
                    .map(|f| f.continue_label)
                    .ok_or_else(|| {
                        ShaderError::UnresolvedControlFlow("continue outside a loop".to_string())
                    })?;
                if continue_label != target as Label {
                    return Err(ShaderError::UnresolvedControlFlow(
                        "continue does not target the loop iterator".to_string(),
                    ));
                }
                self.emit(Instr::Branch(continue_label));
            }
            SrcOp::SetupLoop => self.op_setup_loop()?,
            SrcOp::LoadFast => {
                let i = self.next()?;
                let name = self.varname_at(i)?;
                let name = self.resource_name(&name);
                self.emit(Instr::LoadName(name.clone()));
                self.stack.push(StackVal::Name(name));
            }
            SrcOp::StoreFast => {
                let i = self.next()?;
                let name = self.varname_at(i)?;
                self.pop()?;
                let name = self.resource_name(&name);
                self.emit(Instr::StoreName(name));
            }
            SrcOp::CallFunction => self.op_call_function(offset)?,
            SrcOp::LoadDeref => {
                return Err(ShaderError::TypeMismatch(
                    "shaders cannot capture closure variables".to_string(),
                ));
            }
            SrcOp::LoadMethod => {
                let i = self.next()?;
                let name = self.name_at(i)?;
                let ob = self.pop()?;
                match ob {
                    StackVal::Stdlib => {
                        let func_name = format!("stdlib.{}", name);
                        self.stack.push(StackVal::NoneLit);
                        self.stack.push(StackVal::Name(func_name.clone()));
                        self.emit(Instr::LoadName(func_name));
                    }
                    StackVal::Name(ref tex) if tex.starts_with("texture.") => {
                        let func_name = format!("texture.{}", name);
                        self.stack.push(ob.clone());
                        self.stack.push(StackVal::Name(func_name.clone()));
                        self.emit(Instr::PopTop);
                        self.emit(Instr::LoadName(func_name));
                        self.emit(Instr::LoadName(tex.clone()));
                    }
                    _ => {
                        return Err(ShaderError::TypeMismatch(
                            "methods can only be called on textures and the stdlib".to_string(),
                        ));
                    }
                }
            }
            SrcOp::CallMethod => {
                let nargs = self.next()? as u32;
                for _ in 0..nargs {
                    self.pop()?;
                }
                let func = self.pop()?;
                let ob = self.pop()?;
                match (&func, &ob) {
                    (StackVal::Name(f), StackVal::Name(tex))
                        if f.starts_with("texture.") && tex.starts_with("texture.") =>
                    {
                        self.emit(Instr::Call { nargs: nargs + 1 });
                        self.stack.push(StackVal::Runtime);
                    }
                    (StackVal::Name(f), StackVal::NoneLit) if f.starts_with("stdlib.") => {
                        self.emit(Instr::Call { nargs });
                        self.stack.push(StackVal::Runtime);
                    }
                    _ => {
                        return Err(ShaderError::TypeMismatch(
                            "methods can only be called on textures and the stdlib".to_string(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn binary(&mut self, op: BinOp) -> Result<()> {
        self.next()?;
        self.pop()?;
        self.pop()?;
        self.stack.push(StackVal::Runtime);
        self.emit(Instr::BinaryOp(op));
        Ok(())
    }

    fn op_call_function(&mut self, _offset: usize) -> Result<()> {
        let nargs = self.next()? as usize;
        if self.stack.len() < nargs + 1 {
            return Err(ShaderError::MalformedIr("stack underflow".to_string()));
        }
        let args = self.stack.split_off(self.stack.len() - nargs);
        let func = self.pop()?;

        if let StackVal::Name(name) = &func {
            if name.starts_with("texture.") {
                let ob = self.pop()?;
                match ob {
                    StackVal::Name(tex) if tex.starts_with("texture.") => {
                        self.emit(Instr::Call {
                            nargs: nargs as u32 + 1,
                        });
                        self.stack.push(StackVal::Runtime);
                        return Ok(());
                    }
                    _ => {
                        return Err(ShaderError::TypeMismatch(
                            "texture functions expect a texture object".to_string(),
                        ));
                    }
                }
            }
            if let Ok(ty) = self.reg.resolve(name) {
                if ty.is_abstract() {
                    // Applying a parametric type just names a new type.
                    let mut parts = Vec::with_capacity(args.len());
                    for arg in args.iter() {
                        match arg {
                            StackVal::Name(s) => parts.push(s.clone()),
                            StackVal::Const(ConstValue::Int(i)) => parts.push(i.to_string()),
                            _ => {
                                return Err(ShaderError::TypeMismatch(format!(
                                    "invalid argument in `{}(...)` type expression",
                                    name
                                )))
                            }
                        }
                    }
                    self.stack
                        .push(StackVal::Name(format!("{}({})", name, parts.join(","))));
                    return Ok(());
                }
            }
        }

        if func == StackVal::Range {
            let expecting = self
                .loops
                .last()
                .map(|f| f.kind == LoopKind::For && f.range_specified == 0)
                .unwrap_or(false);
            if !expecting {
                return Err(ShaderError::UnresolvedControlFlow(
                    "can only use range() to specify a for-loop".to_string(),
                ));
            }
            match nargs {
                1 => {
                    // range(stop): normalize to (0, stop, 1) in place.
                    self.emit(Instr::LoadConst(ConstValue::Int(0)));
                    self.emit(Instr::RotTwo);
                    self.emit(Instr::LoadConst(ConstValue::Int(1)));
                }
                2 => {
                    self.emit(Instr::LoadConst(ConstValue::Int(1)));
                }
                3 => match &args[2] {
                    StackVal::Const(ConstValue::Int(step)) if *step > 0 => {}
                    _ => {
                        return Err(ShaderError::UnresolvedControlFlow(
                            "range() step must be a constant int > 0".to_string(),
                        ));
                    }
                },
                _ => {
                    return Err(ShaderError::UnresolvedControlFlow(
                        "range() must have 1, 2 or 3 args".to_string(),
                    ));
                }
            }
            if let Some(frame) = self.loops.last_mut() {
                frame.range_specified = 1;
            }
            self.stack.push(StackVal::Range);
            return Ok(());
        }

        match func {
            StackVal::Name(_) => {
                self.emit(Instr::Call {
                    nargs: nargs as u32,
                });
                self.stack.push(StackVal::Runtime);
                Ok(())
            }
            other => Err(ShaderError::TypeMismatch(format!(
                "cannot call a value of this kind: {:?}",
                other
            ))),
        }
    }

    fn op_setup_loop(&mut self) -> Result<()> {
        let delta = self.next()? as usize;
        let here = self.ptr - 2;
        let merge_label = (self.ptr + delta) as Label;
        let frame = LoopFrame {
            kind: LoopKind::While,
            merge_label,
            pop_block_label: (self.ptr + delta - 2) as Label,
            // Odd numbers so synthetic labels never collide with real
            // instruction addresses.
            header_label: here as Label - 1,
            iter_label: here as Label + 1,
            continue_label: self.ptr as Label,
            body_label: here as Label + 3,
            branch_loop_index: 0,
            range_specified: -1,
            iter_name: String::new(),
        };

        self.labels.insert(here, here as Label);
        self.set_label(merge_label as usize)?;
        self.set_label(frame.continue_label as usize)?;
        self.protected.insert(frame.iter_label);
        self.protected.insert(frame.continue_label);

        // A FOR_ITER before the next loop boundary makes this a for-loop;
        // otherwise treat it as a while-loop.
        let mut kind = LoopKind::While;
        let mut i = self.ptr;
        while i < self.func.code.len() {
            match self.func.code[i] {
                RAW_POP_BLOCK | RAW_SETUP_LOOP => break,
                RAW_FOR_ITER => {
                    kind = LoopKind::For;
                    break;
                }
                _ => {}
            }
            i += 2;
        }

        let mut frame = frame;
        frame.kind = kind;
        if kind == LoopKind::For {
            // Emission waits for FOR_ITER.
            frame.range_specified = 0;
            self.loops.push(frame);
            return Ok(());
        }

        self.emit(Instr::Branch(frame.header_label));
        self.emit(Instr::Label(frame.header_label));
        self.emit(Instr::BranchLoop {
            iter_label: frame.iter_label,
            continue_label: frame.continue_label,
            merge_label: frame.merge_label,
        });
        frame.branch_loop_index = self.out.len() - 1;
        // Placeholder condition block; a `while <cond>` test replaces it,
        // `while True` keeps it.
        self.emit(Instr::Label(frame.iter_label));
        self.emit(Instr::LoadConst(ConstValue::Bool(true)));
        self.emit(Instr::BranchConditional {
            true_label: frame.body_label,
            false_label: frame.merge_label,
        });
        self.emit(Instr::Label(frame.body_label));
        self.loops.push(frame);
        Ok(())
    }

    /// A conditional jump straight to the loop end is the `while` test in
    /// disguise: swap the placeholder condition block for the real one.
    fn check_while_test(&mut self, target: usize) -> usize {
        let rewrite = match self.loops.last() {
            Some(f) => {
                (target as Label == f.pop_block_label || target as Label == f.merge_label)
                    && f.kind == LoopKind::While
                    && f.body_label == f.iter_label + 2
            }
            None => false,
        };
        if !rewrite {
            return target;
        }
        let (branch_loop_index, merge_label) = {
            let f = self.loops.last_mut().expect("checked above");
            f.body_label = self.ptr as Label;
            (f.branch_loop_index, f.merge_label)
        };
        // Drop the placeholder: `load_constant true`, the conditional
        // branch and the body label that followed `branch_loop`+`label`.
        for _ in 0..3 {
            self.out.remove(branch_loop_index + 2);
        }
        merge_label as usize
    }

    fn op_for_iter(&mut self) -> Result<()> {
        let delta = self.next()? as usize;
        let here = self.ptr - 2;
        let target = self.ptr + delta;

        {
            let f = self.loops.last().ok_or_else(|| {
                ShaderError::UnresolvedControlFlow("iterator outside a loop".to_string())
            })?;
            if f.kind != LoopKind::For {
                return Err(ShaderError::UnresolvedControlFlow(
                    "unexpected iterator in a while-loop".to_string(),
                ));
            }
            if f.merge_label != (target + 2) as Label {
                return Err(ShaderError::UnresolvedControlFlow(
                    "iterator does not target the loop end".to_string(),
                ));
            }
        }
        match self.pop()? {
            StackVal::Range => {}
            _ => {
                return Err(ShaderError::UnresolvedControlFlow(
                    "can only loop over range()".to_string(),
                ));
            }
        }
        {
            let f = self.loops.last().expect("checked above");
            if f.range_specified != 1 {
                return Err(ShaderError::UnresolvedControlFlow(
                    "loop iter must be a range()".to_string(),
                ));
            }
        }

        // The next instruction stores the iteration variable; fold it in.
        if self.next()? != RAW_STORE_FAST {
            return Err(ShaderError::UnresolvedControlFlow(
                "expected the loop variable store after the iterator".to_string(),
            ));
        }
        let i = self.next()?;
        let iter_name = self.varname_at(i)?;

        let (header_label, iter_label, merge_label) = {
            let f = self.loops.last_mut().expect("checked above");
            f.range_specified = 2;
            f.iter_name = iter_name.clone();
            f.continue_label = here as Label;
            f.body_label = self.ptr as Label;
            (f.header_label, f.iter_label, f.merge_label)
        };
        self.labels.insert(here, here as Label);
        self.set_label(self.ptr)?;

        // Unpack (start, stop, step) and seed the iteration variable.
        self.emit(Instr::StoreName(format!("{}-step", iter_name)));
        self.emit(Instr::StoreName(format!("{}-stop", iter_name)));
        self.emit(Instr::StoreName(format!("{}-start", iter_name)));
        self.emit(Instr::LoadName(format!("{}-start", iter_name)));
        self.emit(Instr::StoreName(iter_name.clone()));
        self.emit(Instr::Branch(header_label));
        self.emit(Instr::Label(header_label));
        self.emit(Instr::BranchLoop {
            iter_label,
            continue_label: here as Label,
            merge_label,
        });
        self.emit(Instr::Label(iter_label));
        self.emit(Instr::LoadName(iter_name.clone()));
        self.emit(Instr::LoadName(format!("{}-stop", iter_name)));
        self.emit(Instr::Compare(CmpOp::Lt));
        self.emit(Instr::BranchConditional {
            true_label: self.ptr as Label,
            false_label: merge_label,
        });
        Ok(())
    }

    fn op_pop_block(&mut self) -> Result<()> {
        self.next()?;
        let frame = self.loops.pop().ok_or_else(|| {
            ShaderError::UnresolvedControlFlow("loop end without a loop".to_string())
        })?;
        if frame.merge_label != self.ptr as Label {
            return Err(ShaderError::UnresolvedControlFlow(
                "loop end does not line up with its merge".to_string(),
            ));
        }
        self.emit(Instr::Label(frame.continue_label));
        match frame.kind {
            LoopKind::While => {}
            LoopKind::For => {
                // The continue block advances the iteration variable.
                self.emit(Instr::LoadName(frame.iter_name.clone()));
                self.emit(Instr::LoadName(format!("{}-step", frame.iter_name)));
                self.emit(Instr::BinaryOp(BinOp::Add));
                self.emit(Instr::StoreName(frame.iter_name.clone()));
            }
        }
        self.emit(Instr::Branch(frame.header_label));
        Ok(())
    }

    // %% Small helpers

    fn next(&mut self) -> Result<u8> {
        let byte = self
            .func
            .code
            .get(self.ptr)
            .copied()
            .ok_or_else(|| ShaderError::MalformedIr("truncated bytecode".to_string()))?;
        self.ptr += 1;
        Ok(byte)
    }

    fn pop(&mut self) -> Result<StackVal> {
        self.stack
            .pop()
            .ok_or_else(|| ShaderError::MalformedIr("stack underflow".to_string()))
    }

    fn set_label(&mut self, pos: usize) -> Result<()> {
        if self.labels.contains_key(&pos) {
            return Ok(());
        }
        if pos < self.ptr {
            return Err(ShaderError::UnresolvedControlFlow(
                "cannot label bytecode that has already been parsed".to_string(),
            ));
        }
        self.labels.insert(pos, pos as Label);
        Ok(())
    }

    fn name_at(&self, i: u8) -> Result<String> {
        self.func
            .names
            .get(i as usize)
            .cloned()
            .ok_or_else(|| ShaderError::MalformedIr(format!("name index {} out of range", i)))
    }

    fn varname_at(&self, i: u8) -> Result<String> {
        self.func
            .varnames
            .get(i as usize)
            .cloned()
            .ok_or_else(|| ShaderError::MalformedIr(format!("varname index {} out of range", i)))
    }

    /// Arguments load and store under their `kind.name` resource names;
    /// plain locals keep their own.
    fn resource_name(&self, name: &str) -> String {
        match self.kinds.get(name) {
            Some(kind) => format!("{}.{}", kind.as_str(), name),
            None => name.to_string(),
        }
    }
}
