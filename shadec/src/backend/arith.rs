//! Arithmetic dispatch, comparisons, scalar/vector conversion and
//! composite packing for the back-end.
use spirv::Op;

use shadec_core::error::{Result, ShaderError};
use shadec_core::sir::{BinOp, CmpOp, UnOp};
use shadec_core::spv::builder::ConstScalar;
use shadec_core::spv::InstructionBuilder;
use shadec_core::ty::{ArrayType, ScalarType, Type, VectorType};

use super::value::{Value, ValueId};
use super::Backend;

impl Backend {
    fn pop_materialized(&mut self) -> Result<ValueId> {
        let value = self.pop()?;
        self.materialize(value)
    }

    pub(crate) fn emit_binary(
        &mut self,
        opcode: Op,
        result_ty: Type,
        a: u32,
        b: u32,
    ) -> Result<ValueId> {
        let ty_id = self.b.intern_type(&result_ty, false)?;
        let id = self.b.new_id();
        let instr = InstructionBuilder::new(opcode)
            .push(ty_id)
            .push(id)
            .push(a)
            .push(b)
            .build();
        self.emit(instr);
        Ok(ValueId { id, ty: result_ty })
    }

    fn emit_unary(&mut self, opcode: Op, result_ty: Type, a: u32) -> Result<ValueId> {
        let ty_id = self.b.intern_type(&result_ty, false)?;
        let id = self.b.new_id();
        let instr = InstructionBuilder::new(opcode).push(ty_id).push(id).push(a).build();
        self.emit(instr);
        Ok(ValueId { id, ty: result_ty })
    }

    pub(crate) fn binary_op(&mut self, op: BinOp) -> Result<()> {
        let rhs = self.pop_materialized()?;
        let lhs = self.pop_materialized()?;
        let out = match op {
            BinOp::Pow => self.pow(lhs, rhs)?,
            BinOp::And | BinOp::Or => self.logical(op, lhs, rhs)?,
            _ => self.numeric_binary(op, lhs, rhs)?,
        };
        self.stack.push(Value::Id(out));
        Ok(())
    }

    fn pow(&mut self, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        if lhs.ty != rhs.ty {
            return Err(ShaderError::TypeMismatch(format!(
                "cannot pow {} and {}",
                lhs.ty, rhs.ty
            )));
        }
        match lhs.ty.element_scalar() {
            Some(scalar) if scalar.is_float() => {}
            _ => {
                return Err(ShaderError::TypeMismatch(format!(
                    "pow is only defined for float types, got {}",
                    lhs.ty
                )))
            }
        }
        let result_ty = lhs.ty.clone();
        self.ext_inst(crate::stdlib::GLSL_POW, &result_ty, &[lhs, rhs])
    }

    fn logical(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        if lhs.ty != rhs.ty
            || !matches!(lhs.ty.element_scalar(), Some(scalar) if scalar.is_boolean())
        {
            return Err(ShaderError::TypeMismatch(format!(
                "{} needs two booleans, got {} and {}",
                op.as_str(),
                lhs.ty,
                rhs.ty
            )));
        }
        let opcode = match op {
            BinOp::And => Op::LogicalAnd,
            _ => Op::LogicalOr,
        };
        let result_ty = lhs.ty.clone();
        self.emit_binary(opcode, result_ty, lhs.id, rhs.id)
    }

    fn numeric_binary(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId) -> Result<ValueId> {
        let elem1 = lhs.ty.element_scalar().cloned().ok_or_else(|| {
            ShaderError::TypeMismatch(format!("cannot {} a {}", op.as_str(), lhs.ty))
        })?;
        let elem2 = rhs.ty.element_scalar().cloned().ok_or_else(|| {
            ShaderError::TypeMismatch(format!("cannot {} a {}", op.as_str(), rhs.ty))
        })?;
        if elem1 != elem2 {
            return Err(ShaderError::TypeMismatch(format!(
                "cannot {} two values with different (sub)types: {} and {}",
                op.as_str(),
                lhs.ty,
                rhs.ty
            )));
        }

        // Equal scalar or vector types: plain element-wise op.
        if lhs.ty == rhs.ty && (lhs.ty.is_scalar() || lhs.ty.is_vector()) {
            let opcode = elementwise_op(op, &elem1)?;
            return self.emit_binary(opcode, lhs.ty.clone(), lhs.id, rhs.id);
        }

        // Scalar against vector: multiplication has a dedicated op, the
        // rest broadcast the scalar.
        if lhs.ty.is_scalar() && rhs.ty.is_vector() {
            let vt = rhs.ty.as_vector().expect("checked").clone();
            if op == BinOp::Mul {
                require_float(&elem1, "vector-scalar products")?;
                return self.emit_binary(
                    Op::VectorTimesScalar,
                    rhs.ty.clone(),
                    rhs.id,
                    lhs.id,
                );
            }
            let splat = self.splat(&vt, lhs)?;
            let opcode = elementwise_op(op, &elem1)?;
            return self.emit_binary(opcode, rhs.ty.clone(), splat.id, rhs.id);
        }
        if lhs.ty.is_vector() && rhs.ty.is_scalar() {
            let vt = lhs.ty.as_vector().expect("checked").clone();
            if op == BinOp::Mul {
                require_float(&elem1, "vector-scalar products")?;
                return self.emit_binary(
                    Op::VectorTimesScalar,
                    lhs.ty.clone(),
                    lhs.id,
                    rhs.id,
                );
            }
            let splat = self.splat(&vt, rhs)?;
            let opcode = elementwise_op(op, &elem1)?;
            return self.emit_binary(opcode, lhs.ty.clone(), lhs.id, splat.id);
        }

        // Everything further involves a matrix and is multiplication
        // territory, floats only.
        if op != BinOp::Mul {
            return Err(ShaderError::TypeMismatch(format!(
                "cannot {} {} and {}, multiply only",
                op.as_str(),
                lhs.ty,
                rhs.ty
            )));
        }
        require_float(&elem1, "matrix products")?;

        match (lhs.ty.clone(), rhs.ty.clone()) {
            (Type::Matrix(m1), Type::Matrix(m2)) => {
                if m1.ncols != m2.nrows {
                    return Err(ShaderError::ShapeMismatch(format!(
                        "cannot multiply {} by {}",
                        lhs.ty, rhs.ty
                    )));
                }
                let result_ty = Type::Matrix(shadec_core::ty::MatrixType {
                    ncols: m2.ncols,
                    nrows: m1.nrows,
                    scalar_ty: m1.scalar_ty,
                });
                self.emit_binary(Op::MatrixTimesMatrix, result_ty, lhs.id, rhs.id)
            }
            (Type::Matrix(_), Type::Scalar(_)) => {
                self.emit_binary(Op::MatrixTimesScalar, lhs.ty.clone(), lhs.id, rhs.id)
            }
            (Type::Scalar(_), Type::Matrix(_)) => {
                self.emit_binary(Op::MatrixTimesScalar, rhs.ty.clone(), rhs.id, lhs.id)
            }
            (Type::Matrix(m), Type::Vector(v)) => {
                if v.scalar_count != m.ncols {
                    return Err(ShaderError::ShapeMismatch(format!(
                        "incompatible shape for {} x {}",
                        lhs.ty, rhs.ty
                    )));
                }
                let result_ty = Type::Vector(VectorType {
                    scalar_ty: m.scalar_ty,
                    scalar_count: m.nrows,
                });
                self.emit_binary(Op::MatrixTimesVector, result_ty, lhs.id, rhs.id)
            }
            (Type::Vector(v), Type::Matrix(m)) => {
                if v.scalar_count != m.nrows {
                    return Err(ShaderError::ShapeMismatch(format!(
                        "incompatible shape for {} x {}",
                        lhs.ty, rhs.ty
                    )));
                }
                let result_ty = Type::Vector(VectorType {
                    scalar_ty: m.scalar_ty,
                    scalar_count: m.ncols,
                });
                self.emit_binary(Op::VectorTimesMatrix, result_ty, lhs.id, rhs.id)
            }
            _ => Err(ShaderError::TypeMismatch(format!(
                "cannot multiply {} and {}",
                lhs.ty, rhs.ty
            ))),
        }
    }

    pub(crate) fn unary_op(&mut self, op: UnOp) -> Result<()> {
        let value = self.pop_materialized()?;
        let out = match op {
            UnOp::Neg => match value.ty.element_scalar() {
                Some(scalar) if scalar.is_float() => {
                    self.emit_unary(Op::FNegate, value.ty.clone(), value.id)?
                }
                Some(scalar) if scalar.is_signed_integer() => {
                    self.emit_unary(Op::SNegate, value.ty.clone(), value.id)?
                }
                _ => {
                    return Err(ShaderError::TypeMismatch(format!(
                        "cannot negate {}",
                        value.ty
                    )))
                }
            },
            UnOp::Not => match value.ty.element_scalar() {
                Some(scalar) if scalar.is_boolean() => {
                    self.emit_unary(Op::LogicalNot, value.ty.clone(), value.id)?
                }
                _ => {
                    return Err(ShaderError::TypeMismatch(format!(
                        "`not` needs a boolean, got {}",
                        value.ty
                    )))
                }
            },
        };
        self.stack.push(Value::Id(out));
        Ok(())
    }

    pub(crate) fn compare_op(&mut self, op: CmpOp) -> Result<()> {
        let rhs = self.pop_materialized()?;
        let lhs = self.pop_materialized()?;
        if lhs.ty != rhs.ty || !(lhs.ty.is_scalar() || lhs.ty.is_vector()) {
            return Err(ShaderError::TypeMismatch(format!(
                "cannot compare {} and {}",
                lhs.ty, rhs.ty
            )));
        }
        let scalar = lhs.ty.element_scalar().expect("scalar or vector").clone();
        let opcode = if scalar.is_float() {
            match op {
                CmpOp::Lt => Op::FOrdLessThan,
                CmpOp::Le => Op::FOrdLessThanEqual,
                CmpOp::Eq => Op::FOrdEqual,
                CmpOp::Ne => Op::FOrdNotEqual,
                CmpOp::Gt => Op::FOrdGreaterThan,
                CmpOp::Ge => Op::FOrdGreaterThanEqual,
            }
        } else if scalar.is_signed_integer() {
            match op {
                CmpOp::Lt => Op::SLessThan,
                CmpOp::Le => Op::SLessThanEqual,
                CmpOp::Eq => Op::IEqual,
                CmpOp::Ne => Op::INotEqual,
                CmpOp::Gt => Op::SGreaterThan,
                CmpOp::Ge => Op::SGreaterThanEqual,
            }
        } else if scalar.is_integer() {
            match op {
                CmpOp::Lt => Op::ULessThan,
                CmpOp::Le => Op::ULessThanEqual,
                CmpOp::Eq => Op::IEqual,
                CmpOp::Ne => Op::INotEqual,
                CmpOp::Gt => Op::UGreaterThan,
                CmpOp::Ge => Op::UGreaterThanEqual,
            }
        } else {
            match op {
                CmpOp::Eq => Op::LogicalEqual,
                CmpOp::Ne => Op::LogicalNotEqual,
                _ => {
                    return Err(ShaderError::TypeMismatch(
                        "booleans only compare for equality".to_string(),
                    ))
                }
            }
        };
        let result_ty = match &lhs.ty {
            Type::Vector(vt) => Type::Vector(VectorType {
                scalar_ty: ScalarType::Boolean,
                scalar_count: vt.scalar_count,
            }),
            _ => Type::Scalar(ScalarType::Boolean),
        };
        let out = self.emit_binary(opcode, result_ty, lhs.id, rhs.id)?;
        self.stack.push(Value::Id(out));
        Ok(())
    }

    // %% Conversion

    /// Convert a scalar to a scalar or a vector to a same-length vector,
    /// element class by element class. Conversions of known constants
    /// fold into new constants instead of emitting instructions.
    pub(crate) fn convert_scalar_or_vector(
        &mut self,
        out_ty: &Type,
        arg: ValueId,
    ) -> Result<ValueId> {
        if &arg.ty == out_ty {
            return Ok(arg);
        }
        let (out_elem, arg_elem) = match (out_ty, &arg.ty) {
            (Type::Scalar(o), Type::Scalar(a)) => (o.clone(), a.clone()),
            (Type::Vector(o), Type::Vector(a)) if o.scalar_count == a.scalar_count => {
                (o.scalar_ty.clone(), a.scalar_ty.clone())
            }
            (Type::Vector(_), Type::Vector(_)) => {
                return Err(ShaderError::TypeMismatch(
                    "vector conversion needs vectors of equal length".to_string(),
                ))
            }
            _ => {
                return Err(ShaderError::TypeMismatch(format!(
                    "cannot convert {} to {}",
                    arg.ty, out_ty
                )))
            }
        };

        if let Type::Scalar(out_scalar) = out_ty {
            if let Some((_, value)) = self.b.constant_scalar(arg.id).cloned() {
                if let Some(folded) = fold_convert(out_scalar, &value) {
                    let id = self.b.intern_scalar_constant(out_scalar, &folded)?;
                    return Ok(ValueId {
                        id,
                        ty: out_ty.clone(),
                    });
                }
            }
        }

        if out_elem.is_float() {
            if arg_elem.is_float() {
                return self.emit_unary(Op::FConvert, out_ty.clone(), arg.id);
            }
            if arg_elem.is_integer() {
                let opcode = if arg_elem.is_signed_integer() {
                    Op::ConvertSToF
                } else {
                    Op::ConvertUToF
                };
                return self.emit_unary(opcode, out_ty.clone(), arg.id);
            }
            if arg_elem.is_boolean() && out_ty.is_scalar() {
                let zero = self.b.intern_scalar_constant(&out_elem, &ConstScalar::Float(0.0))?;
                let one = self.b.intern_scalar_constant(&out_elem, &ConstScalar::Float(1.0))?;
                return self.select_value(out_ty, arg.id, one, zero);
            }
        } else if out_elem.is_integer() {
            if arg_elem.is_float() {
                let opcode = if out_elem.is_signed_integer() {
                    Op::ConvertFToS
                } else {
                    Op::ConvertFToU
                };
                return self.emit_unary(opcode, out_ty.clone(), arg.id);
            }
            if arg_elem.is_integer() {
                if arg_elem.bits() == out_elem.bits() {
                    // Same width, different signedness.
                    return self.emit_unary(Op::Bitcast, out_ty.clone(), arg.id);
                }
                // Widening extends by the source's signedness: signed
                // values sign-extend, unsigned values zero-extend.
                let opcode = if arg_elem.is_signed_integer() {
                    Op::SConvert
                } else {
                    Op::UConvert
                };
                return self.emit_unary(opcode, out_ty.clone(), arg.id);
            }
            if arg_elem.is_boolean() && out_ty.is_scalar() {
                let zero = self.b.intern_scalar_constant(&out_elem, &ConstScalar::Int(0))?;
                let one = self.b.intern_scalar_constant(&out_elem, &ConstScalar::Int(1))?;
                return self.select_value(out_ty, arg.id, one, zero);
            }
        } else if out_elem.is_boolean() {
            if arg_elem.is_float() {
                let zero = self.b.intern_scalar_constant(&arg_elem, &ConstScalar::Float(0.0))?;
                return self.emit_binary(Op::FOrdNotEqual, out_ty.clone(), arg.id, zero);
            }
            if arg_elem.is_integer() {
                let zero = self.b.intern_scalar_constant(&arg_elem, &ConstScalar::Int(0))?;
                return self.emit_binary(Op::INotEqual, out_ty.clone(), arg.id, zero);
            }
        }
        Err(ShaderError::TypeMismatch(format!(
            "cannot convert {} to {}",
            arg.ty, out_ty
        )))
    }

    fn select_value(&mut self, out_ty: &Type, cond: u32, a: u32, b: u32) -> Result<ValueId> {
        let ty_id = self.b.intern_type(out_ty, false)?;
        let id = self.b.new_id();
        let instr = InstructionBuilder::new(Op::Select)
            .push(ty_id)
            .push(id)
            .push(cond)
            .push(a)
            .push(b)
            .build();
        self.emit(instr);
        Ok(ValueId {
            id,
            ty: out_ty.clone(),
        })
    }

    // %% Composite packing

    /// Broadcast one scalar across a vector shape.
    fn splat(&mut self, vt: &VectorType, scalar: ValueId) -> Result<ValueId> {
        let components = vec![scalar; vt.scalar_count as usize];
        self.vector_packing(vt, components)
    }

    /// Build a vector from scalars and vectors, converting element types
    /// on the way in. All-constant components intern as an
    /// `OpConstantComposite`; anything else constructs at run time.
    pub(crate) fn vector_packing(
        &mut self,
        vt: &VectorType,
        args: Vec<ValueId>,
    ) -> Result<ValueId> {
        let out_ty = Type::Vector(vt.clone());

        // A single numeric vector converts wholesale.
        if args.len() == 1 && args[0].ty.is_vector() {
            let arg = args.into_iter().next().expect("length checked");
            let src = arg.ty.as_vector().expect("checked").clone();
            if !vt.scalar_ty.is_boolean() && !src.scalar_ty.is_boolean() {
                return self.convert_scalar_or_vector(&out_ty, arg);
            }
            return Err(ShaderError::TypeMismatch(
                "boolean vectors do not convert".to_string(),
            ));
        }

        let target_scalar = Type::Scalar(vt.scalar_ty.clone());
        let mut components = Vec::new();
        for arg in args {
            match arg.ty.clone() {
                Type::Scalar(_) => {
                    let component = self.convert_scalar_or_vector(&target_scalar, arg)?;
                    components.push(component);
                }
                Type::Vector(src) => {
                    for i in 0..src.scalar_count {
                        let component = self.composite_extract(
                            &arg,
                            Type::Scalar(src.scalar_ty.clone()),
                            i,
                        )?;
                        let component = if src.scalar_ty != vt.scalar_ty {
                            self.convert_scalar_or_vector(&target_scalar, component)?
                        } else {
                            component
                        };
                        components.push(component);
                    }
                }
                other => {
                    return Err(ShaderError::TypeMismatch(format!(
                        "invalid type to compose a vector: {}",
                        other
                    )))
                }
            }
        }
        if components.len() != vt.scalar_count as usize {
            return Err(ShaderError::ShapeMismatch(format!(
                "{} did not expect {} elements",
                out_ty,
                components.len()
            )));
        }

        let ty_id = self.b.intern_type(&out_ty, false)?;
        if components.iter().all(|c| self.b.is_constant(c.id)) {
            let ids: Vec<u32> = components.iter().map(|c| c.id).collect();
            let id = self.b.intern_constant_composite(ty_id, &ids);
            return Ok(ValueId { id, ty: out_ty });
        }
        let id = self.b.new_id();
        let mut instr = InstructionBuilder::new(Op::CompositeConstruct).push(ty_id).push(id);
        for component in components.iter() {
            instr = instr.push(component.id);
        }
        self.emit(instr.build());
        Ok(ValueId { id, ty: out_ty })
    }

    /// Build an array; every element must already share one type.
    pub(crate) fn array_packing(&mut self, elements: Vec<ValueId>) -> Result<ValueId> {
        if elements.is_empty() {
            return Err(ShaderError::ShapeMismatch(
                "no support for zero-sized arrays".to_string(),
            ));
        }
        let element_ty = elements[0].ty.clone();
        for element in elements.iter() {
            if element.ty != element_ty {
                return Err(ShaderError::TypeMismatch(format!(
                    "array elements must share one type, got {} and {}",
                    element_ty, element.ty
                )));
            }
        }
        let out_ty = Type::Array(ArrayType {
            element_ty: Box::new(element_ty),
            element_count: Some(elements.len() as u32),
        });
        let ty_id = self.b.intern_type(&out_ty, false)?;
        let id = self.b.new_id();
        let mut instr = InstructionBuilder::new(Op::CompositeConstruct).push(ty_id).push(id);
        for element in elements.iter() {
            instr = instr.push(element.id);
        }
        self.emit(instr.build());
        Ok(ValueId { id, ty: out_ty })
    }
}

fn require_float(scalar: &ScalarType, what: &str) -> Result<()> {
    if scalar.is_float() {
        Ok(())
    } else {
        Err(ShaderError::TypeMismatch(format!(
            "{} are only defined for float types",
            what
        )))
    }
}

fn elementwise_op(op: BinOp, scalar: &ScalarType) -> Result<Op> {
    let opcode = if scalar.is_float() {
        match op {
            BinOp::Add => Op::FAdd,
            BinOp::Sub => Op::FSub,
            BinOp::Mul => Op::FMul,
            BinOp::Div => Op::FDiv,
            BinOp::Mod => Op::FMod,
            _ => unreachable!("pow/and/or handled by the caller"),
        }
    } else if scalar.is_signed_integer() {
        match op {
            BinOp::Add => Op::IAdd,
            BinOp::Sub => Op::ISub,
            BinOp::Mul => Op::IMul,
            BinOp::Div => Op::SDiv,
            BinOp::Mod => Op::SMod,
            _ => unreachable!("pow/and/or handled by the caller"),
        }
    } else if scalar.is_integer() {
        match op {
            BinOp::Add => Op::IAdd,
            BinOp::Sub => Op::ISub,
            BinOp::Mul => Op::IMul,
            BinOp::Div => Op::UDiv,
            BinOp::Mod => Op::UMod,
            _ => unreachable!("pow/and/or handled by the caller"),
        }
    } else {
        return Err(ShaderError::TypeMismatch(format!(
            "cannot {} boolean values",
            op.as_str()
        )));
    };
    Ok(opcode)
}

fn fold_convert(out: &ScalarType, value: &ConstScalar) -> Option<ConstScalar> {
    let folded = match out {
        ScalarType::Float { .. } => ConstScalar::Float(match value {
            ConstScalar::Bool(b) => *b as u8 as f64,
            ConstScalar::Int(i) => *i as f64,
            ConstScalar::Float(f) => *f,
        }),
        // Float-to-int casts truncate toward zero.
        ScalarType::Integer { .. } => ConstScalar::Int(match value {
            ConstScalar::Bool(b) => *b as i64,
            ConstScalar::Int(i) => *i,
            ConstScalar::Float(f) => f.trunc() as i64,
        }),
        ScalarType::Boolean => ConstScalar::Bool(match value {
            ConstScalar::Bool(b) => *b,
            ConstScalar::Int(i) => *i != 0,
            ConstScalar::Float(f) => *f != 0.0,
        }),
    };
    Some(folded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_to_int_truncates_toward_zero() {
        match fold_convert(&ScalarType::i32(), &ConstScalar::Float(2.9)) {
            Some(ConstScalar::Int(2)) => {}
            other => panic!("expected 2, got {:?}", other),
        }
        match fold_convert(&ScalarType::i32(), &ConstScalar::Float(-2.9)) {
            Some(ConstScalar::Int(-2)) => {}
            other => panic!("expected -2, got {:?}", other),
        }
    }

    #[test]
    fn elementwise_ops_follow_the_element_class() {
        assert_eq!(elementwise_op(BinOp::Add, &ScalarType::f32()).unwrap(), Op::FAdd);
        assert_eq!(elementwise_op(BinOp::Mod, &ScalarType::i32()).unwrap(), Op::SMod);
        assert_eq!(elementwise_op(BinOp::Div, &ScalarType::u32()).unwrap(), Op::UDiv);
        assert!(elementwise_op(BinOp::Add, &ScalarType::Boolean).is_err());
    }
}
