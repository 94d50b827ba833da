//! Symbolic values the back-end pushes around while executing stack IR.
use spirv::StorageClass;

use shadec_core::error::{Result, ShaderError};
use shadec_core::ty::Type;

/// A SPIR-V id paired with its resolved type.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ValueId {
    pub id: u32,
    pub ty: Type,
}

/// A deferred pointer computation: the root variable plus the ordered
/// index chain walked so far. Plain value data; materialized into an
/// access chain only at load/store time.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct VariableAccess {
    pub var_id: u32,
    pub storage_class: StorageClass,
    pub root_ty: Type,
    /// Whether the root variable's type tree carries block layout
    /// decorations; pointer types into it must agree.
    pub layout: bool,
    /// `(index id, static index)` pairs; the static index is known for
    /// struct field selection and constant subscripts.
    pub chain: Vec<(u32, Option<u32>)>,
    /// Type at the end of the chain.
    pub ty: Type,
}

impl VariableAccess {
    pub fn new(var_id: u32, storage_class: StorageClass, ty: Type, layout: bool) -> Self {
        VariableAccess {
            var_id,
            storage_class,
            root_ty: ty.clone(),
            layout,
            chain: Vec::new(),
            ty,
        }
    }

    /// Extend the chain by one index. Struct selection needs the static
    /// index to know which field type it lands on.
    pub fn index(&self, index_id: u32, static_index: Option<u32>) -> Result<VariableAccess> {
        let element_ty = match &self.ty {
            Type::Struct(st) => {
                let i = static_index.ok_or_else(|| {
                    ShaderError::TypeMismatch(
                        "struct fields require a compile-time index".to_string(),
                    )
                })? as usize;
                st.members
                    .get(i)
                    .map(|(_, ty)| ty.clone())
                    .ok_or_else(|| {
                        ShaderError::TypeMismatch(format!(
                            "field index {} out of range for {}",
                            i, self.ty
                        ))
                    })?
            }
            other => other.index_ty().ok_or_else(|| {
                ShaderError::TypeMismatch(format!("cannot index into {}", other))
            })?,
        };
        let mut chain = self.chain.clone();
        chain.push((index_id, static_index));
        Ok(VariableAccess {
            var_id: self.var_id,
            storage_class: self.storage_class,
            root_ty: self.root_ty.clone(),
            layout: self.layout,
            chain,
            ty: element_ty,
        })
    }
}

/// One entry of the back-end's symbolic stack.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Value {
    /// An SSA value already materialized in the module.
    Id(ValueId),
    /// A pending pointer chain into a variable.
    Access(VariableAccess),
    /// A type used as a value, e.g. a constructor callee.
    Type(Type),
    /// A named intrinsic callee (`stdlib.sqrt`, `texture.read`, ...).
    Intrinsic(String),
    /// The result of a void call; only `pop_top` may consume it.
    Void,
}

#[cfg(test)]
mod tests {
    use super::*;
    use shadec_core::ty::{ArrayType, ScalarType, StructType, VectorType};

    #[test]
    fn chain_tracks_element_types() {
        let ty = Type::Struct(StructType {
            name: None,
            members: vec![(
                "data".to_string(),
                Type::Array(ArrayType {
                    element_ty: Box::new(Type::Vector(VectorType {
                        scalar_ty: ScalarType::f32(),
                        scalar_count: 2,
                    })),
                    element_count: None,
                }),
            )],
        });
        let access = VariableAccess::new(7, StorageClass::Uniform, ty, true);
        let field = access.index(100, Some(0)).unwrap();
        assert!(field.ty.is_array());
        let element = field.index(101, None).unwrap();
        assert!(element.ty.is_vector());
        let scalar = element.index(102, None).unwrap();
        assert_eq!(scalar.ty, Type::Scalar(ScalarType::f32()));
        assert_eq!(scalar.chain.len(), 3);
        assert_eq!(scalar.var_id, 7);
    }

    #[test]
    fn struct_selection_needs_a_static_index() {
        let ty = Type::Struct(StructType {
            name: None,
            members: vec![("x".to_string(), Type::Scalar(ScalarType::f32()))],
        });
        let access = VariableAccess::new(1, StorageClass::Uniform, ty, true);
        assert!(access.index(9, None).is_err());
    }
}
