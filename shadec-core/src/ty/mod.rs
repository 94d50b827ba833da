//! Structured representations of the GPU types a shader can traffic in.
//!
//! Types are plain values: equality and hashing are structural, so a type
//! doubles as its own memoization key in the module builder.
use std::fmt;

pub mod reg;

pub use self::reg::TypeRegistry;
pub use crate::spirv::{Dim, ImageFormat};

use crate::error::{Result, ShaderError};

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum ScalarType {
    /// Boolean value of either true or false. Booleans never cross the
    /// host boundary; they only exist inside a function body.
    Boolean,
    /// Two's complement integer.
    Integer { bits: u32, is_signed: bool },
    /// IEEE 754 floating-point number.
    Float { bits: u32 },
}
impl ScalarType {
    pub fn int(bits: u32) -> Self {
        Self::Integer {
            bits,
            is_signed: true,
        }
    }
    pub fn uint(bits: u32) -> Self {
        Self::Integer {
            bits,
            is_signed: false,
        }
    }
    pub fn float(bits: u32) -> Self {
        Self::Float { bits }
    }
    pub fn i32() -> Self {
        Self::int(32)
    }
    pub fn u32() -> Self {
        Self::uint(32)
    }
    pub fn f32() -> Self {
        Self::float(32)
    }

    pub fn is_boolean(&self) -> bool {
        matches!(self, Self::Boolean)
    }
    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Integer { .. })
    }
    pub fn is_signed_integer(&self) -> bool {
        matches!(
            self,
            Self::Integer {
                is_signed: true,
                ..
            }
        )
    }
    pub fn is_float(&self) -> bool {
        matches!(self, Self::Float { .. })
    }
    /// Number of bits in the in-memory representation. Booleans have no
    /// representable size.
    pub fn bits(&self) -> Option<u32> {
        match self {
            Self::Boolean => None,
            Self::Integer { bits, .. } => Some(*bits),
            Self::Float { bits } => Some(*bits),
        }
    }
}
impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Boolean => f.write_str("bool"),
            Self::Integer { bits, is_signed } => match is_signed {
                true => write!(f, "i{}", bits),
                false => write!(f, "u{}", bits),
            },
            Self::Float { bits } => write!(f, "f{}", bits),
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct VectorType {
    pub scalar_ty: ScalarType,
    /// Number of scalar components, 2 to 4.
    pub scalar_count: u32,
}
impl fmt::Display for VectorType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.scalar_ty {
            ScalarType::Float { bits: 32 } => write!(f, "vec{}", self.scalar_count),
            ScalarType::Integer {
                bits: 32,
                is_signed: true,
            } => write!(f, "ivec{}", self.scalar_count),
            ScalarType::Integer {
                bits: 32,
                is_signed: false,
            } => write!(f, "uvec{}", self.scalar_count),
            ScalarType::Boolean => write!(f, "bvec{}", self.scalar_count),
            other => write!(f, "Vector({},{})", self.scalar_count, other),
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct MatrixType {
    /// Number of columns, 2 to 4.
    pub ncols: u32,
    /// Number of rows, 2 to 4.
    pub nrows: u32,
    /// Component type; SPIR-V only admits floating-point matrices.
    pub scalar_ty: ScalarType,
}
impl MatrixType {
    /// The column vector type.
    pub fn column_ty(&self) -> VectorType {
        VectorType {
            scalar_ty: self.scalar_ty.clone(),
            scalar_count: self.nrows,
        }
    }
}
impl fmt::Display for MatrixType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.scalar_ty {
            ScalarType::Float { bits: 32 } if self.ncols == self.nrows => {
                write!(f, "mat{}", self.ncols)
            }
            ScalarType::Float { bits: 32 } => write!(f, "mat{}x{}", self.ncols, self.nrows),
            other => write!(f, "Matrix({},{},{})", self.ncols, self.nrows, other),
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct ArrayType {
    pub element_ty: Box<Type>,
    /// `None` means the length is only known at runtime; such arrays are
    /// only admitted as the last member of a buffer block.
    pub element_count: Option<u32>,
}
impl fmt::Display for ArrayType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(n) = self.element_count {
            write!(f, "Array({},{})", n, self.element_ty)
        } else {
            write!(f, "Array({})", self.element_ty)
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct StructType {
    pub name: Option<String>,
    /// Ordered `(field name, field type)` pairs.
    pub members: Vec<(String, Type)>,
}
impl StructType {
    pub fn member_index(&self, name: &str) -> Option<usize> {
        self.members.iter().position(|(n, _)| n == name)
    }
}
impl fmt::Display for StructType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("Struct(")?;
        for (i, (name, ty)) in self.members.iter().enumerate() {
            if i != 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", name, ty)?;
        }
        f.write_str(")")
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub struct ImageType {
    /// Scalar type of a texel access result.
    pub scalar_ty: ScalarType,
    pub dim: Dim,
    /// Texel format. `Unknown` marks a sampled texture; a concrete format
    /// marks a storage image that `read`/`write` can address directly.
    pub fmt: ImageFormat,
}
impl ImageType {
    pub fn is_sampled(&self) -> bool {
        self.fmt == ImageFormat::Unknown
    }
}
impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let dim = match self.dim {
            Dim::Dim1D => "1d",
            Dim::Dim2D => "2d",
            Dim::Dim3D => "3d",
            _ => "?",
        };
        if self.is_sampled() {
            write!(f, "tex{}", dim)
        } else {
            write!(f, "tex{} {}", dim, reg::format_name(self.fmt))
        }
    }
}

macro_rules! declare_accessors {
    ($($is_name:ident / $as_name:ident -> $variant:ident($inner:ident),)+) => {
        $(
            pub fn $is_name(&self) -> bool {
                matches!(self, Type::$variant(..))
            }
            pub fn $as_name(&self) -> Option<&$inner> {
                match self {
                    Type::$variant(x) => Some(x),
                    _ => None,
                }
            }
        )+
    }
}

/// A GPU data type, tagged by kind.
#[derive(PartialEq, Eq, Hash, Clone, Debug)]
pub enum Type {
    /// Pseudo-type for functions that return no data.
    Void,
    Scalar(ScalarType),
    Vector(VectorType),
    Matrix(MatrixType),
    Array(ArrayType),
    Struct(StructType),
    Image(ImageType),
    Sampler,
    /// A parametric type name (`Vector`, `Array`, ...) as it appears in an
    /// annotation before being applied; rejected wherever a concrete type
    /// is required.
    Abstract(String),
}
impl Type {
    declare_accessors! {
        is_scalar / as_scalar -> Scalar(ScalarType),
        is_vector / as_vector -> Vector(VectorType),
        is_matrix / as_matrix -> Matrix(MatrixType),
        is_array / as_array -> Array(ArrayType),
        is_struct / as_struct -> Struct(StructType),
        is_image / as_image -> Image(ImageType),
    }

    pub fn is_abstract(&self) -> bool {
        match self {
            Type::Abstract(_) => true,
            Type::Array(x) => x.element_ty.is_abstract(),
            Type::Struct(x) => x.members.iter().any(|(_, t)| t.is_abstract()),
            _ => false,
        }
    }

    /// The scalar type at the leaves of a scalar/vector/matrix type.
    pub fn element_scalar(&self) -> Option<&ScalarType> {
        match self {
            Type::Scalar(x) => Some(x),
            Type::Vector(x) => Some(&x.scalar_ty),
            Type::Matrix(x) => Some(&x.scalar_ty),
            _ => None,
        }
    }

    /// The type obtained by indexing into this type, if it is indexable.
    pub fn index_ty(&self) -> Option<Type> {
        match self {
            Type::Vector(x) => Some(Type::Scalar(x.scalar_ty.clone())),
            Type::Matrix(x) => Some(Type::Vector(x.column_ty())),
            Type::Array(x) => Some((*x.element_ty).clone()),
            _ => None,
        }
    }

    /// std430-flavored alignment in bytes, for block member layout.
    pub fn align(&self) -> Result<usize> {
        match self {
            Type::Scalar(x) => scalar_size(x),
            Type::Vector(x) => {
                let s = scalar_size(&x.scalar_ty)?;
                Ok(match x.scalar_count {
                    2 => 2 * s,
                    _ => 4 * s,
                })
            }
            Type::Matrix(x) => Type::Vector(x.column_ty()).align(),
            Type::Array(x) => x.element_ty.align(),
            Type::Struct(x) => {
                let mut align = 4;
                for (_, ty) in x.members.iter() {
                    align = align.max(ty.align()?);
                }
                Ok(align)
            }
            _ => Err(ShaderError::TypeMismatch(format!(
                "type {} has no in-memory layout",
                self
            ))),
        }
    }

    /// std430-flavored size in bytes. Runtime-sized arrays report the size
    /// of zero elements.
    pub fn size(&self) -> Result<usize> {
        match self {
            Type::Scalar(x) => scalar_size(x),
            Type::Vector(x) => Ok(scalar_size(&x.scalar_ty)? * x.scalar_count as usize),
            Type::Matrix(x) => {
                let col = Type::Vector(x.column_ty());
                Ok(col.stride()? * x.ncols as usize)
            }
            Type::Array(x) => {
                let n = x.element_count.unwrap_or(0) as usize;
                Ok(x.element_ty.stride()? * n)
            }
            Type::Struct(x) => {
                let mut end = 0;
                for (i, _) in x.members.iter().enumerate() {
                    end = self.member_offset(i)? + x.members[i].1.size()?;
                }
                let align = self.align()?;
                Ok((end + align - 1) / align * align)
            }
            _ => Err(ShaderError::TypeMismatch(format!(
                "type {} has no in-memory layout",
                self
            ))),
        }
    }

    /// Distance between consecutive elements when this type repeats in an
    /// array: the size rounded up to the alignment.
    pub fn stride(&self) -> Result<usize> {
        let align = self.align()?;
        Ok((self.size()? + align - 1) / align * align)
    }

    /// Byte offset of the i-th member of a struct under block layout.
    pub fn member_offset(&self, member_index: usize) -> Result<usize> {
        let members = match self {
            Type::Struct(x) => &x.members,
            _ => {
                return Err(ShaderError::TypeMismatch(format!(
                    "type {} has no members",
                    self
                )))
            }
        };
        let mut offset = 0;
        for (i, (_, ty)) in members.iter().enumerate() {
            let align = ty.align()?;
            offset = (offset + align - 1) / align * align;
            if i == member_index {
                return Ok(offset);
            }
            offset += ty.size()?;
        }
        Err(ShaderError::TypeMismatch(format!(
            "member index {} out of range for {}",
            member_index, self
        )))
    }
}
impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Type::Void => f.write_str("void"),
            Type::Scalar(x) => x.fmt(f),
            Type::Vector(x) => x.fmt(f),
            Type::Matrix(x) => x.fmt(f),
            Type::Array(x) => x.fmt(f),
            Type::Struct(x) => x.fmt(f),
            Type::Image(x) => x.fmt(f),
            Type::Sampler => f.write_str("sampler"),
            Type::Abstract(name) => f.write_str(name),
        }
    }
}

fn scalar_size(x: &ScalarType) -> Result<usize> {
    x.bits().map(|b| (b / 8) as usize).ok_or_else(|| {
        ShaderError::TypeMismatch("booleans have no in-memory representation".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_ty() -> Type {
        Type::Scalar(ScalarType::f32())
    }
    fn vec3_ty() -> Type {
        Type::Vector(VectorType {
            scalar_ty: ScalarType::f32(),
            scalar_count: 3,
        })
    }

    #[test]
    fn scalar_names_round_trip_through_display() {
        assert_eq!(ScalarType::f32().to_string(), "f32");
        assert_eq!(ScalarType::uint(8).to_string(), "u8");
        assert_eq!(ScalarType::int(64).to_string(), "i64");
        assert_eq!(ScalarType::Boolean.to_string(), "bool");
    }

    #[test]
    fn std430_offsets() {
        // vec3 aligns to 16 so the f32 after it lands at 28.
        let st = Type::Struct(StructType {
            name: None,
            members: vec![
                ("a".to_string(), f32_ty()),
                ("b".to_string(), vec3_ty()),
                ("c".to_string(), f32_ty()),
            ],
        });
        assert_eq!(st.member_offset(0).unwrap(), 0);
        assert_eq!(st.member_offset(1).unwrap(), 16);
        assert_eq!(st.member_offset(2).unwrap(), 28);
    }

    #[test]
    fn array_stride_rounds_to_alignment() {
        let arr = Type::Array(ArrayType {
            element_ty: Box::new(vec3_ty()),
            element_count: Some(2),
        });
        assert_eq!(arr.as_array().unwrap().element_ty.stride().unwrap(), 16);
        assert_eq!(arr.size().unwrap(), 32);
    }

    #[test]
    fn abstract_types_propagate() {
        let arr = Type::Array(ArrayType {
            element_ty: Box::new(Type::Abstract("Vector".to_string())),
            element_count: None,
        });
        assert!(arr.is_abstract());
        assert!(!vec3_ty().is_abstract());
    }
}
