//! Resolution of type names as they appear in resource annotations.
use fnv::FnvHashMap;

use crate::error::{Result, ShaderError};
use crate::spirv::{Dim, ImageFormat};
use crate::ty::{ArrayType, ImageType, MatrixType, ScalarType, StructType, Type, VectorType};

/// Maps type names to structured types. Parametric names (`Array(3,vec2)`,
/// `Struct(a=f32)`) are parsed once and memoized by their literal spelling.
#[derive(Default)]
pub struct TypeRegistry {
    memo: FnvHashMap<String, Type>,
}
impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the string form of a type. The grammar covers scalars
    /// (`f32`, `u8`, `bool`), vectors (`vec3`, `ivec2`, `uvec4`, `bvec2`),
    /// matrices (`mat4`, `mat4x3`), parametric forms (`Vector(3,f64)`,
    /// `Matrix(4,3,f64)`, `Array(T)`, `Array(N,T)`, `Struct(k=T,...)`),
    /// textures (`tex2d`, `tex2d rgba8`) and `sampler`.
    pub fn resolve(&mut self, name: &str) -> Result<Type> {
        let name = name.trim();
        if let Some(ty) = self.memo.get(name) {
            return Ok(ty.clone());
        }
        let ty = parse_type(name)?;
        self.memo.insert(name.to_string(), ty.clone());
        Ok(ty)
    }
}

fn parse_type(name: &str) -> Result<Type> {
    if let Some(ty) = parse_simple(name) {
        return Ok(ty);
    }
    match name {
        "Scalar" | "Vector" | "Matrix" | "Array" | "Struct" => {
            return Ok(Type::Abstract(name.to_string()));
        }
        "sampler" => return Ok(Type::Sampler),
        _ => {}
    }
    if let Some(rest) = strip_prefix(name, "tex") {
        return parse_image(name, rest);
    }
    if let Some(args) = parametric_args(name, "Vector") {
        let args = split_args(args);
        if args.len() != 2 {
            return Err(unknown(name));
        }
        let n = parse_count(args[0], name)?;
        let scalar_ty = expect_scalar(parse_type(args[1])?, name)?;
        return Ok(Type::Vector(VectorType {
            scalar_ty,
            scalar_count: n,
        }));
    }
    if let Some(args) = parametric_args(name, "Matrix") {
        let args = split_args(args);
        if args.len() != 3 {
            return Err(unknown(name));
        }
        let ncols = parse_count(args[0], name)?;
        let nrows = parse_count(args[1], name)?;
        let scalar_ty = expect_scalar(parse_type(args[2])?, name)?;
        if !scalar_ty.is_float() {
            return Err(ShaderError::TypeMismatch(format!(
                "matrix component must be a float type, got `{}`",
                args[2]
            )));
        }
        return Ok(Type::Matrix(MatrixType {
            ncols,
            nrows,
            scalar_ty,
        }));
    }
    if let Some(args) = parametric_args(name, "Array") {
        let args = split_args(args);
        return match args.len() {
            1 => Ok(Type::Array(ArrayType {
                element_ty: Box::new(parse_type(args[0])?),
                element_count: None,
            })),
            2 => Ok(Type::Array(ArrayType {
                element_ty: Box::new(parse_type(args[1])?),
                element_count: Some(args[0].trim().parse::<u32>().map_err(|_| unknown(name))?),
            })),
            _ => Err(unknown(name)),
        };
    }
    if let Some(args) = parametric_args(name, "Struct") {
        let mut members = Vec::new();
        for field in split_args(args) {
            let mut it = field.splitn(2, '=');
            let key = it.next().unwrap_or("").trim();
            let val = it.next().ok_or_else(|| unknown(name))?;
            if key.is_empty() {
                return Err(unknown(name));
            }
            members.push((key.to_string(), parse_type(val)?));
        }
        if members.is_empty() {
            return Err(unknown(name));
        }
        return Ok(Type::Struct(StructType {
            name: None,
            members,
        }));
    }
    Err(unknown(name))
}

fn parse_simple(name: &str) -> Option<Type> {
    let scalar = |s: ScalarType| Some(Type::Scalar(s));
    match name {
        "void" => return Some(Type::Void),
        "bool" => return scalar(ScalarType::Boolean),
        "f16" => return scalar(ScalarType::float(16)),
        "f32" => return scalar(ScalarType::f32()),
        "f64" => return scalar(ScalarType::float(64)),
        "i16" => return scalar(ScalarType::int(16)),
        "i32" => return scalar(ScalarType::i32()),
        "i64" => return scalar(ScalarType::int(64)),
        "u8" => return scalar(ScalarType::uint(8)),
        "u16" => return scalar(ScalarType::uint(16)),
        "u32" => return scalar(ScalarType::u32()),
        "u64" => return scalar(ScalarType::uint(64)),
        _ => {}
    }
    let vector = |scalar_ty: ScalarType, n: u32| {
        Some(Type::Vector(VectorType {
            scalar_ty,
            scalar_count: n,
        }))
    };
    match name {
        "vec2" => return vector(ScalarType::f32(), 2),
        "vec3" => return vector(ScalarType::f32(), 3),
        "vec4" => return vector(ScalarType::f32(), 4),
        "ivec2" => return vector(ScalarType::i32(), 2),
        "ivec3" => return vector(ScalarType::i32(), 3),
        "ivec4" => return vector(ScalarType::i32(), 4),
        "uvec2" => return vector(ScalarType::u32(), 2),
        "uvec3" => return vector(ScalarType::u32(), 3),
        "uvec4" => return vector(ScalarType::u32(), 4),
        "bvec2" => return vector(ScalarType::Boolean, 2),
        "bvec3" => return vector(ScalarType::Boolean, 3),
        "bvec4" => return vector(ScalarType::Boolean, 4),
        _ => {}
    }
    if let Some(dims) = strip_prefix(name, "mat") {
        let matrix = |ncols: u32, nrows: u32| {
            Some(Type::Matrix(MatrixType {
                ncols,
                nrows,
                scalar_ty: ScalarType::f32(),
            }))
        };
        match dims.as_bytes() {
            [c @ b'2'..=b'4'] => return matrix((c - b'0') as u32, (c - b'0') as u32),
            [c @ b'2'..=b'4', b'x', r @ b'2'..=b'4'] => {
                return matrix((c - b'0') as u32, (r - b'0') as u32)
            }
            _ => {}
        }
    }
    None
}

fn parse_image(name: &str, rest: &str) -> Result<Type> {
    let mut it = rest.splitn(2, ' ');
    let dim = match it.next() {
        Some("1d") => Dim::Dim1D,
        Some("2d") => Dim::Dim2D,
        Some("3d") => Dim::Dim3D,
        _ => return Err(unknown(name)),
    };
    let (fmt, scalar_ty) = match it.next() {
        None => (ImageFormat::Unknown, ScalarType::f32()),
        Some(fmt_name) => parse_format(fmt_name.trim()).ok_or_else(|| unknown(name))?,
    };
    Ok(Type::Image(ImageType {
        scalar_ty,
        dim,
        fmt,
    }))
}

fn parse_format(name: &str) -> Option<(ImageFormat, ScalarType)> {
    let fmt = match name {
        "rgba32f" => ImageFormat::Rgba32f,
        "rgba16f" => ImageFormat::Rgba16f,
        "rgba8" => ImageFormat::Rgba8,
        "rgba8snorm" => ImageFormat::Rgba8Snorm,
        "rg32f" => ImageFormat::Rg32f,
        "r32f" => ImageFormat::R32f,
        "rgba32i" => ImageFormat::Rgba32i,
        "rgba8i" => ImageFormat::Rgba8i,
        "r32i" => ImageFormat::R32i,
        "rgba32ui" => ImageFormat::Rgba32ui,
        "rgba8ui" => ImageFormat::Rgba8ui,
        "r32ui" => ImageFormat::R32ui,
        _ => return None,
    };
    let scalar_ty = if name.ends_with("ui") {
        ScalarType::u32()
    } else if name.ends_with('i') {
        ScalarType::i32()
    } else {
        ScalarType::f32()
    };
    Some((fmt, scalar_ty))
}

pub(crate) fn format_name(fmt: ImageFormat) -> &'static str {
    match fmt {
        ImageFormat::Rgba32f => "rgba32f",
        ImageFormat::Rgba16f => "rgba16f",
        ImageFormat::Rgba8 => "rgba8",
        ImageFormat::Rgba8Snorm => "rgba8snorm",
        ImageFormat::Rg32f => "rg32f",
        ImageFormat::R32f => "r32f",
        ImageFormat::Rgba32i => "rgba32i",
        ImageFormat::Rgba8i => "rgba8i",
        ImageFormat::R32i => "r32i",
        ImageFormat::Rgba32ui => "rgba32ui",
        ImageFormat::Rgba8ui => "rgba8ui",
        ImageFormat::R32ui => "r32ui",
        _ => "?",
    }
}

fn unknown(name: &str) -> ShaderError {
    ShaderError::UnknownType(name.to_string())
}

fn expect_scalar(ty: Type, name: &str) -> Result<ScalarType> {
    match ty {
        Type::Scalar(s) => Ok(s),
        _ => Err(unknown(name)),
    }
}

fn parse_count(arg: &str, name: &str) -> Result<u32> {
    let n = arg.trim().parse::<u32>().map_err(|_| unknown(name))?;
    if (2..=4).contains(&n) {
        Ok(n)
    } else {
        Err(unknown(name))
    }
}

fn strip_prefix<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.starts_with(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// `Name(args)` -> `args`, honoring nothing else on the line.
fn parametric_args<'a>(s: &'a str, head: &str) -> Option<&'a str> {
    let rest = strip_prefix(s, head)?;
    if rest.starts_with('(') && rest.ends_with(')') {
        Some(&rest[1..rest.len() - 1])
    } else {
        None
    }
}

/// Split on top-level commas only, so nested parametric forms survive.
fn split_args(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = s[start..].trim();
    if !last.is_empty() || !out.is_empty() {
        out.push(last);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_scalars_and_vectors() {
        let mut reg = TypeRegistry::new();
        assert_eq!(reg.resolve("f32").unwrap(), Type::Scalar(ScalarType::f32()));
        assert_eq!(
            reg.resolve("ivec2").unwrap(),
            Type::Vector(VectorType {
                scalar_ty: ScalarType::i32(),
                scalar_count: 2
            })
        );
        assert_eq!(
            reg.resolve("mat4x3").unwrap(),
            Type::Matrix(MatrixType {
                ncols: 4,
                nrows: 3,
                scalar_ty: ScalarType::f32()
            })
        );
    }

    #[test]
    fn resolves_parametric_forms() {
        let mut reg = TypeRegistry::new();
        let arr = reg.resolve("Array(3,vec2)").unwrap();
        match arr {
            Type::Array(a) => {
                assert_eq!(a.element_count, Some(3));
                assert_eq!(a.element_ty.to_string(), "vec2");
            }
            other => panic!("expected array, got {:?}", other),
        }
        let unsized_arr = reg.resolve("Array(f32)").unwrap();
        assert_eq!(unsized_arr.as_array().unwrap().element_count, None);

        let st = reg.resolve("Struct(a=f32,b=Array(2,vec4))").unwrap();
        let st = st.as_struct().unwrap();
        assert_eq!(st.members.len(), 2);
        assert_eq!(st.members[1].0, "b");
    }

    #[test]
    fn display_round_trips() {
        let mut reg = TypeRegistry::new();
        for name in &[
            "f32",
            "u8",
            "vec3",
            "uvec4",
            "bvec2",
            "mat4",
            "mat2x3",
            "Array(3,vec2)",
            "Array(f32)",
            "Struct(a=f32,b=vec2)",
            "tex2d",
            "tex2d rgba8",
            "sampler",
        ] {
            let ty = reg.resolve(name).unwrap();
            assert_eq!(&ty.to_string(), name);
            assert_eq!(reg.resolve(&ty.to_string()).unwrap(), ty);
        }
    }

    #[test]
    fn abstract_and_unknown_names() {
        let mut reg = TypeRegistry::new();
        assert!(reg.resolve("Vector").unwrap().is_abstract());
        match reg.resolve("complex128") {
            Err(ShaderError::UnknownType(name)) => assert_eq!(name, "complex128"),
            other => panic!("expected UnknownType, got {:?}", other),
        }
    }
}
