//! The closed intrinsic surface a shader can call, and the fixed map of
//! builtin i/o variable names.
use spirv::BuiltIn;

/// How an intrinsic derives its result type from its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    /// Result type equals the first argument's type.
    Same,
    /// Result type is the component type of the (vector) argument.
    Component,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrinsicKind {
    /// A `GLSL.std.450` extended instruction with a fixed number.
    Ext { nr: u32, result: ResultKind },
    /// `abs`, dispatched to `FAbs`/`SAbs` by element class.
    Abs,
    /// Texel fetch from a storage image.
    ImageRead,
    /// Texel store to a storage image; produces no value.
    ImageWrite,
    /// Sampled read through a sampler.
    ImageSample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Intrinsic {
    pub kind: IntrinsicKind,
    pub nargs: usize,
}

// GLSL.std.450 instruction numbers.
pub const GLSL_FABS: u32 = 4;
pub const GLSL_SABS: u32 = 5;
pub const GLSL_POW: u32 = 26;
pub const GLSL_SQRT: u32 = 31;
pub const GLSL_LENGTH: u32 = 66;

/// Look an intrinsic up by its bare name (the part after the `stdlib.` or
/// `texture.` prefix).
pub fn lookup(name: &str) -> Option<Intrinsic> {
    let intrinsic = match name {
        "pow" => Intrinsic {
            kind: IntrinsicKind::Ext {
                nr: GLSL_POW,
                result: ResultKind::Same,
            },
            nargs: 2,
        },
        "sqrt" => Intrinsic {
            kind: IntrinsicKind::Ext {
                nr: GLSL_SQRT,
                result: ResultKind::Same,
            },
            nargs: 1,
        },
        "length" => Intrinsic {
            kind: IntrinsicKind::Ext {
                nr: GLSL_LENGTH,
                result: ResultKind::Component,
            },
            nargs: 1,
        },
        "abs" => Intrinsic {
            kind: IntrinsicKind::Abs,
            nargs: 1,
        },
        "read" => Intrinsic {
            kind: IntrinsicKind::ImageRead,
            nargs: 2,
        },
        "write" => Intrinsic {
            kind: IntrinsicKind::ImageWrite,
            nargs: 3,
        },
        "sample" => Intrinsic {
            kind: IntrinsicKind::ImageSample,
            nargs: 3,
        },
        _ => return None,
    };
    Some(intrinsic)
}

/// Map a builtin i/o variable name to its `BuiltIn` decoration value.
/// `VertexId`/`InstanceId` deliberately land on the Vulkan-consumable
/// `VertexIndex`/`InstanceIndex`.
pub fn builtin_decoration(name: &str) -> Option<BuiltIn> {
    let builtin = match name {
        "Position" => BuiltIn::Position,
        "PointSize" => BuiltIn::PointSize,
        "VertexId" | "VertexIndex" => BuiltIn::VertexIndex,
        "InstanceId" | "InstanceIndex" => BuiltIn::InstanceIndex,
        "FragCoord" => BuiltIn::FragCoord,
        "PointCoord" => BuiltIn::PointCoord,
        "FrontFacing" => BuiltIn::FrontFacing,
        "FragDepth" => BuiltIn::FragDepth,
        "NumWorkgroups" => BuiltIn::NumWorkgroups,
        "WorkgroupId" => BuiltIn::WorkgroupId,
        "LocalInvocationId" => BuiltIn::LocalInvocationId,
        "LocalInvocationIndex" => BuiltIn::LocalInvocationIndex,
        "GlobalInvocationId" => BuiltIn::GlobalInvocationId,
        _ => return None,
    };
    Some(builtin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extended_set_numbers() {
        match lookup("pow").unwrap().kind {
            IntrinsicKind::Ext { nr, result } => {
                assert_eq!(nr, 26);
                assert_eq!(result, ResultKind::Same);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        match lookup("length").unwrap().kind {
            IntrinsicKind::Ext { nr, result } => {
                assert_eq!(nr, 66);
                assert_eq!(result, ResultKind::Component);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert!(lookup("reticulate").is_none());
    }

    #[test]
    fn vertex_id_is_vulkan_flavored() {
        assert_eq!(builtin_decoration("VertexId"), Some(BuiltIn::VertexIndex));
        assert_eq!(builtin_decoration("GlobalInvocationId"), Some(BuiltIn::GlobalInvocationId));
        assert_eq!(builtin_decoration("Narnia"), None);
    }
}
