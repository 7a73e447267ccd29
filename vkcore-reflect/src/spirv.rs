//! SPIR-V introspection through `spirq`.

use spirq::ty::{DescriptorType, ScalarType, Type};
use spirq::var::Variable;

use crate::compile::ShaderStage;
use crate::introspect::{
    BlockMember, ObjectKind, ObjectUniform, ProgramIntrospection, StageInput,
    UniformBlock,
};
use crate::layout::{BlockField, FieldKind};
use crate::types::{ParamDataType, ScalarKind};

/// Reflect a SPIR-V module into a [`ProgramIntrospection`].
///
/// Vertex inputs are only collected for [`ShaderStage::Vertex`]; the
/// inputs of later stages are varyings, not vertex attributes.
pub fn introspect(
    spirv: &[u32],
    stage: ShaderStage,
) -> Result<ProgramIntrospection, String> {
    let entry_points = spirq::ReflectConfig::new()
        .spv(spirv)
        .ref_all_rscs(true)
        .reflect()
        .map_err(|e| format!("SPIR-V reflection failed: {e:?}"))?;

    let mut program = ProgramIntrospection::default();
    for entry_point in &entry_points {
        for var in entry_point.vars.iter() {
            match var {
                Variable::Descriptor {
                    name,
                    desc_bind,
                    desc_ty,
                    ty,
                    ..
                } => {
                    let name = name.clone().unwrap_or_else(|| {
                        format!("binding_{}_{}", desc_bind.set(), desc_bind.bind())
                    });
                    let kind = match desc_ty {
                        DescriptorType::UniformBuffer(..) => {
                            program.blocks.push(UniformBlock {
                                name,
                                set: Some(desc_bind.set()),
                                slot: Some(desc_bind.bind()),
                                members: block_members(ty)?,
                            });
                            continue;
                        }
                        DescriptorType::Sampler(..) => ObjectKind::Sampler,
                        DescriptorType::CombinedImageSampler(..) => {
                            ObjectKind::CombinedImageSampler
                        }
                        DescriptorType::SampledImage(..) => ObjectKind::SampledImage,
                        DescriptorType::StorageImage(..) => ObjectKind::StorageImage,
                        DescriptorType::UniformTexelBuffer(..) => {
                            ObjectKind::UniformTexelBuffer
                        }
                        DescriptorType::StorageTexelBuffer(..) => {
                            ObjectKind::StorageTexelBuffer
                        }
                        DescriptorType::StorageBuffer(..) => ObjectKind::StorageBuffer,
                        other => {
                            tracing::debug!(
                                "Ignoring descriptor {name} of type {other:?}"
                            );
                            continue;
                        }
                    };
                    program.objects.push(ObjectUniform {
                        name,
                        set: Some(desc_bind.set()),
                        slot: Some(desc_bind.bind()),
                        count: 1,
                        kind,
                    });
                }
                Variable::Input {
                    name, location, ty, ..
                } if stage == ShaderStage::Vertex => {
                    program.vertex_inputs.push(StageInput {
                        name: name.clone().unwrap_or_default(),
                        location: Some(location.loc()),
                        data_type: data_type(ty),
                    });
                }
                _ => {}
            }
        }
    }
    Ok(program)
}

fn block_members(ty: &Type) -> Result<Vec<BlockMember>, String> {
    let Type::Struct(st) = ty else {
        return Err(format!("uniform block has non-struct type {ty:?}"));
    };
    st.members
        .iter()
        .map(|m| {
            let name = m.name.clone().unwrap_or_default();
            // Vulkan requires explicit layout on every uniform block member.
            let Some(offset) = m.offset else {
                return Err(format!(
                    "uniform block member \"{name}\" has no Offset decoration"
                ));
            };
            Ok(BlockMember {
                field: field(name, &m.ty)?,
                reported_offset: offset as u32,
            })
        })
        .collect()
}

fn field(name: String, ty: &Type) -> Result<BlockField, String> {
    match ty {
        Type::Array(a) => {
            let element = field(name, &a.element_ty)?;
            Ok(BlockField {
                array_len: a.nelement.unwrap_or(1).max(1),
                ..element
            })
        }
        Type::Struct(st) => {
            let members = st
                .members
                .iter()
                .map(|m| field(m.name.clone().unwrap_or_default(), &m.ty))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(BlockField::structure(name, members, 1))
        }
        other => {
            let ty = data_type(other)
                .ok_or_else(|| format!("unsupported uniform type {other:?} for \"{name}\""))?;
            Ok(BlockField {
                name,
                kind: FieldKind::Data(ty),
                array_len: 1,
            })
        }
    }
}

fn scalar_kind(ty: &ScalarType) -> Option<ScalarKind> {
    match ty {
        ScalarType::Float { bits: 32 } => Some(ScalarKind::Float),
        ScalarType::Integer {
            bits: 32,
            is_signed: true,
            ..
        } => Some(ScalarKind::Int),
        ScalarType::Integer {
            bits: 32,
            is_signed: false,
            ..
        } => Some(ScalarKind::UInt),
        ScalarType::Boolean => Some(ScalarKind::Bool),
        _ => None,
    }
}

fn data_type(ty: &Type) -> Option<ParamDataType> {
    match ty {
        Type::Scalar(s) => ParamDataType::from_components(scalar_kind(s)?, 1),
        Type::Vector(v) => {
            ParamDataType::from_components(scalar_kind(&v.scalar_ty)?, v.nscalar)
        }
        Type::Matrix(m) => {
            if scalar_kind(&m.vector_ty.scalar_ty)? != ScalarKind::Float {
                return None;
            }
            ParamDataType::matrix(m.nvector, m.vector_ty.nscalar)
        }
        _ => None,
    }
}
