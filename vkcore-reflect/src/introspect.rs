//! Compiler-neutral program introspection and manifest construction.
//!
//! [`ProgramIntrospection`] is what a shader front end reports about a
//! compiled stage: its live object uniforms, its uniform blocks with the
//! offsets the compiler chose, and its vertex inputs. [`build_manifest`]
//! turns that into a [`ParameterManifest`], recomputing every block
//! offset independently and cross-checking it against the compiler.

use crate::layout::{BlockField, FieldKind, compute_block_layout};
use crate::manifest::{
    BlockDesc, DataParam, ObjectParam, ObjectType, ParamType, ParameterManifest,
    VertexInputDesc,
};
use crate::semantic::parse_semantic;
use crate::types::ParamDataType;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramIntrospection {
    pub objects: Vec<ObjectUniform>,
    pub blocks: Vec<UniformBlock>,
    pub vertex_inputs: Vec<StageInput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
    StorageBuffer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectUniform {
    pub name: String,
    pub set: Option<u32>,
    pub slot: Option<u32>,
    pub count: u32,
    pub kind: ObjectKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UniformBlock {
    pub name: String,
    pub set: Option<u32>,
    pub slot: Option<u32>,
    pub members: Vec<BlockMember>,
}

/// A top-level block member and the byte offset the compiler assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockMember {
    pub field: BlockField,
    pub reported_offset: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageInput {
    pub name: String,
    pub location: Option<u32>,
    pub data_type: Option<ParamDataType>,
}

/// Build the manifest for one stage.
///
/// Returns a human-readable message when the program violates a binding
/// rule (object or block without a binding slot, vertex input without a
/// location).
///
/// # Panics
/// If the independently computed offset of a plain (non-array) scalar,
/// vector or matrix member disagrees with the compiler-reported offset.
/// Disagreements on array and struct members are logged and the
/// computed offset is kept.
pub fn build_manifest(
    program: &ProgramIntrospection,
) -> Result<ParameterManifest, String> {
    let mut manifest = ParameterManifest::default();

    for object in &program.objects {
        let Some(slot) = object.slot else {
            return Err(format!(
                "Uniform \"{}\" doesn't have a specified binding.",
                object.name
            ));
        };
        let set = object.set.unwrap_or(0);
        let param = |object_type| ObjectParam {
            name: object.name.clone(),
            set,
            slot,
            count: object.count.max(1),
            object_type,
        };
        let name = object.name.clone();
        match object.kind {
            ObjectKind::Sampler => {
                manifest.samplers.insert(name, param(ObjectType::Sampler));
            }
            ObjectKind::CombinedImageSampler => {
                manifest
                    .samplers
                    .insert(name.clone(), param(ObjectType::TextureSampler));
                manifest
                    .textures
                    .insert(name, param(ObjectType::TextureSampler));
            }
            ObjectKind::SampledImage => {
                manifest.textures.insert(name, param(ObjectType::Texture));
            }
            ObjectKind::StorageImage => {
                manifest
                    .load_store_textures
                    .insert(name, param(ObjectType::LoadStoreTexture));
            }
            ObjectKind::UniformTexelBuffer => {
                manifest.buffers.insert(name, param(ObjectType::ByteBuffer));
            }
            ObjectKind::StorageTexelBuffer => {
                manifest.buffers.insert(name, param(ObjectType::RwByteBuffer));
            }
            ObjectKind::StorageBuffer => {
                manifest
                    .buffers
                    .insert(name, param(ObjectType::RwStructuredBuffer));
            }
        }
    }

    for block in &program.blocks {
        add_block(&mut manifest, block)?;
    }

    for input in &program.vertex_inputs {
        let Some(location) = input.location else {
            return Err(format!(
                "Vertex attribute \"{}\" doesn't have a specified location.",
                input.name
            ));
        };
        match parse_semantic(&input.name) {
            Some((semantic, semantic_index)) => {
                manifest.vertex_inputs.push(VertexInputDesc {
                    name: input.name.clone(),
                    semantic,
                    semantic_index,
                    location,
                    data_type: input.data_type,
                });
            }
            None if input.name.starts_with("gl_") => {}
            None => {
                tracing::error!(
                    "Vertex attribute \"{}\" doesn't map to a known semantic",
                    input.name
                );
            }
        }
    }

    Ok(manifest)
}

fn add_block(
    manifest: &mut ParameterManifest,
    block: &UniformBlock,
) -> Result<(), String> {
    let Some(slot) = block.slot else {
        return Err(format!(
            "Uniform block \"{}\" doesn't have a specified binding.",
            block.name
        ));
    };
    let set = block.set.unwrap_or(0);

    let fields: Vec<BlockField> =
        block.members.iter().map(|m| m.field.clone()).collect();
    let layout = compute_block_layout(&fields);

    for (member, placed) in block.members.iter().zip(&layout.fields) {
        let param_type = match member.field.kind {
            FieldKind::Data(ty) => ParamType::Data(ty),
            FieldKind::Struct(_) => ParamType::Struct,
        };
        let plain =
            matches!(member.field.kind, FieldKind::Data(_)) && member.field.array_len == 1;
        if plain {
            assert_eq!(
                member.reported_offset, placed.offset,
                "computed offset of \"{}\" in block \"{}\" disagrees with \
                 the compiler",
                member.field.name, block.name
            );
        } else if member.reported_offset != placed.offset {
            tracing::error!(
                "Block \"{}\" member \"{}\" is at offset {} but std140 places it at {}",
                block.name,
                member.field.name,
                member.reported_offset,
                placed.offset
            );
        }
        manifest.data_params.insert(
            member.field.name.clone(),
            DataParam {
                name: member.field.name.clone(),
                param_type,
                block: block.name.clone(),
                set,
                slot,
                element_size: placed.element_size,
                array_stride: placed.array_stride,
                array_len: placed.array_len,
                offset: placed.offset,
            },
        );
    }

    manifest.param_blocks.insert(
        block.name.clone(),
        BlockDesc {
            name: block.name.clone(),
            set,
            slot,
            size: layout.total_size.next_multiple_of(16),
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::VertexSemantic;

    fn member(field: BlockField, offset: u32) -> BlockMember {
        BlockMember {
            field,
            reported_offset: offset,
        }
    }

    fn globals() -> UniformBlock {
        UniformBlock {
            name: "Globals".into(),
            set: None,
            slot: Some(2),
            members: vec![
                member(BlockField::data("time", ParamDataType::Float1), 0),
                member(BlockField::data("tint", ParamDataType::Float3), 16),
                member(BlockField::array("colors", ParamDataType::Float4, 2), 32),
            ],
        }
    }

    #[test]
    fn block_members_get_computed_offsets() {
        let program = ProgramIntrospection {
            blocks: vec![globals()],
            ..Default::default()
        };
        let manifest = build_manifest(&program).expect("manifest");

        let block = &manifest.param_blocks["Globals"];
        assert_eq!((block.set, block.slot, block.size), (0, 2, 64));

        assert_eq!(manifest.data_params["tint"].offset, 16);
        let colors = &manifest.data_params["colors"];
        assert_eq!(colors.offset, 32);
        assert_eq!(colors.array_stride, 16);
        assert_eq!(colors.array_len, 2);
        assert_eq!(colors.block, "Globals");
    }

    #[test]
    #[should_panic(expected = "disagrees with the compiler")]
    fn plain_member_offset_mismatch_is_fatal() {
        let mut block = globals();
        block.members[1].reported_offset = 12;
        let program = ProgramIntrospection {
            blocks: vec![block],
            ..Default::default()
        };
        let _ = build_manifest(&program);
    }

    #[test]
    fn array_and_struct_offset_mismatch_keeps_computed_layout() {
        let mut block = globals();
        // A tightly packed float[] as a non-std140 compiler would lay it out.
        block.members[2].reported_offset = 28;
        block.members.push(member(
            BlockField::structure(
                "light",
                vec![BlockField::data("intensity", ParamDataType::Float1)],
                1,
            ),
            60,
        ));
        let program = ProgramIntrospection {
            blocks: vec![block],
            ..Default::default()
        };
        let manifest = build_manifest(&program).expect("manifest");
        assert_eq!(manifest.data_params["colors"].offset, 32);
        assert_eq!(manifest.data_params["light"].offset, 64);
        assert_eq!(manifest.data_params["light"].param_type, ParamType::Struct);
        assert_eq!(manifest.param_blocks["Globals"].size, 80);
    }

    #[test]
    fn objects_are_sorted_by_kind() {
        let object = |name: &str, slot, kind| ObjectUniform {
            name: name.into(),
            set: Some(1),
            slot: Some(slot),
            count: 1,
            kind,
        };
        let program = ProgramIntrospection {
            objects: vec![
                object("albedo", 0, ObjectKind::CombinedImageSampler),
                object("shadow", 1, ObjectKind::SampledImage),
                object("out_img", 2, ObjectKind::StorageImage),
                object("particles", 3, ObjectKind::StorageBuffer),
                object("lut", 4, ObjectKind::UniformTexelBuffer),
                object("linear", 5, ObjectKind::Sampler),
            ],
            ..Default::default()
        };
        let manifest = build_manifest(&program).expect("manifest");
        assert_eq!(manifest.textures.len(), 2);
        assert_eq!(manifest.samplers.len(), 2);
        assert_eq!(
            manifest.samplers["albedo"].object_type,
            ObjectType::TextureSampler
        );
        assert_eq!(
            manifest.load_store_textures["out_img"].object_type,
            ObjectType::LoadStoreTexture
        );
        assert_eq!(
            manifest.buffers["particles"].object_type,
            ObjectType::RwStructuredBuffer
        );
        assert_eq!(manifest.buffers["lut"].object_type, ObjectType::ByteBuffer);
        assert!(manifest.param_blocks.is_empty());
    }

    #[test]
    fn missing_binding_is_reported() {
        let program = ProgramIntrospection {
            objects: vec![ObjectUniform {
                name: "tex".into(),
                set: None,
                slot: None,
                count: 1,
                kind: ObjectKind::SampledImage,
            }],
            ..Default::default()
        };
        let err = build_manifest(&program).unwrap_err();
        assert!(err.contains("\"tex\""));
    }

    #[test]
    fn vertex_inputs_map_to_semantics() {
        let input = |name: &str, location| StageInput {
            name: name.into(),
            location,
            data_type: Some(ParamDataType::Float3),
        };
        let program = ProgramIntrospection {
            vertex_inputs: vec![
                input("bs_position", Some(0)),
                input("bs_texcoord1", Some(1)),
                input("gl_InstanceIndex", Some(2)),
                input("mystery", Some(3)),
            ],
            ..Default::default()
        };
        let manifest = build_manifest(&program).expect("manifest");
        assert_eq!(manifest.vertex_inputs.len(), 2);
        assert_eq!(manifest.vertex_inputs[1].semantic, VertexSemantic::TexCoord);
        assert_eq!(manifest.vertex_inputs[1].semantic_index, 1);

        let missing = ProgramIntrospection {
            vertex_inputs: vec![input("bs_normal", None)],
            ..Default::default()
        };
        assert!(build_manifest(&missing).is_err());
    }
}
