//! The [`ParameterManifest`] produced for each compiled shader stage.
//!
//! A manifest is immutable once built. It is serde-serializable so tools
//! can dump or cache it next to the bytecode.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::semantic::VertexSemantic;
use crate::types::ParamDataType;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterManifest {
    pub data_params: BTreeMap<String, DataParam>,
    pub param_blocks: BTreeMap<String, BlockDesc>,
    pub textures: BTreeMap<String, ObjectParam>,
    pub load_store_textures: BTreeMap<String, ObjectParam>,
    pub buffers: BTreeMap<String, ObjectParam>,
    pub samplers: BTreeMap<String, ObjectParam>,
    pub vertex_inputs: Vec<VertexInputDesc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    Data(ParamDataType),
    Struct,
}

/// A member of a uniform block. Sizes and offsets are in bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataParam {
    pub name: String,
    pub param_type: ParamType,
    pub block: String,
    pub set: u32,
    pub slot: u32,
    pub element_size: u32,
    pub array_stride: u32,
    pub array_len: u32,
    pub offset: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDesc {
    pub name: String,
    pub set: u32,
    pub slot: u32,
    /// Size in bytes, rounded up to 16.
    pub size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Sampler,
    /// Combined image-sampler; listed under both textures and samplers.
    TextureSampler,
    Texture,
    LoadStoreTexture,
    ByteBuffer,
    RwByteBuffer,
    RwStructuredBuffer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectParam {
    pub name: String,
    pub set: u32,
    pub slot: u32,
    pub count: u32,
    pub object_type: ObjectType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexInputDesc {
    pub name: String,
    pub semantic: VertexSemantic,
    pub semantic_index: u32,
    pub location: u32,
    pub data_type: Option<ParamDataType>,
}

/// Descriptor class of a binding, independent of any graphics API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    UniformBuffer,
    StorageBuffer,
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
}

impl From<ObjectType> for BindingKind {
    fn from(value: ObjectType) -> Self {
        match value {
            ObjectType::Sampler => BindingKind::Sampler,
            ObjectType::TextureSampler => BindingKind::CombinedImageSampler,
            ObjectType::Texture => BindingKind::SampledImage,
            ObjectType::LoadStoreTexture => BindingKind::StorageImage,
            ObjectType::ByteBuffer => BindingKind::UniformTexelBuffer,
            ObjectType::RwByteBuffer => BindingKind::StorageTexelBuffer,
            ObjectType::RwStructuredBuffer => BindingKind::StorageBuffer,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub set: u32,
    pub slot: u32,
    pub kind: BindingKind,
    pub count: u32,
}

impl ParameterManifest {
    /// Every descriptor binding this stage uses, sorted by (set, slot).
    ///
    /// Combined image-samplers appear in two maps but produce a single
    /// binding.
    pub fn bindings(&self) -> Vec<Binding> {
        let mut by_slot: BTreeMap<(u32, u32), Binding> = BTreeMap::new();
        for block in self.param_blocks.values() {
            by_slot.insert(
                (block.set, block.slot),
                Binding {
                    set: block.set,
                    slot: block.slot,
                    kind: BindingKind::UniformBuffer,
                    count: 1,
                },
            );
        }
        let objects = self
            .textures
            .values()
            .chain(self.load_store_textures.values())
            .chain(self.buffers.values())
            .chain(self.samplers.values());
        for object in objects {
            by_slot.entry((object.set, object.slot)).or_insert(Binding {
                set: object.set,
                slot: object.slot,
                kind: object.object_type.into(),
                count: object.count,
            });
        }
        by_slot.into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.data_params.is_empty()
            && self.param_blocks.is_empty()
            && self.textures.is_empty()
            && self.load_store_textures.is_empty()
            && self.buffers.is_empty()
            && self.samplers.is_empty()
            && self.vertex_inputs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(name: &str, set: u32, slot: u32, ty: ObjectType) -> ObjectParam {
        ObjectParam {
            name: name.to_owned(),
            set,
            slot,
            count: 1,
            object_type: ty,
        }
    }

    #[test]
    fn combined_sampler_yields_one_binding() {
        let mut manifest = ParameterManifest::default();
        let tex = object("albedo", 0, 1, ObjectType::TextureSampler);
        manifest.textures.insert("albedo".into(), tex.clone());
        manifest.samplers.insert("albedo".into(), tex);
        manifest.param_blocks.insert(
            "Globals".into(),
            BlockDesc {
                name: "Globals".into(),
                set: 0,
                slot: 0,
                size: 64,
            },
        );
        manifest
            .buffers
            .insert("lights".into(), object("lights", 1, 0, ObjectType::RwStructuredBuffer));

        let bindings = manifest.bindings();
        assert_eq!(bindings.len(), 3);
        assert_eq!(bindings[0].kind, BindingKind::UniformBuffer);
        assert_eq!(bindings[1].kind, BindingKind::CombinedImageSampler);
        assert_eq!((bindings[2].set, bindings[2].slot), (1, 0));
        assert_eq!(bindings[2].kind, BindingKind::StorageBuffer);
    }

    #[test]
    fn manifest_serializes_to_toml() {
        let mut manifest = ParameterManifest::default();
        manifest.data_params.insert(
            "tint".into(),
            DataParam {
                name: "tint".into(),
                param_type: ParamType::Data(ParamDataType::Float4),
                block: "Globals".into(),
                set: 0,
                slot: 0,
                element_size: 16,
                array_stride: 16,
                array_len: 1,
                offset: 0,
            },
        );
        let text = toml::to_string(&manifest).expect("serialize");
        let back: ParameterManifest = toml::from_str(&text).expect("deserialize");
        assert_eq!(back, manifest);
        assert!(!back.is_empty());
    }
}
