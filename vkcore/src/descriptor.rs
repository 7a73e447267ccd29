//! Descriptor set layouts and pipeline layouts derived from parameter
//! manifests.
//!
//! Every stage of a pipeline contributes its manifest's bindings. Stages
//! that share a (set, slot) must agree on the descriptor type; their stage
//! flags are merged into one binding. Sets are numbered densely from 0, so
//! a gap in the shaders' set numbers becomes an empty layout.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;
use vkcore_reflect::ParameterManifest;

use crate::device::Device;
use crate::mapping;
use crate::shader::ShaderProgram;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateLayoutError {
    #[error("Stages disagree on the descriptor at set {set}, binding {slot}")]
    ConflictingBinding { set: u32, slot: u32 },

    #[error("Vulkan error creating descriptor set layout: {0}")]
    SetLayout(vk::Result),

    #[error("Vulkan error creating pipeline layout: {0}")]
    PipelineLayout(vk::Result),
}

// ---------------------------------------------------------------------------
// DescriptorBindingDesc
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBindingDesc {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    /// Array length.
    pub count: u32,
    pub stage_flags: vk::ShaderStageFlags,
}

impl From<DescriptorBindingDesc> for vk::DescriptorSetLayoutBinding<'static> {
    fn from(b: DescriptorBindingDesc) -> Self {
        vk::DescriptorSetLayoutBinding::default()
            .binding(b.binding)
            .descriptor_type(b.descriptor_type)
            .descriptor_count(b.count)
            .stage_flags(b.stage_flags)
    }
}

/// Merge the bindings of every stage into per-set binding lists.
///
/// The result has an entry for every set from 0 to the highest used set,
/// each sorted by binding slot.
pub fn merge_bindings(
    stages: &[(&ParameterManifest, vk::ShaderStageFlags)],
) -> Result<Vec<Vec<DescriptorBindingDesc>>, CreateLayoutError> {
    let mut merged: BTreeMap<(u32, u32), DescriptorBindingDesc> = BTreeMap::new();
    for &(manifest, stage_flags) in stages {
        for binding in manifest.bindings() {
            let descriptor_type = mapping::descriptor_type(binding.kind);
            match merged.get_mut(&(binding.set, binding.slot)) {
                Some(existing) => {
                    if existing.descriptor_type != descriptor_type {
                        return Err(CreateLayoutError::ConflictingBinding {
                            set: binding.set,
                            slot: binding.slot,
                        });
                    }
                    existing.stage_flags |= stage_flags;
                    existing.count = existing.count.max(binding.count);
                }
                None => {
                    merged.insert(
                        (binding.set, binding.slot),
                        DescriptorBindingDesc {
                            binding: binding.slot,
                            descriptor_type,
                            count: binding.count,
                            stage_flags,
                        },
                    );
                }
            }
        }
    }

    let set_count = merged
        .keys()
        .map(|&(set, _)| set + 1)
        .max()
        .unwrap_or(0);
    let mut sets = vec![Vec::new(); set_count as usize];
    for ((set, _), desc) in merged {
        sets[set as usize].push(desc);
    }
    Ok(sets)
}

// ---------------------------------------------------------------------------
// DescriptorSetLayout
// ---------------------------------------------------------------------------

pub struct DescriptorSetLayout {
    parent: Arc<Device>,
    handle: vk::DescriptorSetLayout,
}

impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl DescriptorSetLayout {
    pub fn new(device: &Arc<Device>, bindings: &[DescriptorBindingDesc]) -> Result<Self, vk::Result> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding<'_>> =
            bindings.iter().copied().map(Into::into).collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        // SAFETY: create_info references binding descriptions that live
        // for the duration of this call.
        let handle = unsafe { device.create_raw_descriptor_set_layout(&create_info) }?;
        Ok(Self {
            parent: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping descriptor set layout {:?}", self.handle);
        // SAFETY: handle was created from parent. The pipeline layout that
        // references it is dropped first.
        unsafe { self.parent.destroy_raw_descriptor_set_layout(self.handle) };
    }
}

// ---------------------------------------------------------------------------
// PipelineLayout
// ---------------------------------------------------------------------------

/// A pipeline layout together with the set layouts it was built from.
pub struct PipelineLayout {
    parent: Arc<Device>,
    handle: vk::PipelineLayout,
    set_layouts: Vec<DescriptorSetLayout>,
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.handle)
            .field("set_layouts", &self.set_layouts)
            .finish_non_exhaustive()
    }
}

impl PipelineLayout {
    /// Build the layout shared by every pipeline of `programs`.
    pub fn for_programs(
        device: &Arc<Device>,
        programs: &[Arc<ShaderProgram>],
        name: Option<&str>,
    ) -> Result<Self, CreateLayoutError> {
        let stages: Vec<_> = programs
            .iter()
            .map(|p| (p.manifest(), p.stage_flags()))
            .collect();
        let sets = merge_bindings(&stages)?;

        let set_layouts = sets
            .iter()
            .map(|bindings| DescriptorSetLayout::new(device, bindings))
            .collect::<Result<Vec<_>, _>>()
            .map_err(CreateLayoutError::SetLayout)?;
        let raw_layouts: Vec<_> = set_layouts.iter().map(DescriptorSetLayout::raw_handle).collect();

        let create_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&raw_layouts);
        // SAFETY: every set layout in create_info was created above from
        // device and is still alive.
        let handle = unsafe { device.create_raw_pipeline_layout(&create_info) }
            .map_err(CreateLayoutError::PipelineLayout)?;
        device.name_or_warn(handle, name);

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            set_layouts,
        })
    }

    pub fn raw_handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    pub fn set_layouts(&self) -> &[DescriptorSetLayout] {
        &self.set_layouts
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline layout {:?}", self.handle);
        // SAFETY: handle was created from parent. Owners destroy their
        // pipelines before the layout; set layouts drop after this.
        unsafe { self.parent.destroy_raw_pipeline_layout(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use vkcore_reflect::manifest::{BlockDesc, ObjectParam, ObjectType};

    use super::*;

    fn block(name: &str, set: u32, slot: u32) -> BlockDesc {
        BlockDesc {
            name: name.to_owned(),
            set,
            slot,
            size: 16,
        }
    }

    fn texture(name: &str, set: u32, slot: u32) -> ObjectParam {
        ObjectParam {
            name: name.to_owned(),
            set,
            slot,
            count: 1,
            object_type: ObjectType::Texture,
        }
    }

    #[test]
    fn shared_bindings_merge_stage_flags() {
        let mut vs = ParameterManifest::default();
        vs.param_blocks.insert("Camera".into(), block("Camera", 0, 0));
        let mut fs = ParameterManifest::default();
        fs.param_blocks.insert("Camera".into(), block("Camera", 0, 0));
        fs.textures.insert("albedo".into(), texture("albedo", 0, 1));

        let sets = merge_bindings(&[
            (&vs, vk::ShaderStageFlags::VERTEX),
            (&fs, vk::ShaderStageFlags::FRAGMENT),
        ])
        .unwrap();

        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].len(), 2);
        assert_eq!(sets[0][0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(
            sets[0][0].stage_flags,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(sets[0][1].binding, 1);
        assert_eq!(sets[0][1].stage_flags, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn set_gaps_become_empty_layouts() {
        let mut fs = ParameterManifest::default();
        fs.textures.insert("shadow".into(), texture("shadow", 2, 0));
        let sets = merge_bindings(&[(&fs, vk::ShaderStageFlags::FRAGMENT)]).unwrap();
        assert_eq!(sets.len(), 3);
        assert!(sets[0].is_empty());
        assert!(sets[1].is_empty());
        assert_eq!(sets[2].len(), 1);
    }

    #[test]
    fn conflicting_types_are_rejected() {
        let mut vs = ParameterManifest::default();
        vs.param_blocks.insert("Camera".into(), block("Camera", 0, 0));
        let mut fs = ParameterManifest::default();
        fs.textures.insert("albedo".into(), texture("albedo", 0, 0));
        let err = merge_bindings(&[
            (&vs, vk::ShaderStageFlags::VERTEX),
            (&fs, vk::ShaderStageFlags::FRAGMENT),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            CreateLayoutError::ConflictingBinding { set: 0, slot: 0 }
        ));
    }

    #[test]
    fn no_bindings_means_no_sets() {
        let empty = ParameterManifest::default();
        let sets = merge_bindings(&[(&empty, vk::ShaderStageFlags::COMPUTE)]).unwrap();
        assert!(sets.is_empty());
    }
}
