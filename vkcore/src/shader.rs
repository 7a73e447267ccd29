use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;
use vkcore_reflect::{CompileOutput, ParameterManifest, ShaderStage};

use crate::device::Device;
use crate::mapping;

#[derive(Debug, Error)]
pub enum CreateShaderError {
    /// The program never compiled. The log is kept for the caller.
    #[error("Shader program did not compile:\n{0}")]
    NotCompiled(String),

    #[error("Entry point name contains a NUL byte")]
    InvalidEntryPoint(#[from] std::ffi::NulError),

    #[error("Vulkan error creating shader module: {0}")]
    Vulkan(vk::Result),
}

/// One compiled stage: a shader module plus the parameter manifest
/// reflected from its bytecode.
///
/// Pipeline states hold programs behind an `Arc`, so a module outlives
/// every pipeline built from it.
pub struct ShaderProgram {
    parent: Arc<Device>,
    handle: vk::ShaderModule,
    stage: ShaderStage,
    entry_point: CString,
    manifest: ParameterManifest,
}

impl std::fmt::Debug for ShaderProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderProgram")
            .field("handle", &self.handle)
            .field("stage", &self.stage)
            .field("entry_point", &self.entry_point)
            .finish_non_exhaustive()
    }
}

impl ShaderProgram {
    /// Create a program from a compiler's output.
    ///
    /// A failed compilation has no bytecode; it is reported as
    /// [`CreateShaderError::NotCompiled`] carrying the compile log.
    pub fn new(
        device: &Arc<Device>,
        output: &CompileOutput,
        stage: ShaderStage,
        name: Option<&str>,
    ) -> Result<Self, CreateShaderError> {
        let Some(code) = output.bytecode.as_deref() else {
            tracing::error!("Refusing to create module from failed compile: {}", output.log);
            return Err(CreateShaderError::NotCompiled(output.log.clone()));
        };
        let mut program = Self::from_words(device, code, stage, "main", name)?;
        program.manifest = output.manifest.clone();
        Ok(program)
    }

    /// Create a program from raw SPIR-V words with an empty manifest.
    pub fn from_words(
        device: &Arc<Device>,
        code: &[u32],
        stage: ShaderStage,
        entry_point: &str,
        name: Option<&str>,
    ) -> Result<Self, CreateShaderError> {
        let entry_point = CString::new(entry_point)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);

        // SAFETY: code came from a compiler front end that validated the
        // SPIR-V header.
        let handle = unsafe { device.create_raw_shader_module(&create_info) }
            .map_err(CreateShaderError::Vulkan)?;
        device.name_or_warn(handle, name);

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            stage,
            entry_point,
            manifest: ParameterManifest::default(),
        })
    }

    pub fn raw_handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    pub fn stage_flags(&self) -> vk::ShaderStageFlags {
        mapping::shader_stage_flags(self.stage)
    }

    pub fn manifest(&self) -> &ParameterManifest {
        &self.manifest
    }

    /// The returned struct borrows this program and must not outlive it.
    pub fn stage_create_info(&self) -> vk::PipelineShaderStageCreateInfo<'_> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage_flags())
            .module(self.handle)
            .name(&self.entry_point)
    }
}

impl Drop for ShaderProgram {
    fn drop(&mut self) {
        tracing::debug!("Dropping shader module {:?}", self.handle);
        // SAFETY: handle was created from parent. Pipelines keep their
        // programs alive through an Arc, so none still reference it.
        unsafe { self.parent.destroy_raw_shader_module(self.handle) };
    }
}
