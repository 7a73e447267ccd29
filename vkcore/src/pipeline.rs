//! Pipeline state objects and the per-state pipeline cache.
//!
//! A [`GraphicsPipelineState`] holds everything about a pipeline that is
//! known up front: shader stages, blend, rasterizer and depth-stencil
//! state, and the pipeline layout. The parts only known at draw time
//! (render-target formats, vertex layout, attachment read-only mask and
//! topology) form a [`GpuPipelineKey`]. Each distinct key is built once
//! and cached for the life of the state object.
//!
//! Render-target and vertex-input layouts are interned by the
//! [`GpuContext`] into small integer identities so keys stay `Copy`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};

use ash::vk;
use bitflags::bitflags;
use thiserror::Error;
use vkcore_reflect::ShaderStage;

use crate::barrier;
use crate::context::GpuContext;
use crate::descriptor::{CreateLayoutError, PipelineLayout};
use crate::device::Device;
pub use crate::mapping::{
    BlendFactor, BlendOp, CompareFunc, CullMode, DrawOp, PolygonMode, StencilOp,
};
use crate::shader::ShaderProgram;

bitflags! {
    /// Attachments a render pass only reads from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ReadOnlyFlags: u8 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// Formats and sample count of a render target's attachments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderTargetLayout {
    pub colors: Vec<vk::Format>,
    pub depth: Option<vk::Format>,
    pub samples: vk::SampleCountFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTargetId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBindingDesc {
    pub binding: u32,
    pub stride: u32,
    pub per_instance: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttributeDesc {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct VertexInputLayout {
    pub bindings: Vec<VertexBindingDesc>,
    pub attributes: Vec<VertexAttributeDesc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexInputId(pub u32);

/// Hands out a stable small integer for every distinct value it sees.
pub struct Interner<T> {
    inner: Mutex<InternerInner<T>>,
}

struct InternerInner<T> {
    ids: HashMap<Arc<T>, u32>,
    values: Vec<Arc<T>>,
}

impl<T> Default for Interner<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(InternerInner {
                ids: HashMap::new(),
                values: Vec::new(),
            }),
        }
    }
}

impl<T> std::fmt::Debug for Interner<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interner").finish_non_exhaustive()
    }
}

impl<T: Hash + Eq> Interner<T> {
    pub fn intern(&self, value: T) -> u32 {
        let mut inner = self.inner.lock().expect("interner mutex poisoned");
        if let Some(&id) = inner.ids.get(&value) {
            return id;
        }
        let id = inner.values.len() as u32;
        let value = Arc::new(value);
        inner.values.push(Arc::clone(&value));
        inner.ids.insert(value, id);
        id
    }

    pub fn get(&self, id: u32) -> Option<Arc<T>> {
        let inner = self.inner.lock().expect("interner mutex poisoned");
        inner.values.get(id as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("interner mutex poisoned").values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Pipeline cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuPipelineKey {
    pub render_target: RenderTargetId,
    pub vertex_input: VertexInputId,
    pub read_only: ReadOnlyFlags,
    pub draw_op: DrawOp,
}

/// Key-to-pipeline map guarded by one mutex. A miss builds the pipeline
/// with the lock held, so concurrent requests for the same key build it
/// once.
pub struct PipelineCache<V> {
    entries: Mutex<HashMap<GpuPipelineKey, V>>,
}

impl<V> Default for PipelineCache<V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Copy> PipelineCache<V> {
    pub fn get_or_try_insert_with<E>(
        &self,
        key: GpuPipelineKey,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        let mut entries = self.entries.lock().expect("pipeline cache mutex poisoned");
        if let Some(&value) = entries.get(&key) {
            return Ok(value);
        }
        let value = build()?;
        entries.insert(key, value);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("pipeline cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return every cached value.
    pub fn drain(&mut self) -> Vec<V> {
        let entries = self
            .entries
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        entries.drain().map(|(_, v)| v).collect()
    }
}

// ---------------------------------------------------------------------------
// Fixed-function state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachmentBlend {
    pub enabled: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub color_op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub alpha_op: BlendOp,
    pub write_mask: vk::ColorComponentFlags,
}

impl Default for AttachmentBlend {
    fn default() -> Self {
        Self {
            enabled: false,
            src_color: BlendFactor::One,
            dst_color: BlendFactor::Zero,
            color_op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            alpha_op: BlendOp::Add,
            write_mask: vk::ColorComponentFlags::RGBA,
        }
    }
}

/// Blend state of every colour attachment.
///
/// Unless `independent` is set, the first entry of `attachments` applies
/// to every attachment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlendState {
    pub attachments: Vec<AttachmentBlend>,
    pub independent: bool,
    pub alpha_to_coverage: bool,
}

impl BlendState {
    fn attachment(&self, index: usize) -> AttachmentBlend {
        let index = if self.independent { index } else { 0 };
        self.attachments.get(index).copied().unwrap_or_default()
    }

    /// Per-attachment blend state for `count` attachments. Read-only colour
    /// attachments get an empty write mask.
    pub fn resolve(
        &self,
        count: usize,
        read_only: ReadOnlyFlags,
    ) -> Vec<vk::PipelineColorBlendAttachmentState> {
        (0..count)
            .map(|i| {
                let a = self.attachment(i);
                let write_mask = if read_only.contains(ReadOnlyFlags::COLOR) {
                    vk::ColorComponentFlags::empty()
                } else {
                    a.write_mask & vk::ColorComponentFlags::RGBA
                };
                vk::PipelineColorBlendAttachmentState::default()
                    .blend_enable(a.enabled)
                    .src_color_blend_factor(a.src_color.into())
                    .dst_color_blend_factor(a.dst_color.into())
                    .color_blend_op(a.color_op.into())
                    .src_alpha_blend_factor(a.src_alpha.into())
                    .dst_alpha_blend_factor(a.dst_alpha.into())
                    .alpha_blend_op(a.alpha_op.into())
                    .color_write_mask(write_mask)
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterizerState {
    pub polygon_mode: PolygonMode,
    pub cull_mode: CullMode,
    pub depth_bias: f32,
    pub depth_bias_clamp: f32,
    pub slope_scaled_depth_bias: f32,
    pub depth_clip: bool,
}

impl Default for RasterizerState {
    fn default() -> Self {
        Self {
            polygon_mode: PolygonMode::Solid,
            cull_mode: CullMode::CounterClockwise,
            depth_bias: 0.0,
            depth_bias_clamp: 0.0,
            slope_scaled_depth_bias: 0.0,
            depth_clip: true,
        }
    }
}

impl RasterizerState {
    fn create_info(&self) -> vk::PipelineRasterizationStateCreateInfo<'static> {
        let depth_clamp = !self.depth_clip;
        vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(depth_clamp)
            .polygon_mode(self.polygon_mode.into())
            .cull_mode(self.cull_mode.into())
            .front_face(vk::FrontFace::CLOCKWISE)
            .depth_bias_enable(self.depth_bias != 0.0)
            .depth_bias_constant_factor(self.depth_bias)
            .depth_bias_slope_factor(self.slope_scaled_depth_bias)
            .depth_bias_clamp(if depth_clamp { self.depth_bias_clamp } else { 0.0 })
            .line_width(1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StencilFace {
    pub fail: StencilOp,
    pub depth_fail: StencilOp,
    pub pass: StencilOp,
    pub compare: CompareFunc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthStencilState {
    pub depth_read: bool,
    pub depth_write: bool,
    pub depth_compare: CompareFunc,
    pub stencil_enable: bool,
    pub front: StencilFace,
    pub back: StencilFace,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
}

impl Default for DepthStencilState {
    fn default() -> Self {
        let face = StencilFace {
            compare: CompareFunc::AlwaysPass,
            ..Default::default()
        };
        Self {
            depth_read: true,
            depth_write: true,
            depth_compare: CompareFunc::Less,
            stencil_enable: false,
            front: face,
            back: face,
            stencil_read_mask: 0xFF,
            stencil_write_mask: 0xFF,
        }
    }
}

impl DepthStencilState {
    fn face(&self, face: StencilFace, keep: bool) -> vk::StencilOpState {
        let op = |op: StencilOp| {
            if keep {
                vk::StencilOp::KEEP
            } else {
                op.into()
            }
        };
        vk::StencilOpState {
            fail_op: op(face.fail),
            pass_op: op(face.pass),
            depth_fail_op: op(face.depth_fail),
            compare_op: face.compare.into(),
            compare_mask: u32::from(self.stencil_read_mask),
            write_mask: u32::from(self.stencil_write_mask),
            // Dynamic.
            reference: 0,
        }
    }

    /// The depth-stencil state for an attachment with the given read-only
    /// mask. Depth writes need both the description and a writable depth
    /// aspect; a read-only stencil aspect turns every stencil op into KEEP.
    pub fn resolve(&self, read_only: ReadOnlyFlags) -> vk::PipelineDepthStencilStateCreateInfo<'static> {
        let depth_write = self.depth_write && !read_only.contains(ReadOnlyFlags::DEPTH);
        let keep = read_only.contains(ReadOnlyFlags::STENCIL);
        vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(self.depth_read)
            .depth_write_enable(depth_write)
            .depth_compare_op(self.depth_compare.into())
            .depth_bounds_test_enable(false)
            .min_depth_bounds(0.0)
            .max_depth_bounds(1.0)
            .stencil_test_enable(self.stencil_enable)
            .front(self.face(self.front, keep))
            .back(self.face(self.back, keep))
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreatePipelineError {
    #[error("A graphics pipeline needs a vertex program")]
    NoVertexStage,

    #[error("Program for stage {actual:?} used where {expected:?} was expected")]
    WrongStage {
        expected: ShaderStage,
        actual: ShaderStage,
    },

    #[error("Failed to create pipeline layout: {0}")]
    Layout(#[from] CreateLayoutError),

    #[error("Unknown render target identity {0:?}")]
    UnknownRenderTarget(RenderTargetId),

    #[error("Unknown vertex input identity {0:?}")]
    UnknownVertexInput(VertexInputId),

    #[error("Vulkan error creating pipeline: {0}")]
    Creation(vk::Result),
}

// ---------------------------------------------------------------------------
// GraphicsPipelineState
// ---------------------------------------------------------------------------

/// Description of a [`GraphicsPipelineState`].
///
/// # Defaults (via [`Default`])
/// | field | default |
/// |---|---|
/// | `vertex` | `None` (must be set) |
/// | other stages | `None` |
/// | `blend` | blending off, RGBA writes |
/// | `rasterizer` | solid, cull counter-clockwise, depth clip on |
/// | `depth_stencil` | depth test and write, `Less`, stencil off |
#[derive(Debug, Clone, Default)]
pub struct GraphicsPipelineDesc {
    pub vertex: Option<Arc<ShaderProgram>>,
    pub fragment: Option<Arc<ShaderProgram>>,
    pub geometry: Option<Arc<ShaderProgram>>,
    pub tess_control: Option<Arc<ShaderProgram>>,
    pub tess_evaluation: Option<Arc<ShaderProgram>>,
    pub blend: BlendState,
    pub rasterizer: RasterizerState,
    pub depth_stencil: DepthStencilState,
}

impl GraphicsPipelineDesc {
    /// Stages in pipeline order, checked against their slot.
    fn programs(&self) -> Result<Vec<Arc<ShaderProgram>>, CreatePipelineError> {
        if self.vertex.is_none() {
            return Err(CreatePipelineError::NoVertexStage);
        }
        let slots = [
            (&self.vertex, ShaderStage::Vertex),
            (&self.tess_control, ShaderStage::TessControl),
            (&self.tess_evaluation, ShaderStage::TessEvaluation),
            (&self.geometry, ShaderStage::Geometry),
            (&self.fragment, ShaderStage::Fragment),
        ];
        let mut programs = Vec::new();
        for (program, expected) in slots {
            let Some(program) = program else { continue };
            if program.stage() != expected {
                return Err(CreatePipelineError::WrongStage {
                    expected,
                    actual: program.stage(),
                });
            }
            programs.push(Arc::clone(program));
        }
        Ok(programs)
    }
}

/// A graphics pipeline description plus the pipelines built from it.
///
/// Pipelines are destroyed with the state object. Command buffers only
/// hold raw handles, so drop a state object only once the GPU work that
/// used it has finished.
pub struct GraphicsPipelineState {
    parent: Arc<Device>,
    name: Option<String>,
    programs: Vec<Arc<ShaderProgram>>,
    tessellation: bool,
    blend: BlendState,
    rasterizer: RasterizerState,
    depth_stencil: DepthStencilState,
    layout: PipelineLayout,
    cache: PipelineCache<vk::Pipeline>,
}

impl std::fmt::Debug for GraphicsPipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsPipelineState")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl GraphicsPipelineState {
    pub fn new(
        device: &Arc<Device>,
        desc: GraphicsPipelineDesc,
        name: Option<&str>,
    ) -> Result<Self, CreatePipelineError> {
        let programs = desc.programs()?;
        let layout = PipelineLayout::for_programs(device, &programs, name)?;
        Ok(Self {
            parent: Arc::clone(device),
            name: name.map(str::to_owned),
            programs,
            tessellation: desc.tess_control.is_some() && desc.tess_evaluation.is_some(),
            blend: desc.blend,
            rasterizer: desc.rasterizer,
            depth_stencil: desc.depth_stencil,
            layout,
            cache: PipelineCache::default(),
        })
    }

    pub fn layout(&self) -> &PipelineLayout {
        &self.layout
    }

    /// Number of pipelines built so far.
    pub fn cached_pipelines(&self) -> usize {
        self.cache.len()
    }

    /// The pipeline for `key`, building it on first request.
    pub fn get_pipeline(
        &self,
        ctx: &GpuContext,
        key: GpuPipelineKey,
    ) -> Result<vk::Pipeline, CreatePipelineError> {
        self.cache.get_or_try_insert_with(key, || {
            let target = ctx
                .render_target_layout(key.render_target)
                .ok_or(CreatePipelineError::UnknownRenderTarget(key.render_target))?;
            let vertex_input = ctx
                .vertex_input_layout(key.vertex_input)
                .ok_or(CreatePipelineError::UnknownVertexInput(key.vertex_input))?;
            tracing::debug!(
                "Building pipeline for {:?} ({} colour attachments)",
                key,
                target.colors.len()
            );
            self.build(&target, &vertex_input, key.read_only, key.draw_op)
        })
    }

    fn build(
        &self,
        target: &RenderTargetLayout,
        vertex_input: &VertexInputLayout,
        read_only: ReadOnlyFlags,
        draw_op: DrawOp,
    ) -> Result<vk::Pipeline, CreatePipelineError> {
        let stages: Vec<_> = self.programs.iter().map(|p| p.stage_create_info()).collect();

        let bindings: Vec<_> = vertex_input
            .bindings
            .iter()
            .map(|b| {
                vk::VertexInputBindingDescription::default()
                    .binding(b.binding)
                    .stride(b.stride)
                    .input_rate(if b.per_instance {
                        vk::VertexInputRate::INSTANCE
                    } else {
                        vk::VertexInputRate::VERTEX
                    })
            })
            .collect();
        let attributes: Vec<_> = vertex_input
            .attributes
            .iter()
            .map(|a| {
                vk::VertexInputAttributeDescription::default()
                    .location(a.location)
                    .binding(a.binding)
                    .format(a.format)
                    .offset(a.offset)
            })
            .collect();
        let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly_state =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(draw_op.into());
        let tessellation_state =
            vk::PipelineTessellationStateCreateInfo::default().patch_control_points(3);

        // Counts must be declared even though the values are dynamic.
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization_state = self.rasterizer.create_info();
        let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(target.samples)
            .min_sample_shading(1.0)
            .alpha_to_coverage_enable(self.blend.alpha_to_coverage);

        let depth_stencil_state = self.depth_stencil.resolve(read_only);
        let color_blend_attachments = self.blend.resolve(target.colors.len(), read_only);
        let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
            .attachments(&color_blend_attachments);

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::STENCIL_REFERENCE,
        ];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let depth_format = target.depth.unwrap_or(vk::Format::UNDEFINED);
        let stencil_format = match target.depth {
            Some(format)
                if barrier::aspect_flags(format).contains(vk::ImageAspectFlags::STENCIL) =>
            {
                format
            }
            _ => vk::Format::UNDEFINED,
        };
        let mut rendering_create_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&target.colors)
            .depth_attachment_format(depth_format)
            .stencil_attachment_format(stencil_format);

        let mut create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_state)
            .input_assembly_state(&input_assembly_state)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization_state)
            .multisample_state(&multisample_state)
            .color_blend_state(&color_blend_state)
            .dynamic_state(&dynamic_state)
            .layout(self.layout.raw_handle());
        if target.depth.is_some() {
            create_info = create_info.depth_stencil_state(&depth_stencil_state);
        }
        if self.tessellation {
            create_info = create_info.tessellation_state(&tessellation_state);
        }
        let create_info = create_info.push_next(&mut rendering_create_info);

        // SAFETY: every structure referenced by create_info lives until the
        // end of this call, and the stages and layout were created from
        // self.parent.
        let handle = unsafe { self.parent.create_raw_graphics_pipeline(&create_info) }
            .map_err(CreatePipelineError::Creation)?;
        self.parent.name_or_warn(handle, self.name.as_deref());
        Ok(handle)
    }
}

impl Drop for GraphicsPipelineState {
    fn drop(&mut self) {
        for pipeline in self.cache.drain() {
            tracing::debug!("Dropping pipeline {:?}", pipeline);
            // SAFETY: the pipeline was built from parent and the owner
            // guarantees no in-flight work still uses it.
            unsafe { self.parent.destroy_raw_pipeline(pipeline) };
        }
    }
}

// ---------------------------------------------------------------------------
// ComputePipelineState
// ---------------------------------------------------------------------------

/// A compute program and its single pipeline, built at creation.
pub struct ComputePipelineState {
    parent: Arc<Device>,
    program: Arc<ShaderProgram>,
    layout: PipelineLayout,
    handle: vk::Pipeline,
}

impl std::fmt::Debug for ComputePipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputePipelineState")
            .field("handle", &self.handle)
            .field("program", &self.program)
            .finish_non_exhaustive()
    }
}

impl ComputePipelineState {
    pub fn new(
        device: &Arc<Device>,
        program: Arc<ShaderProgram>,
        name: Option<&str>,
    ) -> Result<Self, CreatePipelineError> {
        if program.stage() != ShaderStage::Compute {
            return Err(CreatePipelineError::WrongStage {
                expected: ShaderStage::Compute,
                actual: program.stage(),
            });
        }
        let layout = PipelineLayout::for_programs(device, std::slice::from_ref(&program), name)?;
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(program.stage_create_info())
            .layout(layout.raw_handle());
        // SAFETY: the stage and layout were created from device and are
        // alive for the call.
        let handle = unsafe { device.create_raw_compute_pipeline(&create_info) }
            .map_err(CreatePipelineError::Creation)?;
        device.name_or_warn(handle, name);
        Ok(Self {
            parent: Arc::clone(device),
            program,
            layout,
            handle,
        })
    }

    pub fn raw_pipeline(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn layout(&self) -> &PipelineLayout {
        &self.layout
    }
}

impl Drop for ComputePipelineState {
    fn drop(&mut self) {
        tracing::debug!("Dropping pipeline {:?}", self.handle);
        // SAFETY: handle was created from parent; the layout field drops
        // after this.
        unsafe { self.parent.destroy_raw_pipeline(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn key(target: u32, read_only: ReadOnlyFlags) -> GpuPipelineKey {
        GpuPipelineKey {
            render_target: RenderTargetId(target),
            vertex_input: VertexInputId(0),
            read_only,
            draw_op: DrawOp::TriangleList,
        }
    }

    #[test]
    fn identical_keys_hit_the_cache() {
        let cache = PipelineCache::<u64>::default();
        let builds = Cell::new(0);
        let mut build = || -> Result<u64, ()> {
            builds.set(builds.get() + 1);
            Ok(100 + builds.get())
        };
        let a = cache.get_or_try_insert_with(key(0, ReadOnlyFlags::empty()), &mut build);
        let b = cache.get_or_try_insert_with(key(0, ReadOnlyFlags::empty()), &mut build);
        assert_eq!(a, Ok(101));
        assert_eq!(b, Ok(101));
        assert_eq!(builds.get(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn any_differing_field_builds_a_new_entry() {
        let cache = PipelineCache::<u64>::default();
        let next = Cell::new(0u64);
        let mut build = || -> Result<u64, ()> {
            next.set(next.get() + 1);
            Ok(next.get())
        };
        let base = key(0, ReadOnlyFlags::empty());
        let variants = [
            base,
            GpuPipelineKey {
                render_target: RenderTargetId(1),
                ..base
            },
            GpuPipelineKey {
                vertex_input: VertexInputId(1),
                ..base
            },
            GpuPipelineKey {
                read_only: ReadOnlyFlags::DEPTH,
                ..base
            },
            GpuPipelineKey {
                draw_op: DrawOp::LineList,
                ..base
            },
        ];
        let handles: Vec<u64> = variants
            .iter()
            .map(|&k| cache.get_or_try_insert_with(k, &mut build).unwrap())
            .collect();
        assert_eq!(handles, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn failed_builds_are_not_cached() {
        let cache = PipelineCache::<u64>::default();
        let err = cache.get_or_try_insert_with(key(0, ReadOnlyFlags::empty()), || Err("boom"));
        assert_eq!(err, Err("boom"));
        assert!(cache.is_empty());
        let ok = cache.get_or_try_insert_with(key(0, ReadOnlyFlags::empty()), || Ok::<_, ()>(7));
        assert_eq!(ok, Ok(7));
    }

    #[test]
    fn interner_reuses_identities() {
        let interner = Interner::default();
        let two = RenderTargetLayout {
            colors: vec![vk::Format::R8G8B8A8_UNORM, vk::Format::R16G16B16A16_SFLOAT],
            depth: Some(vk::Format::D32_SFLOAT),
            samples: vk::SampleCountFlags::TYPE_1,
        };
        let one = RenderTargetLayout {
            colors: vec![vk::Format::R8G8B8A8_UNORM],
            ..two.clone()
        };
        let a = interner.intern(two.clone());
        let b = interner.intern(one.clone());
        assert_ne!(a, b);
        assert_eq!(interner.intern(two.clone()), a);
        assert_eq!(interner.get(b).as_deref(), Some(&one));
        assert_eq!(interner.get(7), None);
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn read_only_depth_disables_writes() {
        let state = DepthStencilState::default();
        assert_eq!(state.resolve(ReadOnlyFlags::empty()).depth_write_enable, vk::TRUE);
        assert_eq!(state.resolve(ReadOnlyFlags::DEPTH).depth_write_enable, vk::FALSE);

        let never_writes = DepthStencilState {
            depth_write: false,
            ..state
        };
        assert_eq!(
            never_writes.resolve(ReadOnlyFlags::empty()).depth_write_enable,
            vk::FALSE
        );
    }

    #[test]
    fn read_only_stencil_keeps_everything() {
        let face = StencilFace {
            fail: StencilOp::Zero,
            depth_fail: StencilOp::Invert,
            pass: StencilOp::Replace,
            compare: CompareFunc::Equal,
        };
        let state = DepthStencilState {
            stencil_enable: true,
            front: face,
            back: face,
            ..Default::default()
        };

        let writable = state.resolve(ReadOnlyFlags::DEPTH);
        assert_eq!(writable.front.pass_op, vk::StencilOp::REPLACE);
        assert_eq!(writable.back.fail_op, vk::StencilOp::ZERO);

        let read_only = state.resolve(ReadOnlyFlags::STENCIL);
        for face in [read_only.front, read_only.back] {
            assert_eq!(face.fail_op, vk::StencilOp::KEEP);
            assert_eq!(face.depth_fail_op, vk::StencilOp::KEEP);
            assert_eq!(face.pass_op, vk::StencilOp::KEEP);
            assert_eq!(face.compare_op, vk::CompareOp::EQUAL);
        }
    }

    #[test]
    fn blend_state_per_attachment() {
        let additive = AttachmentBlend {
            enabled: true,
            dst_color: BlendFactor::One,
            ..Default::default()
        };
        let shared = BlendState {
            attachments: vec![additive],
            ..Default::default()
        };
        let resolved = shared.resolve(2, ReadOnlyFlags::empty());
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|a| a.blend_enable == vk::TRUE));
        assert!(resolved
            .iter()
            .all(|a| a.color_write_mask == vk::ColorComponentFlags::RGBA));

        let independent = BlendState {
            independent: true,
            ..shared
        };
        let resolved = independent.resolve(2, ReadOnlyFlags::empty());
        assert_eq!(resolved[0].blend_enable, vk::TRUE);
        assert_eq!(resolved[1].blend_enable, vk::FALSE);

        let read_only = independent.resolve(2, ReadOnlyFlags::COLOR);
        assert!(read_only
            .iter()
            .all(|a| a.color_write_mask == vk::ColorComponentFlags::empty()));
    }

    #[test]
    fn rasterizer_uses_clockwise_front_faces() {
        let info = RasterizerState {
            cull_mode: CullMode::Clockwise,
            depth_bias: 1.5,
            ..Default::default()
        }
        .create_info();
        assert_eq!(info.front_face, vk::FrontFace::CLOCKWISE);
        assert_eq!(info.cull_mode, vk::CullModeFlags::FRONT);
        assert_eq!(info.depth_bias_enable, vk::TRUE);
        assert_eq!(info.depth_clamp_enable, vk::FALSE);
    }
}
