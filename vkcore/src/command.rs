use std::collections::HashMap;
use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::barrier::{self, ImageUsageClass};
use crate::context::{GpuContext, NativeObject};
use crate::device::{Device, DynamicRenderingError};
use crate::pipeline::{
    ComputePipelineState, CreatePipelineError, DrawOp, GpuPipelineKey, GraphicsPipelineState,
    ReadOnlyFlags, RenderTargetId, VertexInputId,
};
use crate::queue::{QueueId, SyncMask};
use crate::subresource::{SubresourceRange, cut_range, merge_uniform};
use crate::sync::{CreateSyncError, Fence};
use crate::texture::GpuTexture;
use crate::tracker::{Access, ResourceId, ResourceTracker};

/// Idle command buffers a pool keeps around for reuse. Anything beyond
/// this is freed when it is recycled.
const MAX_IDLE_COMMAND_BUFFERS: usize = 4;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error("Vulkan error creating command pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AcquireCommandBufferError {
    #[error("Vulkan error allocating command buffer: {0}")]
    Allocate(vk::Result),
    #[error("Failed to create command buffer fence: {0}")]
    CreateFence(#[from] CreateSyncError),
    #[error("Vulkan error resetting command buffer: {0}")]
    Reset(vk::Result),
    #[error("Vulkan error beginning command buffer: {0}")]
    Begin(vk::Result),
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Command buffer is {actual:?} but the operation needs {expected}")]
    InvalidState {
        actual: CommandBufferState,
        expected: &'static str,
    },
    #[error("Failed to acquire command buffer: {0}")]
    Acquire(#[from] AcquireCommandBufferError),
    #[error("Dynamic rendering error: {0}")]
    DynamicRendering(#[from] DynamicRenderingError),
    #[error("Failed to get pipeline: {0}")]
    Pipeline(#[from] CreatePipelineError),
    #[error("Vulkan error creating attachment view: {0}")]
    CreateView(vk::Result),
    #[error("Render target has no attachments")]
    EmptyRenderTarget,
    #[error("Resource {0:?} is no longer tracked")]
    MissingResource(ResourceId),
    #[error("No graphics pipeline is bound")]
    NoPipeline,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Recording error: {0}")]
    Record(#[from] RecordError),
    #[error("Failed to acquire command buffer: {0}")]
    Acquire(#[from] AcquireCommandBufferError),
    #[error("Vulkan error ending command buffer: {0}")]
    End(vk::Result),
    #[error("Vulkan error submitting to {queue}: {result}")]
    Submit { queue: QueueId, result: vk::Result },
    #[error("Vulkan error waiting for {queue}: {result}")]
    Wait { queue: QueueId, result: vk::Result },
    #[error("Failed to poll command buffer fence: {0}")]
    Fence(vk::Result),
}

// ---------------------------------------------------------------------------
// CommandPool
// ---------------------------------------------------------------------------

/// A command buffer and the fence that signals its completion.
pub(crate) struct PooledCommandBuffer {
    handle: vk::CommandBuffer,
    fence: Fence,
}

impl PooledCommandBuffer {
    pub(crate) fn raw(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub(crate) fn fence(&self) -> &Fence {
        &self.fence
    }

    pub(crate) fn fence_mut(&mut self) -> &mut Fence {
        &mut self.fence
    }
}

/// Per-queue pool of resettable command buffers.
///
/// Buffers come back through [`recycle`](Self::recycle) once their fence
/// has signalled. The pool is owned by the queue's stream state, which is
/// only touched under the context lock, so no further synchronisation is
/// needed for pool-level Vulkan calls.
pub(crate) struct CommandPool {
    parent: Arc<Device>,
    pool: vk::CommandPool,
    idle: Vec<PooledCommandBuffer>,
    queue: QueueId,
}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandPool")
            .field("pool", &self.pool)
            .field("queue", &self.queue)
            .field("idle", &self.idle.len())
            .finish_non_exhaustive()
    }
}

impl CommandPool {
    pub(crate) fn new(device: &Arc<Device>, queue: QueueId) -> Result<Self, CreateCommandPoolError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.queue_family(queue.ty))
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        // SAFETY: create_info uses a queue family index of this device.
        let pool = unsafe { device.create_raw_command_pool(&create_info) }
            .map_err(CreateCommandPoolError::Vulkan)?;
        device.name_or_warn(pool, Some(&format!("{queue} command pool")));

        Ok(Self {
            parent: Arc::clone(device),
            pool,
            idle: Vec::new(),
            queue,
        })
    }

    /// A command buffer in the recording state.
    pub(crate) fn acquire(&mut self) -> Result<PooledCommandBuffer, AcquireCommandBufferError> {
        let cb = match self.idle.pop() {
            Some(cb) => {
                // SAFETY: idle buffers finished executing before recycle().
                unsafe {
                    self.parent
                        .reset_raw_command_buffer(cb.handle, vk::CommandBufferResetFlags::empty())
                }
                .map_err(AcquireCommandBufferError::Reset)?;
                cb
            }
            None => {
                let allocate_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);
                // SAFETY: allocate_info references this pool, which is
                // externally synchronized by the context lock.
                let handle = unsafe { self.parent.allocate_raw_command_buffers(&allocate_info) }
                    .map_err(AcquireCommandBufferError::Allocate)?
                    .remove(0);
                let fence = match Fence::new(&self.parent, None) {
                    Ok(fence) => fence,
                    Err(e) => {
                        // SAFETY: handle was just allocated and never recorded.
                        unsafe { self.parent.free_raw_command_buffers(self.pool, &[handle]) };
                        return Err(e.into());
                    }
                };
                PooledCommandBuffer { handle, fence }
            }
        };

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: cb is in the initial state (new or reset above).
        if let Err(e) = unsafe { self.parent.begin_raw_command_buffer(cb.handle, &begin_info) } {
            self.idle.push(cb);
            return Err(AcquireCommandBufferError::Begin(e));
        }
        Ok(cb)
    }

    /// Return a buffer whose GPU work has completed (or that was never
    /// submitted).
    pub(crate) fn recycle(&mut self, mut cb: PooledCommandBuffer) {
        if cb.fence.is_armed() {
            // SAFETY: the caller observed the fence signalled.
            if let Err(e) = unsafe { cb.fence.disarm() } {
                tracing::error!("Failed to reset command buffer fence: {e}");
                // SAFETY: the work is done so the handle is not pending.
                unsafe { self.parent.free_raw_command_buffers(self.pool, &[cb.handle]) };
                return;
            }
        }
        if self.idle.len() >= MAX_IDLE_COMMAND_BUFFERS {
            // SAFETY: as above, the handle is not pending.
            unsafe { self.parent.free_raw_command_buffers(self.pool, &[cb.handle]) };
            return;
        }
        self.idle.push(cb);
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.pool);
        self.idle.clear();
        // SAFETY: the owning context waits for every in-flight buffer from
        // this pool before dropping it; destroying the pool frees them.
        unsafe { self.parent.destroy_raw_command_pool(self.pool) };
    }
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

/// Layout expectations a command stream has for one rectangle of an
/// image's subresources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SubresourceUse {
    pub range: SubresourceRange,
    /// Layout the stream expects the subresources to be in when it starts.
    pub initial: vk::ImageLayout,
    /// Layout the subresources are left in when it ends.
    pub current: vk::ImageLayout,
}

#[derive(Debug)]
pub(crate) struct ImageUses {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub usage: ImageUsageClass,
    pub entries: Vec<SubresourceUse>,
}

/// Record that `range` is used in `layout` from now on.
///
/// Returns the in-stream transitions needed, as `(range, old_layout)`.
/// Subresources this stream has not touched before are not transitioned
/// here; their first layout becomes the stream's `initial` expectation,
/// which the submission fixes up on the transfer batch.
pub(crate) fn apply_image_use(
    entries: &mut Vec<SubresourceUse>,
    range: SubresourceRange,
    layout: vk::ImageLayout,
) -> Vec<(SubresourceRange, vk::ImageLayout)> {
    let mut transitions = Vec::new();
    let mut uncovered = vec![range];
    let mut next = Vec::with_capacity(entries.len() + 1);

    for entry in entries.drain(..) {
        if !entry.range.overlaps(&range) {
            next.push(entry);
            continue;
        }
        for piece in cut_range(entry.range, range) {
            if range.contains(&piece) {
                if entry.current != layout {
                    transitions.push((piece, entry.current));
                }
                next.push(SubresourceUse {
                    range: piece,
                    current: layout,
                    ..entry
                });
            } else {
                next.push(SubresourceUse {
                    range: piece,
                    ..entry
                });
            }
        }
        uncovered = uncovered
            .into_iter()
            .flat_map(|piece| cut_range(piece, entry.range))
            .filter(|piece| !entry.range.contains(piece))
            .collect();
    }

    next.extend(uncovered.into_iter().map(|piece| SubresourceUse {
        range: piece,
        initial: layout,
        current: layout,
    }));
    *entries = next;
    transitions
}

/// Rectangles of `range` whose layout (as reported by `layout_at`) differs
/// from `target`, merged greedily.
pub(crate) fn plan_transitions<F>(
    range: SubresourceRange,
    layout_at: F,
    target: vk::ImageLayout,
) -> Vec<(SubresourceRange, vk::ImageLayout)>
where
    F: Fn(u32, u32) -> vk::ImageLayout,
{
    merge_uniform(range, layout_at)
        .into_iter()
        .filter(|(_, old)| *old != target)
        .collect()
}

/// State of one open command stream: the native buffer plus everything
/// registered into it.
pub(crate) struct Recording {
    pub queue: QueueId,
    pub cb: PooledCommandBuffer,
    pub uses: HashMap<ResourceId, Access>,
    pub images: HashMap<ResourceId, ImageUses>,
    pub wait_mask: SyncMask,
}

impl std::fmt::Debug for Recording {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recording")
            .field("queue", &self.queue)
            .field("cb", &self.cb.handle)
            .field("uses", &self.uses.len())
            .field("wait_mask", &self.wait_mask)
            .finish_non_exhaustive()
    }
}

impl Recording {
    /// Wrap a freshly begun buffer. Records a full memory barrier first so
    /// work from earlier submissions on the same queue is visible.
    pub(crate) fn begin(device: &Device, queue: QueueId, cb: PooledCommandBuffer) -> Self {
        let barriers = [barrier::full_memory_barrier()];
        let dependency = vk::DependencyInfo::default().memory_barriers(&barriers);
        // SAFETY: cb was begun by CommandPool::acquire.
        unsafe { device.cmd_pipeline_barrier2(cb.raw(), &dependency) };
        Self {
            queue,
            cb,
            uses: HashMap::new(),
            images: HashMap::new(),
            wait_mask: SyncMask::empty(),
        }
    }

    pub(crate) fn raw(&self) -> vk::CommandBuffer {
        self.cb.raw()
    }
}

/// Borrowed view used to record into a [`Recording`] while holding the
/// context lock.
pub(crate) struct Recorder<'a> {
    pub device: &'a Arc<Device>,
    pub tracker: &'a mut ResourceTracker<NativeObject>,
    pub recording: &'a mut Recording,
}

impl Recorder<'_> {
    pub(crate) fn raw(&self) -> vk::CommandBuffer {
        self.recording.raw()
    }

    pub(crate) fn queue(&self) -> QueueId {
        self.recording.queue
    }

    /// Reference `id` from this stream. The first reference binds it.
    pub(crate) fn register(&mut self, id: ResourceId, access: Access) {
        let tracker = &mut *self.tracker;
        let slot = self.recording.uses.entry(id).or_insert_with(|| {
            tracker.notify_bound(id);
            Access::empty()
        });
        *slot |= access;
    }

    pub(crate) fn buffer(&self, id: ResourceId) -> Result<vk::Buffer, RecordError> {
        match self.tracker.get(id) {
            Some(NativeObject::Buffer(buffer)) => Ok(buffer.handle()),
            _ => Err(RecordError::MissingResource(id)),
        }
    }

    pub(crate) fn copy_buffer(
        &mut self,
        src: ResourceId,
        dst: ResourceId,
        region: vk::BufferCopy,
    ) -> Result<(), RecordError> {
        let (src_raw, dst_raw) = (self.buffer(src)?, self.buffer(dst)?);
        // SAFETY: both buffers are alive (tracked) and the stream is
        // recording outside of a render pass.
        unsafe {
            self.device
                .cmd_copy_buffer(self.raw(), src_raw, dst_raw, &[region])
        };
        self.register(src, Access::READ);
        self.register(dst, Access::WRITE);
        Ok(())
    }

    pub(crate) fn update_buffer(
        &mut self,
        dst: ResourceId,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<(), RecordError> {
        let dst_raw = self.buffer(dst)?;
        // SAFETY: dst is alive; callers keep data 4-byte aligned in offset
        // and length and at most 64 KiB.
        unsafe { self.device.cmd_update_buffer(self.raw(), dst_raw, offset, data) };
        self.register(dst, Access::WRITE);
        Ok(())
    }

    pub(crate) fn buffer_barrier(
        &mut self,
        buffer: vk::Buffer,
        src_access: vk::AccessFlags2,
        dst_access: vk::AccessFlags2,
        src_stage: vk::PipelineStageFlags2,
        dst_stage: vk::PipelineStageFlags2,
    ) {
        let barriers = [barrier::buffer_barrier(
            buffer, src_access, dst_access, src_stage, dst_stage,
        )];
        let dependency = vk::DependencyInfo::default().buffer_memory_barriers(&barriers);
        // SAFETY: the stream is recording and buffer is alive.
        unsafe { self.device.cmd_pipeline_barrier2(self.raw(), &dependency) };
    }

    /// Use `range` of image `id` in `layout` for the rest of this stream.
    /// Transitions inside the stream are recorded immediately; the first
    /// layout of untouched subresources is fixed up at submission.
    pub(crate) fn use_image(
        &mut self,
        id: ResourceId,
        range: SubresourceRange,
        layout: vk::ImageLayout,
        access: Access,
    ) -> Result<(), RecordError> {
        let Some(NativeObject::Image(image)) = self.tracker.get(id) else {
            return Err(RecordError::MissingResource(id));
        };
        let (handle, aspect, usage) = (image.handle(), image.aspect(), image.usage());
        let subresources: Vec<ResourceId> = range
            .iter()
            .map(|(mip, layer)| image.subresource_id(mip, layer))
            .collect();

        self.register(id, access);
        for sub in subresources {
            self.register(sub, access);
        }

        let uses = self.recording.images.entry(id).or_insert_with(|| ImageUses {
            image: handle,
            aspect,
            usage,
            entries: Vec::new(),
        });
        let transitions = apply_image_use(&mut uses.entries, range, layout);
        if transitions.is_empty() {
            return Ok(());
        }
        let barriers: Vec<_> = transitions
            .into_iter()
            .map(|(piece, old)| {
                barrier::image_barrier(
                    handle,
                    aspect,
                    piece,
                    old,
                    layout,
                    barrier::layout_access(old, usage, false),
                    barrier::layout_access(layout, usage, false),
                )
            })
            .collect();
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        // SAFETY: the stream is recording and the image is alive.
        unsafe { self.device.cmd_pipeline_barrier2(self.raw(), &dependency) };
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Ready,
    Recording,
    RecordingRenderPass,
    RecordingDone,
    Submitted,
}

/// Attachments for a render pass. Colour attachments and the optional
/// depth-stencil attachment use mip 0, layer 0.
#[derive(Debug, Default)]
pub struct RenderTarget<'a> {
    pub colors: Vec<&'a GpuTexture>,
    pub depth: Option<&'a GpuTexture>,
    pub clear_color: Option<[f32; 4]>,
    pub clear_depth_stencil: Option<(f32, u32)>,
}

#[derive(Debug)]
struct ActiveRenderPass {
    target: RenderTargetId,
    read_only: ReadOnlyFlags,
    attachments: Vec<(ResourceId, vk::ImageLayout)>,
}

/// A main-stream command buffer on one queue.
///
/// Resources are registered as they are recorded. [`submit`](Self::submit)
/// flushes pending transfer work, waits on every queue whose outstanding
/// accesses conflict with this buffer's, and hands the stream to the GPU.
pub struct CommandBuffer {
    ctx: Arc<GpuContext>,
    queue: QueueId,
    state: CommandBufferState,
    recording: Option<Recording>,
    render_pass: Option<ActiveRenderPass>,
    pipeline_bound: bool,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("queue", &self.queue)
            .field("state", &self.state)
            .field("recording", &self.recording)
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    pub(crate) fn new(ctx: Arc<GpuContext>, queue: QueueId) -> Self {
        Self {
            ctx,
            queue,
            state: CommandBufferState::Ready,
            recording: None,
            render_pass: None,
            pipeline_bound: false,
        }
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    pub fn queue(&self) -> QueueId {
        self.queue
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    fn invalid(&self, expected: &'static str) -> RecordError {
        RecordError::InvalidState {
            actual: self.state,
            expected,
        }
    }

    /// Start recording. Valid from `Ready` or after a submission.
    pub fn begin(&mut self) -> Result<(), RecordError> {
        if !matches!(
            self.state,
            CommandBufferState::Ready | CommandBufferState::Submitted
        ) {
            return Err(self.invalid("Ready or Submitted"));
        }
        let recording = self.ctx.lock_streams().begin_recording(self.queue)?;
        self.recording = Some(recording);
        self.state = CommandBufferState::Recording;
        self.pipeline_bound = false;
        Ok(())
    }

    fn ensure_recording(&mut self) -> Result<(), RecordError> {
        if matches!(
            self.state,
            CommandBufferState::Ready | CommandBufferState::Submitted
        ) {
            self.begin()?;
        }
        match self.state {
            CommandBufferState::Recording | CommandBufferState::RecordingRenderPass => Ok(()),
            _ => Err(self.invalid("Recording")),
        }
    }

    /// Run `f` against this stream with the context lock held.
    pub(crate) fn record<R>(
        &mut self,
        f: impl FnOnce(&mut Recorder<'_>) -> Result<R, RecordError>,
    ) -> Result<R, RecordError> {
        self.ensure_recording()?;
        let recording = self
            .recording
            .as_mut()
            .ok_or(RecordError::InvalidState {
                actual: self.state,
                expected: "Recording",
            })?;
        let mut streams = self.ctx.lock_streams();
        let streams = &mut *streams;
        let mut recorder = Recorder {
            device: &streams.device,
            tracker: &mut streams.tracker,
            recording,
        };
        f(&mut recorder)
    }

    /// Like [`record`](Self::record) but ends any active render pass first.
    /// Used for copies and other transfer commands.
    pub(crate) fn record_transfer<R>(
        &mut self,
        f: impl FnOnce(&mut Recorder<'_>) -> Result<R, RecordError>,
    ) -> Result<R, RecordError> {
        self.end_render_pass()?;
        self.record(f)
    }

    // Render pass functionality

    pub fn begin_render_pass(
        &mut self,
        target: &RenderTarget<'_>,
        read_only: ReadOnlyFlags,
    ) -> Result<(), RecordError> {
        self.end_render_pass()?;
        let layout = target.layout().ok_or(RecordError::EmptyRenderTarget)?;
        let extent = target
            .colors
            .first()
            .copied()
            .or(target.depth)
            .map(|tex| tex.desc().extent())
            .ok_or(RecordError::EmptyRenderTarget)?;
        let target_id = self.ctx.intern_render_target(layout);

        let depth_layout = depth_attachment_layout(read_only);
        let color_access = if read_only.contains(ReadOnlyFlags::COLOR) {
            Access::READ
        } else {
            Access::READ | Access::WRITE
        };
        let depth_access = if read_only.contains(ReadOnlyFlags::DEPTH | ReadOnlyFlags::STENCIL) {
            Access::READ
        } else {
            Access::READ | Access::WRITE
        };

        let color_ids: Vec<ResourceId> = target.colors.iter().map(|t| t.current_id()).collect();
        let depth_id = target.depth.map(GpuTexture::current_id);
        let whole = SubresourceRange::single(0, 0);

        let attachments = self.record(|rec| {
            let mut attachments = Vec::new();
            let mut color_infos = Vec::new();
            for &id in &color_ids {
                rec.use_image(id, whole, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, color_access)?;
                let view = attachment_view(rec.tracker, id)?;
                let mut info = vk::RenderingAttachmentInfo::default()
                    .image_view(view)
                    .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE);
                if let Some(color) = target.clear_color {
                    info = info.load_op(vk::AttachmentLoadOp::CLEAR).clear_value(vk::ClearValue {
                        color: vk::ClearColorValue { float32: color },
                    });
                }
                color_infos.push(info);
                attachments.push((id, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL));
            }

            let mut depth_info = None;
            if let Some(id) = depth_id {
                rec.use_image(id, whole, depth_layout, depth_access)?;
                let view = attachment_view(rec.tracker, id)?;
                let mut info = vk::RenderingAttachmentInfo::default()
                    .image_view(view)
                    .image_layout(depth_layout)
                    .load_op(vk::AttachmentLoadOp::LOAD)
                    .store_op(vk::AttachmentStoreOp::STORE);
                if let Some((depth, stencil)) = target.clear_depth_stencil {
                    info = info.load_op(vk::AttachmentLoadOp::CLEAR).clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
                    });
                }
                depth_info = Some(info);
                attachments.push((id, depth_layout));
            }

            let area = vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent: vk::Extent2D {
                    width: extent.width,
                    height: extent.height,
                },
            };
            let mut rendering_info = vk::RenderingInfo::default()
                .render_area(area)
                .layer_count(1)
                .color_attachments(&color_infos);
            if let Some(info) = depth_info.as_ref() {
                rendering_info = rendering_info.depth_attachment(info);
                if target.depth.is_some_and(|t| t.has_stencil()) {
                    rendering_info = rendering_info.stencil_attachment(info);
                }
            }
            // SAFETY: every attachment was transitioned to the layout its
            // info names and the views are alive while the image is.
            unsafe { rec.device.cmd_begin_raw_rendering(rec.raw(), &rendering_info) }?;

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: area.extent.width as f32,
                height: area.extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            // SAFETY: inside the render pass just begun.
            unsafe {
                rec.device.cmd_set_viewport(rec.raw(), &[viewport]);
                rec.device.cmd_set_scissor(rec.raw(), &[area]);
            }
            Ok(attachments)
        })?;

        self.render_pass = Some(ActiveRenderPass {
            target: target_id,
            read_only,
            attachments,
        });
        self.state = CommandBufferState::RecordingRenderPass;
        self.pipeline_bound = false;
        Ok(())
    }

    /// End the active render pass, if any, and return attachments to their
    /// optimal layouts.
    pub fn end_render_pass(&mut self) -> Result<(), RecordError> {
        if self.state != CommandBufferState::RecordingRenderPass {
            return Ok(());
        }
        let Some(pass) = self.render_pass.take() else {
            return Ok(());
        };
        self.state = CommandBufferState::Recording;
        self.pipeline_bound = false;
        self.record(|rec| {
            // SAFETY: the stream is inside the render pass begun by
            // begin_render_pass.
            unsafe { rec.device.cmd_end_raw_rendering(rec.raw()) }?;
            for (id, _) in pass.attachments {
                let optimal = match rec.tracker.get(id) {
                    Some(NativeObject::Image(image)) => image.usage().optimal_layout(),
                    _ => return Err(RecordError::MissingResource(id)),
                };
                rec.use_image(id, SubresourceRange::single(0, 0), optimal, Access::READ)?;
            }
            Ok(())
        })
    }

    pub fn set_viewport(&mut self, viewport: vk::Viewport) -> Result<(), RecordError> {
        self.record(|rec| {
            // SAFETY: viewport is dynamic state on every pipeline we build.
            unsafe { rec.device.cmd_set_viewport(rec.raw(), &[viewport]) };
            Ok(())
        })
    }

    pub fn set_scissor(&mut self, scissor: vk::Rect2D) -> Result<(), RecordError> {
        self.record(|rec| {
            // SAFETY: scissor is dynamic state on every pipeline we build.
            unsafe { rec.device.cmd_set_scissor(rec.raw(), &[scissor]) };
            Ok(())
        })
    }

    pub fn set_stencil_reference(&mut self, reference: u32) -> Result<(), RecordError> {
        self.record(|rec| {
            // SAFETY: stencil reference is dynamic state on every pipeline.
            unsafe { rec.device.cmd_set_stencil_reference(rec.raw(), reference) };
            Ok(())
        })
    }

    // Pipeline functionality

    /// Bind the pipeline `state` builds for the active render target.
    pub fn bind_graphics_pipeline(
        &mut self,
        state: &GraphicsPipelineState,
        vertex_input: VertexInputId,
        draw_op: DrawOp,
    ) -> Result<vk::Pipeline, RecordError> {
        let Some(pass) = self.render_pass.as_ref() else {
            return Err(self.invalid("RecordingRenderPass"));
        };
        let key = GpuPipelineKey {
            render_target: pass.target,
            vertex_input,
            read_only: pass.read_only,
            draw_op,
        };
        let pipeline = state.get_pipeline(&self.ctx, key)?;
        self.record(|rec| {
            // SAFETY: pipeline was built for the active render target.
            unsafe {
                rec.device
                    .cmd_bind_pipeline(rec.raw(), vk::PipelineBindPoint::GRAPHICS, pipeline)
            };
            Ok(())
        })?;
        self.pipeline_bound = true;
        Ok(pipeline)
    }

    pub fn bind_compute_pipeline(&mut self, state: &ComputePipelineState) -> Result<(), RecordError> {
        let pipeline = state.raw_pipeline();
        self.record_transfer(|rec| {
            // SAFETY: pipeline is a compute pipeline owned by state.
            unsafe {
                rec.device
                    .cmd_bind_pipeline(rec.raw(), vk::PipelineBindPoint::COMPUTE, pipeline)
            };
            Ok(())
        })
    }

    pub fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[(&crate::buffer::GpuBuffer, vk::DeviceSize)],
    ) -> Result<(), RecordError> {
        let mut raw = Vec::with_capacity(buffers.len());
        let mut offsets = Vec::with_capacity(buffers.len());
        for (buffer, offset) in buffers {
            raw.push(buffer.bind(self, Access::READ)?);
            offsets.push(*offset);
        }
        self.record(|rec| {
            // SAFETY: every buffer was registered with this stream above.
            unsafe {
                rec.device
                    .cmd_bind_vertex_buffers(rec.raw(), first_binding, &raw, &offsets)
            };
            Ok(())
        })
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: &crate::buffer::GpuBuffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) -> Result<(), RecordError> {
        let raw = buffer.bind(self, Access::READ)?;
        self.record(|rec| {
            // SAFETY: buffer was registered with this stream above.
            unsafe {
                rec.device
                    .cmd_bind_index_buffer(rec.raw(), raw, offset, index_type)
            };
            Ok(())
        })
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<(), RecordError> {
        if self.state != CommandBufferState::RecordingRenderPass {
            return Err(self.invalid("RecordingRenderPass"));
        }
        if !self.pipeline_bound {
            return Err(RecordError::NoPipeline);
        }
        self.record(|rec| {
            // SAFETY: a graphics pipeline is bound inside a render pass.
            unsafe {
                rec.device.cmd_draw(
                    rec.raw(),
                    vertex_count,
                    instance_count,
                    first_vertex,
                    first_instance,
                )
            };
            Ok(())
        })
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<(), RecordError> {
        if self.state != CommandBufferState::RecordingRenderPass {
            return Err(self.invalid("RecordingRenderPass"));
        }
        if !self.pipeline_bound {
            return Err(RecordError::NoPipeline);
        }
        self.record(|rec| {
            // SAFETY: a graphics pipeline is bound inside a render pass.
            unsafe {
                rec.device.cmd_draw_indexed(
                    rec.raw(),
                    index_count,
                    instance_count,
                    first_index,
                    vertex_offset,
                    first_instance,
                )
            };
            Ok(())
        })
    }

    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<(), RecordError> {
        self.record_transfer(|rec| {
            // SAFETY: dispatch is recorded outside any render pass.
            unsafe { rec.device.cmd_dispatch(rec.raw(), x, y, z) };
            Ok(())
        })
    }

    // Submission functionality

    pub fn end(&mut self) -> Result<(), RecordError> {
        match self.state {
            CommandBufferState::Recording | CommandBufferState::RecordingRenderPass => {
                self.end_render_pass()?;
                self.state = CommandBufferState::RecordingDone;
                Ok(())
            }
            _ => Err(self.invalid("Recording")),
        }
    }

    /// Hand the stream to its queue. Ends recording if still open.
    pub fn submit(&mut self) -> Result<(), SubmitError> {
        if matches!(
            self.state,
            CommandBufferState::Recording | CommandBufferState::RecordingRenderPass
        ) {
            self.end()?;
        }
        if self.state != CommandBufferState::RecordingDone {
            return Err(self.invalid("RecordingDone").into());
        }
        let recording = self.recording.take().ok_or(RecordError::InvalidState {
            actual: self.state,
            expected: "RecordingDone",
        })?;
        self.state = CommandBufferState::Submitted;
        self.ctx.lock_streams().submit(recording)
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if let Some(recording) = self.recording.take() {
            tracing::debug!("Discarding unsubmitted command buffer {:?}", recording.raw());
            self.ctx.lock_streams().discard(recording);
        }
    }
}

impl<'a> RenderTarget<'a> {
    pub fn layout(&self) -> Option<crate::pipeline::RenderTargetLayout> {
        let samples = self
            .colors
            .first()
            .copied()
            .or(self.depth)?
            .desc()
            .samples;
        Some(crate::pipeline::RenderTargetLayout {
            colors: self.colors.iter().map(|t| t.desc().format).collect(),
            depth: self.depth.map(|t| t.desc().format),
            samples,
        })
    }
}

fn depth_attachment_layout(read_only: ReadOnlyFlags) -> vk::ImageLayout {
    let depth = read_only.contains(ReadOnlyFlags::DEPTH);
    let stencil = read_only.contains(ReadOnlyFlags::STENCIL);
    match (depth, stencil) {
        (true, true) => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        (true, false) => vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL,
        (false, true) => vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL,
        (false, false) => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    }
}

fn attachment_view(
    tracker: &mut ResourceTracker<NativeObject>,
    id: ResourceId,
) -> Result<vk::ImageView, RecordError> {
    match tracker.get_mut(id) {
        Some(NativeObject::Image(image)) => image
            .view(SubresourceRange::single(0, 0))
            .map_err(RecordError::CreateView),
        _ => Err(RecordError::MissingResource(id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHADER_READ: vk::ImageLayout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
    const TRANSFER_DST: vk::ImageLayout = vk::ImageLayout::TRANSFER_DST_OPTIMAL;
    const COLOR: vk::ImageLayout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;

    fn layout_of(entries: &[SubresourceUse], mip: u32, layer: u32) -> Option<SubresourceUse> {
        let hits: Vec<_> = entries
            .iter()
            .filter(|e| e.range.contains_subresource(mip, layer))
            .collect();
        assert!(hits.len() <= 1, "({mip}, {layer}) tracked twice");
        hits.first().map(|e| **e)
    }

    #[test]
    fn first_use_sets_initial_without_transition() {
        let mut entries = Vec::new();
        let range = SubresourceRange::whole(3, 2);
        let transitions = apply_image_use(&mut entries, range, TRANSFER_DST);
        assert!(transitions.is_empty());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].initial, TRANSFER_DST);
        assert_eq!(entries[0].current, TRANSFER_DST);
    }

    #[test]
    fn later_use_transitions_only_the_overlap() {
        let mut entries = Vec::new();
        apply_image_use(&mut entries, SubresourceRange::whole(4, 1), TRANSFER_DST);
        let transitions =
            apply_image_use(&mut entries, SubresourceRange::new(1, 2, 0, 1), SHADER_READ);
        assert_eq!(transitions, [(SubresourceRange::new(1, 2, 0, 1), TRANSFER_DST)]);

        for mip in 0..4 {
            let entry = layout_of(&entries, mip, 0).expect("tracked");
            assert_eq!(entry.initial, TRANSFER_DST);
            let expected = if (1..3).contains(&mip) { SHADER_READ } else { TRANSFER_DST };
            assert_eq!(entry.current, expected, "mip {mip}");
        }
    }

    #[test]
    fn partially_new_range_keeps_both_initials() {
        let mut entries = Vec::new();
        apply_image_use(&mut entries, SubresourceRange::single(0, 0), TRANSFER_DST);
        let transitions = apply_image_use(&mut entries, SubresourceRange::whole(1, 3), COLOR);
        assert_eq!(transitions, [(SubresourceRange::single(0, 0), TRANSFER_DST)]);

        let first = layout_of(&entries, 0, 0).expect("tracked");
        assert_eq!((first.initial, first.current), (TRANSFER_DST, COLOR));
        for layer in 1..3 {
            let entry = layout_of(&entries, 0, layer).expect("tracked");
            assert_eq!((entry.initial, entry.current), (COLOR, COLOR));
        }
    }

    #[test]
    fn same_layout_needs_no_barrier() {
        let mut entries = Vec::new();
        apply_image_use(&mut entries, SubresourceRange::whole(2, 2), SHADER_READ);
        let transitions = apply_image_use(&mut entries, SubresourceRange::whole(2, 2), SHADER_READ);
        assert!(transitions.is_empty());
    }

    #[test]
    fn planned_transitions_skip_matching_layouts() {
        let range = SubresourceRange::whole(2, 4);
        let layout_at = |mip: u32, layer: u32| {
            if mip == 1 && layer >= 2 { TRANSFER_DST } else { SHADER_READ }
        };
        let transitions = plan_transitions(range, layout_at, SHADER_READ);
        assert_eq!(transitions, [(SubresourceRange::new(1, 1, 2, 2), TRANSFER_DST)]);

        let all = plan_transitions(range, layout_at, COLOR);
        let covered: usize = all.iter().map(|(r, _)| r.len()).sum();
        assert_eq!(covered, range.len());
    }

    #[test]
    fn depth_layout_follows_read_only_flags() {
        assert_eq!(
            depth_attachment_layout(ReadOnlyFlags::DEPTH | ReadOnlyFlags::STENCIL),
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            depth_attachment_layout(ReadOnlyFlags::STENCIL),
            vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            depth_attachment_layout(ReadOnlyFlags::empty()),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
    }
}
