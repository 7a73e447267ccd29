//! The per-queue transfer batch.
//!
//! A [`TransferBatch`] is a command stream that is always available for
//! uploads, read-backs and layout changes outside the main command
//! buffers. It is created lazily, flushed explicitly through
//! [`GpuContext::flush_transfer`](crate::GpuContext::flush_transfer), and
//! flushed implicitly before the next main-stream submission on any
//! queue.
//!
//! Unlike a main-stream command buffer, layout changes recorded here take
//! effect on the tracked image layouts immediately: the batch always
//! executes before any main-stream work submitted after it.

use std::sync::Arc;

use ash::vk;

use crate::barrier;
use crate::command::{RecordError, Recorder, Recording, plan_transitions};
use crate::context::NativeObject;
use crate::device::Device;
use crate::queue::{QueueId, SyncMask};
use crate::subresource::SubresourceRange;
use crate::texture::GpuTexture;
use crate::tracker::{Access, ResourceId, ResourceTracker};

pub struct TransferBatch<'a> {
    recorder: Recorder<'a>,
}

impl std::fmt::Debug for TransferBatch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferBatch")
            .field("recording", &self.recorder.recording)
            .finish_non_exhaustive()
    }
}

impl<'a> TransferBatch<'a> {
    pub(crate) fn new(
        device: &'a Arc<Device>,
        tracker: &'a mut ResourceTracker<NativeObject>,
        recording: &'a mut Recording,
    ) -> Self {
        Self {
            recorder: Recorder {
                device,
                tracker,
                recording,
            },
        }
    }

    pub fn queue(&self) -> QueueId {
        self.recorder.queue()
    }

    /// Make the batch wait on every queue in `mask` when it is submitted.
    pub fn append_mask(&mut self, mask: SyncMask) {
        self.recorder.recording.wait_mask |= mask;
    }

    pub fn memory_barrier(
        &mut self,
        buffer: vk::Buffer,
        src_access: vk::AccessFlags2,
        dst_access: vk::AccessFlags2,
        src_stage: vk::PipelineStageFlags2,
        dst_stage: vk::PipelineStageFlags2,
    ) {
        self.recorder
            .buffer_barrier(buffer, src_access, dst_access, src_stage, dst_stage);
    }

    /// Transition `range` of `texture`'s current image to `layout`.
    pub fn set_texture_layout(
        &mut self,
        texture: &GpuTexture,
        range: SubresourceRange,
        layout: vk::ImageLayout,
    ) -> Result<(), RecordError> {
        self.set_layout(texture.current_id(), range, layout)
    }

    /// Transition every subresource of `range` whose tracked layout differs
    /// from `layout`. Heterogeneous ranges are merged into as few barriers
    /// as possible.
    pub(crate) fn set_layout(
        &mut self,
        id: ResourceId,
        range: SubresourceRange,
        layout: vk::ImageLayout,
    ) -> Result<(), RecordError> {
        let Some(NativeObject::Image(image)) = self.recorder.tracker.get(id) else {
            return Err(RecordError::MissingResource(id));
        };
        let transitions = plan_transitions(range, |mip, layer| image.layout(mip, layer), layout);
        if transitions.is_empty() {
            return Ok(());
        }
        let (handle, aspect, usage) = (image.handle(), image.aspect(), image.usage());
        let barriers: Vec<_> = transitions
            .iter()
            .map(|&(piece, old)| {
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
        let subresources: Vec<ResourceId> = transitions
            .iter()
            .flat_map(|(piece, _)| piece.iter())
            .map(|(mip, layer)| image.subresource_id(mip, layer))
            .collect();

        let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
        // SAFETY: the batch is recording and the image is tracked, so alive.
        unsafe {
            self.recorder
                .device
                .cmd_pipeline_barrier2(self.recorder.raw(), &dependency)
        };

        if let Some(NativeObject::Image(image)) = self.recorder.tracker.get_mut(id) {
            for (piece, _) in &transitions {
                image.set_layout(*piece, layout);
            }
        }
        self.recorder.register(id, Access::WRITE);
        for sub in subresources {
            self.recorder.register(sub, Access::WRITE);
        }
        Ok(())
    }

    /// Register `id` with the batch so it stays alive until it executes.
    pub(crate) fn register(&mut self, id: ResourceId, access: Access) {
        self.recorder.register(id, access);
    }

    pub(crate) fn recorder(&mut self) -> &mut Recorder<'a> {
        &mut self.recorder
    }
}
