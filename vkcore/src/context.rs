//! The per-device GPU context: queue streams, submission and completion.
//!
//! All command recording, resource registration and lifetime bookkeeping
//! happens under one lock ([`Streams`]). Keeping the tracker behind the
//! same lock as the streams means the bound/used state a lock request
//! inspects cannot change between the decision and the recorded work.

use std::sync::{Arc, Mutex, MutexGuard};

use ash::vk;
use thiserror::Error;

use crate::buffer::BufferObject;
use crate::command::{
    AcquireCommandBufferError, CommandBuffer, CommandPool, CreateCommandPoolError, Recording,
    SubmitError,
};
use crate::device::Device;
use crate::pipeline::{
    Interner, RenderTargetId, RenderTargetLayout, VertexInputId, VertexInputLayout,
};
use crate::queue::{QueueId, QueueType};
use crate::subresource::SubresourceRange;
use crate::sync::{CreateSyncError, TimelineSemaphore};
use crate::texture::ImageObject;
use crate::tracker::{Release, ResourceTracker};
use crate::transfer::TransferBatch;

/// Payload of a tracked resource.
#[derive(Debug)]
pub(crate) enum NativeObject {
    Buffer(BufferObject),
    Image(ImageObject),
    /// One (mip, layer) of an image. Carries no native handle; it exists
    /// so each subresource has its own use counts.
    Subresource,
}

#[derive(Debug, Error)]
pub enum CreateContextError {
    #[error("Failed to create command pool: {0}")]
    CommandPool(#[from] CreateCommandPoolError),
    #[error("Failed to create timeline semaphore: {0}")]
    Timeline(#[from] CreateSyncError),
}

pub(crate) struct QueueState {
    id: QueueId,
    timeline: TimelineSemaphore,
    last_signalled: u64,
    pool: CommandPool,
    in_flight: Vec<Recording>,
    transfer: Option<Recording>,
}

impl std::fmt::Debug for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueState")
            .field("id", &self.id)
            .field("last_signalled", &self.last_signalled)
            .field("in_flight", &self.in_flight.len())
            .field("transfer", &self.transfer.is_some())
            .finish_non_exhaustive()
    }
}

/// Everything guarded by the context lock.
#[derive(Debug)]
pub(crate) struct Streams {
    pub device: Arc<Device>,
    pub tracker: ResourceTracker<NativeObject>,
    queues: Vec<QueueState>,
}

impl Streams {
    fn state(&mut self, queue: QueueId) -> &mut QueueState {
        &mut self.queues[queue.ty.index()]
    }

    pub(crate) fn begin_recording(
        &mut self,
        queue: QueueId,
    ) -> Result<Recording, AcquireCommandBufferError> {
        let device = Arc::clone(&self.device);
        let cb = self.state(queue).pool.acquire()?;
        Ok(Recording::begin(&device, queue, cb))
    }

    /// The transfer batch of `queue`, created on first use.
    pub(crate) fn transfer(
        &mut self,
        queue: QueueId,
    ) -> Result<TransferBatch<'_>, AcquireCommandBufferError> {
        let Streams {
            device,
            tracker,
            queues,
        } = self;
        let state = &mut queues[queue.ty.index()];
        let recording = match state.transfer.take() {
            Some(recording) => recording,
            None => Recording::begin(device, queue, state.pool.acquire()?),
        };
        let recording = state.transfer.insert(recording);
        Ok(TransferBatch::new(device, tracker, recording))
    }

    /// Submit the transfer batch of `queue`. With `wait`, block until the
    /// queue has executed it and retire finished work.
    pub(crate) fn flush_transfer(&mut self, queue: QueueId, wait: bool) -> Result<(), SubmitError> {
        if let Some(recording) = self.state(queue).transfer.take() {
            let barriers = [crate::barrier::host_read_barrier()];
            let dependency = vk::DependencyInfo::default().memory_barriers(&barriers);
            // SAFETY: the transfer batch is still recording.
            unsafe {
                self.device
                    .cmd_pipeline_barrier2(recording.raw(), &dependency)
            };
            self.submit_recording(recording)?;
        }
        if wait {
            self.wait_queue(queue)?;
        }
        Ok(())
    }

    fn flush_all_transfers(&mut self) -> Result<Vec<QueueId>, SubmitError> {
        let pending: Vec<QueueId> = self
            .queues
            .iter()
            .filter(|state| state.transfer.is_some())
            .map(|state| state.id)
            .collect();
        for &queue in &pending {
            self.flush_transfer(queue, false)?;
        }
        Ok(pending)
    }

    /// Submit a main-stream recording.
    pub(crate) fn submit(&mut self, mut recording: Recording) -> Result<(), SubmitError> {
        let queue = recording.queue;

        let fixups: Vec<_> = recording
            .images
            .iter()
            .flat_map(|(&id, uses)| uses.entries.iter().map(move |e| (id, e.range, e.initial)))
            .collect();
        if !fixups.is_empty() {
            let fixed = (|| {
                let mut batch = self.transfer(queue)?;
                for (id, range, layout) in fixups {
                    batch.set_layout(id, range, layout)?;
                }
                Ok::<_, SubmitError>(())
            })();
            if let Err(e) = fixed {
                self.discard(recording);
                return Err(e);
            }
        }

        match self.flush_all_transfers() {
            Ok(flushed) => {
                for other in flushed {
                    recording.wait_mask.insert(other);
                }
            }
            Err(e) => {
                self.discard(recording);
                return Err(e);
            }
        }
        self.submit_recording(recording)?;
        Ok(())
    }

    /// End, submit and start tracking `recording`. Returns the timeline
    /// value it signals.
    fn submit_recording(&mut self, mut recording: Recording) -> Result<u64, SubmitError> {
        let queue = recording.queue;

        let wait = self.tracker.hazard_mask(
            queue,
            recording.wait_mask,
            recording.uses.iter().map(|(&id, &access)| (id, access)),
        );

        // SAFETY: recording is in the recording state; every render pass
        // was ended before it reached here.
        if let Err(e) = unsafe { self.device.end_raw_command_buffer(recording.raw()) } {
            self.discard(recording);
            return Err(SubmitError::End(e));
        }

        let wait_infos: Vec<vk::SemaphoreSubmitInfo<'_>> = wait
            .queues()
            .map(|q| &self.queues[q.ty.index()])
            .filter(|state| state.last_signalled > 0)
            .map(|state| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(state.timeline.raw_semaphore())
                    .value(state.last_signalled)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            })
            .collect();
        let state = &self.queues[queue.ty.index()];
        let value = state.last_signalled + 1;
        let signal_infos = [vk::SemaphoreSubmitInfo::default()
            .semaphore(state.timeline.raw_semaphore())
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let cb_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(recording.raw())];
        let submit = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&wait_infos)
            .command_buffer_infos(&cb_infos)
            .signal_semaphore_infos(&signal_infos);

        // SAFETY: the command buffer is executable, the fence unsignaled
        // and every semaphore belongs to this device.
        let submitted = unsafe {
            self.device
                .queue_submit2(queue.ty, &[submit], recording.cb.fence().raw_fence())
        };
        if let Err(result) = submitted {
            self.discard(recording);
            return Err(SubmitError::Submit { queue, result });
        }
        // SAFETY: the driver accepted the submission carrying this fence.
        unsafe { recording.cb.fence_mut().arm() };
        tracing::debug!(
            "Submitted {:?} to {queue} (value {value}, waits {wait:?}, {} resources)",
            recording.raw(),
            recording.uses.len()
        );

        for (id, uses) in &recording.images {
            if let Some(NativeObject::Image(image)) = self.tracker.get_mut(*id) {
                for entry in &uses.entries {
                    image.set_layout(entry.range, entry.current);
                }
            }
        }
        for (&id, &access) in &recording.uses {
            self.tracker.notify_used(id, queue, access);
        }

        let state = self.state(queue);
        state.last_signalled = value;
        state.in_flight.push(recording);

        // The submission itself went through; a failed poll only delays
        // retirement until the next refresh.
        if let Err(e) = self.refresh() {
            tracing::warn!("Failed to retire finished work after submitting to {queue}: {e}");
        }
        Ok(value)
    }

    /// Drop a recording that will never be submitted.
    pub(crate) fn discard(&mut self, recording: Recording) {
        let Recording { queue, cb, uses, .. } = recording;
        for (id, release) in self.tracker.unbind_all(uses.into_keys()) {
            self.on_release(id, release);
        }
        self.state(queue).pool.recycle(cb);
    }

    fn on_release(&mut self, id: crate::tracker::ResourceId, release: Release<NativeObject>) {
        match release {
            Release::Freed(object) => drop(object),
            Release::Idle => {
                if let Some(NativeObject::Buffer(buffer)) = self.tracker.get_mut(id) {
                    buffer.destroy_unused_views();
                }
            }
            Release::Pending => {}
        }
    }

    /// Retire every submission whose fence has signalled. Never blocks.
    pub(crate) fn refresh(&mut self) -> Result<(), SubmitError> {
        let mut first_error = None;
        for index in 0..self.queues.len() {
            let state = &mut self.queues[index];
            let (done, error) = take_signalled(&mut state.in_flight, |recording| {
                recording.cb.fence().poll()
            });
            if let Some(e) = error {
                first_error.get_or_insert(SubmitError::Fence(e));
            }

            for recording in done {
                let Recording { queue, cb, uses, .. } = recording;
                for (id, release) in self.tracker.retire(queue, uses) {
                    self.on_release(id, release);
                }
                self.state(queue).pool.recycle(cb);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Block until everything submitted to `queue` so far has executed.
    pub(crate) fn wait_queue(&mut self, queue: QueueId) -> Result<(), SubmitError> {
        let state = self.state(queue);
        let target = state.last_signalled;
        let reached = state
            .timeline
            .completed_value()
            .map_err(|result| SubmitError::Wait { queue, result })?;
        if reached < target {
            state.timeline.wait(target, u64::MAX).map_err(|e| SubmitError::Wait {
                queue,
                result: e.result(),
            })?;
        }
        self.refresh()
    }

    /// Current tracked layout of every subresource in `range`.
    pub(crate) fn image_layouts(
        &self,
        id: crate::tracker::ResourceId,
        range: SubresourceRange,
    ) -> Option<Vec<vk::ImageLayout>> {
        match self.tracker.get(id) {
            Some(NativeObject::Image(image)) => Some(
                range
                    .iter()
                    .map(|(mip, layer)| image.layout(mip, layer))
                    .collect(),
            ),
            _ => None,
        }
    }
}

/// Split the entries whose completion query reports `true` off the
/// front-to-back order of `in_flight`. Entries whose query fails stay
/// pending; the first failure is returned alongside.
fn take_signalled<R, E>(
    in_flight: &mut Vec<R>,
    mut signalled: impl FnMut(&R) -> Result<bool, E>,
) -> (Vec<R>, Option<E>) {
    let mut done = Vec::new();
    let mut pending = Vec::with_capacity(in_flight.len());
    let mut first_error = None;
    for entry in in_flight.drain(..) {
        match signalled(&entry) {
            Ok(true) => done.push(entry),
            Ok(false) => pending.push(entry),
            Err(e) => {
                first_error.get_or_insert(e);
                pending.push(entry);
            }
        }
    }
    *in_flight = pending;
    (done, first_error)
}

/// Owns the queue streams of one device plus the identity interners the
/// pipeline cache keys on.
pub struct GpuContext {
    device: Arc<Device>,
    streams: Mutex<Streams>,
    render_targets: Interner<RenderTargetLayout>,
    vertex_inputs: Interner<VertexInputLayout>,
}

impl std::fmt::Debug for GpuContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuContext")
            .field("device", &self.device.raw_device())
            .finish_non_exhaustive()
    }
}

impl GpuContext {
    pub fn new(device: &Arc<Device>) -> Result<Arc<Self>, CreateContextError> {
        let mut queues = Vec::with_capacity(QueueType::ALL.len());
        for ty in QueueType::ALL {
            let id = QueueId::primary(ty);
            queues.push(QueueState {
                id,
                timeline: TimelineSemaphore::new(device, Some(&format!("{id} timeline")))?,
                last_signalled: 0,
                pool: CommandPool::new(device, id)?,
                in_flight: Vec::new(),
                transfer: None,
            });
        }
        Ok(Arc::new(Self {
            device: Arc::clone(device),
            streams: Mutex::new(Streams {
                device: Arc::clone(device),
                tracker: ResourceTracker::new(),
                queues,
            }),
            render_targets: Interner::default(),
            vertex_inputs: Interner::default(),
        }))
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub(crate) fn lock_streams(&self) -> MutexGuard<'_, Streams> {
        self.streams.lock().expect("stream lock poisoned")
    }

    /// A new command buffer for the primary queue of `ty`, in the `Ready`
    /// state.
    pub fn command_buffer(self: &Arc<Self>, ty: QueueType) -> CommandBuffer {
        CommandBuffer::new(Arc::clone(self), QueueId::primary(ty))
    }

    /// Record into the transfer batch of `queue`.
    pub fn with_transfer<R>(
        &self,
        queue: QueueId,
        f: impl FnOnce(&mut TransferBatch<'_>) -> Result<R, SubmitError>,
    ) -> Result<R, SubmitError> {
        let mut streams = self.lock_streams();
        let mut batch = streams.transfer(queue)?;
        f(&mut batch)
    }

    /// Submit the transfer batch of `queue`, optionally blocking until it
    /// has executed.
    pub fn flush_transfer(&self, queue: QueueId, wait: bool) -> Result<(), SubmitError> {
        self.lock_streams().flush_transfer(queue, wait)
    }

    /// Retire finished submissions and free resources they kept alive.
    pub fn refresh(&self) -> Result<(), SubmitError> {
        self.lock_streams().refresh()
    }

    /// Flush every transfer batch and block until all queues are idle.
    pub fn wait_idle(&self) -> Result<(), SubmitError> {
        let mut streams = self.lock_streams();
        for ty in QueueType::ALL {
            streams.flush_transfer(QueueId::primary(ty), false)?;
        }
        for ty in QueueType::ALL {
            streams.wait_queue(QueueId::primary(ty))?;
        }
        Ok(())
    }

    /// Number of resources that have not been freed yet.
    pub fn tracked_resources(&self) -> usize {
        self.lock_streams().tracker.len()
    }

    pub fn intern_render_target(&self, layout: RenderTargetLayout) -> RenderTargetId {
        RenderTargetId(self.render_targets.intern(layout))
    }

    pub fn render_target_layout(&self, id: RenderTargetId) -> Option<Arc<RenderTargetLayout>> {
        self.render_targets.get(id.0)
    }

    pub fn intern_vertex_input(&self, layout: VertexInputLayout) -> VertexInputId {
        VertexInputId(self.vertex_inputs.intern(layout))
    }

    pub fn vertex_input_layout(&self, id: VertexInputId) -> Option<Arc<VertexInputLayout>> {
        self.vertex_inputs.get(id.0)
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        tracing::debug!("Dropping GPU context");
        if let Err(e) = self.device.wait_idle() {
            tracing::error!("Failed to wait for device idle: {e}");
        }
        let streams = match self.streams.get_mut() {
            Ok(streams) => streams,
            Err(poisoned) => poisoned.into_inner(),
        };
        for ty in QueueType::ALL {
            if let Some(recording) = streams.state(QueueId::primary(ty)).transfer.take() {
                streams.discard(recording);
            }
        }
        if let Err(e) = streams.refresh() {
            tracing::error!("Failed to retire submissions: {e}");
        }
        if !streams.tracker.is_empty() {
            tracing::warn!(
                "{} tracked resources outlived the context",
                streams.tracker.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{Access, ResourceId};

    struct Submitted {
        signalled: bool,
        uses: Vec<(ResourceId, Access)>,
    }

    fn poll(submitted: &Submitted) -> Result<bool, vk::Result> {
        Ok(submitted.signalled)
    }

    #[test]
    fn signalled_submissions_retire_without_waiting() {
        let gfx = QueueId::primary(QueueType::Graphics);
        let mut tracker = ResourceTracker::new();
        let vertices = tracker.insert("vertices");
        for _ in 0..2 {
            tracker.notify_bound(vertices);
            tracker.notify_used(vertices, gfx, Access::READ);
        }
        let mut in_flight = vec![
            Submitted {
                signalled: true,
                uses: vec![(vertices, Access::READ)],
            },
            Submitted {
                signalled: false,
                uses: vec![(vertices, Access::READ)],
            },
        ];

        let (done, error) = take_signalled(&mut in_flight, poll);
        assert!(error.is_none());
        assert_eq!(done.len(), 1);
        assert_eq!(in_flight.len(), 1);
        for submitted in done {
            let _ = tracker.retire(gfx, submitted.uses);
        }
        assert!(tracker.is_in_use(vertices));

        in_flight[0].signalled = true;
        let (done, _) = take_signalled(&mut in_flight, poll);
        assert!(in_flight.is_empty());
        for submitted in done {
            let _ = tracker.retire(gfx, submitted.uses);
        }
        assert!(!tracker.is_in_use(vertices));
        assert!(!tracker.is_bound(vertices));
    }

    #[test]
    fn failed_queries_stay_pending() {
        let mut in_flight = vec![1, 2, 3];
        let (done, error) = take_signalled(&mut in_flight, |&n| match n {
            1 => Ok(true),
            2 => Err(vk::Result::ERROR_DEVICE_LOST),
            _ => Err(vk::Result::ERROR_UNKNOWN),
        });
        assert_eq!(done, [1]);
        assert_eq!(in_flight, [2, 3]);
        assert_eq!(error, Some(vk::Result::ERROR_DEVICE_LOST));
    }
}
