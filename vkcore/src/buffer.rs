//! GPU buffers and the buffer memory manager.
//!
//! A [`GpuBuffer`] is the thread-agnostic handle; the native buffer and
//! its allocation live in a [`BufferObject`] owned by the context's
//! resource tracker. Locking the buffer for CPU access picks one of three
//! targets:
//!
//! - the buffer's own persistently mapped memory, for dynamic buffers,
//! - a host-visible staging buffer that is copied to or from the real
//!   buffer on the transfer batch,
//! - plain CPU scratch memory for small write-only uploads that need no
//!   read-back.
//!
//! Whenever writing in place would disturb GPU work that is queued but
//! not finished, the backing object is replaced instead (clone-on-bind).
//! The decision logic lives in [`plan_lock`] and [`plan_unlock`] so it can
//! be tested without a GPU.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use ash::vk;
use bitflags::bitflags;
use bytemuck::Pod;
use gpu_allocator::AllocationError;
use thiserror::Error;

use crate::command::{AcquireCommandBufferError, CommandBuffer, RecordError, SubmitError};
use crate::context::{GpuContext, NativeObject, Streams};
use crate::device::Device;
use crate::memory::{self, DeviceAllocation, MemoryUsage};
use crate::queue::{QueueId, QueueType};
use crate::tracker::{Access, Disposal, ResourceId, ResourceTracker};

/// Largest write-only lock served from CPU scratch memory.
pub const SCRATCH_LIMIT: vk::DeviceSize = 64 * 1024;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateBufferError {
    #[error("Vulkan error creating buffer: {0}")]
    CreateBuffer(vk::Result),

    #[error("GPU allocator error allocating memory: {0}")]
    AllocateMemory(AllocationError),

    #[error("Vulkan error binding buffer memory: {0}")]
    BindMemory(vk::Result),

    #[error("Buffer size must be non-zero")]
    ZeroSize,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Lock range (offset {offset}, length {len}) exceeds resource size {size}")]
    OutOfRange {
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
        size: vk::DeviceSize,
    },
    #[error("Zero-length lock")]
    Empty,
    #[error("Resource is already locked")]
    AlreadyLocked,
    #[error("CPU access to multisampled textures is not supported")]
    Multisampled,
    #[error("3D texture arrays are not supported")]
    VolumeArray,
    #[error("Subresource (mip {mip}, face {face}) does not exist")]
    InvalidSubresource { mip: u32, face: u32 },
    #[error("Failed to create backing object: {0}")]
    CreateBuffer(#[from] CreateBufferError),
    #[error("Failed to create backing image: {0}")]
    CreateTexture(#[from] crate::texture::CreateTextureError),
    #[error("Failed to acquire transfer batch: {0}")]
    Acquire(#[from] AcquireCommandBufferError),
    #[error("Failed to record transfer: {0}")]
    Record(#[from] RecordError),
    #[error("Failed to submit transfer: {0}")]
    Submit(#[from] SubmitError),
    #[error("Vulkan error synchronising mapped memory: {0}")]
    MappedMemory(vk::Result),
    #[error("Memory is not host-mapped")]
    NotMapped,
    #[error("CPU access to format {0:?} is not supported")]
    UnsupportedFormat(vk::Format),
    #[error("Data is {actual} bytes but the subresource holds {expected}")]
    SizeMismatch {
        expected: vk::DeviceSize,
        actual: vk::DeviceSize,
    },
}

#[derive(Debug, Error)]
pub enum CopyBufferError {
    #[error(
        "Copy region out of bounds: src(size={src_size}, offset={src_offset}), \
         dst(size={dst_size}, offset={dst_offset}), copy={len}"
    )]
    RegionOutOfBounds {
        src_size: vk::DeviceSize,
        src_offset: vk::DeviceSize,
        dst_size: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        len: vk::DeviceSize,
    },
    #[error("Failed to record copy: {0}")]
    Record(#[from] RecordError),
}

// ---------------------------------------------------------------------------
// Descriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
    Uniform,
    /// Typed texel buffer.
    Generic,
    /// Storage buffer of structs.
    Structured,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u8 {
        /// Updated often from the CPU. Lives in host-visible memory and is
        /// mapped directly when possible.
        const DYNAMIC = 1;
        /// Written by shaders.
        const LOAD_STORE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub kind: BufferKind,
    pub size: vk::DeviceSize,
    pub usage: BufferUsage,
    /// Element format for texel views. `UNDEFINED` when unused.
    pub format: vk::Format,
}

impl BufferDesc {
    pub fn new(kind: BufferKind, size: vk::DeviceSize, usage: BufferUsage) -> Self {
        Self {
            kind,
            size,
            usage,
            format: vk::Format::UNDEFINED,
        }
    }

    pub fn vk_usage(&self) -> vk::BufferUsageFlags {
        use vk::BufferUsageFlags as U;
        let load_store = self.usage.contains(BufferUsage::LOAD_STORE);
        let texel = if load_store {
            U::UNIFORM_TEXEL_BUFFER | U::STORAGE_TEXEL_BUFFER
        } else {
            U::empty()
        };
        let kind = match self.kind {
            BufferKind::Vertex => U::VERTEX_BUFFER | texel,
            BufferKind::Index => U::INDEX_BUFFER | texel,
            BufferKind::Uniform => U::UNIFORM_BUFFER,
            BufferKind::Generic if load_store => {
                U::UNIFORM_TEXEL_BUFFER | U::STORAGE_TEXEL_BUFFER
            }
            BufferKind::Generic => U::UNIFORM_TEXEL_BUFFER,
            BufferKind::Structured => U::STORAGE_BUFFER,
        };
        kind | U::TRANSFER_SRC | U::TRANSFER_DST
    }

    pub fn supports_gpu_writes(&self) -> bool {
        self.kind == BufferKind::Structured || self.usage.contains(BufferUsage::LOAD_STORE)
    }

    pub fn directly_mappable(&self) -> bool {
        self.usage.contains(BufferUsage::DYNAMIC)
    }

    fn memory_usage(&self) -> MemoryUsage {
        if self.directly_mappable() {
            MemoryUsage::CpuToGpu
        } else {
            MemoryUsage::GpuOnly
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
    ReadOnly,
    ReadWrite,
    /// The whole buffer may be discarded.
    WriteOnlyDiscard,
    /// Only the locked range may be discarded.
    WriteOnlyDiscardRange,
    /// The caller will not touch data the GPU is using.
    WriteOnlyNoOverwrite,
}

impl LockKind {
    pub fn reads(self) -> bool {
        matches!(self, LockKind::ReadOnly | LockKind::ReadWrite)
    }

    pub fn writes(self) -> bool {
        self != LockKind::ReadOnly
    }

    pub(crate) fn host_access(self) -> vk::AccessFlags2 {
        match self {
            LockKind::ReadOnly => vk::AccessFlags2::HOST_READ,
            LockKind::ReadWrite => vk::AccessFlags2::HOST_READ | vk::AccessFlags2::HOST_WRITE,
            _ => vk::AccessFlags2::HOST_WRITE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WriteMode {
    #[default]
    Normal,
    NoOverwrite,
    Discard,
}

impl WriteMode {
    pub fn lock_kind(self) -> LockKind {
        match self {
            WriteMode::Normal => LockKind::WriteOnlyDiscardRange,
            WriteMode::NoOverwrite => LockKind::WriteOnlyNoOverwrite,
            WriteMode::Discard => LockKind::WriteOnlyDiscard,
        }
    }
}

// ---------------------------------------------------------------------------
// Lock planning
// ---------------------------------------------------------------------------

/// What the tracker says about the current backing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LockFacts {
    pub mappable: bool,
    pub gpu_writes: bool,
    /// Some submission that reads or writes the object has not retired.
    pub in_use: bool,
    /// Some command stream references the object.
    pub bound: bool,
}

impl LockFacts {
    pub(crate) fn observe<T>(
        tracker: &ResourceTracker<T>,
        id: ResourceId,
        mappable: bool,
        gpu_writes: bool,
    ) -> Self {
        Self {
            mappable,
            gpu_writes,
            in_use: tracker.is_in_use(id),
            bound: tracker.is_bound(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DirectPrep {
    /// Map as is.
    None,
    /// Swap in a new backing object first, copying the old contents over
    /// when `copy` is set.
    Replace { copy: bool },
    /// Flush the transfer batch and wait for conflicting GPU work. Readers
    /// are waited on as well as writers when `wait_reads`. A shader-write
    /// to host barrier is recorded when `barrier`. Afterwards the object
    /// is cloned if `clone_if_bound` and it is still referenced.
    Wait {
        wait_reads: bool,
        barrier: bool,
        clone_if_bound: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockPlan {
    Direct(DirectPrep),
    Scratch,
    /// Use a staging buffer, filling it from the real buffer first when
    /// `read` is set.
    Staging { read: bool },
}

pub(crate) fn plan_lock(
    facts: LockFacts,
    kind: LockKind,
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
) -> LockPlan {
    if facts.mappable {
        if kind == LockKind::WriteOnlyNoOverwrite {
            return LockPlan::Direct(DirectPrep::None);
        }

        // A buffer the GPU may write counts as used: a finished write still
        // needs a barrier before the host can see it.
        let used = facts.in_use || facts.gpu_writes;
        if !used {
            if facts.bound {
                return LockPlan::Direct(DirectPrep::Replace {
                    copy: kind != LockKind::WriteOnlyDiscard,
                });
            }
            return LockPlan::Direct(DirectPrep::None);
        }

        if kind == LockKind::WriteOnlyDiscard {
            return LockPlan::Direct(DirectPrep::Replace { copy: false });
        }

        if kind.reads() {
            return LockPlan::Direct(DirectPrep::Wait {
                wait_reads: kind == LockKind::ReadWrite,
                barrier: facts.gpu_writes,
                clone_if_bound: kind == LockKind::ReadWrite,
            });
        }
        // Write-only with the GPU busy: stage rather than stall.
    }

    let need_read = !matches!(
        kind,
        LockKind::WriteOnlyDiscard | LockKind::WriteOnlyDiscardRange
    );
    if !need_read && offset % 4 == 0 && len % 4 == 0 && len <= SCRATCH_LIMIT {
        return LockPlan::Scratch;
    }
    LockPlan::Staging { read: need_read }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UnlockFacts {
    pub in_use: bool,
    /// Referenced by a stream that has not been submitted yet.
    pub bound_without_use: bool,
    /// The lock covered the whole buffer.
    pub covers_whole: bool,
}

impl UnlockFacts {
    pub(crate) fn observe<T>(
        tracker: &ResourceTracker<T>,
        id: ResourceId,
        covers_whole: bool,
    ) -> Self {
        Self {
            in_use: tracker.is_in_use(id),
            bound_without_use: tracker.bound_count(id) > tracker.use_count(id),
            covers_whole,
        }
    }
}

/// How staged data gets back into the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnlockPlan {
    /// Copy into the current object. With `wait_on_use` the transfer
    /// batch first waits on every queue using it.
    Copy { wait_on_use: bool },
    /// Copy into a fresh object; the old contents are dropped.
    Recreate,
    /// Copy into a fresh object, carrying the old contents over first when
    /// `copy_old` is set.
    Clone { copy_old: bool, wait_on_use: bool },
}

pub(crate) fn plan_unlock(facts: UnlockFacts, kind: LockKind) -> UnlockPlan {
    let mut wait_on_use = false;
    if facts.in_use {
        match kind {
            LockKind::WriteOnlyNoOverwrite => return UnlockPlan::Copy { wait_on_use: false },
            LockKind::WriteOnlyDiscard => return UnlockPlan::Recreate,
            _ => wait_on_use = true,
        }
    }
    if facts.bound_without_use {
        UnlockPlan::Clone {
            copy_old: !facts.covers_whole,
            wait_on_use,
        }
    } else {
        UnlockPlan::Copy { wait_on_use }
    }
}

// ---------------------------------------------------------------------------
// BufferObject
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BufferViewEntry {
    view: vk::BufferView,
    refs: u32,
}

/// A native buffer plus its memory. Lives in the resource tracker and is
/// destroyed when the tracker frees it.
pub(crate) struct BufferObject {
    parent: Arc<Device>,
    handle: vk::Buffer,
    allocation: Option<DeviceAllocation>,
    size: vk::DeviceSize,
    views: HashMap<vk::Format, BufferViewEntry>,
}

impl std::fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferObject")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("views", &self.views.len())
            .finish_non_exhaustive()
    }
}

impl BufferObject {
    pub(crate) fn new(
        device: &Arc<Device>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_usage: MemoryUsage,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        if size == 0 {
            return Err(CreateBufferError::ZeroSize);
        }
        let (sharing_mode, families) = device.sharing_mode();
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(sharing_mode)
            .queue_family_indices(families);

        // SAFETY: create_info is fully initialised; families outlives it.
        let handle = unsafe { device.create_raw_buffer(&create_info) }
            .map_err(CreateBufferError::CreateBuffer)?;
        device.name_or_warn(handle, name);

        // SAFETY: handle is a valid buffer created from this device.
        let reqs = unsafe { device.get_raw_buffer_memory_requirements(handle) };
        let allocation = device
            .allocator()
            .allocate(name.unwrap_or("buffer"), reqs, memory_usage, true)
            .map_err(|e| {
                // SAFETY: handle was created above and is not bound yet.
                unsafe { device.destroy_raw_buffer(handle) };
                CreateBufferError::AllocateMemory(e)
            })?;

        // SAFETY: handle and allocation memory belong to this device and
        // the allocation honours the buffer's requirements.
        let bind_result = unsafe {
            device.bind_raw_buffer_memory(handle, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bind_result {
            if let Err(free_err) = device.allocator().free(allocation) {
                tracing::error!("Failed to free GPU allocation: {free_err}");
            }
            // SAFETY: handle is owned by this scope.
            unsafe { device.destroy_raw_buffer(handle) };
            return Err(CreateBufferError::BindMemory(e));
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            allocation: Some(allocation),
            size,
            views: HashMap::new(),
        })
    }

    pub(crate) fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub(crate) fn size(&self) -> vk::DeviceSize {
        self.size
    }

    fn allocation(&self) -> Result<&DeviceAllocation, LockError> {
        self.allocation.as_ref().ok_or(LockError::NotMapped)
    }

    /// Pointer to byte `offset` of the persistently mapped memory.
    pub(crate) fn mapped(&self, offset: vk::DeviceSize) -> Result<NonNull<u8>, LockError> {
        let base = self.allocation()?.mapped_ptr().ok_or(LockError::NotMapped)?;
        // SAFETY: callers bounds-check offset against self.size.
        Ok(unsafe { base.add(offset as usize) })
    }

    pub(crate) fn flush(&self, offset: vk::DeviceSize, len: vk::DeviceSize) -> Result<(), LockError> {
        memory::flush_mapped(&self.parent, self.allocation()?, offset, len)
            .map_err(LockError::MappedMemory)
    }

    pub(crate) fn invalidate(&self, offset: vk::DeviceSize, len: vk::DeviceSize) -> Result<(), LockError> {
        memory::invalidate_mapped(&self.parent, self.allocation()?, offset, len)
            .map_err(LockError::MappedMemory)
    }

    /// A texel view of the whole buffer. Views are shared per format and
    /// counted until [`release_view`](Self::release_view).
    pub(crate) fn acquire_view(&mut self, format: vk::Format) -> Result<vk::BufferView, vk::Result> {
        if let Some(entry) = self.views.get_mut(&format) {
            entry.refs += 1;
            return Ok(entry.view);
        }
        let create_info = vk::BufferViewCreateInfo::default()
            .buffer(self.handle)
            .format(format)
            .offset(0)
            .range(vk::WHOLE_SIZE);
        // SAFETY: the buffer was created with texel usage when its desc
        // names a format.
        let view = unsafe { self.parent.create_raw_buffer_view(&create_info) }?;
        self.views.insert(format, BufferViewEntry { view, refs: 1 });
        Ok(view)
    }

    pub(crate) fn release_view(&mut self, view: vk::BufferView) {
        if let Some(entry) = self.views.values_mut().find(|e| e.view == view) {
            entry.refs = entry.refs.saturating_sub(1);
        }
    }

    /// Destroy views nobody holds. Called once the buffer is idle so no
    /// pending work can reference them.
    pub(crate) fn destroy_unused_views(&mut self) {
        let parent = &self.parent;
        self.views.retain(|_, entry| {
            if entry.refs > 0 {
                return true;
            }
            // SAFETY: the buffer is idle and nobody holds the view.
            unsafe { parent.destroy_raw_buffer_view(entry.view) };
            false
        });
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        tracing::debug!("Dropping buffer {:?}", self.handle);
        for entry in self.views.values() {
            // SAFETY: the tracker only drops idle objects.
            unsafe { self.parent.destroy_raw_buffer_view(entry.view) };
        }
        // SAFETY: handle was created from parent and no pending work
        // references it.
        unsafe { self.parent.destroy_raw_buffer(self.handle) };
        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.parent.allocator().free(allocation)
        {
            tracing::error!("Failed to free GPU allocation: {e}");
        }
    }
}

pub(crate) fn buffer_object(streams: &Streams, id: ResourceId) -> Result<&BufferObject, LockError> {
    match streams.tracker.get(id) {
        Some(NativeObject::Buffer(buffer)) => Ok(buffer),
        _ => Err(RecordError::MissingResource(id).into()),
    }
}

/// Destroy `id`, dropping the payload now if nothing references it.
pub(crate) fn destroy_resource(streams: &mut Streams, id: ResourceId) {
    if let Disposal::Freed(object) = streams.tracker.destroy(id) {
        drop(object);
    }
}

// ---------------------------------------------------------------------------
// GpuBuffer
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BufferState {
    current: ResourceId,
    locked: bool,
}

/// A GPU buffer whose backing object may be replaced transparently.
pub struct GpuBuffer {
    ctx: Arc<GpuContext>,
    desc: BufferDesc,
    name: Option<String>,
    state: Mutex<BufferState>,
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("desc", &self.desc)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl GpuBuffer {
    pub fn new(
        ctx: &Arc<GpuContext>,
        desc: BufferDesc,
        name: Option<&str>,
    ) -> Result<Self, CreateBufferError> {
        let mut streams = ctx.lock_streams();
        let current = Self::create_object(&mut streams, &desc, name)?;
        drop(streams);
        Ok(Self {
            ctx: Arc::clone(ctx),
            desc,
            name: name.map(str::to_owned),
            state: Mutex::new(BufferState {
                current,
                locked: false,
            }),
        })
    }

    fn create_object(
        streams: &mut Streams,
        desc: &BufferDesc,
        name: Option<&str>,
    ) -> Result<ResourceId, CreateBufferError> {
        let object = BufferObject::new(
            &streams.device,
            desc.size,
            desc.vk_usage(),
            desc.memory_usage(),
            name,
        )?;
        Ok(streams.tracker.insert(NativeObject::Buffer(object)))
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.desc.size
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.ctx
    }

    pub(crate) fn current_id(&self) -> ResourceId {
        self.state.lock().expect("buffer state lock poisoned").current
    }

    /// Swap in a fresh backing object, optionally copying the old contents
    /// on the CPU. Only valid for mappable buffers.
    fn replace_mapped(
        &self,
        streams: &mut Streams,
        state: &mut BufferState,
        copy: bool,
    ) -> Result<(), LockError> {
        let old = state.current;
        let new = Self::create_object(streams, &self.desc, self.name.as_deref())?;
        if copy {
            let copied = (|| -> Result<(), LockError> {
                let (src, dst) = (buffer_object(streams, old)?, buffer_object(streams, new)?);
                src.invalidate(0, self.desc.size)?;
                // SAFETY: both objects are mapped, at least desc.size long
                // and distinct allocations.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.mapped(0)?.as_ptr(),
                        dst.mapped(0)?.as_ptr(),
                        self.desc.size as usize,
                    )
                };
                dst.flush(0, self.desc.size)
            })();
            if let Err(e) = copied {
                destroy_resource(streams, new);
                return Err(e);
            }
        }
        tracing::debug!("Replacing backing object of {:?}", self.name);
        destroy_resource(streams, old);
        state.current = new;
        Ok(())
    }

    fn check_range(&self, offset: vk::DeviceSize, len: vk::DeviceSize) -> Result<(), LockError> {
        if len == 0 {
            tracing::error!("Zero-length lock on buffer {:?}", self.name);
            return Err(LockError::Empty);
        }
        if offset.checked_add(len).is_none_or(|end| end > self.desc.size) {
            tracing::error!(
                "Lock range {offset}+{len} exceeds buffer {:?} of size {}",
                self.name,
                self.desc.size
            );
            return Err(LockError::OutOfRange {
                offset,
                len,
                size: self.desc.size,
            });
        }
        Ok(())
    }

    // Lock functionality

    /// Lock `[offset, offset + len)` for CPU access. Work needed to make
    /// the data visible is recorded on `queue`'s transfer batch.
    pub fn lock(
        &self,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
        kind: LockKind,
        queue: QueueId,
    ) -> Result<BufferLock<'_>, LockError> {
        self.check_range(offset, len)?;
        let mut state = self.state.lock().expect("buffer state lock poisoned");
        if state.locked {
            return Err(LockError::AlreadyLocked);
        }
        let mut streams = self.ctx.lock_streams();
        // Work that finished since the last submit must not count as busy.
        streams.refresh()?;

        let current = state.current;
        let facts = LockFacts::observe(
            &streams.tracker,
            current,
            self.desc.directly_mappable(),
            self.desc.supports_gpu_writes(),
        );
        let plan = plan_lock(facts, kind, offset, len);
        tracing::debug!("Locking {:?} {kind:?} {offset}+{len}: {plan:?}", self.name);

        let target = match plan {
            LockPlan::Direct(prep) => {
                match prep {
                    DirectPrep::None => {}
                    DirectPrep::Replace { copy } => {
                        self.replace_mapped(&mut streams, &mut state, copy)?
                    }
                    DirectPrep::Wait {
                        wait_reads,
                        barrier,
                        clone_if_bound,
                    } => {
                        let access = if wait_reads {
                            Access::READ | Access::WRITE
                        } else {
                            Access::WRITE
                        };
                        let mask = streams.tracker.use_mask(current, access);
                        let raw = buffer_object(&streams, current)?.handle();
                        {
                            let mut batch = streams.transfer(queue)?;
                            batch.append_mask(mask);
                            if barrier {
                                batch.memory_barrier(
                                    raw,
                                    vk::AccessFlags2::SHADER_WRITE,
                                    kind.host_access(),
                                    vk::PipelineStageFlags2::FRAGMENT_SHADER
                                        | vk::PipelineStageFlags2::COMPUTE_SHADER,
                                    vk::PipelineStageFlags2::HOST,
                                );
                            }
                        }
                        streams.flush_transfer(queue, true)?;
                        if clone_if_bound && streams.tracker.is_bound(current) {
                            self.replace_mapped(&mut streams, &mut state, true)?;
                        }
                    }
                }
                let object = buffer_object(&streams, state.current)?;
                if kind.reads() {
                    object.invalidate(offset, len)?;
                }
                LockTarget::Direct {
                    id: state.current,
                    ptr: object.mapped(offset)?,
                }
            }
            LockPlan::Scratch => LockTarget::Scratch(vec![0; len as usize]),
            LockPlan::Staging { read } => {
                let usage = if read {
                    MemoryUsage::GpuToCpu
                } else {
                    MemoryUsage::CpuToGpu
                };
                let staging = BufferObject::new(
                    &streams.device,
                    len,
                    vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                    usage,
                    Some("staging buffer"),
                )?;
                let staging_raw = staging.handle();
                let staging_id = streams.tracker.insert(NativeObject::Buffer(staging));
                let filled = (|| -> Result<NonNull<u8>, LockError> {
                    if read {
                        let write_mask = streams.tracker.use_mask(current, Access::WRITE);
                        let mut batch = streams.transfer(queue)?;
                        if facts.gpu_writes || !write_mask.is_empty() {
                            batch.append_mask(write_mask);
                        }
                        batch.recorder().copy_buffer(
                            current,
                            staging_id,
                            vk::BufferCopy {
                                src_offset: offset,
                                dst_offset: 0,
                                size: len,
                            },
                        )?;
                        batch.memory_barrier(
                            staging_raw,
                            vk::AccessFlags2::TRANSFER_WRITE,
                            kind.host_access(),
                            vk::PipelineStageFlags2::TRANSFER,
                            vk::PipelineStageFlags2::HOST,
                        );
                        streams.flush_transfer(queue, true)?;
                        buffer_object(&streams, staging_id)?.invalidate(0, len)?;
                    }
                    buffer_object(&streams, staging_id)?.mapped(0)
                })();
                match filled {
                    Ok(ptr) => LockTarget::Staging {
                        id: staging_id,
                        ptr,
                    },
                    Err(e) => {
                        destroy_resource(&mut streams, staging_id);
                        return Err(e);
                    }
                }
            }
        };

        state.locked = true;
        Ok(BufferLock {
            buffer: self,
            kind,
            offset,
            len,
            queue,
            target: Some(target),
        })
    }

    fn unlock_target(
        &self,
        target: LockTarget,
        kind: LockKind,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
        queue: QueueId,
    ) -> Result<(), LockError> {
        let mut state = self.state.lock().expect("buffer state lock poisoned");
        state.locked = false;
        let mut streams = self.ctx.lock_streams();

        // Host writes become visible to the device at submission; only
        // non-coherent memory needs an explicit flush.
        let staging_id = match &target {
            LockTarget::Direct { id, .. } => {
                if kind.writes() {
                    buffer_object(&streams, *id)?.flush(offset, len)?;
                }
                return Ok(());
            }
            LockTarget::Staging { id, .. } => Some(*id),
            LockTarget::Scratch(_) => None,
        };

        let result = (|| -> Result<(), LockError> {
            if !kind.writes() {
                return Ok(());
            }
            if let Some(id) = staging_id {
                buffer_object(&streams, id)?.flush(0, len)?;
            }

            let current = state.current;
            let facts = UnlockFacts::observe(
                &streams.tracker,
                current,
                offset == 0 && len == self.desc.size,
            );
            let plan = plan_unlock(facts, kind);
            tracing::debug!("Unlocking {:?} {kind:?}: {plan:?}", self.name);

            let use_mask = streams
                .tracker
                .use_mask(current, Access::READ | Access::WRITE);
            let destination = match plan {
                UnlockPlan::Copy { wait_on_use } => {
                    if wait_on_use {
                        streams.transfer(queue)?.append_mask(use_mask);
                    }
                    current
                }
                UnlockPlan::Recreate => {
                    let new = Self::create_object(&mut streams, &self.desc, self.name.as_deref())?;
                    destroy_resource(&mut streams, current);
                    new
                }
                UnlockPlan::Clone {
                    copy_old,
                    wait_on_use,
                } => {
                    let new = Self::create_object(&mut streams, &self.desc, self.name.as_deref())?;
                    let mut batch = streams.transfer(queue)?;
                    if wait_on_use {
                        batch.append_mask(use_mask);
                    }
                    if copy_old {
                        batch.recorder().copy_buffer(
                            current,
                            new,
                            vk::BufferCopy {
                                src_offset: 0,
                                dst_offset: 0,
                                size: self.desc.size,
                            },
                        )?;
                    }
                    destroy_resource(&mut streams, current);
                    new
                }
            };
            state.current = destination;

            let mut batch = streams.transfer(queue)?;
            match &target {
                LockTarget::Staging { id, .. } => batch.recorder().copy_buffer(
                    *id,
                    destination,
                    vk::BufferCopy {
                        src_offset: 0,
                        dst_offset: offset,
                        size: len,
                    },
                )?,
                LockTarget::Scratch(data) => {
                    batch.recorder().update_buffer(destination, offset, data)?
                }
                LockTarget::Direct { .. } => {}
            }
            Ok(())
        })();

        if let Some(id) = staging_id {
            destroy_resource(&mut streams, id);
        }
        result
    }

    // Convenience functionality

    /// Copy `dst.len()` bytes starting at `offset` into `dst`.
    pub fn read(&self, offset: vk::DeviceSize, dst: &mut [u8]) -> Result<(), LockError> {
        let lock = self.lock(
            offset,
            dst.len() as vk::DeviceSize,
            LockKind::ReadOnly,
            QueueId::primary(QueueType::Graphics),
        )?;
        dst.copy_from_slice(&lock);
        lock.unlock()
    }

    pub fn write(&self, offset: vk::DeviceSize, src: &[u8], mode: WriteMode) -> Result<(), LockError> {
        let mut lock = self.lock(
            offset,
            src.len() as vk::DeviceSize,
            mode.lock_kind(),
            QueueId::primary(QueueType::Graphics),
        )?;
        lock.copy_from_slice(src);
        lock.unlock()
    }

    pub fn write_pod<T: Pod>(
        &self,
        offset: vk::DeviceSize,
        data: &[T],
        mode: WriteMode,
    ) -> Result<(), LockError> {
        self.write(offset, bytemuck::cast_slice(data), mode)
    }

    /// Record a copy of `len` bytes from `src` into this buffer.
    pub fn copy_from(
        &self,
        cb: &mut CommandBuffer,
        src: &GpuBuffer,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> Result<(), CopyBufferError> {
        let in_bounds = |offset: vk::DeviceSize, size: vk::DeviceSize| {
            offset.checked_add(len).is_some_and(|end| end <= size)
        };
        if !in_bounds(src_offset, src.size()) || !in_bounds(dst_offset, self.size()) {
            tracing::error!("Buffer copy of {len} bytes out of bounds");
            return Err(CopyBufferError::RegionOutOfBounds {
                src_size: src.size(),
                src_offset,
                dst_size: self.size(),
                dst_offset,
                len,
            });
        }
        let (src_id, dst_id) = (src.current_id(), self.current_id());
        cb.record_transfer(|rec| {
            rec.copy_buffer(
                src_id,
                dst_id,
                vk::BufferCopy {
                    src_offset,
                    dst_offset,
                    size: len,
                },
            )
        })?;
        Ok(())
    }

    /// Reference the current backing object from `cb`. Returns the native
    /// handle to bind.
    pub fn bind(&self, cb: &mut CommandBuffer, access: Access) -> Result<vk::Buffer, RecordError> {
        let id = self.current_id();
        cb.record(|rec| {
            let raw = rec.buffer(id)?;
            rec.register(id, access);
            Ok(raw)
        })
    }

    /// A texel view in the buffer's element format, shared with other
    /// holders until released.
    pub fn acquire_view(&self) -> Result<vk::BufferView, vk::Result> {
        let id = self.current_id();
        let mut streams = self.ctx.lock_streams();
        match streams.tracker.get_mut(id) {
            Some(NativeObject::Buffer(buffer)) => buffer.acquire_view(self.desc.format),
            _ => Err(vk::Result::ERROR_UNKNOWN),
        }
    }

    pub fn release_view(&self, view: vk::BufferView) {
        let id = self.current_id();
        let mut streams = self.ctx.lock_streams();
        if let Some(NativeObject::Buffer(buffer)) = streams.tracker.get_mut(id) {
            buffer.release_view(view);
            if !streams.tracker.is_bound(id)
                && let Some(NativeObject::Buffer(buffer)) = streams.tracker.get_mut(id)
            {
                buffer.destroy_unused_views();
            }
        }
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        let current = self
            .state
            .get_mut()
            .map_or_else(|poisoned| poisoned.into_inner().current, |state| state.current);
        destroy_resource(&mut self.ctx.lock_streams(), current);
    }
}

// ---------------------------------------------------------------------------
// BufferLock
// ---------------------------------------------------------------------------

/// Where the bytes of an active lock live.
#[derive(Debug)]
pub(crate) enum LockTarget {
    Direct { id: ResourceId, ptr: NonNull<u8> },
    Staging { id: ResourceId, ptr: NonNull<u8> },
    Scratch(Vec<u8>),
}

/// CPU access to a locked range. Dereferences to the locked bytes.
///
/// Call [`unlock`](Self::unlock) to observe errors; dropping the guard
/// unlocks too but can only log them.
#[derive(Debug)]
pub struct BufferLock<'a> {
    buffer: &'a GpuBuffer,
    kind: LockKind,
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
    queue: QueueId,
    target: Option<LockTarget>,
}

impl BufferLock<'_> {
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn unlock(mut self) -> Result<(), LockError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), LockError> {
        match self.target.take() {
            Some(target) => {
                self.buffer
                    .unlock_target(target, self.kind, self.offset, self.len, self.queue)
            }
            None => Ok(()),
        }
    }
}

impl std::ops::Deref for BufferLock<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.target {
            Some(LockTarget::Direct { ptr, .. } | LockTarget::Staging { ptr, .. }) => {
                // SAFETY: ptr addresses len mapped bytes kept alive by the
                // tracked object until unlock.
                unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len as usize) }
            }
            Some(LockTarget::Scratch(data)) => data,
            None => &[],
        }
    }
}

impl std::ops::DerefMut for BufferLock<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len as usize;
        match &mut self.target {
            Some(LockTarget::Direct { ptr, .. } | LockTarget::Staging { ptr, .. }) => {
                // SAFETY: as in deref; the guard is borrowed mutably so the
                // slice is unique.
                unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) }
            }
            Some(LockTarget::Scratch(data)) => data,
            None => &mut [],
        }
    }
}

impl Drop for BufferLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::error!("Failed to unlock buffer: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facts(mappable: bool, in_use: bool, bound: bool) -> LockFacts {
        LockFacts {
            mappable,
            gpu_writes: false,
            in_use,
            bound,
        }
    }

    #[test]
    fn no_overwrite_maps_even_when_busy() {
        let plan = plan_lock(facts(true, true, true), LockKind::WriteOnlyNoOverwrite, 0, 16);
        assert_eq!(plan, LockPlan::Direct(DirectPrep::None));
    }

    #[test]
    fn idle_mappable_buffer_maps_directly() {
        for kind in [LockKind::ReadOnly, LockKind::ReadWrite, LockKind::WriteOnlyDiscardRange] {
            let plan = plan_lock(facts(true, false, false), kind, 0, 16);
            assert_eq!(plan, LockPlan::Direct(DirectPrep::None), "{kind:?}");
        }
    }

    #[test]
    fn bound_but_idle_buffer_is_cloned() {
        let plan = plan_lock(facts(true, false, true), LockKind::ReadWrite, 0, 16);
        assert_eq!(plan, LockPlan::Direct(DirectPrep::Replace { copy: true }));
        let plan = plan_lock(facts(true, false, true), LockKind::WriteOnlyDiscard, 0, 16);
        assert_eq!(plan, LockPlan::Direct(DirectPrep::Replace { copy: false }));
    }

    #[test]
    fn busy_discard_recreates() {
        let plan = plan_lock(facts(true, true, true), LockKind::WriteOnlyDiscard, 0, 256);
        assert_eq!(plan, LockPlan::Direct(DirectPrep::Replace { copy: false }));
    }

    #[test]
    fn busy_reads_wait() {
        let plan = plan_lock(facts(true, true, false), LockKind::ReadOnly, 0, 16);
        assert_eq!(
            plan,
            LockPlan::Direct(DirectPrep::Wait {
                wait_reads: false,
                barrier: false,
                clone_if_bound: false
            })
        );
        let plan = plan_lock(facts(true, true, false), LockKind::ReadWrite, 0, 16);
        assert!(matches!(
            plan,
            LockPlan::Direct(DirectPrep::Wait {
                wait_reads: true,
                clone_if_bound: true,
                ..
            })
        ));
    }

    #[test]
    fn gpu_writable_buffers_count_as_used() {
        let facts = LockFacts {
            mappable: true,
            gpu_writes: true,
            in_use: false,
            bound: false,
        };
        let plan = plan_lock(facts, LockKind::ReadOnly, 0, 16);
        assert!(matches!(
            plan,
            LockPlan::Direct(DirectPrep::Wait { barrier: true, .. })
        ));
    }

    #[test]
    fn busy_write_only_range_falls_through_to_staging() {
        let plan = plan_lock(facts(true, true, false), LockKind::WriteOnlyDiscardRange, 4, 64);
        assert_eq!(plan, LockPlan::Scratch);
        let plan = plan_lock(
            facts(true, true, false),
            LockKind::WriteOnlyDiscardRange,
            0,
            SCRATCH_LIMIT + 4,
        );
        assert_eq!(plan, LockPlan::Staging { read: false });
    }

    #[test]
    fn scratch_needs_alignment_and_no_read() {
        let device_local = facts(false, false, false);
        assert_eq!(
            plan_lock(device_local, LockKind::WriteOnlyDiscard, 0, 64),
            LockPlan::Scratch
        );
        assert_eq!(
            plan_lock(device_local, LockKind::WriteOnlyDiscardRange, 2, 64),
            LockPlan::Staging { read: false }
        );
        assert_eq!(
            plan_lock(device_local, LockKind::WriteOnlyDiscardRange, 0, 6),
            LockPlan::Staging { read: false }
        );
        assert_eq!(
            plan_lock(device_local, LockKind::WriteOnlyNoOverwrite, 0, 64),
            LockPlan::Staging { read: true }
        );
        assert_eq!(
            plan_lock(device_local, LockKind::ReadOnly, 0, 64),
            LockPlan::Staging { read: true }
        );
    }

    fn unlock_facts(in_use: bool, bound_without_use: bool, covers_whole: bool) -> UnlockFacts {
        UnlockFacts {
            in_use,
            bound_without_use,
            covers_whole,
        }
    }

    #[test]
    fn unlock_idle_buffer_copies_in_place() {
        let plan = plan_unlock(unlock_facts(false, false, false), LockKind::ReadWrite);
        assert_eq!(plan, UnlockPlan::Copy { wait_on_use: false });
    }

    #[test]
    fn unlock_busy_buffer_special_cases() {
        let busy = unlock_facts(true, true, false);
        assert_eq!(
            plan_unlock(busy, LockKind::WriteOnlyNoOverwrite),
            UnlockPlan::Copy { wait_on_use: false }
        );
        assert_eq!(
            plan_unlock(busy, LockKind::WriteOnlyDiscard),
            UnlockPlan::Recreate
        );
        assert_eq!(
            plan_unlock(busy, LockKind::WriteOnlyDiscardRange),
            UnlockPlan::Clone {
                copy_old: true,
                wait_on_use: true
            }
        );
    }

    #[test]
    fn unlock_queued_buffer_clones_and_skips_copy_when_covered() {
        assert_eq!(
            plan_unlock(unlock_facts(false, true, true), LockKind::ReadWrite),
            UnlockPlan::Clone {
                copy_old: false,
                wait_on_use: false
            }
        );
        assert_eq!(
            plan_unlock(unlock_facts(false, true, false), LockKind::ReadWrite),
            UnlockPlan::Clone {
                copy_old: true,
                wait_on_use: false
            }
        );
    }

    #[test]
    fn discard_under_a_queued_read_swaps_and_retires_the_old_object() {
        use crate::tracker::Release;

        let desc = BufferDesc::new(BufferKind::Uniform, 64, BufferUsage::DYNAMIC);
        let gfx = QueueId::primary(QueueType::Graphics);
        let mut tracker = ResourceTracker::new();
        let old = tracker.insert("old contents");
        // A submitted copy still reads the current object.
        tracker.notify_bound(old);
        tracker.notify_used(old, gfx, Access::READ);

        let facts = LockFacts::observe(&tracker, old, desc.directly_mappable(), false);
        assert!(facts.in_use && facts.bound);
        assert_eq!(
            plan_lock(facts, LockKind::WriteOnlyDiscard, 0, 64),
            LockPlan::Direct(DirectPrep::Replace { copy: false })
        );

        let new = tracker.insert("new contents");
        assert!(matches!(tracker.destroy(old), Disposal::Deferred));
        assert_eq!(tracker.get(old), Some(&"old contents"));

        let released = tracker.retire(gfx, [(old, Access::READ)]);
        assert!(matches!(released[0].1, Release::Freed("old contents")));
        assert!(!tracker.contains(old));

        let facts = LockFacts::observe(&tracker, new, desc.directly_mappable(), false);
        assert_eq!(
            plan_lock(facts, LockKind::WriteOnlyDiscard, 0, 64),
            LockPlan::Direct(DirectPrep::None)
        );
    }

    #[test]
    fn retired_work_lets_discard_map_in_place() {
        let gfx = QueueId::primary(QueueType::Graphics);
        let mut tracker = ResourceTracker::new();
        let id = tracker.insert(());
        tracker.notify_bound(id);
        tracker.notify_used(id, gfx, Access::READ);
        let plan = |tracker: &ResourceTracker<()>| {
            let facts = LockFacts::observe(tracker, id, true, false);
            plan_lock(facts, LockKind::WriteOnlyDiscardRange, 0, 16)
        };
        assert_eq!(plan(&tracker), LockPlan::Scratch);

        let _ = tracker.retire(gfx, [(id, Access::READ)]);
        assert_eq!(plan(&tracker), LockPlan::Direct(DirectPrep::None));
    }

    #[test]
    fn unlock_facts_separate_queued_from_executing() {
        let gfx = QueueId::primary(QueueType::Graphics);
        let mut tracker = ResourceTracker::new();
        let id = tracker.insert(());
        tracker.notify_bound(id);
        let facts = UnlockFacts::observe(&tracker, id, true);
        assert!(!facts.in_use && facts.bound_without_use);

        tracker.notify_used(id, gfx, Access::WRITE);
        let facts = UnlockFacts::observe(&tracker, id, true);
        assert!(facts.in_use && !facts.bound_without_use);
    }

    #[test]
    fn usage_flags_per_kind() {
        use vk::BufferUsageFlags as U;
        let transfer = U::TRANSFER_SRC | U::TRANSFER_DST;
        let desc = BufferDesc::new(BufferKind::Uniform, 64, BufferUsage::DYNAMIC);
        assert_eq!(desc.vk_usage(), U::UNIFORM_BUFFER | transfer);
        assert!(desc.directly_mappable());
        assert!(!desc.supports_gpu_writes());

        let desc = BufferDesc::new(BufferKind::Generic, 64, BufferUsage::LOAD_STORE);
        assert_eq!(
            desc.vk_usage(),
            U::UNIFORM_TEXEL_BUFFER | U::STORAGE_TEXEL_BUFFER | transfer
        );
        assert!(desc.supports_gpu_writes());

        let desc = BufferDesc::new(BufferKind::Structured, 64, BufferUsage::empty());
        assert_eq!(desc.vk_usage(), U::STORAGE_BUFFER | transfer);
        assert!(desc.supports_gpu_writes());

        let desc = BufferDesc::new(BufferKind::Vertex, 64, BufferUsage::empty());
        assert_eq!(desc.vk_usage(), U::VERTEX_BUFFER | transfer);
    }

    #[test]
    fn write_modes_map_to_lock_kinds() {
        assert_eq!(WriteMode::Normal.lock_kind(), LockKind::WriteOnlyDiscardRange);
        assert_eq!(WriteMode::Discard.lock_kind(), LockKind::WriteOnlyDiscard);
        assert_eq!(
            WriteMode::NoOverwrite.lock_kind(),
            LockKind::WriteOnlyNoOverwrite
        );
    }
}
