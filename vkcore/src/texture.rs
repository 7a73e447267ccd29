//! Textures and the image memory manager.
//!
//! Images are tracked per subresource: every (mip, layer) pair has its own
//! tracker entry, so use counts and layouts are known per subresource.
//! CPU access follows the same plan as buffers, see [`crate::buffer`],
//! except that there is no scratch path and direct mapping is limited to
//! linearly tiled single-subresource images.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use ash::vk;
use bitflags::bitflags;
use gpu_allocator::AllocationError;
use thiserror::Error;

use crate::barrier::{self, ImageUsageClass};
use crate::buffer::{
    self, BufferObject, DirectPrep, LockError, LockFacts, LockKind, LockPlan, LockTarget,
    UnlockFacts, UnlockPlan, destroy_resource, plan_lock, plan_unlock,
};
use crate::command::{CommandBuffer, RecordError};
use crate::context::{GpuContext, NativeObject, Streams};
use crate::device::Device;
use crate::mapping;
use crate::memory::{self, DeviceAllocation, MemoryUsage};
use crate::queue::{QueueId, QueueType};
use crate::subresource::SubresourceRange;
use crate::tracker::{Access, ResourceId, ResourceTracker};
use crate::transfer::TransferBatch;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateTextureError {
    #[error("Vulkan error creating image: {0}")]
    CreateImage(vk::Result),

    #[error("GPU allocator error allocating memory: {0}")]
    AllocateMemory(AllocationError),

    #[error("Vulkan error binding image memory: {0}")]
    BindMemory(vk::Result),

    #[error("Invalid texture description: {0}")]
    InvalidDesc(&'static str),
}

#[derive(Debug, Error)]
pub enum CopyTextureError {
    #[error("Texture copy/resolve isn't supported for depth-stencil textures")]
    DepthStencil,
    #[error("Multisample counts must match when copying ({src:?} vs {dst:?})")]
    SampleCountMismatch {
        src: vk::SampleCountFlags,
        dst: vk::SampleCountFlags,
    },
    #[error("Subresource (mip {mip}, face {face}) does not exist")]
    InvalidSubresource { mip: u32, face: u32 },
    #[error("Failed to record copy: {0}")]
    Record(#[from] RecordError),
}

// ---------------------------------------------------------------------------
// Descriptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureKind {
    D1,
    D2,
    D3,
    Cube,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TextureUsage: u8 {
        const RENDER_TARGET = 1;
        const DEPTH_STENCIL = 1 << 1;
        const LOAD_STORE = 1 << 2;
        /// Updated often from the CPU. Eligible for direct mapping.
        const DYNAMIC = 1 << 3;
        const MUTABLE_FORMAT = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub kind: TextureKind,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    /// Array layers. Cube maps use six per cube.
    pub layers: u32,
    pub samples: vk::SampleCountFlags,
    pub usage: TextureUsage,
}

impl TextureDesc {
    pub fn new_2d(format: vk::Format, width: u32, height: u32, usage: TextureUsage) -> Self {
        Self {
            kind: TextureKind::D2,
            format,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            layers: 1,
            samples: vk::SampleCountFlags::TYPE_1,
            usage,
        }
    }

    pub fn new_cube(format: vk::Format, size: u32, usage: TextureUsage) -> Self {
        Self {
            kind: TextureKind::Cube,
            layers: 6,
            ..Self::new_2d(format, size, size, usage)
        }
    }

    pub fn with_mips(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    /// Extent of mip 0. Zero-sized dimensions are clamped to 1.
    pub fn extent(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.width.max(1),
            height: self.height.max(1),
            depth: self.depth.max(1),
        }
    }

    pub fn mip_extent(&self, mip: u32) -> vk::Extent3D {
        let extent = self.extent();
        vk::Extent3D {
            width: (extent.width >> mip).max(1),
            height: (extent.height >> mip).max(1),
            depth: (extent.depth >> mip).max(1),
        }
    }

    pub fn mip_count(&self) -> u32 {
        self.mip_levels.max(1)
    }

    pub fn layer_count(&self) -> u32 {
        self.layers.max(1)
    }

    pub fn whole_range(&self) -> SubresourceRange {
        SubresourceRange::whole(self.mip_count(), self.layer_count())
    }

    pub fn is_multisampled(&self) -> bool {
        self.samples != vk::SampleCountFlags::TYPE_1 && !self.samples.is_empty()
    }

    pub fn supports_gpu_writes(&self) -> bool {
        self.usage.intersects(
            TextureUsage::RENDER_TARGET | TextureUsage::DEPTH_STENCIL | TextureUsage::LOAD_STORE,
        )
    }

    /// Linear tiling and host-visible memory. Only for 2D, single-sample,
    /// single-subresource dynamic textures the GPU never writes.
    pub fn directly_mappable(&self) -> bool {
        self.usage.contains(TextureUsage::DYNAMIC)
            && self.kind == TextureKind::D2
            && !self.is_multisampled()
            && self.mip_count() == 1
            && self.layer_count() == 1
            && !self.supports_gpu_writes()
    }

    pub fn vk_usage(&self) -> vk::ImageUsageFlags {
        use vk::ImageUsageFlags as U;
        let mut usage = U::SAMPLED | U::TRANSFER_SRC | U::TRANSFER_DST;
        if self.usage.contains(TextureUsage::RENDER_TARGET) {
            usage |= U::COLOR_ATTACHMENT;
        } else if self.usage.contains(TextureUsage::DEPTH_STENCIL) {
            usage |= U::DEPTH_STENCIL_ATTACHMENT;
        }
        if self.usage.contains(TextureUsage::LOAD_STORE) {
            usage |= U::STORAGE;
        }
        usage
    }

    pub fn usage_class(&self) -> ImageUsageClass {
        ImageUsageClass {
            load_store: self.usage.contains(TextureUsage::LOAD_STORE),
            render_target: self.usage.contains(TextureUsage::RENDER_TARGET),
            depth_stencil: self.usage.contains(TextureUsage::DEPTH_STENCIL),
            dynamic: self.usage.contains(TextureUsage::DYNAMIC),
        }
    }

    fn validate(&self) -> Result<(), CreateTextureError> {
        match self.kind {
            TextureKind::Cube if self.layer_count() % 6 != 0 => Err(
                CreateTextureError::InvalidDesc("cube textures need a multiple of six layers"),
            ),
            TextureKind::Cube if self.width != self.height => {
                Err(CreateTextureError::InvalidDesc("cube faces must be square"))
            }
            TextureKind::D3 if self.layer_count() != 1 => {
                Err(CreateTextureError::InvalidDesc("3D texture arrays are not supported"))
            }
            _ => Ok(()),
        }
    }

    fn image_type(&self) -> vk::ImageType {
        match self.kind {
            TextureKind::D1 => vk::ImageType::TYPE_1D,
            TextureKind::D2 | TextureKind::Cube => vk::ImageType::TYPE_2D,
            TextureKind::D3 => vk::ImageType::TYPE_3D,
        }
    }

    fn create_flags(&self) -> vk::ImageCreateFlags {
        let mut flags = vk::ImageCreateFlags::empty();
        if self.kind == TextureKind::Cube {
            flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }
        if self.usage.contains(TextureUsage::MUTABLE_FORMAT) {
            flags |= vk::ImageCreateFlags::MUTABLE_FORMAT;
        }
        flags
    }

    fn view_type(&self, range: SubresourceRange) -> vk::ImageViewType {
        match (self.kind, range.layer_count) {
            (TextureKind::D1, 1) => vk::ImageViewType::TYPE_1D,
            (TextureKind::D1, _) => vk::ImageViewType::TYPE_1D_ARRAY,
            (TextureKind::D3, _) => vk::ImageViewType::TYPE_3D,
            (TextureKind::Cube, 6) => vk::ImageViewType::CUBE,
            (TextureKind::Cube, n) if n % 6 == 0 => vk::ImageViewType::CUBE_ARRAY,
            (_, 1) => vk::ImageViewType::TYPE_2D,
            _ => vk::ImageViewType::TYPE_2D_ARRAY,
        }
    }

    /// Layout the copy commands use for this texture.
    fn transfer_layout(&self, src: bool) -> vk::ImageLayout {
        if self.directly_mappable() {
            vk::ImageLayout::GENERAL
        } else if src {
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        } else {
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        }
    }
}

/// Aspect copied between images and buffers. Depth-stencil formats copy
/// their depth plane.
fn copy_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    let aspect = barrier::aspect_flags(format);
    if aspect.contains(vk::ImageAspectFlags::DEPTH) {
        vk::ImageAspectFlags::DEPTH
    } else {
        aspect
    }
}

/// Memory layout of one locked subresource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelLayout {
    pub extent: vk::Extent3D,
    pub texel_size: u32,
    pub row_pitch: vk::DeviceSize,
    pub slice_pitch: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

impl PixelLayout {
    /// Rows and slices packed without padding.
    pub fn packed(extent: vk::Extent3D, texel_size: u32) -> Self {
        let row_pitch = extent.width as vk::DeviceSize * texel_size as vk::DeviceSize;
        let slice_pitch = row_pitch * extent.height as vk::DeviceSize;
        Self {
            extent,
            texel_size,
            row_pitch,
            slice_pitch,
            size: slice_pitch * extent.depth as vk::DeviceSize,
        }
    }

    fn packed_row(&self) -> usize {
        self.extent.width as usize * self.texel_size as usize
    }

    /// Byte offset of each row, in row-major order over (slice, row).
    fn rows(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.extent.depth as usize).flat_map(move |z| {
            (0..self.extent.height as usize)
                .map(move |y| z * self.slice_pitch as usize + y * self.row_pitch as usize)
        })
    }
}

// ---------------------------------------------------------------------------
// ImageObject
// ---------------------------------------------------------------------------

/// A native image plus its memory and per-subresource state.
pub(crate) struct ImageObject {
    parent: Arc<Device>,
    handle: vk::Image,
    allocation: Option<DeviceAllocation>,
    memory_size: vk::DeviceSize,
    desc: TextureDesc,
    aspect: vk::ImageAspectFlags,
    usage: ImageUsageClass,
    layouts: Vec<vk::ImageLayout>,
    subresources: Vec<ResourceId>,
    views: HashMap<SubresourceRange, vk::ImageView>,
}

impl std::fmt::Debug for ImageObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageObject")
            .field("handle", &self.handle)
            .field("format", &self.desc.format)
            .field("views", &self.views.len())
            .finish_non_exhaustive()
    }
}

impl ImageObject {
    fn new(
        device: &Arc<Device>,
        desc: &TextureDesc,
        subresources: Vec<ResourceId>,
        name: Option<&str>,
    ) -> Result<Self, CreateTextureError> {
        desc.validate()?;
        let linear = desc.directly_mappable();
        let (tiling, initial_layout, memory_usage) = if linear {
            (
                vk::ImageTiling::LINEAR,
                vk::ImageLayout::PREINITIALIZED,
                MemoryUsage::CpuToGpu,
            )
        } else {
            (
                vk::ImageTiling::OPTIMAL,
                vk::ImageLayout::UNDEFINED,
                MemoryUsage::GpuOnly,
            )
        };
        let (sharing_mode, families) = device.sharing_mode();
        let create_info = vk::ImageCreateInfo::default()
            .flags(desc.create_flags())
            .image_type(desc.image_type())
            .format(desc.format)
            .extent(desc.extent())
            .mip_levels(desc.mip_count())
            .array_layers(desc.layer_count())
            .samples(desc.samples)
            .tiling(tiling)
            .usage(desc.vk_usage())
            .sharing_mode(sharing_mode)
            .queue_family_indices(families)
            .initial_layout(initial_layout);

        // SAFETY: create_info is fully initialised and validated above.
        let handle =
            unsafe { device.create_raw_image(&create_info) }.map_err(CreateTextureError::CreateImage)?;
        device.name_or_warn(handle, name);

        // SAFETY: handle is a valid image created from this device.
        let reqs = unsafe { device.get_raw_image_memory_requirements(handle) };
        let allocation = device
            .allocator()
            .allocate(name.unwrap_or("texture"), reqs, memory_usage, linear)
            .map_err(|e| {
                // SAFETY: handle was created above and is not bound yet.
                unsafe { device.destroy_raw_image(handle) };
                CreateTextureError::AllocateMemory(e)
            })?;

        // SAFETY: handle and memory belong to this device; the allocation
        // honours the image's requirements.
        let bind_result = unsafe {
            device.bind_raw_image_memory(handle, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bind_result {
            if let Err(free_err) = device.allocator().free(allocation) {
                tracing::error!("Failed to free GPU allocation: {free_err}");
            }
            // SAFETY: handle is owned by this scope.
            unsafe { device.destroy_raw_image(handle) };
            return Err(CreateTextureError::BindMemory(e));
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            allocation: Some(allocation),
            memory_size: reqs.size,
            desc: *desc,
            aspect: barrier::aspect_flags(desc.format),
            usage: desc.usage_class(),
            layouts: vec![initial_layout; subresources.len()],
            subresources,
            views: HashMap::new(),
        })
    }

    pub(crate) fn handle(&self) -> vk::Image {
        self.handle
    }

    pub(crate) fn aspect(&self) -> vk::ImageAspectFlags {
        self.aspect
    }

    pub(crate) fn usage(&self) -> ImageUsageClass {
        self.usage
    }

    fn index(&self, mip: u32, layer: u32) -> usize {
        (mip * self.desc.layer_count() + layer) as usize
    }

    pub(crate) fn subresource_id(&self, mip: u32, layer: u32) -> ResourceId {
        self.subresources[self.index(mip, layer)]
    }

    pub(crate) fn layout(&self, mip: u32, layer: u32) -> vk::ImageLayout {
        self.layouts[self.index(mip, layer)]
    }

    pub(crate) fn set_layout(&mut self, range: SubresourceRange, layout: vk::ImageLayout) {
        for (mip, layer) in range.iter() {
            let index = self.index(mip, layer);
            self.layouts[index] = layout;
        }
    }

    /// A view of `range`, created on first request and kept until the
    /// image is destroyed.
    pub(crate) fn view(&mut self, range: SubresourceRange) -> Result<vk::ImageView, vk::Result> {
        if let Some(&view) = self.views.get(&range) {
            return Ok(view);
        }
        let create_info = vk::ImageViewCreateInfo::default()
            .image(self.handle)
            .view_type(self.desc.view_type(range))
            .format(self.desc.format)
            .subresource_range(range.to_vk(self.aspect));
        // SAFETY: range lies within the image created from parent.
        let view = unsafe { self.parent.create_raw_image_view(&create_info) }?;
        self.views.insert(range, view);
        Ok(view)
    }

    fn allocation(&self) -> Result<&DeviceAllocation, LockError> {
        self.allocation.as_ref().ok_or(LockError::NotMapped)
    }

    fn base_ptr(&self) -> Result<NonNull<u8>, LockError> {
        self.allocation()?.mapped_ptr().ok_or(LockError::NotMapped)
    }

    /// Pointer and pitches of a subresource of a linear image.
    fn map_subresource(
        &self,
        mip: u32,
        layer: u32,
        texel_size: u32,
    ) -> Result<(NonNull<u8>, vk::DeviceSize, PixelLayout), LockError> {
        let subresource = vk::ImageSubresource {
            aspect_mask: self.aspect,
            mip_level: mip,
            array_layer: layer,
        };
        // SAFETY: only linear images are mapped directly.
        let layout = unsafe {
            self.parent
                .get_raw_image_subresource_layout(self.handle, subresource)
        };
        let extent = self.desc.mip_extent(mip);
        let slice_pitch = if layout.depth_pitch == 0 {
            layout.row_pitch * extent.height as vk::DeviceSize
        } else {
            layout.depth_pitch
        };
        // SAFETY: the driver reports offsets inside the image's memory.
        let ptr = unsafe { self.base_ptr()?.add(layout.offset as usize) };
        Ok((
            ptr,
            layout.offset,
            PixelLayout {
                extent,
                texel_size,
                row_pitch: layout.row_pitch,
                slice_pitch,
                size: layout.size,
            },
        ))
    }

    fn flush(&self, offset: vk::DeviceSize, len: vk::DeviceSize) -> Result<(), LockError> {
        memory::flush_mapped(&self.parent, self.allocation()?, offset, len)
            .map_err(LockError::MappedMemory)
    }

    fn invalidate(&self, offset: vk::DeviceSize, len: vk::DeviceSize) -> Result<(), LockError> {
        memory::invalidate_mapped(&self.parent, self.allocation()?, offset, len)
            .map_err(LockError::MappedMemory)
    }
}

impl Drop for ImageObject {
    fn drop(&mut self) {
        tracing::debug!("Dropping image {:?}", self.handle);
        for view in self.views.values() {
            // SAFETY: the tracker only drops idle objects.
            unsafe { self.parent.destroy_raw_image_view(*view) };
        }
        // SAFETY: every view is gone and no pending work references the
        // image.
        unsafe { self.parent.destroy_raw_image(self.handle) };
        if let Some(allocation) = self.allocation.take()
            && let Err(e) = self.parent.allocator().free(allocation)
        {
            tracing::error!("Failed to free GPU allocation: {e}");
        }
    }
}

fn image_object(tracker: &ResourceTracker<NativeObject>, id: ResourceId) -> Result<&ImageObject, RecordError> {
    match tracker.get(id) {
        Some(NativeObject::Image(image)) => Ok(image),
        _ => Err(RecordError::MissingResource(id)),
    }
}

/// Create an image plus one tracker entry per subresource.
fn create_image(
    streams: &mut Streams,
    desc: &TextureDesc,
    name: Option<&str>,
) -> Result<ResourceId, CreateTextureError> {
    let count = desc.mip_count() * desc.layer_count();
    let subresources: Vec<ResourceId> = (0..count)
        .map(|_| streams.tracker.insert(NativeObject::Subresource))
        .collect();
    match ImageObject::new(&streams.device, desc, subresources.clone(), name) {
        Ok(image) => Ok(streams.tracker.insert(NativeObject::Image(image))),
        Err(e) => {
            for id in subresources {
                destroy_resource(streams, id);
            }
            Err(e)
        }
    }
}

fn destroy_image(streams: &mut Streams, id: ResourceId) {
    let subresources = match streams.tracker.get(id) {
        Some(NativeObject::Image(image)) => image.subresources.clone(),
        _ => Vec::new(),
    };
    for sub in subresources {
        destroy_resource(streams, sub);
    }
    destroy_resource(streams, id);
}

/// Record a copy of every subresource of `src` into `dst` on the transfer
/// batch and leave `dst` in its optimal layout.
fn copy_whole_image(
    batch: &mut TransferBatch<'_>,
    desc: &TextureDesc,
    src: ResourceId,
    dst: ResourceId,
) -> Result<(), RecordError> {
    let whole = desc.whole_range();
    let (src_layout, dst_layout) = (desc.transfer_layout(true), desc.transfer_layout(false));
    batch.set_layout(src, whole, src_layout)?;
    batch.set_layout(dst, whole, dst_layout)?;

    let aspect = copy_aspect(desc.format);
    let layers = |mip| vk::ImageSubresourceLayers {
        aspect_mask: aspect,
        mip_level: mip,
        base_array_layer: 0,
        layer_count: desc.layer_count(),
    };
    let regions: Vec<vk::ImageCopy> = (0..desc.mip_count())
        .map(|mip| vk::ImageCopy {
            src_subresource: layers(mip),
            src_offset: vk::Offset3D::default(),
            dst_subresource: layers(mip),
            dst_offset: vk::Offset3D::default(),
            extent: desc.mip_extent(mip),
        })
        .collect();

    let rec = batch.recorder();
    let (src_raw, dst_raw) = (
        image_object(rec.tracker, src)?.handle(),
        image_object(rec.tracker, dst)?.handle(),
    );
    // SAFETY: both images are tracked and were just moved to the transfer
    // layouts named here.
    unsafe {
        rec.device
            .cmd_copy_image(rec.raw(), src_raw, src_layout, dst_raw, dst_layout, &regions)
    };
    rec.register(src, Access::READ);

    let optimal = desc.usage_class().optimal_layout();
    batch.set_layout(dst, whole, optimal)
}

// ---------------------------------------------------------------------------
// GpuTexture
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TextureState {
    current: ResourceId,
    locked: bool,
}

/// Region of a texture-to-texture copy. A zero `extent` copies the whole
/// source mip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextureCopy {
    pub src_mip: u32,
    pub src_face: u32,
    pub src_offset: vk::Offset3D,
    pub extent: vk::Extent3D,
    pub dst_mip: u32,
    pub dst_face: u32,
    pub dst_offset: vk::Offset3D,
}

/// A GPU texture whose backing image may be replaced transparently.
pub struct GpuTexture {
    ctx: Arc<GpuContext>,
    desc: TextureDesc,
    name: Option<String>,
    state: Mutex<TextureState>,
}

impl std::fmt::Debug for GpuTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuTexture")
            .field("desc", &self.desc)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl GpuTexture {
    pub fn new(
        ctx: &Arc<GpuContext>,
        desc: TextureDesc,
        name: Option<&str>,
    ) -> Result<Self, CreateTextureError> {
        let current = create_image(&mut ctx.lock_streams(), &desc, name)?;
        Ok(Self {
            ctx: Arc::clone(ctx),
            desc,
            name: name.map(str::to_owned),
            state: Mutex::new(TextureState {
                current,
                locked: false,
            }),
        })
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn has_stencil(&self) -> bool {
        barrier::aspect_flags(self.desc.format).contains(vk::ImageAspectFlags::STENCIL)
    }

    pub(crate) fn current_id(&self) -> ResourceId {
        self.state.lock().expect("texture state lock poisoned").current
    }

    fn check_subresource(&self, mip: u32, face: u32) -> Result<(), LockError> {
        if mip >= self.desc.mip_count() || face >= self.desc.layer_count() {
            tracing::error!(
                "Subresource (mip {mip}, face {face}) out of range for texture {:?}",
                self.name
            );
            return Err(LockError::InvalidSubresource { mip, face });
        }
        Ok(())
    }

    fn check_cpu_access(&self) -> Result<u32, LockError> {
        if self.desc.is_multisampled() {
            tracing::error!("Multisampled textures cannot be accessed from the CPU directly");
            return Err(LockError::Multisampled);
        }
        mapping::texel_size(self.desc.format).ok_or_else(|| {
            tracing::error!("No CPU access for format {:?}", self.desc.format);
            LockError::UnsupportedFormat(self.desc.format)
        })
    }

    fn subresource_of(
        &self,
        streams: &Streams,
        id: ResourceId,
        mip: u32,
        face: u32,
    ) -> Result<ResourceId, LockError> {
        Ok(image_object(&streams.tracker, id)?.subresource_id(mip, face))
    }

    /// Swap in a fresh image, copying the old memory on the CPU when
    /// `copy` is set. Only valid for directly mappable textures.
    fn replace_mapped(
        &self,
        streams: &mut Streams,
        state: &mut TextureState,
        copy: bool,
    ) -> Result<(), LockError> {
        let old = state.current;
        let new = create_image(streams, &self.desc, self.name.as_deref())?;
        if copy {
            let copied = (|| -> Result<(), LockError> {
                let src = image_object(&streams.tracker, old)?;
                let dst = image_object(&streams.tracker, new)?;
                let len = src.memory_size.min(dst.memory_size);
                src.invalidate(0, len)?;
                // SAFETY: both images are mapped, at least len bytes long
                // and distinct allocations.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        src.base_ptr()?.as_ptr(),
                        dst.base_ptr()?.as_ptr(),
                        len as usize,
                    )
                };
                dst.flush(0, len)
            })();
            if let Err(e) = copied {
                destroy_image(streams, new);
                return Err(e);
            }
        }
        tracing::debug!("Replacing backing image of {:?}", self.name);
        destroy_image(streams, old);
        state.current = new;
        Ok(())
    }

    // Lock functionality

    /// Lock one subresource for CPU access.
    pub fn lock(
        &self,
        kind: LockKind,
        mip: u32,
        face: u32,
        queue: QueueId,
    ) -> Result<TextureLock<'_>, LockError> {
        let texel_size = self.check_cpu_access()?;
        self.check_subresource(mip, face)?;
        let packed = PixelLayout::packed(self.desc.mip_extent(mip), texel_size);

        let mut state = self.state.lock().expect("texture state lock poisoned");
        if state.locked {
            return Err(LockError::AlreadyLocked);
        }
        let mut streams = self.ctx.lock_streams();
        streams.refresh()?;

        let sub = self.subresource_of(&streams, state.current, mip, face)?;
        let facts = LockFacts::observe(
            &streams.tracker,
            sub,
            self.desc.directly_mappable(),
            self.desc.supports_gpu_writes(),
        );
        let plan = match plan_lock(facts, kind, 0, packed.size) {
            LockPlan::Scratch => LockPlan::Staging { read: false },
            plan => plan,
        };
        tracing::debug!("Locking {:?} mip {mip} face {face} {kind:?}: {plan:?}", self.name);

        let (target, layout, map_offset) = match plan {
            LockPlan::Direct(prep) => {
                match prep {
                    DirectPrep::None => {}
                    DirectPrep::Replace { copy } => {
                        self.replace_mapped(&mut streams, &mut state, copy)?
                    }
                    DirectPrep::Wait {
                        wait_reads,
                        clone_if_bound,
                        ..
                    } => {
                        let access = if wait_reads {
                            Access::READ | Access::WRITE
                        } else {
                            Access::WRITE
                        };
                        let mask = streams.tracker.use_mask(sub, access);
                        streams.transfer(queue)?.append_mask(mask);
                        streams.flush_transfer(queue, true)?;
                        if clone_if_bound && streams.tracker.is_bound(sub) {
                            self.replace_mapped(&mut streams, &mut state, true)?;
                        }
                    }
                }
                let image = image_object(&streams.tracker, state.current)?;
                let (ptr, offset, layout) = image.map_subresource(mip, face, texel_size)?;
                if kind.reads() {
                    image.invalidate(offset, layout.size)?;
                }
                (
                    LockTarget::Direct {
                        id: state.current,
                        ptr,
                    },
                    layout,
                    offset,
                )
            }
            LockPlan::Scratch | LockPlan::Staging { .. } => {
                let read = matches!(plan, LockPlan::Staging { read: true });
                let id = self.stage(&mut streams, state.current, kind, mip, face, packed, read, queue)?;
                let ptr = match buffer::buffer_object(&streams, id).and_then(|b| b.mapped(0)) {
                    Ok(ptr) => ptr,
                    Err(e) => {
                        destroy_resource(&mut streams, id);
                        return Err(e);
                    }
                };
                (LockTarget::Staging { id, ptr }, packed, 0)
            }
        };

        state.locked = true;
        Ok(TextureLock {
            texture: self,
            kind,
            mip,
            face,
            queue,
            layout,
            map_offset,
            target: Some(target),
        })
    }

    /// Create a staging buffer for one subresource, filling it from the
    /// image when `read` is set.
    #[allow(clippy::too_many_arguments)]
    fn stage(
        &self,
        streams: &mut Streams,
        image: ResourceId,
        kind: LockKind,
        mip: u32,
        face: u32,
        layout: PixelLayout,
        read: bool,
        queue: QueueId,
    ) -> Result<ResourceId, LockError> {
        let usage = if read {
            MemoryUsage::GpuToCpu
        } else {
            MemoryUsage::CpuToGpu
        };
        let staging = BufferObject::new(
            &streams.device,
            layout.size,
            vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            usage,
            Some("texture staging buffer"),
        )?;
        let staging_raw = staging.handle();
        let staging_id = streams.tracker.insert(NativeObject::Buffer(staging));
        if !read {
            return Ok(staging_id);
        }

        let filled = (|| -> Result<(), LockError> {
            let range = SubresourceRange::single(mip, face);
            let sub = self.subresource_of(streams, image, mip, face)?;
            let write_mask = streams.tracker.use_mask(sub, Access::WRITE);
            let mut batch = streams.transfer(queue)?;
            if self.desc.supports_gpu_writes() || !write_mask.is_empty() {
                batch.append_mask(write_mask);
            }
            let src_layout = self.desc.transfer_layout(true);
            batch.set_layout(image, range, src_layout)?;
            {
                let rec = batch.recorder();
                let raw = image_object(rec.tracker, image)?.handle();
                let region = self.buffer_image_copy(mip, face);
                // SAFETY: the subresource was just moved to src_layout and
                // the staging buffer holds the whole packed subresource.
                unsafe {
                    rec.device
                        .cmd_copy_image_to_buffer(rec.raw(), raw, src_layout, staging_raw, &[region])
                };
                rec.register(image, Access::READ);
                rec.register(staging_id, Access::WRITE);
            }
            batch.set_layout(image, range, self.desc.usage_class().optimal_layout())?;
            batch.memory_barrier(
                staging_raw,
                vk::AccessFlags2::TRANSFER_WRITE,
                kind.host_access(),
                vk::PipelineStageFlags2::TRANSFER,
                vk::PipelineStageFlags2::HOST,
            );
            streams.flush_transfer(queue, true)?;
            buffer::buffer_object(streams, staging_id)?.invalidate(0, layout.size)
        })();
        match filled {
            Ok(()) => Ok(staging_id),
            Err(e) => {
                destroy_resource(streams, staging_id);
                Err(e)
            }
        }
    }

    fn buffer_image_copy(&self, mip: u32, face: u32) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: copy_aspect(self.desc.format),
                mip_level: mip,
                base_array_layer: face,
                layer_count: 1,
            },
            image_offset: vk::Offset3D::default(),
            image_extent: self.desc.mip_extent(mip),
        }
    }

    fn unlock_target(&self, lock: &TextureLock<'_>, target: LockTarget) -> Result<(), LockError> {
        let mut state = self.state.lock().expect("texture state lock poisoned");
        state.locked = false;
        let mut streams = self.ctx.lock_streams();
        let (kind, mip, face) = (lock.kind, lock.mip, lock.face);

        let staging_id = match target {
            LockTarget::Direct { id, .. } => {
                if kind.writes() {
                    image_object(&streams.tracker, id)?.flush(lock.map_offset, lock.layout.size)?;
                }
                return Ok(());
            }
            LockTarget::Staging { id, .. } => id,
            LockTarget::Scratch(_) => return Ok(()),
        };

        let result = (|| -> Result<(), LockError> {
            if !kind.writes() {
                return Ok(());
            }
            let staging = buffer::buffer_object(&streams, staging_id)?;
            staging.flush(0, lock.layout.size)?;
            let staging_raw = staging.handle();

            let current = state.current;
            let sub = self.subresource_of(&streams, current, mip, face)?;
            let facts = UnlockFacts::observe(
                &streams.tracker,
                sub,
                self.desc.mip_count() == 1 && self.desc.layer_count() == 1,
            );
            let plan = plan_unlock(facts, kind);
            tracing::debug!("Unlocking {:?} mip {mip} face {face} {kind:?}: {plan:?}", self.name);

            let use_mask = streams.tracker.use_mask(sub, Access::READ | Access::WRITE);
            let destination = match plan {
                UnlockPlan::Copy { wait_on_use } => {
                    if wait_on_use {
                        streams.transfer(lock.queue)?.append_mask(use_mask);
                    }
                    current
                }
                UnlockPlan::Recreate => {
                    let new = create_image(&mut streams, &self.desc, self.name.as_deref())?;
                    destroy_image(&mut streams, current);
                    new
                }
                UnlockPlan::Clone {
                    copy_old,
                    wait_on_use,
                } => {
                    let new = create_image(&mut streams, &self.desc, self.name.as_deref())?;
                    let mut batch = streams.transfer(lock.queue)?;
                    if wait_on_use {
                        batch.append_mask(use_mask);
                    }
                    if copy_old {
                        copy_whole_image(&mut batch, &self.desc, current, new)?;
                    }
                    destroy_image(&mut streams, current);
                    new
                }
            };
            state.current = destination;

            let range = SubresourceRange::single(mip, face);
            let dst_layout = self.desc.transfer_layout(false);
            let mut batch = streams.transfer(lock.queue)?;
            batch.set_layout(destination, range, dst_layout)?;
            {
                let rec = batch.recorder();
                let raw = image_object(rec.tracker, destination)?.handle();
                let region = self.buffer_image_copy(mip, face);
                // SAFETY: the subresource is in dst_layout and the staging
                // buffer holds the packed subresource.
                unsafe {
                    rec.device
                        .cmd_copy_buffer_to_image(rec.raw(), staging_raw, raw, dst_layout, &[region])
                };
                rec.register(staging_id, Access::READ);
            }
            batch.set_layout(destination, range, self.desc.usage_class().optimal_layout())?;
            Ok(())
        })();

        destroy_resource(&mut streams, staging_id);
        result
    }

    // Copy functionality

    /// Record a copy, or a resolve when the source is multisampled and the
    /// destination is not, from this texture into `dst`.
    pub fn copy(
        &self,
        cb: &mut CommandBuffer,
        dst: &GpuTexture,
        region: &TextureCopy,
    ) -> Result<(), CopyTextureError> {
        let (src_desc, dst_desc) = (&self.desc, &dst.desc);
        if src_desc.usage.contains(TextureUsage::DEPTH_STENCIL)
            || dst_desc.usage.contains(TextureUsage::DEPTH_STENCIL)
        {
            tracing::error!("Texture copy/resolve isn't supported for depth-stencil textures");
            return Err(CopyTextureError::DepthStencil);
        }
        let resolve = src_desc.is_multisampled() && !dst_desc.is_multisampled();
        if !resolve
            && (src_desc.is_multisampled() || dst_desc.is_multisampled())
            && src_desc.samples != dst_desc.samples
        {
            tracing::error!("When copying textures their multisample counts must match");
            return Err(CopyTextureError::SampleCountMismatch {
                src: src_desc.samples,
                dst: dst_desc.samples,
            });
        }
        for (desc, mip, face) in [
            (src_desc, region.src_mip, region.src_face),
            (dst_desc, region.dst_mip, region.dst_face),
        ] {
            if mip >= desc.mip_count() || face >= desc.layer_count() {
                return Err(CopyTextureError::InvalidSubresource { mip, face });
            }
        }

        let extent = if region.extent.width == 0
            || region.extent.height == 0
            || region.extent.depth == 0
        {
            src_desc.mip_extent(region.src_mip)
        } else {
            region.extent
        };
        let layers = |format, mip, face| vk::ImageSubresourceLayers {
            aspect_mask: copy_aspect(format),
            mip_level: mip,
            base_array_layer: face,
            layer_count: 1,
        };
        let src_layers = layers(src_desc.format, region.src_mip, region.src_face);
        let dst_layers = layers(dst_desc.format, region.dst_mip, region.dst_face);
        let (src_layout, dst_layout) = (src_desc.transfer_layout(true), dst_desc.transfer_layout(false));
        let (src_id, dst_id) = (self.current_id(), dst.current_id());

        cb.record_transfer(|rec| {
            let src_range = SubresourceRange::single(region.src_mip, region.src_face);
            let dst_range = SubresourceRange::single(region.dst_mip, region.dst_face);
            rec.use_image(src_id, src_range, src_layout, Access::READ)?;
            rec.use_image(dst_id, dst_range, dst_layout, Access::WRITE)?;
            let src_raw = image_object(rec.tracker, src_id)?.handle();
            let dst_raw = image_object(rec.tracker, dst_id)?.handle();
            if resolve {
                let resolve_region = vk::ImageResolve {
                    src_subresource: src_layers,
                    src_offset: region.src_offset,
                    dst_subresource: dst_layers,
                    dst_offset: region.dst_offset,
                    extent,
                };
                // SAFETY: both images are tracked and in the layouts named.
                unsafe {
                    rec.device.cmd_resolve_image(
                        rec.raw(),
                        src_raw,
                        src_layout,
                        dst_raw,
                        dst_layout,
                        &[resolve_region],
                    )
                };
            } else {
                let copy_region = vk::ImageCopy {
                    src_subresource: src_layers,
                    src_offset: region.src_offset,
                    dst_subresource: dst_layers,
                    dst_offset: region.dst_offset,
                    extent,
                };
                // SAFETY: as above; sample counts were checked to match.
                unsafe {
                    rec.device.cmd_copy_image(
                        rec.raw(),
                        src_raw,
                        src_layout,
                        dst_raw,
                        dst_layout,
                        &[copy_region],
                    )
                };
            }
            Ok(())
        })?;
        Ok(())
    }

    // Convenience functionality

    /// Read one subresource into `dst`, packed without row padding.
    pub fn read_data(&self, mip: u32, face: u32, dst: &mut [u8]) -> Result<(), LockError> {
        let lock = self.lock(
            LockKind::ReadOnly,
            mip,
            face,
            QueueId::primary(QueueType::Graphics),
        )?;
        let layout = lock.layout();
        let expected = PixelLayout::packed(layout.extent, layout.texel_size);
        if dst.len() as vk::DeviceSize != expected.size {
            return Err(LockError::SizeMismatch {
                expected: expected.size,
                actual: dst.len() as vk::DeviceSize,
            });
        }
        let row = expected.packed_row();
        for (chunk, offset) in dst.chunks_exact_mut(row).zip(layout.rows()) {
            chunk.copy_from_slice(&lock[offset..offset + row]);
        }
        lock.unlock()
    }

    /// Overwrite one subresource with packed `src`. Empty input is a no-op.
    pub fn write_data(
        &self,
        mip: u32,
        face: u32,
        src: &[u8],
        discard_whole: bool,
    ) -> Result<(), LockError> {
        if src.is_empty() {
            return Ok(());
        }
        if self.desc.is_multisampled() {
            tracing::error!("Multisampled textures cannot be accessed from the CPU directly");
            return Err(LockError::Multisampled);
        }
        if face > 0 && self.desc.kind == TextureKind::D3 {
            tracing::error!("3D texture arrays are not supported");
            return Err(LockError::VolumeArray);
        }
        let kind = if discard_whole {
            LockKind::WriteOnlyDiscard
        } else {
            LockKind::WriteOnlyDiscardRange
        };
        let mut lock = self.lock(kind, mip, face, QueueId::primary(QueueType::Graphics))?;
        let layout = lock.layout();
        let expected = PixelLayout::packed(layout.extent, layout.texel_size);
        if src.len() as vk::DeviceSize != expected.size {
            return Err(LockError::SizeMismatch {
                expected: expected.size,
                actual: src.len() as vk::DeviceSize,
            });
        }
        let row = expected.packed_row();
        let offsets: Vec<usize> = layout.rows().collect();
        for (chunk, offset) in src.chunks_exact(row).zip(offsets) {
            lock[offset..offset + row].copy_from_slice(chunk);
        }
        lock.unlock()
    }
}

impl Drop for GpuTexture {
    fn drop(&mut self) {
        let current = self
            .state
            .get_mut()
            .map_or_else(|poisoned| poisoned.into_inner().current, |state| state.current);
        destroy_image(&mut self.ctx.lock_streams(), current);
    }
}

// ---------------------------------------------------------------------------
// TextureLock
// ---------------------------------------------------------------------------

/// CPU access to one locked subresource. Rows are `layout().row_pitch`
/// bytes apart.
#[derive(Debug)]
pub struct TextureLock<'a> {
    texture: &'a GpuTexture,
    kind: LockKind,
    mip: u32,
    face: u32,
    queue: QueueId,
    layout: PixelLayout,
    map_offset: vk::DeviceSize,
    target: Option<LockTarget>,
}

impl TextureLock<'_> {
    pub fn layout(&self) -> PixelLayout {
        self.layout
    }

    pub fn unlock(mut self) -> Result<(), LockError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), LockError> {
        match self.target.take() {
            Some(target) => self.texture.unlock_target(self, target),
            None => Ok(()),
        }
    }
}

impl std::ops::Deref for TextureLock<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.target {
            Some(LockTarget::Direct { ptr, .. } | LockTarget::Staging { ptr, .. }) => {
                // SAFETY: ptr addresses layout.size mapped bytes that stay
                // alive until unlock.
                unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.layout.size as usize) }
            }
            Some(LockTarget::Scratch(data)) => data,
            None => &[],
        }
    }
}

impl std::ops::DerefMut for TextureLock<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.layout.size as usize;
        match &mut self.target {
            Some(LockTarget::Direct { ptr, .. } | LockTarget::Staging { ptr, .. }) => {
                // SAFETY: as in deref; the guard is borrowed mutably.
                unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), len) }
            }
            Some(LockTarget::Scratch(data)) => data,
            None => &mut [],
        }
    }
}

impl Drop for TextureLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            tracing::error!("Failed to unlock texture: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RGBA8: vk::Format = vk::Format::R8G8B8A8_UNORM;

    #[test]
    fn mip_extent_never_reaches_zero() {
        let desc = TextureDesc::new_2d(RGBA8, 64, 16, TextureUsage::empty()).with_mips(7);
        assert_eq!(desc.mip_extent(0).width, 64);
        assert_eq!(desc.mip_extent(3).height, 2);
        let tail = desc.mip_extent(6);
        assert_eq!((tail.width, tail.height, tail.depth), (1, 1, 1));
    }

    #[test]
    fn zero_sized_textures_are_clamped() {
        let desc = TextureDesc::new_2d(RGBA8, 0, 0, TextureUsage::empty());
        let extent = desc.extent();
        assert_eq!((extent.width, extent.height, extent.depth), (1, 1, 1));
    }

    #[test]
    fn only_simple_dynamic_textures_map_directly() {
        let dynamic = TextureDesc::new_2d(RGBA8, 32, 32, TextureUsage::DYNAMIC);
        assert!(dynamic.directly_mappable());
        assert!(!dynamic.with_mips(2).directly_mappable());
        assert!(
            !dynamic
                .with_samples(vk::SampleCountFlags::TYPE_4)
                .directly_mappable()
        );
        let target = TextureDesc::new_2d(
            RGBA8,
            32,
            32,
            TextureUsage::DYNAMIC | TextureUsage::RENDER_TARGET,
        );
        assert!(!target.directly_mappable());
        let cube = TextureDesc::new_cube(RGBA8, 32, TextureUsage::DYNAMIC);
        assert!(!cube.directly_mappable());
    }

    #[test]
    fn usage_flags_follow_texture_usage() {
        use vk::ImageUsageFlags as U;
        let base = U::SAMPLED | U::TRANSFER_SRC | U::TRANSFER_DST;
        let plain = TextureDesc::new_2d(RGBA8, 4, 4, TextureUsage::empty());
        assert_eq!(plain.vk_usage(), base);
        let rt = TextureDesc::new_2d(
            RGBA8,
            4,
            4,
            TextureUsage::RENDER_TARGET | TextureUsage::LOAD_STORE,
        );
        assert_eq!(rt.vk_usage(), base | U::COLOR_ATTACHMENT | U::STORAGE);
        let depth = TextureDesc::new_2d(
            vk::Format::D32_SFLOAT,
            4,
            4,
            TextureUsage::DEPTH_STENCIL,
        );
        assert_eq!(depth.vk_usage(), base | U::DEPTH_STENCIL_ATTACHMENT);
        assert!(depth.supports_gpu_writes());
    }

    #[test]
    fn cube_maps_are_cube_compatible_and_validated() {
        let cube = TextureDesc::new_cube(RGBA8, 16, TextureUsage::empty());
        assert!(cube.create_flags().contains(vk::ImageCreateFlags::CUBE_COMPATIBLE));
        assert!(cube.validate().is_ok());
        assert_eq!(cube.view_type(cube.whole_range()), vk::ImageViewType::CUBE);
        assert_eq!(
            cube.view_type(SubresourceRange::single(0, 2)),
            vk::ImageViewType::TYPE_2D
        );

        let bad = TextureDesc {
            layers: 4,
            ..cube
        };
        assert!(bad.validate().is_err());
        let volume_array = TextureDesc {
            kind: TextureKind::D3,
            layers: 2,
            ..TextureDesc::new_2d(RGBA8, 4, 4, TextureUsage::empty())
        };
        assert!(volume_array.validate().is_err());
    }

    #[test]
    fn depth_copies_use_the_depth_plane() {
        assert_eq!(
            copy_aspect(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(copy_aspect(RGBA8), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn packed_rows_walk_slices_then_rows() {
        let layout = PixelLayout::packed(
            vk::Extent3D {
                width: 3,
                height: 2,
                depth: 2,
            },
            4,
        );
        assert_eq!(layout.row_pitch, 12);
        assert_eq!(layout.size, 48);
        let rows: Vec<usize> = layout.rows().collect();
        assert_eq!(rows, vec![0, 12, 24, 36]);

        let padded = PixelLayout {
            row_pitch: 16,
            slice_pitch: 40,
            ..layout
        };
        let rows: Vec<usize> = padded.rows().collect();
        assert_eq!(rows, vec![0, 16, 40, 56]);
    }

    #[test]
    fn transfer_layouts_stay_general_for_linear_images() {
        let dynamic = TextureDesc::new_2d(RGBA8, 8, 8, TextureUsage::DYNAMIC);
        assert_eq!(dynamic.transfer_layout(true), vk::ImageLayout::GENERAL);
        let plain = TextureDesc::new_2d(RGBA8, 8, 8, TextureUsage::empty());
        assert_eq!(
            plain.transfer_layout(false),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
    }
}
