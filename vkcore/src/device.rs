//! The headless logical [`Device`] and the queues behind each [`QueueType`].
//!
//! `Device` owns the `VkDevice`, the [`MemoryAllocator`], the extension
//! loaders needed below Vulkan 1.3 and one queue per [`QueueType`]. Sibling
//! modules go through its `unsafe fn` wrappers rather than touching
//! `ash::Device` directly.
//!
//! Selection ranks physical devices by how many dedicated (non-graphics)
//! queue families they expose, then by device type. Devices below
//! [`MIN_API_VERSION`] or lacking timeline semaphores or synchronization2
//! are rejected outright; dynamic rendering is only required on request.

use std::collections::BTreeMap;
use std::ffi::{CStr, CString};
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::AllocationError;
use thiserror::Error;

use crate::instance::{ApiVersion, Instance, MIN_API_VERSION, PhysicalDeviceInfo};
use crate::memory::MemoryAllocator;
use crate::queue::QueueType;

/// Entry points that are core in 1.3 and an extension before it.
enum Dispatch<T> {
    Core,
    Extension(T),
}

impl<T> Dispatch<T> {
    fn new(use_extension: bool, load: impl FnOnce() -> T) -> Self {
        if use_extension {
            Self::Extension(load())
        } else {
            Self::Core
        }
    }
}

struct QueueSlot {
    /// Shared between roles that resolved to the same `VkQueue`.
    queue: Arc<Mutex<vk::Queue>>,
    family: u32,
}

/// A logical Vulkan device and its per-device state.
pub struct Device {
    parent: Arc<Instance>,
    allocator: Option<MemoryAllocator>,
    handle: ash::Device,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    debug_utils: Option<ash::ext::debug_utils::Device>,
    dynamic_rendering: Option<Dispatch<ash::khr::dynamic_rendering::Device>>,
    synchronization2: Dispatch<ash::khr::synchronization2::Device>,
    /// Indexed by [`QueueType::index`].
    queues: [QueueSlot; 3],
    unique_families: Vec<u32>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .field("families", &self.unique_families)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Destroying device {:?}", self.handle.handle());
        // Allocator blocks are freed through the device handle.
        self.allocator = None;
        // SAFETY: every child object holds an Arc<Device> and is gone.
        unsafe { self.handle.destroy_device(None) };
    }
}

#[derive(Debug, Error)]
pub enum CreateCompatibleError {
    #[error("Vulkan error enumerating physical devices: {0}")]
    Enumerate(vk::Result),

    #[error("No physical device meets the requirements")]
    NoSuitableDevice,

    #[error("vkCreateDevice failed: {0}")]
    DeviceCreationFailed(vk::Result),

    #[error("Could not set up the GPU memory allocator: {0}")]
    AllocatorCreation(AllocationError),
}

#[derive(Debug, Error)]
pub enum DynamicRenderingError {
    #[error("Device was created without dynamic rendering")]
    NotEnabled,
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Object name contains a NUL byte: {0}")]
    InvalidName(#[from] std::ffi::NulError),

    #[error("vkSetDebugUtilsObjectNameEXT failed: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Compute goes to a compute-only family and uploads to a
    /// transfer-only family, falling back towards graphics when the device
    /// has neither.
    #[default]
    Auto,
    /// Graphics, compute and upload share the graphics family but take
    /// separate queues while it has enough of them.
    Unified,
    /// Graphics, compute and upload all submit to queue 0 of the graphics
    /// family.
    Single,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeviceConfig {
    /// Reject devices that cannot begin rendering without a render pass
    /// object.
    pub dynamic_rendering: bool,
    pub queue_mode: QueueMode,
}

/// A physical device that passed every hard requirement.
struct Candidate {
    info: PhysicalDeviceInfo,
    graphics_family: u32,
    rank: (u32, u32),
    /// Extensions to enable. Non-empty only below 1.3.
    extensions: Vec<&'static CStr>,
}

impl Candidate {
    fn needs_extension(&self, name: &CStr) -> bool {
        self.extensions.iter().any(|ext| *ext == name)
    }
}

/// Least preferred first; anything not listed (CPU, other) ranks 0.
const DEVICE_TYPE_ORDER: [vk::PhysicalDeviceType; 3] = [
    vk::PhysicalDeviceType::VIRTUAL_GPU,
    vk::PhysicalDeviceType::INTEGRATED_GPU,
    vk::PhysicalDeviceType::DISCRETE_GPU,
];

fn device_type_rank(ty: vk::PhysicalDeviceType) -> u32 {
    DEVICE_TYPE_ORDER
        .iter()
        .position(|&listed| listed == ty)
        .map_or(0, |pos| pos as u32 + 1)
}

fn find_family(
    families: &[vk::QueueFamilyProperties],
    want: vk::QueueFlags,
    reject: vk::QueueFlags,
) -> Option<u32> {
    families
        .iter()
        .position(|family| {
            family.queue_count > 0
                && family.queue_flags.contains(want)
                && !family.queue_flags.intersects(reject)
        })
        .map(|idx| idx as u32)
}

/// Number of non-graphics families that can take compute or transfer work.
fn dedicated_family_count(families: &[vk::QueueFamilyProperties]) -> u32 {
    [vk::QueueFlags::COMPUTE, vk::QueueFlags::TRANSFER]
        .into_iter()
        .filter(|&flag| find_family(families, flag, vk::QueueFlags::GRAPHICS).is_some())
        .count() as u32
}

/// Families used for `[Graphics, Compute, Upload]`.
fn assign_families(
    families: &[vk::QueueFamilyProperties],
    graphics: u32,
    mode: QueueMode,
) -> [u32; 3] {
    if mode != QueueMode::Auto {
        return [graphics; 3];
    }
    let compute = find_family(families, vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS)
        .unwrap_or(graphics);
    let upload = find_family(
        families,
        vk::QueueFlags::TRANSFER,
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
    )
    .or_else(|| find_family(families, vk::QueueFlags::TRANSFER, vk::QueueFlags::GRAPHICS))
    .unwrap_or(graphics);
    [graphics, compute, upload]
}

/// How many queues to request from each family, and which queue index
/// each role gets. Roles beyond a family's queue count share index 0.
fn plan_queues(
    families: &[vk::QueueFamilyProperties],
    roles: [u32; 3],
    mode: QueueMode,
) -> (BTreeMap<u32, u32>, [u32; 3]) {
    let mut counts: BTreeMap<u32, u32> = BTreeMap::new();
    let mut indices = [0; 3];
    for (role, &family) in roles.iter().enumerate() {
        let taken = counts.entry(family).or_insert(0);
        let available = match mode {
            QueueMode::Single => 1,
            _ => families[family as usize].queue_count,
        };
        if *taken < available {
            indices[role] = *taken;
            *taken += 1;
        }
    }
    (counts, indices)
}

/// Check one physical device against `config`. Returns the reason it was
/// rejected otherwise.
///
/// # Safety
/// `physical_device` must come from `instance`.
unsafe fn inspect(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    config: DeviceConfig,
) -> Result<Candidate, String> {
    // SAFETY: forwarded to the caller.
    let info = unsafe { instance.describe_physical_device(physical_device) };
    if !info.api_version.satisfies(MIN_API_VERSION) {
        return Err(format!("Vulkan {} is too old", info.api_version));
    }
    if !info.timeline_semaphore {
        return Err("no timeline semaphores".into());
    }

    let mut wanted: Vec<&'static CStr> = Vec::new();
    if !info.synchronization2 {
        return Err("no synchronization2".into());
    }
    wanted.push(ash::khr::synchronization2::NAME);
    if config.dynamic_rendering {
        if !info.dynamic_rendering {
            return Err("no dynamic rendering".into());
        }
        wanted.push(ash::khr::dynamic_rendering::NAME);
    }

    let extensions = if info.api_version.satisfies(ApiVersion::V1_3) {
        Vec::new()
    } else {
        // SAFETY: forwarded to the caller.
        let available = unsafe { instance.device_extensions(physical_device) }
            .map_err(|e| format!("extension query failed: {e}"))?;
        if let Some(missing) = wanted
            .iter()
            .find(|name| !available.iter().any(|ext| ext.as_c_str() == **name))
        {
            return Err(format!("missing {missing:?}"));
        }
        wanted
    };

    let graphics_family = find_family(
        &info.queue_families,
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        vk::QueueFlags::empty(),
    )
    .ok_or("no graphics+compute queue family")?;

    let rank = (
        dedicated_family_count(&info.queue_families),
        device_type_rank(info.properties.device_type),
    );
    Ok(Candidate {
        info,
        graphics_family,
        rank,
        extensions,
    })
}

impl Device {
    /// Create a headless logical device on the best physical device that
    /// satisfies `config`.
    pub fn create_compatible(
        instance: &Arc<Instance>,
        config: DeviceConfig,
    ) -> Result<Self, CreateCompatibleError> {
        let _span = tracing::info_span!("create_device", ?config).entered();
        let mut best: Option<Candidate> = None;
        for physical_device in instance
            .physical_devices()
            .map_err(CreateCompatibleError::Enumerate)?
        {
            // SAFETY: physical_device was just enumerated from instance.
            match unsafe { inspect(instance, physical_device, config) } {
                Ok(candidate) => {
                    if best.as_ref().is_none_or(|b| candidate.rank > b.rank) {
                        best = Some(candidate);
                    }
                }
                Err(reason) => tracing::debug!("{physical_device:?} rejected: {reason}"),
            }
        }
        let best = best.ok_or(CreateCompatibleError::NoSuitableDevice)?;
        let physical_device = best.info.handle;
        tracing::info!(
            "Using {:?}: {:?}, Vulkan {}, {} non-graphics compute/transfer families",
            best.info.name(),
            best.info.properties.device_type,
            best.info.api_version,
            best.rank.0,
        );

        let families = assign_families(
            &best.info.queue_families,
            best.graphics_family,
            config.queue_mode,
        );
        let (counts, indices) = plan_queues(&best.info.queue_families, families, config.queue_mode);
        for ty in QueueType::ALL {
            let role = ty.index();
            tracing::info!(
                "{ty:?} work goes to family {} queue {}",
                families[role],
                indices[role]
            );
        }

        let priorities = [1.0f32; QueueType::ALL.len()];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = counts
            .iter()
            .map(|(&family, &count)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities[..count as usize])
            })
            .collect();
        let extension_ptrs: Vec<*const std::ffi::c_char> =
            best.extensions.iter().map(|name| name.as_ptr()).collect();

        let mut timeline =
            vk::PhysicalDeviceTimelineSemaphoreFeatures::default().timeline_semaphore(true);
        let mut sync2 =
            vk::PhysicalDeviceSynchronization2Features::default().synchronization2(true);
        let mut rendering =
            vk::PhysicalDeviceDynamicRenderingFeatures::default().dynamic_rendering(true);
        let mut create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut timeline)
            .push_next(&mut sync2);
        if config.dynamic_rendering {
            create_info = create_info.push_next(&mut rendering);
        }

        // SAFETY: physical_device came from instance and every pointer in
        // create_info borrows a local that outlives the call.
        let device = unsafe { instance.create_ash_device(physical_device, &create_info) }
            .map_err(CreateCompatibleError::DeviceCreationFailed)?;

        let mut slots: Vec<QueueSlot> = Vec::with_capacity(families.len());
        for (role, (&family, &index)) in families.iter().zip(&indices).enumerate() {
            let earlier = (0..role).find(|&r| families[r] == family && indices[r] == index);
            let queue = match earlier {
                Some(r) => Arc::clone(&slots[r].queue),
                // SAFETY: plan_queues requested at least index + 1 queues
                // from this family.
                None => Arc::new(Mutex::new(unsafe { device.get_device_queue(family, index) })),
            };
            slots.push(QueueSlot { queue, family });
        }
        let Ok(queues) = <[QueueSlot; 3]>::try_from(slots) else {
            unreachable!("one slot per queue type");
        };

        let mut unique_families = families.to_vec();
        unique_families.sort_unstable();
        unique_families.dedup();

        // SAFETY: physical_device came from instance.
        let memory_properties = unsafe { instance.memory_properties(physical_device) };
        let allocator = match MemoryAllocator::new(
            instance.ash_instance(),
            &device,
            physical_device,
            memory_properties,
            best.info.properties.limits.non_coherent_atom_size,
        ) {
            Ok(allocator) => allocator,
            Err(e) => {
                // SAFETY: nothing has been created from the device yet.
                unsafe { device.destroy_device(None) };
                return Err(CreateCompatibleError::AllocatorCreation(e));
            }
        };

        let ash_instance = instance.ash_instance();
        let synchronization2 = Dispatch::new(
            best.needs_extension(ash::khr::synchronization2::NAME),
            || ash::khr::synchronization2::Device::new(ash_instance, &device),
        );
        let dynamic_rendering = config.dynamic_rendering.then(|| {
            Dispatch::new(
                best.needs_extension(ash::khr::dynamic_rendering::NAME),
                || ash::khr::dynamic_rendering::Device::new(ash_instance, &device),
            )
        });
        let debug_utils = instance
            .debug_utils_enabled()
            .then(|| ash::ext::debug_utils::Device::new(ash_instance, &device));

        Ok(Self {
            parent: Arc::clone(instance),
            allocator: Some(allocator),
            handle: device,
            physical_device,
            properties: best.info.properties,
            memory_properties,
            debug_utils,
            dynamic_rendering,
            synchronization2,
            queues,
            unique_families,
        })
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size
    }

    pub fn allocator(&self) -> &MemoryAllocator {
        self.allocator
            .as_ref()
            .expect("allocator outlives every caller of Device::allocator")
    }

    pub fn raw_device(&self) -> vk::Device {
        self.handle.handle()
    }

    pub fn queue_family(&self, ty: QueueType) -> u32 {
        self.queues[ty.index()].family
    }

    /// Sharing mode for resources every queue type may touch.
    ///
    /// Resources are `CONCURRENT` over the distinct families in use, so no
    /// queue family ownership transfers are ever recorded.
    pub fn sharing_mode(&self) -> (vk::SharingMode, &[u32]) {
        if self.unique_families.len() > 1 {
            (vk::SharingMode::CONCURRENT, &self.unique_families)
        } else {
            (vk::SharingMode::EXCLUSIVE, &[])
        }
    }

    /// Block until all submitted work on this device has completed.
    pub fn wait_idle(&self) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("idle_all_queues").entered();
        // SAFETY: the device is live. Queue access is not synchronized here
        // but vkDeviceWaitIdle only reads queue state.
        unsafe { self.handle.device_wait_idle() }
    }
}

// Debug names
impl Device {
    /// Attach a debug name to `object`. A no-op unless the instance was
    /// created with validation.
    ///
    /// # Safety
    /// `object` must be a live handle created from this device.
    pub unsafe fn set_object_name<H: vk::Handle>(
        &self,
        object: H,
        name: &str,
    ) -> Result<(), NameObjectError> {
        let Some(debug_utils) = &self.debug_utils else {
            return Ok(());
        };
        let name = CString::new(name)?;
        let info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(&name);
        // SAFETY: caller guarantees object belongs to this device.
        unsafe { debug_utils.set_debug_utils_object_name(&info) }.map_err(NameObjectError::Vulkan)
    }

    /// Name `object` when `name` is set, logging rather than failing.
    pub(crate) fn name_or_warn<H: vk::Handle + Copy + std::fmt::Debug>(
        &self,
        object: H,
        name: Option<&str>,
    ) {
        let Some(name) = name else {
            return;
        };
        // SAFETY: callers pass handles they just created from this device.
        if let Err(e) = unsafe { self.set_object_name(object, name) } {
            tracing::warn!("Failed to name {object:?} {name:?}: {e}");
        }
    }
}

// Shaders and pipelines
impl Device {
    /// # Safety
    /// `create_info` must contain valid SPIR-V code.
    pub unsafe fn create_raw_shader_module(
        &self,
        create_info: &vk::ShaderModuleCreateInfo<'_>,
    ) -> Result<vk::ShaderModule, vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.create_shader_module(create_info, None) }
    }

    /// # Safety
    /// `shader_module` must be a valid handle created from this device and
    /// not yet destroyed.
    pub unsafe fn destroy_raw_shader_module(&self, shader_module: vk::ShaderModule) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.destroy_shader_module(shader_module, None) };
    }

    /// # Safety
    /// All descriptor set layouts referenced by `create_info` must be valid
    /// handles created from this device.
    pub unsafe fn create_raw_pipeline_layout(
        &self,
        create_info: &vk::PipelineLayoutCreateInfo<'_>,
    ) -> Result<vk::PipelineLayout, vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.create_pipeline_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must be a valid handle created from this device. No pipeline
    /// using it may be in use.
    pub unsafe fn destroy_raw_pipeline_layout(&self, layout: vk::PipelineLayout) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.destroy_pipeline_layout(layout, None) };
    }

    /// Create a single graphics pipeline.
    ///
    /// Partially created handles are destroyed on failure.
    ///
    /// # Safety
    /// `create_info` must reference valid shader stages, a valid pipeline
    /// layout and valid pNext structures, all derived from this device.
    pub unsafe fn create_raw_graphics_pipeline(
        &self,
        create_info: &vk::GraphicsPipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: per this function's contract.
        let result = unsafe {
            self.handle.create_graphics_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        };
        self.single_pipeline(result)
    }

    /// Create a single compute pipeline.
    ///
    /// # Safety
    /// `create_info` must reference a valid compute stage and pipeline
    /// layout derived from this device.
    pub unsafe fn create_raw_compute_pipeline(
        &self,
        create_info: &vk::ComputePipelineCreateInfo<'_>,
    ) -> Result<vk::Pipeline, vk::Result> {
        // SAFETY: per this function's contract.
        let result = unsafe {
            self.handle.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(create_info),
                None,
            )
        };
        self.single_pipeline(result)
    }

    fn single_pipeline(
        &self,
        result: Result<Vec<vk::Pipeline>, (Vec<vk::Pipeline>, vk::Result)>,
    ) -> Result<vk::Pipeline, vk::Result> {
        result
            .map_err(|(partial, result)| {
                for p in partial {
                    if p != vk::Pipeline::null() {
                        // SAFETY: p was just created by this device.
                        unsafe { self.handle.destroy_pipeline(p, None) };
                    }
                }
                result
            })
            .map(|mut pipelines| {
                debug_assert_eq!(pipelines.len(), 1);
                pipelines.remove(0)
            })
    }

    /// # Safety
    /// `pipeline` must be a valid handle created from this device. No
    /// in-flight GPU work may still reference it.
    pub unsafe fn destroy_raw_pipeline(&self, pipeline: vk::Pipeline) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.destroy_pipeline(pipeline, None) };
    }
}

// Dynamic rendering and synchronization2
impl Device {
    pub fn has_dynamic_rendering(&self) -> bool {
        self.dynamic_rendering.is_some()
    }

    fn rendering(
        &self,
    ) -> Result<&Dispatch<ash::khr::dynamic_rendering::Device>, DynamicRenderingError> {
        self.dynamic_rendering
            .as_ref()
            .ok_or(DynamicRenderingError::NotEnabled)
    }

    /// # Safety
    /// `command_buffer` must be recording outside a render pass, and every
    /// attachment in `rendering_info` must be live and in the layout it
    /// names.
    pub unsafe fn cmd_begin_raw_rendering(
        &self,
        command_buffer: vk::CommandBuffer,
        rendering_info: &vk::RenderingInfo<'_>,
    ) -> Result<(), DynamicRenderingError> {
        let rendering = self.rendering()?;
        // SAFETY: per this function's contract.
        unsafe {
            match rendering {
                Dispatch::Core => self.handle.cmd_begin_rendering(command_buffer, rendering_info),
                Dispatch::Extension(ext) => ext.cmd_begin_rendering(command_buffer, rendering_info),
            }
        }
        Ok(())
    }

    /// # Safety
    /// `command_buffer` must be inside a pass begun with
    /// [`cmd_begin_raw_rendering`](Self::cmd_begin_raw_rendering).
    pub unsafe fn cmd_end_raw_rendering(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), DynamicRenderingError> {
        let rendering = self.rendering()?;
        // SAFETY: per this function's contract.
        unsafe {
            match rendering {
                Dispatch::Core => self.handle.cmd_end_rendering(command_buffer),
                Dispatch::Extension(ext) => ext.cmd_end_rendering(command_buffer),
            }
        }
        Ok(())
    }

    /// Submit to the queue serving `ty`, holding its lock for the call.
    ///
    /// # Safety
    /// Every handle in `submits` must belong to this device, command
    /// buffers must be executable and a non-null `fence` unsignalled.
    pub unsafe fn queue_submit2(
        &self,
        ty: QueueType,
        submits: &[vk::SubmitInfo2<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let queue = *self.queues[ty.index()]
            .queue
            .lock()
            .expect("queue lock poisoned");
        // SAFETY: per this function's contract. The lock above provides
        // the external synchronization vkQueueSubmit2 requires.
        unsafe {
            match &self.synchronization2 {
                Dispatch::Core => self.handle.queue_submit2(queue, submits, fence),
                Dispatch::Extension(ext) => ext.queue_submit2(queue, submits, fence),
            }
        }
    }

    /// # Safety
    /// `command_buffer` must be recording and every resource named in
    /// `dependency_info` must be live.
    pub unsafe fn cmd_pipeline_barrier2(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        // SAFETY: per this function's contract.
        unsafe {
            match &self.synchronization2 {
                Dispatch::Core => self.handle.cmd_pipeline_barrier2(command_buffer, dependency_info),
                Dispatch::Extension(ext) => ext.cmd_pipeline_barrier2(command_buffer, dependency_info),
            }
        }
    }
}

// Command recording
impl Device {
    /// # Safety
    /// `command_buffer` must be recording; `pipeline` must match
    /// `bind_point`.
    pub unsafe fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.cmd_bind_pipeline(command_buffer, bind_point, pipeline) }
    }

    /// # Safety
    /// `command_buffer` must be recording. `buffers` and `offsets` must have
    /// equal length.
    pub unsafe fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        // SAFETY: per this function's contract.
        unsafe {
            self.handle
                .cmd_bind_vertex_buffers(command_buffer, first_binding, buffers, offsets)
        }
    }

    /// # Safety
    /// `command_buffer` must be recording; `buffer` must have `INDEX_BUFFER`
    /// usage.
    pub unsafe fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        // SAFETY: per this function's contract.
        unsafe {
            self.handle
                .cmd_bind_index_buffer(command_buffer, buffer, offset, index_type)
        }
    }

    /// # Safety
    /// `command_buffer` must be recording. Regions must be within bounds.
    pub unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: per this function's contract.
        unsafe {
            self.handle
                .cmd_copy_buffer(command_buffer, src_buffer, dst_buffer, regions)
        }
    }

    /// # Safety
    /// `command_buffer` must be recording outside a render pass. `data` must
    /// be at most 65536 bytes and a multiple of 4; `offset` must be 4-byte
    /// aligned.
    pub unsafe fn cmd_update_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.cmd_update_buffer(command_buffer, buffer, offset, data) }
    }

    /// # Safety
    /// `command_buffer` must be recording. `image` must be in `layout`.
    pub unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: per this function's contract.
        unsafe {
            self.handle
                .cmd_copy_buffer_to_image(command_buffer, buffer, image, layout, regions)
        }
    }

    /// # Safety
    /// `command_buffer` must be recording. `image` must be in `layout`.
    pub unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        buffer: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: per this function's contract.
        unsafe {
            self.handle
                .cmd_copy_image_to_buffer(command_buffer, image, layout, buffer, regions)
        }
    }

    /// # Safety
    /// `command_buffer` must be recording; both images must be in the given
    /// layouts and have equal sample counts.
    pub unsafe fn cmd_copy_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        // SAFETY: per this function's contract.
        unsafe {
            self.handle
                .cmd_copy_image(command_buffer, src, src_layout, dst, dst_layout, regions)
        }
    }

    /// # Safety
    /// `command_buffer` must be recording; `src` must be multisampled and
    /// `dst` single-sampled.
    pub unsafe fn cmd_resolve_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::ImageResolve],
    ) {
        // SAFETY: per this function's contract.
        unsafe {
            self.handle
                .cmd_resolve_image(command_buffer, src, src_layout, dst, dst_layout, regions)
        }
    }

    /// # Safety
    /// `command_buffer` must be recording with a pipeline bound that declares
    /// dynamic viewport state.
    pub unsafe fn cmd_set_viewport(
        &self,
        command_buffer: vk::CommandBuffer,
        viewports: &[vk::Viewport],
    ) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.cmd_set_viewport(command_buffer, 0, viewports) }
    }

    /// # Safety
    /// `command_buffer` must be recording with a pipeline bound that declares
    /// dynamic scissor state.
    pub unsafe fn cmd_set_scissor(
        &self,
        command_buffer: vk::CommandBuffer,
        scissors: &[vk::Rect2D],
    ) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.cmd_set_scissor(command_buffer, 0, scissors) }
    }

    /// # Safety
    /// `command_buffer` must be recording.
    pub unsafe fn cmd_set_stencil_reference(
        &self,
        command_buffer: vk::CommandBuffer,
        reference: u32,
    ) {
        // SAFETY: per this function's contract.
        unsafe {
            self.handle.cmd_set_stencil_reference(
                command_buffer,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                reference,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be inside a render pass with a compatible
    /// graphics pipeline and all dynamic state bound.
    pub unsafe fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        // SAFETY: per this function's contract.
        unsafe {
            self.handle.cmd_draw(
                command_buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        }
    }

    /// # Safety
    /// As [`cmd_draw`](Self::cmd_draw), plus a bound index buffer.
    pub unsafe fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        // SAFETY: per this function's contract.
        unsafe {
            self.handle.cmd_draw_indexed(
                command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }

    /// # Safety
    /// `command_buffer` must be recording outside a render pass with a
    /// compute pipeline bound.
    pub unsafe fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.cmd_dispatch(command_buffer, x, y, z) }
    }
}

// Buffers, images and memory
impl Device {
    /// # Safety
    /// `create_info` must be valid for this device.
    pub unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// `buffer` must be a valid handle created from this device. No
    /// in-flight GPU work may still reference it.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// # Safety
    /// `buffer` must be a valid handle created from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: per this function's contract.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `buffer` and `memory` must be valid handles from this device and
    /// `offset` must satisfy the buffer's memory requirements.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }

    /// # Safety
    /// `create_info.buffer` must be a valid buffer with texel usage.
    pub unsafe fn create_raw_buffer_view(
        &self,
        create_info: &vk::BufferViewCreateInfo<'_>,
    ) -> Result<vk::BufferView, vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.create_buffer_view(create_info, None) }
    }

    /// # Safety
    /// `view` must be a valid handle from this device not referenced by
    /// pending GPU work.
    pub unsafe fn destroy_raw_buffer_view(&self, view: vk::BufferView) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.destroy_buffer_view(view, None) };
    }

    /// # Safety
    /// `create_info` must be valid for this device.
    pub unsafe fn create_raw_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.create_image(create_info, None) }
    }

    /// # Safety
    /// `image` must be a valid handle from this device. All views of it must
    /// be destroyed and no GPU work may still reference it.
    pub unsafe fn destroy_raw_image(&self, image: vk::Image) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.destroy_image(image, None) };
    }

    /// # Safety
    /// `image` must be a valid handle created from this device.
    pub unsafe fn get_raw_image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements {
        // SAFETY: per this function's contract.
        unsafe { self.handle.get_image_memory_requirements(image) }
    }

    /// # Safety
    /// `image` and `memory` must be valid handles from this device and
    /// `offset` must satisfy the image's memory requirements.
    pub unsafe fn bind_raw_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.bind_image_memory(image, memory, offset) }
    }

    /// Row/array pitches of a linearly tiled image.
    ///
    /// # Safety
    /// `image` must be a valid `LINEAR` image created from this device.
    pub unsafe fn get_raw_image_subresource_layout(
        &self,
        image: vk::Image,
        subresource: vk::ImageSubresource,
    ) -> vk::SubresourceLayout {
        // SAFETY: per this function's contract.
        unsafe { self.handle.get_image_subresource_layout(image, subresource) }
    }

    /// # Safety
    /// `create_info` must reference a valid image derived from this device.
    pub unsafe fn create_raw_image_view(
        &self,
        create_info: &vk::ImageViewCreateInfo<'_>,
    ) -> Result<vk::ImageView, vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.create_image_view(create_info, None) }
    }

    /// # Safety
    /// `image_view` must be a valid handle from this device not referenced
    /// by pending GPU work.
    pub unsafe fn destroy_raw_image_view(&self, image_view: vk::ImageView) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.destroy_image_view(image_view, None) };
    }

    /// # Safety
    /// Every range must lie in host-visible memory from this device and be
    /// aligned to `nonCoherentAtomSize`.
    pub unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.flush_mapped_memory_ranges(memory_ranges) }
    }

    /// # Safety
    /// Same contract as
    /// [`flush_raw_mapped_memory_ranges`](Self::flush_raw_mapped_memory_ranges).
    pub unsafe fn invalidate_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.invalidate_mapped_memory_ranges(memory_ranges) }
    }
}

// Command pools
impl Device {
    /// # Safety
    /// `create_info` must name a queue family of this device.
    pub unsafe fn create_raw_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.create_command_pool(create_info, None) }
    }

    /// # Safety
    /// No command buffer from `pool` may be pending execution.
    pub unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.destroy_command_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info.command_pool` must be a valid pool from this device.
    pub unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.allocate_command_buffers(allocate_info) }
    }

    /// # Safety
    /// `command_buffer` must not be pending execution.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.begin_command_buffer(command_buffer, begin_info) }
    }

    /// # Safety
    /// `command_buffer` must be recording.
    pub unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    /// # Safety
    /// `command_buffer` must not be pending and its pool must have been
    /// created with `RESET_COMMAND_BUFFER`.
    pub unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> Result<(), vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.reset_command_buffer(command_buffer, flags) }
    }

    /// A no-op when `command_buffers` is empty.
    ///
    /// # Safety
    /// All handles must come from `pool`, none may be pending and `pool`
    /// must be externally synchronized.
    pub unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        if command_buffers.is_empty() {
            return;
        }
        // SAFETY: per this function's contract.
        unsafe { self.handle.free_command_buffers(pool, command_buffers) }
    }
}

// Fences and semaphores
impl Device {
    /// # Safety
    /// `create_info` must be a valid fence create info.
    pub unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.create_fence(create_info, None) }
    }

    /// # Safety
    /// No GPU work may reference `fence`.
    pub unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// # Safety
    /// No fence in `fences` may be pending.
    pub unsafe fn reset_raw_fences(&self, fences: &[vk::Fence]) -> Result<(), vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.reset_fences(fences) }
    }

    /// # Safety
    /// `fence` must be a valid handle created from this device.
    pub unsafe fn get_raw_fence_status(&self, fence: vk::Fence) -> Result<bool, vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.get_fence_status(fence) }
    }

    /// # Safety
    /// `create_info` must be a valid semaphore create info.
    pub unsafe fn create_raw_semaphore(
        &self,
        create_info: &vk::SemaphoreCreateInfo<'_>,
    ) -> Result<vk::Semaphore, vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.create_semaphore(create_info, None) }
    }

    /// # Safety
    /// No GPU work may be waiting on or about to signal `semaphore`.
    pub unsafe fn destroy_raw_semaphore(&self, semaphore: vk::Semaphore) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.destroy_semaphore(semaphore, None) };
    }

    /// # Safety
    /// `semaphore` must be a valid timeline semaphore from this device.
    pub unsafe fn get_raw_semaphore_counter_value(
        &self,
        semaphore: vk::Semaphore,
    ) -> Result<u64, vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.get_semaphore_counter_value(semaphore) }
    }

    /// # Safety
    /// Every semaphore in `wait_info` must be a valid timeline semaphore
    /// from this device.
    pub unsafe fn wait_raw_semaphores(
        &self,
        wait_info: &vk::SemaphoreWaitInfo<'_>,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.wait_semaphores(wait_info, timeout_ns) }
    }
}

// Descriptor set layouts
impl Device {
    /// # Safety
    /// `create_info` must be valid for this device.
    pub unsafe fn create_raw_descriptor_set_layout(
        &self,
        create_info: &vk::DescriptorSetLayoutCreateInfo<'_>,
    ) -> Result<vk::DescriptorSetLayout, vk::Result> {
        // SAFETY: per this function's contract.
        unsafe { self.handle.create_descriptor_set_layout(create_info, None) }
    }

    /// # Safety
    /// `layout` must be a valid handle from this device.
    pub unsafe fn destroy_raw_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        // SAFETY: per this function's contract.
        unsafe { self.handle.destroy_descriptor_set_layout(layout, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use vk::QueueFlags as Q;

    fn family(flags: vk::QueueFlags, queue_count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count,
            ..Default::default()
        }
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let families = [
            family(Q::GRAPHICS | Q::COMPUTE | Q::TRANSFER, 1),
            family(Q::COMPUTE | Q::TRANSFER, 1),
            family(Q::TRANSFER, 1),
        ];
        assert_eq!(assign_families(&families, 0, QueueMode::Auto), [0, 1, 2]);
        assert_eq!(assign_families(&families, 0, QueueMode::Unified), [0, 0, 0]);
        assert_eq!(dedicated_family_count(&families), 2);
    }

    #[test]
    fn upload_falls_back_to_async_compute_then_graphics() {
        let families = [
            family(Q::GRAPHICS | Q::COMPUTE | Q::TRANSFER, 1),
            family(Q::COMPUTE | Q::TRANSFER, 1),
        ];
        assert_eq!(assign_families(&families, 0, QueueMode::Auto), [0, 1, 1]);

        let families = [family(Q::GRAPHICS | Q::COMPUTE | Q::TRANSFER, 1)];
        assert_eq!(assign_families(&families, 0, QueueMode::Auto), [0, 0, 0]);
        assert_eq!(dedicated_family_count(&families), 0);
    }

    #[test]
    fn unified_mode_spreads_over_available_queues() {
        let families = [family(Q::GRAPHICS | Q::COMPUTE | Q::TRANSFER, 2)];
        let (counts, indices) = plan_queues(&families, [0; 3], QueueMode::Unified);
        assert_eq!(counts.get(&0), Some(&2));
        // The third role wraps onto queue 0 and shares it with graphics.
        assert_eq!(indices, [0, 1, 0]);
    }

    #[test]
    fn single_mode_requests_one_queue() {
        let families = [family(Q::GRAPHICS | Q::COMPUTE | Q::TRANSFER, 16)];
        let (counts, indices) = plan_queues(&families, [0; 3], QueueMode::Single);
        assert_eq!(counts.into_iter().collect::<Vec<_>>(), vec![(0, 1)]);
        assert_eq!(indices, [0, 0, 0]);
    }

    #[test]
    fn separate_families_each_get_queue_zero() {
        let families = [
            family(Q::GRAPHICS | Q::COMPUTE | Q::TRANSFER, 1),
            family(Q::COMPUTE | Q::TRANSFER, 4),
            family(Q::TRANSFER, 2),
        ];
        let (counts, indices) = plan_queues(&families, [0, 1, 2], QueueMode::Auto);
        assert_eq!(counts.values().copied().collect::<Vec<_>>(), vec![1, 1, 1]);
        assert_eq!(indices, [0, 0, 0]);
    }

    #[test]
    fn device_type_ordering() {
        assert!(
            device_type_rank(vk::PhysicalDeviceType::DISCRETE_GPU)
                > device_type_rank(vk::PhysicalDeviceType::INTEGRATED_GPU)
        );
        assert!(
            device_type_rank(vk::PhysicalDeviceType::INTEGRATED_GPU)
                > device_type_rank(vk::PhysicalDeviceType::VIRTUAL_GPU)
        );
        assert_eq!(device_type_rank(vk::PhysicalDeviceType::CPU), 0);
    }
}
