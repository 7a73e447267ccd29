//! Device memory allocator facade.
//!
//! [`MemoryAllocator`] sits between the resource managers and
//! `gpu-allocator`. It picks a Vulkan memory type per [`MemoryUsage`],
//! pads non-coherent host-visible allocations to the device's
//! `nonCoherentAtomSize`, and hands back a [`DeviceAllocation`] exposing
//! the `(memory, offset)` pair the resource binds to.
//!
//! The facade is created once per [`Device`](crate::device::Device) and
//! dropped before the logical device is destroyed.

use std::ptr::NonNull;
use std::sync::Mutex;

use ash::vk;
use gpu_allocator::{
    AllocationError, MemoryLocation,
    vulkan::{
        Allocation, AllocationCreateDesc, AllocationScheme, Allocator,
        AllocatorCreateDesc,
    },
};

/// Describes how an allocation will be accessed by CPU and GPU.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryUsage {
    /// GPU-only storage. Highest bandwidth; not CPU-mappable.
    GpuOnly,
    /// CPU-writable, GPU-readable. Dynamic resources and upload staging.
    CpuToGpu,
    /// GPU-writable, CPU-readable. Staging for read-back.
    GpuToCpu,
}

impl MemoryUsage {
    fn location(self) -> MemoryLocation {
        match self {
            MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
            MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
            MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
        }
    }
}

/// Score a memory type for a given usage; `None` if incompatible.
/// Higher scores are more preferred.
pub(crate) fn score_memory_type(
    flags: vk::MemoryPropertyFlags,
    usage: MemoryUsage,
) -> Option<u32> {
    use vk::MemoryPropertyFlags as F;
    let device_local = flags.contains(F::DEVICE_LOCAL);
    let host_visible = flags.contains(F::HOST_VISIBLE);
    let host_cached = flags.contains(F::HOST_CACHED);
    match usage {
        MemoryUsage::GpuOnly => {
            device_local.then_some(if host_visible { 1 } else { 2 })
        }
        MemoryUsage::CpuToGpu => {
            host_visible.then_some(if device_local { 2 } else { 1 })
        }
        MemoryUsage::GpuToCpu => {
            host_visible.then_some(if host_cached { 2 } else { 1 })
        }
    }
}

/// Best memory type index for `requirements` and `usage`. Ties go to the
/// lowest index.
pub(crate) fn select_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    requirements: vk::MemoryRequirements,
    usage: MemoryUsage,
) -> Option<u32> {
    properties.memory_types[..properties.memory_type_count as usize]
        .iter()
        .enumerate()
        .filter(|(i, _)| requirements.memory_type_bits & (1 << i) != 0)
        .filter_map(|(i, ty)| {
            score_memory_type(ty.property_flags, usage).map(|s| (i as u32, s))
        })
        .max_by(|(i1, s1), (i2, s2)| s1.cmp(s2).then(i2.cmp(i1)))
        .map(|(i, _)| i)
}

/// Narrow `requirements` to the selected type and round size/alignment to
/// `atom` when that type is host-visible but not coherent.
fn padded_requirements(
    properties: &vk::PhysicalDeviceMemoryProperties,
    requirements: vk::MemoryRequirements,
    usage: MemoryUsage,
    atom: vk::DeviceSize,
) -> vk::MemoryRequirements {
    let Some(idx) = select_memory_type(properties, requirements, usage) else {
        return requirements;
    };
    use vk::MemoryPropertyFlags as F;
    let flags = properties.memory_types[idx as usize].property_flags;
    let non_coherent_visible =
        flags.contains(F::HOST_VISIBLE) && !flags.contains(F::HOST_COHERENT);
    let (size, alignment) = if non_coherent_visible {
        (
            requirements.size.div_ceil(atom) * atom,
            requirements.alignment.max(atom),
        )
    } else {
        (requirements.size, requirements.alignment)
    };
    vk::MemoryRequirements {
        size,
        alignment,
        memory_type_bits: 1 << idx,
    }
}

/// Device memory backing one buffer or image.
///
/// Host-visible allocations are persistently mapped by `gpu-allocator`.
#[derive(Debug)]
pub struct DeviceAllocation {
    inner: Allocation,
    flags: vk::MemoryPropertyFlags,
}

impl DeviceAllocation {
    /// # Safety
    /// The returned handle is only valid while this allocation is alive.
    pub unsafe fn memory(&self) -> vk::DeviceMemory {
        // SAFETY: Caller keeps the allocation alive while using the handle.
        unsafe { self.inner.memory() }
    }

    pub fn offset(&self) -> vk::DeviceSize {
        self.inner.offset()
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.inner.size()
    }

    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.inner.mapped_ptr().map(NonNull::cast)
    }

    pub fn is_host_visible(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_coherent(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

pub struct MemoryAllocator {
    inner: Mutex<Allocator>,
    properties: vk::PhysicalDeviceMemoryProperties,
    atom: vk::DeviceSize,
}

impl std::fmt::Debug for MemoryAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAllocator")
            .field("atom", &self.atom)
            .finish_non_exhaustive()
    }
}

impl MemoryAllocator {
    pub fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        properties: vk::PhysicalDeviceMemoryProperties,
        atom: vk::DeviceSize,
    ) -> Result<Self, AllocationError> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })?;
        Ok(Self {
            inner: Mutex::new(allocator),
            properties,
            atom,
        })
    }

    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.atom
    }

    /// Allocate device memory for the given requirements.
    pub fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<DeviceAllocation, AllocationError> {
        let requirements =
            padded_requirements(&self.properties, requirements, usage, self.atom);
        let inner = self
            .inner
            .lock()
            .expect("allocator lock poisoned")
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: usage.location(),
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })?;
        let flags = inner.memory_properties();
        Ok(DeviceAllocation { inner, flags })
    }

    pub fn free(&self, allocation: DeviceAllocation) -> Result<(), AllocationError> {
        self.inner
            .lock()
            .expect("allocator lock poisoned")
            .free(allocation.inner)
    }

    /// Byte range to flush or invalidate so that `[offset, offset + len)`
    /// of `allocation` is covered at atom granularity.
    pub fn atom_range(
        &self,
        allocation: &DeviceAllocation,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> (vk::DeviceSize, vk::DeviceSize) {
        atom_aligned_range(
            allocation.offset(),
            allocation.size(),
            offset,
            len,
            self.atom,
        )
    }
}

/// `(memory offset, size)` covering `[offset, offset + len)` inside an
/// allocation that starts at `base` and spans `alloc_size` bytes.
pub(crate) fn atom_aligned_range(
    base: vk::DeviceSize,
    alloc_size: vk::DeviceSize,
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
    atom: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let start = base + offset;
    let aligned_start = start / atom * atom;
    let end = (start + len).div_ceil(atom) * atom;
    let alloc_end = base + alloc_size;
    (aligned_start, end.min(alloc_end) - aligned_start)
}

fn mapped_range(
    device: &crate::device::Device,
    allocation: &DeviceAllocation,
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
) -> Option<vk::MappedMemoryRange<'static>> {
    if !allocation.is_host_visible() || allocation.is_coherent() || len == 0 {
        return None;
    }
    let (start, size) = device.allocator().atom_range(allocation, offset, len);
    Some(
        vk::MappedMemoryRange::default()
            // SAFETY: the range is used while the allocation is borrowed.
            .memory(unsafe { allocation.memory() })
            .offset(start)
            .size(size),
    )
}

/// Make host writes to `[offset, offset + len)` visible to the device.
/// A no-op on coherent memory.
pub(crate) fn flush_mapped(
    device: &crate::device::Device,
    allocation: &DeviceAllocation,
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
) -> Result<(), vk::Result> {
    match mapped_range(device, allocation, offset, len) {
        // SAFETY: the range is atom aligned and inside the allocation.
        Some(range) => unsafe { device.flush_raw_mapped_memory_ranges(&[range]) },
        None => Ok(()),
    }
}

/// Make device writes to `[offset, offset + len)` visible to the host.
pub(crate) fn invalidate_mapped(
    device: &crate::device::Device,
    allocation: &DeviceAllocation,
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
) -> Result<(), vk::Result> {
    match mapped_range(device, allocation, offset, len) {
        // SAFETY: the range is atom aligned and inside the allocation.
        Some(range) => unsafe { device.invalidate_raw_mapped_memory_ranges(&[range]) },
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, flags) in types.iter().enumerate() {
            props.memory_types[i].property_flags = *flags;
        }
        props
    }

    fn reqs(bits: u32) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size: 100,
            alignment: 4,
            memory_type_bits: bits,
        }
    }

    use vk::MemoryPropertyFlags as F;

    #[test]
    fn gpu_only_prefers_pure_vram() {
        let p = props(&[
            F::DEVICE_LOCAL | F::HOST_VISIBLE,
            F::DEVICE_LOCAL,
            F::HOST_VISIBLE | F::HOST_COHERENT,
        ]);
        assert_eq!(select_memory_type(&p, reqs(0b111), MemoryUsage::GpuOnly), Some(1));
        assert_eq!(select_memory_type(&p, reqs(0b101), MemoryUsage::GpuOnly), Some(0));
        assert_eq!(select_memory_type(&p, reqs(0b100), MemoryUsage::GpuOnly), None);
    }

    #[test]
    fn readback_prefers_cached() {
        let p = props(&[
            F::HOST_VISIBLE | F::HOST_COHERENT,
            F::HOST_VISIBLE | F::HOST_CACHED,
        ]);
        assert_eq!(select_memory_type(&p, reqs(0b11), MemoryUsage::GpuToCpu), Some(1));
        assert_eq!(select_memory_type(&p, reqs(0b11), MemoryUsage::CpuToGpu), Some(0));
    }

    #[test]
    fn non_coherent_types_are_padded_to_atom() {
        let p = props(&[F::HOST_VISIBLE]);
        let padded = padded_requirements(&p, reqs(1), MemoryUsage::CpuToGpu, 64);
        assert_eq!(padded.size, 128);
        assert_eq!(padded.alignment, 64);
        assert_eq!(padded.memory_type_bits, 1);

        let p = props(&[F::HOST_VISIBLE | F::HOST_COHERENT]);
        let plain = padded_requirements(&p, reqs(1), MemoryUsage::CpuToGpu, 64);
        assert_eq!(plain.size, 100);
    }

    #[test]
    fn atom_range_stays_inside_allocation() {
        assert_eq!(atom_aligned_range(256, 256, 10, 20, 64), (256, 64));
        assert_eq!(atom_aligned_range(256, 100, 70, 30, 64), (320, 36));
    }
}
