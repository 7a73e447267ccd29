//! Completion tracking: one [`Fence`] per pooled command buffer and one
//! [`TimelineSemaphore`] per queue.
//!
//! The fence answers "has this particular command buffer retired?" so the
//! context can recycle it and release the resources it referenced. The
//! timeline orders submissions across queues: a submission signals the
//! next value on its own queue and waits on the last signalled value of
//! every queue it depends on.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
#[error("Vulkan error creating {kind}: {result}")]
pub struct CreateSyncError {
    kind: &'static str,
    result: vk::Result,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("Wait timed out")]
    Timeout,
    #[error("Vulkan error while waiting: {0}")]
    Vulkan(vk::Result),
}

impl WaitError {
    pub fn result(self) -> vk::Result {
        match self {
            Self::Timeout => vk::Result::TIMEOUT,
            Self::Vulkan(result) => result,
        }
    }
}

impl From<vk::Result> for WaitError {
    fn from(result: vk::Result) -> Self {
        if result == vk::Result::TIMEOUT {
            Self::Timeout
        } else {
            Self::Vulkan(result)
        }
    }
}

/// A binary fence that knows whether a submission will signal it.
///
/// Created unsignalled. [`arm`](Self::arm) after handing it to a queue
/// submission, [`disarm`](Self::disarm) once the work has retired.
pub struct Fence {
    device: Arc<Device>,
    handle: vk::Fence,
    armed: bool,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .field("armed", &self.armed)
            .finish_non_exhaustive()
    }
}

impl Fence {
    pub fn new(device: &Arc<Device>, name: Option<&str>) -> Result<Self, CreateSyncError> {
        let create_info = vk::FenceCreateInfo::default();
        // SAFETY: default create info, no pNext chain.
        let handle = unsafe { device.create_raw_fence(&create_info) }.map_err(|result| {
            CreateSyncError {
                kind: "fence",
                result,
            }
        })?;
        device.name_or_warn(handle, name);
        Ok(Self {
            device: Arc::clone(device),
            handle,
            armed: false,
        })
    }

    pub fn raw_fence(&self) -> vk::Fence {
        self.handle
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Record that a submission now owns the fence.
    ///
    /// # Safety
    /// The fence must have been passed to a queue submission that was
    /// accepted by the driver.
    pub unsafe fn arm(&mut self) {
        debug_assert!(!self.armed, "fence {:?} armed twice", self.handle);
        self.armed = true;
    }

    /// Non-blocking status query. An unarmed fence never signals.
    pub fn poll(&self) -> Result<bool, vk::Result> {
        if !self.armed {
            return Ok(false);
        }
        // SAFETY: handle is a live fence of `device`.
        unsafe { self.device.get_raw_fence_status(self.handle) }
    }

    /// Return the fence to the unsignalled, unarmed state.
    ///
    /// # Safety
    /// The submission that signals the fence must have completed.
    pub unsafe fn disarm(&mut self) -> Result<(), vk::Result> {
        if self.armed {
            // SAFETY: caller guarantees the fence is no longer pending.
            unsafe { self.device.reset_raw_fences(&[self.handle]) }?;
            self.armed = false;
        }
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::trace!("Destroying fence {:?}", self.handle);
        // SAFETY: owners only drop fences whose submission has retired or
        // that were never submitted.
        unsafe { self.device.destroy_raw_fence(self.handle) };
    }
}

/// Monotonic per-queue counter. Starts at zero; only the owning queue
/// signals it.
pub struct TimelineSemaphore {
    device: Arc<Device>,
    handle: vk::Semaphore,
}

impl std::fmt::Debug for TimelineSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("TimelineSemaphore")
            .field(&self.handle)
            .finish()
    }
}

impl TimelineSemaphore {
    pub fn new(device: &Arc<Device>, name: Option<&str>) -> Result<Self, CreateSyncError> {
        let mut timeline = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(0);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut timeline);
        // SAFETY: timeline semaphores are a hard requirement of device
        // selection, and the only chained struct is the type info above.
        let handle = unsafe { device.create_raw_semaphore(&create_info) }.map_err(|result| {
            CreateSyncError {
                kind: "timeline semaphore",
                result,
            }
        })?;
        device.name_or_warn(handle, name);
        Ok(Self {
            device: Arc::clone(device),
            handle,
        })
    }

    pub fn raw_semaphore(&self) -> vk::Semaphore {
        self.handle
    }

    /// Highest value the GPU has signalled so far.
    pub fn completed_value(&self) -> Result<u64, vk::Result> {
        // SAFETY: handle is a live timeline semaphore of `device`.
        unsafe { self.device.get_raw_semaphore_counter_value(self.handle) }
    }

    pub fn wait(&self, value: u64, timeout_ns: u64) -> Result<(), WaitError> {
        let _span = tracing::debug_span!("timeline_wait", value).entered();
        let handles = [self.handle];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&handles)
            .values(&values);
        // SAFETY: handle is a live timeline semaphore of `device`.
        unsafe { self.device.wait_raw_semaphores(&wait_info, timeout_ns) }.map_err(WaitError::from)
    }
}

impl Drop for TimelineSemaphore {
    fn drop(&mut self) {
        tracing::trace!("Destroying timeline semaphore {:?}", self.handle);
        // SAFETY: the context idles the device before its queues go away.
        unsafe { self.device.destroy_raw_semaphore(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_result_maps_to_timeout() {
        assert_eq!(WaitError::from(vk::Result::TIMEOUT), WaitError::Timeout);
        assert_eq!(
            WaitError::from(vk::Result::ERROR_DEVICE_LOST),
            WaitError::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        );
        assert_eq!(WaitError::Timeout.result(), vk::Result::TIMEOUT);
    }
}
