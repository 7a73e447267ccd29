//! Headless Vulkan instance and physical device inspection.
//!
//! No surface or window-system extensions are requested. The only optional
//! instance features are the Khronos validation layer and
//! `VK_EXT_debug_utils`, enabled together when a [`VulkanLogLevel`] is
//! given and both are installed.

use std::ffi::{CStr, CString, c_char, c_void};

use ash::vk;
use thiserror::Error;

/// Timeline semaphores are core from 1.2 onwards.
pub const MIN_API_VERSION: ApiVersion = ApiVersion::new(1, 2, 0);

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";
const MESSENGER_TARGET: &str = "vkcore-debug-messenger";

/// Lowest validation message severity forwarded to `tracing`.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl VulkanLogLevel {
    fn severity_flags(self) -> vk::DebugUtilsMessageSeverityFlagsEXT {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Sev;
        let ladder = [
            (Self::Verbose, Sev::VERBOSE),
            (Self::Info, Sev::INFO),
            (Self::Warning, Sev::WARNING),
            (Self::Error, Sev::ERROR),
        ];
        ladder
            .into_iter()
            .filter(|&(level, _)| level >= self)
            .fold(Sev::empty(), |acc, (_, flag)| acc | flag)
    }
}

/// Vulkan version with the variant field dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ApiVersion {
    pub const V1_3: Self = Self::new(1, 3, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub fn from_raw(raw: u32) -> Self {
        Self::new(
            vk::api_version_major(raw),
            vk::api_version_minor(raw),
            vk::api_version_patch(raw),
        )
    }

    pub fn to_raw(self) -> u32 {
        vk::make_api_version(0, self.major, self.minor, self.patch)
    }

    /// Whether this version provides everything `required` does. Patch
    /// levels never add API.
    pub fn satisfies(self, required: ApiVersion) -> bool {
        (self.major, self.minor) >= (required.major, required.minor)
    }
}

impl std::fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

#[derive(Debug, Error)]
pub enum InstanceCreationError {
    #[error("Could not load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),
    #[error("Vulkan {found} is too old, 1.2 or newer is required")]
    UnsupportedVersion { found: ApiVersion },
    #[error("Vulkan error creating instance: {0}")]
    Vulkan(#[from] vk::Result),
    #[error("Application name contains a NUL byte")]
    InvalidAppName(#[from] std::ffi::NulError),
}

/// The properties device selection looks at.
#[derive(Debug, Clone)]
pub struct PhysicalDeviceInfo {
    pub handle: vk::PhysicalDevice,
    pub api_version: ApiVersion,
    pub properties: vk::PhysicalDeviceProperties,
    pub queue_families: Vec<vk::QueueFamilyProperties>,
    pub timeline_semaphore: bool,
    pub synchronization2: bool,
    pub dynamic_rendering: bool,
}

impl PhysicalDeviceInfo {
    pub fn name(&self) -> &CStr {
        self.properties
            .device_name_as_c_str()
            .unwrap_or(c"unknown")
    }
}

struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    handle: vk::DebugUtilsMessengerEXT,
}

impl Drop for DebugMessenger {
    fn drop(&mut self) {
        // SAFETY: the owning instance destroys the messenger before itself.
        unsafe { self.loader.destroy_debug_utils_messenger(self.handle, None) };
    }
}

/// The root Vulkan object. Everything derived from it holds an
/// `Arc<Instance>`.
pub struct Instance {
    // Outlives `handle`; the loader library must stay mapped.
    _entry: ash::Entry,
    handle: ash::Instance,
    messenger: Option<DebugMessenger>,
    version: ApiVersion,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .field("version", &self.version)
            .field("validation", &self.messenger.is_some())
            .finish()
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Destroying instance {:?}", self.handle.handle());
        drop(self.messenger.take());
        // SAFETY: every child object holds an Arc to this instance, so none
        // are left.
        unsafe { self.handle.destroy_instance(None) };
    }
}

unsafe extern "system" fn forward_validation_message(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    kind: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    // SAFETY: the loader hands us callback data that lives for the call.
    let data = unsafe { &*data };
    let text = |ptr: *const c_char| {
        if ptr.is_null() {
            std::borrow::Cow::Borrowed("")
        } else {
            // SAFETY: non-null strings in the callback data are
            // NUL-terminated and live for the call.
            unsafe { CStr::from_ptr(ptr) }.to_string_lossy()
        }
    };
    let id = text(data.p_message_id_name);
    let message = text(data.p_message);

    use vk::DebugUtilsMessageSeverityFlagsEXT as Sev;
    if severity.contains(Sev::ERROR) {
        tracing::error!(target: MESSENGER_TARGET, ?kind, %id, "{message}");
    } else if severity.contains(Sev::WARNING) {
        tracing::warn!(target: MESSENGER_TARGET, ?kind, %id, "{message}");
    } else if severity.contains(Sev::INFO) {
        tracing::info!(target: MESSENGER_TARGET, ?kind, %id, "{message}");
    } else {
        tracing::trace!(target: MESSENGER_TARGET, ?kind, %id, "{message}");
    }
    vk::FALSE
}

fn messenger_info<'a>(level: VulkanLogLevel) -> vk::DebugUtilsMessengerCreateInfoEXT<'a> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(level.severity_flags())
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(forward_validation_message))
}

/// Whether the validation layer and debug utils are both installed.
///
/// # Safety
/// `entry` must be a loaded Vulkan entry.
unsafe fn validation_available(entry: &ash::Entry) -> Result<bool, vk::Result> {
    // SAFETY: entry is loaded; None asks for loader-level extensions.
    let extensions = unsafe { entry.enumerate_instance_extension_properties(None) }?;
    // SAFETY: entry is loaded.
    let layers = unsafe { entry.enumerate_instance_layer_properties() }?;
    let has_debug_utils = extensions
        .iter()
        .any(|ext| ext.extension_name_as_c_str() == Ok(ash::ext::debug_utils::NAME));
    let has_layer = layers
        .iter()
        .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER));
    Ok(has_debug_utils && has_layer)
}

impl Instance {
    /// Load Vulkan and create a headless instance.
    ///
    /// With `validation` set, the Khronos validation layer is enabled when
    /// installed and its messages at or above that level go to `tracing`.
    ///
    /// # Safety
    /// Loads the system Vulkan loader, which runs arbitrary native code.
    pub unsafe fn new(
        app_name: impl AsRef<str>,
        validation: Option<VulkanLogLevel>,
    ) -> Result<Self, InstanceCreationError> {
        let app_name = CString::new(app_name.as_ref())?;
        // SAFETY: forwarded to the caller. `entry` is stored in the
        // instance and outlives every object created through it.
        let entry = unsafe { ash::Entry::load() }?;

        // SAFETY: entry is loaded. A 1.0 loader lacks the query entirely.
        let version = match unsafe { entry.try_enumerate_instance_version() }? {
            Some(raw) => ApiVersion::from_raw(raw),
            None => ApiVersion::new(1, 0, 0),
        };
        if !version.satisfies(MIN_API_VERSION) {
            return Err(InstanceCreationError::UnsupportedVersion { found: version });
        }

        let validation = match validation {
            // SAFETY: entry is loaded.
            Some(level) if unsafe { validation_available(&entry) }? => Some(level),
            Some(_) => {
                tracing::warn!(
                    "Validation requested but {VALIDATION_LAYER:?} or VK_EXT_debug_utils is not installed"
                );
                None
            }
            None => None,
        };

        let (layers, extensions): (Vec<*const c_char>, Vec<*const c_char>) = match validation {
            Some(_) => (
                vec![VALIDATION_LAYER.as_ptr()],
                vec![ash::ext::debug_utils::NAME.as_ptr()],
            ),
            None => (Vec::new(), Vec::new()),
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"vkcore")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(version.to_raw());
        // Chained into instance creation so creation-time messages are
        // reported too.
        let mut creation_messages = validation.map(messenger_info);
        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);
        if let Some(info) = creation_messages.as_mut() {
            create_info = create_info.push_next(info);
        }

        // SAFETY: create_info only borrows locals that outlive the call.
        let handle = unsafe { entry.create_instance(&create_info, None) }?;

        let messenger = validation.and_then(|level| {
            let loader = ash::ext::debug_utils::Instance::new(&entry, &handle);
            // SAFETY: debug utils was enabled on `handle` above.
            match unsafe { loader.create_debug_utils_messenger(&messenger_info(level), None) } {
                Ok(handle) => Some(DebugMessenger { loader, handle }),
                Err(e) => {
                    tracing::error!("Validation messenger unavailable: {e}");
                    None
                }
            }
        });

        tracing::info!(
            "Created Vulkan {version} instance (validation: {})",
            messenger.is_some()
        );
        Ok(Self {
            _entry: entry,
            handle,
            messenger,
            version,
        })
    }

    pub fn version(&self) -> ApiVersion {
        self.version
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }

    /// Whether debug-utils object names will reach a debugger.
    pub fn debug_utils_enabled(&self) -> bool {
        self.messenger.is_some()
    }

    /// Physical device handles. They are only meaningful to this instance.
    pub fn physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>, vk::Result> {
        // SAFETY: the instance is live.
        unsafe { self.handle.enumerate_physical_devices() }
    }

    /// Gather everything device selection needs in one query.
    ///
    /// # Safety
    /// `physical_device` must come from [`physical_devices`](Self::physical_devices).
    pub unsafe fn describe_physical_device(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> PhysicalDeviceInfo {
        // SAFETY: physical_device belongs to this instance.
        let properties = unsafe { self.handle.get_physical_device_properties(physical_device) };
        // SAFETY: as above.
        let queue_families = unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        };
        let api_version = ApiVersion::from_raw(properties.api_version);

        let mut timeline = vk::PhysicalDeviceTimelineSemaphoreFeatures::default();
        let mut sync2 = vk::PhysicalDeviceSynchronization2Features::default();
        let mut rendering = vk::PhysicalDeviceDynamicRenderingFeatures::default();
        let mut features = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut timeline)
            .push_next(&mut sync2)
            .push_next(&mut rendering);
        // SAFETY: physical_device belongs to this instance. Drivers leave
        // unknown structures in the chain zeroed.
        unsafe {
            self.handle
                .get_physical_device_features2(physical_device, &mut features)
        };

        PhysicalDeviceInfo {
            handle: physical_device,
            api_version,
            properties,
            queue_families,
            timeline_semaphore: timeline.timeline_semaphore == vk::TRUE,
            synchronization2: sync2.synchronization2 == vk::TRUE,
            dynamic_rendering: rendering.dynamic_rendering == vk::TRUE,
        }
    }

    /// # Safety
    /// `physical_device` must come from [`physical_devices`](Self::physical_devices).
    pub unsafe fn memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        // SAFETY: physical_device belongs to this instance.
        unsafe {
            self.handle
                .get_physical_device_memory_properties(physical_device)
        }
    }

    /// Names of the device extensions `physical_device` exposes.
    ///
    /// # Safety
    /// `physical_device` must come from [`physical_devices`](Self::physical_devices).
    pub unsafe fn device_extensions(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<CString>, vk::Result> {
        // SAFETY: physical_device belongs to this instance.
        let properties = unsafe {
            self.handle
                .enumerate_device_extension_properties(physical_device)
        }?;
        Ok(properties
            .iter()
            .filter_map(|ext| ext.extension_name_as_c_str().ok())
            .map(CStr::to_owned)
            .collect())
    }

    /// # Safety
    /// `physical_device` must come from this instance and `create_info`
    /// must be valid for it.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        // SAFETY: forwarded to the caller.
        unsafe { self.handle.create_device(physical_device, create_info, None) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_version_fields() {
        let version = ApiVersion::from_raw(vk::make_api_version(0, 1, 3, 275));
        assert_eq!(version, ApiVersion::new(1, 3, 275));
        assert_eq!(version.to_string(), "1.3.275");
        assert_eq!(ApiVersion::from_raw(version.to_raw()), version);
    }

    #[test]
    fn minimum_version_ignores_patch() {
        assert!(ApiVersion::new(1, 2, 0).satisfies(MIN_API_VERSION));
        assert!(ApiVersion::new(1, 3, 0).satisfies(MIN_API_VERSION));
        assert!(!ApiVersion::new(1, 1, 999).satisfies(MIN_API_VERSION));
        assert!(!ApiVersion::new(1, 2, 196).satisfies(ApiVersion::V1_3));
    }

    #[test]
    fn log_levels_include_more_severe() {
        use vk::DebugUtilsMessageSeverityFlagsEXT as Sev;
        assert_eq!(
            VulkanLogLevel::Verbose.severity_flags(),
            Sev::VERBOSE | Sev::INFO | Sev::WARNING | Sev::ERROR
        );
        assert_eq!(
            VulkanLogLevel::Warning.severity_flags(),
            Sev::WARNING | Sev::ERROR
        );
        assert_eq!(VulkanLogLevel::Error.severity_flags(), Sev::ERROR);
    }
}
