//! Instance, surface and physical device selection.
//!
//! Everything the logical device is created from lives in an explicit
//! [`InitContext`]; nothing is loaded into global state.

use crate::backend::traits::*;
use ash::khr::surface;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::ffi::{CStr, CString};

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Formats the render graphs attach, with the features they need
const REQUIRED_FORMATS: &[(vk::Format, vk::FormatFeatureFlags)] = &[
    (
        vk::Format::D32_SFLOAT_S8_UINT,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
    ),
    (
        vk::Format::D32_SFLOAT,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
    ),
    (
        vk::Format::R32G32B32A32_SFLOAT,
        vk::FormatFeatureFlags::COLOR_ATTACHMENT,
    ),
    (
        vk::Format::R32_SFLOAT,
        vk::FormatFeatureFlags::COLOR_ATTACHMENT,
    ),
];

/// Loader, instance, surface and the chosen physical device
pub struct InitContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub surface_fn: surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: u32,
    pub device_name: String,
    pub debug: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl InitContext {
    /// Load Vulkan, create an instance and a surface for `window`, and pick a
    /// physical device that can render to it.
    ///
    /// The window must outlive the device created from this context.
    pub fn new<W>(window: &W, app_name: &str, validation: bool) -> BackendResult<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| BackendError::InitializationFailed(format!("Vulkan loader: {}", e)))?;

        let display_handle = window
            .display_handle()
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?
            .as_raw();
        let window_handle = window
            .window_handle()
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?
            .as_raw();

        let validation = validation && validation_layer_available(&entry);
        let instance = create_instance(&entry, display_handle, app_name, validation)?;

        let debug = if validation {
            let debug_utils = ash::ext::debug_utils::Instance::new(&entry, &instance);
            match create_debug_messenger(&debug_utils) {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(e) => {
                    log::warn!("Validation output unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let surface_fn = surface::Instance::new(&entry, &instance);
        let surface = match unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        } {
            Ok(surface) => surface,
            Err(e) => {
                destroy_instance(&instance, debug.as_ref());
                return Err(BackendError::SurfaceCreationFailed(e.to_string()));
            }
        };

        let mut context = Self {
            entry,
            instance,
            surface_fn,
            surface,
            physical_device: vk::PhysicalDevice::null(),
            queue_family: 0,
            device_name: String::new(),
            debug,
        };

        match context.select_physical_device() {
            Ok(()) => Ok(context),
            Err(e) => {
                context.destroy();
                Err(e)
            }
        }
    }

    /// Prefer discrete GPUs among those passing [`check_device`].
    fn select_physical_device(&mut self) -> BackendResult<()> {
        let devices = unsafe { self.instance.enumerate_physical_devices() }
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
        if devices.is_empty() {
            return Err(BackendError::InitializationFailed(
                "no Vulkan-capable GPU found".into(),
            ));
        }

        let mut best: Option<(u32, vk::PhysicalDevice, u32, String)> = None;
        let mut last_missing = None;
        for device in devices {
            let properties = unsafe { self.instance.get_physical_device_properties(device) };
            let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
                .to_string_lossy()
                .into_owned();

            let queue_family = match self.check_device(device) {
                Ok(family) => family,
                Err(e) => {
                    log::info!("Skipping GPU {}: {}", name, e);
                    last_missing = Some(e);
                    continue;
                }
            };

            let score = match properties.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };
            log::info!(
                "Found GPU: {} ({:?}, score {})",
                name,
                properties.device_type,
                score
            );
            if best.as_ref().map_or(true, |(s, ..)| score > *s) {
                best = Some((score, device, queue_family, name));
            }
        }

        let Some((_, device, queue_family, name)) = best else {
            return Err(last_missing.unwrap_or_else(|| {
                BackendError::InitializationFailed("no suitable GPU found".into())
            }));
        };
        log::info!("Using GPU {} (queue family {})", name, queue_family);
        self.physical_device = device;
        self.queue_family = queue_family;
        self.device_name = name;
        Ok(())
    }

    /// Return the graphics+present queue family, or the missing capability.
    fn check_device(&self, device: vk::PhysicalDevice) -> BackendResult<u32> {
        let extensions = unsafe { self.instance.enumerate_device_extension_properties(device) }
            .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
        let has_swapchain = extensions.iter().any(|ext| {
            (unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }) == ash::khr::swapchain::NAME
        });
        if !has_swapchain {
            return Err(BackendError::MissingFeature(format!(
                "device extension {:?}",
                ash::khr::swapchain::NAME
            )));
        }

        let families = unsafe {
            self.instance
                .get_physical_device_queue_family_properties(device)
        };
        let queue_family = families
            .iter()
            .enumerate()
            .find(|(index, family)| {
                family.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                    && unsafe {
                        self.surface_fn.get_physical_device_surface_support(
                            device,
                            *index as u32,
                            self.surface,
                        )
                    }
                    .unwrap_or(false)
            })
            .map(|(index, _)| index as u32)
            .ok_or_else(|| {
                BackendError::MissingFeature("queue family with graphics and present".into())
            })?;

        for (format, features) in REQUIRED_FORMATS {
            let properties = unsafe {
                self.instance
                    .get_physical_device_format_properties(device, *format)
            };
            if !properties.optimal_tiling_features.contains(*features) {
                return Err(BackendError::MissingFeature(format!(
                    "{:?} with optimal-tiling {:?}",
                    format, features
                )));
            }
        }

        Ok(queue_family)
    }

    /// Destroy the surface, messenger and instance. No device may exist.
    pub fn destroy(self) {
        unsafe {
            self.surface_fn.destroy_surface(self.surface, None);
        }
        destroy_instance(&self.instance, self.debug.as_ref());
    }
}

fn destroy_instance(
    instance: &ash::Instance,
    debug: Option<&(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
) {
    unsafe {
        if let Some((debug_utils, messenger)) = debug {
            debug_utils.destroy_debug_utils_messenger(*messenger, None);
        }
        instance.destroy_instance(None);
    }
}

fn validation_layer_available(entry: &ash::Entry) -> bool {
    let layers = match unsafe { entry.enumerate_instance_layer_properties() } {
        Ok(layers) => layers,
        Err(_) => return false,
    };
    let available = layers.iter().any(|layer| {
        (unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) }) == VALIDATION_LAYER_NAME
    });
    if !available {
        log::warn!("Validation layers requested but not available");
    }
    available
}

fn create_instance(
    entry: &ash::Entry,
    display_handle: raw_window_handle::RawDisplayHandle,
    app_name: &str,
    validation: bool,
) -> BackendResult<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| BackendError::InitializationFailed(e.to_string()))?;
    let engine_name = c"lightfield-renderer";

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_2);

    let mut extensions = ash_window::enumerate_required_extensions(display_handle)
        .map_err(|e| BackendError::MissingFeature(format!("surface extensions: {}", e)))?
        .to_vec();
    if validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    #[allow(unused_mut)]
    let mut flags = vk::InstanceCreateFlags::empty();
    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }

    let layers = if validation {
        vec![VALIDATION_LAYER_NAME.as_ptr()]
    } else {
        Vec::new()
    };

    let create_info = vk::InstanceCreateInfo::default()
        .flags(flags)
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    unsafe { entry.create_instance(&create_info, None) }
        .map_err(|e| BackendError::InitializationFailed(format!("instance: {:?}", e)))
}

fn create_debug_messenger(
    debug_utils: &ash::ext::debug_utils::Instance,
) -> BackendResult<vk::DebugUtilsMessengerEXT> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
        .map_err(|e| BackendError::InitializationFailed(format!("debug messenger: {:?}", e)))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: the driver passes either null or a valid callback struct whose
    // message is a null-terminated string.
    let message = if callback_data.is_null() || unsafe { (*callback_data).p_message.is_null() } {
        String::from("(no message)")
    } else {
        unsafe { CStr::from_ptr((*callback_data).p_message) }
            .to_string_lossy()
            .into_owned()
    };

    match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan {:?}] {}", message_type, message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan {:?}] {}", message_type, message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::debug!("[Vulkan {:?}] {}", message_type, message)
        }
        _ => log::trace!("[Vulkan {:?}] {}", message_type, message),
    }

    vk::FALSE
}
