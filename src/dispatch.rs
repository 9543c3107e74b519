//! Loader-facing dispatch
//!
//! Implements the loader-layer interface: version negotiation, the two
//! proc-addr routers, and the `extern "system"` entry points for the
//! intercepted operations. The routers answer for the fixed intercepted set
//! and delegate every other name to the next layer's resolver; when the next
//! layer never exposed an intercepted name for a device, the query passes
//! through untouched so that operation degrades to plain forwarding instead
//! of an interposed call with nothing to call into.

use ash::vk;
use log::{debug, error};
use std::ffi::CStr;
use std::os::raw::{c_char, c_void};

use crate::registry::DeviceContext;
use crate::state;
use crate::{device, instance, sampler, swapchain};

pub const LOADER_INSTANCE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(47);
pub const LOADER_DEVICE_CREATE_INFO: vk::StructureType = vk::StructureType::from_raw(48);
pub const LAYER_LINK_INFO: u32 = 0;

#[repr(C)]
pub struct VkLayerInstanceLink {
    pub p_next: *mut VkLayerInstanceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_phys_dev_proc_addr: Option<unsafe extern "system" fn()>,
}

#[repr(C)]
pub struct VkLayerInstanceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: u32,
    pub u_layer_info: *mut VkLayerInstanceLink,
}

#[repr(C)]
pub struct VkLayerDeviceLink {
    pub p_next: *mut VkLayerDeviceLink,
    pub pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pub pfn_next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
pub struct VkLayerDeviceCreateInfo {
    pub s_type: vk::StructureType,
    pub p_next: *const c_void,
    pub function: u32,
    pub u_layer_info: *mut VkLayerDeviceLink,
}

/// Reinterpret a resolver-returned void function as a typed entry point.
/// `T` must be an `unsafe extern "system"` function pointer type.
pub(crate) unsafe fn cast_pfn<T>(raw: vk::PFN_vkVoidFunction) -> Option<T> {
    raw.map(|f| std::mem::transmute_copy(&f))
}

pub(crate) unsafe fn find_instance_link(mut p: *const c_void) -> Option<*mut VkLayerInstanceLink> {
    while !p.is_null() {
        let base = &*(p as *const vk::BaseInStructure);
        if base.s_type == LOADER_INSTANCE_CREATE_INFO {
            let info = &*(p as *const VkLayerInstanceCreateInfo);
            if info.function == LAYER_LINK_INFO && !info.u_layer_info.is_null() {
                return Some(info.u_layer_info);
            }
        }
        p = base.p_next as *const c_void;
    }
    None
}

/// Advance the loader's link info so the next layer in the chain sees its
/// own element when the forwarded create call walks the same structure.
pub(crate) unsafe fn advance_instance_link(mut p: *const c_void) {
    while !p.is_null() {
        let base = &*(p as *const vk::BaseInStructure);
        if base.s_type == LOADER_INSTANCE_CREATE_INFO {
            let info = &mut *(p as *mut VkLayerInstanceCreateInfo);
            if info.function == LAYER_LINK_INFO {
                info.u_layer_info = (*info.u_layer_info).p_next;
                return;
            }
        }
        p = base.p_next as *const c_void;
    }
}

pub(crate) unsafe fn find_device_link(mut p: *const c_void) -> Option<*mut VkLayerDeviceLink> {
    while !p.is_null() {
        let base = &*(p as *const vk::BaseInStructure);
        if base.s_type == LOADER_DEVICE_CREATE_INFO {
            let info = &*(p as *const VkLayerDeviceCreateInfo);
            if info.function == LAYER_LINK_INFO && !info.u_layer_info.is_null() {
                return Some(info.u_layer_info);
            }
        }
        p = base.p_next as *const c_void;
    }
    None
}

pub(crate) unsafe fn advance_device_link(mut p: *const c_void) {
    while !p.is_null() {
        let base = &*(p as *const vk::BaseInStructure);
        if base.s_type == LOADER_DEVICE_CREATE_INFO {
            let info = &mut *(p as *mut VkLayerDeviceCreateInfo);
            if info.function == LAYER_LINK_INFO {
                info.u_layer_info = (*info.u_layer_info).p_next;
                return;
            }
        }
        p = base.p_next as *const c_void;
    }
}

// ── Loader negotiation ──────────────────────────────────────────────────────

#[repr(C)]
pub struct VkNegotiateLayerInterface {
    pub s_type: u32,
    pub p_next: *mut c_void,
    pub loader_layer_interface_version: u32,
    pub pfn_get_instance_proc_addr: *const c_void,
    pub pfn_get_device_proc_addr: *const c_void,
    pub pfn_get_physical_device_proc_addr: *const c_void,
}

pub const LOADER_LAYER_INTERFACE_VERSION: u32 = 2;

#[no_mangle]
pub unsafe extern "system" fn vkNegotiateLoaderLayerInterfaceVersion(
    p_interface: *mut VkNegotiateLayerInterface,
) -> vk::Result {
    crate::init();

    if p_interface.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    let interface = &mut *p_interface;
    if interface.loader_layer_interface_version < LOADER_LAYER_INTERFACE_VERSION {
        error!(
            "Loader layer interface v{} is too old",
            interface.loader_layer_interface_version
        );
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }

    interface.loader_layer_interface_version = LOADER_LAYER_INTERFACE_VERSION;
    interface.pfn_get_instance_proc_addr = vkpace_GetInstanceProcAddr as *const c_void;
    interface.pfn_get_device_proc_addr = vkpace_GetDeviceProcAddr as *const c_void;
    interface.pfn_get_physical_device_proc_addr = std::ptr::null();
    vk::Result::SUCCESS
}

// ── Proc-addr routers ───────────────────────────────────────────────────────

fn instance_level_hook(name: &[u8]) -> vk::PFN_vkVoidFunction {
    unsafe {
        match name {
            b"vkGetInstanceProcAddr" => Some(std::mem::transmute(
                vkpace_GetInstanceProcAddr as vk::PFN_vkGetInstanceProcAddr,
            )),
            b"vkCreateInstance" => Some(std::mem::transmute(
                vkpace_CreateInstance as vk::PFN_vkCreateInstance,
            )),
            b"vkDestroyInstance" => Some(std::mem::transmute(
                vkpace_DestroyInstance as vk::PFN_vkDestroyInstance,
            )),
            b"vkCreateDevice" => Some(std::mem::transmute(
                vkpace_CreateDevice as vk::PFN_vkCreateDevice,
            )),
            b"vkEnumerateInstanceLayerProperties" => Some(std::mem::transmute(
                vkpace_EnumerateInstanceLayerProperties as vk::PFN_vkEnumerateInstanceLayerProperties,
            )),
            b"vkEnumerateInstanceExtensionProperties" => Some(std::mem::transmute(
                vkpace_EnumerateInstanceExtensionProperties
                    as vk::PFN_vkEnumerateInstanceExtensionProperties,
            )),
            _ => None,
        }
    }
}

fn device_level_hook(name: &[u8]) -> vk::PFN_vkVoidFunction {
    unsafe {
        match name {
            b"vkGetDeviceProcAddr" => Some(std::mem::transmute(
                vkpace_GetDeviceProcAddr as vk::PFN_vkGetDeviceProcAddr,
            )),
            b"vkCreateSampler" => Some(std::mem::transmute(
                vkpace_CreateSampler as vk::PFN_vkCreateSampler,
            )),
            b"vkCreateSwapchainKHR" => Some(std::mem::transmute(
                vkpace_CreateSwapchainKHR as vk::PFN_vkCreateSwapchainKHR,
            )),
            b"vkAcquireNextImageKHR" => Some(std::mem::transmute(
                vkpace_AcquireNextImageKHR as vk::PFN_vkAcquireNextImageKHR,
            )),
            b"vkAcquireNextImage2KHR" => Some(std::mem::transmute(
                vkpace_AcquireNextImage2KHR as vk::PFN_vkAcquireNextImage2KHR,
            )),
            b"vkQueuePresentKHR" => Some(std::mem::transmute(
                vkpace_QueuePresentKHR as vk::PFN_vkQueuePresentKHR,
            )),
            b"vkDestroyDevice" => Some(std::mem::transmute(
                vkpace_DestroyDevice as vk::PFN_vkDestroyDevice,
            )),
            _ => None,
        }
    }
}

/// Does the device's next layer expose this intercepted name? Destruction is
/// always interposed; the registry entry must go away even if the forward
/// pointer is absent.
fn next_layer_exposes(context: &DeviceContext, name: &[u8]) -> bool {
    match name {
        b"vkCreateSampler" => context.fwd.create_sampler.is_some(),
        b"vkCreateSwapchainKHR" => context.fwd.create_swapchain_khr.is_some(),
        b"vkAcquireNextImageKHR" => context.fwd.acquire_next_image_khr.is_some(),
        b"vkAcquireNextImage2KHR" => context.fwd.acquire_next_image2_khr.is_some(),
        b"vkQueuePresentKHR" => context.fwd.queue_present_khr.is_some(),
        _ => true,
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkpace_GetInstanceProcAddr(
    instance: vk::Instance,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let name = CStr::from_ptr(p_name).to_bytes();

    if let Some(hook) = instance_level_hook(name) {
        return Some(hook);
    }
    // Device-level names are resolvable through the instance router too.
    if let Some(hook) = device_level_hook(name) {
        return Some(hook);
    }

    let context = state::layer().registry.lookup_instance(instance)?;
    (context.next_gipa)(instance, p_name)
}

#[no_mangle]
pub unsafe extern "system" fn vkpace_GetDeviceProcAddr(
    device: vk::Device,
    p_name: *const c_char,
) -> vk::PFN_vkVoidFunction {
    if p_name.is_null() {
        return None;
    }
    let name = CStr::from_ptr(p_name).to_bytes();
    let context = state::layer().registry.lookup_device(device);

    if let Some(hook) = device_level_hook(name) {
        match &context {
            Some(context) if !next_layer_exposes(context, name) => {
                debug!(
                    "{} not exposed below, degrading to pass-through",
                    String::from_utf8_lossy(name)
                );
                return (context.next_gdpa)(device, p_name);
            }
            _ => return Some(hook),
        }
    }

    let context = context?;
    (context.next_gdpa)(device, p_name)
}

// ── Layer enumeration ───────────────────────────────────────────────────────

fn write_c_string(dest: &mut [c_char], text: &str) {
    let copy_len = text.len().min(dest.len() - 1);
    for (slot, byte) in dest.iter_mut().zip(text.as_bytes()[..copy_len].iter()) {
        *slot = *byte as c_char;
    }
    dest[copy_len] = 0;
}

#[no_mangle]
pub unsafe extern "system" fn vkpace_EnumerateInstanceLayerProperties(
    p_property_count: *mut u32,
    p_properties: *mut vk::LayerProperties,
) -> vk::Result {
    if p_property_count.is_null() {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }
    if p_properties.is_null() {
        *p_property_count = 1;
        return vk::Result::SUCCESS;
    }
    if *p_property_count == 0 {
        return vk::Result::INCOMPLETE;
    }
    *p_property_count = 1;

    let properties = &mut *p_properties;
    *properties = vk::LayerProperties::default();
    write_c_string(&mut properties.layer_name, crate::LAYER_NAME);
    write_c_string(&mut properties.description, crate::LAYER_DESCRIPTION);
    properties.spec_version = vk::API_VERSION_1_3;
    properties.implementation_version = 1;

    vk::Result::SUCCESS
}

#[no_mangle]
pub unsafe extern "system" fn vkpace_EnumerateInstanceExtensionProperties(
    _p_layer_name: *const c_char,
    p_property_count: *mut u32,
    _p_properties: *mut vk::ExtensionProperties,
) -> vk::Result {
    // The layer introduces no instance extensions of its own.
    if !p_property_count.is_null() {
        *p_property_count = 0;
    }
    vk::Result::SUCCESS
}

// ── Intercepted entry points ────────────────────────────────────────────────

#[no_mangle]
pub unsafe extern "system" fn vkpace_CreateInstance(
    p_create_info: *const vk::InstanceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_instance: *mut vk::Instance,
) -> vk::Result {
    crate::init();
    match instance::create_instance(state::layer(), p_create_info, p_allocator, p_instance) {
        Ok(result) => result,
        Err(err) => err.to_vk_result(),
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkpace_DestroyInstance(
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks,
) {
    instance::destroy_instance(state::layer(), instance, p_allocator);
}

#[no_mangle]
pub unsafe extern "system" fn vkpace_CreateDevice(
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_device: *mut vk::Device,
) -> vk::Result {
    match device::create_device(
        state::layer(),
        physical_device,
        p_create_info,
        p_allocator,
        p_device,
    ) {
        Ok(result) => result,
        Err(err) => err.to_vk_result(),
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkpace_DestroyDevice(
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks,
) {
    device::destroy_device(state::layer(), device, p_allocator);
}

#[no_mangle]
pub unsafe extern "system" fn vkpace_CreateSampler(
    device: vk::Device,
    p_create_info: *const vk::SamplerCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_sampler: *mut vk::Sampler,
) -> vk::Result {
    match sampler::create_sampler(state::layer(), device, p_create_info, p_allocator, p_sampler) {
        Ok(result) => result,
        Err(err) => err.to_vk_result(),
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkpace_CreateSwapchainKHR(
    device: vk::Device,
    p_create_info: *const vk::SwapchainCreateInfoKHR,
    p_allocator: *const vk::AllocationCallbacks,
    p_swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    match swapchain::create_swapchain(
        state::layer(),
        device,
        p_create_info,
        p_allocator,
        p_swapchain,
    ) {
        Ok(result) => result,
        Err(err) => err.to_vk_result(),
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkpace_AcquireNextImageKHR(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    timeout: u64,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
    p_image_index: *mut u32,
) -> vk::Result {
    match swapchain::acquire_next_image(
        state::layer(),
        device,
        swapchain,
        timeout,
        semaphore,
        fence,
        p_image_index,
    ) {
        Ok(result) => result,
        Err(err) => err.to_vk_result(),
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkpace_AcquireNextImage2KHR(
    device: vk::Device,
    p_acquire_info: *const vk::AcquireNextImageInfoKHR,
    p_image_index: *mut u32,
) -> vk::Result {
    match swapchain::acquire_next_image2(state::layer(), device, p_acquire_info, p_image_index) {
        Ok(result) => result,
        Err(err) => err.to_vk_result(),
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkpace_QueuePresentKHR(
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR,
) -> vk::Result {
    match swapchain::queue_present(state::layer(), queue, p_present_info) {
        Ok(result) => result,
        Err(err) => err.to_vk_result(),
    }
}
