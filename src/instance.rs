//! Instance creation/destruction interception
//!
//! Creation resolves the next layer through the loader's link info, forwards
//! the call, then records the instance together with the capability-query
//! entry points later stages need (device limits, surface capabilities,
//! surface present modes) and the set of physical devices it owns.

use ash::vk::{self, Handle};
use log::info;
use std::os::raw::c_char;
use std::sync::Arc;

use crate::dispatch::{self, cast_pfn};
use crate::error::{LayerError, Result};
use crate::registry::InstanceContext;
use crate::state::LayerState;

pub unsafe fn create_instance(
    state: &Arc<LayerState>,
    p_create_info: *const vk::InstanceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_instance: *mut vk::Instance,
) -> Result<vk::Result> {
    let link = dispatch::find_instance_link((*p_create_info).p_next)
        .ok_or(LayerError::MissingLoaderLink)?;
    let next_gipa = (*link).pfn_next_get_instance_proc_addr;

    let create_fn: Option<vk::PFN_vkCreateInstance> = cast_pfn(next_gipa(
        vk::Instance::null(),
        b"vkCreateInstance\0".as_ptr() as *const c_char,
    ));
    let create_fn = create_fn.ok_or(LayerError::MissingEntryPoint("vkCreateInstance"))?;

    // Point the link info at the next element for the layer below us.
    dispatch::advance_instance_link((*p_create_info).p_next);

    let result = create_fn(p_create_info, p_allocator, p_instance);
    if result != vk::Result::SUCCESS {
        return Ok(result);
    }
    let instance = *p_instance;

    let resolve =
        |name: &'static [u8]| unsafe { next_gipa(instance, name.as_ptr() as *const c_char) };

    let mut context = InstanceContext {
        instance,
        next_gipa,
        create_device: cast_pfn(resolve(b"vkCreateDevice\0")),
        destroy_instance: cast_pfn(resolve(b"vkDestroyInstance\0")),
        get_physical_device_properties: cast_pfn(resolve(b"vkGetPhysicalDeviceProperties\0")),
        get_surface_capabilities: cast_pfn(resolve(
            b"vkGetPhysicalDeviceSurfaceCapabilitiesKHR\0",
        )),
        get_surface_present_modes: cast_pfn(resolve(
            b"vkGetPhysicalDeviceSurfacePresentModesKHR\0",
        )),
        physical_devices: Vec::new(),
    };

    let enumerate: Option<vk::PFN_vkEnumeratePhysicalDevices> =
        cast_pfn(resolve(b"vkEnumeratePhysicalDevices\0"));
    if let Some(enumerate) = enumerate {
        let mut count = 0u32;
        if enumerate(instance, &mut count, std::ptr::null_mut()) == vk::Result::SUCCESS && count > 0
        {
            let mut physical_devices = vec![vk::PhysicalDevice::null(); count as usize];
            if enumerate(instance, &mut count, physical_devices.as_mut_ptr())
                == vk::Result::SUCCESS
            {
                physical_devices.truncate(count as usize);
                context.physical_devices = physical_devices;
            }
        }
    }

    info!(
        "Tracking instance {:#x} ({} physical devices)",
        instance.as_raw(),
        context.physical_devices.len()
    );
    state.registry.register_instance(Arc::new(context));
    crate::state::ensure_control(state);

    Ok(vk::Result::SUCCESS)
}

pub unsafe fn destroy_instance(
    state: &LayerState,
    instance: vk::Instance,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let Some(context) = state.registry.unregister_instance(instance) else {
        return;
    };

    // The table lock is released before the forwarded call; destruction may
    // block in the driver for as long as it likes.
    if let Some(destroy_fn) = context.destroy_instance {
        destroy_fn(instance, p_allocator);
    }
    info!("Instance {:#x} untracked", instance.as_raw());

    if state.registry.instance_count() == 0 {
        state.stop_control();
    }
}
