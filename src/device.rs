//! Device creation/destruction interception
//!
//! Creation finds the owning instance through its physical-device set,
//! forwards through the loader link, then registers a device context
//! carrying the cached next-layer entry points, the sampler limits
//! snapshotted from the hardware, and one queue link per queue the host
//! requested.

use ash::vk::{self, Handle};
use log::{debug, info};
use parking_lot::Mutex;
use std::os::raw::c_char;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::dispatch::{self, cast_pfn};
use crate::error::{LayerError, Result};
use crate::registry::{DeviceContext, DeviceForward, InstanceContext};
use crate::state::LayerState;

pub unsafe fn create_device(
    state: &Arc<LayerState>,
    physical_device: vk::PhysicalDevice,
    p_create_info: *const vk::DeviceCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_device: *mut vk::Device,
) -> Result<vk::Result> {
    let link =
        dispatch::find_device_link((*p_create_info).p_next).ok_or(LayerError::MissingLoaderLink)?;
    let next_gdpa = (*link).pfn_next_get_device_proc_addr;

    let instance_context = state
        .registry
        .lookup_instance_by_physical_device(physical_device)
        .ok_or(LayerError::UntrackedHandle("physical device"))?;
    let create_fn = instance_context
        .create_device
        .ok_or(LayerError::MissingEntryPoint("vkCreateDevice"))?;

    dispatch::advance_device_link((*p_create_info).p_next);

    let result = create_fn(physical_device, p_create_info, p_allocator, p_device);
    if result != vk::Result::SUCCESS {
        return Ok(result);
    }
    let device = *p_device;

    let resolve =
        |name: &'static [u8]| unsafe { next_gdpa(device, name.as_ptr() as *const c_char) };

    let fwd = DeviceForward {
        create_sampler: cast_pfn(resolve(b"vkCreateSampler\0")),
        create_swapchain_khr: cast_pfn(resolve(b"vkCreateSwapchainKHR\0")),
        acquire_next_image_khr: cast_pfn(resolve(b"vkAcquireNextImageKHR\0")),
        acquire_next_image2_khr: cast_pfn(resolve(b"vkAcquireNextImage2KHR\0")),
        queue_present_khr: cast_pfn(resolve(b"vkQueuePresentKHR\0")),
        destroy_device: cast_pfn(resolve(b"vkDestroyDevice\0")),
    };

    let (max_sampler_lod_bias, max_sampler_anisotropy) =
        query_sampler_limits(&instance_context, physical_device);

    let context = Arc::new(DeviceContext {
        device,
        next_gdpa,
        fwd,
        instance: Arc::downgrade(&instance_context),
        physical_device,
        max_sampler_lod_bias,
        max_sampler_anisotropy,
        limiter: Mutex::new(None),
        present_mode: Mutex::new(None),
        surface_stale: AtomicBool::new(false),
    });
    state.registry.register_device(Arc::clone(&context));

    register_queues(state, &context, &*p_create_info, next_gdpa);

    info!(
        "Tracking device {:#x} (max LOD bias {}, max anisotropy {})",
        device.as_raw(),
        max_sampler_lod_bias,
        max_sampler_anisotropy
    );
    Ok(vk::Result::SUCCESS)
}

/// Snapshot the sampler-relevant hardware limits once; they are static for
/// the device's lifetime and querying per sampler creation would be wasted.
fn query_sampler_limits(
    instance_context: &InstanceContext,
    physical_device: vk::PhysicalDevice,
) -> (f32, f32) {
    let Some(get_properties) = instance_context.get_physical_device_properties else {
        return (0.0, 1.0);
    };
    let mut properties = vk::PhysicalDeviceProperties::default();
    unsafe { get_properties(physical_device, &mut properties) };
    (
        properties.limits.max_sampler_lod_bias,
        properties.limits.max_sampler_anisotropy,
    )
}

/// Link every queue the host asked for back to its device, so present calls
/// (which only carry a queue handle) can find their context.
unsafe fn register_queues(
    state: &LayerState,
    context: &Arc<DeviceContext>,
    create_info: &vk::DeviceCreateInfo,
    next_gdpa: vk::PFN_vkGetDeviceProcAddr,
) {
    let get_queue: Option<vk::PFN_vkGetDeviceQueue> = cast_pfn(next_gdpa(
        context.device,
        b"vkGetDeviceQueue\0".as_ptr() as *const c_char,
    ));
    let Some(get_queue) = get_queue else {
        return;
    };
    if create_info.queue_create_info_count == 0 || create_info.p_queue_create_infos.is_null() {
        return;
    }

    let queue_infos = std::slice::from_raw_parts(
        create_info.p_queue_create_infos,
        create_info.queue_create_info_count as usize,
    );
    for queue_info in queue_infos {
        // Flagged (protected) queues are only reachable via vkGetDeviceQueue2.
        if !queue_info.flags.is_empty() {
            continue;
        }
        for queue_index in 0..queue_info.queue_count {
            let mut queue = vk::Queue::null();
            get_queue(
                context.device,
                queue_info.queue_family_index,
                queue_index,
                &mut queue,
            );
            if queue != vk::Queue::null() {
                state.registry.register_queue(queue, context);
                debug!(
                    "Linked queue {:#x} (family {} index {})",
                    queue.as_raw(),
                    queue_info.queue_family_index,
                    queue_index
                );
            }
        }
    }
}

pub unsafe fn destroy_device(
    state: &LayerState,
    device: vk::Device,
    p_allocator: *const vk::AllocationCallbacks,
) {
    let Some(context) = state.registry.unregister_device(device) else {
        return;
    };
    if let Some(destroy_fn) = context.fwd.destroy_device {
        destroy_fn(device, p_allocator);
    }
    info!("Device {:#x} untracked", device.as_raw());
}
