//! Swapchain interception: presentation-mode negotiation, image-count
//! clamping, stale-surface handling, and frame pacing
//!
//! A device cycles through three presentation states. Before its first
//! swapchain it is fresh. Once a swapchain exists it presents with the mode
//! negotiated here. When the control channel forces a different mode the
//! device goes stale: its acquire calls fail with ERROR_OUT_OF_DATE_KHR
//! without touching the driver, the host tears the swapchain down through
//! its normal recreation path, and the creation below renegotiates and
//! clears the staleness.
//!
//! Pacing consumes one tick per acquire that the driver answered with
//! SUCCESS or SUBOPTIMAL_KHR. Failed or short-circuited calls never pace, so
//! a lost frame is not additionally slowed down by the limiter.

use ash::vk;
use log::debug;
use std::sync::Arc;

use crate::config;
use crate::error::{LayerError, Result};
use crate::registry::{DeviceContext, InstanceContext};
use crate::state::LayerState;

pub unsafe fn create_swapchain(
    state: &LayerState,
    device: vk::Device,
    p_create_info: *const vk::SwapchainCreateInfoKHR,
    p_allocator: *const vk::AllocationCallbacks,
    p_swapchain: *mut vk::SwapchainKHR,
) -> Result<vk::Result> {
    let context = state
        .registry
        .lookup_device(device)
        .ok_or(LayerError::UntrackedHandle("device"))?;
    let create_fn = context
        .fwd
        .create_swapchain_khr
        .ok_or(LayerError::MissingEntryPoint("vkCreateSwapchainKHR"))?;

    let mut create_info = *p_create_info;
    let (forced_mode, prefer_low_latency, min_image_count) = {
        let config = state.config.read();
        (
            config.present_mode,
            config.prefer_low_latency,
            config.min_image_count,
        )
    };

    // Negotiation needs the instance's surface-query entry points. If the
    // instance is already gone the swapchain is still created, just with the
    // host's parameters untouched.
    if let Some(instance_context) = context.instance.upgrade() {
        if forced_mode.is_some() || prefer_low_latency {
            if let Some(supported) = query_surface_present_modes(
                &instance_context,
                context.physical_device,
                create_info.surface,
            ) {
                create_info.present_mode = negotiate_present_mode(
                    create_info.present_mode,
                    forced_mode,
                    prefer_low_latency,
                    &supported,
                );
            }
        }

        if min_image_count > 0 {
            if let Some(capabilities) = query_surface_capabilities(
                &instance_context,
                context.physical_device,
                create_info.surface,
            ) {
                create_info.min_image_count = effective_min_image_count(
                    min_image_count,
                    capabilities.min_image_count,
                    capabilities.max_image_count,
                );
            }
        }
    }

    let result = create_fn(device, &create_info, p_allocator, p_swapchain);
    if result == vk::Result::SUCCESS {
        context.record_negotiated_mode(create_info.present_mode);
        debug!(
            "Swapchain created: {} images requested, {} mode",
            create_info.min_image_count,
            config::present_mode_name(create_info.present_mode)
        );
    }
    Ok(result)
}

/// Pick the present mode a new swapchain is created with. A forced mode wins
/// when the surface supports it; otherwise a low-latency preference swaps a
/// requested blocking mode for the best supported non-blocking one; failing
/// both, the host's request goes through untouched.
pub fn negotiate_present_mode(
    requested: vk::PresentModeKHR,
    forced: Option<vk::PresentModeKHR>,
    prefer_low_latency: bool,
    supported: &[vk::PresentModeKHR],
) -> vk::PresentModeKHR {
    if let Some(forced) = forced {
        if supported.contains(&forced) {
            return forced;
        }
    }
    if prefer_low_latency
        && matches!(
            requested,
            vk::PresentModeKHR::FIFO | vk::PresentModeKHR::FIFO_RELAXED
        )
    {
        for candidate in [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE] {
            if supported.contains(&candidate) {
                return candidate;
            }
        }
    }
    requested
}

/// Clamp the configured minimum image count into what the surface allows:
/// at least the surface minimum, at most the surface maximum (0 = unbounded).
pub fn effective_min_image_count(configured: u32, surface_min: u32, surface_max: u32) -> u32 {
    let mut count = configured.max(surface_min);
    if surface_max > 0 {
        count = count.min(surface_max);
    }
    count
}

fn query_surface_present_modes(
    instance_context: &InstanceContext,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Option<Vec<vk::PresentModeKHR>> {
    let query = instance_context.get_surface_present_modes?;
    let mut count = 0u32;
    unsafe {
        if query(physical_device, surface, &mut count, std::ptr::null_mut())
            != vk::Result::SUCCESS
            || count == 0
        {
            return None;
        }
        let mut modes = vec![vk::PresentModeKHR::FIFO; count as usize];
        if query(physical_device, surface, &mut count, modes.as_mut_ptr()) != vk::Result::SUCCESS {
            return None;
        }
        modes.truncate(count as usize);
        Some(modes)
    }
}

fn query_surface_capabilities(
    instance_context: &InstanceContext,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Option<vk::SurfaceCapabilitiesKHR> {
    let query = instance_context.get_surface_capabilities?;
    let mut capabilities = vk::SurfaceCapabilitiesKHR::default();
    unsafe {
        (query(physical_device, surface, &mut capabilities) == vk::Result::SUCCESS)
            .then_some(capabilities)
    }
}

pub unsafe fn acquire_next_image(
    state: &LayerState,
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    timeout: u64,
    semaphore: vk::Semaphore,
    fence: vk::Fence,
    p_image_index: *mut u32,
) -> Result<vk::Result> {
    let context = state
        .registry
        .lookup_device(device)
        .ok_or(LayerError::UntrackedHandle("device"))?;
    if context.is_surface_stale() {
        return Err(LayerError::SurfaceOutOfDate);
    }
    let acquire_fn = context
        .fwd
        .acquire_next_image_khr
        .ok_or(LayerError::MissingEntryPoint("vkAcquireNextImageKHR"))?;

    let result = acquire_fn(device, swapchain, timeout, semaphore, fence, p_image_index);
    pace_if_presented(state, &context, result);
    Ok(result)
}

pub unsafe fn acquire_next_image2(
    state: &LayerState,
    device: vk::Device,
    p_acquire_info: *const vk::AcquireNextImageInfoKHR,
    p_image_index: *mut u32,
) -> Result<vk::Result> {
    let context = state
        .registry
        .lookup_device(device)
        .ok_or(LayerError::UntrackedHandle("device"))?;
    if context.is_surface_stale() {
        return Err(LayerError::SurfaceOutOfDate);
    }
    let acquire_fn = context
        .fwd
        .acquire_next_image2_khr
        .ok_or(LayerError::MissingEntryPoint("vkAcquireNextImage2KHR"))?;

    let result = acquire_fn(device, p_acquire_info, p_image_index);
    pace_if_presented(state, &context, result);
    Ok(result)
}

pub unsafe fn queue_present(
    state: &LayerState,
    queue: vk::Queue,
    p_present_info: *const vk::PresentInfoKHR,
) -> Result<vk::Result> {
    let context = state
        .registry
        .lookup_device_by_queue(queue)
        .ok_or(LayerError::UntrackedHandle("queue"))?;
    let present_fn = context
        .fwd
        .queue_present_khr
        .ok_or(LayerError::MissingEntryPoint("vkQueuePresentKHR"))?;

    // Driver results pass through verbatim; the pacing tick for this frame
    // was already consumed by the acquire that produced it.
    Ok(present_fn(queue, p_present_info))
}

fn pace_if_presented(state: &LayerState, context: &Arc<DeviceContext>, result: vk::Result) {
    if matches!(result, vk::Result::SUCCESS | vk::Result::SUBOPTIMAL_KHR) {
        let fps = state.config.read().framerate;
        context.pace(fps);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::test_support::{device_context, instance_context};
    use ash::vk::Handle;

    #[test]
    fn test_negotiate_forced_mode_when_supported() {
        let supported = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            negotiate_present_mode(
                vk::PresentModeKHR::FIFO,
                Some(vk::PresentModeKHR::MAILBOX),
                false,
                &supported
            ),
            vk::PresentModeKHR::MAILBOX
        );
        // Unsupported force leaves the request alone.
        assert_eq!(
            negotiate_present_mode(
                vk::PresentModeKHR::FIFO,
                Some(vk::PresentModeKHR::IMMEDIATE),
                false,
                &supported
            ),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_negotiate_low_latency_substitution() {
        // Blocking request + mailbox available => substituted.
        assert_eq!(
            negotiate_present_mode(
                vk::PresentModeKHR::FIFO,
                None,
                true,
                &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX]
            ),
            vk::PresentModeKHR::MAILBOX
        );
        // No mailbox: immediate is the fallback.
        assert_eq!(
            negotiate_present_mode(
                vk::PresentModeKHR::FIFO_RELAXED,
                None,
                true,
                &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE]
            ),
            vk::PresentModeKHR::IMMEDIATE
        );
        // Host already asked for a non-blocking mode: untouched.
        assert_eq!(
            negotiate_present_mode(
                vk::PresentModeKHR::IMMEDIATE,
                None,
                true,
                &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::MAILBOX]
            ),
            vk::PresentModeKHR::IMMEDIATE
        );
        // Only blocking modes supported: nothing to substitute.
        assert_eq!(
            negotiate_present_mode(
                vk::PresentModeKHR::FIFO,
                None,
                true,
                &[vk::PresentModeKHR::FIFO]
            ),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_effective_min_image_count_clamps_both_ways() {
        // Configured above the surface maximum.
        assert_eq!(effective_min_image_count(4, 2, 3), 3);
        // Configured below the surface minimum.
        assert_eq!(effective_min_image_count(1, 2, 3), 2);
        // Zero maximum means unbounded.
        assert_eq!(effective_min_image_count(8, 2, 0), 8);
        assert_eq!(effective_min_image_count(3, 2, 8), 3);
    }

    #[test]
    fn test_stale_device_fails_acquire_without_forwarding() {
        let state = LayerState::new(Config::default());
        let instance = instance_context(1, &[2]);
        let device = device_context(0x20, &instance);
        state.registry.register_device(Arc::clone(&device));

        device.record_negotiated_mode(vk::PresentModeKHR::FIFO);
        device.mark_surface_stale();

        let result = unsafe {
            acquire_next_image(
                &state,
                vk::Device::from_raw(0x20),
                vk::SwapchainKHR::null(),
                0,
                vk::Semaphore::null(),
                vk::Fence::null(),
                std::ptr::null_mut(),
            )
        };
        assert!(matches!(result, Err(LayerError::SurfaceOutOfDate)));
        // The stale short-circuit never consumed a pacing tick.
        assert!(device.limiter.lock().is_none());

        // Recreation clears the flag; the next acquire reaches the forward
        // table (and fails differently here because the test context has no
        // next layer to call into).
        device.record_negotiated_mode(vk::PresentModeKHR::FIFO);
        let result = unsafe {
            acquire_next_image(
                &state,
                vk::Device::from_raw(0x20),
                vk::SwapchainKHR::null(),
                0,
                vk::Semaphore::null(),
                vk::Fence::null(),
                std::ptr::null_mut(),
            )
        };
        assert!(matches!(result, Err(LayerError::MissingEntryPoint(_))));
    }

    #[test]
    fn test_unknown_handles_report_initialization_failed() {
        let state = LayerState::new(Config::default());
        let result = unsafe {
            acquire_next_image(
                &state,
                vk::Device::from_raw(0xdead),
                vk::SwapchainKHR::null(),
                0,
                vk::Semaphore::null(),
                vk::Fence::null(),
                std::ptr::null_mut(),
            )
        };
        let err = result.unwrap_err();
        assert!(matches!(err, LayerError::UntrackedHandle(_)));
        assert_eq!(err.to_vk_result(), vk::Result::ERROR_INITIALIZATION_FAILED);

        let result = unsafe {
            queue_present(&state, vk::Queue::from_raw(0xbeef), std::ptr::null())
        };
        assert!(matches!(result, Err(LayerError::UntrackedHandle(_))));
    }
}
