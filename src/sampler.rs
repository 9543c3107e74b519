//! Sampler creation interception
//!
//! Applies the configured texture-filtering, LOD-bias, and anisotropy
//! overrides, clamped against the limits snapshotted at device creation,
//! then forwards to the next layer.

use ash::vk;

use crate::config::{Config, FilterOverride};
use crate::error::{LayerError, Result};
use crate::state::LayerState;

pub unsafe fn create_sampler(
    state: &LayerState,
    device: vk::Device,
    p_create_info: *const vk::SamplerCreateInfo,
    p_allocator: *const vk::AllocationCallbacks,
    p_sampler: *mut vk::Sampler,
) -> Result<vk::Result> {
    let context = state
        .registry
        .lookup_device(device)
        .ok_or(LayerError::UntrackedHandle("device"))?;
    let create_fn = context
        .fwd
        .create_sampler
        .ok_or(LayerError::MissingEntryPoint("vkCreateSampler"))?;

    let mut create_info = *p_create_info;
    apply_overrides(
        &mut create_info,
        &state.config.read(),
        context.max_sampler_lod_bias,
        context.max_sampler_anisotropy,
    );

    Ok(create_fn(device, &create_info, p_allocator, p_sampler))
}

pub fn apply_overrides(
    create_info: &mut vk::SamplerCreateInfo,
    config: &Config,
    max_sampler_lod_bias: f32,
    max_sampler_anisotropy: f32,
) {
    match config.filter {
        Some(FilterOverride::Nearest) => {
            create_info.mag_filter = vk::Filter::NEAREST;
            create_info.min_filter = vk::Filter::NEAREST;
            create_info.mipmap_mode = vk::SamplerMipmapMode::NEAREST;
        }
        Some(FilterOverride::Trilinear) => {
            create_info.mag_filter = vk::Filter::LINEAR;
            create_info.min_filter = vk::Filter::LINEAR;
            create_info.mipmap_mode = vk::SamplerMipmapMode::LINEAR;
        }
        None => {}
    }

    if let Some(bias) = config.mip_lod_bias {
        create_info.mip_lod_bias = bias.min(max_sampler_lod_bias);
    }

    if config.max_anisotropy >= 1.0 {
        create_info.anisotropy_enable = vk::TRUE;
        create_info.max_anisotropy = config.max_anisotropy.min(max_sampler_anisotropy);
    }
}
