//! Layer configuration
//!
//! All knobs live in one [`Config`] value: seeded once from `VKPACE_*`
//! environment variables at startup, then mutated only by the external
//! control channel. Parsing is tolerant: an empty or malformed value leaves
//! the corresponding knob at its default and is never an error.

use ash::vk;
use log::info;

pub const FRAMERATE_ENV_KEY: &str = "VKPACE_FRAMERATE";
pub const FILTER_ENV_KEY: &str = "VKPACE_FILTER";
pub const MIP_LOD_BIAS_ENV_KEY: &str = "VKPACE_MIP_LOD_BIAS";
pub const MAX_ANISOTROPY_ENV_KEY: &str = "VKPACE_MAX_ANISOTROPY";
pub const MIN_IMAGE_COUNT_ENV_KEY: &str = "VKPACE_MIN_IMAGE_COUNT";
pub const PRESENT_MODE_ENV_KEY: &str = "VKPACE_PRESENT_MODE";
pub const PREFER_LOW_LATENCY_ENV_KEY: &str = "VKPACE_PREFER_LOW_LATENCY";
pub const CONTROL_ENV_KEY: &str = "VKPACE_CONTROL";
pub const CONTROL_VERBOSE_ENV_KEY: &str = "VKPACE_CONTROL_VERBOSE";

/// Texture filtering override applied to every sampler the host creates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOverride {
    Nearest,
    Trilinear,
}

const FILTERS: &[(&str, FilterOverride)] = &[
    ("NEAREST", FilterOverride::Nearest),
    ("TRILINEAR", FilterOverride::Trilinear),
];

const PRESENT_MODES: &[(&str, vk::PresentModeKHR)] = &[
    ("IMMEDIATE", vk::PresentModeKHR::IMMEDIATE),
    ("MAILBOX", vk::PresentModeKHR::MAILBOX),
    ("FIFO", vk::PresentModeKHR::FIFO),
    ("FIFO_RELAXED", vk::PresentModeKHR::FIFO_RELAXED),
];

/// Look up a present mode by its upper-cased wire/env name.
pub fn present_mode_from_name(name: &str) -> Option<vk::PresentModeKHR> {
    PRESENT_MODES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, m)| *m)
}

pub fn present_mode_name(mode: vk::PresentModeKHR) -> &'static str {
    PRESENT_MODES
        .iter()
        .find(|(_, m)| *m == mode)
        .map(|(n, _)| *n)
        .unwrap_or("UNKNOWN")
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Target presentation rate in frames per second; 0 = unlimited.
    pub framerate: f64,

    pub filter: Option<FilterOverride>,
    pub mip_lod_bias: Option<f32>,
    /// Anisotropy override; values below 1.0 leave the host's choice alone.
    pub max_anisotropy: f32,

    /// Swapchain minimum image count override; 0 = off.
    pub min_image_count: u32,
    pub present_mode: Option<vk::PresentModeKHR>,
    /// Swap a requested blocking present mode for a low-latency one when the
    /// surface supports it.
    pub prefer_low_latency: bool,

    pub control_enabled: bool,
    pub control_verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            framerate: 0.0,
            filter: None,
            mip_lod_bias: None,
            max_anisotropy: 0.0,
            min_image_count: 0,
            present_mode: None,
            prefer_low_latency: false,
            control_enabled: false,
            control_verbose: false,
        }
    }
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary key lookup. Kept separate from
    /// [`from_env`](Self::from_env) so tests don't have to mutate
    /// process-global environment state.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(fps) = get(FRAMERATE_ENV_KEY).and_then(|v| v.parse::<f64>().ok()) {
            config.framerate = fps;
            if fps > 0.0 {
                info!("  Framerate: {fps}");
            }
        }

        if let Some(value) = get(FILTER_ENV_KEY) {
            let name = value.to_ascii_uppercase();
            if let Some((name, filter)) = FILTERS.iter().find(|(n, _)| *n == name) {
                config.filter = Some(*filter);
                info!("  Texture filtering: {name}");
            }
        }

        if let Some(bias) = get(MIP_LOD_BIAS_ENV_KEY).and_then(|v| v.parse::<f32>().ok()) {
            config.mip_lod_bias = Some(bias);
            info!("  Mip LOD bias: {bias}");
        }

        if let Some(aniso) = get(MAX_ANISOTROPY_ENV_KEY).and_then(|v| v.parse::<f32>().ok()) {
            config.max_anisotropy = aniso;
            if aniso >= 1.0 {
                info!("  Max anisotropy: {aniso}");
            }
        }

        if let Some(count) = get(MIN_IMAGE_COUNT_ENV_KEY).and_then(|v| v.parse::<u32>().ok()) {
            config.min_image_count = count;
            if count > 0 {
                info!("  Min image count: {count}");
            }
        }

        if let Some(value) = get(PRESENT_MODE_ENV_KEY) {
            if let Some(mode) = present_mode_from_name(&value.to_ascii_uppercase()) {
                config.present_mode = Some(mode);
                info!("  Present mode: {}", present_mode_name(mode));
            }
        }

        config.prefer_low_latency = flag(&get(PREFER_LOW_LATENCY_ENV_KEY));
        if config.prefer_low_latency {
            info!("  Preferring low-latency present modes");
        }

        config.control_enabled = flag(&get(CONTROL_ENV_KEY));
        config.control_verbose = flag(&get(CONTROL_VERBOSE_ENV_KEY));

        config
    }
}

fn flag(value: &Option<String>) -> bool {
    matches!(value.as_deref(), Some(v) if v != "0")
}
