//! vkpace - Vulkan frame pacing layer
//!
//! An implicit layer that sits between the application and the driver,
//! forwarding everything except a small intercepted set: presentation is
//! throttled to a configurable frame rate, swapchain and sampler parameters
//! can be overridden, and a per-process control endpoint accepts live
//! reconfiguration from outside the process.
//!
//! ```text
//! Application → loader → vkpace → (other layers) → driver
//! ```

pub mod config;
pub mod control;
pub mod device;
pub mod dispatch;
pub mod error;
pub mod instance;
pub mod limiter;
pub mod registry;
pub mod sampler;
pub mod state;
pub mod swapchain;

use log::info;

pub const LAYER_NAME: &str = "VK_LAYER_VKPACE_frame_pacing";
pub const LAYER_DESCRIPTION: &str = "Frame pacing and presentation override layer";

/// Initialize the layer's logging; safe to call repeatedly.
pub fn init() {
    static BANNER: std::sync::Once = std::sync::Once::new();
    BANNER.call_once(|| {
        let _ = env_logger::builder()
            .filter_level(log::LevelFilter::Info)
            .parse_default_env()
            .try_init();
        info!("{} v{} active", LAYER_NAME, env!("CARGO_PKG_VERSION"));
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        init();
        init();
    }
}
