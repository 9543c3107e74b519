//! Process-scoped layer state
//!
//! One [`LayerState`] bundles the registry, the shared configuration, and
//! the external control channel. The FFI entry points reach it through
//! [`layer`]; everything else takes it by reference, so unit tests build
//! private instances instead of sharing process globals.

use ash::vk;
use log::info;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{self, Config};
use crate::control::ExternalControl;
use crate::registry::Registry;

pub struct LayerState {
    pub registry: Registry,
    pub config: RwLock<Config>,
    control: Mutex<Option<ExternalControl>>,
    /// Latched after a failed endpoint setup so the warning is logged once
    /// and the layer settles into static-configuration-only operation.
    control_failed: AtomicBool,
}

static STATE: Lazy<Arc<LayerState>> = Lazy::new(|| Arc::new(LayerState::new(Config::from_env())));

/// The layer's process-wide state, created on first use.
pub fn layer() -> &'static Arc<LayerState> {
    &STATE
}

/// Start the control listener if it is enabled and not already running.
/// Called on instance creation; a setup failure degrades the layer to
/// static configuration and is not retried.
pub fn ensure_control(state: &Arc<LayerState>) {
    if !state.config.read().control_enabled || state.control_failed.load(Ordering::Relaxed) {
        return;
    }
    let mut slot = state.control.lock();
    if slot.is_some() {
        return;
    }
    match ExternalControl::spawn(Arc::clone(state)) {
        Ok(control) => {
            info!("External control enabled: {}", control.endpoint().display());
            *slot = Some(control);
        }
        Err(err) => {
            state.control_failed.store(true, Ordering::Relaxed);
            log::warn!("Can't create external control endpoint: {err}");
        }
    }
}

impl LayerState {
    pub fn new(config: Config) -> Self {
        Self {
            registry: Registry::new(),
            config: RwLock::new(config),
            control: Mutex::new(None),
            control_failed: AtomicBool::new(false),
        }
    }

    /// Stop the control listener and remove its endpoint. Called when the
    /// last instance goes away; a later instance creation restarts it.
    pub fn stop_control(&self) {
        drop(self.control.lock().take());
    }

    /// Apply one control-channel token. Tokens are case-insensitive; an
    /// unrecognized token is silently discarded; the channel is best-effort
    /// and never aborts on bad input.
    pub fn apply_command(&self, token: &str) {
        let token = token.trim().to_ascii_uppercase();
        if token.is_empty() {
            return;
        }

        if token == "AUTO" {
            self.set_present_mode_override(None);
        } else if let Some(mode) = config::present_mode_from_name(&token) {
            self.set_present_mode_override(Some(mode));
        } else if let Ok(fps) = token.parse::<f64>() {
            self.set_framerate(fps);
        } else if self.config.read().control_verbose {
            log::debug!("Ignoring unrecognized control token {token:?}");
        }
    }

    /// Change the target frame rate. Every tracked device's limiter is
    /// discarded under the device write lock, so no frame is ever paced with
    /// a half-old, half-new schedule; each limiter re-anchors on next use.
    pub fn set_framerate(&self, fps: f64) {
        let devices = self.registry.devices_exclusive();
        {
            let mut config = self.config.write();
            if config.framerate == fps {
                return;
            }
            config.framerate = fps;
        }
        info!("New framerate: {fps}");
        for device in devices.values() {
            *device.limiter.lock() = None;
        }
    }

    /// Force a present mode, or clear the override with `None`. Devices whose
    /// negotiated mode no longer matches are marked stale so their next
    /// acquire fails and the host recreates the swapchain.
    pub fn set_present_mode_override(&self, mode: Option<vk::PresentModeKHR>) {
        let devices = self.registry.devices_exclusive();
        let previous = {
            let mut config = self.config.write();
            let previous = config.present_mode;
            if previous == mode {
                return;
            }
            config.present_mode = mode;
            previous
        };
        match mode {
            Some(mode) => info!("Present mode forced: {}", config::present_mode_name(mode)),
            None => info!("Present mode override cleared"),
        }

        for device in devices.values() {
            let negotiated = *device.present_mode.lock();
            let invalidated = match (mode, negotiated) {
                // Forcing a mode invalidates any device presenting with a
                // different one. Devices with no swapchain yet have nothing
                // to invalidate; creation picks up the override anyway.
                (Some(forced), Some(current)) => current != forced,
                // Clearing the override invalidates devices the force had
                // actually steered, so they renegotiate the app's choice.
                (None, Some(current)) => previous == Some(current),
                (_, None) => false,
            };
            if invalidated {
                device.mark_surface_stale();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_support::{device_context, instance_context};

    fn state_with_device() -> (Arc<LayerState>, Arc<crate::registry::DeviceContext>) {
        let state = Arc::new(LayerState::new(Config::default()));
        let instance = instance_context(1, &[2]);
        state.registry.register_instance(Arc::clone(&instance));
        let device = device_context(0x20, &instance);
        state.registry.register_device(Arc::clone(&device));
        (state, device)
    }

    #[test]
    fn test_lowercase_commands_match_uppercase() {
        let (state, _device) = state_with_device();
        state.apply_command("immediate");
        assert_eq!(
            state.config.read().present_mode,
            Some(vk::PresentModeKHR::IMMEDIATE)
        );
        state.apply_command("AUTO");
        assert_eq!(state.config.read().present_mode, None);
    }

    #[test]
    fn test_malformed_token_changes_nothing() {
        let (state, _device) = state_with_device();
        state.apply_command("MAILBOX");
        state.apply_command("72.5");

        state.apply_command("xyz");
        state.apply_command("");
        state.apply_command("12fps");

        let config = state.config.read();
        assert_eq!(config.present_mode, Some(vk::PresentModeKHR::MAILBOX));
        assert_eq!(config.framerate, 72.5);
    }

    #[test]
    fn test_rate_change_discards_limiters() {
        let (state, device) = state_with_device();
        device.pace(60.0);
        assert!(device.limiter.lock().is_some());

        state.apply_command("30");
        assert!(device.limiter.lock().is_none());

        // Same rate again: no limiter churn.
        device.pace(30.0);
        state.apply_command("30");
        assert!(device.limiter.lock().is_some());
    }

    #[test]
    fn test_mode_change_marks_presenting_device_stale() {
        let (state, device) = state_with_device();

        // No swapchain yet: nothing to invalidate.
        state.apply_command("MAILBOX");
        assert!(!device.is_surface_stale());

        // Swapchain created under the override; repeating the same force is
        // a configuration no-op.
        device.record_negotiated_mode(vk::PresentModeKHR::MAILBOX);
        state.apply_command("MAILBOX");
        assert!(!device.is_surface_stale());

        state.apply_command("FIFO");
        assert!(device.is_surface_stale());

        // Recreation clears the flag.
        device.record_negotiated_mode(vk::PresentModeKHR::FIFO);
        assert!(!device.is_surface_stale());

        // Clearing an override that steered this device forces renegotiation.
        state.apply_command("AUTO");
        assert!(device.is_surface_stale());

        // A second AUTO is a no-op and must not re-mark after recreation.
        device.record_negotiated_mode(vk::PresentModeKHR::FIFO);
        state.apply_command("AUTO");
        assert!(!device.is_surface_stale());
    }
}
