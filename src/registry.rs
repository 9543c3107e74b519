//! Handle registry for tracked Vulkan objects
//!
//! The layer sees the same opaque handle values the application uses, so
//! contexts are keyed by raw handle. Two independent reader-writer locks
//! guard the tables: one for instances, one for devices and their queues.
//! Lookups clone the `Arc` out and release the lock immediately: no lock is
//! ever held across a forwarded driver call or a pacing sleep, so a present
//! that blocks in the driver can never stall another device's creation or
//! the control channel.
//!
//! Every lookup can miss: handles may have been created before the layer
//! attached, or by another link in the chain. Callers translate a miss into
//! ERROR_INITIALIZATION_FAILED; the registry itself never panics on an
//! unknown handle.

use ash::vk::{self, Handle};
use parking_lot::{MappedRwLockWriteGuard, Mutex, RwLock, RwLockWriteGuard};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::limiter::FrameLimiter;

/// Per-instance context: the next-layer resolver plus the capability-query
/// entry points device creation and swapchain negotiation need later.
pub struct InstanceContext {
    pub instance: vk::Instance,
    pub next_gipa: vk::PFN_vkGetInstanceProcAddr,

    pub create_device: Option<vk::PFN_vkCreateDevice>,
    pub destroy_instance: Option<vk::PFN_vkDestroyInstance>,
    pub get_physical_device_properties: Option<vk::PFN_vkGetPhysicalDeviceProperties>,
    pub get_surface_capabilities: Option<vk::PFN_vkGetPhysicalDeviceSurfaceCapabilitiesKHR>,
    pub get_surface_present_modes: Option<vk::PFN_vkGetPhysicalDeviceSurfacePresentModesKHR>,

    /// Physical devices owned by this instance; scanned linearly at device
    /// creation to find the owning instance (instance count is ~1).
    pub physical_devices: Vec<vk::PhysicalDevice>,
}

/// Forwarded entry points cached at device creation. Any of these may be
/// absent if the next layer never exposed the name; the proc-addr router
/// then degrades that operation to pass-through instead of interposing.
#[derive(Default)]
pub struct DeviceForward {
    pub create_sampler: Option<vk::PFN_vkCreateSampler>,
    pub create_swapchain_khr: Option<vk::PFN_vkCreateSwapchainKHR>,
    pub acquire_next_image_khr: Option<vk::PFN_vkAcquireNextImageKHR>,
    pub acquire_next_image2_khr: Option<vk::PFN_vkAcquireNextImage2KHR>,
    pub queue_present_khr: Option<vk::PFN_vkQueuePresentKHR>,
    pub destroy_device: Option<vk::PFN_vkDestroyDevice>,
}

/// Per-device context.
pub struct DeviceContext {
    pub device: vk::Device,
    pub next_gdpa: vk::PFN_vkGetDeviceProcAddr,
    pub fwd: DeviceForward,

    /// Non-owning link to the parent instance; checked for expiry on use.
    pub instance: Weak<InstanceContext>,
    pub physical_device: vk::PhysicalDevice,

    /// Hardware limits snapshotted at creation; static for the device's
    /// lifetime, so per-call queries would be wasted work.
    pub max_sampler_lod_bias: f32,
    pub max_sampler_anisotropy: f32,

    /// Absent until the first paced call so the pacing clock anchors at the
    /// first real frame. Discarded wholesale on a rate change.
    pub limiter: Mutex<Option<FrameLimiter>>,

    /// Present mode negotiated at the last swapchain creation; None until a
    /// swapchain exists.
    pub present_mode: Mutex<Option<vk::PresentModeKHR>>,

    /// Set when an external mode change invalidates the current swapchain;
    /// cleared by the next successful swapchain creation.
    pub surface_stale: AtomicBool,
}

impl DeviceContext {
    pub fn is_surface_stale(&self) -> bool {
        self.surface_stale.load(Ordering::Acquire)
    }

    pub fn mark_surface_stale(&self) {
        self.surface_stale.store(true, Ordering::Release);
    }

    /// Record the mode a freshly created swapchain was negotiated with and
    /// drop any staleness left over from a previous configuration.
    pub fn record_negotiated_mode(&self, mode: vk::PresentModeKHR) {
        *self.present_mode.lock() = Some(mode);
        self.surface_stale.store(false, Ordering::Release);
    }

    /// Consume one pacing tick at the given target rate, then sleep out the
    /// returned delay with the limiter lock released so a concurrent rate
    /// change is never blocked behind a sleeping frame.
    pub fn pace(&self, fps: f64) {
        let sleep = self
            .limiter
            .lock()
            .get_or_insert_with(|| FrameLimiter::new(fps))
            .tick();
        if !sleep.is_zero() {
            std::thread::sleep(sleep);
        }
    }
}

struct DeviceTables {
    devices: FxHashMap<u64, Arc<DeviceContext>>,
    /// Queue handle → owning device. Populated at device creation, purged
    /// when the device is unregistered.
    queues: FxHashMap<u64, Arc<DeviceContext>>,
}

pub struct Registry {
    instances: RwLock<FxHashMap<u64, Arc<InstanceContext>>>,
    device_tables: RwLock<DeviceTables>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            instances: RwLock::new(FxHashMap::default()),
            device_tables: RwLock::new(DeviceTables {
                devices: FxHashMap::default(),
                queues: FxHashMap::default(),
            }),
        }
    }

    pub fn register_instance(&self, context: Arc<InstanceContext>) {
        self.instances
            .write()
            .insert(context.instance.as_raw(), context);
    }

    pub fn unregister_instance(&self, instance: vk::Instance) -> Option<Arc<InstanceContext>> {
        self.instances.write().remove(&instance.as_raw())
    }

    pub fn lookup_instance(&self, instance: vk::Instance) -> Option<Arc<InstanceContext>> {
        self.instances.read().get(&instance.as_raw()).cloned()
    }

    /// Find the instance owning a physical device. Linear over all instances'
    /// device sets; called only at device creation, never per frame.
    pub fn lookup_instance_by_physical_device(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Option<Arc<InstanceContext>> {
        self.instances
            .read()
            .values()
            .find(|context| context.physical_devices.contains(&physical_device))
            .cloned()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    pub fn register_device(&self, context: Arc<DeviceContext>) {
        self.device_tables
            .write()
            .devices
            .insert(context.device.as_raw(), context);
    }

    pub fn register_queue(&self, queue: vk::Queue, owner: &Arc<DeviceContext>) {
        self.device_tables
            .write()
            .queues
            .insert(queue.as_raw(), Arc::clone(owner));
    }

    /// Remove a device and every queue link pointing at it, in that order of
    /// visibility: once this returns, no queue resolves to the dead device.
    pub fn unregister_device(&self, device: vk::Device) -> Option<Arc<DeviceContext>> {
        let mut tables = self.device_tables.write();
        let context = tables.devices.remove(&device.as_raw())?;
        tables.queues.retain(|_, owner| !Arc::ptr_eq(owner, &context));
        Some(context)
    }

    pub fn lookup_device(&self, device: vk::Device) -> Option<Arc<DeviceContext>> {
        self.device_tables
            .read()
            .devices
            .get(&device.as_raw())
            .cloned()
    }

    pub fn lookup_device_by_queue(&self, queue: vk::Queue) -> Option<Arc<DeviceContext>> {
        self.device_tables
            .read()
            .queues
            .get(&queue.as_raw())
            .cloned()
    }

    pub fn device_count(&self) -> usize {
        self.device_tables.read().devices.len()
    }

    /// Exclusive access to every tracked device, for control-channel
    /// mutations. Holding this guard serializes against registration,
    /// destruction, and the lookups on the frame path, which is what makes a
    /// configuration change plus its per-device side effects atomic as far
    /// as any acquire call can observe.
    pub fn devices_exclusive(
        &self,
    ) -> MappedRwLockWriteGuard<'_, FxHashMap<u64, Arc<DeviceContext>>> {
        RwLockWriteGuard::map(self.device_tables.write(), |tables| &mut tables.devices)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::os::raw::c_char;

    unsafe extern "system" fn noop_gipa(
        _instance: vk::Instance,
        _name: *const c_char,
    ) -> vk::PFN_vkVoidFunction {
        None
    }

    unsafe extern "system" fn noop_gdpa(
        _device: vk::Device,
        _name: *const c_char,
    ) -> vk::PFN_vkVoidFunction {
        None
    }

    pub fn instance_context(raw: u64, physical_devices: &[u64]) -> Arc<InstanceContext> {
        Arc::new(InstanceContext {
            instance: vk::Instance::from_raw(raw),
            next_gipa: noop_gipa,
            create_device: None,
            destroy_instance: None,
            get_physical_device_properties: None,
            get_surface_capabilities: None,
            get_surface_present_modes: None,
            physical_devices: physical_devices
                .iter()
                .map(|&pd| vk::PhysicalDevice::from_raw(pd))
                .collect(),
        })
    }

    pub fn device_context(raw: u64, instance: &Arc<InstanceContext>) -> Arc<DeviceContext> {
        Arc::new(DeviceContext {
            device: vk::Device::from_raw(raw),
            next_gdpa: noop_gdpa,
            fwd: DeviceForward::default(),
            instance: Arc::downgrade(instance),
            physical_device: instance
                .physical_devices
                .first()
                .copied()
                .unwrap_or(vk::PhysicalDevice::null()),
            max_sampler_lod_bias: 4.0,
            max_sampler_anisotropy: 16.0,
            limiter: Mutex::new(None),
            present_mode: Mutex::new(None),
            surface_stale: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_register_lookup_unregister() {
        let registry = Registry::new();
        let instance = instance_context(0x10, &[0x100, 0x101]);
        registry.register_instance(Arc::clone(&instance));

        assert!(registry.lookup_instance(vk::Instance::from_raw(0x10)).is_some());
        assert!(registry.lookup_instance(vk::Instance::from_raw(0x99)).is_none());
        assert!(registry
            .lookup_instance_by_physical_device(vk::PhysicalDevice::from_raw(0x101))
            .is_some());
        assert!(registry
            .lookup_instance_by_physical_device(vk::PhysicalDevice::from_raw(0x999))
            .is_none());

        let device = device_context(0x20, &instance);
        registry.register_device(Arc::clone(&device));
        registry.register_queue(vk::Queue::from_raw(0x30), &device);

        let by_queue = registry
            .lookup_device_by_queue(vk::Queue::from_raw(0x30))
            .unwrap();
        assert!(Arc::ptr_eq(&by_queue, &device));

        assert!(registry.unregister_device(vk::Device::from_raw(0x20)).is_some());
        assert!(registry.lookup_device(vk::Device::from_raw(0x20)).is_none());
        // Queue links die with their device.
        assert!(registry.lookup_device_by_queue(vk::Queue::from_raw(0x30)).is_none());

        assert!(registry.unregister_instance(vk::Instance::from_raw(0x10)).is_some());
        assert_eq!(registry.instance_count(), 0);
    }

    #[test]
    fn test_queue_purge_is_scoped_to_one_device() {
        let registry = Registry::new();
        let instance = instance_context(1, &[2]);
        let dev_a = device_context(0xa0, &instance);
        let dev_b = device_context(0xb0, &instance);
        registry.register_device(Arc::clone(&dev_a));
        registry.register_device(Arc::clone(&dev_b));
        registry.register_queue(vk::Queue::from_raw(0xa1), &dev_a);
        registry.register_queue(vk::Queue::from_raw(0xb1), &dev_b);

        registry.unregister_device(vk::Device::from_raw(0xa0));

        assert!(registry.lookup_device_by_queue(vk::Queue::from_raw(0xa1)).is_none());
        assert!(registry.lookup_device_by_queue(vk::Queue::from_raw(0xb1)).is_some());
    }

    #[test]
    fn test_device_survives_instance_teardown() {
        // Destroying an instance while one of its devices is still tracked
        // must leave device lookups intact; only the back-reference expires.
        let registry = Registry::new();
        let instance = instance_context(1, &[2]);
        registry.register_instance(Arc::clone(&instance));

        let device = device_context(0x20, &instance);
        registry.register_device(Arc::clone(&device));

        registry.unregister_instance(vk::Instance::from_raw(1));
        drop(instance);

        let found = registry.lookup_device(vk::Device::from_raw(0x20)).unwrap();
        assert!(found.instance.upgrade().is_none());
    }

    #[test]
    fn test_concurrent_churn_stays_consistent() {
        const THREADS: u64 = 8;
        const DEVICES_PER_THREAD: u64 = 50;

        let registry = Registry::new();
        let instance = instance_context(1, &[2]);
        registry.register_instance(Arc::clone(&instance));

        std::thread::scope(|scope| {
            for thread in 0..THREADS {
                let registry = &registry;
                let instance = &instance;
                scope.spawn(move || {
                    for i in 0..DEVICES_PER_THREAD {
                        let raw = (thread << 32) | (i + 1);
                        let device = device_context(raw, instance);
                        registry.register_device(Arc::clone(&device));
                        registry.register_queue(vk::Queue::from_raw(raw | 0x1_0000_0000_0000), &device);

                        // Interleave lookups on handles other threads own.
                        let other = ((thread + 1) % THREADS) << 32 | (i + 1);
                        let _ = registry.lookup_device(vk::Device::from_raw(other));

                        if i % 2 == 0 {
                            registry.unregister_device(vk::Device::from_raw(raw));
                        }
                    }
                });
            }
        });

        // Every surviving queue link must resolve to a registered device.
        let tables = registry.device_tables.read();
        for owner in tables.queues.values() {
            assert!(tables
                .devices
                .values()
                .any(|device| Arc::ptr_eq(device, owner)));
        }
        assert_eq!(
            tables.devices.len() as u64,
            THREADS * DEVICES_PER_THREAD / 2
        );
    }
}
