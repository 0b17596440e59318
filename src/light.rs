// The light registry
//
// Lights are stored partitioned by type so the packed GPU buffer can be
// three tight arrays behind a small count header. Handles are
// refcounted: dropping the last clone of a handle reclaims the light's
// slot. Each light carries up to MAX_SHADOWS_PER_LIGHT shadow slot
// indices; enabling one more than that is an error, not undefined
// behavior.

use std::sync::{Arc, Mutex};

use ash::vk;
use cgmath::Vector3;

use crate::camera::Camera;
use crate::device::{Device, MappedBuffer};
use crate::frame_state::FrameRenderState;
use crate::shadow::{ShadowHandle, ShadowPool};
use crate::util::{IdPool, IndexMap};
use crate::{Result, StratusError};

/// Fixed bound on the shadow maps a single light can drive.
pub const MAX_SHADOWS_PER_LIGHT: usize = 4;

const LIGHT_TYPE_SUN: u32 = 0;
const LIGHT_TYPE_POINT: u32 = 1;
const LIGHT_TYPE_AMBIENT: u32 = 2;

/// Size of the {n_sun, n_point, n_ambient} header.
const HEADER_SIZE: usize = 3 * std::mem::size_of::<u32>();

/// The packed per-light record. This must match the shader's light
/// struct layout exactly.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightDeviceData {
    pub color: [f32; 4],
    pub position: [f32; 4],
    pub direction: [f32; 4],
    pub ambient_percentage: f32,
    pub attenuation_linear: f32,
    pub attenuation_quadratic: f32,
    pub light_type: u32,
    pub num_shadow_maps: u32,
    pub shadow_map_indices: [u32; MAX_SHADOWS_PER_LIGHT],
    padding: [u32; 3],
}

const LIGHT_SIZE: usize = std::mem::size_of::<LightDeviceData>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LightKind {
    Sun,
    Point,
    Ambient,
}

struct Partition {
    p_ids: IdPool,
    p_lights: IndexMap<LightDeviceData>,
}

impl Partition {
    fn new() -> Self {
        Self {
            p_ids: IdPool::new(),
            p_lights: IndexMap::new(),
        }
    }
}

struct LightStore {
    ls_sun: Partition,
    ls_point: Partition,
    ls_ambient: Partition,
}

impl LightStore {
    fn partition(&mut self, kind: LightKind) -> &mut Partition {
        match kind {
            LightKind::Sun => &mut self.ls_sun,
            LightKind::Point => &mut self.ls_point,
            LightKind::Ambient => &mut self.ls_ambient,
        }
    }
}

struct LightInner {
    li_kind: LightKind,
    li_slot: u32,
    li_store: Arc<Mutex<LightStore>>,
}

impl Drop for LightInner {
    fn drop(&mut self) {
        let mut store = self.li_store.lock().unwrap();
        let part = store.partition(self.li_kind);
        part.p_lights.remove(self.li_slot);
        part.p_ids.free(self.li_slot);
    }
}

/// Refcounted handle to one light. The registry slot is reclaimed when
/// the last clone drops.
#[derive(Clone)]
pub struct LightHandle {
    lh_inner: Arc<LightInner>,
}

impl LightHandle {
    fn modify<F: FnOnce(&mut LightDeviceData)>(&self, func: F) {
        let mut store = self.lh_inner.li_store.lock().unwrap();
        let part = store.partition(self.lh_inner.li_kind);
        if let Some(light) = part.p_lights.get_mut(self.lh_inner.li_slot) {
            func(light);
        }
    }

    pub fn set_color(&self, color: Vector3<f32>) {
        self.modify(|l| l.color = [color.x, color.y, color.z, 1.0]);
    }

    pub fn set_direction(&self, direction: Vector3<f32>) {
        self.modify(|l| l.direction = [direction.x, direction.y, direction.z, 0.0]);
    }

    pub fn set_position(&self, position: Vector3<f32>) {
        self.modify(|l| l.position = [position.x, position.y, position.z, 1.0]);
    }

    /// Snapshot of the packed record, mostly useful for inspection.
    pub fn device_data(&self) -> Option<LightDeviceData> {
        let mut store = self.lh_inner.li_store.lock().unwrap();
        let part = store.partition(self.lh_inner.li_kind);
        part.p_lights.get(self.lh_inner.li_slot).copied()
    }
}

/// Collection and management unit for lights and their shadow linkage.
pub struct LightRegistry {
    lr_store: Arc<Mutex<LightStore>>,
}

impl LightRegistry {
    pub fn new() -> Self {
        Self {
            lr_store: Arc::new(Mutex::new(LightStore {
                ls_sun: Partition::new(),
                ls_point: Partition::new(),
                ls_ambient: Partition::new(),
            })),
        }
    }

    fn make_light(&self, kind: LightKind, data: LightDeviceData) -> LightHandle {
        let slot = {
            let mut store = self.lr_store.lock().unwrap();
            let part = store.partition(kind);
            let slot = part.p_ids.generate();
            part.p_lights.insert(slot, data);
            slot
        };

        LightHandle {
            lh_inner: Arc::new(LightInner {
                li_kind: kind,
                li_slot: slot,
                li_store: self.lr_store.clone(),
            }),
        }
    }

    pub fn make_sun_light(
        &self,
        color: Vector3<f32>,
        direction: Vector3<f32>,
        ambient_percent: f32,
    ) -> LightHandle {
        self.make_light(
            LightKind::Sun,
            LightDeviceData {
                color: [color.x, color.y, color.z, 1.0],
                position: [0.0; 4],
                direction: [direction.x, direction.y, direction.z, 0.0],
                ambient_percentage: ambient_percent,
                attenuation_linear: 0.0,
                attenuation_quadratic: 0.0,
                light_type: LIGHT_TYPE_SUN,
                num_shadow_maps: 0,
                shadow_map_indices: [0; MAX_SHADOWS_PER_LIGHT],
                padding: [0; 3],
            },
        )
    }

    pub fn make_point_light(
        &self,
        color: Vector3<f32>,
        position: Vector3<f32>,
        attenuation_linear: f32,
        attenuation_quadratic: f32,
    ) -> LightHandle {
        self.make_light(
            LightKind::Point,
            LightDeviceData {
                color: [color.x, color.y, color.z, 1.0],
                position: [position.x, position.y, position.z, 1.0],
                direction: [0.0; 4],
                ambient_percentage: 0.0,
                attenuation_linear,
                attenuation_quadratic,
                light_type: LIGHT_TYPE_POINT,
                num_shadow_maps: 0,
                shadow_map_indices: [0; MAX_SHADOWS_PER_LIGHT],
                padding: [0; 3],
            },
        )
    }

    pub fn make_ambient_light(&self, color: Vector3<f32>) -> LightHandle {
        self.make_light(
            LightKind::Ambient,
            LightDeviceData {
                color: [color.x, color.y, color.z, 1.0],
                position: [0.0; 4],
                direction: [0.0; 4],
                ambient_percentage: 1.0,
                attenuation_linear: 0.0,
                attenuation_quadratic: 0.0,
                light_type: LIGHT_TYPE_AMBIENT,
                num_shadow_maps: 0,
                shadow_map_indices: [0; MAX_SHADOWS_PER_LIGHT],
                padding: [0; 3],
            },
        )
    }

    /// Allocate a shadow slot from `pool` and link it to `light`.
    ///
    /// Fails with a capacity error if the light already drives
    /// MAX_SHADOWS_PER_LIGHT shadow maps, or if the pool is full.
    /// Dropping the returned handle unlinks the slot again.
    pub fn enable_shadow(
        &self,
        light: &LightHandle,
        pool: &ShadowPool,
        resolution: u32,
        camera: Camera,
    ) -> Result<ShadowHandle> {
        let kind = light.lh_inner.li_kind;
        let slot = light.lh_inner.li_slot;

        {
            let mut store = self.lr_store.lock().unwrap();
            let data = store
                .partition(kind)
                .p_lights
                .get(slot)
                .ok_or(StratusError::ASSET_NOT_FOUND)?;
            if data.num_shadow_maps as usize >= MAX_SHADOWS_PER_LIGHT {
                return Err(StratusError::CAPACITY_EXCEEDED);
            }
        }

        let mut shadow = pool.allocate(resolution, camera)?;
        let shadow_slot = shadow.slot();

        {
            let mut store = self.lr_store.lock().unwrap();
            if let Some(data) = store.partition(kind).p_lights.get_mut(slot) {
                let n = data.num_shadow_maps as usize;
                data.shadow_map_indices[n] = shadow_slot;
                data.num_shadow_maps += 1;
            }
        }

        // When the shadow is disabled, unlink its index from the light
        let store = self.lr_store.clone();
        shadow.set_on_free(Box::new(move |freed| {
            let mut store = store.lock().unwrap();
            if let Some(data) = store.partition(kind).p_lights.get_mut(slot) {
                let n = data.num_shadow_maps as usize;
                if let Some(pos) =
                    data.shadow_map_indices[..n].iter().position(|&s| s == freed)
                {
                    // Compact the index list
                    for i in pos..n - 1 {
                        data.shadow_map_indices[i] = data.shadow_map_indices[i + 1];
                    }
                    data.shadow_map_indices[n - 1] = 0;
                    data.num_shadow_maps -= 1;
                }
            }
        }));

        Ok(shadow)
    }

    fn counts(&self) -> (usize, usize, usize) {
        let store = self.lr_store.lock().unwrap();
        (
            store.ls_sun.p_lights.len(),
            store.ls_point.p_lights.len(),
            store.ls_ambient.p_lights.len(),
        )
    }

    /// The buffer size `write_light_data` currently needs. Exposed so
    /// the scene descriptor can resize its light buffer.
    pub fn required_light_data_size(&self) -> usize {
        let (sun, point, ambient) = self.counts();
        HEADER_SIZE + LIGHT_SIZE * (sun + point + ambient)
    }

    /// Pack the header and the three type partitions tightly into
    /// `out`. Idempotent: no internal state changes, two consecutive
    /// calls produce identical bytes.
    pub fn write_light_data(&self, out: &mut [u8]) -> usize {
        let store = self.lr_store.lock().unwrap();
        assert!(
            out.len() >= HEADER_SIZE
                + LIGHT_SIZE
                    * (store.ls_sun.p_lights.len()
                        + store.ls_point.p_lights.len()
                        + store.ls_ambient.p_lights.len()),
            "light buffer too small, query required_light_data_size first"
        );

        let header = [
            store.ls_sun.p_lights.len() as u32,
            store.ls_point.p_lights.len() as u32,
            store.ls_ambient.p_lights.len() as u32,
        ];
        unsafe {
            std::ptr::copy_nonoverlapping(
                header.as_ptr() as *const u8,
                out.as_mut_ptr(),
                HEADER_SIZE,
            );
        }

        let mut offset = HEADER_SIZE;
        for part in [&store.ls_sun, &store.ls_point, &store.ls_ambient].iter() {
            for (_, light) in part.p_lights.iter() {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        light as *const LightDeviceData as *const u8,
                        out.as_mut_ptr().add(offset),
                        LIGHT_SIZE,
                    );
                }
                offset += LIGHT_SIZE;
            }
        }

        offset
    }
}

/// The device-side home of the packed light data. Grows when the
/// registry outgrows it; the scene descriptor is expected to rebind
/// after a growth step.
pub struct LightBuffer {
    lb_buffer: MappedBuffer,
    lb_capacity: usize,
}

impl LightBuffer {
    pub fn new(dev: &Device, registry: &LightRegistry) -> Result<Self> {
        let capacity = registry.required_light_data_size().max(HEADER_SIZE);
        Ok(Self {
            lb_buffer: dev.create_mapped_buffer(
                vk::BufferUsageFlags::STORAGE_BUFFER,
                capacity as u64,
            )?,
            lb_capacity: capacity,
        })
    }

    pub fn vk_buffer(&self) -> vk::Buffer {
        self.lb_buffer.vk_buffer()
    }

    /// Repack the registry into the buffer, reallocating first if it
    /// no longer fits. Returns true when the buffer was replaced and
    /// descriptors referencing it must be rewritten.
    pub fn update(
        &mut self,
        dev: &Arc<Device>,
        registry: &LightRegistry,
        frame: &Arc<FrameRenderState>,
    ) -> Result<bool> {
        let required = registry.required_light_data_size();
        let mut reallocated = false;

        if required > self.lb_capacity {
            let mut capacity = self.lb_capacity.max(HEADER_SIZE);
            while capacity < required {
                capacity *= 2;
            }

            let new_buffer =
                dev.create_mapped_buffer(vk::BufferUsageFlags::STORAGE_BUFFER, capacity as u64)?;
            let old = std::mem::replace(&mut self.lb_buffer, new_buffer);

            // The old buffer may still be read by frames in flight
            let retire_dev = dev.clone();
            frame.on_render_finished(move || old.destroy(&retire_dev));
            self.lb_capacity = capacity;
            reallocated = true;
        }

        let mut packed = vec![0u8; required];
        registry.write_light_data(&mut packed);
        self.lb_buffer.write_at(0, &packed);

        Ok(reallocated)
    }

    pub fn destroy(&self, dev: &Device) {
        self.lb_buffer.destroy(dev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: f32, y: f32, z: f32) -> Vector3<f32> {
        Vector3::new(x, y, z)
    }

    #[test]
    fn record_size_is_fixed() {
        // The shader-side struct layout depends on this
        assert_eq!(LIGHT_SIZE, 96);
    }

    #[test]
    fn packs_header_then_type_partitions() {
        let registry = LightRegistry::new();
        let _sun = registry.make_sun_light(v(1.0, 0.0, 0.0), v(0.0, -1.0, 0.0), 0.2);
        let _point = registry.make_point_light(v(0.0, 1.0, 0.0), v(5.0, 0.0, 0.0), 0.5, 0.1);
        let _ambient = registry.make_ambient_light(v(0.1, 0.1, 0.1));
        let _sun2 = registry.make_sun_light(v(0.0, 0.0, 1.0), v(1.0, 0.0, 0.0), 0.0);

        let size = registry.required_light_data_size();
        assert_eq!(size, 12 + 4 * 96);

        let mut buf = vec![0u8; size];
        registry.write_light_data(&mut buf);

        let header: [u32; 3] = [
            u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]),
            u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]),
            u32::from_ne_bytes([buf[8], buf[9], buf[10], buf[11]]),
        ];
        assert_eq!(header, [2, 1, 1]);

        // First record after the header is the first sun light
        let first = &buf[12..12 + 16];
        let color: Vec<f32> = first
            .chunks(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(color, vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn write_is_idempotent() {
        let registry = LightRegistry::new();
        let _a = registry.make_sun_light(v(1.0, 1.0, 1.0), v(0.0, -1.0, 0.0), 0.0);
        let _b = registry.make_point_light(v(1.0, 0.5, 0.2), v(0.0, 2.0, 0.0), 0.1, 0.0);

        let size = registry.required_light_data_size();
        let mut one = vec![0u8; size];
        let mut two = vec![0u8; size];
        registry.write_light_data(&mut one);
        registry.write_light_data(&mut two);
        assert_eq!(one, two);
    }

    #[test]
    fn dropping_a_handle_reclaims_the_slot() {
        let registry = LightRegistry::new();
        let keep = registry.make_sun_light(v(1.0, 1.0, 1.0), v(0.0, -1.0, 0.0), 0.0);
        let gone = registry.make_sun_light(v(0.5, 0.5, 0.5), v(1.0, 0.0, 0.0), 0.0);
        drop(gone);

        assert_eq!(registry.required_light_data_size(), 12 + 96);

        // The surviving light is still intact
        let data = keep.device_data().unwrap();
        assert_eq!(data.light_type, LIGHT_TYPE_SUN);

        // A clone keeps the slot alive
        let clone = keep.clone();
        drop(keep);
        assert!(clone.device_data().is_some());
    }

    #[test]
    fn mutation_shows_in_packed_output() {
        let registry = LightRegistry::new();
        let sun = registry.make_sun_light(v(1.0, 1.0, 1.0), v(0.0, -1.0, 0.0), 0.0);

        sun.set_color(v(0.25, 0.5, 0.75));
        let data = sun.device_data().unwrap();
        assert_eq!(data.color, [0.25, 0.5, 0.75, 1.0]);
    }
}
