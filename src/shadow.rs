// The shadow map pool
//
// Shadow maps live in fixed-capacity slots. A slot index is stable for
// the lifetime of the shadow and doubles as the index into both the
// shadow-matrix buffer and the shadow-map sampler array, so shaders can
// address a shadow with one integer. Disabling a shadow frees its slot
// for the next allocation, lowest index first.

use std::sync::{Arc, Mutex, Weak};

use ash::vk;

use crate::assets::descriptor::{
    DescriptorBindingInfo, DescriptorUpdate, SharedDescriptorSet,
};
use crate::camera::Camera;
use crate::device::{Device, Image, MappedBuffer};
use crate::frame_state::FrameRenderState;
use crate::util::SlotAllocator;
use crate::Result;

const SHADOW_MAP_FORMAT: vk::Format = vk::Format::D32_SFLOAT;
const MATRIX_SIZE: usize = std::mem::size_of::<[[f32; 4]; 4]>();

pub struct ShadowPoolCreateInfo {
    /// Slot capacity K of the pool
    pub max_shadow_maps: u32,
}

struct ShadowSlot {
    ss_camera: Camera,
    ss_image: Image,
    #[allow(dead_code)]
    ss_resolution: u32,
}

struct ShadowPoolInternal {
    spi_slots: crate::util::IndexMap<ShadowSlot>,
    spi_alloc: SlotAllocator,
    /// Images of freed slots, destroyed once the current frame retires
    spi_retired_images: Vec<Image>,
}

pub struct ShadowPool {
    sp_device: Arc<Device>,
    /// K * mat4, host coherent, rewritten by update()
    sp_matrix_buffer: MappedBuffer,
    sp_internal: Arc<Mutex<ShadowPoolInternal>>,
}

/// Owning handle for one shadow slot. Dropping it frees the slot.
pub struct ShadowHandle {
    sh_slot: u32,
    sh_pool: Weak<Mutex<ShadowPoolInternal>>,
    /// Invoked with the slot index when the shadow is disabled; the
    /// light registry uses this to unlink the slot from its light
    sh_on_free: Option<Box<dyn FnOnce(u32) + Send>>,
}

impl ShadowHandle {
    /// The stable index into the matrix buffer and the sampler array.
    pub fn slot(&self) -> u32 {
        self.sh_slot
    }

    pub fn set_camera(&self, camera: Camera) {
        if let Some(pool) = self.sh_pool.upgrade() {
            let mut internal = pool.lock().unwrap();
            if let Some(slot) = internal.spi_slots.get_mut(self.sh_slot) {
                slot.ss_camera = camera;
            }
        }
    }

    pub(crate) fn set_on_free(&mut self, func: Box<dyn FnOnce(u32) + Send>) {
        self.sh_on_free = Some(func);
    }
}

impl Drop for ShadowHandle {
    fn drop(&mut self) {
        if let Some(pool) = self.sh_pool.upgrade() {
            let mut internal = pool.lock().unwrap();
            if let Some(slot) = internal.spi_slots.remove(self.sh_slot) {
                internal.spi_retired_images.push(slot.ss_image);
                internal.spi_alloc.release(self.sh_slot);
            }
        }
        if let Some(func) = self.sh_on_free.take() {
            func(self.sh_slot);
        }
    }
}

impl ShadowPool {
    pub fn new(device: Arc<Device>, info: &ShadowPoolCreateInfo) -> Result<Self> {
        assert!(info.max_shadow_maps > 0, "shadow pool capacity must be > 0");

        // A storage rather than uniform buffer: the matrix array is
        // dynamically sized in GLSL
        let matrix_buffer = device.create_mapped_buffer(
            vk::BufferUsageFlags::STORAGE_BUFFER,
            (MATRIX_SIZE as u32 * info.max_shadow_maps) as u64,
        )?;

        Ok(Self {
            sp_device: device,
            sp_matrix_buffer: matrix_buffer,
            sp_internal: Arc::new(Mutex::new(ShadowPoolInternal {
                spi_slots: crate::util::IndexMap::new(),
                spi_alloc: SlotAllocator::new(info.max_shadow_maps),
                spi_retired_images: Vec::new(),
            })),
        })
    }

    /// Allocate a shadow slot with its own depth image at `resolution`.
    /// Fails with a capacity error once all K slots are live.
    pub fn allocate(&self, resolution: u32, camera: Camera) -> Result<ShadowHandle> {
        let mut internal = self.sp_internal.lock().unwrap();
        let slot = internal.spi_alloc.reserve()?;

        let image = match self.sp_device.create_image(
            vk::Extent2D {
                width: resolution,
                height: resolution,
            },
            SHADOW_MAP_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::DEPTH,
        ) {
            Ok(image) => image,
            Err(e) => {
                internal.spi_alloc.release(slot);
                return Err(e);
            }
        };

        internal.spi_slots.insert(
            slot,
            ShadowSlot {
                ss_camera: camera,
                ss_image: image,
                ss_resolution: resolution,
            },
        );

        Ok(ShadowHandle {
            sh_slot: slot,
            sh_pool: Arc::downgrade(&self.sp_internal),
            sh_on_free: None,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.sp_internal.lock().unwrap().spi_alloc.capacity()
    }

    pub fn num_live(&self) -> u32 {
        self.sp_internal.lock().unwrap().spi_alloc.num_live()
    }

    /// Recompute every live slot's view x projection into the matrix
    /// buffer and retire freed slot images to the current frame.
    pub fn update(&self, frame: &Arc<FrameRenderState>) {
        let mut internal = self.sp_internal.lock().unwrap();

        for (slot, shadow) in internal.spi_slots.iter() {
            let viewproj: [[f32; 4]; 4] = shadow.ss_camera.view_projection().into();
            self.sp_matrix_buffer
                .write_at(slot as usize * MATRIX_SIZE, &[viewproj]);
        }

        for image in internal.spi_retired_images.drain(..) {
            let dev = self.sp_device.clone();
            frame.on_render_finished(move || image.destroy(&dev));
        }
    }

    pub fn matrix_buffer(&self) -> vk::Buffer {
        self.sp_matrix_buffer.vk_buffer()
    }

    /// The layout schema of the shadow descriptor set: the matrix
    /// buffer plus a partially bound sampler array of size K.
    pub fn descriptor_layout_bindings(max_shadow_maps: u32) -> Vec<DescriptorBindingInfo> {
        let stages = vk::ShaderStageFlags::VERTEX
            | vk::ShaderStageFlags::FRAGMENT
            | vk::ShaderStageFlags::COMPUTE;
        vec![
            DescriptorBindingInfo {
                binding: 0,
                ty: vk::DescriptorType::STORAGE_BUFFER,
                count: 1,
                stages,
                flags: vk::DescriptorBindingFlags::empty(),
            },
            DescriptorBindingInfo {
                binding: 1,
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                count: max_shadow_maps,
                stages,
                flags: vk::DescriptorBindingFlags::PARTIALLY_BOUND,
            },
        ]
    }

    /// Writes for the current slot mapping: the matrix buffer and one
    /// sampler per live slot.
    pub fn descriptor_updates(&self) -> Vec<DescriptorUpdate> {
        let internal = self.sp_internal.lock().unwrap();

        let mut updates = vec![DescriptorUpdate::buffer(
            0,
            0,
            self.sp_matrix_buffer.vk_buffer(),
        )];
        for (slot, shadow) in internal.spi_slots.iter() {
            updates.push(DescriptorUpdate::sampler(
                1,
                slot,
                shadow.ss_image.i_sampler,
                shadow.ss_image.i_view,
            ));
        }
        updates
    }

    /// Tear down all pool resources. Only valid once the device is
    /// idle.
    pub fn destroy(&self) {
        let mut internal = self.sp_internal.lock().unwrap();
        let ids: Vec<u32> = internal.spi_slots.iter().map(|(id, _)| id).collect();
        for id in ids {
            if let Some(slot) = internal.spi_slots.remove(id) {
                slot.ss_image.destroy(&self.sp_device);
            }
        }
        for image in internal.spi_retired_images.drain(..) {
            image.destroy(&self.sp_device);
        }
        self.sp_matrix_buffer.destroy(&self.sp_device);
    }
}

impl crate::renderer::FrameUpdater for ShadowPool {
    fn frame_update(
        &mut self,
        _dev: &Device,
        _cmd: ash::vk::CommandBuffer,
        frame: &Arc<FrameRenderState>,
    ) -> Result<()> {
        ShadowPool::update(self, frame);
        Ok(())
    }
}

/// The shadow descriptor set: matrix buffer at binding 0, the sampler
/// array at binding 1 with only live slots bound.
pub struct ShadowDescriptor {
    sd_set: SharedDescriptorSet,
}

impl ShadowDescriptor {
    pub fn new(dev: &Device, max_shadow_maps: u32) -> Result<Self> {
        let bindings = ShadowPool::descriptor_layout_bindings(max_shadow_maps);
        Ok(Self {
            sd_set: SharedDescriptorSet::new(dev, &bindings)?,
        })
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.sd_set.layout()
    }

    pub fn set(&self) -> &SharedDescriptorSet {
        &self.sd_set
    }

    /// Refresh the set to the pool's current slot mapping.
    pub fn update(&self, dev: &Device, pool: &ShadowPool) {
        self.sd_set.apply_updates(dev, &pool.descriptor_updates());
    }

    pub fn destroy(&self, dev: &Device) {
        self.sd_set.destroy(dev);
    }
}
