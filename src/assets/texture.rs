// The texture registry
//
// One RGBA8 image per texture, sampled through a single bindless-style
// sampler array. The descriptor slot for a texture equals its local id
// for as long as it is resident.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::assets::descriptor::{AssetBinding, DescriptorBindingInfo, DescriptorUpdate};
use crate::assets::{AssetSource, AssetId, Texture};
use crate::cache::{DataHandle, DeviceDataCache};
use crate::device::{Device, Image};
use crate::frame_state::FrameRenderState;
use crate::util::{IdPool, IndexMap};
use crate::writer::ResourceDataWriter;
use crate::{Result, StratusError};

/// Host-side texture content, always 8-bit RGBA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

pub struct TextureDeviceData {
    t_device_index: u32,
    t_image: Image,
}

impl TextureDeviceData {
    pub fn destroy(&self, dev: &Device) {
        self.t_image.destroy(dev);
    }
}

#[derive(Clone)]
pub struct TextureHandle {
    th_data: DataHandle<TextureDeviceData>,
}

impl TextureHandle {
    /// The slot in the texture sampler array.
    pub fn device_index(&self) -> u32 {
        self.th_data.t_device_index
    }

    pub fn view(&self) -> vk::ImageView {
        self.th_data.t_image.i_view
    }
}

struct SourceTable {
    st_ids: IdPool,
    st_sources: IndexMap<Box<dyn AssetSource<Texture>>>,
}

pub struct TextureRegistry {
    t_device: Arc<Device>,
    t_capacity: u32,
    t_sources: Mutex<SourceTable>,
    t_cache: DeviceDataCache<TextureDeviceData>,
    t_writer: Mutex<ResourceDataWriter>,
    t_updates: Mutex<Vec<DescriptorUpdate>>,
    t_zombies: Mutex<HashSet<u32>>,
}

impl TextureRegistry {
    pub fn new(device: Arc<Device>, capacity: u32) -> Self {
        Self {
            t_writer: Mutex::new(ResourceDataWriter::new(device.clone())),
            t_device: device,
            t_capacity: capacity,
            t_sources: Mutex::new(SourceTable {
                st_ids: IdPool::new(),
                st_sources: IndexMap::new(),
            }),
            t_cache: DeviceDataCache::new(),
            t_updates: Mutex::new(Vec::new()),
            t_zombies: Mutex::new(HashSet::new()),
        }
    }

    pub fn add(&self, source: Box<dyn AssetSource<Texture>>) -> Result<AssetId<Texture>> {
        let mut sources = self.t_sources.lock().unwrap();
        // The descriptor array cannot address slots past its capacity
        if sources.st_ids.num_allocated() >= self.t_capacity {
            return Err(StratusError::CAPACITY_EXCEEDED);
        }
        let id = sources.st_ids.generate();
        sources.st_sources.insert(id, source);
        Ok(AssetId::new(id))
    }

    pub fn remove(&self, id: AssetId<Texture>) -> Result<()> {
        let mut sources = self.t_sources.lock().unwrap();
        if sources.st_sources.remove(id.raw()).is_none() {
            return Err(StratusError::ASSET_NOT_FOUND);
        }
        if self.t_cache.is_loaded(id.raw()) {
            self.t_zombies.lock().unwrap().insert(id.raw());
        } else {
            sources.st_ids.free(id.raw());
        }
        Ok(())
    }

    pub fn get(&self, id: AssetId<Texture>) -> Result<TextureHandle> {
        let data = self
            .t_cache
            .get_with(id.raw(), |raw| self.load_device_data(raw))?;
        Ok(TextureHandle { th_data: data })
    }

    fn load_device_data(&self, id: u32) -> Result<TextureDeviceData> {
        let sources = self.t_sources.lock().unwrap();
        let source = sources
            .st_sources
            .get(id)
            .ok_or(StratusError::ASSET_NOT_FOUND)?;
        let data = source.load()?;

        let expected = data.width as usize * data.height as usize * 4;
        if data.width == 0 || data.height == 0 || data.pixels.len() != expected {
            return Err(StratusError::VALIDATION_FAILED);
        }

        let image = self.t_device.create_image(
            vk::Extent2D {
                width: data.width,
                height: data.height,
            },
            vk::Format::R8G8B8A8_UNORM,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            vk::ImageAspectFlags::COLOR,
        )?;

        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        let mut writer = self.t_writer.lock().unwrap();
        writer.barrier_pre_write_image(
            vk::PipelineStageFlags::HOST,
            vk::PipelineStageFlags::TRANSFER,
            vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::HOST_WRITE)
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.i_image)
                .subresource_range(range)
                .build(),
        );
        writer.write_image(
            image.i_image,
            vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            vk::Offset3D { x: 0, y: 0, z: 0 },
            vk::Extent3D {
                width: data.width,
                height: data.height,
                depth: 1,
            },
            &data.pixels,
        )?;
        writer.barrier_post_write_image(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::ALL_GRAPHICS | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::ImageMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.i_image)
                .subresource_range(range)
                .build(),
        );

        self.t_updates.lock().unwrap().push(DescriptorUpdate::sampler(
            AssetBinding::Textures as u32,
            id,
            image.i_sampler,
            image.i_view,
        ));

        Ok(TextureDeviceData {
            t_device_index: id,
            t_image: image,
        })
    }

    pub fn update(&self, cmd: vk::CommandBuffer, frame: &Arc<FrameRenderState>) -> Result<()> {
        self.t_writer.lock().unwrap().update(cmd, frame);

        for data in self.t_cache.drain_pending_unloads() {
            let raw = data.t_device_index;
            if self.t_zombies.lock().unwrap().remove(&raw) {
                self.t_sources.lock().unwrap().st_ids.free(raw);
            }
            let dev = self.t_device.clone();
            frame.on_render_finished(move || data.destroy(&dev));
        }
        Ok(())
    }

    pub fn descriptor_layout_bindings(&self) -> Vec<DescriptorBindingInfo> {
        vec![DescriptorBindingInfo {
            binding: AssetBinding::Textures as u32,
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count: self.t_capacity,
            stages: vk::ShaderStageFlags::ALL,
            flags: vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        }]
    }

    pub fn descriptor_updates(&self) -> Vec<DescriptorUpdate> {
        std::mem::replace(&mut *self.t_updates.lock().unwrap(), Vec::new())
    }

    pub fn destroy(&self) {
        for data in self.t_cache.drain_pending_unloads() {
            data.destroy(&self.t_device);
        }
    }
}
