// The font registry
//
// A font asset is a pre-rasterized glyph map: one single-channel atlas
// image plus the per-glyph metrics needed to address it. The atlas
// images live in their own sampler array next to the texture array.
// Rasterization itself happens in the asset pipeline, not here.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::assets::descriptor::{AssetBinding, DescriptorBindingInfo, DescriptorUpdate};
use crate::assets::{AssetSource, AssetId, Font};
use crate::cache::{DataHandle, DeviceDataCache};
use crate::device::{Device, Image};
use crate::frame_state::FrameRenderState;
use crate::util::{IdPool, IndexMap};
use crate::writer::ResourceDataWriter;
use crate::{Result, StratusError};

/// Placement of one glyph inside the atlas, in texels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GlyphMetrics {
    pub codepoint: u32,
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Horizontal advance in texels at the baked size
    pub advance: u32,
}

/// Host-side font content: an R8 atlas and its glyph table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FontData {
    pub atlas_width: u32,
    pub atlas_height: u32,
    pub atlas_pixels: Vec<u8>,
    pub glyphs: Vec<GlyphMetrics>,
}

pub struct FontDeviceData {
    f_device_index: u32,
    f_image: Image,
    f_glyphs: Vec<GlyphMetrics>,
}

impl FontDeviceData {
    pub fn destroy(&self, dev: &Device) {
        self.f_image.destroy(dev);
    }
}

#[derive(Clone)]
pub struct FontHandle {
    fh_data: DataHandle<FontDeviceData>,
}

impl FontHandle {
    pub fn device_index(&self) -> u32 {
        self.fh_data.f_device_index
    }

    pub fn glyph(&self, codepoint: u32) -> Option<GlyphMetrics> {
        self.fh_data
            .f_glyphs
            .iter()
            .find(|g| g.codepoint == codepoint)
            .copied()
    }
}

struct SourceTable {
    st_ids: IdPool,
    st_sources: IndexMap<Box<dyn AssetSource<Font>>>,
}

pub struct FontRegistry {
    f_device: Arc<Device>,
    f_capacity: u32,
    f_sources: Mutex<SourceTable>,
    f_cache: DeviceDataCache<FontDeviceData>,
    f_writer: Mutex<ResourceDataWriter>,
    f_updates: Mutex<Vec<DescriptorUpdate>>,
    f_zombies: Mutex<HashSet<u32>>,
}

impl FontRegistry {
    pub fn new(device: Arc<Device>, capacity: u32) -> Self {
        Self {
            f_writer: Mutex::new(ResourceDataWriter::new(device.clone())),
            f_device: device,
            f_capacity: capacity,
            f_sources: Mutex::new(SourceTable {
                st_ids: IdPool::new(),
                st_sources: IndexMap::new(),
            }),
            f_cache: DeviceDataCache::new(),
            f_updates: Mutex::new(Vec::new()),
            f_zombies: Mutex::new(HashSet::new()),
        }
    }

    pub fn add(&self, source: Box<dyn AssetSource<Font>>) -> Result<AssetId<Font>> {
        let mut sources = self.f_sources.lock().unwrap();
        if sources.st_ids.num_allocated() >= self.f_capacity {
            return Err(StratusError::CAPACITY_EXCEEDED);
        }
        let id = sources.st_ids.generate();
        sources.st_sources.insert(id, source);
        Ok(AssetId::new(id))
    }

    pub fn remove(&self, id: AssetId<Font>) -> Result<()> {
        let mut sources = self.f_sources.lock().unwrap();
        if sources.st_sources.remove(id.raw()).is_none() {
            return Err(StratusError::ASSET_NOT_FOUND);
        }
        if self.f_cache.is_loaded(id.raw()) {
            self.f_zombies.lock().unwrap().insert(id.raw());
        } else {
            sources.st_ids.free(id.raw());
        }
        Ok(())
    }

    pub fn get(&self, id: AssetId<Font>) -> Result<FontHandle> {
        let data = self
            .f_cache
            .get_with(id.raw(), |raw| self.load_device_data(raw))?;
        Ok(FontHandle { fh_data: data })
    }

    fn load_device_data(&self, id: u32) -> Result<FontDeviceData> {
        let sources = self.f_sources.lock().unwrap();
        let source = sources
            .st_sources
            .get(id)
            .ok_or(StratusError::ASSET_NOT_FOUND)?;
        let data = source.load()?;

        let expected = data.atlas_width as usize * data.atlas_height as usize;
        if data.atlas_width == 0 || data.atlas_pixels.len() != expected {
            return Err(StratusError::VALIDATION_FAILED);
        }

        let image = self.f_device.create_image(
            vk::Extent2D {
                width: data.atlas_width,
                height: data.atlas_height,
            },
            vk::Format::R8_UNORM,
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

        let mut writer = self.f_writer.lock().unwrap();
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
                width: data.atlas_width,
                height: data.atlas_height,
                depth: 1,
            },
            &data.atlas_pixels,
        )?;
        writer.barrier_post_write_image(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
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

        self.f_updates.lock().unwrap().push(DescriptorUpdate::sampler(
            AssetBinding::GlyphMaps as u32,
            id,
            image.i_sampler,
            image.i_view,
        ));

        Ok(FontDeviceData {
            f_device_index: id,
            f_image: image,
            f_glyphs: data.glyphs,
        })
    }

    pub fn update(&self, cmd: vk::CommandBuffer, frame: &Arc<FrameRenderState>) -> Result<()> {
        self.f_writer.lock().unwrap().update(cmd, frame);

        for data in self.f_cache.drain_pending_unloads() {
            let raw = data.f_device_index;
            if self.f_zombies.lock().unwrap().remove(&raw) {
                self.f_sources.lock().unwrap().st_ids.free(raw);
            }
            let dev = self.f_device.clone();
            frame.on_render_finished(move || data.destroy(&dev));
        }
        Ok(())
    }

    pub fn descriptor_layout_bindings(&self) -> Vec<DescriptorBindingInfo> {
        vec![DescriptorBindingInfo {
            binding: AssetBinding::GlyphMaps as u32,
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count: self.f_capacity,
            stages: vk::ShaderStageFlags::FRAGMENT,
            flags: vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        }]
    }

    pub fn descriptor_updates(&self) -> Vec<DescriptorUpdate> {
        std::mem::replace(&mut *self.f_updates.lock().unwrap(), Vec::new())
    }

    pub fn destroy(&self) {
        for data in self.f_cache.drain_pending_unloads() {
            data.destroy(&self.f_device);
        }
    }
}
