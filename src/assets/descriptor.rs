// The shared asset descriptor set
//
// One UPDATE_AFTER_BIND descriptor set aggregates every asset array:
// geometry index and vertex buffers, the texture sampler array, glyph
// map samplers and the two animation buffers. Registries queue
// `DescriptorUpdate`s as assets load and unload; the manager merges
// them into one write batch per frame.

use ash::vk;

use crate::device::Device;
use crate::{Result, StratusError};

/// Binding indices of the shared set. The numbering is part of the
/// shader interface and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetBinding {
    GeometryIndexBuffers = 0,
    GeometryVertexBuffers = 1,
    Textures = 2,
    GlyphMaps = 3,
    AnimationMetadata = 4,
    AnimationData = 5,
}

/// Schema for one binding of the shared set.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorBindingInfo {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
    pub flags: vk::DescriptorBindingFlags,
}

pub enum DescriptorUpdateKind {
    Buffer(vk::DescriptorBufferInfo),
    Sampler(vk::DescriptorImageInfo),
}

/// One deferred descriptor write: a (binding, array element) slot and
/// the resource to place there.
pub struct DescriptorUpdate {
    pub du_binding: u32,
    pub du_element: u32,
    pub du_kind: DescriptorUpdateKind,
}

// Only vulkan handles and enums inside
unsafe impl Send for DescriptorUpdate {}

impl DescriptorUpdate {
    pub fn buffer(binding: u32, element: u32, buffer: vk::Buffer) -> Self {
        Self {
            du_binding: binding,
            du_element: element,
            du_kind: DescriptorUpdateKind::Buffer(
                vk::DescriptorBufferInfo::builder()
                    .buffer(buffer)
                    .offset(0)
                    .range(vk::WHOLE_SIZE)
                    .build(),
            ),
        }
    }

    pub fn sampler(
        binding: u32,
        element: u32,
        sampler: vk::Sampler,
        view: vk::ImageView,
    ) -> Self {
        Self {
            du_binding: binding,
            du_element: element,
            du_kind: DescriptorUpdateKind::Sampler(
                vk::DescriptorImageInfo::builder()
                    .sampler(sampler)
                    .image_view(view)
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .build(),
            ),
        }
    }
}

/// A descriptor set built from merged binding schemas, updatable while
/// bound.
pub struct SharedDescriptorSet {
    sd_pool: vk::DescriptorPool,
    sd_layout: vk::DescriptorSetLayout,
    sd_set: vk::DescriptorSet,
}

impl SharedDescriptorSet {
    pub fn new(dev: &Device, bindings: &[DescriptorBindingInfo]) -> Result<Self> {
        let vkdev = dev.vk_device();

        let pool_sizes: Vec<vk::DescriptorPoolSize> = bindings
            .iter()
            .map(|b| vk::DescriptorPoolSize {
                ty: b.ty,
                descriptor_count: b.count,
            })
            .collect();
        let pool = unsafe {
            vkdev
                .create_descriptor_pool(
                    &vk::DescriptorPoolCreateInfo::builder()
                        .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
                        .pool_sizes(&pool_sizes)
                        .max_sets(1),
                    None,
                )
                .map_err(StratusError::from_vk)?
        };

        let layout_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| vk::DescriptorSetLayoutBinding {
                binding: b.binding,
                descriptor_type: b.ty,
                descriptor_count: b.count,
                stage_flags: b.stages,
                ..Default::default()
            })
            .collect();
        // Every binding gets UPDATE_AFTER_BIND on top of whatever the
        // registry asked for (usually PARTIALLY_BOUND for the arrays)
        let binding_flags: Vec<vk::DescriptorBindingFlags> = bindings
            .iter()
            .map(|b| b.flags | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND)
            .collect();
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(&binding_flags);

        let layout = unsafe {
            vkdev
                .create_descriptor_set_layout(
                    &vk::DescriptorSetLayoutCreateInfo::builder()
                        .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
                        .bindings(&layout_bindings)
                        .push_next(&mut flags_info),
                    None,
                )
                .map_err(StratusError::from_vk)?
        };

        let set = unsafe {
            vkdev
                .allocate_descriptor_sets(
                    &vk::DescriptorSetAllocateInfo::builder()
                        .descriptor_pool(pool)
                        .set_layouts(&[layout]),
                )
                .map_err(StratusError::from_vk)?[0]
        };

        Ok(Self {
            sd_pool: pool,
            sd_layout: layout,
            sd_set: set,
        })
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.sd_layout
    }

    pub fn set(&self) -> vk::DescriptorSet {
        self.sd_set
    }

    /// Apply a batch of deferred updates in one vkUpdateDescriptorSets
    /// call.
    pub fn apply_updates(&self, dev: &Device, updates: &[DescriptorUpdate]) {
        if updates.is_empty() {
            return;
        }

        // The info structs must stay alive until the update call, and
        // the write structs point into these arrays
        let buffer_infos: Vec<Option<vk::DescriptorBufferInfo>> = updates
            .iter()
            .map(|u| match &u.du_kind {
                DescriptorUpdateKind::Buffer(info) => Some(*info),
                _ => None,
            })
            .collect();
        let image_infos: Vec<Option<vk::DescriptorImageInfo>> = updates
            .iter()
            .map(|u| match &u.du_kind {
                DescriptorUpdateKind::Sampler(info) => Some(*info),
                _ => None,
            })
            .collect();

        let writes: Vec<vk::WriteDescriptorSet> = updates
            .iter()
            .enumerate()
            .map(|(i, u)| {
                let mut write = vk::WriteDescriptorSet::builder()
                    .dst_set(self.sd_set)
                    .dst_binding(u.du_binding)
                    .dst_array_element(u.du_element);
                match &u.du_kind {
                    DescriptorUpdateKind::Buffer(_) => {
                        write = write
                            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                            .buffer_info(std::slice::from_ref(
                                buffer_infos[i].as_ref().unwrap(),
                            ));
                    }
                    DescriptorUpdateKind::Sampler(_) => {
                        write = write
                            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                            .image_info(std::slice::from_ref(
                                image_infos[i].as_ref().unwrap(),
                            ));
                    }
                }
                write.build()
            })
            .collect();

        unsafe {
            dev.vk_device().update_descriptor_sets(&writes, &[]);
        }
    }

    pub fn bind(
        &self,
        dev: &Device,
        cmd: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline_layout: vk::PipelineLayout,
        set_index: u32,
    ) {
        unsafe {
            dev.vk_device().cmd_bind_descriptor_sets(
                cmd,
                bind_point,
                pipeline_layout,
                set_index,
                &[self.sd_set],
                &[],
            );
        }
    }

    pub fn destroy(&self, dev: &Device) {
        unsafe {
            dev.vk_device()
                .destroy_descriptor_set_layout(self.sd_layout, None);
            dev.vk_device().destroy_descriptor_pool(self.sd_pool, None);
        }
    }
}
