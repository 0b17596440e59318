// Material runtime state
//
// A material specialization compiles down to three things at runtime: a
// pipeline, the layout it was created against, and a table translating
// authoring-time push-constant ids into concrete (stage, offset, size)
// triples. The pipeline registry owns the pipeline objects; materials
// and draw functions refer to them by id so recording never touches a
// vulkan handle it does not own.

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::assets::geometry::{MeshVertex, SkeletalVertex};
use crate::device::Device;
use crate::util::{IdPool, IndexMap};
use crate::{Result, StratusError};

/// Identifies a pipeline inside a `PipelineRegistry`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct PipelineId(pub u32);

/// Push-constant user ids of the deferred drawable vertex stage. These
/// are fixed at shader-authoring time; the material compiler reflects
/// their actual offsets into the `ShaderProgram` artifact.
pub const PC_MODEL_MATRIX: u32 = 0;
pub const PC_MATERIAL_INDEX: u32 = 1;
pub const PC_ANIMATION_INDEX: u32 = 2;
pub const PC_KEYFRAMES: u32 = 3;
pub const PC_KEYFRAME_WEIGHT: u32 = 4;

/// One compiled shader stage inside a program artifact.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug)]
pub struct ShaderStageBlob {
    /// Raw `vk::ShaderStageFlags` bits; kept raw so the artifact
    /// serializes without vulkan types
    pub stage: u32,
    pub spirv: Vec<u32>,
    pub entry: String,
}

/// A push constant as reflected by the shader linker.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug)]
pub struct PushConstantSlot {
    pub user_id: u32,
    /// Raw `vk::ShaderStageFlags` bits
    pub stage: u32,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug)]
pub struct SpecConstant {
    pub constant_id: u32,
    pub value: u32,
}

/// The artifact produced by the material graph compiler. We consume it,
/// we do not produce it.
#[derive(Clone, Serialize, Deserialize, PartialEq, Debug, Default)]
pub struct ShaderProgram {
    pub stages: Vec<ShaderStageBlob>,
    pub push_constants: Vec<PushConstantSlot>,
    pub spec_constants: Vec<SpecConstant>,
}

impl ShaderProgram {
    /// Merge the reflected push constants into one range per shader
    /// stage, as required for pipeline-layout creation.
    pub fn push_constant_ranges(&self) -> Vec<vk::PushConstantRange> {
        let mut ranges: Vec<vk::PushConstantRange> = Vec::new();

        for slot in self.push_constants.iter() {
            let stage = vk::ShaderStageFlags::from_raw(slot.stage);
            let end = slot.offset + slot.size;
            match ranges.iter_mut().find(|r| r.stage_flags == stage) {
                Some(range) => {
                    let range_end = (range.offset + range.size).max(end);
                    range.offset = range.offset.min(slot.offset);
                    range.size = range_end - range.offset;
                }
                None => ranges.push(vk::PushConstantRange {
                    stage_flags: stage,
                    offset: slot.offset,
                    size: slot.size,
                }),
            }
        }

        ranges
    }

    /// The reflected push-constant layout of the deferred drawable
    /// vertex stage.
    pub fn deferred_vertex_push_constants() -> Vec<PushConstantSlot> {
        let vert = vk::ShaderStageFlags::VERTEX.as_raw();
        vec![
            PushConstantSlot { user_id: PC_MODEL_MATRIX, stage: vert, offset: 0, size: 64 },
            PushConstantSlot { user_id: PC_MATERIAL_INDEX, stage: vert, offset: 64, size: 4 },
            PushConstantSlot { user_id: PC_ANIMATION_INDEX, stage: vert, offset: 68, size: 4 },
            PushConstantSlot { user_id: PC_KEYFRAMES, stage: vert, offset: 72, size: 8 },
            PushConstantSlot { user_id: PC_KEYFRAME_WEIGHT, stage: vert, offset: 80, size: 4 },
        ]
    }
}

/// Maps authoring-time user ids to pipeline push-constant locations.
///
/// A missing user id makes `push` a no-op rather than an error: a
/// specialization that optimized a constant away stays compatible with
/// draw code that still pushes it.
pub struct PushConstantMap {
    pm_slots: Vec<Option<(vk::ShaderStageFlags, u32, u32)>>,
}

impl PushConstantMap {
    pub fn from_program(program: &ShaderProgram) -> Self {
        let mut slots = Vec::new();
        for slot in program.push_constants.iter() {
            let idx = slot.user_id as usize;
            if idx >= slots.len() {
                slots.resize(idx + 1, None);
            }
            slots[idx] = Some((
                vk::ShaderStageFlags::from_raw(slot.stage),
                slot.offset,
                slot.size,
            ));
        }
        Self { pm_slots: slots }
    }

    pub fn lookup(&self, user_id: u32) -> Option<(vk::ShaderStageFlags, u32, u32)> {
        self.pm_slots.get(user_id as usize).copied().flatten()
    }

    /// Push `value` at the location reflected for `user_id`. No-op if
    /// the specialization does not use that constant.
    pub fn push<T: Copy>(
        &self,
        dev: &Device,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        user_id: u32,
        value: &T,
    ) {
        let (stage, offset, size) = match self.lookup(user_id) {
            Some(slot) => slot,
            None => return,
        };
        debug_assert_eq!(size as usize, std::mem::size_of::<T>());

        let bytes = unsafe {
            std::slice::from_raw_parts(
                value as *const T as *const u8,
                (size as usize).min(std::mem::size_of::<T>()),
            )
        };
        unsafe {
            dev.vk_device().cmd_push_constants(cmd, layout, stage, offset, bytes);
        }
    }
}

/// The runtime face of one material specialization.
#[derive(Clone)]
pub struct MaterialRuntime {
    pub mr_pipeline: PipelineId,
    pub mr_push_constants: Arc<PushConstantMap>,
}

/// A pipeline plus the layout it was built against.
pub struct PipelineEntry {
    pub pe_pipeline: vk::Pipeline,
    pub pe_layout: vk::PipelineLayout,
    pub pe_bind_point: vk::PipelineBindPoint,
}

/// Id-keyed storage for every pipeline the engine creates.
pub struct PipelineRegistry {
    pr_entries: IndexMap<PipelineEntry>,
    pr_ids: IdPool,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self {
            pr_entries: IndexMap::new(),
            pr_ids: IdPool::new(),
        }
    }

    pub fn register(&mut self, entry: PipelineEntry) -> PipelineId {
        let id = self.pr_ids.generate();
        self.pr_entries.insert(id, entry);
        PipelineId(id)
    }

    pub fn get(&self, id: PipelineId) -> Option<&PipelineEntry> {
        self.pr_entries.get(id.0)
    }

    pub fn bind(&self, dev: &Device, cmd: vk::CommandBuffer, id: PipelineId) -> Result<()> {
        let entry = self.get(id).ok_or(StratusError::ASSET_NOT_FOUND)?;
        unsafe {
            dev.vk_device()
                .cmd_bind_pipeline(cmd, entry.pe_bind_point, entry.pe_pipeline);
        }
        Ok(())
    }

    pub fn remove(&mut self, id: PipelineId) -> Option<PipelineEntry> {
        let entry = self.pr_entries.remove(id.0)?;
        self.pr_ids.free(id.0);
        Some(entry)
    }

    pub fn destroy_all(&mut self, dev: &Device) {
        let ids: Vec<u32> = self.pr_entries.iter().map(|(id, _)| id).collect();
        for id in ids {
            if let Some(entry) = self.pr_entries.remove(id) {
                unsafe {
                    dev.vk_device().destroy_pipeline(entry.pe_pipeline, None);
                    dev.vk_device().destroy_pipeline_layout(entry.pe_layout, None);
                }
            }
        }
    }
}

/// Fixed-function state for one drawable pipeline specialization.
pub struct DrawablePipelineInfo<'a> {
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub extent: vk::Extent2D,
    /// Transparent materials blend and do not write depth
    pub transparent: bool,
    /// Animated specializations consume the skeletal vertex stream
    pub animated: bool,
    pub set_layouts: &'a [vk::DescriptorSetLayout],
    pub color_attachment_count: u32,
}

/// Build the graphics pipeline for one material specialization.
pub fn build_drawable_pipeline(
    dev: &Device,
    program: &ShaderProgram,
    info: &DrawablePipelineInfo,
) -> Result<PipelineEntry> {
    use memoffset::offset_of;

    let vkdev = dev.vk_device();

    // Specialization constants are shared by all stages
    let spec_data: Vec<u32> = program.spec_constants.iter().map(|s| s.value).collect();
    let spec_entries: Vec<vk::SpecializationMapEntry> = program
        .spec_constants
        .iter()
        .enumerate()
        .map(|(i, s)| vk::SpecializationMapEntry {
            constant_id: s.constant_id,
            offset: (i * std::mem::size_of::<u32>()) as u32,
            size: std::mem::size_of::<u32>(),
        })
        .collect();
    let spec_bytes = unsafe {
        std::slice::from_raw_parts(
            spec_data.as_ptr() as *const u8,
            spec_data.len() * std::mem::size_of::<u32>(),
        )
    };
    let spec_info = vk::SpecializationInfo::builder()
        .map_entries(&spec_entries)
        .data(spec_bytes)
        .build();

    let mut modules = Vec::new();
    let mut entry_names = Vec::new();
    let mut stages = Vec::new();
    for blob in program.stages.iter() {
        let module = unsafe {
            vkdev
                .create_shader_module(
                    &vk::ShaderModuleCreateInfo::builder().code(&blob.spirv),
                    None,
                )
                .map_err(StratusError::from_vk)?
        };
        modules.push(module);
        entry_names.push(CString::new(blob.entry.as_str()).unwrap());

        stages.push(
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::from_raw(blob.stage))
                .module(module)
                .name(entry_names.last().unwrap())
                .specialization_info(&spec_info)
                .build(),
        );
    }

    // Stream 0 is the mesh vertex, stream 1 the skeletal vertex that
    // only animated specializations consume
    let mut vertex_bindings = vec![vk::VertexInputBindingDescription {
        binding: 0,
        stride: std::mem::size_of::<MeshVertex>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }];
    let mut vertex_attributes = vec![
        vk::VertexInputAttributeDescription {
            binding: 0,
            location: 0,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(MeshVertex, position) as u32,
        },
        vk::VertexInputAttributeDescription {
            binding: 0,
            location: 1,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(MeshVertex, normal) as u32,
        },
        vk::VertexInputAttributeDescription {
            binding: 0,
            location: 2,
            format: vk::Format::R32G32_SFLOAT,
            offset: offset_of!(MeshVertex, uv) as u32,
        },
        vk::VertexInputAttributeDescription {
            binding: 0,
            location: 3,
            format: vk::Format::R32G32B32_SFLOAT,
            offset: offset_of!(MeshVertex, tangent) as u32,
        },
    ];
    if info.animated {
        vertex_bindings.push(vk::VertexInputBindingDescription {
            binding: 1,
            stride: std::mem::size_of::<SkeletalVertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        });
        vertex_attributes.push(vk::VertexInputAttributeDescription {
            binding: 1,
            location: 4,
            format: vk::Format::R32G32B32A32_UINT,
            offset: offset_of!(SkeletalVertex, bone_indices) as u32,
        });
        vertex_attributes.push(vk::VertexInputAttributeDescription {
            binding: 1,
            location: 5,
            format: vk::Format::R32G32B32A32_SFLOAT,
            offset: offset_of!(SkeletalVertex, bone_weights) as u32,
        });
    }

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
        .vertex_binding_descriptions(&vertex_bindings)
        .vertex_attribute_descriptions(&vertex_attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

    let viewports = [vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: info.extent.width as f32,
        height: info.extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }];
    let scissors = [vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent: info.extent,
    }];
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewports(&viewports)
        .scissors(&scissors);

    let raster_state = vk::PipelineRasterizationStateCreateInfo::builder()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .line_width(1.0);

    let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_state = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(!info.transparent)
        .depth_compare_op(vk::CompareOp::LESS);

    let blend_attachment = if info.transparent {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::TRUE,
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        }
    } else {
        vk::PipelineColorBlendAttachmentState {
            blend_enable: vk::FALSE,
            color_write_mask: vk::ColorComponentFlags::RGBA,
            ..Default::default()
        }
    };
    let blend_attachments =
        vec![blend_attachment; info.color_attachment_count as usize];
    let blend_state =
        vk::PipelineColorBlendStateCreateInfo::builder().attachments(&blend_attachments);

    let pc_ranges = program.push_constant_ranges();
    let layout = unsafe {
        vkdev
            .create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::builder()
                    .set_layouts(info.set_layouts)
                    .push_constant_ranges(&pc_ranges),
                None,
            )
            .map_err(StratusError::from_vk)?
    };

    let create_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&raster_state)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_state)
        .color_blend_state(&blend_state)
        .layout(layout)
        .render_pass(info.render_pass)
        .subpass(info.subpass)
        .build();

    let pipeline = unsafe {
        vkdev
            .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
            .map_err(|(_, e)| StratusError::from_vk(e))?[0]
    };

    for module in modules {
        unsafe { vkdev.destroy_shader_module(module, None) };
    }

    Ok(PipelineEntry {
        pe_pipeline: pipeline,
        pe_layout: layout,
        pe_bind_point: vk::PipelineBindPoint::GRAPHICS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deferred_program() -> ShaderProgram {
        ShaderProgram {
            stages: Vec::new(),
            push_constants: ShaderProgram::deferred_vertex_push_constants(),
            spec_constants: Vec::new(),
        }
    }

    #[test]
    fn map_resolves_reflected_offsets() {
        let map = PushConstantMap::from_program(&deferred_program());

        let (stage, offset, size) = map.lookup(PC_MODEL_MATRIX).unwrap();
        assert_eq!(stage, vk::ShaderStageFlags::VERTEX);
        assert_eq!((offset, size), (0, 64));

        assert_eq!(map.lookup(PC_KEYFRAMES).unwrap().1, 72);
        assert_eq!(map.lookup(PC_KEYFRAME_WEIGHT).unwrap().2, 4);
    }

    #[test]
    fn missing_user_id_resolves_to_none() {
        let mut program = deferred_program();
        // A specialization that optimized the animation constants away
        program.push_constants.retain(|s| s.user_id <= PC_MATERIAL_INDEX);

        let map = PushConstantMap::from_program(&program);
        assert!(map.lookup(PC_ANIMATION_INDEX).is_none());
        assert!(map.lookup(99).is_none());
        assert!(map.lookup(PC_MATERIAL_INDEX).is_some());
    }

    #[test]
    fn ranges_merge_per_stage() {
        let ranges = deferred_program().push_constant_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].stage_flags, vk::ShaderStageFlags::VERTEX);
        assert_eq!(ranges[0].offset, 0);
        assert_eq!(ranges[0].size, 84);
    }

    #[test]
    fn registry_ids_are_dense() {
        let mut registry = PipelineRegistry::new();
        let entry = || PipelineEntry {
            pe_pipeline: vk::Pipeline::null(),
            pe_layout: vk::PipelineLayout::null(),
            pe_bind_point: vk::PipelineBindPoint::GRAPHICS,
        };

        let a = registry.register(entry());
        let b = registry.register(entry());
        assert_eq!((a, b), (PipelineId(0), PipelineId(1)));

        registry.remove(a).unwrap();
        assert!(registry.get(a).is_none());
        assert_eq!(registry.register(entry()), PipelineId(0));
    }
}
