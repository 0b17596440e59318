// Render passes
//
// A pass is one unit of GPU work inside a render stage. Rather than a
// class hierarchy the pass kinds form one sum type with begin/end
// dispatch: raster passes open a vulkan render pass, compute and ray
// passes run their recorded executions, update passes flush host-side
// work into the command stream, and the AS-build pass rebuilds the
// TLAS. The store hands out ids so the graph never owns pass objects.

use std::sync::{Arc, Mutex};

use ash::vk;

use crate::device::Device;
use crate::frame_state::FrameRenderState;
use crate::graph::PassId;
use crate::ray::TlasBuildPass;
use crate::util::{IdPool, IndexMap};
use crate::Result;

/// A function recording work into the frame's command buffer.
pub type PassFn =
    Box<dyn FnMut(&Device, vk::CommandBuffer, &Arc<FrameRenderState>) -> Result<()> + Send>;

pub struct RasterPassCreateInfo {
    pub render_pass: vk::RenderPass,
    /// One framebuffer per in-flight frame
    pub framebuffers: Vec<vk::Framebuffer>,
    pub extent: vk::Extent2D,
    pub clear_values: Vec<vk::ClearValue>,
    pub subpass_count: u32,
}

pub struct RasterPass {
    rp_pass: vk::RenderPass,
    rp_framebuffers: Vec<vk::Framebuffer>,
    rp_extent: vk::Extent2D,
    rp_clear_values: Vec<vk::ClearValue>,
    rp_subpass_count: u32,
}

// The clear-value unions hold plain data only
unsafe impl Send for RasterPass {}

pub struct ComputePass {
    cp_executions: Vec<PassFn>,
}

pub struct UpdatePass {
    up_func: PassFn,
}

pub struct RayTracingPass {
    rt_func: PassFn,
}

pub struct AsBuildPass {
    ab_pass: TlasBuildPass,
}

pub enum RenderPass {
    Raster(RasterPass),
    Compute(ComputePass),
    Update(UpdatePass),
    RayTracing(RayTracingPass),
    AsBuild(AsBuildPass),
}

impl RenderPass {
    pub fn raster(info: RasterPassCreateInfo) -> Self {
        assert!(info.subpass_count > 0);
        RenderPass::Raster(RasterPass {
            rp_pass: info.render_pass,
            rp_framebuffers: info.framebuffers,
            rp_extent: info.extent,
            rp_clear_values: info.clear_values,
            rp_subpass_count: info.subpass_count,
        })
    }

    pub fn compute() -> Self {
        RenderPass::Compute(ComputePass {
            cp_executions: Vec::new(),
        })
    }

    pub fn update<F>(func: F) -> Self
    where
        F: FnMut(&Device, vk::CommandBuffer, &Arc<FrameRenderState>) -> Result<()>
            + Send
            + 'static,
    {
        RenderPass::Update(UpdatePass {
            up_func: Box::new(func),
        })
    }

    pub fn ray_tracing<F>(func: F) -> Self
    where
        F: FnMut(&Device, vk::CommandBuffer, &Arc<FrameRenderState>) -> Result<()>
            + Send
            + 'static,
    {
        RenderPass::RayTracing(RayTracingPass {
            rt_func: Box::new(func),
        })
    }

    pub fn as_build(pass: TlasBuildPass) -> Self {
        RenderPass::AsBuild(AsBuildPass { ab_pass: pass })
    }

    /// Add a dispatch that runs whenever this compute pass executes.
    pub fn add_compute_execution(&mut self, func: PassFn) {
        match self {
            RenderPass::Compute(pass) => pass.cp_executions.push(func),
            _ => panic!("added a compute execution to a non-compute pass"),
        }
    }

    pub fn subpass_count(&self) -> u32 {
        match self {
            RenderPass::Raster(pass) => pass.rp_subpass_count,
            _ => 1,
        }
    }

    /// Begin the pass. For raster passes this opens the vulkan render
    /// pass; the other kinds record their work here directly.
    pub fn begin(
        &mut self,
        dev: &Device,
        cmd: vk::CommandBuffer,
        frame: &Arc<FrameRenderState>,
    ) -> Result<()> {
        match self {
            RenderPass::Raster(pass) => {
                let framebuffer = pass.rp_framebuffers
                    [frame.target_image_index() as usize % pass.rp_framebuffers.len()];
                let info = vk::RenderPassBeginInfo::builder()
                    .render_pass(pass.rp_pass)
                    .framebuffer(framebuffer)
                    .render_area(vk::Rect2D {
                        offset: vk::Offset2D { x: 0, y: 0 },
                        extent: pass.rp_extent,
                    })
                    .clear_values(&pass.rp_clear_values);
                unsafe {
                    dev.vk_device().cmd_begin_render_pass(
                        cmd,
                        &info,
                        vk::SubpassContents::INLINE,
                    );
                }
                Ok(())
            }
            RenderPass::Compute(pass) => {
                for execution in pass.cp_executions.iter_mut() {
                    execution(dev, cmd, frame)?;
                }
                Ok(())
            }
            RenderPass::Update(pass) => (pass.up_func)(dev, cmd, frame),
            RenderPass::RayTracing(pass) => (pass.rt_func)(dev, cmd, frame),
            RenderPass::AsBuild(pass) => pass.ab_pass.update(cmd),
        }
    }

    pub fn end(&mut self, dev: &Device, cmd: vk::CommandBuffer) {
        if let RenderPass::Raster(_) = self {
            unsafe {
                dev.vk_device().cmd_end_render_pass(cmd);
            }
        }
    }
}

/// Id-keyed pass storage. Passes sit behind mutexes so recording
/// threads can execute disjoint stages concurrently.
pub struct RenderPassStore {
    ps_passes: IndexMap<Mutex<RenderPass>>,
    ps_ids: IdPool,
}

impl RenderPassStore {
    pub fn new() -> Self {
        Self {
            ps_passes: IndexMap::new(),
            ps_ids: IdPool::new(),
        }
    }

    pub fn add(&mut self, pass: RenderPass) -> PassId {
        let id = self.ps_ids.generate();
        self.ps_passes.insert(id, Mutex::new(pass));
        PassId(id)
    }

    pub fn get(&self, id: PassId) -> Option<&Mutex<RenderPass>> {
        self.ps_passes.get(id.0)
    }

    pub fn remove(&mut self, id: PassId) -> Option<RenderPass> {
        let pass = self.ps_passes.remove(id.0)?;
        self.ps_ids.free(id.0);
        Some(pass.into_inner().unwrap())
    }
}

/// Build a single-subpass color render pass over the swapchain's
/// format, clearing on load and finishing in present layout. The
/// simplest thing a render graph can drive: a stage with only this
/// pass clears the screen.
pub fn make_clear_pass(
    dev: &Device,
    swapchain: &crate::swapchain::Swapchain,
    clear_color: [f32; 4],
) -> Result<RenderPass> {
    let vkdev = dev.vk_device();

    let attachments = [vk::AttachmentDescription {
        format: swapchain.format(),
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    }];
    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let subpasses = [vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .build()];
    // Wait for the acquire semaphore's stage before touching the image
    let dependencies = [vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ..Default::default()
    }];

    let render_pass = unsafe {
        vkdev
            .create_render_pass(
                &vk::RenderPassCreateInfo::builder()
                    .attachments(&attachments)
                    .subpasses(&subpasses)
                    .dependencies(&dependencies),
                None,
            )
            .map_err(crate::StratusError::from_vk)?
    };

    let extent = swapchain.extent();
    let mut framebuffers = Vec::with_capacity(swapchain.views().len());
    for &view in swapchain.views() {
        let views = [view];
        framebuffers.push(unsafe {
            vkdev
                .create_framebuffer(
                    &vk::FramebufferCreateInfo::builder()
                        .render_pass(render_pass)
                        .attachments(&views)
                        .width(extent.width)
                        .height(extent.height)
                        .layers(1),
                    None,
                )
                .map_err(crate::StratusError::from_vk)?
        });
    }

    Ok(RenderPass::raster(RasterPassCreateInfo {
        render_pass,
        framebuffers,
        extent,
        clear_values: vec![vk::ClearValue {
            color: vk::ClearColorValue {
                float32: clear_color,
            },
        }],
        subpass_count: 1,
    }))
}

/// Destroy the vulkan objects a raster pass carries. The store gives
/// the pass back by value from `remove`.
pub fn destroy_raster_pass(dev: &Device, pass: RenderPass) {
    if let RenderPass::Raster(raster) = pass {
        unsafe {
            for framebuffer in raster.rp_framebuffers.iter() {
                dev.vk_device().destroy_framebuffer(*framebuffer, None);
            }
            dev.vk_device().destroy_render_pass(raster.rp_pass, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subpass_counts() {
        let update = RenderPass::update(|_, _, _| Ok(()));
        assert_eq!(update.subpass_count(), 1);

        let raster = RenderPass::raster(RasterPassCreateInfo {
            render_pass: vk::RenderPass::null(),
            framebuffers: vec![vk::Framebuffer::null()],
            extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            clear_values: Vec::new(),
            subpass_count: 3,
        });
        assert_eq!(raster.subpass_count(), 3);
    }

    #[test]
    fn store_hands_out_dense_ids() {
        let mut store = RenderPassStore::new();
        let a = store.add(RenderPass::update(|_, _, _| Ok(())));
        let b = store.add(RenderPass::compute());
        assert_eq!((a, b), (PassId(0), PassId(1)));

        assert!(store.remove(a).is_some());
        assert!(store.get(a).is_none());
        assert!(store.get(b).is_some());
        assert_eq!(store.add(RenderPass::compute()), PassId(0));
    }
}
