// The renderer
//
// Drives one frame from fence wait to presentation. The per-frame
// procedure: wait and reset the frame's fence, acquire a swapchain
// image if presenting, flush the registries' pending device work into
// a dedicated update buffer, record the render graph, submit with the
// image-acquire wait and a render-finished binary plus timeline
// signal, present, and finally hand the frame state to a worker that
// waits on the timeline value and fires the render-finished callbacks.

use std::sync::Arc;

use ash::vk;

use crate::device::Device;
use crate::frame::{FrameClock, FrameSpecific};
use crate::frame_state::FrameRenderState;
use crate::graph::RenderGraph;
use crate::material_runtime::PipelineRegistry;
use crate::pass::RenderPassStore;
use crate::recorder::CommandRecorder;
use crate::scene::SceneBase;
use crate::swapchain::Swapchain;
use crate::util::ThreadPool;
use crate::{Result, StratusError};

/// Something with per-frame device work: asset managers, shadow pools,
/// anything that stages uploads or rewrites descriptors. Called on the
/// render thread between the fence wait and command recording.
pub trait FrameUpdater {
    fn frame_update(
        &mut self,
        dev: &Device,
        cmd: vk::CommandBuffer,
        frame: &Arc<FrameRenderState>,
    ) -> Result<()>;
}

/// Everything the renderer needs from the application to produce one
/// frame.
pub struct FrameContext<'a> {
    pub graph: &'a mut RenderGraph,
    pub passes: &'a RenderPassStore,
    pub scene: &'a SceneBase,
    pub pipelines: &'a PipelineRegistry,
    pub updaters: Vec<&'a mut dyn FrameUpdater>,
}

pub struct RendererCreateInfo {
    /// Worker threads used for command recording
    pub record_threads: usize,
    /// Per-frame fence wait timeout in nanoseconds
    pub fence_timeout_ns: u64,
}

impl Default for RendererCreateInfo {
    fn default() -> Self {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get().saturating_sub(1).max(1))
            .unwrap_or(1);
        Self {
            record_threads: threads,
            fence_timeout_ns: u64::MAX,
        }
    }
}

pub struct Renderer {
    r_device: Arc<Device>,
    r_clock: FrameClock,

    r_fences: FrameSpecific<vk::Fence>,
    r_acquire_semas: FrameSpecific<vk::Semaphore>,
    r_render_semas: FrameSpecific<vk::Semaphore>,
    /// Signaled by each submission with a strictly increasing value;
    /// the async finish handlers wait on it
    r_timeline: vk::Semaphore,
    r_next_timeline_value: u64,

    r_update_pools: FrameSpecific<vk::CommandPool>,
    r_update_cbufs: FrameSpecific<vk::CommandBuffer>,

    r_recorder: CommandRecorder,
    /// Runs the render-finished handlers; joined on drop
    r_workers: Option<ThreadPool>,
    r_fence_timeout: u64,
}

impl Renderer {
    /// `frames_in_flight` must equal the swapchain image count when
    /// the renderer presents.
    pub fn new(
        device: Arc<Device>,
        frames_in_flight: u32,
        info: &RendererCreateInfo,
    ) -> Result<Self> {
        let clock = FrameClock::new(frames_in_flight);

        let mut fences = Vec::new();
        let mut acquire = Vec::new();
        let mut render = Vec::new();
        let mut pools = Vec::new();
        let mut cbufs = Vec::new();
        for _ in 0..frames_in_flight {
            // Created signaled so the first wait passes immediately
            fences.push(device.create_fence(true)?);
            acquire.push(device.create_semaphore()?);
            render.push(device.create_semaphore()?);
            let pool = device.create_command_pool(device.graphics_family())?;
            cbufs.push(device.create_command_buffers(pool, 1)?[0]);
            pools.push(pool);
        }

        let timeline = device.create_timeline_semaphore(0)?;
        let recorder = CommandRecorder::new(device.clone(), &clock, info.record_threads)?;

        Ok(Self {
            r_fences: FrameSpecific::from_vec(&clock, fences),
            r_acquire_semas: FrameSpecific::from_vec(&clock, acquire),
            r_render_semas: FrameSpecific::from_vec(&clock, render),
            r_update_pools: FrameSpecific::from_vec(&clock, pools),
            r_update_cbufs: FrameSpecific::from_vec(&clock, cbufs),
            r_device: device,
            r_clock: clock,
            r_timeline: timeline,
            r_next_timeline_value: 1,
            r_recorder: recorder,
            r_workers: Some(ThreadPool::new(1)),
            r_fence_timeout: info.fence_timeout_ns,
        })
    }

    pub fn frame_clock(&self) -> &FrameClock {
        &self.r_clock
    }

    /// Render one frame without touching a swapchain. Optional
    /// semaphores splice the submission into an external chain.
    pub fn render_frame(
        &mut self,
        ctx: &mut FrameContext,
        wait: Option<vk::Semaphore>,
        signal: Option<vk::Semaphore>,
    ) -> Result<()> {
        self.render_internal(ctx, None, wait, signal)
    }

    /// Render one frame and present it.
    pub fn render_frame_and_present(
        &mut self,
        ctx: &mut FrameContext,
        swapchain: &Swapchain,
    ) -> Result<()> {
        self.render_internal(ctx, Some(swapchain), None, None)
    }

    fn render_internal(
        &mut self,
        ctx: &mut FrameContext,
        swapchain: Option<&Swapchain>,
        extra_wait: Option<vk::Semaphore>,
        extra_signal: Option<vk::Semaphore>,
    ) -> Result<()> {
        let dev = self.r_device.clone();

        // 1. Wait for this frame's previous use to retire
        let fence = *self.r_fences.get(&self.r_clock);
        match unsafe {
            dev.vk_device()
                .wait_for_fences(&[fence], true, self.r_fence_timeout)
        } {
            Ok(()) => {}
            Err(vk::Result::TIMEOUT) => {
                // Skip this frame entirely; the next call retries
                log::warn!(
                    "frame {} fence wait timed out, skipping frame",
                    self.r_clock.current()
                );
                return Err(StratusError::TIMEOUT);
            }
            Err(vk::Result::ERROR_DEVICE_LOST) => {
                log::error!("device lost while waiting for frame fence");
                self.wait_all_frames();
                return Err(StratusError::DEVICE_LOST);
            }
            Err(e) => return Err(StratusError::from_vk(e)),
        }
        unsafe {
            dev.vk_device()
                .reset_fences(&[fence])
                .map_err(StratusError::from_vk)?;
        }

        // 2. Acquire the image this frame renders into
        let acquire_sema = *self.r_acquire_semas.get(&self.r_clock);
        let image_index = match swapchain {
            Some(sc) => Some(sc.acquire_image(acquire_sema)?),
            None => None,
        };

        let frame = FrameRenderState::new(self.r_clock.current(), image_index);

        // 3. Flush registries into the frame's update buffer
        let update_pool = *self.r_update_pools.get(&self.r_clock);
        let update_cbuf = *self.r_update_cbufs.get(&self.r_clock);
        unsafe {
            dev.vk_device()
                .reset_command_pool(update_pool, vk::CommandPoolResetFlags::empty())
                .map_err(StratusError::from_vk)?;
            dev.vk_device()
                .begin_command_buffer(
                    update_cbuf,
                    &vk::CommandBufferBeginInfo::builder()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .map_err(StratusError::from_vk)?;
        }
        for updater in ctx.updaters.iter_mut() {
            updater.frame_update(&dev, update_cbuf, &frame)?;
        }
        unsafe {
            dev.vk_device()
                .end_command_buffer(update_cbuf)
                .map_err(StratusError::from_vk)?;
        }

        // 4. Record the render graph
        let mut cbufs = vec![update_cbuf];
        cbufs.extend(self.r_recorder.record(
            &self.r_clock,
            ctx.graph,
            ctx.passes,
            ctx.scene,
            ctx.pipelines,
            &frame,
        )?);

        // 5. Submit
        let render_sema = *self.r_render_semas.get(&self.r_clock);
        let timeline_value = self.r_next_timeline_value;

        let mut wait_semas = Vec::new();
        if image_index.is_some() {
            wait_semas.push(acquire_sema);
        }
        if let Some(sema) = extra_wait {
            wait_semas.push(sema);
        }
        let wait_stages = vec![
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::COMPUTE_SHADER;
            wait_semas.len()
        ];

        // The timeline signal rides along every submission; binary
        // semaphores take a zero in the value array
        let mut signal_semas = vec![self.r_timeline];
        let mut signal_values = vec![timeline_value];
        if image_index.is_some() || extra_signal.is_none() {
            signal_semas.push(render_sema);
            signal_values.push(0);
        }
        if let Some(sema) = extra_signal {
            signal_semas.push(sema);
            signal_values.push(0);
        }

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .signal_semaphore_values(&signal_values);
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semas)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&cbufs)
            .signal_semaphores(&signal_semas)
            .push_next(&mut timeline_info)
            .build();

        dev.d_graphics_queue.submit(&dev, &[submit], fence)?;

        // 6. Present
        if let (Some(sc), Some(index)) = (swapchain, image_index) {
            sc.present_image(&dev.d_present_queue, index, render_sema)?;
        }

        // 7. Async host notification once the GPU is done
        let handler_dev = self.r_device.clone();
        let timeline = self.r_timeline;
        let handler_frame = frame.clone();
        self.r_workers.as_ref().unwrap().spawn(move || {
            if let Err(e) = handler_dev.wait_timeline(timeline, timeline_value, u64::MAX) {
                log::error!("render-finished wait failed: {:?}", e);
            }
            handler_frame.signal_render_finished(&handler_dev);
        });

        self.r_next_timeline_value += 1;
        self.r_clock.advance();
        Ok(())
    }

    /// Block until every in-flight frame has retired.
    pub fn wait_all_frames(&self) {
        let fences: Vec<vk::Fence> = self.r_fences.iter().copied().collect();
        unsafe {
            let _ = self
                .r_device
                .vk_device()
                .wait_for_fences(&fences, true, u64::MAX);
        }
        self.r_device.wait_idle();
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        // All frames must retire and all render-finished handlers must
        // run before any handle they hold is dropped
        self.wait_all_frames();
        drop(self.r_workers.take());

        let vkdev = self.r_device.vk_device();
        unsafe {
            for &fence in self.r_fences.iter() {
                vkdev.destroy_fence(fence, None);
            }
            for &sema in self.r_acquire_semas.iter().chain(self.r_render_semas.iter()) {
                vkdev.destroy_semaphore(sema, None);
            }
            vkdev.destroy_semaphore(self.r_timeline, None);
            for &pool in self.r_update_pools.iter() {
                vkdev.destroy_command_pool(pool, None);
            }
        }
        self.r_recorder.destroy();
    }
}
