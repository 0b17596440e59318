// Parallel command recording
//
// The recorder owns L x T command pools: one pool per (in-flight
// frame, recording thread) pair, so resetting a pool never races with
// a frame the GPU is still consuming. Each frame the enabled stages
// are split into contiguous chunks, one chunk per thread; every thread
// records its chunk into its own primary buffer and the buffers are
// submitted in chunk order, which preserves the graph's stage order.

use std::sync::Arc;

use ash::vk;

use crate::device::Device;
use crate::frame::FrameClock;
use crate::frame_state::FrameRenderState;
use crate::graph::{PassId, RenderGraph, StageId};
use crate::material_runtime::PipelineRegistry;
use crate::pass::RenderPassStore;
use crate::scene::SceneBase;
use crate::{Result, StratusError};

struct PerFrame {
    pf_pools: Vec<vk::CommandPool>,
    pf_cbufs: Vec<vk::CommandBuffer>,
}

pub struct CommandRecorder {
    cr_device: Arc<Device>,
    cr_threads: usize,
    cr_frames: Vec<PerFrame>,
}

impl CommandRecorder {
    pub fn new(device: Arc<Device>, clock: &FrameClock, threads: usize) -> Result<Self> {
        let threads = threads.max(1);

        let mut frames = Vec::with_capacity(clock.frame_count() as usize);
        for _ in 0..clock.frame_count() {
            let mut pools = Vec::with_capacity(threads);
            let mut cbufs = Vec::with_capacity(threads);
            for _ in 0..threads {
                let pool = device.create_command_pool(device.graphics_family())?;
                cbufs.push(device.create_command_buffers(pool, 1)?[0]);
                pools.push(pool);
            }
            frames.push(PerFrame {
                pf_pools: pools,
                pf_cbufs: cbufs,
            });
        }

        Ok(Self {
            cr_device: device,
            cr_threads: threads,
            cr_frames: frames,
        })
    }

    pub fn num_threads(&self) -> usize {
        self.cr_threads
    }

    /// Record all stages of the graph for the current frame.
    ///
    /// Returns one primary buffer per thread, ordered so that
    /// concatenating them yields the stages in graph order. A frame
    /// with nothing to draw still produces one (empty) buffer per
    /// thread.
    pub fn record(
        &mut self,
        clock: &FrameClock,
        graph: &mut RenderGraph,
        passes: &RenderPassStore,
        scene: &SceneBase,
        pipelines: &PipelineRegistry,
        frame: &Arc<FrameRenderState>,
    ) -> Result<Vec<vk::CommandBuffer>> {
        // Snapshot the stage -> passes layout so the worker threads
        // need no access to the graph itself
        let order = graph.stage_order()?;
        let stages: Vec<(StageId, Vec<PassId>)> = order
            .iter()
            .map(|&stage| (stage, graph.passes(stage).to_vec()))
            .collect();

        // Contiguous chunks keep the global stage order intact when
        // the per-thread buffers are submitted back to back
        let chunk_size = (stages.len() + self.cr_threads - 1) / self.cr_threads.max(1);
        let chunks: Vec<&[(StageId, Vec<PassId>)]> = if chunk_size == 0 {
            vec![&[]; self.cr_threads]
        } else {
            let mut chunks: Vec<&[(StageId, Vec<PassId>)]> =
                stages.chunks(chunk_size).collect();
            chunks.resize(self.cr_threads, &[]);
            chunks
        };

        let per_frame = &self.cr_frames[clock.current() as usize];
        let device: &Device = &self.cr_device;

        let results: Vec<Result<()>> = crossbeam::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.cr_threads);
            for (thread, chunk) in chunks.into_iter().enumerate() {
                let pool = per_frame.pf_pools[thread];
                let cbuf = per_frame.pf_cbufs[thread];
                let scene = scene.clone();
                let frame = frame.clone();

                handles.push(scope.spawn(move |_| {
                    Self::record_chunk(device, pool, cbuf, chunk, passes, &scene, pipelines, &frame)
                }));
            }

            handles
                .into_iter()
                .map(|h| h.join().unwrap_or(Err(StratusError::RECORD_FAILED)))
                .collect()
        })
        .map_err(|_| StratusError::RECORD_FAILED)?;

        for result in results {
            result?;
        }

        Ok(per_frame.pf_cbufs.clone())
    }

    fn record_chunk(
        device: &Device,
        pool: vk::CommandPool,
        cbuf: vk::CommandBuffer,
        chunk: &[(StageId, Vec<PassId>)],
        passes: &RenderPassStore,
        scene: &SceneBase,
        pipelines: &PipelineRegistry,
        frame: &Arc<FrameRenderState>,
    ) -> Result<()> {
        let vkdev = device.vk_device();
        unsafe {
            vkdev
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
                .map_err(StratusError::from_vk)?;
            vkdev
                .begin_command_buffer(
                    cbuf,
                    &vk::CommandBufferBeginInfo::builder()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .map_err(StratusError::from_vk)?;
        }

        for (stage, pass_ids) in chunk.iter() {
            for &pass_id in pass_ids.iter() {
                let pass = passes.get(pass_id).ok_or(StratusError::ASSET_NOT_FOUND)?;
                let mut pass = pass.lock().unwrap();

                pass.begin(device, cbuf, frame)?;
                let subpass_count = pass.subpass_count();
                for subpass in 0..subpass_count {
                    // Grouping by pipeline binds each one exactly once
                    for pipeline in scene.pipelines(*stage, subpass) {
                        pipelines.bind(device, cbuf, pipeline)?;
                        scene.invoke_draw_functions(*stage, pass_id, subpass, pipeline, cbuf);
                    }
                    if subpass + 1 < subpass_count {
                        unsafe {
                            vkdev.cmd_next_subpass(cbuf, vk::SubpassContents::INLINE);
                        }
                    }
                }
                pass.end(device, cbuf);
            }
        }

        unsafe {
            vkdev
                .end_command_buffer(cbuf)
                .map_err(StratusError::from_vk)?;
        }
        Ok(())
    }

    pub fn destroy(&self) {
        for per_frame in self.cr_frames.iter() {
            for &pool in per_frame.pf_pools.iter() {
                unsafe {
                    self.cr_device.vk_device().destroy_command_pool(pool, None);
                }
            }
        }
    }
}
