// Staging upload scheduler
//
// Registries never write device-local memory directly. They enqueue
// writes here; the writer owns a staging buffer per write and replays
// everything into the frame's command buffer during update. Within one
// update all pre-write barriers are emitted first, then the copies in
// enqueue order, then all post-write barriers. The staging buffers are
// registered with the frame state so they survive until the frame's
// render-finished signal.

use std::sync::Arc;

use ash::vk;

use crate::device::{Buffer, Device};
use crate::frame_state::FrameRenderState;
use crate::Result;

enum CopyOp {
    Buffer {
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
    Image {
        dst: vk::Image,
        region: vk::BufferImageCopy,
    },
}

struct PendingWrite {
    pw_staging: Buffer,
    pw_op: CopyOp,
}

enum PendingBarrier {
    Buffer {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: vk::BufferMemoryBarrier,
    },
    Image {
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: vk::ImageMemoryBarrier,
    },
}

// The only pointers in the barrier structs are their unused p_next
// chains, which stay null.
unsafe impl Send for PendingBarrier {}

pub struct ResourceDataWriter {
    w_device: Arc<Device>,
    w_pre_barriers: Vec<PendingBarrier>,
    w_writes: Vec<PendingWrite>,
    w_post_barriers: Vec<PendingBarrier>,
}

impl ResourceDataWriter {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            w_device: device,
            w_pre_barriers: Vec::new(),
            w_writes: Vec::new(),
            w_post_barriers: Vec::new(),
        }
    }

    /// Enqueue a write of `data` into a device-local buffer.
    pub fn write_buffer(
        &mut self,
        dst: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()> {
        let staging = self.make_staging(data)?;

        self.w_writes.push(PendingWrite {
            pw_staging: staging,
            pw_op: CopyOp::Buffer {
                dst,
                region: vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: offset,
                    size: data.len() as u64,
                },
            },
        });
        Ok(())
    }

    /// Enqueue a write of pixel `data` into an image. The image must be
    /// in TRANSFER_DST_OPTIMAL when the copies execute; use a pre-write
    /// barrier for the transition.
    pub fn write_image(
        &mut self,
        dst: vk::Image,
        subresource: vk::ImageSubresourceLayers,
        offset: vk::Offset3D,
        extent: vk::Extent3D,
        data: &[u8],
    ) -> Result<()> {
        let staging = self.make_staging(data)?;

        self.w_writes.push(PendingWrite {
            pw_staging: staging,
            pw_op: CopyOp::Image {
                dst,
                region: vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: subresource,
                    image_offset: offset,
                    image_extent: extent,
                },
            },
        });
        Ok(())
    }

    pub fn barrier_pre_write_buffer(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: vk::BufferMemoryBarrier,
    ) {
        self.w_pre_barriers.push(PendingBarrier::Buffer {
            src_stage,
            dst_stage,
            barrier,
        });
    }

    pub fn barrier_pre_write_image(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: vk::ImageMemoryBarrier,
    ) {
        self.w_pre_barriers.push(PendingBarrier::Image {
            src_stage,
            dst_stage,
            barrier,
        });
    }

    pub fn barrier_post_write_buffer(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: vk::BufferMemoryBarrier,
    ) {
        self.w_post_barriers.push(PendingBarrier::Buffer {
            src_stage,
            dst_stage,
            barrier,
        });
    }

    pub fn barrier_post_write_image(
        &mut self,
        src_stage: vk::PipelineStageFlags,
        dst_stage: vk::PipelineStageFlags,
        barrier: vk::ImageMemoryBarrier,
    ) {
        self.w_post_barriers.push(PendingBarrier::Image {
            src_stage,
            dst_stage,
            barrier,
        });
    }

    pub fn has_pending_work(&self) -> bool {
        !self.w_writes.is_empty()
            || !self.w_pre_barriers.is_empty()
            || !self.w_post_barriers.is_empty()
    }

    /// Replay everything enqueued since the last update into `cmd`.
    pub fn update(&mut self, cmd: vk::CommandBuffer, frame: &Arc<FrameRenderState>) {
        let dev = self.w_device.vk_device();

        for barrier in self.w_pre_barriers.drain(..) {
            Self::emit_barrier(dev, cmd, &barrier);
        }

        for write in self.w_writes.drain(..) {
            unsafe {
                match write.pw_op {
                    CopyOp::Buffer { dst, region } => {
                        dev.cmd_copy_buffer(cmd, write.pw_staging.b_buffer, dst, &[region]);
                    }
                    CopyOp::Image { dst, region } => {
                        dev.cmd_copy_buffer_to_image(
                            cmd,
                            write.pw_staging.b_buffer,
                            dst,
                            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                            &[region],
                        );
                    }
                }
            }
            // The staging buffer lives until this frame retires
            frame.register_transient_buffer(write.pw_staging);
        }

        for barrier in self.w_post_barriers.drain(..) {
            Self::emit_barrier(dev, cmd, &barrier);
        }
    }

    fn emit_barrier(dev: &ash::Device, cmd: vk::CommandBuffer, barrier: &PendingBarrier) {
        unsafe {
            match barrier {
                PendingBarrier::Buffer {
                    src_stage,
                    dst_stage,
                    barrier,
                } => dev.cmd_pipeline_barrier(
                    cmd,
                    *src_stage,
                    *dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[*barrier],
                    &[],
                ),
                PendingBarrier::Image {
                    src_stage,
                    dst_stage,
                    barrier,
                } => dev.cmd_pipeline_barrier(
                    cmd,
                    *src_stage,
                    *dst_stage,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[*barrier],
                ),
            }
        }
    }

    fn make_staging(&self, data: &[u8]) -> Result<Buffer> {
        let staging = self.w_device.create_buffer(
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            data.len() as u64,
        )?;
        self.w_device.update_memory(staging.b_memory, 0, data)?;
        Ok(staging)
    }
}
