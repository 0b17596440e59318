// Batched bottom-level acceleration structure builder
//
// BLAS builds are requested from wherever a ray component first needs
// one, but they all execute together: at frame update time one scratch
// buffer is allocated, sized as the aligned sum of every pending build's
// scratch requirement, and a single vkCmdBuildAccelerationStructuresKHR
// records all of them.

use std::sync::{Arc, Mutex};

use ash::vk;

use crate::device::Device;
use crate::frame_state::FrameRenderState;
use crate::ray::Blas;
use crate::util::align_up;
use crate::Result;

pub struct AsBuilder {
    ab_device: Arc<Device>,
    ab_pending: Mutex<Vec<Arc<Blas>>>,
}

impl AsBuilder {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            ab_device: device,
            ab_pending: Mutex::new(Vec::new()),
        }
    }

    /// Queue a build. May be called from any thread.
    pub fn enqueue(&self, blas: Arc<Blas>) {
        self.ab_pending.lock().unwrap().push(blas);
    }

    pub fn num_pending(&self) -> usize {
        self.ab_pending.lock().unwrap().len()
    }

    /// Record all queued builds into `cmd`. Emits exactly one build
    /// call when anything is pending, none otherwise.
    pub fn dispatch_builds(
        &self,
        cmd: vk::CommandBuffer,
        frame: &Arc<FrameRenderState>,
    ) -> Result<()> {
        let pending = {
            let mut guard = self.ab_pending.lock().unwrap();
            std::mem::replace(&mut *guard, Vec::new())
        };
        if pending.is_empty() {
            return Ok(());
        }

        let dev = &self.ab_device;
        let loader = dev.accel_loader()?;
        let alignment = dev.features().df_as_scratch_alignment as u64;

        // One scratch buffer serves every build, at aligned offsets
        let mut offsets = Vec::with_capacity(pending.len());
        let mut total: u64 = 0;
        for blas in pending.iter() {
            total = align_up(total, alignment);
            offsets.push(total);
            total += blas.scratch_size();
        }

        let scratch = dev.create_buffer(
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            total,
        )?;
        let scratch_base = dev.buffer_address(scratch.b_buffer);

        // The geometry arrays must stay alive until the build call, the
        // build infos point into them
        let geometries: Vec<[vk::AccelerationStructureGeometryKHR; 1]> =
            pending.iter().map(|b| [b.make_geometry()]).collect();

        let build_infos: Vec<vk::AccelerationStructureBuildGeometryInfoKHR> = pending
            .iter()
            .zip(geometries.iter())
            .zip(offsets.iter())
            .map(|((blas, geo), &offset)| {
                vk::AccelerationStructureBuildGeometryInfoKHR::builder()
                    .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                    .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
                    .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                    .dst_acceleration_structure(blas.raw())
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: scratch_base + offset,
                    })
                    .geometries(geo)
                    .build()
            })
            .collect();

        let ranges: Vec<[vk::AccelerationStructureBuildRangeInfoKHR; 1]> = pending
            .iter()
            .map(|blas| {
                [vk::AccelerationStructureBuildRangeInfoKHR {
                    primitive_count: blas.primitive_count(),
                    primitive_offset: 0,
                    first_vertex: 0,
                    transform_offset: 0,
                }]
            })
            .collect();
        let range_refs: Vec<&[vk::AccelerationStructureBuildRangeInfoKHR]> =
            ranges.iter().map(|r| &r[..]).collect();

        unsafe {
            loader.cmd_build_acceleration_structures(cmd, &build_infos, &range_refs);

            // Make the fresh structures visible to the TLAS build and
            // to ray traversal later in the frame
            let barrier = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
                .dst_access_mask(
                    vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR
                        | vk::AccessFlags::SHADER_READ,
                )
                .build();
            dev.vk_device().cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                    | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }

        // The scratch memory and the built structures' inputs must
        // outlive this frame on the GPU timeline
        frame.register_transient_buffer(scratch);
        for blas in pending {
            frame.keep_alive(Box::new(blas));
        }

        Ok(())
    }
}
