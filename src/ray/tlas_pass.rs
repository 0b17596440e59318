// Per-frame top-level acceleration structure rebuild
//
// The TLAS is rebuilt from scratch every frame from the current ray
// drawable set. A persistent host-visible instance buffer stays mapped
// for the lifetime of the pass; each update copies the live instance
// records in and records one build, guarded against the previous
// frame's build reading the same scratch memory.

use std::sync::{Arc, Mutex};

use ash::vk;

use crate::device::{Buffer, Device, MappedBuffer};
use crate::ray::{RaySceneModule, Tlas};
use crate::Result;

pub struct TlasBuildPass {
    tp_device: Arc<Device>,
    tp_tlas: Tlas,
    tp_scratch: Buffer,
    tp_scratch_address: vk::DeviceAddress,
    tp_instances: MappedBuffer,
    tp_instance_address: vk::DeviceAddress,
    tp_scene: Arc<Mutex<RaySceneModule>>,
}

impl TlasBuildPass {
    pub fn new(
        device: Arc<Device>,
        scene: Arc<Mutex<RaySceneModule>>,
        max_instances: u32,
    ) -> Result<Self> {
        let tlas = Tlas::new(&device, max_instances)?;

        let scratch = device.create_buffer(
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            tlas.scratch_size(),
        )?;
        let scratch_address = device.buffer_address(scratch.b_buffer);

        let instances = device.create_mapped_buffer(
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            max_instances as u64
                * std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as u64,
        )?;
        let instance_address = device.buffer_address(instances.vk_buffer());

        Ok(Self {
            tp_device: device,
            tp_tlas: tlas,
            tp_scratch: scratch,
            tp_scratch_address: scratch_address,
            tp_instances: instances,
            tp_instance_address: instance_address,
            tp_scene: scene,
        })
    }

    pub fn tlas(&self) -> &Tlas {
        &self.tp_tlas
    }

    /// Record this frame's rebuild.
    pub fn update(&mut self, cmd: vk::CommandBuffer) -> Result<()> {
        let dev = &self.tp_device;

        unsafe {
            // The previous frame's build must be done with the scratch
            // buffer before we overwrite it
            let scratch_barrier = vk::BufferMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR)
                .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(self.tp_scratch.b_buffer)
                .size(vk::WHOLE_SIZE)
                .build();
            // And the host writes below must land before the build reads
            let instance_barrier = vk::BufferMemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::HOST_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .buffer(self.tp_instances.vk_buffer())
                .size(vk::WHOLE_SIZE)
                .build();

            dev.vk_device().cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::DependencyFlags::empty(),
                &[],
                &[scratch_barrier],
                &[],
            );
            dev.vk_device().cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::HOST,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::DependencyFlags::empty(),
                &[],
                &[instance_barrier],
                &[],
            );
        }

        let num_instances = {
            let scene = self.tp_scene.lock().unwrap();
            let records = scene.collect_tlas_instances();
            self.tp_instances.write_at(0, &records);
            records.len() as u32
        };

        self.tp_tlas.build(
            dev,
            cmd,
            self.tp_scratch_address,
            self.tp_instance_address,
            num_instances,
        )
    }

    pub fn destroy(&self) {
        let dev = &self.tp_device;
        self.tp_tlas.destroy(dev);
        self.tp_scratch.destroy(dev);
        self.tp_instances.destroy(dev);
    }
}
