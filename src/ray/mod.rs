// Acceleration structure wrappers
//
// Bottom-level structures index one geometry's triangles, the top-level
// structure indexes instances of them. Both keep only plain data about
// their build inputs; the vulkan build-info structs are reconstructed
// at dispatch time because they hold raw pointers that must not outlive
// a command recording.

mod builder;
mod scene;
mod tlas_pass;

pub use builder::AsBuilder;
pub use scene::{RayInstanceData, RaySceneModule};
pub use tlas_pass::TlasBuildPass;

use ash::vk;

use crate::device::{Buffer, Device};
use crate::{Result, StratusError};

/// Build inputs for a bottom-level acceleration structure. The buffers
/// must have been created with device-address and AS-build-input usage.
pub struct BlasCreateInfo {
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub vertex_count: u32,
    pub vertex_stride: vk::DeviceSize,
    pub primitive_count: u32,
}

/// A bottom-level acceleration structure over one triangle geometry.
///
/// Creating the object allocates the backing buffer and queries the
/// build sizes; the actual build is batched by `AsBuilder`.
pub struct Blas {
    b_accel: vk::AccelerationStructureKHR,
    b_buffer: Buffer,
    b_address: vk::DeviceAddress,
    b_scratch_size: vk::DeviceSize,

    // Retained build inputs, used to reconstruct the geometry info at
    // dispatch time
    b_vertex_address: vk::DeviceAddress,
    b_index_address: vk::DeviceAddress,
    b_vertex_count: u32,
    b_vertex_stride: vk::DeviceSize,
    b_primitive_count: u32,
}

impl Blas {
    pub fn new(dev: &Device, info: &BlasCreateInfo) -> Result<Self> {
        let loader = dev.accel_loader()?;

        let vertex_address = dev.buffer_address(info.vertex_buffer);
        let index_address = dev.buffer_address(info.index_buffer);

        let geometry = make_triangle_geometry(
            vertex_address,
            index_address,
            info.vertex_count,
            info.vertex_stride,
        );
        let geometries = [geometry];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let sizes = unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[info.primitive_count],
            )
        };

        let buffer = dev.create_buffer(
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            sizes.acceleration_structure_size,
        )?;

        let accel = unsafe {
            loader
                .create_acceleration_structure(
                    &vk::AccelerationStructureCreateInfoKHR::builder()
                        .buffer(buffer.b_buffer)
                        .size(sizes.acceleration_structure_size)
                        .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL),
                    None,
                )
                .map_err(StratusError::from_vk)?
        };

        let address = unsafe {
            loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                    .acceleration_structure(accel),
            )
        };

        Ok(Self {
            b_accel: accel,
            b_buffer: buffer,
            b_address: address,
            b_scratch_size: sizes.build_scratch_size,
            b_vertex_address: vertex_address,
            b_index_address: index_address,
            b_vertex_count: info.vertex_count,
            b_vertex_stride: info.vertex_stride,
            b_primitive_count: info.primitive_count,
        })
    }

    /// The device address TLAS instances reference this structure by.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.b_address
    }

    pub fn scratch_size(&self) -> vk::DeviceSize {
        self.b_scratch_size
    }

    pub fn primitive_count(&self) -> u32 {
        self.b_primitive_count
    }

    pub(crate) fn raw(&self) -> vk::AccelerationStructureKHR {
        self.b_accel
    }

    pub(crate) fn make_geometry(&self) -> vk::AccelerationStructureGeometryKHR {
        make_triangle_geometry(
            self.b_vertex_address,
            self.b_index_address,
            self.b_vertex_count,
            self.b_vertex_stride,
        )
    }

    pub fn destroy(&self, dev: &Device) {
        if let Ok(loader) = dev.accel_loader() {
            unsafe {
                loader.destroy_acceleration_structure(self.b_accel, None);
            }
        }
        self.b_buffer.destroy(dev);
    }
}

fn make_triangle_geometry(
    vertex_address: vk::DeviceAddress,
    index_address: vk::DeviceAddress,
    vertex_count: u32,
    vertex_stride: vk::DeviceSize,
) -> vk::AccelerationStructureGeometryKHR {
    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            triangles: vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
                .vertex_format(vk::Format::R32G32B32_SFLOAT)
                .vertex_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: vertex_address,
                })
                .vertex_stride(vertex_stride)
                .max_vertex(vertex_count.saturating_sub(1))
                .index_type(vk::IndexType::UINT32)
                .index_data(vk::DeviceOrHostAddressConstKHR {
                    device_address: index_address,
                })
                .build(),
        })
        .build()
}

/// The top-level acceleration structure. Rebuilt every frame from the
/// live set of ray instances by the TLAS build pass.
pub struct Tlas {
    t_accel: vk::AccelerationStructureKHR,
    t_buffer: Buffer,
    t_max_instances: u32,
    t_scratch_size: vk::DeviceSize,
}

impl Tlas {
    pub fn new(dev: &Device, max_instances: u32) -> Result<Self> {
        let loader = dev.accel_loader()?;

        let geometries = [make_instance_geometry(0)];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let sizes = unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[max_instances],
            )
        };

        let buffer = dev.create_buffer(
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            sizes.acceleration_structure_size,
        )?;

        let accel = unsafe {
            loader
                .create_acceleration_structure(
                    &vk::AccelerationStructureCreateInfoKHR::builder()
                        .buffer(buffer.b_buffer)
                        .size(sizes.acceleration_structure_size)
                        .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL),
                    None,
                )
                .map_err(StratusError::from_vk)?
        };

        Ok(Self {
            t_accel: accel,
            t_buffer: buffer,
            t_max_instances: max_instances,
            t_scratch_size: sizes.build_scratch_size,
        })
    }

    pub fn max_instances(&self) -> u32 {
        self.t_max_instances
    }

    pub fn scratch_size(&self) -> vk::DeviceSize {
        self.t_scratch_size
    }

    pub fn raw(&self) -> vk::AccelerationStructureKHR {
        self.t_accel
    }

    /// Record a full rebuild from `num_instances` records in the
    /// instance buffer.
    pub fn build(
        &self,
        dev: &Device,
        cmd: vk::CommandBuffer,
        scratch_address: vk::DeviceAddress,
        instance_address: vk::DeviceAddress,
        num_instances: u32,
    ) -> Result<()> {
        let loader = dev.accel_loader()?;

        let geometries = [make_instance_geometry(instance_address)];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .dst_acceleration_structure(self.t_accel)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch_address,
            })
            .geometries(&geometries)
            .build();

        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: num_instances.min(self.t_max_instances),
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };

        unsafe {
            loader.cmd_build_acceleration_structures(cmd, &[build_info], &[&[range]]);
        }
        Ok(())
    }

    pub fn destroy(&self, dev: &Device) {
        if let Ok(loader) = dev.accel_loader() {
            unsafe {
                loader.destroy_acceleration_structure(self.t_accel, None);
            }
        }
        self.t_buffer.destroy(dev);
    }
}

fn make_instance_geometry(
    instance_address: vk::DeviceAddress,
) -> vk::AccelerationStructureGeometryKHR {
    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR {
            instances: vk::AccelerationStructureGeometryInstancesDataKHR::builder()
                .array_of_pointers(false)
                .data(vk::DeviceOrHostAddressConstKHR {
                    device_address: instance_address,
                })
                .build(),
        })
        .build()
}
