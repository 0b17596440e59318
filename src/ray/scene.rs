// Ray instance slots
//
// Every ray-traced drawable owns one instance slot. A slot pairs the
// vulkan instance record that goes into the TLAS with the custom
// per-instance data (geometry and material indices) that shaders look
// up through the instance custom index.

use std::sync::Arc;

use ash::vk;
use cgmath::Matrix4;

use crate::ray::Blas;
use crate::util::{IdPool, IndexMap};

/// Per-instance data referenced by instanceCustomIndex. Unlike the
/// vulkan instance records this does not need to be tightly packed,
/// only stable under its index.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RayInstanceData {
    pub geometry_index: u32,
    pub material_index: u32,
}

struct InstanceEntry {
    ie_data: RayInstanceData,
    ie_instance: vk::AccelerationStructureInstanceKHR,
    /// Keeps the referenced structure alive while any instance uses it
    #[allow(dead_code)]
    ie_blas: Arc<Blas>,
}

// The instance record is plain data; the only non-auto-Send member is
// the address union inside it.
unsafe impl Send for InstanceEntry {}

pub struct RaySceneModule {
    rs_ids: IdPool,
    rs_instances: IndexMap<InstanceEntry>,
}

impl RaySceneModule {
    pub fn new() -> Self {
        Self {
            rs_ids: IdPool::new(),
            rs_instances: IndexMap::new(),
        }
    }

    /// Allocate an instance slot referencing `blas`. The returned index
    /// is stable until freed and doubles as the instance custom index.
    pub fn allocate_ray_instance(
        &mut self,
        data: RayInstanceData,
        mask: u8,
        sbt_record_offset: u32,
        flags: vk::GeometryInstanceFlagsKHR,
        blas: Arc<Blas>,
    ) -> u32 {
        let index = self.rs_ids.generate();

        let instance = vk::AccelerationStructureInstanceKHR {
            transform: matrix_to_transform(&Matrix4::from_scale(1.0)),
            instance_custom_index_and_mask: vk::Packed24_8::new(index, mask),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
                sbt_record_offset,
                flags.as_raw() as u8,
            ),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: blas.device_address(),
            },
        };

        self.rs_instances.insert(
            index,
            InstanceEntry {
                ie_data: data,
                ie_instance: instance,
                ie_blas: blas,
            },
        );

        index
    }

    pub fn free_ray_instance(&mut self, index: u32) {
        if self.rs_instances.remove(index).is_some() {
            self.rs_ids.free(index);
        }
    }

    pub fn set_instance_transform(&mut self, index: u32, transform: &Matrix4<f32>) {
        if let Some(entry) = self.rs_instances.get_mut(index) {
            entry.ie_instance.transform = matrix_to_transform(transform);
        }
    }

    pub fn num_instances(&self) -> u32 {
        self.rs_instances.len() as u32
    }

    /// The minimum size for buffers handed to `write_ray_instance_data`.
    pub fn ray_instance_data_size(&self) -> usize {
        self.rs_instances.len() * std::mem::size_of::<RayInstanceData>()
    }

    /// Pack the live instance records tightly into `out`, returning how
    /// many were written.
    pub fn write_tlas_instances(
        &self,
        out: &mut [vk::AccelerationStructureInstanceKHR],
    ) -> u32 {
        let mut written = 0;
        for (_, entry) in self.rs_instances.iter() {
            if written >= out.len() {
                break;
            }
            out[written] = entry.ie_instance;
            written += 1;
        }
        written as u32
    }

    /// Collect the live instance records into a vector, in slot order.
    pub fn collect_tlas_instances(&self) -> Vec<vk::AccelerationStructureInstanceKHR> {
        self.rs_instances
            .iter()
            .map(|(_, entry)| entry.ie_instance)
            .collect()
    }

    /// Pack the custom per-instance data, tightly, in slot order.
    pub fn write_ray_instance_data(&self, out: &mut [u8]) -> usize {
        let record = std::mem::size_of::<RayInstanceData>();
        let mut offset = 0;
        for (_, entry) in self.rs_instances.iter() {
            if offset + record > out.len() {
                break;
            }
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &entry.ie_data as *const RayInstanceData as *const u8,
                    out.as_mut_ptr().add(offset),
                    record,
                );
            }
            offset += record;
        }
        offset
    }
}

/// Convert a column-major matrix into the row-major 3x4 layout the
/// instance record wants.
fn matrix_to_transform(m: &Matrix4<f32>) -> vk::TransformMatrixKHR {
    vk::TransformMatrixKHR {
        matrix: [
            m.x.x, m.y.x, m.z.x, m.w.x, // row 0
            m.x.y, m.y.y, m.z.y, m.w.y, // row 1
            m.x.z, m.y.z, m.z.z, m.w.z, // row 2
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::Vector3;

    #[test]
    fn transform_is_row_major_3x4() {
        let m = Matrix4::from_translation(Vector3::new(1.0, 2.0, 3.0));
        let t = matrix_to_transform(&m);
        // Identity rotation rows with the translation in the last column
        assert_eq!(t.matrix[0..4], [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(t.matrix[4..8], [0.0, 1.0, 0.0, 2.0]);
        assert_eq!(t.matrix[8..12], [0.0, 0.0, 1.0, 3.0]);
    }
}
