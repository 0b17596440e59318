// The geometry registry
//
// Maps geometry asset ids to device buffers. On first load the index
// list goes through the triangle-cache optimizer, then index, mesh
// vertex and optional skeletal vertex buffers are staged through the
// data writer. When ray tracing is on the buffers additionally carry
// device-address and AS-build-input usage, and every staged write is
// fenced against acceleration-structure builds with a transfer to
// AS-build barrier.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use ash::vk;
use serde::{Deserialize, Serialize};

use crate::assets::descriptor::{AssetBinding, DescriptorBindingInfo, DescriptorUpdate};
use crate::assets::{AssetId, AssetSource, Geometry, Rig};
use crate::cache::{DataHandle, DeviceDataCache};
use crate::device::{Buffer, Device};
use crate::forsyth;
use crate::frame_state::FrameRenderState;
use crate::ray::{AsBuilder, Blas, BlasCreateInfo};
use crate::util::{slice_as_bytes, IdPool, IndexMap};
use crate::writer::ResourceDataWriter;
use crate::{Result, StratusError};

/// The static mesh vertex layout, stream 0 of every drawable pipeline.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub tangent: [f32; 3],
}

/// The skeletal vertex layout, stream 1, present only for rigged
/// geometry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkeletalVertex {
    pub bone_indices: [u32; 4],
    pub bone_weights: [f32; 4],
}

/// Host-side geometry content as produced by importers or the internal
/// asset format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GeometryData {
    pub indices: Vec<u32>,
    pub vertices: Vec<MeshVertex>,
    /// Empty unless the geometry is rigged
    pub skeletal_vertices: Vec<SkeletalVertex>,
    #[serde(bound = "")]
    pub rig: Option<AssetId<Rig>>,
}

/// The device resources for one resident geometry.
pub struct GeometryDeviceData {
    gd_device_index: u32,
    gd_index_buf: Buffer,
    gd_vertex_buf: Buffer,
    gd_skeletal_buf: Option<Buffer>,
    gd_num_indices: u32,
    gd_num_vertices: u32,
    gd_rig: Option<AssetId<Rig>>,
    /// Built on demand when a ray component first references this
    /// geometry
    gd_blas: Mutex<Option<Arc<Blas>>>,
}

impl GeometryDeviceData {
    pub fn destroy(&self, dev: &Device) {
        self.gd_index_buf.destroy(dev);
        self.gd_vertex_buf.destroy(dev);
        if let Some(buf) = self.gd_skeletal_buf.as_ref() {
            buf.destroy(dev);
        }
        if let Some(blas) = self.gd_blas.lock().unwrap().take() {
            blas.destroy(dev);
        }
    }
}

/// Shared handle to a resident geometry. Keeps the device data alive.
#[derive(Clone)]
pub struct GeometryHandle {
    gh_data: DataHandle<GeometryDeviceData>,
}

impl GeometryHandle {
    /// The slot this geometry occupies in the descriptor arrays.
    pub fn device_index(&self) -> u32 {
        self.gh_data.gd_device_index
    }

    pub fn num_indices(&self) -> u32 {
        self.gh_data.gd_num_indices
    }

    pub fn num_vertices(&self) -> u32 {
        self.gh_data.gd_num_vertices
    }

    pub fn has_skeleton(&self) -> bool {
        self.gh_data.gd_skeletal_buf.is_some()
    }

    pub fn rig(&self) -> Option<AssetId<Rig>> {
        self.gh_data.gd_rig
    }

    pub fn index_buffer(&self) -> vk::Buffer {
        self.gh_data.gd_index_buf.b_buffer
    }

    pub fn vertex_buffer(&self) -> vk::Buffer {
        self.gh_data.gd_vertex_buf.b_buffer
    }

    pub fn acceleration_structure(&self) -> Option<Arc<Blas>> {
        self.gh_data.gd_blas.lock().unwrap().clone()
    }

    /// Bind the index buffer and the vertex streams for drawing.
    pub fn bind(&self, dev: &Device, cmd: vk::CommandBuffer) {
        unsafe {
            let vkdev = dev.vk_device();
            vkdev.cmd_bind_index_buffer(
                cmd,
                self.gh_data.gd_index_buf.b_buffer,
                0,
                vk::IndexType::UINT32,
            );
            vkdev.cmd_bind_vertex_buffers(cmd, 0, &[self.gh_data.gd_vertex_buf.b_buffer], &[0]);
            if let Some(skel) = self.gh_data.gd_skeletal_buf.as_ref() {
                vkdev.cmd_bind_vertex_buffers(cmd, 1, &[skel.b_buffer], &[0]);
            }
        }
    }
}

struct SourceTable {
    st_ids: IdPool,
    st_sources: IndexMap<Box<dyn AssetSource<Geometry>>>,
}

pub struct GeometryRegistry {
    g_device: Arc<Device>,
    g_capacity: u32,
    g_sources: Mutex<SourceTable>,
    g_cache: DeviceDataCache<GeometryDeviceData>,
    g_writer: Mutex<ResourceDataWriter>,
    g_as_builder: AsBuilder,
    /// Descriptor rewrites queued by loads, drained by the manager
    g_updates: Mutex<Vec<DescriptorUpdate>>,
    /// Ids whose source was removed while device data was still
    /// referenced; returned to the pool once the data unloads
    g_zombies: Mutex<HashSet<u32>>,
}

impl GeometryRegistry {
    pub fn new(device: Arc<Device>, capacity: u32) -> Self {
        Self {
            g_writer: Mutex::new(ResourceDataWriter::new(device.clone())),
            g_as_builder: AsBuilder::new(device.clone()),
            g_device: device,
            g_capacity: capacity,
            g_sources: Mutex::new(SourceTable {
                st_ids: IdPool::new(),
                st_sources: IndexMap::new(),
            }),
            g_cache: DeviceDataCache::new(),
            g_updates: Mutex::new(Vec::new()),
            g_zombies: Mutex::new(HashSet::new()),
        }
    }

    /// Register a geometry source. No device work happens until the
    /// first handle is requested.
    pub fn add(&self, source: Box<dyn AssetSource<Geometry>>) -> Result<AssetId<Geometry>> {
        let mut sources = self.g_sources.lock().unwrap();
        if sources.st_ids.num_allocated() >= self.g_capacity {
            return Err(StratusError::CAPACITY_EXCEEDED);
        }
        let id = sources.st_ids.generate();
        sources.st_sources.insert(id, source);
        Ok(AssetId::new(id))
    }

    pub fn remove(&self, id: AssetId<Geometry>) -> Result<()> {
        let mut sources = self.g_sources.lock().unwrap();
        if sources.st_sources.remove(id.raw()).is_none() {
            return Err(StratusError::ASSET_NOT_FOUND);
        }

        if self.g_cache.is_loaded(id.raw()) {
            // Device data is still referenced; the id may not be reused
            // until it unloads
            self.g_zombies.lock().unwrap().insert(id.raw());
        } else {
            sources.st_ids.free(id.raw());
        }
        Ok(())
    }

    /// Get a handle, loading the device data on first use.
    pub fn get(&self, id: AssetId<Geometry>) -> Result<GeometryHandle> {
        let data = self
            .g_cache
            .get_with(id.raw(), |raw| self.load_device_data(raw))?;
        Ok(GeometryHandle { gh_data: data })
    }

    fn load_device_data(&self, id: u32) -> Result<GeometryDeviceData> {
        let sources = self.g_sources.lock().unwrap();
        let source = sources
            .st_sources
            .get(id)
            .ok_or(StratusError::ASSET_NOT_FOUND)?;

        let mut data = source.load()?;
        if data.indices.is_empty() || data.vertices.is_empty() {
            return Err(StratusError::VALIDATION_FAILED);
        }

        match forsyth::optimize_triangle_ordering(&data.indices) {
            Ok(optimized) => data.indices = optimized,
            Err(_) => log::warn!(
                "unable to optimize triangle order for geometry \"{}\"",
                source.name()
            ),
        }

        let rt = self.g_device.ray_tracing_enabled();
        let mut usage = vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST;
        if rt {
            usage |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
        }

        let index_buf = self.g_device.create_buffer(
            usage | vk::BufferUsageFlags::INDEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            (data.indices.len() * std::mem::size_of::<u32>()) as u64,
        )?;
        let vertex_buf = self.g_device.create_buffer(
            usage | vk::BufferUsageFlags::VERTEX_BUFFER,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            (data.vertices.len() * std::mem::size_of::<MeshVertex>()) as u64,
        )?;

        let mut writer = self.g_writer.lock().unwrap();
        writer.write_buffer(index_buf.b_buffer, 0, slice_as_bytes(&data.indices))?;
        writer.write_buffer(vertex_buf.b_buffer, 0, slice_as_bytes(&data.vertices))?;

        let skeletal_buf = if !data.skeletal_vertices.is_empty() {
            let buf = self.g_device.create_buffer(
                usage | vk::BufferUsageFlags::VERTEX_BUFFER,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                (data.skeletal_vertices.len() * std::mem::size_of::<SkeletalVertex>()) as u64,
            )?;
            writer.write_buffer(buf.b_buffer, 0, slice_as_bytes(&data.skeletal_vertices))?;
            Some(buf)
        } else {
            None
        };

        if data.rig.is_some() && skeletal_buf.is_none() {
            log::warn!(
                "geometry \"{}\" references a rig but has no skeletal vertices",
                source.name()
            );
        }

        if rt {
            // The AS build might not happen in the same frame as these
            // copies; the barrier is cheap enough to emit always
            for buf in [&index_buf, &vertex_buf].iter() {
                writer.barrier_post_write_buffer(
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::BufferMemoryBarrier::builder()
                        .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
                        .dst_access_mask(vk::AccessFlags::SHADER_READ)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .buffer(buf.b_buffer)
                        .size(vk::WHOLE_SIZE)
                        .build(),
                );
            }
        }

        let mut updates = self.g_updates.lock().unwrap();
        updates.push(DescriptorUpdate::buffer(
            AssetBinding::GeometryIndexBuffers as u32,
            id,
            index_buf.b_buffer,
        ));
        updates.push(DescriptorUpdate::buffer(
            AssetBinding::GeometryVertexBuffers as u32,
            id,
            vertex_buf.b_buffer,
        ));

        Ok(GeometryDeviceData {
            gd_device_index: id,
            gd_num_indices: data.indices.len() as u32,
            gd_num_vertices: data.vertices.len() as u32,
            gd_index_buf: index_buf,
            gd_vertex_buf: vertex_buf,
            gd_skeletal_buf: skeletal_buf,
            gd_rig: data.rig,
            gd_blas: Mutex::new(None),
        })
    }

    /// Make sure the geometry has a bottom-level acceleration
    /// structure, creating and enqueueing its build if absent.
    pub fn ensure_acceleration_structure(&self, id: AssetId<Geometry>) -> Result<Arc<Blas>> {
        if !self.g_device.ray_tracing_enabled() {
            return Err(StratusError::UNSUPPORTED);
        }

        let handle = self.get(id)?;
        let mut blas_slot = handle.gh_data.gd_blas.lock().unwrap();
        if let Some(blas) = blas_slot.as_ref() {
            return Ok(blas.clone());
        }

        let blas = Arc::new(Blas::new(
            &self.g_device,
            &BlasCreateInfo {
                vertex_buffer: handle.gh_data.gd_vertex_buf.b_buffer,
                index_buffer: handle.gh_data.gd_index_buf.b_buffer,
                vertex_count: handle.gh_data.gd_num_vertices,
                vertex_stride: std::mem::size_of::<MeshVertex>() as u64,
                primitive_count: handle.gh_data.gd_num_indices / 3,
            },
        )?);
        self.g_as_builder.enqueue(blas.clone());
        *blas_slot = Some(blas.clone());

        Ok(blas)
    }

    /// Flush staged uploads, dispatch queued AS builds and retire
    /// unloaded device data to the current frame.
    pub fn update(&self, cmd: vk::CommandBuffer, frame: &Arc<FrameRenderState>) -> Result<()> {
        self.g_writer.lock().unwrap().update(cmd, frame);
        if self.g_device.ray_tracing_enabled() {
            self.g_as_builder.dispatch_builds(cmd, frame)?;
        }

        for data in self.g_cache.drain_pending_unloads() {
            let raw = data.gd_device_index;
            if self.g_zombies.lock().unwrap().remove(&raw) {
                self.g_sources.lock().unwrap().st_ids.free(raw);
            }

            let dev = self.g_device.clone();
            frame.on_render_finished(move || data.destroy(&dev));
        }
        Ok(())
    }

    pub fn descriptor_layout_bindings(&self) -> Vec<DescriptorBindingInfo> {
        let info = |binding: AssetBinding| DescriptorBindingInfo {
            binding: binding as u32,
            ty: vk::DescriptorType::STORAGE_BUFFER,
            count: self.g_capacity,
            stages: vk::ShaderStageFlags::ALL,
            flags: vk::DescriptorBindingFlags::PARTIALLY_BOUND,
        };
        vec![
            info(AssetBinding::GeometryIndexBuffers),
            info(AssetBinding::GeometryVertexBuffers),
        ]
    }

    pub fn descriptor_updates(&self) -> Vec<DescriptorUpdate> {
        std::mem::replace(&mut *self.g_updates.lock().unwrap(), Vec::new())
    }

    /// Tear down every resident resource. Only valid once the device
    /// is idle.
    pub fn destroy(&self) {
        for data in self.g_cache.drain_pending_unloads() {
            data.destroy(&self.g_device);
        }
    }
}
