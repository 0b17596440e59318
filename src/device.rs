// Vulkan device representation
//
// This wraps the logical device the caller created and injects it into
// the rest of the engine. Stratus never creates an instance, selects a
// physical device or owns a window surface: those live in the windowing
// layer. What lives here is everything the core needs per GPU: queue
// wrappers, memory type selection, buffer/image helpers and the feature
// set the device was opened with.

use std::sync::Mutex;
use std::thread::{self, ThreadId};

use ash::extensions::khr;
use ash::vk;

use crate::{Result, StratusError};

/// Everything the caller must hand over when wiring the core up to its
/// Vulkan binding layer. The queues must have been retrieved from the
/// given families.
pub struct DeviceCreateInfo<'a> {
    pub instance: &'a ash::Instance,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub graphics_family: u32,
    pub transfer_family: u32,
    pub graphics_queue: vk::Queue,
    pub transfer_queue: vk::Queue,
    pub present_queue: vk::Queue,
    /// Request the ray tracing feature set. If the physical device does
    /// not support it the engine degrades to rasterization only.
    pub enable_ray_tracing: bool,
}

/// Device capability and limit info sampled at creation.
#[derive(Debug, Clone, Copy)]
pub struct DeviceFeatures {
    /// True when acceleration structures and ray pipelines are usable
    pub df_ray_tracing: bool,
    /// Required scratch-offset alignment for AS builds
    pub df_as_scratch_alignment: u32,
    /// Largest combined-image-sampler array the device can bind
    pub df_max_sampler_count: u32,
}

/// A queue that may only ever be submitted to from one thread.
///
/// Vulkan queues are externally synchronized. Rather than lock around
/// submission we assert single-thread ownership: the first submission
/// claims the queue, any later submission from a different thread is a
/// programming error and aborts.
pub struct ExclusiveQueue {
    eq_queue: vk::Queue,
    eq_owner: Mutex<Option<ThreadId>>,
}

impl ExclusiveQueue {
    fn new(queue: vk::Queue) -> Self {
        Self {
            eq_queue: queue,
            eq_owner: Mutex::new(None),
        }
    }

    fn assert_owned(&self) {
        let mut owner = self.eq_owner.lock().unwrap();
        let me = thread::current().id();
        match *owner {
            Some(tid) => assert!(
                tid == me,
                "exclusive queue submitted to from a second thread"
            ),
            None => *owner = Some(me),
        }
    }

    pub fn submit(
        &self,
        dev: &Device,
        submits: &[vk::SubmitInfo],
        fence: vk::Fence,
    ) -> Result<()> {
        self.assert_owned();
        unsafe {
            dev.d_dev
                .queue_submit(self.eq_queue, submits, fence)
                .map_err(StratusError::from_vk)
        }
    }

    /// The raw queue, for present calls through the swapchain loader.
    /// Ownership is still asserted.
    pub(crate) fn raw(&self) -> vk::Queue {
        self.assert_owned();
        self.eq_queue
    }
}

/// A device-memory backed buffer. Destruction is explicit so the frame
/// machinery can defer it until no in-flight frame references it.
#[derive(Debug)]
pub struct Buffer {
    pub b_buffer: vk::Buffer,
    pub b_memory: vk::DeviceMemory,
    pub b_size: vk::DeviceSize,
}

impl Buffer {
    pub fn destroy(&self, dev: &Device) {
        unsafe {
            dev.d_dev.destroy_buffer(self.b_buffer, None);
            dev.d_dev.free_memory(self.b_memory, None);
        }
    }
}

/// A buffer that stays host-mapped for its whole lifetime. Used for the
/// shadow matrix buffer and the TLAS instance buffer, which are written
/// every frame.
#[derive(Debug)]
pub struct MappedBuffer {
    pub mb_buffer: Buffer,
    mb_ptr: *mut u8,
}

// The mapping pointer refers to vulkan-owned memory and is valid for the
// lifetime of the buffer regardless of which thread writes through it.
unsafe impl Send for MappedBuffer {}
unsafe impl Sync for MappedBuffer {}

impl MappedBuffer {
    /// Copy `data` into the mapping at a byte offset. The memory is
    /// host coherent, no flush is required.
    pub fn write_at<T: Copy>(&self, byte_offset: usize, data: &[T]) {
        let len = data.len() * std::mem::size_of::<T>();
        assert!(
            byte_offset + len <= self.mb_buffer.b_size as usize,
            "write past the end of a mapped buffer"
        );
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr() as *const u8,
                self.mb_ptr.add(byte_offset),
                len,
            );
        }
    }

    pub fn vk_buffer(&self) -> vk::Buffer {
        self.mb_buffer.b_buffer
    }

    pub fn destroy(&self, dev: &Device) {
        unsafe {
            dev.d_dev.unmap_memory(self.mb_buffer.b_memory);
        }
        self.mb_buffer.destroy(dev);
    }
}

/// An image plus its view and the sampler it is bound with in
/// descriptor arrays. The sampler is the device's shared default and is
/// not owned here.
#[derive(Debug)]
pub struct Image {
    pub i_image: vk::Image,
    pub i_view: vk::ImageView,
    pub i_memory: vk::DeviceMemory,
    pub i_sampler: vk::Sampler,
    pub i_extent: vk::Extent2D,
    pub i_format: vk::Format,
}

impl Image {
    pub fn destroy(&self, dev: &Device) {
        unsafe {
            dev.d_dev.destroy_image_view(self.i_view, None);
            dev.d_dev.destroy_image(self.i_image, None);
            dev.d_dev.free_memory(self.i_memory, None);
        }
    }
}

/// The engine's per-GPU state.
pub struct Device {
    /// the logical device we are using, created by the caller
    pub(crate) d_dev: ash::Device,
    pub(crate) d_pdev: vk::PhysicalDevice,
    pub(crate) d_mem_props: vk::PhysicalDeviceMemoryProperties,
    pub(crate) d_features: DeviceFeatures,

    pub(crate) d_graphics_family: u32,
    #[allow(dead_code)]
    pub(crate) d_transfer_family: u32,
    pub(crate) d_graphics_queue: ExclusiveQueue,
    #[allow(dead_code)]
    pub(crate) d_transfer_queue: ExclusiveQueue,
    pub(crate) d_present_queue: ExclusiveQueue,

    /// Loader for VK_KHR_acceleration_structure, present only when ray
    /// tracing is enabled
    pub(crate) d_accel_loader: Option<khr::AccelerationStructure>,

    /// One sampler shared by every sampled image the engine creates
    pub(crate) d_default_sampler: vk::Sampler,
}

impl Device {
    /// Wrap a caller-created logical device.
    ///
    /// If `enable_ray_tracing` is set but the physical device lacks the
    /// acceleration-structure or ray-pipeline features, this logs one
    /// warning and continues with rasterization only.
    pub fn new(info: DeviceCreateInfo) -> Result<Self> {
        unsafe {
            let mem_props = info
                .instance
                .get_physical_device_memory_properties(info.physical_device);

            let mut as_features =
                vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
            let mut rt_features =
                vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
            let mut features2 = vk::PhysicalDeviceFeatures2::builder()
                .push_next(&mut as_features)
                .push_next(&mut rt_features)
                .build();
            info.instance
                .get_physical_device_features2(info.physical_device, &mut features2);

            let rt_supported = as_features.acceleration_structure != 0
                && rt_features.ray_tracing_pipeline != 0;
            let ray_tracing = if info.enable_ray_tracing && !rt_supported {
                log::warn!(
                    "Ray tracing was requested but the device does not \
                     support it, continuing with rasterization only"
                );
                false
            } else {
                info.enable_ray_tracing
            };

            let mut as_props =
                vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
            let mut props2 = vk::PhysicalDeviceProperties2::builder()
                .push_next(&mut as_props)
                .build();
            info.instance
                .get_physical_device_properties2(info.physical_device, &mut props2);
            let limits = props2.properties.limits;

            let accel_loader = if ray_tracing {
                Some(khr::AccelerationStructure::new(info.instance, &info.device))
            } else {
                None
            };

            let sampler_info = vk::SamplerCreateInfo::builder()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
                .address_mode_u(vk::SamplerAddressMode::REPEAT)
                .address_mode_v(vk::SamplerAddressMode::REPEAT)
                .address_mode_w(vk::SamplerAddressMode::REPEAT)
                .max_anisotropy(1.0);
            let sampler = info
                .device
                .create_sampler(&sampler_info, None)
                .map_err(StratusError::from_vk)?;

            Ok(Self {
                d_dev: info.device,
                d_pdev: info.physical_device,
                d_mem_props: mem_props,
                d_features: DeviceFeatures {
                    df_ray_tracing: ray_tracing,
                    df_as_scratch_alignment: as_props
                        .min_acceleration_structure_scratch_offset_alignment
                        .max(1),
                    df_max_sampler_count: limits
                        .max_per_stage_descriptor_sampled_images,
                },
                d_graphics_family: info.graphics_family,
                d_transfer_family: info.transfer_family,
                d_graphics_queue: ExclusiveQueue::new(info.graphics_queue),
                d_transfer_queue: ExclusiveQueue::new(info.transfer_queue),
                d_present_queue: ExclusiveQueue::new(info.present_queue),
                d_accel_loader: accel_loader,
                d_default_sampler: sampler,
            })
        }
    }

    pub fn vk_device(&self) -> &ash::Device {
        &self.d_dev
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.d_pdev
    }

    pub fn features(&self) -> &DeviceFeatures {
        &self.d_features
    }

    pub fn ray_tracing_enabled(&self) -> bool {
        self.d_features.df_ray_tracing
    }

    pub fn graphics_family(&self) -> u32 {
        self.d_graphics_family
    }

    pub fn default_sampler(&self) -> vk::Sampler {
        self.d_default_sampler
    }

    pub(crate) fn accel_loader(&self) -> Result<&khr::AccelerationStructure> {
        self.d_accel_loader
            .as_ref()
            .ok_or(StratusError::UNSUPPORTED)
    }

    /// Find a memory type index fitting both the type bits of the
    /// resource and the requested property flags.
    fn find_memory_type(
        &self,
        type_bits: u32,
        props: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        for i in 0..self.d_mem_props.memory_type_count {
            if type_bits & (1 << i) != 0
                && self.d_mem_props.memory_types[i as usize]
                    .property_flags
                    .contains(props)
            {
                return Ok(i);
            }
        }
        Err(StratusError::OUT_OF_MEMORY)
    }

    /// Create a buffer of `size` bytes backed by freshly allocated
    /// memory with the given properties.
    pub fn create_buffer(
        &self,
        usage: vk::BufferUsageFlags,
        props: vk::MemoryPropertyFlags,
        size: vk::DeviceSize,
    ) -> Result<Buffer> {
        unsafe {
            let info = vk::BufferCreateInfo::builder()
                .size(size.max(1))
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE);
            let buffer = self
                .d_dev
                .create_buffer(&info, None)
                .map_err(StratusError::from_vk)?;

            let reqs = self.d_dev.get_buffer_memory_requirements(buffer);
            let mem_type = match self.find_memory_type(reqs.memory_type_bits, props) {
                Ok(t) => t,
                Err(e) => {
                    self.d_dev.destroy_buffer(buffer, None);
                    return Err(e);
                }
            };

            let mut alloc_flags = vk::MemoryAllocateFlagsInfo::builder()
                .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
            let mut alloc = vk::MemoryAllocateInfo::builder()
                .allocation_size(reqs.size)
                .memory_type_index(mem_type);
            if usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
                alloc = alloc.push_next(&mut alloc_flags);
            }

            let memory = match self.d_dev.allocate_memory(&alloc, None) {
                Ok(m) => m,
                Err(e) => {
                    self.d_dev.destroy_buffer(buffer, None);
                    return Err(StratusError::from_vk(e));
                }
            };
            self.d_dev
                .bind_buffer_memory(buffer, memory, 0)
                .map_err(StratusError::from_vk)?;

            Ok(Buffer {
                b_buffer: buffer,
                b_memory: memory,
                b_size: size,
            })
        }
    }

    /// Create a host-visible, host-coherent buffer and leave it mapped.
    pub fn create_mapped_buffer(
        &self,
        usage: vk::BufferUsageFlags,
        size: vk::DeviceSize,
    ) -> Result<MappedBuffer> {
        let buffer = self.create_buffer(
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            size,
        )?;

        unsafe {
            let ptr = self
                .d_dev
                .map_memory(buffer.b_memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .map_err(StratusError::from_vk)?;
            Ok(MappedBuffer {
                mb_buffer: buffer,
                mb_ptr: ptr as *mut u8,
            })
        }
    }

    /// Copy `data` into mapped-coherent memory at a byte offset.
    pub fn update_memory<T: Copy>(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        data: &[T],
    ) -> Result<()> {
        let len = data.len() * std::mem::size_of::<T>();
        unsafe {
            let ptr = self
                .d_dev
                .map_memory(memory, offset, len as u64, vk::MemoryMapFlags::empty())
                .map_err(StratusError::from_vk)?;
            std::ptr::copy_nonoverlapping(data.as_ptr() as *const u8, ptr as *mut u8, len);
            self.d_dev.unmap_memory(memory);
        }
        Ok(())
    }

    pub fn buffer_address(&self, buffer: vk::Buffer) -> vk::DeviceAddress {
        unsafe {
            self.d_dev.get_buffer_device_address(
                &vk::BufferDeviceAddressInfo::builder().buffer(buffer),
            )
        }
    }

    /// Create a 2D image with a view and the shared default sampler.
    pub fn create_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Image> {
        unsafe {
            let info = vk::ImageCreateInfo::builder()
                .image_type(vk::ImageType::TYPE_2D)
                .format(format)
                .extent(vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                })
                .mip_levels(1)
                .array_layers(1)
                .samples(vk::SampleCountFlags::TYPE_1)
                .tiling(vk::ImageTiling::OPTIMAL)
                .usage(usage)
                .sharing_mode(vk::SharingMode::EXCLUSIVE)
                .initial_layout(vk::ImageLayout::UNDEFINED);
            let image = self
                .d_dev
                .create_image(&info, None)
                .map_err(StratusError::from_vk)?;

            let reqs = self.d_dev.get_image_memory_requirements(image);
            let mem_type = self
                .find_memory_type(reqs.memory_type_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;
            let memory = self
                .d_dev
                .allocate_memory(
                    &vk::MemoryAllocateInfo::builder()
                        .allocation_size(reqs.size)
                        .memory_type_index(mem_type),
                    None,
                )
                .map_err(StratusError::from_vk)?;
            self.d_dev
                .bind_image_memory(image, memory, 0)
                .map_err(StratusError::from_vk)?;

            let view = self
                .d_dev
                .create_image_view(
                    &vk::ImageViewCreateInfo::builder()
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(format)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: aspect,
                            base_mip_level: 0,
                            level_count: 1,
                            base_array_layer: 0,
                            layer_count: 1,
                        })
                        .image(image),
                    None,
                )
                .map_err(StratusError::from_vk)?;

            Ok(Image {
                i_image: image,
                i_view: view,
                i_memory: memory,
                i_sampler: self.d_default_sampler,
                i_extent: extent,
                i_format: format,
            })
        }
    }

    pub fn create_command_pool(&self, family: u32) -> Result<vk::CommandPool> {
        unsafe {
            self.d_dev
                .create_command_pool(
                    &vk::CommandPoolCreateInfo::builder()
                        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
                        .queue_family_index(family),
                    None,
                )
                .map_err(StratusError::from_vk)
        }
    }

    pub fn create_command_buffers(
        &self,
        pool: vk::CommandPool,
        count: u32,
    ) -> Result<Vec<vk::CommandBuffer>> {
        unsafe {
            self.d_dev
                .allocate_command_buffers(
                    &vk::CommandBufferAllocateInfo::builder()
                        .command_pool(pool)
                        .level(vk::CommandBufferLevel::PRIMARY)
                        .command_buffer_count(count),
                )
                .map_err(StratusError::from_vk)
        }
    }

    pub fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        unsafe {
            self.d_dev
                .create_fence(&vk::FenceCreateInfo::builder().flags(flags), None)
                .map_err(StratusError::from_vk)
        }
    }

    pub fn create_semaphore(&self) -> Result<vk::Semaphore> {
        unsafe {
            self.d_dev
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                .map_err(StratusError::from_vk)
        }
    }

    /// Create a timeline semaphore starting at `initial`.
    pub fn create_timeline_semaphore(&self, initial: u64) -> Result<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial);
        let info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        unsafe {
            self.d_dev
                .create_semaphore(&info, None)
                .map_err(StratusError::from_vk)
        }
    }

    /// Block until the timeline semaphore reaches `value`.
    pub fn wait_timeline(
        &self,
        semaphore: vk::Semaphore,
        value: u64,
        timeout_ns: u64,
    ) -> Result<()> {
        let semaphores = [semaphore];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        unsafe {
            self.d_dev
                .wait_semaphores(&info, timeout_ns)
                .map_err(StratusError::from_vk)
        }
    }

    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.d_dev.device_wait_idle();
        }
    }

    /// Tear down the objects this wrapper created itself. The logical
    /// device is the caller's and is left untouched.
    pub fn destroy_owned(&self) {
        unsafe {
            self.d_dev.destroy_sampler(self.d_default_sampler, None);
        }
    }
}
