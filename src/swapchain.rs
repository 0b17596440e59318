// The presentation surface consumed by the renderer
//
// The windowing layer creates the swapchain and hands the pieces to
// this wrapper; the engine only acquires images and presents them. The
// caller is required to have created the swapchain with at least
// color-attachment and storage usage.

use ash::extensions::khr;
use ash::vk;

use crate::device::ExclusiveQueue;
use crate::{Result, StratusError};

pub struct Swapchain {
    /// loads swapchain extension entry points
    sc_loader: khr::Swapchain,
    /// the actual swapchain, owned by the windowing layer
    sc_swapchain: vk::SwapchainKHR,
    sc_images: Vec<vk::Image>,
    sc_views: Vec<vk::ImageView>,
    sc_extent: vk::Extent2D,
    sc_format: vk::Format,
}

impl Swapchain {
    /// Wrap an externally created swapchain. The image views must be in
    /// swapchain-image order.
    pub fn new(
        loader: khr::Swapchain,
        swapchain: vk::SwapchainKHR,
        images: Vec<vk::Image>,
        views: Vec<vk::ImageView>,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> Self {
        assert_eq!(images.len(), views.len());
        Self {
            sc_loader: loader,
            sc_swapchain: swapchain,
            sc_images: images,
            sc_views: views,
            sc_extent: extent,
            sc_format: format,
        }
    }

    pub fn image_count(&self) -> u32 {
        self.sc_images.len() as u32
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.sc_extent
    }

    pub fn format(&self) -> vk::Format {
        self.sc_format
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.sc_images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.sc_views
    }

    /// Acquire the next image, signaling `semaphore` when it is ready.
    ///
    /// NOT_READY and TIMEOUT are retried in place: some drivers return
    /// them transiently and propagating them up would fail the frame for
    /// no reason. OUT_OF_DATE and SUBOPTIMAL are reported so the caller
    /// can recreate the swapchain.
    pub fn acquire_image(&self, semaphore: vk::Semaphore) -> Result<u32> {
        unsafe {
            loop {
                match self.sc_loader.acquire_next_image(
                    self.sc_swapchain,
                    u64::MAX,
                    semaphore,
                    vk::Fence::null(),
                ) {
                    Ok((index, false)) => return Ok(index),
                    Ok((_, true)) => return Err(StratusError::OUT_OF_DATE),
                    Err(vk::Result::NOT_READY) | Err(vk::Result::TIMEOUT) => continue,
                    Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                        return Err(StratusError::OUT_OF_DATE)
                    }
                    Err(_) => return Err(StratusError::COULD_NOT_ACQUIRE_IMAGE),
                }
            }
        }
    }

    /// Queue the image for presentation once `wait_semaphore` signals.
    pub fn present_image(
        &self,
        queue: &ExclusiveQueue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> Result<()> {
        let wait_semas = [wait_semaphore];
        let swapchains = [self.sc_swapchain];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semas)
            .swapchains(&swapchains)
            .image_indices(&indices);

        unsafe {
            match self.sc_loader.queue_present(queue.raw(), &info) {
                Ok(_) => Ok(()),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(StratusError::OUT_OF_DATE),
                Err(vk::Result::SUBOPTIMAL_KHR) => Err(StratusError::OUT_OF_DATE),
                Err(_) => Err(StratusError::PRESENT_FAILED),
            }
        }
    }
}
