// The Stratus rendering engine core
//
// This crate is the device-facing core of a Vulkan 1.3 real-time
// renderer. It schedules multi-buffered frames from a declarative render
// graph, keeps content-addressed asset registries resident on the GPU,
// and composes logical drawables into draw-call registrations across
// rasterization and ray-tracing pipelines.
//
// The underlying Vulkan plumbing (instance/device/swapchain creation,
// window surfaces) is owned by the caller and injected through `Device`
// and `Swapchain`. Nothing in here creates process-wide state.

pub mod assets;
mod cache;
mod camera;
mod device;
mod drawable;
mod forsyth;
mod frame;
mod frame_state;
mod graph;
mod light;
mod material_runtime;
mod node;
mod pass;
pub mod ray;
mod recorder;
mod renderer;
mod scene;
mod shadow;
mod swapchain;
mod util;
mod writer;

pub use cache::{DataHandle, DeviceDataCache};
pub use camera::Camera;
pub use device::{
    Buffer, Device, DeviceCreateInfo, DeviceFeatures, ExclusiveQueue, Image, MappedBuffer,
};
pub use drawable::{
    AnimationEngine, AnimationPushState, DrawRegistration, DrawableId, DrawableScene,
    RasterComponentCreateInfo, RayComponentCreateInfo, NO_ANIMATION,
};
pub use frame::{FrameClock, FrameSpecific};
pub use frame_state::{Droppable, FrameRenderState};
pub use graph::{PassId, RenderGraph, StageId};
pub use light::{
    LightBuffer, LightDeviceData, LightHandle, LightRegistry, MAX_SHADOWS_PER_LIGHT,
};
pub use material_runtime::{
    MaterialRuntime, PipelineEntry, PipelineId, PipelineRegistry, PushConstantMap,
    PushConstantSlot, ShaderProgram, ShaderStageBlob, SpecConstant, PC_ANIMATION_INDEX,
    PC_KEYFRAMES, PC_KEYFRAME_WEIGHT, PC_MATERIAL_INDEX, PC_MODEL_MATRIX,
};
pub use node::{Node, NodeArena, NodeId};
pub use pass::{
    destroy_raster_pass, make_clear_pass, PassFn, RasterPassCreateInfo, RenderPass,
    RenderPassStore,
};
pub use recorder::CommandRecorder;
pub use renderer::{FrameContext, FrameUpdater, Renderer, RendererCreateInfo};
pub use scene::{
    DrawEnvironment, DrawFn, RegistrationId, SceneBase, SubPassId, UniqueRegistrationId,
};
pub use shadow::{ShadowDescriptor, ShadowHandle, ShadowPool, ShadowPoolCreateInfo};
pub use swapchain::Swapchain;
pub use writer::ResourceDataWriter;

use thiserror::Error;

/// Error kinds surfaced by the engine core.
///
/// All fallible operations return one of these. The only conditions that
/// abort instead of returning are synchronization-invariant breaches,
/// which are programming errors.
#[allow(non_camel_case_types)]
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy)]
pub enum StratusError {
    #[error("Requested feature is not supported by this device")]
    UNSUPPORTED,
    #[error("Device memory allocation failed")]
    OUT_OF_MEMORY,
    #[error("Asset could not be found or its id is no longer valid")]
    ASSET_NOT_FOUND,
    #[error("Operation timed out")]
    TIMEOUT,
    #[error("A precondition of this operation was violated")]
    VALIDATION_FAILED,
    #[error("A fixed capacity has been exhausted")]
    CAPACITY_EXCEEDED,
    #[error("The swapchain is out of date and must be recreated")]
    OUT_OF_DATE,
    #[error("Could not acquire the next swapchain image")]
    COULD_NOT_ACQUIRE_IMAGE,
    #[error("Presentation to the display failed")]
    PRESENT_FAILED,
    #[error("The Vulkan device was lost")]
    DEVICE_LOST,
    #[error("Recording command buffers failed")]
    RECORD_FAILED,
}

pub type Result<T> = std::result::Result<T, StratusError>;

impl StratusError {
    /// Translate a raw Vulkan result into our error kinds.
    pub(crate) fn from_vk(res: ash::vk::Result) -> Self {
        use ash::vk;

        match res {
            vk::Result::TIMEOUT => StratusError::TIMEOUT,
            vk::Result::ERROR_OUT_OF_DATE_KHR => StratusError::OUT_OF_DATE,
            vk::Result::SUBOPTIMAL_KHR => StratusError::OUT_OF_DATE,
            vk::Result::ERROR_DEVICE_LOST => StratusError::DEVICE_LOST,
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => StratusError::OUT_OF_MEMORY,
            vk::Result::ERROR_OUT_OF_HOST_MEMORY => StratusError::OUT_OF_MEMORY,
            _ => StratusError::VALIDATION_FAILED,
        }
    }
}
