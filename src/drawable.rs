// The drawable component scene
//
// A drawable is an id into a sparse component store. The possible
// components: Raster (draw-call registrations at the scene base), Ray
// (an acceleration-structure instance slot), Animation (a playback
// engine feeding push constants), and Node (a transform in the scene
// graph). Component cleanup rides on drop: destroying a drawable
// revokes its draw registrations, frees its ray instance and removes
// its node without the scene knowing who created them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ash::vk;
use cgmath::Matrix4;
use cirrus as cs;

use crate::assets::{
    AnimationHandle, AnimationRegistry, AssetId, AssetManager, Geometry, GeometryHandle,
    Material, MaterialHandle, RigHandle,
};
use crate::device::Device;
use crate::material_runtime::{
    MaterialRuntime, PipelineRegistry, PC_ANIMATION_INDEX, PC_KEYFRAMES, PC_KEYFRAME_WEIGHT,
    PC_MATERIAL_INDEX, PC_MODEL_MATRIX,
};
use crate::node::{NodeArena, NodeId};
use crate::ray::{RayInstanceData, RaySceneModule};
use crate::scene::{SceneBase, SubPassId, UniqueRegistrationId};
use crate::graph::StageId;
use crate::{Result, StratusError};

/// Sentinel pushed when a drawable has no animation.
pub const NO_ANIMATION: u32 = u32::MAX;

/// Identifies one drawable in a `DrawableScene`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DrawableId(usize);

/// The values the deferred vertex stage reads for animated drawables.
#[derive(Debug, Clone, Copy)]
pub struct AnimationPushState {
    pub animation: u32,
    pub keyframes: [u32; 2],
    pub keyframe_weight: f32,
}

impl Default for AnimationPushState {
    fn default() -> Self {
        Self {
            animation: NO_ANIMATION,
            keyframes: [0, 0],
            keyframe_weight: 0.0,
        }
    }
}

/// Advances one drawable's animation and publishes the interpolation
/// state for the draw functions to push.
pub struct AnimationEngine {
    ae_rig: RigHandle,
    ae_current: Option<AnimationHandle>,
    ae_frames: (u32, u32),
    ae_time_ms: f32,
    ae_state: Arc<Mutex<AnimationPushState>>,
}

impl AnimationEngine {
    pub fn new(rig: RigHandle) -> Self {
        Self {
            ae_rig: rig,
            ae_current: None,
            ae_frames: (0, 1),
            ae_time_ms: 0.0,
            ae_state: Arc::new(Mutex::new(AnimationPushState::default())),
        }
    }

    pub fn rig(&self) -> &RigHandle {
        &self.ae_rig
    }

    /// Start playing `animation` from its first keyframe.
    pub fn play(&mut self, animation: AnimationHandle) {
        self.ae_frames = (0, 1 % animation.frame_count().max(1));
        self.ae_time_ms = 0.0;
        self.ae_current = Some(animation);
    }

    /// Play the rig's nth authored animation.
    pub fn play_rig_animation(
        &mut self,
        index: usize,
        animations: &AnimationRegistry,
    ) -> Result<()> {
        let id = self
            .ae_rig
            .animation(index)
            .ok_or(StratusError::ASSET_NOT_FOUND)?;
        self.play(animations.get(id)?);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.ae_current = None;
        *self.ae_state.lock().unwrap() = AnimationPushState::default();
    }

    /// Advance playback by `dt_ms` milliseconds and refresh the
    /// published state.
    pub fn update(&mut self, dt_ms: f32) {
        let animation = match self.ae_current {
            Some(a) => a,
            None => {
                *self.ae_state.lock().unwrap() = AnimationPushState::default();
                return;
            }
        };

        let frame_time = animation.frame_time_ms();
        let frame_count = animation.frame_count().max(1);
        assert!(frame_time > 0.0);

        self.ae_time_ms += dt_ms;
        while self.ae_time_ms >= frame_time {
            self.ae_time_ms -= frame_time;
            self.ae_frames.0 = (self.ae_frames.0 + 1) % frame_count;
            self.ae_frames.1 = (self.ae_frames.1 + 1) % frame_count;
        }

        *self.ae_state.lock().unwrap() = AnimationPushState {
            animation: animation.buffer_index(),
            keyframes: [self.ae_frames.0, self.ae_frames.1],
            keyframe_weight: self.ae_time_ms / frame_time,
        };
    }

    pub fn current_frames(&self) -> (u32, u32) {
        self.ae_frames
    }

    pub fn state(&self) -> AnimationPushState {
        *self.ae_state.lock().unwrap()
    }

    fn shared_state(&self) -> Arc<Mutex<AnimationPushState>> {
        self.ae_state.clone()
    }
}

/// The data a raster draw function reads at record time. Owned by the
/// component; the registrations only borrow it through an Arc.
struct RasterDrawData {
    rd_geometry: GeometryHandle,
    rd_material: MaterialHandle,
    rd_node: Option<NodeId>,
    rd_anim_state: Arc<Mutex<AnimationPushState>>,
}

struct RasterComponent {
    #[allow(dead_code)]
    rc_draw_data: Arc<RasterDrawData>,
    /// Dropping these unregisters the draw functions
    #[allow(dead_code)]
    rc_registrations: Vec<UniqueRegistrationId>,
}

struct RayComponent {
    /// Keeps the geometry (and through it the BLAS) resident
    #[allow(dead_code)]
    ry_geometry: GeometryHandle,
    ry_instance: u32,
    ry_module: Arc<Mutex<RaySceneModule>>,
}

impl Drop for RayComponent {
    fn drop(&mut self) {
        self.ry_module
            .lock()
            .unwrap()
            .free_ray_instance(self.ry_instance);
    }
}

struct AnimationComponent {
    ac_engine: AnimationEngine,
}

struct NodeComponent {
    nc_node: NodeId,
    nc_arena: Arc<Mutex<NodeArena>>,
}

impl Drop for NodeComponent {
    fn drop(&mut self) {
        self.nc_arena.lock().unwrap().destroy_node(self.nc_node);
    }
}

/// One draw-call registration requested for a raster component.
pub struct DrawRegistration {
    pub stage: StageId,
    pub subpass: SubPassId,
    pub runtime: MaterialRuntime,
}

pub struct RasterComponentCreateInfo {
    pub geometry: GeometryHandle,
    pub material: MaterialHandle,
    pub node: Option<NodeId>,
    pub registrations: Vec<DrawRegistration>,
}

pub struct RayComponentCreateInfo {
    pub geometry: AssetId<Geometry>,
    pub material: AssetId<Material>,
}

pub struct DrawableScene {
    ds_device: Arc<Device>,
    ds_ecs: Mutex<cs::Instance>,
    ds_scene: SceneBase,
    ds_raster: cs::Component<RasterComponent>,
    ds_ray: cs::Component<RayComponent>,
    ds_anim: cs::Component<AnimationComponent>,
    ds_node: cs::Component<NodeComponent>,
    ds_nodes: Arc<Mutex<NodeArena>>,
    ds_ray_module: Arc<Mutex<RaySceneModule>>,
    /// Owns the entities; dropping one cleans its components up
    ds_entities: Mutex<HashMap<usize, cs::Entity>>,
}

impl DrawableScene {
    pub fn new(device: Arc<Device>, scene: SceneBase) -> Self {
        let mut ecs = cs::Instance::new();
        let raster = ecs.add_component();
        let ray = ecs.add_component();
        let anim = ecs.add_component();
        let node = ecs.add_component();

        Self {
            ds_device: device,
            ds_ecs: Mutex::new(ecs),
            ds_scene: scene,
            ds_raster: raster,
            ds_ray: ray,
            ds_anim: anim,
            ds_node: node,
            ds_nodes: Arc::new(Mutex::new(NodeArena::new())),
            ds_ray_module: Arc::new(Mutex::new(RaySceneModule::new())),
            ds_entities: Mutex::new(HashMap::new()),
        }
    }

    pub fn scene_base(&self) -> &SceneBase {
        &self.ds_scene
    }

    pub fn nodes(&self) -> Arc<Mutex<NodeArena>> {
        self.ds_nodes.clone()
    }

    pub fn ray_module(&self) -> Arc<Mutex<RaySceneModule>> {
        self.ds_ray_module.clone()
    }

    pub fn make_drawable(&self) -> DrawableId {
        let entity = self.ds_ecs.lock().unwrap().add_entity();
        let id = entity.get_raw_id();
        self.ds_entities.lock().unwrap().insert(id, entity);
        DrawableId(id)
    }

    /// Destroy a drawable and all of its components. Draw
    /// registrations are revoked, ray instances freed, nodes removed.
    pub fn destroy_drawable(&self, drawable: DrawableId) {
        // Take the entity out under the lock, drop it after: the
        // component cleanup cascade takes other locks
        let entity = self.ds_entities.lock().unwrap().remove(&drawable.0);
        drop(entity);
    }

    fn entity(&self, drawable: DrawableId) -> Result<cs::Entity> {
        self.ds_entities
            .lock()
            .unwrap()
            .get(&drawable.0)
            .cloned()
            .ok_or(StratusError::ASSET_NOT_FOUND)
    }

    /// Attach draw-call registrations for a drawable. One registration
    /// is made per requested (stage, subpass, pipeline); the recorded
    /// draw binds the geometry, pushes the per-drawable constants and
    /// issues the indexed draw.
    pub fn make_rasterization(
        &self,
        drawable: DrawableId,
        info: RasterComponentCreateInfo,
        pipelines: &PipelineRegistry,
    ) -> Result<()> {
        let entity = self.entity(drawable)?;

        // Share the animation state if the drawable already animates
        let anim_state = match self.ds_anim.get(&entity) {
            Some(anim) => anim.ac_engine.shared_state(),
            None => Arc::new(Mutex::new(AnimationPushState::default())),
        };

        let draw_data = Arc::new(RasterDrawData {
            rd_geometry: info.geometry,
            rd_material: info.material,
            rd_node: info.node,
            rd_anim_state: anim_state,
        });

        let mut registrations = Vec::with_capacity(info.registrations.len());
        for reg in info.registrations.into_iter() {
            let layout = pipelines
                .get(reg.runtime.mr_pipeline)
                .ok_or(StratusError::ASSET_NOT_FOUND)?
                .pe_layout;

            let data = draw_data.clone();
            let device = self.ds_device.clone();
            let nodes = self.ds_nodes.clone();
            let push_constants = reg.runtime.mr_push_constants.clone();

            registrations.push(self.ds_scene.register_unique(
                reg.stage,
                reg.subpass,
                reg.runtime.mr_pipeline,
                Box::new(move |_env, cmd: vk::CommandBuffer| {
                    let model: [[f32; 4]; 4] = match data.rd_node {
                        Some(node) => nodes.lock().unwrap().world_matrix(node).into(),
                        None => Matrix4::from_scale(1.0).into(),
                    };
                    push_constants.push(&device, cmd, layout, PC_MODEL_MATRIX, &model);
                    push_constants.push(
                        &device,
                        cmd,
                        layout,
                        PC_MATERIAL_INDEX,
                        &data.rd_material.device_index(),
                    );

                    let anim = *data.rd_anim_state.lock().unwrap();
                    push_constants.push(&device, cmd, layout, PC_ANIMATION_INDEX, &anim.animation);
                    push_constants.push(&device, cmd, layout, PC_KEYFRAMES, &anim.keyframes);
                    push_constants.push(
                        &device,
                        cmd,
                        layout,
                        PC_KEYFRAME_WEIGHT,
                        &anim.keyframe_weight,
                    );

                    data.rd_geometry.bind(&device, cmd);
                    unsafe {
                        device.vk_device().cmd_draw_indexed(
                            cmd,
                            data.rd_geometry.num_indices(),
                            1,
                            0,
                            0,
                            0,
                        );
                    }
                }),
            ));
        }

        self.ds_raster.set(
            &entity,
            RasterComponent {
                rc_draw_data: draw_data,
                rc_registrations: registrations,
            },
        );
        Ok(())
    }

    /// Give a drawable a ray-tracing presence: ensure its geometry has
    /// an acceleration structure (requesting a build if absent) and
    /// allocate an instance slot.
    pub fn make_raytracing(
        &self,
        drawable: DrawableId,
        info: RayComponentCreateInfo,
        assets: &AssetManager,
    ) -> Result<()> {
        let entity = self.entity(drawable)?;

        let blas = assets
            .geometries()
            .ensure_acceleration_structure(info.geometry)?;
        let geometry = assets.geometries().get(info.geometry)?;

        let instance = self.ds_ray_module.lock().unwrap().allocate_ray_instance(
            RayInstanceData {
                geometry_index: geometry.device_index(),
                material_index: info.material.raw(),
            },
            0xff,
            0,
            vk::GeometryInstanceFlagsKHR::FORCE_OPAQUE
                | vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE,
            blas,
        );

        self.ds_ray.set(
            &entity,
            RayComponent {
                ry_geometry: geometry,
                ry_instance: instance,
                ry_module: self.ds_ray_module.clone(),
            },
        );
        Ok(())
    }

    pub fn make_animation_engine(&self, drawable: DrawableId, rig: RigHandle) -> Result<()> {
        let entity = self.entity(drawable)?;
        self.ds_anim.set(
            &entity,
            AnimationComponent {
                ac_engine: AnimationEngine::new(rig),
            },
        );
        Ok(())
    }

    pub fn make_node(&self, drawable: DrawableId) -> Result<NodeId> {
        let entity = self.entity(drawable)?;
        let node = self.ds_nodes.lock().unwrap().make_node();
        self.ds_node.set(
            &entity,
            NodeComponent {
                nc_node: node,
                nc_arena: self.ds_nodes.clone(),
            },
        );
        Ok(node)
    }

    pub fn has_rasterization(&self, drawable: DrawableId) -> bool {
        self.entity(drawable)
            .map(|e| self.ds_raster.has(&e))
            .unwrap_or(false)
    }

    pub fn has_raytracing(&self, drawable: DrawableId) -> bool {
        self.entity(drawable)
            .map(|e| self.ds_ray.has(&e))
            .unwrap_or(false)
    }

    pub fn node(&self, drawable: DrawableId) -> Option<NodeId> {
        let entity = self.entity(drawable).ok()?;
        self.ds_node.get(&entity).map(|c| c.nc_node)
    }

    /// Run a closure against a drawable's animation engine.
    pub fn with_animation_engine<R, F: FnOnce(&mut AnimationEngine) -> R>(
        &self,
        drawable: DrawableId,
        func: F,
    ) -> Result<R> {
        let entity = self.entity(drawable)?;
        let mut anim = self
            .ds_anim
            .get_mut(&entity)
            .ok_or(StratusError::ASSET_NOT_FOUND)?;
        Ok(func(&mut anim.ac_engine))
    }

    /// Advance every animation component by `dt_ms` and refresh the
    /// node world matrices.
    pub fn update(&self, dt_ms: f32) {
        self.ds_anim.for_each_mut(|_, anim| {
            anim.ac_engine.update(dt_ms);
        });
        self.ds_nodes.lock().unwrap().update_world_matrices();
    }

    pub fn num_ray_instances(&self) -> u32 {
        self.ds_ray_module.lock().unwrap().num_instances()
    }

    /// Pack the current ray instances for a TLAS build.
    pub fn write_tlas_instances(
        &self,
        out: &mut [vk::AccelerationStructureInstanceKHR],
    ) -> u32 {
        self.ds_ray_module.lock().unwrap().write_tlas_instances(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{InMemorySource, RigData, RigRegistry, Bone};
    use cgmath::SquareMatrix;

    fn test_rig() -> RigHandle {
        let registry = RigRegistry::new();
        let id = registry
            .add(Box::new(InMemorySource::new(RigData {
                bones: vec![Bone {
                    name: "root".to_string(),
                    inverse_bind_pose: Matrix4::identity(),
                    parent: None,
                }],
                animations: Vec::new(),
            })))
            .unwrap();
        registry.get(id).unwrap()
    }

    fn two_frame_animation() -> AnimationHandle {
        AnimationHandle::from_raw(0, 2, 100.0)
    }

    #[test]
    fn animation_advances_with_weight() {
        let mut engine = AnimationEngine::new(test_rig());
        engine.play(two_frame_animation());

        engine.update(50.0);
        assert_eq!(engine.current_frames(), (0, 1));
        let state = engine.state();
        assert_eq!(state.keyframes, [0, 1]);
        assert!((state.keyframe_weight - 0.5).abs() < 1e-5);

        // 110ms total: one frame advances and 10ms spill over
        engine.update(60.0);
        assert_eq!(engine.current_frames(), (1, 0));
        let state = engine.state();
        assert_eq!(state.keyframes, [1, 0]);
        assert!((state.keyframe_weight - 0.1).abs() < 1e-5);
    }

    #[test]
    fn stopped_engine_publishes_no_animation() {
        let mut engine = AnimationEngine::new(test_rig());
        engine.play(two_frame_animation());
        engine.update(10.0);
        assert_ne!(engine.state().animation, NO_ANIMATION);

        engine.stop();
        assert_eq!(engine.state().animation, NO_ANIMATION);

        engine.update(10.0);
        assert_eq!(engine.state().animation, NO_ANIMATION);
    }
}
