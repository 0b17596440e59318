// Scene draw-call registrations
//
// A scene is, at this level, a table of draw functions keyed by
// (stage, subpass, pipeline). Keying by pipeline first groups all draw
// calls that share a pipeline so the recorder binds each pipeline once
// per subpass. Registrations are revoked through a token: dropping the
// token removes the entry, the scene never points back at whoever
// registered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use ash::vk;

use crate::graph::{PassId, StageId};
use crate::material_runtime::PipelineId;

pub type SubPassId = u32;

/// What the recorder is currently executing, passed to each draw
/// function alongside the command buffer.
pub struct DrawEnvironment {
    pub de_stage: StageId,
    pub de_pass: PassId,
    pub de_subpass: SubPassId,
    pub de_pipeline: PipelineId,
}

pub type DrawFn = Box<dyn Fn(&DrawEnvironment, vk::CommandBuffer) + Send + Sync>;

/// Where a registration currently lives. The vec index is patched when
/// another registration is swap-removed past it.
struct RegIndex {
    rx_stage: StageId,
    rx_subpass: SubPassId,
    rx_pipeline: PipelineId,
    rx_vec_index: usize,
}

struct Registration {
    r_index: Arc<Mutex<RegIndex>>,
    r_func: DrawFn,
}

/// Identifies one registration. The size of a pointer.
#[derive(Clone)]
pub struct RegistrationId {
    ri_index: Arc<Mutex<RegIndex>>,
}

/// A registration token that revokes itself when dropped.
pub struct UniqueRegistrationId {
    ur_scene: Weak<RwLock<SceneInternal>>,
    ur_id: Option<RegistrationId>,
}

impl Drop for UniqueRegistrationId {
    fn drop(&mut self) {
        if let (Some(scene), Some(id)) = (self.ur_scene.upgrade(), self.ur_id.take()) {
            SceneBase::unregister_in(&scene, &id);
        }
    }
}

struct SceneInternal {
    /// (stage, subpass, pipeline) -> draw functions
    si_regs: HashMap<(StageId, SubPassId, PipelineId), Vec<Registration>>,
    /// Unique pipelines per (stage, subpass), in first-registration order
    si_pipelines: HashMap<(StageId, SubPassId), Vec<PipelineId>>,
}

/// Shared handle to one scene's registration table.
#[derive(Clone)]
pub struct SceneBase {
    sb_internal: Arc<RwLock<SceneInternal>>,
}

impl SceneBase {
    pub fn new() -> Self {
        Self {
            sb_internal: Arc::new(RwLock::new(SceneInternal {
                si_regs: HashMap::new(),
                si_pipelines: HashMap::new(),
            })),
        }
    }

    /// Register a draw function. The returned id stays valid until
    /// `unregister` is called with it.
    pub fn register(
        &self,
        stage: StageId,
        subpass: SubPassId,
        pipeline: PipelineId,
        func: DrawFn,
    ) -> RegistrationId {
        let mut internal = self.sb_internal.write().unwrap();

        let regs = internal
            .si_regs
            .entry((stage, subpass, pipeline))
            .or_insert_with(Vec::new);
        let index = Arc::new(Mutex::new(RegIndex {
            rx_stage: stage,
            rx_subpass: subpass,
            rx_pipeline: pipeline,
            rx_vec_index: regs.len(),
        }));
        regs.push(Registration {
            r_index: index.clone(),
            r_func: func,
        });

        let pipelines = internal
            .si_pipelines
            .entry((stage, subpass))
            .or_insert_with(Vec::new);
        if !pipelines.contains(&pipeline) {
            pipelines.push(pipeline);
        }

        RegistrationId { ri_index: index }
    }

    /// Like `register`, but the registration is revoked when the token
    /// is dropped.
    pub fn register_unique(
        &self,
        stage: StageId,
        subpass: SubPassId,
        pipeline: PipelineId,
        func: DrawFn,
    ) -> UniqueRegistrationId {
        let id = self.register(stage, subpass, pipeline, func);
        UniqueRegistrationId {
            ur_scene: Arc::downgrade(&self.sb_internal),
            ur_id: Some(id),
        }
    }

    pub fn unregister(&self, id: &RegistrationId) {
        Self::unregister_in(&self.sb_internal, id);
    }

    fn unregister_in(internal: &RwLock<SceneInternal>, id: &RegistrationId) {
        let mut scene = internal.write().unwrap();

        let (key, vec_index) = {
            let index = id.ri_index.lock().unwrap();
            (
                (index.rx_stage, index.rx_subpass, index.rx_pipeline),
                index.rx_vec_index,
            )
        };

        let emptied = {
            let regs = match scene.si_regs.get_mut(&key) {
                Some(r) => r,
                None => return,
            };
            regs.swap_remove(vec_index);
            // The registration that got swapped into our place needs
            // its index patched
            if let Some(moved) = regs.get(vec_index) {
                moved.r_index.lock().unwrap().rx_vec_index = vec_index;
            }
            regs.is_empty()
        };

        if emptied {
            scene.si_regs.remove(&key);
            if let Some(pipelines) = scene.si_pipelines.get_mut(&(key.0, key.1)) {
                pipelines.retain(|&p| p != key.2);
            }
        }
    }

    /// The pipelines that have registrations in a subpass, in
    /// first-registration order.
    pub fn pipelines(&self, stage: StageId, subpass: SubPassId) -> Vec<PipelineId> {
        let internal = self.sb_internal.read().unwrap();
        internal
            .si_pipelines
            .get(&(stage, subpass))
            .cloned()
            .unwrap_or_default()
    }

    /// Invoke every draw function registered for (stage, subpass,
    /// pipeline), in registration order.
    pub fn invoke_draw_functions(
        &self,
        stage: StageId,
        pass: PassId,
        subpass: SubPassId,
        pipeline: PipelineId,
        cmd: vk::CommandBuffer,
    ) {
        let env = DrawEnvironment {
            de_stage: stage,
            de_pass: pass,
            de_subpass: subpass,
            de_pipeline: pipeline,
        };

        let internal = self.sb_internal.read().unwrap();
        if let Some(regs) = internal.si_regs.get(&(stage, subpass, pipeline)) {
            for reg in regs.iter() {
                (reg.r_func)(&env, cmd);
            }
        }
    }

    /// Total number of registrations, across all keys.
    pub fn num_registrations(&self) -> usize {
        let internal = self.sb_internal.read().unwrap();
        internal.si_regs.values().map(|v| v.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const STAGE: StageId = StageId(0);
    const PASS: PassId = PassId(0);

    fn tracer(log: &Arc<Mutex<Vec<u32>>>, tag: u32) -> DrawFn {
        let log = log.clone();
        Box::new(move |_, _| log.lock().unwrap().push(tag))
    }

    #[test]
    fn draws_group_by_pipeline() {
        let scene = SceneBase::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        // Interleave registrations across two pipelines
        scene.register(STAGE, 0, PipelineId(7), tracer(&log, 70));
        scene.register(STAGE, 0, PipelineId(3), tracer(&log, 30));
        scene.register(STAGE, 0, PipelineId(7), tracer(&log, 71));
        scene.register(STAGE, 0, PipelineId(3), tracer(&log, 31));

        // Pipelines come back in first-registration order so the
        // recorder can bind each exactly once
        let pipelines = scene.pipelines(STAGE, 0);
        assert_eq!(pipelines, vec![PipelineId(7), PipelineId(3)]);

        for p in pipelines {
            scene.invoke_draw_functions(STAGE, PASS, 0, p, vk::CommandBuffer::null());
        }
        assert_eq!(*log.lock().unwrap(), vec![70, 71, 30, 31]);
    }

    #[test]
    fn unregister_patches_swapped_index() {
        let scene = SceneBase::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let _a = scene.register(STAGE, 0, PipelineId(1), tracer(&log, 0));
        let b = scene.register(STAGE, 0, PipelineId(1), tracer(&log, 1));
        let c = scene.register(STAGE, 0, PipelineId(1), tracer(&log, 2));

        // Removing the middle registration swaps the last one into its
        // place; removing that one afterwards must still work
        scene.unregister(&b);
        scene.unregister(&c);

        scene.invoke_draw_functions(STAGE, PASS, 0, PipelineId(1), vk::CommandBuffer::null());
        assert_eq!(*log.lock().unwrap(), vec![0]);
        assert_eq!(scene.num_registrations(), 1);
    }

    #[test]
    fn token_drop_revokes() {
        let scene = SceneBase::new();
        let calls = Arc::new(AtomicUsize::new(0));

        {
            let c = calls.clone();
            let _token = scene.register_unique(
                STAGE,
                0,
                PipelineId(0),
                Box::new(move |_, _| {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            );
            scene.invoke_draw_functions(STAGE, PASS, 0, PipelineId(0), vk::CommandBuffer::null());
        }

        // Token dropped: the registration and its pipeline entry are gone
        scene.invoke_draw_functions(STAGE, PASS, 0, PipelineId(0), vk::CommandBuffer::null());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(scene.pipelines(STAGE, 0).is_empty());
    }

    #[test]
    fn subpasses_are_independent() {
        let scene = SceneBase::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        scene.register(STAGE, 0, PipelineId(1), tracer(&log, 100));
        scene.register(STAGE, 1, PipelineId(1), tracer(&log, 200));

        scene.invoke_draw_functions(STAGE, PASS, 1, PipelineId(1), vk::CommandBuffer::null());
        assert_eq!(*log.lock().unwrap(), vec![200]);
    }
}
