// The rig registry
//
// A rig is a bone hierarchy plus the list of animations authored for
// it. Rig data is host resident; the GPU only ever sees the bone
// matrices that animations bake per keyframe.

use std::sync::{Arc, Mutex};

use cgmath::Matrix4;
use serde::{Deserialize, Serialize};

use crate::assets::{Animation, AssetId, AssetSource, Rig};
use crate::util::{IdPool, IndexMap};
use crate::{Result, StratusError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bone {
    pub name: String,
    pub inverse_bind_pose: Matrix4<f32>,
    /// Index of the parent bone, root bones have none
    pub parent: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RigData {
    pub bones: Vec<Bone>,
    /// Animations playable on this rig, in authoring order
    #[serde(bound = "")]
    pub animations: Vec<AssetId<Animation>>,
}

#[derive(Clone)]
pub struct RigHandle {
    rh_data: Arc<RigData>,
}

impl RigHandle {
    pub fn bone_count(&self) -> usize {
        self.rh_data.bones.len()
    }

    pub fn bones(&self) -> &[Bone] {
        &self.rh_data.bones
    }

    /// The nth animation authored for this rig.
    pub fn animation(&self, index: usize) -> Option<AssetId<Animation>> {
        self.rh_data.animations.get(index).copied()
    }

    pub fn animation_count(&self) -> usize {
        self.rh_data.animations.len()
    }
}

struct RegistryInternal {
    ri_ids: IdPool,
    ri_storage: IndexMap<Arc<RigData>>,
}

pub struct RigRegistry {
    r_internal: Mutex<RegistryInternal>,
}

impl RigRegistry {
    pub fn new() -> Self {
        Self {
            r_internal: Mutex::new(RegistryInternal {
                ri_ids: IdPool::new(),
                ri_storage: IndexMap::new(),
            }),
        }
    }

    pub fn add(&self, source: Box<dyn AssetSource<Rig>>) -> Result<AssetId<Rig>> {
        let data = source.load()?;
        if data.bones.is_empty() {
            return Err(StratusError::VALIDATION_FAILED);
        }

        let mut internal = self.r_internal.lock().unwrap();
        let id = internal.ri_ids.generate();
        internal.ri_storage.insert(id, Arc::new(data));
        Ok(AssetId::new(id))
    }

    pub fn remove(&self, id: AssetId<Rig>) -> Result<()> {
        let mut internal = self.r_internal.lock().unwrap();
        if internal.ri_storage.remove(id.raw()).is_none() {
            return Err(StratusError::ASSET_NOT_FOUND);
        }
        internal.ri_ids.free(id.raw());
        Ok(())
    }

    pub fn get(&self, id: AssetId<Rig>) -> Result<RigHandle> {
        let internal = self.r_internal.lock().unwrap();
        let data = internal
            .ri_storage
            .get(id.raw())
            .ok_or(StratusError::ASSET_NOT_FOUND)?;
        Ok(RigHandle {
            rh_data: data.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::InMemorySource;
    use cgmath::SquareMatrix;

    fn rig_with_bones(n: usize) -> RigData {
        RigData {
            bones: (0..n)
                .map(|i| Bone {
                    name: format!("bone{}", i),
                    inverse_bind_pose: Matrix4::identity(),
                    parent: if i == 0 { None } else { Some(i as u32 - 1) },
                })
                .collect(),
            animations: vec![AssetId::new(3), AssetId::new(8)],
        }
    }

    #[test]
    fn add_and_lookup() {
        let registry = RigRegistry::new();
        let id = registry
            .add(Box::new(InMemorySource::new(rig_with_bones(4))))
            .unwrap();

        let handle = registry.get(id).unwrap();
        assert_eq!(handle.bone_count(), 4);
        assert_eq!(handle.animation(1).map(|a| a.raw()), Some(8));
        assert!(handle.animation(2).is_none());
    }

    #[test]
    fn empty_rig_is_rejected() {
        let registry = RigRegistry::new();
        let result = registry.add(Box::new(InMemorySource::new(RigData::default())));
        assert_eq!(result.err(), Some(StratusError::VALIDATION_FAILED));
    }
}
