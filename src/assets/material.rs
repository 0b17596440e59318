// The material registry
//
// A material asset is a shader program artifact plus its surface
// settings. At runtime each material resolves, per MaterialKey, to one
// immutable specialization: a pipeline and a push-constant map.
// Specializations are built lazily on first use and cached for the
// material's lifetime.

use std::sync::{Arc, Mutex};

use ash::vk;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::assets::{AssetId, AssetSource, Material};
use crate::device::Device;
use crate::material_runtime::{
    build_drawable_pipeline, DrawablePipelineInfo, MaterialRuntime, PipelineRegistry,
    PushConstantMap, ShaderProgram,
};
use crate::util::{IdPool, IndexMap};
use crate::{Result, StratusError};

bitflags! {
    /// The flag set a material can be specialized over.
    pub struct MaterialFlags: u32 {
        const ANIMATED = 0b1;
    }
}

/// One point in the specialization space. The index derived from the
/// flag combination addresses the specialization cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialKey {
    pub mk_flags: MaterialFlags,
}

impl MaterialKey {
    /// The number of distinct keys.
    pub const COUNT: usize = 2;

    pub fn new(flags: MaterialFlags) -> Self {
        Self { mk_flags: flags }
    }

    pub fn plain() -> Self {
        Self::new(MaterialFlags::empty())
    }

    pub fn animated() -> Self {
        Self::new(MaterialFlags::ANIMATED)
    }

    pub fn is_animated(&self) -> bool {
        self.mk_flags.contains(MaterialFlags::ANIMATED)
    }

    /// Unique dense index of this flag combination.
    pub fn to_index(&self) -> usize {
        self.mk_flags.bits() as usize
    }
}

/// Host-side material content. Transparency is a property of the
/// material itself, not part of the key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MaterialData {
    pub program: ShaderProgram,
    pub transparent: bool,
}

struct MaterialStorage {
    ms_data: Arc<MaterialData>,
    /// One slot per MaterialKey, filled on first use
    ms_runtimes: Vec<Option<MaterialRuntime>>,
}

/// Everything a specialization build needs from the outside world.
pub struct SpecializationEnv<'a> {
    pub device: &'a Device,
    pub pipelines: &'a mut PipelineRegistry,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
    pub extent: vk::Extent2D,
    pub set_layouts: &'a [vk::DescriptorSetLayout],
    pub color_attachment_count: u32,
}

#[derive(Clone)]
pub struct MaterialHandle {
    mh_id: AssetId<Material>,
    mh_data: Arc<MaterialData>,
}

impl MaterialHandle {
    pub fn id(&self) -> AssetId<Material> {
        self.mh_id
    }

    /// The index pushed to shaders to select this material's data.
    pub fn device_index(&self) -> u32 {
        self.mh_id.raw()
    }

    pub fn is_transparent(&self) -> bool {
        self.mh_data.transparent
    }

    pub fn program(&self) -> &ShaderProgram {
        &self.mh_data.program
    }
}

struct RegistryInternal {
    ri_ids: IdPool,
    ri_storage: IndexMap<MaterialStorage>,
}

pub struct MaterialRegistry {
    m_internal: Mutex<RegistryInternal>,
}

impl MaterialRegistry {
    pub fn new() -> Self {
        Self {
            m_internal: Mutex::new(RegistryInternal {
                ri_ids: IdPool::new(),
                ri_storage: IndexMap::new(),
            }),
        }
    }

    /// Register a material. The source is loaded eagerly since the
    /// program data is needed to build any specialization.
    pub fn add(&self, source: Box<dyn AssetSource<Material>>) -> Result<AssetId<Material>> {
        let data = source.load()?;

        let mut internal = self.m_internal.lock().unwrap();
        let id = internal.ri_ids.generate();
        internal.ri_storage.insert(
            id,
            MaterialStorage {
                ms_data: Arc::new(data),
                ms_runtimes: (0..MaterialKey::COUNT).map(|_| None).collect(),
            },
        );
        Ok(AssetId::new(id))
    }

    /// Remove a material. Outstanding handles keep the data itself
    /// alive; pipelines stay in the pipeline registry until torn down
    /// with it.
    pub fn remove(&self, id: AssetId<Material>) -> Result<()> {
        let mut internal = self.m_internal.lock().unwrap();
        if internal.ri_storage.remove(id.raw()).is_none() {
            return Err(StratusError::ASSET_NOT_FOUND);
        }
        internal.ri_ids.free(id.raw());
        Ok(())
    }

    pub fn get(&self, id: AssetId<Material>) -> Result<MaterialHandle> {
        let internal = self.m_internal.lock().unwrap();
        let storage = internal
            .ri_storage
            .get(id.raw())
            .ok_or(StratusError::ASSET_NOT_FOUND)?;
        Ok(MaterialHandle {
            mh_id: id,
            mh_data: storage.ms_data.clone(),
        })
    }

    /// The specialization of `id` for `key`, building pipeline and
    /// push-constant map on first use. Immutable once built.
    pub fn get_specialization(
        &self,
        id: AssetId<Material>,
        key: MaterialKey,
        env: &mut SpecializationEnv,
    ) -> Result<MaterialRuntime> {
        let mut internal = self.m_internal.lock().unwrap();
        let storage = internal
            .ri_storage
            .get_mut(id.raw())
            .ok_or(StratusError::ASSET_NOT_FOUND)?;

        if let Some(runtime) = storage.ms_runtimes[key.to_index()].as_ref() {
            return Ok(runtime.clone());
        }

        let entry = build_drawable_pipeline(
            env.device,
            &storage.ms_data.program,
            &DrawablePipelineInfo {
                render_pass: env.render_pass,
                subpass: env.subpass,
                extent: env.extent,
                transparent: storage.ms_data.transparent,
                animated: key.is_animated(),
                set_layouts: env.set_layouts,
                color_attachment_count: env.color_attachment_count,
            },
        )?;
        let pipeline = env.pipelines.register(entry);

        let runtime = MaterialRuntime {
            mr_pipeline: pipeline,
            mr_push_constants: Arc::new(PushConstantMap::from_program(&storage.ms_data.program)),
        };
        storage.ms_runtimes[key.to_index()] = Some(runtime.clone());
        Ok(runtime)
    }

    /// Nothing to flush: material data is host resident and pipelines
    /// are immutable.
    pub fn update(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::InMemorySource;

    #[test]
    fn key_indices_are_dense_and_unique() {
        assert_eq!(MaterialKey::plain().to_index(), 0);
        assert_eq!(MaterialKey::animated().to_index(), 1);
        assert!(MaterialKey::animated().is_animated());
        assert!(!MaterialKey::plain().is_animated());
    }

    #[test]
    fn add_get_remove() {
        let registry = MaterialRegistry::new();

        let id = registry
            .add(Box::new(InMemorySource::new(MaterialData {
                program: ShaderProgram::default(),
                transparent: true,
            })))
            .unwrap();

        let handle = registry.get(id).unwrap();
        assert!(handle.is_transparent());
        assert_eq!(handle.device_index(), id.raw());

        registry.remove(id).unwrap();
        assert_eq!(registry.get(id).err(), Some(StratusError::ASSET_NOT_FOUND));
        // The handle still reads its data after removal
        assert!(handle.is_transparent());
    }
}
