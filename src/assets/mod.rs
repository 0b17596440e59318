// The asset system
//
// Every asset type gets a typed dense id, a registry mapping ids to
// device data, and a slice of the one shared asset descriptor set. The
// manager owns the registries, resolves string paths to local ids and
// flushes everything once per frame between the fence wait and command
// recording.

pub mod animation;
pub mod descriptor;
pub mod font;
pub mod geometry;
pub mod material;
pub mod rig;
pub mod serial;
pub mod texture;

pub use animation::{AnimationData, AnimationHandle, AnimationRegistry, Keyframe};
pub use descriptor::{AssetBinding, DescriptorUpdate, SharedDescriptorSet};
pub use font::{FontData, FontHandle, FontRegistry, GlyphMetrics};
pub use geometry::{
    GeometryData, GeometryHandle, GeometryRegistry, MeshVertex, SkeletalVertex,
};
pub use material::{
    MaterialData, MaterialFlags, MaterialHandle, MaterialKey, MaterialRegistry,
    SpecializationEnv,
};
pub use rig::{Bone, RigData, RigHandle, RigRegistry};
pub use serial::Asset;
pub use texture::{TextureData, TextureHandle, TextureRegistry};

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use ash::vk;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::frame_state::FrameRenderState;
use crate::{Result, StratusError};

/// Marker type for geometry assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry;
/// Marker type for texture assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Texture;
/// Marker type for material assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Material;
/// Marker type for rig assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rig;
/// Marker type for animation assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Animation;
/// Marker type for font assets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Font;

/// Ties an asset marker to its data representation and its place in
/// the persisted format.
pub trait AssetType: 'static {
    type Data: Clone + Send + Sync + 'static;

    /// Human readable kind, for logs
    const KIND: &'static str;

    fn wrap(data: Self::Data) -> Asset;
    fn unwrap(asset: Asset) -> Option<Self::Data>;
    fn resolve_path(manager: &AssetManager, path: &str) -> Result<u32>;
}

/// Dense id of an asset within its registry. Stable for the asset's
/// lifetime there.
pub struct AssetId<T> {
    a_id: u32,
    a_marker: PhantomData<fn() -> T>,
}

impl<T> AssetId<T> {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            a_id: id,
            a_marker: PhantomData,
        }
    }

    pub fn raw(&self) -> u32 {
        self.a_id
    }
}

impl<T> Copy for AssetId<T> {}
impl<T> Clone for AssetId<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> PartialEq for AssetId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.a_id == other.a_id
    }
}
impl<T> Eq for AssetId<T> {}
impl<T> std::hash::Hash for AssetId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.a_id.hash(state);
    }
}
impl<T> std::fmt::Debug for AssetId<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AssetId({})", self.a_id)
    }
}

impl<T> Serialize for AssetId<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.a_id)
    }
}

impl<'de, T> Deserialize<'de> for AssetId<T> {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        Ok(AssetId::new(u32::deserialize(deserializer)?))
    }
}

/// Either a resolved local id or a path the manager can resolve into
/// one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum AssetRef<T: AssetType> {
    Id(AssetId<T>),
    Path(String),
}

impl<T: AssetType> AssetRef<T> {
    pub fn resolve(&self, manager: &AssetManager) -> Result<AssetId<T>> {
        match self {
            AssetRef::Id(id) => Ok(*id),
            AssetRef::Path(path) => Ok(AssetId::new(T::resolve_path(manager, path)?)),
        }
    }
}

impl<T: AssetType> From<AssetId<T>> for AssetRef<T> {
    fn from(id: AssetId<T>) -> Self {
        AssetRef::Id(id)
    }
}

/// Supplies the host data of one asset: either in memory, or lazily
/// from a file in the internal format.
pub trait AssetSource<T: AssetType>: Send + Sync {
    fn load(&self) -> Result<T::Data>;

    fn name(&self) -> String {
        "<in memory>".to_string()
    }
}

pub struct InMemorySource<T: AssetType> {
    ims_data: T::Data,
}

impl<T: AssetType> InMemorySource<T> {
    pub fn new(data: T::Data) -> Self {
        Self { ims_data: data }
    }
}

impl<T: AssetType> AssetSource<T> for InMemorySource<T> {
    fn load(&self) -> Result<T::Data> {
        Ok(self.ims_data.clone())
    }
}

/// A file in the internal asset format; re-read on every load.
pub struct FileSource<T: AssetType> {
    fs_path: PathBuf,
    fs_marker: PhantomData<fn() -> T>,
}

impl<T: AssetType> FileSource<T> {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            fs_path: path.into(),
            fs_marker: PhantomData,
        }
    }
}

impl<T: AssetType> AssetSource<T> for FileSource<T> {
    fn load(&self) -> Result<T::Data> {
        let asset = serial::load_asset_file(&self.fs_path)?;
        T::unwrap(asset).ok_or_else(|| {
            log::error!(
                "{} does not contain a {} asset",
                self.fs_path.display(),
                T::KIND
            );
            StratusError::VALIDATION_FAILED
        })
    }

    fn name(&self) -> String {
        self.fs_path.display().to_string()
    }
}

macro_rules! impl_asset_type {
    ($marker:ident, $data:ty, $variant:ident, $kind:expr, $table:ident) => {
        impl AssetType for $marker {
            type Data = $data;
            const KIND: &'static str = $kind;

            fn wrap(data: Self::Data) -> Asset {
                Asset::$variant(data)
            }

            fn unwrap(asset: Asset) -> Option<Self::Data> {
                match asset {
                    Asset::$variant(data) => Some(data),
                    _ => None,
                }
            }

            fn resolve_path(manager: &AssetManager, path: &str) -> Result<u32> {
                let paths = manager.am_paths.lock().unwrap();
                paths
                    .$table
                    .get(path)
                    .copied()
                    .ok_or(StratusError::ASSET_NOT_FOUND)
            }
        }
    };
}

impl_asset_type!(Geometry, geometry::GeometryData, Geometry, "geometry", pt_geometries);
impl_asset_type!(Texture, texture::TextureData, Texture, "texture", pt_textures);
impl_asset_type!(Material, material::MaterialData, Material, "material", pt_materials);
impl_asset_type!(Rig, rig::RigData, Rig, "rig", pt_rigs);
impl_asset_type!(Animation, animation::AnimationData, Animation, "animation", pt_animations);
impl_asset_type!(Font, font::FontData, Font, "font", pt_fonts);

/// Capacities of the shared descriptor arrays.
pub struct AssetManagerCreateInfo {
    pub max_geometries: u32,
    pub max_textures: u32,
    pub max_fonts: u32,
}

impl Default for AssetManagerCreateInfo {
    fn default() -> Self {
        Self {
            max_geometries: 1024,
            max_textures: 1024,
            max_fonts: 16,
        }
    }
}

#[derive(Default)]
struct PathTables {
    pt_geometries: HashMap<String, u32>,
    pt_textures: HashMap<String, u32>,
    pt_materials: HashMap<String, u32>,
    pt_rigs: HashMap<String, u32>,
    pt_animations: HashMap<String, u32>,
    pt_fonts: HashMap<String, u32>,
}

/// Owns all registries and the shared asset descriptor.
pub struct AssetManager {
    am_device: Arc<Device>,
    am_descriptor: SharedDescriptorSet,
    am_geometries: GeometryRegistry,
    am_textures: TextureRegistry,
    am_materials: MaterialRegistry,
    am_rigs: RigRegistry,
    am_animations: AnimationRegistry,
    am_fonts: FontRegistry,
    am_paths: Mutex<PathTables>,
}

impl AssetManager {
    pub fn new(device: Arc<Device>, info: &AssetManagerCreateInfo) -> Result<Self> {
        let geometries = GeometryRegistry::new(device.clone(), info.max_geometries);
        let textures = TextureRegistry::new(device.clone(), info.max_textures);
        let fonts = FontRegistry::new(device.clone(), info.max_fonts);
        let animations = AnimationRegistry::new(device.clone())?;

        // The shared set's schema is the union of what every registry
        // binds
        let mut bindings = geometries.descriptor_layout_bindings();
        bindings.extend(textures.descriptor_layout_bindings());
        bindings.extend(fonts.descriptor_layout_bindings());
        bindings.extend(animations.descriptor_layout_bindings());
        let descriptor = SharedDescriptorSet::new(&device, &bindings)?;

        Ok(Self {
            am_device: device,
            am_descriptor: descriptor,
            am_geometries: geometries,
            am_textures: textures,
            am_materials: MaterialRegistry::new(),
            am_rigs: RigRegistry::new(),
            am_animations: animations,
            am_fonts: fonts,
            am_paths: Mutex::new(PathTables::default()),
        })
    }

    pub fn geometries(&self) -> &GeometryRegistry {
        &self.am_geometries
    }

    pub fn textures(&self) -> &TextureRegistry {
        &self.am_textures
    }

    pub fn materials(&self) -> &MaterialRegistry {
        &self.am_materials
    }

    pub fn rigs(&self) -> &RigRegistry {
        &self.am_rigs
    }

    pub fn animations(&self) -> &AnimationRegistry {
        &self.am_animations
    }

    pub fn fonts(&self) -> &FontRegistry {
        &self.am_fonts
    }

    pub fn descriptor(&self) -> &SharedDescriptorSet {
        &self.am_descriptor
    }

    /// Register a file-backed geometry under its path, so foreign refs
    /// can resolve it later.
    pub fn add_geometry_from_file(&self, path: &str) -> Result<AssetId<Geometry>> {
        let id = self
            .am_geometries
            .add(Box::new(FileSource::<Geometry>::new(path)))?;
        self.am_paths
            .lock()
            .unwrap()
            .pt_geometries
            .insert(path.to_string(), id.raw());
        Ok(id)
    }

    pub fn add_texture_from_file(&self, path: &str) -> Result<AssetId<Texture>> {
        let id = self
            .am_textures
            .add(Box::new(FileSource::<Texture>::new(path)))?;
        self.am_paths
            .lock()
            .unwrap()
            .pt_textures
            .insert(path.to_string(), id.raw());
        Ok(id)
    }

    pub fn add_material_from_file(&self, path: &str) -> Result<AssetId<Material>> {
        let id = self
            .am_materials
            .add(Box::new(FileSource::<Material>::new(path)))?;
        self.am_paths
            .lock()
            .unwrap()
            .pt_materials
            .insert(path.to_string(), id.raw());
        Ok(id)
    }

    pub fn add_rig_from_file(&self, path: &str) -> Result<AssetId<Rig>> {
        let id = self.am_rigs.add(Box::new(FileSource::<Rig>::new(path)))?;
        self.am_paths
            .lock()
            .unwrap()
            .pt_rigs
            .insert(path.to_string(), id.raw());
        Ok(id)
    }

    pub fn add_animation_from_file(&self, path: &str) -> Result<AssetId<Animation>> {
        let data = FileSource::<Animation>::new(path).load()?;
        let id = self.am_animations.add(&data)?;
        self.am_paths
            .lock()
            .unwrap()
            .pt_animations
            .insert(path.to_string(), id.raw());
        Ok(id)
    }

    pub fn add_font_from_file(&self, path: &str) -> Result<AssetId<Font>> {
        let id = self.am_fonts.add(Box::new(FileSource::<Font>::new(path)))?;
        self.am_paths
            .lock()
            .unwrap()
            .pt_fonts
            .insert(path.to_string(), id.raw());
        Ok(id)
    }

    /// Flush pending uploads and acceleration-structure builds of all
    /// registries, then merge their descriptor rewrites into one write
    /// batch for the shared set.
    pub fn update(
        &self,
        cmd: vk::CommandBuffer,
        frame: &Arc<FrameRenderState>,
    ) -> Result<()> {
        self.am_geometries.update(cmd, frame)?;
        self.am_textures.update(cmd, frame)?;
        self.am_materials.update()?;
        self.am_animations.update(frame)?;
        self.am_fonts.update(cmd, frame)?;

        let mut updates = self.am_geometries.descriptor_updates();
        updates.extend(self.am_textures.descriptor_updates());
        updates.extend(self.am_animations.descriptor_updates());
        updates.extend(self.am_fonts.descriptor_updates());
        self.am_descriptor.apply_updates(&self.am_device, &updates);

        Ok(())
    }

    /// Tear down all device resources. Only valid once the device is
    /// idle.
    pub fn destroy(&self) {
        self.am_geometries.destroy();
        self.am_textures.destroy();
        self.am_fonts.destroy();
        self.am_animations.destroy();
        self.am_descriptor.destroy(&self.am_device);
    }
}

impl crate::renderer::FrameUpdater for AssetManager {
    fn frame_update(
        &mut self,
        _dev: &Device,
        cmd: vk::CommandBuffer,
        frame: &Arc<FrameRenderState>,
    ) -> Result<()> {
        AssetManager::update(self, cmd, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn asset_ref_from_id_resolves_without_a_manager_entry() {
        let id: AssetId<Geometry> = AssetId::new(11);
        let r: AssetRef<Geometry> = id.into();
        assert_eq!(r, AssetRef::Id(AssetId::new(11)));
    }

    #[test]
    fn wrap_unwrap_are_inverse() {
        let data = geometry::GeometryData {
            indices: vec![0, 1, 2],
            ..Default::default()
        };
        let unwrapped = Geometry::unwrap(Geometry::wrap(data.clone())).unwrap();
        assert_eq!(unwrapped, data);

        // A mismatched variant unwraps to nothing
        assert!(Texture::unwrap(Geometry::wrap(data)).is_none());
    }
}
