// The persisted asset format
//
// Every asset type serializes through one framed `Asset` sum type, so a
// file identifies what it holds without external context. Material
// programs are stored as their SPIR-V words plus the reflected
// specialization-constant and push-constant side tables, exactly as the
// runtime consumes them.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::assets::animation::AnimationData;
use crate::assets::font::FontData;
use crate::assets::geometry::GeometryData;
use crate::assets::material::MaterialData;
use crate::assets::rig::RigData;
use crate::assets::texture::TextureData;
use crate::{Result, StratusError};

/// Top-level frame of the internal asset format. One variant per asset
/// type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Asset {
    Geometry(GeometryData),
    Texture(TextureData),
    Material(MaterialData),
    Rig(RigData),
    Animation(AnimationData),
    Font(FontData),
}

pub fn save_asset<W: Write>(writer: W, asset: &Asset) -> Result<()> {
    bincode::serialize_into(writer, asset).map_err(|e| {
        log::error!("failed to serialize asset: {}", e);
        StratusError::VALIDATION_FAILED
    })
}

pub fn load_asset<R: Read>(reader: R) -> Result<Asset> {
    bincode::deserialize_from(reader).map_err(|e| {
        log::error!("failed to deserialize asset: {}", e);
        StratusError::VALIDATION_FAILED
    })
}

pub fn save_asset_file<P: AsRef<Path>>(path: P, asset: &Asset) -> Result<()> {
    let file = File::create(path.as_ref()).map_err(|e| {
        log::error!("could not create {}: {}", path.as_ref().display(), e);
        StratusError::ASSET_NOT_FOUND
    })?;
    save_asset(BufWriter::new(file), asset)
}

pub fn load_asset_file<P: AsRef<Path>>(path: P) -> Result<Asset> {
    let file = File::open(path.as_ref()).map_err(|e| {
        log::error!("could not open {}: {}", path.as_ref().display(), e);
        StratusError::ASSET_NOT_FOUND
    })?;
    load_asset(BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::font::GlyphMetrics;
    use crate::assets::geometry::MeshVertex;
    use crate::assets::rig::Bone;
    use crate::assets::AssetId;
    use crate::material_runtime::{ShaderProgram, ShaderStageBlob, SpecConstant};
    use cgmath::{Matrix4, SquareMatrix};

    fn roundtrip(asset: Asset) -> Asset {
        let mut bytes = Vec::new();
        save_asset(&mut bytes, &asset).unwrap();
        load_asset(&bytes[..]).unwrap()
    }

    #[test]
    fn geometry_roundtrips() {
        let asset = Asset::Geometry(GeometryData {
            indices: vec![0, 1, 2],
            vertices: vec![MeshVertex {
                position: [0.5, -0.5, 1.0],
                normal: [0.0, 1.0, 0.0],
                uv: [0.25, 0.75],
                tangent: [1.0, 0.0, 0.0],
            }],
            skeletal_vertices: Vec::new(),
            rig: Some(AssetId::new(7)),
        });
        assert_eq!(roundtrip(asset.clone()), asset);
    }

    #[test]
    fn texture_roundtrips() {
        let asset = Asset::Texture(TextureData {
            width: 2,
            height: 1,
            pixels: vec![255, 0, 0, 255, 0, 255, 0, 255],
        });
        assert_eq!(roundtrip(asset.clone()), asset);
    }

    #[test]
    fn material_roundtrips_with_program_side_tables() {
        let asset = Asset::Material(MaterialData {
            program: ShaderProgram {
                stages: vec![ShaderStageBlob {
                    stage: ash::vk::ShaderStageFlags::VERTEX.as_raw(),
                    spirv: vec![0x0723_0203, 42, 7],
                    entry: "main".to_string(),
                }],
                push_constants: ShaderProgram::deferred_vertex_push_constants(),
                spec_constants: vec![SpecConstant {
                    constant_id: 0,
                    value: 3,
                }],
            },
            transparent: true,
        });
        assert_eq!(roundtrip(asset.clone()), asset);
    }

    #[test]
    fn rig_and_animation_roundtrip() {
        let rig = Asset::Rig(RigData {
            bones: vec![Bone {
                name: "root".to_string(),
                inverse_bind_pose: Matrix4::identity(),
                parent: None,
            }],
            animations: vec![AssetId::new(0)],
        });
        assert_eq!(roundtrip(rig.clone()), rig);

        let animation = Asset::Animation(AnimationData {
            frame_count: 1,
            frame_time_ms: 100.0,
            keyframes: vec![crate::assets::animation::Keyframe {
                bone_matrices: vec![Matrix4::identity()],
            }],
        });
        assert_eq!(roundtrip(animation.clone()), animation);
    }

    #[test]
    fn font_roundtrips() {
        let asset = Asset::Font(FontData {
            atlas_width: 2,
            atlas_height: 2,
            atlas_pixels: vec![0, 128, 255, 64],
            glyphs: vec![GlyphMetrics {
                codepoint: 'a' as u32,
                x: 0,
                y: 0,
                width: 2,
                height: 2,
                advance: 3,
            }],
        });
        assert_eq!(roundtrip(asset.clone()), asset);
    }

    #[test]
    fn file_helpers_roundtrip() {
        let dir = std::env::temp_dir().join("stratus-serial-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("asset.bin");

        let asset = Asset::Texture(TextureData {
            width: 1,
            height: 1,
            pixels: vec![1, 2, 3, 4],
        });
        save_asset_file(&path, &asset).unwrap();
        assert_eq!(load_asset_file(&path).unwrap(), asset);

        std::fs::remove_file(&path).unwrap();
        assert_eq!(
            load_asset_file(&path).err(),
            Some(StratusError::ASSET_NOT_FOUND)
        );
    }
}
