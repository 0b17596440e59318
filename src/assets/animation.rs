// Animation device storage
//
// All animations share two storage buffers: a metadata table indexed by
// animation id and one big array of keyframe bone matrices. New
// animations append; when the matrix buffer runs out it is reallocated
// at twice the size and the descriptor rewritten. Both buffers are host
// coherent, the vertex shader reads them through the shared asset
// descriptor.

use std::sync::{Arc, Mutex};

use ash::vk;
use cgmath::Matrix4;
use serde::{Deserialize, Serialize};

use crate::assets::descriptor::{AssetBinding, DescriptorBindingInfo, DescriptorUpdate};
use crate::assets::{Animation, AssetId};
use crate::device::{Device, MappedBuffer};
use crate::frame_state::FrameRenderState;
use crate::util::IndexMap;
use crate::{Result, StratusError};

/// Hard cap on the metadata table.
pub const MAX_ANIMATIONS: u32 = 256;

/// Initial keyframe buffer size, in bone matrices.
const INITIAL_MATRIX_CAPACITY: usize = 1024;

const MATRIX_SIZE: usize = std::mem::size_of::<[[f32; 4]; 4]>();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    pub bone_matrices: Vec<Matrix4<f32>>,
}

/// Host-side animation content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnimationData {
    pub frame_count: u32,
    pub frame_time_ms: f32,
    pub keyframes: Vec<Keyframe>,
}

impl AnimationData {
    pub fn duration_ms(&self) -> f32 {
        self.frame_count as f32 * self.frame_time_ms
    }

    /// The consistency requirements the registry enforces at add time.
    pub fn validate(&self) -> Result<()> {
        if self.keyframes.is_empty()
            || self.frame_count as usize != self.keyframes.len()
            || self.frame_time_ms <= 0.0
        {
            return Err(StratusError::VALIDATION_FAILED);
        }
        let bones = self.keyframes[0].bone_matrices.len();
        if bones == 0 || self.keyframes.iter().any(|k| k.bone_matrices.len() != bones) {
            return Err(StratusError::VALIDATION_FAILED);
        }
        Ok(())
    }
}

/// The metadata record shaders use to address an animation's matrices.
/// Must match the shader-side struct.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct AnimationMeta {
    am_offset: u32,
    am_frame_count: u32,
    am_bone_count: u32,
    am_padding: u32,
}

/// Lightweight handle to a stored animation. Animations are append
/// only, so the handle is a plain copy of the immutable facts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnimationHandle {
    ah_index: u32,
    ah_frame_count: u32,
    ah_frame_time_ms: f32,
}

impl AnimationHandle {
    pub(crate) fn from_raw(index: u32, frame_count: u32, frame_time_ms: f32) -> Self {
        Self {
            ah_index: index,
            ah_frame_count: frame_count,
            ah_frame_time_ms: frame_time_ms,
        }
    }

    /// The animation's index in the metadata table, pushed to shaders.
    pub fn buffer_index(&self) -> u32 {
        self.ah_index
    }

    pub fn frame_count(&self) -> u32 {
        self.ah_frame_count
    }

    pub fn frame_time_ms(&self) -> f32 {
        self.ah_frame_time_ms
    }

    pub fn duration_ms(&self) -> f32 {
        self.ah_frame_count as f32 * self.ah_frame_time_ms
    }
}

struct RegistryInternal {
    in_meta_buffer: MappedBuffer,
    in_keyframe_buffer: MappedBuffer,
    /// Capacity of the keyframe buffer, in matrices
    in_matrix_capacity: usize,
    /// Host shadow of every appended matrix, replayed on regrowth
    in_matrix_shadow: Vec<[[f32; 4]; 4]>,
    in_count: u32,
    in_handles: IndexMap<AnimationHandle>,
    /// Buffers replaced by regrowth, retired at the next update
    in_retired: Vec<MappedBuffer>,
    in_updates: Vec<DescriptorUpdate>,
}

pub struct AnimationRegistry {
    a_device: Arc<Device>,
    a_internal: Mutex<RegistryInternal>,
}

impl AnimationRegistry {
    pub fn new(device: Arc<Device>) -> Result<Self> {
        let meta_buffer = device.create_mapped_buffer(
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MAX_ANIMATIONS as u64 * std::mem::size_of::<AnimationMeta>() as u64,
        )?;
        let keyframe_buffer = device.create_mapped_buffer(
            vk::BufferUsageFlags::STORAGE_BUFFER,
            (INITIAL_MATRIX_CAPACITY * MATRIX_SIZE) as u64,
        )?;

        // Both buffers exist now, the shared set can reference them
        // from the start
        let updates = vec![
            DescriptorUpdate::buffer(
                AssetBinding::AnimationMetadata as u32,
                0,
                meta_buffer.vk_buffer(),
            ),
            DescriptorUpdate::buffer(
                AssetBinding::AnimationData as u32,
                0,
                keyframe_buffer.vk_buffer(),
            ),
        ];

        Ok(Self {
            a_device: device,
            a_internal: Mutex::new(RegistryInternal {
                in_meta_buffer: meta_buffer,
                in_keyframe_buffer: keyframe_buffer,
                in_matrix_capacity: INITIAL_MATRIX_CAPACITY,
                in_matrix_shadow: Vec::new(),
                in_count: 0,
                in_handles: IndexMap::new(),
                in_retired: Vec::new(),
                in_updates: updates,
            }),
        })
    }

    /// Append an animation to the shared buffers.
    pub fn add(&self, data: &AnimationData) -> Result<AssetId<Animation>> {
        data.validate()?;

        let mut internal = self.a_internal.lock().unwrap();
        if internal.in_count >= MAX_ANIMATIONS {
            return Err(StratusError::CAPACITY_EXCEEDED);
        }

        let index = internal.in_count;
        let bone_count = data.keyframes[0].bone_matrices.len() as u32;
        let offset = internal.in_matrix_shadow.len() as u32;
        let needed = internal.in_matrix_shadow.len()
            + (data.frame_count * bone_count) as usize;

        // Grow by doubling until the new keyframes fit
        if needed > internal.in_matrix_capacity {
            let mut new_capacity = internal.in_matrix_capacity * 2;
            while new_capacity < needed {
                new_capacity *= 2;
            }

            let new_buffer = self.a_device.create_mapped_buffer(
                vk::BufferUsageFlags::STORAGE_BUFFER,
                (new_capacity * MATRIX_SIZE) as u64,
            )?;
            new_buffer.write_at(0, &internal.in_matrix_shadow);

            let old = std::mem::replace(&mut internal.in_keyframe_buffer, new_buffer);
            internal.in_retired.push(old);
            internal.in_matrix_capacity = new_capacity;

            let buf = internal.in_keyframe_buffer.vk_buffer();
            internal.in_updates.push(DescriptorUpdate::buffer(
                AssetBinding::AnimationData as u32,
                0,
                buf,
            ));
        }

        // Metadata slot for this animation
        let meta = AnimationMeta {
            am_offset: offset,
            am_frame_count: data.frame_count,
            am_bone_count: bone_count,
            am_padding: 0,
        };
        internal.in_meta_buffer.write_at(
            index as usize * std::mem::size_of::<AnimationMeta>(),
            &[meta],
        );

        // Keyframe matrices, tightly packed frame after frame
        let mut flat: Vec<[[f32; 4]; 4]> = Vec::new();
        for keyframe in data.keyframes.iter() {
            for matrix in keyframe.bone_matrices.iter() {
                flat.push((*matrix).into());
            }
        }
        internal
            .in_keyframe_buffer
            .write_at(offset as usize * MATRIX_SIZE, &flat);
        internal.in_matrix_shadow.extend_from_slice(&flat);

        let handle = AnimationHandle {
            ah_index: index,
            ah_frame_count: data.frame_count,
            ah_frame_time_ms: data.frame_time_ms,
        };
        internal.in_handles.insert(index, handle);
        internal.in_count += 1;

        Ok(AssetId::new(index))
    }

    /// Forget an animation. The buffer space it occupies is not
    /// reclaimed; the storage is append only.
    pub fn remove(&self, id: AssetId<Animation>) -> Result<()> {
        let mut internal = self.a_internal.lock().unwrap();
        internal
            .in_handles
            .remove(id.raw())
            .map(|_| ())
            .ok_or(StratusError::ASSET_NOT_FOUND)
    }

    pub fn get(&self, id: AssetId<Animation>) -> Result<AnimationHandle> {
        let internal = self.a_internal.lock().unwrap();
        internal
            .in_handles
            .get(id.raw())
            .copied()
            .ok_or(StratusError::ASSET_NOT_FOUND)
    }

    /// Retire buffers that were replaced by regrowth.
    pub fn update(&self, frame: &Arc<FrameRenderState>) -> Result<()> {
        let mut internal = self.a_internal.lock().unwrap();
        for buffer in internal.in_retired.drain(..) {
            let dev = self.a_device.clone();
            frame.on_render_finished(move || buffer.destroy(&dev));
        }
        Ok(())
    }

    pub fn descriptor_layout_bindings(&self) -> Vec<DescriptorBindingInfo> {
        let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::COMPUTE;
        vec![
            DescriptorBindingInfo {
                binding: AssetBinding::AnimationMetadata as u32,
                ty: vk::DescriptorType::STORAGE_BUFFER,
                count: 1,
                stages,
                flags: vk::DescriptorBindingFlags::empty(),
            },
            DescriptorBindingInfo {
                binding: AssetBinding::AnimationData as u32,
                ty: vk::DescriptorType::STORAGE_BUFFER,
                count: 1,
                stages,
                flags: vk::DescriptorBindingFlags::empty(),
            },
        ]
    }

    pub fn descriptor_updates(&self) -> Vec<DescriptorUpdate> {
        let mut internal = self.a_internal.lock().unwrap();
        std::mem::replace(&mut internal.in_updates, Vec::new())
    }

    pub fn destroy(&self) {
        let mut internal = self.a_internal.lock().unwrap();
        internal.in_meta_buffer.destroy(&self.a_device);
        internal.in_keyframe_buffer.destroy(&self.a_device);
        for buffer in internal.in_retired.drain(..) {
            buffer.destroy(&self.a_device);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::SquareMatrix;

    fn anim(frames: u32, bones: usize) -> AnimationData {
        AnimationData {
            frame_count: frames,
            frame_time_ms: 100.0,
            keyframes: (0..frames)
                .map(|_| Keyframe {
                    bone_matrices: vec![Matrix4::identity(); bones],
                })
                .collect(),
        }
    }

    #[test]
    fn validation_checks_shape() {
        assert!(anim(2, 4).validate().is_ok());
        assert!(AnimationData::default().validate().is_err());

        let mut mismatched = anim(2, 4);
        mismatched.frame_count = 3;
        assert_eq!(
            mismatched.validate(),
            Err(StratusError::VALIDATION_FAILED)
        );

        let mut ragged = anim(2, 4);
        ragged.keyframes[1].bone_matrices.pop();
        assert_eq!(ragged.validate(), Err(StratusError::VALIDATION_FAILED));
    }

    #[test]
    fn duration_is_frames_times_frame_time() {
        let data = anim(2, 1);
        assert_eq!(data.duration_ms(), 200.0);
    }
}
