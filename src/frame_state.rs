// Per-frame render state
//
// Every frame submitted to the GPU carries one of these. Anything that
// must stay alive until the frame's render-finished timeline value
// signals is parked here: staging buffers from the data writer, asset
// handles captured by recorded commands, and the callbacks to fire when
// the frame retires.

use std::sync::{Arc, Mutex};

use crate::device::{Buffer, Device};

/// Marker for objects whose only teardown is their Drop impl. Asset
/// handles and other refcounted keep-alives go through this.
pub trait Droppable {}
impl<T> Droppable for T {}

struct FrameStateInternal {
    fsi_callbacks: Vec<Box<dyn FnOnce() + Send>>,
    fsi_transient_buffers: Vec<Buffer>,
    fsi_keep_alive: Vec<Box<dyn Droppable + Send + Sync>>,
    fsi_signaled: bool,
}

/// State tied to one in-flight frame.
///
/// Shared across threads: registries register staging buffers during
/// update, draw recording may retain handles, and the async
/// render-finished handler consumes everything from a worker thread.
pub struct FrameRenderState {
    fs_frame: u32,
    /// The swapchain image acquired for this frame, if presenting
    fs_image_index: Option<u32>,
    fs_internal: Mutex<FrameStateInternal>,
}

impl FrameRenderState {
    pub fn new(frame: u32, image_index: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            fs_frame: frame,
            fs_image_index: image_index,
            fs_internal: Mutex::new(FrameStateInternal {
                fsi_callbacks: Vec::new(),
                fsi_transient_buffers: Vec::new(),
                fsi_keep_alive: Vec::new(),
                fsi_signaled: false,
            }),
        })
    }

    /// The frame index this state belongs to.
    pub fn frame(&self) -> u32 {
        self.fs_frame
    }

    /// The index render targets over the swapchain should draw into.
    /// Falls back to the frame index when not presenting.
    pub fn target_image_index(&self) -> u32 {
        self.fs_image_index.unwrap_or(self.fs_frame)
    }

    /// Run `func` once this frame's commands have completed on the GPU.
    pub fn on_render_finished<F: FnOnce() + Send + 'static>(&self, func: F) {
        let mut internal = self.fs_internal.lock().unwrap();
        assert!(
            !internal.fsi_signaled,
            "registered a render-finished callback on a retired frame"
        );
        internal.fsi_callbacks.push(Box::new(func));
    }

    /// Hand a buffer to the frame. It is destroyed when the frame
    /// retires, never earlier.
    pub fn register_transient_buffer(&self, buffer: Buffer) {
        let mut internal = self.fs_internal.lock().unwrap();
        assert!(
            !internal.fsi_signaled,
            "registered a transient buffer on a retired frame"
        );
        internal.fsi_transient_buffers.push(buffer);
    }

    /// Keep an object alive until the frame retires. Used for asset
    /// handles referenced by this frame's command buffers.
    pub fn keep_alive(&self, obj: Box<dyn Droppable + Send + Sync>) {
        let mut internal = self.fs_internal.lock().unwrap();
        assert!(
            !internal.fsi_signaled,
            "retained an object on a retired frame"
        );
        internal.fsi_keep_alive.push(obj);
    }

    /// Fire the callbacks and release everything the frame held.
    ///
    /// Called exactly once per frame, from the worker task that waited
    /// on the frame's timeline value.
    pub fn signal_render_finished(&self, dev: &Device) {
        let (callbacks, buffers, keep_alive) = {
            let mut internal = self.fs_internal.lock().unwrap();
            assert!(!internal.fsi_signaled, "frame signaled twice");
            internal.fsi_signaled = true;
            (
                std::mem::replace(&mut internal.fsi_callbacks, Vec::new()),
                std::mem::replace(&mut internal.fsi_transient_buffers, Vec::new()),
                std::mem::replace(&mut internal.fsi_keep_alive, Vec::new()),
            )
        };

        for func in callbacks {
            func();
        }
        for buf in buffers.iter() {
            buf.destroy(dev);
        }
        drop(keep_alive);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    // The device-free parts of the frame state can be exercised by
    // checking callback bookkeeping through the public surface.
    #[test]
    fn callbacks_accumulate_until_signal() {
        let state = FrameRenderState::new(1, Some(0));
        let count = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let c = count.clone();
            state.on_render_finished(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(state.frame(), 1);
        assert_eq!(state.target_image_index(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
