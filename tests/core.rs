// Host-side integration tests over the public API. Everything here
// runs without a GPU: graph ordering, scene registration grouping,
// light packing and the persisted asset format.

extern crate stratus;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use stratus::assets::{serial, Asset, GeometryData, MeshVertex};
use stratus::{
    FrameClock, FrameSpecific, LightRegistry, PipelineId, RenderGraph, SceneBase, StageId,
};

use cgmath::Vector3;

#[test]
fn graph_and_scene_drive_grouped_draws() {
    // A graph with a resource-update stage ahead of the main pass
    let mut graph = RenderGraph::new();
    let update = StageId(0);
    let main = StageId(1);
    let post = StageId(2);
    graph.first(update);
    graph.after(update, main).unwrap();
    graph.after(main, post).unwrap();

    assert_eq!(graph.stage_order().unwrap(), vec![update, main, post]);

    // Two drawables on one pipeline, one on another; iterating the
    // scene's pipeline groups touches each pipeline exactly once
    let scene = SceneBase::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let draw = |tag: u32| {
        let log = log.clone();
        Box::new(move |_: &stratus::DrawEnvironment, _| {
            log.lock().unwrap().push(tag);
        }) as stratus::DrawFn
    };

    let _a = scene.register(main, 0, PipelineId(0), draw(1));
    let b = scene.register(main, 0, PipelineId(1), draw(2));
    let _c = scene.register(main, 0, PipelineId(0), draw(3));

    let pipelines = scene.pipelines(main, 0);
    assert_eq!(pipelines, vec![PipelineId(0), PipelineId(1)]);
    for p in pipelines {
        scene.invoke_draw_functions(main, stratus::PassId(0), 0, p, ash::vk::CommandBuffer::null());
    }
    assert_eq!(*log.lock().unwrap(), vec![1, 3, 2]);

    // Removing the sole pipeline-1 drawable removes its group as well
    scene.unregister(&b);
    assert_eq!(scene.pipelines(main, 0), vec![PipelineId(0)]);
}

#[test]
fn frame_specific_objects_follow_the_clock() {
    let mut clock = FrameClock::new(2);
    let counters = FrameSpecific::new(&clock, |frame| AtomicUsize::new(frame as usize * 10));

    counters.get(&clock).fetch_add(1, Ordering::SeqCst);
    clock.advance();
    counters.get(&clock).fetch_add(1, Ordering::SeqCst);
    clock.advance();

    // Wrapped back to frame 0
    assert_eq!(counters.get(&clock).load(Ordering::SeqCst), 1);
    assert_eq!(counters.get_at(1).load(Ordering::SeqCst), 11);
}

#[test]
fn light_buffer_layout_survives_slot_churn() {
    let lights = LightRegistry::new();
    let keep = lights.make_sun_light(
        Vector3::new(1.0, 1.0, 1.0),
        Vector3::new(0.0, -1.0, 0.0),
        0.1,
    );
    let drop_me = lights.make_point_light(
        Vector3::new(1.0, 0.0, 0.0),
        Vector3::new(2.0, 0.0, 0.0),
        0.2,
        0.0,
    );

    let before = lights.required_light_data_size();
    drop(drop_me);
    let after = lights.required_light_data_size();
    assert_eq!(before - after, 96);

    let mut buf = vec![0u8; after];
    let written = lights.write_light_data(&mut buf);
    assert_eq!(written, after);

    // Header says one sun light, nothing else
    assert_eq!(u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]), 1);
    assert_eq!(u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]), 0);

    drop(keep);
    assert_eq!(lights.required_light_data_size(), 12);
}

#[test]
fn persisted_assets_roundtrip_through_bytes() {
    let asset = Asset::Geometry(GeometryData {
        indices: vec![2, 1, 0],
        vertices: vec![
            MeshVertex {
                position: [0.0, 0.0, 0.0],
                normal: [0.0, 0.0, 1.0],
                uv: [0.0, 0.0],
                tangent: [1.0, 0.0, 0.0],
            };
            3
        ],
        skeletal_vertices: Vec::new(),
        rig: None,
    });

    let mut bytes = Vec::new();
    serial::save_asset(&mut bytes, &asset).unwrap();
    assert_eq!(serial::load_asset(&bytes[..]).unwrap(), asset);
}
