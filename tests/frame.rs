//! Full-frame tests: attachment realisation, barrier emission, recording and
//! submission against the recording mock device.

mod framework;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use deimos::prelude::*;
use framework::{Cmd, TestDevice};

const SWAPCHAIN: ImageHandle = ImageHandle(0xABCD);

fn color_info() -> AttachmentInfo {
    AttachmentInfo {
        format: vk::Format::B8G8R8A8_UNORM,
        ..Default::default()
    }
}

fn rt_info(format: vk::Format) -> AttachmentInfo {
    AttachmentInfo {
        format,
        ..Default::default()
    }
}

fn half_info(format: vk::Format) -> AttachmentInfo {
    AttachmentInfo {
        size_x: 0.5,
        size_y: 0.5,
        format,
        ..Default::default()
    }
}

fn new_graph() -> RenderGraph {
    let _ = pretty_env_logger::try_init();
    let mut graph = RenderGraph::new();
    graph.set_backbuffer_dimensions(framework::swapchain_dimensions());
    graph
}

fn run_frame(graph: &mut RenderGraph, device: &TestDevice) {
    graph.setup_attachments(device, Some(SWAPCHAIN)).unwrap();
    let mut composer = InlineComposer::new();
    graph.enqueue_render_passes(device, &mut composer).unwrap();
}

#[test]
fn triangle_renders_straight_to_swapchain() {
    let device = TestDevice::new();
    let mut graph = new_graph();
    let draws = Arc::new(AtomicU32::new(0));
    {
        let draws = Arc::clone(&draws);
        let mut pass = graph.add_pass("triangle", RenderGraphQueueFlags::GRAPHICS);
        pass.add_color_output("back", color_info(), None);
        pass.set_get_clear_color(|_| {
            Some(vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 1.0],
            })
        });
        pass.set_build_render_pass(move |cmd, _layer| {
            draws.fetch_add(1, Ordering::SeqCst);
            cmd.draw_fullscreen_quad();
        });
    }
    graph.set_backbuffer_source("back");
    graph.bake().unwrap();

    run_frame(&mut graph, &device);

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].queue, QueueType::Graphics);
    assert!(submissions[0].signal_semaphores.is_empty());

    // The swapchain image needs no explicit barriers; the render pass itself
    // transitions from UNDEFINED.
    assert!(framework::find_commands(&submissions[0], |cmd| matches!(
        cmd,
        Cmd::Barrier { .. } | Cmd::WaitEvents { .. } | Cmd::CompleteSignalEvent(_)
    ))
    .is_empty());

    let begins = framework::find_commands(&submissions[0], |cmd| {
        matches!(cmd, Cmd::BeginRenderPass { .. })
    });
    assert_eq!(begins.len(), 1);
    let Cmd::BeginRenderPass {
        colors,
        clear_attachments,
        store_attachments,
        num_subpasses,
        ..
    } = begins[0]
    else {
        unreachable!()
    };
    assert_eq!(colors, &vec![SWAPCHAIN]);
    assert_eq!(*clear_attachments, 1);
    assert_ne!(store_attachments & 1, 0);
    assert_eq!(*num_subpasses, 1);

    assert!(framework::has_region(&submissions[0], "render-graph-sync-pre"));
    assert!(framework::has_region(&submissions[0], "render-graph-sync-post"));
    assert!(framework::has_region(&submissions[0], "triangle"));

    assert_eq!(draws.load(Ordering::SeqCst), 1);
    assert_eq!(device.image_count(), 0);
    assert_eq!(device.flush_count(), 1);
    assert!(device.waits().is_empty());
}

#[test]
fn async_compute_publishes_proxy_semaphores() {
    let device = TestDevice::new();
    let mut graph = new_graph();
    {
        let mut pass = graph.add_pass("simulate", RenderGraphQueueFlags::ASYNC_COMPUTE);
        pass.add_storage_output(
            "particles",
            BufferInfo {
                size: 4096,
                ..Default::default()
            },
            None,
        );
    }
    {
        let mut pass = graph.add_pass("draw", RenderGraphQueueFlags::GRAPHICS);
        pass.add_vertex_buffer_input("particles");
        pass.add_color_output("back", color_info(), None);
    }
    graph.set_backbuffer_source("back");
    graph.bake().unwrap();

    run_frame(&mut graph, &device);

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 2);

    // The producer signals the graphics/compute proxy pair.
    assert_eq!(submissions[0].queue, QueueType::AsyncCompute);
    assert_eq!(submissions[0].signal_semaphores.len(), 2);

    // The consumer waits on the graphics-side proxy at vertex input; no
    // event is involved for a cross-queue resource. Its read publishes a
    // fresh proxy pair so next frame's write can order behind it.
    assert_eq!(submissions[1].queue, QueueType::Graphics);
    assert_eq!(submissions[1].signal_semaphores.len(), 2);
    let graphics_proxy = submissions[0].signal_semaphores[0];
    assert_eq!(
        device.waits(),
        vec![(
            QueueType::Graphics,
            graphics_proxy,
            vk::PipelineStageFlags::VERTEX_INPUT
        )]
    );
    assert!(framework::find_commands(&submissions[1], |cmd| matches!(
        cmd,
        Cmd::WaitEvents { .. }
    ))
    .is_empty());

    let state = device.state.lock().unwrap();
    assert_eq!(state.events_allocated, 0);
    assert_eq!(state.buffers.len(), 1);
    assert!(state.buffers[0].1.zero_initialize);
    assert!(state.buffers[0]
        .1
        .usage
        .contains(vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::VERTEX_BUFFER));
}

#[test]
fn history_image_swaps_roles_between_frames() {
    let device = TestDevice::new();
    let mut graph = new_graph();
    {
        let mut pass = graph.add_pass("taa", RenderGraphQueueFlags::GRAPHICS);
        pass.add_history_input("color_ldr");
        pass.add_color_output("color_ldr", rt_info(vk::Format::R8G8B8A8_UNORM), None);
        pass.add_color_output("back", color_info(), None);
    }
    graph.set_backbuffer_source("back");
    graph.bake().unwrap();

    // Frame 1: no history image exists, the history barrier is skipped and
    // the fresh image transitions from UNDEFINED.
    run_frame(&mut graph, &device);
    assert_eq!(device.image_count(), 1);

    let frame1 = device.submissions();
    assert_eq!(frame1.len(), 1);
    assert!(framework::find_commands(&frame1[0], |cmd| matches!(
        cmd,
        Cmd::WaitEvents { .. }
    ))
    .is_empty());

    let barriers = framework::find_commands(&frame1[0], |cmd| matches!(cmd, Cmd::Barrier { .. }));
    assert_eq!(barriers.len(), 1);
    let Cmd::Barrier {
        src_stages, images, ..
    } = barriers[0]
    else {
        unreachable!()
    };
    assert_eq!(*src_stages, vk::PipelineStageFlags::TOP_OF_PIPE);
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].old_layout, vk::ImageLayout::UNDEFINED);
    assert_eq!(images[0].new_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

    // The pass publishes an event so next frame's history read can wait.
    assert_eq!(
        framework::find_commands(&frame1[0], |cmd| matches!(cmd, Cmd::CompleteSignalEvent(_)))
            .len(),
        1
    );

    // Frame 2: roles swap; a new current image appears and the previous
    // frame's image is transitioned for sampling through the event.
    run_frame(&mut graph, &device);
    assert_eq!(device.image_count(), 2);

    let submissions = device.submissions();
    let frame2 = &submissions[1];
    let waits = framework::find_commands(frame2, |cmd| matches!(cmd, Cmd::WaitEvents { .. }));
    assert_eq!(waits.len(), 1);
    let Cmd::WaitEvents { events, images, .. } = waits[0] else {
        unreachable!()
    };
    assert_eq!(events.len(), 1);
    assert!(images.iter().any(|barrier| {
        barrier.old_layout == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            && barrier.new_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    }));
}

#[test]
fn mismatched_backbuffer_blits_to_swapchain() {
    let device = TestDevice::new();
    let mut graph = new_graph();
    {
        let mut pass = graph.add_pass("render_low_res", RenderGraphQueueFlags::GRAPHICS);
        pass.add_color_output(
            "offscreen",
            AttachmentInfo {
                size_class: SizeClass::Absolute,
                size_x: 640.0,
                size_y: 360.0,
                format: vk::Format::B8G8R8A8_UNORM,
                ..Default::default()
            },
            None,
        );
    }
    graph.set_backbuffer_source("offscreen");
    graph.bake().unwrap();
    assert_eq!(graph.swapchain_physical_index(), None);

    run_frame(&mut graph, &device);

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 2);

    // The render pass signals an event the copy waits on.
    assert_eq!(
        framework::find_commands(&submissions[0], |cmd| matches!(cmd, Cmd::CompleteSignalEvent(_)))
            .len(),
        1
    );

    let copy = &submissions[1];
    assert!(framework::has_region(copy, "render-graph-copy-to-swapchain"));

    let waits = framework::find_commands(copy, |cmd| matches!(cmd, Cmd::WaitEvents { .. }));
    assert_eq!(waits.len(), 1);
    let Cmd::WaitEvents { images, .. } = waits[0] else {
        unreachable!()
    };
    assert_eq!(images[0].old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    assert_eq!(images[0].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    let offscreen = {
        let state = device.state.lock().unwrap();
        assert_eq!(state.images.len(), 1);
        assert!(state.images[0]
            .1
            .usage
            .contains(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED));
        state.images[0].0
    };

    let begins = framework::find_commands(copy, |cmd| matches!(cmd, Cmd::BeginRenderPass { .. }));
    assert_eq!(begins.len(), 1);
    let Cmd::BeginRenderPass {
        colors,
        store_attachments,
        ..
    } = begins[0]
    else {
        unreachable!()
    };
    assert_eq!(colors, &vec![SWAPCHAIN]);
    assert_eq!(*store_attachments, 1);

    assert!(copy.commands.contains(&Cmd::SetTexture(0, offscreen)));
    assert!(copy.commands.contains(&Cmd::DrawFullscreenQuad));
    assert_eq!(device.flush_count(), 1);
}

#[test]
fn skipped_pass_submits_nothing() {
    let device = TestDevice::new();
    let mut graph = new_graph();
    {
        let mut pass = graph.add_pass("maybe", RenderGraphQueueFlags::GRAPHICS);
        pass.add_color_output("back", color_info(), None);
        pass.set_need_render_pass(|| false);
    }
    graph.set_backbuffer_source("back");
    graph.bake().unwrap();

    run_frame(&mut graph, &device);

    assert!(device.submissions().is_empty());
    assert_eq!(device.flush_count(), 1);
}

#[test]
fn multi_level_output_generates_mipmaps() {
    let device = TestDevice::new();
    let mut graph = new_graph();
    {
        let mut pass = graph.add_pass("bright_pass", RenderGraphQueueFlags::GRAPHICS);
        pass.add_color_output(
            "chain",
            AttachmentInfo {
                size_x: 0.5,
                size_y: 0.5,
                levels: 0,
                format: vk::Format::R16G16B16A16_SFLOAT,
                ..Default::default()
            },
            None,
        );
    }
    {
        let mut pass = graph.add_pass("apply", RenderGraphQueueFlags::GRAPHICS);
        pass.add_texture_input("chain", vk::PipelineStageFlags::empty());
        pass.add_color_output("back", color_info(), None);
    }
    graph.set_backbuffer_source("back");
    graph.bake().unwrap();

    let chain = graph.resource_physical_index("chain").unwrap();
    // The sentinel layout requests mip generation after the pass.
    assert!(graph.physical_passes()[0].flush.iter().any(|barrier| {
        barrier.resource_index == chain
            && barrier.layout == vk::ImageLayout::TRANSFER_SRC_OPTIMAL
    }));
    assert_eq!(graph.physical_passes()[0].mipmap_requests.len(), 1);

    run_frame(&mut graph, &device);

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 2);

    assert!(framework::has_region(&submissions[0], "render-graph-mipgen"));
    let chain_image = device.state.lock().unwrap().images[0].0;
    assert!(submissions[0]
        .commands
        .contains(&Cmd::PrepareGenerateMipmap(chain_image)));
    assert!(submissions[0]
        .commands
        .contains(&Cmd::GenerateMipmap(chain_image)));

    // 640 x 360 yields a 10-level chain.
    assert_eq!(device.state.lock().unwrap().images[0].1.levels, 10);

    // The consumer transitions away from the mipgen layout.
    let waits = framework::find_commands(&submissions[1], |cmd| {
        matches!(cmd, Cmd::WaitEvents { .. })
    });
    assert_eq!(waits.len(), 1);
    let Cmd::WaitEvents { images, .. } = waits[0] else {
        unreachable!()
    };
    assert!(images.iter().any(|barrier| {
        barrier.old_layout == vk::ImageLayout::TRANSFER_SRC_OPTIMAL
            && barrier.new_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    }));
}

#[test]
fn alias_transfer_carries_event_state() {
    let format = vk::Format::R16G16B16A16_SFLOAT;
    let device = TestDevice::new();
    let mut graph = new_graph();
    {
        let mut pass = graph.add_pass("forward", RenderGraphQueueFlags::GRAPHICS);
        pass.add_color_output("hdr", rt_info(format), None);
    }
    {
        let mut pass = graph.add_pass("bloom_downsample", RenderGraphQueueFlags::GRAPHICS);
        pass.add_texture_input("hdr", vk::PipelineStageFlags::empty());
        pass.add_color_output("half0", half_info(format), None);
    }
    {
        let mut pass = graph.add_pass("bloom_blur_h", RenderGraphQueueFlags::GRAPHICS);
        pass.add_texture_input("half0", vk::PipelineStageFlags::empty());
        pass.add_color_output("half1", half_info(format), None);
    }
    {
        let mut pass = graph.add_pass("bloom_blur_v", RenderGraphQueueFlags::GRAPHICS);
        pass.add_texture_input("half1", vk::PipelineStageFlags::empty());
        pass.add_color_output("half2", half_info(format), None);
    }
    {
        let mut pass = graph.add_pass("composite", RenderGraphQueueFlags::GRAPHICS);
        pass.add_texture_input("hdr", vk::PipelineStageFlags::empty());
        pass.add_texture_input("half2", vk::PipelineStageFlags::empty());
        pass.add_color_output("back", color_info(), None);
    }
    graph.set_backbuffer_source("back");
    graph.bake().unwrap();

    run_frame(&mut graph, &device);

    let submissions = device.submissions();
    assert_eq!(submissions.len(), 5);

    // half2 shares half0's image: hdr, half0 and half1 are the only
    // allocations.
    assert_eq!(device.image_count(), 3);

    // Writing half2 rides the event handed over from half0's last read, so
    // the aliasing transition is an event barrier from UNDEFINED.
    let blur_v = &submissions[3];
    let waits = framework::find_commands(blur_v, |cmd| matches!(cmd, Cmd::WaitEvents { .. }));
    assert_eq!(waits.len(), 1);
    let Cmd::WaitEvents { images, .. } = waits[0] else {
        unreachable!()
    };
    assert!(images.iter().any(|barrier| {
        barrier.old_layout == vk::ImageLayout::UNDEFINED
            && barrier.new_layout == vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    }));
}

#[test]
fn prepare_callbacks_run_before_recording() {
    let device = TestDevice::new();
    let mut graph = new_graph();
    let prepared = Arc::new(AtomicU32::new(0));
    {
        let prepared = Arc::clone(&prepared);
        let mut pass = graph.add_pass("triangle", RenderGraphQueueFlags::GRAPHICS);
        pass.add_color_output("back", color_info(), None);
        pass.set_enqueue_prepare_render_pass(move |_subpass| {
            prepared.fetch_add(1, Ordering::SeqCst);
            vk::SubpassContents::INLINE
        });
    }
    graph.set_backbuffer_source("back");
    graph.bake().unwrap();

    run_frame(&mut graph, &device);
    assert_eq!(prepared.load(Ordering::SeqCst), 1);
}

#[test]
fn timestamps_wrap_each_pass() {
    let device = TestDevice::new();
    let mut graph = new_graph();
    {
        let mut pass = graph.add_pass("triangle", RenderGraphQueueFlags::GRAPHICS);
        pass.add_color_output("back", color_info(), None);
    }
    graph.set_backbuffer_source("back");
    graph.enable_timestamps(true);
    graph.bake().unwrap();

    run_frame(&mut graph, &device);

    let submissions = device.submissions();
    let timestamps = framework::find_commands(&submissions[0], |cmd| {
        matches!(cmd, Cmd::WriteTimestamp(_))
    });
    assert_eq!(timestamps.len(), 4);
}

#[test]
fn persistent_resources_survive_frames() {
    let device = TestDevice::new();
    let mut graph = new_graph();
    {
        let mut pass = graph.add_pass("simulate", RenderGraphQueueFlags::ASYNC_COMPUTE);
        pass.add_storage_output(
            "particles",
            BufferInfo {
                size: 4096,
                ..Default::default()
            },
            None,
        );
    }
    {
        let mut pass = graph.add_pass("render_low_res", RenderGraphQueueFlags::GRAPHICS);
        pass.add_vertex_buffer_input("particles");
        pass.add_color_output(
            "offscreen",
            AttachmentInfo {
                size_class: SizeClass::Absolute,
                size_x: 640.0,
                size_y: 360.0,
                format: vk::Format::B8G8R8A8_UNORM,
                ..Default::default()
            },
            None,
        );
    }
    graph.set_backbuffer_source("offscreen");
    graph.bake().unwrap();

    run_frame(&mut graph, &device);
    run_frame(&mut graph, &device);

    // Persistent and compatible: the buffer and the offscreen image are
    // created once and reused.
    let state = device.state.lock().unwrap();
    assert_eq!(state.buffers.len(), 1);
    assert_eq!(state.images.len(), 1);
    drop(state);

    // The realised buffer can be consumed and reinstalled across a rebuild.
    let buffers = graph.consume_physical_buffers();
    assert_eq!(buffers.iter().flatten().count(), 1);
    graph.install_physical_buffers(buffers);
}

#[test]
fn frame_runs_on_scoped_composer() {
    let device = TestDevice::new();
    let mut graph = new_graph();
    {
        let mut pass = graph.add_pass("triangle", RenderGraphQueueFlags::GRAPHICS);
        pass.add_color_output("back", color_info(), None);
    }
    graph.set_backbuffer_source("back");
    graph.bake().unwrap();

    graph.setup_attachments(&device, Some(SWAPCHAIN)).unwrap();
    std::thread::scope(|scope| {
        let mut composer = ScopedComposer::new(scope);
        graph.enqueue_render_passes(&device, &mut composer).unwrap();
    });

    assert_eq!(device.submissions().len(), 1);
    assert_eq!(device.flush_count(), 1);
}
