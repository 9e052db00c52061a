//! Frame render graph and multi-queue scheduling middleware for Vulkan
//!
//! Deimos takes a declarative description of rendering passes and their
//! resource reads and writes, and turns it into a fully planned GPU frame:
//! it discovers the passes required to produce the backbuffer, orders them to
//! maximise pipelining across queues, assigns physical images and buffers with
//! aggressive lifetime aliasing, merges compatible graphics passes into
//! multi-subpass render passes, and synthesises the pipeline barriers, events,
//! semaphores and layout transitions needed between passes and across queues.
//!
//! The GPU itself is consumed through a small set of traits
//! ([`RenderDevice`], [`CommandEncoder`], [`TaskComposer`]) so the whole
//! frame can also be driven against a recording mock in tests.
//!
//! # Example
//!
//! Declaring a pass that clears the backbuffer:
//! ```no_run
//! use deimos::prelude::*;
//!
//! let mut graph = RenderGraph::new();
//! let mut pass = graph.add_pass("triangle", RenderGraphQueueFlags::GRAPHICS);
//! pass.add_color_output(
//!     "backbuffer",
//!     AttachmentInfo {
//!         format: vk::Format::B8G8R8A8_SRGB,
//!         ..Default::default()
//!     },
//!     None,
//! );
//! pass.set_get_clear_color(|_| {
//!     Some(vk::ClearColorValue {
//!         float32: [0.0, 0.0, 0.0, 1.0],
//!     })
//! });
//! pass.set_build_render_pass(|_cmd, _layer| {
//!     // record draws here
//! });
//! drop(pass);
//!
//! graph.set_backbuffer_source("backbuffer");
//! graph.bake().unwrap();
//! ```
//!
//! Per frame, [`RenderGraph::setup_attachments`] realises the physical images
//! and buffers and [`RenderGraph::enqueue_render_passes`] records and submits
//! the frame through a [`TaskComposer`].

#[macro_use]
extern crate derivative;
#[macro_use]
extern crate log;

pub mod prelude;
pub use crate::prelude::*;

pub mod device;
pub mod error;
pub mod format;
pub mod graph;
pub mod pass;
pub mod queue;
pub mod resource;
pub mod task;
