//! Re-exports the most commonly used types in the library

pub use ash::vk;

pub use crate::device::{
    BufferBarrier, BufferCreateInfo, BufferHandle, CommandEncoder, DepthStencilMode, EventHandle,
    ImageBarrier, ImageCreateInfo, ImageHandle, ImplementationQuirks, RenderDevice,
    RenderPassInfo, RenderPassOpFlags, SemaphoreHandle, SubpassInfo,
};
pub use crate::error::Error;
pub use crate::graph::barrier::{Barrier, Barriers};
pub use crate::graph::debug::GraphViz;
pub use crate::graph::render_pass::PhysicalPass;
pub use crate::graph::{PhysicalBuffer, PhysicalImage, RenderGraph};
pub use crate::pass::PassBuilder;
pub use crate::queue::{QueueType, RenderGraphQueueFlags};
pub use crate::resource::{AttachmentInfo, BufferInfo, ResourceDimensions, ResourceType, SizeClass};
pub use crate::task::{InlineComposer, ScopedComposer, TaskComposer};
