//! Interfaces the render graph consumes from its collaborators: the
//! multi-queue device, the command recording surface, and the plain data it
//! exchanges with them.
//!
//! Handles are opaque tokens owned by the device implementation. The graph
//! never dereferences them; it only threads them back into device and encoder
//! calls.

use anyhow::Result;
use ash::vk;
use bitflags::bitflags;

use crate::queue::{QueueType, RenderGraphQueueFlags};

/// Opaque handle to a physical image owned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub u64);

/// Opaque handle to a physical buffer owned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Opaque handle to a pipeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// Opaque handle to a binary semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreHandle(pub u64);

/// Creation parameters for a physical image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageCreateInfo {
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub levels: u32,
    pub layers: u32,
    pub samples: u32,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
    /// Queues the image is used on concurrently.
    pub queues: RenderGraphQueueFlags,
    /// Create with a mutable sRGB view alias.
    pub mutable_srgb: bool,
}

/// Creation parameters for a physical buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCreateInfo {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// Zero-initialize device memory on creation.
    pub zero_initialize: bool,
}

/// Image layout transition plus memory dependency, emitted around passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageHandle,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub aspect: vk::ImageAspectFlags,
    pub levels: u32,
    pub layers: u32,
}

/// Buffer memory dependency emitted around passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    pub buffer: BufferHandle,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

/// Depth attachment usage of one subpass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepthStencilMode {
    #[default]
    None,
    ReadOnly,
    ReadWrite,
}

bitflags! {
    /// Load/store/clear behavior of the depth attachment across a whole
    /// physical pass.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RenderPassOpFlags: u32 {
        const CLEAR_DEPTH_STENCIL = 1 << 0;
        const LOAD_DEPTH_STENCIL = 1 << 1;
        const STORE_DEPTH_STENCIL = 1 << 2;
        const DEPTH_STENCIL_READ_ONLY = 1 << 3;
    }
}

/// Attachment table of one subpass. Indices refer to the physical pass's
/// color attachment list; an input attachment index equal to the color
/// attachment count refers to the depth attachment.
#[derive(Debug, Clone, Default)]
pub struct SubpassInfo {
    pub color_attachments: Vec<u32>,
    pub input_attachments: Vec<u32>,
    pub resolve_attachments: Vec<u32>,
    pub depth_stencil_mode: DepthStencilMode,
}

/// Everything [`CommandEncoder::begin_render_pass`] needs to begin a
/// (possibly multi-subpass) render pass.
#[derive(Derivative, Default, Clone)]
#[derivative(Debug)]
pub struct RenderPassInfo {
    pub color_attachments: Vec<ImageHandle>,
    pub depth_stencil: Option<ImageHandle>,
    pub subpasses: Vec<SubpassInfo>,
    /// Bitmask over color attachments to clear on load.
    pub clear_attachments: u32,
    /// Bitmask over color attachments to load.
    pub load_attachments: u32,
    /// Bitmask over color attachments to store.
    pub store_attachments: u32,
    pub op_flags: RenderPassOpFlags,
    #[derivative(Debug = "ignore")]
    pub clear_colors: Vec<vk::ClearColorValue>,
    pub clear_depth_stencil: vk::ClearDepthStencilValue,
    pub num_layers: u32,
    pub base_layer: u32,
}

/// Per-driver toggles that influence baking decisions.
#[derive(Debug, Clone, Copy)]
pub struct ImplementationQuirks {
    /// Merge compatible graphics passes into multi-subpass render passes.
    /// Pays off on tile-based GPUs; immediate-mode GPUs may prefer off.
    pub merge_subpasses: bool,
    /// Allow promoting color attachments to transient images.
    pub use_transient_color: bool,
    /// Allow promoting depth/stencil attachments to transient images.
    pub use_transient_depth_stencil: bool,
    /// Flush the frame after every queue submission.
    pub queue_wait_on_submission: bool,
}

impl Default for ImplementationQuirks {
    fn default() -> Self {
        Self {
            merge_subpasses: true,
            use_transient_color: true,
            use_transient_depth_stencil: true,
            queue_wait_on_submission: false,
        }
    }
}

/// The multi-queue GPU device the graph allocates from and submits to.
///
/// Implementations are internally synchronized; every method takes `&self`
/// so recording tasks can run in parallel against a shared device.
pub trait RenderDevice: Sync {
    fn create_image(&self, info: &ImageCreateInfo) -> Result<ImageHandle>;

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<BufferHandle>;

    /// Transient attachments live within one physical pass and may be backed
    /// by lazily allocated memory. `index` keys a small recycling cache.
    fn get_transient_attachment(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
        index: usize,
        samples: u32,
        layers: u32,
    ) -> Result<ImageHandle>;

    fn request_command_buffer(&self, queue: QueueType) -> Result<Box<dyn CommandEncoder + Send>>;

    /// Submit a finished command buffer. `signal_semaphores` receives one
    /// binary semaphore signal per requested proxy semaphore.
    fn submit(
        &self,
        cmd: Box<dyn CommandEncoder + Send>,
        signal_semaphores: &[SemaphoreHandle],
    ) -> Result<()>;

    /// Queue a semaphore wait on `queue` before its next submission.
    fn add_wait_semaphore(
        &self,
        queue: QueueType,
        semaphore: SemaphoreHandle,
        stages: vk::PipelineStageFlags,
        flush: bool,
    );

    /// Allocate a pipeline event that will be signalled at `stages` by the
    /// command buffer currently being recorded on this queue.
    fn begin_signal_event(&self, stages: vk::PipelineStageFlags) -> EventHandle;

    /// Allocate a proxy semaphore to be bound to a queue submission later.
    fn request_proxy_semaphore(&self) -> SemaphoreHandle;

    /// Flush pending per-queue state at the end of the frame.
    fn flush_frame(&self);

    fn supports_multiview(&self) -> bool {
        true
    }

    /// Which physical queue a logical queue kind actually submits on.
    fn physical_queue_type(&self, queue: QueueType) -> QueueType {
        queue
    }

    fn set_image_name(&self, _image: ImageHandle, _name: &str) {}

    fn set_buffer_name(&self, _buffer: BufferHandle, _name: &str) {}
}

/// Command recording surface. One encoder maps onto one command buffer on a
/// single queue.
pub trait CommandEncoder: Send {
    /// Open a debug marker region.
    fn begin_region(&mut self, name: &str);

    fn end_region(&mut self);

    fn barrier(
        &mut self,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        image_barriers: &[ImageBarrier],
    );

    fn wait_events(
        &mut self,
        events: &[EventHandle],
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        buffer_barriers: &[BufferBarrier],
        image_barriers: &[ImageBarrier],
    );

    /// Signal an event handed out by
    /// [`RenderDevice::begin_signal_event`] at its declared stages.
    fn complete_signal_event(&mut self, event: EventHandle);

    fn image_barrier(
        &mut self,
        image: ImageHandle,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src_stages: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
        dst_stages: vk::PipelineStageFlags,
        dst_access: vk::AccessFlags,
    );

    fn begin_render_pass(&mut self, info: &RenderPassInfo, contents: vk::SubpassContents);

    fn next_subpass(&mut self, contents: vk::SubpassContents);

    fn end_render_pass(&mut self);

    /// Transition every mip level so `generate_mipmap` can blit through the
    /// chain.
    fn barrier_prepare_generate_mipmap(
        &mut self,
        image: ImageHandle,
        base_layout: vk::ImageLayout,
        src_stages: vk::PipelineStageFlags,
        src_access: vk::AccessFlags,
    );

    fn generate_mipmap(&mut self, image: ImageHandle);

    /// Bind a sampled texture for the fullscreen readback helper.
    fn set_texture(&mut self, binding: u32, image: ImageHandle);

    /// Draw a fullscreen quad sampling the currently bound textures.
    fn draw_fullscreen_quad(&mut self);

    fn write_timestamp(&mut self, _stages: vk::PipelineStageFlags) {}

    /// Finish threaded recording before the buffer is handed to submission.
    fn end_recording(&mut self) {}
}
