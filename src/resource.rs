//! Logical resources declared by passes, and the materialised dimensions of
//! the physical slots they are planned into.

use std::collections::HashSet;

use ash::vk;

use crate::format::format_has_depth_or_stencil_aspect;
use crate::queue::RenderGraphQueueFlags;

/// How the extent of an attachment is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeClass {
    /// Scaled relative to the swapchain dimensions.
    #[default]
    SwapchainRelative,
    /// Fixed size in pixels.
    Absolute,
    /// Scaled relative to another named resource.
    InputRelative,
}

/// Description of a texture attachment.
///
/// A format of [`vk::Format::UNDEFINED`] resolves to the swapchain format.
/// `levels == 0` requests a full mip chain.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentInfo {
    pub size_class: SizeClass,
    pub size_x: f32,
    pub size_y: f32,
    pub size_z: f32,
    pub format: vk::Format,
    /// Resource the extent is derived from for [`SizeClass::InputRelative`].
    pub size_relative_name: Option<String>,
    pub samples: u32,
    pub levels: u32,
    pub layers: u32,
    /// Extra usage bits on top of what declarations accumulate.
    pub aux_usage: vk::ImageUsageFlags,
    /// Keep the backing image alive across bakes when compatible.
    pub persistent: bool,
    /// Create the image with a mutable sRGB view alias.
    pub unorm_srgb_alias: bool,
    /// Allow the attachment to inherit the swapchain pre-rotate transform.
    /// Only honored for the slot that ends up aliasing the swapchain.
    pub supports_prerotate: bool,
}

impl Default for AttachmentInfo {
    fn default() -> Self {
        Self {
            size_class: SizeClass::SwapchainRelative,
            size_x: 1.0,
            size_y: 1.0,
            size_z: 0.0,
            format: vk::Format::UNDEFINED,
            size_relative_name: None,
            samples: 1,
            levels: 1,
            layers: 1,
            aux_usage: vk::ImageUsageFlags::empty(),
            persistent: true,
            unorm_srgb_alias: false,
            supports_prerotate: false,
        }
    }
}

/// Description of a buffer resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub size: vk::DeviceSize,
    pub usage: vk::BufferUsageFlags,
    /// Keep the backing buffer alive across bakes when compatible.
    pub persistent: bool,
}

impl Default for BufferInfo {
    fn default() -> Self {
        Self {
            size: 0,
            usage: vk::BufferUsageFlags::empty(),
            persistent: true,
        }
    }
}

/// Whether a logical resource is a texture or a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Texture,
    Buffer,
}

#[derive(Debug, Clone)]
pub(crate) enum ResourceInfo {
    Texture {
        info: AttachmentInfo,
        image_usage: vk::ImageUsageFlags,
    },
    Buffer {
        info: BufferInfo,
        buffer_usage: vk::BufferUsageFlags,
    },
}

/// One entry in the logical resource registry. Referenced by index only.
#[derive(Debug, Clone)]
pub(crate) struct RenderResource {
    pub name: String,
    pub physical_index: Option<usize>,
    pub used_queues: RenderGraphQueueFlags,
    pub written_in_passes: HashSet<usize>,
    pub read_in_passes: HashSet<usize>,
    pub info: ResourceInfo,
}

impl RenderResource {
    pub fn texture(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            physical_index: None,
            used_queues: RenderGraphQueueFlags::empty(),
            written_in_passes: HashSet::new(),
            read_in_passes: HashSet::new(),
            info: ResourceInfo::Texture {
                info: AttachmentInfo::default(),
                image_usage: vk::ImageUsageFlags::empty(),
            },
        }
    }

    pub fn buffer(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            physical_index: None,
            used_queues: RenderGraphQueueFlags::empty(),
            written_in_passes: HashSet::new(),
            read_in_passes: HashSet::new(),
            info: ResourceInfo::Buffer {
                info: BufferInfo::default(),
                buffer_usage: vk::BufferUsageFlags::empty(),
            },
        }
    }

    pub fn resource_type(&self) -> ResourceType {
        match self.info {
            ResourceInfo::Texture { .. } => ResourceType::Texture,
            ResourceInfo::Buffer { .. } => ResourceType::Buffer,
        }
    }

    pub fn read_in_pass(&mut self, pass: usize) {
        self.read_in_passes.insert(pass);
    }

    pub fn written_in_pass(&mut self, pass: usize) {
        self.written_in_passes.insert(pass);
    }

    pub fn add_queue(&mut self, queue: RenderGraphQueueFlags) {
        self.used_queues |= queue;
    }

    pub fn add_image_usage(&mut self, usage: vk::ImageUsageFlags) {
        match &mut self.info {
            ResourceInfo::Texture { image_usage, .. } => *image_usage |= usage,
            ResourceInfo::Buffer { .. } => unreachable!("image usage on a buffer resource"),
        }
    }

    pub fn add_buffer_usage(&mut self, usage: vk::BufferUsageFlags) {
        match &mut self.info {
            ResourceInfo::Buffer { buffer_usage, .. } => *buffer_usage |= usage,
            ResourceInfo::Texture { .. } => unreachable!("buffer usage on a texture resource"),
        }
    }

    pub fn set_attachment_info(&mut self, new: AttachmentInfo) {
        match &mut self.info {
            ResourceInfo::Texture { info, .. } => *info = new,
            ResourceInfo::Buffer { .. } => unreachable!("attachment info on a buffer resource"),
        }
    }

    pub fn set_buffer_info(&mut self, new: BufferInfo) {
        match &mut self.info {
            ResourceInfo::Buffer { info, .. } => *info = new,
            ResourceInfo::Texture { .. } => unreachable!("buffer info on a texture resource"),
        }
    }

    pub fn attachment_info(&self) -> &AttachmentInfo {
        match &self.info {
            ResourceInfo::Texture { info, .. } => info,
            ResourceInfo::Buffer { .. } => unreachable!("attachment info on a buffer resource"),
        }
    }

    pub fn buffer_info(&self) -> &BufferInfo {
        match &self.info {
            ResourceInfo::Buffer { info, .. } => info,
            ResourceInfo::Texture { .. } => unreachable!("buffer info on a texture resource"),
        }
    }

    pub fn image_usage(&self) -> vk::ImageUsageFlags {
        match &self.info {
            ResourceInfo::Texture { image_usage, .. } => *image_usage,
            ResourceInfo::Buffer { .. } => vk::ImageUsageFlags::empty(),
        }
    }

    pub fn buffer_usage(&self) -> vk::BufferUsageFlags {
        match &self.info {
            ResourceInfo::Buffer { buffer_usage, .. } => *buffer_usage,
            ResourceInfo::Texture { .. } => vk::BufferUsageFlags::empty(),
        }
    }

    /// Copy the descriptor of `other` into this resource, keeping name and
    /// identity. Used by fake write aliases.
    pub fn copy_descriptor_from(&mut self, other: &RenderResource) {
        self.info = other.info.clone();
        self.used_queues = other.used_queues;
        self.read_in_passes.clear();
        self.written_in_passes.clear();
    }
}

/// Fully materialised description of a physical resource slot.
///
/// Equality deliberately ignores `name`, `queues`, `image_usage` and
/// `transient`: two slots with equal dimensions can alias even when their
/// usage differs, the merged usage is propagated afterwards.
#[derive(Debug, Clone)]
pub struct ResourceDimensions {
    pub name: String,
    pub format: vk::Format,
    pub buffer_info: BufferInfo,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub layers: u32,
    pub levels: u32,
    pub samples: u32,
    pub transient: bool,
    pub persistent: bool,
    pub unorm_srgb: bool,
    pub transform: vk::SurfaceTransformFlagsKHR,
    pub queues: RenderGraphQueueFlags,
    pub image_usage: vk::ImageUsageFlags,
}

impl Default for ResourceDimensions {
    fn default() -> Self {
        Self {
            name: String::new(),
            format: vk::Format::UNDEFINED,
            buffer_info: BufferInfo {
                size: 0,
                usage: vk::BufferUsageFlags::empty(),
                persistent: true,
            },
            width: 0,
            height: 0,
            depth: 1,
            layers: 1,
            levels: 1,
            samples: 1,
            transient: false,
            persistent: true,
            unorm_srgb: false,
            transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            queues: RenderGraphQueueFlags::empty(),
            image_usage: vk::ImageUsageFlags::empty(),
        }
    }
}

impl PartialEq for ResourceDimensions {
    fn eq(&self, other: &Self) -> bool {
        self.format == other.format
            && self.buffer_info == other.buffer_info
            && self.width == other.width
            && self.height == other.height
            && self.depth == other.depth
            && self.layers == other.layers
            && self.levels == other.levels
            && self.samples == other.samples
            && self.persistent == other.persistent
            && self.unorm_srgb == other.unorm_srgb
            && self.transform == other.transform
    }
}

impl Eq for ResourceDimensions {}

impl ResourceDimensions {
    pub fn is_storage_image(&self) -> bool {
        self.image_usage.contains(vk::ImageUsageFlags::STORAGE)
    }

    pub fn is_buffer_like(&self) -> bool {
        self.is_storage_image() || self.buffer_info.size != 0
    }

    pub fn has_depth_or_stencil(&self) -> bool {
        format_has_depth_or_stencil_aspect(self.format)
    }

    /// A resource consumed from more than one physical queue has to publish
    /// semaphores; a single queue can use pipeline events instead.
    pub fn uses_semaphore(&self) -> bool {
        self.queues.spans_multiple_physical_queues()
    }
}
