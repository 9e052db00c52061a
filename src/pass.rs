//! Pass declarations: what a pass reads and writes, on which queue it runs,
//! and the user hooks invoked when the frame is recorded.

use std::sync::Arc;

use ash::vk;

use crate::device::CommandEncoder;
use crate::graph::RenderGraph;
use crate::queue::RenderGraphQueueFlags;
use crate::resource::{AttachmentInfo, BufferInfo};

/// A declared access of a resource with explicit layout, access mask and
/// pipeline stages.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AccessedResource {
    pub resource: usize,
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags,
    pub stages: vk::PipelineStageFlags,
}

/// Records subpass draws or compute dispatches for one pass. The second
/// argument is the layer when the pass renders layers separately.
pub type BuildRenderPassFn = dyn Fn(&mut dyn CommandEncoder, u32) + Send + Sync;
/// Returns the clear color for color output `index`, or `None` to skip
/// clearing.
pub type GetClearColorFn = dyn Fn(usize) -> Option<vk::ClearColorValue> + Send + Sync;
/// Returns the depth/stencil clear value, or `None` to skip clearing.
pub type GetClearDepthStencilFn = dyn Fn() -> Option<vk::ClearDepthStencilValue> + Send + Sync;
/// Decides per frame whether the pass needs its GPU work at all.
pub type NeedRenderPassFn = dyn Fn() -> bool + Send + Sync;
/// Per-frame CPU preparation for the given subpass; returns how the subpass
/// contents will be recorded.
pub type EnqueuePrepareFn = dyn Fn(u32) -> vk::SubpassContents + Send + Sync;

/// The optional hooks a pass can install. The graph only ever calls through
/// this record.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub(crate) struct PassCallbacks {
    #[derivative(Debug = "ignore")]
    pub build_render_pass: Option<Arc<BuildRenderPassFn>>,
    #[derivative(Debug = "ignore")]
    pub get_clear_color: Option<Arc<GetClearColorFn>>,
    #[derivative(Debug = "ignore")]
    pub get_clear_depth_stencil: Option<Arc<GetClearDepthStencilFn>>,
    #[derivative(Debug = "ignore")]
    pub need_render_pass: Option<Arc<NeedRenderPassFn>>,
    #[derivative(Debug = "ignore")]
    pub enqueue_prepare_render_pass: Option<Arc<EnqueuePrepareFn>>,
    pub multiview: bool,
}

impl Default for PassCallbacks {
    fn default() -> Self {
        Self {
            build_render_pass: None,
            get_clear_color: None,
            get_clear_depth_stencil: None,
            need_render_pass: None,
            enqueue_prepare_render_pass: None,
            multiview: true,
        }
    }
}

/// One logical unit of GPU work bound to a single queue kind. All resource
/// references are indices into the graph's resource registry; paired
/// input/output lists are index-aligned, with `None` marking write-only
/// entries.
#[derive(Debug)]
pub(crate) struct RenderPass {
    pub index: usize,
    pub name: String,
    pub queue: RenderGraphQueueFlags,
    pub physical_pass_index: Option<usize>,

    pub color_outputs: Vec<usize>,
    pub color_inputs: Vec<Option<usize>>,
    pub color_scale_inputs: Vec<Option<usize>>,
    pub resolve_outputs: Vec<usize>,
    pub storage_outputs: Vec<usize>,
    pub storage_inputs: Vec<Option<usize>>,
    pub storage_texture_outputs: Vec<usize>,
    pub storage_texture_inputs: Vec<Option<usize>>,
    pub blit_texture_outputs: Vec<usize>,
    pub blit_texture_inputs: Vec<Option<usize>>,
    pub transfer_outputs: Vec<usize>,
    pub attachment_inputs: Vec<usize>,
    pub history_inputs: Vec<usize>,
    pub generic_texture: Vec<AccessedResource>,
    pub generic_buffer: Vec<AccessedResource>,
    pub depth_stencil_input: Option<usize>,
    pub depth_stencil_output: Option<usize>,
    pub fake_resource_aliases: Vec<(usize, usize)>,

    pub callbacks: PassCallbacks,
}

impl RenderPass {
    pub fn new(index: usize, name: &str, queue: RenderGraphQueueFlags) -> Self {
        Self {
            index,
            name: name.to_owned(),
            queue,
            physical_pass_index: None,
            color_outputs: Vec::new(),
            color_inputs: Vec::new(),
            color_scale_inputs: Vec::new(),
            resolve_outputs: Vec::new(),
            storage_outputs: Vec::new(),
            storage_inputs: Vec::new(),
            storage_texture_outputs: Vec::new(),
            storage_texture_inputs: Vec::new(),
            blit_texture_outputs: Vec::new(),
            blit_texture_inputs: Vec::new(),
            transfer_outputs: Vec::new(),
            attachment_inputs: Vec::new(),
            history_inputs: Vec::new(),
            generic_texture: Vec::new(),
            generic_buffer: Vec::new(),
            depth_stencil_input: None,
            depth_stencil_output: None,
            fake_resource_aliases: Vec::new(),
            callbacks: PassCallbacks::default(),
        }
    }

    pub fn need_render_pass(&self) -> bool {
        self.callbacks
            .need_render_pass
            .as_ref()
            .map_or(true, |cb| (**cb)())
    }

    /// A pass whose GPU work can be skipped at runtime; resources it writes
    /// must not be aliased since their contents might survive the frame.
    pub fn may_not_need_render_pass(&self) -> bool {
        self.callbacks.need_render_pass.is_some()
    }

    pub fn get_clear_color(&self, index: usize) -> Option<vk::ClearColorValue> {
        self.callbacks
            .get_clear_color
            .as_ref()
            .and_then(|cb| (**cb)(index))
    }

    pub fn get_clear_depth_stencil(&self) -> Option<vk::ClearDepthStencilValue> {
        self.callbacks
            .get_clear_depth_stencil
            .as_ref()
            .and_then(|cb| (**cb)())
    }

    pub fn render_pass_is_multiview(&self) -> bool {
        self.callbacks.multiview
    }

    /// Demote the color input at `index` to a scaled input. Scaled inputs are
    /// resampled with a fullscreen blit at subpass start instead of being
    /// loaded as an attachment.
    pub fn make_color_input_scaled(&mut self, index: usize) {
        std::mem::swap(
            &mut self.color_scale_inputs[index],
            &mut self.color_inputs[index],
        );
    }
}

/// Declaration proxy returned by [`RenderGraph::add_pass`].
///
/// Every declaration updates both the pass and the resource registry, so the
/// builder holds the graph borrow until dropped.
pub struct PassBuilder<'graph> {
    pub(crate) graph: &'graph mut RenderGraph,
    pub(crate) index: usize,
}

impl<'graph> PassBuilder<'graph> {
    fn queue(&self) -> RenderGraphQueueFlags {
        self.graph.passes[self.index].queue
    }

    /// Default shader stage for inputs that did not declare one.
    fn default_shader_stages(&self) -> vk::PipelineStageFlags {
        if self.queue().is_compute() {
            vk::PipelineStageFlags::COMPUTE_SHADER
        } else {
            vk::PipelineStageFlags::FRAGMENT_SHADER
        }
    }

    /// Index of the pass being declared.
    pub fn pass_index(&self) -> usize {
        self.index
    }

    pub fn add_attachment_input(&mut self, name: &str) -> usize {
        let queue = self.queue();
        let res = self.graph.get_texture_resource_index(name);
        let resource = &mut self.graph.resources[res];
        resource.add_queue(queue);
        resource.read_in_pass(self.index);
        resource.add_image_usage(vk::ImageUsageFlags::INPUT_ATTACHMENT);
        self.graph.passes[self.index].attachment_inputs.push(res);
        res
    }

    /// Read a resource written by this graph in the previous frame. The
    /// backing image is retained across frames and swapped with the current
    /// one at the start of each frame.
    pub fn add_history_input(&mut self, name: &str) -> usize {
        let queue = self.queue();
        let res = self.graph.get_texture_resource_index(name);
        let resource = &mut self.graph.resources[res];
        resource.add_queue(queue);
        resource.add_image_usage(vk::ImageUsageFlags::SAMPLED);
        // History inputs are not read in any particular pass, but next frame.
        self.graph.passes[self.index].history_inputs.push(res);
        res
    }

    pub fn add_generic_buffer_input(
        &mut self,
        name: &str,
        stages: vk::PipelineStageFlags,
        access: vk::AccessFlags,
        usage: vk::BufferUsageFlags,
    ) -> usize {
        let queue = self.queue();
        let res = self.graph.get_buffer_resource_index(name);
        let resource = &mut self.graph.resources[res];
        resource.add_queue(queue);
        resource.read_in_pass(self.index);
        resource.add_buffer_usage(usage);

        self.graph.passes[self.index]
            .generic_buffer
            .push(AccessedResource {
                resource: res,
                layout: vk::ImageLayout::GENERAL,
                access,
                stages,
            });
        res
    }

    pub fn add_vertex_buffer_input(&mut self, name: &str) -> usize {
        self.add_generic_buffer_input(
            name,
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )
    }

    pub fn add_index_buffer_input(&mut self, name: &str) -> usize {
        self.add_generic_buffer_input(
            name,
            vk::PipelineStageFlags::VERTEX_INPUT,
            vk::AccessFlags::INDEX_READ,
            vk::BufferUsageFlags::INDEX_BUFFER,
        )
    }

    pub fn add_indirect_buffer_input(&mut self, name: &str) -> usize {
        self.add_generic_buffer_input(
            name,
            vk::PipelineStageFlags::DRAW_INDIRECT,
            vk::AccessFlags::INDIRECT_COMMAND_READ,
            vk::BufferUsageFlags::INDIRECT_BUFFER,
        )
    }

    pub fn add_uniform_input(&mut self, name: &str, stages: vk::PipelineStageFlags) -> usize {
        let stages = if stages.is_empty() {
            self.default_shader_stages()
        } else {
            stages
        };
        self.add_generic_buffer_input(
            name,
            stages,
            vk::AccessFlags::UNIFORM_READ,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
        )
    }

    pub fn add_storage_read_only_input(
        &mut self,
        name: &str,
        stages: vk::PipelineStageFlags,
    ) -> usize {
        let stages = if stages.is_empty() {
            self.default_shader_stages()
        } else {
            stages
        };
        self.add_generic_buffer_input(
            name,
            stages,
            vk::AccessFlags::SHADER_READ,
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )
    }

    /// Write a storage buffer, optionally reading `input` as the
    /// read-modify-write source. Input and output share one physical slot.
    pub fn add_storage_output(
        &mut self,
        name: &str,
        info: BufferInfo,
        input: Option<&str>,
    ) -> usize {
        let queue = self.queue();
        let res = self.graph.get_buffer_resource_index(name);
        let resource = &mut self.graph.resources[res];
        resource.add_queue(queue);
        resource.set_buffer_info(info);
        resource.written_in_pass(self.index);
        resource.add_buffer_usage(vk::BufferUsageFlags::STORAGE_BUFFER);
        self.graph.passes[self.index].storage_outputs.push(res);

        if let Some(input) = input {
            let input_res = self.graph.get_buffer_resource_index(input);
            let resource = &mut self.graph.resources[input_res];
            resource.read_in_pass(self.index);
            resource.add_buffer_usage(vk::BufferUsageFlags::STORAGE_BUFFER);
            self.graph.passes[self.index]
                .storage_inputs
                .push(Some(input_res));
        } else {
            self.graph.passes[self.index].storage_inputs.push(None);
        }
        res
    }

    pub fn add_transfer_output(&mut self, name: &str, info: BufferInfo) -> usize {
        let queue = self.queue();
        let res = self.graph.get_buffer_resource_index(name);
        let resource = &mut self.graph.resources[res];
        resource.add_queue(queue);
        resource.set_buffer_info(info);
        resource.written_in_pass(self.index);
        resource.add_buffer_usage(vk::BufferUsageFlags::TRANSFER_DST);
        self.graph.passes[self.index].transfer_outputs.push(res);
        res
    }

    /// Sample a texture written by another pass. Duplicate declarations of
    /// the same texture merge their stage masks.
    pub fn add_texture_input(&mut self, name: &str, stages: vk::PipelineStageFlags) -> usize {
        let default_stages = self.default_shader_stages();
        let queue = self.queue();
        let res = self.graph.get_texture_resource_index(name);
        let resource = &mut self.graph.resources[res];
        resource.add_queue(queue);
        resource.read_in_pass(self.index);
        resource.add_image_usage(vk::ImageUsageFlags::SAMPLED);

        let stages = if stages.is_empty() {
            default_stages
        } else {
            stages
        };

        let pass = &mut self.graph.passes[self.index];
        if let Some(existing) = pass
            .generic_texture
            .iter_mut()
            .find(|acc| acc.resource == res)
        {
            existing.stages |= stages;
            return res;
        }

        pass.generic_texture.push(AccessedResource {
            resource: res,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            access: vk::AccessFlags::SHADER_READ,
            stages,
        });
        res
    }

    pub fn add_resolve_output(&mut self, name: &str, info: AttachmentInfo) -> usize {
        let queue = self.queue();
        let res = self.graph.get_texture_resource_index(name);
        let resource = &mut self.graph.resources[res];
        resource.add_queue(queue);
        resource.written_in_pass(self.index);
        resource.set_attachment_info(info);
        resource.add_image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT);
        self.graph.passes[self.index].resolve_outputs.push(res);
        res
    }

    /// Write a color attachment, optionally reading `input` as the
    /// read-modify-write source. If the input dimensions do not match the
    /// output, validation demotes the input to a scaled input.
    pub fn add_color_output(
        &mut self,
        name: &str,
        info: AttachmentInfo,
        input: Option<&str>,
    ) -> usize {
        let queue = self.queue();
        let res = self.graph.get_texture_resource_index(name);
        let levels = info.levels;
        let resource = &mut self.graph.resources[res];
        resource.add_queue(queue);
        resource.written_in_pass(self.index);
        resource.set_attachment_info(info);
        resource.add_image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT);

        if levels != 1 {
            resource.add_image_usage(
                vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC,
            );
        }

        self.graph.passes[self.index].color_outputs.push(res);

        if let Some(input) = input {
            let input_res = self.graph.get_texture_resource_index(input);
            let resource = &mut self.graph.resources[input_res];
            resource.read_in_pass(self.index);
            resource.add_image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT);
            let pass = &mut self.graph.passes[self.index];
            pass.color_inputs.push(Some(input_res));
            pass.color_scale_inputs.push(None);
        } else {
            let pass = &mut self.graph.passes[self.index];
            pass.color_inputs.push(None);
            pass.color_scale_inputs.push(None);
        }
        res
    }

    pub fn add_storage_texture_output(
        &mut self,
        name: &str,
        info: AttachmentInfo,
        input: Option<&str>,
    ) -> usize {
        let queue = self.queue();
        let res = self.graph.get_texture_resource_index(name);
        let resource = &mut self.graph.resources[res];
        resource.add_queue(queue);
        resource.written_in_pass(self.index);
        resource.set_attachment_info(info);
        resource.add_image_usage(vk::ImageUsageFlags::STORAGE);
        self.graph.passes[self.index].storage_texture_outputs.push(res);

        if let Some(input) = input {
            let input_res = self.graph.get_texture_resource_index(input);
            let resource = &mut self.graph.resources[input_res];
            resource.read_in_pass(self.index);
            resource.add_image_usage(vk::ImageUsageFlags::STORAGE);
            self.graph.passes[self.index]
                .storage_texture_inputs
                .push(Some(input_res));
        } else {
            self.graph.passes[self.index].storage_texture_inputs.push(None);
        }
        res
    }

    pub fn add_blit_texture_output(
        &mut self,
        name: &str,
        info: AttachmentInfo,
        input: Option<&str>,
    ) -> usize {
        let queue = self.queue();
        let res = self.graph.get_texture_resource_index(name);
        let resource = &mut self.graph.resources[res];
        resource.add_queue(queue);
        resource.written_in_pass(self.index);
        resource.set_attachment_info(info);
        resource.add_image_usage(vk::ImageUsageFlags::TRANSFER_DST);
        self.graph.passes[self.index].blit_texture_outputs.push(res);

        if let Some(input) = input {
            let input_res = self.graph.get_texture_resource_index(input);
            let resource = &mut self.graph.resources[input_res];
            resource.read_in_pass(self.index);
            resource.add_image_usage(vk::ImageUsageFlags::TRANSFER_DST);
            self.graph.passes[self.index]
                .blit_texture_inputs
                .push(Some(input_res));
        } else {
            self.graph.passes[self.index].blit_texture_inputs.push(None);
        }
        res
    }

    /// Read a texture as a blit source without writing it back.
    pub fn add_blit_texture_read_only_input(&mut self, name: &str) -> usize {
        let queue = self.queue();
        let res = self.graph.get_texture_resource_index(name);
        let resource = &mut self.graph.resources[res];
        resource.add_queue(queue);
        resource.read_in_pass(self.index);
        resource.add_image_usage(vk::ImageUsageFlags::TRANSFER_SRC);

        self.graph.passes[self.index]
            .generic_texture
            .push(AccessedResource {
                resource: res,
                layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                access: vk::AccessFlags::TRANSFER_READ,
                stages: vk::PipelineStageFlags::TRANSFER,
            });
        res
    }

    pub fn set_depth_stencil_output(&mut self, name: &str, info: AttachmentInfo) -> usize {
        let queue = self.queue();
        let res = self.graph.get_texture_resource_index(name);
        let resource = &mut self.graph.resources[res];
        resource.add_queue(queue);
        resource.written_in_pass(self.index);
        resource.set_attachment_info(info);
        resource.add_image_usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT);
        self.graph.passes[self.index].depth_stencil_output = Some(res);
        res
    }

    pub fn set_depth_stencil_input(&mut self, name: &str) -> usize {
        let queue = self.queue();
        let res = self.graph.get_texture_resource_index(name);
        let resource = &mut self.graph.resources[res];
        resource.add_queue(queue);
        resource.read_in_pass(self.index);
        resource.add_image_usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT);
        self.graph.passes[self.index].depth_stencil_input = Some(res);
        res
    }

    /// Redirect writes: `to` inherits `from`'s descriptor and physical slot,
    /// and is treated as written by this pass. Used to express that a pass
    /// logically renames a resource without copying it.
    pub fn add_fake_resource_write_alias(&mut self, from: &str, to: &str) {
        let from_res = self.graph.get_texture_resource_index(from);
        let to_res = self.graph.get_texture_resource_index(to);

        let from_copy = self.graph.resources[from_res].clone();
        let to_resource = &mut self.graph.resources[to_res];
        to_resource.copy_descriptor_from(&from_copy);
        to_resource.written_in_pass(self.index);

        self.graph.passes[self.index]
            .fake_resource_aliases
            .push((from_res, to_res));
    }

    pub fn set_build_render_pass(
        &mut self,
        cb: impl Fn(&mut dyn CommandEncoder, u32) + Send + Sync + 'static,
    ) {
        self.graph.passes[self.index].callbacks.build_render_pass = Some(Arc::new(cb));
    }

    pub fn set_get_clear_color(
        &mut self,
        cb: impl Fn(usize) -> Option<vk::ClearColorValue> + Send + Sync + 'static,
    ) {
        self.graph.passes[self.index].callbacks.get_clear_color = Some(Arc::new(cb));
    }

    pub fn set_get_clear_depth_stencil(
        &mut self,
        cb: impl Fn() -> Option<vk::ClearDepthStencilValue> + Send + Sync + 'static,
    ) {
        self.graph.passes[self.index].callbacks.get_clear_depth_stencil = Some(Arc::new(cb));
    }

    pub fn set_need_render_pass(&mut self, cb: impl Fn() -> bool + Send + Sync + 'static) {
        self.graph.passes[self.index].callbacks.need_render_pass = Some(Arc::new(cb));
    }

    pub fn set_enqueue_prepare_render_pass(
        &mut self,
        cb: impl Fn(u32) -> vk::SubpassContents + Send + Sync + 'static,
    ) {
        self.graph.passes[self.index]
            .callbacks
            .enqueue_prepare_render_pass = Some(Arc::new(cb));
    }

    /// Choose between multiview rendering and separate per-layer passes when
    /// the attachments are layered.
    pub fn set_render_pass_multiview(&mut self, multiview: bool) {
        self.graph.passes[self.index].callbacks.multiview = multiview;
    }
}
