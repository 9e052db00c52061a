//! The render graph: pass and resource registries, the `bake()` planning
//! driver, and the per-frame entry points.

pub mod barrier;
pub mod debug;
mod physical;
pub mod render_pass;
mod schedule;
mod submit;

pub use submit::{PhysicalBuffer, PhysicalImage};

use std::collections::{HashMap, HashSet};

use anyhow::Result;
use ash::vk;

use crate::device::{ImplementationQuirks, SemaphoreHandle};
use crate::error::Error;
use crate::format::surface_transform_swaps_xy;
use crate::graph::barrier::Barriers;
use crate::graph::render_pass::PhysicalPass;
use crate::graph::submit::PipelineEvent;
use crate::pass::{PassBuilder, RenderPass};
use crate::queue::RenderGraphQueueFlags;
use crate::resource::{RenderResource, ResourceDimensions, ResourceType, SizeClass};

pub use crate::device::ImageHandle;

/// Frame-level render graph.
///
/// Declare passes with [`add_pass`](Self::add_pass), point the graph at the
/// resource that becomes the backbuffer, then [`bake`](Self::bake) once. Per
/// frame, [`setup_attachments`](Self::setup_attachments) realises physical
/// images and buffers and
/// [`enqueue_render_passes`](Self::enqueue_render_passes) records and submits
/// the frame.
pub struct RenderGraph {
    pub(crate) passes: Vec<RenderPass>,
    pub(crate) resources: Vec<RenderResource>,
    pass_to_index: HashMap<String, usize>,
    pub(crate) resource_to_index: HashMap<String, usize>,
    pub(crate) backbuffer_source: String,
    pub(crate) swapchain_dimensions: ResourceDimensions,
    pub(crate) quirks: ImplementationQuirks,
    pub(crate) enabled_timestamps: bool,

    // Artifacts of bake().
    pub(crate) pass_stack: Vec<usize>,
    pub(crate) pass_dependencies: Vec<HashSet<usize>>,
    pub(crate) pass_merge_dependencies: Vec<HashSet<usize>>,
    pub(crate) physical_dimensions: Vec<ResourceDimensions>,
    pub(crate) physical_aliases: Vec<Option<usize>>,
    pub(crate) physical_image_has_history: Vec<bool>,
    pub(crate) physical_passes: Vec<PhysicalPass>,
    pub(crate) pass_barriers: Vec<Barriers>,
    pub(crate) swapchain_physical_index: Option<usize>,
    baked: bool,

    // Per-frame state.
    pub(crate) physical_events: Vec<PipelineEvent>,
    pub(crate) physical_history_events: Vec<PipelineEvent>,
    pub(crate) physical_attachments: Vec<Option<ImageHandle>>,
    pub(crate) physical_image_attachments: Vec<Option<PhysicalImage>>,
    pub(crate) physical_history_image_attachments: Vec<Option<PhysicalImage>>,
    pub(crate) physical_buffers: Vec<Option<PhysicalBuffer>>,
    pub(crate) swapchain_attachment: Option<ImageHandle>,
    pub(crate) waited_semaphores: HashSet<SemaphoreHandle>,
}

impl Default for RenderGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl RenderGraph {
    pub fn new() -> Self {
        Self {
            passes: Vec::new(),
            resources: Vec::new(),
            pass_to_index: HashMap::new(),
            resource_to_index: HashMap::new(),
            backbuffer_source: "backbuffer".to_owned(),
            swapchain_dimensions: ResourceDimensions::default(),
            quirks: ImplementationQuirks::default(),
            enabled_timestamps: false,
            pass_stack: Vec::new(),
            pass_dependencies: Vec::new(),
            pass_merge_dependencies: Vec::new(),
            physical_dimensions: Vec::new(),
            physical_aliases: Vec::new(),
            physical_image_has_history: Vec::new(),
            physical_passes: Vec::new(),
            pass_barriers: Vec::new(),
            swapchain_physical_index: None,
            baked: false,
            physical_events: Vec::new(),
            physical_history_events: Vec::new(),
            physical_attachments: Vec::new(),
            physical_image_attachments: Vec::new(),
            physical_history_image_attachments: Vec::new(),
            physical_buffers: Vec::new(),
            swapchain_attachment: None,
            waited_semaphores: HashSet::new(),
        }
    }

    /// Add a pass, or return the existing one with this name.
    pub fn add_pass(&mut self, name: &str, queue: RenderGraphQueueFlags) -> PassBuilder<'_> {
        let index = match self.pass_to_index.get(name) {
            Some(&index) => index,
            None => {
                let index = self.passes.len();
                self.passes.push(RenderPass::new(index, name, queue));
                self.pass_to_index.insert(name.to_owned(), index);
                index
            }
        };
        PassBuilder { graph: self, index }
    }

    /// The named resource becomes the frame's presentation source.
    pub fn set_backbuffer_source(&mut self, name: &str) {
        self.backbuffer_source = name.to_owned();
    }

    /// Dimensions of the true swapchain; swapchain-relative attachments are
    /// sized from these, and the backbuffer can only alias the swapchain when
    /// its planned dimensions match.
    pub fn set_backbuffer_dimensions(&mut self, dim: ResourceDimensions) {
        self.swapchain_dimensions = dim;
    }

    pub fn set_quirks(&mut self, quirks: ImplementationQuirks) {
        self.quirks = quirks;
    }

    pub fn enable_timestamps(&mut self, enable: bool) {
        self.enabled_timestamps = enable;
    }

    pub(crate) fn get_texture_resource_index(&mut self, name: &str) -> usize {
        if let Some(&index) = self.resource_to_index.get(name) {
            debug_assert_eq!(self.resources[index].resource_type(), ResourceType::Texture);
            return index;
        }
        let index = self.resources.len();
        self.resources.push(RenderResource::texture(name));
        self.resource_to_index.insert(name.to_owned(), index);
        index
    }

    pub(crate) fn get_buffer_resource_index(&mut self, name: &str) -> usize {
        if let Some(&index) = self.resource_to_index.get(name) {
            debug_assert_eq!(self.resources[index].resource_type(), ResourceType::Buffer);
            return index;
        }
        let index = self.resources.len();
        self.resources.push(RenderResource::buffer(name));
        self.resource_to_index.insert(name.to_owned(), index);
        index
    }

    /// Look up a pass index by name.
    pub fn pass_index(&self, name: &str) -> Option<usize> {
        self.pass_to_index.get(name).copied()
    }

    /// Name of the pass at `index`.
    pub fn pass_name(&self, index: usize) -> Option<&str> {
        self.passes.get(index).map(|pass| pass.name.as_str())
    }

    /// Look up a resource index by name.
    pub fn resource_index(&self, name: &str) -> Option<usize> {
        self.resource_to_index.get(name).copied()
    }

    /// Physical slot a named resource was planned into.
    pub fn resource_physical_index(&self, name: &str) -> Option<usize> {
        self.resource_index(name)
            .and_then(|index| self.resources[index].physical_index)
    }

    /// Pass names in scheduled order.
    pub fn scheduled_pass_names(&self) -> Vec<&str> {
        self.pass_stack
            .iter()
            .map(|&index| self.passes[index].name.as_str())
            .collect()
    }

    pub fn physical_dimensions(&self) -> &[ResourceDimensions] {
        &self.physical_dimensions
    }

    pub fn physical_passes(&self) -> &[PhysicalPass] {
        &self.physical_passes
    }

    /// For every physical slot, the earlier slot it shares a physical image
    /// with, if any.
    pub fn physical_aliases(&self) -> &[Option<usize>] {
        &self.physical_aliases
    }

    pub fn physical_image_has_history(&self) -> &[bool] {
        &self.physical_image_has_history
    }

    /// The physical slot directly aliasing the swapchain image, or `None`
    /// when the frame ends with a blit to the swapchain.
    pub fn swapchain_physical_index(&self) -> Option<usize> {
        self.swapchain_physical_index
    }

    /// Per scheduled pass, the synthesised invalidate/flush barriers.
    pub fn pass_barriers(&self) -> &[Barriers] {
        &self.pass_barriers
    }

    pub(crate) fn require_baked(&self) -> Result<()> {
        if self.baked {
            Ok(())
        } else {
            Err(Error::NotBaked.into())
        }
    }

    /// Plan the frame: discover and order the passes required for the
    /// backbuffer, assign physical resources, merge subpasses, and synthesise
    /// all synchronisation. Fatal declaration errors surface here.
    pub fn bake(&mut self) -> Result<()> {
        // Toss artifacts of a previous bake so a graph can be rebaked after
        // swapchain changes without an explicit reset().
        self.baked = false;
        for resource in &mut self.resources {
            resource.physical_index = None;
        }
        for pass in &mut self.passes {
            pass.physical_pass_index = None;
        }
        self.pass_stack.clear();
        self.physical_dimensions.clear();
        self.physical_aliases.clear();
        self.physical_image_has_history.clear();
        self.physical_passes.clear();
        self.pass_barriers.clear();
        self.swapchain_physical_index = None;

        self.validate_passes()?;

        let backbuffer = *self
            .resource_to_index
            .get(&self.backbuffer_source)
            .ok_or_else(|| Error::BackbufferMissing(self.backbuffer_source.clone()))?;

        self.pass_dependencies = vec![HashSet::new(); self.passes.len()];
        self.pass_merge_dependencies = vec![HashSet::new(); self.passes.len()];

        if self.resources[backbuffer].written_in_passes.is_empty() {
            return Err(Error::NoWriter(self.backbuffer_source.clone()).into());
        }

        // Work our way back from the backbuffer and sort out all
        // dependencies. Writer sets are hashed, sort for determinism.
        let mut writers: Vec<usize> = self.resources[backbuffer]
            .written_in_passes
            .iter()
            .copied()
            .collect();
        writers.sort_unstable();

        self.pass_stack.extend_from_slice(&writers);
        for &pass in &writers {
            self.traverse_dependencies(pass, 0)?;
        }

        self.pass_stack.reverse();
        schedule::filter_passes(&mut self.pass_stack);

        // Reorder passes to extract better pipelining.
        let mut stack = std::mem::take(&mut self.pass_stack);
        self.reorder_passes(&mut stack);
        self.pass_stack = stack;

        // Figure out which physical resources we need, aliasing renames
        // (depth input -> depth output is one physical attachment).
        self.build_physical_resources()?;

        // Try to merge adjacent passes together.
        self.build_physical_passes();

        // If an image is only used in a single physical pass, make it
        // transient.
        self.build_transients();

        self.build_render_pass_info();

        // For each pass in isolation, figure out the barriers required.
        self.build_barriers()?;

        self.decide_swapchain_alias(backbuffer)?;

        // Fold per-pass barriers into physical pass boundaries. Some are
        // implicit (transients), some redundant (same texture read in
        // multiple subpasses).
        self.build_physical_barriers();

        // Figure out which images can alias, and the virtual transfer
        // barriers which hand event state from one alias to the next.
        self.build_aliases();

        self.mask_stores_for_transients();

        self.baked = true;
        Ok(())
    }

    /// Check whether the backbuffer resource can directly alias the swapchain
    /// image, or whether the frame needs a final blit.
    fn decide_swapchain_alias(&mut self, backbuffer: usize) -> Result<()> {
        let index = self.resources[backbuffer]
            .physical_index
            .ok_or_else(|| Error::NoWriter(self.backbuffer_source.clone()))?;
        self.swapchain_physical_index = Some(index);

        // If the resource is touched in async compute we cannot alias with
        // the swapchain. If it is not transient it lives across multiple
        // physical passes, and implicit subpass dependencies cannot cover it.
        let can_alias = !self.physical_dimensions[index]
            .queues
            .intersects(RenderGraphQueueFlags::COMPUTE_QUEUES)
            && self.physical_dimensions[index].transient;

        // Resources which do not alias with the backbuffer are never
        // pre-rotated.
        for (i, dim) in self.physical_dimensions.iter_mut().enumerate() {
            if i != index {
                dim.transform = vk::SurfaceTransformFlagsKHR::IDENTITY;
            }
        }

        info!(
            "Backbuffer transform: {:?}",
            self.physical_dimensions[index].transform
        );

        {
            let dim = &mut self.physical_dimensions[index];
            if surface_transform_swaps_xy(dim.transform) {
                std::mem::swap(&mut dim.width, &mut dim.height);
            }
            dim.transient = false;
            dim.persistent = self.swapchain_dimensions.persistent;
        }

        if !can_alias || self.physical_dimensions[index] != self.swapchain_dimensions {
            warn!("Cannot alias with backbuffer, requires extra blit pass!");
            warn!(
                "  Backbuffer: {} x {}, fmt: {:?}",
                self.physical_dimensions[index].width,
                self.physical_dimensions[index].height,
                self.physical_dimensions[index].format
            );
            warn!(
                "  Swapchain: {} x {}, fmt: {:?}",
                self.swapchain_dimensions.width,
                self.swapchain_dimensions.height,
                self.swapchain_dimensions.format
            );

            self.swapchain_physical_index = None;
            let dim = &mut self.physical_dimensions[index];
            if !dim.queues.contains(RenderGraphQueueFlags::GRAPHICS) {
                dim.queues |= RenderGraphQueueFlags::ASYNC_GRAPHICS;
            } else {
                dim.queues |= RenderGraphQueueFlags::GRAPHICS;
            }

            // The final blit samples from the image.
            dim.image_usage |= vk::ImageUsageFlags::SAMPLED;

            // No pre-transform without swapchain aliasing.
            if surface_transform_swaps_xy(dim.transform) {
                std::mem::swap(&mut dim.width, &mut dim.height);
            }
            dim.transform = vk::SurfaceTransformFlagsKHR::IDENTITY;
        } else {
            self.physical_dimensions[index].transient = true;
        }
        Ok(())
    }

    /// Transient attachments have no backing store to write out; drop their
    /// store bits. The swapchain alias keeps its store.
    fn mask_stores_for_transients(&mut self) {
        let swapchain = self.swapchain_physical_index;
        for physical_pass in &mut self.physical_passes {
            for (slot, &attachment) in physical_pass.physical_color_attachments.iter().enumerate() {
                if self.physical_dimensions[attachment].transient && Some(attachment) != swapchain {
                    physical_pass.render_pass_info.store_attachments &= !(1u32 << slot);
                }
            }
            if let Some(ds) = physical_pass.physical_depth_stencil_attachment {
                if self.physical_dimensions[ds].transient {
                    physical_pass.render_pass_info.op_flags -=
                        crate::device::RenderPassOpFlags::STORE_DEPTH_STENCIL;
                }
            }
        }
    }

    fn validate_passes(&mut self) -> Result<()> {
        for pass_index in 0..self.passes.len() {
            {
                let pass = &self.passes[pass_index];
                if pass.color_inputs.len() != pass.color_outputs.len() {
                    return Err(Error::MismatchedInputOutput("color").into());
                }
                if pass.storage_inputs.len() != pass.storage_outputs.len() {
                    return Err(Error::MismatchedInputOutput("storage").into());
                }
                if pass.blit_texture_inputs.len() != pass.blit_texture_outputs.len() {
                    return Err(Error::MismatchedInputOutput("blit").into());
                }
                if pass.storage_texture_inputs.len() != pass.storage_texture_outputs.len() {
                    return Err(Error::MismatchedInputOutput("storage texture").into());
                }
                if !pass.resolve_outputs.is_empty()
                    && pass.resolve_outputs.len() != pass.color_outputs.len()
                {
                    return Err(Error::MismatchedInputOutput("resolve").into());
                }
            }

            // A color input with different dimensions than its output cannot
            // be kept on-tile; demote it to a scaled readback.
            for i in 0..self.passes[pass_index].color_inputs.len() {
                let Some(input) = self.passes[pass_index].color_inputs[i] else {
                    continue;
                };
                let output = self.passes[pass_index].color_outputs[i];
                if self.resource_dimensions(input)? != self.resource_dimensions(output)? {
                    self.passes[pass_index].make_color_input_scaled(i);
                }
            }

            let pass = &self.passes[pass_index];
            for (i, input) in pass.storage_inputs.iter().enumerate() {
                let Some(input) = *input else { continue };
                let output = pass.storage_outputs[i];
                if self.resources[input].buffer_info() != self.resources[output].buffer_info() {
                    return Err(
                        Error::MismatchedDimensions(self.resources[input].name.clone()).into(),
                    );
                }
            }

            for (i, input) in pass.blit_texture_inputs.iter().enumerate() {
                let Some(input) = *input else { continue };
                let output = pass.blit_texture_outputs[i];
                if self.resource_dimensions(input)? != self.resource_dimensions(output)? {
                    return Err(
                        Error::MismatchedDimensions(self.resources[input].name.clone()).into(),
                    );
                }
            }

            for (i, input) in pass.storage_texture_inputs.iter().enumerate() {
                let Some(input) = *input else { continue };
                let output = pass.storage_texture_outputs[i];
                if self.resource_dimensions(input)? != self.resource_dimensions(output)? {
                    return Err(
                        Error::MismatchedDimensions(self.resources[input].name.clone()).into(),
                    );
                }
            }

            if let (Some(input), Some(output)) =
                (pass.depth_stencil_input, pass.depth_stencil_output)
            {
                if self.resource_dimensions(input)? != self.resource_dimensions(output)? {
                    return Err(
                        Error::MismatchedDimensions(self.resources[input].name.clone()).into(),
                    );
                }
            }
        }
        Ok(())
    }

    /// Materialise the dimensions of a logical resource against the current
    /// swapchain dimensions.
    pub(crate) fn resource_dimensions(&self, index: usize) -> Result<ResourceDimensions> {
        match self.resources[index].resource_type() {
            ResourceType::Buffer => {
                let resource = &self.resources[index];
                let info = *resource.buffer_info();
                let mut dim = ResourceDimensions {
                    buffer_info: info,
                    persistent: info.persistent,
                    name: resource.name.clone(),
                    queues: resource.used_queues,
                    ..Default::default()
                };
                dim.buffer_info.usage |= resource.buffer_usage();
                Ok(dim)
            }
            ResourceType::Texture => self.texture_dimensions(index),
        }
    }

    fn texture_dimensions(&self, index: usize) -> Result<ResourceDimensions> {
        let resource = &self.resources[index];
        let info = resource.attachment_info();
        let mut dim = ResourceDimensions {
            layers: info.layers,
            samples: info.samples,
            format: info.format,
            persistent: info.persistent,
            unorm_srgb: info.unorm_srgb_alias,
            queues: resource.used_queues,
            image_usage: info.aux_usage | resource.image_usage(),
            name: resource.name.clone(),
            ..Default::default()
        };

        // Pre-rotate only sticks if this resource ends up aliasing the
        // swapchain.
        if info.supports_prerotate {
            dim.transform = self.swapchain_dimensions.transform;
        }

        match info.size_class {
            SizeClass::SwapchainRelative => {
                dim.width =
                    (((info.size_x * self.swapchain_dimensions.width as f32).ceil()) as u32).max(1);
                dim.height = (((info.size_y * self.swapchain_dimensions.height as f32).ceil())
                    as u32)
                    .max(1);
                dim.depth = (info.size_z.ceil() as u32).max(1);
                if surface_transform_swaps_xy(self.swapchain_dimensions.transform) {
                    std::mem::swap(&mut dim.width, &mut dim.height);
                }
            }
            SizeClass::Absolute => {
                dim.width = (info.size_x as u32).max(1);
                dim.height = (info.size_y as u32).max(1);
                dim.depth = (info.size_z as u32).max(1);
            }
            SizeClass::InputRelative => {
                let name = info
                    .size_relative_name
                    .as_deref()
                    .ok_or_else(|| Error::ResourceMissing(resource.name.clone()))?;
                let input = *self
                    .resource_to_index
                    .get(name)
                    .ok_or_else(|| Error::ResourceMissing(name.to_owned()))?;
                let input_dim = self.texture_dimensions(input)?;
                dim.width = (((info.size_x * input_dim.width as f32).ceil()) as u32).max(1);
                dim.height = (((info.size_y * input_dim.height as f32).ceil()) as u32).max(1);
                dim.depth = (((info.size_z * input_dim.depth as f32).ceil()) as u32).max(1);
            }
        }

        if dim.format == vk::Format::UNDEFINED {
            dim.format = self.swapchain_dimensions.format;
        }

        dim.levels = num_levels(dim.width, dim.height, dim.depth).min(if info.levels == 0 {
            u32::MAX
        } else {
            info.levels
        });
        Ok(dim)
    }

    /// Dump the baked frame plan through the `log` crate.
    pub fn log(&self) {
        for (index, resource) in self.physical_dimensions.iter().enumerate() {
            if resource.buffer_info.size != 0 {
                info!(
                    "Resource #{} ({}): size: {}",
                    index, resource.name, resource.buffer_info.size
                );
            } else {
                info!(
                    "Resource #{} ({}): {} x {} (fmt: {:?}), samples: {}, transient: {}{}",
                    index,
                    resource.name,
                    resource.width,
                    resource.height,
                    resource.format,
                    resource.samples,
                    if resource.transient { "yes" } else { "no" },
                    if Some(index) == self.swapchain_physical_index {
                        " (swapchain)"
                    } else {
                        ""
                    }
                );
            }
        }

        let swap_str = |index: usize| -> &'static str {
            if Some(index) == self.swapchain_physical_index {
                " (swapchain)"
            } else {
                ""
            }
        };

        let mut barrier_itr = self.pass_barriers.iter();

        for (physical_index, physical_pass) in self.physical_passes.iter().enumerate() {
            info!("Physical pass #{}:", physical_index);

            for barrier in &physical_pass.invalidate {
                info!(
                    "  Invalidate: {}{}, layout: {:?}, access: {:?}, stages: {:?}",
                    barrier.resource_index,
                    swap_str(barrier.resource_index),
                    barrier.layout,
                    barrier.access,
                    barrier.stages
                );
            }

            for (subpass_index, &subpass) in physical_pass.passes.iter().enumerate() {
                let pass = &self.passes[subpass];
                info!("    Subpass #{} ({}):", subpass_index, pass.name);

                if let Some(barriers) = barrier_itr.next() {
                    for barrier in &barriers.invalidate {
                        if !self.physical_dimensions[barrier.resource_index].transient {
                            info!(
                                "      Invalidate: {}{}, layout: {:?}, access: {:?}, stages: {:?}",
                                barrier.resource_index,
                                swap_str(barrier.resource_index),
                                barrier.layout,
                                barrier.access,
                                barrier.stages
                            );
                        }
                    }
                    for barrier in &barriers.flush {
                        if !self.physical_dimensions[barrier.resource_index].transient
                            && Some(barrier.resource_index) != self.swapchain_physical_index
                        {
                            info!(
                                "      Flush: {}, layout: {:?}, access: {:?}, stages: {:?}",
                                barrier.resource_index,
                                barrier.layout,
                                barrier.access,
                                barrier.stages
                            );
                        }
                    }
                }

                if let Some(output) = pass.depth_stencil_output {
                    info!(
                        "        DepthStencil RW: {}",
                        self.resources[output].physical_index.unwrap_or(usize::MAX)
                    );
                } else if let Some(input) = pass.depth_stencil_input {
                    info!(
                        "        DepthStencil ReadOnly: {}",
                        self.resources[input].physical_index.unwrap_or(usize::MAX)
                    );
                }

                for (i, output) in pass.color_outputs.iter().enumerate() {
                    info!(
                        "        ColorAttachment #{}: {}",
                        i,
                        self.resources[*output].physical_index.unwrap_or(usize::MAX)
                    );
                }
                for (i, input) in pass.attachment_inputs.iter().enumerate() {
                    info!(
                        "        InputAttachment #{}: {}",
                        i,
                        self.resources[*input].physical_index.unwrap_or(usize::MAX)
                    );
                }
            }

            for barrier in &physical_pass.flush {
                info!(
                    "  Flush: {}{}, layout: {:?}, access: {:?}, stages: {:?}",
                    barrier.resource_index,
                    swap_str(barrier.resource_index),
                    barrier.layout,
                    barrier.access,
                    barrier.stages
                );
            }
        }
    }

    /// Hand the physical buffer array over to the caller, e.g. to reinstall
    /// it after a reset so persistent buffers survive a rebuild.
    pub fn consume_physical_buffers(&self) -> Vec<Option<PhysicalBuffer>> {
        self.physical_buffers.clone()
    }

    pub fn install_physical_buffers(&mut self, buffers: Vec<Option<PhysicalBuffer>>) {
        self.physical_buffers = buffers;
    }

    pub fn consume_persistent_physical_buffer_resource(
        &self,
        index: usize,
    ) -> Option<PhysicalBuffer> {
        self.physical_buffers.get(index).cloned().flatten()
    }

    pub fn install_persistent_physical_buffer_resource(
        &mut self,
        index: usize,
        buffer: PhysicalBuffer,
    ) -> Result<()> {
        if index >= self.physical_buffers.len() {
            return Err(Error::IndexOutOfRange(index).into());
        }
        self.physical_buffers[index] = Some(buffer);
        Ok(())
    }

    /// Drop every declaration and all baked and per-frame state.
    pub fn reset(&mut self) {
        self.passes.clear();
        self.resources.clear();
        self.pass_to_index.clear();
        self.resource_to_index.clear();
        self.pass_stack.clear();
        self.pass_dependencies.clear();
        self.pass_merge_dependencies.clear();
        self.physical_dimensions.clear();
        self.physical_aliases.clear();
        self.physical_image_has_history.clear();
        self.physical_passes.clear();
        self.pass_barriers.clear();
        self.swapchain_physical_index = None;
        self.baked = false;
        self.physical_events.clear();
        self.physical_history_events.clear();
        self.physical_attachments.clear();
        self.physical_image_attachments.clear();
        self.physical_history_image_attachments.clear();
        self.physical_buffers.clear();
        self.swapchain_attachment = None;
        self.waited_semaphores.clear();
    }
}

fn num_levels(width: u32, height: u32, depth: u32) -> u32 {
    let mut levels = 0;
    let mut max_dim = width.max(height).max(depth);
    while max_dim != 0 {
        levels += 1;
        max_dim >>= 1;
    }
    levels
}

static_assertions::assert_impl_all!(RenderGraph: Send);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_level_count() {
        assert_eq!(num_levels(1, 1, 1), 1);
        assert_eq!(num_levels(2, 1, 1), 2);
        assert_eq!(num_levels(1920, 1080, 1), 11);
        assert_eq!(num_levels(256, 256, 1), 9);
    }
}
