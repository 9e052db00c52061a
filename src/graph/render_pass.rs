//! Physical pass planning: merge compatible consecutive graphics passes into
//! multi-subpass render passes and build their attachment tables.

use ash::vk;

use crate::device::{DepthStencilMode, RenderPassInfo, RenderPassOpFlags, SubpassInfo};
use crate::graph::barrier::Barrier;
use crate::graph::RenderGraph;

/// Clear request for one color attachment, resolved through the owning
/// pass's clear callback at record time.
#[derive(Debug, Clone, Copy)]
pub struct ColorClearRequest {
    /// Pass whose callback provides the clear color.
    pub pass: usize,
    /// Slot in the physical pass's color attachment list.
    pub attachment: usize,
    /// The pass's color output index.
    pub index: usize,
}

/// A color input whose dimensions do not match its output: resampled with an
/// inline fullscreen blit at subpass start.
#[derive(Debug, Clone, Copy)]
pub struct ScaledClearRequest {
    /// Output attachment the resample writes to.
    pub target: u32,
    pub physical_resource: usize,
}

/// Sentinel produced by a multi-level color output: after the pass, the mip
/// chain is regenerated through blits.
#[derive(Debug, Clone, Copy)]
pub struct MipmapRequest {
    pub physical_resource: usize,
    pub stages: vk::PipelineStageFlags,
    pub access: vk::AccessFlags,
    pub layout: vk::ImageLayout,
}

/// A merged group of consecutive passes sharing one render pass object.
/// Compute passes always have physical-pass size 1.
#[derive(Debug, Default)]
pub struct PhysicalPass {
    /// Scheduled pass indices, one per subpass.
    pub passes: Vec<usize>,
    /// De-duplicated physical indices of all color/resolve attachments.
    pub physical_color_attachments: Vec<usize>,
    pub physical_depth_stencil_attachment: Option<usize>,
    pub render_pass_info: RenderPassInfo,
    pub color_clear_requests: Vec<ColorClearRequest>,
    /// Pass whose callback provides the depth clear value.
    pub depth_clear_request: Option<usize>,
    /// Per subpass.
    pub scaled_clear_requests: Vec<Vec<ScaledClearRequest>>,
    pub mipmap_requests: Vec<MipmapRequest>,
    /// Physical resources first written in this pass; their previous contents
    /// are discarded.
    pub discards: Vec<usize>,
    pub invalidate: Vec<Barrier>,
    pub flush: Vec<Barrier>,
    /// Event-state handover edges between aliased slots, applied when this
    /// pass retires.
    pub alias_transfer: Vec<(usize, usize)>,
    /// Layer count shared by all attachments, filled per frame.
    pub layers: u32,
}

impl RenderGraph {
    fn physical_index_of(&self, resource: usize) -> Option<usize> {
        self.resources[resource].physical_index
    }

    fn find_attachment(&self, resource_list: &[usize], resource: Option<usize>) -> bool {
        let Some(resource) = resource else {
            return false;
        };
        let phys = self.physical_index_of(resource);
        phys.is_some()
            && resource_list
                .iter()
                .any(|&candidate| self.physical_index_of(candidate) == phys)
    }

    fn find_attachment_opt(&self, resource_list: &[Option<usize>], resource: Option<usize>) -> bool {
        let Some(resource) = resource else {
            return false;
        };
        let phys = self.physical_index_of(resource);
        phys.is_some()
            && resource_list
                .iter()
                .flatten()
                .any(|&candidate| self.physical_index_of(candidate) == phys)
    }

    fn should_merge(&self, prev_index: usize, next_index: usize) -> bool {
        let prev = &self.passes[prev_index];
        let next = &self.passes[next_index];

        // Only graphics passes on the same queue can merge.
        if prev.queue.is_compute() || next.queue != prev.queue {
            return false;
        }

        if !self.quirks.merge_subpasses {
            return false;
        }

        for &output in &prev.color_outputs {
            // Need to mip-map after this pass, cannot merge.
            if let Some(phys) = self.physical_index_of(output) {
                if self.physical_dimensions[phys].levels > 1 {
                    return false;
                }
            }
        }

        // Non-local dependencies require a real barrier, cannot merge.
        for input in &next.generic_texture {
            if self.find_attachment(&prev.color_outputs, Some(input.resource)) {
                return false;
            }
            if self.find_attachment(&prev.resolve_outputs, Some(input.resource)) {
                return false;
            }
            if self.find_attachment(&prev.storage_texture_outputs, Some(input.resource)) {
                return false;
            }
            if self.find_attachment(&prev.blit_texture_outputs, Some(input.resource)) {
                return false;
            }
            if prev.depth_stencil_output == Some(input.resource) {
                return false;
            }
        }

        for input in &next.generic_buffer {
            if self.find_attachment(&prev.storage_outputs, Some(input.resource)) {
                return false;
            }
        }

        for input in next.blit_texture_inputs.iter().flatten() {
            if self.find_attachment_opt(&prev.blit_texture_inputs, Some(*input)) {
                return false;
            }
        }

        for input in next.storage_inputs.iter().flatten() {
            if self.find_attachment(&prev.storage_outputs, Some(*input)) {
                return false;
            }
        }

        for input in next.storage_texture_inputs.iter().flatten() {
            if self.find_attachment(&prev.storage_texture_outputs, Some(*input)) {
                return false;
            }
        }

        for input in next.color_scale_inputs.iter().flatten() {
            if self.find_attachment(&prev.storage_texture_outputs, Some(*input)) {
                return false;
            }
            if self.find_attachment(&prev.blit_texture_outputs, Some(*input)) {
                return false;
            }
            if self.find_attachment(&prev.color_outputs, Some(*input)) {
                return false;
            }
            if self.find_attachment(&prev.resolve_outputs, Some(*input)) {
                return false;
            }
        }

        let different_attachment = |a: Option<usize>, b: Option<usize>| match (a, b) {
            (Some(a), Some(b)) => self.physical_index_of(a) != self.physical_index_of(b),
            _ => false,
        };
        let same_attachment = |a: Option<usize>, b: Option<usize>| match (a, b) {
            (Some(a), Some(b)) => self.physical_index_of(a) == self.physical_index_of(b),
            _ => false,
        };

        // A different depth attachment breaks up the pass.
        if different_attachment(next.depth_stencil_input, prev.depth_stencil_input) {
            return false;
        }
        if different_attachment(next.depth_stencil_output, prev.depth_stencil_input) {
            return false;
        }
        if different_attachment(next.depth_stencil_input, prev.depth_stencil_output) {
            return false;
        }
        if different_attachment(next.depth_stencil_output, prev.depth_stencil_output) {
            return false;
        }

        for input in next.color_inputs.iter().flatten() {
            if self.find_attachment(&prev.storage_texture_outputs, Some(*input)) {
                return false;
            }
            if self.find_attachment(&prev.blit_texture_outputs, Some(*input)) {
                return false;
            }
        }

        // All failure cases handled; now see if we *want* to merge.

        // Keep color on tile.
        for input in next.color_inputs.iter().flatten() {
            if self.find_attachment(&prev.color_outputs, Some(*input)) {
                return true;
            }
            if self.find_attachment(&prev.resolve_outputs, Some(*input)) {
                return true;
            }
        }

        // Keep depth on tile.
        if same_attachment(next.depth_stencil_input, prev.depth_stencil_input)
            || same_attachment(next.depth_stencil_input, prev.depth_stencil_output)
        {
            return true;
        }

        // Keep color or depth on tile through input attachments.
        for &input in &next.attachment_inputs {
            if self.find_attachment(&prev.color_outputs, Some(input)) {
                return true;
            }
            if self.find_attachment(&prev.resolve_outputs, Some(input)) {
                return true;
            }
            if prev.depth_stencil_output == Some(input) {
                return true;
            }
        }

        // No reason to merge.
        false
    }

    pub(crate) fn build_physical_passes(&mut self) {
        self.physical_passes.clear();

        let mut index = 0;
        while index < self.pass_stack.len() {
            let mut merge_end = index + 1;
            while merge_end < self.pass_stack.len() {
                let mut merge = true;
                for merge_start in index..merge_end {
                    if !self.should_merge(self.pass_stack[merge_start], self.pass_stack[merge_end])
                    {
                        merge = false;
                        break;
                    }
                }
                if !merge {
                    break;
                }
                merge_end += 1;
            }

            let physical_pass = PhysicalPass {
                passes: self.pass_stack[index..merge_end].to_vec(),
                ..Default::default()
            };
            self.physical_passes.push(physical_pass);
            index = merge_end;
        }

        for physical_index in 0..self.physical_passes.len() {
            for subpass in self.physical_passes[physical_index].passes.clone() {
                self.passes[subpass].physical_pass_index = Some(physical_index);
            }
        }
    }

    pub(crate) fn build_render_pass_info(&mut self) {
        for physical_index in 0..self.physical_passes.len() {
            let subpass_passes = self.physical_passes[physical_index].passes.clone();
            let num_subpasses = subpass_passes.len();

            let mut rp = RenderPassInfo {
                store_attachments: !0u32,
                num_layers: 1,
                subpasses: vec![SubpassInfo::default(); num_subpasses],
                ..Default::default()
            };
            let mut colors: Vec<usize> = Vec::new();
            let mut color_clear_requests = Vec::new();
            let mut depth_clear_request = None;
            let mut scaled_clear_requests: Vec<Vec<ScaledClearRequest>> = Vec::new();
            let mut depth_stencil_attachment: Option<usize> = None;

            fn add_unique(colors: &mut Vec<usize>, index: usize) -> (usize, bool) {
                if let Some(pos) = colors.iter().position(|&c| c == index) {
                    (pos, false)
                } else {
                    colors.push(index);
                    (colors.len() - 1, true)
                }
            }

            for (subpass_index, &subpass) in subpass_passes.iter().enumerate() {
                let mut scaled_requests = Vec::new();
                let pass = &self.passes[subpass];

                let num_color_attachments = pass.color_outputs.len();
                for i in 0..num_color_attachments {
                    let phys = self.resources[pass.color_outputs[i]].physical_index.unwrap();
                    let (slot, first_use) = add_unique(&mut colors, phys);
                    rp.subpasses[subpass_index].color_attachments.push(slot as u32);

                    if first_use {
                        // First subpass touching the attachment decides
                        // whether to clear, load, or leave it undefined.
                        let has_color_input =
                            !pass.color_inputs.is_empty() && pass.color_inputs[i].is_some();
                        let has_scaled_color_input = !pass.color_scale_inputs.is_empty()
                            && pass.color_scale_inputs[i].is_some();

                        if !has_color_input && !has_scaled_color_input {
                            if pass.get_clear_color(i).is_some() {
                                rp.clear_attachments |= 1u32 << slot;
                                color_clear_requests.push(ColorClearRequest {
                                    pass: subpass,
                                    attachment: slot,
                                    index: i,
                                });
                            }
                        } else if has_scaled_color_input {
                            scaled_requests.push(ScaledClearRequest {
                                target: i as u32,
                                physical_resource: self.resources
                                    [pass.color_scale_inputs[i].unwrap()]
                                .physical_index
                                .unwrap(),
                            });
                        } else {
                            rp.load_attachments |= 1u32 << slot;
                        }
                    }
                }

                if !pass.resolve_outputs.is_empty() {
                    for i in 0..num_color_attachments {
                        let phys = self.resources[pass.resolve_outputs[i]]
                            .physical_index
                            .unwrap();
                        let (slot, _) = add_unique(&mut colors, phys);
                        // Resolve attachments are always don't-care on load.
                        rp.subpasses[subpass_index]
                            .resolve_attachments
                            .push(slot as u32);
                    }
                }

                scaled_clear_requests.push(scaled_requests);

                let ds_input = pass.depth_stencil_input;
                let ds_output = pass.depth_stencil_output;

                let add_unique_ds = |attachment: &mut Option<usize>, index: usize| -> bool {
                    debug_assert!(attachment.is_none() || *attachment == Some(index));
                    let new_attachment = attachment.is_none();
                    *attachment = Some(index);
                    new_attachment
                };

                match (ds_output, ds_input) {
                    (Some(output), Some(_)) => {
                        let phys = self.resources[output].physical_index.unwrap();
                        if add_unique_ds(&mut depth_stencil_attachment, phys) {
                            // First use in the physical pass, load it.
                            rp.op_flags |= RenderPassOpFlags::LOAD_DEPTH_STENCIL;
                        }
                        rp.op_flags |= RenderPassOpFlags::STORE_DEPTH_STENCIL;
                        rp.subpasses[subpass_index].depth_stencil_mode = DepthStencilMode::ReadWrite;
                    }
                    (Some(output), None) => {
                        let phys = self.resources[output].physical_index.unwrap();
                        if add_unique_ds(&mut depth_stencil_attachment, phys)
                            && pass.get_clear_depth_stencil().is_some()
                        {
                            rp.op_flags |= RenderPassOpFlags::CLEAR_DEPTH_STENCIL;
                            depth_clear_request = Some(subpass);
                        }
                        rp.op_flags |= RenderPassOpFlags::STORE_DEPTH_STENCIL;
                        rp.subpasses[subpass_index].depth_stencil_mode = DepthStencilMode::ReadWrite;
                    }
                    (None, Some(input)) => {
                        let phys = self.resources[input].physical_index.unwrap();
                        if add_unique_ds(&mut depth_stencil_attachment, phys) {
                            rp.op_flags |= RenderPassOpFlags::DEPTH_STENCIL_READ_ONLY
                                | RenderPassOpFlags::LOAD_DEPTH_STENCIL;

                            // A later physical pass reading depth forces a
                            // store, or the attachment turns undefined.
                            let preserve_depth =
                                self.resources[input].read_in_passes.iter().any(|&reader| {
                                    self.passes[reader]
                                        .physical_pass_index
                                        .map_or(false, |phys_pass| phys_pass > physical_index)
                                });
                            if preserve_depth {
                                rp.op_flags |= RenderPassOpFlags::STORE_DEPTH_STENCIL;
                            }
                        }
                        rp.subpasses[subpass_index].depth_stencil_mode = DepthStencilMode::ReadOnly;
                    }
                    (None, None) => {
                        rp.subpasses[subpass_index].depth_stencil_mode = DepthStencilMode::None;
                    }
                }
            }

            // Input attachments in a second loop so depth/stencil input
            // attachments can resolve against the depth slot.
            for (subpass_index, &subpass) in subpass_passes.iter().enumerate() {
                let pass = &self.passes[subpass];
                for &input in &pass.attachment_inputs {
                    let phys = self.resources[input].physical_index.unwrap();
                    let (slot, first_use) = if Some(phys) == depth_stencil_attachment {
                        // The N + 1 attachment refers to depth.
                        (colors.len(), false)
                    } else {
                        add_unique(&mut colors, phys)
                    };
                    rp.subpasses[subpass_index].input_attachments.push(slot as u32);

                    if first_use {
                        rp.load_attachments |= 1u32 << slot;
                    }
                }
            }

            rp.clear_colors = vec![vk::ClearColorValue::default(); colors.len()];

            let physical_pass = &mut self.physical_passes[physical_index];
            physical_pass.render_pass_info = rp;
            physical_pass.physical_color_attachments = colors;
            physical_pass.physical_depth_stencil_attachment = depth_stencil_attachment;
            physical_pass.color_clear_requests = color_clear_requests;
            physical_pass.depth_clear_request = depth_clear_request;
            physical_pass.scaled_clear_requests = scaled_clear_requests;
        }
    }
}
