//! Physical resource planning: assign each logical resource a physical slot,
//! pin read-modify-write pairs and fake aliases to shared slots, promote
//! single-pass images to transients, and alias disjoint-lifetime images.

use anyhow::Result;
use ash::vk;

use crate::error::Error;
use crate::format::format_has_depth_or_stencil_aspect;
use crate::graph::RenderGraph;

impl RenderGraph {
    fn assign_physical_image_slot(
        &mut self,
        resource: usize,
        extra_usage: vk::ImageUsageFlags,
    ) -> Result<()> {
        if self.resources[resource].physical_index.is_none() {
            let mut dim = self.resource_dimensions(resource)?;
            dim.image_usage |= extra_usage;
            self.resources[resource].physical_index = Some(self.physical_dimensions.len());
            self.physical_dimensions.push(dim);
        } else {
            let queues = self.resources[resource].used_queues;
            let usage = self.resources[resource].image_usage() | extra_usage;
            let phys = self.resources[resource].physical_index.unwrap();
            let dim = &mut self.physical_dimensions[phys];
            dim.queues |= queues;
            dim.image_usage |= usage;
        }
        Ok(())
    }

    fn assign_physical_buffer_slot(&mut self, resource: usize) -> Result<()> {
        if self.resources[resource].physical_index.is_none() {
            let dim = self.resource_dimensions(resource)?;
            self.resources[resource].physical_index = Some(self.physical_dimensions.len());
            self.physical_dimensions.push(dim);
        } else {
            let queues = self.resources[resource].used_queues;
            let usage = self.resources[resource].buffer_usage();
            let phys = self.resources[resource].physical_index.unwrap();
            let dim = &mut self.physical_dimensions[phys];
            dim.queues |= queues;
            dim.buffer_info.usage |= usage;
        }
        Ok(())
    }

    /// Read-modify-write outputs share the physical slot of their input.
    fn pin_output_to_input(&mut self, output: usize, input: usize) -> Result<()> {
        let input_phys = self.resources[input].physical_index;
        match self.resources[output].physical_index {
            None => self.resources[output].physical_index = input_phys,
            Some(existing) if Some(existing) != input_phys => {
                return Err(
                    Error::PhysicalIndexConflict(self.resources[output].name.clone()).into(),
                );
            }
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn build_physical_resources(&mut self) -> Result<()> {
        // Inputs before outputs so renames collapse onto the input's slot;
        // input attachments last so they can alias co-subpass attachments.
        for stack_index in 0..self.pass_stack.len() {
            let pass_index = self.pass_stack[stack_index];

            let generic_texture: Vec<usize> = self.passes[pass_index]
                .generic_texture
                .iter()
                .map(|acc| acc.resource)
                .collect();
            for input in generic_texture {
                self.assign_physical_image_slot(input, vk::ImageUsageFlags::empty())?;
            }

            let generic_buffer: Vec<usize> = self.passes[pass_index]
                .generic_buffer
                .iter()
                .map(|acc| acc.resource)
                .collect();
            for input in generic_buffer {
                self.assign_physical_buffer_slot(input)?;
            }

            let scale_inputs: Vec<usize> = self.passes[pass_index]
                .color_scale_inputs
                .iter()
                .flatten()
                .copied()
                .collect();
            for input in scale_inputs {
                // Scaled inputs are read through a sampler.
                self.assign_physical_image_slot(input, vk::ImageUsageFlags::SAMPLED)?;
            }

            let color_pairs: Vec<(usize, Option<usize>)> = self.passes[pass_index]
                .color_outputs
                .iter()
                .copied()
                .zip(self.passes[pass_index].color_inputs.iter().copied())
                .collect();
            for (output, input) in &color_pairs {
                if let Some(input) = *input {
                    self.assign_physical_image_slot(input, vk::ImageUsageFlags::empty())?;
                    self.pin_output_to_input(*output, input)?;
                }
            }

            let storage_pairs: Vec<(usize, Option<usize>)> = self.passes[pass_index]
                .storage_outputs
                .iter()
                .copied()
                .zip(self.passes[pass_index].storage_inputs.iter().copied())
                .collect();
            for (output, input) in &storage_pairs {
                if let Some(input) = *input {
                    self.assign_physical_buffer_slot(input)?;
                    self.pin_output_to_input(*output, input)?;
                }
            }

            let blit_pairs: Vec<(usize, Option<usize>)> = self.passes[pass_index]
                .blit_texture_outputs
                .iter()
                .copied()
                .zip(self.passes[pass_index].blit_texture_inputs.iter().copied())
                .collect();
            for (output, input) in &blit_pairs {
                if let Some(input) = *input {
                    self.assign_physical_image_slot(input, vk::ImageUsageFlags::empty())?;
                    self.pin_output_to_input(*output, input)?;
                }
            }

            let storage_texture_pairs: Vec<(usize, Option<usize>)> = self.passes[pass_index]
                .storage_texture_outputs
                .iter()
                .copied()
                .zip(self.passes[pass_index].storage_texture_inputs.iter().copied())
                .collect();
            for (output, input) in &storage_texture_pairs {
                if let Some(input) = *input {
                    self.assign_physical_image_slot(input, vk::ImageUsageFlags::empty())?;
                    self.pin_output_to_input(*output, input)?;
                }
            }

            for (output, _) in color_pairs {
                self.assign_physical_image_slot(output, vk::ImageUsageFlags::empty())?;
            }

            let resolve_outputs = self.passes[pass_index].resolve_outputs.clone();
            for output in resolve_outputs {
                self.assign_physical_image_slot(output, vk::ImageUsageFlags::empty())?;
            }

            for (output, _) in storage_pairs {
                self.assign_physical_buffer_slot(output)?;
            }

            let transfer_outputs = self.passes[pass_index].transfer_outputs.clone();
            for output in transfer_outputs {
                self.assign_physical_buffer_slot(output)?;
            }

            for (output, _) in blit_pairs {
                self.assign_physical_image_slot(output, vk::ImageUsageFlags::empty())?;
            }

            for (output, _) in storage_texture_pairs {
                self.assign_physical_image_slot(output, vk::ImageUsageFlags::empty())?;
            }

            let ds_input = self.passes[pass_index].depth_stencil_input;
            let ds_output = self.passes[pass_index].depth_stencil_output;
            if let Some(input) = ds_input {
                self.assign_physical_image_slot(input, vk::ImageUsageFlags::empty())?;
                if let Some(output) = ds_output {
                    self.pin_output_to_input(output, input)?;
                    let queues = self.resources[output].used_queues;
                    let usage = self.resources[output].image_usage();
                    let phys = self.resources[output].physical_index.unwrap();
                    let dim = &mut self.physical_dimensions[phys];
                    dim.queues |= queues;
                    dim.image_usage |= usage;
                }
            } else if let Some(output) = ds_output {
                self.assign_physical_image_slot(output, vk::ImageUsageFlags::empty())?;
            }

            let attachment_inputs = self.passes[pass_index].attachment_inputs.clone();
            for input in attachment_inputs {
                self.assign_physical_image_slot(input, vk::ImageUsageFlags::empty())?;
            }

            let fake_aliases = self.passes[pass_index].fake_resource_aliases.clone();
            for (from, to) in fake_aliases {
                self.resources[to].physical_index = self.resources[from].physical_index;
            }
        }

        // Figure out which physical slots need history.
        self.physical_image_has_history = vec![false; self.physical_dimensions.len()];
        for &pass_index in &self.pass_stack {
            for history_index in 0..self.passes[pass_index].history_inputs.len() {
                let history = self.passes[pass_index].history_inputs[history_index];
                let Some(phys) = self.resources[history].physical_index else {
                    return Err(
                        Error::HistoryWithoutWriter(self.resources[history].name.clone()).into(),
                    );
                };
                self.physical_image_has_history[phys] = true;
            }
        }

        Ok(())
    }

    /// An image slot is transient when it is attachment-only, has no history,
    /// and is touched by exactly one physical pass.
    pub(crate) fn build_transients(&mut self) {
        let mut physical_pass_used: Vec<Option<usize>> =
            vec![None; self.physical_dimensions.len()];

        for (index, dim) in self.physical_dimensions.iter_mut().enumerate() {
            // Buffers and storage images are never transient.
            dim.transient = !dim.is_buffer_like();

            if self.physical_image_has_history[index] {
                dim.transient = false;
            }

            if format_has_depth_or_stencil_aspect(dim.format)
                && !self.quirks.use_transient_depth_stencil
            {
                dim.transient = false;
            }
            if !format_has_depth_or_stencil_aspect(dim.format) && !self.quirks.use_transient_color {
                dim.transient = false;
            }
        }

        for resource in &self.resources {
            if resource.resource_type() != crate::resource::ResourceType::Texture {
                continue;
            }
            let Some(physical_index) = resource.physical_index else {
                continue;
            };

            for passes in [&resource.written_in_passes, &resource.read_in_passes] {
                for &pass in passes {
                    let Some(phys) = self.passes[pass].physical_pass_index else {
                        continue;
                    };
                    match physical_pass_used[physical_index] {
                        Some(used) if used != phys => {
                            self.physical_dimensions[physical_index].transient = false;
                        }
                        _ => physical_pass_used[physical_index] = Some(phys),
                    }
                }
            }
        }
    }

    /// Find physical slots whose lifetimes are disjoint and collapse them
    /// onto one physical image, recording alias-transfer edges where event
    /// state hops from one slot to the next.
    pub(crate) fn build_aliases(&mut self) {
        #[derive(Clone, Copy)]
        struct Range {
            first_write_pass: usize,
            last_write_pass: usize,
            first_read_pass: usize,
            last_read_pass: usize,
            block_alias: bool,
        }

        impl Default for Range {
            fn default() -> Self {
                Self {
                    first_write_pass: usize::MAX,
                    last_write_pass: 0,
                    first_read_pass: usize::MAX,
                    last_read_pass: 0,
                    block_alias: false,
                }
            }
        }

        impl Range {
            fn has_writer(&self) -> bool {
                self.first_write_pass <= self.last_write_pass
            }

            fn has_reader(&self) -> bool {
                self.first_read_pass <= self.last_read_pass
            }

            fn is_used(&self) -> bool {
                self.has_writer() || self.has_reader()
            }

            fn can_alias(&self) -> bool {
                // Reading before the resource was fully written means the
                // contents must be preserved, no aliasing.
                if self.has_reader() && self.has_writer() && self.first_read_pass <= self.first_write_pass
                {
                    return false;
                }
                !self.block_alias
            }

            fn last_used_pass(&self) -> usize {
                let mut last_pass = 0;
                if self.has_writer() {
                    last_pass = last_pass.max(self.last_write_pass);
                }
                if self.has_reader() {
                    last_pass = last_pass.max(self.last_read_pass);
                }
                last_pass
            }

            fn first_used_pass(&self) -> usize {
                let mut first_pass = usize::MAX;
                if self.has_writer() {
                    first_pass = first_pass.min(self.first_write_pass);
                }
                if self.has_reader() {
                    first_pass = first_pass.min(self.first_read_pass);
                }
                first_pass
            }

            fn disjoint_lifetime(&self, other: &Range) -> bool {
                if !self.is_used() || !other.is_used() {
                    return false;
                }
                if !self.can_alias() || !other.can_alias() {
                    return false;
                }
                let left = self.last_used_pass() < other.first_used_pass();
                let right = other.last_used_pass() < self.first_used_pass();
                left || right
            }
        }

        let mut pass_range: Vec<Range> = vec![Range::default(); self.physical_dimensions.len()];

        {
            let register_reader =
                |pass_range: &mut Vec<Range>, phys: Option<usize>, pass_index: Option<usize>| {
                    let (Some(phys), Some(pass_index)) = (phys, pass_index) else {
                        return;
                    };
                    let range = &mut pass_range[phys];
                    range.last_read_pass = range.last_read_pass.max(pass_index);
                    range.first_read_pass = range.first_read_pass.min(pass_index);
                };

            let register_writer = |pass_range: &mut Vec<Range>,
                                   phys: Option<usize>,
                                   pass_index: Option<usize>,
                                   block_alias: bool| {
                let (Some(phys), Some(pass_index)) = (phys, pass_index) else {
                    return;
                };
                let range = &mut pass_range[phys];
                range.last_write_pass = range.last_write_pass.max(pass_index);
                range.first_write_pass = range.first_write_pass.min(pass_index);
                if block_alias {
                    range.block_alias = true;
                }
            };

            for &pass_index in &self.pass_stack {
                let pass = &self.passes[pass_index];
                let physical_pass = pass.physical_pass_index;
                let phys_of = |resource: usize| self.resources[resource].physical_index;

                for input in pass.color_inputs.iter().flatten() {
                    register_reader(&mut pass_range, phys_of(*input), physical_pass);
                }
                for input in pass.color_scale_inputs.iter().flatten() {
                    register_reader(&mut pass_range, phys_of(*input), physical_pass);
                }
                for &input in &pass.attachment_inputs {
                    register_reader(&mut pass_range, phys_of(input), physical_pass);
                }
                for input in &pass.generic_texture {
                    register_reader(&mut pass_range, phys_of(input.resource), physical_pass);
                }
                for input in pass.blit_texture_inputs.iter().flatten() {
                    register_reader(&mut pass_range, phys_of(*input), physical_pass);
                }
                for input in pass.storage_texture_inputs.iter().flatten() {
                    register_reader(&mut pass_range, phys_of(*input), physical_pass);
                }
                if let Some(input) = pass.depth_stencil_input {
                    register_reader(&mut pass_range, phys_of(input), physical_pass);
                }

                // If a pass may be skipped at runtime, other content could
                // still live in its outputs; never alias those.
                let block_alias = pass.may_not_need_render_pass();

                if let Some(output) = pass.depth_stencil_output {
                    register_writer(&mut pass_range, phys_of(output), physical_pass, block_alias);
                }
                for &output in &pass.color_outputs {
                    register_writer(&mut pass_range, phys_of(output), physical_pass, block_alias);
                }
                for &output in &pass.resolve_outputs {
                    register_writer(&mut pass_range, phys_of(output), physical_pass, block_alias);
                }
                for &output in &pass.blit_texture_outputs {
                    register_writer(&mut pass_range, phys_of(output), physical_pass, block_alias);
                }

                // Storage textures are implicitly preserved, never aliased.
                for &output in &pass.storage_texture_outputs {
                    register_writer(&mut pass_range, phys_of(output), physical_pass, true);
                }
            }
        }

        let mut alias_chains: Vec<Vec<usize>> = vec![Vec::new(); self.physical_dimensions.len()];
        self.physical_aliases = vec![None; self.physical_dimensions.len()];

        for i in 0..self.physical_dimensions.len() {
            // No aliasing for buffers or history images.
            if self.physical_dimensions[i].buffer_info.size != 0 {
                continue;
            }
            if self.physical_image_has_history[i] {
                continue;
            }

            // Only alias lower-indexed slots; they are allocated in order.
            for j in 0..i {
                if self.physical_image_has_history[j] {
                    continue;
                }

                if self.physical_dimensions[i] != self.physical_dimensions[j] {
                    continue;
                }

                // Only alias within a single queue: aliasing barriers can
                // only ride on events, not across queues.
                let same_single_queue = self.physical_dimensions[i].queues
                    == self.physical_dimensions[j].queues
                    && !self.physical_dimensions[i]
                        .queues
                        .spans_multiple_physical_queues()
                    && self.physical_dimensions[i].queues.bits().count_ones() == 1;

                if pass_range[i].disjoint_lifetime(&pass_range[j]) && same_single_queue {
                    self.physical_aliases[i] = Some(j);
                    if alias_chains[j].is_empty() {
                        alias_chains[j].push(j);
                    }
                    alias_chains[j].push(i);

                    // Usage may differ between the aliases, merge it.
                    let merged = self.physical_dimensions[j].image_usage
                        | self.physical_dimensions[i].image_usage;
                    self.physical_dimensions[i].image_usage = merged;
                    self.physical_dimensions[j].image_usage = merged;
                    break;
                }
            }
        }

        // Record the transfer edges in order of use. The chain wraps around
        // so the last user hands state back to the first alias for the next
        // frame.
        for chain in &mut alias_chains {
            if chain.is_empty() {
                continue;
            }

            chain.sort_by_key(|&member| pass_range[member].first_used_pass());

            for i in 0..chain.len() {
                let last_used = pass_range[chain[i]].last_used_pass();
                let next = if i + 1 < chain.len() {
                    chain[i + 1]
                } else {
                    chain[0]
                };
                self.physical_passes[last_used]
                    .alias_transfer
                    .push((chain[i], next));
            }
        }
    }
}
