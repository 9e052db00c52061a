//! Barrier synthesis: per-pass invalidate/flush records, folded into
//! physical-pass boundary barriers.
//!
//! Invalidates make prior writes visible to a pass's reads (availability on
//! the consumer side); flushes publish a pass's writes (visibility on the
//! producer side). Within a merged physical pass the subpass dependencies
//! handle synchronisation, so only the boundary barriers survive the fold.

use anyhow::Result;
use ash::vk;

use crate::error::Error;
use crate::graph::render_pass::MipmapRequest;
use crate::graph::RenderGraph;
use crate::queue::RenderGraphQueueFlags;

/// One synchronisation record for a physical resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Barrier {
    pub resource_index: usize,
    pub layout: vk::ImageLayout,
    pub access: vk::AccessFlags,
    pub stages: vk::PipelineStageFlags,
    /// Refers to the previous frame's copy of the resource.
    pub history: bool,
}

/// Invalidate (pre-pass) and flush (post-pass) barriers of one pass.
#[derive(Debug, Clone, Default)]
pub struct Barriers {
    pub invalidate: Vec<Barrier>,
    pub flush: Vec<Barrier>,
}

fn get_access(barriers: &mut Vec<Barrier>, index: usize, history: bool) -> &mut Barrier {
    if let Some(pos) = barriers
        .iter()
        .position(|b| b.resource_index == index && b.history == history)
    {
        &mut barriers[pos]
    } else {
        barriers.push(Barrier {
            resource_index: index,
            layout: vk::ImageLayout::UNDEFINED,
            access: vk::AccessFlags::empty(),
            stages: vk::PipelineStageFlags::empty(),
            history,
        });
        barriers.last_mut().unwrap()
    }
}

fn set_layout(barrier: &mut Barrier, layout: vk::ImageLayout) -> Result<()> {
    if barrier.layout != vk::ImageLayout::UNDEFINED {
        return Err(Error::LayoutConflict(barrier.resource_index).into());
    }
    barrier.layout = layout;
    Ok(())
}

impl RenderGraph {
    fn physical_index(&self, resource: usize) -> usize {
        // Scheduled passes only reference planned resources.
        self.resources[resource].physical_index.unwrap()
    }

    pub(crate) fn build_barriers(&mut self) -> Result<()> {
        self.pass_barriers.clear();
        self.pass_barriers.reserve(self.pass_stack.len());

        for &index in &self.pass_stack {
            let pass = &self.passes[index];
            let compute = pass.queue.intersects(RenderGraphQueueFlags::COMPUTE_QUEUES);
            let shader_stages = if compute {
                vk::PipelineStageFlags::COMPUTE_SHADER
            } else {
                // TODO: Pick appropriate stage.
                vk::PipelineStageFlags::FRAGMENT_SHADER
            };

            let mut barriers = Barriers::default();

            for input in &pass.generic_buffer {
                let barrier =
                    get_access(&mut barriers.invalidate, self.physical_index(input.resource), false);
                barrier.access |= input.access;
                barrier.stages |= input.stages;
                set_layout(barrier, input.layout)?;
            }

            for input in &pass.generic_texture {
                let barrier =
                    get_access(&mut barriers.invalidate, self.physical_index(input.resource), false);
                barrier.access |= input.access;
                barrier.stages |= input.stages;
                set_layout(barrier, input.layout)?;
            }

            for &input in &pass.history_inputs {
                let barrier =
                    get_access(&mut barriers.invalidate, self.physical_index(input), true);
                barrier.access |= vk::AccessFlags::SHADER_READ;
                barrier.stages |= shader_stages;
                set_layout(barrier, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
            }

            for &input in &pass.attachment_inputs {
                if compute {
                    return Err(Error::AttachmentOnComputeQueue("input attachments").into());
                }
                let barrier =
                    get_access(&mut barriers.invalidate, self.physical_index(input), false);
                barrier.access |= vk::AccessFlags::INPUT_ATTACHMENT_READ;
                barrier.stages |= vk::PipelineStageFlags::FRAGMENT_SHADER;
                set_layout(barrier, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
            }

            for input in pass.storage_inputs.iter().flatten() {
                let barrier =
                    get_access(&mut barriers.invalidate, self.physical_index(*input), false);
                barrier.access |= vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
                barrier.stages |= shader_stages;
                set_layout(barrier, vk::ImageLayout::GENERAL)?;
            }

            for input in pass.storage_texture_inputs.iter().flatten() {
                let barrier =
                    get_access(&mut barriers.invalidate, self.physical_index(*input), false);
                barrier.access |= vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE;
                barrier.stages |= shader_stages;
                set_layout(barrier, vk::ImageLayout::GENERAL)?;
            }

            // Read-modify-write blit destinations; read-only blit sources go
            // through the generic texture list.
            for input in pass.blit_texture_inputs.iter().flatten() {
                let barrier =
                    get_access(&mut barriers.invalidate, self.physical_index(*input), false);
                barrier.access |= vk::AccessFlags::TRANSFER_WRITE;
                barrier.stages |= vk::PipelineStageFlags::TRANSFER;
                set_layout(barrier, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
            }

            for input in pass.color_inputs.iter().flatten() {
                if compute {
                    return Err(Error::AttachmentOnComputeQueue("color inputs").into());
                }
                let barrier =
                    get_access(&mut barriers.invalidate, self.physical_index(*input), false);
                barrier.access |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::COLOR_ATTACHMENT_READ;
                barrier.stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;

                // Also bound as an input attachment (programmable blending)
                // means GENERAL.
                if barrier.layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
                    barrier.layout = vk::ImageLayout::GENERAL;
                } else {
                    set_layout(barrier, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)?;
                }
            }

            for input in pass.color_scale_inputs.iter().flatten() {
                if compute {
                    return Err(Error::AttachmentOnComputeQueue("scaled color inputs").into());
                }
                let barrier =
                    get_access(&mut barriers.invalidate, self.physical_index(*input), false);
                barrier.access |= vk::AccessFlags::SHADER_READ;
                barrier.stages |= vk::PipelineStageFlags::FRAGMENT_SHADER;
                set_layout(barrier, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
            }

            for &output in &pass.color_outputs {
                if compute {
                    return Err(Error::AttachmentOnComputeQueue("color outputs").into());
                }
                let phys = self.physical_index(output);
                let barrier = get_access(&mut barriers.flush, phys, false);

                if self.physical_dimensions[phys].levels > 1 {
                    // Mip generation happens after the pass; the sentinel
                    // layout requests it. Access is covered by the mipmap
                    // barrier itself, TRANSFER_READ keeps validation quiet.
                    barrier.access |= vk::AccessFlags::TRANSFER_READ;
                    barrier.stages |= vk::PipelineStageFlags::TRANSFER;
                    set_layout(barrier, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
                } else {
                    barrier.access |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
                    barrier.stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;

                    if barrier.layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                        || barrier.layout == vk::ImageLayout::GENERAL
                    {
                        barrier.layout = vk::ImageLayout::GENERAL;
                    } else {
                        set_layout(barrier, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)?;
                    }
                }
            }

            for &output in &pass.resolve_outputs {
                if compute {
                    return Err(Error::AttachmentOnComputeQueue("resolve outputs").into());
                }
                let barrier = get_access(&mut barriers.flush, self.physical_index(output), false);
                barrier.access |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
                barrier.stages |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
                set_layout(barrier, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)?;
            }

            for &output in &pass.blit_texture_outputs {
                let barrier = get_access(&mut barriers.flush, self.physical_index(output), false);
                barrier.access |= vk::AccessFlags::TRANSFER_WRITE;
                barrier.stages |= vk::PipelineStageFlags::TRANSFER;
                set_layout(barrier, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
            }

            for &output in &pass.storage_outputs {
                let barrier = get_access(&mut barriers.flush, self.physical_index(output), false);
                barrier.access |= vk::AccessFlags::SHADER_WRITE;
                barrier.stages |= shader_stages;
                set_layout(barrier, vk::ImageLayout::GENERAL)?;
            }

            for &output in &pass.transfer_outputs {
                let barrier = get_access(&mut barriers.flush, self.physical_index(output), false);
                barrier.access |= vk::AccessFlags::TRANSFER_WRITE;
                barrier.stages |= vk::PipelineStageFlags::TRANSFER;
                set_layout(barrier, vk::ImageLayout::GENERAL)?;
            }

            for &output in &pass.storage_texture_outputs {
                let barrier = get_access(&mut barriers.flush, self.physical_index(output), false);
                barrier.access |= vk::AccessFlags::SHADER_WRITE;
                barrier.stages |= shader_stages;
                set_layout(barrier, vk::ImageLayout::GENERAL)?;
            }

            let output = pass.depth_stencil_output;
            let input = pass.depth_stencil_input;

            if (output.is_some() || input.is_some()) && compute {
                return Err(Error::AttachmentOnComputeQueue("depth attachments").into());
            }

            match (output, input) {
                (Some(output), Some(input)) => {
                    {
                        let dst_barrier =
                            get_access(&mut barriers.invalidate, self.physical_index(input), false);
                        if dst_barrier.layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
                            dst_barrier.layout = vk::ImageLayout::GENERAL;
                        } else {
                            set_layout(
                                dst_barrier,
                                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                            )?;
                        }
                        dst_barrier.access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
                        dst_barrier.stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
                    }
                    {
                        let src_barrier =
                            get_access(&mut barriers.flush, self.physical_index(output), false);
                        src_barrier.layout = vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
                        src_barrier.access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
                        src_barrier.stages |= vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
                    }
                }
                (None, Some(input)) => {
                    let dst_barrier =
                        get_access(&mut barriers.invalidate, self.physical_index(input), false);
                    if dst_barrier.layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
                        dst_barrier.layout = vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL;
                    } else {
                        set_layout(dst_barrier, vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL)?;
                    }
                    dst_barrier.access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ;
                    dst_barrier.stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
                }
                (Some(output), None) => {
                    let src_barrier =
                        get_access(&mut barriers.flush, self.physical_index(output), false);
                    if src_barrier.layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
                        src_barrier.layout = vk::ImageLayout::GENERAL;
                    } else {
                        set_layout(src_barrier, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)?;
                    }
                    src_barrier.access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
                    src_barrier.stages |= vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
                }
                (None, None) => {}
            }

            self.pass_barriers.push(barriers);
        }
        Ok(())
    }

    /// Fold per-pass barriers into the boundaries of each physical pass.
    /// Intra-pass hazards are covered by subpass dependencies; only the first
    /// layout a resource enters and the last layout it leaves matter here.
    pub(crate) fn build_physical_barriers(&mut self) {
        let flush_access_to_invalidate = |mut flags: vk::AccessFlags| -> vk::AccessFlags {
            if flags.contains(vk::AccessFlags::COLOR_ATTACHMENT_WRITE) {
                flags |= vk::AccessFlags::COLOR_ATTACHMENT_READ;
            }
            if flags.contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE) {
                flags |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ;
            }
            if flags.contains(vk::AccessFlags::SHADER_WRITE) {
                flags |= vk::AccessFlags::SHADER_READ;
            }
            flags
        };

        #[derive(Clone, Copy)]
        struct ResourceState {
            initial_layout: vk::ImageLayout,
            final_layout: vk::ImageLayout,
            invalidated_types: vk::AccessFlags,
            flushed_types: vk::AccessFlags,
            invalidated_stages: vk::PipelineStageFlags,
            flushed_stages: vk::PipelineStageFlags,
        }

        impl Default for ResourceState {
            fn default() -> Self {
                Self {
                    initial_layout: vk::ImageLayout::UNDEFINED,
                    final_layout: vk::ImageLayout::UNDEFINED,
                    invalidated_types: vk::AccessFlags::empty(),
                    flushed_types: vk::AccessFlags::empty(),
                    invalidated_stages: vk::PipelineStageFlags::empty(),
                    flushed_stages: vk::PipelineStageFlags::empty(),
                }
            }
        }

        let mut barrier_itr = 0usize;

        for physical_index in 0..self.physical_passes.len() {
            let mut resource_state: Vec<ResourceState> =
                vec![ResourceState::default(); self.physical_dimensions.len()];
            let mut pass_invalidate: Vec<Barrier> = Vec::new();
            let mut pass_flush: Vec<Barrier> = Vec::new();
            let mut discards: Vec<usize> = Vec::new();
            let mut mipmap_requests: Vec<MipmapRequest> = Vec::new();

            let subpasses = self.physical_passes[physical_index].passes.len();
            for _ in 0..subpasses {
                let barriers = &self.pass_barriers[barrier_itr];
                barrier_itr += 1;

                for invalidate in &barriers.invalidate {
                    // Transients and the swapchain are handled implicitly.
                    if self.physical_dimensions[invalidate.resource_index].transient
                        || Some(invalidate.resource_index) == self.swapchain_physical_index
                    {
                        continue;
                    }

                    if invalidate.history {
                        let already_seen = pass_invalidate.iter().any(|b| {
                            b.resource_index == invalidate.resource_index && b.history
                        });
                        if !already_seen {
                            // Storage images stay in GENERAL, everything else
                            // takes the declared layout.
                            let layout = if self.physical_dimensions[invalidate.resource_index]
                                .is_storage_image()
                            {
                                vk::ImageLayout::GENERAL
                            } else {
                                invalidate.layout
                            };

                            // History barriers only guarantee layout and
                            // avoid write-after-read; they emit one
                            // invalidate and a zero-access flush.
                            pass_invalidate.push(Barrier {
                                resource_index: invalidate.resource_index,
                                layout,
                                access: invalidate.access,
                                stages: invalidate.stages,
                                history: true,
                            });
                            pass_flush.push(Barrier {
                                resource_index: invalidate.resource_index,
                                layout,
                                access: vk::AccessFlags::empty(),
                                stages: invalidate.stages,
                                history: true,
                            });
                        }
                        continue;
                    }

                    let res = &mut resource_state[invalidate.resource_index];

                    // Only the first use in the physical pass is externally
                    // visible.
                    if res.initial_layout == vk::ImageLayout::UNDEFINED {
                        res.invalidated_types |= invalidate.access;
                        res.invalidated_stages |= invalidate.stages;
                        res.initial_layout = if self.physical_dimensions
                            [invalidate.resource_index]
                            .is_storage_image()
                        {
                            vk::ImageLayout::GENERAL
                        } else {
                            invalidate.layout
                        };
                    }

                    // A read-only invalidate can still change the layout.
                    res.final_layout = if self.physical_dimensions[invalidate.resource_index]
                        .is_storage_image()
                    {
                        vk::ImageLayout::GENERAL
                    } else {
                        invalidate.layout
                    };

                    // Pending flushes became visible in the appropriate
                    // stages already (relevant from subpass #1 onwards).
                    res.flushed_types = vk::AccessFlags::empty();
                    res.flushed_stages = vk::PipelineStageFlags::empty();
                }

                for flush in &barriers.flush {
                    if self.physical_dimensions[flush.resource_index].transient
                        || Some(flush.resource_index) == self.swapchain_physical_index
                    {
                        continue;
                    }

                    let res = &mut resource_state[flush.resource_index];

                    // The last use in the physical pass is externally
                    // visible.
                    res.flushed_types |= flush.access;
                    res.flushed_stages |= flush.stages;
                    res.final_layout =
                        if self.physical_dimensions[flush.resource_index].is_storage_image() {
                            vk::ImageLayout::GENERAL
                        } else {
                            flush.layout
                        };

                    // A flush without a prior invalidate needs a matching
                    // invalidate; the resource is written without being read
                    // first, so its old contents can be discarded.
                    if res.initial_layout == vk::ImageLayout::UNDEFINED {
                        if flush.layout == vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
                            // Mipmap sentinel: the pass itself finishes in
                            // COLOR_ATTACHMENT_OPTIMAL.
                            res.initial_layout = vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
                            res.invalidated_stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
                            res.invalidated_types = vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                                | vk::AccessFlags::COLOR_ATTACHMENT_READ;
                        } else {
                            res.initial_layout = flush.layout;
                            res.invalidated_stages = flush.stages;
                            res.invalidated_types = flush_access_to_invalidate(flush.access);
                        }

                        discards.push(flush.resource_index);
                    }
                }
            }

            for (index, resource) in resource_state.iter().enumerate() {
                // Resource not touched in this physical pass.
                if resource.final_layout == vk::ImageLayout::UNDEFINED
                    && resource.initial_layout == vk::ImageLayout::UNDEFINED
                {
                    continue;
                }

                debug_assert_ne!(resource.final_layout, vk::ImageLayout::UNDEFINED);

                pass_invalidate.push(Barrier {
                    resource_index: index,
                    layout: resource.initial_layout,
                    access: resource.invalidated_types,
                    stages: resource.invalidated_stages,
                    history: false,
                });

                if !resource.flushed_types.is_empty() {
                    // The pass wrote something which needs to be flushed.
                    pass_flush.push(Barrier {
                        resource_index: index,
                        layout: resource.final_layout,
                        access: resource.flushed_types,
                        stages: resource.flushed_stages,
                        history: false,
                    });
                } else if !resource.invalidated_types.is_empty() {
                    // The pass only read; emit a zero-access flush so a later
                    // writer orders behind the reads (write-after-read).
                    pass_flush.push(Barrier {
                        resource_index: index,
                        layout: resource.final_layout,
                        access: vk::AccessFlags::empty(),
                        stages: resource.invalidated_stages,
                        history: false,
                    });
                }

                if resource.final_layout == vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
                    mipmap_requests.push(MipmapRequest {
                        physical_resource: index,
                        stages: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                        access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    });
                }
            }

            let physical_pass = &mut self.physical_passes[physical_index];
            physical_pass.invalidate = pass_invalidate;
            physical_pass.flush = pass_flush;
            physical_pass.discards = discards;
            physical_pass.mipmap_requests = mipmap_requests;
        }
    }
}
