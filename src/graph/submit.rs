//! Per-frame execution: realising physical attachments, tracking per-resource
//! event state, and driving recording and submission across queues.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::vk;
use static_assertions::const_assert_eq;

use crate::device::{
    BufferBarrier, BufferCreateInfo, BufferHandle, CommandEncoder, EventHandle, ImageBarrier,
    ImageCreateInfo, ImageHandle, RenderDevice, RenderPassInfo, SemaphoreHandle, SubpassInfo,
};
use crate::error::Error;
use crate::format::format_to_aspect_mask;
use crate::graph::barrier::Barrier;
use crate::graph::RenderGraph;
use crate::pass::BuildRenderPassFn;
use crate::queue::{queue_type_for, QueueType, RenderGraphQueueFlags};
use crate::task::TaskComposer;

/// One access-mask slot per pipeline stage bit.
const NUM_PIPELINE_STAGE_BITS: usize = 32;
const_assert_eq!(std::mem::size_of::<vk::PipelineStageFlags>(), 4);

/// An event published by a pass, together with the stages it signals at.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SignalEvent {
    pub event: EventHandle,
    pub stages: vk::PipelineStageFlags,
}

/// Synchronisation state of one physical slot, persistent across passes
/// within a frame (and across frames for history resources).
#[derive(Debug, Clone)]
pub(crate) struct PipelineEvent {
    pub layout: vk::ImageLayout,
    /// Writes which have not been made visible yet.
    pub to_flush_access: vk::AccessFlags,
    pub event: Option<SignalEvent>,
    pub wait_graphics_semaphore: Option<SemaphoreHandle>,
    pub wait_compute_semaphore: Option<SemaphoreHandle>,
    /// Which access bits are already visible to each pipeline stage since
    /// the last write. Lets redundant invalidates be skipped.
    pub invalidated_in_stage: [vk::AccessFlags; NUM_PIPELINE_STAGE_BITS],
}

impl Default for PipelineEvent {
    fn default() -> Self {
        Self {
            layout: vk::ImageLayout::UNDEFINED,
            to_flush_access: vk::AccessFlags::empty(),
            event: None,
            wait_graphics_semaphore: None,
            wait_compute_semaphore: None,
            invalidated_in_stage: [vk::AccessFlags::empty(); NUM_PIPELINE_STAGE_BITS],
        }
    }
}

/// A physical image realised by the graph, with the info it was created from
/// so persistent images can be reused when compatible.
#[derive(Debug, Clone)]
pub struct PhysicalImage {
    pub handle: ImageHandle,
    pub info: ImageCreateInfo,
}

/// A physical buffer realised by the graph.
#[derive(Debug, Clone)]
pub struct PhysicalBuffer {
    pub handle: BufferHandle,
    pub info: BufferCreateInfo,
}

fn for_each_bit(mask: vk::PipelineStageFlags, mut f: impl FnMut(usize)) {
    let mut bits = mask.as_raw();
    while bits != 0 {
        f(bits.trailing_zeros() as usize);
        bits &= bits - 1;
    }
}

fn need_invalidate(barrier: &Barrier, event: &PipelineEvent) -> bool {
    let mut need = false;
    for_each_bit(barrier.stages, |bit| {
        if !(barrier.access & !event.invalidated_in_stage[bit]).is_empty() {
            need = true;
        }
    });
    need
}

/// Barrier and signalling state resolved for one physical pass before its
/// command buffer is recorded.
#[derive(Debug, Default)]
struct PassSubmissionState {
    active: bool,
    graphics: bool,
    queue_type: QueueType,
    buffer_barriers: Vec<BufferBarrier>,
    image_barriers: Vec<ImageBarrier>,
    /// Barriers from TOP_OF_PIPE for first-use resources.
    immediate_image_barriers: Vec<ImageBarrier>,
    /// Layout transitions riding alongside a semaphore wait.
    semaphore_handover_barriers: Vec<ImageBarrier>,
    events: Vec<EventHandle>,
    wait_semaphores: Vec<(SemaphoreHandle, vk::PipelineStageFlags)>,
    src_stages: vk::PipelineStageFlags,
    dst_stages: vk::PipelineStageFlags,
    handover_stages: vk::PipelineStageFlags,
    immediate_dst_stages: vk::PipelineStageFlags,
    event_signal_stages: vk::PipelineStageFlags,
    signal_event: Option<EventHandle>,
    need_submission_semaphore: bool,
    proxy_semaphores: Option<[SemaphoreHandle; 2]>,
}

impl PassSubmissionState {
    fn add_unique_event(&mut self, event: EventHandle) {
        if !self.events.contains(&event) {
            self.events.push(event);
        }
    }
}

/// Everything a recording task owns: no borrows of the graph.
struct SubpassJob {
    name: String,
    build: Option<Arc<BuildRenderPassFn>>,
    scaled: Vec<(u32, ImageHandle)>,
    contents: vk::SubpassContents,
}

struct RecordJob {
    queue_type: QueueType,
    graphics: bool,
    timestamps: bool,
    rp_info: RenderPassInfo,
    layer_iterations: u32,
    subpasses: Vec<SubpassJob>,
    mipmaps: Vec<(ImageHandle, vk::ImageLayout, vk::PipelineStageFlags, vk::AccessFlags)>,

    buffer_barriers: Vec<BufferBarrier>,
    image_barriers: Vec<ImageBarrier>,
    immediate_image_barriers: Vec<ImageBarrier>,
    semaphore_handover_barriers: Vec<ImageBarrier>,
    events: Vec<EventHandle>,
    src_stages: vk::PipelineStageFlags,
    dst_stages: vk::PipelineStageFlags,
    handover_stages: vk::PipelineStageFlags,
    immediate_dst_stages: vk::PipelineStageFlags,
    signal_event: Option<EventHandle>,
    event_signal_stages: vk::PipelineStageFlags,
}

impl RenderGraph {
    /// Realise every physical image and buffer for this frame. History slots
    /// swap roles first: the current image becomes the history image, and the
    /// retired history image is recreated as the new current one.
    pub fn setup_attachments(
        &mut self,
        device: &dyn RenderDevice,
        swapchain: Option<ImageHandle>,
    ) -> Result<()> {
        self.require_baked()?;

        let num_attachments = self.physical_dimensions.len();
        self.physical_attachments = vec![None; num_attachments];
        self.physical_buffers.resize(num_attachments, None);
        self.physical_image_attachments.resize(num_attachments, None);
        self.physical_history_image_attachments
            .resize(num_attachments, None);
        self.physical_events
            .resize(num_attachments, PipelineEvent::default());
        self.physical_history_events
            .resize(num_attachments, PipelineEvent::default());
        self.swapchain_attachment = swapchain;

        for i in 0..num_attachments {
            if self.physical_image_has_history[i] {
                std::mem::swap(
                    &mut self.physical_history_image_attachments[i],
                    &mut self.physical_image_attachments[i],
                );
                let current = self.physical_events[i].clone();
                self.physical_events[i] =
                    std::mem::replace(&mut self.physical_history_events[i], current);
            }

            if self.physical_dimensions[i].buffer_info.size != 0 {
                self.setup_physical_buffer(device, i)?;
            } else if self.physical_dimensions[i].is_storage_image() {
                self.setup_physical_image(device, i)?;
            } else if Some(i) == self.swapchain_physical_index {
                self.physical_attachments[i] = Some(swapchain.ok_or(Error::NoSwapchainImage)?);
            } else if self.physical_dimensions[i].transient {
                let dim = self.physical_dimensions[i].clone();
                self.physical_attachments[i] = Some(device.get_transient_attachment(
                    dim.width,
                    dim.height,
                    dim.format,
                    i,
                    dim.samples,
                    dim.layers,
                )?);
            } else {
                self.setup_physical_image(device, i)?;
            }
        }

        // Assign concrete attachments to each physical pass.
        for physical_index in 0..self.physical_passes.len() {
            let mut layers = u32::MAX;

            let colors = self.physical_passes[physical_index]
                .physical_color_attachments
                .clone();
            let mut handles = Vec::with_capacity(colors.len());
            for &attachment in &colors {
                handles.push(
                    self.physical_attachments[attachment].ok_or(Error::NoSwapchainImage)?,
                );
                layers = layers.min(self.physical_dimensions[attachment].layers);
            }

            let depth_stencil = self.physical_passes[physical_index]
                .physical_depth_stencil_attachment;
            let depth_handle = match depth_stencil {
                Some(attachment) => {
                    layers = layers.min(self.physical_dimensions[attachment].layers);
                    self.physical_attachments[attachment]
                }
                None => None,
            };

            let physical_pass = &mut self.physical_passes[physical_index];
            physical_pass.render_pass_info.color_attachments = handles;
            physical_pass.render_pass_info.depth_stencil = depth_handle;
            physical_pass.layers = if layers == u32::MAX { 1 } else { layers.max(1) };
        }

        Ok(())
    }

    fn setup_physical_buffer(&mut self, device: &dyn RenderDevice, attachment: usize) -> Result<()> {
        let att = &self.physical_dimensions[attachment];
        let info = BufferCreateInfo {
            size: att.buffer_info.size,
            usage: att.buffer_info.usage,
            zero_initialize: true,
        };

        let mut need_buffer = true;
        if let Some(existing) = &self.physical_buffers[attachment] {
            if att.persistent
                && existing.info.size == info.size
                && existing.info.usage.contains(info.usage)
            {
                need_buffer = false;
            }
        }

        if need_buffer {
            let handle = device.create_buffer(&info)?;
            device.set_buffer_name(handle, &att.name);
            self.physical_buffers[attachment] = Some(PhysicalBuffer { handle, info });
            self.physical_events[attachment] = PipelineEvent::default();
        }
        Ok(())
    }

    fn setup_physical_image(&mut self, device: &dyn RenderDevice, attachment: usize) -> Result<()> {
        if let Some(alias) = self.physical_aliases[attachment] {
            self.physical_image_attachments[attachment] =
                self.physical_image_attachments[alias].clone();
            self.physical_attachments[attachment] = self.physical_image_attachments[attachment]
                .as_ref()
                .map(|image| image.handle);
            self.physical_events[attachment] = PipelineEvent::default();
            return Ok(());
        }

        let att = self.physical_dimensions[attachment].clone();

        let mut flags = vk::ImageCreateFlags::empty();
        if att.is_storage_image() {
            flags |= vk::ImageCreateFlags::MUTABLE_FORMAT;
        }

        let mut usage = att.image_usage;
        if att.has_depth_or_stencil() {
            usage &= !vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }

        let info = ImageCreateInfo {
            format: att.format,
            width: att.width,
            height: att.height,
            depth: att.depth,
            levels: att.levels,
            layers: att.layers,
            samples: att.samples,
            usage,
            flags,
            queues: att.queues,
            mutable_srgb: att.unorm_srgb,
        };

        let mut need_image = true;
        if let Some(existing) = &self.physical_image_attachments[attachment] {
            if att.persistent
                && existing.info.format == info.format
                && existing.info.width == info.width
                && existing.info.height == info.height
                && existing.info.depth == info.depth
                && existing.info.samples == info.samples
                && existing.info.usage.contains(info.usage)
                && existing.info.flags.contains(info.flags)
            {
                need_image = false;
            }
        }

        if need_image {
            let handle = device.create_image(&info)?;
            device.set_image_name(handle, &att.name);
            self.physical_image_attachments[attachment] = Some(PhysicalImage { handle, info });
            self.physical_events[attachment] = PipelineEvent::default();
        }

        self.physical_attachments[attachment] = self.physical_image_attachments[attachment]
            .as_ref()
            .map(|image| image.handle);
        Ok(())
    }

    fn physical_pass_requires_work(&self, physical_index: usize) -> bool {
        self.physical_passes[physical_index]
            .passes
            .iter()
            .any(|&pass| self.passes[pass].need_render_pass())
    }

    /// Force discarded resources into UNDEFINED before their invalidates are
    /// resolved; aliasing depends on this. Storage images are preserved over
    /// frames, never discarded.
    fn physical_pass_invalidate_attachments(&mut self, physical_index: usize) {
        let discards = self.physical_passes[physical_index].discards.clone();
        for discard in discards {
            if !self.physical_dimensions[discard].is_buffer_like() {
                self.physical_events[discard].layout = vk::ImageLayout::UNDEFINED;
            }
        }
    }

    /// Move event/semaphore state from each retiring alias to its successor.
    fn physical_pass_transfer_ownership(&mut self, physical_index: usize) {
        let transfers = self.physical_passes[physical_index].alias_transfer.clone();
        for (from, to) in transfers {
            let mut event = self.physical_events[from].clone();
            event.invalidated_in_stage = [vk::AccessFlags::empty(); NUM_PIPELINE_STAGE_BITS];
            // Pending writes cannot be flushed from UNDEFINED; the last use
            // of an alias is a read in practice, and write-only resources are
            // transient and never get here.
            debug_assert!(event.to_flush_access.is_empty());
            event.to_flush_access = vk::AccessFlags::empty();
            event.layout = vk::ImageLayout::UNDEFINED;
            self.physical_events[to] = event;
        }
    }

    fn physical_pass_handle_invalidate_barrier(
        &mut self,
        barrier: &Barrier,
        state: &mut PassSubmissionState,
        physical_graphics_queue: bool,
    ) -> Result<()> {
        let index = barrier.resource_index;
        let mut event = if barrier.history {
            self.physical_history_events[index].clone()
        } else {
            self.physical_events[index].clone()
        };

        let mut need_event_barrier = false;
        let mut layout_change = false;
        let mut need_wait_semaphore = false;
        let wait_semaphore = if physical_graphics_queue {
            event.wait_graphics_semaphore
        } else {
            event.wait_compute_semaphore
        };

        if self.physical_dimensions[index].buffer_info.size != 0 {
            let need_sync = !event.to_flush_access.is_empty() || need_invalidate(barrier, &event);

            if need_sync {
                need_event_barrier = event.event.is_some();
                // Signalling and waiting for a semaphore covers the memory
                // barrier automatically.
                need_wait_semaphore = wait_semaphore.is_some();
            }

            if need_event_barrier {
                let Some(buffer) = &self.physical_buffers[index] else {
                    return Ok(());
                };
                state.buffer_barriers.push(BufferBarrier {
                    buffer: buffer.handle,
                    src_access: event.to_flush_access,
                    dst_access: barrier.access,
                });
            }
        } else {
            let image = if barrier.history {
                self.physical_history_image_attachments[index]
                    .as_ref()
                    .map(|image| image.handle)
            } else {
                self.physical_attachments[index]
            };

            let Some(image) = image else {
                // Happens for history inputs on the very first frame.
                return Ok(());
            };

            let dim = &self.physical_dimensions[index];
            let mut image_barrier = ImageBarrier {
                image,
                old_layout: event.layout,
                new_layout: barrier.layout,
                src_access: event.to_flush_access,
                dst_access: barrier.access,
                aspect: format_to_aspect_mask(dim.format),
                levels: dim.levels,
                layers: dim.layers,
            };
            event.layout = barrier.layout;

            layout_change = image_barrier.old_layout != image_barrier.new_layout;

            let need_sync = layout_change
                || !event.to_flush_access.is_empty()
                || need_invalidate(barrier, &event);

            if need_sync {
                if event.event.is_some() {
                    // Either we wait for an event ...
                    state.image_barriers.push(image_barrier);
                    need_event_barrier = true;
                } else if wait_semaphore.is_some() {
                    // ... or for a semaphore ...
                    if layout_change {
                        // The semaphore wait already flushed caches; the
                        // transition still needs dstAccessMask since layout
                        // changes may perform writes.
                        image_barrier.src_access = vk::AccessFlags::empty();
                        state.semaphore_handover_barriers.push(image_barrier);
                        state.handover_stages |= barrier.stages;
                    }
                    need_wait_semaphore = true;
                } else {
                    // ... or this is the first use, pipeline-barrier from
                    // TOP_OF_PIPE.
                    if image_barrier.old_layout != vk::ImageLayout::UNDEFINED {
                        return Err(Error::ImmediateBarrierNotUndefined.into());
                    }
                    state.immediate_image_barriers.push(image_barrier);
                    state.immediate_dst_stages |= barrier.stages;
                }
            }
        }

        // Pending writes or layout changes invalidate the cache model.
        if !event.to_flush_access.is_empty() || layout_change {
            event.invalidated_in_stage = [vk::AccessFlags::empty(); NUM_PIPELINE_STAGE_BITS];
        }
        event.to_flush_access = vk::AccessFlags::empty();

        if need_event_barrier {
            state.dst_stages |= barrier.stages;

            let signal = event.event.expect("event barrier without an event");
            state.src_stages |= signal.stages;
            state.add_unique_event(signal.event);

            for_each_bit(barrier.stages, |bit| {
                event.invalidated_in_stage[bit] |= barrier.access;
            });
        } else if need_wait_semaphore {
            let semaphore = wait_semaphore.expect("semaphore wait without a semaphore");
            state.wait_semaphores.push((semaphore, barrier.stages));

            // The semaphore wait makes everything visible in the waited
            // stages, unless a layout change rode along; that counts as a
            // write, only its access bits become visible.
            for_each_bit(barrier.stages, |bit| {
                if layout_change {
                    event.invalidated_in_stage[bit] |= barrier.access;
                } else {
                    event.invalidated_in_stage[bit] = vk::AccessFlags::from_raw(!0);
                }
            });
        }

        if barrier.history {
            self.physical_history_events[index] = event;
        } else {
            self.physical_events[index] = event;
        }
        Ok(())
    }

    /// Decide how the pass publishes its writes: an event on the same queue,
    /// or a pair of proxy semaphores when any flushed resource crosses
    /// physical queues.
    fn physical_pass_handle_signal(
        &self,
        device: &dyn RenderDevice,
        physical_index: usize,
        state: &mut PassSubmissionState,
    ) {
        for barrier in &self.physical_passes[physical_index].flush {
            if self.physical_dimensions[barrier.resource_index].uses_semaphore() {
                state.need_submission_semaphore = true;
            } else {
                state.event_signal_stages |= barrier.stages;
            }
        }

        if !state.event_signal_stages.is_empty() {
            state.signal_event = Some(device.begin_signal_event(state.event_signal_stages));
        }

        if state.need_submission_semaphore {
            state.proxy_semaphores = Some([
                device.request_proxy_semaphore(),
                device.request_proxy_semaphore(),
            ]);
        }
    }

    fn physical_pass_handle_flush_barrier(
        &mut self,
        barrier: &Barrier,
        state: &PassSubmissionState,
    ) {
        let index = barrier.resource_index;
        let uses_semaphore = self.physical_dimensions[index].uses_semaphore();

        if self.physical_dimensions[index].buffer_info.size == 0 {
            let image_exists = if barrier.history {
                self.physical_history_image_attachments[index].is_some()
            } else {
                self.physical_attachments[index].is_some()
            };
            if !image_exists {
                return;
            }
            // The render pass may have changed the final layout.
            self.physical_events[index].layout = barrier.layout;
        }

        let event = if barrier.history {
            &mut self.physical_history_events[index]
        } else {
            &mut self.physical_events[index]
        };

        event.to_flush_access = barrier.access;

        if uses_semaphore {
            let proxies = state
                .proxy_semaphores
                .expect("semaphore flush without proxy semaphores");
            event.wait_graphics_semaphore = Some(proxies[0]);
            event.wait_compute_semaphore = Some(proxies[1]);
        } else {
            let signal = state.signal_event.expect("event flush without an event");
            event.event = Some(SignalEvent {
                event: signal,
                stages: state.event_signal_stages,
            });
        }
    }

    fn build_record_job(
        &self,
        device: &dyn RenderDevice,
        physical_index: usize,
        state: &mut PassSubmissionState,
        contents: &[vk::SubpassContents],
    ) -> RecordJob {
        let physical_pass = &self.physical_passes[physical_index];

        let mut rp_info = physical_pass.render_pass_info.clone();
        for request in &physical_pass.color_clear_requests {
            if let Some(value) = self.passes[request.pass].get_clear_color(request.index) {
                rp_info.clear_colors[request.attachment] = value;
            }
        }
        if let Some(pass) = physical_pass.depth_clear_request {
            if let Some(value) = self.passes[pass].get_clear_depth_stencil() {
                rp_info.clear_depth_stencil = value;
            }
        }

        let mut layer_iterations = 1;
        if physical_pass.layers > 1 {
            let multiview_count = physical_pass
                .passes
                .iter()
                .filter(|&&pass| self.passes[pass].render_pass_is_multiview())
                .count();
            let separate_count = physical_pass.passes.len() - multiview_count;

            if multiview_count != 0 && separate_count != 0 {
                error!(
                    "Mismatch in physical pass w.r.t. multiview vs separate layers. \
                     Do not mix and match! Render pass will be dropped."
                );
                layer_iterations = 0;
            } else if multiview_count != 0 {
                if device.supports_multiview() {
                    rp_info.num_layers = physical_pass.layers;
                    rp_info.base_layer = 0;
                } else {
                    error!("Multiview is not supported on this device. Falling back to separate layering.");
                    layer_iterations = physical_pass.layers;
                }
            } else {
                layer_iterations = physical_pass.layers;
            }
        }

        let subpasses = physical_pass
            .passes
            .iter()
            .enumerate()
            .map(|(subpass_index, &pass)| SubpassJob {
                name: self.passes[pass].name.clone(),
                build: self.passes[pass].callbacks.build_render_pass.clone(),
                scaled: physical_pass.scaled_clear_requests[subpass_index]
                    .iter()
                    .filter_map(|request| {
                        self.physical_attachments[request.physical_resource]
                            .map(|handle| (request.target, handle))
                    })
                    .collect(),
                contents: contents
                    .get(subpass_index)
                    .copied()
                    .unwrap_or(vk::SubpassContents::INLINE),
            })
            .collect();

        let mipmaps = physical_pass
            .mipmap_requests
            .iter()
            .filter_map(|request| {
                self.physical_attachments[request.physical_resource]
                    .map(|handle| (handle, request.layout, request.stages, request.access))
            })
            .collect();

        RecordJob {
            queue_type: state.queue_type,
            graphics: state.graphics,
            timestamps: self.enabled_timestamps,
            rp_info,
            layer_iterations,
            subpasses,
            mipmaps,
            buffer_barriers: std::mem::take(&mut state.buffer_barriers),
            image_barriers: std::mem::take(&mut state.image_barriers),
            immediate_image_barriers: std::mem::take(&mut state.immediate_image_barriers),
            semaphore_handover_barriers: std::mem::take(&mut state.semaphore_handover_barriers),
            events: std::mem::take(&mut state.events),
            src_stages: state.src_stages,
            dst_stages: state.dst_stages,
            handover_stages: state.handover_stages,
            immediate_dst_stages: state.immediate_dst_stages,
            signal_event: state.signal_event,
            event_signal_stages: state.event_signal_stages,
        }
    }

    /// Record and submit the whole frame.
    ///
    /// CPU preparation runs as one composer stage, recording as another, and
    /// submission as one single-task stage per pass so queue submission order
    /// stays deterministic. Finally the backbuffer is either already the
    /// swapchain image, or a fullscreen blit copies it over.
    pub fn enqueue_render_passes<'env>(
        &mut self,
        device: &'env (dyn RenderDevice + 'env),
        composer: &mut dyn TaskComposer<'env>,
    ) -> Result<()> {
        self.require_baked()?;
        let count = self.physical_passes.len();

        // Resolve barrier and event state serially; this walk owns the
        // per-resource event arrays.
        let mut states: Vec<PassSubmissionState> = Vec::with_capacity(count);
        for physical_index in 0..count {
            let mut state = PassSubmissionState::default();

            if !self.physical_pass_requires_work(physical_index) {
                // Skipped GPU work still hands aliases over.
                self.physical_pass_transfer_ownership(physical_index);
                states.push(state);
                continue;
            }
            state.active = true;

            let first_pass = self.physical_passes[physical_index].passes[0];
            let (queue_type, graphics) = queue_type_for(self.passes[first_pass].queue);
            state.queue_type = queue_type;
            state.graphics = graphics;

            self.physical_pass_invalidate_attachments(physical_index);

            let physical_graphics =
                device.physical_queue_type(queue_type) == QueueType::Graphics;
            let invalidates = self.physical_passes[physical_index].invalidate.clone();
            for barrier in &invalidates {
                self.physical_pass_handle_invalidate_barrier(barrier, &mut state, physical_graphics)?;
            }

            self.physical_pass_handle_signal(device, physical_index, &mut state);
            let flushes = self.physical_passes[physical_index].flush.clone();
            for barrier in &flushes {
                self.physical_pass_handle_flush_barrier(barrier, &state);
            }

            self.physical_pass_transfer_ownership(physical_index);
            states.push(state);
        }

        // Stage 1: per-pass CPU preparation.
        let prepare_contents: Arc<Mutex<Vec<Vec<vk::SubpassContents>>>> = Arc::new(Mutex::new(
            (0..count)
                .map(|i| vec![vk::SubpassContents::INLINE; self.physical_passes[i].passes.len()])
                .collect(),
        ));
        composer.begin_pipeline_stage("render-graph-prepare");
        for physical_index in 0..count {
            if !states[physical_index].active {
                continue;
            }
            for (subpass_index, &pass) in self.physical_passes[physical_index]
                .passes
                .iter()
                .enumerate()
            {
                let Some(prepare) = self.passes[pass]
                    .callbacks
                    .enqueue_prepare_render_pass
                    .clone()
                else {
                    continue;
                };
                let contents = Arc::clone(&prepare_contents);
                composer.enqueue_task(Box::new(move || {
                    let chosen = (*prepare)(subpass_index as u32);
                    contents.lock().unwrap()[physical_index][subpass_index] = chosen;
                }));
            }
        }
        composer.join();
        let contents: Vec<Vec<vk::SubpassContents>> = prepare_contents.lock().unwrap().clone();

        // Stage 2: record command buffers.
        let error_slot: Arc<Mutex<Option<anyhow::Error>>> = Arc::new(Mutex::new(None));
        let cmd_slots: Vec<Arc<Mutex<Option<Box<dyn CommandEncoder + Send>>>>> =
            (0..count).map(|_| Arc::new(Mutex::new(None))).collect();

        composer.begin_pipeline_stage("render-graph-record");
        for physical_index in 0..count {
            if !states[physical_index].active {
                continue;
            }
            let job = self.build_record_job(
                device,
                physical_index,
                &mut states[physical_index],
                &contents[physical_index],
            );
            let slot = Arc::clone(&cmd_slots[physical_index]);
            let errors = Arc::clone(&error_slot);
            composer.enqueue_task(Box::new(move || match record_physical_pass(device, job) {
                Ok(cmd) => *slot.lock().unwrap() = Some(cmd),
                Err(err) => {
                    let mut slot = errors.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }
            }));
        }

        // Stage 3: submission, serialised in pass order.
        let waited: Arc<Mutex<HashSet<SemaphoreHandle>>> =
            Arc::new(Mutex::new(std::mem::take(&mut self.waited_semaphores)));
        let quirks = self.quirks;
        for (physical_index, state) in states.iter_mut().enumerate() {
            composer.begin_pipeline_stage("render-graph-submit");
            if !state.active {
                continue;
            }

            let queue_type = state.queue_type;
            let wait_semaphores = std::mem::take(&mut state.wait_semaphores);
            let proxy_semaphores = state.proxy_semaphores;
            let need_submission_semaphore = state.need_submission_semaphore;
            let slot = Arc::clone(&cmd_slots[physical_index]);
            let errors = Arc::clone(&error_slot);
            let waited = Arc::clone(&waited);

            composer.enqueue_task(Box::new(move || {
                // Recording failed; the error is already captured.
                let Some(cmd) = slot.lock().unwrap().take() else {
                    return;
                };

                for (semaphore, stages) in &wait_semaphores {
                    if waited.lock().unwrap().insert(*semaphore) {
                        device.add_wait_semaphore(queue_type, *semaphore, *stages, true);
                    }
                }

                let signals: &[SemaphoreHandle] =
                    match (need_submission_semaphore, &proxy_semaphores) {
                        (true, Some(proxies)) => proxies.as_slice(),
                        _ => &[],
                    };
                if let Err(err) = device.submit(cmd, signals) {
                    let mut slot = errors.lock().unwrap();
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }

                if quirks.queue_wait_on_submission {
                    device.flush_frame();
                }
            }));
        }

        composer.join();
        self.waited_semaphores = std::mem::take(&mut *waited.lock().unwrap());
        if let Some(err) = error_slot.lock().unwrap().take() {
            return Err(err);
        }

        // Stage 4: scale to the swapchain if the backbuffer does not alias
        // it, then flush the frame.
        if self.swapchain_physical_index.is_none() {
            self.enqueue_swapchain_scale_pass(device)?;
        }
        device.flush_frame();
        Ok(())
    }

    /// The backbuffer could not alias the swapchain: wait for its producer,
    /// transition it for sampling, and draw a fullscreen quad into the real
    /// swapchain image.
    fn enqueue_swapchain_scale_pass(&mut self, device: &dyn RenderDevice) -> Result<()> {
        let resource_index = *self
            .resource_to_index
            .get(&self.backbuffer_source)
            .ok_or_else(|| Error::BackbufferMissing(self.backbuffer_source.clone()))?;
        let index = self.resources[resource_index]
            .physical_index
            .ok_or(Error::SwapchainNotWritten)?;

        let queue_type = if self.physical_dimensions[index]
            .queues
            .contains(RenderGraphQueueFlags::GRAPHICS)
        {
            QueueType::Graphics
        } else {
            QueueType::AsyncGraphics
        };
        let physical_queue_type = device.physical_queue_type(queue_type);

        let mut cmd = device.request_command_buffer(queue_type)?;
        cmd.begin_region("render-graph-copy-to-swapchain");

        let image = self.physical_attachments[index].ok_or(Error::SwapchainNotWritten)?;
        let dim = self.physical_dimensions[index].clone();

        let target_layout = if dim.is_storage_image() {
            vk::ImageLayout::GENERAL
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        };

        let wait_semaphore = if physical_queue_type == QueueType::Graphics {
            self.physical_events[index].wait_graphics_semaphore
        } else {
            self.physical_events[index].wait_compute_semaphore
        };

        if let Some(signal) = self.physical_events[index].event {
            let barrier = ImageBarrier {
                image,
                old_layout: self.physical_events[index].layout,
                new_layout: target_layout,
                src_access: self.physical_events[index].to_flush_access,
                dst_access: vk::AccessFlags::SHADER_READ,
                aspect: format_to_aspect_mask(dim.format),
                levels: dim.levels,
                layers: dim.layers,
            };
            cmd.wait_events(
                &[signal.event],
                signal.stages,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                &[],
                &[barrier],
            );
            self.physical_events[index].layout = target_layout;
        } else if let Some(semaphore) = wait_semaphore {
            if self.waited_semaphores.insert(semaphore) {
                device.add_wait_semaphore(
                    queue_type,
                    semaphore,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    true,
                );
            }

            if self.physical_events[index].layout != target_layout {
                cmd.image_barrier(
                    image,
                    self.physical_events[index].layout,
                    target_layout,
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::AccessFlags::empty(),
                    vk::PipelineStageFlags::FRAGMENT_SHADER,
                    vk::AccessFlags::SHADER_READ,
                );
                self.physical_events[index].layout = target_layout;
            }
        } else {
            return Err(Error::SwapchainNotWritten.into());
        }

        let rp_info = RenderPassInfo {
            color_attachments: vec![self
                .swapchain_attachment
                .ok_or(Error::NoSwapchainImage)?],
            store_attachments: 1,
            num_layers: 1,
            subpasses: vec![SubpassInfo {
                color_attachments: vec![0],
                ..Default::default()
            }],
            ..Default::default()
        };

        cmd.begin_render_pass(&rp_info, vk::SubpassContents::INLINE);
        cmd.set_texture(0, image);
        cmd.draw_fullscreen_quad();
        cmd.end_render_pass();

        // Write-after-read barrier state on the backbuffer.
        {
            let event = &mut self.physical_events[index];
            event.to_flush_access = vk::AccessFlags::empty();
            event.invalidated_in_stage = [vk::AccessFlags::empty(); NUM_PIPELINE_STAGE_BITS];
            event.invalidated_in_stage
                [vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw().trailing_zeros() as usize] =
                vk::AccessFlags::SHADER_READ;
        }

        let signal_event = if dim.uses_semaphore() {
            None
        } else {
            let event = device.begin_signal_event(vk::PipelineStageFlags::FRAGMENT_SHADER);
            cmd.complete_signal_event(event);
            Some(event)
        };

        cmd.end_region();
        cmd.end_recording();

        if let Some(event) = signal_event {
            self.physical_events[index].event = Some(SignalEvent {
                event,
                stages: vk::PipelineStageFlags::FRAGMENT_SHADER,
            });
            device.submit(cmd, &[])?;
        } else {
            let proxies = [
                device.request_proxy_semaphore(),
                device.request_proxy_semaphore(),
            ];
            device.submit(cmd, &proxies)?;
            self.physical_events[index].wait_graphics_semaphore = Some(proxies[0]);
            self.physical_events[index].wait_compute_semaphore = Some(proxies[1]);
        }

        if self.quirks.queue_wait_on_submission {
            device.flush_frame();
        }
        Ok(())
    }
}

fn record_physical_pass(
    device: &dyn RenderDevice,
    job: RecordJob,
) -> Result<Box<dyn CommandEncoder + Send>> {
    let mut cmd = device.request_command_buffer(job.queue_type)?;

    emit_pre_pass_barriers(&mut *cmd, &job);

    if job.graphics {
        record_graphics(&mut *cmd, &job);
    } else {
        record_compute(&mut *cmd, &job);
    }

    cmd.begin_region("render-graph-sync-post");
    if !job.event_signal_stages.is_empty() {
        if let Some(event) = job.signal_event {
            cmd.complete_signal_event(event);
        }
    }
    cmd.end_region();

    cmd.end_recording();
    Ok(cmd)
}

fn emit_pre_pass_barriers(cmd: &mut dyn CommandEncoder, job: &RecordJob) {
    cmd.begin_region("render-graph-sync-pre");

    if !job.semaphore_handover_barriers.is_empty() || !job.immediate_image_barriers.is_empty() {
        let mut combined = Vec::with_capacity(
            job.semaphore_handover_barriers.len() + job.immediate_image_barriers.len(),
        );
        combined.extend_from_slice(&job.semaphore_handover_barriers);
        combined.extend_from_slice(&job.immediate_image_barriers);

        let src = if job.handover_stages.is_empty() {
            vk::PipelineStageFlags::TOP_OF_PIPE
        } else {
            job.handover_stages
        };
        cmd.barrier(src, job.handover_stages | job.immediate_dst_stages, &combined);
    }

    if !job.image_barriers.is_empty() || !job.buffer_barriers.is_empty() {
        cmd.wait_events(
            &job.events,
            job.src_stages,
            job.dst_stages,
            &job.buffer_barriers,
            &job.image_barriers,
        );
    }

    cmd.end_region();
}

fn record_graphics(cmd: &mut dyn CommandEncoder, job: &RecordJob) {
    if job.timestamps {
        cmd.write_timestamp(vk::PipelineStageFlags::VERTEX_SHADER);
        cmd.write_timestamp(vk::PipelineStageFlags::ALL_GRAPHICS);
    }

    for layer in 0..job.layer_iterations {
        let mut rp_info = job.rp_info.clone();
        rp_info.base_layer = layer;

        cmd.begin_region("begin-render-pass");
        cmd.begin_render_pass(&rp_info, job.subpasses[0].contents);
        cmd.end_region();

        for (subpass_index, subpass) in job.subpasses.iter().enumerate() {
            if !subpass.scaled.is_empty() {
                for &(target, image) in &subpass.scaled {
                    cmd.set_texture(target, image);
                }
                cmd.draw_fullscreen_quad();
            }

            // Once the render pass has begun every subpass runs, even one
            // which might not be required, because of clears and load/store
            // decisions baked into the render pass object.
            cmd.begin_region(&subpass.name);
            if let Some(build) = &subpass.build {
                (**build)(&mut *cmd, layer);
            }
            cmd.end_region();

            if subpass_index + 1 < job.subpasses.len() {
                cmd.next_subpass(job.subpasses[subpass_index + 1].contents);
            }
        }

        cmd.begin_region("end-render-pass");
        cmd.end_render_pass();
        cmd.end_region();
    }

    if job.timestamps {
        cmd.write_timestamp(vk::PipelineStageFlags::VERTEX_SHADER);
        cmd.write_timestamp(vk::PipelineStageFlags::ALL_GRAPHICS);
    }

    for &(image, layout, stages, access) in &job.mipmaps {
        cmd.begin_region("render-graph-mipgen");
        cmd.barrier_prepare_generate_mipmap(image, layout, stages, access);
        cmd.generate_mipmap(image);
        cmd.end_region();
    }
}

fn record_compute(cmd: &mut dyn CommandEncoder, job: &RecordJob) {
    debug_assert_eq!(job.subpasses.len(), 1);
    let subpass = &job.subpasses[0];

    if job.timestamps {
        cmd.write_timestamp(vk::PipelineStageFlags::COMPUTE_SHADER);
    }
    cmd.begin_region(&subpass.name);
    if let Some(build) = &subpass.build {
        (**build)(&mut *cmd, 0);
    }
    cmd.end_region();
    if job.timestamps {
        cmd.write_timestamp(vk::PipelineStageFlags::COMPUTE_SHADER);
    }
}
