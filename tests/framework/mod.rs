#![allow(dead_code)]

//! Recording mock device shared by the integration tests.
//!
//! Every encoder logs its commands; `end_recording` moves the log into a
//! FIFO, and each submission pops the front of that FIFO. Tests drive the
//! graph through [`InlineComposer`], so recording and submission happen
//! strictly in pass order and the FIFO pairing is exact.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use deimos::prelude::*;

/// One recorded encoder call.
#[derive(Debug, Clone, PartialEq)]
pub enum Cmd {
    BeginRegion(String),
    EndRegion,
    Barrier {
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        images: Vec<ImageBarrier>,
    },
    WaitEvents {
        events: Vec<EventHandle>,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        buffers: Vec<BufferBarrier>,
        images: Vec<ImageBarrier>,
    },
    CompleteSignalEvent(EventHandle),
    ImageBarrier {
        image: ImageHandle,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
    BeginRenderPass {
        colors: Vec<ImageHandle>,
        depth_stencil: Option<ImageHandle>,
        clear_attachments: u32,
        load_attachments: u32,
        store_attachments: u32,
        num_subpasses: usize,
    },
    NextSubpass,
    EndRenderPass,
    PrepareGenerateMipmap(ImageHandle),
    GenerateMipmap(ImageHandle),
    SetTexture(u32, ImageHandle),
    DrawFullscreenQuad,
    WriteTimestamp(vk::PipelineStageFlags),
    EndRecording,
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub queue: QueueType,
    pub commands: Vec<Cmd>,
    pub signal_semaphores: Vec<SemaphoreHandle>,
}

#[derive(Debug, Default)]
pub struct DeviceState {
    next_handle: u64,
    pub images: Vec<(ImageHandle, ImageCreateInfo)>,
    pub buffers: Vec<(BufferHandle, BufferCreateInfo)>,
    /// (handle, recycling index) per transient attachment request.
    pub transients: Vec<(ImageHandle, usize)>,
    /// Finished (end_recording'ed) command streams awaiting submission.
    finished: Vec<(QueueType, Vec<Cmd>)>,
    pub submissions: Vec<Submission>,
    pub waits: Vec<(QueueType, SemaphoreHandle, vk::PipelineStageFlags)>,
    pub events_allocated: u64,
    pub semaphores_allocated: u64,
    pub flush_count: u32,
}

impl DeviceState {
    fn fresh_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

pub struct TestDevice {
    pub state: Arc<Mutex<DeviceState>>,
    pub multiview: bool,
}

impl Default for TestDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl TestDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState::default())),
            multiview: true,
        }
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn waits(&self) -> Vec<(QueueType, SemaphoreHandle, vk::PipelineStageFlags)> {
        self.state.lock().unwrap().waits.clone()
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().unwrap().images.len()
    }

    pub fn flush_count(&self) -> u32 {
        self.state.lock().unwrap().flush_count
    }
}

struct TestEncoder {
    queue: QueueType,
    commands: Vec<Cmd>,
    state: Arc<Mutex<DeviceState>>,
}

impl RenderDevice for TestDevice {
    fn create_image(&self, info: &ImageCreateInfo) -> Result<ImageHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = ImageHandle(state.fresh_handle());
        state.images.push((handle, info.clone()));
        Ok(handle)
    }

    fn create_buffer(&self, info: &BufferCreateInfo) -> Result<BufferHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = BufferHandle(state.fresh_handle());
        state.buffers.push((handle, *info));
        Ok(handle)
    }

    fn get_transient_attachment(
        &self,
        _width: u32,
        _height: u32,
        _format: vk::Format,
        index: usize,
        _samples: u32,
        _layers: u32,
    ) -> Result<ImageHandle> {
        let mut state = self.state.lock().unwrap();
        let handle = ImageHandle(state.fresh_handle());
        state.transients.push((handle, index));
        Ok(handle)
    }

    fn request_command_buffer(&self, queue: QueueType) -> Result<Box<dyn CommandEncoder + Send>> {
        Ok(Box::new(TestEncoder {
            queue,
            commands: Vec::new(),
            state: Arc::clone(&self.state),
        }))
    }

    fn submit(
        &self,
        _cmd: Box<dyn CommandEncoder + Send>,
        signal_semaphores: &[SemaphoreHandle],
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        assert!(
            !state.finished.is_empty(),
            "submitted a command buffer that never finished recording"
        );
        let (queue, commands) = state.finished.remove(0);
        state.submissions.push(Submission {
            queue,
            commands,
            signal_semaphores: signal_semaphores.to_vec(),
        });
        Ok(())
    }

    fn add_wait_semaphore(
        &self,
        queue: QueueType,
        semaphore: SemaphoreHandle,
        stages: vk::PipelineStageFlags,
        _flush: bool,
    ) {
        self.state.lock().unwrap().waits.push((queue, semaphore, stages));
    }

    fn begin_signal_event(&self, _stages: vk::PipelineStageFlags) -> EventHandle {
        let mut state = self.state.lock().unwrap();
        state.events_allocated += 1;
        EventHandle(state.fresh_handle())
    }

    fn request_proxy_semaphore(&self) -> SemaphoreHandle {
        let mut state = self.state.lock().unwrap();
        state.semaphores_allocated += 1;
        SemaphoreHandle(state.fresh_handle())
    }

    fn flush_frame(&self) {
        self.state.lock().unwrap().flush_count += 1;
    }

    fn supports_multiview(&self) -> bool {
        self.multiview
    }
}

impl CommandEncoder for TestEncoder {
    fn begin_region(&mut self, name: &str) {
        self.commands.push(Cmd::BeginRegion(name.to_owned()));
    }

    fn end_region(&mut self) {
        self.commands.push(Cmd::EndRegion);
    }

    fn barrier(
        &mut self,
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        image_barriers: &[ImageBarrier],
    ) {
        self.commands.push(Cmd::Barrier {
            src_stages,
            dst_stages,
            images: image_barriers.to_vec(),
        });
    }

    fn wait_events(
        &mut self,
        events: &[EventHandle],
        src_stages: vk::PipelineStageFlags,
        dst_stages: vk::PipelineStageFlags,
        buffer_barriers: &[BufferBarrier],
        image_barriers: &[ImageBarrier],
    ) {
        self.commands.push(Cmd::WaitEvents {
            events: events.to_vec(),
            src_stages,
            dst_stages,
            buffers: buffer_barriers.to_vec(),
            images: image_barriers.to_vec(),
        });
    }

    fn complete_signal_event(&mut self, event: EventHandle) {
        self.commands.push(Cmd::CompleteSignalEvent(event));
    }

    fn image_barrier(
        &mut self,
        image: ImageHandle,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        _src_stages: vk::PipelineStageFlags,
        _src_access: vk::AccessFlags,
        _dst_stages: vk::PipelineStageFlags,
        _dst_access: vk::AccessFlags,
    ) {
        self.commands.push(Cmd::ImageBarrier {
            image,
            old_layout,
            new_layout,
        });
    }

    fn begin_render_pass(&mut self, info: &RenderPassInfo, _contents: vk::SubpassContents) {
        self.commands.push(Cmd::BeginRenderPass {
            colors: info.color_attachments.clone(),
            depth_stencil: info.depth_stencil,
            clear_attachments: info.clear_attachments,
            load_attachments: info.load_attachments,
            store_attachments: info.store_attachments,
            num_subpasses: info.subpasses.len(),
        });
    }

    fn next_subpass(&mut self, _contents: vk::SubpassContents) {
        self.commands.push(Cmd::NextSubpass);
    }

    fn end_render_pass(&mut self) {
        self.commands.push(Cmd::EndRenderPass);
    }

    fn barrier_prepare_generate_mipmap(
        &mut self,
        image: ImageHandle,
        _base_layout: vk::ImageLayout,
        _src_stages: vk::PipelineStageFlags,
        _src_access: vk::AccessFlags,
    ) {
        self.commands.push(Cmd::PrepareGenerateMipmap(image));
    }

    fn generate_mipmap(&mut self, image: ImageHandle) {
        self.commands.push(Cmd::GenerateMipmap(image));
    }

    fn set_texture(&mut self, binding: u32, image: ImageHandle) {
        self.commands.push(Cmd::SetTexture(binding, image));
    }

    fn draw_fullscreen_quad(&mut self) {
        self.commands.push(Cmd::DrawFullscreenQuad);
    }

    fn write_timestamp(&mut self, stages: vk::PipelineStageFlags) {
        self.commands.push(Cmd::WriteTimestamp(stages));
    }

    fn end_recording(&mut self) {
        self.commands.push(Cmd::EndRecording);
        let commands = std::mem::take(&mut self.commands);
        self.state.lock().unwrap().finished.push((self.queue, commands));
    }
}

/// Swapchain description most tests share: 1280 x 720 BGRA8.
pub fn swapchain_dimensions() -> ResourceDimensions {
    ResourceDimensions {
        width: 1280,
        height: 720,
        format: vk::Format::B8G8R8A8_UNORM,
        ..Default::default()
    }
}

/// Find every command matching `filter` across a submission's stream.
pub fn find_commands<'a>(
    submission: &'a Submission,
    filter: impl Fn(&Cmd) -> bool + 'a,
) -> Vec<&'a Cmd> {
    submission.commands.iter().filter(|cmd| filter(cmd)).collect()
}

/// True when the submission contains the given debug region.
pub fn has_region(submission: &Submission, name: &str) -> bool {
    submission
        .commands
        .iter()
        .any(|cmd| matches!(cmd, Cmd::BeginRegion(region) if region == name))
}
