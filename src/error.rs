//! Exposes the deimos error type

use thiserror::Error;

/// Error type that deimos can return.
///
/// All variants except the per-frame ones are raised during
/// [`bake()`](crate::graph::RenderGraph::bake); the graph is left in an
/// indeterminate state afterwards and must be
/// [`reset()`](crate::graph::RenderGraph::reset) before rebuilding.
#[derive(Error, Debug)]
pub enum Error {
    /// Paired input/output declarations disagree in length.
    #[error("Size of {0} inputs must match {0} outputs.")]
    MismatchedInputOutput(&'static str),
    /// A read-modify-write pair was declared with incompatible descriptions.
    #[error("Doing read-modify-write on `{0}`, but usage and sizes do not match.")]
    MismatchedDimensions(String),
    /// A resource is read, but no pass writes to it.
    #[error("No pass exists which writes to resource `{0}`.")]
    NoWriter(String),
    /// A history input was declared, but the resource has no writer anywhere.
    #[error("History input `{0}` is used, but it was never written to.")]
    HistoryWithoutWriter(String),
    /// The backbuffer source resource was never declared by any pass.
    #[error("Backbuffer source `{0}` does not exist.")]
    BackbufferMissing(String),
    /// A declaration refers to a resource that does not exist.
    #[error("Resource `{0}` does not exist.")]
    ResourceMissing(String),
    /// A pass transitively depends on itself.
    #[error("Pass `{0}` depends on itself.")]
    SelfDependency(String),
    /// Dependency traversal exceeded the pass count, so the graph has a cycle.
    #[error("Cycle detected while traversing pass dependencies.")]
    DependencyCycle,
    /// Two renaming pairs demand different physical slots for the same
    /// resource.
    #[error("Cannot alias resources, physical index of `{0}` already claimed.")]
    PhysicalIndexConflict(String),
    /// A single pass declared the same resource with two incompatible layouts.
    #[error("Layout mismatch for physical resource #{0}.")]
    LayoutConflict(usize),
    /// Attachments only exist on graphics queues.
    #[error("Only graphics passes can have {0}.")]
    AttachmentOnComputeQueue(&'static str),
    /// Immediate barriers may only transition away from UNDEFINED.
    #[error("Cannot do immediate image barriers from a layout other than UNDEFINED.")]
    ImmediateBarrierNotUndefined,
    /// The backbuffer was never written this frame, there is nothing to
    /// present.
    #[error("Swapchain resource was not written to.")]
    SwapchainNotWritten,
    /// The baked frame needs a swapchain image, but none was provided.
    #[error("A swapchain image is required but was not provided to setup_attachments.")]
    NoSwapchainImage,
    /// Index outside the physical buffer array.
    #[error("Physical buffer index {0} is out of range.")]
    IndexOutOfRange(usize),
    /// A per-frame entry point was called before `bake()`.
    #[error("Render graph has not been baked.")]
    NotBaked,
}
