//! Queue classification: the logical queues passes are declared on, and the
//! physical queues command buffers are submitted to.

use bitflags::bitflags;

bitflags! {
    /// Which logical queues a pass runs on, or a resource is touched by.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderGraphQueueFlags: u32 {
        /// The main graphics queue.
        const GRAPHICS = 1 << 0;
        /// Compute work submitted on the graphics queue.
        const COMPUTE = 1 << 1;
        /// A dedicated async compute queue.
        const ASYNC_COMPUTE = 1 << 2;
        /// A secondary graphics-capable queue.
        const ASYNC_GRAPHICS = 1 << 3;
    }
}

impl RenderGraphQueueFlags {
    /// Queues whose passes dispatch compute rather than graphics work.
    pub const COMPUTE_QUEUES: Self = Self::COMPUTE.union(Self::ASYNC_COMPUTE);

    /// True if this mask contains any compute-dispatching queue.
    pub fn is_compute(self) -> bool {
        self.intersects(Self::COMPUTE_QUEUES)
    }

    /// Collapse logical queues onto the physical queues they submit on.
    /// COMPUTE shares the graphics queue.
    pub fn physical_queues(self) -> Self {
        let mut mask = self;
        if mask.contains(Self::COMPUTE) {
            mask |= Self::GRAPHICS;
            mask -= Self::COMPUTE;
        }
        mask
    }

    /// True when work on these queues ends up on more than one physical
    /// queue, which forces semaphores instead of pipeline events.
    pub fn spans_multiple_physical_queues(self) -> bool {
        let bits = self.physical_queues().bits();
        bits & bits.wrapping_sub(1) != 0
    }
}

/// Physical queue a command buffer is requested from and submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueType {
    #[default]
    Graphics,
    AsyncCompute,
    AsyncGraphics,
    AsyncTransfer,
}

/// Map a pass queue flag onto the physical queue it submits on, and whether
/// the pass records graphics work.
pub(crate) fn queue_type_for(flags: RenderGraphQueueFlags) -> (QueueType, bool) {
    if flags.contains(RenderGraphQueueFlags::ASYNC_COMPUTE) {
        (QueueType::AsyncCompute, false)
    } else if flags.contains(RenderGraphQueueFlags::ASYNC_GRAPHICS) {
        (QueueType::AsyncGraphics, true)
    } else if flags.contains(RenderGraphQueueFlags::COMPUTE) {
        (QueueType::Graphics, false)
    } else {
        (QueueType::Graphics, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_folds_onto_graphics_queue() {
        let mask = RenderGraphQueueFlags::GRAPHICS | RenderGraphQueueFlags::COMPUTE;
        assert!(!mask.spans_multiple_physical_queues());

        let mask = RenderGraphQueueFlags::GRAPHICS | RenderGraphQueueFlags::ASYNC_COMPUTE;
        assert!(mask.spans_multiple_physical_queues());
    }

    #[test]
    fn queue_type_mapping() {
        assert_eq!(
            queue_type_for(RenderGraphQueueFlags::GRAPHICS),
            (QueueType::Graphics, true)
        );
        assert_eq!(
            queue_type_for(RenderGraphQueueFlags::COMPUTE),
            (QueueType::Graphics, false)
        );
        assert_eq!(
            queue_type_for(RenderGraphQueueFlags::ASYNC_COMPUTE),
            (QueueType::AsyncCompute, false)
        );
        assert_eq!(
            queue_type_for(RenderGraphQueueFlags::ASYNC_GRAPHICS),
            (QueueType::AsyncGraphics, true)
        );
    }
}
