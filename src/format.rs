//! Format and surface transform helpers used when emitting barriers and
//! sizing swapchain-relative attachments.

use ash::vk;

/// Aspect mask covering every aspect of an image with this format. Used for
/// full-subresource barriers.
pub fn format_to_aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::UNDEFINED => vk::ImageAspectFlags::empty(),
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// True if the format has a depth or stencil aspect.
pub fn format_has_depth_or_stencil_aspect(format: vk::Format) -> bool {
    format != vk::Format::UNDEFINED
        && format_to_aspect_mask(format) != vk::ImageAspectFlags::COLOR
}

/// True when presenting through this pre-rotate transform swaps the X and Y
/// extents of the surface.
pub fn surface_transform_swaps_xy(transform: vk::SurfaceTransformFlagsKHR) -> bool {
    transform.intersects(
        vk::SurfaceTransformFlagsKHR::ROTATE_90
            | vk::SurfaceTransformFlagsKHR::ROTATE_270
            | vk::SurfaceTransformFlagsKHR::HORIZONTAL_MIRROR_ROTATE_90
            | vk::SurfaceTransformFlagsKHR::HORIZONTAL_MIRROR_ROTATE_270,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_classification() {
        assert_eq!(
            format_to_aspect_mask(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            format_to_aspect_mask(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            format_to_aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert!(format_has_depth_or_stencil_aspect(vk::Format::D16_UNORM));
        assert!(!format_has_depth_or_stencil_aspect(vk::Format::R8G8B8A8_SRGB));
        assert!(!format_has_depth_or_stencil_aspect(vk::Format::UNDEFINED));
    }

    #[test]
    fn rotated_transforms_swap_extents() {
        assert!(surface_transform_swaps_xy(
            vk::SurfaceTransformFlagsKHR::ROTATE_90
        ));
        assert!(!surface_transform_swaps_xy(
            vk::SurfaceTransformFlagsKHR::IDENTITY
        ));
    }
}
