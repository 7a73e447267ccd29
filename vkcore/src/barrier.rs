//! Layout and access tables plus barrier builders.
//!
//! Every barrier the backend records is built here. Stages are kept
//! coarse (`ALL_COMMANDS`); the access masks carry the real information
//! and come from [`layout_access`].

use ash::vk;

use crate::subresource::SubresourceRange;

/// How an image is going to be used. Drives its optimal layout and the
/// access mask for `GENERAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ImageUsageClass {
    pub load_store: bool,
    pub render_target: bool,
    pub depth_stencil: bool,
    pub dynamic: bool,
}

impl ImageUsageClass {
    /// Layout an image rests in between uses.
    pub fn optimal_layout(self) -> vk::ImageLayout {
        if self.load_store {
            vk::ImageLayout::GENERAL
        } else if self.depth_stencil {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        } else if self.dynamic && !self.render_target {
            vk::ImageLayout::GENERAL
        } else {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        }
    }
}

/// Accesses that may be outstanding on an image in `layout`.
pub fn layout_access(
    layout: vk::ImageLayout,
    usage: ImageUsageClass,
    read_only: bool,
) -> vk::AccessFlags2 {
    use vk::AccessFlags2 as A;
    match layout {
        vk::ImageLayout::GENERAL => {
            let mut access = A::SHADER_READ;
            if usage.load_store && !read_only {
                access |= A::SHADER_WRITE;
            }
            if usage.render_target {
                access |= A::COLOR_ATTACHMENT_READ;
                if !read_only {
                    access |= A::COLOR_ATTACHMENT_WRITE;
                }
            } else if usage.depth_stencil {
                access |= A::DEPTH_STENCIL_ATTACHMENT_READ;
                if !read_only {
                    access |= A::DEPTH_STENCIL_ATTACHMENT_WRITE;
                }
            }
            access
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL => {
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::SHADER_READ
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => A::SHADER_READ,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => A::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => A::TRANSFER_WRITE,
        vk::ImageLayout::UNDEFINED | vk::ImageLayout::PREINITIALIZED => A::NONE,
        other => {
            tracing::warn!("Unsupported source layout for image: {other:?}");
            A::NONE
        }
    }
}

/// Layout transition for `range`.
pub fn image_barrier(
    image: vk::Image,
    aspect: vk::ImageAspectFlags,
    range: SubresourceRange,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags2,
    dst_access: vk::AccessFlags2,
) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range.to_vk(aspect))
}

pub fn buffer_barrier(
    buffer: vk::Buffer,
    src_access: vk::AccessFlags2,
    dst_access: vk::AccessFlags2,
    src_stage: vk::PipelineStageFlags2,
    dst_stage: vk::PipelineStageFlags2,
) -> vk::BufferMemoryBarrier2<'static> {
    vk::BufferMemoryBarrier2::default()
        .src_stage_mask(src_stage)
        .dst_stage_mask(dst_stage)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
}

/// Full memory dependency between everything before and after it on the
/// same queue.
pub fn full_memory_barrier() -> vk::MemoryBarrier2<'static> {
    vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)
}

/// Makes device writes visible to host reads once the submission is
/// waited on.
pub fn host_read_barrier() -> vk::MemoryBarrier2<'static> {
    vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_stage_mask(vk::PipelineStageFlags2::HOST)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_access_mask(vk::AccessFlags2::HOST_READ | vk::AccessFlags2::HOST_WRITE)
}

/// Aspect mask for a view or barrier on `format`.
pub fn aspect_flags(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimal_layout_by_usage() {
        let load_store = ImageUsageClass {
            load_store: true,
            depth_stencil: true,
            ..Default::default()
        };
        assert_eq!(load_store.optimal_layout(), vk::ImageLayout::GENERAL);

        let depth = ImageUsageClass {
            depth_stencil: true,
            ..Default::default()
        };
        assert_eq!(
            depth.optimal_layout(),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );

        let dynamic = ImageUsageClass {
            dynamic: true,
            ..Default::default()
        };
        assert_eq!(dynamic.optimal_layout(), vk::ImageLayout::GENERAL);

        let target = ImageUsageClass {
            render_target: true,
            ..Default::default()
        };
        assert_eq!(
            target.optimal_layout(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            ImageUsageClass::default().optimal_layout(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn general_layout_access_depends_on_usage() {
        use vk::AccessFlags2 as A;
        let storage = ImageUsageClass {
            load_store: true,
            ..Default::default()
        };
        let access = layout_access(vk::ImageLayout::GENERAL, storage, false);
        assert_eq!(access, A::SHADER_READ | A::SHADER_WRITE);
        let access = layout_access(vk::ImageLayout::GENERAL, storage, true);
        assert_eq!(access, A::SHADER_READ);

        let target = ImageUsageClass {
            render_target: true,
            ..Default::default()
        };
        let access = layout_access(vk::ImageLayout::GENERAL, target, false);
        assert!(access.contains(A::COLOR_ATTACHMENT_WRITE));
    }

    #[test]
    fn fixed_layouts() {
        use vk::AccessFlags2 as A;
        let any = ImageUsageClass::default();
        assert_eq!(
            layout_access(vk::ImageLayout::TRANSFER_DST_OPTIMAL, any, false),
            A::TRANSFER_WRITE
        );
        assert_eq!(
            layout_access(vk::ImageLayout::TRANSFER_SRC_OPTIMAL, any, false),
            A::TRANSFER_READ
        );
        assert_eq!(
            layout_access(vk::ImageLayout::PREINITIALIZED, any, false),
            A::NONE
        );
        assert_eq!(
            layout_access(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL, any, false),
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::SHADER_READ
        );
    }

    #[test]
    fn depth_formats_get_depth_aspects() {
        assert_eq!(
            aspect_flags(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(aspect_flags(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_flags(vk::Format::R8G8B8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }
}
