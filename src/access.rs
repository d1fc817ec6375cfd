// Abstract access masks
//
// Operations describe what they do to a resource with an access mask.
// The dependency engine turns those masks into vulkan access flags,
// image layouts and pipeline stages when it emits barriers. These are
// pure mapping tables, no vulkan calls happen here.

use ash::vk;

use crate::format::Format;

use bitflags::bitflags;

bitflags! {
    /// What an operation does to a resource.
    ///
    /// The ASYNC modifiers denote which queue family the access
    /// happens on (graphics is the default). DISCARD denotes that
    /// prior contents may be thrown away.
    pub struct AccessMask: u32 {
        const VERTEX_READ      = 0x00001;
        const INDEX_READ       = 0x00002;
        const UNIFORM_READ     = 0x00004;
        const INDIRECT_READ    = 0x00008;
        const SAMPLED_READ     = 0x00010;
        const STORAGE_READ     = 0x00020;
        const STORAGE_WRITE    = 0x00040;
        const ATTACHMENT_INPUT = 0x00080;
        const ATTACHMENT_READ  = 0x00100;
        const ATTACHMENT_WRITE = 0x00200;
        const TRANSFER_READ    = 0x00400;
        const TRANSFER_WRITE   = 0x00800;
        const HOST_READ        = 0x01000;
        const HOST_WRITE       = 0x02000;

        // Modifiers.
        const COMPUTE_ASYNC  = 0x04000;
        const TRANSFER_ASYNC = 0x08000;
        const DISCARD        = 0x10000;

        const MODIFIERS = 0x1C000;
    }
}

bitflags! {
    /// Shader stages, used to narrow the pipeline stages an access
    /// mask maps to. An empty mask means "all applicable stages".
    pub struct ShaderStage: u32 {
        const VERTEX          = 0x0001;
        const TESS_CONTROL    = 0x0002;
        const TESS_EVALUATION = 0x0004;
        const GEOMETRY        = 0x0008;
        const FRAGMENT        = 0x0010;
        const COMPUTE         = 0x0020;
    }
}

impl AccessMask {
    /// Does this mask write the resource in any way.
    pub fn is_write(&self) -> bool {
        self.intersects(
            AccessMask::STORAGE_WRITE
                | AccessMask::ATTACHMENT_WRITE
                | AccessMask::TRANSFER_WRITE
                | AccessMask::HOST_WRITE,
        )
    }
}

/// Map an access mask to vulkan access flags.
///
/// Attachment reads/writes resolve to either the color or the
/// depth/stencil flavor depending on the format being accessed.
pub(crate) fn vk_access_flags(mask: AccessMask, fmt: &Format) -> vk::AccessFlags {
    let depsten = fmt.has_depth() || fmt.has_stencil();
    let mut flags = vk::AccessFlags::empty();

    if mask.contains(AccessMask::VERTEX_READ) {
        flags |= vk::AccessFlags::VERTEX_ATTRIBUTE_READ;
    }
    if mask.contains(AccessMask::INDEX_READ) {
        flags |= vk::AccessFlags::INDEX_READ;
    }
    if mask.contains(AccessMask::UNIFORM_READ) {
        flags |= vk::AccessFlags::UNIFORM_READ;
    }
    if mask.contains(AccessMask::INDIRECT_READ) {
        flags |= vk::AccessFlags::INDIRECT_COMMAND_READ;
    }
    if mask.intersects(AccessMask::SAMPLED_READ | AccessMask::STORAGE_READ) {
        flags |= vk::AccessFlags::SHADER_READ;
    }
    if mask.contains(AccessMask::STORAGE_WRITE) {
        flags |= vk::AccessFlags::SHADER_WRITE;
    }
    if mask.contains(AccessMask::ATTACHMENT_INPUT) {
        flags |= vk::AccessFlags::INPUT_ATTACHMENT_READ;
    }
    if mask.contains(AccessMask::ATTACHMENT_READ) {
        flags |= if depsten {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
        } else {
            vk::AccessFlags::COLOR_ATTACHMENT_READ
        };
    }
    if mask.contains(AccessMask::ATTACHMENT_WRITE) {
        flags |= if depsten {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        } else {
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        };
    }
    if mask.contains(AccessMask::TRANSFER_READ) {
        flags |= vk::AccessFlags::TRANSFER_READ;
    }
    if mask.contains(AccessMask::TRANSFER_WRITE) {
        flags |= vk::AccessFlags::TRANSFER_WRITE;
    }
    if mask.contains(AccessMask::HOST_READ) {
        flags |= vk::AccessFlags::HOST_READ;
    }
    if mask.contains(AccessMask::HOST_WRITE) {
        flags |= vk::AccessFlags::HOST_WRITE;
    }

    flags
}

// True when `mask` holds nothing outside `allowed` plus the modifiers.
fn only(mask: AccessMask, allowed: AccessMask) -> bool {
    !mask.intersects(!(allowed | AccessMask::MODIFIERS))
}

/// Map an access mask to the tightest image layout that all bits in
/// the mask allow, falling back to the general layout when mixed.
///
/// An empty mask means the contents are undefined (i.e. discarded).
pub(crate) fn vk_image_layout(mask: AccessMask, fmt: &Format) -> vk::ImageLayout {
    if (mask - AccessMask::MODIFIERS).is_empty() {
        return vk::ImageLayout::UNDEFINED;
    }
    if only(mask, AccessMask::TRANSFER_READ) {
        return vk::ImageLayout::TRANSFER_SRC_OPTIMAL;
    }
    if only(mask, AccessMask::TRANSFER_WRITE) {
        return vk::ImageLayout::TRANSFER_DST_OPTIMAL;
    }

    if fmt.has_depth() || fmt.has_stencil() {
        if only(
            mask,
            AccessMask::SAMPLED_READ | AccessMask::ATTACHMENT_INPUT | AccessMask::ATTACHMENT_READ,
        ) {
            return vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL;
        }
        if only(mask, AccessMask::ATTACHMENT_READ | AccessMask::ATTACHMENT_WRITE) {
            return vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL;
        }
        return vk::ImageLayout::GENERAL;
    }

    if only(mask, AccessMask::SAMPLED_READ | AccessMask::ATTACHMENT_INPUT) {
        return vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
    }
    if only(mask, AccessMask::ATTACHMENT_READ | AccessMask::ATTACHMENT_WRITE) {
        return vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL;
    }
    vk::ImageLayout::GENERAL
}

/// Map an access mask to the union of pipeline stages it touches.
///
/// Shader accesses span every shader stage unless `stage` narrows
/// them down.
pub(crate) fn vk_pipeline_stage(
    mask: AccessMask,
    stage: ShaderStage,
    fmt: &Format,
) -> vk::PipelineStageFlags {
    let mut flags = vk::PipelineStageFlags::empty();

    if mask.intersects(AccessMask::VERTEX_READ | AccessMask::INDEX_READ) {
        flags |= vk::PipelineStageFlags::VERTEX_INPUT;
    }
    if mask.contains(AccessMask::INDIRECT_READ) {
        flags |= vk::PipelineStageFlags::DRAW_INDIRECT;
    }
    if mask.intersects(
        AccessMask::UNIFORM_READ
            | AccessMask::SAMPLED_READ
            | AccessMask::STORAGE_READ
            | AccessMask::STORAGE_WRITE,
    ) {
        let all = stage.is_empty();
        if all || stage.contains(ShaderStage::VERTEX) {
            flags |= vk::PipelineStageFlags::VERTEX_SHADER;
        }
        if all || stage.contains(ShaderStage::TESS_CONTROL) {
            flags |= vk::PipelineStageFlags::TESSELLATION_CONTROL_SHADER;
        }
        if all || stage.contains(ShaderStage::TESS_EVALUATION) {
            flags |= vk::PipelineStageFlags::TESSELLATION_EVALUATION_SHADER;
        }
        if all || stage.contains(ShaderStage::GEOMETRY) {
            flags |= vk::PipelineStageFlags::GEOMETRY_SHADER;
        }
        if all || stage.contains(ShaderStage::FRAGMENT) {
            flags |= vk::PipelineStageFlags::FRAGMENT_SHADER;
        }
        if all || stage.contains(ShaderStage::COMPUTE) {
            flags |= vk::PipelineStageFlags::COMPUTE_SHADER;
        }
    }
    if mask.contains(AccessMask::ATTACHMENT_INPUT) {
        flags |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if mask.intersects(AccessMask::ATTACHMENT_READ | AccessMask::ATTACHMENT_WRITE) {
        flags |= if fmt.has_depth() || fmt.has_stencil() {
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
        } else {
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        };
    }
    if mask.intersects(AccessMask::TRANSFER_READ | AccessMask::TRANSFER_WRITE) {
        flags |= vk::PipelineStageFlags::TRANSFER;
    }
    if mask.intersects(AccessMask::HOST_READ | AccessMask::HOST_WRITE) {
        flags |= vk::PipelineStageFlags::HOST;
    }

    flags
}

/// Pick the queue family an access mask executes on.
pub(crate) fn access_family(mask: AccessMask, graphics: u32, compute: u32, transfer: u32) -> u32 {
    if mask.contains(AccessMask::COMPUTE_ASYNC) {
        compute
    } else if mask.contains(AccessMask::TRANSFER_ASYNC) {
        transfer
    } else {
        graphics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{FormatOrder, FormatType};

    fn color_fmt() -> Format {
        crate::format::fmt(FormatType::UNORM, FormatOrder::RGBA, [8, 8, 8, 8])
    }

    fn depth_fmt() -> Format {
        crate::format::fmt(FormatType::UNORM, FormatOrder::DEPTH, [16, 0, 0, 0])
    }

    #[test]
    fn transfer_maps_to_transfer() {
        let f = color_fmt();
        assert_eq!(
            vk_access_flags(AccessMask::TRANSFER_WRITE, &f),
            vk::AccessFlags::TRANSFER_WRITE
        );
        assert_eq!(
            vk_image_layout(AccessMask::TRANSFER_WRITE, &f),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(
            vk_pipeline_stage(AccessMask::TRANSFER_WRITE, ShaderStage::empty(), &f),
            vk::PipelineStageFlags::TRANSFER
        );
    }

    #[test]
    fn vertex_read_maps_to_vertex_input() {
        let f = Format::EMPTY;
        assert_eq!(
            vk_access_flags(AccessMask::VERTEX_READ, &f),
            vk::AccessFlags::VERTEX_ATTRIBUTE_READ
        );
        assert_eq!(
            vk_pipeline_stage(AccessMask::VERTEX_READ, ShaderStage::empty(), &f),
            vk::PipelineStageFlags::VERTEX_INPUT
        );
    }

    #[test]
    fn attachment_splits_on_format() {
        assert_eq!(
            vk_access_flags(AccessMask::ATTACHMENT_WRITE, &color_fmt()),
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        );
        assert_eq!(
            vk_access_flags(AccessMask::ATTACHMENT_WRITE, &depth_fmt()),
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        );
        assert_eq!(
            vk_image_layout(
                AccessMask::ATTACHMENT_READ | AccessMask::ATTACHMENT_WRITE,
                &depth_fmt()
            ),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn mixed_mask_falls_back_to_general() {
        let mask = AccessMask::SAMPLED_READ | AccessMask::TRANSFER_WRITE;
        assert_eq!(vk_image_layout(mask, &color_fmt()), vk::ImageLayout::GENERAL);
    }

    #[test]
    fn empty_mask_discards() {
        assert_eq!(
            vk_image_layout(AccessMask::DISCARD, &color_fmt()),
            vk::ImageLayout::UNDEFINED
        );
        assert_eq!(
            vk_image_layout(AccessMask::empty(), &color_fmt()),
            vk::ImageLayout::UNDEFINED
        );
    }

    #[test]
    fn stage_hint_narrows_shader_stages() {
        let f = Format::EMPTY;
        assert_eq!(
            vk_pipeline_stage(AccessMask::UNIFORM_READ, ShaderStage::FRAGMENT, &f),
            vk::PipelineStageFlags::FRAGMENT_SHADER
        );
        // No hint spans every shader stage
        let all = vk_pipeline_stage(AccessMask::UNIFORM_READ, ShaderStage::empty(), &f);
        assert!(all.contains(vk::PipelineStageFlags::VERTEX_SHADER));
        assert!(all.contains(vk::PipelineStageFlags::COMPUTE_SHADER));
    }

    #[test]
    fn async_modifiers_pick_families() {
        assert_eq!(access_family(AccessMask::TRANSFER_WRITE, 0, 1, 2), 0);
        assert_eq!(
            access_family(AccessMask::TRANSFER_WRITE | AccessMask::TRANSFER_ASYNC, 0, 1, 2),
            2
        );
        assert_eq!(
            access_family(AccessMask::STORAGE_WRITE | AccessMask::COMPUTE_ASYNC, 0, 1, 2),
            1
        );
    }
}
