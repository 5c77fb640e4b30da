//! Conversions between backend types and Vulkan types.

use crate::backend::types::*;
use ash::vk;

pub fn format_to_vk(format: Format) -> vk::Format {
    match format {
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        Format::Rgba8Snorm => vk::Format::R8G8B8A8_SNORM,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::Depth32Float => vk::Format::D32_SFLOAT,
        Format::Depth32FloatStencil8 => vk::Format::D32_SFLOAT_S8_UINT,
        Format::Depth24Stencil8 => vk::Format::D24_UNORM_S8_UINT,
        Format::Other(raw) => vk::Format::from_raw(raw),
    }
}

pub fn format_from_vk(format: vk::Format) -> Format {
    match format {
        vk::Format::R8G8B8A8_UNORM => Format::Rgba8Unorm,
        vk::Format::R8G8B8A8_SRGB => Format::Rgba8Srgb,
        vk::Format::R8G8B8A8_SNORM => Format::Rgba8Snorm,
        vk::Format::B8G8R8A8_UNORM => Format::Bgra8Unorm,
        vk::Format::B8G8R8A8_SRGB => Format::Bgra8Srgb,
        vk::Format::R16G16B16A16_SFLOAT => Format::Rgba16Float,
        vk::Format::R32G32B32A32_SFLOAT => Format::Rgba32Float,
        vk::Format::R32_SFLOAT => Format::R32Float,
        vk::Format::D32_SFLOAT => Format::Depth32Float,
        vk::Format::D32_SFLOAT_S8_UINT => Format::Depth32FloatStencil8,
        vk::Format::D24_UNORM_S8_UINT => Format::Depth24Stencil8,
        other => Format::Other(other.as_raw()),
    }
}

pub fn color_space_to_vk(color_space: ColorSpace) -> vk::ColorSpaceKHR {
    match color_space {
        ColorSpace::SrgbNonlinear => vk::ColorSpaceKHR::SRGB_NONLINEAR,
        ColorSpace::Other(raw) => vk::ColorSpaceKHR::from_raw(raw),
    }
}

pub fn color_space_from_vk(color_space: vk::ColorSpaceKHR) -> ColorSpace {
    match color_space {
        vk::ColorSpaceKHR::SRGB_NONLINEAR => ColorSpace::SrgbNonlinear,
        other => ColorSpace::Other(other.as_raw()),
    }
}

pub fn present_mode_to_vk(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

/// Modes the renderer does not model are dropped.
pub fn present_mode_from_vk(mode: vk::PresentModeKHR) -> Option<PresentMode> {
    match mode {
        vk::PresentModeKHR::IMMEDIATE => Some(PresentMode::Immediate),
        vk::PresentModeKHR::MAILBOX => Some(PresentMode::Mailbox),
        vk::PresentModeKHR::FIFO => Some(PresentMode::Fifo),
        vk::PresentModeKHR::FIFO_RELAXED => Some(PresentMode::FifoRelaxed),
        _ => None,
    }
}

pub fn image_usage_to_vk(usage: ImageUsage) -> vk::ImageUsageFlags {
    let pairs = [
        (ImageUsage::TRANSFER_SRC, vk::ImageUsageFlags::TRANSFER_SRC),
        (ImageUsage::TRANSFER_DST, vk::ImageUsageFlags::TRANSFER_DST),
        (ImageUsage::SAMPLED, vk::ImageUsageFlags::SAMPLED),
        (ImageUsage::STORAGE, vk::ImageUsageFlags::STORAGE),
        (ImageUsage::COLOR_ATTACHMENT, vk::ImageUsageFlags::COLOR_ATTACHMENT),
        (
            ImageUsage::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        ),
        (
            ImageUsage::TRANSIENT_ATTACHMENT,
            vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
        ),
        (ImageUsage::INPUT_ATTACHMENT, vk::ImageUsageFlags::INPUT_ATTACHMENT),
    ];
    pairs
        .iter()
        .filter(|(ours, _)| usage.contains(*ours))
        .fold(vk::ImageUsageFlags::empty(), |acc, (_, vk)| acc | *vk)
}

pub fn image_usage_from_vk(usage: vk::ImageUsageFlags) -> ImageUsage {
    let pairs = [
        (vk::ImageUsageFlags::TRANSFER_SRC, ImageUsage::TRANSFER_SRC),
        (vk::ImageUsageFlags::TRANSFER_DST, ImageUsage::TRANSFER_DST),
        (vk::ImageUsageFlags::SAMPLED, ImageUsage::SAMPLED),
        (vk::ImageUsageFlags::STORAGE, ImageUsage::STORAGE),
        (vk::ImageUsageFlags::COLOR_ATTACHMENT, ImageUsage::COLOR_ATTACHMENT),
        (
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            ImageUsage::DEPTH_STENCIL_ATTACHMENT,
        ),
        (
            vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
            ImageUsage::TRANSIENT_ATTACHMENT,
        ),
        (vk::ImageUsageFlags::INPUT_ATTACHMENT, ImageUsage::INPUT_ATTACHMENT),
    ];
    pairs
        .iter()
        .filter(|(vk, _)| usage.contains(*vk))
        .fold(ImageUsage::empty(), |acc, (_, ours)| acc | *ours)
}

pub fn buffer_usage_to_vk(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut result = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::TRANSFER_SRC) {
        result |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::TRANSFER_DST) {
        result |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        result |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        result |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        result |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::VERTEX) {
        result |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    result
}

pub fn memory_location_to_vk(location: MemoryLocation) -> gpu_allocator::MemoryLocation {
    match location {
        MemoryLocation::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
        MemoryLocation::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
        MemoryLocation::GpuToCpu => gpu_allocator::MemoryLocation::GpuToCpu,
    }
}

pub fn stages_to_vk(stages: PipelineStages) -> vk::PipelineStageFlags {
    let pairs = [
        (PipelineStages::TOP_OF_PIPE, vk::PipelineStageFlags::TOP_OF_PIPE),
        (PipelineStages::VERTEX_INPUT, vk::PipelineStageFlags::VERTEX_INPUT),
        (PipelineStages::VERTEX_SHADER, vk::PipelineStageFlags::VERTEX_SHADER),
        (
            PipelineStages::FRAGMENT_SHADER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        ),
        (
            PipelineStages::EARLY_FRAGMENT_TESTS,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        (
            PipelineStages::LATE_FRAGMENT_TESTS,
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        (
            PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        (PipelineStages::TRANSFER, vk::PipelineStageFlags::TRANSFER),
        (PipelineStages::BOTTOM_OF_PIPE, vk::PipelineStageFlags::BOTTOM_OF_PIPE),
    ];
    let flags = pairs
        .iter()
        .filter(|(ours, _)| stages.contains(*ours))
        .fold(vk::PipelineStageFlags::empty(), |acc, (_, vk)| acc | *vk);
    // An empty stage mask is invalid in a dependency.
    if flags.is_empty() {
        vk::PipelineStageFlags::TOP_OF_PIPE
    } else {
        flags
    }
}

pub fn access_to_vk(access: AccessFlags) -> vk::AccessFlags {
    let pairs = [
        (AccessFlags::SHADER_READ, vk::AccessFlags::SHADER_READ),
        (
            AccessFlags::INPUT_ATTACHMENT_READ,
            vk::AccessFlags::INPUT_ATTACHMENT_READ,
        ),
        (
            AccessFlags::COLOR_ATTACHMENT_READ,
            vk::AccessFlags::COLOR_ATTACHMENT_READ,
        ),
        (
            AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ),
        (
            AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ,
        ),
        (
            AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        (AccessFlags::TRANSFER_READ, vk::AccessFlags::TRANSFER_READ),
        (AccessFlags::TRANSFER_WRITE, vk::AccessFlags::TRANSFER_WRITE),
        (AccessFlags::MEMORY_READ, vk::AccessFlags::MEMORY_READ),
    ];
    pairs
        .iter()
        .filter(|(ours, _)| access.contains(*ours))
        .fold(vk::AccessFlags::empty(), |acc, (_, vk)| acc | *vk)
}

pub fn shader_stages_to_vk(stages: ShaderStages) -> vk::ShaderStageFlags {
    let mut result = vk::ShaderStageFlags::empty();
    if stages.contains(ShaderStages::VERTEX) {
        result |= vk::ShaderStageFlags::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        result |= vk::ShaderStageFlags::FRAGMENT;
    }
    result
}

pub fn layout_to_vk(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthStencilAttachment => {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        }
        ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

pub fn load_op_to_vk(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub fn store_op_to_vk(op: StoreOp) -> vk::AttachmentStoreOp {
    match op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

pub fn clear_value_to_vk(value: ClearValue) -> vk::ClearValue {
    match value {
        ClearValue::Color(float32) => vk::ClearValue {
            color: vk::ClearColorValue { float32 },
        },
        ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        },
    }
}

pub fn descriptor_type_to_vk(ty: DescriptorType) -> vk::DescriptorType {
    match ty {
        DescriptorType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorType::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
    }
}

pub fn compare_function_to_vk(func: CompareFunction) -> vk::CompareOp {
    match func {
        CompareFunction::Never => vk::CompareOp::NEVER,
        CompareFunction::Less => vk::CompareOp::LESS,
        CompareFunction::Equal => vk::CompareOp::EQUAL,
        CompareFunction::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareFunction::Greater => vk::CompareOp::GREATER,
        CompareFunction::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareFunction::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareFunction::Always => vk::CompareOp::ALWAYS,
    }
}

pub fn cull_mode_to_vk(mode: CullMode) -> vk::CullModeFlags {
    match mode {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub fn filter_to_vk(mode: FilterMode) -> vk::Filter {
    match mode {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    }
}

pub fn mipmap_mode_to_vk(mode: FilterMode) -> vk::SamplerMipmapMode {
    match mode {
        FilterMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        FilterMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub fn address_mode_to_vk(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirrorRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
    }
}

pub fn vertex_format_to_vk(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::Float32 => vk::Format::R32_SFLOAT,
        VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
    }
}

/// Aspect mask covering every aspect of an image of `format`
pub fn aspect_for(format: Format) -> vk::ImageAspectFlags {
    if format.has_stencil() {
        vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
    } else if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Aspect mask usable for views and copies, which take depth alone
pub fn view_aspect_for(format: Format) -> vk::ImageAspectFlags {
    if format.is_depth() {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_round_trips_known_formats() {
        for format in [
            Format::Rgba8Srgb,
            Format::Rgba8Snorm,
            Format::Bgra8Srgb,
            Format::Rgba32Float,
            Format::R32Float,
            Format::Depth32FloatStencil8,
        ] {
            assert_eq!(format_from_vk(format_to_vk(format)), format);
        }
        assert_eq!(
            format_from_vk(vk::Format::R5G6B5_UNORM_PACK16),
            Format::Other(vk::Format::R5G6B5_UNORM_PACK16.as_raw())
        );
    }

    #[test]
    fn test_empty_stage_mask_becomes_top_of_pipe() {
        assert_eq!(
            stages_to_vk(PipelineStages::empty()),
            vk::PipelineStageFlags::TOP_OF_PIPE
        );
    }

    #[test]
    fn test_depth_stencil_aspects() {
        assert_eq!(
            aspect_for(Format::Depth32FloatStencil8),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            view_aspect_for(Format::Depth32FloatStencil8),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(aspect_for(Format::Rgba8Unorm), vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn test_usage_round_trip() {
        let usage = ImageUsage::COLOR_ATTACHMENT | ImageUsage::INPUT_ATTACHMENT;
        assert_eq!(image_usage_from_vk(image_usage_to_vk(usage)), usage);
    }
}
