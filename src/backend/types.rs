//! Common types shared between backends

use bytemuck::{Pod, Zeroable};

/// Declares a `u32` flag set with `contains`/`BitOr` like the rest of the backend types.
macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: Self = Self($bit);)*

            pub const fn empty() -> Self {
                Self(0)
            }

            pub fn contains(&self, other: Self) -> bool {
                (self.0 & other.0) == other.0
            }

            pub fn intersects(&self, other: Self) -> bool {
                (self.0 & other.0) != 0
            }

            pub fn is_empty(&self) -> bool {
                self.0 == 0
            }

            pub fn bits(&self) -> u32 {
                self.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self::Output {
                Self(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

/// Texel format of images and attachments.
///
/// `Other` carries a raw API value for surface formats the renderer does not
/// model but a platform may still report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba8Unorm,
    Rgba8Srgb,
    Rgba8Snorm,
    Bgra8Unorm,
    Bgra8Srgb,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    Depth32Float,
    Depth32FloatStencil8,
    Depth24Stencil8,
    Other(i32),
}

impl Format {
    pub fn is_depth(&self) -> bool {
        matches!(
            self,
            Format::Depth32Float | Format::Depth32FloatStencil8 | Format::Depth24Stencil8
        )
    }

    pub fn has_stencil(&self) -> bool {
        matches!(self, Format::Depth32FloatStencil8 | Format::Depth24Stencil8)
    }

    pub fn is_srgb(&self) -> bool {
        matches!(self, Format::Rgba8Srgb | Format::Bgra8Srgb)
    }

    /// Size of one texel in bytes, `None` for formats the renderer cannot address.
    pub fn bytes_per_pixel(&self) -> Option<u32> {
        match self {
            Format::Rgba8Unorm
            | Format::Rgba8Srgb
            | Format::Rgba8Snorm
            | Format::Bgra8Unorm
            | Format::Bgra8Srgb
            | Format::R32Float
            | Format::Depth32Float
            | Format::Depth24Stencil8 => Some(4),
            Format::Rgba16Float | Format::Depth32FloatStencil8 => Some(8),
            Format::Rgba32Float => Some(16),
            Format::Other(_) => None,
        }
    }
}

/// Color space paired with a surface format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    SrgbNonlinear,
    Other(i32),
}

/// A format/color-space pair a surface can present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceFormat {
    pub format: Format,
    pub color_space: ColorSpace,
}

/// Presentation mode of a swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    /// Always supported by a conforming platform.
    Fifo,
    FifoRelaxed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent2D {
    pub width: u32,
    pub height: u32,
}

impl Extent2D {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn texel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn aspect(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// Capabilities a surface reports for swapchain creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    pub min_image_count: u32,
    /// Zero means no upper bound.
    pub max_image_count: u32,
    /// `None` when the surface lets the swapchain pick its extent.
    pub current_extent: Option<Extent2D>,
    pub min_image_extent: Extent2D,
    pub max_image_extent: Extent2D,
    pub supported_usage: ImageUsage,
}

/// Everything the platform reports about a surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceSupport {
    pub capabilities: SurfaceCapabilities,
    pub formats: Vec<SurfaceFormat>,
    pub present_modes: Vec<PresentMode>,
}

flag_set!(
    /// Image usage flags, declared at creation time.
    ImageUsage {
        TRANSFER_SRC = 1 << 0,
        TRANSFER_DST = 1 << 1,
        SAMPLED = 1 << 2,
        STORAGE = 1 << 3,
        COLOR_ATTACHMENT = 1 << 4,
        DEPTH_STENCIL_ATTACHMENT = 1 << 5,
        TRANSIENT_ATTACHMENT = 1 << 6,
        INPUT_ATTACHMENT = 1 << 7,
    }
);

flag_set!(
    /// Buffer usage flags
    BufferUsage {
        TRANSFER_SRC = 1 << 0,
        TRANSFER_DST = 1 << 1,
        UNIFORM = 1 << 2,
        STORAGE = 1 << 3,
        INDEX = 1 << 4,
        VERTEX = 1 << 5,
    }
);

flag_set!(
    /// Pipeline stages used by submission waits and subpass dependencies.
    PipelineStages {
        TOP_OF_PIPE = 1 << 0,
        VERTEX_INPUT = 1 << 1,
        VERTEX_SHADER = 1 << 2,
        FRAGMENT_SHADER = 1 << 3,
        EARLY_FRAGMENT_TESTS = 1 << 4,
        LATE_FRAGMENT_TESTS = 1 << 5,
        COLOR_ATTACHMENT_OUTPUT = 1 << 6,
        TRANSFER = 1 << 7,
        BOTTOM_OF_PIPE = 1 << 8,
    }
);

flag_set!(
    /// Memory access flags for dependencies and barriers.
    AccessFlags {
        SHADER_READ = 1 << 0,
        INPUT_ATTACHMENT_READ = 1 << 1,
        COLOR_ATTACHMENT_READ = 1 << 2,
        COLOR_ATTACHMENT_WRITE = 1 << 3,
        DEPTH_STENCIL_ATTACHMENT_READ = 1 << 4,
        DEPTH_STENCIL_ATTACHMENT_WRITE = 1 << 5,
        TRANSFER_READ = 1 << 6,
        TRANSFER_WRITE = 1 << 7,
        MEMORY_READ = 1 << 8,
    }
);

flag_set!(
    /// Shader stages a binding or push-constant range is visible to.
    ShaderStages {
        VERTEX = 1 << 0,
        FRAGMENT = 1 << 1,
        ALL_GRAPHICS = (1 << 0) | (1 << 1),
    }
);

/// A single programmable stage, used to key shader bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn flags(&self) -> ShaderStages {
        match self {
            ShaderStage::Vertex => ShaderStages::VERTEX,
            ShaderStage::Fragment => ShaderStages::FRAGMENT,
        }
    }
}

/// Memory placement for allocations, mirroring the allocator's locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    GpuOnly,
    CpuToGpu,
    GpuToCpu,
}

impl MemoryLocation {
    pub fn is_host_visible(&self) -> bool {
        !matches!(self, MemoryLocation::GpuOnly)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    DontCare,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub const BLACK: Self = ClearValue::Color([0.0, 0.0, 0.0, 1.0]);
    pub const TRANSPARENT: Self = ClearValue::Color([0.0; 4]);
    pub const DEPTH_ONE: Self = ClearValue::DepthStencil {
        depth: 1.0,
        stencil: 0,
    };
}

/// Kind of resource a descriptor binding exposes to shaders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    UniformBuffer,
    CombinedImageSampler,
    InputAttachment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressMode {
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

#[derive(Debug, Clone)]
pub struct SamplerDescriptor {
    pub label: Option<String>,
    pub filter: FilterMode,
    pub address_mode: AddressMode,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            filter: FilterMode::Nearest,
            address_mode: AddressMode::ClampToEdge,
        }
    }
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
}

impl VertexFormat {
    pub fn size(&self) -> u32 {
        match self {
            VertexFormat::Float32 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub offset: u32,
    pub format: VertexFormat,
}

/// Layout of the single interleaved vertex buffer a pipeline consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexLayout {
    pub stride: u32,
    pub attributes: Vec<VertexAttribute>,
}

/// Standard vertex format for static meshes
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub color: [f32; 4],
    pub uv: [f32; 2],
}

impl Vertex {
    pub fn new(position: [f32; 3], normal: [f32; 3], color: [f32; 4], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            color,
            uv,
        }
    }

    pub fn layout() -> VertexLayout {
        VertexLayout {
            stride: std::mem::size_of::<Vertex>() as u32,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    offset: 0,
                    format: VertexFormat::Float32x3,
                },
                VertexAttribute {
                    location: 1,
                    offset: 12,
                    format: VertexFormat::Float32x3,
                },
                VertexAttribute {
                    location: 2,
                    offset: 24,
                    format: VertexFormat::Float32x4,
                },
                VertexAttribute {
                    location: 3,
                    offset: 40,
                    format: VertexFormat::Float32x2,
                },
            ],
        }
    }
}
