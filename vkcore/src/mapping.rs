//! Lookup tables from backend-neutral render state to Vulkan enums.
//!
//! Every table is a `const` array indexed by the discriminant of the
//! abstract enum, so a conversion is one bounds-checked load. The `ALL`
//! arrays list the variants in table order; the tests check the two stay
//! in step.

use ash::vk;
use vkcore_reflect::ShaderStage;
use vkcore_reflect::manifest::BindingKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendFactor {
    #[default]
    One,
    Zero,
    DestColor,
    SourceColor,
    InvDestColor,
    InvSourceColor,
    DestAlpha,
    SourceAlpha,
    InvDestAlpha,
    InvSourceAlpha,
}

impl BlendFactor {
    pub const ALL: [Self; 10] = [
        Self::One,
        Self::Zero,
        Self::DestColor,
        Self::SourceColor,
        Self::InvDestColor,
        Self::InvSourceColor,
        Self::DestAlpha,
        Self::SourceAlpha,
        Self::InvDestAlpha,
        Self::InvSourceAlpha,
    ];
}

const BLEND_FACTORS: [vk::BlendFactor; 10] = [
    vk::BlendFactor::ONE,
    vk::BlendFactor::ZERO,
    vk::BlendFactor::DST_COLOR,
    vk::BlendFactor::SRC_COLOR,
    vk::BlendFactor::ONE_MINUS_DST_COLOR,
    vk::BlendFactor::ONE_MINUS_SRC_COLOR,
    vk::BlendFactor::DST_ALPHA,
    vk::BlendFactor::SRC_ALPHA,
    vk::BlendFactor::ONE_MINUS_DST_ALPHA,
    vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
];

impl From<BlendFactor> for vk::BlendFactor {
    fn from(value: BlendFactor) -> Self {
        BLEND_FACTORS[value as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

impl BlendOp {
    pub const ALL: [Self; 5] = [
        Self::Add,
        Self::Subtract,
        Self::ReverseSubtract,
        Self::Min,
        Self::Max,
    ];
}

const BLEND_OPS: [vk::BlendOp; 5] = [
    vk::BlendOp::ADD,
    vk::BlendOp::SUBTRACT,
    vk::BlendOp::REVERSE_SUBTRACT,
    vk::BlendOp::MIN,
    vk::BlendOp::MAX,
];

impl From<BlendOp> for vk::BlendOp {
    fn from(value: BlendOp) -> Self {
        BLEND_OPS[value as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareFunc {
    AlwaysFail,
    AlwaysPass,
    Less,
    #[default]
    LessEqual,
    Equal,
    NotEqual,
    GreaterEqual,
    Greater,
}

impl CompareFunc {
    pub const ALL: [Self; 8] = [
        Self::AlwaysFail,
        Self::AlwaysPass,
        Self::Less,
        Self::LessEqual,
        Self::Equal,
        Self::NotEqual,
        Self::GreaterEqual,
        Self::Greater,
    ];
}

const COMPARE_OPS: [vk::CompareOp; 8] = [
    vk::CompareOp::NEVER,
    vk::CompareOp::ALWAYS,
    vk::CompareOp::LESS,
    vk::CompareOp::LESS_OR_EQUAL,
    vk::CompareOp::EQUAL,
    vk::CompareOp::NOT_EQUAL,
    vk::CompareOp::GREATER_OR_EQUAL,
    vk::CompareOp::GREATER,
];

impl From<CompareFunc> for vk::CompareOp {
    fn from(value: CompareFunc) -> Self {
        COMPARE_OPS[value as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    Increment,
    Decrement,
    IncrementWrap,
    DecrementWrap,
    Invert,
}

impl StencilOp {
    pub const ALL: [Self; 8] = [
        Self::Keep,
        Self::Zero,
        Self::Replace,
        Self::Increment,
        Self::Decrement,
        Self::IncrementWrap,
        Self::DecrementWrap,
        Self::Invert,
    ];
}

const STENCIL_OPS: [vk::StencilOp; 8] = [
    vk::StencilOp::KEEP,
    vk::StencilOp::ZERO,
    vk::StencilOp::REPLACE,
    vk::StencilOp::INCREMENT_AND_CLAMP,
    vk::StencilOp::DECREMENT_AND_CLAMP,
    vk::StencilOp::INCREMENT_AND_WRAP,
    vk::StencilOp::DECREMENT_AND_WRAP,
    vk::StencilOp::INVERT,
];

impl From<StencilOp> for vk::StencilOp {
    fn from(value: StencilOp) -> Self {
        STENCIL_OPS[value as usize]
    }
}

/// Which winding gets culled. Pipelines treat clockwise as front facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    Clockwise,
    #[default]
    CounterClockwise,
}

impl CullMode {
    pub const ALL: [Self; 3] = [Self::None, Self::Clockwise, Self::CounterClockwise];
}

const CULL_MODES: [vk::CullModeFlags; 3] = [
    vk::CullModeFlags::NONE,
    vk::CullModeFlags::FRONT,
    vk::CullModeFlags::BACK,
];

impl From<CullMode> for vk::CullModeFlags {
    fn from(value: CullMode) -> Self {
        CULL_MODES[value as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PolygonMode {
    #[default]
    Solid,
    Wireframe,
}

impl PolygonMode {
    pub const ALL: [Self; 2] = [Self::Solid, Self::Wireframe];
}

const POLYGON_MODES: [vk::PolygonMode; 2] = [vk::PolygonMode::FILL, vk::PolygonMode::LINE];

impl From<PolygonMode> for vk::PolygonMode {
    fn from(value: PolygonMode) -> Self {
        POLYGON_MODES[value as usize]
    }
}

/// Primitive topology of a draw. Part of the pipeline key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DrawOp {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
    TriangleFan,
}

impl DrawOp {
    pub const ALL: [Self; 6] = [
        Self::PointList,
        Self::LineList,
        Self::LineStrip,
        Self::TriangleList,
        Self::TriangleStrip,
        Self::TriangleFan,
    ];
}

const TOPOLOGIES: [vk::PrimitiveTopology; 6] = [
    vk::PrimitiveTopology::POINT_LIST,
    vk::PrimitiveTopology::LINE_LIST,
    vk::PrimitiveTopology::LINE_STRIP,
    vk::PrimitiveTopology::TRIANGLE_LIST,
    vk::PrimitiveTopology::TRIANGLE_STRIP,
    vk::PrimitiveTopology::TRIANGLE_FAN,
];

impl From<DrawOp> for vk::PrimitiveTopology {
    fn from(value: DrawOp) -> Self {
        TOPOLOGIES[value as usize]
    }
}

/// Storage type of one vertex element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexElementType {
    Float1,
    Float2,
    Float3,
    Float4,
    /// Four normalized bytes, usually a packed RGBA colour.
    Color,
    UByte4,
    UByte4Norm,
    Short2,
    Short4,
    UShort2,
    UShort4,
    Int1,
    Int2,
    Int3,
    Int4,
    UInt1,
    UInt2,
    UInt3,
    UInt4,
    Half2,
    Half4,
}

impl VertexElementType {
    pub const ALL: [Self; 21] = [
        Self::Float1,
        Self::Float2,
        Self::Float3,
        Self::Float4,
        Self::Color,
        Self::UByte4,
        Self::UByte4Norm,
        Self::Short2,
        Self::Short4,
        Self::UShort2,
        Self::UShort4,
        Self::Int1,
        Self::Int2,
        Self::Int3,
        Self::Int4,
        Self::UInt1,
        Self::UInt2,
        Self::UInt3,
        Self::UInt4,
        Self::Half2,
        Self::Half4,
    ];

    /// Size of one element in bytes.
    pub fn size(self) -> u32 {
        VERTEX_ELEMENTS[self as usize].1
    }
}

const VERTEX_ELEMENTS: [(vk::Format, u32); 21] = [
    (vk::Format::R32_SFLOAT, 4),
    (vk::Format::R32G32_SFLOAT, 8),
    (vk::Format::R32G32B32_SFLOAT, 12),
    (vk::Format::R32G32B32A32_SFLOAT, 16),
    (vk::Format::R8G8B8A8_UNORM, 4),
    (vk::Format::R8G8B8A8_UINT, 4),
    (vk::Format::R8G8B8A8_UNORM, 4),
    (vk::Format::R16G16_SINT, 4),
    (vk::Format::R16G16B16A16_SINT, 8),
    (vk::Format::R16G16_UINT, 4),
    (vk::Format::R16G16B16A16_UINT, 8),
    (vk::Format::R32_SINT, 4),
    (vk::Format::R32G32_SINT, 8),
    (vk::Format::R32G32B32_SINT, 12),
    (vk::Format::R32G32B32A32_SINT, 16),
    (vk::Format::R32_UINT, 4),
    (vk::Format::R32G32_UINT, 8),
    (vk::Format::R32G32B32_UINT, 12),
    (vk::Format::R32G32B32A32_UINT, 16),
    (vk::Format::R16G16_SFLOAT, 4),
    (vk::Format::R16G16B16A16_SFLOAT, 8),
];

impl From<VertexElementType> for vk::Format {
    fn from(value: VertexElementType) -> Self {
        VERTEX_ELEMENTS[value as usize].0
    }
}

pub fn shader_stage_flags(stage: ShaderStage) -> vk::ShaderStageFlags {
    match stage {
        ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
        ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
        ShaderStage::TessControl => vk::ShaderStageFlags::TESSELLATION_CONTROL,
        ShaderStage::TessEvaluation => vk::ShaderStageFlags::TESSELLATION_EVALUATION,
    }
}

pub fn descriptor_type(kind: BindingKind) -> vk::DescriptorType {
    match kind {
        BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        BindingKind::Sampler => vk::DescriptorType::SAMPLER,
        BindingKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        BindingKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        BindingKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        BindingKind::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
        BindingKind::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
    }
}

static TEXEL_SIZES: &[(vk::Format, u32)] = &[
    (vk::Format::R8_UNORM, 1),
    (vk::Format::R8_UINT, 1),
    (vk::Format::R8G8_UNORM, 2),
    (vk::Format::R8G8B8A8_UNORM, 4),
    (vk::Format::R8G8B8A8_SRGB, 4),
    (vk::Format::R8G8B8A8_UINT, 4),
    (vk::Format::B8G8R8A8_UNORM, 4),
    (vk::Format::B8G8R8A8_SRGB, 4),
    (vk::Format::R16_SFLOAT, 2),
    (vk::Format::R16_UINT, 2),
    (vk::Format::R16G16_SFLOAT, 4),
    (vk::Format::R16G16B16A16_SFLOAT, 8),
    (vk::Format::R16G16B16A16_UNORM, 8),
    (vk::Format::R32_SFLOAT, 4),
    (vk::Format::R32_UINT, 4),
    (vk::Format::R32_SINT, 4),
    (vk::Format::R32G32_SFLOAT, 8),
    (vk::Format::R32G32B32A32_SFLOAT, 16),
    (vk::Format::R32G32B32A32_UINT, 16),
    (vk::Format::A2B10G10R10_UNORM_PACK32, 4),
    (vk::Format::B10G11R11_UFLOAT_PACK32, 4),
    (vk::Format::D16_UNORM, 2),
    (vk::Format::D32_SFLOAT, 4),
    (vk::Format::D24_UNORM_S8_UINT, 4),
    (vk::Format::D32_SFLOAT_S8_UINT, 8),
];

/// Bytes per texel of an uncompressed format, or `None` for formats the
/// CPU access paths do not handle.
pub fn texel_size(format: vk::Format) -> Option<u32> {
    TEXEL_SIZES
        .iter()
        .find(|(f, _)| *f == format)
        .map(|&(_, size)| size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_follow_variant_order() {
        for (i, v) in BlendFactor::ALL.iter().enumerate() {
            assert_eq!(*v as usize, i);
        }
        for (i, v) in BlendOp::ALL.iter().enumerate() {
            assert_eq!(*v as usize, i);
        }
        for (i, v) in CompareFunc::ALL.iter().enumerate() {
            assert_eq!(*v as usize, i);
        }
        for (i, v) in StencilOp::ALL.iter().enumerate() {
            assert_eq!(*v as usize, i);
        }
        for (i, v) in DrawOp::ALL.iter().enumerate() {
            assert_eq!(*v as usize, i);
        }
        for (i, v) in VertexElementType::ALL.iter().enumerate() {
            assert_eq!(*v as usize, i);
        }
    }

    #[test]
    fn spot_check_conversions() {
        assert_eq!(
            vk::BlendFactor::from(BlendFactor::InvSourceAlpha),
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA
        );
        assert_eq!(vk::CompareOp::from(CompareFunc::AlwaysFail), vk::CompareOp::NEVER);
        assert_eq!(
            vk::StencilOp::from(StencilOp::IncrementWrap),
            vk::StencilOp::INCREMENT_AND_WRAP
        );
        assert_eq!(vk::CullModeFlags::from(CullMode::Clockwise), vk::CullModeFlags::FRONT);
        assert_eq!(vk::PolygonMode::from(PolygonMode::Wireframe), vk::PolygonMode::LINE);
        assert_eq!(
            vk::PrimitiveTopology::from(DrawOp::TriangleStrip),
            vk::PrimitiveTopology::TRIANGLE_STRIP
        );
    }

    #[test]
    fn vertex_element_sizes() {
        assert_eq!(VertexElementType::Float3.size(), 12);
        assert_eq!(VertexElementType::Color.size(), 4);
        assert_eq!(VertexElementType::Half4.size(), 8);
        assert_eq!(vk::Format::from(VertexElementType::Float2), vk::Format::R32G32_SFLOAT);
    }

    #[test]
    fn texel_sizes() {
        assert_eq!(texel_size(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(texel_size(vk::Format::D16_UNORM), Some(2));
        assert_eq!(texel_size(vk::Format::BC1_RGB_UNORM_BLOCK), None);
    }

    #[test]
    fn binding_kinds_map_to_descriptor_types() {
        assert_eq!(
            descriptor_type(BindingKind::CombinedImageSampler),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(
            descriptor_type(BindingKind::UniformTexelBuffer),
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER
        );
        assert_eq!(
            shader_stage_flags(ShaderStage::TessControl),
            vk::ShaderStageFlags::TESSELLATION_CONTROL
        );
    }
}
