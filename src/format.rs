// The format dictionary
//
// Every device carries a table of (abstract format, vulkan format,
// format properties) records. It is a plain vector and not a map
// because the interesting queries are fuzzy: find the best supported
// match for a partially specified format.

use ash::vk;

use bitflags::bitflags;

bitflags! {
    /// Numeric interpretation of the format components.
    pub struct FormatType: u32 {
        const UNORM   = 0x0001;
        const SNORM   = 0x0002;
        const USCALED = 0x0004;
        const SSCALED = 0x0008;
        const UINT    = 0x0010;
        const SINT    = 0x0020;
        const UFLOAT  = 0x0040;
        const SFLOAT  = 0x0080;
        const SRGB    = 0x0100;
    }
}

bitflags! {
    /// Component layout of a format.
    ///
    /// Compressed orders only ever match exactly, so each compressed
    /// scheme gets its own bit.
    pub struct FormatOrder: u64 {
        const R    = 0x0001;
        const RG   = 0x0002;
        const RGB  = 0x0004;
        const BGR  = 0x0008;
        const RGBA = 0x0010;
        const BGRA = 0x0020;
        const ARGB = 0x0040;
        const ABGR = 0x0080;
        const ERGB = 0x0100;

        const DEPTH         = 0x0200;
        const STENCIL       = 0x0400;
        const DEPTH_STENCIL = 0x0800;

        const BC1  = 0x0000_1000;
        const BC2  = 0x0000_2000;
        const BC3  = 0x0000_4000;
        const BC4  = 0x0000_8000;
        const BC5  = 0x0001_0000;
        const BC6  = 0x0002_0000;
        const BC7  = 0x0004_0000;
        const ETC2 = 0x0008_0000;
        const EAC  = 0x0010_0000;

        const ASTC_4X4   = 0x0020_0000;
        const ASTC_5X4   = 0x0040_0000;
        const ASTC_5X5   = 0x0080_0000;
        const ASTC_6X5   = 0x0100_0000;
        const ASTC_6X6   = 0x0200_0000;
        const ASTC_8X5   = 0x0400_0000;
        const ASTC_8X6   = 0x0800_0000;
        const ASTC_8X8   = 0x1000_0000;
        const ASTC_10X5  = 0x2000_0000;
        const ASTC_10X6  = 0x4000_0000;
        const ASTC_10X8  = 0x8000_0000;
        const ASTC_10X10 = 0x0001_0000_0000;
        const ASTC_12X10 = 0x0002_0000_0000;
        const ASTC_12X12 = 0x0004_0000_0000;

        const COMPRESSED = 0x0007_FFFF_F000;
    }
}

bitflags! {
    /// Reported feature support of a format on some device.
    pub struct FormatFeatures: u32 {
        const VERTEX_BUFFER        = 0x0001;
        const UNIFORM_TEXEL_BUFFER = 0x0002;
        const STORAGE_TEXEL_BUFFER = 0x0004;
        const SAMPLED_IMAGE        = 0x0008;
        const SAMPLED_IMAGE_LINEAR = 0x0010;
        const SAMPLED_IMAGE_MINMAX = 0x0020;
        const STORAGE_IMAGE        = 0x0040;
        const ATTACHMENT           = 0x0080;
        const ATTACHMENT_BLEND     = 0x0100;
        const IMAGE_READ           = 0x0200;
        const IMAGE_WRITE          = 0x0400;
    }
}

bitflags! {
    /// Behavior modifiers for fuzzy format searches.
    pub struct FuzzyFlags: u32 {
        /// Returned format must have at least the given channel depths.
        const MIN_DEPTH = 0x0001;
        /// Returned format must have at most the given channel depths.
        const MAX_DEPTH = 0x0002;
    }
}

/// An abstract format: numeric type, component order and the bit
/// depth of each component (in component order).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Format {
    pub ftype: FormatType,
    pub order: FormatOrder,
    pub comps: [u8; 4],
}

pub(crate) const fn fmt(ftype: FormatType, order: FormatOrder, comps: [u8; 4]) -> Format {
    Format {
        ftype: ftype,
        order: order,
        comps: comps,
    }
}

impl Format {
    pub const EMPTY: Format = fmt(FormatType::empty(), FormatOrder::empty(), [0; 4]);

    pub fn is_empty(&self) -> bool {
        self.ftype.is_empty() && self.order.is_empty()
    }

    pub fn is_compressed(&self) -> bool {
        self.order.intersects(FormatOrder::COMPRESSED)
    }

    pub fn has_depth(&self) -> bool {
        self.order
            .intersects(FormatOrder::DEPTH | FormatOrder::DEPTH_STENCIL)
    }

    pub fn has_stencil(&self) -> bool {
        self.order
            .intersects(FormatOrder::STENCIL | FormatOrder::DEPTH_STENCIL)
    }

    /// Check if self is contained in other: same or narrower type and
    /// order bits, and no channel deeper than other's.
    pub fn is_contained(&self, other: &Format) -> bool {
        (self.ftype & other.ftype) == self.ftype
            && (self.order & other.order) == self.order
            && self.comps[0] <= other.comps[0]
            && self.comps[1] <= other.comps[1]
            && self.comps[2] <= other.comps[2]
            && self.comps[3] <= other.comps[3]
    }

    /// L1 distance of the per-channel bit depth vectors.
    pub fn distance(&self, other: &Format) -> u32 {
        let mut d = 0u32;
        for i in 0..4 {
            d += (self.comps[i] as i32 - other.comps[i] as i32).abs() as u32;
        }
        d
    }
}

/// One element of the per-device format dictionary.
pub(crate) struct FormatRecord {
    pub fmt: Format,
    pub vk_format: vk::Format,
    pub props: vk::FormatProperties,
}

/// Translate vulkan format properties into our feature bits.
pub(crate) fn features_of(props: &vk::FormatProperties) -> FormatFeatures {
    let mut feat = FormatFeatures::empty();
    let buf = props.buffer_features;
    let opt = props.optimal_tiling_features;

    if buf.contains(vk::FormatFeatureFlags::VERTEX_BUFFER) {
        feat |= FormatFeatures::VERTEX_BUFFER;
    }
    if buf.contains(vk::FormatFeatureFlags::UNIFORM_TEXEL_BUFFER) {
        feat |= FormatFeatures::UNIFORM_TEXEL_BUFFER;
    }
    if buf.contains(vk::FormatFeatureFlags::STORAGE_TEXEL_BUFFER) {
        feat |= FormatFeatures::STORAGE_TEXEL_BUFFER;
    }
    if opt.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE) {
        feat |= FormatFeatures::SAMPLED_IMAGE;
    }
    if opt.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR) {
        feat |= FormatFeatures::SAMPLED_IMAGE_LINEAR;
    }
    if opt.contains(vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_MINMAX) {
        feat |= FormatFeatures::SAMPLED_IMAGE_MINMAX;
    }
    if opt.contains(vk::FormatFeatureFlags::STORAGE_IMAGE) {
        feat |= FormatFeatures::STORAGE_IMAGE;
    }
    if opt.contains(vk::FormatFeatureFlags::COLOR_ATTACHMENT)
        || opt.contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    {
        feat |= FormatFeatures::ATTACHMENT;
    }
    if opt.contains(vk::FormatFeatureFlags::COLOR_ATTACHMENT_BLEND) {
        feat |= FormatFeatures::ATTACHMENT_BLEND;
    }
    if opt.contains(vk::FormatFeatureFlags::TRANSFER_SRC) {
        feat |= FormatFeatures::IMAGE_READ;
    }
    if opt.contains(vk::FormatFeatureFlags::TRANSFER_DST) {
        feat |= FormatFeatures::IMAGE_WRITE;
    }

    feat
}

// Local shorthands to keep the pairing table readable.
const UNORM: FormatType = FormatType::UNORM;
const SNORM: FormatType = FormatType::SNORM;
const USCALED: FormatType = FormatType::USCALED;
const SSCALED: FormatType = FormatType::SSCALED;
const UINT: FormatType = FormatType::UINT;
const SINT: FormatType = FormatType::SINT;
const UFLOAT: FormatType = FormatType::UFLOAT;
const SFLOAT: FormatType = FormatType::SFLOAT;
const SRGB: FormatType = FormatType::SRGB;

// Mixed types for the combined depth/stencil formats.
const UNORM_UINT: FormatType =
    FormatType::from_bits_truncate(FormatType::UNORM.bits() | FormatType::UINT.bits());
const SFLOAT_UINT: FormatType =
    FormatType::from_bits_truncate(FormatType::SFLOAT.bits() | FormatType::UINT.bits());

const R: FormatOrder = FormatOrder::R;
const RG: FormatOrder = FormatOrder::RG;
const RGB: FormatOrder = FormatOrder::RGB;
const BGR: FormatOrder = FormatOrder::BGR;
const RGBA: FormatOrder = FormatOrder::RGBA;
const BGRA: FormatOrder = FormatOrder::BGRA;
const ARGB: FormatOrder = FormatOrder::ARGB;
const ABGR: FormatOrder = FormatOrder::ABGR;

/// The fixed abstract to vulkan format pairing table.
///
/// Unsupported pairings (all feature masks zero) are skipped at
/// dictionary initialization.
#[rustfmt::skip]
static FORMAT_TABLE: &[(Format, vk::Format)] = &[
    (fmt(UNORM, RG, [4, 4, 0, 0]), vk::Format::R4G4_UNORM_PACK8),
    (fmt(UNORM, RGBA, [4, 4, 4, 4]), vk::Format::R4G4B4A4_UNORM_PACK16),
    (fmt(UNORM, BGRA, [4, 4, 4, 4]), vk::Format::B4G4R4A4_UNORM_PACK16),
    (fmt(UNORM, RGB, [5, 6, 5, 0]), vk::Format::R5G6B5_UNORM_PACK16),
    (fmt(UNORM, BGR, [5, 6, 5, 0]), vk::Format::B5G6R5_UNORM_PACK16),
    (fmt(UNORM, RGBA, [5, 5, 5, 1]), vk::Format::R5G5B5A1_UNORM_PACK16),
    (fmt(UNORM, BGRA, [5, 5, 5, 1]), vk::Format::B5G5R5A1_UNORM_PACK16),
    (fmt(UNORM, ARGB, [1, 5, 5, 5]), vk::Format::A1R5G5B5_UNORM_PACK16),

    (fmt(UNORM, R, [8, 0, 0, 0]), vk::Format::R8_UNORM),
    (fmt(SNORM, R, [8, 0, 0, 0]), vk::Format::R8_SNORM),
    (fmt(USCALED, R, [8, 0, 0, 0]), vk::Format::R8_USCALED),
    (fmt(SSCALED, R, [8, 0, 0, 0]), vk::Format::R8_SSCALED),
    (fmt(UINT, R, [8, 0, 0, 0]), vk::Format::R8_UINT),
    (fmt(SINT, R, [8, 0, 0, 0]), vk::Format::R8_SINT),
    (fmt(SRGB, R, [8, 0, 0, 0]), vk::Format::R8_SRGB),

    (fmt(UNORM, RG, [8, 8, 0, 0]), vk::Format::R8G8_UNORM),
    (fmt(SNORM, RG, [8, 8, 0, 0]), vk::Format::R8G8_SNORM),
    (fmt(USCALED, RG, [8, 8, 0, 0]), vk::Format::R8G8_USCALED),
    (fmt(SSCALED, RG, [8, 8, 0, 0]), vk::Format::R8G8_SSCALED),
    (fmt(UINT, RG, [8, 8, 0, 0]), vk::Format::R8G8_UINT),
    (fmt(SINT, RG, [8, 8, 0, 0]), vk::Format::R8G8_SINT),
    (fmt(SRGB, RG, [8, 8, 0, 0]), vk::Format::R8G8_SRGB),

    (fmt(UNORM, RGB, [8, 8, 8, 0]), vk::Format::R8G8B8_UNORM),
    (fmt(SNORM, RGB, [8, 8, 8, 0]), vk::Format::R8G8B8_SNORM),
    (fmt(USCALED, RGB, [8, 8, 8, 0]), vk::Format::R8G8B8_USCALED),
    (fmt(SSCALED, RGB, [8, 8, 8, 0]), vk::Format::R8G8B8_SSCALED),
    (fmt(UINT, RGB, [8, 8, 8, 0]), vk::Format::R8G8B8_UINT),
    (fmt(SINT, RGB, [8, 8, 8, 0]), vk::Format::R8G8B8_SINT),
    (fmt(SRGB, RGB, [8, 8, 8, 0]), vk::Format::R8G8B8_SRGB),

    (fmt(UNORM, BGR, [8, 8, 8, 0]), vk::Format::B8G8R8_UNORM),
    (fmt(SNORM, BGR, [8, 8, 8, 0]), vk::Format::B8G8R8_SNORM),
    (fmt(USCALED, BGR, [8, 8, 8, 0]), vk::Format::B8G8R8_USCALED),
    (fmt(SSCALED, BGR, [8, 8, 8, 0]), vk::Format::B8G8R8_SSCALED),
    (fmt(UINT, BGR, [8, 8, 8, 0]), vk::Format::B8G8R8_UINT),
    (fmt(SINT, BGR, [8, 8, 8, 0]), vk::Format::B8G8R8_SINT),
    (fmt(SRGB, BGR, [8, 8, 8, 0]), vk::Format::B8G8R8_SRGB),

    (fmt(UNORM, RGBA, [8, 8, 8, 8]), vk::Format::R8G8B8A8_UNORM),
    (fmt(SNORM, RGBA, [8, 8, 8, 8]), vk::Format::R8G8B8A8_SNORM),
    (fmt(USCALED, RGBA, [8, 8, 8, 8]), vk::Format::R8G8B8A8_USCALED),
    (fmt(SSCALED, RGBA, [8, 8, 8, 8]), vk::Format::R8G8B8A8_SSCALED),
    (fmt(UINT, RGBA, [8, 8, 8, 8]), vk::Format::R8G8B8A8_UINT),
    (fmt(SINT, RGBA, [8, 8, 8, 8]), vk::Format::R8G8B8A8_SINT),
    (fmt(SRGB, RGBA, [8, 8, 8, 8]), vk::Format::R8G8B8A8_SRGB),

    (fmt(UNORM, BGRA, [8, 8, 8, 8]), vk::Format::B8G8R8A8_UNORM),
    (fmt(SNORM, BGRA, [8, 8, 8, 8]), vk::Format::B8G8R8A8_SNORM),
    (fmt(USCALED, BGRA, [8, 8, 8, 8]), vk::Format::B8G8R8A8_USCALED),
    (fmt(SSCALED, BGRA, [8, 8, 8, 8]), vk::Format::B8G8R8A8_SSCALED),
    (fmt(UINT, BGRA, [8, 8, 8, 8]), vk::Format::B8G8R8A8_UINT),
    (fmt(SINT, BGRA, [8, 8, 8, 8]), vk::Format::B8G8R8A8_SINT),
    (fmt(SRGB, BGRA, [8, 8, 8, 8]), vk::Format::B8G8R8A8_SRGB),

    (fmt(UNORM, ABGR, [8, 8, 8, 8]), vk::Format::A8B8G8R8_UNORM_PACK32),
    (fmt(SNORM, ABGR, [8, 8, 8, 8]), vk::Format::A8B8G8R8_SNORM_PACK32),
    (fmt(USCALED, ABGR, [8, 8, 8, 8]), vk::Format::A8B8G8R8_USCALED_PACK32),
    (fmt(SSCALED, ABGR, [8, 8, 8, 8]), vk::Format::A8B8G8R8_SSCALED_PACK32),
    (fmt(UINT, ABGR, [8, 8, 8, 8]), vk::Format::A8B8G8R8_UINT_PACK32),
    (fmt(SINT, ABGR, [8, 8, 8, 8]), vk::Format::A8B8G8R8_SINT_PACK32),
    (fmt(SRGB, ABGR, [8, 8, 8, 8]), vk::Format::A8B8G8R8_SRGB_PACK32),

    (fmt(UNORM, ARGB, [2, 10, 10, 10]), vk::Format::A2R10G10B10_UNORM_PACK32),
    (fmt(SNORM, ARGB, [2, 10, 10, 10]), vk::Format::A2R10G10B10_SNORM_PACK32),
    (fmt(USCALED, ARGB, [2, 10, 10, 10]), vk::Format::A2R10G10B10_USCALED_PACK32),
    (fmt(SSCALED, ARGB, [2, 10, 10, 10]), vk::Format::A2R10G10B10_SSCALED_PACK32),
    (fmt(UINT, ARGB, [2, 10, 10, 10]), vk::Format::A2R10G10B10_UINT_PACK32),
    (fmt(SINT, ARGB, [2, 10, 10, 10]), vk::Format::A2R10G10B10_SINT_PACK32),

    (fmt(UNORM, ABGR, [2, 10, 10, 10]), vk::Format::A2B10G10R10_UNORM_PACK32),
    (fmt(SNORM, ABGR, [2, 10, 10, 10]), vk::Format::A2B10G10R10_SNORM_PACK32),
    (fmt(USCALED, ABGR, [2, 10, 10, 10]), vk::Format::A2B10G10R10_USCALED_PACK32),
    (fmt(SSCALED, ABGR, [2, 10, 10, 10]), vk::Format::A2B10G10R10_SSCALED_PACK32),
    (fmt(UINT, ABGR, [2, 10, 10, 10]), vk::Format::A2B10G10R10_UINT_PACK32),
    (fmt(SINT, ABGR, [2, 10, 10, 10]), vk::Format::A2B10G10R10_SINT_PACK32),

    (fmt(UNORM, R, [16, 0, 0, 0]), vk::Format::R16_UNORM),
    (fmt(SNORM, R, [16, 0, 0, 0]), vk::Format::R16_SNORM),
    (fmt(USCALED, R, [16, 0, 0, 0]), vk::Format::R16_USCALED),
    (fmt(SSCALED, R, [16, 0, 0, 0]), vk::Format::R16_SSCALED),
    (fmt(UINT, R, [16, 0, 0, 0]), vk::Format::R16_UINT),
    (fmt(SINT, R, [16, 0, 0, 0]), vk::Format::R16_SINT),
    (fmt(SFLOAT, R, [16, 0, 0, 0]), vk::Format::R16_SFLOAT),

    (fmt(UNORM, RG, [16, 16, 0, 0]), vk::Format::R16G16_UNORM),
    (fmt(SNORM, RG, [16, 16, 0, 0]), vk::Format::R16G16_SNORM),
    (fmt(USCALED, RG, [16, 16, 0, 0]), vk::Format::R16G16_USCALED),
    (fmt(SSCALED, RG, [16, 16, 0, 0]), vk::Format::R16G16_SSCALED),
    (fmt(UINT, RG, [16, 16, 0, 0]), vk::Format::R16G16_UINT),
    (fmt(SINT, RG, [16, 16, 0, 0]), vk::Format::R16G16_SINT),
    (fmt(SFLOAT, RG, [16, 16, 0, 0]), vk::Format::R16G16_SFLOAT),

    (fmt(UNORM, RGB, [16, 16, 16, 0]), vk::Format::R16G16B16_UNORM),
    (fmt(SNORM, RGB, [16, 16, 16, 0]), vk::Format::R16G16B16_SNORM),
    (fmt(USCALED, RGB, [16, 16, 16, 0]), vk::Format::R16G16B16_USCALED),
    (fmt(SSCALED, RGB, [16, 16, 16, 0]), vk::Format::R16G16B16_SSCALED),
    (fmt(UINT, RGB, [16, 16, 16, 0]), vk::Format::R16G16B16_UINT),
    (fmt(SINT, RGB, [16, 16, 16, 0]), vk::Format::R16G16B16_SINT),
    (fmt(SFLOAT, RGB, [16, 16, 16, 0]), vk::Format::R16G16B16_SFLOAT),

    (fmt(UNORM, RGBA, [16, 16, 16, 16]), vk::Format::R16G16B16A16_UNORM),
    (fmt(SNORM, RGBA, [16, 16, 16, 16]), vk::Format::R16G16B16A16_SNORM),
    (fmt(USCALED, RGBA, [16, 16, 16, 16]), vk::Format::R16G16B16A16_USCALED),
    (fmt(SSCALED, RGBA, [16, 16, 16, 16]), vk::Format::R16G16B16A16_SSCALED),
    (fmt(UINT, RGBA, [16, 16, 16, 16]), vk::Format::R16G16B16A16_UINT),
    (fmt(SINT, RGBA, [16, 16, 16, 16]), vk::Format::R16G16B16A16_SINT),
    (fmt(SFLOAT, RGBA, [16, 16, 16, 16]), vk::Format::R16G16B16A16_SFLOAT),

    (fmt(UINT, R, [32, 0, 0, 0]), vk::Format::R32_UINT),
    (fmt(SINT, R, [32, 0, 0, 0]), vk::Format::R32_SINT),
    (fmt(SFLOAT, R, [32, 0, 0, 0]), vk::Format::R32_SFLOAT),

    (fmt(UINT, RG, [32, 32, 0, 0]), vk::Format::R32G32_UINT),
    (fmt(SINT, RG, [32, 32, 0, 0]), vk::Format::R32G32_SINT),
    (fmt(SFLOAT, RG, [32, 32, 0, 0]), vk::Format::R32G32_SFLOAT),

    (fmt(UINT, RGB, [32, 32, 32, 0]), vk::Format::R32G32B32_UINT),
    (fmt(SINT, RGB, [32, 32, 32, 0]), vk::Format::R32G32B32_SINT),
    (fmt(SFLOAT, RGB, [32, 32, 32, 0]), vk::Format::R32G32B32_SFLOAT),

    (fmt(UINT, RGBA, [32, 32, 32, 32]), vk::Format::R32G32B32A32_UINT),
    (fmt(SINT, RGBA, [32, 32, 32, 32]), vk::Format::R32G32B32A32_SINT),
    (fmt(SFLOAT, RGBA, [32, 32, 32, 32]), vk::Format::R32G32B32A32_SFLOAT),

    (fmt(UINT, R, [64, 0, 0, 0]), vk::Format::R64_UINT),
    (fmt(SINT, R, [64, 0, 0, 0]), vk::Format::R64_SINT),
    (fmt(SFLOAT, R, [64, 0, 0, 0]), vk::Format::R64_SFLOAT),

    (fmt(UINT, RG, [64, 64, 0, 0]), vk::Format::R64G64_UINT),
    (fmt(SINT, RG, [64, 64, 0, 0]), vk::Format::R64G64_SINT),
    (fmt(SFLOAT, RG, [64, 64, 0, 0]), vk::Format::R64G64_SFLOAT),

    (fmt(UINT, RGB, [64, 64, 64, 0]), vk::Format::R64G64B64_UINT),
    (fmt(SINT, RGB, [64, 64, 64, 0]), vk::Format::R64G64B64_SINT),
    (fmt(SFLOAT, RGB, [64, 64, 64, 0]), vk::Format::R64G64B64_SFLOAT),

    (fmt(UINT, RGBA, [64, 64, 64, 64]), vk::Format::R64G64B64A64_UINT),
    (fmt(SINT, RGBA, [64, 64, 64, 64]), vk::Format::R64G64B64A64_SINT),
    (fmt(SFLOAT, RGBA, [64, 64, 64, 64]), vk::Format::R64G64B64A64_SFLOAT),

    (fmt(UFLOAT, BGR, [10, 11, 11, 0]), vk::Format::B10G11R11_UFLOAT_PACK32),
    (fmt(UFLOAT, FormatOrder::ERGB, [9, 9, 9, 0]), vk::Format::E5B9G9R9_UFLOAT_PACK32),

    (fmt(UNORM, FormatOrder::DEPTH, [16, 0, 0, 0]), vk::Format::D16_UNORM),
    (fmt(UNORM, FormatOrder::DEPTH, [24, 0, 0, 0]), vk::Format::X8_D24_UNORM_PACK32),
    (fmt(SFLOAT, FormatOrder::DEPTH, [32, 0, 0, 0]), vk::Format::D32_SFLOAT),
    (fmt(UINT, FormatOrder::STENCIL, [0, 8, 0, 0]), vk::Format::S8_UINT),
    (fmt(UNORM_UINT, FormatOrder::DEPTH_STENCIL, [16, 8, 0, 0]), vk::Format::D16_UNORM_S8_UINT),
    (fmt(UNORM_UINT, FormatOrder::DEPTH_STENCIL, [24, 8, 0, 0]), vk::Format::D24_UNORM_S8_UINT),
    (fmt(SFLOAT_UINT, FormatOrder::DEPTH_STENCIL, [32, 8, 0, 0]), vk::Format::D32_SFLOAT_S8_UINT),

    (fmt(UNORM, FormatOrder::BC1, [8, 8, 8, 0]), vk::Format::BC1_RGB_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::BC1, [8, 8, 8, 0]), vk::Format::BC1_RGB_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::BC1, [8, 8, 8, 8]), vk::Format::BC1_RGBA_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::BC1, [8, 8, 8, 8]), vk::Format::BC1_RGBA_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::BC2, [8, 8, 8, 8]), vk::Format::BC2_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::BC2, [8, 8, 8, 8]), vk::Format::BC2_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::BC3, [8, 8, 8, 8]), vk::Format::BC3_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::BC3, [8, 8, 8, 8]), vk::Format::BC3_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::BC4, [8, 0, 0, 0]), vk::Format::BC4_UNORM_BLOCK),
    (fmt(SNORM, FormatOrder::BC4, [8, 0, 0, 0]), vk::Format::BC4_SNORM_BLOCK),
    (fmt(UNORM, FormatOrder::BC5, [8, 8, 0, 0]), vk::Format::BC5_UNORM_BLOCK),
    (fmt(SNORM, FormatOrder::BC5, [8, 8, 0, 0]), vk::Format::BC5_SNORM_BLOCK),
    (fmt(UFLOAT, FormatOrder::BC6, [16, 16, 16, 0]), vk::Format::BC6H_UFLOAT_BLOCK),
    (fmt(SFLOAT, FormatOrder::BC6, [16, 16, 16, 0]), vk::Format::BC6H_SFLOAT_BLOCK),
    (fmt(UNORM, FormatOrder::BC7, [8, 8, 8, 8]), vk::Format::BC7_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::BC7, [8, 8, 8, 8]), vk::Format::BC7_SRGB_BLOCK),

    (fmt(UNORM, FormatOrder::ETC2, [8, 8, 8, 0]), vk::Format::ETC2_R8G8B8_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ETC2, [8, 8, 8, 0]), vk::Format::ETC2_R8G8B8_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::ETC2, [8, 8, 8, 1]), vk::Format::ETC2_R8G8B8A1_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ETC2, [8, 8, 8, 1]), vk::Format::ETC2_R8G8B8A1_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::ETC2, [8, 8, 8, 8]), vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ETC2, [8, 8, 8, 8]), vk::Format::ETC2_R8G8B8A8_SRGB_BLOCK),

    (fmt(UNORM, FormatOrder::EAC, [11, 0, 0, 0]), vk::Format::EAC_R11_UNORM_BLOCK),
    (fmt(SNORM, FormatOrder::EAC, [11, 0, 0, 0]), vk::Format::EAC_R11_SNORM_BLOCK),
    (fmt(UNORM, FormatOrder::EAC, [11, 11, 0, 0]), vk::Format::EAC_R11G11_UNORM_BLOCK),
    (fmt(SNORM, FormatOrder::EAC, [11, 11, 0, 0]), vk::Format::EAC_R11G11_SNORM_BLOCK),

    (fmt(UNORM, FormatOrder::ASTC_4X4, [8, 8, 8, 8]), vk::Format::ASTC_4X4_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ASTC_4X4, [8, 8, 8, 8]), vk::Format::ASTC_4X4_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::ASTC_5X4, [8, 8, 8, 8]), vk::Format::ASTC_5X4_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ASTC_5X4, [8, 8, 8, 8]), vk::Format::ASTC_5X4_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::ASTC_5X5, [8, 8, 8, 8]), vk::Format::ASTC_5X5_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ASTC_5X5, [8, 8, 8, 8]), vk::Format::ASTC_5X5_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::ASTC_6X5, [8, 8, 8, 8]), vk::Format::ASTC_6X5_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ASTC_6X5, [8, 8, 8, 8]), vk::Format::ASTC_6X5_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::ASTC_6X6, [8, 8, 8, 8]), vk::Format::ASTC_6X6_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ASTC_6X6, [8, 8, 8, 8]), vk::Format::ASTC_6X6_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::ASTC_8X5, [8, 8, 8, 8]), vk::Format::ASTC_8X5_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ASTC_8X5, [8, 8, 8, 8]), vk::Format::ASTC_8X5_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::ASTC_8X6, [8, 8, 8, 8]), vk::Format::ASTC_8X6_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ASTC_8X6, [8, 8, 8, 8]), vk::Format::ASTC_8X6_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::ASTC_8X8, [8, 8, 8, 8]), vk::Format::ASTC_8X8_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ASTC_8X8, [8, 8, 8, 8]), vk::Format::ASTC_8X8_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::ASTC_10X5, [8, 8, 8, 8]), vk::Format::ASTC_10X5_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ASTC_10X5, [8, 8, 8, 8]), vk::Format::ASTC_10X5_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::ASTC_10X6, [8, 8, 8, 8]), vk::Format::ASTC_10X6_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ASTC_10X6, [8, 8, 8, 8]), vk::Format::ASTC_10X6_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::ASTC_10X8, [8, 8, 8, 8]), vk::Format::ASTC_10X8_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ASTC_10X8, [8, 8, 8, 8]), vk::Format::ASTC_10X8_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::ASTC_10X10, [8, 8, 8, 8]), vk::Format::ASTC_10X10_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ASTC_10X10, [8, 8, 8, 8]), vk::Format::ASTC_10X10_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::ASTC_12X10, [8, 8, 8, 8]), vk::Format::ASTC_12X10_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ASTC_12X10, [8, 8, 8, 8]), vk::Format::ASTC_12X10_SRGB_BLOCK),
    (fmt(UNORM, FormatOrder::ASTC_12X12, [8, 8, 8, 8]), vk::Format::ASTC_12X12_UNORM_BLOCK),
    (fmt(SRGB, FormatOrder::ASTC_12X12, [8, 8, 8, 8]), vk::Format::ASTC_12X12_SRGB_BLOCK),
];

/// Initialize the format dictionary for one physical device.
///
/// Queries the properties of every known pairing, skipping insertion
/// when the format is not supported at all.
pub(crate) fn init_formats(inst: &ash::Instance, pdev: vk::PhysicalDevice) -> Vec<FormatRecord> {
    let mut records = Vec::new();

    for (gfx_fmt, vk_fmt) in FORMAT_TABLE.iter() {
        let props = unsafe { inst.get_physical_device_format_properties(pdev, *vk_fmt) };

        if !props.linear_tiling_features.is_empty()
            || !props.optimal_tiling_features.is_empty()
            || !props.buffer_features.is_empty()
        {
            records.push(FormatRecord {
                fmt: *gfx_fmt,
                vk_format: *vk_fmt,
                props: props,
            });
        }
    }

    records
}

/// Exact-ish lookup: find the closest contained record that covers the
/// minimal properties, rewriting `fmt` to what was actually found.
///
/// Returns VK_FORMAT_UNDEFINED (and empties `fmt`) if nothing matches.
pub(crate) fn resolve_format(
    records: &[FormatRecord],
    fmt: &mut Format,
    min_props: Option<&vk::FormatProperties>,
) -> vk::Format {
    let mut vk_fmt = vk::Format::UNDEFINED;
    let mut found = Format::EMPTY;
    let mut dist = u32::MAX;

    for rec in records.iter() {
        if !rec.fmt.is_contained(fmt) {
            continue;
        }

        if let Some(props) = min_props {
            if !rec.props.linear_tiling_features.contains(props.linear_tiling_features)
                || !rec.props.optimal_tiling_features.contains(props.optimal_tiling_features)
                || !rec.props.buffer_features.contains(props.buffer_features)
            {
                continue;
            }
        }

        let d = rec.fmt.distance(fmt);
        if d < dist {
            vk_fmt = rec.vk_format;
            found = rec.fmt;
            dist = d;
        }
    }

    *fmt = found;
    vk_fmt
}

/// Report all supported features of every record containing `fmt`.
pub(crate) fn format_support(records: &[FormatRecord], fmt: &Format) -> FormatFeatures {
    let mut features = FormatFeatures::empty();

    for rec in records.iter() {
        if rec.fmt.is_contained(fmt) {
            features |= features_of(&rec.props);
        }
    }

    features
}

/// Fuzzy search over the dictionary.
///
/// Matches on type/order only (compressed formats match on exact
/// order), requires `features` to be supported, and optionally bounds
/// the channel depths from below/above. A contained match is always
/// preferred over a distance-only match.
pub(crate) fn format_fuzzy(
    records: &[FormatRecord],
    fmt: &Format,
    flags: FuzzyFlags,
    features: FormatFeatures,
) -> Format {
    let mut found = Format::EMPTY;
    let mut contained = false;
    let mut dist = u32::MAX;

    for rec in records.iter() {
        let efmt = &rec.fmt;

        // Match against the given type/order and minimal features.
        // Containment also checks bit depth, which we do not want
        // here, we fuzzy search over _all_ depths!
        let efeatures = features_of(&rec.props);
        let order_ok = if efmt.is_compressed() {
            efmt.order == fmt.order
        } else {
            (efmt.order & fmt.order) == efmt.order
        };

        if !efeatures.contains(features) || (efmt.ftype & fmt.ftype) != efmt.ftype || !order_ok {
            continue;
        }

        // We do however match against given bit depth requirements.
        if flags.contains(FuzzyFlags::MIN_DEPTH)
            && (0..4).any(|i| efmt.comps[i] < fmt.comps[i])
        {
            continue;
        }
        if flags.contains(FuzzyFlags::MAX_DEPTH)
            && (0..4).any(|i| efmt.comps[i] > fmt.comps[i])
        {
            continue;
        }

        // Get the 'closest' match, always preferring contained formats.
        let cont = efmt.is_contained(fmt);
        let d = efmt.distance(fmt);

        let better = if contained {
            cont && d < dist
        } else {
            cont || d < dist
        };
        if better {
            found = *efmt;
            contained = cont;
            dist = d;
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(optimal: vk::FormatFeatureFlags) -> vk::FormatProperties {
        vk::FormatProperties {
            linear_tiling_features: vk::FormatFeatureFlags::empty(),
            optimal_tiling_features: optimal,
            buffer_features: vk::FormatFeatureFlags::empty(),
        }
    }

    fn sampled_records() -> Vec<FormatRecord> {
        let sampled = vk::FormatFeatureFlags::SAMPLED_IMAGE;
        vec![
            FormatRecord {
                fmt: fmt(UNORM, RGBA, [8, 8, 8, 8]),
                vk_format: vk::Format::R8G8B8A8_UNORM,
                props: props(sampled),
            },
            FormatRecord {
                fmt: fmt(UNORM, RGBA, [16, 16, 16, 16]),
                vk_format: vk::Format::R16G16B16A16_UNORM,
                props: props(sampled),
            },
            FormatRecord {
                fmt: fmt(UNORM, RGB, [8, 8, 8, 0]),
                vk_format: vk::Format::R8G8B8_UNORM,
                props: props(sampled),
            },
        ]
    }

    #[test]
    fn fuzzy_min_depth_prefers_deeper() {
        let records = sampled_records();
        let query = fmt(UNORM, RGBA, [10, 10, 10, 10]);

        let found = format_fuzzy(
            &records,
            &query,
            FuzzyFlags::MIN_DEPTH,
            FormatFeatures::SAMPLED_IMAGE,
        );
        assert_eq!(found.comps, [16, 16, 16, 16]);
    }

    #[test]
    fn fuzzy_max_depth_prefers_contained() {
        let records = sampled_records();
        let query = fmt(UNORM, RGBA, [10, 10, 10, 10]);

        let found = format_fuzzy(
            &records,
            &query,
            FuzzyFlags::MAX_DEPTH,
            FormatFeatures::SAMPLED_IMAGE,
        );
        assert_eq!(found.order, RGBA);
        assert_eq!(found.comps, [8, 8, 8, 8]);
    }

    #[test]
    fn fuzzy_containment_beats_distance() {
        // The contained rgb match sits at distance 25, while the
        // 16-bit rgba match is closer at distance 15 but exceeds the
        // alpha depth. Containment has to win.
        let records = sampled_records();
        let query = fmt(UNORM, RGBA | RGB, [16, 16, 16, 1]);

        let found = format_fuzzy(
            &records,
            &query,
            FuzzyFlags::empty(),
            FormatFeatures::SAMPLED_IMAGE,
        );
        assert!(found.is_contained(&query));
        assert_eq!(found.order, RGB);
    }

    #[test]
    fn fuzzy_respects_features() {
        let records = sampled_records();
        let query = fmt(UNORM, RGBA, [8, 8, 8, 8]);

        let found = format_fuzzy(
            &records,
            &query,
            FuzzyFlags::empty(),
            FormatFeatures::STORAGE_IMAGE,
        );
        assert!(found.is_empty());
    }

    #[test]
    fn resolve_picks_closest_contained() {
        let records = sampled_records();
        let mut query = fmt(UNORM, RGBA, [8, 8, 8, 8]);

        let vk_fmt = resolve_format(&records, &mut query, None);
        assert_eq!(vk_fmt, vk::Format::R8G8B8A8_UNORM);
        assert_eq!(query.comps, [8, 8, 8, 8]);
    }

    #[test]
    fn resolve_unknown_is_undefined() {
        let records = sampled_records();
        let mut query = fmt(SFLOAT, RGBA, [32, 32, 32, 32]);

        let vk_fmt = resolve_format(&records, &mut query, None);
        assert_eq!(vk_fmt, vk::Format::UNDEFINED);
        assert!(query.is_empty());
    }

    #[test]
    fn support_unions_all_containing() {
        let sampled = vk::FormatFeatureFlags::SAMPLED_IMAGE;
        let storage = vk::FormatFeatureFlags::STORAGE_IMAGE;
        let records = vec![
            FormatRecord {
                fmt: fmt(UNORM, RGBA, [8, 8, 8, 8]),
                vk_format: vk::Format::R8G8B8A8_UNORM,
                props: props(sampled),
            },
            FormatRecord {
                fmt: fmt(UNORM, RGBA, [4, 4, 4, 4]),
                vk_format: vk::Format::R4G4B4A4_UNORM_PACK16,
                props: props(storage),
            },
        ];

        let features = format_support(&records, &fmt(UNORM, RGBA, [8, 8, 8, 8]));
        assert!(features.contains(FormatFeatures::SAMPLED_IMAGE | FormatFeatures::STORAGE_IMAGE));
    }

    #[test]
    fn depth_stencil_helpers() {
        let d24s8 = FORMAT_TABLE
            .iter()
            .find(|(_, v)| *v == vk::Format::D24_UNORM_S8_UINT)
            .unwrap()
            .0;
        assert!(d24s8.has_depth() && d24s8.has_stencil());

        let bc1 = FORMAT_TABLE
            .iter()
            .find(|(_, v)| *v == vk::Format::BC1_RGB_UNORM_BLOCK)
            .unwrap()
            .0;
        assert!(bc1.is_compressed());
    }
}
