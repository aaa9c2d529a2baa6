//! Pixel, vertex and index formats.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Uint,
    R32Float,
    Rg32Float,
    Rgba32Float,
    D32Float,
    D24UnormS8Uint,
    D32FloatS8Uint,
}

impl TextureFormat {
    /// Size of one texel in host memory.
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rg8Unorm | TextureFormat::R16Float => 2,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
            | TextureFormat::Rg16Float
            | TextureFormat::R32Uint
            | TextureFormat::R32Float
            | TextureFormat::D32Float
            | TextureFormat::D24UnormS8Uint => 4,
            TextureFormat::Rgba16Float | TextureFormat::Rg32Float | TextureFormat::D32FloatS8Uint => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(
            self,
            TextureFormat::D32Float | TextureFormat::D24UnormS8Uint | TextureFormat::D32FloatS8Uint
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(
            self,
            TextureFormat::D24UnormS8Uint | TextureFormat::D32FloatS8Uint
        )
    }

    pub fn is_srgb(self) -> bool {
        matches!(
            self,
            TextureFormat::Rgba8UnormSrgb | TextureFormat::Bgra8UnormSrgb
        )
    }

    /// Whether every channel is an 8-bit normalized integer.
    pub fn is_unorm8(self) -> bool {
        matches!(
            self,
            TextureFormat::R8Unorm
                | TextureFormat::Rg8Unorm
                | TextureFormat::Rgba8Unorm
                | TextureFormat::Rgba8UnormSrgb
                | TextureFormat::Bgra8Unorm
                | TextureFormat::Bgra8UnormSrgb
        )
    }

    pub fn aspect(self) -> TextureAspect {
        if self.has_stencil() {
            TextureAspect::DepthStencil
        } else if self.is_depth() {
            TextureAspect::Depth
        } else {
            TextureAspect::Color
        }
    }
}

/// Image planes touched by a transition or view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureAspect {
    Color,
    Depth,
    DepthStencil,
}

/// Format of one vertex attribute, also used for acceleration structure positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    #[default]
    Float32x3,
    Float32x4,
    Float16x2,
    Float16x4,
    Snorm16x2,
    Snorm16x4,
    Unorm8x4,
    Uint32,
    Uint32x2,
    Uint32x3,
    Uint32x4,
    Sint32,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        match self {
            VertexFormat::Float32 | VertexFormat::Uint32 | VertexFormat::Sint32 => 4,
            VertexFormat::Float16x2 | VertexFormat::Snorm16x2 | VertexFormat::Unorm8x4 => 4,
            VertexFormat::Float32x2 | VertexFormat::Uint32x2 => 8,
            VertexFormat::Float16x4 | VertexFormat::Snorm16x4 => 8,
            VertexFormat::Float32x3 | VertexFormat::Uint32x3 => 12,
            VertexFormat::Float32x4 | VertexFormat::Uint32x4 => 16,
        }
    }

    /// Formats an acceleration structure build accepts for triangle positions.
    pub fn is_position_format(self) -> bool {
        matches!(
            self,
            VertexFormat::Float32x2
                | VertexFormat::Float32x3
                | VertexFormat::Float16x2
                | VertexFormat::Float16x4
                | VertexFormat::Snorm16x2
                | VertexFormat::Snorm16x4
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub fn size(self) -> u32 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_report_aspects() {
        assert_eq!(TextureFormat::D32Float.aspect(), TextureAspect::Depth);
        assert_eq!(TextureFormat::D24UnormS8Uint.aspect(), TextureAspect::DepthStencil);
        assert_eq!(TextureFormat::Bgra8Unorm.aspect(), TextureAspect::Color);
    }

    #[test]
    fn position_formats() {
        assert!(VertexFormat::Float32x3.is_position_format());
        assert!(!VertexFormat::Uint32x3.is_position_format());
        assert_eq!(VertexFormat::Float32x3.size(), 12);
    }
}
