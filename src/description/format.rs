// Vertex attribute formats
//
// The abstract format names used by descriptions, their byte sizes, and the
// native Vulkan format each one lowers to.

use ash::vk;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Abstract vertex attribute format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Uint32x2,
    Uint32x3,
    Uint32x4,
    Sint32,
    Sint32x2,
    Sint32x3,
    Sint32x4,
    Unorm8x4,
    Uint8x4,
}

impl VertexFormat {
    /// Size of one attribute of this format in bytes.
    pub const fn size_bytes(self) -> u32 {
        match self {
            Self::Float32 | Self::Uint32 | Self::Sint32 => 4,
            Self::Unorm8x4 | Self::Uint8x4 => 4,
            Self::Float32x2 | Self::Uint32x2 | Self::Sint32x2 => 8,
            Self::Float32x3 | Self::Uint32x3 | Self::Sint32x3 => 12,
            Self::Float32x4 | Self::Uint32x4 | Self::Sint32x4 => 16,
        }
    }

    /// Native Vulkan format.
    pub const fn native(self) -> vk::Format {
        match self {
            Self::Float32 => vk::Format::R32_SFLOAT,
            Self::Float32x2 => vk::Format::R32G32_SFLOAT,
            Self::Float32x3 => vk::Format::R32G32B32_SFLOAT,
            Self::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
            Self::Uint32 => vk::Format::R32_UINT,
            Self::Uint32x2 => vk::Format::R32G32_UINT,
            Self::Uint32x3 => vk::Format::R32G32B32_UINT,
            Self::Uint32x4 => vk::Format::R32G32B32A32_UINT,
            Self::Sint32 => vk::Format::R32_SINT,
            Self::Sint32x2 => vk::Format::R32G32_SINT,
            Self::Sint32x3 => vk::Format::R32G32B32_SINT,
            Self::Sint32x4 => vk::Format::R32G32B32A32_SINT,
            Self::Unorm8x4 => vk::Format::R8G8B8A8_UNORM,
            Self::Uint8x4 => vk::Format::R8G8B8A8_UINT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float32x2 => "float32x2",
            Self::Float32x3 => "float32x3",
            Self::Float32x4 => "float32x4",
            Self::Uint32 => "uint32",
            Self::Uint32x2 => "uint32x2",
            Self::Uint32x3 => "uint32x3",
            Self::Uint32x4 => "uint32x4",
            Self::Sint32 => "sint32",
            Self::Sint32x2 => "sint32x2",
            Self::Sint32x3 => "sint32x3",
            Self::Sint32x4 => "sint32x4",
            Self::Unorm8x4 => "unorm8x4",
            Self::Uint8x4 => "uint8x4",
        }
    }
}

impl fmt::Display for VertexFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [VertexFormat; 14] = [
        VertexFormat::Float32,
        VertexFormat::Float32x2,
        VertexFormat::Float32x3,
        VertexFormat::Float32x4,
        VertexFormat::Uint32,
        VertexFormat::Uint32x2,
        VertexFormat::Uint32x3,
        VertexFormat::Uint32x4,
        VertexFormat::Sint32,
        VertexFormat::Sint32x2,
        VertexFormat::Sint32x3,
        VertexFormat::Sint32x4,
        VertexFormat::Unorm8x4,
        VertexFormat::Uint8x4,
    ];

    #[test]
    fn size_matches_component_count() {
        for format in ALL {
            let components = match format.name().rsplit_once('x') {
                Some((_, n)) => n.parse::<u32>().unwrap(),
                None => 1,
            };
            let component_bytes = if format.name().contains('8') { 1 } else { 4 };
            assert_eq!(format.size_bytes(), components * component_bytes, "{format}");
        }
    }

    #[test]
    fn float_sizes() {
        assert_eq!(VertexFormat::Float32x2.size_bytes(), 8);
        assert_eq!(VertexFormat::Float32x3.size_bytes(), 12);
        assert_eq!(VertexFormat::Float32x4.size_bytes(), 16);
        assert_eq!(VertexFormat::Float32x3.native(), vk::Format::R32G32B32_SFLOAT);
    }

    #[test]
    fn serde_name_matches_display() {
        #[derive(Deserialize)]
        struct Wrapper {
            format: VertexFormat,
        }
        for format in ALL {
            let text = format!("format = \"{}\"", format.name());
            let parsed: Wrapper = toml::from_str(&text).unwrap();
            assert_eq!(parsed.format, format);
        }
    }
}
