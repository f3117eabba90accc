//! Pixel formats understood by the display pipeline and their DRM equivalents

pub use drm_fourcc::{DrmFourcc as Fourcc, DrmModifier as Modifier};

const fn fourcc_mod_code(vendor: u64, value: u64) -> u64 {
    (vendor << 56) | (value & 0x00ff_ffff_ffff_ffff)
}

const MOD_VENDOR_AMPHION: u64 = 0x0c;
const MOD_VENDOR_VSI: u64 = 0x0b;

/// Amphion (i.MX8QM/QXP VPU) 8x128 tiles
pub const MOD_AMPHION_TILED: u64 = fourcc_mod_code(MOD_VENDOR_AMPHION, 1);
/// Hantro G1 decoder 4x4 tiles
pub const MOD_VSI_G1_TILED: u64 = fourcc_mod_code(MOD_VENDOR_VSI, 1);
/// Hantro G2 decoder 4x4 tiles
pub const MOD_VSI_G2_TILED: u64 = fourcc_mod_code(MOD_VENDOR_VSI, 2);
/// Hantro G2 decoder tiles with DTRC compression
pub const MOD_VSI_G2_TILED_COMPRESSED: u64 = fourcc_mod_code(MOD_VENDOR_VSI, 3);

/// Memory layout of a graphics buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PixelFormat {
    /// 32bpp, bytes R, G, B, A
    #[default]
    Rgba8888,
    /// 32bpp, bytes R, G, B, padding
    Rgbx8888,
    /// 32bpp, bytes B, G, R, A
    Bgra8888,
    /// 24bpp, bytes R, G, B
    Rgb888,
    /// 16bpp 5-6-5
    Rgb565,
    /// 32bpp 10-10-10-2
    Rgba1010102,
    /// 2 plane YCbCr 4:2:0
    Nv12,
    /// 2 plane YCrCb 4:2:0
    Nv21,
    /// 2 plane YCbCr 4:2:2
    Nv16,
    /// NV12 in Amphion tiles
    Nv12Tiled,
    /// NV12 in G1 tiles
    Nv12G1Tiled,
    /// NV12 in G2 tiles
    Nv12G2Tiled,
    /// NV12 in compressed G2 tiles
    Nv12G2TiledCompressed,
    /// 2 plane 10 bit YCbCr 4:2:0
    P010,
    /// P010 in G1 tiles
    P010Tiled,
    /// P010 in compressed G2 tiles
    P010TiledCompressed,
    /// 3 plane YCbCr 4:2:0
    I420,
    /// 3 plane YCrCb 4:2:0
    Yv12,
    /// packed YCbCr 4:2:2
    Yuyv,
    /// packed CbYCrY 4:2:2
    Uyvy,
    /// opaque bytes
    Blob,
}

impl PixelFormat {
    /// Fourcc and modifier used to register a buffer of this format with KMS
    pub fn drm_format(self) -> Option<(Fourcc, Modifier)> {
        use PixelFormat::*;

        let (code, modifier) = match self {
            Rgba8888 => (Fourcc::Abgr8888, 0),
            Rgbx8888 => (Fourcc::Xbgr8888, 0),
            Bgra8888 => (Fourcc::Argb8888, 0),
            Rgb888 => (Fourcc::Bgr888, 0),
            Rgb565 => (Fourcc::Rgb565, 0),
            Rgba1010102 => (Fourcc::Abgr2101010, 0),
            Nv12 => (Fourcc::Nv12, 0),
            Nv21 => (Fourcc::Nv21, 0),
            Nv16 => (Fourcc::Nv16, 0),
            Nv12Tiled => (Fourcc::Nv12, MOD_AMPHION_TILED),
            Nv12G1Tiled => (Fourcc::Nv12, MOD_VSI_G1_TILED),
            Nv12G2Tiled => (Fourcc::Nv12, MOD_VSI_G2_TILED),
            Nv12G2TiledCompressed => (Fourcc::Nv12, MOD_VSI_G2_TILED_COMPRESSED),
            P010 => (Fourcc::P010, 0),
            P010Tiled => (Fourcc::P010, MOD_VSI_G1_TILED),
            P010TiledCompressed => (Fourcc::P010, MOD_VSI_G2_TILED_COMPRESSED),
            I420 => (Fourcc::Yuv420, 0),
            Yv12 => (Fourcc::Yvu420, 0),
            Yuyv => (Fourcc::Yuyv, 0),
            Uyvy => (Fourcc::Uyvy, 0),
            Blob => return None,
        };
        Some((code, Modifier::from(modifier)))
    }

    /// Bits per pixel of the first plane
    pub fn bpp(self) -> u32 {
        use PixelFormat::*;

        match self {
            Rgba8888 | Rgbx8888 | Bgra8888 | Rgba1010102 => 32,
            Rgb888 => 24,
            Rgb565 | Yuyv | Uyvy => 16,
            P010 | P010Tiled | P010TiledCompressed => 16,
            Nv12 | Nv21 | Nv16 | Nv12Tiled | Nv12G1Tiled | Nv12G2Tiled | Nv12G2TiledCompressed => 8,
            I420 | Yv12 | Blob => 8,
        }
    }

    /// Bytes per pixel of the first plane
    pub fn bytes_per_pixel(self) -> u32 {
        (self.bpp() + 7) / 8
    }

    /// Whether the format carries YUV data
    pub fn is_yuv(self) -> bool {
        !matches!(
            self,
            PixelFormat::Rgba8888
                | PixelFormat::Rgbx8888
                | PixelFormat::Bgra8888
                | PixelFormat::Rgb888
                | PixelFormat::Rgb565
                | PixelFormat::Rgba1010102
                | PixelFormat::Blob
        )
    }

    /// Whether the buffer uses a tiled (non-linear) layout
    pub fn is_tiled(self) -> bool {
        matches!(
            self,
            PixelFormat::Nv12Tiled
                | PixelFormat::Nv12G1Tiled
                | PixelFormat::Nv12G2Tiled
                | PixelFormat::Nv12G2TiledCompressed
                | PixelFormat::P010Tiled
                | PixelFormat::P010TiledCompressed
        )
    }

    /// Whether the tiles are additionally compressed and need a DTRC table
    pub fn is_compressed(self) -> bool {
        matches!(
            self,
            PixelFormat::Nv12G2TiledCompressed | PixelFormat::P010TiledCompressed
        )
    }

    /// Whether the format carries a per-pixel alpha channel
    pub fn has_alpha(self) -> bool {
        matches!(
            self,
            PixelFormat::Rgba8888 | PixelFormat::Bgra8888 | PixelFormat::Rgba1010102
        )
    }

    /// Parse the framebuffer pixel layout reported by the fbdev driver
    pub fn from_fb_layout(bits_per_pixel: u32, red_offset: u32) -> PixelFormat {
        match (bits_per_pixel, red_offset) {
            (32, 0) => PixelFormat::Rgba8888,
            (32, _) => PixelFormat::Bgra8888,
            (24, _) => PixelFormat::Rgb888,
            _ => PixelFormat::Rgb565,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_is_abgr_in_drm_terms() {
        let (code, modifier) = PixelFormat::Rgba8888.drm_format().unwrap();
        assert_eq!(code, Fourcc::Abgr8888);
        assert_eq!(modifier, Modifier::Linear);
    }

    #[test]
    fn tiled_formats_carry_modifiers() {
        let (code, modifier) = PixelFormat::Nv12G2TiledCompressed.drm_format().unwrap();
        assert_eq!(code, Fourcc::Nv12);
        assert_eq!(u64::from(modifier), MOD_VSI_G2_TILED_COMPRESSED);
        assert!(PixelFormat::Nv12G2TiledCompressed.is_compressed());
        assert!(PixelFormat::Nv12Tiled.is_tiled());
        assert!(!PixelFormat::Nv12.is_tiled());
    }

    #[test]
    fn fb_layout() {
        assert_eq!(PixelFormat::from_fb_layout(32, 0), PixelFormat::Rgba8888);
        assert_eq!(PixelFormat::from_fb_layout(32, 16), PixelFormat::Bgra8888);
        assert_eq!(PixelFormat::from_fb_layout(16, 11), PixelFormat::Rgb565);
    }
}
