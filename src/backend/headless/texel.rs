//! Texel codecs and the fragment program interface of the headless device

use crate::backend::traits::*;
use crate::backend::types::*;
use std::sync::Arc;

fn unorm8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn snorm8(v: f32) -> u8 {
    ((v.clamp(-1.0, 1.0) * 127.0).round() as i8) as u8
}

pub fn linear_to_srgb(v: f32) -> f32 {
    let v = v.clamp(0.0, 1.0);
    if v <= 0.003_130_8 {
        v * 12.92
    } else {
        1.055 * v.powf(1.0 / 2.4) - 0.055
    }
}

pub fn srgb_to_linear(v: f32) -> f32 {
    if v <= 0.040_45 {
        v / 12.92
    } else {
        ((v + 0.055) / 1.055).powf(2.4)
    }
}

fn f32_to_f16(v: f32) -> u16 {
    let bits = v.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x7f_ffff;

    if exp == 0xff {
        let nan = if mantissa != 0 { 0x200 } else { 0 };
        return sign | 0x7c00 | nan;
    }
    let exp = exp - 127 + 15;
    if exp >= 0x1f {
        sign | 0x7c00
    } else if exp <= 0 {
        if exp < -10 {
            return sign;
        }
        let mantissa = (mantissa | 0x80_0000) >> (1 - exp);
        sign | ((mantissa + 0x1000) >> 13) as u16
    } else {
        sign | (((exp as u32) << 10) + ((mantissa + 0x1000) >> 13)) as u16
    }
}

fn f16_to_f32(h: u16) -> f32 {
    let sign = if h & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exp = ((h >> 10) & 0x1f) as i32;
    let mantissa = (h & 0x3ff) as f32;
    match exp {
        0 => sign * mantissa * 2f32.powi(-24),
        0x1f if mantissa == 0.0 => sign * f32::INFINITY,
        0x1f => f32::NAN,
        _ => sign * (1.0 + mantissa / 1024.0) * 2f32.powi(exp - 15),
    }
}

/// Encode a texel value into the memory layout of `format`.
///
/// Color formats take RGBA; depth formats take depth in `.x` and stencil in `.y`.
pub fn encode(format: Format, value: [f32; 4]) -> BackendResult<Vec<u8>> {
    let [r, g, b, a] = value;
    let bytes = match format {
        Format::Rgba8Unorm => vec![unorm8(r), unorm8(g), unorm8(b), unorm8(a)],
        Format::Bgra8Unorm => vec![unorm8(b), unorm8(g), unorm8(r), unorm8(a)],
        Format::Rgba8Srgb => vec![
            unorm8(linear_to_srgb(r)),
            unorm8(linear_to_srgb(g)),
            unorm8(linear_to_srgb(b)),
            unorm8(a),
        ],
        Format::Bgra8Srgb => vec![
            unorm8(linear_to_srgb(b)),
            unorm8(linear_to_srgb(g)),
            unorm8(linear_to_srgb(r)),
            unorm8(a),
        ],
        Format::Rgba8Snorm => vec![snorm8(r), snorm8(g), snorm8(b), snorm8(a)],
        Format::Rgba16Float => value
            .iter()
            .flat_map(|v| f32_to_f16(*v).to_le_bytes())
            .collect(),
        Format::Rgba32Float => bytemuck::cast_slice(&value).to_vec(),
        Format::R32Float | Format::Depth32Float => r.to_le_bytes().to_vec(),
        Format::Depth32FloatStencil8 => {
            let mut bytes = r.to_le_bytes().to_vec();
            bytes.extend_from_slice(&[g.clamp(0.0, 255.0) as u8, 0, 0, 0]);
            bytes
        }
        Format::Depth24Stencil8 => {
            let depth = (r.clamp(0.0, 1.0) * 0xff_ffff as f32).round() as u32;
            let packed = depth | (g.clamp(0.0, 255.0) as u32) << 24;
            packed.to_le_bytes().to_vec()
        }
        Format::Other(raw) => {
            return Err(BackendError::Validation(format!(
                "no texel codec for raw format {}",
                raw
            )))
        }
    };
    Ok(bytes)
}

/// Decode one texel of `format` into RGBA (or depth/stencil in `.x`/`.y`).
pub fn decode(format: Format, bytes: &[u8]) -> BackendResult<[f32; 4]> {
    let expected = format.bytes_per_pixel().unwrap_or(0) as usize;
    if expected == 0 || bytes.len() < expected {
        return Err(BackendError::Validation(format!(
            "cannot decode {} bytes as {:?}",
            bytes.len(),
            format
        )));
    }

    let u = |i: usize| bytes[i] as f32 / 255.0;
    let s = |i: usize| ((bytes[i] as i8) as f32 / 127.0).max(-1.0);
    let f = |i: usize| f32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

    let value = match format {
        Format::Rgba8Unorm => [u(0), u(1), u(2), u(3)],
        Format::Bgra8Unorm => [u(2), u(1), u(0), u(3)],
        Format::Rgba8Srgb => [
            srgb_to_linear(u(0)),
            srgb_to_linear(u(1)),
            srgb_to_linear(u(2)),
            u(3),
        ],
        Format::Bgra8Srgb => [
            srgb_to_linear(u(2)),
            srgb_to_linear(u(1)),
            srgb_to_linear(u(0)),
            u(3),
        ],
        Format::Rgba8Snorm => [s(0), s(1), s(2), s(3)],
        Format::Rgba16Float => {
            let h = |i: usize| f16_to_f32(u16::from_le_bytes([bytes[i], bytes[i + 1]]));
            [h(0), h(2), h(4), h(6)]
        }
        Format::Rgba32Float => [f(0), f(4), f(8), f(12)],
        Format::R32Float => [f(0), 0.0, 0.0, 1.0],
        Format::Depth32Float => [f(0), 0.0, 0.0, 0.0],
        Format::Depth32FloatStencil8 => [f(0), bytes[4] as f32, 0.0, 0.0],
        Format::Depth24Stencil8 => {
            let packed = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            [
                (packed & 0xff_ffff) as f32 / 0xff_ffff as f32,
                (packed >> 24) as f32,
                0.0,
                0.0,
            ]
        }
        Format::Other(raw) => {
            return Err(BackendError::Validation(format!(
                "no texel codec for raw format {}",
                raw
            )))
        }
    };
    Ok(value)
}

/// Texel value a clear writes for `format`
pub fn clear_texel(format: Format, clear: &ClearValue) -> BackendResult<Vec<u8>> {
    match *clear {
        ClearValue::Color(rgba) => encode(format, rgba),
        ClearValue::DepthStencil { depth, stencil } => {
            encode(format, [depth, stencil as f32, 0.0, 0.0])
        }
    }
}

/// Image layer readable from a fragment program
#[derive(Debug, Clone)]
pub struct TextureView {
    pub(crate) format: Format,
    pub(crate) extent: Extent2D,
    pub(crate) layers: Vec<Vec<u8>>,
}

impl TextureView {
    /// Nearest-texel fetch with clamped coordinates.
    pub fn fetch(&self, layer: u32, x: u32, y: u32) -> [f32; 4] {
        let Some(data) = self.layers.get(layer as usize) else {
            return [0.0; 4];
        };
        let bpp = self.format.bytes_per_pixel().unwrap_or(0) as usize;
        let x = x.min(self.extent.width.saturating_sub(1)) as usize;
        let y = y.min(self.extent.height.saturating_sub(1)) as usize;
        let offset = (y * self.extent.width as usize + x) * bpp;
        data.get(offset..offset + bpp)
            .and_then(|texel| decode(self.format, texel).ok())
            .unwrap_or([0.0; 4])
    }

    pub fn layer_count(&self) -> u32 {
        self.layers.len() as u32
    }

    pub fn extent(&self) -> Extent2D {
        self.extent
    }
}

/// Everything one invocation of a fragment program can observe.
pub struct Fragment<'a> {
    pub x: u32,
    pub y: u32,
    pub extent: Extent2D,
    /// Decoded input attachments of the current subpass, in declaration order
    pub inputs: &'a [[f32; 4]],
    pub push_constants: &'a [u8],
    pub(crate) uniforms: &'a [((u32, u32), Vec<u8>)],
    pub(crate) textures: &'a [((u32, u32), TextureView)],
}

impl<'a> Fragment<'a> {
    /// Bytes of the uniform buffer bound at (set, binding)
    pub fn uniform(&self, set: u32, binding: u32) -> Option<&'a [u8]> {
        self.uniforms
            .iter()
            .find(|(key, _)| *key == (set, binding))
            .map(|(_, bytes)| bytes.as_slice())
    }

    /// Image bound as a combined image sampler at (set, binding)
    pub fn texture(&self, set: u32, binding: u32) -> Option<&'a TextureView> {
        self.textures
            .iter()
            .find(|(key, _)| *key == (set, binding))
            .map(|(_, view)| view)
    }

    /// Texture coordinates of the texel center in [0, 1]
    pub fn uv(&self) -> [f32; 2] {
        [
            (self.x as f32 + 0.5) / self.extent.width as f32,
            (self.y as f32 + 0.5) / self.extent.height as f32,
        ]
    }
}

/// CPU stand-in for a fragment shader: one output per color attachment, or
/// `None` to discard.
pub type FragmentProgram = Arc<dyn Fn(&Fragment) -> Option<Vec<[f32; 4]>> + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bgra_swizzle() {
        let bytes = encode(Format::Bgra8Unorm, [1.0, 0.0, 0.0, 1.0]).unwrap();
        assert_eq!(bytes, vec![0, 0, 255, 255]);
        assert_eq!(decode(Format::Bgra8Unorm, &bytes).unwrap(), [1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_srgb_encoding_is_nonlinear() {
        let bytes = encode(Format::Rgba8Srgb, [0.5, 0.5, 0.5, 0.5]).unwrap();
        assert_eq!(bytes[0], 188);
        assert_eq!(bytes[3], 128);
        let back = decode(Format::Rgba8Srgb, &bytes).unwrap();
        assert!((back[0] - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_snorm_sign() {
        let bytes = encode(Format::Rgba8Snorm, [-1.0, 0.0, 1.0, 0.5]).unwrap();
        let back = decode(Format::Rgba8Snorm, &bytes).unwrap();
        assert_eq!(back[0], -1.0);
        assert_eq!(back[1], 0.0);
        assert_eq!(back[2], 1.0);
    }

    #[test]
    fn test_half_float() {
        let bytes = encode(Format::Rgba16Float, [1.0, -2.5, 0.0, 65504.0]).unwrap();
        assert_eq!(
            decode(Format::Rgba16Float, &bytes).unwrap(),
            [1.0, -2.5, 0.0, 65504.0]
        );
    }

    #[test]
    fn test_depth_stencil_clear() {
        let bytes = clear_texel(Format::Depth32FloatStencil8, &ClearValue::DEPTH_ONE).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(decode(Format::Depth32FloatStencil8, &bytes).unwrap()[0], 1.0);
    }

    #[test]
    fn test_fetch_clamps() {
        let view = TextureView {
            format: Format::R32Float,
            extent: Extent2D::new(2, 1),
            layers: vec![[1.0f32, 2.0]
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect()],
        };
        assert_eq!(view.fetch(0, 5, 3)[0], 2.0);
        assert_eq!(view.fetch(1, 0, 0), [0.0; 4]);
    }
}
