//! Bounded decoding of a single embedded JPEG.
//!
//! Decoding is two-phase: the sub-image is opened once to probe its true
//! dimensions, a power-of-two downscale factor is chosen against the
//! caller's budget, and the sub-image is opened again and decoded at that
//! scale. The full-resolution pixel buffer is never allocated for images
//! larger than the budget.

use std::io::{BufReader, Read};

use image::RgbImage;
use image::imageops::{self, FilterType};
use jpeg_decoder::{Decoder, PixelFormat};
use tracing::debug;

use crate::error::{CodecError, ConfigError, DecodeError};
use crate::source::ByteSource;

/// Largest reduction the JPEG decoder performs natively during IDCT.
const MAX_NATIVE_DOWNSCALE: u32 = 8;

/// Maximum output size, in pixels, for one decoded sub-image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeBudget {
    max_width: u32,
    max_height: u32,
}

impl DecodeBudget {
    pub fn new(max_width: u32, max_height: u32) -> Result<Self, ConfigError> {
        if max_width == 0 || max_height == 0 {
            return Err(ConfigError::InvalidBudget {
                width: max_width,
                height: max_height,
            });
        }
        Ok(Self {
            max_width,
            max_height,
        })
    }

    #[inline]
    pub fn max_width(&self) -> u32 {
        self.max_width
    }

    #[inline]
    pub fn max_height(&self) -> u32 {
        self.max_height
    }

    #[inline]
    pub fn max_dimension(&self) -> u32 {
        self.max_width.max(self.max_height)
    }

    #[inline]
    pub fn fits(&self, width: u32, height: u32) -> bool {
        width <= self.max_width && height <= self.max_height
    }
}

/// Picks the power-of-two divisor applied while decoding a
/// `width` x `height` image under `budget`.
///
/// The exponent is `log2(max(width, height) / budget.max_dimension())`
/// rounded to the nearest integer, so the output may overshoot or
/// undershoot the budget by up to a factor of about 1.41 on its longest
/// axis. Images that already fit are never scaled.
pub fn downscale_factor(width: u32, height: u32, budget: DecodeBudget) -> u32 {
    if budget.fits(width, height) {
        return 1;
    }

    let largest = f64::from(width.max(height));
    let target = f64::from(budget.max_dimension());
    let exponent = ((target / largest).ln() / 0.5f64.ln()).round();

    if exponent < 1.0 {
        1
    } else {
        1 << (exponent.min(31.0) as u32)
    }
}

/// Pixel decoder for one embedded image, fed by a forward-only stream.
pub trait ImageCodec: Send + Sync {
    /// Reads just enough of the stream to report `(width, height)`.
    fn probe_dimensions(&self, stream: &mut dyn Read) -> Result<(u32, u32), CodecError>;

    /// Decodes the image with each dimension divided by `factor`,
    /// rounding up.
    fn decode_scaled(&self, stream: &mut dyn Read, factor: u32) -> Result<RgbImage, CodecError>;
}

/// Baseline/progressive JPEG codec using the decoder's native DCT scaling.
///
/// The decoder scales by at most 1/8, so factors above 8 first produce
/// an intermediate buffer of `ceil(w / 8) x ceil(h / 8)` RGB pixels that
/// is then resized. That intermediate size is the real memory ceiling
/// for a single decode.
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegCodec;

impl JpegCodec {
    fn frame_size<R: Read>(decoder: &mut Decoder<R>) -> Result<(u32, u32), CodecError> {
        decoder.read_info()?;
        let info = decoder
            .info()
            .ok_or_else(|| CodecError::UnsupportedFormat("missing frame header".into()))?;
        Ok((u32::from(info.width), u32::from(info.height)))
    }
}

impl ImageCodec for JpegCodec {
    fn probe_dimensions(&self, stream: &mut dyn Read) -> Result<(u32, u32), CodecError> {
        let mut decoder = Decoder::new(BufReader::new(stream));
        Self::frame_size(&mut decoder)
    }

    fn decode_scaled(&self, stream: &mut dyn Read, factor: u32) -> Result<RgbImage, CodecError> {
        let mut decoder = Decoder::new(BufReader::new(stream));
        let (width, height) = Self::frame_size(&mut decoder)?;
        if width == 0 || height == 0 {
            return Err(CodecError::InvalidDimensions { width, height });
        }

        let factor = factor.max(1);
        let target_width = width.div_ceil(factor);
        let target_height = height.div_ceil(factor);

        let native = factor.min(MAX_NATIVE_DOWNSCALE);
        let (scaled_width, scaled_height) = decoder.scale(
            clamp_u16(width.div_ceil(native)),
            clamp_u16(height.div_ceil(native)),
        )?;
        let data = decoder.decode()?;
        let format = decoder
            .info()
            .map(|info| info.pixel_format)
            .ok_or_else(|| CodecError::UnsupportedFormat("missing frame header".into()))?;

        let rgb = to_rgb(
            data,
            u32::from(scaled_width),
            u32::from(scaled_height),
            format,
        )?;

        if rgb.dimensions() == (target_width, target_height) {
            Ok(rgb)
        } else {
            Ok(imageops::resize(
                &rgb,
                target_width,
                target_height,
                FilterType::Triangle,
            ))
        }
    }
}

#[inline]
fn clamp_u16(value: u32) -> u16 {
    u16::try_from(value.max(1)).unwrap_or(u16::MAX)
}

fn to_rgb(
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<RgbImage, CodecError> {
    let pixels = width as usize * height as usize;
    let bytes_per_pixel = match format {
        PixelFormat::L8 => 1,
        PixelFormat::L16 => 2,
        PixelFormat::RGB24 => 3,
        PixelFormat::CMYK32 => 4,
        #[allow(unreachable_patterns)]
        other => return Err(CodecError::UnsupportedFormat(format!("{other:?}"))),
    };
    if data.len() != pixels * bytes_per_pixel {
        return Err(CodecError::BufferSize { width, height });
    }

    let rgb: Vec<u8> = match format {
        PixelFormat::L8 => data.iter().flat_map(|&l| [l, l, l]).collect(),
        // Samples are big-endian; keep the high byte.
        PixelFormat::L16 => data.chunks_exact(2).flat_map(|s| [s[0], s[0], s[0]]).collect(),
        PixelFormat::CMYK32 => data
            .chunks_exact(4)
            .flat_map(|p| {
                let k = 255 - u16::from(p[3]);
                let channel = |c: u8| ((255 - u16::from(c)) * k / 255) as u8;
                [channel(p[0]), channel(p[1]), channel(p[2])]
            })
            .collect(),
        _ => data,
    };

    RgbImage::from_raw(width, height, rgb).ok_or(CodecError::BufferSize { width, height })
}

/// A decoded sub-image, owned by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
    offset: u64,
    original_width: u32,
    original_height: u32,
    downscale: u32,
    pixels: RgbImage,
}

impl DecodedImage {
    #[inline]
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Offset of the sub-image within its container.
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Dimensions reported by the probe, before downscaling.
    #[inline]
    pub fn original_dimensions(&self) -> (u32, u32) {
        (self.original_width, self.original_height)
    }

    #[inline]
    pub fn downscale(&self) -> u32 {
        self.downscale
    }

    #[inline]
    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    pub fn into_pixels(self) -> RgbImage {
        self.pixels
    }
}

/// Probes and decodes sub-images within a budget.
#[derive(Debug, Clone, Default)]
pub struct BoundedDecoder<C = JpegCodec> {
    codec: C,
}

impl BoundedDecoder<JpegCodec> {
    pub fn new() -> Self {
        Self { codec: JpegCodec }
    }
}

impl<C: ImageCodec> BoundedDecoder<C> {
    pub fn with_codec(codec: C) -> Self {
        Self { codec }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn decode<S: ByteSource + ?Sized>(
        &self,
        source: &S,
        offset: u64,
        budget: DecodeBudget,
    ) -> Result<DecodedImage, DecodeError> {
        let probe_failed = |cause: CodecError| DecodeError::ProbeFailed {
            offset,
            source_name: source.name().to_string(),
            cause,
        };

        let (width, height) = {
            let mut stream = source.open_at(offset)?;
            self.codec
                .probe_dimensions(&mut stream)
                .map_err(probe_failed)?
        };
        if width == 0 || height == 0 {
            return Err(probe_failed(CodecError::InvalidDimensions { width, height }));
        }

        let downscale = downscale_factor(width, height, budget);
        debug!(
            "Sub-image at {} in {}: {}x{}, downscale 1/{}",
            offset,
            source.name(),
            width,
            height,
            downscale
        );

        let pixels = {
            let mut stream = source.open_at(offset)?;
            self.codec
                .decode_scaled(&mut stream, downscale)
                .map_err(|cause| DecodeError::DecodeFailed {
                    offset,
                    source_name: source.name().to_string(),
                    cause,
                })?
        };

        Ok(DecodedImage {
            offset,
            original_width: width,
            original_height: height,
            downscale,
            pixels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;
    use image::codecs::jpeg::JpegEncoder;
    use image::{ExtendedColorType, Rgb};

    fn budget(w: u32, h: u32) -> DecodeBudget {
        DecodeBudget::new(w, h).unwrap()
    }

    fn encode_jpeg(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, 128])
        });
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, 85)
            .encode(img.as_raw(), width, height, ExtendedColorType::Rgb8)
            .unwrap();
        out
    }

    struct FixedProbe(u32, u32);

    impl ImageCodec for FixedProbe {
        fn probe_dimensions(&self, _: &mut dyn Read) -> Result<(u32, u32), CodecError> {
            Ok((self.0, self.1))
        }

        fn decode_scaled(&self, _: &mut dyn Read, factor: u32) -> Result<RgbImage, CodecError> {
            Ok(RgbImage::new(self.0.div_ceil(factor), self.1.div_ceil(factor)))
        }
    }

    #[test]
    fn budget_rejects_zero() {
        assert!(DecodeBudget::new(0, 100).is_err());
        assert!(DecodeBudget::new(100, 0).is_err());
        assert_eq!(budget(640, 480).max_dimension(), 640);
    }

    #[test]
    fn factor_is_one_when_image_fits() {
        assert_eq!(downscale_factor(640, 480, budget(640, 480)), 1);
        assert_eq!(downscale_factor(10, 10, budget(1920, 1080)), 1);
    }

    #[test]
    fn factor_rounds_to_nearest_power_of_two() {
        let b = budget(1000, 1000);
        assert_eq!(downscale_factor(4000, 3000, b), 4);
        assert_eq!(downscale_factor(3000, 2000, b), 4);
        assert_eq!(downscale_factor(1500, 1000, b), 2);
        assert_eq!(downscale_factor(1400, 1000, b), 1);
        assert_eq!(downscale_factor(2800, 1000, b), 2);
        assert_eq!(downscale_factor(64_000, 100, b), 64);
    }

    #[test]
    fn factor_uses_longest_budget_axis() {
        assert_eq!(downscale_factor(1000, 1200, budget(1200, 900)), 1);
        assert_eq!(downscale_factor(4800, 3600, budget(1200, 900)), 4);
    }

    #[test]
    fn factor_is_always_power_of_two() {
        let b = budget(800, 600);
        for width in (1..20_000).step_by(97) {
            let factor = downscale_factor(width, width / 2 + 1, b);
            assert!(factor >= 1);
            assert!(factor.is_power_of_two(), "{width}: {factor}");
        }
    }

    #[test]
    fn jpeg_codec_probe() {
        let jpeg = encode_jpeg(48, 32);
        let dims = JpegCodec.probe_dimensions(&mut jpeg.as_slice()).unwrap();
        assert_eq!(dims, (48, 32));
    }

    #[test]
    fn jpeg_codec_probe_rejects_garbage() {
        let junk = [0xFF, 0xD8, 0xFF, 0xE0, 0x00];
        assert!(JpegCodec.probe_dimensions(&mut junk.as_slice()).is_err());
    }

    #[test]
    fn jpeg_codec_native_downscale() {
        let jpeg = encode_jpeg(64, 40);
        let img = JpegCodec.decode_scaled(&mut jpeg.as_slice(), 2).unwrap();
        assert_eq!(img.dimensions(), (32, 20));
        let img = JpegCodec.decode_scaled(&mut jpeg.as_slice(), 8).unwrap();
        assert_eq!(img.dimensions(), (8, 5));
    }

    #[test]
    fn jpeg_codec_downscale_beyond_native() {
        let jpeg = encode_jpeg(160, 96);
        let img = JpegCodec.decode_scaled(&mut jpeg.as_slice(), 32).unwrap();
        assert_eq!(img.dimensions(), (5, 3));
    }

    #[test]
    fn decode_within_budget_keeps_original_size() {
        let jpeg = encode_jpeg(40, 30);
        let source = MemorySource::new("one.jpg", jpeg);
        let image = BoundedDecoder::new()
            .decode(&source, 0, budget(100, 100))
            .unwrap();
        assert_eq!(image.downscale(), 1);
        assert_eq!((image.width(), image.height()), (40, 30));
        assert_eq!(image.original_dimensions(), (40, 30));
    }

    #[test]
    fn decode_at_offset_with_downscale() {
        let mut data = vec![0u8; 100];
        data.extend(encode_jpeg(128, 64));
        let source = MemorySource::new("padded.mpo", data);
        let image = BoundedDecoder::new()
            .decode(&source, 100, budget(32, 32))
            .unwrap();
        assert_eq!(image.downscale(), 4);
        assert_eq!((image.width(), image.height()), (32, 16));
        assert_eq!(image.offset(), 100);
    }

    #[test]
    fn zero_dimension_probe_fails() {
        let source = MemorySource::new("zero.mpo", vec![0u8; 16]);
        for (w, h) in [(0, 10), (10, 0), (0, 0)] {
            let err = BoundedDecoder::with_codec(FixedProbe(w, h))
                .decode(&source, 4, budget(10, 10))
                .unwrap_err();
            assert!(matches!(
                err,
                DecodeError::ProbeFailed {
                    offset: 4,
                    cause: CodecError::InvalidDimensions { .. },
                    ..
                }
            ));
        }
    }

    #[test]
    fn trailing_fragment_fails_probe() {
        let mut data = encode_jpeg(16, 16);
        let tail = data.len() as u64;
        data.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE1, 0x00, 0x02]);
        let source = MemorySource::new("tail.mpo", data);
        let err = BoundedDecoder::new()
            .decode(&source, tail, budget(16, 16))
            .unwrap_err();
        assert!(matches!(err, DecodeError::ProbeFailed { offset, .. } if offset == tail));
    }

    #[test]
    fn fake_codec_receives_factor() {
        let source = MemorySource::new("fake.mpo", vec![0u8; 4]);
        let image = BoundedDecoder::with_codec(FixedProbe(4000, 3000))
            .decode(&source, 0, budget(1000, 1000))
            .unwrap();
        assert_eq!(image.downscale(), 4);
        assert_eq!((image.width(), image.height()), (1000, 750));
    }

    /// Probes fine, then fails the pixel decode.
    struct BrokenScan;

    impl ImageCodec for BrokenScan {
        fn probe_dimensions(&self, _: &mut dyn Read) -> Result<(u32, u32), CodecError> {
            Ok((640, 480))
        }

        fn decode_scaled(&self, _: &mut dyn Read, _: u32) -> Result<RgbImage, CodecError> {
            Err(CodecError::UnsupportedFormat("truncated scan".into()))
        }
    }

    #[test]
    fn decode_failure_after_good_probe() {
        let source = MemorySource::new("broken.mpo", vec![0u8; 64]);
        let err = BoundedDecoder::with_codec(BrokenScan)
            .decode(&source, 12, budget(320, 240))
            .unwrap_err();
        assert!(matches!(
            err,
            DecodeError::DecodeFailed {
                offset: 12,
                cause: CodecError::UnsupportedFormat(_),
                ..
            }
        ));
        assert_eq!(err.offset(), Some(12));
    }
}
