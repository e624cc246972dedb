//! Image stream conversion: decode, recolor, re-encode.
//!
//! An [`ImageRecord`] is a detached copy of one image XObject: dimensions,
//! descriptor, filter chain and the still-encoded bytes. Records cross the
//! worker boundary as plain values; nothing here touches the document. The
//! page converter extracts records, hands them to [`convert_image`] (inline
//! or on a worker) and writes the resulting [`ConvertedImage`] back.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use lopdf::{Document, Object, Stream};

use crate::buffer::{BufferConvertOptions, BufferConverter};
use crate::color_space::{
    parse_color_space, ColorSpaceDescriptor, IndexedLookup,
};
use crate::engine::{Endianness, PixelColor, ProfileHandle, RenderingIntent};
use crate::errors::{ConvertError, ConvertResult};
use crate::policy::ConversionCategory;

/// Stream filters the converter understands. Anything else makes the image
/// a skip-with-warning case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFilter {
    Flate,
    Lzw,
    Dct,
    Ccitt,
    Jpx,
    Other(String),
}

impl StreamFilter {
    pub fn from_name(name: &[u8]) -> Self {
        match name {
            b"FlateDecode" | b"Fl" => StreamFilter::Flate,
            b"LZWDecode" | b"LZW" => StreamFilter::Lzw,
            b"DCTDecode" | b"DCT" => StreamFilter::Dct,
            b"CCITTFaxDecode" | b"CCF" => StreamFilter::Ccitt,
            b"JPXDecode" => StreamFilter::Jpx,
            other => StreamFilter::Other(String::from_utf8_lossy(other).to_string()),
        }
    }

    pub fn pdf_name(&self) -> &str {
        match self {
            StreamFilter::Flate => "FlateDecode",
            StreamFilter::Lzw => "LZWDecode",
            StreamFilter::Dct => "DCTDecode",
            StreamFilter::Ccitt => "CCITTFaxDecode",
            StreamFilter::Jpx => "JPXDecode",
            StreamFilter::Other(name) => name,
        }
    }
}

/// `/DecodeParms` predictor parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictorParams {
    pub predictor: u8,
    pub colors: usize,
    pub bits_per_component: u8,
    pub columns: usize,
}

impl PredictorParams {
    fn from_dict(dict: &lopdf::Dictionary) -> Self {
        let int = |key: &[u8], default: i64| {
            dict.get(key).ok().and_then(|o| o.as_i64().ok()).unwrap_or(default)
        };
        PredictorParams {
            predictor: int(b"Predictor", 1) as u8,
            colors: int(b"Colors", 1) as usize,
            bits_per_component: int(b"BitsPerComponent", 8) as u8,
            columns: int(b"Columns", 1) as usize,
        }
    }

    fn is_active(&self) -> bool {
        self.predictor > 1
    }

    fn row_bytes(&self) -> usize {
        (self.columns * self.colors * self.bits_per_component as usize + 7) / 8
    }

    fn sample_bytes(&self) -> usize {
        ((self.colors * self.bits_per_component as usize) + 7) / 8
    }
}

/// Detached copy of one image XObject.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub width: usize,
    pub height: usize,
    pub bits_per_component: u8,
    pub color_space: ColorSpaceDescriptor,
    pub filters: Vec<StreamFilter>,
    pub predictor: Option<PredictorParams>,
    /// Raw, still-encoded stream bytes.
    pub data: Vec<u8>,
    /// Decoded palette bytes when the space is indexed.
    pub palette: Option<Vec<u8>>,
}

impl ImageRecord {
    /// Builds a record from an image XObject stream. Palette lookups are
    /// decoded here (they may live in their own compressed stream); the
    /// pixel data stays encoded.
    pub fn from_stream(doc: &Document, stream: &Stream) -> ConvertResult<ImageRecord> {
        let dict = &stream.dict;
        let width = dict.get(b"Width")?.as_i64()? as usize;
        let height = dict.get(b"Height")?.as_i64()? as usize;
        let bits_per_component = dict
            .get(b"BitsPerComponent")
            .ok()
            .and_then(|o| o.as_i64().ok())
            .unwrap_or(8) as u8;
        let color_space = parse_color_space(doc, dict.get(b"ColorSpace")?)?;

        let mut filters = Vec::new();
        if let Ok(filter_obj) = dict.get(b"Filter") {
            match filter_obj {
                Object::Name(name) => filters.push(StreamFilter::from_name(name)),
                Object::Array(items) => {
                    for item in items {
                        if let Object::Name(name) = item {
                            filters.push(StreamFilter::from_name(name));
                        }
                    }
                }
                _ => {}
            }
        }

        let predictor = dict
            .get(b"DecodeParms")
            .or_else(|_| dict.get(b"DP"))
            .ok()
            .and_then(|obj| match obj {
                Object::Dictionary(d) => Some(PredictorParams::from_dict(d)),
                Object::Array(items) => items.iter().find_map(|o| {
                    o.as_dict().ok().map(PredictorParams::from_dict)
                }),
                _ => None,
            })
            .filter(PredictorParams::is_active);

        let palette = match &color_space {
            ColorSpaceDescriptor::Indexed { lookup, .. } => Some(match lookup {
                IndexedLookup::Inline(bytes) => bytes.clone(),
                IndexedLookup::Stream(id) => {
                    let lookup_stream = doc.get_object(*id)?.as_stream()?;
                    lookup_stream
                        .decompressed_content()
                        .unwrap_or_else(|_| lookup_stream.content.clone())
                }
            }),
            _ => None,
        };

        Ok(ImageRecord {
            width,
            height,
            bits_per_component,
            color_space,
            filters,
            predictor,
            data: stream.content.clone(),
            palette,
        })
    }

    pub fn is_indexed(&self) -> bool {
        matches!(self.color_space, ColorSpaceDescriptor::Indexed { .. })
    }

    /// Decodes the pixel bytes: reverses the stream filter, then the
    /// predictor. Unsupported filters surface `StreamFilterUnsupported`.
    pub fn decode_pixels(&self) -> ConvertResult<Vec<u8>> {
        let inflated = match self.filters.as_slice() {
            [] => self.data.clone(),
            [StreamFilter::Flate] => inflate(&self.data)?,
            [StreamFilter::Lzw] => lzw_decode(&self.data)?,
            [one] => {
                return Err(ConvertError::StreamFilterUnsupported(
                    one.pdf_name().to_string(),
                ))
            }
            many => {
                return Err(ConvertError::StreamFilterUnsupported(
                    many.iter()
                        .map(StreamFilter::pdf_name)
                        .collect::<Vec<_>>()
                        .join("+"),
                ))
            }
        };
        match &self.predictor {
            Some(params) => unpredict(&inflated, params),
            None => Ok(inflated),
        }
    }
}

/// Resolved profile chain for an image conversion.
#[derive(Debug, Clone)]
pub struct ImageChain {
    pub source: ProfileHandle,
    pub intermediates: Vec<ProfileHandle>,
    pub destination: ProfileHandle,
}

/// Knobs the image converter honors per task.
#[derive(Debug, Clone)]
pub struct ImageConvertSettings {
    pub intent: RenderingIntent,
    pub black_point_compensation: bool,
    pub adaptive_bpc_clamping: bool,
    /// `None` preserves the source bit depth.
    pub output_bits_per_component: Option<u8>,
}

impl Default for ImageConvertSettings {
    fn default() -> Self {
        ImageConvertSettings {
            intent: RenderingIntent::default(),
            black_point_compensation: false,
            adaptive_bpc_clamping: false,
            output_bits_per_component: None,
        }
    }
}

/// Converted palette bytes for an indexed image.
#[derive(Debug, Clone)]
pub struct ConvertedPalette {
    pub data: Vec<u8>,
    pub channels: usize,
}

/// Result of [`convert_image`], ready to be written back into the stream.
#[derive(Debug, Clone)]
pub struct ConvertedImage {
    pub data: Vec<u8>,
    pub filters: Vec<StreamFilter>,
    pub predictor: Option<PredictorParams>,
    pub bits_per_component: u8,
    pub channels: usize,
    pub palette: Option<ConvertedPalette>,
    pub pixel_count: usize,
}

/// Converts one image record. Indexed images have only their palette
/// recolored; everything else goes through the buffer converter pixel by
/// pixel, then gets re-encoded the way the source was encoded.
pub fn convert_image(
    record: &ImageRecord,
    chain: &ImageChain,
    settings: &ImageConvertSettings,
    converter: &mut BufferConverter,
) -> ConvertResult<ConvertedImage> {
    if let Some(palette) = &record.palette {
        return convert_palette(record, palette, chain, settings, converter);
    }

    let pixels = record.decode_pixels()?;

    let mut opts = BufferConvertOptions::new(chain.source, chain.destination);
    opts.intermediates = chain.intermediates.clone();
    opts.input_bits_per_component = Some(record.bits_per_component);
    opts.output_bits_per_component = Some(match settings.output_bits_per_component {
        Some(bits) => bits,
        None if record.bits_per_component < 8 => 8,
        None => record.bits_per_component,
    });
    // PDF stores 16-bit samples big-endian.
    if record.bits_per_component == 16 {
        opts.input_endianness = Some(Endianness::Big);
    }
    if opts.output_bits_per_component == Some(16) {
        opts.output_endianness = Some(Endianness::Big);
    }
    opts.intent = settings.intent;
    opts.black_point_compensation = settings.black_point_compensation;
    opts.adaptive_bpc_clamping = settings.adaptive_bpc_clamping;
    opts.category = ConversionCategory::Image;

    let out = converter.convert(&pixels, &opts)?;
    let out_bits = opts.output_bits_per_component.unwrap_or(8);

    // Re-encode the way the source was encoded: Flate keeps Flate (with the
    // predictor applied forward under updated parameters), everything else
    // is written raw.
    let (data, filters, predictor) = if record.filters.contains(&StreamFilter::Flate) {
        let predictor = record.predictor.as_ref().map(|p| PredictorParams {
            predictor: p.predictor,
            colors: out.output_channels,
            bits_per_component: out_bits,
            columns: record.width,
        });
        let predicted = match &predictor {
            Some(params) => predict(&out.bytes, params)?,
            None => out.bytes,
        };
        (deflate(&predicted), vec![StreamFilter::Flate], predictor)
    } else {
        (out.bytes, Vec::new(), None)
    };

    Ok(ConvertedImage {
        data,
        filters,
        predictor,
        bits_per_component: out_bits,
        channels: out.output_channels,
        palette: None,
        pixel_count: out.pixel_count,
    })
}

/// Palette-only path: the lookup table is recolored, the index bytes and
/// their encoding stay untouched.
fn convert_palette(
    record: &ImageRecord,
    palette: &[u8],
    chain: &ImageChain,
    settings: &ImageConvertSettings,
    converter: &mut BufferConverter,
) -> ConvertResult<ConvertedImage> {
    let mut opts = BufferConvertOptions::new(chain.source, chain.destination);
    opts.intermediates = chain.intermediates.clone();
    opts.input_bits_per_component = Some(8);
    opts.output_bits_per_component = Some(8);
    opts.intent = settings.intent;
    opts.black_point_compensation = settings.black_point_compensation;
    opts.adaptive_bpc_clamping = settings.adaptive_bpc_clamping;
    opts.category = ConversionCategory::IndexedPalette;

    let out = converter.convert(palette, &opts)?;

    Ok(ConvertedImage {
        data: record.data.clone(),
        filters: record.filters.clone(),
        predictor: record.predictor.clone(),
        bits_per_component: record.bits_per_component,
        channels: out.output_channels,
        palette: Some(ConvertedPalette {
            data: out.bytes,
            channels: out.output_channels,
        }),
        pixel_count: out.pixel_count,
    })
}

fn inflate(data: &[u8]) -> ConvertResult<Vec<u8>> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| ConvertError::StreamFilterUnsupported(format!("FlateDecode: {e}")))?;
    Ok(out)
}

pub(crate) fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    // Writing to a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

fn lzw_decode(data: &[u8]) -> ConvertResult<Vec<u8>> {
    // PDF LZW is the TIFF variant with the early code-size switch.
    weezl::decode::Decoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8)
        .decode(data)
        .map_err(|e| ConvertError::StreamFilterUnsupported(format!("LZWDecode: {e}")))
}

/// Reverses a `/Predictor` stage. PNG predictors (10..15) carry a filter
/// type byte per row; TIFF predictor 2 is plain horizontal differencing.
fn unpredict(data: &[u8], params: &PredictorParams) -> ConvertResult<Vec<u8>> {
    match params.predictor {
        2 => {
            let mut out = data.to_vec();
            undo_horizontal_differencing(&mut out, params);
            Ok(out)
        }
        10..=15 => unpredict_png(data, params),
        other => Err(ConvertError::StreamFilterUnsupported(format!(
            "predictor {other}"
        ))),
    }
}

fn unpredict_png(data: &[u8], params: &PredictorParams) -> ConvertResult<Vec<u8>> {
    let row_bytes = params.row_bytes();
    let bpp = params.sample_bytes();
    let stride = row_bytes + 1;
    if row_bytes == 0 || data.len() % stride != 0 {
        return Err(ConvertError::BufferMisaligned {
            len: data.len(),
            stride,
        });
    }
    let rows = data.len() / stride;
    let mut out = vec![0u8; rows * row_bytes];
    let mut prev_row = vec![0u8; row_bytes];

    for row in 0..rows {
        let filter = data[row * stride];
        let src = &data[row * stride + 1..(row + 1) * stride];
        let dst_start = row * row_bytes;
        for i in 0..row_bytes {
            let raw = src[i];
            let left = if i >= bpp { out[dst_start + i - bpp] } else { 0 };
            let up = prev_row[i];
            let up_left = if i >= bpp { prev_row[i - bpp] } else { 0 };
            let value = match filter {
                0 => raw,
                1 => raw.wrapping_add(left),
                2 => raw.wrapping_add(up),
                3 => raw.wrapping_add((((left as u16) + (up as u16)) / 2) as u8),
                4 => raw.wrapping_add(paeth(left, up, up_left)),
                other => {
                    return Err(ConvertError::StreamFilterUnsupported(format!(
                        "png row filter {other}"
                    )))
                }
            };
            out[dst_start + i] = value;
        }
        prev_row.copy_from_slice(&out[dst_start..dst_start + row_bytes]);
    }
    Ok(out)
}

/// Applies a predictor forward for re-encoding. PNG rows are written with
/// the None row filter, which any PNG-predictor decoder accepts.
fn predict(data: &[u8], params: &PredictorParams) -> ConvertResult<Vec<u8>> {
    match params.predictor {
        2 => {
            let mut out = data.to_vec();
            apply_horizontal_differencing(&mut out, params);
            Ok(out)
        }
        10..=15 => {
            let row_bytes = params.row_bytes();
            if row_bytes == 0 || data.len() % row_bytes != 0 {
                return Err(ConvertError::BufferMisaligned {
                    len: data.len(),
                    stride: row_bytes,
                });
            }
            let mut out = Vec::with_capacity(data.len() + data.len() / row_bytes);
            for row in data.chunks_exact(row_bytes) {
                out.push(0);
                out.extend_from_slice(row);
            }
            Ok(out)
        }
        other => Err(ConvertError::StreamFilterUnsupported(format!(
            "predictor {other}"
        ))),
    }
}

fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

fn undo_horizontal_differencing(data: &mut [u8], params: &PredictorParams) {
    let row_bytes = params.row_bytes();
    if row_bytes == 0 {
        return;
    }
    if params.bits_per_component == 16 {
        // Differencing is per 16-bit component (big-endian in PDF data).
        let colors = params.colors;
        for row in data.chunks_exact_mut(row_bytes) {
            for i in colors..row.len() / 2 {
                let prev = u16::from_be_bytes([row[(i - colors) * 2], row[(i - colors) * 2 + 1]]);
                let cur = u16::from_be_bytes([row[i * 2], row[i * 2 + 1]]);
                row[i * 2..i * 2 + 2].copy_from_slice(&cur.wrapping_add(prev).to_be_bytes());
            }
        }
        return;
    }
    let bpp = params.sample_bytes();
    if bpp == 0 {
        return;
    }
    for row in data.chunks_exact_mut(row_bytes) {
        for i in bpp..row.len() {
            row[i] = row[i].wrapping_add(row[i - bpp]);
        }
    }
}

fn apply_horizontal_differencing(data: &mut [u8], params: &PredictorParams) {
    let row_bytes = params.row_bytes();
    if row_bytes == 0 {
        return;
    }
    if params.bits_per_component == 16 {
        let colors = params.colors;
        for row in data.chunks_exact_mut(row_bytes) {
            for i in (colors..row.len() / 2).rev() {
                let prev = u16::from_be_bytes([row[(i - colors) * 2], row[(i - colors) * 2 + 1]]);
                let cur = u16::from_be_bytes([row[i * 2], row[i * 2 + 1]]);
                row[i * 2..i * 2 + 2].copy_from_slice(&cur.wrapping_sub(prev).to_be_bytes());
            }
        }
        return;
    }
    let bpp = params.sample_bytes();
    if bpp == 0 {
        return;
    }
    for row in data.chunks_exact_mut(row_bytes) {
        for i in (bpp..row.len()).rev() {
            row[i] = row[i].wrapping_sub(row[i - bpp]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::LogContext;
    use crate::engine::BuiltinProfile;
    use pretty_assertions::assert_eq;

    fn srgb_chain(converter: &mut BufferConverter) -> ImageChain {
        let srgb = converter.builtin(BuiltinProfile::SRgb).unwrap();
        ImageChain {
            source: srgb,
            intermediates: Vec::new(),
            destination: srgb,
        }
    }

    fn rgb_record(width: usize, height: usize, data: Vec<u8>) -> ImageRecord {
        ImageRecord {
            width,
            height,
            bits_per_component: 8,
            color_space: ColorSpaceDescriptor::DeviceRgb,
            filters: Vec::new(),
            predictor: None,
            data,
            palette: None,
        }
    }

    #[test]
    fn png_predictor_round_trip() {
        let params = PredictorParams {
            predictor: 15,
            colors: 3,
            bits_per_component: 8,
            columns: 4,
        };
        let pixels: Vec<u8> = (0u8..48).collect();
        let predicted = predict(&pixels, &params).unwrap();
        assert_eq!(predicted.len(), pixels.len() + 4);
        let restored = unpredict(&predicted, &params).unwrap();
        assert_eq!(restored, pixels);
    }

    #[test]
    fn png_up_filter_is_reversed() {
        let params = PredictorParams {
            predictor: 12,
            colors: 1,
            bits_per_component: 8,
            columns: 3,
        };
        // Two rows, second encoded with the Up filter.
        let encoded = vec![0, 10, 20, 30, 2, 5, 5, 5];
        let restored = unpredict(&encoded, &params).unwrap();
        assert_eq!(restored, vec![10, 20, 30, 15, 25, 35]);
    }

    #[test]
    fn tiff_differencing_round_trip() {
        let params = PredictorParams {
            predictor: 2,
            colors: 3,
            bits_per_component: 8,
            columns: 3,
        };
        let pixels = vec![100, 110, 120, 103, 110, 117, 106, 110, 114];
        let mut diffed = pixels.clone();
        apply_horizontal_differencing(&mut diffed, &params);
        let restored = unpredict(&diffed, &params).unwrap();
        assert_eq!(restored, pixels);
    }

    #[test]
    fn flate_image_round_trips_through_identity() {
        let mut converter = BufferConverter::new(LogContext::default());
        let chain = srgb_chain(&mut converter);

        let pixels: Vec<u8> = vec![250, 10, 10, 10, 250, 10, 10, 10, 250, 128, 128, 128];
        let mut record = rgb_record(2, 2, deflate(&pixels));
        record.filters = vec![StreamFilter::Flate];

        let out = convert_image(
            &record,
            &chain,
            &ImageConvertSettings::default(),
            &mut converter,
        )
        .unwrap();

        assert_eq!(out.filters, vec![StreamFilter::Flate]);
        assert_eq!(out.channels, 3);
        assert_eq!(out.pixel_count, 4);
        let restored = inflate(&out.data).unwrap();
        for (a, b) in pixels.iter().zip(restored.iter()) {
            assert!((*a as i16 - *b as i16).abs() <= 1, "{a} vs {b}");
        }
    }

    #[test]
    fn raw_image_stays_raw() {
        let mut converter = BufferConverter::new(LogContext::default());
        let chain = srgb_chain(&mut converter);
        let record = rgb_record(1, 1, vec![1, 2, 3]);
        let out = convert_image(
            &record,
            &chain,
            &ImageConvertSettings::default(),
            &mut converter,
        )
        .unwrap();
        assert!(out.filters.is_empty());
        assert_eq!(out.data.len(), 3);
    }

    #[test]
    fn indexed_image_converts_palette_only() {
        let mut converter = BufferConverter::new(LogContext::default());
        let chain = srgb_chain(&mut converter);

        let indices = vec![0u8, 1, 1, 0];
        let record = ImageRecord {
            width: 2,
            height: 2,
            bits_per_component: 8,
            color_space: ColorSpaceDescriptor::Indexed {
                base: Box::new(ColorSpaceDescriptor::DeviceRgb),
                hival: 1,
                lookup: IndexedLookup::Inline(vec![0, 0, 0, 255, 255, 255]),
            },
            filters: Vec::new(),
            predictor: None,
            data: indices.clone(),
            palette: Some(vec![0, 0, 0, 255, 255, 255]),
        };

        let out = convert_image(
            &record,
            &chain,
            &ImageConvertSettings::default(),
            &mut converter,
        )
        .unwrap();

        assert_eq!(out.data, indices, "pixel indices stay untouched");
        let palette = out.palette.expect("palette was converted");
        assert_eq!(palette.channels, 3);
        assert_eq!(palette.data.len(), 6);
        assert!(palette.data[0] <= 2 && palette.data[3] >= 253);
    }

    #[test]
    fn jpx_is_reported_unsupported() {
        let mut record = rgb_record(1, 1, vec![0, 0, 0]);
        record.filters = vec![StreamFilter::Jpx];
        let err = record.decode_pixels().unwrap_err();
        assert!(matches!(err, ConvertError::StreamFilterUnsupported(_)));
        assert!(err.is_skippable());
    }

    #[test]
    fn lzw_stream_decodes() {
        let pixels: Vec<u8> = vec![20, 40, 60, 20, 40, 60];
        let encoded = weezl::encode::Encoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8)
            .encode(&pixels)
            .unwrap();
        let mut record = rgb_record(2, 1, encoded);
        record.filters = vec![StreamFilter::Lzw];
        assert_eq!(record.decode_pixels().unwrap(), pixels);
    }
}
