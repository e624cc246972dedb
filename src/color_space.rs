//! Tagged color-space descriptors and their lopdf round-trip.
//!
//! Every color-bearing position in a PDF resolves to one of these variants.
//! After document conversion no `Device*`, `Cal*` or `Lab` descriptor may
//! remain in a color-bearing position; they are rewritten to `ICCBased`
//! arrays referencing the embedded destination profile. Spot (`Separation`)
//! and `DeviceN` spaces are passthrough and stay untouched.

use lopdf::{Dictionary, Document, Object, ObjectId};

use crate::engine::PixelColor;
use crate::errors::{ConvertError, ConvertResult};

/// Palette bytes of an indexed space: inline string or a stream reference.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexedLookup {
    Inline(Vec<u8>),
    Stream(ObjectId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColorSpaceDescriptor {
    DeviceGray,
    DeviceRgb,
    DeviceCmyk,
    CalGray {
        params: Dictionary,
    },
    CalRgb {
        params: Dictionary,
    },
    Lab {
        params: Dictionary,
    },
    IccBased {
        channels: i64,
        stream: ObjectId,
        alternate: Option<Box<ColorSpaceDescriptor>>,
    },
    Indexed {
        base: Box<ColorSpaceDescriptor>,
        hival: i64,
        lookup: IndexedLookup,
    },
    Separation {
        name: Vec<u8>,
        alternate: Box<ColorSpaceDescriptor>,
    },
    DeviceN {
        names: Vec<Vec<u8>>,
        alternate: Box<ColorSpaceDescriptor>,
    },
    Pattern,
}

impl ColorSpaceDescriptor {
    /// Engine color family of this space, `None` for spot/pattern spaces
    /// the converter passes through.
    pub fn family(&self) -> Option<PixelColor> {
        match self {
            ColorSpaceDescriptor::DeviceGray | ColorSpaceDescriptor::CalGray { .. } => {
                Some(PixelColor::Gray)
            }
            ColorSpaceDescriptor::DeviceRgb | ColorSpaceDescriptor::CalRgb { .. } => {
                Some(PixelColor::Rgb)
            }
            ColorSpaceDescriptor::DeviceCmyk => Some(PixelColor::Cmyk),
            ColorSpaceDescriptor::Lab { .. } => Some(PixelColor::Lab),
            ColorSpaceDescriptor::IccBased { channels, alternate, .. } => match channels {
                1 => Some(PixelColor::Gray),
                3 => Some(PixelColor::Rgb),
                4 => Some(PixelColor::Cmyk),
                _ => alternate.as_ref().and_then(|a| a.family()),
            },
            ColorSpaceDescriptor::Indexed { base, .. } => base.family(),
            ColorSpaceDescriptor::Separation { .. }
            | ColorSpaceDescriptor::DeviceN { .. }
            | ColorSpaceDescriptor::Pattern => None,
        }
    }

    /// Components per pixel as stored in the image data (indexed spaces
    /// store one index per pixel).
    pub fn components(&self) -> Option<usize> {
        match self {
            ColorSpaceDescriptor::Indexed { .. } => Some(1),
            ColorSpaceDescriptor::DeviceN { names, .. } => Some(names.len()),
            ColorSpaceDescriptor::Separation { .. } => Some(1),
            ColorSpaceDescriptor::Pattern => None,
            other => other.family().map(PixelColor::channels),
        }
    }

    /// True when the conversion must replace this descriptor.
    pub fn needs_rewrite(&self) -> bool {
        match self {
            ColorSpaceDescriptor::DeviceGray
            | ColorSpaceDescriptor::DeviceRgb
            | ColorSpaceDescriptor::DeviceCmyk
            | ColorSpaceDescriptor::CalGray { .. }
            | ColorSpaceDescriptor::CalRgb { .. }
            | ColorSpaceDescriptor::Lab { .. } => true,
            ColorSpaceDescriptor::Indexed { base, .. } => base.needs_rewrite(),
            ColorSpaceDescriptor::IccBased { .. }
            | ColorSpaceDescriptor::Separation { .. }
            | ColorSpaceDescriptor::DeviceN { .. }
            | ColorSpaceDescriptor::Pattern => false,
        }
    }

    /// Spot and multi-ink spaces the converter leaves alone.
    pub fn is_passthrough(&self) -> bool {
        matches!(
            self,
            ColorSpaceDescriptor::Separation { .. }
                | ColorSpaceDescriptor::DeviceN { .. }
                | ColorSpaceDescriptor::Pattern
        )
    }
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> ConvertResult<&'a Object> {
    match obj {
        Object::Reference(id) => Ok(doc.get_object(*id)?),
        other => Ok(other),
    }
}

fn name_of(obj: &Object) -> ConvertResult<&[u8]> {
    match obj {
        Object::Name(name) => Ok(name),
        _ => Err(ConvertError::InvalidArgument(
            "expected a PDF name".to_string(),
        )),
    }
}

fn parse_named(name: &[u8]) -> Option<ColorSpaceDescriptor> {
    match name {
        b"DeviceGray" | b"G" => Some(ColorSpaceDescriptor::DeviceGray),
        b"DeviceRGB" | b"RGB" => Some(ColorSpaceDescriptor::DeviceRgb),
        b"DeviceCMYK" | b"CMYK" => Some(ColorSpaceDescriptor::DeviceCmyk),
        b"Pattern" => Some(ColorSpaceDescriptor::Pattern),
        _ => None,
    }
}

/// Parses any color-space object, resolving references through the
/// document.
pub fn parse_color_space(doc: &Document, obj: &Object) -> ConvertResult<ColorSpaceDescriptor> {
    let obj = resolve(doc, obj)?;
    match obj {
        Object::Name(name) => parse_named(name).ok_or_else(|| {
            ConvertError::InvalidArgument(format!(
                "unknown color space name {}",
                String::from_utf8_lossy(name)
            ))
        }),
        Object::Array(items) => parse_color_space_array(doc, items),
        other => Err(ConvertError::InvalidArgument(format!(
            "color space must be a name or array, got {other:?}"
        ))),
    }
}

fn parse_color_space_array(
    doc: &Document,
    items: &[Object],
) -> ConvertResult<ColorSpaceDescriptor> {
    let head = items
        .first()
        .ok_or_else(|| ConvertError::InvalidArgument("empty color space array".to_string()))?;
    let head = name_of(resolve(doc, head)?)?;

    match head {
        b"CalGray" | b"CalRGB" | b"Lab" => {
            let params = resolve(doc, items.get(1).ok_or_else(missing_operand)?)?
                .as_dict()?
                .clone();
            Ok(match head {
                b"CalGray" => ColorSpaceDescriptor::CalGray { params },
                b"CalRGB" => ColorSpaceDescriptor::CalRgb { params },
                _ => ColorSpaceDescriptor::Lab { params },
            })
        }
        b"ICCBased" => {
            let stream_ref = items
                .get(1)
                .ok_or_else(missing_operand)?
                .as_reference()?;
            let stream = doc.get_object(stream_ref)?.as_stream()?;
            let channels = stream.dict.get(b"N")?.as_i64()?;
            let alternate = match stream.dict.get(b"Alternate") {
                Ok(alt) => Some(Box::new(parse_color_space(doc, alt)?)),
                Err(_) => None,
            };
            Ok(ColorSpaceDescriptor::IccBased {
                channels,
                stream: stream_ref,
                alternate,
            })
        }
        b"Indexed" | b"I" => {
            let base = parse_color_space(doc, items.get(1).ok_or_else(missing_operand)?)?;
            let hival = resolve(doc, items.get(2).ok_or_else(missing_operand)?)?.as_i64()?;
            let lookup = match items.get(3).ok_or_else(missing_operand)? {
                Object::String(bytes, _) => IndexedLookup::Inline(bytes.clone()),
                Object::Reference(id) => match doc.get_object(*id)? {
                    Object::String(bytes, _) => IndexedLookup::Inline(bytes.clone()),
                    Object::Stream(_) => IndexedLookup::Stream(*id),
                    other => {
                        return Err(ConvertError::InvalidArgument(format!(
                            "indexed lookup must be a string or stream, got {other:?}"
                        )))
                    }
                },
                other => {
                    return Err(ConvertError::InvalidArgument(format!(
                        "indexed lookup must be a string or stream, got {other:?}"
                    )))
                }
            };
            Ok(ColorSpaceDescriptor::Indexed {
                base: Box::new(base),
                hival,
                lookup,
            })
        }
        b"Separation" => {
            let name = name_of(resolve(doc, items.get(1).ok_or_else(missing_operand)?)?)?.to_vec();
            let alternate =
                parse_color_space(doc, items.get(2).ok_or_else(missing_operand)?)?;
            Ok(ColorSpaceDescriptor::Separation {
                name,
                alternate: Box::new(alternate),
            })
        }
        b"DeviceN" => {
            let names = resolve(doc, items.get(1).ok_or_else(missing_operand)?)?
                .as_array()?
                .iter()
                .filter_map(|n| name_of(n).ok().map(<[u8]>::to_vec))
                .collect();
            let alternate =
                parse_color_space(doc, items.get(2).ok_or_else(missing_operand)?)?;
            Ok(ColorSpaceDescriptor::DeviceN {
                names,
                alternate: Box::new(alternate),
            })
        }
        b"Pattern" => Ok(ColorSpaceDescriptor::Pattern),
        other => parse_named(other).ok_or_else(|| {
            ConvertError::InvalidArgument(format!(
                "unknown color space family {}",
                String::from_utf8_lossy(other)
            ))
        }),
    }
}

fn missing_operand() -> ConvertError {
    ConvertError::InvalidArgument("truncated color space array".to_string())
}

/// The `[ /ICCBased <ref> ]` array every rewritten descriptor becomes.
pub fn icc_based_array(stream: ObjectId) -> Object {
    Object::Array(vec![
        Object::Name(b"ICCBased".to_vec()),
        Object::Reference(stream),
    ])
}

/// Reads the raw ICC bytes out of an `ICCBased` stream object.
pub fn icc_profile_bytes(doc: &Document, stream: ObjectId) -> ConvertResult<Vec<u8>> {
    let stream = doc.get_object(stream)?.as_stream()?;
    Ok(stream
        .decompressed_content()
        .unwrap_or_else(|_| stream.content.clone()))
}
