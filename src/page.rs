//! Page-level conversion: resource enumeration and dispatch.
//!
//! One call converts one page: every image XObject goes through the image
//! converter (inline or as a worker task), every content stream through the
//! content rewriter, Form XObjects are recursed into, and the page's
//! ColorSpace resources are rewritten to the destination. The page converter
//! never blocks on worker replies; the document converter drains them and
//! writes pending images back.

use std::collections::{HashMap, HashSet};

use log::{debug, warn};
use lopdf::{Dictionary, Document, Object, ObjectId, StringFormat};

use crate::buffer::{BufferConvertOptions, BufferConverter};
use crate::color_space::{
    icc_based_array, parse_color_space, ColorSpaceDescriptor, IndexedLookup,
};
use crate::content::{
    ContentConvertSettings, ContentConverter, ContentSourceProfiles, DEST_COLOR_SPACE_RESOURCE,
};
use crate::document::ConvertShared;
use crate::engine::{BuiltinProfile, PixelColor, ProfileHandle};
use crate::errors::{ConvertError, ConvertResult, ResultExt};
use crate::image::{
    convert_image, deflate, ConvertedImage, ImageChain, ImageConvertSettings, ImageRecord,
    StreamFilter,
};
use crate::policy::ConversionCategory;
use crate::utils::CancelToken;
use crate::worker::{ChainSpec, ProfileSpec, WorkerPool};

/// Write-back information for an image task in flight.
#[derive(Debug, Clone)]
pub struct PendingImage {
    pub stream: ObjectId,
    pub page_index: usize,
}

/// Counters reported per page.
#[derive(Debug, Default)]
pub struct PageOutcome {
    pub images_converted: usize,
    pub images_skipped: usize,
    pub tasks_submitted: usize,
    pub rewritten_ops: usize,
}

/// Mutable state threaded through page conversions of one document run.
pub struct PageContext<'a> {
    pub shared: &'a ConvertShared,
    pub buffer: &'a mut BufferConverter,
    pub pool: Option<&'a WorkerPool>,
    pub pending: &'a mut HashMap<u64, PendingImage>,
    /// Streams already converted (or queued); pages sharing one image
    /// object convert it exactly once.
    pub converted_streams: &'a mut HashSet<ObjectId>,
    /// Embedded source profiles already opened on the main engine.
    pub opened_icc: &'a mut HashMap<ObjectId, ProfileHandle>,
    pub cancel: &'a CancelToken,
}

pub fn convert_page(
    doc: &mut Document,
    page_id: ObjectId,
    page_index: usize,
    ctx: &mut PageContext<'_>,
) -> ConvertResult<PageOutcome> {
    ctx.cancel.check()?;
    let mut outcome = PageOutcome::default();

    let resources_id = own_resources(doc, page_id).on_page(page_index)?;

    // Snapshot the resource ids before mutating anything.
    let xobjects = xobject_ids(doc, resources_id).on_page(page_index)?;
    let content_ids = content_stream_ids(doc, page_id).on_page(page_index)?;

    let mut visited_forms = HashSet::new();
    for (_, xobject_id) in &xobjects {
        convert_xobject(
            doc,
            *xobject_id,
            page_index,
            ctx,
            &mut outcome,
            &mut visited_forms,
        )?;
    }

    if ctx.shared.convert_content_streams {
        for content_id in content_ids {
            convert_content_stream(doc, content_id, page_index, ctx, &mut outcome)?;
        }
        register_destination_space(doc, resources_id, ctx.shared.dest_ref).on_page(page_index)?;
    }

    rewrite_colorspace_resources(doc, resources_id, page_index, ctx, &mut outcome)?;

    Ok(outcome)
}

/// Ensures the page owns its Resources dictionary and returns the location
/// to mutate: either the referenced dictionary object or the page itself
/// (inline dictionary).
fn own_resources(doc: &mut Document, page_id: ObjectId) -> ConvertResult<ResourcesLocation> {
    enum Found {
        Referenced(ObjectId),
        Inline,
        Missing,
    }
    let found = {
        let page = doc.get_object(page_id)?.as_dict()?;
        match page.get(b"Resources") {
            Ok(Object::Reference(id)) => Found::Referenced(*id),
            Ok(Object::Dictionary(_)) => Found::Inline,
            _ => Found::Missing,
        }
    };
    match found {
        Found::Referenced(id) => Ok(ResourcesLocation::Object(id)),
        Found::Inline => Ok(ResourcesLocation::InlineIn(page_id)),
        Found::Missing => {
            // Inherited or missing: materialize a page-local copy so sibling
            // pages of other chains are not affected by our rewrite.
            let inherited = inherited_resources(doc, page_id)?.unwrap_or_default();
            let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
            page.set("Resources", Object::Dictionary(inherited));
            Ok(ResourcesLocation::InlineIn(page_id))
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ResourcesLocation {
    /// Resources live in their own object.
    Object(ObjectId),
    /// Resources are an inline dictionary inside this page object.
    InlineIn(ObjectId),
}

fn inherited_resources(doc: &Document, page_id: ObjectId) -> ConvertResult<Option<Dictionary>> {
    let mut current = page_id;
    for _ in 0..32 {
        let dict = doc.get_object(current)?.as_dict()?;
        if let Ok(res) = dict.get(b"Resources") {
            let res = match res {
                Object::Reference(id) => doc.get_object(*id)?.as_dict()?.clone(),
                Object::Dictionary(d) => d.clone(),
                _ => Dictionary::new(),
            };
            return Ok(Some(res));
        }
        match dict.get(b"Parent") {
            Ok(Object::Reference(parent)) => current = *parent,
            _ => return Ok(None),
        }
    }
    Ok(None)
}

fn with_resources<T>(
    doc: &mut Document,
    location: ResourcesLocation,
    f: impl FnOnce(&mut Dictionary) -> T,
) -> ConvertResult<T> {
    match location {
        ResourcesLocation::Object(id) => {
            let dict = doc.get_object_mut(id)?.as_dict_mut()?;
            Ok(f(dict))
        }
        ResourcesLocation::InlineIn(page_id) => {
            let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
            match page.get_mut(b"Resources") {
                Ok(Object::Dictionary(dict)) => Ok(f(dict)),
                _ => Err(ConvertError::InvalidArgument(
                    "page resources disappeared".to_string(),
                )),
            }
        }
    }
}

fn read_resources(doc: &Document, location: ResourcesLocation) -> ConvertResult<Dictionary> {
    match location {
        ResourcesLocation::Object(id) => Ok(doc.get_object(id)?.as_dict()?.clone()),
        ResourcesLocation::InlineIn(page_id) => {
            let page = doc.get_object(page_id)?.as_dict()?;
            match page.get(b"Resources") {
                Ok(Object::Dictionary(dict)) => Ok(dict.clone()),
                _ => Ok(Dictionary::new()),
            }
        }
    }
}

fn xobject_ids(
    doc: &Document,
    location: ResourcesLocation,
) -> ConvertResult<Vec<(Vec<u8>, ObjectId)>> {
    let resources = read_resources(doc, location)?;
    let mut out = Vec::new();
    if let Ok(xobjects) = resources.get(b"XObject") {
        let dict = match xobjects {
            Object::Reference(id) => doc.get_object(*id)?.as_dict()?.clone(),
            Object::Dictionary(d) => d.clone(),
            _ => return Ok(out),
        };
        for (name, value) in dict.iter() {
            if let Ok(id) = value.as_reference() {
                out.push((name.clone(), id));
            }
        }
    }
    Ok(out)
}

fn content_stream_ids(doc: &Document, page_id: ObjectId) -> ConvertResult<Vec<ObjectId>> {
    let page = doc.get_object(page_id)?.as_dict()?;
    let mut out = Vec::new();
    match page.get(b"Contents") {
        Ok(Object::Reference(id)) => out.push(*id),
        Ok(Object::Array(items)) => {
            for item in items {
                if let Ok(id) = item.as_reference() {
                    out.push(id);
                }
            }
        }
        _ => {}
    }
    Ok(out)
}

fn convert_xobject(
    doc: &mut Document,
    xobject_id: ObjectId,
    page_index: usize,
    ctx: &mut PageContext<'_>,
    outcome: &mut PageOutcome,
    visited_forms: &mut HashSet<ObjectId>,
) -> ConvertResult<()> {
    let subtype = {
        let stream = match doc.get_object(xobject_id).and_then(|o| o.as_stream()) {
            Ok(stream) => stream,
            Err(_) => return Ok(()),
        };
        stream
            .dict
            .get(b"Subtype")
            .ok()
            .and_then(|o| match o {
                Object::Name(n) => Some(n.clone()),
                _ => None,
            })
            .unwrap_or_default()
    };

    match subtype.as_slice() {
        b"Image" => convert_image_xobject(doc, xobject_id, page_index, ctx, outcome),
        b"Form" => convert_form_xobject(doc, xobject_id, page_index, ctx, outcome, visited_forms),
        _ => Ok(()),
    }
}

fn convert_image_xobject(
    doc: &mut Document,
    stream_id: ObjectId,
    page_index: usize,
    ctx: &mut PageContext<'_>,
    outcome: &mut PageOutcome,
) -> ConvertResult<()> {
    if !ctx.shared.convert_images {
        return Ok(());
    }
    if ctx.converted_streams.contains(&stream_id) {
        return Ok(());
    }

    let record = {
        let stream = doc.get_object(stream_id)?.as_stream()?;
        match ImageRecord::from_stream(doc, stream) {
            Ok(record) => record,
            Err(e) if e.is_skippable() => {
                warn!("page {page_index}: skipping image {stream_id:?}: {e}");
                outcome.images_skipped += 1;
                return Ok(());
            }
            Err(e) => return Err(e).on_page(page_index),
        }
    };

    if record.color_space.is_passthrough() {
        debug!("page {page_index}: image {stream_id:?} uses a passthrough space");
        return Ok(());
    }
    if let ColorSpaceDescriptor::IccBased { stream, .. } = &record.color_space {
        if *stream == ctx.shared.dest_ref {
            ctx.converted_streams.insert(stream_id);
            return Ok(());
        }
    }

    let Some(source) = resolve_source(doc, &record.color_space, ctx)? else {
        debug!(
            "page {page_index}: no source profile for image {stream_id:?}; leaving untouched"
        );
        outcome.images_skipped += 1;
        return Ok(());
    };

    ctx.converted_streams.insert(stream_id);

    if let Some(pool) = ctx.pool {
        let task_id = pool.submit(record, ChainSpec::inherit(source.spec));
        ctx.pending.insert(
            task_id,
            PendingImage {
                stream: stream_id,
                page_index,
            },
        );
        outcome.tasks_submitted += 1;
        return Ok(());
    }

    let chain = ImageChain {
        source: source.handle,
        intermediates: ctx.shared.intermediates.clone(),
        destination: ctx.shared.dest_handle,
    };
    let settings = ImageConvertSettings {
        intent: ctx.shared.intent,
        black_point_compensation: ctx.shared.black_point_compensation,
        adaptive_bpc_clamping: ctx.shared.adaptive_bpc_clamping,
        output_bits_per_component: ctx.shared.output_bits_per_component,
    };
    match convert_image(&record, &chain, &settings, ctx.buffer) {
        Ok(converted) => {
            write_back_image(doc, stream_id, &converted, ctx.shared.dest_ref)
                .on_page(page_index)?;
            outcome.images_converted += 1;
            Ok(())
        }
        Err(e) if e.is_skippable() => {
            warn!("page {page_index}: skipping image {stream_id:?}: {e}");
            outcome.images_skipped += 1;
            Ok(())
        }
        Err(e) => Err(e).on_page(page_index),
    }
}

struct SourceMaterial {
    spec: ProfileSpec,
    handle: ProfileHandle,
}

/// Resolves the source profile for an image descriptor. Returns `None` when
/// the image cannot be color-managed (no profile for its family).
fn resolve_source(
    doc: &Document,
    space: &ColorSpaceDescriptor,
    ctx: &mut PageContext<'_>,
) -> ConvertResult<Option<SourceMaterial>> {
    let effective = match space {
        ColorSpaceDescriptor::Indexed { base, .. } => base.as_ref(),
        other => other,
    };

    match effective {
        ColorSpaceDescriptor::IccBased { stream, .. } => {
            let bytes = crate::color_space::icc_profile_bytes(doc, *stream)?;
            let handle = match ctx.opened_icc.get(stream) {
                Some(&handle) => handle,
                None => {
                    let handle = ctx.buffer.engine_mut().open_profile(&bytes)?;
                    ctx.opened_icc.insert(*stream, handle);
                    handle
                }
            };
            Ok(Some(SourceMaterial {
                spec: ProfileSpec::Bytes(std::sync::Arc::new(bytes)),
                handle,
            }))
        }
        ColorSpaceDescriptor::Lab { .. } => {
            let handle = ctx.buffer.builtin(BuiltinProfile::LabD50)?;
            Ok(Some(SourceMaterial {
                spec: ProfileSpec::Builtin(BuiltinProfile::LabD50),
                handle,
            }))
        }
        other => {
            let family = other.family();
            let source = match family {
                Some(PixelColor::Gray) => ctx.shared.source_gray.as_ref(),
                Some(PixelColor::Rgb) => ctx.shared.source_rgb.as_ref(),
                Some(PixelColor::Cmyk) => ctx.shared.source_cmyk.as_ref(),
                _ => None,
            };
            Ok(source.map(|s| SourceMaterial {
                spec: s.spec.clone(),
                handle: s.handle,
            }))
        }
    }
}

/// Writes a converted image back into its stream object: data, filters,
/// descriptor and bit depth.
pub fn write_back_image(
    doc: &mut Document,
    stream_id: ObjectId,
    converted: &ConvertedImage,
    dest_ref: ObjectId,
) -> ConvertResult<()> {
    let stream = doc.get_object_mut(stream_id)?.as_stream_mut()?;

    let color_space = match &converted.palette {
        Some(palette) => {
            let hival = (palette.data.len() / palette.channels.max(1)).saturating_sub(1);
            Object::Array(vec![
                Object::Name(b"Indexed".to_vec()),
                icc_based_array(dest_ref),
                Object::Integer(hival as i64),
                Object::String(palette.data.clone(), StringFormat::Hexadecimal),
            ])
        }
        None => icc_based_array(dest_ref),
    };
    stream.dict.set("ColorSpace", color_space);
    stream
        .dict
        .set("BitsPerComponent", Object::Integer(converted.bits_per_component as i64));

    if converted.filters.is_empty() {
        stream.dict.remove(b"Filter");
        stream.dict.remove(b"DecodeParms");
        stream.dict.remove(b"DP");
    } else {
        let names: Vec<Object> = converted
            .filters
            .iter()
            .map(|f| Object::Name(f.pdf_name().as_bytes().to_vec()))
            .collect();
        if names.len() == 1 {
            stream.dict.set("Filter", names.into_iter().next().unwrap());
        } else {
            stream.dict.set("Filter", Object::Array(names));
        }
        match &converted.predictor {
            Some(p) => {
                let mut parms = Dictionary::new();
                parms.set("Predictor", Object::Integer(p.predictor as i64));
                parms.set("Colors", Object::Integer(p.colors as i64));
                parms.set("BitsPerComponent", Object::Integer(p.bits_per_component as i64));
                parms.set("Columns", Object::Integer(p.columns as i64));
                stream.dict.set("DecodeParms", Object::Dictionary(parms));
            }
            None => {
                stream.dict.remove(b"DecodeParms");
                stream.dict.remove(b"DP");
            }
        }
    }
    // A source /Decode array no longer matches the destination space.
    stream.dict.remove(b"Decode");
    stream.set_content(converted.data.clone());
    Ok(())
}

fn convert_form_xobject(
    doc: &mut Document,
    form_id: ObjectId,
    page_index: usize,
    ctx: &mut PageContext<'_>,
    outcome: &mut PageOutcome,
    visited_forms: &mut HashSet<ObjectId>,
) -> ConvertResult<()> {
    if !visited_forms.insert(form_id) {
        return Ok(());
    }

    // Nested resources: images and forms inside the form.
    let nested: Vec<(Vec<u8>, ObjectId)> = {
        let stream = doc.get_object(form_id)?.as_stream()?;
        match stream.dict.get(b"Resources") {
            Ok(Object::Dictionary(res)) => nested_xobjects(doc, res)?,
            Ok(Object::Reference(id)) => {
                let res = doc.get_object(*id)?.as_dict()?.clone();
                nested_xobjects(doc, &res)?
            }
            _ => Vec::new(),
        }
    };
    for (_, id) in nested {
        convert_xobject(doc, id, page_index, ctx, outcome, visited_forms)?;
    }

    // The form's own content bytes are a content stream.
    if ctx.shared.convert_content_streams {
        convert_content_stream(doc, form_id, page_index, ctx, outcome)?;
    }

    // Transparency group of the form follows the destination family.
    let dest_family = ctx.shared.dest_family;
    let stream = doc.get_object_mut(form_id)?.as_stream_mut()?;
    if let Ok(Object::Dictionary(group)) = stream.dict.get_mut(b"Group") {
        if group.has(b"CS") {
            group.set("CS", Object::Name(dest_family.device_name().into()));
        }
    }
    Ok(())
}

fn nested_xobjects(
    doc: &Document,
    resources: &Dictionary,
) -> ConvertResult<Vec<(Vec<u8>, ObjectId)>> {
    let mut out = Vec::new();
    if let Ok(xobjects) = resources.get(b"XObject") {
        let dict = match xobjects {
            Object::Reference(id) => doc.get_object(*id)?.as_dict()?.clone(),
            Object::Dictionary(d) => d.clone(),
            _ => return Ok(out),
        };
        for (name, value) in dict.iter() {
            if let Ok(id) = value.as_reference() {
                out.push((name.clone(), id));
            }
        }
    }
    Ok(out)
}

fn convert_content_stream(
    doc: &mut Document,
    stream_id: ObjectId,
    page_index: usize,
    ctx: &mut PageContext<'_>,
    outcome: &mut PageOutcome,
) -> ConvertResult<()> {
    let (data, was_flate) = {
        let stream = doc.get_object(stream_id)?.as_stream()?;
        let filters: Vec<StreamFilter> = match stream.dict.get(b"Filter") {
            Ok(Object::Name(name)) => vec![StreamFilter::from_name(name)],
            Ok(Object::Array(items)) => items
                .iter()
                .filter_map(|o| match o {
                    Object::Name(n) => Some(StreamFilter::from_name(n)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        match filters.as_slice() {
            [] => (stream.content.clone(), false),
            [StreamFilter::Flate] => match stream.decompressed_content() {
                Ok(data) => (data, true),
                Err(e) => {
                    warn!("page {page_index}: cannot inflate content stream: {e}");
                    return Ok(());
                }
            },
            other => {
                warn!(
                    "page {page_index}: content stream filter {:?} unsupported; left untouched",
                    other
                );
                return Ok(());
            }
        }
    };

    let settings = ContentConvertSettings {
        sources: ContentSourceProfiles {
            gray: ctx.shared.source_gray.as_ref().map(|s| s.handle),
            rgb: ctx.shared.source_rgb.as_ref().map(|s| s.handle),
            cmyk: ctx.shared.source_cmyk.as_ref().map(|s| s.handle),
        },
        destination: ctx.shared.dest_handle,
        destination_family: ctx.shared.dest_family,
        intermediates: ctx.shared.intermediates.clone(),
        intent: ctx.shared.intent,
        black_point_compensation: ctx.shared.black_point_compensation,
        adaptive_bpc_clamping: ctx.shared.adaptive_bpc_clamping,
    };
    let mut converter = ContentConverter::new(ctx.buffer, settings);
    let rewritten = converter.convert_content(&data).on_page(page_index)?;
    outcome.rewritten_ops += rewritten.rewritten_ops;

    if rewritten.rewritten_ops > 0 {
        let stream = doc.get_object_mut(stream_id)?.as_stream_mut()?;
        if was_flate {
            stream.set_content(deflate(&rewritten.bytes));
        } else {
            stream.set_content(rewritten.bytes);
        }
    }
    Ok(())
}

fn register_destination_space(
    doc: &mut Document,
    location: ResourcesLocation,
    dest_ref: ObjectId,
) -> ConvertResult<()> {
    with_resources(doc, location, |resources| {
        let entry = icc_based_array(dest_ref);
        match resources.get_mut(b"ColorSpace") {
            Ok(Object::Dictionary(spaces)) => {
                spaces.set(DEST_COLOR_SPACE_RESOURCE, entry);
            }
            _ => {
                let mut spaces = Dictionary::new();
                spaces.set(DEST_COLOR_SPACE_RESOURCE, entry);
                resources.set("ColorSpace", Object::Dictionary(spaces));
            }
        }
    })
}

/// Rewrites named color spaces in the page's ColorSpace resource dict:
/// device and calibrated families become the destination ICCBased space,
/// indexed palettes are recolored, Default* entries point at the
/// destination. Spot spaces stay.
fn rewrite_colorspace_resources(
    doc: &mut Document,
    location: ResourcesLocation,
    page_index: usize,
    ctx: &mut PageContext<'_>,
    _outcome: &mut PageOutcome,
) -> ConvertResult<()> {
    let resources = read_resources(doc, location)?;
    let spaces = match resources.get(b"ColorSpace") {
        Ok(Object::Dictionary(d)) => d.clone(),
        Ok(Object::Reference(id)) => match doc.get_object(*id) {
            Ok(obj) => obj.as_dict()?.clone(),
            Err(_) => return Ok(()),
        },
        _ => return Ok(()),
    };

    let mut replacements: Vec<(Vec<u8>, Object)> = Vec::new();
    for (name, value) in spaces.iter() {
        if name == DEST_COLOR_SPACE_RESOURCE {
            continue;
        }
        if name.starts_with(b"Default") {
            replacements.push((name.clone(), icc_based_array(ctx.shared.dest_ref)));
            continue;
        }
        let descriptor = match parse_color_space(doc, value) {
            Ok(d) => d,
            Err(e) => {
                debug!("page {page_index}: unparseable color space /{}: {e}",
                    String::from_utf8_lossy(name));
                continue;
            }
        };
        if !descriptor.needs_rewrite() {
            continue;
        }
        match &descriptor {
            ColorSpaceDescriptor::Indexed { base, hival, lookup } if base.needs_rewrite() => {
                let palette = match lookup {
                    IndexedLookup::Inline(bytes) => bytes.clone(),
                    IndexedLookup::Stream(id) => {
                        let stream = doc.get_object(*id)?.as_stream()?;
                        stream
                            .decompressed_content()
                            .unwrap_or_else(|_| stream.content.clone())
                    }
                };
                let Some(source) = resolve_source(doc, &descriptor, ctx)? else {
                    continue;
                };
                let mut opts =
                    BufferConvertOptions::new(source.handle, ctx.shared.dest_handle);
                opts.intermediates = ctx.shared.intermediates.clone();
                opts.input_bits_per_component = Some(8);
                opts.output_bits_per_component = Some(8);
                opts.intent = ctx.shared.intent;
                opts.black_point_compensation = ctx.shared.black_point_compensation;
                opts.adaptive_bpc_clamping = ctx.shared.adaptive_bpc_clamping;
                opts.category = ConversionCategory::IndexedPalette;
                let converted = ctx.buffer.convert(&palette, &opts).on_page(page_index)?;
                replacements.push((
                    name.clone(),
                    Object::Array(vec![
                        Object::Name(b"Indexed".to_vec()),
                        icc_based_array(ctx.shared.dest_ref),
                        Object::Integer(*hival),
                        Object::String(converted.bytes, StringFormat::Hexadecimal),
                    ]),
                ));
            }
            _ => {
                replacements.push((name.clone(), icc_based_array(ctx.shared.dest_ref)));
            }
        }
    }

    if replacements.is_empty() {
        return Ok(());
    }

    // Apply to wherever the ColorSpace dict actually lives.
    let spaces_ref = {
        let resources = read_resources(doc, location)?;
        match resources.get(b"ColorSpace") {
            Ok(Object::Reference(id)) => Some(*id),
            _ => None,
        }
    };
    match spaces_ref {
        Some(id) => {
            let dict = doc.get_object_mut(id)?.as_dict_mut()?;
            for (name, value) in replacements {
                dict.set(name, value);
            }
        }
        None => {
            with_resources(doc, location, |resources| {
                if let Ok(Object::Dictionary(dict)) = resources.get_mut(b"ColorSpace") {
                    for (name, value) in replacements {
                        dict.set(name, value);
                    }
                }
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::LogContext;
    use crate::document::{ConvertShared, ResolvedSource};
    use lopdf::dictionary;
    use std::sync::Arc;

    /// Builds a document with one RGB image page and returns
    /// (doc, page_id, image_id, shared, buffer).
    fn fixture() -> (Document, ObjectId, ObjectId, ConvertShared, BufferConverter) {
        let mut buffer = BufferConverter::new(LogContext::default());
        let srgb = buffer.builtin(BuiltinProfile::SRgb).unwrap();
        let srgb_bytes = buffer.engine().profile_bytes(srgb).unwrap();

        let mut doc = Document::with_version("1.5");
        let dest_ref = doc.add_object(Object::Stream(lopdf::Stream::new(
            dictionary! { "N" => 3, "Alternate" => Object::Name(b"DeviceRGB".to_vec()) },
            srgb_bytes.clone(),
        )));

        let image = lopdf::Stream::new(
            dictionary! {
                "Type" => Object::Name(b"XObject".to_vec()),
                "Subtype" => Object::Name(b"Image".to_vec()),
                "Width" => 2,
                "Height" => 1,
                "BitsPerComponent" => 8,
                "ColorSpace" => Object::Name(b"DeviceRGB".to_vec()),
            },
            vec![255, 0, 0, 0, 0, 255],
        );
        let image_id = doc.add_object(Object::Stream(image));

        let content = lopdf::Stream::new(
            Dictionary::new(),
            b"0.5 g 0 0 10 10 re f".to_vec(),
        );
        let content_id = doc.add_object(Object::Stream(content));

        let page_id = doc.add_object(Object::Dictionary(dictionary! {
            "Type" => Object::Name(b"Page".to_vec()),
            "Resources" => Object::Dictionary(dictionary! {
                "XObject" => Object::Dictionary(dictionary! {
                    "Im0" => Object::Reference(image_id),
                }),
            }),
            "Contents" => Object::Reference(content_id),
            "MediaBox" => Object::Array(vec![
                Object::Integer(0), Object::Integer(0),
                Object::Integer(595), Object::Integer(842),
            ]),
        }));

        let gray = buffer.builtin(BuiltinProfile::SGray).unwrap();
        let shared = ConvertShared {
            dest_ref,
            dest_handle: srgb,
            dest_family: PixelColor::Rgb,
            dest_bytes: Arc::new(srgb_bytes),
            intermediates: Vec::new(),
            intermediate_bytes: Vec::new(),
            source_gray: Some(ResolvedSource {
                spec: ProfileSpec::Builtin(BuiltinProfile::SGray),
                handle: gray,
            }),
            source_rgb: Some(ResolvedSource {
                spec: ProfileSpec::Builtin(BuiltinProfile::SRgb),
                handle: srgb,
            }),
            source_cmyk: None,
            intent: crate::engine::RenderingIntent::RelativeColorimetric,
            black_point_compensation: false,
            adaptive_bpc_clamping: false,
            output_bits_per_component: None,
            convert_images: true,
            convert_content_streams: true,
        };
        (doc, page_id, image_id, shared, buffer)
    }

    #[test]
    fn page_conversion_rewrites_image_and_content() {
        let (mut doc, page_id, image_id, shared, mut buffer) = fixture();
        let mut pending = HashMap::new();
        let mut converted = HashSet::new();
        let mut opened = HashMap::new();
        let cancel = CancelToken::new();
        let mut ctx = PageContext {
            shared: &shared,
            buffer: &mut buffer,
            pool: None,
            pending: &mut pending,
            converted_streams: &mut converted,
            opened_icc: &mut opened,
            cancel: &cancel,
        };

        let outcome = convert_page(&mut doc, page_id, 0, &mut ctx).unwrap();
        assert_eq!(outcome.images_converted, 1);
        assert_eq!(outcome.rewritten_ops, 1);

        // Image descriptor now references the destination profile.
        let stream = doc.get_object(image_id).unwrap().as_stream().unwrap();
        let cs = stream.dict.get(b"ColorSpace").unwrap().as_array().unwrap();
        assert_eq!(cs[0], Object::Name(b"ICCBased".to_vec()));
        assert_eq!(cs[1], Object::Reference(shared.dest_ref));

        // Destination space registered in resources.
        let page = doc.get_object(page_id).unwrap().as_dict().unwrap();
        let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
        let spaces = resources.get(b"ColorSpace").unwrap().as_dict().unwrap();
        assert!(spaces.has(DEST_COLOR_SPACE_RESOURCE));
    }

    #[test]
    fn shared_image_objects_convert_once() {
        let (mut doc, page_id, image_id, shared, mut buffer) = fixture();
        let mut pending = HashMap::new();
        let mut converted = HashSet::new();
        let mut opened = HashMap::new();
        let cancel = CancelToken::new();

        for pass in 0..2 {
            let mut ctx = PageContext {
                shared: &shared,
                buffer: &mut buffer,
                pool: None,
                pending: &mut pending,
                converted_streams: &mut converted,
                opened_icc: &mut opened,
                cancel: &cancel,
            };
            let outcome = convert_page(&mut doc, page_id, pass, &mut ctx).unwrap();
            let expected = usize::from(pass == 0);
            assert_eq!(outcome.images_converted, expected);
        }
        assert!(converted.contains(&image_id));
    }

    #[test]
    fn cancellation_stops_before_work() {
        let (mut doc, page_id, _, shared, mut buffer) = fixture();
        let mut pending = HashMap::new();
        let mut converted = HashSet::new();
        let mut opened = HashMap::new();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut ctx = PageContext {
            shared: &shared,
            buffer: &mut buffer,
            pool: None,
            pending: &mut pending,
            converted_streams: &mut converted,
            opened_icc: &mut opened,
            cancel: &cancel,
        };
        let err = convert_page(&mut doc, page_id, 0, &mut ctx).unwrap_err();
        assert!(err.is_canceled());
    }
}
