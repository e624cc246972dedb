//! Document-level conversion: page fan-out, worker coordination, and the
//! structural post-pass (output intent, decalibration, blending spaces).
//!
//! A converter instance is configured once, then run against a document
//! either in one shot ([`DocumentConverter::convert_color`]) or in stages
//! (`begin` / `drain` / `finish`) so the scheduler can keep several
//! converters' image tasks in flight on one worker pool while remaining the
//! single writer of the document.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use lopdf::{Dictionary, Document, Object, ObjectId};

use crate::buffer::BufferConverter;
use crate::diag::LogContext;
use crate::engine::{BuiltinProfile, PixelColor, ProfileHandle, RenderingIntent};
use crate::errors::{ConvertError, ConvertResult, ResultExt};
use crate::page::{convert_page, write_back_image, PageContext, PendingImage};
use crate::utils::CancelToken;
use crate::worker::{ProfileSpec, SharedProfiles, WorkerPool};

/// A source profile resolved on the main engine: the profile spec travels
/// to workers, the handle serves inline conversions.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub spec: ProfileSpec,
    pub handle: ProfileHandle,
}

/// Everything page conversions read. Built by `begin`, immutable
/// afterwards.
pub struct ConvertShared {
    pub dest_ref: ObjectId,
    pub dest_handle: ProfileHandle,
    pub dest_family: PixelColor,
    pub dest_bytes: Arc<Vec<u8>>,
    pub intermediates: Vec<ProfileHandle>,
    pub intermediate_bytes: Vec<Arc<Vec<u8>>>,
    pub source_gray: Option<ResolvedSource>,
    pub source_rgb: Option<ResolvedSource>,
    pub source_cmyk: Option<ResolvedSource>,
    pub intent: RenderingIntent,
    pub black_point_compensation: bool,
    pub adaptive_bpc_clamping: bool,
    pub output_bits_per_component: Option<u8>,
    pub convert_images: bool,
    pub convert_content_streams: bool,
}

/// Every knob, spelled out.
#[derive(Debug, Clone)]
pub struct DocumentConvertOptions {
    pub destination_profile: Arc<Vec<u8>>,
    /// Expected family of the destination profile; mismatch is an error.
    pub destination_color_space: Option<PixelColor>,
    pub intermediate_profiles: Vec<Arc<Vec<u8>>>,
    pub source_gray: Option<ProfileSpec>,
    pub source_rgb: Option<ProfileSpec>,
    pub source_cmyk: Option<ProfileSpec>,
    pub rendering_intent: RenderingIntent,
    pub bpc_enabled: bool,
    pub use_adaptive_bpc_clamping: bool,
    pub output_bits_per_component: Option<u8>,
    pub convert_images: bool,
    pub convert_content_streams: bool,
    pub use_workers: bool,
    /// 0-based indices into the document's page order; `None` converts all.
    pub pages: Option<Vec<usize>>,
    pub inter_conversion_delay: Option<Duration>,
    pub verbose: bool,
    /// Reuse an ICC stream already embedded by the scheduler instead of
    /// embedding another copy.
    pub existing_dest_ref: Option<ObjectId>,
    /// Cleared by the scheduler for all but the first subset converter of a
    /// chain so the pool sees exactly one broadcast per chain.
    pub broadcast_shared: bool,
}

impl DocumentConvertOptions {
    pub fn new(destination_profile: Arc<Vec<u8>>) -> Self {
        DocumentConvertOptions {
            destination_profile,
            destination_color_space: None,
            intermediate_profiles: Vec::new(),
            source_gray: None,
            source_rgb: None,
            source_cmyk: None,
            rendering_intent: RenderingIntent::default(),
            bpc_enabled: false,
            use_adaptive_bpc_clamping: false,
            output_bits_per_component: None,
            convert_images: true,
            convert_content_streams: true,
            use_workers: false,
            pages: None,
            inter_conversion_delay: None,
            verbose: false,
            existing_dest_ref: None,
            broadcast_shared: true,
        }
    }
}

/// What [`DocumentConverter::apply_reply`] did with a worker reply.
pub enum ReplyDisposition {
    /// Written back (or counted as skipped/dropped); one task finished.
    Applied,
    /// Crashed task resubmitted to another worker; still in flight.
    Requeued,
    /// The task belongs to a different converter.
    NotMine(crate::worker::WorkerReply),
}

/// Counters aggregated over one document run.
#[derive(Debug, Default, Clone)]
pub struct DocumentOutcome {
    pub pages_converted: usize,
    pub images_converted: usize,
    pub images_skipped: usize,
    pub rewritten_ops: usize,
}

pub struct DocumentConverter<'p> {
    options: DocumentConvertOptions,
    pool: Option<&'p WorkerPool>,
    buffer: BufferConverter,
    ctx: LogContext,
    cancel: CancelToken,
    shared: Option<ConvertShared>,
    pending: HashMap<u64, PendingImage>,
    page_pending: HashMap<usize, usize>,
    converted_streams: HashSet<ObjectId>,
    opened_icc: HashMap<ObjectId, ProfileHandle>,
    retried: HashSet<u64>,
    outcome: DocumentOutcome,
}

impl<'p> DocumentConverter<'p> {
    pub fn new(
        options: DocumentConvertOptions,
        pool: Option<&'p WorkerPool>,
        cancel: CancelToken,
        ctx: LogContext,
    ) -> Self {
        let pool = if options.use_workers { pool } else { None };
        DocumentConverter {
            options,
            pool,
            buffer: BufferConverter::new(ctx.clone()),
            ctx,
            cancel,
            shared: None,
            pending: HashMap::new(),
            page_pending: HashMap::new(),
            converted_streams: HashSet::new(),
            opened_icc: HashMap::new(),
            retried: HashSet::new(),
            outcome: DocumentOutcome::default(),
        }
    }

    pub fn shared(&self) -> Option<&ConvertShared> {
        self.shared.as_ref()
    }

    /// One-shot conversion: pages, worker drain, structural post-pass.
    pub fn convert_color(
        &mut self,
        doc: &mut Document,
        on_page_converted: &mut dyn FnMut(usize),
    ) -> ConvertResult<DocumentOutcome> {
        self.begin(doc, on_page_converted)?;
        self.drain(doc, on_page_converted)?;
        self.finish(doc)?;
        Ok(self.outcome.clone())
    }

    /// Resolves profiles, broadcasts shared config, and walks the selected
    /// pages (queueing image tasks when a pool is attached).
    pub fn begin(
        &mut self,
        doc: &mut Document,
        on_page_converted: &mut dyn FnMut(usize),
    ) -> ConvertResult<()> {
        self.cancel.check()?;
        let shared = self.resolve_shared(doc)?;

        if let (Some(pool), true) = (self.pool, self.options.broadcast_shared) {
            pool.broadcast_shared(SharedProfiles {
                destination: shared.dest_bytes.clone(),
                intermediates: shared.intermediate_bytes.clone(),
                intent: shared.intent,
                black_point_compensation: shared.black_point_compensation,
                adaptive_bpc_clamping: shared.adaptive_bpc_clamping,
                output_bits_per_component: shared.output_bits_per_component,
            })?;
        }
        self.shared = Some(shared);

        let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
        for (index, page_id) in page_ids.iter().enumerate() {
            if let Some(filter) = &self.options.pages {
                if !filter.contains(&index) {
                    continue;
                }
            }
            self.cancel.check()?;

            let shared = self.shared.as_ref().expect("shared config resolved above");
            let mut page_ctx = PageContext {
                shared,
                buffer: &mut self.buffer,
                pool: self.pool,
                pending: &mut self.pending,
                converted_streams: &mut self.converted_streams,
                opened_icc: &mut self.opened_icc,
                cancel: &self.cancel,
            };
            let page_outcome = convert_page(doc, *page_id, index, &mut page_ctx)?;

            self.outcome.images_converted += page_outcome.images_converted;
            self.outcome.images_skipped += page_outcome.images_skipped;
            self.outcome.rewritten_ops += page_outcome.rewritten_ops;

            if page_outcome.tasks_submitted > 0 {
                self.page_pending.insert(index, page_outcome.tasks_submitted);
            } else {
                self.outcome.pages_converted += 1;
                on_page_converted(index);
            }

            if let Some(delay) = self.options.inter_conversion_delay {
                std::thread::sleep(delay);
            }
        }
        Ok(())
    }

    /// Number of image tasks still in flight.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Collects worker replies and writes images back. Returns once no
    /// tasks of this converter remain in flight. When several converters
    /// share the pool, use [`DocumentConverter::apply_reply`] from the
    /// scheduler instead, so replies reach their owner.
    pub fn drain(
        &mut self,
        doc: &mut Document,
        on_page_converted: &mut dyn FnMut(usize),
    ) -> ConvertResult<()> {
        let Some(pool) = self.pool else {
            debug_assert!(self.pending.is_empty());
            return Ok(());
        };
        while !self.pending.is_empty() {
            let reply = pool.recv_reply()?;
            if let ReplyDisposition::NotMine(reply) =
                self.apply_reply(doc, reply, on_page_converted)?
            {
                warn!(
                    "[{}] dropping stale reply for unknown task {}",
                    self.ctx.prefix(),
                    reply.task_id
                );
            }
        }
        self.cancel.check()
    }

    /// Routes one worker reply. Replies for other converters come back as
    /// `NotMine`; crashed tasks are retried once on another worker.
    pub fn apply_reply(
        &mut self,
        doc: &mut Document,
        reply: crate::worker::WorkerReply,
        on_page_converted: &mut dyn FnMut(usize),
    ) -> ConvertResult<ReplyDisposition> {
        let Some(pool) = self.pool else {
            return Ok(ReplyDisposition::NotMine(reply));
        };
        let dest_ref = self
            .shared
            .as_ref()
            .map(|s| s.dest_ref)
            .ok_or_else(|| ConvertError::InvalidArgument("reply before begin".to_string()))?;
        if !self.pending.contains_key(&reply.task_id) {
            return Ok(ReplyDisposition::NotMine(reply));
        }
        let info = self.pending.remove(&reply.task_id).expect("checked above");

        match reply.result {
            Ok(converted) => {
                write_back_image(doc, info.stream, &converted, dest_ref)
                    .on_page(info.page_index)?;
                self.outcome.images_converted += 1;
            }
            Err(error) => match error.kind() {
                ConvertError::WorkerCrashed { .. } => {
                    if let Some(task) = reply.requeue {
                        if self.retried.insert(reply.task_id) {
                            warn!(
                                "[{}] retrying task {} away from worker {}",
                                self.ctx.prefix(),
                                reply.task_id,
                                reply.worker
                            );
                            self.pending.insert(reply.task_id, info);
                            pool.resubmit_excluding(task, reply.worker);
                            return Ok(ReplyDisposition::Requeued);
                        }
                    }
                    return Err(error);
                }
                ConvertError::Canceled => {}
                _ if error.is_skippable() => {
                    warn!(
                        "[{}] page {}: image skipped: {error}",
                        self.ctx.prefix(),
                        info.page_index
                    );
                    self.outcome.images_skipped += 1;
                }
                _ => {
                    return Err(ConvertError::OnPage {
                        page: info.page_index,
                        source: Box::new(error),
                    });
                }
            },
        }

        if let Some(left) = self.page_pending.get_mut(&info.page_index) {
            *left -= 1;
            if *left == 0 {
                self.page_pending.remove(&info.page_index);
                self.outcome.pages_converted += 1;
                on_page_converted(info.page_index);
            }
        }
        Ok(ReplyDisposition::Applied)
    }

    /// Structural post-pass and resource disposal.
    pub fn finish(&mut self, doc: &mut Document) -> ConvertResult<()> {
        self.cancel.check()?;
        let shared = self
            .shared
            .as_ref()
            .ok_or_else(|| ConvertError::InvalidArgument("finish before begin".to_string()))?;

        post_process(doc, shared.dest_ref, shared.dest_family, self.profile_identifier(shared))?;

        self.buffer.dispose();
        Ok(())
    }

    /// Releases transforms without the structural post-pass. Used by the
    /// scheduler, which post-processes once after all chains.
    pub fn dispose(&mut self) {
        self.buffer.dispose();
    }

    /// Collected statistics so far.
    pub fn outcome(&self) -> &DocumentOutcome {
        &self.outcome
    }

    fn profile_identifier(&self, shared: &ConvertShared) -> String {
        self.buffer
            .engine()
            .profile_description(shared.dest_handle)
            .unwrap_or_else(|| "Custom output condition".to_string())
    }

    fn resolve_shared(&mut self, doc: &mut Document) -> ConvertResult<ConvertShared> {
        let dest_bytes = self.options.destination_profile.clone();
        let dest_handle = self.buffer.engine_mut().open_profile(&dest_bytes)?;
        let dest_family = self.buffer.engine().profile_color_family(dest_handle)?;
        if let Some(expected) = self.options.destination_color_space {
            if expected != dest_family {
                return Err(ConvertError::InvalidArgument(format!(
                    "destination profile is {:?} but {:?} was requested",
                    dest_family, expected
                )));
            }
        }

        let dest_ref = match self.options.existing_dest_ref {
            Some(id) => id,
            None => embed_destination_profile(doc, &dest_bytes, dest_family),
        };

        let mut intermediates = Vec::new();
        for bytes in &self.options.intermediate_profiles {
            intermediates.push(self.buffer.engine_mut().open_profile(bytes)?);
        }

        let source_gray = self.resolve_source(
            self.options.source_gray.clone(),
            Some(BuiltinProfile::SGray),
        )?;
        let source_rgb = self.resolve_source(
            self.options.source_rgb.clone(),
            Some(BuiltinProfile::SRgb),
        )?;
        let source_cmyk = self.resolve_source(self.options.source_cmyk.clone(), None)?;

        if self.options.verbose {
            log::info!(
                "[{}] destination {:?}, {} intermediates, workers: {}",
                self.ctx.prefix(),
                dest_family,
                intermediates.len(),
                self.pool.is_some()
            );
        } else {
            debug!(
                "[{}] destination {:?}, {} intermediates, workers: {}",
                self.ctx.prefix(),
                dest_family,
                intermediates.len(),
                self.pool.is_some()
            );
        }

        Ok(ConvertShared {
            dest_ref,
            dest_handle,
            dest_family,
            dest_bytes,
            intermediates,
            intermediate_bytes: self.options.intermediate_profiles.clone(),
            source_gray,
            source_rgb,
            source_cmyk,
            intent: self.options.rendering_intent,
            black_point_compensation: self.options.bpc_enabled,
            adaptive_bpc_clamping: self.options.use_adaptive_bpc_clamping,
            output_bits_per_component: self.options.output_bits_per_component,
            convert_images: self.options.convert_images,
            convert_content_streams: self.options.convert_content_streams,
        })
    }

    fn resolve_source(
        &mut self,
        spec: Option<ProfileSpec>,
        fallback: Option<BuiltinProfile>,
    ) -> ConvertResult<Option<ResolvedSource>> {
        let spec = match spec {
            Some(spec) => spec,
            None => match fallback {
                Some(builtin) => ProfileSpec::Builtin(builtin),
                None => return Ok(None),
            },
        };
        let handle = match &spec {
            ProfileSpec::Builtin(kind) => self.buffer.builtin(*kind)?,
            ProfileSpec::Bytes(bytes) => self.buffer.engine_mut().open_profile(bytes)?,
        };
        Ok(Some(ResolvedSource { spec, handle }))
    }
}

/// Embeds the destination ICC bytes as the single profile stream every
/// rewritten descriptor references.
pub fn embed_destination_profile(
    doc: &mut Document,
    icc: &[u8],
    family: PixelColor,
) -> ObjectId {
    let mut dict = Dictionary::new();
    dict.set("N", Object::Integer(family.channels() as i64));
    if family != PixelColor::Lab {
        dict.set("Alternate", Object::Name(family.device_name().into()));
    }
    doc.add_object(Object::Stream(lopdf::Stream::new(dict, icc.to_vec())))
}

/// Document-level structural rewrite: decalibration, blending spaces and
/// the output intent. Runs once per output document.
pub(crate) fn post_process(
    doc: &mut Document,
    dest_ref: ObjectId,
    dest_family: PixelColor,
    identifier: String,
) -> ConvertResult<()> {
    decalibrate_document(doc, dest_ref);
    rewrite_blending_spaces(doc, dest_family)?;
    install_output_intent(doc, dest_ref, identifier)
}

/// Replaces every `CalGray`/`CalRGB`/`Lab` color-space array in the object
/// graph with the destination ICCBased array. The calibration parameters
/// (`WhitePoint`, `Gamma`, `Matrix`, `Range`) vanish with the array.
fn decalibrate_document(doc: &mut Document, dest_ref: ObjectId) {
    let ids: Vec<ObjectId> = doc.objects.keys().copied().collect();
    for id in ids {
        if id == dest_ref {
            continue;
        }
        if let Ok(object) = doc.get_object_mut(id) {
            decalibrate_object(object, dest_ref);
        }
    }
}

fn is_calibrated_array(items: &[Object]) -> bool {
    matches!(
        items.first(),
        Some(Object::Name(name)) if name == b"CalGray" || name == b"CalRGB" || name == b"Lab"
    )
}

fn decalibrate_object(object: &mut Object, dest_ref: ObjectId) {
    match object {
        Object::Array(items) => {
            if is_calibrated_array(items) {
                *object = crate::color_space::icc_based_array(dest_ref);
                return;
            }
            for item in items {
                decalibrate_object(item, dest_ref);
            }
        }
        Object::Dictionary(dict) => {
            for (_, value) in dict.iter_mut() {
                decalibrate_object(value, dest_ref);
            }
        }
        Object::Stream(stream) => {
            for (_, value) in stream.dict.iter_mut() {
                decalibrate_object(value, dest_ref);
            }
        }
        _ => {}
    }
}

/// Sets the transparency blending space of every page group to the device
/// space matching the destination family.
fn rewrite_blending_spaces(doc: &mut Document, family: PixelColor) -> ConvertResult<()> {
    let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
    for page_id in page_ids {
        let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
        if let Ok(Object::Dictionary(group)) = page.get_mut(b"Group") {
            group.set("CS", Object::Name(family.device_name().into()));
        }
    }
    Ok(())
}

/// Installs the single PDF/X output intent referencing the embedded
/// destination profile.
fn install_output_intent(
    doc: &mut Document,
    dest_ref: ObjectId,
    identifier: String,
) -> ConvertResult<()> {
    let catalog_id = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(ConvertError::Pdf)?;

    let output_intent = Dictionary::from_iter(vec![
        ("Type", Object::Name(b"OutputIntent".to_vec())),
        ("S", Object::Name(b"GTS_PDFX".to_vec())),
        (
            "OutputConditionIdentifier",
            Object::String(identifier.clone().into_bytes(), lopdf::StringFormat::Literal),
        ),
        (
            "Info",
            Object::String(identifier.into_bytes(), lopdf::StringFormat::Literal),
        ),
        (
            "RegistryName",
            Object::String(b"http://www.color.org".to_vec(), lopdf::StringFormat::Literal),
        ),
        ("DestOutputProfile", Object::Reference(dest_ref)),
    ]);

    let catalog = doc.get_object_mut(catalog_id)?.as_dict_mut()?;
    catalog.set(
        "OutputIntents",
        Object::Array(vec![Object::Dictionary(output_intent)]),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lopdf::dictionary;

    fn srgb_bytes() -> Arc<Vec<u8>> {
        let mut engine = crate::engine::ColorEngine::new();
        let srgb = engine.builtin_profile(BuiltinProfile::SRgb).unwrap();
        Arc::new(engine.profile_bytes(srgb).unwrap())
    }

    /// Two-page document; every page has one RGB image and a gray fill.
    fn fixture(pages: usize) -> (Document, Vec<ObjectId>) {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let mut kids = Vec::new();
        let mut image_ids = Vec::new();
        for _ in 0..pages {
            let image_id = doc.add_object(Object::Stream(lopdf::Stream::new(
                dictionary! {
                    "Type" => Object::Name(b"XObject".to_vec()),
                    "Subtype" => Object::Name(b"Image".to_vec()),
                    "Width" => 1,
                    "Height" => 1,
                    "BitsPerComponent" => 8,
                    "ColorSpace" => Object::Name(b"DeviceRGB".to_vec()),
                },
                vec![200, 100, 50],
            )));
            image_ids.push(image_id);
            let content_id = doc.add_object(Object::Stream(lopdf::Stream::new(
                Dictionary::new(),
                b"0.25 g 0 0 5 5 re f".to_vec(),
            )));
            let page_id = doc.add_object(Object::Dictionary(dictionary! {
                "Type" => Object::Name(b"Page".to_vec()),
                "Parent" => Object::Reference(pages_id),
                "Resources" => Object::Dictionary(dictionary! {
                    "XObject" => Object::Dictionary(dictionary! {
                        "Im0" => Object::Reference(image_id),
                    }),
                }),
                "Contents" => Object::Reference(content_id),
                "Group" => Object::Dictionary(dictionary! {
                    "S" => Object::Name(b"Transparency".to_vec()),
                    "CS" => Object::Name(b"DeviceRGB".to_vec()),
                }),
                "MediaBox" => Object::Array(vec![
                    Object::Integer(0), Object::Integer(0),
                    Object::Integer(100), Object::Integer(100),
                ]),
            }));
            kids.push(Object::Reference(page_id));
        }

        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => Object::Name(b"Pages".to_vec()),
                "Count" => Object::Integer(pages as i64),
                "Kids" => Object::Array(kids),
            }),
        );
        let catalog_id = doc.add_object(Object::Dictionary(dictionary! {
            "Type" => Object::Name(b"Catalog".to_vec()),
            "Pages" => Object::Reference(pages_id),
        }));
        doc.trailer.set("Root", Object::Reference(catalog_id));
        (doc, image_ids)
    }

    #[test]
    fn converts_whole_document_and_installs_output_intent() {
        let (mut doc, image_ids) = fixture(2);
        let mut converter = DocumentConverter::new(
            DocumentConvertOptions::new(srgb_bytes()),
            None,
            CancelToken::new(),
            LogContext::default(),
        );
        let mut seen_pages = Vec::new();
        let outcome = converter
            .convert_color(&mut doc, &mut |page| seen_pages.push(page))
            .unwrap();

        assert_eq!(outcome.pages_converted, 2);
        assert_eq!(outcome.images_converted, 2);
        assert_eq!(seen_pages, vec![0, 1]);

        for image_id in image_ids {
            let stream = doc.get_object(image_id).unwrap().as_stream().unwrap();
            let cs = stream.dict.get(b"ColorSpace").unwrap().as_array().unwrap();
            assert_eq!(cs[0], Object::Name(b"ICCBased".to_vec()));
        }

        let catalog_id = doc.trailer.get(b"Root").unwrap().as_reference().unwrap();
        let catalog = doc.get_object(catalog_id).unwrap().as_dict().unwrap();
        let intents = catalog.get(b"OutputIntents").unwrap().as_array().unwrap();
        assert_eq!(intents.len(), 1);
        let intent = intents[0].as_dict().unwrap();
        assert_eq!(
            intent.get(b"S").unwrap(),
            &Object::Name(b"GTS_PDFX".to_vec())
        );
        assert!(intent.has(b"DestOutputProfile"));
    }

    #[test]
    fn page_filter_leaves_other_pages_untouched() {
        let (mut doc, image_ids) = fixture(3);
        let mut options = DocumentConvertOptions::new(srgb_bytes());
        options.pages = Some(vec![1]);
        let mut converter = DocumentConverter::new(
            options,
            None,
            CancelToken::new(),
            LogContext::default(),
        );
        converter.convert_color(&mut doc, &mut |_| {}).unwrap();

        for (index, image_id) in image_ids.iter().enumerate() {
            let stream = doc.get_object(*image_id).unwrap().as_stream().unwrap();
            let cs = stream.dict.get(b"ColorSpace").unwrap();
            if index == 1 {
                assert!(cs.as_array().is_ok(), "filtered page got converted");
            } else {
                assert_eq!(cs, &Object::Name(b"DeviceRGB".to_vec()));
            }
        }
    }

    #[test]
    fn blending_space_follows_destination_family() {
        let (mut doc, _) = fixture(1);
        let mut converter = DocumentConverter::new(
            DocumentConvertOptions::new(srgb_bytes()),
            None,
            CancelToken::new(),
            LogContext::default(),
        );
        converter.convert_color(&mut doc, &mut |_| {}).unwrap();

        let page_id = *doc.get_pages().values().next().unwrap();
        let page = doc.get_object(page_id).unwrap().as_dict().unwrap();
        let group = page.get(b"Group").unwrap().as_dict().unwrap();
        assert_eq!(
            group.get(b"CS").unwrap(),
            &Object::Name(b"DeviceRGB".to_vec())
        );
    }

    #[test]
    fn calibrated_spaces_are_rewritten() {
        let (mut doc, _) = fixture(1);
        let cal_id = doc.add_object(Object::Array(vec![
            Object::Name(b"CalRGB".to_vec()),
            Object::Dictionary(dictionary! {
                "WhitePoint" => Object::Array(vec![
                    Object::Real(0.9505), Object::Real(1.0), Object::Real(1.089),
                ]),
                "Gamma" => Object::Array(vec![
                    Object::Real(2.2), Object::Real(2.2), Object::Real(2.2),
                ]),
            }),
        ]));

        let mut converter = DocumentConverter::new(
            DocumentConvertOptions::new(srgb_bytes()),
            None,
            CancelToken::new(),
            LogContext::default(),
        );
        converter.convert_color(&mut doc, &mut |_| {}).unwrap();

        let rewritten = doc.get_object(cal_id).unwrap().as_array().unwrap();
        assert_eq!(rewritten[0], Object::Name(b"ICCBased".to_vec()));
        assert!(matches!(rewritten[1], Object::Reference(_)));
    }

    #[test]
    fn cancellation_surfaces_before_work() {
        let (mut doc, _) = fixture(1);
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut converter = DocumentConverter::new(
            DocumentConvertOptions::new(srgb_bytes()),
            None,
            cancel,
            LogContext::default(),
        );
        let err = converter.convert_color(&mut doc, &mut |_| {}).unwrap_err();
        assert!(err.is_canceled());
    }

    #[test]
    fn destination_family_mismatch_is_invalid() {
        let (mut doc, _) = fixture(1);
        let mut options = DocumentConvertOptions::new(srgb_bytes());
        options.destination_color_space = Some(PixelColor::Cmyk);
        let mut converter = DocumentConverter::new(
            options,
            None,
            CancelToken::new(),
            LogContext::default(),
        );
        let err = converter.convert_color(&mut doc, &mut |_| {}).unwrap_err();
        assert!(matches!(err.kind(), ConvertError::InvalidArgument(_)));
    }
}
