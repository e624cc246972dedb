//! The top-level entry point: recolor the asset library and assemble the
//! press-ready output document.
//!
//! `generate` drives the whole run: load the library, resolve profiles,
//! pre-convert all chains, optionally render and append slug pages through
//! the external renderer, stamp document info, attach the manifest as an
//! embedded file, and serialize. Progress is reported per stage through the
//! caller's callbacks.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use lopdf::{Dictionary, Document, Object, ObjectId, StringFormat};
use time::OffsetDateTime;

use crate::diag::SpanTree;
use crate::engine::RenderingIntent;
use crate::errors::{ConvertError, ConvertResult};
use crate::fetch::{AssetFetcher, CachingFetcher, ProfileResolver};
use crate::manifest::Manifest;
use crate::scheduler::{pre_convert, PageMapping, PreConvertOptions, PreConvertOutcome};
use crate::utils::CancelToken;
use crate::worker::WorkerPool;

/// Progress stages, reported in order of first occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Loading,
    Downloading,
    Preparing,
    Assembling,
    Converting,
    Slugs,
    Chains,
    Recombining,
    Finalizing,
    Saving,
    Done,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Loading => "loading",
            Stage::Downloading => "downloading",
            Stage::Preparing => "preparing",
            Stage::Assembling => "assembling",
            Stage::Converting => "converting",
            Stage::Slugs => "slugs",
            Stage::Chains => "chains",
            Stage::Recombining => "recombining",
            Stage::Finalizing => "finalizing",
            Stage::Saving => "saving",
            Stage::Done => "done",
        }
    }
}

/// How the scheduler combines per-chain work into output documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingStrategy {
    /// Convert everything inside the single target document.
    #[default]
    InPlace,
    /// Additionally emit one standalone PDF per layout color space through
    /// `on_chain_output`.
    SeparateChains,
    /// Convert per chain inside the single target and reassemble; the
    /// combined document is the only output.
    RecombinedChains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputBits {
    Eight,
    Sixteen,
    #[default]
    Auto,
}

impl OutputBits {
    fn as_option(self) -> Option<u8> {
        match self {
            OutputBits::Eight => Some(8),
            OutputBits::Sixteen => Some(16),
            OutputBits::Auto => None,
        }
    }
}

/// External PostScript slug renderer: receives a VFS of input resources
/// and returns a rendered PDF buffer. Out-of-process in production; the
/// core only knows this interface.
pub trait SlugRenderer {
    fn render(&self, vfs: &[(String, Vec<u8>)]) -> ConvertResult<Vec<u8>>;
}

pub struct GenerateOptions {
    pub debugging: bool,
    pub output_bits_per_component: OutputBits,
    pub use_workers: bool,
    pub processing_strategy: ProcessingStrategy,
    /// 0-based page indices to convert; `None` converts everything.
    pub page_filter: Option<Vec<usize>>,
    pub worker_count: Option<usize>,
    pub rendering_intent: RenderingIntent,
    pub black_point_compensation: bool,
    pub use_adaptive_bpc_clamping: bool,
    /// Concurrent page subsets per chain.
    pub subset_count: usize,
    /// Base URL profile paths in the manifest resolve against.
    pub base_url: String,
    pub fetch_timeout: Duration,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        GenerateOptions {
            debugging: false,
            output_bits_per_component: OutputBits::default(),
            use_workers: false,
            processing_strategy: ProcessingStrategy::default(),
            page_filter: None,
            worker_count: None,
            rendering_intent: RenderingIntent::default(),
            black_point_compensation: false,
            use_adaptive_bpc_clamping: false,
            subset_count: 2,
            base_url: String::new(),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// Caller-side observers. All optional.
#[derive(Default)]
pub struct GenerateCallbacks<'a> {
    pub on_progress: Option<&'a mut dyn FnMut(Stage, f32, &str)>,
    pub on_download_progress: Option<&'a mut dyn FnMut(&str)>,
    pub on_chain_output: Option<&'a mut dyn FnMut(&str, &[u8], &serde_json::Value)>,
    pub slug_renderer: Option<&'a dyn SlugRenderer>,
}

impl GenerateCallbacks<'_> {
    fn progress(&mut self, stage: Stage, percent: f32, message: &str) {
        if let Some(cb) = self.on_progress.as_mut() {
            cb(stage, percent, message);
        }
    }
}

#[derive(Debug)]
pub struct GenerateOutput {
    pub pdf_bytes: Vec<u8>,
    pub metadata_json: serde_json::Value,
    pub mapping: PageMapping,
    /// Measurement spans collected over the run.
    pub diagnostics: SpanTree,
}

/// Produces the press-ready PDF for one manifest.
///
/// `library_pdf` is the asset library whose pages are 1-to-1 with the
/// manifest's `assets` array; `destination_icc` is the operator-supplied
/// output profile.
#[allow(clippy::too_many_arguments)]
pub fn generate<F: AssetFetcher>(
    version: &str,
    manifest_json: &[u8],
    library_pdf: &[u8],
    destination_icc: Arc<Vec<u8>>,
    user_metadata: Option<serde_json::Value>,
    options: &GenerateOptions,
    fetcher: &CachingFetcher<F>,
    cancel: &CancelToken,
    callbacks: &mut GenerateCallbacks<'_>,
) -> ConvertResult<GenerateOutput> {
    callbacks.progress(Stage::Loading, 0.0, "parsing manifest and library");
    let manifest = Manifest::from_slice(manifest_json)?;
    let mut doc = Document::load_mem(library_pdf)?;
    callbacks.progress(Stage::Loading, 100.0, "library loaded");

    // Warm the profile cache so conversion never blocks on the network.
    callbacks.progress(Stage::Downloading, 0.0, "resolving color space profiles");
    let resolver = ProfileResolver::new(&manifest, fetcher, options.base_url.clone(), options.fetch_timeout);
    let names: Vec<String> = manifest.color_spaces.keys().cloned().collect();
    for (i, name) in names.iter().enumerate() {
        cancel.check()?;
        resolver.resolve(name)?;
        if let Some(cb) = callbacks.on_download_progress.as_mut() {
            cb(name);
        }
        callbacks.progress(
            Stage::Downloading,
            (i + 1) as f32 * 100.0 / names.len().max(1) as f32,
            name,
        );
    }

    callbacks.progress(Stage::Preparing, 0.0, "planning conversion chains");
    let pool = if options.use_workers {
        let workers = options.worker_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        });
        Some(WorkerPool::new(workers, cancel.clone()))
    } else {
        None
    };
    let mut pre_options = PreConvertOptions::new(destination_icc.clone());
    pre_options.rendering_intent = options.rendering_intent;
    pre_options.bpc_enabled = options.black_point_compensation;
    pre_options.use_adaptive_bpc_clamping = options.use_adaptive_bpc_clamping;
    pre_options.output_bits_per_component = options.output_bits_per_component.as_option();
    pre_options.use_workers = options.use_workers;
    pre_options.subset_count = options.subset_count;
    pre_options.page_filter = options.page_filter.clone();
    callbacks.progress(Stage::Preparing, 100.0, "chains planned");

    callbacks.progress(Stage::Assembling, 100.0, "asset pages staged");

    let total_tuples = count_tuples(&manifest).max(1);
    let mut converted = 0usize;
    let mut diag = SpanTree::new();
    let outcome = {
        // Counts only; converting progress is reported once the run ends.
        let mut on_page = |_page: usize| {
            converted += 1;
        };
        callbacks.progress(Stage::Converting, 0.0, "converting chains");
        match pre_convert(
            &mut doc,
            &manifest,
            &resolver,
            &pre_options,
            pool.as_ref(),
            cancel,
            &mut diag,
            &mut on_page,
        ) {
            Ok(outcome) => outcome,
            Err(e) => {
                diag.abort_open();
                return Err(e);
            }
        }
    };
    callbacks.progress(
        Stage::Converting,
        (converted.min(total_tuples) as f32) * 100.0 / total_tuples as f32,
        "chains converted",
    );
    callbacks.progress(Stage::Chains, 100.0, &chain_summary(&outcome));

    if options.processing_strategy == ProcessingStrategy::SeparateChains {
        emit_chain_outputs(
            version,
            &manifest,
            library_pdf,
            &resolver,
            &pre_options,
            pool.as_ref(),
            cancel,
            callbacks,
        )?;
    }

    render_slugs(&mut doc, manifest_json, &destination_icc, callbacks)?;

    if options.processing_strategy == ProcessingStrategy::RecombinedChains {
        callbacks.progress(Stage::Recombining, 100.0, "chain pages recombined");
    }

    callbacks.progress(Stage::Finalizing, 0.0, "stamping document metadata");
    let metadata_json = build_metadata(version, &manifest, &outcome, user_metadata.as_ref());
    stamp_document_info(&mut doc, version, user_metadata.as_ref())?;
    attach_manifest(&mut doc, manifest_json)?;
    callbacks.progress(Stage::Finalizing, 100.0, "document finalized");

    callbacks.progress(Stage::Saving, 0.0, "serializing");
    if !options.debugging {
        doc.compress();
    }
    let mut pdf_bytes = Vec::new();
    {
        let mut writer = std::io::BufWriter::new(&mut pdf_bytes);
        doc.save_to(&mut writer)
            .map_err(|e| ConvertError::InvalidArgument(format!("failed to serialize: {e}")))?;
    }
    callbacks.progress(Stage::Saving, 100.0, "serialized");
    callbacks.progress(Stage::Done, 100.0, "done");
    info!(
        "generated {} bytes over {} mapped tuples",
        pdf_bytes.len(),
        outcome.mapping.len()
    );

    Ok(GenerateOutput {
        pdf_bytes,
        metadata_json,
        mapping: outcome.mapping,
        diagnostics: diag,
    })
}

fn count_tuples(manifest: &Manifest) -> usize {
    let mut seen = HashSet::new();
    for layout in &manifest.layouts {
        for asset_ref in &layout.assets {
            if let Some(index) = manifest.asset_index(&asset_ref.asset) {
                seen.insert((index, layout.color_space.clone()));
            }
        }
    }
    seen.len()
}

fn chain_summary(outcome: &PreConvertOutcome) -> String {
    let chains: Vec<String> = outcome
        .chains
        .iter()
        .map(|c| format!("{} ({} tuples)", c.key, c.tuple_count))
        .collect();
    format!(
        "{}; {} passthrough",
        if chains.is_empty() {
            "no chains".to_string()
        } else {
            chains.join(", ")
        },
        outcome.passthrough_tuples
    )
}

/// SeparateChains: one standalone converted document per layout color
/// space, emitted through `on_chain_output`.
#[allow(clippy::too_many_arguments)]
fn emit_chain_outputs<F: AssetFetcher>(
    version: &str,
    manifest: &Manifest,
    library_pdf: &[u8],
    resolver: &ProfileResolver<'_, F>,
    pre_options: &PreConvertOptions,
    pool: Option<&WorkerPool>,
    cancel: &CancelToken,
    callbacks: &mut GenerateCallbacks<'_>,
) -> ConvertResult<()> {
    let mut layout_spaces: Vec<String> = Vec::new();
    for layout in &manifest.layouts {
        if !layout_spaces.contains(&layout.color_space) {
            layout_spaces.push(layout.color_space.clone());
        }
    }

    for (i, space) in layout_spaces.iter().enumerate() {
        cancel.check()?;
        let mut filtered = manifest.clone();
        filtered.layouts.retain(|l| &l.color_space == space);
        filtered.pages.retain(|p| &p.color_space == space);

        let mut chain_doc = Document::load_mem(library_pdf)?;
        let chain_resolver = ProfileResolver::new(
            &filtered,
            resolver.fetcher(),
            resolver.base_url().to_string(),
            resolver.timeout(),
        );
        let mut diag = SpanTree::new();
        let outcome = pre_convert(
            &mut chain_doc,
            &filtered,
            &chain_resolver,
            pre_options,
            pool,
            cancel,
            &mut diag,
            &mut |_| {},
        )?;

        let mut bytes = Vec::new();
        {
            let mut writer = std::io::BufWriter::new(&mut bytes);
            chain_doc
                .save_to(&mut writer)
                .map_err(|e| ConvertError::InvalidArgument(format!("failed to serialize: {e}")))?;
        }
        let metadata = build_metadata(version, &filtered, &outcome, None);
        if let Some(cb) = callbacks.on_chain_output.as_mut() {
            cb(space, &bytes, &metadata);
        }
        callbacks.progress(
            Stage::Chains,
            (i + 1) as f32 * 100.0 / layout_spaces.len() as f32,
            space,
        );
    }
    Ok(())
}

/// Renders the PostScript slug through the external renderer (when one is
/// attached) and appends its pages to the document.
fn render_slugs(
    doc: &mut Document,
    manifest_json: &[u8],
    destination_icc: &Arc<Vec<u8>>,
    callbacks: &mut GenerateCallbacks<'_>,
) -> ConvertResult<()> {
    let Some(renderer) = callbacks.slug_renderer else {
        callbacks.progress(Stage::Slugs, 100.0, "no slug renderer attached");
        return Ok(());
    };
    callbacks.progress(Stage::Slugs, 0.0, "rendering slugs");
    let vfs = vec![
        ("manifest.json".to_string(), manifest_json.to_vec()),
        ("destination.icc".to_string(), destination_icc.as_ref().clone()),
    ];
    let slug_pdf = renderer.render(&vfs)?;
    let slug_doc = Document::load_mem(&slug_pdf)?;
    let appended = import_pages(doc, &slug_doc)?;
    callbacks.progress(Stage::Slugs, 100.0, &format!("{appended} slug pages appended"));
    Ok(())
}

/// Imports every page of `source` into `target`, remapping object ids.
/// Returns the number of appended pages.
fn import_pages(target: &mut Document, source: &Document) -> ConvertResult<usize> {
    let offset = target.max_id;
    let remap = |id: ObjectId| -> ObjectId { (id.0 + offset, id.1) };

    for (&id, object) in &source.objects {
        let mut copied = object.clone();
        remap_references(&mut copied, offset);
        target.objects.insert(remap(id), copied);
    }
    target.max_id += source.max_id;

    let source_pages: Vec<ObjectId> = source.get_pages().into_values().map(remap).collect();

    let catalog_id = target
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(ConvertError::Pdf)?;
    let pages_root = target
        .get_object(catalog_id)?
        .as_dict()?
        .get(b"Pages")?
        .as_reference()?;
    for &page_id in &source_pages {
        let page = target.get_object_mut(page_id)?.as_dict_mut()?;
        page.set("Parent", Object::Reference(pages_root));
    }
    let pages = target.get_object_mut(pages_root)?.as_dict_mut()?;
    if let Ok(Object::Array(kids)) = pages.get_mut(b"Kids") {
        for page_id in &source_pages {
            kids.push(Object::Reference(*page_id));
        }
        let count = kids.len() as i64;
        pages.set("Count", Object::Integer(count));
    }
    Ok(source_pages.len())
}

fn remap_references(object: &mut Object, offset: u32) {
    match object {
        Object::Reference(id) => id.0 += offset,
        Object::Array(items) => {
            for item in items {
                remap_references(item, offset);
            }
        }
        Object::Dictionary(dict) => {
            for (_, value) in dict.iter_mut() {
                remap_references(value, offset);
            }
        }
        Object::Stream(stream) => {
            for (_, value) in stream.dict.iter_mut() {
                remap_references(value, offset);
            }
        }
        _ => {}
    }
}

fn pdf_date(now: OffsetDateTime) -> String {
    format!(
        "D:{:04}{:02}{:02}{:02}{:02}{:02}Z",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn stamp_document_info(
    doc: &mut Document,
    version: &str,
    user_metadata: Option<&serde_json::Value>,
) -> ConvertResult<()> {
    let title = user_metadata
        .and_then(|m| m.get("title"))
        .and_then(|t| t.as_str())
        .unwrap_or("Press characterization test forms")
        .to_string();
    let now = pdf_date(OffsetDateTime::now_utc());

    let info = Dictionary::from_iter(vec![
        ("Title", Object::String(title.into_bytes(), StringFormat::Literal)),
        (
            "Producer",
            Object::String(format!("pressform {version}").into_bytes(), StringFormat::Literal),
        ),
        (
            "Creator",
            Object::String(b"pressform".to_vec(), StringFormat::Literal),
        ),
        (
            "CreationDate",
            Object::String(now.clone().into_bytes(), StringFormat::Literal),
        ),
        ("ModDate", Object::String(now.into_bytes(), StringFormat::Literal)),
        (
            "GTS_PDFXVersion",
            Object::String(b"PDF/X-4".to_vec(), StringFormat::Literal),
        ),
        ("Trapped", Object::Name(b"False".to_vec())),
    ]);
    let info_id = doc.add_object(Object::Dictionary(info));
    doc.trailer.set("Info", Object::Reference(info_id));
    Ok(())
}

/// Attaches the original manifest bytes as an embedded file with a stable
/// name, referenced from both the EmbeddedFiles name tree and /AF.
fn attach_manifest(doc: &mut Document, manifest_json: &[u8]) -> ConvertResult<()> {
    const FILE_NAME: &[u8] = b"manifest.json";

    let mut params = Dictionary::new();
    params.set("Size", Object::Integer(manifest_json.len() as i64));
    let mut ef_dict = Dictionary::new();
    ef_dict.set("Type", Object::Name(b"EmbeddedFile".to_vec()));
    ef_dict.set("Params", Object::Dictionary(params));
    let ef_id = doc.add_object(Object::Stream(lopdf::Stream::new(
        ef_dict,
        manifest_json.to_vec(),
    )));

    let filespec = Dictionary::from_iter(vec![
        ("Type", Object::Name(b"Filespec".to_vec())),
        ("F", Object::String(FILE_NAME.to_vec(), StringFormat::Literal)),
        ("UF", Object::String(FILE_NAME.to_vec(), StringFormat::Literal)),
        ("AFRelationship", Object::Name(b"Source".to_vec())),
        (
            "Desc",
            Object::String(b"Generation manifest".to_vec(), StringFormat::Literal),
        ),
        (
            "EF",
            Object::Dictionary(Dictionary::from_iter(vec![(
                "F",
                Object::Reference(ef_id),
            )])),
        ),
    ]);
    let filespec_id = doc.add_object(Object::Dictionary(filespec));

    let names_tree = Dictionary::from_iter(vec![(
        "EmbeddedFiles",
        Object::Dictionary(Dictionary::from_iter(vec![(
            "Names",
            Object::Array(vec![
                Object::String(FILE_NAME.to_vec(), StringFormat::Literal),
                Object::Reference(filespec_id),
            ]),
        )])),
    )]);

    let catalog_id = doc
        .trailer
        .get(b"Root")
        .and_then(Object::as_reference)
        .map_err(ConvertError::Pdf)?;
    let catalog = doc.get_object_mut(catalog_id)?.as_dict_mut()?;
    catalog.set("Names", Object::Dictionary(names_tree));
    catalog.set("AF", Object::Array(vec![Object::Reference(filespec_id)]));
    debug!("manifest attached ({} bytes)", manifest_json.len());
    Ok(())
}

fn build_metadata(
    version: &str,
    manifest: &Manifest,
    outcome: &PreConvertOutcome,
    user_metadata: Option<&serde_json::Value>,
) -> serde_json::Value {
    let pages: Vec<serde_json::Value> = manifest
        .pages
        .iter()
        .map(|page| {
            let asset_pages: Vec<serde_json::Value> = manifest
                .layout(&page.layout)
                .map(|layout| {
                    layout
                        .assets
                        .iter()
                        .filter_map(|a| {
                            let index = manifest.asset_index(&a.asset)?;
                            let target = outcome.mapping.get(index, &layout.color_space)?;
                            Some(serde_json::json!({
                                "asset": a.asset,
                                "pageIndex": target,
                            }))
                        })
                        .collect()
                })
                .unwrap_or_default();
            serde_json::json!({
                "layout": page.layout,
                "colorSpace": page.color_space,
                "title": page.metadata.title,
                "variant": page.metadata.variant,
                "resolution": page.metadata.resolution.as_ref().map(|r| {
                    serde_json::json!({ "value": r.value, "unit": r.unit })
                }),
                "assetPages": asset_pages,
            })
        })
        .collect();

    let chains: Vec<serde_json::Value> = outcome
        .chains
        .iter()
        .map(|c| {
            serde_json::json!({
                "key": c.key.to_string(),
                "tuples": c.tuple_count,
                "clonedPages": c.cloned_pages,
            })
        })
        .collect();

    serde_json::json!({
        "version": version,
        "pages": pages,
        "chains": chains,
        "passthroughTuples": outcome.passthrough_tuples,
        "stats": {
            "pagesConverted": outcome.stats.pages_converted,
            "imagesConverted": outcome.stats.images_converted,
            "imagesSkipped": outcome.stats.images_skipped,
            "rewrittenOperators": outcome.stats.rewritten_ops,
        },
        "userMetadata": user_metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_match_the_documented_strings() {
        let all = [
            Stage::Loading,
            Stage::Downloading,
            Stage::Preparing,
            Stage::Assembling,
            Stage::Converting,
            Stage::Slugs,
            Stage::Chains,
            Stage::Recombining,
            Stage::Finalizing,
            Stage::Saving,
            Stage::Done,
        ];
        let names: Vec<&str> = all.iter().map(|s| s.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "loading",
                "downloading",
                "preparing",
                "assembling",
                "converting",
                "slugs",
                "chains",
                "recombining",
                "finalizing",
                "saving",
                "done"
            ]
        );
    }

    #[test]
    fn output_bits_map_to_depths() {
        assert_eq!(OutputBits::Eight.as_option(), Some(8));
        assert_eq!(OutputBits::Sixteen.as_option(), Some(16));
        assert_eq!(OutputBits::Auto.as_option(), None);
    }

    #[test]
    fn pdf_dates_are_fixed_width() {
        let date = pdf_date(OffsetDateTime::UNIX_EPOCH);
        assert_eq!(date, "D:19700101000000Z");
    }
}
